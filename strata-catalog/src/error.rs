use crate::TypeId;
use semistr::SemiStr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("empty column list")]
    EmptyColumnList,
    #[error("duplicate column name '{0}'")]
    DuplicateColumnName(SemiStr),
    #[error("column '{0}' not found")]
    ColumnNotFound(SemiStr),
    #[error("default value of column '{column}' has type {actual:?}, expected {expected:?}")]
    DefaultTypeMismatch {
        column: SemiStr,
        expected: TypeId,
        actual: TypeId,
    },
}
