use crate::layout::LayoutVersion;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("catalog error: {0}")]
    Catalog(#[from] strata_catalog::error::Error),
    #[error("block store exhausted ({0} blocks)")]
    BlockStoreExhausted(usize),
    #[error("schema version limit exceeded")]
    VersionLimitExceeded,
    #[error("schema version must be {expected}, got {actual}")]
    InvalidSchemaVersion {
        expected: LayoutVersion,
        actual: LayoutVersion,
    },
    #[error("schema version {base} is no longer current ({current})")]
    SchemaVersionConflict {
        base: LayoutVersion,
        current: LayoutVersion,
    },
    #[error("transaction must abort")]
    MustAbort,
}
