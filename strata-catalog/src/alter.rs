use crate::error::{Error, Result};
use crate::{ColOid, Column, ColumnSpec, Schema};
use semistr::SemiStr;

/// A single alter-table delta. Only column addition and removal
/// change the physical shape of a table; everything else a table
/// can be altered with is out of scope of the storage layer.
#[derive(Debug, Clone)]
pub enum AlterCmd {
    AddColumn { spec: ColumnSpec },
    DropColumn { name: SemiStr, if_exists: bool },
}

impl AlterCmd {
    #[inline]
    pub fn add_column(spec: ColumnSpec) -> Self {
        AlterCmd::AddColumn { spec }
    }

    #[inline]
    pub fn drop_column(name: &str, if_exists: bool) -> Self {
        AlterCmd::DropColumn {
            name: SemiStr::new(name),
            if_exists,
        }
    }
}

/// Derive the schema produced by applying `cmds` to `schema`, in
/// order. Added columns receive fresh oids; dropped columns retire
/// theirs. The input schema is untouched: schema values are
/// immutable once published to a table version.
pub fn apply_alter(schema: &Schema, cmds: &[AlterCmd]) -> Result<Schema> {
    let mut columns: Vec<Column> = schema.columns().to_vec();
    let mut next_oid = schema.next_col_oid();
    for cmd in cmds {
        match cmd {
            AlterCmd::AddColumn { spec } => {
                if columns.iter().any(|c| c.name() == &spec.name) {
                    return Err(Error::DuplicateColumnName(spec.name.clone()));
                }
                columns.push(Column::from_spec(ColOid::new(next_oid), spec.clone())?);
                next_oid += 1;
            }
            AlterCmd::DropColumn { name, if_exists } => {
                match columns.iter().position(|c| c.name() == name) {
                    Some(idx) => {
                        columns.remove(idx);
                    }
                    None if *if_exists => {}
                    None => return Err(Error::ColumnNotFound(name.clone())),
                }
            }
        }
    }
    Schema::from_columns(columns, next_oid)
}
