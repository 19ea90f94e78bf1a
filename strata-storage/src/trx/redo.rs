use crate::block::TupleSlot;
use crate::layout::{ColId, LayoutVersion};
use crate::projection::ProjectedRow;
use crate::trx::TrxID;
use crate::value::Val;
use serde::{Deserialize, Serialize};
use strata_catalog::TableOid;

/// After-image of one column in a redo entry. Column ids are
/// interpreted under the entry's tagged layout version.
pub type RedoCol = (ColId, Option<Val>);

#[derive(Debug, Serialize, Deserialize)]
pub enum RedoKind {
    Insert(Vec<RedoCol>),
    Update(Vec<RedoCol>),
    Delete,
}

/// One persisted change. Every entry carries the layout version its
/// column ids are expressed in, so a cross-version migrate-update
/// never leaves a log consumer guessing which namespace the delta
/// uses.
#[derive(Debug, Serialize, Deserialize)]
pub struct RedoEntry {
    pub table_id: u32,
    pub layout_version: LayoutVersion,
    pub slot: TupleSlot,
    pub kind: RedoKind,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RedoLog {
    pub cts: TrxID,
    pub entries: Vec<RedoEntry>,
}

/// RedoBin is serialized redo log in binary format.
pub type RedoBin = Vec<u8>;

/// Abstraction of redo logger.
/// It's responsible to persist redo logs and wait until persisted.
pub trait RedoLogger: Send {
    /// Write redo binary logs to disk.
    fn write(&mut self, cts: TrxID, redo_bin: RedoBin);

    /// Wait for previously written logs to be persisted.
    fn sync(&mut self);
}

/// Handle to a record staged in a transaction's redo buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedoHandle(pub(crate) usize);

/// What actually happened to a staged write, filled in by the table
/// operation that consumed it.
#[derive(Debug, Clone, Copy)]
pub(crate) enum WriteOp {
    /// Staged but not yet executed. Pending records are skipped at
    /// commit serialization.
    Pending,
    Insert,
    Update,
    /// Cross-version migrate-update: the record's delta was rewritten
    /// into the full after-image under the new version, and the old
    /// slot must be logged as deleted.
    MigrateInsert {
        old_slot: TupleSlot,
        old_version: LayoutVersion,
    },
}

/// A write staged ahead of the table call that performs it. The delta
/// is the after-image of the touched columns, expressed in
/// `layout_version`'s column ids.
pub struct WriteRecord {
    pub table_id: TableOid,
    pub layout_version: LayoutVersion,
    pub slot: Option<TupleSlot>,
    pub delta: ProjectedRow,
    pub(crate) op: WriteOp,
}

pub struct DeleteRecord {
    pub table_id: TableOid,
    pub slot: TupleSlot,
    /// Version of the DataTable the slot belongs to, backfilled by
    /// the delete that consumes this record.
    pub layout_version: LayoutVersion,
}

pub enum StagedRecord {
    Write(WriteRecord),
    Delete(DeleteRecord),
}

impl StagedRecord {
    pub(crate) fn as_write_mut(&mut self) -> &mut WriteRecord {
        match self {
            StagedRecord::Write(rec) => rec,
            StagedRecord::Delete(_) => panic!("staged record is not a write"),
        }
    }
}

#[inline]
fn delta_cols(delta: &ProjectedRow) -> Vec<RedoCol> {
    (0..delta.num_columns())
        .map(|i| (delta.col_id(i), delta.get(i).cloned()))
        .collect()
}

/// Turn the staged records of a committing transaction into log
/// entries. Returns `None` when the transaction wrote nothing.
pub(crate) fn build_redo_entries(staged: &[StagedRecord]) -> Option<Vec<RedoEntry>> {
    let mut entries = Vec::with_capacity(staged.len());
    for rec in staged {
        match rec {
            StagedRecord::Write(w) => {
                let slot = match w.slot {
                    Some(slot) => slot,
                    None => {
                        debug_assert!(matches!(w.op, WriteOp::Pending));
                        continue;
                    }
                };
                match w.op {
                    WriteOp::Pending => continue,
                    WriteOp::Insert => entries.push(RedoEntry {
                        table_id: w.table_id.value(),
                        layout_version: w.layout_version,
                        slot,
                        kind: RedoKind::Insert(delta_cols(&w.delta)),
                    }),
                    WriteOp::Update => entries.push(RedoEntry {
                        table_id: w.table_id.value(),
                        layout_version: w.layout_version,
                        slot,
                        kind: RedoKind::Update(delta_cols(&w.delta)),
                    }),
                    WriteOp::MigrateInsert {
                        old_slot,
                        old_version,
                    } => {
                        entries.push(RedoEntry {
                            table_id: w.table_id.value(),
                            layout_version: old_version,
                            slot: old_slot,
                            kind: RedoKind::Delete,
                        });
                        entries.push(RedoEntry {
                            table_id: w.table_id.value(),
                            layout_version: w.layout_version,
                            slot,
                            kind: RedoKind::Insert(delta_cols(&w.delta)),
                        });
                    }
                }
            }
            StagedRecord::Delete(d) => entries.push(RedoEntry {
                table_id: d.table_id.value(),
                layout_version: d.layout_version,
                slot: d.slot,
                kind: RedoKind::Delete,
            }),
        }
    }
    if entries.is_empty() {
        None
    } else {
        Some(entries)
    }
}
