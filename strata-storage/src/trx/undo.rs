use crate::block::{Block, TupleSlot};
use crate::value::Val;
use parking_lot::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use strata_catalog::TableOid;

/// SharedUndoEntry is a reference-counted pointer to UndoEntry. The
/// transaction keeps one copy per write for commit backfill and
/// rollback; the block-level undo map keeps another as the head of
/// the row's version chain.
pub type SharedUndoEntry = Arc<UndoEntry>;

/// UndoKind records the original operation, so the undo action is
/// its opposite.
pub enum UndoKind {
    /// Insert a new row. The before-image is empty: undoing an
    /// insert removes the row, it never exposes an older version.
    ///
    /// Possible chains: Insert -> null.
    Insert,
    /// Copy of the old values of updated columns.
    ///
    /// Possible chains: Update -> null, Update -> Insert,
    /// Update -> Update.
    Update(Vec<UpdateUndo>),
    /// Delete an existing row. No values are copied: the newest
    /// version still sits in the block, only the delete mark is
    /// reverted on undo.
    ///
    /// Possible chains: Delete -> null, Delete -> Insert,
    /// Delete -> Update.
    Delete,
}

/// Before-image of one updated column, positioned by the user-column
/// index of the owning table's layout.
pub struct UpdateUndo {
    pub col: u16,
    pub old: Option<Val>,
}

pub struct UndoEntry {
    /// Uncommitted transaction id, backfilled with the commit
    /// timestamp on commit. Shared with the owning transaction so the
    /// backfill is a single atomic store.
    pub ts: Arc<AtomicU64>,
    pub table_id: TableOid,
    /// Block the modified row lives in; rollback reverts through it.
    pub block: Arc<Block>,
    pub slot: TupleSlot,
    pub kind: UndoKind,
    /// Pointer to the next older version of the row.
    pub next: Mutex<Option<SharedUndoEntry>>,
}
