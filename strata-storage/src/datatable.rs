use crate::block::{Block, BlockData, BlockId, BlockStore, TupleData, TupleSlot};
use crate::error::Result;
use crate::layout::{BlockLayout, ColId, LayoutVersion, IGNORE_COLUMN_ID, NUM_RESERVED_COLUMNS};
use crate::projection::{ProjectedColumns, ProjectedRow, Projection};
use crate::trx::undo::{SharedUndoEntry, UndoEntry, UndoKind, UpdateUndo};
use crate::trx::{TransactionContext, MIN_ACTIVE_TRX_ID};
use crate::value::Val;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use strata_catalog::{AttrSize, TableOid};

/// Attribute-size overrides for versioned reads: maps a col id of
/// the tuple's physical version to the width the reader's version
/// expects, so materialized values are truncated or zero-extended
/// on the way out.
pub type AttrSizeMap = HashMap<ColId, AttrSize>;

/// Slots per storage block.
pub const DEFAULT_BLOCK_CAPACITY: u16 = 64;

/// Position of an incremental scan: the layout version being
/// scanned plus the next block/slot to visit inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotIterator {
    pub(crate) version: LayoutVersion,
    pub(crate) block_idx: usize,
    pub(crate) offset: u16,
}

impl SlotIterator {
    /// Layout version this iterator is positioned in.
    #[inline]
    pub fn version(&self) -> LayoutVersion {
        self.version
    }
}

/// An MVCC row store bound to one BlockLayout. All tuples physically
/// written through a DataTable share its layout version; the
/// schema-versioned table above owns one DataTable per version.
pub struct DataTable {
    table_id: TableOid,
    layout: BlockLayout,
    layout_version: LayoutVersion,
    block_store: Arc<BlockStore>,
    block_capacity: u16,
    blocks: RwLock<Vec<Arc<Block>>>,
    block_map: RwLock<HashMap<BlockId, Arc<Block>>>,
}

impl DataTable {
    pub(crate) fn new(
        table_id: TableOid,
        block_store: Arc<BlockStore>,
        layout: BlockLayout,
        layout_version: LayoutVersion,
        block_capacity: u16,
    ) -> Self {
        debug_assert!(block_capacity > 0);
        DataTable {
            table_id,
            layout,
            layout_version,
            block_store,
            block_capacity,
            blocks: RwLock::new(Vec::new()),
            block_map: RwLock::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn layout_version(&self) -> LayoutVersion {
        self.layout_version
    }

    #[inline]
    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    #[inline]
    fn block(&self, id: BlockId) -> Option<Arc<Block>> {
        self.block_map.read().get(&id).cloned()
    }

    #[inline]
    fn user_idx(&self, id: ColId) -> usize {
        debug_assert!(id.0 >= NUM_RESERVED_COLUMNS && id.0 < self.layout.num_columns());
        (id.0 - NUM_RESERVED_COLUMNS) as usize
    }

    /// Materialize the version of the tuple at `off` visible to
    /// `txn`, walking the undo chain newest-first and reverting every
    /// change the transaction cannot see. `None` means not visible.
    fn visible_values(
        &self,
        txn: &TransactionContext,
        data: &BlockData,
        off: u16,
    ) -> Option<Box<[Option<Val>]>> {
        let tuple = &data.tuples[off as usize];
        let mut deleted = tuple.deleted;
        let mut values = tuple.values.clone();
        let mut chain = data.undo.get(&off).cloned();
        while let Some(entry) = chain {
            let ts = entry.ts.load(Ordering::Acquire);
            if txn.sees(ts) {
                break;
            }
            match &entry.kind {
                // undoing the insert: the row does not exist yet
                UndoKind::Insert => return None,
                UndoKind::Update(cols) => {
                    for u in cols {
                        values[u.col as usize] = u.old.clone();
                    }
                }
                UndoKind::Delete => deleted = false,
            }
            chain = entry.next.lock().clone();
        }
        if deleted {
            None
        } else {
            Some(values)
        }
    }

    /// Whether `txn` may install a new version over the current chain
    /// head: first writer wins, and a committed head must not be
    /// newer than the writer's snapshot.
    fn write_allowed(&self, txn: &TransactionContext, head: Option<&SharedUndoEntry>) -> bool {
        match head {
            None => true,
            Some(entry) => {
                let ts = entry.ts.load(Ordering::Acquire);
                if ts >= MIN_ACTIVE_TRX_ID {
                    ts == txn.trx_id()
                } else {
                    ts <= txn.sts()
                }
            }
        }
    }

    fn push_undo(
        &self,
        txn: &TransactionContext,
        data: &mut BlockData,
        block: &Arc<Block>,
        slot: TupleSlot,
        kind: UndoKind,
    ) {
        let next = data.undo.get(&slot.offset()).cloned();
        let entry = Arc::new(UndoEntry {
            ts: txn.shared_trx_id(),
            table_id: self.table_id,
            block: Arc::clone(block),
            slot,
            kind,
            next: Mutex::new(next),
        });
        data.undo.insert(slot.offset(), Arc::clone(&entry));
        txn.record_undo(entry);
    }

    /// Read one tuple into `out`, whose header is expressed in this
    /// table's col ids (entries already rewritten to
    /// `IGNORE_COLUMN_ID` stay null). Returns whether the tuple is
    /// visible to `txn`.
    pub fn select(
        &self,
        txn: &TransactionContext,
        slot: TupleSlot,
        out: &mut ProjectedRow,
        size_overrides: &AttrSizeMap,
    ) -> bool {
        let block = match self.block(slot.block()) {
            Some(block) => block,
            None => return false,
        };
        let data = block.data();
        if slot.offset() as usize >= data.tuples.len() {
            return false;
        }
        let values = match self.visible_values(txn, &data, slot.offset()) {
            Some(values) => values,
            None => return false,
        };
        for i in 0..out.num_columns() {
            let id = out.col_id(i);
            if id == IGNORE_COLUMN_ID {
                out.set_null(i);
                continue;
            }
            match &values[self.user_idx(id)] {
                None => out.set_null(i),
                Some(v) => {
                    let v = match size_overrides.get(&id) {
                        Some(&target) => v.clone().coerce(target),
                        None => v.clone(),
                    };
                    out.set(i, v);
                }
            }
        }
        true
    }

    /// Insert the after-image `delta` as a fresh tuple. Columns not
    /// named by the delta are null.
    pub fn insert(&self, txn: &TransactionContext, delta: &ProjectedRow) -> Result<TupleSlot> {
        loop {
            let block = self.blocks.read().last().cloned();
            if let Some(block) = block {
                let mut data = block.data();
                if data.tuples.len() < self.block_capacity as usize {
                    return Ok(self.insert_into(txn, &block, &mut data, delta));
                }
            }
            self.grow()?;
        }
    }

    fn insert_into(
        &self,
        txn: &TransactionContext,
        block: &Arc<Block>,
        data: &mut BlockData,
        delta: &ProjectedRow,
    ) -> TupleSlot {
        let off = data.tuples.len() as u16;
        let mut values =
            vec![None; self.layout.num_user_columns() as usize].into_boxed_slice();
        for i in 0..delta.num_columns() {
            let id = delta.col_id(i);
            debug_assert!(id != IGNORE_COLUMN_ID);
            values[self.user_idx(id)] = delta
                .get(i)
                .cloned()
                .map(|v| v.coerce(self.layout.attr_size(id)));
        }
        data.tuples.push(TupleData {
            deleted: false,
            values,
        });
        let slot = TupleSlot::new(block.id(), off);
        // fresh slot, no older version to chain behind
        debug_assert!(!data.undo.contains_key(&off));
        self.push_undo(txn, data, block, slot, UndoKind::Insert);
        slot
    }

    fn grow(&self) -> Result<()> {
        let mut blocks = self.blocks.write();
        if let Some(last) = blocks.last() {
            if last.data().tuples.len() < self.block_capacity as usize {
                // another thread grew the table first
                return Ok(());
            }
        }
        let id = self.block_store.allocate(self.layout_version)?;
        let block = Arc::new(Block::new(id, self.layout_version));
        self.block_map.write().insert(id, Arc::clone(&block));
        blocks.push(block);
        Ok(())
    }

    /// Apply the after-image `delta` (header in this table's col ids)
    /// to the tuple at `slot`. Returns false on a write-write
    /// conflict or if the row is gone.
    pub fn update(&self, txn: &TransactionContext, slot: TupleSlot, delta: &ProjectedRow) -> bool {
        let block = match self.block(slot.block()) {
            Some(block) => block,
            None => return false,
        };
        let mut data = block.data();
        if slot.offset() as usize >= data.tuples.len() {
            return false;
        }
        if !self.write_allowed(txn, data.undo.get(&slot.offset())) {
            return false;
        }
        if data.tuples[slot.offset() as usize].deleted {
            return false;
        }
        let mut before = Vec::with_capacity(delta.num_columns());
        {
            let tuple = &mut data.tuples[slot.offset() as usize];
            for i in 0..delta.num_columns() {
                let id = delta.col_id(i);
                debug_assert!(id != IGNORE_COLUMN_ID);
                let user = self.user_idx(id);
                before.push(UpdateUndo {
                    col: user as u16,
                    old: tuple.values[user].clone(),
                });
                tuple.values[user] = delta
                    .get(i)
                    .cloned()
                    .map(|v| v.coerce(self.layout.attr_size(id)));
            }
        }
        self.push_undo(txn, &mut data, &block, slot, UndoKind::Update(before));
        true
    }

    /// Mark the tuple at `slot` deleted. Returns false on a
    /// write-write conflict or if the row is already gone.
    pub fn delete(&self, txn: &TransactionContext, slot: TupleSlot) -> bool {
        let block = match self.block(slot.block()) {
            Some(block) => block,
            None => return false,
        };
        let mut data = block.data();
        if slot.offset() as usize >= data.tuples.len() {
            return false;
        }
        if !self.write_allowed(txn, data.undo.get(&slot.offset())) {
            return false;
        }
        if data.tuples[slot.offset() as usize].deleted {
            return false;
        }
        data.tuples[slot.offset() as usize].deleted = true;
        self.push_undo(txn, &mut data, &block, slot, UndoKind::Delete);
        true
    }

    /// Append visible tuples to `out` starting at its current fill
    /// offset, advancing `iter` past every slot visited. Returns when
    /// the buffer is full or the table is exhausted.
    pub fn scan(
        &self,
        txn: &TransactionContext,
        iter: &mut SlotIterator,
        out: &mut ProjectedColumns,
        size_overrides: &AttrSizeMap,
    ) {
        debug_assert_eq!(iter.version, self.layout_version);
        loop {
            if out.is_full() {
                return;
            }
            let block = self.blocks.read().get(iter.block_idx).cloned();
            let block = match block {
                Some(block) => block,
                None => return, // exhausted
            };
            let data = block.data();
            let num_slots = data.tuples.len() as u16;
            while iter.offset < num_slots {
                let off = iter.offset;
                iter.offset += 1;
                if let Some(values) = self.visible_values(txn, &data, off) {
                    let row: Vec<Option<Val>> = out
                        .col_ids()
                        .iter()
                        .map(|&id| {
                            if id == IGNORE_COLUMN_ID {
                                return None;
                            }
                            values[self.user_idx(id)].clone().map(|v| {
                                match size_overrides.get(&id) {
                                    Some(&target) => v.coerce(target),
                                    None => v,
                                }
                            })
                        })
                        .collect();
                    out.append_row(TupleSlot::new(block.id(), off), row);
                    if out.is_full() {
                        return;
                    }
                }
            }
            iter.block_idx += 1;
            iter.offset = 0;
        }
    }

    /// Iterator at the first slot of this table.
    #[inline]
    pub fn begin(&self) -> SlotIterator {
        SlotIterator {
            version: self.layout_version,
            block_idx: 0,
            offset: 0,
        }
    }

    /// Iterator one past the last slot of this table, as of now.
    #[inline]
    pub fn end(&self) -> SlotIterator {
        SlotIterator {
            version: self.layout_version,
            block_idx: self.blocks.read().len(),
            offset: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::build_layout;
    use crate::projection::ProjectedRowInitializer;
    use crate::trx::TransactionManager;
    use strata_catalog::{ColumnSpec, Schema, TypeId};

    fn test_table() -> (TransactionManager, DataTable, ProjectedRowInitializer) {
        let schema = Schema::new(vec![
            ColumnSpec::new("a", TypeId::Int, false),
            ColumnSpec::new("b", TypeId::Int, false),
        ])
        .unwrap();
        let built = build_layout(&schema);
        let ids: Vec<ColId> = schema
            .col_oids()
            .iter()
            .map(|oid| built.oid_to_id[oid])
            .collect();
        let init = ProjectedRowInitializer::new(&built.layout, ids);
        let table = DataTable::new(
            TableOid::new(1),
            Arc::new(BlockStore::new(100)),
            built.layout,
            LayoutVersion::ZERO,
            4,
        );
        (TransactionManager::new(), table, init)
    }

    fn row(init: &ProjectedRowInitializer, a: i32, b: i32) -> ProjectedRow {
        let mut row = init.project_row();
        row.set(0, Val::from(a));
        row.set(1, Val::from(b));
        row
    }

    #[test]
    fn test_insert_visible_to_self() {
        let (mgr, table, init) = test_table();
        let txn = mgr.begin();
        let slot = table.insert(&txn, &row(&init, 1, 2)).unwrap();
        let mut out = init.project_row();
        assert!(table.select(&txn, slot, &mut out, &AttrSizeMap::new()));
        assert_eq!(out.get(0), Some(&Val::Byte4(1)));
        assert_eq!(out.get(1), Some(&Val::Byte4(2)));
    }

    #[test]
    fn test_uncommitted_insert_invisible_to_others() {
        let (mgr, table, init) = test_table();
        let writer = mgr.begin();
        let reader = mgr.begin();
        let slot = table.insert(&writer, &row(&init, 1, 2)).unwrap();
        let mut out = init.project_row();
        assert!(!table.select(&reader, slot, &mut out, &AttrSizeMap::new()));
        // after commit, a reader that began later sees the row
        mgr.commit(writer).unwrap();
        let late_reader = mgr.begin();
        assert!(table.select(&late_reader, slot, &mut out, &AttrSizeMap::new()));
        // the old reader's snapshot still predates the commit
        assert!(!table.select(&reader, slot, &mut out, &AttrSizeMap::new()));
    }

    #[test]
    fn test_update_in_place_and_snapshot_read() {
        let (mgr, table, init) = test_table();
        let t1 = mgr.begin();
        let slot = table.insert(&t1, &row(&init, 1, 2)).unwrap();
        mgr.commit(t1).unwrap();

        let old_reader = mgr.begin();
        let t2 = mgr.begin();
        let mut delta = init.project_row();
        delta.set(0, Val::from(10i32));
        delta.set(1, Val::from(20i32));
        assert!(table.update(&t2, slot, &delta));
        mgr.commit(t2).unwrap();

        // the reader that began before the update sees the old image
        let mut out = init.project_row();
        assert!(table.select(&old_reader, slot, &mut out, &AttrSizeMap::new()));
        assert_eq!(out.get(0), Some(&Val::Byte4(1)));
        assert_eq!(out.get(1), Some(&Val::Byte4(2)));
        // a fresh reader sees the new image
        let new_reader = mgr.begin();
        assert!(table.select(&new_reader, slot, &mut out, &AttrSizeMap::new()));
        assert_eq!(out.get(0), Some(&Val::Byte4(10)));
    }

    #[test]
    fn test_write_write_conflict() {
        let (mgr, table, init) = test_table();
        let t1 = mgr.begin();
        let slot = table.insert(&t1, &row(&init, 1, 2)).unwrap();
        mgr.commit(t1).unwrap();

        let t2 = mgr.begin();
        let t3 = mgr.begin();
        let mut delta = init.project_row();
        delta.set(0, Val::from(10i32));
        assert!(table.update(&t2, slot, &delta));
        // t3 observes t2's uncommitted head and loses
        assert!(!table.update(&t3, slot, &delta));
        assert!(!table.delete(&t3, slot));
        mgr.commit(t2).unwrap();
        // t3's snapshot predates t2's commit, still a conflict
        assert!(!table.update(&t3, slot, &delta));
    }

    #[test]
    fn test_delete_hides_row() {
        let (mgr, table, init) = test_table();
        let t1 = mgr.begin();
        let slot = table.insert(&t1, &row(&init, 1, 2)).unwrap();
        mgr.commit(t1).unwrap();

        let t2 = mgr.begin();
        assert!(table.delete(&t2, slot));
        // deleting twice in the same transaction fails
        assert!(!table.delete(&t2, slot));
        mgr.commit(t2).unwrap();

        let reader = mgr.begin();
        let mut out = init.project_row();
        assert!(!table.select(&reader, slot, &mut out, &AttrSizeMap::new()));
    }

    #[test]
    fn test_rollback_restores_chain() {
        let (mgr, table, init) = test_table();
        let t1 = mgr.begin();
        let slot = table.insert(&t1, &row(&init, 1, 2)).unwrap();
        mgr.commit(t1).unwrap();

        let t2 = mgr.begin();
        let mut delta = init.project_row();
        delta.set(0, Val::from(99i32));
        assert!(table.update(&t2, slot, &delta));
        assert!(table.delete(&t2, slot));
        mgr.rollback(t2);

        let reader = mgr.begin();
        let mut out = init.project_row();
        assert!(table.select(&reader, slot, &mut out, &AttrSizeMap::new()));
        assert_eq!(out.get(0), Some(&Val::Byte4(1)));
        // the chain head is the original insert again, so new writes
        // succeed
        let t3 = mgr.begin();
        assert!(table.update(&t3, slot, &delta));
    }

    #[test]
    fn test_rollback_insert_removes_row() {
        let (mgr, table, init) = test_table();
        let t1 = mgr.begin();
        let slot = table.insert(&t1, &row(&init, 1, 2)).unwrap();
        mgr.rollback(t1);
        let reader = mgr.begin();
        let mut out = init.project_row();
        assert!(!table.select(&reader, slot, &mut out, &AttrSizeMap::new()));
    }

    #[test]
    fn test_scan_spans_blocks() {
        let (mgr, table, init) = test_table();
        let t1 = mgr.begin();
        // capacity 4 per block, 10 rows => 3 blocks
        for i in 0..10 {
            table.insert(&t1, &row(&init, i, i * 2)).unwrap();
        }
        mgr.commit(t1).unwrap();

        let reader = mgr.begin();
        let built = {
            // rebuild a columns initializer over the same layout
            let schema = Schema::new(vec![
                ColumnSpec::new("a", TypeId::Int, false),
                ColumnSpec::new("b", TypeId::Int, false),
            ])
            .unwrap();
            build_layout(&schema)
        };
        let ids: Vec<ColId> = built.id_to_oid.keys().copied().collect();
        let cinit = crate::projection::ProjectedColumnsInitializer::new(&built.layout, ids, 4);
        let mut out = cinit.project_columns();
        let mut iter = table.begin();
        let mut seen = 0;
        loop {
            out.reset();
            table.scan(&reader, &mut iter, &mut out, &AttrSizeMap::new());
            if out.num_tuples() == 0 {
                break;
            }
            seen += out.num_tuples();
        }
        assert_eq!(seen, 10);
        assert_eq!(iter, table.end());
    }

    #[test]
    fn test_scan_skips_invisible() {
        let (mgr, table, init) = test_table();
        let t1 = mgr.begin();
        table.insert(&t1, &row(&init, 1, 1)).unwrap();
        mgr.commit(t1).unwrap();
        let reader = mgr.begin();
        // a later uncommitted insert must not appear
        let t2 = mgr.begin();
        table.insert(&t2, &row(&init, 2, 2)).unwrap();

        let built = build_layout(
            &Schema::new(vec![
                ColumnSpec::new("a", TypeId::Int, false),
                ColumnSpec::new("b", TypeId::Int, false),
            ])
            .unwrap(),
        );
        let ids: Vec<ColId> = built.id_to_oid.keys().copied().collect();
        let cinit = crate::projection::ProjectedColumnsInitializer::new(&built.layout, ids, 10);
        let mut out = cinit.project_columns();
        let mut iter = table.begin();
        table.scan(&reader, &mut iter, &mut out, &AttrSizeMap::new());
        assert_eq!(out.num_tuples(), 1);
        assert_eq!(out.row_view(0).get(0), Some(&Val::Byte4(1)));
    }
}
