pub(crate) mod translate;

use crate::block::{BlockStore, TupleSlot};
use crate::datatable::{AttrSizeMap, DataTable, SlotIterator, DEFAULT_BLOCK_CAPACITY};
use crate::error::{Error, Result};
use crate::layout::{
    build_layout, BlockLayout, ColId, LayoutVersion, MAX_NUM_VERSIONS,
};
use crate::projection::{
    ProjectedColumns, ProjectedColumnsInitializer, ProjectedRow, ProjectedRowInitializer,
    ProjectionMap,
};
use crate::table::translate::align_to_version;
use crate::trx::redo::{RedoHandle, StagedRecord, WriteOp};
use crate::trx::TransactionContext;
use crate::value::Val;
use crossbeam_utils::CachePadded;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use strata_catalog::{ColOid, Schema, TableOid};
use tracing::{debug, trace};

/// Everything the versioned table needs to address one physical
/// generation of itself. Installed once per version and never
/// mutated.
pub(crate) struct DataTableVersion {
    pub(crate) data_table: DataTable,
    pub(crate) layout: BlockLayout,
    pub(crate) oid_to_id: HashMap<ColOid, ColId>,
    pub(crate) id_to_oid: HashMap<ColId, ColOid>,
    pub(crate) schema: Arc<Schema>,
    pub(crate) defaults: HashMap<ColOid, Val>,
}

/// A SqlTable is one logical table presented over one DataTable per
/// schema version. Callers speak col oids and schemas; this layer
/// performs the translation to col ids and block layouts, routes
/// every read and write to the DataTable matching the tuple's
/// physical version, and reconciles what old tuples look like under
/// newer schemas.
pub struct SqlTable {
    table_id: TableOid,
    block_store: Arc<BlockStore>,
    block_capacity: u16,
    /// Version registry: append-only slots indexed by layout version,
    /// installed under the catalog's single-writer DDL discipline and
    /// read without locks.
    tables: Box<[OnceCell<DataTableVersion>]>,
    num_versions: CachePadded<AtomicUsize>,
}

impl SqlTable {
    /// Create a table whose version 0 stores tuples of `schema`.
    pub fn new(table_id: TableOid, block_store: Arc<BlockStore>, schema: Schema) -> Result<Self> {
        let table = SqlTable {
            table_id,
            block_store,
            block_capacity: DEFAULT_BLOCK_CAPACITY,
            tables: (0..MAX_NUM_VERSIONS).map(|_| OnceCell::new()).collect(),
            num_versions: CachePadded::new(AtomicUsize::new(0)),
        };
        table.register(schema, LayoutVersion::ZERO)?;
        Ok(table)
    }

    #[inline]
    pub fn table_id(&self) -> TableOid {
        self.table_id
    }

    #[inline]
    pub fn num_versions(&self) -> usize {
        self.num_versions.load(Ordering::Acquire)
    }

    #[inline]
    pub fn latest_version(&self) -> LayoutVersion {
        let count = self.num_versions();
        debug_assert!(count > 0);
        LayoutVersion((count - 1) as u8)
    }

    #[inline]
    pub(crate) fn version(&self, layout_version: LayoutVersion) -> &DataTableVersion {
        assert!(
            layout_version.index() < self.num_versions(),
            "layout version {} does not exist",
            layout_version
        );
        self.tables[layout_version.index()]
            .get()
            .expect("registered layout version must be installed")
    }

    /// Install a new schema version. Serialized externally by the
    /// catalog's version-pointer latch; the counter only arbitrates
    /// the registry ceiling.
    fn register(&self, schema: Schema, layout_version: LayoutVersion) -> Result<()> {
        let count = self.num_versions.fetch_add(1, Ordering::SeqCst);
        if count >= MAX_NUM_VERSIONS {
            // clamp; the burned counter slot is never reclaimed
            self.num_versions.store(MAX_NUM_VERSIONS, Ordering::SeqCst);
            return Err(Error::VersionLimitExceeded);
        }
        assert_eq!(
            count,
            layout_version.index(),
            "schema versions must be registered contiguously"
        );
        let built = build_layout(&schema);
        let data_table = DataTable::new(
            self.table_id,
            Arc::clone(&self.block_store),
            built.layout.clone(),
            layout_version,
            self.block_capacity,
        );
        let installed = self.tables[layout_version.index()].set(DataTableVersion {
            data_table,
            layout: built.layout,
            oid_to_id: built.oid_to_id,
            id_to_oid: built.id_to_oid,
            schema: Arc::new(schema),
            defaults: built.defaults,
        });
        debug_assert!(installed.is_ok());
        debug!(table = %self.table_id, version = %layout_version, "schema version registered");
        Ok(())
    }

    /// Create a new table version for `schema` at `layout_version`,
    /// which must be the next unused version. Tuples written under
    /// older versions remain physically unchanged; reads at versions
    /// at or above this one will see the new columns.
    pub fn update_schema(
        &self,
        _txn: &TransactionContext,
        schema: Schema,
        layout_version: LayoutVersion,
    ) -> Result<()> {
        let count = self.num_versions();
        if layout_version.index() != count {
            return Err(Error::InvalidSchemaVersion {
                expected: LayoutVersion(count as u8),
                actual: layout_version,
            });
        }
        self.register(schema, layout_version)
    }

    /// Materialize the tuple at `slot` into `out` as it looks under
    /// `layout_version`, whatever version it was physically written
    /// under. Columns the tuple's version never stored read as their
    /// earliest later default, or null. Returns MVCC visibility.
    pub fn select(
        &self,
        txn: &TransactionContext,
        slot: TupleSlot,
        out: &mut ProjectedRow,
        layout_version: LayoutVersion,
    ) -> bool {
        let tuple_version = self.block_store.layout_version(slot.block());
        assert!(
            tuple_version <= layout_version,
            "tuple version {} must not exceed the reading version {}",
            tuple_version,
            layout_version
        );
        let desired = self.version(layout_version);
        if tuple_version == layout_version {
            return desired
                .data_table
                .select(txn, slot, out, &AttrSizeMap::new());
        }
        let tuple_v = self.version(tuple_version);
        let (mut guard, align) = align_to_version(out, tuple_v, desired);
        let visible = tuple_v
            .data_table
            .select(txn, slot, &mut guard, &align.size_overrides);
        drop(guard);
        if visible {
            for &(idx, oid) in align.missing.iter() {
                if let Some(val) = self.first_default(oid, tuple_version, layout_version) {
                    let val = val.clone().coerce(out.attr_size(idx));
                    out.set(idx, val);
                }
            }
        }
        visible
    }

    /// Insert the staged after-image under `layout_version` and write
    /// the allocated slot back into the redo record. Inserts never
    /// target an older version.
    pub fn insert(
        &self,
        txn: &TransactionContext,
        redo: RedoHandle,
        layout_version: LayoutVersion,
    ) -> Result<TupleSlot> {
        let desired = self.version(layout_version);
        let mut staged = txn.staged();
        debug_assert_eq!(redo.0, staged.len() - 1, "redo must be the most recent staged record");
        let rec = staged[redo.0].as_write_mut();
        assert!(rec.slot.is_none(), "insert redo must not carry a slot");
        debug_assert_eq!(rec.layout_version, layout_version);
        let slot = desired.data_table.insert(txn, &rec.delta)?;
        rec.slot = Some(slot);
        rec.op = WriteOp::Insert;
        Ok(slot)
    }

    /// Apply the staged delta to its slot. A tuple living in an older
    /// version is updated in place when every touched column exists
    /// there; otherwise it migrates: the full row is materialized
    /// under `layout_version`, the old slot is deleted, and the
    /// updated row is re-inserted into `layout_version`'s DataTable.
    ///
    /// Returns the slot holding the updated tuple (a new one after
    /// migration), or `None` on failure with the transaction marked
    /// abort-mandatory.
    pub fn update(
        &self,
        txn: &TransactionContext,
        redo: RedoHandle,
        layout_version: LayoutVersion,
    ) -> Option<TupleSlot> {
        let desired = self.version(layout_version);
        let mut staged = txn.staged();
        debug_assert_eq!(redo.0, staged.len() - 1, "redo must be the most recent staged record");
        let rec = staged[redo.0].as_write_mut();
        let slot = rec.slot.expect("update redo must carry the target slot");
        let tuple_version = self.block_store.layout_version(slot.block());
        assert!(
            tuple_version <= layout_version,
            "tuple version {} must not exceed the updating version {}",
            tuple_version,
            layout_version
        );

        if tuple_version == layout_version {
            if !desired.data_table.update(txn, slot, &rec.delta) {
                txn.set_must_abort();
                return None;
            }
            rec.op = WriteOp::Update;
            return Some(slot);
        }

        let tuple_v = self.version(tuple_version);
        let (guard, align) = align_to_version(&mut rec.delta, tuple_v, desired);
        if align.missing.is_empty() {
            // every touched column exists in the tuple's version:
            // update in place through the translated delta
            let ok = tuple_v.data_table.update(txn, slot, &guard);
            drop(guard);
            if !ok {
                txn.set_must_abort();
                return None;
            }
            rec.op = WriteOp::Update;
            return Some(slot);
        }
        drop(guard); // migrate consumes the delta in the desired version's ids

        // materialize the full row under the desired version,
        // defaults included
        let oids = desired.schema.col_oids();
        let ids = oids.iter().map(|oid| desired.oid_to_id[oid]).collect();
        let init = ProjectedRowInitializer::new(&desired.layout, ids);
        let mut buf = init.project_row();
        if !self.select(txn, slot, &mut buf, layout_version) {
            txn.set_must_abort();
            return None;
        }
        if !tuple_v.data_table.delete(txn, slot) {
            txn.set_must_abort();
            return None;
        }
        for i in 0..rec.delta.num_columns() {
            let id = rec.delta.col_id(i);
            let idx = buf
                .index_of(id)
                .expect("updated column must exist in the full projection");
            match rec.delta.get(i) {
                Some(v) => buf.set(idx, v.clone()),
                None => buf.set_null(idx),
            }
        }
        let new_slot = match desired.data_table.insert(txn, &buf) {
            Ok(new_slot) => new_slot,
            Err(_) => {
                txn.set_must_abort();
                return None;
            }
        };
        trace!(
            table = %self.table_id,
            from = %tuple_version,
            to = %layout_version,
            "cross-version update migrated tuple"
        );
        // the record now logs a delete of the old slot plus the full
        // after-image under the new version
        rec.slot = Some(new_slot);
        rec.delta = buf;
        rec.op = WriteOp::MigrateInsert {
            old_slot: slot,
            old_version: tuple_version,
        };
        Some(new_slot)
    }

    /// Delete the tuple at `slot`, always addressed to the version
    /// that physically stores it. `stage_delete` must have been
    /// called immediately before.
    pub fn delete(&self, txn: &TransactionContext, slot: TupleSlot) -> bool {
        let tuple_version = self.block_store.layout_version(slot.block());
        {
            let mut staged = txn.staged();
            match staged.last_mut() {
                Some(StagedRecord::Delete(rec)) => {
                    debug_assert_eq!(rec.slot, slot, "staged delete must target this slot");
                    rec.layout_version = tuple_version;
                }
                _ => panic!("stage_delete must be called immediately before delete"),
            }
        }
        let ok = self.version(tuple_version).data_table.delete(txn, slot);
        if !ok {
            txn.set_must_abort();
        }
        ok
    }

    /// Scan all versions from the iterator's position up to
    /// `layout_version`, materializing as many visible tuples as fit
    /// into `out` (cleared first). Tuples come back in version-
    /// ascending, then DataTable-native order; the iterator is left
    /// one past the last slot visited.
    pub fn scan(
        &self,
        txn: &TransactionContext,
        iter: &mut SlotIterator,
        out: &mut ProjectedColumns,
        layout_version: LayoutVersion,
    ) {
        out.reset();
        loop {
            let tuple_version = iter.version();
            assert!(
                tuple_version <= layout_version,
                "iterator version {} must not exceed the scanning version {}",
                tuple_version,
                layout_version
            );
            let tuple_v = self.version(tuple_version);
            let start = out.num_tuples();
            if tuple_version == layout_version {
                tuple_v.data_table.scan(txn, iter, out, &AttrSizeMap::new());
            } else {
                let desired = self.version(layout_version);
                let (mut guard, align) = align_to_version(out, tuple_v, desired);
                tuple_v
                    .data_table
                    .scan(txn, iter, &mut guard, &align.size_overrides);
                drop(guard);
                if !align.missing.is_empty() {
                    for row in start..out.num_tuples() {
                        for &(idx, oid) in align.missing.iter() {
                            if let Some(val) =
                                self.first_default(oid, tuple_version, layout_version)
                            {
                                let val = val.clone().coerce(out.attr_size(idx));
                                out.set(idx, row, Some(val));
                            }
                        }
                    }
                }
            }
            if out.is_full() || iter.version() == layout_version {
                return;
            }
            *iter = self.version(tuple_version.next()).data_table.begin();
        }
    }

    /// First slot of the oldest version's DataTable.
    pub fn begin(&self) -> SlotIterator {
        self.version(LayoutVersion::ZERO).data_table.begin()
    }

    /// One past the last slot of `layout_version`'s DataTable.
    pub fn end(&self, layout_version: LayoutVersion) -> SlotIterator {
        self.version(layout_version).data_table.end()
    }

    /// Earliest version strictly after `tuple_version` and at most
    /// `layout_version` that carries a default for `oid`. An ADD
    /// COLUMN with a default is the moment the column gains meaning;
    /// older tuples read that default retroactively.
    fn first_default(
        &self,
        oid: ColOid,
        tuple_version: LayoutVersion,
        layout_version: LayoutVersion,
    ) -> Option<&Val> {
        for v in (tuple_version.index() + 1)..=layout_version.index() {
            if let Some(val) = self.version(LayoutVersion(v as u8)).defaults.get(&oid) {
                return Some(val);
            }
        }
        None
    }

    fn col_ids_for_oids(&self, col_oids: &[ColOid], layout_version: LayoutVersion) -> Vec<ColId> {
        assert!(!col_oids.is_empty(), "projection must name at least one column");
        let version = self.version(layout_version);
        let mut ids = Vec::with_capacity(col_oids.len());
        for oid in col_oids {
            let id = *version
                .oid_to_id
                .get(oid)
                .expect("col oid does not exist in this schema version");
            ids.push(id);
        }
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert!(
            sorted.windows(2).all(|w| w[0] != w[1]),
            "duplicate col oids in projection"
        );
        ids
    }

    /// Initializer for single-row buffers projecting `col_oids` under
    /// `layout_version`'s physical layout. Duplicate oids and oids
    /// absent from the version are caller bugs.
    pub fn initializer_for_projected_row(
        &self,
        col_oids: &[ColOid],
        layout_version: LayoutVersion,
    ) -> ProjectedRowInitializer {
        let ids = self.col_ids_for_oids(col_oids, layout_version);
        ProjectedRowInitializer::new(&self.version(layout_version).layout, ids)
    }

    /// Initializer for scan buffers of up to `max_tuples` rows.
    pub fn initializer_for_projected_columns(
        &self,
        col_oids: &[ColOid],
        max_tuples: usize,
        layout_version: LayoutVersion,
    ) -> ProjectedColumnsInitializer {
        let ids = self.col_ids_for_oids(col_oids, layout_version);
        ProjectedColumnsInitializer::new(&self.version(layout_version).layout, ids, max_tuples)
    }

    /// Map each requested col oid to its dense buffer index, assigned
    /// in physical col-id order.
    pub fn projection_map_for_oids(
        &self,
        col_oids: &[ColOid],
        layout_version: LayoutVersion,
    ) -> ProjectionMap {
        let ids = self.col_ids_for_oids(col_oids, layout_version);
        let mut pairs: Vec<(ColId, ColOid)> =
            ids.into_iter().zip(col_oids.iter().copied()).collect();
        pairs.sort_unstable_by_key(|&(id, _)| id);
        pairs
            .into_iter()
            .enumerate()
            .map(|(idx, (_, oid))| (oid, idx))
            .collect()
    }

    pub fn get_schema(&self, layout_version: LayoutVersion) -> &Arc<Schema> {
        &self.version(layout_version).schema
    }

    pub fn get_block_layout(&self, layout_version: LayoutVersion) -> &BlockLayout {
        &self.version(layout_version).layout
    }

    pub fn column_oid_to_id_map(&self, layout_version: LayoutVersion) -> &HashMap<ColOid, ColId> {
        &self.version(layout_version).oid_to_id
    }

    pub fn column_id_to_oid_map(&self, layout_version: LayoutVersion) -> &HashMap<ColId, ColOid> {
        &self.version(layout_version).id_to_oid
    }
}
