use crate::block::TupleSlot;
use crate::layout::{BlockLayout, ColId, NUM_RESERVED_COLUMNS, VERSION_POINTER_COLUMN_ID};
use crate::value::Val;
use std::collections::HashMap;
use strata_catalog::{AttrSize, ColOid};

/// Maps each projected col oid to its dense index in a projection
/// buffer. Dense indices are assigned in physical col-id order, so a
/// caller walking the buffer left to right visits slots in storage
/// order.
pub type ProjectionMap = HashMap<ColOid, usize>;

/// An output buffer with an embedded column-id header. The header is
/// the only part the projection translator mutates in place; it must
/// be restored before control returns to the caller.
pub trait Projection {
    fn num_columns(&self) -> usize;
    fn col_ids(&self) -> &[ColId];
    fn col_ids_mut(&mut self) -> &mut [ColId];
}

/// Caller-owned buffer holding one tuple in a fixed column layout.
#[derive(Debug, Clone)]
pub struct ProjectedRow {
    col_ids: Box<[ColId]>,
    attr_sizes: Box<[AttrSize]>,
    values: Box<[Option<Val>]>,
}

impl ProjectedRow {
    #[inline]
    pub fn num_columns(&self) -> usize {
        self.col_ids.len()
    }

    #[inline]
    pub fn col_id(&self, idx: usize) -> ColId {
        self.col_ids[idx]
    }

    #[inline]
    pub fn attr_size(&self, idx: usize) -> AttrSize {
        self.attr_sizes[idx]
    }

    /// Value at slot `idx`; `None` means null.
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Val> {
        self.values[idx].as_ref()
    }

    #[inline]
    pub fn is_null(&self, idx: usize) -> bool {
        self.values[idx].is_none()
    }

    /// Store a value at slot `idx` and mark it non-null.
    #[inline]
    pub fn set(&mut self, idx: usize, val: Val) {
        debug_assert_eq!(val.attr_size(), self.attr_sizes[idx]);
        self.values[idx] = Some(val);
    }

    #[inline]
    pub fn set_null(&mut self, idx: usize) {
        self.values[idx] = None;
    }

    /// Position of `id` in the header, if projected.
    #[inline]
    pub fn index_of(&self, id: ColId) -> Option<usize> {
        self.col_ids.iter().position(|&c| c == id)
    }
}

impl Projection for ProjectedRow {
    #[inline]
    fn num_columns(&self) -> usize {
        self.col_ids.len()
    }

    #[inline]
    fn col_ids(&self) -> &[ColId] {
        &self.col_ids
    }

    #[inline]
    fn col_ids_mut(&mut self) -> &mut [ColId] {
        &mut self.col_ids
    }
}

#[derive(Debug, Clone)]
pub struct ProjectedRowInitializer {
    col_ids: Box<[ColId]>,
    attr_sizes: Box<[AttrSize]>,
}

impl ProjectedRowInitializer {
    /// Bind `col_ids` to `layout`. Slots are ordered by ascending col
    /// id so buffer order matches `ProjectionMap` dense indices.
    pub(crate) fn new(layout: &BlockLayout, mut col_ids: Vec<ColId>) -> Self {
        debug_assert!(col_ids
            .iter()
            .all(|&id| id != VERSION_POINTER_COLUMN_ID && id.0 >= NUM_RESERVED_COLUMNS));
        col_ids.sort_unstable();
        let attr_sizes = col_ids.iter().map(|&id| layout.attr_size(id)).collect();
        ProjectedRowInitializer {
            col_ids: col_ids.into_boxed_slice(),
            attr_sizes,
        }
    }

    #[inline]
    pub fn num_columns(&self) -> usize {
        self.col_ids.len()
    }

    /// Materialize an all-null row buffer.
    #[inline]
    pub fn project_row(&self) -> ProjectedRow {
        ProjectedRow {
            col_ids: self.col_ids.clone(),
            attr_sizes: self.attr_sizes.clone(),
            values: vec![None; self.col_ids.len()].into_boxed_slice(),
        }
    }
}

/// Column-major output buffer for scans, holding up to `max_tuples`
/// rows plus the slot each row came from.
#[derive(Debug)]
pub struct ProjectedColumns {
    col_ids: Box<[ColId]>,
    attr_sizes: Box<[AttrSize]>,
    max_tuples: usize,
    tuple_slots: Vec<TupleSlot>,
    columns: Vec<Vec<Option<Val>>>,
}

impl ProjectedColumns {
    #[inline]
    pub fn num_tuples(&self) -> usize {
        self.tuple_slots.len()
    }

    #[inline]
    pub fn max_tuples(&self) -> usize {
        self.max_tuples
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.num_tuples() >= self.max_tuples
    }

    /// Drop all buffered rows, keeping the projection header.
    #[inline]
    pub fn reset(&mut self) {
        self.tuple_slots.clear();
        for col in &mut self.columns {
            col.clear();
        }
    }

    #[inline]
    pub fn attr_size(&self, col_idx: usize) -> AttrSize {
        self.attr_sizes[col_idx]
    }

    #[inline]
    pub fn row_view(&self, row: usize) -> RowView<'_> {
        debug_assert!(row < self.num_tuples());
        RowView { pc: self, row }
    }

    pub(crate) fn append_row(&mut self, slot: TupleSlot, row: Vec<Option<Val>>) {
        debug_assert!(!self.is_full());
        debug_assert_eq!(row.len(), self.col_ids.len());
        for (col, val) in self.columns.iter_mut().zip(row) {
            col.push(val);
        }
        self.tuple_slots.push(slot);
    }

    pub(crate) fn set(&mut self, col_idx: usize, row: usize, val: Option<Val>) {
        debug_assert!(row < self.num_tuples());
        self.columns[col_idx][row] = val;
    }
}

impl Projection for ProjectedColumns {
    #[inline]
    fn num_columns(&self) -> usize {
        self.col_ids.len()
    }

    #[inline]
    fn col_ids(&self) -> &[ColId] {
        &self.col_ids
    }

    #[inline]
    fn col_ids_mut(&mut self) -> &mut [ColId] {
        &mut self.col_ids
    }
}

/// One row of a ProjectedColumns buffer.
#[derive(Clone, Copy)]
pub struct RowView<'a> {
    pc: &'a ProjectedColumns,
    row: usize,
}

impl<'a> RowView<'a> {
    #[inline]
    pub fn num_columns(&self) -> usize {
        self.pc.col_ids.len()
    }

    #[inline]
    pub fn get(&self, col_idx: usize) -> Option<&'a Val> {
        self.pc.columns[col_idx][self.row].as_ref()
    }

    #[inline]
    pub fn is_null(&self, col_idx: usize) -> bool {
        self.pc.columns[col_idx][self.row].is_none()
    }

    /// Slot the row was materialized from.
    #[inline]
    pub fn slot(&self) -> TupleSlot {
        self.pc.tuple_slots[self.row]
    }
}

#[derive(Debug, Clone)]
pub struct ProjectedColumnsInitializer {
    col_ids: Box<[ColId]>,
    attr_sizes: Box<[AttrSize]>,
    max_tuples: usize,
}

impl ProjectedColumnsInitializer {
    pub(crate) fn new(layout: &BlockLayout, mut col_ids: Vec<ColId>, max_tuples: usize) -> Self {
        debug_assert!(max_tuples > 0);
        debug_assert!(col_ids
            .iter()
            .all(|&id| id != VERSION_POINTER_COLUMN_ID && id.0 >= NUM_RESERVED_COLUMNS));
        col_ids.sort_unstable();
        let attr_sizes = col_ids.iter().map(|&id| layout.attr_size(id)).collect();
        ProjectedColumnsInitializer {
            col_ids: col_ids.into_boxed_slice(),
            attr_sizes,
            max_tuples,
        }
    }

    #[inline]
    pub fn num_columns(&self) -> usize {
        self.col_ids.len()
    }

    /// Materialize an empty column buffer.
    pub fn project_columns(&self) -> ProjectedColumns {
        ProjectedColumns {
            col_ids: self.col_ids.clone(),
            attr_sizes: self.attr_sizes.clone(),
            max_tuples: self.max_tuples,
            tuple_slots: Vec::with_capacity(self.max_tuples),
            columns: vec![Vec::with_capacity(self.max_tuples); self.col_ids.len()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::build_layout;
    use strata_catalog::{ColumnSpec, Schema, TypeId};

    fn test_layout() -> (Schema, crate::layout::LayoutAndMaps) {
        let schema = Schema::new(vec![
            ColumnSpec::new("a", TypeId::Int, false),
            ColumnSpec::new("b", TypeId::BigInt, false),
            ColumnSpec::new("c", TypeId::SmallInt, true),
        ])
        .unwrap();
        let built = build_layout(&schema);
        (schema, built)
    }

    #[test]
    fn test_row_initializer_sorts_by_col_id() {
        let (schema, built) = test_layout();
        // request columns in reverse schema order
        let ids: Vec<ColId> = schema
            .col_oids()
            .iter()
            .rev()
            .map(|oid| built.oid_to_id[oid])
            .collect();
        let init = ProjectedRowInitializer::new(&built.layout, ids);
        let row = init.project_row();
        for i in 1..row.num_columns() {
            assert!(row.col_id(i - 1) < row.col_id(i));
        }
    }

    #[test]
    fn test_row_set_get_null() {
        let (schema, built) = test_layout();
        let ids: Vec<ColId> = schema
            .col_oids()
            .iter()
            .map(|oid| built.oid_to_id[oid])
            .collect();
        let init = ProjectedRowInitializer::new(&built.layout, ids);
        let mut row = init.project_row();
        assert!(row.is_null(0));
        // col id 1 is the 8-byte column "b"
        row.set(0, Val::from(7i64));
        assert_eq!(row.get(0), Some(&Val::Byte8(7)));
        row.set_null(0);
        assert!(row.is_null(0));
    }

    #[test]
    fn test_columns_append_and_rowview() {
        let (schema, built) = test_layout();
        let ids: Vec<ColId> = schema
            .col_oids()
            .iter()
            .map(|oid| built.oid_to_id[oid])
            .collect();
        let init = ProjectedColumnsInitializer::new(&built.layout, ids, 2);
        let mut cols = init.project_columns();
        assert_eq!(cols.num_tuples(), 0);
        let slot = TupleSlot::new(3, 9);
        cols.append_row(slot, vec![Some(Val::from(1i64)), Some(Val::from(2i32)), None]);
        assert_eq!(cols.num_tuples(), 1);
        assert!(!cols.is_full());
        let view = cols.row_view(0);
        assert_eq!(view.get(0), Some(&Val::Byte8(1)));
        assert!(view.is_null(2));
        assert_eq!(view.slot(), slot);
        cols.append_row(TupleSlot::new(3, 10), vec![None, None, None]);
        assert!(cols.is_full());
        cols.reset();
        assert_eq!(cols.num_tuples(), 0);
    }
}
