use crate::datatable::AttrSizeMap;
use crate::layout::{ColId, IGNORE_COLUMN_ID, VERSION_POINTER_COLUMN_ID};
use crate::projection::Projection;
use crate::table::DataTableVersion;
use smallvec::SmallVec;
use std::ops::{Deref, DerefMut};
use strata_catalog::ColOid;

/// Columns of the desired version a tuple version does not store:
/// `(header index, col oid)` pairs, in header order.
pub(crate) type MissingCols = SmallVec<[(usize, ColOid); 8]>;

pub(crate) struct AlignResult {
    pub missing: MissingCols,
    pub size_overrides: AttrSizeMap,
}

/// Holds a projection buffer whose header has been rewritten into a
/// tuple version's col ids, together with the saved original header.
/// Dropping the guard restores the header, so no early return can
/// leave the caller's buffer in translated form.
pub(crate) struct TranslatedHeader<'a, P: Projection> {
    buf: &'a mut P,
    saved: SmallVec<[ColId; 16]>,
}

impl<'a, P: Projection> Deref for TranslatedHeader<'a, P> {
    type Target = P;
    #[inline]
    fn deref(&self) -> &P {
        self.buf
    }
}

impl<'a, P: Projection> DerefMut for TranslatedHeader<'a, P> {
    #[inline]
    fn deref_mut(&mut self) -> &mut P {
        self.buf
    }
}

impl<'a, P: Projection> Drop for TranslatedHeader<'a, P> {
    #[inline]
    fn drop(&mut self) {
        self.buf.col_ids_mut().copy_from_slice(&self.saved);
    }
}

/// Rewrite `out`'s header in place from `desired`'s col ids to
/// `tuple`'s: each entry becomes the col id of the matching col oid
/// in the tuple version, or `IGNORE_COLUMN_ID` when the oid is not
/// stored there. Columns whose physical width differs between the
/// two versions are recorded in the size-override map so the read
/// can widen or narrow values on the way out.
pub(crate) fn align_to_version<'a, P: Projection>(
    out: &'a mut P,
    tuple: &DataTableVersion,
    desired: &DataTableVersion,
) -> (TranslatedHeader<'a, P>, AlignResult) {
    let saved: SmallVec<[ColId; 16]> = out.col_ids().iter().copied().collect();
    let mut missing = MissingCols::new();
    let mut size_overrides = AttrSizeMap::new();
    for i in 0..out.num_columns() {
        let id_d = out.col_ids()[i];
        assert!(
            id_d != VERSION_POINTER_COLUMN_ID,
            "user projection must not read the version pointer column"
        );
        let oid = desired.id_to_oid[&id_d];
        match tuple.oid_to_id.get(&oid) {
            Some(&id_t) => {
                out.col_ids_mut()[i] = id_t;
                let size_t = tuple.layout.attr_size(id_t);
                let size_d = desired.layout.attr_size(id_d);
                if size_t != size_d {
                    size_overrides.insert(id_t, size_d);
                }
            }
            None => {
                out.col_ids_mut()[i] = IGNORE_COLUMN_ID;
                missing.push((i, oid));
            }
        }
    }
    (
        TranslatedHeader { buf: out, saved },
        AlignResult {
            missing,
            size_overrides,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockStore;
    use crate::layout::LayoutVersion;
    use crate::table::SqlTable;
    use crate::trx::TransactionManager;
    use std::sync::Arc;
    use strata_catalog::alter::{apply_alter, AlterCmd};
    use strata_catalog::{ColumnSpec, Schema, TableOid, TypeId};

    fn two_version_table() -> SqlTable {
        let schema = Schema::new(vec![
            ColumnSpec::new("a", TypeId::Int, false),
            ColumnSpec::new("b", TypeId::Int, false),
        ])
        .unwrap();
        let table = SqlTable::new(
            TableOid::new(1),
            Arc::new(BlockStore::new(100)),
            schema.clone(),
        )
        .unwrap();
        let v1 = apply_alter(
            &schema,
            &[AlterCmd::add_column(ColumnSpec::new(
                "c",
                TypeId::BigInt,
                true,
            ))],
        )
        .unwrap();
        let mgr = TransactionManager::new();
        let txn = mgr.begin();
        table.update_schema(&txn, v1, LayoutVersion(1)).unwrap();
        mgr.commit(txn).unwrap();
        table
    }

    #[test]
    fn test_translate_and_restore_roundtrip() {
        let table = two_version_table();
        let v1 = table.get_schema(LayoutVersion(1)).clone();
        let oids = v1.col_oids();
        let init = table.initializer_for_projected_row(&oids, LayoutVersion(1));
        let mut row = init.project_row();
        let original: Vec<ColId> = row.col_ids().to_vec();

        let tuple_v = table.version(LayoutVersion(0));
        let desired_v = table.version(LayoutVersion(1));
        {
            let (guard, align) = align_to_version(&mut row, tuple_v, desired_v);
            // a and b resolve to V0 slots, c is missing
            assert_eq!(align.missing.len(), 1);
            let (idx, oid) = align.missing[0];
            assert_eq!(oid, v1.find_column("c").unwrap().oid());
            assert_eq!(guard.col_ids()[idx], IGNORE_COLUMN_ID);
            assert!(align.size_overrides.is_empty());
            for (i, &id) in guard.col_ids().iter().enumerate() {
                if i != idx {
                    assert_ne!(id, IGNORE_COLUMN_ID);
                }
            }
        }
        // guard dropped: header bitwise identical to the original
        assert_eq!(row.col_ids(), &original[..]);
    }

    #[test]
    fn test_same_schema_translation_is_identity() {
        let table = two_version_table();
        let oids = table.get_schema(LayoutVersion(0)).col_oids();
        let init = table.initializer_for_projected_row(&oids, LayoutVersion(0));
        let mut row = init.project_row();
        let original: Vec<ColId> = row.col_ids().to_vec();
        let v = table.version(LayoutVersion(0));
        {
            let (guard, align) = align_to_version(&mut row, v, v);
            assert!(align.missing.is_empty());
            assert!(align.size_overrides.is_empty());
            assert_eq!(guard.col_ids(), &original[..]);
        }
        assert_eq!(row.col_ids(), &original[..]);
    }
}
