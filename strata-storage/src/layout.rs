use crate::value::Val;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use strata_catalog::{AttrSize, ColOid, Schema};

/// Physical column slot index inside one BlockLayout. Version-local:
/// the same logical column may sit at different col ids in different
/// layout versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColId(pub u16);

/// Sentinel written into a projection header for columns the tuple's
/// physical version does not store. Reads leave such slots null.
pub const IGNORE_COLUMN_ID: ColId = ColId(u16::MAX);

/// Reserved slot 0 holds the per-tuple version pointer. It must never
/// appear in a user projection.
pub const VERSION_POINTER_COLUMN_ID: ColId = ColId(0);

pub const NUM_RESERVED_COLUMNS: u16 = 1;

/// Monotone physical schema generation of one logical table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct LayoutVersion(pub u8);

/// Hard ceiling on schema versions of one table. Well below the
/// LayoutVersion value range, so the registry fills before the
/// counter type can wrap.
pub const MAX_NUM_VERSIONS: usize = 64;

impl LayoutVersion {
    pub const ZERO: LayoutVersion = LayoutVersion(0);

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn next(self) -> LayoutVersion {
        LayoutVersion(self.0 + 1)
    }
}

impl fmt::Display for LayoutVersion {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical attribute layout of one table version: per-slot width,
/// indexed by col id. Derived deterministically from a schema; two
/// schemas that differ only in default expressions emit identical
/// layouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLayout {
    attr_sizes: Vec<AttrSize>,
}

impl BlockLayout {
    #[inline]
    pub fn num_columns(&self) -> u16 {
        self.attr_sizes.len() as u16
    }

    #[inline]
    pub fn num_user_columns(&self) -> u16 {
        self.num_columns() - NUM_RESERVED_COLUMNS
    }

    #[inline]
    pub fn attr_size(&self, id: ColId) -> AttrSize {
        self.attr_sizes[id.0 as usize]
    }

    /// Fixed bytes one tuple occupies, system columns included.
    #[inline]
    pub fn tuple_size(&self) -> usize {
        self.attr_sizes.iter().map(|s| s.fix_len()).sum()
    }

    /// All user col ids, ascending.
    #[inline]
    pub fn user_col_ids(&self) -> impl Iterator<Item = ColId> + '_ {
        (NUM_RESERVED_COLUMNS..self.num_columns()).map(ColId)
    }
}

/// Output of the layout builder: the physical layout plus the maps
/// the versioned table needs to translate between logical oids and
/// physical slots, and the constant defaults keyed by oid.
pub struct LayoutAndMaps {
    pub layout: BlockLayout,
    pub oid_to_id: HashMap<ColOid, ColId>,
    pub id_to_oid: HashMap<ColId, ColOid>,
    pub defaults: HashMap<ColOid, Val>,
}

// Size buckets in layout order. Var-len columns take the lowest user
// col ids, then fixed widths descending.
const NUM_BUCKETS: usize = 5;

#[inline]
fn bucket(size: AttrSize) -> usize {
    match size {
        AttrSize::Var => 0,
        AttrSize::Byte8 => 1,
        AttrSize::Byte4 => 2,
        AttrSize::Byte2 => 3,
        AttrSize::Byte1 => 4,
    }
}

/// Compute the attribute-size-bucketed physical layout of `schema`.
///
/// Reserved system slots come first, then user columns grouped by
/// attribute size; within a bucket, col ids ascend in schema order.
/// The tie-break by schema order is load-bearing: it makes layouts a
/// pure function of the column type sequence, so layout equality can
/// stand in for physical compatibility.
pub fn build_layout(schema: &Schema) -> LayoutAndMaps {
    let num_cols = NUM_RESERVED_COLUMNS as usize + schema.columns().len();
    assert!(
        num_cols < IGNORE_COLUMN_ID.0 as usize,
        "too many columns for a block layout"
    );

    let mut counts = [0usize; NUM_BUCKETS];
    for col in schema.columns() {
        counts[bucket(col.attr_size())] += 1;
    }
    // base offset of each bucket, reserved slots first
    let mut offsets = [0usize; NUM_BUCKETS];
    offsets[0] = NUM_RESERVED_COLUMNS as usize;
    for i in 1..NUM_BUCKETS {
        offsets[i] = offsets[i - 1] + counts[i - 1];
    }

    let mut attr_sizes = vec![AttrSize::Byte8; num_cols];
    let mut oid_to_id = HashMap::with_capacity(schema.columns().len());
    let mut id_to_oid = HashMap::with_capacity(schema.columns().len());
    let mut defaults = HashMap::new();
    for col in schema.columns() {
        let b = bucket(col.attr_size());
        let id = ColId(offsets[b] as u16);
        offsets[b] += 1;
        attr_sizes[id.0 as usize] = col.attr_size();
        oid_to_id.insert(col.oid(), id);
        id_to_oid.insert(id, col.oid());
        if let Some(datum) = col.default_value() {
            defaults.insert(col.oid(), Val::from_datum(datum));
        }
    }
    debug_assert_eq!(offsets[NUM_BUCKETS - 1], num_cols);

    LayoutAndMaps {
        layout: BlockLayout { attr_sizes },
        oid_to_id,
        id_to_oid,
        defaults,
    }
}
