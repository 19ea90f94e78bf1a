pub mod alter;
pub mod error;

use crate::error::{Error, Result};
use bitflags::bitflags;
use indexmap::IndexMap;
use semistr::SemiStr;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectID<T> {
    id: u32,
    _marker: PhantomData<T>,
}

impl<T> fmt::Debug for ObjectID<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectID").field("id", &self.id).finish()
    }
}

impl<T> fmt::Display for ObjectID<T> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl<T> ObjectID<T> {
    #[inline]
    pub fn new(id: u32) -> Self {
        ObjectID {
            id,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn value(&self) -> u32 {
        self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct T;
pub type TableOid = ObjectID<T>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct C;
pub type ColOid = ObjectID<C>;

/// Logical column type. Each type maps to exactly one physical
/// attribute size, so the storage layer never needs to interpret
/// the type itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeId {
    Bool,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Double,
    Varchar,
}

impl TypeId {
    #[inline]
    pub const fn attr_size(&self) -> AttrSize {
        match self {
            TypeId::Bool | TypeId::TinyInt => AttrSize::Byte1,
            TypeId::SmallInt => AttrSize::Byte2,
            TypeId::Int => AttrSize::Byte4,
            TypeId::BigInt | TypeId::Double => AttrSize::Byte8,
            TypeId::Varchar => AttrSize::Var,
        }
    }
}

/// AttrSize defines the physical width bucket of a column slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AttrSize {
    Byte1,
    Byte2,
    Byte4,
    Byte8,
    Var, // var-len bytes, 16-byte fixed slot with out-of-line tail
}

impl AttrSize {
    #[inline]
    pub const fn fix_len(&self) -> usize {
        match self {
            AttrSize::Byte1 => 1,
            AttrSize::Byte2 => 2,
            AttrSize::Byte4 => 4,
            AttrSize::Byte8 => 8,
            AttrSize::Var => 16,
        }
    }
}

/// Constant value. The only expression kind a column default can
/// hold: non-constant defaults are unrepresentable by construction.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Bool(bool),
    TinyInt(i8),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Double(f64),
    Varchar(String),
}

impl Datum {
    #[inline]
    pub fn type_id(&self) -> TypeId {
        match self {
            Datum::Bool(_) => TypeId::Bool,
            Datum::TinyInt(_) => TypeId::TinyInt,
            Datum::SmallInt(_) => TypeId::SmallInt,
            Datum::Int(_) => TypeId::Int,
            Datum::BigInt(_) => TypeId::BigInt,
            Datum::Double(_) => TypeId::Double,
            Datum::Varchar(_) => TypeId::Varchar,
        }
    }
}

bitflags! {
    pub struct ColumnAttr: u8 {
        const PK = 0x01; // primary key
        const UK = 0x02; // unique key
    }
}

/// Column spec used in creating or altering a table.
#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub name: SemiStr,
    pub ty: TypeId,
    pub nullable: bool,
    pub default: Option<Datum>,
    pub attr: ColumnAttr,
}

impl ColumnSpec {
    #[inline]
    pub fn new(name: &str, ty: TypeId, nullable: bool) -> Self {
        ColumnSpec {
            name: SemiStr::new(name),
            ty,
            nullable,
            default: None,
            attr: ColumnAttr::empty(),
        }
    }

    #[inline]
    pub fn with_default(mut self, default: Datum) -> Self {
        self.default = Some(default);
        self
    }

    #[inline]
    pub fn with_attr(mut self, attr: ColumnAttr) -> Self {
        self.attr = attr;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Column {
    oid: ColOid,
    name: SemiStr,
    ty: TypeId,
    nullable: bool,
    default: Option<Datum>,
    attr: ColumnAttr,
}

impl Column {
    pub(crate) fn from_spec(oid: ColOid, spec: ColumnSpec) -> Result<Self> {
        if let Some(d) = &spec.default {
            if d.type_id() != spec.ty {
                return Err(Error::DefaultTypeMismatch {
                    column: spec.name,
                    expected: spec.ty,
                    actual: d.type_id(),
                });
            }
        }
        Ok(Column {
            oid,
            name: spec.name,
            ty: spec.ty,
            nullable: spec.nullable,
            default: spec.default,
            attr: spec.attr,
        })
    }

    #[inline]
    pub fn oid(&self) -> ColOid {
        self.oid
    }

    #[inline]
    pub fn name(&self) -> &SemiStr {
        &self.name
    }

    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.ty
    }

    #[inline]
    pub fn attr_size(&self) -> AttrSize {
        self.ty.attr_size()
    }

    #[inline]
    pub fn nullable(&self) -> bool {
        self.nullable
    }

    #[inline]
    pub fn default_value(&self) -> Option<&Datum> {
        self.default.as_ref()
    }

    #[inline]
    pub fn attr(&self) -> ColumnAttr {
        self.attr
    }
}

/// Immutable logical schema of one table version.
///
/// Column oids are assigned by the catalog when a column first
/// appears and are never reused: dropping a column retires its oid
/// for the lifetime of the table.
#[derive(Debug, Clone)]
pub struct Schema {
    columns: Vec<Column>,
    by_name: IndexMap<SemiStr, usize>,
    by_oid: HashMap<ColOid, usize>,
    next_oid: u32,
}

const FIRST_COL_OID: u32 = 1;

impl Schema {
    /// Create the initial schema of a table, assigning fresh column
    /// oids in column order.
    pub fn new(specs: Vec<ColumnSpec>) -> Result<Schema> {
        let mut columns = Vec::with_capacity(specs.len());
        let mut next_oid = FIRST_COL_OID;
        for spec in specs {
            columns.push(Column::from_spec(ColOid::new(next_oid), spec)?);
            next_oid += 1;
        }
        Schema::from_columns(columns, next_oid)
    }

    pub(crate) fn from_columns(columns: Vec<Column>, next_oid: u32) -> Result<Schema> {
        if columns.is_empty() {
            return Err(Error::EmptyColumnList);
        }
        let mut by_name = IndexMap::with_capacity(columns.len());
        let mut by_oid = HashMap::with_capacity(columns.len());
        for (idx, col) in columns.iter().enumerate() {
            if by_name.insert(col.name.clone(), idx).is_some() {
                return Err(Error::DuplicateColumnName(col.name.clone()));
            }
            let dup = by_oid.insert(col.oid, idx);
            debug_assert!(dup.is_none()); // oids are assigned, never duplicated
        }
        Ok(Schema {
            columns,
            by_name,
            by_oid,
            next_oid,
        })
    }

    #[inline]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    #[inline]
    pub fn column(&self, idx: usize) -> &Column {
        &self.columns[idx]
    }

    #[inline]
    pub fn find_column(&self, name: &str) -> Option<&Column> {
        self.by_name.get(name).map(|&idx| &self.columns[idx])
    }

    #[inline]
    pub fn column_by_oid(&self, oid: ColOid) -> Option<&Column> {
        self.by_oid.get(&oid).map(|&idx| &self.columns[idx])
    }

    /// Oids of all columns, in schema order.
    #[inline]
    pub fn col_oids(&self) -> Vec<ColOid> {
        self.columns.iter().map(|c| c.oid).collect()
    }

    #[inline]
    pub fn next_col_oid(&self) -> u32 {
        self.next_oid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_assigns_oids_in_order() {
        let schema = Schema::new(vec![
            ColumnSpec::new("a", TypeId::Int, false),
            ColumnSpec::new("b", TypeId::BigInt, true),
        ])
        .unwrap();
        assert_eq!(schema.columns().len(), 2);
        assert_eq!(schema.column(0).oid(), ColOid::new(1));
        assert_eq!(schema.column(1).oid(), ColOid::new(2));
        assert_eq!(schema.next_col_oid(), 3);
    }

    #[test]
    fn test_schema_lookup() {
        let schema = Schema::new(vec![
            ColumnSpec::new("a", TypeId::Int, false),
            ColumnSpec::new("b", TypeId::Varchar, true),
        ])
        .unwrap();
        let b = schema.find_column("b").unwrap();
        assert_eq!(b.type_id(), TypeId::Varchar);
        assert_eq!(b.attr_size(), AttrSize::Var);
        assert!(b.nullable());
        assert!(schema.find_column("c").is_none());
        assert_eq!(
            schema.column_by_oid(b.oid()).unwrap().name(),
            &SemiStr::new("b")
        );
    }

    #[test]
    fn test_schema_rejects_duplicate_names() {
        let res = Schema::new(vec![
            ColumnSpec::new("a", TypeId::Int, false),
            ColumnSpec::new("a", TypeId::BigInt, false),
        ]);
        assert_eq!(res.unwrap_err(), Error::DuplicateColumnName(SemiStr::new("a")));
    }

    #[test]
    fn test_schema_rejects_empty() {
        assert_eq!(Schema::new(vec![]).unwrap_err(), Error::EmptyColumnList);
    }

    #[test]
    fn test_default_type_must_match() {
        let res = Schema::new(vec![
            ColumnSpec::new("a", TypeId::Int, false).with_default(Datum::BigInt(1))
        ]);
        assert!(matches!(
            res.unwrap_err(),
            Error::DefaultTypeMismatch { .. }
        ));
    }

    #[test]
    fn test_attr_sizes() {
        assert_eq!(TypeId::Bool.attr_size().fix_len(), 1);
        assert_eq!(TypeId::TinyInt.attr_size().fix_len(), 1);
        assert_eq!(TypeId::SmallInt.attr_size().fix_len(), 2);
        assert_eq!(TypeId::Int.attr_size().fix_len(), 4);
        assert_eq!(TypeId::BigInt.attr_size().fix_len(), 8);
        assert_eq!(TypeId::Double.attr_size().fix_len(), 8);
        assert_eq!(TypeId::Varchar.attr_size(), AttrSize::Var);
    }
}
