use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use strata_catalog::{AttrSize, Datum};

/// Var-len payloads up to this length stay inline in the value.
pub const VAR_LEN_INLINE: usize = 14;

pub type VarBytes = SmallVec<[u8; VAR_LEN_INLINE]>;

/// Val is the storage-layer value representation, bucketed by
/// physical attribute size. Fixed-width values are stored as raw
/// unsigned bits; interpretation (signedness, floats) belongs to
/// the logical layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Val {
    Byte1(u8),
    Byte2(u16),
    Byte4(u32),
    Byte8(u64),
    VarByte(VarBytes),
}

impl Val {
    #[inline]
    pub fn attr_size(&self) -> AttrSize {
        match self {
            Val::Byte1(_) => AttrSize::Byte1,
            Val::Byte2(_) => AttrSize::Byte2,
            Val::Byte4(_) => AttrSize::Byte4,
            Val::Byte8(_) => AttrSize::Byte8,
            Val::VarByte(_) => AttrSize::Var,
        }
    }

    /// Encode a catalog constant into its canonical storage width.
    #[inline]
    pub fn from_datum(datum: &Datum) -> Val {
        match datum {
            Datum::Bool(v) => Val::Byte1(*v as u8),
            Datum::TinyInt(v) => Val::Byte1(*v as u8),
            Datum::SmallInt(v) => Val::Byte2(*v as u16),
            Datum::Int(v) => Val::Byte4(*v as u32),
            Datum::BigInt(v) => Val::Byte8(*v as u64),
            Datum::Double(v) => Val::Byte8(v.to_bits()),
            Datum::Varchar(v) => Val::VarByte(VarBytes::from_slice(v.as_bytes())),
        }
    }

    /// Rebucket a fixed-width value to `target`, zero-extending on
    /// widen and truncating on narrow. Var-len values never change
    /// buckets.
    #[inline]
    pub fn coerce(self, target: AttrSize) -> Val {
        if self.attr_size() == target {
            return self;
        }
        let raw = match self {
            Val::Byte1(v) => v as u64,
            Val::Byte2(v) => v as u64,
            Val::Byte4(v) => v as u64,
            Val::Byte8(v) => v,
            Val::VarByte(_) => {
                debug_assert!(false, "var-len value cannot change attribute size");
                return self;
            }
        };
        match target {
            AttrSize::Byte1 => Val::Byte1(raw as u8),
            AttrSize::Byte2 => Val::Byte2(raw as u16),
            AttrSize::Byte4 => Val::Byte4(raw as u32),
            AttrSize::Byte8 => Val::Byte8(raw),
            AttrSize::Var => {
                debug_assert!(false, "fixed-width value cannot become var-len");
                Val::Byte8(raw)
            }
        }
    }

    #[inline]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Val::VarByte(b) => Some(b),
            _ => None,
        }
    }
}

impl From<u8> for Val {
    #[inline]
    fn from(value: u8) -> Self {
        Val::Byte1(value)
    }
}

impl From<i8> for Val {
    #[inline]
    fn from(value: i8) -> Self {
        Val::Byte1(value as u8)
    }
}

impl From<u16> for Val {
    #[inline]
    fn from(value: u16) -> Self {
        Val::Byte2(value)
    }
}

impl From<i16> for Val {
    #[inline]
    fn from(value: i16) -> Self {
        Val::Byte2(value as u16)
    }
}

impl From<u32> for Val {
    #[inline]
    fn from(value: u32) -> Self {
        Val::Byte4(value)
    }
}

impl From<i32> for Val {
    #[inline]
    fn from(value: i32) -> Self {
        Val::Byte4(value as u32)
    }
}

impl From<u64> for Val {
    #[inline]
    fn from(value: u64) -> Self {
        Val::Byte8(value)
    }
}

impl From<i64> for Val {
    #[inline]
    fn from(value: i64) -> Self {
        Val::Byte8(value as u64)
    }
}

impl From<f64> for Val {
    #[inline]
    fn from(value: f64) -> Self {
        Val::Byte8(value.to_bits())
    }
}

impl From<&[u8]> for Val {
    #[inline]
    fn from(value: &[u8]) -> Self {
        Val::VarByte(VarBytes::from_slice(value))
    }
}

impl From<&str> for Val {
    #[inline]
    fn from(value: &str) -> Self {
        Val::VarByte(VarBytes::from_slice(value.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_val_buckets() {
        assert_eq!(Val::from(1i32).attr_size(), AttrSize::Byte4);
        assert_eq!(Val::from(1i64).attr_size(), AttrSize::Byte8);
        assert_eq!(Val::from(-1i8), Val::Byte1(0xff));
        assert_eq!(Val::from("hello").attr_size(), AttrSize::Var);
    }

    #[test]
    fn test_coerce_widen_narrow() {
        assert_eq!(Val::Byte4(0x1234_5678).coerce(AttrSize::Byte8), Val::Byte8(0x1234_5678));
        assert_eq!(Val::Byte8(0x1_0000_0001).coerce(AttrSize::Byte4), Val::Byte4(1));
        assert_eq!(Val::Byte2(7).coerce(AttrSize::Byte2), Val::Byte2(7));
    }

    #[test]
    fn test_from_datum_widths() {
        assert_eq!(Val::from_datum(&Datum::Bool(true)), Val::Byte1(1));
        assert_eq!(Val::from_datum(&Datum::SmallInt(-2)), Val::Byte2(0xfffe));
        assert_eq!(Val::from_datum(&Datum::Int(15712)), Val::Byte4(15712));
        assert_eq!(
            Val::from_datum(&Datum::Double(1.5)),
            Val::Byte8(1.5f64.to_bits())
        );
        assert_eq!(
            Val::from_datum(&Datum::Varchar("abc".to_string())),
            Val::from("abc")
        );
    }
}
