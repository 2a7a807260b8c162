//! Value types and the subtyping relation used by the validator.

use std::fmt;

/// The type of a single operand, local, global or merge slot.
///
/// `Bottom` never appears in bytecode. The validator synthesizes it when
/// popping from the polymorphic stack of an unreachable region; it is a
/// subtype of every other type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    I32,
    I64,
    F32,
    F64,
    V128,
    FuncRef,
    ExternRef,
    Bottom,
}

impl ValueType {
    /// Decode a value type from its single-byte encoding.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x7F => Some(ValueType::I32),
            0x7E => Some(ValueType::I64),
            0x7D => Some(ValueType::F32),
            0x7C => Some(ValueType::F64),
            0x7B => Some(ValueType::V128),
            0x70 => Some(ValueType::FuncRef),
            0x6F => Some(ValueType::ExternRef),
            _ => None,
        }
    }

    /// The single-byte encoding, or `None` for `Bottom`.
    pub fn code(self) -> Option<u8> {
        match self {
            ValueType::I32 => Some(0x7F),
            ValueType::I64 => Some(0x7E),
            ValueType::F32 => Some(0x7D),
            ValueType::F64 => Some(0x7C),
            ValueType::V128 => Some(0x7B),
            ValueType::FuncRef => Some(0x70),
            ValueType::ExternRef => Some(0x6F),
            ValueType::Bottom => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueType::I32 => "i32",
            ValueType::I64 => "i64",
            ValueType::F32 => "f32",
            ValueType::F64 => "f64",
            ValueType::V128 => "v128",
            ValueType::FuncRef => "funcref",
            ValueType::ExternRef => "externref",
            ValueType::Bottom => "<bot>",
        }
    }

    #[inline]
    pub fn is_reference(self) -> bool {
        matches!(self, ValueType::FuncRef | ValueType::ExternRef)
    }

    #[inline]
    pub fn is_integer(self) -> bool {
        matches!(self, ValueType::I32 | ValueType::I64)
    }

    #[inline]
    pub fn is_float(self) -> bool {
        matches!(self, ValueType::F32 | ValueType::F64)
    }

    /// Size in bytes of a value of this type when stored in a frame slot or
    /// in linear memory.
    pub fn size_bytes(self) -> u32 {
        match self {
            ValueType::I32 | ValueType::F32 => 4,
            ValueType::I64 | ValueType::F64 => 8,
            ValueType::V128 => 16,
            ValueType::FuncRef | ValueType::ExternRef => 8,
            ValueType::Bottom => 0,
        }
    }

    /// `self <: other`. Types are invariant except for `Bottom`.
    #[inline]
    pub fn is_subtype_of(self, other: ValueType) -> bool {
        self == other || self == ValueType::Bottom
    }

    /// The greatest common subtype of two types.
    ///
    /// Used by `br_table` to compute one result sequence that is valid for
    /// every distinct target.
    pub fn common_subtype(a: ValueType, b: ValueType) -> ValueType {
        if a.is_subtype_of(b) {
            a
        } else if b.is_subtype_of(a) {
            b
        } else {
            ValueType::Bottom
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trip() {
        for ty in [
            ValueType::I32,
            ValueType::I64,
            ValueType::F32,
            ValueType::F64,
            ValueType::V128,
            ValueType::FuncRef,
            ValueType::ExternRef,
        ] {
            assert_eq!(ty.code().and_then(ValueType::from_code), Some(ty));
        }
        assert_eq!(ValueType::Bottom.code(), None);
        assert_eq!(ValueType::from_code(0x40), None);
    }

    #[test]
    fn bottom_is_subtype_of_everything() {
        assert!(ValueType::Bottom.is_subtype_of(ValueType::I32));
        assert!(ValueType::Bottom.is_subtype_of(ValueType::ExternRef));
        assert!(!ValueType::I32.is_subtype_of(ValueType::Bottom));
    }

    #[test]
    fn value_types_are_invariant() {
        assert!(ValueType::I32.is_subtype_of(ValueType::I32));
        assert!(!ValueType::I32.is_subtype_of(ValueType::I64));
        assert!(!ValueType::FuncRef.is_subtype_of(ValueType::ExternRef));
    }

    #[test]
    fn common_subtype() {
        assert_eq!(
            ValueType::common_subtype(ValueType::I32, ValueType::I32),
            ValueType::I32
        );
        assert_eq!(
            ValueType::common_subtype(ValueType::Bottom, ValueType::F64),
            ValueType::Bottom
        );
        assert_eq!(
            ValueType::common_subtype(ValueType::I32, ValueType::F32),
            ValueType::Bottom
        );
    }

    #[test]
    fn display() {
        assert_eq!(ValueType::FuncRef.to_string(), "funcref");
        assert_eq!(ValueType::Bottom.to_string(), "<bot>");
    }
}
