//! Opcode definitions and the static opcode table.
//!
//! Every opcode is described once, in the `define_opcodes!` invocation below.
//! The invocation produces the [`Opcode`] enum and a flat table of
//! [`OpInfo`] rows; lookup tables are derived from that single list.
//!
//! Prefixed opcodes are identified by `(prefix << 8) | sub_opcode`, so
//! `i32.trunc_sat_f32_s` is `0xFC00` and `v128.load` is `0xFD00`.

use std::fmt;
use std::sync::LazyLock;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use rustc_hash::FxHashMap;
use skiff_core::Features;
use skiff_core::ValueType::{self, F32, F64, I32, I64, V128};

/// Prefix byte of the numeric extensions (saturating truncation, bulk
/// memory, table instructions).
pub const PREFIX_NUMERIC: u8 = 0xFC;
/// Prefix byte of the vector instructions.
pub const PREFIX_SIMD: u8 = 0xFD;

/// Width and extension of a linear-memory load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum LoadType {
    I32Load,
    I32Load8S,
    I32Load8U,
    I32Load16S,
    I32Load16U,
    I64Load,
    I64Load8S,
    I64Load8U,
    I64Load16S,
    I64Load16U,
    I64Load32S,
    I64Load32U,
    F32Load,
    F64Load,
    V128Load,
}

impl LoadType {
    /// The type of the value pushed by the load.
    pub fn value_type(self) -> ValueType {
        match self {
            LoadType::I32Load
            | LoadType::I32Load8S
            | LoadType::I32Load8U
            | LoadType::I32Load16S
            | LoadType::I32Load16U => I32,
            LoadType::I64Load
            | LoadType::I64Load8S
            | LoadType::I64Load8U
            | LoadType::I64Load16S
            | LoadType::I64Load16U
            | LoadType::I64Load32S
            | LoadType::I64Load32U => I64,
            LoadType::F32Load => F32,
            LoadType::F64Load => F64,
            LoadType::V128Load => V128,
        }
    }

    /// Number of bytes read from memory.
    pub fn size(self) -> u32 {
        1 << self.size_log2()
    }

    pub fn size_log2(self) -> u32 {
        match self {
            LoadType::I32Load8S
            | LoadType::I32Load8U
            | LoadType::I64Load8S
            | LoadType::I64Load8U => 0,
            LoadType::I32Load16S
            | LoadType::I32Load16U
            | LoadType::I64Load16S
            | LoadType::I64Load16U => 1,
            LoadType::I32Load
            | LoadType::I64Load32S
            | LoadType::I64Load32U
            | LoadType::F32Load => 2,
            LoadType::I64Load | LoadType::F64Load => 3,
            LoadType::V128Load => 4,
        }
    }

    /// The full-width load of a value type.
    pub fn for_value_type(ty: ValueType) -> LoadType {
        match ty {
            I32 => LoadType::I32Load,
            F32 => LoadType::F32Load,
            F64 => LoadType::F64Load,
            V128 => LoadType::V128Load,
            _ => LoadType::I64Load,
        }
    }
}

/// Width of a linear-memory store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum StoreType {
    I32Store,
    I32Store8,
    I32Store16,
    I64Store,
    I64Store8,
    I64Store16,
    I64Store32,
    F32Store,
    F64Store,
    V128Store,
}

impl StoreType {
    /// The type of the value consumed by the store.
    pub fn value_type(self) -> ValueType {
        match self {
            StoreType::I32Store | StoreType::I32Store8 | StoreType::I32Store16 => I32,
            StoreType::I64Store
            | StoreType::I64Store8
            | StoreType::I64Store16
            | StoreType::I64Store32 => I64,
            StoreType::F32Store => F32,
            StoreType::F64Store => F64,
            StoreType::V128Store => V128,
        }
    }

    pub fn size(self) -> u32 {
        1 << self.size_log2()
    }

    pub fn size_log2(self) -> u32 {
        match self {
            StoreType::I32Store8 | StoreType::I64Store8 => 0,
            StoreType::I32Store16 | StoreType::I64Store16 => 1,
            StoreType::I32Store | StoreType::I64Store32 | StoreType::F32Store => 2,
            StoreType::I64Store | StoreType::F64Store => 3,
            StoreType::V128Store => 4,
        }
    }

    pub fn for_value_type(ty: ValueType) -> StoreType {
        match ty {
            I32 => StoreType::I32Store,
            F32 => StoreType::F32Store,
            F64 => StoreType::F64Store,
            V128 => StoreType::V128Store,
            _ => StoreType::I64Store,
        }
    }
}

/// How the decoder handles an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    /// Pops one operand, pushes one result. No immediates.
    Unary { input: ValueType, output: ValueType },
    /// Pops two operands, pushes one result. No immediates.
    Binary {
        lhs: ValueType,
        rhs: ValueType,
        output: ValueType,
    },
    /// Memory load with a `memarg` immediate.
    Load(LoadType),
    /// Memory store with a `memarg` immediate.
    Store(StoreType),
    /// Needs a dedicated handler.
    Special,
}

/// One row of the opcode table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpInfo {
    pub opcode: Opcode,
    pub name: &'static str,
    pub class: OpClass,
    /// Extension that must be enabled for the opcode to decode.
    pub feature: Features,
}

const fn un(input: ValueType, output: ValueType) -> OpClass {
    OpClass::Unary { input, output }
}

const fn bin(operand: ValueType, output: ValueType) -> OpClass {
    OpClass::Binary {
        lhs: operand,
        rhs: operand,
        output,
    }
}

const SPECIAL: OpClass = OpClass::Special;

const MVP: Features = Features::empty();
const SIGN_EXT: Features = Features::SIGN_EXTENSION;
const SAT: Features = Features::SAT_FLOAT_TO_INT;
const BULK: Features = Features::BULK_MEMORY;
const REFS: Features = Features::REFERENCE_TYPES;
const SIMD: Features = Features::SIMD;
const EH: Features = Features::EXCEPTIONS;
const TAIL: Features = Features::TAIL_CALL;

macro_rules! define_opcodes {
    ($($variant:ident = $code:literal => $name:literal, $class:expr, $feature:expr;)*) => {
        /// A decoded opcode.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
        #[repr(u32)]
        pub enum Opcode {
            $($variant = $code,)*
        }

        const OPCODES: &[OpInfo] = &[
            $(OpInfo {
                opcode: Opcode::$variant,
                name: $name,
                class: $class,
                feature: $feature,
            },)*
        ];
    };
}

define_opcodes! {
    // ========================================================================
    // Control
    // ========================================================================
    Unreachable = 0x00 => "unreachable", SPECIAL, MVP;
    Nop = 0x01 => "nop", SPECIAL, MVP;
    Block = 0x02 => "block", SPECIAL, MVP;
    Loop = 0x03 => "loop", SPECIAL, MVP;
    If = 0x04 => "if", SPECIAL, MVP;
    Else = 0x05 => "else", SPECIAL, MVP;
    Try = 0x06 => "try", SPECIAL, EH;
    Catch = 0x07 => "catch", SPECIAL, EH;
    Throw = 0x08 => "throw", SPECIAL, EH;
    Rethrow = 0x09 => "rethrow", SPECIAL, EH;
    End = 0x0B => "end", SPECIAL, MVP;
    Br = 0x0C => "br", SPECIAL, MVP;
    BrIf = 0x0D => "br_if", SPECIAL, MVP;
    BrTable = 0x0E => "br_table", SPECIAL, MVP;
    Return = 0x0F => "return", SPECIAL, MVP;
    Call = 0x10 => "call", SPECIAL, MVP;
    CallIndirect = 0x11 => "call_indirect", SPECIAL, MVP;
    ReturnCall = 0x12 => "return_call", SPECIAL, TAIL;
    ReturnCallIndirect = 0x13 => "return_call_indirect", SPECIAL, TAIL;
    CatchAll = 0x19 => "catch_all", SPECIAL, EH;

    // ========================================================================
    // Parametric, Variables, Tables
    // ========================================================================
    Drop = 0x1A => "drop", SPECIAL, MVP;
    Select = 0x1B => "select", SPECIAL, MVP;
    SelectWithType = 0x1C => "select", SPECIAL, REFS;
    LocalGet = 0x20 => "local.get", SPECIAL, MVP;
    LocalSet = 0x21 => "local.set", SPECIAL, MVP;
    LocalTee = 0x22 => "local.tee", SPECIAL, MVP;
    GlobalGet = 0x23 => "global.get", SPECIAL, MVP;
    GlobalSet = 0x24 => "global.set", SPECIAL, MVP;
    TableGet = 0x25 => "table.get", SPECIAL, REFS;
    TableSet = 0x26 => "table.set", SPECIAL, REFS;

    // ========================================================================
    // Memory
    // ========================================================================
    I32Load = 0x28 => "i32.load", OpClass::Load(LoadType::I32Load), MVP;
    I64Load = 0x29 => "i64.load", OpClass::Load(LoadType::I64Load), MVP;
    F32Load = 0x2A => "f32.load", OpClass::Load(LoadType::F32Load), MVP;
    F64Load = 0x2B => "f64.load", OpClass::Load(LoadType::F64Load), MVP;
    I32Load8S = 0x2C => "i32.load8_s", OpClass::Load(LoadType::I32Load8S), MVP;
    I32Load8U = 0x2D => "i32.load8_u", OpClass::Load(LoadType::I32Load8U), MVP;
    I32Load16S = 0x2E => "i32.load16_s", OpClass::Load(LoadType::I32Load16S), MVP;
    I32Load16U = 0x2F => "i32.load16_u", OpClass::Load(LoadType::I32Load16U), MVP;
    I64Load8S = 0x30 => "i64.load8_s", OpClass::Load(LoadType::I64Load8S), MVP;
    I64Load8U = 0x31 => "i64.load8_u", OpClass::Load(LoadType::I64Load8U), MVP;
    I64Load16S = 0x32 => "i64.load16_s", OpClass::Load(LoadType::I64Load16S), MVP;
    I64Load16U = 0x33 => "i64.load16_u", OpClass::Load(LoadType::I64Load16U), MVP;
    I64Load32S = 0x34 => "i64.load32_s", OpClass::Load(LoadType::I64Load32S), MVP;
    I64Load32U = 0x35 => "i64.load32_u", OpClass::Load(LoadType::I64Load32U), MVP;
    I32Store = 0x36 => "i32.store", OpClass::Store(StoreType::I32Store), MVP;
    I64Store = 0x37 => "i64.store", OpClass::Store(StoreType::I64Store), MVP;
    F32Store = 0x38 => "f32.store", OpClass::Store(StoreType::F32Store), MVP;
    F64Store = 0x39 => "f64.store", OpClass::Store(StoreType::F64Store), MVP;
    I32Store8 = 0x3A => "i32.store8", OpClass::Store(StoreType::I32Store8), MVP;
    I32Store16 = 0x3B => "i32.store16", OpClass::Store(StoreType::I32Store16), MVP;
    I64Store8 = 0x3C => "i64.store8", OpClass::Store(StoreType::I64Store8), MVP;
    I64Store16 = 0x3D => "i64.store16", OpClass::Store(StoreType::I64Store16), MVP;
    I64Store32 = 0x3E => "i64.store32", OpClass::Store(StoreType::I64Store32), MVP;
    MemorySize = 0x3F => "memory.size", SPECIAL, MVP;
    MemoryGrow = 0x40 => "memory.grow", SPECIAL, MVP;

    // ========================================================================
    // Constants
    // ========================================================================
    I32Const = 0x41 => "i32.const", SPECIAL, MVP;
    I64Const = 0x42 => "i64.const", SPECIAL, MVP;
    F32Const = 0x43 => "f32.const", SPECIAL, MVP;
    F64Const = 0x44 => "f64.const", SPECIAL, MVP;

    // ========================================================================
    // Comparisons
    // ========================================================================
    I32Eqz = 0x45 => "i32.eqz", un(I32, I32), MVP;
    I32Eq = 0x46 => "i32.eq", bin(I32, I32), MVP;
    I32Ne = 0x47 => "i32.ne", bin(I32, I32), MVP;
    I32LtS = 0x48 => "i32.lt_s", bin(I32, I32), MVP;
    I32LtU = 0x49 => "i32.lt_u", bin(I32, I32), MVP;
    I32GtS = 0x4A => "i32.gt_s", bin(I32, I32), MVP;
    I32GtU = 0x4B => "i32.gt_u", bin(I32, I32), MVP;
    I32LeS = 0x4C => "i32.le_s", bin(I32, I32), MVP;
    I32LeU = 0x4D => "i32.le_u", bin(I32, I32), MVP;
    I32GeS = 0x4E => "i32.ge_s", bin(I32, I32), MVP;
    I32GeU = 0x4F => "i32.ge_u", bin(I32, I32), MVP;
    I64Eqz = 0x50 => "i64.eqz", un(I64, I32), MVP;
    I64Eq = 0x51 => "i64.eq", bin(I64, I32), MVP;
    I64Ne = 0x52 => "i64.ne", bin(I64, I32), MVP;
    I64LtS = 0x53 => "i64.lt_s", bin(I64, I32), MVP;
    I64LtU = 0x54 => "i64.lt_u", bin(I64, I32), MVP;
    I64GtS = 0x55 => "i64.gt_s", bin(I64, I32), MVP;
    I64GtU = 0x56 => "i64.gt_u", bin(I64, I32), MVP;
    I64LeS = 0x57 => "i64.le_s", bin(I64, I32), MVP;
    I64LeU = 0x58 => "i64.le_u", bin(I64, I32), MVP;
    I64GeS = 0x59 => "i64.ge_s", bin(I64, I32), MVP;
    I64GeU = 0x5A => "i64.ge_u", bin(I64, I32), MVP;
    F32Eq = 0x5B => "f32.eq", bin(F32, I32), MVP;
    F32Ne = 0x5C => "f32.ne", bin(F32, I32), MVP;
    F32Lt = 0x5D => "f32.lt", bin(F32, I32), MVP;
    F32Gt = 0x5E => "f32.gt", bin(F32, I32), MVP;
    F32Le = 0x5F => "f32.le", bin(F32, I32), MVP;
    F32Ge = 0x60 => "f32.ge", bin(F32, I32), MVP;
    F64Eq = 0x61 => "f64.eq", bin(F64, I32), MVP;
    F64Ne = 0x62 => "f64.ne", bin(F64, I32), MVP;
    F64Lt = 0x63 => "f64.lt", bin(F64, I32), MVP;
    F64Gt = 0x64 => "f64.gt", bin(F64, I32), MVP;
    F64Le = 0x65 => "f64.le", bin(F64, I32), MVP;
    F64Ge = 0x66 => "f64.ge", bin(F64, I32), MVP;

    // ========================================================================
    // Integer Arithmetic
    // ========================================================================
    I32Clz = 0x67 => "i32.clz", un(I32, I32), MVP;
    I32Ctz = 0x68 => "i32.ctz", un(I32, I32), MVP;
    I32Popcnt = 0x69 => "i32.popcnt", un(I32, I32), MVP;
    I32Add = 0x6A => "i32.add", bin(I32, I32), MVP;
    I32Sub = 0x6B => "i32.sub", bin(I32, I32), MVP;
    I32Mul = 0x6C => "i32.mul", bin(I32, I32), MVP;
    I32DivS = 0x6D => "i32.div_s", bin(I32, I32), MVP;
    I32DivU = 0x6E => "i32.div_u", bin(I32, I32), MVP;
    I32RemS = 0x6F => "i32.rem_s", bin(I32, I32), MVP;
    I32RemU = 0x70 => "i32.rem_u", bin(I32, I32), MVP;
    I32And = 0x71 => "i32.and", bin(I32, I32), MVP;
    I32Or = 0x72 => "i32.or", bin(I32, I32), MVP;
    I32Xor = 0x73 => "i32.xor", bin(I32, I32), MVP;
    I32Shl = 0x74 => "i32.shl", bin(I32, I32), MVP;
    I32ShrS = 0x75 => "i32.shr_s", bin(I32, I32), MVP;
    I32ShrU = 0x76 => "i32.shr_u", bin(I32, I32), MVP;
    I32Rotl = 0x77 => "i32.rotl", bin(I32, I32), MVP;
    I32Rotr = 0x78 => "i32.rotr", bin(I32, I32), MVP;
    I64Clz = 0x79 => "i64.clz", un(I64, I64), MVP;
    I64Ctz = 0x7A => "i64.ctz", un(I64, I64), MVP;
    I64Popcnt = 0x7B => "i64.popcnt", un(I64, I64), MVP;
    I64Add = 0x7C => "i64.add", bin(I64, I64), MVP;
    I64Sub = 0x7D => "i64.sub", bin(I64, I64), MVP;
    I64Mul = 0x7E => "i64.mul", bin(I64, I64), MVP;
    I64DivS = 0x7F => "i64.div_s", bin(I64, I64), MVP;
    I64DivU = 0x80 => "i64.div_u", bin(I64, I64), MVP;
    I64RemS = 0x81 => "i64.rem_s", bin(I64, I64), MVP;
    I64RemU = 0x82 => "i64.rem_u", bin(I64, I64), MVP;
    I64And = 0x83 => "i64.and", bin(I64, I64), MVP;
    I64Or = 0x84 => "i64.or", bin(I64, I64), MVP;
    I64Xor = 0x85 => "i64.xor", bin(I64, I64), MVP;
    I64Shl = 0x86 => "i64.shl", bin(I64, I64), MVP;
    I64ShrS = 0x87 => "i64.shr_s", bin(I64, I64), MVP;
    I64ShrU = 0x88 => "i64.shr_u", bin(I64, I64), MVP;
    I64Rotl = 0x89 => "i64.rotl", bin(I64, I64), MVP;
    I64Rotr = 0x8A => "i64.rotr", bin(I64, I64), MVP;

    // ========================================================================
    // Float Arithmetic
    // ========================================================================
    F32Abs = 0x8B => "f32.abs", un(F32, F32), MVP;
    F32Neg = 0x8C => "f32.neg", un(F32, F32), MVP;
    F32Ceil = 0x8D => "f32.ceil", un(F32, F32), MVP;
    F32Floor = 0x8E => "f32.floor", un(F32, F32), MVP;
    F32Trunc = 0x8F => "f32.trunc", un(F32, F32), MVP;
    F32Nearest = 0x90 => "f32.nearest", un(F32, F32), MVP;
    F32Sqrt = 0x91 => "f32.sqrt", un(F32, F32), MVP;
    F32Add = 0x92 => "f32.add", bin(F32, F32), MVP;
    F32Sub = 0x93 => "f32.sub", bin(F32, F32), MVP;
    F32Mul = 0x94 => "f32.mul", bin(F32, F32), MVP;
    F32Div = 0x95 => "f32.div", bin(F32, F32), MVP;
    F32Min = 0x96 => "f32.min", bin(F32, F32), MVP;
    F32Max = 0x97 => "f32.max", bin(F32, F32), MVP;
    F32CopySign = 0x98 => "f32.copysign", bin(F32, F32), MVP;
    F64Abs = 0x99 => "f64.abs", un(F64, F64), MVP;
    F64Neg = 0x9A => "f64.neg", un(F64, F64), MVP;
    F64Ceil = 0x9B => "f64.ceil", un(F64, F64), MVP;
    F64Floor = 0x9C => "f64.floor", un(F64, F64), MVP;
    F64Trunc = 0x9D => "f64.trunc", un(F64, F64), MVP;
    F64Nearest = 0x9E => "f64.nearest", un(F64, F64), MVP;
    F64Sqrt = 0x9F => "f64.sqrt", un(F64, F64), MVP;
    F64Add = 0xA0 => "f64.add", bin(F64, F64), MVP;
    F64Sub = 0xA1 => "f64.sub", bin(F64, F64), MVP;
    F64Mul = 0xA2 => "f64.mul", bin(F64, F64), MVP;
    F64Div = 0xA3 => "f64.div", bin(F64, F64), MVP;
    F64Min = 0xA4 => "f64.min", bin(F64, F64), MVP;
    F64Max = 0xA5 => "f64.max", bin(F64, F64), MVP;
    F64CopySign = 0xA6 => "f64.copysign", bin(F64, F64), MVP;

    // ========================================================================
    // Conversions
    // ========================================================================
    I32WrapI64 = 0xA7 => "i32.wrap_i64", un(I64, I32), MVP;
    I32TruncF32S = 0xA8 => "i32.trunc_f32_s", un(F32, I32), MVP;
    I32TruncF32U = 0xA9 => "i32.trunc_f32_u", un(F32, I32), MVP;
    I32TruncF64S = 0xAA => "i32.trunc_f64_s", un(F64, I32), MVP;
    I32TruncF64U = 0xAB => "i32.trunc_f64_u", un(F64, I32), MVP;
    I64ExtendI32S = 0xAC => "i64.extend_i32_s", un(I32, I64), MVP;
    I64ExtendI32U = 0xAD => "i64.extend_i32_u", un(I32, I64), MVP;
    I64TruncF32S = 0xAE => "i64.trunc_f32_s", un(F32, I64), MVP;
    I64TruncF32U = 0xAF => "i64.trunc_f32_u", un(F32, I64), MVP;
    I64TruncF64S = 0xB0 => "i64.trunc_f64_s", un(F64, I64), MVP;
    I64TruncF64U = 0xB1 => "i64.trunc_f64_u", un(F64, I64), MVP;
    F32ConvertI32S = 0xB2 => "f32.convert_i32_s", un(I32, F32), MVP;
    F32ConvertI32U = 0xB3 => "f32.convert_i32_u", un(I32, F32), MVP;
    F32ConvertI64S = 0xB4 => "f32.convert_i64_s", un(I64, F32), MVP;
    F32ConvertI64U = 0xB5 => "f32.convert_i64_u", un(I64, F32), MVP;
    F32DemoteF64 = 0xB6 => "f32.demote_f64", un(F64, F32), MVP;
    F64ConvertI32S = 0xB7 => "f64.convert_i32_s", un(I32, F64), MVP;
    F64ConvertI32U = 0xB8 => "f64.convert_i32_u", un(I32, F64), MVP;
    F64ConvertI64S = 0xB9 => "f64.convert_i64_s", un(I64, F64), MVP;
    F64ConvertI64U = 0xBA => "f64.convert_i64_u", un(I64, F64), MVP;
    F64PromoteF32 = 0xBB => "f64.promote_f32", un(F32, F64), MVP;
    I32ReinterpretF32 = 0xBC => "i32.reinterpret_f32", un(F32, I32), MVP;
    I64ReinterpretF64 = 0xBD => "i64.reinterpret_f64", un(F64, I64), MVP;
    F32ReinterpretI32 = 0xBE => "f32.reinterpret_i32", un(I32, F32), MVP;
    F64ReinterpretI64 = 0xBF => "f64.reinterpret_i64", un(I64, F64), MVP;
    I32Extend8S = 0xC0 => "i32.extend8_s", un(I32, I32), SIGN_EXT;
    I32Extend16S = 0xC1 => "i32.extend16_s", un(I32, I32), SIGN_EXT;
    I64Extend8S = 0xC2 => "i64.extend8_s", un(I64, I64), SIGN_EXT;
    I64Extend16S = 0xC3 => "i64.extend16_s", un(I64, I64), SIGN_EXT;
    I64Extend32S = 0xC4 => "i64.extend32_s", un(I64, I64), SIGN_EXT;

    // ========================================================================
    // Reference Types
    // ========================================================================
    RefNull = 0xD0 => "ref.null", SPECIAL, REFS;
    RefIsNull = 0xD1 => "ref.is_null", SPECIAL, REFS;
    RefFunc = 0xD2 => "ref.func", SPECIAL, REFS;

    // ========================================================================
    // 0xFC Prefix: Saturating Truncation, Bulk Memory, Tables
    // ========================================================================
    I32TruncSatF32S = 0xFC00 => "i32.trunc_sat_f32_s", un(F32, I32), SAT;
    I32TruncSatF32U = 0xFC01 => "i32.trunc_sat_f32_u", un(F32, I32), SAT;
    I32TruncSatF64S = 0xFC02 => "i32.trunc_sat_f64_s", un(F64, I32), SAT;
    I32TruncSatF64U = 0xFC03 => "i32.trunc_sat_f64_u", un(F64, I32), SAT;
    I64TruncSatF32S = 0xFC04 => "i64.trunc_sat_f32_s", un(F32, I64), SAT;
    I64TruncSatF32U = 0xFC05 => "i64.trunc_sat_f32_u", un(F32, I64), SAT;
    I64TruncSatF64S = 0xFC06 => "i64.trunc_sat_f64_s", un(F64, I64), SAT;
    I64TruncSatF64U = 0xFC07 => "i64.trunc_sat_f64_u", un(F64, I64), SAT;
    MemoryInit = 0xFC08 => "memory.init", SPECIAL, BULK;
    DataDrop = 0xFC09 => "data.drop", SPECIAL, BULK;
    MemoryCopy = 0xFC0A => "memory.copy", SPECIAL, BULK;
    MemoryFill = 0xFC0B => "memory.fill", SPECIAL, BULK;
    TableInit = 0xFC0C => "table.init", SPECIAL, BULK;
    ElemDrop = 0xFC0D => "elem.drop", SPECIAL, BULK;
    TableCopy = 0xFC0E => "table.copy", SPECIAL, BULK;
    TableGrow = 0xFC0F => "table.grow", SPECIAL, REFS;
    TableSize = 0xFC10 => "table.size", SPECIAL, REFS;
    TableFill = 0xFC11 => "table.fill", SPECIAL, REFS;

    // ========================================================================
    // 0xFD Prefix: Vectors
    // ========================================================================
    V128Load = 0xFD00 => "v128.load", OpClass::Load(LoadType::V128Load), SIMD;
    V128Store = 0xFD0B => "v128.store", OpClass::Store(StoreType::V128Store), SIMD;
    V128Const = 0xFD0C => "v128.const", SPECIAL, SIMD;
    I8x16Splat = 0xFD0F => "i8x16.splat", un(I32, V128), SIMD;
    I32x4Splat = 0xFD11 => "i32x4.splat", un(I32, V128), SIMD;
    F32x4Splat = 0xFD13 => "f32x4.splat", un(F32, V128), SIMD;
    I32x4ExtractLane = 0xFD1B => "i32x4.extract_lane", SPECIAL, SIMD;
    I32x4ReplaceLane = 0xFD1C => "i32x4.replace_lane", SPECIAL, SIMD;
    V128Not = 0xFD4D => "v128.not", un(V128, V128), SIMD;
    V128And = 0xFD4E => "v128.and", bin(V128, V128), SIMD;
    V128Or = 0xFD50 => "v128.or", bin(V128, V128), SIMD;
    V128Xor = 0xFD51 => "v128.xor", bin(V128, V128), SIMD;
    I8x16Add = 0xFD6E => "i8x16.add", bin(V128, V128), SIMD;
    I32x4Add = 0xFDAE => "i32x4.add", bin(V128, V128), SIMD;
    I32x4Sub = 0xFDB1 => "i32x4.sub", bin(V128, V128), SIMD;
    I32x4Mul = 0xFDB5 => "i32x4.mul", bin(V128, V128), SIMD;
    F32x4Add = 0xFDE4 => "f32x4.add", bin(V128, V128), SIMD;
}

const fn build_single_byte_table() -> [Option<OpInfo>; 256] {
    let mut table = [None; 256];
    let mut i = 0;
    while i < OPCODES.len() {
        let info = OPCODES[i];
        let code = info.opcode as u32;
        if code < 0x100 {
            table[code as usize] = Some(info);
        }
        i += 1;
    }
    table
}

static SINGLE_BYTE: [Option<OpInfo>; 256] = build_single_byte_table();

static PREFIXED: LazyLock<FxHashMap<u32, OpInfo>> = LazyLock::new(|| {
    OPCODES
        .iter()
        .filter(|info| u32::from(info.opcode) > 0xFF)
        .map(|info| (u32::from(info.opcode), *info))
        .collect()
});

/// Look up an opcode by its numeric identifier.
pub fn lookup(code: u32) -> Option<&'static OpInfo> {
    if code < 0x100 {
        SINGLE_BYTE[code as usize].as_ref()
    } else {
        PREFIXED.get(&code)
    }
}

/// `true` for bytes that introduce a multi-byte opcode.
#[inline]
pub fn is_prefix(byte: u8) -> bool {
    byte == PREFIX_NUMERIC || byte == PREFIX_SIMD
}

impl Opcode {
    #[inline]
    pub fn code(self) -> u32 {
        self.into()
    }

    pub fn info(self) -> Option<&'static OpInfo> {
        lookup(self.code())
    }

    pub fn name(self) -> &'static str {
        self.info().map_or("<unknown>", |info| info.name)
    }

    /// The prefix byte, for multi-byte opcodes.
    pub fn prefix(self) -> Option<u8> {
        let code = self.code();
        (code > 0xFF).then_some((code >> 8) as u8)
    }

    /// Two-operand integer and float comparisons.
    pub fn is_comparison(self) -> bool {
        matches!(self.code(), 0x46..=0x4F | 0x51..=0x66)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
