//! Instruction set of the abstract target machine.
//!
//! Every instruction starts with a one-byte [`MachineOp`] followed by its
//! fixed-width operands in little-endian order. Instructions with a branch
//! target end in a 32-bit displacement relative to the end of the
//! instruction, so a label can be patched without knowing the opcode.
//!
//! Integer values of type `i32` live zero-extended in 64-bit registers.

use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use skiff_core::ValueType;
use skiff_decoder::{LoadType, Opcode, StoreType};
use thiserror::Error;

use crate::register::{NO_REG, Reg, RegList};

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MachineOp {
    EnterFrame = 0x01,
    LeaveFrame,
    Ret,
    Move,
    LoadConst,
    Spill,
    SpillConst,
    Fill,
    MoveStackValue,
    FillStackSlotsWithZero,
    LoadInstanceField,
    LoadStackArg,
    StoreStackArg,
    Load,
    Store,
    UnOp,
    UnOpTrapping,
    BinOp,
    BinOpImm,
    Jump,
    CondJump,
    CondJumpImm,
    StackCheck,
    Call,
    CallIndirect,
    CallRuntimeStub,
    PushRegisters,
    PopRegisters,
    AssertUnreachable,
}

/// Branch conditions. The `Below`/`Above` family compares unsigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Cond {
    Equal,
    NotEqual,
    LessThan,
    LessEqual,
    GreaterThan,
    GreaterEqual,
    Below,
    BelowEqual,
    Above,
    AboveEqual,
}

impl Cond {
    pub fn negate(self) -> Cond {
        match self {
            Cond::Equal => Cond::NotEqual,
            Cond::NotEqual => Cond::Equal,
            Cond::LessThan => Cond::GreaterEqual,
            Cond::LessEqual => Cond::GreaterThan,
            Cond::GreaterThan => Cond::LessEqual,
            Cond::GreaterEqual => Cond::LessThan,
            Cond::Below => Cond::AboveEqual,
            Cond::BelowEqual => Cond::Above,
            Cond::Above => Cond::BelowEqual,
            Cond::AboveEqual => Cond::Below,
        }
    }

    /// The condition computed by an `i32` comparison opcode.
    pub fn for_i32_comparison(op: Opcode) -> Option<Cond> {
        Some(match op {
            Opcode::I32Eq => Cond::Equal,
            Opcode::I32Ne => Cond::NotEqual,
            Opcode::I32LtS => Cond::LessThan,
            Opcode::I32LtU => Cond::Below,
            Opcode::I32GtS => Cond::GreaterThan,
            Opcode::I32GtU => Cond::Above,
            Opcode::I32LeS => Cond::LessEqual,
            Opcode::I32LeU => Cond::BelowEqual,
            Opcode::I32GeS => Cond::GreaterEqual,
            Opcode::I32GeU => Cond::AboveEqual,
            _ => return None,
        })
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Cond::Equal => "eq",
            Cond::NotEqual => "ne",
            Cond::LessThan => "lt",
            Cond::LessEqual => "le",
            Cond::GreaterThan => "gt",
            Cond::GreaterEqual => "ge",
            Cond::Below => "b",
            Cond::BelowEqual => "be",
            Cond::Above => "a",
            Cond::AboveEqual => "ae",
        }
    }
}

/// Fields of the instance object reachable from [`INSTANCE_REG`](crate::register::INSTANCE_REG).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum InstanceField {
    MemoryStart,
    /// Current memory size in bytes.
    MemorySize,
    /// Next power of two of the memory size, minus one.
    MemoryMask,
    StackLimitAddress,
    GlobalsStart,
    /// Table of pointers to imported mutable globals.
    ImportedMutableGlobals,
    ImportedFunctionTargets,
    ImportedFunctionRefs,
    IndirectFunctionTableSize,
    IndirectFunctionTableSigIds,
    IndirectFunctionTableTargets,
    IndirectFunctionTableRefs,
}

/// Entry points into the runtime. Trap stubs never return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum RuntimeStub {
    TrapUnreachable,
    TrapMemOutOfBounds,
    TrapDivByZero,
    TrapRemByZero,
    TrapDivUnrepresentable,
    TrapFloatUnrepresentable,
    TrapTableOutOfBounds,
    TrapFuncSigMismatch,
    StackGuard,
    DebugBreak,
    TraceEnter,
    MemoryGrow,
    MemoryInit,
    DataDrop,
    MemoryCopy,
    MemoryFill,
    TableInit,
    ElemDrop,
    TableCopy,
}

impl RuntimeStub {
    pub fn is_trap(self) -> bool {
        matches!(
            self,
            RuntimeStub::TrapUnreachable
                | RuntimeStub::TrapMemOutOfBounds
                | RuntimeStub::TrapDivByZero
                | RuntimeStub::TrapRemByZero
                | RuntimeStub::TrapDivUnrepresentable
                | RuntimeStub::TrapFloatUnrepresentable
                | RuntimeStub::TrapTableOutOfBounds
                | RuntimeStub::TrapFuncSigMismatch
        )
    }
}

// ============================================================================
// Instructions
// ============================================================================

/// One machine instruction.
///
/// `L` is the branch-target type: [`Label`](super::Label) while assembling,
/// an absolute code offset after [`Instr::decode`].
///
/// Stack-slot offsets count bytes downwards from the frame pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instr<L> {
    /// Set up a frame of `frame_size` bytes below the frame pointer.
    EnterFrame { frame_size: u32 },
    LeaveFrame,
    Ret,
    Move { ty: ValueType, dst: Reg, src: Reg },
    LoadConst { ty: ValueType, dst: Reg, bits: u64 },
    Spill {
        ty: ValueType,
        offset: u32,
        src: Reg,
    },
    /// Integer constant, sign-extended for 64-bit slots.
    SpillConst {
        ty: ValueType,
        offset: u32,
        value: i32,
    },
    Fill {
        ty: ValueType,
        dst: Reg,
        offset: u32,
    },
    MoveStackValue {
        ty: ValueType,
        dst_offset: u32,
        src_offset: u32,
    },
    /// Zero the `size` bytes below `fp - start`.
    FillStackSlotsWithZero { start: u32, size: u32 },
    LoadInstanceField { dst: Reg, field: InstanceField },
    /// Read an incoming argument passed on the stack.
    LoadStackArg { ty: ValueType, dst: Reg, index: u32 },
    /// Write an outgoing argument passed on the stack.
    StoreStackArg { ty: ValueType, index: u32, src: Reg },
    /// `dst = *(base + zext(index) + offset)`
    Load {
        ty: LoadType,
        dst: Reg,
        base: Reg,
        index: Option<Reg>,
        offset: u32,
    },
    Store {
        ty: StoreType,
        base: Reg,
        index: Option<Reg>,
        offset: u32,
        src: Reg,
    },
    UnOp { op: Opcode, dst: Reg, src: Reg },
    /// A conversion that branches to `trap` when the result is not representable.
    UnOpTrapping {
        op: Opcode,
        dst: Reg,
        src: Reg,
        trap: L,
    },
    BinOp {
        op: Opcode,
        dst: Reg,
        lhs: Reg,
        rhs: Reg,
    },
    BinOpImm {
        op: Opcode,
        dst: Reg,
        lhs: Reg,
        imm: i32,
    },
    Jump { target: L },
    /// Compares `lhs` with `rhs`, or with zero when `rhs` is `None`.
    CondJump {
        cond: Cond,
        ty: ValueType,
        lhs: Reg,
        rhs: Option<Reg>,
        target: L,
    },
    CondJumpImm {
        cond: Cond,
        ty: ValueType,
        lhs: Reg,
        imm: i64,
        target: L,
    },
    /// Branches to `target` when the stack pointer is below `*limit`.
    StackCheck { limit: Reg, target: L },
    /// Direct call. The index is a placeholder patched at link time.
    Call { func_index: u32 },
    CallIndirect { target: Reg },
    CallRuntimeStub { stub: RuntimeStub },
    PushRegisters { regs: RegList },
    PopRegisters { regs: RegList },
    AssertUnreachable,
}

impl<L: Copy> Instr<L> {
    pub fn op(&self) -> MachineOp {
        match self {
            Instr::EnterFrame { .. } => MachineOp::EnterFrame,
            Instr::LeaveFrame => MachineOp::LeaveFrame,
            Instr::Ret => MachineOp::Ret,
            Instr::Move { .. } => MachineOp::Move,
            Instr::LoadConst { .. } => MachineOp::LoadConst,
            Instr::Spill { .. } => MachineOp::Spill,
            Instr::SpillConst { .. } => MachineOp::SpillConst,
            Instr::Fill { .. } => MachineOp::Fill,
            Instr::MoveStackValue { .. } => MachineOp::MoveStackValue,
            Instr::FillStackSlotsWithZero { .. } => MachineOp::FillStackSlotsWithZero,
            Instr::LoadInstanceField { .. } => MachineOp::LoadInstanceField,
            Instr::LoadStackArg { .. } => MachineOp::LoadStackArg,
            Instr::StoreStackArg { .. } => MachineOp::StoreStackArg,
            Instr::Load { .. } => MachineOp::Load,
            Instr::Store { .. } => MachineOp::Store,
            Instr::UnOp { .. } => MachineOp::UnOp,
            Instr::UnOpTrapping { .. } => MachineOp::UnOpTrapping,
            Instr::BinOp { .. } => MachineOp::BinOp,
            Instr::BinOpImm { .. } => MachineOp::BinOpImm,
            Instr::Jump { .. } => MachineOp::Jump,
            Instr::CondJump { .. } => MachineOp::CondJump,
            Instr::CondJumpImm { .. } => MachineOp::CondJumpImm,
            Instr::StackCheck { .. } => MachineOp::StackCheck,
            Instr::Call { .. } => MachineOp::Call,
            Instr::CallIndirect { .. } => MachineOp::CallIndirect,
            Instr::CallRuntimeStub { .. } => MachineOp::CallRuntimeStub,
            Instr::PushRegisters { .. } => MachineOp::PushRegisters,
            Instr::PopRegisters { .. } => MachineOp::PopRegisters,
            Instr::AssertUnreachable => MachineOp::AssertUnreachable,
        }
    }

    /// The branch target, for instructions that have one.
    pub fn target(&self) -> Option<L> {
        match *self {
            Instr::UnOpTrapping { trap, .. } => Some(trap),
            Instr::Jump { target }
            | Instr::CondJump { target, .. }
            | Instr::CondJumpImm { target, .. }
            | Instr::StackCheck { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Append the encoding to `out`. A branch target is written as a zero
    /// displacement for the assembler to patch.
    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        let mut w = Writer(out);
        w.u8(self.op().into());
        match *self {
            Instr::EnterFrame { frame_size } => w.u32(frame_size),
            Instr::LeaveFrame | Instr::Ret | Instr::AssertUnreachable => {}
            Instr::Move { ty, dst, src } => {
                w.ty(ty);
                w.reg(dst);
                w.reg(src);
            }
            Instr::LoadConst { ty, dst, bits } => {
                w.ty(ty);
                w.reg(dst);
                w.u64(bits);
            }
            Instr::Spill { ty, offset, src } => {
                w.ty(ty);
                w.u32(offset);
                w.reg(src);
            }
            Instr::SpillConst { ty, offset, value } => {
                w.ty(ty);
                w.u32(offset);
                w.u32(value as u32);
            }
            Instr::Fill { ty, dst, offset } => {
                w.ty(ty);
                w.reg(dst);
                w.u32(offset);
            }
            Instr::MoveStackValue {
                ty,
                dst_offset,
                src_offset,
            } => {
                w.ty(ty);
                w.u32(dst_offset);
                w.u32(src_offset);
            }
            Instr::FillStackSlotsWithZero { start, size } => {
                w.u32(start);
                w.u32(size);
            }
            Instr::LoadInstanceField { dst, field } => {
                w.reg(dst);
                w.u8(field.into());
            }
            Instr::LoadStackArg { ty, dst, index } => {
                w.ty(ty);
                w.reg(dst);
                w.u32(index);
            }
            Instr::StoreStackArg { ty, index, src } => {
                w.ty(ty);
                w.u32(index);
                w.reg(src);
            }
            Instr::Load {
                ty,
                dst,
                base,
                index,
                offset,
            } => {
                w.u8(ty.into());
                w.reg(dst);
                w.reg(base);
                w.opt_reg(index);
                w.u32(offset);
            }
            Instr::Store {
                ty,
                base,
                index,
                offset,
                src,
            } => {
                w.u8(ty.into());
                w.reg(base);
                w.opt_reg(index);
                w.u32(offset);
                w.reg(src);
            }
            Instr::UnOp { op, dst, src } => {
                w.u32(op.into());
                w.reg(dst);
                w.reg(src);
            }
            Instr::UnOpTrapping { op, dst, src, .. } => {
                w.u32(op.into());
                w.reg(dst);
                w.reg(src);
                w.u32(0);
            }
            Instr::BinOp { op, dst, lhs, rhs } => {
                w.u32(op.into());
                w.reg(dst);
                w.reg(lhs);
                w.reg(rhs);
            }
            Instr::BinOpImm { op, dst, lhs, imm } => {
                w.u32(op.into());
                w.reg(dst);
                w.reg(lhs);
                w.u32(imm as u32);
            }
            Instr::Jump { .. } => w.u32(0),
            Instr::CondJump { cond, ty, lhs, rhs, .. } => {
                w.u8(cond.into());
                w.ty(ty);
                w.reg(lhs);
                w.opt_reg(rhs);
                w.u32(0);
            }
            Instr::CondJumpImm { cond, ty, lhs, imm, .. } => {
                w.u8(cond.into());
                w.ty(ty);
                w.reg(lhs);
                w.u64(imm as u64);
                w.u32(0);
            }
            Instr::StackCheck { limit, .. } => {
                w.reg(limit);
                w.u32(0);
            }
            Instr::Call { func_index } => w.u32(func_index),
            Instr::CallIndirect { target } => w.reg(target),
            Instr::CallRuntimeStub { stub } => w.u8(stub.into()),
            Instr::PushRegisters { regs } | Instr::PopRegisters { regs } => w.u32(regs.bits()),
        }
    }
}

struct Writer<'a>(&'a mut Vec<u8>);

impl Writer<'_> {
    fn u8(&mut self, value: u8) {
        self.0.push(value);
    }

    fn u32(&mut self, value: u32) {
        self.0.extend_from_slice(&value.to_le_bytes());
    }

    fn u64(&mut self, value: u64) {
        self.0.extend_from_slice(&value.to_le_bytes());
    }

    fn reg(&mut self, reg: Reg) {
        self.0.push(reg.code());
    }

    fn opt_reg(&mut self, reg: Option<Reg>) {
        self.0.push(reg.map_or(NO_REG, Reg::code));
    }

    fn ty(&mut self, ty: ValueType) {
        self.0.push(ty.code().unwrap_or(0));
    }
}

// ============================================================================
// Decoding
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DisasmError {
    #[error("truncated instruction at offset {0}")]
    Truncated(usize),
    #[error("unknown machine opcode {op:#04x} at offset {offset}")]
    UnknownOp { op: u8, offset: usize },
    #[error("invalid operand in instruction at offset {0}")]
    InvalidOperand(usize),
}

struct Cursor<'a> {
    code: &'a [u8],
    pos: usize,
    start: usize,
}

impl Cursor<'_> {
    fn bytes<const N: usize>(&mut self) -> Result<[u8; N], DisasmError> {
        let end = self.pos + N;
        let bytes = self
            .code
            .get(self.pos..end)
            .ok_or(DisasmError::Truncated(self.start))?;
        self.pos = end;
        let mut out = [0; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DisasmError> {
        Ok(self.bytes::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32, DisasmError> {
        Ok(u32::from_le_bytes(self.bytes()?))
    }

    fn u64(&mut self) -> Result<u64, DisasmError> {
        Ok(u64::from_le_bytes(self.bytes()?))
    }

    fn invalid(&self) -> DisasmError {
        DisasmError::InvalidOperand(self.start)
    }

    fn reg(&mut self) -> Result<Reg, DisasmError> {
        let code = self.u8()?;
        Reg::from_code(code).ok_or_else(|| self.invalid())
    }

    fn opt_reg(&mut self) -> Result<Option<Reg>, DisasmError> {
        match self.u8()? {
            NO_REG => Ok(None),
            code => Reg::from_code(code).map(Some).ok_or_else(|| self.invalid()),
        }
    }

    fn ty(&mut self) -> Result<ValueType, DisasmError> {
        let code = self.u8()?;
        ValueType::from_code(code).ok_or_else(|| self.invalid())
    }

    fn enum_u8<T: TryFrom<u8>>(&mut self) -> Result<T, DisasmError> {
        let byte = self.u8()?;
        T::try_from(byte).map_err(|_| self.invalid())
    }

    fn opcode(&mut self) -> Result<Opcode, DisasmError> {
        let code = self.u32()?;
        Opcode::try_from(code).map_err(|_| self.invalid())
    }

    /// Reads the trailing displacement and resolves it to an absolute offset.
    fn target(&mut self) -> Result<u32, DisasmError> {
        let rel = self.u32()? as i32;
        let target = self.pos as i64 + i64::from(rel);
        u32::try_from(target).map_err(|_| self.invalid())
    }
}

impl Instr<u32> {
    /// Decode the instruction at `offset`. Returns it with its length.
    pub fn decode(code: &[u8], offset: usize) -> Result<(Instr<u32>, usize), DisasmError> {
        let mut c = Cursor {
            code,
            pos: offset,
            start: offset,
        };
        let byte = c.u8()?;
        let op = MachineOp::try_from(byte)
            .map_err(|_| DisasmError::UnknownOp { op: byte, offset })?;
        let instr = match op {
            MachineOp::EnterFrame => Instr::EnterFrame {
                frame_size: c.u32()?,
            },
            MachineOp::LeaveFrame => Instr::LeaveFrame,
            MachineOp::Ret => Instr::Ret,
            MachineOp::Move => Instr::Move {
                ty: c.ty()?,
                dst: c.reg()?,
                src: c.reg()?,
            },
            MachineOp::LoadConst => Instr::LoadConst {
                ty: c.ty()?,
                dst: c.reg()?,
                bits: c.u64()?,
            },
            MachineOp::Spill => Instr::Spill {
                ty: c.ty()?,
                offset: c.u32()?,
                src: c.reg()?,
            },
            MachineOp::SpillConst => Instr::SpillConst {
                ty: c.ty()?,
                offset: c.u32()?,
                value: c.u32()? as i32,
            },
            MachineOp::Fill => Instr::Fill {
                ty: c.ty()?,
                dst: c.reg()?,
                offset: c.u32()?,
            },
            MachineOp::MoveStackValue => Instr::MoveStackValue {
                ty: c.ty()?,
                dst_offset: c.u32()?,
                src_offset: c.u32()?,
            },
            MachineOp::FillStackSlotsWithZero => Instr::FillStackSlotsWithZero {
                start: c.u32()?,
                size: c.u32()?,
            },
            MachineOp::LoadInstanceField => Instr::LoadInstanceField {
                dst: c.reg()?,
                field: c.enum_u8()?,
            },
            MachineOp::LoadStackArg => Instr::LoadStackArg {
                ty: c.ty()?,
                dst: c.reg()?,
                index: c.u32()?,
            },
            MachineOp::StoreStackArg => Instr::StoreStackArg {
                ty: c.ty()?,
                index: c.u32()?,
                src: c.reg()?,
            },
            MachineOp::Load => Instr::Load {
                ty: c.enum_u8()?,
                dst: c.reg()?,
                base: c.reg()?,
                index: c.opt_reg()?,
                offset: c.u32()?,
            },
            MachineOp::Store => Instr::Store {
                ty: c.enum_u8()?,
                base: c.reg()?,
                index: c.opt_reg()?,
                offset: c.u32()?,
                src: c.reg()?,
            },
            MachineOp::UnOp => Instr::UnOp {
                op: c.opcode()?,
                dst: c.reg()?,
                src: c.reg()?,
            },
            MachineOp::UnOpTrapping => Instr::UnOpTrapping {
                op: c.opcode()?,
                dst: c.reg()?,
                src: c.reg()?,
                trap: c.target()?,
            },
            MachineOp::BinOp => Instr::BinOp {
                op: c.opcode()?,
                dst: c.reg()?,
                lhs: c.reg()?,
                rhs: c.reg()?,
            },
            MachineOp::BinOpImm => Instr::BinOpImm {
                op: c.opcode()?,
                dst: c.reg()?,
                lhs: c.reg()?,
                imm: c.u32()? as i32,
            },
            MachineOp::Jump => Instr::Jump {
                target: c.target()?,
            },
            MachineOp::CondJump => Instr::CondJump {
                cond: c.enum_u8()?,
                ty: c.ty()?,
                lhs: c.reg()?,
                rhs: c.opt_reg()?,
                target: c.target()?,
            },
            MachineOp::CondJumpImm => Instr::CondJumpImm {
                cond: c.enum_u8()?,
                ty: c.ty()?,
                lhs: c.reg()?,
                imm: c.u64()? as i64,
                target: c.target()?,
            },
            MachineOp::StackCheck => Instr::StackCheck {
                limit: c.reg()?,
                target: c.target()?,
            },
            MachineOp::Call => Instr::Call {
                func_index: c.u32()?,
            },
            MachineOp::CallIndirect => Instr::CallIndirect { target: c.reg()? },
            MachineOp::CallRuntimeStub => Instr::CallRuntimeStub { stub: c.enum_u8()? },
            MachineOp::PushRegisters => Instr::PushRegisters {
                regs: RegList::from_bits(c.u32()?),
            },
            MachineOp::PopRegisters => Instr::PopRegisters {
                regs: RegList::from_bits(c.u32()?),
            },
            MachineOp::AssertUnreachable => Instr::AssertUnreachable,
        };
        Ok((instr, c.pos - offset))
    }
}

/// Decode a whole code buffer into `(offset, instruction)` pairs.
pub fn disassemble(code: &[u8]) -> Result<Vec<(u32, Instr<u32>)>, DisasmError> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < code.len() {
        let (instr, len) = Instr::decode(code, offset)?;
        out.push((offset as u32, instr));
        offset += len;
    }
    Ok(out)
}

fn opt(reg: &Option<Reg>) -> String {
    reg.map_or_else(|| "-".to_string(), |r| r.to_string())
}

impl<L: fmt::Display> fmt::Display for Instr<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::EnterFrame { frame_size } => write!(f, "enter_frame {frame_size}"),
            Instr::LeaveFrame => f.write_str("leave_frame"),
            Instr::Ret => f.write_str("ret"),
            Instr::Move { ty, dst, src } => write!(f, "move.{ty} {dst}, {src}"),
            Instr::LoadConst { ty, dst, bits } => write!(f, "load_const.{ty} {dst}, {bits:#x}"),
            Instr::Spill { ty, offset, src } => write!(f, "spill.{ty} [fp-{offset}], {src}"),
            Instr::SpillConst { ty, offset, value } => {
                write!(f, "spill_const.{ty} [fp-{offset}], {value}")
            }
            Instr::Fill { ty, dst, offset } => write!(f, "fill.{ty} {dst}, [fp-{offset}]"),
            Instr::MoveStackValue {
                ty,
                dst_offset,
                src_offset,
            } => write!(f, "move_stack.{ty} [fp-{dst_offset}], [fp-{src_offset}]"),
            Instr::FillStackSlotsWithZero { start, size } => {
                write!(f, "zero_slots [fp-{start}], {size}")
            }
            Instr::LoadInstanceField { dst, field } => write!(f, "load_instance {dst}, {field:?}"),
            Instr::LoadStackArg { ty, dst, index } => write!(f, "load_arg.{ty} {dst}, #{index}"),
            Instr::StoreStackArg { ty, index, src } => write!(f, "store_arg.{ty} #{index}, {src}"),
            Instr::Load {
                ty,
                dst,
                base,
                index,
                offset,
            } => write!(f, "load.{ty:?} {dst}, [{base} + {} + {offset}]", opt(index)),
            Instr::Store {
                ty,
                base,
                index,
                offset,
                src,
            } => write!(
                f,
                "store.{ty:?} [{base} + {} + {offset}], {src}",
                opt(index)
            ),
            Instr::UnOp { op, dst, src } => write!(f, "{op} {dst}, {src}"),
            Instr::UnOpTrapping { op, dst, src, trap } => {
                write!(f, "{op} {dst}, {src} (trap @{trap})")
            }
            Instr::BinOp { op, dst, lhs, rhs } => write!(f, "{op} {dst}, {lhs}, {rhs}"),
            Instr::BinOpImm { op, dst, lhs, imm } => write!(f, "{op} {dst}, {lhs}, {imm}"),
            Instr::Jump { target } => write!(f, "jmp @{target}"),
            Instr::CondJump {
                cond,
                ty,
                lhs,
                rhs,
                target,
            } => write!(
                f,
                "j{}.{ty} {lhs}, {} @{target}",
                cond.mnemonic(),
                rhs.map_or_else(|| "0".to_string(), |r| r.to_string())
            ),
            Instr::CondJumpImm {
                cond,
                ty,
                lhs,
                imm,
                target,
            } => write!(f, "j{}.{ty} {lhs}, {imm} @{target}", cond.mnemonic()),
            Instr::StackCheck { limit, target } => write!(f, "stack_check [{limit}] @{target}"),
            Instr::Call { func_index } => write!(f, "call #{func_index}"),
            Instr::CallIndirect { target } => write!(f, "call {target}"),
            Instr::CallRuntimeStub { stub } => write!(f, "call_stub {stub:?}"),
            Instr::PushRegisters { regs } => write!(f, "push {regs:?}"),
            Instr::PopRegisters { regs } => write!(f, "pop {regs:?}"),
            Instr::AssertUnreachable => f.write_str("assert_unreachable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(instr: Instr<()>) -> Instr<u32> {
        let mut code = Vec::new();
        instr.encode(&mut code);
        let (decoded, len) = Instr::decode(&code, 0).unwrap();
        assert_eq!(len, code.len());
        decoded
    }

    #[test]
    fn operands_survive_encoding() {
        let decoded = decode_one(Instr::Load {
            ty: LoadType::I64Load16S,
            dst: Reg::gp(2),
            base: Reg::gp(5),
            index: None,
            offset: 0x1234,
        });
        assert_eq!(
            decoded,
            Instr::Load {
                ty: LoadType::I64Load16S,
                dst: Reg::gp(2),
                base: Reg::gp(5),
                index: None,
                offset: 0x1234,
            }
        );
        let decoded = decode_one(Instr::BinOpImm {
            op: Opcode::I32Add,
            dst: Reg::gp(0),
            lhs: Reg::gp(0),
            imm: -7,
        });
        assert!(matches!(decoded, Instr::BinOpImm { imm: -7, .. }));
    }

    #[test]
    fn unpatched_branch_targets_the_next_instruction() {
        let mut code = Vec::new();
        Instr::<()>::Jump { target: () }.encode(&mut code);
        let (decoded, len) = Instr::decode(&code, 0).unwrap();
        assert_eq!(decoded, Instr::Jump { target: len as u32 });
    }

    #[test]
    fn negated_conditions_are_involutions() {
        for raw in 0..10u8 {
            let cond = Cond::try_from(raw).unwrap();
            assert_ne!(cond, cond.negate());
            assert_eq!(cond.negate().negate(), cond);
        }
        assert_eq!(Cond::for_i32_comparison(Opcode::I32LtU), Some(Cond::Below));
        assert_eq!(Cond::for_i32_comparison(Opcode::I64LtU), None);
    }

    #[test]
    fn decoding_rejects_garbage() {
        assert_eq!(
            Instr::decode(&[0xEE], 0),
            Err(DisasmError::UnknownOp {
                op: 0xEE,
                offset: 0
            })
        );
        let mut code = Vec::new();
        Instr::<()>::Call { func_index: 3 }.encode(&mut code);
        code.pop();
        assert_eq!(Instr::decode(&code, 0), Err(DisasmError::Truncated(0)));
    }

    #[test]
    fn display_is_readable() {
        let instr: Instr<u32> = Instr::CondJumpImm {
            cond: Cond::AboveEqual,
            ty: ValueType::I32,
            lhs: Reg::gp(1),
            imm: 4,
            target: 40,
        };
        assert_eq!(instr.to_string(), "jae.i32 r1, 4 @40");
    }
}
