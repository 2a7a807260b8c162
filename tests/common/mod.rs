// tests/common/mod.rs
//! Shared infrastructure for the integration tests.
//!
//! [`BodyBuilder`] assembles function bodies byte by byte, and [`Machine`]
//! runs the code the baseline compiler produces for them, so tests can check
//! what compiled code computes rather than which instructions it contains.

#![allow(dead_code)]

use std::collections::HashMap;

use skiff::{
    CompileError, CompileOptions, CompiledFunction, DecoderOptions, FunctionSig, ModuleMetadata,
    ValueType,
};
use skiff_compiler::register::{PARAM_FP, PARAM_GP, RETURN_FP, RETURN_GP};
use skiff_compiler::{InstanceField, Instr, Reg, RegClass, RuntimeStub};
use skiff_decoder::{LoadType, Opcode, StoreType};

// ============================================================================
// Body Builder
// ============================================================================

pub const EMPTY_BLOCK: u8 = 0x40;

/// Builds a function body: local declarations followed by code.
#[derive(Debug, Default, Clone)]
pub struct BodyBuilder {
    locals: Vec<(u32, ValueType)>,
    code: Vec<u8>,
}

fn write_uleb(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn write_sleb(out: &mut Vec<u8>, mut value: i64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub fn ty_byte(ty: ValueType) -> u8 {
    ty.code().expect("encodable value type")
}

impl BodyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local(mut self, count: u32, ty: ValueType) -> Self {
        self.locals.push((count, ty));
        self
    }

    fn header(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_uleb(&mut out, self.locals.len() as u64);
        for &(count, ty) in &self.locals {
            write_uleb(&mut out, u64::from(count));
            out.push(ty_byte(ty));
        }
        out
    }

    /// Body offset of the next instruction.
    pub fn offset(&self) -> u32 {
        (self.header().len() + self.code.len()) as u32
    }

    pub fn op(mut self, byte: u8) -> Self {
        self.code.push(byte);
        self
    }

    pub fn bytes(mut self, bytes: &[u8]) -> Self {
        self.code.extend_from_slice(bytes);
        self
    }

    pub fn uleb(mut self, value: u32) -> Self {
        write_uleb(&mut self.code, u64::from(value));
        self
    }

    pub fn i32_const(mut self, value: i32) -> Self {
        self.code.push(0x41);
        write_sleb(&mut self.code, i64::from(value));
        self
    }

    pub fn i64_const(mut self, value: i64) -> Self {
        self.code.push(0x42);
        write_sleb(&mut self.code, value);
        self
    }

    pub fn f64_const(mut self, value: f64) -> Self {
        self.code.push(0x44);
        self.code.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn local_get(self, index: u32) -> Self {
        self.op(0x20).uleb(index)
    }

    pub fn local_set(self, index: u32) -> Self {
        self.op(0x21).uleb(index)
    }

    pub fn local_tee(self, index: u32) -> Self {
        self.op(0x22).uleb(index)
    }

    pub fn global_get(self, index: u32) -> Self {
        self.op(0x23).uleb(index)
    }

    pub fn global_set(self, index: u32) -> Self {
        self.op(0x24).uleb(index)
    }

    pub fn block(self, block_type: u8) -> Self {
        self.op(0x02).op(block_type)
    }

    pub fn loop_(self, block_type: u8) -> Self {
        self.op(0x03).op(block_type)
    }

    pub fn if_(self, block_type: u8) -> Self {
        self.op(0x04).op(block_type)
    }

    pub fn else_(self) -> Self {
        self.op(0x05)
    }

    pub fn end(self) -> Self {
        self.op(0x0B)
    }

    pub fn br(self, depth: u32) -> Self {
        self.op(0x0C).uleb(depth)
    }

    pub fn br_if(self, depth: u32) -> Self {
        self.op(0x0D).uleb(depth)
    }

    pub fn br_table(mut self, targets: &[u32], default: u32) -> Self {
        self = self.op(0x0E).uleb(targets.len() as u32);
        for &target in targets {
            self = self.uleb(target);
        }
        self.uleb(default)
    }

    pub fn ret(self) -> Self {
        self.op(0x0F)
    }

    pub fn call(self, func_index: u32) -> Self {
        self.op(0x10).uleb(func_index)
    }

    pub fn call_indirect(self, type_index: u32, table_index: u32) -> Self {
        self.op(0x11).uleb(type_index).uleb(table_index)
    }

    /// A memory access with natural-or-smaller alignment `align_log2`.
    pub fn mem(self, opcode: u8, align_log2: u32, offset: u32) -> Self {
        self.op(opcode).uleb(align_log2).uleb(offset)
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = self.header();
        out.extend_from_slice(&self.code);
        out
    }
}

// ============================================================================
// Compilation Helpers
// ============================================================================

pub fn compile(
    module: &ModuleMetadata,
    sig: &FunctionSig,
    body: &[u8],
    options: &CompileOptions,
) -> Result<CompiledFunction, CompileError> {
    skiff::compile_function(module, sig, body, DecoderOptions::default(), options)
}

pub fn compile_ok(module: &ModuleMetadata, sig: &FunctionSig, body: &[u8]) -> CompiledFunction {
    match compile(module, sig, body, &CompileOptions::default()) {
        Ok(compiled) => compiled,
        Err(err) => panic!("compilation failed: {err}"),
    }
}

/// A module with nothing but a memory.
pub fn module_with_memory(min_pages: u32, max_pages: Option<u32>) -> ModuleMetadata {
    let mut builder = ModuleMetadata::builder();
    builder.set_memory(min_pages, max_pages).unwrap();
    builder.build()
}

pub fn instructions(compiled: &CompiledFunction) -> Vec<Instr<u32>> {
    compiled
        .disassemble()
        .unwrap()
        .into_iter()
        .map(|(_, instr)| instr)
        .collect()
}

pub fn listing(compiled: &CompiledFunction) -> String {
    compiled
        .disassemble()
        .unwrap()
        .into_iter()
        .map(|(offset, instr)| format!("{offset:5}: {instr}\n"))
        .collect()
}

// ============================================================================
// Machine
// ============================================================================

const MEMORY_BASE: u64 = 1 << 40;
const GLOBALS_BASE: u64 = 2 << 40;
const SIG_IDS_BASE: u64 = 3 << 40;
const TARGETS_BASE: u64 = 4 << 40;
const REFS_BASE: u64 = 5 << 40;
const IMPORT_TARGETS_BASE: u64 = 6 << 40;
const IMPORT_REFS_BASE: u64 = 7 << 40;
const REGION_MASK: u64 = !((1 << 40) - 1);

const FUEL: usize = 100_000;

/// How a run of compiled code ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// `gp` and `fp` are the return registers of both classes.
    Returned { gp: u64, fp: u64 },
    Trap(RuntimeStub),
    /// An unprotected access outside every region.
    Fault { pc: u32, address: u64 },
}

impl Outcome {
    pub fn i32(self) -> i32 {
        match self {
            Outcome::Returned { gp, .. } => gp as u32 as i32,
            other => panic!("expected a return, got {other:?}"),
        }
    }

    pub fn i64(self) -> i64 {
        match self {
            Outcome::Returned { gp, .. } => gp as i64,
            other => panic!("expected a return, got {other:?}"),
        }
    }

    pub fn f64(self) -> f64 {
        match self {
            Outcome::Returned { fp, .. } => f64::from_bits(fp),
            other => panic!("expected a return, got {other:?}"),
        }
    }
}

/// One entry of the indirect function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableEntry {
    pub sig_id: u32,
    pub target: u64,
}

/// A call made by the running code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRecord {
    Direct { func_index: u32, args: [u64; 4] },
    Indirect { target: u64, args: [u64; 4] },
}

/// Interpreter for the abstract machine code.
///
/// The instance is modelled as fixed, disjoint address regions. Calls do not
/// execute anything: they are recorded and return `call_result`.
#[derive(Debug, Default)]
pub struct Machine {
    regs: [u64; 32],
    frame: HashMap<u32, u64>,
    saved: Vec<[u64; 32]>,
    pub memory: Vec<u8>,
    pub globals: Vec<u8>,
    pub table: Vec<TableEntry>,
    pub stack_args: Vec<u64>,
    /// Outgoing stack arguments written since the last call.
    outgoing: Vec<u64>,
    /// Stack arguments of each call in `calls`, by slot index.
    pub call_stack_args: Vec<Vec<u64>>,
    pub call_result: u64,
    pub calls: Vec<CallRecord>,
    pub stubs: Vec<RuntimeStub>,
    pub steps: usize,
}

fn mask(ty: ValueType, bits: u64) -> u64 {
    match ty {
        ValueType::I32 | ValueType::F32 => bits & 0xFFFF_FFFF,
        _ => bits,
    }
}

fn i32_binop(op: Opcode, a: u32, b: u32) -> u32 {
    let (sa, sb) = (a as i32, b as i32);
    match op {
        Opcode::I32Add => a.wrapping_add(b),
        Opcode::I32Sub => a.wrapping_sub(b),
        Opcode::I32Mul => a.wrapping_mul(b),
        Opcode::I32DivS => sa.wrapping_div(sb) as u32,
        Opcode::I32DivU => a / b,
        Opcode::I32RemS => sa.wrapping_rem(sb) as u32,
        Opcode::I32RemU => a % b,
        Opcode::I32And => a & b,
        Opcode::I32Or => a | b,
        Opcode::I32Xor => a ^ b,
        Opcode::I32Shl => a.wrapping_shl(b),
        Opcode::I32ShrS => sa.wrapping_shr(b) as u32,
        Opcode::I32ShrU => a.wrapping_shr(b),
        Opcode::I32Rotl => a.rotate_left(b & 31),
        Opcode::I32Rotr => a.rotate_right(b & 31),
        Opcode::I32Eq => u32::from(a == b),
        Opcode::I32Ne => u32::from(a != b),
        Opcode::I32LtS => u32::from(sa < sb),
        Opcode::I32LtU => u32::from(a < b),
        Opcode::I32GtS => u32::from(sa > sb),
        Opcode::I32GtU => u32::from(a > b),
        Opcode::I32LeS => u32::from(sa <= sb),
        Opcode::I32LeU => u32::from(a <= b),
        Opcode::I32GeS => u32::from(sa >= sb),
        Opcode::I32GeU => u32::from(a >= b),
        other => panic!("machine does not implement {other}"),
    }
}

fn i64_binop(op: Opcode, a: u64, b: u64) -> u64 {
    let (sa, sb) = (a as i64, b as i64);
    match op {
        Opcode::I64Add => a.wrapping_add(b),
        Opcode::I64Sub => a.wrapping_sub(b),
        Opcode::I64Mul => a.wrapping_mul(b),
        Opcode::I64DivS => sa.wrapping_div(sb) as u64,
        Opcode::I64DivU => a / b,
        Opcode::I64RemS => sa.wrapping_rem(sb) as u64,
        Opcode::I64RemU => a % b,
        Opcode::I64And => a & b,
        Opcode::I64Or => a | b,
        Opcode::I64Xor => a ^ b,
        Opcode::I64Shl => a.wrapping_shl(b as u32),
        Opcode::I64ShrS => sa.wrapping_shr(b as u32) as u64,
        Opcode::I64ShrU => a.wrapping_shr(b as u32),
        Opcode::I64Eq => u64::from(a == b),
        Opcode::I64Ne => u64::from(a != b),
        Opcode::I64LtS => u64::from(sa < sb),
        Opcode::I64LtU => u64::from(a < b),
        Opcode::I64GtS => u64::from(sa > sb),
        Opcode::I64GtU => u64::from(a > b),
        Opcode::I64LeS => u64::from(sa <= sb),
        Opcode::I64LeU => u64::from(a <= b),
        Opcode::I64GeS => u64::from(sa >= sb),
        Opcode::I64GeU => u64::from(a >= b),
        other => panic!("machine does not implement {other}"),
    }
}

fn f64_binop(op: Opcode, a: f64, b: f64) -> u64 {
    match op {
        Opcode::F64Add => (a + b).to_bits(),
        Opcode::F64Sub => (a - b).to_bits(),
        Opcode::F64Mul => (a * b).to_bits(),
        Opcode::F64Div => (a / b).to_bits(),
        Opcode::F64Eq => u64::from(a == b),
        Opcode::F64Ne => u64::from(a != b),
        Opcode::F64Lt => u64::from(a < b),
        Opcode::F64Gt => u64::from(a > b),
        Opcode::F64Le => u64::from(a <= b),
        Opcode::F64Ge => u64::from(a >= b),
        other => panic!("machine does not implement {other}"),
    }
}

fn binop(op: Opcode, a: u64, b: u64) -> u64 {
    let name = op.name();
    if name.starts_with("i32.") {
        u64::from(i32_binop(op, a as u32, b as u32))
    } else if name.starts_with("i64.") {
        i64_binop(op, a, b)
    } else if name.starts_with("f64.") {
        f64_binop(op, f64::from_bits(a), f64::from_bits(b))
    } else {
        panic!("machine does not implement {op}")
    }
}

fn unop(op: Opcode, a: u64) -> u64 {
    match op {
        Opcode::I32Eqz => u64::from(a as u32 == 0),
        Opcode::I64Eqz => u64::from(a == 0),
        Opcode::I32Clz => u64::from((a as u32).leading_zeros()),
        Opcode::I32Ctz => u64::from((a as u32).trailing_zeros()),
        Opcode::I32Popcnt => u64::from((a as u32).count_ones()),
        Opcode::I32WrapI64 => a & 0xFFFF_FFFF,
        Opcode::I64ExtendI32S => a as u32 as i32 as i64 as u64,
        Opcode::I64ExtendI32U => a & 0xFFFF_FFFF,
        Opcode::F64Neg => (-f64::from_bits(a)).to_bits(),
        other => panic!("machine does not implement {other}"),
    }
}

/// `None` when the conversion is not representable and must trap.
fn trapping_unop(op: Opcode, a: u64) -> Option<u64> {
    let value = match op {
        Opcode::I32TruncF64S | Opcode::I32TruncF64U => f64::from_bits(a),
        Opcode::I32TruncF32S | Opcode::I32TruncF32U => f64::from(f32::from_bits(a as u32)),
        other => panic!("machine does not implement {other}"),
    };
    let truncated = value.trunc();
    match op {
        Opcode::I32TruncF64S | Opcode::I32TruncF32S => {
            (truncated >= -2147483648.0 && truncated <= 2147483647.0)
                .then(|| u64::from(truncated as i32 as u32))
        }
        _ => (truncated >= 0.0 && truncated <= 4294967295.0).then(|| u64::from(truncated as u32)),
    }
}

fn compare(cond: skiff_compiler::Cond, ty: ValueType, lhs: u64, rhs: u64) -> bool {
    use skiff_compiler::Cond::*;
    let (signed_l, signed_r, l, r) = if ty == ValueType::I32 {
        (
            i64::from(lhs as u32 as i32),
            i64::from(rhs as u32 as i32),
            lhs & 0xFFFF_FFFF,
            rhs & 0xFFFF_FFFF,
        )
    } else {
        (lhs as i64, rhs as i64, lhs, rhs)
    };
    match cond {
        Equal => l == r,
        NotEqual => l != r,
        LessThan => signed_l < signed_r,
        LessEqual => signed_l <= signed_r,
        GreaterThan => signed_l > signed_r,
        GreaterEqual => signed_l >= signed_r,
        Below => l < r,
        BelowEqual => l <= r,
        Above => l > r,
        AboveEqual => l >= r,
    }
}

fn load_value(ty: LoadType, bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw[..bytes.len()].copy_from_slice(bytes);
    let raw = u64::from_le_bytes(raw);
    match ty {
        LoadType::I32Load8S => u64::from(raw as u8 as i8 as i32 as u32),
        LoadType::I32Load16S => u64::from(raw as u16 as i16 as i32 as u32),
        LoadType::I64Load8S => raw as u8 as i8 as i64 as u64,
        LoadType::I64Load16S => raw as u16 as i16 as i64 as u64,
        LoadType::I64Load32S => raw as u32 as i32 as i64 as u64,
        _ => raw,
    }
}

impl Machine {
    /// A machine whose memory is `min_pages` of the module, zeroed.
    pub fn for_module(module: &ModuleMetadata) -> Self {
        Self {
            memory: vec![0; module.min_memory_size() as usize],
            globals: vec![0; module.globals_size() as usize],
            ..Self::default()
        }
    }

    pub fn reg(&self, reg: Reg) -> u64 {
        self.regs[reg.code() as usize]
    }

    /// Contents of the frame slot at `offset` below the frame pointer.
    pub fn frame_slot(&self, offset: u32) -> Option<u64> {
        self.frame.get(&offset).copied()
    }

    fn set(&mut self, reg: Reg, value: u64) {
        self.regs[reg.code() as usize] = value;
    }

    fn instance_field(&self, field: InstanceField) -> u64 {
        let len = self.memory.len() as u64;
        match field {
            InstanceField::MemoryStart => MEMORY_BASE,
            InstanceField::MemorySize => len,
            InstanceField::MemoryMask => len.next_power_of_two().saturating_sub(1),
            // Stack checks read the limit through this address; the machine
            // never overflows.
            InstanceField::StackLimitAddress => 0,
            InstanceField::GlobalsStart => GLOBALS_BASE,
            InstanceField::ImportedMutableGlobals => GLOBALS_BASE,
            InstanceField::ImportedFunctionTargets => IMPORT_TARGETS_BASE,
            InstanceField::ImportedFunctionRefs => IMPORT_REFS_BASE,
            InstanceField::IndirectFunctionTableSize => self.table.len() as u64,
            InstanceField::IndirectFunctionTableSigIds => SIG_IDS_BASE,
            InstanceField::IndirectFunctionTableTargets => TARGETS_BASE,
            InstanceField::IndirectFunctionTableRefs => REFS_BASE,
        }
    }

    fn read(&self, address: u64, size: usize) -> Option<Vec<u8>> {
        let offset = (address & !REGION_MASK) as usize;
        let table = &self.table;
        let region: Vec<u8> = match address & REGION_MASK {
            MEMORY_BASE => return self.memory.get(offset..offset + size).map(<[u8]>::to_vec),
            GLOBALS_BASE => return self.globals.get(offset..offset + size).map(<[u8]>::to_vec),
            SIG_IDS_BASE => table.iter().flat_map(|e| e.sig_id.to_le_bytes()).collect(),
            TARGETS_BASE => table.iter().flat_map(|e| e.target.to_le_bytes()).collect(),
            REFS_BASE => table.iter().flat_map(|_| 0xABu64.to_le_bytes()).collect(),
            IMPORT_TARGETS_BASE => (0..64u64).flat_map(|i| (0x1000 + i).to_le_bytes()).collect(),
            IMPORT_REFS_BASE => (0..64u64).flat_map(|i| (0x2000 + i).to_le_bytes()).collect(),
            _ => return None,
        };
        region.get(offset..offset + size).map(<[u8]>::to_vec)
    }

    fn write(&mut self, address: u64, bytes: &[u8]) -> bool {
        let offset = (address & !REGION_MASK) as usize;
        let region = match address & REGION_MASK {
            MEMORY_BASE => &mut self.memory,
            GLOBALS_BASE => &mut self.globals,
            _ => return false,
        };
        match region.get_mut(offset..offset + bytes.len()) {
            Some(dst) => {
                dst.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    fn call_args(&self) -> [u64; 4] {
        PARAM_GP.map(|reg| self.reg(reg))
    }

    /// Run `compiled` with `args`, passed per `sig` like a caller would.
    pub fn run(&mut self, compiled: &CompiledFunction, sig: &FunctionSig, args: &[u64]) -> Outcome {
        assert_eq!(args.len(), sig.param_count(), "argument count");
        self.regs = [0; 32];
        self.frame.clear();
        self.saved.clear();
        self.stack_args.clear();
        self.outgoing.clear();
        let (mut gp, mut fp) = (PARAM_GP.iter(), PARAM_FP.iter());
        for (&ty, &arg) in sig.params().iter().zip(args) {
            let reg = match RegClass::for_type(ty) {
                RegClass::Gp => gp.next(),
                RegClass::Fp => fp.next(),
            };
            match reg {
                Some(&reg) => self.set(reg, mask(ty, arg)),
                None => self.stack_args.push(mask(ty, arg)),
            }
        }

        let code: HashMap<u32, (Instr<u32>, u32)> = {
            let decoded = compiled.disassemble().unwrap();
            let mut map = HashMap::new();
            for (i, &(offset, instr)) in decoded.iter().enumerate() {
                let next = decoded
                    .get(i + 1)
                    .map_or(compiled.code.len() as u32, |&(next, _)| next);
                map.insert(offset, (instr, next));
            }
            map
        };

        let mut pc = 0u32;
        for _ in 0..FUEL {
            self.steps += 1;
            let current = pc;
            let &(instr, next) = code
                .get(&pc)
                .unwrap_or_else(|| panic!("no instruction at {pc}\n{}", listing(compiled)));
            pc = next;
            match instr {
                Instr::EnterFrame { .. } | Instr::LeaveFrame => {}
                Instr::Ret => {
                    return Outcome::Returned {
                        gp: self.reg(RETURN_GP),
                        fp: self.reg(RETURN_FP),
                    };
                }
                Instr::Move { ty, dst, src } => self.set(dst, mask(ty, self.reg(src))),
                Instr::LoadConst { ty, dst, bits } => self.set(dst, mask(ty, bits)),
                Instr::Spill { ty, offset, src } => {
                    self.frame.insert(offset, mask(ty, self.reg(src)));
                }
                Instr::SpillConst { ty, offset, value } => {
                    self.frame.insert(offset, mask(ty, value as i64 as u64));
                }
                Instr::Fill { ty, dst, offset } => {
                    let value = self.frame.get(&offset).copied().unwrap_or(0);
                    self.set(dst, mask(ty, value));
                }
                Instr::MoveStackValue {
                    ty,
                    dst_offset,
                    src_offset,
                } => {
                    let value = self.frame.get(&src_offset).copied().unwrap_or(0);
                    self.frame.insert(dst_offset, mask(ty, value));
                }
                Instr::FillStackSlotsWithZero { start, size } => {
                    for (_, value) in self
                        .frame
                        .iter_mut()
                        .filter(|(offset, _)| **offset > start && **offset <= start + size)
                    {
                        *value = 0;
                    }
                }
                Instr::LoadInstanceField { dst, field } => {
                    self.set(dst, self.instance_field(field));
                }
                Instr::LoadStackArg { ty, dst, index } => {
                    self.set(dst, mask(ty, self.stack_args[index as usize]));
                }
                Instr::StoreStackArg { ty, index, src } => {
                    let index = index as usize;
                    if self.outgoing.len() <= index {
                        self.outgoing.resize(index + 1, 0);
                    }
                    self.outgoing[index] = mask(ty, self.reg(src));
                }
                Instr::Load {
                    ty,
                    dst,
                    base,
                    index,
                    offset,
                } => {
                    let address = self.reg(base)
                        + index.map_or(0, |r| self.reg(r) & 0xFFFF_FFFF)
                        + u64::from(offset);
                    match self.read(address, ty.size() as usize) {
                        Some(bytes) => self.set(dst, load_value(ty, &bytes)),
                        None => return self.fault(compiled, current, address),
                    }
                }
                Instr::Store {
                    ty,
                    base,
                    index,
                    offset,
                    src,
                } => {
                    let address = self.reg(base)
                        + index.map_or(0, |r| self.reg(r) & 0xFFFF_FFFF)
                        + u64::from(offset);
                    let size = ty.size() as usize;
                    let bytes = self.reg(src).to_le_bytes();
                    if !self.write(address, &bytes[..size]) {
                        return self.fault(compiled, current, address);
                    }
                }
                Instr::UnOp { op, dst, src } => self.set(dst, unop(op, self.reg(src))),
                Instr::UnOpTrapping { op, dst, src, trap } => {
                    match trapping_unop(op, self.reg(src)) {
                        Some(value) => self.set(dst, value),
                        None => pc = trap,
                    }
                }
                Instr::BinOp { op, dst, lhs, rhs } => {
                    self.set(dst, binop(op, self.reg(lhs), self.reg(rhs)));
                }
                Instr::BinOpImm { op, dst, lhs, imm } => {
                    self.set(dst, binop(op, self.reg(lhs), imm as i64 as u64));
                }
                Instr::Jump { target } => pc = target,
                Instr::CondJump {
                    cond,
                    ty,
                    lhs,
                    rhs,
                    target,
                } => {
                    let rhs = rhs.map_or(0, |r| self.reg(r));
                    if compare(cond, ty, self.reg(lhs), rhs) {
                        pc = target;
                    }
                }
                Instr::CondJumpImm {
                    cond,
                    ty,
                    lhs,
                    imm,
                    target,
                } => {
                    if compare(cond, ty, self.reg(lhs), imm as u64) {
                        pc = target;
                    }
                }
                Instr::StackCheck { .. } => {}
                Instr::Call { func_index } => {
                    self.calls.push(CallRecord::Direct {
                        func_index,
                        args: self.call_args(),
                    });
                    self.finish_call();
                }
                Instr::CallIndirect { target } => {
                    self.calls.push(CallRecord::Indirect {
                        target: self.reg(target),
                        args: self.call_args(),
                    });
                    self.finish_call();
                }
                Instr::CallRuntimeStub { stub } => {
                    self.stubs.push(stub);
                    if stub.is_trap() {
                        return Outcome::Trap(stub);
                    }
                    if stub == RuntimeStub::MemoryGrow {
                        let delta = self.reg(RETURN_GP) as u32 as usize;
                        let old_pages = self.memory.len() / 65536;
                        self.memory.resize((old_pages + delta) * 65536, 0);
                        self.set(RETURN_GP, old_pages as u64);
                    }
                }
                Instr::PushRegisters { .. } => self.saved.push(self.regs),
                Instr::PopRegisters { regs } => {
                    let saved = self.saved.pop().expect("balanced push/pop");
                    for reg in regs.iter() {
                        self.set(reg, saved[reg.code() as usize]);
                    }
                }
                Instr::AssertUnreachable => panic!("reached assert_unreachable at {pc}"),
            }
        }
        panic!("out of fuel\n{}", listing(compiled))
    }

    /// Calls clobber every cache register and return `call_result`.
    fn finish_call(&mut self) {
        let outgoing = std::mem::take(&mut self.outgoing);
        self.call_stack_args.push(outgoing);
        for code in 0..8 {
            self.regs[code] = 0xDEAD_BEEF;
            self.regs[16 + code] = 0xDEAD_BEEF;
        }
        self.set(RETURN_GP, self.call_result);
        self.set(RETURN_FP, self.call_result);
    }

    /// A faulting access resumes at its landing pad if it is protected.
    fn fault(&self, compiled: &CompiledFunction, pc: u32, address: u64) -> Outcome {
        let protected = compiled
            .protected_instructions
            .iter()
            .any(|p| p.instr_offset == pc);
        if protected {
            Outcome::Trap(RuntimeStub::TrapMemOutOfBounds)
        } else {
            Outcome::Fault { pc, address }
        }
    }
}

/// Compile and run in one go.
pub fn run(module: &ModuleMetadata, sig: &FunctionSig, body: &[u8], args: &[u64]) -> Outcome {
    let compiled = compile_ok(module, sig, body);
    Machine::for_module(module).run(&compiled, sig, args)
}

pub fn sig(params: &[ValueType], results: &[ValueType]) -> FunctionSig {
    FunctionSig::new(params, results)
}

pub fn store_type_size(ty: StoreType) -> u32 {
    ty.size()
}
