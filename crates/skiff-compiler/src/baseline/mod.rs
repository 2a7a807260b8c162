//! The baseline code generator.
//!
//! [`BaselineCompiler`] is a [`Backend`]: it emits code for each callback as
//! the decoder reports it, with no intermediate representation. Values are
//! tracked in a [`CacheState`] that mirrors the decoder's operand stack,
//! prefixed by the locals. Slow paths are collected as [`OutOfLineCode`]
//! and emitted after the body.
//!
//! The lowering is split by concern:
//!
//! - `control` - blocks, loops, ifs, branches, returns
//! - `numeric` - constants, operators, locals, `select`
//! - `memory` - globals, loads and stores, memory size and bulk operations
//! - `calls` - direct and indirect calls, runtime stubs

mod calls;
mod control;
mod memory;
mod numeric;

use skiff_core::{
    Bailout, BailoutReason, BoundsCheckStrategy, CompileOptions, FunctionSig, ValueType,
};
use skiff_decoder::{
    Backend, BackendResult, BranchTable, CallIndirectImm, Control, DecodeContext, LoadType,
    MemArg, Opcode, StoreType, Value,
};
use tracing::trace;

use crate::assembler::{Instr, InstanceField, Label, RuntimeStub};
use crate::cache_state::{CacheState, INSTANCE_SLOT_OFFSET};
use crate::debug_side_table::{AssumeSpilling, DebugSideTableBuilder, EntryId};
use crate::macro_asm::MacroAssembler;
use crate::out_of_line::{OutOfLineCode, SpilledRegister};
use crate::pipeline::{CompiledFunction, ProtectedInstruction, SourcePosition};
use crate::register::{INSTANCE_REG, RegList, SCRATCH_GP};

/// Per-construct code generation state, indexed like the decoder's control
/// stack.
#[derive(Debug)]
struct ControlData {
    /// Branch target: the loop header, or the end of any other construct.
    label: Label,
    /// The state every branch to `label` must produce. Created by the first
    /// branch, or at the loop header.
    label_state: Option<CacheState>,
    /// The `else` arm of an `if`, entered when the condition is false.
    else_state: Option<ElseState>,
}

#[derive(Debug)]
struct ElseState {
    label: Label,
    state: CacheState,
}

impl ControlData {
    fn new(label: Label) -> Self {
        Self {
            label,
            label_state: None,
            else_state: None,
        }
    }
}

fn unsupported(reason: BailoutReason, detail: impl Into<String>) -> Bailout {
    let bailout = Bailout::new(reason, detail);
    tracing::debug!(reason = %bailout.reason, detail = %bailout.detail, "baseline bailout");
    bailout
}

fn internal(detail: &str) -> Bailout {
    Bailout::new(BailoutReason::Other, detail)
}

/// Refuse value types the generator has no registers for.
fn check_value_type(ty: ValueType, context: &str) -> BackendResult {
    match ty {
        ValueType::V128 => Err(unsupported(BailoutReason::Simd, format!("v128 {context}"))),
        _ => Ok(()),
    }
}

pub struct BaselineCompiler<'o> {
    masm: MacroAssembler,
    options: &'o CompileOptions,
    control: Vec<ControlData>,
    out_of_line: Vec<OutOfLineCode>,
    source_positions: Vec<SourcePosition>,
    protected_instructions: Vec<ProtectedInstruction>,
    debug_side_table: Option<DebugSideTableBuilder>,
    /// An `i32` comparison whose result was not materialized because the
    /// next instruction branches on it. Its operands are still on the
    /// cache state.
    outstanding_op: Option<Opcode>,
    /// Offset of the `EnterFrame` instruction, patched with the final
    /// frame size.
    frame_setup_offset: u32,
    min_memory_size: u64,
    max_memory_size: u64,
}

impl<'o> BaselineCompiler<'o> {
    pub fn new(options: &'o CompileOptions) -> Self {
        Self {
            masm: MacroAssembler::new(),
            options,
            control: Vec::new(),
            out_of_line: Vec::new(),
            source_positions: Vec::new(),
            protected_instructions: Vec::new(),
            debug_side_table: options
                .wants_debug_side_table()
                .then(DebugSideTableBuilder::new),
            outstanding_op: None,
            frame_setup_offset: 0,
            min_memory_size: 0,
            max_memory_size: 0,
        }
    }

    /// Collect the finished code and its metadata.
    pub fn finish(self) -> CompiledFunction {
        let frame_size = self.masm.frame_size();
        let num_locals = self.masm.num_locals();
        let (code, relocations) = self.masm.into_assembler().finish();
        CompiledFunction {
            code,
            source_positions: self.source_positions,
            protected_instructions: self.protected_instructions,
            relocations,
            frame_size,
            debug_side_table: self
                .debug_side_table
                .map(|builder| builder.generate(num_locals)),
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Index into `self.control` of the construct `depth` levels out.
    fn control_index(&self, depth: u32) -> Result<usize, Bailout> {
        self.control
            .len()
            .checked_sub(1 + depth as usize)
            .ok_or_else(|| internal("control stack out of sync"))
    }

    fn uses_trap_handler(&self) -> bool {
        self.options.bounds_checks == BoundsCheckStrategy::TrapHandler
    }

    fn has_breakpoint(&self, position: u32) -> bool {
        self.options.breakpoints.binary_search(&position).is_ok()
    }

    fn record_source_position(&mut self, source_offset: u32) {
        self.source_positions.push(SourcePosition {
            code_offset: self.masm.pc_offset(),
            source_offset,
        });
    }

    fn register_debug_entry(&mut self, mode: AssumeSpilling) {
        let pc = self.masm.pc_offset();
        if let Some(builder) = self.debug_side_table.as_mut() {
            builder.new_entry(pc, self.masm.state(), mode);
        }
    }

    /// Entry for an out-of-line path; its offset is set when the path is
    /// emitted.
    fn register_ool_debug_entry(&mut self) -> Option<EntryId> {
        let builder = self.debug_side_table.as_mut()?;
        Some(builder.new_entry(0, self.masm.state(), AssumeSpilling::AssumeSpilling))
    }

    /// Label of a new out-of-line trap.
    fn add_trap(&mut self, stub: RuntimeStub, position: u32) -> Label {
        self.add_trap_at(stub, position, None)
    }

    fn add_trap_at(&mut self, stub: RuntimeStub, position: u32, trapping_pc: Option<u32>) -> Label {
        let label = self.masm.new_label();
        let debug_entry = self.register_ool_debug_entry();
        let mut ool = OutOfLineCode::trap(label, stub, position)
            .with_spilled(self.spilled_registers_for_debugging())
            .with_debug_entry(debug_entry);
        if let Some(pc) = trapping_pc {
            ool = ool.with_trapping_pc(pc);
        }
        self.out_of_line.push(ool);
        label
    }

    /// Register-held values an out-of-line path writes to their spill
    /// slots. Empty unless a debug side table is recorded.
    fn spilled_registers_for_debugging(&self) -> Vec<SpilledRegister> {
        if self.debug_side_table.is_none() {
            return Vec::new();
        }
        self.masm
            .state()
            .slots()
            .iter()
            .filter_map(|slot| {
                slot.reg().map(|reg| SpilledRegister {
                    ty: slot.ty,
                    reg,
                    offset: slot.offset,
                })
            })
            .collect()
    }

    fn stack_check(&mut self, position: u32) {
        if !self.options.stack_checks {
            return;
        }
        let ool_label = self.masm.new_label();
        let continuation = self.masm.new_label();
        // With a side table the registers go to their spill slots, where the
        // debugger looks for them; otherwise they are pushed.
        let spilled = self.spilled_registers_for_debugging();
        let regs_to_save = if self.debug_side_table.is_some() {
            RegList::EMPTY
        } else {
            self.masm.state().used_registers().with(INSTANCE_REG)
        };
        let debug_entry = self.register_ool_debug_entry();
        self.out_of_line.push(
            OutOfLineCode::stack_check(ool_label, continuation, position, regs_to_save)
                .with_spilled(spilled)
                .with_debug_entry(debug_entry),
        );

        self.masm.emit(Instr::LoadInstanceField {
            dst: SCRATCH_GP,
            field: InstanceField::StackLimitAddress,
        });
        self.masm.emit(Instr::StackCheck {
            limit: SCRATCH_GP,
            target: ool_label,
        });
        self.masm.bind(continuation);
    }

    fn emit_breakpoint(&mut self, position: u32) {
        self.record_source_position(position);
        self.masm.emit(Instr::CallRuntimeStub {
            stub: RuntimeStub::DebugBreak,
        });
        self.register_debug_entry(AssumeSpilling::AllowRegisters);
    }

    fn trace_function_entry(&mut self, position: u32) {
        self.masm.spill_all_registers();
        self.record_source_position(position);
        self.masm.emit(Instr::CallRuntimeStub {
            stub: RuntimeStub::TraceEnter,
        });
        self.masm
            .fill(ValueType::I64, INSTANCE_REG, INSTANCE_SLOT_OFFSET);
    }

    /// Values the cache state holds beyond the decoder's stack while a
    /// comparison waits for its branch.
    fn outstanding_operands(&self) -> u32 {
        match self.outstanding_op {
            Some(Opcode::I32Eqz) | None => 0,
            Some(_) => 1,
        }
    }

    /// Emit every out-of-line path and patch the frame size.
    fn generate_out_of_line_code(&mut self) {
        for ool in std::mem::take(&mut self.out_of_line) {
            ool.generate(
                &mut self.masm,
                &mut self.source_positions,
                &mut self.protected_instructions,
                self.debug_side_table.as_mut(),
            );
        }
        let frame_size = self.masm.frame_size();
        self.masm
            .assembler_mut()
            .patch_frame_size(self.frame_setup_offset, frame_size);
    }
}

// ============================================================================
// Backend
// ============================================================================

impl Backend for BaselineCompiler<'_> {
    fn start_function(&mut self, ctx: &mut DecodeContext<'_>) -> BackendResult {
        self.start_function_impl(ctx)
    }

    fn start_function_body(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        _block: &Control<'_>,
    ) -> BackendResult {
        self.start_function_body_impl(ctx)
    }

    fn finish_function(&mut self, _ctx: &mut DecodeContext<'_>) -> BackendResult {
        self.generate_out_of_line_code();
        if !self.masm.assembler_mut().all_labels_resolved() {
            return Err(internal("unbound label at end of function"));
        }
        trace!(
            code_size = self.masm.pc_offset(),
            frame_size = self.masm.frame_size(),
            "baseline function finished"
        );
        Ok(())
    }

    fn next_instruction(&mut self, ctx: &mut DecodeContext<'_>, opcode: Opcode) -> BackendResult {
        debug_assert_eq!(
            self.masm.state().height(),
            self.masm.num_locals() + ctx.stack_height() + self.outstanding_operands(),
            "cache state out of sync before {opcode}"
        );
        debug_assert!(self.masm.state().is_consistent());
        trace!(pc = ctx.pc(), %opcode, height = self.masm.state().height(), "lower");
        if self.has_breakpoint(ctx.pc()) {
            self.emit_breakpoint(ctx.pc());
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Control

    fn block(&mut self, _ctx: &mut DecodeContext<'_>, block: &Control<'_>) -> BackendResult {
        self.block_impl(block)
    }

    fn begin_loop(&mut self, ctx: &mut DecodeContext<'_>, block: &Control<'_>) -> BackendResult {
        self.loop_impl(ctx, block)
    }

    fn begin_try(&mut self, _ctx: &mut DecodeContext<'_>, _block: &Control<'_>) -> BackendResult {
        Err(unsupported(BailoutReason::ExceptionHandling, "try"))
    }

    fn begin_if(
        &mut self,
        _ctx: &mut DecodeContext<'_>,
        _cond: Value,
        block: &Control<'_>,
    ) -> BackendResult {
        self.if_impl(block)
    }

    fn fall_thru_to(&mut self, _ctx: &mut DecodeContext<'_>, block: &Control<'_>) -> BackendResult {
        self.fall_thru_to_impl(block)
    }

    fn pop_control(&mut self, _ctx: &mut DecodeContext<'_>, block: &Control<'_>) -> BackendResult {
        self.pop_control_impl(block)
    }

    fn else_branch(&mut self, _ctx: &mut DecodeContext<'_>, block: &Control<'_>) -> BackendResult {
        self.else_impl(block)
    }

    fn catch_exception(
        &mut self,
        _ctx: &mut DecodeContext<'_>,
        _tag_index: u32,
        _block: &Control<'_>,
        _values: &[Value],
    ) -> BackendResult {
        Err(unsupported(BailoutReason::ExceptionHandling, "catch"))
    }

    fn catch_all(&mut self, _ctx: &mut DecodeContext<'_>, _block: &Control<'_>) -> BackendResult {
        Err(unsupported(BailoutReason::ExceptionHandling, "catch_all"))
    }

    fn throw(
        &mut self,
        _ctx: &mut DecodeContext<'_>,
        _tag_index: u32,
        _args: &[Value],
    ) -> BackendResult {
        Err(unsupported(BailoutReason::ExceptionHandling, "throw"))
    }

    fn rethrow(&mut self, _ctx: &mut DecodeContext<'_>, _block: &Control<'_>) -> BackendResult {
        Err(unsupported(BailoutReason::ExceptionHandling, "rethrow"))
    }

    fn br_or_ret(&mut self, ctx: &mut DecodeContext<'_>, depth: u32) -> BackendResult {
        self.br_or_ret_impl(ctx, depth)
    }

    fn br_if(&mut self, ctx: &mut DecodeContext<'_>, _cond: Value, depth: u32) -> BackendResult {
        self.br_if_impl(ctx, depth)
    }

    fn br_table(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        table: &BranchTable<'_>,
        _key: Value,
    ) -> BackendResult {
        self.br_table_impl(ctx, table)
    }

    fn do_return(&mut self, ctx: &mut DecodeContext<'_>) -> BackendResult {
        self.return_impl(ctx)
    }

    fn unreachable(&mut self, ctx: &mut DecodeContext<'_>) -> BackendResult {
        let trap = self.add_trap(RuntimeStub::TrapUnreachable, ctx.pc());
        self.masm.emit(Instr::Jump { target: trap });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Operators and constants

    fn unop(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        op: Opcode,
        value: Value,
        result: Value,
    ) -> BackendResult {
        check_value_type(value.ty, "operand")?;
        check_value_type(result.ty, "result")?;
        self.unop_impl(ctx, op, result.ty)
    }

    fn binop(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        op: Opcode,
        lhs: Value,
        _rhs: Value,
        result: Value,
    ) -> BackendResult {
        check_value_type(lhs.ty, "operand")?;
        check_value_type(result.ty, "result")?;
        self.binop_impl(ctx, op, lhs.ty, result.ty)
    }

    fn i32_const(
        &mut self,
        _ctx: &mut DecodeContext<'_>,
        _result: Value,
        value: i32,
    ) -> BackendResult {
        self.masm.push_const(ValueType::I32, value);
        Ok(())
    }

    fn i64_const(
        &mut self,
        _ctx: &mut DecodeContext<'_>,
        _result: Value,
        value: i64,
    ) -> BackendResult {
        self.i64_const_impl(value)
    }

    fn f32_const(
        &mut self,
        _ctx: &mut DecodeContext<'_>,
        _result: Value,
        value: f32,
    ) -> BackendResult {
        self.float_const_impl(ValueType::F32, u64::from(value.to_bits()))
    }

    fn f64_const(
        &mut self,
        _ctx: &mut DecodeContext<'_>,
        _result: Value,
        value: f64,
    ) -> BackendResult {
        self.float_const_impl(ValueType::F64, value.to_bits())
    }

    fn s128_const(
        &mut self,
        _ctx: &mut DecodeContext<'_>,
        _result: Value,
        _value: [u8; 16],
    ) -> BackendResult {
        Err(unsupported(BailoutReason::Simd, "v128.const"))
    }

    fn ref_null(
        &mut self,
        _ctx: &mut DecodeContext<'_>,
        ty: ValueType,
        _result: Value,
    ) -> BackendResult {
        self.masm.push_const(ty, 0);
        Ok(())
    }

    fn ref_is_null(
        &mut self,
        _ctx: &mut DecodeContext<'_>,
        _value: Value,
        _result: Value,
    ) -> BackendResult {
        self.ref_is_null_impl()
    }

    fn ref_func(
        &mut self,
        _ctx: &mut DecodeContext<'_>,
        _func_index: u32,
        _result: Value,
    ) -> BackendResult {
        Err(unsupported(BailoutReason::ReferenceTypes, "ref.func"))
    }

    fn simd_lane_op(
        &mut self,
        _ctx: &mut DecodeContext<'_>,
        op: Opcode,
        _lane: u8,
        _inputs: &[Value],
        _result: Value,
    ) -> BackendResult {
        Err(unsupported(BailoutReason::Simd, op.name()))
    }

    // ------------------------------------------------------------------------
    // Parametric and variables

    fn drop_value(&mut self, _ctx: &mut DecodeContext<'_>, _value: Value) -> BackendResult {
        self.masm.pop_slot()?;
        Ok(())
    }

    fn select(
        &mut self,
        _ctx: &mut DecodeContext<'_>,
        _cond: Value,
        _fval: Value,
        _tval: Value,
        result: Value,
    ) -> BackendResult {
        check_value_type(result.ty, "select")?;
        self.select_impl(result.ty)
    }

    fn local_get(
        &mut self,
        _ctx: &mut DecodeContext<'_>,
        _result: Value,
        index: u32,
    ) -> BackendResult {
        self.local_get_impl(index)
    }

    fn local_set(
        &mut self,
        _ctx: &mut DecodeContext<'_>,
        _value: Value,
        index: u32,
    ) -> BackendResult {
        self.local_set_impl(index, false)
    }

    fn local_tee(
        &mut self,
        _ctx: &mut DecodeContext<'_>,
        _value: Value,
        _result: Value,
        index: u32,
    ) -> BackendResult {
        self.local_set_impl(index, true)
    }

    fn global_get(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        _result: Value,
        index: u32,
    ) -> BackendResult {
        self.global_get_impl(ctx, index)
    }

    fn global_set(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        _value: Value,
        index: u32,
    ) -> BackendResult {
        self.global_set_impl(ctx, index)
    }

    // ------------------------------------------------------------------------
    // Memory

    fn load_mem(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        ty: LoadType,
        imm: &MemArg,
        _index: Value,
        _result: Value,
    ) -> BackendResult {
        check_value_type(ty.value_type(), "load")?;
        self.load_mem_impl(ctx, ty, imm)
    }

    fn store_mem(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        ty: StoreType,
        imm: &MemArg,
        _index: Value,
        _value: Value,
    ) -> BackendResult {
        check_value_type(ty.value_type(), "store")?;
        self.store_mem_impl(ctx, ty, imm)
    }

    fn current_memory_pages(
        &mut self,
        _ctx: &mut DecodeContext<'_>,
        _result: Value,
    ) -> BackendResult {
        self.memory_size_impl()
    }

    fn memory_grow(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        _value: Value,
        _result: Value,
    ) -> BackendResult {
        self.call_runtime_stub(
            ctx,
            RuntimeStub::MemoryGrow,
            &[ValueType::I32],
            None,
            Some(ValueType::I32),
        )
    }

    fn memory_init(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        segment: u32,
        _args: &[Value],
    ) -> BackendResult {
        self.bulk_operation(ctx, RuntimeStub::MemoryInit, 3, Some(u64::from(segment)))
    }

    fn data_drop(&mut self, ctx: &mut DecodeContext<'_>, segment: u32) -> BackendResult {
        self.bulk_operation(ctx, RuntimeStub::DataDrop, 0, Some(u64::from(segment)))
    }

    fn memory_copy(&mut self, ctx: &mut DecodeContext<'_>, _args: &[Value]) -> BackendResult {
        self.bulk_operation(ctx, RuntimeStub::MemoryCopy, 3, None)
    }

    fn memory_fill(&mut self, ctx: &mut DecodeContext<'_>, _args: &[Value]) -> BackendResult {
        self.bulk_operation(ctx, RuntimeStub::MemoryFill, 3, None)
    }

    // ------------------------------------------------------------------------
    // Tables

    fn table_get(
        &mut self,
        _ctx: &mut DecodeContext<'_>,
        _index: Value,
        _result: Value,
        _table: u32,
    ) -> BackendResult {
        Err(unsupported(BailoutReason::ReferenceTypes, "table.get"))
    }

    fn table_set(
        &mut self,
        _ctx: &mut DecodeContext<'_>,
        _index: Value,
        _value: Value,
        _table: u32,
    ) -> BackendResult {
        Err(unsupported(BailoutReason::ReferenceTypes, "table.set"))
    }

    fn table_init(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        segment: u32,
        table_index: u32,
        _args: &[Value],
    ) -> BackendResult {
        let packed = (u64::from(table_index) << 32) | u64::from(segment);
        self.bulk_operation(ctx, RuntimeStub::TableInit, 3, Some(packed))
    }

    fn elem_drop(&mut self, ctx: &mut DecodeContext<'_>, segment: u32) -> BackendResult {
        self.bulk_operation(ctx, RuntimeStub::ElemDrop, 0, Some(u64::from(segment)))
    }

    fn table_copy(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        dst_table: u32,
        src_table: u32,
        _args: &[Value],
    ) -> BackendResult {
        let packed = (u64::from(dst_table) << 32) | u64::from(src_table);
        self.bulk_operation(ctx, RuntimeStub::TableCopy, 3, Some(packed))
    }

    fn table_grow(
        &mut self,
        _ctx: &mut DecodeContext<'_>,
        _table: u32,
        _value: Value,
        _delta: Value,
        _result: Value,
    ) -> BackendResult {
        Err(unsupported(BailoutReason::ReferenceTypes, "table.grow"))
    }

    fn table_size(
        &mut self,
        _ctx: &mut DecodeContext<'_>,
        _table: u32,
        _result: Value,
    ) -> BackendResult {
        Err(unsupported(BailoutReason::ReferenceTypes, "table.size"))
    }

    fn table_fill(
        &mut self,
        _ctx: &mut DecodeContext<'_>,
        _table: u32,
        _args: &[Value],
    ) -> BackendResult {
        Err(unsupported(BailoutReason::ReferenceTypes, "table.fill"))
    }

    // ------------------------------------------------------------------------
    // Calls

    fn call_direct(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        func_index: u32,
        sig: &FunctionSig,
        _args: &[Value],
        _returns: &[Value],
    ) -> BackendResult {
        self.call_direct_impl(ctx, func_index, sig)
    }

    fn call_indirect(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        _index: Value,
        imm: &CallIndirectImm,
        sig: &FunctionSig,
        _args: &[Value],
        _returns: &[Value],
    ) -> BackendResult {
        self.call_indirect_impl(ctx, imm, sig)
    }

    fn return_call(
        &mut self,
        _ctx: &mut DecodeContext<'_>,
        _func_index: u32,
        _sig: &FunctionSig,
        _args: &[Value],
    ) -> BackendResult {
        Err(unsupported(BailoutReason::TailCall, "return_call"))
    }

    fn return_call_indirect(
        &mut self,
        _ctx: &mut DecodeContext<'_>,
        _index: Value,
        _imm: &CallIndirectImm,
        _sig: &FunctionSig,
        _args: &[Value],
    ) -> BackendResult {
        Err(unsupported(BailoutReason::TailCall, "return_call_indirect"))
    }
}
