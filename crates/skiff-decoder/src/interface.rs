//! The callback surface between the decoder and code generators.
//!
//! The decoder drives a `&mut dyn Backend`. Every method has a no-op default,
//! so a validate-only backend is an empty `impl` block. Apart from the
//! function bracketing events (`start_function`, `start_function_body`,
//! `finish_function`), callbacks only fire while the current code is
//! reachable. `pop_control` and `else_branch` fire when the enclosing
//! construct is reachable.
//!
//! Returning a [`Bailout`] aborts decoding; the decoder surfaces it as
//! [`CompileError::Unsupported`](skiff_core::CompileError::Unsupported).

use skiff_core::{Bailout, FunctionSig, ValueType};

use crate::control::{Control, Value};
use crate::decoder::DecodeContext;
use crate::immediates::{BranchTable, MemArg};
use crate::opcode::{LoadType, Opcode, StoreType};

pub type BackendResult = Result<(), Bailout>;

/// Immediates of `call_indirect` and `return_call_indirect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallIndirectImm {
    pub sig_index: u32,
    pub table_index: u32,
}

#[allow(unused_variables)]
pub trait Backend {
    // ========================================================================
    // Function Bracketing
    // ========================================================================

    /// Locals are decoded, no instruction has been seen yet.
    fn start_function(&mut self, ctx: &mut DecodeContext<'_>) -> BackendResult {
        Ok(())
    }

    /// The implicit function block was pushed.
    fn start_function_body(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        block: &Control<'_>,
    ) -> BackendResult {
        Ok(())
    }

    /// The final `end` was decoded and the body validated.
    fn finish_function(&mut self, ctx: &mut DecodeContext<'_>) -> BackendResult {
        Ok(())
    }

    /// Called before each reachable instruction, immediates still unread.
    fn next_instruction(&mut self, ctx: &mut DecodeContext<'_>, opcode: Opcode) -> BackendResult {
        Ok(())
    }

    // ========================================================================
    // Control
    // ========================================================================

    fn block(&mut self, ctx: &mut DecodeContext<'_>, block: &Control<'_>) -> BackendResult {
        Ok(())
    }

    fn begin_loop(&mut self, ctx: &mut DecodeContext<'_>, block: &Control<'_>) -> BackendResult {
        Ok(())
    }

    fn begin_try(&mut self, ctx: &mut DecodeContext<'_>, block: &Control<'_>) -> BackendResult {
        Ok(())
    }

    fn begin_if(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        cond: Value,
        block: &Control<'_>,
    ) -> BackendResult {
        Ok(())
    }

    /// Control falls off the end of a construct's body into its end merge.
    fn fall_thru_to(&mut self, ctx: &mut DecodeContext<'_>, block: &Control<'_>) -> BackendResult {
        Ok(())
    }

    /// A construct is about to be popped. `block` still describes it.
    fn pop_control(&mut self, ctx: &mut DecodeContext<'_>, block: &Control<'_>) -> BackendResult {
        Ok(())
    }

    /// The rest of the current construct became unreachable.
    fn end_control(&mut self, ctx: &mut DecodeContext<'_>, block: &Control<'_>) -> BackendResult {
        Ok(())
    }

    fn else_branch(&mut self, ctx: &mut DecodeContext<'_>, block: &Control<'_>) -> BackendResult {
        Ok(())
    }

    fn catch_exception(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        tag_index: u32,
        block: &Control<'_>,
        values: &[Value],
    ) -> BackendResult {
        Ok(())
    }

    fn catch_all(&mut self, ctx: &mut DecodeContext<'_>, block: &Control<'_>) -> BackendResult {
        Ok(())
    }

    fn throw(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        tag_index: u32,
        args: &[Value],
    ) -> BackendResult {
        Ok(())
    }

    fn rethrow(&mut self, ctx: &mut DecodeContext<'_>, block: &Control<'_>) -> BackendResult {
        Ok(())
    }

    fn br_or_ret(&mut self, ctx: &mut DecodeContext<'_>, depth: u32) -> BackendResult {
        Ok(())
    }

    fn br_if(&mut self, ctx: &mut DecodeContext<'_>, cond: Value, depth: u32) -> BackendResult {
        Ok(())
    }

    fn br_table(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        table: &BranchTable<'_>,
        key: Value,
    ) -> BackendResult {
        Ok(())
    }

    /// Return with the function's results on top of the stack.
    fn do_return(&mut self, ctx: &mut DecodeContext<'_>) -> BackendResult {
        Ok(())
    }

    fn unreachable(&mut self, ctx: &mut DecodeContext<'_>) -> BackendResult {
        Ok(())
    }

    // ========================================================================
    // Operators and Constants
    // ========================================================================

    fn unop(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        op: Opcode,
        value: Value,
        result: Value,
    ) -> BackendResult {
        Ok(())
    }

    fn binop(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        op: Opcode,
        lhs: Value,
        rhs: Value,
        result: Value,
    ) -> BackendResult {
        Ok(())
    }

    fn i32_const(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        result: Value,
        value: i32,
    ) -> BackendResult {
        Ok(())
    }

    fn i64_const(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        result: Value,
        value: i64,
    ) -> BackendResult {
        Ok(())
    }

    fn f32_const(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        result: Value,
        value: f32,
    ) -> BackendResult {
        Ok(())
    }

    fn f64_const(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        result: Value,
        value: f64,
    ) -> BackendResult {
        Ok(())
    }

    fn s128_const(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        result: Value,
        value: [u8; 16],
    ) -> BackendResult {
        Ok(())
    }

    fn ref_null(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        ty: ValueType,
        result: Value,
    ) -> BackendResult {
        Ok(())
    }

    fn ref_is_null(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        value: Value,
        result: Value,
    ) -> BackendResult {
        Ok(())
    }

    fn ref_func(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        func_index: u32,
        result: Value,
    ) -> BackendResult {
        Ok(())
    }

    fn simd_lane_op(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        op: Opcode,
        lane: u8,
        inputs: &[Value],
        result: Value,
    ) -> BackendResult {
        Ok(())
    }

    // ========================================================================
    // Parametric and Variables
    // ========================================================================

    fn drop_value(&mut self, ctx: &mut DecodeContext<'_>, value: Value) -> BackendResult {
        Ok(())
    }

    fn select(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        cond: Value,
        fval: Value,
        tval: Value,
        result: Value,
    ) -> BackendResult {
        Ok(())
    }

    fn local_get(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        result: Value,
        index: u32,
    ) -> BackendResult {
        Ok(())
    }

    fn local_set(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        value: Value,
        index: u32,
    ) -> BackendResult {
        Ok(())
    }

    fn local_tee(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        value: Value,
        result: Value,
        index: u32,
    ) -> BackendResult {
        Ok(())
    }

    fn global_get(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        result: Value,
        index: u32,
    ) -> BackendResult {
        Ok(())
    }

    fn global_set(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        value: Value,
        index: u32,
    ) -> BackendResult {
        Ok(())
    }

    // ========================================================================
    // Memory
    // ========================================================================

    fn load_mem(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        ty: LoadType,
        imm: &MemArg,
        index: Value,
        result: Value,
    ) -> BackendResult {
        Ok(())
    }

    fn store_mem(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        ty: StoreType,
        imm: &MemArg,
        index: Value,
        value: Value,
    ) -> BackendResult {
        Ok(())
    }

    fn current_memory_pages(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        result: Value,
    ) -> BackendResult {
        Ok(())
    }

    fn memory_grow(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        value: Value,
        result: Value,
    ) -> BackendResult {
        Ok(())
    }

    /// `args` is `[dst, src, size]`.
    fn memory_init(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        segment: u32,
        args: &[Value],
    ) -> BackendResult {
        Ok(())
    }

    fn data_drop(&mut self, ctx: &mut DecodeContext<'_>, segment: u32) -> BackendResult {
        Ok(())
    }

    /// `args` is `[dst, src, size]`.
    fn memory_copy(&mut self, ctx: &mut DecodeContext<'_>, args: &[Value]) -> BackendResult {
        Ok(())
    }

    /// `args` is `[dst, value, size]`.
    fn memory_fill(&mut self, ctx: &mut DecodeContext<'_>, args: &[Value]) -> BackendResult {
        Ok(())
    }

    // ========================================================================
    // Tables
    // ========================================================================

    fn table_get(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        index: Value,
        result: Value,
        table_index: u32,
    ) -> BackendResult {
        Ok(())
    }

    fn table_set(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        index: Value,
        value: Value,
        table_index: u32,
    ) -> BackendResult {
        Ok(())
    }

    /// `args` is `[dst, src, size]`.
    fn table_init(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        segment: u32,
        table_index: u32,
        args: &[Value],
    ) -> BackendResult {
        Ok(())
    }

    fn elem_drop(&mut self, ctx: &mut DecodeContext<'_>, segment: u32) -> BackendResult {
        Ok(())
    }

    /// `args` is `[dst, src, size]`.
    fn table_copy(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        dst_table: u32,
        src_table: u32,
        args: &[Value],
    ) -> BackendResult {
        Ok(())
    }

    fn table_grow(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        table_index: u32,
        value: Value,
        delta: Value,
        result: Value,
    ) -> BackendResult {
        Ok(())
    }

    fn table_size(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        table_index: u32,
        result: Value,
    ) -> BackendResult {
        Ok(())
    }

    /// `args` is `[start, value, count]`.
    fn table_fill(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        table_index: u32,
        args: &[Value],
    ) -> BackendResult {
        Ok(())
    }

    // ========================================================================
    // Calls
    // ========================================================================

    fn call_direct(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        func_index: u32,
        sig: &FunctionSig,
        args: &[Value],
        returns: &[Value],
    ) -> BackendResult {
        Ok(())
    }

    fn call_indirect(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        index: Value,
        imm: &CallIndirectImm,
        sig: &FunctionSig,
        args: &[Value],
        returns: &[Value],
    ) -> BackendResult {
        Ok(())
    }

    fn return_call(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        func_index: u32,
        sig: &FunctionSig,
        args: &[Value],
    ) -> BackendResult {
        Ok(())
    }

    fn return_call_indirect(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        index: Value,
        imm: &CallIndirectImm,
        sig: &FunctionSig,
        args: &[Value],
    ) -> BackendResult {
        Ok(())
    }
}

/// A backend that only validates.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateOnly;

impl Backend for ValidateOnly {}
