//! Calls to other functions and into the runtime.

use skiff_core::{Bailout, BailoutReason, FunctionSig, ValueType};
use skiff_decoder::{BackendResult, CallIndirectImm, DecodeContext, LoadType, Opcode};

use super::{BaselineCompiler, check_value_type, internal, unsupported};
use crate::assembler::{Cond, InstanceField, Instr, Label, RuntimeStub};
use crate::debug_side_table::AssumeSpilling;
use crate::register::{CALL_TARGET_REG, INSTANCE_REG, PARAM_GP, RegClass, RegList, SCRATCH_GP};

/// Bytes per entry of the instance's function target and ref tables.
const POINTER_SIZE: u32 = 8;

fn check_call_sig(sig: &FunctionSig) -> BackendResult {
    if sig.result_count() > 1 {
        return Err(unsupported(BailoutReason::MultiValue, "call with multiple results"));
    }
    for &ty in sig.params().iter().chain(sig.results()) {
        check_value_type(ty, "call value")?;
    }
    Ok(())
}

impl BaselineCompiler<'_> {
    /// Emit the call itself once the target is set up, then restore the
    /// instance and push the result.
    fn emit_call(
        &mut self,
        ctx: &DecodeContext<'_>,
        sig: &FunctionSig,
        call: Instr<Label>,
    ) -> BackendResult {
        self.masm.prepare_call(sig.params())?;
        self.record_source_position(ctx.pc());
        self.masm.emit(call);
        self.register_debug_entry(AssumeSpilling::DidSpill);
        self.masm.finish_call(sig.results().first().copied())
    }

    pub(super) fn call_direct_impl(
        &mut self,
        ctx: &DecodeContext<'_>,
        func_index: u32,
        sig: &FunctionSig,
    ) -> BackendResult {
        check_call_sig(sig)?;
        if !ctx.module().is_imported_function(func_index) {
            return self.emit_call(ctx, sig, Instr::Call { func_index });
        }

        // Imports are called through the instance's tables, with the
        // callee's own instance in place of ours.
        let slot = func_index
            .checked_mul(POINTER_SIZE)
            .ok_or_else(|| internal("imported function slot out of range"))?;
        self.masm.emit(Instr::LoadInstanceField {
            dst: CALL_TARGET_REG,
            field: InstanceField::ImportedFunctionTargets,
        });
        self.masm.emit(Instr::Load {
            ty: LoadType::I64Load,
            dst: CALL_TARGET_REG,
            base: CALL_TARGET_REG,
            index: None,
            offset: slot,
        });
        self.masm.emit(Instr::LoadInstanceField {
            dst: SCRATCH_GP,
            field: InstanceField::ImportedFunctionRefs,
        });
        self.masm.emit(Instr::Load {
            ty: LoadType::I64Load,
            dst: INSTANCE_REG,
            base: SCRATCH_GP,
            index: None,
            offset: slot,
        });
        let call = Instr::CallIndirect {
            target: CALL_TARGET_REG,
        };
        self.emit_call(ctx, sig, call)
    }

    pub(super) fn call_indirect_impl(
        &mut self,
        ctx: &DecodeContext<'_>,
        imm: &CallIndirectImm,
        sig: &FunctionSig,
    ) -> BackendResult {
        check_call_sig(sig)?;
        if imm.table_index != 0 {
            return Err(unsupported(
                BailoutReason::ReferenceTypes,
                "call_indirect through a table other than 0",
            ));
        }
        let canonical_sig = ctx
            .module()
            .canonical_sig_id(imm.sig_index)
            .ok_or_else(|| internal("signature index out of range"))?;

        let index = self.masm.pop_to_modifiable_register(RegList::EMPTY)?;
        let mut pinned = RegList::EMPTY.with(index);
        let table = self.masm.get_unused_register(RegClass::Gp, pinned)?;
        pinned.set(table);
        let tmp = self.masm.get_unused_register(RegClass::Gp, pinned)?;
        pinned.set(tmp);
        let scratch = self.masm.get_unused_register(RegClass::Gp, pinned)?;

        let out_of_bounds = self.add_trap(RuntimeStub::TrapTableOutOfBounds, ctx.pc());
        self.masm.emit(Instr::LoadInstanceField {
            dst: tmp,
            field: InstanceField::IndirectFunctionTableSize,
        });
        self.masm.emit(Instr::CondJump {
            cond: Cond::AboveEqual,
            ty: ValueType::I32,
            lhs: index,
            rhs: Some(tmp),
            target: out_of_bounds,
        });

        if self.options.index_masking {
            // mask = ((index - size) & !index) >> 31, all ones when in bounds.
            self.masm.emit(Instr::BinOp {
                op: Opcode::I32Sub,
                dst: scratch,
                lhs: index,
                rhs: tmp,
            });
            self.masm.emit(Instr::BinOpImm {
                op: Opcode::I32Xor,
                dst: tmp,
                lhs: index,
                imm: -1,
            });
            self.masm.emit(Instr::BinOp {
                op: Opcode::I32And,
                dst: scratch,
                lhs: scratch,
                rhs: tmp,
            });
            self.masm.emit(Instr::BinOpImm {
                op: Opcode::I32ShrS,
                dst: scratch,
                lhs: scratch,
                imm: 31,
            });
            self.masm.emit(Instr::BinOp {
                op: Opcode::I32And,
                dst: index,
                lhs: index,
                rhs: scratch,
            });
        }

        // Signature ids are 4 bytes per entry.
        let sig_mismatch = self.add_trap(RuntimeStub::TrapFuncSigMismatch, ctx.pc());
        self.masm.emit(Instr::LoadInstanceField {
            dst: table,
            field: InstanceField::IndirectFunctionTableSigIds,
        });
        self.masm.emit(Instr::BinOpImm {
            op: Opcode::I32Shl,
            dst: index,
            lhs: index,
            imm: 2,
        });
        self.masm.emit(Instr::Load {
            ty: LoadType::I32Load,
            dst: scratch,
            base: table,
            index: Some(index),
            offset: 0,
        });
        self.masm
            .load_bits(ValueType::I32, tmp, u64::from(canonical_sig));
        self.masm.emit(Instr::CondJump {
            cond: Cond::NotEqual,
            ty: ValueType::I32,
            lhs: scratch,
            rhs: Some(tmp),
            target: sig_mismatch,
        });

        // Targets and refs are 8 bytes per entry.
        self.masm.emit(Instr::BinOp {
            op: Opcode::I32Add,
            dst: index,
            lhs: index,
            rhs: index,
        });
        self.masm.emit(Instr::LoadInstanceField {
            dst: table,
            field: InstanceField::IndirectFunctionTableTargets,
        });
        self.masm.emit(Instr::Load {
            ty: LoadType::I64Load,
            dst: CALL_TARGET_REG,
            base: table,
            index: Some(index),
            offset: 0,
        });
        self.masm.emit(Instr::LoadInstanceField {
            dst: table,
            field: InstanceField::IndirectFunctionTableRefs,
        });
        self.masm.emit(Instr::Load {
            ty: LoadType::I64Load,
            dst: INSTANCE_REG,
            base: table,
            index: Some(index),
            offset: 0,
        });
        let call = Instr::CallIndirect {
            target: CALL_TARGET_REG,
        };
        self.emit_call(ctx, sig, call)
    }

    // ========================================================================
    // Runtime Stubs
    // ========================================================================

    /// Call `stub` with the top `params.len()` values as arguments. An
    /// `immediate` is passed in the next argument register.
    pub(super) fn call_runtime_stub(
        &mut self,
        ctx: &DecodeContext<'_>,
        stub: RuntimeStub,
        params: &[ValueType],
        immediate: Option<u64>,
        result: Option<ValueType>,
    ) -> BackendResult {
        self.masm.prepare_call(params)?;
        if let Some(bits) = immediate {
            let reg = PARAM_GP
                .get(params.len())
                .copied()
                .ok_or_else(|| internal("no register left for a stub immediate"))?;
            self.masm.load_bits(ValueType::I64, reg, bits);
        }
        self.record_source_position(ctx.pc());
        self.masm.emit(Instr::CallRuntimeStub { stub });
        self.register_debug_entry(AssumeSpilling::DidSpill);
        self.masm.finish_call(result)
    }

    /// Bulk memory and table operations taking `arg_count` `i32` operands.
    pub(super) fn bulk_operation(
        &mut self,
        ctx: &DecodeContext<'_>,
        stub: RuntimeStub,
        arg_count: usize,
        immediate: Option<u64>,
    ) -> Result<(), Bailout> {
        if !self.options.runtime_bulk_operations {
            return Err(unsupported(BailoutReason::BulkOperations, format!("{stub:?}")));
        }
        let params = [ValueType::I32; 3];
        let params = params
            .get(..arg_count)
            .ok_or_else(|| internal("too many bulk operation operands"))?;
        self.call_runtime_stub(ctx, stub, params, immediate, None)
    }
}
