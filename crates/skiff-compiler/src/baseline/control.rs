//! Function entry, structured control flow and branches.

use rustc_hash::FxHashMap;
use skiff_core::{Bailout, BailoutReason, ValueType};
use skiff_decoder::{BackendResult, BranchTable, Control, DecodeContext, Opcode};

use super::{BaselineCompiler, ControlData, ElseState, check_value_type, internal, unsupported};
use crate::assembler::{Cond, Instr, Label};
use crate::cache_state::{CacheState, INSTANCE_SLOT_OFFSET};
use crate::register::{
    INSTANCE_REG, PARAM_FP, PARAM_GP, Reg, RegClass, RegList, SCRATCH_FP, SCRATCH_GP, return_reg,
};

/// Up to this many declared locals, integer locals start out as constant
/// zero instead of a zeroed stack slot.
const MAX_CONSTANT_LOCALS: usize = 16;

fn check_block_types(block: &Control<'_>) -> BackendResult {
    for &ty in block.start_merge.types.iter().chain(block.end_merge.types) {
        check_value_type(ty, "block value")?;
    }
    Ok(())
}

impl BaselineCompiler<'_> {
    // ========================================================================
    // Function Entry
    // ========================================================================

    pub(super) fn start_function_impl(&mut self, ctx: &DecodeContext<'_>) -> BackendResult {
        let sig = ctx.sig();
        if sig.result_count() > 1 {
            return Err(unsupported(BailoutReason::MultiValue, "multiple return values"));
        }
        for &ty in sig.results() {
            check_value_type(ty, "result")?;
        }
        for &ty in ctx.locals() {
            check_value_type(ty, "local")?;
        }
        self.masm.set_num_locals(ctx.num_locals());
        self.min_memory_size = ctx.module().min_memory_size();
        self.max_memory_size = ctx.module().max_memory_size();
        Ok(())
    }

    pub(super) fn start_function_body_impl(&mut self, ctx: &DecodeContext<'_>) -> BackendResult {
        let sig = ctx.sig();
        self.frame_setup_offset = self.masm.emit(Instr::EnterFrame { frame_size: 0 });
        self.masm
            .spill(ValueType::I64, INSTANCE_SLOT_OFFSET, INSTANCE_REG);

        self.process_parameters(sig.params())?;
        let declared = ctx
            .locals()
            .get(sig.param_count()..)
            .ok_or_else(|| internal("fewer locals than parameters"))?;
        self.declare_locals(declared);

        self.stack_check(ctx.pc());
        if self.options.trace_entry {
            self.trace_function_entry(ctx.pc());
        }

        let label = self.masm.new_label();
        self.control.push(ControlData::new(label));
        Ok(())
    }

    /// Bind each parameter to its argument register, or load it from the
    /// caller's frame once the registers of its class are used up.
    fn process_parameters(&mut self, params: &[ValueType]) -> BackendResult {
        let mut next_gp = PARAM_GP.iter();
        let mut next_fp = PARAM_FP.iter();
        let mut stack_index = 0;
        for &ty in params {
            let class = RegClass::for_type(ty);
            let param_reg = match class {
                RegClass::Gp => next_gp.next(),
                RegClass::Fp => next_fp.next(),
            };
            if let Some(&reg) = param_reg {
                self.masm.push_register(ty, reg)?;
                continue;
            }

            match self.masm.state().unused_register(class, RegList::EMPTY) {
                Some(reg) => {
                    self.masm.emit(Instr::LoadStackArg {
                        ty,
                        dst: reg,
                        index: stack_index,
                    });
                    self.masm.push_register(ty, reg)?;
                }
                None => {
                    let scratch = match class {
                        RegClass::Gp => SCRATCH_GP,
                        RegClass::Fp => SCRATCH_FP,
                    };
                    self.masm.emit(Instr::LoadStackArg {
                        ty,
                        dst: scratch,
                        index: stack_index,
                    });
                    self.masm.push_stack(ty);
                    let offset = self.masm.state().top_spill_offset();
                    self.masm.spill(ty, offset, scratch);
                }
            }
            stack_index += 1;
        }
        Ok(())
    }

    fn declare_locals(&mut self, locals: &[ValueType]) {
        let first = self.masm.state().height();
        let few = locals.len() <= MAX_CONSTANT_LOCALS;
        for &ty in locals {
            match ty {
                ValueType::I32 | ValueType::I64 if few => self.masm.push_const(ty, 0),
                _ => self.masm.push_stack(ty),
            }
        }

        let stack_offsets = self.masm.state().slots()[first as usize..]
            .iter()
            .filter(|slot| slot.is_stack())
            .map(|slot| slot.offset);
        let (low, high) = stack_offsets.fold((u32::MAX, 0), |(low, high), offset| {
            (low.min(offset), high.max(offset))
        });
        if low <= high {
            self.masm.emit(Instr::FillStackSlotsWithZero {
                start: low - 8,
                size: high - low + 8,
            });
        }
    }

    pub(super) fn return_impl(&mut self, ctx: &DecodeContext<'_>) -> BackendResult {
        if let Some(&ty) = ctx.sig().results().first() {
            let result = self.masm.peek_slot(0)?;
            self.masm.load_slot_into(&result, return_reg(ty));
        }
        self.masm.emit(Instr::LeaveFrame);
        self.masm.emit(Instr::Ret);
        Ok(())
    }

    // ========================================================================
    // Structured Control
    // ========================================================================

    pub(super) fn block_impl(&mut self, block: &Control<'_>) -> BackendResult {
        check_block_types(block)?;
        let label = self.masm.new_label();
        self.control.push(ControlData::new(label));
        Ok(())
    }

    pub(super) fn loop_impl(
        &mut self,
        ctx: &DecodeContext<'_>,
        block: &Control<'_>,
    ) -> BackendResult {
        check_block_types(block)?;
        // Back edges merge into the header state, which must give every
        // value its own location.
        self.masm.spill_locals();
        self.masm.materialize_constants(block.start_merge.arity());
        self.masm.unshare_registers();

        let label = self.masm.new_label();
        self.masm.bind(label);
        let mut data = ControlData::new(label);
        data.label_state = Some(self.masm.state().split());
        self.control.push(data);

        self.stack_check(ctx.pc());
        Ok(())
    }

    pub(super) fn if_impl(&mut self, block: &Control<'_>) -> BackendResult {
        check_block_types(block)?;
        let else_label = self.masm.new_label();
        self.jump_if_false(else_label)?;

        let label = self.masm.new_label();
        let mut data = ControlData::new(label);
        data.else_state = Some(ElseState {
            label: else_label,
            state: self.masm.state().split(),
        });
        self.control.push(data);
        Ok(())
    }

    pub(super) fn else_impl(&mut self, block: &Control<'_>) -> BackendResult {
        let index = self.control_index(0)?;
        let num_locals = self.masm.num_locals();
        if block.reachable() {
            let data = &mut self.control[index];
            let target = data.label_state.get_or_insert_with(|| {
                CacheState::init_merge(
                    self.masm.state(),
                    num_locals,
                    block.end_merge.arity(),
                    block.stack_depth,
                )
            });
            self.masm.merge_full_stack_with(target);
            self.masm.emit(Instr::Jump { target: data.label });
        }

        let else_state = self.control[index]
            .else_state
            .take()
            .ok_or_else(|| internal("else without if"))?;
        self.masm.bind(else_state.label);
        self.masm.steal_state(else_state.state);
        Ok(())
    }

    pub(super) fn fall_thru_to_impl(&mut self, block: &Control<'_>) -> BackendResult {
        let index = self.control_index(0)?;
        let num_locals = self.masm.num_locals();
        match &self.control[index].label_state {
            Some(target) => self.masm.merge_full_stack_with(target),
            None => {
                let target = CacheState::init_merge(
                    self.masm.state(),
                    num_locals,
                    block.end_merge.arity(),
                    block.stack_depth,
                );
                self.control[index].label_state = Some(target);
            }
        }
        Ok(())
    }

    pub(super) fn pop_control_impl(&mut self, block: &Control<'_>) -> BackendResult {
        let data = self
            .control
            .pop()
            .ok_or_else(|| internal("control stack out of sync"))?;
        if block.is_loop() {
            return Ok(());
        }

        let ControlData {
            label,
            label_state,
            else_state,
        } = data;
        if block.is_onearmed_if() {
            let else_state = else_state.ok_or_else(|| internal("if without else state"))?;
            self.finish_one_armed_if(block, label, label_state, else_state);
        } else if let Some(target) = label_state {
            if block.reachable() {
                self.masm.merge_full_stack_with(&target);
            }
            self.masm.steal_state(target);
        }

        if !self.masm.is_bound(label) {
            self.masm.bind(label);
        }
        Ok(())
    }

    /// The implicit `else` of an `if` passes its parameters through as its
    /// results.
    fn finish_one_armed_if(
        &mut self,
        block: &Control<'_>,
        label: Label,
        label_state: Option<CacheState>,
        else_state: ElseState,
    ) {
        let reachable = block.reachable();
        let target = match label_state {
            Some(target) => Some(target),
            None if reachable => Some(CacheState::init_merge(
                &else_state.state,
                self.masm.num_locals(),
                block.start_merge.arity(),
                block.stack_depth,
            )),
            None => None,
        };

        let Some(target) = target else {
            self.masm.bind(else_state.label);
            self.masm.steal_state(else_state.state);
            return;
        };
        if reachable {
            self.masm.merge_full_stack_with(&target);
            self.masm.emit(Instr::Jump { target: label });
        }
        self.masm.bind(else_state.label);
        self.masm.steal_state(else_state.state);
        self.masm.merge_full_stack_with(&target);
        self.masm.steal_state(target);
    }

    // ========================================================================
    // Branches
    // ========================================================================

    pub(super) fn br_or_ret_impl(&mut self, ctx: &DecodeContext<'_>, depth: u32) -> BackendResult {
        if depth + 1 >= ctx.control_depth() {
            return self.return_impl(ctx);
        }
        let index = self.control_index(depth)?;
        let target_block = ctx.control_at(depth);
        let arity = target_block.br_merge().arity();
        let num_locals = self.masm.num_locals();

        let data = &mut self.control[index];
        let target = data.label_state.get_or_insert_with(|| {
            CacheState::init_merge(
                self.masm.state(),
                num_locals,
                arity,
                target_block.stack_depth,
            )
        });
        self.masm.merge_stack_with(target, arity);
        self.masm.emit(Instr::Jump { target: data.label });
        Ok(())
    }

    pub(super) fn br_if_impl(&mut self, ctx: &DecodeContext<'_>, depth: u32) -> BackendResult {
        let cont = self.masm.new_label();
        self.jump_if_false(cont)?;
        self.br_or_ret_impl(ctx, depth)?;
        self.masm.bind(cont);
        Ok(())
    }

    pub(super) fn br_table_impl(
        &mut self,
        ctx: &DecodeContext<'_>,
        table: &BranchTable<'_>,
    ) -> BackendResult {
        let key = self.masm.pop_to_register(RegList::EMPTY)?;
        let count = table.table_count();
        let mut br_targets = FxHashMap::default();

        if count > 0 {
            let default_label = self.masm.new_label();
            self.masm.emit(Instr::CondJumpImm {
                cond: Cond::AboveEqual,
                ty: ValueType::I32,
                lhs: key,
                imm: i64::from(count),
                target: default_label,
            });
            self.generate_br_table(ctx, table, key, 0, count, &mut br_targets)?;
            self.masm.bind(default_label);
        }
        self.generate_br_case(ctx, table.default_target(), &mut br_targets)
    }

    /// Binary search over the entries `[min, max)`.
    fn generate_br_table(
        &mut self,
        ctx: &DecodeContext<'_>,
        table: &BranchTable<'_>,
        key: Reg,
        min: u32,
        max: u32,
        br_targets: &mut FxHashMap<u32, Label>,
    ) -> BackendResult {
        debug_assert!(min < max);
        if max == min + 1 {
            return self.generate_br_case(ctx, table.target(min), br_targets);
        }
        let split = min + (max - min) / 2;
        let upper_half = self.masm.new_label();
        self.masm.emit(Instr::CondJumpImm {
            cond: Cond::AboveEqual,
            ty: ValueType::I32,
            lhs: key,
            imm: i64::from(split),
            target: upper_half,
        });
        self.generate_br_table(ctx, table, key, min, split, br_targets)?;
        self.masm.bind(upper_half);
        self.generate_br_table(ctx, table, key, split, max, br_targets)
    }

    /// Each depth is lowered once; later entries jump to the first copy.
    fn generate_br_case(
        &mut self,
        ctx: &DecodeContext<'_>,
        depth: u32,
        br_targets: &mut FxHashMap<u32, Label>,
    ) -> BackendResult {
        let label = *br_targets
            .entry(depth)
            .or_insert_with(|| self.masm.new_label());
        if self.masm.is_bound(label) {
            self.masm.emit(Instr::Jump { target: label });
            return Ok(());
        }
        self.masm.bind(label);
        self.br_or_ret_impl(ctx, depth)
    }

    // ========================================================================
    // Conditions
    // ========================================================================

    /// Whether a comparison can leave its result to the branch that follows.
    pub(super) fn fuses_with_branch(&self, ctx: &DecodeContext<'_>) -> bool {
        const BR_IF: u8 = 0x0D;
        const IF: u8 = 0x04;
        matches!(ctx.lookahead(), Some(BR_IF | IF)) && !self.has_breakpoint(ctx.position())
    }

    /// Pop the condition and branch to `target` when it is zero.
    pub(super) fn jump_if_false(&mut self, target: Label) -> Result<(), Bailout> {
        let instr = match self.outstanding_op.take() {
            Some(Opcode::I32Eqz) => {
                let value = self.masm.pop_to_register(RegList::EMPTY)?;
                Instr::CondJump {
                    cond: Cond::NotEqual,
                    ty: ValueType::I32,
                    lhs: value,
                    rhs: None,
                    target,
                }
            }
            Some(op) => {
                let cond = Cond::for_i32_comparison(op)
                    .ok_or_else(|| internal("fused operator is not an i32 comparison"))?
                    .negate();
                match self.masm.peek_slot(0)?.i32_const() {
                    Some(imm) => {
                        self.masm.pop_slot()?;
                        let lhs = self.masm.pop_to_register(RegList::EMPTY)?;
                        Instr::CondJumpImm {
                            cond,
                            ty: ValueType::I32,
                            lhs,
                            imm: i64::from(imm),
                            target,
                        }
                    }
                    None => {
                        let rhs = self.masm.pop_to_register(RegList::EMPTY)?;
                        let lhs = self.masm.pop_to_register(RegList::EMPTY.with(rhs))?;
                        Instr::CondJump {
                            cond,
                            ty: ValueType::I32,
                            lhs,
                            rhs: Some(rhs),
                            target,
                        }
                    }
                }
            }
            None => {
                let value = self.masm.pop_to_register(RegList::EMPTY)?;
                Instr::CondJump {
                    cond: Cond::Equal,
                    ty: ValueType::I32,
                    lhs: value,
                    rhs: None,
                    target,
                }
            }
        };
        self.masm.emit(instr);
        Ok(())
    }
}
