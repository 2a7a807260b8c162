//! Constants, operators, locals and `select`.

use skiff_core::ValueType;
use skiff_decoder::{BackendResult, DecodeContext, Opcode};

use super::BaselineCompiler;
use crate::assembler::{Cond, Instr, RuntimeStub};
use crate::cache_state::Location;
use crate::register::{RegClass, RegList};

/// Float-to-integer conversions that trap on NaN and out-of-range inputs.
fn is_trapping_conversion(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::I32TruncF32S
            | Opcode::I32TruncF32U
            | Opcode::I32TruncF64S
            | Opcode::I32TruncF64U
            | Opcode::I64TruncF32S
            | Opcode::I64TruncF32U
            | Opcode::I64TruncF64S
            | Opcode::I64TruncF64U
    )
}

/// Operators with an immediate form for a constant right-hand side.
fn has_immediate_form(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::I32Add
            | Opcode::I32Sub
            | Opcode::I32Mul
            | Opcode::I32And
            | Opcode::I32Or
            | Opcode::I32Xor
            | Opcode::I32Shl
            | Opcode::I32ShrS
            | Opcode::I32ShrU
            | Opcode::I64Add
            | Opcode::I64Sub
            | Opcode::I64And
            | Opcode::I64Or
            | Opcode::I64Xor
            | Opcode::I64Shl
            | Opcode::I64ShrS
            | Opcode::I64ShrU
    )
}

fn is_division(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::I32DivS
            | Opcode::I32DivU
            | Opcode::I32RemS
            | Opcode::I32RemU
            | Opcode::I64DivS
            | Opcode::I64DivU
            | Opcode::I64RemS
            | Opcode::I64RemU
    )
}

impl BaselineCompiler<'_> {
    // ========================================================================
    // Constants
    // ========================================================================

    pub(super) fn i64_const_impl(&mut self, value: i64) -> BackendResult {
        match i32::try_from(value) {
            Ok(small) => {
                self.masm.push_const(ValueType::I64, small);
                Ok(())
            }
            Err(_) => {
                let reg = self.masm.get_unused_register(RegClass::Gp, RegList::EMPTY)?;
                self.masm.load_bits(ValueType::I64, reg, value as u64);
                self.masm.push_register(ValueType::I64, reg)
            }
        }
    }

    pub(super) fn float_const_impl(&mut self, ty: ValueType, bits: u64) -> BackendResult {
        let reg = self.masm.get_unused_register(RegClass::Fp, RegList::EMPTY)?;
        self.masm.load_bits(ty, reg, bits);
        self.masm.push_register(ty, reg)
    }

    pub(super) fn ref_is_null_impl(&mut self) -> BackendResult {
        let src = self.masm.pop_to_register(RegList::EMPTY)?;
        let dst = self
            .masm
            .get_unused_register_from(RegClass::Gp, RegList::from_regs(&[src]), RegList::EMPTY)?;
        self.masm.emit(Instr::UnOp {
            op: Opcode::I64Eqz,
            dst,
            src,
        });
        self.masm.push_register(ValueType::I32, dst)?;
        Ok(())
    }

    // ========================================================================
    // Operators
    // ========================================================================

    pub(super) fn unop_impl(
        &mut self,
        ctx: &DecodeContext<'_>,
        op: Opcode,
        result: ValueType,
    ) -> BackendResult {
        if op == Opcode::I32Eqz && self.fuses_with_branch(ctx) {
            self.outstanding_op = Some(op);
            return Ok(());
        }

        let src = self.masm.pop_to_register(RegList::EMPTY)?;
        let dst = self.masm.get_unused_register_from(
            RegClass::for_type(result),
            RegList::from_regs(&[src]),
            RegList::EMPTY,
        )?;
        if is_trapping_conversion(op) {
            let trap = self.add_trap(RuntimeStub::TrapFloatUnrepresentable, ctx.pc());
            self.masm.emit(Instr::UnOpTrapping { op, dst, src, trap });
        } else {
            self.masm.emit(Instr::UnOp { op, dst, src });
        }
        self.masm.push_register(result, dst)?;
        Ok(())
    }

    pub(super) fn binop_impl(
        &mut self,
        ctx: &DecodeContext<'_>,
        op: Opcode,
        operand: ValueType,
        result: ValueType,
    ) -> BackendResult {
        if Cond::for_i32_comparison(op).is_some() && self.fuses_with_branch(ctx) {
            self.outstanding_op = Some(op);
            return Ok(());
        }
        if is_division(op) {
            return self.division_impl(ctx, op, operand);
        }

        let result_class = RegClass::for_type(result);
        if has_immediate_form(op) {
            if let Some(imm) = self.masm.peek_slot(0)?.i32_const() {
                self.masm.pop_slot()?;
                let lhs = self.masm.pop_to_register(RegList::EMPTY)?;
                let dst = self.masm.get_unused_register_from(
                    result_class,
                    RegList::from_regs(&[lhs]),
                    RegList::EMPTY,
                )?;
                self.masm.emit(Instr::BinOpImm { op, dst, lhs, imm });
                self.masm.push_register(result, dst)?;
                return Ok(());
            }
        }

        let rhs = self.masm.pop_to_register(RegList::EMPTY)?;
        let lhs = self.masm.pop_to_register(RegList::EMPTY.with(rhs))?;
        let dst = self.masm.get_unused_register_from(
            result_class,
            RegList::from_regs(&[lhs, rhs]),
            RegList::EMPTY,
        )?;
        self.masm.emit(Instr::BinOp { op, dst, lhs, rhs });
        self.masm.push_register(result, dst)?;
        Ok(())
    }

    /// Integer division and remainder, with the zero-divisor check and, for
    /// signed division, the `MIN / -1` overflow check in front.
    fn division_impl(
        &mut self,
        ctx: &DecodeContext<'_>,
        op: Opcode,
        ty: ValueType,
    ) -> BackendResult {
        let rhs = self.masm.pop_to_register(RegList::EMPTY)?;
        let lhs = self.masm.pop_to_register(RegList::EMPTY.with(rhs))?;
        let operands = RegList::from_regs(&[lhs, rhs]);
        let dst = self.masm.get_unused_register(RegClass::Gp, operands)?;

        let is_rem = matches!(
            op,
            Opcode::I32RemS | Opcode::I32RemU | Opcode::I64RemS | Opcode::I64RemU
        );
        let zero_stub = if is_rem {
            RuntimeStub::TrapRemByZero
        } else {
            RuntimeStub::TrapDivByZero
        };
        let div_by_zero = self.add_trap(zero_stub, ctx.pc());
        self.masm.emit(Instr::CondJump {
            cond: Cond::Equal,
            ty,
            lhs: rhs,
            rhs: None,
            target: div_by_zero,
        });

        if matches!(op, Opcode::I32DivS | Opcode::I64DivS) {
            let min = if ty == ValueType::I32 {
                i64::from(i32::MIN)
            } else {
                i64::MIN
            };
            let unrepresentable = self.add_trap(RuntimeStub::TrapDivUnrepresentable, ctx.pc());
            let cont = self.masm.new_label();
            self.masm.emit(Instr::CondJumpImm {
                cond: Cond::NotEqual,
                ty,
                lhs: rhs,
                imm: -1,
                target: cont,
            });
            self.masm.emit(Instr::CondJumpImm {
                cond: Cond::Equal,
                ty,
                lhs,
                imm: min,
                target: unrepresentable,
            });
            self.masm.bind(cont);
        }

        self.masm.emit(Instr::BinOp { op, dst, lhs, rhs });
        self.masm.push_register(ty, dst)?;
        Ok(())
    }

    // ========================================================================
    // Parametric
    // ========================================================================

    pub(super) fn select_impl(&mut self, ty: ValueType) -> BackendResult {
        let cond = self.masm.pop_to_register(RegList::EMPTY)?;
        let fval = self.masm.pop_to_register(RegList::EMPTY.with(cond))?;
        let pinned = RegList::from_regs(&[cond, fval]);
        let tval = self.masm.pop_to_register(pinned)?;
        let dst = self.masm.get_unused_register_from(
            RegClass::for_type(ty),
            RegList::from_regs(&[tval, fval]),
            RegList::from_regs(&[cond]),
        )?;

        let case_false = self.masm.new_label();
        let done = self.masm.new_label();
        self.masm.emit(Instr::CondJump {
            cond: Cond::Equal,
            ty: ValueType::I32,
            lhs: cond,
            rhs: None,
            target: case_false,
        });
        self.masm.move_reg(ty, dst, tval);
        self.masm.emit(Instr::Jump { target: done });
        self.masm.bind(case_false);
        self.masm.move_reg(ty, dst, fval);
        self.masm.bind(done);
        self.masm.push_register(ty, dst)?;
        Ok(())
    }

    // ========================================================================
    // Locals
    // ========================================================================

    pub(super) fn local_get_impl(&mut self, index: u32) -> BackendResult {
        let slot = *self.masm.state().slot(index);
        match slot.loc {
            Location::Register(reg) => self.masm.push_register(slot.ty, reg),
            Location::IntConst(value) => {
                self.masm.push_const(slot.ty, value);
                Ok(())
            }
            Location::Stack => {
                let reg = self
                    .masm
                    .get_unused_register(slot.reg_class(), RegList::EMPTY)?;
                self.masm.fill(slot.ty, reg, slot.offset);
                self.masm.push_register(slot.ty, reg)
            }
        }
    }

    pub(super) fn local_set_impl(&mut self, index: u32, is_tee: bool) -> BackendResult {
        let source = self.masm.peek_slot(0)?;
        match source.loc {
            Location::Register(reg) => self.masm.state_mut().make_register(index, reg),
            Location::IntConst(value) => self.masm.state_mut().make_const(index, value),
            Location::Stack => self.local_set_from_stack_slot(index, source.offset)?,
        }
        if !is_tee {
            self.masm.pop_slot()?;
        }
        Ok(())
    }

    /// Load a spilled stack value into the local's register, reusing the
    /// register when no other slot shares it.
    fn local_set_from_stack_slot(&mut self, index: u32, src_offset: u32) -> BackendResult {
        let local = *self.masm.state().slot(index);
        if let Some(reg) = local.reg() {
            if self.masm.state().use_count(reg) == 1 {
                self.masm.fill(local.ty, reg, src_offset);
                return Ok(());
            }
        }
        self.masm.state_mut().make_stack(index);
        let reg = self
            .masm
            .get_unused_register(local.reg_class(), RegList::EMPTY)?;
        self.masm.fill(local.ty, reg, src_offset);
        self.masm.state_mut().make_register(index, reg);
        Ok(())
    }
}
