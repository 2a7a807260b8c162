//! The assembler together with the cache state it emits code for.
//!
//! Everything that both changes where values live and emits the code to
//! move them goes through here: register allocation with spilling, popping
//! values into registers, and merging into a label's expected state.

use skiff_core::{Bailout, BailoutReason, ValueType};

use crate::assembler::{Assembler, Instr, Label};
use crate::cache_state::{CacheState, INSTANCE_SLOT_OFFSET, Location, VarState};
use crate::register::{
    INSTANCE_REG, PARAM_FP, PARAM_GP, Reg, RegClass, RegList, SCRATCH_FP, SCRATCH_GP, return_reg,
};
use crate::transfer::{StackTransferRecipe, const_bits};

/// Frames are kept 16-byte aligned.
const FRAME_ALIGNMENT: u32 = 16;

#[derive(Debug, Default)]
pub struct MacroAssembler {
    asm: Assembler,
    state: CacheState,
    num_locals: u32,
}

fn underflow() -> Bailout {
    Bailout::new(BailoutReason::Other, "code generator value stack underflow")
}

impl MacroAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[inline]
    pub fn state(&self) -> &CacheState {
        &self.state
    }

    #[inline]
    pub fn state_mut(&mut self) -> &mut CacheState {
        &mut self.state
    }

    #[inline]
    pub fn num_locals(&self) -> u32 {
        self.num_locals
    }

    pub fn set_num_locals(&mut self, num_locals: u32) {
        self.num_locals = num_locals;
    }

    #[inline]
    pub fn pc_offset(&self) -> u32 {
        self.asm.pc_offset()
    }

    #[inline]
    pub fn emit(&mut self, instr: Instr<Label>) -> u32 {
        self.asm.emit(instr)
    }

    pub fn new_label(&mut self) -> Label {
        self.asm.new_label()
    }

    pub fn bind(&mut self, label: Label) {
        self.asm.bind(label);
    }

    pub fn is_bound(&self, label: Label) -> bool {
        self.asm.is_bound(label)
    }

    /// Frame size covering every spill slot handed out so far.
    pub fn frame_size(&self) -> u32 {
        self.state
            .max_spill_offset()
            .next_multiple_of(FRAME_ALIGNMENT)
    }

    pub fn into_assembler(self) -> Assembler {
        self.asm
    }

    pub fn assembler_mut(&mut self) -> &mut Assembler {
        &mut self.asm
    }

    // ========================================================================
    // Primitive Moves
    // ========================================================================

    pub fn move_reg(&mut self, ty: ValueType, dst: Reg, src: Reg) {
        if dst != src {
            self.asm.emit(Instr::Move { ty, dst, src });
        }
    }

    pub fn load_constant(&mut self, ty: ValueType, dst: Reg, value: i32) {
        self.asm.emit(Instr::LoadConst {
            ty,
            dst,
            bits: const_bits(ty, value),
        });
    }

    pub fn load_bits(&mut self, ty: ValueType, dst: Reg, bits: u64) {
        self.asm.emit(Instr::LoadConst { ty, dst, bits });
    }

    pub fn spill(&mut self, ty: ValueType, offset: u32, src: Reg) {
        self.asm.emit(Instr::Spill { ty, offset, src });
    }

    pub fn fill(&mut self, ty: ValueType, dst: Reg, offset: u32) {
        self.asm.emit(Instr::Fill { ty, dst, offset });
    }

    /// Materialize `slot` in `reg` without touching the cache state.
    pub fn load_slot_into(&mut self, slot: &VarState, reg: Reg) {
        match slot.loc {
            Location::Register(src) => self.move_reg(slot.ty, reg, src),
            Location::IntConst(value) => self.load_constant(slot.ty, reg, value),
            Location::Stack => self.fill(slot.ty, reg, slot.offset),
        }
    }

    // ========================================================================
    // Register Allocation
    // ========================================================================

    /// A register of `class` that backs no slot, spilling one if needed.
    pub fn get_unused_register(
        &mut self,
        class: RegClass,
        pinned: RegList,
    ) -> Result<Reg, Bailout> {
        match self.state.unused_register(class, pinned) {
            Some(reg) => Ok(reg),
            None => self.spill_one_register(class, pinned),
        }
    }

    /// Like [`get_unused_register`](Self::get_unused_register), but prefers
    /// one of `candidates` so the result can reuse an input register.
    pub fn get_unused_register_from(
        &mut self,
        class: RegClass,
        candidates: RegList,
        pinned: RegList,
    ) -> Result<Reg, Bailout> {
        let preferred = candidates
            .iter()
            .find(|&reg| reg.class() == class && !self.state.is_used(reg) && !pinned.has(reg));
        match preferred {
            Some(reg) => Ok(reg),
            None => self.get_unused_register(class, pinned),
        }
    }

    pub fn spill_one_register(&mut self, class: RegClass, pinned: RegList) -> Result<Reg, Bailout> {
        let Some(reg) = self.state.next_spill_register(class, pinned) else {
            return Err(Bailout::new(
                BailoutReason::Other,
                format!("every {class:?} register is pinned"),
            ));
        };
        self.spill_register(reg);
        Ok(reg)
    }

    /// Spill every slot backed by `reg`.
    pub fn spill_register(&mut self, reg: Reg) {
        let mut remaining = self.state.use_count(reg);
        let mut index = self.state.height();
        while remaining > 0 && index > 0 {
            index -= 1;
            let slot = *self.state.slot(index);
            if slot.reg() == Some(reg) {
                self.spill(slot.ty, slot.offset, reg);
                self.state.make_stack(index);
                remaining -= 1;
            }
        }
    }

    /// Move slot `index` to its spill slot.
    pub fn spill_slot(&mut self, index: u32) {
        let slot = *self.state.slot(index);
        match slot.loc {
            Location::Stack => return,
            Location::Register(reg) => self.spill(slot.ty, slot.offset, reg),
            Location::IntConst(value) => {
                self.asm.emit(Instr::SpillConst {
                    ty: slot.ty,
                    offset: slot.offset,
                    value,
                });
            }
        }
        self.state.make_stack(index);
    }

    pub fn spill_locals(&mut self) {
        for index in 0..self.num_locals {
            self.spill_slot(index);
        }
    }

    /// Spill every register-backed slot. Constants stay.
    pub fn spill_all_registers(&mut self) {
        for index in 0..self.state.height() {
            if self.state.slot(index).is_reg() {
                self.spill_slot(index);
            }
        }
    }

    // ========================================================================
    // Popping and Pushing
    // ========================================================================

    pub fn pop_slot(&mut self) -> Result<VarState, Bailout> {
        self.state.pop().ok_or_else(underflow)
    }

    pub fn peek_slot(&self, depth: u32) -> Result<VarState, Bailout> {
        self.state.peek(depth).copied().ok_or_else(underflow)
    }

    /// Pop the top value into a register. The register is released from the
    /// cache state, but may still back other slots.
    pub fn pop_to_register(&mut self, pinned: RegList) -> Result<Reg, Bailout> {
        let slot = self.pop_slot()?;
        Ok(match slot.loc {
            Location::Register(reg) => reg,
            Location::IntConst(value) => {
                let reg = self.get_unused_register(slot.reg_class(), pinned)?;
                self.load_constant(slot.ty, reg, value);
                reg
            }
            Location::Stack => {
                let reg = self.get_unused_register(slot.reg_class(), pinned)?;
                self.fill(slot.ty, reg, slot.offset);
                reg
            }
        })
    }

    /// Pop the top value into a register no other slot uses, so it can be
    /// overwritten.
    pub fn pop_to_modifiable_register(&mut self, pinned: RegList) -> Result<Reg, Bailout> {
        let slot = self.peek_slot(0)?;
        if let Some(reg) = slot.reg() {
            if self.state.use_count(reg) > 1 {
                self.pop_slot()?;
                let copy = self.get_unused_register(slot.reg_class(), pinned.with(reg))?;
                self.move_reg(slot.ty, copy, reg);
                return Ok(copy);
            }
        }
        self.pop_to_register(pinned)
    }

    /// Push a value held in `reg`. Fails when the register cannot hold a
    /// value of `ty`, which only unchecked ill-typed input produces.
    pub fn push_register(&mut self, ty: ValueType, reg: Reg) -> Result<(), Bailout> {
        if reg.class() != RegClass::for_type(ty) {
            return Err(Bailout::new(
                BailoutReason::Other,
                format!("{ty} value in {:?} register {reg}", reg.class()),
            ));
        }
        self.state.push_register(ty, reg);
        Ok(())
    }

    pub fn push_const(&mut self, ty: ValueType, value: i32) {
        self.state.push_const(ty, value);
    }

    /// Push a value that already lives in its spill slot.
    pub fn push_stack(&mut self, ty: ValueType) {
        self.state.push_stack(ty);
    }

    /// Turn constant merge values into registers or spilled values.
    pub fn materialize_constants(&mut self, count: u32) {
        let height = self.state.height();
        for index in height.saturating_sub(count)..height {
            let slot = *self.state.slot(index);
            if let Location::IntConst(value) = slot.loc {
                match self.state.unused_register(slot.reg_class(), RegList::EMPTY) {
                    Some(reg) => {
                        self.load_constant(slot.ty, reg, value);
                        self.state.make_register(index, reg);
                    }
                    None => self.spill_slot(index),
                }
            }
        }
    }

    /// Spill every slot whose register also backs a lower slot, so each
    /// register backs exactly one slot.
    pub fn unshare_registers(&mut self) {
        let mut seen = RegList::EMPTY;
        for index in 0..self.state.height() {
            let Some(reg) = self.state.slot(index).reg() else {
                continue;
            };
            if seen.has(reg) {
                self.spill_slot(index);
            } else {
                seen.set(reg);
            }
        }
    }

    // ========================================================================
    // Merges
    // ========================================================================

    fn scratch_base(&self, target: &CacheState) -> u32 {
        self.state
            .top_spill_offset()
            .max(target.top_spill_offset())
            .max(self.state.max_spill_offset())
    }

    fn run(&mut self, recipe: StackTransferRecipe) {
        let used = recipe.execute(&mut self.asm);
        self.state.record_spill_offset(used);
    }

    /// Transfer every slot into `target`, which must have the same height.
    pub fn merge_full_stack_with(&mut self, target: &CacheState) {
        debug_assert_eq!(self.state.height(), target.height());
        let mut recipe = StackTransferRecipe::new(self.scratch_base(target));
        for (dst, src) in target.slots().iter().zip(self.state.slots()) {
            recipe.transfer(dst, src);
        }
        self.run(recipe);
    }

    /// Transfer into `target` for a branch carrying the top `arity` values.
    /// Slots between the target height and the branch values are dropped.
    pub fn merge_stack_with(&mut self, target: &CacheState, arity: u32) {
        let height = self.state.height();
        let target_height = target.height();
        debug_assert!(target_height <= height && arity <= target_height);
        let stack_base = height - arity;
        let target_base = target_height - arity;

        let mut recipe = StackTransferRecipe::new(self.scratch_base(target));
        for i in 0..target_base {
            recipe.transfer(target.slot(i), self.state.slot(i));
        }
        for i in 0..arity {
            let dst = target.slot(target_base + i);
            recipe.transfer(dst, self.state.slot(stack_base + i));
        }
        self.run(recipe);
    }

    /// Make `target` the current state and keep the frame-size bookkeeping.
    pub fn steal_state(&mut self, target: CacheState) {
        self.state.steal(target);
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Move the top `params.len()` values into the argument registers and
    /// outgoing stack slots, spill every other register and drop the
    /// arguments. Afterwards no cache register is in use.
    pub fn prepare_call(&mut self, params: &[ValueType]) -> Result<(), Bailout> {
        let count = params.len() as u32;
        let height = self.state.height();
        let base = height.checked_sub(count).ok_or_else(underflow)?;

        for index in 0..base {
            if self.state.slot(index).is_reg() {
                self.spill_slot(index);
            }
        }

        let mut next_gp = 0;
        let mut next_fp = 0;
        let mut stack_index = 0;
        let scratch_base = self
            .state
            .max_spill_offset()
            .max(self.state.top_spill_offset());
        let mut recipe = StackTransferRecipe::new(scratch_base);
        for (i, &ty) in params.iter().enumerate() {
            let slot = *self.state.slot(base + i as u32);
            let reg = match RegClass::for_type(ty) {
                RegClass::Gp => {
                    next_gp += 1;
                    PARAM_GP.get(next_gp - 1).copied()
                }
                RegClass::Fp => {
                    next_fp += 1;
                    PARAM_FP.get(next_fp - 1).copied()
                }
            };
            match reg {
                Some(reg) => recipe.load_into(reg, &slot),
                None => {
                    // Stack arguments go out first; the register moves may
                    // overwrite their sources.
                    let src = match slot.loc {
                        Location::Register(reg) => reg,
                        _ => {
                            let scratch = scratch_register(slot.reg_class());
                            self.load_slot_into(&slot, scratch);
                            scratch
                        }
                    };
                    self.asm.emit(Instr::StoreStackArg {
                        ty,
                        index: stack_index,
                        src,
                    });
                    stack_index += 1;
                }
            }
        }
        self.run(recipe);
        self.state.drop_values(count);
        debug_assert!(self.state.used_registers().is_empty());
        Ok(())
    }

    /// Restore the instance register after a call and push the result.
    pub fn finish_call(&mut self, result: Option<ValueType>) -> Result<(), Bailout> {
        self.fill(ValueType::I64, INSTANCE_REG, INSTANCE_SLOT_OFFSET);
        match result {
            Some(ty) => self.push_register(ty, return_reg(ty)),
            None => Ok(()),
        }
    }
}

fn scratch_register(class: RegClass) -> Reg {
    match class {
        RegClass::Gp => SCRATCH_GP,
        RegClass::Fp => SCRATCH_FP,
    }
}
