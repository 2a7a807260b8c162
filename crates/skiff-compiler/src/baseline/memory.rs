//! Globals and linear memory.

use skiff_core::{Bailout, BailoutReason, GlobalDesc, ValueType};
use skiff_decoder::{BackendResult, DecodeContext, LoadType, MemArg, Opcode, StoreType};

use super::{BaselineCompiler, check_value_type, internal, unsupported};
use crate::assembler::{Cond, InstanceField, Instr, RuntimeStub};
use crate::register::{Reg, RegClass, RegList};

/// log2 of the page size.
const PAGE_SIZE_LOG2: i32 = 16;

/// Where a memory access goes once its index is known to be in bounds.
#[derive(Debug, Clone, Copy)]
struct Address {
    /// `None` when a constant index was folded into `offset`.
    index: Option<Reg>,
    offset: u32,
}

fn pinned_with(pinned: RegList, reg: Option<Reg>) -> RegList {
    match reg {
        Some(reg) => pinned.with(reg),
        None => pinned,
    }
}

impl BaselineCompiler<'_> {
    // ========================================================================
    // Globals
    // ========================================================================

    fn lookup_global(ctx: &DecodeContext<'_>, index: u32) -> Result<GlobalDesc, Bailout> {
        let global = *ctx
            .module()
            .global(index)
            .ok_or_else(|| internal("global index out of range"))?;
        if global.ty.is_reference() {
            return Err(unsupported(BailoutReason::ReferenceTypes, "reference-typed global"));
        }
        check_value_type(global.ty, "global")?;
        Ok(global)
    }

    /// Base register and offset of a global's storage.
    fn global_address(
        &mut self,
        global: &GlobalDesc,
        pinned: RegList,
    ) -> Result<(Reg, u32), Bailout> {
        let base = self.masm.get_unused_register(RegClass::Gp, pinned)?;
        if global.is_indirect() {
            let slot = global
                .offset
                .checked_mul(8)
                .ok_or_else(|| internal("imported global slot out of range"))?;
            self.masm.emit(Instr::LoadInstanceField {
                dst: base,
                field: InstanceField::ImportedMutableGlobals,
            });
            self.masm.emit(Instr::Load {
                ty: LoadType::I64Load,
                dst: base,
                base,
                index: None,
                offset: slot,
            });
            Ok((base, 0))
        } else {
            self.masm.emit(Instr::LoadInstanceField {
                dst: base,
                field: InstanceField::GlobalsStart,
            });
            Ok((base, global.offset))
        }
    }

    pub(super) fn global_get_impl(&mut self, ctx: &DecodeContext<'_>, index: u32) -> BackendResult {
        let global = Self::lookup_global(ctx, index)?;
        let (base, offset) = self.global_address(&global, RegList::EMPTY)?;
        let dst = self.masm.get_unused_register_from(
            RegClass::for_type(global.ty),
            RegList::from_regs(&[base]),
            RegList::EMPTY,
        )?;
        self.masm.emit(Instr::Load {
            ty: LoadType::for_value_type(global.ty),
            dst,
            base,
            index: None,
            offset,
        });
        self.masm.push_register(global.ty, dst)
    }

    pub(super) fn global_set_impl(&mut self, ctx: &DecodeContext<'_>, index: u32) -> BackendResult {
        let global = Self::lookup_global(ctx, index)?;
        let value = self.masm.pop_to_register(RegList::EMPTY)?;
        let (base, offset) = self.global_address(&global, RegList::EMPTY.with(value))?;
        self.masm.emit(Instr::Store {
            ty: StoreType::for_value_type(global.ty),
            base,
            index: None,
            offset,
            src: value,
        });
        Ok(())
    }

    // ========================================================================
    // Loads and Stores
    // ========================================================================

    pub(super) fn load_mem_impl(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        ty: LoadType,
        imm: &MemArg,
    ) -> BackendResult {
        let Some(address) = self.memory_address(ctx, ty.size(), imm.offset, RegList::EMPTY)? else {
            return Ok(());
        };
        let pinned = pinned_with(RegList::EMPTY, address.index);
        let base = self.masm.get_unused_register(RegClass::Gp, pinned)?;
        self.masm.emit(Instr::LoadInstanceField {
            dst: base,
            field: InstanceField::MemoryStart,
        });

        let value_ty = ty.value_type();
        let dst = self.masm.get_unused_register_from(
            RegClass::for_type(value_ty),
            pinned.with(base),
            RegList::EMPTY,
        )?;
        let instr_offset = self.masm.emit(Instr::Load {
            ty,
            dst,
            base,
            index: address.index,
            offset: address.offset,
        });
        self.protect_access(ctx, address, instr_offset);
        self.masm.push_register(value_ty, dst)
    }

    pub(super) fn store_mem_impl(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        ty: StoreType,
        imm: &MemArg,
    ) -> BackendResult {
        let value = self.masm.pop_to_register(RegList::EMPTY)?;
        let pinned = RegList::EMPTY.with(value);
        let Some(address) = self.memory_address(ctx, ty.size(), imm.offset, pinned)? else {
            return Ok(());
        };
        let pinned = pinned_with(pinned, address.index);
        let base = self.masm.get_unused_register(RegClass::Gp, pinned)?;
        self.masm.emit(Instr::LoadInstanceField {
            dst: base,
            field: InstanceField::MemoryStart,
        });
        let instr_offset = self.masm.emit(Instr::Store {
            ty,
            base,
            index: address.index,
            offset: address.offset,
            src: value,
        });
        self.protect_access(ctx, address, instr_offset);
        Ok(())
    }

    /// With a trap handler, an unchecked access that faults lands in an
    /// out-of-line trap.
    fn protect_access(&mut self, ctx: &DecodeContext<'_>, address: Address, instr_offset: u32) {
        if self.uses_trap_handler() && address.index.is_some() {
            self.add_trap_at(
                RuntimeStub::TrapMemOutOfBounds,
                ctx.pc(),
                Some(instr_offset),
            );
        }
    }

    /// Pop the index of an access of `access_size` bytes at `offset` and
    /// check it. Returns `None` when the access can never succeed; a trap
    /// has been emitted instead and the rest of the block is dead.
    fn memory_address(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        access_size: u32,
        offset: u32,
        pinned: RegList,
    ) -> Result<Option<Address>, Bailout> {
        let const_index = self
            .masm
            .peek_slot(0)?
            .i32_const()
            .map(|value| u64::from(value as u32));
        let access_end = u64::from(offset) + u64::from(access_size);

        if let Some(index) = const_index {
            if index + access_end <= self.min_memory_size {
                if let Ok(folded) = u32::try_from(index + u64::from(offset)) {
                    self.masm.pop_slot()?;
                    return Ok(Some(Address {
                        index: None,
                        offset: folded,
                    }));
                }
            }
        }

        if const_index.unwrap_or(0) + access_end > self.max_memory_size {
            self.masm.pop_slot()?;
            let trap = self.add_trap(RuntimeStub::TrapMemOutOfBounds, ctx.pc());
            self.masm.emit(Instr::Jump { target: trap });
            ctx.set_succeeding_code_dynamically_unreachable();
            return Ok(None);
        }

        if self.uses_trap_handler() {
            let index = self.masm.pop_to_register(pinned)?;
            return Ok(Some(Address {
                index: Some(index),
                offset,
            }));
        }

        let index = if self.options.index_masking {
            self.masm.pop_to_modifiable_register(pinned)?
        } else {
            self.masm.pop_to_register(pinned)?
        };
        self.bounds_check(ctx, index, access_size, offset, pinned)?;
        Ok(Some(Address {
            index: Some(index),
            offset,
        }))
    }

    /// Trap unless `index + offset + access_size <= memory size`.
    fn bounds_check(
        &mut self,
        ctx: &DecodeContext<'_>,
        index: Reg,
        access_size: u32,
        offset: u32,
        pinned: RegList,
    ) -> BackendResult {
        let end_offset = u64::from(offset) + u64::from(access_size) - 1;
        let pinned = pinned.with(index);
        let trap = self.add_trap(RuntimeStub::TrapMemOutOfBounds, ctx.pc());
        let mem_size = self.masm.get_unused_register(RegClass::Gp, pinned)?;
        let end = self
            .masm
            .get_unused_register(RegClass::Gp, pinned.with(mem_size))?;

        self.masm.emit(Instr::LoadInstanceField {
            dst: mem_size,
            field: InstanceField::MemorySize,
        });
        self.masm.load_bits(ValueType::I64, end, end_offset);
        // The memory never shrinks below its minimum, so a small enough
        // offset needs no check of its own.
        if end_offset >= self.min_memory_size {
            self.masm.emit(Instr::CondJump {
                cond: Cond::AboveEqual,
                ty: ValueType::I64,
                lhs: end,
                rhs: Some(mem_size),
                target: trap,
            });
        }
        // Compare against `size - end_offset`, which cannot underflow now.
        self.masm.emit(Instr::BinOp {
            op: Opcode::I64Sub,
            dst: end,
            lhs: mem_size,
            rhs: end,
        });
        self.masm.emit(Instr::CondJump {
            cond: Cond::AboveEqual,
            ty: ValueType::I64,
            lhs: index,
            rhs: Some(end),
            target: trap,
        });

        if self.options.index_masking {
            self.masm.emit(Instr::LoadInstanceField {
                dst: mem_size,
                field: InstanceField::MemoryMask,
            });
            self.masm.emit(Instr::BinOp {
                op: Opcode::I64And,
                dst: index,
                lhs: index,
                rhs: mem_size,
            });
        }
        Ok(())
    }

    pub(super) fn memory_size_impl(&mut self) -> BackendResult {
        let dst = self.masm.get_unused_register(RegClass::Gp, RegList::EMPTY)?;
        self.masm.emit(Instr::LoadInstanceField {
            dst,
            field: InstanceField::MemorySize,
        });
        self.masm.emit(Instr::BinOpImm {
            op: Opcode::I64ShrU,
            dst,
            lhs: dst,
            imm: PAGE_SIZE_LOG2,
        });
        self.masm.push_register(ValueType::I32, dst)
    }
}
