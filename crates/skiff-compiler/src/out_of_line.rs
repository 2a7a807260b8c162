//! Rarely taken paths, emitted after the function body.
//!
//! The main code only branches to an out-of-line label. Each entry calls a
//! runtime stub: traps never come back, stack checks restore the live
//! registers and jump back to their continuation.
//!
//! Live registers are either pushed around the call or, when a debug side
//! table is recorded, written to their spill slots and filled afterwards.

use skiff_core::ValueType;

use crate::assembler::{Instr, Label, RuntimeStub};
use crate::cache_state::INSTANCE_SLOT_OFFSET;
use crate::debug_side_table::{DebugSideTableBuilder, EntryId};
use crate::macro_asm::MacroAssembler;
use crate::pipeline::{ProtectedInstruction, SourcePosition};
use crate::register::{INSTANCE_REG, Reg, RegList};

/// A register-held value written to its spill slot around a stub call, so a
/// debugger can inspect and modify it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpilledRegister {
    pub ty: ValueType,
    pub reg: Reg,
    pub offset: u32,
}

#[derive(Debug, Clone)]
pub struct OutOfLineCode {
    pub label: Label,
    /// Where execution resumes. `None` for traps.
    pub continuation: Option<Label>,
    pub stub: RuntimeStub,
    /// Bytecode offset of the instruction that branches here.
    pub position: u32,
    pub regs_to_save: RegList,
    /// Code offset of a memory access that faults into this trap.
    pub trapping_pc: Option<u32>,
    pub spilled: Vec<SpilledRegister>,
    pub debug_entry: Option<EntryId>,
}

impl OutOfLineCode {
    pub fn trap(label: Label, stub: RuntimeStub, position: u32) -> Self {
        debug_assert!(stub.is_trap());
        Self {
            label,
            continuation: None,
            stub,
            position,
            regs_to_save: RegList::EMPTY,
            trapping_pc: None,
            spilled: Vec::new(),
            debug_entry: None,
        }
    }

    pub fn stack_check(
        label: Label,
        continuation: Label,
        position: u32,
        regs_to_save: RegList,
    ) -> Self {
        Self {
            label,
            continuation: Some(continuation),
            stub: RuntimeStub::StackGuard,
            position,
            regs_to_save,
            trapping_pc: None,
            spilled: Vec::new(),
            debug_entry: None,
        }
    }

    pub fn with_trapping_pc(mut self, pc: u32) -> Self {
        self.trapping_pc = Some(pc);
        self
    }

    pub fn with_debug_entry(mut self, entry: Option<EntryId>) -> Self {
        self.debug_entry = entry;
        self
    }

    pub fn with_spilled(mut self, spilled: Vec<SpilledRegister>) -> Self {
        self.spilled = spilled;
        self
    }

    /// Emit the code at the current end of the buffer.
    pub fn generate(
        &self,
        masm: &mut MacroAssembler,
        source_positions: &mut Vec<SourcePosition>,
        protected_instructions: &mut Vec<ProtectedInstruction>,
        side_table: Option<&mut DebugSideTableBuilder>,
    ) {
        masm.bind(self.label);
        if let Some(instr_offset) = self.trapping_pc {
            protected_instructions.push(ProtectedInstruction {
                instr_offset,
                landing_offset: masm.pc_offset(),
            });
        }

        debug_assert!(self.regs_to_save.is_empty() || self.spilled.is_empty());
        if !self.regs_to_save.is_empty() {
            masm.emit(Instr::PushRegisters {
                regs: self.regs_to_save,
            });
        } else {
            for spilled in &self.spilled {
                masm.spill(spilled.ty, spilled.offset, spilled.reg);
            }
        }

        source_positions.push(SourcePosition {
            code_offset: masm.pc_offset(),
            source_offset: self.position,
        });
        masm.emit(Instr::CallRuntimeStub { stub: self.stub });
        if let (Some(id), Some(builder)) = (self.debug_entry, side_table) {
            builder.set_pc_offset(id, masm.pc_offset());
        }

        let Some(continuation) = self.continuation else {
            masm.emit(Instr::AssertUnreachable);
            return;
        };
        if !self.regs_to_save.is_empty() {
            masm.emit(Instr::PopRegisters {
                regs: self.regs_to_save,
            });
        } else {
            for spilled in &self.spilled {
                masm.fill(spilled.ty, spilled.reg, spilled.offset);
            }
            masm.fill(ValueType::I64, INSTANCE_REG, INSTANCE_SLOT_OFFSET);
        }
        masm.emit(Instr::Jump {
            target: continuation,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::disassemble;

    fn instrs(masm: MacroAssembler) -> Vec<Instr<u32>> {
        let asm = masm.into_assembler();
        disassemble(asm.code())
            .unwrap()
            .into_iter()
            .map(|(_, i)| i)
            .collect()
    }

    #[test]
    fn trap_records_its_landing_pad() {
        let mut masm = MacroAssembler::new();
        let label = masm.new_label();
        masm.emit(Instr::Jump { target: label });
        let ool =
            OutOfLineCode::trap(label, RuntimeStub::TrapMemOutOfBounds, 12).with_trapping_pc(0);

        let mut positions = Vec::new();
        let mut protected = Vec::new();
        ool.generate(&mut masm, &mut positions, &mut protected, None);

        let landing = ProtectedInstruction {
            instr_offset: 0,
            landing_offset: 5,
        };
        let position = SourcePosition {
            code_offset: 5,
            source_offset: 12,
        };
        assert_eq!(protected, vec![landing]);
        assert_eq!(positions, vec![position]);
        let instrs = instrs(masm);
        let call = Instr::CallRuntimeStub {
            stub: RuntimeStub::TrapMemOutOfBounds,
        };
        assert_eq!(instrs[1], call);
        assert_eq!(instrs[2], Instr::AssertUnreachable);
    }

    #[test]
    fn stack_check_restores_registers_and_returns() {
        let mut masm = MacroAssembler::new();
        let label = masm.new_label();
        let cont = masm.new_label();
        masm.bind(cont);
        let saved = RegList::from_regs(&[Reg::gp(0), Reg::fp(2)]);
        let ool = OutOfLineCode::stack_check(label, cont, 3, saved);
        ool.generate(&mut masm, &mut Vec::new(), &mut Vec::new(), None);

        let instrs = instrs(masm);
        assert_eq!(
            instrs,
            vec![
                Instr::PushRegisters { regs: saved },
                Instr::CallRuntimeStub {
                    stub: RuntimeStub::StackGuard
                },
                Instr::PopRegisters { regs: saved },
                Instr::Jump { target: 0 },
            ]
        );
    }

    #[test]
    fn spilled_registers_are_written_around_the_stub_instead_of_pushed() {
        let mut masm = MacroAssembler::new();
        let label = masm.new_label();
        let cont = masm.new_label();
        masm.bind(cont);
        let spilled = vec![
            SpilledRegister {
                ty: ValueType::I32,
                reg: Reg::gp(1),
                offset: 24,
            },
            SpilledRegister {
                ty: ValueType::F64,
                reg: Reg::fp(0),
                offset: 32,
            },
        ];
        let ool = OutOfLineCode::stack_check(label, cont, 3, RegList::EMPTY).with_spilled(spilled);
        ool.generate(&mut masm, &mut Vec::new(), &mut Vec::new(), None);

        let instrs = instrs(masm);
        assert_eq!(
            instrs,
            vec![
                Instr::Spill {
                    ty: ValueType::I32,
                    offset: 24,
                    src: Reg::gp(1)
                },
                Instr::Spill {
                    ty: ValueType::F64,
                    offset: 32,
                    src: Reg::fp(0)
                },
                Instr::CallRuntimeStub {
                    stub: RuntimeStub::StackGuard
                },
                Instr::Fill {
                    ty: ValueType::I32,
                    dst: Reg::gp(1),
                    offset: 24
                },
                Instr::Fill {
                    ty: ValueType::F64,
                    dst: Reg::fp(0),
                    offset: 32
                },
                Instr::Fill {
                    ty: ValueType::I64,
                    dst: INSTANCE_REG,
                    offset: INSTANCE_SLOT_OFFSET
                },
                Instr::Jump { target: 0 },
            ]
        );
    }

    #[test]
    fn trap_spills_before_calling_the_stub() {
        let mut masm = MacroAssembler::new();
        let label = masm.new_label();
        let spilled = vec![SpilledRegister {
            ty: ValueType::I64,
            reg: Reg::gp(2),
            offset: 40,
        }];
        let ool = OutOfLineCode::trap(label, RuntimeStub::TrapDivByZero, 9).with_spilled(spilled);
        let mut positions = Vec::new();
        ool.generate(&mut masm, &mut positions, &mut Vec::new(), None);

        let instrs = instrs(masm);
        assert_eq!(
            instrs,
            vec![
                Instr::Spill {
                    ty: ValueType::I64,
                    offset: 40,
                    src: Reg::gp(2)
                },
                Instr::CallRuntimeStub {
                    stub: RuntimeStub::TrapDivByZero
                },
                Instr::AssertUnreachable,
            ]
        );
        assert_eq!(positions.len(), 1);
    }
}
