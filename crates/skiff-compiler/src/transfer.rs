//! Moving values between two cache states.
//!
//! A [`StackTransferRecipe`] collects the moves needed to turn one value
//! layout into another and emits them in an order that never overwrites a
//! value before it was read:
//!
//! 1. stack slots that a pending register load reads, but a stack store is
//!    about to overwrite, are copied out of the way;
//! 2. stack stores, in slot order;
//! 3. register-to-register moves, resolved as a parallel move with cycles
//!    broken through a temporary stack slot;
//! 4. register loads from constants and stack slots.

use skiff_core::ValueType;

use crate::assembler::{Assembler, Instr};
use crate::cache_state::{Location, VarState};
use crate::register::{NUM_REGISTERS, Reg};

#[derive(Debug, Clone, Copy)]
enum StackStore {
    Move { ty: ValueType, dst: u32, src: u32 },
    Register { ty: ValueType, dst: u32, src: Reg },
    Const { ty: ValueType, dst: u32, value: i32 },
}

impl StackStore {
    fn dst(&self) -> u32 {
        match *self {
            StackStore::Move { dst, .. }
            | StackStore::Register { dst, .. }
            | StackStore::Const { dst, .. } => dst,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum RegisterLoad {
    Const { ty: ValueType, value: i32 },
    Stack { ty: ValueType, offset: u32 },
}

#[derive(Debug, Clone, Copy)]
struct RegisterMove {
    ty: ValueType,
    dst: Reg,
    src: Reg,
}

/// Pending moves between value locations.
#[derive(Debug)]
pub struct StackTransferRecipe {
    stores: Vec<StackStore>,
    moves: Vec<RegisterMove>,
    loads: Vec<(Reg, RegisterLoad)>,
    /// First free offset above every live slot; temporaries go here.
    next_scratch: u32,
}

impl StackTransferRecipe {
    /// `scratch_base` must lie at or above every spill slot of both states.
    pub fn new(scratch_base: u32) -> Self {
        Self {
            stores: Vec::new(),
            moves: Vec::new(),
            loads: Vec::new(),
            next_scratch: scratch_base,
        }
    }

    /// Make `dst` hold the value described by `src`.
    pub fn transfer(&mut self, dst: &VarState, src: &VarState) {
        match dst.loc {
            Location::Stack => self.store(dst.ty, dst.offset, src),
            Location::Register(reg) => self.load_into(reg, src),
            // Constants in a target state are values no path can change.
            Location::IntConst(_) => {}
        }
    }

    /// Write `src` to the spill slot at `offset`.
    pub fn store(&mut self, ty: ValueType, offset: u32, src: &VarState) {
        let store = match src.loc {
            Location::Stack if src.offset == offset => return,
            Location::Stack => StackStore::Move {
                ty,
                dst: offset,
                src: src.offset,
            },
            Location::Register(reg) => StackStore::Register {
                ty,
                dst: offset,
                src: reg,
            },
            Location::IntConst(value) => StackStore::Const {
                ty,
                dst: offset,
                value,
            },
        };
        self.stores.push(store);
    }

    /// Load `src` into `reg`.
    pub fn load_into(&mut self, reg: Reg, src: &VarState) {
        debug_assert!(
            self.moves.iter().all(|m| m.dst != reg)
                && self.loads.iter().all(|&(dst, _)| dst != reg),
            "{reg} targeted twice"
        );
        match src.loc {
            Location::Register(from) if from == reg => {}
            Location::Register(from) => self.moves.push(RegisterMove {
                ty: src.ty,
                dst: reg,
                src: from,
            }),
            Location::IntConst(value) => self.loads.push((
                reg,
                RegisterLoad::Const {
                    ty: src.ty,
                    value,
                },
            )),
            Location::Stack => self.loads.push((
                reg,
                RegisterLoad::Stack {
                    ty: src.ty,
                    offset: src.offset,
                },
            )),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty() && self.moves.is_empty() && self.loads.is_empty()
    }

    fn scratch_slot(&mut self) -> u32 {
        self.next_scratch += 8;
        self.next_scratch
    }

    /// Emit everything. Returns the deepest spill offset used.
    pub fn execute(mut self, asm: &mut Assembler) -> u32 {
        self.rescue_overwritten_sources(asm);

        for store in std::mem::take(&mut self.stores) {
            let instr = match store {
                StackStore::Move { ty, dst, src } => Instr::MoveStackValue {
                    ty,
                    dst_offset: dst,
                    src_offset: src,
                },
                StackStore::Register { ty, dst, src } => Instr::Spill {
                    ty,
                    offset: dst,
                    src,
                },
                StackStore::Const { ty, dst, value } => Instr::SpillConst {
                    ty,
                    offset: dst,
                    value,
                },
            };
            asm.emit(instr);
        }

        self.execute_moves(asm);

        for (dst, load) in std::mem::take(&mut self.loads) {
            let instr = match load {
                RegisterLoad::Const { ty, value } => Instr::LoadConst {
                    ty,
                    dst,
                    bits: const_bits(ty, value),
                },
                RegisterLoad::Stack { ty, offset } => Instr::Fill { ty, dst, offset },
            };
            asm.emit(instr);
        }
        self.next_scratch
    }

    /// Copy stack sources that a store would clobber before the loads run.
    fn rescue_overwritten_sources(&mut self, asm: &mut Assembler) {
        for i in 0..self.loads.len() {
            let RegisterLoad::Stack { ty, offset } = self.loads[i].1 else {
                continue;
            };
            if self.stores.iter().any(|store| store.dst() == offset) {
                let scratch = self.scratch_slot();
                asm.emit(Instr::MoveStackValue {
                    ty,
                    dst_offset: scratch,
                    src_offset: offset,
                });
                self.loads[i].1 = RegisterLoad::Stack {
                    ty,
                    offset: scratch,
                };
            }
        }
    }

    fn execute_moves(&mut self, asm: &mut Assembler) {
        let mut src_uses = [0u32; NUM_REGISTERS];
        for m in &self.moves {
            src_uses[m.src.code() as usize] += 1;
        }

        let mut pending = std::mem::take(&mut self.moves);
        while !pending.is_empty() {
            let before = pending.len();
            pending.retain(|m| {
                if src_uses[m.dst.code() as usize] > 0 {
                    return true;
                }
                asm.emit(Instr::Move {
                    ty: m.ty,
                    dst: m.dst,
                    src: m.src,
                });
                src_uses[m.src.code() as usize] -= 1;
                false
            });
            if pending.len() == before {
                // Every remaining destination is still needed as a source:
                // a cycle. Park one source in a stack slot.
                let m = pending.remove(0);
                let scratch = self.scratch_slot();
                asm.emit(Instr::Spill {
                    ty: m.ty,
                    offset: scratch,
                    src: m.src,
                });
                src_uses[m.src.code() as usize] -= 1;
                self.loads.push((
                    m.dst,
                    RegisterLoad::Stack {
                        ty: m.ty,
                        offset: scratch,
                    },
                ));
            }
        }
    }
}

/// Register bits of an integer constant slot.
pub fn const_bits(ty: ValueType, value: i32) -> u64 {
    if ty == ValueType::I32 {
        u64::from(value as u32)
    } else {
        value as i64 as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::disassemble;

    fn reg_slot(reg: Reg) -> VarState {
        VarState {
            ty: ValueType::I32,
            loc: Location::Register(reg),
            offset: 24,
        }
    }

    fn stack_slot(offset: u32) -> VarState {
        VarState {
            ty: ValueType::I32,
            loc: Location::Stack,
            offset,
        }
    }

    fn emitted(recipe: StackTransferRecipe) -> Vec<Instr<u32>> {
        let mut asm = Assembler::new();
        recipe.execute(&mut asm);
        disassemble(asm.code())
            .unwrap()
            .into_iter()
            .map(|(_, i)| i)
            .collect()
    }

    #[test]
    fn swap_is_broken_through_a_scratch_slot() {
        let (a, b) = (Reg::gp(0), Reg::gp(1));
        let mut recipe = StackTransferRecipe::new(64);
        recipe.load_into(a, &reg_slot(b));
        recipe.load_into(b, &reg_slot(a));
        let instrs = emitted(recipe);
        assert_eq!(
            instrs,
            vec![
                Instr::Spill {
                    ty: ValueType::I32,
                    offset: 72,
                    src: b
                },
                Instr::Move {
                    ty: ValueType::I32,
                    dst: b,
                    src: a
                },
                Instr::Fill {
                    ty: ValueType::I32,
                    dst: a,
                    offset: 72
                },
            ]
        );
    }

    #[test]
    fn chains_are_ordered_without_temporaries() {
        let (a, b, c) = (Reg::gp(0), Reg::gp(1), Reg::gp(2));
        let mut recipe = StackTransferRecipe::new(64);
        recipe.load_into(a, &reg_slot(b));
        recipe.load_into(b, &reg_slot(c));
        let instrs = emitted(recipe);
        assert_eq!(
            instrs,
            vec![
                Instr::Move {
                    ty: ValueType::I32,
                    dst: a,
                    src: b
                },
                Instr::Move {
                    ty: ValueType::I32,
                    dst: b,
                    src: c
                },
            ]
        );
    }

    #[test]
    fn stores_run_before_registers_are_overwritten() {
        let (a, b) = (Reg::gp(0), Reg::gp(1));
        let mut recipe = StackTransferRecipe::new(64);
        recipe.load_into(a, &reg_slot(b));
        recipe.store(ValueType::I32, 32, &reg_slot(a));
        let instrs = emitted(recipe);
        assert_eq!(
            instrs[0],
            Instr::Spill {
                ty: ValueType::I32,
                offset: 32,
                src: a
            }
        );
        assert_eq!(
            instrs[1],
            Instr::Move {
                ty: ValueType::I32,
                dst: a,
                src: b
            }
        );
    }

    #[test]
    fn clobbered_stack_sources_are_rescued() {
        let r = Reg::gp(0);
        let mut recipe = StackTransferRecipe::new(64);
        recipe.load_into(r, &stack_slot(32));
        recipe.store(ValueType::I32, 32, &stack_slot(40));
        let instrs = emitted(recipe);
        assert_eq!(
            instrs,
            vec![
                Instr::MoveStackValue {
                    ty: ValueType::I32,
                    dst_offset: 72,
                    src_offset: 32
                },
                Instr::MoveStackValue {
                    ty: ValueType::I32,
                    dst_offset: 32,
                    src_offset: 40
                },
                Instr::Fill {
                    ty: ValueType::I32,
                    dst: r,
                    offset: 72
                },
            ]
        );
    }

    #[test]
    fn constants_materialize_with_their_width() {
        assert_eq!(const_bits(ValueType::I32, -1), 0xFFFF_FFFF);
        assert_eq!(const_bits(ValueType::I64, -1), u64::MAX);
    }
}
