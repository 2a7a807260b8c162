//! Code buffer, labels and relocations.
//!
//! The [`Assembler`] appends encoded [`Instr`]s to a byte buffer. Branches
//! may target labels that are bound later; their displacements are patched
//! when the label is bound. Direct calls record a [`Relocation`] so the
//! embedder can link the callee.

pub mod ops;

use std::fmt;

use tracing::trace;

pub use ops::{Cond, DisasmError, InstanceField, Instr, MachineOp, RuntimeStub, disassemble};

/// A branch target inside the code buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// 32-bit function index of a direct call.
    DirectCall,
}

/// A location in the code that must be patched at link time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Offset of the patched field.
    pub offset: u32,
    pub kind: RelocKind,
    /// Callee function index.
    pub target: u32,
}

/// Emits instructions into a growable code buffer.
#[derive(Debug, Default)]
pub struct Assembler {
    code: Vec<u8>,
    /// Bound position of each label.
    labels: Vec<Option<u32>>,
    /// `(label, displacement offset)` of branches to unbound labels.
    pending: Vec<(Label, u32)>,
    relocations: Vec<Relocation>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current end of the code buffer.
    #[inline]
    pub fn pc_offset(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn new_label(&mut self) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(None);
        label
    }

    pub fn is_bound(&self, label: Label) -> bool {
        self.labels[label.0 as usize].is_some()
    }

    /// Bind `label` to the current position and patch every branch waiting
    /// for it.
    pub fn bind(&mut self, label: Label) {
        let pos = self.pc_offset();
        debug_assert!(!self.is_bound(label), "{label} bound twice");
        self.labels[label.0 as usize] = Some(pos);

        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].0 == label {
                let (_, at) = self.pending.swap_remove(i);
                self.patch_displacement(at, pos);
            } else {
                i += 1;
            }
        }
    }

    /// Append an instruction. Returns its offset.
    pub fn emit(&mut self, instr: Instr<Label>) -> u32 {
        let offset = self.pc_offset();
        instr.encode(&mut self.code);
        trace!(offset, %instr, "emit");

        if let Instr::Call { func_index } = instr {
            self.relocations.push(Relocation {
                offset: offset + 1,
                kind: RelocKind::DirectCall,
                target: func_index,
            });
        }
        if let Some(label) = instr.target() {
            let at = self.pc_offset() - 4;
            match self.labels[label.0 as usize] {
                Some(pos) => self.patch_displacement(at, pos),
                None => self.pending.push((label, at)),
            }
        }
        offset
    }

    /// Displacements are relative to the end of the instruction, which is
    /// the end of the displacement field itself.
    fn patch_displacement(&mut self, at: u32, target: u32) {
        let rel = i64::from(target) - i64::from(at + 4);
        let bytes = (rel as i32).to_le_bytes();
        let at = at as usize;
        self.code[at..at + 4].copy_from_slice(&bytes);
    }

    /// Overwrite the frame size operand of the `EnterFrame` at `offset`.
    pub fn patch_frame_size(&mut self, offset: u32, frame_size: u32) {
        let at = offset as usize;
        debug_assert_eq!(self.code[at], u8::from(MachineOp::EnterFrame));
        self.code[at + 1..at + 5].copy_from_slice(&frame_size.to_le_bytes());
    }

    /// `true` when every label used by a branch has been bound.
    pub fn all_labels_resolved(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn finish(self) -> (Vec<u8>, Vec<Relocation>) {
        debug_assert!(
            self.all_labels_resolved(),
            "unbound labels: {:?}",
            self.pending
        );
        (self.code, self.relocations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::Reg;
    use skiff_core::ValueType;

    #[test]
    fn forward_branch_is_patched_on_bind() {
        let mut asm = Assembler::new();
        let done = asm.new_label();
        asm.emit(Instr::CondJump {
            cond: Cond::Equal,
            ty: ValueType::I32,
            lhs: Reg::gp(0),
            rhs: None,
            target: done,
        });
        asm.emit(Instr::AssertUnreachable);
        let bound_at = asm.pc_offset();
        asm.bind(done);
        asm.emit(Instr::Ret);

        let instrs = disassemble(asm.code()).unwrap();
        assert_eq!(instrs[0].1.target(), Some(bound_at));
        assert!(asm.all_labels_resolved());
    }

    #[test]
    fn backward_branch_is_patched_immediately() {
        let mut asm = Assembler::new();
        let top = asm.new_label();
        asm.bind(top);
        asm.emit(Instr::AssertUnreachable);
        asm.emit(Instr::Jump { target: top });
        let instrs = disassemble(asm.code()).unwrap();
        assert_eq!(instrs[1].1, Instr::Jump { target: 0 });
    }

    #[test]
    fn direct_calls_are_relocated() {
        let mut asm = Assembler::new();
        asm.emit(Instr::Ret);
        let at = asm.emit(Instr::Call { func_index: 7 });
        let (code, relocations) = asm.finish();
        assert_eq!(
            relocations,
            vec![Relocation {
                offset: at + 1,
                kind: RelocKind::DirectCall,
                target: 7
            }]
        );
        let field = &code[(at + 1) as usize..(at + 5) as usize];
        assert_eq!(field, &7u32.to_le_bytes());
    }

    #[test]
    fn frame_size_is_patched_in_place() {
        let mut asm = Assembler::new();
        let enter = asm.emit(Instr::EnterFrame { frame_size: 0 });
        asm.emit(Instr::Ret);
        asm.patch_frame_size(enter, 48);
        let instrs = disassemble(asm.code()).unwrap();
        assert_eq!(instrs[0].1, Instr::EnterFrame { frame_size: 48 });
    }
}
