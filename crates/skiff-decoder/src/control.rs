//! Control-stack entries tracked by the decoder.

use skiff_core::ValueType;

/// An operand on the decoder's abstract value stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Value {
    pub ty: ValueType,
    /// Offset of the instruction that produced the value.
    pub pc: u32,
}

impl Value {
    pub fn new(ty: ValueType, pc: u32) -> Self {
        Self { ty, pc }
    }
}

/// Whether the code inside a control construct can execute.
///
/// Reachability only narrows while a construct is open. `else`, `catch` and
/// `catch_all` reset it to what the enclosing construct allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    /// Reachable by the type rules and by the code generator's knowledge.
    Reachable,
    /// Reachable by the type rules, but a backend proved it never executes
    /// (e.g. after a statically out-of-bounds access).
    SpecOnlyReachable,
    /// Follows an unconditional branch, `return`, `unreachable` or `throw`.
    /// The stack is polymorphic.
    Unreachable,
}

impl Reachability {
    /// Reachability of a construct nested inside one with this state.
    #[inline]
    pub fn inner(self) -> Reachability {
        match self {
            Reachability::Reachable => Reachability::Reachable,
            _ => Reachability::SpecOnlyReachable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Block,
    Loop,
    If,
    IfElse,
    Try,
    TryCatch,
    TryCatchAll,
}

/// Types flowing into or out of a control construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Merge<'a> {
    pub types: &'a [ValueType],
    /// Some reachable branch or fallthrough targets this merge.
    pub reached: bool,
}

impl<'a> Merge<'a> {
    pub fn new(types: &'a [ValueType]) -> Self {
        Self {
            types,
            reached: false,
        }
    }

    #[inline]
    pub fn arity(&self) -> u32 {
        self.types.len() as u32
    }
}

/// One open block, loop, if or try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Control<'a> {
    pub kind: ControlKind,
    /// Value-stack height when the construct was entered, after its
    /// parameters were popped.
    pub stack_depth: u32,
    pub reachability: Reachability,
    /// Parameter types.
    pub start_merge: Merge<'a>,
    /// Result types.
    pub end_merge: Merge<'a>,
    /// Offset of the opening instruction.
    pub pc: u32,
}

impl<'a> Control<'a> {
    #[inline]
    pub fn reachable(&self) -> bool {
        self.reachability == Reachability::Reachable
    }

    #[inline]
    pub fn unreachable(&self) -> bool {
        self.reachability == Reachability::Unreachable
    }

    #[inline]
    pub fn is_loop(&self) -> bool {
        self.kind == ControlKind::Loop
    }

    #[inline]
    pub fn is_if(&self) -> bool {
        matches!(self.kind, ControlKind::If | ControlKind::IfElse)
    }

    /// An `if` whose `end` was reached without an `else`.
    #[inline]
    pub fn is_onearmed_if(&self) -> bool {
        self.kind == ControlKind::If
    }

    #[inline]
    pub fn is_try(&self) -> bool {
        matches!(
            self.kind,
            ControlKind::Try | ControlKind::TryCatch | ControlKind::TryCatchAll
        )
    }

    #[inline]
    pub fn is_incomplete_try(&self) -> bool {
        self.kind == ControlKind::Try
    }

    /// Branches to a loop go to its header and carry its parameters, every
    /// other construct is targeted at its end.
    #[inline]
    pub fn br_merge(&self) -> &Merge<'a> {
        if self.is_loop() {
            &self.start_merge
        } else {
            &self.end_merge
        }
    }

    #[inline]
    pub fn br_merge_mut(&mut self) -> &mut Merge<'a> {
        if self.is_loop() {
            &mut self.start_merge
        } else {
            &mut self.end_merge
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(kind: ControlKind) -> Control<'static> {
        Control {
            kind,
            stack_depth: 0,
            reachability: Reachability::Reachable,
            start_merge: Merge::new(&[ValueType::I32]),
            end_merge: Merge::new(&[ValueType::I64, ValueType::F32]),
            pc: 0,
        }
    }

    #[test]
    fn inner_reachability() {
        assert_eq!(Reachability::Reachable.inner(), Reachability::Reachable);
        assert_eq!(
            Reachability::Unreachable.inner(),
            Reachability::SpecOnlyReachable
        );
        assert_eq!(
            Reachability::SpecOnlyReachable.inner(),
            Reachability::SpecOnlyReachable
        );
    }

    #[test]
    fn loops_branch_to_their_parameters() {
        assert_eq!(control(ControlKind::Loop).br_merge().arity(), 1);
        assert_eq!(control(ControlKind::Block).br_merge().arity(), 2);
    }

    #[test]
    fn br_merge_mut_marks_the_right_merge() {
        let mut c = control(ControlKind::Loop);
        c.br_merge_mut().reached = true;
        assert!(c.start_merge.reached);
        assert!(!c.end_merge.reached);
    }
}
