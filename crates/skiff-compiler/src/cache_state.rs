//! Compile-time model of the value stack.
//!
//! The cache state mirrors the decoder's operand stack, prefixed by one slot
//! per local. Each slot knows where its value currently lives: in a
//! register, as an integer constant that has not been materialized, or in
//! its fixed spill slot in the frame. Register use counts let one register
//! back several slots (a `local.get` of a cached local, for instance).

use skiff_core::ValueType;

use crate::register::{NUM_REGISTERS, Reg, RegClass, RegList};

/// Frame bytes below the frame pointer that precede the first value slot.
pub const STATIC_FRAME_SIZE: u32 = 16;

/// Spill slot of the instance pointer.
pub const INSTANCE_SLOT_OFFSET: u32 = 16;

/// Size of the spill slot for a value of type `ty`.
#[inline]
pub fn slot_size(ty: ValueType) -> u32 {
    if ty == ValueType::V128 { 16 } else { 8 }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Register(Reg),
    /// An `i32`, or an `i64` that fits in 32 bits (sign-extended).
    IntConst(i32),
    Stack,
}

/// One slot of the cache state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarState {
    pub ty: ValueType,
    pub loc: Location,
    /// Spill slot offset below the frame pointer. Fixed for the lifetime of
    /// the slot, whether or not the value is currently spilled.
    pub offset: u32,
}

impl VarState {
    #[inline]
    pub fn is_reg(&self) -> bool {
        matches!(self.loc, Location::Register(_))
    }

    #[inline]
    pub fn is_const(&self) -> bool {
        matches!(self.loc, Location::IntConst(_))
    }

    #[inline]
    pub fn is_stack(&self) -> bool {
        self.loc == Location::Stack
    }

    #[inline]
    pub fn reg(&self) -> Option<Reg> {
        match self.loc {
            Location::Register(reg) => Some(reg),
            _ => None,
        }
    }

    #[inline]
    pub fn i32_const(&self) -> Option<i32> {
        match self.loc {
            Location::IntConst(value) => Some(value),
            _ => None,
        }
    }

    #[inline]
    pub fn reg_class(&self) -> RegClass {
        RegClass::for_type(self.ty)
    }
}

/// Register-cached view of locals plus operand stack.
#[derive(Debug, Clone)]
pub struct CacheState {
    stack: Vec<VarState>,
    used: RegList,
    use_counts: [u32; NUM_REGISTERS],
    /// Registers spilled most recently; skipped when picking the next
    /// register to spill.
    last_spilled: RegList,
    /// Deepest spill offset ever handed out, for the frame size.
    max_offset: u32,
}

impl Default for CacheState {
    fn default() -> Self {
        Self {
            stack: Vec::new(),
            used: RegList::EMPTY,
            use_counts: [0; NUM_REGISTERS],
            last_spilled: RegList::EMPTY,
            max_offset: STATIC_FRAME_SIZE,
        }
    }
}

impl CacheState {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Slots
    // ========================================================================

    #[inline]
    pub fn height(&self) -> u32 {
        self.stack.len() as u32
    }

    #[inline]
    pub fn slots(&self) -> &[VarState] {
        &self.stack
    }

    #[inline]
    pub fn slot(&self, index: u32) -> &VarState {
        &self.stack[index as usize]
    }

    /// The slot `depth` positions below the top.
    #[inline]
    pub fn peek(&self, depth: u32) -> Option<&VarState> {
        let len = self.stack.len();
        (len > depth as usize).then(|| &self.stack[len - 1 - depth as usize])
    }

    pub fn top_spill_offset(&self) -> u32 {
        self.stack.last().map_or(STATIC_FRAME_SIZE, |s| s.offset)
    }

    pub fn next_spill_offset(&self, ty: ValueType) -> u32 {
        let size = slot_size(ty);
        (self.top_spill_offset() + size).next_multiple_of(size)
    }

    pub fn max_spill_offset(&self) -> u32 {
        self.max_offset
    }

    pub fn record_spill_offset(&mut self, offset: u32) {
        self.max_offset = self.max_offset.max(offset);
    }

    fn push_slot(&mut self, ty: ValueType, loc: Location) {
        let offset = self.next_spill_offset(ty);
        self.record_spill_offset(offset);
        self.stack.push(VarState { ty, loc, offset });
    }

    pub fn push_register(&mut self, ty: ValueType, reg: Reg) {
        debug_assert_eq!(reg.class(), RegClass::for_type(ty));
        self.inc_used(reg);
        self.push_slot(ty, Location::Register(reg));
    }

    pub fn push_const(&mut self, ty: ValueType, value: i32) {
        self.push_slot(ty, Location::IntConst(value));
    }

    pub fn push_stack(&mut self, ty: ValueType) {
        self.push_slot(ty, Location::Stack);
    }

    /// Remove the top slot, releasing its register.
    pub fn pop(&mut self) -> Option<VarState> {
        let slot = self.stack.pop()?;
        if let Location::Register(reg) = slot.loc {
            self.dec_used(reg);
        }
        Some(slot)
    }

    pub fn drop_values(&mut self, count: u32) {
        for _ in 0..count {
            self.pop();
        }
    }

    /// Point slot `index` at `reg`, adjusting use counts.
    pub fn make_register(&mut self, index: u32, reg: Reg) {
        self.release(index);
        self.inc_used(reg);
        self.stack[index as usize].loc = Location::Register(reg);
    }

    pub fn make_const(&mut self, index: u32, value: i32) {
        self.release(index);
        self.stack[index as usize].loc = Location::IntConst(value);
    }

    /// Mark slot `index` as living in its spill slot. The caller emits the
    /// store.
    pub fn make_stack(&mut self, index: u32) {
        self.release(index);
        self.stack[index as usize].loc = Location::Stack;
    }

    fn release(&mut self, index: u32) {
        if let Location::Register(reg) = self.stack[index as usize].loc {
            self.dec_used(reg);
        }
    }

    // ========================================================================
    // Register Use
    // ========================================================================

    #[inline]
    pub fn inc_used(&mut self, reg: Reg) {
        self.used.set(reg);
        self.use_counts[reg.code() as usize] += 1;
    }

    #[inline]
    pub fn dec_used(&mut self, reg: Reg) {
        let count = &mut self.use_counts[reg.code() as usize];
        debug_assert!(*count > 0, "{reg} not in use");
        *count -= 1;
        if *count == 0 {
            self.used.clear(reg);
        }
    }

    #[inline]
    pub fn is_used(&self, reg: Reg) -> bool {
        self.used.has(reg)
    }

    #[inline]
    pub fn use_count(&self, reg: Reg) -> u32 {
        self.use_counts[reg.code() as usize]
    }

    #[inline]
    pub fn used_registers(&self) -> RegList {
        self.used
    }

    fn free_registers(&self, class: RegClass, pinned: RegList) -> RegList {
        class
            .cache_registers()
            .difference(self.used)
            .difference(pinned)
    }

    pub fn has_unused_register(&self, class: RegClass, pinned: RegList) -> bool {
        !self.free_registers(class, pinned).is_empty()
    }

    pub fn unused_register(&self, class: RegClass, pinned: RegList) -> Option<Reg> {
        self.free_registers(class, pinned).first()
    }

    /// Pick the register to spill when none is free, rotating through the
    /// candidates so the same register is not spilled over and over.
    pub fn next_spill_register(&mut self, class: RegClass, pinned: RegList) -> Option<Reg> {
        let candidates = class.cache_registers().difference(pinned);
        let mut unspilled = candidates.difference(self.last_spilled);
        if unspilled.is_empty() {
            unspilled = candidates;
            self.last_spilled = RegList::EMPTY;
        }
        let reg = unspilled.first()?;
        self.last_spilled.set(reg);
        Some(reg)
    }

    /// Registers backing slots `[from, height)`.
    pub fn registers_from(&self, from: u32) -> RegList {
        self.stack[from as usize..]
            .iter()
            .filter_map(VarState::reg)
            .collect()
    }

    // ========================================================================
    // Merges
    // ========================================================================

    /// A copy to be restored later at a merge or `else`.
    pub fn split(&self) -> CacheState {
        self.clone()
    }

    /// Continue with `other`, keeping the deepest spill offset seen.
    pub fn steal(&mut self, other: CacheState) {
        let max_offset = self.max_offset.max(other.max_offset);
        *self = other;
        self.max_offset = max_offset;
    }

    /// Build the state every path to a merge point agrees on.
    ///
    /// ```text
    /// source: |-- locals --|-- below --|-- discarded --|-- merge --|
    /// target: |-- locals --|-- below --|-- merge --|
    /// ```
    ///
    /// Values below the construct keep their location; constants are
    /// allowed there since no path can change them. Locals and merge values
    /// keep their register when it is not taken yet and otherwise get a
    /// free register or their spill slot.
    pub fn init_merge(
        source: &CacheState,
        num_locals: u32,
        arity: u32,
        stack_depth: u32,
    ) -> CacheState {
        let below_end = num_locals + stack_depth;
        let source_merge_start = source.height() - arity;
        debug_assert!(below_end <= source_merge_start);

        let mut target = CacheState {
            max_offset: source.max_offset,
            ..CacheState::default()
        };
        let mut taken = RegList::EMPTY;

        let mut slots: Vec<(u32, VarState)> = Vec::with_capacity((below_end + arity) as usize);
        // Merge values first, locals second, the rest last, so the values
        // that change most get first pick of the registers.
        for i in 0..arity {
            let src = *source.slot(source_merge_start + i);
            let merged = Self::merge_slot(source, src, &mut taken, false);
            slots.push((below_end + i, merged));
        }
        for i in 0..num_locals {
            let src = *source.slot(i);
            slots.push((i, Self::merge_slot(source, src, &mut taken, false)));
        }
        for i in num_locals..below_end {
            let src = *source.slot(i);
            slots.push((i, Self::merge_slot(source, src, &mut taken, true)));
        }
        slots.sort_by_key(|&(index, _)| index);

        for (_, slot) in slots {
            match slot.loc {
                Location::Register(reg) => target.push_register(slot.ty, reg),
                Location::IntConst(value) => target.push_const(slot.ty, value),
                Location::Stack => target.push_stack(slot.ty),
            }
        }
        target
    }

    fn merge_slot(
        source: &CacheState,
        src: VarState,
        taken: &mut RegList,
        allow_const: bool,
    ) -> VarState {
        let loc = match src.loc {
            Location::Register(reg) if !taken.has(reg) => {
                taken.set(reg);
                Location::Register(reg)
            }
            Location::IntConst(value) if allow_const => Location::IntConst(value),
            Location::Stack => Location::Stack,
            _ => {
                // Prefer registers the source does not occupy, so reaching
                // the merge point needs fewer moves.
                let class = src.reg_class();
                let free = class.cache_registers().difference(*taken);
                let preferred = free.difference(source.used).first();
                match preferred.or_else(|| free.first()) {
                    Some(reg) => {
                        taken.set(reg);
                        Location::Register(reg)
                    }
                    None => Location::Stack,
                }
            }
        };
        VarState { loc, ..src }
    }

    /// Recount register uses from the slots. For debug assertions.
    pub fn is_consistent(&self) -> bool {
        let mut counts = [0u32; NUM_REGISTERS];
        for reg in self.stack.iter().filter_map(VarState::reg) {
            counts[reg.code() as usize] += 1;
        }
        let used: RegList = (0..NUM_REGISTERS as u8)
            .filter(|&code| counts[code as usize] > 0)
            .filter_map(Reg::from_code)
            .collect();
        counts == self.use_counts && used == self.used
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ValueType::{F64, I32, I64};

    #[test]
    fn offsets_follow_the_stack() {
        let mut state = CacheState::new();
        state.push_const(I32, 1);
        state.push_stack(I64);
        assert_eq!(state.slot(0).offset, STATIC_FRAME_SIZE + 8);
        assert_eq!(state.slot(1).offset, STATIC_FRAME_SIZE + 16);
        state.pop();
        state.pop();
        assert_eq!(state.max_spill_offset(), STATIC_FRAME_SIZE + 16);
    }

    #[test]
    fn use_counts_track_shared_registers() {
        let mut state = CacheState::new();
        let r = Reg::gp(2);
        state.push_register(I32, r);
        state.push_register(I32, r);
        assert_eq!(state.use_count(r), 2);
        state.pop();
        assert!(state.is_used(r));
        state.make_stack(0);
        assert!(!state.is_used(r));
        assert!(state.is_consistent());
    }

    #[test]
    fn unused_register_respects_pins() {
        let mut state = CacheState::new();
        state.push_register(I32, Reg::gp(0));
        let pinned = RegList::from_regs(&[Reg::gp(1)]);
        let gp = state.unused_register(RegClass::Gp, pinned);
        let fp = state.unused_register(RegClass::Fp, pinned);
        assert_eq!(gp, Some(Reg::gp(2)));
        assert_eq!(fp, Some(Reg::fp(0)));
    }

    #[test]
    fn spill_candidates_rotate() {
        let mut state = CacheState::new();
        let first = state
            .next_spill_register(RegClass::Gp, RegList::EMPTY)
            .unwrap();
        let second = state
            .next_spill_register(RegClass::Gp, RegList::EMPTY)
            .unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn merge_keeps_constants_only_below_the_construct() {
        let mut source = CacheState::new();
        source.push_const(I32, 0); // local
        source.push_const(I32, 5); // below the block
        source.push_stack(I64); // discarded
        source.push_const(I32, 9); // merge value
        let target = CacheState::init_merge(&source, 1, 1, 1);

        assert_eq!(target.height(), 3);
        assert!(!target.slot(0).is_const());
        assert_eq!(target.slot(1).i32_const(), Some(5));
        assert!(target.slot(2).is_reg());
        assert_eq!(target.slot(2).offset, source.slot(2).offset);
        assert!(target.is_consistent());
    }

    #[test]
    fn merge_never_assigns_a_register_twice() {
        let mut source = CacheState::new();
        let r = Reg::gp(0);
        source.push_register(I32, r);
        source.push_register(I32, r);
        let f = Reg::fp(3);
        source.push_register(F64, f);
        let target = CacheState::init_merge(&source, 0, 2, 1);

        let regs: Vec<_> = target.slots().iter().filter_map(VarState::reg).collect();
        let unique: RegList = regs.iter().copied().collect();
        assert_eq!(unique.len() as usize, regs.len());
        assert_eq!(target.slot(2).reg(), Some(f));
    }
}
