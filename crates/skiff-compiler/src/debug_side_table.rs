//! Where values live at selected points of the generated code.
//!
//! A debugger that stops a frame at a breakpoint, a call or an out-of-line
//! path needs to find each local and operand stack value. The code generator
//! records a snapshot of its cache state at those points; the finished
//! [`DebugSideTable`] maps code offsets to snapshots.

use std::fmt;

use skiff_core::ValueType;

use crate::cache_state::{CacheState, Location};
use crate::register::Reg;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugLocation {
    Constant(i32),
    Register(Reg),
    /// Spill slot offset below the frame pointer.
    Stack(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugValue {
    pub ty: ValueType,
    pub loc: DebugLocation,
}

/// One program point. `values` holds the locals followed by the operand
/// stack, bottom first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugSideTableEntry {
    pub pc_offset: u32,
    pub values: Vec<DebugValue>,
}

impl DebugSideTableEntry {
    pub fn stack_height(&self) -> u32 {
        self.values.len() as u32
    }
}

/// How register-held values are recorded in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssumeSpilling {
    /// Registers are spilled by the code at this point (out-of-line traps
    /// and stack checks), so they are recorded as their spill slots.
    AssumeSpilling,
    /// Registers are preserved and recorded as such (breakpoints).
    AllowRegisters,
    /// The cache state was already spilled (calls).
    DidSpill,
}

/// Immutable table of snapshots sorted by code offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugSideTable {
    num_locals: u32,
    entries: Vec<DebugSideTableEntry>,
}

impl DebugSideTable {
    pub fn num_locals(&self) -> u32 {
        self.num_locals
    }

    pub fn entries(&self) -> &[DebugSideTableEntry] {
        &self.entries
    }

    /// The entry recorded at exactly `pc_offset`.
    pub fn find_entry(&self, pc_offset: u32) -> Option<&DebugSideTableEntry> {
        self.entries
            .binary_search_by_key(&pc_offset, |entry| entry.pc_offset)
            .ok()
            .map(|index| &self.entries[index])
    }

    /// Location of local `index` at `pc_offset`.
    pub fn local_at(&self, pc_offset: u32, index: u32) -> Option<DebugValue> {
        if index >= self.num_locals {
            return None;
        }
        self.find_entry(pc_offset)?
            .values
            .get(index as usize)
            .copied()
    }
}

impl fmt::Display for DebugSideTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "debug side table ({} locals):", self.num_locals)?;
        for entry in &self.entries {
            write!(f, "  @{}:", entry.pc_offset)?;
            for value in &entry.values {
                match value.loc {
                    DebugLocation::Constant(c) => write!(f, " {}:const({c})", value.ty)?,
                    DebugLocation::Register(reg) => write!(f, " {}:{reg}", value.ty)?,
                    DebugLocation::Stack(offset) => write!(f, " {}:[fp-{offset}]", value.ty)?,
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Handle of an entry whose code offset is set after its code is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryId(usize);

#[derive(Debug, Default)]
pub struct DebugSideTableBuilder {
    entries: Vec<DebugSideTableEntry>,
}

impl DebugSideTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(state: &CacheState, mode: AssumeSpilling) -> Vec<DebugValue> {
        state
            .slots()
            .iter()
            .map(|slot| {
                let loc = match slot.loc {
                    Location::IntConst(value) => DebugLocation::Constant(value),
                    Location::Register(reg) if mode == AssumeSpilling::AllowRegisters => {
                        DebugLocation::Register(reg)
                    }
                    Location::Register(_) | Location::Stack => DebugLocation::Stack(slot.offset),
                };
                DebugValue { ty: slot.ty, loc }
            })
            .collect()
    }

    pub fn new_entry(
        &mut self,
        pc_offset: u32,
        state: &CacheState,
        mode: AssumeSpilling,
    ) -> EntryId {
        self.entries.push(DebugSideTableEntry {
            pc_offset,
            values: Self::snapshot(state, mode),
        });
        EntryId(self.entries.len() - 1)
    }

    pub fn set_pc_offset(&mut self, id: EntryId, pc_offset: u32) {
        self.entries[id.0].pc_offset = pc_offset;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn generate(mut self, num_locals: u32) -> DebugSideTable {
        // Out-of-line entries get their offsets last; restore code order.
        self.entries.sort_by_key(|entry| entry.pc_offset);
        DebugSideTable {
            num_locals,
            entries: self.entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ValueType::{F64, I32};

    fn sample_state() -> CacheState {
        let mut state = CacheState::new();
        state.push_const(I32, 7);
        state.push_register(F64, Reg::fp(1));
        state.push_stack(I32);
        state
    }

    #[test]
    fn registers_are_recorded_only_when_preserved() {
        let state = sample_state();
        let mut builder = DebugSideTableBuilder::new();
        builder.new_entry(10, &state, AssumeSpilling::AllowRegisters);
        builder.new_entry(20, &state, AssumeSpilling::AssumeSpilling);
        let table = builder.generate(1);

        let at_break = table.find_entry(10).unwrap();
        assert_eq!(at_break.values[0].loc, DebugLocation::Constant(7));
        assert_eq!(at_break.values[1].loc, DebugLocation::Register(Reg::fp(1)));
        let at_trap = table.find_entry(20).unwrap();
        assert_eq!(at_trap.values[1].loc, DebugLocation::Stack(32));
        assert_eq!(at_trap.values[2].loc, DebugLocation::Stack(40));
    }

    #[test]
    fn late_offsets_are_sorted_into_place() {
        let state = sample_state();
        let mut builder = DebugSideTableBuilder::new();
        let ool = builder.new_entry(0, &state, AssumeSpilling::AssumeSpilling);
        builder.new_entry(30, &state, AssumeSpilling::DidSpill);
        builder.set_pc_offset(ool, 90);
        let table = builder.generate(1);

        let offsets: Vec<u32> = table.entries().iter().map(|e| e.pc_offset).collect();
        assert_eq!(offsets, vec![30, 90]);
        assert!(table.find_entry(31).is_none());
    }

    #[test]
    fn locals_are_looked_up_by_index() {
        let mut builder = DebugSideTableBuilder::new();
        builder.new_entry(4, &sample_state(), AssumeSpilling::AllowRegisters);
        let table = builder.generate(1);
        assert_eq!(table.local_at(4, 0).map(|v| v.ty), Some(I32));
        assert_eq!(table.local_at(4, 1), None);
    }
}
