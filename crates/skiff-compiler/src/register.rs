//! Registers of the abstract target machine.
//!
//! The machine has 16 general-purpose registers (`r0`-`r15`) and 16
//! floating-point registers (`f0`-`f15`). Both files share one code space
//! so that a [`RegList`] can describe any mix of them in a single word.

use std::fmt;

use skiff_core::ValueType;

/// Number of register codes across both classes.
pub const NUM_REGISTERS: usize = 32;

/// Byte value encoding "no register" in an instruction operand.
pub const NO_REG: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegClass {
    Gp,
    Fp,
}

impl RegClass {
    /// The class holding values of type `ty`.
    #[inline]
    pub fn for_type(ty: ValueType) -> RegClass {
        match ty {
            ValueType::F32 | ValueType::F64 | ValueType::V128 => RegClass::Fp,
            _ => RegClass::Gp,
        }
    }

    /// Registers the cache state may allocate from.
    #[inline]
    pub fn cache_registers(self) -> RegList {
        match self {
            RegClass::Gp => CACHE_GP,
            RegClass::Fp => CACHE_FP,
        }
    }
}

/// A machine register, identified by its code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(u8);

impl Reg {
    #[inline]
    pub const fn gp(index: u8) -> Reg {
        debug_assert!(index < 16);
        Reg(index)
    }

    #[inline]
    pub const fn fp(index: u8) -> Reg {
        debug_assert!(index < 16);
        Reg(16 + index)
    }

    /// Rebuild a register from its encoded code.
    #[inline]
    pub fn from_code(code: u8) -> Option<Reg> {
        ((code as usize) < NUM_REGISTERS).then_some(Reg(code))
    }

    #[inline]
    pub const fn code(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn class(self) -> RegClass {
        if self.0 < 16 { RegClass::Gp } else { RegClass::Fp }
    }

    #[inline]
    pub fn is_gp(self) -> bool {
        self.class() == RegClass::Gp
    }
}

impl fmt::Debug for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class() {
            RegClass::Gp => write!(f, "r{}", self.0),
            RegClass::Fp => write!(f, "f{}", self.0 - 16),
        }
    }
}

// ============================================================================
// Fixed Registers
// ============================================================================

/// Holds the instance pointer while compiled code runs. Saved to the frame
/// on entry and reloaded after every call.
pub const INSTANCE_REG: Reg = Reg::gp(11);

/// Holds the target of an indirect call while parameters are moved.
pub const CALL_TARGET_REG: Reg = Reg::gp(12);

/// Never allocated; free for single-instruction temporaries.
pub const SCRATCH_GP: Reg = Reg::gp(13);
pub const SCRATCH_FP: Reg = Reg::fp(15);

pub const RETURN_GP: Reg = Reg::gp(0);
pub const RETURN_FP: Reg = Reg::fp(0);

pub const PARAM_GP: [Reg; 4] = [Reg::gp(0), Reg::gp(1), Reg::gp(2), Reg::gp(3)];
pub const PARAM_FP: [Reg; 4] = [Reg::fp(0), Reg::fp(1), Reg::fp(2), Reg::fp(3)];

/// `r0`-`r7`
pub const CACHE_GP: RegList = RegList(0x0000_00FF);
/// `f0`-`f7`
pub const CACHE_FP: RegList = RegList(0x00FF_0000);

/// The register receiving a return value of type `ty`.
#[inline]
pub fn return_reg(ty: ValueType) -> Reg {
    match RegClass::for_type(ty) {
        RegClass::Gp => RETURN_GP,
        RegClass::Fp => RETURN_FP,
    }
}

// ============================================================================
// Register Lists
// ============================================================================

/// A set of registers, one bit per register code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RegList(u32);

impl RegList {
    pub const EMPTY: RegList = RegList(0);

    #[inline]
    pub const fn from_bits(bits: u32) -> RegList {
        RegList(bits)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn from_regs(regs: &[Reg]) -> RegList {
        regs.iter()
            .fold(RegList::EMPTY, |list, &reg| list.with(reg))
    }

    #[inline]
    pub fn has(self, reg: Reg) -> bool {
        self.0 & (1 << reg.code()) != 0
    }

    #[inline]
    pub fn set(&mut self, reg: Reg) -> Reg {
        self.0 |= 1 << reg.code();
        reg
    }

    #[inline]
    pub fn clear(&mut self, reg: Reg) {
        self.0 &= !(1 << reg.code());
    }

    #[inline]
    #[must_use]
    pub fn with(self, reg: Reg) -> RegList {
        RegList(self.0 | (1 << reg.code()))
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn len(self) -> u32 {
        self.0.count_ones()
    }

    #[inline]
    pub fn union(self, other: RegList) -> RegList {
        RegList(self.0 | other.0)
    }

    #[inline]
    pub fn intersect(self, other: RegList) -> RegList {
        RegList(self.0 & other.0)
    }

    #[inline]
    pub fn difference(self, other: RegList) -> RegList {
        RegList(self.0 & !other.0)
    }

    /// Lowest-coded register in the set.
    #[inline]
    pub fn first(self) -> Option<Reg> {
        (self.0 != 0).then(|| Reg(self.0.trailing_zeros() as u8))
    }

    pub fn iter(self) -> impl Iterator<Item = Reg> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let code = bits.trailing_zeros() as u8;
            bits &= bits - 1;
            Some(Reg(code))
        })
    }
}

impl fmt::Debug for RegList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<Reg> for RegList {
    fn from_iter<I: IntoIterator<Item = Reg>>(iter: I) -> Self {
        iter.into_iter().fold(RegList::EMPTY, RegList::with)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_share_one_code_space() {
        assert_eq!(Reg::gp(3).code(), 3);
        assert_eq!(Reg::fp(3).code(), 19);
        assert_eq!(Reg::fp(3).class(), RegClass::Fp);
        assert_eq!(Reg::fp(3).to_string(), "f3");
        assert_eq!(Reg::from_code(40), None);
    }

    #[test]
    fn reg_list_iterates_in_code_order() {
        let list = RegList::from_regs(&[Reg::fp(1), Reg::gp(5), Reg::gp(0)]);
        let regs: Vec<_> = list.iter().collect();
        assert_eq!(regs, vec![Reg::gp(0), Reg::gp(5), Reg::fp(1)]);
        assert_eq!(list.first(), Some(Reg::gp(0)));
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn cache_registers_exclude_fixed_registers() {
        for reg in [INSTANCE_REG, CALL_TARGET_REG, SCRATCH_GP] {
            assert!(!CACHE_GP.has(reg));
        }
        assert_eq!(CACHE_GP.len(), 8);
        assert!(CACHE_FP.iter().all(|reg| reg.class() == RegClass::Fp));
    }

    #[test]
    fn set_operations() {
        let a = RegList::from_regs(&[Reg::gp(1), Reg::gp(2)]);
        let b = RegList::from_regs(&[Reg::gp(2), Reg::gp(3)]);
        assert_eq!(a.intersect(b), RegList::from_regs(&[Reg::gp(2)]));
        assert_eq!(a.difference(b), RegList::from_regs(&[Reg::gp(1)]));
        assert_eq!(a.union(b).len(), 3);
    }
}
