//! Decoded instruction immediates handed to backends.

/// The `memarg` immediate of loads and stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemArg {
    /// Log2 of the alignment hint.
    pub align: u32,
    /// Static offset added to the dynamic index.
    pub offset: u32,
}

/// The targets of a `br_table`, the default target last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchTable<'a> {
    targets: &'a [u32],
}

impl<'a> BranchTable<'a> {
    pub(crate) fn new(targets: &'a [u32]) -> Self {
        debug_assert!(!targets.is_empty());
        Self { targets }
    }

    /// Number of non-default entries.
    #[inline]
    pub fn table_count(&self) -> u32 {
        self.targets.len() as u32 - 1
    }

    /// Depth of entry `index`, or of the default target when `index` equals
    /// [`table_count`](Self::table_count).
    #[inline]
    pub fn target(&self, index: u32) -> u32 {
        self.targets[index as usize]
    }

    #[inline]
    pub fn default_target(&self) -> u32 {
        self.targets[self.targets.len() - 1]
    }

    /// All depths, default last.
    pub fn targets(&self) -> &'a [u32] {
        self.targets
    }
}
