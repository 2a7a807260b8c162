//! Decoder and code generation options.

use crate::features::Features;

/// How much checking the decoder performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMode {
    /// Every structural and type rule is enforced.
    #[default]
    Full,
    /// The body was validated before. Structural checks still run, operand
    /// and merge type checks are skipped.
    Trusted,
}

/// Options for decoding one function body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecoderOptions {
    pub features: Features,
    pub validation: ValidationMode,
}

impl DecoderOptions {
    pub fn with_features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }

    pub fn with_validation(mut self, validation: ValidationMode) -> Self {
        self.validation = validation;
        self
    }
}

/// How linear-memory accesses are protected against out-of-bounds indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BoundsCheckStrategy {
    /// Compare every index against the dynamic memory size and branch to a
    /// trap on failure.
    #[default]
    Explicit,
    /// Rely on guard regions and a signal handler; faulting instructions are
    /// reported as protected instructions.
    TrapHandler,
}

/// Options for one invocation of the baseline compiler.
///
/// Construct with [`CompileOptions::default`] and adjust with the `with_*`
/// methods:
///
/// ```rust
/// use skiff_core::{BoundsCheckStrategy, CompileOptions};
///
/// let options = CompileOptions::default()
///     .with_bounds_checks(BoundsCheckStrategy::TrapHandler)
///     .with_debug_side_table(true);
/// assert!(options.debug_side_table);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    pub bounds_checks: BoundsCheckStrategy,
    /// Mask memory and table indices after the bounds check so that
    /// mispredicted branches cannot read out of bounds.
    pub index_masking: bool,
    /// Emit a stack-limit check in the prologue and at each loop header.
    pub stack_checks: bool,
    /// Runtime stubs exist for bulk memory and table instructions. Without
    /// them the compiler bails out on those instructions.
    pub runtime_bulk_operations: bool,
    /// Record a debug side table.
    pub debug_side_table: bool,
    /// Body offsets at which a breakpoint stub is emitted.
    pub breakpoints: Vec<u32>,
    /// Call the trace stub on function entry.
    pub trace_entry: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            bounds_checks: BoundsCheckStrategy::Explicit,
            index_masking: false,
            stack_checks: true,
            runtime_bulk_operations: true,
            debug_side_table: false,
            breakpoints: Vec::new(),
            trace_entry: false,
        }
    }
}

impl CompileOptions {
    pub fn with_bounds_checks(mut self, strategy: BoundsCheckStrategy) -> Self {
        self.bounds_checks = strategy;
        self
    }

    pub fn with_index_masking(mut self, enabled: bool) -> Self {
        self.index_masking = enabled;
        self
    }

    pub fn with_stack_checks(mut self, enabled: bool) -> Self {
        self.stack_checks = enabled;
        self
    }

    pub fn with_runtime_bulk_operations(mut self, enabled: bool) -> Self {
        self.runtime_bulk_operations = enabled;
        self
    }

    pub fn with_debug_side_table(mut self, enabled: bool) -> Self {
        self.debug_side_table = enabled;
        self
    }

    /// Breakpoints are kept sorted so the code generator can consume them
    /// in order.
    pub fn with_breakpoints(mut self, mut offsets: Vec<u32>) -> Self {
        offsets.sort_unstable();
        offsets.dedup();
        self.breakpoints = offsets;
        self
    }

    pub fn with_trace_entry(mut self, enabled: bool) -> Self {
        self.trace_entry = enabled;
        self
    }

    /// Breakpoints imply a debug side table.
    pub fn wants_debug_side_table(&self) -> bool {
        self.debug_side_table || !self.breakpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_defaults_validate_fully() {
        let options = DecoderOptions::default();
        assert_eq!(options.validation, ValidationMode::Full);
        assert_eq!(options.features, Features::default());
    }

    #[test]
    fn defaults() {
        let options = CompileOptions::default();
        assert_eq!(options.bounds_checks, BoundsCheckStrategy::Explicit);
        assert!(options.stack_checks);
        assert!(!options.wants_debug_side_table());
    }

    #[test]
    fn breakpoints_are_sorted_and_imply_side_table() {
        let options = CompileOptions::default().with_breakpoints(vec![9, 3, 9]);
        assert_eq!(options.breakpoints, vec![3, 9]);
        assert!(options.wants_debug_side_table());
    }
}
