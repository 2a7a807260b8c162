use bitflags::bitflags;

bitflags! {
    /// Instruction-set extensions accepted by the decoder.
    ///
    /// Opcodes belonging to a disabled extension are rejected as invalid
    /// opcodes. The default set is the post-MVP baseline every mainstream
    /// engine ships; SIMD, exceptions and tail calls are opt-in.
    ///
    /// ```rust
    /// use skiff_core::Features;
    ///
    /// let features = Features::default() | Features::SIMD;
    /// assert!(features.contains(Features::BULK_MEMORY));
    /// ```
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Features: u32 {
        /// `i32.extend8_s` and friends.
        const SIGN_EXTENSION = 1 << 0;
        /// `i32.trunc_sat_f32_s` and friends.
        const SAT_FLOAT_TO_INT = 1 << 1;
        /// Blocks with parameters and multiple results.
        const MULTI_VALUE = 1 << 2;
        /// `funcref`/`externref` values, typed `select`, table instructions.
        const REFERENCE_TYPES = 1 << 3;
        /// `memory.copy`, `memory.fill`, `memory.init` and table counterparts.
        const BULK_MEMORY = 1 << 4;
        /// 128-bit vector instructions.
        const SIMD = 1 << 5;
        /// `try`, `catch`, `catch_all`, `throw`, `rethrow`.
        const EXCEPTIONS = 1 << 6;
        /// `return_call`, `return_call_indirect`.
        const TAIL_CALL = 1 << 7;
    }
}

impl Default for Features {
    fn default() -> Self {
        Features::SIGN_EXTENSION
            | Features::SAT_FLOAT_TO_INT
            | Features::MULTI_VALUE
            | Features::REFERENCE_TYPES
            | Features::BULK_MEMORY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_excludes_opt_in_extensions() {
        let features = Features::default();
        assert!(features.contains(Features::MULTI_VALUE));
        assert!(!features.contains(Features::SIMD));
        assert!(!features.contains(Features::EXCEPTIONS));
        assert!(!features.contains(Features::TAIL_CALL));
    }

    #[test]
    fn all_contains_everything() {
        assert!(Features::all().contains(Features::default() | Features::SIMD));
    }
}
