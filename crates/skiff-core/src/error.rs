//! Error types for function compilation.
//!
//! Compilation of a single function body can fail in two unrelated ways, and
//! callers are expected to treat them differently:
//!
//! ## Error Hierarchy
//!
//! ```text
//! CompileError (per-function result)
//! ├── Decode(DecodeError)   - the bytecode is malformed or ill-typed
//! └── Unsupported(Bailout)  - the bytecode is valid, the backend cannot lower it
//! ModuleError               - inconsistent module metadata at build time
//! ```
//!
//! A `DecodeError` is final: the function is invalid and no backend will
//! accept it. A `Bailout` only says that this backend gave up; the function
//! should be handed to a different backend. Runtime traps are not errors at
//! all, they are compiled into the generated code.

use std::fmt;

use thiserror::Error;

// ============================================================================
// Decode Errors
// ============================================================================

/// Categories of decode and validation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// The body ended in the middle of an instruction or immediate.
    UnexpectedEof,
    /// A LEB128 immediate was too long or had unused bits set.
    MalformedLeb,
    /// Unknown or disabled opcode.
    InvalidOpcode,
    /// An immediate referenced something that does not exist.
    InvalidIndex,
    /// A reachable instruction popped more values than were available.
    StackUnderflow,
    /// An operand had the wrong type.
    TypeMismatch,
    /// A branch targeted a depth outside the current control nesting.
    InvalidBranchDepth,
    /// The number of values at a merge differed from its arity.
    ArityMismatch,
    /// Structural error: `else` without `if`, missing `end`, trailing code.
    InvalidControl,
    /// Invalid immediate value, e.g. over-aligned memory access.
    InvalidImmediate,
    /// The local declarations exceeded the implementation limit.
    TooManyLocals,
}

impl DecodeErrorKind {
    /// Returns a human-readable name for this error kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            DecodeErrorKind::UnexpectedEof => "unexpected end of body",
            DecodeErrorKind::MalformedLeb => "malformed LEB128",
            DecodeErrorKind::InvalidOpcode => "invalid opcode",
            DecodeErrorKind::InvalidIndex => "invalid index",
            DecodeErrorKind::StackUnderflow => "stack underflow",
            DecodeErrorKind::TypeMismatch => "type mismatch",
            DecodeErrorKind::InvalidBranchDepth => "invalid branch depth",
            DecodeErrorKind::ArityMismatch => "arity mismatch",
            DecodeErrorKind::InvalidControl => "invalid control structure",
            DecodeErrorKind::InvalidImmediate => "invalid immediate",
            DecodeErrorKind::TooManyLocals => "too many locals",
        }
    }
}

impl fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fatal decode or validation error, located by byte offset within the
/// function body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} at offset {offset:#x}: {message}")]
pub struct DecodeError {
    pub kind: DecodeErrorKind,
    pub offset: u32,
    pub message: String,
}

impl DecodeError {
    pub fn new(kind: DecodeErrorKind, offset: u32, message: impl Into<String>) -> Self {
        Self {
            kind,
            offset,
            message: message.into(),
        }
    }

    pub fn unexpected_eof(offset: u32, what: &str) -> Self {
        Self::new(
            DecodeErrorKind::UnexpectedEof,
            offset,
            format!("expected {what}"),
        )
    }

    pub fn type_mismatch(offset: u32, message: impl Into<String>) -> Self {
        Self::new(DecodeErrorKind::TypeMismatch, offset, message)
    }

    pub fn invalid_index(offset: u32, what: &str, index: u32) -> Self {
        Self::new(
            DecodeErrorKind::InvalidIndex,
            offset,
            format!("invalid {what} index: {index}"),
        )
    }
}

// ============================================================================
// Bailouts
// ============================================================================

/// Why a backend refused to compile an otherwise valid function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BailoutReason {
    Simd,
    ReferenceTypes,
    ExceptionHandling,
    TailCall,
    MultiValue,
    BulkOperations,
    Other,
}

impl BailoutReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BailoutReason::Simd => "simd",
            BailoutReason::ReferenceTypes => "reference types",
            BailoutReason::ExceptionHandling => "exception handling",
            BailoutReason::TailCall => "tail call",
            BailoutReason::MultiValue => "multi-value",
            BailoutReason::BulkOperations => "bulk operations",
            BailoutReason::Other => "other",
        }
    }
}

impl fmt::Display for BailoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signal raised by a backend that cannot lower some construct.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported {reason}: {detail}")]
pub struct Bailout {
    pub reason: BailoutReason,
    pub detail: String,
}

impl Bailout {
    pub fn new(reason: BailoutReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

// ============================================================================
// Compile Errors
// ============================================================================

/// The outcome of a failed single-function compilation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Unsupported(#[from] Bailout),
}

impl CompileError {
    /// `true` if another backend may still be able to compile the function.
    pub fn is_bailout(&self) -> bool {
        matches!(self, CompileError::Unsupported(_))
    }

    pub fn as_decode_error(&self) -> Option<&DecodeError> {
        match self {
            CompileError::Decode(err) => Some(err),
            CompileError::Unsupported(_) => None,
        }
    }
}

// ============================================================================
// Module Errors
// ============================================================================

/// Errors raised while assembling [`ModuleMetadata`](crate::ModuleMetadata).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModuleError {
    #[error("unknown type index {0}")]
    UnknownType(u32),

    #[error("imports must be declared before definitions")]
    ImportAfterDefinition,

    #[error("invalid limits: minimum {min} exceeds maximum {max}")]
    InvalidLimits { min: u32, max: u32 },

    #[error("limit {value} exceeds implementation maximum {limit}")]
    LimitTooLarge { value: u32, limit: u32 },

    #[error("only one linear memory is supported")]
    MultipleMemories,

    #[error("table element type must be a reference type, found {0}")]
    InvalidTableElement(crate::ValueType),
}
