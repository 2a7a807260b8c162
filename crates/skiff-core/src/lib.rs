//! Shared types for the skiff function compiler.
//!
//! This crate holds everything the decoder and the code generator agree on:
//! value types, function signatures, the read-only module metadata a function
//! body is validated against, feature and compile options, and the error
//! taxonomy surfaced to callers.
//!
//! ## Modules
//!
//! - [`types`] - Value types and the subtyping relation
//! - [`signature`] - Function signatures
//! - [`module`] - Module metadata and its builder
//! - [`features`] - Enabled instruction-set extensions
//! - [`options`] - Decoder and code generation options
//! - [`error`] - Decode errors, bailouts and compile errors

pub mod error;
pub mod features;
pub mod module;
pub mod options;
pub mod signature;
pub mod types;

pub use error::{
    Bailout, BailoutReason, CompileError, DecodeError, DecodeErrorKind, ModuleError,
};
pub use features::Features;
pub use module::{
    GlobalDesc, MAX_MEMORY_PAGES, MAX_TABLE_SIZE, MemoryDesc, ModuleBuilder, ModuleMetadata,
    PAGE_SIZE, TableDesc,
};
pub use options::{BoundsCheckStrategy, CompileOptions, DecoderOptions, ValidationMode};
pub use signature::FunctionSig;
pub use types::ValueType;
