//! Skiff
//!
//! A single-pass validating compiler for structured stack bytecode. Each
//! function body is decoded once; the decoder checks it against the typing
//! rules and drives a baseline code generator that emits machine code as it
//! goes.
//!
//! ## Crates
//!
//! - [`skiff_core`]: value types, signatures, module metadata, options, errors
//! - [`skiff_decoder`]: the validating decoder and the [`Backend`](skiff_decoder::Backend) trait
//! - [`skiff_compiler`]: the baseline code generator and the per-function pipeline
//!
//! ## Example
//!
//! ```rust
//! use skiff::{CompileOptions, DecoderOptions, FunctionSig, ModuleMetadata, ValueType};
//!
//! let mut builder = ModuleMetadata::builder();
//! let sig = builder.add_type(FunctionSig::new(&[ValueType::I32], &[ValueType::I32]));
//! builder.add_function(sig).unwrap();
//! let module = builder.build();
//!
//! // local.get 0; i32.const 1; i32.add; end
//! let body = [0x00, 0x20, 0x00, 0x41, 0x01, 0x6A, 0x0B];
//! let bodies = [skiff::FunctionBody::new(0, &body)];
//! let results = skiff::compile_module(
//!     &module,
//!     &bodies,
//!     DecoderOptions::default(),
//!     &CompileOptions::default(),
//!     2,
//! );
//! assert!(results[0].is_ok());
//! ```

pub mod module_compiler;

pub use skiff_compiler;
pub use skiff_core;
pub use skiff_decoder;

pub use module_compiler::{FunctionBody, FunctionError, compile_module};
pub use skiff_compiler::{
    BaselineCompiler, CompiledFunction, DebugSideTable, ProtectedInstruction, SourcePosition,
    compile_function, validate_function,
};
pub use skiff_core::{
    Bailout, BailoutReason, BoundsCheckStrategy, CompileError, CompileOptions, DecodeError,
    DecodeErrorKind, DecoderOptions, Features, FunctionSig, ModuleMetadata, ValidationMode,
    ValueType,
};
