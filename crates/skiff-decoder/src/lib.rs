//! Single-pass decoding and validation of function bodies.
//!
//! The decoder reads a body once, front to back, checks it against the
//! stack-machine typing rules, and reports every construct to a [`Backend`].
//! Code generators implement [`Backend`]; pure validation uses
//! [`ValidateOnly`].
//!
//! # Example
//!
//! ```rust
//! use skiff_core::{DecoderOptions, FunctionSig, ModuleMetadata, ValueType};
//! use skiff_decoder::validate_function_body;
//!
//! let module = ModuleMetadata::default();
//! let sig = FunctionSig::new(&[ValueType::I32], &[ValueType::I32]);
//! // local.get 0; i32.eqz; end
//! let body = [0x00, 0x20, 0x00, 0x45, 0x0B];
//! validate_function_body(&module, &sig, &body, DecoderOptions::default()).unwrap();
//! ```

pub mod control;
pub mod decoder;
pub mod immediates;
pub mod interface;
pub mod opcode;
pub mod reader;

use bumpalo::Bump;
use skiff_core::{CompileError, DecoderOptions, FunctionSig, ModuleMetadata};

pub use control::{Control, ControlKind, Merge, Reachability, Value};
pub use decoder::{DecodeContext, FunctionDecoder, MAX_BR_TABLE_SIZE, MAX_LOCALS};
pub use immediates::{BranchTable, MemArg};
pub use interface::{Backend, BackendResult, CallIndirectImm, ValidateOnly};
pub use opcode::{LoadType, OpClass, OpInfo, Opcode, StoreType};
pub use reader::Reader;

/// Validate one function body without generating code.
pub fn validate_function_body(
    module: &ModuleMetadata,
    sig: &FunctionSig,
    body: &[u8],
    options: DecoderOptions,
) -> Result<(), CompileError> {
    let arena = Bump::new();
    FunctionDecoder::new(&arena, module, sig, body, options).decode(&mut ValidateOnly)
}
