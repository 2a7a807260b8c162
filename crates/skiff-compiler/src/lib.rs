//! Skiff Baseline Compiler
//!
//! A single-pass code generator driven by the validating decoder. Each
//! instruction is lowered as soon as it is decoded, with no intermediate
//! representation and no second pass.
//!
//! ## Modules
//!
//! - [`register`]: Registers, register classes and register sets
//! - [`assembler`]: Machine instructions, labels and the code buffer
//! - [`cache_state`]: Where each local and operand stack value lives
//! - [`transfer`]: Parallel moves between two cache states
//! - [`macro_asm`]: Cache-state-aware assembler
//! - [`out_of_line`]: Trap and stack-check paths emitted after the body
//! - [`debug_side_table`]: Value locations at selected code offsets
//! - [`baseline`]: The [`Backend`](skiff_decoder::Backend) implementation
//! - [`pipeline`]: Compiling a function end to end

pub mod assembler;
pub mod baseline;
pub mod cache_state;
pub mod debug_side_table;
pub mod macro_asm;
pub mod out_of_line;
pub mod pipeline;
pub mod register;
pub mod transfer;

pub use assembler::{
    Cond, DisasmError, InstanceField, Instr, Label, RelocKind, Relocation, RuntimeStub, disassemble,
};
pub use baseline::BaselineCompiler;
pub use cache_state::{CacheState, Location, VarState};
pub use debug_side_table::{DebugLocation, DebugSideTable, DebugSideTableEntry, DebugValue};
pub use pipeline::{
    CompiledFunction, ProtectedInstruction, SourcePosition, compile_function, validate_function,
};
pub use register::{Reg, RegClass, RegList};
