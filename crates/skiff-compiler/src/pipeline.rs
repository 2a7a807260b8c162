//! Compiling one function body end to end.
//!
//! [`compile_function`] runs the decoder with a [`BaselineCompiler`] as its
//! backend. Decoding and code generation share a single pass over the body
//! and a single arena that is dropped when the call returns.

use bumpalo::Bump;
use skiff_core::{CompileError, CompileOptions, DecoderOptions, FunctionSig, ModuleMetadata};
use skiff_decoder::FunctionDecoder;
use tracing::{debug, instrument};

use crate::assembler::{DisasmError, Instr, Relocation, disassemble};
use crate::baseline::BaselineCompiler;
use crate::debug_side_table::DebugSideTable;

/// Maps a code offset back to the body offset of the instruction that
/// produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourcePosition {
    pub code_offset: u32,
    pub source_offset: u32,
}

/// A memory access that may fault when bounds checks are left to a trap
/// handler. The handler resumes at `landing_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectedInstruction {
    pub instr_offset: u32,
    pub landing_offset: u32,
}

/// Everything the baseline compiler produces for one function.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFunction {
    pub code: Vec<u8>,
    /// Sorted by code offset.
    pub source_positions: Vec<SourcePosition>,
    pub protected_instructions: Vec<ProtectedInstruction>,
    /// Direct calls to patch when the module is linked.
    pub relocations: Vec<Relocation>,
    /// Bytes of stack frame below the frame pointer.
    pub frame_size: u32,
    pub debug_side_table: Option<DebugSideTable>,
}

impl CompiledFunction {
    pub fn code_size(&self) -> usize {
        self.code.len()
    }

    /// Decode the generated code into `(offset, instruction)` pairs.
    pub fn disassemble(&self) -> Result<Vec<(u32, Instr<u32>)>, DisasmError> {
        disassemble(&self.code)
    }

    /// Body offset of the instruction that emitted the code at `code_offset`.
    pub fn source_position_at(&self, code_offset: u32) -> Option<u32> {
        let idx = self
            .source_positions
            .partition_point(|pos| pos.code_offset <= code_offset);
        idx.checked_sub(1)
            .map(|i| self.source_positions[i].source_offset)
    }
}

/// Validate and compile one function body.
///
/// A [`CompileError::Decode`] means the body is invalid. A
/// [`CompileError::Unsupported`] means it is valid but uses something the
/// baseline compiler does not lower; another backend may still compile it.
///
/// ```rust
/// use skiff_compiler::compile_function;
/// use skiff_core::{CompileOptions, DecoderOptions, FunctionSig, ModuleMetadata, ValueType};
///
/// let module = ModuleMetadata::default();
/// let sig = FunctionSig::new(&[], &[ValueType::I32]);
/// // no locals; i32.const 1; i32.const 2; i32.add; end
/// let body = [0x00, 0x41, 0x01, 0x41, 0x02, 0x6A, 0x0B];
/// let compiled = compile_function(
///     &module,
///     &sig,
///     &body,
///     DecoderOptions::default(),
///     &CompileOptions::default(),
/// )
/// .unwrap();
/// assert!(!compiled.code.is_empty());
/// ```
#[instrument(level = "debug", skip_all, fields(body_size = body.len()))]
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn compile_function(
    module: &ModuleMetadata,
    sig: &FunctionSig,
    body: &[u8],
    decoder_options: DecoderOptions,
    options: &CompileOptions,
) -> Result<CompiledFunction, CompileError> {
    let arena = Bump::new();
    let mut compiler = BaselineCompiler::new(options);
    let result =
        FunctionDecoder::new(&arena, module, sig, body, decoder_options).decode(&mut compiler);
    if let Err(err) = result {
        debug!(error = %err, bailout = err.is_bailout(), "function not compiled");
        return Err(err);
    }

    let compiled = compiler.finish();
    debug!(
        code_size = compiled.code.len(),
        frame_size = compiled.frame_size,
        arena_bytes = arena.allocated_bytes(),
        "function compiled"
    );
    Ok(compiled)
}

/// Validate one function body without generating code.
pub fn validate_function(
    module: &ModuleMetadata,
    sig: &FunctionSig,
    body: &[u8],
    decoder_options: DecoderOptions,
) -> Result<(), CompileError> {
    skiff_decoder::validate_function_body(module, sig, body, decoder_options)
}
