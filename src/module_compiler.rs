//! Compiling the function bodies of a module on several threads.
//!
//! Every body is compiled by its own decoder and code generator; the only
//! shared input is the read-only [`ModuleMetadata`]. A body that fails,
//! whether invalid or unsupported, does not affect the others.

use std::thread;

use skiff_compiler::{CompiledFunction, compile_function};
use skiff_core::{CompileError, CompileOptions, DecodeError, DecoderOptions, ModuleMetadata};
use thiserror::Error;
use tracing::{debug, info, info_span};

/// One function body, identified by its index in the module's function
/// index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionBody<'a> {
    pub func_index: u32,
    pub bytes: &'a [u8],
}

impl<'a> FunctionBody<'a> {
    pub fn new(func_index: u32, bytes: &'a [u8]) -> Self {
        Self { func_index, bytes }
    }
}

/// A function that could not be compiled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("function {func_index}: {error}")]
pub struct FunctionError {
    pub func_index: u32,
    #[source]
    pub error: CompileError,
}

impl FunctionError {
    /// `true` if the body is valid and another backend should compile it.
    pub fn is_bailout(&self) -> bool {
        self.error.is_bailout()
    }
}

fn compile_body(
    module: &ModuleMetadata,
    body: &FunctionBody<'_>,
    decoder_options: DecoderOptions,
    options: &CompileOptions,
) -> Result<CompiledFunction, FunctionError> {
    let _span = info_span!("compile", func_index = body.func_index).entered();
    let fail = |error: CompileError| FunctionError {
        func_index: body.func_index,
        error,
    };

    if module.is_imported_function(body.func_index) {
        return Err(fail(
            DecodeError::invalid_index(0, "defined function", body.func_index).into(),
        ));
    }
    let sig = module
        .function_sig(body.func_index)
        .ok_or_else(|| fail(DecodeError::invalid_index(0, "function", body.func_index).into()))?;
    compile_function(module, sig, body.bytes, decoder_options, options).map_err(fail)
}

/// Compile `bodies` on up to `threads` threads.
///
/// Results are returned in the order of `bodies`.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn compile_module(
    module: &ModuleMetadata,
    bodies: &[FunctionBody<'_>],
    decoder_options: DecoderOptions,
    options: &CompileOptions,
    threads: usize,
) -> Vec<Result<CompiledFunction, FunctionError>> {
    let threads = threads.clamp(1, bodies.len().max(1));
    info!(functions = bodies.len(), threads, "compiling module");

    let results: Vec<_> = if threads == 1 {
        bodies
            .iter()
            .map(|body| compile_body(module, body, decoder_options, options))
            .collect()
    } else {
        let chunk_size = bodies.len().div_ceil(threads);
        thread::scope(|scope| {
            let workers: Vec<_> = bodies
                .chunks(chunk_size)
                .map(|chunk| {
                    scope.spawn(move || {
                        chunk
                            .iter()
                            .map(|body| compile_body(module, body, decoder_options, options))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|worker| match worker.join() {
                    Ok(results) => results,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    };

    let failed = results.iter().filter(|result| result.is_err()).count();
    debug!(compiled = results.len() - failed, failed, "module compiled");
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_core::{FunctionSig, ValueType};

    fn module_with_functions(count: u32) -> ModuleMetadata {
        let mut builder = ModuleMetadata::builder();
        let sig = builder.add_type(FunctionSig::new(&[ValueType::I32], &[ValueType::I32]));
        for _ in 0..count {
            builder.add_function(sig).unwrap();
        }
        builder.build()
    }

    const INCREMENT: [u8; 7] = [0x00, 0x20, 0x00, 0x41, 0x01, 0x6A, 0x0B];
    // local.get 0; i64.const 1; i32.add; end
    const ILL_TYPED: [u8; 7] = [0x00, 0x20, 0x00, 0x42, 0x01, 0x6A, 0x0B];

    #[test]
    fn results_keep_body_order_across_threads() {
        let module = module_with_functions(8);
        let bodies: Vec<_> = (0..8)
            .map(|i| FunctionBody::new(i, if i == 5 { &ILL_TYPED[..] } else { &INCREMENT[..] }))
            .collect();
        let results = compile_module(
            &module,
            &bodies,
            DecoderOptions::default(),
            &CompileOptions::default(),
            3,
        );

        assert_eq!(results.len(), 8);
        for (i, result) in results.iter().enumerate() {
            if i == 5 {
                let err = result.as_ref().unwrap_err();
                assert_eq!(err.func_index, 5);
                assert!(!err.is_bailout());
            } else {
                assert!(result.is_ok(), "function {i} failed");
            }
        }
    }

    #[test]
    fn threaded_and_sequential_output_match() {
        let module = module_with_functions(4);
        let bodies: Vec<_> = (0..4).map(|i| FunctionBody::new(i, &INCREMENT[..])).collect();
        let options = CompileOptions::default();
        let sequential = compile_module(&module, &bodies, DecoderOptions::default(), &options, 1);
        let threaded = compile_module(&module, &bodies, DecoderOptions::default(), &options, 4);
        assert_eq!(sequential, threaded);
    }

    #[test]
    fn unknown_function_index_is_reported() {
        let module = module_with_functions(1);
        let results = compile_module(
            &module,
            &[FunctionBody::new(3, &INCREMENT)],
            DecoderOptions::default(),
            &CompileOptions::default(),
            1,
        );
        let err = results[0].as_ref().unwrap_err();
        assert_eq!(err.func_index, 3);
        assert!(err.error.as_decode_error().is_some());
    }

    #[test]
    fn empty_module_compiles_to_nothing() {
        let module = module_with_functions(0);
        let results = compile_module(
            &module,
            &[],
            DecoderOptions::default(),
            &CompileOptions::default(),
            8,
        );
        assert!(results.is_empty());
    }
}
