//! Single-pass decoder and validator for function bodies.
//!
//! [`FunctionDecoder`] walks the body once, keeping a typed operand stack and
//! a control stack, and invokes a [`Backend`] for every decoded construct.
//! Errors are fatal: the first one stops decoding and is returned with the
//! offset of the offending instruction.
//!
//! ## Unreachable code
//!
//! After `br`, `br_table`, `return`, `unreachable` or `throw`, the rest of
//! the enclosing construct is unreachable and its stack is polymorphic:
//! popping below the construct's entry height yields `Bottom` instead of
//! failing. Nested constructs entered from there start out
//! [`SpecOnlyReachable`](Reachability::SpecOnlyReachable), so they are still
//! fully type checked but no backend callbacks fire for them.

use bumpalo::Bump;
use bumpalo::collections::Vec as BumpVec;
use skiff_core::{
    CompileError, DecodeError, DecodeErrorKind, DecoderOptions, Features, FunctionSig,
    ModuleMetadata, ValidationMode, ValueType,
};
use tracing::{debug, trace};

use crate::control::{Control, ControlKind, Merge, Reachability, Value};
use crate::immediates::{BranchTable, MemArg};
use crate::interface::{Backend, CallIndirectImm};
use crate::opcode::{self, LoadType, OpClass, OpInfo, Opcode, StoreType};
use crate::reader::Reader;

/// Upper bound on parameters plus declared locals.
pub const MAX_LOCALS: u32 = 50_000;

/// Upper bound on the number of non-default `br_table` entries.
pub const MAX_BR_TABLE_SIZE: u32 = 65_520;

type DecodeResult<T = ()> = Result<T, CompileError>;

/// Invoke a backend callback if the current code is reachable.
macro_rules! call_if_reachable {
    ($self:ident, $backend:ident, $method:ident($($arg:expr),* $(,)?)) => {
        if $self.ctx.current_code_reachable {
            $backend.$method(&mut $self.ctx, $($arg),*)?;
        }
    };
}

// ============================================================================
// Decode Context
// ============================================================================

/// Decoder state visible to backends.
pub struct DecodeContext<'a> {
    reader: Reader<'a>,
    body: &'a [u8],
    arena: &'a Bump,
    module: &'a ModuleMetadata,
    sig: &'a FunctionSig,
    options: DecoderOptions,
    locals: BumpVec<'a, ValueType>,
    stack: BumpVec<'a, Value>,
    control: BumpVec<'a, Control<'a>>,
    current_code_reachable: bool,
    /// Offset of the instruction being decoded.
    pc: u32,
    opcode: Opcode,
}

impl<'a> DecodeContext<'a> {
    /// Offset of the instruction being decoded.
    #[inline]
    pub fn pc(&self) -> u32 {
        self.pc
    }

    #[inline]
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    #[inline]
    pub fn module(&self) -> &'a ModuleMetadata {
        self.module
    }

    #[inline]
    pub fn sig(&self) -> &'a FunctionSig {
        self.sig
    }

    pub fn features(&self) -> Features {
        self.options.features
    }

    /// Parameters plus declared locals.
    #[inline]
    pub fn num_locals(&self) -> u32 {
        self.locals.len() as u32
    }

    pub fn local_type(&self, index: u32) -> ValueType {
        self.locals
            .get(index as usize)
            .copied()
            .unwrap_or(ValueType::Bottom)
    }

    pub fn locals(&self) -> &[ValueType] {
        &self.locals
    }

    #[inline]
    pub fn stack_height(&self) -> u32 {
        self.stack.len() as u32
    }

    /// The value `depth` slots below the top of the operand stack.
    pub fn stack_value(&self, depth: u32) -> Option<Value> {
        let len = self.stack.len();
        ((depth as usize) < len).then(|| self.stack[len - 1 - depth as usize])
    }

    #[inline]
    pub fn control_depth(&self) -> u32 {
        self.control.len() as u32
    }

    /// The construct `depth` levels out from the innermost one.
    #[inline]
    pub fn control_at(&self, depth: u32) -> &Control<'a> {
        &self.control[self.control.len() - 1 - depth as usize]
    }

    #[inline]
    pub fn is_reachable(&self) -> bool {
        self.current_code_reachable
    }

    /// The byte following the current instruction's immediates, if any.
    ///
    /// Inside a callback this is the next instruction's first byte.
    #[inline]
    pub fn lookahead(&self) -> Option<u8> {
        self.reader.peek_u8()
    }

    /// Offset just past the current instruction's immediates.
    #[inline]
    pub fn position(&self) -> u32 {
        self.reader.position()
    }

    pub fn body_size(&self) -> u32 {
        self.body.len() as u32
    }

    /// Called by a backend that proved the rest of the current construct can
    /// never execute. The code stays type checked, but no further callbacks
    /// fire for it.
    pub fn set_succeeding_code_dynamically_unreachable(&mut self) {
        if let Some(current) = self.control.last_mut() {
            if current.reachable() {
                current.reachability = Reachability::SpecOnlyReachable;
            }
        }
        self.current_code_reachable = false;
    }

    // ------------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------------

    fn error(&self, kind: DecodeErrorKind, message: impl Into<String>) -> CompileError {
        DecodeError::new(kind, self.pc, message).into()
    }

    #[inline]
    fn trusted(&self) -> bool {
        self.options.validation == ValidationMode::Trusted
    }

    /// Name of the instruction starting at `pc`, for error messages.
    fn opcode_name_at(&self, pc: u32) -> &'static str {
        let mut reader = Reader::at(self.body, pc);
        let Ok(byte) = reader.read_u8("opcode") else {
            return "<end>";
        };
        let code = if opcode::is_prefix(byte) {
            match reader.read_u32_leb("opcode") {
                Ok(sub) => (u32::from(byte) << 8) | sub,
                Err(_) => return "<invalid>",
            }
        } else {
            u32::from(byte)
        };
        opcode::lookup(code).map_or("<invalid>", |info| info.name)
    }

    // ------------------------------------------------------------------------
    // Immediates
    // ------------------------------------------------------------------------

    fn type_enabled(&self, ty: ValueType) -> bool {
        match ty {
            ValueType::V128 => self.options.features.contains(Features::SIMD),
            ValueType::FuncRef | ValueType::ExternRef => {
                self.options.features.contains(Features::REFERENCE_TYPES)
            }
            ValueType::Bottom => false,
            _ => true,
        }
    }

    fn read_value_type(&mut self, what: &str) -> DecodeResult<ValueType> {
        let offset = self.reader.position();
        let code = self.reader.read_u8(what)?;
        ValueType::from_code(code)
            .filter(|&ty| self.type_enabled(ty))
            .ok_or_else(|| {
                DecodeError::new(
                    DecodeErrorKind::InvalidImmediate,
                    offset,
                    format!("invalid {what} type {code:#04x}"),
                )
                .into()
            })
    }

    /// Decode a block type into parameter and result types.
    fn read_block_type(&mut self) -> DecodeResult<(&'a [ValueType], &'a [ValueType])> {
        let offset = self.reader.position();
        let byte = self
            .reader
            .peek_u8()
            .ok_or_else(|| DecodeError::unexpected_eof(offset, "block type"))?;

        if byte == 0x40 {
            self.reader.read_u8("block type")?;
            return Ok((&[], &[]));
        }
        if ValueType::from_code(byte).is_some() {
            let ty = self.read_value_type("block")?;
            return Ok((&[], self.arena.alloc_slice_copy(&[ty])));
        }

        let index = self.reader.read_i33_leb("block type")?;
        if index < 0 {
            return Err(DecodeError::new(
                DecodeErrorKind::InvalidImmediate,
                offset,
                format!("invalid block type {index}"),
            )
            .into());
        }
        if !self.options.features.contains(Features::MULTI_VALUE) {
            return Err(DecodeError::new(
                DecodeErrorKind::InvalidImmediate,
                offset,
                "block type index requires multi-value",
            )
            .into());
        }
        let index = index as u32;
        let sig = self
            .module
            .signature(index)
            .ok_or_else(|| DecodeError::invalid_index(offset, "block type", index))?;
        Ok((sig.params(), sig.results()))
    }

    fn read_mem_arg(&mut self, max_align: u32) -> DecodeResult<MemArg> {
        let offset = self.reader.position();
        let align = self.reader.read_u32_leb("alignment")?;
        if align > max_align {
            return Err(DecodeError::new(
                DecodeErrorKind::InvalidImmediate,
                offset,
                format!(
                    "invalid alignment; expected maximum alignment is {max_align}, actual alignment is {align}"
                ),
            )
            .into());
        }
        let offset = self.reader.read_u32_leb("offset")?;
        Ok(MemArg { align, offset })
    }

    fn read_zero_byte(&mut self, what: &str) -> DecodeResult {
        let offset = self.reader.position();
        let byte = self.reader.read_u8(what)?;
        if byte != 0 {
            return Err(DecodeError::new(
                DecodeErrorKind::InvalidImmediate,
                offset,
                format!("invalid {what}: expected 0, found {byte}"),
            )
            .into());
        }
        Ok(())
    }

    fn check_has_memory(&self) -> DecodeResult {
        if self.module.has_memory() {
            Ok(())
        } else {
            Err(self.error(
                DecodeErrorKind::InvalidIndex,
                "memory instruction with no memory",
            ))
        }
    }

    fn read_local_index(&mut self) -> DecodeResult<u32> {
        let index = self.reader.read_u32_leb("local index")?;
        if index >= self.num_locals() {
            return Err(DecodeError::invalid_index(self.pc, "local", index).into());
        }
        Ok(index)
    }

    fn read_function_index(&mut self) -> DecodeResult<(u32, &'a FunctionSig)> {
        let index = self.reader.read_u32_leb("function index")?;
        let sig = self
            .module
            .function_sig(index)
            .ok_or_else(|| DecodeError::invalid_index(self.pc, "function", index))?;
        Ok((index, sig))
    }

    fn read_table_index(&mut self) -> DecodeResult<(u32, ValueType)> {
        let index = self.reader.read_u32_leb("table index")?;
        let table = self
            .module
            .table(index)
            .ok_or_else(|| DecodeError::invalid_index(self.pc, "table", index))?;
        Ok((index, table.elem_type))
    }

    fn read_elem_segment(&mut self) -> DecodeResult<(u32, ValueType)> {
        let index = self.reader.read_u32_leb("element segment index")?;
        let ty = self
            .module
            .elem_segment_type(index)
            .ok_or_else(|| DecodeError::invalid_index(self.pc, "element segment", index))?;
        Ok((index, ty))
    }

    fn read_data_segment(&mut self) -> DecodeResult<u32> {
        let index = self.reader.read_u32_leb("data segment index")?;
        let Some(count) = self.module.data_count() else {
            return Err(self.error(
                DecodeErrorKind::InvalidIndex,
                "data segment access requires a data count",
            ));
        };
        if index >= count {
            return Err(DecodeError::invalid_index(self.pc, "data segment", index).into());
        }
        Ok(index)
    }

    fn read_branch_depth(&mut self) -> DecodeResult<u32> {
        let depth = self.reader.read_u32_leb("branch depth")?;
        if depth >= self.control_depth() {
            return Err(self.error(
                DecodeErrorKind::InvalidBranchDepth,
                format!("invalid branch depth: {depth}"),
            ));
        }
        Ok(depth)
    }

    // ------------------------------------------------------------------------
    // Operand Stack
    // ------------------------------------------------------------------------

    #[inline]
    fn current(&self) -> &Control<'a> {
        &self.control[self.control.len() - 1]
    }

    #[inline]
    fn current_mut(&mut self) -> &mut Control<'a> {
        let last = self.control.len() - 1;
        &mut self.control[last]
    }

    #[inline]
    fn control_at_mut(&mut self, depth: u32) -> &mut Control<'a> {
        let index = self.control.len() - 1 - depth as usize;
        &mut self.control[index]
    }

    /// `true` if the construct enclosing the current one is reachable.
    fn parent_reachable(&self) -> bool {
        self.control.len() == 1 || self.control_at(1).reachable()
    }

    fn push(&mut self, ty: ValueType) -> Value {
        let value = Value::new(ty, self.pc);
        self.stack.push(value);
        value
    }

    /// Pop operand `index` of the current instruction without a type check.
    fn pop_any(&mut self, index: usize) -> DecodeResult<Value> {
        let limit = self.current().stack_depth as usize;
        let len = self.stack.len();
        if len <= limit {
            if !self.current().unreachable() {
                return Err(self.error(
                    DecodeErrorKind::StackUnderflow,
                    format!(
                        "not enough arguments on the stack for {}, expected {} more",
                        self.opcode.name(),
                        index + 1
                    ),
                ));
            }
            return Ok(Value::new(ValueType::Bottom, self.pc));
        }
        let value = self.stack[len - 1];
        self.stack.truncate(len - 1);
        Ok(value)
    }

    /// Pop operand `index` and check it against `expected`. `Bottom` accepts
    /// any type.
    fn pop(&mut self, index: usize, expected: ValueType) -> DecodeResult<Value> {
        let value = self.pop_any(index)?;
        self.check_operand(index, expected, value)?;
        Ok(value)
    }

    fn check_operand(&self, index: usize, expected: ValueType, value: Value) -> DecodeResult {
        if self.trusted()
            || expected == ValueType::Bottom
            || value.ty.is_subtype_of(expected)
        {
            return Ok(());
        }
        Err(self.error(
            DecodeErrorKind::TypeMismatch,
            format!(
                "{}[{}] expected type {}, found {} of type {}",
                self.opcode.name(),
                index,
                expected,
                self.opcode_name_at(value.pc),
                value.ty
            ),
        ))
    }

    // ------------------------------------------------------------------------
    // Control Stack
    // ------------------------------------------------------------------------

    fn push_control(
        &mut self,
        kind: ControlKind,
        params: &'a [ValueType],
        results: &'a [ValueType],
    ) {
        let reachability = match self.control.last() {
            Some(parent) => parent.reachability.inner(),
            None => Reachability::Reachable,
        };
        self.control.push(Control {
            kind,
            stack_depth: self.stack.len() as u32,
            reachability,
            start_merge: Merge::new(params),
            end_merge: Merge::new(results),
            pc: self.pc,
        });
        self.current_code_reachable = reachability == Reachability::Reachable;
    }

    /// Reset the stack to the current construct's entry height and push
    /// values of the given types.
    fn push_merge_values(&mut self, types: &[ValueType]) {
        let (depth, pc) = {
            let current = self.current();
            (current.stack_depth as usize, current.pc)
        };
        self.stack.truncate(depth);
        for &ty in types {
            self.stack.push(Value::new(ty, pc));
        }
    }

    fn check_merge_types(&self, expected: &[ValueType], what: &str) -> DecodeResult {
        if self.trusted() {
            return Ok(());
        }
        let base = self.stack.len() - expected.len();
        for (i, &ty) in expected.iter().enumerate() {
            let actual = self.stack[base + i].ty;
            if !actual.is_subtype_of(ty) {
                return Err(self.error(
                    DecodeErrorKind::TypeMismatch,
                    format!("type error in {what}[{i}] (expected {ty}, got {actual})"),
                ));
            }
        }
        Ok(())
    }

    /// Check the fallthrough values of the current construct against its end
    /// merge.
    fn type_check_fallthru(&mut self) -> DecodeResult {
        let c = *self.current();
        let available = self.stack.len() - c.stack_depth as usize;
        let arity = c.end_merge.types.len();

        if c.reachable() {
            if available != arity {
                return Err(self.error(
                    DecodeErrorKind::ArityMismatch,
                    format!(
                        "expected {arity} elements on the stack for fallthru to @{}, found {available}",
                        c.pc
                    ),
                ));
            }
            return self.check_merge_types(c.end_merge.types, "merge");
        }

        if available > arity {
            return Err(self.error(
                DecodeErrorKind::ArityMismatch,
                format!(
                    "expected {arity} elements on the stack for fallthru to @{}, found {available}",
                    c.pc
                ),
            ));
        }
        self.type_check_unreachable_merge(c.end_merge.types, false)
    }

    /// Type check whatever values exist and synthesize the rest, leaving the
    /// stack shaped like `types`.
    fn type_check_unreachable_merge(
        &mut self,
        types: &[ValueType],
        conditional: bool,
    ) -> DecodeResult {
        let offset = usize::from(conditional);
        for i in (0..types.len()).rev() {
            self.pop(i + offset, types[i])?;
        }
        for &ty in types {
            self.push(ty);
        }
        Ok(())
    }

    /// Returns `true` if the branch is taken from reachable code.
    fn type_check_branch(&mut self, depth: u32, conditional: bool) -> DecodeResult<bool> {
        let types = self.control_at(depth).br_merge().types;
        if self.current().reachable() {
            if types.is_empty() {
                return Ok(true);
            }
            let available = self.stack.len() - self.current().stack_depth as usize;
            if available < types.len() {
                return Err(self.error(
                    DecodeErrorKind::ArityMismatch,
                    format!(
                        "expected {} elements on the stack for br to @{}, found {available}",
                        types.len(),
                        self.control_at(depth).pc
                    ),
                ));
            }
            self.check_merge_types(types, "branch")?;
            return Ok(true);
        }
        self.type_check_unreachable_merge(types, conditional)?;
        Ok(false)
    }

    fn type_check_br_table(&mut self, types: &[ValueType]) -> DecodeResult {
        let arity = types.len();
        if !self.current().unreachable() {
            let available = self.stack.len() - self.current().stack_depth as usize;
            if available < arity {
                return Err(self.error(
                    DecodeErrorKind::ArityMismatch,
                    format!(
                        "expected {arity} elements on the stack for br_table, found {available}"
                    ),
                ));
            }
            return self.check_merge_types(types, "br_table");
        }
        for i in (0..arity).rev() {
            self.pop(i + 1, types[i])?;
        }
        Ok(())
    }

    fn type_check_return(&self) -> DecodeResult {
        let returns = self.sig.results();
        let available = self.stack.len() - self.current().stack_depth as usize;
        if available < returns.len() {
            return Err(self.error(
                DecodeErrorKind::ArityMismatch,
                format!(
                    "expected {} elements on the stack for return, found {available}",
                    returns.len()
                ),
            ));
        }
        self.check_merge_types(returns, "return")
    }

    fn type_check_onearmed_if(&self, c: &Control<'a>) -> DecodeResult {
        if c.start_merge.arity() != c.end_merge.arity() {
            return Err(DecodeError::new(
                DecodeErrorKind::ArityMismatch,
                c.pc,
                "start-arity and end-arity of one-armed if must match",
            )
            .into());
        }
        if self.trusted() {
            return Ok(());
        }
        for (i, (&start, &end)) in c
            .start_merge
            .types
            .iter()
            .zip(c.end_merge.types)
            .enumerate()
        {
            if !start.is_subtype_of(end) {
                return Err(DecodeError::type_mismatch(
                    c.pc,
                    format!("type error in merge[{i}] (expected {end}, got {start})"),
                )
                .into());
            }
        }
        Ok(())
    }

    fn check_tail_call_returns(&self, callee: &FunctionSig) -> DecodeResult {
        let ours = self.sig.results();
        let theirs = callee.results();
        let compatible = ours.len() == theirs.len()
            && theirs
                .iter()
                .zip(ours)
                .all(|(&callee, &caller)| callee.is_subtype_of(caller));
        if compatible || self.trusted() {
            Ok(())
        } else {
            Err(self.error(
                DecodeErrorKind::TypeMismatch,
                "tail call return types mismatch",
            ))
        }
    }
}

// ============================================================================
// Function Decoder
// ============================================================================

/// Decodes one function body, driving a [`Backend`].
///
/// ```rust
/// use bumpalo::Bump;
/// use skiff_core::{DecoderOptions, FunctionSig, ModuleMetadata, ValueType};
/// use skiff_decoder::{FunctionDecoder, ValidateOnly};
///
/// let module = ModuleMetadata::default();
/// let sig = FunctionSig::new(&[], &[ValueType::I32]);
/// // no locals; i32.const 7; end
/// let body = [0x00, 0x41, 0x07, 0x0B];
///
/// let arena = Bump::new();
/// let mut decoder = FunctionDecoder::new(&arena, &module, &sig, &body, DecoderOptions::default());
/// decoder.decode(&mut ValidateOnly).unwrap();
/// ```
pub struct FunctionDecoder<'a> {
    ctx: DecodeContext<'a>,
    /// Operands popped by the current instruction.
    args: BumpVec<'a, Value>,
    /// Values pushed by the current call.
    returns: BumpVec<'a, Value>,
    /// Scratch for `br_table`: which depths were already seen.
    br_targets: BumpVec<'a, bool>,
    /// Scratch for `br_table`: the common result types.
    br_types: BumpVec<'a, ValueType>,
}

impl<'a> FunctionDecoder<'a> {
    pub fn new(
        arena: &'a Bump,
        module: &'a ModuleMetadata,
        sig: &'a FunctionSig,
        body: &'a [u8],
        options: DecoderOptions,
    ) -> Self {
        Self {
            ctx: DecodeContext {
                reader: Reader::new(body),
                body,
                arena,
                module,
                sig,
                options,
                locals: BumpVec::new_in(arena),
                stack: BumpVec::with_capacity_in(16, arena),
                control: BumpVec::with_capacity_in(8, arena),
                current_code_reachable: true,
                pc: 0,
                opcode: Opcode::Nop,
            },
            args: BumpVec::new_in(arena),
            returns: BumpVec::new_in(arena),
            br_targets: BumpVec::new_in(arena),
            br_types: BumpVec::new_in(arena),
        }
    }

    pub fn context(&self) -> &DecodeContext<'a> {
        &self.ctx
    }

    /// Decode and validate the whole body.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn decode(&mut self, backend: &mut dyn Backend) -> DecodeResult {
        self.decode_locals()?;
        debug!(
            num_locals = self.ctx.num_locals(),
            body_size = self.ctx.body_size(),
            "decoding function body"
        );
        backend.start_function(&mut self.ctx)?;

        self.ctx.pc = self.ctx.reader.position();
        let results = self.ctx.sig.results();
        self.ctx.push_control(ControlKind::Block, &[], results);
        let block = *self.ctx.current();
        backend.start_function_body(&mut self.ctx, &block)?;

        while !self.ctx.control.is_empty() {
            if self.ctx.reader.is_at_end() {
                return Err(DecodeError::new(
                    DecodeErrorKind::InvalidControl,
                    self.ctx.reader.position(),
                    "function body must end with \"end\" opcode",
                )
                .into());
            }
            self.ctx.pc = self.ctx.reader.position();
            let info = self.read_opcode()?;
            self.ctx.opcode = info.opcode;
            trace!(
                pc = self.ctx.pc,
                opcode = info.name,
                height = self.ctx.stack.len(),
                reachable = self.ctx.current_code_reachable,
                "decode"
            );
            if self.ctx.current_code_reachable {
                backend.next_instruction(&mut self.ctx, info.opcode)?;
            }
            self.decode_instruction(backend, info)?;
        }

        backend.finish_function(&mut self.ctx)?;
        Ok(())
    }

    fn decode_locals(&mut self) -> DecodeResult {
        let ctx = &mut self.ctx;
        ctx.locals.extend_from_slice(ctx.sig.params());
        let entries = ctx.reader.read_u32_leb("local decls count")?;
        for _ in 0..entries {
            let offset = ctx.reader.position();
            let count = ctx.reader.read_u32_leb("local count")?;
            let total = ctx.locals.len() as u64 + u64::from(count);
            if total > u64::from(MAX_LOCALS) {
                return Err(DecodeError::new(
                    DecodeErrorKind::TooManyLocals,
                    offset,
                    format!("local count too large: {total} exceeds {MAX_LOCALS}"),
                )
                .into());
            }
            let ty = ctx.read_value_type("local")?;
            ctx.locals.extend(std::iter::repeat_n(ty, count as usize));
        }
        Ok(())
    }

    fn read_opcode(&mut self) -> DecodeResult<&'static OpInfo> {
        let reader = &mut self.ctx.reader;
        let offset = reader.position();
        let byte = reader.read_u8("opcode")?;
        let code = if opcode::is_prefix(byte) {
            let sub = reader.read_u32_leb("prefixed opcode index")?;
            if sub > 0xFF {
                return Err(DecodeError::new(
                    DecodeErrorKind::InvalidOpcode,
                    offset,
                    format!("invalid prefixed opcode {byte:#04x} {sub:#x}"),
                )
                .into());
            }
            (u32::from(byte) << 8) | sub
        } else {
            u32::from(byte)
        };

        let info = opcode::lookup(code).ok_or_else(|| {
            DecodeError::new(
                DecodeErrorKind::InvalidOpcode,
                offset,
                format!("invalid opcode {code:#x}"),
            )
        })?;
        if !self.ctx.options.features.contains(info.feature) {
            return Err(DecodeError::new(
                DecodeErrorKind::InvalidOpcode,
                offset,
                format!("invalid opcode {} (feature not enabled)", info.name),
            )
            .into());
        }
        Ok(info)
    }

    fn decode_instruction(&mut self, backend: &mut dyn Backend, info: &OpInfo) -> DecodeResult {
        match info.class {
            OpClass::Unary { input, output } => {
                let value = self.ctx.pop(0, input)?;
                let result = self.ctx.push(output);
                call_if_reachable!(self, backend, unop(info.opcode, value, result));
                Ok(())
            }
            OpClass::Binary { lhs, rhs, output } => {
                let rhs = self.ctx.pop(1, rhs)?;
                let lhs = self.ctx.pop(0, lhs)?;
                let result = self.ctx.push(output);
                call_if_reachable!(self, backend, binop(info.opcode, lhs, rhs, result));
                Ok(())
            }
            OpClass::Load(ty) => self.decode_load(backend, ty),
            OpClass::Store(ty) => self.decode_store(backend, ty),
            OpClass::Special => self.decode_special(backend, info.opcode),
        }
    }

    fn decode_special(&mut self, backend: &mut dyn Backend, op: Opcode) -> DecodeResult {
        match op {
            Opcode::Nop => Ok(()),
            Opcode::Unreachable => {
                call_if_reachable!(self, backend, unreachable());
                self.end_control(backend)
            }
            Opcode::Block | Opcode::Loop | Opcode::Try => self.decode_block(backend, op),
            Opcode::If => self.decode_if(backend),
            Opcode::Else => self.decode_else(backend),
            Opcode::End => self.decode_end(backend),
            Opcode::Catch => self.decode_catch(backend),
            Opcode::CatchAll => self.decode_catch_all(backend),
            Opcode::Throw => self.decode_throw(backend),
            Opcode::Rethrow => self.decode_rethrow(backend),
            Opcode::Br => self.decode_br(backend),
            Opcode::BrIf => self.decode_br_if(backend),
            Opcode::BrTable => self.decode_br_table(backend),
            Opcode::Return => self.decode_return(backend),
            Opcode::Call | Opcode::ReturnCall => {
                self.decode_call(backend, op == Opcode::ReturnCall)
            }
            Opcode::CallIndirect | Opcode::ReturnCallIndirect => {
                self.decode_call_indirect(backend, op == Opcode::ReturnCallIndirect)
            }
            Opcode::Drop => {
                let value = self.ctx.pop_any(0)?;
                call_if_reachable!(self, backend, drop_value(value));
                Ok(())
            }
            Opcode::Select => self.decode_select(backend),
            Opcode::SelectWithType => self.decode_select_with_type(backend),
            Opcode::LocalGet | Opcode::LocalSet | Opcode::LocalTee => {
                self.decode_local(backend, op)
            }
            Opcode::GlobalGet | Opcode::GlobalSet => self.decode_global(backend, op),
            Opcode::TableGet | Opcode::TableSet => self.decode_table_access(backend, op),
            Opcode::MemorySize | Opcode::MemoryGrow => self.decode_memory_size(backend, op),
            Opcode::I32Const
            | Opcode::I64Const
            | Opcode::F32Const
            | Opcode::F64Const
            | Opcode::V128Const => self.decode_const(backend, op),
            Opcode::RefNull | Opcode::RefIsNull | Opcode::RefFunc => self.decode_ref(backend, op),
            Opcode::MemoryInit
            | Opcode::DataDrop
            | Opcode::MemoryCopy
            | Opcode::MemoryFill => self.decode_bulk_memory(backend, op),
            Opcode::TableInit
            | Opcode::ElemDrop
            | Opcode::TableCopy
            | Opcode::TableGrow
            | Opcode::TableSize
            | Opcode::TableFill => self.decode_bulk_table(backend, op),
            Opcode::I32x4ExtractLane | Opcode::I32x4ReplaceLane => self.decode_lane_op(backend, op),
            _ => Err(self.ctx.error(
                DecodeErrorKind::InvalidOpcode,
                format!("invalid opcode {}", op.name()),
            )),
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Pop one value per type, leaving them in `self.args` in stack order.
    fn pop_args(&mut self, types: &[ValueType]) -> DecodeResult {
        self.args.clear();
        for i in (0..types.len()).rev() {
            let value = self.ctx.pop(i, types[i])?;
            self.args.push(value);
        }
        self.args.reverse();
        Ok(())
    }

    fn push_returns(&mut self, types: &[ValueType]) {
        self.returns.clear();
        for &ty in types {
            let value = self.ctx.push(ty);
            self.returns.push(value);
        }
    }

    /// The rest of the current construct is unreachable.
    fn end_control(&mut self, backend: &mut dyn Backend) -> DecodeResult {
        let depth = self.ctx.current().stack_depth as usize;
        self.ctx.stack.truncate(depth);
        if self.ctx.current_code_reachable {
            let c = *self.ctx.current();
            backend.end_control(&mut self.ctx, &c)?;
        }
        self.ctx.current_mut().reachability = Reachability::Unreachable;
        self.ctx.current_code_reachable = false;
        Ok(())
    }

    fn fall_thru_to(&mut self, backend: &mut dyn Backend) -> DecodeResult {
        self.ctx.type_check_fallthru()?;
        let c = *self.ctx.current();
        if !c.reachable() {
            return Ok(());
        }
        if !c.is_loop() {
            backend.fall_thru_to(&mut self.ctx, &c)?;
        }
        self.ctx.current_mut().end_merge.reached = true;
        Ok(())
    }

    fn pop_control(&mut self, backend: &mut dyn Backend) -> DecodeResult {
        let c = *self.ctx.current();
        if self.ctx.parent_reachable() {
            backend.pop_control(&mut self.ctx, &c)?;
        }
        // A loop leaves its fallthrough values in place.
        if !c.is_loop() {
            self.ctx.push_merge_values(c.end_merge.types);
        }

        let parent_reached = c.reachable() || c.end_merge.reached || c.is_onearmed_if();
        self.ctx.control.truncate(self.ctx.control.len() - 1);
        if !parent_reached {
            self.ctx.set_succeeding_code_dynamically_unreachable();
        }
        self.ctx.current_code_reachable = self.ctx.current().reachable();
        Ok(())
    }

    // ========================================================================
    // Control Instructions
    // ========================================================================

    fn decode_block(&mut self, backend: &mut dyn Backend, op: Opcode) -> DecodeResult {
        let (params, results) = self.ctx.read_block_type()?;
        self.pop_args(params)?;
        let kind = match op {
            Opcode::Loop => ControlKind::Loop,
            Opcode::Try => ControlKind::Try,
            _ => ControlKind::Block,
        };
        self.ctx.push_control(kind, params, results);
        let block = *self.ctx.current();
        match kind {
            ControlKind::Loop => call_if_reachable!(self, backend, begin_loop(&block)),
            ControlKind::Try => call_if_reachable!(self, backend, begin_try(&block)),
            _ => call_if_reachable!(self, backend, block(&block)),
        }
        self.ctx.push_merge_values(params);
        Ok(())
    }

    fn decode_if(&mut self, backend: &mut dyn Backend) -> DecodeResult {
        let (params, results) = self.ctx.read_block_type()?;
        let cond = self.ctx.pop(0, ValueType::I32)?;
        self.pop_args(params)?;
        self.ctx.push_control(ControlKind::If, params, results);
        let block = *self.ctx.current();
        call_if_reachable!(self, backend, begin_if(cond, &block));
        self.ctx.push_merge_values(params);
        Ok(())
    }

    fn decode_else(&mut self, backend: &mut dyn Backend) -> DecodeResult {
        let c = *self.ctx.current();
        if !c.is_if() {
            return Err(self
                .ctx
                .error(DecodeErrorKind::InvalidControl, "else does not match an if"));
        }
        if c.kind == ControlKind::IfElse {
            return Err(self.ctx.error(
                DecodeErrorKind::InvalidControl,
                "else already present for if",
            ));
        }
        self.ctx.type_check_fallthru()?;
        self.ctx.current_mut().kind = ControlKind::IfElse;
        let c = *self.ctx.current();
        if self.ctx.parent_reachable() {
            backend.else_branch(&mut self.ctx, &c)?;
        }

        let inner = self.ctx.control_at(1).reachability.inner();
        let current = self.ctx.current_mut();
        if current.reachable() {
            current.end_merge.reached = true;
        }
        current.reachability = inner;
        self.ctx.push_merge_values(c.start_merge.types);
        self.ctx.current_code_reachable = inner == Reachability::Reachable;
        Ok(())
    }

    fn decode_end(&mut self, backend: &mut dyn Backend) -> DecodeResult {
        let c = *self.ctx.current();
        if c.is_incomplete_try() {
            return Err(self.ctx.error(
                DecodeErrorKind::InvalidControl,
                "missing catch or catch-all in try",
            ));
        }
        if c.is_onearmed_if() {
            self.ctx.type_check_onearmed_if(&c)?;
        }
        if c.kind == ControlKind::TryCatch {
            // Exceptions no catch matched are rethrown.
            self.fall_thru_to(backend)?;
            let inner = self.ctx.control_at(1).reachability.inner();
            self.ctx.current_mut().reachability = inner;
            let c = *self.ctx.current();
            if self.ctx.parent_reachable() {
                backend.catch_all(&mut self.ctx, &c)?;
            }
            self.ctx.current_code_reachable = c.reachable();
            call_if_reachable!(self, backend, rethrow(&c));
            self.end_control(backend)?;
        }

        self.ctx.type_check_fallthru()?;

        if self.ctx.control.len() == 1 {
            if !self.ctx.reader.is_at_end() {
                return Err(DecodeError::new(
                    DecodeErrorKind::InvalidControl,
                    self.ctx.reader.position(),
                    "trailing code after function end",
                )
                .into());
            }
            call_if_reachable!(self, backend, do_return());
            self.ctx.control.clear();
            return Ok(());
        }
        self.pop_control(backend)
    }

    fn decode_br(&mut self, backend: &mut dyn Backend) -> DecodeResult {
        let depth = self.ctx.read_branch_depth()?;
        if self.ctx.type_check_branch(depth, false)? {
            call_if_reachable!(self, backend, br_or_ret(depth));
            self.ctx.control_at_mut(depth).br_merge_mut().reached = true;
        }
        self.end_control(backend)
    }

    fn decode_br_if(&mut self, backend: &mut dyn Backend) -> DecodeResult {
        let depth = self.ctx.read_branch_depth()?;
        let cond = self.ctx.pop(0, ValueType::I32)?;
        if self.ctx.type_check_branch(depth, true)? {
            call_if_reachable!(self, backend, br_if(cond, depth));
            self.ctx.control_at_mut(depth).br_merge_mut().reached = true;
        }
        Ok(())
    }

    fn decode_br_table(&mut self, backend: &mut dyn Backend) -> DecodeResult {
        let count = self.ctx.reader.read_u32_leb("table count")?;
        if count > MAX_BR_TABLE_SIZE {
            return Err(self.ctx.error(
                DecodeErrorKind::InvalidImmediate,
                format!("invalid table count (> max br_table size): {count}"),
            ));
        }
        let mut targets = BumpVec::with_capacity_in(count as usize + 1, self.ctx.arena);
        for _ in 0..=count {
            targets.push(self.ctx.reader.read_u32_leb("br_table target")?);
        }
        let targets = targets.into_bump_slice();
        let key = self.ctx.pop(0, ValueType::I32)?;

        let depth_count = self.ctx.control.len();
        self.br_targets.clear();
        self.br_targets.resize(depth_count, false);
        self.br_types.clear();
        let mut arity = None;

        for (index, &target) in targets.iter().enumerate() {
            if target as usize >= depth_count {
                return Err(self.ctx.error(
                    DecodeErrorKind::InvalidBranchDepth,
                    format!("invalid table entry (index {index}, depth {target})"),
                ));
            }
            if self.br_targets[target as usize] {
                continue;
            }
            self.br_targets[target as usize] = true;

            let types = self.ctx.control_at(target).br_merge().types;
            let Some(expected) = arity else {
                self.br_types.extend_from_slice(types);
                arity = Some(types.len());
                continue;
            };
            if types.len() != expected {
                return Err(self.ctx.error(
                    DecodeErrorKind::ArityMismatch,
                    format!(
                        "inconsistent arity in br_table target {index} (previous was {expected}, this one is {})",
                        types.len()
                    ),
                ));
            }
            if self.ctx.trusted() {
                continue;
            }
            let features = self.ctx.options.features;
            let widen = features.contains(Features::REFERENCE_TYPES);
            for (slot, &ty) in self.br_types.iter_mut().zip(types) {
                if widen {
                    *slot = ValueType::common_subtype(*slot, ty);
                } else if *slot != ty {
                    return Err(self.ctx.error(
                        DecodeErrorKind::TypeMismatch,
                        format!("inconsistent type in br_table target {index}"),
                    ));
                }
            }
        }

        self.ctx.type_check_br_table(&self.br_types)?;

        if self.ctx.current_code_reachable {
            backend.br_table(&mut self.ctx, &BranchTable::new(targets), key)?;
            for depth in 0..depth_count {
                if self.br_targets[depth] {
                    self.ctx.control_at_mut(depth as u32).br_merge_mut().reached = true;
                }
            }
        }
        self.end_control(backend)
    }

    fn decode_return(&mut self, backend: &mut dyn Backend) -> DecodeResult {
        if self.ctx.current_code_reachable {
            self.ctx.type_check_return()?;
            backend.do_return(&mut self.ctx)?;
        } else {
            let returns = self.ctx.sig.results();
            for i in (0..returns.len()).rev() {
                self.ctx.pop(i, returns[i])?;
            }
        }
        self.end_control(backend)
    }

    fn decode_catch(&mut self, backend: &mut dyn Backend) -> DecodeResult {
        let tag_index = self.ctx.reader.read_u32_leb("tag index")?;
        let sig = self
            .ctx
            .module
            .tag_sig(tag_index)
            .ok_or_else(|| DecodeError::invalid_index(self.ctx.pc, "tag", tag_index))?;
        self.check_catch_target("catch")?;

        self.ctx.current_mut().kind = ControlKind::TryCatch;
        self.fall_thru_to(backend)?;
        let depth = self.ctx.current().stack_depth as usize;
        self.ctx.stack.truncate(depth);
        let inner = self.ctx.control_at(1).reachability.inner();
        self.ctx.current_mut().reachability = inner;

        self.args.clear();
        for &ty in sig.params() {
            let value = self.ctx.push(ty);
            self.args.push(value);
        }
        let c = *self.ctx.current();
        if self.ctx.parent_reachable() {
            backend.catch_exception(&mut self.ctx, tag_index, &c, &self.args)?;
        }
        self.ctx.current_code_reachable = c.reachable();
        Ok(())
    }

    fn decode_catch_all(&mut self, backend: &mut dyn Backend) -> DecodeResult {
        self.check_catch_target("catch-all")?;
        self.ctx.current_mut().kind = ControlKind::TryCatchAll;
        self.fall_thru_to(backend)?;
        let depth = self.ctx.current().stack_depth as usize;
        self.ctx.stack.truncate(depth);
        let inner = self.ctx.control_at(1).reachability.inner();
        self.ctx.current_mut().reachability = inner;

        let c = *self.ctx.current();
        if self.ctx.parent_reachable() {
            backend.catch_all(&mut self.ctx, &c)?;
        }
        self.ctx.current_code_reachable = c.reachable();
        Ok(())
    }

    fn check_catch_target(&self, what: &str) -> DecodeResult {
        let c = self.ctx.current();
        if !c.is_try() {
            return Err(self.ctx.error(
                DecodeErrorKind::InvalidControl,
                format!("{what} does not match a try"),
            ));
        }
        if c.kind == ControlKind::TryCatchAll {
            return Err(self.ctx.error(
                DecodeErrorKind::InvalidControl,
                format!("{what} after catch-all for try"),
            ));
        }
        Ok(())
    }

    fn decode_throw(&mut self, backend: &mut dyn Backend) -> DecodeResult {
        let tag_index = self.ctx.reader.read_u32_leb("tag index")?;
        let sig = self
            .ctx
            .module
            .tag_sig(tag_index)
            .ok_or_else(|| DecodeError::invalid_index(self.ctx.pc, "tag", tag_index))?;
        self.pop_args(sig.params())?;
        call_if_reachable!(self, backend, throw(tag_index, &self.args));
        self.end_control(backend)
    }

    fn decode_rethrow(&mut self, backend: &mut dyn Backend) -> DecodeResult {
        let depth = self.ctx.read_branch_depth()?;
        let target = *self.ctx.control_at(depth);
        if !matches!(
            target.kind,
            ControlKind::TryCatch | ControlKind::TryCatchAll
        ) {
            return Err(self.ctx.error(
                DecodeErrorKind::InvalidControl,
                "rethrow not targeting catch or catch-all",
            ));
        }
        call_if_reachable!(self, backend, rethrow(&target));
        self.end_control(backend)
    }

    // ========================================================================
    // Calls
    // ========================================================================

    fn decode_call(&mut self, backend: &mut dyn Backend, tail: bool) -> DecodeResult {
        let (func_index, sig) = self.ctx.read_function_index()?;
        if tail {
            self.ctx.check_tail_call_returns(sig)?;
            self.pop_args(sig.params())?;
            call_if_reachable!(self, backend, return_call(func_index, sig, &self.args));
            return self.end_control(backend);
        }
        self.pop_args(sig.params())?;
        self.push_returns(sig.results());
        call_if_reachable!(
            self,
            backend,
            call_direct(func_index, sig, &self.args, &self.returns)
        );
        Ok(())
    }

    fn decode_call_indirect(&mut self, backend: &mut dyn Backend, tail: bool) -> DecodeResult {
        let sig_index = self.ctx.reader.read_u32_leb("signature index")?;
        let table_index = if self.ctx.features().contains(Features::REFERENCE_TYPES) {
            self.ctx.reader.read_u32_leb("table index")?
        } else {
            self.ctx.read_zero_byte("table index")?;
            0
        };
        let sig = self
            .ctx
            .module
            .signature(sig_index)
            .ok_or_else(|| DecodeError::invalid_index(self.ctx.pc, "signature", sig_index))?;
        let table = self
            .ctx
            .module
            .table(table_index)
            .ok_or_else(|| DecodeError::invalid_index(self.ctx.pc, "table", table_index))?;
        if table.elem_type != ValueType::FuncRef {
            return Err(self.ctx.error(
                DecodeErrorKind::TypeMismatch,
                format!("call_indirect: immediate table #{table_index} is not of a function type"),
            ));
        }
        if tail {
            self.ctx.check_tail_call_returns(sig)?;
        }

        let imm = CallIndirectImm {
            sig_index,
            table_index,
        };
        let index = self.ctx.pop(0, ValueType::I32)?;
        self.pop_args(sig.params())?;
        if tail {
            call_if_reachable!(
                self,
                backend,
                return_call_indirect(index, &imm, sig, &self.args)
            );
            return self.end_control(backend);
        }
        self.push_returns(sig.results());
        call_if_reachable!(
            self,
            backend,
            call_indirect(index, &imm, sig, &self.args, &self.returns)
        );
        Ok(())
    }

    // ========================================================================
    // Parametric and Variables
    // ========================================================================

    fn decode_select(&mut self, backend: &mut dyn Backend) -> DecodeResult {
        let cond = self.ctx.pop(2, ValueType::I32)?;
        let fval = self.ctx.pop_any(1)?;
        let tval = self.ctx.pop(0, fval.ty)?;
        let ty = if tval.ty == ValueType::Bottom {
            fval.ty
        } else {
            tval.ty
        };
        if ty.is_reference() && !self.ctx.trusted() {
            return Err(self.ctx.error(
                DecodeErrorKind::TypeMismatch,
                "select without type is only valid for value type inputs",
            ));
        }
        let result = self.ctx.push(ty);
        call_if_reachable!(self, backend, select(cond, fval, tval, result));
        Ok(())
    }

    fn decode_select_with_type(&mut self, backend: &mut dyn Backend) -> DecodeResult {
        let count = self.ctx.reader.read_u32_leb("number of select types")?;
        if count != 1 {
            return Err(self.ctx.error(
                DecodeErrorKind::InvalidImmediate,
                "invalid number of types for select",
            ));
        }
        let ty = self.ctx.read_value_type("select")?;
        let cond = self.ctx.pop(2, ValueType::I32)?;
        let fval = self.ctx.pop(1, ty)?;
        let tval = self.ctx.pop(0, ty)?;
        let result = self.ctx.push(ty);
        call_if_reachable!(self, backend, select(cond, fval, tval, result));
        Ok(())
    }

    fn decode_local(&mut self, backend: &mut dyn Backend, op: Opcode) -> DecodeResult {
        let index = self.ctx.read_local_index()?;
        let ty = self.ctx.local_type(index);
        match op {
            Opcode::LocalGet => {
                let result = self.ctx.push(ty);
                call_if_reachable!(self, backend, local_get(result, index));
            }
            Opcode::LocalSet => {
                let value = self.ctx.pop(0, ty)?;
                call_if_reachable!(self, backend, local_set(value, index));
            }
            _ => {
                let value = self.ctx.pop(0, ty)?;
                let result = self.ctx.push(ty);
                call_if_reachable!(self, backend, local_tee(value, result, index));
            }
        }
        Ok(())
    }

    fn decode_global(&mut self, backend: &mut dyn Backend, op: Opcode) -> DecodeResult {
        let index = self.ctx.reader.read_u32_leb("global index")?;
        let global = *self
            .ctx
            .module
            .global(index)
            .ok_or_else(|| DecodeError::invalid_index(self.ctx.pc, "global", index))?;
        if op == Opcode::GlobalGet {
            let result = self.ctx.push(global.ty);
            call_if_reachable!(self, backend, global_get(result, index));
            return Ok(());
        }
        if !global.mutable {
            return Err(self.ctx.error(
                DecodeErrorKind::InvalidImmediate,
                format!("immutable global #{index} cannot be assigned"),
            ));
        }
        let value = self.ctx.pop(0, global.ty)?;
        call_if_reachable!(self, backend, global_set(value, index));
        Ok(())
    }

    fn decode_table_access(&mut self, backend: &mut dyn Backend, op: Opcode) -> DecodeResult {
        let (table_index, elem_type) = self.ctx.read_table_index()?;
        if op == Opcode::TableGet {
            let index = self.ctx.pop(0, ValueType::I32)?;
            let result = self.ctx.push(elem_type);
            call_if_reachable!(self, backend, table_get(index, result, table_index));
        } else {
            let value = self.ctx.pop(1, elem_type)?;
            let index = self.ctx.pop(0, ValueType::I32)?;
            call_if_reachable!(self, backend, table_set(index, value, table_index));
        }
        Ok(())
    }

    fn decode_const(&mut self, backend: &mut dyn Backend, op: Opcode) -> DecodeResult {
        match op {
            Opcode::I32Const => {
                let value = self.ctx.reader.read_i32_leb("i32 constant")?;
                let result = self.ctx.push(ValueType::I32);
                call_if_reachable!(self, backend, i32_const(result, value));
            }
            Opcode::I64Const => {
                let value = self.ctx.reader.read_i64_leb("i64 constant")?;
                let result = self.ctx.push(ValueType::I64);
                call_if_reachable!(self, backend, i64_const(result, value));
            }
            Opcode::F32Const => {
                let value = self.ctx.reader.read_f32("f32 constant")?;
                let result = self.ctx.push(ValueType::F32);
                call_if_reachable!(self, backend, f32_const(result, value));
            }
            Opcode::F64Const => {
                let value = self.ctx.reader.read_f64("f64 constant")?;
                let result = self.ctx.push(ValueType::F64);
                call_if_reachable!(self, backend, f64_const(result, value));
            }
            _ => {
                let value = self.ctx.reader.read_array::<16>("v128 constant")?;
                let result = self.ctx.push(ValueType::V128);
                call_if_reachable!(self, backend, s128_const(result, value));
            }
        }
        Ok(())
    }

    fn decode_ref(&mut self, backend: &mut dyn Backend, op: Opcode) -> DecodeResult {
        match op {
            Opcode::RefNull => {
                let ty = self.ctx.read_value_type("reference")?;
                if !ty.is_reference() {
                    return Err(self.ctx.error(
                        DecodeErrorKind::InvalidImmediate,
                        format!("invalid reference type {ty}"),
                    ));
                }
                let result = self.ctx.push(ty);
                call_if_reachable!(self, backend, ref_null(ty, result));
            }
            Opcode::RefIsNull => {
                let value = self.ctx.pop_any(0)?;
                if !value.ty.is_reference()
                    && value.ty != ValueType::Bottom
                    && !self.ctx.trusted()
                {
                    return Err(self.ctx.error(
                        DecodeErrorKind::TypeMismatch,
                        format!(
                            "ref.is_null[0] expected reference type, found {} of type {}",
                            self.ctx.opcode_name_at(value.pc),
                            value.ty
                        ),
                    ));
                }
                let result = self.ctx.push(ValueType::I32);
                call_if_reachable!(self, backend, ref_is_null(value, result));
            }
            _ => {
                let (func_index, _) = self.ctx.read_function_index()?;
                let result = self.ctx.push(ValueType::FuncRef);
                call_if_reachable!(self, backend, ref_func(func_index, result));
            }
        }
        Ok(())
    }

    // ========================================================================
    // Memory
    // ========================================================================

    fn decode_load(&mut self, backend: &mut dyn Backend, ty: LoadType) -> DecodeResult {
        self.ctx.check_has_memory()?;
        let imm = self.ctx.read_mem_arg(ty.size_log2())?;
        let index = self.ctx.pop(0, ValueType::I32)?;
        let result = self.ctx.push(ty.value_type());
        call_if_reachable!(self, backend, load_mem(ty, &imm, index, result));
        Ok(())
    }

    fn decode_store(&mut self, backend: &mut dyn Backend, ty: StoreType) -> DecodeResult {
        self.ctx.check_has_memory()?;
        let imm = self.ctx.read_mem_arg(ty.size_log2())?;
        let value = self.ctx.pop(1, ty.value_type())?;
        let index = self.ctx.pop(0, ValueType::I32)?;
        call_if_reachable!(self, backend, store_mem(ty, &imm, index, value));
        Ok(())
    }

    fn decode_memory_size(&mut self, backend: &mut dyn Backend, op: Opcode) -> DecodeResult {
        self.ctx.read_zero_byte("memory index")?;
        self.ctx.check_has_memory()?;
        if op == Opcode::MemorySize {
            let result = self.ctx.push(ValueType::I32);
            call_if_reachable!(self, backend, current_memory_pages(result));
        } else {
            let value = self.ctx.pop(0, ValueType::I32)?;
            let result = self.ctx.push(ValueType::I32);
            call_if_reachable!(self, backend, memory_grow(value, result));
        }
        Ok(())
    }

    fn decode_bulk_memory(&mut self, backend: &mut dyn Backend, op: Opcode) -> DecodeResult {
        const OPERANDS: [ValueType; 3] = [ValueType::I32; 3];
        match op {
            Opcode::MemoryInit => {
                let segment = self.ctx.read_data_segment()?;
                self.ctx.read_zero_byte("memory index")?;
                self.ctx.check_has_memory()?;
                self.pop_args(&OPERANDS)?;
                call_if_reachable!(self, backend, memory_init(segment, &self.args));
            }
            Opcode::DataDrop => {
                let segment = self.ctx.read_data_segment()?;
                call_if_reachable!(self, backend, data_drop(segment));
            }
            Opcode::MemoryCopy => {
                self.ctx.read_zero_byte("memory index")?;
                self.ctx.read_zero_byte("memory index")?;
                self.ctx.check_has_memory()?;
                self.pop_args(&OPERANDS)?;
                call_if_reachable!(self, backend, memory_copy(&self.args));
            }
            _ => {
                self.ctx.read_zero_byte("memory index")?;
                self.ctx.check_has_memory()?;
                self.pop_args(&OPERANDS)?;
                call_if_reachable!(self, backend, memory_fill(&self.args));
            }
        }
        Ok(())
    }

    fn decode_bulk_table(&mut self, backend: &mut dyn Backend, op: Opcode) -> DecodeResult {
        const OPERANDS: [ValueType; 3] = [ValueType::I32; 3];
        match op {
            Opcode::TableInit => {
                let (segment, segment_type) = self.ctx.read_elem_segment()?;
                let (table_index, elem_type) = self.ctx.read_table_index()?;
                self.check_elem_types(segment_type, elem_type)?;
                self.pop_args(&OPERANDS)?;
                call_if_reachable!(self, backend, table_init(segment, table_index, &self.args));
            }
            Opcode::ElemDrop => {
                let (segment, _) = self.ctx.read_elem_segment()?;
                call_if_reachable!(self, backend, elem_drop(segment));
            }
            Opcode::TableCopy => {
                let (dst_table, dst_type) = self.ctx.read_table_index()?;
                let (src_table, src_type) = self.ctx.read_table_index()?;
                self.check_elem_types(src_type, dst_type)?;
                self.pop_args(&OPERANDS)?;
                call_if_reachable!(self, backend, table_copy(dst_table, src_table, &self.args));
            }
            Opcode::TableGrow => {
                let (table_index, elem_type) = self.ctx.read_table_index()?;
                let delta = self.ctx.pop(1, ValueType::I32)?;
                let value = self.ctx.pop(0, elem_type)?;
                let result = self.ctx.push(ValueType::I32);
                call_if_reachable!(self, backend, table_grow(table_index, value, delta, result));
            }
            Opcode::TableSize => {
                let (table_index, _) = self.ctx.read_table_index()?;
                let result = self.ctx.push(ValueType::I32);
                call_if_reachable!(self, backend, table_size(table_index, result));
            }
            _ => {
                let (table_index, elem_type) = self.ctx.read_table_index()?;
                self.pop_args(&[ValueType::I32, elem_type, ValueType::I32])?;
                call_if_reachable!(self, backend, table_fill(table_index, &self.args));
            }
        }
        Ok(())
    }

    fn check_elem_types(&self, src: ValueType, dst: ValueType) -> DecodeResult {
        if src.is_subtype_of(dst) || self.ctx.trusted() {
            Ok(())
        } else {
            Err(self.ctx.error(
                DecodeErrorKind::TypeMismatch,
                format!(
                    "{}: element type {src} does not match table type {dst}",
                    self.ctx.opcode.name()
                ),
            ))
        }
    }

    // ========================================================================
    // Vector Lanes
    // ========================================================================

    fn decode_lane_op(&mut self, backend: &mut dyn Backend, op: Opcode) -> DecodeResult {
        let lane = self.ctx.reader.read_u8("lane index")?;
        if lane >= 4 {
            return Err(self.ctx.error(
                DecodeErrorKind::InvalidImmediate,
                format!("invalid lane index {lane}"),
            ));
        }
        let result = if op == Opcode::I32x4ExtractLane {
            self.pop_args(&[ValueType::V128])?;
            self.ctx.push(ValueType::I32)
        } else {
            self.pop_args(&[ValueType::V128, ValueType::I32])?;
            self.ctx.push(ValueType::V128)
        };
        call_if_reachable!(self, backend, simd_lane_op(op, lane, &self.args, result));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{BackendResult, ValidateOnly};
    use skiff_core::ModuleBuilder;

    const I32: u8 = 0x7F;
    const I64: u8 = 0x7E;

    fn module() -> ModuleMetadata {
        let mut builder = ModuleBuilder::new();
        let void = builder.add_type(FunctionSig::new(&[], &[]));
        let binary = builder.add_type(FunctionSig::new(
            &[ValueType::I32, ValueType::I32],
            &[ValueType::I32],
        ));
        builder.add_function(void).unwrap();
        builder.add_function(binary).unwrap();
        builder.add_table(ValueType::FuncRef, 3, Some(3)).unwrap();
        builder.set_memory(1, Some(1)).unwrap();
        builder.add_global(ValueType::I32, false);
        builder.build()
    }

    fn decode_with(
        sig: &FunctionSig,
        body: &[u8],
        options: DecoderOptions,
        backend: &mut dyn Backend,
    ) -> DecodeResult {
        let module = module();
        let arena = Bump::new();
        let mut decoder = FunctionDecoder::new(&arena, &module, sig, body, options);
        decoder.decode(backend)
    }

    fn validate(params: &[ValueType], results: &[ValueType], body: &[u8]) -> DecodeResult {
        let sig = FunctionSig::new(params, results);
        decode_with(&sig, body, DecoderOptions::default(), &mut ValidateOnly)
    }

    fn decode_error(params: &[ValueType], results: &[ValueType], body: &[u8]) -> DecodeError {
        match validate(params, results, body) {
            Err(CompileError::Decode(err)) => err,
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    /// Records the callbacks that fired, in order.
    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl Backend for Recorder {
        fn i32_const(
            &mut self,
            ctx: &mut DecodeContext<'_>,
            _: Value,
            value: i32,
        ) -> BackendResult {
            let event = format!("i32.const {value} @{}", ctx.stack_height());
            self.events.push(event);
            Ok(())
        }

        fn br_or_ret(&mut self, _: &mut DecodeContext<'_>, depth: u32) -> BackendResult {
            self.events.push(format!("br {depth}"));
            Ok(())
        }

        fn pop_control(&mut self, _: &mut DecodeContext<'_>, block: &Control<'_>) -> BackendResult {
            self.events
                .push(format!("pop {:?} reached={}", block.kind, block.end_merge.reached));
            Ok(())
        }

        fn do_return(&mut self, ctx: &mut DecodeContext<'_>) -> BackendResult {
            self.events.push(format!("return @{}", ctx.stack_height()));
            Ok(())
        }

        fn binop(
            &mut self,
            _: &mut DecodeContext<'_>,
            op: Opcode,
            _: Value,
            _: Value,
            _: Value,
        ) -> BackendResult {
            self.events.push(op.name().to_string());
            Ok(())
        }
    }

    #[test]
    fn constant_addition() {
        let body = [0x00, 0x41, 0x01, 0x41, 0x02, 0x6A, 0x0B];
        let sig = FunctionSig::new(&[], &[ValueType::I32]);
        let mut recorder = Recorder::default();
        decode_with(&sig, &body, DecoderOptions::default(), &mut recorder).unwrap();
        assert_eq!(
            recorder.events,
            ["i32.const 1 @1", "i32.const 2 @2", "i32.add", "return @1"]
        );
    }

    #[test]
    fn branch_makes_rest_of_block_unreachable() {
        // block (result i32) i32.const 5 br 0 i32.const 9 end end
        let body = [0x00, 0x02, I32, 0x41, 0x05, 0x0C, 0x00, 0x41, 0x09, 0x0B, 0x0B];
        let sig = FunctionSig::new(&[], &[ValueType::I32]);
        let mut recorder = Recorder::default();
        decode_with(&sig, &body, DecoderOptions::default(), &mut recorder).unwrap();
        assert_eq!(
            recorder.events,
            [
                "i32.const 5 @1",
                "br 0",
                "pop Block reached=true",
                "return @1"
            ]
        );
    }

    #[test]
    fn type_mismatch_reported_at_consumer() {
        // (local i64) local.get 0 f32.add
        let body = [0x01, 0x01, I64, 0x20, 0x00, 0x92, 0x0B];
        let err = decode_error(&[], &[], &body);
        assert_eq!(err.kind, DecodeErrorKind::TypeMismatch);
        assert_eq!(err.offset, 5);
        assert_eq!(
            err.message,
            "f32.add[1] expected type f32, found local.get of type i64"
        );
    }

    #[test]
    fn underflow_in_reachable_code() {
        let body = [0x00, 0x41, 0x01, 0x6A, 0x0B];
        let err = decode_error(&[], &[ValueType::I32], &body);
        assert_eq!(err.kind, DecodeErrorKind::StackUnderflow);
        assert_eq!(err.offset, 3);
        assert_eq!(
            err.message,
            "not enough arguments on the stack for i32.add, expected 1 more"
        );
    }

    #[test]
    fn unreachable_stack_is_polymorphic() {
        // unreachable i32.add drop end
        validate(&[], &[], &[0x00, 0x00, 0x6A, 0x1A, 0x0B]).unwrap();
        // unreachable end, with a result
        validate(&[], &[ValueType::F64], &[0x00, 0x00, 0x0B]).unwrap();
    }

    #[test]
    fn unreachable_values_are_still_type_checked() {
        // unreachable i64.const 0 i32.add
        let err = decode_error(&[], &[], &[0x00, 0x00, 0x42, 0x00, 0x6A, 0x0B]);
        assert_eq!(err.kind, DecodeErrorKind::TypeMismatch);
    }

    #[test]
    fn nested_block_in_unreachable_code_is_spec_only() {
        // unreachable block i32.add drop end end
        let body = [0x00, 0x00, 0x02, 0x40, 0x6A, 0x1A, 0x0B, 0x0B];
        let err = decode_error(&[], &[], &body);
        assert_eq!(err.kind, DecodeErrorKind::StackUnderflow);
        assert_eq!(err.offset, 4);
    }

    #[test]
    fn no_callbacks_inside_unreachable_nesting() {
        // unreachable block (result i32) i32.const 1 end drop end
        let body = [0x00, 0x00, 0x02, I32, 0x41, 0x01, 0x0B, 0x1A, 0x0B];
        let sig = FunctionSig::new(&[], &[]);
        let mut recorder = Recorder::default();
        decode_with(&sig, &body, DecoderOptions::default(), &mut recorder).unwrap();
        assert!(recorder.events.is_empty(), "{:?}", recorder.events);
    }

    #[test]
    fn invalid_branch_depth() {
        let err = decode_error(&[], &[], &[0x00, 0x0C, 0x01, 0x0B]);
        assert_eq!(err.kind, DecodeErrorKind::InvalidBranchDepth);
        assert_eq!(err.message, "invalid branch depth: 1");
    }

    #[test]
    fn branch_payload_must_match_target() {
        // block (result i32) i64.const 1 br 0 end drop
        let body = [0x00, 0x02, I32, 0x42, 0x01, 0x0C, 0x00, 0x0B, 0x1A, 0x0B];
        let err = decode_error(&[], &[], &body);
        assert_eq!(err.kind, DecodeErrorKind::TypeMismatch);
        assert_eq!(err.offset, 5);
    }

    #[test]
    fn fallthrough_arity_must_be_exact() {
        // block (result i32) end
        let err = decode_error(&[], &[], &[0x00, 0x02, I32, 0x0B, 0x1A, 0x0B]);
        assert_eq!(err.kind, DecodeErrorKind::ArityMismatch);

        // i32.const 1 i32.const 2 end, returning one value
        let body = [0x00, 0x41, 0x01, 0x41, 0x02, 0x0B];
        let err = decode_error(&[], &[ValueType::I32], &body);
        assert_eq!(err.kind, DecodeErrorKind::ArityMismatch);
    }

    #[test]
    fn structural_errors() {
        let err = decode_error(&[], &[], &[0x00, 0x05, 0x0B]);
        assert_eq!(err.message, "else does not match an if");

        let err = decode_error(&[], &[], &[0x00, 0x0B, 0x01]);
        assert_eq!(err.kind, DecodeErrorKind::InvalidControl);
        assert_eq!(err.offset, 2);

        let err = decode_error(&[], &[], &[0x00, 0x02, 0x40, 0x0B]);
        assert_eq!(err.kind, DecodeErrorKind::InvalidControl);
        assert_eq!(err.offset, 4);
    }

    #[test]
    fn one_armed_if_must_preserve_arity() {
        // i32.const 1 if (result i32) i32.const 2 end drop
        let body = [0x00, 0x41, 0x01, 0x04, I32, 0x41, 0x02, 0x0B, 0x1A, 0x0B];
        let err = decode_error(&[], &[], &body);
        assert_eq!(err.kind, DecodeErrorKind::ArityMismatch);
        assert_eq!(err.offset, 3);
    }

    #[test]
    fn if_else_with_result() {
        // local.get 0 if (result i32) i32.const 1 else i32.const 2 end
        let body = [0x00, 0x20, 0x00, 0x04, I32, 0x41, 0x01, 0x05, 0x41, 0x02, 0x0B, 0x0B];
        validate(&[ValueType::I32], &[ValueType::I32], &body).unwrap();
    }

    #[test]
    fn br_table_arity_must_agree() {
        // block (result i32) block local.get 0 br_table 0 1 1 end ...
        let body = [
            0x00, 0x02, I32, 0x02, 0x40, 0x20, 0x00, 0x0E, 0x02, 0x00, 0x01, 0x01, 0x0B, 0x41,
            0x00, 0x0B, 0x0B,
        ];
        let err = decode_error(&[ValueType::I32], &[ValueType::I32], &body);
        assert_eq!(err.kind, DecodeErrorKind::ArityMismatch);
        assert!(err.message.starts_with("inconsistent arity in br_table target 1"));
    }

    #[test]
    fn br_table_to_matching_targets() {
        // block block local.get 0 br_table 0 1 0 end end
        let body = [
            0x00, 0x02, 0x40, 0x02, 0x40, 0x20, 0x00, 0x0E, 0x02, 0x00, 0x01, 0x00, 0x0B, 0x0B,
            0x0B,
        ];
        validate(&[ValueType::I32], &[], &body).unwrap();
    }

    #[test]
    fn loop_branches_carry_parameters() {
        // type 1 is (i32, i32) -> i32, used as a block type for the loop.
        // i32.const 1 i32.const 2 loop (type 1) br 0 end
        let body = [0x00, 0x41, 0x01, 0x41, 0x02, 0x03, 0x01, 0x0C, 0x00, 0x0B, 0x0B];
        validate(&[], &[ValueType::I32], &body).unwrap();
    }

    #[test]
    fn untyped_select_rejects_references() {
        // ref.null func ref.null func i32.const 0 select drop
        let body = [0x00, 0xD0, 0x70, 0xD0, 0x70, 0x41, 0x00, 0x1B, 0x1A, 0x0B];
        let err = decode_error(&[], &[], &body);
        assert_eq!(err.kind, DecodeErrorKind::TypeMismatch);

        // Same with `select (result funcref)`.
        let body = [0x00, 0xD0, 0x70, 0xD0, 0x70, 0x41, 0x00, 0x1C, 0x01, 0x70, 0x1A, 0x0B];
        validate(&[], &[], &body).unwrap();
    }

    #[test]
    fn too_many_locals() {
        // 50001 locals of type i32
        let body = [0x01, 0xD1, 0x86, 0x03, I32, 0x0B];
        let err = decode_error(&[], &[], &body);
        assert_eq!(err.kind, DecodeErrorKind::TooManyLocals);
        assert_eq!(err.offset, 1);
    }

    #[test]
    fn disabled_feature_is_invalid_opcode() {
        // v128.const with SIMD disabled
        let mut body = vec![0x00, 0xFD, 0x0C];
        body.extend_from_slice(&[0; 16]);
        body.extend_from_slice(&[0x1A, 0x0B]);
        let err = decode_error(&[], &[], &body);
        assert_eq!(err.kind, DecodeErrorKind::InvalidOpcode);
        assert_eq!(err.offset, 1);

        let sig = FunctionSig::new(&[], &[]);
        let options = DecoderOptions::default().with_features(Features::default() | Features::SIMD);
        decode_with(&sig, &body, options, &mut ValidateOnly).unwrap();
    }

    #[test]
    fn over_alignment_is_rejected() {
        // i32.const 0 i32.load align=3 offset=0 drop
        let body = [0x00, 0x41, 0x00, 0x28, 0x03, 0x00, 0x1A, 0x0B];
        let err = decode_error(&[], &[], &body);
        assert_eq!(err.kind, DecodeErrorKind::InvalidImmediate);
        assert_eq!(err.offset, 4);
    }

    #[test]
    fn call_checks_arguments() {
        // i32.const 1 call 1 (needs two i32s)
        let body = [0x00, 0x41, 0x01, 0x10, 0x01, 0x1A, 0x0B];
        let err = decode_error(&[], &[], &body);
        assert_eq!(err.kind, DecodeErrorKind::StackUnderflow);

        let err = decode_error(&[], &[], &[0x00, 0x10, 0x07, 0x0B]);
        assert_eq!(err.kind, DecodeErrorKind::InvalidIndex);
    }

    #[test]
    fn immutable_global_cannot_be_set() {
        let body = [0x00, 0x41, 0x01, 0x24, 0x00, 0x0B];
        let err = decode_error(&[], &[], &body);
        assert_eq!(err.message, "immutable global #0 cannot be assigned");
    }

    #[test]
    fn trusted_mode_skips_type_checks_only() {
        let sig = FunctionSig::new(&[], &[]);
        let options = DecoderOptions::default().with_validation(ValidationMode::Trusted);

        // i64.const 0 i32.eqz drop: ill-typed, accepted without checking
        let body = [0x00, 0x42, 0x00, 0x45, 0x1A, 0x0B];
        decode_with(&sig, &body, options, &mut ValidateOnly).unwrap();

        // A missing end is still structural.
        let body = [0x00, 0x01];
        let err = decode_with(&sig, &body, options, &mut ValidateOnly).unwrap_err();
        assert_eq!(
            err.as_decode_error().map(|e| e.kind),
            Some(DecodeErrorKind::InvalidControl)
        );
    }

    #[test]
    fn truncated_immediate() {
        let err = decode_error(&[], &[], &[0x00, 0x41]);
        assert_eq!(err.kind, DecodeErrorKind::UnexpectedEof);
        assert_eq!(err.offset, 2);
    }

    #[test]
    fn dynamically_unreachable_code_fires_no_callbacks() {
        struct StopAfterFirstConst(u32);

        impl Backend for StopAfterFirstConst {
            fn i32_const(
                &mut self,
                ctx: &mut DecodeContext<'_>,
                _: Value,
                _: i32,
            ) -> BackendResult {
                self.0 += 1;
                ctx.set_succeeding_code_dynamically_unreachable();
                Ok(())
            }
        }

        // block i32.const 1 drop i32.const 2 drop end i32.const 3 drop end
        let body = [
            0x00, 0x02, 0x40, 0x41, 0x01, 0x1A, 0x41, 0x02, 0x1A, 0x0B, 0x41, 0x03, 0x1A, 0x0B,
        ];
        let sig = FunctionSig::new(&[], &[]);
        let mut backend = StopAfterFirstConst(0);
        decode_with(&sig, &body, DecoderOptions::default(), &mut backend).unwrap();
        assert_eq!(backend.0, 1);
    }
}
