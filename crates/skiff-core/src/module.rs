//! Read-only module metadata consumed while compiling a function body.
//!
//! The outer container format is not parsed here. Embedders describe the
//! module through [`ModuleBuilder`] and hand the resulting
//! [`ModuleMetadata`] to any number of compilations, on any number of
//! threads.

use rustc_hash::FxHashMap;

use crate::error::ModuleError;
use crate::signature::FunctionSig;
use crate::types::ValueType;

/// Bytes per linear-memory page.
pub const PAGE_SIZE: u64 = 65536;

/// Largest memory, in pages, the engine will ever allocate.
pub const MAX_MEMORY_PAGES: u32 = 65536;

/// Largest table the engine will ever allocate.
pub const MAX_TABLE_SIZE: u32 = 10_000_000;

/// Size of one slot in the instance's globals area.
const GLOBAL_SLOT_SIZE: u32 = 8;

/// A global variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalDesc {
    pub ty: ValueType,
    pub mutable: bool,
    pub imported: bool,
    /// For imported mutable globals, the index into the instance's imported
    /// global pointer table. Otherwise the byte offset within the globals
    /// area.
    pub offset: u32,
}

impl GlobalDesc {
    /// Accesses must go through the imported-global pointer table.
    #[inline]
    pub fn is_indirect(&self) -> bool {
        self.imported && self.mutable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDesc {
    pub min_pages: u32,
    pub max_pages: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDesc {
    pub elem_type: ValueType,
    pub min: u32,
    pub max: Option<u32>,
}

/// Everything a function body may reference by index.
#[derive(Debug, Clone, Default)]
pub struct ModuleMetadata {
    types: Vec<FunctionSig>,
    canonical_sig_ids: Vec<u32>,
    functions: Vec<u32>,
    num_imported_functions: u32,
    num_imported_mutable_globals: u32,
    globals: Vec<GlobalDesc>,
    globals_size: u32,
    memory: Option<MemoryDesc>,
    tables: Vec<TableDesc>,
    tags: Vec<u32>,
    elem_segments: Vec<ValueType>,
    data_count: Option<u32>,
}

impl ModuleMetadata {
    pub fn builder() -> ModuleBuilder {
        ModuleBuilder::default()
    }

    #[inline]
    pub fn signature(&self, type_index: u32) -> Option<&FunctionSig> {
        self.types.get(type_index as usize)
    }

    pub fn num_types(&self) -> u32 {
        self.types.len() as u32
    }

    /// The id shared by every structurally identical signature. Indirect
    /// calls compare these ids instead of type indices.
    #[inline]
    pub fn canonical_sig_id(&self, type_index: u32) -> Option<u32> {
        self.canonical_sig_ids.get(type_index as usize).copied()
    }

    pub fn num_functions(&self) -> u32 {
        self.functions.len() as u32
    }

    pub fn num_imported_functions(&self) -> u32 {
        self.num_imported_functions
    }

    #[inline]
    pub fn function_type_index(&self, func_index: u32) -> Option<u32> {
        self.functions.get(func_index as usize).copied()
    }

    pub fn function_sig(&self, func_index: u32) -> Option<&FunctionSig> {
        self.function_type_index(func_index)
            .and_then(|ty| self.signature(ty))
    }

    #[inline]
    pub fn is_imported_function(&self, func_index: u32) -> bool {
        func_index < self.num_imported_functions
    }

    #[inline]
    pub fn global(&self, index: u32) -> Option<&GlobalDesc> {
        self.globals.get(index as usize)
    }

    pub fn num_globals(&self) -> u32 {
        self.globals.len() as u32
    }

    pub fn num_imported_mutable_globals(&self) -> u32 {
        self.num_imported_mutable_globals
    }

    /// Size in bytes of the instance's globals area.
    pub fn globals_size(&self) -> u32 {
        self.globals_size
    }

    pub fn memory(&self) -> Option<&MemoryDesc> {
        self.memory.as_ref()
    }

    pub fn has_memory(&self) -> bool {
        self.memory.is_some()
    }

    /// The memory size every instance is guaranteed to start with.
    pub fn min_memory_size(&self) -> u64 {
        self.memory
            .map_or(0, |m| u64::from(m.min_pages) * PAGE_SIZE)
    }

    /// The largest size the memory can ever grow to.
    pub fn max_memory_size(&self) -> u64 {
        self.memory.map_or(0, |m| {
            u64::from(m.max_pages.unwrap_or(MAX_MEMORY_PAGES).min(MAX_MEMORY_PAGES)) * PAGE_SIZE
        })
    }

    #[inline]
    pub fn table(&self, index: u32) -> Option<&TableDesc> {
        self.tables.get(index as usize)
    }

    pub fn num_tables(&self) -> u32 {
        self.tables.len() as u32
    }

    /// Signature of an exception tag.
    pub fn tag_sig(&self, tag_index: u32) -> Option<&FunctionSig> {
        self.tags
            .get(tag_index as usize)
            .and_then(|&ty| self.signature(ty))
    }

    pub fn elem_segment_type(&self, index: u32) -> Option<ValueType> {
        self.elem_segments.get(index as usize).copied()
    }

    pub fn num_elem_segments(&self) -> u32 {
        self.elem_segments.len() as u32
    }

    /// Declared number of data segments, if the module has a data count.
    pub fn data_count(&self) -> Option<u32> {
        self.data_count
    }
}

/// Incrementally assembles a [`ModuleMetadata`].
///
/// Imports must be declared before definitions of the same kind, as in the
/// binary format.
///
/// ```rust
/// use skiff_core::{FunctionSig, ModuleBuilder, ValueType};
///
/// let mut builder = ModuleBuilder::default();
/// let sig = builder.add_type(FunctionSig::new(&[ValueType::I32], &[ValueType::I32]));
/// builder.add_function(sig).unwrap();
/// builder.set_memory(1, Some(2)).unwrap();
/// let module = builder.build();
/// assert_eq!(module.num_functions(), 1);
/// ```
#[derive(Debug, Default)]
pub struct ModuleBuilder {
    module: ModuleMetadata,
    canonical: FxHashMap<FunctionSig, u32>,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a type-section entry and return its index.
    pub fn add_type(&mut self, sig: FunctionSig) -> u32 {
        let index = self.module.types.len() as u32;
        let canonical = *self.canonical.entry(sig.clone()).or_insert(index);
        self.module.canonical_sig_ids.push(canonical);
        self.module.types.push(sig);
        index
    }

    pub fn import_function(&mut self, type_index: u32) -> Result<u32, ModuleError> {
        self.check_type(type_index)?;
        if self.module.functions.len() as u32 != self.module.num_imported_functions {
            return Err(ModuleError::ImportAfterDefinition);
        }
        self.module.num_imported_functions += 1;
        Ok(self.push_function(type_index))
    }

    pub fn add_function(&mut self, type_index: u32) -> Result<u32, ModuleError> {
        self.check_type(type_index)?;
        Ok(self.push_function(type_index))
    }

    pub fn import_global(&mut self, ty: ValueType, mutable: bool) -> Result<u32, ModuleError> {
        if self.module.globals.iter().any(|g| !g.imported) {
            return Err(ModuleError::ImportAfterDefinition);
        }
        let offset = if mutable {
            let index = self.module.num_imported_mutable_globals;
            self.module.num_imported_mutable_globals += 1;
            index
        } else {
            self.allocate_global_slot(ty)
        };
        Ok(self.push_global(GlobalDesc {
            ty,
            mutable,
            imported: true,
            offset,
        }))
    }

    pub fn add_global(&mut self, ty: ValueType, mutable: bool) -> u32 {
        let offset = self.allocate_global_slot(ty);
        self.push_global(GlobalDesc {
            ty,
            mutable,
            imported: false,
            offset,
        })
    }

    pub fn set_memory(
        &mut self,
        min_pages: u32,
        max_pages: Option<u32>,
    ) -> Result<(), ModuleError> {
        if self.module.memory.is_some() {
            return Err(ModuleError::MultipleMemories);
        }
        check_limits(min_pages, max_pages, MAX_MEMORY_PAGES)?;
        self.module.memory = Some(MemoryDesc {
            min_pages,
            max_pages,
        });
        Ok(())
    }

    pub fn add_table(
        &mut self,
        elem_type: ValueType,
        min: u32,
        max: Option<u32>,
    ) -> Result<u32, ModuleError> {
        if !elem_type.is_reference() {
            return Err(ModuleError::InvalidTableElement(elem_type));
        }
        check_limits(min, max, MAX_TABLE_SIZE)?;
        self.module.tables.push(TableDesc {
            elem_type,
            min,
            max,
        });
        Ok(self.module.tables.len() as u32 - 1)
    }

    pub fn add_tag(&mut self, type_index: u32) -> Result<u32, ModuleError> {
        self.check_type(type_index)?;
        self.module.tags.push(type_index);
        Ok(self.module.tags.len() as u32 - 1)
    }

    pub fn add_elem_segment(&mut self, elem_type: ValueType) -> Result<u32, ModuleError> {
        if !elem_type.is_reference() {
            return Err(ModuleError::InvalidTableElement(elem_type));
        }
        self.module.elem_segments.push(elem_type);
        Ok(self.module.elem_segments.len() as u32 - 1)
    }

    pub fn set_data_count(&mut self, count: u32) {
        self.module.data_count = Some(count);
    }

    pub fn build(self) -> ModuleMetadata {
        self.module
    }

    fn check_type(&self, type_index: u32) -> Result<(), ModuleError> {
        if (type_index as usize) < self.module.types.len() {
            Ok(())
        } else {
            Err(ModuleError::UnknownType(type_index))
        }
    }

    fn push_function(&mut self, type_index: u32) -> u32 {
        self.module.functions.push(type_index);
        self.module.functions.len() as u32 - 1
    }

    fn push_global(&mut self, desc: GlobalDesc) -> u32 {
        self.module.globals.push(desc);
        self.module.globals.len() as u32 - 1
    }

    fn allocate_global_slot(&mut self, ty: ValueType) -> u32 {
        let size = ty.size_bytes().max(GLOBAL_SLOT_SIZE);
        let offset = self.module.globals_size.next_multiple_of(size);
        self.module.globals_size = offset + size;
        offset
    }
}

fn check_limits(min: u32, max: Option<u32>, limit: u32) -> Result<(), ModuleError> {
    if min > limit {
        return Err(ModuleError::LimitTooLarge { value: min, limit });
    }
    if let Some(max) = max {
        if min > max {
            return Err(ModuleError::InvalidLimits { min, max });
        }
    }
    Ok(())
}
