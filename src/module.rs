use std::collections::HashMap;
use std::ops::Range;
use std::sync::Mutex;

use nohash_hasher::{IntMap, IntSet};
use serde::{Deserialize, Serialize};

use crate::byte_iter::*;
use crate::error::*;
use crate::leb128::*;
use crate::types::*;
use crate::validator::Validator;

// ---------------- Import/Export related ----------------
#[derive(Clone, Debug)]
pub struct ImportRef { pub module: String, pub field: String }

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExternKind {
    Func = 0,
    Table = 1,
    Mem = 2,
    Global = 3,
}

impl ExternKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ExternKind::Func),
            1 => Some(ExternKind::Table),
            2 => Some(ExternKind::Mem),
            3 => Some(ExternKind::Global),
            _ => None,
        }
    }
}

// ---------------- Structures ----------------

/// Read-only function descriptor. Identity is the index within the module.
#[derive(Clone, Debug)]
pub struct Function {
    pub index: u32,
    pub name: String,
    /// First instruction .. one past the final `end`.
    pub body: Range<usize>,
    pub type_idx: u32,
    pub ty: FuncType,
    /// Params followed by declared locals.
    pub locals: Vec<ValType>,
    /// Cell offset of every entry of `locals` inside the frame window.
    pub local_offsets: Vec<u32>,
    pub param_cell_num: u32,
    pub local_cell_num: u32,
    pub ret_cell_num: u32,
    pub max_stack_cell_num: u32,
    pub max_block_num: u32,
    pub import: Option<ImportRef>,
}

impl Function {
    #[inline]
    pub fn is_import(&self) -> bool { self.import.is_some() }
    #[inline]
    pub fn code_start(&self) -> usize { self.body.start }
    /// Position of the closing `end` opcode.
    #[inline]
    pub fn code_end(&self) -> usize { self.body.end - 1 }
    /// Cells of `[params | locals | operand stack]`.
    #[inline]
    pub fn frame_cell_num(&self) -> u32 {
        self.param_cell_num + self.local_cell_num + self.max_stack_cell_num
    }
}

#[derive(Clone, Debug)]
pub struct Table {
    pub min: u32,
    pub max: u32,
    pub import: Option<ImportRef>,
}

#[derive(Clone, Debug)]
pub struct Memory {
    pub min: u32,
    pub max: u32,
    pub shared: bool,
    pub import: Option<ImportRef>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConstExpr {
    I32(i32),
    I64(i64),
    F32(u32),
    F64(u64),
    GlobalGet(u32),
}

#[derive(Clone, Debug)]
pub struct Global {
    pub ty: ValType,
    pub is_mutable: bool,
    pub init: Option<ConstExpr>,
    /// Byte offset inside the instance's global storage.
    pub data_offset: usize,
    pub import: Option<ImportRef>,
}

#[derive(Clone, Copy, Debug)]
pub struct Export { pub kind: ExternKind, pub idx: u32 }

#[derive(Clone, Debug)]
pub struct ElemSegment { pub offset: ConstExpr, pub funcs: Vec<u32> }

#[derive(Clone, Debug)]
pub struct DataSegment { pub data_range: Range<usize>, pub offset: Option<ConstExpr> }

/// Jump targets of one `block`/`loop`/`if`, keyed by the opcode position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockAddr {
    pub else_addr: Option<usize>,
    /// Position of the matching `end` opcode.
    pub end_addr: usize,
}

#[derive(Clone, Debug, Default)]
pub struct SideTable {
    pub blocks: IntMap<usize, BlockAddr>,
    /// Positions of `drop`/`select` whose operand is a two-cell value.
    pub wide: IntSet<usize>,
}

impl SideTable {
    #[inline]
    pub fn find_block_addr(&self, op_pos: usize) -> Result<BlockAddr, Error> {
        self.blocks.get(&op_pos).copied().ok_or(Error::Malformed(END_EXPECTED))
    }

    #[inline]
    pub fn is_wide(&self, op_pos: usize) -> bool { self.wide.contains(&op_pos) }
}

/// Auxiliary stack/heap bookkeeping derived from the module header.
/// `u32::MAX` marks an absent value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxLayout {
    pub data_end_global_index: u32,
    pub data_end: u32,
    pub heap_base_global_index: u32,
    pub heap_base: u32,
    pub stack_top_global_index: u32,
    pub stack_bottom: u32,
    pub stack_size: u32,
}

impl Default for AuxLayout {
    fn default() -> Self {
        Self {
            data_end_global_index: u32::MAX,
            data_end: u32::MAX,
            heap_base_global_index: u32::MAX,
            heap_base: u32::MAX,
            stack_top_global_index: u32::MAX,
            stack_bottom: u32::MAX,
            stack_size: u32::MAX,
        }
    }
}

// ---------------- Module Structure ----------------
pub struct Module {
    pub bytes: Vec<u8>,
    pub types: Vec<FuncType>,
    pub table: Option<Table>,
    pub memory: Option<Memory>,
    pub globals: Vec<Global>,
    pub global_data_size: usize,
    pub exports: HashMap<String, Export>,
    pub start: Option<u32>,
    pub elements: Vec<ElemSegment>,
    pub functions: Vec<Function>,
    pub data_count: Option<u32>,
    pub data_segments: Vec<DataSegment>,
    pub side_table: SideTable,
    /// Written back on restore, so it is process-wide mutable state.
    pub aux: Mutex<AuxLayout>,
    func_names: IntMap<u32, String>,
}

macro_rules! assert_not_empty {
    ($it:expr) => { if $it.empty() { return Err(Error::Malformed(UNEXPECTED_END)); } };
}

impl Module {
    pub const MAX_PAGES: u32 = 65536;
    pub const MAX_LOCALS: usize = 50000;
    const MAGIC: &'static [u8; 4] = b"\0asm";

    pub fn compile(bytes: Vec<u8>) -> Result<Self, Error> {
        let mut m = Module {
            bytes,
            types: Vec::new(),
            table: None,
            memory: None,
            globals: Vec::new(),
            global_data_size: 0,
            exports: HashMap::new(),
            start: None,
            elements: Vec::new(),
            functions: Vec::new(),
            data_count: None,
            data_segments: Vec::new(),
            side_table: SideTable::default(),
            aux: Mutex::new(AuxLayout::default()),
            func_names: IntMap::default(),
        };
        m.initialize()?;
        m.assign_names();
        m.validate_bodies()?;
        let aux = m.derive_aux_layout();
        *m.aux.get_mut().unwrap_or_else(|e| e.into_inner()) = aux;
        tracing::debug!(
            functions = m.functions.len(),
            globals = m.globals.len(),
            has_memory = m.memory.is_some(),
            "module compiled"
        );
        Ok(m)
    }

    fn initialize(&mut self) -> Result<(), Error> {
        let bytes = std::mem::take(&mut self.bytes);
        let res = self.parse_sections(&bytes);
        self.bytes = bytes;
        res
    }

    fn parse_sections(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if bytes.len() < 4 { return Err(Error::Malformed(UNEXPECTED_END)); }
        if &bytes[0..4] != Self::MAGIC {
            return Err(Error::Malformed(NO_MAGIC_HEADER));
        }
        if bytes.len() < 8 { return Err(Error::Malformed(UNEXPECTED_END)); }
        if bytes[4..8] != [1, 0, 0, 0] {
            return Err(Error::Malformed(UNKNOWN_BINARY_VERSION));
        }

        let mut it = ByteIter::new(bytes, 8);
        let mut last_rank = 0u8;
        while !it.empty() {
            let id = it.read_u8()?;
            let section_length = it.read_u32()? as usize;
            let section_start = it.cur();
            if !it.has_n_left(section_length) {
                return Err(Error::Malformed(UNEXPECTED_END));
            }
            let mut sub = ByteIter::new(&bytes[..section_start + section_length], section_start);

            if id == 0 {
                self.parse_custom_section(&mut sub)?;
                it.advance(section_length);
                continue;
            }
            let rank = section_rank(id).ok_or(Error::Malformed(INVALID_SECTION_ID))?;
            if rank <= last_rank {
                return Err(Error::Malformed(JUNK_AFTER_LAST));
            }
            last_rank = rank;

            match id {
                1 => self.parse_type_section(&mut sub)?,
                2 => self.parse_import_section(&mut sub)?,
                3 => self.parse_function_section(&mut sub)?,
                4 => self.parse_table_section(&mut sub)?,
                5 => self.parse_memory_section(&mut sub)?,
                6 => self.parse_global_section(&mut sub)?,
                7 => self.parse_export_section(&mut sub)?,
                8 => self.parse_start_section(&mut sub)?,
                9 => self.parse_element_section(&mut sub)?,
                10 => self.parse_code_section(&mut sub)?,
                11 => self.parse_data_section(&mut sub)?,
                12 => self.data_count = Some(sub.read_u32()?),
                _ => return Err(Error::Malformed(INVALID_SECTION_ID)),
            }
            if sub.cur() != section_start + section_length {
                return Err(Error::Malformed(SECTION_SIZE_MISMATCH));
            }
            it.advance(section_length);
        }

        let n_bodies = self.functions.iter().filter(|f| !f.is_import() && !f.body.is_empty()).count();
        let n_defined = self.functions.iter().filter(|f| !f.is_import()).count();
        if n_bodies != n_defined {
            return Err(Error::Malformed(FUNC_CODE_INCONSISTENT));
        }
        if let Some(n) = self.data_count {
            if n as usize != self.data_segments.len() {
                return Err(Error::Malformed(DATA_COUNT_MISMATCH));
            }
        }
        Ok(())
    }

    fn parse_custom_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let name = it.read_name()?;
        if name == "name" {
            // A broken name section only costs us the names.
            if let Err(e) = self.parse_name_section(it) {
                tracing::debug!(error = %e, "ignoring malformed name section");
            }
        }
        Ok(())
    }

    fn parse_name_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        while !it.empty() {
            let sub_id = it.read_u8()?;
            let sub_len = it.read_u32()? as usize;
            let sub_end = it.cur() + sub_len;
            if sub_id == 1 {
                let n_names = it.read_u32()?;
                for _ in 0..n_names {
                    let idx = it.read_u32()?;
                    let name = it.read_name()?;
                    self.func_names.insert(idx, name);
                }
            }
            it.idx = sub_end;
        }
        Ok(())
    }

    fn parse_type_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_types = it.read_u32()?;
        self.types.reserve_exact(n_types as usize);

        for _ in 0..n_types {
            assert_not_empty!(it);
            if it.read_u8()? != 0x60 {
                return Err(Error::Malformed(INT_TOO_LONG));
            }
            let params = read_val_types(it)?;
            let results = read_val_types(it)?;
            self.types.push(FuncType { params, results });
        }
        Ok(())
    }

    fn parse_import_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_imports = it.read_u32()?;

        for _ in 0..n_imports {
            assert_not_empty!(it);
            let module = it.read_name()?;
            let field = it.read_name()?;
            let kind = ExternKind::from_byte(it.read_u8()?)
                .ok_or(Error::Malformed(MALFORMED_IMPORT_KIND))?;
            let import = Some(ImportRef { module, field });

            match kind {
                ExternKind::Func => {
                    let type_idx = it.read_u32()?;
                    self.push_function(type_idx, import)?;
                }
                ExternKind::Table => {
                    if self.table.is_some() {
                        return Err(Error::Validation(MULTIPLE_TABLES));
                    }
                    if it.read_u8()? != 0x70 {
                        return Err(Error::Malformed(MALFORMED_REF_TYPE));
                    }
                    let (min, max, _) = get_limits(it, u32::MAX)?;
                    self.table = Some(Table { min, max, import });
                }
                ExternKind::Mem => {
                    if self.memory.is_some() {
                        return Err(Error::Validation(MULTIPLE_MEMORIES));
                    }
                    let (min, max, shared) = get_memory_limits(it)?;
                    self.memory = Some(Memory { min, max, shared, import });
                }
                ExternKind::Global => {
                    let ty = ValType::from_byte(it.read_u8()?)
                        .ok_or(Error::Malformed(INVALID_GLOBAL_TYPE))?;
                    let is_mutable = read_mutability(it)?;
                    self.push_global(ty, is_mutable, None, import);
                }
            }
        }
        Ok(())
    }

    fn parse_function_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_functions = it.read_u32()?;
        self.functions.reserve(n_functions as usize);
        for _ in 0..n_functions {
            assert_not_empty!(it);
            let type_idx = it.read_u32()?;
            self.push_function(type_idx, None)?;
        }
        Ok(())
    }

    fn parse_table_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_tables = it.read_u32()?;
        if n_tables > 1 || (n_tables == 1 && self.table.is_some()) {
            return Err(Error::Validation(MULTIPLE_TABLES));
        }
        if n_tables == 1 {
            assert_not_empty!(it);
            if it.read_u8()? != 0x70 {
                return Err(Error::Validation(INVALID_ELEM_TYPE));
            }
            let (min, max, _) = get_limits(it, u32::MAX)?;
            self.table = Some(Table { min, max, import: None });
        }
        Ok(())
    }

    fn parse_memory_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_memories = it.read_u32()?;
        if n_memories > 1 || (n_memories == 1 && self.memory.is_some()) {
            return Err(Error::Validation(MULTIPLE_MEMORIES));
        }
        if n_memories == 1 {
            assert_not_empty!(it);
            let (min, max, shared) = get_memory_limits(it)?;
            self.memory = Some(Memory { min, max, shared, import: None });
        }
        Ok(())
    }

    fn parse_global_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_globals = it.read_u32()?;
        for _ in 0..n_globals {
            assert_not_empty!(it);
            let ty = ValType::from_byte(it.read_u8()?)
                .ok_or(Error::Malformed(INVALID_GLOBAL_TYPE))?;
            let is_mutable = read_mutability(it)?;
            let init = self.read_const_expr(it, ty)?;
            self.push_global(ty, is_mutable, Some(init), None);
        }
        Ok(())
    }

    fn parse_export_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_exports = it.read_u32()?;
        for _ in 0..n_exports {
            assert_not_empty!(it);
            let name = it.read_name()?;
            let kind = ExternKind::from_byte(it.read_u8()?)
                .ok_or(Error::Validation(INVALID_EXPORT_DESC))?;
            let idx = it.read_u32()?;

            if self.exports.contains_key(&name) {
                return Err(Error::Validation(DUP_EXPORT_NAME));
            }
            match kind {
                ExternKind::Func if idx as usize >= self.functions.len() => {
                    return Err(Error::Validation(UNKNOWN_FUNC));
                }
                ExternKind::Table if idx != 0 || self.table.is_none() => {
                    return Err(Error::Validation(UNKNOWN_TABLE));
                }
                ExternKind::Mem if idx != 0 || self.memory.is_none() => {
                    return Err(Error::Validation(UNKNOWN_MEMORY));
                }
                ExternKind::Global if idx as usize >= self.globals.len() => {
                    return Err(Error::Validation(UNKNOWN_GLOBAL));
                }
                _ => {}
            }
            self.exports.insert(name, Export { kind, idx });
        }
        Ok(())
    }

    fn parse_start_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let start = it.read_u32()?;
        if start as usize >= self.functions.len() {
            return Err(Error::Validation(UNKNOWN_FUNC));
        }
        let ty = &self.functions[start as usize].ty;
        if !ty.params.is_empty() || !ty.results.is_empty() {
            return Err(Error::Validation(START_FUNC));
        }
        self.start = Some(start);
        Ok(())
    }

    fn parse_element_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_segments = it.read_u32()?;
        for _ in 0..n_segments {
            assert_not_empty!(it);
            // Only active segments on table 0 with function indices.
            if it.read_u32()? != 0 {
                return Err(Error::Validation(INVALID_ELEM_TYPE));
            }
            if self.table.is_none() {
                return Err(Error::Validation(UNKNOWN_TABLE));
            }
            let offset = self.read_const_expr(it, ValType::I32)?;
            let n = it.read_u32()?;
            let mut funcs = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let idx = it.read_u32()?;
                if idx as usize >= self.functions.len() {
                    return Err(Error::Validation(UNKNOWN_FUNC));
                }
                funcs.push(idx);
            }
            self.elements.push(ElemSegment { offset, funcs });
        }
        Ok(())
    }

    fn parse_code_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_bodies = it.read_u32()?;
        let defined: Vec<usize> = (0..self.functions.len())
            .filter(|&i| !self.functions[i].is_import())
            .collect();
        if n_bodies as usize != defined.len() {
            return Err(Error::Malformed(FUNC_CODE_INCONSISTENT));
        }

        for i in defined {
            let function_length = it.read_u32()? as usize;
            let func_start = it.cur();
            if !it.has_n_left(function_length) {
                return Err(Error::Malformed(UNEXPECTED_END));
            }

            let mut locals = self.functions[i].ty.params.clone();
            let mut n_local_decls = it.read_u32()?;
            let mut total: u64 = 0;
            while n_local_decls > 0 {
                n_local_decls -= 1;
                let n_locals = it.read_u32()?;
                total += n_locals as u64;
                if total > Module::MAX_LOCALS as u64 {
                    return Err(Error::Malformed(TOO_MANY_LOCALS));
                }
                let ty = ValType::from_byte(it.read_u8()?)
                    .ok_or(Error::Malformed(INVALID_VALUE_TYPE))?;
                locals.extend(std::iter::repeat(ty).take(n_locals as usize));
            }

            let body_start = it.cur();
            let body_end = func_start + function_length;
            if body_start >= body_end {
                return Err(Error::Malformed(UNEXPECTED_END));
            }

            let mut offsets = Vec::with_capacity(locals.len());
            let mut cell = 0u32;
            for ty in &locals {
                offsets.push(cell);
                cell += ty.cell_num();
            }

            let function = &mut self.functions[i];
            function.local_cell_num = cell - function.param_cell_num;
            function.locals = locals;
            function.local_offsets = offsets;
            function.body = body_start..body_end;
            it.idx = body_end;
        }
        Ok(())
    }

    fn parse_data_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_data_segments = it.read_u32()?;
        for _ in 0..n_data_segments {
            assert_not_empty!(it);
            let offset = match it.read_u32()? {
                0 => Some(self.read_data_offset(it)?),
                1 => None,
                2 => {
                    if it.read_u32()? != 0 {
                        return Err(Error::Validation(UNKNOWN_MEMORY));
                    }
                    Some(self.read_data_offset(it)?)
                }
                _ => return Err(Error::Validation(INVALID_DATA_SEG_FLAG)),
            };
            let data_length = it.read_u32()? as usize;
            let data = it.read_bytes(data_length)?;
            let start = it.cur() - data.len();
            self.data_segments.push(DataSegment { data_range: start..it.cur(), offset });
        }
        Ok(())
    }

    fn read_data_offset(&self, it: &mut ByteIter) -> Result<ConstExpr, Error> {
        if self.memory.is_none() {
            return Err(Error::Validation(UNKNOWN_MEMORY));
        }
        self.read_const_expr(it, ValType::I32)
    }

    fn read_const_expr(&self, it: &mut ByteIter, expected: ValType) -> Result<ConstExpr, Error> {
        let op = it.read_u8()?;
        let (expr, ty) = match op {
            0x41 => (ConstExpr::I32(safe_read_sleb128(it.bytes, &mut it.idx, 32)?), ValType::I32),
            0x42 => (ConstExpr::I64(safe_read_sleb128(it.bytes, &mut it.idx, 64)?), ValType::I64),
            0x43 => {
                let raw = it.read_bytes(4)?;
                (ConstExpr::F32(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])), ValType::F32)
            }
            0x44 => {
                let raw = it.read_bytes(8)?;
                let mut b = [0u8; 8];
                b.copy_from_slice(raw);
                (ConstExpr::F64(u64::from_le_bytes(b)), ValType::F64)
            }
            0x23 => {
                let idx = it.read_u32()?;
                let g = self.globals.get(idx as usize).ok_or(Error::Validation(UNKNOWN_GLOBAL))?;
                if g.is_mutable {
                    return Err(Error::Validation(CONST_EXP_REQUIRED));
                }
                (ConstExpr::GlobalGet(idx), g.ty)
            }
            _ => return Err(Error::Validation(CONST_EXP_REQUIRED)),
        };
        if it.read_u8()? != 0x0b {
            return Err(Error::Validation(CONST_EXP_REQUIRED));
        }
        if ty != expected {
            return Err(Error::Validation(TYPE_MISMATCH));
        }
        Ok(expr)
    }

    fn push_function(&mut self, type_idx: u32, import: Option<ImportRef>) -> Result<(), Error> {
        let ty = self.types.get(type_idx as usize).ok_or(Error::Validation(UNKNOWN_TYPE))?.clone();
        let index = self.functions.len() as u32;
        self.functions.push(Function {
            index,
            name: String::new(),
            body: 0..0,
            type_idx,
            param_cell_num: ty.param_cell_num(),
            ret_cell_num: ty.ret_cell_num(),
            local_cell_num: 0,
            locals: ty.params.clone(),
            local_offsets: Vec::new(),
            ty,
            max_stack_cell_num: 0,
            max_block_num: 0,
            import,
        });
        Ok(())
    }

    fn push_global(&mut self, ty: ValType, is_mutable: bool, init: Option<ConstExpr>, import: Option<ImportRef>) {
        let data_offset = self.global_data_size;
        self.global_data_size += ty.cell_num() as usize * 4;
        self.globals.push(Global { ty, is_mutable, init, data_offset, import });
    }

    fn assign_names(&mut self) {
        let mut export_names: IntMap<u32, &str> = IntMap::default();
        for (name, ex) in &self.exports {
            if ex.kind == ExternKind::Func {
                // Several exports may alias one function, keep the smallest name.
                let slot = export_names.entry(ex.idx).or_insert(name.as_str());
                if name.as_str() < *slot { *slot = name.as_str(); }
            }
        }
        let names: Vec<String> = self.functions.iter().map(|f| {
            export_names.get(&f.index).map(|s| s.to_string())
                .or_else(|| self.func_names.get(&f.index).cloned())
                .unwrap_or_else(|| format!("$func{}", f.index))
        }).collect();
        for (f, name) in self.functions.iter_mut().zip(names) {
            f.name = name;
        }
    }

    fn validate_bodies(&mut self) -> Result<(), Error> {
        for i in 0..self.functions.len() {
            if self.functions[i].is_import() { continue; }
            let info = Validator::new(self).validate_function(i)?;
            let f = &mut self.functions[i];
            f.max_stack_cell_num = info.max_stack_cell_num;
            f.max_block_num = info.max_block_num;
            self.side_table.blocks.extend(info.blocks);
            self.side_table.wide.extend(info.wide);
        }
        Ok(())
    }

    fn const_u32(&self, expr: Option<ConstExpr>) -> Option<u32> {
        match expr? {
            ConstExpr::I32(v) => Some(v as u32),
            ConstExpr::GlobalGet(idx) => self.const_u32(self.globals.get(idx as usize)?.init),
            _ => None,
        }
    }

    fn derive_aux_layout(&self) -> AuxLayout {
        let mut aux = AuxLayout::default();
        let exported_global = |name: &str| {
            self.exports.get(name)
                .filter(|ex| ex.kind == ExternKind::Global)
                .and_then(|ex| Some((ex.idx, self.const_u32(self.globals.get(ex.idx as usize)?.init)?)))
        };
        if let Some((idx, v)) = exported_global("__data_end") {
            aux.data_end_global_index = idx;
            aux.data_end = v;
        }
        if let Some((idx, v)) = exported_global("__heap_base") {
            aux.heap_base_global_index = idx;
            aux.heap_base = v;
        }
        let stack_top = self.globals.iter().enumerate()
            .find(|(_, g)| g.import.is_none() && g.is_mutable && g.ty == ValType::I32);
        if let Some((idx, g)) = stack_top {
            if let Some(bottom) = self.const_u32(g.init) {
                aux.stack_top_global_index = idx as u32;
                aux.stack_bottom = bottom;
                aux.stack_size = if aux.data_end != u32::MAX && bottom > aux.data_end {
                    bottom - aux.data_end
                } else {
                    bottom
                };
            }
        }
        aux
    }

    pub fn export_func(&self, name: &str) -> Result<u32, Error> {
        match self.exports.get(name) {
            Some(Export { kind: ExternKind::Func, idx }) => Ok(*idx),
            _ => Err(Error::Link(UNKNOWN_EXPORT)),
        }
    }

    /// Linear scan by resolved name; used when an index cannot be trusted.
    pub fn find_function_by_name(&self, name: &str) -> Option<u32> {
        self.functions.iter().find(|f| f.name == name).map(|f| f.index)
    }

    pub fn aux_layout(&self) -> AuxLayout {
        *crate::lock(&self.aux)
    }
}

// ---------------- Helper Functions ----------------
fn section_rank(id: u8) -> Option<u8> {
    match id {
        1..=9 => Some(id),
        12 => Some(10),
        10 => Some(11),
        11 => Some(12),
        _ => None,
    }
}

fn read_val_types(it: &mut ByteIter) -> Result<Vec<ValType>, Error> {
    let n = it.read_u32()?;
    let mut out = Vec::with_capacity(n.min(1024) as usize);
    for _ in 0..n {
        out.push(ValType::from_byte(it.read_u8()?).ok_or(Error::Malformed(INVALID_VALUE_TYPE))?);
    }
    Ok(out)
}

fn read_mutability(it: &mut ByteIter) -> Result<bool, Error> {
    match it.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(Error::Malformed(INVALID_MUTABILITY)),
    }
}

fn get_limits(it: &mut ByteIter, upper: u32) -> Result<(u32, u32, bool), Error> {
    let flags: u32 = safe_read_leb128(it.bytes, &mut it.idx, 2)?;
    let initial = it.read_u32()?;
    let max = if flags & 1 == 1 { it.read_u32()? } else { upper };
    if max < initial { return Err(Error::Validation(MIN_GREATER_THAN_MAX)); }
    Ok((initial, max, flags & 2 == 2))
}

fn get_memory_limits(it: &mut ByteIter) -> Result<(u32, u32, bool), Error> {
    let (initial, max, shared) = get_limits(it, Module::MAX_PAGES)?;
    if initial > Module::MAX_PAGES || max > Module::MAX_PAGES {
        return Err(Error::Validation(MEMORY_SIZE_LIMIT));
    }
    Ok((initial, max, shared))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(src: &str) -> Module {
        Module::compile(wat::parse_str(src).unwrap()).unwrap()
    }

    #[test]
    fn function_descriptors() {
        let m = compile(r#"
            (module
              (import "env" "log" (func $log (param i32)))
              (func $inner (param i64 i32) (result i64) (local f64 i32)
                local.get 0)
              (func (export "run") (result i32)
                i32.const 1))
        "#);
        assert_eq!(m.functions.len(), 3);
        let inner = &m.functions[1];
        assert_eq!(inner.name, "inner");
        assert_eq!(inner.param_cell_num, 3);
        assert_eq!(inner.local_cell_num, 3);
        assert_eq!(inner.ret_cell_num, 2);
        assert_eq!(inner.local_offsets, vec![0, 2, 3, 5]);
        assert_eq!(m.bytes[inner.code_end()], 0x0b);
        assert_eq!(m.functions[2].name, "run");
        assert_eq!(m.find_function_by_name("run"), Some(2));
        assert!(m.functions[0].is_import());
    }

    #[test]
    fn aux_layout_from_exports() {
        let m = compile(r#"
            (module
              (memory 1)
              (global $sp (mut i32) (i32.const 66560))
              (global (export "__data_end") i32 (i32.const 1024))
              (global (export "__heap_base") i32 (i32.const 66560)))
        "#);
        let aux = m.aux_layout();
        assert_eq!(aux.stack_top_global_index, 0);
        assert_eq!(aux.stack_bottom, 66560);
        assert_eq!(aux.data_end, 1024);
        assert_eq!(aux.stack_size, 66560 - 1024);
        assert_eq!(aux.heap_base_global_index, 2);
    }

    #[test]
    fn global_offsets_are_packed() {
        let m = compile(r#"
            (module
              (global i32 (i32.const 1))
              (global i64 (i64.const 2))
              (global f32 (f32.const 3)))
        "#);
        let offsets: Vec<usize> = m.globals.iter().map(|g| g.data_offset).collect();
        assert_eq!(offsets, vec![0, 4, 12]);
        assert_eq!(m.global_data_size, 16);
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(matches!(Module::compile(vec![0, 1, 2, 3, 1, 0, 0, 0]), Err(Error::Malformed(NO_MAGIC_HEADER))));
    }
}
