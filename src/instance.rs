use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use nohash_hasher::IntMap;

use crate::error::*;
use crate::exec_env::ExecEnv;
use crate::interp::{self, NoHooks, Outcome};
use crate::lock;
use crate::memory::MemoryInstance;
use crate::module::{ConstExpr, Module};
use crate::types::{FuncType, ValType, WasmValue};

/// Host callback. It receives the calling instance so it can reach memory.
pub type HostFunc = Arc<dyn Fn(&ModuleInstance, &[WasmValue]) -> Result<Vec<WasmValue>, Error> + Send + Sync>;

#[derive(Clone)]
pub struct HostFunction {
    pub ty: FuncType,
    pub func: HostFunc,
}

/// Host functions keyed by `(module, field)`.
#[derive(Clone, Default)]
pub struct Imports {
    funcs: HashMap<(String, String), HostFunction>,
}

impl Imports {
    pub fn new() -> Self { Self::default() }

    pub fn func<F>(mut self, module: &str, field: &str, params: Vec<ValType>, results: Vec<ValType>, f: F) -> Self
    where
        F: Fn(&ModuleInstance, &[WasmValue]) -> Result<Vec<WasmValue>, Error> + Send + Sync + 'static,
    {
        let host = HostFunction { ty: FuncType { params, results }, func: Arc::new(f) };
        self.funcs.insert((module.to_string(), field.to_string()), host);
        self
    }

    pub fn get(&self, module: &str, field: &str) -> Option<&HostFunction> {
        self.funcs.get(&(module.to_string(), field.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInstance {
    /// Function indices, `NULL` for an empty slot.
    pub elems: Vec<u32>,
    pub cur_size: u32,
    pub max_size: u32,
}

impl TableInstance {
    pub const NULL: u32 = u32::MAX;

    pub fn new(initial: u32, maximum: u32) -> Self {
        Self { elems: vec![Self::NULL; initial as usize], cur_size: initial, max_size: maximum }
    }

    pub fn get(&self, idx: u32) -> Result<u32, Error> {
        match self.elems.get(idx as usize) {
            None => Err(Error::Trap(UNDEF_ELEM)),
            Some(&Self::NULL) => Err(Error::Trap(UNINITIALIZED_ELEM)),
            Some(&f) => Ok(f),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InstanceOptions {
    pub heap_size: usize,
    pub stack_size: usize,
    /// Skipped when the instance is about to be overwritten by a restore.
    pub run_start: bool,
}

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Per-instantiation state shared by every execution environment of a module.
pub struct ModuleInstance {
    id: u64,
    pub module: Arc<Module>,
    memories: Mutex<Vec<Arc<Mutex<MemoryInstance>>>>,
    tables: Mutex<Vec<TableInstance>>,
    globals: Mutex<Vec<u8>>,
    host_funcs: IntMap<u32, HostFunction>,
}

impl ModuleInstance {
    #[inline]
    pub fn id(&self) -> u64 { self.id }

    pub fn memory(&self, idx: usize) -> Option<Arc<Mutex<MemoryInstance>>> {
        lock(&self.memories).get(idx).cloned()
    }

    pub fn memories(&self) -> Vec<Arc<Mutex<MemoryInstance>>> {
        lock(&self.memories).clone()
    }

    /// Swap in a new set of memories. Environments that already hold the old
    /// `Arc`s keep them alive until they drop them.
    pub fn replace_memories(&self, memories: Vec<MemoryInstance>) {
        *lock(&self.memories) = memories.into_iter().map(|m| Arc::new(Mutex::new(m))).collect();
    }

    pub fn tables(&self) -> MutexGuard<'_, Vec<TableInstance>> {
        lock(&self.tables)
    }

    pub fn table_get(&self, table: usize, idx: u32) -> Result<u32, Error> {
        lock(&self.tables).get(table).ok_or(Error::Trap(UNDEF_ELEM))?.get(idx)
    }

    pub fn global_bytes(&self) -> Vec<u8> {
        lock(&self.globals).clone()
    }

    pub fn set_global_bytes(&self, bytes: &[u8]) -> Result<(), Error> {
        let mut globals = lock(&self.globals);
        if globals.len() != bytes.len() {
            return Err(Error::restore(format!(
                "global storage is {} bytes but the snapshot holds {}", globals.len(), bytes.len()
            )));
        }
        globals.copy_from_slice(bytes);
        Ok(())
    }

    pub fn get_global(&self, idx: u32) -> Result<WasmValue, Error> {
        let g = self.module.globals.get(idx as usize).ok_or(Error::Validation(UNKNOWN_GLOBAL))?;
        let globals = lock(&self.globals);
        let mut raw = [0u8; 8];
        let width = g.ty.cell_num() as usize * 4;
        raw[..width].copy_from_slice(&globals[g.data_offset..g.data_offset + width]);
        Ok(WasmValue(u64::from_le_bytes(raw)))
    }

    pub fn set_global(&self, idx: u32, v: WasmValue) -> Result<(), Error> {
        let g = self.module.globals.get(idx as usize).ok_or(Error::Validation(UNKNOWN_GLOBAL))?;
        let width = g.ty.cell_num() as usize * 4;
        let mut globals = lock(&self.globals);
        globals[g.data_offset..g.data_offset + width].copy_from_slice(&v.0.to_le_bytes()[..width]);
        Ok(())
    }

    pub fn host_func(&self, func_idx: u32) -> Option<&HostFunction> {
        self.host_funcs.get(&func_idx)
    }

    fn eval_const(&self, expr: ConstExpr) -> Result<WasmValue, Error> {
        Ok(match expr {
            ConstExpr::I32(v) => WasmValue::from_i32(v),
            ConstExpr::I64(v) => WasmValue::from_i64(v),
            ConstExpr::F32(bits) => WasmValue(bits as u64),
            ConstExpr::F64(bits) => WasmValue(bits),
            ConstExpr::GlobalGet(idx) => self.get_global(idx)?,
        })
    }
}

/// Link `module` against `imports` and initialise memories, tables, globals
/// and segments. The start function runs unless `opts.run_start` is false.
pub fn instantiate(module: Arc<Module>, imports: &Imports, opts: InstanceOptions) -> Result<Arc<ModuleInstance>, Error> {
    let mut host_funcs = IntMap::default();
    for f in module.functions.iter().filter(|f| f.is_import()) {
        let Some(import) = &f.import else { continue };
        let host = imports.get(&import.module, &import.field).ok_or(Error::Link(UNKNOWN_IMPORT))?;
        if host.ty != f.ty {
            return Err(Error::Link(INCOMPATIBLE_IMPORT));
        }
        host_funcs.insert(f.index, host.clone());
    }

    let mut memories = Vec::new();
    if let Some(mem) = &module.memory {
        if mem.import.is_some() {
            return Err(Error::Link(UNKNOWN_IMPORT));
        }
        memories.push(Arc::new(Mutex::new(MemoryInstance::new(mem.min, mem.max, mem.shared, opts.heap_size)?)));
    }
    let mut tables = Vec::new();
    if let Some(table) = &module.table {
        if table.import.is_some() {
            return Err(Error::Link(UNKNOWN_IMPORT));
        }
        tables.push(TableInstance::new(table.min, table.max));
    }
    if module.globals.iter().any(|g| g.import.is_some()) {
        return Err(Error::Link(UNKNOWN_IMPORT));
    }

    let inst = Arc::new(ModuleInstance {
        id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
        globals: Mutex::new(vec![0u8; module.global_data_size]),
        memories: Mutex::new(memories),
        tables: Mutex::new(tables),
        host_funcs,
        module: module.clone(),
    });

    for (idx, g) in module.globals.iter().enumerate() {
        if let Some(init) = g.init {
            let v = inst.eval_const(init)?;
            inst.set_global(idx as u32, v)?;
        }
    }

    for seg in &module.elements {
        let offset = inst.eval_const(seg.offset)?.as_u32() as usize;
        let mut tables = inst.tables();
        let table = tables.first_mut().ok_or(Error::Validation(UNKNOWN_TABLE))?;
        if offset.saturating_add(seg.funcs.len()) > table.elems.len() {
            return Err(Error::Link(ELEM_SEG_DNF));
        }
        table.elems[offset..offset + seg.funcs.len()].copy_from_slice(&seg.funcs);
    }

    for seg in &module.data_segments {
        let Some(offset) = seg.offset else { continue };
        let offset = inst.eval_const(offset)?.as_u32();
        let mem = inst.memory(0).ok_or(Error::Validation(UNKNOWN_MEMORY))?;
        lock(&mem)
            .write_bytes(offset, &module.bytes[seg.data_range.clone()])
            .map_err(|_| Error::Link(DATA_SEG_DNF))?;
    }

    tracing::debug!(instance = inst.id, memories = lock(&inst.memories).len(), "module instantiated");

    if let (Some(start), true) = (module.start, opts.run_start) {
        let mut env = ExecEnv::new(inst.clone(), opts.stack_size);
        match interp::invoke(&mut env, start, &[], &mut NoHooks)? {
            Outcome::Returned(_) => {}
            Outcome::Suspended => return Err(Error::Trap(UNREACHABLE)),
        }
    }
    Ok(inst)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(src: &str) -> Arc<Module> {
        Arc::new(Module::compile(wat::parse_str(src).unwrap()).unwrap())
    }

    #[test]
    fn segments_and_globals_are_initialised() {
        let m = module(r#"
            (module
              (memory 1)
              (table 4 funcref)
              (global $a i32 (i32.const 7))
              (global $b (mut i64) (i64.const -3))
              (global $c i32 (global.get $a))
              (func $f)
              (elem (i32.const 1) $f $f)
              (data (i32.const 16) "hi"))
        "#);
        let inst = instantiate(m, &Imports::new(), InstanceOptions { stack_size: 4096, ..Default::default() }).unwrap();
        assert_eq!(inst.get_global(0).unwrap().as_i32(), 7);
        assert_eq!(inst.get_global(1).unwrap().as_i64(), -3);
        assert_eq!(inst.get_global(2).unwrap().as_i32(), 7);
        assert_eq!(inst.table_get(0, 1).unwrap(), 0);
        assert!(matches!(inst.table_get(0, 0), Err(Error::Trap(UNINITIALIZED_ELEM))));
        assert!(matches!(inst.table_get(0, 9), Err(Error::Trap(UNDEF_ELEM))));
        let mem = inst.memory(0).unwrap();
        assert_eq!(lock(&mem).read_bytes(16, 2).unwrap(), b"hi");
    }

    #[test]
    fn missing_and_mismatched_imports() {
        let m = module(r#"(module (import "env" "f" (func (param i32))))"#);
        let opts = InstanceOptions::default();
        assert!(matches!(instantiate(m.clone(), &Imports::new(), opts), Err(Error::Link(UNKNOWN_IMPORT))));
        let wrong = Imports::new().func("env", "f", vec![ValType::I64], vec![], |_, _| Ok(vec![]));
        assert!(matches!(instantiate(m.clone(), &wrong, opts), Err(Error::Link(INCOMPATIBLE_IMPORT))));
        let right = Imports::new().func("env", "f", vec![ValType::I32], vec![], |_, _| Ok(vec![]));
        let inst = instantiate(m, &right, opts).unwrap();
        assert!(inst.host_func(0).is_some());
    }

    #[test]
    fn start_function_runs() {
        let m = module(r#"
            (module
              (global $g (mut i32) (i32.const 0))
              (func $s (global.set $g (i32.const 42)))
              (start $s))
        "#);
        let opts = InstanceOptions { stack_size: 4096, run_start: true, ..Default::default() };
        let inst = instantiate(m.clone(), &Imports::new(), opts).unwrap();
        assert_eq!(inst.get_global(0).unwrap().as_i32(), 42);
        let idle = instantiate(m, &Imports::new(), InstanceOptions { run_start: false, ..opts }).unwrap();
        assert_eq!(idle.get_global(0).unwrap().as_i32(), 0);
        assert_ne!(inst.id(), idle.id());
    }
}
