use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use paste::paste;

use crate::blocks::BranchBlock;
use crate::config::RunningMode;
use crate::error::*;
use crate::instance::ModuleInstance;
use crate::module::Function;
use crate::types::WasmValue;

pub const TERMINATE_FLAG: u32 = 0x1;
pub const SUSPEND_FLAG: u32 = 0x2;

/// Bookkeeping bytes charged per frame on top of its cells and labels.
const FRAME_HEADER_SIZE: usize = 48;
const LABEL_SIZE: usize = 16;

macro_rules! cell_stack_ops {
    ($($type:ident => $cells:literal),*) => { paste! { $(
        #[inline(always)]
        pub fn [<push_ $type>](&mut self, v: $type) -> Result<(), Error> {
            self.push_raw(WasmValue::[<from_ $type>](v).0, $cells)
        }
        #[inline(always)]
        pub fn [<pop_ $type>](&mut self) -> Result<$type, Error> {
            Ok(WasmValue(self.pop_raw($cells)?).[<as_ $type>]())
        }
    )* } };
}

/// One bytecode activation. `cells` is the frame's whole window:
/// params, then declared locals, then the operand stack up to `sp`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterpFrame {
    /// `None` for the dummy root frame.
    pub function: Option<u32>,
    pub ip: Option<usize>,
    pub cells: Vec<u32>,
    pub sp: usize,
    pub blocks: Vec<BranchBlock>,
    footprint: usize,
}

impl InterpFrame {
    #[inline(always)]
    pub fn push_raw(&mut self, bits: u64, n: usize) -> Result<(), Error> {
        if self.sp + n > self.cells.len() {
            return Err(Error::Trap(STACK_EXHAUSTED));
        }
        self.cells[self.sp] = bits as u32;
        if n == 2 {
            self.cells[self.sp + 1] = (bits >> 32) as u32;
        }
        self.sp += n;
        Ok(())
    }

    #[inline(always)]
    pub fn pop_raw(&mut self, n: usize) -> Result<u64, Error> {
        if self.sp < n {
            return Err(Error::Trap(STACK_UNDERFLOW));
        }
        self.sp -= n;
        let lo = self.cells[self.sp] as u64;
        Ok(if n == 2 { lo | (self.cells[self.sp + 1] as u64) << 32 } else { lo })
    }

    cell_stack_ops!(i32 => 1, u32 => 1, f32 => 1, i64 => 2, u64 => 2, f64 => 2);

    /// The live operand and local cells, `[0, sp)`.
    #[inline]
    pub fn live_cells(&self) -> &[u32] { &self.cells[..self.sp] }

    #[inline]
    pub fn footprint(&self) -> usize { self.footprint }
}

/// A frame of ahead-of-time compiled code: no label stack, the instruction
/// position is an offset into the function body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AotFrame {
    pub func_index: u32,
    pub ip_offset: u32,
    pub cells: Vec<u32>,
    pub sp: u32,
}

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Keep fresh handles clear of one adopted from a snapshot.
pub fn reserve_handle(handle: u64) {
    NEXT_HANDLE.fetch_max(handle.saturating_add(1), Ordering::Relaxed);
}

/// One logical thread of execution.
pub struct ExecEnv {
    /// Opaque thread handle. Replaced by the recorded value on restore.
    pub handle: u64,
    pub module_inst: Arc<ModuleInstance>,
    /// Call chain, outermost first. `frames[0]` is the dummy root.
    pub frames: Vec<InterpFrame>,
    /// Live compiled-code frames, outermost first.
    pub aot_frames: Vec<AotFrame>,
    /// Compiled-code frames handed back by a restore, outermost first.
    pub restore_call_chain: Vec<AotFrame>,
    pub suspend_flags: u32,
    pub aux_stack_boundary: u32,
    pub aux_stack_bottom: u32,
    /// Stop before executing `(function index, offset from code start)`.
    pub breakpoint: Option<(u32, u32)>,
    pub running_mode: RunningMode,
    pub is_restore: bool,
    stack_size: usize,
    stack_used: usize,
}

impl ExecEnv {
    pub fn new(module_inst: Arc<ModuleInstance>, stack_size: usize) -> Self {
        let aux = module_inst.module.aux_layout();
        let (boundary, bottom) = if aux.stack_bottom != u32::MAX {
            (aux.stack_bottom.saturating_sub(aux.stack_size), aux.stack_bottom)
        } else {
            (0, 0)
        };
        Self {
            handle: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
            module_inst,
            frames: Vec::new(),
            aot_frames: Vec::new(),
            restore_call_chain: Vec::new(),
            suspend_flags: 0,
            aux_stack_boundary: boundary,
            aux_stack_bottom: bottom,
            breakpoint: None,
            running_mode: RunningMode::Interp,
            is_restore: false,
            stack_size,
            stack_used: 0,
        }
    }

    #[inline]
    pub fn stack_size(&self) -> usize { self.stack_size }
    #[inline]
    pub fn stack_used(&self) -> usize { self.stack_used }
    #[inline]
    pub fn is_suspended(&self) -> bool { self.suspend_flags & SUSPEND_FLAG != 0 }

    #[inline]
    pub fn cur_frame(&self) -> Option<&InterpFrame> { self.frames.last() }

    fn reserve(&mut self, size: usize) -> Result<(), Error> {
        if self.stack_used + size > self.stack_size {
            tracing::debug!(used = self.stack_used, size, limit = self.stack_size, "wasm operand stack overflow");
            return Err(Error::Trap(STACK_EXHAUSTED));
        }
        self.stack_used += size;
        Ok(())
    }

    /// Allocate an empty frame for `func`, charged against the stack budget.
    pub fn alloc_frame(&mut self, func: &Function) -> Result<InterpFrame, Error> {
        let cell_num = func.frame_cell_num() as usize;
        let block_num = func.max_block_num as usize + 1;
        let footprint = FRAME_HEADER_SIZE + 4 * cell_num + LABEL_SIZE * block_num;
        self.reserve(footprint)?;
        Ok(InterpFrame {
            function: Some(func.index),
            ip: None,
            cells: vec![0; cell_num],
            sp: (func.param_cell_num + func.local_cell_num) as usize,
            blocks: Vec::with_capacity(block_num),
            footprint,
        })
    }

    /// The root frame receives the outermost function's results.
    pub fn alloc_dummy_frame(&mut self, ret_cell_num: u32) -> Result<InterpFrame, Error> {
        let cell_num = ret_cell_num.max(2) as usize;
        let footprint = FRAME_HEADER_SIZE + 4 * cell_num;
        self.reserve(footprint)?;
        Ok(InterpFrame { cells: vec![0; cell_num], footprint, ..Default::default() })
    }

    pub fn free_frame(&mut self, frame: &InterpFrame) {
        self.stack_used = self.stack_used.saturating_sub(frame.footprint);
    }

    /// Drop every frame, e.g. after a trap.
    pub fn unwind(&mut self) {
        self.frames.clear();
        self.stack_used = 0;
        self.suspend_flags &= !SUSPEND_FLAG;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{instantiate, Imports, InstanceOptions};
    use crate::module::Module;

    fn env(src: &str, stack_size: usize) -> ExecEnv {
        let m = Arc::new(Module::compile(wat::parse_str(src).unwrap()).unwrap());
        let inst = instantiate(m, &Imports::new(), InstanceOptions::default()).unwrap();
        ExecEnv::new(inst, stack_size)
    }

    #[test]
    fn typed_cells() {
        let mut f = InterpFrame { cells: vec![0; 8], ..Default::default() };
        f.push_i64(-5).unwrap();
        f.push_f32(1.25).unwrap();
        assert_eq!(f.sp, 3);
        assert_eq!(f.pop_f32().unwrap(), 1.25);
        assert_eq!(f.pop_i64().unwrap(), -5);
        assert!(matches!(f.pop_u32(), Err(Error::Trap(STACK_UNDERFLOW))));
        f.sp = 7;
        assert!(matches!(f.push_u64(1), Err(Error::Trap(STACK_EXHAUSTED))));
    }

    #[test]
    fn frame_allocation_is_bounded() {
        let mut e = env("(module (func (param i64) (local i32) (drop (i32.const 1))))", 150);
        let func = e.module_inst.module.functions[0].clone();
        let f = e.alloc_frame(&func).unwrap();
        assert_eq!(f.sp, 3);
        assert_eq!(f.cells.len(), func.frame_cell_num() as usize);
        let used = e.stack_used();
        assert!(used > 0);
        assert!(matches!(e.alloc_frame(&func), Err(Error::Trap(STACK_EXHAUSTED))));
        e.free_frame(&f);
        assert_eq!(e.stack_used(), 0);
    }

    #[test]
    fn aux_stack_bounds_follow_module_header() {
        let e = env(r#"
            (module
              (memory 2)
              (global $sp (mut i32) (i32.const 66560))
              (global (export "__data_end") i32 (i32.const 1024)))
        "#, 4096);
        assert_eq!(e.aux_stack_bottom, 66560);
        assert_eq!(e.aux_stack_boundary, 1024);
        assert!(!e.is_suspended());
    }
}
