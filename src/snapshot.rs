//! Portable snapshot records and their capture/restore.
//!
//! Nothing here holds a pointer, an OS descriptor or an OS thread id:
//! instruction positions are offsets from the function's code start, stack
//! positions are cell indices into the frame's own window, functions are
//! found again by index or name, and WASI resources are reopened by
//! replaying what the guest did to them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::blocks::{compute_block_stack_at, BranchBlock};
use crate::config::{RunningMode, RuntimeConfig};
use crate::error::*;
use crate::exec_env::{self, AotFrame, ExecEnv, InterpFrame};
use crate::gateway::ReconnectStrategy;
use crate::instance::{ModuleInstance, TableInstance};
use crate::lock;
use crate::memory::MemoryInstance;
use crate::module::{AuxLayout, Function, Module};
use crate::shim::WasiShim;
use crate::wasi::{FdEntry, SocketMetaData, SyncOp, WasiContext};

const FUNCREF: u8 = 0x70;

/// A record that can be taken from a live runtime object and written back
/// into one, possibly in another process.
pub trait Snapshot: Sized {
    type Live: ?Sized;
    type Cx<'a>;

    fn capture(live: &Self::Live, cx: Self::Cx<'_>) -> Result<Self, Error>;
    fn restore(&self, live: &mut Self::Live, cx: Self::Cx<'_>) -> Result<(), Error>;
}

/// Everything capture and restore of environment-level state reach for.
pub struct SnapshotCx<'a> {
    pub config: &'a RuntimeConfig,
    pub wasi: &'a Mutex<WasiContext>,
    pub shim: &'a dyn WasiShim,
    pub reconnect: &'a dyn ReconnectStrategy,
    /// Capture: this environment writes the module instance record.
    pub is_owner: bool,
    /// Module instances whose memories and tables were already restored.
    pub restored: &'a Mutex<BTreeSet<u64>>,
}

// ---------------- Memory ----------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub module_type: RunningMode,
    pub ref_count: u32,
    pub is_shared: bool,
    pub bytes_per_page: u32,
    pub cur_page_count: u32,
    pub max_page_count: u32,
    pub memory_bytes: Vec<u8>,
    pub heap_bytes: Vec<u8>,
}

impl Snapshot for MemorySnapshot {
    type Live = MemoryInstance;
    type Cx<'a> = &'a RuntimeConfig;

    fn capture(live: &MemoryInstance, config: &RuntimeConfig) -> Result<Self, Error> {
        Ok(Self {
            module_type: config.running_mode,
            ref_count: live.ref_count,
            is_shared: live.is_shared(),
            bytes_per_page: live.bytes_per_page(),
            cur_page_count: live.size(),
            max_page_count: live.max(),
            memory_bytes: live.data().to_vec(),
            heap_bytes: live.heap().to_vec(),
        })
    }

    fn restore(&self, live: &mut MemoryInstance, config: &RuntimeConfig) -> Result<(), Error> {
        *live = MemoryInstance::from_parts(
            &self.memory_bytes,
            &self.heap_bytes,
            (self.bytes_per_page, self.cur_page_count, self.max_page_count),
            self.is_shared,
            self.ref_count,
            config.shared_heap_size,
        )?;
        Ok(())
    }
}

// ---------------- Table ----------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub elem_type: u8,
    pub cur_size: u32,
    pub max_size: u32,
    pub elems: Vec<u32>,
}

impl Snapshot for TableSnapshot {
    type Live = TableInstance;
    type Cx<'a> = ();

    fn capture(live: &TableInstance, _: ()) -> Result<Self, Error> {
        Ok(Self { elem_type: FUNCREF, cur_size: live.cur_size, max_size: live.max_size, elems: live.elems.clone() })
    }

    fn restore(&self, live: &mut TableInstance, _: ()) -> Result<(), Error> {
        if self.elems.len() != self.cur_size as usize {
            return Err(Error::restore(format!(
                "table records {} elements but size {}", self.elems.len(), self.cur_size
            )));
        }
        live.elems = self.elems.clone();
        live.cur_size = self.cur_size;
        live.max_size = self.max_size;
        Ok(())
    }
}

// ---------------- Branch block ----------------

/// One label. Addresses are relative to the function's code start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchBlockSnapshot {
    pub begin_addr: Option<u32>,
    pub target_addr: Option<u32>,
    pub frame_sp_offset: Option<u32>,
    pub cell_num: u32,
}

impl Snapshot for BranchBlockSnapshot {
    type Live = BranchBlock;
    /// The function's code start.
    type Cx<'a> = usize;

    fn capture(live: &BranchBlock, code_start: usize) -> Result<Self, Error> {
        let rel = |a: usize| {
            a.checked_sub(code_start)
                .map(|d| d as u32)
                .ok_or_else(|| Error::restore(format!("label address {a:#x} precedes its function")))
        };
        Ok(Self {
            begin_addr: live.begin_addr.map(rel).transpose()?,
            target_addr: live.target_addr.map(rel).transpose()?,
            frame_sp_offset: live.frame_sp.map(|sp| sp as u32),
            cell_num: live.cell_num,
        })
    }

    /// Absent fields leave the destination untouched.
    fn restore(&self, live: &mut BranchBlock, code_start: usize) -> Result<(), Error> {
        if let Some(b) = self.begin_addr {
            live.begin_addr = Some(code_start + b as usize);
        }
        if let Some(t) = self.target_addr {
            live.target_addr = Some(code_start + t as usize);
        }
        if let Some(sp) = self.frame_sp_offset {
            live.frame_sp = Some(sp as usize);
        }
        live.cell_num = self.cell_num;
        Ok(())
    }
}

// ---------------- Frame ----------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpFrameSnapshot {
    pub ip_offset: Option<u32>,
    /// 0 resolves by `function_name`.
    pub function_index: u32,
    pub function_name: String,
    pub sp_offset: u32,
    pub stack_cells: Vec<u32>,
    /// Outermost first. Empty for compiled frames.
    pub branch_blocks: Vec<BranchBlockSnapshot>,
}

impl InterpFrameSnapshot {
    /// `None` for the dummy root frame, which carries no state of its own.
    pub fn capture_frame(live: &InterpFrame, module: &Module) -> Result<Option<Self>, Error> {
        let Some(idx) = live.function else { return Ok(None) };
        let func = module.functions.get(idx as usize)
            .ok_or_else(|| Error::restore(format!("live frame names unknown function {idx}")))?;
        let code_start = func.code_start();
        let ip_offset = live.ip.map(|ip| (ip - code_start) as u32);
        let branch_blocks = live.blocks
            .iter()
            .map(|b| BranchBlockSnapshot::capture(b, code_start))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(Self {
            ip_offset,
            function_index: idx,
            function_name: func.name.clone(),
            sp_offset: live.sp as u32,
            stack_cells: live.live_cells().to_vec(),
            branch_blocks,
        }))
    }

    pub fn capture_aot(live: &AotFrame, module: &Module) -> Result<Self, Error> {
        let func = module.functions.get(live.func_index as usize)
            .ok_or_else(|| Error::restore(format!("compiled frame names unknown function {}", live.func_index)))?;
        let sp = live.sp as usize;
        let cells = live.cells.get(..sp)
            .ok_or_else(|| Error::restore(format!("compiled frame sp {sp} beyond its cells")))?;
        Ok(Self {
            ip_offset: Some(live.ip_offset),
            function_index: live.func_index,
            function_name: func.name.clone(),
            sp_offset: live.sp,
            stack_cells: cells.to_vec(),
            branch_blocks: Vec::new(),
        })
    }

    /// Find the frame's function in `module`: by index when it is nonzero,
    /// in range and not an import, else by name.
    pub fn resolve<'m>(&self, module: &'m Module) -> Result<&'m Function, Error> {
        let by_index = match self.function_index {
            0 => None,
            idx => module.functions.get(idx as usize).filter(|f| !f.is_import()),
        };
        by_index
            .or_else(|| {
                module.find_function_by_name(&self.function_name)
                    .and_then(|idx| module.functions.get(idx as usize))
            })
            .ok_or_else(|| Error::restore(format!(
                "cannot resolve frame function #{} ({:?})", self.function_index, self.function_name
            )))
    }

    pub fn to_aot(&self, module: &Module) -> Result<AotFrame, Error> {
        let func = self.resolve(module)?;
        Ok(AotFrame {
            func_index: func.index,
            ip_offset: self.ip_offset.unwrap_or(0),
            cells: self.stack_cells.clone(),
            sp: self.sp_offset,
        })
    }

    fn stored_blocks(&self, code_start: usize) -> Result<Vec<BranchBlock>, Error> {
        self.branch_blocks
            .iter()
            .map(|s| {
                let mut b = BranchBlock::default();
                s.restore(&mut b, code_start)?;
                Ok(b)
            })
            .collect()
    }
}

impl Snapshot for InterpFrameSnapshot {
    type Live = InterpFrame;
    type Cx<'a> = &'a Module;

    fn capture(live: &InterpFrame, module: &Module) -> Result<Self, Error> {
        Self::capture_frame(live, module)?.ok_or_else(|| Error::restore("cannot capture the root frame"))
    }

    /// `live` must be freshly allocated for the resolved function. Its label
    /// stack is rebuilt by replaying the body up to the saved position.
    fn restore(&self, live: &mut InterpFrame, module: &Module) -> Result<(), Error> {
        let func = self.resolve(module)?;
        let code_start = func.code_start();
        let ip_offset = self.ip_offset
            .ok_or_else(|| Error::restore(format!("frame of {} has no instruction position", func.name)))?;
        let ip = code_start + ip_offset as usize;
        if ip > func.code_end() {
            return Err(Error::restore(format!("ip offset {ip_offset:#x} lies outside {}", func.name)));
        }
        let sp = self.sp_offset as usize;
        let bottom = (func.param_cell_num + func.local_cell_num) as usize;
        if sp != self.stack_cells.len() || sp > live.cells.len() || sp < bottom {
            return Err(Error::restore(format!(
                "frame of {} holds {} cells with sp {} but its window is {}..{}",
                func.name, self.stack_cells.len(), sp, bottom, live.cells.len()
            )));
        }

        live.function = Some(func.index);
        live.ip = Some(ip);
        live.cells[..sp].copy_from_slice(&self.stack_cells);
        live.sp = sp;

        let blocks = compute_block_stack_at(module, func, ip)?;
        if blocks.len() > func.max_block_num as usize + 1 {
            return Err(Error::restore(format!("replay of {} opened too many labels", func.name)));
        }
        if !self.branch_blocks.is_empty() && self.stored_blocks(code_start)? != blocks {
            tracing::warn!(
                function = %func.name,
                ip_offset,
                stored = self.branch_blocks.len(),
                replayed = blocks.len(),
                "stored label stack differs from replay, using replay"
            );
        }
        tracing::trace!(function = %func.name, ip_offset, labels = blocks.len(), "frame restored");
        live.blocks = blocks;
        Ok(())
    }
}

// ---------------- WASI ----------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WasiSnapshot {
    pub fd_map: BTreeMap<i32, FdEntry>,
    pub socket_fd_map: BTreeMap<i32, SocketMetaData>,
    pub sync_ops: Vec<SyncOp>,
    pub dir: Vec<String>,
    pub map_dir: Vec<String>,
    pub env: Vec<String>,
    pub arg: Vec<String>,
    pub addr_pool: Vec<String>,
    pub ns_lookup: Vec<String>,
    pub tid_start_arg_map: BTreeMap<u64, (u32, u32)>,
    pub child_tid_map: BTreeMap<u64, u64>,
}

impl Snapshot for WasiSnapshot {
    type Live = WasiContext;
    type Cx<'a> = &'a SnapshotCx<'a>;

    /// Sockets are expected to be drained already; see
    /// [`WasiContext::drain_sockets`].
    fn capture(live: &WasiContext, _: &SnapshotCx<'_>) -> Result<Self, Error> {
        Ok(Self {
            fd_map: live.fd_map.clone(),
            socket_fd_map: live.socket_fd_map.clone(),
            sync_ops: live.sync_ops.clone(),
            dir: live.dirs.clone(),
            map_dir: live.map_dirs.clone(),
            env: live.envs.clone(),
            arg: live.args.clone(),
            addr_pool: live.addr_pool.clone(),
            ns_lookup: live.ns_lookup.clone(),
            tid_start_arg_map: live.tid_start_arg_map.clone(),
            child_tid_map: live.child_tid_map.clone(),
        })
    }

    /// Only the first call in a process does anything.
    fn restore(&self, live: &mut WasiContext, cx: &SnapshotCx<'_>) -> Result<(), Error> {
        if live.restored {
            tracing::debug!("wasi resources already restored");
            return Ok(());
        }
        live.dirs = self.dir.clone();
        live.map_dirs = self.map_dir.clone();
        live.envs = self.env.clone();
        live.args = self.arg.clone();
        live.addr_pool = self.addr_pool.clone();
        live.ns_lookup = self.ns_lookup.clone();
        live.tid_start_arg_map.extend(self.tid_start_arg_map.iter().map(|(&k, &v)| (k, v)));
        live.child_tid_map.extend(self.child_tid_map.iter().map(|(&k, &v)| (k, v)));
        live.fd_map = self.fd_map.clone();
        live.socket_fd_map = self.socket_fd_map.clone();
        live.replay(cx.shim, cx.config.policy, cx.reconnect);
        live.sync_ops = self.sync_ops.clone();
        tracing::info!(
            files = live.fd_map.len(),
            sockets = live.socket_fd_map.len(),
            failed = live.failed.len(),
            "wasi resources replayed"
        );
        Ok(())
    }
}

// ---------------- Module instance ----------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInstanceSnapshot {
    pub memories: Vec<MemorySnapshot>,
    pub tables: Vec<TableSnapshot>,
    pub global_bytes: Vec<u8>,
    pub aux: AuxLayout,
    pub wasi_arguments: WasiSnapshot,
}

impl Snapshot for ModuleInstanceSnapshot {
    type Live = Arc<ModuleInstance>;
    type Cx<'a> = &'a SnapshotCx<'a>;

    fn capture(live: &Arc<ModuleInstance>, cx: &SnapshotCx<'_>) -> Result<Self, Error> {
        let memories = live.memories()
            .iter()
            .map(|m| MemorySnapshot::capture(&lock(m), cx.config))
            .collect::<Result<Vec<_>, _>>()?;
        let tables = live.tables()
            .iter()
            .map(|t| TableSnapshot::capture(t, ()))
            .collect::<Result<Vec<_>, _>>()?;
        let mut wasi = lock(cx.wasi);
        if let Err(e) = wasi.drain_sockets(cx.shim, cx.config.drain_timeout()) {
            tracing::warn!(error = %e, "socket drain failed, snapshot may miss in-flight data");
        }
        let wasi_arguments = WasiSnapshot::capture(&wasi, cx)?;
        tracing::debug!(instance = live.id(), memories = memories.len(), "module instance captured");
        Ok(Self {
            memories,
            tables,
            global_bytes: live.global_bytes(),
            aux: live.module.aux_layout(),
            wasi_arguments,
        })
    }

    /// Memories and tables are restored once per instance; a repeated call
    /// leaves them alone.
    fn restore(&self, live: &mut Arc<ModuleInstance>, cx: &SnapshotCx<'_>) -> Result<(), Error> {
        let first = lock(cx.restored).insert(live.id());
        if first {
            let mut memories = Vec::with_capacity(self.memories.len());
            for snap in &self.memories {
                let mut mem = MemoryInstance::new(0, 0, false, 0)?;
                snap.restore(&mut mem, cx.config)?;
                memories.push(mem);
            }
            live.replace_memories(memories);
            let mut tables = live.tables();
            if tables.len() != self.tables.len() {
                return Err(Error::restore(format!(
                    "instance has {} tables but the snapshot holds {}", tables.len(), self.tables.len()
                )));
            }
            for (table, snap) in tables.iter_mut().zip(&self.tables) {
                snap.restore(table, ())?;
            }
        } else {
            tracing::debug!(instance = live.id(), "memories already restored");
        }
        live.set_global_bytes(&self.global_bytes)?;
        *lock(&live.module.aux) = self.aux;
        self.wasi_arguments.restore(&mut lock(cx.wasi), cx)
    }
}

// ---------------- Execution environment ----------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecEnvSnapshot {
    pub thread_handle_value: u64,
    pub suspend_flags: u32,
    pub aux_stack_boundary: u32,
    pub aux_stack_bottom: u32,
    pub running_mode: RunningMode,
    /// Innermost first.
    pub frames: Vec<InterpFrameSnapshot>,
    /// Present only in the designated owner's record.
    pub module_instance: Option<ModuleInstanceSnapshot>,
}

impl ExecEnvSnapshot {
    fn capture_frames(env: &ExecEnv) -> Result<Vec<InterpFrameSnapshot>, Error> {
        let module = &env.module_inst.module;
        match env.running_mode {
            RunningMode::Interp => {
                let mut frames = Vec::with_capacity(env.frames.len());
                for f in env.frames.iter().rev() {
                    if let Some(snap) = InterpFrameSnapshot::capture_frame(f, module)? {
                        frames.push(snap);
                    }
                }
                Ok(frames)
            }
            RunningMode::Aot => env.aot_frames
                .iter()
                .rev()
                .map(|f| InterpFrameSnapshot::capture_aot(f, module))
                .collect(),
        }
    }

    fn restore_frames(&self, env: &mut ExecEnv) -> Result<(), Error> {
        let module = env.module_inst.module.clone();
        env.unwind();
        if self.running_mode == RunningMode::Aot {
            env.restore_call_chain = self.frames
                .iter()
                .rev()
                .map(|f| f.to_aot(&module))
                .collect::<Result<_, _>>()?;
            return Ok(());
        }
        let Some(outermost) = self.frames.last() else { return Ok(()) };
        let ret_cells = outermost.resolve(&module)?.ret_cell_num;
        let dummy = env.alloc_dummy_frame(ret_cells).map_err(|e| Error::restore(format!("root frame: {e}")))?;
        env.frames.push(dummy);
        for snap in self.frames.iter().rev() {
            let func = snap.resolve(&module)?;
            let mut frame = env.alloc_frame(func)
                .map_err(|e| Error::restore(format!("frame for {}: {e}", func.name)))?;
            snap.restore(&mut frame, &module)?;
            env.frames.push(frame);
        }
        Ok(())
    }
}

impl Snapshot for ExecEnvSnapshot {
    type Live = ExecEnv;
    type Cx<'a> = &'a SnapshotCx<'a>;

    fn capture(env: &ExecEnv, cx: &SnapshotCx<'_>) -> Result<Self, Error> {
        let frames = Self::capture_frames(env)?;
        let module_instance = if cx.is_owner {
            Some(ModuleInstanceSnapshot::capture(&env.module_inst, cx)?)
        } else {
            None
        };
        tracing::debug!(handle = env.handle, frames = frames.len(), owner = cx.is_owner, "environment captured");
        Ok(Self {
            thread_handle_value: env.handle,
            suspend_flags: env.suspend_flags,
            aux_stack_boundary: env.aux_stack_boundary,
            aux_stack_bottom: env.aux_stack_bottom,
            running_mode: env.running_mode,
            frames,
            module_instance,
        })
    }

    fn restore(&self, env: &mut ExecEnv, cx: &SnapshotCx<'_>) -> Result<(), Error> {
        if let Some(mi) = &self.module_instance {
            mi.restore(&mut env.module_inst, cx)?;
        }
        env.aux_stack_boundary = self.aux_stack_boundary;
        env.aux_stack_bottom = self.aux_stack_bottom;
        env.running_mode = self.running_mode;
        // unwinding during the frame rebuild clears the flags
        self.restore_frames(env)?;
        env.suspend_flags = self.suspend_flags;
        env.is_restore = true;
        exec_env::reserve_handle(self.thread_handle_value);
        env.handle = self.thread_handle_value;
        tracing::debug!(handle = env.handle, frames = self.frames.len(), "environment restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::FixedGateway;
    use crate::instance::{instantiate, Imports, InstanceOptions};
    use crate::interp::{self, NoHooks, Outcome};
    use crate::opcodes;
    use crate::shim::HostShim;
    use crate::types::WasmValue;
    use std::net::{Ipv4Addr, Ipv6Addr};

    struct Fixture {
        config: RuntimeConfig,
        wasi: Mutex<WasiContext>,
        shim: HostShim,
        gateway: FixedGateway,
        restored: Mutex<BTreeSet<u64>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                config: RuntimeConfig::default(),
                wasi: Mutex::new(WasiContext::new()),
                shim: HostShim::new(),
                gateway: FixedGateway::new(Ipv4Addr::LOCALHOST, Ipv6Addr::LOCALHOST),
                restored: Mutex::new(BTreeSet::new()),
            }
        }

        fn cx(&self, is_owner: bool) -> SnapshotCx<'_> {
            SnapshotCx {
                config: &self.config,
                wasi: &self.wasi,
                shim: &self.shim,
                reconnect: &self.gateway,
                is_owner,
                restored: &self.restored,
            }
        }
    }

    fn instance(src: &str) -> Arc<ModuleInstance> {
        let m = Arc::new(Module::compile(wat::parse_str(src).unwrap()).unwrap());
        instantiate(m, &Imports::new(), InstanceOptions::default()).unwrap()
    }

    const LOOPS: &str = r#"
        (module
          (memory 1 4)
          (data (i32.const 16) "ckpt")
          (global $g (mut i64) (i64.const 9))
          (func $sum (export "sum") (param i32) (result i32) (local i32)
            (block
              (loop
                (br_if 1 (i32.eqz (local.get 0)))
                (local.set 1 (i32.add (local.get 1) (local.get 0)))
                (local.set 0 (i32.sub (local.get 0) (i32.const 1)))
                (br 0)))
            (local.get 1))
          (func (export "outer") (param i32) (result i32)
            (i32.add (i32.const 1000) (call $sum (local.get 0)))))
    "#;

    fn suspended_env(inst: &Arc<ModuleInstance>, at_op: u8, nth: usize) -> ExecEnv {
        let module = inst.module.clone();
        let mut env = ExecEnv::new(inst.clone(), 1 << 16);
        let sum = module.export_func("sum").unwrap();
        let f = &module.functions[sum as usize];
        let target = (f.body.start..f.body.end).filter(|&p| module.bytes[p] == at_op).nth(nth).unwrap();
        env.breakpoint = Some((sum, (target - f.code_start()) as u32));
        let outer = module.export_func("outer").unwrap();
        let out = interp::invoke(&mut env, outer, &[WasmValue::from_i32(6)], &mut NoHooks).unwrap();
        assert_eq!(out, Outcome::Suspended);
        env
    }

    #[test]
    fn branch_block_offsets_round_trip() {
        let live = BranchBlock { begin_addr: Some(110), target_addr: None, frame_sp: Some(4), cell_num: 2 };
        let snap = BranchBlockSnapshot::capture(&live, 100).unwrap();
        assert_eq!(snap.begin_addr, Some(10));
        assert_eq!(snap.target_addr, None);
        let mut back = BranchBlock::default();
        snap.restore(&mut back, 100).unwrap();
        assert_eq!(back, live);
        assert!(BranchBlockSnapshot::capture(&live, 200).is_err());
    }

    #[test]
    fn memory_bytes_are_exact() {
        let inst = instance(LOOPS);
        let fx = Fixture::new();
        let mem = inst.memory(0).unwrap();
        lock(&mem).grow(1);
        lock(&mem).store_u32(70000, 0, 0xdead_beef).unwrap();
        let snap = MemorySnapshot::capture(&lock(&mem), &fx.config).unwrap();
        assert_eq!(snap.memory_bytes.len(), 2 * 65536);
        let mut back = MemoryInstance::new(0, 0, false, 0).unwrap();
        snap.restore(&mut back, &fx.config).unwrap();
        assert_eq!(back, *lock(&mem));
        assert_eq!(back.max(), 4);
        assert_eq!(back.read_bytes(16, 4).unwrap(), b"ckpt");

        let mut shared = snap.clone();
        shared.ref_count = 1;
        shared.restore(&mut back, &fx.config).unwrap();
        assert!(back.capacity() >= fx.config.shared_heap_size);

        let mut bad = snap;
        bad.cur_page_count = 3;
        assert!(matches!(bad.restore(&mut back, &fx.config), Err(Error::Restore(_))));
    }

    #[test]
    fn frames_round_trip_with_replayed_labels() {
        let inst = instance(LOOPS);
        let fx = Fixture::new();
        let env = suspended_env(&inst, opcodes::LOCAL_SET, 1);
        let live: Vec<InterpFrame> = env.frames.clone();
        let snap = ExecEnvSnapshot::capture(&env, &fx.cx(false)).unwrap();
        assert_eq!(snap.frames.len(), 2);
        assert!(snap.module_instance.is_none());
        assert_eq!(snap.frames[0].function_name, "sum");
        assert_eq!(snap.frames[0].branch_blocks.len(), 3);

        let mut fresh = ExecEnv::new(inst.clone(), 1 << 16);
        snap.restore(&mut fresh, &fx.cx(false)).unwrap();
        assert_eq!(fresh.handle, env.handle);
        assert!(fresh.is_restore);
        assert!(fresh.is_suspended());
        assert_eq!(fresh.suspend_flags, env.suspend_flags);
        assert_eq!(fresh.frames.len(), live.len());
        for (a, b) in fresh.frames.iter().zip(&live).skip(1) {
            assert_eq!(a.function, b.function);
            assert_eq!(a.ip, b.ip);
            assert_eq!(a.sp, b.sp);
            assert_eq!(a.live_cells(), b.live_cells());
            assert_eq!(a.blocks, b.blocks);
        }
        let out = interp::resume(&mut fresh, &mut NoHooks).unwrap();
        assert_eq!(out, Outcome::Returned(vec![WasmValue::from_i32(1021)]));
    }

    #[test]
    fn frame_function_falls_back_to_name() {
        let inst = instance(LOOPS);
        let module = &inst.module;
        let env = suspended_env(&inst, opcodes::BR, 0);
        let mut snap = InterpFrameSnapshot::capture(env.frames.last().unwrap(), module).unwrap();
        snap.function_index = 0;
        assert_eq!(snap.resolve(module).unwrap().name, "sum");
        snap.function_index = 77;
        assert_eq!(snap.resolve(module).unwrap().name, "sum");
        snap.function_name = "nope".into();
        assert!(matches!(snap.resolve(module), Err(Error::Restore(_))));
        assert!(InterpFrameSnapshot::capture(&env.frames[0], module).is_err());
    }

    #[test]
    fn stale_stored_labels_lose_to_replay() {
        let inst = instance(LOOPS);
        let fx = Fixture::new();
        let env = suspended_env(&inst, opcodes::LOCAL_SET, 0);
        let mut snap = ExecEnvSnapshot::capture(&env, &fx.cx(false)).unwrap();
        snap.frames[0].branch_blocks.pop();
        let mut fresh = ExecEnv::new(inst.clone(), 1 << 16);
        snap.restore(&mut fresh, &fx.cx(false)).unwrap();
        assert_eq!(fresh.cur_frame().unwrap().blocks, env.cur_frame().unwrap().blocks);
    }

    #[test]
    fn module_instance_restores_once() {
        let inst = instance(LOOPS);
        let fx = Fixture::new();
        inst.set_global(0, WasmValue::from_i64(-3)).unwrap();
        let snap = ModuleInstanceSnapshot::capture(&inst, &fx.cx(true)).unwrap();
        assert_eq!(snap.memories.len(), 1);

        let mut target = instance(LOOPS);
        snap.restore(&mut target, &fx.cx(false)).unwrap();
        assert_eq!(target.get_global(0).unwrap().as_i64(), -3);
        let first = target.memory(0).unwrap();
        snap.restore(&mut target, &fx.cx(false)).unwrap();
        assert!(Arc::ptr_eq(&first, &target.memory(0).unwrap()));
        assert!(lock(&fx.wasi).restored);
    }

    #[test]
    fn compiled_frames_are_copied_without_replay() {
        let inst = instance(LOOPS);
        let fx = Fixture::new();
        let mut env = ExecEnv::new(inst.clone(), 1 << 16);
        env.running_mode = RunningMode::Aot;
        env.aot_frames = vec![
            AotFrame { func_index: 1, ip_offset: 7, cells: vec![6, 0, 0], sp: 2 },
            AotFrame { func_index: 0, ip_offset: 12, cells: vec![3, 4], sp: 2 },
        ];
        let snap = ExecEnvSnapshot::capture(&env, &fx.cx(false)).unwrap();
        assert_eq!(snap.frames[0].function_index, 0);
        assert!(snap.frames.iter().all(|f| f.branch_blocks.is_empty()));

        let mut fresh = ExecEnv::new(inst.clone(), 1 << 16);
        snap.restore(&mut fresh, &fx.cx(false)).unwrap();
        assert!(fresh.frames.is_empty());
        assert_eq!(fresh.restore_call_chain.len(), 2);
        assert_eq!(fresh.restore_call_chain[0].func_index, 1);
        assert_eq!(fresh.restore_call_chain[0].cells, vec![6, 0]);
        assert_eq!(fresh.restore_call_chain[1].ip_offset, 12);
    }
}
