//! Drives checkpoint and restore for a whole process.
//!
//! A [`CheckpointContext`] is the one object capture and restore need: the
//! configuration, the live WASI state, the syscall shim, the reconnect
//! policy and the bookkeeping that makes module restore happen once. It is
//! shared by reference between every thread running an [`ExecEnv`].
//!
//! ```text
//! Running ─▶ SnapshotRequested ─▶ Draining ─▶ Serializing ─▶ Terminated
//! Loading ─▶ RestoringModuleAndMemory ─▶ RestoringExecEnvs ─▶ ReplayingWasi ─▶ Running
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use nohash_hasher::IntMap;

use crate::config::RuntimeConfig;
use crate::error::*;
use crate::exec_env::ExecEnv;
use crate::gateway::{FixedGateway, GatewayNotifier, GatewayOp, OpData, ReconnectStrategy, MAX_ADDR};
use crate::image::CheckpointImage;
use crate::instance::{instantiate, Imports, InstanceOptions, ModuleInstance};
use crate::interp::ExecHooks;
use crate::lock;
use crate::module::Module;
use crate::quiesce::Quiesce;
use crate::shim::{HostShim, WasiShim};
use crate::snapshot::{ExecEnvSnapshot, ModuleInstanceSnapshot, Snapshot, SnapshotCx};
use crate::wasi::{SyncOp, SyncOpKind, WasiContext};

const SYNC_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CheckpointState {
    #[default]
    Running,
    SnapshotRequested,
    Draining,
    Serializing,
    Terminated,
    Loading,
    RestoringModuleAndMemory,
    RestoringExecEnvs,
    ReplayingWasi,
}

/// Performs recorded synchronisation ops against the restored guest's
/// primitives.
pub trait SyncShim {
    fn apply(&self, handle: u64, op: &SyncOp) -> Result<(), Error>;
}

pub struct CheckpointContext {
    config: RuntimeConfig,
    wasi: Mutex<WasiContext>,
    shim: Arc<dyn WasiShim>,
    reconnect: Box<dyn ReconnectStrategy>,
    notifier: Option<GatewayNotifier>,
    quiesce: Quiesce,
    restored: Mutex<BTreeSet<u64>>,
    /// Module instance id to the handle of the environment that captures it.
    owners: Mutex<HashMap<u64, u64>>,
    handles: Mutex<BTreeSet<u64>>,
    state: Mutex<CheckpointState>,
    requested: AtomicBool,
    call_count: AtomicU64,
    pending: Mutex<Vec<ExecEnvSnapshot>>,
    /// Environments blocked in a host call, captured as they entered it.
    host_snapshots: Mutex<IntMap<u64, ExecEnvSnapshot>>,
    sync_cursor: Mutex<usize>,
    sync_cv: Condvar,
}

impl CheckpointContext {
    pub fn new(config: RuntimeConfig) -> Self {
        let mut wasi = WasiContext::new();
        wasi.dirs = config.dirs.clone();
        wasi.map_dirs = config.map_dirs.clone();
        wasi.envs = config.envs.clone();
        wasi.args = config.args.clone();
        wasi.addr_pool = config.addr_pool.clone();
        wasi.ns_lookup = config.ns_lookup_pool.clone();
        let shim = Arc::new(HostShim::new().with_map_dirs(&config.map_dirs));
        let reconnect = Box::new(FixedGateway::from_config(&config.gateway));
        let notifier = config.gateway.notify.then(|| GatewayNotifier::from_config(&config.gateway));
        Self {
            config,
            wasi: Mutex::new(wasi),
            shim,
            reconnect,
            notifier,
            quiesce: Quiesce::new(),
            restored: Mutex::new(BTreeSet::new()),
            owners: Mutex::new(HashMap::new()),
            handles: Mutex::new(BTreeSet::new()),
            state: Mutex::new(CheckpointState::Running),
            requested: AtomicBool::new(false),
            call_count: AtomicU64::new(0),
            pending: Mutex::new(Vec::new()),
            host_snapshots: Mutex::new(IntMap::default()),
            sync_cursor: Mutex::new(0),
            sync_cv: Condvar::new(),
        }
    }

    pub fn with_shim(mut self, shim: Arc<dyn WasiShim>) -> Self {
        self.shim = shim;
        self
    }

    pub fn with_reconnect(mut self, reconnect: Box<dyn ReconnectStrategy>) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn config(&self) -> &RuntimeConfig { &self.config }

    pub fn shim(&self) -> &dyn WasiShim { &*self.shim }

    /// The live WASI state, for syscall trampolines to record into.
    pub fn wasi(&self) -> std::sync::MutexGuard<'_, WasiContext> { lock(&self.wasi) }

    pub fn state(&self) -> CheckpointState { *lock(&self.state) }

    fn set_state(&self, next: CheckpointState) {
        let mut st = lock(&self.state);
        tracing::debug!(from = ?*st, to = ?next, "checkpoint state");
        *st = next;
    }

    fn cx(&self, is_owner: bool) -> SnapshotCx<'_> {
        SnapshotCx {
            config: &self.config,
            wasi: &self.wasi,
            shim: &*self.shim,
            reconnect: &*self.reconnect,
            is_owner,
            restored: &self.restored,
        }
    }

    /// Track an environment. The first one seen for a module instance
    /// becomes the owner that captures it.
    pub fn register_env(&self, env: &ExecEnv) {
        lock(&self.owners).entry(env.module_inst.id()).or_insert(env.handle);
        lock(&self.handles).insert(env.handle);
    }

    pub fn unregister_env(&self, env: &ExecEnv) {
        lock(&self.handles).remove(&env.handle);
    }

    pub fn is_owner(&self, env: &ExecEnv) -> bool {
        lock(&self.owners).get(&env.module_inst.id()) == Some(&env.handle)
    }

    pub fn threads(&self) -> u32 { lock(&self.handles).len() as u32 }

    /// Ask every environment to stop at its next safepoint. Safe to call
    /// from a signal handler thread.
    pub fn request_checkpoint(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            tracing::info!("checkpoint requested");
            self.set_state(CheckpointState::SnapshotRequested);
        }
    }

    pub fn is_requested(&self) -> bool { self.requested.load(Ordering::SeqCst) }

    /// Count a host call. True once the configured threshold is reached, or
    /// if a checkpoint is already pending.
    pub fn count_host_call(&self) -> bool {
        let n = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        let threshold = self.config.snapshot_threshold;
        if threshold != 0 && n >= threshold {
            tracing::debug!(calls = n, threshold, "host call threshold reached");
            self.request_checkpoint();
        }
        self.is_requested()
    }

    pub fn hooks(&self) -> CheckpointHooks<'_> { CheckpointHooks { ctx: self } }

    // ---------------- Checkpoint ----------------

    /// Capture suspended environments into an image. The module instance
    /// record goes to its owner, or to the first environment if the owner is
    /// not among `envs`.
    pub fn checkpoint(&self, envs: &[&ExecEnv]) -> Result<CheckpointImage, Error> {
        let first = envs.first().ok_or_else(|| Error::restore("no environment to checkpoint"))?;
        self.set_state(CheckpointState::Draining);
        let snaps = envs
            .iter()
            .map(|e| ExecEnvSnapshot::capture(e, &self.cx(false)))
            .collect::<Result<Vec<_>, _>>()?;
        self.seal(snaps, &first.module_inst)
    }

    pub fn checkpoint_to(&self, envs: &[&ExecEnv], target: &str) -> Result<(), Error> {
        let image = self.checkpoint(envs)?;
        image.write_to(target)?;
        self.set_state(CheckpointState::Terminated);
        Ok(())
    }

    /// Collective checkpoint from a suspended thread. The first caller
    /// coordinates: it freezes every thread, waits for all of them, then
    /// writes the image and returns. Every other caller parks for good.
    pub fn submit(&self, env: &ExecEnv, target: &str) -> Result<(), Error> {
        let snap = ExecEnvSnapshot::capture(env, &self.cx(false))?;
        lock(&self.pending).push(snap);
        let coordinator = {
            let mut st = lock(&self.state);
            let first = !matches!(*st, CheckpointState::Draining | CheckpointState::Serializing | CheckpointState::Terminated);
            if first {
                *st = CheckpointState::Draining;
            }
            first
        };
        if coordinator {
            self.quiesce.freeze_all();
        }
        self.quiesce.checkpoint(env.handle);
        if !coordinator {
            tracing::debug!(handle = env.handle, "submitted, parking");
            self.quiesce.park();
        }

        let threads = self.threads();
        tracing::info!(handle = env.handle, threads, "coordinating checkpoint");
        self.quiesce.wait_ready(threads, None);
        let mut snaps = std::mem::take(&mut *lock(&self.pending));
        snaps.extend(lock(&self.host_snapshots).drain().map(|(_, s)| s));
        snaps.sort_by_key(|s| s.thread_handle_value);
        let image = self.seal(snaps, &env.module_inst)?;
        image.write_to(target)?;
        self.set_state(CheckpointState::Terminated);
        Ok(())
    }

    /// Attach the module instance record and tell the gateway we are going.
    fn seal(&self, mut snaps: Vec<ExecEnvSnapshot>, inst: &Arc<ModuleInstance>) -> Result<CheckpointImage, Error> {
        self.set_state(CheckpointState::Serializing);
        self.notify_gateway(true);
        let owner = lock(&self.owners).get(&inst.id()).copied();
        let idx = owner
            .and_then(|h| snaps.iter().position(|s| s.thread_handle_value == h))
            .unwrap_or(0);
        let record = ModuleInstanceSnapshot::capture(inst, &self.cx(true))?;
        let envs = snaps.len();
        let slot = snaps.get_mut(idx).ok_or_else(|| Error::restore("no environment to checkpoint"))?;
        slot.module_instance = Some(record);
        tracing::info!(envs, owner = slot.thread_handle_value, "checkpoint sealed");
        Ok(CheckpointImage::new(snaps))
    }

    fn notify_gateway(&self, suspend: bool) {
        let Some(notifier) = &self.notifier else { return };
        let wasi = lock(&self.wasi);
        if wasi.socket_fd_map.is_empty() {
            return;
        }
        let server = wasi.has_tcp_server();
        let op = match (suspend, server) {
            (true, false) => GatewayOp::Suspend,
            (true, true) => GatewayOp::SuspendTcpServer,
            (false, false) => GatewayOp::Resume,
            (false, true) => GatewayOp::ResumeTcpServer,
        };
        let mut msg = OpData::new(op);
        msg.is_tcp = wasi.has_tcp();
        for (slot, meta) in msg.addr.iter_mut().zip(wasi.socket_fd_map.values()).take(MAX_ADDR) {
            slot[0] = meta.local_address;
        }
        msg.size = wasi.socket_fd_map.len().min(MAX_ADDR) as i32;
        drop(wasi);
        if let Err(e) = notifier.notify(&msg) {
            tracing::warn!(error = %e, op = ?op, "gateway notification failed");
        }
    }

    // ---------------- Restore ----------------

    /// Rebuild every environment in `image` on a fresh instance of `module`.
    /// The owner's record, which carries memories and WASI state, goes first.
    pub fn restore(&self, image: &CheckpointImage, module: Arc<Module>, imports: &Imports) -> Result<Vec<ExecEnv>, Error> {
        self.set_state(CheckpointState::Loading);
        let owner = image.owner()?;
        let opts = InstanceOptions {
            heap_size: self.config.heap_size,
            stack_size: self.config.stack_size,
            run_start: false,
        };
        let inst = instantiate(module, imports, opts)?;

        let vtids = image.envs[owner]
            .module_instance
            .as_ref()
            .map(|m| m.wasi_arguments.tid_start_arg_map.clone())
            .unwrap_or_default();
        let mut order: Vec<usize> = (0..image.envs.len()).filter(|&i| i != owner).collect();
        order.sort_by_key(|&i| {
            let h = image.envs[i].thread_handle_value;
            (vtids.get(&h).map_or(u32::MAX, |&(_, vtid)| vtid), h)
        });
        order.insert(0, owner);

        let mut envs = Vec::with_capacity(order.len());
        for (n, i) in order.into_iter().enumerate() {
            self.set_state(if n == 0 { CheckpointState::RestoringModuleAndMemory } else { CheckpointState::RestoringExecEnvs });
            let snap = &image.envs[i];
            let mut env = ExecEnv::new(inst.clone(), self.config.stack_size);
            let old = env.handle;
            snap.restore(&mut env, &self.cx(n == 0))?;
            lock(&self.wasi).map_handle(snap.thread_handle_value, env.handle);
            tracing::debug!(old, handle = env.handle, frames = snap.frames.len(), "environment rebuilt");
            envs.push(env);
        }

        self.set_state(CheckpointState::ReplayingWasi);
        {
            let mut wasi = lock(&self.wasi);
            let tid_map = wasi.tid_map.clone();
            for op in &mut wasi.sync_ops {
                if let Some(&new) = tid_map.get(&op.tid) {
                    op.tid = new;
                }
            }
        }
        *lock(&self.sync_cursor) = 0;
        self.notify_gateway(false);
        for env in &envs {
            self.register_env(env);
        }
        self.requested.store(false, Ordering::SeqCst);
        self.set_state(CheckpointState::Running);
        tracing::info!(envs = envs.len(), "restore complete");
        Ok(envs)
    }

    /// Load from `source` and restore, or end the process with a diagnostic.
    pub fn restore_or_exit(&self, source: &str, module: Arc<Module>, imports: &Imports) -> Vec<ExecEnv> {
        match CheckpointImage::read_from(source).and_then(|image| self.restore(&image, module, imports)) {
            Ok(envs) => envs,
            Err(e) => fatal(format!("cannot restore from {source}: {e}")),
        }
    }

    /// Re-perform the recorded sync ops of `handle`, interleaved with other
    /// threads in recorded order. Ops of threads that were not restored are
    /// skipped.
    pub fn replay_sync_ops(&self, handle: u64, shim: &dyn SyncShim) -> Result<(), Error> {
        let ops = lock(&self.wasi).sync_ops.clone();
        let known = lock(&self.handles).clone();
        let mut cur = lock(&self.sync_cursor);
        loop {
            while *cur < ops.len() && !known.contains(&ops[*cur].tid) {
                tracing::debug!(tid = ops[*cur].tid, "skipping sync op of unknown thread");
                *cur += 1;
            }
            if !ops[*cur..].iter().any(|op| op.tid == handle) {
                self.sync_cv.notify_all();
                return Ok(());
            }
            let op = ops[*cur];
            if op.tid != handle {
                cur = self.sync_cv
                    .wait_timeout(cur, SYNC_POLL)
                    .map(|(g, _)| g)
                    .unwrap_or_else(|e| e.into_inner().0);
                continue;
            }
            // A wait blocks until a later op of another thread, so it gives
            // up its turn first. Everything else holds the turn until done.
            let blocking = matches!(op.kind, SyncOpKind::CondWait | SyncOpKind::AtomicWait);
            if blocking {
                *cur += 1;
                self.sync_cv.notify_all();
            }
            drop(cur);
            if op.kind != SyncOpKind::AtomicNotify {
                tracing::debug!(handle, kind = ?op.kind, ref_offset = op.ref_offset, "replaying sync op");
                shim.apply(handle, &op)?;
            }
            cur = lock(&self.sync_cursor);
            if !blocking {
                *cur += 1;
                self.sync_cv.notify_all();
            }
        }
    }
}

/// [`ExecHooks`] that connect an interpreter run to a [`CheckpointContext`].
pub struct CheckpointHooks<'a> {
    ctx: &'a CheckpointContext,
}

impl ExecHooks for CheckpointHooks<'_> {
    fn should_suspend(&mut self) -> bool { self.ctx.is_requested() }

    fn on_host_call(&mut self, _env: &ExecEnv) -> bool { self.ctx.count_host_call() }

    fn enter_host(&mut self, env: &ExecEnv) {
        match ExecEnvSnapshot::capture(env, &self.ctx.cx(false)) {
            Ok(snap) => {
                lock(&self.ctx.host_snapshots).insert(env.handle, snap);
                self.ctx.quiesce.checkpoint(env.handle);
            }
            Err(e) => tracing::warn!(handle = env.handle, error = %e, "cannot capture environment entering host"),
        }
    }

    fn leave_host(&mut self, env: &ExecEnv) {
        if lock(&self.ctx.host_snapshots).contains_key(&env.handle) {
            self.ctx.quiesce.uncheckpoint(env.handle);
            lock(&self.ctx.host_snapshots).remove(&env.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::{self, Outcome};
    use crate::types::{ValType, WasmValue};
    use std::sync::atomic::AtomicU32;

    const COUNTER: &str = r#"
        (module
          (import "env" "tick" (func $tick (result i32)))
          (memory 1)
          (func (export "run") (param i32) (result i32) (local i32)
            (block
              (loop
                (br_if 1 (i32.eqz (local.get 0)))
                (local.set 1 (i32.add (local.get 1) (call $tick)))
                (i32.store (i32.const 0) (local.get 1))
                (local.set 0 (i32.sub (local.get 0) (i32.const 1)))
                (br 0)))
            (local.get 1)))
    "#;

    fn imports(calls: Arc<AtomicU32>) -> Imports {
        Imports::new().func("env", "tick", vec![], vec![ValType::I32], move |_, _| {
            Ok(vec![WasmValue::from_u32(calls.fetch_add(1, Ordering::SeqCst) + 1)])
        })
    }

    fn module() -> Arc<Module> {
        Arc::new(Module::compile(wat::parse_str(COUNTER).unwrap()).unwrap())
    }

    #[test]
    fn threshold_suspends_before_the_call() {
        let config = RuntimeConfig { snapshot_threshold: 3, ..Default::default() };
        let ctx = CheckpointContext::new(config);
        let calls = Arc::new(AtomicU32::new(0));
        let inst = instantiate(module(), &imports(calls.clone()), InstanceOptions::default()).unwrap();
        let mut env = ExecEnv::new(inst, 1 << 16);
        ctx.register_env(&env);
        let run = env.module_inst.module.export_func("run").unwrap();
        let out = interp::invoke(&mut env, run, &[WasmValue::from_i32(5)], &mut ctx.hooks()).unwrap();
        assert_eq!(out, Outcome::Suspended);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.state(), CheckpointState::SnapshotRequested);

        let image = ctx.checkpoint(&[&env]).unwrap();
        assert_eq!(image.owner().unwrap(), 0);
        assert_eq!(ctx.state(), CheckpointState::Serializing);

        let target = CheckpointContext::new(RuntimeConfig::default());
        let mut envs = target.restore(&image, module(), &imports(calls.clone())).unwrap();
        assert_eq!(target.state(), CheckpointState::Running);
        let out = interp::resume(&mut envs[0], &mut target.hooks()).unwrap();
        // ticks 1..=5 whichever process served them
        assert_eq!(out, Outcome::Returned(vec![WasmValue::from_i32(15)]));
        let mem = envs[0].module_inst.memory(0).unwrap();
        assert_eq!(lock(&mem).load_i32(0, 0).unwrap(), 15);
    }

    #[test]
    fn image_without_owner_is_rejected() {
        let ctx = CheckpointContext::new(RuntimeConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let image = CheckpointImage::new(Vec::new());
        let Err(err) = ctx.restore(&image, module(), &imports(calls)) else { panic!("restored without an owner") };
        assert!(matches!(err, Error::Image(NO_MODULE_SNAPSHOT)));
        assert!(err.is_fatal());
    }

    struct Recorder(Mutex<Vec<(u64, SyncOpKind)>>);

    impl SyncShim for Recorder {
        fn apply(&self, handle: u64, op: &SyncOp) -> Result<(), Error> {
            lock(&self.0).push((handle, op.kind));
            Ok(())
        }
    }

    #[test]
    fn sync_ops_replay_in_recorded_order() {
        let ctx = Arc::new(CheckpointContext::new(RuntimeConfig::default()));
        let inst = instantiate(module(), &imports(Arc::new(AtomicU32::new(0))), InstanceOptions::default()).unwrap();
        let a = ExecEnv::new(inst.clone(), 1 << 12);
        let b = ExecEnv::new(inst, 1 << 12);
        ctx.register_env(&a);
        ctx.register_env(&b);
        {
            let mut wasi = ctx.wasi();
            wasi.insert_sync_op(a.handle, 8, SyncOpKind::MutexLock);
            wasi.insert_sync_op(b.handle, 8, SyncOpKind::MutexLock);
            wasi.insert_sync_op(999, 8, SyncOpKind::MutexUnlock);
            wasi.insert_sync_op(a.handle, 8, SyncOpKind::MutexUnlock);
            wasi.insert_atomic_notify(b.handle, 16, 1);
            wasi.insert_sync_op(b.handle, 8, SyncOpKind::CondSignal);
        }
        let rec = Arc::new(Recorder(Mutex::new(Vec::new())));
        let (ctx2, rec2, hb) = (ctx.clone(), rec.clone(), b.handle);
        let t = std::thread::spawn(move || ctx2.replay_sync_ops(hb, &*rec2));
        ctx.replay_sync_ops(a.handle, &*rec).unwrap();
        t.join().unwrap().unwrap();
        assert_eq!(*lock(&rec.0), vec![
            (a.handle, SyncOpKind::MutexLock),
            (b.handle, SyncOpKind::MutexLock),
            (a.handle, SyncOpKind::MutexUnlock),
            (b.handle, SyncOpKind::CondSignal),
        ]);
    }

    #[test]
    fn first_registration_owns_the_instance() {
        let ctx = CheckpointContext::new(RuntimeConfig::default());
        let inst = instantiate(module(), &imports(Arc::new(AtomicU32::new(0))), InstanceOptions::default()).unwrap();
        let a = ExecEnv::new(inst.clone(), 1 << 12);
        let b = ExecEnv::new(inst, 1 << 12);
        ctx.register_env(&a);
        ctx.register_env(&b);
        assert!(ctx.is_owner(&a));
        assert!(!ctx.is_owner(&b));
        assert_eq!(ctx.threads(), 2);
        ctx.unregister_env(&b);
        assert_eq!(ctx.threads(), 1);
    }
}
