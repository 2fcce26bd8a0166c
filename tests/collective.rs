use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use wasm_ckpt::{
    instantiate, invoke, resume, CheckpointContext, CheckpointImage, ExecEnv, Imports, InstanceOptions, Module,
    NoHooks, Outcome, RuntimeConfig, WasmValue,
};

/// Each thread counts into its own memory slot until the shared limit.
const COUNTERS: &str = r#"
    (module
      (memory 1)
      (global $limit (mut i32) (i32.const 0x7fffffff))
      (func (export "count") (param $id i32) (result i32) (local $acc i32)
        (loop $l
          (local.set $acc (i32.add (local.get $acc) (i32.const 1)))
          (i32.store (i32.shl (local.get $id) (i32.const 2)) (local.get $acc))
          (br_if $l (i32.lt_u (local.get $acc) (global.get $limit))))
        (local.get $acc)))
"#;

fn module() -> Arc<Module> {
    Arc::new(Module::compile(wat::parse_str(COUNTERS).unwrap()).unwrap())
}

#[test]
fn threads_checkpoint_together_and_resume_together() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("threads.ckpt").to_str().unwrap().to_string();

    let module_a = module();
    let inst = instantiate(module_a.clone(), &Imports::new(), InstanceOptions::default()).unwrap();
    let ctx = Arc::new(CheckpointContext::new(RuntimeConfig::default()));
    let count = module_a.export_func("count").unwrap();
    let envs: Vec<ExecEnv> = (0..2).map(|_| ExecEnv::new(inst.clone(), 1 << 12)).collect();
    for env in &envs {
        ctx.register_env(env);
    }
    let owner = envs[0].handle;

    let (done_tx, done_rx) = mpsc::channel();
    for (id, mut env) in envs.into_iter().enumerate() {
        let (ctx, path, done_tx) = (ctx.clone(), path.clone(), done_tx.clone());
        std::thread::spawn(move || {
            let out = invoke(&mut env, count, &[WasmValue::from_i32(id as i32)], &mut ctx.hooks()).unwrap();
            assert_eq!(out, Outcome::Suspended);
            // only the coordinator comes back
            ctx.submit(&env, &path).unwrap();
            done_tx.send(env.handle).unwrap();
        });
    }
    std::thread::sleep(Duration::from_millis(20));
    ctx.request_checkpoint();
    done_rx.recv_timeout(Duration::from_secs(60)).unwrap();

    let image = CheckpointImage::read_from(&path).unwrap();
    assert_eq!(image.envs.len(), 2);
    assert_eq!(image.envs[image.owner().unwrap()].thread_handle_value, owner);
    assert!(image.envs.iter().all(|e| e.frames.len() == 1));

    let ctx_b = CheckpointContext::new(RuntimeConfig::default());
    let mut restored = ctx_b.restore(&image, module(), &Imports::new()).unwrap();
    assert_eq!(restored[0].handle, owner);
    assert!(Arc::ptr_eq(&restored[0].module_inst, &restored[1].module_inst));
    assert_eq!(ctx_b.threads(), 2);

    let inst_b = restored[0].module_inst.clone();
    let mem = inst_b.memory(0).unwrap();
    let frozen: Vec<i32> = (0..2).map(|id| mem.lock().unwrap().load_i32(id * 4, 0).unwrap()).collect();
    assert!(frozen.iter().all(|&c| c > 0));
    inst_b.set_global(0, WasmValue::from_i32(0)).unwrap();

    for env in &mut restored {
        let Outcome::Returned(vals) = resume(env, &mut NoHooks).unwrap() else { panic!("suspended again") };
        let counted = vals[0].as_i32();
        let slot = (0..2u32).find(|&id| {
            mem.lock().unwrap().load_i32(id * 4, 0).unwrap() == counted
        });
        assert!(slot.is_some(), "result {counted} not found in memory");
        assert!(frozen.iter().any(|&c| c + 1 == counted));
    }
}
