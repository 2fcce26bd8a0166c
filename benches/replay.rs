use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use wasm_ckpt::blocks::compute_block_stack_at;
use wasm_ckpt::{
    instantiate, invoke, opcodes, CheckpointContext, CheckpointImage, ExecEnv, Imports, InstanceOptions, Module,
    Outcome, RuntimeConfig, WasmValue,
};

/// A function whose body is `depth` nested blocks around a counting loop.
fn nested_wat(depth: usize) -> String {
    let mut body = String::from("(loop (local.set 1 (i32.add (local.get 1) (local.get 0))) (br_if 0 (local.tee 0 (i32.sub (local.get 0) (i32.const 1)))))");
    for _ in 0..depth {
        body = format!("(block {} (nop))", body);
    }
    format!(
        r#"(module (memory 4)
             (func (export "work") (param i32) (result i32) (local i32)
               {} (local.get 1)))"#,
        body
    )
}

fn setup(depth: usize) -> Arc<Module> {
    let bytes = wat::parse_str(nested_wat(depth)).expect("assemble nested module");
    Arc::new(Module::compile(bytes).expect("compile nested module"))
}

fn bench_csp_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("csp_replay");
    group.measurement_time(Duration::from_secs(5));
    for depth in [4usize, 64, 512] {
        let module = setup(depth);
        let func = &module.functions[module.export_func("work").expect("export work") as usize];
        let target = (func.body.start..func.body.end)
            .rev()
            .find(|&p| module.bytes[p] == opcodes::BR_IF)
            .expect("br_if in body");
        group.throughput(Throughput::Bytes(func.body.len() as u64));
        group.bench_function(format!("depth_{depth}"), |b| {
            b.iter(|| {
                let blocks = compute_block_stack_at(&module, func, black_box(target)).expect("replay");
                black_box(blocks)
            })
        });
    }
    group.finish();
}

fn bench_image_encode(c: &mut Criterion) {
    let module = setup(16);
    let inst = instantiate(module.clone(), &Imports::new(), InstanceOptions::default()).expect("instantiate");
    let ctx = CheckpointContext::new(RuntimeConfig::default());
    let mut env = ExecEnv::new(inst, 1 << 16);
    ctx.register_env(&env);
    let func = module.export_func("work").expect("export work");
    let f = &module.functions[func as usize];
    let target = (f.body.start..f.body.end).find(|&p| module.bytes[p] == opcodes::BR_IF).expect("br_if in body");
    env.breakpoint = Some((func, (target - f.code_start()) as u32));
    let out = invoke(&mut env, func, &[WasmValue::from_i32(100)], &mut wasm_ckpt::NoHooks).expect("invoke");
    assert_eq!(out, Outcome::Suspended);
    let image = ctx.checkpoint(&[&env]).expect("checkpoint");
    let bytes = image.encode().expect("encode");

    let mut group = c.benchmark_group("image");
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("encode", |b| b.iter(|| black_box(image.encode().expect("encode"))));
    group.bench_function("decode", |b| b.iter(|| black_box(CheckpointImage::decode(black_box(&bytes)).expect("decode"))));
    group.finish();
}

criterion_group!(benches, bench_csp_replay, bench_image_encode);
criterion_main!(benches);
