use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use wasm_ckpt::{
    host_imports, instantiate, invoke, resume, CheckpointContext, ExecEnv, InstanceOptions, Module, Outcome, Policy,
    RunningMode, RuntimeConfig, WasmValue,
};

#[derive(Parser, Debug)]
#[command(name = "wasm-ckpt-run")]
#[command(about = "Run a WebAssembly module with checkpoint/restore support")]
#[command(long_about = "
wasm-ckpt-run - run a WebAssembly module that can be checkpointed and restored

Ctrl-C, or reaching --threshold host calls, stops every thread at its next
safepoint and writes a checkpoint image. Restoring continues from there.
Modules may import the wasi_ckpt host functions (path_open, fd_seek,
fd_read, fd_write, fd_close, sock_open, sock_connect); files and sockets
opened through them come back on restore.

Examples:
  # Invoke a function, checkpoint to a file on Ctrl-C
  wasm-ckpt-run app.wasm --invoke main --checkpoint-to app.ckpt

  # Pass arguments (value:type, i32/i64/f32/f64)
  wasm-ckpt-run app.wat --invoke add --args 10:i32 20:i32

  # Restore and continue
  wasm-ckpt-run app.wasm --restore app.ckpt

  # Stream a checkpoint to another host
  wasm-ckpt-run app.wasm --invoke main --checkpoint-to tcp://10.0.0.2:9000
")]
struct Args {
    /// Path to the WebAssembly module (.wasm or .wat)
    wasm_file: PathBuf,

    /// Function to invoke (defaults to _start)
    #[arg(short, long)]
    invoke: Option<String>,

    /// Arguments to pass to the function (format: value:type, e.g., 42:i32)
    #[arg(short, long, value_delimiter = ' ', num_args = 0..)]
    args: Vec<String>,

    /// TOML runtime configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Restore from an image path or tcp://addr:port instead of invoking
    #[arg(short, long)]
    restore: Option<String>,

    /// Where checkpoint images go: a path or tcp://addr:port
    #[arg(long, default_value = "checkpoint.img")]
    checkpoint_to: String,

    /// Checkpoint on the Nth host call
    #[arg(long)]
    threshold: Option<u64>,

    #[arg(long, value_enum)]
    policy: Option<Policy>,

    #[arg(long, value_enum)]
    running_mode: Option<RunningMode>,

    /// Operand stack budget per thread, in bytes
    #[arg(long)]
    stack_size: Option<usize>,

    /// Bound on socket draining at checkpoint time
    #[arg(long)]
    drain_timeout_ms: Option<u64>,

    /// Directory mappings, guest::host
    #[arg(long)]
    map_dir: Vec<String>,

    /// Send suspend/resume messages to the gateway
    #[arg(long)]
    gateway_notify: bool,

    /// Enable debug output
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn runtime_config(&self) -> Result<RuntimeConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::load(path)?,
            None => RuntimeConfig::default(),
        };
        if let Some(t) = self.threshold { config.snapshot_threshold = t; }
        if let Some(p) = self.policy { config.policy = p; }
        if let Some(m) = self.running_mode { config.running_mode = m; }
        if let Some(s) = self.stack_size { config.stack_size = s; }
        if let Some(ms) = self.drain_timeout_ms { config.drain_timeout_ms = Some(ms); }
        config.map_dirs.extend(self.map_dir.iter().cloned());
        config.gateway.notify |= self.gateway_notify;
        Ok(config)
    }
}

fn parse_value(arg: &str) -> Result<WasmValue, String> {
    let (value_str, type_str) = arg.split_once(':')
        .ok_or_else(|| format!("Invalid argument format '{}'. Expected format: value:type (e.g., 42:i32)", arg))?;

    match type_str {
        "i32" => value_str.parse::<i32>().map(WasmValue::from_i32)
            .map_err(|_| format!("Failed to parse '{}' as i32", value_str)),
        "i64" => value_str.parse::<i64>().map(WasmValue::from_i64)
            .map_err(|_| format!("Failed to parse '{}' as i64", value_str)),
        "f32" => value_str.parse::<f32>().map(WasmValue::from_f32)
            .map_err(|_| format!("Failed to parse '{}' as f32", value_str)),
        "f64" => value_str.parse::<f64>().map(WasmValue::from_f64)
            .map_err(|_| format!("Failed to parse '{}' as f64", value_str)),
        _ => Err(format!("Unknown type '{}'. Supported types: i32, i64, f32, f64", type_str)),
    }
}

fn load_module(path: &PathBuf) -> Result<Module, Box<dyn std::error::Error>> {
    let bytes = if path.extension().and_then(|s| s.to_str()) == Some("wat") {
        wat::parse_file(path).map_err(|e| format!("Failed to compile WAT file: {}", e))?
    } else {
        fs::read(path).map_err(|e| format!("Failed to read WASM file: {}", e))?
    };
    tracing::debug!(bytes = bytes.len(), path = %path.display(), "module loaded");
    Ok(Module::compile(bytes).map_err(|e| format!("Failed to compile module: {}", e))?)
}

/// Run one thread to completion or to a checkpoint.
fn finish(ctx: &CheckpointContext, env: &mut ExecEnv, outcome: Outcome, target: &str) -> Result<(), String> {
    match outcome {
        Outcome::Returned(results) => {
            ctx.unregister_env(env);
            if !results.is_empty() {
                println!("Result:");
                for (i, r) in results.iter().enumerate() {
                    println!("  [{}] {} (i32) / {} (i64)", i, r.as_i32(), r.as_i64());
                }
            }
            Ok(())
        }
        Outcome::Suspended => {
            ctx.submit(env, target).map_err(|e| format!("Checkpoint failed: {}", e))?;
            println!("Checkpoint written to {}", target);
            std::process::exit(0)
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let config = args.runtime_config()?;
    let module = Arc::new(load_module(&args.wasm_file)?);
    let ctx = Arc::new(CheckpointContext::new(config));
    {
        let ctx = ctx.clone();
        ctrlc::set_handler(move || ctx.request_checkpoint())?;
    }
    let imports = host_imports(&ctx);
    let target = args.checkpoint_to.as_str();

    if let Some(source) = &args.restore {
        let envs = ctx.restore_or_exit(source, module, &imports);
        tracing::info!(threads = envs.len(), "resuming restored threads");
        let ctx = &*ctx;
        std::thread::scope(|s| {
            let handles: Vec<_> = envs
                .into_iter()
                .map(|mut env| s.spawn(move || {
                    let outcome = resume(&mut env, &mut ctx.hooks()).map_err(|e| format!("Execution failed: {}", e))?;
                    finish(ctx, &mut env, outcome, target)
                }))
                .collect();
            for h in handles {
                h.join().map_err(|_| "thread panicked".to_string())??;
            }
            Ok::<_, Box<dyn std::error::Error>>(())
        })?;
        return Ok(());
    }

    let opts = InstanceOptions {
        heap_size: ctx.config().heap_size,
        stack_size: ctx.config().stack_size,
        run_start: true,
    };
    let inst = instantiate(module.clone(), &imports, opts).map_err(|e| format!("Failed to instantiate module: {}", e))?;
    let func_name = args.invoke.as_deref().unwrap_or("_start");
    let func = module.export_func(func_name).map_err(|_| format!("Function '{}' not found in exports", func_name))?;

    let wasm_args = args.args.iter().map(|a| parse_value(a)).collect::<Result<Vec<_>, _>>()?;
    let expected = module.functions[func as usize].ty.params.len();
    if wasm_args.len() != expected {
        return Err(format!(
            "Function '{}' expects {} arguments, but {} provided",
            func_name, expected, wasm_args.len()
        ).into());
    }

    let mut env = ExecEnv::new(inst, ctx.config().stack_size);
    ctx.register_env(&env);
    tracing::debug!(function = func_name, args = wasm_args.len(), "invoking");
    let outcome = invoke(&mut env, func, &wasm_args, &mut ctx.hooks()).map_err(|e| format!("Execution failed: {}", e))?;
    finish(&ctx, &mut env, outcome, target)?;
    Ok(())
}
