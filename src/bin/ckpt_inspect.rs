use clap::Parser;
use serde_json::json;
use wasm_ckpt::snapshot::ExecEnvSnapshot;
use wasm_ckpt::CheckpointImage;

#[derive(Parser, Debug)]
#[command(name = "wasm-ckpt-inspect")]
#[command(about = "Inspect checkpoint images")]
#[command(long_about = "
wasm-ckpt-inspect - print a checkpoint image as JSON

Examples:
  # Per-thread summary: frames, labels, memory sizes, WASI resources
  wasm-ckpt-inspect app.ckpt

  # Every record, memory bytes included
  wasm-ckpt-inspect app.ckpt --full
")]
struct Args {
    /// Image path or tcp://addr:port to receive one
    image: String,

    /// Dump every record instead of a summary
    #[arg(long)]
    full: bool,
}

fn summarize(env: &ExecEnvSnapshot) -> serde_json::Value {
    let frames: Vec<_> = env.frames.iter().map(|f| json!({
        "function": f.function_name,
        "index": f.function_index,
        "ip_offset": f.ip_offset,
        "sp_offset": f.sp_offset,
        "labels": f.branch_blocks.len(),
    })).collect();
    let module = env.module_instance.as_ref().map(|m| json!({
        "memories": m.memories.iter().map(|mem| json!({
            "pages": mem.cur_page_count,
            "max_pages": mem.max_page_count,
            "shared": mem.is_shared,
            "heap_bytes": mem.heap_bytes.len(),
        })).collect::<Vec<_>>(),
        "tables": m.tables.iter().map(|t| t.cur_size).collect::<Vec<_>>(),
        "global_bytes": m.global_bytes.len(),
        "files": m.wasi_arguments.fd_map.iter().map(|(fd, e)| json!({
            "fd": fd, "path": e.path, "ops": e.ops.len(),
        })).collect::<Vec<_>>(),
        "sockets": m.wasi_arguments.socket_fd_map.iter().map(|(fd, s)| json!({
            "fd": fd, "tcp": s.is_tcp(), "server": s.is_server, "buffered": s.buffered_inbound.len(),
        })).collect::<Vec<_>>(),
        "sync_ops": m.wasi_arguments.sync_ops.len(),
    }));
    json!({
        "handle": env.thread_handle_value,
        "mode": env.running_mode,
        "frames": frames,
        "module_instance": module,
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let image = CheckpointImage::read_from(&args.image)
        .map_err(|e| format!("Failed to read image '{}': {}", args.image, e))?;

    let out = if args.full {
        serde_json::to_string_pretty(&image)?
    } else {
        let envs: Vec<_> = image.envs.iter().map(summarize).collect();
        serde_json::to_string_pretty(&json!({ "threads": envs.len(), "envs": envs }))?
    };
    println!("{}", out);
    Ok(())
}
