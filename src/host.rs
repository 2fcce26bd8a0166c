//! Host functions a guest links against under the `wasi_ckpt` module.
//!
//! Every call goes through the context's [`WasiShim`](crate::shim::WasiShim)
//! and is recorded into its WASI state, so a checkpoint knows which files
//! and sockets to bring back. A failed call returns `-1` to the guest.
//!
//! | field | params | result |
//! |---|---|---|
//! | `path_open` | `path_ptr, path_len, oflags` | fd |
//! | `fd_seek` | `fd, offset: i64, whence` | new position (i64) |
//! | `fd_read` | `fd, buf_ptr, len` | bytes read |
//! | `fd_write` | `fd, buf_ptr, len` | bytes written; fd 1 and 2 are stdout and stderr |
//! | `fd_close` | `fd` | 0 |
//! | `sock_open` | `domain, type` | fd |
//! | `sock_connect` | `fd, ipv4 (big endian), port` | 0 |

use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use crate::error::*;
use crate::instance::{Imports, ModuleInstance};
use crate::lock;
use crate::orchestrator::CheckpointContext;
use crate::shim::WHENCE_CUR;
use crate::types::ValType::{I32, I64};
use crate::types::WasmValue;
use crate::wasi::{AddrPool, FdOp};

pub const MODULE: &str = "wasi_ckpt";

fn status(call: &'static str, res: Result<i64, Error>) -> i64 {
    res.unwrap_or_else(|e| {
        tracing::debug!(call, error = %e, "host call failed");
        -1
    })
}

fn ret_i32(call: &'static str, res: Result<i64, Error>) -> Result<Vec<WasmValue>, Error> {
    Ok(vec![WasmValue::from_i32(status(call, res) as i32)])
}

fn read_guest(inst: &ModuleInstance, ptr: i32, len: i32) -> Result<Vec<u8>, Error> {
    let mem = inst.memory(0).ok_or(Error::Trap(OOB_MEMORY_ACCESS))?;
    let bytes = lock(&mem).read_bytes(ptr as u32, len as usize)?.to_vec();
    Ok(bytes)
}

fn write_guest(inst: &ModuleInstance, ptr: i32, bytes: &[u8]) -> Result<(), Error> {
    let mem = inst.memory(0).ok_or(Error::Trap(OOB_MEMORY_ACCESS))?;
    let result = lock(&mem).write_bytes(ptr as u32, bytes);
    result
}

/// Record where a tracked file's cursor ended up after a read or write.
fn record_position(ctx: &CheckpointContext, fd: i32, op: FdOp) -> Result<(), Error> {
    if !ctx.wasi().fd_map.contains_key(&fd) {
        return Ok(());
    }
    let pos = ctx.shim().seek(fd, 0, WHENCE_CUR)?;
    ctx.wasi().insert_fd(fd, "", WHENCE_CUR, pos as i64, op);
    Ok(())
}

/// The `wasi_ckpt` imports, bound to `ctx`.
pub fn host_imports(ctx: &Arc<CheckpointContext>) -> Imports {
    let open = ctx.clone();
    let seek = ctx.clone();
    let read = ctx.clone();
    let write = ctx.clone();
    let close = ctx.clone();
    let sock_open = ctx.clone();
    let sock_connect = ctx.clone();

    Imports::new()
        .func(MODULE, "path_open", vec![I32, I32, I32], vec![I32], move |inst, args| {
            let res = (|| -> Result<i64, Error> {
                let raw = read_guest(inst, args[0].as_i32(), args[1].as_i32())?;
                let path = String::from_utf8(raw).map_err(|_| Error::Malformed(INVALID_UTF8))?;
                let oflags = args[2].as_i32();
                let fd = open.shim().open(&path, oflags)?;
                open.wasi().insert_fd(fd, &path, oflags, 0, FdOp::Open);
                Ok(fd as i64)
            })();
            ret_i32("path_open", res)
        })
        .func(MODULE, "fd_seek", vec![I32, I64, I32], vec![I64], move |_, args| {
            let res = (|| -> Result<i64, Error> {
                let (fd, whence) = (args[0].as_i32(), args[2].as_i32());
                let pos = seek.shim().seek(fd, args[1].as_i64(), whence)? as i64;
                seek.wasi().insert_fd(fd, "", whence, pos, FdOp::Seek);
                Ok(pos)
            })();
            Ok(vec![WasmValue::from_i64(status("fd_seek", res))])
        })
        .func(MODULE, "fd_read", vec![I32, I32, I32], vec![I32], move |inst, args| {
            let res = (|| -> Result<i64, Error> {
                let fd = args[0].as_i32();
                let bytes = read.shim().read(fd, args[2].as_i32().max(0) as usize)?;
                write_guest(inst, args[1].as_i32(), &bytes)?;
                record_position(&read, fd, FdOp::Read)?;
                Ok(bytes.len() as i64)
            })();
            ret_i32("fd_read", res)
        })
        .func(MODULE, "fd_write", vec![I32, I32, I32], vec![I32], move |inst, args| {
            let res = (|| -> Result<i64, Error> {
                let fd = args[0].as_i32();
                let bytes = read_guest(inst, args[1].as_i32(), args[2].as_i32())?;
                let n = match fd {
                    1 => {
                        let mut out = std::io::stdout().lock();
                        out.write_all(&bytes)?;
                        out.flush()?;
                        bytes.len()
                    }
                    2 => {
                        std::io::stderr().write_all(&bytes)?;
                        bytes.len()
                    }
                    _ => {
                        let fd = write.wasi().get_sock_fd(fd);
                        let n = write.shim().write(fd, &bytes)?;
                        record_position(&write, fd, FdOp::Write)?;
                        n
                    }
                };
                Ok(n as i64)
            })();
            ret_i32("fd_write", res)
        })
        .func(MODULE, "fd_close", vec![I32], vec![I32], move |_, args| {
            let res = (|| -> Result<i64, Error> {
                let fd = args[0].as_i32();
                close.shim().close(close.wasi().get_sock_fd(fd))?;
                close.wasi().remove_fd(fd);
                Ok(0)
            })();
            ret_i32("fd_close", res)
        })
        .func(MODULE, "sock_open", vec![I32, I32], vec![I32], move |_, args| {
            let res = (|| -> Result<i64, Error> {
                let (domain, ty) = (args[0].as_i32(), args[1].as_i32());
                let fd = sock_open.shim().sock_open(domain, ty)?;
                sock_open.wasi().insert_socket(fd, domain, ty, 0);
                Ok(fd as i64)
            })();
            ret_i32("sock_open", res)
        })
        .func(MODULE, "sock_connect", vec![I32, I32, I32], vec![I32], move |_, args| {
            let res = (|| -> Result<i64, Error> {
                let fd = args[0].as_i32();
                let ip = Ipv4Addr::from(args[1].as_i32() as u32);
                let addr = SocketAddr::from((ip, args[2].as_i32() as u16));
                let live = sock_connect.wasi().get_sock_fd(fd);
                sock_connect.shim().sock_connect(live, addr)?;
                sock_connect.wasi().update_socket_fd_address(fd, AddrPool::from(addr));
                Ok(0)
            })();
            ret_i32("sock_connect", res)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::exec_env::ExecEnv;
    use crate::instance::{instantiate, InstanceOptions};
    use crate::interp::{invoke, Outcome};
    use crate::module::Module;
    use crate::shim::{DescriptorKind, WHENCE_SET};

    #[test]
    fn file_calls_are_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"0123456789").unwrap();
        let path = path.to_str().unwrap();
        let wat = format!(
            r#"(module
              (import "wasi_ckpt" "path_open" (func $open (param i32 i32 i32) (result i32)))
              (import "wasi_ckpt" "fd_read" (func $read (param i32 i32 i32) (result i32)))
              (import "wasi_ckpt" "fd_seek" (func $seek (param i32 i64 i32) (result i64)))
              (import "wasi_ckpt" "fd_write" (func $write (param i32 i32 i32) (result i32)))
              (memory 1)
              (data (i32.const 0) "{path}")
              (func (export "main") (result i32) (local $fd i32)
                (local.set $fd (call $open (i32.const 0) (i32.const {len}) (i32.const 0)))
                (drop (call $seek (local.get $fd) (i64.const 2) (i32.const {set})))
                (drop (call $read (local.get $fd) (i32.const 512) (i32.const 3)))
                (drop (call $write (local.get $fd) (i32.const 512) (i32.const 1)))
                (drop (call $read (i32.const 99) (i32.const 512) (i32.const 1)))
                (local.get $fd)))"#,
            len = path.len(),
            set = WHENCE_SET,
        );
        let module = Arc::new(Module::compile(wat::parse_str(&wat).unwrap()).unwrap());
        let ctx = Arc::new(CheckpointContext::new(RuntimeConfig::default()));
        let inst = instantiate(module.clone(), &host_imports(&ctx), InstanceOptions::default()).unwrap();
        let mut env = ExecEnv::new(inst.clone(), 1 << 12);
        let main = module.export_func("main").unwrap();
        let Outcome::Returned(out) = invoke(&mut env, main, &[], &mut ctx.hooks()).unwrap() else { panic!("suspended") };
        let fd = out[0].as_i32();

        assert_eq!(ctx.shim().kind(fd), Some(DescriptorKind::File));
        let mem = inst.memory(0).unwrap();
        assert_eq!(lock(&mem).read_bytes(512, 3).unwrap(), b"234");
        let wasi = ctx.wasi();
        let entry = &wasi.fd_map[&fd];
        assert_eq!(entry.path, path);
        // open, then the cursor after the write
        assert_eq!(entry.ops, vec![(0, 0, FdOp::Open), (WHENCE_CUR, 6, FdOp::Seek)]);
        assert!(!wasi.fd_map.contains_key(&99));
        drop(wasi);
        assert_eq!(std::fs::read(path).unwrap(), b"0123426789");
    }
}
