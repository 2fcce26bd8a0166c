use std::net::{Ipv4Addr, Ipv6Addr, TcpListener};
use std::sync::Arc;

use wasm_ckpt::gateway::FixedGateway;
use wasm_ckpt::shim::{DescriptorKind, DOMAIN_INET4, OFLAG_CREAT, SOCK_STREAM, WHENCE_CUR, WHENCE_SET};
use wasm_ckpt::wasi::{AddrPool, FdOp};
use wasm_ckpt::{
    instantiate, CheckpointContext, CheckpointImage, ExecEnv, Imports, InstanceOptions, Module, Policy, RuntimeConfig,
};

const APP: &str = r#"(module (memory 1) (func (export "main")))"#;

fn module() -> Arc<Module> {
    Arc::new(Module::compile(wat::parse_str(APP).unwrap()).unwrap())
}

fn loopback() -> Box<FixedGateway> {
    Box::new(FixedGateway::new(Ipv4Addr::LOCALHOST, Ipv6Addr::LOCALHOST))
}

/// Record what a guest did in process A and return the image.
fn checkpoint_with_resources(policy: Policy, file: &str, peer: &TcpListener) -> (CheckpointImage, i32, i32) {
    let config = RuntimeConfig { policy, ..Default::default() };
    let ctx = CheckpointContext::new(config).with_reconnect(loopback());
    let shim = ctx.shim();

    // burn a descriptor so the real file does not land on the first slot
    let scratch = shim.open(file, OFLAG_CREAT).unwrap();
    shim.close(scratch).unwrap();

    let fd = shim.open(file, 0).unwrap();
    shim.seek(fd, 3, WHENCE_SET).unwrap();
    shim.seek(fd, 5, WHENCE_CUR).unwrap();
    let sock = shim.sock_open(DOMAIN_INET4, SOCK_STREAM).unwrap();
    let peer_addr = peer.local_addr().unwrap();
    shim.sock_connect(sock, peer_addr).unwrap();
    peer.accept().unwrap();
    {
        let mut wasi = ctx.wasi();
        wasi.insert_fd(fd, file, 0, 0, FdOp::Open);
        wasi.insert_fd(fd, "", WHENCE_SET, 3, FdOp::Write);
        wasi.insert_fd(fd, "", WHENCE_CUR, 8, FdOp::Write);
        wasi.insert_fd(42, "/nonexistent/dir/data.bin", 0, 0, FdOp::Open);
        wasi.insert_socket(sock, DOMAIN_INET4, SOCK_STREAM, 0);
        wasi.update_socket_fd_address(sock, AddrPool::from(peer_addr));
    }

    let inst = instantiate(module(), &Imports::new(), InstanceOptions::default()).unwrap();
    let env = ExecEnv::new(inst, 1 << 12);
    ctx.register_env(&env);
    (ctx.checkpoint(&[&env]).unwrap(), fd, sock)
}

fn restore_and_check(policy: Policy) {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("data.bin");
    std::fs::write(&file, b"0123456789abcdef").unwrap();
    let file = file.to_str().unwrap();
    let peer = TcpListener::bind("127.0.0.1:0").unwrap();

    let (image, fd, sock) = checkpoint_with_resources(policy, file, &peer);
    let image = CheckpointImage::decode(&image.encode().unwrap()).unwrap();
    let wasi = &image.envs[image.owner().unwrap()].module_instance.as_ref().unwrap().wasi_arguments;
    assert_eq!(wasi.fd_map[&fd].ops.len(), 2);

    let ctx = CheckpointContext::new(RuntimeConfig { policy, ..Default::default() }).with_reconnect(loopback());
    ctx.restore(&image, module(), &Imports::new()).unwrap();

    // the reconnect arrives at the same peer
    peer.accept().unwrap();

    let shim = ctx.shim();
    assert_eq!(shim.kind(fd), Some(DescriptorKind::File));
    assert_eq!(shim.seek(fd, 0, WHENCE_CUR).unwrap(), 8);
    let live = ctx.wasi();
    assert_eq!(shim.kind(live.get_sock_fd(sock)), Some(DescriptorKind::Stream));
    assert!(live.failed.contains(&42));
    assert!(!live.failed.contains(&fd));
    assert!(live.restored);
}

#[test]
fn files_and_sockets_come_back_under_their_numbers() {
    restore_and_check(Policy::Replay);
}

#[test]
fn compression_policy_lands_on_the_same_offset() {
    restore_and_check(Policy::Compression);
}
