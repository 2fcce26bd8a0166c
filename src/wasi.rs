//! Live WASI resource bookkeeping.
//!
//! Syscall trampolines call the `insert_*`/`remove_*` hooks as the guest
//! runs, so at checkpoint time every open file is described by the log of
//! operations that produced its current state and every socket by the
//! metadata needed to recreate it. Restore replays those records through a
//! [`WasiShim`] in the new process.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::Policy;
use crate::error::*;
use crate::gateway::{OpData, ReconnectStrategy};
use crate::shim::{self, WasiShim, SOCK_DGRAM, WHENCE_CUR, WHENCE_SET};

const RECV_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FdOp {
    Open = 0,
    Write = 1,
    Read = 2,
    Seek = 3,
    Rename = 4,
}

/// `(flags, offset, op)`. For seeks `flags` is the whence.
pub type FdOpEntry = (i32, i64, FdOp);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdEntry {
    pub path: String,
    pub ops: Vec<FdOpEntry>,
}

/// IPv4 or IPv6 address plus port, kept in a form that survives a move
/// between hosts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrPool {
    pub ip4: [u8; 4],
    pub ip6: [u16; 8],
    pub is_4: bool,
    pub port: u16,
}

impl AddrPool {
    pub fn to_socket_addr(&self) -> SocketAddr {
        if self.is_4 {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::from(self.ip4)), self.port)
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(self.ip6)), self.port)
        }
    }
}

impl From<SocketAddr> for AddrPool {
    fn from(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => Self { ip4: ip.octets(), is_4: true, port: addr.port(), ..Default::default() },
            IpAddr::V6(ip) => Self { ip6: ip.segments(), is_4: false, port: addr.port(), ..Default::default() },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecvFromData {
    pub payload: Vec<u8>,
    pub src: AddrPool,
    pub flags: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketMetaData {
    pub domain: i32,
    pub ty: i32,
    pub protocol: i32,
    pub local_address: AddrPool,
    pub is_server: bool,
    pub buffered_inbound: Vec<RecvFromData>,
    pub replay_cursor: usize,
    /// Set while a checkpoint drains the socket; a FIN sentinel clears it.
    #[serde(skip)]
    pub is_collection: bool,
}

impl SocketMetaData {
    pub fn is_tcp(&self) -> bool { self.ty != SOCK_DGRAM }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOpKind {
    MutexLock,
    MutexUnlock,
    CondWait,
    CondSignal,
    CondBroadcast,
    AtomicWait,
    AtomicNotify,
}

/// One cross-thread synchronisation event. `ref_offset` is the address of
/// the primitive in linear memory 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOp {
    pub tid: u64,
    pub ref_offset: u32,
    pub kind: SyncOpKind,
    pub expected: u64,
    pub is_64bit: bool,
}

/// The process-wide WASI state that a checkpoint carries.
#[derive(Debug, Default)]
pub struct WasiContext {
    pub dirs: Vec<String>,
    pub map_dirs: Vec<String>,
    pub envs: Vec<String>,
    pub args: Vec<String>,
    pub addr_pool: Vec<String>,
    pub ns_lookup: Vec<String>,
    pub fd_map: BTreeMap<i32, FdEntry>,
    pub socket_fd_map: BTreeMap<i32, SocketMetaData>,
    /// Guest socket number to the descriptor that replaced it after restore.
    pub new_sock_map: BTreeMap<i32, i32>,
    pub sync_ops: Vec<SyncOp>,
    /// Thread handle to `(start_arg, virtual tid)`.
    pub tid_start_arg_map: BTreeMap<u64, (u32, u32)>,
    /// Child thread handle to parent thread handle.
    pub child_tid_map: BTreeMap<u64, u64>,
    /// Recorded thread handle to the handle of its restored successor.
    pub tid_map: BTreeMap<u64, u64>,
    /// Resources whose replay failed; they stay unusable.
    pub failed: BTreeSet<i32>,
    pub restored: bool,
}

impl WasiContext {
    pub fn new() -> Self { Self::default() }

    // ---------------- Files ----------------

    pub fn insert_fd(&mut self, fd: i32, path: &str, flags: i32, offset: i64, op: FdOp) {
        if fd <= 2 {
            return;
        }
        tracing::trace!(fd, path, flags, offset, ?op, "insert_fd");
        let entry = self.fd_map.entry(fd).or_default();
        if !path.is_empty() {
            entry.ops.push((flags, offset, op));
            entry.path = path.to_string();
        } else if entry.ops.len() == 1 {
            entry.ops.push((flags, offset, FdOp::Seek));
        } else if let Some(last) = entry.ops.last_mut() {
            *last = (WHENCE_CUR, offset, FdOp::Seek);
        } else {
            entry.ops.push((flags, offset, FdOp::Seek));
        }
    }

    pub fn rename_fd(&mut self, old_fd: i32, old_path: &str, new_fd: i32, new_path: &str) {
        let Some(mut entry) = self.fd_map.remove(&old_fd) else {
            tracing::debug!(old_fd, "rename of unknown fd");
            return;
        };
        if old_path.is_empty() {
            entry.path = new_path.to_string();
        }
        entry.ops.push((0, 0, FdOp::Rename));
        self.fd_map.insert(new_fd, entry);
    }

    pub fn remove_fd(&mut self, fd: i32) {
        if self.fd_map.remove(&fd).is_none() && self.socket_fd_map.remove(&fd).is_none() {
            tracing::debug!(fd, "close of untracked fd");
        }
    }

    // ---------------- Sockets ----------------

    /// `protocol == 1` marks a listening socket; a larger value names the
    /// listening socket this one was accepted from.
    pub fn insert_socket(&mut self, fd: i32, domain: i32, ty: i32, protocol: i32) {
        if self.socket_fd_map.contains_key(&fd) {
            tracing::debug!(fd, "socket already tracked");
            return;
        }
        let local_address = if protocol > 1 {
            self.socket_fd_map.get(&protocol).map(|m| m.local_address).unwrap_or_default()
        } else {
            AddrPool::default()
        };
        self.socket_fd_map.insert(fd, SocketMetaData {
            domain,
            ty,
            protocol,
            local_address,
            is_server: protocol == 1,
            ..Default::default()
        });
    }

    pub fn update_socket_fd_address(&mut self, fd: i32, addr: AddrPool) {
        let meta = self.socket_fd_map.entry(fd).or_default();
        meta.local_address = addr;
    }

    pub fn insert_sock_recv_from_data(&mut self, fd: i32, payload: &[u8], flags: u16, src: AddrPool) {
        let Some(meta) = self.socket_fd_map.get_mut(&fd) else {
            tracing::debug!(fd, "recv on untracked socket");
            return;
        };
        if meta.is_collection {
            meta.replay_cursor += 1;
        }
        if OpData::is_fin(payload) {
            meta.is_collection = false;
            return;
        }
        meta.buffered_inbound.push(RecvFromData { payload: payload.to_vec(), src, flags });
    }

    /// Next buffered datagram for a restored socket, in arrival order.
    pub fn replay_sock_recv_from_data(&mut self, fd: i32) -> Option<RecvFromData> {
        let meta = self.socket_fd_map.get_mut(&fd)?;
        let data = meta.buffered_inbound.get(meta.replay_cursor)?.clone();
        meta.replay_cursor += 1;
        Some(data)
    }

    pub fn get_sock_fd(&self, fd: i32) -> i32 {
        if self.socket_fd_map.contains_key(&fd) {
            self.new_sock_map.get(&fd).copied().unwrap_or(fd)
        } else {
            fd
        }
    }

    pub fn has_tcp(&self) -> bool { self.socket_fd_map.values().any(SocketMetaData::is_tcp) }

    pub fn has_tcp_server(&self) -> bool {
        self.socket_fd_map.values().any(|m| m.is_tcp() && m.is_server)
    }

    // ---------------- Threads ----------------

    pub fn insert_sync_op(&mut self, tid: u64, ref_offset: u32, kind: SyncOpKind) {
        self.sync_ops.push(SyncOp { tid, ref_offset, kind, expected: 0, is_64bit: false });
    }

    pub fn insert_atomic_wait(&mut self, tid: u64, ref_offset: u32, expected: u64, is_64bit: bool) {
        self.sync_ops.push(SyncOp { tid, ref_offset, kind: SyncOpKind::AtomicWait, expected, is_64bit });
    }

    /// A wake satisfies every wait recorded on `ref_offset`.
    pub fn atomic_wake(&mut self, ref_offset: u32) {
        self.sync_ops.retain(|op| op.ref_offset != ref_offset);
    }

    pub fn insert_atomic_notify(&mut self, tid: u64, ref_offset: u32, count: u32) {
        self.sync_ops.push(SyncOp {
            tid,
            ref_offset,
            kind: SyncOpKind::AtomicNotify,
            expected: count as u64,
            is_64bit: false,
        });
    }

    pub fn insert_tid_start_arg(&mut self, tid: u64, start_arg: u32, vtid: u32) {
        self.tid_start_arg_map.insert(tid, (start_arg, vtid));
    }

    pub fn map_handle(&mut self, old: u64, new: u64) {
        tracing::debug!(old, new, "thread handle remapped");
        self.tid_map.insert(old, new);
    }

    pub fn insert_parent_child(&mut self, parent: u64, child: u64) {
        self.child_tid_map.insert(child, parent);
    }

    pub fn vtid_of(&self, tid: u64) -> Option<u32> {
        self.tid_start_arg_map.get(&tid).map(|&(_, vtid)| vtid)
    }

    // ---------------- Checkpoint / restore ----------------

    /// Pull every byte a peer still has in flight on sockets that saw
    /// traffic, until the peer's FIN sentinel. Listening sockets are left
    /// alone. A timeout keeps what arrived so far.
    pub fn drain_sockets(&mut self, shim: &dyn WasiShim, timeout: Option<Duration>) -> Result<(), Error> {
        let fds: Vec<i32> = self.socket_fd_map
            .iter()
            .filter(|(_, m)| !m.buffered_inbound.is_empty() && !(m.is_tcp() && m.is_server))
            .map(|(&fd, _)| fd)
            .collect();
        for fd in fds {
            let Some(meta) = self.socket_fd_map.get_mut(&fd) else { continue };
            meta.is_collection = true;
            let is_tcp = meta.is_tcp();
            let src = meta.local_address;
            let live = self.new_sock_map.get(&fd).copied().unwrap_or(fd);
            tracing::debug!(fd, is_tcp, "draining socket");
            if is_tcp {
                self.drain_stream(shim, fd, live, src, timeout)?;
            } else {
                while self.socket_fd_map.get(&fd).is_some_and(|m| m.is_collection) {
                    match shim.recv_from(live, RECV_CHUNK, timeout) {
                        Ok((payload, from)) => self.insert_sock_recv_from_data(fd, &payload, 0, from.into()),
                        Err(e) if shim::is_timeout(&e) => {
                            tracing::warn!(fd, "socket drain timed out, keeping partial data");
                            break;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            if let Some(meta) = self.socket_fd_map.get_mut(&fd) {
                meta.is_collection = false;
            }
        }
        Ok(())
    }

    /// A stream has no message boundaries: the FIN may share a read with
    /// the last data bytes or straddle two reads. Everything up to the FIN
    /// is kept as one record.
    fn drain_stream(&mut self, shim: &dyn WasiShim, fd: i32, live: i32, src: AddrPool, timeout: Option<Duration>) -> Result<(), Error> {
        let mut stream = Vec::new();
        loop {
            match shim.recv(live, RECV_CHUNK, timeout) {
                Ok(chunk) if chunk.is_empty() => {
                    tracing::warn!(fd, "peer closed before FIN");
                    break;
                }
                Ok(chunk) => {
                    stream.extend_from_slice(&chunk);
                    if let Some(split) = OpData::data_before_fin(&stream) {
                        let fin = stream.split_off(split);
                        if !stream.is_empty() {
                            self.insert_sock_recv_from_data(fd, &stream, 0, src);
                        }
                        self.insert_sock_recv_from_data(fd, &fin, 0, src);
                        return Ok(());
                    }
                }
                Err(e) if shim::is_timeout(&e) => {
                    tracing::warn!(fd, bytes = stream.len(), "socket drain timed out, keeping partial data");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        if !stream.is_empty() {
            self.insert_sock_recv_from_data(fd, &stream, 0, src);
        }
        Ok(())
    }

    /// Bring files and sockets back in a fresh process. Runs once; later
    /// calls are no-ops.
    pub fn replay(&mut self, shim: &dyn WasiShim, policy: Policy, reconnect: &dyn ReconnectStrategy) {
        if self.restored {
            return;
        }
        self.restored = true;
        self.replay_files(shim, policy);
        self.replay_sockets(shim, reconnect);
    }

    fn replay_files(&mut self, shim: &dyn WasiShim, policy: Policy) {
        let entries: Vec<(i32, FdEntry)> = self.fd_map.iter().map(|(&fd, e)| (fd, e.clone())).collect();
        for (fd, entry) in entries {
            if let Err(e) = replay_fd(shim, fd, &entry, policy) {
                tracing::warn!(fd, path = %entry.path, error = %e, "file replay failed");
                self.failed.insert(fd);
            }
        }
    }

    fn replay_sockets(&mut self, shim: &dyn WasiShim, reconnect: &dyn ReconnectStrategy) {
        let sockets: Vec<(i32, SocketMetaData)> = self.socket_fd_map
            .iter()
            .map(|(&fd, m)| (fd, m.clone()))
            .collect();
        // Clients first so a server-side accept finds its peer already connecting.
        let (servers, clients): (Vec<_>, Vec<_>) = sockets.into_iter().partition(|(_, m)| m.is_server);
        for (fd, meta) in clients.iter().chain(servers.iter()) {
            let res = if meta.is_server {
                replay_server(shim, *fd, meta, reconnect)
            } else {
                replay_client(shim, *fd, meta, reconnect)
            };
            match res {
                Ok(Some(new_fd)) => {
                    self.new_sock_map.insert(*fd, new_fd);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(fd, error = %e, "socket replay failed");
                    self.failed.insert(*fd);
                }
            }
        }
    }
}

fn replay_fd(shim: &dyn WasiShim, fd: i32, entry: &FdEntry, policy: Policy) -> Result<(), Error> {
    for &(flags, offset, op) in &entry.ops {
        match (policy, op) {
            (_, FdOp::Open) => {
                let got = shim.open(&entry.path, flags)?;
                if got != fd {
                    shim.renumber(got, fd)?;
                }
            }
            (_, FdOp::Rename) => {}
            (Policy::Replay, FdOp::Read | FdOp::Write) => {
                shim.seek(fd, offset, WHENCE_CUR)?;
            }
            (Policy::Replay, FdOp::Seek) => {
                shim.seek(fd, offset, flags)?;
            }
            (Policy::Compression, _) => {
                shim.seek(fd, offset, WHENCE_SET)?;
            }
        }
    }
    tracing::debug!(fd, path = %entry.path, ops = entry.ops.len(), "file replayed");
    Ok(())
}

fn reopen(shim: &dyn WasiShim, fd: i32, meta: &SocketMetaData) -> Result<(), Error> {
    let got = shim.sock_open(meta.domain, meta.ty)?;
    if got != fd {
        shim.renumber(got, fd)?;
    }
    Ok(())
}

fn replay_client(shim: &dyn WasiShim, fd: i32, meta: &SocketMetaData, reconnect: &dyn ReconnectStrategy) -> Result<Option<i32>, Error> {
    reopen(shim, fd, meta)?;
    if meta.is_tcp() {
        let addr = reconnect.rewrite(&meta.local_address);
        shim.sock_connect(fd, addr)?;
        tracing::info!(fd, %addr, "client socket reconnected");
    }
    Ok(None)
}

/// A stream server listens again and takes one connection, which becomes
/// the descriptor the guest's server socket now resolves to.
fn replay_server(shim: &dyn WasiShim, fd: i32, meta: &SocketMetaData, reconnect: &dyn ReconnectStrategy) -> Result<Option<i32>, Error> {
    reopen(shim, fd, meta)?;
    if !meta.is_tcp() {
        return Ok(None);
    }
    let addr = reconnect.rewrite(&meta.local_address);
    shim.sock_listen(fd, addr)?;
    let (conn, peer) = shim.sock_accept(fd)?;
    tracing::info!(fd, conn, %peer, "server socket accepted");
    Ok(Some(conn))
}
