//! Syscall shims the WASI replay drives.
//!
//! Guest-visible descriptor numbers are virtual: [`HostShim`] keeps its own
//! table mapping them to std handles, so a restore can reopen a file or a
//! socket and park it under the number the guest already knows.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use nohash_hasher::IntMap;

use crate::error::*;
use crate::lock;

pub const WHENCE_SET: i32 = 0;
pub const WHENCE_CUR: i32 = 1;
pub const WHENCE_END: i32 = 2;

pub const OFLAG_CREAT: i32 = 0x1;
pub const OFLAG_DIRECTORY: i32 = 0x2;
pub const OFLAG_EXCL: i32 = 0x4;
pub const OFLAG_TRUNC: i32 = 0x8;

pub const DOMAIN_INET4: i32 = 0;
pub const DOMAIN_INET6: i32 = 1;
pub const SOCK_DGRAM: i32 = 0;
pub const SOCK_STREAM: i32 = 1;

/// First descriptor handed out; 0-2 are the standard streams.
const FIRST_FD: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    File,
    Stream,
    Listener,
    Datagram,
    /// Opened stream socket that is neither connected nor listening yet.
    Unbound,
}

pub trait WasiShim: Send + Sync {
    /// Open `path` with WASI `oflags`. Truncation and exclusivity are
    /// ignored, a replayed open never destroys file contents.
    fn open(&self, path: &str, oflags: i32) -> Result<i32, Error>;
    /// Move descriptor `from` to number `to`, closing whatever held `to`.
    fn renumber(&self, from: i32, to: i32) -> Result<(), Error>;
    fn seek(&self, fd: i32, offset: i64, whence: i32) -> Result<u64, Error>;
    /// Read at most `len` bytes from a file at its current position.
    fn read(&self, fd: i32, len: usize) -> Result<Vec<u8>, Error>;
    /// Write to a file or a connected stream.
    fn write(&self, fd: i32, bytes: &[u8]) -> Result<usize, Error>;
    fn close(&self, fd: i32) -> Result<(), Error>;
    fn sock_open(&self, domain: i32, ty: i32) -> Result<i32, Error>;
    fn sock_connect(&self, fd: i32, addr: SocketAddr) -> Result<(), Error>;
    fn sock_listen(&self, fd: i32, addr: SocketAddr) -> Result<(), Error>;
    /// Blocks until a peer connects; returns the new descriptor.
    fn sock_accept(&self, fd: i32) -> Result<(i32, SocketAddr), Error>;
    /// Read at most `len` bytes from a stream. An empty result means the
    /// peer closed the connection.
    fn recv(&self, fd: i32, len: usize, timeout: Option<Duration>) -> Result<Vec<u8>, Error>;
    fn recv_from(&self, fd: i32, len: usize, timeout: Option<Duration>) -> Result<(Vec<u8>, SocketAddr), Error>;
    fn kind(&self, fd: i32) -> Option<DescriptorKind>;
}

/// True when `err` is a receive that ran out of time.
pub fn is_timeout(err: &Error) -> bool {
    matches!(err, Error::Io(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut))
}

enum Descriptor {
    File(File),
    Stream(TcpStream),
    Listener(TcpListener),
    Datagram(UdpSocket),
    Unbound,
}

impl Descriptor {
    fn kind(&self) -> DescriptorKind {
        match self {
            Descriptor::File(_) => DescriptorKind::File,
            Descriptor::Stream(_) => DescriptorKind::Stream,
            Descriptor::Listener(_) => DescriptorKind::Listener,
            Descriptor::Datagram(_) => DescriptorKind::Datagram,
            Descriptor::Unbound => DescriptorKind::Unbound,
        }
    }
}

#[derive(Default)]
struct Table {
    entries: IntMap<i32, Descriptor>,
    next_fd: i32,
}

impl Table {
    fn insert(&mut self, d: Descriptor) -> i32 {
        let mut fd = self.next_fd.max(FIRST_FD);
        while self.entries.contains_key(&fd) {
            fd += 1;
        }
        self.next_fd = fd + 1;
        self.entries.insert(fd, d);
        fd
    }

    fn get_mut(&mut self, fd: i32) -> Result<&mut Descriptor, Error> {
        self.entries.get_mut(&fd).ok_or(Error::Wasi(BAD_DESCRIPTOR))
    }
}

/// [`WasiShim`] over std files and sockets.
#[derive(Default)]
pub struct HostShim {
    table: Mutex<Table>,
    /// `(guest prefix, host prefix)` pairs from `guest::host` map dirs.
    map_dirs: Vec<(String, PathBuf)>,
}

impl HostShim {
    pub fn new() -> Self { Self::default() }

    pub fn with_map_dirs(mut self, map_dirs: &[String]) -> Self {
        self.map_dirs = map_dirs
            .iter()
            .filter_map(|m| m.split_once("::"))
            .map(|(guest, host)| (guest.to_string(), PathBuf::from(host)))
            .collect();
        self
    }

    fn resolve(&self, path: &str) -> PathBuf {
        for (guest, host) in &self.map_dirs {
            if let Some(rest) = path.strip_prefix(guest.as_str()) {
                return host.join(rest.trim_start_matches('/'));
            }
        }
        PathBuf::from(path)
    }

    fn clone_stream(&self, fd: i32) -> Result<TcpStream, Error> {
        match lock(&self.table).get_mut(fd)? {
            Descriptor::Stream(s) => Ok(s.try_clone()?),
            _ => Err(Error::Wasi(NOT_A_SOCKET)),
        }
    }
}

fn unspecified(domain: i32) -> SocketAddr {
    if domain == DOMAIN_INET6 {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    }
}

impl WasiShim for HostShim {
    fn open(&self, path: &str, oflags: i32) -> Result<i32, Error> {
        let host_path = self.resolve(path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(oflags & OFLAG_CREAT != 0)
            .open(&host_path)
            .or_else(|e| match e.kind() {
                io::ErrorKind::PermissionDenied => File::open(&host_path),
                _ => Err(e),
            })?;
        let fd = lock(&self.table).insert(Descriptor::File(file));
        tracing::debug!(fd, path, "opened file");
        Ok(fd)
    }

    fn renumber(&self, from: i32, to: i32) -> Result<(), Error> {
        let mut table = lock(&self.table);
        let d = table.entries.remove(&from).ok_or(Error::Wasi(BAD_DESCRIPTOR))?;
        table.entries.insert(to, d);
        Ok(())
    }

    fn seek(&self, fd: i32, offset: i64, whence: i32) -> Result<u64, Error> {
        let pos = match whence {
            WHENCE_SET => SeekFrom::Start(offset.max(0) as u64),
            WHENCE_CUR => SeekFrom::Current(offset),
            WHENCE_END => SeekFrom::End(offset),
            _ => return Err(Error::Wasi(BAD_WHENCE)),
        };
        match lock(&self.table).get_mut(fd)? {
            Descriptor::File(f) => Ok(f.seek(pos)?),
            _ => Err(Error::Wasi(NOT_A_FILE)),
        }
    }

    fn read(&self, fd: i32, len: usize) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0; len];
        let n = match lock(&self.table).get_mut(fd)? {
            Descriptor::File(f) => f.read(&mut buf)?,
            _ => return Err(Error::Wasi(NOT_A_FILE)),
        };
        buf.truncate(n);
        Ok(buf)
    }

    fn write(&self, fd: i32, bytes: &[u8]) -> Result<usize, Error> {
        match lock(&self.table).get_mut(fd)? {
            Descriptor::File(f) => Ok(f.write(bytes)?),
            Descriptor::Stream(s) => Ok(s.write(bytes)?),
            _ => Err(Error::Wasi(NOT_A_FILE)),
        }
    }

    fn close(&self, fd: i32) -> Result<(), Error> {
        lock(&self.table).entries.remove(&fd).map(drop).ok_or(Error::Wasi(BAD_DESCRIPTOR))
    }

    fn sock_open(&self, domain: i32, ty: i32) -> Result<i32, Error> {
        let d = if ty == SOCK_DGRAM {
            Descriptor::Datagram(UdpSocket::bind(unspecified(domain))?)
        } else {
            Descriptor::Unbound
        };
        Ok(lock(&self.table).insert(d))
    }

    fn sock_connect(&self, fd: i32, addr: SocketAddr) -> Result<(), Error> {
        let mut table = lock(&self.table);
        let slot = table.get_mut(fd)?;
        match slot {
            Descriptor::Unbound => {
                *slot = Descriptor::Stream(TcpStream::connect(addr)?);
                Ok(())
            }
            Descriptor::Datagram(s) => Ok(s.connect(addr)?),
            _ => Err(Error::Wasi(SOCKET_STATE)),
        }
    }

    fn sock_listen(&self, fd: i32, addr: SocketAddr) -> Result<(), Error> {
        let mut table = lock(&self.table);
        let slot = table.get_mut(fd)?;
        match slot {
            Descriptor::Unbound => {
                *slot = Descriptor::Listener(TcpListener::bind(addr)?);
                Ok(())
            }
            _ => Err(Error::Wasi(SOCKET_STATE)),
        }
    }

    fn sock_accept(&self, fd: i32) -> Result<(i32, SocketAddr), Error> {
        let listener = match lock(&self.table).get_mut(fd)? {
            Descriptor::Listener(l) => l.try_clone()?,
            _ => return Err(Error::Wasi(SOCKET_STATE)),
        };
        let (stream, peer) = listener.accept()?;
        let new_fd = lock(&self.table).insert(Descriptor::Stream(stream));
        Ok((new_fd, peer))
    }

    fn recv(&self, fd: i32, len: usize, timeout: Option<Duration>) -> Result<Vec<u8>, Error> {
        let mut stream = self.clone_stream(fd)?;
        stream.set_read_timeout(timeout)?;
        let mut buf = vec![0; len];
        let n = stream.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn recv_from(&self, fd: i32, len: usize, timeout: Option<Duration>) -> Result<(Vec<u8>, SocketAddr), Error> {
        let socket = match lock(&self.table).get_mut(fd)? {
            Descriptor::Datagram(s) => s.try_clone()?,
            _ => return Err(Error::Wasi(NOT_A_SOCKET)),
        };
        socket.set_read_timeout(timeout)?;
        let mut buf = vec![0; len];
        let (n, src) = socket.recv_from(&mut buf)?;
        buf.truncate(n);
        Ok((buf, src))
    }

    fn kind(&self, fd: i32) -> Option<DescriptorKind> {
        lock(&self.table).entries.get(&fd).map(Descriptor::kind)
    }
}
