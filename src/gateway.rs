//! Gateway control messages and post-migration addressing.
//!
//! A migrated process cannot reach its old peers directly; every reconnect
//! goes through a relay. The relay is told when a process is about to be
//! suspended and when it is back so it can hold connections open meanwhile.

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};

use serde::{Deserialize, Serialize};

use crate::config::GatewayConfig;
use crate::error::*;
use crate::wasi::AddrPool;

pub const MAX_ADDR: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayOp {
    #[default]
    Suspend,
    SuspendTcpServer,
    Resume,
    ResumeTcpServer,
    Init,
    Fin,
}

/// Fixed-size control message exchanged with the gateway and, as the
/// end-of-stream sentinel, with peers being drained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpData {
    pub op: GatewayOp,
    pub is_tcp: bool,
    pub size: i32,
    pub addr: [[AddrPool; 2]; MAX_ADDR],
}

impl OpData {
    pub fn new(op: GatewayOp) -> Self { Self { op, ..Default::default() } }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Every message has the same wire size.
    pub fn encoded_len() -> usize {
        bincode::serialized_size(&OpData::default()).map_or(0, |n| n as usize)
    }

    /// True if `payload` is exactly one `Fin` message.
    pub fn is_fin(payload: &[u8]) -> bool {
        payload.len() == Self::encoded_len()
            && Self::decode(payload).is_ok_and(|m| m.op == GatewayOp::Fin)
    }

    /// For a byte stream that ends in a `Fin` message, the length of the
    /// data in front of it.
    pub fn data_before_fin(stream: &[u8]) -> Option<usize> {
        let split = stream.len().checked_sub(Self::encoded_len())?;
        Self::is_fin(&stream[split..]).then_some(split)
    }
}

/// Where a restored socket reconnects to.
pub trait ReconnectStrategy: Send + Sync {
    fn rewrite(&self, recorded: &AddrPool) -> SocketAddr;
}

/// Sends every reconnect to one relay host, keeping the recorded port.
#[derive(Debug, Clone, Copy)]
pub struct FixedGateway {
    pub v4: Ipv4Addr,
    pub v6: Ipv6Addr,
}

impl FixedGateway {
    pub fn new(v4: Ipv4Addr, v6: Ipv6Addr) -> Self { Self { v4, v6 } }

    pub fn from_config(cfg: &GatewayConfig) -> Self { Self::new(cfg.addr, cfg.addr6) }
}

impl ReconnectStrategy for FixedGateway {
    fn rewrite(&self, recorded: &AddrPool) -> SocketAddr {
        let ip = if recorded.is_4 { IpAddr::V4(self.v4) } else { IpAddr::V6(self.v6) };
        SocketAddr::new(ip, recorded.port)
    }
}

/// One-shot TCP sender of [`OpData`] to the gateway's control port.
#[derive(Debug, Clone, Copy)]
pub struct GatewayNotifier {
    addr: SocketAddr,
}

impl GatewayNotifier {
    pub fn new(addr: SocketAddr) -> Self { Self { addr } }

    pub fn from_config(cfg: &GatewayConfig) -> Self {
        Self::new(SocketAddr::new(IpAddr::V4(cfg.addr), cfg.port))
    }

    pub fn notify(&self, msg: &OpData) -> Result<(), Error> {
        let bytes = msg.encode()?;
        let mut stream = TcpStream::connect(self.addr)?;
        stream.write_all(&bytes)?;
        tracing::info!(op = ?msg.op, gateway = %self.addr, "notified gateway");
        Ok(())
    }
}
