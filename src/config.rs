//! Runtime configuration: built-in defaults, then an optional TOML file,
//! then command-line overrides applied by the binaries.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::*;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunningMode {
    #[default]
    Interp,
    Aot,
}

/// How a file's operation log is replayed on restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// Re-apply every logged reposition.
    #[default]
    Replay,
    /// Open, then jump straight to the last recorded offset.
    Compression,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub addr: Ipv4Addr,
    pub addr6: Ipv6Addr,
    pub port: u16,
    /// Send suspend/resume messages to the gateway.
    pub notify: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            addr: Ipv4Addr::new(172, 17, 0, 1),
            addr6: Ipv6Addr::new(0xfe80, 0, 0, 0, 0x42, 0xaeff, 0xfe1f, 0xb579),
            port: 1235,
            notify: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Operand stack budget per environment, in bytes.
    pub stack_size: usize,
    /// App heap region per memory, in bytes.
    pub heap_size: usize,
    /// Capacity reserved for a shared memory on restore.
    pub shared_heap_size: usize,
    pub running_mode: RunningMode,
    pub policy: Policy,
    /// Checkpoint on the Nth host call. 0 disables the trigger.
    pub snapshot_threshold: u64,
    /// Bound on socket draining at checkpoint time. Unbounded if unset.
    pub drain_timeout_ms: Option<u64>,
    pub gateway: GatewayConfig,
    pub dirs: Vec<String>,
    pub map_dirs: Vec<String>,
    pub envs: Vec<String>,
    pub args: Vec<String>,
    pub addr_pool: Vec<String>,
    pub ns_lookup_pool: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: 64 * 1024,
            heap_size: 0,
            shared_heap_size: 64 * 1024 * 1024,
            running_mode: RunningMode::Interp,
            policy: Policy::Replay,
            snapshot_threshold: 0,
            drain_timeout_ms: None,
            gateway: GatewayConfig::default(),
            dirs: Vec::new(),
            map_dirs: Vec::new(),
            envs: Vec::new(),
            args: Vec::new(),
            addr_pool: Vec::new(),
            ns_lookup_pool: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        toml::from_str(s).map_err(|e| Error::restore(format!("invalid config: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)?;
        let cfg = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "loaded runtime config");
        Ok(cfg)
    }

    pub fn drain_timeout(&self) -> Option<std::time::Duration> {
        self.drain_timeout_ms.map(std::time::Duration::from_millis)
    }
}
