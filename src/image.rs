//! Checkpoint image framing.
//!
//! An image is `b"WCKP"`, a little-endian `u32` format version, then the
//! bincode body. It is written to or read from a file path or a
//! `tcp://addr:port` stream.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::*;
use crate::snapshot::ExecEnvSnapshot;

pub const MAGIC: &[u8; 4] = b"WCKP";
/// Bump on any change to the snapshot records.
pub const FORMAT_VERSION: u32 = 1;

const HEADER_LEN: usize = 8;
const TCP_SCHEME: &str = "tcp://";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointImage {
    /// Every environment of the process, in capture order.
    pub envs: Vec<ExecEnvSnapshot>,
}

impl CheckpointImage {
    pub fn new(envs: Vec<ExecEnvSnapshot>) -> Self { Self { envs } }

    /// Index of the environment carrying the module instance record.
    pub fn owner(&self) -> Result<usize, Error> {
        self.envs
            .iter()
            .position(|e| e.module_instance.is_some())
            .ok_or(Error::Image(NO_MODULE_SNAPSHOT))
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(HEADER_LEN);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bincode::serialize_into(&mut out, self)?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
            return Err(Error::Image(BAD_IMAGE_MAGIC));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[4..HEADER_LEN]);
        let version = u32::from_le_bytes(version);
        if version != FORMAT_VERSION {
            tracing::error!(version, expected = FORMAT_VERSION, "checkpoint image version mismatch");
            return Err(Error::Image(BAD_IMAGE_VERSION));
        }
        let image: Self = bincode::deserialize(&bytes[HEADER_LEN..])?;
        tracing::debug!(envs = image.envs.len(), bytes = bytes.len(), "checkpoint image decoded");
        Ok(image)
    }

    /// Write to a path, or connect to `tcp://addr:port` and send.
    pub fn write_to(&self, target: &str) -> Result<(), Error> {
        let bytes = self.encode()?;
        match parse_target(target)? {
            Target::Tcp(addr) => {
                let mut stream = TcpStream::connect(addr)?;
                stream.write_all(&bytes)?;
                stream.flush()?;
            }
            Target::File(path) => std::fs::write(path, &bytes)?,
        }
        tracing::info!(target, bytes = bytes.len(), envs = self.envs.len(), "checkpoint image written");
        Ok(())
    }

    /// Read from a path, or listen on `tcp://addr:port` for one sender.
    pub fn read_from(source: &str) -> Result<Self, Error> {
        let bytes = match parse_target(source)? {
            Target::Tcp(addr) => {
                let listener = TcpListener::bind(addr)?;
                tracing::info!(%addr, "waiting for checkpoint image");
                let (mut stream, peer) = listener.accept()?;
                let mut buf = Vec::new();
                stream.read_to_end(&mut buf)?;
                tracing::debug!(%peer, bytes = buf.len(), "checkpoint image received");
                buf
            }
            Target::File(path) => std::fs::read(path)?,
        };
        Self::decode(&bytes)
    }
}

enum Target<'a> {
    File(&'a Path),
    Tcp(&'a str),
}

fn parse_target(target: &str) -> Result<Target<'_>, Error> {
    if let Some(addr) = target.strip_prefix(TCP_SCHEME) {
        if addr.is_empty() || !addr.contains(':') {
            return Err(Error::Image(BAD_STREAM_TARGET));
        }
        return Ok(Target::Tcp(addr));
    }
    if target.is_empty() {
        return Err(Error::Image(BAD_STREAM_TARGET));
    }
    Ok(Target::File(Path::new(target)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunningMode;
    use crate::snapshot::InterpFrameSnapshot;

    fn env(handle: u64) -> ExecEnvSnapshot {
        ExecEnvSnapshot {
            thread_handle_value: handle,
            suspend_flags: 1,
            aux_stack_boundary: 0,
            aux_stack_bottom: 0,
            running_mode: RunningMode::Interp,
            frames: vec![InterpFrameSnapshot {
                ip_offset: Some(4),
                function_index: 2,
                function_name: "work".into(),
                sp_offset: 3,
                stack_cells: vec![1, 2, 3],
                branch_blocks: Vec::new(),
            }],
            module_instance: None,
        }
    }

    #[test]
    fn header_is_checked() {
        let image = CheckpointImage::new(vec![env(3), env(4)]);
        let mut bytes = image.encode().unwrap();
        assert_eq!(&bytes[..4], MAGIC);
        assert_eq!(CheckpointImage::decode(&bytes).unwrap(), image);

        bytes[4] = 9;
        assert!(matches!(CheckpointImage::decode(&bytes), Err(Error::Image(BAD_IMAGE_VERSION))));
        bytes[0] = b'X';
        assert!(matches!(CheckpointImage::decode(&bytes), Err(Error::Image(BAD_IMAGE_MAGIC))));
        assert!(matches!(CheckpointImage::decode(b"WC"), Err(Error::Image(BAD_IMAGE_MAGIC))));
    }

    #[test]
    fn truncated_body_is_an_encode_error() {
        let bytes = CheckpointImage::new(vec![env(1)]).encode().unwrap();
        let err = CheckpointImage::decode(&bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(err, Error::Encode(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn owner_is_required() {
        let image = CheckpointImage::new(vec![env(1)]);
        assert!(matches!(image.owner(), Err(Error::Image(NO_MODULE_SNAPSHOT))));
    }

    #[test]
    fn file_and_tcp_targets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.ckpt");
        let image = CheckpointImage::new(vec![env(7)]);
        image.write_to(path.to_str().unwrap()).unwrap();
        assert_eq!(CheckpointImage::read_from(path.to_str().unwrap()).unwrap(), image);

        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let target = format!("tcp://127.0.0.1:{port}");
        let reader = {
            let target = target.clone();
            std::thread::spawn(move || CheckpointImage::read_from(&target))
        };
        let sent = image.clone();
        let mut tries = 0;
        while let Err(e) = sent.write_to(&target) {
            tries += 1;
            assert!(tries < 200, "{e}");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(reader.join().unwrap().unwrap(), image);

        assert!(matches!(image.write_to(""), Err(Error::Image(BAD_STREAM_TARGET))));
        assert!(matches!(image.write_to("tcp://"), Err(Error::Image(BAD_STREAM_TARGET))));
    }
}
