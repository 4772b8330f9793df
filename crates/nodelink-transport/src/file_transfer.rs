//! Chunked file transfer.
//!
//! A file travels as one `file` request whose body is
//! `name_len: u16 | name | content`. The sender streams it chunk by chunk
//! under a single counter, so the whole file is never held in memory on the
//! sending side; the receiver gets it only once reassembly completed, stores
//! it and answers with the hex SHA-256 of the content.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::codec::ChunkSpec;
use crate::error::{Result, TransportError};
use crate::handler::Handler;
use crate::protocol::Command;
use crate::registry::{CommandHandler, Reply, RequestContext};

/// Outcome of a completed upload.
#[derive(Debug, Clone)]
pub struct FileTransferReport {
    /// File name as sent.
    pub name: String,
    /// Content bytes sent.
    pub bytes: u64,
    /// Hex SHA-256 confirmed by both ends.
    pub sha256: String,
    /// Wall time from first chunk to confirmation.
    pub elapsed: Duration,
}

/// Builds an in-memory `file` body.
pub fn encode_file_body(name: &str, content: &[u8]) -> Result<Bytes> {
    if name.is_empty() || name.len() > u16::MAX as usize {
        return Err(TransportError::Config {
            reason: format!("file name length {} not in 1..=65535", name.len()),
        });
    }
    let mut body = BytesMut::with_capacity(2 + name.len() + content.len());
    body.put_u16(name.len() as u16);
    body.put_slice(name.as_bytes());
    body.put_slice(content);
    Ok(body.freeze())
}

/// Splits a `file` body into name and content.
pub fn decode_file_body(mut body: &[u8]) -> Result<(&str, &[u8])> {
    if body.len() < 2 {
        return Err(TransportError::protocol("file body shorter than its name length"));
    }
    let name_len = body.get_u16() as usize;
    if body.len() < name_len {
        return Err(TransportError::protocol(format!(
            "file name of {} bytes truncated",
            name_len
        )));
    }
    let (name, content) = body.split_at(name_len);
    let name = std::str::from_utf8(name)
        .map_err(|_| TransportError::protocol("file name is not UTF-8"))?;
    Ok((name, content))
}

impl Handler {
    /// Streams the file at `path` to the peer and waits for its digest.
    /// Fails with `Application` when the peer stored different content.
    pub async fn send_file(&self, path: impl AsRef<Path>) -> Result<FileTransferReport> {
        self.ensure_ready()?;
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransportError::Config {
                reason: format!("{} has no usable file name", path.display()),
            })?
            .to_string();
        if name.len() > u16::MAX as usize {
            return Err(TransportError::Config {
                reason: "file name too long".to_string(),
            });
        }

        let mut file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len();
        let total_len = 2 + name.len() as u64 + len;
        if total_len > u32::MAX as u64 {
            return Err(TransportError::PayloadTooLarge {
                size: total_len as usize,
                max_size: u32::MAX as usize,
            });
        }
        let chunk_size = self.codec().config().chunk_size;
        let total = self.codec().chunk_count(total_len as usize)?;

        let started = Instant::now();
        let request = self.start_request(Command::FILE)?;
        let mut spec = ChunkSpec {
            counter: request.id(),
            command: Command::FILE,
            response: false,
            index: 0,
            total,
            total_len: total_len as u32,
        };
        debug!(parent: self.span(), file = %name, bytes = len, chunks = total, "sending file");

        let mut hasher = Sha256::new();
        let mut staged = BytesMut::with_capacity(chunk_size + name.len() + 2);
        staged.put_u16(name.len() as u16);
        staged.put_slice(name.as_bytes());
        let mut remaining = len;
        let mut read_buf = vec![0u8; chunk_size.min(1 << 20)];

        for index in 0..total {
            while staged.len() < chunk_size && remaining > 0 {
                let want = (chunk_size - staged.len()).min(read_buf.len()) as u64;
                let want = want.min(remaining) as usize;
                let n = match file.read(&mut read_buf[..want]).await {
                    Ok(0) => {
                        return Err(self.abort_stream(format!(
                            "{} shrank while it was being sent",
                            path.display()
                        )))
                    }
                    Ok(n) => n,
                    Err(e) => return Err(self.abort_stream(format!("reading {}: {}", path.display(), e))),
                };
                hasher.update(&read_buf[..n]);
                staged.put_slice(&read_buf[..n]);
                remaining -= n as u64;
            }
            let piece = staged.split_to(staged.len().min(chunk_size));
            spec.index = index;
            self.write_chunk(spec, &piece).await?;
        }
        self.metrics().inc_requests_sent();

        let (_, reply) = request.wait(None).await?;
        let local = hex::encode(hasher.finalize());
        let remote = String::from_utf8_lossy(&reply).into_owned();
        if remote != local {
            return Err(TransportError::Application {
                message: format!("digest mismatch for {}: sent {}, peer stored {}", name, local, remote),
            });
        }
        let report = FileTransferReport {
            name,
            bytes: len,
            sha256: local,
            elapsed: started.elapsed(),
        };
        info!(parent: self.span(), file = %report.name, bytes = report.bytes, elapsed_ms = report.elapsed.as_millis() as u64, "file sent");
        Ok(report)
    }

    /// A message cut short mid-stream cannot be recovered by the peer.
    fn abort_stream(&self, reason: String) -> TransportError {
        warn!(parent: self.span(), reason = %reason, "aborting file stream");
        self.close(reason.clone());
        TransportError::protocol(reason)
    }
}

/// `file` command: stores uploads under a directory.
#[derive(Debug, Clone)]
pub struct FileReceiver {
    dir: PathBuf,
}

impl FileReceiver {
    /// Receiver writing into `dir`, created on first upload.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Target directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl CommandHandler for FileReceiver {
    async fn handle(&self, ctx: RequestContext, payload: Bytes) -> Result<Reply> {
        let (name, content) = decode_file_body(&payload)?;
        let file_name = Path::new(name)
            .file_name()
            .ok_or_else(|| TransportError::protocol(format!("invalid file name '{}'", name)))?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let dest = self.dir.join(file_name);
        tokio::fs::write(&dest, content).await?;
        let digest = hex::encode(Sha256::digest(content));
        info!(
            counter = ctx.counter,
            peer = ctx.handler.peer_name().as_deref().unwrap_or("?"),
            path = %dest.display(),
            bytes = content.len(),
            "file received"
        );
        Ok(Reply::ok(digest))
    }
}
