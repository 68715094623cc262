//! Receive-side byte sinks
//!
//! Received chunks stream straight to disk when possible. If the streaming
//! writer cannot be opened, or a write fails mid-transfer, the sink degrades
//! to in-memory accumulation for the remainder and the bytes are appended to
//! the file when the transfer finalizes.

use crate::error::Result;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

enum SinkMode {
    /// Chunks are written to the file as they arrive
    Streaming { file: File, bytes_written: u64 },
    /// Chunks accumulate in memory; `streamed_prefix` bytes are already on
    /// disk from before a degradation
    Memory {
        chunks: Vec<Vec<u8>>,
        streamed_prefix: u64,
    },
}

/// Destination for one incoming transfer.
pub struct ReceiveSink {
    path: PathBuf,
    mode: SinkMode,
}

impl ReceiveSink {
    /// Open a sink for `path`, preferring a direct-to-disk streaming writer
    /// and falling back to in-memory accumulation.
    pub async fn open(path: &Path) -> Self {
        match File::create(path).await {
            Ok(file) => Self {
                path: path.to_path_buf(),
                mode: SinkMode::Streaming {
                    file,
                    bytes_written: 0,
                },
            },
            Err(e) => {
                warn!(
                    "Streaming writer unavailable for {}: {}; buffering in memory",
                    path.display(),
                    e
                );
                Self::memory(path)
            }
        }
    }

    /// In-memory sink that materializes `path` on finalize.
    pub fn memory(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            mode: SinkMode::Memory {
                chunks: Vec::new(),
                streamed_prefix: 0,
            },
        }
    }

    /// Whether the sink is currently streaming to disk.
    pub fn is_streaming(&self) -> bool {
        matches!(self.mode, SinkMode::Streaming { .. })
    }

    /// Append one chunk. A streaming write failure degrades the sink to
    /// memory instead of aborting the transfer.
    pub async fn write(&mut self, chunk: Vec<u8>) {
        match &mut self.mode {
            SinkMode::Streaming {
                file,
                bytes_written,
            } => match file.write_all(&chunk).await {
                Ok(()) => *bytes_written += chunk.len() as u64,
                Err(e) => {
                    warn!(
                        "Streaming write to {} failed: {}; buffering remainder in memory",
                        self.path.display(),
                        e
                    );
                    let streamed_prefix = *bytes_written;
                    self.mode = SinkMode::Memory {
                        chunks: vec![chunk],
                        streamed_prefix,
                    };
                }
            },
            SinkMode::Memory { chunks, .. } => chunks.push(chunk),
        }
    }

    /// Finish the transfer and materialize the file. For in-memory chunks
    /// this concatenates them in index order onto whatever prefix already
    /// streamed to disk.
    pub async fn finalize(self) -> Result<PathBuf> {
        match self.mode {
            SinkMode::Streaming { mut file, .. } => {
                file.flush().await?;
                file.sync_all().await?;
                Ok(self.path)
            }
            SinkMode::Memory {
                chunks,
                streamed_prefix,
            } => {
                let mut file = if streamed_prefix > 0 {
                    OpenOptions::new().append(true).open(&self.path).await?
                } else {
                    File::create(&self.path).await?
                };
                for chunk in &chunks {
                    file.write_all(chunk).await?;
                }
                file.flush().await?;
                file.sync_all().await?;
                Ok(self.path)
            }
        }
    }

    /// Abort the transfer and remove any partial file.
    pub async fn abort(self) {
        let partial_on_disk = match self.mode {
            SinkMode::Streaming { file, .. } => {
                drop(file);
                true
            }
            SinkMode::Memory {
                streamed_prefix, ..
            } => streamed_prefix > 0,
        };
        if partial_on_disk || self.path.exists() {
            if let Err(e) = tokio::fs::remove_file(&self.path).await {
                debug!("Removing partial file {}: {}", self.path.display(), e);
            }
        }
    }
}
