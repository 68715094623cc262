//! Chunked file transfer over an established data channel
//!
//! Protocol: the sender broadcasts a file offer inside a chat frame, a
//! receiver replies with a request, the sender accepts and streams base64
//! chunk frames at a fixed pace, then a completion frame. Either side may
//! cancel at any point. Reliability and ordering are delegated entirely to
//! the channel; there are no per-chunk acknowledgements.

use super::frames::{generate_transfer_id, ChannelFrame, ChatMessage, FileChunk, FileOffer};
use super::sink::ReceiveSink;
use crate::error::{Error, Result};
use crate::transport::DataChannel;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Which side of a transfer an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Send,
    Receive,
}

/// Transfer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Transferring,
    Completed,
    Failed,
}

/// Progress snapshot emitted once per chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    pub transfer_id: String,
    pub direction: TransferDirection,
    pub chunks_done: u32,
    pub total_chunks: u32,
    pub bytes_done: u64,
    pub total_bytes: u64,
    pub percentage: f32,
}

/// Outcomes surfaced to the session layer.
#[derive(Debug, Clone)]
pub enum TransferUpdate {
    /// A remote peer announced a downloadable file
    Offered {
        from_peer_id: String,
        offer: FileOffer,
    },
    Progress(TransferProgress),
    Completed {
        transfer_id: String,
        direction: TransferDirection,
        /// Where the received file was materialized (receive side only)
        path: Option<PathBuf>,
    },
    Failed {
        transfer_id: String,
        direction: TransferDirection,
        reason: String,
    },
}

/// Events pacing tasks push back into the owning event loop.
#[derive(Debug)]
pub enum EngineEvent {
    Progress(TransferProgress),
    SendFinished { transfer_id: String, peer_id: String },
    SendFailed {
        transfer_id: String,
        peer_id: String,
        reason: String,
    },
}

struct OutgoingTransfer {
    offer: FileOffer,
    data: Arc<Vec<u8>>,
    status: TransferStatus,
    requesters: HashSet<String>,
    sent_chunks: Arc<AtomicU32>,
    cancel: watch::Sender<bool>,
}

struct IncomingTransfer {
    offer: FileOffer,
    from_peer_id: String,
    status: TransferStatus,
    received_chunks: u32,
    bytes_received: u64,
    sink: ReceiveSink,
}

/// Owns every live transfer, keyed by transfer identity. One record per
/// identity per role: the sender keeps its record until all requesters
/// finish; a receiver keeps its own keyed by the same identity.
pub struct FileTransferEngine {
    local_peer_id: Option<String>,
    chunk_size: u32,
    chunk_delay: Duration,
    download_dir: PathBuf,
    events: mpsc::Sender<EngineEvent>,
    /// Offers seen from remote peers, available to request
    announced: HashMap<String, (String, FileOffer)>,
    outgoing: HashMap<String, OutgoingTransfer>,
    incoming: HashMap<String, IncomingTransfer>,
}

impl FileTransferEngine {
    pub fn new(
        chunk_size: usize,
        chunk_delay: Duration,
        download_dir: PathBuf,
        events: mpsc::Sender<EngineEvent>,
    ) -> Self {
        Self {
            local_peer_id: None,
            chunk_size: chunk_size as u32,
            chunk_delay,
            download_dir,
            events,
            announced: HashMap::new(),
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
        }
    }

    pub fn set_local_peer_id(&mut self, peer_id: String) {
        self.local_peer_id = Some(peer_id);
    }

    /// Status accessors used by the session layer and tests.
    pub fn outgoing_status(&self, transfer_id: &str) -> Option<TransferStatus> {
        self.outgoing.get(transfer_id).map(|t| t.status)
    }

    pub fn incoming_status(&self, transfer_id: &str) -> Option<TransferStatus> {
        self.incoming.get(transfer_id).map(|t| t.status)
    }

    pub fn sent_chunks(&self, transfer_id: &str) -> Option<u32> {
        self.outgoing
            .get(transfer_id)
            .map(|t| t.sent_chunks.load(Ordering::Relaxed))
    }

    pub fn received_chunks(&self, transfer_id: &str) -> Option<u32> {
        self.incoming.get(transfer_id).map(|t| t.received_chunks)
    }

    // ------------------------------------------------------------------
    // Sender side
    // ------------------------------------------------------------------

    /// Read `path` and register a pending outgoing transfer. Returns the
    /// transfer identity and the chat frame announcing the offer, for
    /// broadcast to all open channels.
    pub async fn offer_file(
        &mut self,
        path: &Path,
        sender_id: &str,
        sender_name: &str,
    ) -> Result<(String, ChannelFrame)> {
        let data = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Transfer(format!("not a file: {}", path.display())))?;
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .to_string();

        let transfer_id = generate_transfer_id();
        let offer = FileOffer {
            file_id: transfer_id.clone(),
            file_name: file_name.clone(),
            file_size: data.len() as u64,
            mime_type,
            chunk_size: self.chunk_size,
            total_chunks: FileOffer::chunk_count(data.len() as u64, self.chunk_size),
        };

        let (cancel, _) = watch::channel(false);
        self.outgoing.insert(
            transfer_id.clone(),
            OutgoingTransfer {
                offer: offer.clone(),
                data: Arc::new(data),
                status: TransferStatus::Pending,
                requesters: HashSet::new(),
                sent_chunks: Arc::new(AtomicU32::new(0)),
                cancel,
            },
        );
        info!(
            "Offering file {} ({} bytes, {} chunks) as {}",
            file_name, offer.file_size, offer.total_chunks, transfer_id
        );

        let message =
            ChatMessage::new(sender_id, sender_name, &file_name).with_file(offer);
        Ok((transfer_id, ChannelFrame::Chat(message)))
    }

    /// A peer requested one of our offered files: accept and start sending.
    pub fn on_request(
        &mut self,
        from_peer_id: &str,
        file_id: &str,
        channel: Option<Arc<dyn DataChannel>>,
    ) {
        let chunk_delay = self.chunk_delay;
        let events = self.events.clone();
        let Some(transfer) = self.outgoing.get_mut(file_id) else {
            warn!("Request for unknown transfer {}", file_id);
            return;
        };
        let Some(channel) = channel else {
            warn!("No open channel to {} for transfer {}", from_peer_id, file_id);
            return;
        };
        transfer.status = TransferStatus::Transferring;
        transfer.requesters.insert(from_peer_id.to_string());
        info!("Accepted transfer {} for {}", file_id, from_peer_id);

        spawn_send(
            channel,
            transfer.offer.clone(),
            Arc::clone(&transfer.data),
            from_peer_id.to_string(),
            chunk_delay,
            Arc::clone(&transfer.sent_chunks),
            transfer.cancel.subscribe(),
            events,
        );
    }

    /// A pacing task finished its chunk sequence for one requester.
    pub fn on_send_finished(&mut self, transfer_id: &str, peer_id: &str) -> Vec<TransferUpdate> {
        let Some(transfer) = self.outgoing.get_mut(transfer_id) else {
            return Vec::new();
        };
        transfer.requesters.remove(peer_id);
        if !transfer.requesters.is_empty() {
            return Vec::new();
        }
        transfer.status = TransferStatus::Completed;
        self.outgoing.remove(transfer_id);
        info!("Transfer {} completed for all requesters", transfer_id);
        vec![TransferUpdate::Completed {
            transfer_id: transfer_id.to_string(),
            direction: TransferDirection::Send,
            path: None,
        }]
    }

    /// A pacing task aborted (closed channel, send failure).
    pub fn on_send_failed(
        &mut self,
        transfer_id: &str,
        peer_id: &str,
        reason: String,
    ) -> Vec<TransferUpdate> {
        let Some(transfer) = self.outgoing.get_mut(transfer_id) else {
            return Vec::new();
        };
        warn!("Transfer {} to {} failed: {}", transfer_id, peer_id, reason);
        transfer.requesters.remove(peer_id);
        if transfer.requesters.is_empty() {
            transfer.status = TransferStatus::Failed;
            self.outgoing.remove(transfer_id);
        }
        vec![TransferUpdate::Failed {
            transfer_id: transfer_id.to_string(),
            direction: TransferDirection::Send,
            reason,
        }]
    }

    // ------------------------------------------------------------------
    // Receiver side
    // ------------------------------------------------------------------

    /// A remote peer announced a file inside a chat frame.
    pub fn register_offer(&mut self, from_peer_id: &str, offer: FileOffer) -> TransferUpdate {
        debug!(
            "Peer {} offers {} ({} bytes)",
            from_peer_id, offer.file_name, offer.file_size
        );
        self.announced
            .insert(offer.file_id.clone(), (from_peer_id.to_string(), offer.clone()));
        TransferUpdate::Offered {
            from_peer_id: from_peer_id.to_string(),
            offer,
        }
    }

    /// Build the request frame for an announced offer. Returns the peer to
    /// address and the frame.
    pub fn request_frame(&self, transfer_id: &str) -> Result<(String, ChannelFrame)> {
        let (from_peer_id, _) = self
            .announced
            .get(transfer_id)
            .ok_or_else(|| Error::Transfer(format!("unknown transfer {}", transfer_id)))?;
        let requester_id = self
            .local_peer_id
            .clone()
            .ok_or_else(|| Error::Transfer("local identity not assigned".into()))?;
        Ok((
            from_peer_id.clone(),
            ChannelFrame::FileRequest {
                file_id: transfer_id.to_string(),
                requester_id,
            },
        ))
    }

    /// The sender accepted our request: open the sink and start tracking.
    pub async fn on_accept(&mut self, from_peer_id: &str, file_id: &str) {
        let Some((source_peer, offer)) = self.announced.get(file_id).cloned() else {
            warn!("Accept for unannounced transfer {}", file_id);
            return;
        };
        if source_peer != from_peer_id {
            warn!(
                "Accept for {} from {} but offer came from {}",
                file_id, from_peer_id, source_peer
            );
            return;
        }
        if self.incoming.contains_key(file_id) {
            debug!("Already receiving transfer {}", file_id);
            return;
        }

        // Strip any path components the sender put in the name
        let safe_name = Path::new(&offer.file_name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_id.to_string());
        let path = self.download_dir.join(safe_name);
        let sink = ReceiveSink::open(&path).await;

        info!(
            "Receiving transfer {} from {} into {}",
            file_id,
            from_peer_id,
            path.display()
        );
        self.incoming.insert(
            file_id.to_string(),
            IncomingTransfer {
                offer,
                from_peer_id: from_peer_id.to_string(),
                status: TransferStatus::Transferring,
                received_chunks: 0,
                bytes_received: 0,
                sink,
            },
        );
    }

    /// Apply one received chunk frame.
    pub async fn on_chunk(&mut self, from_peer_id: &str, chunk: FileChunk) -> Vec<TransferUpdate> {
        let Some(transfer) = self.incoming.get_mut(&chunk.file_id) else {
            warn!("Chunk for unknown transfer {}", chunk.file_id);
            return Vec::new();
        };
        if transfer.from_peer_id != from_peer_id {
            warn!(
                "Chunk for {} from unexpected peer {}",
                chunk.file_id, from_peer_id
            );
            return Vec::new();
        }

        let bytes = match BASE64.decode(chunk.data.as_bytes()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Undecodable chunk {} of {}: {}", chunk.chunk_index, chunk.file_id, e);
                return Vec::new();
            }
        };

        let chunk_len = bytes.len() as u64;
        transfer.sink.write(bytes).await;
        transfer.received_chunks += 1;
        transfer.bytes_received += chunk_len;

        let chunks_done = transfer.received_chunks;
        let total_chunks = transfer.offer.total_chunks;
        let mut updates = vec![TransferUpdate::Progress(TransferProgress {
            transfer_id: chunk.file_id.clone(),
            direction: TransferDirection::Receive,
            chunks_done,
            total_chunks,
            bytes_done: transfer.bytes_received,
            total_bytes: transfer.offer.file_size,
            percentage: percentage(chunks_done, total_chunks),
        })];

        // The channel is ordered and reliable, so once the declared final
        // chunk has been written the transfer is complete; the completion
        // frame then becomes an idempotent confirmation.
        if chunk.is_last && chunks_done >= total_chunks {
            updates.extend(self.finalize_incoming(&chunk.file_id).await);
        }
        updates
    }

    /// Completion frame from the sender. A transfer already finalized via
    /// its last chunk no longer has a record, and the frame is ignored.
    pub async fn on_complete(&mut self, file_id: &str) -> Vec<TransferUpdate> {
        if self.incoming.contains_key(file_id) {
            self.finalize_incoming(file_id).await
        } else {
            Vec::new()
        }
    }

    async fn finalize_incoming(&mut self, file_id: &str) -> Vec<TransferUpdate> {
        let Some(mut transfer) = self.incoming.remove(file_id) else {
            return Vec::new();
        };
        self.announced.remove(file_id);
        match transfer.sink.finalize().await {
            Ok(path) => {
                transfer.status = TransferStatus::Completed;
                info!("Transfer {} completed: {}", file_id, path.display());
                vec![TransferUpdate::Completed {
                    transfer_id: file_id.to_string(),
                    direction: TransferDirection::Receive,
                    path: Some(path),
                }]
            }
            Err(e) => {
                warn!("Failed to materialize transfer {}: {}", file_id, e);
                vec![TransferUpdate::Failed {
                    transfer_id: file_id.to_string(),
                    direction: TransferDirection::Receive,
                    reason: e.to_string(),
                }]
            }
        }
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    /// Local cancellation. Aborts whichever role holds the record and
    /// returns the cancel frame to put on the wire, if a record existed.
    pub async fn cancel(&mut self, transfer_id: &str) -> (Option<ChannelFrame>, Vec<TransferUpdate>) {
        let updates = self.abort_local(transfer_id, "cancelled").await;
        if updates.is_empty() {
            (None, updates)
        } else {
            (
                Some(ChannelFrame::FileCancel {
                    file_id: transfer_id.to_string(),
                }),
                updates,
            )
        }
    }

    /// Cancel frame from the remote side: perform the same local abort.
    pub async fn on_remote_cancel(&mut self, file_id: &str) -> Vec<TransferUpdate> {
        self.abort_local(file_id, "cancelled by peer").await
    }

    async fn abort_local(&mut self, transfer_id: &str, reason: &str) -> Vec<TransferUpdate> {
        let mut updates = Vec::new();
        if let Some(transfer) = self.outgoing.remove(transfer_id) {
            let _ = transfer.cancel.send(true);
            info!("Outgoing transfer {} {}", transfer_id, reason);
            updates.push(TransferUpdate::Failed {
                transfer_id: transfer_id.to_string(),
                direction: TransferDirection::Send,
                reason: reason.to_string(),
            });
        }
        if let Some(transfer) = self.incoming.remove(transfer_id) {
            transfer.sink.abort().await;
            info!("Incoming transfer {} {}", transfer_id, reason);
            updates.push(TransferUpdate::Failed {
                transfer_id: transfer_id.to_string(),
                direction: TransferDirection::Receive,
                reason: reason.to_string(),
            });
        }
        self.announced.remove(transfer_id);
        updates
    }
}

/// Byte range and last-chunk flag for chunk `index`.
fn chunk_bounds(file_size: usize, chunk_size: usize, index: usize) -> (usize, usize, bool) {
    let start = index * chunk_size;
    let end = (start + chunk_size).min(file_size);
    (start, end, end >= file_size)
}

fn percentage(done: u32, total: u32) -> f32 {
    if total == 0 {
        100.0
    } else {
        done as f32 / total as f32 * 100.0
    }
}

/// Sequentially send accept + chunks + completion for one requester, paced
/// by a fixed delay so the channel send buffer is never saturated.
#[allow(clippy::too_many_arguments)]
fn spawn_send(
    channel: Arc<dyn DataChannel>,
    offer: FileOffer,
    data: Arc<Vec<u8>>,
    peer_id: String,
    delay: Duration,
    sent_chunks: Arc<AtomicU32>,
    cancel: watch::Receiver<bool>,
    events: mpsc::Sender<EngineEvent>,
) {
    tokio::spawn(async move {
        let transfer_id = offer.file_id.clone();

        let accept = ChannelFrame::FileAccept {
            file_id: transfer_id.clone(),
            to_peer_id: peer_id.clone(),
        };
        if let Err(e) = send_frame(&channel, &accept).await {
            let _ = events
                .send(EngineEvent::SendFailed {
                    transfer_id,
                    peer_id,
                    reason: e.to_string(),
                })
                .await;
            return;
        }

        let chunk_size = offer.chunk_size as usize;
        for index in 0..offer.total_chunks as usize {
            if *cancel.borrow() {
                debug!("Send of {} to {} cancelled", transfer_id, peer_id);
                return;
            }

            let (start, end, is_last) = chunk_bounds(data.len(), chunk_size, index);
            let frame = ChannelFrame::FileChunk(FileChunk {
                file_id: transfer_id.clone(),
                chunk_index: index as u32,
                total_chunks: offer.total_chunks,
                data: BASE64.encode(&data[start..end]),
                is_last,
            });
            if let Err(e) = send_frame(&channel, &frame).await {
                let _ = events
                    .send(EngineEvent::SendFailed {
                        transfer_id,
                        peer_id,
                        reason: e.to_string(),
                    })
                    .await;
                return;
            }

            let done = sent_chunks.fetch_add(1, Ordering::Relaxed) + 1;
            let _ = events
                .send(EngineEvent::Progress(TransferProgress {
                    transfer_id: transfer_id.clone(),
                    direction: TransferDirection::Send,
                    chunks_done: done,
                    total_chunks: offer.total_chunks,
                    bytes_done: end as u64,
                    total_bytes: offer.file_size,
                    percentage: percentage(done, offer.total_chunks),
                }))
                .await;

            if !is_last {
                tokio::time::sleep(delay).await;
            }
        }

        let complete = ChannelFrame::FileComplete {
            file_id: transfer_id.clone(),
        };
        if let Err(e) = send_frame(&channel, &complete).await {
            let _ = events
                .send(EngineEvent::SendFailed {
                    transfer_id,
                    peer_id,
                    reason: e.to_string(),
                })
                .await;
            return;
        }

        let _ = events
            .send(EngineEvent::SendFinished {
                transfer_id,
                peer_id,
            })
            .await;
    });
}

async fn send_frame(channel: &Arc<dyn DataChannel>, frame: &ChannelFrame) -> Result<()> {
    let text = frame
        .to_json()
        .map_err(|e| Error::Transfer(format!("frame serialization: {}", e)))?;
    channel.send_text(&text).await
}
