//! Session orchestration
//!
//! [`RtcSession`] is the composition root: it wires signalling output into
//! the peer registry, runs the file-transfer engine over open data channels,
//! and exposes one command/event surface to the embedding UI.
//!
//! Everything runs on a single event loop task. The registry and transfer
//! engine are owned exclusively by that task and mutated one event at a
//! time, so no locks guard their maps.

mod events;

pub use events::SessionEvent;

use crate::channels::{
    ChannelFrame, ChatMessage, EngineEvent, FileTransferEngine, TransferUpdate,
};
use crate::config::RtcConfig;
use crate::error::{Error, Result};
use crate::peer::{PeerNotice, PeerRegistry};
use crate::signaling::{IdentityStore, SignalingEvent, SignalingSession};
use crate::transport::{MediaSource, TrackSource, TransportEvent, TransportFactory};
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Commands accepted by the session event loop.
enum SessionCommand {
    Connect {
        session_id: String,
    },
    Disconnect,
    SetMedia {
        source: TrackSource,
        enabled: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    SendChat {
        text: String,
    },
    OfferFile {
        path: PathBuf,
        reply: oneshot::Sender<Result<String>>,
    },
    RequestFile {
        transfer_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    CancelTransfer {
        transfer_id: String,
    },
    Shutdown,
}

/// Handle to a running session. Cheap to clone; dropping every handle shuts
/// the event loop down.
#[derive(Clone)]
pub struct RtcSession {
    commands: mpsc::Sender<SessionCommand>,
}

impl RtcSession {
    /// Spawn the session event loop.
    ///
    /// Returns the command handle and the event stream for the UI layer.
    pub fn spawn(
        config: RtcConfig,
        factory: Arc<dyn TransportFactory>,
        media: Arc<dyn MediaSource>,
        store: Arc<dyn IdentityStore>,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>)> {
        config.validate()?;

        let (signaling_tx, signaling_rx) = mpsc::channel(64);
        let (transport_tx, transport_rx) = mpsc::channel(64);
        let (engine_tx, engine_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);
        let (command_tx, command_rx) = mpsc::channel(32);

        let signaling = SignalingSession::new(&config, store, signaling_tx);
        let registry = PeerRegistry::new(
            factory,
            signaling.clone(),
            transport_tx,
            config.ice_servers.clone(),
        );
        let engine = FileTransferEngine::new(
            config.chunk_size,
            config.chunk_delay(),
            config.download_dir.clone(),
            engine_tx,
        );

        let worker = SessionWorker {
            display_name: config.display_name.clone(),
            local_peer_id: None,
            signaling,
            registry,
            engine,
            media,
            events: event_tx,
            signaling_rx,
            transport_rx,
            engine_rx,
            command_rx,
        };
        tokio::spawn(worker.run());

        Ok((
            Self {
                commands: command_tx,
            },
            event_rx,
        ))
    }

    /// Connect the control channel for `session_id`.
    pub async fn connect(&self, session_id: &str) -> Result<()> {
        self.command(SessionCommand::Connect {
            session_id: session_id.to_string(),
        })
        .await
    }

    /// Disconnect the control channel and tear down all peer connections.
    pub async fn disconnect(&self) -> Result<()> {
        self.command(SessionCommand::Disconnect).await
    }

    /// Enable or disable a local media source. Fails without side effects
    /// when device acquisition fails.
    pub async fn set_media(&self, source: TrackSource, enabled: bool) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.command(SessionCommand::SetMedia {
            source,
            enabled,
            reply,
        })
        .await?;
        response.await.map_err(|_| Error::SessionClosed)?
    }

    /// Broadcast a chat message to every connected peer.
    pub async fn send_chat(&self, text: &str) -> Result<()> {
        self.command(SessionCommand::SendChat {
            text: text.to_string(),
        })
        .await
    }

    /// Offer a local file to every connected peer. Returns the transfer
    /// identity.
    pub async fn offer_file(&self, path: PathBuf) -> Result<String> {
        let (reply, response) = oneshot::channel();
        self.command(SessionCommand::OfferFile { path, reply }).await?;
        response.await.map_err(|_| Error::SessionClosed)?
    }

    /// Request a file a peer has offered.
    pub async fn request_file(&self, transfer_id: &str) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.command(SessionCommand::RequestFile {
            transfer_id: transfer_id.to_string(),
            reply,
        })
        .await?;
        response.await.map_err(|_| Error::SessionClosed)?
    }

    /// Cancel a transfer in either direction.
    pub async fn cancel_transfer(&self, transfer_id: &str) -> Result<()> {
        self.command(SessionCommand::CancelTransfer {
            transfer_id: transfer_id.to_string(),
        })
        .await
    }

    /// Stop the event loop, closing every connection.
    pub async fn shutdown(&self) -> Result<()> {
        self.command(SessionCommand::Shutdown).await
    }

    async fn command(&self, command: SessionCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::SessionClosed)
    }
}

struct SessionWorker {
    display_name: String,
    local_peer_id: Option<String>,
    signaling: SignalingSession,
    registry: PeerRegistry,
    engine: FileTransferEngine,
    media: Arc<dyn MediaSource>,
    events: mpsc::Sender<SessionEvent>,
    signaling_rx: mpsc::Receiver<SignalingEvent>,
    transport_rx: mpsc::Receiver<TransportEvent>,
    engine_rx: mpsc::Receiver<EngineEvent>,
    command_rx: mpsc::Receiver<SessionCommand>,
}

impl SessionWorker {
    async fn run(mut self) {
        info!("Session event loop started");
        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(SessionCommand::Shutdown) | None => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
                Some(event) = self.signaling_rx.recv() => {
                    self.handle_signaling_event(event).await;
                }
                Some(event) = self.transport_rx.recv() => {
                    let notices = self.registry.handle_transport_event(event).await;
                    for notice in notices {
                        self.handle_peer_notice(notice).await;
                    }
                }
                Some(event) = self.engine_rx.recv() => {
                    self.handle_engine_event(event).await;
                }
            }
        }

        self.registry.close_all().await;
        self.signaling.disconnect();
        info!("Session event loop stopped");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Connect { session_id } => {
                self.signaling.connect(&session_id).await;
            }
            SessionCommand::Disconnect => {
                self.registry.close_all().await;
                self.signaling.disconnect();
            }
            SessionCommand::SetMedia {
                source,
                enabled,
                reply,
            } => {
                let result = self.set_media(source, enabled).await;
                let _ = reply.send(result);
            }
            SessionCommand::SendChat { text } => {
                let sender_id = self.local_peer_id.clone().unwrap_or_default();
                let message = ChatMessage::new(&sender_id, &self.display_name, &text);
                self.broadcast_frame(&ChannelFrame::Chat(message)).await;
            }
            SessionCommand::OfferFile { path, reply } => {
                let sender_id = self.local_peer_id.clone().unwrap_or_default();
                let result = match self
                    .engine
                    .offer_file(&path, &sender_id, &self.display_name)
                    .await
                {
                    Ok((transfer_id, frame)) => {
                        let delivered = self.broadcast_frame(&frame).await;
                        if delivered == 0 {
                            warn!("File offer {} reached no peers", transfer_id);
                        }
                        Ok(transfer_id)
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            SessionCommand::RequestFile { transfer_id, reply } => {
                let result = match self.engine.request_frame(&transfer_id) {
                    Ok((to_peer_id, frame)) => match frame.to_json() {
                        Ok(text) => self.registry.send_text_to(&to_peer_id, &text).await,
                        Err(e) => Err(Error::Transfer(e.to_string())),
                    },
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            SessionCommand::CancelTransfer { transfer_id } => {
                let (frame, updates) = self.engine.cancel(&transfer_id).await;
                if let Some(frame) = frame {
                    self.broadcast_frame(&frame).await;
                }
                self.emit_transfer_updates(updates).await;
            }
            // Intercepted by the select loop before dispatch
            SessionCommand::Shutdown => {}
        }
    }

    /// Acquire-before-commit: a device failure aborts the toggle with no
    /// track attached and no renegotiation triggered.
    async fn set_media(&mut self, source: TrackSource, enabled: bool) -> Result<()> {
        if enabled {
            let track = self.media.acquire(source).await?;
            self.registry.enable_track(track).await;
        } else {
            self.registry.disable_track(source).await;
        }
        let (has_video, has_audio, has_screen_share) = self.registry.local_capabilities();
        self.signaling
            .send_peer_state("connected", has_video, has_audio, has_screen_share)
            .await;
        Ok(())
    }

    async fn handle_signaling_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected => {
                self.emit(SessionEvent::SignalingConnected).await;
            }
            SignalingEvent::Established {
                peer_id,
                session_id,
                is_reconnection,
                ice_servers,
            } => {
                self.local_peer_id = Some(peer_id.clone());
                self.registry.set_local_peer_id(peer_id.clone());
                self.registry.set_ice_servers(ice_servers);
                self.engine.set_local_peer_id(peer_id.clone());
                self.emit(SessionEvent::SignalingEstablished {
                    peer_id,
                    session_id,
                    is_reconnection,
                })
                .await;
                // Ask for the roster so negotiation starts with everyone
                // already in the session.
                self.signaling.send_check().await;
            }
            SignalingEvent::PeerCheck(check) => {
                self.emit(SessionEvent::PeerDiscovered {
                    peer_id: check.from_peer_id.clone(),
                    username: check.from_username.clone(),
                    role: check.peer_role,
                })
                .await;
                self.registry.handle_peer_check(check).await;
            }
            SignalingEvent::PeerLeft { peer_id } => {
                self.registry.handle_peer_left(&peer_id).await;
                self.emit(SessionEvent::PeerLeft { peer_id }).await;
            }
            SignalingEvent::Offer { from_peer_id, sdp } => {
                self.registry.handle_offer(&from_peer_id, sdp).await;
            }
            SignalingEvent::Answer { from_peer_id, sdp } => {
                self.registry.handle_answer(&from_peer_id, sdp).await;
            }
            SignalingEvent::IceCandidate {
                from_peer_id,
                candidate,
            } => {
                self.registry
                    .handle_ice_candidate(&from_peer_id, candidate)
                    .await;
            }
            SignalingEvent::PeerStateUpdate {
                from_peer_id,
                connection_state,
                has_video,
                has_audio,
                has_screen_share,
            } => {
                self.emit(SessionEvent::PeerCapabilities {
                    peer_id: from_peer_id,
                    connection_state,
                    has_video,
                    has_audio,
                    has_screen_share,
                })
                .await;
            }
            SignalingEvent::Disconnected { code, will_retry } => {
                // Existing peer links keep operating on their own.
                self.emit(SessionEvent::SignalingDisconnected { code, will_retry })
                    .await;
            }
            SignalingEvent::ForcedLogout => {
                self.emit(SessionEvent::ForcedLogout).await;
            }
            SignalingEvent::ReconnectDisabled => {
                self.emit(SessionEvent::ReconnectDisabled).await;
            }
        }
    }

    async fn handle_peer_notice(&mut self, notice: PeerNotice) {
        match notice {
            PeerNotice::StateChanged { peer_id, state } => {
                self.emit(SessionEvent::PeerStateChanged { peer_id, state })
                    .await;
            }
            PeerNotice::ChannelOpen { peer_id } => {
                self.emit(SessionEvent::PeerChannelOpen { peer_id }).await;
            }
            PeerNotice::ChannelMessage { peer_id, payload } => {
                self.handle_channel_payload(&peer_id, payload).await;
            }
            PeerNotice::StreamAdded { peer_id, stream_id } => {
                self.emit(SessionEvent::PeerStreamAdded { peer_id, stream_id })
                    .await;
            }
            PeerNotice::StreamRemoved { peer_id } => {
                self.emit(SessionEvent::PeerStreamRemoved { peer_id }).await;
            }
            PeerNotice::Removed { peer_id } => {
                self.emit(SessionEvent::PeerClosed { peer_id }).await;
            }
        }
    }

    async fn handle_channel_payload(&mut self, peer_id: &str, payload: Bytes) {
        let text = match std::str::from_utf8(&payload) {
            Ok(text) => text,
            Err(_) => {
                warn!("Non-text frame from {}", peer_id);
                return;
            }
        };
        let frame = match ChannelFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Ignoring malformed channel frame from {}: {}", peer_id, e);
                return;
            }
        };
        debug!("Channel frame from {}: {}", peer_id, frame.kind());

        match frame {
            ChannelFrame::Chat(message) => {
                if let Some(offer) = message.file.clone() {
                    let update = self.engine.register_offer(peer_id, offer);
                    self.emit_transfer_updates(vec![update]).await;
                }
                self.emit(SessionEvent::Chat {
                    from_peer_id: peer_id.to_string(),
                    message,
                })
                .await;
            }
            ChannelFrame::FileRequest { file_id, .. } => {
                let channel = self.registry.channel(peer_id);
                self.engine.on_request(peer_id, &file_id, channel);
            }
            ChannelFrame::FileAccept { file_id, .. } => {
                self.engine.on_accept(peer_id, &file_id).await;
            }
            ChannelFrame::FileChunk(chunk) => {
                let updates = self.engine.on_chunk(peer_id, chunk).await;
                self.emit_transfer_updates(updates).await;
            }
            ChannelFrame::FileComplete { file_id } => {
                let updates = self.engine.on_complete(&file_id).await;
                self.emit_transfer_updates(updates).await;
            }
            ChannelFrame::FileCancel { file_id } => {
                let updates = self.engine.on_remote_cancel(&file_id).await;
                self.emit_transfer_updates(updates).await;
            }
            ChannelFrame::Ping {} => {
                if let Err(e) = self
                    .registry
                    .send_text_to(peer_id, &pong_text())
                    .await
                {
                    debug!("Pong to {} failed: {}", peer_id, e);
                }
            }
            ChannelFrame::Pong {} => {}
        }
    }

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Progress(progress) => {
                self.emit(SessionEvent::TransferProgress(progress)).await;
            }
            EngineEvent::SendFinished {
                transfer_id,
                peer_id,
            } => {
                let updates = self.engine.on_send_finished(&transfer_id, &peer_id);
                self.emit_transfer_updates(updates).await;
            }
            EngineEvent::SendFailed {
                transfer_id,
                peer_id,
                reason,
            } => {
                let updates = self.engine.on_send_failed(&transfer_id, &peer_id, reason);
                self.emit_transfer_updates(updates).await;
            }
        }
    }

    async fn emit_transfer_updates(&self, updates: Vec<TransferUpdate>) {
        for update in updates {
            let event = match update {
                TransferUpdate::Offered {
                    from_peer_id,
                    offer,
                } => SessionEvent::TransferOffered {
                    from_peer_id,
                    offer,
                },
                TransferUpdate::Progress(progress) => SessionEvent::TransferProgress(progress),
                TransferUpdate::Completed {
                    transfer_id,
                    direction,
                    path,
                } => SessionEvent::TransferCompleted {
                    transfer_id,
                    direction,
                    path,
                },
                TransferUpdate::Failed {
                    transfer_id,
                    direction,
                    reason,
                } => SessionEvent::TransferFailed {
                    transfer_id,
                    direction,
                    reason,
                },
            };
            self.emit(event).await;
        }
    }

    async fn broadcast_frame(&self, frame: &ChannelFrame) -> usize {
        match frame.to_json() {
            Ok(text) => self.registry.broadcast_text(&text).await,
            Err(e) => {
                warn!("Failed to serialize {} frame: {}", frame.kind(), e);
                0
            }
        }
    }

    async fn emit(&self, event: SessionEvent) {
        debug!("Session event: {}", event.name());
        if self.events.send(event).await.is_err() {
            debug!("Session event receiver dropped");
        }
    }
}

fn pong_text() -> String {
    ChannelFrame::Pong {}
        .to_json()
        .unwrap_or_else(|_| r#"{"type":"pong","data":{}}"#.to_string())
}
