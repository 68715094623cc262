//! Signalling session
//!
//! Maintains exactly one logical control connection to the signalling
//! endpoint and translates wire messages into normalized [`SignalingEvent`]s.
//! Owns the reconnect policy and the roster of currently visible peers.
//!
//! Loss of the control channel is survivable: established peer connections
//! keep operating, and only a fresh `connect` resets the assigned peer and
//! session identity.

use super::protocol::{close_codes, PeerCheck, PeerRole, RemotePeer, WireMessage};
use super::store::{IdentityStore, CLIENT_PEER_ID_KEY};
use crate::config::RtcConfig;
use crate::transport::{IceCandidateInit, IceServer};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Control-connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Normalized events emitted to the orchestrator.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Socket opened; identity not yet assigned
    Connected,
    /// Endpoint assigned identities and supplied its ICE server list
    Established {
        peer_id: String,
        session_id: String,
        is_reconnection: bool,
        ice_servers: Vec<IceServer>,
    },
    /// A peer is present and ready for negotiation (live join or roster)
    PeerCheck(PeerCheck),
    /// A peer left the session
    PeerLeft { peer_id: String },
    Offer {
        from_peer_id: String,
        sdp: String,
    },
    Answer {
        from_peer_id: String,
        sdp: String,
    },
    IceCandidate {
        from_peer_id: String,
        candidate: IceCandidateInit,
    },
    PeerStateUpdate {
        from_peer_id: String,
        connection_state: String,
        has_video: bool,
        has_audio: bool,
        has_screen_share: bool,
    },
    /// Socket closed; `will_retry` reflects whether a reconnect is scheduled
    Disconnected {
        code: Option<u16>,
        will_retry: bool,
    },
    /// Close code 4001: authentication invalid, re-authentication required
    ForcedLogout,
    /// Close code 4003: permission denied, reconnection disabled
    ReconnectDisabled,
}

struct SessionState {
    connection: ConnectionState,
    peer_id: Option<String>,
    session_id: Option<String>,
    peers: HashMap<String, RemotePeer>,
    ice_servers: Vec<IceServer>,
    reconnect_attempts: u32,
    reconnect_enabled: bool,
    outbound: Option<mpsc::Sender<Message>>,
    socket_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
    /// Bumped on every connect/disconnect so a superseded socket task cannot
    /// touch state that no longer belongs to it
    epoch: u64,
}

struct Inner {
    endpoint: String,
    auth_token: String,
    peer_role: PeerRole,
    reconnect_delay: Duration,
    store: Arc<dyn IdentityStore>,
    events: mpsc::Sender<SignalingEvent>,
    state: Mutex<SessionState>,
}

/// Handle to the signalling session. Cheap to clone.
#[derive(Clone)]
pub struct SignalingSession {
    inner: Arc<Inner>,
}

impl SignalingSession {
    /// Create a session bound to the given endpoint and event sink.
    pub fn new(
        config: &RtcConfig,
        store: Arc<dyn IdentityStore>,
        events: mpsc::Sender<SignalingEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoint: config.endpoint.clone(),
                auth_token: config.auth_token.clone(),
                peer_role: config.peer_role,
                reconnect_delay: config.reconnect_delay(),
                store,
                events,
                state: Mutex::new(SessionState {
                    connection: ConnectionState::Disconnected,
                    peer_id: None,
                    session_id: None,
                    peers: HashMap::new(),
                    ice_servers: Vec::new(),
                    reconnect_attempts: 0,
                    reconnect_enabled: true,
                    outbound: None,
                    socket_task: None,
                    reconnect_task: None,
                    epoch: 0,
                }),
            }),
        }
    }

    /// Current control-connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().connection
    }

    /// Peer identity assigned by the endpoint, if any.
    pub fn local_peer_id(&self) -> Option<String> {
        self.inner.state.lock().peer_id.clone()
    }

    /// Session identity, if assigned.
    pub fn session_id(&self) -> Option<String> {
        self.inner.state.lock().session_id.clone()
    }

    /// Snapshot of the currently known remote peers.
    pub fn peers(&self) -> Vec<RemotePeer> {
        self.inner.state.lock().peers.values().cloned().collect()
    }

    /// ICE servers supplied by the endpoint (empty until established).
    pub fn ice_servers(&self) -> Vec<IceServer> {
        self.inner.state.lock().ice_servers.clone()
    }

    /// Open the control connection for `session_id`.
    ///
    /// Any prior connection is torn down first. The connection URL embeds the
    /// authentication token and, when one was persisted, the stable client
    /// peer identity so the endpoint can recognize a reconnecting client.
    pub async fn connect(&self, session_id: &str) {
        // Delegated to a free function whose return type is an explicit boxed
        // `Send` future. This breaks the auto-trait inference cycle created by
        // the reconnect path (`connect` spawns a socket task that can
        // eventually spawn a task calling `connect` again): a concrete `Send`
        // bound is discharged here instead of a same-scope opaque type.
        connect_impl(self.clone(), session_id.to_string()).await
    }

    /// Close the control connection and reset all public state. Idempotent.
    ///
    /// Cancels any pending reconnect. Does not touch established peer
    /// connections; those belong to the registry.
    pub fn disconnect(&self) {
        let mut state = self.inner.state.lock();
        Self::teardown_locked(&mut state);
        state.peer_id = None;
        state.session_id = None;
        state.peers.clear();
        state.ice_servers.clear();
        state.reconnect_attempts = 0;
        info!("Signalling session disconnected");
    }

    fn teardown_locked(state: &mut SessionState) {
        state.epoch += 1;
        if let Some(task) = state.socket_task.take() {
            task.abort();
        }
        if let Some(task) = state.reconnect_task.take() {
            task.abort();
        }
        state.outbound = None;
        state.connection = ConnectionState::Disconnected;
    }

    // ------------------------------------------------------------------
    // Outbound commands
    // ------------------------------------------------------------------

    /// Request the current roster.
    pub async fn send_check(&self) {
        let role = self.inner.peer_role;
        self.send_message(WireMessage::Check { peer_role: role }).await;
    }

    /// Send an offer to `to_peer_id`.
    pub async fn send_offer(&self, to_peer_id: &str, sdp: String) {
        self.send_message(WireMessage::Offer {
            to_peer_id: Some(to_peer_id.to_string()),
            from_peer_id: None,
            sdp,
        })
        .await;
    }

    /// Send an answer to `to_peer_id`.
    pub async fn send_answer(&self, to_peer_id: &str, sdp: String) {
        self.send_message(WireMessage::Answer {
            to_peer_id: Some(to_peer_id.to_string()),
            from_peer_id: None,
            sdp,
        })
        .await;
    }

    /// Relay a local ICE candidate to `to_peer_id`.
    pub async fn send_ice_candidate(&self, to_peer_id: &str, candidate: IceCandidateInit) {
        self.send_message(WireMessage::IceCandidate {
            to_peer_id: Some(to_peer_id.to_string()),
            from_peer_id: None,
            candidate,
        })
        .await;
    }

    /// Publish the local connection state and capability flags.
    pub async fn send_peer_state(
        &self,
        connection_state: &str,
        has_video: bool,
        has_audio: bool,
        has_screen_share: bool,
    ) {
        self.send_message(WireMessage::PeerStateUpdate {
            from_peer_id: None,
            connection_state: connection_state.to_string(),
            has_video,
            has_audio,
            has_screen_share,
        })
        .await;
    }

    /// Serialize and send immediately; unsent control messages are not
    /// buffered or retried.
    async fn send_message(&self, message: WireMessage) {
        let outbound = {
            let state = self.inner.state.lock();
            if state.connection != ConnectionState::Connected {
                warn!(
                    "Dropping outbound {} message: not connected",
                    message.kind()
                );
                return;
            }
            state.outbound.clone()
        };
        let Some(outbound) = outbound else {
            warn!("Dropping outbound {} message: no socket", message.kind());
            return;
        };
        match message.to_json() {
            Ok(text) => {
                if outbound.send(Message::Text(text)).await.is_err() {
                    warn!("Dropping outbound {} message: socket task gone", message.kind());
                }
            }
            Err(e) => warn!("Failed to serialize {} message: {}", message.kind(), e),
        }
    }

    // ------------------------------------------------------------------
    // Socket task
    // ------------------------------------------------------------------

    async fn run_socket(self, epoch: u64, session_id: String, url: String) {
        let stream = match connect_async(&url).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!("Signalling connection failed: {}", e);
                self.finish_socket(epoch, &session_id, None).await;
                return;
            }
        };

        let (mut ws_tx, mut ws_rx) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(64);

        {
            let mut state = self.inner.state.lock();
            if state.epoch != epoch {
                return;
            }
            state.connection = ConnectionState::Connected;
            state.reconnect_attempts = 0;
            state.outbound = Some(outbound_tx);
        }
        info!("Signalling connection open");
        self.emit(SignalingEvent::Connected).await;

        let mut close_code: Option<u16> = None;
        loop {
            tokio::select! {
                Some(message) = outbound_rx.recv() => {
                    if let Err(e) = ws_tx.send(message).await {
                        warn!("Signalling send failed: {}", e);
                        break;
                    }
                }
                inbound = ws_rx.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => self.handle_frame(&text).await,
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = ws_tx.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            close_code = frame.map(|f| u16::from(f.code));
                            debug!("Signalling connection closed by endpoint: {:?}", close_code);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Signalling socket error: {}", e);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        self.finish_socket(epoch, &session_id, close_code).await;
    }

    /// Inbound frames are normalized here; a frame that does not parse is
    /// logged and dropped, never fatal.
    async fn handle_frame(&self, text: &str) {
        let message = match WireMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring malformed signalling frame: {}", e);
                return;
            }
        };
        debug!("Signalling message: {}", message.kind());

        match message {
            WireMessage::ConnectionEstablished {
                peer_id,
                session_id,
                client_peer_id,
                is_reconnection,
                ice_servers,
            } => {
                let stable_id = client_peer_id.unwrap_or_else(|| peer_id.clone());
                if let Err(e) = self.inner.store.set(CLIENT_PEER_ID_KEY, &stable_id).await {
                    warn!("Failed to persist client peer identity: {}", e);
                }
                {
                    let mut state = self.inner.state.lock();
                    state.peer_id = Some(peer_id.clone());
                    state.session_id = Some(session_id.clone());
                    state.ice_servers = ice_servers.clone();
                }
                info!(
                    "Assigned peer identity {} in session {} (reconnection: {})",
                    peer_id, session_id, is_reconnection
                );
                self.emit(SignalingEvent::Established {
                    peer_id,
                    session_id,
                    is_reconnection,
                    ice_servers,
                })
                .await;
            }

            WireMessage::CheckResponse { peers } => {
                let own_id = self.local_peer_id();
                let survivors: Vec<RemotePeer> = peers
                    .into_iter()
                    .filter(|p| Some(&p.peer_id) != own_id.as_ref())
                    .filter(|p| p.connection_state != "disconnected")
                    .collect();
                {
                    let mut state = self.inner.state.lock();
                    state.peers =
                        survivors.iter().map(|p| (p.peer_id.clone(), p.clone())).collect();
                }
                debug!("Roster replaced: {} peers", survivors.len());
                // Every surviving peer is treated exactly like a live join so
                // negotiation starts uniformly regardless of discovery path.
                for peer in survivors {
                    self.emit(SignalingEvent::PeerCheck(PeerCheck {
                        from_peer_id: peer.peer_id,
                        from_user_id: peer.user_id,
                        from_username: peer.username,
                        peer_role: peer.peer_role,
                    }))
                    .await;
                }
            }

            WireMessage::PeerJoined {
                peer_id,
                user_id,
                username,
                peer_role,
            } => {
                let is_new = {
                    let mut state = self.inner.state.lock();
                    if state.peers.contains_key(&peer_id) {
                        false
                    } else {
                        state.peers.insert(
                            peer_id.clone(),
                            RemotePeer {
                                peer_id: peer_id.clone(),
                                user_id: user_id.clone(),
                                username: username.clone(),
                                peer_role,
                                connection_state: "connected".into(),
                                has_video: false,
                                has_audio: false,
                                has_screen_share: false,
                            },
                        );
                        true
                    }
                };
                if !is_new {
                    debug!("Duplicate join notice for {}", peer_id);
                    return;
                }
                info!("Peer joined: {} ({})", peer_id, username);
                self.emit(SignalingEvent::PeerCheck(PeerCheck {
                    from_peer_id: peer_id,
                    from_user_id: user_id,
                    from_username: username,
                    peer_role,
                }))
                .await;
            }

            WireMessage::PeerLeft { peer_id, .. } => {
                self.inner.state.lock().peers.remove(&peer_id);
                info!("Peer left: {}", peer_id);
                self.emit(SignalingEvent::PeerLeft { peer_id }).await;
            }

            WireMessage::PeerCheck(check) => {
                self.emit(SignalingEvent::PeerCheck(check)).await;
            }

            WireMessage::Offer {
                from_peer_id, sdp, ..
            } => match from_peer_id {
                Some(from_peer_id) => {
                    self.emit(SignalingEvent::Offer { from_peer_id, sdp }).await
                }
                None => warn!("Ignoring offer without sender identity"),
            },

            WireMessage::Answer {
                from_peer_id, sdp, ..
            } => match from_peer_id {
                Some(from_peer_id) => {
                    self.emit(SignalingEvent::Answer { from_peer_id, sdp }).await
                }
                None => warn!("Ignoring answer without sender identity"),
            },

            WireMessage::IceCandidate {
                from_peer_id,
                candidate,
                ..
            } => match from_peer_id {
                Some(from_peer_id) => {
                    self.emit(SignalingEvent::IceCandidate {
                        from_peer_id,
                        candidate,
                    })
                    .await
                }
                None => warn!("Ignoring ICE candidate without sender identity"),
            },

            WireMessage::PeerStateUpdate {
                from_peer_id,
                connection_state,
                has_video,
                has_audio,
                has_screen_share,
            } => {
                let Some(from_peer_id) = from_peer_id else {
                    warn!("Ignoring state update without sender identity");
                    return;
                };
                {
                    let mut state = self.inner.state.lock();
                    if let Some(peer) = state.peers.get_mut(&from_peer_id) {
                        peer.connection_state = connection_state.clone();
                        peer.has_video = has_video;
                        peer.has_audio = has_audio;
                        peer.has_screen_share = has_screen_share;
                    }
                }
                self.emit(SignalingEvent::PeerStateUpdate {
                    from_peer_id,
                    connection_state,
                    has_video,
                    has_audio,
                    has_screen_share,
                })
                .await;
            }

            WireMessage::Error { message } => {
                warn!("Signalling endpoint error: {}", message);
            }

            WireMessage::Check { .. } => {
                debug!("Ignoring outbound-only message kind on inbound path");
            }
        }
    }

    /// Close handling: 4001 and 4003 are terminal; any other non-normal
    /// closure schedules exactly one reconnect attempt if a session identity
    /// was previously assigned and reconnection is still enabled.
    async fn finish_socket(&self, epoch: u64, session_id: &str, close_code: Option<u16>) {
        let decision = {
            let mut state = self.inner.state.lock();
            if state.epoch != epoch {
                return;
            }
            state.connection = ConnectionState::Disconnected;
            state.outbound = None;

            match close_code {
                Some(close_codes::AUTH_FAILURE) => {
                    state.reconnect_enabled = false;
                    CloseDecision::ForcedLogout
                }
                Some(close_codes::PERMISSION_DENIED) => {
                    state.reconnect_enabled = false;
                    CloseDecision::ReconnectDisabled
                }
                Some(close_codes::NORMAL) => CloseDecision::Final,
                _ => {
                    if state.reconnect_enabled && state.session_id.is_some() {
                        state.reconnect_attempts += 1;
                        CloseDecision::Retry(state.reconnect_attempts)
                    } else {
                        CloseDecision::Final
                    }
                }
            }
        };

        match decision {
            CloseDecision::ForcedLogout => {
                warn!("Signalling closed with authentication failure; forcing logout");
                if let Err(e) = self.inner.store.clear(CLIENT_PEER_ID_KEY).await {
                    warn!("Failed to clear persisted identity: {}", e);
                }
                self.emit(SignalingEvent::Disconnected {
                    code: close_code,
                    will_retry: false,
                })
                .await;
                self.emit(SignalingEvent::ForcedLogout).await;
            }
            CloseDecision::ReconnectDisabled => {
                warn!("Signalling closed with permission denial; reconnection disabled");
                self.emit(SignalingEvent::Disconnected {
                    code: close_code,
                    will_retry: false,
                })
                .await;
                self.emit(SignalingEvent::ReconnectDisabled).await;
            }
            CloseDecision::Final => {
                self.emit(SignalingEvent::Disconnected {
                    code: close_code,
                    will_retry: false,
                })
                .await;
            }
            CloseDecision::Retry(attempt) => {
                let delay = self.inner.reconnect_delay * attempt;
                info!(
                    "Scheduling signalling reconnect attempt {} in {:?}",
                    attempt, delay
                );
                self.emit(SignalingEvent::Disconnected {
                    code: close_code,
                    will_retry: true,
                })
                .await;
                let session = self.clone();
                let session_id = session_id.to_string();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    session.connect(&session_id).await;
                });
                let mut state = self.inner.state.lock();
                if state.epoch == epoch {
                    state.reconnect_task = Some(task);
                } else {
                    task.abort();
                }
            }
        }
    }

    async fn emit(&self, event: SignalingEvent) {
        if self.inner.events.send(event).await.is_err() {
            debug!("Signalling event receiver dropped");
        }
    }
}

/// Body of [`SignalingSession::connect`], factored out with an explicit boxed
/// `Send` return type so the reconnect recursion does not require fetching an
/// opaque `async fn` type from within its own defining scope.
fn connect_impl(
    session: SignalingSession,
    session_id: String,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async move {
        let client_peer_id = session
            .inner
            .store
            .get(CLIENT_PEER_ID_KEY)
            .await
            .unwrap_or_else(|e| {
                warn!("Identity store read failed: {}", e);
                None
            });

        let epoch = {
            let mut state = session.inner.state.lock();
            SignalingSession::teardown_locked(&mut state);
            state.connection = ConnectionState::Connecting;
            state.reconnect_enabled = true;
            state.epoch
        };

        let mut url = format!(
            "{}?token={}&session_id={}",
            session.inner.endpoint, session.inner.auth_token, session_id
        );
        if let Some(ref id) = client_peer_id {
            url.push_str("&client_peer_id=");
            url.push_str(id);
        }

        info!("Connecting to signalling endpoint for session {}", session_id);

        let run = session.clone();
        let task = tokio::spawn(async move {
            run.run_socket(epoch, session_id, url).await;
        });

        let mut state = session.inner.state.lock();
        if state.epoch == epoch {
            state.socket_task = Some(task);
        } else {
            task.abort();
        }
    })
}

enum CloseDecision {
    ForcedLogout,
    ReconnectDisabled,
    Final,
    Retry(u32),
}
