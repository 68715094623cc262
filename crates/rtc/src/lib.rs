//! Roomcast real-time core
//!
//! Peer-to-peer communication for Roomcast sessions: a signalling client
//! over WebSocket, a per-peer negotiation registry driving the `webrtc`
//! engine, and a chunked file-transfer protocol riding the peer data
//! channel alongside chat.
//!
//! # Architecture
//!
//! - [`signaling`] — one control connection per session: identity
//!   assignment, peer discovery, offer/answer/candidate relay, reconnects
//! - [`peer`] — the registry owning one negotiation state machine per
//!   remote peer: initiation tie-breaks, candidate buffering, renegotiation
//! - [`channels`] — chat frames and the chunked file-transfer engine
//! - [`transport`] — the engine capability seam and its `webrtc` adapter
//! - [`session`] — the composition root exposing one command/event surface
//!
//! # Example
//!
//! ```ignore
//! use roomcast_rtc::config::RtcConfig;
//! use roomcast_rtc::session::RtcSession;
//! use roomcast_rtc::signaling::MemoryIdentityStore;
//! use roomcast_rtc::transport::webrtc::WebRtcEngine;
//! use std::sync::Arc;
//!
//! let config = RtcConfig {
//!     endpoint: "wss://signal.example.com/ws".into(),
//!     auth_token: token,
//!     ..Default::default()
//! };
//! let engine = Arc::new(WebRtcEngine::new()?);
//! let (session, mut events) = RtcSession::spawn(config, engine, media, store)?;
//! session.connect("session-1").await?;
//! while let Some(event) = events.recv().await {
//!     // drive the UI
//! }
//! ```

pub mod channels;
pub mod config;
pub mod error;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod transport;

pub use channels::{ChatMessage, FileOffer, TransferDirection, TransferProgress, TransferStatus};
pub use config::RtcConfig;
pub use error::{Error, Result};
pub use session::{RtcSession, SessionEvent};
pub use signaling::{PeerRole, SignalingSession};
pub use transport::{TrackSource, TransportConnectionState};
