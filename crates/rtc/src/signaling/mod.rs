//! Control-channel signalling
//!
//! One WebSocket connection to the signalling endpoint carries peer
//! discovery and negotiation relay. Wire messages arrive in either
//! snake_case or camelCase; [`protocol`] normalizes both into one canonical
//! shape at this boundary, and [`session`] owns the connection lifecycle,
//! reconnect policy and roster.

pub mod protocol;
pub mod session;
pub mod store;

pub use protocol::{PeerCheck, PeerRole, RemotePeer, WireMessage};
pub use session::{ConnectionState, SignalingEvent, SignalingSession};
pub use store::{FileIdentityStore, IdentityStore, MemoryIdentityStore, CLIENT_PEER_ID_KEY};
