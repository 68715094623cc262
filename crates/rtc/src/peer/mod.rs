//! Peer negotiation
//!
//! One [`PeerConnection`] record per remote peer, owned by the
//! [`PeerRegistry`]. The registry decides initiation tie-breaks, buffers
//! out-of-order ICE candidates, and triggers renegotiation when local
//! capabilities change.

pub mod connection;
pub mod registry;

pub use connection::{NegotiationState, PeerConnection};
pub use registry::{PeerNotice, PeerRegistry};
