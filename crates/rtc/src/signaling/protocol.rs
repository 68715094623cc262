//! Signalling wire protocol
//!
//! One message = one JSON text frame, tagged by `type`. Endpoints in the
//! wild emit either snake_case or camelCase keys; every multi-word field
//! carries a serde alias so both spellings parse into the one canonical
//! shape defined here. Normalization happens at this boundary only — nothing
//! past the parser ever branches on key style. Output is always snake_case.

use crate::transport::{IceCandidateInit, IceServer};
use serde::{Deserialize, Serialize};

/// Negotiation role a participant holds within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Host,
    Viewer,
    Participant,
}

impl Default for PeerRole {
    fn default() -> Self {
        Self::Participant
    }
}

/// Roster entry for a remote participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemotePeer {
    #[serde(alias = "peerId")]
    pub peer_id: String,
    #[serde(default, alias = "userId")]
    pub user_id: String,
    #[serde(default, alias = "userName")]
    pub username: String,
    #[serde(default, alias = "peerRole")]
    pub peer_role: PeerRole,
    /// Last state the endpoint reported for this peer
    #[serde(default = "default_connection_state", alias = "connectionState")]
    pub connection_state: String,
    #[serde(default, alias = "hasVideo")]
    pub has_video: bool,
    #[serde(default, alias = "hasAudio")]
    pub has_audio: bool,
    #[serde(default, alias = "hasScreenShare")]
    pub has_screen_share: bool,
}

fn default_connection_state() -> String {
    "connected".to_string()
}

/// Discovery notice for one peer, either relayed live by the endpoint or
/// synthesized locally from a roster response / join notice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerCheck {
    #[serde(alias = "fromPeerId")]
    pub from_peer_id: String,
    #[serde(default, alias = "fromUserId")]
    pub from_user_id: String,
    #[serde(default, alias = "fromUsername")]
    pub from_username: String,
    #[serde(default, alias = "peerRole")]
    pub peer_role: PeerRole,
}

/// All control-channel messages, inbound and outbound.
///
/// Direction-dependent addressing fields are optional: the endpoint stamps
/// `from_peer_id` onto relayed negotiation messages, while clients set
/// `to_peer_id` when sending them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum WireMessage {
    /// First message after the socket opens: assigned identities and the
    /// endpoint's ICE server list.
    #[serde(rename = "connection.established")]
    ConnectionEstablished {
        #[serde(alias = "peerId")]
        peer_id: String,
        #[serde(alias = "sessionId")]
        session_id: String,
        /// Stable identity to persist client-side for reconnect recognition
        #[serde(default, alias = "clientPeerId")]
        client_peer_id: Option<String>,
        #[serde(default, alias = "isReconnection")]
        is_reconnection: bool,
        #[serde(default, alias = "iceServers")]
        ice_servers: Vec<IceServer>,
    },

    /// Outbound roster request
    #[serde(rename = "check")]
    Check {
        #[serde(alias = "peerRole")]
        peer_role: PeerRole,
    },

    /// Bulk roster response
    #[serde(rename = "check.response")]
    CheckResponse {
        #[serde(default)]
        peers: Vec<RemotePeer>,
    },

    #[serde(rename = "peer.joined")]
    PeerJoined {
        #[serde(alias = "peerId")]
        peer_id: String,
        #[serde(default, alias = "userId")]
        user_id: String,
        #[serde(default)]
        username: String,
        #[serde(default, alias = "peerRole")]
        peer_role: PeerRole,
    },

    #[serde(rename = "peer.left")]
    PeerLeft {
        #[serde(alias = "peerId")]
        peer_id: String,
        #[serde(default, alias = "userId")]
        user_id: String,
        #[serde(default)]
        username: String,
    },

    #[serde(rename = "peer.check")]
    PeerCheck(PeerCheck),

    #[serde(rename = "offer")]
    Offer {
        #[serde(default, alias = "toPeerId", skip_serializing_if = "Option::is_none")]
        to_peer_id: Option<String>,
        #[serde(default, alias = "fromPeerId", skip_serializing_if = "Option::is_none")]
        from_peer_id: Option<String>,
        sdp: String,
    },

    #[serde(rename = "answer")]
    Answer {
        #[serde(default, alias = "toPeerId", skip_serializing_if = "Option::is_none")]
        to_peer_id: Option<String>,
        #[serde(default, alias = "fromPeerId", skip_serializing_if = "Option::is_none")]
        from_peer_id: Option<String>,
        sdp: String,
    },

    #[serde(rename = "ice_candidate", alias = "iceCandidate")]
    IceCandidate {
        #[serde(default, alias = "toPeerId", skip_serializing_if = "Option::is_none")]
        to_peer_id: Option<String>,
        #[serde(default, alias = "fromPeerId", skip_serializing_if = "Option::is_none")]
        from_peer_id: Option<String>,
        candidate: IceCandidateInit,
    },

    #[serde(rename = "peer.state_update", alias = "peer.stateUpdate")]
    PeerStateUpdate {
        #[serde(default, alias = "fromPeerId", skip_serializing_if = "Option::is_none")]
        from_peer_id: Option<String>,
        #[serde(alias = "connectionState")]
        connection_state: String,
        #[serde(default, alias = "hasVideo")]
        has_video: bool,
        #[serde(default, alias = "hasAudio")]
        has_audio: bool,
        #[serde(default, alias = "hasScreenShare")]
        has_screen_share: bool,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: String,
    },
}

impl WireMessage {
    /// Parse one inbound text frame into the canonical shape.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Serialize for the wire in the canonical snake_case form.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Message kind for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "connection.established",
            Self::Check { .. } => "check",
            Self::CheckResponse { .. } => "check.response",
            Self::PeerJoined { .. } => "peer.joined",
            Self::PeerLeft { .. } => "peer.left",
            Self::PeerCheck(_) => "peer.check",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice_candidate",
            Self::PeerStateUpdate { .. } => "peer.state_update",
            Self::Error { .. } => "error",
        }
    }
}

/// Close codes with a defined meaning on the control channel.
pub mod close_codes {
    /// Authentication invalid: terminal, forces re-authentication
    pub const AUTH_FAILURE: u16 = 4001;
    /// Permission denied: terminal, no reconnect
    pub const PERMISSION_DENIED: u16 = 4003;
    /// Normal closure
    pub const NORMAL: u16 = 1000;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_established_accepts_camel_case() {
        let text = r#"{
            "type": "connection.established",
            "peerId": "p-7",
            "sessionId": "s-1",
            "clientPeerId": "c-42",
            "isReconnection": true,
            "iceServers": [{"urls": ["stun:stun.example.com"]}]
        }"#;
        let msg = WireMessage::parse(text).unwrap();
        match msg {
            WireMessage::ConnectionEstablished {
                peer_id,
                session_id,
                client_peer_id,
                is_reconnection,
                ice_servers,
            } => {
                assert_eq!(peer_id, "p-7");
                assert_eq!(session_id, "s-1");
                assert_eq!(client_peer_id.as_deref(), Some("c-42"));
                assert!(is_reconnection);
                assert_eq!(ice_servers.len(), 1);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_established_accepts_snake_case() {
        let text = r#"{
            "type": "connection.established",
            "peer_id": "p-7",
            "session_id": "s-1"
        }"#;
        let msg = WireMessage::parse(text).unwrap();
        assert_eq!(msg.kind(), "connection.established");
    }

    #[test]
    fn test_offer_roundtrip_is_snake_case() {
        let msg = WireMessage::Offer {
            to_peer_id: Some("p-9".into()),
            from_peer_id: None,
            sdp: "v=0".into(),
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"to_peer_id\""));
        assert!(!json.contains("toPeerId"));
        assert_eq!(WireMessage::parse(&json).unwrap(), msg);
    }

    #[test]
    fn test_roster_entry_defaults() {
        let text = r#"{
            "type": "check.response",
            "peers": [{"peerId": "p-2", "peerRole": "host"}]
        }"#;
        let msg = WireMessage::parse(text).unwrap();
        match msg {
            WireMessage::CheckResponse { peers } => {
                assert_eq!(peers[0].peer_id, "p-2");
                assert_eq!(peers[0].peer_role, PeerRole::Host);
                assert_eq!(peers[0].connection_state, "connected");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_frame_is_an_error_not_a_panic() {
        assert!(WireMessage::parse("{\"type\":\"no.such.kind\"}").is_err());
        assert!(WireMessage::parse("not json").is_err());
    }
}
