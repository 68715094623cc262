//! Plain data types shared between the core and engine adapters

use serde::{Deserialize, Serialize};

/// One ICE server entry, as supplied by configuration or by the signalling
/// endpoint in `connection.established`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceServer {
    /// Server URLs (`stun:` / `turn:`)
    pub urls: Vec<String>,
    /// TURN username, if the server requires credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// A serialized ICE candidate as exchanged over the signalling channel.
///
/// Field aliases accept the camelCase spelling some endpoints emit; the
/// canonical output form is snake_case.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(default, alias = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        alias = "sdpMLineIndex",
        alias = "sdpMlineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}
