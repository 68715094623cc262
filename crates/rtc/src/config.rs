//! Configuration for the real-time core

use crate::error::{Error, Result};
use crate::signaling::protocol::PeerRole;
use crate::transport::IceServer;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default chunk size for data-channel file transfers (bytes).
///
/// Chunks are base64-encoded into JSON text frames, so the encoded frame
/// stays comfortably under the engine's message-size ceiling.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Default delay between consecutive chunk frames (milliseconds).
pub const DEFAULT_CHUNK_DELAY_MS: u64 = 20;

/// Default base delay before a scheduled signalling reconnect (milliseconds).
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3_000;

/// Label used for the peer data channel.
pub const DATA_CHANNEL_LABEL: &str = "roomcast";

/// Configuration for an [`crate::session::RtcSession`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcConfig {
    /// Signalling endpoint, e.g. `wss://signal.example.com/ws`
    pub endpoint: String,

    /// Bearer token appended to the connection URL
    pub auth_token: String,

    /// Role announced to the signalling endpoint
    pub peer_role: PeerRole,

    /// Display name announced to remote peers
    pub display_name: String,

    /// ICE servers used until the endpoint supplies its own list
    pub ice_servers: Vec<IceServer>,

    /// Base delay before a scheduled reconnect; multiplied by the attempt count
    pub reconnect_delay_ms: u64,

    /// File transfer chunk size in bytes
    pub chunk_size: usize,

    /// Fixed pacing delay between chunk frames in milliseconds
    pub chunk_delay_ms: u64,

    /// Directory where received files are written
    pub download_dir: PathBuf,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            auth_token: String::new(),
            peer_role: PeerRole::Participant,
            display_name: String::new(),
            ice_servers: Vec::new(),
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay_ms: DEFAULT_CHUNK_DELAY_MS,
            download_dir: std::env::temp_dir(),
        }
    }
}

impl RtcConfig {
    /// Validate the configuration before a session is spawned.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(Error::Config("signalling endpoint is required".into()));
        }
        if self.auth_token.is_empty() {
            return Err(Error::Config("authentication token is required".into()));
        }
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be non-zero".into()));
        }
        Ok(())
    }

    /// Pacing delay between chunk frames.
    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    /// Base reconnect delay; the scheduler multiplies this by the attempt count.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RtcConfig::default();
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.reconnect_delay_ms, DEFAULT_RECONNECT_DELAY_MS);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_endpoint_and_token() {
        let config = RtcConfig {
            endpoint: "wss://signal.example.com/ws".into(),
            auth_token: "token".into(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
