//! Data-channel control frames
//!
//! Every data-channel message is one JSON text frame: `{type, data}`.
//! Chunk payloads are base64-encoded so binary content rides inside the
//! single text-message protocol.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// A chat message, also the carrier for file-offer announcements.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub timestamp_ms: u64,
    /// Present when this message announces a downloadable file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileOffer>,
}

impl ChatMessage {
    pub fn new(sender_id: &str, sender_name: &str, text: &str) -> Self {
        Self {
            id: generate_transfer_id(),
            sender_id: sender_id.to_string(),
            sender_name: sender_name.to_string(),
            text: text.to_string(),
            timestamp_ms: current_timestamp_ms(),
            file: None,
        }
    }

    pub fn with_file(mut self, offer: FileOffer) -> Self {
        self.file = Some(offer);
        self
    }
}

/// Announcement of a file available for transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileOffer {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub chunk_size: u32,
    pub total_chunks: u32,
}

impl FileOffer {
    /// Number of chunks needed for `file_size` bytes at `chunk_size`.
    pub fn chunk_count(file_size: u64, chunk_size: u32) -> u32 {
        if chunk_size == 0 {
            return 0;
        }
        file_size.div_ceil(chunk_size as u64) as u32
    }
}

/// One file chunk. `chunk_index` is zero-based; `is_last` is true iff the
/// next chunk offset would reach or exceed the file size.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    pub file_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    /// Base64-encoded payload
    pub data: String,
    pub is_last: bool,
}

/// All control frames exchanged over a peer data channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChannelFrame {
    Chat(ChatMessage),
    #[serde(rename_all = "camelCase")]
    FileRequest {
        file_id: String,
        requester_id: String,
    },
    #[serde(rename_all = "camelCase")]
    FileAccept { file_id: String, to_peer_id: String },
    FileChunk(FileChunk),
    #[serde(rename_all = "camelCase")]
    FileComplete { file_id: String },
    #[serde(rename_all = "camelCase")]
    FileCancel { file_id: String },
    Ping {},
    Pong {},
}

impl ChannelFrame {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Frame kind for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Chat(_) => "chat",
            Self::FileRequest { .. } => "file_request",
            Self::FileAccept { .. } => "file_accept",
            Self::FileChunk(_) => "file_chunk",
            Self::FileComplete { .. } => "file_complete",
            Self::FileCancel { .. } => "file_cancel",
            Self::Ping {} => "ping",
            Self::Pong {} => "pong",
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Transfer identity: millisecond timestamp plus a random suffix so that
/// ids generated in the same instant cannot collide.
pub fn generate_transfer_id() -> String {
    let suffix: u32 = rand::random();
    format!("{}-{:08x}", current_timestamp_ms(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_count() {
        assert_eq!(FileOffer::chunk_count(50_000, 16_384), 4);
        assert_eq!(FileOffer::chunk_count(16_384, 16_384), 1);
        assert_eq!(FileOffer::chunk_count(16_385, 16_384), 2);
        assert_eq!(FileOffer::chunk_count(0, 16_384), 0);
        assert_eq!(FileOffer::chunk_count(1, 16_384), 1);
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = ChannelFrame::FileChunk(FileChunk {
            file_id: "1700000000000-00c0ffee".into(),
            chunk_index: 3,
            total_chunks: 4,
            data: "aGVsbG8=".into(),
            is_last: true,
        });
        let json = frame.to_json().unwrap();
        assert!(json.contains("\"type\":\"file_chunk\""));
        assert!(json.contains("\"fileId\""));
        assert!(json.contains("\"isLast\":true"));
        assert_eq!(ChannelFrame::parse(&json).unwrap(), frame);
    }

    #[test]
    fn test_ping_frame_shape() {
        let json = ChannelFrame::Ping {}.to_json().unwrap();
        assert_eq!(json, r#"{"type":"ping","data":{}}"#);
    }

    #[test]
    fn test_chat_carries_file_offer() {
        let offer = FileOffer {
            file_id: "id".into(),
            file_name: "report.pdf".into(),
            file_size: 50_000,
            mime_type: "application/pdf".into(),
            chunk_size: 16_384,
            total_chunks: 4,
        };
        let message = ChatMessage::new("p-1", "alice", "sharing a file").with_file(offer.clone());
        let frame = ChannelFrame::Chat(message);
        let json = frame.to_json().unwrap();
        match ChannelFrame::parse(&json).unwrap() {
            ChannelFrame::Chat(chat) => assert_eq!(chat.file, Some(offer)),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_transfer_ids_are_unique() {
        let a = generate_transfer_id();
        let b = generate_transfer_id();
        assert_ne!(a, b);
    }
}
