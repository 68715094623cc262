//! Data-channel traffic
//!
//! Chat and file transfer share one ordered-reliable channel per peer.
//! [`frames`] defines the JSON control frames, [`transfer`] runs the chunked
//! transfer protocol on top of them, and [`sink`] handles receive-side
//! persistence with transparent in-memory fallback.

pub mod frames;
pub mod sink;
pub mod transfer;

pub use frames::{ChannelFrame, ChatMessage, FileChunk, FileOffer};
pub use sink::ReceiveSink;
pub use transfer::{
    EngineEvent, FileTransferEngine, TransferDirection, TransferProgress, TransferStatus,
    TransferUpdate,
};
