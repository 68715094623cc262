//! File-transfer protocol tests: offer/request/accept handshake, chunk
//! round-trip, progress accounting, cancellation.

mod support;

use roomcast_rtc::channels::{
    ChannelFrame, EngineEvent, FileTransferEngine, TransferDirection, TransferStatus,
    TransferUpdate,
};
use roomcast_rtc::transport::DataChannel;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use support::MockChannel;
use tokio::sync::mpsc;
use tokio::time::timeout;

const FILE_SIZE: usize = 50_000;
const CHUNK_SIZE: usize = 16_384;

fn test_bytes() -> Vec<u8> {
    (0..FILE_SIZE).map(|i| (i % 251) as u8).collect()
}

fn engine(
    dir: &std::path::Path,
    chunk_delay_ms: u64,
) -> (FileTransferEngine, mpsc::Receiver<EngineEvent>) {
    let (tx, rx) = mpsc::channel(256);
    let engine = FileTransferEngine::new(
        CHUNK_SIZE,
        Duration::from_millis(chunk_delay_ms),
        dir.to_path_buf(),
        tx,
    );
    (engine, rx)
}

async fn drive_send_to_completion(
    engine: &mut FileTransferEngine,
    events: &mut mpsc::Receiver<EngineEvent>,
) -> (Vec<f32>, Vec<TransferUpdate>) {
    let mut percentages = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("send stalled")
            .expect("engine event channel closed");
        match event {
            EngineEvent::Progress(progress) => percentages.push(progress.percentage),
            EngineEvent::SendFinished {
                transfer_id,
                peer_id,
            } => {
                return (percentages, engine.on_send_finished(&transfer_id, &peer_id));
            }
            EngineEvent::SendFailed { reason, .. } => panic!("send failed: {}", reason),
        }
    }
}

#[tokio::test]
async fn test_round_trip_transfer() {
    support::init_tracing();
    let send_dir = tempfile::tempdir().unwrap();
    let recv_dir = tempfile::tempdir().unwrap();
    let source = send_dir.path().join("payload.bin");
    std::fs::write(&source, test_bytes()).unwrap();

    let (mut sender, mut sender_events) = engine(send_dir.path(), 1);
    let (mut receiver, _receiver_events) = engine(recv_dir.path(), 1);
    sender.set_local_peer_id("send-peer".into());
    receiver.set_local_peer_id("recv-peer".into());

    // Offer: 50,000 bytes at 16,384 per chunk is exactly 4 chunks.
    let (transfer_id, offer_frame) = sender
        .offer_file(&source, "send-peer", "sender")
        .await
        .unwrap();
    assert_eq!(sender.outgoing_status(&transfer_id), Some(TransferStatus::Pending));

    let offer = match &offer_frame {
        ChannelFrame::Chat(message) => message.file.clone().expect("offer attached"),
        other => panic!("expected chat frame, got {:?}", other),
    };
    assert_eq!(offer.total_chunks, 4);
    assert_eq!(offer.file_size, FILE_SIZE as u64);

    // Receiver sees the offer and requests it.
    receiver.register_offer("send-peer", offer.clone());
    let (to_peer, request) = receiver.request_frame(&transfer_id).unwrap();
    assert_eq!(to_peer, "send-peer");
    match request {
        ChannelFrame::FileRequest {
            file_id,
            requester_id,
        } => {
            assert_eq!(file_id, transfer_id);
            assert_eq!(requester_id, "recv-peer");
        }
        other => panic!("expected request frame, got {:?}", other),
    }

    // Sender accepts and streams chunks into the channel.
    let channel = Arc::new(MockChannel::new("roomcast"));
    sender.on_request(
        "recv-peer",
        &transfer_id,
        Some(Arc::clone(&channel) as Arc<dyn DataChannel>),
    );
    assert_eq!(
        sender.outgoing_status(&transfer_id),
        Some(TransferStatus::Transferring)
    );

    let (sent_percentages, finish_updates) =
        drive_send_to_completion(&mut sender, &mut sender_events).await;
    assert_eq!(sent_percentages.len(), 4);
    assert!(sent_percentages.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(sent_percentages.last().copied(), Some(100.0));
    assert!(matches!(
        finish_updates.as_slice(),
        [TransferUpdate::Completed {
            direction: TransferDirection::Send,
            ..
        }]
    ));
    assert_eq!(sender.outgoing_status(&transfer_id), None);

    // Wire contents: accept, 4 chunks (exactly one marked last), complete.
    let frames: Vec<ChannelFrame> = channel
        .sent_frames()
        .iter()
        .map(|text| ChannelFrame::parse(text).unwrap())
        .collect();
    assert_eq!(frames.len(), 6);
    assert!(matches!(frames[0], ChannelFrame::FileAccept { .. }));
    assert!(matches!(frames[5], ChannelFrame::FileComplete { .. }));
    let chunks: Vec<_> = frames
        .iter()
        .filter_map(|f| match f {
            ChannelFrame::FileChunk(chunk) => Some(chunk.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(chunks.len(), 4);
    assert_eq!(chunks.iter().filter(|c| c.is_last).count(), 1);
    assert!(chunks.last().unwrap().is_last);
    assert_eq!(
        chunks.iter().map(|c| c.chunk_index).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );

    // Receiver applies the same sequence.
    receiver.on_accept("send-peer", &transfer_id).await;
    assert_eq!(
        receiver.incoming_status(&transfer_id),
        Some(TransferStatus::Transferring)
    );

    let mut recv_percentages = Vec::new();
    let mut completed_path: Option<PathBuf> = None;
    for chunk in chunks {
        for update in receiver.on_chunk("send-peer", chunk).await {
            match update {
                TransferUpdate::Progress(progress) => {
                    assert_eq!(progress.total_chunks, 4);
                    recv_percentages.push(progress.percentage);
                }
                TransferUpdate::Completed {
                    direction: TransferDirection::Receive,
                    path,
                    ..
                } => completed_path = path,
                other => panic!("unexpected update: {:?}", other),
            }
        }
    }
    assert_eq!(recv_percentages.len(), 4);
    assert!(recv_percentages.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(recv_percentages.last().copied(), Some(100.0));

    // The declared last chunk finalized the transfer; the completion frame
    // that follows is an idempotent no-op.
    assert!(receiver.on_complete(&transfer_id).await.is_empty());

    let path = completed_path.expect("transfer materialized");
    assert_eq!(std::fs::read(&path).unwrap(), test_bytes());
    assert_eq!(receiver.incoming_status(&transfer_id), None);
}

#[tokio::test]
async fn test_receiver_cancel_aborts_and_removes_partial_file() {
    let recv_dir = tempfile::tempdir().unwrap();
    let (mut receiver, _events) = engine(recv_dir.path(), 1);
    receiver.set_local_peer_id("recv-peer".into());

    let offer = roomcast_rtc::channels::FileOffer {
        file_id: "t-1".into(),
        file_name: "partial.bin".into(),
        file_size: FILE_SIZE as u64,
        mime_type: "application/octet-stream".into(),
        chunk_size: CHUNK_SIZE as u32,
        total_chunks: 4,
    };
    receiver.register_offer("send-peer", offer);
    receiver.on_accept("send-peer", "t-1").await;

    use base64::Engine as _;
    let chunk = roomcast_rtc::channels::FileChunk {
        file_id: "t-1".into(),
        chunk_index: 0,
        total_chunks: 4,
        data: base64::engine::general_purpose::STANDARD.encode(vec![7u8; CHUNK_SIZE]),
        is_last: false,
    };
    receiver.on_chunk("send-peer", chunk.clone()).await;

    let (frame, updates) = receiver.cancel("t-1").await;
    assert!(matches!(frame, Some(ChannelFrame::FileCancel { .. })));
    assert!(matches!(
        updates.as_slice(),
        [TransferUpdate::Failed {
            direction: TransferDirection::Receive,
            ..
        }]
    ));
    assert!(!recv_dir.path().join("partial.bin").exists());

    // Late chunks for the cancelled transfer are dropped.
    assert!(receiver.on_chunk("send-peer", chunk).await.is_empty());
}

#[tokio::test]
async fn test_remote_cancel_stops_sender() {
    let send_dir = tempfile::tempdir().unwrap();
    let source = send_dir.path().join("payload.bin");
    std::fs::write(&source, test_bytes()).unwrap();

    // Slow pacing so the cancel lands mid-send.
    let (mut sender, _events) = engine(send_dir.path(), 50);
    sender.set_local_peer_id("send-peer".into());

    let (transfer_id, _) = sender
        .offer_file(&source, "send-peer", "sender")
        .await
        .unwrap();
    let channel = Arc::new(MockChannel::new("roomcast"));
    sender.on_request(
        "recv-peer",
        &transfer_id,
        Some(Arc::clone(&channel) as Arc<dyn DataChannel>),
    );

    let updates = sender.on_remote_cancel(&transfer_id).await;
    assert!(matches!(
        updates.as_slice(),
        [TransferUpdate::Failed {
            direction: TransferDirection::Send,
            ..
        }]
    ));
    assert_eq!(sender.outgoing_status(&transfer_id), None);

    // The pacing task observes the cancel signal and stops early.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let sent_after_cancel = channel.sent_frames().len();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(channel.sent_frames().len(), sent_after_cancel);
    assert!(sent_after_cancel < 6, "send should not have completed");
}

#[tokio::test]
async fn test_request_for_unknown_offer_fails() {
    let dir = tempfile::tempdir().unwrap();
    let (mut transfers, _events) = engine(dir.path(), 1);
    transfers.set_local_peer_id("recv-peer".into());
    assert!(transfers.request_frame("no-such-transfer").is_err());
}
