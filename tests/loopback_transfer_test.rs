//! End-to-end transfer tests over an in-process channel pair.
//!
//! These drive the real sender and receiver tasks against each other and
//! assert on observable behavior: wire frames, events, artifacts, and the
//! exported bundle.

use std::sync::{Arc, Once};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use sendlink::{
    decode_bundle, event_channel, ArtifactSet, Channel, ChannelMessage, DirStreamFactory, Exporter,
    Frame,
    MemoryChannel, OutboundFile, ReceiveState, Receiver, ReceiverConfig, SendHandle, SendQueue,
    SendState, SendlinkError, SenderConfig, TransferEvent,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Opt-in logging for test debugging, driven by RUST_LOG.
fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

struct Harness {
    sender: SendHandle,
    events: mpsc::UnboundedReceiver<TransferEvent>,
    artifacts: Arc<ArtifactSet>,
    local: MemoryChannel,
    send_task: JoinHandle<Result<(), SendlinkError>>,
}

fn spawn_pipeline(sender_config: SenderConfig, receiver_config: ReceiverConfig) -> Harness {
    init_tracing();
    let ((local, _local_rx), (remote, remote_rx)) = MemoryChannel::pair();
    let (events_tx, events) = event_channel();

    let receiver = Receiver::with_config(events_tx.clone(), receiver_config);
    let artifacts = receiver.artifacts();
    tokio::spawn(receiver.run(remote_rx, Arc::new(remote)));

    let (sender, queue) = SendQueue::with_config(Arc::new(local.clone()), events_tx, sender_config);
    let send_task = tokio::spawn(queue.run());

    Harness {
        sender,
        events,
        artifacts,
        local,
        send_task,
    }
}

/// Pull events until one matches, failing the test on timeout.
async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<TransferEvent>,
    mut pred: impl FnMut(&TransferEvent) -> bool,
) -> TransferEvent {
    timeout(EVENT_TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// =============================================================================
// Wire-level behavior
// =============================================================================

#[tokio::test]
async fn test_frame_sequence_for_one_file() {
    init_tracing();
    let ((local, _), (_remote, mut remote_rx)) = MemoryChannel::pair();
    let (events_tx, _events) = event_channel();

    let (sender, queue) = SendQueue::new(Arc::new(local), events_tx);
    let send_task = tokio::spawn(queue.run());
    sender
        .enqueue(OutboundFile::from_bytes("data.bin", patterned(40000)))
        .await
        .unwrap();
    drop(sender);
    send_task.await.unwrap().unwrap();

    let mut frames = Vec::new();
    while let Ok(msg) = remote_rx.try_recv() {
        frames.push(Frame::decode(msg).unwrap());
    }

    // metadata, three chunks, end-of-file
    assert_eq!(frames.len(), 5);
    match &frames[0] {
        Frame::Metadata(meta) => {
            assert_eq!(meta.filename, "data.bin");
            assert_eq!(meta.filesize, 40000);
        }
        other => panic!("expected metadata first, got {other:?}"),
    }
    let chunk_sizes: Vec<usize> = frames[1..4]
        .iter()
        .map(|f| match f {
            Frame::Chunk { id, payload } => {
                assert_eq!(id, "t1");
                payload.len()
            }
            other => panic!("expected chunk, got {other:?}"),
        })
        .collect();
    assert_eq!(chunk_sizes, vec![16384, 16384, 7232]);
    assert!(matches!(&frames[4], Frame::EndOfFile { id } if id == "t1"));
}

#[tokio::test]
async fn test_zero_byte_file_sends_no_chunks() {
    init_tracing();
    let ((local, _), (_remote, mut remote_rx)) = MemoryChannel::pair();
    let (events_tx, _events) = event_channel();

    let (sender, queue) = SendQueue::new(Arc::new(local), events_tx);
    let send_task = tokio::spawn(queue.run());
    sender
        .enqueue(OutboundFile::from_bytes("empty.bin", Bytes::new()))
        .await
        .unwrap();
    drop(sender);
    send_task.await.unwrap().unwrap();

    let mut frames = Vec::new();
    while let Ok(msg) = remote_rx.try_recv() {
        frames.push(Frame::decode(msg).unwrap());
    }
    assert_eq!(frames.len(), 2, "zero-byte file is metadata plus end-of-file");
    assert!(matches!(frames[0], Frame::Metadata(_)));
    assert!(matches!(&frames[1], Frame::EndOfFile { .. }));
}

// =============================================================================
// Full pipeline
// =============================================================================

#[tokio::test]
async fn test_file_arrives_intact() {
    let mut h = spawn_pipeline(SenderConfig::default(), ReceiverConfig::default());
    let data = patterned(40000);
    h.sender
        .enqueue(OutboundFile::from_bytes("data.bin", data.clone()))
        .await
        .unwrap();

    let event = wait_for(&mut h.events, |e| {
        matches!(e, TransferEvent::ReceiveCompleted { .. })
    })
    .await;
    let TransferEvent::ReceiveCompleted { artifact, .. } = event else {
        unreachable!();
    };
    assert_eq!(artifact.name, "data.bin");
    assert_eq!(artifact.size, 40000);
    assert_eq!(artifact.bytes().await.unwrap().as_ref(), &data[..]);

    let completed = h.artifacts.completed();
    assert_eq!(completed.len(), 1);
    assert_eq!(h.artifacts.pending(), 0);
}

#[tokio::test]
async fn test_files_complete_in_submission_order() {
    let mut h = spawn_pipeline(SenderConfig::default(), ReceiverConfig::default());
    for name in ["first.bin", "second.bin", "third.bin"] {
        h.sender
            .enqueue(OutboundFile::from_bytes(name, patterned(5000)))
            .await
            .unwrap();
    }

    let mut completed = Vec::new();
    while completed.len() < 3 {
        if let TransferEvent::ReceiveCompleted { artifact, .. } =
            wait_for(&mut h.events, |e| {
                matches!(e, TransferEvent::ReceiveCompleted { .. })
            })
            .await
        {
            completed.push(artifact.name);
        }
    }
    assert_eq!(completed, vec!["first.bin", "second.bin", "third.bin"]);
}

#[tokio::test]
async fn test_event_stream_mirrors_state_machines() {
    let mut h = spawn_pipeline(SenderConfig::default(), ReceiverConfig::default());
    h.sender
        .enqueue(OutboundFile::from_bytes("a.bin", patterned(100)))
        .await
        .unwrap();

    let mut send_states = Vec::new();
    let mut receive_states = Vec::new();
    loop {
        let event = wait_for(&mut h.events, |_| true).await;
        if let Some(state) = event.send_state() {
            send_states.push(state);
        }
        if let Some(state) = event.receive_state() {
            receive_states.push(state);
        }
        if matches!(event, TransferEvent::ReceiveCompleted { .. }) {
            break;
        }
    }

    assert_eq!(send_states.first(), Some(&SendState::Queued));
    assert!(send_states.contains(&SendState::Active));
    assert_eq!(receive_states.first(), Some(&ReceiveState::Receiving));
    assert_eq!(receive_states.last(), Some(&ReceiveState::Complete));
}

#[tokio::test]
async fn test_progress_events_are_cumulative() {
    let mut h = spawn_pipeline(SenderConfig::default(), ReceiverConfig::default());
    h.sender
        .enqueue(OutboundFile::from_bytes("data.bin", patterned(40000)))
        .await
        .unwrap();

    let mut last = 0u64;
    loop {
        match wait_for(&mut h.events, |e| {
            matches!(
                e,
                TransferEvent::ReceiveProgress { .. } | TransferEvent::ReceiveCompleted { .. }
            )
        })
        .await
        {
            TransferEvent::ReceiveProgress {
                bytes_received,
                filesize,
                ..
            } => {
                assert!(bytes_received > last, "progress must be strictly increasing");
                assert!(bytes_received <= filesize);
                last = bytes_received;
            }
            TransferEvent::ReceiveCompleted { .. } => break,
            _ => unreachable!(),
        }
    }
    assert_eq!(last, 40000);
}

#[tokio::test]
async fn test_disk_file_roundtrip() {
    let src_dir = tempfile::tempdir().unwrap();
    let path = src_dir.path().join("source.bin");
    let data = patterned(33000);
    tokio::fs::write(&path, &data).await.unwrap();

    let mut h = spawn_pipeline(SenderConfig::default(), ReceiverConfig::default());
    h.sender
        .enqueue(OutboundFile::from_path(&path).await.unwrap())
        .await
        .unwrap();

    let event = wait_for(&mut h.events, |e| {
        matches!(e, TransferEvent::ReceiveCompleted { .. })
    })
    .await;
    let TransferEvent::ReceiveCompleted { artifact, .. } = event else {
        unreachable!();
    };
    assert_eq!(artifact.name, "source.bin");
    assert_eq!(artifact.bytes().await.unwrap().as_ref(), &data[..]);
}

#[tokio::test]
async fn test_streaming_receive_into_directory() {
    let dest = tempfile::tempdir().unwrap();
    let config = ReceiverConfig {
        max_in_flight: 1,
        stream_factory: Some(Arc::new(DirStreamFactory::new(dest.path()))),
    };
    let mut h = spawn_pipeline(SenderConfig::default(), config);
    let data = patterned(20000);
    h.sender
        .enqueue(OutboundFile::from_bytes("big.bin", data.clone()))
        .await
        .unwrap();

    let event = wait_for(&mut h.events, |e| {
        matches!(e, TransferEvent::ReceiveCompleted { .. })
    })
    .await;
    let TransferEvent::ReceiveCompleted { artifact, .. } = event else {
        unreachable!();
    };
    match &artifact.data {
        sendlink::ArtifactData::File(path) => {
            assert!(path.starts_with(dest.path()));
            let on_disk = tokio::fs::read(path).await.unwrap();
            assert_eq!(on_disk, data);
        }
        other => panic!("expected streamed artifact, got {other:?}"),
    }
}

// =============================================================================
// Backpressure
// =============================================================================

#[tokio::test]
async fn test_sender_suspends_above_high_watermark() {
    init_tracing();
    let ((local, _), (_remote, mut remote_rx)) = MemoryChannel::pair();
    let (events_tx, _events) = event_channel();

    let config = SenderConfig {
        chunk_size: 64,
        high_watermark: 50,
        low_watermark: 16,
    };
    let backlog = local.backlog_handle();
    backlog.freeze();

    let (sender, queue) = SendQueue::with_config(Arc::new(local), events_tx, config);
    tokio::spawn(queue.run());
    sender
        .enqueue(OutboundFile::from_bytes("slow.bin", patterned(512)))
        .await
        .unwrap();

    // metadata alone pushes the frozen backlog past the high watermark, so
    // the sender must stall before the first chunk
    let first = timeout(EVENT_TIMEOUT, remote_rx.recv()).await.unwrap().unwrap();
    assert!(matches!(Frame::decode(first).unwrap(), Frame::Metadata(_)));
    let stalled = timeout(Duration::from_millis(200), remote_rx.recv()).await;
    assert!(stalled.is_err(), "no frames may flow while suspended");

    // draining below the low watermark resumes the transfer
    backlog.release();
    let mut payload_total = 0;
    loop {
        let msg = timeout(EVENT_TIMEOUT, remote_rx.recv()).await.unwrap().unwrap();
        match Frame::decode(msg).unwrap() {
            Frame::Chunk { payload, .. } => payload_total += payload.len(),
            Frame::EndOfFile { .. } => break,
            other => panic!("unexpected frame {other:?}"),
        }
    }
    assert_eq!(payload_total, 512);
}

#[tokio::test]
async fn test_close_during_suspension_fails_active_and_queued() {
    let mut h = spawn_pipeline(
        SenderConfig {
            chunk_size: 64,
            high_watermark: 100,
            low_watermark: 16,
        },
        ReceiverConfig::default(),
    );
    let backlog = h.local.backlog_handle();
    backlog.freeze();

    h.sender
        .enqueue(OutboundFile::from_bytes("active.bin", patterned(512)))
        .await
        .unwrap();
    h.sender
        .enqueue(OutboundFile::from_bytes("queued.bin", patterned(16)))
        .await
        .unwrap();

    // let the first transfer stall against the watermark, then cut the cord
    wait_for(&mut h.events, |e| {
        matches!(e, TransferEvent::SendStarted { .. })
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.local.close();

    let result = h.send_task.await.unwrap();
    assert!(matches!(result, Err(SendlinkError::TransportClosed)));

    let mut failures = 0;
    while failures < 2 {
        wait_for(&mut h.events, |e| {
            matches!(e, TransferEvent::SendFailed { .. })
        })
        .await;
        failures += 1;
    }
}

#[tokio::test]
async fn test_receiver_fails_in_flight_transfers_on_close() {
    let ((local, _), (remote, remote_rx)) = MemoryChannel::pair();
    let (events_tx, mut events) = event_channel();

    let receiver = Receiver::new(events_tx);
    let artifacts = receiver.artifacts();
    let recv_task = tokio::spawn(receiver.run(remote_rx, Arc::new(remote)));

    let meta = sendlink::FileMetadata {
        id: "t1".to_string(),
        filename: "partial.bin".to_string(),
        filesize: 1000,
        filetype: "application/octet-stream".to_string(),
    };
    local
        .send(Frame::Metadata(meta).encode().unwrap())
        .await
        .unwrap();
    local
        .send(
            Frame::Chunk {
                id: "t1".to_string(),
                payload: Bytes::from(patterned(100)),
            }
            .encode()
            .unwrap(),
        )
        .await
        .unwrap();

    wait_for(&mut events, |e| {
        matches!(e, TransferEvent::ReceiveProgress { .. })
    })
    .await;
    local.close();
    recv_task.await.unwrap();

    let failed = wait_for(&mut events, |e| {
        matches!(e, TransferEvent::ReceiveFailed { .. })
    })
    .await;
    let TransferEvent::ReceiveFailed { id, .. } = failed else {
        unreachable!();
    };
    assert_eq!(id, "t1");
    assert_eq!(artifacts.pending(), 0);
    assert!(artifacts.completed().is_empty());
}

// =============================================================================
// Export
// =============================================================================

#[tokio::test]
async fn test_export_bundles_every_completed_file() {
    let mut h = spawn_pipeline(SenderConfig::default(), ReceiverConfig::default());
    h.sender
        .enqueue(OutboundFile::from_bytes("a.txt", &b"alpha"[..]).with_mime_type("text/plain"))
        .await
        .unwrap();
    h.sender
        .enqueue(OutboundFile::from_bytes("b.txt", &b"bravo"[..]).with_mime_type("text/plain"))
        .await
        .unwrap();

    let mut done = 0;
    while done < 2 {
        wait_for(&mut h.events, |e| {
            matches!(e, TransferEvent::ReceiveCompleted { .. })
        })
        .await;
        done += 1;
    }

    let bundle = Exporter::new().export_all(&h.artifacts).await.unwrap();
    let entries = decode_bundle(bundle).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name, "a.txt");
    assert_eq!(entries[0].mime_type, "text/plain");
    assert_eq!(entries[0].data.as_ref(), b"alpha");
    assert_eq!(entries[1].name, "b.txt");
    assert_eq!(entries[1].data.as_ref(), b"bravo");
}

#[tokio::test]
async fn test_export_refused_while_receive_in_flight() {
    let (events_tx, _events) = event_channel();
    let mut receiver = Receiver::new(events_tx);
    let artifacts = receiver.artifacts();

    let meta = sendlink::FileMetadata {
        id: "t1".to_string(),
        filename: "partial.bin".to_string(),
        filesize: 1000,
        filetype: "application/octet-stream".to_string(),
    };
    receiver
        .handle_message(Frame::Metadata(meta).encode().unwrap())
        .await;

    let err = Exporter::new().export_all(&artifacts).await;
    assert!(matches!(err, Err(SendlinkError::Export(_))));
}
