use crate::*;

use offload_core::wire::{self, Message};
use offload_services::{Task, TaskOutcome};
use tokio::net::TcpStream;

/// GRANT → OK → payload → DONE counts one remote completion and nothing else.
#[tokio::test]
async fn test_grant_path_counts_remote_once() {
    let broker = start_broker(broker_config(68.71, 550.0), Duration::from_millis(5)).await;
    let ed = EdgeDevice::simulated(&broker.addr);

    let outcome = ed.client.run_task(Task::new(0, payload_file())).await;
    assert!(
        matches!(outcome, TaskOutcome::Remote { token: 0, .. }),
        "got {outcome:?}"
    );

    let s = ed.stats.snapshot();
    assert_eq!(s.sent_to_remote, 1);
    assert_eq!(s.ran_locally, 0);
    assert_eq!(s.completed, 1);
    assert!(ed.records.is_empty(), "remote task must not touch local records");

    let (dispatched, _) = ed.finish().await;
    assert_eq!(dispatched, 0);

    let b = broker.stop().await;
    assert_eq!((b.admitted, b.completed, b.dropped, b.failed), (1, 1, 0, 0));
}

/// Ten simultaneous requests against a queue with room for three: exactly
/// three are admitted, the rest are dropped to the local path.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_admission_respects_threshold() {
    // 0*100, 1*100, 2*100 <= 250 < 3*100
    let broker = start_broker(broker_config(100.0, 250.0), Duration::from_millis(300)).await;
    let ed = EdgeDevice::simulated(&broker.addr);

    let payload = payload_file();
    let tasks: Vec<_> = (0..10)
        .map(|id| {
            let client = ed.client.clone();
            let payload = payload.clone();
            tokio::spawn(async move { client.run_task(Task::new(id, payload)).await })
        })
        .collect();

    let mut remote = 0;
    let mut dropped = 0;
    for t in tasks {
        match t.await.unwrap() {
            TaskOutcome::Remote { .. } => remote += 1,
            TaskOutcome::Fallback { dropped: true } => dropped += 1,
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(remote, 3);
    assert_eq!(dropped, 7);
    assert_eq!(broker.broker.queue_depth(), 0);

    let (dispatched, summary) = ed.finish().await;
    assert_eq!(dispatched, 7);
    assert_eq!(summary.completed, 7);

    let b = broker.stop().await;
    assert_eq!((b.admitted, b.completed, b.dropped), (3, 3, 7));
}

/// A client that takes the GRANT and never acknowledges it must not hold
/// its queue slot past the ack timeout.
#[tokio::test]
async fn test_slot_released_on_ack_timeout() {
    let mut config = broker_config(68.71, 550.0);
    config.ack_timeout_ms = 150;
    let broker = start_broker(config, Duration::ZERO).await;

    let mut stream = TcpStream::connect(&broker.addr).await.unwrap();
    wire::write_message(
        &mut stream,
        &Message::Req {
            task_id: 1,
            model: "resnet_50".into(),
            device: "PI5".into(),
        },
    )
    .await
    .unwrap();
    assert_eq!(
        wire::read_message(&mut stream).await.unwrap(),
        Message::Grant { token: 0 }
    );
    assert_eq!(broker.broker.queue_depth(), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(broker.broker.queue_depth(), 0);

    // The broker closed its side.
    assert!(wire::read_message(&mut stream).await.is_err());

    let b = broker.stop().await;
    assert_eq!((b.admitted, b.completed, b.failed), (1, 0, 1));
}

/// A payload over the broker's limit is refused and the slot released.
#[tokio::test]
async fn test_oversized_payload_fails_the_task() {
    let mut config = broker_config(68.71, 550.0);
    config.max_payload_bytes = 4;
    let broker = start_broker(config, Duration::ZERO).await;
    let ed = EdgeDevice::simulated(&broker.addr);

    let outcome = ed.client.run_task(Task::new(3, payload_file())).await;
    assert_eq!(outcome, TaskOutcome::Failed);
    assert_eq!(ed.stats.snapshot().failed, 1);
    assert_eq!(broker.broker.queue_depth(), 0);

    ed.finish().await;
    assert_eq!(broker.stop().await.failed, 1);
}
