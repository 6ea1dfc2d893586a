use crate::*;

use offload_core::wire::{self, Message, WireError};
use offload_services::{Task, TaskOutcome};
use tokio::net::TcpListener;

/// A broker that answers every request with DROP and reports what the client
/// sent next.
async fn dropping_broker() -> (String, JoinHandle<std::result::Result<Message, WireError>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let req = wire::read_message(&mut stream).await?;
        assert!(matches!(req, Message::Req { task_id: 11, .. }));
        wire::write_message(&mut stream, &Message::Drop).await?;
        wire::read_message(&mut stream).await
    });
    (addr, handle)
}

/// DROP enqueues the task locally exactly once and the client never follows
/// up with OK or a payload.
#[tokio::test]
async fn test_drop_enqueues_exactly_once() {
    let (addr, broker) = dropping_broker().await;
    let ed = EdgeDevice::simulated(&addr);

    let outcome = ed.client.run_task(Task::new(11, payload_file())).await;
    assert_eq!(outcome, TaskOutcome::Fallback { dropped: true });

    let after_drop = broker.await.unwrap();
    assert!(
        matches!(after_drop, Err(WireError::Closed)),
        "client sent {after_drop:?} after DROP"
    );

    let s = ed.stats.snapshot();
    assert_eq!((s.ran_locally, s.dropped, s.sent_to_remote), (1, 1, 0));

    let (dispatched, summary) = ed.finish().await;
    assert_eq!(dispatched, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.pending, 0);
}

#[tokio::test]
async fn test_unreachable_broker_falls_back() {
    let ed = EdgeDevice::simulated(&dead_endpoint());
    let payload = payload_file();

    for id in 0..4 {
        let outcome = ed.client.run_task(Task::new(id, payload.clone())).await;
        assert_eq!(outcome, TaskOutcome::Fallback { dropped: false });
    }
    let s = ed.stats.snapshot();
    assert_eq!((s.ran_locally, s.dropped, s.completed), (4, 0, 4));

    let (dispatched, summary) = ed.finish().await;
    assert_eq!(dispatched, 4);
    assert_eq!(summary.completed, 4);
}

/// With the local engine down for the whole run, every fallback task ends up
/// failed and none disappear from the totals.
#[tokio::test]
async fn test_unreachable_local_engine_fails_every_task() {
    let ed = EdgeDevice::new(&dead_endpoint(), Arc::new(DownEngine));
    let payload = payload_file();

    for id in 0..5 {
        ed.client.run_task(Task::new(id, payload.clone())).await;
    }
    assert_eq!(ed.stats.snapshot().ran_locally, 5);

    let (dispatched, summary) = ed.finish().await;
    assert_eq!(dispatched, 5);
    assert_eq!(summary.failed, 5);
    assert_eq!(summary.completed + summary.pending, 0);
}

/// An unreadable payload is neither offloaded nor run locally.
#[tokio::test]
async fn test_missing_payload_is_a_payload_error() {
    let broker = start_broker(broker_config(68.71, 550.0), Duration::ZERO).await;
    let ed = EdgeDevice::simulated(&broker.addr);

    let outcome = ed
        .client
        .run_task(Task::new(2, PathBuf::from("/nonexistent/offload/frame.jpg")))
        .await;
    assert_eq!(outcome, TaskOutcome::PayloadError);

    let s = ed.stats.snapshot();
    assert_eq!((s.payload_errors, s.ran_locally, s.sent_to_remote), (1, 0, 0));

    // The broker notices the hang-up and frees the slot.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.broker.queue_depth(), 0);

    let (dispatched, _) = ed.finish().await;
    assert_eq!(dispatched, 0);
    assert_eq!(broker.stop().await.failed, 1);
}
