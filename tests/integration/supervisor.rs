use crate::*;

use offload_core::config::{ArrivalSettings, DeviceConfig, RunLimit};
use offload_services::RunSupervisor;

fn device(endpoint: &str, limit: RunLimit) -> DeviceConfig {
    let mut config = DeviceConfig {
        endpoint: endpoint.to_string(),
        arrival: ArrivalSettings::Poisson {
            rate_per_sec: 200.0,
        },
        limit,
        pool_size: 8,
        drain_timeout_ms: 10_000,
        ..Default::default()
    };
    config.payload.path = payload_file();
    config.local.simulated_latency_ms = 2;
    config
}

/// Full ED run against a broker with room for two queued tasks. Every
/// generated task lands in exactly one bucket and both sides agree on the
/// remote and dropped counts.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_end_to_end_run_accounts_for_every_task() {
    let broker = start_broker(broker_config(100.0, 100.0), Duration::from_millis(20)).await;

    let (shutdown, _) = broadcast::channel(1);
    let report = RunSupervisor::new(device(&broker.addr, RunLimit::Count { tasks: 30 }))
        .with_seed(42)
        .run(shutdown)
        .await
        .unwrap();

    println!("{report}");
    assert_eq!(report.generated, 30);
    assert_eq!(report.accounted(), 30);
    assert_eq!(report.sent_to_remote + report.ran_locally, 30);
    assert!(report.sent_to_remote >= 1);
    assert_eq!(report.local_completed, report.ran_locally);
    assert_eq!(report.local_pending, 0);
    assert!(report.avg_e2e_latency_ms > 0.0);

    assert_eq!(broker.broker.queue_depth(), 0);
    let b = broker.stop().await;
    assert_eq!(b.completed, report.sent_to_remote);
    assert_eq!(b.dropped, report.dropped);
    assert_eq!(b.failed, 0);
}

/// A local engine that is down all run long: nothing vanishes, every
/// fallback shows up as a local failure.
#[tokio::test]
async fn test_local_engine_down_for_the_whole_run() {
    let (shutdown, _) = broadcast::channel(1);
    let report = RunSupervisor::new(device(&dead_endpoint(), RunLimit::Count { tasks: 12 }))
        .with_local_engine(Arc::new(DownEngine))
        .run(shutdown)
        .await
        .unwrap();

    assert_eq!(report.generated, 12);
    assert_eq!(report.ran_locally, 12);
    assert_eq!(report.local_failed, 12);
    assert_eq!(report.local_completed, 0);
    assert_eq!(report.avg_local_latency_ms, 0.0);
}

#[tokio::test]
async fn test_duration_bounded_run() {
    let (shutdown, _) = broadcast::channel(1);
    let mut config = device(&dead_endpoint(), RunLimit::Duration { secs: 1 });
    config.arrival = ArrivalSettings::FixedRate {
        tasks_per_sec: 20.0,
    };

    let report = RunSupervisor::new(config).run(shutdown).await.unwrap();
    assert!(
        (15..=20).contains(&report.generated),
        "generated {}",
        report.generated
    );
    assert_eq!(report.accounted(), report.generated);
}
