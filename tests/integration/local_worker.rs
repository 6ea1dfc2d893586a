use crate::*;

use offload_core::config::{ArrivalSettings, DeviceConfig, LocalRuntimeKind, RunLimit};
use offload_services::RunSupervisor;

/// Stand-in for a persistent inference process: chatters on stdout, then
/// answers every `<id>:<payload>` line with `<id>,<infer_ms>,<epoch_ms>`.
const WORKER_SCRIPT: &str = r#"
echo "[INFO] model loaded"
while IFS= read -r line; do
    id="${line%%:*}"
    echo "$id,3.25,$(date +%s)000"
done
"#;

fn worker_device(endpoint: String, tasks: u64) -> DeviceConfig {
    let mut config = DeviceConfig {
        endpoint,
        arrival: ArrivalSettings::FixedRate {
            tasks_per_sec: 100.0,
        },
        limit: RunLimit::Count { tasks },
        drain_timeout_ms: 10_000,
        ..Default::default()
    };
    config.payload.path = payload_file();
    config.local.runtime = LocalRuntimeKind::External;
    config.local.command = "sh".into();
    config.local.args = vec!["-c".into(), WORKER_SCRIPT.into()];
    config
}

#[cfg(unix)]
#[tokio::test]
async fn test_external_worker_round_trip() {
    let (shutdown, _) = broadcast::channel(1);
    let report = RunSupervisor::new(worker_device(dead_endpoint(), 4))
        .run(shutdown)
        .await
        .unwrap();

    assert_eq!(report.generated, 4);
    assert_eq!(report.ran_locally, 4);
    assert_eq!(report.local_completed, 4);
    assert_eq!(report.local_pending, 0);
    assert!((report.avg_local_infer_ms - 3.25).abs() < 1e-9);
}

#[cfg(unix)]
#[tokio::test]
async fn test_worker_dead_before_answering_fails_every_task() {
    // The model never loads: the worker takes jobs into its pipe, then exits.
    let mut config = worker_device(dead_endpoint(), 4);
    config.local.args = vec!["-c".into(), "sleep 0.5; exit 1".into()];

    let (shutdown, _) = broadcast::channel(1);
    let report = RunSupervisor::new(config).run(shutdown).await.unwrap();

    assert_eq!(report.ran_locally, 4);
    assert_eq!(report.local_completed, 0);
    assert_eq!(report.local_pending, 0);
    assert_eq!(report.local_failed, 4);
}

#[cfg(unix)]
#[tokio::test]
async fn test_worker_stopping_mid_run_leaves_nothing_pending() {
    let script = r#"
for _ in 1 2; do
    IFS= read -r line || exit 1
    echo "${line%%:*},2.00,$(date +%s)000"
done
exit 0
"#;
    let mut config = worker_device(dead_endpoint(), 6);
    config.local.args = vec!["-c".into(), script.into()];

    let (shutdown, _) = broadcast::channel(1);
    let report = RunSupervisor::new(config).run(shutdown).await.unwrap();

    assert_eq!(report.ran_locally, 6);
    assert_eq!(report.local_completed, 2);
    assert_eq!(report.local_failed, 4);
    assert_eq!(report.local_pending, 0);
}

#[tokio::test]
async fn test_missing_worker_is_fatal() {
    let mut config = worker_device(dead_endpoint(), 1);
    config.local.command = "/nonexistent/offload-local-worker".into();
    config.local.args.clear();

    let (shutdown, _) = broadcast::channel(1);
    let err = RunSupervisor::new(config).run(shutdown).await.unwrap_err();
    assert!(format!("{err:#}").contains("offload-local-worker"));
}
