//! offload-services: the broker, the per-task offload client, the local
//! fallback executor and the run-level bookkeeping that ties them together.

pub mod admission;
pub mod broker;
pub mod client;
pub mod completion;
pub mod engine;
pub mod executor;
pub mod generator;
pub mod run;
pub mod stats;
pub mod task;

pub use admission::{Admission, AdmissionController, SlotGuard};
pub use broker::{Broker, BrokerError, BrokerServer, BrokerStats};
pub use client::{ClientConfig, OffloadClient, TaskError, TaskOutcome};
pub use completion::{
    CompletionListener, CompletionNotice, CompletionRecord, CompletionRecords, LocalSummary,
};
pub use engine::{Detection, EngineError, InferenceEngine, SerializedEngine, SimulatedEngine};
pub use executor::{ExecutorError, ExternalWorker, LocalExecutor, LocalExecutorHandle, LocalJob, LocalRuntime};
pub use generator::{ArrivalProcess, PayloadSource, TaskGenerator};
pub use run::RunSupervisor;
pub use stats::{AggregateStats, RunReport, StatsAggregator};
pub use task::{now_ms, Task, TaskState};
