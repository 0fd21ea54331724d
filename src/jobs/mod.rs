//! Job orchestration: lifecycle, cancellation, queueing, cost reconciliation.

pub mod cancel;
pub mod engine;
pub mod lifecycle;
pub mod queue;
pub mod reconcile;
pub mod types;
pub mod worker;

pub use cancel::{CancellationRegistry, CancellationSignal};
pub use engine::{CancelOutcome, CancelRejection, CouncilEngine, EngineBuilder, EngineError};
pub use lifecycle::{JobError, JobLifecycleManager, JobStore, MemoryJobStore};
pub use queue::{JobExecutor, LocalTaskQueue, QueueError, QueueHandle, TaskQueue};
pub use reconcile::{CostReconciler, ReconcileError, ReconcileOutcome};
pub use types::{Job, JobState, JobStatus, Transition, CANCELLED_ERROR};
pub use worker::{JobWorker, INTERNAL_ERROR};
