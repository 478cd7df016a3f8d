//! Run lifecycle engine for BatchOps.
//!
//! This crate implements the resumable batch-pipeline runner: run creation
//! and locking, crash-safe checkpoints, the append-only audit log, the stage
//! registry and command handler, the sequential executor, context rebuild on
//! resume, and the run summary.

pub mod audit;
pub mod cancellation;
pub mod checkpoint;
pub mod engine;
pub mod events;
pub mod handler;
pub mod handlers;
pub mod manifest;
pub mod resume;
pub mod run_store;
pub mod summary;

pub use audit::AuditLog;
pub use cancellation::CancellationToken;
pub use checkpoint::CheckpointStore;
pub use engine::{PipelineRunner, StageExecutor};
pub use events::{EventEmitter, RunEvent};
pub use handler::{
    default_durability, RegisteredStage, StageDefinition, StageHandler, StageInvocation,
    StageRegistry, DEFAULT_STAGES,
};
pub use handlers::{expand_variables, CommandHandler};
pub use manifest::{StageEntry, StageManifest};
pub use resume::{plan_resume, ResumeDecision};
pub use run_store::{RunHandle, RunLock, RunStore};
pub use summary::{DataQualityReport, ModelMetrics};
