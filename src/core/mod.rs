pub mod backup;
pub mod bridge;
pub mod control;
pub mod error;
pub mod events;
pub mod features;
pub mod locks;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod transfer_engine;
pub mod verifier;

pub use bridge::{BridgeError, BridgeOutput, DeviceBridge, TimeoutClass};
pub use error::{ItemFailure, OrchestratorError};
pub use events::{EventBus, EventStream, JobResult, OrchestratorEvent};
pub use models::{
    BackupRecord, ContentKind, Device, DeviceState, Feature, Job, JobKind, JobOutcome, JobStatus,
    JobStatusEntry, JobWithHistory, TransferDirection, TransferJob,
};
pub use orchestrator::{JobHandle, Orchestrator};
pub use progress::{JobProgress, ProgressTracker};
pub use verifier::{VerifyResult, verify_download};
