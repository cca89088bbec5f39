use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use super::error::OrchestratorError;
use super::models::{BackupState, Device, DeviceState, JobKind, JobOutcome};
use super::progress::TransferStatus;

/// Terminal payload of a job: exactly one of success or a typed error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "payload", rename_all = "snake_case")]
pub enum JobResult {
    Succeeded(JobOutcome),
    Failed(OrchestratorError),
}

impl From<&Result<JobOutcome, OrchestratorError>> for JobResult {
    fn from(result: &Result<JobOutcome, OrchestratorError>) -> Self {
        match result {
            Ok(outcome) => Self::Succeeded(outcome.clone()),
            Err(e) => Self::Failed(e.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    DeviceAdded {
        device: Device,
    },
    DeviceRemoved {
        device_id: String,
    },
    DeviceStateChanged {
        device_id: String,
        from: DeviceState,
        to: DeviceState,
    },
    JobStarted {
        job_id: String,
        device_id: String,
        kind: JobKind,
    },
    JobProgress {
        job_id: String,
        device_id: String,
        progress: TransferStatus,
    },
    BackupStep {
        job_id: String,
        device_id: String,
        state: BackupState,
    },
    JobFinished {
        job_id: String,
        device_id: String,
        kind: JobKind,
        result: JobResult,
    },
}

impl OrchestratorEvent {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::JobStarted { job_id, .. }
            | Self::JobProgress { job_id, .. }
            | Self::BackupStep { job_id, .. }
            | Self::JobFinished { job_id, .. } => Some(job_id),
            _ => None,
        }
    }
}

pub type EventStream = broadcast::Receiver<OrchestratorEvent>;

/// Fan-out of orchestration events to any number of subscribers.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> EventStream {
        self.tx.subscribe()
    }

    /// Emit to all current subscribers. Having none is not an error;
    /// lagging subscribers are handled by `broadcast`.
    pub fn emit(&self, event: OrchestratorEvent) {
        let job_id = event.job_id().map(str::to_string);
        if self.tx.send(event).is_err() {
            trace!(job_id = job_id.as_deref(), "Event emitted without subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_every_subscriber() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(OrchestratorEvent::DeviceRemoved {
            device_id: "R5CT1".to_string(),
        });

        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                OrchestratorEvent::DeviceRemoved { device_id } => assert_eq!(device_id, "R5CT1"),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.emit(OrchestratorEvent::DeviceRemoved {
            device_id: "x".to_string(),
        });
    }

    #[test]
    fn test_job_finished_serialization() {
        let event = OrchestratorEvent::JobFinished {
            job_id: "j1".to_string(),
            device_id: "d1".to_string(),
            kind: JobKind::Backup,
            result: JobResult::Failed(OrchestratorError::DeviceNotFound {
                device_id: "d1".to_string(),
            }),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "job_finished");
        assert_eq!(value["result"]["status"], "failed");
        assert_eq!(value["result"]["payload"]["kind"], "device_not_found");
        assert_eq!(event.job_id(), Some("j1"));
    }
}
