//! RPC method handlers.
//!
//! Dispatches JSON-RPC method calls onto the orchestrator. Long-running
//! operations answer as soon as their job is registered; progress and the
//! terminal result are followed through `jobs.get` or the event stream.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::features::SaveReport;
use crate::core::models::{ContentKind, FeatureId, FileTransfer, JobKind, TransferDirection};
use crate::core::progress::JobProgress;
use crate::core::transfer_engine::plan_download;
use crate::core::{JobHandle, JobWithHistory, Orchestrator, OrchestratorError};
use crate::db;

use super::protocol::{Request, Response};

#[derive(Deserialize)]
struct DeviceParams {
    device_id: String,
}

#[derive(Deserialize)]
struct JobParams {
    id: String,
}

/// Reply to any method that starts a job.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobAccepted {
    pub job_id: String,
    pub device_id: String,
    pub kind: JobKind,
}

impl From<JobHandle> for JobAccepted {
    fn from(handle: JobHandle) -> Self {
        Self {
            job_id: handle.job_id,
            device_id: handle.device_id,
            kind: handle.kind,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobDetails {
    /// Live entry, until the job is acknowledged
    pub progress: Option<JobProgress>,
    /// Persisted status history
    pub history: Option<JobWithHistory>,
}

pub struct MethodHandler {
    orchestrator: Orchestrator,
    start_time: Instant,
}

/// Decode `params` and answer with whatever `op` returns.
async fn call<P, T, F, Fut>(id: Value, params: Value, op: F) -> Response
where
    P: DeserializeOwned,
    T: Serialize,
    F: FnOnce(P) -> Fut,
    Fut: Future<Output = Result<T, OrchestratorError>>,
{
    // absent params decode as an empty object so all-optional structs work
    let params = if params.is_null() {
        Value::Object(Default::default())
    } else {
        params
    };

    let params: P = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return Response::invalid_params(id, e.to_string()),
    };

    Response::from_result(id, op(params).await)
}

impl MethodHandler {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            start_time: Instant::now(),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Answer one raw message as read off a transport. `None` means nothing
    /// goes back: the message was a notification.
    pub async fn handle_text(&self, text: &str) -> Option<Response> {
        let request = match serde_json::from_str::<Request>(text) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "Unparseable request");
                return Some(Response::parse_error());
            }
        };

        if let Err(reason) = request.validate() {
            debug!(method = %request.method, reason, "Invalid request");
            return Some(Response::invalid_request(request.id.unwrap_or(Value::Null)));
        }

        if request.is_notification() {
            debug!(method = %request.method, "Notification received");
            self.handle(request).await;
            return None;
        }

        Some(self.handle(request).await)
    }

    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);
        let orch = &self.orchestrator;

        match request.method.as_str() {
            "daemon.status" => self.daemon_status(id).await,

            "devices.list" => Response::success(id, orch.list_devices()),
            "devices.get" => {
                call(id, params, |p: DeviceParams| async move {
                    orch.get_device(&p.device_id)
                })
                .await
            }
            "devices.refresh" => Response::from_result(id, orch.refresh_devices().await),

            "features.list" => {
                call(id, params, |p: DeviceParams| async move {
                    orch.get_features(&p.device_id).await
                })
                .await
            }
            "features.set" => self.features_set(id, params).await,
            "features.save" => self.features_save(id, params).await,

            "transfer.start" => self.transfer_start(id, params).await,
            "content.upload" => self.content_upload(id, params).await,

            "backup.create" => {
                call(id, params, |p: DeviceParams| async move {
                    orch.backup(&p.device_id).await.map(JobAccepted::from)
                })
                .await
            }
            "backup.info" => {
                call(id, params, |p: DeviceParams| async move {
                    orch.backup_info(&p.device_id).await
                })
                .await
            }
            "backup.download" => self.backup_download(id, params).await,
            "backup.upload" => self.backup_upload(id, params).await,
            "backup.delete" => {
                call(id, params, |p: DeviceParams| async move {
                    orch.delete_backup(&p.device_id).await.map(JobAccepted::from)
                })
                .await
            }

            "device.screenshot" => self.screenshot(id, params).await,
            "device.app_info" => {
                call(id, params, |p: DeviceParams| async move {
                    orch.app_info(&p.device_id).await
                })
                .await
            }
            "device.clear_cache" => {
                call(id, params, |p: DeviceParams| async move {
                    orch.clear_cache(&p.device_id).await
                })
                .await
            }
            "device.restart_app" => {
                call(id, params, |p: DeviceParams| async move {
                    orch.restart_application(&p.device_id).await
                })
                .await
            }
            "device.reboot" => {
                call(id, params, |p: DeviceParams| async move {
                    orch.reboot(&p.device_id).await
                })
                .await
            }

            "webserver.info" => {
                call(id, params, |p: DeviceParams| async move {
                    orch.web_server_info(&p.device_id).await
                })
                .await
            }
            "webserver.start" => {
                call(id, params, |p: DeviceParams| async move {
                    orch.start_web_server(&p.device_id)
                        .await
                        .map(JobAccepted::from)
                })
                .await
            }
            "webserver.stop" => {
                call(id, params, |p: DeviceParams| async move {
                    orch.stop_web_server(&p.device_id)
                        .await
                        .map(JobAccepted::from)
                })
                .await
            }

            "jobs.active" => Response::success(id, orch.active_jobs().await),
            "jobs.get" => {
                call(id, params, |p: JobParams| async move { self.job_details(&p.id).await }).await
            }
            "jobs.cancel" => {
                call(id, params, |p: JobParams| async move { orch.cancel(&p.id).await }).await
            }
            "jobs.acknowledge" => {
                call(id, params, |p: JobParams| async move {
                    orch.acknowledge(&p.id).await
                })
                .await
            }
            "jobs.history" => self.jobs_history(id, params).await,

            _ => Response::method_not_found(id, &request.method),
        }
    }

    async fn daemon_status(&self, id: Value) -> Response {
        let ctx = self.orchestrator.context();

        #[derive(Serialize)]
        struct DaemonStatus {
            version: &'static str,
            uptime_secs: u64,
            active_jobs: usize,
            devices: usize,
            busy_devices: Vec<String>,
            rpc_bind: String,
            simulation: bool,
        }

        Response::success(
            id,
            DaemonStatus {
                version: env!("CARGO_PKG_VERSION"),
                uptime_secs: self.start_time.elapsed().as_secs(),
                active_jobs: ctx.progress.active_count().await,
                devices: self.orchestrator.list_devices().len(),
                busy_devices: self.orchestrator.busy_devices(),
                rpc_bind: ctx.config.rpc_bind.to_string(),
                simulation: ctx.config.simulation,
            },
        )
    }

    async fn features_set(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            device_id: String,
            feature_id: String,
            enabled: bool,
        }

        call(id, params, |p: Params| async move {
            self.orchestrator
                .set_feature(&p.device_id, &p.feature_id, p.enabled)
                .await
        })
        .await
    }

    async fn features_save(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            device_id: String,
            features: BTreeMap<FeatureId, bool>,
        }

        call(id, params, |p: Params| async move {
            let report: SaveReport = self
                .orchestrator
                .save_features(&p.device_id, &p.features)
                .await?;
            Ok(report)
        })
        .await
    }

    async fn transfer_start(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            device_id: String,
            direction: TransferDirection,
            #[serde(default)]
            files: Vec<FileTransfer>,
            /// Pull shorthand: these remote files into `local_dir`
            #[serde(default)]
            remote_paths: Vec<String>,
            #[serde(default)]
            local_dir: Option<PathBuf>,
        }

        call(id, params, |p: Params| async move {
            let files = match (p.files.is_empty(), p.direction, &p.local_dir) {
                (true, TransferDirection::Pull, Some(local_dir)) => {
                    plan_download(&p.remote_paths, local_dir)
                }
                _ => p.files,
            };
            self.orchestrator
                .transfer(&p.device_id, p.direction, files)
                .await
                .map(JobAccepted::from)
        })
        .await
    }

    async fn content_upload(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            device_id: String,
            kind: ContentKind,
            local_path: PathBuf,
        }

        call(id, params, |p: Params| async move {
            self.orchestrator
                .upload_content(&p.device_id, p.kind, &p.local_path)
                .await
                .map(JobAccepted::from)
        })
        .await
    }

    async fn backup_download(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            device_id: String,
            #[serde(default)]
            output_dir: Option<PathBuf>,
        }

        call(id, params, |p: Params| async move {
            self.orchestrator
                .download_backup(&p.device_id, p.output_dir)
                .await
                .map(JobAccepted::from)
        })
        .await
    }

    async fn backup_upload(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            device_id: String,
            local_path: PathBuf,
        }

        call(id, params, |p: Params| async move {
            self.orchestrator
                .upload_backup(&p.device_id, p.local_path)
                .await
                .map(JobAccepted::from)
        })
        .await
    }

    async fn screenshot(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            device_id: String,
            #[serde(default)]
            output_dir: Option<PathBuf>,
        }

        call(id, params, |p: Params| async move {
            self.orchestrator
                .screenshot(&p.device_id, p.output_dir)
                .await
                .map(JobAccepted::from)
        })
        .await
    }

    /// Live progress and persisted history of one job; either may be gone.
    async fn job_details(&self, job_id: &str) -> Result<JobDetails, OrchestratorError> {
        let progress = self.orchestrator.job_status(job_id).await.ok();
        let history = db::jobs::get_with_history(&self.orchestrator.context().db, job_id)
            .await
            .map_err(|e| OrchestratorError::internal(format!("{:#}", e)))?;

        if progress.is_none() && history.is_none() {
            return Err(OrchestratorError::JobNotFound {
                job_id: job_id.to_string(),
            });
        }
        Ok(JobDetails { progress, history })
    }

    async fn jobs_history(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize, Default)]
        struct Params {
            #[serde(default)]
            limit: Option<u32>,
            #[serde(default)]
            offset: Option<u32>,
            #[serde(default)]
            status: Option<String>,
        }

        call(id, params, |p: Params| async move {
            let limit = p.limit.unwrap_or(50);
            let offset = p.offset.unwrap_or(0);
            db::jobs::list(&self.orchestrator.context().db, limit, offset, p.status)
                .await
                .map_err(|e| OrchestratorError::internal(format!("{:#}", e)))
        })
        .await
    }
}
