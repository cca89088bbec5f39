//! The facade every client talks to.
//!
//! Short operations are awaited in place. Long ones are spawned as jobs:
//! the caller gets a [`JobHandle`] back immediately and follows the job
//! through the event bus, the progress tracker or `JobHandle::wait`.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::backup::BackupManager;
use super::bridge::{DeviceBridge, remote_parent};
use super::control::DeviceControl;
use super::error::OrchestratorError;
use super::events::{EventStream, JobResult, OrchestratorEvent};
use super::features::{FeatureStore, SaveReport};
use super::locks::DeviceLocks;
use super::models::{
    AppInfo, BackupRecord, ContentKind, Device, DeviceState, Feature, FeatureId, FileTransfer,
    JobKind, JobOutcome, JobStatus, TransferDirection, WebServerInfo,
};
use super::progress::{JobContext, JobProgress, JobUpdate};
use super::registry::DeviceRegistry;
use super::transfer_engine::{
    TransferEngine, TransferRequest, plan_upload, transfer_outcome,
};
use crate::context::AppContext;
use crate::db;
use crate::rpc::RpcServer;
use crate::web::WebServer;

type JobResultTx = oneshot::Sender<Result<JobOutcome, OrchestratorError>>;

/// A running job, returned as soon as the job is registered.
pub struct JobHandle {
    pub job_id: String,
    pub device_id: String,
    pub kind: JobKind,
    cancel: CancellationToken,
    done: oneshot::Receiver<Result<JobOutcome, OrchestratorError>>,
}

impl JobHandle {
    /// Request cooperative cancellation; checked at file and step boundaries.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the terminal result.
    pub async fn wait(self) -> Result<JobOutcome, OrchestratorError> {
        self.done
            .await
            .unwrap_or_else(|_| Err(OrchestratorError::internal("job ended without a result")))
    }
}

struct Inner {
    ctx: AppContext,
    registry: DeviceRegistry,
    features: FeatureStore,
    transfers: Arc<TransferEngine>,
    backups: BackupManager,
    control: DeviceControl,
    locks: DeviceLocks,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(ctx: AppContext, bridge: Arc<dyn DeviceBridge>) -> Self {
        let config = ctx.config.clone();
        let locks = DeviceLocks::new();
        let transfers = Arc::new(TransferEngine::new(bridge.clone()));

        let inner = Inner {
            registry: DeviceRegistry::new(
                bridge.clone(),
                ctx.events.clone(),
                locks.clone(),
                config.reconcile_interval(),
            ),
            features: FeatureStore::new(bridge.clone(), config.features.clone()),
            backups: BackupManager::new(bridge.clone(), transfers.clone(), config.device.clone()),
            control: DeviceControl::new(bridge, config.device.clone(), config.web_server.clone()),
            transfers,
            locks,
            ctx,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn context(&self) -> &AppContext {
        &self.inner.ctx
    }

    pub fn subscribe(&self) -> EventStream {
        self.inner.ctx.events.subscribe()
    }

    /// Run the daemon until `shutdown` fires.
    pub async fn start(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let config = self.inner.ctx.config.clone();
        info!(
            simulation = config.simulation,
            rpc = %config.rpc_bind,
            web = %config.web_bind,
            "elemntary daemon starting"
        );

        let registry = {
            let this = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { this.inner.registry.run(shutdown).await })
        };

        let rpc = RpcServer::new(self.clone(), config.rpc_bind);
        let web = WebServer::new(self.clone(), config.web_bind);

        let served = tokio::try_join!(
            async { rpc.start(shutdown.clone()).await.context("RPC server failed") },
            async { web.start(shutdown.clone()).await.context("Web server failed") },
        );

        // one server failing takes the daemon down
        shutdown.cancel();
        registry.await.context("Device registry task panicked")?;
        served?;

        info!("elemntary daemon stopped");
        Ok(())
    }

    // ---- devices ----

    pub fn list_devices(&self) -> Vec<Device> {
        self.inner.registry.list_devices()
    }

    /// Ids of devices with an operation currently holding their token.
    pub fn busy_devices(&self) -> Vec<String> {
        self.list_devices()
            .into_iter()
            .map(|d| d.id)
            .filter(|id| self.inner.locks.is_busy(id))
            .collect()
    }

    pub fn get_device(&self, device_id: &str) -> Result<Device, OrchestratorError> {
        self.inner.registry.get_device(device_id)
    }

    /// Reconcile now and return the fresh snapshot.
    pub async fn refresh_devices(&self) -> Result<Vec<Device>, OrchestratorError> {
        self.inner.registry.reconcile().await?;
        Ok(self.inner.registry.list_devices())
    }

    /// Look the device up, refreshing once on a miss, and require it to be
    /// usable.
    async fn resolve_device(&self, device_id: &str) -> Result<Device, OrchestratorError> {
        let device = match self.inner.registry.get_device(device_id) {
            Ok(device) => device,
            Err(_) => {
                debug!(device_id, "Unknown device, refreshing once");
                self.inner.registry.reconcile().await?;
                self.inner.registry.get_device(device_id)?
            }
        };

        match device.state {
            DeviceState::Online => Ok(device),
            DeviceState::Offline => Err(OrchestratorError::DeviceOffline {
                device_id: device.id,
            }),
            DeviceState::Unauthorized => Err(OrchestratorError::DeviceUnauthorized {
                device_id: device.id,
            }),
        }
    }

    /// Run a short operation while holding the device's token.
    async fn with_device<T, F, Fut>(&self, device_id: &str, op: F) -> Result<T, OrchestratorError>
    where
        F: FnOnce(Device) -> Fut,
        Fut: Future<Output = Result<T, OrchestratorError>>,
    {
        let device = self.resolve_device(device_id).await?;
        let _guard = self.inner.locks.acquire(&device.id).await;
        op(device).await
    }

    // ---- features ----

    pub async fn get_features(&self, device_id: &str) -> Result<Vec<Feature>, OrchestratorError> {
        self.with_device(device_id, |device| async move {
            let snapshot = self.inner.features.read_features(&device.id).await?;
            self.inner
                .registry
                .set_capabilities(&device.id, snapshot.capabilities);
            Ok(snapshot.features)
        })
        .await
    }

    pub async fn set_feature(
        &self,
        device_id: &str,
        feature_id: &str,
        enabled: bool,
    ) -> Result<(), OrchestratorError> {
        self.with_device(device_id, |device| async move {
            self.inner
                .features
                .set_feature(&device.id, feature_id, enabled)
                .await
        })
        .await
    }

    /// Apply a desired feature state; any failed write fails the call with
    /// a per-feature breakdown.
    pub async fn save_features(
        &self,
        device_id: &str,
        desired: &BTreeMap<FeatureId, bool>,
    ) -> Result<SaveReport, OrchestratorError> {
        self.with_device(device_id, |device| async move {
            self.inner
                .features
                .save_features(&device.id, desired)
                .await?
                .into_result()
        })
        .await
    }

    // ---- device control ----

    pub async fn app_info(&self, device_id: &str) -> Result<AppInfo, OrchestratorError> {
        self.with_device(device_id, |device| async move {
            self.inner.control.app_info(&device.id).await
        })
        .await
    }

    pub async fn clear_cache(&self, device_id: &str) -> Result<(), OrchestratorError> {
        self.with_device(device_id, |device| async move {
            self.inner.control.clear_cache(&device.id).await
        })
        .await
    }

    pub async fn restart_application(&self, device_id: &str) -> Result<(), OrchestratorError> {
        self.with_device(device_id, |device| async move {
            self.inner.control.restart_application(&device.id).await
        })
        .await
    }

    pub async fn reboot(&self, device_id: &str) -> Result<(), OrchestratorError> {
        self.with_device(device_id, |device| async move {
            self.inner.control.reboot(&device.id).await
        })
        .await
    }

    pub async fn web_server_info(&self, device_id: &str) -> Result<WebServerInfo, OrchestratorError> {
        self.with_device(device_id, |device| async move {
            self.inner.control.web_server_info(&device.id).await
        })
        .await
    }

    pub async fn backup_info(&self, device_id: &str) -> Result<Option<BackupRecord>, OrchestratorError> {
        self.with_device(device_id, |device| async move {
            self.inner.backups.backup_info(&device.id).await
        })
        .await
    }

    pub async fn screenshot(
        &self,
        device_id: &str,
        output_dir: Option<PathBuf>,
    ) -> Result<JobHandle, OrchestratorError> {
        let output_dir =
            output_dir.unwrap_or_else(|| self.inner.ctx.config.screenshot_directory.clone());
        self.spawn_job(device_id, JobKind::Screenshot, move |inner, job| async move {
            job.check_cancelled()?;
            let shot = inner.control.screenshot(&job.device_id, &output_dir).await?;
            Ok(JobOutcome::Screenshot(shot))
        })
        .await
    }

    pub async fn start_web_server(&self, device_id: &str) -> Result<JobHandle, OrchestratorError> {
        self.spawn_job(device_id, JobKind::WebServerStart, |inner, job| async move {
            job.check_cancelled()?;
            let info = inner.control.start_web_server(&job.device_id).await?;
            Ok(JobOutcome::WebServer(info))
        })
        .await
    }

    pub async fn stop_web_server(&self, device_id: &str) -> Result<JobHandle, OrchestratorError> {
        self.spawn_job(device_id, JobKind::WebServerStop, |inner, job| async move {
            job.check_cancelled()?;
            let info = inner.control.stop_web_server(&job.device_id).await?;
            Ok(JobOutcome::WebServer(info))
        })
        .await
    }

    // ---- transfers ----

    /// Copy an explicit, ordered file list.
    pub async fn transfer(
        &self,
        device_id: &str,
        direction: TransferDirection,
        files: Vec<FileTransfer>,
    ) -> Result<JobHandle, OrchestratorError> {
        let Some(first) = files.first() else {
            return Err(OrchestratorError::invalid("transfer has no files"));
        };
        let destination_root = match direction {
            TransferDirection::Push => remote_parent(&first.remote_path)
                .unwrap_or("/")
                .to_string(),
            TransferDirection::Pull => first
                .local_path
                .parent()
                .unwrap_or(Path::new("."))
                .display()
                .to_string(),
        };

        self.spawn_transfer(device_id, direction, files, destination_root)
            .await
    }

    /// Push a local file or directory into the device's root for `kind`.
    pub async fn upload_content(
        &self,
        device_id: &str,
        kind: ContentKind,
        local_path: &Path,
    ) -> Result<JobHandle, OrchestratorError> {
        let remote_root = kind.remote_root(&self.inner.ctx.config.device).to_string();
        let files = plan_upload(local_path, &remote_root).await?;
        if files.is_empty() {
            return Err(OrchestratorError::invalid(format!(
                "nothing to upload in {}",
                local_path.display()
            )));
        }

        self.spawn_transfer(device_id, TransferDirection::Push, files, remote_root)
            .await
    }

    async fn spawn_transfer(
        &self,
        device_id: &str,
        direction: TransferDirection,
        files: Vec<FileTransfer>,
        destination_root: String,
    ) -> Result<JobHandle, OrchestratorError> {
        self.spawn_job(device_id, JobKind::Transfer, move |inner, job| async move {
            let request = TransferRequest {
                job_id: job.job_id.clone(),
                device_id: job.device_id.clone(),
                direction,
                files,
                destination_root,
            };
            let transfer = inner
                .transfers
                .copy(&request, job.updates.clone(), &job.cancel)
                .await?;
            transfer_outcome(transfer).map(JobOutcome::Transfer)
        })
        .await
    }

    // ---- backups ----

    pub async fn backup(&self, device_id: &str) -> Result<JobHandle, OrchestratorError> {
        self.spawn_job(device_id, JobKind::Backup, |inner, job| async move {
            inner.backups.backup(&job).await.map(JobOutcome::Backup)
        })
        .await
    }

    pub async fn download_backup(
        &self,
        device_id: &str,
        output_dir: Option<PathBuf>,
    ) -> Result<JobHandle, OrchestratorError> {
        let output_dir =
            output_dir.unwrap_or_else(|| self.inner.ctx.config.backup_directory.clone());
        self.spawn_job(device_id, JobKind::DownloadBackup, move |inner, job| async move {
            tokio::fs::create_dir_all(&output_dir).await?;
            inner
                .backups
                .download_backup(&job, &output_dir)
                .await
                .map(JobOutcome::Backup)
        })
        .await
    }

    pub async fn upload_backup(
        &self,
        device_id: &str,
        local_path: PathBuf,
    ) -> Result<JobHandle, OrchestratorError> {
        if !tokio::fs::try_exists(&local_path).await.unwrap_or(false) {
            return Err(OrchestratorError::invalid(format!(
                "{} does not exist",
                local_path.display()
            )));
        }

        self.spawn_job(device_id, JobKind::UploadBackup, move |inner, job| async move {
            inner
                .backups
                .upload_backup(&job, &local_path)
                .await
                .map(JobOutcome::Backup)
        })
        .await
    }

    pub async fn delete_backup(&self, device_id: &str) -> Result<JobHandle, OrchestratorError> {
        self.spawn_job(device_id, JobKind::DeleteBackup, |inner, job| async move {
            Ok(match inner.backups.delete_backup(&job).await? {
                Some(record) => JobOutcome::Backup(record),
                None => JobOutcome::Done,
            })
        })
        .await
    }

    // ---- jobs ----

    pub async fn job_status(&self, job_id: &str) -> Result<JobProgress, OrchestratorError> {
        self.inner
            .ctx
            .progress
            .get(job_id)
            .await
            .ok_or_else(|| OrchestratorError::JobNotFound {
                job_id: job_id.to_string(),
            })
    }

    pub async fn active_jobs(&self) -> Vec<JobProgress> {
        self.inner.ctx.progress.get_all().await
    }

    /// Drop a finished job from the tracker.
    pub async fn acknowledge(&self, job_id: &str) -> Result<JobProgress, OrchestratorError> {
        let progress = &self.inner.ctx.progress;
        match progress.acknowledge(job_id).await {
            Some(job) => Ok(job),
            None if progress.get(job_id).await.is_some() => Err(OrchestratorError::invalid(
                format!("job {} is still running", job_id),
            )),
            None => Err(OrchestratorError::JobNotFound {
                job_id: job_id.to_string(),
            }),
        }
    }

    pub async fn cancel(&self, job_id: &str) -> Result<(), OrchestratorError> {
        if self.inner.ctx.progress.cancel(job_id).await {
            info!(job_id, "Cancellation requested");
            Ok(())
        } else {
            Err(OrchestratorError::JobNotFound {
                job_id: job_id.to_string(),
            })
        }
    }

    /// Register a job and run `work` on its own task once the device is
    /// free.
    ///
    /// The device is resolved before anything is registered, so an unknown
    /// device fails the call without leaving a job behind.
    async fn spawn_job<F, Fut>(
        &self,
        device_id: &str,
        kind: JobKind,
        work: F,
    ) -> Result<JobHandle, OrchestratorError>
    where
        F: FnOnce(Arc<Inner>, JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<JobOutcome, OrchestratorError>> + Send + 'static,
    {
        let device = self.resolve_device(device_id).await?;
        let job_id = Uuid::now_v7().to_string();
        let cancel = CancellationToken::new();

        let ctx = &self.inner.ctx;
        ctx.progress
            .register(JobProgress::new(&job_id, &device.id, kind), cancel.clone())
            .await;
        if let Err(e) = db::jobs::create(&ctx.db, &job_id, &device.id, kind).await {
            warn!(job_id = %job_id, error = %e, "Failed to record job");
        }

        let (done_tx, done_rx) = oneshot::channel();
        let span = info_span!("job", job_id = %job_id, device_id = %device.id, kind = kind.as_str());
        tokio::spawn(
            run_job(
                self.inner.clone(),
                job_id.clone(),
                device.id.clone(),
                kind,
                cancel.clone(),
                work,
                done_tx,
            )
            .instrument(span),
        );

        Ok(JobHandle {
            job_id,
            device_id: device.id,
            kind,
            cancel,
            done: done_rx,
        })
    }
}

async fn run_job<F, Fut>(
    inner: Arc<Inner>,
    job_id: String,
    device_id: String,
    kind: JobKind,
    cancel: CancellationToken,
    work: F,
    done: JobResultTx,
) where
    F: FnOnce(Arc<Inner>, JobContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<JobOutcome, OrchestratorError>> + Send + 'static,
{
    let ctx = inner.ctx.clone();

    let guard = tokio::select! {
        guard = inner.locks.acquire(&device_id) => Some(guard),
        _ = cancel.cancelled() => None,
    };

    let result = match &guard {
        None => Err(OrchestratorError::Cancelled),
        Some(_) => {
            ctx.progress.set_status(&job_id, JobStatus::InProgress).await;
            log_status(&inner, &job_id, JobStatus::InProgress, None).await;
            ctx.events.emit(OrchestratorEvent::JobStarted {
                job_id: job_id.clone(),
                device_id: device_id.clone(),
                kind,
            });
            info!("Job started");

            let (tx, mut rx) = mpsc::channel(64);
            let job = JobContext {
                job_id: job_id.clone(),
                device_id: device_id.clone(),
                cancel: cancel.clone(),
                updates: tx,
            };

            // the channel closes once `work` drops its context
            let relay = async {
                while let Some(update) = rx.recv().await {
                    ctx.progress.apply(&job_id, &update).await;
                    ctx.events.emit(match update {
                        JobUpdate::Transfer(progress) => OrchestratorEvent::JobProgress {
                            job_id: job_id.clone(),
                            device_id: device_id.clone(),
                            progress,
                        },
                        JobUpdate::Step(state) => OrchestratorEvent::BackupStep {
                            job_id: job_id.clone(),
                            device_id: device_id.clone(),
                            state,
                        },
                    });
                }
            };

            // a panic in `work` ends its task, not this one
            let work = tokio::spawn(work(inner.clone(), job).in_current_span());
            let (joined, ()) = tokio::join!(work, relay);
            joined.unwrap_or_else(|e| {
                error!(error = %e, "Job task failed");
                Err(OrchestratorError::internal(format!("job task failed: {}", e)))
            })
        }
    };

    let (status, description) = match &result {
        Ok(_) => (JobStatus::Completed, None),
        Err(e) => (e.terminal_status(), Some(e.to_string())),
    };
    log_status(&inner, &job_id, status, description).await;
    ctx.progress.finish(&job_id, &result).await;

    match &result {
        Ok(_) => info!(status = %status, "Job finished"),
        Err(e) => warn!(status = %status, error = %e, "Job finished"),
    }
    ctx.events.emit(OrchestratorEvent::JobFinished {
        job_id: job_id.clone(),
        device_id: device_id.clone(),
        kind,
        result: JobResult::from(&result),
    });

    // the token is held until the terminal event is out
    if let Some(guard) = guard {
        debug!(device_id = guard.device_id(), "Releasing device");
        drop(guard);
    }
    let _ = done.send(result);
}

async fn log_status(inner: &Inner, job_id: &str, status: JobStatus, description: Option<String>) {
    if let Err(e) = db::jobs::update_status(&inner.ctx.db, job_id, status, description).await {
        warn!(job_id, status = %status, error = %e, "Failed to record job status");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{SimulatedBridge, Simulator};
    use crate::config::AppConfig;
    use std::time::Duration;

    async fn orchestrator() -> (Orchestrator, Simulator) {
        let conn = db::open_in_memory().await.unwrap();
        let ctx = AppContext::new(AppConfig::default(), conn);
        let (bridge, sim) = SimulatedBridge::new();
        (Orchestrator::new(ctx, Arc::new(bridge)), sim)
    }

    #[tokio::test]
    async fn test_resolve_refreshes_once_on_miss() {
        let (orch, sim) = orchestrator().await;
        sim.add_device("R5CT1", "ELEMNT_BOLT");

        // never reconciled, so the first lookup misses and refreshes
        let device = orch.resolve_device("R5CT1").await.unwrap();
        assert_eq!(device.id, "R5CT1");
        assert!(orch.get_device("R5CT1").is_ok());
    }

    #[tokio::test]
    async fn test_unauthorized_device_is_rejected() {
        let (orch, sim) = orchestrator().await;
        sim.add_device("R5CT1", "ELEMNT_BOLT");
        sim.set_state("R5CT1", DeviceState::Unauthorized);

        let err = orch.get_features("R5CT1").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::DeviceUnauthorized { .. }));
        assert!(
            sim.calls()
                .iter()
                .all(|c| c.device_id.as_deref() != Some("R5CT1"))
        );
    }

    #[tokio::test]
    async fn test_job_is_logged_to_history() {
        let (orch, sim) = orchestrator().await;
        sim.add_device("R5CT1", "ELEMNT_BOLT");

        let handle = orch.start_web_server("R5CT1").await.unwrap();
        let job_id = handle.job_id.clone();
        // web server is not installed in this fleet, so the broadcast hooks
        // nothing and info reads back as stopped
        let outcome = handle.wait().await.unwrap();
        assert!(matches!(outcome, JobOutcome::WebServer(_)));

        let history = db::jobs::get_with_history(&orch.context().db, &job_id)
            .await
            .unwrap()
            .unwrap();
        let statuses: Vec<&str> = history.history.iter().map(|h| h.status.as_str()).collect();
        assert_eq!(statuses, vec!["Pending", "InProgress", "Completed"]);
        assert_eq!(history.job.kind, "web_server_start");
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_device() {
        let (orch, sim) = orchestrator().await;
        sim.add_device("R5CT1", "ELEMNT_BOLT");
        orch.refresh_devices().await.unwrap();

        let _busy = orch.inner.locks.acquire("R5CT1").await;
        let handle = orch.screenshot("R5CT1", None).await.unwrap();
        orch.cancel(&handle.job_id).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert_eq!(result, Err(OrchestratorError::Cancelled));
    }

    #[tokio::test]
    async fn test_panicking_job_still_finishes() {
        let (orch, sim) = orchestrator().await;
        sim.add_device("R5CT1", "ELEMNT_BOLT");
        let mut events = orch.subscribe();

        let handle = orch
            .spawn_job("R5CT1", JobKind::Screenshot, |_inner, _job| async move {
                if true {
                    panic!("decoder crashed");
                }
                Ok(JobOutcome::Done)
            })
            .await
            .unwrap();
        let job_id = handle.job_id.clone();

        let result = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert!(matches!(result, Err(OrchestratorError::Internal { .. })));

        let progress = orch.job_status(&job_id).await.unwrap();
        assert_eq!(progress.status, JobStatus::Failed);
        assert!(orch.busy_devices().is_empty());
        orch.acknowledge(&job_id).await.unwrap();

        let mut finished = false;
        while let Ok(event) = events.try_recv() {
            finished |= matches!(event, OrchestratorEvent::JobFinished { .. });
        }
        assert!(finished);
    }

    #[tokio::test]
    async fn test_busy_devices_reports_held_tokens() {
        let (orch, sim) = orchestrator().await;
        sim.add_device("R5CT1", "ELEMNT_BOLT");
        sim.add_device("ZX1G22", "ELEMNT_ROAM");
        orch.refresh_devices().await.unwrap();

        let busy = orch.inner.locks.acquire("R5CT1").await;
        assert_eq!(orch.busy_devices(), vec!["R5CT1".to_string()]);
        drop(busy);
        assert!(orch.busy_devices().is_empty());
    }

    #[tokio::test]
    async fn test_acknowledge_requires_finished_job() {
        let (orch, _sim) = orchestrator().await;
        let err = orch.acknowledge("missing").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::JobNotFound { .. }));
    }
}
