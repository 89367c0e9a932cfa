use crate::constants::CHECKPOINT_CHANNEL_CAPACITY;
use crate::errors;
use crate::provision::installer::{InstallContext, Installer, ProgressSink};
use crate::provision::progress::ProgressStore;
use crate::provision::records::RecordStore;
use crate::provision::types::{
    BackendKind, HostDescriptor, TaskId, TaskSnapshot, TunnelConfig, TunnelRecord,
};
use crate::provision::{LocalExecutor, RemoteExecutor};
use crate::settings::Settings;
use anyhow::{Result, anyhow};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct TaskHandle {
    cancellation_token: CancellationToken,
    join_handle: Option<JoinHandle<()>>,
    finished: watch::Receiver<bool>,
}

type TaskTable = Arc<Mutex<HashMap<TaskId, TaskHandle>>>;

fn lock(tasks: &TaskTable) -> MutexGuard<'_, HashMap<TaskId, TaskHandle>> {
    tasks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs installs in the background and publishes their progress.
///
/// `start_install` returns immediately with a task id; callers poll
/// `get_status` until the task reaches `completed` or `error`.
pub struct TaskEngine {
    progress: Arc<ProgressStore>,
    remote: Arc<dyn RemoteExecutor>,
    local: Arc<dyn LocalExecutor>,
    records: Arc<dyn RecordStore>,
    settings: Arc<Settings>,
    tasks: TaskTable,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    cancellation_token: CancellationToken,
    runtime_handle: tokio::runtime::Handle,
}

impl TaskEngine {
    pub fn new(
        runtime_handle: tokio::runtime::Handle,
        settings: Arc<Settings>,
        remote: Arc<dyn RemoteExecutor>,
        local: Arc<dyn LocalExecutor>,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        let progress = Arc::new(ProgressStore::new());
        let tasks: TaskTable = Arc::default();
        let cancellation_token = CancellationToken::new();

        let sweeper = runtime_handle.spawn(sweep(
            progress.clone(),
            tasks.clone(),
            settings.task_ttl,
            settings.sweep_interval,
            cancellation_token.child_token(),
        ));

        Self {
            progress,
            remote,
            local,
            records,
            settings,
            tasks,
            sweeper: Mutex::new(Some(sweeper)),
            cancellation_token,
            runtime_handle,
        }
    }

    pub fn progress(&self) -> &Arc<ProgressStore> {
        &self.progress
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    /// Queues an install of `config` with `backend` against `host` and
    /// returns its task id without waiting for any remote work.
    pub fn start_install(
        &self,
        backend: BackendKind,
        host: HostDescriptor,
        config: TunnelConfig,
    ) -> TaskId {
        let id = TaskId::new();
        self.progress.set(id, TaskSnapshot::waiting());

        let task_token = self.cancellation_token.child_token();
        let ctx = InstallContext {
            host,
            config,
            remote: self.remote.clone(),
            local: self.local.clone(),
            records: self.records.clone(),
            settings: self.settings.clone(),
        };
        tracing::info!(
            "Queued {} install of {} on {} as task {}",
            backend,
            ctx.config.display_name(),
            ctx.host.address,
            id
        );

        let (finished_tx, finished) = watch::channel(false);
        let task = run_task(
            id,
            Installer::new(backend),
            ctx,
            self.progress.clone(),
            task_token.clone(),
        );
        let join_handle = self.runtime_handle.spawn(async move {
            task.await;
            finished_tx.send_replace(true);
        });
        lock(&self.tasks).insert(
            id,
            TaskHandle {
                cancellation_token: task_token,
                join_handle: Some(join_handle),
                finished,
            },
        );
        id
    }

    pub fn get_status(&self, id: TaskId) -> TaskSnapshot {
        self.progress.get(id)
    }

    /// Requests cancellation; returns false for unknown or finished tasks.
    pub fn cancel(&self, id: TaskId) -> bool {
        if self.progress.get(id).status.is_terminal() {
            return false;
        }
        match lock(&self.tasks).get(&id) {
            Some(handle) => {
                tracing::info!("Cancelling task {}", id);
                handle.cancellation_token.cancel();
                true
            }
            None => false,
        }
    }

    /// Waits for the background work of `id` and returns its final snapshot.
    /// Any number of callers may wait on the same task; unknown or removed
    /// ids return the current snapshot straight away.
    pub async fn wait(&self, id: TaskId) -> TaskSnapshot {
        let finished = lock(&self.tasks).get(&id).map(|handle| handle.finished.clone());
        if let Some(mut finished) = finished {
            let reported = finished.wait_for(|done| *done).await.is_ok();
            if !reported {
                tracing::error!("Task {} stopped without reporting completion", id);
            }
        }
        self.progress.get(id)
    }

    /// Forgets a finished task. Running tasks are left alone.
    pub fn remove(&self, id: TaskId) -> Option<TaskSnapshot> {
        if !self.progress.get(id).status.is_terminal() {
            tracing::warn!("Refusing to remove task {} before it finishes", id);
            return None;
        }
        lock(&self.tasks).remove(&id);
        self.progress.remove(id)
    }

    /// Cancels every in-flight task and the sweeper, then waits for them.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down task engine");
        self.cancellation_token.cancel();

        let mut handles: Vec<JoinHandle<()>> = lock(&self.tasks)
            .values_mut()
            .filter_map(|handle| handle.join_handle.take())
            .collect();
        if let Some(sweeper) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handles.push(sweeper);
        }

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Background task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for TaskEngine {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

async fn deadline(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

async fn run_task(
    id: TaskId,
    installer: Installer,
    ctx: InstallContext,
    progress: Arc<ProgressStore>,
    cancellation_token: CancellationToken,
) {
    let pacing_delay = ctx.settings.pacing_delay;
    let install_timeout = ctx.settings.install_timeout;
    progress.set(id, TaskSnapshot::running(0, "Starting installation"));

    let (sink, mut checkpoints) = ProgressSink::channel(CHECKPOINT_CHANNEL_CAPACITY);
    let mut install = tokio::spawn(async move { installer.install(&ctx, &sink).await });
    let abort_handle = install.abort_handle();

    let producer = async {
        match (&mut install).await {
            Ok(result) => result,
            Err(e) => Err(anyhow!(errors::engine::installer_aborted(&e.to_string()))),
        }
    };
    let consumer = async {
        while let Some(checkpoint) = checkpoints.recv().await {
            progress.set(id, TaskSnapshot::running(checkpoint.percentage, checkpoint.message));
            tokio::time::sleep(pacing_delay).await;
        }
    };

    let outcome: Result<TunnelRecord> = tokio::select! {
        (result, ()) = async { tokio::join!(producer, consumer) } => result,
        _ = cancellation_token.cancelled() => {
            abort_handle.abort();
            Err(anyhow!(errors::engine::CANCELLED))
        }
        _ = deadline(install_timeout) => {
            abort_handle.abort();
            Err(anyhow!(errors::engine::timed_out(install_timeout.unwrap_or_default())))
        }
    };

    match outcome {
        Ok(record) => {
            tracing::info!("Task {} completed, tunnel record {}", id, record.id);
            progress.set(id, TaskSnapshot::completed());
        }
        Err(e) => {
            let reached = progress.get(id).percentage;
            tracing::error!("Task {} failed at {}%: {:#}", id, reached, e);
            progress.set(id, TaskSnapshot::failed(reached, format!("{:#}", e)));
        }
    }
}

async fn sweep(
    progress: Arc<ProgressStore>,
    tasks: TaskTable,
    ttl: Duration,
    interval: Duration,
    cancellation_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => {
                tracing::debug!("Progress sweeper stopped");
                return;
            }
            _ = ticker.tick() => {
                if progress.evict_expired(ttl) > 0 {
                    lock(&tasks).retain(|id, _| progress.contains(*id));
                }
            }
        }
    }
}
