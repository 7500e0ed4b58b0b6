use crate::orchestrator::{JobContext, RenderState};
use crate::types::StatusResponse;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub created_at: Instant,
    pub workdir: PathBuf,
    pub state: watch::Receiver<RenderState>,
    pub progress: watch::Receiver<u32>,
    pub cancel: CancellationToken,
}

impl Job {
    /// A fresh job in `Received`, plus the context its orchestrator drives.
    pub fn new(workdir_root: &Path) -> (Self, JobContext) {
        let id = Uuid::new_v4();
        let workdir = workdir_root.join(id.to_string());
        let (state_tx, state) = watch::channel(RenderState::Received);
        let (progress_tx, progress) = watch::channel(0);
        let cancel = CancellationToken::new();
        let job = Self { id, created_at: Instant::now(), workdir: workdir.clone(), state, progress, cancel: cancel.clone() };
        let ctx = JobContext { id, workdir, cancel, state: state_tx, progress: progress_tx };
        (job, ctx)
    }

    pub fn current_state(&self) -> RenderState {
        self.state.borrow().clone()
    }

    pub fn to_status_response(&self, base_url: &str) -> StatusResponse {
        let state = self.current_state();
        StatusResponse {
            id: self.id,
            status: state.label().into(),
            progress: *self.progress.borrow(),
            url: match state {
                RenderState::Completed { .. } => Some(format!("{}/render/{}/output", base_url, self.id)),
                _ => None,
            },
            error: match &state {
                RenderState::Failed(e) => Some(e.to_body()),
                _ => None,
            },
        }
    }
}

#[derive(Clone, Default)]
pub struct JobStore(Arc<RwLock<HashMap<Uuid, Job>>>);

impl JobStore {
    pub async fn insert(&self, job: Job) -> Uuid {
        let id = job.id;
        self.0.write().await.insert(id, job);
        id
    }

    pub async fn get(&self, id: &Uuid) -> Option<Job> { self.0.read().await.get(id).cloned() }

    /// Requests cancellation. Idempotent; a job that already finished keeps its state.
    pub async fn cancel(&self, id: &Uuid) -> Option<Job> {
        let job = self.get(id).await?;
        if !job.current_state().is_terminal() {
            debug!(%id, "cancelling render");
        }
        job.cancel.cancel();
        Some(job)
    }

    pub async fn cancel_all(&self) {
        for job in self.0.read().await.values() {
            job.cancel.cancel();
        }
    }

    /// Drops finished jobs older than `ttl` and deletes their working directories.
    pub async fn prune(&self, ttl: Duration) -> usize {
        let expired: Vec<Job> = {
            let mut map = self.0.write().await;
            let ids: Vec<Uuid> = map
                .values()
                .filter(|j| j.created_at.elapsed() >= ttl && j.current_state().is_terminal())
                .map(|j| j.id)
                .collect();
            ids.iter().filter_map(|id| map.remove(id)).collect()
        };
        for job in &expired {
            if let Err(e) = tokio::fs::remove_dir_all(&job.workdir).await {
                debug!(id = %job.id, error = %e, "no workdir to remove");
            }
        }
        expired.len()
    }
}
