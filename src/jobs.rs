//! Job orchestrator.
//!
//! Each add or delete runs as a tokio task moving through
//! `queued -> running -> success | error`. Jobs touching the same image
//! run strictly in submission order: every job waits for the terminal
//! status of the job submitted before it for that image. Jobs for
//! different images run concurrently.
//!
//! Completion is observed through the [`JobHandle`] returned by
//! [`JobOrchestrator::submit`]; passive listeners can also
//! [`subscribe`](JobOrchestrator::subscribe) to every lifecycle event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use log::{debug, error, info};
use tokio::sync::{broadcast, watch};

use crate::discovery::Discovery;
use crate::error::{JobError, RegistryError, WaitError};
use crate::puller::ImagePuller;
use crate::registry::Registry;
use crate::types::{ImageRef, Job, JobEvent, JobStatus, Operation, JOB_TYPE};

const EVENT_CAPACITY: usize = 256;

/// Caller side of a submitted job.
pub struct JobHandle {
    id: u64,
    status: watch::Receiver<JobStatus>,
}

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> JobStatus {
        *self.status.borrow()
    }

    /// Resolve with the terminal status.
    pub async fn wait(&mut self) -> Result<JobStatus, WaitError> {
        let id = self.id;
        self.status
            .wait_for(|s| s.is_terminal())
            .await
            .map(|s| *s)
            .map_err(|_| WaitError::Dropped(id))
    }

    /// Like [`wait`](Self::wait) but gives up after `limit`. The job keeps
    /// running when this times out.
    pub async fn wait_timeout(&mut self, limit: Duration) -> Result<JobStatus, WaitError> {
        let id = self.id;
        tokio::time::timeout(limit, self.wait())
            .await
            .map_err(|_| WaitError::TimedOut(id, limit.as_secs()))?
    }
}

struct Shared {
    puller: ImagePuller,
    discovery: Discovery,
    registry: Arc<Registry>,
    jobs: RwLock<HashMap<u64, Job>>,
    /// Last submitted job per image; the next job for that image waits on it.
    tails: Mutex<HashMap<ImageRef, (u64, watch::Receiver<JobStatus>)>>,
    events: broadcast::Sender<JobEvent>,
    next_id: AtomicU64,
    /// Finished jobs kept for `/jobs`; older ones are dropped first.
    history_limit: usize,
}

#[derive(Clone)]
pub struct JobOrchestrator {
    shared: Arc<Shared>,
}

impl JobOrchestrator {
    pub fn new(
        puller: ImagePuller,
        discovery: Discovery,
        registry: Arc<Registry>,
        history_limit: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                puller,
                discovery,
                registry,
                jobs: RwLock::new(HashMap::new()),
                tails: Mutex::new(HashMap::new()),
                events,
                next_id: AtomicU64::new(1),
                history_limit,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    pub fn puller(&self) -> &ImagePuller {
        &self.shared.puller
    }

    /// Receive every job lifecycle event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.shared.events.subscribe()
    }

    pub fn job(&self, id: u64) -> Option<Job> {
        self.shared.jobs_read().get(&id).cloned()
    }

    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.shared.jobs_read().values().cloned().collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    /// Queue `operation` against `image` and return immediately.
    pub fn submit(&self, operation: Operation, image: ImageRef) -> JobHandle {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = watch::channel(JobStatus::Queued);

        self.shared.jobs_write().insert(
            id,
            Job {
                id,
                job_type: JOB_TYPE,
                operation,
                image: image.clone(),
                status: JobStatus::Queued,
                log: Vec::new(),
                error: None,
            },
        );
        self.shared.emit(id, JobStatus::Queued);
        info!("Queued job {} ({:?} {})", id, operation, image);

        let previous = self
            .shared
            .tails_lock()
            .insert(image.clone(), (id, rx.clone()))
            .map(|(_, prev)| prev);

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            if let Some(mut prev) = previous {
                // An error only means the previous job's task is gone.
                let _ = prev.wait_for(|s| s.is_terminal()).await;
            }
            shared.run(id, operation, &image, &tx).await;

            let mut tails = shared.tails_lock();
            if tails.get(&image).map(|(tail, _)| *tail) == Some(id) {
                tails.remove(&image);
            }
        });

        JobHandle { id, status: rx }
    }

    /// Submit a delete only if `image` is registered. `None` means nothing
    /// was submitted.
    pub fn submit_delete(
        &self,
        image: ImageRef,
        delete_from_local_repo: bool,
    ) -> Result<Option<JobHandle>, RegistryError> {
        if !self.shared.registry.contains(&image)? {
            return Ok(None);
        }
        Ok(Some(self.submit(
            Operation::Delete {
                delete_from_local_repo,
            },
            image,
        )))
    }
}

impl Shared {
    fn jobs_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<u64, Job>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn jobs_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<u64, Job>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn tails_lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<ImageRef, (u64, watch::Receiver<JobStatus>)>> {
        self.tails.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, id: u64, status: JobStatus) {
        let Some(job) = self.jobs_read().get(&id).cloned() else {
            return;
        };
        // No receivers is fine.
        let _ = self.events.send(JobEvent {
            job_id: id,
            job_type: JOB_TYPE,
            operation: job.operation,
            image: job.image,
            status,
        });
    }

    fn log(&self, id: u64, line: impl Into<String>) {
        if let Some(job) = self.jobs_write().get_mut(&id) {
            job.log.push(line.into());
        }
    }

    fn transition(
        &self,
        id: u64,
        next: JobStatus,
        tx: &watch::Sender<JobStatus>,
    ) -> Result<(), JobError> {
        {
            let mut jobs = self.jobs_write();
            let Some(job) = jobs.get_mut(&id) else {
                return Ok(());
            };
            if !job.status.can_transition_to(next) {
                return Err(JobError::IllegalTransition {
                    from: job.status,
                    to: next,
                });
            }
            job.status = next;
            if next.is_terminal() {
                self.prune(&mut jobs, id);
            }
        }
        self.emit(id, next);
        tx.send_replace(next);
        Ok(())
    }

    /// Drop the oldest finished jobs beyond `history_limit`, never `keep`.
    fn prune(&self, jobs: &mut HashMap<u64, Job>, keep: u64) {
        let mut finished: Vec<u64> = jobs
            .values()
            .filter(|j| j.status.is_terminal() && j.id != keep)
            .map(|j| j.id)
            .collect();
        // `keep` itself counts towards the limit.
        let excess = (finished.len() + 1).saturating_sub(self.history_limit);
        if excess == 0 {
            return;
        }
        finished.sort_unstable();
        for old in finished.into_iter().take(excess) {
            jobs.remove(&old);
        }
        debug!("Pruned {} finished jobs", excess);
    }

    async fn run(
        &self,
        id: u64,
        operation: Operation,
        image: &ImageRef,
        tx: &watch::Sender<JobStatus>,
    ) {
        if let Err(e) = self.transition(id, JobStatus::Running, tx) {
            error!("Job {} could not start: {}", id, e);
            return;
        }
        info!("Running job {} ({:?} {})", id, operation, image);

        let outcome = self.execute(id, operation, image).await;
        let status = match &outcome {
            Ok(()) => JobStatus::Success,
            Err(e) => {
                error!("Job {} ({:?} {}) failed: {}", id, operation, image, e);
                if let Some(job) = self.jobs_write().get_mut(&id) {
                    job.error = Some(e.to_string());
                    job.log.push(format!("error: {}", e));
                }
                JobStatus::Error
            }
        };

        if let Err(e) = self.transition(id, status, tx) {
            error!("Job {} could not finish: {}", id, e);
            return;
        }
        info!("Job {} finished with status {}", id, status);
    }

    async fn execute(&self, id: u64, operation: Operation, image: &ImageRef) -> Result<(), JobError> {
        match operation {
            Operation::Add => {
                let handle = self.puller.pull(image).await?;
                if handle.pulled {
                    self.log(id, format!("pulled {}", image));
                } else {
                    self.log(id, format!("{} already present locally", image));
                }

                let entries = self.discovery.discover(&handle).await?;
                self.log(
                    id,
                    format!(
                        "discovered {}",
                        entries
                            .iter()
                            .map(|e| e.name.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                );
                self.registry.upsert(image, entries)?;
            }
            Operation::Delete {
                delete_from_local_repo,
            } => {
                // Metadata stays removed even if the cache removal below fails.
                let existed = self.registry.remove(image)?;
                self.log(
                    id,
                    if existed {
                        format!("removed metadata for {}", image)
                    } else {
                        format!("no metadata for {}", image)
                    },
                );
                if delete_from_local_repo {
                    self.puller.remove(image).await?;
                    self.log(id, format!("removed {} from local cache", image));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockRuntime;

    fn orchestrator(mock: &Arc<MockRuntime>) -> JobOrchestrator {
        let puller = ImagePuller::new(mock.clone(), 1, Duration::from_millis(1));
        let discovery = Discovery::new(mock.clone(), Duration::from_secs(5), "/cli");
        JobOrchestrator::new(puller, discovery, Arc::new(Registry::new()), 100)
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn add_runs_pull_discover_upsert() {
        let mock = Arc::new(MockRuntime::new());
        let image = ImageRef::tagged("dsarchive/histomicstk", "v0.1.3");
        mock.add_remote_image(&image, MockRuntime::sample_clis());
        let orch = orchestrator(&mock);

        let mut handle = orch.submit(Operation::Add, image.clone());
        assert_eq!(handle.wait_timeout(WAIT).await, Ok(JobStatus::Success));
        assert!(orch.registry().contains(&image).unwrap());

        let job = orch.job(handle.id()).unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.job_type, "cli_job");
        assert!(job.log.iter().any(|l| l.starts_with("pulled")));
    }

    #[tokio::test]
    async fn missing_image_errors_without_upsert() {
        let mock = Arc::new(MockRuntime::new());
        let orch = orchestrator(&mock);

        let mut handle = orch.submit(Operation::Add, ImageRef::tagged("null/null", "null"));
        assert_eq!(handle.wait_timeout(WAIT).await, Ok(JobStatus::Error));
        assert!(orch.registry().list().unwrap().is_empty());
        assert!(orch.job(handle.id()).unwrap().error.is_some());
    }

    #[tokio::test]
    async fn events_follow_the_lifecycle_once() {
        let mock = Arc::new(MockRuntime::new());
        let image = ImageRef::tagged("library/hello-world", "latest");
        mock.add_plain_image(&image, "Hello from Docker!");
        let orch = orchestrator(&mock);
        let mut events = orch.subscribe();

        let mut handle = orch.submit(Operation::Add, image.clone());
        assert_eq!(handle.wait_timeout(WAIT).await, Ok(JobStatus::Error));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.job_id, handle.id());
            assert_eq!(event.image, image);
            seen.push(event.status);
        }
        assert_eq!(
            seen,
            vec![JobStatus::Queued, JobStatus::Running, JobStatus::Error]
        );
    }

    #[tokio::test]
    async fn failed_cache_removal_keeps_metadata_removed() {
        let mock = Arc::new(MockRuntime::new());
        let image = ImageRef::tagged("org/tools", "1");
        mock.add_remote_image(&image, MockRuntime::sample_clis());
        let orch = orchestrator(&mock);
        orch.submit(Operation::Add, image.clone())
            .wait_timeout(WAIT)
            .await
            .unwrap();

        mock.set_fail_remove(true);
        let mut handle = orch.submit_delete(image.clone(), true).unwrap().unwrap();
        assert_eq!(handle.wait_timeout(WAIT).await, Ok(JobStatus::Error));
        assert!(!orch.registry().contains(&image).unwrap());
        assert!(mock.is_cached(&image));
    }

    #[tokio::test]
    async fn delete_of_unregistered_image_submits_nothing() {
        let mock = Arc::new(MockRuntime::new());
        let orch = orchestrator(&mock);
        let handle = orch
            .submit_delete(ImageRef::tagged("null/null", "null"), false)
            .unwrap();
        assert!(handle.is_none());
        assert!(orch.jobs().is_empty());
    }

    #[tokio::test]
    async fn same_image_jobs_run_in_submission_order() {
        let mock = Arc::new(MockRuntime::new());
        let image = ImageRef::tagged("org/tools", "1");
        mock.add_remote_image(&image, MockRuntime::sample_clis());
        mock.set_pull_delay(Duration::from_millis(50));
        let orch = orchestrator(&mock);

        let mut add = orch.submit(Operation::Add, image.clone());
        let mut delete = orch.submit(
            Operation::Delete {
                delete_from_local_repo: false,
            },
            image.clone(),
        );
        assert_eq!(delete.status(), JobStatus::Queued);

        assert_eq!(delete.wait_timeout(WAIT).await, Ok(JobStatus::Success));
        assert_eq!(add.status(), JobStatus::Success);
        assert_eq!(add.wait_timeout(WAIT).await, Ok(JobStatus::Success));
        assert!(!orch.registry().contains(&image).unwrap());
    }

    #[tokio::test]
    async fn different_images_run_concurrently() {
        let mock = Arc::new(MockRuntime::new());
        let a = ImageRef::tagged("org/a", "1");
        let b = ImageRef::tagged("org/b", "1");
        mock.add_remote_image(&a, MockRuntime::sample_clis());
        mock.add_remote_image(&b, MockRuntime::sample_clis());
        mock.set_pull_delay(Duration::from_millis(200));
        let orch = orchestrator(&mock);

        let started = std::time::Instant::now();
        let mut ha = orch.submit(Operation::Add, a);
        let mut hb = orch.submit(Operation::Add, b);
        assert_eq!(ha.wait_timeout(WAIT).await, Ok(JobStatus::Success));
        assert_eq!(hb.wait_timeout(WAIT).await, Ok(JobStatus::Success));
        assert!(started.elapsed() < Duration::from_millis(390));
        assert_eq!(orch.registry().list().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn caller_timeout_does_not_fail_the_job() {
        let mock = Arc::new(MockRuntime::new());
        let image = ImageRef::tagged("org/slow", "1");
        mock.add_remote_image(&image, MockRuntime::sample_clis());
        mock.set_pull_delay(Duration::from_millis(300));
        let orch = orchestrator(&mock);

        let mut handle = orch.submit(Operation::Add, image.clone());
        let id = handle.id();
        assert_eq!(
            handle.wait_timeout(Duration::from_millis(10)).await,
            Err(WaitError::TimedOut(id, 0))
        );
        assert_eq!(handle.wait_timeout(WAIT).await, Ok(JobStatus::Success));
        assert!(orch.registry().contains(&image).unwrap());
    }

    #[tokio::test]
    async fn finished_jobs_beyond_history_limit_are_dropped() {
        let mock = Arc::new(MockRuntime::new());
        let puller = ImagePuller::new(mock.clone(), 1, Duration::from_millis(1));
        let discovery = Discovery::new(mock.clone(), Duration::from_secs(5), "/cli");
        let orch = JobOrchestrator::new(puller, discovery, Arc::new(Registry::new()), 2);

        let mut ids = Vec::new();
        for n in 0..3 {
            let image = ImageRef::tagged("null/null", n.to_string());
            let mut handle = orch.submit(Operation::Add, image);
            assert_eq!(handle.wait_timeout(WAIT).await, Ok(JobStatus::Error));
            ids.push(handle.id());
        }

        assert!(orch.job(ids[0]).is_none());
        let kept: Vec<u64> = orch.jobs().iter().map(|j| j.id).collect();
        assert_eq!(kept, ids[1..].to_vec());
    }
}
