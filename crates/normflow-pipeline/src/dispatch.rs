use crate::{PipelineError, WORKERS_PER_SUBJECT};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

/// Runs independent jobs against a fixed number of process slots. Clones
/// share the same slots.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    n_procs: usize,
    slots: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(n_procs: usize) -> Self {
        let n_procs = n_procs.max(1);
        Self {
            n_procs,
            slots: Arc::new(Semaphore::new(n_procs)),
        }
    }

    pub fn for_subjects(subject_count: usize) -> Self {
        Self::new(subject_count * WORKERS_PER_SUBJECT)
    }

    pub fn n_procs(&self) -> usize {
        self.n_procs
    }

    /// Waits for a free slot. Hold the permit for as long as the external
    /// process runs.
    pub async fn slot(&self) -> Result<OwnedSemaphorePermit, PipelineError> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Runtime("worker pool closed".to_string()))
    }

    /// Spawns every job at once; jobs take a `slot` around each process they
    /// launch. Results come back in job order. A panicking job aborts the
    /// whole dispatch; failures a job reports through its output do not.
    pub async fn run<T, F, Fut>(&self, jobs: Vec<T>, job: F) -> Result<Vec<Fut::Output>, PipelineError>
    where
        T: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let job_count = jobs.len();
        let job = Arc::new(job);
        let mut running = JoinSet::new();

        for (index, item) in jobs.into_iter().enumerate() {
            let job = Arc::clone(&job);
            running.spawn(async move { (index, job(item).await) });
        }

        let mut results: Vec<Option<Fut::Output>> = (0..job_count).map(|_| None).collect();
        while let Some(joined) = running.join_next().await {
            let (index, output) = joined.map_err(|error| {
                PipelineError::Runtime(format!("worker task failed: {error}"))
            })?;
            results[index] = Some(output);
        }

        Ok(results.into_iter().flatten().collect())
    }
}
