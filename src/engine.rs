use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{DroverError, Result};
use crate::scheduler::{FifoPolicy, Job, Scheduler, SchedulerError, SchedulerPolicy, TaskQueue};
use crate::worker::{ExecutionBroker, Worker, WorkerPool};

/// Owns one queue, its worker pool, the broker and the jobs submitted to them.
///
/// Built explicitly and passed to whoever needs it; there is no process-wide
/// registry.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    queue: Arc<RwLock<TaskQueue>>,
    pool: Arc<RwLock<WorkerPool>>,
    jobs: Arc<RwLock<HashMap<Uuid, Arc<Job>>>>,
    broker: ExecutionBroker,
    /// Set once a scheduler has been handed out; recovery is closed from then on.
    scheduling: AtomicBool,
}

impl Engine {
    pub fn new(config: EngineConfig, pool: WorkerPool) -> Self {
        let queue = TaskQueue::new(config.queue_id.clone(), config.queue_name.clone());
        tracing::info!(queue = %queue, pool = %pool, "Engine created");
        Self {
            config,
            queue: Arc::new(RwLock::new(queue)),
            pool: Arc::new(RwLock::new(pool)),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            broker: ExecutionBroker::new(),
            scheduling: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue_id(&self) -> &str {
        &self.config.queue_id
    }

    pub fn queue(&self) -> Arc<RwLock<TaskQueue>> {
        self.queue.clone()
    }

    pub fn pool(&self) -> Arc<RwLock<WorkerPool>> {
        self.pool.clone()
    }

    pub fn broker(&self) -> &ExecutionBroker {
        &self.broker
    }

    /// Accept a job: mark it queued and append each of its tasks to the queue.
    pub async fn add_job(&self, queue_id: &str, job: Job) -> Result<Uuid> {
        if queue_id != self.config.queue_id {
            return Err(DroverError::QueueNotFound(queue_id.to_string()));
        }
        let job = Arc::new(job);
        job.mark_queued().await;
        {
            let mut queue = self.queue.write().await;
            for task in job.tasks() {
                queue.add_task(task.clone());
            }
        }
        self.jobs.write().await.insert(job.id(), job.clone());
        tracing::info!(job_id = %job.id(), label = job.label(), tasks = job.tasks().len(), "Job queued");
        Ok(job.id())
    }

    /// Cancelling work is not supported; the job keeps running or waiting.
    pub async fn stop_job(&self, job_id: &Uuid) -> Result<()> {
        if !self.jobs.read().await.contains_key(job_id) {
            return Err(DroverError::JobNotFound(*job_id));
        }
        tracing::warn!(job_id = %job_id, "Stopping jobs is not supported, request ignored");
        Ok(())
    }

    pub async fn job(&self, job_id: &Uuid) -> Option<Arc<Job>> {
        self.jobs.read().await.get(job_id).cloned()
    }

    /// All known jobs, oldest first
    pub async fn jobs(&self) -> Vec<Arc<Job>> {
        let mut jobs: Vec<Arc<Job>> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at());
        jobs
    }

    /// Scale out the pool at runtime.
    pub async fn add_workers(&self, workers: Vec<Arc<dyn Worker>>) {
        let mut pool = self.pool.write().await;
        for worker in workers {
            pool.add_worker(worker);
        }
    }

    /// Take back jobs restored from an external store.
    ///
    /// Jobs with at least one non-terminal task are reset (commands unstarted,
    /// tasks pending, job queued) and all their tasks re-enqueued. Finished and
    /// failed jobs are only registered. Calling this again with the same jobs
    /// leaves queue and states unchanged. Returns the number of jobs re-enqueued.
    ///
    /// # Errors
    ///
    /// Startup only: once [`Engine::scheduler`] or [`Engine::run`] has been
    /// called, returns [`DroverError::RecoveryAfterStart`] and touches nothing.
    /// A running task reset and re-enqueued would execute twice.
    pub async fn recover<I>(&self, jobs: I) -> Result<usize>
    where
        I: IntoIterator<Item = Arc<Job>>,
    {
        if self.scheduling.load(Ordering::Acquire) {
            tracing::warn!(queue_id = %self.config.queue_id, "Recovery refused, scheduler already started");
            return Err(DroverError::RecoveryAfterStart);
        }
        let mut requeued = 0;
        for job in jobs {
            if job.has_unfinished_task().await {
                job.reset().await;
                let mut queue = self.queue.write().await;
                for task in job.tasks() {
                    queue.add_task(task.clone());
                }
                requeued += 1;
                tracing::info!(job_id = %job.id(), label = job.label(), "Job recovered and re-queued");
            }
            self.jobs.write().await.insert(job.id(), job);
        }
        Ok(requeued)
    }

    pub fn scheduler(&self) -> Scheduler {
        self.scheduler_with_policy(Box::new(FifoPolicy))
    }

    pub fn scheduler_with_policy(&self, policy: Box<dyn SchedulerPolicy>) -> Scheduler {
        self.scheduling.store(true, Ordering::Release);
        Scheduler::new(
            self.queue.clone(),
            self.pool.clone(),
            policy,
            self.broker.clone(),
            self.config.scheduler_period,
        )
    }

    /// Run the FIFO scheduler until `shutdown` fires or a cycle fails, then wait
    /// for in-flight executions to finish.
    ///
    /// # Errors
    ///
    /// Returns the fatal [`SchedulerError`] of the failed cycle. In-flight tasks
    /// are left running; the caller decides whether to exit or restart.
    pub async fn run(&self, shutdown: CancellationToken) -> std::result::Result<(), SchedulerError> {
        self.scheduler().run(shutdown).await?;
        let in_flight = self.broker.in_flight();
        if in_flight > 0 {
            tracing::info!(in_flight, "Waiting for running tasks to finish");
        }
        self.broker.wait_idle().await;
        Ok(())
    }
}
