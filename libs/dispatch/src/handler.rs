//! # Task Handler
//!
//! Fixed-size pool of worker tasks pulling [`Job`]s from one bounded queue.
//!
//! ## Lifecycle
//!
//! 1. [`TaskHandlerBuilder`] collects routers; duplicates fail here
//! 2. [`TaskHandlerBuilder::start`] freezes the router table and spawns workers
//! 3. Producers [`TaskHandler::submit`]; a full queue makes them wait
//! 4. [`TaskHandler::stop`] cancels workers; in-flight jobs finish, queued jobs
//!    are abandoned and counted
//!
//! A missing router is logged and the task dropped. A handler error or panic
//! is logged and the worker keeps going.

use crate::error::{DispatchError, DispatchResult};
use crate::router::{MsgId, Router, RouterTable};
use crate::task::{FuncTask, Job, Task, TaskOrigin, TaskPool};
use codec::Message;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandlerConfig {
    /// Number of worker tasks
    pub worker_pool_size: usize,
    /// Capacity of the shared job queue
    pub max_task_queue_len: usize,
    /// Idle tasks kept for reuse
    pub task_pool_capacity: usize,
}

impl Default for TaskHandlerConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 10,
            max_task_queue_len: 1024,
            task_pool_capacity: 1024,
        }
    }
}

impl TaskHandlerConfig {
    pub fn validate(&self) -> DispatchResult<()> {
        if self.worker_pool_size == 0 {
            return Err(DispatchError::Configuration(
                "worker_pool_size must be at least 1".into(),
            ));
        }
        if self.max_task_queue_len == 0 {
            return Err(DispatchError::Configuration(
                "max_task_queue_len must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Collects routers before the worker pool starts
#[derive(Debug, Default)]
pub struct TaskHandlerBuilder {
    config: TaskHandlerConfig,
    routers: RouterTable,
}

impl TaskHandlerBuilder {
    pub fn new(config: TaskHandlerConfig) -> Self {
        Self {
            config,
            routers: RouterTable::new(),
        }
    }

    pub fn add_router(&mut self, msg_id: MsgId, router: Arc<dyn Router>) -> DispatchResult<()> {
        self.routers.add(msg_id, router)?;
        debug!(msg_id, "router registered");
        Ok(())
    }

    pub fn routers(&self) -> &RouterTable {
        &self.routers
    }

    /// Spawn the workers on the current tokio runtime
    pub fn start(self) -> DispatchResult<Arc<TaskHandler>> {
        self.config.validate()?;

        let (sender, receiver) = mpsc::channel(self.config.max_task_queue_len);
        let receiver = Arc::new(Mutex::new(receiver));
        let routers = Arc::new(self.routers);
        let pool = Arc::new(TaskPool::new(self.config.task_pool_capacity));
        let token = CancellationToken::new();

        let workers = (0..self.config.worker_pool_size)
            .map(|worker_id| {
                let worker = Worker {
                    id: worker_id,
                    receiver: receiver.clone(),
                    routers: routers.clone(),
                    pool: pool.clone(),
                    token: token.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(
            workers = self.config.worker_pool_size,
            queue = self.config.max_task_queue_len,
            routers = routers.len(),
            "task handler started"
        );

        Ok(Arc::new(TaskHandler {
            config: self.config,
            sender,
            receiver,
            routers,
            pool,
            token,
            workers: Mutex::new(workers),
            stopped: AtomicBool::new(false),
        }))
    }
}

/// Running worker pool
pub struct TaskHandler {
    config: TaskHandlerConfig,
    sender: mpsc::Sender<Job>,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    routers: Arc<RouterTable>,
    pool: Arc<TaskPool>,
    token: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl TaskHandler {
    pub fn builder(config: TaskHandlerConfig) -> TaskHandlerBuilder {
        TaskHandlerBuilder::new(config)
    }

    pub fn config(&self) -> &TaskHandlerConfig {
        &self.config
    }

    pub fn routers(&self) -> &Arc<RouterTable> {
        &self.routers
    }

    pub fn task_pool(&self) -> &Arc<TaskPool> {
        &self.pool
    }

    /// Pooled task ready to submit
    pub fn new_task(&self, origin: TaskOrigin, message: Message) -> Task {
        self.pool.task(origin, message)
    }

    /// Jobs waiting for a worker
    pub fn queue_len(&self) -> usize {
        self.config.max_task_queue_len - self.sender.capacity()
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Enqueue a message task, waiting while the queue is full
    pub async fn submit(&self, task: Task) -> DispatchResult<()> {
        self.submit_job(Job::Message(task)).await
    }

    /// Enqueue a function call, waiting while the queue is full
    pub async fn submit_func<F>(&self, name: &'static str, fut: F) -> DispatchResult<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.submit_job(Job::Func(FuncTask::new(name, fut))).await
    }

    pub async fn submit_job(&self, job: Job) -> DispatchResult<()> {
        if self.token.is_cancelled() {
            self.recycle(job);
            return Err(DispatchError::QueueClosed);
        }
        match self.sender.send(job).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(job)) => {
                self.recycle(job);
                Err(DispatchError::QueueClosed)
            }
        }
    }

    /// Cancel the workers and wait for in-flight jobs; queued jobs are dropped
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for handle in workers {
            if let Err(e) = handle.await {
                error!("worker exited abnormally: {}", e);
            }
        }

        let mut receiver = self.receiver.lock().await;
        receiver.close();
        let mut abandoned = 0usize;
        while let Ok(job) = receiver.try_recv() {
            abandoned += 1;
            self.recycle(job);
        }
        if abandoned > 0 {
            warn!(abandoned, "task handler stopped with queued jobs");
        }
        info!("task handler stopped");
    }

    fn recycle(&self, job: Job) {
        if let Job::Message(task) = job {
            self.pool.release(task);
        }
    }
}

struct Worker {
    id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    routers: Arc<RouterTable>,
    pool: Arc<TaskPool>,
    token: CancellationToken,
}

impl Worker {
    async fn run(self) {
        debug!(worker_id = self.id, "worker started");
        loop {
            let job = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                job = async { self.receiver.lock().await.recv().await } => job,
            };
            match job {
                Some(job) => self.handle(job).await,
                None => break,
            }
        }
        debug!(worker_id = self.id, "worker exited");
    }

    async fn handle(&self, job: Job) {
        match job {
            Job::Func(func) => {
                let name = func.name();
                if let Err(e) = func.run().await {
                    warn!(worker_id = self.id, func = name, "function task failed: {}", e);
                }
            }
            Job::Message(mut task) => {
                match self.routers.bind(&mut task) {
                    Ok(()) => {
                        if let Err(e) = task.call_guarded().await {
                            warn!(
                                worker_id = self.id,
                                msg_id = task.msg_id(),
                                "task failed: {}",
                                e
                            );
                        }
                    }
                    Err(e) => {
                        warn!(
                            worker_id = self.id,
                            msg_id = task.msg_id(),
                            origin = ?task.origin(),
                            "dropping task: {}",
                            e
                        );
                    }
                }
                self.pool.release(task);
            }
        }
    }
}
