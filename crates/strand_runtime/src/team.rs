//! Teams: the thread pools execution units run on.
//!
//! A team receives [`Job`]s and runs each exactly once. The pass-through
//! team runs the job on the calling thread before `assign` returns; the
//! dedicated team owns worker threads fed from one shared queue plus a
//! private queue per worker, so a job carrying an affinity lands on the
//! worker that asked for it.

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, info, warn};

/// Team error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TeamError {
    /// Team is not accepting jobs
    #[error("team {team} is not running")]
    NotRunning {
        /// Team name
        team: String,
    },
    /// Worker thread could not be spawned
    #[error("team {team} could not spawn a worker: {reason}")]
    Spawn {
        /// Team name
        team: String,
        /// OS error
        reason: String,
    },
}

/// Where a job is running
#[derive(Debug, Clone)]
pub struct WorkerContext {
    team: Arc<str>,
    thread: ThreadId,
}

impl WorkerContext {
    /// Context for the current OS thread
    #[must_use]
    pub fn current(team: &Arc<str>) -> Self {
        Self {
            team: Arc::clone(team),
            thread: thread::current().id(),
        }
    }

    /// Team name
    #[must_use]
    pub fn team(&self) -> &str {
        &self.team
    }

    /// OS thread running the job
    #[must_use]
    pub fn thread(&self) -> ThreadId {
        self.thread
    }
}

/// A unit of work for a team
pub struct Job {
    affinity: Option<ThreadId>,
    task: Box<dyn FnOnce(&WorkerContext) + Send>,
}

impl Job {
    /// Wrap a task
    pub fn new(task: impl FnOnce(&WorkerContext) + Send + 'static) -> Self {
        Self {
            affinity: None,
            task: Box::new(task),
        }
    }

    /// Prefer the given worker thread
    #[must_use]
    pub fn with_affinity(mut self, thread: Option<ThreadId>) -> Self {
        self.affinity = thread;
        self
    }

    /// Preferred worker thread
    #[must_use]
    pub fn affinity(&self) -> Option<ThreadId> {
        self.affinity
    }

    /// Run the job
    pub fn run(self, worker: &WorkerContext) {
        (self.task)(worker);
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("affinity", &self.affinity)
            .finish_non_exhaustive()
    }
}

/// A pool of threads executing jobs
pub trait Team: Send + Sync {
    /// Team name
    fn name(&self) -> &str;

    /// Start accepting jobs
    ///
    /// # Errors
    ///
    /// Returns error if worker threads cannot be created
    fn start(&self) -> Result<(), TeamError>;

    /// Stop accepting jobs and wind down workers
    fn stop(&self);

    /// Hand over a job
    ///
    /// # Errors
    ///
    /// Returns error if the team is not running
    fn assign(&self, job: Job) -> Result<(), TeamError>;

    /// Whether `assign` runs the job on the caller's thread
    fn is_pass_through(&self) -> bool {
        false
    }
}

/// Runs every job on the calling thread
#[derive(Debug)]
pub struct PassThroughTeam {
    name: Arc<str>,
}

impl PassThroughTeam {
    /// Create a pass-through team
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self { name: name.into() }
    }
}

impl Team for PassThroughTeam {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> Result<(), TeamError> {
        Ok(())
    }

    fn stop(&self) {}

    fn assign(&self, job: Job) -> Result<(), TeamError> {
        job.run(&WorkerContext::current(&self.name));
        Ok(())
    }

    fn is_pass_through(&self) -> bool {
        true
    }
}

struct Worker {
    thread: ThreadId,
    direct: Sender<Job>,
    handle: Option<JoinHandle<()>>,
}

/// Fixed set of worker threads
pub struct DedicatedTeam {
    name: Arc<str>,
    threads: usize,
    shared: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<Worker>>,
    running: Arc<AtomicBool>,
    jobs_run: Arc<AtomicU64>,
}

impl DedicatedTeam {
    /// Create a team of `threads` workers (at least one)
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>, threads: usize) -> Self {
        Self {
            name: name.into(),
            threads: threads.max(1),
            shared: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            running: Arc::new(AtomicBool::new(false)),
            jobs_run: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of worker threads
    #[must_use]
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Jobs completed so far
    #[must_use]
    pub fn jobs_run(&self) -> u64 {
        self.jobs_run.load(Ordering::Relaxed)
    }

    /// Worker thread ids, in start order
    #[must_use]
    pub fn worker_threads(&self) -> Vec<ThreadId> {
        self.workers.lock().iter().map(|w| w.thread).collect()
    }

    fn spawn_worker(&self, index: usize, shared: Receiver<Job>) -> Result<Worker, TeamError> {
        let (direct_tx, direct_rx) = channel::unbounded::<Job>();
        let team = Arc::clone(&self.name);
        let jobs_run = Arc::clone(&self.jobs_run);

        let handle = thread::Builder::new()
            .name(format!("{}-{}", self.name, index))
            .spawn(move || {
                let worker = WorkerContext::current(&team);
                debug!(team = %team, index, "worker started");
                loop {
                    // Private queue first so affinity jobs are not starved
                    let job = match direct_rx.try_recv() {
                        Ok(job) => job,
                        Err(_) => {
                            crossbeam::select! {
                                recv(direct_rx) -> job => match job {
                                    Ok(job) => job,
                                    Err(_) => break,
                                },
                                recv(shared) -> job => match job {
                                    Ok(job) => job,
                                    Err(_) => break,
                                },
                            }
                        }
                    };
                    job.run(&worker);
                    jobs_run.fetch_add(1, Ordering::Relaxed);
                }
                debug!(team = %team, index, "worker stopped");
            })
            .map_err(|e| TeamError::Spawn {
                team: self.name.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Worker {
            thread: handle.thread().id(),
            direct: direct_tx,
            handle: Some(handle),
        })
    }
}

impl std::fmt::Debug for DedicatedTeam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedicatedTeam")
            .field("name", &self.name)
            .field("threads", &self.threads)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl Team for DedicatedTeam {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> Result<(), TeamError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (shared_tx, shared_rx) = channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(self.threads);
        for index in 0..self.threads {
            match self.spawn_worker(index, shared_rx.clone()) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    self.running.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }

        *self.shared.lock() = Some(shared_tx);
        *self.workers.lock() = workers;
        info!(team = %self.name, threads = self.threads, "team started");
        Ok(())
    }

    fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        // Dropping the senders disconnects the queues; workers exit once drained
        self.shared.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for mut worker in workers {
            drop(worker.direct);
            if worker.thread == current {
                continue;
            }
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    warn!(team = %self.name, "worker thread panicked");
                }
            }
        }
        info!(team = %self.name, "team stopped");
    }

    fn assign(&self, job: Job) -> Result<(), TeamError> {
        let not_running = || TeamError::NotRunning {
            team: self.name.to_string(),
        };
        if !self.running.load(Ordering::SeqCst) {
            return Err(not_running());
        }

        if let Some(affinity) = job.affinity() {
            let workers = self.workers.lock();
            if let Some(worker) = workers.iter().find(|w| w.thread == affinity) {
                return worker.direct.send(job).map_err(|_| not_running());
            }
        }

        match self.shared.lock().as_ref() {
            Some(queue) => queue.send(job).map_err(|_| not_running()),
            None => Err(not_running()),
        }
    }
}

impl Drop for DedicatedTeam {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Another name for an existing team
pub struct SharedTeam {
    name: Arc<str>,
    target: Arc<dyn Team>,
}

impl SharedTeam {
    /// Alias `target` under `name`
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>, target: Arc<dyn Team>) -> Self {
        Self {
            name: name.into(),
            target,
        }
    }

    /// Team actually running the jobs
    #[must_use]
    pub fn target(&self) -> &Arc<dyn Team> {
        &self.target
    }
}

impl Team for SharedTeam {
    fn name(&self) -> &str {
        &self.name
    }

    // Lifecycle belongs to the target team
    fn start(&self) -> Result<(), TeamError> {
        Ok(())
    }

    fn stop(&self) {}

    fn assign(&self, job: Job) -> Result<(), TeamError> {
        self.target.assign(job)
    }

    fn is_pass_through(&self) -> bool {
        self.target.is_pass_through()
    }
}
