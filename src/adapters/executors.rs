//! Executors backing the `Executor` port.
//!
//! [`WorkerPool`] owns a dedicated tokio multi-thread runtime so pipeline work
//! never competes with the transport's reactor threads. [`InlineExecutor`]
//! runs tasks on the submitting thread. [`ExecutorRegistry`] resolves both by
//! qualifier, together with the buffer size configured for each and a
//! [`Scheduler`] for any worker pool.
use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use scc::HashMap as ConcurrentMap;
use tokio::runtime::{Builder, Handle, Runtime};

use super::scheduler::Scheduler;
use crate::{
    config::models::ExecutorConfig,
    ports::executor::{Executor, ExecutorError, ExecutorResult, ExecutorSupply, Task},
    reactive::{ParallelOptions, error::panic_message},
};

/// Qualifiers every registry built from configuration must provide.
pub const DEFAULT_EXECUTOR: &str = "default";
pub const MANAGE_EXECUTOR: &str = "manage";
pub const SCHEDULED_EXECUTOR: &str = "scheduled";

fn run_task(executor: &str, task: Task) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
        tracing::error!(
            "Task on executor '{}' panicked: {}",
            executor,
            panic_message(payload.as_ref())
        );
    }
}

/// Runs each task immediately on the calling thread.
#[derive(Debug, Clone)]
pub struct InlineExecutor {
    name: String,
}

impl InlineExecutor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Executor for InlineExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, task: Task) -> ExecutorResult<()> {
        run_task(&self.name, task);
        Ok(())
    }
}

/// Fixed size pool of worker threads.
pub struct WorkerPool {
    name: String,
    threads: usize,
    runtime: Option<Runtime>,
    handle: Handle,
    closed: AtomicBool,
}

impl WorkerPool {
    /// Start a pool with `threads` workers (at least one).
    pub fn new(name: impl Into<String>, threads: usize) -> ExecutorResult<Self> {
        let name = name.into();
        let threads = threads.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name(format!("{name}-worker"))
            .enable_all()
            .build()
            .map_err(|source| ExecutorError::Build {
                executor: name.clone(),
                source,
            })?;
        let handle = runtime.handle().clone();
        tracing::debug!("Started executor '{}' with {} threads", name, threads);
        Ok(Self {
            name,
            threads,
            runtime: Some(runtime),
            handle,
            closed: AtomicBool::new(false),
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Runtime handle, for spawning async work onto the pool.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Refuse new tasks. Tasks already submitted still run.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!("Executor '{}' closed", self.name);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Executor for WorkerPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, task: Task) -> ExecutorResult<()> {
        if self.is_closed() {
            return Err(ExecutorError::Rejected {
                executor: self.name.clone(),
                reason: "executor is closed".to_string(),
            });
        }
        let name = self.name.clone();
        self.handle.spawn(async move { run_task(&name, task) });
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // shutdown_background does not block, so dropping inside async code is safe
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("threads", &self.threads)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Named executors, resolved by qualifier.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: ConcurrentMap<String, Arc<dyn Executor>>,
    buffer_sizes: ConcurrentMap<String, usize>,
    pools: ConcurrentMap<String, Handle>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one executor per configured entry: zero threads means inline,
    /// anything else a worker pool of that size.
    pub fn from_config(config: &HashMap<String, ExecutorConfig>) -> ExecutorResult<Self> {
        let registry = Self::new();
        for (name, executor) in config {
            let built: Arc<dyn Executor> = if executor.threads == 0 {
                Arc::new(InlineExecutor::new(name.clone()))
            } else {
                let pool = WorkerPool::new(name.clone(), executor.threads)?;
                let _ = registry
                    .pools
                    .insert_sync(name.clone(), pool.handle().clone());
                Arc::new(pool)
            };
            registry.register(built)?;
            let _ = registry
                .buffer_sizes
                .insert_sync(name.clone(), executor.buffer_size);
        }
        tracing::info!("Executor registry ready with {} executors", registry.len());
        Ok(registry)
    }

    /// Register under the executor's own name; names are unique.
    pub fn register(&self, executor: Arc<dyn Executor>) -> ExecutorResult<()> {
        let name = executor.name().to_string();
        self.executors
            .insert_sync(name.clone(), executor)
            .map_err(|_| ExecutorError::Duplicate(name))
    }

    /// Configured buffer size, for executors built from configuration.
    pub fn buffer_size(&self, qualifier: &str) -> Option<usize> {
        self.buffer_sizes.read_sync(qualifier, |_, size| *size)
    }

    /// Options for a parallel stage processing on `process` and signalling
    /// on `manage`, bounded by the buffer size configured for `process`.
    pub fn parallel_options(&self, process: &str, manage: &str) -> ExecutorResult<ParallelOptions> {
        let mut options =
            ParallelOptions::new(self.executor(process)?).with_manage(self.executor(manage)?);
        if let Some(size) = self.buffer_size(process) {
            options = options.with_buffer_size(size);
        }
        Ok(options)
    }

    /// Scheduler whose schedules run on the named worker pool.
    pub fn scheduler(&self, qualifier: &str) -> ExecutorResult<Scheduler> {
        if let Some(handle) = self.pools.read_sync(qualifier, |_, handle| handle.clone()) {
            return Ok(Scheduler::new(handle));
        }
        if self.contains(qualifier) {
            return Err(ExecutorError::Rejected {
                executor: qualifier.to_string(),
                reason: "schedules need a worker pool, not an inline executor".to_string(),
            });
        }
        Err(ExecutorError::Unknown(qualifier.to_string()))
    }

    pub fn contains(&self, qualifier: &str) -> bool {
        self.executors.contains_sync(qualifier)
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl ExecutorSupply for ExecutorRegistry {
    fn executor(&self, qualifier: &str) -> ExecutorResult<Arc<dyn Executor>> {
        self.executors
            .read_sync(qualifier, |_, executor| executor.clone())
            .ok_or_else(|| ExecutorError::Unknown(qualifier.to_string()))
    }
}
