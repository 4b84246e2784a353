/*!
 * Task timing and the cooperative loop.
 *
 * In threaded deployments every component runs on its own task or thread
 * and [`TaskScheduler`] only keeps timing records. In cooperative
 * deployments a [`CooperativeLoop`] also drives each component's
 * non-blocking `poll_step` in round-robin on one thread.
 */
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

use starflow_core::runtime::ShutdownSignal;

use crate::error::{Error, Result};

/// Task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TaskId(u32);

impl TaskId {
    /// Wrap a raw identifier
    pub const fn new(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Timing bookkeeping for one named task
#[derive(Debug, Clone)]
pub struct TaskTimingRecord {
    /// Task name
    pub name: String,
    /// Start of the current or last invocation
    pub started_at: Option<Instant>,
    /// End of the last completed invocation
    pub ended_at: Option<Instant>,
    /// Sum of all completed invocations
    pub cumulative: Duration,
    /// Completed invocations
    pub invocations: u64,
    /// Duration of the most recent invocation
    pub last: Duration,
    running: bool,
}

impl TaskTimingRecord {
    fn new(name: String) -> Self {
        Self {
            name,
            started_at: None,
            ended_at: None,
            cumulative: Duration::ZERO,
            invocations: 0,
            last: Duration::ZERO,
            running: false,
        }
    }

    /// Whether an invocation is open
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Mean duration per invocation
    pub fn average(&self) -> Duration {
        if self.invocations == 0 {
            Duration::ZERO
        } else {
            self.cumulative.div_f64(self.invocations as f64)
        }
    }
}

/// One line of [`TaskScheduler::report`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    /// Task identifier
    pub id: TaskId,
    /// Task name
    pub name: String,
    /// Completed invocations
    pub invocations: u64,
    /// Total time spent
    pub cumulative: Duration,
    /// Mean time per invocation
    pub average: Duration,
    /// Most recent invocation
    pub last: Duration,
}

/// Named task timing registry
#[derive(Debug, Default)]
pub struct TaskScheduler {
    records: Mutex<BTreeMap<TaskId, TaskTimingRecord>>,
}

impl TaskScheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    fn with_records<T>(&self, f: impl FnOnce(&mut BTreeMap<TaskId, TaskTimingRecord>) -> T) -> T {
        let mut guard = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Register a task under `id`
    pub fn register<S: Into<String>>(&self, id: TaskId, name: S) -> Result<()> {
        let name = name.into();
        self.with_records(|records| {
            if records.contains_key(&id) {
                return Err(Error::already_exists(format!("{} is already registered", id)));
            }
            debug!(task = %name, %id, "Task registered");
            records.insert(id, TaskTimingRecord::new(name));
            Ok(())
        })
    }

    /// Register a task under the next free identifier
    pub fn register_next<S: Into<String>>(&self, name: S) -> TaskId {
        let name = name.into();
        self.with_records(|records| {
            let id = records.keys().next_back().map_or(TaskId(0), |last| TaskId(last.0 + 1));
            records.insert(id, TaskTimingRecord::new(name));
            id
        })
    }

    /// Mark the start of an invocation
    ///
    /// The returned guard calls [`TaskScheduler::stop`] when dropped.
    pub fn start(&self, id: TaskId) -> Result<TaskGuard<'_>> {
        self.start_at(id, Instant::now())?;
        Ok(TaskGuard { scheduler: self, id })
    }

    fn start_at(&self, id: TaskId, now: Instant) -> Result<()> {
        self.with_records(|records| {
            let record = records
                .get_mut(&id)
                .ok_or_else(|| Error::not_found(format!("{} is not registered", id)))?;
            if record.running {
                return Err(Error::scheduler(format!("{} is already running", record.name)));
            }
            record.started_at = Some(now);
            record.running = true;
            Ok(())
        })
    }

    /// Mark the end of an invocation and fold it into the record
    pub fn stop(&self, id: TaskId) -> Result<Duration> {
        let now = Instant::now();
        self.with_records(|records| {
            let record = records
                .get_mut(&id)
                .ok_or_else(|| Error::not_found(format!("{} is not registered", id)))?;
            let start = match record.started_at {
                Some(start) if record.running => start,
                _ => return Err(Error::scheduler(format!("{} was not started", record.name))),
            };
            let elapsed = now.saturating_duration_since(start);
            record.ended_at = Some(now);
            record.running = false;
            record.cumulative += elapsed;
            record.invocations += 1;
            record.last = elapsed;
            Ok(elapsed)
        })
    }

    /// The record for `id`
    pub fn record(&self, id: TaskId) -> Option<TaskTimingRecord> {
        self.with_records(|records| records.get(&id).cloned())
    }

    /// Snapshot of every record
    pub fn report(&self) -> Vec<TaskReport> {
        self.with_records(|records| {
            records
                .iter()
                .map(|(id, record)| TaskReport {
                    id: *id,
                    name: record.name.clone(),
                    invocations: record.invocations,
                    cumulative: record.cumulative,
                    average: record.average(),
                    last: record.last,
                })
                .collect()
        })
    }

    /// Emit the report through `tracing`
    pub fn log_report(&self) {
        for line in self.report() {
            info!(
                task = %line.name,
                invocations = line.invocations,
                cumulative_ms = line.cumulative.as_millis() as u64,
                average_us = line.average.as_micros() as u64,
                last_us = line.last.as_micros() as u64,
                "Task timing"
            );
        }
    }
}

/// Stops its invocation when dropped
#[derive(Debug)]
pub struct TaskGuard<'a> {
    scheduler: &'a TaskScheduler,
    id: TaskId,
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        let _ = self.scheduler.stop(self.id);
    }
}

/// A component the cooperative loop can drive
///
/// `poll_step` must return promptly: it may start work or collect a
/// finished result, but never wait on I/O.
pub trait CooperativeTask: Send {
    /// Name used for timing records
    fn name(&self) -> &str;

    /// Advance by one non-blocking step
    fn poll_step(&mut self, now: Instant);
}

/// Round-robin driver for cooperative deployments
pub struct CooperativeLoop {
    scheduler: Arc<TaskScheduler>,
    tasks: Vec<(TaskId, Box<dyn CooperativeTask>)>,
    period: Duration,
}

impl fmt::Debug for CooperativeLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CooperativeLoop")
            .field("tasks", &self.tasks.iter().map(|(_, task)| task.name()).collect::<Vec<_>>())
            .field("period", &self.period)
            .finish()
    }
}

impl CooperativeLoop {
    /// Create an empty loop that steps every `period`
    pub fn new(scheduler: Arc<TaskScheduler>, period: Duration) -> Self {
        Self {
            scheduler,
            tasks: Vec::new(),
            period,
        }
    }

    /// Add a component to the rotation
    pub fn add(&mut self, task: Box<dyn CooperativeTask>) -> TaskId {
        let id = self.scheduler.register_next(task.name().to_string());
        self.tasks.push((id, task));
        id
    }

    /// Number of components in the rotation
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the rotation is empty
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Give every component one step
    pub fn step(&mut self, now: Instant) {
        for (id, task) in &mut self.tasks {
            let _guard = self.scheduler.start(*id);
            task.poll_step(now);
        }
    }

    /// Step every `period` until shutdown
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        info!(tasks = self.tasks.len(), period = ?self.period, "Cooperative loop started");
        let mut ticker = time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => self.step(Instant::now()),
            }
        }
        self.scheduler.log_report();
        info!("Cooperative loop stopped");
    }
}
