/*!
 * Per-device command queue.
 *
 * Producers enqueue commands through a cloneable [`QueueSender`] and get a
 * [`CommandHandle`] back. A single dispatch context owns the transport and
 * sends one command at a time, in enqueue order, waiting for the reply or
 * the command's timeout before taking the next one.
 *
 * The queue does not look at what a command means. Rejecting a close while
 * a roof is opening is the caller's job.
 */
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use starflow_core::config::{PeriodicCommandConfig, QueueConfig, ReconnectPolicy};
use starflow_core::runtime::ShutdownSignal;
use starflow_core::types::Value;
use starflow_core::utils::with_timeout;
use starflow_devices::{CommandReply, CommandRequest, DeviceError, Framing, Transport};

use crate::scheduler::CooperativeTask;

/// Timeout class of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandClass {
    /// Halt and abort commands
    Stop,
    /// Reads and simple setters
    Query,
    /// Short motions: focuser moves, shutter and roof commands
    Motion,
    /// Slews, homing and parking
    Slew,
}

impl CommandClass {
    /// Guess the class from an Alpaca method name or an LX200 command
    pub fn for_command(name: &str) -> Self {
        let name = name.trim_start_matches(':').to_ascii_lowercase();
        const STOP: &[&str] = &["abort", "halt", "stop", "q#"];
        const SLEW: &[&str] = &["slew", "findhome", "park", "unpark", "ms#"];
        const MOTION: &[&str] = &["move", "open", "close", "pulseguide", "tempcomp"];

        if STOP.iter().any(|p| name.starts_with(p)) {
            CommandClass::Stop
        } else if SLEW.iter().any(|p| name.starts_with(p)) {
            CommandClass::Slew
        } else if MOTION.iter().any(|p| name.starts_with(p)) {
            CommandClass::Motion
        } else {
            CommandClass::Query
        }
    }
}

/// Default timeout per command class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTimeouts {
    /// Stop class
    pub stop: Duration,
    /// Query class
    pub query: Duration,
    /// Motion class
    pub motion: Duration,
    /// Slew class
    pub slew: Duration,
}

impl CommandTimeouts {
    /// Timeout for `class`
    pub fn for_class(&self, class: CommandClass) -> Duration {
        match class {
            CommandClass::Stop => self.stop,
            CommandClass::Query => self.query,
            CommandClass::Motion => self.motion,
            CommandClass::Slew => self.slew,
        }
    }
}

impl From<&QueueConfig> for CommandTimeouts {
    fn from(config: &QueueConfig) -> Self {
        Self {
            stop: Duration::from_millis(config.stop_timeout_ms),
            query: Duration::from_millis(config.query_timeout_ms),
            motion: Duration::from_millis(config.motion_timeout_ms),
            slew: Duration::from_millis(config.slew_timeout_ms),
        }
    }
}

/// A command to enqueue
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// What goes on the wire
    pub request: CommandRequest,
    /// Timeout class
    pub class: CommandClass,
    /// Overrides the class timeout
    pub timeout: Option<Duration>,
}

impl Command {
    /// Wrap a request, classifying it by name
    pub fn new(request: CommandRequest) -> Self {
        let class = CommandClass::for_command(&request.name);
        Self {
            request,
            class,
            timeout: None,
        }
    }

    /// Shorthand for a parameterless command
    pub fn named<S: Into<String>>(name: S) -> Self {
        Self::new(CommandRequest::new(name))
    }

    /// Force a class
    pub fn with_class(mut self, class: CommandClass) -> Self {
        self.class = class;
        self
    }

    /// Override the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Where a command is in its life
#[derive(Debug, Clone, PartialEq)]
pub enum CommandStatus {
    /// Waiting in the queue
    Pending,
    /// Sent, waiting for the reply
    InFlight,
    /// Completed with this payload
    Succeeded(Value),
    /// Completed with an error
    Failed(DeviceError),
    /// No reply within the timeout
    TimedOut,
    /// Cancelled before dispatch
    Cancelled,
}

impl CommandStatus {
    /// Whether the command is finished
    pub fn is_complete(&self) -> bool {
        !matches!(self, CommandStatus::Pending | CommandStatus::InFlight)
    }
}

/// State of the link as seen by producers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No connection attempt has finished yet
    Connecting,
    /// The transport is up
    Connected,
    /// The transport dropped; new commands are refused
    Reconnecting,
}

/// Latest reply to a periodic command
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodicReading {
    /// Reply payload
    pub value: Value,
    /// When it arrived
    pub at: DateTime<Utc>,
}

/// A status query sent whenever the queue is idle and its interval elapsed
#[derive(Debug, Clone)]
pub struct PeriodicCommand {
    request: CommandRequest,
    interval: Duration,
    next_due: Option<Instant>,
}

impl PeriodicCommand {
    /// Send `request` every `interval`
    pub fn new(request: CommandRequest, interval: Duration) -> Self {
        Self {
            request,
            interval,
            next_due: None,
        }
    }

    /// Build from a `[[mounts.periodic]]` entry
    pub fn from_config(config: &PeriodicCommandConfig, framing: Framing) -> Self {
        Self::new(
            CommandRequest::new(config.command.clone()).with_framing(framing),
            Duration::from_millis(config.interval_ms),
        )
    }

    fn is_due(&self, now: Instant) -> bool {
        self.next_due.map_or(true, |due| now >= due)
    }
}

struct CommandEntry {
    id: u64,
    command: Command,
    enqueued_at: Instant,
    status: watch::Sender<CommandStatus>,
}

impl fmt::Debug for CommandEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandEntry")
            .field("id", &self.id)
            .field("command", &self.command.request.name)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl CommandEntry {
    fn status(&self) -> CommandStatus {
        self.status.borrow().clone()
    }

    fn set_status(&self, status: CommandStatus) {
        self.status.send_replace(status);
    }
}

#[derive(Debug)]
struct QueueState {
    pending: VecDeque<Arc<CommandEntry>>,
    in_flight: Option<Arc<CommandEntry>>,
    retained: VecDeque<(Instant, Arc<CommandEntry>)>,
    link: LinkState,
    readings: BTreeMap<String, PeriodicReading>,
}

#[derive(Debug)]
struct QueueShared {
    name: String,
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
    next_id: AtomicU64,
}

impl QueueShared {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Producer side of a queue
#[derive(Debug, Clone)]
pub struct QueueSender(Arc<QueueShared>);

impl QueueSender {
    /// Queue name
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Append a command
    ///
    /// Fails with `QueueFull` at capacity and `Busy` while the link is down.
    pub fn enqueue(&self, command: Command) -> Result<CommandHandle, DeviceError> {
        let shared = &self.0;
        let entry = {
            let mut state = shared.state();
            if state.link == LinkState::Reconnecting {
                return Err(DeviceError::Busy(format!("{} is reconnecting", shared.name)));
            }
            if state.pending.len() >= shared.capacity {
                return Err(DeviceError::QueueFull {
                    capacity: shared.capacity,
                });
            }
            let (status, _) = watch::channel(CommandStatus::Pending);
            let entry = Arc::new(CommandEntry {
                id: shared.next_id.fetch_add(1, Ordering::Relaxed),
                command,
                enqueued_at: Instant::now(),
                status,
            });
            state.pending.push_back(entry.clone());
            entry
        };
        debug!(queue = %shared.name, id = entry.id, command = %entry.command.request.name, "Enqueued");
        shared.notify.notify_one();
        Ok(CommandHandle {
            entry,
            shared: shared.clone(),
        })
    }

    /// Status of command `id` while it is queued, in flight, or retained
    pub fn status_of(&self, id: u64) -> Option<CommandStatus> {
        let state = self.0.state();
        state
            .pending
            .iter()
            .chain(state.in_flight.iter())
            .chain(state.retained.iter().map(|(_, entry)| entry))
            .find(|entry| entry.id == id)
            .map(|entry| entry.status())
    }

    /// Commands waiting for dispatch
    pub fn pending(&self) -> usize {
        self.0.state().pending.len()
    }

    /// Current link state
    pub fn link_state(&self) -> LinkState {
        self.0.state().link
    }

    /// Latest reply to the periodic command `command`
    pub fn periodic_reading(&self, command: &str) -> Option<PeriodicReading> {
        self.0.state().readings.get(command).cloned()
    }
}

/// Issuer's view of one command
#[derive(Debug, Clone)]
pub struct CommandHandle {
    entry: Arc<CommandEntry>,
    shared: Arc<QueueShared>,
}

impl CommandHandle {
    /// Queue-assigned identifier
    pub fn id(&self) -> u64 {
        self.entry.id
    }

    /// Current status
    pub fn status(&self) -> CommandStatus {
        self.entry.status()
    }

    /// Wait for completion, at most `timeout`
    pub async fn wait(&self, timeout: Duration) -> Result<CommandStatus, DeviceError> {
        let mut receiver = self.entry.status.subscribe();
        with_timeout(timeout, async move {
            loop {
                let status = receiver.borrow_and_update().clone();
                if status.is_complete() {
                    return Ok(status);
                }
                if receiver.changed().await.is_err() {
                    return Err(DeviceError::transport("command queue dropped"));
                }
            }
        })
        .await
    }

    /// Cancel the command if it has not been dispatched yet
    pub fn cancel(&self) -> bool {
        let mut state = self.shared.state();
        let Some(index) = state.pending.iter().position(|e| Arc::ptr_eq(e, &self.entry)) else {
            return false;
        };
        if let Some(entry) = state.pending.remove(index) {
            entry.set_status(CommandStatus::Cancelled);
            state.retained.push_back((Instant::now(), entry));
        }
        debug!(queue = %self.shared.name, id = self.entry.id, "Cancelled");
        true
    }
}

enum Work {
    Queued(Arc<CommandEntry>),
    Periodic(usize),
}

struct Exchange {
    work: Work,
    request: CommandRequest,
    timeout: Duration,
}

type ExchangeTask = JoinHandle<(Box<dyn Transport>, Result<CommandReply, DeviceError>)>;
type ConnectTask = JoinHandle<(Box<dyn Transport>, Result<(), DeviceError>)>;

enum CooperativeState {
    Idle,
    Connecting(ConnectTask),
    Exchanging(Exchange, ExchangeTask),
    Backoff(Instant),
}

/// Dispatch side of a queue; owns the transport
pub struct DeviceCommandQueue {
    shared: Arc<QueueShared>,
    transport: Option<Box<dyn Transport>>,
    timeouts: CommandTimeouts,
    policy: ReconnectPolicy,
    reconnect_delay: Duration,
    retention: Duration,
    periodic: Vec<PeriodicCommand>,
    cooperative: CooperativeState,
}

impl fmt::Debug for DeviceCommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCommandQueue")
            .field("name", &self.shared.name)
            .field("transport", &self.transport)
            .field("timeouts", &self.timeouts)
            .field("policy", &self.policy)
            .finish()
    }
}

impl DeviceCommandQueue {
    /// Create a queue over `transport`
    pub fn new<S: Into<String>>(name: S, transport: Box<dyn Transport>, config: &QueueConfig) -> Self {
        let shared = Arc::new(QueueShared {
            name: name.into(),
            capacity: config.capacity,
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                in_flight: None,
                retained: VecDeque::new(),
                link: LinkState::Connecting,
                readings: BTreeMap::new(),
            }),
            notify: Notify::new(),
            next_id: AtomicU64::new(1),
        });
        Self {
            shared,
            transport: Some(transport),
            timeouts: CommandTimeouts::from(config),
            policy: config.reconnect_policy,
            reconnect_delay: config.reconnect_delay(),
            retention: config.retention(),
            periodic: Vec::new(),
            cooperative: CooperativeState::Idle,
        }
    }

    /// Add periodic status queries
    pub fn with_periodic(mut self, periodic: Vec<PeriodicCommand>) -> Self {
        self.periodic = periodic;
        self
    }

    /// A producer handle
    pub fn sender(&self) -> QueueSender {
        QueueSender(self.shared.clone())
    }

    /// Append a command
    pub fn enqueue(&self, command: Command) -> Result<CommandHandle, DeviceError> {
        self.sender().enqueue(command)
    }

    fn link_up(&self) {
        self.shared.state().link = LinkState::Connected;
        info!(queue = %self.shared.name, "Transport connected");
    }

    fn link_down(&self, reason: &DeviceError) {
        let drained = {
            let mut state = self.shared.state();
            state.link = LinkState::Reconnecting;
            match self.policy {
                ReconnectPolicy::Drain => state.pending.drain(..).collect::<Vec<_>>(),
                ReconnectPolicy::Preserve => Vec::new(),
            }
        };
        let now = Instant::now();
        for entry in &drained {
            entry.set_status(CommandStatus::Failed(DeviceError::NotConnected));
        }
        self.retain(drained, now);
        warn!(queue = %self.shared.name, policy = ?self.policy, "Transport lost: {}", reason);
    }

    /// The transport is gone for good: refuse new work and fail what is queued
    fn abandon(&self, reason: &DeviceError) {
        let drained = {
            let mut state = self.shared.state();
            state.link = LinkState::Reconnecting;
            state.pending.drain(..).collect::<Vec<_>>()
        };
        for entry in &drained {
            entry.set_status(CommandStatus::Failed(reason.clone()));
        }
        self.retain(drained, Instant::now());
        error!(queue = %self.shared.name, "Transport lost for good: {}", reason);
    }

    fn retain(&self, entries: Vec<Arc<CommandEntry>>, now: Instant) {
        if entries.is_empty() {
            return;
        }
        let mut state = self.shared.state();
        state.retained.extend(entries.into_iter().map(|entry| (now, entry)));
    }

    fn prune(&self, now: Instant) {
        let retention = self.retention;
        let mut state = self.shared.state();
        while let Some((completed, _)) = state.retained.front() {
            if now.saturating_duration_since(*completed) < retention {
                break;
            }
            state.retained.pop_front();
        }
    }

    /// Take the next piece of work: queued commands first, then due periodic queries
    fn next_exchange(&mut self, now: Instant) -> Option<Exchange> {
        {
            let mut state = self.shared.state();
            if let Some(entry) = state.pending.pop_front() {
                entry.set_status(CommandStatus::InFlight);
                state.in_flight = Some(entry.clone());
                let timeout = entry
                    .command
                    .timeout
                    .unwrap_or_else(|| self.timeouts.for_class(entry.command.class));
                debug!(
                    queue = %self.shared.name,
                    id = entry.id,
                    command = %entry.command.request.name,
                    waited = ?now.saturating_duration_since(entry.enqueued_at),
                    "Dispatching"
                );
                return Some(Exchange {
                    request: entry.command.request.clone(),
                    work: Work::Queued(entry),
                    timeout,
                });
            }
        }

        let index = self.periodic.iter().position(|p| p.is_due(now))?;
        let periodic = &mut self.periodic[index];
        periodic.next_due = Some(now + periodic.interval);
        Some(Exchange {
            request: periodic.request.clone(),
            work: Work::Periodic(index),
            timeout: self.timeouts.query,
        })
    }

    /// Record the outcome; returns true when the link was lost
    fn finish(&mut self, exchange: Exchange, result: Result<CommandReply, DeviceError>, now: Instant) -> bool {
        let link_lost = matches!(
            &result,
            Err(DeviceError::Transport(_)) | Err(DeviceError::NotConnected)
        );

        match exchange.work {
            Work::Queued(entry) => {
                let status = match result {
                    Ok(reply) => CommandStatus::Succeeded(reply.value),
                    Err(DeviceError::Timeout(_)) => CommandStatus::TimedOut,
                    Err(e) => CommandStatus::Failed(e),
                };
                debug!(queue = %self.shared.name, id = entry.id, ?status, "Completed");
                entry.set_status(status);
                self.shared.state().in_flight = None;
                self.retain(vec![entry], now);
            }
            Work::Periodic(_) => match result {
                Ok(reply) => {
                    let reading = PeriodicReading {
                        value: reply.value,
                        at: Utc::now(),
                    };
                    self.shared.state().readings.insert(exchange.request.name, reading);
                }
                Err(e) => warn!(queue = %self.shared.name, command = %exchange.request.name, "Periodic query failed: {}", e),
            },
        }
        link_lost
    }

    fn next_wake(&self, now: Instant) -> Instant {
        self.periodic
            .iter()
            .filter_map(|p| p.next_due)
            .min()
            .unwrap_or(now + self.retention)
    }

    /// Dispatch until shutdown
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        let Some(mut transport) = self.transport.take() else {
            error!(queue = %self.shared.name, "Command queue has no transport");
            return;
        };
        info!(queue = %self.shared.name, transport = transport.name(), "Command queue started");

        loop {
            if shutdown.is_triggered() {
                break;
            }

            if !transport.is_connected() {
                match reconnect(&mut *transport).await {
                    Ok(()) => self.link_up(),
                    Err(e) => {
                        self.link_down(&e);
                        tokio::select! {
                            _ = shutdown.wait() => break,
                            _ = time::sleep(self.reconnect_delay) => {}
                        }
                        continue;
                    }
                }
            }

            let now = Instant::now();
            self.prune(now);
            match self.next_exchange(now) {
                Some(exchange) => {
                    let result = tokio::select! {
                        _ = shutdown.wait() => Err(DeviceError::Cancelled),
                        result = bounded_exchange(&mut *transport, &exchange.request, exchange.timeout) => result,
                    };
                    let cancelled = result == Err(DeviceError::Cancelled);
                    if self.finish(exchange, result, Instant::now()) {
                        let _ = transport.disconnect().await;
                        self.link_down(&DeviceError::NotConnected);
                    }
                    if cancelled {
                        break;
                    }
                }
                None => {
                    let wake = self.next_wake(now);
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        _ = self.shared.notify.notified() => {}
                        _ = time::sleep_until(wake) => {}
                    }
                }
            }
        }

        self.cancel_pending();
        if let Err(e) = transport.disconnect().await {
            debug!(queue = %self.shared.name, "Disconnect on shutdown failed: {}", e);
        }
        info!(queue = %self.shared.name, "Command queue stopped");
    }

    fn cancel_pending(&self) {
        let drained: Vec<_> = self.shared.state().pending.drain(..).collect();
        for entry in &drained {
            entry.set_status(CommandStatus::Cancelled);
        }
        self.retain(drained, Instant::now());
    }

    fn start_connect(&mut self, mut transport: Box<dyn Transport>) {
        let task = tokio::spawn(async move {
            let result = reconnect(&mut *transport).await;
            (transport, result)
        });
        self.cooperative = CooperativeState::Connecting(task);
    }
}

/// Run one transport call; a panic inside it counts as a broken link
async fn guarded<T>(call: impl Future<Output = Result<T, DeviceError>>) -> Result<T, DeviceError> {
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(DeviceError::transport("transport panicked")),
    }
}

/// Disconnect quietly, then connect
async fn reconnect(transport: &mut dyn Transport) -> Result<(), DeviceError> {
    if transport.is_connected() {
        let _ = guarded(transport.disconnect()).await;
    }
    guarded(transport.connect()).await
}

/// One exchange bounded by `timeout`; a timed-out link is resynchronized
async fn bounded_exchange(
    transport: &mut dyn Transport,
    request: &CommandRequest,
    timeout: Duration,
) -> Result<CommandReply, DeviceError> {
    let result = with_timeout(timeout, guarded(transport.exchange(request))).await;
    if let Err(DeviceError::Timeout(_)) = &result {
        if let Err(e) = transport.resync().await {
            warn!(transport = transport.name(), "Resync after timeout failed: {}", e);
        }
    }
    result
}

impl CooperativeTask for DeviceCommandQueue {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn poll_step(&mut self, now: Instant) {
        match std::mem::replace(&mut self.cooperative, CooperativeState::Idle) {
            CooperativeState::Connecting(task) if task.is_finished() => match task.now_or_never() {
                Some(Ok((transport, Ok(())))) => {
                    self.transport = Some(transport);
                    self.link_up();
                }
                Some(Ok((transport, Err(e)))) => {
                    self.transport = Some(transport);
                    self.link_down(&e);
                    self.cooperative = CooperativeState::Backoff(now + self.reconnect_delay);
                    return;
                }
                _ => {
                    self.abandon(&DeviceError::transport("connect task failed"));
                    return;
                }
            },
            CooperativeState::Exchanging(exchange, task) if task.is_finished() => match task.now_or_never() {
                Some(Ok((transport, result))) => {
                    let link_lost = self.finish(exchange, result, now);
                    if link_lost {
                        self.link_down(&DeviceError::NotConnected);
                        self.start_connect(transport);
                        return;
                    }
                    self.transport = Some(transport);
                }
                _ => {
                    let reason = DeviceError::transport("exchange task failed");
                    self.finish(exchange, Err(reason.clone()), now);
                    self.abandon(&reason);
                    return;
                }
            },
            CooperativeState::Backoff(until) if now < until => {
                self.cooperative = CooperativeState::Backoff(until);
                return;
            }
            state @ (CooperativeState::Connecting(_) | CooperativeState::Exchanging(..)) => {
                self.cooperative = state;
                return;
            }
            CooperativeState::Backoff(_) | CooperativeState::Idle => {}
        }

        let Some(transport) = self.transport.take() else {
            return;
        };
        if !transport.is_connected() {
            self.start_connect(transport);
            return;
        }

        self.prune(now);
        match self.next_exchange(now) {
            Some(exchange) => {
                let request = exchange.request.clone();
                let timeout = exchange.timeout;
                let mut transport = transport;
                let task = tokio::spawn(async move {
                    let result = bounded_exchange(&mut *transport, &request, timeout).await;
                    (transport, result)
                });
                self.cooperative = CooperativeState::Exchanging(exchange, task);
            }
            None => self.transport = Some(transport),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use starflow_core::runtime::ServiceHandle;

    #[derive(Debug, Clone, PartialEq)]
    enum Reply {
        Value(Value),
        Hang,
        LinkDown,
        DeviceError(i32),
        Panic,
    }

    #[derive(Debug, Default)]
    struct Script {
        replies: VecDeque<Reply>,
        sent: Vec<String>,
        in_flight: usize,
        max_in_flight: usize,
        connects: usize,
        fail_connects: usize,
        resyncs: usize,
    }

    #[derive(Debug, Clone, Default)]
    struct FakeTransport {
        script: Arc<Mutex<Script>>,
        connected: bool,
    }

    impl FakeTransport {
        fn with_replies(replies: Vec<Reply>) -> Self {
            let fake = Self::default();
            fake.script.lock().unwrap().replies = replies.into();
            fake
        }

        fn script(&self) -> MutexGuard<'_, Script> {
            self.script.lock().unwrap()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn name(&self) -> &str {
            "fake"
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn connect(&mut self) -> starflow_devices::Result<()> {
            let mut script = self.script();
            script.connects += 1;
            if script.fail_connects > 0 {
                script.fail_connects -= 1;
                return Err(DeviceError::transport("connection refused"));
            }
            drop(script);
            self.connected = true;
            Ok(())
        }

        async fn disconnect(&mut self) -> starflow_devices::Result<()> {
            self.connected = false;
            Ok(())
        }

        async fn exchange(&mut self, request: &CommandRequest) -> starflow_devices::Result<CommandReply> {
            let reply = {
                let mut script = self.script();
                script.sent.push(request.name.clone());
                script.in_flight += 1;
                script.max_in_flight = script.max_in_flight.max(script.in_flight);
                script.replies.pop_front().unwrap_or(Reply::Value(Value::Null))
            };
            let result = match reply {
                Reply::Value(value) => {
                    time::sleep(Duration::from_millis(10)).await;
                    Ok(CommandReply { value })
                }
                Reply::Hang => std::future::pending().await,
                Reply::LinkDown => {
                    self.connected = false;
                    Err(DeviceError::transport("connection reset"))
                }
                Reply::DeviceError(code) => Err(DeviceError::device(code, "refused")),
                Reply::Panic => panic!("driver fault"),
            };
            self.script().in_flight -= 1;
            result
        }

        async fn resync(&mut self) -> starflow_devices::Result<()> {
            let mut script = self.script();
            script.resyncs += 1;
            script.in_flight = 0;
            Ok(())
        }
    }

    fn config() -> QueueConfig {
        QueueConfig {
            capacity: 4,
            ..QueueConfig::default()
        }
    }

    fn start(fake: &FakeTransport, config: &QueueConfig) -> (QueueSender, ServiceHandle) {
        let queue = DeviceCommandQueue::new("focuser", Box::new(fake.clone()), config);
        let sender = queue.sender();
        let service = ServiceHandle::spawn("queue", |shutdown| queue.run(shutdown));
        (sender, service)
    }

    #[test]
    fn test_command_classes() {
        assert_eq!(CommandClass::for_command("abortslew"), CommandClass::Stop);
        assert_eq!(CommandClass::for_command(":Q#"), CommandClass::Stop);
        assert_eq!(CommandClass::for_command("slewtocoordinatesasync"), CommandClass::Slew);
        assert_eq!(CommandClass::for_command("findhome"), CommandClass::Slew);
        assert_eq!(CommandClass::for_command("move"), CommandClass::Motion);
        assert_eq!(CommandClass::for_command("openshutter"), CommandClass::Motion);
        assert_eq!(CommandClass::for_command(":GR#"), CommandClass::Query);
        assert_eq!(CommandClass::for_command("tracking"), CommandClass::Query);

        let timeouts = CommandTimeouts::from(&QueueConfig::default());
        assert_eq!(timeouts.for_class(CommandClass::Stop), Duration::from_secs(2));
        assert_eq!(timeouts.for_class(CommandClass::Slew), Duration::from_secs(120));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_dispatch_order_and_single_flight() {
        let fake = FakeTransport::default();
        let (sender, service) = start(&fake, &config());

        let names = ["move", "halt", "tempcomp", "position"];
        let handles: Vec<_> = names
            .iter()
            .map(|name| sender.enqueue(Command::named(*name)).unwrap())
            .collect();
        for handle in &handles {
            let status = handle.wait(Duration::from_secs(5)).await.unwrap();
            assert_eq!(status, CommandStatus::Succeeded(Value::Null));
        }

        let script = fake.script();
        assert_eq!(script.sent, names);
        assert_eq!(script.max_in_flight, 1);
        drop(script);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reply_times_out_exactly_and_queue_proceeds() {
        let fake = FakeTransport::with_replies(vec![Reply::Hang, Reply::Value(Value::from(42))]);
        let (sender, service) = start(&fake, &config());

        let started = Instant::now();
        let silent = sender.enqueue(Command::named("position")).unwrap();
        let next = sender.enqueue(Command::named("temperature")).unwrap();

        let status = silent.wait(Duration::from_secs(10)).await.unwrap();
        assert_eq!(status, CommandStatus::TimedOut);
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(fake.script().resyncs, 1);

        let status = next.wait(Duration::from_secs(10)).await.unwrap();
        assert_eq!(status, CommandStatus::Succeeded(Value::Integer(42)));
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_command_timeout_override() {
        let fake = FakeTransport::with_replies(vec![Reply::Hang]);
        let (sender, service) = start(&fake, &config());

        let started = Instant::now();
        let handle = sender
            .enqueue(Command::named("slewtoazimuth").with_timeout(Duration::from_millis(750)))
            .unwrap();
        assert_eq!(handle.wait(Duration::from_secs(200)).await.unwrap(), CommandStatus::TimedOut);
        assert_eq!(started.elapsed(), Duration::from_millis(750));
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_error_surfaces_without_retry() {
        let fake = FakeTransport::with_replies(vec![Reply::DeviceError(0x40B)]);
        let (sender, service) = start(&fake, &config());

        let handle = sender.enqueue(Command::named("openshutter")).unwrap();
        match handle.wait(Duration::from_secs(20)).await.unwrap() {
            CommandStatus::Failed(e) => assert_eq!(e.code(), Some(0x40B)),
            other => panic!("unexpected status {:?}", other),
        }
        assert_eq!(fake.script().sent.len(), 1);
        assert_eq!(sender.link_state(), LinkState::Connected);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_full() {
        let fake = FakeTransport::default();
        let queue = DeviceCommandQueue::new("dome", Box::new(fake), &config());
        for _ in 0..4 {
            queue.enqueue(Command::named("azimuth")).unwrap();
        }
        assert_eq!(
            queue.enqueue(Command::named("azimuth")).unwrap_err(),
            DeviceError::QueueFull { capacity: 4 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_only_while_pending() {
        let fake = FakeTransport::with_replies(vec![Reply::Hang]);
        let (sender, service) = start(&fake, &config());

        let first = sender.enqueue(Command::named("move")).unwrap();
        let second = sender.enqueue(Command::named("halt")).unwrap();
        time::sleep(Duration::from_millis(1)).await;

        assert_eq!(first.status(), CommandStatus::InFlight);
        assert!(!first.cancel());
        assert!(second.cancel());
        assert_eq!(second.status(), CommandStatus::Cancelled);
        assert_eq!(sender.status_of(second.id()), Some(CommandStatus::Cancelled));

        assert_eq!(first.wait(Duration::from_secs(20)).await.unwrap(), CommandStatus::TimedOut);
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fake.script().sent, vec!["move"]);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_drains_and_reconnects() {
        let fake = FakeTransport::with_replies(vec![Reply::LinkDown]);
        let (sender, service) = start(&fake, &config());

        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(sender.link_state(), LinkState::Connected);
        fake.script().fail_connects = 2;

        let broken = sender.enqueue(Command::named("move")).unwrap();
        let queued = sender.enqueue(Command::named("position")).unwrap();
        assert!(matches!(
            broken.wait(Duration::from_secs(1)).await.unwrap(),
            CommandStatus::Failed(DeviceError::Transport(_))
        ));
        assert_eq!(
            queued.wait(Duration::from_secs(1)).await.unwrap(),
            CommandStatus::Failed(DeviceError::NotConnected)
        );
        assert!(matches!(
            sender.enqueue(Command::named("position")),
            Err(DeviceError::Busy(_))
        ));

        time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(sender.link_state(), LinkState::Connected);
        assert_eq!(fake.script().connects, 4);
        let handle = sender.enqueue(Command::named("position")).unwrap();
        assert!(matches!(
            handle.wait(Duration::from_secs(1)).await.unwrap(),
            CommandStatus::Succeeded(_)
        ));
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_preserve_policy_keeps_queue() {
        let fake = FakeTransport::with_replies(vec![Reply::LinkDown]);
        let config = QueueConfig {
            reconnect_policy: ReconnectPolicy::Preserve,
            ..config()
        };
        let (sender, service) = start(&fake, &config);

        let broken = sender.enqueue(Command::named("move")).unwrap();
        let kept = sender.enqueue(Command::named("position")).unwrap();
        assert!(matches!(
            broken.wait(Duration::from_secs(1)).await.unwrap(),
            CommandStatus::Failed(_)
        ));
        assert_eq!(
            kept.wait(Duration::from_secs(1)).await.unwrap(),
            CommandStatus::Succeeded(Value::Null)
        );
        assert_eq!(fake.script().sent, vec!["move", "position"]);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_prunes_completed() {
        let fake = FakeTransport::default();
        let config = QueueConfig {
            retention_ms: 1000,
            ..config()
        };
        let (sender, service) = start(&fake, &config);

        let handle = sender.enqueue(Command::named("position")).unwrap();
        handle.wait(Duration::from_secs(1)).await.unwrap();
        assert!(sender.status_of(handle.id()).is_some());

        time::sleep(Duration::from_millis(1500)).await;
        sender.enqueue(Command::named("position")).unwrap();
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sender.status_of(handle.id()), None);
        assert!(handle.status().is_complete());
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_queries_run_when_idle() {
        let fake = FakeTransport::with_replies(vec![
            Reply::Value(Value::from("12:34:56")),
            Reply::Value(Value::from("12:35:56")),
        ]);
        let queue = DeviceCommandQueue::new("mount", Box::new(fake.clone()), &config()).with_periodic(vec![
            PeriodicCommand::new(CommandRequest::new(":GR#"), Duration::from_secs(1)),
        ]);
        let sender = queue.sender();
        let service = ServiceHandle::spawn("mount", |shutdown| queue.run(shutdown));

        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sender.periodic_reading(":GR#").unwrap().value, Value::from("12:34:56"));

        time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(sender.periodic_reading(":GR#").unwrap().value, Value::from("12:35:56"));
        assert_eq!(fake.script().sent, vec![":GR#", ":GR#"]);
        assert_eq!(fake.script().max_in_flight, 1);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending() {
        let fake = FakeTransport::with_replies(vec![Reply::Hang]);
        let (sender, service) = start(&fake, &config());
        let first = sender.enqueue(Command::named("move")).unwrap();
        let second = sender.enqueue(Command::named("position")).unwrap();
        time::sleep(Duration::from_millis(1)).await;

        service.shutdown().await;
        assert_eq!(first.status(), CommandStatus::Failed(DeviceError::Cancelled));
        assert_eq!(second.status(), CommandStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooperative_poll_step() {
        let fake = FakeTransport::with_replies(vec![Reply::Value(Value::from(7))]);
        let mut queue = DeviceCommandQueue::new("rotator", Box::new(fake.clone()), &config());
        let handle = queue.enqueue(Command::named("position")).unwrap();

        for _ in 0..10 {
            queue.poll_step(Instant::now());
            time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handle.status(), CommandStatus::Succeeded(Value::Integer(7)));
        assert_eq!(queue.sender().link_state(), LinkState::Connected);
        assert_eq!(fake.script().max_in_flight, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_panic_fails_command_and_reconnects() {
        let fake = FakeTransport::with_replies(vec![Reply::Panic, Reply::Value(Value::from(5))]);
        let (sender, service) = start(&fake, &config());

        let first = sender.enqueue(Command::named("move")).unwrap();
        match first.wait(Duration::from_secs(1)).await.unwrap() {
            CommandStatus::Failed(DeviceError::Transport(_)) => {}
            other => panic!("unexpected status {:?}", other),
        }
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sender.link_state(), LinkState::Connected);

        let second = sender.enqueue(Command::named("position")).unwrap();
        assert_eq!(
            second.wait(Duration::from_secs(1)).await.unwrap(),
            CommandStatus::Succeeded(Value::Integer(5))
        );
        assert_eq!(fake.script().connects, 2);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooperative_poll_step_survives_transport_panic() {
        let fake = FakeTransport::with_replies(vec![Reply::Panic, Reply::Value(Value::from(9))]);
        let mut queue = DeviceCommandQueue::new("rotator", Box::new(fake.clone()), &config());
        let first = queue.enqueue(Command::named("move")).unwrap();

        for _ in 0..10 {
            queue.poll_step(Instant::now());
            time::sleep(Duration::from_millis(5)).await;
        }
        assert!(matches!(first.status(), CommandStatus::Failed(DeviceError::Transport(_))));
        assert_eq!(queue.sender().link_state(), LinkState::Connected);

        let second = queue.enqueue(Command::named("position")).unwrap();
        for _ in 0..10 {
            queue.poll_step(Instant::now());
            time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(second.status(), CommandStatus::Succeeded(Value::Integer(9)));
        assert_eq!(fake.script().connects, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_exchange_task_fails_queued_work() {
        let mut queue = DeviceCommandQueue::new("rotator", Box::new(FakeTransport::default()), &config());
        let in_flight = queue.enqueue(Command::named("move")).unwrap();
        let pending = queue.enqueue(Command::named("position")).unwrap();
        let exchange = queue.next_exchange(Instant::now()).unwrap();

        let task: ExchangeTask = tokio::spawn(std::future::pending());
        task.abort();
        while !task.is_finished() {
            time::sleep(Duration::from_millis(1)).await;
        }
        queue.cooperative = CooperativeState::Exchanging(exchange, task);
        queue.poll_step(Instant::now());

        assert!(matches!(in_flight.status(), CommandStatus::Failed(DeviceError::Transport(_))));
        assert!(matches!(pending.status(), CommandStatus::Failed(DeviceError::Transport(_))));
        assert_eq!(queue.sender().link_state(), LinkState::Reconnecting);
        assert!(matches!(queue.enqueue(Command::named("halt")), Err(DeviceError::Busy(_))));
    }
}
