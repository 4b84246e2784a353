/*!
 * Actuator state machine for roll-off roofs and clamshell shutters.
 *
 * The machine is driven by a fixed-rate [`ActuatorStateMachine::tick`]. Each
 * tick samples the limit switches, applies queued intents, evaluates
 * completion and timeouts, then re-applies the outputs for the resulting
 * phase. Tick is the only writer of [`ActuatorState`]; everyone else talks
 * to the machine through an [`ActuatorHandle`].
 *
 * Output rules:
 * - the open and close drive lines are never active together; the opposite
 *   line is always released before a drive line is asserted
 * - outputs are rewritten on every tick, so a missed write heals itself
 * - no drive line is active in `Idle`, `Stopped` or `Fault`
 */
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use starflow_core::config::{ActuatorConfig, DomeConfig};
use starflow_core::runtime::ThreadHandle;
use starflow_core::types::Value;
use starflow_devices::error::ASCOM_NOT_IMPLEMENTED;
use starflow_devices::hardware::{DigitalIo, Line};
use starflow_devices::{CommandReply, CommandRequest, DeviceError, Transport};

use crate::scheduler::CooperativeTask;

/// Actuator phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActuatorPhase {
    /// At rest, no motion requested
    Idle,
    /// Driving toward the open limit
    Opening,
    /// Driving toward the closed limit
    Closing,
    /// Halted on request part way
    Stopped,
    /// Timed out or failed; needs `Reset`
    Fault,
}

impl fmt::Display for ActuatorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActuatorPhase::Idle => "idle",
            ActuatorPhase::Opening => "opening",
            ActuatorPhase::Closing => "closing",
            ActuatorPhase::Stopped => "stopped",
            ActuatorPhase::Fault => "fault",
        };
        f.write_str(name)
    }
}

/// A request to the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Intent {
    /// Move to the open limit
    Open,
    /// Move to the closed limit
    Close,
    /// Halt motion
    Stop,
    /// Leave the fault state
    Reset,
}

impl Intent {
    /// Map an Alpaca or console command name to an intent
    pub fn from_command(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "open" | "openshutter" => Some(Intent::Open),
            "close" | "closeshutter" => Some(Intent::Close),
            "stop" | "halt" | "abortslew" => Some(Intent::Stop),
            "reset" => Some(Intent::Reset),
            _ => None,
        }
    }
}

/// Actuator family; each kind refines the shared transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActuatorKind {
    /// Sliding roof; the motor supply relay is energized only while moving
    RollOffRoof {
        /// Motor power relay
        power_line: Option<Line>,
    },
    /// Clamshell; both limits active at once is a sensor fault
    ClamshellShutter,
}

impl ActuatorKind {
    /// Build from a dome configuration entry
    pub fn from_config(config: &DomeConfig) -> Result<Self, DeviceError> {
        match config.kind.to_ascii_lowercase().as_str() {
            "rolloffroof" | "ror" => Ok(ActuatorKind::RollOffRoof {
                power_line: config.power_line,
            }),
            "clamshell" => Ok(ActuatorKind::ClamshellShutter),
            other => Err(DeviceError::configuration(format!(
                "dome {}: unknown actuator kind '{}'",
                config.name, other
            ))),
        }
    }

    fn power_line(&self) -> Option<Line> {
        match self {
            ActuatorKind::RollOffRoof { power_line } => *power_line,
            ActuatorKind::ClamshellShutter => None,
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            ActuatorKind::RollOffRoof { .. } => "ror",
            ActuatorKind::ClamshellShutter => "clamshell",
        }
    }
}

/// I/O line assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorLines {
    /// Open drive relay
    pub open_output: Line,
    /// Close drive relay
    pub close_output: Line,
    /// Open limit switch
    pub open_limit: Line,
    /// Closed limit switch
    pub close_limit: Line,
}

/// Travel timeouts and tick rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActuatorTimings {
    /// Longest allowed time in `Opening`
    pub open_timeout: Duration,
    /// Longest allowed time in `Closing`
    pub close_timeout: Duration,
    /// Tick period
    pub tick_period: Duration,
}

impl ActuatorTimings {
    /// Defaults from `[actuator]`, overridden per dome
    pub fn from_config(defaults: &ActuatorConfig, dome: &DomeConfig) -> Self {
        Self {
            open_timeout: Duration::from_millis(dome.open_timeout_ms.unwrap_or(defaults.open_timeout_ms)),
            close_timeout: Duration::from_millis(dome.close_timeout_ms.unwrap_or(defaults.close_timeout_ms)),
            tick_period: defaults.tick_period(),
        }
    }
}

/// Limit switch bitmask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorSnapshot(u8);

impl SensorSnapshot {
    /// Open limit bit
    pub const OPEN_LIMIT: u8 = 0b01;
    /// Closed limit bit
    pub const CLOSE_LIMIT: u8 = 0b10;

    /// Build from switch readings
    pub fn new(open_limit: bool, close_limit: bool) -> Self {
        let mut bits = 0;
        if open_limit {
            bits |= Self::OPEN_LIMIT;
        }
        if close_limit {
            bits |= Self::CLOSE_LIMIT;
        }
        Self(bits)
    }

    /// Raw bits
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Open limit active
    pub fn open_limit(&self) -> bool {
        self.0 & Self::OPEN_LIMIT != 0
    }

    /// Closed limit active
    pub fn close_limit(&self) -> bool {
        self.0 & Self::CLOSE_LIMIT != 0
    }
}

/// Where the last motion request was headed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// Open limit
    Open,
    /// Closed limit
    Closed,
}

/// State owned by the machine
#[derive(Debug, Clone)]
pub struct ActuatorState {
    /// Current phase
    pub phase: ActuatorPhase,
    /// When the current phase was entered
    pub entered_at: Instant,
    /// Destination of the last motion request
    pub target: Option<Target>,
    /// Limit switches as of the last tick
    pub sensors: SensorSnapshot,
    /// Why the machine faulted
    pub fault: Option<String>,
    /// Wall-clock time of the last completed open or close
    pub last_completed: Option<DateTime<Utc>>,
}

/// Read-only view published after every tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActuatorStatus {
    /// Actuator name
    pub name: String,
    /// Kind tag
    pub kind: String,
    /// Current phase
    pub phase: ActuatorPhase,
    /// Time spent in the current phase
    pub in_phase: Duration,
    /// Open limit active
    pub open_limit: bool,
    /// Closed limit active
    pub close_limit: bool,
    /// Fault reason, kept until `Reset`
    pub fault: Option<String>,
    /// Destination of the last motion request
    pub target: Option<Target>,
    /// Last completed open or close
    pub last_completed: Option<DateTime<Utc>>,
    /// Whether the machine thread is alive
    pub running: bool,
}

impl ActuatorStatus {
    /// ASCOM `ShutterStatus` code: 0 open, 1 closed, 2 opening, 3 closing, 4 error
    ///
    /// A roof resting away from the closed limit reports open.
    pub fn shutter_status(&self) -> i32 {
        match self.phase {
            ActuatorPhase::Fault => 4,
            ActuatorPhase::Opening => 2,
            ActuatorPhase::Closing => 3,
            ActuatorPhase::Idle | ActuatorPhase::Stopped if self.close_limit => 1,
            ActuatorPhase::Idle | ActuatorPhase::Stopped => 0,
        }
    }
}

struct PendingIntent {
    intent: Intent,
    reply: Option<oneshot::Sender<Result<ActuatorPhase, DeviceError>>>,
}

/// Cloneable access to a running machine
#[derive(Debug, Clone)]
pub struct ActuatorHandle {
    intents: Sender<PendingIntent>,
    status: Arc<RwLock<ActuatorStatus>>,
}

impl fmt::Debug for PendingIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingIntent").field("intent", &self.intent).finish()
    }
}

impl ActuatorHandle {
    /// Queue an intent for the next tick without waiting for the verdict
    pub fn submit(&self, intent: Intent) -> Result<(), DeviceError> {
        self.intents
            .send(PendingIntent { intent, reply: None })
            .map_err(|_| DeviceError::transport("actuator machine is gone"))
    }

    /// Queue an intent and wait for the tick that applies it
    ///
    /// Resolves to the phase entered, or the reason the intent was refused.
    pub async fn request(&self, intent: Intent) -> Result<ActuatorPhase, DeviceError> {
        let (reply, verdict) = oneshot::channel();
        self.intents
            .send(PendingIntent {
                intent,
                reply: Some(reply),
            })
            .map_err(|_| DeviceError::transport("actuator machine is gone"))?;
        verdict
            .await
            .map_err(|_| DeviceError::transport("actuator machine stopped before applying intent"))?
    }

    /// Latest published status
    pub fn status(&self) -> ActuatorStatus {
        self.status.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// The actuator state machine
#[derive(Debug)]
pub struct ActuatorStateMachine {
    name: String,
    kind: ActuatorKind,
    lines: ActuatorLines,
    timings: ActuatorTimings,
    io: Box<dyn DigitalIo>,
    state: ActuatorState,
    intents: Receiver<PendingIntent>,
    sender: Sender<PendingIntent>,
    status: Arc<RwLock<ActuatorStatus>>,
    next_tick: Option<Instant>,
}

impl ActuatorStateMachine {
    /// Create an idle machine; no output is touched until the first tick
    pub fn new<S: Into<String>>(
        name: S,
        kind: ActuatorKind,
        lines: ActuatorLines,
        timings: ActuatorTimings,
        io: Box<dyn DigitalIo>,
    ) -> Self {
        let name = name.into();
        let (sender, intents) = mpsc::channel();
        let state = ActuatorState {
            phase: ActuatorPhase::Idle,
            entered_at: Instant::now(),
            target: None,
            sensors: SensorSnapshot::default(),
            fault: None,
            last_completed: None,
        };
        let status = Arc::new(RwLock::new(ActuatorStatus {
            name: name.clone(),
            kind: kind.tag().to_string(),
            phase: ActuatorPhase::Idle,
            in_phase: Duration::ZERO,
            open_limit: false,
            close_limit: false,
            fault: None,
            target: None,
            last_completed: None,
            running: true,
        }));
        Self {
            name,
            kind,
            lines,
            timings,
            io,
            state,
            intents,
            sender,
            status,
            next_tick: None,
        }
    }

    /// Actuator name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state
    pub fn state(&self) -> &ActuatorState {
        &self.state
    }

    /// A handle for submitting intents and reading status
    pub fn handle(&self) -> ActuatorHandle {
        ActuatorHandle {
            intents: self.sender.clone(),
            status: self.status.clone(),
        }
    }

    /// One evaluation of the transition table at time `now`
    pub fn tick(&mut self, now: Instant) {
        match self.read_sensors() {
            Ok(sensors) => self.state.sensors = sensors,
            Err(e) => self.fault(now, format!("limit switch read failed: {}", e)),
        }

        loop {
            match self.intents.try_recv() {
                Ok(pending) => {
                    let verdict = self.apply_intent(pending.intent, now);
                    if let Some(reply) = pending.reply {
                        let _ = reply.send(verdict);
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        self.evaluate(now);

        if let Err(e) = self.apply_outputs() {
            self.fault(now, format!("output write failed: {}", e));
            self.release_outputs();
        }

        self.publish(now, true);
    }

    /// Release every output; used when the loop exits
    pub fn shutdown(&mut self) {
        self.release_outputs();
        self.publish(Instant::now(), false);
        debug!(actuator = %self.name, "Outputs released");
    }

    fn read_sensors(&self) -> Result<SensorSnapshot, DeviceError> {
        let open = self.io.read(self.lines.open_limit)?;
        let close = self.io.read(self.lines.close_limit)?;
        Ok(SensorSnapshot::new(open, close))
    }

    fn enter(&mut self, phase: ActuatorPhase, now: Instant) {
        if self.state.phase != phase {
            info!(actuator = %self.name, from = %self.state.phase, to = %phase, "Transition");
        }
        self.state.phase = phase;
        self.state.entered_at = now;
    }

    fn fault(&mut self, now: Instant, reason: String) {
        if self.state.phase != ActuatorPhase::Fault {
            error!(actuator = %self.name, %reason, "Actuator fault");
            self.state.fault = Some(reason);
            self.enter(ActuatorPhase::Fault, now);
        }
    }

    fn apply_intent(&mut self, intent: Intent, now: Instant) -> Result<ActuatorPhase, DeviceError> {
        let phase = self.state.phase;
        let sensors = self.state.sensors;
        debug!(actuator = %self.name, ?intent, %phase, "Intent");

        let next = match (intent, phase) {
            (Intent::Reset, ActuatorPhase::Fault) => {
                self.state.fault = None;
                ActuatorPhase::Idle
            }
            (Intent::Reset, current) => current,
            (Intent::Stop, ActuatorPhase::Opening | ActuatorPhase::Closing) => ActuatorPhase::Stopped,
            (Intent::Stop, current) => current,
            (Intent::Open | Intent::Close, ActuatorPhase::Fault) => {
                return Err(DeviceError::ActuatorFault(
                    self.state.fault.clone().unwrap_or_else(|| "fault".to_string()),
                ));
            }
            (Intent::Open, ActuatorPhase::Opening) | (Intent::Close, ActuatorPhase::Closing) => phase,
            (Intent::Open, ActuatorPhase::Closing) => {
                return Err(DeviceError::invalid_transition("cannot open while closing"));
            }
            (Intent::Close, ActuatorPhase::Opening) => {
                return Err(DeviceError::invalid_transition("cannot close while opening"));
            }
            (Intent::Open, ActuatorPhase::Idle | ActuatorPhase::Stopped) => {
                self.state.target = Some(Target::Open);
                if sensors.open_limit() {
                    ActuatorPhase::Idle
                } else {
                    ActuatorPhase::Opening
                }
            }
            (Intent::Close, ActuatorPhase::Idle | ActuatorPhase::Stopped) => {
                self.state.target = Some(Target::Closed);
                if sensors.close_limit() {
                    ActuatorPhase::Idle
                } else {
                    ActuatorPhase::Closing
                }
            }
        };

        if next != phase {
            self.enter(next, now);
        }
        Ok(next)
    }

    fn evaluate(&mut self, now: Instant) {
        let sensors = self.state.sensors;

        if self.kind == ActuatorKind::ClamshellShutter && sensors.open_limit() && sensors.close_limit() {
            self.fault(now, "both limit switches active".to_string());
            return;
        }

        let elapsed = now.saturating_duration_since(self.state.entered_at);
        match self.state.phase {
            ActuatorPhase::Opening if sensors.open_limit() => {
                self.state.last_completed = Some(Utc::now());
                self.enter(ActuatorPhase::Idle, now);
            }
            ActuatorPhase::Opening if elapsed >= self.timings.open_timeout => {
                self.fault(now, format!("open limit not reached within {:?}", self.timings.open_timeout));
            }
            ActuatorPhase::Closing if sensors.close_limit() => {
                self.state.last_completed = Some(Utc::now());
                self.enter(ActuatorPhase::Idle, now);
            }
            ActuatorPhase::Closing if elapsed >= self.timings.close_timeout => {
                self.fault(now, format!("close limit not reached within {:?}", self.timings.close_timeout));
            }
            _ => {}
        }
    }

    fn apply_outputs(&mut self) -> Result<(), DeviceError> {
        let lines = self.lines;
        let power = self.kind.power_line();
        match self.state.phase {
            ActuatorPhase::Opening => {
                self.io.deassert(lines.close_output)?;
                if let Some(line) = power {
                    self.io.assert(line)?;
                }
                self.io.assert(lines.open_output)?;
            }
            ActuatorPhase::Closing => {
                self.io.deassert(lines.open_output)?;
                if let Some(line) = power {
                    self.io.assert(line)?;
                }
                self.io.assert(lines.close_output)?;
            }
            ActuatorPhase::Idle | ActuatorPhase::Stopped | ActuatorPhase::Fault => {
                self.io.deassert(lines.open_output)?;
                self.io.deassert(lines.close_output)?;
                if let Some(line) = power {
                    self.io.deassert(line)?;
                }
            }
        }
        Ok(())
    }

    fn release_outputs(&mut self) {
        let mut lines = vec![self.lines.open_output, self.lines.close_output];
        lines.extend(self.kind.power_line());
        for line in lines {
            if let Err(e) = self.io.deassert(line) {
                warn!(actuator = %self.name, line, "Failed to release output: {}", e);
            }
        }
    }

    fn publish(&self, now: Instant, running: bool) {
        let status = ActuatorStatus {
            name: self.name.clone(),
            kind: self.kind.tag().to_string(),
            phase: self.state.phase,
            in_phase: now.saturating_duration_since(self.state.entered_at),
            open_limit: self.state.sensors.open_limit(),
            close_limit: self.state.sensors.close_limit(),
            fault: self.state.fault.clone(),
            target: self.state.target,
            last_completed: self.state.last_completed,
            running,
        };
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
    }
}

impl CooperativeTask for ActuatorStateMachine {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll_step(&mut self, now: Instant) {
        let due = self.next_tick.map_or(true, |next| now >= next);
        if due {
            self.tick(now);
            self.next_tick = Some(now + self.timings.tick_period);
        }
    }
}

/// A machine ticking on its own OS thread
///
/// Dropping the service stops the thread, waits for it, and leaves every
/// output released.
#[derive(Debug)]
pub struct ActuatorService {
    handle: ActuatorHandle,
    thread: ThreadHandle,
}

impl ActuatorService {
    /// Move `machine` onto a dedicated thread ticking every `tick_period`
    pub fn spawn(mut machine: ActuatorStateMachine) -> Result<Self, DeviceError> {
        let handle = machine.handle();
        let period = machine.timings.tick_period;
        let thread = ThreadHandle::spawn(format!("actuator-{}", machine.name), move |stop| {
            let mut next = std::time::Instant::now();
            while !stop.is_stopped() {
                machine.tick(Instant::now());
                next += period;
                let now = std::time::Instant::now();
                if next > now {
                    std::thread::sleep(next - now);
                } else {
                    next = now;
                }
            }
            machine.shutdown();
        })?;
        Ok(Self { handle, thread })
    }

    /// Handle to the running machine
    pub fn handle(&self) -> &ActuatorHandle {
        &self.handle
    }

    /// Stop the thread and wait for it
    pub fn shutdown(self) {
        self.thread.shutdown();
    }
}

/// Command queue transport that feeds intents into a local machine
///
/// Lets a [`DeviceCommandQueue`](crate::command_queue::DeviceCommandQueue)
/// drive a roof the same way it drives a remote dome: `openshutter`,
/// `closeshutter`, `abortslew` and `reset` become intents, and
/// `shutterstatus` reads the published status.
#[derive(Debug)]
pub struct LocalActuatorTransport {
    name: String,
    handle: ActuatorHandle,
    connected: bool,
}

impl LocalActuatorTransport {
    /// Wrap a machine handle
    pub fn new(handle: ActuatorHandle) -> Self {
        let name = format!("local:{}", handle.status().name);
        Self {
            name,
            handle,
            connected: false,
        }
    }
}

#[async_trait]
impl Transport for LocalActuatorTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.connected && self.handle.status().running
    }

    async fn connect(&mut self) -> Result<(), DeviceError> {
        if !self.handle.status().running {
            return Err(DeviceError::transport("actuator machine is not running"));
        }
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), DeviceError> {
        self.connected = false;
        Ok(())
    }

    async fn exchange(&mut self, request: &CommandRequest) -> Result<CommandReply, DeviceError> {
        if !self.connected {
            return Err(DeviceError::NotConnected);
        }
        let name = request.name.to_ascii_lowercase();
        if name == "shutterstatus" {
            return Ok(CommandReply {
                value: Value::from(i64::from(self.handle.status().shutter_status())),
            });
        }
        let intent = Intent::from_command(&name).ok_or_else(|| {
            DeviceError::device(ASCOM_NOT_IMPLEMENTED, format!("{} is not supported by a local actuator", request.name))
        })?;
        let phase = self.handle.request(intent).await?;
        Ok(CommandReply {
            value: Value::from(phase.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use starflow_devices::hardware::SimulatedIo;

    const OPEN: Line = 17;
    const CLOSE: Line = 27;
    const POWER: Line = 22;
    const OPEN_LIMIT: Line = 5;
    const CLOSE_LIMIT: Line = 6;
    const TICK: Duration = Duration::from_millis(100);

    fn lines() -> ActuatorLines {
        ActuatorLines {
            open_output: OPEN,
            close_output: CLOSE,
            open_limit: OPEN_LIMIT,
            close_limit: CLOSE_LIMIT,
        }
    }

    fn timings() -> ActuatorTimings {
        ActuatorTimings {
            open_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(20),
            tick_period: TICK,
        }
    }

    fn roof(io: &SimulatedIo) -> ActuatorStateMachine {
        ActuatorStateMachine::new(
            "roof",
            ActuatorKind::RollOffRoof { power_line: Some(POWER) },
            lines(),
            timings(),
            Box::new(io.clone()),
        )
    }

    fn closed_roof() -> (SimulatedIo, ActuatorStateMachine, Instant) {
        let io = SimulatedIo::new();
        io.set_input(CLOSE_LIMIT, true);
        let mut machine = roof(&io);
        let t0 = Instant::now();
        machine.tick(t0);
        (io, machine, t0)
    }

    #[test]
    fn test_open_until_limit_then_idle() {
        let (io, mut machine, t0) = closed_roof();
        let handle = machine.handle();

        handle.submit(Intent::Open).unwrap();
        machine.tick(t0 + TICK);
        assert_eq!(machine.state().phase, ActuatorPhase::Opening);
        assert!(io.output(OPEN));
        assert!(io.output(POWER));
        assert!(!io.output(CLOSE));
        assert_eq!(handle.status().shutter_status(), 2);

        io.set_input(CLOSE_LIMIT, false);
        io.set_input(OPEN_LIMIT, true);
        machine.tick(t0 + TICK * 2);
        assert_eq!(machine.state().phase, ActuatorPhase::Idle);
        assert!(!io.output(OPEN));
        assert!(!io.output(POWER));
        assert!(machine.state().last_completed.is_some());
        assert_eq!(handle.status().shutter_status(), 0);
    }

    #[test]
    fn test_open_timeout_boundary() {
        let (io, mut machine, t0) = closed_roof();
        machine.handle().submit(Intent::Open).unwrap();
        let start = t0 + TICK;
        machine.tick(start);
        assert_eq!(machine.state().phase, ActuatorPhase::Opening);

        machine.tick(start + Duration::from_secs(30) - TICK);
        assert_eq!(machine.state().phase, ActuatorPhase::Opening);

        machine.tick(start + Duration::from_secs(30));
        assert_eq!(machine.state().phase, ActuatorPhase::Fault);
        assert!(!io.output(OPEN));
        assert!(!io.output(CLOSE));
        assert!(machine.state().fault.is_some());
    }

    #[test]
    fn test_close_uses_its_own_timeout() {
        let io = SimulatedIo::new();
        io.set_input(OPEN_LIMIT, true);
        let mut machine = roof(&io);
        let t0 = Instant::now();
        machine.handle().submit(Intent::Close).unwrap();
        machine.tick(t0);
        assert_eq!(machine.state().phase, ActuatorPhase::Closing);

        machine.tick(t0 + Duration::from_secs(20) - TICK);
        assert_eq!(machine.state().phase, ActuatorPhase::Closing);
        machine.tick(t0 + Duration::from_secs(20));
        assert_eq!(machine.state().phase, ActuatorPhase::Fault);
    }

    #[test]
    fn test_fault_is_sticky_until_reset() {
        let (io, mut machine, t0) = closed_roof();
        let handle = machine.handle();
        handle.submit(Intent::Open).unwrap();
        machine.tick(t0);
        machine.tick(t0 + Duration::from_secs(31));
        assert_eq!(machine.state().phase, ActuatorPhase::Fault);

        handle.submit(Intent::Close).unwrap();
        machine.tick(t0 + Duration::from_secs(32));
        assert_eq!(machine.state().phase, ActuatorPhase::Fault);
        assert!(!io.output(CLOSE));
        assert_eq!(handle.status().shutter_status(), 4);

        handle.submit(Intent::Reset).unwrap();
        machine.tick(t0 + Duration::from_secs(33));
        assert_eq!(machine.state().phase, ActuatorPhase::Idle);
        assert!(machine.state().fault.is_none());
    }

    #[test]
    fn test_stop_and_resume() {
        let (io, mut machine, t0) = closed_roof();
        let handle = machine.handle();
        handle.submit(Intent::Open).unwrap();
        machine.tick(t0 + TICK);
        io.set_input(CLOSE_LIMIT, false);

        handle.submit(Intent::Stop).unwrap();
        machine.tick(t0 + TICK * 2);
        assert_eq!(machine.state().phase, ActuatorPhase::Stopped);
        assert!(!io.output(OPEN));

        handle.submit(Intent::Close).unwrap();
        machine.tick(t0 + TICK * 3);
        assert_eq!(machine.state().phase, ActuatorPhase::Closing);
        assert!(io.output(CLOSE));
        assert!(!io.ever_both_asserted(OPEN, CLOSE));
    }

    #[test]
    fn test_timer_resets_on_phase_entry() {
        let (io, mut machine, t0) = closed_roof();
        let handle = machine.handle();
        handle.submit(Intent::Open).unwrap();
        machine.tick(t0);
        io.set_input(CLOSE_LIMIT, false);

        handle.submit(Intent::Stop).unwrap();
        machine.tick(t0 + Duration::from_secs(25));
        handle.submit(Intent::Open).unwrap();
        let resumed = t0 + Duration::from_secs(26);
        machine.tick(resumed);

        machine.tick(resumed + Duration::from_secs(29));
        assert_eq!(machine.state().phase, ActuatorPhase::Opening);
    }

    #[test]
    fn test_reversal_while_moving_is_refused() {
        let (_io, mut machine, t0) = closed_roof();
        machine.handle().submit(Intent::Open).unwrap();
        machine.tick(t0);

        let verdict = machine.apply_intent(Intent::Close, t0);
        assert!(matches!(verdict, Err(DeviceError::InvalidTransition(_))));
        assert_eq!(machine.state().phase, ActuatorPhase::Opening);

        assert_eq!(machine.apply_intent(Intent::Open, t0).unwrap(), ActuatorPhase::Opening);
    }

    #[test]
    fn test_open_at_open_limit_does_not_pulse_relay() {
        let io = SimulatedIo::new();
        io.set_input(OPEN_LIMIT, true);
        let mut machine = roof(&io);
        machine.handle().submit(Intent::Open).unwrap();
        machine.tick(Instant::now());
        assert_eq!(machine.state().phase, ActuatorPhase::Idle);
        assert!(!io.events().contains(&(OPEN, true)));
    }

    #[test]
    fn test_tick_is_idempotent() {
        let (io, mut machine, t0) = closed_roof();
        machine.handle().submit(Intent::Open).unwrap();
        machine.tick(t0 + TICK);
        let state = machine.state().phase;
        let writes = io.events().len();

        machine.tick(t0 + TICK);
        assert_eq!(machine.state().phase, state);
        assert!(io.output(OPEN));
        let rewrites: Vec<_> = io.events()[writes..].to_vec();
        assert_eq!(rewrites, vec![(CLOSE, false), (POWER, true), (OPEN, true)]);
    }

    #[test]
    fn test_never_both_outputs_across_random_intents() {
        let io = SimulatedIo::new();
        io.set_input(CLOSE_LIMIT, true);
        let mut machine = roof(&io);
        let handle = machine.handle();
        let t0 = Instant::now();
        let script = [
            Intent::Open,
            Intent::Close,
            Intent::Stop,
            Intent::Close,
            Intent::Open,
            Intent::Stop,
            Intent::Open,
            Intent::Reset,
            Intent::Close,
        ];
        for (i, intent) in script.iter().enumerate() {
            handle.submit(*intent).unwrap();
            machine.tick(t0 + TICK * i as u32);
            if i == 2 {
                io.set_input(CLOSE_LIMIT, false);
            }
        }
        assert!(!io.ever_both_asserted(OPEN, CLOSE));
    }

    #[test]
    fn test_output_failure_faults() {
        let (io, mut machine, t0) = closed_roof();
        io.fail_outputs(true);
        machine.handle().submit(Intent::Open).unwrap();
        machine.tick(t0 + TICK);
        assert_eq!(machine.state().phase, ActuatorPhase::Fault);
    }

    #[test]
    fn test_clamshell_both_limits_is_fault() {
        let io = SimulatedIo::new();
        io.set_input(OPEN_LIMIT, true);
        io.set_input(CLOSE_LIMIT, true);
        let mut machine = ActuatorStateMachine::new(
            "shutter",
            ActuatorKind::ClamshellShutter,
            lines(),
            timings(),
            Box::new(io.clone()),
        );
        machine.tick(Instant::now());
        assert_eq!(machine.state().phase, ActuatorPhase::Fault);
    }

    #[tokio::test]
    async fn test_request_resolves_on_tick() {
        let (_io, mut machine, t0) = closed_roof();
        let handle = machine.handle();
        let pending = tokio::spawn(async move { handle.request(Intent::Open).await });
        tokio::task::yield_now().await;

        machine.tick(t0 + TICK);
        assert_eq!(pending.await.unwrap().unwrap(), ActuatorPhase::Opening);
    }

    #[test]
    fn test_cooperative_poll_respects_tick_period() {
        let (io, mut machine, t0) = closed_roof();
        machine.poll_step(t0);
        let writes = io.events().len();
        machine.poll_step(t0 + TICK / 2);
        assert_eq!(io.events().len(), writes);
        machine.poll_step(t0 + TICK);
        assert!(io.events().len() > writes);
    }

    #[test]
    fn test_service_drop_releases_outputs() {
        let io = SimulatedIo::new();
        io.set_input(CLOSE_LIMIT, true);
        let service = ActuatorService::spawn(roof(&io)).unwrap();
        service.handle().submit(Intent::Open).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while service.handle().status().phase != ActuatorPhase::Opening {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(io.output(OPEN));

        let handle = service.handle().clone();
        drop(service);
        assert!(!io.output(OPEN));
        assert!(!io.output(POWER));
        assert!(!handle.status().running);
        assert!(handle.submit(Intent::Close).is_err());
    }

    #[tokio::test]
    async fn test_local_transport_feeds_intents() {
        let io = SimulatedIo::new();
        io.set_input(CLOSE_LIMIT, true);
        let service = ActuatorService::spawn(roof(&io)).unwrap();
        let mut transport = LocalActuatorTransport::new(service.handle().clone());

        let request = CommandRequest::new("openshutter");
        assert_eq!(transport.exchange(&request).await, Err(DeviceError::NotConnected));
        transport.connect().await.unwrap();

        let reply = transport.exchange(&request).await.unwrap();
        assert_eq!(reply.value, Value::from("opening"));
        let reply = transport.exchange(&CommandRequest::new("shutterstatus")).await.unwrap();
        assert_eq!(reply.value, Value::Integer(2));

        let err = transport.exchange(&CommandRequest::new("closeshutter")).await.unwrap_err();
        assert!(matches!(err, DeviceError::InvalidTransition(_)));
        let err = transport.exchange(&CommandRequest::new("slewtoazimuth")).await.unwrap_err();
        assert!(err.is_not_implemented());

        service.shutdown();
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_intent_from_command() {
        assert_eq!(Intent::from_command("OpenShutter"), Some(Intent::Open));
        assert_eq!(Intent::from_command("abortslew"), Some(Intent::Stop));
        assert_eq!(Intent::from_command("slewtoazimuth"), None);
    }
}
