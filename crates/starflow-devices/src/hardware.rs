/*!
 * Digital I/O for locally driven actuators.
 *
 * Relays are [`DigitalOutput`] lines and limit switches are
 * [`DigitalInput`] lines. The actuator tick loop runs on its own thread, so
 * these traits are synchronous. [`SimulatedIo`] backs tests and dry runs
 * and can optionally move a simulated roof between its limit switches.
 */
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{DeviceError, Result};

/// A numbered I/O line (BCM pin number on a Raspberry Pi)
pub type Line = u8;

/// Relay and other output lines
pub trait DigitalOutput: Send + Debug {
    /// Drive `line` active
    fn assert(&mut self, line: Line) -> Result<()>;

    /// Drive `line` inactive
    fn deassert(&mut self, line: Line) -> Result<()>;
}

/// Limit switch and other input lines
pub trait DigitalInput: Send + Debug {
    /// Whether `line` is active
    fn read(&self, line: Line) -> Result<bool>;
}

/// Both directions on one device
pub trait DigitalIo: DigitalOutput + DigitalInput {}

impl<T: DigitalOutput + DigitalInput> DigitalIo for T {}

/// A roof that travels while its drive line is asserted
#[derive(Debug, Clone)]
struct RoofPlant {
    open_line: Line,
    close_line: Line,
    open_limit: Line,
    close_limit: Line,
    travel: Duration,
    /// 0.0 closed, 1.0 open
    position: f64,
    last_step: Instant,
}

#[derive(Debug, Default)]
struct SimulatedState {
    outputs: HashMap<Line, bool>,
    inputs: HashMap<Line, bool>,
    events: Vec<(Line, bool)>,
    plant: Option<RoofPlant>,
    fail_outputs: bool,
}

impl SimulatedState {
    fn step_plant(&mut self) {
        let outputs = &self.outputs;
        let Some(plant) = self.plant.as_mut() else {
            return;
        };
        let now = Instant::now();
        let elapsed = now.duration_since(plant.last_step).as_secs_f64();
        plant.last_step = now;

        let rate = if plant.travel.is_zero() {
            f64::INFINITY
        } else {
            1.0 / plant.travel.as_secs_f64()
        };
        let opening = outputs.get(&plant.open_line).copied().unwrap_or(false);
        let closing = outputs.get(&plant.close_line).copied().unwrap_or(false);
        if opening && !closing {
            plant.position = (plant.position + elapsed * rate).min(1.0);
        } else if closing && !opening {
            plant.position = (plant.position - elapsed * rate).max(0.0);
        }

        let (open_limit, close_limit, position) = (plant.open_limit, plant.close_limit, plant.position);
        self.inputs.insert(open_limit, position >= 1.0);
        self.inputs.insert(close_limit, position <= 0.0);
    }
}

/// In-memory I/O; clones share the same lines
#[derive(Debug, Clone, Default)]
pub struct SimulatedIo(Arc<Mutex<SimulatedState>>);

impl SimulatedIo {
    /// All lines inactive
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a roof that starts closed and needs `travel` to move end to end
    pub fn with_roof(open_line: Line, close_line: Line, open_limit: Line, close_limit: Line, travel: Duration) -> Self {
        let io = Self::new();
        io.with_state(|state| {
            state.plant = Some(RoofPlant {
                open_line,
                close_line,
                open_limit,
                close_limit,
                travel,
                position: 0.0,
                last_step: Instant::now(),
            });
            state.inputs.insert(close_limit, true);
            state.inputs.insert(open_limit, false);
        });
        io
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SimulatedState) -> T) -> T {
        let mut guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Force an input line
    pub fn set_input(&self, line: Line, active: bool) {
        self.with_state(|state| {
            state.inputs.insert(line, active);
        });
    }

    /// Current state of an output line
    pub fn output(&self, line: Line) -> bool {
        self.with_state(|state| state.outputs.get(&line).copied().unwrap_or(false))
    }

    /// Make every output write fail, as a disconnected relay board would
    pub fn fail_outputs(&self, fail: bool) {
        self.with_state(|state| state.fail_outputs = fail);
    }

    /// Every output write in order, including repeated writes
    pub fn events(&self) -> Vec<(Line, bool)> {
        self.with_state(|state| state.events.clone())
    }

    /// Replay the output log and report whether `a` and `b` were ever active together
    pub fn ever_both_asserted(&self, a: Line, b: Line) -> bool {
        let events = self.events();
        let (mut a_on, mut b_on) = (false, false);
        for (line, active) in events {
            if line == a {
                a_on = active;
            } else if line == b {
                b_on = active;
            }
            if a_on && b_on {
                return true;
            }
        }
        false
    }

    fn write(&mut self, line: Line, active: bool) -> Result<()> {
        self.with_state(|state| {
            if state.fail_outputs {
                return Err(DeviceError::transport(format!("output line {} unavailable", line)));
            }
            state.step_plant();
            state.outputs.insert(line, active);
            state.events.push((line, active));
            Ok(())
        })
    }
}

impl DigitalOutput for SimulatedIo {
    fn assert(&mut self, line: Line) -> Result<()> {
        self.write(line, true)
    }

    fn deassert(&mut self, line: Line) -> Result<()> {
        self.write(line, false)
    }
}

impl DigitalInput for SimulatedIo {
    fn read(&self, line: Line) -> Result<bool> {
        Ok(self.with_state(|state| {
            state.step_plant();
            state.inputs.get(&line).copied().unwrap_or(false)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outputs_and_inputs() {
        let mut io = SimulatedIo::new();
        let observer = io.clone();
        io.assert(3).unwrap();
        assert!(observer.output(3));
        io.deassert(3).unwrap();
        assert!(!observer.output(3));

        observer.set_input(7, true);
        assert!(io.read(7).unwrap());
        assert!(!io.read(8).unwrap());
    }

    #[test]
    fn test_ever_both_asserted_replays_log() {
        let mut io = SimulatedIo::new();
        io.assert(1).unwrap();
        io.deassert(1).unwrap();
        io.assert(2).unwrap();
        assert!(!io.ever_both_asserted(1, 2));

        io.assert(1).unwrap();
        assert!(io.ever_both_asserted(1, 2));
    }

    #[test]
    fn test_failing_outputs() {
        let mut io = SimulatedIo::new();
        io.fail_outputs(true);
        assert!(io.assert(1).is_err());
        assert!(io.events().is_empty());
    }

    #[test]
    fn test_simulated_roof_reaches_open_limit() {
        let mut io = SimulatedIo::with_roof(1, 2, 10, 11, Duration::ZERO);
        assert!(io.read(11).unwrap());
        assert!(!io.read(10).unwrap());

        io.assert(1).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        assert!(io.read(10).unwrap());
        assert!(!io.read(11).unwrap());
    }
}
