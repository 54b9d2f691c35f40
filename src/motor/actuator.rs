// Actuator capability: the only two operations the motion controller needs
// from a motor driver, plus a release hook run when the owner shuts down.

use std::sync::{Arc, Mutex};

use tracing::debug;

use super::feetech::FeetechError;

/// One side of the differential-drive base
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wheel {
    Left,
    Right,
}

/// Commanded rotation direction of a wheel motor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Errors raised by actuator implementations
#[derive(Debug, thiserror::Error)]
pub enum ActuatorError {
    #[error("Motor bus error: {0}")]
    Bus(#[from] FeetechError),

    #[error("Actuator unavailable: {0}")]
    Unavailable(String),
}

/// Per-wheel motor control
///
/// Implementations must accept a direction change only at zero magnitude;
/// the motion controller guarantees it zeroes the magnitude first.
pub trait Actuator {
    fn set_direction(&mut self, wheel: Wheel, direction: Direction) -> Result<(), ActuatorError>;

    fn set_magnitude(&mut self, wheel: Wheel, magnitude: u8) -> Result<(), ActuatorError>;

    /// Let the motors go (coast, torque off). Called once when the owner exits.
    fn release(&mut self) -> Result<(), ActuatorError> {
        Ok(())
    }
}

/// A single write observed by a [`SimActuator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorEvent {
    Direction(Wheel, Direction),
    Magnitude(Wheel, u8),
    Released,
}

/// Shared, cloneable view of the events a [`SimActuator`] has recorded
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<ActuatorEvent>>>,
}

impl EventLog {
    fn push(&self, event: ActuatorEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    /// Copy of everything recorded so far
    pub fn snapshot(&self) -> Vec<ActuatorEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    /// Number of direction commands issued to one wheel
    pub fn direction_changes(&self, wheel: Wheel) -> usize {
        self.snapshot()
            .iter()
            .filter(|e| matches!(e, ActuatorEvent::Direction(w, _) if *w == wheel))
            .count()
    }

    /// Signed speed pairs reconstructed from the event stream
    ///
    /// A pair is a left magnitude write immediately followed by a right one;
    /// the zeroing writes ahead of a direction change never form a pair.
    pub fn speed_pairs(&self) -> Vec<(i16, i16)> {
        let mut pairs = Vec::new();
        let mut direction = [Direction::Forward, Direction::Forward];
        let mut pending_left: Option<i16> = None;

        for event in self.snapshot() {
            match event {
                ActuatorEvent::Magnitude(Wheel::Left, m) => {
                    pending_left = Some(signed(m, direction[Wheel::Left as usize]));
                    continue;
                }
                ActuatorEvent::Magnitude(Wheel::Right, m) => {
                    if let Some(left) = pending_left {
                        pairs.push((left, signed(m, direction[Wheel::Right as usize])));
                    }
                }
                ActuatorEvent::Direction(wheel, dir) => direction[wheel as usize] = dir,
                ActuatorEvent::Released => {}
            }
            pending_left = None;
        }
        pairs
    }
}

fn signed(magnitude: u8, direction: Direction) -> i16 {
    match direction {
        Direction::Forward => magnitude as i16,
        Direction::Backward => -(magnitude as i16),
    }
}

/// In-memory actuator for simulation runs and tests
///
/// Every write is logged at debug level and appended to an [`EventLog`].
#[derive(Debug, Default)]
pub struct SimActuator {
    log: EventLog,
}

impl SimActuator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to the recorded events; stays valid after the actuator moves
    pub fn log(&self) -> EventLog {
        self.log.clone()
    }
}

impl Actuator for SimActuator {
    fn set_direction(&mut self, wheel: Wheel, direction: Direction) -> Result<(), ActuatorError> {
        debug!("sim: {:?} wheel direction {:?}", wheel, direction);
        self.log.push(ActuatorEvent::Direction(wheel, direction));
        Ok(())
    }

    fn set_magnitude(&mut self, wheel: Wheel, magnitude: u8) -> Result<(), ActuatorError> {
        debug!("sim: {:?} wheel magnitude {}", wheel, magnitude);
        self.log.push(ActuatorEvent::Magnitude(wheel, magnitude));
        Ok(())
    }

    fn release(&mut self) -> Result<(), ActuatorError> {
        debug!("sim: motors released");
        self.log.push(ActuatorEvent::Released);
        Ok(())
    }
}
