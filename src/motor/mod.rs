// Motor control for the two-wheel base
//
// Provides:
// - Speed arithmetic (clamping, averaging, ramps)
// - The motion state machine driving an abstract actuator
// - Simulated and Feetech serial-bus actuators

pub mod actuator;
mod controller;
mod driver;
pub mod feetech;
pub mod speed;

pub use actuator::{Actuator, ActuatorError, ActuatorEvent, Direction, EventLog, SimActuator, Wheel};
pub use controller::MotionController;
pub use driver::FeetechActuator;
pub use feetech::FeetechError;
pub use speed::{MAX_SPEED, Speed, clamp_speed, equalize_speeds, range_incl};
