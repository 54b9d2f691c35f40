// Motion state machine for the two-wheel base
//
// Owns the current (left, right) speed pair and the actuator. Every
// operation computes a target pair and goes through `update_speed`, the
// single place where actuator state and stored speeds change together.

use tracing::{debug, warn};

use super::actuator::{Actuator, ActuatorError, Direction, Wheel};
use super::speed::{Speed, clamp_speed, equalize_speeds, range_incl};
use crate::config::DEFAULT_STEP_SIZE;

pub struct MotionController<A: Actuator> {
    actuator: A,
    left_speed: Speed,
    right_speed: Speed,
    step_size: u8,
}

impl<A: Actuator> MotionController<A> {
    /// Create a controller with the default step size
    pub fn new(actuator: A) -> Result<Self, ActuatorError> {
        Self::with_step_size(actuator, DEFAULT_STEP_SIZE)
    }

    /// Create a controller; both wheels start forward at zero magnitude
    pub fn with_step_size(mut actuator: A, step_size: u8) -> Result<Self, ActuatorError> {
        for wheel in [Wheel::Left, Wheel::Right] {
            actuator.set_direction(wheel, Direction::Forward)?;
            actuator.set_magnitude(wheel, 0)?;
        }

        Ok(Self {
            actuator,
            left_speed: 0,
            right_speed: 0,
            step_size: step_size.max(1),
        })
    }

    pub fn left_speed(&self) -> Speed {
        self.left_speed
    }

    pub fn right_speed(&self) -> Speed {
        self.right_speed
    }

    /// Current (left, right) pair
    pub fn speeds(&self) -> (Speed, Speed) {
        (self.left_speed, self.right_speed)
    }

    pub fn step_size(&self) -> u8 {
        self.step_size
    }

    pub fn in_motion(&self) -> bool {
        self.left_speed != 0 || self.right_speed != 0
    }

    /// Accelerate both wheels by `steps * step_size`
    pub fn speed_ahead(&mut self, steps: u32) -> Result<(), ActuatorError> {
        self.shift_both(steps as i32)
    }

    /// Decelerate (or accelerate backwards) both wheels by `steps * step_size`
    pub fn speed_back(&mut self, steps: u32) -> Result<(), ActuatorError> {
        self.shift_both(-(steps as i32))
    }

    fn shift_both(&mut self, steps: i32) -> Result<(), ActuatorError> {
        let delta = steps.saturating_mul(self.step_size as i32);
        let left = self.left_speed as i32 + delta;
        let right = self.right_speed as i32 + delta;
        self.update_speed(Some(left), Some(right))
    }

    /// Yaw left: slow the left wheel, speed up the right one
    pub fn turn_left(&mut self) -> Result<(), ActuatorError> {
        let step = self.step_size as i32;
        let left = self.left_speed as i32 - step;
        let right = self.right_speed as i32 + step;
        self.update_speed(Some(left), Some(right))
    }

    /// Yaw right: mirror of `turn_left`
    pub fn turn_right(&mut self) -> Result<(), ActuatorError> {
        let step = self.step_size as i32;
        let left = self.left_speed as i32 + step;
        let right = self.right_speed as i32 - step;
        self.update_speed(Some(left), Some(right))
    }

    /// Both wheels to the mean speed
    pub fn straighten_course(&mut self) -> Result<(), ActuatorError> {
        let (left, right) = equalize_speeds(self.left_speed, self.right_speed);
        self.update_speed(Some(left as i32), Some(right as i32))
    }

    /// Ramped stop
    ///
    /// Both wheels walk towards zero in lock-step; the wheel that gets there
    /// first holds at zero while the other keeps stepping. Points equal to
    /// the current pair are skipped.
    pub fn stop(&mut self) -> Result<(), ActuatorError> {
        let step = self.step_size as u32;
        let left_ramp = range_incl(self.left_speed as i32, 0, step);
        let right_ramp = range_incl(self.right_speed as i32, 0, step);
        let len = left_ramp.len().max(right_ramp.len());

        for i in 0..len {
            let left = left_ramp.get(i).copied().unwrap_or(0);
            let right = right_ramp.get(i).copied().unwrap_or(0);
            if (left, right) == (self.left_speed as i32, self.right_speed as i32) {
                continue;
            }
            self.update_speed(Some(left), Some(right))?;
        }
        Ok(())
    }

    /// Abrupt stop: both wheels to zero in one write
    pub fn halt(&mut self) -> Result<(), ActuatorError> {
        self.update_speed(Some(0), Some(0))
    }

    /// Move each moving wheel one step towards zero (momentum decay)
    pub fn step_towards_zero(&mut self) -> Result<(), ActuatorError> {
        let step = self.step_size as i32;
        let decay = |speed: Speed| {
            let speed = speed as i32;
            if speed > 0 {
                (speed - step).max(0)
            } else {
                (speed + step).min(0)
            }
        };
        let left = decay(self.left_speed);
        let right = decay(self.right_speed);
        self.update_speed(Some(left), Some(right))
    }

    /// Set new wheel speeds; `None` keeps that wheel's current speed
    ///
    /// Values are clamped to the speed range. When a wheel's sign flips
    /// relative to its stored speed, its magnitude is zeroed and the new
    /// direction commanded before the new magnitude is applied.
    pub fn update_speed(&mut self, left: Option<i32>, right: Option<i32>) -> Result<(), ActuatorError> {
        let left = left.map(clamp_speed).unwrap_or(self.left_speed);
        let right = right.map(clamp_speed).unwrap_or(self.right_speed);

        debug!(
            "Updating speeds to ({}, {}), current ({}, {})",
            left, right, self.left_speed, self.right_speed
        );

        self.reverse_if_needed(Wheel::Left, self.left_speed, left)?;
        self.reverse_if_needed(Wheel::Right, self.right_speed, right)?;

        self.actuator.set_magnitude(Wheel::Left, left.unsigned_abs() as u8)?;
        self.actuator.set_magnitude(Wheel::Right, right.unsigned_abs() as u8)?;

        self.left_speed = left;
        self.right_speed = right;
        Ok(())
    }

    fn reverse_if_needed(&mut self, wheel: Wheel, current: Speed, target: Speed) -> Result<(), ActuatorError> {
        let direction = if target < 0 && current >= 0 {
            Direction::Backward
        } else if target > 0 && current <= 0 {
            Direction::Forward
        } else {
            return Ok(());
        };

        // Drivers must not change direction at non-zero throttle
        self.actuator.set_magnitude(wheel, 0)?;
        self.actuator.set_direction(wheel, direction)
    }
}

impl<A: Actuator> Drop for MotionController<A> {
    fn drop(&mut self) {
        // Safe stop before letting go of the motors
        for wheel in [Wheel::Left, Wheel::Right] {
            if let Err(e) = self.actuator.set_magnitude(wheel, 0) {
                warn!("Failed to zero {:?} wheel on drop: {}", wheel, e);
            }
        }
        if let Err(e) = self.actuator.release() {
            warn!("Failed to release motors on drop: {}", e);
        }
    }
}
