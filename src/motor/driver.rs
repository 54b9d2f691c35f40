// Hardware actuator: two Feetech servos in velocity mode acting as wheels
//
// Direction and magnitude are held per wheel and combined into one signed
// goal velocity on every write.

use tracing::{debug, info, warn};

use super::actuator::{Actuator, ActuatorError, Direction, Wheel};
use super::feetech::{FeetechBus, FeetechError, OperatingMode};
use crate::config::MotorConfig;

#[derive(Debug, Clone, Copy)]
struct WheelState {
    id: u8,
    direction: Direction,
    magnitude: u8,
    inverted: bool,
}

impl WheelState {
    fn goal_velocity(&self, ticks_per_unit: i16) -> i16 {
        let raw = (self.magnitude as i16).saturating_mul(ticks_per_unit);
        let forward = (self.direction == Direction::Forward) != self.inverted;
        if forward { raw } else { -raw }
    }
}

pub struct FeetechActuator {
    bus: FeetechBus,
    wheels: [WheelState; 2], // [left, right]
    ticks_per_unit: i16,
    released: bool,
}

impl FeetechActuator {
    /// Open the serial bus; call `initialize` before driving
    pub fn open(config: &MotorConfig) -> Result<Self, FeetechError> {
        info!(
            "Opening wheel servo bus on {} (left={}, right={})",
            config.port, config.left_id, config.right_id
        );
        Ok(Self::with_bus(FeetechBus::open(&config.port)?, config))
    }

    pub fn with_bus(bus: FeetechBus, config: &MotorConfig) -> Self {
        let wheel = |id, inverted| WheelState {
            id,
            direction: Direction::Forward,
            magnitude: 0,
            inverted,
        };
        Self {
            bus,
            wheels: [wheel(config.left_id, false), wheel(config.right_id, config.invert_right)],
            ticks_per_unit: config.ticks_per_unit,
            released: false,
        }
    }

    /// Check both servos answer, then switch them to velocity mode with torque on
    pub fn initialize(&mut self) -> Result<(), FeetechError> {
        let ids = self.ids();
        for id in ids {
            if !self.bus.ping(id)? {
                warn!("Servo {} not responding to ping", id);
                return Err(FeetechError::Timeout { id });
            }
            debug!("Servo {} responding", id);
        }

        // Mode changes need torque off
        for id in ids {
            self.bus.set_torque(id, false)?;
            self.bus.set_operating_mode(id, OperatingMode::Velocity)?;
            self.bus.set_torque(id, true)?;
        }
        self.released = false;

        info!("Wheel servos initialized for velocity control");
        Ok(())
    }

    fn ids(&self) -> [u8; 2] {
        [self.wheels[0].id, self.wheels[1].id]
    }

    fn push(&mut self) -> Result<(), FeetechError> {
        let data = self.wheels.map(|w| (w.id, w.goal_velocity(self.ticks_per_unit)));
        self.bus.set_velocities(&data)
    }
}

impl Actuator for FeetechActuator {
    fn set_direction(&mut self, wheel: Wheel, direction: Direction) -> Result<(), ActuatorError> {
        self.wheels[wheel as usize].direction = direction;
        self.push()?;
        Ok(())
    }

    fn set_magnitude(&mut self, wheel: Wheel, magnitude: u8) -> Result<(), ActuatorError> {
        self.wheels[wheel as usize].magnitude = magnitude;
        self.push()?;
        Ok(())
    }

    /// Zero both wheels and disable torque; later calls do nothing
    fn release(&mut self) -> Result<(), ActuatorError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        info!("Releasing wheel servos");
        for state in &mut self.wheels {
            state.magnitude = 0;
        }
        self.push()?;
        for id in self.ids() {
            self.bus.set_torque(id, false)?;
        }
        Ok(())
    }
}

impl Drop for FeetechActuator {
    fn drop(&mut self) {
        // Covers exits that never reached the motion controller
        if let Err(e) = self.release() {
            warn!("Failed to release wheel servos on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::feetech::{BROADCAST_ID, Instruction, Register};
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};
    use std::sync::{Arc, Mutex};

    /// Records everything written and answers every status read with "ok"
    #[derive(Clone, Default)]
    struct RecordingPort {
        written: Arc<Mutex<Vec<u8>>>,
        replies: Arc<Mutex<VecDeque<u8>>>,
    }

    impl RecordingPort {
        fn queue_ok(&self, id: u8, count: usize) {
            let mut replies = self.replies.lock().unwrap();
            for _ in 0..count {
                replies.extend([0xFF, 0xFF, id, 2, 0, !(id.wrapping_add(2))]);
            }
        }

        fn count(&self, packet: &[u8]) -> usize {
            self.written.lock().unwrap().windows(packet.len()).filter(|w| *w == packet).count()
        }
    }

    impl Read for RecordingPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Err(io::ErrorKind::TimedOut.into());
            }
            let n = buf.len().min(replies.len());
            for (slot, byte) in buf.iter_mut().zip(replies.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Write for RecordingPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn actuator(port: &RecordingPort) -> FeetechActuator {
        let config = MotorConfig::default();
        // torque + lock writes for each wheel on release
        port.queue_ok(config.left_id, 2);
        port.queue_ok(config.right_id, 2);
        FeetechActuator::with_bus(FeetechBus::with_transport(port.clone()), &config)
    }

    fn torque_off(id: u8) -> Vec<u8> {
        FeetechBus::packet(id, Instruction::Write, &[Register::TorqueEnable as u8, 0])
    }

    fn zero_velocities() -> Vec<u8> {
        FeetechBus::packet(
            BROADCAST_ID,
            Instruction::SyncWrite,
            &[Register::GoalVelocity as u8, 2, 1, 0, 0, 2, 0, 0],
        )
    }

    #[test]
    fn test_drop_stops_wheels_and_disables_torque() {
        let port = RecordingPort::default();
        let mut act = actuator(&port);
        act.set_magnitude(Wheel::Left, 40).unwrap();
        assert_eq!(port.count(&zero_velocities()), 0);

        drop(act);
        assert_eq!(port.count(&zero_velocities()), 1);
        assert_eq!(port.count(&torque_off(1)), 1);
        assert_eq!(port.count(&torque_off(2)), 1);
    }

    #[test]
    fn test_release_runs_once() {
        let port = RecordingPort::default();
        let mut act = actuator(&port);
        act.release().unwrap();
        act.release().unwrap();
        drop(act);

        assert_eq!(port.count(&torque_off(1)), 1);
        assert_eq!(port.count(&torque_off(2)), 1);
    }

    fn wheel(direction: Direction, magnitude: u8, inverted: bool) -> WheelState {
        WheelState { id: 1, direction, magnitude, inverted }
    }

    #[test]
    fn test_goal_velocity_sign() {
        assert_eq!(wheel(Direction::Forward, 10, false).goal_velocity(8), 80);
        assert_eq!(wheel(Direction::Backward, 10, false).goal_velocity(8), -80);
        assert_eq!(wheel(Direction::Forward, 10, true).goal_velocity(8), -80);
        assert_eq!(wheel(Direction::Backward, 10, true).goal_velocity(8), 80);
    }

    #[test]
    fn test_full_speed_within_servo_range() {
        let v = wheel(Direction::Forward, 255, false).goal_velocity(8);
        assert_eq!(v, 2040);
        assert_eq!(wheel(Direction::Forward, 0, true).goal_velocity(8), 0);
    }
}
