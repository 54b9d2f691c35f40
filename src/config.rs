// Timings, defaults, motor and network configuration
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

// Control loop frequency
pub const LOOP_HZ: u64 = 100;

// Minimum idle time between two damping steps
pub const DAMPING_INTERVAL: Duration = Duration::from_millis(100);

// Speed increment per command
pub const DEFAULT_STEP_SIZE: u8 = 3;

// Streamer checks its quit signal once every this many frames
pub const QUIT_CHECK_EVERY: u32 = 30;

// Frames larger than this are rejected by the receiver
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

// Operator ("bastion") endpoint the rover streams to
pub const BASTION_ADDR: &str = "127.0.0.1:4000";

// Default capture rate for frame sources
pub const DEFAULT_FRAMERATE: u32 = 30;

// Serial port for the Feetech wheel servos
pub const MOTOR_PORT: &str = "/dev/ttyUSB0";

// Servo IDs of the two wheels
pub const MOTOR_ID_LEFT: u8 = 1;
pub const MOTOR_ID_RIGHT: u8 = 2;

// Raw goal-velocity ticks per unit of speed (255 * 8 stays under the servo limit)
pub const TICKS_PER_SPEED_UNIT: i16 = 8;

/// Errors loading a configuration file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Runtime settings, optionally loaded from a JSON file; missing keys keep their defaults
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoverConfig {
    pub step_size: u8,
    pub damping: bool,
    pub bastion_addr: String,
    pub framerate: u32,
    pub quit_check_every: u32,
    pub motor: MotorConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct MotorConfig {
    /// Drive a simulated actuator instead of the serial bus
    pub simulate: bool,
    pub port: String,
    pub left_id: u8,
    pub right_id: u8,
    pub ticks_per_unit: i16,
    /// Right servo is mounted mirrored and spins the other way for "forward"
    pub invert_right: bool,
}

impl Default for RoverConfig {
    fn default() -> Self {
        Self {
            step_size: DEFAULT_STEP_SIZE,
            damping: false,
            bastion_addr: BASTION_ADDR.to_string(),
            framerate: DEFAULT_FRAMERATE,
            quit_check_every: QUIT_CHECK_EVERY,
            motor: MotorConfig::default(),
        }
    }
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            simulate: false,
            port: MOTOR_PORT.to_string(),
            left_id: MOTOR_ID_LEFT,
            right_id: MOTOR_ID_RIGHT,
            ticks_per_unit: TICKS_PER_SPEED_UNIT,
            invert_right: true,
        }
    }
}

impl RoverConfig {
    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_json_gives_defaults() {
        let config = RoverConfig::from_json("{}").unwrap();
        assert_eq!(config, RoverConfig::default());
        assert_eq!(config.step_size, 3);
        assert_eq!(config.quit_check_every, 30);
    }

    #[test]
    fn test_partial_override() {
        let config =
            RoverConfig::from_json(r#"{"damping": true, "motor": {"simulate": true, "left_id": 7}}"#)
                .unwrap();
        assert!(config.damping);
        assert!(config.motor.simulate);
        assert_eq!(config.motor.left_id, 7);
        assert_eq!(config.motor.right_id, MOTOR_ID_RIGHT);
        assert_eq!(config.bastion_addr, BASTION_ADDR);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"step_size": 5, "bastion_addr": "10.0.0.2:4000"}}"#).unwrap();

        let config = RoverConfig::load(file.path()).unwrap();
        assert_eq!(config.step_size, 5);
        assert_eq!(config.bastion_addr, "10.0.0.2:4000");
    }

    #[test]
    fn test_load_reports_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let err = RoverConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
