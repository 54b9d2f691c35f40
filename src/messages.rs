// Message types shared by the control loop, the streamer and the receiver

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::motor::Speed;

/// Directive for the control loop, one character on the command channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Advance,
    Reverse,
    TurnLeft,
    TurnRight,
    Straighten,
    /// Abrupt stop
    Halt,
    /// Ramped stop
    StopGradual,
    Quit,
}

impl Command {
    pub const ALL: [Command; 8] = [
        Command::Advance,
        Command::Reverse,
        Command::TurnLeft,
        Command::TurnRight,
        Command::Straighten,
        Command::Halt,
        Command::StopGradual,
        Command::Quit,
    ];

    /// Channel / wire character for this command
    pub fn code(self) -> char {
        match self {
            Command::Advance => 'u',
            Command::Reverse => 'd',
            Command::TurnLeft => 'l',
            Command::TurnRight => 'r',
            Command::Straighten => 's',
            Command::Halt => 'h',
            Command::StopGradual => 't',
            Command::Quit => 'q',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    /// ASCII byte used in control records
    pub fn as_byte(self) -> u8 {
        self.code() as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::from_code(byte as char)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// (left, right) speeds as last published by the control loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpeedSnapshot {
    pub left: Speed,
    pub right: Speed,
}

impl SpeedSnapshot {
    pub fn new(left: Speed, right: Speed) -> Self {
        Self { left, right }
    }

    pub fn in_motion(&self) -> bool {
        self.left != 0 || self.right != 0
    }
}

impl From<(Speed, Speed)> for SpeedSnapshot {
    fn from((left, right): (Speed, Speed)) -> Self {
        Self { left, right }
    }
}

/// An operator input as reported to the streamer: what was issued, when,
/// and the speeds it resulted in
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlInput {
    pub timestamp: f64,
    pub command: Command,
    pub left: Speed,
    pub right: Speed,
}

impl ControlInput {
    /// Stamp an input with the current wall-clock time
    pub fn now(command: Command, speeds: SpeedSnapshot) -> Self {
        Self {
            timestamp: unix_timestamp(),
            command,
            left: speeds.left,
            right: speeds.right,
        }
    }
}

/// Seconds since the Unix epoch as a double
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
