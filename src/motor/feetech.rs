// Feetech STS serial bus, the subset needed to run two servos as wheels
//
// Packet: [0xFF, 0xFF, ID, Length, Instruction, Params..., Checksum]
// Length counts instruction + params + checksum; checksum is the inverted
// low byte of the sum of everything after the header.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BAUDRATE: u32 = 1_000_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

const HEADER: [u8; 2] = [0xFF, 0xFF];
pub(crate) const BROADCAST_ID: u8 = 0xFE;

#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub(crate) enum Instruction {
    Ping = 0x01,
    Write = 0x03,
    SyncWrite = 0x83,
}

/// RAM registers used for wheel mode
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Register {
    OperatingMode = 33, // 0=position, 1=velocity
    TorqueEnable = 40,
    GoalVelocity = 46, // sign-magnitude, bit 15 = reverse
    Lock = 55,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperatingMode {
    Position = 0,
    Velocity = 1,
}

#[derive(Debug, thiserror::Error)]
pub enum FeetechError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response from servo {id}: {reason}")]
    InvalidResponse { id: u8, reason: String },

    #[error("Checksum mismatch for servo {id}")]
    ChecksumMismatch { id: u8 },

    #[error("Servo {id} returned error status: 0x{status:02X}")]
    ServoError { id: u8, status: u8 },

    #[error("Timeout waiting for response from servo {id}")]
    Timeout { id: u8 },
}

pub type Result<T> = std::result::Result<T, FeetechError>;

/// Byte link the bus runs over; a serial port in practice
pub trait Transport: Read + Write + Send {}

impl<T: Read + Write + Send + ?Sized> Transport for T {}

pub struct FeetechBus {
    port: Box<dyn Transport>,
}

impl FeetechBus {
    pub fn open(port_name: &str) -> Result<Self> {
        let port = serialport::new(port_name, DEFAULT_BAUDRATE)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;
        Ok(Self::with_transport(port))
    }

    pub fn with_transport(port: impl Transport + 'static) -> Self {
        Self { port: Box::new(port) }
    }

    fn checksum(bytes: &[u8]) -> u8 {
        !bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
    }

    pub(crate) fn packet(id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(HEADER.len() + 4 + params.len());
        packet.extend_from_slice(&HEADER);
        packet.extend_from_slice(&[id, params.len() as u8 + 2, instruction as u8]);
        packet.extend_from_slice(params);
        let checksum = Self::checksum(&packet[HEADER.len()..]);
        packet.push(checksum);
        packet
    }

    fn transmit(&mut self, packet: &[u8]) -> Result<()> {
        self.port.write_all(packet)?;
        self.port.flush()?;
        Ok(())
    }

    /// Read a status packet and return its parameters
    fn status(&mut self, id: u8) -> Result<Vec<u8>> {
        // header, id, length
        let mut head = [0u8; 4];
        self.port.read_exact(&mut head).map_err(|e| match e.kind() {
            ErrorKind::TimedOut => FeetechError::Timeout { id },
            _ => FeetechError::Io(e),
        })?;

        if head[..2] != HEADER {
            return Err(FeetechError::InvalidResponse {
                id,
                reason: format!("bad header {:02X?}", &head[..2]),
            });
        }
        if head[2] != id {
            return Err(FeetechError::InvalidResponse {
                id,
                reason: format!("reply from servo {}", head[2]),
            });
        }

        // error byte, params, checksum
        let length = head[3] as usize;
        if length < 2 {
            return Err(FeetechError::InvalidResponse {
                id,
                reason: format!("length {} too short", length),
            });
        }
        let mut body = vec![0u8; length];
        self.port.read_exact(&mut body)?;

        let (payload, checksum) = body.split_at(length - 1);
        let mut summed = vec![head[2], head[3]];
        summed.extend_from_slice(payload);
        if Self::checksum(&summed) != checksum[0] {
            return Err(FeetechError::ChecksumMismatch { id });
        }
        if payload[0] != 0 {
            return Err(FeetechError::ServoError { id, status: payload[0] });
        }
        Ok(payload[1..].to_vec())
    }

    pub fn ping(&mut self, id: u8) -> Result<bool> {
        self.transmit(&Self::packet(id, Instruction::Ping, &[]))?;
        match self.status(id) {
            Ok(_) => Ok(true),
            Err(FeetechError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn write_u8(&mut self, id: u8, register: Register, value: u8) -> Result<()> {
        debug!("servo {}: {:?} <- {}", id, register, value);
        self.transmit(&Self::packet(id, Instruction::Write, &[register as u8, value]))?;
        self.status(id).map(|_| ())
    }

    /// Write the same 16-bit register on several servos in one broadcast packet (no reply)
    pub fn sync_write_u16(&mut self, register: Register, data: &[(u8, u16)]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut params = vec![register as u8, 2];
        for &(id, value) in data {
            params.push(id);
            params.extend_from_slice(&value.to_le_bytes());
        }
        debug!("sync write {:?} to {} servos", register, data.len());
        self.transmit(&Self::packet(BROADCAST_ID, Instruction::SyncWrite, &params))
    }

    pub fn set_torque(&mut self, id: u8, enabled: bool) -> Result<()> {
        self.write_u8(id, Register::TorqueEnable, enabled as u8)?;
        self.write_u8(id, Register::Lock, enabled as u8)
    }

    pub fn set_operating_mode(&mut self, id: u8, mode: OperatingMode) -> Result<()> {
        self.write_u8(id, Register::OperatingMode, mode as u8)
    }

    /// Goal velocities for several servos at once
    pub fn set_velocities(&mut self, data: &[(u8, i16)]) -> Result<()> {
        let encoded: Vec<(u8, u16)> = data
            .iter()
            .map(|&(id, v)| (id, encode_sign_magnitude(v)))
            .collect();
        self.sync_write_u16(Register::GoalVelocity, &encoded)
    }
}

/// Bit 15 = reverse, bits 0-14 = magnitude
pub fn encode_sign_magnitude(value: i16) -> u16 {
    let magnitude = value.unsigned_abs().min(0x7FFF);
    if value < 0 { 0x8000 | magnitude } else { magnitude }
}
