// Framed binary protocol between the rover and the operator, little-endian
//
//   frame:         flags=0x00 | timestamp:f64 | length:u32 | payload
//   control:       flags=0x01 | timestamp:f64 | command:u8 | left:i16 | right:i16
//   end of stream: flags with bit 7 set, then zeroed timestamp and length
//
// Bit 7 wins over every other flag bit.

use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::MAX_FRAME_LEN;
use crate::messages::{Command, ControlInput};
use crate::motor::Speed;

pub const FLAG_CONTROL: u8 = 0x01;
pub const FLAG_END_OF_STREAM: u8 = 0x80;

/// flags + timestamp + length
pub const FRAME_HEADER_LEN: usize = 13;
/// flags + timestamp + command + left + right
pub const CONTROL_RECORD_LEN: usize = 14;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Stream truncated while reading {expected} bytes")]
    Truncated { expected: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown command byte 0x{0:02X}")]
    UnknownCommand(u8),

    #[error("Frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: u64, max: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    pub timestamp: f64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlRecord {
    pub timestamp: f64,
    pub command: Command,
    pub left: Speed,
    pub right: Speed,
}

impl From<ControlInput> for ControlRecord {
    fn from(input: ControlInput) -> Self {
        Self {
            timestamp: input.timestamp,
            command: input.command,
            left: input.left,
            right: input.right,
        }
    }
}

/// One decoded message
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Frame(FrameRecord),
    Control(ControlRecord),
    EndOfStream,
}

/// Header preceding a frame payload of `len` bytes
pub fn frame_header(timestamp: f64, len: usize) -> Result<[u8; FRAME_HEADER_LEN], ProtocolError> {
    let len = u32::try_from(len).map_err(|_| ProtocolError::FrameTooLarge {
        len: len as u64,
        max: u32::MAX,
    })?;
    let mut header = [0u8; FRAME_HEADER_LEN];
    header[1..9].copy_from_slice(&timestamp.to_le_bytes());
    header[9..13].copy_from_slice(&len.to_le_bytes());
    Ok(header)
}

/// Terminal record: bit 7 set, everything else zero
pub fn end_of_stream() -> [u8; FRAME_HEADER_LEN] {
    let mut record = [0u8; FRAME_HEADER_LEN];
    record[0] = FLAG_END_OF_STREAM;
    record
}

impl FrameRecord {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut bytes = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        bytes.extend_from_slice(&frame_header(self.timestamp, self.payload.len())?);
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }
}

impl ControlRecord {
    pub fn encode(&self) -> [u8; CONTROL_RECORD_LEN] {
        let mut bytes = [0u8; CONTROL_RECORD_LEN];
        bytes[0] = FLAG_CONTROL;
        bytes[1..9].copy_from_slice(&self.timestamp.to_le_bytes());
        bytes[9] = self.command.as_byte();
        bytes[10..12].copy_from_slice(&self.left.to_le_bytes());
        bytes[12..14].copy_from_slice(&self.right.to_le_bytes());
        bytes
    }
}

/// Write a frame (header then payload) and flush
pub async fn write_frame<W>(writer: &mut W, timestamp: f64, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame_header(timestamp, payload.len())?).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Write one control record and flush
pub async fn write_control<W>(writer: &mut W, record: &ControlRecord) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&record.encode()).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_end_of_stream<W>(writer: &mut W) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&end_of_stream()).await?;
    writer.flush().await?;
    Ok(())
}

/// Decodes messages from a byte stream
///
/// Running out of bytes mid-message is always an error, never "no data yet".
pub struct StreamReader<R> {
    inner: R,
    max_frame_len: u32,
}

impl<R: AsyncRead + Unpin> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_frame_len(inner, MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(inner: R, max_frame_len: u32) -> Self {
        Self { inner, max_frame_len }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    async fn fill(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        match self.inner.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(ProtocolError::Truncated { expected: buf.len() }),
            Err(e) => Err(ProtocolError::Io(e)),
        }
    }

    pub async fn next_message(&mut self) -> Result<StreamMessage, ProtocolError> {
        let mut flags = [0u8; 1];
        self.fill(&mut flags).await?;
        let flags = flags[0];

        if flags & FLAG_END_OF_STREAM != 0 {
            let mut rest = [0u8; FRAME_HEADER_LEN - 1];
            self.fill(&mut rest).await?;
            return Ok(StreamMessage::EndOfStream);
        }

        if flags & FLAG_CONTROL != 0 {
            let mut rest = [0u8; CONTROL_RECORD_LEN - 1];
            self.fill(&mut rest).await?;
            let command = Command::from_byte(rest[8]).ok_or(ProtocolError::UnknownCommand(rest[8]))?;
            return Ok(StreamMessage::Control(ControlRecord {
                timestamp: f64::from_le_bytes(le_array(&rest[0..8])),
                command,
                left: i16::from_le_bytes(le_array(&rest[9..11])),
                right: i16::from_le_bytes(le_array(&rest[11..13])),
            }));
        }

        let mut rest = [0u8; FRAME_HEADER_LEN - 1];
        self.fill(&mut rest).await?;
        let timestamp = f64::from_le_bytes(le_array(&rest[0..8]));
        let len = u32::from_le_bytes(le_array(&rest[8..12]));
        if len > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                len: len as u64,
                max: self.max_frame_len,
            });
        }

        let mut payload = vec![0u8; len as usize];
        self.fill(&mut payload).await?;
        Ok(StreamMessage::Frame(FrameRecord { timestamp, payload }))
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut array = [0u8; N];
    array.copy_from_slice(bytes);
    array
}
