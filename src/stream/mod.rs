// Rover -> operator streaming
//
// - Wire format for frame, control and end-of-stream records
// - Streamer task that sends camera frames interleaved with operator inputs
// - Receiver that records incoming sessions to disk

pub mod protocol;
pub mod receiver;
mod streamer;

pub use protocol::{ControlRecord, FrameRecord, ProtocolError, StreamMessage, StreamReader};
pub use receiver::{ReceiveError, SessionSummary, record_session, serve};
pub use streamer::{StreamConfig, StreamError, StreamSummary, Streamer};
