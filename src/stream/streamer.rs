// Streams camera frames and operator inputs to the bastion over one TCP connection
//
// Per cycle: maybe check quit, capture a frame, write every queued control
// record, then write the frame. A terminal end-of-stream record closes a
// normal session; any IO failure ends the session without it.

use std::time::{Duration, Instant};

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{ControlRecord, ProtocolError, write_control, write_end_of_stream, write_frame};
use crate::camera::{CameraError, FrameSource};
use crate::config::{QUIT_CHECK_EVERY, RoverConfig};
use crate::messages::ControlInput;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Write failed: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Streamer task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub addr: String,
    /// Check the quit signal once every this many frames
    pub quit_check_every: u32,
    pub max_frames: Option<u64>,
    pub max_duration: Option<Duration>,
}

impl StreamConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            quit_check_every: QUIT_CHECK_EVERY,
            max_frames: None,
            max_duration: None,
        }
    }
}

impl From<&RoverConfig> for StreamConfig {
    fn from(config: &RoverConfig) -> Self {
        Self {
            quit_check_every: config.quit_check_every,
            ..Self::new(config.bastion_addr.clone())
        }
    }
}

/// What a finished session sent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub frames: u64,
    pub controls: u64,
    pub frame_bytes: u64,
}

/// Handle to a running streaming session
pub struct Streamer {
    inputs: UnboundedSender<ControlInput>,
    quit: watch::Sender<bool>,
    task: JoinHandle<Result<StreamSummary, StreamError>>,
}

impl Streamer {
    /// Connect and start streaming in the background
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<S>(source: S, config: StreamConfig) -> Self
    where
        S: FrameSource + Send + 'static,
    {
        let (inputs, inputs_rx) = mpsc::unbounded_channel();
        let (quit, quit_rx) = watch::channel(false);
        let task = tokio::spawn(stream_main(source, config, inputs_rx, quit_rx));
        Self { inputs, quit, task }
    }

    /// Queue an operator input; it goes out ahead of the next frame.
    /// Returns false when the session has already ended.
    pub fn record(&self, input: ControlInput) -> bool {
        self.inputs.send(input).is_ok()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Ask the session to end; it notices at its next quit check
    pub fn request_quit(&self) {
        let _ = self.quit.send(true);
    }

    /// Request quit and wait for the session to wind down
    pub async fn stop(self) -> Result<StreamSummary, StreamError> {
        self.request_quit();
        self.task.await?
    }

    /// Wait for the session to end on its own (frame or time budget)
    pub async fn finish(self) -> Result<StreamSummary, StreamError> {
        self.task.await?
    }

    /// Wait for the session to end, requesting quit if `interrupt` resolves first
    pub async fn finish_or_quit_on<F: Future>(mut self, interrupt: F) -> Result<StreamSummary, StreamError> {
        tokio::select! {
            result = &mut self.task => return result?,
            _ = interrupt => {}
        }
        self.request_quit();
        self.task.await?
    }
}

async fn stream_main<S>(
    mut source: S,
    config: StreamConfig,
    mut inputs: UnboundedReceiver<ControlInput>,
    quit: watch::Receiver<bool>,
) -> Result<StreamSummary, StreamError>
where
    S: FrameSource + Send + 'static,
{
    let socket = TcpStream::connect(&config.addr)
        .await
        .map_err(|source| StreamError::Connect {
            addr: config.addr.clone(),
            source,
        })?;
    socket.set_nodelay(true)?;
    info!("Streaming to {}", config.addr);

    let mut writer = BufWriter::new(socket);
    let mut summary = StreamSummary::default();
    let check_every = config.quit_check_every.max(1) as u64;
    let started = Instant::now();

    loop {
        if summary.frames % check_every == 0 && *quit.borrow() {
            info!("Quit requested after {} frames", summary.frames);
            break;
        }

        // Camera blocks until a frame is ready; keep it off the async workers
        let (returned, captured) = tokio::task::spawn_blocking(move || {
            let frame = source.capture();
            (source, frame)
        })
        .await?;
        source = returned;
        let frame = captured?;

        while let Ok(input) = inputs.try_recv() {
            write_control(&mut writer, &ControlRecord::from(input)).await?;
            summary.controls += 1;
            debug!("Sent control {:?} ({}, {})", input.command, input.left, input.right);
        }

        write_frame(&mut writer, frame.timestamp, &frame.data).await?;
        summary.frames += 1;
        summary.frame_bytes += frame.data.len() as u64;
        debug!("Sent frame {} ({} bytes)", summary.frames, frame.data.len());

        if config.max_frames.is_some_and(|max| summary.frames >= max) {
            info!("Frame budget of {} reached", summary.frames);
            break;
        }
        if config.max_duration.is_some_and(|max| started.elapsed() >= max) {
            info!("Session time budget reached after {} frames", summary.frames);
            break;
        }
    }

    let dropped = inputs.len();
    if dropped > 0 {
        warn!("Dropping {} control inputs queued after the last frame", dropped);
    }

    write_end_of_stream(&mut writer).await?;
    writer.shutdown().await?;
    info!(
        "Stream closed: {} frames ({} bytes), {} controls in {:.1}s",
        summary.frames,
        summary.frame_bytes,
        summary.controls,
        started.elapsed().as_secs_f64()
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CapturedFrame, SyntheticSource};
    use crate::messages::{Command, SpeedSnapshot};
    use crate::stream::protocol::{StreamMessage, StreamReader};
    use std::collections::VecDeque;
    use tokio::net::TcpListener;

    /// Hands out the given frames, then repeats the last one
    struct ScriptedSource {
        frames: VecDeque<Vec<u8>>,
        last: Vec<u8>,
    }

    impl ScriptedSource {
        fn new(sizes: &[usize]) -> Self {
            Self {
                frames: sizes.iter().map(|&n| vec![0x5A; n]).collect(),
                last: Vec::new(),
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn capture(&mut self) -> Result<CapturedFrame, CameraError> {
            if let Some(frame) = self.frames.pop_front() {
                self.last = frame;
            }
            Ok(CapturedFrame {
                timestamp: 1_700_000_000.0,
                data: self.last.clone(),
            })
        }
    }

    /// Announces each capture as it starts, then waits for a permit to finish it
    struct GatedSource {
        sizes: VecDeque<usize>,
        started: UnboundedSender<usize>,
        permits: std::sync::mpsc::Receiver<()>,
    }

    impl FrameSource for GatedSource {
        fn capture(&mut self) -> Result<CapturedFrame, CameraError> {
            let len = self.sizes.pop_front().unwrap_or(1);
            let _ = self.started.send(len);
            self.permits
                .recv()
                .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
            Ok(CapturedFrame {
                timestamp: 1_700_000_000.0,
                data: vec![0x5A; len],
            })
        }
    }

    async fn read_session(listener: TcpListener) -> Vec<StreamMessage> {
        let (socket, _) = listener.accept().await.unwrap();
        let mut reader = StreamReader::new(socket);
        let mut messages = Vec::new();
        loop {
            let message = reader.next_message().await.unwrap();
            let end = message == StreamMessage::EndOfStream;
            messages.push(message);
            if end {
                return messages;
            }
        }
    }

    fn frame_len(message: &StreamMessage) -> Option<usize> {
        match message {
            StreamMessage::Frame(f) => Some(f.payload.len()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_two_frames_then_end_of_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let config = StreamConfig {
            max_frames: Some(2),
            ..StreamConfig::new(addr)
        };
        let streamer = Streamer::start(ScriptedSource::new(&[100, 200]), config);
        let messages = read_session(listener).await;
        let summary = streamer.finish().await.unwrap();

        assert_eq!(messages.len(), 3);
        assert_eq!(frame_len(&messages[0]), Some(100));
        assert_eq!(frame_len(&messages[1]), Some(200));
        assert_eq!(messages[2], StreamMessage::EndOfStream);
        assert_eq!(summary, StreamSummary { frames: 2, controls: 0, frame_bytes: 300 });
    }

    #[tokio::test]
    async fn test_quit_after_two_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let config = StreamConfig {
            quit_check_every: 1,
            ..StreamConfig::new(addr)
        };

        let (started_tx, mut started) = mpsc::unbounded_channel();
        let (permit, permits) = std::sync::mpsc::channel();
        let source = GatedSource {
            sizes: VecDeque::from([100, 200]),
            started: started_tx,
            permits,
        };
        let streamer = Streamer::start(source, config);
        let receiver = tokio::spawn(read_session(listener));

        permit.send(()).unwrap();
        assert_eq!(started.recv().await, Some(100));
        // second capture underway: the check after frame one has already passed
        assert_eq!(started.recv().await, Some(200));
        streamer.request_quit();
        permit.send(()).unwrap();

        let messages = receiver.await.unwrap();
        let summary = streamer.stop().await.unwrap();

        assert_eq!(messages.len(), 3);
        assert_eq!(frame_len(&messages[0]), Some(100));
        assert_eq!(frame_len(&messages[1]), Some(200));
        assert_eq!(messages[2], StreamMessage::EndOfStream);
        assert_eq!(summary, StreamSummary { frames: 2, controls: 0, frame_bytes: 300 });
    }

    #[tokio::test]
    async fn test_end_of_stream_flags_on_the_wire() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let config = StreamConfig {
            max_frames: Some(1),
            ..StreamConfig::new(addr)
        };
        let streamer = Streamer::start(ScriptedSource::new(&[10]), config);

        let (mut socket, _) = listener.accept().await.unwrap();
        let mut bytes = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut socket, &mut bytes).await.unwrap();
        streamer.finish().await.unwrap();

        // one 10-byte frame, then the 13-byte terminal record
        assert_eq!(bytes.len(), 13 + 10 + 13);
        assert_eq!(bytes[23], 0x80);
        assert!(bytes[24..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_queued_inputs_precede_next_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let config = StreamConfig {
            max_frames: Some(1),
            ..StreamConfig::new(addr)
        };

        let streamer = Streamer::start(ScriptedSource::new(&[50]), config);
        assert!(streamer.record(ControlInput::now(Command::Advance, SpeedSnapshot::new(3, 3))));
        assert!(streamer.record(ControlInput::now(Command::TurnLeft, SpeedSnapshot::new(0, 6))));

        let messages = read_session(listener).await;
        let summary = streamer.finish().await.unwrap();

        assert_eq!(messages.len(), 4);
        match (&messages[0], &messages[1]) {
            (StreamMessage::Control(a), StreamMessage::Control(b)) => {
                assert_eq!((a.command, a.left, a.right), (Command::Advance, 3, 3));
                assert_eq!((b.command, b.left, b.right), (Command::TurnLeft, 0, 6));
                assert!(a.timestamp <= b.timestamp);
            }
            other => panic!("expected two controls first, got {:?}", other),
        }
        assert_eq!(frame_len(&messages[2]), Some(50));
        assert_eq!(messages[3], StreamMessage::EndOfStream);
        assert_eq!(summary.controls, 2);
    }

    #[tokio::test]
    async fn test_quit_checked_at_interval() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let config = StreamConfig {
            quit_check_every: 5,
            ..StreamConfig::new(addr)
        };

        let streamer = Streamer::start(SyntheticSource::new(16, 500), config);
        let (socket, _) = listener.accept().await.unwrap();
        let mut reader = StreamReader::new(socket);

        // let a few frames through, then ask to quit
        for _ in 0..3 {
            assert!(frame_len(&reader.next_message().await.unwrap()).is_some());
        }
        streamer.request_quit();

        let mut frames = 3;
        loop {
            match reader.next_message().await.unwrap() {
                StreamMessage::EndOfStream => break,
                message => {
                    assert!(frame_len(&message).is_some());
                    frames += 1;
                }
            }
        }

        let summary = streamer.stop().await.unwrap();
        assert_eq!(summary.frames, frames);
        assert_eq!(frames % 5, 0);
    }

    #[tokio::test]
    async fn test_interrupt_requests_quit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let config = StreamConfig {
            quit_check_every: 1,
            ..StreamConfig::new(addr)
        };

        let streamer = Streamer::start(SyntheticSource::new(8, 200), config);
        let receiver = tokio::spawn(read_session(listener));
        let summary = streamer
            .finish_or_quit_on(tokio::time::sleep(Duration::from_millis(50)))
            .await
            .unwrap();
        let messages = receiver.await.unwrap();

        assert_eq!(summary.frames as usize, messages.len() - 1);
        assert_eq!(messages.last(), Some(&StreamMessage::EndOfStream));
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let streamer = Streamer::start(ScriptedSource::new(&[1]), StreamConfig::new(addr.clone()));
        match streamer.stop().await {
            Err(StreamError::Connect { addr: failed, .. }) => assert_eq!(failed, addr),
            other => panic!("expected connect error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_time_budget_ends_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let config = StreamConfig {
            max_duration: Some(Duration::from_millis(100)),
            ..StreamConfig::new(addr)
        };

        let streamer = Streamer::start(SyntheticSource::new(8, 100), config);
        let messages = read_session(listener).await;
        let summary = streamer.finish().await.unwrap();

        assert_eq!(messages.last(), Some(&StreamMessage::EndOfStream));
        assert_eq!(summary.frames as usize, messages.len() - 1);
        assert!(summary.frames >= 1);
    }
}
