// Operator-side receiver: accepts rover connections and records each session
//
// Session layout:
//   frame_000001.jpg ...  raw frame payloads
//   sync.txt              <index> <timestamp> <length> per frame
//   commands.txt          <timestamp> <command> <left> <right> per control record

use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::protocol::{ControlRecord, FrameRecord, ProtocolError, StreamMessage, StreamReader};

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub frames: u64,
    pub controls: u64,
}

struct SessionWriter {
    dir: PathBuf,
    sync: BufWriter<File>,
    commands: BufWriter<File>,
    summary: SessionSummary,
}

impl SessionWriter {
    async fn create(dir: &Path) -> Result<Self, std::io::Error> {
        fs::create_dir_all(dir).await?;
        Ok(Self {
            dir: dir.to_path_buf(),
            sync: BufWriter::new(File::create(dir.join("sync.txt")).await?),
            commands: BufWriter::new(File::create(dir.join("commands.txt")).await?),
            summary: SessionSummary::default(),
        })
    }

    async fn frame(&mut self, frame: &FrameRecord) -> Result<(), std::io::Error> {
        self.summary.frames += 1;
        let index = self.summary.frames;
        fs::write(self.dir.join(format!("frame_{:06}.jpg", index)), &frame.payload).await?;
        let line = format!("{} {:.6} {}\n", index, frame.timestamp, frame.payload.len());
        self.sync.write_all(line.as_bytes()).await
    }

    async fn control(&mut self, record: &ControlRecord) -> Result<(), std::io::Error> {
        self.summary.controls += 1;
        let line = format!(
            "{:.6} {} {} {}\n",
            record.timestamp, record.command, record.left, record.right
        );
        self.commands.write_all(line.as_bytes()).await
    }

    async fn close(mut self) -> Result<SessionSummary, std::io::Error> {
        self.sync.flush().await?;
        self.commands.flush().await?;
        Ok(self.summary)
    }
}

/// Read one rover session until end-of-stream, recording it under `dir`
pub async fn record_session<R>(stream: R, dir: &Path) -> Result<SessionSummary, ReceiveError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = StreamReader::new(stream);
    let mut session = SessionWriter::create(dir).await?;

    loop {
        match reader.next_message().await {
            Ok(StreamMessage::Frame(frame)) => {
                debug!("Frame {} bytes at {:.3}", frame.payload.len(), frame.timestamp);
                session.frame(&frame).await?;
            }
            Ok(StreamMessage::Control(record)) => {
                debug!("Control {} ({}, {})", record.command, record.left, record.right);
                session.control(&record).await?;
            }
            Ok(StreamMessage::EndOfStream) => break,
            Err(e) => {
                // keep what was received so far
                session.close().await?;
                return Err(e.into());
            }
        }
    }

    Ok(session.close().await?)
}

/// Accept rover connections forever; session N is recorded in `out_dir/N`
pub async fn serve(listen: &str, out_dir: PathBuf) -> Result<(), ReceiveError> {
    let listener = TcpListener::bind(listen).await?;
    info!("Receiver listening on {}, recording to {}", listen, out_dir.display());

    let mut next_session = first_free_session(&out_dir).await?;
    loop {
        let (socket, peer) = listener.accept().await?;
        let dir = out_dir.join(next_session.to_string());
        next_session += 1;
        info!("Rover connected from {}, session {}", peer, dir.display());

        tokio::spawn(async move {
            match record_session(socket, &dir).await {
                Ok(summary) => info!(
                    "Session {} complete: {} frames, {} controls",
                    dir.display(),
                    summary.frames,
                    summary.controls
                ),
                Err(e) => warn!("Session {} aborted: {}", dir.display(), e),
            }
        });
    }
}

/// Lowest session number above every numbered directory already present
async fn first_free_session(out_dir: &Path) -> Result<u64, std::io::Error> {
    fs::create_dir_all(out_dir).await?;
    let mut entries = fs::read_dir(out_dir).await?;
    let mut next = 0;
    while let Some(entry) = entries.next_entry().await? {
        if let Some(n) = entry.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) {
            next = next.max(n.saturating_add(1));
        }
    }
    Ok(next)
}
