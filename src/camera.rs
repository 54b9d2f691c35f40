// Frame sources for the streamer
//
// The real camera lives outside this crate; anything that can hand out
// encoded frames one blocking call at a time can feed the streamer.

use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::messages::unix_timestamp;

#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("IO error reading frames: {0}")]
    Io(#[from] std::io::Error),

    #[error("No frames found in {}", .0.display())]
    Empty(PathBuf),
}

/// One encoded frame and the moment it was captured
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    pub timestamp: f64,
    pub data: Vec<u8>,
}

/// Blocking producer of encoded frames
pub trait FrameSource {
    /// Wait for and return the next frame
    fn capture(&mut self) -> Result<CapturedFrame, CameraError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn capture(&mut self) -> Result<CapturedFrame, CameraError> {
        (**self).capture()
    }
}

/// Sleeps so consecutive captures are at least one frame period apart
#[derive(Debug)]
struct Pacer {
    period: Duration,
    last: Option<Instant>,
}

impl Pacer {
    fn new(framerate: u32) -> Self {
        Self {
            period: Duration::from_secs(1) / framerate.max(1),
            last: None,
        }
    }

    fn wait(&mut self) {
        if let Some(last) = self.last {
            let elapsed = last.elapsed();
            if elapsed < self.period {
                sleep(self.period - elapsed);
            }
        }
        self.last = Some(Instant::now());
    }
}

/// Replays the JPEG files of a directory in name order, looping forever
#[derive(Debug)]
pub struct DirectorySource {
    files: Vec<PathBuf>,
    next: usize,
    pacer: Pacer,
}

impl DirectorySource {
    pub fn open(dir: impl AsRef<Path>, framerate: u32) -> Result<Self, CameraError> {
        let dir = dir.as_ref();
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
            })
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(CameraError::Empty(dir.to_path_buf()));
        }
        info!("Replaying {} frames from {} at {} fps", files.len(), dir.display(), framerate);

        Ok(Self {
            files,
            next: 0,
            pacer: Pacer::new(framerate),
        })
    }
}

impl FrameSource for DirectorySource {
    fn capture(&mut self) -> Result<CapturedFrame, CameraError> {
        self.pacer.wait();
        let path = &self.files[self.next];
        self.next = (self.next + 1) % self.files.len();

        let data = std::fs::read(path)?;
        debug!("Captured {} ({} bytes)", path.display(), data.len());
        Ok(CapturedFrame {
            timestamp: unix_timestamp(),
            data,
        })
    }
}

/// Fixed-size placeholder frames, for exercising a link without a camera
#[derive(Debug)]
pub struct SyntheticSource {
    frame_len: usize,
    counter: u8,
    pacer: Pacer,
}

impl SyntheticSource {
    pub fn new(frame_len: usize, framerate: u32) -> Self {
        Self {
            frame_len,
            counter: 0,
            pacer: Pacer::new(framerate),
        }
    }
}

impl FrameSource for SyntheticSource {
    fn capture(&mut self) -> Result<CapturedFrame, CameraError> {
        self.pacer.wait();
        self.counter = self.counter.wrapping_add(1);
        Ok(CapturedFrame {
            timestamp: unix_timestamp(),
            data: vec![self.counter; self.frame_len],
        })
    }
}
