use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rover_runtime::camera::{DirectorySource, FrameSource, SyntheticSource};
use rover_runtime::config::RoverConfig;
use rover_runtime::motor::{Actuator, FeetechActuator, SimActuator};
use rover_runtime::runtime::{DriveOptions, Driver};
use rover_runtime::stream::{self, StreamConfig, Streamer};
use rover_runtime::teleop::run_teleop;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Differential-drive rover: motor control and camera streaming
#[derive(Parser, Debug)]
#[command(name = "rover-runtime", version, about)]
struct Cli {
    /// JSON config file; flags override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Drive from the keyboard, optionally streaming to the bastion
    Drive {
        /// Use a simulated actuator instead of the servo bus
        #[arg(long)]
        simulate: bool,

        /// Serial port of the wheel servos
        #[arg(long)]
        port: Option<String>,

        /// Coast towards zero when no keys are pressed
        #[arg(long)]
        damping: bool,

        #[arg(long)]
        step_size: Option<u8>,

        /// Also stream frames and inputs to the bastion
        #[arg(long)]
        stream: bool,

        #[command(flatten)]
        source: SourceArgs,
    },

    /// Stream frames to the bastion without driving
    Stream {
        #[command(flatten)]
        source: SourceArgs,

        /// Stop after this many frames
        #[arg(long)]
        max_frames: Option<u64>,

        /// Stop after this many seconds
        #[arg(long)]
        max_seconds: Option<u64>,
    },

    /// Run the bastion side: accept rover sessions and record them
    Receive {
        #[arg(long, default_value = "0.0.0.0:4000")]
        listen: String,

        #[arg(long, default_value = "sessions")]
        out: PathBuf,
    },
}

#[derive(Args, Debug)]
struct SourceArgs {
    /// Bastion address (host:port)
    #[arg(long)]
    bastion: Option<String>,

    /// Replay JPEG files from this directory instead of synthetic frames
    #[arg(long)]
    frames_dir: Option<PathBuf>,

    /// Payload size of synthetic frames
    #[arg(long, default_value_t = 4096)]
    synthetic_size: usize,

    #[arg(long)]
    framerate: Option<u32>,
}

impl SourceArgs {
    fn apply(&self, config: &mut RoverConfig) {
        if let Some(addr) = &self.bastion {
            config.bastion_addr = addr.clone();
        }
        if let Some(fps) = self.framerate {
            config.framerate = fps;
        }
    }

    fn open(&self, framerate: u32) -> Result<Box<dyn FrameSource + Send>, BoxError> {
        Ok(match &self.frames_dir {
            Some(dir) => Box::new(DirectorySource::open(dir, framerate)?),
            None => Box::new(SyntheticSource::new(self.synthetic_size, framerate)),
        })
    }
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), BoxError> {
    let mut config = match &cli.config {
        Some(path) => RoverConfig::load(path)?,
        None => RoverConfig::default(),
    };

    match cli.mode {
        Mode::Drive {
            simulate,
            port,
            damping,
            step_size,
            stream,
            source,
        } => {
            config.motor.simulate |= simulate;
            config.damping |= damping;
            if let Some(port) = port {
                config.motor.port = port;
            }
            if let Some(step) = step_size {
                config.step_size = step;
            }
            source.apply(&mut config);

            let streamer = if stream {
                Some(Streamer::start(source.open(config.framerate)?, StreamConfig::from(&config)))
            } else {
                None
            };

            if config.motor.simulate {
                info!("Driving simulated actuator");
                drive(SimActuator::new(), &config, streamer).await
            } else {
                let mut actuator = FeetechActuator::open(&config.motor)?;
                actuator.initialize()?;
                drive(actuator, &config, streamer).await
            }
        }

        Mode::Stream {
            source,
            max_frames,
            max_seconds,
        } => {
            source.apply(&mut config);
            let stream_config = StreamConfig {
                max_frames,
                max_duration: max_seconds.map(Duration::from_secs),
                ..StreamConfig::from(&config)
            };
            let streamer = Streamer::start(source.open(config.framerate)?, stream_config);
            let summary = streamer.finish_or_quit_on(shutdown_signal()).await?;
            info!(
                "Sent {} frames ({} bytes)",
                summary.frames, summary.frame_bytes
            );
            Ok(())
        }

        Mode::Receive { listen, out } => {
            tokio::select! {
                result = stream::serve(&listen, out) => result?,
                _ = shutdown_signal() => info!("Receiver shutting down"),
            }
            Ok(())
        }
    }
}

/// Resolves on Ctrl+C; never resolves if the handler cannot be installed
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn drive<A>(actuator: A, config: &RoverConfig, streamer: Option<Streamer>) -> Result<(), BoxError>
where
    A: Actuator + Send + 'static,
{
    let driver = Driver::start(actuator, DriveOptions::from(config))?;
    let teleop = run_teleop(&driver, streamer.as_ref()).await;

    // Stop the wheels before anything else is torn down
    let drive_result = driver.quit().await;
    if let Some(streamer) = streamer {
        let summary = streamer.stop().await?;
        info!("Stream sent {} frames, {} controls", summary.frames, summary.controls);
    }

    teleop?;
    drive_result?;
    Ok(())
}
