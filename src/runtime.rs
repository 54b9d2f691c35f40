// Control loop task and the Driver facade
//
// The loop owns the motion controller (and with it the actuator). Producers
// push command characters through an unbounded channel; the latest speed
// pair is published to a lock-free slot other tasks can poll. A producer
// that needs the speeds its command produced can ask to be told once it
// has been applied.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::config::{DAMPING_INTERVAL, DEFAULT_STEP_SIZE, LOOP_HZ, RoverConfig};
use crate::messages::{Command, SpeedSnapshot};
use crate::motor::{Actuator, ActuatorError, MotionController};

#[derive(Debug, thiserror::Error)]
pub enum DriveError {
    #[error("Actuator error: {0}")]
    Actuator(#[from] ActuatorError),

    #[error("Control loop is not running")]
    Stopped,

    #[error("Control loop task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Single-writer, many-reader speed pair
///
/// Both speeds live in one atomic word, so a reader never sees a left value
/// from one update and a right value from another.
#[derive(Debug, Default)]
pub struct SpeedSlot {
    packed: AtomicU32,
}

impl SpeedSlot {
    pub fn store(&self, speeds: SpeedSnapshot) {
        let packed = ((speeds.left as u16 as u32) << 16) | speeds.right as u16 as u32;
        self.packed.store(packed, Ordering::Release);
    }

    pub fn load(&self) -> SpeedSnapshot {
        let packed = self.packed.load(Ordering::Acquire);
        SpeedSnapshot {
            left: (packed >> 16) as u16 as i16,
            right: packed as u16 as i16,
        }
    }
}

/// One entry on the command channel
#[derive(Debug)]
struct Request {
    code: char,
    applied: Option<oneshot::Sender<SpeedSnapshot>>,
}

#[derive(Debug, Clone, Copy)]
pub struct DriveOptions {
    pub step_size: u8,
    /// Coast towards zero when no commands arrive
    pub damping: bool,
}

impl Default for DriveOptions {
    fn default() -> Self {
        Self {
            step_size: DEFAULT_STEP_SIZE,
            damping: false,
        }
    }
}

impl From<&RoverConfig> for DriveOptions {
    fn from(config: &RoverConfig) -> Self {
        Self {
            step_size: config.step_size,
            damping: config.damping,
        }
    }
}

struct ControlLoop<A: Actuator> {
    ctrl: MotionController<A>,
    damping: bool,
    last_change: Instant,
    speeds: Arc<SpeedSlot>,
}

impl<A: Actuator> ControlLoop<A> {
    /// Apply one command; returns false once the loop should end
    fn on_command(&mut self, code: char) -> Result<bool, ActuatorError> {
        let Some(command) = Command::from_code(code) else {
            warn!("Ignoring unrecognized command {:?}", code);
            return Ok(true);
        };
        debug!("Applying command {:?}", command);

        match command {
            Command::Advance => self.ctrl.speed_ahead(1)?,
            Command::Reverse => self.ctrl.speed_back(1)?,
            Command::TurnLeft => self.ctrl.turn_left()?,
            Command::TurnRight => self.ctrl.turn_right()?,
            Command::Straighten => self.ctrl.straighten_course()?,
            Command::Halt => self.ctrl.halt()?,
            Command::StopGradual => self.ctrl.stop()?,
            Command::Quit => {
                self.ctrl.halt()?;
                self.publish();
                return Ok(false);
            }
        }

        self.last_change = Instant::now();
        self.publish();
        Ok(true)
    }

    /// Damping step when nothing arrived this tick
    fn on_idle(&mut self) -> Result<(), ActuatorError> {
        if self.damping && self.ctrl.in_motion() && self.last_change.elapsed() >= DAMPING_INTERVAL {
            self.ctrl.step_towards_zero()?;
            self.last_change = Instant::now();
            self.publish();
        }
        Ok(())
    }

    fn publish(&self) {
        self.speeds.store(self.ctrl.speeds().into());
    }
}

async fn control_main<A: Actuator>(
    mut control: ControlLoop<A>,
    mut commands: UnboundedReceiver<Request>,
) -> Result<(), DriveError> {
    let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        "Control loop started: {}Hz, step size {}, damping {}",
        LOOP_HZ,
        control.ctrl.step_size(),
        if control.damping { "on" } else { "off" }
    );

    loop {
        tick.tick().await;

        // Drain everything pending, in arrival order
        let mut received = false;
        loop {
            match commands.try_recv() {
                Ok(request) => {
                    received = true;
                    let keep_running = control.on_command(request.code)?;
                    if let Some(applied) = request.applied {
                        let _ = applied.send(control.speeds.load());
                    }
                    if !keep_running {
                        info!("Quit received, control loop exiting");
                        return Ok(());
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    warn!("Command channel closed, halting");
                    control.ctrl.halt()?;
                    control.publish();
                    return Ok(());
                }
            }
        }

        if !received {
            control.on_idle()?;
        }
    }
}

/// Handle to a running control loop
pub struct Driver {
    commands: UnboundedSender<Request>,
    speeds: Arc<SpeedSlot>,
    task: JoinHandle<Result<(), DriveError>>,
}

impl Driver {
    /// Take ownership of the actuator and spawn the control loop
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<A>(actuator: A, options: DriveOptions) -> Result<Self, DriveError>
    where
        A: Actuator + Send + 'static,
    {
        let ctrl = MotionController::with_step_size(actuator, options.step_size)?;
        let speeds = Arc::new(SpeedSlot::default());
        let (commands, rx) = mpsc::unbounded_channel();

        let control = ControlLoop {
            ctrl,
            damping: options.damping,
            last_change: Instant::now(),
            speeds: Arc::clone(&speeds),
        };
        let task = tokio::spawn(control_main(control, rx));

        Ok(Self { commands, speeds, task })
    }

    /// Queue a command; never blocks, never drops an accepted command
    pub fn send(&self, command: Command) -> Result<(), DriveError> {
        self.send_code(command.code())
    }

    /// Queue a raw command character; unknown codes are ignored by the loop
    pub fn send_code(&self, code: char) -> Result<(), DriveError> {
        self.commands
            .send(Request { code, applied: None })
            .map_err(|_| DriveError::Stopped)
    }

    /// Queue a command and wait until the loop has applied it
    ///
    /// Returns the speeds published right after the command, which no
    /// damping step can have touched yet.
    pub async fn send_and_wait(&self, command: Command) -> Result<SpeedSnapshot, DriveError> {
        let (applied, done) = oneshot::channel();
        self.commands
            .send(Request {
                code: command.code(),
                applied: Some(applied),
            })
            .map_err(|_| DriveError::Stopped)?;
        done.await.map_err(|_| DriveError::Stopped)
    }

    /// Latest published speeds
    pub fn read_speeds(&self) -> SpeedSnapshot {
        self.speeds.load()
    }

    /// Shared slot for readers that outlive a borrow of the driver
    pub fn speed_slot(&self) -> Arc<SpeedSlot> {
        Arc::clone(&self.speeds)
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Halt, stop the loop and wait for it; surfaces any actuator failure
    pub async fn quit(self) -> Result<(), DriveError> {
        // The loop may already be gone after a failure; its result is what matters
        let _ = self.send(Command::Quit);
        self.task.await?
    }
}
