// Keyboard teleop: arrows move/turn, space straightens, h halts, t stops gradually, q quits
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use std::time::Duration;
use tracing::{info, warn};

use crate::messages::{Command, ControlInput};
use crate::runtime::Driver;
use crate::stream::Streamer;

const KEY_POLL: Duration = Duration::from_millis(20);

pub fn command_for_key(code: KeyCode) -> Option<Command> {
    match code {
        KeyCode::Up => Some(Command::Advance),
        KeyCode::Down => Some(Command::Reverse),
        KeyCode::Left => Some(Command::TurnLeft),
        KeyCode::Right => Some(Command::TurnRight),
        KeyCode::Char(' ') => Some(Command::Straighten),
        KeyCode::Char('h') => Some(Command::Halt),
        KeyCode::Char('t') => Some(Command::StopGradual),
        KeyCode::Char('q') | KeyCode::Esc => Some(Command::Quit),
        _ => None,
    }
}

/// Read keys until quit, forwarding commands to the driver and, when
/// streaming, the resulting inputs to the streamer. Leaves quitting the
/// driver to the caller.
pub async fn run_teleop(
    driver: &Driver,
    streamer: Option<&Streamer>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Controls: arrows=move/turn, space=straighten, h=halt, t=gradual stop, q=quit");

    enable_raw_mode()?;
    let result = key_loop(driver, streamer).await;
    disable_raw_mode()?;

    result
}

async fn key_loop(
    driver: &Driver,
    streamer: Option<&Streamer>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        if !driver.is_running() {
            warn!("Control loop stopped, leaving teleop");
            return Ok(());
        }

        if !event::poll(KEY_POLL)? {
            tokio::task::yield_now().await;
            continue;
        }
        let Event::Key(KeyEvent { code, kind, .. }) = event::read()? else {
            continue;
        };
        if kind == KeyEventKind::Release {
            continue;
        }
        let Some(command) = command_for_key(code) else {
            continue;
        };
        if command == Command::Quit {
            return Ok(());
        }

        // the recorded speeds are the ones this command produced
        let speeds = driver.send_and_wait(command).await?;

        if let Some(streamer) = streamer {
            if !streamer.record(ControlInput::now(command, speeds)) {
                warn!("Streamer is gone, input not recorded");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_mapping() {
        assert_eq!(command_for_key(KeyCode::Up), Some(Command::Advance));
        assert_eq!(command_for_key(KeyCode::Down), Some(Command::Reverse));
        assert_eq!(command_for_key(KeyCode::Left), Some(Command::TurnLeft));
        assert_eq!(command_for_key(KeyCode::Right), Some(Command::TurnRight));
        assert_eq!(command_for_key(KeyCode::Char(' ')), Some(Command::Straighten));
        assert_eq!(command_for_key(KeyCode::Char('h')), Some(Command::Halt));
        assert_eq!(command_for_key(KeyCode::Char('t')), Some(Command::StopGradual));
        assert_eq!(command_for_key(KeyCode::Esc), Some(Command::Quit));
        assert_eq!(command_for_key(KeyCode::Char('x')), None);
    }
}
