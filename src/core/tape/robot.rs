//! Tape robot command executors
//!
//! Slot numbers passed to a robot are the library's own, starting at 1.
//! Drive numbers start at 0.

use crate::core::config::LibraryConfig;
use crate::core::tape::inventory::{parse_status, StatusDump};
use crate::error::{Result, SumsError};
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

/// Robot command executor trait
pub trait RobotExecutor: Send {
    /// Full status listing
    fn status(&mut self) -> Result<String>;

    /// Move the tape in `slot` into `drive`
    fn load(&mut self, slot: usize, drive: usize) -> Result<()>;

    /// Move the tape in `drive` into `slot`
    fn unload(&mut self, slot: usize, drive: usize) -> Result<()>;

    /// Move the tape in slot `from` into slot `to`
    fn transfer(&mut self, from: usize, to: usize) -> Result<()>;
}

/// Drives a real library through `mtx`
#[derive(Debug, Clone)]
pub struct MtxRobot {
    mtx_path: PathBuf,
    device: String,
}

impl MtxRobot {
    pub fn new(config: &LibraryConfig) -> Self {
        MtxRobot {
            mtx_path: config.mtx_path.clone(),
            device: config.device.clone(),
        }
    }

    fn run(&self, args: &[String]) -> Result<String> {
        let command = format!(
            "{} -f {} {}",
            self.mtx_path.display(),
            self.device,
            args.join(" ")
        );
        tracing::info!("*Rb:cmd: {}", command);

        let output = Command::new(&self.mtx_path)
            .arg("-f")
            .arg(&self.device)
            .args(args)
            .output()?;

        if !output.status.success() {
            tracing::error!(
                "***Rb:failure: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Err(SumsError::RobotCommand {
                command,
                status: output.status.code().unwrap_or(-1),
            });
        }
        tracing::info!("***Rb:success");
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl RobotExecutor for MtxRobot {
    fn status(&mut self) -> Result<String> {
        self.run(&["status".to_string()])
    }

    fn load(&mut self, slot: usize, drive: usize) -> Result<()> {
        self.run(&["load".to_string(), slot.to_string(), drive.to_string()])
            .map(|_| ())
    }

    fn unload(&mut self, slot: usize, drive: usize) -> Result<()> {
        self.run(&["unload".to_string(), slot.to_string(), drive.to_string()])
            .map(|_| ())
    }

    fn transfer(&mut self, from: usize, to: usize) -> Result<()> {
        self.run(&["transfer".to_string(), from.to_string(), to.to_string()])
            .map(|_| ())
    }
}

/// Simulated library
///
/// Starts from a saved status listing, applies moves to its own copy of the
/// occupancy and sleeps for each move.
#[derive(Debug, Clone)]
pub struct SimulatedRobot {
    device: String,
    state: StatusDump,
    move_delay: Duration,
}

impl SimulatedRobot {
    /// Simulate the library described by `status_text`
    pub fn from_status(status_text: &str, move_delay: Duration) -> Self {
        SimulatedRobot {
            device: "/dev/sim".to_string(),
            state: parse_status(status_text),
            move_delay,
        }
    }

    /// Simulate the library saved in the configured status dump
    pub fn new(config: &LibraryConfig) -> Result<Self> {
        let text = std::fs::read_to_string(&config.simulated_status_dump).map_err(|e| {
            SumsError::Inventory(format!(
                "can't open {}: {}",
                config.simulated_status_dump.display(),
                e
            ))
        })?;
        let mut robot = Self::from_status(&text, Duration::from_secs(config.move_sleep_secs));
        robot.device = config.device.clone();
        Ok(robot)
    }

    /// Current simulated occupancy
    pub fn state(&self) -> &StatusDump {
        &self.state
    }

    fn pause(&self) {
        if !self.move_delay.is_zero() {
            std::thread::sleep(self.move_delay);
        }
    }

    fn slot_index(&self, slot: usize) -> Result<usize> {
        if slot == 0 || slot > self.state.slots.len() {
            return Err(SumsError::RobotCommand {
                command: format!("slot {}", slot),
                status: 1,
            });
        }
        Ok(slot - 1)
    }

    fn drive_index(&self, drive: usize) -> Result<usize> {
        if drive >= self.state.drives.len() {
            return Err(SumsError::RobotCommand {
                command: format!("drive {}", drive),
                status: 1,
            });
        }
        Ok(drive)
    }
}

impl RobotExecutor for SimulatedRobot {
    fn status(&mut self) -> Result<String> {
        Ok(self.state.render(&self.device))
    }

    fn load(&mut self, slot: usize, drive: usize) -> Result<()> {
        let s = self.slot_index(slot)?;
        let d = self.drive_index(drive)?;
        tracing::info!("*Rb:cmd: sim load {} {}", slot, drive);
        self.pause();
        if self.state.drives[d].is_some() || self.state.slots[s].tape_id.is_none() {
            return Err(SumsError::RobotCommand {
                command: format!("load {} {}", slot, drive),
                status: 1,
            });
        }
        self.state.drives[d] = self.state.slots[s].tape_id.take();
        Ok(())
    }

    fn unload(&mut self, slot: usize, drive: usize) -> Result<()> {
        let s = self.slot_index(slot)?;
        let d = self.drive_index(drive)?;
        tracing::info!("*Rb:cmd: sim unload {} {}", slot, drive);
        self.pause();
        if self.state.drives[d].is_none() || self.state.slots[s].tape_id.is_some() {
            return Err(SumsError::RobotCommand {
                command: format!("unload {} {}", slot, drive),
                status: 1,
            });
        }
        self.state.slots[s].tape_id = self.state.drives[d].take();
        Ok(())
    }

    fn transfer(&mut self, from: usize, to: usize) -> Result<()> {
        let a = self.slot_index(from)?;
        let b = self.slot_index(to)?;
        tracing::info!("*Rb:cmd: sim transfer {} {}", from, to);
        self.pause();
        if self.state.slots[a].tape_id.is_none() || self.state.slots[b].tape_id.is_some() {
            return Err(SumsError::RobotCommand {
                command: format!("transfer {} {}", from, to),
                status: 1,
            });
        }
        self.state.slots[b].tape_id = self.state.slots[a].tape_id.take();
        Ok(())
    }
}
