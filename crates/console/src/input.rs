//! Input injection through an external emulator process
//!
//! Requests are single lines written to the helper's stdin; each one is
//! answered by exactly one line on its stdout, `ok` on success.

use dutlink_common::{Error, ProcessHandle, ResolvedCommand, Result};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::process::{ChildStdin, ChildStdout, Stdio};
use tracing::{debug, trace};

const ACK: &str = "ok\n";

/// Mouse buttons held down
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MouseButtons {
    pub left: bool,
    pub right: bool,
    pub middle: bool,
}

impl MouseButtons {
    pub const NONE: MouseButtons = MouseButtons {
        left: false,
        right: false,
        middle: false,
    };

    /// Bit mask understood by the input emulator: left=1, right=2, middle=4.
    ///
    /// Not the RFB pointer encoding, which puts middle before right.
    pub fn mask(&self) -> u8 {
        (self.left as u8) | (self.right as u8) << 1 | (self.middle as u8) << 2
    }
}

/// Duplex line channel to the input emulator
#[derive(Debug)]
pub struct InputChannel {
    process: ProcessHandle,
    writer: ChildStdin,
    feedback: BufReader<ChildStdout>,
    command: String,
    mouse: (i32, i32),
}

impl InputChannel {
    pub fn spawn(cmd: &ResolvedCommand) -> Result<Self> {
        let command = cmd.display();
        let mut process_cmd = cmd.to_command();
        process_cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut process = ProcessHandle::spawn("input", process_cmd)?;
        let writer = process
            .take_stdin()
            .ok_or_else(|| Error::execution(command.clone(), "stdin not captured"))?;
        let feedback = process
            .take_stdout()
            .ok_or_else(|| Error::execution(command.clone(), "stdout not captured"))?;

        debug!("Input channel ready: {}", command);
        Ok(Self {
            process,
            writer,
            feedback: BufReader::new(feedback),
            command,
            mouse: (-1, -1),
        })
    }

    /// Last acknowledged pointer position, `(-1, -1)` until the first move
    pub fn mouse_position(&self) -> (i32, i32) {
        self.mouse
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    fn request(&mut self, line: &str) -> Result<()> {
        if line.contains('\n') {
            return Err(Error::Console(format!(
                "input request may not contain a newline: {:?}",
                line
            )));
        }
        trace!("input <- {}", line);
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;

        let mut response = String::new();
        self.feedback.read_line(&mut response)?;
        trace!("input -> {:?}", response);
        if response != ACK {
            return Err(Error::Protocol(format!(
                "{}: unexpected response {:?} to '{}'",
                self.command, response, line
            )));
        }
        Ok(())
    }

    pub fn send_key(&mut self, key: &str) -> Result<()> {
        self.request(key)
    }

    pub fn type_string(&mut self, text: &str) -> Result<()> {
        self.request(&format!("type {}", text))
    }

    /// Move the pointer; the tracked position only changes once acknowledged
    pub fn mouse_move(&mut self, x: i32, y: i32) -> Result<()> {
        self.request(&format!("mouse_move {} {}", x, y))?;
        self.mouse = (x, y);
        Ok(())
    }

    pub fn mouse_button(&mut self, buttons: MouseButtons) -> Result<()> {
        self.request(&format!("mouse_button {}", buttons.mask()))
    }

    /// Stop the emulator process
    pub fn close(mut self) -> Result<()> {
        self.process.terminate()?;
        Ok(())
    }
}
