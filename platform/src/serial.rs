// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Serial ports used to reach the BMC console.

use nix::errno::Errno;
use nix::sys::termios;
use nix::sys::termios::BaudRate;
use nix::sys::termios::ControlFlags;
use nix::sys::termios::FlushArg;
use nix::sys::termios::InputFlags;
use nix::sys::termios::SetArg;
use nix::sys::termios::SpecialCharacterIndices;
use nix::sys::termios::Termios;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::path::PathBuf;
use thiserror::Error;

/// An error on the serial session with the BMC.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to open serial port {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to configure serial port: {0}")]
    Configure(Errno),

    #[error("Unsupported baud rate: {0}")]
    BaudRate(u32),

    #[error("No login prompt after {0} attempts")]
    Login(u32),

    #[error("No shell prompt after {0} attempts")]
    Timeout(u32),

    #[error("Serial I/O failed")]
    Io(#[from] std::io::Error),
}

/// An open serial port.
pub trait SerialPort: Send {
    /// Apply raw 8N1 settings at `baud_rate`, saving the previous settings
    /// to be restored when the port is dropped.
    fn configure(&mut self, baud_rate: u32) -> Result<(), SessionError>;

    /// Read whatever is available, returning 0 if nothing is.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SessionError>;

    fn write_all(&mut self, data: &[u8]) -> Result<(), SessionError>;

    /// Discard anything received but not yet read.
    fn flush_input(&mut self) -> Result<(), SessionError>;
}

/// Something which opens a serial port, once per session.
pub trait SerialOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn SerialPort>, SessionError>;
}

fn baud_rate(rate: u32) -> Result<BaudRate, SessionError> {
    match rate {
        9600 => Ok(BaudRate::B9600),
        19200 => Ok(BaudRate::B19200),
        38400 => Ok(BaudRate::B38400),
        57600 => Ok(BaudRate::B57600),
        115200 => Ok(BaudRate::B115200),
        other => Err(SessionError::BaudRate(other)),
    }
}

/// Opens a TTY device node, without making it the controlling terminal.
#[derive(Clone, Debug)]
pub struct TtyOpener {
    path: PathBuf,
}

impl TtyOpener {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SerialOpener for TtyOpener {
    fn open(&self) -> Result<Box<dyn SerialPort>, SessionError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(nix::libc::O_NOCTTY | nix::libc::O_NONBLOCK)
            .open(&self.path)
            .map_err(|source| SessionError::Open {
                path: self.path.clone(),
                source,
            })?;
        Ok(Box::new(TtyPort { file, saved: None }))
    }
}

/// A TTY opened non-blocking.
#[derive(Debug)]
pub struct TtyPort {
    file: File,
    saved: Option<Termios>,
}

impl SerialPort for TtyPort {
    fn configure(&mut self, rate: u32) -> Result<(), SessionError> {
        let speed = baud_rate(rate)?;
        let saved = termios::tcgetattr(&self.file).map_err(SessionError::Configure)?;
        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        raw.control_flags |= ControlFlags::CS8 | ControlFlags::CLOCAL | ControlFlags::CREAD;
        raw.input_flags |= InputFlags::IGNPAR;
        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        termios::cfsetspeed(&mut raw, speed).map_err(SessionError::Configure)?;
        termios::tcsetattr(&self.file, SetArg::TCSANOW, &raw).map_err(SessionError::Configure)?;
        if self.saved.is_none() {
            self.saved = Some(saved);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SessionError> {
        match self.file.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(SessionError::Io(e)),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.file.write_all(data)?;
        Ok(())
    }

    fn flush_input(&mut self) -> Result<(), SessionError> {
        termios::tcflush(&self.file, FlushArg::TCIFLUSH).map_err(SessionError::Configure)
    }
}

impl Drop for TtyPort {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            let _ = termios::tcsetattr(&self.file, SetArg::TCSANOW, &saved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SerialOpener;
    use super::SerialPort;
    use super::SessionError;
    use super::TtyOpener;
    use nix::errno::Errno;

    #[test]
    fn test_open_missing_port() {
        let dir = tempfile::tempdir().unwrap();
        let opener = TtyOpener::new(dir.path().join("ttyS1"));
        assert!(matches!(opener.open(), Err(SessionError::Open { .. })));
    }

    #[test]
    fn test_configure_regular_file_is_not_a_tty() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut port = TtyOpener::new(file.path()).open().unwrap();
        assert!(matches!(
            port.configure(57600),
            Err(SessionError::Configure(Errno::ENOTTY))
        ));
    }

    #[test]
    fn test_unsupported_baud_rate() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut port = TtyOpener::new(file.path()).open().unwrap();
        assert!(matches!(
            port.configure(12345),
            Err(SessionError::BaudRate(12345))
        ));
    }

    #[test]
    fn test_write_plain_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut port = TtyOpener::new(file.path()).open().unwrap();
        port.write_all(b"@bmc:~# ").unwrap();
        assert_eq!(std::fs::read(file.path()).unwrap(), b"@bmc:~# ");
    }
}
