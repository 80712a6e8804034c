use crate::serial::{open_serial, DEFAULT_BAUD};
use log::info;
use std::{
    fs::File,
    io::Write,
    path::Path,
    thread::{self, JoinHandle},
    time::Duration,
};

#[derive(thiserror::Error, Debug)]
pub enum TriggerError {
    #[error("trigger value {0} is outside 0..=255")]
    OutOfRange(i64),
    #[error("trigger interface I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Biosemi USB trigger interface. Each byte written raises the matching
/// output lines for one short pulse; bit 0 is trigger 1.
pub struct TriggerSender<W: Write> {
    port: W,
    name: String,
}

impl TriggerSender<File> {
    /// Opens the interface and waits `initial_delay` for it to settle; some
    /// adapters drop bytes written right after the port opens.
    pub fn open(port: &Path, initial_delay: Duration) -> Result<Self, TriggerError> {
        let file = open_serial(port, DEFAULT_BAUD)?;
        if !initial_delay.is_zero() {
            thread::sleep(initial_delay);
        }
        Ok(Self::new(file, port.display().to_string()))
    }

    /// Writes `byte` from a worker thread so the caller never waits on the
    /// port. Join the handle to learn whether the pulse went out.
    pub fn send_detached(
        &self,
        byte: u8,
    ) -> Result<JoinHandle<Result<(), TriggerError>>, TriggerError> {
        let mut port = self.port.try_clone()?;
        Ok(thread::spawn(move || {
            port.write_all(&[byte])?;
            port.flush()?;
            Ok(())
        }))
    }
}

impl<W: Write> TriggerSender<W> {
    pub fn new(port: W, name: impl Into<String>) -> Self {
        Self {
            port,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn send(&mut self, byte: u8) -> Result<(), TriggerError> {
        self.port.write_all(&[byte])?;
        self.port.flush()?;
        Ok(())
    }

    /// Like [`TriggerSender::send`] for values that are not yet known to fit a byte.
    pub fn send_value(&mut self, value: i64) -> Result<(), TriggerError> {
        let byte = u8::try_from(value).map_err(|_| TriggerError::OutOfRange(value))?;
        self.send(byte)
    }

    /// Sends one pulse and reports whether it went out.
    pub fn test_connection(&mut self, byte: u8) -> bool {
        match self.send(byte) {
            Ok(()) => {
                info!(
                    "Pulse sent to trigger lines {:?} at {}",
                    channels(byte),
                    self.name
                );
                true
            }
            Err(e) => {
                log::error!("Trigger connection test failed: {e}");
                false
            }
        }
    }

    pub fn into_inner(self) -> W {
        self.port
    }
}

/// Trigger lines (1-based) a byte activates.
pub fn channels(byte: u8) -> Vec<u8> {
    (0..8).filter(|bit| byte & (1 << bit) != 0).map(|bit| bit + 1).collect()
}
