use crate::{
    serial::{open_serial, DEFAULT_BAUD},
    SessionConfig,
};
use std::{
    collections::HashSet,
    io::{self, BufRead, BufReader, Read, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
};

/// Burst mode code for a manually triggered burst of a sine carrier.
pub const MODE_TRIGGERED_BURST: u8 = 1;

/// One atomic parameter set uploaded to the generator before triggering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UploadParams {
    pub carrier_khz: f64,
    pub mode: u8,
    pub mvpp: f64,
    pub burst_ms: u64,
    pub prf_khz: f64,
    pub duty_cycle: f64,
}

#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    #[error("AWG driver unavailable: {0}")]
    Unavailable(String),
    #[error("AWG link lost: {0}")]
    LinkLost(String),
    #[error("AWG not connected")]
    NotConnected,
    #[error("AWG protocol error: {0}")]
    Protocol(String),
    #[error("AWG I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DriverError {
    /// Whether the physical link is gone, as opposed to a single failed command.
    pub fn is_link_lost(&self) -> bool {
        match self {
            DriverError::LinkLost(_) | DriverError::NotConnected => true,
            DriverError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Capability surface of the waveform generator. Exactly one owner talks to
/// it for the lifetime of a session.
pub trait AwgDriver: Send {
    fn connect(&mut self) -> Result<(), DriverError>;
    /// Returns the device status code. Negative codes mean the upload failed.
    fn upload_parameters(&mut self, params: &UploadParams) -> Result<i32, DriverError>;
    fn trigger(&mut self) -> Result<(), DriverError>;
    fn output_off(&mut self) -> Result<(), DriverError>;
    fn disconnect(&mut self) -> Result<(), DriverError>;

    fn is_mock(&self) -> bool {
        false
    }
}

/// Picks the driver for this session once, at startup. A real-hardware run
/// without a port yields `Unavailable`, which `open()` later reports as a
/// connection error.
pub fn resolve_driver(config: &SessionConfig) -> Result<Box<dyn AwgDriver>, DriverError> {
    if config.mock_hardware {
        return Ok(Box::new(MockAwg::new()));
    }
    match &config.awg_port {
        Some(port) => Ok(Box::new(ScpiAwg::serial(port.clone()))),
        None => Err(DriverError::Unavailable(
            "no AWG port configured; pass --port or set hardware.port".to_string(),
        )),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AwgCall {
    Connect,
    Upload(UploadParams),
    Trigger,
    OutputOff,
    Disconnect,
}

/// Shared view of the calls a [`MockAwg`] received.
#[derive(Debug, Clone, Default)]
pub struct CallJournal(Arc<Mutex<Vec<AwgCall>>>);

impl CallJournal {
    fn push(&self, call: AwgCall) {
        if let Ok(mut calls) = self.0.lock() {
            calls.push(call);
        }
    }

    pub fn calls(&self) -> Vec<AwgCall> {
        self.0.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn count(&self, call: &AwgCall) -> usize {
        self.calls()
            .iter()
            .filter(|c| std::mem::discriminant(*c) == std::mem::discriminant(call))
            .count()
    }
}

/// Stand-in generator used in mock mode. Records every call and can be told
/// to fail in specific ways.
#[derive(Debug, Default)]
pub struct MockAwg {
    journal: CallJournal,
    connected: bool,
    triggers: usize,
    fail_connect: bool,
    upload_status: i32,
    failing_triggers: HashSet<usize>,
    link_lost_at: Option<usize>,
}

impl MockAwg {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn journal(&self) -> CallJournal {
        self.journal.clone()
    }

    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub fn with_upload_status(mut self, status: i32) -> Self {
        self.upload_status = status;
        self
    }

    /// The given 1-based trigger attempts fail without losing the link.
    pub fn failing_triggers(mut self, attempts: impl IntoIterator<Item = usize>) -> Self {
        self.failing_triggers.extend(attempts);
        self
    }

    /// The link drops on the given 1-based trigger attempt.
    pub fn losing_link_at(mut self, attempt: usize) -> Self {
        self.link_lost_at = Some(attempt);
        self
    }
}

impl AwgDriver for MockAwg {
    fn connect(&mut self) -> Result<(), DriverError> {
        self.journal.push(AwgCall::Connect);
        if self.fail_connect {
            return Err(DriverError::Unavailable("mock link refused".to_string()));
        }
        self.connected = true;
        Ok(())
    }

    fn upload_parameters(&mut self, params: &UploadParams) -> Result<i32, DriverError> {
        self.journal.push(AwgCall::Upload(*params));
        if !self.connected {
            return Err(DriverError::NotConnected);
        }
        Ok(self.upload_status)
    }

    fn trigger(&mut self) -> Result<(), DriverError> {
        self.journal.push(AwgCall::Trigger);
        if !self.connected {
            return Err(DriverError::NotConnected);
        }
        self.triggers += 1;
        if self.link_lost_at == Some(self.triggers) {
            self.connected = false;
            return Err(DriverError::LinkLost("mock link dropped".to_string()));
        }
        if self.failing_triggers.contains(&self.triggers) {
            return Err(DriverError::Protocol("mock trigger rejected".to_string()));
        }
        Ok(())
    }

    fn output_off(&mut self) -> Result<(), DriverError> {
        self.journal.push(AwgCall::OutputOff);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), DriverError> {
        self.journal.push(AwgCall::Disconnect);
        self.connected = false;
        Ok(())
    }

    fn is_mock(&self) -> bool {
        true
    }
}

type Opener<T> = Box<dyn FnMut() -> io::Result<T> + Send>;

/// Line-based SCPI driver for Siglent SDG-series generators on channel 1.
///
/// The generator runs a manually triggered sine burst; each `trigger` is one
/// `MTRIG`. Upload status is the code at the head of the device error queue,
/// where SCPI reports failures as negative numbers.
pub struct ScpiAwg<T: Read + Write + Send> {
    open: Opener<T>,
    port: Option<BufReader<T>>,
}

impl ScpiAwg<std::fs::File> {
    /// Talks to a serial device node at 115200 baud, raw 8N1.
    pub fn serial(path: PathBuf) -> Self {
        Self::new(move || open_serial(&path, DEFAULT_BAUD))
    }
}

impl<T: Read + Write + Send> ScpiAwg<T> {
    pub fn new(open: impl FnMut() -> io::Result<T> + Send + 'static) -> Self {
        Self {
            open: Box::new(open),
            port: None,
        }
    }

    fn port(&mut self) -> Result<&mut BufReader<T>, DriverError> {
        self.port.as_mut().ok_or(DriverError::NotConnected)
    }

    fn send(&mut self, command: &str) -> Result<(), DriverError> {
        let port = self.port()?.get_mut();
        port.write_all(command.as_bytes())?;
        port.write_all(b"\n")?;
        port.flush()?;
        Ok(())
    }

    fn query(&mut self, command: &str) -> Result<String, DriverError> {
        self.send(command)?;
        let mut line = String::new();
        if self.port()?.read_line(&mut line)? == 0 {
            return Err(DriverError::LinkLost(format!("no reply to {command}")));
        }
        Ok(line.trim().to_string())
    }
}

/// Leading integer of an error-queue reply such as `-222,"Data out of range"`.
fn parse_status(reply: &str) -> Result<i32, DriverError> {
    reply
        .split(',')
        .next()
        .map(str::trim)
        .and_then(|code| code.parse::<i32>().ok())
        .ok_or_else(|| DriverError::Protocol(format!("unparseable status reply {reply:?}")))
}

impl<T: Read + Write + Send> AwgDriver for ScpiAwg<T> {
    fn connect(&mut self) -> Result<(), DriverError> {
        let port = (self.open)().map_err(|e| DriverError::Unavailable(e.to_string()))?;
        self.port = Some(BufReader::new(port));
        let id = self.query("*IDN?")?;
        log::info!("AWG identified as {id}");
        Ok(())
    }

    fn upload_parameters(&mut self, params: &UploadParams) -> Result<i32, DriverError> {
        if params.mode != MODE_TRIGGERED_BURST {
            return Err(DriverError::Protocol(format!(
                "unsupported burst mode {}",
                params.mode
            )));
        }
        let carrier_hz = params.carrier_khz * 1000.0;
        let amplitude_v = params.mvpp / 1000.0;
        let period_s = 1.0 / (params.prf_khz * 1000.0);
        let cycles = (params.burst_ms as f64 * params.carrier_khz).round() as u64;

        self.send("C1:OUTP OFF")?;
        self.send(&format!("C1:BSWV WVTP,SINE,FRQ,{carrier_hz}HZ,AMP,{amplitude_v}V"))?;
        self.send(&format!(
            "C1:BTWV STATE,ON,TRSR,MAN,PRD,{period_s}S,GATE_NCYC,NCYC,TIME,{cycles}"
        ))?;
        self.send("C1:OUTP ON")?;
        parse_status(&self.query("SYST:ERR?")?)
    }

    fn trigger(&mut self) -> Result<(), DriverError> {
        self.send("C1:BTWV MTRIG")
    }

    fn output_off(&mut self) -> Result<(), DriverError> {
        self.send("C1:OUTP OFF")
    }

    fn disconnect(&mut self) -> Result<(), DriverError> {
        self.port = None;
        Ok(())
    }
}
