use crate::{
    AwgDriver, DriverError, EventLog, SessionConfig, TriggerSchedule, UploadParams,
    MODE_TRIGGERED_BURST,
};
use log::{info, warn};
use std::{io, time::Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwState {
    Closed,
    Open,
    Configured,
    Triggering,
}

#[derive(thiserror::Error, Debug)]
pub enum HardwareError {
    #[error("connection error: {0}")]
    Connection(#[source] DriverError),
    #[error("configuration error: AWG parameter upload returned status {status}")]
    Configuration { status: i32 },
    #[error("configuration error: AWG parameter upload failed: {0}")]
    Upload(#[source] DriverError),
    #[error("connection error: link lost while triggering: {0}")]
    LinkLost(#[source] DriverError),
    #[error("trigger failed: {0}")]
    Trigger(#[source] DriverError),
    #[error("cannot {operation} the AWG while it is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: HwState,
    },
    #[error("event log write failed: {0}")]
    Log(#[from] io::Error),
}

impl HardwareError {
    /// Only a single failed trigger lets the session carry on.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, HardwareError::Trigger(_))
    }
}

/// Sole owner of the AWG for one session.
///
/// `Closed → Open → Configured → Triggering* → Closed`. Whatever happens, a
/// generator that was opened gets an explicit output-off before the link is
/// released, because its internal burst loop keeps firing otherwise. `close`
/// covers the normal paths and `Drop` covers unwinding.
pub struct HardwareController {
    driver: Option<Box<dyn AwgDriver>>,
    unavailable: Option<DriverError>,
    mock: bool,
    state: HwState,
    open_attempted: bool,
    connected: bool,
    released: bool,
    carrier_khz: f64,
    mvpp: f64,
    prf_hz: f64,
    duty_cycle: f64,
    uploaded: Option<UploadParams>,
    triggers: u64,
}

impl HardwareController {
    /// `driver` is the capability resolved at startup; an `Err` is kept and
    /// reported by [`HardwareController::open`].
    pub fn new(config: &SessionConfig, driver: Result<Box<dyn AwgDriver>, DriverError>) -> Self {
        let (driver, unavailable) = match driver {
            Ok(driver) => (Some(driver), None),
            Err(e) => (None, Some(e)),
        };
        Self {
            mock: driver.as_ref().is_some_and(|d| d.is_mock()),
            driver,
            unavailable,
            state: HwState::Closed,
            open_attempted: false,
            connected: false,
            released: false,
            carrier_khz: config.carrier_frequency_khz,
            mvpp: config.drive_voltage_mvpp,
            prf_hz: config.prf_hz,
            duty_cycle: config.duty_cycle,
            uploaded: None,
            triggers: 0,
        }
    }

    pub fn state(&self) -> HwState {
        self.state
    }

    pub fn uploaded(&self) -> Option<&UploadParams> {
        self.uploaded.as_ref()
    }

    pub fn triggers(&self) -> u64 {
        self.triggers
    }

    fn event(&self, name: &str) -> String {
        if self.mock {
            format!("{name}_mock")
        } else {
            name.to_string()
        }
    }

    pub fn open(&mut self, log: &mut EventLog) -> Result<(), HardwareError> {
        if self.state != HwState::Closed || self.released {
            return Err(HardwareError::InvalidState {
                operation: "open",
                state: self.state,
            });
        }
        let Some(driver) = self.driver.as_mut() else {
            let err = self
                .unavailable
                .take()
                .unwrap_or_else(|| DriverError::Unavailable("driver missing".to_string()));
            log.log("awg_open_failed", &err.to_string())?;
            return Err(HardwareError::Connection(err));
        };

        self.open_attempted = true;
        info!("Opening AWG connection{}...", if self.mock { " (mock)" } else { "" });
        if let Err(e) = driver.connect() {
            log.log("awg_open_failed", &e.to_string())?;
            return Err(HardwareError::Connection(e));
        }
        self.connected = true;
        self.state = HwState::Open;
        log.log(&self.event("awg_open"), "")?;
        Ok(())
    }

    /// Uploads the whole parameter set in one call. A negative status aborts
    /// the session before any trigger.
    pub fn configure(
        &mut self,
        schedule: &TriggerSchedule,
        log: &mut EventLog,
    ) -> Result<(), HardwareError> {
        if !matches!(self.state, HwState::Open | HwState::Configured) {
            return Err(HardwareError::InvalidState {
                operation: "configure",
                state: self.state,
            });
        }
        let params = UploadParams {
            carrier_khz: self.carrier_khz,
            mode: MODE_TRIGGERED_BURST,
            mvpp: self.mvpp,
            burst_ms: schedule.burst_milliseconds(),
            prf_khz: self.prf_hz / 1000.0,
            duty_cycle: self.duty_cycle,
        };
        info!(
            "Uploading US parameters: carrier {} kHz, {} mVpp, burst {} ms, PRF {} Hz, duty {:.1}%",
            params.carrier_khz,
            params.mvpp,
            params.burst_ms,
            self.prf_hz,
            params.duty_cycle * 100.0
        );
        let event = self.event("awg_upload");
        let driver = self.driver.as_mut().ok_or(HardwareError::InvalidState {
            operation: "configure",
            state: self.state,
        })?;

        let status = match driver.upload_parameters(&params) {
            Ok(status) => status,
            Err(e) => {
                log.log(&event, &format!("success=false error={e}"))?;
                return Err(if e.is_link_lost() {
                    HardwareError::Connection(e)
                } else {
                    HardwareError::Upload(e)
                });
            }
        };
        info!("AWG upload returned code {status}");
        log.log(
            &event,
            &format!(
                "success={} status={status} burst_ms={}",
                status >= 0,
                params.burst_ms
            ),
        )?;
        if status < 0 {
            return Err(HardwareError::Configuration { status });
        }
        self.uploaded = Some(params);
        self.state = HwState::Configured;
        Ok(())
    }

    /// One firing pulse. Timing is the caller's business. Returns the
    /// round-trip latency of the driver call.
    pub fn trigger(&mut self, log: &mut EventLog) -> Result<f64, HardwareError> {
        if !matches!(self.state, HwState::Configured | HwState::Triggering) {
            return Err(HardwareError::InvalidState {
                operation: "trigger",
                state: self.state,
            });
        }
        let event = self.event("ultrasound_trigger");
        let driver = self.driver.as_mut().ok_or(HardwareError::InvalidState {
            operation: "trigger",
            state: self.state,
        })?;

        let t0 = Instant::now();
        let result = driver.trigger();
        let latency_ms = t0.elapsed().as_secs_f64() * 1e3;
        self.state = HwState::Triggering;
        match result {
            Ok(()) => {
                self.triggers += 1;
                log.log(&event, &format!("latency_ms={latency_ms:.1}"))?;
                Ok(latency_ms)
            }
            Err(e) if e.is_link_lost() => {
                log.log("ultrasound_trigger_error", &format!("fatal=true {e}"))?;
                Err(HardwareError::LinkLost(e))
            }
            Err(e) => {
                log.log("ultrasound_trigger_error", &format!("fatal=false {e}"))?;
                Err(HardwareError::Trigger(e))
            }
        }
    }

    /// Output off, then release the link. Safe to call any number of times and
    /// after a failed `open`; only the first call after an open attempt talks
    /// to the device.
    pub fn close(&mut self, log: &mut EventLog) -> Result<(), HardwareError> {
        let mock = self.mock;
        let outcome = self.power_down();
        self.state = HwState::Closed;
        let Some(outcome) = outcome else {
            return Ok(());
        };

        match &outcome.output_off {
            Ok(()) => log.log("awg_output_off", "")?,
            Err(e) => {
                warn!("AWG output-off failed: {e}");
                log.log("awg_output_off_error", &e.to_string())?;
            }
        }
        if let Some(disconnect) = &outcome.disconnect {
            let name = if mock { "awg_close_mock" } else { "awg_close" };
            match disconnect {
                Ok(()) => log.log(name, "")?,
                Err(e) => {
                    warn!("AWG disconnect failed: {e}");
                    log.log("awg_close_error", &e.to_string())?;
                }
            }
        }
        outcome.output_off.map_err(HardwareError::Connection)
    }

    fn power_down(&mut self) -> Option<PowerDown> {
        if self.released || !self.open_attempted {
            self.released = true;
            return None;
        }
        self.released = true;
        let driver = self.driver.as_mut()?;
        info!("Turning off AWG output...");
        let output_off = driver.output_off();
        let disconnect = if self.connected {
            self.connected = false;
            info!("Closing AWG connection...");
            Some(driver.disconnect())
        } else {
            None
        };
        Some(PowerDown {
            output_off,
            disconnect,
        })
    }
}

struct PowerDown {
    output_off: Result<(), DriverError>,
    disconnect: Option<Result<(), DriverError>>,
}

impl Drop for HardwareController {
    fn drop(&mut self) {
        if let Some(outcome) = self.power_down() {
            warn!("AWG released without close(); output turned off during drop");
            if let Err(e) = outcome.output_off {
                warn!("AWG output-off failed during drop: {e}");
            }
        }
    }
}
