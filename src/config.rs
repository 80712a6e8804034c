use confique::Config;
use serde::Deserialize;
use std::{
    fmt::Write as _,
    ops::Deref,
    path::{Path, PathBuf},
    time::Duration,
};

/// File/env layer of the configuration. Every field has a default so a run
/// needs no file at all; the CLI overrides individual values afterwards.
#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub stimulus: StimulusSettings,
    #[config(nested)]
    pub session: SessionSettings,
    #[config(nested)]
    pub hardware: HardwareSettings,
}

#[derive(Config, Debug, Clone)]
pub struct StimulusSettings {
    #[config(default = 265.0, env = "US_STIM_FREQ_KHZ")]
    pub carrier_khz: f64,
    #[config(default = 250.0, env = "US_STIM_VPP_MV")]
    pub vpp_mv: f64,
    #[config(default = 0.1, env = "US_STIM_DUTY")]
    pub duty_cycle: f64,
    #[config(default = 5.0, env = "US_STIM_PRF_HZ")]
    pub prf_hz: f64,
    #[config(default = 80.0, env = "US_STIM_DURATION_S")]
    pub duration_s: f64,
}

#[derive(Config, Debug, Clone)]
pub struct SessionSettings {
    #[config(default = "out", env = "US_STIM_LOG_DIR")]
    pub log_dir: PathBuf,
    #[config(
        default = "sham_audio_realistic_with_noise/sham_replica_2000Hz.wav",
        env = "US_STIM_MASK"
    )]
    pub mask_file: PathBuf,
    #[config(default = true)]
    pub mask_enabled: bool,
    #[config(default = "abort")]
    pub mask_failure: MaskFailurePolicy,
    #[config(default = 1)]
    pub poll_interval_ms: u64,
}

#[derive(Config, Debug, Clone)]
pub struct HardwareSettings {
    #[config(default = true)]
    pub mock: bool,
    #[config(env = "US_STIM_AWG_PORT")]
    pub port: Option<PathBuf>,
}

/// What the scheduler does when the mask track cannot be loaded or started.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MaskFailurePolicy {
    #[default]
    Abort,
    Continue,
}

impl Conf {
    /// Defaults, then the optional TOML file, then `US_STIM_*` variables.
    pub fn load(file: Option<&Path>) -> Result<Self, confique::Error> {
        let mut builder = Conf::builder().env();
        if let Some(path) = file {
            builder = builder.file(path);
        }
        builder.load()
    }
}

/// All parameters of one stimulation run. Read-only once built.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub carrier_frequency_khz: f64,
    pub drive_voltage_mvpp: f64,
    pub duty_cycle: f64,
    pub prf_hz: f64,
    pub total_exposure_seconds: f64,
    pub audio_mask_path: Option<PathBuf>,
    pub mask_enabled: bool,
    pub mask_failure_policy: MaskFailurePolicy,
    pub log_directory: PathBuf,
    pub mock_hardware: bool,
    pub awg_port: Option<PathBuf>,
    pub poll_interval: Duration,
}

impl From<Conf> for SessionConfig {
    fn from(conf: Conf) -> Self {
        Self {
            carrier_frequency_khz: conf.stimulus.carrier_khz,
            drive_voltage_mvpp: conf.stimulus.vpp_mv,
            duty_cycle: conf.stimulus.duty_cycle,
            prf_hz: conf.stimulus.prf_hz,
            total_exposure_seconds: conf.stimulus.duration_s,
            audio_mask_path: Some(conf.session.mask_file),
            mask_enabled: conf.session.mask_enabled,
            mask_failure_policy: conf.session.mask_failure,
            log_directory: conf.session.log_dir,
            mock_hardware: conf.hardware.mock,
            awg_port: conf.hardware.port,
            poll_interval: Duration::from_millis(conf.session.poll_interval_ms),
        }
    }
}

/// Longest exposure a session accepts: one day.
pub const MAX_EXPOSURE_SECONDS: f64 = 86_400.0;

fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

impl SessionConfig {
    /// Every rule the configuration breaks, in a fixed order. Empty means valid.
    pub fn violations(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !positive(self.prf_hz) {
            errors.push("PRF must be > 0 Hz.".to_string());
        }
        if !(self.duty_cycle > 0.0 && self.duty_cycle <= 1.0) {
            errors.push("Duty cycle must be between 0 (exclusive) and 1.".to_string());
        }
        if !positive(self.total_exposure_seconds) {
            errors.push("Duration must be > 0 seconds.".to_string());
        } else if self.total_exposure_seconds > MAX_EXPOSURE_SECONDS {
            errors.push(format!(
                "Duration must be at most {MAX_EXPOSURE_SECONDS} seconds."
            ));
        }
        if !positive(self.drive_voltage_mvpp) {
            errors.push("Vpp must be > 0 mVpp.".to_string());
        }
        if !positive(self.carrier_frequency_khz) {
            errors.push("Carrier frequency must be > 0 kHz.".to_string());
        }
        if self.poll_interval.is_zero() {
            errors.push("Poll interval must be > 0 ms.".to_string());
        }
        if self.mask_enabled {
            match &self.audio_mask_path {
                None => errors.push(
                    "Audio masking is enabled but no mask file was given. \
                     Pass --mask or --no-mask."
                        .to_string(),
                ),
                Some(path) if !path.is_file() => errors.push(format!(
                    "Audio mask file not found: {}. Render one with the sham audio \
                     generator or pass --mask/--no-mask.",
                    path.display()
                )),
                Some(_) => {}
            }
        }
        errors
    }

    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        let violations = self.violations();
        if violations.is_empty() {
            Ok(ValidatedConfig(self))
        } else {
            Err(ConfigError { violations })
        }
    }

    /// Single-line `key=value` dump written into the session log header.
    pub fn parameter_dump(&self) -> String {
        let mut out = String::new();
        let mask = self
            .audio_mask_path
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "none".to_string());
        let port = self
            .awg_port
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "none".to_string());
        let _ = write!(
            out,
            "carrier_frequency_khz={}; drive_voltage_mvpp={}; duty_cycle={}; prf_hz={}; \
             total_exposure_seconds={}; audio_mask_path={}; mask_enabled={}; \
             mask_failure_policy={:?}; log_directory={}; mock_hardware={}; awg_port={}; \
             poll_interval_ms={}",
            self.carrier_frequency_khz,
            self.drive_voltage_mvpp,
            self.duty_cycle,
            self.prf_hz,
            self.total_exposure_seconds,
            mask,
            self.mask_enabled,
            self.mask_failure_policy,
            self.log_directory.display(),
            self.mock_hardware,
            port,
            self.poll_interval.as_millis(),
        );
        out
    }
}

/// A configuration that passed [`SessionConfig::validate`]. The scheduler
/// only accepts this type.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedConfig(SessionConfig);

impl ValidatedConfig {
    pub fn into_inner(self) -> SessionConfig {
        self.0
    }
}

impl Deref for ValidatedConfig {
    type Target = SessionConfig;

    fn deref(&self) -> &SessionConfig {
        &self.0
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("invalid configuration:\n- {}", .violations.join("\n- "))]
pub struct ConfigError {
    pub violations: Vec<String>,
}

#[cfg(test)]
pub(crate) fn test_config(log_directory: &Path) -> SessionConfig {
    SessionConfig {
        carrier_frequency_khz: 265.0,
        drive_voltage_mvpp: 250.0,
        duty_cycle: 0.1,
        prf_hz: 5.0,
        total_exposure_seconds: 80.0,
        audio_mask_path: None,
        mask_enabled: false,
        mask_failure_policy: MaskFailurePolicy::Abort,
        log_directory: log_directory.to_path_buf(),
        mock_hardware: true,
        awg_port: None,
        poll_interval: Duration::from_millis(1),
    }
}
