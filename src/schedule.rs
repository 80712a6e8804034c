use crate::SessionConfig;

/// Timing derived from PRF and duty cycle. Never stored in the config; always
/// recomputed from it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerSchedule {
    period_s: f64,
    burst_ms: u64,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error(
    "duty cycle {duty_cycle} at {prf_hz} Hz gives a {burst_ms:.3} ms burst, under 1 ms. \
     Increase the duty cycle or lower the PRF."
)]
pub struct BurstTooShort {
    pub prf_hz: f64,
    pub duty_cycle: f64,
    pub burst_ms: f64,
}

impl TriggerSchedule {
    /// `burst_ms = floor(1000 / prf_hz * duty_cycle)`; anything flooring to
    /// zero is rejected.
    pub fn new(prf_hz: f64, duty_cycle: f64) -> Result<Self, BurstTooShort> {
        let period_s = 1.0 / prf_hz;
        let exact_ms = 1000.0 / prf_hz * duty_cycle;
        let burst_ms = exact_ms.floor();
        if !(burst_ms >= 1.0) || !burst_ms.is_finite() {
            return Err(BurstTooShort {
                prf_hz,
                duty_cycle,
                burst_ms: exact_ms,
            });
        }
        Ok(Self {
            period_s,
            burst_ms: burst_ms as u64,
        })
    }

    pub fn for_config(config: &SessionConfig) -> Result<Self, BurstTooShort> {
        Self::new(config.prf_hz, config.duty_cycle)
    }

    pub fn period_seconds(&self) -> f64 {
        self.period_s
    }

    pub fn burst_milliseconds(&self) -> u64 {
        self.burst_ms
    }

    /// Silence between the end of one burst and the next trigger. Zero for a
    /// full duty cycle; flooring the burst keeps it from going negative.
    pub fn gap_milliseconds(&self) -> f64 {
        (self.period_s * 1000.0 - self.burst_ms as f64).max(0.0)
    }

    /// Deadlines that fall inside `[0, total_s)`, i.e. the triggers a full run
    /// fires. A deadline landing on the end itself (within 1e-9 of a period)
    /// belongs to the next run.
    pub fn expected_triggers(&self, total_s: f64) -> u64 {
        (total_s / self.period_s - 1e-9).ceil().max(0.0) as u64
    }

    /// Spacing of console progress lines: a tenth of the run, at least 1 s.
    pub fn progress_interval(total_s: f64) -> f64 {
        (total_s / 10.0).max(1.0)
    }
}
