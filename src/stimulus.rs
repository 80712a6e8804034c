use crate::{
    AudioError, AudioMask, AwgDriver, BurstTooShort, Clock, ConfigError, Deadline, DriverError,
    EventLog, HardwareController, HardwareError, Interrupt, MaskFailurePolicy, MaskPlayer,
    MonotonicClock, Pacer, SessionConfig, TriggerSchedule, ValidatedConfig,
};
use log::{info, warn};
use std::{io, path::PathBuf, sync::Arc, time::Duration};

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    BurstTooShort(#[from] BurstTooShort),
    #[error(transparent)]
    Hardware(#[from] HardwareError),
    #[error("audio mask failed: {0}")]
    Audio(#[from] AudioError),
    #[error("event log failed: {0}")]
    Log(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub outcome: Outcome,
    /// Triggers the generator accepted.
    pub triggers: u64,
    /// Triggers that failed without losing the link.
    pub trigger_errors: u64,
    pub progress_reports: u64,
    /// Time spent in the pulsing loop.
    pub elapsed: Duration,
    pub log_path: PathBuf,
}

/// One stimulation run: acquire the log, the generator and the mask, pulse on
/// absolute deadlines until the exposure time is used up, then release
/// everything in reverse order.
pub struct Session {
    config: ValidatedConfig,
    driver: Result<Box<dyn AwgDriver>, DriverError>,
    player: Option<Box<dyn MaskPlayer>>,
    clock: Arc<dyn Clock>,
    interrupt: Interrupt,
}

impl Session {
    pub fn new(config: ValidatedConfig, driver: Result<Box<dyn AwgDriver>, DriverError>) -> Self {
        Self {
            config,
            driver,
            player: None,
            clock: Arc::new(MonotonicClock::new()),
            interrupt: Interrupt::new(),
        }
    }

    /// Validates `config` first; nothing is created when it is invalid.
    pub fn from_config(
        config: SessionConfig,
        driver: Result<Box<dyn AwgDriver>, DriverError>,
    ) -> Result<Self, SessionError> {
        Ok(Self::new(config.validate()?, driver))
    }

    pub fn with_player(mut self, player: Box<dyn MaskPlayer>) -> Self {
        self.player = Some(player);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn run(self) -> Result<SessionReport, SessionError> {
        let Session {
            config,
            driver,
            player,
            clock,
            interrupt,
        } = self;

        // Before anything is created: a rejected burst leaves no trace.
        let schedule = TriggerSchedule::for_config(&config)?;

        let log = EventLog::create(&config, Arc::clone(&clock))?;
        let hardware = HardwareController::new(&config, driver);
        let mut stage = Stage {
            log,
            hardware,
            mask: None,
        };

        let result = stage.acquire(&config, &schedule, player).and_then(|()| {
            stage.pulse(&config, &schedule, clock.as_ref(), &interrupt)
        });
        let log_path = stage.log.path().to_path_buf();
        let teardown = stage.teardown();

        match (result, teardown) {
            (Ok(stats), Ok(())) => Ok(SessionReport {
                outcome: stats.outcome,
                triggers: stats.triggers,
                trigger_errors: stats.trigger_errors,
                progress_reports: stats.progress_reports,
                elapsed: stats.elapsed,
                log_path,
            }),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), _) => Err(e),
        }
    }
}

struct LoopStats {
    outcome: Outcome,
    triggers: u64,
    trigger_errors: u64,
    progress_reports: u64,
    elapsed: Duration,
}

/// Resources held by a running session, in acquisition order.
struct Stage {
    log: EventLog,
    hardware: HardwareController,
    mask: Option<AudioMask>,
}

impl Stage {
    fn acquire(
        &mut self,
        config: &SessionConfig,
        schedule: &TriggerSchedule,
        player: Option<Box<dyn MaskPlayer>>,
    ) -> Result<(), SessionError> {
        self.log.log(
            "session_start",
            &format!(
                "burst_ms={} period_s={:.6} gap_ms={:.3} expected_triggers={}",
                schedule.burst_milliseconds(),
                schedule.period_seconds(),
                schedule.gap_milliseconds(),
                schedule.expected_triggers(config.total_exposure_seconds),
            ),
        )?;
        self.hardware.open(&mut self.log)?;
        self.hardware.configure(schedule, &mut self.log)?;

        if !config.mask_enabled {
            info!("Audio mask disabled");
            return Ok(());
        }
        let started = match (player, config.audio_mask_path.as_ref()) {
            (Some(player), Some(path)) => {
                let mut mask = AudioMask::new(path, player);
                match mask.start(&mut self.log) {
                    Ok(()) => Ok(mask),
                    Err(e) => {
                        // releases whatever the failed start managed to load
                        let _ = mask.stop(&mut self.log);
                        Err(e)
                    }
                }
            }
            _ => Err(AudioError::NoPlayer),
        };
        match started {
            Ok(mask) => self.mask = Some(mask),
            Err(e) => match config.mask_failure_policy {
                MaskFailurePolicy::Abort => return Err(e.into()),
                MaskFailurePolicy::Continue => {
                    warn!("Audio mask unavailable, continuing unmasked: {e}");
                    self.log.log("mask_disabled", &e.to_string())?;
                }
            },
        }
        Ok(())
    }

    fn pulse(
        &mut self,
        config: &SessionConfig,
        schedule: &TriggerSchedule,
        clock: &dyn Clock,
        interrupt: &Interrupt,
    ) -> Result<LoopStats, SessionError> {
        let total_s = config.total_exposure_seconds;
        let expected = schedule.expected_triggers(total_s);
        let pacer = Pacer::new(clock, config.poll_interval);

        info!("Starting continuous pulsing protocol ({total_s}s)");
        let start = pacer.now();
        let end = start + Duration::from_secs_f64(total_s);
        let mut next_trigger = Deadline::starting_at(start, schedule.period_seconds());
        let mut next_progress =
            Deadline::first_after(start, TriggerSchedule::progress_interval(total_s));
        let mut stats = LoopStats {
            outcome: Outcome::Completed,
            triggers: 0,
            trigger_errors: 0,
            progress_reports: 0,
            elapsed: Duration::ZERO,
        };

        loop {
            if interrupt.is_raised() {
                info!("Aborted by user, cleaning up...");
                self.log
                    .log("interrupted", &format!("after {} bursts", stats.triggers))?;
                stats.outcome = Outcome::Interrupted;
                break;
            }
            let now = pacer.now();
            if now >= end {
                break;
            }
            let elapsed_s = (now - start).as_secs_f64();

            if next_trigger.is_due(now) && next_trigger.index() < expected {
                match self.hardware.trigger(&mut self.log) {
                    Ok(_) => {
                        stats.triggers += 1;
                        self.log.log(
                            "trigger",
                            &format!("#{} @ {elapsed_s:.3}s", stats.triggers),
                        )?;
                    }
                    Err(e) if !e.is_fatal() => {
                        stats.trigger_errors += 1;
                        warn!("Trigger #{} failed: {e}", next_trigger.index() + 1);
                    }
                    Err(e) => return Err(e.into()),
                }
                next_trigger.advance();
            }

            if next_progress.is_due(now) {
                info!(
                    "Progress: {elapsed_s:.1}/{total_s}s ({:.0}%), {} bursts",
                    elapsed_s / total_s * 100.0,
                    stats.triggers
                );
                stats.progress_reports += 1;
                next_progress.advance();
            }

            if let Some(mask) = self.mask.as_mut() {
                for error in mask.drain_errors() {
                    warn!("Audio mask playback error: {error}");
                    self.log.log("mask_error", &error)?;
                }
            }

            let wake = if next_trigger.index() < expected {
                next_trigger.at().min(next_progress.at())
            } else {
                next_progress.at()
            };
            pacer.wait_until(wake.min(end));
        }

        stats.elapsed = pacer.now().saturating_sub(start);
        if stats.outcome == Outcome::Completed {
            info!("Completed {} bursts in {total_s}s", stats.triggers);
            self.log.log("burst_count", &stats.triggers.to_string())?;
            info!("Protocol complete, exiting.");
        }
        Ok(stats)
    }

    /// Mask, then generator, then the log. Consumes the stage so it can only
    /// happen once; a failure in one step does not skip the next.
    fn teardown(mut self) -> Result<(), SessionError> {
        let mut first: Option<SessionError> = None;
        if let Some(mut mask) = self.mask.take() {
            if let Err(e) = mask.stop(&mut self.log) {
                warn!("Audio mask teardown failed: {e}");
                first.get_or_insert(e.into());
            }
        }
        if let Err(e) = self.hardware.close(&mut self.log) {
            warn!("AWG teardown failed: {e}");
            first.get_or_insert(e.into());
        }
        if let Err(e) = self.log.log("quit", "") {
            warn!("Could not record session end: {e}");
            first.get_or_insert(e.into());
        }
        if let Err(e) = self.log.close() {
            warn!("Could not close session log: {e}");
            first.get_or_insert(e.into());
        }
        first.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::testing::FakePlayer, config::test_config, read_log, timer::testing::ManualClock,
        AwgCall, CallJournal, MockAwg, SessionLog,
    };
    use std::{
        panic::{self, AssertUnwindSafe},
        path::Path,
    };

    fn mock_session(
        config: SessionConfig,
        awg: MockAwg,
        clock: Arc<ManualClock>,
    ) -> (Session, CallJournal) {
        let journal = awg.journal();
        let session = Session::new(config.validate().unwrap(), Ok(Box::new(awg))).with_clock(clock);
        (session, journal)
    }

    fn trigger_times(log: &SessionLog) -> Vec<(u64, f64)> {
        log.events("trigger")
            .map(|r| {
                let (n, t) = r.details.split_once(" @ ").unwrap();
                let n = n.trim_start_matches('#').parse().unwrap();
                let t = t.trim_end_matches('s').parse().unwrap();
                (n, t)
            })
            .collect()
    }

    fn assert_closed_once(journal: &CallJournal) {
        let calls = journal.calls();
        assert_eq!(journal.count(&AwgCall::OutputOff), 1);
        assert_eq!(journal.count(&AwgCall::Disconnect), 1);
        let off = calls.iter().position(|c| *c == AwgCall::OutputOff).unwrap();
        let disc = calls.iter().position(|c| *c == AwgCall::Disconnect).unwrap();
        assert!(off < disc, "output-off must precede disconnect: {calls:?}");
        assert_eq!(calls.last(), Some(&AwgCall::Disconnect));
    }

    fn write_mask(dir: &Path) -> PathBuf {
        let path = dir.join("mask.wav");
        std::fs::write(&path, b"RIFF").unwrap();
        path
    }

    #[test]
    fn standard_protocol_fires_400_bursts() {
        let dir = tempfile::tempdir().unwrap();
        let (session, journal) =
            mock_session(test_config(dir.path()), MockAwg::new(), Arc::new(ManualClock::new()));
        let report = session.run().unwrap();

        assert_eq!(report.outcome, Outcome::Completed);
        assert_eq!(report.triggers, 400);
        assert_eq!(report.trigger_errors, 0);
        assert_eq!(report.progress_reports, 9);
        assert_eq!(report.elapsed, Duration::from_secs(80));
        assert_eq!(journal.count(&AwgCall::Trigger), 400);
        assert_closed_once(&journal);

        let log = read_log(&report.log_path).unwrap();
        let first = &log.records[0];
        assert_eq!(first.event, "session_start");
        assert_eq!(first.elapsed, 0.0);
        assert!(first.details.contains("burst_ms=20"));
        assert_eq!(log.events("burst_count").next().unwrap().details, "400");
        assert_eq!(log.records.last().unwrap().event, "quit");
        assert!(log.records.windows(2).all(|w| w[0].elapsed <= w[1].elapsed));
        let events: Vec<&str> = log.records.iter().map(|r| r.event.as_str()).collect();
        let tail = &events[events.len() - 4..];
        assert_eq!(tail, ["burst_count", "awg_output_off", "awg_close_mock", "quit"]);
    }

    #[test]
    fn late_wakeups_do_not_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new().with_overshoot(Duration::from_micros(700)));
        let (session, _journal) = mock_session(test_config(dir.path()), MockAwg::new(), clock);
        let report = session.run().unwrap();
        assert_eq!(report.triggers, 400);

        let log = read_log(&report.log_path).unwrap();
        let times = trigger_times(&log);
        assert_eq!(times.len(), 400);
        for (n, t) in times {
            let ideal = (n - 1) as f64 * 0.2;
            let error = t - ideal;
            assert!(
                (-0.0005..=0.0025).contains(&error),
                "trigger #{n} at {t} s, ideal {ideal} s"
            );
        }
    }

    #[test]
    fn triggers_follow_the_period() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.prf_hz = 3.0;
        config.duty_cycle = 0.5;
        config.total_exposure_seconds = 10.0;
        let (session, _journal) = mock_session(config, MockAwg::new(), Arc::new(ManualClock::new()));
        let report = session.run().unwrap();
        assert_eq!(report.triggers, 30);
        assert_eq!(report.progress_reports, 9);

        let log = read_log(&report.log_path).unwrap();
        for (n, t) in trigger_times(&log) {
            assert!((t - (n - 1) as f64 / 3.0).abs() < 0.001, "trigger #{n} at {t} s");
        }
    }

    #[test]
    fn deadline_inside_a_partial_last_period_fires() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.prf_hz = 1.0;
        config.total_exposure_seconds = 2.5;
        let (session, journal) = mock_session(config, MockAwg::new(), Arc::new(ManualClock::new()));
        let report = session.run().unwrap();

        assert_eq!(report.triggers, 3);
        assert_eq!(journal.count(&AwgCall::Trigger), 3);
        assert_eq!(report.elapsed, Duration::from_millis(2500));
        let log = read_log(&report.log_path).unwrap();
        let times: Vec<f64> = trigger_times(&log).into_iter().map(|(_, t)| t).collect();
        assert_eq!(times, [0.0, 1.0, 2.0]);
        assert!(log.records[0].details.contains("expected_triggers=3"));
    }

    #[test]
    fn overlong_exposure_is_rejected_before_the_generator_opens() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.total_exposure_seconds = 1e20;
        let awg = MockAwg::new();
        let journal = awg.journal();
        let result = Session::from_config(config, Ok(Box::new(awg)));
        assert!(matches!(result, Err(SessionError::Config(_))));
        assert!(journal.calls().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn soft_trigger_errors_keep_the_session_going() {
        let dir = tempfile::tempdir().unwrap();
        let (session, journal) = mock_session(
            test_config(dir.path()),
            MockAwg::new().failing_triggers([3, 7]),
            Arc::new(ManualClock::new()),
        );
        let report = session.run().unwrap();
        assert_eq!(report.outcome, Outcome::Completed);
        assert_eq!(report.triggers, 398);
        assert_eq!(report.trigger_errors, 2);
        assert_eq!(journal.count(&AwgCall::Trigger), 400);
        assert_closed_once(&journal);

        let log = read_log(&report.log_path).unwrap();
        assert_eq!(log.events("ultrasound_trigger_error").count(), 2);
        assert_eq!(log.events("burst_count").next().unwrap().details, "398");
    }

    #[test]
    fn lost_link_aborts_with_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let (session, journal) = mock_session(
            test_config(dir.path()),
            MockAwg::new().losing_link_at(10),
            Arc::new(ManualClock::new()),
        );
        let err = session.run().unwrap_err();
        assert!(matches!(
            err,
            SessionError::Hardware(HardwareError::LinkLost(_))
        ));
        assert_eq!(journal.count(&AwgCall::Trigger), 10);
        assert_closed_once(&journal);

        let path = std::fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap().path();
        let log = read_log(&path).unwrap();
        assert_eq!(log.events("burst_count").count(), 0);
        assert_eq!(log.records.last().unwrap().event, "quit");
    }

    #[test]
    fn interrupt_stops_within_a_poll_interval() {
        let dir = tempfile::tempdir().unwrap();
        let interrupt = Interrupt::new();
        let clock = Arc::new(
            ManualClock::new().with_interrupt_at(Duration::from_millis(10_050), interrupt.clone()),
        );
        let (session, journal) = mock_session(test_config(dir.path()), MockAwg::new(), clock);
        let report = session.with_interrupt(interrupt).run().unwrap();

        assert_eq!(report.outcome, Outcome::Interrupted);
        assert_eq!(report.triggers, 51);
        assert!(report.elapsed <= Duration::from_millis(10_051));
        assert_closed_once(&journal);

        let log = read_log(&report.log_path).unwrap();
        assert_eq!(log.events("interrupted").count(), 1);
        assert_eq!(log.events("burst_count").count(), 0);
        assert_eq!(log.records.last().unwrap().event, "quit");
    }

    #[test]
    fn sub_millisecond_burst_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.prf_hz = 2000.0;
        let (session, journal) = mock_session(config, MockAwg::new(), Arc::new(ManualClock::new()));
        assert!(matches!(session.run(), Err(SessionError::BurstTooShort(_))));
        assert!(journal.calls().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn invalid_config_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.prf_hz = 0.0;
        config.duty_cycle = 1.5;
        let awg = MockAwg::new();
        let journal = awg.journal();
        let Err(SessionError::Config(err)) = Session::from_config(config, Ok(Box::new(awg))) else {
            panic!("invalid config accepted");
        };
        assert_eq!(err.violations.len(), 2);
        assert!(journal.calls().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn failed_open_still_logs_quit() {
        let dir = tempfile::tempdir().unwrap();
        let (session, journal) = mock_session(
            test_config(dir.path()),
            MockAwg::new().failing_connect(),
            Arc::new(ManualClock::new()),
        );
        let err = session.run().unwrap_err();
        assert!(matches!(err, SessionError::Hardware(HardwareError::Connection(_))));
        assert_eq!(journal.count(&AwgCall::OutputOff), 1);
        assert_eq!(journal.count(&AwgCall::Disconnect), 0);

        let path = std::fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap().path();
        let events: Vec<String> = read_log(&path)
            .unwrap()
            .records
            .into_iter()
            .map(|r| r.event)
            .collect();
        assert_eq!(
            events,
            ["session_start", "awg_open_failed", "awg_output_off", "quit"]
        );
    }

    #[test]
    fn mask_runs_for_the_whole_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.mask_enabled = true;
        config.audio_mask_path = Some(write_mask(dir.path()));
        config.total_exposure_seconds = 2.0;
        let player = FakePlayer {
            pending_errors: vec!["buffer underrun".to_string()],
            ..Default::default()
        };
        let calls = player.calls();
        let (session, journal) = mock_session(config, MockAwg::new(), Arc::new(ManualClock::new()));
        let report = session.with_player(Box::new(player)).run().unwrap();

        assert_eq!(*calls.lock().unwrap(), ["load", "play", "stop", "release"]);
        assert_closed_once(&journal);
        let log = read_log(&report.log_path).unwrap();
        let events: Vec<&str> = log.records.iter().map(|r| r.event.as_str()).collect();
        let start = events.iter().position(|e| *e == "mask_start").unwrap();
        let upload = events.iter().position(|e| *e == "awg_upload_mock").unwrap();
        let stop = events.iter().position(|e| *e == "mask_stop").unwrap();
        let off = events.iter().position(|e| *e == "awg_output_off").unwrap();
        assert!(upload < start && stop < off);
        assert_eq!(log.events("mask_error").next().unwrap().details, "buffer underrun");
    }

    #[test]
    fn mask_failure_aborts_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.mask_enabled = true;
        config.audio_mask_path = Some(write_mask(dir.path()));
        let player = FakePlayer {
            fail_load: true,
            ..Default::default()
        };
        let (session, journal) = mock_session(config, MockAwg::new(), Arc::new(ManualClock::new()));
        let err = session.with_player(Box::new(player)).run().unwrap_err();
        assert!(matches!(err, SessionError::Audio(_)));
        assert_eq!(journal.count(&AwgCall::Trigger), 0);
        assert_closed_once(&journal);
    }

    #[test]
    fn mask_failure_can_be_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.mask_enabled = true;
        config.audio_mask_path = Some(write_mask(dir.path()));
        config.mask_failure_policy = MaskFailurePolicy::Continue;
        config.total_exposure_seconds = 1.0;
        let player = FakePlayer {
            fail_load: true,
            ..Default::default()
        };
        let (session, journal) = mock_session(config, MockAwg::new(), Arc::new(ManualClock::new()));
        let report = session.with_player(Box::new(player)).run().unwrap();
        assert_eq!(report.triggers, 5);
        assert_closed_once(&journal);
        let log = read_log(&report.log_path).unwrap();
        assert_eq!(log.events("mask_disabled").count(), 1);
        assert_eq!(log.events("mask_stop").count(), 0);
    }

    struct PanickingPlayer;

    impl MaskPlayer for PanickingPlayer {
        fn load(&mut self, _path: &Path) -> Result<(), AudioError> {
            Ok(())
        }

        fn play_looping(&mut self) -> Result<(), AudioError> {
            panic!("audio backend exploded");
        }

        fn stop(&mut self) -> Result<(), AudioError> {
            Ok(())
        }

        fn release(&mut self) {}
    }

    #[test]
    fn unwinding_still_powers_down_the_generator() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.mask_enabled = true;
        config.audio_mask_path = Some(write_mask(dir.path()));
        let (session, journal) = mock_session(config, MockAwg::new(), Arc::new(ManualClock::new()));
        let session = session.with_player(Box::new(PanickingPlayer));

        let result = panic::catch_unwind(AssertUnwindSafe(|| session.run()));
        assert!(result.is_err());
        assert_closed_once(&journal);
    }
}
