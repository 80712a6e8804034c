use std::time::Duration;
use us_stim::{
    read_log, AwgCall, MaskFailurePolicy, MockAwg, Outcome, Session, SessionConfig,
    LOG_FORMAT_VERSION,
};

fn short_config(log_directory: &std::path::Path) -> SessionConfig {
    SessionConfig {
        carrier_frequency_khz: 265.0,
        drive_voltage_mvpp: 250.0,
        duty_cycle: 0.1,
        prf_hz: 20.0,
        total_exposure_seconds: 0.5,
        audio_mask_path: None,
        mask_enabled: false,
        mask_failure_policy: MaskFailurePolicy::Abort,
        log_directory: log_directory.to_path_buf(),
        mock_hardware: true,
        awg_port: None,
        poll_interval: Duration::from_millis(1),
    }
}

#[test]
fn real_time_mock_session_writes_a_complete_log() {
    let dir = tempfile::tempdir().unwrap();
    let awg = MockAwg::new();
    let journal = awg.journal();
    let report = Session::from_config(short_config(dir.path()), Ok(Box::new(awg)))
        .unwrap()
        .run()
        .unwrap();

    assert_eq!(report.outcome, Outcome::Completed);
    assert!((9..=10).contains(&report.triggers), "{} triggers", report.triggers);
    assert!(report.elapsed >= Duration::from_millis(500));
    assert!(report.elapsed < Duration::from_secs(2));

    let log = read_log(&report.log_path).unwrap();
    assert_eq!(log.version, LOG_FORMAT_VERSION);
    assert!(log.parameters.contains("prf_hz=20"));
    assert!(log.records[0].elapsed < 0.05);
    let count: u64 = log.events("burst_count").next().unwrap().details.parse().unwrap();
    assert_eq!(count, report.triggers);
    assert_eq!(log.events("trigger").count() as u64, report.triggers);
    assert_eq!(log.records.last().unwrap().event, "quit");

    let calls = journal.calls();
    assert_eq!(calls.first(), Some(&AwgCall::Connect));
    assert_eq!(
        &calls[calls.len() - 2..],
        &[AwgCall::OutputOff, AwgCall::Disconnect]
    );
}

#[test]
fn missing_mask_file_is_rejected_up_front() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = short_config(&dir.path().join("logs"));
    config.mask_enabled = true;
    config.audio_mask_path = Some(dir.path().join("missing.wav"));
    config.prf_hz = -1.0;

    let err = config.validate().unwrap_err();
    assert_eq!(err.violations.len(), 2);
    let message = err.to_string();
    assert!(message.starts_with("invalid configuration:\n- "));
    assert!(message.contains("missing.wav"));
    assert!(!dir.path().join("logs").exists());
}
