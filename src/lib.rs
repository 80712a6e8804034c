pub mod audio;
pub mod awg;
pub mod biosemi;
pub mod config;
pub mod event_log;
pub mod hardware;
pub mod interrupt;
pub mod schedule;
pub mod serial;
pub mod stimulus;
pub mod timer;

pub use audio::{decode_file, AudioError, AudioMask, CpalPlayer, DecodedTrack, MaskPlayer, MaskState};
pub use awg::{
    resolve_driver, AwgCall, AwgDriver, CallJournal, DriverError, MockAwg, ScpiAwg, UploadParams,
    MODE_TRIGGERED_BURST,
};
pub use biosemi::{channels, TriggerError, TriggerSender};
pub use config::{Conf, ConfigError, MaskFailurePolicy, SessionConfig, ValidatedConfig};
pub use event_log::{read_log, EventLog, LogReadError, LogRecord, SessionLog, LOG_FORMAT_VERSION};
pub use hardware::{HardwareController, HardwareError, HwState};
pub use interrupt::{install_signal_handlers, Interrupt};
pub use schedule::{BurstTooShort, TriggerSchedule};
pub use stimulus::{Outcome, Session, SessionError, SessionReport};
pub use timer::{Clock, Deadline, MonotonicClock, Pacer};
