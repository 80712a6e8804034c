use crate::{Clock, SessionConfig};
use log::debug;
use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use time::{macros::format_description, OffsetDateTime};

pub const LOG_FORMAT_VERSION: u32 = 2;
const COLUMNS: [&str; 3] = ["time", "event", "details"];

/// Append-only, tab-separated record of one session.
///
/// Layout:
///
/// ```text
/// VERSION=2; DATE=2025-06-01 14:03:22.123456
/// time	event	details
/// # carrier_frequency_khz=265; ...
/// 0.000	session_start	burst_ms=20 period_s=0.200000
/// ```
///
/// Every record is flushed as soon as it is written so the file is complete up
/// to the last event even if the process dies.
pub struct EventLog {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    clock: Arc<dyn Clock>,
    start: Duration,
    records: usize,
}

impl EventLog {
    /// Creates `log-<start timestamp>.tsv` in the configured log directory and
    /// writes the header. Elapsed times count from this call.
    pub fn create(config: &SessionConfig, clock: Arc<dyn Clock>) -> io::Result<Self> {
        fs::create_dir_all(&config.log_directory)?;
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let stamp = now
            .format(format_description!(
                "[year]-[month]-[day]-[hour].[minute].[second]"
            ))
            .map_err(io::Error::other)?;
        let date = now
            .format(format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]"
            ))
            .map_err(io::Error::other)?;

        let (path, file) = create_unique(&config.log_directory, &stamp)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "VERSION={LOG_FORMAT_VERSION}; DATE={date}")?;
        writeln!(writer, "{}", COLUMNS.join("\t"))?;
        writeln!(writer, "# {}", config.parameter_dump())?;
        writer.flush()?;
        debug!("Session log created at {}", path.display());

        let start = clock.now();
        Ok(Self {
            path,
            writer: Some(writer),
            clock,
            start,
            records: 0,
        })
    }

    pub fn log(&mut self, event: &str, details: &str) -> io::Result<()> {
        let elapsed = self.elapsed().as_secs_f64();
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::other("event log already closed"))?;
        writeln!(
            writer,
            "{elapsed:.3}\t{}\t{}",
            sanitize(event),
            sanitize(details)
        )?;
        writer.flush()?;
        self.records += 1;
        Ok(())
    }

    /// Time since the log was created, on the session clock.
    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_sub(self.start)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> usize {
        self.records
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }

    /// Flushes and syncs the file. Later calls are no-ops.
    pub fn close(&mut self) -> io::Result<()> {
        if let Some(writer) = self.writer.take() {
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        Ok(())
    }
}

fn create_unique(dir: &Path, stamp: &str) -> io::Result<(PathBuf, File)> {
    let mut suffix = 0;
    loop {
        let name = if suffix == 0 {
            format!("log-{stamp}.tsv")
        } else {
            format!("log-{stamp}-{suffix}.tsv")
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
            Err(e) => return Err(e),
        }
    }
}

// Tabs and newlines would break the column layout.
fn sanitize(field: &str) -> String {
    field.replace(['\t', '\n', '\r'], " ")
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub elapsed: f64,
    pub event: String,
    pub details: String,
}

/// A session log file read back for auditing.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionLog {
    pub version: u32,
    pub date: String,
    pub parameters: String,
    pub records: Vec<LogRecord>,
}

impl SessionLog {
    pub fn events<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a LogRecord> + 'a {
        self.records.iter().filter(move |r| r.event == name)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LogReadError {
    #[error("failed to read session log: {0}")]
    Io(#[from] io::Error),
    #[error("malformed session log at line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

pub fn read_log(path: &Path) -> Result<SessionLog, LogReadError> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = reader.lines();
    let malformed = |line: usize, reason: &str| LogReadError::Malformed {
        line,
        reason: reason.to_string(),
    };

    let header = lines.next().ok_or_else(|| malformed(1, "empty file"))??;
    let (version, date) = header
        .strip_prefix("VERSION=")
        .and_then(|rest| rest.split_once("; DATE="))
        .ok_or_else(|| malformed(1, "missing VERSION/DATE header"))?;
    let version = version
        .parse::<u32>()
        .map_err(|_| malformed(1, "version is not a number"))?;

    let columns = lines.next().ok_or_else(|| malformed(2, "missing column line"))??;
    if columns != COLUMNS.join("\t") {
        return Err(malformed(2, "unexpected column names"));
    }

    let params = lines.next().ok_or_else(|| malformed(3, "missing parameter dump"))??;
    let parameters = params
        .strip_prefix("# ")
        .ok_or_else(|| malformed(3, "parameter dump must start with '# '"))?
        .to_string();

    let mut records = Vec::new();
    for (i, line) in lines.enumerate() {
        let line_no = i + 4;
        let line = line?;
        let mut fields = line.splitn(3, '\t');
        let elapsed = fields
            .next()
            .and_then(|t| t.parse::<f64>().ok())
            .ok_or_else(|| malformed(line_no, "bad elapsed time"))?;
        let event = fields
            .next()
            .ok_or_else(|| malformed(line_no, "missing event name"))?
            .to_string();
        let details = fields.next().unwrap_or_default().to_string();
        records.push(LogRecord {
            elapsed,
            event,
            details,
        });
    }

    Ok(SessionLog {
        version,
        date: date.to_string(),
        parameters,
        records,
    })
}
