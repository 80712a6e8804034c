use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use log::{error, info, LevelFilter};
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use std::{path::PathBuf, process::ExitCode, time::Duration};
use us_stim::{
    channels, install_signal_handlers, resolve_driver, Conf, CpalPlayer, Interrupt,
    MaskFailurePolicy, Outcome, Session, SessionConfig, TriggerError, TriggerSender,
};

#[derive(Parser, Debug)]
#[command(name = "us-stim", version)]
#[command(about = "Continuous ultrasound pulsing with optional audio mask")]
struct Cli {
    /// More console output (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a stimulation session.
    Run(RunArgs),
    /// Send one pulse through a Biosemi USB trigger interface.
    Biosemi(BiosemiArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// TOML file with session defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Connect to AWG hardware (default = mock mode).
    #[arg(long)]
    real: bool,

    /// Serial device of the AWG.
    #[arg(long)]
    port: Option<PathBuf>,

    /// Do NOT play the audio mask.
    #[arg(long, conflicts_with = "mask")]
    no_mask: bool,

    /// WAV file for the audio mask.
    #[arg(long)]
    mask: Option<PathBuf>,

    /// Keep going unmasked if the mask cannot be played.
    #[arg(long)]
    allow_unmasked: bool,

    /// Directory for TSV logs.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Total stimulus duration (s).
    #[arg(long, allow_negative_numbers = true)]
    duration: Option<f64>,

    /// Carrier frequency (kHz).
    #[arg(long, allow_negative_numbers = true)]
    freq: Option<f64>,

    /// Driving voltage (mVpp).
    #[arg(long, allow_negative_numbers = true)]
    vpp: Option<f64>,

    /// Duty cycle (0-1).
    #[arg(long, allow_negative_numbers = true)]
    duty: Option<f64>,

    /// Pulse repetition frequency (Hz).
    #[arg(long, allow_negative_numbers = true)]
    prf: Option<f64>,
}

impl RunArgs {
    fn apply(&self, config: &mut SessionConfig) {
        if self.real {
            config.mock_hardware = false;
        }
        if let Some(port) = &self.port {
            config.awg_port = Some(port.clone());
        }
        if let Some(mask) = &self.mask {
            config.audio_mask_path = Some(mask.clone());
            config.mask_enabled = true;
        }
        if self.no_mask {
            config.mask_enabled = false;
        }
        if self.allow_unmasked {
            config.mask_failure_policy = MaskFailurePolicy::Continue;
        }
        if let Some(dir) = &self.log_dir {
            config.log_directory = dir.clone();
        }
        if let Some(v) = self.duration {
            config.total_exposure_seconds = v;
        }
        if let Some(v) = self.freq {
            config.carrier_frequency_khz = v;
        }
        if let Some(v) = self.vpp {
            config.drive_voltage_mvpp = v;
        }
        if let Some(v) = self.duty {
            config.duty_cycle = v;
        }
        if let Some(v) = self.prf {
            config.prf_hz = v;
        }
    }
}

#[derive(Args, Debug)]
struct BiosemiArgs {
    /// Serial device of the trigger interface.
    #[arg(long)]
    port: PathBuf,

    /// Trigger byte; bit 0 is line 1.
    #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
    byte: i64,

    /// Settling time after opening the port (s).
    #[arg(long, default_value_t = 3.0)]
    delay: f64,

    /// Write the pulse from a worker thread and wait for it to finish.
    #[arg(long)]
    detached: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Command::Run(args) => run_stimulus(args),
        Command::Biosemi(args) => run_biosemi(args),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    if TermLogger::init(
        level,
        simplelog::Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .is_err()
    {
        eprintln!("console logger already initialised");
    }
}

fn run_stimulus(args: RunArgs) -> Result<()> {
    let conf = Conf::load(args.config.as_deref()).context("failed to load configuration")?;
    let mut config = SessionConfig::from(conf);
    args.apply(&mut config);
    let config = config.validate()?;

    install_signal_handlers().context("failed to install signal handlers")?;
    let driver = resolve_driver(&config);
    let mask_enabled = config.mask_enabled;
    let mut session = Session::new(config, driver).with_interrupt(Interrupt::watching_signals());
    if mask_enabled {
        session = session.with_player(Box::new(CpalPlayer::new()));
    }

    let report = session.run()?;
    match report.outcome {
        Outcome::Completed => info!(
            "{} bursts in {:.1}s, session log {}",
            report.triggers,
            report.elapsed.as_secs_f64(),
            report.log_path.display()
        ),
        Outcome::Interrupted => info!(
            "Stopped after {} bursts, session log {}",
            report.triggers,
            report.log_path.display()
        ),
    }
    if report.trigger_errors > 0 {
        info!("{} triggers failed and were skipped", report.trigger_errors);
    }
    Ok(())
}

fn run_biosemi(args: BiosemiArgs) -> Result<()> {
    let byte = u8::try_from(args.byte).map_err(|_| TriggerError::OutOfRange(args.byte))?;
    let delay = Duration::try_from_secs_f64(args.delay).context("invalid --delay")?;
    let mut sender = TriggerSender::open(&args.port, delay)
        .with_context(|| format!("failed to open {}", args.port.display()))?;
    if args.detached {
        let handle = sender.send_detached(byte)?;
        return match handle.join() {
            Ok(result) => {
                result.with_context(|| format!("no pulse reached {}", sender.name()))?;
                info!("Pulse sent to trigger lines {:?}", channels(byte));
                Ok(())
            }
            Err(_) => bail!("trigger worker for {} panicked", sender.name()),
        };
    }
    if !sender.test_connection(byte) {
        bail!("no pulse reached {}", sender.name());
    }
    Ok(())
}
