use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

static SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signum: libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

/// Routes SIGINT (and SIGTERM where it exists) to a process-wide flag that
/// [`Interrupt::watching_signals`] handles observe.
pub fn install_signal_handlers() -> io::Result<()> {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    let mut signals = vec![libc::SIGINT];
    #[cfg(unix)]
    signals.push(libc::SIGTERM);

    for signum in signals {
        // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
        let previous = unsafe { libc::signal(signum, handler) };
        if previous == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Operator stop request, polled by the scheduler once per loop iteration.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    raised: Arc<AtomicBool>,
    watch_signals: bool,
}

impl Interrupt {
    /// A handle that is only raised through [`Interrupt::raise`].
    pub fn new() -> Self {
        Default::default()
    }

    /// A handle that is also raised by the handlers from
    /// [`install_signal_handlers`].
    pub fn watching_signals() -> Self {
        Self {
            raised: Arc::new(AtomicBool::new(false)),
            watch_signals: true,
        }
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst) || (self.watch_signals && SIGNALLED.load(Ordering::SeqCst))
    }
}
