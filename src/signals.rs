//! Termination signal subscriptions.
//!
//! Each supervised run owns a [`SignalSubscription`]. OS signals are caught once per
//! process by a `sigaction` handler that writes the signal number to a self-pipe; a
//! forwarder thread fans every byte out to the live subscriptions. Tests build an
//! in-memory subscription with [`SignalSubscription::channel`] instead.
use std::{
    fs::File,
    io::{self, Read},
    os::fd::FromRawFd,
    sync::{
        Mutex, OnceLock, PoisonError,
        atomic::{AtomicI32, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
    },
    thread,
    time::Duration,
};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use strum_macros::{AsRefStr, Display};
use tracing::{debug, warn};

use crate::error::SupervisorError;

/// Signals relayed to the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum TerminationSignal {
    Hangup,
    Interrupt,
    Terminate,
    /// Relayed when requested explicitly; the OS never lets the supervisor catch it.
    Kill,
}

impl TerminationSignal {
    pub fn as_signal(self) -> Signal {
        match self {
            TerminationSignal::Hangup => Signal::SIGHUP,
            TerminationSignal::Interrupt => Signal::SIGINT,
            TerminationSignal::Terminate => Signal::SIGTERM,
            TerminationSignal::Kill => Signal::SIGKILL,
        }
    }

    fn from_raw(raw: i32) -> Option<Self> {
        match Signal::try_from(raw).ok()? {
            Signal::SIGHUP => Some(TerminationSignal::Hangup),
            Signal::SIGINT => Some(TerminationSignal::Interrupt),
            Signal::SIGTERM => Some(TerminationSignal::Terminate),
            Signal::SIGKILL => Some(TerminationSignal::Kill),
            _ => None,
        }
    }
}

/// Signals the OS handler is installed for.
const CAUGHT: [Signal; 3] = [Signal::SIGHUP, Signal::SIGINT, Signal::SIGTERM];

static PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);
static SUBSCRIBERS: Mutex<Vec<Sender<TerminationSignal>>> = Mutex::new(Vec::new());
static INSTALLED: OnceLock<Result<(), nix::errno::Errno>> = OnceLock::new();

extern "C" fn on_signal(signal: libc::c_int) {
    let fd = PIPE_WRITE.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signal as u8;
        unsafe {
            libc::write(fd, (&byte as *const u8).cast(), 1);
        }
    }
}

fn install() -> Result<(), nix::errno::Errno> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(nix::errno::Errno::last());
    }
    for fd in fds {
        unsafe {
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }
    let [read_fd, write_fd] = fds;
    PIPE_WRITE.store(write_fd, Ordering::Relaxed);

    let reader = unsafe { File::from_raw_fd(read_fd) };
    thread::Builder::new()
        .name("cradle-signals".into())
        .spawn(move || forward(reader))
        .map_err(|err| {
            nix::errno::Errno::from_raw(err.raw_os_error().unwrap_or(libc::EAGAIN))
        })?;

    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in CAUGHT {
        unsafe { sigaction(signal, &action) }?;
    }
    debug!("Installed handlers for {CAUGHT:?}");
    Ok(())
}

fn forward(mut reader: File) {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return,
            Ok(_) => {
                let Some(signal) = TerminationSignal::from_raw(i32::from(byte[0])) else {
                    continue;
                };
                debug!("Received {signal}");
                let mut subscribers = SUBSCRIBERS.lock().unwrap_or_else(PoisonError::into_inner);
                subscribers.retain(|subscriber| subscriber.send(signal).is_ok());
                if subscribers.is_empty() {
                    warn!("{signal} received with no supervised process to relay it to");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!("Signal forwarder stopped: {err}");
                return;
            }
        }
    }
}

/// Feeds signals into a subscription made by [`SignalSubscription::channel`].
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: Sender<TerminationSignal>,
}

impl SignalSender {
    /// Returns `false` once the subscription is gone.
    pub fn send(&self, signal: TerminationSignal) -> bool {
        self.tx.send(signal).is_ok()
    }
}

/// Termination signals delivered to one supervised run.
#[derive(Debug)]
pub struct SignalSubscription {
    rx: Receiver<TerminationSignal>,
}

impl SignalSubscription {
    /// Subscribes to SIGHUP, SIGINT and SIGTERM of the current process.
    ///
    /// Handlers are installed on first use; from then on these signals no longer
    /// terminate the supervisor itself.
    pub fn os() -> Result<Self, SupervisorError> {
        if let Err(errno) = INSTALLED.get_or_init(install) {
            return Err(SupervisorError::Signal(io::Error::from(*errno)));
        }
        let (tx, rx) = mpsc::channel();
        SUBSCRIBERS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        Ok(Self { rx })
    }

    /// A subscription fed only by the returned sender.
    pub fn channel() -> (SignalSender, Self) {
        let (tx, rx) = mpsc::channel();
        (SignalSender { tx }, Self { rx })
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<TerminationSignal, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}
