//! Lifecycle supervision of the target process.
//!
//! A [`Supervisor`] spawns the child with the composed environment, drains both output
//! pipes into their [`LogMultiplexer`]s, relays termination signals with a grace period,
//! samples resource usage and finally reports a [`ProcessRun`].
use std::{
    io::{self, Read},
    os::{
        fd::{AsRawFd, RawFd},
        unix::process::{CommandExt, ExitStatusExt},
    },
    path::PathBuf,
    process::{Command, ExitStatus, Stdio},
    sync::mpsc::RecvTimeoutError,
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use nix::{sys::signal, unistd::Pid};
use strum_macros::{AsRefStr, Display};
use tracing::{debug, info, warn};

use crate::{
    cancel::CancelToken,
    config::Config,
    env::EnvStore,
    error::SupervisorError,
    logs::{Clock, ConsoleWriter, LogMultiplexer, Severity, StreamKind},
    metrics::{ProcessSampler, SAMPLE_INTERVAL},
    signals::{SignalSubscription, TerminationSignal},
};

/// Time a signalled child gets to exit before it is killed.
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Granularity at which the signal relay notices cancellation.
const RELAY_POLL: Duration = Duration::from_millis(100);

/// Time output keeps being drained once the child has been reaped.
///
/// A background grandchild can inherit the pipes and keep them open long after the
/// child exits.
pub const DRAIN_GRACE: Duration = Duration::from_millis(500);
const PIPE_POLL: Duration = Duration::from_millis(100);

/// Lifecycle of a supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display)]
pub enum RunState {
    Idle,
    Starting,
    Running,
    /// The child exited on its own.
    Completed,
    /// The child ended after a relayed termination signal.
    Killed,
    /// The child could not be started.
    Failed,
}

/// Accounting of one finished run.
#[derive(Debug, Clone)]
pub struct ProcessRun {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pid: u32,
    pub working_dir: PathBuf,
    pub command: String,
    pub args: Vec<String>,
    pub state: RunState,
    pub status: ExitStatus,
    pub wall_clock: Duration,
    pub user_time: Duration,
    pub system_time: Duration,
    /// Signal relayed to the child, if any.
    pub signal: Option<TerminationSignal>,
    /// The child outlived the grace period and was killed.
    pub force_killed: bool,
}

impl ProcessRun {
    /// Only a zero exit status counts as success.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn status_text(&self) -> String {
        self.status.to_string()
    }

    /// Exit code to propagate, `128 + signal` when the child was killed by a signal.
    pub fn exit_code(&self) -> i32 {
        match (self.status.code(), self.status.signal()) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => 1,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Relay {
    signal: Option<TerminationSignal>,
    force_killed: bool,
}

/// Runs one command under supervision.
pub struct Supervisor {
    command: String,
    args: Vec<String>,
    signals: Option<SignalSubscription>,
    env: EnvStore,
    config: Config,
    working_dir: Option<PathBuf>,
    stdout: ConsoleWriter,
    stderr: ConsoleWriter,
    grace_period: Duration,
    sample_interval: Duration,
    cancel: CancelToken,
    clock: Clock,
    state: RunState,
}

impl Supervisor {
    /// Creates a supervisor that relays the signals of `signals` to the child.
    pub fn new(command: impl Into<String>, args: Vec<String>, signals: SignalSubscription) -> Self {
        Self {
            command: command.into(),
            args,
            signals: Some(signals),
            env: EnvStore::new(),
            config: Config::default(),
            working_dir: None,
            stdout: ConsoleWriter::stdout(),
            stderr: ConsoleWriter::stderr(),
            grace_period: GRACE_PERIOD,
            sample_interval: SAMPLE_INTERVAL,
            cancel: CancelToken::new(),
            clock: Utc::now,
            state: RunState::Idle,
        }
    }

    /// Environment of the child, exported in insertion order.
    pub fn env(mut self, env: EnvStore) -> Self {
        self.env = env;
        self
    }

    /// Sink configuration and console log level.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Replaces the console writers of the two streams.
    pub fn consoles(mut self, stdout: ConsoleWriter, stderr: ConsoleWriter) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Token that stops the sampler and signal relay of this run when cancelled.
    ///
    /// Cancelling does not kill the child.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, state: RunState) {
        debug!("'{}': {} -> {}", self.command, self.state, state);
        self.state = state;
    }

    /// Runs the command to completion.
    ///
    /// Any exit code, including one caused by a relayed signal, is reported as `Ok`.
    /// Only setup, spawn and wait failures are errors.
    pub fn run(mut self) -> Result<ProcessRun, SupervisorError> {
        let log_level: Severity = self.config.log_level;
        let stdout_writer = std::mem::replace(&mut self.stdout, ConsoleWriter::json(io::sink()));
        let stderr_writer = std::mem::replace(&mut self.stderr, ConsoleWriter::json(io::sink()));
        let mut stdout_mux = LogMultiplexer::new(
            StreamKind::Stdout,
            stdout_writer,
            log_level,
            &self.config.stdout,
            &self.env,
        )?
        .with_clock(self.clock);
        let mut stderr_mux = LogMultiplexer::new(
            StreamKind::Stderr,
            stderr_writer,
            log_level,
            &self.config.stderr,
            &self.env,
        )?
        .with_clock(self.clock);

        let working_dir = match self.working_dir.take() {
            Some(dir) => dir,
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        };
        self.transition(RunState::Starting);

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .env_clear()
            .envs(self.env.export_pairs())
            .current_dir(&working_dir)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        unsafe {
            cmd.pre_exec(|| {
                // Take the child down with the supervisor (Linux only).
                #[cfg(target_os = "linux")]
                {
                    use libc::{PR_SET_PDEATHSIG, SIGTERM, prctl};
                    if prctl(PR_SET_PDEATHSIG, SIGTERM, 0, 0, 0) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        let started = Instant::now();
        let started_at = (self.clock)();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.transition(RunState::Failed);
                stdout_mux.close();
                stderr_mux.close();
                return Err(SupervisorError::Spawn {
                    command: self.command.clone(),
                    source,
                });
            }
        };
        let pid = child.id();
        self.transition(RunState::Running);
        info!("Started '{}' with PID {pid}", self.command);
        stdout_mux.write_process_start(started_at, pid, &working_dir, &self.command, &self.args);

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let exited = CancelToken::new();
        let cancel = &self.cancel;
        let signals = self
            .signals
            .take()
            .unwrap_or_else(|| SignalSubscription::channel().1);
        let grace_period = self.grace_period;
        let sample_interval = self.sample_interval;
        let (out_mux, err_mux) = (&stdout_mux, &stderr_mux);
        let exited_ref = &exited;

        let (waited, relay) = thread::scope(|scope| {
            if let Some(pipe) = stdout_pipe {
                scope.spawn(move || out_mux.consume(ChildPipe::new(pipe, exited_ref)));
            }
            if let Some(pipe) = stderr_pipe {
                scope.spawn(move || err_mux.consume(ChildPipe::new(pipe, exited_ref)));
            }
            let relay = scope.spawn(move || {
                relay_signals(pid, signals, cancel, exited_ref, grace_period)
            });
            match ProcessSampler::attach(pid) {
                Some(sampler) => {
                    scope.spawn(move || sample(sampler, out_mux, cancel, sample_interval));
                }
                None => debug!("Process metrics unavailable for PID {pid}"),
            }

            let waited = wait_child(pid);
            exited_ref.cancel();
            cancel.cancel();
            (waited, relay.join().unwrap_or_default())
        });
        drop(child);

        let finished_at = (self.clock)();
        let wall_clock = started.elapsed();
        let (status, user_time, system_time) = match waited {
            Ok(waited) => waited,
            Err(source) => {
                self.transition(RunState::Failed);
                stdout_mux.close();
                stderr_mux.close();
                return Err(SupervisorError::Wait { pid, source });
            }
        };

        self.transition(if relay.signal.is_some() {
            RunState::Killed
        } else {
            RunState::Completed
        });
        stdout_mux.write_process_result(
            finished_at,
            &status.to_string(),
            wall_clock,
            user_time,
            system_time,
        );
        stdout_mux.close();
        stderr_mux.close();
        info!("'{}' finished: {status}", self.command);

        Ok(ProcessRun {
            started_at,
            finished_at,
            pid,
            working_dir,
            command: self.command.clone(),
            args: self.args.clone(),
            state: self.state,
            status,
            wall_clock,
            user_time,
            system_time,
            signal: relay.signal,
            force_killed: relay.force_killed,
        })
    }
}

/// Relays the first termination signal, then enforces the grace period.
fn relay_signals(
    pid: u32,
    signals: SignalSubscription,
    cancel: &CancelToken,
    exited: &CancelToken,
    grace_period: Duration,
) -> Relay {
    let target = Pid::from_raw(pid as i32);
    let received = loop {
        if cancel.is_cancelled() {
            return Relay::default();
        }
        match signals.recv_timeout(RELAY_POLL) {
            Ok(received) => break received,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                cancel.wait();
                return Relay::default();
            }
        }
    };
    if exited.is_cancelled() {
        return Relay::default();
    }

    info!("Relaying {received} to PID {pid}");
    if let Err(err) = signal::kill(target, received.as_signal()) {
        warn!("Failed to send {received} to PID {pid}: {err}");
    }
    cancel.cancel();

    let mut force_killed = false;
    if !exited.wait_timeout(grace_period) {
        warn!("PID {pid} still running after {grace_period:?}; killing it");
        match signal::kill(target, signal::Signal::SIGKILL) {
            Ok(()) => force_killed = true,
            Err(err) => warn!("Failed to kill PID {pid}: {err}"),
        }
    }
    Relay {
        signal: Some(received),
        force_killed,
    }
}

fn sample(
    mut sampler: ProcessSampler,
    mux: &LogMultiplexer,
    cancel: &CancelToken,
    interval: Duration,
) {
    while !cancel.wait_timeout(interval) {
        match sampler.sample() {
            Some(sample) => {
                mux.write_metrics(sample.memory_bytes, sample.memory_percent, sample.cpu_percent)
            }
            None => {
                debug!("Stopping resource sampler");
                return;
            }
        }
    }
}

/// Output pipe of the child that reports EOF at most [`DRAIN_GRACE`] after the child
/// has been reaped.
struct ChildPipe<'a, R> {
    pipe: R,
    exited: &'a CancelToken,
    deadline: Option<Instant>,
}

impl<'a, R: Read + AsRawFd> ChildPipe<'a, R> {
    fn new(pipe: R, exited: &'a CancelToken) -> Self {
        Self {
            pipe,
            exited,
            deadline: None,
        }
    }
}

impl<R: Read + AsRawFd> Read for ChildPipe<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.deadline.is_none() && self.exited.is_cancelled() {
                self.deadline = Some(Instant::now() + DRAIN_GRACE);
            }
            let wait = match self.deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(left) if !left.is_zero() => left.min(PIPE_POLL),
                    _ => {
                        debug!("Stopped draining output held open after exit");
                        return Ok(0);
                    }
                },
                None => PIPE_POLL,
            };
            if poll_readable(self.pipe.as_raw_fd(), wait)? {
                return self.pipe.read(buf);
            }
        }
    }
}

/// Waits up to `timeout` for `fd` to become readable or hung up.
fn poll_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().clamp(1, libc::c_int::MAX as u128) as libc::c_int;
    match unsafe { libc::poll(&mut pollfd, 1, millis) } {
        -1 => {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                Ok(false)
            } else {
                Err(err)
            }
        }
        0 => Ok(false),
        _ => Ok(true),
    }
}

/// Reaps the child, returning its status and CPU times.
fn wait_child(pid: u32) -> io::Result<(ExitStatus, Duration, Duration)> {
    let mut status: libc::c_int = 0;
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        let rc = unsafe { libc::wait4(pid as libc::pid_t, &mut status, 0, &mut usage) };
        if rc >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
    Ok((
        ExitStatus::from_raw(status),
        timeval(usage.ru_utime),
        timeval(usage.ru_stime),
    ))
}

fn timeval(value: libc::timeval) -> Duration {
    Duration::from_secs(value.tv_sec.max(0) as u64)
        + Duration::from_micros(value.tv_usec.max(0) as u64)
}
