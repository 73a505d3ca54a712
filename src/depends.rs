//! Readiness probing for upstream dependencies.
//!
//! Every declared target is polled on its own thread until it answers, its deadline
//! passes, or the shared [`CancelToken`] fires. [`wait_for_dependencies`] only returns
//! once each target has produced exactly one [`DependencyOutcome`].
use std::{
    fs, io,
    net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs},
    os::unix::net::UnixStream,
    path::PathBuf,
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use reqwest::{
    Url,
    blocking::Client,
    header::{HeaderMap, HeaderName, HeaderValue},
};
use tracing::debug;

use crate::{cancel::CancelToken, error::ProbeError};

/// Default overall wait per dependency.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default delay between two readiness checks.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Floor applied to intervals and per-attempt budgets so polling never spins.
const MIN_STEP: Duration = Duration::from_millis(1);

/// A dependency that must be reachable before the child starts.
#[derive(Debug, Clone)]
pub struct DependencyTarget {
    /// Address; the scheme selects the protocol.
    pub url: Url,
    /// Headers attached to HTTP probes, in declaration order.
    pub headers: Vec<(String, String)>,
    /// Total time allowed for the target to become ready.
    pub timeout: Duration,
    /// Delay between checks, also the per-attempt budget.
    pub interval: Duration,
}

impl DependencyTarget {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Resolves the protocol-specific probe for this target.
    pub fn probe(&self) -> Result<Probe, ProbeError> {
        let url = &self.url;
        match url.scheme() {
            "file" => {
                let path = url
                    .to_file_path()
                    .unwrap_or_else(|_| PathBuf::from(url.path()));
                Ok(Probe::File { path })
            }
            "tcp" | "tcp4" | "tcp6" => {
                let family = match url.scheme() {
                    "tcp4" => Family::V4,
                    "tcp6" => Family::V6,
                    _ => Family::Any,
                };
                let host = url
                    .host_str()
                    .map(|host| host.trim_start_matches('[').trim_end_matches(']'))
                    .filter(|host| !host.is_empty())
                    .ok_or_else(|| ProbeError::InvalidAddress(url.to_string()))?;
                let port = url
                    .port()
                    .ok_or_else(|| ProbeError::InvalidAddress(url.to_string()))?;
                Ok(Probe::Tcp {
                    host: host.to_string(),
                    port,
                    family,
                })
            }
            "unix" => {
                if url.path().is_empty() {
                    return Err(ProbeError::InvalidAddress(url.to_string()));
                }
                Ok(Probe::Unix {
                    path: PathBuf::from(url.path()),
                })
            }
            "http" | "https" => {
                let mut headers = HeaderMap::new();
                for (name, value) in &self.headers {
                    let header = format!("{name}: {value}");
                    let name = HeaderName::from_bytes(name.as_bytes())
                        .map_err(|_| ProbeError::InvalidHeader(header.clone()))?;
                    let value = HeaderValue::from_str(value)
                        .map_err(|_| ProbeError::InvalidHeader(header))?;
                    headers.append(name, value);
                }
                Ok(Probe::Http {
                    url: url.clone(),
                    headers,
                })
            }
            other => Err(ProbeError::UnsupportedScheme(other.to_string())),
        }
    }
}

/// Address family requested by a `tcp*` scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Any,
    V4,
    V6,
}

impl Family {
    fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Family::Any => true,
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
        }
    }
}

/// Protocol-specific readiness check.
#[derive(Debug, Clone)]
pub enum Probe {
    /// Ready once the path can be stat'ed.
    File { path: PathBuf },
    /// Ready once a TCP connection can be opened.
    Tcp { host: String, port: u16, family: Family },
    /// Ready once a unix socket connection can be opened.
    Unix { path: PathBuf },
    /// Ready once a `HEAD` request answers with a 2xx status.
    Http { url: Url, headers: HeaderMap },
}

/// Result of a single readiness check.
enum Attempt {
    Ready,
    NotYet,
}

impl Probe {
    /// Runs one check with the given per-attempt budget.
    fn attempt(&self, client: Option<&Client>, budget: Duration) -> Result<Attempt, ProbeError> {
        match self {
            Probe::File { path } => match fs::metadata(path) {
                Ok(_) => Ok(Attempt::Ready),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Attempt::NotYet),
                Err(source) => Err(ProbeError::File {
                    path: path.clone(),
                    source,
                }),
            },
            Probe::Tcp { host, port, family } => {
                let deadline = Instant::now() + budget;
                let addrs = match resolve(host, *port, budget) {
                    Ok(addrs) => addrs,
                    Err(err) => {
                        debug!("Resolving {host}:{port} failed: {err}");
                        return Ok(Attempt::NotYet);
                    }
                };
                for addr in addrs.iter().filter(|addr| family.accepts(addr)) {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        break;
                    }
                    if let Ok(stream) = TcpStream::connect_timeout(addr, left) {
                        drop(stream);
                        return Ok(Attempt::Ready);
                    }
                }
                Ok(Attempt::NotYet)
            }
            Probe::Unix { path } => match UnixStream::connect(path) {
                Ok(stream) => {
                    drop(stream);
                    Ok(Attempt::Ready)
                }
                Err(_) => Ok(Attempt::NotYet),
            },
            Probe::Http { url, headers } => {
                let Some(client) = client else {
                    return Ok(Attempt::NotYet);
                };
                let response = client
                    .head(url.clone())
                    .headers(headers.clone())
                    .timeout(budget)
                    .send();
                match response {
                    Ok(response) if response.status().is_success() => Ok(Attempt::Ready),
                    Ok(response) => {
                        debug!("{url} answered {}", response.status());
                        Ok(Attempt::NotYet)
                    }
                    Err(err) => {
                        debug!("{url} not reachable yet: {err}");
                        Ok(Attempt::NotYet)
                    }
                }
            }
        }
    }
}

/// Resolves `host:port`, giving up after `budget`.
///
/// Host names are looked up on a detached thread because the system resolver has no
/// timeout of its own. IP literals skip the lookup.
fn resolve(host: &str, port: u16, budget: Duration) -> io::Result<Vec<SocketAddr>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }
    let (tx, rx) = mpsc::channel();
    let name = host.to_string();
    thread::Builder::new()
        .name("cradle-resolve".into())
        .spawn(move || {
            let addrs = (name.as_str(), port)
                .to_socket_addrs()
                .map(|addrs| addrs.collect::<Vec<_>>());
            let _ = tx.send(addrs);
        })?;
    rx.recv_timeout(budget).unwrap_or_else(|_| {
        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("resolving {host} took longer than {budget:?}"),
        ))
    })
}

/// Terminal result for one dependency.
#[derive(Debug)]
pub struct DependencyOutcome {
    /// Address that was probed.
    pub url: Url,
    /// Configured overall timeout.
    pub timeout: Duration,
    /// Time spent until the terminal result.
    pub elapsed: Duration,
    /// `Ok` when the dependency became reachable.
    pub result: Result<(), ProbeError>,
}

impl DependencyOutcome {
    pub fn is_ready(&self) -> bool {
        self.result.is_ok()
    }

    /// Whether the dependency simply never showed up before its deadline.
    pub fn timed_out(&self) -> bool {
        matches!(self.result, Err(ProbeError::DeadlineExceeded(_)))
    }
}

/// Probes every target concurrently and returns one outcome per target.
///
/// Outcomes arrive in completion order. The call never returns early: a failing target
/// does not stop the others, so every dependency can be reported.
pub fn wait_for_dependencies(
    targets: &[DependencyTarget],
    cancel: &CancelToken,
) -> Vec<DependencyOutcome> {
    let (tx, rx) = mpsc::channel();
    thread::scope(|scope| {
        for target in targets {
            let tx = tx.clone();
            scope.spawn(move || {
                let outcome = wait_for(target, cancel);
                let _ = tx.send(outcome);
            });
        }
    });
    drop(tx);
    rx.into_iter().collect()
}

/// Polls a single target until it is ready, times out or is cancelled.
pub fn wait_for(target: &DependencyTarget, cancel: &CancelToken) -> DependencyOutcome {
    let start = Instant::now();
    let result = target.probe().and_then(|probe| poll(target, &probe, cancel));
    let elapsed = start.elapsed();
    match &result {
        Ok(()) => debug!("Dependency {} ready after {elapsed:?}", target.url),
        Err(err) => debug!("Dependency {} failed after {elapsed:?}: {err}", target.url),
    }
    DependencyOutcome {
        url: target.url.clone(),
        timeout: target.timeout,
        elapsed,
        result,
    }
}

fn poll(target: &DependencyTarget, probe: &Probe, cancel: &CancelToken) -> Result<(), ProbeError> {
    let interval = target.interval.max(MIN_STEP);
    let deadline = Instant::now() + target.timeout;
    let client = match probe {
        Probe::Http { .. } => Some(Client::builder().build()?),
        _ => None,
    };

    loop {
        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }

        let budget = interval
            .min(deadline.saturating_duration_since(Instant::now()))
            .max(MIN_STEP);
        if let Attempt::Ready = probe.attempt(client.as_ref(), budget)? {
            return Ok(());
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProbeError::DeadlineExceeded(target.timeout));
        }
        if cancel.wait_timeout(interval.min(remaining)) {
            return Err(ProbeError::Cancelled);
        }
    }
}
