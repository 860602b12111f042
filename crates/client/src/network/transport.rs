//! TCP transport
//!
//! Resolves a host/service pair into candidate addresses and connects to the
//! first one that accepts, one attempt at a time. Established connections
//! get `TCP_NODELAY` and tuned keepalive probes.

use dns_lookup::{AddrInfoHints, SockType, getaddrinfo};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{KeepaliveSettings, NetworkSettings};
use crate::error::TransportError;

/// Candidate addresses for one host, in resolver order
///
/// Finite and consumed as it is walked; resolve again to start over.
#[derive(Debug)]
pub struct Candidates {
    addrs: std::vec::IntoIter<SocketAddr>,
}

impl Candidates {
    /// Candidates from an explicit list
    pub fn from_addrs(addrs: Vec<SocketAddr>) -> Self {
        Self {
            addrs: addrs.into_iter(),
        }
    }

    /// Addresses not yet tried
    pub fn remaining(&self) -> usize {
        self.addrs.len()
    }
}

impl Iterator for Candidates {
    type Item = SocketAddr;

    fn next(&mut self) -> Option<SocketAddr> {
        self.addrs.next()
    }
}

/// Resolve `host` and `service` into candidate addresses
///
/// `service` is a port number or a name from the services database
/// such as `"http"`. Both address families are returned when the
/// resolver has them.
pub async fn resolve(host: &str, service: &str) -> Result<Candidates, TransportError> {
    let query = (host.to_string(), service.to_string());
    let addrs = tokio::task::spawn_blocking(move || lookup_stream_addrs(&query.0, &query.1))
        .await
        .map_err(io::Error::other)
        .and_then(|result| result)
        .map_err(|source| TransportError::Resolve {
            host: host.to_string(),
            service: service.to_string(),
            source,
        })?;

    let candidates = Candidates::from_addrs(addrs);
    debug!(
        "Resolved {}:{} to {} candidate(s)",
        host,
        service,
        candidates.remaining()
    );
    Ok(candidates)
}

/// getaddrinfo restricted to stream sockets, duplicates dropped
fn lookup_stream_addrs(host: &str, service: &str) -> io::Result<Vec<SocketAddr>> {
    let hints = AddrInfoHints {
        socktype: SockType::Stream.into(),
        ..AddrInfoHints::default()
    };

    let mut addrs = Vec::new();
    for info in getaddrinfo(Some(host), Some(service), Some(hints))? {
        let addr = info?.sockaddr;
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }
    Ok(addrs)
}

/// Connection tuning
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    pub keepalive: KeepaliveSettings,
    /// Limit for each candidate, `None` waits for the OS
    pub connect_timeout: Option<Duration>,
}

impl From<&NetworkSettings> for ConnectOptions {
    fn from(settings: &NetworkSettings) -> Self {
        Self {
            keepalive: settings.keepalive,
            connect_timeout: settings.connect_timeout(),
        }
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::from(&NetworkSettings::default())
    }
}

/// Connect to the first candidate that accepts
///
/// A failed candidate moves on to the next one. Cancellation stops the walk
/// immediately and drops the half-open attempt.
pub async fn connect(
    candidates: Candidates,
    options: &ConnectOptions,
    cancel: &CancellationToken,
) -> Result<TcpStream, TransportError> {
    let mut attempts = 0;
    let mut last_error = None;

    for addr in candidates {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        attempts += 1;
        debug!("Connecting to {} (candidate {})", addr, attempts);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = connect_one(addr, options.connect_timeout) => result,
        };

        match result {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                tune_keepalive(&stream, &options.keepalive);
                info!("Connected to {}", addr);
                return Ok(stream);
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    Err(TransportError::AllCandidatesFailed {
        attempts,
        last: last_error,
    })
}

async fn connect_one(addr: SocketAddr, limit: Option<Duration>) -> io::Result<TcpStream> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, TcpStream::connect(addr))
            .await
            .unwrap_or_else(|_| {
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out after {:?}", limit),
                ))
            }),
        None => TcpStream::connect(addr).await,
    }
}

/// How keepalive tuning went on one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepaliveOutcome {
    /// The effective horizon is the requested one
    Applied(KeepaliveSettings),
    /// The kernel kept or clamped some values
    Mismatch { requested_secs: u64, effective_secs: u64 },
    /// Tuning failed; the connection keeps OS defaults
    Failed(String),
}

impl KeepaliveOutcome {
    /// Compare what was requested with what the socket reports
    pub fn evaluate(requested: &KeepaliveSettings, applied: io::Result<KeepaliveSettings>) -> Self {
        match applied {
            Ok(applied) if applied.horizon_secs() == requested.horizon_secs() => {
                Self::Applied(applied)
            }
            Ok(applied) => Self::Mismatch {
                requested_secs: requested.horizon_secs(),
                effective_secs: applied.horizon_secs(),
            },
            Err(e) => Self::Failed(e.to_string()),
        }
    }
}

/// Apply keepalive tuning and log how it went
///
/// Failure to tune, or a read-back that differs from what was requested,
/// is reported but never fails the connection.
fn tune_keepalive(stream: &TcpStream, requested: &KeepaliveSettings) -> KeepaliveOutcome {
    let outcome = KeepaliveOutcome::evaluate(requested, apply_keepalive(stream, requested));
    match &outcome {
        KeepaliveOutcome::Applied(applied) => debug!(
            "Keepalive enabled: idle={}s count={} interval={}s",
            applied.idle_secs, applied.count, applied.interval_secs
        ),
        KeepaliveOutcome::Mismatch {
            requested_secs,
            effective_secs,
        } => warn!(
            "Keepalive mismatch: requested {}s timeout, effective {}s",
            requested_secs, effective_secs
        ),
        KeepaliveOutcome::Failed(e) => warn!("Failed to tune keepalive: {}", e),
    }
    outcome
}

/// Enable keepalive probes and read back the effective values
#[cfg(target_os = "linux")]
pub fn apply_keepalive(
    stream: &TcpStream,
    settings: &KeepaliveSettings,
) -> io::Result<KeepaliveSettings> {
    use nix::sys::socket::{getsockopt, setsockopt, sockopt};

    setsockopt(stream, sockopt::KeepAlive, &true)?;
    setsockopt(stream, sockopt::TcpKeepIdle, &settings.idle_secs)?;
    setsockopt(stream, sockopt::TcpKeepCount, &settings.count)?;
    setsockopt(stream, sockopt::TcpKeepInterval, &settings.interval_secs)?;

    Ok(KeepaliveSettings {
        idle_secs: getsockopt(stream, sockopt::TcpKeepIdle)?,
        count: getsockopt(stream, sockopt::TcpKeepCount)?,
        interval_secs: getsockopt(stream, sockopt::TcpKeepInterval)?,
    })
}

/// Enable keepalive probes and read back the effective values
#[cfg(not(target_os = "linux"))]
pub fn apply_keepalive(
    _stream: &TcpStream,
    _settings: &KeepaliveSettings,
) -> io::Result<KeepaliveSettings> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "keepalive tuning is only implemented on Linux",
    ))
}
