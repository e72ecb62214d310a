//! Bidirectional byte pipe.
//!
//! # Responsibilities
//! - Copy bytes client → server and server → client, verbatim and in order
//! - Throttle each direction to the speed of its destination
//! - Propagate end of stream as a half-close, and failures as a full teardown
//! - Observe byte counts without touching the data
//!
//! # Design Decisions
//! - One read is in flight per direction and the next read only starts once
//!   the previous chunk was written and flushed, so memory per pipe is two
//!   fixed buffers regardless of peer speed
//! - Teardown is a one-shot signal: the first cause wins, later triggers are
//!   no-ops; dropping both endpoints closes them
//! - No idle timeout: a silent pipe stays open until a peer closes it

use std::fmt;
use std::io;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use crate::observability::metrics;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// An endpoint of the pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => f.write_str("client"),
            Side::Server => f.write_str("server"),
        }
    }
}

/// Direction of a byte flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToServer => "client_to_server",
            Direction::ServerToClient => "server_to_client",
        }
    }
}

/// Why a pipe was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownCause {
    /// Both directions reached end of stream.
    Finished,
    /// An endpoint failed; the other endpoint was closed in response.
    Failed(Side),
    /// Torn down from outside the pipe.
    Cancelled,
}

/// One-shot, idempotent teardown signal shared by the parties of a pipe.
#[derive(Debug, Clone)]
pub struct Teardown {
    inner: Arc<TeardownInner>,
}

#[derive(Debug)]
struct TeardownInner {
    cause: OnceLock<TeardownCause>,
    signal: watch::Sender<bool>,
}

impl Teardown {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            inner: Arc::new(TeardownInner {
                cause: OnceLock::new(),
                signal,
            }),
        }
    }

    /// Fire the teardown. Returns `true` only for the first call.
    pub fn trigger(&self, cause: TeardownCause) -> bool {
        let first = self.inner.cause.set(cause).is_ok();
        if first {
            self.inner.signal.send_replace(true);
        }
        first
    }

    pub fn is_done(&self) -> bool {
        self.inner.cause.get().is_some()
    }

    /// Cause of the first trigger, if any.
    pub fn cause(&self) -> Option<TeardownCause> {
        self.inner.cause.get().copied()
    }

    /// Resolve once the teardown has fired.
    pub async fn wait(&self) {
        let mut rx = self.inner.signal.subscribe();
        // The sender lives as long as `self`, so this cannot fail early.
        let _ = rx.wait_for(|done| *done).await;
    }
}

impl Default for Teardown {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-mutating byte counter for one direction of a pipe.
///
/// With telemetry enabled, emits the delta since the previous event no more
/// often than once per interval.
#[derive(Debug)]
pub struct ByteObserver {
    label: Arc<str>,
    pipe: &'static str,
    direction: Direction,
    telemetry: Option<Duration>,
    total: u64,
    reported: u64,
    last_report: Instant,
}

impl ByteObserver {
    pub fn new(
        label: Arc<str>,
        pipe: &'static str,
        direction: Direction,
        telemetry: Option<Duration>,
    ) -> Self {
        Self {
            label,
            pipe,
            direction,
            telemetry,
            total: 0,
            reported: 0,
            last_report: Instant::now(),
        }
    }

    /// Account for a chunk that was relayed.
    pub fn observe(&mut self, len: usize) {
        self.total += len as u64;
        metrics::record_relayed_bytes(self.pipe, self.direction.as_str(), len as u64);

        if let Some(interval) = self.telemetry {
            if self.last_report.elapsed() >= interval {
                self.report();
            }
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Emit any unreported delta and return the total.
    pub fn finish(&mut self) -> u64 {
        if self.telemetry.is_some() {
            self.report();
        }
        self.total
    }

    fn report(&mut self) {
        let delta = self.total - self.reported;
        self.last_report = Instant::now();
        if delta == 0 {
            return;
        }
        self.reported = self.total;
        tracing::info!(
            target_addr = %self.label,
            pipe = self.pipe,
            direction = self.direction.as_str(),
            delta,
            total = self.total,
            "Relayed bytes"
        );
    }
}

/// Settings for one pipe.
#[derive(Debug, Clone)]
pub struct PipeOptions {
    /// Label for log events, usually the target authority.
    pub label: Arc<str>,
    /// Metrics label (`tunnel`, `fallback`).
    pub pipe: &'static str,
    /// Byte-delta telemetry interval; `None` disables the events.
    pub telemetry: Option<Duration>,
}

/// Summary of a finished pipe.
#[derive(Debug)]
pub struct SpliceReport {
    pub client_to_server: u64,
    pub server_to_client: u64,
    pub cause: TeardownCause,
    /// The I/O error that caused a `Failed` teardown.
    pub error: Option<io::Error>,
}

#[derive(Debug)]
struct PumpError {
    side: Side,
    source: io::Error,
}

/// Relay bytes between `client` and `server` until both directions ended,
/// an endpoint failed, or `teardown` was triggered from outside.
///
/// Both endpoints are dropped (closed) before this returns.
pub async fn splice<C, S>(
    client: C,
    server: S,
    options: PipeOptions,
    teardown: &Teardown,
) -> SpliceReport
where
    C: AsyncRead + AsyncWrite,
    S: AsyncRead + AsyncWrite,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut server_read, mut server_write) = tokio::io::split(server);

    let mut upstream = ByteObserver::new(
        options.label.clone(),
        options.pipe,
        Direction::ClientToServer,
        options.telemetry,
    );
    let mut downstream = ByteObserver::new(
        options.label.clone(),
        options.pipe,
        Direction::ServerToClient,
        options.telemetry,
    );
    let failure: OnceLock<io::Error> = OnceLock::new();

    {
        let fail = |err: PumpError| {
            if teardown.trigger(TeardownCause::Failed(err.side)) {
                let _ = failure.set(err.source);
            }
        };

        let pumps = async {
            tokio::join!(
                async {
                    if let Err(err) =
                        pump(&mut client_read, &mut server_write, Side::Client, Side::Server, &mut upstream).await
                    {
                        fail(err);
                    }
                },
                async {
                    if let Err(err) =
                        pump(&mut server_read, &mut client_write, Side::Server, Side::Client, &mut downstream).await
                    {
                        fail(err);
                    }
                },
            );
            teardown.trigger(TeardownCause::Finished);
        };

        tokio::select! {
            _ = pumps => {}
            _ = teardown.wait() => {}
        }
    }

    drop((client_read, client_write, server_read, server_write));

    SpliceReport {
        client_to_server: upstream.finish(),
        server_to_client: downstream.finish(),
        cause: teardown.cause().unwrap_or(TeardownCause::Cancelled),
        error: failure.into_inner(),
    }
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    from: Side,
    to: Side,
    observer: &mut ByteObserver,
) -> Result<(), PumpError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|source| PumpError { side: from, source })?;

        if n == 0 {
            // End of stream on one side half-closes the other.
            writer
                .shutdown()
                .await
                .map_err(|source| PumpError { side: to, source })?;
            return Ok(());
        }

        writer
            .write_all(&buf[..n])
            .await
            .map_err(|source| PumpError { side: to, source })?;
        writer
            .flush()
            .await
            .map_err(|source| PumpError { side: to, source })?;
        observer.observe(n);
    }
}
