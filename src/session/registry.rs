//! Session registry: identity and stream bookkeeping for client connections.
//!
//! # Responsibilities
//! - Assign monotonically increasing session IDs
//! - Track the global count of open sessions
//! - Track per-session stream and tunnel counters
//! - Publish lifecycle boundary events (first session, all sessions closed)
//!
//! # Design Decisions
//! - Pure bookkeeping; no I/O
//! - RAII guards close sessions and end streams on drop, so every exit path
//!   (including panics in handlers) keeps the counters balanced
//! - A stream begun through a [`SessionHandle`] holds the session open, so an
//!   upgraded tunnel outlives the HTTP/1.1 connection that carried its CONNECT
//! - Counters saturate at zero; a double release can never make them negative

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::observability::metrics;

/// Capacity of the lifecycle event channel. Slow subscribers lag rather
/// than block the registry.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Unique identifier for a session, scoped to one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Entry protocol a session was accepted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Multiplexed secure protocol (HTTP/2 over TLS).
    Http2,
    /// Plain single-stream protocol (HTTP/1.1).
    Http1,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http2 => "h2",
            Protocol::Http1 => "http/1.1",
        }
    }
}

/// Kind of a stream within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// CONNECT tunnel; counted in `tunnel_count`.
    Tunnel,
    /// Forwarded request/response exchange.
    Forward,
}

/// Lifecycle events published by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session became active.
    Opened { id: SessionId, protocol: Protocol },
    /// The first concurrently open session became active.
    FirstOpened { id: SessionId },
    /// A session closed.
    Closed { id: SessionId, duration: Duration },
    /// The last open session closed.
    AllClosed { id: SessionId },
}

#[derive(Debug)]
struct SessionState {
    protocol: Protocol,
    peer: SocketAddr,
    opened_at: Instant,
    tunnel_count: AtomicUsize,
    stream_count: AtomicUsize,
}

#[derive(Debug)]
struct RegistryInner {
    next_id: AtomicU64,
    active: AtomicUsize,
    sessions: DashMap<SessionId, SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

/// Tracks open sessions and their stream counters.
///
/// Cloning is cheap; all clones share the same state.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RegistryInner {
                next_id: AtomicU64::new(1),
                active: AtomicUsize::new(0),
                sessions: DashMap::new(),
                events,
            }),
        }
    }

    /// Register a newly negotiated session. The session closes when the
    /// returned guard is dropped.
    pub fn open(&self, peer: SocketAddr, protocol: Protocol) -> SessionGuard {
        let id = SessionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.sessions.insert(
            id,
            SessionState {
                protocol,
                peer,
                opened_at: Instant::now(),
                tunnel_count: AtomicUsize::new(0),
                stream_count: AtomicUsize::new(0),
            },
        );
        let previous = self.inner.active.fetch_add(1, Ordering::SeqCst);
        metrics::record_session_opened(protocol);

        tracing::info!(
            session = %id,
            peer_addr = %peer,
            protocol = protocol.as_str(),
            active_sessions = previous + 1,
            "Session opened"
        );
        self.publish(SessionEvent::Opened { id, protocol });

        if previous == 0 {
            tracing::info!(session = %id, "First session opened");
            self.publish(SessionEvent::FirstOpened { id });
        }

        SessionGuard {
            registry: self.clone(),
            id,
        }
    }

    /// Close a session. Returns `false` if it was already closed.
    pub fn close(&self, id: SessionId) -> bool {
        let Some((_, state)) = self.inner.sessions.remove(&id) else {
            return false;
        };
        let remaining = saturating_decrement(&self.inner.active);
        let duration = state.opened_at.elapsed();
        metrics::record_session_closed(state.protocol);

        tracing::info!(
            session = %id,
            peer_addr = %state.peer,
            duration_ms = duration.as_millis() as u64,
            active_sessions = remaining,
            "Session closed"
        );
        self.publish(SessionEvent::Closed { id, duration });

        if remaining == 0 {
            tracing::info!(session = %id, "All sessions closed");
            self.publish(SessionEvent::AllClosed { id });
        }
        true
    }

    /// Record the start of a stream. The stream ends when the returned
    /// guard is dropped. Streams of unknown sessions are not counted.
    pub fn begin_stream(&self, id: SessionId, kind: StreamKind) -> StreamGuard {
        let counted = match self.inner.sessions.get(&id) {
            Some(state) => {
                state.stream_count.fetch_add(1, Ordering::SeqCst);
                if kind == StreamKind::Tunnel {
                    let tunnels = state.tunnel_count.fetch_add(1, Ordering::SeqCst) + 1;
                    tracing::debug!(session = %id, tunnels, "Tunnel count increased");
                }
                true
            }
            None => false,
        };
        StreamGuard {
            registry: self.clone(),
            session: id,
            kind,
            counted,
            started_at: Instant::now(),
            owner: None,
        }
    }

    fn end_stream(&self, id: SessionId, kind: StreamKind) {
        if let Some(state) = self.inner.sessions.get(&id) {
            saturating_decrement(&state.stream_count);
            if kind == StreamKind::Tunnel {
                let tunnels = saturating_decrement(&state.tunnel_count);
                tracing::debug!(session = %id, tunnels, "Tunnel count decreased");
            }
        }
    }

    /// Current number of open sessions.
    pub fn active_sessions(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Active tunnels of a session, `None` if the session is not open.
    pub fn tunnel_count(&self, id: SessionId) -> Option<usize> {
        self.inner
            .sessions
            .get(&id)
            .map(|state| state.tunnel_count.load(Ordering::SeqCst))
    }

    /// Client address a session was registered with.
    pub fn peer_addr(&self, id: SessionId) -> Option<SocketAddr> {
        self.inner.sessions.get(&id).map(|state| state.peer)
    }

    /// Active streams (tunnels and forwarded exchanges) of a session.
    pub fn stream_count(&self, id: SessionId) -> Option<usize> {
        self.inner
            .sessions
            .get(&id)
            .map(|state| state.stream_count.load(Ordering::SeqCst))
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is the normal case outside of tests.
        let _ = self.inner.events.send(event);
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrement without wrapping below zero. Returns the new value.
fn saturating_decrement(counter: &AtomicUsize) -> usize {
    match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
        Ok(previous) => previous - 1,
        Err(_) => 0,
    }
}

/// Guard that keeps a session open. Closes it when dropped.
#[derive(Debug)]
pub struct SessionGuard {
    registry: SessionRegistry,
    id: SessionId,
}

/// Shared ownership of an open session. The session closes when the last
/// handle, and the last stream begun through one, is dropped.
pub type SessionHandle = Arc<SessionGuard>;

impl SessionGuard {
    /// Get this session's ID.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Begin a stream that keeps this session open until the stream ends.
    pub fn begin_stream(self: &Arc<Self>, kind: StreamKind) -> StreamGuard {
        let mut stream = self.registry.begin_stream(self.id, kind);
        stream.owner = Some(Arc::clone(self));
        stream
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.close(self.id);
    }
}

/// Guard that tracks one active stream. Ends it when dropped.
#[derive(Debug)]
pub struct StreamGuard {
    registry: SessionRegistry,
    session: SessionId,
    kind: StreamKind,
    counted: bool,
    started_at: Instant,
    // Released after `end_stream`, so the session closes last.
    owner: Option<SessionHandle>,
}

impl StreamGuard {
    /// Session this stream belongs to.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Time since the stream started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if self.counted {
            self.registry.end_stream(self.session, self.kind);
        }
    }
}
