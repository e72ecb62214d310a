//! Session subsystem.
//!
//! # Data Flow
//! ```text
//! Dispatcher negotiates a connection
//!     → registry.open() (OPENING → ACTIVE, session ID assigned)
//!     → per stream: handle.begin_stream() … guard dropped at stream end
//!     → connection ends and its last stream ends: handle dropped (ACTIVE → CLOSED)
//! ```
//!
//! # Design Decisions
//! - Counters are observability only; the protocol's own stream cap is the
//!   admission limit
//! - Components hold session handles or IDs, never the counters themselves

pub mod registry;

pub use registry::{
    Protocol, SessionEvent, SessionGuard, SessionHandle, SessionId, SessionRegistry, StreamGuard,
    StreamKind,
};
