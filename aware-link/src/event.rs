//! Events flowing up from discovery sessions and transport channels.

use std::sync::atomic::{AtomicU64, Ordering};

use aware_core::{Frame, Role, SessionNotice};

/// Identifies one socket connection for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Why an open connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LostReason {
    /// Peer closed the stream between frames.
    Eof,
    Io(String),
    Protocol(String),
    NetworkLost,
    Unavailable,
    /// A new bring-up for the same session superseded it.
    Replaced,
}

impl std::fmt::Display for LostReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LostReason::Eof => f.write_str("stream closed by peer"),
            LostReason::Io(e) => write!(f, "socket error: {}", e),
            LostReason::Protocol(e) => write!(f, "protocol error: {}", e),
            LostReason::NetworkLost => f.write_str("network lost"),
            LostReason::Unavailable => f.write_str("network unavailable"),
            LostReason::Replaced => f.write_str("replaced by a new connection"),
        }
    }
}

/// Everything a listener of the link layer can observe, in delivery order.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Session {
        role: Role,
        notice: SessionNotice,
    },
    Established {
        role: Role,
        connection: ConnectionId,
    },
    Frame {
        role: Role,
        connection: ConnectionId,
        frame: Frame,
    },
    /// Delivered at most once per connection; no frames for it follow.
    Lost {
        role: Role,
        connection: ConnectionId,
        reason: LostReason,
    },
    /// Accept/connect failed before any connection opened.
    ConnectFailed {
        role: Role,
        reason: String,
    },
    /// Network bring-up failed (timeout, unavailable, lost before use).
    BringupFailed {
        role: Role,
        error: String,
    },
}

impl LinkEvent {
    pub fn role(&self) -> Role {
        match self {
            LinkEvent::Session { role, .. }
            | LinkEvent::Established { role, .. }
            | LinkEvent::Frame { role, .. }
            | LinkEvent::Lost { role, .. }
            | LinkEvent::ConnectFailed { role, .. }
            | LinkEvent::BringupFailed { role, .. } => *role,
        }
    }
}
