//! Connection lifecycle state shared between a connection's tasks and its
//! handles.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Which end of the protocol a connection plays. Clients mask outbound
/// frames; servers expect masked inbound frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// Whether frames written by this role carry a masking key.
    pub fn masks_outbound(self) -> bool {
        matches!(self, Self::Client)
    }

    /// Whether frames read by this role must carry a masking key.
    pub fn expects_masked(self) -> bool {
        matches!(self, Self::Server)
    }
}

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    /// Client only: TCP connect not finished yet.
    Connecting = 0,
    AwaitingUpgrade = 1,
    Open = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::AwaitingUpgrade,
            2 => Self::Open,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Atomically shared [`ConnectionState`].
#[derive(Debug, Clone)]
pub struct SharedState(Arc<AtomicU8>);

impl SharedState {
    pub fn new(initial: ConnectionState) -> Self {
        Self(Arc::new(AtomicU8::new(initial as u8)))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves to `next` if it is later than the current state.
    ///
    /// Returns `false` when the state was already at or past `next`.
    pub fn advance(&self, next: ConnectionState) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (next as u8 > current).then_some(next as u8)
            })
            .is_ok()
    }

    pub fn is_open(&self) -> bool {
        self.get() == ConnectionState::Open
    }
}
