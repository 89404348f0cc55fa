//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of a tunneled stream connection
///
/// States only move forward: `Open -> Closing -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnectionState {
    /// Bytes may flow in both directions
    Open = 0,
    /// Teardown has begun; no new bytes are accepted
    Closing = 1,
    /// Fully released
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closing => write!(f, "closing"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Atomic cell holding a [`ConnectionState`]
///
/// Several tasks race to tear a connection down (local EOF, remote close,
/// channel loss, shutdown). Exactly one of them wins the move out of `Open`
/// and owns the teardown.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    /// Create a cell in the `Open` state
    pub fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Open as u8))
    }

    /// Current state
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Whether the connection still accepts bytes
    pub fn is_open(&self) -> bool {
        self.get() == ConnectionState::Open
    }

    /// Try to move `Open -> Closing`
    ///
    /// Returns `true` for exactly one caller over the cell's lifetime.
    pub fn begin_closing(&self) -> bool {
        self.0
            .compare_exchange(
                ConnectionState::Open as u8,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to `Closed`, returning the previous state
    pub fn finish(&self) -> ConnectionState {
        ConnectionState::from_u8(
            self.0
                .fetch_max(ConnectionState::Closed as u8, Ordering::AcqRel),
        )
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
