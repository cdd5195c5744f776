//! Error taxonomy for the simulation engine.
//!
//! Two families live here:
//! - [`SimError`]: fatal conditions (bad configuration, broken invariants, I/O).
//!   A run that hits one of these aborts and the error names the offending
//!   entity and the simulated time at which it happened.
//! - [`Condition`]: non-fatal outcomes that the state machines handle on their
//!   own and that only ever surface as metrics.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("event {event} scheduled at {at:?} but the clock already reads {now:?}")]
    ScheduleInPast { event: String, at: Duration, now: Duration },

    #[error("device {device}: frame counter regressed from {last} to {received} at {time:?}")]
    SequenceRegression { device: u32, last: u32, received: u32, time: Duration },

    #[error("{entity}: invariant violated at {time:?}: {detail}")]
    Invariant { entity: String, time: Duration, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SimError {
    pub(crate) fn invariant(entity: impl Into<String>, time: Duration, detail: impl Into<String>) -> Self {
        SimError::Invariant {
            entity: entity.into(),
            time,
            detail: detail.into(),
        }
    }
}

/// Non-fatal conditions recorded against transmissions and messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Transmission pushed back to the next legal slot.
    DutyCycleExceeded,
    /// Packet error or collision on the channel.
    ChannelError,
    /// Gateway rejected a stale or unknown session token.
    TokenExpired,
    /// QoS-D target not met before the message deadline.
    DeadlineMissed,
}

/// Failure to encode or decode a protocol frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame truncated: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),

    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}
