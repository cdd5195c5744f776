//! Type definitions shared across the simulation.
//!
//! Contains:
//! - Identities (devices, transmissions, messages, commands)
//! - QoS classes and their delivery targets
//! - The scheduler's event vocabulary
//! - Commands queued at the gateway

use std::time::Duration;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Independent random streams derived from one run seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RngStream {
    Channel = 1,
    Placement = 2,
    Traffic = 3,
    Protocol = 4,
    Gateway = 5,
}

/// Generator for `stream` of the run seeded with `seed`.
pub fn seeded_stream(seed: u64, stream: RngStream) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(stream as u64);
    rng
}

pub type DeviceId = u32;

/// Identity of one on-air transmission inside the channel model.
pub type TxId = u64;

/// Per-device message index (0, 1, 2, ...).
pub type MessageIndex = u32;

pub type CommandId = u64;

/// Which way a frame travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Uplink,
    Downlink,
}

/// Network technology under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NetworkKind {
    #[default]
    Lorawan,
    Nbiot,
    Sigfox,
}

/// Traffic class attached to every uplink message and downlink command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QosClass {
    Critical,
    Normal,
    BestEffort,
}

impl QosClass {
    pub const ALL: [QosClass; 3] = [QosClass::Critical, QosClass::Normal, QosClass::BestEffort];

    /// Two-bit priority field used on the wire (0 = highest).
    pub fn wire_priority(self) -> u8 {
        match self {
            QosClass::Critical => 0,
            QosClass::Normal => 1,
            QosClass::BestEffort => 2,
        }
    }

    pub fn from_wire_priority(value: u8) -> Self {
        match value {
            0 => QosClass::Critical,
            1 => QosClass::Normal,
            _ => QosClass::BestEffort,
        }
    }
}

/// Delivery target of a QoS class: reach `probability` within `deadline`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QosTarget {
    pub deadline: Duration,
    pub probability: f64,
}

/// A downlink command waiting at the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub id: CommandId,
    pub device: DeviceId,
    pub cmd_type: u8,
    pub payload: Vec<u8>,
    pub priority: QosClass,
    pub arrived_at: Duration,
    pub deadline: Duration,
}

impl Command {
    pub fn expired(&self, now: Duration) -> bool {
        now > self.arrived_at + self.deadline
    }
}

/// Everything the scheduler can dispatch.
///
/// Timeout-like events carry the attempt they guard; a handler that finds the
/// message in a different attempt treats the event as stale.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The application on `device` produced a new uplink message.
    UplinkGenerated { device: DeviceId },
    /// A command arrived at the gateway from the application server.
    CommandArrival,
    /// The device may start a transmission now.
    TransmitAttempt { device: DeviceId },
    UplinkEnd { device: DeviceId, tx: TxId },
    DownlinkEnd { device: DeviceId, tx: TxId },
    /// The receive window after an uplink closed without a downlink.
    RxWindowClosed { device: DeviceId },
    /// Per-message acknowledgment timer (baseline protocols).
    AckTimeout { device: DeviceId, message: MessageIndex, attempt: u8 },
    /// QoS-D deadline of a message (novel protocol).
    QosDeadline { device: DeviceId, message: MessageIndex },
    /// MQTT-SN keep-alive check.
    KeepAlive { device: DeviceId },
}
