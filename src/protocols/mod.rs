//! Application-layer protocol adapters.
//!
//! Every protocol under comparison implements [`ProtocolAdapter`]: it frames
//! and parses headers, decides how messages are acknowledged and retried, and
//! reports how much state a device has to hold. The adapter is chosen once per
//! run by [`build`] and shared by the device and gateway state machines.
//!
//! - `novel`: session token, windowed bitmap ACK, QoS-D retries, epoch-tagged commands
//! - `mqtt_sn`: CONNECT session, per-message PUBACK, fixed retry interval
//! - `coap`: CON/NON requests, message-id matched ACKs, exponential backoff

pub mod coap;
pub mod mqtt_sn;
pub mod novel;
pub mod qos_d;

use std::time::Duration;

use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::error::CodecError;
use crate::simulation::ack_window::Bitmap;
use crate::simulation::types::{QosClass, QosTarget};

pub use coap::CoapAdapter;
pub use mqtt_sn::MqttSnAdapter;
pub use novel::NovelAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    #[default]
    Novel,
    MqttSn,
    Coap,
}

/// How uplink messages are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Deferred, aggregated over `width` sequences.
    WindowedBitmap { width: u32, max_delay: Duration },
    /// One acknowledgment per confirmable message, matched by message id.
    PerMessage,
}

/// How a device recognises a command it has already applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupPolicy {
    /// Batches carry a strictly increasing epoch; anything not newer is a no-op.
    Epoch,
    /// Remember the last `n` command message ids.
    RecentIds(usize),
    /// Remember command message ids for a fixed lifetime.
    Lifetime(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UplinkBody {
    Data {
        seq: u16,
        msg_id: u16,
        priority: QosClass,
        confirmable: bool,
        retransmission: bool,
        payload_len: usize,
    },
    /// Token request (novel) or CONNECT (MQTT-SN); `next_seq` is the next data sequence.
    SessionRequest { next_seq: u16 },
    KeepAlive,
}

/// Decoded uplink header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UplinkHeader {
    pub body: UplinkBody,
    pub token_short: Option<u8>,
    /// Low byte of the newest applied command epoch.
    pub epoch_echo: Option<u8>,
    /// Message ids of commands the device confirms.
    pub command_acks: Vec<u16>,
}

impl UplinkHeader {
    pub fn new(body: UplinkBody) -> Self {
        Self {
            body,
            token_short: None,
            epoch_echo: None,
            command_acks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckInfo {
    /// `base` carries only its low 16 bits after decoding.
    Bitmap(Bitmap),
    Message { msg_id: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionControl {
    Granted { token: Vec<u8> },
    Expired,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireCommand {
    pub cmd_type: u8,
    pub payload: Vec<u8>,
}

/// Commands delivered together; `tag` is the epoch (novel) or message id (baselines).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBatch {
    pub tag: u16,
    pub commands: Vec<WireCommand>,
}

impl CommandBatch {
    pub fn payload_bytes(&self) -> usize {
        self.commands.iter().map(|c| c.payload.len()).sum()
    }
}

/// Decoded downlink content.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Downlink {
    pub ack: Option<AckInfo>,
    pub session: Option<SessionControl>,
    pub batch: Option<CommandBatch>,
}

impl Downlink {
    pub fn is_empty(&self) -> bool {
        self.ack.is_none() && self.session.is_none() && self.batch.is_none()
    }
}

/// Reliability decisions for one new message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessagePlan {
    pub confirmable: bool,
    pub max_attempts: u8,
    /// Proactive spacing between attempts (QoS-D).
    pub spacing: Option<Duration>,
    /// First acknowledgment timeout (per-message protocols).
    pub initial_timeout: Option<Duration>,
}

/// Sizes the adapter needs to report device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateView {
    pub outstanding: usize,
    pub dedup_entries: usize,
}

pub trait ProtocolAdapter: Send + Sync {
    fn kind(&self) -> ProtocolKind;

    fn ack_mode(&self) -> AckMode;

    fn dedup_policy(&self) -> DedupPolicy;

    /// Whether data may only flow after a session handshake.
    fn needs_session(&self) -> bool;

    /// Commands per downlink.
    fn command_budget(&self) -> usize;

    fn keep_alive(&self) -> Option<Duration> {
        None
    }

    fn encode_uplink(&self, header: &UplinkHeader) -> Vec<u8>;

    /// Decode an uplink frame, returning the header and its length in bytes.
    fn parse_uplink(&self, frame: &[u8]) -> Result<(UplinkHeader, usize), CodecError>;

    fn encode_downlink(&self, downlink: &Downlink) -> Vec<u8>;

    fn parse_downlink(&self, frame: &[u8]) -> Result<Downlink, CodecError>;

    fn plan(&self, class: QosClass, target: QosTarget, delivery_estimate: f64, rng: &mut ChaCha8Rng) -> MessagePlan;

    /// How long to wait for the acknowledgment of `attempt` (1-based).
    fn ack_timeout(&self, plan: &MessagePlan, attempt: u8) -> Option<Duration>;

    /// Protocol state a device has to keep, in bytes.
    fn state_bytes(&self, view: StateView) -> usize;
}

/// Select the adapter for a run.
pub fn build(config: &RunConfig) -> Box<dyn ProtocolAdapter> {
    match config.protocol {
        ProtocolKind::Novel => Box::new(NovelAdapter::new(&config.novel)),
        ProtocolKind::MqttSn => Box::new(MqttSnAdapter::new(&config.mqtt_sn)),
        ProtocolKind::Coap => Box::new(CoapAdapter::new(&config.coap)),
    }
}

/// Reconstruct a 32-bit sequence that is newer than `last` from its low 16 bits.
pub fn unwrap_forward(last: u32, wire: u16) -> u32 {
    let candidate = (last & !0xFFFF) | wire as u32;
    if candidate <= last { candidate.wrapping_add(0x1_0000) } else { candidate }
}

/// Reconstruct a 32-bit sequence not newer than `reference` from its low 16 bits.
pub fn unwrap_backward(reference: u32, wire: u16) -> u32 {
    let candidate = (reference & !0xFFFF) | wire as u32;
    if candidate > reference && candidate >= 0x1_0000 { candidate - 0x1_0000 } else { candidate }
}

pub(crate) fn read_u16(bytes: &[u8], at: usize) -> Result<u16, CodecError> {
    match bytes.get(at..at + 2) {
        Some(b) => Ok(u16::from_be_bytes([b[0], b[1]])),
        None => Err(CodecError::Truncated {
            needed: at + 2,
            got: bytes.len(),
        }),
    }
}

pub(crate) fn read_u8(bytes: &[u8], at: usize) -> Result<u8, CodecError> {
    bytes.get(at).copied().ok_or(CodecError::Truncated {
        needed: at + 1,
        got: bytes.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_unwrap_rolls_over() {
        assert_eq!(unwrap_forward(10, 11), 11);
        assert_eq!(unwrap_forward(0xFFFF, 0x0000), 0x1_0000);
        assert_eq!(unwrap_forward(0x1_0005, 0x0007), 0x1_0007);
    }

    #[test]
    fn backward_unwrap_stays_behind_reference() {
        assert_eq!(unwrap_backward(20, 10), 10);
        assert_eq!(unwrap_backward(0x1_0002, 0xFFF0), 0xFFF0);
        assert_eq!(unwrap_backward(5, 9), 9);
    }

    #[test]
    fn build_selects_configured_protocol() {
        let mut config = RunConfig::default();
        for kind in [ProtocolKind::Novel, ProtocolKind::MqttSn, ProtocolKind::Coap] {
            config.protocol = kind;
            assert_eq!(build(&config).kind(), kind);
        }
    }
}
