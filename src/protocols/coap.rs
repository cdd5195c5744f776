//! CoAP style baseline.
//!
//! Uplink: zero or more empty ACKs confirming received commands, then a POST
//! to `/data` (CON or NON). Downlink: a piggy-backed ACK for the last
//! confirmable request and/or a CON request to `/cmd` carrying one command.
//! Retransmissions back off exponentially from a randomised initial timeout.

use std::time::Duration;

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use super::{
    AckInfo, AckMode, CommandBatch, DedupPolicy, Downlink, MessagePlan, ProtocolAdapter, ProtocolKind, StateView, UplinkBody, UplinkHeader,
    WireCommand, read_u8, read_u16,
};
use crate::config::CoapConfig;
use crate::error::CodecError;
use crate::simulation::signal_calculations::seconds;
use crate::simulation::types::{QosClass, QosTarget};

const VERSION: u8 = 1;
const TYPE_CON: u8 = 0;
const TYPE_NON: u8 = 1;
const TYPE_ACK: u8 = 2;

const CODE_EMPTY: u8 = 0x00;
const CODE_POST: u8 = 0x02;
const CODE_CHANGED: u8 = 0x44;

const PAYLOAD_MARKER: u8 = 0xFF;
/// Uri-Path option (delta 11) with a 4-byte value.
const URI_DATA: [u8; 5] = [0xB4, b'd', b'a', b't', b'a'];
/// Uri-Path option (delta 11) with a 3-byte value.
const URI_CMD: [u8; 4] = [0xB3, b'c', b'm', b'd'];

pub const EMPTY_ACK_LEN: usize = 4;

#[derive(Debug, Clone)]
pub struct CoapAdapter {
    ack_timeout: Duration,
    ack_random_factor: f64,
    max_retransmit: u8,
    confirmable_ratio: f64,
    exchange_lifetime: Duration,
    token_bytes: usize,
}

impl CoapAdapter {
    pub fn new(config: &CoapConfig) -> Self {
        Self {
            ack_timeout: seconds(config.ack_timeout_s),
            ack_random_factor: config.ack_random_factor,
            max_retransmit: config.max_retransmit,
            confirmable_ratio: config.confirmable_ratio,
            exchange_lifetime: seconds(config.exchange_lifetime_s),
            token_bytes: config.token_bytes,
        }
    }

    fn fixed_header(&self, out: &mut Vec<u8>, msg_type: u8, tkl: usize, code: u8, msg_id: u16) {
        out.push((VERSION << 6) | (msg_type << 4) | tkl as u8);
        out.push(code);
        out.extend_from_slice(&msg_id.to_be_bytes());
    }

    fn token(&self, msg_id: u16) -> Vec<u8> {
        let seed = msg_id.to_be_bytes();
        (0..self.token_bytes).map(|i| seed[i % 2] ^ (i as u8).wrapping_mul(31)).collect()
    }

    /// Length of the header at `at` up to and including the payload marker.
    fn header_len(frame: &[u8], at: usize) -> Result<usize, CodecError> {
        let tkl = (read_u8(frame, at)? & 0x0F) as usize;
        let mut pos = at + 4 + tkl;
        loop {
            match frame.get(pos) {
                None => return Ok(pos - at),
                Some(&PAYLOAD_MARKER) => return Ok(pos + 1 - at),
                Some(&option) => {
                    let len = (option & 0x0F) as usize;
                    pos += 1 + len;
                    if pos > frame.len() {
                        return Err(CodecError::Truncated {
                            needed: pos,
                            got: frame.len(),
                        });
                    }
                }
            }
        }
    }
}

impl ProtocolAdapter for CoapAdapter {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Coap
    }

    fn ack_mode(&self) -> AckMode {
        AckMode::PerMessage
    }

    fn dedup_policy(&self) -> DedupPolicy {
        DedupPolicy::Lifetime(self.exchange_lifetime)
    }

    fn needs_session(&self) -> bool {
        false
    }

    fn command_budget(&self) -> usize {
        1
    }

    fn encode_uplink(&self, header: &UplinkHeader) -> Vec<u8> {
        let mut out = Vec::new();
        for msg_id in &header.command_acks {
            self.fixed_header(&mut out, TYPE_ACK, 0, CODE_EMPTY, *msg_id);
        }
        let (msg_id, msg_type) = match &header.body {
            UplinkBody::Data { msg_id, confirmable, .. } => (*msg_id, if *confirmable { TYPE_CON } else { TYPE_NON }),
            // CoAP has neither handshake nor keep-alive; an empty CON is a ping
            UplinkBody::SessionRequest { .. } | UplinkBody::KeepAlive => {
                self.fixed_header(&mut out, TYPE_CON, 0, CODE_EMPTY, 0);
                return out;
            }
        };
        self.fixed_header(&mut out, msg_type, self.token_bytes, CODE_POST, msg_id);
        out.extend_from_slice(&self.token(msg_id));
        out.extend_from_slice(&URI_DATA);
        out.push(PAYLOAD_MARKER);
        out
    }

    fn parse_uplink(&self, frame: &[u8]) -> Result<(UplinkHeader, usize), CodecError> {
        let mut at = 0;
        let mut command_acks = Vec::new();
        loop {
            let byte0 = read_u8(frame, at)?;
            let code = read_u8(frame, at + 1)?;
            let msg_id = read_u16(frame, at + 2)?;
            let msg_type = (byte0 >> 4) & 0x03;
            if byte0 >> 6 != VERSION {
                return Err(CodecError::Malformed("unsupported CoAP version"));
            }
            match (msg_type, code) {
                (TYPE_ACK, CODE_EMPTY) => {
                    command_acks.push(msg_id);
                    at += EMPTY_ACK_LEN;
                }
                (TYPE_CON, CODE_EMPTY) => {
                    let mut header = UplinkHeader::new(UplinkBody::KeepAlive);
                    header.command_acks = command_acks;
                    return Ok((header, at + EMPTY_ACK_LEN));
                }
                (TYPE_CON | TYPE_NON, CODE_POST) => {
                    let len = at + Self::header_len(frame, at)?;
                    let confirmable = msg_type == TYPE_CON;
                    let header = UplinkHeader {
                        body: UplinkBody::Data {
                            seq: msg_id,
                            msg_id,
                            priority: if confirmable { QosClass::Normal } else { QosClass::BestEffort },
                            confirmable,
                            retransmission: false,
                            payload_len: frame.len() - len,
                        },
                        token_short: None,
                        epoch_echo: None,
                        command_acks,
                    };
                    return Ok((header, len));
                }
                _ => return Err(CodecError::UnknownType(code)),
            }
        }
    }

    fn encode_downlink(&self, downlink: &Downlink) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(AckInfo::Message { msg_id }) = downlink.ack {
            self.fixed_header(&mut out, TYPE_ACK, self.token_bytes, CODE_CHANGED, msg_id);
            out.extend_from_slice(&self.token(msg_id));
        }
        if let Some(batch) = &downlink.batch {
            for command in &batch.commands {
                let mut message = Vec::new();
                self.fixed_header(&mut message, TYPE_CON, self.token_bytes, CODE_POST, batch.tag);
                message.extend_from_slice(&self.token(batch.tag));
                message.extend_from_slice(&URI_CMD);
                message.push(PAYLOAD_MARKER);
                message.push(command.cmd_type);
                message.extend_from_slice(&command.payload);
                // one-byte length prefix delimits messages sharing a frame
                out.push(message.len() as u8);
                out.extend_from_slice(&message);
            }
        }
        out
    }

    fn parse_downlink(&self, frame: &[u8]) -> Result<Downlink, CodecError> {
        let mut downlink = Downlink::default();
        let mut at = 0;
        if frame.first().is_some_and(|b| (b >> 4) & 0x03 == TYPE_ACK && b >> 6 == VERSION) {
            let msg_id = read_u16(frame, 2)?;
            downlink.ack = Some(AckInfo::Message { msg_id });
            at = 4 + (frame[0] & 0x0F) as usize;
            if at > frame.len() {
                return Err(CodecError::Truncated {
                    needed: at,
                    got: frame.len(),
                });
            }
        }
        while at < frame.len() {
            let len = read_u8(frame, at)? as usize;
            let start = at + 1;
            let end = start + len;
            let message = frame.get(start..end).ok_or(CodecError::Truncated {
                needed: end,
                got: frame.len(),
            })?;
            let tag = read_u16(message, 2)?;
            let header = Self::header_len(message, 0)?;
            let cmd_type = read_u8(message, header)?;
            let batch = downlink.batch.get_or_insert(CommandBatch { tag, commands: Vec::new() });
            batch.commands.push(WireCommand {
                cmd_type,
                payload: message[header + 1..].to_vec(),
            });
            at = end;
        }
        Ok(downlink)
    }

    fn plan(&self, class: QosClass, _target: QosTarget, _delivery_estimate: f64, rng: &mut ChaCha8Rng) -> MessagePlan {
        let confirmable = match class {
            QosClass::Critical => true,
            QosClass::BestEffort => false,
            QosClass::Normal => rng.gen_bool(self.confirmable_ratio.clamp(0.0, 1.0)),
        };
        let initial_timeout = confirmable.then(|| self.ack_timeout.mul_f64(rng.gen_range(1.0..=self.ack_random_factor)));
        MessagePlan {
            confirmable,
            max_attempts: if confirmable { 1 + self.max_retransmit } else { 1 },
            spacing: None,
            initial_timeout,
        }
    }

    fn ack_timeout(&self, plan: &MessagePlan, attempt: u8) -> Option<Duration> {
        let initial = plan.initial_timeout?;
        Some(initial * (1u32 << attempt.saturating_sub(1).min(16)))
    }

    fn state_bytes(&self, view: StateView) -> usize {
        // endpoint + in-flight exchanges + remembered message ids with timestamps
        16 + 30 * view.outstanding + 6 * view.dedup_entries
    }
}
