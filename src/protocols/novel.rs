//! Session-token protocol with windowed bitmap acknowledgment.
//!
//! Uplink header, 5 bytes (6 with an epoch echo):
//!
//! ```text
//! byte 0   : msg_type (3 bits) | priority (2 bits) | topic (3 bits)
//! byte 1-2 : data sequence, big endian
//! byte 3   : flags
//! byte 4   : short token reference
//! byte 5   : low byte of the newest applied epoch (FLAG_EPOCH_ECHO)
//! ```
//!
//! Downlinks reuse the 5-byte header and append, depending on the flags, the
//! ACK bitmap, a granted token and an epoch-tagged command batch.

use std::time::Duration;

use rand_chacha::ChaCha8Rng;

use super::qos_d;
use super::{
    AckInfo, AckMode, CommandBatch, DedupPolicy, Downlink, MessagePlan, ProtocolAdapter, ProtocolKind, SessionControl, StateView, UplinkBody,
    UplinkHeader, WireCommand, read_u8, read_u16,
};
use crate::config::NovelConfig;
use crate::error::CodecError;
use crate::simulation::ack_window::Bitmap;
use crate::simulation::signal_calculations::seconds;
use crate::simulation::types::{QosClass, QosTarget};

pub const HEADER_LEN: usize = 5;

pub const MSG_TELEMETRY: u8 = 0;
pub const MSG_CMD_PULL: u8 = 1;
pub const MSG_CMD_RESP: u8 = 2;
pub const MSG_ACK_BITMAP: u8 = 3;
pub const MSG_CONTROL: u8 = 4;

const FLAG_EPOCH_ECHO: u8 = 0x01;
const FLAG_RETRANSMISSION: u8 = 0x02;

const FLAG_HAS_ACK: u8 = 0x01;
const FLAG_HAS_COMMANDS: u8 = 0x02;
const FLAG_TOKEN_GRANT: u8 = 0x04;
const FLAG_TOKEN_EXPIRED: u8 = 0x08;

/// One-byte reference to a session token carried in every data uplink.
pub fn token_short(token: &[u8]) -> u8 {
    token.iter().fold(0x5A, |acc, b| acc.rotate_left(1) ^ b)
}

#[derive(Debug, Clone)]
pub struct NovelAdapter {
    ack_window: u32,
    max_aggregation_delay: Duration,
    token_bytes: usize,
    command_budget: usize,
    max_attempts: u8,
}

impl NovelAdapter {
    pub fn new(config: &NovelConfig) -> Self {
        Self {
            ack_window: config.ack_window as u32,
            max_aggregation_delay: seconds(config.max_aggregation_delay_s),
            token_bytes: config.token_bytes,
            command_budget: config.command_budget,
            max_attempts: config.max_attempts,
        }
    }

    fn first_byte(msg_type: u8, priority: QosClass) -> u8 {
        (msg_type << 5) | (priority.wire_priority() << 3)
    }
}

impl ProtocolAdapter for NovelAdapter {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Novel
    }

    fn ack_mode(&self) -> AckMode {
        AckMode::WindowedBitmap {
            width: self.ack_window,
            max_delay: self.max_aggregation_delay,
        }
    }

    fn dedup_policy(&self) -> DedupPolicy {
        DedupPolicy::Epoch
    }

    fn needs_session(&self) -> bool {
        true
    }

    fn command_budget(&self) -> usize {
        self.command_budget
    }

    fn encode_uplink(&self, header: &UplinkHeader) -> Vec<u8> {
        let (byte0, seq, mut flags) = match &header.body {
            UplinkBody::Data {
                seq,
                priority,
                retransmission,
                ..
            } => (
                Self::first_byte(MSG_TELEMETRY, *priority),
                *seq,
                if *retransmission { FLAG_RETRANSMISSION } else { 0 },
            ),
            UplinkBody::SessionRequest { next_seq } => (Self::first_byte(MSG_CONTROL, QosClass::Critical), *next_seq, 0),
            UplinkBody::KeepAlive => (Self::first_byte(MSG_CMD_PULL, QosClass::BestEffort), 0, 0),
        };
        if header.epoch_echo.is_some() {
            flags |= FLAG_EPOCH_ECHO;
        }
        let mut out = Vec::with_capacity(HEADER_LEN + 1);
        out.push(byte0);
        out.extend_from_slice(&seq.to_be_bytes());
        out.push(flags);
        out.push(header.token_short.unwrap_or(0));
        if let Some(echo) = header.epoch_echo {
            out.push(echo);
        }
        out
    }

    fn parse_uplink(&self, frame: &[u8]) -> Result<(UplinkHeader, usize), CodecError> {
        let byte0 = read_u8(frame, 0)?;
        let seq = read_u16(frame, 1)?;
        let flags = read_u8(frame, 3)?;
        let token = read_u8(frame, 4)?;
        let mut len = HEADER_LEN;
        let epoch_echo = if flags & FLAG_EPOCH_ECHO != 0 {
            len += 1;
            Some(read_u8(frame, 5)?)
        } else {
            None
        };
        let priority = QosClass::from_wire_priority((byte0 >> 3) & 0x03);
        let body = match byte0 >> 5 {
            MSG_TELEMETRY => UplinkBody::Data {
                seq,
                msg_id: seq,
                priority,
                confirmable: true,
                retransmission: flags & FLAG_RETRANSMISSION != 0,
                payload_len: frame.len() - len,
            },
            MSG_CONTROL => UplinkBody::SessionRequest { next_seq: seq },
            MSG_CMD_PULL => UplinkBody::KeepAlive,
            other => return Err(CodecError::UnknownType(other)),
        };
        Ok((
            UplinkHeader {
                body,
                token_short: Some(token),
                epoch_echo,
                command_acks: Vec::new(),
            },
            len,
        ))
    }

    fn encode_downlink(&self, downlink: &Downlink) -> Vec<u8> {
        let mut flags = 0;
        let mut base = 0u16;
        let msg_type = match (&downlink.ack, &downlink.batch) {
            (Some(_), _) => MSG_ACK_BITMAP,
            (None, Some(_)) => MSG_CMD_RESP,
            (None, None) => MSG_CONTROL,
        };
        let mut body = Vec::new();
        if let Some(AckInfo::Bitmap(bitmap)) = &downlink.ack {
            flags |= FLAG_HAS_ACK;
            base = bitmap.base as u16;
            let n = Bitmap::byte_len(self.ack_window);
            body.extend_from_slice(&bitmap.bits.to_le_bytes()[..n]);
        }
        match &downlink.session {
            Some(SessionControl::Granted { token }) => {
                flags |= FLAG_TOKEN_GRANT;
                body.push(token.len() as u8);
                body.extend_from_slice(token);
            }
            Some(SessionControl::Expired) => flags |= FLAG_TOKEN_EXPIRED,
            Some(SessionControl::Connected) | None => {}
        }
        if let Some(batch) = &downlink.batch {
            flags |= FLAG_HAS_COMMANDS;
            body.extend_from_slice(&batch.tag.to_be_bytes());
            body.push(batch.commands.len() as u8);
            for command in &batch.commands {
                body.push(command.cmd_type);
                body.push(command.payload.len() as u8);
                body.extend_from_slice(&command.payload);
            }
        }

        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.push(Self::first_byte(msg_type, QosClass::Critical));
        out.extend_from_slice(&base.to_be_bytes());
        out.push(flags);
        out.push(0);
        out.extend_from_slice(&body);
        out
    }

    fn parse_downlink(&self, frame: &[u8]) -> Result<Downlink, CodecError> {
        let byte0 = read_u8(frame, 0)?;
        if !matches!(byte0 >> 5, MSG_ACK_BITMAP | MSG_CMD_RESP | MSG_CONTROL) {
            return Err(CodecError::UnknownType(byte0 >> 5));
        }
        let base = read_u16(frame, 1)?;
        let flags = read_u8(frame, 3)?;
        let mut at = HEADER_LEN;
        let mut downlink = Downlink::default();

        if flags & FLAG_HAS_ACK != 0 {
            let n = Bitmap::byte_len(self.ack_window);
            let bytes = frame.get(at..at + n).ok_or(CodecError::Truncated {
                needed: at + n,
                got: frame.len(),
            })?;
            let mut raw = [0u8; 8];
            raw[..n].copy_from_slice(bytes);
            at += n;
            downlink.ack = Some(AckInfo::Bitmap(Bitmap {
                base: base as u32,
                width: self.ack_window,
                bits: u64::from_le_bytes(raw),
            }));
        }
        if flags & FLAG_TOKEN_GRANT != 0 {
            let len = read_u8(frame, at)? as usize;
            let token = frame.get(at + 1..at + 1 + len).ok_or(CodecError::Truncated {
                needed: at + 1 + len,
                got: frame.len(),
            })?;
            downlink.session = Some(SessionControl::Granted { token: token.to_vec() });
            at += 1 + len;
        } else if flags & FLAG_TOKEN_EXPIRED != 0 {
            downlink.session = Some(SessionControl::Expired);
        }
        if flags & FLAG_HAS_COMMANDS != 0 {
            let tag = read_u16(frame, at)?;
            let count = read_u8(frame, at + 2)?;
            at += 3;
            let mut commands = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let cmd_type = read_u8(frame, at)?;
                let len = read_u8(frame, at + 1)? as usize;
                let payload = frame.get(at + 2..at + 2 + len).ok_or(CodecError::Truncated {
                    needed: at + 2 + len,
                    got: frame.len(),
                })?;
                commands.push(WireCommand {
                    cmd_type,
                    payload: payload.to_vec(),
                });
                at += 2 + len;
            }
            downlink.batch = Some(CommandBatch { tag, commands });
        }
        if at != frame.len() {
            return Err(CodecError::Malformed("trailing bytes after downlink body"));
        }
        Ok(downlink)
    }

    fn plan(&self, _class: QosClass, target: QosTarget, delivery_estimate: f64, _rng: &mut ChaCha8Rng) -> MessagePlan {
        let plan = qos_d::plan(target, delivery_estimate, self.max_attempts);
        MessagePlan {
            confirmable: true,
            max_attempts: plan.attempts,
            spacing: Some(plan.spacing),
            initial_timeout: None,
        }
    }

    fn ack_timeout(&self, _plan: &MessagePlan, _attempt: u8) -> Option<Duration> {
        None
    }

    fn state_bytes(&self, _view: StateView) -> usize {
        // token + seq + epoch + flags + delivery estimate
        self.token_bytes + 2 + 2 + 1 + 1
    }
}
