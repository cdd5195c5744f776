//! MQTT-SN style baseline.
//!
//! Frames are sequences of MQTT-SN messages, each starting with its own
//! length byte. An uplink carries PUBACKs for received commands followed by
//! one PUBLISH, CONNECT or PINGREQ; a downlink carries any of PUBACK, CONNACK
//! and a PUBLISH holding one command.

use std::time::Duration;

use rand_chacha::ChaCha8Rng;

use super::{
    AckInfo, AckMode, CommandBatch, DedupPolicy, Downlink, MessagePlan, ProtocolAdapter, ProtocolKind, SessionControl, StateView, UplinkBody,
    UplinkHeader, WireCommand, read_u8, read_u16,
};
use crate::config::MqttSnConfig;
use crate::error::CodecError;
use crate::simulation::signal_calculations::seconds;
use crate::simulation::types::{QosClass, QosTarget};

pub const CONNECT: u8 = 0x04;
pub const CONNACK: u8 = 0x05;
pub const PUBLISH: u8 = 0x0C;
pub const PUBACK: u8 = 0x0D;
pub const PINGREQ: u8 = 0x16;

pub const PUBLISH_HEADER_LEN: usize = 7;
/// PUBLISH fields after the length: type, flags, topic id, message id.
const PUBLISH_FIELDS: usize = PUBLISH_HEADER_LEN - 1;
/// First length byte announcing the three-byte form.
const LONG_LENGTH: u8 = 0x01;
const PUBACK_LEN: usize = 7;
const CONNACK_LEN: usize = 3;

const FLAG_DUP: u8 = 0x80;
const FLAG_QOS1: u8 = 0x20;
const FLAG_CLEAN_SESSION: u8 = 0x04;
const PROTOCOL_ID: u8 = 0x01;

#[derive(Debug, Clone)]
pub struct MqttSnAdapter {
    retry_interval: Duration,
    max_retries: u8,
    keep_alive: Option<Duration>,
    dedup_cache: usize,
    topic_id: u16,
    client_id_bytes: usize,
}

impl MqttSnAdapter {
    pub fn new(config: &MqttSnConfig) -> Self {
        Self {
            retry_interval: seconds(config.retry_interval_s),
            max_retries: config.max_retries,
            keep_alive: (config.keep_alive_s > 0.0).then(|| seconds(config.keep_alive_s)),
            dedup_cache: config.dedup_cache,
            topic_id: config.topic_id,
            client_id_bytes: config.client_id_bytes,
        }
    }

    /// Length field for a message with `rest` bytes after it. Messages
    /// longer than 255 bytes use `0x01` followed by a big-endian u16.
    fn push_length(out: &mut Vec<u8>, rest: usize) {
        if rest < u8::MAX as usize {
            out.push((rest + 1) as u8);
        } else {
            out.push(LONG_LENGTH);
            out.extend_from_slice(&u16::try_from(rest + 3).unwrap_or(u16::MAX).to_be_bytes());
        }
    }

    /// Total message length and the size of its length field.
    fn read_length(frame: &[u8], at: usize) -> Result<(usize, usize), CodecError> {
        match read_u8(frame, at)? {
            LONG_LENGTH => Ok((read_u16(frame, at + 1)? as usize, 3)),
            short => Ok((short as usize, 1)),
        }
    }

    fn puback(&self, out: &mut Vec<u8>, msg_id: u16) {
        out.push(PUBACK_LEN as u8);
        out.push(PUBACK);
        out.extend_from_slice(&self.topic_id.to_be_bytes());
        out.extend_from_slice(&msg_id.to_be_bytes());
        out.push(0x00);
    }
}

impl ProtocolAdapter for MqttSnAdapter {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::MqttSn
    }

    fn ack_mode(&self) -> AckMode {
        AckMode::PerMessage
    }

    fn dedup_policy(&self) -> DedupPolicy {
        DedupPolicy::RecentIds(self.dedup_cache)
    }

    fn needs_session(&self) -> bool {
        true
    }

    fn command_budget(&self) -> usize {
        1
    }

    fn keep_alive(&self) -> Option<Duration> {
        self.keep_alive
    }

    fn encode_uplink(&self, header: &UplinkHeader) -> Vec<u8> {
        let mut out = Vec::new();
        for msg_id in &header.command_acks {
            self.puback(&mut out, *msg_id);
        }
        match &header.body {
            UplinkBody::Data {
                msg_id,
                confirmable,
                retransmission,
                payload_len,
                ..
            } => {
                let mut flags = if *confirmable { FLAG_QOS1 } else { 0 };
                if *retransmission {
                    flags |= FLAG_DUP;
                }
                Self::push_length(&mut out, PUBLISH_FIELDS + payload_len);
                out.push(PUBLISH);
                out.push(flags);
                out.extend_from_slice(&self.topic_id.to_be_bytes());
                out.extend_from_slice(&msg_id.to_be_bytes());
            }
            UplinkBody::SessionRequest { .. } => {
                let keep_alive = self.keep_alive.map_or(0, |d| d.as_secs().min(u16::MAX as u64) as u16);
                Self::push_length(&mut out, 5 + self.client_id_bytes);
                out.push(CONNECT);
                out.push(FLAG_CLEAN_SESSION);
                out.push(PROTOCOL_ID);
                out.extend_from_slice(&keep_alive.to_be_bytes());
                out.extend(std::iter::repeat_n(b'd', self.client_id_bytes));
            }
            UplinkBody::KeepAlive => {
                out.push(2);
                out.push(PINGREQ);
            }
        }
        out
    }

    fn parse_uplink(&self, frame: &[u8]) -> Result<(UplinkHeader, usize), CodecError> {
        let mut at = 0;
        let mut command_acks = Vec::new();
        loop {
            let (len, field) = Self::read_length(frame, at)?;
            let msg_type = read_u8(frame, at + field)?;
            if len < field + 1 {
                return Err(CodecError::Malformed("MQTT-SN length shorter than its header"));
            }
            match msg_type {
                PUBACK => {
                    command_acks.push(read_u16(frame, at + field + 3)?);
                    at += len;
                }
                PUBLISH => {
                    let flags = read_u8(frame, at + field + 1)?;
                    let msg_id = read_u16(frame, at + field + 4)?;
                    let header_end = at + field + PUBLISH_FIELDS;
                    let payload_len = frame.len().saturating_sub(header_end);
                    let header = UplinkHeader {
                        body: UplinkBody::Data {
                            seq: msg_id,
                            msg_id,
                            priority: if flags & FLAG_QOS1 != 0 { QosClass::Normal } else { QosClass::BestEffort },
                            confirmable: flags & FLAG_QOS1 != 0,
                            retransmission: flags & FLAG_DUP != 0,
                            payload_len,
                        },
                        token_short: None,
                        epoch_echo: None,
                        command_acks,
                    };
                    return Ok((header, header_end));
                }
                CONNECT => {
                    let mut header = UplinkHeader::new(UplinkBody::SessionRequest { next_seq: 0 });
                    header.command_acks = command_acks;
                    return Ok((header, at + len));
                }
                PINGREQ => {
                    let mut header = UplinkHeader::new(UplinkBody::KeepAlive);
                    header.command_acks = command_acks;
                    return Ok((header, at + len));
                }
                other => return Err(CodecError::UnknownType(other)),
            }
        }
    }

    fn encode_downlink(&self, downlink: &Downlink) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(AckInfo::Message { msg_id }) = downlink.ack {
            self.puback(&mut out, msg_id);
        }
        if let Some(SessionControl::Connected) = downlink.session {
            out.extend_from_slice(&[CONNACK_LEN as u8, CONNACK, 0x00]);
        }
        if let Some(batch) = &downlink.batch {
            for command in &batch.commands {
                Self::push_length(&mut out, PUBLISH_FIELDS + 1 + command.payload.len());
                out.push(PUBLISH);
                out.push(FLAG_QOS1);
                out.extend_from_slice(&self.topic_id.to_be_bytes());
                out.extend_from_slice(&batch.tag.to_be_bytes());
                out.push(command.cmd_type);
                out.extend_from_slice(&command.payload);
            }
        }
        out
    }

    fn parse_downlink(&self, frame: &[u8]) -> Result<Downlink, CodecError> {
        let mut downlink = Downlink::default();
        let mut at = 0;
        while at < frame.len() {
            let (len, field) = Self::read_length(frame, at)?;
            let msg_type = read_u8(frame, at + field)?;
            if len < field + 1 || at + len > frame.len() {
                return Err(CodecError::Truncated {
                    needed: at + len.max(field + 1),
                    got: frame.len(),
                });
            }
            match msg_type {
                PUBACK => {
                    downlink.ack = Some(AckInfo::Message {
                        msg_id: read_u16(frame, at + field + 3)?,
                    });
                }
                CONNACK => downlink.session = Some(SessionControl::Connected),
                PUBLISH => {
                    let header_end = at + field + PUBLISH_FIELDS;
                    let tag = read_u16(frame, at + field + 4)?;
                    let cmd_type = read_u8(frame, header_end)?;
                    if header_end + 1 > at + len {
                        return Err(CodecError::Malformed("MQTT-SN command PUBLISH without a type"));
                    }
                    let payload = frame[header_end + 1..at + len].to_vec();
                    let batch = downlink.batch.get_or_insert(CommandBatch { tag, commands: Vec::new() });
                    batch.commands.push(WireCommand { cmd_type, payload });
                }
                other => return Err(CodecError::UnknownType(other)),
            }
            at += len;
        }
        Ok(downlink)
    }

    fn plan(&self, class: QosClass, _target: QosTarget, _delivery_estimate: f64, _rng: &mut ChaCha8Rng) -> MessagePlan {
        // QoS 1 for critical and normal traffic, QoS 0 for best effort
        let confirmable = class != QosClass::BestEffort;
        MessagePlan {
            confirmable,
            max_attempts: if confirmable { 1 + self.max_retries } else { 1 },
            spacing: None,
            initial_timeout: confirmable.then_some(self.retry_interval),
        }
    }

    fn ack_timeout(&self, plan: &MessagePlan, _attempt: u8) -> Option<Duration> {
        plan.confirmable.then_some(self.retry_interval)
    }

    fn state_bytes(&self, view: StateView) -> usize {
        // session + one registered topic + in-flight PUBLISHes + recent command ids
        32 + 20 + 50 * view.outstanding + 2 * view.dedup_entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::types::{RngStream, seeded_stream};

    fn adapter() -> MqttSnAdapter {
        MqttSnAdapter::new(&MqttSnConfig::default())
    }

    fn publish(msg_id: u16, confirmable: bool) -> UplinkHeader {
        UplinkHeader::new(UplinkBody::Data {
            seq: msg_id,
            msg_id,
            priority: QosClass::Normal,
            confirmable,
            retransmission: false,
            payload_len: 20,
        })
    }

    #[test]
    fn publish_header_is_seven_bytes() {
        let a = adapter();
        let bytes = a.encode_uplink(&publish(0x0102, true));
        assert_eq!(bytes.len(), PUBLISH_HEADER_LEN);
        assert_eq!(bytes[0] as usize, PUBLISH_HEADER_LEN + 20);
        assert_eq!(bytes[1], PUBLISH);
        assert_eq!(bytes[2], FLAG_QOS1);
        assert_eq!(&bytes[5..7], &[0x01, 0x02]);
    }

    #[test]
    fn long_publish_uses_three_byte_length() {
        let a = adapter();
        let mut header = publish(9, true);
        if let UplinkBody::Data { payload_len, .. } = &mut header.body {
            *payload_len = 1200;
        }
        let mut frame = a.encode_uplink(&header);
        assert_eq!(frame.len(), PUBLISH_HEADER_LEN + 2);
        assert_eq!(frame[0], 0x01);
        assert_eq!(u16::from_be_bytes([frame[1], frame[2]]) as usize, PUBLISH_HEADER_LEN + 2 + 1200);
        assert_eq!(frame[3], PUBLISH);

        frame.extend(std::iter::repeat_n(0u8, 1200));
        let (parsed, len) = a.parse_uplink(&frame).unwrap();
        assert_eq!(len, PUBLISH_HEADER_LEN + 2);
        assert!(matches!(parsed.body, UplinkBody::Data { msg_id: 9, payload_len: 1200, .. }));
    }

    #[test]
    fn long_command_publish_survives_downlink() {
        let a = adapter();
        let downlink = Downlink {
            ack: Some(AckInfo::Message { msg_id: 4 }),
            session: None,
            batch: Some(CommandBatch {
                tag: 12,
                commands: vec![WireCommand {
                    cmd_type: 254,
                    payload: vec![7; 255],
                }],
            }),
        };
        let frame = a.encode_downlink(&downlink);
        assert_eq!(frame.len(), 7 + 9 + 1 + 255);
        assert_eq!(frame[7], 0x01);
        assert_eq!(a.parse_downlink(&frame).unwrap(), downlink);
    }

    #[test]
    fn command_pubacks_ride_in_front_of_publish() {
        let a = adapter();
        let mut header = publish(5, false);
        header.command_acks = vec![11, 12];
        let mut frame = a.encode_uplink(&header);
        assert_eq!(frame.len(), 2 * 7 + 7);
        frame.extend_from_slice(&[0u8; 20]);
        let (parsed, len) = a.parse_uplink(&frame).unwrap();
        assert_eq!(len, 21);
        assert_eq!(parsed.command_acks, vec![11, 12]);
        assert!(matches!(
            parsed.body,
            UplinkBody::Data {
                msg_id: 5,
                confirmable: false,
                payload_len: 20,
                ..
            }
        ));
    }

    #[test]
    fn connect_and_ping_parse() {
        let a = adapter();
        let connect = a.encode_uplink(&UplinkHeader::new(UplinkBody::SessionRequest { next_seq: 0 }));
        assert_eq!(connect.len(), 6 + 8);
        assert!(matches!(a.parse_uplink(&connect).unwrap().0.body, UplinkBody::SessionRequest { .. }));
        let ping = a.encode_uplink(&UplinkHeader::new(UplinkBody::KeepAlive));
        assert_eq!(ping, vec![2, PINGREQ]);
        assert_eq!(a.parse_uplink(&ping).unwrap().0.body, UplinkBody::KeepAlive);
    }

    #[test]
    fn downlink_roundtrip_with_puback_connack_and_command() {
        let a = adapter();
        let downlink = Downlink {
            ack: Some(AckInfo::Message { msg_id: 77 }),
            session: Some(SessionControl::Connected),
            batch: Some(CommandBatch {
                tag: 300,
                commands: vec![WireCommand {
                    cmd_type: 3,
                    payload: vec![1, 2],
                }],
            }),
        };
        let frame = a.encode_downlink(&downlink);
        assert_eq!(frame.len(), 7 + 3 + 7 + 1 + 2);
        assert_eq!(a.parse_downlink(&frame).unwrap(), downlink);
    }

    #[test]
    fn best_effort_is_qos0_and_others_retry_three_times() {
        let a = adapter();
        let mut rng = seeded_stream(1, RngStream::Protocol);
        let target = QosTarget {
            deadline: Duration::from_secs(600),
            probability: 0.99,
        };
        let qos0 = a.plan(QosClass::BestEffort, target, 0.9, &mut rng);
        assert!(!qos0.confirmable);
        assert_eq!(qos0.max_attempts, 1);
        assert_eq!(a.ack_timeout(&qos0, 1), None);

        let qos1 = a.plan(QosClass::Critical, target, 0.9, &mut rng);
        assert!(qos1.confirmable);
        assert_eq!(qos1.max_attempts, 4);
        assert_eq!(a.ack_timeout(&qos1, 1), Some(Duration::from_secs(10)));
        assert_eq!(a.ack_timeout(&qos1, 3), Some(Duration::from_secs(10)));
    }

    #[test]
    fn state_grows_with_in_flight_messages() {
        let a = adapter();
        let idle = a.state_bytes(StateView::default());
        let busy = a.state_bytes(StateView {
            outstanding: 2,
            dedup_entries: 8,
        });
        assert_eq!(idle, 52);
        assert_eq!(busy, 52 + 100 + 16);
    }
}
