//! Gateway state: sessions, acknowledgment aggregation and command queues.
//!
//! The gateway never transmits on its own. Every downlink is composed in the
//! receive window that follows a device uplink, in two steps mirroring the
//! device side: [`Gateway::prepare_downlink`] assembles what is pending
//! without consuming it, and [`Gateway::commit_downlink`] consumes it once the
//! radio and the duty-cycle budget allow the transmission. A downlink that
//! cannot go out leaves everything pending for the next window.

use std::collections::VecDeque;
use std::time::Duration;

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use super::ack_window::AckWindow;
use super::types::{Command, CommandId, DeviceId, RngStream, seeded_stream};
use crate::config::RunConfig;
use crate::error::SimError;
use crate::protocols::novel::token_short;
use crate::protocols::{AckInfo, AckMode, CommandBatch, Downlink, ProtocolAdapter, SessionControl, UplinkBody, WireCommand, unwrap_forward};
use crate::simulation::signal_calculations::seconds;

#[derive(Debug, Clone)]
struct TokenEntry {
    short: u8,
    expires_at: Duration,
}

#[derive(Debug, Clone)]
struct QueuedCommand {
    command: Command,
    /// Epoch the command will be delivered under (novel protocol).
    epoch: u16,
}

/// A sealed batch that was sent and not confirmed yet.
#[derive(Debug, Clone)]
struct InFlightBatch {
    tag: u16,
    commands: Vec<Command>,
}

impl InFlightBatch {
    fn wire(&self) -> CommandBatch {
        CommandBatch {
            tag: self.tag,
            commands: self.commands.iter().map(wire_command).collect(),
        }
    }
}

fn wire_command(command: &Command) -> WireCommand {
    WireCommand {
        cmd_type: command.cmd_type,
        payload: command.payload.clone(),
    }
}

#[derive(Debug, Default)]
struct DeviceSession {
    token: Option<TokenEntry>,
    tokens_issued: u32,
    connected: bool,
    last_frame_counter: Option<u32>,
    last_data_seq: Option<u32>,
    window: Option<AckWindow>,
    /// Message id of the last confirmable uplink not acknowledged yet.
    pending_ack: Option<u16>,
    pending_session: Option<SessionControl>,
    queue: VecDeque<QueuedCommand>,
    open_epoch: u16,
    next_command_id: u16,
    in_flight: Option<InFlightBatch>,
}

/// What the gateway made of one received uplink.
#[derive(Debug, Clone, Default)]
pub struct UplinkReceipt {
    /// `None` when the frame could not be parsed.
    pub body: Option<UplinkBody>,
    pub header_len: usize,
    /// Data frame accepted into the session.
    pub data_accepted: bool,
    pub token_rejected: bool,
    /// `Some(renewal)` when a token was issued.
    pub token_issued: Option<bool>,
    /// Commands whose delivery this uplink confirmed.
    pub confirmed: Vec<Command>,
}

pub struct Gateway {
    sessions: Vec<DeviceSession>,
    ack_mode: AckMode,
    uses_epochs: bool,
    needs_session: bool,
    command_budget: usize,
    token_bytes: usize,
    token_lifetime: Duration,
    busy_until: Duration,
    rng: ChaCha8Rng,
}

impl Gateway {
    pub fn new(config: &RunConfig, adapter: &dyn ProtocolAdapter) -> Self {
        let ack_mode = adapter.ack_mode();
        Self {
            sessions: (0..config.network.device_count)
                .map(|_| DeviceSession {
                    open_epoch: 1,
                    next_command_id: 1,
                    ..DeviceSession::default()
                })
                .collect(),
            uses_epochs: matches!(ack_mode, AckMode::WindowedBitmap { .. }),
            ack_mode,
            needs_session: adapter.needs_session(),
            command_budget: adapter.command_budget().max(1),
            token_bytes: config.novel.token_bytes,
            token_lifetime: seconds(config.novel.token_lifetime_s),
            busy_until: Duration::ZERO,
            rng: seeded_stream(config.seed, RngStream::Gateway),
        }
    }

    fn session(&mut self, device: DeviceId, now: Duration) -> Result<&mut DeviceSession, SimError> {
        self.sessions
            .get_mut(device as usize)
            .ok_or_else(|| SimError::invariant(format!("device {device}"), now, "unknown to the gateway"))
    }

    /// Commands queued or in flight for `device`.
    pub fn queued_commands(&self, device: DeviceId) -> usize {
        self.sessions.get(device as usize).map_or(0, |s| {
            s.queue.len() + s.in_flight.as_ref().map_or(0, |f| f.commands.len())
        })
    }

    pub fn enqueue_command(&mut self, command: Command) -> Result<(), SimError> {
        let at = command.arrived_at;
        let session = self.session(command.device, at)?;
        let epoch = session.open_epoch;
        session.queue.push_back(QueuedCommand { command, epoch });
        Ok(())
    }

    /// Process a successfully received uplink frame.
    ///
    /// # Errors
    ///
    /// [`SimError::SequenceRegression`] when the link frame counter does not
    /// strictly increase.
    pub fn receive_uplink(
        &mut self,
        device: DeviceId,
        frame_counter: u32,
        frame: &[u8],
        now: Duration,
        adapter: &dyn ProtocolAdapter,
    ) -> Result<UplinkReceipt, SimError> {
        let ack_mode = self.ack_mode;
        let uses_epochs = self.uses_epochs;
        let needs_session = self.needs_session;
        let token_lifetime = self.token_lifetime;
        let token_bytes = self.token_bytes;
        let rng = &mut self.rng;
        let session = self
            .sessions
            .get_mut(device as usize)
            .ok_or_else(|| SimError::invariant(format!("device {device}"), now, "unknown to the gateway"))?;

        if let Some(last) = session.last_frame_counter {
            if frame_counter <= last {
                return Err(SimError::SequenceRegression {
                    device,
                    last,
                    received: frame_counter,
                    time: now,
                });
            }
        }
        session.last_frame_counter = Some(frame_counter);

        let (header, header_len) = match adapter.parse_uplink(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::warn!("device {device}: dropping unreadable uplink at {now:?}: {e}");
                return Ok(UplinkReceipt::default());
            }
        };
        let mut receipt = UplinkReceipt {
            body: Some(header.body.clone()),
            header_len,
            ..UplinkReceipt::default()
        };

        // delivery confirmations ride on any uplink
        if let Some(batch) = &session.in_flight {
            let confirmed = if uses_epochs {
                header.epoch_echo == Some(batch.tag as u8)
            } else {
                header.command_acks.contains(&batch.tag)
            };
            if confirmed {
                receipt.confirmed = session.in_flight.take().map(|b| b.commands).unwrap_or_default();
            }
        }

        match header.body {
            UplinkBody::SessionRequest { next_seq } => match ack_mode {
                AckMode::WindowedBitmap { width, max_delay } => {
                    let token = fresh_token(rng, token_bytes);
                    session.tokens_issued += 1;
                    receipt.token_issued = Some(session.tokens_issued > 1);
                    session.token = Some(TokenEntry {
                        short: token_short(&token),
                        expires_at: now + token_lifetime,
                    });
                    session.pending_session = Some(SessionControl::Granted { token });
                    if session.window.is_none() {
                        let base = reconstruct(session.last_data_seq, 0, next_seq);
                        session.window = Some(AckWindow::new(width, base, max_delay));
                    }
                }
                AckMode::PerMessage => {
                    session.connected = true;
                    session.pending_session = Some(SessionControl::Connected);
                }
            },
            UplinkBody::Data { seq, msg_id, confirmable, .. } => match ack_mode {
                AckMode::WindowedBitmap { .. } => {
                    let valid = session
                        .token
                        .as_ref()
                        .is_some_and(|t| now < t.expires_at && header.token_short == Some(t.short));
                    if !valid {
                        log::debug!("device {device}: stale or unknown token at {now:?}");
                        session.token = None;
                        session.pending_session = Some(SessionControl::Expired);
                        receipt.token_rejected = true;
                        return Ok(receipt);
                    }
                    let base = session.window.as_ref().map_or(0, AckWindow::base);
                    let seq = reconstruct(session.last_data_seq, base, seq);
                    session.last_data_seq = Some(seq);
                    if let Some(window) = session.window.as_mut() {
                        window.record(seq, now);
                    }
                    receipt.data_accepted = true;
                }
                AckMode::PerMessage => {
                    if needs_session && !session.connected {
                        log::debug!("device {device}: data before CONNECT accepted");
                    }
                    if confirmable {
                        session.pending_ack = Some(msg_id);
                    }
                    receipt.data_accepted = true;
                }
            },
            UplinkBody::KeepAlive => {}
        }
        Ok(receipt)
    }

    /// Drop commands whose deadline passed, including an in-flight batch
    /// once every command in it expired.
    pub fn expire_commands(&mut self, device: DeviceId, now: Duration) -> Result<Vec<Command>, SimError> {
        let session = self.session(device, now)?;
        let mut expired = Vec::new();
        session.queue.retain(|q| {
            if q.command.expired(now) {
                expired.push(q.command.clone());
                false
            } else {
                true
            }
        });
        if session.in_flight.as_ref().is_some_and(|b| b.commands.iter().all(|c| c.expired(now))) {
            expired.extend(session.in_flight.take().map(|b| b.commands).unwrap_or_default());
        }
        Ok(expired)
    }

    /// Everything pending for `device`, without consuming it.
    pub fn prepare_downlink(&self, device: DeviceId, now: Duration) -> Option<Downlink> {
        let session = self.sessions.get(device as usize)?;
        let ack = match self.ack_mode {
            AckMode::WindowedBitmap { .. } => session.window.as_ref().and_then(|w| w.peek(now)).map(AckInfo::Bitmap),
            AckMode::PerMessage => session.pending_ack.map(|msg_id| AckInfo::Message { msg_id }),
        };
        let batch = match &session.in_flight {
            Some(in_flight) => Some(in_flight.wire()),
            None if session.queue.is_empty() => None,
            None => {
                let tag = if self.uses_epochs {
                    session.queue.front().map_or(session.open_epoch, |q| q.epoch)
                } else {
                    session.next_command_id
                };
                Some(CommandBatch {
                    tag,
                    commands: session.queue.iter().take(self.command_budget).map(|q| wire_command(&q.command)).collect(),
                })
            }
        };
        let downlink = Downlink {
            ack,
            session: session.pending_session.clone(),
            batch,
        };
        (!downlink.is_empty()).then_some(downlink)
    }

    /// Consume what `downlink` carries. Returns the ids of the commands in it.
    pub fn commit_downlink(&mut self, device: DeviceId, downlink: &Downlink, now: Duration) -> Result<Vec<CommandId>, SimError> {
        let uses_epochs = self.uses_epochs;
        let session = self.session(device, now)?;
        match downlink.ack {
            Some(AckInfo::Bitmap(_)) => {
                if let Some(window) = session.window.as_mut() {
                    window.take(now);
                }
            }
            Some(AckInfo::Message { .. }) => session.pending_ack = None,
            None => {}
        }
        if downlink.session.is_some() {
            session.pending_session = None;
        }
        let Some(batch) = &downlink.batch else {
            return Ok(Vec::new());
        };
        if session.in_flight.is_none() {
            let count = batch.commands.len().min(session.queue.len());
            let commands: Vec<Command> = session.queue.drain(..count).map(|q| q.command).collect();
            if uses_epochs {
                session.open_epoch = session.open_epoch.wrapping_add(1);
                let open = session.open_epoch;
                for q in session.queue.iter_mut() {
                    q.epoch = open;
                }
            } else {
                session.next_command_id = session.next_command_id.wrapping_add(1).max(1);
            }
            session.in_flight = Some(InFlightBatch { tag: batch.tag, commands });
        }
        Ok(session.in_flight.as_ref().map(|b| b.commands.iter().map(|c| c.id).collect()).unwrap_or_default())
    }

    /// Whether the gateway radio is free for a downlink starting at `start`.
    pub fn radio_free(&self, start: Duration) -> bool {
        start >= self.busy_until
    }

    pub fn occupy_radio(&mut self, start: Duration, airtime: Duration) {
        self.busy_until = self.busy_until.max(start + airtime);
    }
}

fn fresh_token(rng: &mut ChaCha8Rng, len: usize) -> Vec<u8> {
    (0..len).map(|_| rng.gen_range(0..=u8::MAX)).collect()
}

/// Rebuild a 32-bit data sequence from its 16 wire bits: newer than the last
/// one seen, or at/after `base` for the first frame of a session.
fn reconstruct(last: Option<u32>, base: u32, wire: u16) -> u32 {
    match last {
        Some(last) => unwrap_forward(last, wire),
        None => {
            let candidate = (base & !0xFFFF) | wire as u32;
            if candidate < base { candidate + 0x1_0000 } else { candidate }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NovelConfig;
    use crate::protocols::{MqttSnAdapter, NovelAdapter, UplinkHeader};
    use crate::simulation::types::QosClass;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn novel_config() -> RunConfig {
        let mut config = RunConfig::default();
        config.network.device_count = 2;
        config.novel = NovelConfig {
            ack_window: 4,
            ..NovelConfig::default()
        };
        config
    }

    fn data(adapter: &dyn ProtocolAdapter, seq: u16, token: Option<u8>, echo: Option<u8>) -> Vec<u8> {
        let mut header = UplinkHeader::new(UplinkBody::Data {
            seq,
            msg_id: seq,
            priority: QosClass::Normal,
            confirmable: true,
            retransmission: false,
            payload_len: 10,
        });
        header.token_short = token;
        header.epoch_echo = echo;
        let mut frame = adapter.encode_uplink(&header);
        frame.extend_from_slice(&[0; 10]);
        frame
    }

    fn command(id: CommandId, arrived: u64) -> Command {
        Command {
            id,
            device: 0,
            cmd_type: 1,
            payload: vec![id as u8],
            priority: QosClass::Normal,
            arrived_at: secs(arrived),
            deadline: secs(3600),
        }
    }

    /// Request a token and return its short reference.
    fn open_session(gateway: &mut Gateway, adapter: &dyn ProtocolAdapter, fcnt: u32, now: Duration) -> u8 {
        let request = adapter.encode_uplink(&UplinkHeader::new(UplinkBody::SessionRequest { next_seq: 0 }));
        let receipt = gateway.receive_uplink(0, fcnt, &request, now, adapter).unwrap();
        assert!(receipt.token_issued.is_some());
        let downlink = gateway.prepare_downlink(0, now).unwrap();
        gateway.commit_downlink(0, &downlink, now).unwrap();
        match downlink.session {
            Some(SessionControl::Granted { token }) => token_short(&token),
            other => panic!("expected a grant, got {other:?}"),
        }
    }

    #[test]
    fn full_window_yields_one_bitmap() {
        let config = novel_config();
        let adapter = NovelAdapter::new(&config.novel);
        let mut gateway = Gateway::new(&config, &adapter);
        let short = open_session(&mut gateway, &adapter, 0, secs(0));

        for seq in 0..3u16 {
            gateway.receive_uplink(0, seq as u32 + 1, &data(&adapter, seq, Some(short), None), secs(seq as u64 * 600), &adapter).unwrap();
            assert!(gateway.prepare_downlink(0, secs(seq as u64 * 600)).is_none());
        }
        // seq 3 lost, seq 4 pushes the window out
        gateway.receive_uplink(0, 5, &data(&adapter, 4, Some(short), None), secs(2400), &adapter).unwrap();
        let downlink = gateway.prepare_downlink(0, secs(2400)).unwrap();
        match downlink.ack {
            Some(AckInfo::Bitmap(bitmap)) => {
                assert_eq!(bitmap.base, 0);
                assert_eq!(bitmap.bits, 0b0111);
            }
            other => panic!("expected a bitmap, got {other:?}"),
        }
        gateway.commit_downlink(0, &downlink, secs(2400)).unwrap();
        assert!(gateway.prepare_downlink(0, secs(2400)).is_none());
    }

    #[test]
    fn expired_token_is_rejected_and_renewed() {
        let config = novel_config();
        let adapter = NovelAdapter::new(&config.novel);
        let mut gateway = Gateway::new(&config, &adapter);
        let short = open_session(&mut gateway, &adapter, 0, secs(0));

        let late = secs(12 * 3600 + 1);
        let receipt = gateway.receive_uplink(0, 1, &data(&adapter, 0, Some(short), None), late, &adapter).unwrap();
        assert!(receipt.token_rejected);
        assert!(!receipt.data_accepted);
        let downlink = gateway.prepare_downlink(0, late).unwrap();
        assert_eq!(downlink.session, Some(SessionControl::Expired));
        gateway.commit_downlink(0, &downlink, late).unwrap();

        let request = adapter.encode_uplink(&UplinkHeader::new(UplinkBody::SessionRequest { next_seq: 1 }));
        let renewed = gateway.receive_uplink(0, 2, &request, late, &adapter).unwrap();
        assert_eq!(renewed.token_issued, Some(true));
    }

    #[test]
    fn wrong_token_reference_is_rejected() {
        let config = novel_config();
        let adapter = NovelAdapter::new(&config.novel);
        let mut gateway = Gateway::new(&config, &adapter);
        let short = open_session(&mut gateway, &adapter, 0, secs(0));
        let receipt = gateway.receive_uplink(0, 1, &data(&adapter, 0, Some(short.wrapping_add(1)), None), secs(10), &adapter).unwrap();
        assert!(receipt.token_rejected);
    }

    #[test]
    fn batch_is_resent_under_same_epoch_until_echoed() {
        let config = novel_config();
        let adapter = NovelAdapter::new(&config.novel);
        let mut gateway = Gateway::new(&config, &adapter);
        let short = open_session(&mut gateway, &adapter, 0, secs(0));
        for id in 0..5 {
            gateway.enqueue_command(command(id, 1)).unwrap();
        }

        gateway.receive_uplink(0, 1, &data(&adapter, 0, Some(short), None), secs(10), &adapter).unwrap();
        let first = gateway.prepare_downlink(0, secs(10)).unwrap();
        let batch = first.batch.clone().unwrap();
        assert_eq!(batch.tag, 1);
        assert_eq!(batch.commands.len(), 3);
        assert_eq!(gateway.commit_downlink(0, &first, secs(10)).unwrap(), vec![0, 1, 2]);

        // no echo: same epoch, same commands
        gateway.receive_uplink(0, 2, &data(&adapter, 1, Some(short), None), secs(610), &adapter).unwrap();
        let again = gateway.prepare_downlink(0, secs(610)).unwrap();
        assert_eq!(again.batch, first.batch);
        gateway.commit_downlink(0, &again, secs(610)).unwrap();

        let receipt = gateway.receive_uplink(0, 3, &data(&adapter, 2, Some(short), Some(1)), secs(1210), &adapter).unwrap();
        let confirmed: Vec<_> = receipt.confirmed.iter().map(|c| c.id).collect();
        assert_eq!(confirmed, vec![0, 1, 2]);
        let next = gateway.prepare_downlink(0, secs(1210)).unwrap().batch.unwrap();
        assert_eq!(next.tag, 2);
        assert_eq!(next.commands.len(), 2);
    }

    #[test]
    fn frame_counter_regression_is_fatal() {
        let config = novel_config();
        let adapter = NovelAdapter::new(&config.novel);
        let mut gateway = Gateway::new(&config, &adapter);
        let short = open_session(&mut gateway, &adapter, 5, secs(0));
        let err = gateway.receive_uplink(0, 5, &data(&adapter, 0, Some(short), None), secs(1), &adapter).unwrap_err();
        assert!(matches!(err, SimError::SequenceRegression { device: 0, last: 5, received: 5, .. }));
    }

    #[test]
    fn per_message_ack_and_single_command() {
        let mut config = RunConfig::default();
        config.network.device_count = 1;
        config.protocol = crate::protocols::ProtocolKind::MqttSn;
        let adapter = MqttSnAdapter::new(&config.mqtt_sn);
        let mut gateway = Gateway::new(&config, &adapter);
        gateway.enqueue_command(command(1, 0)).unwrap();
        gateway.enqueue_command(command(2, 0)).unwrap();

        let receipt = gateway.receive_uplink(0, 0, &data(&adapter, 0, None, None), secs(5), &adapter).unwrap();
        assert!(receipt.data_accepted);
        let downlink = gateway.prepare_downlink(0, secs(5)).unwrap();
        assert!(matches!(downlink.ack, Some(AckInfo::Message { .. })));
        let batch = downlink.batch.clone().unwrap();
        assert_eq!(batch.commands.len(), 1);
        gateway.commit_downlink(0, &downlink, secs(5)).unwrap();

        let mut header = UplinkHeader::new(UplinkBody::KeepAlive);
        header.command_acks = vec![batch.tag];
        let receipt = gateway.receive_uplink(0, 1, &adapter.encode_uplink(&header), secs(600), &adapter).unwrap();
        assert_eq!(receipt.confirmed.len(), 1);
        assert_eq!(gateway.queued_commands(0), 1);
    }

    #[test]
    fn expired_commands_are_dropped() {
        let config = novel_config();
        let adapter = NovelAdapter::new(&config.novel);
        let mut gateway = Gateway::new(&config, &adapter);
        gateway.enqueue_command(command(1, 0)).unwrap();
        gateway.enqueue_command(command(2, 3000)).unwrap();
        let expired = gateway.expire_commands(0, secs(3700)).unwrap();
        assert_eq!(expired.iter().map(|c| c.id).collect::<Vec<_>>(), vec![1]);
        assert_eq!(gateway.queued_commands(0), 1);
    }

    #[test]
    fn radio_serialises_downlinks() {
        let config = novel_config();
        let adapter = NovelAdapter::new(&config.novel);
        let mut gateway = Gateway::new(&config, &adapter);
        assert!(gateway.radio_free(secs(1)));
        gateway.occupy_radio(secs(1), secs(2));
        assert!(!gateway.radio_free(secs(2)));
        assert!(gateway.radio_free(secs(3)));
    }
}
