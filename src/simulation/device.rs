//! Per-device protocol state machine.
//!
//! A device owns one radio and an outbox of messages that are not resolved
//! yet. The radio cycles `Idle → Transmitting → AwaitRxWindow → Idle`; every
//! outstanding message moves through `Pending → AwaitAck → (Retry → AwaitAck)*`
//! and ends `Acknowledged`, `Expired` or `Unconfirmed`.
//!
//! The engine drives the device in two steps per uplink: [`Device::build_frame`]
//! decides what would go on air now without touching any state, and
//! [`Device::commit_frame`] books it once the channel accepted the duty cycle.
//! Everything else reacts to downlinks and timers.

use std::collections::VecDeque;
use std::time::Duration;

use rand_chacha::ChaCha8Rng;
use serde::Serialize;

use super::ack_window::Bitmap;
use super::types::{DeviceId, MessageIndex, QosClass, QosTarget, TxId};
use crate::config::RunConfig;
use crate::error::Condition;
use crate::protocols::novel::token_short;
use crate::protocols::{
    AckInfo, AckMode, CommandBatch, DedupPolicy, Downlink, MessagePlan, ProtocolAdapter, SessionControl, StateView, UplinkBody, UplinkHeader,
    unwrap_backward,
};
use crate::protocols::qos_d::DeliveryEstimate;
use crate::simulation::signal_calculations::seconds;

/// Settings shared by all devices of a run.
#[derive(Debug, Clone)]
pub struct DeviceParams {
    pub tx_power_mw: f64,
    pub rx_power_mw: f64,
    pub handshake_retry: Duration,
    /// Fixed ring size of outstanding messages; `None` means unbounded.
    pub outstanding_capacity: Option<usize>,
    pub initial_estimate: f64,
    pub estimate_weight: f64,
    pub needs_session: bool,
    pub keep_alive: Option<Duration>,
}

impl DeviceParams {
    pub fn new(config: &RunConfig, adapter: &dyn ProtocolAdapter) -> Self {
        let outstanding_capacity = match adapter.ack_mode() {
            AckMode::WindowedBitmap { .. } => Some(config.novel.outstanding_capacity),
            AckMode::PerMessage => None,
        };
        Self {
            tx_power_mw: config.device.tx_power_mw,
            rx_power_mw: config.device.rx_power_mw,
            handshake_retry: seconds(config.device.handshake_retry_s),
            outstanding_capacity,
            initial_estimate: config.novel.initial_delivery_probability,
            estimate_weight: config.novel.estimate_weight,
            needs_session: adapter.needs_session(),
            keep_alive: adapter.keep_alive(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// Generated, first attempt not sent yet.
    Pending,
    AwaitAck,
    /// Latest attempt known lost, another one is scheduled.
    Retry,
    Acknowledged,
    Expired,
    /// Left the device without a verdict.
    Unconfirmed,
}

#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub index: MessageIndex,
    pub class: QosClass,
    pub payload_bytes: usize,
    pub generated_at: Duration,
    pub deadline_at: Duration,
    pub plan: MessagePlan,
    pub msg_id: u16,
    pub attempts: u8,
    pub next_attempt_at: Option<Duration>,
    /// Data sequence of the most recent attempt.
    pub latest_seq: Option<u32>,
    pub state: MessageState,
}

/// Final verdict on a message, reported to the metrics collector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    pub device: DeviceId,
    pub message: MessageIndex,
    pub state: MessageState,
    pub condition: Option<Condition>,
    pub attempts: u8,
    pub at: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data { message: MessageIndex, seq: u32, attempt: u8 },
    SessionRequest,
    KeepAlive,
}

/// An uplink the device would send right now.
#[derive(Debug, Clone)]
pub struct PreparedFrame {
    pub kind: FrameKind,
    pub header: Vec<u8>,
    pub payload_len: usize,
    pub frame_counter: u32,
}

impl PreparedFrame {
    pub fn len(&self) -> usize {
        self.header.len() + self.payload_len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Header followed by a zero-filled payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len());
        bytes.extend_from_slice(&self.header);
        bytes.resize(self.len(), 0);
        bytes
    }
}

#[derive(Debug, Clone)]
pub struct SentFrame {
    pub frame: PreparedFrame,
    pub tx: TxId,
    pub start: Duration,
    pub airtime: Duration,
    pub energy_mj: f64,
}

#[derive(Debug, Clone)]
pub enum RadioState {
    Idle,
    Transmitting(SentFrame),
    AwaitRxWindow(SentFrame),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Session {
    None,
    Requested { retry_at: Duration },
    /// Only the one-byte reference of the granted token is needed on air.
    Token { short: u8 },
    Connected,
}

/// What a received downlink changed.
#[derive(Debug, Clone, Default)]
pub struct DownlinkEffects {
    pub resolutions: Vec<Resolution>,
    /// `Some(true)` when the carried command batch was applied now,
    /// `Some(false)` when it was recognised as already applied.
    pub batch_applied: Option<bool>,
    pub session: Option<SessionControl>,
}

pub struct Device {
    id: DeviceId,
    params: DeviceParams,
    radio: RadioState,
    outbox: VecDeque<PendingMessage>,
    next_message: MessageIndex,
    next_msg_id: u16,
    frame_counter: u32,
    next_seq: u32,
    first_seq: u32,
    session: Session,
    last_applied_epoch: u16,
    epoch_echo: Option<u8>,
    command_acks: Vec<u16>,
    /// Recently applied command ids with the time they were applied.
    recent_commands: VecDeque<(u16, Duration)>,
    estimate: DeliveryEstimate,
    keep_alive_due: Option<Duration>,
    tx_energy_mj: f64,
    rx_energy_mj: f64,
    /// Earliest queued `TransmitAttempt`, if any.
    pub wake_at: Option<Duration>,
}

impl Device {
    /// Create a device whose first data sequence number is `first_seq`.
    pub fn new(id: DeviceId, params: DeviceParams, first_seq: u32) -> Self {
        Self {
            id,
            radio: RadioState::Idle,
            outbox: VecDeque::new(),
            next_message: 0,
            next_msg_id: 1,
            frame_counter: 0,
            next_seq: first_seq,
            first_seq,
            session: if params.needs_session { Session::None } else { Session::Connected },
            last_applied_epoch: 0,
            epoch_echo: None,
            command_acks: Vec::new(),
            recent_commands: VecDeque::new(),
            estimate: DeliveryEstimate::new(params.initial_estimate, params.estimate_weight),
            keep_alive_due: params.keep_alive,
            tx_energy_mj: 0.0,
            rx_energy_mj: 0.0,
            wake_at: None,
            params,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.radio, RadioState::Idle)
    }

    pub fn has_session(&self) -> bool {
        matches!(self.session, Session::Token { .. } | Session::Connected)
    }

    pub fn message(&self, index: MessageIndex) -> Option<&PendingMessage> {
        self.outbox.iter().find(|m| m.index == index)
    }

    pub fn outstanding(&self) -> usize {
        self.outbox.len()
    }

    pub fn energy_mj(&self) -> f64 {
        self.tx_energy_mj + self.rx_energy_mj
    }

    pub fn last_applied_epoch(&self) -> u16 {
        self.last_applied_epoch
    }

    pub fn state_bytes(&self, adapter: &dyn ProtocolAdapter) -> usize {
        adapter.state_bytes(StateView {
            outstanding: self.outbox.len(),
            dedup_entries: self.recent_commands.len(),
        })
    }

    /// Queue a new application message.
    ///
    /// Returns its index and, when the outstanding ring was full, the
    /// resolution of the evicted oldest message.
    pub fn generate(
        &mut self,
        class: QosClass,
        target: QosTarget,
        payload_bytes: usize,
        now: Duration,
        adapter: &dyn ProtocolAdapter,
        rng: &mut ChaCha8Rng,
    ) -> (MessageIndex, Option<Resolution>) {
        let evicted = match self.params.outstanding_capacity {
            Some(capacity) if self.outbox.len() >= capacity => self
                .outbox
                .pop_front()
                .map(|oldest| self.resolution(&oldest, MessageState::Unconfirmed, None, now)),
            _ => None,
        };

        let index = self.next_message;
        self.next_message += 1;
        let msg_id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.wrapping_add(1).max(1);
        let plan = adapter.plan(class, target, self.estimate.value(), rng);
        self.outbox.push_back(PendingMessage {
            index,
            class,
            payload_bytes,
            generated_at: now,
            deadline_at: now + target.deadline,
            plan,
            msg_id,
            attempts: 0,
            next_attempt_at: Some(now),
            latest_seq: None,
            state: MessageState::Pending,
        });
        (index, evicted)
    }

    /// Earliest time at which the device has something to send.
    pub fn next_due(&self, now: Duration) -> Option<Duration> {
        if !self.is_idle() {
            return None;
        }
        let data = self.outbox.iter().filter_map(|m| m.next_attempt_at).min();
        match &self.session {
            Session::None => data.map(|d| d.max(now)),
            Session::Requested { retry_at } => data.map(|d| d.max(*retry_at)),
            Session::Token { .. } | Session::Connected => match (data, self.keep_alive_due) {
                (Some(d), Some(k)) => Some(d.min(k)),
                (d, k) => d.or(k),
            },
        }
    }

    fn ready_message(&self, now: Duration) -> Option<&PendingMessage> {
        self.outbox
            .iter()
            .filter(|m| m.next_attempt_at.is_some_and(|at| at <= now))
            .min_by_key(|m| (m.next_attempt_at, m.class.wire_priority(), m.index))
    }

    /// Frame the uplink that would go out at `now`, if any. Pure.
    pub fn build_frame(&self, now: Duration, adapter: &dyn ProtocolAdapter) -> Option<PreparedFrame> {
        if !self.is_idle() {
            return None;
        }
        let ready = self.ready_message(now);
        let (body, kind, payload_len) = match &self.session {
            Session::None => {
                ready?;
                self.session_request()
            }
            Session::Requested { retry_at } => {
                ready?;
                if *retry_at > now {
                    return None;
                }
                self.session_request()
            }
            Session::Token { .. } | Session::Connected => match ready {
                Some(message) => {
                    let seq = self.next_seq;
                    let body = UplinkBody::Data {
                        seq: seq as u16,
                        msg_id: message.msg_id,
                        priority: message.class,
                        confirmable: message.plan.confirmable,
                        retransmission: message.attempts > 0,
                        payload_len: message.payload_bytes,
                    };
                    let kind = FrameKind::Data {
                        message: message.index,
                        seq,
                        attempt: message.attempts + 1,
                    };
                    (body, kind, message.payload_bytes)
                }
                None if self.keep_alive_due.is_some_and(|at| at <= now) => (UplinkBody::KeepAlive, FrameKind::KeepAlive, 0),
                None => return None,
            },
        };

        let header = UplinkHeader {
            body,
            token_short: match &self.session {
                Session::Token { short, .. } => Some(*short),
                _ => None,
            },
            epoch_echo: self.epoch_echo,
            command_acks: self.command_acks.clone(),
        };
        Some(PreparedFrame {
            kind,
            header: adapter.encode_uplink(&header),
            payload_len,
            frame_counter: self.frame_counter,
        })
    }

    fn session_request(&self) -> (UplinkBody, FrameKind, usize) {
        (
            UplinkBody::SessionRequest {
                next_seq: self.next_seq as u16,
            },
            FrameKind::SessionRequest,
            0,
        )
    }

    /// Book a frame the channel put on air.
    ///
    /// Non-confirmable data is resolved as `Unconfirmed` right away.
    pub fn commit_frame(&mut self, frame: PreparedFrame, tx: TxId, now: Duration, airtime: Duration) -> Option<Resolution> {
        let energy_mj = self.params.tx_power_mw * airtime.as_secs_f64();
        self.tx_energy_mj += energy_mj;
        self.frame_counter = frame.frame_counter + 1;
        self.epoch_echo = None;
        self.command_acks.clear();
        if let Some(interval) = self.params.keep_alive {
            self.keep_alive_due = Some(now + interval);
        }

        let mut resolved = None;
        match frame.kind {
            FrameKind::Data { message, seq, .. } => {
                self.next_seq = seq + 1;
                if let Some(pos) = self.outbox.iter().position(|m| m.index == message) {
                    let m = &mut self.outbox[pos];
                    m.attempts += 1;
                    m.latest_seq = Some(seq);
                    m.next_attempt_at = None;
                    if !m.plan.confirmable {
                        let done = self.outbox.remove(pos);
                        resolved = done.map(|m| self.resolution(&m, MessageState::Unconfirmed, None, now));
                    } else {
                        m.state = MessageState::AwaitAck;
                        match m.plan.spacing {
                            Some(spacing) if m.attempts < m.plan.max_attempts => {
                                let next = (m.generated_at + spacing * m.attempts as u32).max(now + spacing);
                                m.next_attempt_at = (next < m.deadline_at).then_some(next);
                            }
                            _ => {}
                        }
                    }
                }
            }
            FrameKind::SessionRequest => {
                self.session = Session::Requested {
                    retry_at: now + self.params.handshake_retry,
                };
            }
            FrameKind::KeepAlive => {}
        }

        self.radio = RadioState::Transmitting(SentFrame {
            frame,
            tx,
            start: now,
            airtime,
            energy_mj,
        });
        resolved
    }

    /// The uplink left the antenna; the receive window is pending.
    pub fn uplink_finished(&mut self) -> Option<SentFrame> {
        match std::mem::replace(&mut self.radio, RadioState::Idle) {
            RadioState::Transmitting(sent) => {
                self.radio = RadioState::AwaitRxWindow(sent.clone());
                Some(sent)
            }
            other => {
                self.radio = other;
                None
            }
        }
    }

    /// Close the receive window after listening for `listened`. Returns the
    /// receive energy in mJ.
    pub fn close_rx_window(&mut self, listened: Duration) -> f64 {
        let energy = self.params.rx_power_mw * listened.as_secs_f64();
        self.rx_energy_mj += energy;
        self.radio = RadioState::Idle;
        energy
    }

    /// Apply a decoded downlink.
    pub fn receive_downlink(&mut self, downlink: &Downlink, now: Duration, policy: DedupPolicy) -> DownlinkEffects {
        let mut effects = DownlinkEffects::default();

        match &downlink.session {
            Some(SessionControl::Granted { token }) => {
                log::debug!("device {}: token granted", self.id);
                self.session = Session::Token { short: token_short(token) };
            }
            Some(SessionControl::Connected) => self.session = Session::Connected,
            Some(SessionControl::Expired) => {
                log::debug!("device {}: token rejected, renewing", self.id);
                self.session = Session::None;
                self.requeue_rejected(now);
            }
            None => {}
        }
        effects.session = downlink.session.clone();

        match downlink.ack {
            Some(AckInfo::Bitmap(bitmap)) => self.apply_bitmap(bitmap, now, &mut effects.resolutions),
            Some(AckInfo::Message { msg_id }) => {
                let acked = self
                    .outbox
                    .iter()
                    .position(|m| m.msg_id == msg_id && matches!(m.state, MessageState::AwaitAck | MessageState::Retry))
                    .and_then(|pos| self.outbox.remove(pos));
                if let Some(m) = acked {
                    effects.resolutions.push(self.resolution(&m, MessageState::Acknowledged, None, now));
                }
            }
            None => {}
        }

        if let Some(batch) = &downlink.batch {
            effects.batch_applied = Some(self.accept_batch(batch, now, policy));
        }
        effects
    }

    /// Settle outstanding messages against an aggregated acknowledgment.
    fn apply_bitmap(&mut self, wire: Bitmap, now: Duration, resolutions: &mut Vec<Resolution>) {
        if self.next_seq == self.first_seq {
            return;
        }
        let last_sent = self.next_seq - 1;
        let bitmap = Bitmap {
            base: unwrap_backward(last_sent, wire.base as u16),
            ..wire
        };

        let observed: Vec<u32> = (bitmap.base..bitmap.base + bitmap.width).filter(|s| *s <= last_sent).collect();
        let delivered = observed.iter().filter(|s| bitmap.status(**s) == Some(true)).count();
        self.estimate.observe(delivered as u32, observed.len() as u32);

        let mut settled = Vec::new();
        for (pos, m) in self.outbox.iter_mut().enumerate() {
            if m.state != MessageState::AwaitAck {
                continue;
            }
            let Some(seq) = m.latest_seq else { continue };
            let verdict = if seq < bitmap.base { Some(false) } else { bitmap.status(seq) };
            match verdict {
                Some(true) => settled.push((pos, MessageState::Acknowledged, None)),
                Some(false) => {
                    if now < m.deadline_at && m.attempts < m.plan.max_attempts {
                        m.state = MessageState::Retry;
                        m.next_attempt_at = Some(now);
                    } else if now >= m.deadline_at {
                        settled.push((pos, MessageState::Expired, Some(Condition::DeadlineMissed)));
                    } else {
                        settled.push((pos, MessageState::Expired, Some(Condition::ChannelError)));
                    }
                }
                None => {}
            }
        }
        let mut done = Vec::with_capacity(settled.len());
        for (pos, state, condition) in settled.into_iter().rev() {
            if let Some(m) = self.outbox.remove(pos) {
                done.push(self.resolution(&m, state, condition, now));
            }
        }
        resolutions.extend(done.into_iter().rev());
    }

    /// The gateway refused the last data frame; send it again once the
    /// session is back, without charging the attempt.
    fn requeue_rejected(&mut self, now: Duration) {
        let Some(last_sent) = self.next_seq.checked_sub(1) else { return };
        if let Some(m) = self.outbox.iter_mut().find(|m| m.latest_seq == Some(last_sent) && m.state == MessageState::AwaitAck) {
            m.attempts -= 1;
            m.latest_seq = None;
            m.state = if m.attempts == 0 { MessageState::Pending } else { MessageState::Retry };
            m.next_attempt_at = Some(now);
        }
    }

    fn accept_batch(&mut self, batch: &CommandBatch, now: Duration, policy: DedupPolicy) -> bool {
        match policy {
            DedupPolicy::Epoch => {
                self.epoch_echo = Some(batch.tag as u8);
                if batch.tag > self.last_applied_epoch {
                    self.last_applied_epoch = batch.tag;
                    true
                } else {
                    false
                }
            }
            DedupPolicy::RecentIds(limit) => {
                self.command_acks.push(batch.tag);
                if self.recent_commands.iter().any(|(id, _)| *id == batch.tag) {
                    return false;
                }
                self.recent_commands.push_back((batch.tag, now));
                while self.recent_commands.len() > limit {
                    self.recent_commands.pop_front();
                }
                true
            }
            DedupPolicy::Lifetime(lifetime) => {
                self.command_acks.push(batch.tag);
                self.recent_commands.retain(|(_, at)| now.saturating_sub(*at) < lifetime);
                if self.recent_commands.iter().any(|(id, _)| *id == batch.tag) {
                    return false;
                }
                self.recent_commands.push_back((batch.tag, now));
                true
            }
        }
    }

    /// Per-message acknowledgment timer fired.
    pub fn ack_timeout(&mut self, message: MessageIndex, attempt: u8, now: Duration) -> Option<Resolution> {
        let pos = self.outbox.iter().position(|m| m.index == message)?;
        let m = &mut self.outbox[pos];
        if m.state != MessageState::AwaitAck || m.attempts != attempt {
            return None;
        }
        if m.attempts < m.plan.max_attempts {
            m.state = MessageState::Retry;
            m.next_attempt_at = Some(now);
            return None;
        }
        let m = self.outbox.remove(pos)?;
        Some(self.resolution(&m, MessageState::Expired, Some(Condition::ChannelError), now))
    }

    /// QoS deadline of a message passed: no further attempts.
    pub fn qos_deadline(&mut self, message: MessageIndex, now: Duration) -> Option<Resolution> {
        let pos = self.outbox.iter().position(|m| m.index == message)?;
        let m = &mut self.outbox[pos];
        m.next_attempt_at = None;
        match m.state {
            MessageState::Pending | MessageState::Retry => {
                let m = self.outbox.remove(pos)?;
                Some(self.resolution(&m, MessageState::Expired, Some(Condition::DeadlineMissed), now))
            }
            // verdict arrives with the bitmap
            _ => None,
        }
    }

    /// Resolve everything still outstanding at the end of a run.
    pub fn drain(&mut self, now: Duration) -> Vec<Resolution> {
        let outbox = std::mem::take(&mut self.outbox);
        outbox.iter().map(|m| self.resolution(m, MessageState::Unconfirmed, None, now)).collect()
    }

    fn resolution(&self, m: &PendingMessage, state: MessageState, condition: Option<Condition>, at: Duration) -> Resolution {
        Resolution {
            device: self.id,
            message: m.index,
            state,
            condition,
            attempts: m.attempts,
            at,
        }
    }
}
