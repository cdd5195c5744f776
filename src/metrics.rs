//! Run records and aggregate statistics.
//!
//! The collector receives every observable outcome while a run executes and
//! keeps three record streams (transmissions, messages, commands). Anything
//! that starts before the warm-up boundary is kept in the trace with its
//! `warmup` flag set and left out of the [`RunSummary`].

use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Condition, SimError};
use crate::protocols::{AckInfo, ProtocolKind};
use crate::simulation::channel::{ChannelFailure, ChannelOutcome};
use crate::simulation::device::{MessageState, Resolution};
use crate::simulation::types::{Command, CommandId, DeviceId, Direction, MessageIndex, NetworkKind, QosClass, TxId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameLabel {
    Data,
    SessionRequest,
    KeepAlive,
    Downlink,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransmissionRecord {
    pub tx: TxId,
    pub device: DeviceId,
    pub direction: Direction,
    pub frame: FrameLabel,
    pub message: Option<MessageIndex>,
    pub attempt: Option<u8>,
    pub start_s: f64,
    pub airtime_ms: f64,
    pub frame_bytes: usize,
    pub header_bytes: usize,
    /// Device energy spent on this frame (transmit or receive).
    pub energy_mj: f64,
    pub failure: Option<ChannelFailure>,
    pub collision_partners: Vec<TxId>,
    pub warmup: bool,
}

impl TransmissionRecord {
    /// Record for a resolved transmission.
    pub fn new(outcome: &ChannelOutcome, frame: FrameLabel, frame_bytes: usize, header_bytes: usize, energy_mj: f64) -> Self {
        Self {
            tx: outcome.tx,
            device: outcome.device,
            direction: outcome.direction,
            frame,
            message: None,
            attempt: None,
            start_s: outcome.start.as_secs_f64(),
            airtime_ms: outcome.airtime.as_secs_f64() * 1000.0,
            frame_bytes,
            header_bytes,
            energy_mj,
            failure: outcome.failure,
            collision_partners: outcome.collision_partners.clone(),
            warmup: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    pub device: DeviceId,
    pub message: MessageIndex,
    pub class: QosClass,
    pub generated_s: f64,
    pub first_tx_s: Option<f64>,
    /// First time the gateway received any attempt.
    pub received_s: Option<f64>,
    pub resolved_s: Option<f64>,
    pub state: MessageState,
    pub condition: Option<Condition>,
    pub attempts: u8,
    pub warmup: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    Pending,
    Applied,
    Expired,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandRecord {
    pub id: CommandId,
    pub device: DeviceId,
    pub priority: QosClass,
    pub cmd_type: u8,
    pub arrived_s: f64,
    pub applied_s: Option<f64>,
    pub confirmed_s: Option<f64>,
    pub outcome: CommandOutcome,
    /// Times the device executed the command.
    pub applications: u32,
    pub warmup: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunHeader {
    pub seed: u64,
    pub protocol: ProtocolKind,
    pub network: NetworkKind,
    pub devices: usize,
    pub duration_s: f64,
    pub warmup_s: f64,
    pub started_at: DateTime<Utc>,
}

/// Aggregates over everything after the warm-up boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub messages_generated: u64,
    pub messages_delivered: u64,
    pub delivery_rate: f64,
    pub messages_acknowledged: u64,
    pub messages_expired: u64,
    pub messages_unconfirmed: u64,
    pub deadline_misses: u64,
    pub data_attempts: u64,
    pub attempt_success_rate: f64,
    pub latency_mean_s: f64,
    pub latency_p50_s: f64,
    pub latency_p95_s: f64,
    pub commands_generated: u64,
    pub commands_applied: u64,
    pub commands_expired: u64,
    pub duplicate_applications: u64,
    pub command_latency_mean_s: f64,
    pub command_latency_p50_s: f64,
    pub command_latency_p95_s: f64,
    pub command_latency_p99_s: f64,
    pub energy_mj: f64,
    pub energy_per_message_mj: f64,
    pub uplink_airtime_s: f64,
    pub downlink_airtime_s: f64,
    pub uplink_header_bytes: u64,
    pub header_bytes_per_uplink: f64,
    pub ack_downlinks: u64,
    pub ack_efficiency: f64,
    pub token_renewals: u64,
    pub token_rejections: u64,
    pub duty_cycle_deferrals: u64,
    pub gateway_deferrals: u64,
    pub collisions: u64,
    pub channel_errors: u64,
    pub unreadable_frames: u64,
    pub max_device_state_bytes: usize,
    pub events_dispatched: u64,
}

#[derive(Debug, Default)]
struct Counters {
    acked_in_downlinks: u64,
    ack_downlinks: u64,
    duplicate_applications: u64,
    token_renewals: u64,
    token_rejections: u64,
    duty_cycle_deferrals: u64,
    gateway_deferrals: u64,
    unreadable_frames: u64,
    rx_energy_mj: f64,
}

pub struct MetricsCollector {
    warmup: Duration,
    transmissions: Vec<TransmissionRecord>,
    messages: BTreeMap<(DeviceId, MessageIndex), MessageRecord>,
    commands: BTreeMap<CommandId, CommandRecord>,
    counters: Counters,
    max_state_bytes: usize,
}

impl MetricsCollector {
    pub fn new(warmup: Duration) -> Self {
        Self {
            warmup,
            transmissions: Vec::new(),
            messages: BTreeMap::new(),
            commands: BTreeMap::new(),
            counters: Counters::default(),
            max_state_bytes: 0,
        }
    }

    fn measured(&self, at: Duration) -> bool {
        at >= self.warmup
    }

    pub fn message_generated(&mut self, device: DeviceId, message: MessageIndex, class: QosClass, now: Duration) {
        let warmup = !self.measured(now);
        self.messages.insert(
            (device, message),
            MessageRecord {
                device,
                message,
                class,
                generated_s: now.as_secs_f64(),
                first_tx_s: None,
                received_s: None,
                resolved_s: None,
                state: MessageState::Pending,
                condition: None,
                attempts: 0,
                warmup,
            },
        );
    }

    pub fn message_attempted(&mut self, device: DeviceId, message: MessageIndex, now: Duration) {
        if let Some(record) = self.messages.get_mut(&(device, message)) {
            record.first_tx_s.get_or_insert(now.as_secs_f64());
        }
    }

    pub fn message_received(&mut self, device: DeviceId, message: MessageIndex, now: Duration) {
        if let Some(record) = self.messages.get_mut(&(device, message)) {
            record.received_s.get_or_insert(now.as_secs_f64());
        }
    }

    pub fn message_resolved(&mut self, resolution: &Resolution) {
        if let Some(record) = self.messages.get_mut(&(resolution.device, resolution.message)) {
            record.state = resolution.state;
            record.condition = resolution.condition;
            record.attempts = resolution.attempts;
            record.resolved_s = Some(resolution.at.as_secs_f64());
        }
    }

    pub fn transmission(&mut self, mut record: TransmissionRecord) {
        record.warmup = record.start_s < self.warmup.as_secs_f64();
        self.transmissions.push(record);
    }

    /// Receive-window energy with no frame attached to it.
    pub fn listen_energy(&mut self, energy_mj: f64, at: Duration) {
        if self.measured(at) {
            self.counters.rx_energy_mj += energy_mj;
        }
    }

    pub fn command_arrived(&mut self, command: &Command) {
        let warmup = !self.measured(command.arrived_at);
        self.commands.insert(
            command.id,
            CommandRecord {
                id: command.id,
                device: command.device,
                priority: command.priority,
                cmd_type: command.cmd_type,
                arrived_s: command.arrived_at.as_secs_f64(),
                applied_s: None,
                confirmed_s: None,
                outcome: CommandOutcome::Pending,
                applications: 0,
                warmup,
            },
        );
    }

    /// A device executed the commands `ids`. Executions beyond the first are
    /// duplicate applications.
    pub fn commands_applied(&mut self, ids: &[CommandId], now: Duration) {
        for id in ids {
            let Some(record) = self.commands.get_mut(id) else { continue };
            record.applications += 1;
            if record.applied_s.is_none() {
                record.applied_s = Some(now.as_secs_f64());
                record.outcome = CommandOutcome::Applied;
            } else if !record.warmup {
                self.counters.duplicate_applications += 1;
            }
        }
    }

    pub fn commands_confirmed(&mut self, commands: &[Command], now: Duration) {
        for command in commands {
            if let Some(record) = self.commands.get_mut(&command.id) {
                record.confirmed_s.get_or_insert(now.as_secs_f64());
            }
        }
    }

    pub fn commands_expired(&mut self, commands: &[Command]) {
        for command in commands {
            if let Some(record) = self.commands.get_mut(&command.id) {
                if record.outcome == CommandOutcome::Pending {
                    record.outcome = CommandOutcome::Expired;
                }
            }
        }
    }

    pub fn ack_sent(&mut self, ack: &AckInfo, now: Duration) {
        if !self.measured(now) {
            return;
        }
        self.counters.ack_downlinks += 1;
        self.counters.acked_in_downlinks += match ack {
            AckInfo::Bitmap(bitmap) => bitmap.received() as u64,
            AckInfo::Message { .. } => 1,
        };
    }

    pub fn duty_cycle_deferral(&mut self, direction: Direction, now: Duration) {
        if self.measured(now) {
            match direction {
                Direction::Uplink => self.counters.duty_cycle_deferrals += 1,
                Direction::Downlink => self.counters.gateway_deferrals += 1,
            }
        }
    }

    pub fn token_issued(&mut self, renewal: bool, now: Duration) {
        if renewal && self.measured(now) {
            self.counters.token_renewals += 1;
        }
    }

    pub fn token_rejected(&mut self, now: Duration) {
        if self.measured(now) {
            self.counters.token_rejections += 1;
        }
    }

    pub fn unreadable_frame(&mut self) {
        self.counters.unreadable_frames += 1;
    }

    pub fn observe_state_bytes(&mut self, bytes: usize) {
        self.max_state_bytes = self.max_state_bytes.max(bytes);
    }

    /// Build the summary and hand back every record.
    pub fn finish(self, header: RunHeader, events_dispatched: u64) -> RunReport {
        let summary = self.summarise(events_dispatched);
        log::info!(
            "run seed {} finished: delivery {:.3}, ack efficiency {:.2}, {} events",
            header.seed,
            summary.delivery_rate,
            summary.ack_efficiency,
            events_dispatched
        );
        RunReport {
            header,
            transmissions: self.transmissions,
            messages: self.messages.into_values().collect(),
            commands: self.commands.into_values().collect(),
            summary,
        }
    }

    fn summarise(&self, events_dispatched: u64) -> RunSummary {
        let mut s = RunSummary {
            events_dispatched,
            max_device_state_bytes: self.max_state_bytes,
            duplicate_applications: self.counters.duplicate_applications,
            token_renewals: self.counters.token_renewals,
            token_rejections: self.counters.token_rejections,
            duty_cycle_deferrals: self.counters.duty_cycle_deferrals,
            gateway_deferrals: self.counters.gateway_deferrals,
            unreadable_frames: self.counters.unreadable_frames,
            ack_downlinks: self.counters.ack_downlinks,
            ..RunSummary::default()
        };

        let mut latencies = Vec::new();
        for m in self.messages.values().filter(|m| !m.warmup) {
            s.messages_generated += 1;
            if let Some(received) = m.received_s {
                s.messages_delivered += 1;
                latencies.push(received - m.generated_s);
            }
            match m.state {
                MessageState::Acknowledged => s.messages_acknowledged += 1,
                MessageState::Expired => s.messages_expired += 1,
                MessageState::Unconfirmed => s.messages_unconfirmed += 1,
                _ => {}
            }
            if m.condition == Some(Condition::DeadlineMissed) {
                s.deadline_misses += 1;
            }
        }
        s.delivery_rate = ratio(s.messages_delivered, s.messages_generated);
        s.latency_mean_s = mean(&latencies);
        s.latency_p50_s = percentile(&mut latencies, 0.50);
        s.latency_p95_s = percentile(&mut latencies, 0.95);

        let mut command_latencies = Vec::new();
        for c in self.commands.values().filter(|c| !c.warmup) {
            s.commands_generated += 1;
            match c.outcome {
                CommandOutcome::Applied => s.commands_applied += 1,
                CommandOutcome::Expired => s.commands_expired += 1,
                CommandOutcome::Pending => {}
            }
            if let Some(applied) = c.applied_s {
                command_latencies.push(applied - c.arrived_s);
            }
        }
        s.command_latency_mean_s = mean(&command_latencies);
        s.command_latency_p50_s = percentile(&mut command_latencies, 0.50);
        s.command_latency_p95_s = percentile(&mut command_latencies, 0.95);
        s.command_latency_p99_s = percentile(&mut command_latencies, 0.99);

        let mut successful_attempts = 0u64;
        let mut uplinks = 0u64;
        for t in self.transmissions.iter().filter(|t| !t.warmup) {
            s.energy_mj += t.energy_mj;
            match t.direction {
                Direction::Uplink => {
                    uplinks += 1;
                    s.uplink_airtime_s += t.airtime_ms / 1000.0;
                    s.uplink_header_bytes += t.header_bytes as u64;
                    if t.frame == FrameLabel::Data {
                        s.data_attempts += 1;
                        if t.failure.is_none() {
                            successful_attempts += 1;
                        }
                    }
                }
                Direction::Downlink => s.downlink_airtime_s += t.airtime_ms / 1000.0,
            }
            match t.failure {
                Some(ChannelFailure::Collision) => s.collisions += 1,
                Some(ChannelFailure::PacketError) => s.channel_errors += 1,
                None => {}
            }
        }
        s.energy_mj += self.counters.rx_energy_mj;
        s.energy_per_message_mj = if s.messages_generated > 0 { s.energy_mj / s.messages_generated as f64 } else { 0.0 };
        s.attempt_success_rate = ratio(successful_attempts, s.data_attempts);
        s.header_bytes_per_uplink = ratio(s.uplink_header_bytes, uplinks);
        s.ack_efficiency = ratio(self.counters.acked_in_downlinks, self.counters.ack_downlinks);
        s
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 { 0.0 } else { numerator as f64 / denominator as f64 }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() { 0.0 } else { values.iter().sum::<f64>() / values.len() as f64 }
}

/// Nearest-rank percentile; 0 for an empty sample.
fn percentile(values: &mut [f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    let rank = (p * values.len() as f64).ceil() as usize;
    values[rank.clamp(1, values.len()) - 1]
}

/// Everything one run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub header: RunHeader,
    pub transmissions: Vec<TransmissionRecord>,
    pub messages: Vec<MessageRecord>,
    pub commands: Vec<CommandRecord>,
    pub summary: RunSummary,
}

#[derive(Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum Record<'a> {
    Run(&'a RunHeader),
    Transmission(&'a TransmissionRecord),
    Message(&'a MessageRecord),
    Command(&'a CommandRecord),
    Summary(&'a RunSummary),
}

impl RunReport {
    /// Write the run as JSON lines: header, trace records, summary.
    pub fn write_json_lines<W: Write>(&self, mut writer: W) -> Result<(), SimError> {
        let mut line = |record: Record| -> Result<(), SimError> {
            serde_json::to_writer(&mut writer, &record)?;
            writer.write_all(b"\n")?;
            Ok(())
        };
        line(Record::Run(&self.header))?;
        for t in &self.transmissions {
            line(Record::Transmission(t))?;
        }
        for m in &self.messages {
            line(Record::Message(m))?;
        }
        for c in &self.commands {
            line(Record::Command(c))?;
        }
        line(Record::Summary(&self.summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::ack_window::Bitmap;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn header() -> RunHeader {
        RunHeader {
            seed: 1,
            protocol: ProtocolKind::Novel,
            network: NetworkKind::Lorawan,
            devices: 1,
            duration_s: 100.0,
            warmup_s: 10.0,
            started_at: DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_default(),
        }
    }

    #[test]
    fn warmup_messages_are_excluded() {
        let mut metrics = MetricsCollector::new(secs(10));
        metrics.message_generated(0, 0, QosClass::Normal, secs(5));
        metrics.message_received(0, 0, secs(6));
        metrics.message_generated(0, 1, QosClass::Normal, secs(20));
        metrics.message_received(0, 1, secs(22));
        metrics.message_generated(0, 2, QosClass::Normal, secs(30));
        let report = metrics.finish(header(), 0);
        assert_eq!(report.summary.messages_generated, 2);
        assert_eq!(report.summary.messages_delivered, 1);
        assert_eq!(report.summary.delivery_rate, 0.5);
        assert_eq!(report.summary.latency_p50_s, 2.0);
        assert_eq!(report.messages.len(), 3);
    }

    #[test]
    fn ack_efficiency_counts_bits_per_downlink() {
        let mut metrics = MetricsCollector::new(Duration::ZERO);
        let full = Bitmap {
            base: 0,
            width: 16,
            bits: 0xFFFF,
        };
        let partial = Bitmap { bits: 0x7FFE, ..full };
        metrics.ack_sent(&AckInfo::Bitmap(full), secs(1));
        metrics.ack_sent(&AckInfo::Bitmap(partial), secs(2));
        let summary = metrics.finish(header(), 0).summary;
        assert_eq!(summary.ack_downlinks, 2);
        assert_eq!(summary.ack_efficiency, 15.0);
    }

    #[test]
    fn reapplied_commands_count_as_duplicates() {
        let mut metrics = MetricsCollector::new(Duration::ZERO);
        let command = Command {
            id: 4,
            device: 0,
            cmd_type: 0,
            payload: vec![1],
            priority: QosClass::Critical,
            arrived_at: secs(1),
            deadline: secs(600),
        };
        metrics.command_arrived(&command);
        metrics.commands_applied(&[4], secs(3));
        metrics.commands_applied(&[4], secs(900));
        metrics.commands_expired(&[command]);
        let report = metrics.finish(header(), 0);
        assert_eq!(report.summary.commands_applied, 1);
        assert_eq!(report.summary.duplicate_applications, 1);
        assert_eq!(report.summary.command_latency_p50_s, 2.0);
        assert_eq!(report.commands[0].applications, 2);
        assert_eq!(report.commands[0].outcome, CommandOutcome::Applied);
    }

    #[test]
    fn percentile_uses_nearest_rank() {
        let mut values: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile(&mut values, 0.50), 50.0);
        assert_eq!(percentile(&mut values, 0.95), 95.0);
        assert_eq!(percentile(&mut values, 0.99), 99.0);
        assert_eq!(percentile(&mut [], 0.5), 0.0);
    }

    #[test]
    fn json_lines_start_with_run_and_end_with_summary() {
        let mut metrics = MetricsCollector::new(Duration::ZERO);
        metrics.message_generated(0, 0, QosClass::BestEffort, secs(1));
        let report = metrics.finish(header(), 3);
        let mut out = Vec::new();
        report.write_json_lines(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["record"], "run");
        assert_eq!(lines[1]["record"], "message");
        assert_eq!(lines[1]["class"], "best_effort");
        assert_eq!(lines[2]["record"], "summary");
        assert_eq!(lines[2]["events_dispatched"], 3);
    }
}
