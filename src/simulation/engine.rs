//! Event dispatch for one simulation run.
//!
//! [`run`] wires the parts together: the scheduler owns simulated time, the
//! channel decides what makes it through the air, devices and the gateway
//! run the protocol state machines and the metrics collector observes every
//! outcome. Handlers never block; anything that has to happen later is put
//! back on the scheduler.
//!
//! Event flow for one uplink:
//! 1) `TransmitAttempt`: the device frames its next uplink, the duty-cycle
//!    check either passes or pushes the attempt to the earliest legal time.
//! 2) `UplinkEnd`: the channel resolves the frame, the gateway consumes it and
//!    composes a downlink for the receive window, if it has one and may send.
//! 3) `DownlinkEnd` or `RxWindowClosed`: the device applies what it heard and
//!    goes back to idle.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use rand_chacha::ChaCha8Rng;

use super::channel::ChannelModel;
use super::device::{Device, DeviceParams, FrameKind};
use super::gateway::Gateway;
use super::scheduler::Scheduler;
use super::traffic::TrafficGenerator;
use super::types::{CommandId, DeviceId, Direction, Event, RngStream, TxId, seeded_stream};
use crate::config::RunConfig;
use crate::error::SimError;
use crate::metrics::{FrameLabel, MetricsCollector, RunHeader, RunReport, TransmissionRecord};
use crate::protocols::{self, AckMode, ProtocolAdapter};

/// A downlink on air, waiting for its `DownlinkEnd`.
struct PendingDownlink {
    bytes: Vec<u8>,
    header_bytes: usize,
    commands: Vec<CommandId>,
}

/// Everything a run mutates, apart from the scheduler itself.
struct World {
    config: RunConfig,
    adapter: Box<dyn ProtocolAdapter>,
    channel: ChannelModel,
    devices: Vec<Device>,
    /// Earliest uplink start the device duty cycle allows, per device.
    duty_hold: Vec<Duration>,
    gateway: Gateway,
    traffic: TrafficGenerator,
    metrics: MetricsCollector,
    protocol_rng: ChaCha8Rng,
    downlinks: HashMap<TxId, PendingDownlink>,
}

fn device_mut(devices: &mut [Device], id: DeviceId, now: Duration) -> Result<&mut Device, SimError> {
    devices
        .get_mut(id as usize)
        .ok_or_else(|| SimError::invariant(format!("device {id}"), now, "no such device"))
}

fn frame_label(kind: &FrameKind) -> FrameLabel {
    match kind {
        FrameKind::Data { .. } => FrameLabel::Data,
        FrameKind::SessionRequest => FrameLabel::SessionRequest,
        FrameKind::KeepAlive => FrameLabel::KeepAlive,
    }
}

impl World {
    fn new(config: &RunConfig) -> Result<Self, SimError> {
        let adapter = protocols::build(config);
        let params = DeviceParams::new(config, adapter.as_ref());
        let devices = (0..config.network.device_count as DeviceId)
            .map(|id| Device::new(id, params.clone(), 0))
            .collect();
        Ok(Self {
            channel: ChannelModel::new(config),
            devices,
            duty_hold: vec![Duration::ZERO; config.network.device_count],
            gateway: Gateway::new(config, adapter.as_ref()),
            traffic: TrafficGenerator::new(config)?,
            metrics: MetricsCollector::new(config.warmup()),
            protocol_rng: seeded_stream(config.seed, RngStream::Protocol),
            downlinks: HashMap::new(),
            adapter,
            config: config.clone(),
        })
    }

    /// Queue the first event of every recurring process.
    fn prime(&mut self, scheduler: &mut Scheduler<Event>) -> Result<(), SimError> {
        for device in 0..self.devices.len() as DeviceId {
            let first = self.traffic.first_uplink();
            scheduler.schedule(Event::UplinkGenerated { device }, first)?;
            if let Some(interval) = self.adapter.keep_alive() {
                scheduler.schedule(Event::KeepAlive { device }, interval)?;
            }
        }
        if self.traffic.commands_enabled() {
            let first = self.traffic.next_command_gap();
            scheduler.schedule(Event::CommandArrival, first)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, scheduler: &mut Scheduler<Event>, event: Event) -> Result<(), SimError> {
        let now = scheduler.now();
        log::trace!("{now:?}: {event:?}");
        match event {
            Event::UplinkGenerated { device } => self.on_uplink_generated(scheduler, device, now),
            Event::CommandArrival => self.on_command_arrival(scheduler, now),
            Event::TransmitAttempt { device } => self.on_transmit_attempt(scheduler, device, now),
            Event::UplinkEnd { device, tx } => self.on_uplink_end(scheduler, device, tx, now),
            Event::DownlinkEnd { device, tx } => self.on_downlink_end(scheduler, device, tx, now),
            Event::RxWindowClosed { device } => {
                let listened = self.channel.rx_window();
                let energy = device_mut(&mut self.devices, device, now)?.close_rx_window(listened);
                self.metrics.listen_energy(energy, now);
                self.kick(scheduler, device, now)
            }
            Event::AckTimeout { device, message, attempt } => {
                if let Some(resolution) = device_mut(&mut self.devices, device, now)?.ack_timeout(message, attempt, now) {
                    self.metrics.message_resolved(&resolution);
                }
                self.kick(scheduler, device, now)
            }
            Event::QosDeadline { device, message } => {
                if let Some(resolution) = device_mut(&mut self.devices, device, now)?.qos_deadline(message, now) {
                    log::debug!("device {device}: message {message} missed its deadline");
                    self.metrics.message_resolved(&resolution);
                }
                self.kick(scheduler, device, now)
            }
            Event::KeepAlive { device } => {
                if let Some(interval) = self.adapter.keep_alive() {
                    scheduler.schedule_in(Event::KeepAlive { device }, interval);
                }
                self.kick(scheduler, device, now)
            }
        }
    }

    fn on_uplink_generated(&mut self, scheduler: &mut Scheduler<Event>, id: DeviceId, now: Duration) -> Result<(), SimError> {
        let class = self.traffic.uplink_class();
        let target = self.config.qos.target(class);
        let payload = self.traffic.uplink_payload();
        let adapter = self.adapter.as_ref();
        let device = device_mut(&mut self.devices, id, now)?;
        let (index, evicted) = device.generate(class, target, payload, now, adapter, &mut self.protocol_rng);
        self.metrics.observe_state_bytes(device.state_bytes(adapter));
        self.metrics.message_generated(id, index, class, now);
        if let Some(resolution) = evicted {
            log::debug!("device {id}: outstanding ring full, message {} dropped", resolution.message);
            self.metrics.message_resolved(&resolution);
        }
        if matches!(adapter.ack_mode(), AckMode::WindowedBitmap { .. }) {
            scheduler.schedule(Event::QosDeadline { device: id, message: index }, now + target.deadline)?;
        }
        let gap = self.traffic.next_uplink_gap();
        scheduler.schedule_in(Event::UplinkGenerated { device: id }, gap);
        self.kick(scheduler, id, now)
    }

    fn on_command_arrival(&mut self, scheduler: &mut Scheduler<Event>, now: Duration) -> Result<(), SimError> {
        let command = self.traffic.next_command(now, &self.config.qos);
        log::debug!("command {} for device {} queued at gateway", command.id, command.device);
        self.metrics.command_arrived(&command);
        self.gateway.enqueue_command(command)?;
        let gap = self.traffic.next_command_gap();
        scheduler.schedule_in(Event::CommandArrival, gap);
        Ok(())
    }

    fn on_transmit_attempt(&mut self, scheduler: &mut Scheduler<Event>, id: DeviceId, now: Duration) -> Result<(), SimError> {
        let adapter = self.adapter.as_ref();
        let device = device_mut(&mut self.devices, id, now)?;
        if device.wake_at == Some(now) {
            device.wake_at = None;
        }
        let Some(frame) = device.build_frame(now, adapter) else {
            return self.kick(scheduler, id, now);
        };

        let airtime = self.channel.airtime(id, Direction::Uplink, frame.len());
        if let Err(earliest) = self.channel.check_uplink(id, now, airtime) {
            log::trace!("device {id}: duty cycle exhausted, deferring to {earliest:?}");
            self.metrics.duty_cycle_deferral(Direction::Uplink, now);
            self.duty_hold[id as usize] = earliest;
            device.wake_at = Some(earliest);
            scheduler.schedule(Event::TransmitAttempt { device: id }, earliest)?;
            return Ok(());
        }

        let tx = self.channel.begin(id, Direction::Uplink, now, airtime);
        if self.channel.device_consumption(id, now + airtime) > self.channel.device_budget() {
            return Err(SimError::invariant(format!("device {id}"), now, "uplink airtime over the duty-cycle budget"));
        }
        if let FrameKind::Data { message, .. } = frame.kind {
            self.metrics.message_attempted(id, message, now);
        }
        if let Some(resolution) = device.commit_frame(frame, tx, now, airtime) {
            self.metrics.message_resolved(&resolution);
        }
        scheduler.schedule(Event::UplinkEnd { device: id, tx }, now + airtime)?;
        Ok(())
    }

    fn on_uplink_end(&mut self, scheduler: &mut Scheduler<Event>, id: DeviceId, tx: TxId, now: Duration) -> Result<(), SimError> {
        let adapter = self.adapter.as_ref();
        let rx_delay = self.channel.rx_delay();
        let rx_window = self.channel.rx_window();
        let listen_end = now + rx_delay + rx_window;

        let outcome = self
            .channel
            .finish(tx)
            .ok_or_else(|| SimError::invariant(format!("tx {tx}"), now, "uplink ended but was never on air"))?;
        let device = device_mut(&mut self.devices, id, now)?;
        let sent = device
            .uplink_finished()
            .ok_or_else(|| SimError::invariant(format!("device {id}"), now, "uplink ended while the radio was not transmitting"))?;

        let mut record = TransmissionRecord::new(&outcome, frame_label(&sent.frame.kind), sent.frame.len(), sent.frame.header.len(), sent.energy_mj);
        if let FrameKind::Data { message, attempt, .. } = sent.frame.kind {
            record.message = Some(message);
            record.attempt = Some(attempt);
            let timeout = device
                .message(message)
                .filter(|m| m.plan.confirmable)
                .and_then(|m| adapter.ack_timeout(&m.plan, attempt));
            if let Some(timeout) = timeout {
                // never before the receive window that could carry the ACK closed
                let fires = now + timeout.max(rx_delay + rx_window);
                scheduler.schedule(Event::AckTimeout { device: id, message, attempt }, fires)?;
            }
        }
        self.metrics.transmission(record);

        if !outcome.success() {
            scheduler.schedule(Event::RxWindowClosed { device: id }, listen_end)?;
            return Ok(());
        }

        let receipt = self.gateway.receive_uplink(id, sent.frame.frame_counter, &sent.frame.to_bytes(), now, adapter)?;
        if receipt.body.is_none() {
            self.metrics.unreadable_frame();
        }
        if receipt.data_accepted {
            if let FrameKind::Data { message, .. } = sent.frame.kind {
                self.metrics.message_received(id, message, now);
            }
        }
        if receipt.token_rejected {
            self.metrics.token_rejected(now);
        }
        if let Some(renewal) = receipt.token_issued {
            self.metrics.token_issued(renewal, now);
        }
        self.metrics.commands_confirmed(&receipt.confirmed, now);

        let expired = self.gateway.expire_commands(id, now)?;
        if !expired.is_empty() {
            log::debug!("device {id}: {} commands expired at the gateway", expired.len());
            self.metrics.commands_expired(&expired);
        }

        let Some(downlink) = self.gateway.prepare_downlink(id, now) else {
            scheduler.schedule(Event::RxWindowClosed { device: id }, listen_end)?;
            return Ok(());
        };
        let bytes = adapter.encode_downlink(&downlink);
        let airtime = self.channel.airtime(id, Direction::Downlink, bytes.len());
        let start = now + rx_delay;
        if !self.gateway.radio_free(start) || self.channel.check_downlink(start, airtime).is_err() {
            log::trace!("device {id}: gateway cannot answer in this receive window");
            self.metrics.duty_cycle_deferral(Direction::Downlink, now);
            scheduler.schedule(Event::RxWindowClosed { device: id }, listen_end)?;
            return Ok(());
        }

        let commands = self.gateway.commit_downlink(id, &downlink, now)?;
        self.gateway.occupy_radio(start, airtime);
        let tx = self.channel.begin(id, Direction::Downlink, start, airtime);
        if let Some(ack) = &downlink.ack {
            self.metrics.ack_sent(ack, now);
        }
        let command_bytes = downlink.batch.as_ref().map_or(0, |b| b.payload_bytes());
        self.downlinks.insert(
            tx,
            PendingDownlink {
                header_bytes: bytes.len().saturating_sub(command_bytes),
                bytes,
                commands,
            },
        );
        scheduler.schedule(Event::DownlinkEnd { device: id, tx }, start + airtime)?;
        Ok(())
    }

    fn on_downlink_end(&mut self, scheduler: &mut Scheduler<Event>, id: DeviceId, tx: TxId, now: Duration) -> Result<(), SimError> {
        let adapter = self.adapter.as_ref();
        let outcome = self
            .channel
            .finish(tx)
            .ok_or_else(|| SimError::invariant(format!("tx {tx}"), now, "downlink ended but was never on air"))?;
        let pending = self
            .downlinks
            .remove(&tx)
            .ok_or_else(|| SimError::invariant(format!("tx {tx}"), now, "downlink content missing"))?;
        let device = device_mut(&mut self.devices, id, now)?;
        let energy = device.close_rx_window(outcome.airtime);
        self.metrics
            .transmission(TransmissionRecord::new(&outcome, FrameLabel::Downlink, pending.bytes.len(), pending.header_bytes, energy));

        if outcome.success() {
            match adapter.parse_downlink(&pending.bytes) {
                Ok(downlink) => {
                    let effects = device.receive_downlink(&downlink, now, adapter.dedup_policy());
                    for resolution in &effects.resolutions {
                        self.metrics.message_resolved(resolution);
                    }
                    match effects.batch_applied {
                        Some(true) => self.metrics.commands_applied(&pending.commands, now),
                        Some(false) => log::trace!("device {id}: command batch already applied"),
                        None => {}
                    }
                    self.metrics.observe_state_bytes(device.state_bytes(adapter));
                }
                Err(e) => {
                    log::warn!("device {id}: dropping unreadable downlink at {now:?}: {e}");
                    self.metrics.unreadable_frame();
                }
            }
        }
        self.kick(scheduler, id, now)
    }

    /// Make sure a `TransmitAttempt` is queued for the device's next due time.
    fn kick(&mut self, scheduler: &mut Scheduler<Event>, id: DeviceId, now: Duration) -> Result<(), SimError> {
        let hold = self.duty_hold.get(id as usize).copied().unwrap_or_default();
        let device = device_mut(&mut self.devices, id, now)?;
        let Some(due) = device.next_due(now) else {
            return Ok(());
        };
        let due = due.max(now).max(hold);
        let queued = match device.wake_at {
            Some(wake) => wake >= now && wake <= due,
            None => false,
        };
        if !queued {
            device.wake_at = Some(due);
            scheduler.schedule(Event::TransmitAttempt { device: id }, due)?;
        }
        Ok(())
    }

    fn finish(mut self, end: Duration, events_dispatched: u64, header: RunHeader) -> RunReport {
        for device in self.devices.iter_mut() {
            for resolution in device.drain(end) {
                self.metrics.message_resolved(&resolution);
            }
        }
        let devices = self.devices.len();
        log::debug!("{devices} devices drained at {end:?}");
        self.metrics.finish(header, events_dispatched)
    }
}

/// Execute one run to completion.
///
/// # Parameters
///
/// * `config` - Fully resolved run configuration; validated again here
///
/// # Returns
///
/// The full trace and summary of the run.
///
/// # Errors
///
/// Any [`SimError`] raised by a handler aborts the run: invalid configuration,
/// a frame counter regression or a broken internal invariant.
pub fn run(config: &RunConfig) -> Result<RunReport, SimError> {
    config.validate()?;
    let header = RunHeader {
        seed: config.seed,
        protocol: config.protocol,
        network: config.network.kind,
        devices: config.network.device_count,
        duration_s: config.duration_s,
        warmup_s: config.warmup_s,
        started_at: Utc::now(),
    };
    log::info!(
        "starting run: seed {}, {:?} over {:?}, {} devices, {} s",
        config.seed,
        config.protocol,
        config.network.kind,
        config.network.device_count,
        config.duration_s
    );

    let mut world = World::new(config)?;
    let mut scheduler = Scheduler::new();
    world.prime(&mut scheduler)?;
    let end = config.duration();
    let dispatched = scheduler.run_until(end, |scheduler, event| world.dispatch(scheduler, event))?;
    Ok(world.finish(end, dispatched, header))
}

/// Run the same configuration once per seed, in parallel.
///
/// Results come back in seed order. Each run is independent: a failing seed
/// does not stop the others.
pub fn run_batch(config: &RunConfig, seeds: &[u64]) -> Vec<Result<RunReport, SimError>> {
    std::thread::scope(|scope| {
        let handles: Vec<_> = seeds
            .iter()
            .map(|&seed| {
                let config = RunConfig { seed, ..config.clone() };
                scope.spawn(move || run(&config))
            })
            .collect();
        handles
            .into_iter()
            .zip(seeds)
            .map(|(handle, seed)| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(SimError::invariant(format!("run seed {seed}"), Duration::ZERO, "worker thread panicked")))
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::ProtocolKind;
    use crate::simulation::device::MessageState;

    fn small(protocol: ProtocolKind) -> RunConfig {
        let mut config = RunConfig::default();
        config.protocol = protocol;
        config.network.device_count = 10;
        config.duration_s = 6.0 * 3600.0;
        config.warmup_s = 3600.0;
        config
    }

    #[test]
    fn every_generated_message_is_resolved() {
        for protocol in [ProtocolKind::Novel, ProtocolKind::MqttSn, ProtocolKind::Coap] {
            let report = run(&small(protocol)).unwrap();
            assert!(!report.messages.is_empty());
            for message in &report.messages {
                assert!(
                    !matches!(message.state, MessageState::Pending | MessageState::AwaitAck | MessageState::Retry),
                    "{protocol:?}: {message:?}"
                );
                assert!(message.resolved_s.is_some());
            }
        }
    }

    #[test]
    fn transmissions_never_overlap_per_device() {
        let report = run(&small(ProtocolKind::Novel)).unwrap();
        let mut last_end: HashMap<DeviceId, f64> = HashMap::new();
        for t in report.transmissions.iter().filter(|t| t.direction == Direction::Uplink) {
            let end = t.start_s + t.airtime_ms / 1000.0;
            if let Some(previous) = last_end.insert(t.device, end) {
                assert!(t.start_s >= previous, "device {} overlaps", t.device);
            }
        }
    }

    #[test]
    fn session_is_opened_before_data() {
        let report = run(&small(ProtocolKind::Novel)).unwrap();
        for device in 0..10 {
            let first = report.transmissions.iter().find(|t| t.device == device && t.direction == Direction::Uplink);
            if let Some(first) = first {
                assert_eq!(first.frame, FrameLabel::SessionRequest);
            }
        }
    }

    #[test]
    fn invalid_configuration_is_rejected_before_running() {
        let mut config = small(ProtocolKind::Novel);
        config.warmup_s = config.duration_s;
        assert!(matches!(run(&config), Err(SimError::ConfigInvalid(_))));
    }

    #[test]
    fn batch_runs_come_back_in_seed_order() {
        let config = small(ProtocolKind::MqttSn);
        let results = run_batch(&config, &[3, 1, 2]);
        let seeds: Vec<u64> = results.iter().map(|r| r.as_ref().unwrap().header.seed).collect();
        assert_eq!(seeds, vec![3, 1, 2]);
    }
}
