//! Uplink and command arrival processes.
//!
//! All draws come from the run's traffic stream, so changing the protocol
//! under test leaves the offered load untouched for a given seed.

use std::time::Duration;

use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use rand_chacha::ChaCha8Rng;
use rand_distr::Exp;

use super::types::{Command, CommandId, QosClass, RngStream, seeded_stream};
use crate::config::{DownlinkPattern, QosConfig, RunConfig, TrafficConfig, UplinkPattern};
use crate::error::SimError;
use crate::simulation::signal_calculations::seconds;

pub struct TrafficGenerator {
    config: TrafficConfig,
    device_count: usize,
    rng: ChaCha8Rng,
    uplink_classes: WeightedIndex<f64>,
    command_classes: Option<WeightedIndex<f64>>,
    next_command: CommandId,
}

impl TrafficGenerator {
    pub fn new(config: &RunConfig) -> Result<Self, SimError> {
        let traffic = config.traffic.clone();
        let uplink_classes = WeightedIndex::new(traffic.uplink.class_mix.weights())
            .map_err(|e| SimError::ConfigInvalid(format!("traffic.uplink.class_mix: {e}")))?;
        let command_classes = if traffic.downlink.enabled {
            Some(
                WeightedIndex::new(traffic.downlink.class_mix.weights())
                    .map_err(|e| SimError::ConfigInvalid(format!("traffic.downlink.class_mix: {e}")))?,
            )
        } else {
            None
        };
        Ok(Self {
            config: traffic,
            device_count: config.network.device_count,
            rng: seeded_stream(config.seed, RngStream::Traffic),
            uplink_classes,
            command_classes,
            next_command: 0,
        })
    }

    pub fn commands_enabled(&self) -> bool {
        self.command_classes.is_some()
    }

    /// Offset of a device's first message, uniform over one interval so that
    /// devices do not start in lockstep.
    pub fn first_uplink(&mut self) -> Duration {
        seconds(self.rng.gen_range(0.0..self.config.uplink.interval_s))
    }

    /// Gap until the device's next message.
    pub fn next_uplink_gap(&mut self) -> Duration {
        let up = &self.config.uplink;
        let gap = match up.pattern {
            UplinkPattern::Periodic => {
                let jitter = if up.jitter_ratio > 0.0 {
                    self.rng.gen_range(-up.jitter_ratio..up.jitter_ratio)
                } else {
                    0.0
                };
                up.interval_s * (1.0 + jitter)
            }
            UplinkPattern::Poisson => exponential(&mut self.rng, up.interval_s),
            UplinkPattern::EventDriven => exponential(&mut self.rng, 2.0 * up.interval_s),
        };
        seconds(gap.max(up.min_interval_s))
    }

    pub fn uplink_class(&mut self) -> QosClass {
        QosClass::ALL[self.uplink_classes.sample(&mut self.rng)]
    }

    pub fn uplink_payload(&self) -> usize {
        self.config.uplink.payload_bytes
    }

    /// Gap until the next command arrives anywhere in the network.
    pub fn next_command_gap(&mut self) -> Duration {
        let down = &self.config.downlink;
        let rate_per_s = down.rate_per_device_per_hour * self.device_count as f64 / 3600.0;
        let mean = 1.0 / rate_per_s;
        let gap = match down.pattern {
            DownlinkPattern::Uniform => exponential(&mut self.rng, mean),
            DownlinkPattern::Bursty => {
                if self.rng.gen_bool(down.burst_probability) {
                    exponential(&mut self.rng, down.burst_mean_gap_s)
                } else {
                    exponential(&mut self.rng, mean)
                }
            }
            DownlinkPattern::Scheduled => mean,
        };
        seconds(gap.max(down.min_interval_s))
    }

    /// Draw the next command: target device, type, payload and class.
    pub fn next_command(&mut self, now: Duration, qos: &QosConfig) -> Command {
        let id = self.next_command;
        self.next_command += 1;
        let device = self.rng.gen_range(0..self.device_count) as u32;
        let cmd_type = self.rng.gen_range(0..self.config.downlink.command_types);
        let priority = match &self.command_classes {
            Some(classes) => QosClass::ALL[classes.sample(&mut self.rng)],
            None => QosClass::BestEffort,
        };
        // longer payloads for higher command types
        let payload = (0..=cmd_type).map(|_| self.rng.gen_range(0..=u8::MAX)).collect();
        Command {
            id,
            device,
            cmd_type,
            payload,
            priority,
            arrived_at: now,
            deadline: qos.target(priority).deadline,
        }
    }
}

fn exponential(rng: &mut ChaCha8Rng, mean: f64) -> f64 {
    match Exp::new(1.0 / mean) {
        Ok(exp) => exp.sample(rng),
        Err(_) => mean,
    }
}
