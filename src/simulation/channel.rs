//! Channel and resource model.
//!
//! Owns everything the radio medium decides:
//! - per-device links (distance, spreading factor, SNR) placed at run start
//! - airtime of a frame for the configured network kind
//! - duty-cycle ledgers for every device and for the gateway downlink
//! - collision detection between overlapping transmissions on one resource
//! - the Bernoulli packet-error draw, from the channel's own seeded generator
//!
//! A transmission is registered with [`ChannelModel::begin`] and resolved with
//! [`ChannelModel::finish`] once its airtime has elapsed. Overlap is detected
//! when the later transmission begins, and both sides are marked, so a
//! collision always fails every participant.

use std::time::Duration;

use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;

use super::duty_cycle::DutyCycleLedger;
use super::signal_calculations::{
    LoraParameters, calculate_lora_air_time, calculate_path_loss, calculate_rate_air_time, calculate_snr_limit, packet_error_rate, seconds,
    thermal_noise_floor,
};
use super::types::{DeviceId, Direction, NetworkKind, RngStream, TxId, seeded_stream};
use crate::config::{NetworkConfig, RunConfig};

/// Static radio link between one device and the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct Link {
    pub distance_m: f64,
    /// LoRaWAN only.
    pub spreading_factor: Option<u8>,
    pub uplink_snr_db: f64,
    pub downlink_snr_db: f64,
    pub uplink_per: f64,
    pub downlink_per: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelFailure {
    PacketError,
    Collision,
}

/// Result of one transmission.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelOutcome {
    pub tx: TxId,
    pub device: DeviceId,
    pub direction: Direction,
    pub start: Duration,
    pub airtime: Duration,
    pub failure: Option<ChannelFailure>,
    pub collision_partners: Vec<TxId>,
}

impl ChannelOutcome {
    pub fn success(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug, Clone)]
enum AirtimeModel {
    Lora {
        bandwidth: u32,
        coding_rate: u32,
        preamble_symbols: f64,
        crc_enabled: bool,
        mac_overhead: usize,
    },
    Rate {
        uplink_bps: f64,
        downlink_bps: f64,
        uplink_overhead: usize,
        downlink_overhead: usize,
        uplink_repetitions: u32,
    },
}

#[derive(Debug, Clone)]
struct ActiveTx {
    id: TxId,
    device: DeviceId,
    direction: Direction,
    /// `(channel, spreading factor)`; `None` for resources that cannot collide.
    resource: Option<(u16, u8)>,
    start: Duration,
    end: Duration,
    per: f64,
    collided: bool,
    partners: Vec<TxId>,
}

pub struct ChannelModel {
    kind: NetworkKind,
    airtime_model: AirtimeModel,
    /// Shared uplink channels; zero means scheduled access without collisions.
    shared_channels: u16,
    rx_delay: Duration,
    rx_window: Duration,
    links: Vec<Link>,
    device_ledgers: Vec<DutyCycleLedger>,
    gateway_ledger: DutyCycleLedger,
    active: Vec<ActiveTx>,
    next_tx: TxId,
    rng: ChaCha8Rng,
}

impl ChannelModel {
    /// Build the channel for a run: places every device and derives its link.
    pub fn new(config: &RunConfig) -> Self {
        let net = &config.network;
        let mut placement = seeded_stream(config.seed, RngStream::Placement);
        let links = (0..net.device_count).map(|_| place_device(net, &mut placement)).collect();

        let (airtime_model, shared_channels, rx_delay, rx_window, device_duty, gateway_duty, window) = match net.kind {
            NetworkKind::Lorawan => {
                let l = &net.lorawan;
                (
                    AirtimeModel::Lora {
                        bandwidth: l.bandwidth_hz,
                        coding_rate: l.coding_rate,
                        preamble_symbols: l.preamble_symbols,
                        crc_enabled: l.crc_enabled,
                        mac_overhead: l.mac_overhead_bytes,
                    },
                    l.channels,
                    l.rx_delay_s,
                    l.rx_window_s,
                    l.duty_cycle,
                    l.gateway_duty_cycle,
                    l.duty_cycle_window_s,
                )
            }
            NetworkKind::Nbiot => {
                let n = &net.nbiot;
                (
                    AirtimeModel::Rate {
                        uplink_bps: n.uplink_rate_bps,
                        downlink_bps: n.downlink_rate_bps,
                        uplink_overhead: n.mac_overhead_bytes,
                        downlink_overhead: n.mac_overhead_bytes,
                        uplink_repetitions: 1,
                    },
                    0,
                    n.rx_delay_s,
                    n.rx_window_s,
                    1.0,
                    1.0,
                    3600.0,
                )
            }
            NetworkKind::Sigfox => {
                let s = &net.sigfox;
                (
                    AirtimeModel::Rate {
                        uplink_bps: s.uplink_rate_bps,
                        downlink_bps: s.downlink_rate_bps,
                        uplink_overhead: s.uplink_overhead_bytes,
                        downlink_overhead: s.downlink_overhead_bytes,
                        uplink_repetitions: s.repetitions,
                    },
                    s.channels,
                    s.rx_delay_s,
                    s.rx_window_s,
                    s.duty_cycle,
                    s.gateway_duty_cycle,
                    s.duty_cycle_window_s,
                )
            }
        };

        let window = seconds(window);
        Self {
            kind: net.kind,
            airtime_model,
            shared_channels,
            rx_delay: seconds(rx_delay),
            rx_window: seconds(rx_window),
            device_ledgers: (0..net.device_count).map(|_| DutyCycleLedger::new(device_duty, window)).collect(),
            gateway_ledger: DutyCycleLedger::new(gateway_duty, window),
            links,
            active: Vec::new(),
            next_tx: 0,
            rng: seeded_stream(config.seed, RngStream::Channel),
        }
    }

    pub fn kind(&self) -> NetworkKind {
        self.kind
    }

    pub fn link(&self, device: DeviceId) -> &Link {
        &self.links[device as usize]
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Delay between the end of an uplink and the start of its receive window.
    pub fn rx_delay(&self) -> Duration {
        self.rx_delay
    }

    /// How long a device listens when no downlink is sent.
    pub fn rx_window(&self) -> Duration {
        self.rx_window
    }

    /// Time on air of a `frame_bytes` frame, link-layer overhead included.
    pub fn airtime(&self, device: DeviceId, direction: Direction, frame_bytes: usize) -> Duration {
        let secs = match &self.airtime_model {
            AirtimeModel::Lora {
                bandwidth,
                coding_rate,
                preamble_symbols,
                crc_enabled,
                mac_overhead,
            } => {
                let sf = self.link(device).spreading_factor.unwrap_or(12);
                let params = LoraParameters::for_spreading_factor(sf, *bandwidth, *coding_rate, *preamble_symbols, *crc_enabled);
                calculate_lora_air_time(&params, frame_bytes + mac_overhead)
            }
            AirtimeModel::Rate {
                uplink_bps,
                downlink_bps,
                uplink_overhead,
                downlink_overhead,
                uplink_repetitions,
            } => match direction {
                Direction::Uplink => calculate_rate_air_time(*uplink_bps, *uplink_overhead, frame_bytes, *uplink_repetitions),
                Direction::Downlink => calculate_rate_air_time(*downlink_bps, *downlink_overhead, frame_bytes, 1),
            },
        };
        seconds(secs)
    }

    /// Duty-cycle check for a device uplink.
    pub fn check_uplink(&self, device: DeviceId, start: Duration, airtime: Duration) -> Result<(), Duration> {
        self.device_ledgers[device as usize].check(start, airtime)
    }

    /// Duty-cycle check for a gateway downlink.
    pub fn check_downlink(&self, start: Duration, airtime: Duration) -> Result<(), Duration> {
        self.gateway_ledger.check(start, airtime)
    }

    /// Airtime a device has booked in the window ending at `at`.
    pub fn device_consumption(&self, device: DeviceId, at: Duration) -> Duration {
        self.device_ledgers[device as usize].consumed(at)
    }

    pub fn device_budget(&self) -> Duration {
        self.device_ledgers.first().map(DutyCycleLedger::budget).unwrap_or(Duration::MAX)
    }

    /// Put a transmission on air.
    ///
    /// The duty-cycle check must have passed; the airtime is booked against the
    /// transmitter's ledger here. Any overlapping transmission on the same
    /// resource is marked as collided together with this one.
    pub fn begin(&mut self, device: DeviceId, direction: Direction, start: Duration, airtime: Duration) -> TxId {
        let id = self.next_tx;
        self.next_tx += 1;

        let link = &self.links[device as usize];
        let (per, resource) = match direction {
            Direction::Uplink => {
                self.device_ledgers[device as usize].record(start, airtime);
                let resource = if self.shared_channels > 0 {
                    let channel = self.rng.gen_range(0..self.shared_channels);
                    Some((channel, link.spreading_factor.unwrap_or(0)))
                } else {
                    None
                };
                (link.uplink_per, resource)
            }
            Direction::Downlink => {
                self.gateway_ledger.record(start, airtime);
                (link.downlink_per, None)
            }
        };

        let end = start + airtime;
        let mut partners = Vec::new();
        if resource.is_some() {
            for other in self.active.iter_mut() {
                if other.resource == resource && other.start < end && other.end > start {
                    other.collided = true;
                    other.partners.push(id);
                    partners.push(other.id);
                }
            }
        }
        if !partners.is_empty() {
            log::trace!("tx {id} from device {device} collides with {partners:?}");
        }

        self.active.push(ActiveTx {
            id,
            device,
            direction,
            resource,
            start,
            end,
            per,
            collided: !partners.is_empty(),
            partners,
        });
        id
    }

    /// Resolve a transmission: collisions first, then the packet-error draw.
    pub fn finish(&mut self, tx: TxId) -> Option<ChannelOutcome> {
        let index = self.active.iter().position(|a| a.id == tx)?;
        let active = self.active.remove(index);
        let failure = if active.collided {
            Some(ChannelFailure::Collision)
        } else if self.rng.gen_bool(active.per) {
            Some(ChannelFailure::PacketError)
        } else {
            None
        };
        Some(ChannelOutcome {
            tx: active.id,
            device: active.device,
            direction: active.direction,
            start: active.start,
            airtime: active.end - active.start,
            failure,
            collision_partners: active.partners,
        })
    }
}

/// Draw a position on the cell disc and derive the link budget.
fn place_device(net: &NetworkConfig, rng: &mut ChaCha8Rng) -> Link {
    // uniform over the annulus area
    let r2 = rng.gen_range(net.min_distance_m.powi(2)..net.cell_radius_m.powi(2));
    let distance_m = r2.sqrt();
    let path_loss = calculate_path_loss(distance_m, &net.path_loss, rng);
    let k = net.per_steepness_per_db;

    match net.kind {
        NetworkKind::Lorawan => {
            let l = &net.lorawan;
            let index = WeightedIndex::new(l.spreading_factor_weights).map(|w| w.sample(rng)).unwrap_or(0);
            let sf = RunConfig::spreading_factor(index);
            let noise = l.noise_floor_dbm();
            let uplink_snr_db = l.tx_power_dbm - path_loss - noise;
            let downlink_snr_db = l.gateway_tx_power_dbm - path_loss - noise;
            let limit = calculate_snr_limit(sf);
            let floor = l.residual_per[index];
            Link {
                distance_m,
                spreading_factor: Some(sf),
                uplink_snr_db,
                downlink_snr_db,
                uplink_per: packet_error_rate(uplink_snr_db, limit, k, floor),
                downlink_per: packet_error_rate(downlink_snr_db, limit, k, floor),
            }
        }
        NetworkKind::Nbiot => {
            let n = &net.nbiot;
            let noise = thermal_noise_floor(n.bandwidth_hz, n.noise_figure_db);
            let uplink_snr_db = n.tx_power_dbm - path_loss - noise;
            let downlink_snr_db = n.gateway_tx_power_dbm - path_loss - noise;
            Link {
                distance_m,
                spreading_factor: None,
                uplink_snr_db,
                downlink_snr_db,
                uplink_per: packet_error_rate(uplink_snr_db, n.snr_limit_db, k, n.residual_per),
                downlink_per: packet_error_rate(downlink_snr_db, n.snr_limit_db, k, n.residual_per),
            }
        }
        NetworkKind::Sigfox => {
            let s = &net.sigfox;
            let noise = thermal_noise_floor(s.bandwidth_hz, s.noise_figure_db);
            let uplink_snr_db = s.tx_power_dbm - path_loss - noise;
            let downlink_snr_db = s.gateway_tx_power_dbm - path_loss - noise;
            // the frame survives if any repetition does
            let single = packet_error_rate(uplink_snr_db, s.snr_limit_db, k, s.residual_per);
            Link {
                distance_m,
                spreading_factor: None,
                uplink_snr_db,
                downlink_snr_db,
                uplink_per: single.powi(s.repetitions as i32),
                downlink_per: packet_error_rate(downlink_snr_db, s.snr_limit_db, k, s.residual_per),
            }
        }
    }
}
