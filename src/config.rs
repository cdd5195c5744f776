//! Run configuration.
//!
//! A [`RunConfig`] is the fully resolved, immutable description of one
//! simulation run. It is loaded from TOML or JSON, every section falls back to
//! documented defaults, and [`RunConfig::validate`] rejects out-of-range values
//! before anything is scheduled. The defaults describe the reference scenario:
//! 100 LoRaWAN devices reporting every 10 minutes over 24 h with a 2 h warm-up.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::SimError;
use crate::protocols::ProtocolKind;
use crate::simulation::signal_calculations::{PathLossParameters, seconds, thermal_noise_floor};
use crate::simulation::types::{NetworkKind, QosClass, QosTarget};

const MAX_DEVICES: usize = 100_000;
const MAX_ACK_WINDOW: usize = 64;
/// The novel downlink carries the batch size in one byte.
const MAX_COMMAND_BUDGET: usize = u8::MAX as usize;
const MIN_SPREADING_FACTOR: u8 = 7;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub seed: u64,
    pub duration_s: f64,
    pub warmup_s: f64,
    pub protocol: ProtocolKind,
    pub network: NetworkConfig,
    pub traffic: TrafficConfig,
    pub qos: QosConfig,
    pub device: DeviceConfig,
    pub novel: NovelConfig,
    pub mqtt_sn: MqttSnConfig,
    pub coap: CoapConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: 1,
            duration_s: 24.0 * 3600.0,
            warmup_s: 2.0 * 3600.0,
            protocol: ProtocolKind::Novel,
            network: NetworkConfig::default(),
            traffic: TrafficConfig::default(),
            qos: QosConfig::default(),
            device: DeviceConfig::default(),
            novel: NovelConfig::default(),
            mqtt_sn: MqttSnConfig::default(),
            coap: CoapConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub kind: NetworkKind,
    pub device_count: usize,
    /// Devices are placed uniformly over a disc of this radius around the gateway.
    pub cell_radius_m: f64,
    pub min_distance_m: f64,
    pub path_loss: PathLossParameters,
    /// Slope of the logistic SNR-to-PER curve, per dB of margin.
    pub per_steepness_per_db: f64,
    pub lorawan: LorawanConfig,
    pub nbiot: NbIotConfig,
    pub sigfox: SigfoxConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            kind: NetworkKind::Lorawan,
            device_count: 100,
            cell_radius_m: 2000.0,
            min_distance_m: 50.0,
            path_loss: PathLossParameters::default(),
            per_steepness_per_db: 1.5,
            lorawan: LorawanConfig::default(),
            nbiot: NbIotConfig::default(),
            sigfox: SigfoxConfig::default(),
        }
    }
}

/// EU868-style LoRaWAN link.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LorawanConfig {
    pub bandwidth_hz: u32,
    pub coding_rate: u32,
    pub preamble_symbols: f64,
    pub crc_enabled: bool,
    /// Share of devices per spreading factor, SF7 first.
    pub spreading_factor_weights: [f64; 6],
    /// Residual packet error rate per spreading factor, SF7 first.
    pub residual_per: [f64; 6],
    /// Maximum MAC payload per spreading factor, SF7 first.
    pub max_payload_bytes: [usize; 6],
    pub channels: u16,
    pub mac_overhead_bytes: usize,
    pub duty_cycle: f64,
    pub gateway_duty_cycle: f64,
    pub duty_cycle_window_s: f64,
    pub rx_delay_s: f64,
    pub rx_window_s: f64,
    pub tx_power_dbm: f64,
    pub gateway_tx_power_dbm: f64,
    pub noise_figure_db: f64,
}

impl Default for LorawanConfig {
    fn default() -> Self {
        Self {
            bandwidth_hz: 125_000,
            coding_rate: 1,
            preamble_symbols: 8.0,
            crc_enabled: true,
            spreading_factor_weights: [0.30, 0.25, 0.20, 0.15, 0.07, 0.03],
            residual_per: [0.05, 0.04, 0.03, 0.02, 0.015, 0.01],
            max_payload_bytes: [222, 222, 115, 51, 51, 51],
            channels: 3,
            mac_overhead_bytes: 13,
            duty_cycle: 0.01,
            gateway_duty_cycle: 0.10,
            duty_cycle_window_s: 3600.0,
            rx_delay_s: 1.0,
            rx_window_s: 0.1,
            tx_power_dbm: 14.0,
            gateway_tx_power_dbm: 27.0,
            noise_figure_db: 6.0,
        }
    }
}

impl LorawanConfig {
    pub fn noise_floor_dbm(&self) -> f64 {
        thermal_noise_floor(self.bandwidth_hz as f64, self.noise_figure_db)
    }
}

/// Licensed-spectrum NB-IoT link (scheduled access, no duty cycle).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NbIotConfig {
    pub uplink_rate_bps: f64,
    pub downlink_rate_bps: f64,
    pub mac_overhead_bytes: usize,
    pub residual_per: f64,
    pub snr_limit_db: f64,
    pub max_payload_bytes: usize,
    pub rx_delay_s: f64,
    pub rx_window_s: f64,
    pub tx_power_dbm: f64,
    pub gateway_tx_power_dbm: f64,
    pub bandwidth_hz: f64,
    pub noise_figure_db: f64,
}

impl Default for NbIotConfig {
    fn default() -> Self {
        Self {
            uplink_rate_bps: 62_500.0,
            downlink_rate_bps: 27_200.0,
            mac_overhead_bytes: 8,
            residual_per: 0.001,
            snr_limit_db: -12.6,
            max_payload_bytes: 1600,
            rx_delay_s: 0.1,
            rx_window_s: 0.05,
            tx_power_dbm: 23.0,
            gateway_tx_power_dbm: 43.0,
            bandwidth_hz: 180_000.0,
            noise_figure_db: 5.0,
        }
    }
}

/// Ultra-narrowband Sigfox link.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SigfoxConfig {
    pub uplink_rate_bps: f64,
    pub downlink_rate_bps: f64,
    pub uplink_overhead_bytes: usize,
    pub downlink_overhead_bytes: usize,
    pub repetitions: u32,
    pub channels: u16,
    pub residual_per: f64,
    pub snr_limit_db: f64,
    pub max_payload_bytes: usize,
    pub duty_cycle: f64,
    pub gateway_duty_cycle: f64,
    pub duty_cycle_window_s: f64,
    pub rx_delay_s: f64,
    pub rx_window_s: f64,
    pub tx_power_dbm: f64,
    pub gateway_tx_power_dbm: f64,
    pub bandwidth_hz: f64,
    pub noise_figure_db: f64,
}

impl Default for SigfoxConfig {
    fn default() -> Self {
        Self {
            uplink_rate_bps: 100.0,
            downlink_rate_bps: 600.0,
            uplink_overhead_bytes: 14,
            downlink_overhead_bytes: 15,
            repetitions: 3,
            channels: 360,
            residual_per: 0.01,
            snr_limit_db: 6.0,
            max_payload_bytes: 12,
            duty_cycle: 0.01,
            gateway_duty_cycle: 0.10,
            duty_cycle_window_s: 3600.0,
            rx_delay_s: 20.0,
            rx_window_s: 25.0,
            tx_power_dbm: 14.0,
            gateway_tx_power_dbm: 27.0,
            bandwidth_hz: 100.0,
            noise_figure_db: 6.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UplinkPattern {
    /// Fixed interval with uniform jitter.
    #[default]
    Periodic,
    /// Exponential inter-arrival times.
    Poisson,
    /// Sparse exponential arrivals at twice the configured interval.
    EventDriven,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DownlinkPattern {
    /// Poisson arrivals spread evenly over devices.
    #[default]
    Uniform,
    /// Poisson arrivals with occasional short bursts.
    Bursty,
    /// Fixed-interval arrivals.
    Scheduled,
}

/// Relative weights of the three QoS classes.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ClassMix {
    pub critical: f64,
    pub normal: f64,
    pub best_effort: f64,
}

impl Default for ClassMix {
    fn default() -> Self {
        Self {
            critical: 0.0,
            normal: 0.3,
            best_effort: 0.7,
        }
    }
}

impl ClassMix {
    pub fn weights(&self) -> [f64; 3] {
        [self.critical, self.normal, self.best_effort]
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TrafficConfig {
    pub uplink: UplinkTrafficConfig,
    pub downlink: DownlinkTrafficConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UplinkTrafficConfig {
    pub pattern: UplinkPattern,
    pub interval_s: f64,
    pub jitter_ratio: f64,
    pub min_interval_s: f64,
    pub payload_bytes: usize,
    pub class_mix: ClassMix,
}

impl Default for UplinkTrafficConfig {
    fn default() -> Self {
        Self {
            pattern: UplinkPattern::Periodic,
            interval_s: 600.0,
            jitter_ratio: 0.1,
            min_interval_s: 1.0,
            payload_bytes: 20,
            class_mix: ClassMix::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownlinkTrafficConfig {
    pub enabled: bool,
    pub pattern: DownlinkPattern,
    pub rate_per_device_per_hour: f64,
    pub burst_probability: f64,
    pub burst_mean_gap_s: f64,
    pub min_interval_s: f64,
    pub command_types: u8,
    pub class_mix: ClassMix,
}

impl Default for DownlinkTrafficConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pattern: DownlinkPattern::Uniform,
            rate_per_device_per_hour: 2.0,
            burst_probability: 0.1,
            burst_mean_gap_s: 1.0,
            min_interval_s: 0.1,
            command_types: 8,
            class_mix: ClassMix {
                critical: 0.05,
                normal: 0.25,
                best_effort: 0.70,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ClassTarget {
    pub deadline_s: f64,
    pub probability: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QosConfig {
    pub critical: ClassTarget,
    pub normal: ClassTarget,
    pub best_effort: ClassTarget,
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            critical: ClassTarget {
                deadline_s: 600.0,
                probability: 0.99,
            },
            normal: ClassTarget {
                deadline_s: 3600.0,
                probability: 0.90,
            },
            best_effort: ClassTarget {
                deadline_s: 86_400.0,
                probability: 0.50,
            },
        }
    }
}

impl QosConfig {
    pub fn target(&self, class: QosClass) -> QosTarget {
        let t = match class {
            QosClass::Critical => self.critical,
            QosClass::Normal => self.normal,
            QosClass::BestEffort => self.best_effort,
        };
        QosTarget {
            deadline: seconds(t.deadline_s),
            probability: t.probability,
        }
    }
}

/// Power draw of the device radio in each state.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub tx_power_mw: f64,
    pub rx_power_mw: f64,
    pub handshake_retry_s: f64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            tx_power_mw: 80.0,
            rx_power_mw: 12.0,
            handshake_retry_s: 30.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NovelConfig {
    pub ack_window: usize,
    pub max_aggregation_delay_s: f64,
    pub token_bytes: usize,
    pub token_lifetime_s: f64,
    pub command_budget: usize,
    pub initial_delivery_probability: f64,
    /// Weight of the newest bitmap in the delivery-probability estimate.
    pub estimate_weight: f64,
    pub max_attempts: u8,
    pub outstanding_capacity: usize,
}

impl Default for NovelConfig {
    fn default() -> Self {
        Self {
            ack_window: 16,
            max_aggregation_delay_s: 4.0 * 3600.0,
            token_bytes: 12,
            token_lifetime_s: 12.0 * 3600.0,
            command_budget: 3,
            initial_delivery_probability: 0.9,
            estimate_weight: 0.1,
            max_attempts: 8,
            outstanding_capacity: 32,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSnConfig {
    pub retry_interval_s: f64,
    pub max_retries: u8,
    /// Zero disables keep-alive pings.
    pub keep_alive_s: f64,
    pub dedup_cache: usize,
    pub topic_id: u16,
    pub client_id_bytes: usize,
}

impl Default for MqttSnConfig {
    fn default() -> Self {
        Self {
            retry_interval_s: 10.0,
            max_retries: 3,
            keep_alive_s: 1200.0,
            dedup_cache: 8,
            topic_id: 1,
            client_id_bytes: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoapConfig {
    pub ack_timeout_s: f64,
    pub ack_random_factor: f64,
    pub max_retransmit: u8,
    pub confirmable_ratio: f64,
    pub exchange_lifetime_s: f64,
    pub token_bytes: usize,
}

impl Default for CoapConfig {
    fn default() -> Self {
        Self {
            ack_timeout_s: 2.0,
            ack_random_factor: 1.5,
            max_retransmit: 4,
            confirmable_ratio: 0.5,
            exchange_lifetime_s: 247.0,
            token_bytes: 4,
        }
    }
}

impl RunConfig {
    /// Load a configuration from a `.json` or `.toml` file.
    ///
    /// The result is validated before it is returned.
    pub fn load(path: &Path) -> Result<Self, SimError> {
        let content = std::fs::read_to_string(path)?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str::<RunConfig>(&content)?,
            _ => toml::from_str::<RunConfig>(&content).map_err(|e| SimError::ConfigInvalid(format!("{}: {e}", path.display())))?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn duration(&self) -> Duration {
        seconds(self.duration_s)
    }

    pub fn warmup(&self) -> Duration {
        seconds(self.warmup_s)
    }

    /// Check every parameter against its valid range.
    pub fn validate(&self) -> Result<(), SimError> {
        let invalid = |msg: String| Err(SimError::ConfigInvalid(msg));

        if let Some((name, value)) = self.duration_fields().into_iter().find(|(_, v)| !v.is_finite()) {
            return invalid(format!("{name} must be finite (got {value})"));
        }
        if !(self.duration_s > 0.0) {
            return invalid(format!("duration_s must be positive (got {})", self.duration_s));
        }
        if !(self.warmup_s >= 0.0 && self.warmup_s < self.duration_s) {
            return invalid(format!("warmup_s must be in [0, duration_s) (got {})", self.warmup_s));
        }

        let net = &self.network;
        if net.device_count == 0 || net.device_count > MAX_DEVICES {
            return invalid(format!("network.device_count must be between 1 and {MAX_DEVICES} (got {})", net.device_count));
        }
        if !(net.cell_radius_m > 0.0) || !(net.min_distance_m >= 0.0) || net.min_distance_m >= net.cell_radius_m {
            return invalid(format!(
                "network.cell_radius_m ({}) must exceed network.min_distance_m ({}) and both must be non-negative",
                net.cell_radius_m, net.min_distance_m
            ));
        }
        if !(net.path_loss.path_loss_exponent > 0.0) || net.path_loss.shadowing_sigma < 0.0 {
            return invalid("network.path_loss: exponent must be positive and sigma non-negative".to_string());
        }
        if !(net.per_steepness_per_db > 0.0) {
            return invalid("network.per_steepness_per_db must be positive".to_string());
        }
        self.validate_network()?;

        let up = &self.traffic.uplink;
        if !(up.interval_s > 0.0) || !(up.min_interval_s > 0.0) {
            return invalid("traffic.uplink: interval_s and min_interval_s must be positive".to_string());
        }
        if !(0.0..1.0).contains(&up.jitter_ratio) {
            return invalid(format!("traffic.uplink.jitter_ratio must be in [0, 1) (got {})", up.jitter_ratio));
        }
        if up.payload_bytes == 0 {
            return invalid("traffic.uplink.payload_bytes must be at least 1".to_string());
        }
        check_mix("traffic.uplink.class_mix", &up.class_mix)?;

        let down = &self.traffic.downlink;
        if down.enabled {
            if !(down.rate_per_device_per_hour > 0.0) {
                return invalid("traffic.downlink.rate_per_device_per_hour must be positive".to_string());
            }
            if !(0.0..=1.0).contains(&down.burst_probability) || !(down.burst_mean_gap_s > 0.0) || !(down.min_interval_s > 0.0) {
                return invalid("traffic.downlink: burst and interval parameters out of range".to_string());
            }
            if down.command_types == 0 {
                return invalid("traffic.downlink.command_types must be at least 1".to_string());
            }
            check_mix("traffic.downlink.class_mix", &down.class_mix)?;
        }

        for (name, target) in [("critical", self.qos.critical), ("normal", self.qos.normal), ("best_effort", self.qos.best_effort)] {
            if !(target.deadline_s > 0.0) || !(target.probability > 0.0 && target.probability < 1.0) {
                return invalid(format!("qos.{name}: deadline_s must be positive and probability in (0, 1)"));
            }
        }

        if self.device.tx_power_mw < 0.0 || self.device.rx_power_mw < 0.0 || !(self.device.handshake_retry_s > 0.0) {
            return invalid("device: power draw must be non-negative and handshake_retry_s positive".to_string());
        }

        let novel = &self.novel;
        if novel.ack_window == 0 || novel.ack_window > MAX_ACK_WINDOW {
            return invalid(format!("novel.ack_window must be between 1 and {MAX_ACK_WINDOW} (got {})", novel.ack_window));
        }
        if novel.token_bytes == 0 || novel.token_bytes > 32 {
            return invalid(format!("novel.token_bytes must be between 1 and 32 (got {})", novel.token_bytes));
        }
        if !(novel.token_lifetime_s > 0.0) || !(novel.max_aggregation_delay_s > 0.0) {
            return invalid("novel: token_lifetime_s and max_aggregation_delay_s must be positive".to_string());
        }
        if novel.command_budget == 0 || novel.command_budget > MAX_COMMAND_BUDGET {
            return invalid(format!(
                "novel.command_budget must be between 1 and {MAX_COMMAND_BUDGET} (got {})",
                novel.command_budget
            ));
        }
        if !(novel.initial_delivery_probability > 0.0 && novel.initial_delivery_probability < 1.0) {
            return invalid("novel.initial_delivery_probability must be in (0, 1)".to_string());
        }
        if !(novel.estimate_weight > 0.0 && novel.estimate_weight <= 1.0) {
            return invalid("novel.estimate_weight must be in (0, 1]".to_string());
        }
        if novel.max_attempts == 0 {
            return invalid("novel.max_attempts must be at least 1".to_string());
        }
        if novel.outstanding_capacity < novel.ack_window {
            return invalid(format!(
                "novel.outstanding_capacity ({}) must be at least novel.ack_window ({})",
                novel.outstanding_capacity, novel.ack_window
            ));
        }

        let mqtt = &self.mqtt_sn;
        if !(mqtt.retry_interval_s > 0.0) || mqtt.keep_alive_s < 0.0 || mqtt.dedup_cache == 0 {
            return invalid("mqtt_sn: retry_interval_s must be positive, keep_alive_s non-negative, dedup_cache at least 1".to_string());
        }

        let coap = &self.coap;
        if !(coap.ack_timeout_s > 0.0) || !(coap.ack_random_factor >= 1.0) || !(coap.exchange_lifetime_s > 0.0) {
            return invalid("coap: ack_timeout_s and exchange_lifetime_s must be positive, ack_random_factor at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&coap.confirmable_ratio) || coap.token_bytes > 8 {
            return invalid("coap: confirmable_ratio must be in [0, 1] and token_bytes at most 8".to_string());
        }

        let frame = self.max_uplink_frame_bytes();
        let limit = self.max_payload_limit();
        if frame > limit {
            return invalid(format!(
                "uplink frame of {frame} bytes ({:?} header + {} payload) exceeds the {limit}-byte limit of {:?}",
                self.protocol, up.payload_bytes, net.kind
            ));
        }
        Ok(())
    }

    /// Every duration-valued field, by its configuration key.
    fn duration_fields(&self) -> Vec<(&'static str, f64)> {
        let net = &self.network;
        let traffic = &self.traffic;
        let mut seconds = vec![
            ("duration_s", self.duration_s),
            ("warmup_s", self.warmup_s),
            ("network.lorawan.duty_cycle_window_s", net.lorawan.duty_cycle_window_s),
            ("network.lorawan.rx_delay_s", net.lorawan.rx_delay_s),
            ("network.lorawan.rx_window_s", net.lorawan.rx_window_s),
            ("network.nbiot.rx_delay_s", net.nbiot.rx_delay_s),
            ("network.nbiot.rx_window_s", net.nbiot.rx_window_s),
            ("network.sigfox.duty_cycle_window_s", net.sigfox.duty_cycle_window_s),
            ("network.sigfox.rx_delay_s", net.sigfox.rx_delay_s),
            ("network.sigfox.rx_window_s", net.sigfox.rx_window_s),
            ("traffic.uplink.interval_s", traffic.uplink.interval_s),
            ("traffic.uplink.min_interval_s", traffic.uplink.min_interval_s),
            ("traffic.downlink.burst_mean_gap_s", traffic.downlink.burst_mean_gap_s),
            ("traffic.downlink.min_interval_s", traffic.downlink.min_interval_s),
            ("device.handshake_retry_s", self.device.handshake_retry_s),
            ("novel.max_aggregation_delay_s", self.novel.max_aggregation_delay_s),
            ("novel.token_lifetime_s", self.novel.token_lifetime_s),
            ("mqtt_sn.retry_interval_s", self.mqtt_sn.retry_interval_s),
            ("mqtt_sn.keep_alive_s", self.mqtt_sn.keep_alive_s),
            ("coap.ack_timeout_s", self.coap.ack_timeout_s),
            ("coap.exchange_lifetime_s", self.coap.exchange_lifetime_s),
        ];
        for (name, target) in [
            ("qos.critical.deadline_s", self.qos.critical),
            ("qos.normal.deadline_s", self.qos.normal),
            ("qos.best_effort.deadline_s", self.qos.best_effort),
        ] {
            seconds.push((name, target.deadline_s));
        }
        seconds
    }

    fn validate_network(&self) -> Result<(), SimError> {
        let invalid = |msg: String| Err(SimError::ConfigInvalid(msg));
        match self.network.kind {
            NetworkKind::Lorawan => {
                let l = &self.network.lorawan;
                if l.bandwidth_hz == 0 || !(1..=4).contains(&l.coding_rate) || l.channels == 0 {
                    return invalid("network.lorawan: bandwidth, coding_rate (1..=4) and channels must be set".to_string());
                }
                if l.spreading_factor_weights.iter().any(|w| *w < 0.0) || l.spreading_factor_weights.iter().sum::<f64>() <= 0.0 {
                    return invalid("network.lorawan.spreading_factor_weights must be non-negative with a positive sum".to_string());
                }
                if l.residual_per.iter().any(|p| !(0.0..1.0).contains(p)) {
                    return invalid("network.lorawan.residual_per entries must be in [0, 1)".to_string());
                }
                check_duty(l.duty_cycle, l.gateway_duty_cycle, l.duty_cycle_window_s, "lorawan")?;
                check_rx(l.rx_delay_s, l.rx_window_s, "lorawan")
            }
            NetworkKind::Nbiot => {
                let n = &self.network.nbiot;
                if !(n.uplink_rate_bps > 0.0) || !(n.downlink_rate_bps > 0.0) || !(n.bandwidth_hz > 0.0) {
                    return invalid("network.nbiot: rates and bandwidth must be positive".to_string());
                }
                if !(0.0..1.0).contains(&n.residual_per) {
                    return invalid("network.nbiot.residual_per must be in [0, 1)".to_string());
                }
                check_rx(n.rx_delay_s, n.rx_window_s, "nbiot")
            }
            NetworkKind::Sigfox => {
                let s = &self.network.sigfox;
                if !(s.uplink_rate_bps > 0.0) || !(s.downlink_rate_bps > 0.0) || s.channels == 0 || s.repetitions == 0 {
                    return invalid("network.sigfox: rates, channels and repetitions must be positive".to_string());
                }
                if !(0.0..1.0).contains(&s.residual_per) {
                    return invalid("network.sigfox.residual_per must be in [0, 1)".to_string());
                }
                check_duty(s.duty_cycle, s.gateway_duty_cycle, s.duty_cycle_window_s, "sigfox")?;
                check_rx(s.rx_delay_s, s.rx_window_s, "sigfox")
            }
        }
    }

    /// Largest uplink frame the selected protocol can produce.
    pub fn max_uplink_frame_bytes(&self) -> usize {
        let header = match self.protocol {
            // header with epoch echo
            ProtocolKind::Novel => 6,
            // PUBACK for a received command + PUBLISH, whose length field
            // grows to three bytes past 255
            ProtocolKind::MqttSn => 7 + if 6 + self.traffic.uplink.payload_bytes < 255 { 7 } else { 9 },
            // empty ACK for a received command + request
            ProtocolKind::Coap => 4 + 4 + self.coap.token_bytes + 5 + 1,
        };
        header + self.traffic.uplink.payload_bytes
    }

    fn max_payload_limit(&self) -> usize {
        match self.network.kind {
            NetworkKind::Lorawan => {
                let l = &self.network.lorawan;
                l.spreading_factor_weights
                    .iter()
                    .zip(l.max_payload_bytes.iter())
                    .filter(|(w, _)| **w > 0.0)
                    .map(|(_, max)| *max)
                    .min()
                    .unwrap_or(0)
            }
            NetworkKind::Nbiot => self.network.nbiot.max_payload_bytes,
            NetworkKind::Sigfox => self.network.sigfox.max_payload_bytes,
        }
    }

    /// Lowest spreading factor index 0 maps to.
    pub fn spreading_factor(index: usize) -> u8 {
        MIN_SPREADING_FACTOR + index as u8
    }
}

fn check_mix(name: &str, mix: &ClassMix) -> Result<(), SimError> {
    let w = mix.weights();
    if w.iter().any(|v| *v < 0.0) || w.iter().sum::<f64>() <= 0.0 {
        return Err(SimError::ConfigInvalid(format!("{name} weights must be non-negative with a positive sum")));
    }
    Ok(())
}

fn check_duty(device: f64, gateway: f64, window_s: f64, name: &str) -> Result<(), SimError> {
    if !(device > 0.0 && device <= 1.0) || !(gateway > 0.0 && gateway <= 1.0) || !(window_s > 0.0) {
        return Err(SimError::ConfigInvalid(format!(
            "network.{name}: duty cycles must be in (0, 1] and the window positive"
        )));
    }
    Ok(())
}

fn check_rx(delay_s: f64, window_s: f64, name: &str) -> Result<(), SimError> {
    if delay_s < 0.0 || !(window_s > 0.0) {
        return Err(SimError::ConfigInvalid(format!(
            "network.{name}: rx_delay_s must be non-negative and rx_window_s positive"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_the_reference_scenario() {
        let config = RunConfig::default();
        config.validate().unwrap();
        assert_eq!(config.network.device_count, 100);
        assert_eq!(config.traffic.uplink.interval_s, 600.0);
        assert_eq!(config.novel.ack_window, 16);
        assert_eq!(config.duration(), Duration::from_secs(86_400));
        assert_eq!(config.warmup(), Duration::from_secs(7_200));
    }

    #[test]
    fn toml_sections_override_defaults() {
        let text = r#"
            seed = 7
            protocol = "coap"

            [network]
            kind = "nbiot"
            device_count = 10

            [novel]
            ack_window = 8

            [traffic.uplink]
            pattern = "poisson"
            interval_s = 300.0
        "#;
        let config: RunConfig = toml::from_str(text).unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.protocol, ProtocolKind::Coap);
        assert_eq!(config.network.kind, NetworkKind::Nbiot);
        assert_eq!(config.network.device_count, 10);
        assert_eq!(config.novel.ack_window, 8);
        assert_eq!(config.traffic.uplink.pattern, UplinkPattern::Poisson);
        assert_eq!(config.traffic.uplink.payload_bytes, 20);
        config.validate().unwrap();
    }

    #[test]
    fn json_is_accepted_too() {
        let config: RunConfig = serde_json::from_str(r#"{"protocol": "mqtt_sn", "network": {"device_count": 3}}"#).unwrap();
        assert_eq!(config.protocol, ProtocolKind::MqttSn);
        assert_eq!(config.network.device_count, 3);
    }

    #[test]
    fn out_of_range_values_are_config_invalid() {
        let mut config = RunConfig::default();
        config.novel.ack_window = 65;
        assert!(matches!(config.validate(), Err(SimError::ConfigInvalid(_))));

        let mut config = RunConfig::default();
        config.warmup_s = config.duration_s;
        assert!(matches!(config.validate(), Err(SimError::ConfigInvalid(_))));

        let mut config = RunConfig::default();
        config.network.device_count = 0;
        assert!(matches!(config.validate(), Err(SimError::ConfigInvalid(_))));

        let mut config = RunConfig::default();
        config.qos.normal.probability = 1.0;
        assert!(matches!(config.validate(), Err(SimError::ConfigInvalid(_))));
    }

    #[test]
    fn infinite_durations_are_config_invalid() {
        let config: RunConfig = toml::from_str("duration_s = inf").unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, SimError::ConfigInvalid(_)));
        assert!(err.to_string().contains("duration_s"));

        let mut config = RunConfig::default();
        config.traffic.uplink.interval_s = f64::INFINITY;
        assert!(matches!(config.validate(), Err(SimError::ConfigInvalid(_))));

        let mut config = RunConfig::default();
        config.warmup_s = f64::NAN;
        assert!(matches!(config.validate(), Err(SimError::ConfigInvalid(_))));
    }

    #[test]
    fn long_mqtt_sn_publish_counts_its_length_field() {
        let mut config = RunConfig::default();
        config.protocol = ProtocolKind::MqttSn;
        assert_eq!(config.max_uplink_frame_bytes(), 7 + 7 + 20);
        config.network.kind = NetworkKind::Nbiot;
        config.traffic.uplink.payload_bytes = 1000;
        assert_eq!(config.max_uplink_frame_bytes(), 7 + 9 + 1000);
        config.validate().unwrap();
    }

    #[test]
    fn command_budget_fits_one_byte() {
        let mut config = RunConfig::default();
        config.novel.command_budget = 256;
        assert!(matches!(config.validate(), Err(SimError::ConfigInvalid(_))));
        config.novel.command_budget = 255;
        config.validate().unwrap();
    }

    #[test]
    fn oversized_frames_are_rejected_for_sigfox() {
        let mut config = RunConfig::default();
        config.network.kind = NetworkKind::Sigfox;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds"));

        config.traffic.uplink.payload_bytes = 6;
        config.validate().unwrap();
    }

    #[test]
    fn qos_targets_come_from_class_table() {
        let qos = QosConfig::default();
        let critical = qos.target(QosClass::Critical);
        assert_eq!(critical.deadline, Duration::from_secs(600));
        assert_eq!(critical.probability, 0.99);
        assert_eq!(qos.target(QosClass::BestEffort).deadline, Duration::from_secs(86_400));
    }

    #[test]
    fn load_reads_toml_from_disk() {
        let dir = std::env::temp_dir().join(format!("lpwan-sim-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("run.toml");
        std::fs::write(&path, "seed = 99\n[network]\ndevice_count = 5\n").unwrap();
        let config = RunConfig::load(&path).unwrap();
        assert_eq!(config.seed, 99);
        assert_eq!(config.network.device_count, 5);
        std::fs::remove_dir_all(&dir).ok();
    }
}
