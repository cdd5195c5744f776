//! Link budget and airtime formulas.
//!
//! Everything here is a pure function of its inputs (plus the caller's rng
//! for shadowing). Formulas work in `f64` seconds, dB and meters;
//! [`seconds`] converts back to `Duration` at the API edge.

use std::time::Duration;

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::Deserialize;

/// Log-distance propagation model of the cell.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PathLossParameters {
    /// Exponent `n`: 2 in free space, around 2.7 to 3.5 in urban cells.
    pub path_loss_exponent: f64,

    /// Shadowing standard deviation in dB, drawn once per device; 0 turns it off.
    pub shadowing_sigma: f64,

    /// Loss at 1 m in dB.
    pub path_loss_at_reference_distance: f64,
}

impl Default for PathLossParameters {
    fn default() -> Self {
        Self {
            path_loss_exponent: 2.7,
            shadowing_sigma: 0.0,
            path_loss_at_reference_distance: 40.0,
        }
    }
}

/// LoRa modulation parameters for one link.
#[derive(Debug, Clone, PartialEq)]
pub struct LoraParameters {
    pub bandwidth: u32,
    pub spreading_factor: u8,
    /// 1..4 for coding rates 4/5..4/8.
    pub coding_rate: u32,
    pub preamble_symbols: f64,
    pub crc_enabled: bool,
    /// LDRO (the `DE` bit), required once a symbol lasts 16 ms or more.
    pub low_data_rate_optimization: bool,
}

impl LoraParameters {
    /// Parameters for `spreading_factor` with LDRO switched on where the
    /// symbol time reaches 16 ms (SF11/SF12 at 125 kHz).
    pub fn for_spreading_factor(spreading_factor: u8, bandwidth: u32, coding_rate: u32, preamble_symbols: f64, crc_enabled: bool) -> Self {
        let symbol_time = 2.0_f64.powi(spreading_factor as i32) / bandwidth as f64;
        Self {
            bandwidth,
            spreading_factor,
            coding_rate,
            preamble_symbols,
            crc_enabled,
            low_data_rate_optimization: symbol_time >= 0.016,
        }
    }

    pub fn symbol_time(&self) -> f64 {
        2.0_f64.powi(self.spreading_factor as i32) / self.bandwidth as f64
    }
}

/// Path loss in dB over `distance` meters.
///
/// ```text
/// PL(d) = PL(1 m) + 10·n·log10(d) + X
/// ```
///
/// `X` is a zero-mean normal sample with deviation `shadowing_sigma`, taken
/// from `rng`. Inside 1 m the reference loss applies unchanged.
pub fn calculate_path_loss<R: Rng + ?Sized>(distance: f64, params: &PathLossParameters, rng: &mut R) -> f64 {
    let reference = params.path_loss_at_reference_distance;
    if distance < 1.0 {
        return reference;
    }
    let spread = params.path_loss_exponent * 10.0 * distance.log10();
    let shadowing = if params.shadowing_sigma > 0.0 {
        Normal::new(0.0_f64, params.shadowing_sigma).map_or(0.0, |normal| normal.sample(rng))
    } else {
        0.0
    };
    reference + spread + shadowing
}

/// Demodulation SNR floor for a LoRa spreading factor.
///
/// 2.5 dB per step from SF5 (-2.5 dB) to SF12 (-20 dB); anything outside
/// that range gets the SF12 floor.
pub fn calculate_snr_limit(spreading_factor: u8) -> f64 {
    match spreading_factor {
        5..=12 => -2.5 * (spreading_factor as f64 - 4.0),
        _ => -20.0,
    }
}

/// LoRa time on air in seconds for `payload_size` bytes.
pub fn calculate_lora_air_time(lora_parameters: &LoraParameters, payload_size: usize) -> f64 {
    let p = lora_parameters;
    let t_sym = p.symbol_time();
    let sf = p.spreading_factor as f64;
    let crc_bits = if p.crc_enabled { 16.0 } else { 0.0 };
    let de = if p.low_data_rate_optimization { 2.0 } else { 0.0 };

    // explicit header: 8 + max(ceil((8PL - 4SF + 28 + CRC) / 4(SF - 2DE)) * (CR + 4), 0)
    let bits = 8.0 * payload_size as f64 - 4.0 * sf + 28.0 + crc_bits;
    let blocks = (bits / (4.0 * (sf - de))).ceil();
    let payload_symbols = 8.0 + (blocks * (p.coding_rate as f64 + 4.0)).max(0.0);

    (p.preamble_symbols + 4.25 + payload_symbols) * t_sym
}

/// Airtime of a frame on a link with a fixed bit rate, in seconds.
///
/// ```text
/// T = repetitions × (overhead + payload) × 8 / rate
/// ```
pub fn calculate_rate_air_time(rate_bps: f64, overhead_bytes: usize, payload_size: usize, repetitions: u32) -> f64 {
    if rate_bps <= 0.0 {
        return 0.0;
    }
    repetitions.max(1) as f64 * ((overhead_bytes + payload_size) as f64 * 8.0) / rate_bps
}

/// Probability that a frame received at `snr_db` fails to demodulate.
///
/// A logistic curve centred on the demodulation limit: 0.5 at the limit,
/// falling off by `steepness_per_db` per dB of margin. A residual floor
/// (interference, hardware) is combined as an independent failure source:
///
/// ```text
/// PER = 1 − (1 − floor) × (1 − 1 / (1 + e^(k × (SNR − limit))))
/// ```
pub fn packet_error_rate(snr_db: f64, snr_limit_db: f64, steepness_per_db: f64, residual_floor: f64) -> f64 {
    let margin = snr_db - snr_limit_db;
    let curve = 1.0 / (1.0 + (steepness_per_db * margin).exp());
    let per = 1.0 - (1.0 - residual_floor.clamp(0.0, 1.0)) * (1.0 - curve);
    per.clamp(0.0, 1.0)
}

/// Thermal noise floor for a receiver bandwidth: `-174 dBm/Hz + 10·log10(BW) + NF`.
pub fn thermal_noise_floor(bandwidth_hz: f64, noise_figure_db: f64) -> f64 {
    -174.0 + 10.0 * bandwidth_hz.log10() + noise_figure_db
}

pub fn seconds(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn eu868(sf: u8) -> LoraParameters {
        LoraParameters::for_spreading_factor(sf, 125_000, 1, 8.0, true)
    }

    #[test]
    fn airtime_grows_with_payload_and_spreading_factor() {
        for sf in 7..=12 {
            let short = calculate_lora_air_time(&eu868(sf), 10);
            assert!(calculate_lora_air_time(&eu868(sf), 40) > short);
            if sf < 12 {
                assert!(calculate_lora_air_time(&eu868(sf + 1), 10) > short);
            }
        }
    }

    #[test]
    fn sf7_airtime_matches_reference_calculator() {
        // 20-byte payload, SF7/125 kHz, CR 4/5, CRC on, 8 preamble symbols: 56.58 ms
        let t = calculate_lora_air_time(&eu868(7), 20);
        assert!((t - 0.05658).abs() < 0.0005, "got {t}");
    }

    #[test]
    fn ldro_follows_symbol_time() {
        assert!(!LoraParameters::for_spreading_factor(10, 125_000, 1, 8.0, true).low_data_rate_optimization);
        assert!(LoraParameters::for_spreading_factor(11, 125_000, 1, 8.0, true).low_data_rate_optimization);
        assert!(LoraParameters::for_spreading_factor(12, 125_000, 1, 8.0, true).low_data_rate_optimization);
    }

    #[test]
    fn snr_limit_drops_2_5_db_per_spreading_factor() {
        assert_eq!(calculate_snr_limit(7), -7.5);
        assert_eq!(calculate_snr_limit(12), -20.0);
        assert_eq!(calculate_snr_limit(13), -20.0);
        for sf in 5..12 {
            assert!((calculate_snr_limit(sf) - calculate_snr_limit(sf + 1) - 2.5).abs() < 1e-9);
        }
    }

    #[test]
    fn rate_airtime_counts_overhead_and_repetitions() {
        // Sigfox: 12-byte payload, 14 bytes of framing at 100 bps, 3 repetitions
        let t = calculate_rate_air_time(100.0, 14, 12, 3);
        assert!((t - 6.24).abs() < 1e-9);
        // NB-IoT uplink, 40 bytes at 62.5 kbps
        let t = calculate_rate_air_time(62_500.0, 0, 40, 1);
        assert!((t - 0.00512).abs() < 1e-9);
    }

    #[test]
    fn per_is_half_at_limit_and_falls_with_margin() {
        let at_limit = packet_error_rate(-7.5, -7.5, 1.5, 0.0);
        assert!((at_limit - 0.5).abs() < 1e-9);
        let strong = packet_error_rate(5.0, -7.5, 1.5, 0.0);
        assert!(strong < 1e-6);
        let weak = packet_error_rate(-12.0, -7.5, 1.5, 0.0);
        assert!(weak > 0.99);
    }

    #[test]
    fn per_floor_dominates_on_strong_links() {
        let per = packet_error_rate(10.0, -7.5, 1.5, 0.05);
        assert!((per - 0.05).abs() < 1e-6);
    }

    #[test]
    fn path_loss_without_shadowing_is_deterministic() {
        let params = PathLossParameters {
            path_loss_exponent: 2.0,
            shadowing_sigma: 0.0,
            path_loss_at_reference_distance: 40.0,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let pl = calculate_path_loss(1000.0, &params, &mut rng);
        assert!((pl - 100.0).abs() < 1e-9);
        assert_eq!(calculate_path_loss(0.5, &params, &mut rng), 40.0);
    }

    #[test]
    fn path_loss_shadowing_is_reproducible_per_seed() {
        let params = PathLossParameters {
            path_loss_exponent: 2.7,
            shadowing_sigma: 4.0,
            path_loss_at_reference_distance: 40.0,
        };
        let a = calculate_path_loss(500.0, &params, &mut ChaCha8Rng::seed_from_u64(9));
        let b = calculate_path_loss(500.0, &params, &mut ChaCha8Rng::seed_from_u64(9));
        assert_eq!(a, b);
    }

    #[test]
    fn noise_floor_for_lora_bandwidth() {
        let nf = thermal_noise_floor(125_000.0, 6.0);
        assert!((nf - (-117.03)).abs() < 0.01);
    }
}
