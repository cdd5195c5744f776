//! Discrete-event simulator comparing uplink-heavy IoT protocols over LPWAN
//! links (LoRaWAN, NB-IoT, Sigfox).
//!
//! A run places devices in a cell, generates uplink and command traffic and
//! measures how a protocol delivers it: the aggregated-acknowledgment design
//! in [`protocols::novel`] against the MQTT-SN and CoAP baselines.

pub mod config;
pub mod error;
pub mod metrics;
pub mod protocols;
pub mod simulation;

pub use config::RunConfig;
pub use error::SimError;
pub use metrics::{RunReport, RunSummary};
pub use simulation::{run, run_batch};
