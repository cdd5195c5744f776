//! Discrete-event simulation core.
//!
//! This module provides everything that moves during a run:
//! - An ordered event queue driving simulated time
//! - The radio channel (airtime, duty cycle, collisions, packet errors)
//! - Device and gateway protocol state machines
//! - Uplink and command traffic generators
//!
//! ## Module Organization
//!
//! - `types`: Identities, QoS classes, events and commands
//! - `scheduler`: Time-ordered event queue
//! - `signal_calculations`: Path loss, airtime and error-rate formulas
//! - `duty_cycle`: Rolling-window airtime ledger
//! - `channel`: Shared medium model built on the two above
//! - `ack_window`: Gateway-side windowed bitmap acknowledgment
//! - `device`: Per-device state machine
//! - `gateway`: Sessions, acknowledgments and command queues
//! - `traffic`: Uplink and command arrival processes
//! - `engine`: Event handlers tying it all together
//!
//! ## Public API
//!
//! The main entry point is [`run`], which executes one configured run and
//! returns its [`RunReport`](crate::metrics::RunReport). [`run_batch`] runs
//! several seeds in parallel.

pub mod ack_window;
pub mod channel;
pub mod device;
pub mod duty_cycle;
pub mod engine;
pub mod gateway;
pub mod scheduler;
pub mod signal_calculations;
pub mod traffic;
pub mod types;

pub use engine::{run, run_batch};
pub use types::{Command, DeviceId, Direction, Event, NetworkKind, QosClass};
