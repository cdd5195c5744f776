//! QoS-D reliability engine.
//!
//! Turns a `(deadline, probability)` target into a number of attempts and
//! their spacing, given the device's running estimate of the per-attempt
//! delivery probability.

use std::time::Duration;

use crate::simulation::types::QosTarget;

const TOLERANCE: f64 = 1e-12;

/// Smallest `k` with `1 − (1 − p)^k ≥ target`, capped at `cap`.
pub fn min_attempts(p: f64, target: f64, cap: u8) -> u8 {
    let cap = cap.max(1);
    if p >= 1.0 {
        return 1;
    }
    if p <= 0.0 {
        return cap;
    }
    let miss = 1.0 - p;
    let mut residual = 1.0;
    for k in 1..=cap {
        residual *= miss;
        if 1.0 - residual + TOLERANCE >= target {
            return k;
        }
    }
    cap
}

/// How many attempts a message gets and how far apart they are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptPlan {
    pub attempts: u8,
    pub spacing: Duration,
}

pub fn plan(target: QosTarget, p: f64, cap: u8) -> AttemptPlan {
    let attempts = min_attempts(p, target.probability, cap);
    AttemptPlan {
        attempts,
        spacing: target.deadline / attempts as u32,
    }
}

/// Exponentially weighted per-attempt delivery probability, fed by bitmap ACKs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeliveryEstimate {
    value: f64,
    weight: f64,
}

impl DeliveryEstimate {
    pub fn new(initial: f64, weight: f64) -> Self {
        Self {
            value: initial.clamp(0.0, 1.0),
            weight: weight.clamp(0.0, 1.0),
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// Fold in one bitmap: `delivered` of `observed` attempts got through.
    pub fn observe(&mut self, delivered: u32, observed: u32) {
        if observed == 0 {
            return;
        }
        let sample = delivered as f64 / observed as f64;
        self.value += self.weight * (sample - self.value);
    }
}
