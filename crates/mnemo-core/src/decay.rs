//! Decay arithmetic.
//!
//! One cycle removes
//!
//! ```text
//! base(type) × trauma × phase(type, phase) × age(curve) × entropy
//! ```
//!
//! from a fragment's integrity, never more than it has left.
//!
//! - trauma  = 1 − (traumaLevel / 10) × modifier(type); heavier memories fade slower
//! - entropy = elapsed since the previous cycle / nominal interval
//! - age     = one of the [`DecayPolicy`] curves

use serde::{Deserialize, Serialize};

use crate::constants::{DAY_MS, FIBONACCI, FIBONACCI_MIDPOINT, MAX_TRAUMA};
use crate::fragment::Fragment;
use crate::phase::Phase;

/// Age-factor curve selected by configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecayTiming {
    #[default]
    Fibonacci,
    Linear,
    Exponential,
}

impl DecayTiming {
    pub fn policy(self) -> Box<dyn DecayPolicy> {
        match self {
            DecayTiming::Fibonacci => Box::new(FibonacciCurve),
            DecayTiming::Linear => Box::new(LinearCurve),
            DecayTiming::Exponential => Box::new(ExponentialCurve),
        }
    }
}

/// How age scales decay. Hosts may supply their own at construction time.
pub trait DecayPolicy {
    fn name(&self) -> &str;
    fn age_factor(&self, age_ms: u64, max_lifetime_ms: u64) -> f64;
}

/// Accelerates through the first week, then plateaus at the table's end.
#[derive(Debug, Clone, Copy, Default)]
pub struct FibonacciCurve;

impl DecayPolicy for FibonacciCurve {
    fn name(&self) -> &str {
        "fibonacci"
    }

    fn age_factor(&self, age_ms: u64, _max_lifetime_ms: u64) -> f64 {
        let index = ((age_ms / DAY_MS) as usize).min(FIBONACCI.len() - 1);
        FIBONACCI[index] / FIBONACCI[FIBONACCI_MIDPOINT]
    }
}

/// `2^(age / maxLifetime) − 0.9`
#[derive(Debug, Clone, Copy, Default)]
pub struct ExponentialCurve;

impl DecayPolicy for ExponentialCurve {
    fn name(&self) -> &str {
        "exponential"
    }

    fn age_factor(&self, age_ms: u64, max_lifetime_ms: u64) -> f64 {
        2f64.powf(lifetime_ratio(age_ms, max_lifetime_ms)) - 0.9
    }
}

/// `0.5 + age / maxLifetime`
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearCurve;

impl DecayPolicy for LinearCurve {
    fn name(&self) -> &str {
        "linear"
    }

    fn age_factor(&self, age_ms: u64, max_lifetime_ms: u64) -> f64 {
        0.5 + lifetime_ratio(age_ms, max_lifetime_ms)
    }
}

fn lifetime_ratio(age_ms: u64, max_lifetime_ms: u64) -> f64 {
    age_ms as f64 / max_lifetime_ms.max(1) as f64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayConfig {
    pub decay_timing: DecayTiming,
    pub compression_enabled: bool,
    pub crystallization_enabled: bool,
    pub trauma_weighting: bool,
    /// Nominal decay cycle interval (T).
    pub cycle_interval_ms: u64,
    /// Fragments younger than this are not decayed.
    pub min_fragment_lifetime_ms: u64,
    pub max_fragment_lifetime_ms: u64,
    /// Integrity a fragment must keep to crystallize.
    pub significance_threshold: f64,
    /// Crystallization needs age > this × min lifetime.
    pub crystallization_age_multiple: u64,
    /// Crystallization needs interaction count > this.
    pub engagement_floor: u32,
    /// Compression band is (0, compression_ceiling].
    pub compression_ceiling: f64,
    /// Compression needs no interaction for this long.
    pub staleness_window_ms: u64,
    /// Active fragment count that triggers eviction.
    pub overflow_threshold: usize,
    pub reinforcement_increment: f64,
    /// Upper bound on the entropy factor of a single late cycle.
    pub max_cycle_entropy: f64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            decay_timing: DecayTiming::Fibonacci,
            compression_enabled: true,
            crystallization_enabled: true,
            trauma_weighting: true,
            cycle_interval_ms: 5_000,
            min_fragment_lifetime_ms: 60_000,
            max_fragment_lifetime_ms: 3_600_000,
            significance_threshold: 0.7,
            crystallization_age_multiple: 10,
            engagement_floor: 3,
            compression_ceiling: 0.25,
            staleness_window_ms: 300_000,
            overflow_threshold: 500,
            reinforcement_increment: 0.05,
            max_cycle_entropy: 10.0,
        }
    }
}

/// `1 − (traumaLevel / 10) × modifier`, or 1 when weighting is off.
pub fn trauma_factor(trauma_level: f64, modifier: f64, weighting: bool) -> f64 {
    if !weighting {
        return 1.0;
    }
    let level = trauma_level.clamp(0.0, MAX_TRAUMA);
    (1.0 - (level / MAX_TRAUMA) * modifier).max(0.0)
}

/// Scale a cycle by how late (or early) it fired.
pub fn cycle_entropy(elapsed_ms: u64, interval_ms: u64, cap: f64) -> f64 {
    let entropy = elapsed_ms as f64 / interval_ms.max(1) as f64;
    entropy.min(cap.max(0.0))
}

/// Integrity to remove from `fragment` this cycle, clipped to what it has.
pub fn decay_amount(
    fragment: &Fragment,
    phase: Phase,
    policy: &dyn DecayPolicy,
    config: &DecayConfig,
    entropy: f64,
    now: u64,
) -> f64 {
    let kind = fragment.kind;
    let amount = kind.base_decay_rate()
        * trauma_factor(
            fragment.trauma_level,
            kind.trauma_modifier(),
            config.trauma_weighting,
        )
        * kind.phase_factor(phase)
        * policy.age_factor(fragment.age_ms(now), config.max_fragment_lifetime_ms)
        * entropy;
    if amount.is_nan() {
        0.0
    } else {
        amount.clamp(0.0, fragment.integrity)
    }
}
