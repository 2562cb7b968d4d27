/// Fibonacci age table for the `fibonacci` decay timing.
/// Indexed by whole days of fragment age, clamped to the last term.
pub const FIBONACCI: [f64; 17] = [
    1.0, 1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 21.0, 34.0, 55.0, 89.0, 144.0, 233.0, 377.0, 610.0,
    987.0, 1597.0,
];

/// Midpoint of the fibonacci table. `FIBONACCI[FIBONACCI_MIDPOINT] == 34`.
pub const FIBONACCI_MIDPOINT: usize = FIBONACCI.len() / 2;

/// One day in milliseconds.
pub const DAY_MS: u64 = 86_400_000;

/// Upper bound of the trauma / intensity scale. Lower bound is 0.
pub const MAX_TRAUMA: f64 = 10.0;

/// Width of the trailing window used for transition rate limiting.
pub const RATE_WINDOW_MS: u64 = 60_000;

/// Numerical epsilon for near-zero comparisons
pub const EPSILON: f64 = 1e-10;

/// Weight a compressed fragment contributes to the stability score.
/// Active fragments contribute their integrity, crystals contribute 1.0.
pub const COMPRESSED_STABILITY_WEIGHT: f64 = 0.25;

/// Scope used when the host does not name one.
pub const DEFAULT_SCOPE: &str = "default";

/// Longest accepted channel name.
pub const MAX_CHANNEL_LEN: usize = 128;
