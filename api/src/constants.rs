//! Control surface limits

/// Longest pause an operator may request, in minutes
pub const MAX_PAUSE_MINUTES: u32 = 120;

/// Manual block duration when the request does not name one
pub const DEFAULT_BLOCK_SECS: f64 = 10.0;

/// Manual blocks are clamped into this range (seconds)
pub const MIN_BLOCK_SECS: f64 = 1.0;
pub const MAX_BLOCK_SECS: f64 = 60.0;

/// Overlay label for manual blocks without a `source`
pub const DEFAULT_BLOCK_LABEL: &str = "manual";
