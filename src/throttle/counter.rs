//! Window keys and counter entries.

use std::fmt;

/// Prefix shared by every counter key written by Floodgate.
pub const KEY_PREFIX: &str = "floodgate";

/// Identifies the counter for one rule, one discriminator and one window.
///
/// Windows are epoch aligned: `window = floor(now / period)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    /// Name of the rule that owns the counter
    pub rule: String,
    /// Resolved discriminator value
    pub discriminator: String,
    /// Window index since the Unix epoch
    pub window: u64,
}

impl WindowKey {
    pub fn new(rule: &str, discriminator: &str, window: u64) -> Self {
        Self {
            rule: rule.to_string(),
            discriminator: discriminator.to_string(),
            window,
        }
    }

    /// Key for the window containing `now` (unix seconds) with the given period.
    pub fn at(rule: &str, discriminator: &str, period: u64, now: u64) -> Self {
        Self::new(rule, discriminator, window_index(now, period))
    }

    /// Render the key used by counter stores.
    ///
    /// Format: `floodgate:{window}:{rule length}:{rule}:{discriminator}`.
    /// The length prefix keeps keys distinct when the rule name and the
    /// discriminator both contain `:` (IPv6 addresses always do).
    pub fn to_store_key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            KEY_PREFIX,
            self.window,
            self.rule.len(),
            self.rule,
            self.discriminator
        )
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_store_key())
    }
}

/// Index of the fixed window containing `now`.
pub fn window_index(now: u64, period: u64) -> u64 {
    now / period
}

/// Seconds from `now` until the next window boundary. Always in `1..=period`.
pub fn seconds_until_reset(now: u64, period: u64) -> u64 {
    period - now % period
}

/// A request count that expires at a fixed point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCounter {
    count: u64,
    /// Unix seconds at which the counter stops counting
    expires_at: u64,
}

impl WindowCounter {
    /// Create an empty counter that lives `ttl_secs` from `now`.
    pub fn new(now: u64, ttl_secs: u64) -> Self {
        Self {
            count: 0,
            expires_at: now.saturating_add(ttl_secs),
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Add one hit, restarting the counter first if it has expired.
    ///
    /// Returns the post-increment count.
    pub fn increment(&mut self, now: u64, ttl_secs: u64) -> u64 {
        if self.is_expired(now) {
            *self = Self::new(now, ttl_secs);
        }
        self.count += 1;
        self.count
    }

    /// The live count, or `None` once expired.
    pub fn current(&self, now: u64) -> Option<u64> {
        (!self.is_expired(now)).then_some(self.count)
    }

    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }
}
