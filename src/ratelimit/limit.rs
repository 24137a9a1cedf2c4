//! Limit specifications and the storage keys derived from them.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::algorithm::Algorithm;
use crate::error::{Result, TurnstileError};

/// Largest `count` a single limit may carry.
pub const MAX_COUNT: u64 = 1_000_000_000;

/// Longest window a single limit may span, ten 365-day years.
pub const MAX_WINDOW: Duration = Duration::from_secs(10 * 365 * 86_400);

/// A quota: at most `count` units of cost per `window`.
///
/// Specs are supplied per request and may be mixed freely, e.g. `10/s`
/// together with `500/h` on the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LimitSpec {
    /// Units of cost allowed per window
    pub count: u64,
    /// Length of the window
    pub window: Duration,
}

impl LimitSpec {
    /// Create a validated limit spec.
    pub fn new(count: u64, window: Duration) -> Result<Self> {
        let spec = Self { count, window };
        spec.validate()?;
        Ok(spec)
    }

    /// Shorthand for a per-second limit.
    pub fn per_second(count: u64) -> Result<Self> {
        Self::new(count, Duration::from_secs(1))
    }

    /// Shorthand for a per-minute limit.
    pub fn per_minute(count: u64) -> Result<Self> {
        Self::new(count, Duration::from_secs(60))
    }

    /// Shorthand for a per-hour limit.
    pub fn per_hour(count: u64) -> Result<Self> {
        Self::new(count, Duration::from_secs(3600))
    }

    /// Check the count and window bounds.
    ///
    /// Windows are tracked at millisecond granularity, so a window must be a
    /// whole, non-zero number of milliseconds no longer than [`MAX_WINDOW`].
    pub fn validate(&self) -> Result<()> {
        if self.count == 0 || self.count > MAX_COUNT {
            return Err(TurnstileError::configuration(format!(
                "limit count must be in [1, {}], got {}",
                MAX_COUNT, self.count
            )));
        }
        if self.window < Duration::from_millis(1) {
            return Err(TurnstileError::configuration(format!(
                "limit window must be at least 1ms, got {:?}",
                self.window
            )));
        }
        if self.window > MAX_WINDOW {
            return Err(TurnstileError::configuration(format!(
                "limit window must be at most {:?}, got {:?}",
                MAX_WINDOW, self.window
            )));
        }
        if self.window.subsec_nanos() % 1_000_000 != 0 {
            return Err(TurnstileError::configuration(format!(
                "limit window must be a whole number of milliseconds, got {:?}",
                self.window
            )));
        }
        Ok(())
    }

    /// Window length in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }

    /// Window length in microseconds.
    pub fn window_us(&self) -> u64 {
        self.window.as_micros() as u64
    }
}

impl fmt::Display for LimitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.window_ms();
        let window = match ms {
            _ if ms % 86_400_000 == 0 => format!("{}d", ms / 86_400_000),
            _ if ms % 3_600_000 == 0 => format!("{}h", ms / 3_600_000),
            _ if ms % 60_000 == 0 => format!("{}m", ms / 60_000),
            _ if ms % 1000 == 0 => format!("{}s", ms / 1000),
            _ => format!("{}ms", ms),
        };
        write!(f, "{}/{}", self.count, window)
    }
}

/// Parses `<count>/<window>`, where the window is `<n><unit>` or a bare unit.
///
/// Units: `ms`, `s`, `m`/`min`, `h`, `d` (long forms like `second` accepted).
/// A bare number is read as seconds.
impl FromStr for LimitSpec {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        let (count, window) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| TurnstileError::configuration(format!("invalid limit '{}': expected <count>/<window>", s)))?;

        let count: u64 = count.trim().parse().map_err(|_| {
            TurnstileError::configuration(format!("invalid limit count in '{}'", s))
        })?;

        let window = parse_window(window.trim())
            .ok_or_else(|| TurnstileError::configuration(format!("invalid limit window in '{}'", s)))?;

        Self::new(count, window)
    }
}

fn parse_window(s: &str) -> Option<Duration> {
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (amount, unit) = s.split_at(split);

    let amount: u64 = if amount.is_empty() {
        if unit.is_empty() {
            return None;
        }
        1
    } else {
        amount.parse().ok()?
    };

    let unit_ms: u64 = match unit.trim() {
        "ms" => 1,
        "" | "s" | "sec" | "second" | "seconds" => 1000,
        "m" | "min" | "minute" | "minutes" => 60_000,
        "h" | "hr" | "hour" | "hours" => 3_600_000,
        "d" | "day" | "days" => 86_400_000,
        _ => return None,
    };

    amount.checked_mul(unit_ms).map(Duration::from_millis)
}

impl TryFrom<String> for LimitSpec {
    type Error = TurnstileError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<LimitSpec> for String {
    fn from(spec: LimitSpec) -> Self {
        spec.to_string()
    }
}

/// Storage key for one (rate key, limit, algorithm) triple.
///
/// Format: `{algorithm}:{window_ms}:{count}:{key}`. The rate key goes last
/// so that colons inside it can never shift the fixed fields, and the
/// algorithm tag keeps continuous and windowed state apart.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubKey(String);

impl SubKey {
    /// Derive the storage key for `key` under `spec` and `algorithm`.
    pub fn new(algorithm: Algorithm, spec: &LimitSpec, key: &str) -> Self {
        Self(format!(
            "{}:{}:{}:{}",
            algorithm.tag(),
            spec.window_ms(),
            spec.count,
            key
        ))
    }

    /// The encoded key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
