//! Retry policy: bounded attempts with capped exponential backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-stage retry policy for transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,

    #[serde(with = "millis", rename = "base_delay_ms")]
    pub base_delay: Duration,

    pub multiplier: f64,

    #[serde(with = "millis", rename = "max_delay_ms")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts. Tests only need the attempt count.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay after the `attempts`-th failure (1-indexed).
    ///
    /// delay = min(base_delay * multiplier^(attempts - 1), max_delay)
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Is there budget left after `attempts` failures?
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_policy_has_three_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
    }

    #[rstest]
    #[case(1, Duration::from_millis(500))]
    #[case(2, Duration::from_secs(1))]
    #[case(3, Duration::from_secs(2))]
    #[case(6, Duration::from_secs(10))]
    #[case(60, Duration::from_secs(10))]
    fn backoff_doubles_then_caps(#[case] attempts: u32, #[case] expected: Duration) {
        assert_eq!(RetryPolicy::default().next_delay(attempts), expected);
    }

    #[test]
    fn budget_is_exhausted_at_max_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }

    #[test]
    fn loads_from_toml_with_partial_fields() {
        let policy: RetryPolicy = toml::from_str("max_attempts = 5\nbase_delay_ms = 10").unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(10));
        assert_eq!(policy.max_delay, Duration::from_secs(10));
    }
}
