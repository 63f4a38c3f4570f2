//! Reconnection policy
//!
//! Sessions never retry on their own. A caller that wants to re-establish a
//! lost link hands a [`ReconnectPolicy`] and a connect closure to
//! [`reconnect_with`], which sleeps on [`tokio::time`] between attempts so
//! the schedule can be fast-forwarded in tests.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::humantime_serde;

/// Exponential backoff schedule for reconnection attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Enable automatic reconnection
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Delay before the first retry
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Upper bound on the delay between retries
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Growth factor applied per failed attempt
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Maximum number of attempts (0 = infinite)
    #[serde(default)]
    pub max_attempts: u32,
}

fn default_enabled() -> bool {
    true
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            max_attempts: 0,
        }
    }
}

impl ReconnectPolicy {
    /// Policy that never retries
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay to wait after failed attempt number `attempt` (zero-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub fn allows(&self, attempts: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || attempts < self.max_attempts)
    }
}

/// Run `connect` until it succeeds or the policy gives up.
///
/// The first attempt runs immediately; each failure waits
/// [`ReconnectPolicy::delay_for`] before the next. The closure receives the
/// zero-based attempt number. When attempts are exhausted (or the policy is
/// disabled after the first failure) the last error is returned.
pub async fn reconnect_with<T, E, F, Fut>(policy: &ReconnectPolicy, mut connect: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0u32;
    loop {
        match connect(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    info!(attempts = attempt + 1, "Reconnected");
                }
                return Ok(value);
            }
            Err(e) => {
                let made = attempt.saturating_add(1);
                if !policy.allows(made) {
                    warn!(attempts = made, error = %e, "Giving up on reconnection");
                    return Err(e);
                }
                let delay = policy.delay_for(attempt);
                warn!(attempt = made, error = %e, delay = ?delay, "Connection attempt failed, retrying");
                tokio::time::sleep(delay).await;
                attempt = made;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delay_schedule() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            ..Default::default()
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_secs(1));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_allows() {
        let policy = ReconnectPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
        assert!(ReconnectPolicy::default().allows(10_000));
        assert!(!ReconnectPolicy::disabled().allows(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_succeeds_after_failures() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        let calls = Arc::new(AtomicU32::new(0));
        let start = tokio::time::Instant::now();

        let counter = calls.clone();
        let result: Result<&str, String> = reconnect_with(&policy, move |attempt| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    Err(format!("attempt {attempt} failed"))
                } else {
                    Ok("up")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "up");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s + 2s of backoff
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up() {
        let policy = ReconnectPolicy {
            max_attempts: 2,
            ..Default::default()
        };
        let result: Result<(), String> =
            reconnect_with(&policy, |attempt| async move { Err(format!("no radio {attempt}")) }).await;
        assert_eq!(result.unwrap_err(), "no radio 1");
    }

    #[test]
    fn test_serde_defaults() {
        let policy: ReconnectPolicy = toml::from_str("max_attempts = 5").unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.multiplier, 2.0);
    }
}
