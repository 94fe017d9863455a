//! Admission rate limiting — per-SessionKey sliding window, tiered by
//! tenant.
//!
//! Separate state per SessionKey: a burst on one conversation never
//! starves another, and a tenant's tier caps each conversation rather
//! than the tenant aggregate.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use acf_domain::config::{AdmissionRateLimitConfig, RateTier};
use acf_domain::SessionKey;

/// Returned when an admission exceeds the tenant tier's limit.
#[derive(Debug, Clone)]
pub struct RateLimited {
    pub tier: RateTier,
    pub limit: u32,
    pub window_seconds: u64,
}

impl RateLimited {
    /// The wire reason carried on REJECT decisions.
    pub const REASON: &'static str = "rate_limit_exceeded";
}

/// Sliding-window admission limiter.
pub struct AdmissionRateLimiter {
    config: AdmissionRateLimitConfig,
    windows: Mutex<HashMap<SessionKey, VecDeque<Instant>>>,
}

impl AdmissionRateLimiter {
    pub fn new(config: AdmissionRateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Admit one message for the session, or reject when the tier limit
    /// is already reached inside the window.  Admitted messages count
    /// against the window; rejected ones do not.
    pub fn check_admission(
        &self,
        session_key: &SessionKey,
        tenant_id: &Uuid,
    ) -> Result<(), RateLimited> {
        let tier = self.config.tier_for(tenant_id);
        let limit = self.config.limit_for(tier);
        let window = Duration::from_secs(self.config.window_seconds);
        let now = Instant::now();

        let mut windows = self.windows.lock();
        let hits = windows.entry(session_key.clone()).or_default();

        while let Some(&front) = hits.front() {
            if now.duration_since(front) >= window {
                hits.pop_front();
            } else {
                break;
            }
        }

        if hits.len() >= limit as usize {
            return Err(RateLimited {
                tier,
                limit,
                window_seconds: self.config.window_seconds,
            });
        }

        hits.push_back(now);
        Ok(())
    }

    /// Drop windows that have gone fully idle (cleanup).
    pub fn prune_idle(&self) {
        let window = Duration::from_secs(self.config.window_seconds);
        let now = Instant::now();
        self.windows.lock().retain(|_, hits| {
            hits.back()
                .is_some_and(|&last| now.duration_since(last) < window)
        });
    }

    /// Number of tracked sessions (for monitoring).
    pub fn session_count(&self) -> usize {
        self.windows.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(free_limit: u32) -> AdmissionRateLimiter {
        AdmissionRateLimiter::new(AdmissionRateLimitConfig {
            free_limit,
            ..AdmissionRateLimitConfig::default()
        })
    }

    fn key(suffix: &str) -> SessionKey {
        SessionKey::from_raw(format!("t:a:i:{suffix}"))
    }

    #[test]
    fn limit_plus_one_is_rejected() {
        let limiter = limiter(60);
        let tenant = Uuid::new_v4();
        let k = key("web");

        for i in 0..60 {
            assert!(limiter.check_admission(&k, &tenant).is_ok(), "admission {i}");
        }
        let err = limiter.check_admission(&k, &tenant).unwrap_err();
        assert_eq!(err.tier, RateTier::Free);
        assert_eq!(err.limit, 60);
    }

    #[test]
    fn sessions_have_independent_windows() {
        let limiter = limiter(2);
        let tenant = Uuid::new_v4();

        assert!(limiter.check_admission(&key("web"), &tenant).is_ok());
        assert!(limiter.check_admission(&key("web"), &tenant).is_ok());
        assert!(limiter.check_admission(&key("web"), &tenant).is_err());

        // A different conversation is unaffected.
        assert!(limiter.check_admission(&key("sms"), &tenant).is_ok());
    }

    #[test]
    fn tier_table_raises_the_limit() {
        let tenant = Uuid::new_v4();
        let mut config = AdmissionRateLimitConfig {
            free_limit: 1,
            pro_limit: 3,
            ..AdmissionRateLimitConfig::default()
        };
        config.tenant_tiers.insert(tenant.to_string(), RateTier::Pro);
        let limiter = AdmissionRateLimiter::new(config);

        let k = key("web");
        for _ in 0..3 {
            assert!(limiter.check_admission(&k, &tenant).is_ok());
        }
        let err = limiter.check_admission(&k, &tenant).unwrap_err();
        assert_eq!(err.tier, RateTier::Pro);
        assert_eq!(err.limit, 3);
    }

    #[test]
    fn rejected_admissions_do_not_consume_the_window() {
        let limiter = limiter(1);
        let tenant = Uuid::new_v4();
        let k = key("web");

        assert!(limiter.check_admission(&k, &tenant).is_ok());
        for _ in 0..5 {
            assert!(limiter.check_admission(&k, &tenant).is_err());
        }
        // Still exactly one hit recorded.
        assert_eq!(limiter.session_count(), 1);
    }

    #[test]
    fn prune_drops_idle_sessions() {
        let mut config = AdmissionRateLimitConfig::default();
        config.window_seconds = 0; // everything is instantly stale
        let limiter = AdmissionRateLimiter::new(config);
        let tenant = Uuid::new_v4();

        // window_seconds = 0 means the window check itself always
        // evicts, so just exercise prune on the tracked map.
        let _ = limiter.check_admission(&key("web"), &tenant);
        limiter.prune_idle();
        assert_eq!(limiter.session_count(), 0);
    }
}
