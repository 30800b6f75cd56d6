use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use dashmap::DashMap;
use serde::Serialize;
use toolgrid_types::{RateLimitConfig, ServerId};
use utoipa::ToSchema;

use super::{Clock, SystemClock};

const MINUTE_WINDOW_MS: i64 = 60_000;

/// Outcome of one admission check. `retry_after_ms` is set only when
/// denied: the shortest wait after which a retry can succeed.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    /// None = no cap configured for that window.
    pub remaining_per_minute: Option<u32>,
    pub remaining_per_day: Option<u32>,
    pub reset_at_minute: DateTime<Utc>,
    pub reset_at_day: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Clone)]
struct WindowState {
    cfg: RateLimitConfig,
    minute_count: u32,
    minute_reset_at: DateTime<Utc>,
    day_count: u32,
    day_reset_at: DateTime<Utc>,
}

/// Per-server token bookkeeping over two windows: a 60 000 ms window
/// anchored at the first counted request, and a day window that resets at
/// local midnight + 1 ms. A cap of zero means that window is unlimited.
/// Servers without a registered config are never limited.
pub struct RateLimiter {
    states: DashMap<ServerId, WindowState>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            states: DashMap::new(),
            clock,
        }
    }

    /// Installs or replaces the config for a server; counters restart.
    pub fn register(&self, server_id: ServerId, cfg: RateLimitConfig) {
        let now = self.clock.now();
        self.states.insert(
            server_id,
            WindowState {
                cfg,
                minute_count: 0,
                minute_reset_at: now + Duration::milliseconds(MINUTE_WINDOW_MS),
                day_count: 0,
                day_reset_at: next_local_midnight(now),
            },
        );
    }

    pub fn unregister(&self, server_id: &ServerId) {
        self.states.remove(server_id);
    }

    /// Admission check that, iff both windows pass, counts the request.
    pub fn consume(&self, server_id: &ServerId) -> Decision {
        self.evaluate(server_id, true)
    }

    /// Same evaluation as [`consume`](Self::consume) without mutation.
    pub fn check(&self, server_id: &ServerId) -> Decision {
        self.evaluate(server_id, false)
    }

    pub fn reset(&self, server_id: &ServerId) {
        if let Some(mut state) = self.states.get_mut(server_id) {
            let now = self.clock.now();
            state.minute_count = 0;
            state.minute_reset_at = now + Duration::milliseconds(MINUTE_WINDOW_MS);
            state.day_count = 0;
            state.day_reset_at = next_local_midnight(now);
        }
    }

    pub fn reset_all(&self) {
        let ids: Vec<ServerId> = self.states.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.reset(&id);
        }
    }

    pub fn snapshot(&self, server_id: &ServerId) -> Option<Decision> {
        if self.states.contains_key(server_id) {
            Some(self.check(server_id))
        } else {
            None
        }
    }

    pub fn registered(&self) -> Vec<ServerId> {
        self.states.iter().map(|e| e.key().clone()).collect()
    }

    fn evaluate(&self, server_id: &ServerId, count: bool) -> Decision {
        let now = self.clock.now();

        let mut state = match self.states.get_mut(server_id) {
            Some(state) => state,
            // no config means no limiting
            None => {
                return Decision {
                    allowed: true,
                    remaining_per_minute: None,
                    remaining_per_day: None,
                    reset_at_minute: now + Duration::milliseconds(MINUTE_WINDOW_MS),
                    reset_at_day: next_local_midnight(now),
                    retry_after_ms: None,
                };
            }
        };

        // roll expired windows before evaluating
        if now >= state.minute_reset_at {
            state.minute_count = 0;
            state.minute_reset_at = now + Duration::milliseconds(MINUTE_WINDOW_MS);
        }
        if now >= state.day_reset_at {
            state.day_count = 0;
            state.day_reset_at = next_local_midnight(now);
        }

        let minute_ok = state.cfg.per_minute == 0 || state.minute_count < state.cfg.per_minute;
        let day_ok = state.cfg.per_day == 0 || state.day_count < state.cfg.per_day;
        let allowed = minute_ok && day_ok;

        if allowed && count {
            if state.minute_count == 0 {
                // window anchors at the first counted request
                state.minute_reset_at = now + Duration::milliseconds(MINUTE_WINDOW_MS);
            }
            state.minute_count += 1;
            state.day_count += 1;
        }

        let retry_after_ms = if allowed {
            None
        } else {
            let mut candidates = Vec::new();
            if !minute_ok {
                candidates.push((state.minute_reset_at - now).num_milliseconds().max(1) as u64);
            }
            if !day_ok {
                candidates.push((state.day_reset_at - now).num_milliseconds().max(1) as u64);
            }
            candidates.into_iter().min()
        };

        Decision {
            allowed,
            remaining_per_minute: (state.cfg.per_minute > 0)
                .then(|| state.cfg.per_minute.saturating_sub(state.minute_count)),
            remaining_per_day: (state.cfg.per_day > 0)
                .then(|| state.cfg.per_day.saturating_sub(state.day_count)),
            reset_at_minute: state.minute_reset_at,
            reset_at_day: state.day_reset_at,
            retry_after_ms,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Day windows reset at local midnight + 1 ms, expressed back in UTC.
fn next_local_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let local = now.with_timezone(&chrono::Local);
    let tomorrow = local.date_naive() + Duration::days(1);
    let midnight = chrono::Local
        .with_ymd_and_hms(tomorrow.year(), tomorrow.month(), tomorrow.day(), 0, 0, 0)
        .single()
        // fall back to the later interpretation around DST transitions
        .unwrap_or_else(|| {
            chrono::Local
                .with_ymd_and_hms(tomorrow.year(), tomorrow.month(), tomorrow.day(), 1, 0, 0)
                .earliest()
                .expect("1am always exists")
        });
    midnight.with_timezone(&Utc) + Duration::milliseconds(1)
}

#[cfg(test)]
mod tests {
    use super::super::test_clock::ManualClock;
    use super::*;

    fn limiter(per_minute: u32, per_day: u32) -> (RateLimiter, Arc<ManualClock>, ServerId) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = RateLimiter::with_clock(clock.clone());
        let id = ServerId::new("srv-x11").unwrap();
        limiter.register(
            id.clone(),
            RateLimitConfig {
                per_minute,
                per_day,
            },
        );
        (limiter, clock, id)
    }

    #[test]
    fn minute_cap_blocks_then_recovers() {
        let (limiter, clock, id) = limiter(3, 10);

        for expected_remaining in [2, 1, 0] {
            let decision = limiter.consume(&id);
            assert!(decision.allowed);
            assert_eq!(decision.remaining_per_minute, Some(expected_remaining));
        }

        let denied = limiter.consume(&id);
        assert!(!denied.allowed);
        let retry = denied.retry_after_ms.unwrap();
        assert!(retry > 0 && retry <= 60_000, "retry_after_ms = {retry}");

        clock.advance_ms(60_001);
        let decision = limiter.consume(&id);
        assert!(decision.allowed);
        assert_eq!(decision.remaining_per_minute, Some(2));
    }

    #[test]
    fn check_does_not_count() {
        let (limiter, _clock, id) = limiter(2, 0);

        for _ in 0..5 {
            assert!(limiter.check(&id).allowed);
        }
        assert_eq!(limiter.check(&id).remaining_per_minute, Some(2));
    }

    #[test]
    fn zero_cap_is_unlimited() {
        let (limiter, _clock, id) = limiter(0, 2);

        assert!(limiter.consume(&id).allowed);
        assert!(limiter.consume(&id).allowed);
        let denied = limiter.consume(&id);
        // only the daily cap applies
        assert!(!denied.allowed);
        assert_eq!(denied.remaining_per_minute, None);
        assert_eq!(denied.remaining_per_day, Some(0));
    }

    #[test]
    fn unregistered_server_is_never_limited() {
        let limiter = RateLimiter::new();
        let id = ServerId::new("srv-free").unwrap();
        for _ in 0..100 {
            assert!(limiter.consume(&id).allowed);
        }
    }

    #[test]
    fn window_anchors_at_first_request() {
        let (limiter, clock, id) = limiter(2, 0);

        // nothing consumed for 30s; the anchor moves to the first request
        clock.advance_ms(30_000);
        let first = limiter.consume(&id);
        let expected_reset = clock.now() + Duration::milliseconds(60_000);
        assert_eq!(first.reset_at_minute, expected_reset);
    }

    #[test]
    fn reset_clears_counters() {
        let (limiter, _clock, id) = limiter(1, 1);
        assert!(limiter.consume(&id).allowed);
        assert!(!limiter.consume(&id).allowed);

        limiter.reset(&id);
        assert!(limiter.consume(&id).allowed);
    }

    #[test]
    fn register_replaces_config() {
        let (limiter, _clock, id) = limiter(1, 0);
        assert!(limiter.consume(&id).allowed);
        assert!(!limiter.consume(&id).allowed);

        limiter.register(
            id.clone(),
            RateLimitConfig {
                per_minute: 5,
                per_day: 0,
            },
        );
        assert!(limiter.consume(&id).allowed);

        limiter.unregister(&id);
        assert!(limiter.snapshot(&id).is_none());
    }
}
