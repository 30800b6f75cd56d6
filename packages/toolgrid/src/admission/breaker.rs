use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use toolgrid_types::{GatewayEvent, ServerId};
use utoipa::ToSchema;

use super::{Clock, SystemClock};
use crate::events::EventBus;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerConfig {
    /// Failures needed (with sufficient volume) to trip CLOSED -> OPEN.
    pub failure_threshold: u32,
    /// Consecutive HALF_OPEN successes needed to close.
    pub success_threshold: u32,
    /// How long OPEN rejects before the next check probes HALF_OPEN.
    pub timeout_ms: u64,
    /// Minimum requests before failures can trip the breaker.
    /// Zero means any single failure opens it.
    pub volume_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 30_000,
            volume_threshold: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct ServerBreaker {
    config: BreakerConfig,
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    request_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    last_state_change: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub server_id: ServerId,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub request_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
}

/// Per-server circuit breakers. Every state transition publishes a
/// `circuit.*` event.
///
/// HALF_OPEN admits every caller rather than a single probe; under burst
/// load several failing calls may pass before the first failure flips the
/// breaker back to OPEN. That contention is accepted to keep admission
/// lock-free on the hot path.
pub struct CircuitBreakers {
    breakers: DashMap<ServerId, ServerBreaker>,
    default_config: BreakerConfig,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakers {
    pub fn new(default_config: BreakerConfig, events: Arc<EventBus>) -> Self {
        Self::with_clock(default_config, events, Arc::new(SystemClock))
    }

    pub fn with_clock(
        default_config: BreakerConfig,
        events: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
            events,
            clock,
        }
    }

    pub fn register(&self, server_id: ServerId, config: Option<BreakerConfig>) {
        let now = self.clock.now();
        self.breakers.insert(
            server_id,
            ServerBreaker {
                config: config.unwrap_or(self.default_config),
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                request_count: 0,
                last_failure_time: None,
                last_state_change: now,
            },
        );
    }

    pub fn remove(&self, server_id: &ServerId) {
        self.breakers.remove(server_id);
    }

    /// Whether a call to this server may proceed. The OPEN -> HALF_OPEN
    /// transition happens here, on the first check after the timeout.
    pub fn admit(&self, server_id: &ServerId) -> bool {
        let now = self.clock.now();
        let mut breaker = self.entry(server_id);

        match breaker.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = breaker
                    .last_failure_time
                    .map(|t| (now - t).num_milliseconds())
                    .unwrap_or(i64::MAX);
                if elapsed >= breaker.config.timeout_ms as i64 {
                    breaker.state = BreakerState::HalfOpen;
                    breaker.success_count = 0;
                    breaker.last_state_change = now;
                    drop(breaker);
                    self.events.publish(GatewayEvent::CircuitHalfOpen {
                        server_id: server_id.clone(),
                    });
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Milliseconds until an OPEN breaker would next admit; None when it
    /// admits already.
    pub fn retry_after_ms(&self, server_id: &ServerId) -> Option<u64> {
        let now = self.clock.now();
        let breaker = self.breakers.get(server_id)?;
        if breaker.state != BreakerState::Open {
            return None;
        }
        let last = breaker.last_failure_time?;
        let remaining = breaker.config.timeout_ms as i64 - (now - last).num_milliseconds();
        (remaining > 0).then_some(remaining as u64)
    }

    pub fn record_success(&self, server_id: &ServerId) {
        let now = self.clock.now();
        let mut breaker = self.entry(server_id);
        breaker.request_count += 1;

        match breaker.state {
            BreakerState::Closed => {
                breaker.success_count += 1;
            }
            BreakerState::HalfOpen => {
                breaker.success_count += 1;
                if breaker.success_count >= breaker.config.success_threshold {
                    reset_to_closed(&mut breaker, now);
                    drop(breaker);
                    self.events.publish(GatewayEvent::CircuitClosed {
                        server_id: server_id.clone(),
                    });
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self, server_id: &ServerId) {
        let now = self.clock.now();
        let mut breaker = self.entry(server_id);
        breaker.request_count += 1;
        breaker.failure_count += 1;
        breaker.last_failure_time = Some(now);

        let opened = match breaker.state {
            BreakerState::Closed => {
                let volume_met = breaker.request_count >= breaker.config.volume_threshold;
                let failures_met = breaker.config.volume_threshold == 0
                    || breaker.failure_count >= breaker.config.failure_threshold;
                if volume_met && failures_met {
                    breaker.state = BreakerState::Open;
                    breaker.last_state_change = now;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                // any failure while probing reopens
                breaker.state = BreakerState::Open;
                breaker.success_count = 0;
                breaker.last_state_change = now;
                true
            }
            BreakerState::Open => false,
        };

        drop(breaker);
        if opened {
            self.events.publish(GatewayEvent::CircuitOpened {
                server_id: server_id.clone(),
            });
        }
    }

    pub fn force_open(&self, server_id: &ServerId) {
        let now = self.clock.now();
        let mut breaker = self.entry(server_id);
        if breaker.state != BreakerState::Open {
            breaker.state = BreakerState::Open;
            // forced opens reject for a full timeout window from now
            breaker.last_failure_time = Some(now);
            breaker.last_state_change = now;
            drop(breaker);
            self.events.publish(GatewayEvent::CircuitOpened {
                server_id: server_id.clone(),
            });
        }
    }

    pub fn force_close(&self, server_id: &ServerId) {
        let now = self.clock.now();
        let mut breaker = self.entry(server_id);
        if breaker.state != BreakerState::Closed {
            reset_to_closed(&mut breaker, now);
            drop(breaker);
            self.events.publish(GatewayEvent::CircuitClosed {
                server_id: server_id.clone(),
            });
        }
    }

    pub fn snapshot(&self, server_id: &ServerId) -> Option<BreakerSnapshot> {
        self.breakers.get(server_id).map(|b| BreakerSnapshot {
            server_id: server_id.clone(),
            state: b.state,
            failure_count: b.failure_count,
            success_count: b.success_count,
            request_count: b.request_count,
            last_failure_time: b.last_failure_time,
            last_state_change: b.last_state_change,
        })
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers
            .iter()
            .map(|entry| BreakerSnapshot {
                server_id: entry.key().clone(),
                state: entry.state,
                failure_count: entry.failure_count,
                success_count: entry.success_count,
                request_count: entry.request_count,
                last_failure_time: entry.last_failure_time,
                last_state_change: entry.last_state_change,
            })
            .collect()
    }

    fn entry(&self, server_id: &ServerId) -> dashmap::mapref::one::RefMut<'_, ServerId, ServerBreaker> {
        self.breakers
            .entry(server_id.clone())
            .or_insert_with(|| ServerBreaker {
                config: self.default_config,
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                request_count: 0,
                last_failure_time: None,
                last_state_change: self.clock.now(),
            })
    }
}

fn reset_to_closed(breaker: &mut ServerBreaker, now: DateTime<Utc>) {
    breaker.state = BreakerState::Closed;
    breaker.failure_count = 0;
    breaker.success_count = 0;
    breaker.request_count = 0;
    breaker.last_failure_time = None;
    breaker.last_state_change = now;
}

#[cfg(test)]
mod tests {
    use super::super::test_clock::ManualClock;
    use super::*;

    fn setup(config: BreakerConfig) -> (CircuitBreakers, Arc<ManualClock>, ServerId) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let bus = Arc::new(EventBus::new());
        let breakers = CircuitBreakers::with_clock(config, bus, clock.clone());
        let id = ServerId::new("srv-y22").unwrap();
        breakers.register(id.clone(), Some(config));
        (breakers, clock, id)
    }

    fn s2_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout_ms: 100,
            volume_threshold: 3,
        }
    }

    #[test]
    fn opens_then_probes_then_recovers() {
        let (breakers, clock, id) = setup(s2_config());

        for _ in 0..3 {
            breakers.record_failure(&id);
        }
        assert_eq!(breakers.snapshot(&id).unwrap().state, BreakerState::Open);
        assert!(!breakers.admit(&id));

        clock.advance_ms(100);
        assert!(breakers.admit(&id));
        assert_eq!(
            breakers.snapshot(&id).unwrap().state,
            BreakerState::HalfOpen
        );

        breakers.record_success(&id);
        breakers.record_success(&id);
        let snapshot = breakers.snapshot(&id).unwrap();
        assert_eq!(snapshot.state, BreakerState::Closed);
        // entering CLOSED zeroes all counters
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.success_count, 0);
        assert_eq!(snapshot.request_count, 0);
    }

    #[test]
    fn never_admits_open_before_timeout() {
        let (breakers, clock, id) = setup(s2_config());

        for _ in 0..3 {
            breakers.record_failure(&id);
        }
        clock.advance_ms(99);
        assert!(!breakers.admit(&id));
        assert!(breakers.retry_after_ms(&id).unwrap() <= 100);

        clock.advance_ms(1);
        assert!(breakers.admit(&id));
    }

    #[test]
    fn half_open_failure_reopens() {
        let (breakers, clock, id) = setup(s2_config());

        for _ in 0..3 {
            breakers.record_failure(&id);
        }
        clock.advance_ms(100);
        assert!(breakers.admit(&id));

        breakers.record_success(&id);
        breakers.record_failure(&id);
        assert_eq!(breakers.snapshot(&id).unwrap().state, BreakerState::Open);
    }

    #[test]
    fn volume_threshold_gates_opening() {
        let (breakers, _clock, id) = setup(BreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            timeout_ms: 100,
            volume_threshold: 5,
        });

        breakers.record_failure(&id);
        breakers.record_failure(&id);
        // failures reached the threshold but volume has not
        assert_eq!(breakers.snapshot(&id).unwrap().state, BreakerState::Closed);

        breakers.record_success(&id);
        breakers.record_success(&id);
        breakers.record_failure(&id);
        assert_eq!(breakers.snapshot(&id).unwrap().state, BreakerState::Open);
    }

    #[test]
    fn zero_volume_threshold_opens_on_single_failure() {
        let (breakers, _clock, id) = setup(BreakerConfig {
            failure_threshold: 5,
            success_threshold: 1,
            timeout_ms: 100,
            volume_threshold: 0,
        });

        breakers.record_failure(&id);
        assert_eq!(breakers.snapshot(&id).unwrap().state, BreakerState::Open);
    }

    #[test]
    fn force_open_and_close() {
        let (breakers, _clock, id) = setup(s2_config());

        breakers.force_open(&id);
        assert!(!breakers.admit(&id));

        breakers.force_close(&id);
        assert!(breakers.admit(&id));
        assert_eq!(breakers.snapshot(&id).unwrap().state, BreakerState::Closed);
    }

    #[test]
    fn transitions_publish_events() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        bus.subscribe(move |event| {
            seen_clone.lock().unwrap().push(event.kind().to_string());
        });

        let breakers = CircuitBreakers::with_clock(s2_config(), bus, clock.clone());
        let id = ServerId::new("srv-y22").unwrap();
        breakers.register(id.clone(), Some(s2_config()));

        for _ in 0..3 {
            breakers.record_failure(&id);
        }
        clock.advance_ms(100);
        breakers.admit(&id);
        breakers.record_success(&id);
        breakers.record_success(&id);

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["circuit.opened", "circuit.half_open", "circuit.closed"]
        );
    }
}
