// Per-node circuit breakers
// Keeps the gateway from hammering a member that keeps failing

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use nexus_common::StoreError;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests are rejected until the reset timeout elapses
    Open,
    /// Trial requests allowed, the next outcome decides
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive node failures before opening (default: 5)
    pub failure_threshold: u32,
    /// Time spent open before allowing a trial (default: 5 seconds)
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Circuit breaker for one node
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Whether a request may go through. An open breaker turns half-open
    /// once the reset timeout has elapsed.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    info!("Circuit breaker for {} half-open", self.name);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!("Circuit breaker for {} closed", self.name);
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        let trip = match inner.state {
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if trip {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            warn!(
                "Circuit breaker for {} opened after {} consecutive failures",
                self.name, inner.consecutive_failures
            );
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn reset(&self) {
        self.record_success();
    }
}

/// Breakers keyed by node address, created on first use
pub struct NodeBreakers {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl NodeBreakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    fn breaker(&self, address: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(address) {
            return existing.clone();
        }
        self.breakers
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(address, self.config.clone())))
            .clone()
    }

    pub fn allow(&self, address: &str) -> bool {
        self.breaker(address).allow_request()
    }

    /// Peek without moving an open breaker to half-open
    pub fn is_open(&self, address: &str) -> bool {
        self.breakers
            .get(address)
            .is_some_and(|b| b.state() == CircuitState::Open)
    }

    /// Only failures that say something about the node's health count
    pub fn record<T>(&self, address: &str, result: &Result<T, StoreError>) {
        match result {
            Ok(_) => self.breaker(address).record_success(),
            Err(e) if e.is_node_failure() => self.breaker(address).record_failure(),
            Err(_) => {}
        }
    }

    pub fn reset(&self, address: &str) {
        if let Some(breaker) = self.breakers.get(address) {
            breaker.reset();
        }
    }

    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<(String, CircuitState)> = self
            .breakers
            .iter()
            .map(|e| (e.key().clone(), e.value().state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("n1:1", config());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_half_open_after_timeout() {
        let breaker = CircuitBreaker::new("n1:1", config());
        breaker.record_failure();
        breaker.record_failure();

        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_success_closes() {
        let breaker = CircuitBreaker::new("n1:1", config());
        breaker.record_failure();
        breaker.record_failure();

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());
    }

    #[test]
    fn test_only_node_failures_count() {
        let breakers = NodeBreakers::new(config());
        let not_primary: Result<(), StoreError> = Err(StoreError::NotPrimary("n1:1".to_string()));
        let unreachable: Result<(), StoreError> = Err(StoreError::Unreachable("n1:1".to_string()));

        breakers.record("n1:1", &not_primary);
        breakers.record("n1:1", &not_primary);
        breakers.record("n1:1", &not_primary);
        assert!(!breakers.is_open("n1:1"));

        breakers.record("n1:1", &unreachable);
        breakers.record("n1:1", &unreachable);
        assert!(breakers.is_open("n1:1"));
        assert!(!breakers.allow("n1:1"));

        breakers.reset("n1:1");
        assert!(breakers.allow("n1:1"));
        assert_eq!(breakers.states(), vec![("n1:1".to_string(), CircuitState::Closed)]);
    }
}
