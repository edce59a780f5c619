//! Named circuit breakers shared across a process.
//!
//! The registry is constructed once at startup and handed to whatever needs
//! breaker lookups. It owns the default configuration and any per-dependency
//! overrides.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats};
use crate::clock::{Clock, SystemClock};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self::with_clock(default_config, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(default_config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config,
            overrides: HashMap::new(),
            clock,
        }
    }

    /// Use `config` instead of the default for breakers created under `name`.
    pub fn with_override(mut self, name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.overrides.insert(name.into(), config);
        self
    }

    /// Get the breaker for `name`, creating it on first access.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(breaker) = breakers.get(name) {
                return Arc::clone(breaker);
            }
        }

        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);

        // Another caller may have created it between the two locks.
        if let Some(breaker) = breakers.get(name) {
            return Arc::clone(breaker);
        }

        let config = self
            .overrides
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default_config.clone());
        let breaker = Arc::new(CircuitBreaker::with_clock(
            name,
            config,
            Arc::clone(&self.clock),
        ));
        breakers.insert(name.to_string(), Arc::clone(&breaker));

        info!(
            name = name,
            total_circuit_breakers = breakers.len(),
            "Created new circuit breaker"
        );

        breaker
    }

    pub fn get_all(&self) -> HashMap<String, Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get_all_stats(&self) -> BTreeMap<String, CircuitStats> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.stats()))
            .collect()
    }

    pub fn has_open_circuits(&self) -> bool {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|breaker| breaker.state() == CircuitState::Open)
    }

    /// Names of breakers currently open, sorted.
    pub fn open_circuits(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, breaker)| breaker.is_open())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Close every registered breaker and zero its counters. Entries are kept.
    pub fn reset_all(&self) {
        let breakers = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        for breaker in breakers.values() {
            breaker.reset();
        }
        info!(count = breakers.len(), "Reset all circuit breakers");
    }

    /// Drop every registered breaker. Intended for test teardown.
    pub fn clear(&self) {
        self.breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
