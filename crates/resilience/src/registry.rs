//! Per-dependency breaker registry.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig};

/// Map from dependency name to its breaker.
///
/// Owned by whoever wires the application and handed to call sites; there
/// is no process-global registry. Clones share the same breakers.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: Arc<RwLock<HashMap<String, Arc<CircuitBreaker>>>>,
}

impl CircuitBreakerRegistry {
    /// Creates a registry whose lazily created breakers use `default_config`.
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: Arc::default(),
        }
    }

    /// Returns the breaker for `name`, creating it on first use.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.find(name) {
            return breaker;
        }

        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(dependency = name, "Creating circuit breaker");
                Arc::new(CircuitBreaker::with_config(name, self.default_config.clone()))
            })
            .clone()
    }

    /// Installs a breaker with its own thresholds, replacing any existing one.
    pub fn register(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::with_config(name, config));
        self.breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), breaker.clone());
        breaker
    }

    /// Returns the breaker for `name` if one has been created.
    pub fn find(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Resets the named breaker. Returns false if it does not exist.
    pub fn reset(&self, name: &str) -> bool {
        match self.find(name) {
            Some(breaker) => {
                breaker.reset();
                tracing::info!(dependency = name, "Circuit breaker reset by operator");
                true
            }
            None => false,
        }
    }

    /// Snapshots of every breaker, sorted by name.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<_> = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut snapshots: Vec<_> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CircuitState;
    use std::time::Duration;

    #[test]
    fn get_creates_lazily_and_returns_same_instance() {
        let registry = CircuitBreakerRegistry::default();
        assert!(registry.find("payment-gateway").is_none());

        let a = registry.get("payment-gateway");
        let b = registry.get("payment-gateway");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.find("payment-gateway").is_some());
    }

    #[test]
    fn breakers_are_independent_per_dependency() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });
        registry.get("message-broker").record_failure();

        assert_eq!(registry.get("message-broker").state(), CircuitState::Open);
        assert_eq!(registry.get("payment-gateway").state(), CircuitState::Closed);
    }

    #[test]
    fn clones_share_breakers() {
        let registry = CircuitBreakerRegistry::default();
        let clone = registry.clone();
        let a = registry.get("x");
        assert!(Arc::ptr_eq(&a, &clone.get("x")));
    }

    #[test]
    fn register_overrides_config() {
        let registry = CircuitBreakerRegistry::default();
        let breaker = registry.register(
            "slow",
            CircuitBreakerConfig {
                failure_threshold: 1,
                success_threshold: 1,
                timeout: Duration::from_secs(1),
            },
        );
        assert_eq!(breaker.config().failure_threshold, 1);
        assert!(Arc::ptr_eq(&breaker, &registry.get("slow")));
    }

    #[test]
    fn reset_and_snapshot() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });
        registry.get("b").record_failure();
        registry.get("a");

        let names: Vec<_> = registry.snapshot().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a", "b"]);

        assert!(registry.reset("b"));
        assert_eq!(registry.get("b").state(), CircuitState::Closed);
        assert!(!registry.reset("missing"));
    }
}
