//! Resource Admission Control
//!
//! Quota pools shared by every task running in the process. A caller claims
//! a slot in a pool with a token of its choosing; the token doubles as an
//! idempotency key, so allocating it twice holds one slot and releasing it
//! twice is harmless.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Names a quota pool (e.g. a GPU pool).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ResourceNamespace(String);

impl ResourceNamespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of an allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStatus {
    /// The token holds a slot
    Granted,
    /// The pool is at capacity
    Exhausted,
    /// A caller-supplied constraint would be exceeded
    ConstraintViolated,
}

/// Caps the number of held tokens that start with `scope`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResourceConstraint {
    pub scope: String,
    pub limit: usize,
}

/// Constraints applied on top of a pool's capacity.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceConstraintsSpec {
    #[serde(default)]
    pub constraints: Vec<ResourceConstraint>,
}

impl ResourceConstraintsSpec {
    pub fn with_constraint(mut self, scope: impl Into<String>, limit: usize) -> Self {
        self.constraints.push(ResourceConstraint {
            scope: scope.into(),
            limit,
        });
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("unknown resource namespace '{0}'")]
    UnknownNamespace(ResourceNamespace),

    #[error("resource pool lock poisoned")]
    Poisoned,
}

/// Grants and releases quota tokens.
pub trait ResourceManager: Send + Sync {
    /// Claims a slot for `token`; a token already held is granted again.
    fn allocate(
        &self,
        namespace: &ResourceNamespace,
        token: &str,
        constraints: &ResourceConstraintsSpec,
    ) -> Result<AllocationStatus, ResourceError>;

    /// Gives back the slot held by `token`; absent tokens are ignored.
    fn release(&self, namespace: &ResourceNamespace, token: &str) -> Result<(), ResourceError>;
}

#[derive(Debug)]
struct Pool {
    capacity: usize,
    held: BTreeSet<String>,
}

/// Process-wide pools with atomic accounting per `(namespace, token)`.
#[derive(Debug, Default)]
pub struct InMemoryResourcePool {
    pools: Mutex<HashMap<ResourceNamespace, Pool>>,
}

impl InMemoryResourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pool, or resizes an existing one keeping its holds.
    pub fn register(&self, namespace: ResourceNamespace, capacity: usize) -> Result<(), ResourceError> {
        let mut pools = self.lock()?;
        pools
            .entry(namespace)
            .and_modify(|p| p.capacity = capacity)
            .or_insert_with(|| Pool {
                capacity,
                held: BTreeSet::new(),
            });
        Ok(())
    }

    /// Number of tokens currently held in a pool.
    pub fn held(&self, namespace: &ResourceNamespace) -> usize {
        self.lock()
            .ok()
            .and_then(|pools| pools.get(namespace).map(|p| p.held.len()))
            .unwrap_or(0)
    }

    /// Returns true if `token` holds a slot in the pool.
    pub fn is_held(&self, namespace: &ResourceNamespace, token: &str) -> bool {
        self.lock()
            .map(|pools| pools.get(namespace).is_some_and(|p| p.held.contains(token)))
            .unwrap_or(false)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<ResourceNamespace, Pool>>, ResourceError> {
        self.pools.lock().map_err(|_| ResourceError::Poisoned)
    }
}

impl ResourceManager for InMemoryResourcePool {
    fn allocate(
        &self,
        namespace: &ResourceNamespace,
        token: &str,
        constraints: &ResourceConstraintsSpec,
    ) -> Result<AllocationStatus, ResourceError> {
        let mut pools = self.lock()?;
        let pool = pools
            .get_mut(namespace)
            .ok_or_else(|| ResourceError::UnknownNamespace(namespace.clone()))?;

        if pool.held.contains(token) {
            return Ok(AllocationStatus::Granted);
        }

        for constraint in &constraints.constraints {
            let in_scope = pool
                .held
                .iter()
                .filter(|t| t.starts_with(&constraint.scope))
                .count();
            if in_scope >= constraint.limit {
                debug!(
                    "Token '{}' denied in '{}': scope '{}' at limit {}",
                    token, namespace, constraint.scope, constraint.limit
                );
                return Ok(AllocationStatus::ConstraintViolated);
            }
        }

        if pool.held.len() >= pool.capacity {
            debug!("Token '{}' denied: pool '{}' exhausted", token, namespace);
            return Ok(AllocationStatus::Exhausted);
        }

        pool.held.insert(token.to_string());
        debug!(
            "Token '{}' granted in '{}' ({}/{})",
            token,
            namespace,
            pool.held.len(),
            pool.capacity
        );
        Ok(AllocationStatus::Granted)
    }

    fn release(&self, namespace: &ResourceNamespace, token: &str) -> Result<(), ResourceError> {
        let mut pools = self.lock()?;
        if let Some(pool) = pools.get_mut(namespace) {
            if pool.held.remove(token) {
                debug!("Token '{}' released from '{}'", token, namespace);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn gpu_pool(capacity: usize) -> (InMemoryResourcePool, ResourceNamespace) {
        let pool = InMemoryResourcePool::new();
        let ns = ResourceNamespace::new("gpu");
        pool.register(ns.clone(), capacity).unwrap();
        (pool, ns)
    }

    #[test]
    fn test_allocate_is_idempotent() {
        let (pool, ns) = gpu_pool(2);
        let none = ResourceConstraintsSpec::default();

        assert_eq!(pool.allocate(&ns, "a", &none).unwrap(), AllocationStatus::Granted);
        assert_eq!(pool.allocate(&ns, "a", &none).unwrap(), AllocationStatus::Granted);
        assert_eq!(pool.held(&ns), 1);
    }

    #[test]
    fn test_exhausted_pool() {
        let (pool, ns) = gpu_pool(1);
        let none = ResourceConstraintsSpec::default();

        assert_eq!(pool.allocate(&ns, "a", &none).unwrap(), AllocationStatus::Granted);
        assert_eq!(pool.allocate(&ns, "b", &none).unwrap(), AllocationStatus::Exhausted);

        // Holder is still granted at capacity
        assert_eq!(pool.allocate(&ns, "a", &none).unwrap(), AllocationStatus::Granted);

        pool.release(&ns, "a").unwrap();
        assert_eq!(pool.allocate(&ns, "b", &none).unwrap(), AllocationStatus::Granted);
    }

    #[test]
    fn test_release_absent_token_is_noop() {
        let (pool, ns) = gpu_pool(2);
        let none = ResourceConstraintsSpec::default();
        pool.allocate(&ns, "a", &none).unwrap();

        pool.release(&ns, "never-allocated").unwrap();
        assert_eq!(pool.held(&ns), 1);

        pool.release(&ns, "a").unwrap();
        pool.release(&ns, "a").unwrap();
        assert_eq!(pool.held(&ns), 0);

        // Unknown pools are ignored on release
        pool.release(&ResourceNamespace::new("tpu"), "a").unwrap();
    }

    #[test]
    fn test_constraint_violation() {
        let (pool, ns) = gpu_pool(10);
        let spec = ResourceConstraintsSpec::default().with_constraint("team-a/", 1);

        assert_eq!(pool.allocate(&ns, "team-a/1", &spec).unwrap(), AllocationStatus::Granted);
        assert_eq!(
            pool.allocate(&ns, "team-a/2", &spec).unwrap(),
            AllocationStatus::ConstraintViolated
        );
        assert_eq!(pool.allocate(&ns, "team-b/1", &spec).unwrap(), AllocationStatus::Granted);
        assert!(pool.is_held(&ns, "team-b/1"));
        assert!(!pool.is_held(&ns, "team-a/2"));
    }

    #[test]
    fn test_unknown_namespace() {
        let pool = InMemoryResourcePool::new();
        let ns = ResourceNamespace::new("missing");
        let err = pool
            .allocate(&ns, "a", &ResourceConstraintsSpec::default())
            .unwrap_err();
        assert_eq!(err, ResourceError::UnknownNamespace(ns));
    }

    #[test]
    fn test_register_resizes_keeping_holds() {
        let (pool, ns) = gpu_pool(1);
        pool.allocate(&ns, "a", &ResourceConstraintsSpec::default()).unwrap();
        pool.register(ns.clone(), 3).unwrap();
        assert!(pool.is_held(&ns, "a"));
        assert_eq!(
            pool.allocate(&ns, "b", &ResourceConstraintsSpec::default()).unwrap(),
            AllocationStatus::Granted
        );
    }

    #[test]
    fn test_concurrent_allocation_never_oversubscribes() {
        let pool = Arc::new(InMemoryResourcePool::new());
        let ns = ResourceNamespace::new("gpu");
        pool.register(ns.clone(), 5).unwrap();

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let pool = Arc::clone(&pool);
                let ns = ns.clone();
                thread::spawn(move || {
                    pool.allocate(&ns, &format!("t{}", i), &ResourceConstraintsSpec::default())
                        .unwrap()
                })
            })
            .collect();

        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|s| *s == AllocationStatus::Granted)
            .count();

        assert_eq!(granted, 5);
        assert_eq!(pool.held(&ns), 5);
    }
}
