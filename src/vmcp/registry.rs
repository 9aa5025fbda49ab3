//! Backend registries.
//!
//! A registry is read-many, write-rare. [`DynamicRegistry`] bumps a monotonic
//! version on every mutation; discovery caches compare that version to detect
//! stale entries without being notified.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use super::{Backend, BackendTarget};

/// Read access to the set of known backends
pub trait BackendRegistry: Send + Sync {
    /// Look up a backend by ID
    fn get(&self, backend_id: &str) -> Option<Backend>;

    /// Snapshot of every backend (no defined order)
    fn list(&self) -> Vec<Backend>;

    /// Number of backends
    fn count(&self) -> usize;

    /// Monotonic mutation counter. Starts at 0.
    fn version(&self) -> u64;
}

/// Registry fixed at construction. Its version never changes.
#[derive(Debug, Clone, Default)]
pub struct ImmutableRegistry {
    backends: HashMap<String, Backend>,
}

impl ImmutableRegistry {
    /// Build from a list; later duplicates replace earlier ones.
    #[must_use]
    pub fn new(backends: Vec<Backend>) -> Self {
        Self {
            backends: backends.into_iter().map(|b| (b.id.clone(), b)).collect(),
        }
    }
}

impl BackendRegistry for ImmutableRegistry {
    fn get(&self, backend_id: &str) -> Option<Backend> {
        self.backends.get(backend_id).cloned()
    }

    fn list(&self) -> Vec<Backend> {
        self.backends.values().cloned().collect()
    }

    fn count(&self) -> usize {
        self.backends.len()
    }

    fn version(&self) -> u64 {
        0
    }
}

#[derive(Debug, Default)]
struct DynamicState {
    backends: HashMap<String, Backend>,
    version: u64,
}

/// Mutable registry with version tracking.
///
/// Every `upsert` and `remove` increments the version, even when nothing
/// observable changed, so callers never miss a mutation.
#[derive(Debug, Default)]
pub struct DynamicRegistry {
    state: RwLock<DynamicState>,
}

impl DynamicRegistry {
    /// Seed with initial backends. The version starts at 0 regardless.
    #[must_use]
    pub fn new(backends: Vec<Backend>) -> Self {
        Self {
            state: RwLock::new(DynamicState {
                backends: backends.into_iter().map(|b| (b.id.clone(), b)).collect(),
                version: 0,
            }),
        }
    }

    /// Insert or replace a backend
    pub fn upsert(&self, backend: Backend) -> crate::Result<()> {
        if backend.id.is_empty() {
            return Err(crate::Error::Config("backend ID cannot be empty".to_string()));
        }
        let mut state = self.state.write();
        debug!(backend = %backend.id, "Registry upsert");
        state.backends.insert(backend.id.clone(), backend);
        state.version += 1;
        Ok(())
    }

    /// Remove a backend. Removing an unknown ID still bumps the version.
    pub fn remove(&self, backend_id: &str) -> crate::Result<()> {
        let mut state = self.state.write();
        state.backends.remove(backend_id);
        state.version += 1;
        debug!(backend = %backend_id, version = state.version, "Registry remove");
        Ok(())
    }
}

impl BackendRegistry for DynamicRegistry {
    fn get(&self, backend_id: &str) -> Option<Backend> {
        self.state.read().backends.get(backend_id).cloned()
    }

    fn list(&self) -> Vec<Backend> {
        self.state.read().backends.values().cloned().collect()
    }

    fn count(&self) -> usize {
        self.state.read().backends.len()
    }

    fn version(&self) -> u64 {
        self.state.read().version
    }
}

/// Routing target for a backend (no capability rename applied).
#[must_use]
pub fn backend_to_target(backend: &Backend) -> BackendTarget {
    BackendTarget {
        workload_id: backend.id.clone(),
        workload_name: backend.name.clone(),
        base_url: backend.base_url.clone(),
        transport_type: backend.transport_type.clone(),
        original_capability_name: None,
        session_affinity: false,
        health_status: backend.health_status,
        metadata: backend.metadata.clone(),
    }
}
