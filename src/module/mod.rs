//! Named service lookup used while constructing workers.

use std::any::{type_name, Any};

use dashmap::DashMap;

use crate::error::ModuleError;

/// Remote sender (`Arc<dyn RemoteSender>`).
pub const REMOTE: &str = "remote";
/// Cluster view (`Arc<ClusterView>`).
pub const CLUSTER: &str = "cluster";
/// Storage writer (`StorageWriter`).
pub const STORAGE: &str = "storage";
/// Health metrics (`Arc<HealthMetrics>`).
pub const TELEMETRY: &str = "telemetry";

/// Registry of cloneable service handles keyed by module name.
///
/// Lookups happen at graph construction only; handles are cloned out so
/// workers never touch the manager on the hot path.
#[derive(Default)]
pub struct ModuleManager {
    modules: DashMap<String, Box<dyn Any + Send + Sync>>,
}

impl ModuleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a service under `name`.
    pub fn register<S>(&self, name: &str, service: S)
    where
        S: Clone + Send + Sync + 'static,
    {
        tracing::debug!(module = name, service = type_name::<S>(), "module registered");
        self.modules.insert(name.to_string(), Box::new(service));
    }

    /// Returns a clone of the service registered under `name`.
    pub fn find<S>(&self, name: &str) -> Result<S, ModuleError>
    where
        S: Clone + Send + Sync + 'static,
    {
        let entry = self
            .modules
            .get(name)
            .ok_or_else(|| ModuleError::NotFound(name.to_string()))?;

        (**entry)
            .downcast_ref::<S>()
            .cloned()
            .ok_or_else(|| ModuleError::TypeMismatch {
                name: name.to_string(),
                requested: type_name::<S>(),
            })
    }

    /// Like `find`, but a missing module is not an error.
    pub fn find_optional<S>(&self, name: &str) -> Result<Option<S>, ModuleError>
    where
        S: Clone + Send + Sync + 'static,
    {
        match self.find(name) {
            Ok(service) => Ok(Some(service)),
            Err(ModuleError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }
}
