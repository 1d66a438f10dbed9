//! Service registry: the process-wide table of domain services.
//!
//! Readers take an `Arc` snapshot and never block. Writes happen only at
//! configuration load or an explicit reload, and swap the whole table.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use config_rs::GatewayConfig;
use tracing::info;

use crate::error::GatewayError;
use crate::models::ServiceDescriptor;

/// Immutable view of the registry, in insertion order
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    services: Vec<Arc<ServiceDescriptor>>,
}

impl RegistrySnapshot {
    pub fn all(&self) -> &[Arc<ServiceDescriptor>] {
        &self.services
    }

    pub fn lookup(&self, name: &str) -> Option<&Arc<ServiceDescriptor>> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

pub struct ServiceRegistry {
    current: ArcSwap<RegistrySnapshot>,
    // serializes writers; readers never touch it
    write_lock: Mutex<()>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RegistrySnapshot::default()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn from_descriptors(descriptors: Vec<ServiceDescriptor>) -> Result<Self, GatewayError> {
        let registry = Self::new();
        for descriptor in descriptors {
            registry.register(descriptor)?;
        }
        Ok(registry)
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        Self::from_descriptors(descriptors_from_config(config)?)
    }

    /// Adds a service; names are unique
    pub fn register(&self, descriptor: ServiceDescriptor) -> Result<(), GatewayError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.current.load_full();

        if current.lookup(&descriptor.name).is_some() {
            return Err(GatewayError::DuplicateService(descriptor.name));
        }

        let mut services = current.services.clone();
        info!(service = %descriptor.name, base_url = %descriptor.base_url, "Registered domain service");
        services.push(Arc::new(descriptor));
        self.current.store(Arc::new(RegistrySnapshot { services }));
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<ServiceDescriptor>, GatewayError> {
        self.current
            .load()
            .lookup(name)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownService(name.to_string()))
    }

    /// All descriptors in insertion order
    pub fn all(&self) -> Vec<Arc<ServiceDescriptor>> {
        self.current.load().services.clone()
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.load_full()
    }

    /// Replaces the whole table. Nothing changes if `descriptors` contains a
    /// duplicate name.
    pub fn reload(&self, descriptors: Vec<ServiceDescriptor>) -> Result<Arc<RegistrySnapshot>, GatewayError> {
        let mut seen = HashSet::new();
        for descriptor in &descriptors {
            if !seen.insert(descriptor.name.as_str()) {
                return Err(GatewayError::DuplicateService(descriptor.name.clone()));
            }
        }

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot = Arc::new(RegistrySnapshot {
            services: descriptors.into_iter().map(Arc::new).collect(),
        });
        self.current.store(snapshot.clone());
        info!(services = snapshot.len(), "Service registry reloaded");
        Ok(snapshot)
    }
}

/// Converts the `[[service]]` tables into descriptors
pub fn descriptors_from_config(config: &GatewayConfig) -> Result<Vec<ServiceDescriptor>, GatewayError> {
    let default_timeout = Duration::from_millis(config.dispatch.default_timeout_ms);
    config
        .services
        .iter()
        .map(|entry| ServiceDescriptor::from_entry(entry, default_timeout))
        .collect()
}
