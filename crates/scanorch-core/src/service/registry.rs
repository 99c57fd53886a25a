//! Service registry -- a named collection of available service adapters.
//!
//! Spec §9: "Inheritance-based service hierarchy... collapsed to the flat
//! collaborator interface... services are values registered in a lookup
//! table keyed by name; no subtyping."

use std::collections::HashMap;
use std::sync::Arc;

use super::trait_def::Service;

/// A collection of registered [`Service`] implementations, keyed by name.
///
/// Stored as `Arc<dyn Service>` rather than `Box<dyn Service>` so the
/// orchestrator can hand a cheap, `'static`, independently-owned handle to
/// each spawned executor task -- that's what gives one service's panic or
/// timeout its isolation from the others (spec §4.H "failure containment").
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<dyn Service>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service adapter under the name returned by
    /// [`Service::name`]. Replaces any existing registration for that name.
    pub fn register(&mut self, service: impl Service + 'static) -> Option<Arc<dyn Service>> {
        let name = service.name().to_string();
        self.services.insert(name, Arc::new(service))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.services.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::fakes::FakeService;

    #[test]
    fn registry_starts_empty() {
        let registry = ServiceRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn register_and_get() {
        let mut registry = ServiceRegistry::new();
        let old = registry.register(FakeService::succeeding("accessibility"));
        assert!(old.is_none());
        let found = registry.get("accessibility");
        assert!(found.is_some());
        assert_eq!(found.unwrap().name(), "accessibility");
    }

    #[test]
    fn register_replaces_existing() {
        let mut registry = ServiceRegistry::new();
        registry.register(FakeService::succeeding("accessibility"));
        let old = registry.register(FakeService::succeeding("accessibility"));
        assert!(old.is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn get_missing_returns_none() {
        let registry = ServiceRegistry::new();
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn list_returns_all_names() {
        let mut registry = ServiceRegistry::new();
        registry.register(FakeService::succeeding("accessibility"));
        registry.register(FakeService::succeeding("backlinks"));
        let mut names = registry.list();
        names.sort();
        assert_eq!(names, vec!["accessibility", "backlinks"]);
    }
}
