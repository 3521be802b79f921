//! Name-indexed plugin registry.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{PluginError, Result};
use crate::metrics::MetricSource;
use crate::strategy::{FixedValue, PassThrough, Strategy};
use crate::target::TargetPlugin;

/// Maps the plugin names policy documents use to live implementations.
///
/// The registry is populated once at startup and shared read-only by every
/// handler, so plain `HashMap`s behind `Arc`s are all it needs.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    targets: HashMap<String, Arc<dyn TargetPlugin>>,
    metric_sources: HashMap<String, Arc<dyn MetricSource>>,
    strategies: HashMap<String, Arc<dyn Strategy>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("targets", &self.targets.keys().collect::<Vec<_>>())
            .field("metric_sources", &self.metric_sources.keys().collect::<Vec<_>>())
            .field("strategies", &self.strategies.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PluginRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry pre-loaded with the built-in strategies
    /// (`pass-through`, `fixed-value`).
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_strategy("pass-through", Arc::new(PassThrough));
        registry.register_strategy("fixed-value", Arc::new(FixedValue));
        registry
    }

    /// Registers a target adapter under `name`, replacing any previous one.
    pub fn register_target(&mut self, name: impl Into<String>, plugin: Arc<dyn TargetPlugin>) {
        self.targets.insert(name.into(), plugin);
    }

    /// Registers a metric source under `name`, replacing any previous one.
    pub fn register_metric_source(&mut self, name: impl Into<String>, plugin: Arc<dyn MetricSource>) {
        self.metric_sources.insert(name.into(), plugin);
    }

    /// Registers a strategy under `name`, replacing any previous one.
    pub fn register_strategy(&mut self, name: impl Into<String>, plugin: Arc<dyn Strategy>) {
        self.strategies.insert(name.into(), plugin);
    }

    /// Looks up a target adapter.
    pub fn target(&self, name: &str) -> Result<Arc<dyn TargetPlugin>> {
        self.targets
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::Unknown {
                kind: "target",
                name: name.to_string(),
            })
    }

    /// Looks up a metric source.
    pub fn metric_source(&self, name: &str) -> Result<Arc<dyn MetricSource>> {
        self.metric_sources
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::Unknown {
                kind: "metric source",
                name: name.to_string(),
            })
    }

    /// Looks up a strategy.
    pub fn strategy(&self, name: &str) -> Result<Arc<dyn Strategy>> {
        self.strategies
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::Unknown {
                kind: "strategy",
                name: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{InMemoryMetricSource, InMemoryTarget};

    #[test]
    fn builtins_are_registered() {
        let registry = PluginRegistry::with_builtins();
        assert!(registry.strategy("pass-through").is_ok());
        assert!(registry.strategy("fixed-value").is_ok());
        assert!(registry.strategy("does-not-exist").is_err());
    }

    #[test]
    fn lookup_errors_name_the_kind() {
        let registry = PluginRegistry::new();
        let result = registry.target("nomad-target");
        let err = match result {
            Err(err) => err,
            Ok(_) => panic!("expected lookup of an unregistered target to fail"),
        };
        assert_eq!(err.to_string(), "unknown target plugin: nomad-target");
    }

    #[test]
    fn registered_plugins_resolve() {
        let mut registry = PluginRegistry::new();
        registry.register_target("mem", Arc::new(InMemoryTarget::with_count(3)));
        registry.register_metric_source("mem", Arc::new(InMemoryMetricSource::new()));
        assert!(registry.target("mem").is_ok());
        assert!(registry.metric_source("mem").is_ok());
    }
}
