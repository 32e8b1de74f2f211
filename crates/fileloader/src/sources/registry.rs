//! Process-lifetime registry of source configurations
//!
//! Sources are registered once at startup and matched against incoming
//! filenames in declaration order (first match wins, so more specific
//! patterns must be registered before catch-alls).

use super::SourceConfig;
use fileloader_common::{LoadError, LoadResult};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    sources: Vec<Arc<SourceConfig>>,
}

impl SourceRegistry {
    /// Build a registry, validating every source and rejecting duplicate
    /// source names.
    pub fn new(sources: Vec<SourceConfig>) -> LoadResult<Self> {
        let mut seen = std::collections::HashSet::new();
        for source in &sources {
            source.validate()?;
            if !seen.insert(source.name.clone()) {
                return Err(LoadError::config(format!(
                    "source '{}' is registered more than once",
                    source.name
                )));
            }
        }
        Ok(Self {
            sources: sources.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<Arc<SourceConfig>> {
        self.sources.iter().find(|s| s.name == name).cloned()
    }

    /// First source whose pattern matches the base filename.
    pub fn find_for_file(&self, filename: &str) -> Option<Arc<SourceConfig>> {
        let matched = self.sources.iter().find(|s| s.matches(filename)).cloned();
        if let Some(ref source) = matched {
            debug!(filename, source = %source.name, "Matched file to source");
        }
        matched
    }

    /// Restrict the registry to one named source (`run --source NAME`).
    pub fn restricted_to(&self, name: &str) -> LoadResult<SourceRegistry> {
        let source = self.get(name).ok_or_else(|| {
            LoadError::config(format!("unknown source '{name}' requested via --source"))
        })?;
        Ok(SourceRegistry {
            sources: vec![source],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{FieldSpec, SemanticType, SourceConfig};

    fn source(name: &str, pattern: &str) -> SourceConfig {
        SourceConfig::builder(name)
            .pattern(pattern)
            .target_table(name)
            .field(FieldSpec::new("id", SemanticType::Integer))
            .grain(&["id"])
            .build()
            .unwrap()
    }

    #[test]
    fn first_match_wins() {
        let registry = SourceRegistry::new(vec![
            source("orders_eu", r"^orders_eu.*\.csv$"),
            source("orders", r"^orders.*\.csv$"),
        ])
        .unwrap();

        let matched = registry.find_for_file("orders_eu_2026.csv").unwrap();
        assert_eq!(matched.name, "orders_eu");
        let matched = registry.find_for_file("orders_us.csv").unwrap();
        assert_eq!(matched.name, "orders");
        assert!(registry.find_for_file("customers.csv").is_none());
    }

    #[test]
    fn duplicate_names_rejected() {
        let err = SourceRegistry::new(vec![
            source("orders", r"^a"),
            source("orders", r"^b"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn restriction_to_unknown_source_fails() {
        let registry = SourceRegistry::new(vec![source("orders", r"^orders")]).unwrap();
        assert!(registry.restricted_to("customers").is_err());
        let restricted = registry.restricted_to("orders").unwrap();
        assert_eq!(restricted.len(), 1);
    }
}
