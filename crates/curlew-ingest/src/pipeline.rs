// crates/curlew-ingest/src/pipeline.rs
// ============================================================================
// Module: Filter Pipeline
// Description: Ordered chain of reading transformers with hot reload.
// Purpose: Let deployments reshape, drop, or synthesize readings between
//          the ingest queue and the storage engine.
// Dependencies: curlew-core, serde_json, thiserror
// ============================================================================

//! ## Overview
//! Filters are built from a name-keyed factory registry and chained in
//! configuration order. A batch traverses the chain as an owned
//! [`ReadingSet`]; each filter consumes its input and returns the set it
//! wants downstream, so dropping, rewriting, and synthesizing readings all
//! fall out of ownership transfer. The scheduler holds the pipeline mutex
//! for a batch's whole traversal, which is also what makes teardown during
//! hot reconfiguration safe.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;

use curlew_core::ReadingSet;
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Pipeline construction failure.
#[derive(Debug, Error, Clone)]
pub enum PipelineError {
    /// No factory registered under the requested name.
    #[error("unknown filter: {0}")]
    UnknownFilter(String),
    /// A factory rejected its configuration.
    #[error("filter {name} rejected its configuration: {reason}")]
    Config {
        /// Filter name.
        name: String,
        /// Factory-reported reason.
        reason: String,
    },
}

// ============================================================================
// SECTION: Filter Contract
// ============================================================================

/// One stage of the ingest pipeline.
pub trait Filter: Send {
    /// Registered name of the filter instance.
    fn name(&self) -> &str;

    /// Consumes a batch and returns the batch to pass downstream.
    fn ingest(&mut self, set: ReadingSet) -> ReadingSet;

    /// Applies a configuration change to a running instance.
    fn reconfigure(&mut self, _config: &Value) {}
}

/// Builds a filter instance from its configuration.
pub type FilterFactory = fn(&Value) -> Result<Box<dyn Filter>, PipelineError>;

/// Name-keyed factory registry.
#[derive(Default)]
pub struct FilterRegistry {
    /// Registered factories.
    factories: HashMap<String, FilterFactory>,
}

impl FilterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under a name, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, factory: FilterFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Builds a pipeline from ordered `(name, config)` entries.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] when a name is unknown or a factory
    /// rejects its configuration.
    pub fn build(&self, entries: &[(String, Value)]) -> Result<FilterPipeline, PipelineError> {
        let mut filters = Vec::with_capacity(entries.len());
        for (name, config) in entries {
            let factory = self
                .factories
                .get(name)
                .ok_or_else(|| PipelineError::UnknownFilter(name.clone()))?;
            filters.push(factory(config)?);
        }
        Ok(FilterPipeline {
            filters,
        })
    }
}

// ============================================================================
// SECTION: Pipeline
// ============================================================================

/// Ordered filter chain.
#[derive(Default)]
pub struct FilterPipeline {
    /// Chain in execution order.
    filters: Vec<Box<dyn Filter>>,
}

impl FilterPipeline {
    /// True when no filter is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Names of the configured filters, in order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.filters.iter().map(|filter| filter.name()).collect()
    }

    /// Passes a batch through the chain, transferring ownership stage to
    /// stage.
    #[must_use]
    pub fn run(&mut self, set: ReadingSet) -> ReadingSet {
        let mut current = set;
        for filter in &mut self.filters {
            current = filter.ingest(current);
        }
        current
    }

    /// Delegates a configuration change to the named filter.
    ///
    /// Returns whether a filter with that name was found.
    pub fn reconfigure_filter(&mut self, name: &str, config: &Value) -> bool {
        let mut found = false;
        for filter in &mut self.filters {
            if filter.name() == name {
                filter.reconfigure(config);
                found = true;
            }
        }
        found
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "Test-only assertions are permitted.")]

    use curlew_core::Reading;
    use curlew_core::UserTimestamp;
    use serde_json::json;

    use super::*;

    struct Tag {
        name: String,
        label: String,
    }

    impl Filter for Tag {
        fn name(&self) -> &str {
            &self.name
        }

        fn ingest(&mut self, set: ReadingSet) -> ReadingSet {
            set.into_readings()
                .into_iter()
                .map(|reading| {
                    let mut payload = reading.payload.clone();
                    payload["tag"] = json!(self.label.clone());
                    Reading::new(reading.asset_code, reading.user_ts, payload).unwrap()
                })
                .collect()
        }

        fn reconfigure(&mut self, config: &Value) {
            if let Some(label) = config.get("label").and_then(Value::as_str) {
                self.label = label.to_string();
            }
        }
    }

    fn tag_factory(config: &Value) -> Result<Box<dyn Filter>, PipelineError> {
        Ok(Box::new(Tag {
            name: "tag".to_string(),
            label: config.get("label").and_then(Value::as_str).unwrap_or("x").to_string(),
        }))
    }

    fn drop_factory(_config: &Value) -> Result<Box<dyn Filter>, PipelineError> {
        struct DropAll;
        impl Filter for DropAll {
            fn name(&self) -> &str {
                "drop"
            }

            fn ingest(&mut self, _set: ReadingSet) -> ReadingSet {
                ReadingSet::default()
            }
        }
        Ok(Box::new(DropAll))
    }

    fn sample() -> ReadingSet {
        ReadingSet::new(vec![
            Reading::new("a", UserTimestamp::Now, json!({"v": 1})).unwrap(),
        ])
    }

    #[test]
    fn filters_run_in_configuration_order() {
        let mut registry = FilterRegistry::new();
        registry.register("tag", tag_factory);
        let mut pipeline = registry
            .build(&[
                ("tag".to_string(), json!({"label": "first"})),
                ("tag".to_string(), json!({"label": "second"})),
            ])
            .unwrap();
        let out = pipeline.run(sample());
        // The later filter overwrites the tag: order is configuration order.
        assert_eq!(out.readings()[0].payload["tag"], json!("second"));
    }

    #[test]
    fn a_filter_may_drop_the_whole_batch() {
        let mut registry = FilterRegistry::new();
        registry.register("drop", drop_factory);
        let mut pipeline = registry.build(&[("drop".to_string(), json!({}))]).unwrap();
        assert!(pipeline.run(sample()).is_empty());
    }

    #[test]
    fn unknown_filter_fails_the_build() {
        let registry = FilterRegistry::new();
        let result = registry.build(&[("nope".to_string(), json!({}))]);
        assert!(matches!(result, Err(PipelineError::UnknownFilter(_))));
    }

    #[test]
    fn reconfigure_reaches_the_named_filter() {
        let mut registry = FilterRegistry::new();
        registry.register("tag", tag_factory);
        let mut pipeline =
            registry.build(&[("tag".to_string(), json!({"label": "old"}))]).unwrap();
        assert!(pipeline.reconfigure_filter("tag", &json!({"label": "new"})));
        assert!(!pipeline.reconfigure_filter("absent", &json!({})));
        let out = pipeline.run(sample());
        assert_eq!(out.readings()[0].payload["tag"], json!("new"));
    }
}
