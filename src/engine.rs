//! Rewrite engine for semql.
//!
//! This module ties a reloadable [`OperatorRegistry`] to the rewrite options
//! from [`Config`]. An [`Engine`] is `Send + Sync` and is meant to be shared:
//! every rewrite pins the current registry snapshot once, so a concurrent
//! [`Engine::reload`] never affects a rewrite already in flight.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::error::SemqlResult;
use crate::registry::{OperatorRegistry, OperatorSource, RegistrySnapshot, sources_for};
use crate::rewriter::{Rewrite, Rewriter};

/// A configured rewrite engine.
#[derive(Debug)]
pub struct Engine {
    config: Config,
    registry: OperatorRegistry,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Engine {
    /// Build an engine from configuration, loading builtins and every
    /// configured operator path.
    ///
    /// # Example
    ///
    /// ```
    /// use semql::{Config, Engine};
    ///
    /// let engine = Engine::new(Config::default());
    /// let out = engine.rewrite("SELECT * FROM t WHERE col MEANS 'urgent'").unwrap();
    /// assert_eq!(out.sql, "SELECT * FROM t WHERE semantic_matches(col, 'urgent')");
    /// ```
    pub fn new(config: Config) -> Self {
        Self::with_operator_paths(config, &[])
    }

    /// Like [`Engine::new`], with extra declaration paths loaded last.
    pub fn with_operator_paths(config: Config, extra: &[PathBuf]) -> Self {
        let sources = sources_for(&config.registry, extra);
        Self::with_sources(config, sources)
    }

    /// Build an engine over an explicit source list.
    pub fn with_sources(config: Config, sources: Vec<Box<dyn OperatorSource>>) -> Self {
        let registry = OperatorRegistry::new(sources, config.registry.tie_break);
        Self { config, registry }
    }

    /// Rewrite one query against the current snapshot.
    pub fn rewrite(&self, sql: &str) -> SemqlResult<Rewrite> {
        let snapshot = self.registry.snapshot();
        Rewriter::new(&snapshot, &self.config.rewrite).rewrite(sql)
    }

    /// Re-read every operator source and swap in the new snapshot.
    pub fn reload(&self) -> Arc<RegistrySnapshot> {
        self.registry.reload()
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.registry.snapshot()
    }

    pub fn registry(&self) -> &OperatorRegistry {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BuiltinSource, InlineSource};

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_engine_is_send_sync() {
        assert_send_sync::<Engine>();
    }

    #[test]
    fn test_default_engine_rewrites() {
        let engine = Engine::default();
        let out = engine.rewrite("SELECT col EXTRACTS 'price' FROM t").unwrap();
        assert_eq!(out.sql, "SELECT semantic_extract(col, 'price') FROM t");
        assert_eq!(out.snapshot_version, engine.snapshot().version());
    }

    #[test]
    fn test_without_builtins() {
        let config = Config::builder().include_builtins(false).build();
        let engine = Engine::new(config);
        assert!(engine.snapshot().is_empty());
        let sql = "SELECT * FROM t WHERE col MEANS 'x'";
        assert_eq!(engine.rewrite(sql).unwrap().sql, sql);
    }

    #[test]
    fn test_custom_functions() {
        let config = Config::builder()
            .collection_function("ARRAY_AGG")
            .build();
        let engine = Engine::with_sources(config, vec![Box::new(BuiltinSource)]);
        let out = engine.rewrite("SELECT SUMMARIZE(body) FROM t").unwrap();
        assert_eq!(out.sql, "SELECT semantic_summarize(ARRAY_AGG(body)) FROM t");
    }

    #[test]
    fn test_reload_keeps_rewriting() {
        let engine = Engine::with_sources(
            Config::default(),
            vec![
                Box::new(BuiltinSource),
                Box::new(InlineSource::new("user", "shout: {patterns: ['{{a}} LOUDLY'], output: 'upper({{a}})'}")),
            ],
        );
        let before = engine.rewrite("SELECT name LOUDLY FROM t").unwrap();
        let snapshot = engine.reload();
        let after = engine.rewrite("SELECT name LOUDLY FROM t").unwrap();
        assert_eq!(before.sql, "SELECT upper(name) FROM t");
        assert_eq!(before.sql, after.sql);
        assert_eq!(after.snapshot_version, snapshot.version());
    }
}
