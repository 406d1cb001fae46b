//! Engine configuration
//!
//! Read from `semql.toml`:
//!
//! ```toml
//! [rewrite]
//! max_query_bytes = 1048576
//! collection_function = "LIST"
//! dimension_lookup_function = "dimension_bucket"
//!
//! [registry]
//! include_builtins = true
//! tie_break = "declaration"
//! operator_paths = ["ops/"]
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{SemqlError, SemqlResult};

/// Config file name looked up in the user config directory.
pub const CONFIG_FILE: &str = "semql.toml";

/// Main engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub rewrite: RewriteOptions,

    #[serde(default)]
    pub registry: RegistryConfig,
}

/// Options for a single rewrite pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RewriteOptions {
    /// Queries larger than this are rejected before tokenizing
    pub max_query_bytes: usize,

    /// Function that gathers a context argument into a collection
    pub collection_function: String,

    /// Function that maps a row value onto a dimension assignment
    pub dimension_lookup_function: String,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        Self {
            max_query_bytes: 1024 * 1024,
            collection_function: "LIST".to_string(),
            dimension_lookup_function: "dimension_bucket".to_string(),
        }
    }
}

/// How equal-priority patterns are ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TieBreak {
    /// Earlier declaration wins
    #[default]
    Declaration,
    /// Alphabetically smaller operator name wins
    Alphabetical,
}

/// Where operators are loaded from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RegistryConfig {
    /// Load the bundled operator set first
    pub include_builtins: bool,

    pub tie_break: TieBreak,

    /// Declaration files or directories, loaded in order after the builtins
    pub operator_paths: Vec<PathBuf>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            include_builtins: true,
            tie_break: TieBreak::Declaration,
            operator_paths: Vec::new(),
        }
    }
}

impl Config {
    /// Create a new configuration builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Parse configuration from TOML text
    pub fn from_toml(text: &str) -> SemqlResult<Self> {
        toml::from_str(text).map_err(|e| SemqlError::config(e.to_string()))
    }

    /// Load a config file; relative operator paths resolve against its directory
    pub fn from_path(path: &Path) -> SemqlResult<Self> {
        let content = fs::read_to_string(path)?;
        let mut config = Self::from_toml(&content)
            .map_err(|e| SemqlError::config(format!("{}: {}", path.display(), e)))?;
        if let Some(base) = path.parent() {
            for op_path in &mut config.registry.operator_paths {
                if op_path.is_relative() {
                    *op_path = base.join(&*op_path);
                }
            }
        }
        Ok(config)
    }

    /// Default config file location, e.g. `~/.config/semql/semql.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("semql").join(CONFIG_FILE))
    }

    /// Load the given file, or the default location if present, or defaults
    pub fn discover(explicit: Option<&Path>) -> SemqlResult<Self> {
        if let Some(path) = explicit {
            return Self::from_path(path);
        }
        match Self::default_path() {
            Some(path) if path.is_file() => {
                tracing::debug!(path = %path.display(), "loading config");
                Self::from_path(&path)
            }
            _ => Ok(Self::default()),
        }
    }
}

/// Builder for Config
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the query size limit
    pub fn max_query_bytes(mut self, limit: usize) -> Self {
        self.config.rewrite.max_query_bytes = limit;
        self
    }

    /// Set the collection function used for aggregate and dimension operators
    pub fn collection_function(mut self, name: impl Into<String>) -> Self {
        self.config.rewrite.collection_function = name.into();
        self
    }

    /// Set the dimension lookup function
    pub fn dimension_lookup_function(mut self, name: impl Into<String>) -> Self {
        self.config.rewrite.dimension_lookup_function = name.into();
        self
    }

    /// Include or skip the bundled operators
    pub fn include_builtins(mut self, include: bool) -> Self {
        self.config.registry.include_builtins = include;
        self
    }

    pub fn tie_break(mut self, tie_break: TieBreak) -> Self {
        self.config.registry.tie_break = tie_break;
        self
    }

    /// Add an operator declaration file or directory
    pub fn operator_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.registry.operator_paths.push(path.into());
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.rewrite.collection_function, "LIST");
        assert!(config.registry.include_builtins);
    }

    #[test]
    fn test_partial_file() {
        let config = Config::from_toml(
            r#"
[rewrite]
max_query_bytes = 64

[registry]
tie_break = "alphabetical"
operator_paths = ["ops"]
"#,
        )
        .unwrap();
        assert_eq!(config.rewrite.max_query_bytes, 64);
        assert_eq!(config.rewrite.dimension_lookup_function, "dimension_bucket");
        assert_eq!(config.registry.tie_break, TieBreak::Alphabetical);
        assert_eq!(config.registry.operator_paths, vec![PathBuf::from("ops")]);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = Config::from_toml("[rewrite]\nmax_bytes = 1\n").unwrap_err();
        assert!(matches!(err, SemqlError::Config(_)));
    }

    #[test]
    fn test_builder() {
        let config = Config::builder()
            .max_query_bytes(10)
            .include_builtins(false)
            .operator_path("a.yaml")
            .build();
        assert_eq!(config.rewrite.max_query_bytes, 10);
        assert!(!config.registry.include_builtins);
        assert_eq!(config.registry.operator_paths.len(), 1);
    }

    #[test]
    fn test_from_path_resolves_relative() {
        let dir = std::env::temp_dir().join(format!("semql-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, "[registry]\noperator_paths = [\"ops\"]\n").unwrap();
        let config = Config::from_path(&path).unwrap();
        assert_eq!(config.registry.operator_paths, vec![dir.join("ops")]);
        fs::remove_dir_all(&dir).ok();
    }
}
