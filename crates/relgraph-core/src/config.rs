//! Graph configuration
//!
//! Loaded from TOML; every section and key is optional and falls back to the
//! defaults below.
//!
//! ```
//! use relgraph_core::config::GraphConfig;
//!
//! let config = GraphConfig::from_toml_str(
//!     r#"
//!     [merge]
//!     await_notifications = false
//!     "#,
//! )
//! .unwrap();
//! assert!(!config.merge.await_notifications);
//! assert_eq!(config.mapping.max_concurrent_sub_operations, 8);
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::errors::{GraphError, Result};
use crate::logging_facility::Profile;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub logging: LoggingConfig,
    pub merge: MergeConfig,
    pub mapping: MappingConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub profile: Profile,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Gate merge completion on the store's notification stream
    pub await_notifications: bool,
    /// Capacity of each change-notification broadcast channel
    pub notification_buffer: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            await_notifications: true,
            notification_buffer: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// Upper bound on relationship sub-operations running at once
    pub max_concurrent_sub_operations: usize,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sub_operations: 8,
        }
    }
}

impl GraphConfig {
    /// Parse and validate a TOML document
    ///
    /// # Errors
    ///
    /// Returns `Config` if the document is malformed or a bound is zero.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: GraphConfig = toml::from_str(source).map_err(|e| GraphError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file cannot be read or fails validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| GraphError::Config {
            message: format!("{}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&source)
    }

    fn validate(&self) -> Result<()> {
        if self.merge.notification_buffer == 0 {
            return Err(GraphError::Config {
                message: "merge.notification_buffer must be greater than zero".to_string(),
            });
        }
        if self.mapping.max_concurrent_sub_operations == 0 {
            return Err(GraphError::Config {
                message: "mapping.max_concurrent_sub_operations must be greater than zero"
                    .to_string(),
            });
        }
        Ok(())
    }
}
