//! Engine configuration and its TOML form.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::reasoning::{DeletionStrategy, EqualityMode};

/// Configuration for an [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Engine threads in the worker pool (at least 1).
    pub worker_threads: usize,
    /// How `owl:sameAs` is treated.
    pub equality: EqualityMode,
    /// Strategy used by [`Engine::apply_rules_incrementally`](crate::engine::Engine::apply_rules_incrementally).
    pub deletion_strategy: DeletionStrategy,
    /// Attach a [`TracingMonitor`](crate::reasoning::TracingMonitor) when no
    /// other monitor is given.
    pub trace_reasoning: bool,
    /// Entries reserved up front in each round list.
    pub queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            equality: EqualityMode::Off,
            deletion_strategy: DeletionStrategy::DRed,
            trace_reasoning: false,
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::InvalidConfig {
                message: "worker_threads must be > 0".into(),
            });
        }
        Ok(())
    }
}

/// The `[engine]` table of a configuration or program file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default)]
    pub equality: EqualityMode,
    #[serde(default)]
    pub deletion_strategy: DeletionStrategy,
    #[serde(default)]
    pub trace_reasoning: bool,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get().min(8))
}
fn default_queue_capacity() -> usize {
    1024
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for ConfigFile {
    fn from(config: &EngineConfig) -> Self {
        Self {
            worker_threads: config.worker_threads,
            equality: config.equality,
            deletion_strategy: config.deletion_strategy,
            trace_reasoning: config.trace_reasoning,
            queue_capacity: config.queue_capacity,
        }
    }
}

impl ConfigFile {
    pub fn to_engine_config(&self) -> Result<EngineConfig, ConfigError> {
        let config = EngineConfig {
            worker_threads: self.worker_threads,
            equality: self.equality,
            deletion_strategy: self.deletion_strategy,
            trace_reasoning: self.trace_reasoning,
            queue_capacity: self.queue_capacity,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ConfigRead {
            path: path.display().to_string(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::ConfigParse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Save to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::ConfigParse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::ConfigWrite {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::ConfigWrite {
            path: path.display().to_string(),
            source: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let file: ConfigFile = toml::from_str("equality = \"no-una\"\ndeletion_strategy = \"fbf\"").unwrap();
        assert_eq!(file.equality, EqualityMode::NoUna);
        assert_eq!(file.deletion_strategy, DeletionStrategy::Fbf);
        assert_eq!(file.queue_capacity, 1024);
        assert!(file.worker_threads >= 1);
    }

    #[test]
    fn zero_threads_is_rejected() {
        let file = ConfigFile {
            worker_threads: 0,
            ..ConfigFile::default()
        };
        assert!(matches!(
            file.to_engine_config(),
            Err(ConfigError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("engine.toml");
        let file = ConfigFile {
            worker_threads: 3,
            trace_reasoning: true,
            ..ConfigFile::default()
        };
        file.save(&path).unwrap();
        assert_eq!(ConfigFile::load(&path).unwrap(), file);
    }
}
