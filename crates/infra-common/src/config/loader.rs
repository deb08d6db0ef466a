use crate::errors::types::{Error, Result};
use config::{Config, Environment, File, FileFormat};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Builds a typed configuration from defaults, an optional file and the
/// environment, in that order of precedence (later wins).
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    env_prefix: Option<String>,
    file: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a loader that only applies defaults
    pub fn new() -> Self {
        Self {
            env_prefix: None,
            file: None,
        }
    }

    /// Read overrides from `<PREFIX>__<KEY>` environment variables
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Layer a configuration file over the defaults. The file must exist.
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Resolve all layers into `T`
    pub fn load<T>(&self) -> Result<T>
    where
        T: DeserializeOwned + Serialize + Default,
    {
        let defaults = serde_json::to_string(&T::default())
            .map_err(|e| Error::Config(format!("Failed to serialize defaults: {}", e)))?;

        let mut builder = Config::builder().add_source(File::from_str(&defaults, FileFormat::Json));

        if let Some(path) = &self.file {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "Configuration file not found: {}",
                    path.display()
                )));
            }
            tracing::debug!("Loading configuration file {}", path.display());
            builder = builder.add_source(File::from(path.as_path()).required(true));
        }

        if let Some(prefix) = &self.env_prefix {
            builder = builder.add_source(
                Environment::with_prefix(prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
