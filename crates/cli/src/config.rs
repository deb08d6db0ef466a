//! Configuration for the `peerlink` binary.
//!
//! Layered as defaults, then the optional `--config` file, then `PEERLINK__*`
//! environment variables, then command-line flags.

use serde::{Deserialize, Serialize};
use std::path::Path;

use peerlink_infra_common::config::ConfigLoader;
use peerlink_infra_common::{ErrorExt, LoggingConfig};
use peerlink_session_core::SessionConfig;

pub const ENV_PREFIX: &str = "PEERLINK";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub logging: LoggingConfig,
    pub session: SessionConfig,
    pub demo: DemoConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Milliseconds to keep a connected session open before cancelling it
    pub hold_ms: u64,
    /// Milliseconds to wait for both parties to connect
    pub connect_timeout_ms: u64,
    /// Local candidates gathered by each loopback connection
    pub local_candidates: u16,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            hold_ms: 1000,
            connect_timeout_ms: 10_000,
            local_candidates: 2,
        }
    }
}

impl CliConfig {
    pub fn load(file: Option<&Path>) -> peerlink_infra_common::Result<Self> {
        let mut loader = ConfigLoader::new().with_env_prefix(ENV_PREFIX);
        if let Some(path) = file {
            loader = loader.with_file(path);
        }
        let config: CliConfig = loader.load::<CliConfig>().with_context("cli", "load_config")?;
        config
            .session
            .validate()
            .map_err(|e| peerlink_infra_common::Error::Validation(e.to_string()))
            .with_context("cli", "validate_session_config")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_file_layers_over_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[logging]").unwrap();
        writeln!(file, "level = \"debug\"").unwrap();
        writeln!(file, "[session]").unwrap();
        writeln!(file, "relay_root = \"rooms/demo\"").unwrap();
        writeln!(file, "[demo]").unwrap();
        writeln!(file, "hold_ms = 50").unwrap();

        let config = CliConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.session.relay_root, "rooms/demo");
        assert_eq!(config.session.resubscribe_attempts, SessionConfig::default().resubscribe_attempts);
        assert_eq!(config.demo.hold_ms, 50);
        assert_eq!(config.demo.local_candidates, 2);
    }

    #[test]
    fn test_invalid_session_config_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[session]").unwrap();
        writeln!(file, "relay_root = \"\"").unwrap();

        let result = CliConfig::load(Some(file.path()));
        assert!(matches!(result, Err(peerlink_infra_common::Error::Validation(_))));
    }
}
