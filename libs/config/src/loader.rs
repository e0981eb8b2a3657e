//! Configuration loading
//!
//! Sources, lowest precedence first: built-in defaults, an optional TOML
//! file, then `CONDUIT__`-prefixed environment variables with `__`
//! between path segments (`CONDUIT__SERVER__WORKER_POOL_SIZE=32`).
//! List values in the environment are comma separated.

use crate::settings::ConduitConfig;
use anyhow::{Context, Result};
use config_crate::{Config, Environment, File, FileFormat};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

pub const ENV_PREFIX: &str = "CONDUIT";
pub const ENV_SEPARATOR: &str = "__";

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("bus.nsqd_addrs")
        .with_list_parse_key("bus.lookupd_addrs")
}

impl ConduitConfig {
    /// Load from `path` (if given) and the process environment, then validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`ConduitConfig::load`], reading overrides from `env` instead of
    /// the process environment when it is `Some`
    pub fn load_with_env(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!("Loading configuration: {:?}", path);
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        } else {
            debug!("No configuration file, using defaults");
        }
        builder = builder.add_source(environment().source(env));

        let config = builder.build().context("Failed to build configuration")?;
        let mut config: ConduitConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.expand_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults, without environment overrides
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: ConduitConfig =
            toml::from_str(content).context("Failed to parse configuration")?;
        config.expand_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}
