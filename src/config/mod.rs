//! Configuration management for the watch multiplexer.
//!
//! Sources are merged in priority order (later overrides earlier):
//! 1. Default values (hardcoded)
//! 2. Config file named by `CONFIG_PATH`
//! 3. Environment variables with the `DWATCH__` prefix (highest priority)

mod retry;
pub use retry::*;


//---
use std::env;
use std::time::Duration;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

const ENV_PREFIX: &str = "DWATCH";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    /// Upper bound for waiting on a stream's first sync, in milliseconds.
    ///
    /// 0 waits indefinitely: `subscribe` can then only be bounded by the
    /// caller's cancellation token.
    #[serde(default)]
    pub sync_timeout_ms: u64,

    /// Backoff for the list/watch loop of every stream
    #[serde(default)]
    pub list_watch: BackoffPolicy,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            sync_timeout_ms: 0,
            list_watch: BackoffPolicy::default(),
        }
    }
}

impl WatchConfig {
    /// Loads configuration from defaults, `CONFIG_PATH` and `DWATCH__*` variables.
    ///
    /// Does not validate; call [`WatchConfig::validate`] once all overrides are applied.
    ///
    /// ```ignore
    /// std::env::set_var("DWATCH__LIST_WATCH__MAX_DELAY_MS", "5000");
    /// let cfg = WatchConfig::new()?.validate()?;
    /// ```
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(env_source());

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Layers a config file over the current values, environment still wins.
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(env_source())
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub fn validate(self) -> Result<Self> {
        self.list_watch.validate("list_watch")?;
        Ok(self)
    }

    /// `None` when the sync wait is unbounded
    pub fn sync_timeout(&self) -> Option<Duration> {
        match self.sync_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .ignore_empty(true)
        .try_parsing(true)
}
