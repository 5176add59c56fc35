// =============================================================================
// Matrixon Federation - Config Module
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// This module defines the configuration of the PDU loader and its
// loading (defaults, TOML file, `MATRIXON_LOADER_` environment) and
// validation logic.
//
// =============================================================================

use std::{path::Path, time::Duration};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{
    error::{FederationError, Result},
    parser::MAX_PDU_SIZE,
};

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "MATRIXON_LOADER_";

/// PDU loader configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Number of events authorized concurrently
    pub concurrency: usize,

    /// Whether to soft-fail events against current room state
    pub soft_fail_check: bool,

    /// Maximum raw PDU size in bytes
    pub max_event_size: usize,

    /// Maximum number of `auth_events` references
    pub max_auth_events: usize,

    /// Maximum number of `prev_events` references
    pub max_prev_events: usize,

    /// Deadline for a whole load in milliseconds
    pub timeout_ms: Option<u64>,

    /// Log filter for `init_tracing`
    pub log_level: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            concurrency: 16,
            soft_fail_check: false,
            max_event_size: MAX_PDU_SIZE,
            max_auth_events: 10,
            max_prev_events: 20,
            timeout_ms: None,
            log_level: "info".to_string(),
        }
    }
}

impl LoaderConfig {
    /// Loads the configuration from defaults, an optional TOML file and the
    /// environment, in increasing order of precedence
    #[instrument(level = "debug")]
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(LoaderConfig::default()));
        if let Some(path) = path {
            debug!("📁 Loading loader configuration from {}", path.display());
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX));

        let config: LoaderConfig = figment
            .extract()
            .map_err(|e| FederationError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration
    #[instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(FederationError::config("Concurrency must be greater than 0"));
        }

        if self.max_event_size == 0 {
            return Err(FederationError::config("Max event size must be greater than 0"));
        }

        if self.max_auth_events == 0 {
            return Err(FederationError::config("Max auth events must be greater than 0"));
        }

        if self.max_prev_events == 0 {
            return Err(FederationError::config("Max prev events must be greater than 0"));
        }

        if self.timeout_ms == Some(0) {
            return Err(FederationError::config("Timeout must be greater than 0"));
        }

        Ok(())
    }

    /// Gets the deadline for a whole load, if any
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}
