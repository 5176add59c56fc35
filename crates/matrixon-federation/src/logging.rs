// =============================================================================
// Matrixon Federation - Logging Module
// =============================================================================
//
// Author: arkSong <arksong2018@gmail.com>
// Version: 0.11.0-alpha
// Date: 2024-03-21
//
// Installs the tracing subscriber used by hosts embedding the loader.
//
// =============================================================================

use tracing_subscriber::{prelude::*, EnvFilter};

use crate::error::{FederationError, Result};

/// Builds the filter layer, falling back to `warn` when `filter` is invalid
pub fn env_filter(filter: &str) -> EnvFilter {
    match EnvFilter::try_new(filter) {
        Ok(layer) => layer,
        Err(e) => {
            eprintln!("It looks like your log filter is invalid. The following error occurred while parsing it: {e}");
            EnvFilter::new("warn")
        }
    }
}

/// Installs a global `fmt` subscriber filtered by `filter`
pub fn init_tracing(filter: &str) -> Result<()> {
    let registry = tracing_subscriber::Registry::default();
    let fmt_layer = tracing_subscriber::fmt::Layer::new();
    let subscriber = registry.with(env_filter(filter)).with(fmt_layer);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| FederationError::internal(format!("Failed to install tracing subscriber: {e}")))
}
