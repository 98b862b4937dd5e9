//! `tracing` subscriber setup for the relay binary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Verbosity and output format.
///
/// `level` is the floor for every target; `components` raises or lowers it
/// for individual crates, keyed by crate name (`wsrelay-ws` or `wsrelay_ws`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub components: BTreeMap<String, String>,
    /// One JSON object per event instead of the human-readable format.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO.to_string(),
            components: BTreeMap::new(),
            json: false,
        }
    }
}

impl LogConfig {
    /// `EnvFilter` directive string, e.g. `warn,wsrelay_ws=debug`.
    fn directives(&self) -> String {
        let floor = self
            .level
            .trim()
            .parse::<LevelFilter>()
            .unwrap_or(LevelFilter::INFO);

        self.components
            .iter()
            .fold(floor.to_string(), |mut acc, (krate, level)| {
                acc.push(',');
                acc.push_str(&krate.replace('-', "_"));
                acc.push('=');
                acc.push_str(level.trim());
                acc
            })
    }
}

/// Filter for `config`. An unknown level means `info`; a bad component
/// override discards all overrides.
pub fn build_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_new(config.directives()).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &LogConfig) -> Result<(), TryInitError> {
    let registry = tracing_subscriber::registry().with(build_filter(config));
    if config.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    }
}
