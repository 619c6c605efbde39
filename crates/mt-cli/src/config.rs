//! Configuration loading and management.

use std::fmt;
use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

/// Application configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the database file.
    pub database_path: PathBuf,

    /// Forward horizon, in days, when aligning an instant to the next day
    /// boundary of a template.
    pub day_begin_horizon_days: u32,

    /// How many passes a modification may stay pending on dynamic-end
    /// resolution before completing degraded.
    pub resolver_retry_budget: u32,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("day_begin_horizon_days", &self.day_begin_horizon_days)
            .field("resolver_retry_budget", &self.resolver_retry_budget)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("mt.db"),
            day_begin_horizon_days: mt_core::template::TemplateConfig::default()
                .day_begin_horizon_days,
            resolver_retry_budget: mt_core::analysis::AnalysisConfig::default()
                .resolver_retry_budget,
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        // Load from default config location
        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        // Load from specified config file
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Load from environment variables (MT_*)
        figment = figment.merge(Env::prefixed("MT_"));

        figment.extract()
    }

    /// The engine tunables derived from this configuration.
    #[must_use]
    pub const fn template_config(&self) -> mt_core::template::TemplateConfig {
        mt_core::template::TemplateConfig {
            day_begin_horizon_days: self.day_begin_horizon_days,
        }
    }

    /// The analysis tunables derived from this configuration.
    #[must_use]
    pub const fn analysis_config(&self) -> mt_core::analysis::AnalysisConfig {
        mt_core::analysis::AnalysisConfig {
            resolver_retry_budget: self.resolver_retry_budget,
        }
    }
}

/// Returns the platform-specific config directory for mt.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("mt"))
}

/// Returns the platform-specific data directory for mt.
///
/// On Linux: `~/.local/share/mt`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("mt"))
}
