//! Process configuration: database connection parameters, governor
//! and job tuning, optional upstream auth and geocoding key (spec §6
//! "Environment").
//!
//! Loaded from a TOML file, with environment variable overrides
//! prefixed `CRAG_SYNC_` (e.g. `CRAG_SYNC_DATABASE__URL`), following
//! the layered `config` crate setup the store's teacher uses for its
//! own service configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Error;

#[derive(Clone, Debug, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default)]
    pub extra_root_ca: Vec<PathBuf>,
    #[serde(default = "default_max_size")]
    pub max_size: u32,
    #[serde(default = "default_min_idle")]
    pub min_idle: u32,
}

fn default_max_size() -> u32 {
    25
}

fn default_min_idle() -> u32 {
    5
}

#[derive(Clone, Debug, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct JobConfig {
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: std::time::Duration,
    #[serde(with = "humantime_serde", default = "default_job_ceiling")]
    pub wall_clock_ceiling: std::time::Duration,
    #[serde(with = "humantime_serde", default = "default_orphan_grace")]
    pub orphan_grace: std::time::Duration,
}

fn default_request_timeout() -> std::time::Duration {
    std::time::Duration::from_secs(30)
}

fn default_job_ceiling() -> std::time::Duration {
    std::time::Duration::from_secs(2 * 60 * 60)
}

fn default_orphan_grace() -> std::time::Duration {
    std::time::Duration::from_secs(2 * 60 * 60)
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            wall_clock_ceiling: default_job_ceiling(),
            orphan_grace: default_orphan_grace(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub jobs: JobConfig,
    /// Optional geocoding API key — out of scope for the sync engine
    /// itself (spec §1) but part of the process environment it shares
    /// with the rest of the host application.
    pub geocoding_api_key: Option<String>,
}

impl Config {
    /// Loads configuration from `path`, then applies `CRAG_SYNC_*`
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, malformed, or fails
    /// validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("CRAG_SYNC").separator("__"))
            .build()
            .map_err(|e| Error::InvalidInput(e.to_string()))?;
        settings
            .try_deserialize()
            .map_err(|e| Error::InvalidInput(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_minimal_config_with_defaults() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
            [database]
            url = "postgres://localhost/crag"

            [upstream]
            base_url = "https://example.test"
            "#
        )
        .unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.database.max_size, 25);
        assert_eq!(cfg.database.min_idle, 5);
        assert!(cfg.upstream.auth_token.is_none());
        assert_eq!(cfg.jobs.request_timeout, std::time::Duration::from_secs(30));
    }

    #[test]
    fn env_override_replaces_file_value() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
            [database]
            url = "postgres://localhost/crag"

            [upstream]
            base_url = "https://example.test"
            "#
        )
        .unwrap();

        std::env::set_var("CRAG_SYNC_DATABASE__MAX_SIZE", "4");
        let cfg = Config::load(file.path()).unwrap();
        std::env::remove_var("CRAG_SYNC_DATABASE__MAX_SIZE");
        assert_eq!(cfg.database.max_size, 4);
    }
}
