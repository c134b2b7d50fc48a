use std::fs;
use std::path::{Path, PathBuf};

use deck_logging::{deck_info, deck_warn};
use jobdeck_engine::EngineSettings;
use serde::{Deserialize, Serialize};
use url::Url;

use super::logging::LogDestination;

/// Environment variable that overrides the configured backend base URL.
pub const BACKEND_URL_VAR: &str = "JOBDECK_BACKEND_URL";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path:?}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid backend url {value:?}: {source}")]
    BadUrl {
        value: String,
        #[source]
        source: url::ParseError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    pub log_destination: LogDestination,
    pub engine: EngineSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_destination: LogDestination::Terminal,
            engine: EngineSettings::default(),
        }
    }
}

impl AppConfig {
    /// Reads a RON settings file. Without a path the defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: AppConfig = ron::from_str(&content).map_err(|err| ConfigError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        deck_info!("Loaded settings from {:?}", path);
        Ok(config)
    }

    /// Applies the environment backend URL and the `--demo` flag on top of the file settings.
    pub fn apply_overrides(
        &mut self,
        backend_url: Option<&str>,
        force_demo: bool,
    ) -> Result<(), ConfigError> {
        if let Some(raw) = backend_url.map(str::trim).filter(|raw| !raw.is_empty()) {
            let url = Url::parse(raw).map_err(|source| ConfigError::BadUrl {
                value: raw.to_string(),
                source,
            })?;
            deck_info!("Backend url taken from {}", BACKEND_URL_VAR);
            self.engine.backend.base_url = Some(url);
        }
        if force_demo {
            self.engine.force_demo = true;
        }
        if self.engine.backend.base_url.is_none() && !self.engine.force_demo {
            deck_warn!("No backend url configured; running against the simulator");
        }
        Ok(())
    }
}
