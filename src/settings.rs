use std::path::PathBuf;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::PipelineError;

const SETTINGS_FILE: &str = "pipeline";

fn default_data_root() -> PathBuf {
    PathBuf::from("data")
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

/// Process-wide settings: `.env`, then an optional `pipeline.toml`, then the
/// environment. Only `project_data_root_path` matters to the cache layer;
/// the rest is handed to stage collaborators.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_data_root")]
    pub project_data_root_path: PathBuf,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    #[serde(default)]
    pub chrome_executable_path: Option<PathBuf>,
    #[serde(default)]
    pub user_data_root_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            project_data_root_path: default_data_root(),
            openai_api_key: None,
            openai_base_url: default_openai_base_url(),
            chrome_executable_path: None,
            user_data_root_path: None,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self, PipelineError> {
        // A missing .env file is normal.
        let _ = dotenvy::dotenv();
        Self::from_config(
            Config::builder()
                .add_source(File::with_name(SETTINGS_FILE).required(false))
                .add_source(Environment::default().try_parsing(false)),
        )
    }

    fn from_config(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, PipelineError> {
        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| PipelineError::Configuration(format!("invalid settings: {}", e)))
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_nothing_is_set() {
        let s = Settings::from_config(Config::builder()).unwrap();
        assert_eq!(s.project_data_root_path, PathBuf::from("data"));
        assert_eq!(s.openai_base_url, "https://api.openai.com/v1");
        assert!(s.openai_api_key.is_none());
    }

    #[test]
    fn explicit_values_override_defaults() {
        let builder = Config::builder()
            .set_override("project_data_root_path", "/srv/pipeline")
            .unwrap()
            .set_override("openai_api_key", "sk-test")
            .unwrap()
            .set_override("chrome_executable_path", "/usr/bin/chromium")
            .unwrap();
        let s = Settings::from_config(builder).unwrap();
        assert_eq!(s.project_data_root_path, PathBuf::from("/srv/pipeline"));
        assert_eq!(s.openai_api_key.as_deref(), Some("sk-test"));
        assert_eq!(s.chrome_executable_path, Some(PathBuf::from("/usr/bin/chromium")));
    }
}
