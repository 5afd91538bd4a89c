use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::browser::EngineKind;
use crate::workflow::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppConfig {
    pub workflow: WorkflowSettings,
    pub browser: BrowserSettings,
    #[serde(default)]
    pub analyzer: AnalyzerSettings,
}

/// Scheduling settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct WorkflowSettings {
    /// Attempts per page before it is marked failed
    pub max_retries: u32,
    /// Finished pages between checkpoint writes
    pub checkpoint_interval: usize,
    pub retry: RetryPolicy,
}

/// Browser session settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BrowserSettings {
    pub engine: EngineKind,
    pub headless: bool,
    pub webdriver_url: String,
    pub page_load_timeout_secs: u64,
    pub max_concurrent_sessions: usize,
}

impl BrowserSettings {
    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_secs(self.page_load_timeout_secs)
    }
}

/// Settings for the built-in page analyzer
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AnalyzerSettings {
    pub max_links: usize,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self { max_links: 500 }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workflow: WorkflowSettings {
                max_retries: DEFAULT_MAX_ATTEMPTS,
                checkpoint_interval: 5,
                retry: RetryPolicy::default(),
            },
            browser: BrowserSettings {
                engine: EngineKind::Chrome,
                headless: true,
                webdriver_url: "http://localhost:4444".to_string(),
                page_load_timeout_secs: 30,
                max_concurrent_sessions: 3,
            },
            analyzer: AnalyzerSettings::default(),
        }
    }
}

impl AppConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "page-workflow", "page-workflow") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        path
    }

    /// Path of the default configuration file
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("default.yaml")
    }

    /// Load the default configuration, creating it on first use
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_path();

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_to_file(&config_path)?;
            Ok(config)
        }
    }

    /// Load from an explicit path, or fall back to the default file
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Self::load_default(),
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }
}
