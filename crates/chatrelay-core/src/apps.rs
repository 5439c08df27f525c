//! App registry types: which upstream platform, model, and credentials an
//! app code maps to.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Upstream platform an app is served by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Platform {
    Dify,
    SiliconFlow,
}

impl Platform {
    /// Stable column value, matches the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Dify => "DIFY",
            Platform::SiliconFlow => "SILICON_FLOW",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DIFY" => Ok(Platform::Dify),
            "SILICON_FLOW" | "SILICONFLOW" => Ok(Platform::SiliconFlow),
            other => Err(Error::Config(format!("Unknown platform: {}", other))),
        }
    }
}

/// Resolved configuration for one app code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub app_code: String,
    #[serde(default)]
    pub app_name: String,
    pub platform: Platform,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Dify base URL, or the SiliconFlow chat endpoint.
    pub api_url: String,
    pub api_key: String,
}

/// Public view of an app (no credentials).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSummary {
    pub app_code: String,
    pub app_name: String,
    pub model_name: String,
    pub platform: Platform,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Read the app seed file. A missing file means no apps to seed.
pub fn load_app_seed(path: &Path) -> Result<Vec<AppConfig>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("No app seed at {}, registry starts empty", path.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };
    let apps: Vec<AppConfig> = serde_json::from_str(&raw)?;
    info!("Loaded {} app configs from {}", apps.len(), path.display());
    Ok(apps)
}
