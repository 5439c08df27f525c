//! Provider endpoint settings shared by all apps.
//!
//! Per-app credentials live in the app registry; this file only carries what
//! is global to a provider.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

pub const DEFAULT_SILICONFLOW_VLM_URL: &str = "https://api.siliconflow.cn/v1/chat/completions";
pub const DEFAULT_DIFY_USER: &str = "chatrelay-user";

/// Stored provider settings (persisted to providers.json).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings {
    /// Endpoint used for image+text requests.
    #[serde(default)]
    pub siliconflow_vlm_url: Option<String>,
    /// `user` sent to Dify when the caller is anonymous.
    #[serde(default = "default_dify_user")]
    pub dify_default_user: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_dify_user() -> String {
    DEFAULT_DIFY_USER.into()
}
fn default_connect_timeout() -> u64 {
    10
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            siliconflow_vlm_url: None,
            dify_default_user: DEFAULT_DIFY_USER.into(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl ProviderSettings {
    /// Load settings from file, falling back to env vars and defaults.
    pub fn load(path: &Path) -> Self {
        let mut settings: ProviderSettings = std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();

        if settings.siliconflow_vlm_url.is_none() {
            settings.siliconflow_vlm_url = std::env::var("SILICONFLOW_VLM_URL").ok();
        }

        info!(
            "Provider settings: vlm_url={}, connect_timeout={}s",
            settings.vlm_url(),
            settings.connect_timeout_secs
        );
        settings
    }

    pub fn vlm_url(&self) -> &str {
        self.siliconflow_vlm_url
            .as_deref()
            .unwrap_or(DEFAULT_SILICONFLOW_VLM_URL)
    }

    /// HTTP client for upstream calls. Only connecting is bounded; streams
    /// may legitimately stay open for minutes.
    pub fn build_client(&self) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("providers.json");
        std::fs::write(
            &path,
            r#"{"siliconflowVlmUrl":"http://vlm.local/v1/chat/completions"}"#,
        )
        .unwrap();

        let settings = ProviderSettings::load(&path);
        assert_eq!(settings.vlm_url(), "http://vlm.local/v1/chat/completions");
        assert_eq!(settings.dify_default_user, DEFAULT_DIFY_USER);
        assert_eq!(settings.connect_timeout_secs, 10);
    }

    #[test]
    fn test_defaults() {
        let settings = ProviderSettings::default();
        assert_eq!(settings.vlm_url(), DEFAULT_SILICONFLOW_VLM_URL);
    }
}
