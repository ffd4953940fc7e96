use directories::BaseDirs;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::api::client::ApiClient;
use crate::api::models::Session;
use crate::error::{ChatError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AppState {
    pub base_url: String,
    pub anon_key: String,
    /// Well-known support address, tried when no profile carries the admin flag.
    #[serde(default)]
    pub admin_email: Option<String>,
    #[serde(default)]
    pub session: Option<Session>,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_path() -> Option<PathBuf> {
        let base = BaseDirs::new()?;
        Some(base.config_dir().join("support-chat.toml"))
    }

    /// A missing file is an empty configuration, not an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("no config at {}, starting empty", path.display());
                return Ok(Self::new());
            }
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&text)
            .map_err(|e| ChatError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let toml = toml::to_string_pretty(self).map_err(|e| ChatError::Config(e.to_string()))?;
        fs::write(path, toml)?;
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        !self.base_url.trim().is_empty() && !self.anon_key.trim().is_empty()
    }

    /// REST client for the configured project, authorized as the stored
    /// session when there is one.
    pub fn client(&self) -> Result<ApiClient> {
        if !self.is_configured() {
            return Err(ChatError::Config(
                "base_url and anon_key must be set; run `support-chat login --url … --anon-key …`"
                    .into(),
            ));
        }
        let token = self.session.as_ref().and_then(|s| s.access_token.clone());
        Ok(ApiClient::new(&self.base_url, &self.anon_key)?.with_access_token(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::UserId;

    #[test]
    fn missing_file_is_empty_config() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(state, AppState::new());
        assert!(!state.is_configured());
        assert!(matches!(state.client(), Err(ChatError::Config(_))));
    }

    #[test]
    fn saved_session_is_loaded_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg").join("support-chat.toml");
        let state = AppState {
            base_url: "https://abcd.supabase.co".into(),
            anon_key: "anon".into(),
            admin_email: Some("ops@example.com".into()),
            session: Some(Session {
                user_id: UserId::new("7c1e"),
                email: None,
                access_token: Some("jwt".into()),
            }),
        };
        state.save_to(&path).unwrap();
        assert_eq!(AppState::load_from(&path).unwrap(), state);
        assert!(state.client().is_ok());
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "base_url = [").unwrap();
        assert!(matches!(AppState::load_from(&path), Err(ChatError::Config(_))));
    }
}
