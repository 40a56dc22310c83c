use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use camino::Utf8Path;
use directories::BaseDirs;
use serde::Deserialize;

use crate::config::{AwsSettings, StaticAwsCredentials};
use crate::error::PipelineError;

/// Kaggle API credentials, resolved once and handed to the catalog client.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct KaggleCredentials {
    pub username: String,
    pub key: String,
}

impl fmt::Debug for KaggleCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KaggleCredentials")
            .field("username", &self.username)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl KaggleCredentials {
    /// `KAGGLE_USERNAME`/`KAGGLE_KEY`, then `<config_dir>/kaggle.json`,
    /// then `~/.kaggle/kaggle.json`.
    pub fn resolve(config_dir: Option<&Utf8Path>) -> Result<Self, PipelineError> {
        let home = BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf());
        Self::resolve_from(
            |name| std::env::var(name).ok(),
            config_dir.map(Utf8Path::as_std_path),
            home.as_deref(),
        )
    }

    pub fn resolve_from<F>(
        env: F,
        config_dir: Option<&Path>,
        home: Option<&Path>,
    ) -> Result<Self, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let username = env("KAGGLE_USERNAME").filter(|value| !value.trim().is_empty());
        let key = env("KAGGLE_KEY").filter(|value| !value.trim().is_empty());
        if let (Some(username), Some(key)) = (username, key) {
            return Ok(Self {
                username: username.trim().to_string(),
                key: key.trim().to_string(),
            });
        }

        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(dir) = config_dir {
            candidates.push(dir.join("kaggle.json"));
        }
        if let Some(home) = home {
            candidates.push(home.join(".kaggle").join("kaggle.json"));
        }
        for path in candidates {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(PipelineError::CredentialsMissing(
            "Kaggle credentials not found in environment or kaggle.json".to_string(),
        ))
    }

    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let content = fs::read_to_string(path).map_err(|err| {
            PipelineError::CredentialsMissing(format!("read {}: {err}", path.display()))
        })?;
        let credentials: KaggleCredentials = serde_json::from_str(&content).map_err(|err| {
            PipelineError::CredentialsMissing(format!("parse {}: {err}", path.display()))
        })?;
        if credentials.username.trim().is_empty() || credentials.key.trim().is_empty() {
            return Err(PipelineError::CredentialsMissing(format!(
                "empty username or key in {}",
                path.display()
            )));
        }
        Ok(credentials)
    }
}

/// How AWS clients obtain credentials.
#[derive(Clone, PartialEq, Eq)]
pub enum AwsCredentialSource {
    /// SDK default chain: environment, shared profile files, instance/task roles.
    DefaultChain,
    /// A named profile from the shared config files.
    Profile(String),
    /// Keys supplied in the configuration file.
    Static(StaticAwsCredentials),
}

impl fmt::Debug for AwsCredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AwsCredentialSource::DefaultChain => write!(f, "DefaultChain"),
            AwsCredentialSource::Profile(name) => write!(f, "Profile({name})"),
            AwsCredentialSource::Static(keys) => {
                write!(f, "Static({}, <redacted>)", keys.access_key_id)
            }
        }
    }
}

impl AwsCredentialSource {
    pub fn from_settings(settings: &AwsSettings) -> Self {
        if let Some(keys) = &settings.static_credentials {
            return AwsCredentialSource::Static(keys.clone());
        }
        match &settings.profile {
            Some(profile) => AwsCredentialSource::Profile(profile.clone()),
            None => AwsCredentialSource::DefaultChain,
        }
    }
}
