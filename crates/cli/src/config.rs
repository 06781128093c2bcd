//! Configuration loading from skein.toml.

use runtime::{AnthropicAuth, AnthropicProvider, Provider, RuntimeConfig, StdioProvider};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Model provider.
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Turn loop settings.
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Anthropic,
    Stdio,
}

/// Provider configuration.
#[derive(Debug, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub kind: ProviderKind,

    /// Model to use (anthropic).
    #[serde(default = "default_model")]
    pub model: String,

    /// Standard Anthropic API key (sk-ant-api01-...).
    /// Mutually exclusive with oauth_token.
    pub api_key: Option<String>,

    /// OAuth access token. Mutually exclusive with api_key.
    pub oauth_token: Option<String>,

    pub max_tokens: Option<u32>,

    /// Program to spawn (stdio).
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            model: default_model(),
            api_key: None,
            oauth_token: None,
            max_tokens: None,
            command: None,
            args: Vec::new(),
        }
    }
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Load the file if it exists, otherwise use defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Build the authentication from config.
    ///
    /// Requires exactly one of api_key or oauth_token to be set.
    pub fn auth(&self) -> Result<AnthropicAuth, ConfigError> {
        match (&self.provider.api_key, &self.provider.oauth_token) {
            (Some(key), None) => Ok(AnthropicAuth::ApiKey(key.clone())),
            (None, Some(token)) => Ok(AnthropicAuth::OauthToken(token.clone())),
            (Some(_), Some(_)) => Err(ConfigError::AmbiguousAuth),
            (None, None) => Err(ConfigError::MissingAuth),
        }
    }

    /// Build the configured provider. `fallback_key` is used when no
    /// credential is configured.
    pub fn build_provider(
        &self,
        fallback_key: Option<String>,
    ) -> Result<Arc<dyn Provider>, ConfigError> {
        match self.provider.kind {
            ProviderKind::Anthropic => {
                let auth = match (self.auth(), fallback_key) {
                    (Err(ConfigError::MissingAuth), Some(key)) => AnthropicAuth::ApiKey(key),
                    (auth, _) => auth?,
                };
                let mut builder = AnthropicProvider::builder(auth, &self.provider.model)
                    // Execute payloads are complete without the close token.
                    .stop_sequences(vec!["</execute>".to_string()]);
                if let Some(max_tokens) = self.provider.max_tokens {
                    builder = builder.max_tokens(max_tokens);
                }
                Ok(Arc::new(builder.build()))
            }
            ProviderKind::Stdio => {
                let command = self
                    .provider
                    .command
                    .as_ref()
                    .ok_or(ConfigError::MissingCommand)?;
                Ok(Arc::new(StdioProvider::new(
                    command.clone(),
                    self.provider.args.clone(),
                )))
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error(
        "authentication not configured: set provider.api_key, provider.oauth_token or ANTHROPIC_API_KEY"
    )]
    MissingAuth,

    #[error(
        "ambiguous authentication: set either provider.api_key OR provider.oauth_token, not both"
    )]
    AmbiguousAuth,

    #[error("stdio provider needs provider.command")]
    MissingCommand,
}
