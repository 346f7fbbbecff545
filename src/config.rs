use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

pub const DEFAULT_WEBHOOK_PATH: &str = "/zengo/webhook/";
pub const DEFAULT_DB_PATH: &str = "sqlite://zengo.db";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub zendesk: ZendeskConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ZendeskConfig {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub subdomain: String,
    /// Overrides `https://{subdomain}.zendesk.com`, e.g. for a proxy.
    pub base_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_webhook_path")]
    pub path: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            path: default_webhook_path(),
        }
    }
}

/// Values from the command line / environment that win over the file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub email: Option<String>,
    pub token: Option<String>,
    pub subdomain: Option<String>,
    pub secret: Option<String>,
    pub db_path: Option<String>,
}

fn default_webhook_path() -> String {
    DEFAULT_WEBHOOK_PATH.to_string()
}

fn default_db_path() -> String {
    DEFAULT_DB_PATH.to_string()
}

impl ZendeskConfig {
    pub fn base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://{}.zendesk.com", self.subdomain),
        }
    }
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml).context("invalid config yaml")?;
        Ok(config)
    }

    /// Reads `path` if it exists; a missing file leaves everything to the
    /// overrides.
    pub fn load(path: &Path, overrides: Overrides) -> Result<Self> {
        let mut config = if path.exists() {
            let config_str = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Self::from_yaml(&config_str)?
        } else {
            Config {
                zendesk: ZendeskConfig::default(),
                webhook: WebhookConfig::default(),
                db_path: default_db_path(),
            }
        };
        config.apply(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(email) = overrides.email {
            self.zendesk.email = email;
        }
        if let Some(token) = overrides.token {
            self.zendesk.token = token;
        }
        if let Some(subdomain) = overrides.subdomain {
            self.zendesk.subdomain = subdomain;
        }
        if let Some(secret) = overrides.secret {
            self.webhook.secret = secret;
        }
        if let Some(db_path) = overrides.db_path {
            self.db_path = db_path;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("zendesk.email", &self.zendesk.email),
            ("zendesk.token", &self.zendesk.token),
            ("zendesk.subdomain", &self.zendesk.subdomain),
            ("webhook.secret", &self.webhook.secret),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            bail!("missing settings: {}", missing.join(", "));
        }
        if !self.webhook.path.starts_with('/') {
            bail!("webhook.path must start with '/'");
        }
        Ok(())
    }
}

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn init(path: &Path, overrides: Overrides) -> Result<()> {
    let config = Config::load(path, overrides)?;
    if CONFIG.set(config).is_err() {
        bail!("config already initialized");
    }
    Ok(())
}

pub fn get() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}
