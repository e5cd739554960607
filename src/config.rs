use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Seconds between the end of one poll cycle and the start of the next.
pub const POLL_INTERVAL_SECS: u64 = 15;
pub const DASHBOARD_PORT: u16 = 5000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub poll_interval_secs: u64,
    pub dashboard: DashboardConfig,
    pub mailbox: MailboxConfig,
    pub classifier: ClassifierConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub bind_address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    /// OAuth client secrets downloaded from the Google console.
    pub credentials_path: String,
    /// Authorized-user token, created on first consent and rewritten on refresh.
    pub token_path: String,
    pub api_base: String,
    pub request_timeout_secs: u64,
    /// How long first-run consent waits for the browser before giving up.
    pub consent_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Name of the environment variable holding the reasoning service key.
    pub api_key_env: String,
    pub model: String,
    pub api_base: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable {0} is not set; the classifier cannot start without an API key")]
    MissingApiKey(String),
    #[error("poll_interval_secs must be greater than zero")]
    ZeroPollInterval,
    #[error("invalid dashboard address {0}")]
    InvalidBindAddress(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            poll_interval_secs: POLL_INTERVAL_SECS,
            dashboard: DashboardConfig::default(),
            mailbox: MailboxConfig::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DASHBOARD_PORT,
        }
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            credentials_path: "credentials.json".to_string(),
            token_path: "token.json".to_string(),
            api_base: "https://gmail.googleapis.com/gmail/v1/users/me".to_string(),
            request_timeout_secs: 30,
            consent_timeout_secs: 300,
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            api_key_env: "GOOGLE_API_KEY".to_string(),
            model: "gemini-1.5-flash-latest".to_string(),
            api_base: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            request_timeout_secs: 60,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        self.dashboard_addr()?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn dashboard_addr(&self) -> Result<SocketAddr, ConfigError> {
        let raw = format!("{}:{}", self.dashboard.bind_address, self.dashboard.port);
        if self.dashboard.port == 0 {
            return Err(ConfigError::InvalidBindAddress(raw));
        }
        raw.parse()
            .map_err(|_| ConfigError::InvalidBindAddress(raw.clone()))
    }

    /// Reads the reasoning service key from the configured environment variable.
    pub fn api_key(&self) -> Result<String, ConfigError> {
        Self::api_key_from(&self.classifier.api_key_env, |name| std::env::var(name).ok())
    }

    fn api_key_from(
        name: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<String, ConfigError> {
        match lookup(name) {
            Some(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
            _ => Err(ConfigError::MissingApiKey(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_fixed_constants() {
        let config = Config::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(15));
        assert_eq!(
            config.dashboard_addr().unwrap(),
            "0.0.0.0:5000".parse::<SocketAddr>().unwrap()
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_falls_back_to_defaults() {
        let yaml = "classifier:\n  model: gemini-test\ndashboard:\n  port: 8080\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.classifier.model, "gemini-test");
        assert_eq!(config.classifier.api_key_env, "GOOGLE_API_KEY");
        assert_eq!(config.dashboard.port, 8080);
        assert_eq!(config.dashboard.bind_address, "0.0.0.0");
        assert_eq!(config.poll_interval_secs, POLL_INTERVAL_SECS);
        assert_eq!(config.mailbox.token_path, "token.json");
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentwatch.yaml");
        let path = path.to_str().unwrap();

        let mut config = Config::default();
        config.poll_interval_secs = 30;
        config.to_file(path).unwrap();

        let loaded = Config::from_file(path).unwrap();
        assert_eq!(loaded.poll_interval_secs, 30);
    }

    #[test]
    fn test_missing_api_key_is_fatal() {
        let result = Config::api_key_from("SENTWATCH_TEST_KEY", |_| None);
        assert!(matches!(result, Err(ConfigError::MissingApiKey(name)) if name == "SENTWATCH_TEST_KEY"));

        let blank = Config::api_key_from("SENTWATCH_TEST_KEY", |_| Some("   ".to_string()));
        assert!(blank.is_err());

        let key = Config::api_key_from("SENTWATCH_TEST_KEY", |_| Some(" abc123 ".to_string()));
        assert_eq!(key.unwrap(), "abc123");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.poll_interval_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroPollInterval)));

        let mut config = Config::default();
        config.dashboard.bind_address = "not an address".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBindAddress(_))
        ));

        let mut config = Config::default();
        config.dashboard.port = 0;
        assert!(config.validate().is_err());
    }
}
