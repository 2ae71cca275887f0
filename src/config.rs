use crate::enforcement::DisciplineSettings;
use poise::serenity_prelude::UserId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Config file read when the environment does not provide a value
pub const CONFIG_FILE: &str = "config/bot_config.yaml";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_QUOTA_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("DISCORD_TOKEN is not set and no token is present in {CONFIG_FILE}")]
    MissingToken,
    #[error("TARGET_USER_ID is not set and no target is present in {CONFIG_FILE}")]
    MissingTarget,
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("failed to parse {CONFIG_FILE}: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Contents of the YAML config file; every field is optional
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub token: Option<String>,
    pub target_user_id: Option<u64>,
    pub port: Option<u16>,
    pub quota_timeout_secs: Option<u64>,
    pub discipline: DisciplineSettings,
}

/// Resolved bot configuration
#[derive(Clone)]
pub struct BotConfig {
    pub token: String,
    pub target_user_id: UserId,
    pub port: u16,
    pub quota_timeout_secs: u64,
    pub discipline: DisciplineSettings,
}

impl std::fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotConfig")
            .field("token", &"<redacted>")
            .field("target_user_id", &self.target_user_id)
            .field("port", &self.port)
            .field("quota_timeout_secs", &self.quota_timeout_secs)
            .field("discipline", &self.discipline)
            .finish()
    }
}

impl BotConfig {
    /// Load configuration from the environment, falling back to [`CONFIG_FILE`]
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed, if a value is
    /// malformed, or if the token or target is missing from both sources.
    pub async fn load() -> Result<Self, ConfigError> {
        let file = match tokio::fs::read_to_string(CONFIG_FILE).await {
            Ok(content) => Some(serde_yaml::from_str::<FileConfig>(&content)?),
            Err(_) => None,
        };
        Self::resolve(file.unwrap_or_default(), |key| std::env::var(key).ok())
    }

    /// Merge an environment lookup over file values, environment first
    ///
    /// # Errors
    /// See [`BotConfig::load`].
    pub fn resolve(
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let env = |key: &str| env(key).filter(|value| !value.trim().is_empty());

        let token = env("DISCORD_TOKEN")
            .or(file.token)
            .ok_or(ConfigError::MissingToken)?;

        let target_user_id = match env("TARGET_USER_ID") {
            Some(raw) => parse::<u64>("TARGET_USER_ID", &raw)?,
            None => file.target_user_id.ok_or(ConfigError::MissingTarget)?,
        };
        if target_user_id == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TARGET_USER_ID",
                value: "0".to_string(),
            });
        }

        let port = match env("PORT") {
            Some(raw) => parse::<u16>("PORT", &raw)?,
            None => file.port.unwrap_or(DEFAULT_PORT),
        };

        let quota_timeout_secs = match env("QUOTA_TIMEOUT_SECS") {
            Some(raw) => parse::<u64>("QUOTA_TIMEOUT_SECS", &raw)?,
            None => file.quota_timeout_secs.unwrap_or(DEFAULT_QUOTA_TIMEOUT_SECS),
        };

        if let Some((key, value)) = file.discipline.invalid_field() {
            return Err(ConfigError::InvalidValue { key, value });
        }

        Ok(Self {
            token,
            target_user_id: UserId::new(target_user_id),
            port,
            quota_timeout_secs,
            discipline: file.discipline,
        })
    }

    #[must_use]
    pub fn quota_timeout(&self) -> Duration {
        Duration::from_secs(self.quota_timeout_secs)
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_environment_only() {
        let config = BotConfig::resolve(
            FileConfig::default(),
            env_of(&[("DISCORD_TOKEN", "abc"), ("TARGET_USER_ID", "42")]),
        )
        .unwrap();

        assert_eq!(config.token, "abc");
        assert_eq!(config.target_user_id, UserId::new(42));
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.quota_timeout(), Duration::from_secs(60));
        assert_eq!(config.discipline, DisciplineSettings::default());
    }

    #[test]
    fn test_environment_wins_over_file() {
        let file = FileConfig {
            token: Some("from-file".to_string()),
            target_user_id: Some(7),
            port: Some(8080),
            ..FileConfig::default()
        };
        let config = BotConfig::resolve(file, env_of(&[("DISCORD_TOKEN", "from-env")])).unwrap();

        assert_eq!(config.token, "from-env");
        assert_eq!(config.target_user_id, UserId::new(7));
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn test_blank_environment_falls_back_to_file() {
        let file = FileConfig {
            token: Some("from-file".to_string()),
            target_user_id: Some(7),
            ..FileConfig::default()
        };
        let config = BotConfig::resolve(file, env_of(&[("DISCORD_TOKEN", "  ")])).unwrap();
        assert_eq!(config.token, "from-file");
    }

    #[test]
    fn test_missing_values() {
        let err = BotConfig::resolve(FileConfig::default(), env_of(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingToken));

        let err = BotConfig::resolve(FileConfig::default(), env_of(&[("DISCORD_TOKEN", "abc")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingTarget));
    }

    #[test]
    fn test_malformed_values() {
        let err = BotConfig::resolve(
            FileConfig::default(),
            env_of(&[("DISCORD_TOKEN", "abc"), ("TARGET_USER_ID", "karl")]),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "TARGET_USER_ID",
                ..
            }
        ));

        let err = BotConfig::resolve(
            FileConfig::default(),
            env_of(&[
                ("DISCORD_TOKEN", "abc"),
                ("TARGET_USER_ID", "42"),
                ("PORT", "99999"),
            ]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "PORT", .. }));
    }

    #[test]
    fn test_zero_target_rejected() {
        let err = BotConfig::resolve(
            FileConfig::default(),
            env_of(&[("DISCORD_TOKEN", "abc"), ("TARGET_USER_ID", "0")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_file_config_yaml() {
        let yaml = r"
token: file-token
target_user_id: 123456789012345678
quota_timeout_secs: 300
discipline:
  initial_interval_ms: 1000
  backoff_factor: 2.0
";
        let file: FileConfig = serde_yaml::from_str(yaml).expect("Failed to deserialize");
        assert_eq!(file.quota_timeout_secs, Some(300));
        assert_eq!(file.discipline.initial_interval_ms, 1000);
        assert!((file.discipline.backoff_factor - 2.0).abs() < f64::EPSILON);
        // unspecified discipline fields keep their defaults
        assert_eq!(file.discipline.max_interval_ms, 5000);

        let config = BotConfig::resolve(file, env_of(&[])).unwrap();
        assert_eq!(config.target_user_id, UserId::new(123_456_789_012_345_678));
        assert_eq!(config.quota_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_discipline_settings_rejected() {
        let cases = [
            ("backoff_factor: .inf", "discipline.backoff_factor"),
            ("backoff_factor: 0.5", "discipline.backoff_factor"),
            ("initial_interval_ms: 0", "discipline.initial_interval_ms"),
            ("initial_interval_ms: 9000", "discipline.max_interval_ms"),
        ];
        for (line, expected) in cases {
            let yaml = format!("token: t\ntarget_user_id: 42\ndiscipline:\n  {line}\n");
            let file: FileConfig = serde_yaml::from_str(&yaml).expect("Failed to deserialize");
            let err = BotConfig::resolve(file, env_of(&[])).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidValue { key, .. } if key == expected),
                "{line}: {err}"
            );
        }
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = BotConfig::resolve(
            FileConfig::default(),
            env_of(&[("DISCORD_TOKEN", "very-secret"), ("TARGET_USER_ID", "42")]),
        )
        .unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("very-secret"));
        assert!(debug.contains("redacted"));
    }
}
