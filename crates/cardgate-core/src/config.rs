use crate::error::{CardgateError, CardgateResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    #[default]
    Builtin,
    Plugin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardConfig {
    #[serde(default)]
    pub protocol: ProtocolKind,

    /// Substring that marks the preferred reader (builtin protocol only).
    #[serde(default = "default_preferred_reader")]
    pub preferred_reader: String,

    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_preferred_reader() -> String {
    "contactless".to_string()
}

fn default_cooldown_secs() -> u64 {
    3
}

impl Default for CardConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolKind::default(),
            preferred_reader: default_preferred_reader(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_interval_ms() -> u64 {
    250
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
        }
    }
}

/// Settings for the software driver and the card it hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default = "default_readers")]
    pub readers: Vec<String>,

    /// Reader that starts with the software card inserted, if any.
    #[serde(default)]
    pub card_reader: Option<String>,

    #[serde(default = "default_holder")]
    pub holder: String,

    #[serde(default)]
    pub card_pin: Option<String>,
}

fn default_readers() -> Vec<String> {
    vec!["Cardgate Soft Reader 0".to_string()]
}

fn default_holder() -> String {
    "Soft Card".to_string()
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            readers: default_readers(),
            card_reader: None,
            holder: default_holder(),
            card_pin: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinConfig {
    /// Environment variable the PIN prompt reads from.
    #[serde(default = "default_pin_env")]
    pub env: String,
}

fn default_pin_env() -> String {
    "CARDGATE_PIN".to_string()
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            env: default_pin_env(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

fn default_health_addr() -> String {
    "127.0.0.1:8788".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CardgateConfig {
    #[serde(default)]
    pub card: CardConfig,

    #[serde(default)]
    pub poll: PollConfig,

    #[serde(default)]
    pub driver: DriverConfig,

    #[serde(default)]
    pub pin: PinConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(skip)]
    pub path: PathBuf,
}

impl CardgateConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> CardgateResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut cfg = if matches!(path.extension().and_then(|ext| ext.to_str()), Some(ext) if ext.eq_ignore_ascii_case("toml"))
        {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> CardgateResult<()> {
        if self.card.cooldown_secs == 0 {
            return Err(CardgateError::InvalidConfig(
                "card.cooldown_secs must be at least 1".to_string(),
            ));
        }
        if self.poll.interval_ms == 0 {
            return Err(CardgateError::InvalidConfig(
                "poll.interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.driver.readers.is_empty() {
            return Err(CardgateError::InvalidConfig(
                "driver.readers must list at least one reader".to_string(),
            ));
        }
        if let Some(reader) = &self.driver.card_reader {
            if !self.driver.readers.iter().any(|r| r == reader) {
                return Err(CardgateError::InvalidConfig(format!(
                    "driver.card_reader `{reader}` is not one of driver.readers"
                )));
            }
        }
        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.card.cooldown_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll.interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_toml_applies_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cardgate.toml");
        fs::write(
            &path,
            r#"
[card]
protocol = "plugin"

[driver]
readers = ["ACS Reader 0", "ACS Contactless 1"]
card_reader = "ACS Contactless 1"
"#,
        )
        .unwrap();

        let cfg = CardgateConfig::load(&path).unwrap();
        assert_eq!(cfg.card.protocol, ProtocolKind::Plugin);
        assert_eq!(cfg.card.preferred_reader, "contactless");
        assert_eq!(cfg.cooldown(), Duration::from_secs(3));
        assert_eq!(cfg.poll_interval(), Duration::from_millis(250));
        assert_eq!(cfg.pin.env, "CARDGATE_PIN");
        assert_eq!(cfg.path, path);
    }

    #[test]
    fn load_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cardgate.yaml");
        fs::write(
            &path,
            "card:\n  cooldown_secs: 5\npoll:\n  interval_ms: 100\n",
        )
        .unwrap();

        let cfg = CardgateConfig::load(&path).unwrap();
        assert_eq!(cfg.card.protocol, ProtocolKind::Builtin);
        assert_eq!(cfg.cooldown(), Duration::from_secs(5));
        assert_eq!(cfg.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn rejects_zero_cooldown() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cardgate.toml");
        fs::write(&path, "[card]\ncooldown_secs = 0\n").unwrap();

        let err = CardgateConfig::load(&path).unwrap_err();
        assert!(matches!(err, CardgateError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_unknown_card_reader() {
        let mut cfg = CardgateConfig::default();
        cfg.driver.card_reader = Some("Nowhere".into());
        assert!(matches!(
            cfg.validate().unwrap_err(),
            CardgateError::InvalidConfig(_)
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = CardgateConfig::load("/nonexistent/cardgate.toml").unwrap_err();
        assert_eq!(err.code(), "CG1000");
    }
}
