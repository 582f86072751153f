use crate::error::{NoFearDbError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine settings, read from `nofeardb.yaml` in the data directory.
///
/// ```yaml
/// lock_expiration_secs: 60
/// heartbeat_interval_ms: 20000
/// pretty_json: true
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Age after which a lock file is considered stale.
    pub lock_expiration_secs: u64,
    /// How often a held lock is renewed. Defaults to half the expiration.
    pub heartbeat_interval_ms: Option<u64>,
    /// Indent document files.
    pub pretty_json: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            lock_expiration_secs: 60,
            heartbeat_interval_ms: None,
            pretty_json: true,
        }
    }
}

impl EngineConfig {
    pub const FILE_NAME: &'static str = "nofeardb.yaml";

    /// Load `<root>/nofeardb.yaml`, falling back to defaults when it does not exist.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(Self::FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let yaml = std::fs::read_to_string(&path)?;
        Self::parse_str(&yaml)
    }

    pub fn parse_str(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.lock_expiration_secs == 0 {
            return Err(NoFearDbError::Config(
                "lock_expiration_secs must be greater than zero".into(),
            ));
        }
        if self.heartbeat_interval_ms == Some(0) {
            return Err(NoFearDbError::Config(
                "heartbeat_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn lock_expiration(&self) -> Duration {
        Duration::from_secs(self.lock_expiration_secs)
    }

    /// Renewal interval, always strictly shorter than the expiration window.
    pub fn heartbeat_interval(&self) -> Duration {
        let expiration = self.lock_expiration();
        match self.heartbeat_interval_ms {
            Some(ms) => clamp_interval(Duration::from_millis(ms), expiration),
            None => expiration / 2,
        }
    }
}

pub(crate) fn clamp_interval(interval: Duration, expiration: Duration) -> Duration {
    if interval < expiration {
        interval
    } else {
        expiration / 2
    }
}
