//! Livefire configuration
//!
//! Loaded from a TOML file; secrets may come from the environment instead.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::revert::RevertOptions;
use crate::types::{ConnectionParams, DEFAULT_MANAGEMENT_PORT};
use crate::{Error, Result};

/// Default baseline snapshot name
pub const DEFAULT_SNAPSHOT_NAME: &str = "BASELINE";

/// Livefire configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivefireConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// Hypervisor management endpoint
    pub hypervisor: HypervisorConfig,

    /// Revert behavior
    pub revert: RevertConfig,

    /// Admin service
    pub server: ServerConfig,
}

impl Default for LivefireConfig {
    fn default() -> Self {
        Self {
            store_path: crate::default_store_path(),
            hypervisor: HypervisorConfig::default(),
            revert: RevertConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

/// Hypervisor connection settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Management endpoint host, or a full URL
    pub host: String,

    pub port: u16,

    pub username: String,

    /// Inline password. Prefer `password_env`.
    pub password: Option<String>,

    /// Environment variable holding the password
    pub password_env: Option<String>,

    /// Skip TLS certificate validation for hypervisor connections only
    pub ignore_ssl: bool,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_MANAGEMENT_PORT,
            username: String::new(),
            password: None,
            password_env: None,
            ignore_ssl: false,
        }
    }
}

impl std::fmt::Debug for HypervisorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HypervisorConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("password_env", &self.password_env)
            .field("ignore_ssl", &self.ignore_ssl)
            .finish()
    }
}

/// Revert settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RevertConfig {
    /// Baseline snapshot used when a target has no override
    pub snapshot_name: String,

    pub revert_timeout_secs: u64,

    pub power_on_timeout_secs: u64,

    pub poll_interval_ms: u64,
}

impl Default for RevertConfig {
    fn default() -> Self {
        let options = RevertOptions::default();
        Self {
            snapshot_name: DEFAULT_SNAPSHOT_NAME.to_string(),
            revert_timeout_secs: options.revert_timeout.as_secs(),
            power_on_timeout_secs: options.power_on_timeout.as_secs(),
            poll_interval_ms: options.poll_interval.as_millis() as u64,
        }
    }
}

impl RevertConfig {
    /// A zero bound would give up on a task right after issuing it
    pub fn validate(&self) -> Result<()> {
        for (key, value) in [
            ("revert.revert_timeout_secs", self.revert_timeout_secs),
            ("revert.power_on_timeout_secs", self.power_on_timeout_secs),
            ("revert.poll_interval_ms", self.poll_interval_ms),
        ] {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{} must be greater than zero", key)));
            }
        }
        Ok(())
    }
}

/// Admin service settings
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,

    /// Token required on every admin route. Generated at startup when unset.
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            admin_token: None,
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("listen", &self.listen)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl LivefireConfig {
    /// Load configuration from file, falling back to defaults when it is missing
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)
                .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
            config.revert.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `LIVEFIRE_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(password) = non_empty("LIVEFIRE_HYPERVISOR_PASSWORD") {
            self.hypervisor.password = Some(password);
        }
        if let Some(token) = non_empty("LIVEFIRE_ADMIN_TOKEN") {
            self.server.admin_token = Some(token);
        }
        if let Some(listen) = non_empty("LIVEFIRE_WEB_ADDR") {
            self.server.listen = listen;
        }
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("state.db")
    }

    /// Connection parameters for the configured hypervisor
    pub fn connection_params(&self) -> Result<ConnectionParams> {
        self.connection_params_with(|key| std::env::var(key).ok())
    }

    fn connection_params_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<ConnectionParams> {
        let hv = &self.hypervisor;
        if hv.host.trim().is_empty() {
            return Err(Error::InvalidConfig("hypervisor.host is not set".to_string()));
        }
        if hv.username.trim().is_empty() {
            return Err(Error::InvalidConfig("hypervisor.username is not set".to_string()));
        }

        let password = match (&hv.password_env, &hv.password) {
            (Some(var), _) => lookup(var).ok_or_else(|| {
                Error::InvalidConfig(format!("environment variable {} is not set", var))
            })?,
            (None, Some(password)) => password.clone(),
            (None, None) => {
                return Err(Error::InvalidConfig(
                    "hypervisor.password or hypervisor.password_env is required".to_string(),
                ))
            }
        };

        Ok(ConnectionParams::new(hv.host.clone(), hv.username.clone(), password)
            .with_port(hv.port)
            .with_ignore_ssl(hv.ignore_ssl))
    }

    /// Task wait bounds for the revert operation
    pub fn revert_options(&self) -> RevertOptions {
        RevertOptions {
            revert_timeout: Duration::from_secs(self.revert.revert_timeout_secs),
            power_on_timeout: Duration::from_secs(self.revert.power_on_timeout_secs),
            poll_interval: Duration::from_millis(self.revert.poll_interval_ms.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
store_path = "/var/lib/livefire"

[hypervisor]
host = "vcenter.ctf.lab"
username = "svc-livefire@vsphere.local"
password_env = "VCENTER_PASSWORD"
ignore_ssl = true

[revert]
snapshot_name = "CLEAN"
power_on_timeout_secs = 120
"#;

    #[test]
    fn test_parse_partial_file() {
        let config: LivefireConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.store_path, PathBuf::from("/var/lib/livefire"));
        assert_eq!(config.hypervisor.port, 443);
        assert!(config.hypervisor.ignore_ssl);
        assert_eq!(config.revert.snapshot_name, "CLEAN");
        assert_eq!(config.revert.revert_timeout_secs, 600);
        assert_eq!(config.server.listen, "127.0.0.1:8080");

        let options = config.revert_options();
        assert_eq!(options.power_on_timeout, Duration::from_secs(120));
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/livefire/state.db"));
    }

    #[test]
    fn test_password_from_env() {
        let config: LivefireConfig = toml::from_str(SAMPLE).unwrap();

        let params = config
            .connection_params_with(|key| (key == "VCENTER_PASSWORD").then(|| "pw".to_string()))
            .unwrap();
        assert_eq!(params.password, "pw");
        assert_eq!(params.host, "vcenter.ctf.lab");
        assert!(params.ignore_ssl);

        let err = config.connection_params_with(|_| None).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(ref msg) if msg.contains("VCENTER_PASSWORD")));
    }

    #[test]
    fn test_missing_host_rejected() {
        let config = LivefireConfig::default();
        assert!(matches!(
            config.connection_params_with(|_| None),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let mut config = LivefireConfig::default();
        config.apply_overrides(|key| match key {
            "LIVEFIRE_ADMIN_TOKEN" => Some("tok".to_string()),
            "LIVEFIRE_WEB_ADDR" => Some("0.0.0.0:9000".to_string()),
            "LIVEFIRE_HYPERVISOR_PASSWORD" => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(config.server.admin_token.as_deref(), Some("tok"));
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert!(config.hypervisor.password.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = LivefireConfig::default();
        config.hypervisor.host = "10.0.0.5".to_string();
        config.revert.snapshot_name = "GOLDEN".to_string();
        config.save(&path).unwrap();

        let loaded = LivefireConfig::load(&path).unwrap();
        assert_eq!(loaded.hypervisor.host, "10.0.0.5");
        assert_eq!(loaded.revert.snapshot_name, "GOLDEN");

        let missing = LivefireConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(missing.revert.snapshot_name, DEFAULT_SNAPSHOT_NAME);
    }

    #[test]
    fn test_zero_timeouts_rejected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        std::fs::write(&path, "[revert]\nrevert_timeout_secs = 0\n").unwrap();
        let err = LivefireConfig::load(&path).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(ref msg) if msg.contains("revert_timeout_secs")));

        std::fs::write(&path, "[revert]\npower_on_timeout_secs = 0\n").unwrap();
        assert!(LivefireConfig::load(&path).is_err());

        std::fs::write(&path, "[revert]\nrevert_timeout_secs = 30\n").unwrap();
        let config = LivefireConfig::load(&path).unwrap();
        assert_eq!(config.revert_options().revert_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut config = LivefireConfig::default();
        config.hypervisor.password = Some("hunter2".to_string());
        config.server.admin_token = Some("letmein".to_string());
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("letmein"));
    }
}
