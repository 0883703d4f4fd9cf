//! Daemon configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via KVLINK_CONFIG)
//! 3. Environment variables
//!
//! ```yaml
//! server:
//!   location: ./data
//!   port: 8081
//!   autostart: true
//!   sync: true          # unrecognized keys go to the store
//! auth:
//!   users:
//!     root: 9f86d081...  # sha256 of the password
//!   secrets_file: /etc/kvlink/users
//! access:
//!   writers: [root]
//! manifest_out: ./manifest.json
//! ```

use crate::hooks::{PasswordAuthenticator, WriterPolicy};
use crate::server::ServerConfig;
use kvlink_core::{ConfigError, OptionMap};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Server option map, as accepted by [`ServerConfig::from_options`].
    pub server: OptionMap,
    pub auth: AuthConfig,
    pub access: AccessConfig,
    /// Where to write the server manifest on startup.
    pub manifest_out: Option<PathBuf>,
}

impl DaemonConfig {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("KVLINK_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Applies `KVLINK_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        const SERVER_KEYS: [(&str, &str); 6] = [
            ("KVLINK_LOCATION", "location"),
            ("KVLINK_PORT", "port"),
            ("KVLINK_HOST", "host"),
            ("KVLINK_AUTOSTART", "autostart"),
            ("KVLINK_IDLE_TIMEOUT", "idle_timeout_secs"),
            ("KVLINK_MAX_CONNECTIONS", "max_connections"),
        ];
        // Values stay strings; the option readers accept numeric strings.
        for (var, key) in SERVER_KEYS {
            if let Some(value) = lookup(var) {
                self.server.insert(key.to_string(), Value::String(value));
            }
        }

        if let Some(path) = lookup("KVLINK_MANIFEST_OUT") {
            self.manifest_out = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("KVLINK_AUTH_SECRETS_FILE") {
            self.auth.secrets_file = Some(PathBuf::from(path));
        }
    }

    /// Loads users from the secrets file if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        self.auth.load_secrets()
    }

    /// Builds the server configuration. The `auth` and `access` sections
    /// take precedence over the same keys inside `server`.
    pub fn into_server_config(self) -> Result<ServerConfig, ConfigError> {
        let mut config = ServerConfig::from_options(self.server)?;
        if !self.auth.users.is_empty() {
            config.hooks.authenticator = Some(Arc::new(PasswordAuthenticator::new(self.auth.users)));
        }
        if !self.access.writers.is_empty() {
            config.hooks.access = Some(Arc::new(WriterPolicy::new(self.access.writers)));
        }
        Ok(config)
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// user name -> SHA-256 password hash (hex).
    /// Generate hashes with: `kvlink-cli hash-password <password>`
    pub users: BTreeMap<String, String>,
    /// Optional file of `name:hash` lines.
    pub secrets_file: Option<PathBuf>,
}

impl AuthConfig {
    /// Loads users from the secrets file if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        let Some(path) = &self.secrets_file else {
            return Ok(());
        };
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (name, hash) = line.split_once(':').ok_or_else(|| ConfigError::Parse {
                path: path.clone(),
                message: format!("line {}: expected name:hash", number + 1),
            })?;
            self.users
                .insert(name.trim().to_string(), hash.trim().to_string());
        }
        Ok(())
    }
}

/// Access configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Users allowed to write. Everyone may read.
    pub writers: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert!(config.server.is_empty());
        assert!(config.auth.users.is_empty());
        assert!(config.manifest_out.is_none());
        // No location configured
        assert!(matches!(
            config.into_server_config(),
            Err(ConfigError::MissingOption("location"))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "server:\n  location: ./data\n  port: 9091\n  sync: true\naccess:\n  writers: [root]\nmanifest_out: ./manifest.json"
        )
        .unwrap();

        let config = DaemonConfig::from_file(file.path()).unwrap();
        assert_eq!(config.manifest_out, Some(PathBuf::from("./manifest.json")));
        assert_eq!(config.access.writers, vec!["root".to_string()]);

        let server = config.into_server_config().unwrap();
        assert_eq!(server.location, "./data");
        assert_eq!(server.port, 9091);
        assert!(server.store_options.sync());
        assert!(server.hooks.access.is_some());
    }

    #[test]
    fn test_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "server: [unclosed").unwrap();
        assert!(matches!(
            DaemonConfig::from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            DaemonConfig::from_file("/nonexistent/kvlink.yaml"),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("KVLINK_LOCATION", "/var/lib/kvlink"),
            ("KVLINK_PORT", "9000"),
            ("KVLINK_AUTOSTART", "true"),
            ("KVLINK_IDLE_TIMEOUT", "60"),
            ("KVLINK_MANIFEST_OUT", "/tmp/manifest.json"),
        ]
        .into_iter()
        .collect();

        let mut config = DaemonConfig::default();
        config
            .server
            .insert("location".into(), Value::String("./data".into()));
        config.apply_overrides(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(config.manifest_out, Some(PathBuf::from("/tmp/manifest.json")));

        let server = config.into_server_config().unwrap();
        assert_eq!(server.location, "/var/lib/kvlink");
        assert_eq!(server.port, 9000);
        assert!(server.autostart);
        assert_eq!(server.idle_timeout, Some(std::time::Duration::from_secs(60)));
    }

    #[test]
    fn test_load_secrets() {
        let hash = PasswordAuthenticator::hash_password("p@ss");
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# users").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "root:{}", hash).unwrap();

        let mut config = DaemonConfig::default();
        config.auth.secrets_file = Some(file.path().to_path_buf());
        config.load_secrets().unwrap();
        assert_eq!(config.auth.users.get("root"), Some(&hash));
    }

    #[test]
    fn test_malformed_secrets() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "no-separator-here").unwrap();

        let mut auth = AuthConfig {
            secrets_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(matches!(auth.load_secrets(), Err(ConfigError::Parse { .. })));
    }
}
