//! Bridge configuration: a settings file, then environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::{Credentials, DEFAULT_TOKEN_ENV};
use crate::host::HostInfo;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 6400;
pub const DEFAULT_MOUNT_PATH: &str = "/bridge";
pub const DEFAULT_CONTEXT_PUSH_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_STATE_DIR: &str = ".editor-bridge";
const TOKEN_FILE_NAME: &str = "bridge-token";

/// On-disk settings. Every field is optional; missing ones take defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub mount_path: Option<String>,
    pub context_push_interval_ms: Option<u64>,
    pub auto_connect: Option<bool>,
    pub token_env_var: Option<String>,
    pub token_file: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub host_name: Option<String>,
    pub host_version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub listen_host: String,
    pub port: u16,
    pub mount_path: String,
    pub context_push_interval: Duration,
    pub auto_connect: bool,
    pub token_env_var: String,
    pub token_file: Option<PathBuf>,
    pub state_dir: PathBuf,
    pub host_info: HostInfo,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from_settings(BridgeSettings::default())
    }
}

impl BridgeConfig {
    pub fn from_settings(settings: BridgeSettings) -> Self {
        let state_dir = settings
            .state_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));
        let token_file = settings
            .token_file
            .or_else(|| Some(state_dir.join(TOKEN_FILE_NAME)));
        let defaults = HostInfo::default();
        Self {
            listen_host: settings
                .host
                .filter(|h| !h.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: settings.port.unwrap_or(DEFAULT_PORT),
            mount_path: settings
                .mount_path
                .filter(|p| p.starts_with('/'))
                .unwrap_or_else(|| DEFAULT_MOUNT_PATH.to_string()),
            context_push_interval: settings
                .context_push_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CONTEXT_PUSH_INTERVAL),
            auto_connect: settings.auto_connect.unwrap_or(true),
            token_env_var: settings
                .token_env_var
                .unwrap_or_else(|| DEFAULT_TOKEN_ENV.to_string()),
            token_file,
            state_dir,
            host_info: HostInfo {
                name: settings.host_name.unwrap_or(defaults.name),
                version: settings.host_version.unwrap_or(defaults.version),
            },
        }
    }

    /// Settings file under the user config dir, then `EDITOR_BRIDGE_*` overrides.
    pub fn load() -> Self {
        let settings = match settings_path() {
            Ok(path) => load_settings_from(&path),
            Err(err) => {
                tracing::debug!(error = %err, "no settings path; using defaults");
                BridgeSettings::default()
            }
        };
        let mut config = Self::from_settings(settings);
        config.apply_overrides(|name| std::env::var(name).ok());
        config
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("EDITOR_BRIDGE_HOST").filter(|v| !v.trim().is_empty()) {
            self.listen_host = host.trim().to_string();
        }
        if let Some(port) = lookup("EDITOR_BRIDGE_PORT").and_then(|v| v.trim().parse().ok()) {
            self.port = port;
        }
        if let Some(dir) = lookup("EDITOR_BRIDGE_STATE_DIR").filter(|v| !v.trim().is_empty()) {
            let dir = PathBuf::from(dir.trim());
            if self.token_file.as_ref() == Some(&self.state_dir.join(TOKEN_FILE_NAME)) {
                self.token_file = Some(dir.join(TOKEN_FILE_NAME));
            }
            self.state_dir = dir;
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.port)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::load(&self.token_env_var, self.token_file.as_deref())
    }

    pub fn store_dir(&self) -> PathBuf {
        self.state_dir.join("state")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }
}

pub fn settings_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("config dir unavailable")?;
    Ok(base.join("editor-bridge").join("settings.json"))
}

/// Missing file means defaults; a malformed file is logged and ignored.
pub fn load_settings_from(path: &Path) -> BridgeSettings {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return BridgeSettings::default();
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to read bridge settings");
            return BridgeSettings::default();
        }
    };
    match serde_json::from_str(&raw) {
        Ok(settings) => settings,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring malformed bridge settings");
            BridgeSettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_loopback_and_auto_connect() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.listen_addr(), "127.0.0.1:6400");
        assert_eq!(cfg.mount_path, "/bridge");
        assert!(cfg.auto_connect);
        assert_eq!(cfg.context_push_interval, Duration::from_secs(2));
        assert_eq!(
            cfg.token_file.as_deref(),
            Some(Path::new(".editor-bridge/bridge-token"))
        );
    }

    #[test]
    fn settings_file_uses_camel_case() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"port": 7100, "contextPushIntervalMs": 500, "autoConnect": false, "mountPath": "/ws", "hostName": "SceneEditor"}"#,
        )
        .unwrap();
        let cfg = BridgeConfig::from_settings(load_settings_from(&path));
        assert_eq!(cfg.port, 7100);
        assert_eq!(cfg.context_push_interval, Duration::from_millis(500));
        assert!(!cfg.auto_connect);
        assert_eq!(cfg.mount_path, "/ws");
        assert_eq!(cfg.host_info.name, "SceneEditor");
    }

    #[test]
    fn malformed_or_missing_settings_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_settings_from(&dir.path().join("absent.json"))
            .port
            .is_none());
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ port: ").unwrap();
        assert!(load_settings_from(&path).port.is_none());
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("EDITOR_BRIDGE_HOST", "0.0.0.0"),
            ("EDITOR_BRIDGE_PORT", "7200"),
            ("EDITOR_BRIDGE_STATE_DIR", "/tmp/project/.bridge"),
        ]
        .into_iter()
        .collect();
        let mut cfg = BridgeConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.listen_addr(), "0.0.0.0:7200");
        assert_eq!(cfg.state_dir, PathBuf::from("/tmp/project/.bridge"));
        assert_eq!(
            cfg.token_file,
            Some(PathBuf::from("/tmp/project/.bridge/bridge-token"))
        );
    }

    #[test]
    fn unparsable_port_override_is_ignored() {
        let mut cfg = BridgeConfig::default();
        cfg.apply_overrides(|k| (k == "EDITOR_BRIDGE_PORT").then(|| "http".to_string()));
        assert_eq!(cfg.port, DEFAULT_PORT);
    }
}
