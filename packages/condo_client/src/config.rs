use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use condo_sync::{Identity, SyncConfig, UserId};

// =============================================================================
// Client config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [api]
//                    base_url = "https://condominio.example/api"
//
//   env var:         CONDO_API__BASE_URL=...   (double underscore = nesting)

/// Top-level configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub api: ApiFileConfig,
    #[serde(default)]
    pub realtime: RealtimeFileConfig,
    #[serde(default)]
    pub sync: SyncFileConfig,
    #[serde(default)]
    pub user: UserFileConfig,
}

/// REST backend (lives under `[api]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiFileConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ApiFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Pusher-compatible realtime server (lives under `[realtime]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RealtimeFileConfig {
    #[serde(default = "default_realtime_url")]
    pub url: String,
    #[serde(default = "default_app_key")]
    pub app_key: String,
    /// Seconds of silence before the client pings the server.
    #[serde(default = "default_activity_timeout_secs")]
    pub activity_timeout_secs: u64,
}

impl Default for RealtimeFileConfig {
    fn default() -> Self {
        Self {
            url: default_realtime_url(),
            app_key: default_app_key(),
            activity_timeout_secs: default_activity_timeout_secs(),
        }
    }
}

/// Engine tunables (lives under `[sync]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncFileConfig {
    #[serde(default = "default_reconciliation_window_secs")]
    pub reconciliation_window_secs: u64,
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
}

impl Default for SyncFileConfig {
    fn default() -> Self {
        Self {
            reconciliation_window_secs: default_reconciliation_window_secs(),
            channel_buffer: default_channel_buffer(),
        }
    }
}

/// Who the client acts as (lives under `[user]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserFileConfig {
    #[serde(default = "default_user_id")]
    pub id: u64,
    #[serde(default = "default_user_name")]
    pub name: String,
}

impl Default for UserFileConfig {
    fn default() -> Self {
        Self {
            id: default_user_id(),
            name: default_user_name(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8000/api".to_string()
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_realtime_url() -> String {
    "ws://localhost:8080".to_string()
}
fn default_app_key() -> String {
    "condo".to_string()
}
fn default_activity_timeout_secs() -> u64 {
    120
}
fn default_reconciliation_window_secs() -> u64 {
    30
}
fn default_channel_buffer() -> usize {
    256
}
fn default_user_id() -> u64 {
    1
}
fn default_user_name() -> String {
    "Administrador".to_string()
}

/// Build a figment that layers: defaults → config.toml → CONDO_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `CONDO_API__BASE_URL=...`  →  `api.base_url = ...`
///   `CONDO_USER__ID=7`  →  `user.id = 7`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("config.toml")))
        .merge(Env::prefixed("CONDO_").split("__"))
}

/// Resolved client configuration.
#[derive(Clone, Debug)]
pub struct CondoConfig {
    pub config_dir: PathBuf,
    pub file: FileConfig,
}

impl CondoConfig {
    pub fn new(config_dir: Option<PathBuf>) -> Result<Self> {
        let config_dir = match config_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not determine home directory")?
                .join(".condo"),
        };
        let file: FileConfig = load_config(&config_dir)
            .extract()
            .with_context(|| format!("Invalid configuration in {}", config_dir.display()))?;
        Ok(Self { config_dir, file })
    }

    pub fn identity(&self) -> Identity {
        Identity::new(UserId(self.file.user.id), self.file.user.name.clone())
    }

    pub fn sync(&self) -> SyncConfig {
        SyncConfig {
            reconciliation_window: Duration::from_secs(self.file.sync.reconciliation_window_secs),
            channel_buffer: self.file.sync.channel_buffer.max(1),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.file.api.timeout_secs)
    }

    pub fn activity_timeout(&self) -> Duration {
        Duration::from_secs(self.file.realtime.activity_timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // ── CondoConfig::new ────────────────────────────────────────────────

    #[test]
    fn defaults_without_file() {
        let dir = TempDir::new().unwrap();
        let config = CondoConfig::new(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(config.file.api.base_url, "http://localhost:8000/api");
        assert_eq!(config.file.realtime.app_key, "condo");
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.sync().reconciliation_window, Duration::from_secs(30));
        assert_eq!(config.sync().channel_buffer, 256);
        assert_eq!(config.identity(), Identity::new(UserId(1), "Administrador"));
    }

    #[test]
    fn toml_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
[api]
base_url = "https://condominio.example/api"

[user]
id = 7
name = "María López"

[sync]
reconciliation_window_secs = 5
"#,
        )
        .unwrap();

        let config = CondoConfig::new(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(config.file.api.base_url, "https://condominio.example/api");
        assert_eq!(config.file.api.timeout_secs, 10);
        assert_eq!(config.identity().id, UserId(7));
        assert_eq!(config.identity().name, "María López");
        assert_eq!(config.sync().reconciliation_window, Duration::from_secs(5));
    }

    // ── env layering (inside figment's Jail) ────────────────────────────

    #[test]
    fn env_overrides_toml() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("config.toml", "[user]\nid = 7\n")?;
            jail.set_env("CONDO_USER__ID", "9");
            jail.set_env("CONDO_REALTIME__APP_KEY", "reverb-key");

            let file: FileConfig = load_config(jail.directory()).extract()?;
            assert_eq!(file.user.id, 9);
            assert_eq!(file.realtime.app_key, "reverb-key");
            assert_eq!(file.realtime.url, "ws://localhost:8080");
            Ok(())
        });
    }

    #[test]
    fn invalid_value_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.toml"), "[user]\nid = \"nobody\"\n").unwrap();
        assert!(CondoConfig::new(Some(dir.path().to_path_buf())).is_err());
    }
}
