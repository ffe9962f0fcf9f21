//! Configuration and persisted alias/token storage.

use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default)]
    pub host_ip: Option<String>,
    #[serde(default = "default_product")]
    pub product: String,
    #[serde(default)]
    pub aliases: String,
    #[serde(default)]
    pub location_url: Option<String>,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default = "default_platform_version")]
    pub platform_version: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_notify_interval")]
    pub plex_notify_interval: f64,
    #[serde(default = "default_config_path")]
    pub config_path: String,
    #[serde(default = "default_data_file_name")]
    pub data_file_name: String,
}

fn default_http_port() -> u16 {
    32488
}
fn default_product() -> String {
    "Plex DLNA Bridge".to_string()
}
fn default_platform() -> String {
    "Linux".to_string()
}
fn default_platform_version() -> String {
    "1".to_string()
}
fn default_version() -> String {
    "1".to_string()
}
fn default_notify_interval() -> f64 {
    0.5
}
fn default_config_path() -> String {
    "config".to_string()
}
fn default_data_file_name() -> String {
    "data.json".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            host_ip: None,
            product: default_product(),
            aliases: String::new(),
            location_url: None,
            platform: default_platform(),
            platform_version: default_platform_version(),
            version: default_version(),
            plex_notify_interval: default_notify_interval(),
            config_path: default_config_path(),
            data_file_name: default_data_file_name(),
        }
    }
}

/// Load layered config: defaults -> optional file under `./config` -> `BRIDGE_` env vars.
pub fn load_config() -> Result<Config> {
    let builder = ::config::Config::builder()
        .set_default("http_port", 32488)?
        .set_default("product", default_product())?
        .set_default("platform", default_platform())?
        .set_default("platform_version", default_platform_version())?
        .set_default("version", default_version())?
        .set_default("plex_notify_interval", default_notify_interval())?
        .set_default("config_path", default_config_path())?
        .set_default("data_file_name", default_data_file_name())?
        .add_source(::config::File::with_name("config").required(false))
        .add_source(
            ::config::Environment::with_prefix("BRIDGE")
                .separator("__")
                .try_parsing(true),
        );
    Ok(builder.build()?.try_deserialize()?)
}

#[derive(Debug, Clone, Default, serde::Serialize, Deserialize)]
struct DeviceData {
    #[serde(skip_serializing_if = "Option::is_none")]
    alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
}

/// Persisted `{uuid: {alias?, token?}}` store backing `config/data.json`.
///
/// Absent or malformed file resolves to an empty map; every write overwrites
/// the whole file after ensuring the parent directory exists.
#[derive(Clone)]
pub struct DataStore {
    path: PathBuf,
    data: Arc<RwLock<HashMap<String, DeviceData>>>,
}

impl DataStore {
    pub fn new(config_path: &str, data_file_name: &str) -> Self {
        let path = PathBuf::from(config_path).join(data_file_name);
        let data = Self::load_from_disk(&path);
        Self {
            path,
            data: Arc::new(RwLock::new(data)),
        }
    }

    fn load_from_disk(path: &PathBuf) -> HashMap<String, DeviceData> {
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => HashMap::new(),
        }
    }

    async fn save_to_disk(&self) {
        let data = self.data.read().await;
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Ok(json) = serde_json::to_string_pretty(&*data) {
            if let Err(e) = fs::write(&self.path, json) {
                tracing::warn!("failed to write {}: {}", self.path.display(), e);
            }
        }
    }

    pub async fn alias_for_uuid(&self, uuid: &str) -> Option<String> {
        self.data.read().await.get(uuid).and_then(|d| d.alias.clone())
    }

    pub async fn save_alias(&self, uuid: &str, alias: &str) {
        {
            let mut data = self.data.write().await;
            data.entry(uuid.to_string()).or_default().alias = Some(alias.to_string());
        }
        self.save_to_disk().await;
    }

    pub async fn token_for_uuid(&self, uuid: &str) -> Option<String> {
        self.data.read().await.get(uuid).and_then(|d| d.token.clone())
    }

    pub async fn set_token_for_uuid(&self, uuid: &str, token: &str) {
        {
            let mut data = self.data.write().await;
            data.entry(uuid.to_string()).or_default().token = Some(token.to_string());
        }
        self.save_to_disk().await;
    }
}

/// Resolve a device's display name: data-store alias, else the `k:v,k:v`
/// configured alias list matched against uuid/name/ip, else the raw name.
pub fn apply_alias(configured_aliases: &str, stored_alias: Option<&str>, uuid: &str, name: &str, ip: &str) -> String {
    if let Some(alias) = stored_alias {
        return alias.to_string();
    }
    if configured_aliases.is_empty() {
        return name.to_string();
    }
    for entry in configured_aliases.split(',') {
        if let Some((k, v)) = entry.split_once(':') {
            let k = k.trim();
            if k == uuid.trim() || k == name.trim() || k == ip.trim() {
                return v.trim().to_string();
            }
        }
    }
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_prefers_stored_alias() {
        assert_eq!(
            apply_alias("", Some("Living Room"), "uuid-1", "TV", "10.0.0.5"),
            "Living Room"
        );
    }

    #[test]
    fn alias_falls_back_to_configured_list() {
        let aliases = "uuid-1:Bedroom, 10.0.0.9:Kitchen";
        assert_eq!(apply_alias(aliases, None, "uuid-1", "TV", "10.0.0.5"), "Bedroom");
        assert_eq!(apply_alias(aliases, None, "uuid-2", "TV", "10.0.0.9"), "Kitchen");
    }

    #[test]
    fn alias_falls_back_to_raw_name() {
        assert_eq!(apply_alias("", None, "uuid-1", "TV", "10.0.0.5"), "TV");
    }

    #[tokio::test]
    async fn data_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config");
        let store = DataStore::new(config_path.to_str().unwrap(), "data.json");
        store.save_alias("uuid-1", "Living Room").await;
        store.set_token_for_uuid("uuid-1", "tok-abc").await;

        let reloaded = DataStore::new(config_path.to_str().unwrap(), "data.json");
        assert_eq!(reloaded.alias_for_uuid("uuid-1").await.as_deref(), Some("Living Room"));
        assert_eq!(reloaded.token_for_uuid("uuid-1").await.as_deref(), Some("tok-abc"));
    }

    #[tokio::test]
    async fn data_store_defaults_to_empty_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config");
        let store = DataStore::new(config_path.to_str().unwrap(), "data.json");
        assert_eq!(store.alias_for_uuid("missing").await, None);
    }
}
