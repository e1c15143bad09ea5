//! Application, device, and remote configuration.
//!
//! Three layers feed the session machine:
//! - [`AppConfig`]: static per-app identity (app id, signing secret,
//!   versions), loaded from TOML or built programmatically by the host.
//! - [`DeviceMetadata`]: what the host process knows about the device it
//!   runs on; stamped into identify payloads.
//! - [`RemoteConfig`]: fetched from `/games/{app_id}/settings.json` after
//!   start; carries the API hostname and tuning knobs.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Hostname used until remote configuration supplies one.
pub const DEFAULT_HOSTNAME: &str = "gocarrot.com";

/// Reported as `sdk_version` on every request.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

const DEVICE_ID_FILE: &str = "device_id.txt";
const DEVICE_ID_PREFIX: &str = "beacon-";

/// Static per-app configuration.
///
/// Serialized to/from TOML; the host usually ships this next to its own
/// config. `api_secret` is the shared secret all queue payloads are signed
/// with and never leaves the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub app_id: String,
    pub api_secret: String,
    #[serde(default)]
    pub bundle_id: String,
    #[serde(default = "default_app_version")]
    pub app_version: String,
    #[serde(default = "default_sdk_platform")]
    pub sdk_platform: String,
    /// Seconds a backgrounded session survives before it expires.
    #[serde(default = "default_session_grace_secs")]
    pub session_grace_secs: u64,
    /// Data-collection opt flag: when false, the advertising id is never
    /// put on the wire.
    #[serde(default = "default_true")]
    pub collect_advertising_id: bool,
}

// Default functions
fn default_app_version() -> String {
    "0".into()
}
fn default_sdk_platform() -> String {
    format!("rust_{}", std::env::consts::OS)
}
fn default_session_grace_secs() -> u64 {
    120
}
fn default_true() -> bool {
    true
}
fn default_heartbeat_interval_secs() -> u64 {
    60
}
fn default_profile_batch_secs() -> f64 {
    5.0
}

impl AppConfig {
    pub fn new(app_id: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            api_secret: api_secret.into(),
            bundle_id: String::new(),
            app_version: default_app_version(),
            sdk_platform: default_sdk_platform(),
            session_grace_secs: default_session_grace_secs(),
            collect_advertising_id: true,
        }
    }

    /// Load from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if a
    /// required identity field is empty.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let cfg: AppConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// # Errors
    ///
    /// Returns an error when `app_id` or `api_secret` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_id.trim().is_empty() {
            return Err(ConfigError::MissingKey("app_id".into()));
        }
        if self.api_secret.trim().is_empty() {
            return Err(ConfigError::MissingKey("api_secret".into()));
        }
        Ok(())
    }

    /// Scheme a resolved deep-link path is rewritten onto, e.g.
    /// `beacon1234://path`.
    pub fn url_scheme(&self) -> String {
        format!("teak{}", self.app_id)
    }
}

/// What the host process knows about the device it runs on.
///
/// Everything here ends up in the identify payload; tests construct it
/// literally via [`DeviceMetadata::for_tests`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMetadata {
    pub device_id: String,
    pub device_model: String,
    /// BCP-47-ish locale tag, e.g. `en_US`.
    pub locale: String,
    /// Offset from UTC in hours, DST included.
    pub timezone_offset_hours: f64,
    pub notifications_enabled: bool,
    #[serde(default)]
    pub push_token: Option<String>,
    #[serde(default)]
    pub advertising_id: Option<String>,
    #[serde(default)]
    pub limit_ad_tracking: bool,
}

impl DeviceMetadata {
    /// Fill in what this process can detect; the persistent device id is
    /// created under `dir` on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the device id file cannot be read or created.
    pub fn detect(dir: &Path) -> Result<Self, ConfigError> {
        let device_id = get_or_create_device_id_at(dir)?;
        let locale = std::env::var("LANG")
            .ok()
            .and_then(|l| l.split('.').next().map(str::to_owned))
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| "en_US".into());
        let offset_secs = chrono::Local::now().offset().local_minus_utc();
        Ok(Self {
            device_id,
            device_model: std::env::consts::OS.into(),
            locale,
            timezone_offset_hours: f64::from(offset_secs) / 3600.0,
            notifications_enabled: true,
            push_token: None,
            advertising_id: None,
            limit_ad_tracking: false,
        })
    }

    pub fn for_tests() -> Self {
        Self {
            device_id: "beacon-00000000-0000-0000-0000-000000000000".into(),
            device_model: "test".into(),
            locale: "en_US".into(),
            timezone_offset_hours: -5.0,
            notifications_enabled: true,
            push_token: None,
            advertising_id: None,
            limit_ad_tracking: false,
        }
    }

    /// Offset formatted the way the identify endpoint expects: decimal
    /// hours with two fraction digits, e.g. `-5.00` or `5.50`.
    pub fn timezone_offset(&self) -> String {
        format!("{:.2}", self.timezone_offset_hours)
    }
}

/// Get or create the persistent device id under `path`.
/// Format: `beacon-<uuid>`.
///
/// # Errors
///
/// Returns an error if the file cannot be read/created, or holds an id
/// without the expected prefix.
pub fn get_or_create_device_id_at(path: &Path) -> Result<String, ConfigError> {
    let device_id_path = path.join(DEVICE_ID_FILE);

    if device_id_path.exists() {
        let content =
            std::fs::read_to_string(&device_id_path).map_err(|e| ConfigError::LoadFailed {
                path: device_id_path.clone(),
                message: e.to_string(),
            })?;
        let device_id = content.trim().to_string();
        if device_id.starts_with(DEVICE_ID_PREFIX) {
            return Ok(device_id);
        }
        return Err(ConfigError::InvalidValue {
            key: "device_id".into(),
            message: format!("unexpected format: {device_id}"),
        });
    }

    let device_id = format!("{}{}", DEVICE_ID_PREFIX, uuid::Uuid::new_v4());

    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| ConfigError::LoadFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
    }
    std::fs::write(&device_id_path, format!("{device_id}\n")).map_err(|e| {
        ConfigError::LoadFailed {
            path: device_id_path,
            message: e.to_string(),
        }
    })?;

    Ok(device_id)
}

/// Server-supplied configuration, fetched once per process start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// API hostname all queue traffic goes to.
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Heartbeat period in seconds; 0 disables heartbeats.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Debounce window for user-profile attribute batching, in seconds.
    #[serde(default = "default_profile_batch_secs")]
    pub profile_batch_secs: f64,
}

fn default_hostname() -> String {
    DEFAULT_HOSTNAME.into()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            profile_batch_secs: default_profile_batch_secs(),
        }
    }
}

impl RemoteConfig {
    /// Parse the `settings.json` response body. Absent or null fields keep
    /// their defaults; the hostname arrives under `auth`.
    pub fn from_response(response: &serde_json::Value) -> Self {
        let mut cfg = Self::default();
        if let Some(auth) = response.get("auth").and_then(|v| v.as_str()) {
            if !auth.is_empty() {
                cfg.hostname = auth.to_string();
            }
        }
        if let Some(interval) = response.get("heartbeat_interval").and_then(|v| v.as_u64()) {
            cfg.heartbeat_interval_secs = interval;
        }
        if let Some(batch) = response.get("batch") {
            if let Some(time) = batch.get("time").and_then(|v| v.as_f64()) {
                cfg.profile_batch_secs = time;
            }
        }
        cfg
    }
}

/// Returns `~/.config/beacon[-dev]/` based on BEACON_ENV.
///
/// Set BEACON_ENV=dev to use a separate development data directory.
///
/// # Errors
/// Returns an error if the directory cannot be created.
pub fn data_dir() -> Result<PathBuf, ConfigError> {
    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("BEACON_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("beacon-dev")
    } else {
        base_dir.join("beacon")
    };

    std::fs::create_dir_all(&dir).map_err(|e| ConfigError::LoadFailed {
        path: dir.clone(),
        message: e.to_string(),
    })?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn app_config_toml_roundtrip() {
        let cfg = AppConfig::new("1138", "secret");
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.app_id, "1138");
        assert_eq!(parsed.session_grace_secs, 120);
    }

    #[test]
    fn app_config_defaults_fill_missing_fields() {
        let parsed: AppConfig =
            toml::from_str("app_id = \"1138\"\napi_secret = \"s\"\n").unwrap();
        assert_eq!(parsed.app_version, "0");
        assert_eq!(parsed.session_grace_secs, 120);
        assert!(parsed.sdk_platform.starts_with("rust_"));
        assert!(parsed.collect_advertising_id);
    }

    #[test]
    fn app_config_validate_rejects_empty_identity() {
        let cfg = AppConfig::new("", "secret");
        assert!(cfg.validate().is_err());
        let cfg = AppConfig::new("1138", " ");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn url_scheme_embeds_app_id() {
        let cfg = AppConfig::new("1138", "secret");
        assert_eq!(cfg.url_scheme(), "teak1138");
    }

    #[test]
    fn device_id_created_then_reread() {
        let tmp = TempDir::new().unwrap();
        let first = get_or_create_device_id_at(tmp.path()).unwrap();
        let second = get_or_create_device_id_at(tmp.path()).unwrap();
        assert!(first.starts_with(DEVICE_ID_PREFIX));
        assert_eq!(first.len(), DEVICE_ID_PREFIX.len() + 36);
        assert_eq!(first, second);
    }

    #[test]
    fn device_id_rejects_foreign_format() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(DEVICE_ID_FILE), "something-else\n").unwrap();
        assert!(get_or_create_device_id_at(tmp.path()).is_err());
    }

    #[test]
    fn timezone_offset_formats_two_decimals() {
        let mut meta = DeviceMetadata::for_tests();
        assert_eq!(meta.timezone_offset(), "-5.00");
        meta.timezone_offset_hours = 5.5;
        assert_eq!(meta.timezone_offset(), "5.50");
        meta.timezone_offset_hours = 0.0;
        assert_eq!(meta.timezone_offset(), "0.00");
    }

    #[test]
    fn remote_config_from_response_reads_auth_hostname() {
        let body = serde_json::json!({
            "auth": "api.example.com",
            "heartbeat_interval": 30,
            "batch": { "time": 2.5, "count": 10 }
        });
        let cfg = RemoteConfig::from_response(&body);
        assert_eq!(cfg.hostname, "api.example.com");
        assert_eq!(cfg.heartbeat_interval_secs, 30);
        assert!((cfg.profile_batch_secs - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn remote_config_defaults_on_empty_response() {
        let cfg = RemoteConfig::from_response(&serde_json::json!({}));
        assert_eq!(cfg.hostname, DEFAULT_HOSTNAME);
        assert_eq!(cfg.heartbeat_interval_secs, 60);
    }

    #[test]
    fn remote_config_ignores_null_auth() {
        let cfg = RemoteConfig::from_response(&serde_json::json!({ "auth": null }));
        assert_eq!(cfg.hostname, DEFAULT_HOSTNAME);
    }
}
