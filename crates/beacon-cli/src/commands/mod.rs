pub mod config;
pub mod queue;
pub mod session;
pub mod sign;

use std::path::PathBuf;

use beacon_core::config::data_dir;
use beacon_core::{AppConfig, CoreError};

pub const REQUEST_DB_FILE: &str = "requests.db";
pub const APP_CONFIG_FILE: &str = "beacon.toml";

/// Resolve the application config: an explicit path, `--app-id`/`--api-secret`
/// overrides, or `beacon.toml` in the data directory.
pub fn load_app_config(
    path: Option<PathBuf>,
    app_id: Option<String>,
    api_secret: Option<String>,
) -> Result<AppConfig, CoreError> {
    if let (Some(app_id), Some(api_secret)) = (&app_id, &api_secret) {
        return Ok(AppConfig::new(app_id.clone(), api_secret.clone()));
    }
    let path = match path {
        Some(path) => path,
        None => data_dir()?.join(APP_CONFIG_FILE),
    };
    Ok(AppConfig::load(&path)?)
}

pub fn request_db_path(db: Option<PathBuf>) -> Result<PathBuf, CoreError> {
    Ok(match db {
        Some(path) => path,
        None => data_dir()?.join(REQUEST_DB_FILE),
    })
}

/// The CLI owns the runtime; core components spawn onto its handle.
pub fn runtime() -> Result<tokio::runtime::Runtime, Box<dyn std::error::Error>> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?)
}
