use std::path::PathBuf;

use beacon_core::config::{data_dir, DeviceMetadata};
use beacon_core::{AppConfig, CoreError};
use clap::Subcommand;
use serde_json::json;

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the resolved configuration as JSON
    Show {
        /// Config file (defaults to beacon.toml in the data dir)
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Write a starter config file
    Init {
        #[arg(long)]
        app_id: String,
        #[arg(long)]
        api_secret: String,
        #[arg(long)]
        path: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print detected device metadata as JSON
    Device,
}

fn config_path(path: Option<PathBuf>) -> Result<PathBuf, CoreError> {
    Ok(match path {
        Some(path) => path,
        None => data_dir()?.join(super::APP_CONFIG_FILE),
    })
}

pub fn run(action: ConfigAction) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        ConfigAction::Show { path } => {
            let config = AppConfig::load(&config_path(path)?)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigAction::Init {
            app_id,
            api_secret,
            path,
            force,
        } => {
            let path = config_path(path)?;
            if path.exists() && !force {
                return Err(format!("{} exists; pass --force to overwrite", path.display()).into());
            }
            let config = AppConfig::new(app_id, api_secret);
            config.validate()?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, toml::to_string_pretty(&config)?)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({"written": path.display().to_string()}))?
            );
        }
        ConfigAction::Device => {
            let dir = data_dir()?;
            let device = DeviceMetadata::detect(&dir)?;
            println!("{}", serde_json::to_string_pretty(&device)?);
        }
    }
    Ok(())
}
