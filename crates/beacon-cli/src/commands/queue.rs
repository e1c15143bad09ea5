use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use beacon_core::http::SignedHttpClient;
use beacon_core::queue::{QueuedRequest, RequestQueue, RequestStore};
use beacon_core::CoreError;
use clap::Subcommand;
use serde_json::{json, Map, Value};

#[derive(Subcommand)]
pub enum QueueAction {
    /// List persisted requests in drain order
    List {
        /// Request store path
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Persist a request without sending it
    Submit {
        /// Endpoint path, e.g. /me/events
        #[arg(long)]
        endpoint: String,
        /// JSON object payload
        #[arg(long)]
        payload: String,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Drain persisted requests against a hostname
    Drain {
        #[arg(long)]
        hostname: String,
        /// Config file carrying the signing secret
        #[arg(long)]
        config: Option<PathBuf>,
        /// App id (with --api-secret, skips the config file)
        #[arg(long)]
        app_id: Option<String>,
        /// API secret
        #[arg(long)]
        api_secret: Option<String>,
        #[arg(long)]
        db: Option<PathBuf>,
        /// Seconds to let the worker drain
        #[arg(long, default_value = "5")]
        wait_secs: u64,
    },
    /// Delete every persisted request
    Purge {
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

fn open_store(db: Option<PathBuf>) -> Result<RequestStore, CoreError> {
    let path = super::request_db_path(db)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(RequestStore::open(&path)?)
}

fn row_json(request: &QueuedRequest) -> Value {
    json!({
        "request_id": request.request_id,
        "endpoint": request.endpoint,
        "date": request.date,
        "retry_count": request.retry_count,
        "payload": request.payload,
    })
}

pub fn run(action: QueueAction) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        QueueAction::List { db } => {
            let store = open_store(db)?;
            let rows: Vec<Value> = store.pending()?.iter().map(row_json).collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        QueueAction::Submit {
            endpoint,
            payload,
            db,
        } => {
            let payload: Map<String, Value> = serde_json::from_str(&payload)?;
            let store = open_store(db)?;
            let request = QueuedRequest::new(endpoint, payload);
            store.insert(&request)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({"request_id": request.request_id}))?
            );
        }
        QueueAction::Drain {
            hostname,
            config,
            app_id,
            api_secret,
            db,
            wait_secs,
        } => {
            let config = super::load_app_config(config, app_id, api_secret)?;
            let store = Arc::new(open_store(db)?);
            let runtime = super::runtime()?;

            let queue = RequestQueue::new(
                Arc::clone(&store),
                SignedHttpClient::new(),
                config.api_secret,
                runtime.handle().clone(),
            );
            queue.set_hostname(&hostname);
            queue.start();
            // The sleep future must be created inside the runtime context or
            // tokio panics with "no reactor running".
            runtime.block_on(async { tokio::time::sleep(Duration::from_secs(wait_secs)).await });
            queue.stop();
            runtime.shutdown_timeout(Duration::from_secs(2));

            let remaining = store.pending()?.len();
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({"remaining": remaining}))?
            );
        }
        QueueAction::Purge { db } => {
            let store = open_store(db)?;
            let purged = store.purge()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({"purged": purged}))?
            );
        }
    }
    Ok(())
}
