use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use beacon_core::attribution::{Launch, NotificationLaunch};
use beacon_core::bus::{EventBus, EventListener};
use beacon_core::config::{data_dir, DeviceMetadata, RemoteConfig};
use beacon_core::events::Event;
use beacon_core::queue::RequestStore;
use beacon_core::session::{SessionManager, ALL_STATES};
use beacon_core::NoInstallReferrer;
use clap::Subcommand;

#[derive(Subcommand)]
pub enum SessionAction {
    /// Run one session lifecycle end to end and print what happened
    Simulate {
        /// User id to identify as
        #[arg(long)]
        user: String,
        /// Email attached to the identity
        #[arg(long)]
        email: Option<String>,
        /// Deep link that launched the app
        #[arg(long)]
        deep_link: Option<String>,
        /// Notification id that launched the app
        #[arg(long)]
        notif_id: Option<String>,
        /// Treat this as the install launch
        #[arg(long)]
        first_launch: bool,
        /// API hostname; skips the remote-config fetch
        #[arg(long)]
        hostname: Option<String>,
        /// Config file (defaults to beacon.toml in the data dir)
        #[arg(long)]
        config: Option<PathBuf>,
        /// App id (with --api-secret, skips the config file)
        #[arg(long)]
        app_id: Option<String>,
        /// API secret
        #[arg(long)]
        api_secret: Option<String>,
        /// Request store path
        #[arg(long)]
        db: Option<PathBuf>,
        /// Seconds to let background work settle
        #[arg(long, default_value = "3")]
        wait_secs: u64,
    },
    /// Print the state machine's transition table as JSON
    Transitions,
}

/// Streams bus events to stdout as JSON lines.
struct PrintListener;

impl EventListener for PrintListener {
    fn on_event(&self, event: &Event) {
        if let Ok(json) = serde_json::to_string(event) {
            println!("{json}");
        }
    }
}

pub fn run(action: SessionAction) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        SessionAction::Simulate {
            user,
            email,
            deep_link,
            notif_id,
            first_launch,
            hostname,
            config,
            app_id,
            api_secret,
            db,
            wait_secs,
        } => simulate(SimulateArgs {
            user,
            email,
            deep_link,
            notif_id,
            first_launch,
            hostname,
            config,
            app_id,
            api_secret,
            db,
            wait_secs,
        }),
        SessionAction::Transitions => transitions(),
    }
}

struct SimulateArgs {
    user: String,
    email: Option<String>,
    deep_link: Option<String>,
    notif_id: Option<String>,
    first_launch: bool,
    hostname: Option<String>,
    config: Option<PathBuf>,
    app_id: Option<String>,
    api_secret: Option<String>,
    db: Option<PathBuf>,
    wait_secs: u64,
}

fn simulate(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_app_config(args.config, args.app_id, args.api_secret)?;
    let dir = data_dir()?;
    let device = DeviceMetadata::detect(&dir)?;
    let store = Arc::new(RequestStore::open(&super::request_db_path(args.db)?)?);
    let runtime = super::runtime()?;

    let bus = Arc::new(EventBus::new());
    bus.add_listener(Arc::new(PrintListener));

    let manager = SessionManager::new(
        config,
        device,
        store,
        bus,
        Arc::new(NoInstallReferrer),
        runtime.handle().clone(),
    );

    match args.hostname {
        Some(hostname) => manager.set_remote_config(RemoteConfig {
            hostname,
            ..RemoteConfig::default()
        }),
        None => manager.fetch_remote_config(),
    }

    let launch = if let Some(id) = args.notif_id {
        Launch::from_notification(NotificationLaunch::new(id))
    } else if let Some(link) = args.deep_link {
        Launch::from_deep_link(link)
    } else if args.first_launch {
        Launch::first_launch()
    } else {
        Launch::default()
    };

    manager.on_resume(launch);
    manager.identify_user(args.user, args.email, None);

    // The sleep future must be created inside the runtime context or tokio
    // panics with "no reactor running".
    runtime.block_on(async { tokio::time::sleep(Duration::from_secs(args.wait_secs)).await });

    if let Some(report) = manager.status() {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    manager.shutdown();
    runtime.shutdown_timeout(Duration::from_secs(2));
    Ok(())
}

fn transitions() -> Result<(), Box<dyn std::error::Error>> {
    let table: serde_json::Map<String, serde_json::Value> = ALL_STATES
        .iter()
        .map(|state| {
            (
                state.to_string(),
                serde_json::json!(state.allowed_transitions()),
            )
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&table)?);
    Ok(())
}
