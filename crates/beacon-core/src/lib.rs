//! # Beacon Core Library
//!
//! This library provides the client-side engine of the Beacon attribution
//! SDK: session lifecycle, durable signed-request delivery, launch
//! attribution, and the identify-user handshake. Host applications embed
//! it and feed lifecycle events to a [`SessionManager`]; the companion
//! CLI drives the same operations for development and inspection.
//!
//! ## Architecture
//!
//! - **Session**: A wall-clock-based state machine tracking one period of
//!   app engagement, with lazy expiry and a single current session
//! - **Queue**: SQLite-backed delivery of signed requests that survives
//!   restarts and retries transient failures in order
//! - **Attribution**: Async resolution of what caused a launch, consumed
//!   through a shared future that never blocks session startup
//! - **Bus**: Process-internal event fan-out for host applications
//!
//! ## Key Components
//!
//! - [`SessionManager`]: Owns the current session and its transitions
//! - [`RequestQueue`]: Durable signed-request delivery
//! - [`AttributionResolver`]: Launch classification and link resolution
//! - [`AppConfig`]: Application configuration management

pub mod attribution;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod profile;
pub mod queue;
pub mod session;
pub mod signing;

pub use attribution::{
    AttributionResolver, InstallReferrerSource, Launch, LaunchData, LaunchResolution,
    NoInstallReferrer,
};
pub use bus::{EventBus, EventListener, ListenerId};
pub use config::{AppConfig, DeviceMetadata, RemoteConfig};
pub use error::{ConfigError, CoreError, ResolveError, StoreError};
pub use events::Event;
pub use profile::UserProfile;
pub use queue::{QueuedRequest, RequestQueue, RequestStore, ResponseClass};
pub use session::{Session, SessionManager, SessionReport, SessionState, UserHandle};
