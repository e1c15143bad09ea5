use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::attribution::LaunchData;
use crate::session::SessionState;

/// Every externally visible state change produces an Event.
/// The host application subscribes to these; the session machine both
/// posts them and reacts to a few of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    SessionStateChanged {
        session_id: String,
        state: SessionState,
        previous_state: SessionState,
        at: DateTime<Utc>,
    },
    /// Remote configuration arrived; sessions waiting in Created advance.
    RemoteConfigReady {
        hostname: String,
        heartbeat_interval_secs: u64,
        at: DateTime<Utc>,
    },
    /// One-shot launch attribution, published at most once per session.
    LaunchAttributed {
        session_id: String,
        launch: LaunchData,
        at: DateTime<Utc>,
    },
    /// Server asked for the push registration to be rebuilt.
    PushTokenInvalidated {
        at: DateTime<Utc>,
    },
    /// Free-form per-user payload returned by the identify call.
    AdditionalDataReceived {
        data: serde_json::Value,
        at: DateTime<Utc>,
    },
    /// Server toggled client-side log verbosity / remote shipping.
    LoggingPolicyChanged {
        verbose: bool,
        remote: bool,
        at: DateTime<Utc>,
    },
}

impl Event {
    /// Short dotted name used as the tracing event field.
    pub fn name(&self) -> &'static str {
        match self {
            Event::SessionStateChanged { .. } => "session.state",
            Event::RemoteConfigReady { .. } => "config.ready",
            Event::LaunchAttributed { .. } => "session.attribution",
            Event::PushTokenInvalidated { .. } => "push.invalidated",
            Event::AdditionalDataReceived { .. } => "user.additional_data",
            Event::LoggingPolicyChanged { .. } => "log.policy",
        }
    }
}
