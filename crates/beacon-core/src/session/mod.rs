//! Session lifecycle coordination.
//!
//! A [`Session`] is one bounded period of app engagement: from a resume,
//! through identification, to background-plus-grace-period. The
//! [`SessionManager`] owns the single current session, runs every state
//! transition and its side effects, and wires sessions to the request
//! queue, the attribution resolver, and the event bus.
//!
//! Expiry is lazy: nothing ticks a session into `Expired`; the check runs
//! whenever the current session is looked at.

mod identify;
mod state;

pub use state::{SessionState, ALL_STATES};

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::attribution::{
    AttributionResolver, InstallReferrerSource, Launch, LaunchData, LaunchResolution,
};
use crate::bus::EventBus;
use crate::config::{AppConfig, DeviceMetadata, RemoteConfig, SDK_VERSION};
use crate::events::Event;
use crate::http::{endpoint_url, SignedHttpClient};
use crate::profile::UserProfile;
use crate::queue::{QueuedRequest, RequestQueue, RequestStore};

/// Bound on consuming the attribution future when dispatching launch
/// events.
const ATTRIBUTION_DISPATCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Debug-build bound on lock acquisition; exceeding it is treated as a
/// deadlock and surfaced instead of hanging.
const LOCK_WAIT_MAX: Duration = Duration::from_secs(2);

/// The identity a session is (or will be) identified as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserHandle {
    pub user_id: String,
    pub email: Option<String>,
    pub facebook_id: Option<String>,
}

struct SessionInner {
    state: SessionState,
    previous_state: SessionState,
    user: Option<UserHandle>,
    /// Identity covered by the last identify submission.
    identified: Option<UserHandle>,
    identify_sent: bool,
    country_code: Option<String>,
    ends_at: Option<DateTime<Utc>>,
    resolution: LaunchResolution,
    attribution_processed: bool,
    heartbeat: Option<tokio::task::JoinHandle<()>>,
    profile: Option<Arc<UserProfile>>,
}

/// One period of app engagement. All mutation goes through the manager;
/// accessors here take short-lived locks.
pub struct Session {
    id: String,
    started_at: DateTime<Utc>,
    inner: Mutex<SessionInner>,
}

impl Session {
    fn allocate(user: Option<UserHandle>) -> Arc<Self> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            started_at: Utc::now(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Allocated,
                previous_state: SessionState::Allocated,
                user,
                identified: None,
                identify_sent: false,
                country_code: None,
                ends_at: None,
                resolution: LaunchResolution::ready(LaunchData::Unattributed),
                attribution_processed: false,
                heartbeat: None,
                profile: None,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> SessionState {
        locked(&self.inner, "session").state
    }

    pub fn previous_state(&self) -> SessionState {
        locked(&self.inner, "session").previous_state
    }

    fn state_pair(&self) -> (SessionState, SessionState) {
        let inner = locked(&self.inner, "session");
        (inner.state, inner.previous_state)
    }

    pub fn user(&self) -> Option<UserHandle> {
        locked(&self.inner, "session").user.clone()
    }

    pub fn user_id(&self) -> Option<String> {
        locked(&self.inner, "session")
            .user
            .as_ref()
            .map(|u| u.user_id.clone())
    }

    pub fn country_code(&self) -> Option<String> {
        locked(&self.inner, "session").country_code.clone()
    }

    /// Resolved launch attribution, when resolution has completed.
    pub fn attribution(&self) -> Option<LaunchData> {
        locked(&self.inner, "session").resolution.try_get()
    }

    /// Whether this session sat in `Expiring` longer than the grace
    /// period. Re-entering `Expiring` never resets the clock.
    pub fn has_expired(&self, grace_secs: u64) -> bool {
        let inner = locked(&self.inner, "session");
        if inner.state != SessionState::Expiring {
            return false;
        }
        match inner.ends_at {
            Some(ends_at) => {
                Utc::now().signed_duration_since(ends_at)
                    > chrono::Duration::seconds(grace_secs as i64)
            }
            None => false,
        }
    }

    pub fn report(&self) -> SessionReport {
        let inner = locked(&self.inner, "session");
        SessionReport {
            session_id: self.id.clone(),
            state: inner.state,
            previous_state: inner.previous_state,
            user_id: inner.user.as_ref().map(|u| u.user_id.clone()),
            country_code: inner.country_code.clone(),
            created_at: self.started_at,
            ends_at: inner.ends_at,
            attribution: inner.resolution.try_get(),
        }
    }

    fn attach_resolution(&self, resolution: LaunchResolution) {
        locked(&self.inner, "session").resolution = resolution;
    }

    /// Store the user handle; returns whether it differs from the identity
    /// the last identify submission covered.
    fn set_user(&self, user: UserHandle) -> bool {
        let mut inner = locked(&self.inner, "session");
        let changed = inner.identified.as_ref() != Some(&user);
        inner.user = Some(user);
        changed
    }

    /// Snapshot everything an identify submission needs and mark it sent.
    /// Returns `None` when no user is attached.
    fn begin_identify(&self) -> Option<(UserHandle, LaunchResolution, bool)> {
        let mut inner = locked(&self.inner, "session");
        let user = inner.user.clone()?;
        let re_identify = inner.identify_sent;
        inner.identify_sent = true;
        inner.identified = Some(user.clone());
        Some((user, inner.resolution.clone(), re_identify))
    }

    fn set_country_code(&self, country_code: String) {
        locked(&self.inner, "session").country_code = Some(country_code);
    }

    /// Server-directed attribution replacement; refused once the original
    /// attribution has been dispatched.
    fn replace_attribution(&self, data: LaunchData) -> bool {
        let mut inner = locked(&self.inner, "session");
        if inner.attribution_processed {
            return false;
        }
        inner.resolution = LaunchResolution::ready(data);
        true
    }

    fn attach_profile(&self, profile: Arc<UserProfile>) {
        locked(&self.inner, "session").profile = Some(profile);
    }

    pub fn profile(&self) -> Option<Arc<UserProfile>> {
        locked(&self.inner, "session").profile.clone()
    }

    /// Identify finished while the session was already expiring: remember
    /// the outcome so a restore goes back to `UserIdentified`.
    fn record_identified_while_expiring(&self) {
        locked(&self.inner, "session").previous_state = SessionState::UserIdentified;
    }
}

/// Serializable snapshot of the current session, for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: String,
    pub state: SessionState,
    pub previous_state: SessionState,
    pub user_id: Option<String>,
    pub country_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub attribution: Option<LaunchData>,
}

type DeferredAction = Box<dyn FnOnce(&SessionManager, &Arc<Session>) + Send>;

#[derive(Default)]
struct DeferredQueues {
    ready: Vec<DeferredAction>,
    ready_or_was: Vec<DeferredAction>,
}

/// Owns the current-session slot and executes the state machine.
///
/// Collaborators arrive via the constructor; there is no global state.
/// Every public method is synchronous and cheap; network work is spawned
/// onto the supplied runtime handle.
pub struct SessionManager {
    weak: std::sync::Weak<SessionManager>,
    config: AppConfig,
    device: Mutex<DeviceMetadata>,
    bus: Arc<EventBus>,
    queue: Arc<RequestQueue>,
    http: SignedHttpClient,
    resolver: AttributionResolver,
    remote_config: Mutex<Option<RemoteConfig>>,
    config_requested: AtomicBool,
    current: Mutex<Option<Arc<Session>>>,
    pending_user: Mutex<Option<UserHandle>>,
    deferred: Mutex<DeferredQueues>,
    processed_launches: Mutex<HashSet<String>>,
    handle: tokio::runtime::Handle,
}

impl SessionManager {
    pub fn new(
        config: AppConfig,
        device: DeviceMetadata,
        store: Arc<RequestStore>,
        bus: Arc<EventBus>,
        referrer: Arc<dyn InstallReferrerSource>,
        handle: tokio::runtime::Handle,
    ) -> Arc<Self> {
        let http = SignedHttpClient::new();
        let queue = Arc::new(RequestQueue::new(
            store,
            http.clone(),
            config.api_secret.clone(),
            handle.clone(),
        ));
        let resolver = AttributionResolver::new(
            http.clone(),
            config.app_id.clone(),
            referrer,
            handle.clone(),
        );
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            config,
            device: Mutex::new(device),
            bus,
            queue,
            http,
            resolver,
            remote_config: Mutex::new(None),
            config_requested: AtomicBool::new(false),
            current: Mutex::new(None),
            pending_user: Mutex::new(None),
            deferred: Mutex::new(DeferredQueues::default()),
            processed_launches: Mutex::new(HashSet::new()),
            handle,
        })
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn remote_config(&self) -> Option<RemoteConfig> {
        locked(&self.remote_config, "remote config").clone()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// The app came to the foreground.
    ///
    /// A launch whose `launch_id` was seen before only restores an
    /// expiring session. A fresh launch is resolved for attribution and
    /// either attached to a young session (`Allocated`/`Created`) or
    /// replaces the current one.
    pub fn on_resume(&self, launch: Launch) {
        let mut slot = locked(&self.current, "current session slot");
        if let Some(session) = slot.clone() {
            self.expire_if_due(&session);
        }

        if let Some(id) = &launch.launch_id {
            let fresh = locked(&self.processed_launches, "processed launches").insert(id.clone());
            if !fresh {
                if let Some(session) = slot.clone() {
                    let (state, previous) = session.state_pair();
                    if state == SessionState::Expiring {
                        tracing::info!(session_id = %session.id, to = %previous, "session.restore");
                        self.advance(&session, previous);
                    }
                }
                return;
            }
        }

        let resolution = self.resolver.resolve(&launch);
        match slot.clone() {
            None => {
                let user = self.take_user_for(None);
                self.install_session(&mut slot, user, Some(resolution));
            }
            Some(session) if session.state().is_terminal() => {
                let user = self.take_user_for(Some(&session));
                self.install_session(&mut slot, user, Some(resolution));
            }
            Some(session) if session.state() == SessionState::Allocated => {
                session.attach_resolution(resolution);
                self.advance(&session, SessionState::Created);
            }
            Some(session) if session.state() == SessionState::Created => {
                session.attach_resolution(resolution);
            }
            Some(session) => {
                // New attribution context: the old session is done.
                self.advance(&session, SessionState::Expiring);
                self.advance(&session, SessionState::Expired);
                let user = self.take_user_for(Some(&session));
                self.install_session(&mut slot, user, Some(resolution));
            }
        }
    }

    /// The app went to the background: the session starts its grace
    /// period.
    pub fn on_pause(&self) {
        let session = locked(&self.current, "current session slot").clone();
        if let Some(session) = session {
            self.advance(&session, SessionState::Expiring);
        }
    }

    /// Current session after a lazy expiry check. The slot keeps holding
    /// an expired session until the next lifecycle event replaces it.
    pub fn current_session(&self) -> Option<Arc<Session>> {
        let session = locked(&self.current, "current session slot").clone();
        if let Some(session) = &session {
            self.expire_if_due(session);
        }
        session
    }

    pub fn status(&self) -> Option<SessionReport> {
        self.current_session().map(|s| s.report())
    }

    /// Stop background work; persisted queue rows stay for the next run.
    pub fn shutdown(&self) {
        self.on_pause();
        self.queue.stop();
    }

    // ── Identity ─────────────────────────────────────────────────────

    pub fn set_user_id(&self, user_id: impl Into<String>) {
        self.identify_user(user_id, None, None);
    }

    /// Attach an identity to the current session (or remember it for the
    /// first one). A different user id logs the old session out: it is
    /// expired and replaced, and its launch attribution is not carried
    /// over.
    pub fn identify_user(
        &self,
        user_id: impl Into<String>,
        email: Option<String>,
        facebook_id: Option<String>,
    ) {
        let user_id = user_id.into();
        if user_id.trim().is_empty() {
            tracing::error!("session.identify.empty_user_id");
            return;
        }
        let handle = UserHandle {
            user_id,
            email,
            facebook_id,
        };

        let mut slot = locked(&self.current, "current session slot");
        if let Some(session) = slot.clone() {
            self.expire_if_due(&session);
        }

        let Some(session) = slot.clone() else {
            tracing::info!(user_id = %handle.user_id, "session.identify.pending");
            *locked(&self.pending_user, "pending user") = Some(handle);
            return;
        };

        if session.state().is_terminal() {
            self.install_session(&mut slot, Some(handle), None);
            return;
        }

        match session.user() {
            Some(current) if current.user_id != handle.user_id => {
                tracing::info!(
                    session_id = %session.id,
                    old_user_id = %current.user_id,
                    new_user_id = %handle.user_id,
                    "session.logout"
                );
                self.advance(&session, SessionState::Expiring);
                self.advance(&session, SessionState::Expired);
                self.install_session(&mut slot, Some(handle), None);
            }
            _ => {
                let changed = session.set_user(handle);
                match session.state() {
                    SessionState::Configured => {
                        self.advance(&session, SessionState::IdentifyingUser);
                    }
                    SessionState::UserIdentified if changed => {
                        self.spawn_identify(&session);
                    }
                    _ => {}
                }
            }
        }
    }

    /// A new push registration re-runs the handshake for an identified
    /// session so the server learns the token.
    pub fn set_push_token(&self, token: impl Into<String>) {
        locked(&self.device, "device metadata").push_token = Some(token.into());
        if let Some(session) = self.current_session() {
            if session.state() == SessionState::UserIdentified {
                self.spawn_identify(&session);
            }
        }
    }

    // ── Remote configuration ─────────────────────────────────────────

    /// Apply server configuration: repoint the queue, start draining, and
    /// advance a session waiting in `Created`.
    pub fn set_remote_config(&self, remote: RemoteConfig) {
        *locked(&self.remote_config, "remote config") = Some(remote.clone());
        self.queue.set_hostname(&remote.hostname);
        self.queue.start();
        self.bus.post(Event::RemoteConfigReady {
            hostname: remote.hostname.clone(),
            heartbeat_interval_secs: remote.heartbeat_interval_secs,
            at: Utc::now(),
        });
        tracing::info!(hostname = %remote.hostname, "config.ready");

        let session = locked(&self.current, "current session slot").clone();
        if let Some(session) = session {
            if session.state() == SessionState::Created {
                self.advance(&session, SessionState::Configured);
            }
        }
    }

    /// Fetch `/games/{app_id}/settings.json` once and apply it. Failures
    /// are logged and re-arm the fetch for a later call.
    pub fn fetch_remote_config(&self) {
        if self.config_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut payload = Map::new();
        payload.insert("id".into(), json!(self.config.app_id));
        self.stamp_common(&mut payload, None);

        let weak = self.weak.clone();
        let http = self.http.clone();
        let secret = self.config.api_secret.clone();
        let endpoint = format!("/games/{}/settings.json", self.config.app_id);
        let hostname = self.queue.hostname();
        self.handle.spawn(async move {
            let outcome = http.post_signed(&hostname, &endpoint, &payload, &secret).await;
            let Some(manager) = weak.upgrade() else { return };
            match outcome {
                Ok(response) if (200..300).contains(&response.status) => {
                    match serde_json::from_str::<Value>(&response.body) {
                        Ok(body) => manager.set_remote_config(RemoteConfig::from_response(&body)),
                        Err(e) => {
                            tracing::warn!(error = %e, "config.fetch.malformed");
                            manager.config_requested.store(false, Ordering::SeqCst);
                        }
                    }
                }
                Ok(response) => {
                    tracing::warn!(status = response.status, "config.fetch.failed");
                    manager.config_requested.store(false, Ordering::SeqCst);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "config.fetch.failed");
                    manager.config_requested.store(false, Ordering::SeqCst);
                }
            }
        });
    }

    // ── Deferred work ────────────────────────────────────────────────

    /// Run `action` once the current session reaches `UserIdentified`;
    /// immediately if it already has.
    pub fn when_user_ready(
        &self,
        action: impl FnOnce(&SessionManager, &Arc<Session>) + Send + 'static,
    ) {
        if let Some(session) = self.current_session() {
            if session.state() == SessionState::UserIdentified {
                action(self, &session);
                return;
            }
        }
        locked(&self.deferred, "deferred actions")
            .ready
            .push(Box::new(action));
    }

    /// Like [`SessionManager::when_user_ready`], but an `Expiring` session
    /// that had already been identified also qualifies.
    pub fn when_user_is_or_was_ready(
        &self,
        action: impl FnOnce(&SessionManager, &Arc<Session>) + Send + 'static,
    ) {
        if let Some(session) = self.current_session() {
            let (state, previous) = session.state_pair();
            let ready = state == SessionState::UserIdentified
                || (state == SessionState::Expiring && previous == SessionState::UserIdentified);
            if ready {
                action(self, &session);
                return;
            }
        }
        locked(&self.deferred, "deferred actions")
            .ready_or_was
            .push(Box::new(action));
    }

    // ── Tracking ─────────────────────────────────────────────────────

    /// Queue a custom event; held until the session is identified.
    pub fn track_event(
        &self,
        action: &str,
        object_type: Option<&str>,
        object_instance_id: Option<&str>,
    ) {
        if action.trim().is_empty() {
            tracing::error!("track_event.empty_action");
            return;
        }
        let mut payload = Map::new();
        payload.insert("action".into(), json!(action));
        if let Some(t) = object_type.filter(|t| !t.is_empty()) {
            payload.insert("object_type".into(), json!(t));
        }
        if let Some(i) = object_instance_id.filter(|i| !i.is_empty()) {
            payload.insert("object_instance_id".into(), json!(i));
        }
        self.when_user_ready(move |manager, session| {
            manager.submit_stamped("/me/events", payload, session);
        });
    }

    /// Queue a purchase report; held until the session is identified.
    pub fn track_purchase(&self, product_id: &str, currency: &str, amount_micros: i64) {
        let mut payload = Map::new();
        payload.insert("product_id".into(), json!(product_id));
        payload.insert("price_currency_code".into(), json!(currency));
        payload.insert("price_amount_micros".into(), json!(amount_micros));
        payload.insert("purchase_time".into(), json!(Utc::now().timestamp()));
        self.when_user_ready(move |manager, session| {
            manager.submit_stamped("/me/purchase", payload, session);
        });
    }

    /// Stage a string attribute on the session's user profile.
    pub fn set_user_attribute_string(&self, key: &str, value: &str) {
        match self.current_session().and_then(|s| s.profile()) {
            Some(profile) => profile.set_string(key, value),
            None => tracing::debug!(key, "profile.no_profile"),
        }
    }

    /// Stage a numeric attribute on the session's user profile.
    pub fn set_user_attribute_number(&self, key: &str, value: f64) {
        match self.current_session().and_then(|s| s.profile()) {
            Some(profile) => profile.set_number(key, value),
            None => tracing::debug!(key, "profile.no_profile"),
        }
    }

    // ── State machine ────────────────────────────────────────────────

    /// Run a transition and its entry effects, following auto-advances
    /// (`Created`→`Configured` when configuration is present,
    /// `Configured`→`IdentifyingUser` when a user is known).
    pub(crate) fn advance(&self, session: &Arc<Session>, next: SessionState) {
        let mut target = Some(next);
        while let Some(next) = target.take() {
            let Some((_, committed)) = self.commit_transition(session, next) else {
                return;
            };
            self.bus.post(Event::SessionStateChanged {
                session_id: session.id.clone(),
                state: committed,
                previous_state: session.previous_state(),
                at: Utc::now(),
            });
            target = self.enter(session, committed);
        }
    }

    /// Validate and apply one transition under the session lock. Returns
    /// `None` for the same-state no-op; an illegal edge or missing
    /// required value commits `Invalid` instead of the requested state.
    fn commit_transition(
        &self,
        session: &Arc<Session>,
        next: SessionState,
    ) -> Option<(SessionState, SessionState)> {
        let mut inner = locked(&session.inner, "session");
        let from = inner.state;
        if from == next {
            tracing::debug!(session_id = %session.id, state = %from, "session.state.unchanged");
            return None;
        }

        let to = if !from.can_transition_to(next) {
            tracing::error!(
                session_id = %session.id,
                from = %from,
                to = %next,
                "session.state.illegal_transition"
            );
            SessionState::Invalid
        } else {
            match next {
                SessionState::IdentifyingUser if inner.user.is_none() => {
                    tracing::error!(
                        session_id = %session.id,
                        field = "user_id",
                        expected = "non-empty",
                        "session.state.missing_required_value"
                    );
                    SessionState::Invalid
                }
                SessionState::UserIdentified if inner.heartbeat.is_some() => {
                    tracing::error!(
                        session_id = %session.id,
                        field = "heartbeat",
                        expected = "not running",
                        "session.state.missing_required_value"
                    );
                    SessionState::Invalid
                }
                _ => next,
            }
        };

        // Coming back to life from Expiring discards the end timestamp;
        // entering Expiring sets it only when absent, so re-entry keeps
        // the original expiry clock.
        if from == SessionState::Expiring
            && !matches!(to, SessionState::Expired | SessionState::Invalid)
        {
            inner.ends_at = None;
        }
        if to == SessionState::Expiring && inner.ends_at.is_none() {
            inner.ends_at = Some(Utc::now());
        }

        inner.previous_state = from;
        inner.state = to;
        tracing::info!(session_id = %session.id, from = %from, to = %to, "session.state");
        Some((from, to))
    }

    /// Entry effects; may request a follow-up transition.
    fn enter(&self, session: &Arc<Session>, state: SessionState) -> Option<SessionState> {
        match state {
            SessionState::Created => {
                if locked(&self.remote_config, "remote config").is_some() {
                    return Some(SessionState::Configured);
                }
                tracing::debug!(session_id = %session.id, "session.awaiting_remote_config");
                None
            }
            SessionState::Configured => {
                if locked(&session.inner, "session").user.is_some() {
                    return Some(SessionState::IdentifyingUser);
                }
                None
            }
            SessionState::IdentifyingUser => {
                self.spawn_identify(session);
                None
            }
            SessionState::UserIdentified => {
                self.start_heartbeat(session);
                self.drain_deferred(session);
                self.dispatch_attribution(session);
                None
            }
            SessionState::Expiring => {
                let (heartbeat, profile) = {
                    let mut inner = locked(&session.inner, "session");
                    (inner.heartbeat.take(), inner.profile.clone())
                };
                if let Some(heartbeat) = heartbeat {
                    heartbeat.abort();
                    tracing::debug!(session_id = %session.id, "session.heartbeat.stopped");
                }
                if let Some(profile) = profile {
                    profile.flush_now();
                }
                None
            }
            SessionState::Expired => {
                tracing::info!(session_id = %session.id, "session.expired");
                None
            }
            SessionState::Invalid | SessionState::Allocated => None,
        }
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn expire_if_due(&self, session: &Arc<Session>) {
        if session.has_expired(self.config.session_grace_secs) {
            self.advance(session, SessionState::Expired);
        }
    }

    fn take_user_for(&self, old: Option<&Arc<Session>>) -> Option<UserHandle> {
        let pending = locked(&self.pending_user, "pending user").take();
        pending.or_else(|| old.and_then(|s| s.user()))
    }

    fn install_session(
        &self,
        slot: &mut Option<Arc<Session>>,
        user: Option<UserHandle>,
        resolution: Option<LaunchResolution>,
    ) -> Arc<Session> {
        let session = Session::allocate(user);
        *slot = Some(Arc::clone(&session));
        tracing::info!(session_id = %session.id, "session.allocated");
        if let Some(resolution) = resolution {
            session.attach_resolution(resolution);
            self.advance(&session, SessionState::Created);
        }
        session
    }

    fn spawn_identify(&self, session: &Arc<Session>) {
        let Some((user, resolution, re_identify)) = session.begin_identify() else {
            tracing::error!(session_id = %session.id, "session.identify.no_user");
            return;
        };
        let weak = self.weak.clone();
        let session = Arc::clone(session);
        let config = self.config.clone();
        let device = locked(&self.device, "device metadata").clone();
        self.handle.spawn(async move {
            let payload =
                identify::build_payload(&config, &device, &user, &resolution, re_identify).await;
            let Some(manager) = weak.upgrade() else { return };
            if session.state().is_terminal() {
                // Logged out or expired while the payload was assembled.
                tracing::info!(session_id = %session.id, "session.identify.abandoned");
                return;
            }
            manager.submit_identify(session, payload);
        });
    }

    fn submit_identify(&self, session: Arc<Session>, mut payload: Map<String, Value>) {
        self.stamp_common(&mut payload, session.user_id().as_deref());
        let endpoint = format!("/games/{}/users.json", self.config.app_id);
        let weak = self.weak.clone();
        let callback_session = Arc::clone(&session);
        let submitted = self.queue.submit_with_callback(
            QueuedRequest::new(endpoint, payload),
            Box::new(move |status, body| {
                if let Some(manager) = weak.upgrade() {
                    identify::apply_response(&manager, &callback_session, status, body);
                }
            }),
        );
        if submitted {
            tracing::info!(session_id = %session.id, "session.identify.submitted");
        }
    }

    pub(crate) fn finish_identify(&self, session: &Arc<Session>) {
        match session.state() {
            SessionState::IdentifyingUser => {
                self.advance(session, SessionState::UserIdentified);
            }
            SessionState::UserIdentified => {
                tracing::debug!(session_id = %session.id, "session.identify.already_identified");
            }
            SessionState::Expiring => {
                session.record_identified_while_expiring();
                tracing::info!(session_id = %session.id, "session.identify.recorded_during_expiry");
            }
            other => {
                tracing::warn!(session_id = %session.id, state = %other, "session.identify.ignored");
            }
        }
    }

    fn start_heartbeat(&self, session: &Arc<Session>) {
        // Heartbeat parameters come from the server; no config, no pings.
        let Some(remote) = self.remote_config() else {
            tracing::debug!(session_id = %session.id, "session.heartbeat.disabled");
            return;
        };
        if remote.heartbeat_interval_secs == 0 {
            tracing::debug!(session_id = %session.id, "session.heartbeat.disabled");
            return;
        }
        let Some(user_id) = session.user_id() else {
            return;
        };
        let base = heartbeat_url(
            &self.config,
            &remote.hostname,
            &user_id,
            session.country_code().as_deref(),
        );
        let http = self.http.clone();
        let interval = Duration::from_secs(remote.heartbeat_interval_secs);
        let task = self.handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let url = format!("{base}&buster={}", uuid::Uuid::new_v4().simple());
                http.ping(&url).await;
            }
        });
        locked(&session.inner, "session").heartbeat = Some(task);
        tracing::info!(
            session_id = %session.id,
            interval_secs = remote.heartbeat_interval_secs,
            "session.heartbeat.started"
        );
    }

    fn drain_deferred(&self, session: &Arc<Session>) {
        let actions: Vec<DeferredAction> = {
            let mut queues = locked(&self.deferred, "deferred actions");
            let mut all: Vec<DeferredAction> = queues.ready_or_was.drain(..).collect();
            all.extend(queues.ready.drain(..));
            all
        };
        if !actions.is_empty() {
            tracing::debug!(
                session_id = %session.id,
                count = actions.len(),
                "session.deferred.drained"
            );
        }
        for action in actions {
            action(self, session);
        }
    }

    /// Publish launch attribution, at most once per session.
    fn dispatch_attribution(&self, session: &Arc<Session>) {
        let resolution = {
            let mut inner = locked(&session.inner, "session");
            if inner.attribution_processed {
                return;
            }
            inner.attribution_processed = true;
            inner.resolution.clone()
        };
        let bus = Arc::clone(&self.bus);
        let session_id = session.id.clone();
        self.handle.spawn(async move {
            let launch = resolution.wait(ATTRIBUTION_DISPATCH_TIMEOUT).await;
            if launch.is_attributed() {
                bus.post(Event::LaunchAttributed {
                    session_id,
                    launch,
                    at: Utc::now(),
                });
            }
        });
    }

    fn submit_stamped(
        &self,
        endpoint: &str,
        mut payload: Map<String, Value>,
        session: &Arc<Session>,
    ) -> bool {
        self.stamp_common(&mut payload, session.user_id().as_deref());
        self.queue.submit(QueuedRequest::new(endpoint, payload))
    }

    /// Fields every submission carries, stamped at submit time so replayed
    /// rows keep what was true when they were created.
    fn stamp_common(&self, payload: &mut Map<String, Value>, api_key: Option<&str>) {
        let device = locked(&self.device, "device metadata");
        payload.insert("game_id".into(), json!(self.config.app_id));
        payload.insert("sdk_version".into(), json!(SDK_VERSION));
        payload.insert("sdk_platform".into(), json!(self.config.sdk_platform));
        payload.insert("app_version".into(), json!(self.config.app_version));
        if !self.config.bundle_id.is_empty() {
            payload.insert("bundle_id".into(), json!(self.config.bundle_id));
        }
        payload.insert("device_id".into(), json!(device.device_id));
        payload.insert("device_model".into(), json!(device.device_model));
        payload.insert("request_date".into(), json!(Utc::now().timestamp()));
        if let Some(api_key) = api_key {
            payload.insert("api_key".into(), json!(api_key));
        }
    }
}

fn heartbeat_url(
    config: &AppConfig,
    hostname: &str,
    user_id: &str,
    country_code: Option<&str>,
) -> String {
    let mut query = format!(
        "game_id={}&api_key={}&sdk_version={}&sdk_platform={}&app_version={}",
        urlencoding::encode(&config.app_id),
        urlencoding::encode(user_id),
        urlencoding::encode(SDK_VERSION),
        urlencoding::encode(&config.sdk_platform),
        urlencoding::encode(&config.app_version),
    );
    if let Some(country_code) = country_code {
        query.push_str("&country_code=");
        query.push_str(&urlencoding::encode(country_code));
    }
    format!("{}?{query}", endpoint_url(hostname, "/ping"))
}

/// Lock acquisition with the debug-build deadlock guard: in debug builds
/// a lock held for over [`LOCK_WAIT_MAX`] panics with context instead of
/// hanging; release builds take the lock plainly.
fn locked<'a, T>(mutex: &'a Mutex<T>, what: &'static str) -> MutexGuard<'a, T> {
    #[cfg(debug_assertions)]
    {
        let deadline = std::time::Instant::now() + LOCK_WAIT_MAX;
        loop {
            match mutex.try_lock() {
                Ok(guard) => return guard,
                Err(std::sync::TryLockError::WouldBlock) => {
                    if std::time::Instant::now() >= deadline {
                        panic!("{what} lock not acquired within {LOCK_WAIT_MAX:?}");
                    }
                    std::thread::sleep(Duration::from_millis(2));
                }
                Err(std::sync::TryLockError::Poisoned(e)) => {
                    panic!("{what} lock poisoned: {e}");
                }
            }
        }
    }
    #[cfg(not(debug_assertions))]
    {
        match mutex.lock() {
            Ok(guard) => guard,
            Err(e) => panic!("{what} lock poisoned: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribution::NoInstallReferrer;
    use crate::bus::{capture_listener, CaptureListener};

    fn manager_with(config: AppConfig) -> (Arc<SessionManager>, Arc<CaptureListener>) {
        let bus = Arc::new(EventBus::new());
        let capture = capture_listener();
        bus.add_listener(capture.clone());
        let store = Arc::new(RequestStore::open_memory().unwrap());
        let manager = SessionManager::new(
            config,
            DeviceMetadata::for_tests(),
            store,
            bus,
            Arc::new(NoInstallReferrer),
            tokio::runtime::Handle::current(),
        );
        (manager, capture)
    }

    fn manager() -> (Arc<SessionManager>, Arc<CaptureListener>) {
        manager_with(AppConfig::new("1138", "secret"))
    }

    #[tokio::test]
    async fn resume_allocates_a_created_session() {
        let (manager, capture) = manager();
        manager.on_resume(Launch::default());

        let report = manager.status().expect("session exists");
        assert_eq!(report.state, SessionState::Created);
        assert_eq!(report.previous_state, SessionState::Allocated);
        assert_eq!(capture.count_name("session.state"), 1);
    }

    #[tokio::test]
    async fn same_state_transition_is_a_silent_noop() {
        let (manager, capture) = manager();
        manager.on_resume(Launch::default());
        let session = manager.current_session().unwrap();
        capture.clear();

        manager.advance(&session, SessionState::Created);

        assert_eq!(session.state(), SessionState::Created);
        assert_eq!(capture.count_name("session.state"), 0);
    }

    #[tokio::test]
    async fn illegal_transition_forces_invalid() {
        let (manager, _) = manager();
        manager.on_resume(Launch::default());
        let session = manager.current_session().unwrap();

        manager.advance(&session, SessionState::UserIdentified);

        assert_eq!(session.state(), SessionState::Invalid);
        assert_eq!(session.previous_state(), SessionState::Created);
    }

    #[tokio::test]
    async fn missing_user_invalidates_identifying_transition() {
        let (manager, _) = manager();
        manager.on_resume(Launch::default());
        manager.set_remote_config(RemoteConfig {
            heartbeat_interval_secs: 0,
            ..RemoteConfig::default()
        });
        let session = manager.current_session().unwrap();
        assert_eq!(session.state(), SessionState::Configured);

        manager.advance(&session, SessionState::IdentifyingUser);

        assert_eq!(session.state(), SessionState::Invalid);
    }

    #[tokio::test]
    async fn remote_config_advances_created_to_configured() {
        let (manager, capture) = manager();
        manager.on_resume(Launch::default());
        manager.set_remote_config(RemoteConfig {
            heartbeat_interval_secs: 0,
            ..RemoteConfig::default()
        });

        assert_eq!(manager.status().unwrap().state, SessionState::Configured);
        assert_eq!(capture.count_name("config.ready"), 1);
        assert!(manager.queue().is_running());
    }

    #[tokio::test]
    async fn pending_user_applies_to_first_session() {
        let (manager, _) = manager();
        manager.set_user_id("player-7");
        assert!(manager.status().is_none());

        manager.on_resume(Launch::default());

        let session = manager.current_session().unwrap();
        assert_eq!(session.user_id().as_deref(), Some("player-7"));
        assert_eq!(session.state(), SessionState::Created);
    }

    #[tokio::test]
    async fn user_change_logs_old_session_out() {
        let (manager, _) = manager();
        manager.on_resume(Launch::default());
        manager.set_user_id("abc");
        let first = manager.current_session().unwrap();

        manager.set_user_id("xyz");

        assert_eq!(first.state(), SessionState::Expired);
        let second = manager.current_session().unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(second.user_id().as_deref(), Some("xyz"));
        // No identification was configured, so nothing may be queued.
        assert!(manager.queue().pending().unwrap().is_empty());
        // Attribution is not carried over to the replacement session.
        assert_eq!(second.attribution(), Some(LaunchData::Unattributed));
    }

    #[tokio::test]
    async fn pause_starts_the_grace_period_and_expiry_is_lazy() {
        let (manager, _) = manager_with(AppConfig {
            session_grace_secs: 0,
            ..AppConfig::new("1138", "secret")
        });
        manager.on_resume(Launch::default());
        manager.on_pause();

        let session = manager.current_session().unwrap();
        assert_eq!(session.state(), SessionState::Expired);
    }

    #[tokio::test]
    async fn reentering_expiring_keeps_the_expiry_clock() {
        let (manager, _) = manager();
        manager.on_resume(Launch::default());
        manager.on_pause();
        let first_deadline = manager.status().unwrap().ends_at;
        assert!(first_deadline.is_some());

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.on_pause();

        assert_eq!(manager.status().unwrap().ends_at, first_deadline);
    }

    #[tokio::test]
    async fn reprocessed_launch_restores_an_expiring_session() {
        let (manager, _) = manager();
        let launch = Launch {
            launch_id: Some("intent-1".into()),
            ..Launch::default()
        };
        manager.on_resume(launch.clone());
        let session = manager.current_session().unwrap();
        manager.on_pause();
        assert_eq!(session.state(), SessionState::Expiring);

        manager.on_resume(launch);

        assert_eq!(session.state(), SessionState::Created);
        assert!(manager.status().unwrap().ends_at.is_none());
        assert_eq!(manager.current_session().unwrap().id(), session.id());
    }

    #[tokio::test]
    async fn fresh_launch_replaces_a_live_session() {
        let (manager, _) = manager();
        manager.on_resume(Launch {
            launch_id: Some("intent-1".into()),
            ..Launch::default()
        });
        manager.set_remote_config(RemoteConfig {
            heartbeat_interval_secs: 0,
            ..RemoteConfig::default()
        });
        let first = manager.current_session().unwrap();
        assert_eq!(first.state(), SessionState::Configured);

        manager.on_resume(Launch {
            launch_id: Some("intent-2".into()),
            ..Launch::default()
        });

        assert_eq!(first.state(), SessionState::Expired);
        assert_ne!(manager.current_session().unwrap().id(), first.id());
    }

    #[tokio::test]
    async fn track_event_defers_without_identified_user() {
        let (manager, _) = manager();
        manager.on_resume(Launch::default());
        manager.track_event("level_up", Some("level"), Some("12"));

        assert!(manager.queue().pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_user_id_is_rejected() {
        let (manager, _) = manager();
        manager.on_resume(Launch::default());
        manager.set_user_id("  ");
        assert_eq!(manager.current_session().unwrap().user_id(), None);
    }

    #[test]
    fn heartbeat_url_shape() {
        let config = AppConfig::new("1138", "secret");
        let url = heartbeat_url(&config, "api.example.com", "player one", Some("US"));
        assert!(url.starts_with("https://api.example.com/ping?game_id=1138&api_key=player%20one"));
        assert!(url.contains("&country_code=US"));
        assert!(url.contains("&sdk_version="));
    }
}
