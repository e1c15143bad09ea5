//! The identify-user handshake.
//!
//! Payload assembly runs off-thread (it waits, bounded, for launch
//! attribution); response handling runs on the queue worker via the
//! submission callback and applies the server's side effects before the
//! session advances to `UserIdentified`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};

use super::{locked, Session, SessionManager, UserHandle};
use crate::attribution::{classify_plain_link, LaunchResolution};
use crate::config::{AppConfig, DeviceMetadata};
use crate::events::Event;
use crate::profile::{SubmitFn, UserProfile};
use crate::queue::QueuedRequest;

/// Bound on waiting for launch attribution; past it the handshake goes
/// out unattributed rather than holding up identification.
const ATTRIBUTION_WAIT: Duration = Duration::from_secs(5);

pub(super) async fn build_payload(
    config: &AppConfig,
    device: &DeviceMetadata,
    user: &UserHandle,
    resolution: &LaunchResolution,
    re_identify: bool,
) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("happened_at".into(), json!(Utc::now().timestamp()));
    payload.insert("locale".into(), json!(device.locale));
    payload.insert("timezone".into(), json!(device.timezone_offset()));
    payload.insert(
        "notifications_enabled".into(),
        json!(device.notifications_enabled),
    );
    if let Some(email) = &user.email {
        payload.insert("email".into(), json!(email));
    }
    if let Some(facebook_id) = &user.facebook_id {
        payload.insert("facebook_id".into(), json!(facebook_id));
    }
    if config.collect_advertising_id {
        if let Some(advertising_id) = &device.advertising_id {
            payload.insert("android_ad_id".into(), json!(advertising_id));
            payload.insert(
                "android_limit_ad_tracking".into(),
                json!(device.limit_ad_tracking),
            );
        }
    }
    payload.insert(
        "push_key".into(),
        json!(device.push_token.clone().unwrap_or_default()),
    );
    // Repeat identifications must not count as a fresh tracked event.
    if re_identify {
        payload.insert("do_not_track_event".into(), json!(true));
    }

    let launch = resolution.wait(ATTRIBUTION_WAIT).await;
    for (key, value) in launch.session_attribution() {
        payload.insert(key, value);
    }
    payload
}

/// Apply an identify response. Anything other than a parseable 2xx body
/// is logged and leaves the session where it was; the original launch
/// attribution still stands.
pub(super) fn apply_response(
    manager: &SessionManager,
    session: &Arc<Session>,
    status: u16,
    body: &str,
) {
    if !(200..300).contains(&status) {
        tracing::warn!(session_id = %session.id, status, "session.identify.rejected");
        return;
    }
    let parsed: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(
                session_id = %session.id,
                error = %e,
                "session.identify.malformed_response"
            );
            return;
        }
    };

    // Side effects land before the state advances so that, for example,
    // the heartbeat is built with the country code already present.
    if let Some(country_code) = parsed.get("country_code").and_then(Value::as_str) {
        session.set_country_code(country_code.to_owned());
    }

    let verbose = parsed.get("verbose_logging").and_then(Value::as_bool);
    let remote = parsed.get("log_remote").and_then(Value::as_bool);
    if verbose.is_some() || remote.is_some() {
        manager.bus.post(Event::LoggingPolicyChanged {
            verbose: verbose.unwrap_or(false),
            remote: remote.unwrap_or(false),
            at: Utc::now(),
        });
    }

    if parsed.get("reset_push_key").and_then(Value::as_bool) == Some(true) {
        locked(&manager.device, "device metadata").push_token = None;
        manager.bus.post(Event::PushTokenInvalidated { at: Utc::now() });
        tracing::info!(session_id = %session.id, "session.push_key.reset");
    }

    if let Some(link) = parsed.get("deep_link").and_then(Value::as_str) {
        match classify_plain_link(link) {
            Some(data) => {
                if session.replace_attribution(data) {
                    tracing::info!(
                        session_id = %session.id,
                        deep_link = link,
                        "session.attribution.server_override"
                    );
                } else {
                    tracing::debug!(
                        session_id = %session.id,
                        "session.attribution.already_processed"
                    );
                }
            }
            None => {
                tracing::warn!(
                    session_id = %session.id,
                    deep_link = link,
                    "session.attribution.unparseable_override"
                );
            }
        }
    }

    if let Some(profile_body) = parsed.get("user_profile") {
        attach_profile(manager, session, profile_body);
    }

    if let Some(data) = parsed.get("additional_data") {
        if !data.is_null() {
            manager.bus.post(Event::AdditionalDataReceived {
                data: data.clone(),
                at: Utc::now(),
            });
        }
    }

    manager.finish_identify(session);
}

fn attach_profile(manager: &SessionManager, session: &Arc<Session>, body: &Value) {
    let batch_secs = manager.remote_config().unwrap_or_default().profile_batch_secs;
    let weak = manager.weak.clone();
    // The flush is stamped against the owning session, not whatever is
    // current by then; flushes may run during session replacement.
    let owner = Arc::downgrade(session);
    let submit: SubmitFn = Box::new(move |mut payload| {
        let Some(manager) = weak.upgrade() else { return };
        let Some(session) = owner.upgrade() else { return };
        manager.stamp_common(&mut payload, session.user_id().as_deref());
        manager
            .queue
            .submit(QueuedRequest::transient("/me/profile", payload));
    });
    match UserProfile::from_response(body, batch_secs, submit, manager.handle.clone()) {
        Some(profile) => session.attach_profile(profile),
        None => tracing::debug!(session_id = %session.id, "profile.schema_missing"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribution::{Launch, LaunchData, NoInstallReferrer, NotificationLaunch};
    use crate::bus::{capture_listener, CaptureListener, EventBus};
    use crate::config::AppConfig;
    use crate::queue::RequestStore;
    use crate::session::SessionState;

    fn test_user() -> UserHandle {
        UserHandle {
            user_id: "player-1".into(),
            email: Some("p1@example.com".into()),
            facebook_id: None,
        }
    }

    /// A manager whose session sits in `IdentifyingUser` with no remote
    /// config, so nothing touches the network.
    fn identifying_session() -> (Arc<SessionManager>, Arc<Session>, Arc<CaptureListener>) {
        let bus = Arc::new(EventBus::new());
        let capture = capture_listener();
        bus.add_listener(capture.clone());
        let store = Arc::new(RequestStore::open_memory().unwrap());
        let manager = SessionManager::new(
            AppConfig::new("1138", "secret"),
            DeviceMetadata::for_tests(),
            store,
            bus,
            Arc::new(NoInstallReferrer),
            tokio::runtime::Handle::current(),
        );
        manager.on_resume(Launch::default());
        let session = manager.current_session().unwrap();
        manager.advance(&session, SessionState::Configured);
        manager.identify_user("player-1", Some("p1@example.com".into()), None);
        assert_eq!(session.state(), SessionState::IdentifyingUser);
        (manager, session, capture)
    }

    #[tokio::test]
    async fn payload_carries_identity_and_device() {
        let config = AppConfig::new("1138", "secret");
        let device = DeviceMetadata::for_tests();
        let resolution = LaunchResolution::ready(LaunchData::Unattributed);

        let payload = build_payload(&config, &device, &test_user(), &resolution, false).await;

        assert!(payload.contains_key("happened_at"));
        assert_eq!(payload["locale"], json!("en_US"));
        assert_eq!(payload["timezone"], json!("-5.00"));
        assert_eq!(payload["notifications_enabled"], json!(true));
        assert_eq!(payload["email"], json!("p1@example.com"));
        assert_eq!(payload["push_key"], json!(""));
        assert!(!payload.contains_key("facebook_id"));
        assert!(!payload.contains_key("android_ad_id"));
        assert!(!payload.contains_key("do_not_track_event"));
    }

    #[tokio::test]
    async fn advertising_id_respects_the_collection_flag() {
        let mut device = DeviceMetadata::for_tests();
        device.advertising_id = Some("ad-123".into());
        device.limit_ad_tracking = true;
        let resolution = LaunchResolution::ready(LaunchData::Unattributed);

        let config = AppConfig::new("1138", "secret");
        let payload = build_payload(&config, &device, &test_user(), &resolution, false).await;
        assert_eq!(payload["android_ad_id"], json!("ad-123"));
        assert_eq!(payload["android_limit_ad_tracking"], json!(true));

        let opted_out = AppConfig {
            collect_advertising_id: false,
            ..AppConfig::new("1138", "secret")
        };
        let payload = build_payload(&opted_out, &device, &test_user(), &resolution, false).await;
        assert!(!payload.contains_key("android_ad_id"));
        assert!(!payload.contains_key("android_limit_ad_tracking"));
    }

    #[tokio::test]
    async fn repeat_identify_suppresses_event_tracking() {
        let config = AppConfig::new("1138", "secret");
        let device = DeviceMetadata::for_tests();
        let resolution = LaunchResolution::ready(LaunchData::Unattributed);

        let payload = build_payload(&config, &device, &test_user(), &resolution, true).await;

        assert_eq!(payload["do_not_track_event"], json!(true));
    }

    #[tokio::test]
    async fn payload_merges_launch_attribution() {
        let config = AppConfig::new("1138", "secret");
        let device = DeviceMetadata::for_tests();
        let resolution = LaunchResolution::ready(LaunchData::Notification(
            NotificationLaunch::new("notif-77"),
        ));

        let payload = build_payload(&config, &device, &test_user(), &resolution, false).await;

        assert_eq!(payload["teak_notif_id"], json!("notif-77"));
    }

    #[tokio::test]
    async fn rejected_status_does_not_advance() {
        let (manager, session, _) = identifying_session();

        apply_response(&manager, &session, 404, "");

        assert_eq!(session.state(), SessionState::IdentifyingUser);
    }

    #[tokio::test]
    async fn malformed_body_does_not_advance() {
        let (manager, session, _) = identifying_session();

        apply_response(&manager, &session, 200, "not json");

        assert_eq!(session.state(), SessionState::IdentifyingUser);
    }

    #[tokio::test]
    async fn response_side_effects_apply_before_advancing() {
        let (manager, session, capture) = identifying_session();
        manager.set_push_token("push-token-1");

        let body = json!({
            "country_code": "US",
            "verbose_logging": true,
            "reset_push_key": true,
            "additional_data": {"inbox": 3},
            "user_profile": {
                "context": "ctx-1",
                "string_attributes": {"guild": null},
                "number_attributes": {"score": 12.0}
            }
        });
        apply_response(&manager, &session, 200, &body.to_string());

        assert_eq!(session.state(), SessionState::UserIdentified);
        assert_eq!(session.country_code().as_deref(), Some("US"));
        assert!(session.profile().is_some());
        assert!(locked(&manager.device, "device metadata").push_token.is_none());
        assert_eq!(capture.count_name("log.policy"), 1);
        assert_eq!(capture.count_name("push.invalidated"), 1);
        assert_eq!(capture.count_name("user.additional_data"), 1);
    }

    #[tokio::test]
    async fn server_deep_link_replaces_unprocessed_attribution() {
        let (manager, session, _) = identifying_session();

        let body = json!({"deep_link": "https://ex.co/play?teak_notif_id=n-9"});
        apply_response(&manager, &session, 200, &body.to_string());

        assert_eq!(session.state(), SessionState::UserIdentified);
        match session.attribution() {
            Some(LaunchData::Notification(n)) => assert_eq!(n.notification_id, "n-9"),
            other => panic!("expected notification attribution, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn identify_landing_during_expiry_is_recorded() {
        let (manager, session, _) = identifying_session();
        manager.on_pause();
        assert_eq!(session.state(), SessionState::Expiring);

        apply_response(&manager, &session, 200, "{}");

        assert_eq!(session.state(), SessionState::Expiring);
        assert_eq!(session.previous_state(), SessionState::UserIdentified);
    }
}
