//! Launch attribution: what caused this app launch.
//!
//! A launch is classified into one of four shapes (push notification,
//! reward link, plain deep link, or unattributed), possibly after an HTTP
//! round trip that resolves a short link. Resolution is asynchronous and
//! handed out as a [`LaunchResolution`] whose bounded [`wait`] always
//! completes; callers that cannot wait fall back to
//! [`LaunchData::Unattributed`].
//!
//! [`wait`]: LaunchResolution::wait

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use url::Url;

use crate::http::SignedHttpClient;

/// Bound on waiting for the install-referrer collaborator.
const REFERRER_TIMEOUT: Duration = Duration::from_secs(5);

/// What the host knows about a launch before resolution.
#[derive(Debug, Clone, Default)]
pub struct Launch {
    /// Host-assigned identity; a re-delivered launch (same id) only
    /// restores an expiring session instead of creating a new one.
    pub launch_id: Option<String>,
    /// Push-notification extras, when the launch came from a push.
    pub notification: Option<NotificationLaunch>,
    /// Launch URL, when the launch came from a link.
    pub deep_link: Option<String>,
    pub is_first_launch: bool,
}

impl Launch {
    pub fn from_notification(notification: NotificationLaunch) -> Self {
        Self {
            notification: Some(notification),
            ..Self::default()
        }
    }

    pub fn from_deep_link(link: impl Into<String>) -> Self {
        Self {
            deep_link: Some(link.into()),
            ..Self::default()
        }
    }

    pub fn first_launch() -> Self {
        Self {
            is_first_launch: true,
            ..Self::default()
        }
    }
}

/// A launch caused by a push notification or a notification-style email
/// link.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationLaunch {
    pub notification_id: String,
    #[serde(default)]
    pub reward_id: Option<String>,
    #[serde(default)]
    pub channel_name: Option<String>,
    #[serde(default)]
    pub schedule_name: Option<String>,
    #[serde(default)]
    pub creative_name: Option<String>,
    #[serde(default)]
    pub deep_link: Option<String>,
    /// Remaining `teak_*` query parameters, passed through verbatim.
    #[serde(default)]
    pub extra: BTreeMap<String, Vec<String>>,
}

impl NotificationLaunch {
    pub fn new(notification_id: impl Into<String>) -> Self {
        Self {
            notification_id: notification_id.into(),
            ..Self::default()
        }
    }
}

/// A launch caused by a reward link.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardLinkLaunch {
    pub reward_link_id: String,
    #[serde(default)]
    pub reward_id: Option<String>,
    /// The final (possibly rewritten) link.
    pub link: String,
    /// The https short link the rewrite came from, when there was one.
    #[serde(default)]
    pub short_link: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, Vec<String>>,
}

/// The resolved cause of a launch. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LaunchData {
    Notification(NotificationLaunch),
    RewardLink(RewardLinkLaunch),
    DeepLink { link: String },
    Unattributed,
}

impl LaunchData {
    pub fn is_attributed(&self) -> bool {
        !matches!(self, LaunchData::Unattributed)
    }

    /// Fields merged into the identify payload: `deep_link` plus the
    /// `teak_*` attribution parameters.
    pub fn session_attribution(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            LaunchData::Notification(n) => {
                map.insert("teak_notif_id".into(), json!(n.notification_id));
                if let Some(v) = &n.reward_id {
                    map.insert("teak_reward_id".into(), json!(v));
                }
                if let Some(v) = &n.channel_name {
                    map.insert("teak_channel_name".into(), json!(v));
                }
                if let Some(v) = &n.schedule_name {
                    map.insert("teak_schedule_name".into(), json!(v));
                }
                if let Some(v) = &n.creative_name {
                    map.insert("teak_creative_name".into(), json!(v));
                }
                if let Some(v) = &n.deep_link {
                    map.insert("deep_link".into(), json!(v));
                }
                extend_with_extras(&mut map, &n.extra);
            }
            LaunchData::RewardLink(r) => {
                map.insert("teak_rewardlink_id".into(), json!(r.reward_link_id));
                if let Some(v) = &r.reward_id {
                    map.insert("teak_reward_id".into(), json!(v));
                }
                map.insert("deep_link".into(), json!(r.link));
                extend_with_extras(&mut map, &r.extra);
            }
            LaunchData::DeepLink { link } => {
                map.insert("deep_link".into(), json!(link));
            }
            LaunchData::Unattributed => {}
        }
        map
    }
}

fn extend_with_extras(map: &mut Map<String, Value>, extra: &BTreeMap<String, Vec<String>>) {
    for (key, values) in extra {
        let value = if values.len() > 1 {
            json!(values)
        } else {
            json!(values[0])
        };
        map.insert(key.clone(), value);
    }
}

/// Handle to an in-flight (or already completed) resolution.
///
/// Backed by a watch channel: completion is observed by every clone, and
/// [`LaunchResolution::wait`] degrades to `Unattributed` instead of
/// hanging when the bound elapses or the resolver died.
#[derive(Clone)]
pub struct LaunchResolution {
    rx: tokio::sync::watch::Receiver<Option<LaunchData>>,
}

pub struct LaunchSender {
    tx: tokio::sync::watch::Sender<Option<LaunchData>>,
}

impl LaunchSender {
    pub fn complete(self, data: LaunchData) {
        let _ = self.tx.send(Some(data));
    }
}

impl LaunchResolution {
    /// An already-completed resolution.
    pub fn ready(data: LaunchData) -> Self {
        let (_, rx) = tokio::sync::watch::channel(Some(data));
        Self { rx }
    }

    /// A pending resolution and the sender that completes it.
    pub fn pending() -> (LaunchSender, Self) {
        let (tx, rx) = tokio::sync::watch::channel(None);
        (LaunchSender { tx }, Self { rx })
    }

    /// Non-blocking peek.
    pub fn try_get(&self) -> Option<LaunchData> {
        self.rx.borrow().clone()
    }

    /// Wait for completion, bounded by `timeout`. Always returns: on
    /// timeout, or when the resolver was dropped, the launch counts as
    /// unattributed.
    pub async fn wait(&self, timeout: Duration) -> LaunchData {
        let mut rx = self.rx.clone();
        let current = rx.borrow_and_update().clone();
        if let Some(data) = current {
            return data;
        }
        match tokio::time::timeout(timeout, rx.changed()).await {
            Ok(Ok(())) => rx.borrow().clone().unwrap_or(LaunchData::Unattributed),
            _ => {
                tracing::warn!("session.attribution.timeout");
                LaunchData::Unattributed
            }
        }
    }
}

/// Source of the install referrer recorded when the app was installed.
/// Consulted once, on first launch only.
pub trait InstallReferrerSource: Send + Sync {
    fn install_referrer(&self) -> Option<String>;
}

/// Default source for hosts that have no referrer plumbing.
pub struct NoInstallReferrer;

impl InstallReferrerSource for NoInstallReferrer {
    fn install_referrer(&self) -> Option<String> {
        None
    }
}

/// Classifies launches, resolving short links over HTTP when needed.
pub struct AttributionResolver {
    http: SignedHttpClient,
    app_id: String,
    referrer: Arc<dyn InstallReferrerSource>,
    handle: tokio::runtime::Handle,
}

impl AttributionResolver {
    pub fn new(
        http: SignedHttpClient,
        app_id: impl Into<String>,
        referrer: Arc<dyn InstallReferrerSource>,
        handle: tokio::runtime::Handle,
    ) -> Self {
        Self {
            http,
            app_id: app_id.into(),
            referrer,
            handle,
        }
    }

    /// Classify a launch. The caller is never blocked: the fast paths
    /// return an already-completed resolution, the slow paths spawn.
    pub fn resolve(&self, launch: &Launch) -> LaunchResolution {
        if !launch.is_first_launch {
            if let Some(notification) = &launch.notification {
                tracing::info!(
                    teak_notif_id = %notification.notification_id,
                    "session.attribution"
                );
                return LaunchResolution::ready(LaunchData::Notification(notification.clone()));
            }
            if let Some(link) = &launch.deep_link {
                let (sender, resolution) = LaunchResolution::pending();
                let http = self.http.clone();
                let app_id = self.app_id.clone();
                let link = link.clone();
                self.handle.spawn(async move {
                    sender.complete(resolve_link_launch(&http, &app_id, &link).await);
                });
                return resolution;
            }
            return LaunchResolution::ready(LaunchData::Unattributed);
        }

        // First launch: the install referrer replaces the intent data.
        let (sender, resolution) = LaunchResolution::pending();
        let http = self.http.clone();
        let app_id = self.app_id.clone();
        let referrer = Arc::clone(&self.referrer);
        self.handle.spawn(async move {
            let referrer_value = tokio::time::timeout(
                REFERRER_TIMEOUT,
                tokio::task::spawn_blocking(move || referrer.install_referrer()),
            )
            .await;
            let data = match referrer_value {
                Ok(Ok(Some(link))) => {
                    tracing::info!(%link, "session.attribution.referrer");
                    resolve_link_launch(&http, &app_id, &link).await
                }
                _ => LaunchData::Unattributed,
            };
            sender.complete(data);
        });
        resolution
    }
}

/// Resolve a launch link: https-upgrade, one GET for the canonical
/// redirect path, then classification. Every failure keeps the original
/// link; only an unparseable input is unattributed.
async fn resolve_link_launch(http: &SignedHttpClient, app_id: &str, link: &str) -> LaunchData {
    let Ok(mut url) = Url::parse(link) else {
        tracing::debug!(%link, "deep_link.unparseable");
        return LaunchData::Unattributed;
    };

    let mut short_link = None;
    if url.scheme() == "http" || url.scheme() == "https" {
        let https_url = upgrade_to_https(&url);
        match http.resolve_link(https_url.as_str()).await {
            Ok(teak_data) => {
                if let Some(path) = teak_data.get("AndroidPath").and_then(|v| v.as_str()) {
                    short_link = Some(https_url.to_string());
                    let rewritten = if has_scheme_prefix(path) {
                        path.to_string()
                    } else {
                        format!("teak{app_id}://{path}")
                    };
                    match Url::parse(&rewritten) {
                        Ok(u) => {
                            tracing::info!(uri = %u, "deep_link.request.resolve");
                            url = u;
                        }
                        Err(e) => {
                            tracing::warn!(%rewritten, error = %e, "deep_link.rewrite_unparseable")
                        }
                    }
                }
            }
            Err(e) => tracing::info!(error = %e, "deep_link.resolve_failed"),
        }
    }

    classify_link(&url, short_link)
}

/// `http` links are fetched as `https`; loopback endpoints are left alone.
fn upgrade_to_https(url: &Url) -> Url {
    let loopback = matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"));
    if url.scheme() == "http" && !loopback {
        let mut upgraded = url.clone();
        // set_scheme only fails across special/non-special schemes
        if upgraded.set_scheme("https").is_ok() {
            return upgraded;
        }
    }
    url.clone()
}

/// Does the string open with a URI scheme (`foo:` / `foo+bar:`)?
fn has_scheme_prefix(s: &str) -> bool {
    match s.find(':') {
        Some(idx) => s[..idx]
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '-' | '_')),
        None => false,
    }
}

/// Classify a link that arrives outside the resolution pipeline, such as
/// one pushed down in a server response.
pub(crate) fn classify_plain_link(link: &str) -> Option<LaunchData> {
    let url = Url::parse(link).ok()?;
    Some(classify_link(&url, None))
}

fn classify_link(url: &Url, short_link: Option<String>) -> LaunchData {
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in url.query_pairs() {
        if key.starts_with("teak_") {
            params.entry(key.into_owned()).or_default().push(value.into_owned());
        }
    }

    let first = |params: &mut BTreeMap<String, Vec<String>>, key: &str| -> Option<String> {
        params.remove(key).and_then(|mut v| {
            if v.is_empty() {
                None
            } else {
                Some(v.remove(0))
            }
        })
    };

    if let Some(notification_id) = first(&mut params, "teak_notif_id") {
        return LaunchData::Notification(NotificationLaunch {
            notification_id,
            reward_id: first(&mut params, "teak_reward_id"),
            channel_name: first(&mut params, "teak_channel_name"),
            schedule_name: first(&mut params, "teak_schedule_name"),
            creative_name: first(&mut params, "teak_creative_name"),
            deep_link: Some(url.to_string()),
            extra: params,
        });
    }

    if let Some(reward_link_id) = first(&mut params, "teak_rewardlink_id") {
        return LaunchData::RewardLink(RewardLinkLaunch {
            reward_link_id,
            reward_id: first(&mut params, "teak_reward_id"),
            link: url.to_string(),
            short_link,
            extra: params,
        });
    }

    LaunchData::DeepLink {
        link: url.to_string(),
    }
}
