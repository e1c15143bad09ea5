//! Server-schema user profiles with debounced batching.
//!
//! The identify response carries the attribute schema: the set of string
//! and number keys the server will accept, with their current values.
//! Writes outside that schema are dropped. Changed values are batched and
//! flushed after a quiet window, or immediately when the session starts
//! expiring.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};

/// Delivers one flushed batch; wired to the request queue by the session
/// layer.
pub type SubmitFn = Box<dyn Fn(Map<String, Value>) + Send + Sync>;

struct ProfileState {
    strings: BTreeMap<String, Option<String>>,
    numbers: BTreeMap<String, Option<f64>>,
    dirty: bool,
    first_change_at: Option<Instant>,
    flush_task: Option<tokio::task::JoinHandle<()>>,
}

pub struct UserProfile {
    weak: Weak<UserProfile>,
    /// Opaque server token identifying this profile revision.
    context: String,
    batch: Duration,
    submit: SubmitFn,
    handle: tokio::runtime::Handle,
    state: Mutex<ProfileState>,
}

impl UserProfile {
    /// Build a profile from the `user_profile` object of an identify
    /// response. Returns `None` when the schema lacks a context token.
    pub fn from_response(
        body: &Value,
        batch_secs: f64,
        submit: SubmitFn,
        handle: tokio::runtime::Handle,
    ) -> Option<Arc<Self>> {
        let context = body.get("context")?.as_str()?.to_owned();
        let strings = body
            .get("string_attributes")
            .and_then(Value::as_object)
            .map(|attrs| {
                attrs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.as_str().map(str::to_owned)))
                    .collect()
            })
            .unwrap_or_default();
        let numbers = body
            .get("number_attributes")
            .and_then(Value::as_object)
            .map(|attrs| attrs.iter().map(|(k, v)| (k.clone(), v.as_f64())).collect())
            .unwrap_or_default();
        Some(Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            context,
            batch: Duration::from_secs_f64(batch_secs.max(0.0)),
            submit,
            handle,
            state: Mutex::new(ProfileState {
                strings,
                numbers,
                dirty: false,
                first_change_at: None,
                flush_task: None,
            }),
        }))
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn set_string(&self, key: &str, value: &str) {
        let mut state = self.state.lock().expect("profile state poisoned");
        let Some(slot) = state.strings.get_mut(key) else {
            tracing::warn!(key, "profile.unknown_attribute");
            return;
        };
        if slot.as_deref() == Some(value) {
            tracing::debug!(key, "profile.unchanged");
            return;
        }
        *slot = Some(value.to_owned());
        self.mark_dirty(&mut state);
    }

    pub fn set_number(&self, key: &str, value: f64) {
        let mut state = self.state.lock().expect("profile state poisoned");
        let Some(slot) = state.numbers.get_mut(key) else {
            tracing::warn!(key, "profile.unknown_attribute");
            return;
        };
        if *slot == Some(value) {
            tracing::debug!(key, "profile.unchanged");
            return;
        }
        *slot = Some(value);
        self.mark_dirty(&mut state);
    }

    /// Flush staged changes now, cancelling any scheduled batch. No-op
    /// when nothing changed since the last flush.
    pub fn flush_now(&self) {
        let payload = {
            let mut state = self.state.lock().expect("profile state poisoned");
            if !state.dirty {
                return;
            }
            state.dirty = false;
            if let Some(task) = state.flush_task.take() {
                task.abort();
            }
            let ms_since_first_event = state
                .first_change_at
                .take()
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or(0);

            let mut payload = Map::new();
            payload.insert("context".into(), json!(self.context));
            payload.insert(
                "string_attributes".into(),
                Value::Object(
                    state
                        .strings
                        .iter()
                        .map(|(k, v)| (k.clone(), v.as_deref().map_or(Value::Null, Value::from)))
                        .collect(),
                ),
            );
            payload.insert(
                "number_attributes".into(),
                Value::Object(
                    state
                        .numbers
                        .iter()
                        .map(|(k, v)| (k.clone(), v.map_or(Value::Null, Value::from)))
                        .collect(),
                ),
            );
            payload.insert("ms_since_first_event".into(), json!(ms_since_first_event));
            payload
        };
        tracing::debug!(context = %self.context, "profile.flush");
        (self.submit)(payload);
    }

    fn mark_dirty(&self, state: &mut ProfileState) {
        if state.first_change_at.is_none() {
            state.first_change_at = Some(Instant::now());
        }
        state.dirty = true;
        self.schedule_flush(state);
    }

    /// Debounce: every change pushes the flush out by a full batch
    /// window.
    fn schedule_flush(&self, state: &mut ProfileState) {
        if let Some(task) = state.flush_task.take() {
            task.abort();
        }
        let Some(profile) = self.weak.upgrade() else {
            return;
        };
        let delay = self.batch;
        state.flush_task = Some(self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            profile.flush_now();
        }));
    }
}
