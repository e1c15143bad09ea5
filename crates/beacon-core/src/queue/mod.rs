//! Durable, ordered, retryable request queue.
//!
//! Submits are persisted before they are dispatched, so process death never
//! loses a request. A single worker drains the store in ascending
//! retry-count order; terminal outcomes (success-class status or HTTP 404)
//! remove the row, everything else bumps its retry count and leaves it for
//! the next drain.

pub mod store;

pub use store::RequestStore;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::Notify;

use crate::config::DEFAULT_HOSTNAME;
use crate::http::SignedHttpClient;

/// Invoked once with `(status, body)` when a request reaches a terminal
/// outcome. Not persisted: a request replayed from the store after a
/// restart executes without one.
pub type ResponseCallback = Box<dyn FnOnce(u16, &str) + Send + 'static>;

/// One queued POST.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub endpoint: String,
    pub payload: Map<String, Value>,
    /// uuid v4, simple format.
    pub request_id: String,
    pub date: DateTime<Utc>,
    pub retry_count: u32,
    /// Transient requests skip the store and are sent directly; a failed
    /// transient send is dropped, not retried.
    pub transient: bool,
}

impl QueuedRequest {
    pub fn new(endpoint: impl Into<String>, mut payload: Map<String, Value>) -> Self {
        // The id rides inside the payload as well, so a replayed row is
        // deduplicatable server-side.
        let request_id = uuid::Uuid::new_v4().simple().to_string();
        payload.insert("request_id".into(), Value::String(request_id.clone()));
        Self {
            endpoint: endpoint.into(),
            payload,
            request_id,
            date: Utc::now(),
            retry_count: 0,
            transient: false,
        }
    }

    pub fn transient(endpoint: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            transient: true,
            ..Self::new(endpoint, payload)
        }
    }
}

/// What a completed exchange means for the queued row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// The server authenticated and judged the request; remove the row.
    Delivered,
    /// HTTP 404: the endpoint is gone for good; remove the row.
    Gone,
    /// Worth another attempt on a later drain.
    Retry,
}

impl ResponseClass {
    pub fn from_status(status: u16) -> Self {
        match status {
            404 => ResponseClass::Gone,
            429 => ResponseClass::Retry,
            s if s >= 500 => ResponseClass::Retry,
            _ => ResponseClass::Delivered,
        }
    }
}

struct Worker {
    notify: Arc<Notify>,
    stop: Arc<AtomicBool>,
}

/// The queue itself. Cheap to share behind an `Arc`.
pub struct RequestQueue {
    store: Arc<RequestStore>,
    http: SignedHttpClient,
    secret: String,
    hostname: Arc<Mutex<String>>,
    handle: tokio::runtime::Handle,
    callbacks: Arc<Mutex<HashMap<String, ResponseCallback>>>,
    worker: Mutex<Option<Worker>>,
}

impl RequestQueue {
    pub fn new(
        store: Arc<RequestStore>,
        http: SignedHttpClient,
        secret: impl Into<String>,
        handle: tokio::runtime::Handle,
    ) -> Self {
        Self {
            store,
            http,
            secret: secret.into(),
            hostname: Arc::new(Mutex::new(DEFAULT_HOSTNAME.to_string())),
            handle,
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            worker: Mutex::new(None),
        }
    }

    /// Point all future dispatches at `hostname` (set when remote
    /// configuration arrives). May carry an explicit scheme.
    pub fn set_hostname(&self, hostname: &str) {
        *self.hostname.lock().expect("queue hostname poisoned") = hostname.to_string();
    }

    pub fn hostname(&self) -> String {
        self.hostname.lock().expect("queue hostname poisoned").clone()
    }

    /// Submit a request. Durable requests are persisted first; the return
    /// value is persistence success. When the drain worker is running the
    /// request is also queued for immediate execution.
    pub fn submit(&self, request: QueuedRequest) -> bool {
        self.submit_inner(request, None)
    }

    /// [`RequestQueue::submit`] with a terminal-outcome callback attached.
    pub fn submit_with_callback(&self, request: QueuedRequest, callback: ResponseCallback) -> bool {
        self.submit_inner(request, Some(callback))
    }

    fn submit_inner(&self, request: QueuedRequest, callback: Option<ResponseCallback>) -> bool {
        if request.transient {
            self.spawn_transient(request, callback);
            return true;
        }

        if let Some(cb) = callback {
            self.callbacks
                .lock()
                .expect("queue callbacks poisoned")
                .insert(request.request_id.clone(), cb);
        }
        if let Err(e) = self.store.insert(&request) {
            tracing::error!(endpoint = %request.endpoint, error = %e, "request.cache.store_failed");
            self.callbacks
                .lock()
                .expect("queue callbacks poisoned")
                .remove(&request.request_id);
            return false;
        }
        tracing::debug!(
            endpoint = %request.endpoint,
            request_id = %request.request_id,
            "request.cache.stored"
        );

        if let Some(worker) = &*self.worker.lock().expect("queue worker poisoned") {
            worker.notify.notify_one();
        }
        true
    }

    /// Start the drain worker: loads every persisted request, chronic
    /// failures last, and dispatches them one at a time. Idempotent; a
    /// second call just triggers another drain.
    pub fn start(&self) {
        let mut slot = self.worker.lock().expect("queue worker poisoned");
        if let Some(worker) = &*slot {
            worker.notify.notify_one();
            return;
        }

        let notify = Arc::new(Notify::new());
        let stop = Arc::new(AtomicBool::new(false));
        self.handle.spawn(run_worker(
            Arc::clone(&self.store),
            self.http.clone(),
            self.secret.clone(),
            Arc::clone(&self.hostname),
            Arc::clone(&self.callbacks),
            Arc::clone(&notify),
            Arc::clone(&stop),
        ));
        notify.notify_one();
        *slot = Some(Worker { notify, stop });
        tracing::info!("request.cache.drain_started");
    }

    /// Stop draining. In-flight work finishes, queued work stays persisted
    /// untouched, and a later [`RequestQueue::start`] picks it back up.
    pub fn stop(&self) {
        if let Some(worker) = self.worker.lock().expect("queue worker poisoned").take() {
            worker.stop.store(true, Ordering::SeqCst);
            worker.notify.notify_one();
            tracing::info!("request.cache.drain_stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().expect("queue worker poisoned").is_some()
    }

    /// Trigger a drain pass if the worker is running.
    pub fn drain_now(&self) {
        if let Some(worker) = &*self.worker.lock().expect("queue worker poisoned") {
            worker.notify.notify_one();
        }
    }

    /// Persisted requests, in drain order.
    ///
    /// # Errors
    /// Returns an error if the store query fails.
    pub fn pending(&self) -> Result<Vec<QueuedRequest>, crate::error::StoreError> {
        self.store.pending()
    }

    fn spawn_transient(&self, request: QueuedRequest, callback: Option<ResponseCallback>) {
        let http = self.http.clone();
        let secret = self.secret.clone();
        let hostname = Arc::clone(&self.hostname);
        self.handle.spawn(async move {
            let host = hostname.lock().expect("queue hostname poisoned").clone();
            match http
                .post_signed(&host, &request.endpoint, &request.payload, &secret)
                .await
            {
                Ok(response) => {
                    tracing::debug!(
                        endpoint = %request.endpoint,
                        status = response.status,
                        "request.transient.sent"
                    );
                    if let Some(cb) = callback {
                        cb(response.status, &response.body);
                    }
                }
                Err(e) => {
                    tracing::warn!(endpoint = %request.endpoint, error = %e, "request.transient.lost")
                }
            }
        });
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    store: Arc<RequestStore>,
    http: SignedHttpClient,
    secret: String,
    hostname: Arc<Mutex<String>>,
    callbacks: Arc<Mutex<HashMap<String, ResponseCallback>>>,
    notify: Arc<Notify>,
    stop: Arc<AtomicBool>,
) {
    loop {
        notify.notified().await;
        if stop.load(Ordering::SeqCst) {
            break;
        }
        drain_pass(&store, &http, &secret, &hostname, &callbacks, &stop).await;
        if stop.load(Ordering::SeqCst) {
            break;
        }
    }
}

async fn drain_pass(
    store: &RequestStore,
    http: &SignedHttpClient,
    secret: &str,
    hostname: &Mutex<String>,
    callbacks: &Mutex<HashMap<String, ResponseCallback>>,
    stop: &AtomicBool,
) {
    let rows = match store.pending() {
        Ok(rows) => rows,
        Err(e) => {
            tracing::error!(error = %e, "request.cache.enumerate_failed");
            return;
        }
    };

    for request in rows {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let host = hostname.lock().expect("queue hostname poisoned").clone();
        let outcome = http
            .post_signed(&host, &request.endpoint, &request.payload, secret)
            .await;

        match outcome {
            Ok(response) => match ResponseClass::from_status(response.status) {
                ResponseClass::Delivered => {
                    remove_row(store, &request.request_id);
                    tracing::debug!(
                        endpoint = %request.endpoint,
                        status = response.status,
                        "request.cache.delivered"
                    );
                    run_callback(callbacks, &request.request_id, response.status, &response.body);
                }
                ResponseClass::Gone => {
                    remove_row(store, &request.request_id);
                    tracing::warn!(endpoint = %request.endpoint, "request.cache.gone");
                    run_callback(callbacks, &request.request_id, response.status, &response.body);
                }
                ResponseClass::Retry => {
                    bump_row(store, &request.request_id);
                    tracing::debug!(
                        endpoint = %request.endpoint,
                        status = response.status,
                        retry_count = request.retry_count + 1,
                        "request.cache.retry"
                    );
                }
            },
            Err(e) => {
                bump_row(store, &request.request_id);
                tracing::debug!(
                    endpoint = %request.endpoint,
                    error = %e,
                    retry_count = request.retry_count + 1,
                    "request.cache.retry"
                );
            }
        }
    }
}

fn remove_row(store: &RequestStore, request_id: &str) {
    if let Err(e) = store.delete(request_id) {
        tracing::error!(%request_id, error = %e, "request.cache.delete_failed");
    }
}

fn bump_row(store: &RequestStore, request_id: &str) {
    if let Err(e) = store.bump_retry(request_id) {
        tracing::error!(%request_id, error = %e, "request.cache.bump_failed");
    }
}

fn run_callback(
    callbacks: &Mutex<HashMap<String, ResponseCallback>>,
    request_id: &str,
    status: u16,
    body: &str,
) {
    let cb = callbacks
        .lock()
        .expect("queue callbacks poisoned")
        .remove(request_id);
    if let Some(cb) = cb {
        cb(status, body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn payload() -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("k".into(), json!("v"));
        map
    }

    fn queue_with_store() -> (Arc<RequestStore>, RequestQueue) {
        let store = Arc::new(RequestStore::open_memory().unwrap());
        let queue = RequestQueue::new(
            Arc::clone(&store),
            SignedHttpClient::new(),
            "secret",
            tokio::runtime::Handle::current(),
        );
        (store, queue)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn response_class_table() {
        assert_eq!(ResponseClass::from_status(200), ResponseClass::Delivered);
        assert_eq!(ResponseClass::from_status(201), ResponseClass::Delivered);
        assert_eq!(ResponseClass::from_status(403), ResponseClass::Delivered);
        assert_eq!(ResponseClass::from_status(404), ResponseClass::Gone);
        assert_eq!(ResponseClass::from_status(429), ResponseClass::Retry);
        assert_eq!(ResponseClass::from_status(500), ResponseClass::Retry);
        assert_eq!(ResponseClass::from_status(503), ResponseClass::Retry);
    }

    #[tokio::test]
    async fn submit_persists_without_worker() {
        let (store, queue) = queue_with_store();
        assert!(queue.submit(QueuedRequest::new("/me/events", payload())));
        assert_eq!(store.len().unwrap(), 1);
        assert!(!queue.is_running());
    }

    #[tokio::test]
    async fn drain_removes_delivered_rows() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/me/events")
            .with_status(200)
            .with_body("{}")
            .expect(1)
            .create_async()
            .await;

        let (store, queue) = queue_with_store();
        queue.set_hostname(&server.url());
        queue.submit(QueuedRequest::new("/me/events", payload()));
        queue.start();

        wait_until(|| store.is_empty().unwrap()).await;
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_error_keeps_row_and_bumps_retry() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/me/events")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;

        let (store, queue) = queue_with_store();
        queue.set_hostname(&server.url());
        queue.submit(QueuedRequest::new("/me/events", payload()));
        queue.start();

        wait_until(|| {
            store
                .pending()
                .unwrap()
                .first()
                .is_some_and(|r| r.retry_count == 1)
        })
        .await;
        assert_eq!(store.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn not_found_discards_permanently() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/retired")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let (store, queue) = queue_with_store();
        queue.set_hostname(&server.url());
        queue.submit(QueuedRequest::new("/retired", payload()));
        queue.start();

        wait_until(|| store.is_empty().unwrap()).await;
    }

    #[tokio::test]
    async fn callback_fires_on_terminal_outcome() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/games/1/users.json")
            .with_status(200)
            .with_body("{\"country_code\":\"US\"}")
            .create_async()
            .await;

        let (store, queue) = queue_with_store();
        queue.set_hostname(&server.url());

        let (tx, rx) = std::sync::mpsc::channel();
        queue.submit_with_callback(
            QueuedRequest::new("/games/1/users.json", payload()),
            Box::new(move |status, body| {
                let _ = tx.send((status, body.to_string()));
            }),
        );
        queue.start();

        wait_until(|| store.is_empty().unwrap()).await;
        let (status, body) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(status, 200);
        assert!(body.contains("country_code"));
    }

    #[tokio::test]
    async fn callback_survives_retry_until_delivery() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("POST", "/games/1/users.json")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let (store, queue) = queue_with_store();
        queue.set_hostname(&server.url());

        let (tx, rx) = std::sync::mpsc::channel();
        queue.submit_with_callback(
            QueuedRequest::new("/games/1/users.json", payload()),
            Box::new(move |status, _| {
                let _ = tx.send(status);
            }),
        );
        queue.start();

        wait_until(|| {
            store
                .pending()
                .unwrap()
                .first()
                .is_some_and(|r| r.retry_count == 1)
        })
        .await;
        failing.assert_async().await;
        assert!(rx.try_recv().is_err());

        server
            .mock("POST", "/games/1/users.json")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;
        queue.drain_now();

        wait_until(|| store.is_empty().unwrap()).await;
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 200);
    }

    // Multi-thread flavor: the test blocks its thread in `recv_timeout`, so
    // the spawned transient send needs a worker thread to run on.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transient_requests_skip_the_store() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/me/profile")
            .with_status(200)
            .with_body("{}")
            .expect(1)
            .create_async()
            .await;

        let (store, queue) = queue_with_store();
        queue.set_hostname(&server.url());

        let (tx, rx) = std::sync::mpsc::channel();
        queue.submit_with_callback(
            QueuedRequest::transient("/me/profile", payload()),
            Box::new(move |status, _| {
                let _ = tx.send(status);
            }),
        );

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 200);
        assert!(store.is_empty().unwrap());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn stop_keeps_rows_for_later() {
        let (store, queue) = queue_with_store();
        queue.start();
        queue.stop();
        assert!(!queue.is_running());

        queue.submit(QueuedRequest::new("/me/events", payload()));
        assert_eq!(store.len().unwrap(), 1);
    }
}
