//! Response caching: an in-memory store and the middleware that fills it.
//!
//! [`CacheMiddleware`] memoizes whole responses keyed by the request target
//! (path plus raw query string). A hit replays the stored response without
//! touching the inner handler; a miss runs the inner handler against a
//! [`ResponseCapture`], stores the result if the [`AdmissionPolicy`] allows,
//! and replays it.
//!
//! ## Limitations
//!
//! - Only `GET` is served; every other method gets a bare `403` whose body is
//!   `invalid request type` (no `Content-Type`), since nothing ever invalidates an entry.
//! - Keys are not normalized: `/a?x=1&y=2` and `/a?y=2&x=1` are distinct.
//! - No `Vary` support, no expiry, no revalidation.
//! - [`CacheStore::new`] never evicts; use [`CacheStore::bounded`] when the key
//!   space is not small and finite.
//!
//! Concurrent misses for the same key may each run the inner handler; the
//! last one to finish wins the slot. The store's lock is never held while the
//! inner handler runs.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::http::{Method, Request, Response, ResponseCapture, ResponseWriter, StatusCode};
use crate::middleware::{BoxFuture, Handler};

/// Which captured responses are eligible for storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdmissionPolicy {
    /// Store `2xx` responses only.
    #[default]
    SuccessOnly,
    /// Store every response, errors included.
    Always,
}

impl AdmissionPolicy {
    /// Returns `true` if a response with `status` may be stored.
    pub fn admits(self, status: StatusCode) -> bool {
        match self {
            Self::SuccessOnly => status.is_success(),
            Self::Always => true,
        }
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    entries: HashMap<String, Arc<Response>>,
    // Insertion order, maintained only when bounded.
    order: VecDeque<String>,
}

/// A process-wide, thread-safe map from request target to captured response.
///
/// Cheap to clone: clones share the same underlying map.
///
/// # Examples
///
/// ```
/// use hamster::cache::CacheStore;
/// use hamster::http::{Response, StatusCode};
///
/// let store = CacheStore::bounded(2);
/// store.insert("/a", Response::new(StatusCode::Ok));
/// store.insert("/b", Response::new(StatusCode::Ok));
/// store.insert("/c", Response::new(StatusCode::Ok));
///
/// assert!(store.get("/a").is_none()); // oldest evicted
/// assert_eq!(store.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct CacheStore {
    inner: Arc<Mutex<StoreInner>>,
    capacity: Option<usize>,
}

impl CacheStore {
    /// An unbounded store. Entries live until the process exits.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store holding at most `capacity` entries; inserting a new key into a
    /// full store evicts the oldest-inserted key.
    ///
    /// A capacity of zero admits nothing.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            inner: Arc::default(),
            capacity: Some(capacity),
        }
    }

    /// The configured capacity, or `None` when unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Returns the stored response for `key`.
    pub fn get(&self, key: &str) -> Option<Arc<Response>> {
        self.lock().entries.get(key).cloned()
    }

    /// Stores `response` under `key`, replacing any previous entry, and
    /// returns the shared handle now in the store.
    pub fn insert(&self, key: impl Into<String>, response: Response) -> Arc<Response> {
        let key = key.into();
        let response = Arc::new(response);

        let mut inner = self.lock();
        match self.capacity {
            None => {
                inner.entries.insert(key, Arc::clone(&response));
            }
            Some(0) => {}
            Some(capacity) => {
                if inner.entries.contains_key(&key) {
                    inner.entries.insert(key, Arc::clone(&response));
                } else {
                    while inner.entries.len() >= capacity {
                        let Some(oldest) = inner.order.pop_front() else {
                            break;
                        };
                        inner.entries.remove(&oldest);
                        debug!(key = %oldest, "cache evict");
                    }
                    inner.order.push_back(key.clone());
                    inner.entries.insert(key, Arc::clone(&response));
                }
            }
        }
        response
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // A panic while holding the lock cannot leave the map half-written:
        // every mutation above is a single HashMap/VecDeque call.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Memoizes the inner handler's responses in a [`CacheStore`].
///
/// # Behavior
///
/// - Non-`GET` → `403 Forbidden`, body `invalid request type`; the store and
///   the inner handler are untouched.
/// - `GET`, key present → the stored response is replayed.
/// - `GET`, key absent → the inner handler runs on its own copy of the request
///   against a fresh capture; the result is stored if admitted, then replayed
///   either way.
pub struct CacheMiddleware<H> {
    store: CacheStore,
    policy: AdmissionPolicy,
    inner: H,
}

impl<H: Handler> CacheMiddleware<H> {
    pub fn new(store: CacheStore, inner: H) -> Self {
        Self {
            store,
            policy: AdmissionPolicy::default(),
            inner,
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: AdmissionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The store backing this middleware.
    pub fn store(&self) -> &CacheStore {
        &self.store
    }
}

impl<H: Handler> Handler for CacheMiddleware<H> {
    fn serve<'a>(&'a self, request: Request, writer: &'a mut dyn ResponseWriter) -> BoxFuture<'a> {
        Box::pin(async move {
            if *request.method() != Method::Get {
                writer.write_status(StatusCode::Forbidden);
                writer.write(b"invalid request type");
                return;
            }

            let key = request.target();
            if let Some(hit) = self.store.get(&key) {
                debug!(key = %key, "cache hit");
                hit.replay(writer);
                return;
            }

            debug!(key = %key, "cache miss");
            let mut capture = ResponseCapture::new();
            self.inner.serve(request, &mut capture).await;
            let response = capture.into_response();

            if self.policy.admits(response.status()) {
                let stored = self.store.insert(key, response);
                stored.replay(writer);
            } else {
                debug!(key = %key, status = %response.status(), "response not admitted");
                response.replay(writer);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::middleware::handler_fn;

    fn make_request(method: &str, path: &str) -> Request {
        let raw = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        req
    }

    // Replies with the number of times it has been invoked.
    fn counting(status: StatusCode) -> (Arc<AtomicUsize>, impl Handler) {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let handler = handler_fn(move |_req, w| {
            let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move {
                w.append_header("X-Call", &n.to_string());
                w.write_status(status);
                w.write(format!("call {n}").as_bytes());
            })
        });
        (calls, handler)
    }

    async fn get(handler: &impl Handler, method: &str, path: &str) -> Response {
        let mut capture = ResponseCapture::new();
        handler.serve(make_request(method, path), &mut capture).await;
        capture.into_response()
    }

    #[tokio::test]
    async fn second_get_is_served_from_cache() {
        let (calls, inner) = counting(StatusCode::Ok);
        let cache = CacheMiddleware::new(CacheStore::new(), inner);

        let first = get(&cache, "GET", "/img.png").await;
        let second = get(&cache, "GET", "/img.png").await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert_eq!(second.body_slice(), b"call 1");
        assert_eq!(cache.store().len(), 1);
    }

    #[tokio::test]
    async fn non_get_is_forbidden_and_never_reaches_inner() {
        let (calls, inner) = counting(StatusCode::Ok);
        let cache = CacheMiddleware::new(CacheStore::new(), inner);

        for method in ["POST", "PUT", "DELETE", "HEAD"] {
            let r = get(&cache, method, "/img.png").await;
            assert_eq!(r.status(), StatusCode::Forbidden);
            assert_eq!(r.body_slice(), b"invalid request type");
            assert!(r.headers().is_empty());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(cache.store().is_empty());
    }

    #[tokio::test]
    async fn errors_are_not_admitted_by_default() {
        let (calls, inner) = counting(StatusCode::NotFound);
        let cache = CacheMiddleware::new(CacheStore::new(), inner);

        let first = get(&cache, "GET", "/nope").await;
        let second = get(&cache, "GET", "/nope").await;

        assert_eq!(first.status(), StatusCode::NotFound);
        assert_eq!(second.body_slice(), b"call 2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.store().is_empty());
    }

    #[tokio::test]
    async fn always_policy_stores_errors() {
        let (calls, inner) = counting(StatusCode::NotFound);
        let cache =
            CacheMiddleware::new(CacheStore::new(), inner).with_policy(AdmissionPolicy::Always);

        get(&cache, "GET", "/nope").await;
        let second = get(&cache, "GET", "/nope").await;

        assert_eq!(second.status(), StatusCode::NotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn query_string_is_part_of_the_key() {
        let (calls, inner) = counting(StatusCode::Ok);
        let cache = CacheMiddleware::new(CacheStore::new(), inner);

        get(&cache, "GET", "/a?x=1&y=2").await;
        get(&cache, "GET", "/a?y=2&x=1").await;
        get(&cache, "GET", "/a").await;
        get(&cache, "GET", "/a?x=1&y=2").await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn hit_replays_headers_once() {
        let (_, inner) = counting(StatusCode::Ok);
        let cache = CacheMiddleware::new(CacheStore::new(), inner);

        get(&cache, "GET", "/h").await;
        let hit = get(&cache, "GET", "/h").await;
        let values: Vec<_> = hit.headers().get_all("x-call").collect();
        assert_eq!(values, vec!["1"]);
    }

    #[tokio::test]
    async fn inner_sees_a_copy_of_the_request() {
        let inner = handler_fn(|mut req, w| {
            Box::pin(async move {
                req.set_path("/mutated");
                w.reply(StatusCode::Ok, req.path());
            })
        });
        let store = CacheStore::new();
        let cache = CacheMiddleware::new(store.clone(), inner);

        let r = get(&cache, "GET", "/original").await;
        assert_eq!(r.body_slice(), b"/mutated");
        assert!(store.get("/original").is_some());
        assert!(store.get("/mutated").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_keep_the_store_consistent() {
        let (calls, inner) = counting(StatusCode::Ok);
        let cache = Arc::new(CacheMiddleware::new(CacheStore::new(), inner));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..64 {
            let cache = Arc::clone(&cache);
            tasks.spawn(async move {
                let path = format!("/img/{}", i % 8);
                let r = get(&*cache, "GET", &path).await;
                assert_eq!(r.status(), StatusCode::Ok);
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap();
        }

        assert_eq!(cache.store().len(), 8);
        let n = calls.load(Ordering::SeqCst);
        assert!((8..=64).contains(&n), "inner ran {n} times");

        // Once populated, nothing recomputes.
        for i in 0..8 {
            get(&*cache, "GET", &format!("/img/{i}")).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), n);
    }

    #[test]
    fn bounded_store_evicts_oldest_first() {
        let store = CacheStore::bounded(2);
        store.insert("/a", Response::new(StatusCode::Ok).body("a"));
        store.insert("/b", Response::new(StatusCode::Ok).body("b"));
        // Replacing an existing key doesn't evict or reorder.
        store.insert("/a", Response::new(StatusCode::Ok).body("a2"));
        assert_eq!(store.len(), 2);

        store.insert("/c", Response::new(StatusCode::Ok).body("c"));
        assert!(store.get("/a").is_none());
        assert_eq!(store.get("/b").unwrap().body_slice(), b"b");
        assert_eq!(store.get("/c").unwrap().body_slice(), b"c");
    }

    #[test]
    fn zero_capacity_store_admits_nothing() {
        let store = CacheStore::bounded(0);
        store.insert("/a", Response::new(StatusCode::Ok));
        assert!(store.is_empty());
    }

    #[test]
    fn unbounded_store_grows_and_clears() {
        let store = CacheStore::new();
        for i in 0..100 {
            store.insert(format!("/{i}"), Response::new(StatusCode::Ok));
        }
        assert_eq!(store.len(), 100);
        assert_eq!(store.capacity(), None);
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn admission_policies() {
        assert!(AdmissionPolicy::SuccessOnly.admits(StatusCode::Ok));
        assert!(AdmissionPolicy::SuccessOnly.admits(StatusCode::NoContent));
        assert!(!AdmissionPolicy::SuccessOnly.admits(StatusCode::NotFound));
        assert!(AdmissionPolicy::Always.admits(StatusCode::InternalServerError));
    }
}
