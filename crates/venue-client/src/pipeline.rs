//! Authenticated request pipeline
//!
//! Every dashboard call goes through [`ApiClient::execute`]: attach the bearer
//! token, dispatch, and on the first 401 ask the refresh coordinator for a
//! fresh token and retry exactly once. The refresh endpoint itself is never
//! retried, so a 401 from it can't recurse into another refresh.
//!
//! Non-2xx responses come back as [`HttpError`] with the backend's error
//! envelope flattened to a single message.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::Secret;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};
use venue_auth::{CredentialPair, CredentialStore, Persistence, REFRESH_PATH, RefreshEndpoint, envelope};
use venue_session::{RefreshCoordinator, SessionEnded, SessionEvents};

use crate::config::{ClientConfig, HeaderInjection};
use crate::error::{Error, HttpError, Result};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// A replayable description of one outbound call.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<serde_json::Value>,
    headers: HeaderMap,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// A successful (2xx) response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| Error::Decode(e.to_string()))
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Build the shared HTTP client. The cookie store gives every call, refresh
/// included, the same cookie passthrough.
pub fn build_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .cookie_store(true)
        .build()
        .map_err(|e| Error::Setup(format!("building HTTP client: {e}")))
}

/// Authenticated client for the venue dashboard API.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    default_headers: HeaderMap,
    coordinator: Arc<RefreshCoordinator>,
}

impl ApiClient {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        timeout: Duration,
        coordinator: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            timeout,
            default_headers: HeaderMap::new(),
            coordinator,
        }
    }

    /// Wire the full stack from configuration: credential store, refresh
    /// endpoint, coordinator and client, all sharing one HTTP client.
    pub async fn from_config(config: &ClientConfig, events: SessionEvents) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::Setup(e.to_string()))?;

        let http = build_http_client()?;
        let store = match &config.storage.durable_path {
            Some(path) => CredentialStore::open(path.clone()).await?,
            None => CredentialStore::in_memory(),
        };
        let endpoint = RefreshEndpoint::new(http.clone(), &config.api.base_url, config.timeout());
        let coordinator = Arc::new(RefreshCoordinator::new(
            Arc::new(store),
            Arc::new(endpoint),
            events,
        ));

        Ok(Self::new(http, &config.api.base_url, config.timeout(), coordinator)
            .with_default_headers(&config.headers))
    }

    /// Add headers sent with every request.
    ///
    /// Invalid names or values are skipped with a warning, and `Authorization`
    /// is never accepted here since the pipeline owns it.
    pub fn with_default_headers(mut self, injections: &[HeaderInjection]) -> Self {
        for injection in injections {
            let name = match HeaderName::from_str(&injection.name) {
                Ok(n) => n,
                Err(e) => {
                    warn!(header = %injection.name, error = %e, "skipping invalid header name");
                    continue;
                }
            };
            if name == AUTHORIZATION {
                warn!(header = %injection.name, "refusing to configure authorization as a default header");
                continue;
            }
            let value = match HeaderValue::from_str(&injection.value) {
                Ok(v) => v,
                Err(e) => {
                    warn!(header = %injection.name, error = %e, "skipping invalid header value");
                    continue;
                }
            };
            self.default_headers.insert(name, value);
        }
        self
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        self.coordinator.store()
    }

    /// Subscribe to the session-ended broadcast.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SessionEnded> {
        self.coordinator.events().subscribe()
    }

    /// Store credentials from a successful login or registration.
    pub async fn login(&self, pair: CredentialPair, persistence: Persistence) -> Result<()> {
        self.store().login(pair, persistence).await?;
        Ok(())
    }

    /// Forget the session. Does not publish a session-ended event; the caller
    /// initiated this logout and already knows.
    pub async fn logout(&self) -> Result<()> {
        self.store().clear().await?;
        Ok(())
    }

    /// Shorthand for `execute` with an optional JSON body.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<ApiResponse> {
        let mut spec = RequestSpec::new(method, path);
        spec.body = body;
        self.execute(spec).await
    }

    /// Dispatch `spec`, refreshing the credential and retrying once on 401.
    pub async fn execute(&self, spec: RequestSpec) -> Result<ApiResponse> {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.execute_with_refresh(&spec, request_id).await
    }

    #[instrument(skip_all, fields(request_id = %request_id, method = %spec.method, path = %spec.path))]
    async fn execute_with_refresh(&self, spec: &RequestSpec, request_id: String) -> Result<ApiResponse> {
        let sent = self.store().access_token().await;
        let response = self.dispatch(spec, sent.as_ref(), &request_id).await?;

        if response.status() != StatusCode::UNAUTHORIZED || is_refresh_endpoint(&spec.path) {
            return self.finish(spec, response).await;
        }

        let current = self.store().access_token().await;
        let token = match (sent, current) {
            // Another request already refreshed while this one was in flight
            (Some(sent), Some(current)) if sent != current => {
                debug!("access token already replaced, retrying with stored token");
                current
            }
            // The session ended while this one was in flight
            (Some(sent), None) => {
                if let Some(error) = self.coordinator.ended_session(&sent) {
                    debug!(reason = error.reason.as_str(), "session already ended, not refreshing");
                    return Err(error.into());
                }
                debug!("credentials cleared while in flight, not refreshing");
                return self.finish(spec, response).await;
            }
            _ => {
                debug!("access token rejected, refreshing");
                self.coordinator.ensure_fresh_token().await?
            }
        };

        crate::metrics::record_unauthorized_retry();
        let retried = self.dispatch(spec, Some(&token), &request_id).await?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            warn!("retry rejected with fresh credential, not refreshing again");
        }
        self.finish(spec, retried).await
    }

    async fn dispatch(
        &self,
        spec: &RequestSpec,
        token: Option<&Secret<String>>,
        request_id: &str,
    ) -> Result<reqwest::Response> {
        let mut headers = self.default_headers.clone();
        headers.extend(spec.headers.clone());

        if let Some(token) = token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token.as_str()))
                .map_err(|e| Error::InvalidRequest(format!("invalid token value: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert(REQUEST_ID_HEADER, value);
        }

        let mut request = self
            .http
            .request(spec.method.clone(), self.url_for(&spec.path))
            .headers(headers)
            .timeout(self.timeout);
        if !spec.query.is_empty() {
            request = request.query(&spec.query);
        }
        if let Some(body) = &spec.body {
            request = request.json(body);
        }

        request.send().await.map_err(|e| {
            crate::metrics::record_request(spec.method.as_str(), "error");
            warn!(error = %e, timeout = e.is_timeout(), "request dispatch failed");
            Error::Http(HttpError {
                status: None,
                message: envelope::flatten_message(&[], Some(&e.to_string())),
            })
        })
    }

    /// Turn a response into the caller's result, flattening error envelopes.
    async fn finish(&self, spec: &RequestSpec, response: reqwest::Response) -> Result<ApiResponse> {
        let status = response.status();
        let headers = response.headers().clone();
        crate::metrics::record_request(spec.method.as_str(), status.as_str());

        let body = response.bytes().await.map_err(|e| {
            warn!(error = %e, status = status.as_u16(), "failed to read response body");
            Error::Http(HttpError {
                status: Some(status),
                message: envelope::flatten_message(&[], Some(&e.to_string())),
            })
        })?;

        if status.is_success() {
            return Ok(ApiResponse {
                status,
                headers,
                body,
            });
        }

        let message = envelope::flatten_message(&body, Some(&status.to_string()));
        debug!(status = status.as_u16(), message = %message, "request failed");
        Err(Error::Http(HttpError {
            status: Some(status),
            message,
        }))
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_owned();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

/// Whether `path` addresses the refresh endpoint (query, leading and trailing
/// slashes ignored).
pub fn is_refresh_endpoint(path: &str) -> bool {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let path = format!("/{}", path.trim_matches('/'));
    path.ends_with(REFRESH_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::body::Body;
    use axum::extract::State;
    use axum::http::Request;
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;
    use tokio::sync::Barrier;
    use venue_session::LogoutReason;

    /// How the mock refresh endpoint answers.
    #[derive(Clone, Copy)]
    enum RefreshMode {
        /// R1 -> {T2, R2}; anything else is INVALID_REFRESH_TOKEN
        Rotate,
        /// 400 {"error": "INVALID_REFRESH_TOKEN"}
        Expired,
        /// 401 {"error": "INVALID_SESSION"}
        Unauthorized,
    }

    #[derive(Clone)]
    struct Backend {
        mode: RefreshMode,
        /// Reject every token, including fresh ones
        reject_all: bool,
        /// Hold first-round 401s until this many requests have arrived
        barrier: Option<Arc<Barrier>>,
        refresh_calls: Arc<AtomicUsize>,
        seen: Arc<Mutex<Vec<(String, Option<String>)>>>,
    }

    impl Backend {
        fn new(mode: RefreshMode) -> Self {
            Self {
                mode,
                reject_all: false,
                barrier: None,
                refresh_calls: Arc::new(AtomicUsize::new(0)),
                seen: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn refresh_calls(&self) -> usize {
            self.refresh_calls.load(Ordering::SeqCst)
        }

        fn seen(&self) -> Vec<(String, Option<String>)> {
            self.seen.lock().unwrap().clone()
        }

        fn hits(&self, path: &str) -> usize {
            self.seen().iter().filter(|(p, _)| p == path).count()
        }
    }

    fn error_body(status: axum::http::StatusCode, error: &str) -> Response {
        (status, Json(serde_json::json!({ "error": error }))).into_response()
    }

    async fn refresh_handler(
        State(backend): State<Backend>,
        Json(body): Json<serde_json::Value>,
    ) -> Response {
        backend.refresh_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        match backend.mode {
            RefreshMode::Rotate if body["refresh_token"] == "R1" => Json(
                serde_json::json!({ "token": "T2", "refresh_token": "R2" }),
            )
            .into_response(),
            RefreshMode::Rotate | RefreshMode::Expired => {
                error_body(axum::http::StatusCode::BAD_REQUEST, "INVALID_REFRESH_TOKEN")
            }
            RefreshMode::Unauthorized => {
                error_body(axum::http::StatusCode::UNAUTHORIZED, "INVALID_SESSION")
            }
        }
    }

    async fn business_handler(State(backend): State<Backend>, request: Request<Body>) -> Response {
        let path = request.uri().path().to_string();
        let auth = request
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        backend.seen.lock().unwrap().push((path.clone(), auth.clone()));

        match path.as_str() {
            "/missing" => {
                return error_body(axum::http::StatusCode::NOT_FOUND, "VENUE_NOT_FOUND");
            }
            "/broken" => {
                return (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({ "message": "Screen offline" })),
                )
                    .into_response();
            }
            "/plain" => {
                return (axum::http::StatusCode::SERVICE_UNAVAILABLE, "down").into_response();
            }
            "/slow" => {
                tokio::time::sleep(Duration::from_secs(2)).await;
                return axum::http::StatusCode::OK.into_response();
            }
            "/echo" => {
                let headers: serde_json::Map<String, serde_json::Value> = request
                    .headers()
                    .iter()
                    .map(|(k, v)| {
                        (
                            k.to_string(),
                            serde_json::Value::String(v.to_str().unwrap_or("").to_string()),
                        )
                    })
                    .collect();
                let method = request.method().to_string();
                let query = request.uri().query().unwrap_or("").to_string();
                let body = axum::body::to_bytes(request.into_body(), 1024 * 1024)
                    .await
                    .unwrap();
                return Json(serde_json::json!({
                    "headers": headers,
                    "method": method,
                    "query": query,
                    "body": String::from_utf8_lossy(&body),
                }))
                .into_response();
            }
            _ => {}
        }

        if auth.as_deref() == Some("Bearer T2") && !backend.reject_all {
            return Json(serde_json::json!({ "path": path })).into_response();
        }
        if auth.as_deref() == Some("Bearer T1") {
            if let Some(barrier) = &backend.barrier {
                barrier.wait().await;
            }
            if path == "/late-expiry" {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
        }
        error_body(axum::http::StatusCode::UNAUTHORIZED, "TOKEN_EXPIRED")
    }

    async fn start_backend(backend: Backend) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        tokio::spawn(async move {
            let app = axum::Router::new()
                .route(REFRESH_PATH, post(refresh_handler))
                .fallback(business_handler)
                .with_state(backend);
            axum::serve(listener, app).await.unwrap();
        });

        url
    }

    async fn logged_in_store() -> Arc<CredentialStore> {
        let store = CredentialStore::in_memory();
        store
            .login(CredentialPair::new("T1", "R1"), Persistence::Durable)
            .await
            .unwrap();
        Arc::new(store)
    }

    fn client(url: &str, store: Arc<CredentialStore>, timeout: Duration) -> ApiClient {
        let http = build_http_client().unwrap();
        let endpoint = RefreshEndpoint::new(http.clone(), url, timeout);
        let coordinator = Arc::new(RefreshCoordinator::new(
            store,
            Arc::new(endpoint),
            SessionEvents::new(),
        ));
        ApiClient::new(http, url, timeout, coordinator)
    }

    #[test]
    fn refresh_endpoint_identity() {
        assert!(is_refresh_endpoint("/auth/refresh-token"));
        assert!(is_refresh_endpoint("auth/refresh-token/"));
        assert!(is_refresh_endpoint("/auth/refresh-token?source=dashboard"));
        assert!(is_refresh_endpoint("https://api.venues.example/auth/refresh-token"));
        assert!(!is_refresh_endpoint("/auth/login"));
        assert!(!is_refresh_endpoint("/auth/refresh-token/history"));
        assert!(!is_refresh_endpoint("/venues?next=/auth/refresh-token"));
    }

    #[tokio::test]
    async fn url_joins_base_and_path() {
        let store = Arc::new(CredentialStore::in_memory());
        let client = client("http://api.local/", store, Duration::from_secs(1));
        assert_eq!(client.url_for("/venues"), "http://api.local/venues");
        assert_eq!(client.url_for("venues/7"), "http://api.local/venues/7");
        assert_eq!(
            client.url_for("https://cdn.local/screens"),
            "https://cdn.local/screens"
        );
    }

    #[tokio::test]
    async fn attaches_bearer_and_default_headers() {
        let url = start_backend(Backend::new(RefreshMode::Rotate)).await;
        let client = client(&url, logged_in_store().await, Duration::from_secs(5))
            .with_default_headers(&[
                HeaderInjection {
                    name: "x-client".into(),
                    value: "dashboard".into(),
                },
                HeaderInjection {
                    name: "authorization".into(),
                    value: "Bearer INJECTED".into(),
                },
                HeaderInjection {
                    name: "bad header".into(),
                    value: "x".into(),
                },
            ]);

        let response = client
            .execute(
                RequestSpec::post("/echo")
                    .with_json(serde_json::json!({ "screen": 4 }))
                    .with_query("venue", "12"),
            )
            .await
            .unwrap();
        let echo: serde_json::Value = response.json().unwrap();

        assert_eq!(echo["headers"]["authorization"], "Bearer T1");
        assert_eq!(echo["headers"]["x-client"], "dashboard");
        assert!(echo["headers"]["x-request-id"].as_str().is_some());
        assert_eq!(echo["method"], "POST");
        assert_eq!(echo["query"], "venue=12");
        assert_eq!(echo["body"], r#"{"screen":4}"#);
    }

    #[tokio::test]
    async fn unauthenticated_requests_carry_no_bearer() {
        let url = start_backend(Backend::new(RefreshMode::Rotate)).await;
        let client = client(
            &url,
            Arc::new(CredentialStore::in_memory()),
            Duration::from_secs(5),
        );

        let response = client.request(Method::GET, "/echo", None).await.unwrap();
        let echo: serde_json::Value = response.json().unwrap();

        assert!(echo["headers"].get("authorization").is_none());
    }

    #[tokio::test]
    async fn concurrent_401s_trigger_one_refresh() {
        let mut backend = Backend::new(RefreshMode::Rotate);
        backend.barrier = Some(Arc::new(Barrier::new(3)));
        let url = start_backend(backend.clone()).await;
        let store = logged_in_store().await;
        let client = client(&url, store.clone(), Duration::from_secs(5));

        let results = futures_util::future::join_all(
            ["/venues", "/matches", "/reservations"]
                .into_iter()
                .map(|path| client.execute(RequestSpec::get(path))),
        )
        .await;

        for result in results {
            assert_eq!(result.unwrap().status, StatusCode::OK);
        }
        assert_eq!(backend.refresh_calls(), 1);
        for path in ["/venues", "/matches", "/reservations"] {
            let auths: Vec<_> = backend
                .seen()
                .into_iter()
                .filter(|(p, _)| p == path)
                .map(|(_, auth)| auth)
                .collect();
            assert_eq!(
                auths,
                vec![Some("Bearer T1".to_string()), Some("Bearer T2".to_string())],
                "{path}"
            );
        }
        assert_eq!(store.get().await, Some(CredentialPair::new("T2", "R2")));
    }

    #[tokio::test]
    async fn second_401_is_returned_without_another_refresh() {
        let mut backend = Backend::new(RefreshMode::Rotate);
        backend.reject_all = true;
        let url = start_backend(backend.clone()).await;
        let client = client(&url, logged_in_store().await, Duration::from_secs(5));

        let err = client.execute(RequestSpec::get("/venues")).await.unwrap_err();

        assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));
        assert_eq!(err.to_string(), "TOKEN_EXPIRED");
        assert_eq!(backend.refresh_calls(), 1);
        assert_eq!(backend.hits("/venues"), 2);
    }

    #[tokio::test]
    async fn refresh_endpoint_401_never_recurses() {
        let backend = Backend::new(RefreshMode::Unauthorized);
        let url = start_backend(backend.clone()).await;
        let store = logged_in_store().await;
        let client = client(&url, store.clone(), Duration::from_secs(5));
        let mut events = client.subscribe();

        let err = client
            .execute(
                RequestSpec::post(REFRESH_PATH)
                    .with_json(serde_json::json!({ "refresh_token": "R1" })),
            )
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));
        assert_eq!(err.to_string(), "INVALID_SESSION");
        // Only the direct call reached the endpoint
        assert_eq!(backend.refresh_calls(), 1);
        assert!(store.get().await.is_some());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_refresh_ends_session() {
        let backend = Backend::new(RefreshMode::Expired);
        let url = start_backend(backend.clone()).await;
        let store = logged_in_store().await;
        let client = client(&url, store.clone(), Duration::from_secs(5));
        let mut events = client.subscribe();

        let err = client.execute(RequestSpec::get("/venues")).await.unwrap_err();

        assert_eq!(err.logout_reason(), Some(LogoutReason::SessionExpired));
        let event = events.recv().await.unwrap();
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({ "reason": "session_expired", "backend_error": "INVALID_REFRESH_TOKEN" })
        );
        assert!(store.get().await.is_none());
        assert_eq!(backend.hits("/venues"), 1);
    }

    #[tokio::test]
    async fn concurrent_failures_publish_one_event() {
        let mut backend = Backend::new(RefreshMode::Expired);
        backend.barrier = Some(Arc::new(Barrier::new(3)));
        let url = start_backend(backend.clone()).await;
        let client = client(&url, logged_in_store().await, Duration::from_secs(5));
        let mut events = client.subscribe();

        let results = futures_util::future::join_all(
            ["/venues", "/matches", "/reservations"]
                .into_iter()
                .map(|path| client.execute(RequestSpec::get(path))),
        )
        .await;

        for result in results {
            assert_eq!(
                result.unwrap_err().logout_reason(),
                Some(LogoutReason::SessionExpired)
            );
        }
        assert_eq!(backend.refresh_calls(), 1);
        assert!(events.recv().await.is_ok());
        assert!(events.try_recv().is_err(), "event must fire once");
    }

    #[tokio::test]
    async fn missing_refresh_token_skips_refresh_call() {
        let backend = Backend::new(RefreshMode::Rotate);
        let url = start_backend(backend.clone()).await;
        let client = client(
            &url,
            Arc::new(CredentialStore::in_memory()),
            Duration::from_secs(5),
        );
        let mut events = client.subscribe();

        let err = client.execute(RequestSpec::get("/venues")).await.unwrap_err();

        assert_eq!(err.logout_reason(), Some(LogoutReason::MissingRefreshToken));
        assert_eq!(backend.refresh_calls(), 0);
        let event = events.recv().await.unwrap();
        assert_eq!(event.reason, LogoutReason::MissingRefreshToken);
        assert_eq!(event.backend_error, None);
    }

    #[tokio::test]
    async fn late_401_reuses_already_refreshed_token() {
        let backend = Backend::new(RefreshMode::Rotate);
        let url = start_backend(backend.clone()).await;
        let client = client(&url, logged_in_store().await, Duration::from_secs(5));

        // /late-expiry answers its 401 after /venues has already refreshed
        let (late, early) = tokio::join!(
            client.execute(RequestSpec::get("/late-expiry")),
            client.execute(RequestSpec::get("/venues")),
        );

        assert!(early.is_ok());
        assert!(late.is_ok());
        assert_eq!(backend.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn relative_refresh_path_never_recurses() {
        let backend = Backend::new(RefreshMode::Unauthorized);
        let url = start_backend(backend.clone()).await;
        let store = logged_in_store().await;
        let client = client(&url, store.clone(), Duration::from_secs(5));
        let mut events = client.subscribe();

        let err = client
            .execute(
                RequestSpec::post("auth/refresh-token")
                    .with_json(serde_json::json!({ "refresh_token": "R1" })),
            )
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));
        assert_eq!(err.logout_reason(), None);
        assert_eq!(backend.refresh_calls(), 1);
        assert_eq!(store.get().await, Some(CredentialPair::new("T1", "R1")));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn late_401_after_failed_refresh_shares_its_outcome() {
        let backend = Backend::new(RefreshMode::Expired);
        let url = start_backend(backend.clone()).await;
        let client = client(&url, logged_in_store().await, Duration::from_secs(5));
        let mut events = client.subscribe();

        // /late-expiry answers its 401 after /venues has already ended the session
        let (late, early) = tokio::join!(
            client.execute(RequestSpec::get("/late-expiry")),
            client.execute(RequestSpec::get("/venues")),
        );

        assert_eq!(
            early.unwrap_err().logout_reason(),
            Some(LogoutReason::SessionExpired)
        );
        assert_eq!(
            late.unwrap_err().logout_reason(),
            Some(LogoutReason::SessionExpired)
        );
        assert_eq!(backend.refresh_calls(), 1);
        let event = events.recv().await.unwrap();
        assert_eq!(event.reason, LogoutReason::SessionExpired);
        assert!(events.try_recv().is_err(), "event must fire once");
    }

    #[tokio::test]
    async fn late_401_after_logout_is_returned_as_is() {
        let backend = Backend::new(RefreshMode::Rotate);
        let url = start_backend(backend.clone()).await;
        let client = client(&url, logged_in_store().await, Duration::from_secs(5));
        let mut events = client.subscribe();

        let (late, logout) = tokio::join!(client.execute(RequestSpec::get("/late-expiry")), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            client.logout().await
        });

        logout.unwrap();
        let err = late.unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));
        assert_eq!(backend.refresh_calls(), 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn retry_metric_counts_only_real_retries() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let backend = Backend::new(RefreshMode::Expired);
        let url = start_backend(backend.clone()).await;
        let client = client(&url, logged_in_store().await, Duration::from_secs(5));

        client.execute(RequestSpec::get("/venues")).await.unwrap_err();

        let rendered = handle.render();
        assert!(
            !rendered.contains("client_unauthorized_retries_total"),
            "got: {rendered}"
        );
    }

    #[tokio::test]
    async fn business_errors_are_flattened() {
        let backend = Backend::new(RefreshMode::Rotate);
        let url = start_backend(backend.clone()).await;
        let client = client(&url, logged_in_store().await, Duration::from_secs(5));

        let missing = client.execute(RequestSpec::get("/missing")).await.unwrap_err();
        assert_eq!(missing.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(missing.to_string(), "VENUE_NOT_FOUND");

        let broken = client.execute(RequestSpec::delete("/broken")).await.unwrap_err();
        assert_eq!(broken.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert_eq!(broken.to_string(), "Screen offline");

        let plain = client.execute(RequestSpec::put("/plain")).await.unwrap_err();
        assert_eq!(plain.to_string(), "503 Service Unavailable");

        assert_eq!(backend.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn timeout_is_transport_error() {
        let backend = Backend::new(RefreshMode::Rotate);
        let url = start_backend(backend.clone()).await;
        let client = client(&url, logged_in_store().await, Duration::from_millis(200));

        let err = client.execute(RequestSpec::get("/slow")).await.unwrap_err();

        assert!(matches!(err, Error::Http(HttpError { status: None, .. })), "got: {err:?}");
        assert_eq!(backend.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn unreachable_backend_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        let client = client(&url, logged_in_store().await, Duration::from_secs(1));

        let err = client
            .execute(RequestSpec::patch("/venues/1"))
            .await
            .unwrap_err();

        assert_eq!(err.status(), None);
        assert!(!err.to_string().is_empty());
    }

    #[tokio::test]
    async fn json_decode_failure_is_reported() {
        let response = ApiResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"not json"),
        };
        let decoded: Result<serde_json::Value> = response.json();
        assert!(matches!(decoded, Err(Error::Decode(_))));
        assert_eq!(response.text(), "not json");
    }

    #[tokio::test]
    async fn login_and_logout_manage_store() {
        let client = client(
            "http://127.0.0.1:9",
            Arc::new(CredentialStore::in_memory()),
            Duration::from_secs(1),
        );

        client
            .login(CredentialPair::new("T1", "R1"), Persistence::Session)
            .await
            .unwrap();
        assert_eq!(client.store().persistence().await, Some(Persistence::Session));

        client.logout().await.unwrap();
        assert!(client.store().get().await.is_none());
    }

    #[tokio::test]
    async fn from_config_uses_durable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let mut config = ClientConfig::new("http://127.0.0.1:9");
        config.storage.durable_path = Some(path.clone());

        let client = ApiClient::from_config(&config, SessionEvents::new())
            .await
            .unwrap();
        client
            .login(CredentialPair::new("T1", "R1"), Persistence::Durable)
            .await
            .unwrap();

        let on_disk: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["authToken"], "T1");
        assert_eq!(on_disk["refresh_token"], "R1");
    }

    #[tokio::test]
    async fn from_config_rejects_invalid_config() {
        let config = ClientConfig::new("api.venues.example");
        let result = ApiClient::from_config(&config, SessionEvents::new()).await;
        assert!(matches!(result, Err(Error::Setup(_))));
    }
}
