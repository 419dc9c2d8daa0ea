//! HTTP client for the backend REST API.

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::{Method, StatusCode, Url, redirect};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, warn};

use crate::error::ServiceErrorBody;
use crate::{
    ClientConfig, Deferred, ErrorCode, NimbusError, Query, Record, RemoteConfig, RequestOptions,
    User,
};

/// Buffered record events per subscriber before the oldest are dropped.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What happened to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordEventKind {
    Saved,
    Destroyed,
}

/// Notification emitted by saves and destroys.
///
/// Without [`RequestOptions::wait`] the event goes out when the request is
/// dispatched; with it, only after the server confirms. [`RequestOptions::silent`]
/// suppresses it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordEvent {
    pub kind: RecordEventKind,
    pub class_name: String,
    pub object_id: Option<String>,
}

/// Request payload.
pub(crate) enum Body {
    Empty,
    Json(Value),
    Bytes { data: Vec<u8>, content_type: String },
}

struct ClientInner {
    http: reqwest::Client,
    outbound: reqwest::Client,
    outbound_following: reqwest::Client,
    config: ClientConfig,
    base_url: Url,
    current_user: RwLock<Option<User>>,
    current_config: RwLock<Option<RemoteConfig>>,
    events: broadcast::Sender<RecordEvent>,
}

/// Client for one backend application.
///
/// Cheap to clone; clones share configuration, the current user, and the
/// event channel.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("application_id", &self.inner.config.application_id())
            .field("server_url", &self.inner.config.server_url())
            .finish()
    }
}

impl Client {
    /// Create a client for the given configuration.
    pub fn new(config: ClientConfig) -> Result<Self, NimbusError> {
        let base_url = Url::parse(&format!("{}/", config.server_url())).map_err(|e| {
            NimbusError::invalid(
                ErrorCode::NotInitialized,
                format!("invalid server URL {}: {}", config.server_url(), e),
            )
        })?;

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.timeout() {
            builder = builder.timeout(timeout);
        }
        let http = builder.build()?;

        let outbound = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .build()?;
        let outbound_following = reqwest::Client::builder()
            .redirect(redirect::Policy::default())
            .build()?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                outbound,
                outbound_following,
                config,
                base_url,
                current_user: RwLock::new(None),
                current_config: RwLock::new(None),
                events,
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Subscribe to record events from this client and its clones.
    pub fn events(&self) -> broadcast::Receiver<RecordEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn outbound_http(&self, follow_redirects: bool) -> &reqwest::Client {
        if follow_redirects {
            &self.inner.outbound_following
        } else {
            &self.inner.outbound
        }
    }

    pub(crate) async fn current_user_slot(&self) -> tokio::sync::RwLockWriteGuard<'_, Option<User>> {
        self.inner.current_user.write().await
    }

    /// The logged-in user, if any.
    pub async fn current_user(&self) -> Option<User> {
        self.inner.current_user.read().await.clone()
    }

    /// Whether `user` is the logged-in user.
    pub async fn is_current(&self, user: &User) -> bool {
        match (self.inner.current_user.read().await.as_ref(), user.id()) {
            (Some(current), Some(id)) => current.id() == Some(id),
            _ => false,
        }
    }

    pub(crate) async fn set_current_config(&self, config: RemoteConfig) {
        *self.inner.current_config.write().await = Some(config);
    }

    /// The most recently fetched remote config.
    pub async fn current_config(&self) -> Option<RemoteConfig> {
        self.inner.current_config.read().await.clone()
    }

    fn emit(&self, kind: RecordEventKind, record: &Record) {
        let event = RecordEvent {
            kind,
            class_name: record.class_name().to_string(),
            object_id: record.id().map(str::to_string),
        };
        // No subscribers is not an error.
        let _ = self.inner.events.send(event);
    }

    /// Path of an endpoint as seen by the batch API (includes the mount path).
    pub(crate) fn batch_path(&self, relative: &str) -> String {
        format!(
            "{}/{}",
            self.inner.base_url.path().trim_end_matches('/'),
            relative
        )
    }

    async fn session_token_for(&self, options: &RequestOptions) -> Option<String> {
        if let Some(token) = &options.session_token {
            return Some(token.clone());
        }
        self.inner
            .current_user
            .read()
            .await
            .as_ref()
            .and_then(|u| u.session_token().map(str::to_string))
    }

    /// Issue one request against the REST API and decode the JSON response.
    #[tracing::instrument(skip(self, method, query, body, options), fields(method = %method))]
    pub(crate) async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Body,
        options: &RequestOptions,
    ) -> Result<T, NimbusError> {
        let url = self.inner.base_url.join(path).map_err(|e| {
            NimbusError::invalid(ErrorCode::InvalidKeyName, format!("bad path {path}: {e}"))
        })?;

        let config = &self.inner.config;
        let mut request = self
            .inner
            .http
            .request(method, url)
            .header("X-Parse-Application-Id", config.application_id());

        if let Some(key) = config.client_key() {
            request = request.header("X-Parse-JavaScript-Key", key);
        }
        if options.use_master_key {
            let key = config.master_key().ok_or_else(|| {
                NimbusError::invalid(
                    ErrorCode::NotInitialized,
                    "master key requested but not configured",
                )
            })?;
            request = request.header("X-Parse-Master-Key", key);
        }
        if let Some(token) = self.session_token_for(options).await {
            request = request.header("X-Parse-Session-Token", token);
        }
        if !query.is_empty() {
            request = request.query(query);
        }
        request = match body {
            Body::Empty => request,
            Body::Json(value) => request.json(&value),
            Body::Bytes { data, content_type } => {
                request.header("Content-Type", content_type).body(data)
            }
        };

        let response = request.send().await?;
        self.handle_response(response).await
    }

    /// Handle HTTP response and parse JSON.
    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, NimbusError> {
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return Err(NimbusError::RateLimited { retry_after_secs });
        }

        if !status.is_success() {
            let text = response.text().await.map_err(|e| {
                NimbusError::InvalidResponse(format!(
                    "request failed ({}): failed to read response: {}",
                    status, e
                ))
            })?;

            if let Ok(body) = serde_json::from_str::<ServiceErrorBody>(&text) {
                return Err(body.into());
            }

            return Err(NimbusError::InvalidResponse(format!(
                "request failed ({}): {}",
                status, text
            )));
        }

        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Save a record's pending changes, creating it if it has no id.
    pub fn save(&self, record: Record, options: RequestOptions) -> Deferred<Record> {
        let client = self.clone();
        Deferred::spawn(async move { client.save_record(record, &options).await })
    }

    pub(crate) async fn save_record(
        &self,
        mut record: Record,
        options: &RequestOptions,
    ) -> Result<Record, NimbusError> {
        if !record.is_dirty() {
            debug!(class = %record.class_name(), "record has no pending changes");
            return Ok(record);
        }

        if !options.silent && !options.wait {
            self.emit(RecordEventKind::Saved, &record);
        }

        let body = Body::Json(Value::Object(record.save_body()));
        let collection = record.kind().collection_path();
        let response: Map<String, Value> = match record.id() {
            None => {
                self.request(Method::POST, &collection, &[], body, options)
                    .await?
            }
            Some(id) => {
                let path = format!("{collection}/{id}");
                self.request(Method::PUT, &path, &[], body, options).await?
            }
        };

        record.commit_save(response)?;
        debug!(class = %record.class_name(), id = ?record.id(), "saved record");

        if !options.silent && options.wait {
            self.emit(RecordEventKind::Saved, &record);
        }
        Ok(record)
    }

    /// Reload a record from the server, keeping unsaved changes on top.
    pub fn fetch(&self, record: Record, options: RequestOptions) -> Deferred<Record> {
        let client = self.clone();
        Deferred::spawn(async move {
            let mut record = record;
            let id = record.id().map(str::to_string).ok_or_else(|| {
                NimbusError::invalid(ErrorCode::MissingObjectId, "cannot fetch an unsaved record")
            })?;
            let path = format!("{}/{}", record.kind().collection_path(), id);
            let data: Map<String, Value> = client
                .request(Method::GET, &path, &[], Body::Empty, &options)
                .await?;
            let fetched = Record::from_server(record.kind().clone(), data)?;
            record.commit_fetch(fetched);
            Ok(record)
        })
    }

    /// Delete a record. Unsaved records resolve immediately.
    pub fn destroy(&self, record: Record, options: RequestOptions) -> Deferred<()> {
        let Some(id) = record.id().map(str::to_string) else {
            return Deferred::resolved(());
        };
        let client = self.clone();
        Deferred::spawn(async move {
            if !options.silent && !options.wait {
                client.emit(RecordEventKind::Destroyed, &record);
            }
            let path = format!("{}/{}", record.kind().collection_path(), id);
            let _: Value = client
                .request(Method::DELETE, &path, &[], Body::Empty, &options)
                .await?;
            if !options.silent && options.wait {
                client.emit(RecordEventKind::Destroyed, &record);
            }
            Ok(())
        })
    }

    /// Send several operations in one `/batch` request.
    ///
    /// Returns one outcome per operation, in order.
    async fn run_batch(
        &self,
        requests: Vec<Value>,
        options: &RequestOptions,
    ) -> Result<Vec<Result<Map<String, Value>, NimbusError>>, NimbusError> {
        let expected = requests.len();
        let results: Vec<Value> = self
            .request(
                Method::POST,
                "batch",
                &[],
                Body::Json(json!({ "requests": requests })),
                options,
            )
            .await?;

        if results.len() != expected {
            return Err(NimbusError::InvalidResponse(format!(
                "batch returned {} results for {} requests",
                results.len(),
                expected
            )));
        }

        Ok(results
            .into_iter()
            .map(|item| {
                if let Some(Value::Object(success)) = item.get("success") {
                    return Ok(success.clone());
                }
                match item.get("error") {
                    Some(error) => match serde_json::from_value::<ServiceErrorBody>(error.clone()) {
                        Ok(body) => Err(body.into()),
                        Err(e) => Err(e.into()),
                    },
                    None => Err(NimbusError::InvalidResponse(format!(
                        "batch item has neither success nor error: {item}"
                    ))),
                }
            })
            .collect())
    }

    /// Save several records in one batch request.
    ///
    /// Fails with the first per-record error; records that needed no
    /// changes are returned untouched.
    pub fn save_all(&self, records: Vec<Record>, options: RequestOptions) -> Deferred<Vec<Record>> {
        let client = self.clone();
        Deferred::spawn(async move {
            let mut records = records;
            let dirty: Vec<usize> = (0..records.len())
                .filter(|&i| records[i].is_dirty())
                .collect();
            if dirty.is_empty() {
                return Ok(records);
            }

            let requests = dirty
                .iter()
                .map(|&i| {
                    let record = &records[i];
                    let collection = record.kind().collection_path();
                    let (method, path) = match record.id() {
                        None => ("POST", client.batch_path(&collection)),
                        Some(id) => ("PUT", client.batch_path(&format!("{collection}/{id}"))),
                    };
                    json!({
                        "method": method,
                        "path": path,
                        "body": Value::Object(record.save_body()),
                    })
                })
                .collect();

            let outcomes = client.run_batch(requests, &options).await?;
            for (&index, outcome) in dirty.iter().zip(outcomes) {
                records[index].commit_save(outcome?)?;
                if !options.silent {
                    client.emit(RecordEventKind::Saved, &records[index]);
                }
            }
            debug!(count = dirty.len(), "saved records in batch");
            Ok(records)
        })
    }

    /// Delete several records in one batch request.
    ///
    /// Per-record failures are collected into an `AGGREGATE_ERROR`.
    pub fn destroy_all(&self, records: Vec<Record>, options: RequestOptions) -> Deferred<()> {
        let client = self.clone();
        Deferred::spawn(async move {
            let saved: Vec<&Record> = records.iter().filter(|r| r.id().is_some()).collect();
            if saved.is_empty() {
                return Ok(());
            }

            let requests = saved
                .iter()
                .map(|record| {
                    let collection = record.kind().collection_path();
                    let id = record.id().unwrap_or_default();
                    json!({
                        "method": "DELETE",
                        "path": client.batch_path(&format!("{collection}/{id}")),
                    })
                })
                .collect();

            let outcomes = client.run_batch(requests, &options).await?;
            let mut errors = Vec::new();
            for (record, outcome) in saved.iter().zip(outcomes) {
                match outcome {
                    Ok(_) => {
                        if !options.silent {
                            client.emit(RecordEventKind::Destroyed, record);
                        }
                    }
                    Err(e) => {
                        warn!(class = %record.class_name(), id = ?record.id(), error = %e, "batch destroy failed");
                        errors.push(e);
                    }
                }
            }

            if errors.is_empty() {
                Ok(())
            } else {
                Err(NimbusError::Aggregate { errors })
            }
        })
    }

    /// Fetch several records of one class with a single query.
    pub fn fetch_all(&self, records: Vec<Record>, options: RequestOptions) -> Deferred<Vec<Record>> {
        let client = self.clone();
        Deferred::spawn(async move { client.fetch_matching(records, |_| true, &options).await })
    }

    /// Like [`Client::fetch_all`], but only for records whose data is not loaded.
    pub fn fetch_all_if_needed(
        &self,
        records: Vec<Record>,
        options: RequestOptions,
    ) -> Deferred<Vec<Record>> {
        let client = self.clone();
        Deferred::spawn(async move {
            client
                .fetch_matching(records, |r| !r.is_data_available(), &options)
                .await
        })
    }

    async fn fetch_matching(
        &self,
        mut records: Vec<Record>,
        needs_fetch: impl Fn(&Record) -> bool,
        options: &RequestOptions,
    ) -> Result<Vec<Record>, NimbusError> {
        let targets: Vec<usize> = (0..records.len())
            .filter(|&i| needs_fetch(&records[i]))
            .collect();
        let Some(&first) = targets.first() else {
            return Ok(records);
        };

        let kind = records[first].kind().clone();
        let mut ids = Vec::with_capacity(targets.len());
        for &i in &targets {
            if records[i].kind() != &kind {
                return Err(NimbusError::invalid(
                    ErrorCode::InvalidClassName,
                    "all records in fetch_all must be of the same class",
                ));
            }
            let id = records[i].id().ok_or_else(|| {
                NimbusError::invalid(ErrorCode::MissingObjectId, "all records must have an id")
            })?;
            let id = Value::from(id);
            if !ids.contains(&id) {
                ids.push(id);
            }
        }

        let mut query = Query::new(kind);
        query.contained_in("objectId", ids.clone()).limit(ids.len());
        let found = self.find_records(&query, options).await?;
        let by_id: HashMap<String, Record> = found
            .into_iter()
            .filter_map(|r| r.id().map(str::to_string).map(|id| (id, r)))
            .collect();

        for &i in &targets {
            let id = records[i].id().unwrap_or_default().to_string();
            let fetched = by_id.get(&id).cloned().ok_or_else(|| NimbusError::Service {
                code: ErrorCode::ObjectNotFound,
                message: format!("object {id} not found"),
            })?;
            records[i].commit_fetch(fetched);
        }
        Ok(records)
    }

    /// Run a query and decode every result.
    pub(crate) async fn find_records(
        &self,
        query: &Query,
        options: &RequestOptions,
    ) -> Result<Vec<Record>, NimbusError> {
        #[derive(serde::Deserialize)]
        struct FindResponse {
            results: Vec<Map<String, Value>>,
        }

        let path = query.kind().collection_path();
        let response: FindResponse = self
            .request(Method::GET, &path, &query.to_params(), Body::Empty, options)
            .await?;

        response
            .results
            .into_iter()
            .map(|data| {
                let kind = match data.get("className").and_then(Value::as_str) {
                    Some(class_name) => class_name.into(),
                    None => query.kind().clone(),
                };
                Record::from_server(kind, data)
            })
            .collect()
    }

    /// Run a query in count mode.
    pub(crate) async fn count_records(
        &self,
        query: &Query,
        options: &RequestOptions,
    ) -> Result<u64, NimbusError> {
        #[derive(serde::Deserialize)]
        struct CountResponse {
            count: u64,
        }

        let mut params = query.to_params();
        params.retain(|(k, _)| k != "limit" && k != "skip" && k != "order");
        params.push(("count".to_string(), "1".to_string()));
        params.push(("limit".to_string(), "0".to_string()));

        let path = query.kind().collection_path();
        let response: CountResponse = self
            .request(Method::GET, &path, &params, Body::Empty, options)
            .await?;
        Ok(response.count)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    async fn test_client(server: &MockServer) -> Client {
        let config = ClientConfig::builder("app-id")
            .client_key("js-key")
            .master_key("master")
            .server_url(format!("{}/parse", server.uri()))
            .build();
        Client::new(config).unwrap()
    }

    #[test]
    fn test_client_creation() {
        let client = Client::new(ClientConfig::builder("app").build()).unwrap();
        assert_eq!(client.config().application_id(), "app");
    }

    #[test]
    fn test_invalid_server_url() {
        let config = ClientConfig::builder("app").server_url("not a url").build();
        let err = Client::new(config).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotInitialized);
    }

    #[tokio::test]
    async fn test_batch_path_includes_mount() {
        let server = MockServer::start().await;
        let client = test_client(&server).await;
        assert_eq!(client.batch_path("classes/A"), "/parse/classes/A");
    }

    #[tokio::test]
    async fn test_save_creates_record_with_headers() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/parse/classes/GameScore"))
            .and(header("X-Parse-Application-Id", "app-id"))
            .and(header("X-Parse-JavaScript-Key", "js-key"))
            .and(body_json(json!({"score": 1337})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "objectId": "abc",
                "createdAt": "2024-01-01T00:00:00.000Z",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server).await;
        let mut record = Record::new("GameScore");
        record.set("score", 1337);

        let saved = client
            .save(record, RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(saved.id(), Some("abc"));
        assert!(!saved.is_dirty());
    }

    #[tokio::test]
    async fn test_save_updates_existing_record() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/parse/classes/GameScore/abc"))
            .and(body_json(json!({"score": {"__op": "Increment", "amount": 1}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "updatedAt": "2024-01-02T00:00:00.000Z",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server).await;
        let mut record = Record::with_id("GameScore", "abc");
        record.increment("score", 1).unwrap();

        let saved = client
            .save(record, RequestOptions::default())
            .await
            .unwrap();
        assert!(saved.existed());
        assert!(saved.updated_at().is_some());
    }

    #[tokio::test]
    async fn test_master_key_header_only_when_requested() {
        let server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/parse/classes/GameScore/abc"))
            .and(header("X-Parse-Master-Key", "master"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server).await;
        client
            .destroy(Record::with_id("GameScore", "abc"), RequestOptions::master())
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        assert!(requests[0].headers.get("X-Parse-Master-Key").is_some());
    }

    #[tokio::test]
    async fn test_master_key_missing_from_config() {
        let server = MockServer::start().await;
        let config = ClientConfig::builder("app")
            .server_url(server.uri())
            .build();
        let client = Client::new(config).unwrap();

        let err = client
            .fetch(Record::with_id("A", "1"), RequestOptions::master())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotInitialized);
    }

    #[tokio::test]
    async fn test_session_token_override() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/parse/classes/Note/n1"))
            .and(header("X-Parse-Session-Token", "r:override"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "objectId": "n1",
                "body": "hello",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server).await;
        let record = client
            .fetch(
                Record::with_id("Note", "n1"),
                RequestOptions::with_session_token("r:override"),
            )
            .await
            .unwrap();
        assert_eq!(record.get("body"), Some(&json!("hello")));
        assert!(record.is_data_available());
    }

    #[tokio::test]
    async fn test_service_error_is_surfaced() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/parse/classes/Note/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "code": 101,
                "error": "Object not found.",
            })))
            .mount(&server)
            .await;

        let client = test_client(&server).await;
        let err = client
            .fetch(Record::with_id("Note", "missing"), RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ObjectNotFound);
        assert_eq!(err.message(), "Object not found.");
    }

    #[tokio::test]
    async fn test_rate_limited() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/parse/classes/Note/n1"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "12"))
            .mount(&server)
            .await;

        let client = test_client(&server).await;
        let err = client
            .fetch(Record::with_id("Note", "n1"), RequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NimbusError::RateLimited {
                retry_after_secs: Some(12)
            }
        ));
    }

    #[tokio::test]
    async fn test_connection_failure_maps_to_code() {
        let config = ClientConfig::builder("app")
            .server_url("http://127.0.0.1:9")
            .build();
        let client = Client::new(config).unwrap();
        let err = client
            .fetch(Record::with_id("Note", "n1"), RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConnectionFailed);
    }

    #[tokio::test]
    async fn test_destroy_all_aggregates_failures() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/parse/batch"))
            .and(body_json(json!({
                "requests": [
                    {"method": "DELETE", "path": "/parse/classes/Note/a"},
                    {"method": "DELETE", "path": "/parse/classes/Note/b"},
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"success": {}},
                {"error": {"code": 101, "error": "Object not found."}},
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server).await;
        let err = client
            .destroy_all(
                vec![
                    Record::with_id("Note", "a"),
                    Record::with_id("Note", "b"),
                    Record::new("Note"),
                ],
                RequestOptions::default(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::AggregateError);
        match err {
            NimbusError::Aggregate { errors } => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].code(), ErrorCode::ObjectNotFound);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_save_all_uses_one_batch() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/parse/batch"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"success": {"objectId": "n1", "createdAt": "2024-01-01T00:00:00.000Z"}},
                {"success": {"updatedAt": "2024-01-01T00:00:00.000Z"}},
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server).await;
        let mut fresh = Record::new("Note");
        fresh.set("body", "new");
        let mut existing = Record::with_id("Note", "n0");
        existing.set("body", "edited");

        let saved = client
            .save_all(vec![fresh, existing], RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(saved[0].id(), Some("n1"));
        assert!(!saved[1].is_dirty());

        let requests = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["requests"][0]["method"], "POST");
        assert_eq!(body["requests"][0]["path"], "/parse/classes/Note");
        assert_eq!(body["requests"][1]["method"], "PUT");
        assert_eq!(body["requests"][1]["path"], "/parse/classes/Note/n0");
    }

    #[tokio::test]
    async fn test_fetch_all_if_needed_skips_loaded_records() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/parse/classes/Note"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"objectId": "b", "body": "fetched"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server).await;
        let loaded = Record::from_server(
            "Note",
            match json!({"objectId": "a", "body": "loaded"}) {
                Value::Object(map) => map,
                _ => unreachable!(),
            },
        )
        .unwrap();

        let records = client
            .fetch_all_if_needed(
                vec![loaded, Record::with_id("Note", "b")],
                RequestOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(records[0].get("body"), Some(&json!("loaded")));
        assert_eq!(records[1].get("body"), Some(&json!("fetched")));

        let requests = server.received_requests().await.unwrap();
        let params: HashMap<String, String> = requests[0].url.query_pairs().into_owned().collect();
        let filter: Value = serde_json::from_str(&params["where"]).unwrap();
        assert_eq!(filter, json!({"objectId": {"$in": ["b"]}}));
    }

    #[tokio::test]
    async fn test_fetch_all_repeated_id() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/parse/classes/Note"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"objectId": "a", "body": "fetched"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server).await;
        let records = client
            .fetch_all(
                vec![Record::with_id("Note", "a"), Record::with_id("Note", "a")],
                RequestOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("body"), Some(&json!("fetched")));
        assert_eq!(records[1].get("body"), Some(&json!("fetched")));

        let requests = server.received_requests().await.unwrap();
        let params: HashMap<String, String> = requests[0].url.query_pairs().into_owned().collect();
        let filter: Value = serde_json::from_str(&params["where"]).unwrap();
        assert_eq!(filter, json!({"objectId": {"$in": ["a"]}}));
        assert_eq!(params["limit"], "1");
    }

    #[tokio::test]
    async fn test_events_wait_and_silent() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/parse/classes/Note"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "objectId": "n1",
                "createdAt": "2024-01-01T00:00:00.000Z",
            })))
            .mount(&server)
            .await;

        let client = test_client(&server).await;
        let mut events = client.events();

        let mut note = Record::new("Note");
        note.set("body", "quiet");
        client
            .save(note, RequestOptions::default().silent(true))
            .await
            .unwrap();
        assert!(events.try_recv().is_err());

        let mut note = Record::new("Note");
        note.set("body", "confirmed");
        client
            .save(note, RequestOptions::default().wait(true))
            .await
            .unwrap();
        let event = events.try_recv().unwrap();
        assert_eq!(event.kind, RecordEventKind::Saved);
        assert_eq!(event.object_id.as_deref(), Some("n1"));

        let mut note = Record::new("Note");
        note.set("body", "optimistic");
        client.save(note, RequestOptions::default()).await.unwrap();
        let event = events.try_recv().unwrap();
        assert_eq!(event.object_id, None);
    }
}
