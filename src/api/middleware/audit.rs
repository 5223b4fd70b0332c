//! Request interceptor and audit entry points.
//!
//! Every non-excluded request produces exactly one automatic audit event.
//! The response path does O(1) bookkeeping only: classification, redaction
//! and the store append run in a spawned continuation after the response is
//! on its way. Nothing in here may fail a request — every audit error ends
//! at a `tracing::warn!`.
//!
//! A second, manual entry point ([`log_audit`]) exists for handlers that
//! need to attach pre-mutation snapshots or override classification. The
//! two paths are not deduplicated: a handler that logs manually should
//! expect the automatic record for the same request as well.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{ConnectInfo, FromRequestParts, RawPathParams, Request, State},
    http::{header, request::Parts, HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::audit::classifier::{self, EntityRef};
use crate::audit::redaction;
use crate::config::AuditConfig;
use crate::error::AuditFailureMessage;
use crate::models::audit_event::{EventStatus, EventType, NewAuditEvent};
use crate::services::audit_service::AuditSink;

use super::identity::Identity;

/// Header carrying the per-request correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Ceiling on concurrent store appends. A burst beyond this queues in the
/// continuation tasks instead of exhausting the write pool.
const MAX_APPENDS_IN_FLIGHT: usize = 64;

/// Extension that holds the request id for the current request.
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub Uuid);

/// Pre-mutation entity snapshot captured by [`capture_old_state`].
#[derive(Debug, Clone)]
pub struct OldState(pub Value);

/// State handed to the interceptor once at construction.
#[derive(Clone)]
pub struct AuditLayerState {
    pub config: Arc<AuditConfig>,
    pub sink: Arc<dyn AuditSink>,
    permits: Arc<Semaphore>,
}

impl AuditLayerState {
    pub fn new(config: Arc<AuditConfig>, sink: Arc<dyn AuditSink>) -> Self {
        Self {
            config,
            sink,
            permits: Arc::new(Semaphore::new(MAX_APPENDS_IN_FLIGHT)),
        }
    }
}

/// Request facts moved into the deferred continuation.
struct RequestSnapshot {
    method: String,
    path: String,
    endpoint: String,
    identity: Option<Identity>,
    ip_address: Option<String>,
    user_agent: Option<String>,
    session_id: Option<String>,
    request_id: Uuid,
    query_params: Option<Value>,
    content_type: Option<String>,
    accept: Option<String>,
    body_bytes: Option<Bytes>,
}

/// The audit interceptor.
///
/// Applied around the whole router; skips excluded paths/methods entirely,
/// observes the final status code and failure message, and dispatches one
/// event per request to the sink without delaying the response.
pub async fn audit_middleware(
    State(state): State<AuditLayerState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let method = request.method().as_str().to_string();

    let excluded_path = state
        .config
        .exclude_paths
        .iter()
        .any(|prefix| path.starts_with(prefix.as_str()));
    let excluded_method = state
        .config
        .exclude_methods
        .iter()
        .any(|m| m.eq_ignore_ascii_case(&method));
    if excluded_path || excluded_method {
        return next.run(request).await;
    }

    let (mut request, snapshot) = observe_request(request, &state.config, method, path).await;
    request.extensions_mut().insert(RequestId(snapshot.request_id));
    let request_id = snapshot.request_id;

    let started = Instant::now();
    let mut response = next.run(request).await;

    let status_code = response.status().as_u16();
    let duration_ms = started.elapsed().as_millis().min(i32::MAX as u128) as i32;
    let failure_message = response
        .extensions()
        .get::<AuditFailureMessage>()
        .map(|m| m.0.clone());
    // An inner auth layer may have attached a fresher identity to the
    // response than what the request carried on the way in.
    let identity_override = response.extensions().get::<Identity>().cloned();

    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    let task_state = state.clone();
    tokio::spawn(async move {
        let _permit = task_state.permits.clone().acquire_owned().await;
        if let Err(error) = record_request(
            &task_state,
            snapshot,
            identity_override,
            status_code,
            failure_message,
            duration_ms,
        )
        .await
        {
            tracing::warn!(%error, "Audit event dropped");
        }
    });

    response
}

/// Capture everything the continuation needs, buffering the body only for
/// mutating JSON requests that declare an acceptable size.
async fn observe_request(
    request: Request,
    config: &AuditConfig,
    method: String,
    path: String,
) -> (Request, RequestSnapshot) {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);

    let endpoint = request
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| path.clone());
    let query_params = if config.log_query {
        parse_query(request.uri().query())
    } else {
        None
    };

    let headers = request.headers();
    let identity = request.extensions().get::<Identity>().cloned();
    let session_id = session_id(identity.as_ref(), headers);
    let ip_address = client_ip(headers, request.extensions().get::<ConnectInfo<std::net::SocketAddr>>());
    let user_agent = header_value(headers, header::USER_AGENT.as_str());
    let content_type = header_value(headers, header::CONTENT_TYPE.as_str());
    let accept = header_value(headers, header::ACCEPT.as_str());

    let capture_body = config.log_body
        && matches!(method.as_str(), "POST" | "PUT" | "PATCH" | "DELETE")
        && content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("application/json"))
        && headers
            .get(header::CONTENT_LENGTH)
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.parse::<usize>().ok())
            .is_some_and(|len| len > 0 && len <= config.max_body_bytes);

    let (request, body_bytes) = if capture_body {
        let (parts, body) = request.into_parts();
        match to_bytes(body, usize::MAX).await {
            Ok(bytes) => {
                let request = Request::from_parts(parts, Body::from(bytes.clone()));
                (request, Some(bytes))
            }
            Err(error) => {
                tracing::warn!(%error, "Failed to buffer request body for audit");
                (Request::from_parts(parts, Body::empty()), None)
            }
        }
    } else {
        (request, None)
    };

    let snapshot = RequestSnapshot {
        method,
        path,
        endpoint,
        identity,
        ip_address,
        user_agent,
        session_id,
        request_id,
        query_params,
        content_type,
        accept,
        body_bytes,
    };

    (request, snapshot)
}

/// Deferred continuation: classify, redact, assemble, append.
async fn record_request(
    state: &AuditLayerState,
    snapshot: RequestSnapshot,
    identity_override: Option<Identity>,
    status_code: u16,
    failure_message: Option<String>,
    duration_ms: i32,
) -> crate::error::Result<()> {
    let identity = identity_override
        .or(snapshot.identity)
        .unwrap_or_default();

    let entity = classifier::classify_entity(
        &snapshot.path,
        classifier::extract_id_segment(&snapshot.path),
    );
    let event_type = classifier::classify_event_type(&snapshot.method, &snapshot.path);

    let body: Option<Value> = snapshot
        .body_bytes
        .as_deref()
        .and_then(|bytes| serde_json::from_slice(bytes).ok());
    let action = classifier::describe_action(
        &snapshot.method,
        &snapshot.path,
        &entity,
        event_type,
        body.as_ref(),
    );

    let new_values = redaction::redact(body.as_ref(), &state.config.sensitive_fields)
        .filter(|v| v.as_object().map_or(true, |m| !m.is_empty()));

    let status = EventStatus::from_http(status_code);
    let error_message = match status {
        EventStatus::Failure => failure_message.clone(),
        EventStatus::Success => None,
    };

    let metadata = build_metadata(
        state.config.as_ref(),
        snapshot.query_params.as_ref(),
        snapshot.content_type.as_deref(),
        snapshot.accept.as_deref(),
        status_code,
        failure_message.as_deref(),
    );

    let event = NewAuditEvent {
        event_type,
        entity_type: entity.entity_type,
        entity_id: entity.entity_id,
        user_id: identity.user_id,
        user_email: identity.email,
        user_role: identity.role,
        impersonated_by: identity.impersonated_by,
        action,
        method: Some(snapshot.method),
        endpoint: Some(snapshot.endpoint),
        ip_address: snapshot.ip_address,
        user_agent: snapshot.user_agent,
        old_values: None,
        new_values,
        changed_fields: None,
        status,
        error_message,
        duration_ms: Some(duration_ms),
        metadata: Some(metadata),
        session_id: snapshot.session_id,
        request_id: Some(snapshot.request_id),
    };

    state.sink.append(event).await
}

fn build_metadata(
    config: &AuditConfig,
    query_params: Option<&Value>,
    content_type: Option<&str>,
    accept: Option<&str>,
    status_code: u16,
    failure_message: Option<&str>,
) -> Value {
    let query = query_params
        .and_then(|q| redaction::redact(Some(q), &config.sensitive_fields))
        .unwrap_or(Value::Null);

    let response = if config.log_response {
        json!({
            "success": status_code < 400,
            "message": failure_message,
        })
    } else {
        Value::Null
    };

    json!({
        "query": query,
        "headers": {
            "content-type": content_type,
            "accept": accept,
        },
        "response": response,
    })
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
}

/// Client address: proxy headers first, then the socket.
fn client_ip(
    headers: &HeaderMap,
    connect_info: Option<&ConnectInfo<std::net::SocketAddr>>,
) -> Option<String> {
    header_value(headers, "x-forwarded-for")
        .and_then(|raw| raw.split(',').next().map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty())
        .or_else(|| header_value(headers, "x-real-ip"))
        .or_else(|| connect_info.map(|ConnectInfo(addr)| addr.ip().to_string()))
}

/// Session correlation: the identity layer's session when present, else a
/// bearer-token prefix.
fn session_id(identity: Option<&Identity>, headers: &HeaderMap) -> Option<String> {
    if let Some(session) = identity.and_then(|i| i.session_id.clone()) {
        return Some(session);
    }

    header_value(headers, header::AUTHORIZATION.as_str())
        .and_then(|auth| auth.strip_prefix("Bearer ").map(String::from))
        .map(|token| token.chars().take(20).collect())
}

fn parse_query(raw: Option<&str>) -> Option<Value> {
    let raw = raw?;
    if raw.is_empty() {
        return None;
    }

    let mut map = Map::new();
    for pair in raw.split('&') {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next().unwrap_or_default();
        if key.is_empty() {
            continue;
        }
        let value = parts.next().unwrap_or_default();
        map.insert(key.to_string(), Value::String(value.to_string()));
    }

    if map.is_empty() {
        None
    } else {
        Some(Value::Object(map))
    }
}

// ---------------------------------------------------------------------------
// Manual logging path
// ---------------------------------------------------------------------------

/// Request facts for the manual logging path, extractable in any handler.
#[derive(Debug, Clone, Default)]
pub struct RequestAuditInfo {
    pub method: String,
    pub path: String,
    pub endpoint: String,
    pub id_param: Option<String>,
    pub identity: Identity,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
    pub request_id: Option<Uuid>,
    pub old_state: Option<Value>,
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestAuditInfo
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let id_param = RawPathParams::from_request_parts(parts, state)
            .await
            .ok()
            .and_then(|params| {
                params
                    .iter()
                    .find(|(name, _)| *name == "id")
                    .map(|(_, value)| value.to_string())
            });

        let identity = parts
            .extensions
            .get::<Identity>()
            .cloned()
            .unwrap_or_default();
        let session_id = session_id(Some(&identity), &parts.headers);

        Ok(Self {
            method: parts.method.as_str().to_string(),
            path: parts.uri.path().to_string(),
            endpoint: parts
                .uri
                .path_and_query()
                .map(|pq| pq.to_string())
                .unwrap_or_else(|| parts.uri.path().to_string()),
            id_param,
            ip_address: client_ip(
                &parts.headers,
                parts.extensions.get::<ConnectInfo<std::net::SocketAddr>>(),
            ),
            user_agent: header_value(&parts.headers, header::USER_AGENT.as_str()),
            session_id,
            request_id: parts.extensions.get::<RequestId>().map(|id| id.0),
            old_state: parts.extensions.get::<OldState>().map(|s| s.0.clone()),
            identity,
        })
    }
}

/// Overrides for a manually logged event. Unset fields fall back to the
/// automatic classification of the request.
#[derive(Debug, Clone, Default)]
pub struct ManualAudit {
    pub event_type: Option<EventType>,
    pub entity_type: Option<String>,
    pub entity_id: Option<i64>,
    pub action: Option<String>,
    pub old_values: Option<Value>,
    pub new_values: Option<Value>,
    pub changed_fields: Option<Vec<String>>,
    pub status: Option<EventStatus>,
    pub error_message: Option<String>,
    pub duration_ms: Option<i32>,
    pub metadata: Option<Value>,
}

/// Record one event from a handler that needs more control than the
/// automatic path gives it — typically to attach a pre-mutation snapshot.
///
/// Shares the interceptor's classifier and redactor. Persistence errors are
/// logged and swallowed, never surfaced to the caller. Note the automatic
/// interceptor also records the same request; the two records are not
/// deduplicated.
pub async fn log_audit(state: &AuditLayerState, info: &RequestAuditInfo, custom: ManualAudit) {
    let entity = classifier::classify_entity(&info.path, info.id_param.as_deref());
    let event_type = custom
        .event_type
        .unwrap_or_else(|| classifier::classify_event_type(&info.method, &info.path));

    let old_values = custom.old_values.or_else(|| info.old_state.clone());
    let new_values = custom.new_values;

    // Diff runs on the raw snapshots; redaction applies on the way into
    // the record.
    let changed_fields = custom.changed_fields.unwrap_or_else(|| {
        redaction::diff_fields(old_values.as_ref(), new_values.as_ref())
    });
    let changed_fields = if changed_fields.is_empty() {
        None
    } else {
        Some(changed_fields)
    };

    let entity_ref = EntityRef {
        entity_type: custom.entity_type.clone().or(entity.entity_type),
        entity_id: custom.entity_id.or(entity.entity_id),
    };
    let action = custom.action.unwrap_or_else(|| {
        classifier::describe_action(&info.method, &info.path, &entity_ref, event_type, None)
    });

    let event = NewAuditEvent {
        event_type,
        entity_type: entity_ref.entity_type,
        entity_id: entity_ref.entity_id,
        user_id: info.identity.user_id,
        user_email: info.identity.email.clone(),
        user_role: info.identity.role.clone(),
        impersonated_by: info.identity.impersonated_by,
        action,
        method: Some(info.method.clone()),
        endpoint: Some(info.endpoint.clone()),
        ip_address: info.ip_address.clone(),
        user_agent: info.user_agent.clone(),
        old_values: redaction::redact(old_values.as_ref(), &state.config.sensitive_fields),
        new_values: redaction::redact(new_values.as_ref(), &state.config.sensitive_fields),
        changed_fields,
        status: custom.status.unwrap_or(EventStatus::Success),
        error_message: custom.error_message,
        duration_ms: custom.duration_ms,
        metadata: custom.metadata,
        session_id: info.session_id.clone(),
        request_id: Some(info.request_id.unwrap_or_else(Uuid::new_v4)),
    };

    if let Err(error) = state.sink.append(event).await {
        tracing::warn!(%error, "Manual audit event dropped");
    }
}

/// Record an access-control or authentication anomaly raised by business
/// logic. Carries no entity by convention and flows through the same sink.
pub async fn log_security_event(
    state: &AuditLayerState,
    info: &RequestAuditInfo,
    action: impl Into<String>,
    status: EventStatus,
    error_message: Option<String>,
    metadata: Option<Value>,
) {
    let mut event = NewAuditEvent::new(EventType::Security, action);
    event.user_id = info.identity.user_id;
    event.user_email = info.identity.email.clone();
    event.user_role = info.identity.role.clone();
    event.impersonated_by = info.identity.impersonated_by;
    event.method = Some(info.method.clone());
    event.endpoint = Some(info.endpoint.clone());
    event.ip_address = info.ip_address.clone();
    event.user_agent = info.user_agent.clone();
    event.status = status;
    event.error_message = error_message;
    event.metadata = metadata;
    event.session_id = info.session_id.clone();
    event.request_id = Some(info.request_id.unwrap_or_else(Uuid::new_v4));

    if let Err(error) = state.sink.append(event).await {
        tracing::warn!(%error, "Security audit event dropped");
    }
}

// ---------------------------------------------------------------------------
// Pre-state capture
// ---------------------------------------------------------------------------

/// Accessor for the current stored state of one entity kind.
#[async_trait]
pub trait EntityFetcher: Send + Sync {
    async fn fetch_by_id(&self, id: i64) -> crate::error::Result<Option<Value>>;
}

/// Route middleware that snapshots an entity before a mutating handler
/// runs, for later diffing by a [`log_audit`] call. Fetch failures are
/// swallowed; the handler proceeds without an [`OldState`].
pub async fn capture_old_state(
    State(fetcher): State<Arc<dyn EntityFetcher>>,
    params: RawPathParams,
    mut request: Request,
    next: Next,
) -> Response {
    let id = params
        .iter()
        .find(|(name, _)| *name == "id")
        .and_then(|(_, value)| value.parse::<i64>().ok());

    if let Some(id) = id {
        match fetcher.fetch_by_id(id).await {
            Ok(Some(state)) => {
                request.extensions_mut().insert(OldState(state));
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(%error, id, "Failed to capture pre-mutation state");
            }
        }
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use axum::{
        http::{Request as HttpRequest, StatusCode},
        middleware,
        routing::{get, post, put},
        Router,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tower::ServiceExt;

    #[derive(Default)]
    struct MemorySink {
        events: Mutex<Vec<NewAuditEvent>>,
        attempts: AtomicUsize,
        fail: AtomicBool,
    }

    impl MemorySink {
        fn events(&self) -> Vec<NewAuditEvent> {
            self.events.lock().unwrap().clone()
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AuditSink for MemorySink {
        async fn append(&self, event: NewAuditEvent) -> crate::error::Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(AppError::Database("store unavailable".into()));
            }
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    fn layer_state(sink: Arc<MemorySink>, config: AuditConfig) -> AuditLayerState {
        AuditLayerState::new(Arc::new(config), sink)
    }

    fn test_identity() -> Identity {
        Identity {
            user_id: Some(1),
            email: Some("admin@club.es".into()),
            role: Some("ADMIN".into()),
            impersonated_by: None,
            session_id: None,
        }
    }

    async fn rejecting_handler() -> crate::error::Result<&'static str> {
        Err(AppError::Validation("importe is required".into()))
    }

    /// Router with the interceptor applied and a test layer injecting the
    /// actor identity, standing in for the platform's session layer.
    fn app(state: AuditLayerState, identity: Option<Identity>) -> Router {
        let router = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route(
                "/api/djs",
                post(|| async { StatusCode::CREATED }).get(|| async { "[]" }),
            )
            .route("/api/eventos/:id", put(|| async { "{}" }))
            .route("/api/payments", post(rejecting_handler))
            .layer(middleware::from_fn_with_state(state, audit_middleware));

        // Outermost layer runs first, so the identity is visible on the way in.
        router.layer(middleware::from_fn(move |mut request: Request, next: Next| {
            let identity = identity.clone();
            async move {
                if let Some(identity) = identity {
                    request.extensions_mut().insert(identity);
                }
                next.run(request).await
            }
        }))
    }

    async fn wait_for_attempts(sink: &MemorySink, n: usize) {
        for _ in 0..200 {
            if sink.attempts() >= n {
                // small grace period to catch anything extra
                tokio::time::sleep(Duration::from_millis(20)).await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} append attempts, saw {}", sink.attempts());
    }

    fn json_request(method: &str, uri: &str, body: Value) -> HttpRequest<Body> {
        let bytes = serde_json::to_vec(&body).unwrap();
        HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_LENGTH, bytes.len())
            .body(Body::from(bytes))
            .unwrap()
    }

    #[tokio::test]
    async fn test_excluded_path_produces_no_event() {
        let sink = Arc::new(MemorySink::default());
        let app = app(layer_state(sink.clone(), AuditConfig::default()), None);

        let response = app
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.attempts(), 0);
    }

    #[tokio::test]
    async fn test_excluded_method_produces_no_event() {
        let sink = Arc::new(MemorySink::default());
        let config = AuditConfig {
            exclude_methods: vec!["GET".into()],
            ..Default::default()
        };
        let app = app(layer_state(sink.clone(), config), None);

        app.oneshot(HttpRequest::get("/api/djs").body(Body::empty()).unwrap())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.attempts(), 0);
    }

    #[tokio::test]
    async fn test_create_event_is_classified_and_redacted() {
        let sink = Arc::new(MemorySink::default());
        let app = app(
            layer_state(sink.clone(), AuditConfig::default()),
            Some(test_identity()),
        );

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/djs",
                json!({"nombre": "Test DJ", "password": "hunter2"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        wait_for_attempts(&sink, 1).await;
        let events = sink.events();
        assert_eq!(events.len(), 1);

        let event = &events[0];
        assert_eq!(event.event_type, EventType::Create);
        assert_eq!(event.entity_type.as_deref(), Some("dj"));
        assert_eq!(event.action, "Created dj: Test DJ");
        assert_eq!(event.status, EventStatus::Success);
        assert_eq!(event.user_id, Some(1));
        assert_eq!(event.user_email.as_deref(), Some("admin@club.es"));
        assert_eq!(event.user_role.as_deref(), Some("ADMIN"));
        assert_eq!(event.method.as_deref(), Some("POST"));
        assert_eq!(event.endpoint.as_deref(), Some("/api/djs"));
        assert!(event.request_id.is_some());
        assert!(event.duration_ms.is_some());

        let new_values = event.new_values.as_ref().unwrap();
        assert_eq!(new_values["nombre"], "Test DJ");
        assert_eq!(new_values["password"], redaction::REDACTED_MARKER);
    }

    #[tokio::test]
    async fn test_view_event_has_no_body_snapshot() {
        let sink = Arc::new(MemorySink::default());
        let app = app(layer_state(sink.clone(), AuditConfig::default()), None);

        app.oneshot(HttpRequest::get("/api/djs").body(Body::empty()).unwrap())
            .await
            .unwrap();

        wait_for_attempts(&sink, 1).await;
        let event = &sink.events()[0];
        assert_eq!(event.event_type, EventType::View);
        assert_eq!(event.action, "Listed dj");
        assert!(event.new_values.is_none());
        // anonymous request
        assert!(event.user_id.is_none());
    }

    #[tokio::test]
    async fn test_failed_request_records_failure_and_message() {
        let sink = Arc::new(MemorySink::default());
        let app = app(layer_state(sink.clone(), AuditConfig::default()), None);

        let response = app
            .oneshot(json_request("POST", "/api/payments", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        wait_for_attempts(&sink, 1).await;
        let event = &sink.events()[0];
        assert_eq!(event.status, EventStatus::Failure);
        assert_eq!(event.error_message.as_deref(), Some("importe is required"));
    }

    #[tokio::test]
    async fn test_sink_failure_never_reaches_the_client_and_never_retries() {
        let sink = Arc::new(MemorySink::default());
        sink.fail.store(true, Ordering::SeqCst);
        let app = app(layer_state(sink.clone(), AuditConfig::default()), None);

        let response = app
            .oneshot(json_request("POST", "/api/djs", json!({"nombre": "X"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        wait_for_attempts(&sink, 1).await;
        assert_eq!(sink.attempts(), 1);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_request_id_is_reused_and_echoed() {
        let sink = Arc::new(MemorySink::default());
        let app = app(layer_state(sink.clone(), AuditConfig::default()), None);
        let upstream = Uuid::new_v4();

        let response = app
            .oneshot(
                HttpRequest::get("/api/djs")
                    .header(REQUEST_ID_HEADER, upstream.to_string())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let echoed = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .unwrap()
            .to_string();
        assert_eq!(echoed, upstream.to_string());

        wait_for_attempts(&sink, 1).await;
        assert_eq!(sink.events()[0].request_id, Some(upstream));
    }

    #[tokio::test]
    async fn test_oversized_body_is_not_captured() {
        let sink = Arc::new(MemorySink::default());
        let config = AuditConfig {
            max_body_bytes: 16,
            ..Default::default()
        };
        let app = app(layer_state(sink.clone(), config), None);

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/djs",
                json!({"nombre": "a very long name well past the cap"}),
            ))
            .await
            .unwrap();
        // the request itself is untouched
        assert_eq!(response.status(), StatusCode::CREATED);

        wait_for_attempts(&sink, 1).await;
        assert!(sink.events()[0].new_values.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_requests_each_produce_one_event() {
        let sink = Arc::new(MemorySink::default());
        let app = app(layer_state(sink.clone(), AuditConfig::default()), None);

        let mut handles = Vec::new();
        for i in 0..20 {
            let app = app.clone();
            handles.push(tokio::spawn(async move {
                app.oneshot(json_request(
                    "POST",
                    "/api/djs",
                    json!({"nombre": format!("DJ {i}")}),
                ))
                .await
                .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().status(), StatusCode::CREATED);
        }

        wait_for_attempts(&sink, 20).await;
        let events = sink.events();
        assert_eq!(events.len(), 20);
        assert!(events
            .iter()
            .all(|e| e.event_type == EventType::Create && e.entity_type.as_deref() == Some("dj")));
    }

    #[tokio::test]
    async fn test_manual_log_diffs_old_and_new_state() {
        let sink = Arc::new(MemorySink::default());
        let state = layer_state(sink.clone(), AuditConfig::default());

        let info = RequestAuditInfo {
            method: "PUT".into(),
            path: "/api/eventos/42".into(),
            endpoint: "/api/eventos/42".into(),
            id_param: Some("42".into()),
            identity: test_identity(),
            old_state: Some(json!({"cache_total": 10000})),
            ..Default::default()
        };

        log_audit(
            &state,
            &info,
            ManualAudit {
                new_values: Some(json!({"cache_total": 12000})),
                ..Default::default()
            },
        )
        .await;

        let events = sink.events();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.event_type, EventType::Update);
        assert_eq!(event.entity_type.as_deref(), Some("evento"));
        assert_eq!(event.entity_id, Some(42));
        assert_eq!(event.action, "Updated evento #42");
        assert_eq!(event.changed_fields.as_deref(), Some(&["cache_total".to_string()][..]));
        assert_eq!(event.old_values.as_ref().unwrap()["cache_total"], 10000);
        assert_eq!(event.new_values.as_ref().unwrap()["cache_total"], 12000);
        assert!(event.request_id.is_some());
    }

    #[tokio::test]
    async fn test_manual_log_redacts_snapshots_after_diffing() {
        let sink = Arc::new(MemorySink::default());
        let state = layer_state(sink.clone(), AuditConfig::default());

        let info = RequestAuditInfo {
            method: "PUT".into(),
            path: "/api/users/3".into(),
            endpoint: "/api/users/3".into(),
            id_param: Some("3".into()),
            ..Default::default()
        };

        log_audit(
            &state,
            &info,
            ManualAudit {
                old_values: Some(json!({"password": "old-secret", "email": "a@club.es"})),
                new_values: Some(json!({"password": "new-secret", "email": "a@club.es"})),
                ..Default::default()
            },
        )
        .await;

        let event = &sink.events()[0];
        // the change was detected on the raw values...
        assert_eq!(event.changed_fields.as_deref(), Some(&["password".to_string()][..]));
        // ...but neither secret reached the record
        assert_eq!(
            event.old_values.as_ref().unwrap()["password"],
            redaction::REDACTED_MARKER
        );
        assert_eq!(
            event.new_values.as_ref().unwrap()["password"],
            redaction::REDACTED_MARKER
        );
    }

    #[tokio::test]
    async fn test_security_event_carries_no_entity() {
        let sink = Arc::new(MemorySink::default());
        let state = layer_state(sink.clone(), AuditConfig::default());

        let info = RequestAuditInfo {
            method: "POST".into(),
            path: "/api/auth/login".into(),
            endpoint: "/api/auth/login".into(),
            identity: Identity::default(),
            ip_address: Some("203.0.113.9".into()),
            ..Default::default()
        };

        log_security_event(
            &state,
            &info,
            "Repeated login failures",
            EventStatus::Failure,
            Some("5 failed attempts".into()),
            None,
        )
        .await;

        let event = &sink.events()[0];
        assert_eq!(event.event_type, EventType::Security);
        assert!(event.entity_type.is_none());
        assert!(event.entity_id.is_none());
        assert_eq!(event.status, EventStatus::Failure);
        assert_eq!(event.ip_address.as_deref(), Some("203.0.113.9"));
    }

    #[tokio::test]
    async fn test_capture_old_state_attaches_extension() {
        struct FixedFetcher;

        #[async_trait]
        impl EntityFetcher for FixedFetcher {
            async fn fetch_by_id(&self, id: i64) -> crate::error::Result<Option<Value>> {
                Ok(Some(json!({"id": id, "cache_total": 10000})))
            }
        }

        let seen = Arc::new(Mutex::new(None::<Value>));
        let seen_in_handler = seen.clone();
        let fetcher: Arc<dyn EntityFetcher> = Arc::new(FixedFetcher);

        let app = Router::new()
            .route(
                "/api/eventos/:id",
                put(move |request: Request| {
                    let seen = seen_in_handler.clone();
                    async move {
                        *seen.lock().unwrap() = request
                            .extensions()
                            .get::<OldState>()
                            .map(|s| s.0.clone());
                        "{}"
                    }
                })
                .route_layer(middleware::from_fn_with_state(fetcher, capture_old_state)),
            );

        app.oneshot(
            HttpRequest::put("/api/eventos/42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

        let captured = seen.lock().unwrap().clone().unwrap();
        assert_eq!(captured["cache_total"], 10000);
        assert_eq!(captured["id"], 42);
    }

    #[tokio::test]
    async fn test_capture_old_state_failure_is_swallowed() {
        struct FailingFetcher;

        #[async_trait]
        impl EntityFetcher for FailingFetcher {
            async fn fetch_by_id(&self, _id: i64) -> crate::error::Result<Option<Value>> {
                Err(AppError::Database("connection refused".into()))
            }
        }

        let fetcher: Arc<dyn EntityFetcher> = Arc::new(FailingFetcher);
        let app = Router::new().route(
            "/api/eventos/:id",
            put(|| async { "{}" })
                .route_layer(middleware::from_fn_with_state(fetcher, capture_old_state)),
        );

        let response = app
            .oneshot(
                HttpRequest::put("/api/eventos/42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_parse_query() {
        let parsed = parse_query(Some("page=2&search=dj")).unwrap();
        assert_eq!(parsed["page"], "2");
        assert_eq!(parsed["search"], "dj");
        assert!(parse_query(Some("")).is_none());
        assert!(parse_query(None).is_none());
    }

    #[test]
    fn test_client_ip_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("198.51.100.7, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers, None).as_deref(), Some("198.51.100.7"));

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.8"));
        assert_eq!(client_ip(&headers, None).as_deref(), Some("198.51.100.8"));

        assert_eq!(client_ip(&HeaderMap::new(), None), None);
    }

    #[test]
    fn test_session_id_falls_back_to_bearer_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abcdefghijklmnopqrstuvwxyz"),
        );
        assert_eq!(
            session_id(None, &headers).as_deref(),
            Some("abcdefghijklmnopqrst")
        );

        let identity = Identity {
            session_id: Some("sess-1".into()),
            ..Default::default()
        };
        assert_eq!(
            session_id(Some(&identity), &headers).as_deref(),
            Some("sess-1")
        );
    }
}
