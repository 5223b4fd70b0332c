//! Audit event model.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Kind of observed action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Create,
    Update,
    Delete,
    View,
    Login,
    Logout,
    Export,
    Import,
    Security,
    Access,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Create => "CREATE",
            EventType::Update => "UPDATE",
            EventType::Delete => "DELETE",
            EventType::View => "VIEW",
            EventType::Login => "LOGIN",
            EventType::Logout => "LOGOUT",
            EventType::Export => "EXPORT",
            EventType::Import => "IMPORT",
            EventType::Security => "SECURITY",
            EventType::Access => "ACCESS",
        }
    }
}

/// Outcome of the observed action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Success,
    Failure,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Success => "SUCCESS",
            EventStatus::Failure => "FAILURE",
        }
    }

    /// Classify an HTTP status code. 2xx/3xx count as success.
    pub fn from_http(status: u16) -> Self {
        if (200..400).contains(&status) {
            EventStatus::Success
        } else {
            EventStatus::Failure
        }
    }
}

/// Candidate audit record assembled by the interceptor or the manual log
/// path. Redaction has already been applied by the time one of these exists.
#[derive(Debug, Clone)]
pub struct NewAuditEvent {
    pub event_type: EventType,
    pub entity_type: Option<String>,
    pub entity_id: Option<i64>,
    pub user_id: Option<i64>,
    pub user_email: Option<String>,
    pub user_role: Option<String>,
    pub impersonated_by: Option<i64>,
    pub action: String,
    pub method: Option<String>,
    pub endpoint: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub old_values: Option<Value>,
    pub new_values: Option<Value>,
    pub changed_fields: Option<Vec<String>>,
    pub status: EventStatus,
    pub error_message: Option<String>,
    pub duration_ms: Option<i32>,
    pub metadata: Option<Value>,
    pub session_id: Option<String>,
    pub request_id: Option<Uuid>,
}

impl NewAuditEvent {
    /// Minimal record; the call site fills in what it observed.
    pub fn new(event_type: EventType, action: impl Into<String>) -> Self {
        Self {
            event_type,
            entity_type: None,
            entity_id: None,
            user_id: None,
            user_email: None,
            user_role: None,
            impersonated_by: None,
            action: action.into(),
            method: None,
            endpoint: None,
            ip_address: None,
            user_agent: None,
            old_values: None,
            new_values: None,
            changed_fields: None,
            status: EventStatus::Success,
            error_message: None,
            duration_ms: None,
            metadata: None,
            session_id: None,
            request_id: None,
        }
    }
}

/// Persisted audit event
#[derive(Debug, Clone, FromRow, Serialize, ToSchema)]
pub struct AuditEvent {
    pub id: i64,
    pub event_type: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<i64>,
    pub user_id: Option<i64>,
    pub user_email: Option<String>,
    pub user_role: Option<String>,
    pub impersonated_by: Option<i64>,
    pub action: String,
    pub method: Option<String>,
    pub endpoint: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    #[schema(value_type = Object)]
    pub old_values: Option<Value>,
    #[schema(value_type = Object)]
    pub new_values: Option<Value>,
    pub changed_fields: Option<Vec<String>>,
    pub status: String,
    pub error_message: Option<String>,
    pub duration_ms: Option<i32>,
    #[schema(value_type = Object)]
    pub metadata: Option<Value>,
    pub session_id: Option<String>,
    pub request_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}
