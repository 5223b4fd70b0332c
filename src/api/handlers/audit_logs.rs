//! Audit reporting surface: filtered queries, dashboard views, statistics,
//! CSV export, and retention cleanup.
//!
//! Read-path errors propagate to the operator as explicit error responses,
//! unlike the write side's total suppression.

use axum::{
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::{IntoParams, OpenApi, ToSchema};

use crate::api::dto::Pagination;
use crate::api::middleware::audit::{log_audit, ManualAudit, RequestAuditInfo};
use crate::api::SharedState;
use crate::error::{AppError, Result};
use crate::models::audit_event::{AuditEvent, EventType};
use crate::services::audit_service::{
    AuditFilters, AuditStatistics, FailedOperation, FindPage, RecentActivity, SecurityEvent,
    UserActivitySummary,
};
use crate::services::export_service::ExportService;

/// Create audit log routes
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/", get(list_audit_logs))
        .route("/recent", get(recent_activity))
        .route("/failed", get(failed_operations))
        .route("/security", get(security_events))
        .route("/statistics", get(statistics))
        .route("/export", get(export_audit_logs))
        .route("/me", get(my_activity))
        .route("/cleanup", post(cleanup_audit_logs))
        .route("/users/summary", get(all_user_summaries))
        .route("/users/:user_id/summary", get(user_summary))
        .route("/entity/:entity_type/:entity_id", get(entity_trail))
        .route("/:id", get(get_audit_log))
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogQuery {
    pub event_type: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<i64>,
    pub user_id: Option<i64>,
    pub status: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub ip_address: Option<String>,
    pub search: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
}

impl AuditLogQuery {
    fn filters(&self) -> AuditFilters {
        AuditFilters {
            event_type: self.event_type.clone(),
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id,
            user_id: self.user_id,
            status: self.status.clone(),
            start_date: self.start_date,
            end_date: self.end_date,
            ip_address: self.ip_address.clone(),
            search: self.search.clone(),
        }
    }

    fn page(&self) -> FindPage {
        FindPage {
            page: self.page,
            limit: self.limit,
            sort_by: self.sort_by.clone(),
            sort_order: self.sort_order.clone(),
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AuditLogListResponse {
    pub data: Vec<AuditEvent>,
    pub pagination: Pagination,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ListMeta {
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RecentActivityResponse {
    pub data: Vec<RecentActivity>,
    pub meta: ListMeta,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct FailedOperationsResponse {
    pub data: Vec<FailedOperation>,
    pub meta: ListMeta,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SecurityEventsResponse {
    pub data: Vec<SecurityEvent>,
    pub meta: ListMeta,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct EntityTrailMeta {
    pub entity_type: String,
    pub entity_id: i64,
    pub count: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct EntityTrailResponse {
    pub data: Vec<AuditEvent>,
    pub meta: EntityTrailMeta,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CleanupRequest {
    pub retention_days: Option<i32>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResponse {
    pub deleted_count: u64,
    pub retention_days: i32,
}

/// List audit events with filters, sorting, and pagination
#[utoipa::path(
    get,
    path = "",
    context_path = "/api/v1/audit-logs",
    tag = "audit-logs",
    params(AuditLogQuery),
    responses(
        (status = 200, description = "Filtered audit events", body = AuditLogListResponse),
    ),
    security(("bearer_auth" = []))
)]
pub async fn list_audit_logs(
    State(state): State<SharedState>,
    Query(query): Query<AuditLogQuery>,
) -> Result<Json<AuditLogListResponse>> {
    let page = query.page();
    let (data, total) = state
        .reporting_service()
        .find(&query.filters(), &page)
        .await?;

    Ok(Json(AuditLogListResponse {
        data,
        pagination: Pagination::new(page.page(), page.limit(), total),
    }))
}

/// Recent activity (last 7 days)
#[utoipa::path(
    get,
    path = "/recent",
    context_path = "/api/v1/audit-logs",
    tag = "audit-logs",
    params(LimitQuery),
    responses(
        (status = 200, description = "Recent activity", body = RecentActivityResponse),
    ),
    security(("bearer_auth" = []))
)]
pub async fn recent_activity(
    State(state): State<SharedState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<RecentActivityResponse>> {
    let data = state
        .reporting_service()
        .recent_activity(query.limit.unwrap_or(100))
        .await?;

    let meta = ListMeta {
        count: data.len(),
        period: Some("Last 7 days".to_string()),
    };
    Ok(Json(RecentActivityResponse { data, meta }))
}

/// Failed operations
#[utoipa::path(
    get,
    path = "/failed",
    context_path = "/api/v1/audit-logs",
    tag = "audit-logs",
    params(LimitQuery),
    responses(
        (status = 200, description = "Failed operations", body = FailedOperationsResponse),
    ),
    security(("bearer_auth" = []))
)]
pub async fn failed_operations(
    State(state): State<SharedState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<FailedOperationsResponse>> {
    let data = state
        .reporting_service()
        .failed_operations(query.limit.unwrap_or(100))
        .await?;

    let meta = ListMeta {
        count: data.len(),
        period: None,
    };
    Ok(Json(FailedOperationsResponse { data, meta }))
}

/// Security events
#[utoipa::path(
    get,
    path = "/security",
    context_path = "/api/v1/audit-logs",
    tag = "audit-logs",
    params(LimitQuery),
    responses(
        (status = 200, description = "Security events", body = SecurityEventsResponse),
    ),
    security(("bearer_auth" = []))
)]
pub async fn security_events(
    State(state): State<SharedState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<SecurityEventsResponse>> {
    let data = state
        .reporting_service()
        .security_events(query.limit.unwrap_or(100))
        .await?;

    let meta = ListMeta {
        count: data.len(),
        period: None,
    };
    Ok(Json(SecurityEventsResponse { data, meta }))
}

#[derive(Debug, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsQuery {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

/// Aggregate statistics over a window (default: trailing 30 days)
#[utoipa::path(
    get,
    path = "/statistics",
    context_path = "/api/v1/audit-logs",
    tag = "audit-logs",
    params(StatisticsQuery),
    responses(
        (status = 200, description = "Audit statistics", body = AuditStatistics),
    ),
    security(("bearer_auth" = []))
)]
pub async fn statistics(
    State(state): State<SharedState>,
    Query(query): Query<StatisticsQuery>,
) -> Result<Json<AuditStatistics>> {
    let stats = state
        .reporting_service()
        .statistics(query.start_date, query.end_date)
        .await?;

    Ok(Json(stats))
}

/// Export filtered audit events as CSV
#[utoipa::path(
    get,
    path = "/export",
    context_path = "/api/v1/audit-logs",
    tag = "audit-logs",
    params(AuditLogQuery),
    responses(
        (status = 200, description = "CSV export", body = String, content_type = "text/csv"),
        (status = 404, description = "No events matched the filter"),
    ),
    security(("bearer_auth" = []))
)]
pub async fn export_audit_logs(
    State(state): State<SharedState>,
    info: RequestAuditInfo,
    Query(query): Query<AuditLogQuery>,
) -> Result<Response> {
    let export = ExportService::new(state.reporting_service())
        .export_csv(&query.filters())
        .await?
        .ok_or_else(|| AppError::NotFound("No audit logs found for export".into()))?;

    // The export is itself an auditable action.
    log_audit(
        &state.audit,
        &info,
        ManualAudit {
            event_type: Some(EventType::Export),
            action: Some(format!(
                "Exported audit logs ({} records)",
                export.row_count
            )),
            metadata: Some(json!({ "count": export.row_count })),
            ..Default::default()
        },
    )
    .await;

    let headers = [
        (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", export.filename),
        ),
    ];
    Ok((headers, export.content).into_response())
}

/// The calling user's own activity
#[utoipa::path(
    get,
    path = "/me",
    context_path = "/api/v1/audit-logs",
    tag = "audit-logs",
    params(AuditLogQuery),
    responses(
        (status = 200, description = "Own activity", body = AuditLogListResponse),
        (status = 403, description = "No authenticated user"),
    ),
    security(("bearer_auth" = []))
)]
pub async fn my_activity(
    State(state): State<SharedState>,
    info: RequestAuditInfo,
    Query(query): Query<AuditLogQuery>,
) -> Result<Json<AuditLogListResponse>> {
    let user_id = info
        .identity
        .user_id
        .ok_or_else(|| AppError::Authorization("Authentication required".into()))?;

    let mut filters = query.filters();
    filters.user_id = Some(user_id);
    let page = FindPage {
        page: query.page,
        limit: query.limit,
        ..Default::default()
    };

    let (data, total) = state.reporting_service().find(&filters, &page).await?;

    Ok(Json(AuditLogListResponse {
        data,
        pagination: Pagination::new(page.page(), page.limit(), total),
    }))
}

/// Activity summaries for all users, most active first
#[utoipa::path(
    get,
    path = "/users/summary",
    context_path = "/api/v1/audit-logs",
    tag = "audit-logs",
    responses(
        (status = 200, description = "Per-user activity summaries", body = Vec<UserActivitySummary>),
    ),
    security(("bearer_auth" = []))
)]
pub async fn all_user_summaries(
    State(state): State<SharedState>,
) -> Result<Json<Vec<UserActivitySummary>>> {
    let summaries = state.reporting_service().user_activity_summary(None).await?;
    Ok(Json(summaries))
}

/// Activity summary for one user
#[utoipa::path(
    get,
    path = "/users/{user_id}/summary",
    context_path = "/api/v1/audit-logs",
    tag = "audit-logs",
    params(("user_id" = i64, Path, description = "User id")),
    responses(
        (status = 200, description = "Activity summary", body = UserActivitySummary),
        (status = 404, description = "No recorded activity"),
    ),
    security(("bearer_auth" = []))
)]
pub async fn user_summary(
    State(state): State<SharedState>,
    Path(user_id): Path<i64>,
) -> Result<Json<UserActivitySummary>> {
    let summary = state
        .reporting_service()
        .user_activity_summary(Some(user_id))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| {
            AppError::NotFound(format!("No activity recorded for user {user_id}"))
        })?;

    Ok(Json(summary))
}

/// Audit trail for one entity, newest first
#[utoipa::path(
    get,
    path = "/entity/{entity_type}/{entity_id}",
    context_path = "/api/v1/audit-logs",
    tag = "audit-logs",
    params(
        ("entity_type" = String, Path, description = "Entity type, e.g. evento"),
        ("entity_id" = i64, Path, description = "Entity id"),
        LimitQuery,
    ),
    responses(
        (status = 200, description = "Entity audit trail", body = EntityTrailResponse),
    ),
    security(("bearer_auth" = []))
)]
pub async fn entity_trail(
    State(state): State<SharedState>,
    Path((entity_type, entity_id)): Path<(String, i64)>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<EntityTrailResponse>> {
    let data = state
        .reporting_service()
        .entity_trail(&entity_type, entity_id, query.limit.unwrap_or(50))
        .await?;

    let meta = EntityTrailMeta {
        entity_type,
        entity_id,
        count: data.len(),
    };
    Ok(Json(EntityTrailResponse { data, meta }))
}

/// Fetch one audit event by id
#[utoipa::path(
    get,
    path = "/{id}",
    context_path = "/api/v1/audit-logs",
    tag = "audit-logs",
    params(("id" = i64, Path, description = "Audit event id")),
    responses(
        (status = 200, description = "Audit event", body = AuditEvent),
        (status = 404, description = "Not found"),
    ),
    security(("bearer_auth" = []))
)]
pub async fn get_audit_log(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<AuditEvent>> {
    let event = state
        .reporting_service()
        .find_by_id(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Audit event {id} not found")))?;

    Ok(Json(event))
}

/// Delete audit events older than the retention window (admin only)
#[utoipa::path(
    post,
    path = "/cleanup",
    context_path = "/api/v1/audit-logs",
    tag = "audit-logs",
    request_body = CleanupRequest,
    responses(
        (status = 200, description = "Cleanup completed", body = CleanupResponse),
        (status = 403, description = "Caller is not an admin"),
    ),
    security(("bearer_auth" = []))
)]
pub async fn cleanup_audit_logs(
    State(state): State<SharedState>,
    info: RequestAuditInfo,
    Json(request): Json<CleanupRequest>,
) -> Result<Json<CleanupResponse>> {
    if !info.identity.is_admin() {
        return Err(AppError::Authorization(
            "Only admins can clean up audit logs".into(),
        ));
    }

    let retention_days = request.retention_days.unwrap_or(state.config.retention_days);
    if retention_days <= 0 {
        return Err(AppError::Validation(
            "retentionDays must be positive".into(),
        ));
    }

    // Deletion runs on the write pool; it is a write, not a report.
    let deleted_count = state.audit_service().cleanup(retention_days).await?;

    log_audit(
        &state.audit,
        &info,
        ManualAudit {
            event_type: Some(EventType::Delete),
            action: Some(format!(
                "Cleaned up {deleted_count} old audit events (retention: {retention_days} days)"
            )),
            metadata: Some(json!({
                "retentionDays": retention_days,
                "deletedCount": deleted_count,
            })),
            ..Default::default()
        },
    )
    .await;

    Ok(Json(CleanupResponse {
        deleted_count,
        retention_days,
    }))
}

// ---------------------------------------------------------------------------
// OpenAPI
// ---------------------------------------------------------------------------

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};

        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    modifiers(&SecurityAddon),
    tags(
        (name = "audit-logs", description = "Audit event queries, reports, export, and retention"),
    ),
    paths(
        list_audit_logs,
        recent_activity,
        failed_operations,
        security_events,
        statistics,
        export_audit_logs,
        my_activity,
        all_user_summaries,
        user_summary,
        entity_trail,
        get_audit_log,
        cleanup_audit_logs,
    ),
    components(schemas(
        AuditEvent,
        AuditLogListResponse,
        RecentActivityResponse,
        FailedOperationsResponse,
        SecurityEventsResponse,
        EntityTrailResponse,
        EntityTrailMeta,
        ListMeta,
        AuditStatistics,
        UserActivitySummary,
        CleanupRequest,
        CleanupResponse,
        crate::api::dto::Pagination,
        RecentActivity,
        FailedOperation,
        SecurityEvent,
    ))
)]
pub struct ApiDoc;
