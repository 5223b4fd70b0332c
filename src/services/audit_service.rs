//! Audit store and query engine.
//!
//! Append is the hot path and runs on the write pool; every read-side
//! operation is meant to be constructed over the reporting pool so heavy
//! aggregates queue against their own connection budget.
//!
//! All SQL here is parameterized. The only strings ever interpolated into a
//! statement are produced inside this module: `$n` placeholders and
//! allow-listed sort columns.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::PgPool;
use utoipa::ToSchema;

use crate::error::Result;
use crate::models::audit_event::{AuditEvent, NewAuditEvent};

/// Columns the reporting surface may sort by. Anything else silently falls
/// back to `created_at`, closing the sort-parameter injection channel.
const SORTABLE_COLUMNS: &[&str] = &[
    "created_at",
    "event_type",
    "entity_type",
    "user_email",
    "status",
    "duration_ms",
];

/// Write seam between the interceptor and the store. The production
/// implementation is [`AuditService`]; tests substitute an in-memory sink.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist one event. Called at most once per candidate record; callers
    /// treat an error as log-and-drop, never retry.
    async fn append(&self, event: NewAuditEvent) -> Result<()>;
}

/// Optional, AND-combined filters for the general query path.
#[derive(Debug, Clone, Default)]
pub struct AuditFilters {
    pub event_type: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<i64>,
    pub user_id: Option<i64>,
    pub status: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub ip_address: Option<String>,
    pub search: Option<String>,
}

/// Page selection for the general query path.
#[derive(Debug, Clone, Default)]
pub struct FindPage {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
}

impl FindPage {
    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn limit(&self) -> u32 {
        self.limit.unwrap_or(50).max(1)
    }
}

/// Row of the `recent_audit_activity` view (last 7 days).
#[derive(Debug, Clone, sqlx::FromRow, Serialize, ToSchema)]
pub struct RecentActivity {
    pub id: i64,
    pub event_type: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<i64>,
    pub action: String,
    pub user_email: Option<String>,
    pub user_role: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Row of the `failed_audit_operations` view.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, ToSchema)]
pub struct FailedOperation {
    pub id: i64,
    pub event_type: String,
    pub action: String,
    pub user_email: Option<String>,
    pub error_message: Option<String>,
    pub ip_address: Option<String>,
    pub endpoint: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Row of the `security_audit_events` view.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, ToSchema)]
pub struct SecurityEvent {
    pub id: i64,
    pub event_type: String,
    pub action: String,
    pub user_email: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Row of the `user_activity_summary` view.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, ToSchema)]
pub struct UserActivitySummary {
    pub user_id: Option<i64>,
    pub user_email: Option<String>,
    pub user_role: Option<String>,
    pub total_actions: i64,
    pub creates: i64,
    pub updates: i64,
    pub deletes: i64,
    pub views: i64,
    pub failures: i64,
    pub first_activity: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Aggregates over a time window.
#[derive(Debug, Serialize, ToSchema)]
pub struct AuditStatistics {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_events: i64,
    pub successful_events: i64,
    pub failed_events: i64,
    pub unique_users: i64,
    pub unique_ips: i64,
    #[schema(value_type = Object)]
    pub events_by_type: Map<String, Value>,
    #[schema(value_type = Object)]
    pub events_by_entity: Map<String, Value>,
    #[schema(value_type = Object)]
    pub hourly_distribution: Map<String, Value>,
}

const SELECT_EVENT: &str = r#"
    SELECT id, event_type, entity_type, entity_id,
           user_id, user_email, user_role, impersonated_by,
           action, method, endpoint, ip_address, user_agent,
           old_values, new_values, changed_fields,
           status, error_message, duration_ms, metadata,
           session_id, request_id, created_at
    FROM audit_events
"#;

/// Build the WHERE clause for a filter set. Returns the clause (empty
/// string when unfiltered) and the next free placeholder index; binds must
/// follow the same field order as the conditions pushed here.
fn where_clause(filters: &AuditFilters) -> (String, u32) {
    let mut conditions: Vec<String> = Vec::new();
    let mut idx = 1u32;

    if filters.event_type.is_some() {
        conditions.push(format!("event_type = ${idx}"));
        idx += 1;
    }
    if filters.entity_type.is_some() {
        conditions.push(format!("entity_type = ${idx}"));
        idx += 1;
    }
    if filters.entity_id.is_some() {
        conditions.push(format!("entity_id = ${idx}"));
        idx += 1;
    }
    if filters.user_id.is_some() {
        conditions.push(format!("user_id = ${idx}"));
        idx += 1;
    }
    if filters.status.is_some() {
        conditions.push(format!("status = ${idx}"));
        idx += 1;
    }
    if filters.start_date.is_some() {
        conditions.push(format!("created_at >= ${idx}"));
        idx += 1;
    }
    if filters.end_date.is_some() {
        conditions.push(format!("created_at <= ${idx}"));
        idx += 1;
    }
    if filters.ip_address.is_some() {
        conditions.push(format!("ip_address = ${idx}"));
        idx += 1;
    }
    if filters.search.is_some() {
        conditions.push(format!(
            "(action ILIKE ${idx} OR user_email ILIKE ${idx} OR endpoint ILIKE ${idx})"
        ));
        idx += 1;
    }

    let clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };

    (clause, idx)
}

/// Resolve sort parameters against the allow-list.
fn sanitize_sort(sort_by: Option<&str>, sort_order: Option<&str>) -> (&'static str, &'static str) {
    let column = sort_by
        .and_then(|requested| {
            SORTABLE_COLUMNS
                .iter()
                .find(|column| **column == requested)
        })
        .copied()
        .unwrap_or("created_at");

    let order = match sort_order {
        Some(raw) if raw.eq_ignore_ascii_case("asc") => "ASC",
        _ => "DESC",
    };

    (column, order)
}

/// Audit store and query engine over a Postgres pool.
pub struct AuditService {
    db: PgPool,
}

impl AuditService {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Persist one audit event. Single-row insert; the caller decides what
    /// an error means (the interceptor drops, the reporting surface
    /// propagates).
    pub async fn append(&self, event: NewAuditEvent) -> Result<AuditEvent> {
        let sql = r#"
            INSERT INTO audit_events (
                event_type, entity_type, entity_id,
                user_id, user_email, user_role, impersonated_by,
                action, method, endpoint, ip_address, user_agent,
                old_values, new_values, changed_fields,
                status, error_message, duration_ms, metadata,
                session_id, request_id
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                $12, $13, $14, $15, $16, $17, $18, $19, $20, $21
            )
            RETURNING id, event_type, entity_type, entity_id,
                      user_id, user_email, user_role, impersonated_by,
                      action, method, endpoint, ip_address, user_agent,
                      old_values, new_values, changed_fields,
                      status, error_message, duration_ms, metadata,
                      session_id, request_id, created_at
        "#;

        let stored = sqlx::query_as::<_, AuditEvent>(sql)
            .bind(event.event_type.as_str())
            .bind(&event.entity_type)
            .bind(event.entity_id)
            .bind(event.user_id)
            .bind(&event.user_email)
            .bind(&event.user_role)
            .bind(event.impersonated_by)
            .bind(&event.action)
            .bind(&event.method)
            .bind(&event.endpoint)
            .bind(&event.ip_address)
            .bind(&event.user_agent)
            .bind(&event.old_values)
            .bind(&event.new_values)
            .bind(&event.changed_fields)
            .bind(event.status.as_str())
            .bind(&event.error_message)
            .bind(event.duration_ms)
            .bind(&event.metadata)
            .bind(&event.session_id)
            .bind(event.request_id)
            .fetch_one(&self.db)
            .await?;

        Ok(stored)
    }

    /// Filtered, sorted, paginated query with a separate COUNT under the
    /// same predicate. Returns the page of events and the total match count.
    pub async fn find(
        &self,
        filters: &AuditFilters,
        page: &FindPage,
    ) -> Result<(Vec<AuditEvent>, i64)> {
        let (clause, next_idx) = where_clause(filters);
        let (sort_column, sort_order) = sanitize_sort(
            page.sort_by.as_deref(),
            page.sort_order.as_deref(),
        );

        let limit = page.limit();
        let offset = (page.page() as i64 - 1) * limit as i64;

        let list_sql = format!(
            "{SELECT_EVENT}{clause} ORDER BY {sort_column} {sort_order} LIMIT ${next_idx} OFFSET ${}",
            next_idx + 1,
        );
        let count_sql = format!("SELECT COUNT(*) FROM audit_events{clause}");

        let mut list_query = sqlx::query_as::<_, AuditEvent>(&list_sql);
        let mut count_query = sqlx::query_as::<_, (i64,)>(&count_sql);

        if let Some(value) = &filters.event_type {
            list_query = list_query.bind(value);
            count_query = count_query.bind(value);
        }
        if let Some(value) = &filters.entity_type {
            list_query = list_query.bind(value);
            count_query = count_query.bind(value);
        }
        if let Some(value) = filters.entity_id {
            list_query = list_query.bind(value);
            count_query = count_query.bind(value);
        }
        if let Some(value) = filters.user_id {
            list_query = list_query.bind(value);
            count_query = count_query.bind(value);
        }
        if let Some(value) = &filters.status {
            list_query = list_query.bind(value);
            count_query = count_query.bind(value);
        }
        if let Some(value) = filters.start_date {
            list_query = list_query.bind(value);
            count_query = count_query.bind(value);
        }
        if let Some(value) = filters.end_date {
            list_query = list_query.bind(value);
            count_query = count_query.bind(value);
        }
        if let Some(value) = &filters.ip_address {
            list_query = list_query.bind(value);
            count_query = count_query.bind(value);
        }
        if let Some(value) = &filters.search {
            let pattern = format!("%{value}%");
            list_query = list_query.bind(pattern.clone());
            count_query = count_query.bind(pattern);
        }

        list_query = list_query.bind(limit as i64).bind(offset);

        let events = list_query.fetch_all(&self.db).await?;
        let (total,) = count_query.fetch_one(&self.db).await?;

        Ok((events, total))
    }

    /// Fetch one event by id.
    pub async fn find_by_id(&self, id: i64) -> Result<Option<AuditEvent>> {
        let sql = format!("{SELECT_EVENT} WHERE id = $1");
        let event = sqlx::query_as::<_, AuditEvent>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        Ok(event)
    }

    /// All events for one entity, newest first.
    pub async fn entity_trail(
        &self,
        entity_type: &str,
        entity_id: i64,
        limit: i64,
    ) -> Result<Vec<AuditEvent>> {
        let sql = format!(
            "{SELECT_EVENT} WHERE entity_type = $1 AND entity_id = $2 \
             ORDER BY created_at DESC LIMIT $3"
        );
        let events = sqlx::query_as::<_, AuditEvent>(&sql)
            .bind(entity_type)
            .bind(entity_id)
            .bind(limit)
            .fetch_all(&self.db)
            .await?;

        Ok(events)
    }

    /// Last 7 days of activity, from the `recent_audit_activity` view.
    pub async fn recent_activity(&self, limit: i64) -> Result<Vec<RecentActivity>> {
        let rows = sqlx::query_as::<_, RecentActivity>(
            "SELECT * FROM recent_audit_activity LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        Ok(rows)
    }

    /// Failed operations, from the `failed_audit_operations` view.
    pub async fn failed_operations(&self, limit: i64) -> Result<Vec<FailedOperation>> {
        let rows = sqlx::query_as::<_, FailedOperation>(
            "SELECT * FROM failed_audit_operations LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        Ok(rows)
    }

    /// Security events, from the `security_audit_events` view.
    pub async fn security_events(&self, limit: i64) -> Result<Vec<SecurityEvent>> {
        let rows = sqlx::query_as::<_, SecurityEvent>(
            "SELECT * FROM security_audit_events LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        Ok(rows)
    }

    /// Per-user activity aggregates, most active first. With `user_id`,
    /// at most one row.
    pub async fn user_activity_summary(
        &self,
        user_id: Option<i64>,
    ) -> Result<Vec<UserActivitySummary>> {
        let rows = match user_id {
            Some(user_id) => {
                sqlx::query_as::<_, UserActivitySummary>(
                    "SELECT * FROM user_activity_summary WHERE user_id = $1",
                )
                .bind(user_id)
                .fetch_all(&self.db)
                .await?
            }
            None => {
                sqlx::query_as::<_, UserActivitySummary>(
                    "SELECT * FROM user_activity_summary ORDER BY total_actions DESC",
                )
                .fetch_all(&self.db)
                .await?
            }
        };

        Ok(rows)
    }

    /// Aggregate statistics over a window, defaulting to the trailing 30
    /// days.
    pub async fn statistics(
        &self,
        start_date: Option<DateTime<Utc>>,
        end_date: Option<DateTime<Utc>>,
    ) -> Result<AuditStatistics> {
        let period_end = end_date.unwrap_or_else(Utc::now);
        let period_start = start_date.unwrap_or_else(|| period_end - Duration::days(30));

        let (total_events, successful_events, failed_events, unique_users, unique_ips) =
            sqlx::query_as::<_, (i64, i64, i64, i64, i64)>(
                r#"
                SELECT COUNT(*),
                       COUNT(*) FILTER (WHERE status = 'SUCCESS'),
                       COUNT(*) FILTER (WHERE status <> 'SUCCESS'),
                       COUNT(DISTINCT user_id),
                       COUNT(DISTINCT ip_address)
                FROM audit_events
                WHERE created_at BETWEEN $1 AND $2
                "#,
            )
            .bind(period_start)
            .bind(period_end)
            .fetch_one(&self.db)
            .await?;

        let by_type = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT event_type, COUNT(*)
            FROM audit_events
            WHERE created_at BETWEEN $1 AND $2
            GROUP BY event_type
            ORDER BY COUNT(*) DESC
            "#,
        )
        .bind(period_start)
        .bind(period_end)
        .fetch_all(&self.db)
        .await?;

        let by_entity = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT COALESCE(entity_type, 'null'), COUNT(*)
            FROM audit_events
            WHERE created_at BETWEEN $1 AND $2
            GROUP BY entity_type
            ORDER BY COUNT(*) DESC
            "#,
        )
        .bind(period_start)
        .bind(period_end)
        .fetch_all(&self.db)
        .await?;

        let by_hour = sqlx::query_as::<_, (i32, i64)>(
            r#"
            SELECT EXTRACT(HOUR FROM created_at)::INT, COUNT(*)
            FROM audit_events
            WHERE created_at BETWEEN $1 AND $2
            GROUP BY 1
            ORDER BY 1
            "#,
        )
        .bind(period_start)
        .bind(period_end)
        .fetch_all(&self.db)
        .await?;

        Ok(AuditStatistics {
            period_start,
            period_end,
            total_events,
            successful_events,
            failed_events,
            unique_users,
            unique_ips,
            events_by_type: count_map(by_type),
            events_by_entity: count_map(by_entity),
            hourly_distribution: count_map(
                by_hour
                    .into_iter()
                    .map(|(hour, count)| (hour.to_string(), count)),
            ),
        })
    }

    /// Delete every event older than the retention window. One bounded
    /// statement; returns the number of rows removed.
    pub async fn cleanup(&self, retention_days: i32) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM audit_events WHERE created_at < now() - make_interval(days => $1)",
        )
        .bind(retention_days)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }
}

fn count_map(rows: impl IntoIterator<Item = (String, i64)>) -> Map<String, Value> {
    rows.into_iter()
        .map(|(key, count)| (key, Value::from(count)))
        .collect()
}

#[async_trait]
impl AuditSink for AuditService {
    async fn append(&self, event: NewAuditEvent) -> Result<()> {
        AuditService::append(self, event).await.map(|_| ())
    }
}
