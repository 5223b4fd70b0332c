//! CSV projection of filtered audit events.
//!
//! Row format follows the operator-facing export of the platform: one
//! human-labeled column set, every non-null field quoted with embedded
//! quotes doubled, nulls as bare empty strings.

use chrono::Utc;

use crate::error::Result;
use crate::models::audit_event::AuditEvent;
use crate::services::audit_service::{AuditFilters, AuditService, FindPage};

/// Fixed ceiling for one export.
pub const EXPORT_LIMIT: u32 = 10_000;

const HEADERS: &[&str] = &[
    "ID",
    "Fecha",
    "Tipo",
    "Acción",
    "Usuario",
    "Rol",
    "Entidad",
    "ID Entidad",
    "Estado",
    "IP",
    "Método",
    "Endpoint",
    "Duración (ms)",
];

/// A rendered export ready to be served as `text/csv`.
#[derive(Debug)]
pub struct CsvExport {
    pub filename: String,
    pub content: String,
    pub row_count: usize,
}

/// CSV export over the audit query engine.
pub struct ExportService {
    audit: AuditService,
}

impl ExportService {
    pub fn new(audit: AuditService) -> Self {
        Self { audit }
    }

    /// Run the filtered query (first page, fixed 10k limit) and render it.
    /// `None` when the filter matches nothing.
    pub async fn export_csv(&self, filters: &AuditFilters) -> Result<Option<CsvExport>> {
        let page = FindPage {
            page: Some(1),
            limit: Some(EXPORT_LIMIT),
            ..Default::default()
        };
        let (events, _total) = self.audit.find(filters, &page).await?;

        if events.is_empty() {
            return Ok(None);
        }

        let filename = format!("audit-logs-{}.csv", Utc::now().timestamp_millis());
        let row_count = events.len();

        Ok(Some(CsvExport {
            filename,
            content: render_csv(&events),
            row_count,
        }))
    }
}

/// Render events into CSV text, header row first.
fn render_csv(events: &[AuditEvent]) -> String {
    let mut lines = Vec::with_capacity(events.len() + 1);
    lines.push(HEADERS.join(","));

    for event in events {
        let fields = [
            csv_field(Some(event.id.to_string())),
            csv_field(Some(event.created_at.to_rfc3339())),
            csv_field(Some(event.event_type.clone())),
            csv_field(Some(event.action.clone())),
            csv_field(event.user_email.clone()),
            csv_field(event.user_role.clone()),
            csv_field(event.entity_type.clone()),
            csv_field(event.entity_id.map(|id| id.to_string())),
            csv_field(Some(event.status.clone())),
            csv_field(event.ip_address.clone()),
            csv_field(event.method.clone()),
            csv_field(event.endpoint.clone()),
            csv_field(event.duration_ms.map(|ms| ms.to_string())),
        ];
        lines.push(fields.join(","));
    }

    lines.join("\n")
}

/// Quote one field, doubling embedded quotes. Nulls render as an empty
/// string without quotes.
fn csv_field(value: Option<String>) -> String {
    match value {
        Some(value) => format!("\"{}\"", value.replace('"', "\"\"")),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_event() -> AuditEvent {
        AuditEvent {
            id: 7,
            event_type: "UPDATE".to_string(),
            entity_type: Some("evento".to_string()),
            entity_id: Some(42),
            user_id: Some(1),
            user_email: Some("admin@club.es".to_string()),
            user_role: Some("ADMIN".to_string()),
            impersonated_by: None,
            action: "Updated evento #42".to_string(),
            method: Some("PUT".to_string()),
            endpoint: Some("/api/eventos/42".to_string()),
            ip_address: Some("10.0.0.1".to_string()),
            user_agent: None,
            old_values: None,
            new_values: None,
            changed_fields: None,
            status: "SUCCESS".to_string(),
            error_message: None,
            duration_ms: Some(12),
            metadata: None,
            session_id: None,
            request_id: None,
            created_at: Utc.with_ymd_and_hms(2026, 3, 14, 22, 30, 0).unwrap(),
        }
    }

    #[test]
    fn test_csv_field_quotes_values() {
        assert_eq!(csv_field(Some("evento".into())), "\"evento\"");
    }

    #[test]
    fn test_csv_field_doubles_embedded_quotes() {
        assert_eq!(
            csv_field(Some("Sala \"La Cueva\"".into())),
            "\"Sala \"\"La Cueva\"\"\""
        );
    }

    #[test]
    fn test_csv_field_null_is_bare_empty() {
        assert_eq!(csv_field(None), "");
    }

    #[test]
    fn test_csv_field_keeps_embedded_commas_inside_quotes() {
        assert_eq!(csv_field(Some("a,b".into())), "\"a,b\"");
    }

    #[test]
    fn test_render_csv_header_row() {
        let csv = render_csv(&[sample_event()]);
        let header = csv.lines().next().unwrap();
        assert!(header.starts_with("ID,Fecha,Tipo,Acción,Usuario"));
        assert!(header.ends_with("Método,Endpoint,Duración (ms)"));
    }

    #[test]
    fn test_render_csv_row_values() {
        let csv = render_csv(&[sample_event()]);
        let row = csv.lines().nth(1).unwrap();
        assert!(row.starts_with("\"7\","));
        assert!(row.contains("\"UPDATE\""));
        assert!(row.contains("\"Updated evento #42\""));
        assert!(row.contains("\"admin@club.es\""));
        assert!(row.contains("\"42\""));
        assert!(row.contains("\"12\""));
    }

    #[test]
    fn test_render_csv_nulls_are_empty_columns() {
        let mut event = sample_event();
        event.user_email = None;
        event.duration_ms = None;
        let csv = render_csv(&[event]);
        let row = csv.lines().nth(1).unwrap();
        // Usuario column is empty between its neighbors.
        assert!(row.contains(",,"));
        assert!(row.ends_with(","));
    }

    #[test]
    fn test_render_csv_one_line_per_event() {
        let events = vec![sample_event(), sample_event(), sample_event()];
        let csv = render_csv(&events);
        assert_eq!(csv.lines().count(), 4);
    }
}
