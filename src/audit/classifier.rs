//! Request classification: entity, event kind, and action description.
//!
//! Classification never fails. A request that matches nothing falls back to
//! `ACCESS` with no entity, so a malformed request still produces a record.

use serde_json::Value;

use crate::models::audit_event::EventType;

/// Ordered route-fragment to entity-type table. First containment match
/// wins, so more specific fragments must precede shorter ones.
pub const ENTITY_ROUTES: &[(&str, &str)] = &[
    ("/eventos", "evento"),
    ("/djs", "dj"),
    ("/clientes", "cliente"),
    ("/leads", "lead"),
    ("/payments", "payment"),
    ("/documents", "document"),
    ("/contracts", "contract"),
    ("/solicitudes", "solicitud"),
    ("/reservations", "reservation"),
    ("/socios", "socio"),
    ("/nominas", "nomina"),
    ("/users", "user"),
];

/// Domain entity a request acts on, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityRef {
    pub entity_type: Option<String>,
    pub entity_id: Option<i64>,
}

/// Match the path against the route table and parse the id parameter.
///
/// `id_param` is the `id` route parameter where the caller has one (manual
/// logging from a handler); the interceptor passes the first numeric path
/// segment instead, extracted by [`extract_id_segment`].
pub fn classify_entity(path: &str, id_param: Option<&str>) -> EntityRef {
    let entity_type = ENTITY_ROUTES
        .iter()
        .find(|(fragment, _)| path.contains(fragment))
        .map(|(_, entity)| entity.to_string());

    let entity_id = id_param.and_then(|raw| raw.parse::<i64>().ok());

    EntityRef {
        entity_type,
        entity_id,
    }
}

/// First path segment that parses as an integer, e.g. `/api/eventos/42/djs`
/// yields 42.
pub fn extract_id_segment(path: &str) -> Option<&str> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .find(|segment| segment.parse::<i64>().is_ok())
}

/// Derive the event kind. Path rules win over method rules.
pub fn classify_event_type(method: &str, path: &str) -> EventType {
    if path.contains("/login") {
        return EventType::Login;
    }
    if path.contains("/logout") {
        return EventType::Logout;
    }
    if path.contains("/export") {
        return EventType::Export;
    }
    if path.contains("/import") {
        return EventType::Import;
    }

    match method {
        "POST" => EventType::Create,
        "PUT" | "PATCH" => EventType::Update,
        "DELETE" => EventType::Delete,
        "GET" => EventType::View,
        _ => EventType::Access,
    }
}

/// Produce the human-readable action line for an event.
///
/// Advisory text only; the one guarantee is that it is never empty.
pub fn describe_action(
    method: &str,
    path: &str,
    entity: &EntityRef,
    event_type: EventType,
    body: Option<&Value>,
) -> String {
    let entity_type = entity.entity_type.as_deref();
    let entity_or_data = entity_type.unwrap_or("data");

    match event_type {
        EventType::Create => {
            let mut action = format!("Created {}", entity_or_resource(entity_type));
            if let Some(name) = body_field(body, "nombre").or_else(|| body_field(body, "evento")) {
                action.push_str(&format!(": {name}"));
            }
            action
        }
        EventType::Update => with_id("Updated", entity_type, entity.entity_id),
        EventType::Delete => with_id("Deleted", entity_type, entity.entity_id),
        EventType::View => {
            if path.contains("/export") {
                format!("Exported {entity_or_data}")
            } else if let Some(id) = entity.entity_id {
                format!("Viewed {} #{id}", entity_or_resource(entity_type))
            } else {
                format!("Listed {}", entity_type.unwrap_or("resources"))
            }
        }
        EventType::Login => {
            let mut action = "User logged in".to_string();
            if let Some(identifier) = body_field(body, "username") {
                action.push_str(&format!(": {identifier}"));
            }
            action
        }
        EventType::Logout => "User logged out".to_string(),
        EventType::Export => format!("Exported {entity_or_data}"),
        EventType::Import => format!("Imported {entity_or_data}"),
        EventType::Security | EventType::Access => format!("{method} {path}"),
    }
}

fn entity_or_resource(entity_type: Option<&str>) -> &str {
    entity_type.unwrap_or("resource")
}

fn with_id(verb: &str, entity_type: Option<&str>, id: Option<i64>) -> String {
    let mut action = format!("{verb} {}", entity_or_resource(entity_type));
    if let Some(id) = id {
        action.push_str(&format!(" #{id}"));
    }
    action
}

fn body_field<'a>(body: Option<&'a Value>, field: &str) -> Option<&'a str> {
    body?.get(field)?.as_str()
}
