//! API module - HTTP handlers and middleware.

pub mod dto;
pub mod handlers;
pub mod middleware;
pub mod routes;

use sqlx::PgPool;
use std::sync::Arc;

use crate::api::middleware::audit::AuditLayerState;
use crate::config::Config;
use crate::services::audit_service::{AuditService, AuditSink};

/// Application state shared across handlers
pub struct AppState {
    pub config: Config,
    /// Write pool: appends and retention deletes
    pub db: PgPool,
    /// Reporting pool: queries, statistics, export
    pub reporting_db: PgPool,
    /// Interceptor state (config + sink), built once at startup
    pub audit: AuditLayerState,
}

impl AppState {
    pub fn new(config: Config, db: PgPool, reporting_db: PgPool) -> Self {
        let sink: Arc<dyn AuditSink> = Arc::new(AuditService::new(db.clone()));
        let audit = AuditLayerState::new(Arc::new(config.audit.clone()), sink);
        Self {
            config,
            db,
            reporting_db,
            audit,
        }
    }

    /// Audit store on the write pool.
    pub fn audit_service(&self) -> AuditService {
        AuditService::new(self.db.clone())
    }

    /// Audit query engine on the reporting pool.
    pub fn reporting_service(&self) -> AuditService {
        AuditService::new(self.reporting_db.clone())
    }
}

pub type SharedState = Arc<AppState>;
