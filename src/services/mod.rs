//! Business logic services.

pub mod audit_service;
pub mod export_service;
