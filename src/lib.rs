//! Club Audit Backend - Library
//!
//! Audit and observability pipeline: request interception, event
//! classification and redaction, durable audit storage, and the
//! administrative reporting surface.

pub mod api;
pub mod audit;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod telemetry;

pub use config::Config;
pub use error::{AppError, Result};
