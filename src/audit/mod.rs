//! Event classification and payload redaction.

pub mod classifier;
pub mod redaction;
