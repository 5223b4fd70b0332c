//! Actor identity extension.
//!
//! Authentication itself lives outside this subsystem. Whatever session
//! layer fronts the API is expected to insert an [`Identity`] into the
//! request extensions before the audit interceptor runs; requests without
//! one are recorded as anonymous.

/// Authenticated actor context for the current request.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub user_id: Option<i64>,
    pub email: Option<String>,
    pub role: Option<String>,
    /// Set when an elevated user acts on behalf of another.
    pub impersonated_by: Option<i64>,
    pub session_id: Option<String>,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role.as_deref() == Some("ADMIN")
    }
}
