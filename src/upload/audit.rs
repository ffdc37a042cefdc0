//! Audit trail for upload authorization decisions.
//!
//! Every event is emitted via `tracing::info!` with a JSON `audit` field.
//!
//! | Event | When |
//! |-------|------|
//! | `upload.issued` | A write URL was issued |
//! | `upload.denied` | Authorization failed (credential, token or policy) |
//! | `upload.rejected` | Authorized, but the filename was unusable |
//! | `upload.failed` | Key fetch or signing failed on our side |

use serde::Serialize;

/// Structured audit event for one upload request.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"upload.issued"`).
    pub event: &'static str,
    /// Verified principal, or `"anonymous"`.
    pub principal: String,
    /// Role at decision time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Storage key (for `upload.issued`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// URL lifetime in seconds (for `upload.issued`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    /// Human-readable reason for non-issued events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    /// Construct an `upload.issued` event.
    #[must_use]
    pub fn issued(principal: &str, role: &str, key: &str, expires_in: u64) -> Self {
        Self {
            event: "upload.issued",
            principal: principal.to_string(),
            role: Some(role.to_string()),
            key: Some(key.to_string()),
            expires_in: Some(expires_in),
            reason: None,
        }
    }

    /// Construct an `upload.denied` event.
    #[must_use]
    pub fn denied(principal: &str, reason: impl Into<String>) -> Self {
        Self {
            event: "upload.denied",
            principal: principal.to_string(),
            role: None,
            key: None,
            expires_in: None,
            reason: Some(reason.into()),
        }
    }

    /// Construct an `upload.rejected` event.
    #[must_use]
    pub fn rejected(principal: &str, reason: impl Into<String>) -> Self {
        Self {
            event: "upload.rejected",
            principal: principal.to_string(),
            role: None,
            key: None,
            expires_in: None,
            reason: Some(reason.into()),
        }
    }

    /// Construct an `upload.failed` event.
    #[must_use]
    pub fn failed(principal: &str, key: Option<&str>, reason: impl Into<String>) -> Self {
        Self {
            event: "upload.failed",
            principal: principal.to_string(),
            role: None,
            key: key.map(str::to_string),
            expires_in: None,
            reason: Some(reason.into()),
        }
    }
}

/// Emit an audit event via `tracing::info!`.
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "upload audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
