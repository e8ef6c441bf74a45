//! Limiter decisions and how the HTTP layer renders them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::backend::BackendKind;
use super::policy::Category;
use crate::error::{FloodgateError, Result};

/// The answer to "may this identity do this now".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub category: Category,
    /// The derived rate limit key
    pub key: String,
    pub allowed: bool,
    /// Effective limit for this identity, after progressive penalties
    pub limit: u64,
    /// Published quota of the policy
    pub quota: u64,
    pub window_secs: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub retry_after_secs: u64,
    /// Backend that served the decision; for logs and metrics only
    pub served_by: BackendKind,
}

impl Decision {
    /// Standard rate limit response headers.
    ///
    /// `X-RateLimit-Limit` carries the effective limit, which is lower than
    /// the published quota while penalties apply. `Retry-After` is only
    /// present on denials.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at.timestamp().to_string()),
        ];
        if !self.allowed {
            headers.push(("Retry-After", self.retry_after_secs.to_string()));
        }
        headers
    }

    /// Structured error payload for a denial.
    pub fn error_body(&self) -> serde_json::Value {
        json!({
            "error": "rate_limit_exceeded",
            "message": format!(
                "Too many {} requests, retry after {} seconds",
                self.category, self.retry_after_secs
            ),
            "category": self.category,
            "limit": self.limit,
            "quota": self.quota,
            "window_secs": self.window_secs,
            "remaining": self.remaining,
            "reset_at": self.reset_at.to_rfc3339(),
            "retry_after_secs": self.retry_after_secs,
        })
    }

    /// Turn a denial into `QuotaExceeded`.
    pub fn ensure_allowed(self) -> Result<Self> {
        if self.allowed {
            Ok(self)
        } else {
            Err(FloodgateError::QuotaExceeded {
                category: self.category.to_string(),
                retry_after_secs: self.retry_after_secs,
            })
        }
    }
}

/// Administrative view of a counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitStatus {
    pub category: Category,
    pub key: String,
    pub limit: u64,
    pub remaining: u64,
    /// `None` when no record exists
    pub reset_at: Option<DateTime<Utc>>,
    pub blocked: bool,
}

/// Invoked by the HTTP layer once a response for a limited request is written.
pub trait DecisionHook: Send + Sync {
    fn after_response(&self, decision: &Decision, status: u16);
}

/// Logs every decision next to the response status that was sent.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDecisionHook;

impl DecisionHook for TracingDecisionHook {
    fn after_response(&self, decision: &Decision, status: u16) {
        if decision.allowed {
            info!(
                category = %decision.category,
                key = %decision.key,
                status = status,
                remaining = decision.remaining,
                backend = %decision.served_by,
                "Rate limited request completed"
            );
        } else {
            warn!(
                category = %decision.category,
                key = %decision.key,
                status = status,
                retry_after_secs = decision.retry_after_secs,
                backend = %decision.served_by,
                "Rate limited request rejected"
            );
        }
    }
}
