//! Security alerts raised on suspicious denials.
//!
//! Raising an alert never blocks the decision path: sinks either log
//! synchronously or hand the alert off with a non-blocking send.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;
use uuid::Uuid;

use crate::ratelimit::Category;

/// Kind of alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// Repeated denials on a credential-bearing endpoint
    AuthRateLimitExceeded,
    /// Repeated denials elsewhere
    RateLimitExceeded,
}

impl AlertType {
    pub fn for_category(category: Category) -> Self {
        if category.is_security_sensitive() {
            AlertType::AuthRateLimitExceeded
        } else {
            AlertType::RateLimitExceeded
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::AuthRateLimitExceeded => "auth_rate_limit_exceeded",
            AlertType::RateLimitExceeded => "rate_limit_exceeded",
        }
    }
}

/// A security alert for an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityAlert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub category: Category,
    pub identity: String,
    pub total_hits: u64,
    pub timestamp: DateTime<Utc>,
}

impl SecurityAlert {
    pub fn new(
        category: Category,
        identity: impl Into<String>,
        total_hits: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_type: AlertType::for_category(category),
            category,
            identity: identity.into(),
            total_hits,
            timestamp,
        }
    }
}

/// Receives security alerts. Implementations must not block.
pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: SecurityAlert);
}

/// Writes alerts to the `security` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn raise(&self, alert: SecurityAlert) {
        counter!("floodgate_security_alerts_total", "type" => alert.alert_type.as_str()).increment(1);
        warn!(
            target: "security",
            alert_id = %alert.id,
            alert_type = alert.alert_type.as_str(),
            category = %alert.category,
            identity = %alert.identity,
            total_hits = alert.total_hits,
            timestamp = %alert.timestamp,
            "Security alert raised"
        );
    }
}

/// Forwards alerts into a bounded channel.
///
/// When the channel is full or closed the alert is dropped with a warning.
#[derive(Debug, Clone)]
pub struct ChannelAlertSink {
    tx: mpsc::Sender<SecurityAlert>,
}

impl ChannelAlertSink {
    /// Create a sink and the receiver an alert consumer should drain.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SecurityAlert>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl AlertSink for ChannelAlertSink {
    fn raise(&self, alert: SecurityAlert) {
        counter!("floodgate_security_alerts_total", "type" => alert.alert_type.as_str()).increment(1);
        if let Err(err) = self.tx.try_send(alert) {
            let dropped = match &err {
                TrySendError::Full(alert) | TrySendError::Closed(alert) => alert,
            };
            warn!(
                target: "security",
                alert_id = %dropped.id,
                identity = %dropped.identity,
                reason = %err,
                "Dropping security alert"
            );
        }
    }
}
