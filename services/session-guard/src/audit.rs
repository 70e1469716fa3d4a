//! Security audit events
//!
//! Revocations, rotations and suspicious activity are reported to an
//! [`AuditSink`]. Recording is fire-and-forget: a failing sink is logged and
//! never changes an authentication outcome.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Kind of security event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SessionCreated,
    SessionRevoked,
    SessionsBulkRevoked,
    TokenBlacklisted,
    TokenRotated,
    RefreshTokenReused,
    SuspiciousActivity,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::SessionCreated => "session_created",
            AuditEventType::SessionRevoked => "session_revoked",
            AuditEventType::SessionsBulkRevoked => "sessions_bulk_revoked",
            AuditEventType::TokenBlacklisted => "token_blacklisted",
            AuditEventType::TokenRotated => "token_rotated",
            AuditEventType::RefreshTokenReused => "refresh_token_reused",
            AuditEventType::SuspiciousActivity => "suspicious_activity",
        }
    }
}

/// One structured audit record
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub subject_id: String,
    pub organization_id: Option<String>,
    pub details: BTreeMap<String, Value>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, subject_id: impl Into<String>) -> Self {
        Self {
            event_type,
            subject_id: subject_id.into(),
            organization_id: None,
            details: BTreeMap::new(),
        }
    }

    pub fn organization(mut self, organization_id: Option<&str>) -> Self {
        self.organization_id = organization_id.map(str::to_string);
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Destination for audit events
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> anyhow::Result<()>;
}

/// Writes audit events as structured log lines on the `audit` target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &AuditEvent) -> anyhow::Result<()> {
        let details = serde_json::to_string(&event.details)?;
        info!(
            target: "audit",
            event_type = event.event_type.as_str(),
            subject_id = %event.subject_id,
            organization_id = event.organization_id.as_deref().unwrap_or("-"),
            details = %details,
            "security event"
        );
        Ok(())
    }
}

/// Keeps every event in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    /// Events recorded so far
    ///
    /// Deliveries run on spawned tasks, so pending ones are given a chance to
    /// land before reading.
    pub async fn events(&self) -> Vec<AuditEvent> {
        settle().await;
        self.events.lock().await.clone()
    }

    pub async fn count(&self, event_type: AuditEventType) -> usize {
        settle().await;
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: &AuditEvent) -> anyhow::Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

/// Isolates callers from sink failures and slowness
///
/// Each event is handed to the sink on its own task, bounded by the timeout;
/// the caller never waits for delivery.
#[derive(Clone)]
pub struct Auditor {
    sink: Arc<dyn AuditSink>,
    timeout: Duration,
}

impl Auditor {
    pub fn new(sink: Arc<dyn AuditSink>, timeout_ms: u64) -> Self {
        Self {
            sink,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Queue an event for delivery. Must be called within a Tokio runtime.
    pub fn emit(&self, event: AuditEvent) -> JoinHandle<()> {
        let sink = self.sink.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, sink.record(&event)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    "Audit sink rejected {} event for {}: {}",
                    event.event_type.as_str(),
                    event.subject_id,
                    e
                ),
                Err(_) => warn!(
                    "Audit sink timed out recording {} event for {}",
                    event.event_type.as_str(),
                    event.subject_id
                ),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn record(&self, _event: &AuditEvent) -> anyhow::Result<()> {
            anyhow::bail!("sink offline")
        }
    }

    struct StalledSink;

    #[async_trait]
    impl AuditSink for StalledSink {
        async fn record(&self, _event: &AuditEvent) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn failing_sink_does_not_propagate() {
        let auditor = Auditor::new(Arc::new(FailingSink), 100);
        let delivery = auditor.emit(AuditEvent::new(AuditEventType::SessionRevoked, "42"));
        assert!(delivery.await.is_ok());
    }

    #[tokio::test]
    async fn stalled_sink_is_abandoned() {
        let auditor = Auditor::new(Arc::new(StalledSink), 20);
        let delivery = auditor.emit(AuditEvent::new(AuditEventType::TokenRotated, "42"));
        let finished = tokio::time::timeout(Duration::from_secs(2), delivery).await;
        assert!(matches!(finished, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn emit_returns_before_a_stalled_sink_records() {
        let auditor = Auditor::new(Arc::new(StalledSink), 10_000);
        let started = std::time::Instant::now();
        for _ in 0..10 {
            auditor.emit(AuditEvent::new(AuditEventType::SuspiciousActivity, "42"));
        }
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn memory_sink_keeps_details() {
        let sink = MemoryAuditSink::default();
        let auditor = Auditor::new(Arc::new(sink.clone()), 100);
        auditor.emit(
            AuditEvent::new(AuditEventType::SuspiciousActivity, "42")
                .organization(Some("acme"))
                .detail("ip_changed", true),
        );

        let events = sink.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].organization_id.as_deref(), Some("acme"));
        assert_eq!(events[0].details["ip_changed"], Value::Bool(true));
        assert_eq!(sink.count(AuditEventType::SuspiciousActivity).await, 1);
    }
}
