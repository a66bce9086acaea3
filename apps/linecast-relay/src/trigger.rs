use std::sync::Arc;

use metrics::counter;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broadcast::{ChannelBroadcaster, DeliveryResult};
use crate::protocol::Envelope;

/// How long a navigate event stays actionable on the display side.
pub const NAVIGATE_TTL_MS: i64 = 60_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    pub channel_id: String,
    pub job_no: String,
    /// Client-supplied id for idempotent retries; minted when absent.
    #[serde(default)]
    pub tx_id: Option<String>,
    #[serde(default)]
    pub requested_by: Option<String>,
    #[serde(default)]
    pub source_ip: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Delivered,
    Duplicate,
    NoClients,
    Invalid,
}

impl TriggerStatus {
    /// Why nothing reached a display; `None` for the delivered case.
    fn miss_reason(&self) -> Option<&'static str> {
        match self {
            TriggerStatus::Delivered => None,
            TriggerStatus::Duplicate => Some("duplicate"),
            TriggerStatus::NoClients => Some("no_clients"),
            TriggerStatus::Invalid => Some("error"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerOutcome {
    pub tx_id: String,
    pub status: TriggerStatus,
    pub delivered: usize,
}

/// One row per trigger call, regardless of outcome. `outcome` is
/// `delivered` or `missed`; `reason` carries the detail for misses.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub tx_id: String,
    pub channel_id: String,
    pub job_no: String,
    pub outcome: &'static str,
    pub reason: Option<&'static str>,
    pub delivered: usize,
    pub requested_by: Option<String>,
    pub source_ip: Option<String>,
    pub at: OffsetDateTime,
}

pub trait AuditLog: Send + Sync {
    fn record(&self, entry: AuditEntry) -> anyhow::Result<()>;
}

/// Audit sink that writes structured log lines under the `audit` target.
pub struct TracingAuditLog;

impl AuditLog for TracingAuditLog {
    fn record(&self, entry: AuditEntry) -> anyhow::Result<()> {
        info!(
            target: "audit",
            tx_id = %entry.tx_id,
            channel = %entry.channel_id,
            job_no = %entry.job_no,
            outcome = entry.outcome,
            reason = entry.reason.unwrap_or("-"),
            delivered = entry.delivered,
            requested_by = entry.requested_by.as_deref().unwrap_or("-"),
            source_ip = entry.source_ip.as_deref().unwrap_or("-"),
            "trigger",
        );
        Ok(())
    }
}

/// Turns a trigger request into a navigate event on the wire: mints the
/// transaction id, derives the target URL from the job number, stamps
/// the expiry window, publishes, and records the outcome. Auditing is
/// best effort; a failing sink never fails the trigger itself.
#[derive(Clone)]
pub struct TriggerOrchestrator {
    broadcaster: ChannelBroadcaster,
    audit: Arc<dyn AuditLog>,
    public_url: String,
}

impl TriggerOrchestrator {
    pub fn new(broadcaster: ChannelBroadcaster, audit: Arc<dyn AuditLog>, public_url: String) -> Self {
        Self {
            broadcaster,
            audit,
            public_url,
        }
    }

    fn job_url(&self, job_no: &str) -> String {
        format!("{}/jobs/{}", self.public_url.trim_end_matches('/'), job_no)
    }

    pub fn trigger(&self, request: TriggerRequest) -> TriggerOutcome {
        let tx_id = request
            .tx_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = OffsetDateTime::now_utc();

        let status;
        let delivered;
        if request.channel_id.trim().is_empty() || request.job_no.trim().is_empty() {
            status = TriggerStatus::Invalid;
            delivered = 0;
        } else {
            let now_ms = (now.unix_timestamp_nanos() / 1_000_000) as i64;
            let envelope = Envelope {
                event_type: "navigate".to_string(),
                tx_id: tx_id.clone(),
                channel_id: request.channel_id.clone(),
                job_no: request.job_no.clone(),
                url: self.job_url(&request.job_no),
                ts: now_ms,
                exp: now_ms + NAVIGATE_TTL_MS,
                metadata: request.metadata.clone(),
            };
            match self.broadcaster.publish(&request.channel_id, envelope) {
                DeliveryResult::Delivered(count) => {
                    status = TriggerStatus::Delivered;
                    delivered = count;
                }
                DeliveryResult::Duplicate => {
                    status = TriggerStatus::Duplicate;
                    delivered = 0;
                }
                DeliveryResult::NoSubscribers => {
                    status = TriggerStatus::NoClients;
                    delivered = 0;
                }
                DeliveryResult::InvalidInput => {
                    status = TriggerStatus::Invalid;
                    delivered = 0;
                }
            }
        }
        let reason = status.miss_reason();
        counter!(
            "linecast_triggers_total", 1,
            "outcome" => reason.unwrap_or("delivered")
        );

        let entry = AuditEntry {
            tx_id: tx_id.clone(),
            channel_id: request.channel_id,
            job_no: request.job_no,
            outcome: if reason.is_none() { "delivered" } else { "missed" },
            reason,
            delivered,
            requested_by: request.requested_by,
            source_ip: request.source_ip,
            at: now,
        };
        if let Err(err) = self.audit.record(entry) {
            counter!("linecast_audit_failures_total", 1);
            warn!(%tx_id, error = %err, "audit write failed");
        }

        TriggerOutcome {
            tx_id,
            status,
            delivered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::DEFAULT_DEDUPE_WINDOW;
    use linecast_core::ChannelId;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    const BASE_URL: &str = "https://relay.example";

    struct MemoryAuditLog {
        entries: Mutex<Vec<AuditEntry>>,
    }

    impl MemoryAuditLog {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                entries: Mutex::new(Vec::new()),
            })
        }

        fn entries(&self) -> Vec<AuditEntry> {
            self.entries.lock().clone()
        }
    }

    impl AuditLog for MemoryAuditLog {
        fn record(&self, entry: AuditEntry) -> anyhow::Result<()> {
            self.entries.lock().push(entry);
            Ok(())
        }
    }

    struct FailingAuditLog;

    impl AuditLog for FailingAuditLog {
        fn record(&self, _entry: AuditEntry) -> anyhow::Result<()> {
            anyhow::bail!("sink unavailable")
        }
    }

    fn request(channel: &str) -> TriggerRequest {
        TriggerRequest {
            channel_id: channel.to_string(),
            job_no: "JOB-42".to_string(),
            tx_id: None,
            requested_by: Some("scanner-1".to_string()),
            source_ip: Some("10.0.0.7".to_string()),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn trigger_delivers_a_constructed_url_and_audits() {
        let broadcaster = ChannelBroadcaster::new(DEFAULT_DEDUPE_WINDOW);
        let channel = ChannelId::new("acme", "line-1").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broadcaster.subscribe("conn-1", &channel, tx);

        let audit = MemoryAuditLog::new();
        let orchestrator = TriggerOrchestrator::new(
            broadcaster,
            Arc::clone(&audit) as Arc<dyn AuditLog>,
            BASE_URL.to_string(),
        );

        let outcome = orchestrator.trigger(request("acme:line-1"));
        assert_eq!(outcome.status, TriggerStatus::Delivered);
        assert_eq!(outcome.delivered, 1);

        let received = rx.recv().await.unwrap();
        match received {
            crate::protocol::Outbound::Event(envelope) => {
                assert_eq!(envelope.tx_id, outcome.tx_id);
                assert_eq!(envelope.event_type, "navigate");
                assert_eq!(envelope.url, "https://relay.example/jobs/JOB-42");
                assert_eq!(envelope.exp - envelope.ts, NAVIGATE_TTL_MS);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let entries = audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, "delivered");
        assert_eq!(entries[0].reason, None);
        assert_eq!(entries[0].delivered, 1);
        assert_eq!(entries[0].source_ip.as_deref(), Some("10.0.0.7"));
    }

    #[tokio::test]
    async fn every_outcome_writes_exactly_one_audit_row() {
        let broadcaster = ChannelBroadcaster::new(DEFAULT_DEDUPE_WINDOW);
        let audit = MemoryAuditLog::new();
        let orchestrator = TriggerOrchestrator::new(
            broadcaster.clone(),
            Arc::clone(&audit) as Arc<dyn AuditLog>,
            BASE_URL.to_string(),
        );

        // No subscribers yet.
        let outcome = orchestrator.trigger(request("acme:line-1"));
        assert_eq!(outcome.status, TriggerStatus::NoClients);

        // Invalid input, rejected before it reaches the broadcaster.
        let mut bad = request("acme:line-1");
        bad.job_no = "  ".to_string();
        assert_eq!(orchestrator.trigger(bad).status, TriggerStatus::Invalid);

        // Duplicate of an explicit transaction id.
        let channel = ChannelId::new("acme", "line-1").unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        broadcaster.subscribe("conn-1", &channel, tx);
        let mut retry = request("acme:line-1");
        retry.tx_id = Some("tx-retry".to_string());
        assert_eq!(
            orchestrator.trigger(retry.clone()).status,
            TriggerStatus::Delivered
        );
        assert_eq!(orchestrator.trigger(retry).status, TriggerStatus::Duplicate);

        let entries = audit.entries();
        let outcomes: Vec<&'static str> = entries.iter().map(|entry| entry.outcome).collect();
        let reasons: Vec<Option<&'static str>> =
            entries.iter().map(|entry| entry.reason).collect();
        assert_eq!(outcomes, vec!["missed", "missed", "delivered", "missed"]);
        assert_eq!(
            reasons,
            vec![Some("no_clients"), Some("error"), None, Some("duplicate")]
        );
    }

    #[tokio::test]
    async fn audit_failure_never_fails_the_trigger() {
        let broadcaster = ChannelBroadcaster::new(DEFAULT_DEDUPE_WINDOW);
        let channel = ChannelId::new("acme", "line-1").unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        broadcaster.subscribe("conn-1", &channel, tx);

        let orchestrator = TriggerOrchestrator::new(
            broadcaster,
            Arc::new(FailingAuditLog),
            BASE_URL.to_string(),
        );
        let outcome = orchestrator.trigger(request("acme:line-1"));
        assert_eq!(outcome.status, TriggerStatus::Delivered);
        assert_eq!(outcome.delivered, 1);
    }

    #[tokio::test]
    async fn caller_supplied_tx_id_is_preserved() {
        let broadcaster = ChannelBroadcaster::new(DEFAULT_DEDUPE_WINDOW);
        let orchestrator =
            TriggerOrchestrator::new(broadcaster, MemoryAuditLog::new(), BASE_URL.to_string());

        let mut req = request("acme:line-1");
        req.tx_id = Some("tx-fixed".to_string());
        assert_eq!(orchestrator.trigger(req).tx_id, "tx-fixed");

        let minted = orchestrator.trigger(request("acme:line-1")).tx_id;
        assert!(Uuid::parse_str(&minted).is_ok());
    }
}
