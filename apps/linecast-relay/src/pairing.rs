use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use linecast_core::{ChannelId, TokenIssuer};
use metrics::counter;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const QR_SESSION_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingStatus {
    Pending,
    Approved,
    Expired,
}

/// One QR pairing handshake. `token` is set if and only if the session
/// has been approved.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingSession {
    pub session_id: Uuid,
    pub code: String,
    pub status: PairingStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_id: Option<String>,
}

impl PairingSession {
    fn effective_status(&self, now: OffsetDateTime) -> PairingStatus {
        if now > self.expires_at {
            PairingStatus::Expired
        } else {
            self.status
        }
    }
}

/// Payload meant to be rendered as a scannable code.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QrPayload {
    pub session_id: Uuid,
    pub code: String,
    pub rendezvous_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedPairing {
    pub session_id: Uuid,
    pub code: String,
    pub qr_payload: QrPayload,
    pub expires_in: u64,
}

#[derive(Debug, Clone)]
pub struct ApprovedPairing {
    pub token: String,
    pub channel_id: ChannelId,
}

struct PairingEntry {
    session: PairingSession,
    /// One-shot wake signals for suspended pollers, keyed so a timed
    /// out poller can remove exactly its own entry.
    waiters: Vec<(u64, oneshot::Sender<PairingSession>)>,
}

struct CoordinatorInner {
    sessions: HashMap<Uuid, PairingEntry>,
    next_waiter_id: u64,
}

/// QR-code long-poll handshake: one party creates a session and polls
/// until another party approves it by presenting the matching code.
///
/// Expiry is decided by reading `expires_at`, never by a timer; the
/// sweeper only reclaims memory.
#[derive(Clone)]
pub struct PairingCoordinator {
    inner: Arc<Mutex<CoordinatorInner>>,
    issuer: TokenIssuer,
    session_ttl: Duration,
    token_ttl: time::Duration,
    rendezvous_base: String,
}

impl PairingCoordinator {
    pub fn new(
        issuer: TokenIssuer,
        session_ttl: Duration,
        token_ttl: time::Duration,
        rendezvous_base: String,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CoordinatorInner {
                sessions: HashMap::new(),
                next_waiter_id: 0,
            })),
            issuer,
            session_ttl,
            token_ttl,
            rendezvous_base,
        }
    }

    /// Create a pending session with a fresh id and 6-digit code.
    pub fn create_session(&self) -> CreatedPairing {
        let session_id = Uuid::new_v4();
        let code = generate_pairing_code();
        let created_at = OffsetDateTime::now_utc();
        let expires_at = created_at + self.session_ttl;
        let session = PairingSession {
            session_id,
            code: code.clone(),
            status: PairingStatus::Pending,
            created_at,
            expires_at,
            token: None,
            approved_by: None,
            device_id: None,
            org_id: None,
            line_id: None,
        };

        self.inner.lock().sessions.insert(
            session_id,
            PairingEntry {
                session,
                waiters: Vec::new(),
            },
        );
        counter!("linecast_qr_sessions_created_total", 1);
        debug!(%session_id, "qr pairing session created");

        CreatedPairing {
            session_id,
            code: code.clone(),
            qr_payload: QrPayload {
                session_id,
                code,
                rendezvous_url: format!(
                    "{}/pairing/qr/{}",
                    self.rendezvous_base.trim_end_matches('/'),
                    session_id
                ),
            },
            expires_in: self.session_ttl.as_secs(),
        }
    }

    /// Block the caller until the session is approved or `timeout`
    /// elapses. Only the calling task is suspended; other sessions'
    /// polls and approvals proceed concurrently.
    pub async fn poll(&self, session_id: Uuid, timeout: Duration) -> Option<PairingSession> {
        let (waiter_id, rx) = {
            let mut guard = self.inner.lock();
            let waiter_id = guard.next_waiter_id;
            guard.next_waiter_id += 1;

            let now = OffsetDateTime::now_utc();
            let entry = guard.sessions.get_mut(&session_id)?;
            match entry.session.effective_status(now) {
                PairingStatus::Expired => {
                    guard.sessions.remove(&session_id);
                    return None;
                }
                PairingStatus::Approved => return Some(entry.session.clone()),
                PairingStatus::Pending => {
                    let (tx, rx) = oneshot::channel();
                    entry.waiters.push((waiter_id, tx));
                    (waiter_id, rx)
                }
            }
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(session)) => Some(session),
            // Sender dropped: the session was reclaimed while we waited.
            Ok(Err(_)) => None,
            Err(_) => {
                // Deregister only our own waiter so an unrelated later
                // approval cannot wake a caller that already returned.
                let mut guard = self.inner.lock();
                if let Some(entry) = guard.sessions.get_mut(&session_id) {
                    entry.waiters.retain(|(id, _)| *id != waiter_id);
                }
                None
            }
        }
    }

    /// Approve a pending session, minting the channel token and waking
    /// every waiting poller exactly once. Returns `None` unless both
    /// id and code match a pending, unexpired session.
    pub fn approve(
        &self,
        session_id: Uuid,
        code: &str,
        approved_by: &str,
        device_id: &str,
        org_id: &str,
        line_id: &str,
    ) -> Option<ApprovedPairing> {
        let channel_id = match ChannelId::new(org_id, line_id) {
            Ok(channel_id) => channel_id,
            Err(err) => {
                warn!(%session_id, error = %err, "approve called with malformed channel parts");
                return None;
            }
        };

        let (waiters, approved) = {
            let mut guard = self.inner.lock();
            let now = OffsetDateTime::now_utc();
            let entry = guard.sessions.get_mut(&session_id)?;
            if entry.session.code != code {
                return None;
            }
            // The status check makes release one-shot: a second
            // approve finds the session no longer pending.
            if entry.session.effective_status(now) != PairingStatus::Pending {
                return None;
            }

            let token = match self.issuer.mint_channel_token(
                device_id,
                &channel_id,
                self.token_ttl,
            ) {
                Ok(token) => token,
                Err(err) => {
                    warn!(%session_id, error = %err, "failed to mint channel token");
                    return None;
                }
            };

            entry.session.status = PairingStatus::Approved;
            entry.session.token = Some(token.clone());
            entry.session.approved_by = Some(approved_by.to_string());
            entry.session.device_id = Some(device_id.to_string());
            entry.session.org_id = Some(org_id.to_string());
            entry.session.line_id = Some(line_id.to_string());

            let waiters = std::mem::take(&mut entry.waiters);
            let snapshot = entry.session.clone();
            (
                waiters,
                (snapshot, ApprovedPairing { token, channel_id }),
            )
        };

        let (snapshot, result) = approved;
        let woken = waiters.len();
        for (_, tx) in waiters {
            let _ = tx.send(snapshot.clone());
        }
        counter!("linecast_qr_sessions_approved_total", 1);
        info!(%session_id, woken, channel = %result.channel_id, "qr pairing approved");
        Some(result)
    }

    /// Physically remove expired rows. Pollers on a removed session
    /// observe a dropped sender and return `None`; correctness never
    /// depends on this running.
    pub fn sweep_expired(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let mut guard = self.inner.lock();
        let before = guard.sessions.len();
        guard
            .sessions
            .retain(|_, entry| now <= entry.session.expires_at);
        let removed = before - guard.sessions.len();
        if removed > 0 {
            counter!("linecast_qr_sessions_swept_total", removed as u64);
            debug!(removed, "expired qr pairing sessions reclaimed");
        }
        removed
    }

    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let _ = coordinator.sweep_expired();
            }
        })
    }
}

fn generate_pairing_code() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32))
}

#[cfg(test)]
impl PairingCoordinator {
    fn waiter_count(&self, session_id: Uuid) -> usize {
        self.inner
            .lock()
            .sessions
            .get(&session_id)
            .map(|entry| entry.waiters.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> PairingCoordinator {
        PairingCoordinator::new(
            TokenIssuer::new(b"pairing-test-secret"),
            QR_SESSION_TTL,
            time::Duration::days(30),
            "https://relay.example".to_string(),
        )
    }

    fn approve_created(
        coordinator: &PairingCoordinator,
        created: &CreatedPairing,
    ) -> Option<ApprovedPairing> {
        coordinator.approve(
            created.session_id,
            &created.code,
            "user-1",
            "dev-1",
            "org-1",
            "line-1",
        )
    }

    #[test]
    fn created_session_has_scannable_payload() {
        let coordinator = coordinator();
        let created = coordinator.create_session();
        assert_eq!(created.code.len(), 6);
        assert!(created.code.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(created.expires_in, 300);
        assert_eq!(
            created.qr_payload.rendezvous_url,
            format!("https://relay.example/pairing/qr/{}", created.session_id)
        );
    }

    #[tokio::test]
    async fn poll_unknown_session_returns_none_immediately() {
        let coordinator = coordinator();
        assert!(coordinator
            .poll(Uuid::new_v4(), Duration::from_secs(30))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn poll_after_approval_returns_immediately() {
        let coordinator = coordinator();
        let created = coordinator.create_session();
        let approved = approve_created(&coordinator, &created).unwrap();
        assert_eq!(approved.channel_id.as_str(), "org-1:line-1");

        let session = coordinator
            .poll(created.session_id, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(session.status, PairingStatus::Approved);
        assert_eq!(session.token.as_deref(), Some(approved.token.as_str()));
        assert_eq!(session.approved_by.as_deref(), Some("user-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn approval_wakes_every_concurrent_poller() {
        let coordinator = coordinator();
        let created = coordinator.create_session();
        let approver = coordinator.clone();
        let session_id = created.session_id;
        let code = created.code.clone();

        let poll_a = coordinator.poll(session_id, Duration::from_secs(2));
        let poll_b = coordinator.poll(session_id, Duration::from_secs(2));
        let approve = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            approver
                .approve(session_id, &code, "user-1", "dev-1", "org-1", "line-1")
                .expect("session should approve")
        };

        let (a, b, approved) = tokio::join!(poll_a, poll_b, approve);
        let a = a.expect("first poller woken");
        let b = b.expect("second poller woken");
        assert_eq!(a.status, PairingStatus::Approved);
        assert_eq!(b.status, PairingStatus::Approved);
        assert_eq!(a.token.as_deref(), Some(approved.token.as_str()));
        assert_eq!(b.token.as_deref(), Some(approved.token.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_poller_leaves_no_residual_waiter() {
        let coordinator = coordinator();
        let created = coordinator.create_session();

        let result = coordinator
            .poll(created.session_id, Duration::from_millis(500))
            .await;
        assert!(result.is_none());
        assert_eq!(coordinator.waiter_count(created.session_id), 0);
    }

    #[tokio::test]
    async fn approval_is_one_shot() {
        let coordinator = coordinator();
        let created = coordinator.create_session();
        assert!(approve_created(&coordinator, &created).is_some());
        assert!(approve_created(&coordinator, &created).is_none());
    }

    #[tokio::test]
    async fn wrong_code_does_not_approve() {
        let coordinator = coordinator();
        let created = coordinator.create_session();
        assert!(coordinator
            .approve(created.session_id, "000000x", "u", "d", "o", "l")
            .is_none());
        // Still pending; the right code works afterwards.
        assert!(approve_created(&coordinator, &created).is_some());
    }

    #[tokio::test]
    async fn expired_session_is_absent_to_readers() {
        let coordinator = PairingCoordinator::new(
            TokenIssuer::new(b"pairing-test-secret"),
            Duration::ZERO,
            time::Duration::days(30),
            "https://relay.example".to_string(),
        );
        let created = coordinator.create_session();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(coordinator
            .poll(created.session_id, Duration::from_secs(1))
            .await
            .is_none());
        assert!(approve_created(&coordinator, &created).is_none());
    }

    #[tokio::test]
    async fn sweeper_reclaims_expired_rows() {
        let coordinator = PairingCoordinator::new(
            TokenIssuer::new(b"pairing-test-secret"),
            Duration::ZERO,
            time::Duration::days(30),
            "https://relay.example".to_string(),
        );
        let _created = coordinator.create_session();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(coordinator.sweep_expired(), 1);
        assert_eq!(coordinator.sweep_expired(), 0);
    }
}
