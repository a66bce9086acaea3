use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use linecast_core::{TokenError, TokenIssuer};
use metrics::counter;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const QUICK_PAIR_TTL: Duration = Duration::from_secs(15 * 60);

const SESSION_ID_LEN: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuickPairError {
    #[error("pairing session not found")]
    SessionNotFound,
    #[error("token was minted for a different session")]
    SidMismatch,
    #[error("pairing token expired")]
    TokenExpired,
    #[error("pairing token invalid")]
    InvalidToken,
}

impl QuickPairError {
    /// Stable machine-readable code clients branch on.
    pub fn code(&self) -> &'static str {
        match self {
            QuickPairError::SessionNotFound => "SESSION_NOT_FOUND",
            QuickPairError::SidMismatch => "SID_MISMATCH",
            QuickPairError::TokenExpired => "TOKEN_EXPIRED",
            QuickPairError::InvalidToken => "INVALID_TOKEN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuickPairStatus {
    Waiting,
    Paired,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickPairSession {
    pub sid: String,
    pub subject: String,
    pub status: QuickPairStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mobile_socket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor_socket: Option<String>,
    #[serde(
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub paired_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedQuickPair {
    pub sid: String,
    pub token: String,
    pub share_url: String,
    pub expires_in: u64,
}

struct QuickPairEntry {
    session: QuickPairSession,
    timer: JoinHandle<()>,
}

struct QuickPairInner {
    sessions: HashMap<String, QuickPairEntry>,
}

/// Link-based pairing: the relay mints a short session id plus a signed
/// token bound to it, and the pair travels to the display inside a
/// share URL. Unpaired sessions self-delete when the TTL elapses.
#[derive(Clone)]
pub struct QuickPairService {
    inner: Arc<Mutex<QuickPairInner>>,
    issuer: TokenIssuer,
    session_ttl: Duration,
    share_base: String,
}

impl QuickPairService {
    pub fn new(issuer: TokenIssuer, session_ttl: Duration, share_base: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QuickPairInner {
                sessions: HashMap::new(),
            })),
            issuer,
            session_ttl,
            share_base,
        }
    }

    /// Create a session and mint its token. The returned share URL
    /// carries both so scanning it is the entire handshake.
    pub fn create_session(&self, subject: &str) -> Result<CreatedQuickPair, TokenError> {
        let sid = generate_session_id();
        let token_ttl = time::Duration::seconds(self.session_ttl.as_secs() as i64);
        let token = self.issuer.mint_pairing_token(&sid, subject, token_ttl)?;

        let created_at = OffsetDateTime::now_utc();
        let session = QuickPairSession {
            sid: sid.clone(),
            subject: subject.to_string(),
            status: QuickPairStatus::Waiting,
            created_at,
            expires_at: created_at + self.session_ttl,
            mobile_socket: None,
            monitor_socket: None,
            paired_at: None,
        };

        let timer = self.spawn_deletion_timer(sid.clone());
        self.inner
            .lock()
            .sessions
            .insert(sid.clone(), QuickPairEntry { session, timer });
        counter!("linecast_quick_pair_sessions_created_total", 1);
        debug!(%sid, "quick pair session created");

        Ok(CreatedQuickPair {
            share_url: format!(
                "{}/pair?sid={}&t={}",
                self.share_base.trim_end_matches('/'),
                sid,
                token
            ),
            sid,
            token,
            expires_in: self.session_ttl.as_secs(),
        })
    }

    /// Check a presented token against the session it claims to belong
    /// to. Session existence is checked before the token so a caller
    /// cannot probe token validity against dead sessions.
    pub fn verify(&self, sid: &str, token: &str) -> Result<QuickPairSession, QuickPairError> {
        let session = {
            let guard = self.inner.lock();
            let entry = guard
                .sessions
                .get(sid)
                .ok_or(QuickPairError::SessionNotFound)?;
            if OffsetDateTime::now_utc() > entry.session.expires_at {
                return Err(QuickPairError::SessionNotFound);
            }
            entry.session.clone()
        };

        let claims = self.issuer.verify_pairing_token(token).map_err(|err| match err {
            TokenError::Expired => QuickPairError::TokenExpired,
            _ => QuickPairError::InvalidToken,
        })?;
        if claims.sid != sid {
            counter!("linecast_quick_pair_sid_mismatch_total", 1);
            return Err(QuickPairError::SidMismatch);
        }
        Ok(session)
    }

    /// Bind the socket ids onto the session. Last write wins: a second
    /// completion replaces the earlier binding rather than failing.
    pub fn complete_pairing(
        &self,
        sid: &str,
        mobile_socket: &str,
        monitor_socket: Option<&str>,
    ) -> Result<QuickPairSession, QuickPairError> {
        let now = OffsetDateTime::now_utc();
        let mut guard = self.inner.lock();
        let entry = guard
            .sessions
            .get_mut(sid)
            .ok_or(QuickPairError::SessionNotFound)?;
        if now > entry.session.expires_at {
            return Err(QuickPairError::SessionNotFound);
        }

        if let Some(previous) = entry.session.mobile_socket.replace(mobile_socket.to_string()) {
            if previous != mobile_socket {
                debug!(%sid, %previous, mobile_socket, "pairing rebound to a newer socket");
            }
        }
        if let Some(monitor_socket) = monitor_socket {
            entry.session.monitor_socket = Some(monitor_socket.to_string());
        }
        entry.session.paired_at = Some(now);
        entry.session.status = QuickPairStatus::Paired;
        counter!("linecast_quick_pair_completed_total", 1);
        info!(%sid, mobile_socket, monitor_socket, "quick pair completed");
        Ok(entry.session.clone())
    }

    /// Detach a disconnected socket from whichever session holds it,
    /// returning that session's id. Once the last socket detaches the
    /// whole session is deleted; the deletion timer of a paired
    /// session has already fired as a no-op, so nobody else will.
    pub fn remove_socket_from_session(&self, socket_id: &str) -> Option<String> {
        let mut guard = self.inner.lock();
        let mut detached: Option<String> = None;
        for (sid, entry) in guard.sessions.iter_mut() {
            let mut touched = false;
            if entry.session.mobile_socket.as_deref() == Some(socket_id) {
                entry.session.mobile_socket = None;
                touched = true;
            }
            if entry.session.monitor_socket.as_deref() == Some(socket_id) {
                entry.session.monitor_socket = None;
                touched = true;
            }
            if touched {
                debug!(socket_id, %sid, "socket detached from quick pair session");
                detached = Some(sid.clone());
                break;
            }
        }

        let sid = detached?;
        let empty = guard
            .sessions
            .get(&sid)
            .map(|entry| {
                entry.session.mobile_socket.is_none() && entry.session.monitor_socket.is_none()
            })
            .unwrap_or(false);
        if empty {
            if let Some(entry) = guard.sessions.remove(&sid) {
                entry.timer.abort();
                debug!(%sid, "quick pair session deleted, no sockets left");
            }
        }
        Some(sid)
    }

    /// Drop the session and cancel its deletion timer. Idempotent.
    pub fn release_session(&self, sid: &str) -> bool {
        let removed = self.inner.lock().sessions.remove(sid);
        match removed {
            Some(entry) => {
                entry.timer.abort();
                debug!(%sid, "quick pair session released");
                true
            }
            None => false,
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// One-shot deletion at TTL. Paired sessions are left alone; they
    /// live until released explicitly.
    fn spawn_deletion_timer(&self, sid: String) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let ttl = self.session_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let mut guard = inner.lock();
            let expired = matches!(
                guard.sessions.get(&sid),
                Some(entry) if entry.session.status != QuickPairStatus::Paired
            );
            if expired {
                guard.sessions.remove(&sid);
                counter!("linecast_quick_pair_sessions_expired_total", 1);
                warn!(%sid, "quick pair session expired unpaired");
            }
        })
    }
}

fn generate_session_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_ID_LEN)
        .map(|c| (c as char).to_ascii_uppercase())
        .collect()
}
