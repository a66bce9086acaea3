use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use linecast_core::{ChannelId, TokenIssuer};
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::protocol::{Outbound, ServerMessage};

/// Credential presented by a client when authenticating a connection.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub token: String,
    pub device_id: String,
    pub channel_id: String,
}

/// Identity bound onto a connection after successful authentication.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub connection_id: String,
    pub device_id: String,
    pub channel_id: ChannelId,
    #[serde(with = "time::serde::rfc3339")]
    pub authenticated_at: OffsetDateTime,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("required auth field missing or malformed")]
    InvalidPayload,
    #[error("token signature, expiry or scope check failed")]
    InvalidToken,
}

impl AuthError {
    /// Reason code clients branch on before the connection closes.
    pub fn reason_code(&self) -> &'static str {
        match self {
            AuthError::InvalidPayload => "invalid_payload",
            AuthError::InvalidToken => "invalid_token",
        }
    }
}

/// Lifecycle of a single connection. Removal from the registry is the
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Authenticated,
}

struct ConnectionEntry {
    phase: Phase,
    device_id: Option<String>,
    channel_id: Option<ChannelId>,
    authenticated_at: Option<OffsetDateTime>,
    tx: UnboundedSender<Outbound>,
    deadline: Option<JoinHandle<()>>,
}

struct RegistryInner {
    connections: HashMap<String, ConnectionEntry>,
    /// device id -> connection id currently holding it.
    device_owners: HashMap<String, String>,
}

/// Tracks which connection owns each device identity and enforces the
/// per-connection authentication deadline.
///
/// Both maps live behind one lock so evicting a stale holder and
/// admitting its replacement is a single logical step; nothing awaits
/// while the lock is held.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    issuer: TokenIssuer,
    auth_deadline: Duration,
}

impl ConnectionRegistry {
    pub fn new(issuer: TokenIssuer, auth_deadline: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                connections: HashMap::new(),
                device_owners: HashMap::new(),
            })),
            issuer,
            auth_deadline,
        }
    }

    /// Register a new, unauthenticated connection and start its
    /// authentication deadline. If the deadline elapses first, the
    /// connection is told why and dropped.
    pub fn admit(&self, connection_id: &str, tx: UnboundedSender<Outbound>) {
        let mut guard = self.inner.lock();
        guard.connections.insert(
            connection_id.to_string(),
            ConnectionEntry {
                phase: Phase::Connecting,
                device_id: None,
                channel_id: None,
                authenticated_at: None,
                tx,
                deadline: None,
            },
        );

        let inner = Arc::clone(&self.inner);
        let id = connection_id.to_string();
        let deadline = self.auth_deadline;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let mut guard = inner.lock();
            let unauthenticated = guard
                .connections
                .get(&id)
                .map(|entry| entry.phase != Phase::Authenticated)
                .unwrap_or(false);
            if unauthenticated {
                if let Some(entry) = guard.connections.remove(&id) {
                    let _ = entry.tx.send(Outbound::Control(ServerMessage::AuthTimeout));
                    counter!("linecast_auth_timeouts_total", 1);
                    info!(connection_id = %id, "authentication deadline elapsed");
                }
            }
        });
        if let Some(entry) = guard.connections.get_mut(connection_id) {
            entry.deadline = Some(handle);
        } else {
            handle.abort();
        }
        debug!(connection_id, "connection admitted");
    }

    /// Validate the credential, bind the identity onto the connection
    /// and evict any other live connection already holding the same
    /// device id. The evicted connection is notified before removal.
    pub fn authenticate(
        &self,
        connection_id: &str,
        request: &AuthRequest,
    ) -> Result<Identity, AuthError> {
        if request.token.trim().is_empty() || request.device_id.trim().is_empty() {
            return Err(AuthError::InvalidPayload);
        }
        let channel_id =
            ChannelId::parse(&request.channel_id).map_err(|_| AuthError::InvalidPayload)?;
        self.issuer
            .verify_channel_token(&request.token, &channel_id)
            .map_err(|err| {
                debug!(connection_id, error = %err, "token rejected");
                AuthError::InvalidToken
            })?;

        let authenticated_at = OffsetDateTime::now_utc();
        let mut guard = self.inner.lock();

        let entry = guard
            .connections
            .get_mut(connection_id)
            .ok_or(AuthError::InvalidPayload)?;
        if entry.phase == Phase::Authenticated {
            return Err(AuthError::InvalidPayload);
        }
        if let Some(handle) = entry.deadline.take() {
            handle.abort();
        }
        entry.phase = Phase::Authenticated;
        entry.device_id = Some(request.device_id.clone());
        entry.channel_id = Some(channel_id.clone());
        entry.authenticated_at = Some(authenticated_at);

        let previous = guard
            .device_owners
            .insert(request.device_id.clone(), connection_id.to_string());
        if let Some(previous_id) = previous.filter(|id| id != connection_id) {
            if let Some(old) = guard.connections.remove(&previous_id) {
                let _ = old.tx.send(Outbound::Control(ServerMessage::Replaced));
                if let Some(handle) = old.deadline {
                    handle.abort();
                }
                counter!("linecast_connections_replaced_total", 1);
                info!(
                    device_id = %request.device_id,
                    evicted = %previous_id,
                    replacement = %connection_id,
                    "stale connection evicted"
                );
            }
        }

        Ok(Identity {
            connection_id: connection_id.to_string(),
            device_id: request.device_id.clone(),
            channel_id,
            authenticated_at,
        })
    }

    /// Remove the connection and release its device identity.
    /// Idempotent; a second call for the same id is a no-op.
    pub fn on_disconnect(&self, connection_id: &str) {
        let mut guard = self.inner.lock();
        if let Some(entry) = guard.connections.remove(connection_id) {
            if let Some(handle) = entry.deadline {
                handle.abort();
            }
            if let Some(device_id) = entry.device_id {
                // Only release the identity if this connection still
                // holds it; an evicted connection must not unbind its
                // replacement.
                if guard.device_owners.get(&device_id).map(String::as_str)
                    == Some(connection_id)
                {
                    guard.device_owners.remove(&device_id);
                }
            }
            debug!(connection_id, "connection removed");
        }
    }

    /// Connection id currently holding `device_id`, if any.
    pub fn device_owner(&self, device_id: &str) -> Option<String> {
        self.inner.lock().device_owners.get(device_id).cloned()
    }

    pub fn phase(&self, connection_id: &str) -> Option<Phase> {
        self.inner
            .lock()
            .connections
            .get(connection_id)
            .map(|entry| entry.phase)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }
}
