use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One message in flight to a channel's subscribers.
///
/// This is exactly the wire shape displays receive; the relay never
/// persists it past delivery. `tx_id` is the deduplication key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub tx_id: String,
    pub channel_id: String,
    pub job_no: String,
    pub url: String,
    /// Creation time, epoch milliseconds.
    pub ts: i64,
    /// Expiry, epoch milliseconds.
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Messages sent from client to relay over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate the connection; must be the first message.
    #[serde(rename_all = "camelCase")]
    Auth {
        token: String,
        device_id: String,
        channel_id: String,
    },
    /// Heartbeat to keep the connection alive.
    Ping,
}

/// Control messages sent from relay to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledge successful authentication.
    #[serde(rename_all = "camelCase")]
    AuthSuccess {
        connection_id: String,
        device_id: String,
        channel_id: String,
    },
    /// Authentication failed; the connection will be closed.
    AuthError { reason: String },
    /// Another connection claimed this device identity.
    Replaced,
    /// The authentication deadline elapsed.
    AuthTimeout,
    /// Response to ping.
    Pong,
    /// Error message.
    Error { message: String },
}

/// What travels down a connection's outbound queue.
///
/// Envelopes serialize as their own wire object (`type: "navigate"`),
/// not wrapped in a control frame, so the two are kept apart until the
/// forward task renders them.
#[derive(Debug, Clone)]
pub enum Outbound {
    Control(ServerMessage),
    Event(Envelope),
}

impl Outbound {
    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            Outbound::Control(msg) => serde_json::to_string(msg),
            Outbound::Event(envelope) => serde_json::to_string(envelope),
        }
    }

    /// True for control frames after which the connection must close.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            Outbound::Control(ServerMessage::Replaced)
                | Outbound::Control(ServerMessage::AuthTimeout)
                | Outbound::Control(ServerMessage::AuthError { .. })
        )
    }
}

/// Generate a unique connection ID.
pub fn generate_connection_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_to_wire_shape() {
        let envelope = Envelope {
            event_type: "navigate".to_string(),
            tx_id: "tx-1".to_string(),
            channel_id: "acme:line-1".to_string(),
            job_no: "JOB-42".to_string(),
            url: "https://relay.example/jobs/JOB-42".to_string(),
            ts: 1_700_000_000_000,
            exp: 1_700_000_060_000,
            metadata: None,
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&envelope).unwrap()).unwrap();
        assert_eq!(value["type"], "navigate");
        assert_eq!(value["txId"], "tx-1");
        assert_eq!(value["channelId"], "acme:line-1");
        assert_eq!(value["jobNo"], "JOB-42");
        assert!(value.get("metadata").is_none());
    }

    #[test]
    fn auth_message_parses_camel_case_credential() {
        let raw = r#"{"type":"auth","token":"t","deviceId":"dev-1","channelId":"acme:line-1"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::Auth {
                device_id,
                channel_id,
                ..
            } => {
                assert_eq!(device_id, "dev-1");
                assert_eq!(channel_id, "acme:line-1");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn close_frames_are_flagged() {
        assert!(Outbound::Control(ServerMessage::Replaced).closes_connection());
        assert!(Outbound::Control(ServerMessage::AuthTimeout).closes_connection());
        assert!(!Outbound::Control(ServerMessage::Pong).closes_connection());
    }
}
