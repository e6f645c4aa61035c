//! Gateway wire protocol
//!
//! JSON messages exchanged with the gateway over WebSocket. Every request
//! carries a transaction id; replies (`success`, `ack`, `error`) echo it, and
//! asynchronous notifications name the plugin handle they concern in `sender`.

use super::GatewayError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Session description exchanged with the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jsep {
    #[serde(rename = "type")]
    pub kind: JsepType,
    pub sdp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trickle: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsepType {
    Offer,
    Answer,
}

impl Jsep {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Jsep {
            kind: JsepType::Offer,
            sdp: sdp.into(),
            trickle: None,
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Jsep {
            kind: JsepType::Answer,
            sdp: sdp.into(),
            trickle: None,
        }
    }
}

/// Request verbs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Create,
    Attach,
    Message,
    Trickle,
    Hangup,
    Detach,
    Destroy,
    Keepalive,
}

/// Outgoing request; the transaction is filled in when it is sent
#[derive(Debug, Clone, Serialize)]
pub struct JanusRequest {
    pub janus: RequestKind,
    pub transaction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opaque_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsep: Option<Jsep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Value>,
}

impl JanusRequest {
    fn new(janus: RequestKind) -> Self {
        Self {
            janus,
            transaction: String::new(),
            session_id: None,
            handle_id: None,
            plugin: None,
            opaque_id: None,
            body: None,
            jsep: None,
            candidate: None,
        }
    }

    pub fn create() -> Self {
        Self::new(RequestKind::Create)
    }

    pub fn keepalive(session_id: u64) -> Self {
        Self {
            session_id: Some(session_id),
            ..Self::new(RequestKind::Keepalive)
        }
    }

    pub fn destroy(session_id: u64) -> Self {
        Self {
            session_id: Some(session_id),
            ..Self::new(RequestKind::Destroy)
        }
    }

    pub fn attach(session_id: u64, plugin: &str, opaque_id: &str) -> Self {
        Self {
            session_id: Some(session_id),
            plugin: Some(plugin.to_string()),
            opaque_id: Some(opaque_id.to_string()),
            ..Self::new(RequestKind::Attach)
        }
    }

    pub fn message(session_id: u64, handle_id: u64, body: Value, jsep: Option<Jsep>) -> Self {
        Self {
            session_id: Some(session_id),
            handle_id: Some(handle_id),
            body: Some(body),
            jsep,
            ..Self::new(RequestKind::Message)
        }
    }

    /// Trickle a local candidate; `None` signals end of candidates
    pub fn trickle(session_id: u64, handle_id: u64, candidate: Option<Value>) -> Self {
        let candidate = candidate.unwrap_or_else(|| serde_json::json!({ "completed": true }));
        Self {
            session_id: Some(session_id),
            handle_id: Some(handle_id),
            candidate: Some(candidate),
            ..Self::new(RequestKind::Trickle)
        }
    }

    pub fn hangup(session_id: u64, handle_id: u64) -> Self {
        Self {
            session_id: Some(session_id),
            handle_id: Some(handle_id),
            ..Self::new(RequestKind::Hangup)
        }
    }

    pub fn detach(session_id: u64, handle_id: u64) -> Self {
        Self {
            session_id: Some(session_id),
            handle_id: Some(handle_id),
            ..Self::new(RequestKind::Detach)
        }
    }

    pub fn with_transaction(mut self, transaction: impl Into<String>) -> Self {
        self.transaction = transaction.into();
        self
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, GatewayError> {
        serde_json::to_string(self)
            .map_err(|e| GatewayError::Protocol(format!("Failed to serialize request: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IdData {
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PluginData {
    pub plugin: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorBody {
    pub code: i64,
    #[serde(default)]
    pub reason: String,
}

/// Incoming message
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "janus", rename_all = "lowercase")]
pub enum JanusMessage {
    Success {
        #[serde(default)]
        transaction: Option<String>,
        #[serde(default)]
        data: Option<IdData>,
        #[serde(default)]
        plugindata: Option<PluginData>,
        #[serde(default)]
        sender: Option<u64>,
    },
    Ack {
        #[serde(default)]
        transaction: Option<String>,
    },
    Error {
        #[serde(default)]
        transaction: Option<String>,
        error: ErrorBody,
    },
    Event {
        #[serde(default)]
        transaction: Option<String>,
        sender: u64,
        plugindata: PluginData,
        #[serde(default)]
        jsep: Option<Jsep>,
    },
    Hangup {
        sender: u64,
        #[serde(default)]
        reason: Option<String>,
    },
    Detached {
        sender: u64,
    },
    Webrtcup {
        sender: u64,
    },
    Media {
        sender: u64,
        #[serde(rename = "type", default)]
        media_type: Option<String>,
        #[serde(default)]
        receiving: Option<bool>,
    },
    Slowlink {
        sender: u64,
        #[serde(default)]
        uplink: Option<bool>,
        #[serde(default)]
        lost: Option<u64>,
    },
    Trickle {
        sender: u64,
        candidate: Value,
    },
    Timeout {
        session_id: u64,
    },
    #[serde(other)]
    Unknown,
}

impl JanusMessage {
    /// Parse a message from JSON
    pub fn from_json(json: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(json)
            .map_err(|e| GatewayError::Protocol(format!("Invalid gateway message: {}", e)))
    }

    /// Transaction of a direct reply (`success`, `ack`, `error`)
    pub fn reply_transaction(&self) -> Option<&str> {
        match self {
            JanusMessage::Success { transaction, .. }
            | JanusMessage::Ack { transaction }
            | JanusMessage::Error { transaction, .. } => transaction.as_deref(),
            _ => None,
        }
    }

    /// Handle the notification is addressed to
    pub fn sender(&self) -> Option<u64> {
        match self {
            JanusMessage::Success { sender, .. } => *sender,
            JanusMessage::Event { sender, .. }
            | JanusMessage::Hangup { sender, .. }
            | JanusMessage::Detached { sender }
            | JanusMessage::Webrtcup { sender }
            | JanusMessage::Media { sender, .. }
            | JanusMessage::Slowlink { sender, .. }
            | JanusMessage::Trickle { sender, .. } => Some(*sender),
            _ => None,
        }
    }

    /// `data.id` of a `success` reply (session or handle id)
    pub fn created_id(&self) -> Result<u64, GatewayError> {
        match self {
            JanusMessage::Success { data: Some(data), .. } => Ok(data.id),
            other => Err(GatewayError::Protocol(format!(
                "Expected success with an id, got {:?}",
                other
            ))),
        }
    }
}

/// Fresh transaction id
pub fn new_transaction() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create_success() {
        let msg = JanusMessage::from_json(
            r#"{"janus":"success","transaction":"abc","data":{"id":8642}}"#,
        )
        .unwrap();
        assert_eq!(msg.reply_transaction(), Some("abc"));
        assert_eq!(msg.created_id().unwrap(), 8642);
    }

    #[test]
    fn test_parse_event_with_offer() {
        let json = r#"{
            "janus": "event",
            "session_id": 1,
            "sender": 77,
            "transaction": "t1",
            "plugindata": {
                "plugin": "janus.plugin.streaming",
                "data": {"streaming": "event", "result": {"status": "preparing"}}
            },
            "jsep": {"type": "offer", "sdp": "v=0\r\n"}
        }"#;
        let msg = JanusMessage::from_json(json).unwrap();
        assert_eq!(msg.sender(), Some(77));
        // events are never treated as direct replies
        assert_eq!(msg.reply_transaction(), None);
        match msg {
            JanusMessage::Event { plugindata, jsep, .. } => {
                assert_eq!(plugindata.data["result"]["status"], "preparing");
                assert_eq!(jsep.unwrap().kind, JsepType::Offer);
            }
            _ => panic!("Expected Event"),
        }
    }

    #[test]
    fn test_parse_error_reply() {
        let msg = JanusMessage::from_json(
            r#"{"janus":"error","transaction":"x","error":{"code":458,"reason":"No such session 1"}}"#,
        )
        .unwrap();
        match msg {
            JanusMessage::Error { error, .. } => assert_eq!(error.code, 458),
            _ => panic!("Expected Error"),
        }
    }

    #[test]
    fn test_unknown_kind_is_tolerated() {
        let msg = JanusMessage::from_json(r#"{"janus":"server_info","name":"x"}"#).unwrap();
        assert_eq!(msg, JanusMessage::Unknown);
    }

    #[test]
    fn test_message_request_serialization() {
        let req = JanusRequest::message(1, 2, serde_json::json!({"request": "watch", "id": 5}), None)
            .with_transaction("tx");
        let json = req.to_json().unwrap();
        assert!(json.contains(r#""janus":"message""#));
        assert!(json.contains(r#""handle_id":2"#));
        assert!(json.contains(r#""request":"watch""#));
        assert!(!json.contains("jsep"));
        assert!(!json.contains("plugin"));
    }

    #[test]
    fn test_trickle_completed() {
        let req = JanusRequest::trickle(1, 2, None);
        let json = req.to_json().unwrap();
        assert!(json.contains(r#""completed":true"#));
    }
}
