//! Wire messages exchanged with clients.
//!
//! Inbound frames are JSON objects deserialized into [`Request`]. Every field
//! except `type` is optional at this level; each operation checks for what
//! it needs and answers with an error envelope when something is missing.
//! Outbound frames are [`Response`] envelopes, change notifications (see
//! `subscription`) or the bare parse-failure object.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::types::{ColumnDef, ConflictPolicy, MessageType, QueueOp, Row, SubscribeMode};
use crate::Error;

/// Sent verbatim when a frame is not a valid request.
pub const INVALID_QUERY_FORMAT: &str = "Invalid Query format";

/// An inbound message.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[serde(rename = "type", default)]
    pub kind: MessageType,
    pub method: Option<String>,
    /// Falls back to the connection's handshake path when absent.
    pub route: Option<String>,
    pub data: Option<Vec<Row>>,
    pub columns: Option<Vec<ColumnDef>>,
    pub on_conflict: Option<ConflictPolicy>,

    // subscribe
    pub mode: Option<SubscribeMode>,
    /// Poll interval in milliseconds.
    pub interval: Option<u64>,
    /// Poll lifetime in milliseconds.
    pub timeout: Option<u64>,
    #[serde(default)]
    pub throw_on_error: bool,

    /// Lifetime of inserted rows in milliseconds.
    pub ttl: Option<u64>,

    // queue
    pub op: Option<QueueOp>,
    pub topic: Option<String>,
    pub payload: Option<Value>,
    pub priority: Option<i64>,
    pub id: Option<String>,
    pub reason: Option<String>,
    pub claimant: Option<String>,
}

impl Request {
    /// Parses a text frame.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Subscribe mode: explicit, else poll when an interval is given.
    pub fn subscribe_mode(&self) -> SubscribeMode {
        match (self.mode, self.interval) {
            (Some(mode), _) => mode,
            (None, Some(_)) => SubscribeMode::Poll,
            (None, None) => SubscribeMode::Register,
        }
    }
}

/// The `{success, data, error?}` envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub success: bool,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn from_error(err: &Error) -> Self {
        Self {
            success: false,
            data: json!({}),
            error: Some(err.to_string()),
        }
    }

    pub fn to_json(&self) -> String {
        // A struct of bool, Value and Option<String> always serializes.
        serde_json::to_string(self).unwrap_or_else(|_| parse_failure())
    }
}

impl From<crate::Result<Value>> for Response {
    fn from(result: crate::Result<Value>) -> Self {
        match result {
            Ok(data) => Response::ok(data),
            Err(e) => Response::from_error(&e),
        }
    }
}

/// `{"error":"Invalid Query format"}`.
pub fn parse_failure() -> String {
    json!({ "error": INVALID_QUERY_FORMAT }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Method;

    #[test]
    fn test_parse_query() {
        let req = Request::parse(
            r#"{"type":"query","method":"POST","route":"shop/orders","data":[{"id":1}],"onConflict":"IGNORE"}"#,
        )
        .unwrap();

        assert_eq!(req.kind, MessageType::Query);
        assert_eq!(Method::parse(req.method.as_deref().unwrap()).unwrap(), Method::Post);
        assert_eq!(req.data.unwrap()[0]["id"], 1);
        assert_eq!(req.on_conflict, Some(ConflictPolicy::Ignore));
    }

    #[test]
    fn test_type_defaults_to_query() {
        let req = Request::parse(r#"{"method":"GET","route":"shop"}"#).unwrap();
        assert_eq!(req.kind, MessageType::Query);
    }

    #[test]
    fn test_unknown_type_is_a_parse_failure() {
        assert!(Request::parse(r#"{"type":"gossip"}"#).is_err());
        assert!(Request::parse("not json").is_err());
        assert!(Request::parse("[1,2]").is_err());
    }

    #[test]
    fn test_subscribe_mode_default() {
        let poll = Request::parse(r#"{"type":"subscribe","interval":500,"throwOnError":true}"#).unwrap();
        assert_eq!(poll.subscribe_mode(), SubscribeMode::Poll);
        assert!(poll.throw_on_error);

        let register = Request::parse(r#"{"type":"subscribe"}"#).unwrap();
        assert_eq!(register.subscribe_mode(), SubscribeMode::Register);

        let explicit = Request::parse(r#"{"type":"subscribe","mode":"register","interval":5}"#).unwrap();
        assert_eq!(explicit.subscribe_mode(), SubscribeMode::Register);
    }

    #[test]
    fn test_response_shapes() {
        assert_eq!(Response::ok(json!([1])).to_json(), r#"{"success":true,"data":[1]}"#);

        let failed: Value = serde_json::from_str(&Response::from_error(&Error::EmptyPayload).to_json()).unwrap();
        assert_eq!(failed, Error::EmptyPayload.to_response());

        assert_eq!(parse_failure(), r#"{"error":"Invalid Query format"}"#);
    }
}
