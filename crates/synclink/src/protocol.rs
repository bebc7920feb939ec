//! Wire envelopes and the text-frame codec.
//!
//! Messages are internally-tagged JSON (`{"type": "Connect", ...}`) with
//! camelCase field names. Two top-level enums cover the client-to-server and
//! server-to-client directions. Encoding and decoding are pure; a frame that
//! fails to decode is reported as [`ClientError::Malformed`] and must be
//! dropped by the caller, never escalated to a connection failure.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{ClientError, ClientResult},
    types::{FunctionResult, QueryId, RequestId},
};

// ---------------------------------------------------------------------------
// Client -> Server
// ---------------------------------------------------------------------------

/// Messages sent from the client to the sync endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Session handshake, sent first on every fresh socket.
    Connect {
        session_id: String,
        connection_count: u32,
        last_close_reason: Option<String>,
        client_ts: i64,
        max_observed_timestamp: Option<i64>,
    },

    /// Diff against the server's view of the query set.
    ModifyQuerySet {
        base_version: u32,
        new_version: u32,
        modifications: Vec<QuerySetModification>,
    },

    /// One-shot mutation call.
    Mutation {
        request_id: RequestId,
        udf_path: String,
        args: Vec<Value>,
    },

    /// One-shot action call.
    Action {
        request_id: RequestId,
        udf_path: String,
        args: Vec<Value>,
    },

    /// Install or clear the auth token for this connection.
    Authenticate { token: Option<String> },

    /// Client-side events; the only one this engine emits is the keepalive
    /// pong.
    Event {
        event_type: String,
        event: Value,
    },
}

impl ClientMessage {
    /// The keepalive reply to a server [`ServerMessage::Ping`].
    pub fn pong() -> Self {
        Self::Event {
            event_type: "Pong".to_string(),
            event: Value::Null,
        }
    }
}

/// One entry of a [`ClientMessage::ModifyQuerySet`] batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum QuerySetModification {
    Add {
        query_id: QueryId,
        udf_path: String,
        args: Vec<Value>,
    },
    Remove {
        query_id: QueryId,
    },
}

/// Wrap function arguments the way the wire requires: a single-element array,
/// never a bare object.
pub fn wrap_args(args: Value) -> Vec<Value> {
    vec![args]
}

// ---------------------------------------------------------------------------
// Server -> Client
// ---------------------------------------------------------------------------

/// Messages pushed from the sync endpoint to the client.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Query-set version advance with new values for affected queries.
    Transition {
        start_version: u32,
        end_version: u32,
        #[serde(default)]
        modifications: Vec<TransitionModification>,
    },

    /// Response to a [`ClientMessage::Mutation`].
    MutationResponse {
        request_id: RequestId,
        #[serde(default)]
        success: Option<bool>,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        ts: Option<i64>,
        #[serde(default)]
        error_data: Option<Value>,
        #[serde(default)]
        log_lines: Vec<String>,
    },

    /// Response to a [`ClientMessage::Action`].
    ActionResponse {
        request_id: RequestId,
        #[serde(default)]
        success: Option<bool>,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error_data: Option<Value>,
        #[serde(default)]
        log_lines: Vec<String>,
    },

    /// Keepalive probe; must be answered with a pong event immediately.
    Ping {},

    /// Non-recoverable protocol failure for this socket.
    FatalError { error: String },

    /// The server rejected the current auth token.
    AuthError { error: String },
}

/// New state of one query inside a [`ServerMessage::Transition`].
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransitionModification {
    pub query_id: QueryId,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_data: Option<Value>,
    #[serde(default)]
    pub log_lines: Vec<String>,
}

impl TransitionModification {
    /// Fold the value/error fields into one function result.
    pub fn function_result(&self) -> FunctionResult {
        match (&self.error_message, &self.error_data) {
            (Some(message), Some(data)) => FunctionResult::ErrorPayload {
                message: message.clone(),
                data: data.clone(),
            },
            (Some(message), None) => FunctionResult::ErrorMessage(message.clone()),
            (None, _) => FunctionResult::Value(self.value.clone().unwrap_or(Value::Null)),
        }
    }
}

/// Fold a mutation/action response into one function result.
///
/// `success` is absent on well-formed success responses from older servers, so
/// only an explicit `false` selects the error path, in which case `result`
/// carries the error message.
pub fn response_result(success: Option<bool>, result: Value, error_data: Option<Value>) -> FunctionResult {
    if success == Some(false) {
        let message = match result {
            Value::String(s) => s,
            other => other.to_string(),
        };
        match error_data {
            Some(data) => FunctionResult::ErrorPayload { message, data },
            None => FunctionResult::ErrorMessage(message),
        }
    } else {
        FunctionResult::Value(result)
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Serialize an outbound envelope to a text frame.
pub fn encode(message: &ClientMessage) -> ClientResult<String> {
    Ok(serde_json::to_string(message)?)
}

/// Parse an inbound text frame into an envelope.
pub fn decode(text: &str) -> ClientResult<ServerMessage> {
    serde_json::from_str(text).map_err(|e| ClientError::malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn encoded(message: &ClientMessage) -> Value {
        serde_json::from_str(&encode(message).unwrap()).unwrap()
    }

    #[test]
    fn test_connect_wire_shape() {
        let msg = ClientMessage::Connect {
            session_id: "01J0000000000000000000000".to_string(),
            connection_count: 1,
            last_close_reason: None,
            client_ts: 1700000000000,
            max_observed_timestamp: None,
        };
        assert_eq!(
            encoded(&msg),
            json!({
                "type": "Connect",
                "sessionId": "01J0000000000000000000000",
                "connectionCount": 1,
                "lastCloseReason": null,
                "clientTs": 1700000000000i64,
                "maxObservedTimestamp": null,
            })
        );
    }

    #[test]
    fn test_add_modification_wraps_args_in_single_element_array() {
        let msg = ClientMessage::ModifyQuerySet {
            base_version: 0,
            new_version: 1,
            modifications: vec![QuerySetModification::Add {
                query_id: QueryId::new(0),
                udf_path: "messages:list".to_string(),
                args: wrap_args(json!({})),
            }],
        };
        assert_eq!(
            encoded(&msg),
            json!({
                "type": "ModifyQuerySet",
                "baseVersion": 0,
                "newVersion": 1,
                "modifications": [
                    {"type": "Add", "queryId": 0, "udfPath": "messages:list", "args": [{}]}
                ],
            })
        );
    }

    #[test]
    fn test_mutation_wire_shape() {
        let msg = ClientMessage::Mutation {
            request_id: RequestId::next(),
            udf_path: "messages:send".to_string(),
            args: wrap_args(json!({"body": "hi"})),
        };
        let value = encoded(&msg);
        assert_eq!(value["type"], "Mutation");
        assert_eq!(value["udfPath"], "messages:send");
        // Integer correlation id, not a string.
        assert!(value["requestId"].is_u64());
        assert_eq!(value["args"], json!([{"body": "hi"}]));
    }

    #[test]
    fn test_pong_wire_shape() {
        assert_eq!(
            encoded(&ClientMessage::pong()),
            json!({"type": "Event", "eventType": "Pong", "event": null})
        );
    }

    #[test]
    fn test_decode_transition() {
        let msg = decode(
            r#"{"type":"Transition","startVersion":0,"endVersion":1,
                "modifications":[{"queryId":0,"value":[{"body":"hi"}],"logLines":["[LOG] x"]}]}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::Transition {
                start_version,
                end_version,
                modifications,
            } => {
                assert_eq!((start_version, end_version), (0, 1));
                assert_eq!(modifications.len(), 1);
                assert_eq!(
                    modifications[0].function_result(),
                    FunctionResult::Value(json!([{"body": "hi"}]))
                );
                assert_eq!(modifications[0].log_lines, vec!["[LOG] x"]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_decode_transition_error_modification() {
        let msg = decode(
            r#"{"type":"Transition","startVersion":3,"endVersion":4,
                "modifications":[{"queryId":2,"errorMessage":"boom","errorData":{"code":9}}]}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::Transition { modifications, .. } => {
                assert_eq!(
                    modifications[0].function_result(),
                    FunctionResult::ErrorPayload {
                        message: "boom".to_string(),
                        data: json!({"code": 9}),
                    }
                );
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_decode_mutation_response_success() {
        let msg = decode(
            r#"{"type":"MutationResponse","requestId":0,"result":{"ok":true},"ts":42,"logLines":[]}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::MutationResponse {
                success,
                result,
                ts,
                error_data,
                ..
            } => {
                assert_eq!(
                    response_result(success, result, error_data),
                    FunctionResult::Value(json!({"ok": true}))
                );
                assert_eq!(ts, Some(42));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_decode_mutation_response_failure() {
        let msg = decode(
            r#"{"type":"MutationResponse","requestId":7,"success":false,"result":"overdrawn"}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::MutationResponse {
                success,
                result,
                error_data,
                ..
            } => {
                assert_eq!(
                    response_result(success, result, error_data),
                    FunctionResult::ErrorMessage("overdrawn".to_string())
                );
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_decode_ping_and_errors() {
        assert_eq!(decode(r#"{"type":"Ping"}"#).unwrap(), ServerMessage::Ping {});
        assert_eq!(
            decode(r#"{"type":"FatalError","error":"shutting down"}"#).unwrap(),
            ServerMessage::FatalError {
                error: "shutting down".to_string()
            }
        );
        assert_eq!(
            decode(r#"{"type":"AuthError","error":"expired"}"#).unwrap(),
            ServerMessage::AuthError {
                error: "expired".to_string()
            }
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode("not json"),
            Err(ClientError::Malformed { .. })
        ));
        assert!(matches!(
            decode(r#"{"type":"NoSuchMessage"}"#),
            Err(ClientError::Malformed { .. })
        ));
    }
}
