//! JSON-RPC 2.0 frames exchanged with the upstream feed.
//!
//! Outbound requests are `{jsonrpc, id, method, params}`. Inbound frames are either responses
//! correlated by `id` (`{jsonrpc, id, result|error}`) or notifications identified by `method`.

use crate::{
    asset::Channel,
    error::{MessageError, RATE_LIMIT_ERROR_CODE, RATE_LIMIT_MARKER},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use smol_str::SmolStr;

/// Reserved request id correlating the authentication response.
pub const AUTH_REQUEST_ID: u64 = 9929;

pub const JSONRPC_VERSION: &str = "2.0";

pub const METHOD_AUTH: &str = "public/auth";
pub const METHOD_SUBSCRIBE: &str = "public/subscribe";
pub const METHOD_SET_HEARTBEAT: &str = "public/set_heartbeat";
pub const METHOD_TEST: &str = "public/test";

const NOTIFICATION_SUBSCRIPTION: &str = "subscription";
const NOTIFICATION_HEARTBEAT: &str = "heartbeat";

/// Outbound JSON-RPC request.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: SmolStr,
    pub id: u64,
    pub method: SmolStr,
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: SmolStr::new_static(JSONRPC_VERSION),
            id,
            method: SmolStr::new(method),
            params,
        }
    }

    pub fn auth(params: Value) -> Self {
        Self::new(AUTH_REQUEST_ID, METHOD_AUTH, params)
    }

    pub fn subscribe(id: u64, channels: &[Channel]) -> Self {
        Self::new(id, METHOD_SUBSCRIBE, json!({ "channels": channels }))
    }

    pub fn set_heartbeat(id: u64, interval_secs: u64) -> Self {
        Self::new(id, METHOD_SET_HEARTBEAT, json!({ "interval": interval_secs }))
    }

    pub fn test(id: u64) -> Self {
        Self::new(id, METHOD_TEST, json!({}))
    }

    /// Serialise to a single-line JSON text frame.
    pub fn to_frame(&self) -> String {
        // Serialising a struct of strings, integers and a Value cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Allocates outbound request ids, never handing out [`AUTH_REQUEST_ID`].
#[derive(Debug, Clone)]
pub struct RequestIds {
    next: u64,
}

impl RequestIds {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next_id(&mut self) -> u64 {
        if self.next == AUTH_REQUEST_ID {
            self.next += 1;
        }
        let id = self.next;
        self.next = self.next.wrapping_add(1).max(1);
        id
    }
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}

/// JSON-RPC error object.
#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub struct RpcError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

impl RpcError {
    /// Determine if the error signals the upstream request rate limit.
    pub fn is_rate_limit(&self) -> bool {
        self.code == RATE_LIMIT_ERROR_CODE || self.message.contains(RATE_LIMIT_MARKER)
    }
}

/// Heartbeat notification kind.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum HeartbeatKind {
    /// Plain keep-alive, nothing to answer.
    Heartbeat,
    /// Server expects a `public/test` request in reply.
    TestRequest,
}

/// Decoded inbound frame.
#[derive(Clone, PartialEq, Debug)]
pub enum InboundMessage {
    Response {
        id: u64,
        outcome: Result<Value, RpcError>,
    },
    Subscription {
        channel: SmolStr,
        data: Value,
    },
    Heartbeat(HeartbeatKind),
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
    #[serde(default)]
    method: Option<SmolStr>,
    #[serde(default)]
    params: Option<Value>,
}

impl InboundMessage {
    /// Decode a raw text frame.
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let frame = serde_json::from_str::<RawFrame>(text)?;

        if let Some(id) = frame.id {
            let outcome = match (frame.error, frame.result) {
                (Some(error), _) => Err(error),
                (None, Some(result)) => Ok(result),
                (None, None) => return Err(MessageError::MissingField("result")),
            };
            return Ok(InboundMessage::Response { id, outcome });
        }

        match frame.method.as_deref() {
            Some(NOTIFICATION_SUBSCRIPTION) => {
                let mut params = frame.params.ok_or(MessageError::MissingField("params"))?;
                let channel = params
                    .get("channel")
                    .and_then(Value::as_str)
                    .map(SmolStr::new)
                    .ok_or(MessageError::MissingField("params.channel"))?;
                let data = params
                    .get_mut("data")
                    .map(Value::take)
                    .ok_or(MessageError::MissingField("params.data"))?;
                Ok(InboundMessage::Subscription { channel, data })
            }
            Some(NOTIFICATION_HEARTBEAT) => {
                let kind = frame
                    .params
                    .as_ref()
                    .and_then(|params| params.get("type"))
                    .and_then(Value::as_str);
                match kind {
                    Some("test_request") => Ok(InboundMessage::Heartbeat(HeartbeatKind::TestRequest)),
                    _ => Ok(InboundMessage::Heartbeat(HeartbeatKind::Heartbeat)),
                }
            }
            Some(other) => Err(MessageError::Unrecognised(other.to_string())),
            None => Err(MessageError::MissingField("id|method")),
        }
    }
}

/// Price field of a ticker notification fed into the estimator.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceField {
    #[default]
    MarkPrice,
    LastPrice,
    IndexPrice,
}

impl PriceField {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceField::MarkPrice => "mark_price",
            PriceField::LastPrice => "last_price",
            PriceField::IndexPrice => "index_price",
        }
    }

    /// Extract this field from a ticker notification payload.
    ///
    /// Only presence & numeric type are checked here, price validity is enforced at ingestion.
    pub fn extract(&self, data: &Value) -> Result<f64, MessageError> {
        data.get(self.as_str())
            .and_then(Value::as_f64)
            .ok_or(MessageError::MissingField(self.as_str()))
    }
}

impl std::str::FromStr for PriceField {
    type Err = crate::error::ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "mark_price" => Ok(PriceField::MarkPrice),
            "last_price" => Ok(PriceField::LastPrice),
            "index_price" => Ok(PriceField::IndexPrice),
            other => Err(crate::error::ConfigError::InvalidValue {
                key: "price_field",
                value: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frames() {
        let channels = vec![Channel(SmolStr::new("ticker.BTC-PERPETUAL.raw"))];
        let frame = JsonRpcRequest::subscribe(43, &channels).to_frame();

        assert!(!frame.contains('\n'));
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "jsonrpc": "2.0",
                "id": 43,
                "method": "public/subscribe",
                "params": { "channels": ["ticker.BTC-PERPETUAL.raw"] }
            })
        );

        let auth = JsonRpcRequest::auth(json!({ "grant_type": "client_credentials" }));
        assert_eq!(auth.id, AUTH_REQUEST_ID);
        assert_eq!(auth.method, METHOD_AUTH);
    }

    #[test]
    fn test_request_ids_skip_reserved_auth_id() {
        let mut ids = RequestIds { next: AUTH_REQUEST_ID - 1 };
        assert_eq!(ids.next_id(), AUTH_REQUEST_ID - 1);
        assert_eq!(ids.next_id(), AUTH_REQUEST_ID + 1);
        assert_eq!(ids.next_id(), AUTH_REQUEST_ID + 2);
    }

    #[test]
    fn test_parse_inbound_frames() {
        struct TestCase {
            input: &'static str,
            expected: Result<InboundMessage, MessageError>,
        }

        let tests = vec![
            TestCase {
                // TC0: auth success response
                input: r#"{"jsonrpc":"2.0","id":9929,"result":{"access_token":"abc"}}"#,
                expected: Ok(InboundMessage::Response {
                    id: 9929,
                    outcome: Ok(json!({"access_token": "abc"})),
                }),
            },
            TestCase {
                // TC1: error response
                input: r#"{"jsonrpc":"2.0","id":7,"error":{"code":10028,"message":"too_many_requests"}}"#,
                expected: Ok(InboundMessage::Response {
                    id: 7,
                    outcome: Err(RpcError {
                        code: 10028,
                        message: "too_many_requests".to_string(),
                    }),
                }),
            },
            TestCase {
                // TC2: ticker notification
                input: r#"{"jsonrpc":"2.0","method":"subscription","params":{"channel":"ticker.BTC-PERPETUAL.raw","data":{"mark_price":64000.5,"timestamp":1}}}"#,
                expected: Ok(InboundMessage::Subscription {
                    channel: SmolStr::new("ticker.BTC-PERPETUAL.raw"),
                    data: json!({"mark_price": 64000.5, "timestamp": 1}),
                }),
            },
            TestCase {
                // TC3: heartbeat test request
                input: r#"{"jsonrpc":"2.0","method":"heartbeat","params":{"type":"test_request"}}"#,
                expected: Ok(InboundMessage::Heartbeat(HeartbeatKind::TestRequest)),
            },
            TestCase {
                // TC4: notification missing data
                input: r#"{"jsonrpc":"2.0","method":"subscription","params":{"channel":"x"}}"#,
                expected: Err(MessageError::MissingField("params.data")),
            },
            TestCase {
                // TC5: response without result or error
                input: r#"{"jsonrpc":"2.0","id":3}"#,
                expected: Err(MessageError::MissingField("result")),
            },
            TestCase {
                // TC6: unknown notification method
                input: r#"{"jsonrpc":"2.0","method":"announcements","params":{}}"#,
                expected: Err(MessageError::Unrecognised("announcements".to_string())),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = InboundMessage::parse(test.input);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }

        assert!(matches!(
            InboundMessage::parse("not json"),
            Err(MessageError::Json(_))
        ));
    }

    #[test]
    fn test_rpc_error_is_rate_limit() {
        let by_code = RpcError {
            code: RATE_LIMIT_ERROR_CODE,
            message: String::new(),
        };
        let by_message = RpcError {
            code: -32000,
            message: "too_many_requests".to_string(),
        };
        let other = RpcError {
            code: 13009,
            message: "unauthorized".to_string(),
        };
        assert!(by_code.is_rate_limit());
        assert!(by_message.is_rate_limit());
        assert!(!other.is_rate_limit());
    }

    #[test]
    fn test_price_field_extract() {
        let data = json!({"mark_price": 100.5, "last_price": 100.0});
        assert_eq!(PriceField::MarkPrice.extract(&data), Ok(100.5));
        assert_eq!(PriceField::LastPrice.extract(&data), Ok(100.0));
        assert_eq!(
            PriceField::IndexPrice.extract(&data),
            Err(MessageError::MissingField("index_price"))
        );
        assert_eq!(
            PriceField::MarkPrice.extract(&json!({"mark_price": "100"})),
            Err(MessageError::MissingField("mark_price"))
        );
    }
}
