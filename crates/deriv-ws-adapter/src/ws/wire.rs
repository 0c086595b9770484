/*
[INPUT]:  Raw JSON frames from the socket, outgoing request payloads
[OUTPUT]: Decoded envelopes (reply/push/error) and req_id-tagged requests
[POS]:    WebSocket layer - wire format encode/decode
[UPDATE]: When the venue's frame shape or error envelope changes
*/

use serde_json::{Value, json};

use crate::error::{DerivError, Result};

/// Venue-level error object carried inside a reply frame
#[derive(Debug, Clone)]
pub(crate) struct UpstreamFailure {
    pub code: String,
    pub message: String,
}

/// A decoded incoming frame
#[derive(Debug)]
pub(crate) struct Envelope {
    pub req_id: Option<u64>,
    pub msg_type: Option<String>,
    pub error: Option<UpstreamFailure>,
    pub payload: Value,
}

impl Envelope {
    pub(crate) fn decode(text: &str) -> Result<Self> {
        let payload: Value = serde_json::from_str(text)?;
        if !payload.is_object() {
            return Err(DerivError::Protocol("frame is not a JSON object".into()));
        }
        let req_id = payload.get("req_id").and_then(Value::as_u64);
        let msg_type = payload
            .get("msg_type")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let error = payload.get("error").map(|err| UpstreamFailure {
            code: err
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_owned(),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_owned(),
        });
        Ok(Self {
            req_id,
            msg_type,
            error,
            payload,
        })
    }

    /// The outcome this frame resolves a pending request with
    pub(crate) fn result(&self) -> Result<Value> {
        match &self.error {
            Some(failure) if failure.code == "AuthorizationRequired" => {
                Err(DerivError::AuthRequired)
            }
            Some(failure) => Err(DerivError::Upstream {
                code: failure.code.clone(),
                message: failure.message.clone(),
            }),
            None => Ok(self.payload.clone()),
        }
    }
}

/// Inject the correlation id into an outgoing request
pub(crate) fn with_req_id(mut payload: Value, id: u64) -> Result<Value> {
    match payload.as_object_mut() {
        Some(map) => {
            map.insert("req_id".into(), json!(id));
            Ok(payload)
        }
        None => Err(DerivError::Protocol(
            "request payload must be a JSON object".into(),
        )),
    }
}

/// Upstream subscription id from a subscribe reply, if present
pub(crate) fn subscription_id(reply: &Value) -> Option<String> {
    reply
        .get("subscription")
        .and_then(|sub| sub.get("id"))
        .and_then(Value::as_str)
        .map(str::to_owned)
}
