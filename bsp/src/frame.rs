//! Decoded protocol frames and their routing classification.

use kiln_types::RequestId;
use serde_json::Value;

/// Method name of the client-side cancellation notification.
pub const CANCEL_REQUEST_METHOD: &str = "$/cancelRequest";

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame body is not a JSON object")]
    NotAnObject,
    #[error("frame has neither a method nor a result/error")]
    Unclassifiable,
    #[error("invalid request id: {0}")]
    InvalidId(Value),
    #[error("$/cancelRequest without a valid params.id")]
    InvalidCancel,
}

/// Routing classification. Only this, never the payload contents, is
/// inspected by the connection core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    /// A call the client expects an answer to.
    Request { id: RequestId, method: String },
    /// A one-way message.
    Notification { method: String },
    /// `$/cancelRequest` for an earlier request.
    CancelRequest { id: RequestId },
    /// A client's answer to a server-initiated request.
    Response { id: RequestId },
}

/// One immutable decoded unit of the wire protocol.
#[derive(Debug, Clone)]
pub struct Frame {
    kind: FrameKind,
    payload: Value,
}

impl Frame {
    pub fn from_value(payload: Value) -> Result<Self, FrameError> {
        let object = payload.as_object().ok_or(FrameError::NotAnObject)?;
        let method = object.get("method").and_then(Value::as_str);
        let has_result_or_error = object.contains_key("result") || object.contains_key("error");
        let id = match object.get("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(
                RequestId::from_json(raw).ok_or_else(|| FrameError::InvalidId(raw.clone()))?,
            ),
        };

        let kind = match (id, method, has_result_or_error) {
            (None, Some(CANCEL_REQUEST_METHOD), _) => {
                let target = object
                    .get("params")
                    .and_then(|p| p.get("id"))
                    .and_then(RequestId::from_json)
                    .ok_or(FrameError::InvalidCancel)?;
                FrameKind::CancelRequest { id: target }
            }
            (Some(id), Some(method), _) => FrameKind::Request {
                id,
                method: method.to_string(),
            },
            (None, Some(method), _) => FrameKind::Notification {
                method: method.to_string(),
            },
            (Some(id), None, true) => FrameKind::Response { id },
            _ => return Err(FrameError::Unclassifiable),
        };

        Ok(Self { kind, payload })
    }

    #[must_use]
    pub fn kind(&self) -> &FrameKind {
        &self.kind
    }

    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    #[must_use]
    pub fn into_payload(self) -> Value {
        self.payload
    }

    #[must_use]
    pub fn params(&self) -> Option<&Value> {
        self.payload.get("params")
    }

    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match &self.kind {
            FrameKind::Request { method, .. } | FrameKind::Notification { method } => Some(method),
            FrameKind::CancelRequest { .. } => Some(CANCEL_REQUEST_METHOD),
            FrameKind::Response { .. } => None,
        }
    }

    /// Id of the request this frame expects a response for.
    #[must_use]
    pub fn request_id(&self) -> Option<&RequestId> {
        match &self.kind {
            FrameKind::Request { id, .. } => Some(id),
            _ => None,
        }
    }
}
