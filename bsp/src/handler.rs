//! Boundary to the semantic request handlers.

use std::future::{self, Future};

use tokio_util::sync::CancellationToken;

use crate::frame::Frame;
use crate::protocol::codes;

/// Failure of one handler invocation. Recovered locally: the connection
/// keeps serving subsequent frames.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct HandlerError {
    code: i64,
    message: String,
}

impl HandlerError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            codes::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(codes::REQUEST_CANCELLED, "request cancelled")
    }

    #[must_use]
    pub fn code(&self) -> i64 {
        self.code
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Interprets decoded frames and computes responses.
///
/// One handler value serves one connection and is invoked concurrently for
/// distinct frames, up to the dispatcher's pool size.
pub trait BuildHandler: Send + Sync + 'static {
    /// Handle one frame.
    ///
    /// For a request, `Ok(Some(value))` becomes its `result` and `Ok(None)` a
    /// `null` result. Nothing is written for notifications. `cancel` fires on
    /// `$/cancelRequest` for this request or on connection teardown.
    fn handle(
        &self,
        frame: Frame,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<Option<serde_json::Value>, HandlerError>> + Send;

    /// Drain any background work the handler started. Called once after the
    /// dispatcher stops consuming frames.
    fn await_running_tasks(&self) -> impl Future<Output = ()> + Send {
        future::ready(())
    }
}
