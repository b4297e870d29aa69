//! Error types. `RequestError` carries its response code as a typed field;
//! control information never travels through an error's display string.

use crate::protocol::{ResponseCode, ResponseEnvelope};

/// A failed request, classified by response code.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RequestError {
    pub code: ResponseCode,
    pub message: String,
}

impl RequestError {
    pub fn new(code: ResponseCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn bad_req(message: impl Into<String>) -> Self {
        Self::new(ResponseCode::BadReq, message)
    }

    pub fn route_not_find() -> Self {
        Self::new(ResponseCode::RouteNotFind, "route not matched")
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ResponseCode::Forbidden, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ResponseCode::Timeout, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ResponseCode::Error, message)
    }

    /// Classify a non-success response into an error value.
    pub fn from_response(resp: &ResponseEnvelope) -> Self {
        let message = match (&resp.error, resp.code) {
            (Some(err), _) => err.clone(),
            (None, ResponseCode::Timeout) => "request timeout".to_string(),
            (None, ResponseCode::RouteNotFind) => "request route not find".to_string(),
            (None, ResponseCode::Forbidden) => "request forbidden".to_string(),
            (None, ResponseCode::UnLinked) => "not linked".to_string(),
            (None, _) => "request failed".to_string(),
        };
        Self::new(resp.code, message)
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for RequestError {
    /// Unclassified errors default to `Error`.
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self::error(err.to_string())
    }
}

/// Failure starting or resetting a module runtime.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("transport connect failed: {0}")]
    Connect(String),
    #[error("module already started")]
    AlreadyStarted,
    #[error("module already stopped")]
    Stopped,
}

/// Failure inside a transport adapter send primitive.
#[derive(Debug, thiserror::Error)]
#[error("adapter: {0}")]
pub struct AdapterError(pub String);
