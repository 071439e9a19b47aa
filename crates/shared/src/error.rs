use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error object embedded in a key-service response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: i32,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("remote error {code}: {message}")]
pub struct RemoteError {
    pub code: i32,
    pub message: String,
}

impl RemoteError {
    pub const UNAUTHORIZED: i32 = 401;
    pub const TRANSPORT: i32 = -1;
    pub const MALFORMED_RESPONSE: i32 = -2;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(Self::UNAUTHORIZED, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(Self::TRANSPORT, message)
    }

    pub fn malformed_response(message: impl Into<String>) -> Self {
        Self::new(Self::MALFORMED_RESPONSE, message)
    }

    /// The key service rejected the current credentials.
    pub fn is_unauthorized(&self) -> bool {
        self.code == Self::UNAUTHORIZED
    }
}

impl From<ApiError> for RemoteError {
    fn from(value: ApiError) -> Self {
        Self {
            code: value.code,
            message: value.description,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResponseEnvelope;

    #[test]
    fn envelope_error_becomes_remote_error() {
        let envelope: ResponseEnvelope<serde_json::Value> =
            serde_json::from_str(r#"{"error":{"code":401}}"#).expect("decode");

        let error = RemoteError::from(envelope.error.expect("error"));

        assert!(error.is_unauthorized());
        assert!(error.message.is_empty());
    }
}
