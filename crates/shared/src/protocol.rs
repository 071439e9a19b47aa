use serde::{Deserialize, Serialize};

use crate::{
    domain::{ContactAddress, Platform, RemoteSessionDescriptor, RemoteSessionId},
    error::ApiError,
};

/// Response wrapper used by every key-service endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope<T> {
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKeyPayload {
    pub key_id: u32,
    pub pub_key: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKeyPayload {
    pub key_id: u32,
    pub pub_key: String,
}

/// Body of `POST /signal/keys`. Keys are standard base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalKeyRequest {
    pub registration_id: u32,
    pub identity_key: String,
    pub signing_key: String,
    pub signed_pre_key: SignedPreKeyPayload,
    pub one_time_pre_keys: Vec<OneTimePreKeyPayload>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalKeyAck {
    pub pre_key_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub user_id: String,
    pub session_id: String,
    pub platform: Platform,
}

impl From<SessionResponse> for RemoteSessionDescriptor {
    fn from(value: SessionResponse) -> Self {
        Self {
            contact: ContactAddress(value.user_id),
            session_id: RemoteSessionId(value.session_id),
            platform: value.platform,
        }
    }
}
