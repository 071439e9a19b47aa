use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! string_id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id_newtype!(ContactAddress);
string_id_newtype!(RemoteSessionId);
string_id_newtype!(GroupId);
string_id_newtype!(ConversationId);

/// Per-contact device index used as part of the cipher session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceOrdinal(pub i32);

impl DeviceOrdinal {
    /// Ordinal of a contact's primary device before any remote session is known.
    pub const PRIMARY: DeviceOrdinal = DeviceOrdinal(1);
}

impl fmt::Display for DeviceOrdinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Platform {
    Ios,
    Android,
    Other,
}

impl Platform {
    /// Platforms whose sessions carry cipher state this client can address.
    pub fn holds_cipher_session(self) -> bool {
        matches!(self, Platform::Ios | Platform::Android)
    }
}

impl From<String> for Platform {
    fn from(value: String) -> Self {
        match value.as_str() {
            "iOS" => Platform::Ios,
            "Android" => Platform::Android,
            _ => Platform::Other,
        }
    }
}

impl From<Platform> for String {
    fn from(value: Platform) -> Self {
        match value {
            Platform::Ios => "iOS".into(),
            Platform::Android => "Android".into(),
            Platform::Other => "Other".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSessionDescriptor {
    pub contact: ContactAddress,
    pub session_id: RemoteSessionId,
    pub platform: Platform,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub contact: ContactAddress,
    pub device: DeviceOrdinal,
    pub cipher_state: Vec<u8>,
    pub last_updated: DateTime<Utc>,
}

/// Structured form of the `contact:ordinal` sender id used by sender-key rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SenderAddress {
    pub contact: ContactAddress,
    pub device: DeviceOrdinal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SenderAddressError {
    #[error("sender address '{0}' has no device separator")]
    MissingSeparator(String),
    #[error("sender address '{0}' has an empty contact")]
    EmptyContact(String),
    #[error("sender address '{0}' has an invalid device ordinal")]
    InvalidOrdinal(String),
}

impl SenderAddress {
    pub fn new(contact: ContactAddress, device: DeviceOrdinal) -> Self {
        Self { contact, device }
    }

    /// Parses the stored `contact:ordinal` form. The contact part may itself contain `:`.
    pub fn parse(encoded: &str) -> Result<Self, SenderAddressError> {
        let (contact, ordinal) = encoded
            .rsplit_once(':')
            .ok_or_else(|| SenderAddressError::MissingSeparator(encoded.to_string()))?;
        if contact.is_empty() {
            return Err(SenderAddressError::EmptyContact(encoded.to_string()));
        }
        let ordinal = ordinal
            .parse::<i32>()
            .ok()
            .filter(|value| *value > 0)
            .ok_or_else(|| SenderAddressError::InvalidOrdinal(encoded.to_string()))?;
        Ok(Self {
            contact: ContactAddress::new(contact),
            device: DeviceOrdinal(ordinal),
        })
    }

    pub fn encode(&self) -> String {
        format!("{}:{}", self.contact, self.device)
    }
}

impl fmt::Display for SenderAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderKeyRecord {
    pub group_id: GroupId,
    pub sender: SenderAddress,
    pub cipher_state: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantRecord {
    pub conversation_id: ConversationId,
    pub contact: ContactAddress,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantSessionRecord {
    pub conversation_id: ConversationId,
    pub contact: ContactAddress,
    pub session_id: RemoteSessionId,
    pub delivery_ack: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Persisted gates for the two bootstrap steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFlags {
    pub keys_provisioned: bool,
    pub sessions_synchronized: bool,
}
