use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{ContactAddress, RemoteSessionDescriptor},
    error::RemoteError,
    protocol::{ResponseEnvelope, SessionResponse, SignalKeyAck, SignalKeyRequest},
};
use tracing::debug;

/// Remote directory that stores public key bundles and lists each contact's sessions.
#[async_trait]
pub trait KeyDistributionService: Send + Sync {
    /// Whether a login session currently exists. Checked before every attempt.
    fn is_authenticated(&self) -> bool;

    async fn push_identity_keys(&self, bundle: &SignalKeyRequest) -> Result<SignalKeyAck, RemoteError>;

    async fn fetch_sessions_for_contacts(
        &self,
        contacts: &[ContactAddress],
    ) -> Result<Vec<RemoteSessionDescriptor>, RemoteError>;
}

/// JSON-over-HTTP key service authenticated with a bearer token.
#[derive(Clone)]
pub struct HttpKeyService {
    http: Client,
    server_url: String,
    access_token: Option<String>,
}

impl HttpKeyService {
    pub fn new(server_url: impl Into<String>, access_token: Option<String>) -> Self {
        Self::with_client(Client::new(), server_url, access_token)
    }

    pub fn with_client(http: Client, server_url: impl Into<String>, access_token: Option<String>) -> Self {
        Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.filter(|token| !token.trim().is_empty()),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<Option<T>, RemoteError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.server_url, path);
        let mut request = self.http.post(&url).json(body);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| RemoteError::transport(format!("POST {url} failed: {err}")))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| RemoteError::transport(format!("failed to read {url} response: {err}")))?;
        debug!(%url, status = status.as_u16(), "sync: key service responded");

        if !status.is_success() {
            let description = serde_json::from_slice::<ResponseEnvelope<serde_json::Value>>(&bytes)
                .ok()
                .and_then(|envelope| envelope.error)
                .map(|error| error.description)
                .filter(|description| !description.is_empty())
                .unwrap_or_else(|| status.to_string());
            return Err(RemoteError::new(i32::from(status.as_u16()), description));
        }

        let envelope: ResponseEnvelope<T> = serde_json::from_slice(&bytes)
            .map_err(|err| RemoteError::malformed_response(format!("invalid {path} response: {err}")))?;
        if let Some(error) = envelope.error {
            return Err(error.into());
        }
        Ok(envelope.data)
    }
}

#[async_trait]
impl KeyDistributionService for HttpKeyService {
    fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }

    async fn push_identity_keys(&self, bundle: &SignalKeyRequest) -> Result<SignalKeyAck, RemoteError> {
        let ack: Option<SignalKeyAck> = self.post_json("/signal/keys", bundle).await?;
        Ok(ack.unwrap_or_default())
    }

    async fn fetch_sessions_for_contacts(
        &self,
        contacts: &[ContactAddress],
    ) -> Result<Vec<RemoteSessionDescriptor>, RemoteError> {
        let sessions: Vec<SessionResponse> = self
            .post_json("/sessions/fetch", contacts)
            .await?
            .ok_or_else(|| RemoteError::malformed_response("session fetch returned no data"))?;
        Ok(sessions.into_iter().map(RemoteSessionDescriptor::from).collect())
    }
}

#[cfg(test)]
#[path = "tests/remote_tests.rs"]
mod tests;
