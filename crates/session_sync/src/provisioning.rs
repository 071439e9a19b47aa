use keys::{load_or_create_identity, next_prekey_id, IdentityStore};
use tracing::info;

use crate::{
    bootstrap::SessionBootstrap,
    error::{LocalResultExt, SyncError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    AlreadyProvisioned,
    /// Keys were accepted by the key service and the flag is now durable.
    Provisioned,
    /// No login session exists. Nothing was published and the flag is unchanged.
    Deferred,
}

impl SessionBootstrap {
    /// Publishes the local identity and a fresh prekey batch, once per installation.
    pub async fn ensure_identity_provisioned(&mut self) -> Result<ProvisionOutcome, SyncError> {
        let result = self.provision().await;
        self.observe(result)
    }

    async fn provision(&mut self) -> Result<ProvisionOutcome, SyncError> {
        if self.flags.keys_provisioned {
            info!("signal: identity keys already provisioned");
            return Ok(ProvisionOutcome::AlreadyProvisioned);
        }

        let (identity, created) = load_or_create_identity(&self.storage)
            .await
            .local("load_or_create_identity")?;
        if created {
            info!(registration_id = identity.registration_id(), "signal: local identity created");
        }

        if !self.remote.is_authenticated() {
            info!("signal: not logged in, deferring key provisioning");
            return Ok(ProvisionOutcome::Deferred);
        }

        let first_prekey_id = next_prekey_id(self.storage.last_prekey_id().await.local("last_prekey_id")?);
        let batch = self
            .prekey_generator
            .generate(&identity, first_prekey_id, self.one_time_prekey_count)
            .local("generate_prekeys")?;
        self.storage.save_prekeys(&batch).await.local("save_prekeys")?;
        let request = batch.bundle_request(&identity);

        let remote = &self.remote;
        let request = &request;
        let pushed = self
            .retry
            .run("push_identity_keys", || async move {
                if !remote.is_authenticated() {
                    return Ok(None);
                }
                remote.push_identity_keys(request).await.map(Some)
            })
            .await?;
        let Some(ack) = pushed else {
            info!("signal: login lost before keys were published, deferring");
            return Ok(ProvisionOutcome::Deferred);
        };

        self.storage
            .mark_keys_provisioned()
            .await
            .local("mark_keys_provisioned")?;
        self.flags.keys_provisioned = true;
        self.web_cookies.clear();
        info!(
            registration_id = identity.registration_id(),
            first_prekey_id,
            one_time_prekeys = batch.one_time_prekeys.len(),
            server_prekey_count = ?ack.pre_key_count,
            "signal: identity keys provisioned"
        );
        Ok(ProvisionOutcome::Provisioned)
    }
}

#[cfg(test)]
#[path = "tests/provisioning_tests.rs"]
mod tests;
