use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{rngs::OsRng, Rng};
use shared::protocol::{OneTimePreKeyPayload, SignalKeyRequest, SignedPreKeyPayload};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

pub const DEFAULT_ONE_TIME_PREKEY_COUNT: usize = 500;
/// Prekey ids live in a 24-bit space and wrap back to 1.
pub const MAX_PREKEY_ID: u32 = 0x00FF_FFFF;
const MAX_REGISTRATION_ID: u32 = 16380;

pub struct LocalIdentity {
    registration_id: u32,
    dh_private: StaticSecret,
    signing: SigningKey,
}

impl LocalIdentity {
    pub fn generate() -> Self {
        Self {
            registration_id: OsRng.gen_range(1..=MAX_REGISTRATION_ID),
            dh_private: StaticSecret::random_from_rng(OsRng),
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn registration_id(&self) -> u32 {
        self.registration_id
    }

    pub fn identity_public(&self) -> [u8; 32] {
        PublicKey::from(&self.dh_private).to_bytes()
    }

    pub fn signing_public(&self) -> [u8; 32] {
        VerifyingKey::from(&self.signing).to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    pub fn to_stored(&self) -> StoredIdentity {
        StoredIdentity {
            registration_id: self.registration_id,
            dh_private: self.dh_private.to_bytes(),
            signing_private: self.signing.to_bytes(),
        }
    }

    pub fn from_stored(stored: &StoredIdentity) -> Self {
        Self {
            registration_id: stored.registration_id,
            dh_private: StaticSecret::from(stored.dh_private),
            signing: SigningKey::from_bytes(&stored.signing_private),
        }
    }
}

/// Raw private identity material as persisted by an [`IdentityStore`].
pub struct StoredIdentity {
    pub registration_id: u32,
    pub dh_private: [u8; 32],
    pub signing_private: [u8; 32],
}

impl Drop for StoredIdentity {
    fn drop(&mut self) {
        self.dh_private.zeroize();
        self.signing_private.zeroize();
    }
}

pub struct SignedPreKey {
    pub id: u32,
    pub private: StaticSecret,
    pub public: [u8; 32],
    pub signature: [u8; 64],
}

pub struct OneTimePreKey {
    pub id: u32,
    pub private: StaticSecret,
    pub public: [u8; 32],
}

pub struct PreKeyBatch {
    pub signed_prekey: SignedPreKey,
    pub one_time_prekeys: Vec<OneTimePreKey>,
}

impl PreKeyBatch {
    /// Public half of the batch in the shape the key service accepts.
    pub fn bundle_request(&self, identity: &LocalIdentity) -> SignalKeyRequest {
        SignalKeyRequest {
            registration_id: identity.registration_id(),
            identity_key: STANDARD.encode(identity.identity_public()),
            signing_key: STANDARD.encode(identity.signing_public()),
            signed_pre_key: SignedPreKeyPayload {
                key_id: self.signed_prekey.id,
                pub_key: STANDARD.encode(self.signed_prekey.public),
                signature: STANDARD.encode(self.signed_prekey.signature),
            },
            one_time_pre_keys: self
                .one_time_prekeys
                .iter()
                .map(|prekey| OneTimePreKeyPayload {
                    key_id: prekey.id,
                    pub_key: STANDARD.encode(prekey.public),
                })
                .collect(),
        }
    }

    pub fn last_prekey_id(&self) -> Option<u32> {
        self.one_time_prekeys.last().map(|prekey| prekey.id)
    }
}

pub fn verify_signed_prekey(signing_public: &[u8; 32], prekey: &SignedPreKey) -> Result<()> {
    let verifying = VerifyingKey::from_bytes(signing_public)
        .map_err(|e| anyhow!("invalid identity signing key: {e}"))?;
    verifying
        .verify(&prekey.public, &Signature::from_bytes(&prekey.signature))
        .map_err(|e| anyhow!("signed prekey {} failed verification: {e}", prekey.id))
}

/// Id that follows `last`, wrapping inside `1..=MAX_PREKEY_ID`.
pub fn next_prekey_id(last: Option<u32>) -> u32 {
    match last {
        Some(id) if id < MAX_PREKEY_ID => id + 1,
        _ => 1,
    }
}

/// Black-box capability producing a fresh prekey batch for an identity.
pub trait PreKeyGenerator: Send + Sync {
    fn generate(
        &self,
        identity: &LocalIdentity,
        first_prekey_id: u32,
        count: usize,
    ) -> Result<PreKeyBatch>;
}

pub struct DalekPreKeyGenerator;

impl PreKeyGenerator for DalekPreKeyGenerator {
    fn generate(
        &self,
        identity: &LocalIdentity,
        first_prekey_id: u32,
        count: usize,
    ) -> Result<PreKeyBatch> {
        if count == 0 {
            return Err(anyhow!("prekey batch must contain at least one prekey"));
        }

        let signed_private = StaticSecret::random_from_rng(OsRng);
        let signed_public = PublicKey::from(&signed_private).to_bytes();
        let signed_prekey = SignedPreKey {
            id: first_prekey_id,
            signature: identity.sign(&signed_public),
            private: signed_private,
            public: signed_public,
        };

        let mut one_time_prekeys = Vec::with_capacity(count);
        let mut id = first_prekey_id;
        for _ in 0..count {
            let private = StaticSecret::random_from_rng(OsRng);
            let public = PublicKey::from(&private).to_bytes();
            one_time_prekeys.push(OneTimePreKey {
                id,
                private,
                public,
            });
            id = next_prekey_id(Some(id));
        }

        Ok(PreKeyBatch {
            signed_prekey,
            one_time_prekeys,
        })
    }
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn save_local_identity(&self, identity: &StoredIdentity) -> Result<()>;
    async fn load_local_identity(&self) -> Result<Option<StoredIdentity>>;
    async fn save_prekeys(&self, batch: &PreKeyBatch) -> Result<()>;
    async fn last_prekey_id(&self) -> Result<Option<u32>>;
}

/// Returns the persisted identity, creating and saving one on first use.
pub async fn load_or_create_identity<S>(store: &S) -> Result<(LocalIdentity, bool)>
where
    S: IdentityStore + ?Sized,
{
    if let Some(stored) = store.load_local_identity().await? {
        return Ok((LocalIdentity::from_stored(&stored), false));
    }

    let identity = LocalIdentity::generate();
    store.save_local_identity(&identity.to_stored()).await?;
    Ok((identity, true))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
