use chrono::Utc;
use shared::domain::{
    ContactAddress, DeviceOrdinal, RemoteSessionDescriptor, RemoteSessionId, SessionRecord,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use storage::EXTENSION_SESSION_PREFERENCE;
use tracing::{debug, info};

use crate::{
    bootstrap::SessionBootstrap,
    device_ordinal::device_ordinal_for_session,
    error::{LocalResultExt, SyncError},
    sender_keys::propagate_sender_keys,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    AlreadySynchronized,
    /// No login session exists. The flag is unchanged and a later run retries.
    Deferred,
    /// There was nothing to reconcile. The flag is set.
    Vacuous,
    Synchronized(SyncReport),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub contacts: usize,
    pub sessions_removed: u64,
    pub sessions_written: usize,
    pub sender_keys_rewritten: usize,
    pub sender_keys_skipped: usize,
    pub sender_keys_discarded: usize,
    pub participant_sessions: usize,
}

/// The server's view of the contacts we hold sessions with, reduced to one
/// session per contact.
#[derive(Debug, Default)]
pub(crate) struct RemoteSessionMap {
    sessions: HashMap<ContactAddress, (RemoteSessionId, DeviceOrdinal)>,
}

impl RemoteSessionMap {
    /// Keeps only platforms that hold a cipher session. The last descriptor
    /// for a contact wins.
    pub(crate) fn from_descriptors(descriptors: Vec<RemoteSessionDescriptor>) -> Self {
        let mut sessions = HashMap::new();
        for descriptor in descriptors {
            if !descriptor.platform.holds_cipher_session() {
                continue;
            }
            let ordinal = device_ordinal_for_session(&descriptor.session_id);
            sessions.insert(descriptor.contact, (descriptor.session_id, ordinal));
        }
        Self { sessions }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn ordinal(&self, contact: &ContactAddress) -> Option<DeviceOrdinal> {
        self.sessions.get(contact).map(|(_, ordinal)| *ordinal)
    }

    pub(crate) fn session_id(&self, contact: &ContactAddress) -> Option<&RemoteSessionId> {
        self.sessions.get(contact).map(|(session_id, _)| session_id)
    }
}

/// Re-keys local sessions under the remote ordinal of their contact.
///
/// Contacts without a remote session are dropped. When several records land
/// on the same key, the most recently updated one is kept.
pub(crate) fn remap_sessions(local: Vec<SessionRecord>, remote: &RemoteSessionMap) -> Vec<SessionRecord> {
    let mut rebuilt: BTreeMap<(ContactAddress, DeviceOrdinal), SessionRecord> = BTreeMap::new();
    for record in local {
        let Some(device) = remote.ordinal(&record.contact) else {
            continue;
        };
        let key = (record.contact.clone(), device);
        let replace = rebuilt
            .get(&key)
            .map_or(true, |existing| record.last_updated >= existing.last_updated);
        if replace {
            rebuilt.insert(key, SessionRecord { device, ..record });
        }
    }
    rebuilt.into_values().collect()
}

impl SessionBootstrap {
    /// Re-keys the local session directory onto the server's current sessions.
    pub async fn synchronize_sessions(&mut self) -> Result<SyncOutcome, SyncError> {
        let result = self.synchronize().await;
        self.observe(result)
    }

    async fn synchronize(&mut self) -> Result<SyncOutcome, SyncError> {
        if self.flags.sessions_synchronized {
            info!("sync: sessions already synchronized");
            return Ok(SyncOutcome::AlreadySynchronized);
        }

        let cleared_extension = self
            .storage
            .clear_preference(EXTENSION_SESSION_PREFERENCE)
            .await
            .local("clear_extension_session")?;
        let cleared_jobs = self
            .storage
            .clear_session_jobs()
            .await
            .local("clear_session_jobs")?;
        debug!(cleared_extension, cleared_jobs, "sync: stale session state discarded");

        let local_sessions = self.storage.load_sessions().await.local("load_sessions")?;
        let contacts: Vec<ContactAddress> = local_sessions
            .iter()
            .map(|record| record.contact.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if contacts.is_empty() {
            self.commit_vacuous().await?;
            info!("sync: no local sessions, nothing to synchronize");
            return Ok(SyncOutcome::Vacuous);
        }

        let remote = &self.remote;
        let requested = contacts.as_slice();
        let fetched = self
            .retry
            .run("fetch_sessions_for_contacts", || async move {
                if !remote.is_authenticated() {
                    return Ok(None);
                }
                remote.fetch_sessions_for_contacts(requested).await.map(Some)
            })
            .await?;
        let Some(descriptors) = fetched else {
            info!("sync: not logged in, deferring session synchronization");
            return Ok(SyncOutcome::Deferred);
        };

        let remote_map = RemoteSessionMap::from_descriptors(descriptors);
        if remote_map.is_empty() {
            self.commit_vacuous().await?;
            info!(contacts = contacts.len(), "sync: server holds no cipher sessions for local contacts");
            return Ok(SyncOutcome::Vacuous);
        }

        let rebuilt = remap_sessions(local_sessions, &remote_map);
        let mut tx = self.storage.begin_sync().await.local("begin_sync")?;
        let sessions_removed = tx.replace_sessions(&rebuilt).await.local("replace_sessions")?;
        let propagation = propagate_sender_keys(&mut tx, &remote_map, Utc::now())
            .await
            .local("propagate_sender_keys")?;
        tx.mark_sessions_synchronized()
            .await
            .local("mark_sessions_synchronized")?;
        tx.commit().await.local("commit_session_sync")?;
        self.flags.sessions_synchronized = true;

        let report = SyncReport {
            contacts: contacts.len(),
            sessions_removed,
            sessions_written: rebuilt.len(),
            sender_keys_rewritten: propagation.rewritten,
            sender_keys_skipped: propagation.skipped,
            sender_keys_discarded: propagation.discarded,
            participant_sessions: propagation.participant_sessions,
        };
        info!(
            contacts = report.contacts,
            remote_sessions = remote_map.len(),
            sessions_written = report.sessions_written,
            sender_keys_rewritten = report.sender_keys_rewritten,
            sender_keys_skipped = report.sender_keys_skipped,
            sender_keys_discarded = report.sender_keys_discarded,
            participant_sessions = report.participant_sessions,
            "sync: sessions synchronized"
        );
        Ok(SyncOutcome::Synchronized(report))
    }

    async fn commit_vacuous(&mut self) -> Result<(), SyncError> {
        let mut tx = self.storage.begin_sync().await.local("begin_sync")?;
        tx.mark_sessions_synchronized()
            .await
            .local("mark_sessions_synchronized")?;
        tx.commit().await.local("commit_session_sync")?;
        self.flags.sessions_synchronized = true;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/synchronizer_tests.rs"]
mod tests;
