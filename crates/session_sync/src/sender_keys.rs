use chrono::{DateTime, Utc};
use shared::domain::{GroupId, ParticipantSessionRecord, SenderAddress, SenderKeyRecord};
use std::collections::HashSet;
use storage::{SenderKeyRow, SyncTransaction};
use tracing::{info, warn};

use crate::synchronizer::RemoteSessionMap;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PropagationReport {
    pub rewritten: usize,
    pub skipped: usize,
    pub discarded: usize,
    pub participant_sessions: usize,
}

/// Moves sender keys onto the remapped device ordinals and rebuilds the
/// per-conversation participant sessions, inside the caller's transaction.
///
/// A key already stored at its sender's current address is never replaced.
/// Stale keys aimed at an occupied address are deleted instead of moved.
pub(crate) async fn propagate_sender_keys(
    tx: &mut SyncTransaction,
    remote: &RemoteSessionMap,
    now: DateTime<Utc>,
) -> anyhow::Result<PropagationReport> {
    let mut report = PropagationReport::default();

    let mut records = Vec::new();
    for row in tx.load_sender_keys().await? {
        match row {
            SenderKeyRow::Parsed(record) => records.push(record),
            SenderKeyRow::Malformed { group_id, error } => {
                warn!(group_id = %group_id, error = %error, "sync: skipping malformed sender key");
                report.skipped += 1;
            }
        }
    }

    let mut occupied: HashSet<(GroupId, SenderAddress)> = records
        .iter()
        .filter(|record| remote.ordinal(&record.sender.contact) == Some(record.sender.device))
        .map(|record| (record.group_id.clone(), record.sender.clone()))
        .collect();

    for record in records {
        let Some(device) = remote.ordinal(&record.sender.contact) else {
            continue;
        };
        if record.sender.device == device {
            continue;
        }

        let previous = record.sender.clone();
        let target = SenderAddress::new(previous.contact.clone(), device);
        if !occupied.insert((record.group_id.clone(), target.clone())) {
            info!(
                group_id = %record.group_id,
                sender = %previous,
                "sync: dropping stale sender key, current address already holds one"
            );
            tx.delete_sender_key(&record.group_id, &previous).await?;
            report.discarded += 1;
            continue;
        }

        let moved = SenderKeyRecord {
            sender: target,
            ..record
        };
        tx.rewrite_sender_key(&previous, &moved).await?;
        report.rewritten += 1;
    }

    let participant_sessions: Vec<ParticipantSessionRecord> = tx
        .load_participants()
        .await?
        .into_iter()
        .filter_map(|participant| {
            let session_id = remote.session_id(&participant.contact)?.clone();
            Some(ParticipantSessionRecord {
                conversation_id: participant.conversation_id,
                contact: participant.contact,
                session_id,
                delivery_ack: None,
                created_at: now,
            })
        })
        .collect();
    tx.replace_participant_sessions(&participant_sessions).await?;
    report.participant_sessions = participant_sessions.len();

    Ok(report)
}
