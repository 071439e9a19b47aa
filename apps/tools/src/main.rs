use anyhow::Result;
use clap::{Parser, Subcommand};
use session_sync::device_ordinal_for_session;
use shared::domain::RemoteSessionId;
use storage::{SenderKeyRow, Storage};

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/bootstrap.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the persisted bootstrap flags.
    SyncState,
    /// Clear both flags so the next launch provisions and synchronizes again.
    ResetSyncState,
    ListSessions,
    ListSenderKeys,
    ListParticipantSessions,
    /// Print the device ordinal a remote session id maps to.
    DeviceOrdinal {
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::DeviceOrdinal { session_id } => {
            let ordinal = device_ordinal_for_session(&RemoteSessionId::new(session_id.as_str()));
            println!("{session_id} -> {ordinal}");
        }
        Command::SyncState => {
            let storage = Storage::new(&cli.database_url).await?;
            let flags = storage.load_sync_flags().await?;
            println!(
                "keys_provisioned={} sessions_synchronized={}",
                flags.keys_provisioned, flags.sessions_synchronized
            );
        }
        Command::ResetSyncState => {
            let storage = Storage::new(&cli.database_url).await?;
            storage.clear_sync_flags().await?;
            println!("sync state cleared");
        }
        Command::ListSessions => {
            let storage = Storage::new(&cli.database_url).await?;
            for session in storage.load_sessions().await? {
                println!(
                    "{}:{} bytes={} updated={}",
                    session.contact,
                    session.device,
                    session.cipher_state.len(),
                    session.last_updated.to_rfc3339()
                );
            }
        }
        Command::ListSenderKeys => {
            let storage = Storage::new(&cli.database_url).await?;
            for row in storage.load_sender_keys().await? {
                match row {
                    SenderKeyRow::Parsed(record) => {
                        println!("{} {} bytes={}", record.group_id, record.sender, record.cipher_state.len())
                    }
                    SenderKeyRow::Malformed { group_id, error } => {
                        println!("{group_id} malformed: {error}")
                    }
                }
            }
        }
        Command::ListParticipantSessions => {
            let storage = Storage::new(&cli.database_url).await?;
            for record in storage.load_participant_sessions().await? {
                println!(
                    "{} {} session={} ack={:?} created={}",
                    record.conversation_id,
                    record.contact,
                    record.session_id,
                    record.delivery_ack,
                    record.created_at.to_rfc3339()
                );
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_ordinal_parses_without_database_flag() {
        let cli = Cli::try_parse_from(["tools", "device-ordinal", "session-1"]).expect("parse");

        assert_eq!(cli.database_url, "sqlite://./data/bootstrap.db");
        assert!(matches!(
            cli.command,
            Command::DeviceOrdinal { ref session_id } if session_id == "session-1"
        ));
    }
}
