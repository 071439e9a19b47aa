use sha2::{Digest, Sha256};
use shared::domain::{DeviceOrdinal, RemoteSessionId};
use uuid::Uuid;

/// Lowest ordinal handed to a remote session; `1` stays reserved for the primary device.
pub const MIN_REMOTE_DEVICE_ORDINAL: i32 = 2;

/// Maps a remote session id to the device ordinal used to index its cipher session.
///
/// The mapping is a pure function of the id, so it is stable across runs and
/// installations. A re-issued id for the same physical device maps to a new
/// ordinal, exactly as a new device would.
pub fn device_ordinal_for_session(session_id: &RemoteSessionId) -> DeviceOrdinal {
    let (most_significant, least_significant) = session_id_bits(session_id.as_str());
    let hilo = most_significant ^ least_significant;
    let folded = ((hilo >> 32) as i32) ^ (hilo as i32);

    let span = (i32::MAX - MIN_REMOTE_DEVICE_ORDINAL + 1) as u32;
    DeviceOrdinal(MIN_REMOTE_DEVICE_ORDINAL + ((folded as u32) % span) as i32)
}

fn session_id_bits(session_id: &str) -> (u64, u64) {
    if let Ok(uuid) = Uuid::parse_str(session_id) {
        return uuid.as_u64_pair();
    }

    let digest = Sha256::digest(session_id.as_bytes());
    let mut high = [0u8; 8];
    let mut low = [0u8; 8];
    high.copy_from_slice(&digest[..8]);
    low.copy_from_slice(&digest[8..16]);
    (u64::from_be_bytes(high), u64::from_be_bytes(low))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ordinal(id: &str) -> i32 {
        device_ordinal_for_session(&RemoteSessionId::new(id)).0
    }

    #[test]
    fn same_session_id_always_maps_to_same_ordinal() {
        let id = "8f2a61c4-3b7e-4d1a-9c55-0e6b2f4d9a10";
        assert_eq!(ordinal(id), ordinal(id));
        assert_eq!(ordinal(id), ordinal(&id.to_uppercase()));
    }

    #[test]
    fn uuid_ids_fold_both_halves() {
        // hilo = 0x0000_0001_0000_0000 ^ 0x0000_0000_0000_0004, folded to 1 ^ 4 = 5.
        assert_eq!(ordinal("00000001-0000-0000-0000-000000000004"), 2 + 5);
        assert_eq!(ordinal("00000000-0000-0000-0000-000000000000"), 2);
    }

    #[test]
    fn negative_folds_stay_in_reserved_range() {
        let value = ordinal("ffffffff-0000-0000-0000-000000000000");
        assert!(value >= MIN_REMOTE_DEVICE_ORDINAL);
    }

    #[test]
    fn non_uuid_ids_are_still_mapped() {
        let value = ordinal("desktop-session-42");
        assert!(value >= MIN_REMOTE_DEVICE_ORDINAL);
        assert_eq!(value, ordinal("desktop-session-42"));
        assert_ne!(value, ordinal("desktop-session-43"));
        assert!(ordinal("") >= MIN_REMOTE_DEVICE_ORDINAL);
    }

    #[test]
    fn distinct_sessions_get_distinct_ordinals() {
        assert_ne!(
            ordinal("0b4f49a4-7e0a-4c3e-8f47-5b0d2c1e9a01"),
            ordinal("0b4f49a4-7e0a-4c3e-8f47-5b0d2c1e9a02")
        );
    }
}
