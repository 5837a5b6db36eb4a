use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Room-code alphabet. `I`, `O`, `0` and `1` are excluded so codes read
/// unambiguously when shared out loud or scribbled on a napkin.
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of generated room codes.
pub const ROOM_CODE_LEN: usize = 6;

/// Maximum length of a client-supplied room id after normalization.
pub const ROOM_ID_MAX_LEN: usize = 8;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generate a random room code from the readable alphabet.
///
/// Collision checking against live rooms is the registry's job; this only
/// produces the candidate.
pub fn generate_room_code() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_CODE_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..ROOM_CODE_ALPHABET.len());
            ROOM_CODE_ALPHABET[idx] as char
        })
        .collect()
}

/// Normalize a client-supplied room id: uppercase, strip everything that is
/// not alphanumeric, clamp to [`ROOM_ID_MAX_LEN`]. An empty result means the
/// caller should generate a fresh code instead.
pub fn normalize_room_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .take(ROOM_ID_MAX_LEN)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_and_uppercases() {
        assert_eq!(normalize_room_id(" abc-123 "), "ABC123");
        assert_eq!(normalize_room_id("room!!id##overflow"), "ROOMIDOV");
        assert_eq!(normalize_room_id("---"), "");
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in ["abC 123", "zzzzzzzzzzzz", "", "Ab-9"] {
            let once = normalize_room_id(raw);
            assert_eq!(normalize_room_id(&once), once);
        }
    }

    #[test]
    fn normalize_clamps_length() {
        let id = normalize_room_id("ABCDEFGHJKLMNP");
        assert_eq!(id.len(), ROOM_ID_MAX_LEN);
    }

    #[test]
    fn generated_codes_use_alphabet() {
        for _ in 0..50 {
            let code = generate_room_code();
            assert_eq!(code.len(), ROOM_CODE_LEN);
            assert!(code.bytes().all(|b| ROOM_CODE_ALPHABET.contains(&b)));
        }
    }
}
