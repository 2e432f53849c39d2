use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, SignalError};

/// Uppercase letters without I/O, digits without 0/1.
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub const ROOM_CODE_LEN: usize = 6;

/// Six-character room code, always stored uppercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomCode(String);

impl RoomCode {
    /// Uniformly samples a fresh code. Uniqueness is the registry's job.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let code = (0..ROOM_CODE_LEN)
            .map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char)
            .collect();
        RoomCode(code)
    }

    /// Case-insensitive parse of user input.
    pub fn parse(input: &str) -> Result<Self> {
        let normalized = input.trim().to_ascii_uppercase();

        if normalized.len() != ROOM_CODE_LEN
            || !normalized.bytes().all(|b| ROOM_CODE_ALPHABET.contains(&b))
        {
            return Err(SignalError::InvalidRoomCode(input.to_string()));
        }

        Ok(RoomCode(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport-level identity of one signaling connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn generate() -> Self {
        ParticipantId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        ParticipantId(id.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        ParticipantId(id)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generated_codes_use_restricted_alphabet() {
        let mut rng = rand::thread_rng();
        for _ in 0..2_000 {
            let code = RoomCode::generate(&mut rng);
            assert_eq!(code.as_str().len(), ROOM_CODE_LEN);
            assert!(code
                .as_str()
                .bytes()
                .all(|b| ROOM_CODE_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn test_alphabet_excludes_ambiguous_symbols() {
        for ambiguous in [b'I', b'O', b'0', b'1'] {
            assert!(!ROOM_CODE_ALPHABET.contains(&ambiguous));
        }
        let unique: HashSet<_> = ROOM_CODE_ALPHABET.iter().collect();
        assert_eq!(unique.len(), ROOM_CODE_ALPHABET.len());
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        let code = RoomCode::parse("ab3d7k").unwrap();
        assert_eq!(code.as_str(), "AB3D7K");
        assert_eq!(code, RoomCode::parse(" AB3D7K ").unwrap());
    }

    #[test]
    fn test_parse_rejects_malformed_codes() {
        assert!(RoomCode::parse("").is_err());
        assert!(RoomCode::parse("AB3D7").is_err());
        assert!(RoomCode::parse("AB3D7KX").is_err());
        // O and 1 are not in the alphabet
        assert!(RoomCode::parse("AB3DO1").is_err());
        assert!(matches!(
            RoomCode::parse("??????"),
            Err(SignalError::InvalidRoomCode(_))
        ));
    }

    #[test]
    fn test_participant_ids_are_distinct() {
        let a = ParticipantId::generate();
        let b = ParticipantId::generate();
        assert_ne!(a, b);
        assert_eq!(ParticipantId::from("tutor-1").to_string(), "tutor-1");
    }
}
