//! Common data types for the meeting connector crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum accepted length of a meeting identifier.
pub const MAX_MEETING_ID_LEN: usize = 128;

/// Error returned when a meeting identifier fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MeetingIdError {
    #[error("meeting id must not be empty")]
    Empty,

    #[error("meeting id must be at most {MAX_MEETING_ID_LEN} characters")]
    TooLong,

    #[error("meeting id contains invalid character {0:?}")]
    InvalidChar(char),
}

/// Identifier of a meeting on the external platform.
///
/// Restricted to ASCII alphanumerics, `-`, `_` and `.` so it can be embedded
/// in URL paths and store keys without escaping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MeetingId(String);

impl MeetingId {
    /// Validate and wrap a raw meeting identifier.
    ///
    /// # Errors
    ///
    /// Returns [`MeetingIdError`] if the value is empty, too long, or contains
    /// characters outside the allowed set.
    pub fn parse(raw: &str) -> Result<Self, MeetingIdError> {
        if raw.is_empty() {
            return Err(MeetingIdError::Empty);
        }
        if raw.len() > MAX_MEETING_ID_LEN {
            return Err(MeetingIdError::TooLong);
        }
        if let Some(c) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(MeetingIdError::InvalidChar(c));
        }
        Ok(Self(raw.to_string()))
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MeetingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for MeetingId {
    type Error = MeetingIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<MeetingId> for String {
    fn from(value: MeetingId) -> Self {
        value.0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_typical_ids() {
        for raw in ["m1", "meeting-42", "abc_DEF.9", "550e8400-e29b-41d4-a716-446655440000"] {
            let id = MeetingId::parse(raw).unwrap();
            assert_eq!(id.as_str(), raw);
            assert_eq!(id.to_string(), raw);
        }
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert_eq!(MeetingId::parse(""), Err(MeetingIdError::Empty));
    }

    #[test]
    fn test_parse_rejects_too_long() {
        let raw = "a".repeat(MAX_MEETING_ID_LEN + 1);
        assert_eq!(MeetingId::parse(&raw), Err(MeetingIdError::TooLong));
        assert!(MeetingId::parse(&"a".repeat(MAX_MEETING_ID_LEN)).is_ok());
    }

    #[test]
    fn test_parse_rejects_path_characters() {
        assert_eq!(
            MeetingId::parse("a/b"),
            Err(MeetingIdError::InvalidChar('/'))
        );
        assert_eq!(
            MeetingId::parse("a b"),
            Err(MeetingIdError::InvalidChar(' '))
        );
        assert_eq!(
            MeetingId::parse("lock:x"),
            Err(MeetingIdError::InvalidChar(':'))
        );
    }

    #[test]
    fn test_serde_is_transparent_and_validated() {
        let id = MeetingId::parse("m-7").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"m-7\"");

        let back: MeetingId = serde_json::from_str("\"m-7\"").unwrap();
        assert_eq!(back, id);

        assert!(serde_json::from_str::<MeetingId>("\"bad id\"").is_err());
    }
}
