//! Typed ID definitions for all persisted entities.

use crate::define_id;

// =============================================================================
// Fleet
// =============================================================================

define_id!(ServerId, "server");

// =============================================================================
// Game Definitions
// =============================================================================

define_id!(GameId, "game");
define_id!(GameConfigId, "game config");
define_id!(SgcId, "server game config");

// =============================================================================
// Runtime
// =============================================================================

define_id!(SessionId, "session");
define_id!(ServerPortId, "server port");

// =============================================================================
// Artifacts
// =============================================================================

define_id!(LogReferenceId, "log reference");
define_id!(BackupId, "backup");

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdError;
    use proptest::prelude::*;

    #[test]
    fn test_parse_valid() {
        let id: SessionId = "42".parse().unwrap();
        assert_eq!(id.get(), 42);
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let id = ServerId::parse(" 7 ").unwrap();
        assert_eq!(id, ServerId::new(7));
    }

    #[test]
    fn test_parse_empty() {
        assert!(SgcId::parse("").unwrap_err().is_empty());
    }

    #[test]
    fn test_parse_rejects_non_numeric() {
        assert!(matches!(
            SessionId::parse("sess_1"),
            Err(IdError::NotANumber { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_non_positive() {
        assert_eq!(ServerId::parse("0"), Err(IdError::NotPositive(0)));
        assert_eq!(ServerId::parse("-3"), Err(IdError::NotPositive(-3)));
    }

    #[test]
    fn test_serializes_as_plain_number() {
        let json = serde_json::to_string(&SessionId::new(1)).unwrap();
        assert_eq!(json, "1");

        let parsed: SgcId = serde_json::from_str("12").unwrap();
        assert_eq!(parsed, SgcId::new(12));
    }

    #[test]
    fn test_i64_conversions() {
        let raw: i64 = GameConfigId::new(9).into();
        assert_eq!(raw, 9);
        assert_eq!(BackupId::from(3).get(), 3);
    }

    proptest! {
        #[test]
        fn prop_display_parse_roundtrip(raw in 1i64..i64::MAX) {
            let id = SessionId::new(raw);
            let parsed: SessionId = id.to_string().parse().unwrap();
            prop_assert_eq!(id, parsed);
        }
    }
}
