//! Row conversion helpers shared by the SQLite repositories.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};

/// Parse an RFC3339 timestamp column.
pub fn parse_datetime(raw: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DomainError::Serialization(format!("invalid timestamp '{raw}': {e}")))
}

/// Parse an optional timestamp column.
pub fn parse_datetime_opt(raw: Option<&str>) -> DomainResult<Option<DateTime<Utc>>> {
    raw.map(parse_datetime).transpose()
}

/// Parse a UUID column.
pub fn parse_uuid(raw: &str) -> DomainResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| DomainError::Serialization(format!("invalid uuid '{raw}': {e}")))
}

/// Parse an optional UUID column.
pub fn parse_uuid_opt(raw: Option<&str>) -> DomainResult<Option<Uuid>> {
    raw.map(parse_uuid).transpose()
}

/// Parse a JSON TEXT column into a typed value.
pub fn parse_json<T: serde::de::DeserializeOwned>(raw: &str) -> DomainResult<T> {
    serde_json::from_str(raw).map_err(|e| DomainError::Serialization(format!("invalid json: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datetime_round_trip() {
        let now = Utc::now();
        let parsed = parse_datetime(&now.to_rfc3339()).unwrap();
        assert_eq!(parsed.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn test_bad_inputs_surface_serialization_errors() {
        assert!(matches!(
            parse_datetime("not a date"),
            Err(DomainError::Serialization(_))
        ));
        assert!(matches!(
            parse_uuid("not-a-uuid"),
            Err(DomainError::Serialization(_))
        ));
        assert!(matches!(
            parse_json::<Vec<String>>("{broken"),
            Err(DomainError::Serialization(_))
        ));
    }
}
