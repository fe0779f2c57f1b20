//! Serde helpers for API timestamps.
//!
//! Every timestamp crossing the HTTP boundary is UTC ISO-8601 with second
//! precision. The database keeps full precision; truncation happens only at
//! serialization time.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Secs, true))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(serde::de::Error::custom)
}

pub mod option {
    use super::*;

    pub fn serialize<S>(dt: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match dt {
            Some(dt) => super::serialize(dt, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Stamped {
        #[serde(with = "super")]
        at: chrono::DateTime<Utc>,
        #[serde(with = "super::option")]
        maybe: Option<chrono::DateTime<Utc>>,
    }

    #[test]
    fn serializes_to_second_precision() {
        let at = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);
        let json = serde_json::to_value(Stamped {
            at,
            maybe: Some(at),
        })
        .unwrap();

        assert_eq!(json["at"], "2025-03-14T09:26:53Z");
        assert_eq!(json["maybe"], "2025-03-14T09:26:53Z");
    }

    #[test]
    fn none_serializes_to_null() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let json = serde_json::to_value(Stamped { at, maybe: None }).unwrap();
        assert!(json["maybe"].is_null());
    }

    #[test]
    fn roundtrips() {
        let at = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
        let json = serde_json::to_string(&Stamped {
            at,
            maybe: Some(at),
        })
        .unwrap();
        let back: Stamped = serde_json::from_str(&json).unwrap();
        assert_eq!(back.at, at);
        assert_eq!(back.maybe, Some(at));
    }
}
