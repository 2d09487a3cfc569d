//! Serde helpers so configuration durations can be written as `30s`, `5m` or `7days`.

use serde::de::{self, Visitor};
use serde::{Deserializer, Serializer};
use std::{fmt, time::Duration};

/// `#[serde(with = "duration")]` for plain `Duration` fields.
///
/// Accepts either an integer number of seconds or a humantime string, and always
/// writes the humantime form back out.
pub mod duration {
    use super::*;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(HumanDurationVisitor)
    }
}

struct HumanDurationVisitor;

impl<'de> Visitor<'de> for HumanDurationVisitor {
    type Value = Duration;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a number of seconds or a duration string such as '30s' or '1h30m'")
    }

    fn visit_u64<E>(self, seconds: u64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(Duration::from_secs(seconds))
    }

    fn visit_i64<E>(self, seconds: i64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        u64::try_from(seconds)
            .map(Duration::from_secs)
            .map_err(|_| de::Error::custom(format!("Negative duration: {seconds}")))
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        humantime::parse_duration(value)
            .map_err(|e| de::Error::custom(format!("Invalid duration '{value}': {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Holder {
        #[serde(with = "duration")]
        every: Duration,
    }

    #[test]
    fn test_parses_human_and_numeric_forms() {
        let human: Holder = toml::from_str("every = \"5m\"").unwrap();
        assert_eq!(human.every, Duration::from_secs(300));

        let numeric: Holder = toml::from_str("every = 30").unwrap();
        assert_eq!(numeric.every, Duration::from_secs(30));

        assert!(toml::from_str::<Holder>("every = \"soon\"").is_err());
    }

    #[test]
    fn test_serializes_as_humantime() {
        let out = toml::to_string(&Holder {
            every: Duration::from_secs(90),
        })
        .unwrap();
        assert!(out.contains("1m 30s"));
    }
}
