//! Serde support for Duration as milliseconds

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    (duration.as_millis() as u64).serialize(serializer)
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

/// `Option<Duration>` as nullable milliseconds
pub mod option {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timings {
        #[serde(with = "crate::serde_millis")]
        interval: Duration,
        #[serde(default, with = "crate::serde_millis::option")]
        estimate: Option<Duration>,
    }

    #[test]
    fn test_millis_format() {
        let timings = Timings {
            interval: Duration::from_secs(2),
            estimate: Some(Duration::from_millis(1500)),
        };
        let json = serde_json::to_value(&timings).unwrap();
        assert_eq!(json, serde_json::json!({"interval": 2000, "estimate": 1500}));
    }

    #[test]
    fn test_missing_option_is_none() {
        let timings: Timings = serde_json::from_str(r#"{"interval": 10}"#).unwrap();
        assert_eq!(timings.interval, Duration::from_millis(10));
        assert_eq!(timings.estimate, None);
    }
}
