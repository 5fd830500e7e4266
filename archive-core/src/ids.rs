use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Opaque server-assigned identifier. Never parsed, only compared and
/// displayed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Id(s)
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Id(s.to_string())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since the Unix epoch. The server sends either an integer
/// epoch-millis value or an ISO-8601 string depending on the endpoint;
/// archive files always store the integer form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(pub i64);

impl Time {
    pub const ZERO: Time = Time(0);

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.0)
    }
}

impl From<i64> for Time {
    fn from(millis: i64) -> Self {
        Time(millis)
    }
}

impl Default for Time {
    fn default() -> Self {
        Time::ZERO
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            // Seconds resolution only; sub-second precision isn't meaningful for logging.
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S")),
            None => write!(f, "{}", self.0),
        }
    }
}

impl Serialize for Time {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> Deserialize<'de> for Time {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TimeVisitor;

        impl<'de> serde::de::Visitor<'de> for TimeVisitor {
            type Value = Time;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an integer epoch-millis timestamp or an ISO-8601 string")
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Time, E> {
                Ok(Time(v))
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Time, E> {
                Ok(Time(v as i64))
            }

            fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Time, E> {
                Ok(Time(v as i64))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Time, E> {
                let dt: DateTime<Utc> = v.parse().map_err(|e| {
                    E::custom(format!("invalid ISO-8601 timestamp {v:?}: {e}"))
                })?;
                Ok(Time(dt.timestamp_millis()))
            }
        }

        deserializer.deserialize_any(TimeVisitor)
    }
}

/// Refers to an entity by exactly one of id, display name, or internal
/// (URL-safe) name. Config deserialization rejects zero or more than one
/// field present.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityLocator {
    Id(Id),
    Name(String),
    InternalName(String),
}

impl Serialize for EntityLocator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("EntityLocator", 1)?;
        match self {
            EntityLocator::Id(id) => state.serialize_field("id", id.as_str())?,
            EntityLocator::Name(name) => state.serialize_field("name", name)?,
            EntityLocator::InternalName(name) => state.serialize_field("internalName", name)?,
        }
        state.end()
    }
}

impl<'de> Deserialize<'de> for EntityLocator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            id: Option<String>,
            name: Option<String>,
            #[serde(rename = "internalName")]
            internal_name: Option<String>,
        }

        let raw = Raw::deserialize(deserializer)?;
        let present = [raw.id.is_some(), raw.name.is_some(), raw.internal_name.is_some()]
            .iter()
            .filter(|p| **p)
            .count();
        if present != 1 {
            return Err(serde::de::Error::custom(
                "an entity locator must set exactly one of id, name, internalName",
            ));
        }
        Ok(if let Some(id) = raw.id {
            EntityLocator::Id(Id(id))
        } else if let Some(name) = raw.name {
            EntityLocator::Name(name)
        } else {
            EntityLocator::InternalName(raw.internal_name.unwrap())
        })
    }
}
