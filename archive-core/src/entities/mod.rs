mod channel;
mod emoji;
mod file_attachment;
mod post;
mod reaction;
mod team;
mod user;

pub use channel::{Channel, ChannelType};
pub use emoji::Emoji;
pub use file_attachment::FileAttachment;
pub use post::{Post, PostEmojis};
pub use reaction::PostReaction;
pub use team::{Team, TeamType};
pub use user::User;

pub use crate::ids::EntityLocator;

use serde_json::{Map, Value};

use crate::error::CoreError;

/// Pulls the object map out of a raw server payload, or fails with a
/// descriptive error if the server sent something else.
pub(crate) fn as_object(entity: &'static str, raw: Value) -> Result<Map<String, Value>, CoreError> {
    match raw {
        Value::Object(m) => Ok(m),
        _ => Err(CoreError::NotAnObject { entity }),
    }
}

pub(crate) fn require<T: serde::de::DeserializeOwned>(
    entity: &'static str,
    raw: &mut Map<String, Value>,
    field: &'static str,
) -> Result<T, CoreError> {
    let value = raw
        .remove(field)
        .ok_or(CoreError::MissingField { entity, field })?;
    serde_json::from_value(value).map_err(|_| CoreError::MissingField { entity, field })
}
