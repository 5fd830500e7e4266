use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::{as_object, require};
use crate::error::CoreError;
use crate::ids::{EntityLocator, Id, Time};
use crate::misc::{clean_misc, drop_key, take_if_ne, Misc};

const ENTITY: &str = "user";

/// Fields the server sends that are never archived, either because they are
/// credentials, or because they describe per-client notification state that
/// has no place in a shared archive.
const DROPPED_FIELDS: &[&str] = &[
    "auth_service",
    "email",
    "email_verified",
    "disable_welcome_email",
    "last_password_update",
    "locale",
    "timezone",
    "notify_props",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Id,
    pub name: String,
    #[serde(rename = "createTime")]
    pub create_time: Time,
    #[serde(rename = "updateTime", skip_serializing_if = "Option::is_none", default)]
    pub update_time: Option<Time>,
    #[serde(rename = "deleteTime", skip_serializing_if = "Option::is_none", default)]
    pub delete_time: Option<Time>,
    #[serde(rename = "firstName", skip_serializing_if = "Option::is_none", default)]
    pub first_name: Option<String>,
    #[serde(rename = "lastName", skip_serializing_if = "Option::is_none", default)]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub nickname: Option<String>,
    #[serde(rename = "updateAvatarTime", skip_serializing_if = "Option::is_none", default)]
    pub update_avatar_time: Option<Time>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub position: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub roles: Vec<String>,
    #[serde(rename = "avatarFileName", skip_serializing_if = "Option::is_none", default)]
    pub avatar_file_name: Option<String>,
    #[serde(flatten, skip_serializing_if = "Misc::is_empty", default)]
    pub misc: Misc,
}

impl User {
    /// Converts a raw `/users/{id}` (or embedded-in-channel-member) payload.
    pub fn from_server(raw: Value) -> Result<User, CoreError> {
        let mut raw = as_object(ENTITY, raw)?;

        let id: Id = require(ENTITY, &mut raw, "id")?;
        let name: String = require(ENTITY, &mut raw, "username")?;
        let create_time: Time = require(ENTITY, &mut raw, "create_at")?;
        let update_time = take_if_ne(&mut raw, "update_at", &create_time);
        let delete_time: Option<Time> = raw
            .remove("delete_at")
            .and_then(|v| serde_json::from_value::<Time>(v).ok())
            .filter(|t| !t.is_zero());
        let first_name = raw.remove("first_name").and_then(to_nonempty_string);
        let last_name = raw.remove("last_name").and_then(to_nonempty_string);
        let nickname = raw.remove("nickname").and_then(to_nonempty_string);
        let position = raw.remove("position").and_then(to_nonempty_string);

        let update_avatar_time = raw
            .remove("last_picture_update")
            .and_then(|v| serde_json::from_value::<Time>(v).ok())
            .filter(|t| !t.is_zero() && *t != create_time);

        let roles = raw
            .remove("roles")
            .and_then(|v| v.as_str().map(str::to_string))
            .map(|s| {
                let parts: Vec<String> = s.split_whitespace().map(str::to_string).collect();
                if parts == ["system_user"] {
                    Vec::new()
                } else {
                    parts
                }
            })
            .unwrap_or_default();

        for field in DROPPED_FIELDS {
            drop_key(&mut raw, field);
        }

        let mut misc: Misc = Misc::new();
        if let Some(Value::Object(mut props)) = raw.remove("props") {
            props.remove("customStatus");
            props.retain(|_, v| !matches!(v, Value::String(s) if s.is_empty()));
            if !props.is_empty() {
                misc.insert("props".to_string(), Value::Object(props));
            }
        }
        misc.extend(raw);
        clean_misc(&mut misc);

        Ok(User {
            id,
            name,
            create_time,
            update_time,
            delete_time,
            first_name,
            last_name,
            nickname,
            update_avatar_time,
            position,
            roles,
            avatar_file_name: None,
            misc,
        })
    }

    pub fn matches(&self, locator: &EntityLocator) -> bool {
        match locator {
            EntityLocator::Id(id) => &self.id == id,
            EntityLocator::Name(name) => &self.name == name,
            EntityLocator::InternalName(name) => &self.name == name,
        }
    }
}

fn to_nonempty_string(v: Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s),
        _ => None,
    }
}
