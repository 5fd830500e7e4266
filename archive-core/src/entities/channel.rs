use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::user::User;
use crate::entities::{as_object, require};
use crate::error::CoreError;
use crate::ids::{EntityLocator, Id, Time};
use crate::misc::{clean_misc, drop_key, take_if_ne, Misc};

const ENTITY: &str = "channel";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelType {
    Open,
    Private,
    Group,
    Direct,
}

impl ChannelType {
    pub fn from_wire_tag(tag: &str, channel_id: &Id) -> ChannelType {
        match tag {
            "O" => ChannelType::Open,
            "P" => ChannelType::Private,
            "G" => ChannelType::Group,
            "D" => ChannelType::Direct,
            other => {
                log::warn!(
                    "channel {channel_id} has unrecognized type tag {other:?}, treating as Open"
                );
                ChannelType::Open
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: Id,
    #[serde(rename = "internalName")]
    pub internal_name: String,
    #[serde(rename = "createTime")]
    pub create_time: Time,
    #[serde(rename = "type")]
    pub kind: ChannelType,
    #[serde(rename = "messageCount")]
    pub message_count: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
    #[serde(rename = "creatorUserId", skip_serializing_if = "Option::is_none", default)]
    pub creator_user_id: Option<Id>,
    #[serde(rename = "updateTime", skip_serializing_if = "Option::is_none", default)]
    pub update_time: Option<Time>,
    #[serde(rename = "deleteTime", skip_serializing_if = "Option::is_none", default)]
    pub delete_time: Option<Time>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub header: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub purpose: Option<String>,
    #[serde(rename = "rootMessageCount", skip_serializing_if = "Option::is_none", default)]
    pub root_message_count: Option<u64>,
    /// Approximate — see the fetcher's own offset-resolution handling of
    /// server-reported counts being inexact.
    #[serde(rename = "lastMessageTime", skip_serializing_if = "Option::is_none", default)]
    pub last_message_time: Option<Time>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub members: Vec<User>,
    #[serde(flatten, skip_serializing_if = "Misc::is_empty", default)]
    pub misc: Misc,
}

impl Channel {
    pub fn from_server(raw: Value) -> Result<Channel, CoreError> {
        let mut raw = as_object(ENTITY, raw)?;

        let id: Id = require(ENTITY, &mut raw, "id")?;
        let kind_tag: String = require(ENTITY, &mut raw, "type")?;
        let kind = ChannelType::from_wire_tag(&kind_tag, &id);
        let internal_name: String = require(ENTITY, &mut raw, "name")?;
        let create_time: Time = require(ENTITY, &mut raw, "create_at")?;
        let message_count: u64 = raw
            .remove("total_msg_count")
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(0);
        let root_message_count = raw
            .remove("total_msg_count_root")
            .and_then(|v| serde_json::from_value(v).ok());

        let name = raw
            .remove("display_name")
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.is_empty());
        let creator_user_id = raw.remove("creator_id").and_then(|v| serde_json::from_value(v).ok());
        let update_time = take_if_ne(&mut raw, "update_at", &create_time);
        let delete_time = raw
            .remove("delete_at")
            .and_then(|v| serde_json::from_value::<Time>(v).ok())
            .filter(|t| !t.is_zero());
        let header = raw.remove("header").and_then(|v| v.as_str().map(str::to_string)).filter(|s| !s.is_empty());
        let purpose = raw.remove("purpose").and_then(|v| v.as_str().map(str::to_string)).filter(|s| !s.is_empty());
        let last_message_time = raw
            .remove("last_post_at")
            .and_then(|v| serde_json::from_value::<Time>(v).ok())
            .filter(|t| !t.is_zero());

        for field in ["team_id", "extra_update_at", "group_constrained"] {
            drop_key(&mut raw, field);
        }

        let mut misc: Misc = Misc::new();
        misc.extend(raw);
        clean_misc(&mut misc);

        Ok(Channel {
            id,
            internal_name,
            create_time,
            kind,
            message_count,
            name,
            creator_user_id,
            update_time,
            delete_time,
            header,
            purpose,
            root_message_count,
            last_message_time,
            members: Vec::new(),
            misc,
        })
    }

    pub fn matches(&self, locator: &EntityLocator) -> bool {
        match locator {
            EntityLocator::Id(id) => &self.id == id,
            EntityLocator::InternalName(name) => &self.internal_name == name,
            EntityLocator::Name(name) => self.name.as_deref() == Some(name.as_str()),
        }
    }

    /// Lexicographically-ordered `{smaller}__{larger}` stem the server uses
    /// as a direct channel's internal name.
    pub fn direct_channel_internal_name(local_user_id: &Id, other_user_id: &Id) -> String {
        if local_user_id.as_str() <= other_user_id.as_str() {
            format!("{local_user_id}__{other_user_id}")
        } else {
            format!("{other_user_id}__{local_user_id}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn direct_channel_internal_name_is_order_independent() {
        let a = Id("aaa".to_string());
        let b = Id("bbb".to_string());
        assert_eq!(Channel::direct_channel_internal_name(&a, &b), "aaa__bbb");
        assert_eq!(Channel::direct_channel_internal_name(&b, &a), "aaa__bbb");
    }

    #[test]
    fn unrecognized_type_tag_falls_back_to_open_with_a_warning() {
        let channel = Channel::from_server(json!({
            "id": "c1",
            "name": "town-square",
            "type": "Z",
            "create_at": 1000,
        }))
        .unwrap();
        assert_eq!(channel.kind, ChannelType::Open);
    }

    #[test]
    fn archive_round_trip_preserves_an_entity_built_from_server() {
        let original = Channel::from_server(json!({
            "id": "c1",
            "name": "town-square",
            "display_name": "Town Square",
            "type": "O",
            "create_at": 1000,
            "total_msg_count": 42,
            "team_id": "t1",
            "group_constrained": false,
        }))
        .unwrap();
        assert!(!original.misc.contains_key("team_id"));

        let archived = serde_json::to_value(&original).unwrap();
        let restored: Channel = serde_json::from_value(archived).unwrap();
        assert_eq!(restored, original);
    }
}
