use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::channel::Channel;
use crate::entities::{as_object, require};
use crate::error::CoreError;
use crate::ids::{EntityLocator, Id, Time};
use crate::misc::{clean_misc, drop_key, take_if_ne, Misc};

const ENTITY: &str = "team";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TeamType {
    Open,
    InviteOnly,
}

impl TeamType {
    pub fn from_wire_tag(tag: &str, team_id: &Id) -> TeamType {
        match tag {
            "O" => TeamType::Open,
            "I" => TeamType::InviteOnly,
            other => {
                log::warn!("team {team_id} has unrecognized type tag {other:?}, treating as Open");
                TeamType::Open
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub id: Id,
    pub name: String,
    #[serde(rename = "internalName")]
    pub internal_name: String,
    #[serde(rename = "type")]
    pub kind: TeamType,
    #[serde(rename = "createTime")]
    pub create_time: Time,
    #[serde(rename = "updateTime", skip_serializing_if = "Option::is_none", default)]
    pub update_time: Option<Time>,
    #[serde(rename = "deleteTime", skip_serializing_if = "Option::is_none", default)]
    pub delete_time: Option<Time>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
    #[serde(rename = "updateAvatarTime", skip_serializing_if = "Option::is_none", default)]
    pub update_avatar_time: Option<Time>,
    #[serde(rename = "inviteId", skip_serializing_if = "Option::is_none", default)]
    pub invite_id: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub channels: HashMap<Id, Channel>,
    #[serde(flatten, skip_serializing_if = "Misc::is_empty", default)]
    pub misc: Misc,
}

impl Team {
    pub fn from_server(raw: Value) -> Result<Team, CoreError> {
        let mut raw = as_object(ENTITY, raw)?;

        let id: Id = require(ENTITY, &mut raw, "id")?;
        let name: String = require(ENTITY, &mut raw, "display_name")?;
        let internal_name: String = require(ENTITY, &mut raw, "name")?;
        let kind_tag: String = require(ENTITY, &mut raw, "type")?;
        let kind = TeamType::from_wire_tag(&kind_tag, &id);
        let create_time: Time = require(ENTITY, &mut raw, "create_at")?;
        let update_time = take_if_ne(&mut raw, "update_at", &create_time);
        let delete_time = raw
            .remove("delete_at")
            .and_then(|v| serde_json::from_value::<Time>(v).ok())
            .filter(|t| !t.is_zero());
        let description = raw
            .remove("description")
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.is_empty());
        let update_avatar_time = raw
            .remove("last_team_icon_update")
            .and_then(|v| serde_json::from_value::<Time>(v).ok())
            .filter(|t| !t.is_zero() && *t != create_time);
        let invite_id = raw
            .remove("invite_id")
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.is_empty());

        for field in ["allow_open_invite", "allowed_domains"] {
            drop_key(&mut raw, field);
        }

        let mut misc: Misc = Misc::new();
        misc.extend(raw);
        clean_misc(&mut misc);

        Ok(Team {
            id,
            name,
            internal_name,
            kind,
            create_time,
            update_time,
            delete_time,
            description,
            update_avatar_time,
            invite_id,
            channels: HashMap::new(),
            misc,
        })
    }

    pub fn matches(&self, locator: &EntityLocator) -> bool {
        match locator {
            EntityLocator::Id(id) => &self.id == id,
            EntityLocator::InternalName(name) => &self.internal_name == name,
            EntityLocator::Name(name) => &self.name == name,
        }
    }
}
