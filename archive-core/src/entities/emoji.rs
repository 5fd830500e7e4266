use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::{as_object, require};
use crate::error::CoreError;
use crate::ids::{Id, Time};
use crate::misc::{clean_misc, take_if_ne, Misc};

const ENTITY: &str = "emoji";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Emoji {
    pub id: Id,
    #[serde(rename = "creatorId")]
    pub creator_id: Id,
    pub name: String,
    #[serde(rename = "createTime")]
    pub create_time: Time,
    #[serde(rename = "updateTime", skip_serializing_if = "Option::is_none", default)]
    pub update_time: Option<Time>,
    #[serde(rename = "deleteTime", skip_serializing_if = "Option::is_none", default)]
    pub delete_time: Option<Time>,
    /// Redundant display name, filled in only when
    /// `verboseHumanFriendlyPosts` enrichment is enabled.
    #[serde(rename = "creatorName", skip_serializing_if = "Option::is_none", default)]
    pub creator_name: Option<String>,
    #[serde(rename = "imageFileName", skip_serializing_if = "Option::is_none", default)]
    pub image_file_name: Option<String>,
    #[serde(flatten, skip_serializing_if = "Misc::is_empty", default)]
    pub misc: Misc,
}

impl Emoji {
    pub fn from_server(raw: Value) -> Result<Emoji, CoreError> {
        let mut raw = as_object(ENTITY, raw)?;

        let id: Id = require(ENTITY, &mut raw, "id")?;
        let creator_id: Id = require(ENTITY, &mut raw, "creator_id")?;
        let name: String = require(ENTITY, &mut raw, "name")?;
        let create_time: Time = require(ENTITY, &mut raw, "create_at")?;
        let update_time = take_if_ne(&mut raw, "update_at", &create_time);
        let delete_time = raw
            .remove("delete_at")
            .and_then(|v| serde_json::from_value::<Time>(v).ok())
            .filter(|t| !t.is_zero());

        let mut misc: Misc = Misc::new();
        misc.extend(raw);
        clean_misc(&mut misc);

        Ok(Emoji {
            id,
            creator_id,
            name,
            create_time,
            update_time,
            delete_time,
            creator_name: None,
            image_file_name: None,
            misc,
        })
    }
}
