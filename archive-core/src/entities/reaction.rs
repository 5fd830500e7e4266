use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::{as_object, require};
use crate::error::CoreError;
use crate::ids::{Id, Time};
use crate::misc::{clean_misc, drop_key, take_if_ne, Misc};

const ENTITY: &str = "post reaction";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostReaction {
    #[serde(rename = "userId")]
    pub user_id: Id,
    #[serde(rename = "createTime")]
    pub create_time: Time,
    #[serde(rename = "updateTime", skip_serializing_if = "Option::is_none", default)]
    pub update_time: Option<Time>,
    #[serde(rename = "deleteTime", skip_serializing_if = "Option::is_none", default)]
    pub delete_time: Option<Time>,
    #[serde(rename = "emojiId", skip_serializing_if = "Option::is_none", default)]
    pub emoji_id: Option<Id>,
    #[serde(rename = "emojiName", skip_serializing_if = "Option::is_none", default)]
    pub emoji_name: Option<String>,
    /// Redundant display name, filled in only under `verboseHumanFriendlyPosts`.
    #[serde(rename = "userName", skip_serializing_if = "Option::is_none", default)]
    pub user_name: Option<String>,
    #[serde(flatten, skip_serializing_if = "Misc::is_empty", default)]
    pub misc: Misc,
}

impl PostReaction {
    pub fn from_server(raw: Value) -> Result<PostReaction, CoreError> {
        let mut raw = as_object(ENTITY, raw)?;

        let user_id: Id = require(ENTITY, &mut raw, "user_id")?;
        let create_time: Time = require(ENTITY, &mut raw, "create_at")?;
        let update_time = take_if_ne(&mut raw, "update_at", &create_time);
        let delete_time = raw
            .remove("delete_at")
            .and_then(|v| serde_json::from_value::<Time>(v).ok())
            .filter(|t| !t.is_zero());
        let emoji_id = raw.remove("emoji_id").and_then(|v| serde_json::from_value(v).ok());
        let emoji_name = raw
            .remove("emoji_name")
            .and_then(|v| v.as_str().map(str::to_string));

        drop_key(&mut raw, "post_id");

        let mut misc: Misc = Misc::new();
        misc.extend(raw);
        clean_misc(&mut misc);

        Ok(PostReaction {
            user_id,
            create_time,
            update_time,
            delete_time,
            emoji_id,
            emoji_name,
            user_name: None,
            misc,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn archive_round_trip_preserves_an_entity_built_from_server() {
        let original = PostReaction::from_server(json!({
            "user_id": "u1",
            "create_at": 1000,
            "post_id": "p1",
            "emoji_name": "tada",
        }))
        .unwrap();
        assert!(!original.misc.contains_key("post_id"));

        let archived = serde_json::to_value(&original).unwrap();
        let restored: PostReaction = serde_json::from_value(archived).unwrap();
        assert_eq!(restored, original);
    }
}
