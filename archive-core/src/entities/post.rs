use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::emoji::Emoji;
use crate::entities::file_attachment::FileAttachment;
use crate::entities::reaction::PostReaction;
use crate::entities::{as_object, require};
use crate::error::CoreError;
use crate::ids::{Id, Time};
use crate::misc::{clean_misc, drop_key, take_if_ne, Misc};

const ENTITY: &str = "post";

/// While a post is being processed its reacted-to emoji are kept as full
/// entities (so the fetcher can route them into the channel's used-emoji
/// set); once committed to the archive only their ids are worth keeping,
/// since the full entity already lives in the header's emoji table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PostEmojis {
    Full(Vec<Emoji>),
    Ids(Vec<Id>),
}

impl PostEmojis {
    pub fn is_empty(&self) -> bool {
        match self {
            PostEmojis::Full(v) => v.is_empty(),
            PostEmojis::Ids(v) => v.is_empty(),
        }
    }

    pub fn into_ids(self) -> Vec<Id> {
        match self {
            PostEmojis::Full(v) => v.into_iter().map(|e| e.id).collect(),
            PostEmojis::Ids(v) => v,
        }
    }
}

impl Default for PostEmojis {
    fn default() -> Self {
        PostEmojis::Ids(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: Id,
    #[serde(rename = "userId")]
    pub user_id: Id,
    #[serde(rename = "createTime")]
    pub create_time: Time,
    pub message: String,
    #[serde(rename = "isPinned", skip_serializing_if = "Option::is_none", default)]
    pub is_pinned: Option<bool>,
    #[serde(rename = "updateTime", skip_serializing_if = "Option::is_none", default)]
    pub update_time: Option<Time>,
    /// Last *visible* edit time; distinct from `updateTime`, which also
    /// changes for invisible housekeeping updates (e.g. reaction counters).
    #[serde(rename = "publicUpdateTime", skip_serializing_if = "Option::is_none", default)]
    pub public_update_time: Option<Time>,
    #[serde(rename = "deleteTime", skip_serializing_if = "Option::is_none", default)]
    pub delete_time: Option<Time>,
    #[serde(rename = "parentPostId", skip_serializing_if = "Option::is_none", default)]
    pub parent_post_id: Option<Id>,
    #[serde(rename = "rootPostId", skip_serializing_if = "Option::is_none", default)]
    pub root_post_id: Option<Id>,
    #[serde(rename = "specialMsgType", skip_serializing_if = "Option::is_none", default)]
    pub special_msg_type: Option<String>,
    #[serde(skip_serializing_if = "PostEmojis::is_empty", default)]
    pub emojis: PostEmojis,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub attachments: Vec<FileAttachment>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub reactions: Vec<PostReaction>,
    /// Redundant display name, filled in only under `verboseHumanFriendlyPosts`.
    #[serde(rename = "userName", skip_serializing_if = "Option::is_none", default)]
    pub user_name: Option<String>,
    #[serde(flatten, skip_serializing_if = "Misc::is_empty", default)]
    pub misc: Misc,
}

impl Post {
    pub fn from_server(raw: Value) -> Result<Post, CoreError> {
        let mut raw = as_object(ENTITY, raw)?;

        let id: Id = require(ENTITY, &mut raw, "id")?;
        let user_id: Id = require(ENTITY, &mut raw, "user_id")?;
        let create_time: Time = require(ENTITY, &mut raw, "create_at")?;
        let message: String = require(ENTITY, &mut raw, "message")?;

        let update_time = take_if_ne(&mut raw, "update_at", &create_time);
        let public_update_time = raw
            .remove("edit_at")
            .and_then(|v| serde_json::from_value::<Time>(v).ok())
            .filter(|t| !t.is_zero())
            .filter(|t| update_time.as_ref().is_none_or(|u| u != t));
        let delete_time = raw
            .remove("delete_at")
            .and_then(|v| serde_json::from_value::<Time>(v).ok())
            .filter(|t| !t.is_zero());

        let parent_post_id: Option<Id> = raw
            .remove("parent_id")
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.is_empty())
            .map(Id);
        let root_post_id: Option<Id> = raw
            .remove("root_id")
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.is_empty())
            .map(Id)
            .filter(|root| Some(root) != parent_post_id.as_ref());

        let is_pinned = raw
            .remove("is_pinned")
            .and_then(|v| v.as_bool())
            .filter(|b| *b);

        let special_msg_type = raw
            .remove("type")
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.is_empty());

        for field in [
            "channel_id",
            "reply_count",
            "has_reactions",
            "file_ids",
            "hashtags",
            "last_reply_at",
        ] {
            drop_key(&mut raw, field);
        }

        let mut emojis = Vec::new();
        let mut attachments = Vec::new();
        let mut reactions = Vec::new();
        let mut leftover_metadata = serde_json::Map::new();

        if let Some(Value::Object(mut metadata)) = raw.remove("metadata") {
            metadata.remove("embeds");
            metadata.remove("images");

            if let Some(Value::Array(items)) = metadata.remove("emojis") {
                for item in items {
                    emojis.push(Emoji::from_server(item)?);
                }
            }
            if let Some(Value::Array(items)) = metadata.remove("files") {
                for item in items {
                    attachments.push(FileAttachment::from_server(item)?);
                }
            }
            if let Some(Value::Array(items)) = metadata.remove("reactions") {
                for item in items {
                    reactions.push(PostReaction::from_server(item)?);
                }
            }

            leftover_metadata = metadata;
        }

        let mut props_misc = serde_json::Map::new();
        if let Some(Value::Object(mut props)) = raw.remove("props") {
            for field in ["disable_group_highlight", "channel_mentions"] {
                props.remove(field);
            }
            props.retain(|_, v| !matches!(v, Value::String(s) if s.is_empty()));
            if !props.is_empty() {
                props_misc.insert("props".to_string(), Value::Object(props));
            }
        }

        let mut misc: Misc = Misc::new();
        misc.extend(raw);
        misc.extend(props_misc);
        if !leftover_metadata.is_empty() {
            misc.insert("metadata".to_string(), Value::Object(leftover_metadata));
        }
        clean_misc(&mut misc);

        Ok(Post {
            id,
            user_id,
            create_time,
            message,
            is_pinned,
            update_time,
            public_update_time,
            delete_time,
            parent_post_id,
            root_post_id,
            special_msg_type,
            emojis: if emojis.is_empty() {
                PostEmojis::Ids(Vec::new())
            } else {
                PostEmojis::Full(emojis)
            },
            attachments,
            reactions,
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
    fn from_server_drops_reconstructable_fields_and_collapses_timestamps() {
        let post = Post::from_server(json!({
            "id": "p1",
            "user_id": "u1",
            "create_at": 1000,
            "update_at": 1000,
            "edit_at": 0,
            "message": "hello",
            "channel_id": "c1",
            "reply_count": 3,
            "has_reactions": false,
            "file_ids": ["f1"],
            "hashtags": "",
            "last_reply_at": 0,
            "type": "",
        }))
        .unwrap();

        assert_eq!(post.update_time, None);
        assert_eq!(post.public_update_time, None);
        assert_eq!(post.special_msg_type, None);
        assert!(post.misc.is_empty());
    }

    #[test]
    fn root_post_id_is_dropped_when_equal_to_parent() {
        let post = Post::from_server(json!({
            "id": "p2",
            "user_id": "u1",
            "create_at": 1000,
            "message": "reply",
            "parent_id": "p1",
            "root_id": "p1",
        }))
        .unwrap();

        assert_eq!(post.parent_post_id, Some(Id("p1".to_string())));
        assert_eq!(post.root_post_id, None);
    }

    #[test]
    fn metadata_emojis_files_and_reactions_are_extracted() {
        let post = Post::from_server(json!({
            "id": "p1",
            "user_id": "u1",
            "create_at": 1000,
            "message": "hi :tada:",
            "metadata": {
                "emojis": [{"id": "e1", "creator_id": "u1", "create_at": 1000, "name": "tada"}],
                "files": [{"id": "f1", "name": "a.png", "size": 10, "create_at": 1000}],
                "reactions": [{"user_id": "u2", "create_at": 1000, "emoji_name": "tada"}],
                "embeds": [{"type": "opengraph"}],
            },
        }))
        .unwrap();

        assert_eq!(post.emojis.into_ids(), vec![Id("e1".to_string())]);
        assert_eq!(post.attachments.len(), 1);
        assert_eq!(post.reactions.len(), 1);
        assert!(!post.misc.contains_key("metadata"));
    }

    #[test]
    fn archive_round_trip_preserves_an_entity_built_from_server() {
        let original = Post::from_server(json!({
            "id": "p1",
            "user_id": "u1",
            "create_at": 1000,
            "message": "hello",
            "metadata": {
                "reactions": [{"user_id": "u2", "create_at": 1000, "emoji_name": "tada"}],
            },
            "props": {"some_future_prop": "value"},
        }))
        .unwrap();

        let archived = serde_json::to_value(&original).unwrap();
        let restored: Post = serde_json::from_value(archived).unwrap();
        assert_eq!(restored, original);
    }
}
