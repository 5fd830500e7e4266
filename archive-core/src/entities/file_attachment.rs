use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::{as_object, require};
use crate::error::CoreError;
use crate::ids::{Id, Time};
use crate::misc::{clean_misc, drop_key, take_if_ne, Misc};

const ENTITY: &str = "file attachment";

const DROPPED_FIELDS: &[&str] = &[
    "user_id",
    "post_id",
    "width",
    "height",
    "has_preview_image",
    "mini_preview",
    "extension",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub id: Id,
    pub name: String,
    #[serde(rename = "byteSize")]
    pub byte_size: u64,
    #[serde(rename = "createTime")]
    pub create_time: Time,
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none", default)]
    pub mime_type: Option<String>,
    #[serde(rename = "updateTime", skip_serializing_if = "Option::is_none", default)]
    pub update_time: Option<Time>,
    #[serde(rename = "deleteTime", skip_serializing_if = "Option::is_none", default)]
    pub delete_time: Option<Time>,
    #[serde(flatten, skip_serializing_if = "Misc::is_empty", default)]
    pub misc: Misc,
}

impl FileAttachment {
    pub fn from_server(raw: Value) -> Result<FileAttachment, CoreError> {
        let mut raw = as_object(ENTITY, raw)?;

        let id: Id = require(ENTITY, &mut raw, "id")?;
        let name: String = require(ENTITY, &mut raw, "name")?;
        let byte_size: u64 = require(ENTITY, &mut raw, "size")?;
        let create_time: Time = require(ENTITY, &mut raw, "create_at")?;
        let mime_type = raw.remove("mime_type").and_then(|v| v.as_str().map(str::to_string));
        let update_time = take_if_ne(&mut raw, "update_at", &create_time);
        let delete_time = raw
            .remove("delete_at")
            .and_then(|v| serde_json::from_value::<Time>(v).ok())
            .filter(|t| !t.is_zero());

        for field in DROPPED_FIELDS {
            drop_key(&mut raw, field);
        }

        let mut misc: Misc = Misc::new();
        misc.extend(raw);
        clean_misc(&mut misc);

        Ok(FileAttachment {
            id,
            name,
            byte_size,
            create_time,
            mime_type,
            update_time,
            delete_time,
            misc,
        })
    }
}
