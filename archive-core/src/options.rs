use serde::{Deserialize, Serialize};

use crate::ids::{Id, Time};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderDirection {
    Asc,
    Desc,
}

/// Per-channel download policy: how far back to go, which direction to
/// prefer, and which auxiliary files to fetch alongside the posts
/// themselves. Consumed directly by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelOptions {
    pub posts_after_id: Option<Id>,
    pub posts_before_id: Option<Id>,
    pub posts_after_time: Option<Time>,
    pub posts_before_time: Option<Time>,
    /// -1 means unlimited; 0 means metadata only, no posts fetched at all.
    pub post_limit: i64,
    /// Caps how many posts a single run will fetch for this channel,
    /// independent of `post_limit`'s lifetime total.
    pub post_session_limit: i64,
    pub redownload: bool,
    pub download_time_direction: OrderDirection,
    pub download_attachments: bool,
    pub download_attachment_types: Vec<String>,
    /// 0 means no limit.
    pub download_attachment_size_limit: u64,
    pub emoji_metadata: bool,
    pub download_emoji: bool,
    pub download_avatars: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        ChannelOptions {
            posts_after_id: None,
            posts_before_id: None,
            posts_after_time: None,
            posts_before_time: None,
            post_limit: -1,
            post_session_limit: -1,
            redownload: false,
            download_time_direction: OrderDirection::Asc,
            download_attachments: false,
            download_attachment_types: Vec::new(),
            download_attachment_size_limit: 0,
            emoji_metadata: false,
            download_emoji: false,
            download_avatars: false,
        }
    }
}
