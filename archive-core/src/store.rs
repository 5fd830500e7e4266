//! On-disk archive format: a header (`<stem>.meta.json`) and the post log
//! (`<stem>.data.json`, newline-delimited JSON objects).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::entities::{Channel, Emoji, Team, User};
use crate::error::CoreError;
use crate::ids::{Id, Time};
use crate::options::{ChannelOptions, OrderDirection};

/// The archive format's own major/minor version. A header whose major
/// component doesn't match `MAJOR_VERSION` is treated as unreadable by the
/// planner (see `planner::plan`), not silently upgraded.
pub const MAJOR_VERSION: u32 = 0;
pub const MINOR_VERSION: u32 = 1;

/// Hints about the post immediately outside a fetched window, supplied by
/// the fetcher so storage bookkeeping can record contiguous boundaries
/// without re-deriving them.
#[derive(Debug, Clone, Default)]
pub struct PostHints {
    pub post_id_before: Option<Id>,
    pub post_id_after: Option<Id>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostOrdering {
    Unsorted,
    Ascending,
    Descending,
    AscendingContinuous,
    DescendingContinuous,
}

impl PostOrdering {
    pub fn from_store_name(name: &str) -> PostOrdering {
        match name {
            "Ascending" => PostOrdering::Ascending,
            "Descending" => PostOrdering::Descending,
            "AscendingContinuous" => PostOrdering::AscendingContinuous,
            "DescendingContinuous" => PostOrdering::DescendingContinuous,
            "Unsorted" => PostOrdering::Unsorted,
            other => {
                log::warn!("archive header has unrecognized post ordering {other:?}, treating as Unsorted");
                PostOrdering::Unsorted
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostStorage {
    #[serde(default)]
    pub count: u64,
    #[serde(default = "default_organization")]
    pub organization: PostOrdering,
    #[serde(rename = "byteSize", default)]
    pub byte_size: u64,
    #[serde(rename = "postIdBeforeFirst", skip_serializing_if = "Option::is_none", default)]
    pub post_id_before_first: Option<Id>,
    #[serde(rename = "beginTime", default)]
    pub begin_time: Time,
    #[serde(rename = "firstPostId", default)]
    pub first_post_id: Id,
    #[serde(rename = "endTime", default)]
    pub end_time: Time,
    #[serde(rename = "lastPostId", default)]
    pub last_post_id: Id,
    #[serde(rename = "postIdAfterLast", skip_serializing_if = "Option::is_none", default)]
    pub post_id_after_last: Option<Id>,
}

fn default_organization() -> PostOrdering {
    PostOrdering::Unsorted
}

impl Default for PostStorage {
    fn default() -> Self {
        PostStorage {
            count: 0,
            organization: PostOrdering::Unsorted,
            byte_size: 0,
            post_id_before_first: None,
            begin_time: Time::ZERO,
            first_post_id: Id(String::new()),
            end_time: Time::ZERO,
            last_post_id: Id(String::new()),
            post_id_after_last: None,
        }
    }
}

impl PostStorage {
    pub fn from_options(options: &ChannelOptions) -> PostStorage {
        let organization = match options.download_time_direction {
            OrderDirection::Asc => PostOrdering::AscendingContinuous,
            OrderDirection::Desc => PostOrdering::DescendingContinuous,
        };
        let begin_time = match options.download_time_direction {
            OrderDirection::Asc => options.posts_after_time,
            OrderDirection::Desc => options.posts_before_time,
        }
        .unwrap_or(Time::ZERO);

        PostStorage {
            organization,
            begin_time,
            ..Default::default()
        }
    }

    /// Records one post fetched in `direction` order, keeping the running
    /// first/last id and boundary hints up to date.
    pub fn add_sorted_post(&mut self, post: &crate::entities::Post, hints: &PostHints, direction: OrderDirection) {
        if self.count == 0 {
            self.first_post_id = post.id.clone();
            if self.begin_time.is_zero() {
                self.begin_time = post.create_time;
            }
            self.post_id_before_first = match direction {
                OrderDirection::Asc => hints.post_id_before.clone(),
                OrderDirection::Desc => hints.post_id_after.clone(),
            };
        }
        self.last_post_id = post.id.clone();
        self.end_time = post.create_time;
        self.post_id_after_last = match direction {
            OrderDirection::Asc => hints.post_id_after.clone(),
            OrderDirection::Desc => hints.post_id_before.clone(),
        };
        self.count += 1;
    }

    /// Merges a subsequently-fetched, contiguous batch onto the end of this
    /// storage record. The two must share an ordering and the new batch
    /// must start exactly where this one ends.
    ///
    /// A zero-count `other` is a deliberate no-op even when its adjacency
    /// hint wouldn't match — appending nothing never needs to prove it was
    /// adjacent to nothing.
    pub fn extend(&mut self, other: &PostStorage) -> Result<(), CoreError> {
        if other.count == 0 {
            return Ok(());
        }
        if other.organization != self.organization {
            return Err(CoreError::OrderingMismatch);
        }
        if self.count > 0 && Some(&self.last_post_id) != other.post_id_before_first.as_ref() {
            return Err(CoreError::NonContiguousAppend {
                expected: other.post_id_before_first.clone(),
                actual: Some(self.last_post_id.clone()),
            });
        }
        if self.count == 0 {
            self.first_post_id = other.first_post_id.clone();
            self.post_id_before_first = other.post_id_before_first.clone();
            self.begin_time = other.begin_time;
        }
        self.count += other.count;
        self.byte_size = other.byte_size;
        self.last_post_id = other.last_post_id.clone();
        self.end_time = other.end_time;
        self.post_id_after_last = other.post_id_after_last.clone();
        Ok(())
    }
}

/// The single JSON object stored at `<stem>.meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelHeader {
    pub version: String,
    pub channel: Channel,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub team: Option<Team>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub storage: Option<PostStorage>,
    #[serde(rename = "usedUsers", skip_serializing_if = "Vec::is_empty", default)]
    pub used_users: Vec<User>,
    #[serde(rename = "usedEmojis", skip_serializing_if = "Vec::is_empty", default)]
    pub used_emojis: Vec<Emoji>,
}

impl ChannelHeader {
    /// `team`, if given, is stored with its `channels` map cleared: the
    /// header records the single channel it belongs to, not the whole
    /// team's channel list.
    pub fn new(channel: Channel, team: Option<Team>) -> ChannelHeader {
        ChannelHeader {
            version: format!("{MAJOR_VERSION}.{MINOR_VERSION}"),
            channel,
            team: team.map(|mut t| {
                t.channels.clear();
                t
            }),
            storage: None,
            used_users: Vec::new(),
            used_emojis: Vec::new(),
        }
    }

    pub fn major_version(&self) -> Option<u32> {
        self.version.split('.').next()?.parse().ok()
    }

    pub fn is_version_compatible(&self) -> bool {
        self.major_version() == Some(MAJOR_VERSION)
    }

    pub fn from_json(channel_id: &Id, data: &str) -> Result<ChannelHeader, CoreError> {
        let header: ChannelHeader = serde_json::from_str(data).map_err(|source| CoreError::MalformedHeader {
            channel: channel_id.clone(),
            source,
        })?;
        if !header.is_version_compatible() {
            return Err(CoreError::IncompatibleHeaderVersion {
                channel: channel_id.clone(),
                found: header.major_version().unwrap_or(u32::MAX),
                expected: MAJOR_VERSION,
            });
        }
        Ok(header)
    }

    pub fn to_json(&self) -> String {
        // `storage`/members are already handled by the `skip_serializing_if`
        // annotations above, so a zero-message channel's header has no
        // `storage` key at all.
        serde_json::to_string(self).expect("ChannelHeader always serializes")
    }

    /// Merges a freshly-fetched header (from an append run) into this
    /// (the previously archived) header.
    pub fn merge(&mut self, fresh: ChannelHeader) -> Result<(), CoreError> {
        self.channel = fresh.channel;
        if fresh.team.is_some() {
            self.team = fresh.team;
        }
        match (&mut self.storage, fresh.storage) {
            (Some(existing), Some(new_storage)) => existing.extend(&new_storage)?,
            (storage @ None, Some(new_storage)) => *storage = Some(new_storage),
            _ => {}
        }
        merge_unique(&mut self.used_users, fresh.used_users, |u| u.id.clone());
        merge_unique(&mut self.used_emojis, fresh.used_emojis, |e| e.id.clone());
        Ok(())
    }
}

fn merge_unique<T, K: Eq + std::hash::Hash>(existing: &mut Vec<T>, fresh: Vec<T>, key: impl Fn(&T) -> K) {
    let mut seen: HashSet<K> = existing.iter().map(&key).collect();
    for item in fresh {
        let k = key(&item);
        if seen.insert(k) {
            existing.push(item);
        }
    }
}

/// Filenames for a channel's archive, derived from its stem
/// (`d.<user>--<other>`, `g.<member>-<member>...`, or
/// `{o,p}.<team>--<channel>`, per the orchestrator's stem conventions).
pub fn archive_filenames(directory: &Path, stem: &str) -> (PathBuf, PathBuf) {
    (
        directory.join(format!("{stem}.meta.json")),
        directory.join(format!("{stem}.data.json")),
    )
}

/// On-disk facts about a previously archived channel: its header plus the
/// data file's actual size, used by the recovery arbiter to decide whether
/// the archive is trustworthy.
#[derive(Debug)]
pub struct ChannelFileInfo {
    pub header: ChannelHeader,
    pub data_file_size: Option<u64>,
}

impl ChannelFileInfo {
    /// Attempts to load a channel's previous archive. Returns `Ok(None)` if
    /// no header file exists at all (a fresh channel); `Err` if the header
    /// exists but fails to parse or its data file size is inconsistent with
    /// what the header records, so the caller can hand the failure to the
    /// recovery arbiter.
    pub fn load(channel_id: &Id, header_path: &Path, data_path: &Path) -> Result<Option<ChannelFileInfo>, CoreError> {
        let header_bytes = match std::fs::read_to_string(header_path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CoreError::Io(e)),
        };

        let header = ChannelHeader::from_json(channel_id, &header_bytes)?;

        let data_file_size = match std::fs::metadata(data_path) {
            Ok(meta) => Some(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(CoreError::Io(e)),
        };

        let expected_size = header.storage.as_ref().map(|s| s.byte_size).unwrap_or(0);
        match data_file_size {
            Some(actual) if actual != expected_size => {
                return Err(CoreError::DataFileSizeMismatch {
                    channel: channel_id.clone(),
                    expected: expected_size,
                    actual,
                });
            }
            None if expected_size > 0 => {
                return Err(CoreError::DataFileSizeMismatch {
                    channel: channel_id.clone(),
                    expected: expected_size,
                    actual: 0,
                });
            }
            _ => {}
        }

        Ok(Some(ChannelFileInfo { header, data_file_size }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{ChannelType, Post};

    fn post(id: &str, t: i64) -> Post {
        Post {
            id: Id(id.to_string()),
            user_id: Id("u1".to_string()),
            create_time: Time(t),
            message: "hi".to_string(),
            is_pinned: None,
            update_time: None,
            public_update_time: None,
            delete_time: None,
            parent_post_id: None,
            root_post_id: None,
            special_msg_type: None,
            emojis: Default::default(),
            attachments: Vec::new(),
            reactions: Vec::new(),
            user_name: None,
            misc: Default::default(),
        }
    }

    #[test]
    fn add_sorted_post_tracks_first_and_last() {
        let mut storage = PostStorage::default();
        let hints = PostHints {
            post_id_before: Some(Id("before".into())),
            post_id_after: None,
        };
        storage.add_sorted_post(&post("p1", 100), &hints, OrderDirection::Asc);
        assert_eq!(storage.count, 1);
        assert_eq!(storage.first_post_id, Id("p1".into()));
        assert_eq!(storage.last_post_id, Id("p1".into()));
        assert_eq!(storage.post_id_before_first, Some(Id("before".into())));

        let hints2 = PostHints {
            post_id_before: None,
            post_id_after: Some(Id("after".into())),
        };
        storage.add_sorted_post(&post("p2", 200), &hints2, OrderDirection::Asc);
        assert_eq!(storage.count, 2);
        assert_eq!(storage.last_post_id, Id("p2".into()));
        assert_eq!(storage.post_id_after_last, Some(Id("after".into())));
        assert_eq!(storage.end_time, Time(200));
    }

    #[test]
    fn extend_requires_contiguity() {
        let mut a = PostStorage::default();
        a.add_sorted_post(
            &post("p1", 100),
            &PostHints::default(),
            OrderDirection::Asc,
        );

        let mut b = PostStorage::default();
        b.post_id_before_first = Some(Id("not-p1".into()));
        b.add_sorted_post(
            &post("p2", 200),
            &PostHints::default(),
            OrderDirection::Asc,
        );

        assert!(matches!(a.extend(&b), Err(CoreError::NonContiguousAppend { .. })));
    }

    #[test]
    fn extend_with_empty_other_is_noop() {
        let mut a = PostStorage::default();
        a.add_sorted_post(
            &post("p1", 100),
            &PostHints::default(),
            OrderDirection::Asc,
        );
        let before = a.clone();

        let empty = PostStorage::default();
        a.extend(&empty).unwrap();
        assert_eq!(a, before);
    }

    #[test]
    fn new_header_strips_the_teams_channel_list() {
        use crate::entities::TeamType;
        use std::collections::HashMap;

        let mut channels = HashMap::new();
        channels.insert(Id("c1".into()), channel("c1"));
        let team = Team {
            id: Id("t1".into()),
            name: "Town".into(),
            internal_name: "town".into(),
            kind: TeamType::Open,
            create_time: Time(1),
            update_time: None,
            delete_time: None,
            description: None,
            update_avatar_time: None,
            invite_id: None,
            channels,
            misc: Default::default(),
        };

        let header = ChannelHeader::new(channel("c1"), Some(team));
        assert!(header.team.unwrap().channels.is_empty());
    }

    #[test]
    fn header_round_trips_without_storage_when_empty() {
        let channel = Channel {
            id: Id("c1".into()),
            internal_name: "town-square".into(),
            create_time: Time(1),
            kind: ChannelType::Open,
            message_count: 0,
            name: None,
            creator_user_id: None,
            update_time: None,
            delete_time: None,
            header: None,
            purpose: None,
            root_message_count: None,
            last_message_time: None,
            members: Vec::new(),
            misc: Default::default(),
        };
        let header = ChannelHeader::new(channel, None);
        let json = header.to_json();
        assert!(!json.contains("\"storage\""));

        let parsed = ChannelHeader::from_json(&Id("c1".into()), &json).unwrap();
        assert!(parsed.storage.is_none());
    }

    fn channel(id: &str) -> Channel {
        Channel {
            id: Id(id.into()),
            internal_name: "town-square".into(),
            create_time: Time(1),
            kind: ChannelType::Open,
            message_count: 0,
            name: None,
            creator_user_id: None,
            update_time: None,
            delete_time: None,
            header: None,
            purpose: None,
            root_message_count: None,
            last_message_time: None,
            members: Vec::new(),
            misc: Default::default(),
        }
    }

    #[test]
    fn load_returns_none_when_no_header_exists() {
        let dir = tempfile::tempdir().unwrap();
        let (header_path, data_path) = archive_filenames(dir.path(), "o.town--general");
        let loaded = ChannelFileInfo::load(&Id("c1".into()), &header_path, &data_path).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn load_detects_a_data_file_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let (header_path, data_path) = archive_filenames(dir.path(), "o.town--general");

        let mut header = ChannelHeader::new(channel("c1"), None);
        header.storage = Some(PostStorage {
            byte_size: 100,
            ..PostStorage::default()
        });
        std::fs::write(&header_path, header.to_json()).unwrap();
        std::fs::write(&data_path, b"short").unwrap();

        let err = ChannelFileInfo::load(&Id("c1".into()), &header_path, &data_path).unwrap_err();
        assert!(matches!(err, CoreError::DataFileSizeMismatch { expected: 100, actual: 5, .. }));
    }

    #[test]
    fn load_succeeds_when_data_file_size_matches_the_header() {
        let dir = tempfile::tempdir().unwrap();
        let (header_path, data_path) = archive_filenames(dir.path(), "o.town--general");

        let contents = b"{\"id\":\"p1\"}\n";
        let mut header = ChannelHeader::new(channel("c1"), None);
        header.storage = Some(PostStorage {
            byte_size: contents.len() as u64,
            ..PostStorage::default()
        });
        std::fs::write(&header_path, header.to_json()).unwrap();
        std::fs::write(&data_path, contents).unwrap();

        let loaded = ChannelFileInfo::load(&Id("c1".into()), &header_path, &data_path)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.data_file_size, Some(contents.len() as u64));
    }
}
