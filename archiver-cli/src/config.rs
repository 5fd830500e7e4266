//! Configuration loading: a TOML file merged with `ARCHIVER_`-prefixed
//! environment overrides via `figment`. Two extra environment variables,
//! `MATTERMOST_PASSWORD`/`MATTERMOST_TOKEN`, are layered on top of the
//! generic provider as direct overrides for the connection credentials.

use std::path::PathBuf;

use archive_core::recovery::{RecoveryAction, RecoveryPolicy};
use archive_core::{ChannelOptions, EntityLocator, Id, OrderDirection, Time};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub username: String,
    pub password: String,
    pub token: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: String::new(),
            username: String::new(),
            password: String::new(),
            token: String::new(),
        }
    }
}

/// A channel selector the user spelled out explicitly in config, with its
/// own option overrides layered on top of whatever default applies to its
/// kind (direct/group/public/private).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelSpec {
    #[serde(flatten)]
    pub locator: EntityLocator,
    #[serde(flatten, default)]
    pub options: ChannelOptionsPatch,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum GroupLocator {
    ChannelId(Id),
    Members(Vec<EntityLocator>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupChannelSpec {
    pub group: GroupLocator,
    #[serde(flatten, default)]
    pub options: ChannelOptionsPatch,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AttachmentsPatch {
    pub download: Option<bool>,
    #[serde(rename = "maxSize")]
    pub max_size: Option<u64>,
    #[serde(rename = "allowedMimeTypes")]
    pub allowed_mime_types: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EmojisPatch {
    pub download: Option<bool>,
    pub metadata: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AvatarsPatch {
    pub download: Option<bool>,
}

/// Sparse overlay over [`ChannelOptions`], one field per overridable option
/// key. `apply` layers it onto a parent default, so per-team and
/// per-channel option sections cascade from global to team to channel.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelOptionsPatch {
    #[serde(rename = "beforePost")]
    pub before_post: Option<Id>,
    #[serde(rename = "afterPost")]
    pub after_post: Option<Id>,
    #[serde(rename = "beforeTime")]
    pub before_time: Option<i64>,
    #[serde(rename = "afterTime")]
    pub after_time: Option<i64>,
    #[serde(rename = "maximumPostCount")]
    pub maximum_post_count: Option<i64>,
    #[serde(rename = "sessionPostLimit")]
    pub session_post_limit: Option<i64>,
    pub redownload: Option<bool>,
    #[serde(rename = "downloadFromOldest")]
    pub download_from_oldest: Option<bool>,
    pub attachments: Option<AttachmentsPatch>,
    pub emojis: Option<EmojisPatch>,
    pub avatars: Option<AvatarsPatch>,
}

impl ChannelOptionsPatch {
    pub fn apply(&self, base: &ChannelOptions) -> ChannelOptions {
        let mut opts = base.clone();
        if let Some(id) = &self.before_post {
            opts.posts_before_id = Some(id.clone());
        }
        if let Some(id) = &self.after_post {
            opts.posts_after_id = Some(id.clone());
        }
        if let Some(t) = self.before_time {
            opts.posts_before_time = Some(Time(t));
        }
        if let Some(t) = self.after_time {
            opts.posts_after_time = Some(Time(t));
        }
        if let Some(n) = self.maximum_post_count {
            opts.post_limit = n;
        }
        if let Some(n) = self.session_post_limit {
            opts.post_session_limit = n;
        }
        if let Some(b) = self.redownload {
            opts.redownload = b;
        }
        if let Some(from_oldest) = self.download_from_oldest {
            opts.download_time_direction = if from_oldest { OrderDirection::Asc } else { OrderDirection::Desc };
        }
        if let Some(a) = &self.attachments {
            if let Some(b) = a.download {
                opts.download_attachments = b;
            }
            if let Some(n) = a.max_size {
                opts.download_attachment_size_limit = n;
            }
            if let Some(types) = &a.allowed_mime_types {
                opts.download_attachment_types = types.clone();
            }
        }
        if let Some(e) = &self.emojis {
            if let Some(b) = e.download {
                opts.download_emoji = b;
            }
            if let Some(b) = e.metadata {
                opts.emoji_metadata = b;
            }
        }
        if let Some(av) = &self.avatars {
            if let Some(b) = av.download {
                opts.download_avatars = b;
            }
        }
        opts
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TeamSpec {
    #[serde(flatten)]
    pub locator: EntityLocator,
    #[serde(rename = "downloadPrivateChannels", default = "default_true")]
    pub misc_private_channels: bool,
    #[serde(rename = "privateChannels", default)]
    pub explicit_private_channels: Vec<ChannelSpec>,
    #[serde(rename = "privateChannelOptions", default)]
    pub private_channel_defaults: ChannelOptionsPatch,
    #[serde(rename = "downloadPublicChannels", default = "default_true")]
    pub misc_public_channels: bool,
    #[serde(rename = "publicChannels", default)]
    pub explicit_public_channels: Vec<ChannelSpec>,
    #[serde(rename = "publicChannelOptions", default)]
    pub public_channel_defaults: ChannelOptionsPatch,
    #[serde(rename = "defaultChannelOptions", default)]
    pub default_channel_options: ChannelOptionsPatch,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReportConfig {
    pub verbose: bool,
    pub show_progress: bool,
    pub progress_interval_ms: u64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        ReportConfig {
            verbose: false,
            show_progress: true,
            progress_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    /// Milliseconds to sleep between paginated requests.
    pub throttling_loop_delay_ms: u64,
    pub output_directory: PathBuf,
    pub verbose_human_friendly_posts: bool,
    pub download_all_emojis: bool,
    pub report: ReportConfig,

    pub misc_teams: bool,
    pub teams: Vec<TeamSpec>,
    pub misc_direct_channels: bool,
    pub users: Vec<ChannelSpec>,
    pub misc_group_channels: bool,
    pub groups: Vec<GroupChannelSpec>,

    pub default_channel_options: ChannelOptionsPatch,
    pub direct_channel_options: ChannelOptionsPatch,
    pub group_channel_options: ChannelOptionsPatch,
    pub private_channel_options: ChannelOptionsPatch,
    pub public_channel_options: ChannelOptionsPatch,

    pub on_existing_compatible_archive: RecoveryAction,
    pub on_existing_incompatible_archive: RecoveryAction,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            connection: ConnectionConfig::default(),
            throttling_loop_delay_ms: 0,
            output_directory: PathBuf::from("."),
            verbose_human_friendly_posts: false,
            download_all_emojis: false,
            report: ReportConfig::default(),
            misc_teams: true,
            teams: Vec::new(),
            misc_direct_channels: true,
            users: Vec::new(),
            misc_group_channels: true,
            groups: Vec::new(),
            default_channel_options: ChannelOptionsPatch::default(),
            direct_channel_options: ChannelOptionsPatch::default(),
            group_channel_options: ChannelOptionsPatch::default(),
            private_channel_options: ChannelOptionsPatch::default(),
            public_channel_options: ChannelOptionsPatch::default(),
            on_existing_compatible_archive: RecoveryAction::Reuse,
            on_existing_incompatible_archive: RecoveryAction::Backup,
        }
    }
}

impl Config {
    pub fn figment(config_path: Option<&PathBuf>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        } else {
            figment = figment.merge(Toml::file("mattermost-archiver.toml"));
        }
        figment.merge(Env::prefixed("ARCHIVER_").split("_"))
    }

    pub fn load(config_path: Option<&PathBuf>) -> Result<Config, AppError> {
        let mut config: Config = Config::figment(config_path)
            .extract()
            .map_err(|source| AppError::Configuration { source })?;

        if let Ok(password) = std::env::var("MATTERMOST_PASSWORD") {
            config.connection.password = password;
        }
        if let Ok(token) = std::env::var("MATTERMOST_TOKEN") {
            config.connection.token = token;
        }

        if config.connection.hostname.is_empty() {
            return Err(AppError::MissingHostname);
        }
        if config.connection.token.is_empty() && config.connection.username.is_empty() {
            return Err(AppError::MissingCredentials);
        }

        Ok(config)
    }

    pub fn recovery_policy(&self) -> RecoveryPolicy {
        RecoveryPolicy {
            on_existing_compatible_archive: self.on_existing_compatible_archive,
            on_existing_incompatible_archive: self.on_existing_incompatible_archive,
        }
    }

    pub fn base_channel_options(&self) -> ChannelOptions {
        self.default_channel_options.apply(&ChannelOptions::default())
    }
}
