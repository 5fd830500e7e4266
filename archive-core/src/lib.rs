//! Entity model, archive store, post fetcher, planner and recovery arbiter
//! for the incremental chat archiver.
//!
//! This crate has no knowledge of HTTP: the post fetcher is generic over a
//! [`fetcher::PostPageSource`] that the `archive-client` crate implements
//! against the real server, so that `archive-core` never needs to depend on
//! the transport layer.

pub mod entities;
pub mod error;
pub mod fetcher;
pub mod ids;
pub mod misc;
pub mod options;
pub mod planner;
pub mod recovery;
pub mod store;

pub use entities::{
    Channel, ChannelType, Emoji, EntityLocator, FileAttachment, Post, PostEmojis, PostReaction,
    Team, TeamType, User,
};
pub use error::CoreError;
pub use ids::{Id, Time};
pub use options::{ChannelOptions, OrderDirection};
