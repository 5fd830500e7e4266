//! HTTP transport against a Mattermost-style REST API: login, entity
//! lookups with caching, and the [`archive_core::fetcher::PostPageSource`]
//! implementation that drives the generic post fetcher.

pub mod client;
pub mod error;

pub use client::ServerClient;
pub use error::ClientError;
