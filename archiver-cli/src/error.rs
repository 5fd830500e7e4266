//! Top-level error taxonomy for the binary: configuration, transport,
//! consistency, and operational failures, each carrying enough of a
//! diagnostic to explain itself without the caller re-deriving context
//! from the log.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AppError {
    #[error("could not load configuration")]
    Configuration {
        #[source]
        source: figment::Error,
    },

    #[error("no hostname configured; set connection.hostname or ARCHIVER_CONNECTION.HOSTNAME")]
    MissingHostname,

    #[error("no credentials configured; set either connection.token or connection.username/password")]
    MissingCredentials,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Client(#[from] archive_client::ClientError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] archive_core::CoreError),

    #[error("server account has no teams")]
    NoTeams,

    #[error("locator {0:?} in configuration did not match any {1}")]
    UnresolvedLocator(String, &'static str),

    #[error("could not create output directory {path}")]
    CreateOutputDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("io error handling archive file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("interrupted")]
    Interrupted,
}
