use miette::Diagnostic;
use thiserror::Error;

/// Transport and authentication failures talking to the chat server.
#[derive(Debug, Error, Diagnostic)]
pub enum ClientError {
    #[error("failed to build request for {endpoint}")]
    RequestBuild {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {endpoint} failed")]
    RequestExecute {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("server rejected {endpoint} with status {status}: {message}")]
    ServerRejected {
        endpoint: String,
        status: reqwest::StatusCode,
        message: String,
    },

    #[error("could not read response body from {endpoint}")]
    ResponseBody {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("could not parse response from {endpoint} as JSON")]
    Deserialize {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("login succeeded but the server did not return a Token header")]
    MissingTokenHeader,

    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Entity(#[from] archive_core::CoreError),

    #[error("no such user: {0:?}")]
    UnknownUser(String),

    #[error("no such team: {0:?}")]
    UnknownTeam(String),

    #[error("no such channel: {0:?}")]
    UnknownChannel(String),
}
