//! Error taxonomy shared by the protocol, controller and store layers.

use std::fmt;

use http::StatusCode;
use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or unsupported challenge/response from the server. Never retried.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Credentials rejected after one re-challenge.
    #[error("authentication failed for {username}: {detail}")]
    Authentication { username: String, detail: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("discovery error: {0}")]
    Discovery(String),

    #[error("format error: {0}")]
    Format(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{method} {path} returned '{status}'")]
    Dav {
        method: String,
        path: String,
        status: StatusCode,
    },

    #[error("Error: {method} {path} '{status}'{}", format_body(.body))]
    Admin {
        method: String,
        path: String,
        status: StatusCode,
        body: String,
    },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("user {username}: {source}")]
    User {
        username: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{}", format_failures(.0))]
    Aggregate(Vec<WorkerFailure>),

    #[error("operation cancelled")]
    Cancelled,

    #[error("xml error: {0}")]
    Xml(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Attach the identity the failing operation was running for.
    pub fn for_user(self, username: &str) -> Self {
        match self {
            // already annotated with the same identity
            Error::User { username: ref u, .. } if u == username => self,
            other => Error::User {
                username: username.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// True for conditions that mean "the caller asked for something that is not there".
    pub fn is_configuration(&self) -> bool {
        match self {
            Error::Configuration(_) => true,
            Error::User { source, .. } => source.is_configuration(),
            _ => false,
        }
    }
}

impl From<quick_xml::Error> for Error {
    fn from(err: quick_xml::Error) -> Self {
        Error::Xml(err.to_string())
    }
}

/// One failed worker of a bulk operation.
#[derive(Debug)]
pub struct WorkerFailure {
    pub username: String,
    pub error: Error,
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.username, self.error)
    }
}

fn format_body(body: &str) -> String {
    if body.is_empty() {
        String::new()
    } else {
        format!("\n{}", body)
    }
}

fn format_failures(failures: &[WorkerFailure]) -> String {
    let mut out = format!("{} worker(s) failed", failures.len());
    for failure in failures {
        out.push_str("\n  - ");
        out.push_str(&failure.to_string());
    }
    out
}
