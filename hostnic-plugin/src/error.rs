use semver::Version;
use thiserror::Error;

use crate::response::{CniErrorResponse, Response};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("incompatible version {0}")]
    IncompatibleVersion(Version),

    #[error("invalid environment variables: {0}")]
    InvalidEnv(String),

    #[error("invalid network config: {0}")]
    InvalidConfig(String),

    #[error("backend unreachable: {0}")]
    Transient(String),

    #[error("backend refused request: {0}")]
    Backend(String),

    #[error("{0}")]
    Tonic(#[from] tonic::Status),

    #[error("{0}")]
    TonicTransport(#[from] tonic::transport::Error),
}

impl Error {
    pub fn into_response(self, cni_version: Version) -> Response {
        let (code, msg) = match &self {
            Error::IncompatibleVersion(_) => (1, "Incompatible Version"),
            Error::InvalidEnv(_) => (4, "Invalid Required Environment Variables"),
            Error::Io(_) => (5, "I/O Error"),
            Error::Json(_) => (6, "JSON Error"),
            Error::InvalidConfig(_) => (7, "Invalid Network Config"),
            // the runtime retries these, e.g. while the daemon pool grows
            Error::Transient(_) | Error::TonicTransport(_) => (11, "Try Again Later"),
            Error::Tonic(_) => (100, "Backend RPC Failure"),
            Error::Backend(_) => (101, "Backend Refused"),
        };
        Response::Error(CniErrorResponse {
            cni_version,
            code,
            msg: msg.into(),
            details: self.to_string(),
        })
    }
}
