pub mod cloud;
pub mod cni;
pub mod config;
pub mod datastore;
pub mod http;
pub mod ipam;
pub mod kubernetes;
pub mod metrics;
pub mod network;
pub mod retry;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    DataStore(#[from] datastore::DataStoreError),

    #[error("cloud error: {0}")]
    Cloud(String),

    #[error("netlink error: {0}")]
    Netlink(String),

    #[error("network namespace error: {0}")]
    Namespace(String),

    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error("addr parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("invalid cidr: {0}")]
    Cidr(#[from] ipnetwork::IpNetworkError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<rtnetlink::Error> for Error {
    fn from(err: rtnetlink::Error) -> Self {
        Self::Netlink(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Cloud(err.to_string())
    }
}
