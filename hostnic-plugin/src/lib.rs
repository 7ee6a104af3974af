pub mod add;
pub mod config;
pub mod delete;
pub mod error;
pub mod response;
pub mod version;

use semver::Version;
use serde::{Deserialize, Deserializer, Serializer, de};

pub use error::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub const CNI_VERSION: Version = Version::new(0, 3, 1);

/// Backend RPC endpoint of the node-resident daemon.
pub const BACKEND_ADDRESS: &str = "http://127.0.0.1:41080";

/// Total deadline for one backend call; the runtime retries the whole
/// invocation on failure.
pub const RPC_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// The synthetic next hop the daemon wires into every pod namespace.
pub const POD_GATEWAY: std::net::Ipv4Addr = std::net::Ipv4Addr::new(169, 254, 1, 1);

/// One-shot runtime for the single backend call each invocation makes.
pub fn block_on<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(fut)
}

pub fn serialize_to_string<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: ToString,
    S: Serializer,
{
    serializer.serialize_str(&value.to_string())
}

pub fn deserialize_from_str<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(de::Error::custom)
}

pub fn serialize_to_string_slice<T, S>(values: &[T], serializer: S) -> Result<S::Ok, S::Error>
where
    T: ToString,
    S: Serializer,
{
    serializer.collect_seq(values.iter().map(|v| v.to_string()))
}

pub fn deserialize_from_str_vec<'de, T, D>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    D: Deserializer<'de>,
{
    let strings = Vec::<String>::deserialize(deserializer)?;
    strings
        .into_iter()
        .map(|s| s.parse().map_err(de::Error::custom))
        .collect()
}
