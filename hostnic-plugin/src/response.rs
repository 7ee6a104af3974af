use std::io::Write;
use std::net::IpAddr;
use std::process::ExitCode;

use semver::Version;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub enum Response {
    Success(Success),
    Error(CniErrorResponse),
    Version(VersionResponse),
}

impl Response {
    /// The runtime reads the result from stdout; everything else goes to
    /// the log file.
    pub fn write_out(self) -> ExitCode {
        let (out, code) = match &self {
            Response::Success(success) => match serde_json::to_vec(success) {
                Ok(out) => (out, ExitCode::SUCCESS),
                Err(e) => (e.to_string().into_bytes(), ExitCode::FAILURE),
            },
            Response::Error(error) => match serde_json::to_vec(error) {
                Ok(out) => (out, ExitCode::FAILURE),
                Err(e) => (e.to_string().into_bytes(), ExitCode::FAILURE),
            },
            Response::Version(version) => match serde_json::to_vec(version) {
                Ok(out) => (out, ExitCode::SUCCESS),
                Err(e) => (e.to_string().into_bytes(), ExitCode::FAILURE),
            },
        };
        std::io::stdout()
            .write_all(&out)
            .expect("failed to write response to stdout");
        code
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Success {
    #[serde(
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub cni_version: Version,

    #[serde(default)]
    pub interfaces: Vec<Interface>,

    #[serde(default)]
    pub ips: Vec<Ip>,

    #[serde(default)]
    pub routes: Vec<Route>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Ip {
    /// "4" under CNI 0.3.x.
    pub version: String,

    pub address: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub dst: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VersionResponse {
    #[serde(
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub cni_version: Version,

    #[serde(
        serialize_with = "crate::serialize_to_string_slice",
        deserialize_with = "crate::deserialize_from_str_vec"
    )]
    pub supported_versions: Vec<Version>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CniErrorResponse {
    #[serde(
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub cni_version: Version,
    pub code: u32,
    pub msg: String,
    pub details: String,
}

#[cfg(test)]
mod test {
    use crate::CNI_VERSION;

    use super::*;

    #[test]
    fn test_success_serializes_camel_case() {
        let success = Success {
            cni_version: CNI_VERSION,
            interfaces: vec![Interface {
                name: "eth0".into(),
                mac: None,
                sandbox: Some("/proc/42/ns/net".into()),
            }],
            ips: vec![Ip {
                version: "4".into(),
                address: "10.10.1.11/32".into(),
                gateway: Some("169.254.1.1".parse().unwrap()),
                interface: Some(0),
            }],
            routes: vec![Route {
                dst: "0.0.0.0/0".into(),
                gw: None,
            }],
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&success).unwrap()).unwrap();
        assert_eq!(json["cniVersion"], "0.3.1");
        assert_eq!(json["ips"][0]["version"], "4");
        assert_eq!(json["ips"][0]["address"], "10.10.1.11/32");
        assert_eq!(json["ips"][0]["gateway"], "169.254.1.1");
        assert_eq!(json["interfaces"][0]["sandbox"], "/proc/42/ns/net");
        // absent optionals stay absent
        assert!(json["routes"][0].get("gw").is_none());
    }
}
