use std::collections::HashMap;
use std::env;

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// The network config the runtime feeds on stdin, as written by the
/// daemon's conflist.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    #[serde(
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    pub cni_version: Version,

    #[serde(default)]
    pub name: String,

    pub r#type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub veth_prefix: Option<String>,
}

/// The well-known CNI environment contract.
#[derive(Clone, Debug)]
pub struct CniEnv {
    pub command: String,
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
    pub args: String,
    pub path: String,
}

impl CniEnv {
    pub fn from_env() -> Result<Self> {
        let command = require("CNI_COMMAND")?;
        // VERSION is the only verb without a container context
        let optional = command == "VERSION";
        Ok(Self {
            command,
            container_id: require_unless("CNI_CONTAINERID", optional)?,
            netns: env::var("CNI_NETNS").unwrap_or_default(),
            ifname: require_unless("CNI_IFNAME", optional)?,
            args: env::var("CNI_ARGS").unwrap_or_default(),
            path: env::var("CNI_PATH").unwrap_or_default(),
        })
    }
}

fn require(key: &str) -> Result<String> {
    env::var(key).map_err(|_| Error::InvalidEnv(format!("{key} is not set")))
}

fn require_unless(key: &str, optional: bool) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value),
        Err(_) if optional => Ok(String::new()),
        Err(_) => Err(Error::InvalidEnv(format!("{key} is not set"))),
    }
}

/// Pod identity the kubelet packs into CNI_ARGS, e.g.
/// `IgnoreUnknown=1;K8S_POD_NAMESPACE=default;K8S_POD_NAME=web-0;...`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodArgs {
    pub namespace: String,
    pub name: String,
}

impl PodArgs {
    pub fn parse(args: &str) -> Result<Self> {
        let map: HashMap<&str, &str> = args
            .split(';')
            .filter_map(|pair| pair.split_once('='))
            .collect();
        let namespace = map
            .get("K8S_POD_NAMESPACE")
            .ok_or_else(|| Error::InvalidEnv("CNI_ARGS is missing K8S_POD_NAMESPACE".into()))?;
        let name = map
            .get("K8S_POD_NAME")
            .ok_or_else(|| Error::InvalidEnv("CNI_ARGS is missing K8S_POD_NAME".into()))?;
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pod_args_parse() {
        let args = "IgnoreUnknown=1;K8S_POD_NAMESPACE=default;K8S_POD_NAME=web-0;K8S_POD_INFRA_CONTAINER_ID=abc123";
        assert_eq!(
            PodArgs::parse(args).unwrap(),
            PodArgs {
                namespace: "default".into(),
                name: "web-0".into(),
            }
        );
    }

    #[test]
    fn test_pod_args_missing_fields() {
        assert!(PodArgs::parse("IgnoreUnknown=1").is_err());
        assert!(PodArgs::parse("").is_err());
    }

    #[test]
    fn test_netconf_parses_conflist_entry() {
        let conf = r#"{"cniVersion":"0.3.1","name":"hostnic","type":"hostnic","vethPrefix":"nic"}"#;
        let parsed: NetConf = serde_json::from_str(conf).unwrap();
        assert_eq!(parsed.cni_version, Version::new(0, 3, 1));
        assert_eq!(parsed.r#type, "hostnic");
        assert_eq!(parsed.veth_prefix.as_deref(), Some("nic"));
    }
}
