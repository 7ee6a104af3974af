use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// A longer prefix would push the hashed host-veth name past IFNAMSIZ.
pub const MAX_VETH_PREFIX_LEN: usize = 4;

#[derive(Parser, Debug, Clone)]
#[command(version, about = "per-node IP address manager for hostnic", long_about = None)]
pub struct AgentArgs {
    /// Loopback listener for the CNI backend RPC
    #[arg(long, default_value = "127.0.0.1:41080")]
    pub grpc_address: SocketAddr,

    /// Loopback listener for metrics and readiness
    #[arg(long, default_value = "127.0.0.1:41081")]
    pub metrics_address: SocketAddr,

    /// Name of the node the daemon runs on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// Low water mark: grow the pool while fewer addresses are free
    #[arg(long, env = "HOSTNIC_POOL_SIZE", default_value_t = 3)]
    pub pool_size: usize,

    /// High water mark: shrink the pool while more addresses are free
    #[arg(long, env = "HOSTNIC_MAX_POOL_SIZE", default_value_t = 10)]
    pub max_pool_size: usize,

    /// Cluster the managed resources are tagged with
    #[arg(long, env = "HOSTNIC_CLUSTER_NAME", default_value = "kubernetes")]
    pub cluster_name: String,

    /// Extra tags stamped onto created nics
    #[arg(long, env = "HOSTNIC_EXTRA_TAGS", value_delimiter = ',')]
    pub extra_tags: Vec<String>,

    /// Host veth name prefix
    #[arg(long, env = "HOSTNIC_VETH_PREFIX", default_value = "nic", value_parser = parse_veth_prefix)]
    pub veth_prefix: String,

    /// Route all pod egress through the nic's table and skip host SNAT
    #[arg(long, env = "HOSTNIC_EXTERNAL_SNAT", default_value_t = false)]
    pub external_snat: bool,

    /// Treat the pod's VPN tunnel net as on-VPC
    #[arg(long, env = "HOSTNIC_VPN_TRAFFIC", default_value_t = false)]
    pub vpn_traffic: bool,

    /// Do not tag created resources with the cluster label
    #[arg(long, env = "HOSTNIC_DISABLE_LABEL", default_value_t = false)]
    pub disable_label: bool,

    /// Where the CNI config is written once the node is ready
    #[arg(long, default_value = "/host/etc/cni/net.d/10-ahostnic.conflist")]
    pub cni_config_path: PathBuf,

    /// IaaS control API endpoint
    #[arg(long, env = "HOSTNIC_CLOUD_ENDPOINT")]
    pub cloud_endpoint: String,

    /// File holding the node's cloud API token
    #[arg(long, env = "HOSTNIC_CLOUD_TOKEN_FILE", default_value = "/etc/hostnic/token")]
    pub cloud_token_file: PathBuf,

    /// File holding this instance's cloud id
    #[arg(long, default_value = "/etc/hostnic/instance-id")]
    pub instance_id_file: PathBuf,
}

impl AgentArgs {
    /// Tags stamped onto nics created for this node.
    pub fn nic_tags(&self) -> Vec<String> {
        let mut tags = Vec::new();
        if !self.disable_label {
            tags.push(self.cluster_name.clone());
        }
        tags.extend(self.extra_tags.iter().cloned());
        tags
    }
}

fn parse_veth_prefix(value: &str) -> Result<String, String> {
    if value.is_empty() || value.len() > MAX_VETH_PREFIX_LEN {
        return Err(format!(
            "veth prefix must be 1..={MAX_VETH_PREFIX_LEN} characters"
        ));
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err("veth prefix must be alphanumeric".to_string());
    }
    Ok(value.to_string())
}
