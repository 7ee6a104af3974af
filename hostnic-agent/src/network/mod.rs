pub mod host;
pub mod netlink;
pub mod ns;

use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use sha2::{Digest, Sha256};

use crate::Result;

pub use netlink::{NetlinkHandle, parse_mac};

/// Policy-rule priorities. 512 and 1536 are per-pod; 1024 is installed
/// once and keeps off-VPC traffic on the host's default path. The gaps
/// are deliberate headroom.
pub const TO_POD_RULE_PRIORITY: u32 = 512;
pub const OFF_VPC_RULE_PRIORITY: u32 = 1024;
pub const FROM_POD_RULE_PRIORITY: u32 = 1536;

/// RT_TABLE_MAIN.
pub const MAIN_ROUTE_TABLE: u32 = 254;

/// Matches the MTU of the cloud's secondary interfaces so the veth
/// never fragments.
pub const VETH_MTU: u32 = 9001;

/// IFNAMSIZ minus the trailing NUL.
pub const MAX_IFNAME_LEN: usize = 15;

/// Synthetic next hop inside every pod namespace; resolved by a static
/// neighbour entry, never by ARP.
pub const POD_GATEWAY: Ipv4Addr = Ipv4Addr::new(169, 254, 1, 1);

/// One kernel policy-routing rule, as the daemon reads and writes them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyRule {
    pub priority: u32,
    pub table: u32,
    pub src: Option<Ipv4Network>,
    pub dst: Option<Ipv4Network>,
    pub invert: bool,
}

impl PolicyRule {
    pub fn to_pod(addr: Ipv4Addr) -> Self {
        Self {
            priority: TO_POD_RULE_PRIORITY,
            table: MAIN_ROUTE_TABLE,
            src: None,
            dst: Some(host_cidr(addr)),
            invert: false,
        }
    }

    pub fn from_pod(addr: Ipv4Addr, dst: Option<Ipv4Network>, table: u32) -> Self {
        Self {
            priority: FROM_POD_RULE_PRIORITY,
            table,
            src: Some(host_cidr(addr)),
            dst,
            invert: false,
        }
    }
}

/// `addr/32`.
pub fn host_cidr(addr: Ipv4Addr) -> Ipv4Network {
    Ipv4Network::new(addr, 32).expect("/32 is always valid")
}

/// Deterministic host-side veth name for a pod: the configured prefix
/// followed by a short hash of the infra container id, clamped to
/// IFNAMSIZ.
pub fn host_veth_name(prefix: &str, container_id: &str) -> String {
    let digest = Sha256::digest(container_id.as_bytes());
    let mut name = String::with_capacity(MAX_IFNAME_LEN);
    name.push_str(prefix);
    for byte in digest.iter() {
        if name.len() + 2 > MAX_IFNAME_LEN {
            break;
        }
        name.push_str(&format!("{byte:02x}"));
    }
    name.truncate(MAX_IFNAME_LEN);
    name
}

/// The tunnel network a pod address belongs to, treated as on-VPC when
/// VPN traffic support is enabled.
pub fn vpn_net(addr: Ipv4Addr) -> Ipv4Network {
    let octets = addr.octets();
    Ipv4Network::new(Ipv4Addr::new(octets[0], octets[1], octets[2], 0), 24)
        .expect("/24 is always valid")
}

/// Kernel-facing capability set consumed by the RPC handlers, the
/// reconciler and the bootstrapper. A mock stands in for it in tests;
/// `LinuxNetwork` is the real thing.
#[async_trait]
pub trait NetworkApi: Send + Sync {
    /// Once at startup: off-VPC traffic keeps the default host path, and
    /// host SNAT is prepared unless external SNAT is in use.
    async fn setup_host_network(
        &self,
        vpc_cidr: Ipv4Network,
        vpc_subnets: &[Ipv4Network],
        primary_mac: &str,
        primary_ip: Ipv4Addr,
        use_external_snat: bool,
    ) -> Result<()>;

    /// Per secondary nic: a routing table numbered by the device index
    /// with the subnet route and a default route via the subnet gateway.
    async fn setup_nic_network(
        &self,
        addr: Ipv4Addr,
        mac: &str,
        device_index: u32,
        subnet: Ipv4Network,
    ) -> Result<()>;

    /// Wire a pod namespace: veth pair, routed-veth gateway, host /32
    /// route and the per-pod policy rules.
    #[allow(clippy::too_many_arguments)]
    async fn setup_ns(
        &self,
        host_veth: &str,
        cont_veth: &str,
        netns_path: &str,
        addr: Ipv4Addr,
        table: u32,
        vpc_cidrs: &[Ipv4Network],
        tunnel: Option<Ipv4Network>,
        use_external_snat: bool,
    ) -> Result<()>;

    /// Reverse of `setup_ns`; missing objects are not an error.
    async fn teardown_ns(&self, addr: Ipv4Addr, table: u32) -> Result<()>;

    async fn get_rule_list(&self) -> Result<Vec<PolicyRule>>;

    /// Reconverge the from-pod rules for `src` after a config or CIDR
    /// change: drop what `rules` contains for it, then re-add either the
    /// per-CIDR fan-out (`per_cidr` true) or the single table rule.
    async fn update_rule_list_by_src(
        &self,
        rules: &[PolicyRule],
        src: Ipv4Addr,
        cidrs: &[Ipv4Network],
        per_cidr: bool,
        table: u32,
    ) -> Result<()>;

    async fn delete_rule_list_by_src(&self, src: Ipv4Addr) -> Result<()>;

    /// Drop any per-pod rule whose address is not in `live`; called once
    /// after bootstrap recovery to collect rules leaked by pods deleted
    /// while the daemon was down.
    async fn sweep_stale_rules(&self, live: &[Ipv4Addr]) -> Result<()>;

    /// Kernel ifindex for the interface with `mac`.
    async fn device_index_by_mac(&self, mac: &str) -> Result<u32>;
}

/// `NetworkApi` against the running kernel.
pub struct LinuxNetwork {
    pub(crate) netlink: NetlinkHandle,
}

impl LinuxNetwork {
    pub fn new() -> Result<Self> {
        Ok(Self {
            netlink: NetlinkHandle::new()?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_host_veth_name_is_deterministic() {
        let a = host_veth_name("nic", "abc123");
        let b = host_veth_name("nic", "abc123");
        assert_eq!(a, b);
        assert_ne!(a, host_veth_name("nic", "abc124"));
    }

    #[test]
    fn test_host_veth_name_fits_ifnamsiz() {
        let name = host_veth_name("nic", "0123456789abcdef0123456789abcdef");
        assert!(name.len() <= MAX_IFNAME_LEN);
        assert!(name.starts_with("nic"));
        // longest allowed prefix still leaves room for hash bytes
        let name = host_veth_name("hnic", "0123456789abcdef");
        assert!(name.len() <= MAX_IFNAME_LEN);
    }

    #[test]
    fn test_vpn_net() {
        assert_eq!(
            vpn_net(Ipv4Addr::new(10, 20, 30, 40)),
            "10.20.30.0/24".parse().unwrap()
        );
    }

    #[test]
    fn test_rule_constructors() {
        let addr = Ipv4Addr::new(10, 0, 0, 7);
        let to = PolicyRule::to_pod(addr);
        assert_eq!(to.priority, TO_POD_RULE_PRIORITY);
        assert_eq!(to.table, MAIN_ROUTE_TABLE);
        assert_eq!(to.dst, Some("10.0.0.7/32".parse().unwrap()));
        assert_eq!(to.src, None);

        let from = PolicyRule::from_pod(addr, Some("10.0.0.0/16".parse().unwrap()), 3);
        assert_eq!(from.priority, FROM_POD_RULE_PRIORITY);
        assert_eq!(from.table, 3);
        assert_eq!(from.src, Some("10.0.0.7/32".parse().unwrap()));
    }
}
