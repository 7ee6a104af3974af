use std::collections::HashSet;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::network::{
    FROM_POD_RULE_PRIORITY, LinuxNetwork, MAIN_ROUTE_TABLE, NetworkApi, OFF_VPC_RULE_PRIORITY,
    PolicyRule, TO_POD_RULE_PRIORITY, host_cidr, ns,
};
use crate::{Error, Result};

const SNAT_CHAIN: &str = "HOSTNIC-SNAT";

impl LinuxNetwork {
    async fn host_network(
        &self,
        vpc_cidr: Ipv4Network,
        primary_mac: &str,
        primary_ip: Ipv4Addr,
        use_external_snat: bool,
    ) -> Result<()> {
        if let Some(index) = self.netlink.link_index_by_mac(primary_mac).await? {
            self.netlink.set_link_up(index).await?;
        }

        // Off-VPC traffic must keep the default host path. Delete-then-add
        // so a stale rule from a previous run converges.
        let off_vpc = PolicyRule {
            priority: OFF_VPC_RULE_PRIORITY,
            table: MAIN_ROUTE_TABLE,
            src: None,
            dst: Some(vpc_cidr),
            invert: true,
        };
        self.netlink.delete_rule(&off_vpc).await?;
        self.netlink.add_rule(&off_vpc).await?;
        info!("installed off-vpc rule for {vpc_cidr}");

        if !use_external_snat {
            ensure_snat_chain(primary_ip, vpc_cidr).await?;
        }
        Ok(())
    }

    async fn nic_network(
        &self,
        addr: Ipv4Addr,
        mac: &str,
        device_index: u32,
        subnet: Ipv4Network,
    ) -> Result<()> {
        let index = self
            .netlink
            .link_index_by_mac(mac)
            .await?
            .ok_or_else(|| Error::Netlink(format!("no link with mac {mac}")))?;
        self.netlink.set_link_up(index).await?;

        let gateway = subnet
            .nth(1)
            .ok_or_else(|| Error::Netlink(format!("subnet {subnet} has no gateway address")))?;
        self.netlink
            .replace_onlink_route(subnet, index, Some(device_index))
            .await?;
        self.netlink
            .replace_default_route(gateway, index, device_index)
            .await?;
        info!("nic {mac} ({addr}) wired into table {device_index}");
        Ok(())
    }

    pub(crate) async fn rules_for_src(&self, src: Ipv4Addr) -> Result<Vec<PolicyRule>> {
        let src_net = host_cidr(src);
        Ok(self
            .netlink
            .list_rules()
            .await?
            .into_iter()
            .filter(|r| r.src == Some(src_net))
            .collect())
    }
}

#[async_trait]
impl NetworkApi for LinuxNetwork {
    async fn setup_host_network(
        &self,
        vpc_cidr: Ipv4Network,
        _vpc_subnets: &[Ipv4Network],
        primary_mac: &str,
        primary_ip: Ipv4Addr,
        use_external_snat: bool,
    ) -> Result<()> {
        self.host_network(vpc_cidr, primary_mac, primary_ip, use_external_snat)
            .await
    }

    async fn setup_nic_network(
        &self,
        addr: Ipv4Addr,
        mac: &str,
        device_index: u32,
        subnet: Ipv4Network,
    ) -> Result<()> {
        self.nic_network(addr, mac, device_index, subnet).await
    }

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
    ) -> Result<()> {
        ns::setup_ns(
            self,
            host_veth,
            cont_veth,
            netns_path,
            addr,
            table,
            vpc_cidrs,
            tunnel,
            use_external_snat,
        )
        .await
    }

    async fn teardown_ns(&self, addr: Ipv4Addr, table: u32) -> Result<()> {
        ns::teardown_ns(self, addr, table).await
    }

    async fn get_rule_list(&self) -> Result<Vec<PolicyRule>> {
        self.netlink.list_rules().await
    }

    async fn update_rule_list_by_src(
        &self,
        rules: &[PolicyRule],
        src: Ipv4Addr,
        cidrs: &[Ipv4Network],
        per_cidr: bool,
        table: u32,
    ) -> Result<()> {
        let src_net = host_cidr(src);
        for rule in rules.iter().filter(|r| r.src == Some(src_net)) {
            self.netlink.delete_rule(rule).await?;
        }
        if table == 0 {
            return Ok(());
        }
        if per_cidr {
            for cidr in cidrs {
                self.netlink
                    .add_rule(&PolicyRule::from_pod(src, Some(*cidr), table))
                    .await?;
            }
        } else {
            self.netlink
                .add_rule(&PolicyRule::from_pod(src, None, table))
                .await?;
        }
        debug!("reconverged from-pod rules for {src} (table {table})");
        Ok(())
    }

    async fn delete_rule_list_by_src(&self, src: Ipv4Addr) -> Result<()> {
        for rule in self.rules_for_src(src).await? {
            self.netlink.delete_rule(&rule).await?;
        }
        Ok(())
    }

    async fn sweep_stale_rules(&self, live: &[Ipv4Addr]) -> Result<()> {
        let live: HashSet<Ipv4Addr> = live.iter().copied().collect();
        for rule in self.netlink.list_rules().await? {
            let pod_addr = match rule.priority {
                TO_POD_RULE_PRIORITY => rule.dst,
                FROM_POD_RULE_PRIORITY => rule.src,
                _ => None,
            };
            let Some(net) = pod_addr else { continue };
            if net.prefix() == 32 && !live.contains(&net.ip()) {
                info!("sweeping stale rule {rule:?}");
                self.netlink.delete_rule(&rule).await?;
            }
        }
        Ok(())
    }

    async fn device_index_by_mac(&self, mac: &str) -> Result<u32> {
        self.netlink
            .link_index_by_mac(mac)
            .await?
            .ok_or_else(|| Error::Netlink(format!("no link with mac {mac}")))
    }
}

async fn iptables(args: &[&str]) -> Result<bool> {
    let out = Command::new("iptables")
        .args(args)
        .output()
        .await
        .map_err(|e| Error::Netlink(format!("iptables: {e}")))?;
    if !out.status.success() {
        debug!(
            "iptables {:?} exited {}: {}",
            args,
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(out.status.success())
}

/// Check-then-append so repeated bootstraps converge instead of
/// stacking duplicate rules.
async fn ensure_iptables_rule(table: &str, chain: &str, spec: &[&str]) -> Result<()> {
    let mut check = vec!["-t", table, "-C", chain];
    check.extend_from_slice(spec);
    if iptables(&check).await? {
        return Ok(());
    }
    let mut append = vec!["-t", table, "-A", chain];
    append.extend_from_slice(spec);
    if !iptables(&append).await? {
        return Err(Error::Netlink(format!(
            "failed to append iptables rule in {chain}"
        )));
    }
    Ok(())
}

/// Host SNAT for pod egress that falls through to the main table. Only
/// needed when external SNAT is off; with external SNAT the cloud
/// fabric translates instead.
async fn ensure_snat_chain(primary_ip: Ipv4Addr, vpc_cidr: Ipv4Network) -> Result<()> {
    if !iptables(&["-t", "nat", "-N", SNAT_CHAIN]).await? {
        debug!("chain {SNAT_CHAIN} already present");
    }
    ensure_iptables_rule(
        "nat",
        "POSTROUTING",
        &["-m", "comment", "--comment", "hostnic SNAT", "-j", SNAT_CHAIN],
    )
    .await?;
    let vpc = vpc_cidr.to_string();
    let source = primary_ip.to_string();
    if let Err(e) = ensure_iptables_rule(
        "nat",
        SNAT_CHAIN,
        &["!", "-d", &vpc, "-j", "SNAT", "--to-source", &source],
    )
    .await
    {
        warn!(%e, "failed to ensure SNAT rule");
        return Err(e);
    }
    info!("host SNAT chain ready (to-source {source})");
    Ok(())
}
