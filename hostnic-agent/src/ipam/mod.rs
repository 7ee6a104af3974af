pub mod reconciler;
pub mod server;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ipnetwork::Ipv4Network;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cloud::{ApiClient, CloudApi, HostNic, VxNet, Vpc};
use crate::config::AgentArgs;
use crate::datastore::{DataStore, DataStoreError, PodInfo};
use crate::kubernetes::{KubeOrchestrator, Orchestrator, PodDescriptor};
use crate::network::{LinuxNetwork, NetworkApi, vpn_net};
use crate::{Error, Result, cni, metrics};

/// In-flight RPCs get this long to drain on shutdown.
pub const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(120);

const POD_LIST_ATTEMPTS: u32 = 5;
const POD_LIST_DELAY: Duration = Duration::from_secs(5);

/// The first nics need a moment to arrive before the readiness loop
/// starts polling.
const POOL_SETTLE_DELAY: Duration = Duration::from_secs(20);
const POOL_WAIT_ATTEMPTS: u32 = 10;
const POOL_WAIT_DELAY: Duration = Duration::from_secs(5);

/// Identity of this node in the cloud; immutable once bootstrap filled
/// it in.
#[derive(Clone, Debug)]
pub struct NodeInfo {
    pub instance_id: String,
    pub node_name: String,
    pub vpc: Vpc,
    pub vxnet: VxNet,
    pub primary_nic: HostNic,
}

impl NodeInfo {
    /// The address ranges considered on-VPC for rule fan-out.
    pub fn vpc_subnets(&self) -> Vec<Ipv4Network> {
        if self.vpc.vxnets.is_empty() {
            self.vpc.sub_cidrs.clone()
        } else {
            self.vpc.vxnets.iter().map(|v| v.network).collect()
        }
    }
}

/// Root of the daemon: owns the datastore and the handles to the cloud
/// and the kernel, and is threaded into every handler explicitly.
pub struct Ipamd {
    pub(crate) config: AgentArgs,
    pub(crate) node: NodeInfo,
    pub(crate) datastore: Mutex<DataStore>,
    pub(crate) cloud: Arc<dyn CloudApi>,
    pub(crate) network: Arc<dyn NetworkApi>,
    /// Serializes pool growth between the reconciler and an Add that
    /// found the pool empty.
    pub(crate) grow_lock: tokio::sync::Mutex<()>,
}

impl Ipamd {
    /// Strict bootstrap order: identity, vpc, subnet, primary nic, host
    /// network, attached nics, then recovery of pods that survived a
    /// daemon restart. Any failure here fails process start; the CNI
    /// config is not written and the runtime keeps the node NotReady.
    pub async fn bootstrap(
        config: AgentArgs,
        cloud: Arc<dyn CloudApi>,
        network: Arc<dyn NetworkApi>,
        orchestrator: &dyn Orchestrator,
    ) -> Result<Self> {
        let instance_id = cloud.instance_id().to_string();
        info!("bootstrapping ipamd on instance {instance_id}");

        let vpc = cloud
            .node_vpc()
            .await
            .map_err(|e| Error::Bootstrap(format!("fetch vpc of {instance_id}: {e}")))?;
        let vxnet = cloud
            .ensure_vxnet(&config.cluster_name)
            .await
            .map_err(|e| Error::Bootstrap(format!("ensure vxnet: {e}")))?;
        let mut primary_nic = cloud
            .primary_nic()
            .await
            .map_err(|e| Error::Bootstrap(format!("fetch primary nic: {e}")))?;
        primary_nic.is_primary = true;

        info!("setting up host network (vpc {}, vxnet {})", vpc.id, vxnet.id);
        network
            .setup_host_network(
                vpc.cidr,
                &vpc.sub_cidrs,
                &primary_nic.mac,
                primary_nic.address,
                config.external_snat,
            )
            .await
            .map_err(|e| Error::Bootstrap(format!("setup host network: {e}")))?;

        let node = NodeInfo {
            instance_id,
            node_name: config.node_name.clone(),
            vpc,
            vxnet,
            primary_nic: primary_nic.clone(),
        };
        let ipamd = Self {
            config,
            node,
            datastore: Mutex::new(DataStore::new()),
            cloud,
            network,
            grow_lock: tokio::sync::Mutex::new(()),
        };

        ipamd.setup_nic(&primary_nic).await?;
        let attached = ipamd.cloud.attached_nics(&ipamd.node.vxnet.id).await?;
        for nic in &attached {
            ipamd
                .setup_nic(nic)
                .await
                .map_err(|e| Error::Bootstrap(format!("set up nic {}: {e}", nic.id)))?;
        }
        info!("adopted {} attached nics", attached.len());

        ipamd.recover_local_pods(orchestrator).await?;
        info!("ipamd bootstrap complete");
        Ok(ipamd)
    }

    /// Wire one nic into the host and the datastore. Duplicates are
    /// non-fatal so re-observing an adopted nic converges.
    pub(crate) async fn setup_nic(&self, nic: &HostNic) -> Result<u32> {
        let device_index = match nic.device_index {
            Some(index) => index,
            None => self.network.device_index_by_mac(&nic.mac).await?,
        };
        {
            let mut ds = self.datastore.lock().unwrap();
            match ds.add_nic(&nic.id, device_index, nic.is_primary) {
                Ok(()) => {}
                Err(DataStoreError::DuplicateNic(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if nic.is_primary {
            return Ok(device_index);
        }
        self.network
            .setup_nic_network(nic.address, &nic.mac, device_index, self.node.vxnet.network)
            .await?;
        let mut ds = self.datastore.lock().unwrap();
        match ds.add_ip(&nic.id, nic.address) {
            Ok(()) => {}
            Err(DataStoreError::DuplicateIp(_, _)) => {}
            Err(e) => {
                warn!(%e, "failed to add {} to the pool", nic.address);
                return Err(e.into());
            }
        }
        Ok(device_index)
    }

    /// Rebuild assignments and rules for pods that were wired before the
    /// daemon restarted, then sweep rules whose pod no longer exists.
    async fn recover_local_pods(&self, orchestrator: &dyn Orchestrator) -> Result<()> {
        let pods = self.list_pods_settled(orchestrator).await?;

        let rules = match self.network.get_rule_list().await {
            Ok(rules) => rules,
            Err(e) => {
                warn!(%e, "failed to retrieve rule list, skipping pod recovery");
                return Ok(());
            }
        };

        for pod in &pods {
            let Some(ip) = pod.ip else {
                warn!("skipping pod {}/{}: no ip yet", pod.namespace, pod.name);
                continue;
            };
            info!("recovering pod {}/{} at {ip}", pod.namespace, pod.name);
            let info = PodInfo {
                namespace: pod.namespace.clone(),
                name: pod.name.clone(),
                container_id: pod.container_id.clone(),
            };
            if let Err(e) = self.datastore.lock().unwrap().assign_pod_address(&info, ip) {
                warn!(%e, "failed to recover {ip} for pod {}/{}", pod.namespace, pod.name);
            }

            // Reconverge the rules in case VPC CIDRs or the SNAT mode
            // changed while the daemon was down.
            let Some(table) = self.datastore.lock().unwrap().nic_index_by_ip(ip) else {
                error!("cannot find device for recovered pod ip {ip}");
                continue;
            };
            let mut cidrs = self.node.vpc_subnets();
            if self.config.vpn_traffic {
                cidrs.push(vpn_net(ip));
            }
            if let Err(e) = self
                .network
                .update_rule_list_by_src(&rules, ip, &cidrs, !self.config.external_snat, table)
                .await
            {
                error!(%e, "failed to update rules for recovered pod ip {ip}");
            }
        }

        // Pods deleted while the daemon was down leak their rules; drop
        // everything per-pod that no recovered assignment explains.
        let live = self.datastore.lock().unwrap().assigned_ips();
        if let Err(e) = self.network.sweep_stale_rules(&live).await {
            warn!(%e, "stale rule sweep failed");
        }
        Ok(())
    }

    /// Pods may briefly have no IP right after kubelet restarts; give
    /// the orchestrator a bounded window to settle.
    async fn list_pods_settled(&self, orchestrator: &dyn Orchestrator) -> Result<Vec<PodDescriptor>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match orchestrator.pods_on_node(&self.config.node_name).await {
                Ok(pods) if pods.iter().all(|p| p.ip.is_some()) => return Ok(pods),
                Ok(pods) if attempt >= POD_LIST_ATTEMPTS => {
                    warn!("proceeding although some pods still have no ip");
                    return Ok(pods);
                }
                Ok(_) => info!("not all pods have ips yet, retrying"),
                Err(e) if attempt >= POD_LIST_ATTEMPTS => {
                    return Err(Error::Bootstrap(format!("list pods on node: {e}")));
                }
                Err(e) => warn!(%e, "failed to list pods, retrying"),
            }
            metrics::count_retry("pods_on_node");
            tokio::time::sleep(POD_LIST_DELAY).await;
        }
    }

    pub fn stats(&self) -> (usize, usize) {
        self.datastore.lock().unwrap().stats()
    }

    /// Blocks until the pool can serve at least one pod, then writes the
    /// CNI config; its presence marks the node ready.
    pub async fn wait_and_write_cni_config(&self) -> Result<()> {
        tokio::time::sleep(POOL_SETTLE_DELAY).await;
        for attempt in 1..=POOL_WAIT_ATTEMPTS {
            let (total, assigned) = self.stats();
            if total > assigned {
                cni::write_config(&self.config.cni_config_path, &self.config.veth_prefix)?;
                return Ok(());
            }
            info!("pool has no free address yet (attempt {attempt}), waiting");
            tokio::time::sleep(POOL_WAIT_DELAY).await;
        }
        Err(Error::Bootstrap(
            "pool never accumulated a free address".to_string(),
        ))
    }
}

/// Bring the daemon up and run it until `cancel` fires: bootstrap,
/// reconciler, RPC server, readiness.
pub async fn run(args: AgentArgs, ready: CancellationToken, cancel: CancellationToken) -> Result<()> {
    let cloud = Arc::new(ApiClient::new(
        &args.cloud_endpoint,
        &args.cloud_token_file,
        &args.instance_id_file,
    )?);
    let network = Arc::new(LinuxNetwork::new()?);
    let orchestrator = KubeOrchestrator::try_default().await?;

    let ipamd = Arc::new(Ipamd::bootstrap(args, cloud, network, &orchestrator).await?);

    let grpc_address = ipamd.config.grpc_address;
    tokio::spawn(ipamd.clone().run_pool_reconciler(cancel.child_token()));
    let mut rpc = tokio::spawn(server::serve(ipamd.clone(), grpc_address, cancel.child_token()));

    ipamd.wait_and_write_cni_config().await?;
    ready.cancel();
    info!("node is ready for pods");

    tokio::select! {
        _ = cancel.cancelled() => {
            // Attached nics survive the daemon and the CNI config stays;
            // only the in-flight RPCs get drained.
            match tokio::time::timeout(GRACEFUL_TIMEOUT, &mut rpc).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(Error::Other(format!("rpc server task failed: {e}"))),
                Err(_) => {
                    warn!("rpc server did not drain within {GRACEFUL_TIMEOUT:?}");
                    rpc.abort();
                    Ok(())
                }
            }
        }
        result = &mut rpc => match result {
            Ok(result) => result,
            Err(e) => Err(Error::Other(format!("rpc server task failed: {e}"))),
        },
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use ipnetwork::Ipv4Network;

    use super::*;
    use crate::network::PolicyRule;

    pub(crate) fn test_args() -> AgentArgs {
        use clap::Parser;
        AgentArgs::parse_from([
            "hostnic-agent",
            "--node-name",
            "worker-1",
            "--cloud-endpoint",
            "http://127.0.0.1:1",
        ])
    }

    pub(crate) fn test_node() -> NodeInfo {
        let vxnet = VxNet {
            id: "vxnet-pods".into(),
            network: "10.10.1.0/24".parse().unwrap(),
        };
        NodeInfo {
            instance_id: "i-test".into(),
            node_name: "worker-1".into(),
            vpc: Vpc {
                id: "vpc-1".into(),
                cidr: "10.10.0.0/16".parse().unwrap(),
                sub_cidrs: vec!["10.10.0.0/16".parse().unwrap()],
                vxnets: vec![
                    VxNet {
                        id: "vxnet-nodes".into(),
                        network: "10.10.0.0/24".parse().unwrap(),
                    },
                    vxnet.clone(),
                ],
            },
            vxnet,
            primary_nic: HostNic {
                id: "nic-primary".into(),
                vxnet_id: "vxnet-nodes".into(),
                mac: "52:54:00:00:00:01".into(),
                address: Ipv4Addr::new(10, 10, 0, 5),
                is_primary: true,
                device_index: Some(0),
            },
        }
    }

    /// Cloud double: a fixed address plan, call counters, and switches
    /// for failure injection.
    pub(crate) struct MockCloud {
        pub nics: StdMutex<HashMap<String, HostNic>>,
        next_nic: AtomicU32,
        pub create_calls: AtomicUsize,
        pub attach_calls: AtomicUsize,
        pub detach_calls: AtomicUsize,
        pub delete_calls: AtomicUsize,
        pub describe_calls: AtomicUsize,
    }

    impl MockCloud {
        pub fn new() -> Self {
            Self {
                nics: StdMutex::new(HashMap::new()),
                next_nic: AtomicU32::new(1),
                create_calls: AtomicUsize::new(0),
                attach_calls: AtomicUsize::new(0),
                detach_calls: AtomicUsize::new(0),
                delete_calls: AtomicUsize::new(0),
                describe_calls: AtomicUsize::new(0),
            }
        }

        pub fn cloud_mutations(&self) -> usize {
            self.create_calls.load(Ordering::SeqCst)
                + self.attach_calls.load(Ordering::SeqCst)
                + self.detach_calls.load(Ordering::SeqCst)
                + self.delete_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CloudApi for MockCloud {
        fn instance_id(&self) -> &str {
            "i-test"
        }

        async fn node_vpc(&self) -> Result<Vpc> {
            Ok(test_node().vpc)
        }

        async fn primary_nic(&self) -> Result<HostNic> {
            Ok(test_node().primary_nic)
        }

        async fn attached_nics(&self, _vxnet_id: &str) -> Result<Vec<HostNic>> {
            self.describe_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.nics.lock().unwrap().values().cloned().collect())
        }

        async fn ensure_vxnet(&self, _cluster_name: &str) -> Result<VxNet> {
            Ok(test_node().vxnet)
        }

        async fn create_nic(&self, vxnet_id: &str, _tags: &[String]) -> Result<HostNic> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            let n = self.next_nic.fetch_add(1, Ordering::SeqCst);
            let nic = HostNic {
                id: format!("nic-{n}"),
                vxnet_id: vxnet_id.to_string(),
                mac: format!("52:54:00:00:01:{n:02x}"),
                address: Ipv4Addr::new(10, 10, 1, 10 + n as u8),
                is_primary: false,
                device_index: Some(n),
            };
            self.nics.lock().unwrap().insert(nic.id.clone(), nic.clone());
            Ok(nic)
        }

        async fn attach_nic(&self, _nic_id: &str) -> Result<()> {
            self.attach_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn detach_nic(&self, nic_id: &str) -> Result<()> {
            self.detach_calls.fetch_add(1, Ordering::SeqCst);
            self.nics.lock().unwrap().remove(nic_id);
            Ok(())
        }

        async fn delete_nic(&self, _nic_id: &str) -> Result<()> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Network double: records every wiring call instead of touching the
    /// kernel; `fail_setup_ns` injects a wiring failure.
    #[derive(Default)]
    pub(crate) struct MockNetwork {
        pub calls: StdMutex<Vec<String>>,
        pub rules: StdMutex<Vec<PolicyRule>>,
        pub fail_setup_ns: std::sync::atomic::AtomicBool,
    }

    impl MockNetwork {
        pub fn log(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NetworkApi for MockNetwork {
        async fn setup_host_network(
            &self,
            vpc_cidr: Ipv4Network,
            _vpc_subnets: &[Ipv4Network],
            _primary_mac: &str,
            _primary_ip: Ipv4Addr,
            _use_external_snat: bool,
        ) -> Result<()> {
            self.log(format!("setup_host_network {vpc_cidr}"));
            Ok(())
        }

        async fn setup_nic_network(
            &self,
            addr: Ipv4Addr,
            _mac: &str,
            device_index: u32,
            _subnet: Ipv4Network,
        ) -> Result<()> {
            self.log(format!("setup_nic_network {addr} table {device_index}"));
            Ok(())
        }

        async fn setup_ns(
            &self,
            host_veth: &str,
            _cont_veth: &str,
            _netns_path: &str,
            addr: Ipv4Addr,
            table: u32,
            vpc_cidrs: &[Ipv4Network],
            tunnel: Option<Ipv4Network>,
            use_external_snat: bool,
        ) -> Result<()> {
            if self.fail_setup_ns.load(Ordering::SeqCst) {
                return Err(Error::Netlink("injected wiring failure".into()));
            }
            self.log(format!("setup_ns {host_veth} {addr} table {table}"));
            let mut rules = self.rules.lock().unwrap();
            rules.push(PolicyRule::to_pod(addr));
            if table > 0 {
                if use_external_snat {
                    rules.push(PolicyRule::from_pod(addr, None, table));
                } else {
                    for cidr in vpc_cidrs {
                        rules.push(PolicyRule::from_pod(addr, Some(*cidr), table));
                    }
                    if let Some(tunnel) = tunnel {
                        rules.push(PolicyRule::from_pod(addr, Some(tunnel), table));
                    }
                }
            }
            Ok(())
        }

        async fn teardown_ns(&self, addr: Ipv4Addr, table: u32) -> Result<()> {
            self.log(format!("teardown_ns {addr} table {table}"));
            let addr_net = crate::network::host_cidr(addr);
            self.rules
                .lock()
                .unwrap()
                .retain(|r| r.dst != Some(addr_net) && r.src != Some(addr_net));
            Ok(())
        }

        async fn get_rule_list(&self) -> Result<Vec<PolicyRule>> {
            Ok(self.rules.lock().unwrap().clone())
        }

        async fn update_rule_list_by_src(
            &self,
            _rules: &[PolicyRule],
            src: Ipv4Addr,
            cidrs: &[Ipv4Network],
            per_cidr: bool,
            table: u32,
        ) -> Result<()> {
            self.log(format!("update_rules {src} table {table}"));
            let src_net = crate::network::host_cidr(src);
            let mut rules = self.rules.lock().unwrap();
            rules.retain(|r| r.src != Some(src_net));
            if table > 0 {
                if per_cidr {
                    for cidr in cidrs {
                        rules.push(PolicyRule::from_pod(src, Some(*cidr), table));
                    }
                } else {
                    rules.push(PolicyRule::from_pod(src, None, table));
                }
            }
            Ok(())
        }

        async fn delete_rule_list_by_src(&self, src: Ipv4Addr) -> Result<()> {
            self.log(format!("delete_rules {src}"));
            let src_net = crate::network::host_cidr(src);
            self.rules.lock().unwrap().retain(|r| r.src != Some(src_net));
            Ok(())
        }

        async fn sweep_stale_rules(&self, live: &[Ipv4Addr]) -> Result<()> {
            self.log("sweep_stale_rules");
            let live: Vec<Ipv4Network> =
                live.iter().map(|ip| crate::network::host_cidr(*ip)).collect();
            self.rules.lock().unwrap().retain(|r| {
                let pod = match r.priority {
                    crate::network::TO_POD_RULE_PRIORITY => r.dst,
                    crate::network::FROM_POD_RULE_PRIORITY => r.src,
                    _ => None,
                };
                match pod {
                    Some(net) if net.prefix() == 32 => live.contains(&net),
                    _ => true,
                }
            });
            Ok(())
        }

        async fn device_index_by_mac(&self, mac: &str) -> Result<u32> {
            // the mock cloud encodes the device index in the last octet
            mac.rsplit(':')
                .next()
                .and_then(|octet| u32::from_str_radix(octet, 16).ok())
                .ok_or_else(|| Error::Netlink(format!("bad mac {mac}")))
        }
    }

    pub(crate) struct MockOrchestrator {
        pub pods: Vec<PodDescriptor>,
    }

    #[async_trait]
    impl Orchestrator for MockOrchestrator {
        async fn pods_on_node(&self, _node_name: &str) -> Result<Vec<PodDescriptor>> {
            Ok(self.pods.clone())
        }
    }

    /// An Ipamd wired to the doubles, skipping the cloud bootstrap.
    pub(crate) fn test_ipamd(cloud: Arc<MockCloud>, network: Arc<MockNetwork>) -> Ipamd {
        let ipamd = Ipamd {
            config: test_args(),
            node: test_node(),
            datastore: Mutex::new(DataStore::new()),
            cloud,
            network,
            grow_lock: tokio::sync::Mutex::new(()),
        };
        {
            let mut ds = ipamd.datastore.lock().unwrap();
            ds.add_nic("nic-primary", 0, true).unwrap();
        }
        ipamd
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_bootstrap_adopts_nics_and_recovers_pods() {
        let cloud = Arc::new(MockCloud::new());
        let network = Arc::new(MockNetwork::default());
        // one secondary already attached, one pod surviving on it
        cloud.create_nic("vxnet-pods", &[]).await.unwrap();
        let pod_ip = Ipv4Addr::new(10, 10, 1, 11);
        let orchestrator = MockOrchestrator {
            pods: vec![crate::kubernetes::PodDescriptor {
                namespace: "default".into(),
                name: "web-0".into(),
                container_id: "cid-web-0".into(),
                ip: Some(pod_ip),
            }],
        };

        let ipamd = Ipamd::bootstrap(
            test_args(),
            cloud.clone(),
            network.clone(),
            &orchestrator,
        )
        .await
        .unwrap();

        assert_eq!(ipamd.stats(), (1, 1));
        let calls = network.calls();
        assert!(calls.iter().any(|c| c.starts_with("setup_host_network")));
        assert!(calls.iter().any(|c| c.starts_with("setup_nic_network")));
        assert!(calls.iter().any(|c| c.starts_with("update_rules")));
        assert!(calls.iter().any(|c| c == "sweep_stale_rules"));
    }

    #[tokio::test]
    async fn test_recovery_tolerates_unknown_pod_ip() {
        let cloud = Arc::new(MockCloud::new());
        let network = Arc::new(MockNetwork::default());
        let orchestrator = MockOrchestrator {
            pods: vec![crate::kubernetes::PodDescriptor {
                namespace: "default".into(),
                name: "ghost".into(),
                container_id: "cid-ghost".into(),
                ip: Some(Ipv4Addr::new(192, 0, 2, 44)),
            }],
        };

        let ipamd = Ipamd::bootstrap(test_args(), cloud, network, &orchestrator)
            .await
            .unwrap();
        // the unknown address was logged, not fatal
        assert_eq!(ipamd.stats(), (0, 0));
    }
}
