pub mod client;

use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnetwork::Ipv4Network;

use crate::Result;

pub use client::ApiClient;

/// A vxnet is the subnet the cloud carves out of the VPC for this
/// cluster's pod addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VxNet {
    pub id: String,
    pub network: Ipv4Network,
}

#[derive(Clone, Debug)]
pub struct Vpc {
    pub id: String,
    pub cidr: Ipv4Network,
    pub sub_cidrs: Vec<Ipv4Network>,
    pub vxnets: Vec<VxNet>,
}

/// A network interface as the cloud reports it. The kernel device index
/// is only known once the interface is visible on the node; the
/// bootstrapper resolves it by MAC when the cloud does not carry it.
#[derive(Clone, Debug)]
pub struct HostNic {
    pub id: String,
    pub vxnet_id: String,
    pub mac: String,
    pub address: Ipv4Addr,
    pub is_primary: bool,
    pub device_index: Option<u32>,
}

/// The capability set the reconciler and bootstrapper consume. All
/// operations may transiently fail and are wrapped in bounded retries by
/// the caller; create/attach/detach/delete are idempotent on the cloud
/// side.
#[async_trait]
pub trait CloudApi: Send + Sync {
    fn instance_id(&self) -> &str;

    async fn node_vpc(&self) -> Result<Vpc>;

    async fn primary_nic(&self) -> Result<HostNic>;

    async fn attached_nics(&self, vxnet_id: &str) -> Result<Vec<HostNic>>;

    /// Create the cluster's dedicated vxnet if none exists yet, else
    /// return the one already tagged for the cluster.
    async fn ensure_vxnet(&self, cluster_name: &str) -> Result<VxNet>;

    async fn create_nic(&self, vxnet_id: &str, tags: &[String]) -> Result<HostNic>;

    async fn attach_nic(&self, nic_id: &str) -> Result<()>;

    async fn detach_nic(&self, nic_id: &str) -> Result<()>;

    async fn delete_nic(&self, nic_id: &str) -> Result<()>;
}
