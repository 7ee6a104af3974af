use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use crate::cloud::{CloudApi, HostNic, VxNet, Vpc};
use crate::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Thin JSON client for the IaaS control API. The heavy lifting
/// (signing, pagination, the full resource model) lives on the server
/// side; this client only speaks the handful of actions the daemon
/// needs, authenticated by the node's service token.
pub struct ApiClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
    instance_id: String,
}

#[derive(serde::Deserialize)]
struct NicRecord {
    nic_id: String,
    vxnet_id: String,
    mac: String,
    private_ip: Ipv4Addr,
    #[serde(default)]
    role: String,
}

impl NicRecord {
    fn into_host_nic(self) -> HostNic {
        HostNic {
            id: self.nic_id,
            vxnet_id: self.vxnet_id,
            mac: self.mac,
            address: self.private_ip,
            is_primary: self.role == "primary",
            device_index: None,
        }
    }
}

#[derive(serde::Deserialize)]
struct VxNetRecord {
    vxnet_id: String,
    network: Ipv4Network,
}

impl From<VxNetRecord> for VxNet {
    fn from(v: VxNetRecord) -> Self {
        VxNet {
            id: v.vxnet_id,
            network: v.network,
        }
    }
}

impl ApiClient {
    /// The instance id is stamped onto the node by the platform; the
    /// token authorizes this node to manage its own nics.
    pub fn new(endpoint: &str, token_file: &Path, instance_id_file: &Path) -> Result<Self> {
        let token = std::fs::read_to_string(token_file)
            .map_err(|e| Error::Bootstrap(format!("read {}: {e}", token_file.display())))?
            .trim()
            .to_string();
        let instance_id = std::fs::read_to_string(instance_id_file)
            .map_err(|e| Error::Bootstrap(format!("read {}: {e}", instance_id_file.display())))?
            .trim()
            .to_string();
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
            instance_id,
        })
    }

    async fn call<B: Serialize, T: DeserializeOwned>(&self, action: &str, body: &B) -> Result<T> {
        debug!("cloud api call {action}");
        let resp = self
            .http
            .post(format!("{}/{action}", self.endpoint))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Cloud(format!("{action}: {status}: {text}")));
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl CloudApi for ApiClient {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn node_vpc(&self) -> Result<Vpc> {
        #[derive(serde::Deserialize)]
        struct Reply {
            vpc_id: String,
            cidr: Ipv4Network,
            sub_cidrs: Vec<Ipv4Network>,
            vxnets: Vec<VxNetRecord>,
        }
        let reply: Reply = self
            .call("DescribeNodeVpc", &json!({ "instance": self.instance_id }))
            .await?;
        Ok(Vpc {
            id: reply.vpc_id,
            cidr: reply.cidr,
            sub_cidrs: reply.sub_cidrs,
            vxnets: reply.vxnets.into_iter().map(VxNet::from).collect(),
        })
    }

    async fn primary_nic(&self) -> Result<HostNic> {
        #[derive(serde::Deserialize)]
        struct Reply {
            nic: NicRecord,
        }
        let reply: Reply = self
            .call("DescribePrimaryNic", &json!({ "instance": self.instance_id }))
            .await?;
        Ok(reply.nic.into_host_nic())
    }

    async fn attached_nics(&self, vxnet_id: &str) -> Result<Vec<HostNic>> {
        #[derive(serde::Deserialize)]
        struct Reply {
            nics: Vec<NicRecord>,
        }
        let reply: Reply = self
            .call(
                "DescribeNics",
                &json!({ "instance": self.instance_id, "vxnet": vxnet_id, "status": "in-use" }),
            )
            .await?;
        Ok(reply.nics.into_iter().map(NicRecord::into_host_nic).collect())
    }

    async fn ensure_vxnet(&self, cluster_name: &str) -> Result<VxNet> {
        #[derive(serde::Deserialize)]
        struct Reply {
            vxnet: VxNetRecord,
        }
        let reply: Reply = self
            .call(
                "EnsureVxnet",
                &json!({ "instance": self.instance_id, "cluster": cluster_name }),
            )
            .await?;
        Ok(reply.vxnet.into())
    }

    async fn create_nic(&self, vxnet_id: &str, tags: &[String]) -> Result<HostNic> {
        #[derive(serde::Deserialize)]
        struct Reply {
            nic: NicRecord,
        }
        let reply: Reply = self
            .call(
                "CreateNic",
                &json!({ "instance": self.instance_id, "vxnet": vxnet_id, "tags": tags }),
            )
            .await?;
        Ok(reply.nic.into_host_nic())
    }

    async fn attach_nic(&self, nic_id: &str) -> Result<()> {
        self.call::<_, serde_json::Value>(
            "AttachNic",
            &json!({ "instance": self.instance_id, "nic": nic_id }),
        )
        .await?;
        Ok(())
    }

    async fn detach_nic(&self, nic_id: &str) -> Result<()> {
        self.call::<_, serde_json::Value>(
            "DetachNic",
            &json!({ "instance": self.instance_id, "nic": nic_id }),
        )
        .await?;
        Ok(())
    }

    async fn delete_nic(&self, nic_id: &str) -> Result<()> {
        self.call::<_, serde_json::Value>("DeleteNic", &json!({ "nic": nic_id }))
            .await?;
        Ok(())
    }
}
