use std::net::Ipv4Addr;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, ResourceExt};
use tracing::debug;

use crate::Result;

/// What bootstrap recovery needs to know about a pod scheduled here.
/// `ip` is absent while the pod is still being wired.
#[derive(Clone, Debug)]
pub struct PodDescriptor {
    pub namespace: String,
    pub name: String,
    pub container_id: String,
    pub ip: Option<Ipv4Addr>,
}

/// The orchestrator as the bootstrapper sees it; a test double stands in
/// for the API server.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn pods_on_node(&self, node_name: &str) -> Result<Vec<PodDescriptor>>;
}

pub struct KubeOrchestrator {
    client: kube::Client,
}

impl KubeOrchestrator {
    pub async fn try_default() -> Result<Self> {
        Ok(Self {
            client: kube::Client::try_default().await?,
        })
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn pods_on_node(&self, node_name: &str) -> Result<Vec<PodDescriptor>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!(
            "spec.nodeName={node_name},status.phase!=Failed,status.phase!=Succeeded"
        ));
        let list = pods.list(&params).await?;
        debug!("orchestrator reports {} pods on {node_name}", list.items.len());
        Ok(list
            .items
            .iter()
            .filter(|pod| !pod_is_host_network(pod))
            .map(|pod| PodDescriptor {
                namespace: pod.namespace().unwrap_or_default(),
                name: pod.name_any(),
                container_id: container_id(pod).unwrap_or_default(),
                ip: pod_ip(pod),
            })
            .collect())
    }
}

fn pod_ip(pod: &Pod) -> Option<Ipv4Addr> {
    pod.status
        .as_ref()?
        .pod_ip
        .as_ref()?
        .parse::<Ipv4Addr>()
        .ok()
}

/// The runtime prefixes ids with the engine name
/// (`containerd://<id>`); only the id itself is stable across lookups.
fn container_id(pod: &Pod) -> Option<String> {
    let statuses = pod.status.as_ref()?.container_statuses.as_ref()?;
    let id = statuses.first()?.container_id.as_ref()?;
    let id = id.split_once("://").map(|(_, id)| id).unwrap_or(id);
    Some(id.to_string())
}

fn pod_is_host_network(pod: &Pod) -> bool {
    let Some(spec) = pod.spec.as_ref() else {
        return false;
    };
    spec.host_network.unwrap_or_default()
}
