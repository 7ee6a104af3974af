use hostnic_api::backend::v1::cni_backend_client::CniBackendClient;
use hostnic_api::backend::v1::{DelNetworkReply, DelNetworkRequest};
use tracing::{error, info};

use crate::config::{CniEnv, NetConf, PodArgs};
use crate::response::{Response, Success};
use crate::{BACKEND_ADDRESS, Error, Result};

/// DEL: the daemon owns the address bookkeeping, so a delete reduces to
/// one RPC. A pod the daemon no longer knows is already cleaned up.
pub fn delete(env: &CniEnv, conf: &NetConf) -> Response {
    info!("delete called for container {}", env.container_id);
    let pod = match PodArgs::parse(&env.args) {
        Ok(pod) => pod,
        Err(e) => return e.into_response(conf.cni_version.clone()),
    };

    let request = DelNetworkRequest {
        k8s_pod_name: pod.name,
        k8s_pod_namespace: pod.namespace,
        k8s_pod_infra_container_id: env.container_id.clone(),
        ipv4_addr: String::new(),
        reason: "PodDeleted".into(),
    };
    let reply = match crate::block_on(request_del(request)) {
        Ok(reply) => reply,
        Err(e) => {
            error!(%e, "delete request to backend failed");
            return e.into_response(conf.cni_version.clone());
        }
    };
    if !reply.success {
        error!("backend rejected delete: {}", reply.message);
        return Error::Backend(reply.message).into_response(conf.cni_version.clone());
    }

    info!("released {}", reply.ipv4_addr);
    Response::Success(Success {
        cni_version: conf.cni_version.clone(),
        interfaces: Vec::new(),
        ips: Vec::new(),
        routes: Vec::new(),
    })
}

async fn request_del(request: DelNetworkRequest) -> Result<DelNetworkReply> {
    let mut client = CniBackendClient::connect(BACKEND_ADDRESS).await?;
    let mut request = tonic::Request::new(request);
    request.set_timeout(crate::RPC_TIMEOUT);
    Ok(client.del_network(request).await?.into_inner())
}
