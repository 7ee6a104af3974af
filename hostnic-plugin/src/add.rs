use hostnic_api::backend::v1::cni_backend_client::CniBackendClient;
use hostnic_api::backend::v1::{AddNetworkReply, AddNetworkRequest};
use tracing::{error, info};

use crate::config::{CniEnv, NetConf, PodArgs};
use crate::response::{Interface, Ip, Response, Route, Success};
use crate::{BACKEND_ADDRESS, Error, Result};

/// ADD: ask the daemon for an address and the wiring, then translate
/// the reply into a CNI result.
pub fn add(env: &CniEnv, conf: &NetConf) -> Response {
    info!("add called for container {}", env.container_id);
    if env.netns.is_empty() {
        return Error::InvalidEnv("CNI_NETNS is not set".into())
            .into_response(conf.cni_version.clone());
    }
    let pod = match PodArgs::parse(&env.args) {
        Ok(pod) => pod,
        Err(e) => return e.into_response(conf.cni_version.clone()),
    };

    let request = AddNetworkRequest {
        k8s_pod_name: pod.name,
        k8s_pod_namespace: pod.namespace,
        k8s_pod_infra_container_id: env.container_id.clone(),
        netns: env.netns.clone(),
        if_name: env.ifname.clone(),
    };
    let reply = match crate::block_on(request_add(request)) {
        Ok(reply) => reply,
        Err(e) => {
            error!(%e, "add request to backend failed");
            return e.into_response(conf.cni_version.clone());
        }
    };
    if !reply.success {
        error!("backend rejected add: {}", reply.message);
        // an exhausted pool is worth a retry once the reconciler grew it
        let err = if reply.message == "pool exhausted" {
            Error::Transient(reply.message)
        } else {
            Error::Backend(reply.message)
        };
        return err.into_response(conf.cni_version.clone());
    }

    info!(
        "backend assigned {} (device {})",
        reply.ipv4_addr, reply.device_number
    );
    Response::Success(Success {
        cni_version: conf.cni_version.clone(),
        interfaces: vec![Interface {
            name: env.ifname.clone(),
            mac: None,
            sandbox: Some(env.netns.clone()),
        }],
        ips: vec![Ip {
            version: "4".into(),
            address: format!("{}/32", reply.ipv4_addr),
            gateway: Some(crate::POD_GATEWAY.into()),
            interface: Some(0),
        }],
        routes: vec![Route {
            dst: "0.0.0.0/0".into(),
            gw: None,
        }],
    })
}

async fn request_add(request: AddNetworkRequest) -> Result<AddNetworkReply> {
    let mut client = CniBackendClient::connect(BACKEND_ADDRESS).await?;
    let mut request = tonic::Request::new(request);
    request.set_timeout(crate::RPC_TIMEOUT);
    Ok(client.add_network(request).await?.into_inner())
}
