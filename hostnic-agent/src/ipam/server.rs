use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use hostnic_api::backend::v1::cni_backend_server::{CniBackend, CniBackendServer};
use hostnic_api::backend::v1::{
    AddNetworkReply, AddNetworkRequest, DelNetworkReply, DelNetworkRequest,
};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{error, info, warn};

use crate::datastore::{DataStoreError, PodInfo, PodKey};
use crate::ipam::Ipamd;
use crate::network::{host_veth_name, vpn_net};
use crate::{http, metrics};

pub async fn serve(ipam: Arc<Ipamd>, addr: SocketAddr, cancel: CancellationToken) -> crate::Result<()> {
    info!("backend rpc listening on {addr}");
    tonic::transport::Server::builder()
        .add_service(CniBackendServer::new(BackendService::new(ipam)))
        .serve_with_shutdown(addr, http::shutdown(cancel))
        .await?;
    Ok(())
}

/// The RPC surface the per-invocation plugin talks to. Thin by design:
/// each handler is a datastore transaction plus one wiring call.
/// Internal errors never cross the wire; they map to
/// `{success, message}`.
pub struct BackendService {
    ipam: Arc<Ipamd>,
    /// Serializes Add/Del per pod key; distinct pods proceed in
    /// parallel.
    locks: Arc<DashMap<PodKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl BackendService {
    pub fn new(ipam: Arc<Ipamd>) -> Self {
        Self {
            ipam,
            locks: Arc::new(DashMap::new()),
        }
    }

    fn lock_for(&self, key: &PodKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn publish_pool_stats(&self) {
        let (total, assigned) = self.ipam.stats();
        metrics::set_pool_stats(total, assigned);
    }

    fn clone_handles(&self) -> Self {
        Self {
            ipam: self.ipam.clone(),
            locks: self.locks.clone(),
        }
    }

    async fn handle_add(&self, req: AddNetworkRequest) -> AddNetworkReply {
        let pod = PodInfo {
            namespace: req.k8s_pod_namespace,
            name: req.k8s_pod_name,
            container_id: req.k8s_pod_infra_container_id,
        };
        let lock = self.lock_for(&pod.key());
        let _guard = lock.lock().await;

        let assigned = self.ipam.datastore.lock().unwrap().assign_pod(&pod);
        let (ip, device) = match assigned {
            Ok(found) => found,
            Err(DataStoreError::NoFreeIp) => {
                warn!("pool empty on add for {}, growing synchronously", pod.key());
                if let Err(e) = self.ipam.try_grow_pool().await {
                    warn!(%e, "synchronous pool grow failed");
                    return add_failure("pool exhausted");
                }
                match self.ipam.datastore.lock().unwrap().assign_pod(&pod) {
                    Ok(found) => found,
                    Err(_) => return add_failure("pool exhausted"),
                }
            }
            Err(e) => {
                error!(%e, "assign failed for {}", pod.key());
                return add_failure(&e.to_string());
            }
        };

        let host_veth = host_veth_name(&self.ipam.config.veth_prefix, &pod.container_id);
        let mut vpc_cidrs = self.ipam.node.vpc_subnets();
        let tunnel = if self.ipam.config.vpn_traffic {
            Some(vpn_net(ip))
        } else {
            None
        };
        if let Err(e) = self
            .ipam
            .network
            .setup_ns(
                &host_veth,
                &req.if_name,
                &req.netns,
                ip,
                device,
                &vpc_cidrs,
                tunnel,
                self.ipam.config.external_snat,
            )
            .await
        {
            // Never leak the address when the wiring failed.
            error!(%e, "failed to wire pod {}", pod.key());
            if let Err(e) = self.ipam.datastore.lock().unwrap().unassign_pod(&pod) {
                error!(%e, "rollback after wiring failure also failed");
            }
            return add_failure(&format!("failed to set up pod network: {e}"));
        }

        if let Some(tunnel) = tunnel {
            vpc_cidrs.push(tunnel);
        }
        info!("add {}: assigned {ip} on device {device}", pod.key());
        self.publish_pool_stats();
        AddNetworkReply {
            success: true,
            ipv4_addr: ip.to_string(),
            ipv4_subnet: self.ipam.node.vxnet.network.to_string(),
            device_number: device as i32,
            use_external_snat: self.ipam.config.external_snat,
            vpc_cidrs: vpc_cidrs.iter().map(|c| c.to_string()).collect(),
            message: String::new(),
        }
    }

    async fn handle_del(&self, req: DelNetworkRequest) -> DelNetworkReply {
        let pod = PodInfo {
            namespace: req.k8s_pod_namespace,
            name: req.k8s_pod_name,
            container_id: req.k8s_pod_infra_container_id,
        };
        let lock = self.lock_for(&pod.key());
        let _guard = lock.lock().await;

        let released = self.ipam.datastore.lock().unwrap().unassign_pod(&pod);
        let (ip, device) = match released {
            Ok(found) => found,
            Err(DataStoreError::UnknownPod(_)) => {
                // The key is gone; fall back to the address if the caller
                // still knows it, otherwise the delete is already done.
                match req.ipv4_addr.parse::<Ipv4Addr>() {
                    Ok(ip) => match self.ipam.datastore.lock().unwrap().unassign_pod_by_ip(ip) {
                        Ok(device) => (ip, device),
                        Err(_) => {
                            info!("del {}: nothing to release ({})", pod.key(), req.reason);
                            return del_success(None);
                        }
                    },
                    Err(_) => {
                        info!("del {}: nothing to release ({})", pod.key(), req.reason);
                        return del_success(None);
                    }
                }
            }
            Err(e) => {
                error!(%e, "release failed for {}", pod.key());
                return del_failure(&e.to_string());
            }
        };

        if let Err(e) = self.ipam.network.teardown_ns(ip, device).await {
            error!(%e, "failed to tear down pod network for {ip}");
            return del_failure(&format!("failed to tear down pod network: {e}"));
        }

        info!("del {}: released {ip} from device {device} ({})", pod.key(), req.reason);
        self.publish_pool_stats();
        del_success(Some((ip, device)))
    }
}

fn add_failure(message: &str) -> AddNetworkReply {
    AddNetworkReply {
        success: false,
        ipv4_addr: String::new(),
        ipv4_subnet: String::new(),
        device_number: 0,
        use_external_snat: false,
        vpc_cidrs: Vec::new(),
        message: message.to_string(),
    }
}

fn del_success(released: Option<(Ipv4Addr, u32)>) -> DelNetworkReply {
    match released {
        Some((ip, device)) => DelNetworkReply {
            success: true,
            ipv4_addr: ip.to_string(),
            device_number: device as i32,
            message: String::new(),
        },
        None => DelNetworkReply {
            success: true,
            ipv4_addr: String::new(),
            device_number: 0,
            message: String::new(),
        },
    }
}

fn del_failure(message: &str) -> DelNetworkReply {
    DelNetworkReply {
        success: false,
        ipv4_addr: String::new(),
        device_number: 0,
        message: message.to_string(),
    }
}

#[tonic::async_trait]
impl CniBackend for BackendService {
    async fn add_network(
        &self,
        request: Request<AddNetworkRequest>,
    ) -> Result<Response<AddNetworkReply>, Status> {
        let started = Instant::now();
        // Detached so a client deadline cannot cancel us between the
        // datastore mutation and its rollback.
        let service = self.clone_handles();
        let req = request.into_inner();
        let reply = tokio::spawn(async move { service.handle_add(req).await })
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        metrics::count_rpc("add_network", reply.success);
        metrics::observe_rpc_duration("add_network", started.elapsed().as_secs_f64());
        Ok(Response::new(reply))
    }

    async fn del_network(
        &self,
        request: Request<DelNetworkRequest>,
    ) -> Result<Response<DelNetworkReply>, Status> {
        let started = Instant::now();
        let service = self.clone_handles();
        let req = request.into_inner();
        let reply = tokio::spawn(async move { service.handle_del(req).await })
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        metrics::count_rpc("del_network", reply.success);
        metrics::observe_rpc_duration("del_network", started.elapsed().as_secs_f64());
        Ok(Response::new(reply))
    }
}
