use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::AsRawFd;

use futures::TryStreamExt;
use ipnetwork::Ipv4Network;
use netlink_packet_route::link::LinkAttribute;
use netlink_packet_route::route::RouteScope;
use nix::sched::{CloneFlags, setns};
use rtnetlink::{Handle, LinkUnspec, LinkVeth, RouteMessageBuilder};
use tracing::{debug, info, warn};

use crate::network::netlink::{add_permanent_neighbour, is_exists};
use crate::network::{
    LinuxNetwork, POD_GATEWAY, PolicyRule, VETH_MTU, host_cidr,
};
use crate::{Error, Result};

/// Wire a pod namespace. The contract, in order:
///
/// 1. a stale host-side veth with the chosen name is deleted;
/// 2. the veth pair is created *inside* the pod namespace, both ends
///    brought up, the pod address assigned, an on-link /32 to the
///    synthetic gateway plus a default route via it installed, and a
///    permanent neighbour entry pins the gateway to the host end's MAC
///    (the veth has no broadcast domain, so ARP can never resolve it);
/// 3. the host end is moved into the host namespace and brought up;
/// 4. the host gets an on-link /32 route to the pod plus the to-pod
///    rule, and, for a secondary-nic address, the from-pod rules.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn setup_ns(
    net: &LinuxNetwork,
    host_veth: &str,
    cont_veth: &str,
    netns_path: &str,
    addr: Ipv4Addr,
    table: u32,
    vpc_cidrs: &[Ipv4Network],
    tunnel: Option<Ipv4Network>,
    use_external_snat: bool,
) -> Result<()> {
    debug!("setup_ns: host={host_veth} cont={cont_veth} netns={netns_path} table={table}");

    // Left over from a crashed earlier attempt.
    net.netlink.delete_link(host_veth).await?;

    let host_ns = std::fs::File::open("/proc/self/ns/net")?;
    wire_pod_namespace(
        netns_path.to_string(),
        host_ns,
        host_veth.to_string(),
        cont_veth.to_string(),
        addr,
    )
    .await?;

    let index = net
        .netlink
        .link_index(host_veth)
        .await?
        .ok_or_else(|| Error::Netlink(format!("host veth {host_veth} did not arrive")))?;
    net.netlink.set_link_up(index).await?;
    net.netlink
        .replace_onlink_route(host_cidr(addr), index, None)
        .await?;

    // Delete-then-add so a stale rule converges on the intended state.
    let to_pod = PolicyRule::to_pod(addr);
    net.netlink.delete_rule(&to_pod).await?;
    net.netlink.add_rule(&to_pod).await?;
    info!("added to-pod rule for {addr}");

    // From-pod rules only exist for secondary-nic addresses.
    if table > 0 {
        if use_external_snat {
            net.netlink
                .add_rule(&PolicyRule::from_pod(addr, None, table))
                .await?;
            info!("added from-pod rule for {addr} table {table}");
        } else {
            let mut cidrs = vpc_cidrs.to_vec();
            if let Some(tunnel) = tunnel {
                debug!("appending tunnel net {tunnel} to vpc cidrs");
                cidrs.push(tunnel);
            }
            for cidr in cidrs {
                net.netlink
                    .add_rule(&PolicyRule::from_pod(addr, Some(cidr), table))
                    .await?;
            }
            info!("added from-pod rules for {addr} table {table}");
        }
    }
    Ok(())
}

/// Reverse of `setup_ns`: the rules and the host route go; the veth pair
/// dies with the pod namespace. Missing objects are tolerated.
pub(crate) async fn teardown_ns(net: &LinuxNetwork, addr: Ipv4Addr, table: u32) -> Result<()> {
    debug!("teardown_ns: addr={addr} table={table}");

    net.netlink.delete_rule(&PolicyRule::to_pod(addr)).await?;

    if table > 0 {
        for rule in net.rules_for_src(addr).await? {
            if let Err(e) = net.netlink.delete_rule(&rule).await {
                warn!(%e, "failed to delete from-pod rule for {addr}");
                return Err(e);
            }
        }
    }

    net.netlink.delete_route(host_cidr(addr), None).await?;
    Ok(())
}

/// setns() binds the *calling OS thread* to the namespace, so the
/// in-namespace half always runs on a dedicated thread with its own
/// current-thread runtime and netlink connection, never on a tokio
/// worker.
async fn wire_pod_namespace(
    netns_path: String,
    host_ns: std::fs::File,
    host_veth: String,
    cont_veth: String,
    addr: Ipv4Addr,
) -> Result<()> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    std::thread::spawn(move || {
        let result = in_pod_namespace(&netns_path, host_ns, &host_veth, &cont_veth, addr);
        let _ = tx.send(result);
    });
    rx.await
        .map_err(|_| Error::Namespace("in-namespace thread panicked".to_string()))?
}

fn in_pod_namespace(
    netns_path: &str,
    host_ns: std::fs::File,
    host_veth: &str,
    cont_veth: &str,
    addr: Ipv4Addr,
) -> Result<()> {
    let ns_file = std::fs::File::open(netns_path)
        .map_err(|e| Error::Namespace(format!("open {netns_path}: {e}")))?;
    setns(&ns_file, CloneFlags::CLONE_NEWNET)
        .map_err(|e| Error::Namespace(format!("setns {netns_path}: {e}")))?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(conn);

        handle
            .link()
            .add(LinkVeth::new(cont_veth, host_veth).mtu(VETH_MTU).build())
            .execute()
            .await?;

        let (host_index, host_mac) = link_by_name(&handle, host_veth).await?;
        let (cont_index, _) = link_by_name(&handle, cont_veth).await?;

        // Up before routing; a down veth never gets its routes.
        handle
            .link()
            .set(LinkUnspec::new_with_index(host_index).up().build())
            .execute()
            .await?;
        handle
            .link()
            .set(LinkUnspec::new_with_index(cont_index).up().build())
            .execute()
            .await?;

        // On-link /32 to the synthetic next hop, then the default route
        // through it.
        let gw_route = RouteMessageBuilder::<Ipv4Addr>::default()
            .destination_prefix(POD_GATEWAY, 32)
            .output_interface(cont_index)
            .scope(RouteScope::Link)
            .build();
        handle.route().add(gw_route).replace().execute().await?;

        let default_route = RouteMessageBuilder::<Ipv4Addr>::default()
            .gateway(POD_GATEWAY)
            .output_interface(cont_index)
            .build();
        handle.route().add(default_route).replace().execute().await?;

        match handle
            .address()
            .add(cont_index, IpAddr::V4(addr), 32)
            .execute()
            .await
        {
            Ok(()) => {}
            Err(e) if is_exists(&e) => {}
            Err(e) => return Err(e.into()),
        }

        let host_mac = host_mac
            .ok_or_else(|| Error::Netlink(format!("veth {host_veth} has no hardware address")))?;
        add_permanent_neighbour(&handle, cont_index, POD_GATEWAY, &host_mac).await?;

        // Everything inside the namespace is in place; hand the host end
        // back.
        handle
            .link()
            .set(
                LinkUnspec::new_with_index(host_index)
                    .setns_by_fd(host_ns.as_raw_fd())
                    .build(),
            )
            .execute()
            .await?;
        Ok(())
    })
}

async fn link_by_name(handle: &Handle, name: &str) -> Result<(u32, Option<Vec<u8>>)> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    let msg = links
        .try_next()
        .await?
        .ok_or_else(|| Error::Netlink(format!("link {name} not found in pod namespace")))?;
    let mac = msg.attributes.iter().find_map(|attr| {
        if let LinkAttribute::Address(mac) = attr {
            Some(mac.clone())
        } else {
            None
        }
    });
    Ok((msg.header.index, mac))
}
