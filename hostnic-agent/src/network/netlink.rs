use std::net::{IpAddr, Ipv4Addr};

use futures::TryStreamExt;
use ipnetwork::Ipv4Network;
use netlink_packet_route::AddressFamily;
use netlink_packet_route::link::LinkAttribute;
use netlink_packet_route::neighbour::NeighbourState;
use netlink_packet_route::route::RouteScope;
use netlink_packet_route::rule::{RuleAction, RuleAttribute, RuleFlags, RuleMessage};
use rtnetlink::{Handle, IpVersion, LinkUnspec, RouteMessageBuilder};
use tracing::debug;

use crate::network::PolicyRule;
use crate::{Error, Result};

/// Persistent netlink handle wrapping rtnetlink for link, address,
/// route, rule and neighbour operations in the host namespace. One per
/// process; in-namespace work uses a fresh connection on a dedicated OS
/// thread instead (see ns.rs).
pub struct NetlinkHandle {
    handle: Handle,
    _conn_task: tokio::task::JoinHandle<()>,
}

fn errno(err: &rtnetlink::Error) -> Option<i32> {
    if let rtnetlink::Error::NetlinkError(msg) = err {
        Some(msg.raw_code())
    } else {
        None
    }
}

/// EEXIST from an add is convergence, not failure.
pub(crate) fn is_exists(err: &rtnetlink::Error) -> bool {
    errno(err) == Some(-nix::libc::EEXIST)
}

/// ENOENT/ESRCH/ENODEV from a delete means the object is already gone.
pub(crate) fn is_gone(err: &rtnetlink::Error) -> bool {
    matches!(
        errno(err),
        Some(c) if c == -nix::libc::ENOENT || c == -nix::libc::ESRCH || c == -nix::libc::ENODEV
    )
}

pub fn parse_mac(mac: &str) -> Result<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = mac.split(':');
    for byte in out.iter_mut() {
        let part = parts
            .next()
            .ok_or_else(|| Error::Netlink(format!("invalid mac {mac}")))?;
        *byte = u8::from_str_radix(part, 16)
            .map_err(|_| Error::Netlink(format!("invalid mac {mac}")))?;
    }
    if parts.next().is_some() {
        return Err(Error::Netlink(format!("invalid mac {mac}")));
    }
    Ok(out)
}

impl NetlinkHandle {
    pub fn new() -> Result<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        let conn_task = tokio::spawn(conn);
        Ok(Self {
            handle,
            _conn_task: conn_task,
        })
    }

    pub async fn link_index(&self, name: &str) -> Result<Option<u32>> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(Some(msg.header.index)),
            Ok(None) => Ok(None),
            Err(e) if is_gone(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The kernel ifindex of the link carrying `mac`.
    pub async fn link_index_by_mac(&self, mac: &str) -> Result<Option<u32>> {
        let want = parse_mac(mac)?;
        let mut links = self.handle.link().get().execute();
        while let Some(msg) = links.try_next().await? {
            for attr in &msg.attributes {
                if let LinkAttribute::Address(addr) = attr {
                    if addr.as_slice() == want {
                        return Ok(Some(msg.header.index));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Delete a link by name. Already-gone links are fine.
    pub async fn delete_link(&self, name: &str) -> Result<()> {
        let Some(index) = self.link_index(name).await? else {
            return Ok(());
        };
        debug!("deleting link {name} (index {index})");
        match self.handle.link().del(index).execute().await {
            Ok(()) => Ok(()),
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn set_link_up(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).up().build())
            .execute()
            .await?;
        Ok(())
    }

    /// Replace (add-or-overwrite) an on-link route to `dst` out of
    /// `index`, optionally in a non-main table.
    pub async fn replace_onlink_route(
        &self,
        dst: Ipv4Network,
        index: u32,
        table: Option<u32>,
    ) -> Result<()> {
        let mut builder = RouteMessageBuilder::<Ipv4Addr>::default()
            .destination_prefix(dst.ip(), dst.prefix())
            .output_interface(index)
            .scope(RouteScope::Link);
        if let Some(table) = table {
            builder = builder.table_id(table);
        }
        self.handle
            .route()
            .add(builder.build())
            .replace()
            .execute()
            .await?;
        Ok(())
    }

    /// Replace the default route via `gateway` in `table`.
    pub async fn replace_default_route(
        &self,
        gateway: Ipv4Addr,
        index: u32,
        table: u32,
    ) -> Result<()> {
        let msg = RouteMessageBuilder::<Ipv4Addr>::default()
            .gateway(gateway)
            .output_interface(index)
            .table_id(table)
            .build();
        self.handle.route().add(msg).replace().execute().await?;
        Ok(())
    }

    /// Delete the route to `dst`. A missing route is fine.
    pub async fn delete_route(&self, dst: Ipv4Network, table: Option<u32>) -> Result<()> {
        let mut builder = RouteMessageBuilder::<Ipv4Addr>::default()
            .destination_prefix(dst.ip(), dst.prefix())
            .scope(RouteScope::Link);
        if let Some(table) = table {
            builder = builder.table_id(table);
        }
        match self.handle.route().del(builder.build()).execute().await {
            Ok(()) => Ok(()),
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Install a policy rule; an identical existing rule is fine.
    pub async fn add_rule(&self, rule: &PolicyRule) -> Result<()> {
        let mut req = self
            .handle
            .rule()
            .add()
            .v4()
            .action(RuleAction::ToTable)
            .table_id(rule.table)
            .priority(rule.priority);
        if let Some(src) = rule.src {
            req = req.source_prefix(src.ip(), src.prefix());
        }
        if let Some(dst) = rule.dst {
            req = req.destination_prefix(dst.ip(), dst.prefix());
        }
        if rule.invert {
            req.message_mut().header.flags |= RuleFlags::Invert;
        }
        match req.execute().await {
            Ok(()) => Ok(()),
            Err(e) if is_exists(&e) => {
                debug!("rule already present: {rule:?}");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every installed rule matching `rule`. A rule that does not
    /// exist is fine.
    pub async fn delete_rule(&self, rule: &PolicyRule) -> Result<()> {
        for (msg, parsed) in self.rule_messages().await? {
            if parsed == *rule {
                match self.handle.rule().del(msg).execute().await {
                    Ok(()) => {}
                    Err(e) if is_gone(&e) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    pub async fn list_rules(&self) -> Result<Vec<PolicyRule>> {
        Ok(self
            .rule_messages()
            .await?
            .into_iter()
            .map(|(_, r)| r)
            .collect())
    }

    pub(crate) async fn rule_messages(&self) -> Result<Vec<(RuleMessage, PolicyRule)>> {
        let mut out = Vec::new();
        let mut rules = self.handle.rule().get(IpVersion::V4).execute();
        while let Some(msg) = rules.try_next().await? {
            if let Some(parsed) = parse_rule(&msg) {
                out.push((msg, parsed));
            }
        }
        Ok(out)
    }

}

/// Permanent neighbour entry resolving `ip` to `lladdr` on `index`.
/// Takes a raw handle because it also runs on the in-namespace
/// connection.
pub(crate) async fn add_permanent_neighbour(
    handle: &Handle,
    index: u32,
    ip: Ipv4Addr,
    lladdr: &[u8],
) -> Result<()> {
    match handle
        .neighbours()
        .add(index, IpAddr::V4(ip))
        .link_local_address(lladdr)
        .state(NeighbourState::Permanent)
        .execute()
        .await
    {
        Ok(()) => Ok(()),
        Err(e) if is_exists(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn parse_rule(msg: &RuleMessage) -> Option<PolicyRule> {
    if msg.header.family != AddressFamily::Inet {
        return None;
    }
    let mut rule = PolicyRule {
        priority: 0,
        table: u32::from(msg.header.table),
        src: None,
        dst: None,
        invert: msg.header.flags.contains(RuleFlags::Invert),
    };
    for attr in &msg.attributes {
        match attr {
            RuleAttribute::Priority(p) => rule.priority = *p,
            RuleAttribute::Table(t) => rule.table = *t,
            RuleAttribute::Source(IpAddr::V4(ip)) => {
                rule.src = Ipv4Network::new(*ip, msg.header.src_len).ok();
            }
            RuleAttribute::Destination(IpAddr::V4(ip)) => {
                rule.dst = Ipv4Network::new(*ip, msg.header.dst_len).ok();
            }
            _ => {}
        }
    }
    Some(rule)
}
