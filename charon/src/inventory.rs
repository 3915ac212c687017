//! Live device inventory.
//!
//! One task owns discovery: it subscribes to kernel link notifications,
//! falls back to periodic polling when the subscription cannot be bound, and
//! rebuilds the full device list on every refresh. Refreshes are coalesced
//! (notification bursts drain into one pass) and rate-limited. Uplinks, the
//! interfaces carrying the node's default routes, are never exposed; they
//! are the node's own connectivity.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use futures::TryStreamExt;
use futures::stream::StreamExt;
use netlink_packet_route::RouteNetlinkMessage;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::{LinkAttribute, LinkFlags, LinkMessage};
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
use netlink_sys::AsyncSocket;
use rtnetlink::constants::RTMGRP_LINK;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::{Device, DeviceKind, attr};
use crate::ebpf;

/// ceiling between refreshes even without notifications
const MAX_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
/// floor between consecutive refreshes
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// interface names owned by CNI plumbing, never exposed
const DENY_NAMES: &[&str] = &["cni0", "cbr0", "docker0", "flannel.1", "kube-ipvs0", "kube-bridge"];

/// name prefixes of known virtual-network tools
const VIRTUAL_PREFIXES: &[&str] = &["veth", "cali", "cilium_", "flannel", "antrea-", "ovn-", "ovs-"];

/// everything the inventory needs injected at startup
pub struct Inventory {
    /// MAC -> provider network name, discovered once by the cloud hook
    pub cloud_networks: HashMap<String, String>,
    /// id-to-name lookup backed by an embedded pci.ids database; the
    /// default resolves nothing and the raw ids are published instead
    pub pci_names: ifprobe::PciNameFn,
    /// sysfs roots, parameterized for tests
    pub net_root: PathBuf,
    pub ib_root: PathBuf,
}

fn no_pci_names(_ids: &ifprobe::PciIds) -> ifprobe::PciNames {
    ifprobe::PciNames::default()
}

impl Inventory {
    pub fn new(cloud_networks: HashMap<String, String>) -> Self {
        Inventory {
            cloud_networks,
            pci_names: no_pci_names,
            net_root: PathBuf::from(ifprobe::sysfs::NET_CLASS),
            ib_root: PathBuf::from(ifprobe::rdma::IB_CLASS),
        }
    }

    /// Run the refresh loop until cancellation, emitting the full device
    /// list into `tx` after every pass.
    pub async fn run(self, tx: mpsc::Sender<Vec<Device>>, token: CancellationToken) -> Result<()> {
        let (connection, handle, _) =
            rtnetlink::new_connection().context("failed to open netlink connection")?;
        tokio::spawn(connection);

        // second connection bound to the link multicast group for
        // change notifications
        let mut notifications = match subscribe_link_events() {
            Ok(messages) => Some(messages),
            Err(err) => {
                warn!(
                    "link notification subscription failed, polling only: {}",
                    err
                );
                None
            }
        };

        let uplinks = detect_uplinks(&handle).await.unwrap_or_else(|err| {
            warn!("uplink detection failed, exposing nothing extra: {}", err);
            HashSet::new()
        });
        info!("uplink ifindexes excluded from exposure: {:?}", uplinks);

        let mut last_refresh: Option<Instant> = None;

        loop {
            // honor the refresh floor before doing any work
            if let Some(last) = last_refresh {
                let since = last.elapsed();
                if since < MIN_REFRESH_INTERVAL {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(MIN_REFRESH_INTERVAL - since) => {}
                    }
                }
            }

            let devices = self.collect(&handle, &uplinks).await;
            last_refresh = Some(Instant::now());
            if tx.send(devices).await.is_err() {
                // consumer gone, nothing left to do
                break;
            }

            // wait for a change notification or the periodic tick
            let deadline = Instant::now() + MAX_REFRESH_INTERVAL;
            let mut monitor_lost = false;
            match &mut notifications {
                Some(messages) => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep_until(deadline) => {}
                        event = messages.next() => {
                            if event.is_none() {
                                monitor_lost = true;
                            } else {
                                // drain the burst so one refresh covers it
                                while let Ok(Some(_)) = messages.try_next() {}
                                debug!("link change notification, refreshing");
                            }
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
            }
            if monitor_lost {
                warn!("link notification stream closed, polling only");
                notifications = None;
            }
        }

        info!("inventory loop stopped");
        Ok(())
    }

    /// one full enumeration pass; per-interface errors skip the interface
    async fn collect(&self, handle: &rtnetlink::Handle, uplinks: &HashSet<u32>) -> Vec<Device> {
        let rdma_netdevs = ifprobe::rdma::netdev_map(&self.ib_root).unwrap_or_default();
        let rdma_links = ifprobe::rdma::list_links(&self.ib_root).unwrap_or_default();

        let mut devices = Vec::new();

        let mut links = handle.link().get().execute();
        loop {
            let message = match links.try_next().await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(err) => {
                    warn!("link enumeration failed: {}", err);
                    break;
                }
            };

            let Some(name) = link_name(&message) else {
                continue;
            };
            if !self.should_expose(&name, &message, uplinks) {
                continue;
            }

            match self
                .build_network_device(handle, &name, &message, &rdma_netdevs)
                .await
            {
                Ok(device) => devices.push(device),
                Err(err) => warn!("skipping {} this cycle: {}", name, err),
            }
        }

        for link in &rdma_links {
            devices.push(self.build_rdma_device(link));
        }

        debug!("inventory pass found {} devices", devices.len());
        devices
    }

    fn should_expose(&self, name: &str, message: &LinkMessage, uplinks: &HashSet<u32>) -> bool {
        if name == "lo" || message.header.flags.contains(LinkFlags::Loopback) {
            return false;
        }
        if uplinks.contains(&message.header.index) {
            debug!("skipping uplink {}", name);
            return false;
        }
        if DENY_NAMES.contains(&name) {
            return false;
        }
        if VIRTUAL_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
            return false;
        }
        true
    }

    async fn build_network_device(
        &self,
        handle: &rtnetlink::Handle,
        name: &str,
        message: &LinkMessage,
        rdma_netdevs: &HashMap<String, String>,
    ) -> Result<Device> {
        let mut device = Device::new(name, DeviceKind::Network);

        device.set(
            attr::LINK_TYPE,
            format!("{:?}", message.header.link_layer_type).to_lowercase(),
        );

        let mut mac = None;
        for attribute in &message.attributes {
            match attribute {
                LinkAttribute::Address(bytes) => {
                    let formatted = crate::engine::format_mac(bytes);
                    device.set(attr::MAC, formatted.clone());
                    mac = Some(formatted);
                }
                LinkAttribute::Mtu(mtu) => device.set(attr::MTU, *mtu as i64),
                LinkAttribute::OperState(state) => {
                    device.set(attr::STATE, format!("{:?}", state).to_lowercase());
                }
                LinkAttribute::IfAlias(alias) if !alias.is_empty() => {
                    device.set(attr::ALIAS, alias.clone());
                }
                LinkAttribute::LinkInfo(infos) => {
                    for info in infos {
                        if let netlink_packet_route::link::LinkInfo::Kind(kind) = info {
                            device.set(
                                attr::ENCAP,
                                format!("{:?}", kind).to_lowercase(),
                            );
                        }
                    }
                }
                _ => {}
            }
        }

        // addresses, global unicast only, comma-joined per family
        let (v4, v6) = collect_addresses(handle, message.header.index).await?;
        if !v4.is_empty() {
            device.set(attr::IPV4, v4.join(","));
        }
        if !v6.is_empty() {
            device.set(attr::IPV6, v6.join(","));
        }

        // sysfs: PCI, SR-IOV, NUMA
        match ifprobe::sysfs::probe_interface(&self.net_root, name) {
            Ok(iface) => {
                device.set(attr::VIRTUAL, !iface.has_device);
                if iface.is_sriov_pf() {
                    device.set(attr::SRIOV, true);
                    device.set(attr::SRIOV_VFS, iface.sriov_numvfs.unwrap_or(0) as i64);
                }
                if let Some(addr) = &iface.pci_addr {
                    if let Ok(pci) = ifprobe::pci::PciAddress::parse(addr) {
                        device.set(attr::PCI_DOMAIN, pci.domain as i64);
                        device.set(attr::PCI_BUS, pci.bus as i64);
                        device.set(attr::PCI_DEVICE, pci.device as i64);
                        device.set(attr::PCI_FUNCTION, pci.function as i64);
                    }
                }
                let device_dir = ifprobe::sysfs::device_dir(&self.net_root, name);
                if let Some(ids) = ifprobe::pci::read_ids(&device_dir) {
                    // prefer human names from the injected database, fall
                    // back to the raw ids
                    let names = (self.pci_names)(&ids);
                    device.set(
                        attr::PCI_VENDOR,
                        names.vendor.unwrap_or_else(|| format!("{:#06x}", ids.vendor)),
                    );
                    device.set(
                        attr::PCI_DEVICE_NAME,
                        names.device.unwrap_or_else(|| format!("{:#06x}", ids.device)),
                    );
                    device.set(
                        attr::PCI_SUBSYSTEM,
                        names.subsystem.unwrap_or_else(|| {
                            format!("{:#06x}:{:#06x}", ids.subsystem_vendor, ids.subsystem_device)
                        }),
                    );
                }
                if let Some(node) = ifprobe::pci::numa_node(&device_dir) {
                    device.set(attr::NUMA_NODE, node);
                }
            }
            Err(err) => debug!("no sysfs data for {}: {}", name, err),
        }

        // RDMA association
        if let Some(link) = rdma_netdevs.get(name) {
            device.set(attr::RDMA, true);
            device.set(attr::RDMA_LINK, link.clone());
        } else {
            device.set(attr::RDMA, false);
        }

        // cloud-provider network, when the hook discovered one for this MAC
        if let Some(mac) = mac {
            if let Some(network) = self.cloud_networks.get(&mac) {
                device.set(attr::CLOUD_NETWORK, network.clone());
            }
        }

        // eBPF presence
        let programs = ebpf::attached_program_names(name);
        device.set(attr::EBPF, !programs.is_empty());
        if !programs.is_empty() {
            device.set(attr::EBPF_PROGRAMS, programs.join(","));
        }

        Ok(device)
    }

    fn build_rdma_device(&self, link: &ifprobe::RdmaLink) -> Device {
        let mut device = Device::new(&link.name, DeviceKind::Rdma);
        device.set(attr::RDMA, true);
        device.set(attr::RDMA_LINK, link.name.clone());
        if let Some(guid) = &link.node_guid {
            device.set(attr::RDMA_NODE_GUID, guid.clone());
        }
        if let Some(fw) = &link.fw_version {
            device.set(attr::RDMA_FW_VERSION, fw.clone());
        }
        if !link.netdevs.is_empty() {
            device.set(attr::ALIAS, link.netdevs.join(","));
        }
        device
    }
}

fn link_name(message: &LinkMessage) -> Option<String> {
    message.attributes.iter().find_map(|attribute| match attribute {
        LinkAttribute::IfName(name) => Some(name.clone()),
        _ => None,
    })
}

/// bind a dedicated netlink socket to the link multicast group
fn subscribe_link_events()
-> Result<futures::channel::mpsc::UnboundedReceiver<(netlink_packet_core::NetlinkMessage<RouteNetlinkMessage>, netlink_sys::SocketAddr)>>
{
    let (mut connection, _handle, messages) =
        rtnetlink::new_connection().context("failed to open notification connection")?;
    let addr = netlink_sys::SocketAddr::new(0, RTMGRP_LINK);
    connection
        .socket_mut()
        .socket_mut()
        .bind(&addr)
        .context("failed to bind link multicast group")?;
    tokio::spawn(connection);
    Ok(messages)
}

/// collect the output interfaces of default routes; both families
async fn detect_uplinks(handle: &rtnetlink::Handle) -> Result<HashSet<u32>> {
    let mut uplinks = HashSet::new();

    let v4 = rtnetlink::RouteMessageBuilder::<std::net::Ipv4Addr>::new().build();
    let mut routes = handle.route().get(v4).execute();
    while let Some(message) = routes.try_next().await? {
        if let Some(oif) = default_route_oif(&message) {
            uplinks.insert(oif);
        }
    }

    let v6 = rtnetlink::RouteMessageBuilder::<std::net::Ipv6Addr>::new().build();
    let mut routes = handle.route().get(v6).execute();
    while let Some(message) = routes.try_next().await? {
        if let Some(oif) = default_route_oif(&message) {
            uplinks.insert(oif);
        }
    }

    Ok(uplinks)
}

/// the output interface of a default route (prefix length 0 with a gateway)
fn default_route_oif(message: &RouteMessage) -> Option<u32> {
    if message.header.destination_prefix_length != 0 {
        return None;
    }
    let mut gateway = false;
    let mut oif = None;
    for attribute in &message.attributes {
        match attribute {
            RouteAttribute::Gateway(RouteAddress::Inet(_))
            | RouteAttribute::Gateway(RouteAddress::Inet6(_)) => gateway = true,
            RouteAttribute::Oif(index) => oif = Some(*index),
            _ => {}
        }
    }
    if gateway { oif } else { None }
}

/// whether an address should appear in the published attributes
fn is_global_unicast(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            !v4.is_loopback()
                && !v4.is_link_local()
                && !v4.is_multicast()
                && !v4.is_broadcast()
                && !v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            !v6.is_loopback()
                && !v6.is_multicast()
                && !v6.is_unspecified()
                && (v6.segments()[0] & 0xffc0) != 0xfe80
        }
    }
}

async fn collect_addresses(
    handle: &rtnetlink::Handle,
    index: u32,
) -> Result<(Vec<String>, Vec<String>)> {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();

    let mut addresses = handle
        .address()
        .get()
        .set_link_index_filter(index)
        .execute();
    while let Some(message) = addresses.try_next().await? {
        let prefix = message.header.prefix_len;
        for attribute in &message.attributes {
            if let AddressAttribute::Address(addr) = attribute {
                if !is_global_unicast(addr) {
                    continue;
                }
                match addr {
                    IpAddr::V4(_) => v4.push(format!("{}/{}", addr, prefix)),
                    IpAddr::V6(_) => v6.push(format!("{}/{}", addr, prefix)),
                }
            }
        }
    }

    Ok((v4, v6))
}

/// Read the current global, permanent addresses of a host interface. The
/// prepare path carries these into the pod when the user supplied none;
/// kernel-managed temporary addresses stay behind.
pub async fn current_addresses(
    handle: &rtnetlink::Handle,
    ifname: &str,
) -> Result<Vec<ipnet::IpNet>> {
    use netlink_packet_route::address::AddressHeaderFlags;

    let Some(link) = crate::engine::find_link(handle, ifname).await? else {
        return Ok(Vec::new());
    };

    let mut parsed = Vec::new();
    let mut addresses = handle
        .address()
        .get()
        .set_link_index_filter(link.header.index)
        .execute();
    while let Some(message) = addresses.try_next().await? {
        if !message.header.flags.contains(AddressHeaderFlags::Permanent) {
            continue;
        }
        let prefix = message.header.prefix_len;
        for attribute in &message.attributes {
            if let AddressAttribute::Address(addr) = attribute {
                if !is_global_unicast(addr) {
                    continue;
                }
                if let Ok(net) = ipnet::IpNet::new(*addr, prefix) {
                    parsed.push(net);
                }
            }
        }
    }
    Ok(parsed)
}

/// Enumerate the outgoing routes of a host interface for carry-over:
/// destination-less routes and IPv6 link-local noise are dropped.
pub async fn current_routes(
    handle: &rtnetlink::Handle,
    ifname: &str,
) -> Result<Vec<crate::config::Route>> {
    use crate::config::{Route, RouteScope};

    let Some(link) = crate::engine::find_link(handle, ifname).await? else {
        return Ok(Vec::new());
    };
    let index = link.header.index;

    let mut carried = Vec::new();

    for family in [true, false] {
        let request = if family {
            rtnetlink::RouteMessageBuilder::<std::net::Ipv4Addr>::new().build()
        } else {
            rtnetlink::RouteMessageBuilder::<std::net::Ipv6Addr>::new().build()
        };
        let mut routes = handle.route().get(request).execute();
        while let Some(message) = routes.try_next().await? {
            let mut oif = None;
            let mut destination = None;
            let mut gateway = None;
            let mut source = None;
            for attribute in &message.attributes {
                match attribute {
                    RouteAttribute::Oif(i) => oif = Some(*i),
                    RouteAttribute::Destination(addr) => destination = route_addr(addr),
                    RouteAttribute::Gateway(addr) => gateway = route_addr(addr),
                    RouteAttribute::PrefSource(addr) => source = route_addr(addr),
                    _ => {}
                }
            }
            if oif != Some(index) {
                continue;
            }
            // routes without a destination are covered by the default-route
            // handling elsewhere; IPv6 link-local routes are kernel noise
            let Some(destination) = destination else {
                continue;
            };
            if let IpAddr::V6(v6) = destination {
                if (v6.segments()[0] & 0xffc0) == 0xfe80 {
                    continue;
                }
            }
            let Ok(destination) = ipnet::IpNet::new(
                destination,
                message.header.destination_prefix_length,
            ) else {
                continue;
            };
            let scope = if message.header.scope == netlink_packet_route::route::RouteScope::Link {
                RouteScope::Link
            } else {
                RouteScope::Universe
            };
            carried.push(Route {
                destination,
                gateway,
                source,
                scope,
            });
        }
    }

    Ok(carried)
}

fn route_addr(addr: &RouteAddress) -> Option<IpAddr> {
    match addr {
        RouteAddress::Inet(v4) => Some(IpAddr::V4(*v4)),
        RouteAddress::Inet6(v6) => Some(IpAddr::V6(*v6)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::AttrValue;

    fn link(name: &str, index: u32, flags: LinkFlags) -> LinkMessage {
        let mut message = LinkMessage::default();
        message.header.index = index;
        message.header.flags = flags;
        message
            .attributes
            .push(LinkAttribute::IfName(name.to_string()));
        message
    }

    fn inventory() -> Inventory {
        Inventory::new(HashMap::new())
    }

    #[test]
    fn test_loopback_skipped() {
        let inv = inventory();
        let message = link("lo", 1, LinkFlags::Loopback);
        assert!(!inv.should_expose("lo", &message, &HashSet::new()));
    }

    #[test]
    fn test_uplink_skipped() {
        let inv = inventory();
        let message = link("eth0", 2, LinkFlags::Up);
        let uplinks = HashSet::from([2u32]);
        assert!(!inv.should_expose("eth0", &message, &uplinks));
        assert!(inv.should_expose("eth0", &message, &HashSet::new()));
    }

    #[test]
    fn test_deny_list_and_virtual_prefixes() {
        let inv = inventory();
        let uplinks = HashSet::new();
        for name in ["cni0", "docker0", "veth12ab", "cali0123", "cilium_host"] {
            let message = link(name, 5, LinkFlags::Up);
            assert!(!inv.should_expose(name, &message, &uplinks), "{}", name);
        }
        let message = link("enp3s0f1", 5, LinkFlags::Up);
        assert!(inv.should_expose("enp3s0f1", &message, &uplinks));
    }

    #[test]
    fn test_global_unicast_filter() {
        assert!(is_global_unicast(&"192.0.2.5".parse().unwrap()));
        assert!(is_global_unicast(&"2001:db8::1".parse().unwrap()));
        assert!(!is_global_unicast(&"127.0.0.1".parse().unwrap()));
        assert!(!is_global_unicast(&"169.254.1.1".parse().unwrap()));
        assert!(!is_global_unicast(&"fe80::1".parse().unwrap()));
        assert!(!is_global_unicast(&"ff02::1".parse().unwrap()));
        assert!(!is_global_unicast(&"0.0.0.0".parse().unwrap()));
    }

    #[test]
    fn test_default_route_oif() {
        let mut message = RouteMessage::default();
        message.header.destination_prefix_length = 0;
        message
            .attributes
            .push(RouteAttribute::Gateway(RouteAddress::Inet(
                "192.0.2.1".parse().unwrap(),
            )));
        message.attributes.push(RouteAttribute::Oif(3));
        assert_eq!(default_route_oif(&message), Some(3));

        // a non-default route is not an uplink marker
        message.header.destination_prefix_length = 24;
        assert_eq!(default_route_oif(&message), None);
    }

    #[test]
    fn test_rdma_device_attributes() {
        let inv = inventory();
        let link = ifprobe::RdmaLink {
            name: "mlx5_0".to_string(),
            node_guid: Some("0c42:a103:0065:2b8a".to_string()),
            fw_version: Some("20.31.1014".to_string()),
            netdevs: vec!["eth1".to_string()],
        };
        let device = inv.build_rdma_device(&link);
        assert_eq!(device.kind, DeviceKind::Rdma);
        assert!(device.name.starts_with("normalized-"));
        assert_eq!(device.kernel_name(), Some("mlx5_0"));
        assert_eq!(
            device.attributes.get(attr::RDMA_NODE_GUID),
            Some(&AttrValue::String("0c42:a103:0065:2b8a".to_string()))
        );
    }
}
