//! The namespace-transfer engine.
//!
//! Moving a netdev between namespaces leans on three kernel facts: a rename
//! is only accepted while the link is down; a single SETLINK can carry the
//! new name, MTU, hardware address, segmentation-offload sizes and the
//! target-namespace fd at once; and addresses do not survive the move, so
//! they are re-applied through a netlink handle opened inside the target
//! namespace. The original kernel name rides along in the link alias so the
//! detach path can restore it without any state of its own.

use std::path::Path;

use anyhow::{Context, Result, bail};
use futures::TryStreamExt;
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use rtnetlink::{Handle, LinkMessageBuilder, LinkUnspec};
use tracing::{debug, info};

use crate::config::PodConfig;
use crate::netns::{self, NetnsHandle};

/// what the runtime reports back about an attached interface
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkDeviceData {
    pub interface_name: String,
    pub hardware_address: String,
    pub ips: Vec<String>,
}

/// the attach outcome, keeping the in-namespace handle alive for the
/// follow-up route installation
pub struct Attachment {
    pub data: NetworkDeviceData,
    pub ns_handle: Handle,
    pub ifindex: u32,
}

/// format a MAC address from raw bytes
pub fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn raw_code(err: &rtnetlink::Error) -> Option<i32> {
    match err {
        rtnetlink::Error::NetlinkError(e) => Some(e.raw_code()),
        _ => None,
    }
}

fn is_dump_interrupted(err: &rtnetlink::Error) -> bool {
    raw_code(err) == Some(-libc::EINTR)
}

/// look up a link by name, mapping "no such device" to None
pub async fn find_link(handle: &Handle, name: &str) -> Result<Option<LinkMessage>> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(link) => Ok(link),
        Err(err) if raw_code(&err) == Some(-libc::ENODEV) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to look up link {}", name)),
    }
}

fn link_attr_string(message: &LinkMessage, pick: impl Fn(&LinkAttribute) -> Option<&String>) -> Option<String> {
    message.attributes.iter().find_map(|attr| pick(attr).cloned())
}

fn link_mac(message: &LinkMessage) -> Option<String> {
    message.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::Address(bytes) => Some(format_mac(bytes)),
        _ => None,
    })
}

async fn set_admin_state(handle: &Handle, index: u32, up: bool) -> Result<(), rtnetlink::Error> {
    let builder = LinkMessageBuilder::<LinkUnspec>::new().index(index);
    let message = if up { builder.up() } else { builder.down() }.build();
    handle.link().set(message).execute().await
}

/// execute a SETLINK, retrying once on an interrupted dump
async fn set_link(handle: &Handle, message: LinkMessage) -> Result<(), rtnetlink::Error> {
    match handle.link().set(message.clone()).execute().await {
        Err(err) if is_dump_interrupted(&err) => handle.link().set(message).execute().await,
        other => other,
    }
}

/// Move the device described by `config` from the host into the namespace at
/// `netns_path`, applying the link-level configuration on the way.
///
/// Idempotent: when the host no longer has the device but the target
/// namespace holds a link under the expected name, the attach reports that
/// link instead of failing, so runtime retries converge.
pub async fn attach(
    host: &Handle,
    netns_path: &Path,
    config: &PodConfig,
) -> Result<Attachment> {
    let target_name = config
        .interface
        .name
        .clone()
        .unwrap_or_else(|| config.kernel_name.clone());

    let Some(host_link) = find_link(host, &config.kernel_name).await? else {
        // retry path: the link may already live inside the pod namespace,
        // possibly with an earlier attempt interrupted before the addresses
        // landed; re-apply them and re-assert the admin state so retries
        // converge on the configured end state
        let ns_handle = netns::rtnetlink_in(netns_path).await?;
        if let Some(existing) = find_link(&ns_handle, &target_name).await? {
            info!(
                "device {} already attached as {} in {}",
                config.kernel_name,
                target_name,
                netns_path.display()
            );
            let ifindex = existing.header.index;
            ensure_addresses(&ns_handle, ifindex, &config.interface.addresses, &target_name)
                .await?;
            set_admin_state(&ns_handle, ifindex, true)
                .await
                .with_context(|| format!("failed to set {} up", target_name))?;
            let data = device_data(&ns_handle, &existing, &target_name).await?;
            return Ok(Attachment {
                data,
                ns_handle,
                ifindex,
            });
        }
        bail!(
            "device {} not found on the host or in {}",
            config.kernel_name,
            netns_path.display()
        );
    };
    let host_index = host_link.header.index;

    // a rename is only honored while the link is down
    set_admin_state(host, host_index, false)
        .await
        .with_context(|| format!("failed to set {} down", config.kernel_name))?;

    let netns = NetnsHandle::open(netns_path)?;

    // one atomic SETLINK: identity, link attributes and the namespace move
    let mut message = LinkMessageBuilder::<LinkUnspec>::new()
        .index(host_index)
        .build();
    message
        .attributes
        .push(LinkAttribute::IfName(target_name.clone()));
    if let Some(mtu) = config.interface.mtu {
        message.attributes.push(LinkAttribute::Mtu(mtu));
    }
    if let Some(mac) = &config.interface.hardware_addr {
        message.attributes.push(LinkAttribute::Address(mac.clone()));
    }
    if let Some(size) = config.interface.gso_max_size {
        message.attributes.push(LinkAttribute::GsoMaxSize(size));
    }
    if let Some(size) = config.interface.gro_max_size {
        message.attributes.push(LinkAttribute::GroMaxSize(size));
    }
    if let Some(size) = config.interface.gso_ipv4_max_size {
        message.attributes.push(LinkAttribute::GsoIpv4MaxSize(size));
    }
    if let Some(size) = config.interface.gro_ipv4_max_size {
        message.attributes.push(LinkAttribute::GroIpv4MaxSize(size));
    }
    // stash the original name so detach can restore it
    message
        .attributes
        .push(LinkAttribute::IfAlias(config.kernel_name.clone()));
    message
        .attributes
        .push(LinkAttribute::NetNsFd(netns.raw_fd()));

    set_link(host, message).await.with_context(|| {
        format!(
            "failed to move {} into {}",
            config.kernel_name,
            netns_path.display()
        )
    })?;
    drop(netns);

    // the move invalidated everything index-based; re-resolve inside the pod
    let ns_handle = netns::rtnetlink_in(netns_path).await?;
    let ns_link = find_link(&ns_handle, &target_name)
        .await?
        .with_context(|| format!("link {} missing after namespace move", target_name))?;
    let ifindex = ns_link.header.index;

    let ips = ensure_addresses(&ns_handle, ifindex, &config.interface.addresses, &target_name)
        .await?;

    set_admin_state(&ns_handle, ifindex, true)
        .await
        .with_context(|| format!("failed to set {} up", target_name))?;

    info!(
        "attached {} as {} in {}",
        config.kernel_name,
        target_name,
        netns_path.display()
    );

    Ok(Attachment {
        data: NetworkDeviceData {
            interface_name: target_name,
            hardware_address: link_mac(&ns_link).unwrap_or_default(),
            ips,
        },
        ns_handle,
        ifindex,
    })
}

/// add the configured addresses to a link, treating duplicates as success
async fn ensure_addresses(
    ns_handle: &Handle,
    ifindex: u32,
    addresses: &[ipnet::IpNet],
    name: &str,
) -> Result<Vec<String>> {
    let mut ips = Vec::new();
    for address in addresses {
        match ns_handle
            .address()
            .add(ifindex, address.addr(), address.prefix_len())
            .execute()
            .await
        {
            Ok(()) => {}
            Err(err) if raw_code(&err) == Some(-libc::EEXIST) => {
                debug!("address {} already on {}", address, name);
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to add address {} to {}", address, name));
            }
        }
        ips.push(address.to_string());
    }
    Ok(ips)
}

/// report the state of an already-attached link
async fn device_data(
    ns_handle: &Handle,
    link: &LinkMessage,
    name: &str,
) -> Result<NetworkDeviceData> {
    let mut ips = Vec::new();
    let mut addresses = ns_handle
        .address()
        .get()
        .set_link_index_filter(link.header.index)
        .execute();
    while let Some(message) = addresses.try_next().await? {
        let prefix = message.header.prefix_len;
        for attr in &message.attributes {
            if let netlink_packet_route::address::AddressAttribute::Address(ip) = attr {
                ips.push(format!("{}/{}", ip, prefix));
            }
        }
    }
    Ok(NetworkDeviceData {
        interface_name: name.to_string(),
        hardware_address: link_mac(link).unwrap_or_default(),
        ips,
    })
}

/// Move the named device out of the pod namespace back to the host,
/// restoring the original kernel name recorded in the alias and bringing
/// the link up again on the host side.
pub async fn detach(netns_path: &Path, ifname: &str, host: &Handle) -> Result<()> {
    let ns_handle = netns::rtnetlink_in(netns_path).await?;
    let Some(link) = find_link(&ns_handle, ifname).await? else {
        // the namespace may already be torn down, nothing to restore
        debug!("link {} gone from {}", ifname, netns_path.display());
        return Ok(());
    };
    let index = link.header.index;

    set_admin_state(&ns_handle, index, false)
        .await
        .with_context(|| format!("failed to set {} down in pod namespace", ifname))?;

    let original_name = link_attr_string(&link, |attr| match attr {
        LinkAttribute::IfAlias(alias) if !alias.is_empty() => Some(alias),
        _ => None,
    })
    .unwrap_or_else(|| ifname.to_string());

    // the socket lives in the pod namespace; the kernel accepts a SETLINK
    // whose namespace fd points back at the root namespace
    let root = NetnsHandle::current()?;
    let mut message = LinkMessageBuilder::<LinkUnspec>::new().index(index).build();
    message
        .attributes
        .push(LinkAttribute::IfName(original_name.clone()));
    message.attributes.push(LinkAttribute::NetNsFd(root.raw_fd()));

    set_link(&ns_handle, message).await.with_context(|| {
        format!(
            "failed to move {} back to the host namespace",
            original_name
        )
    })?;
    drop(root);

    // host workloads may depend on the uplink being administratively up
    let restored = find_link(host, &original_name)
        .await?
        .with_context(|| format!("link {} missing after restore", original_name))?;
    set_admin_state(host, restored.header.index, true)
        .await
        .with_context(|| format!("failed to set {} up on the host", original_name))?;

    info!("detached {} from {}", original_name, netns_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_mac() {
        assert_eq!(
            format_mac(&[0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x22]),
            "aa:bb:cc:00:11:22"
        );
    }

    #[test]
    fn test_link_mac_extraction() {
        let mut message = LinkMessage::default();
        message
            .attributes
            .push(LinkAttribute::Address(vec![0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]));
        assert_eq!(link_mac(&message).as_deref(), Some("de:ad:be:ef:00:01"));
    }

    #[test]
    fn test_alias_lookup_skips_empty() {
        let mut message = LinkMessage::default();
        message.attributes.push(LinkAttribute::IfAlias(String::new()));
        let alias = link_attr_string(&message, |attr| match attr {
            LinkAttribute::IfAlias(alias) if !alias.is_empty() => Some(alias),
            _ => None,
        });
        assert_eq!(alias, None);

        message
            .attributes
            .push(LinkAttribute::IfAlias("dummy0".to_string()));
        let alias = link_attr_string(&message, |attr| match attr {
            LinkAttribute::IfAlias(alias) if !alias.is_empty() => Some(alias),
            _ => None,
        });
        assert_eq!(alias.as_deref(), Some("dummy0"));
    }
}
