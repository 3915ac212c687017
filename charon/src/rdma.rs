//! RDMA subsystem netlink client.
//!
//! Three operations against NETLINK_RDMA: read the global network-namespace
//! mode, enumerate links, and assign a link to a namespace. The namespace
//! mode is a boot-scoped kernel policy: in *shared* mode RDMA links are
//! visible everywhere and cannot be moved, so the agent reads the mode once
//! at startup and both the publisher and the transfer engine consult the
//! cached value.

use std::collections::HashMap;
use std::os::fd::RawFd;

use anyhow::{Context, Result, bail};
use netlink_packet_core::{
    DecodeError, NetlinkDeserializable, NetlinkHeader, NetlinkSerializable,
};
use netlink_packet_utils::nla::{DefaultNla, Nla, NlasIterator};
use netlink_packet_utils::parsers::{parse_string, parse_u8, parse_u32};
use netlink_packet_utils::Emitable as _;
use netlink_packet_utils::Parseable as _;
use netlink_sys::protocols::NETLINK_RDMA;
use tracing::info;

use crate::netlink;

/// netlink client index of the nldev subsystem
const RDMA_NL_NLDEV: u16 = 5;

/// nldev commands
const RDMA_NLDEV_CMD_GET: u8 = 1;
const RDMA_NLDEV_CMD_SET: u8 = 2;
const RDMA_NLDEV_CMD_SYS_GET: u8 = 6;

/// nldev attributes
const RDMA_NLDEV_ATTR_DEV_INDEX: u16 = 1;
const RDMA_NLDEV_ATTR_DEV_NAME: u16 = 2;
const RDMA_NLDEV_SYS_ATTR_NETNS_MODE: u16 = 66;
const RDMA_NLDEV_NET_NS_FD: u16 = 68;

/// the kernel's global RDMA namespace policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdmaNetnsMode {
    /// links are visible in every namespace and cannot be reassigned
    Shared,
    /// links belong to exactly one namespace and can be moved
    Exclusive,
}

impl RdmaNetnsMode {
    pub fn is_exclusive(self) -> bool {
        matches!(self, RdmaNetnsMode::Exclusive)
    }
}

/// an nldev message: command plus flat attribute list
#[derive(Debug, Clone)]
struct NldevMessage {
    op: u8,
    attributes: Vec<DefaultNla>,
}

impl NldevMessage {
    fn new(op: u8) -> Self {
        NldevMessage {
            op,
            attributes: Vec::new(),
        }
    }

    fn with_u32(mut self, kind: u16, value: u32) -> Self {
        self.attributes
            .push(DefaultNla::new(kind, value.to_ne_bytes().to_vec()));
        self
    }

    fn u32_attr(&self, kind: u16) -> Option<u32> {
        self.attributes
            .iter()
            .find(|nla| nla.kind() == kind)
            .and_then(|nla| {
                let mut value = vec![0u8; nla.value_len()];
                nla.emit_value(&mut value);
                parse_u32(&value).ok()
            })
    }

    fn u8_attr(&self, kind: u16) -> Option<u8> {
        self.attributes
            .iter()
            .find(|nla| nla.kind() == kind)
            .and_then(|nla| {
                let mut value = vec![0u8; nla.value_len()];
                nla.emit_value(&mut value);
                parse_u8(&value).ok()
            })
    }

    fn string_attr(&self, kind: u16) -> Option<String> {
        self.attributes
            .iter()
            .find(|nla| nla.kind() == kind)
            .and_then(|nla| {
                let mut value = vec![0u8; nla.value_len()];
                nla.emit_value(&mut value);
                parse_string(&value).ok()
            })
            .map(|s| s.trim_end_matches('\0').to_string())
    }
}

impl NetlinkSerializable for NldevMessage {
    fn message_type(&self) -> u16 {
        (RDMA_NL_NLDEV << 8) | self.op as u16
    }

    fn buffer_len(&self) -> usize {
        self.attributes.as_slice().buffer_len()
    }

    fn serialize(&self, buffer: &mut [u8]) {
        self.attributes.as_slice().emit(buffer);
    }
}

impl NetlinkDeserializable for NldevMessage {
    type Error = DecodeError;

    fn deserialize(header: &NetlinkHeader, payload: &[u8]) -> Result<Self, Self::Error> {
        let mut attributes = Vec::new();
        for nla in NlasIterator::new(payload) {
            let nla = nla.map_err(|e| DecodeError::from(e.to_string()))?;
            attributes
                .push(DefaultNla::parse(&nla).map_err(|e| DecodeError::from(e.to_string()))?);
        }
        Ok(NldevMessage {
            op: (header.message_type & 0xff) as u8,
            attributes,
        })
    }
}

/// Read the global namespace mode. Called once at startup.
pub fn query_netns_mode() -> Result<RdmaNetnsMode> {
    let replies = netlink::request(
        NETLINK_RDMA,
        NldevMessage::new(RDMA_NLDEV_CMD_SYS_GET),
        false,
    )
    .context("failed to query RDMA namespace mode")?;

    let mode = replies
        .iter()
        .find_map(|msg| msg.u8_attr(RDMA_NLDEV_SYS_ATTR_NETNS_MODE))
        .context("RDMA namespace mode missing from reply")?;

    let mode = if mode == 0 {
        RdmaNetnsMode::Shared
    } else {
        RdmaNetnsMode::Exclusive
    };
    info!("RDMA namespace mode: {:?}", mode);
    Ok(mode)
}

/// Enumerate RDMA links as a name -> device index map.
pub fn list_links() -> Result<HashMap<String, u32>> {
    let replies = netlink::request(NETLINK_RDMA, NldevMessage::new(RDMA_NLDEV_CMD_GET), true)
        .context("failed to enumerate RDMA links")?;

    let mut links = HashMap::new();
    for msg in replies {
        if let (Some(name), Some(index)) = (
            msg.string_attr(RDMA_NLDEV_ATTR_DEV_NAME),
            msg.u32_attr(RDMA_NLDEV_ATTR_DEV_INDEX),
        ) {
            links.insert(name, index);
        }
    }
    Ok(links)
}

/// Move one RDMA link into the namespace behind `netns_fd`.
///
/// Only valid in exclusive mode; the kernel rejects the operation in shared
/// mode and the engine never calls it there. Unlike the netdev transfer
/// there is no rename/MTU bundling: the single SET carries only the device
/// index and the namespace fd.
pub fn set_link_netns(link_name: &str, netns_fd: RawFd) -> Result<()> {
    let links = list_links()?;
    let Some(&index) = links.get(link_name) else {
        bail!("RDMA link {} not found", link_name);
    };

    let message = NldevMessage::new(RDMA_NLDEV_CMD_SET)
        .with_u32(RDMA_NLDEV_ATTR_DEV_INDEX, index)
        .with_u32(RDMA_NLDEV_NET_NS_FD, netns_fd as u32);

    netlink::request(NETLINK_RDMA, message, false)
        .with_context(|| format!("failed to move RDMA link {} to namespace", link_name))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_encodes_client_and_op() {
        let msg = NldevMessage::new(RDMA_NLDEV_CMD_SYS_GET);
        assert_eq!(msg.message_type(), (5 << 8) | 6);
    }

    #[test]
    fn test_attribute_round_trip() {
        let msg = NldevMessage::new(RDMA_NLDEV_CMD_SET)
            .with_u32(RDMA_NLDEV_ATTR_DEV_INDEX, 3)
            .with_u32(RDMA_NLDEV_NET_NS_FD, 17);

        let mut buf = vec![0u8; msg.buffer_len()];
        msg.serialize(&mut buf);

        let mut header = NetlinkHeader::default();
        header.message_type = msg.message_type();
        let parsed = NldevMessage::deserialize(&header, &buf).unwrap();
        assert_eq!(parsed.op, RDMA_NLDEV_CMD_SET);
        assert_eq!(parsed.u32_attr(RDMA_NLDEV_ATTR_DEV_INDEX), Some(3));
        assert_eq!(parsed.u32_attr(RDMA_NLDEV_NET_NS_FD), Some(17));
    }

    #[test]
    fn test_string_attr_strips_nul() {
        let name = b"mlx5_0\0".to_vec();
        let msg = NldevMessage {
            op: RDMA_NLDEV_CMD_GET,
            attributes: vec![DefaultNla::new(RDMA_NLDEV_ATTR_DEV_NAME, name)],
        };
        assert_eq!(msg.string_attr(RDMA_NLDEV_ATTR_DEV_NAME).as_deref(), Some("mlx5_0"));
    }
}
