//! The device model published to the scheduler.
//!
//! A `Device` is a point-in-time record of one host interface or RDMA link:
//! a DNS-label-safe name, a kind, and a flat attribute map. Records are
//! rebuilt from scratch on every inventory refresh and never persisted.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::resource::v1beta1::DeviceAttribute;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// qualified attribute keys, stable across releases
pub mod attr {
    pub const KERNEL_NAME: &str = "charon.dev/ifName";
    pub const KIND: &str = "charon.dev/kind";
    pub const LINK_TYPE: &str = "charon.dev/type";
    pub const ENCAP: &str = "charon.dev/encapsulation";
    pub const STATE: &str = "charon.dev/state";
    pub const ALIAS: &str = "charon.dev/alias";
    pub const MAC: &str = "charon.dev/mac";
    pub const MTU: &str = "charon.dev/mtu";
    pub const IPV4: &str = "charon.dev/ipv4";
    pub const IPV6: &str = "charon.dev/ipv6";
    pub const VIRTUAL: &str = "charon.dev/virtual";
    pub const SRIOV: &str = "charon.dev/sriov";
    pub const SRIOV_VFS: &str = "charon.dev/sriovVfs";
    pub const NUMA_NODE: &str = "charon.dev/numaNode";
    pub const PCI_DOMAIN: &str = "charon.dev/pcieDomain";
    pub const PCI_BUS: &str = "charon.dev/pcieBus";
    pub const PCI_DEVICE: &str = "charon.dev/pcieDevice";
    pub const PCI_FUNCTION: &str = "charon.dev/pcieFunction";
    pub const PCI_VENDOR: &str = "charon.dev/pcieVendor";
    pub const PCI_DEVICE_NAME: &str = "charon.dev/pcieDeviceName";
    pub const PCI_SUBSYSTEM: &str = "charon.dev/pcieSubsystem";
    pub const RDMA: &str = "charon.dev/rdma";
    pub const RDMA_LINK: &str = "charon.dev/rdmaLink";
    pub const RDMA_NODE_GUID: &str = "charon.dev/rdmaNodeGuid";
    pub const RDMA_FW_VERSION: &str = "charon.dev/rdmaFirmware";
    pub const CLOUD_NETWORK: &str = "charon.dev/cloudNetwork";
    pub const EBPF: &str = "charon.dev/ebpf";
    pub const EBPF_PROGRAMS: &str = "charon.dev/ebpfPrograms";
}

/// the closed set of device kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Network,
    Rdma,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Network => write!(f, "network"),
            DeviceKind::Rdma => write!(f, "rdma"),
        }
    }
}

/// a tagged attribute value, mirroring the DRA attribute union
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::String(s)
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::String(s.to_string())
    }
}

impl From<i64> for AttrValue {
    fn from(n: i64) -> Self {
        AttrValue::Int(n)
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::Bool(b)
    }
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// convert into the wire representation
    pub fn to_device_attribute(&self) -> DeviceAttribute {
        match self {
            AttrValue::String(s) => DeviceAttribute {
                string: Some(s.clone()),
                ..Default::default()
            },
            AttrValue::Int(n) => DeviceAttribute {
                int: Some(*n),
                ..Default::default()
            },
            AttrValue::Bool(b) => DeviceAttribute {
                bool: Some(*b),
                ..Default::default()
            },
        }
    }
}

/// one exposed device: name, kind and attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// DNS-label-safe exposure name, see [`normalize_name`]
    pub name: String,
    pub kind: DeviceKind,
    pub attributes: BTreeMap<String, AttrValue>,
}

impl Device {
    pub fn new(kernel_name: &str, kind: DeviceKind) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert(attr::KERNEL_NAME.to_string(), kernel_name.into());
        attributes.insert(attr::KIND.to_string(), kind.to_string().into());
        Device {
            name: normalize_name(kernel_name),
            kind,
            attributes,
        }
    }

    pub fn set(&mut self, key: &str, value: impl Into<AttrValue>) {
        self.attributes.insert(key.to_string(), value.into());
    }

    /// the kernel name this device was built from
    pub fn kernel_name(&self) -> Option<&str> {
        self.attributes.get(attr::KERNEL_NAME).and_then(AttrValue::as_str)
    }
}

const NORMALIZED_PREFIX: &str = "normalized-";

/// RFC 1123 label: lowercase alphanumeric with interior dashes
static DNS_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("label regex"));

/// whether a kernel interface name is already usable as a DNS label
fn is_dns_label(name: &str) -> bool {
    name.len() <= 63 && DNS_LABEL.is_match(name)
}

/// Map a kernel interface name to a DNS-label-safe exposure name.
///
/// Names that are already valid labels pass through unchanged; anything else
/// (underscores, uppercase, dots) is encoded as `normalized-` + lowercase
/// unpadded base32 of the raw bytes. A name that happens to start with the
/// prefix is always encoded so the mapping stays injective.
pub fn normalize_name(kernel_name: &str) -> String {
    if is_dns_label(kernel_name) && !kernel_name.starts_with(NORMALIZED_PREFIX) {
        return kernel_name.to_string();
    }
    let encoded = base32::encode(
        base32::Alphabet::RFC4648 { padding: false },
        kernel_name.as_bytes(),
    );
    format!("{}{}", NORMALIZED_PREFIX, encoded.to_lowercase())
}

/// Recover the kernel name from an exposure name produced by
/// [`normalize_name`]. Returns `None` when the input carries the prefix but
/// does not decode.
pub fn original_name(exposed: &str) -> Option<String> {
    let Some(encoded) = exposed.strip_prefix(NORMALIZED_PREFIX) else {
        return Some(exposed.to_string());
    };
    let bytes = base32::decode(
        base32::Alphabet::RFC4648 { padding: false },
        &encoded.to_uppercase(),
    )?;
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_name_passes_through() {
        assert_eq!(normalize_name("eth0"), "eth0");
        assert_eq!(normalize_name("enp3s0f1"), "enp3s0f1");
        assert_eq!(original_name("eth0").as_deref(), Some("eth0"));
    }

    #[test]
    fn test_underscore_name_round_trips() {
        let exposed = normalize_name("mlx5_0");
        assert!(exposed.starts_with("normalized-"));
        assert_eq!(
            exposed,
            format!(
                "normalized-{}",
                base32::encode(base32::Alphabet::RFC4648 { padding: false }, b"mlx5_0")
                    .to_lowercase()
            )
        );
        assert_eq!(original_name(&exposed).as_deref(), Some("mlx5_0"));
    }

    #[test]
    fn test_round_trip_is_total() {
        for name in ["eth0", "mlx5_0", "Tunnel.100", "a", "ib0.8002", "normalized-x"] {
            let exposed = normalize_name(name);
            assert_eq!(original_name(&exposed).as_deref(), Some(name), "{}", name);
        }
    }

    #[test]
    fn test_prefix_collision_is_encoded() {
        // a kernel name starting with the prefix must not be taken verbatim
        let exposed = normalize_name("normalized-x");
        assert_ne!(exposed, "normalized-x");
        assert_eq!(original_name(&exposed).as_deref(), Some("normalized-x"));
    }

    #[test]
    fn test_identity_iff_valid_label() {
        assert_eq!(normalize_name("valid-name"), "valid-name");
        assert_ne!(normalize_name("Invalid"), "Invalid");
        assert_ne!(normalize_name("has_underscore"), "has_underscore");
        assert_ne!(normalize_name("dot.ted"), "dot.ted");
    }

    #[test]
    fn test_bad_encoding_rejected() {
        assert_eq!(original_name("normalized-!!!"), None);
    }

    #[test]
    fn test_device_record() {
        let mut dev = Device::new("mlx5_0", DeviceKind::Rdma);
        dev.set(attr::MTU, 9000i64);
        dev.set(attr::RDMA, true);
        assert_eq!(dev.kernel_name(), Some("mlx5_0"));
        assert!(dev.name.starts_with("normalized-"));
        assert_eq!(
            dev.attributes.get(attr::MTU),
            Some(&AttrValue::Int(9000))
        );
    }

    #[test]
    fn test_attr_to_device_attribute() {
        let s = AttrValue::from("up").to_device_attribute();
        assert_eq!(s.string.as_deref(), Some("up"));
        let n = AttrValue::from(1500i64).to_device_attribute();
        assert_eq!(n.int, Some(1500));
        let b = AttrValue::from(true).to_device_attribute();
        assert_eq!(b.bool, Some(true));
    }
}
