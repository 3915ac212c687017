//! Opaque claim-configuration payload and the prepared per-pod config.
//!
//! The payload arrives from the scheduler as the `parameters` of an opaque
//! device configuration. Parsing is strict: unknown fields are rejected so a
//! typo never silently becomes a no-op.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::ethtool::EthtoolPlan;

/// maximum kernel interface name length (IFNAMSIZ - 1)
pub const MAX_IFNAME_LEN: usize = 15;

/// minimum MTU the kernel accepts for IPv4
pub const MIN_MTU: u32 = 68;

/// route scope, restricted to the two values the payload may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum RouteScope {
    #[default]
    Universe,
    Link,
}

impl RouteScope {
    pub fn as_u8(self) -> u8 {
        match self {
            RouteScope::Universe => 0,
            RouteScope::Link => 253,
        }
    }
}

impl TryFrom<u8> for RouteScope {
    type Error = String;
    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        match v {
            0 => Ok(RouteScope::Universe),
            253 => Ok(RouteScope::Link),
            other => Err(format!("invalid route scope {} (expected 0 or 253)", other)),
        }
    }
}

impl From<RouteScope> for u8 {
    fn from(s: RouteScope) -> u8 {
        s.as_u8()
    }
}

/// wire format of the opaque configuration payload
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ClaimConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<InterfaceConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ethtool: Option<EthtoolConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct InterfaceConfig {
    /// rename target inside the pod namespace; kernel name kept if omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gso_max_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gro_max_size: Option<u32>,
    #[serde(
        default,
        rename = "gsoIPv4MaxSize",
        skip_serializing_if = "Option::is_none"
    )]
    pub gso_ipv4_max_size: Option<u32>,
    #[serde(
        default,
        rename = "groIPv4MaxSize",
        skip_serializing_if = "Option::is_none"
    )]
    pub gro_ipv4_max_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhcp: Option<bool>,
    #[serde(
        default,
        rename = "disableEBPFPrograms",
        skip_serializing_if = "Option::is_none"
    )]
    pub disable_ebpf_programs: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RouteConfig {
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub scope: RouteScope,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct EthtoolConfig {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub features: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub private_flags: BTreeMap<String, bool>,
}

impl ClaimConfig {
    /// Parse and validate a raw payload, rejecting unknown fields.
    pub fn parse(raw: &serde_json::Value) -> Result<Self> {
        let config: ClaimConfig =
            serde_json::from_value(raw.clone()).context("invalid claim configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the whole payload, collecting every violation.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if let Some(iface) = &self.interface {
            if let Some(name) = &iface.name {
                if let Err(err) = validate_interface_name(name) {
                    errors.push(err.to_string());
                }
            }
            if let Some(mtu) = iface.mtu {
                if mtu < MIN_MTU {
                    errors.push(format!("mtu {} below minimum {}", mtu, MIN_MTU));
                }
            }
            if let Some(mac) = &iface.hardware_addr {
                if let Err(err) = parse_mac(mac) {
                    errors.push(err.to_string());
                }
            }
            for addr in &iface.addresses {
                if let Err(err) = parse_cidr(addr) {
                    errors.push(err.to_string());
                }
            }
            if iface.dhcp.unwrap_or(false) && !iface.addresses.is_empty() {
                errors.push("dhcp and explicit addresses are mutually exclusive".to_string());
            }
        }

        for route in &self.routes {
            if let Err(err) = route.parsed() {
                errors.push(err.to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!("{}", errors.join("; "))
        }
    }
}

impl RouteConfig {
    /// Parse the string fields into a typed route, enforcing the
    /// gateway-for-universe-scope rule.
    pub fn parsed(&self) -> Result<Route> {
        let destination = parse_cidr(&self.destination)?;
        let gateway = self
            .gateway
            .as_deref()
            .map(|g| {
                IpAddr::from_str(g).with_context(|| format!("invalid route gateway {:?}", g))
            })
            .transpose()?;
        let source = self
            .source
            .as_deref()
            .map(|s| IpAddr::from_str(s).with_context(|| format!("invalid route source {:?}", s)))
            .transpose()?;

        if self.scope == RouteScope::Universe && gateway.is_none() {
            bail!(
                "route to {} has universe scope but no gateway",
                self.destination
            );
        }

        Ok(Route {
            destination,
            gateway,
            source,
            scope: self.scope,
        })
    }
}

/// a fully parsed route, ready for the applier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub destination: IpNet,
    pub gateway: Option<IpAddr>,
    pub source: Option<IpAddr>,
    pub scope: RouteScope,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(gw) = self.gateway {
            write!(f, " via {}", gw)?;
        }
        write!(f, " scope {}", self.scope.as_u8())
    }
}

/// parse a destination that may be a CIDR or a bare address
pub fn parse_cidr(s: &str) -> Result<IpNet> {
    if let Ok(net) = IpNet::from_str(s) {
        return Ok(net);
    }
    let addr = IpAddr::from_str(s).with_context(|| format!("invalid CIDR or IP {:?}", s))?;
    let prefix = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    IpNet::new(addr, prefix).with_context(|| format!("invalid CIDR {:?}", s))
}

/// parse a colon-separated MAC address into raw bytes
pub fn parse_mac(s: &str) -> Result<Vec<u8>> {
    let bytes: Vec<u8> = s
        .split(':')
        .map(|part| u8::from_str_radix(part, 16))
        .collect::<std::result::Result<_, _>>()
        .with_context(|| format!("invalid hardware address {:?}", s))?;
    if bytes.len() != 6 && bytes.len() != 8 && bytes.len() != 20 {
        bail!("invalid hardware address length in {:?}", s);
    }
    Ok(bytes)
}

/// kernel interface-name constraints
pub fn validate_interface_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("interface name is empty");
    }
    if name.len() > MAX_IFNAME_LEN {
        bail!(
            "interface name {:?} longer than {} bytes",
            name,
            MAX_IFNAME_LEN
        );
    }
    if name == "." || name == ".." {
        bail!("interface name {:?} is reserved", name);
    }
    for c in name.chars() {
        if c == '/' || c.is_whitespace() {
            bail!("interface name {:?} contains {:?}", name, c);
        }
        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' && c != '.' {
            bail!("interface name {:?} contains invalid character {:?}", name, c);
        }
    }
    Ok(())
}

/// claim identity a prepared config belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRef {
    pub uid: String,
    pub name: String,
    pub namespace: String,
}

/// link-level settings resolved at prepare time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterfaceSpec {
    pub name: Option<String>,
    pub addresses: Vec<IpNet>,
    pub mtu: Option<u32>,
    pub hardware_addr: Option<Vec<u8>>,
    pub gso_max_size: Option<u32>,
    pub gro_max_size: Option<u32>,
    pub gso_ipv4_max_size: Option<u32>,
    pub gro_ipv4_max_size: Option<u32>,
    pub disable_ebpf_programs: bool,
}

/// RDMA association of a prepared device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdmaSpec {
    pub link_name: String,
    pub char_devs: Vec<CharDevSpec>,
}

/// a char device to inject into the container
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CharDevSpec {
    pub path: String,
    pub dev_type: String,
    pub major: u32,
    pub minor: u32,
}

/// The post-validation, post-enrichment configuration for one (pod, device)
/// pair. Everything the sandbox hot path needs is already resolved here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodConfig {
    pub claim: ClaimRef,
    /// kernel name of the device on the host
    pub kernel_name: String,
    /// exposure name the claim allocated
    pub device_name: String,
    pub interface: InterfaceSpec,
    pub routes: Vec<Route>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ethtool: Option<EthtoolPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rdma: Option<RdmaSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_minimal() {
        let config = ClaimConfig::parse(&json!({})).unwrap();
        assert!(config.interface.is_none());
        assert!(config.routes.is_empty());
    }

    #[test]
    fn test_parse_full() {
        let config = ClaimConfig::parse(&json!({
            "interface": {
                "name": "net0",
                "addresses": ["192.0.2.5/24"],
                "mtu": 4321,
                "hardwareAddr": "aa:bb:cc:dd:ee:ff",
                "gsoMaxSize": 65536,
                "gsoIPv4MaxSize": 65536,
                "dhcp": false,
                "disableEBPFPrograms": true
            },
            "routes": [
                {"destination": "10.0.0.0/24", "gateway": "10.0.0.1", "scope": 0},
                {"destination": "10.0.0.1/32", "scope": 253}
            ],
            "ethtool": {
                "features": {"tso": false},
                "privateFlags": {"sniffer": true}
            }
        }))
        .unwrap();
        let iface = config.interface.unwrap();
        assert_eq!(iface.name.as_deref(), Some("net0"));
        assert_eq!(iface.mtu, Some(4321));
        assert_eq!(iface.gso_ipv4_max_size, Some(65536));
        assert!(iface.disable_ebpf_programs.unwrap());
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.routes[1].scope, RouteScope::Link);
        assert_eq!(config.ethtool.unwrap().features.get("tso"), Some(&false));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(ClaimConfig::parse(&json!({"interfaces": {}})).is_err());
        assert!(ClaimConfig::parse(&json!({"interface": {"nam": "x"}})).is_err());
    }

    #[test]
    fn test_dhcp_and_addresses_exclusive() {
        let err = ClaimConfig::parse(&json!({
            "interface": {"dhcp": true, "addresses": ["192.0.2.5/24"]}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_universe_route_requires_gateway() {
        let err = ClaimConfig::parse(&json!({
            "routes": [{"destination": "10.0.0.0/24", "scope": 0}]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("no gateway"));

        // link scope may omit the gateway
        ClaimConfig::parse(&json!({
            "routes": [{"destination": "10.0.0.1/32", "scope": 253}]
        }))
        .unwrap();
    }

    #[test]
    fn test_invalid_scope_rejected() {
        assert!(
            ClaimConfig::parse(&json!({
                "routes": [{"destination": "10.0.0.0/24", "gateway": "10.0.0.1", "scope": 200}]
            }))
            .is_err()
        );
    }

    #[test]
    fn test_destination_accepts_bare_ip() {
        let route = RouteConfig {
            destination: "192.0.2.7".to_string(),
            gateway: Some("192.0.2.1".to_string()),
            source: None,
            scope: RouteScope::Universe,
        };
        let parsed = route.parsed().unwrap();
        assert_eq!(parsed.destination.prefix_len(), 32);
    }

    #[test]
    fn test_bad_addresses_collected() {
        let err = ClaimConfig::parse(&json!({
            "interface": {"mtu": 10, "addresses": ["not-an-ip"], "hardwareAddr": "zz:zz"}
        }))
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("mtu 10"), "{}", msg);
        assert!(msg.contains("not-an-ip"), "{}", msg);
        assert!(msg.contains("hardware address"), "{}", msg);
    }

    #[test]
    fn test_interface_name_constraints() {
        assert!(validate_interface_name("net0").is_ok());
        assert!(validate_interface_name("eth0.100").is_ok());
        assert!(validate_interface_name("").is_err());
        assert!(validate_interface_name("a-very-long-interface-name").is_err());
        assert!(validate_interface_name("has space").is_err());
        assert!(validate_interface_name("has/slash").is_err());
        assert!(validate_interface_name(".").is_err());
        assert!(validate_interface_name("..").is_err());
        assert!(validate_interface_name("tab\there").is_err());
    }

    #[test]
    fn test_parse_mac() {
        assert_eq!(
            parse_mac("aa:bb:cc:dd:ee:ff").unwrap(),
            vec![0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]
        );
        assert!(parse_mac("aa:bb").is_err());
        assert!(parse_mac("aa-bb-cc-dd-ee-ff").is_err());
    }
}
