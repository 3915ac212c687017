//! Ethtool feature and private-flag control over generic netlink.
//!
//! The ethtool genl family speaks in bitsets. `FEATURES_GET` returns four of
//! them (hardware-supported, wanted, active, no-change); the
//! hardware-supported set doubles as the authoritative enumeration of kernel
//! feature names. `FEATURES_SET` replies with a wanted-delta (requested bits
//! the driver could not satisfy) and an active-delta (bits that actually
//! changed); a non-empty wanted-delta means the request failed. Private
//! flags are driver-specific and silently optional.
//!
//! User-facing feature names may be the legacy ethtool aliases (`tso`,
//! `gro`, ...), which expand to glob patterns over the kernel names.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use netlink_packet_core::{DecodeError, Emitable, ParseableParametrized};
use netlink_packet_generic::{GenlFamily, GenlHeader, GenlMessage};
use netlink_packet_generic::ctrl::{GenlCtrl, GenlCtrlCmd, nlas::GenlCtrlAttrs};
use netlink_packet_utils::nla::{DefaultNla, NLA_F_NESTED, Nla, NlasIterator};
use netlink_packet_utils::parsers::parse_string;
use netlink_packet_utils::Emitable as _;
use netlink_packet_utils::Parseable as _;
use netlink_sys::protocols::NETLINK_GENERIC;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::netlink;

const ETHTOOL_GENL_NAME: &str = "ethtool";
const ETHTOOL_GENL_VERSION: u8 = 1;

const ETHTOOL_MSG_FEATURES_GET: u8 = 11;
const ETHTOOL_MSG_FEATURES_SET: u8 = 12;
const ETHTOOL_MSG_PRIVFLAGS_GET: u8 = 13;
const ETHTOOL_MSG_PRIVFLAGS_SET: u8 = 14;

const ETHTOOL_A_HEADER_DEV_NAME: u16 = 2;

const ETHTOOL_A_FEATURES_HEADER: u16 = 1;
const ETHTOOL_A_FEATURES_HW: u16 = 2;
const ETHTOOL_A_FEATURES_WANTED: u16 = 3;
const ETHTOOL_A_FEATURES_ACTIVE: u16 = 4;
const ETHTOOL_A_FEATURES_NOCHANGED: u16 = 5;

const ETHTOOL_A_PRIVFLAGS_HEADER: u16 = 1;
const ETHTOOL_A_PRIVFLAGS_FLAGS: u16 = 2;

const ETHTOOL_A_BITSET_BITS: u16 = 3;
const ETHTOOL_A_BITSET_BITS_BIT: u16 = 1;
const ETHTOOL_A_BITSET_BIT_NAME: u16 = 2;
const ETHTOOL_A_BITSET_BIT_VALUE: u16 = 3;

/// legacy ethtool flag names (short and long) and the glob each expands to
static LEGACY_ALIASES: Lazy<BTreeMap<&'static str, &'static str>> = Lazy::new(|| {
    BTreeMap::from([
        ("rx", "rx-checksum"),
        ("rx-checksumming", "rx-checksum"),
        ("tx", "tx-checksum-*"),
        ("tx-checksumming", "tx-checksum-*"),
        ("sg", "tx-scatter-gather*"),
        ("scatter-gather", "tx-scatter-gather*"),
        ("tso", "tx-tcp*-segmentation"),
        ("tcp-segmentation-offload", "tx-tcp*-segmentation"),
        ("ufo", "tx-udp-fragmentation"),
        ("udp-fragmentation-offload", "tx-udp-fragmentation"),
        ("gso", "tx-generic-segmentation"),
        ("generic-segmentation-offload", "tx-generic-segmentation"),
        ("gro", "rx-gro"),
        ("generic-receive-offload", "rx-gro"),
        ("lro", "rx-lro"),
        ("large-receive-offload", "rx-lro"),
        ("rxvlan", "rx-vlan-hw-parse"),
        ("rx-vlan-offload", "rx-vlan-hw-parse"),
        ("txvlan", "tx-vlan-hw-insert"),
        ("tx-vlan-offload", "tx-vlan-hw-insert"),
        ("ntuple", "rx-ntuple-filter"),
        ("ntuple-filters", "rx-ntuple-filter"),
        ("rxhash", "rx-hashing"),
        ("receive-hashing", "rx-hashing"),
    ])
});

/// resolved ethtool settings stored in the pod config
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EthtoolPlan {
    /// kernel feature name -> desired state, aliases already expanded
    pub features: BTreeMap<String, bool>,
    pub private_flags: BTreeMap<String, bool>,
}

impl EthtoolPlan {
    pub fn is_empty(&self) -> bool {
        self.features.is_empty() && self.private_flags.is_empty()
    }
}

/// the four bitsets of a FEATURES_GET reply
#[derive(Debug, Clone, Default)]
pub struct DeviceFeatures {
    pub hw: Vec<(String, bool)>,
    pub wanted: Vec<(String, bool)>,
    pub active: Vec<(String, bool)>,
    pub nochanged: Vec<(String, bool)>,
}

impl DeviceFeatures {
    /// kernel names of hardware-changeable features
    pub fn hw_names(&self) -> Vec<String> {
        self.hw
            .iter()
            .filter(|(_, supported)| *supported)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Expand requested feature names against the hardware set.
///
/// A name that matches a hardware feature directly is taken as-is; otherwise
/// the legacy alias table supplies a glob pattern matched against the
/// hardware names. A request matching nothing is an error.
pub fn resolve_features(
    requested: &BTreeMap<String, bool>,
    hw_names: &[String],
) -> Result<BTreeMap<String, bool>> {
    let mut resolved = BTreeMap::new();
    for (name, &enable) in requested {
        if hw_names.iter().any(|hw| hw == name) {
            resolved.insert(name.clone(), enable);
            continue;
        }
        let Some(pattern) = LEGACY_ALIASES.get(name.as_str()) else {
            bail!("unknown ethtool feature {:?}", name);
        };
        let pattern = glob::Pattern::new(pattern)
            .with_context(|| format!("bad alias pattern for {:?}", name))?;
        let matches: Vec<&String> = hw_names.iter().filter(|hw| pattern.matches(hw)).collect();
        if matches.is_empty() {
            bail!(
                "ethtool feature {:?} matches no hardware feature of this device",
                name
            );
        }
        for hw in matches {
            resolved.insert(hw.clone(), enable);
        }
    }
    Ok(resolved)
}

/// one ethtool genl message: command plus attribute list
#[derive(Debug, Clone)]
struct EthtoolMessage {
    cmd: u8,
    nlas: Vec<DefaultNla>,
}

impl GenlFamily for EthtoolMessage {
    fn family_name() -> &'static str {
        ETHTOOL_GENL_NAME
    }

    fn command(&self) -> u8 {
        self.cmd
    }

    fn version(&self) -> u8 {
        ETHTOOL_GENL_VERSION
    }
}

impl Emitable for EthtoolMessage {
    fn buffer_len(&self) -> usize {
        self.nlas.as_slice().buffer_len()
    }

    fn emit(&self, buffer: &mut [u8]) {
        self.nlas.as_slice().emit(buffer)
    }
}

impl ParseableParametrized<[u8], GenlHeader> for EthtoolMessage {
    fn parse_with_param(buf: &[u8], header: GenlHeader) -> Result<Self, DecodeError> {
        let mut nlas = Vec::new();
        for nla in NlasIterator::new(buf) {
            let nla = nla.map_err(|e| DecodeError::from(e.to_string()))?;
            nlas.push(DefaultNla::parse(&nla).map_err(|e| DecodeError::from(e.to_string()))?);
        }
        Ok(EthtoolMessage {
            cmd: header.cmd,
            nlas,
        })
    }
}

fn nla_value(nla: &DefaultNla) -> Vec<u8> {
    let mut value = vec![0u8; nla.value_len()];
    nla.emit_value(&mut value);
    value
}

/// wrap already-emitted attributes into a nest
fn nest(kind: u16, children: &[DefaultNla]) -> DefaultNla {
    let mut buf = vec![0u8; children.buffer_len()];
    children.emit(&mut buf);
    DefaultNla::new(kind | NLA_F_NESTED, buf)
}

/// the request header nest selecting the device by name
fn header_nest(kind: u16, ifname: &str) -> DefaultNla {
    let mut name = ifname.as_bytes().to_vec();
    name.push(0);
    nest(kind, &[DefaultNla::new(ETHTOOL_A_HEADER_DEV_NAME, name)])
}

/// encode a name -> bool map as a verbose bitset nest
fn bitset_nest(kind: u16, bits: &BTreeMap<String, bool>) -> DefaultNla {
    let mut bit_nlas = Vec::new();
    for (name, &value) in bits {
        let mut name_bytes = name.as_bytes().to_vec();
        name_bytes.push(0);
        let mut children = vec![DefaultNla::new(ETHTOOL_A_BITSET_BIT_NAME, name_bytes)];
        if value {
            // flag attribute: presence means "on"
            children.push(DefaultNla::new(ETHTOOL_A_BITSET_BIT_VALUE, Vec::new()));
        }
        bit_nlas.push(nest(ETHTOOL_A_BITSET_BITS_BIT, &children));
    }
    let bits_nest = nest(ETHTOOL_A_BITSET_BITS, &bit_nlas);
    nest(kind, &[bits_nest])
}

/// decode a verbose bitset nest into (name, value) pairs
fn parse_bitset(nla: &DefaultNla) -> Result<Vec<(String, bool)>> {
    let mut bits = Vec::new();
    for bits_attr in NlasIterator::new(&nla_value(nla)[..]) {
        let bits_attr = bits_attr.map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let bits_attr =
            DefaultNla::parse(&bits_attr).map_err(|e| anyhow::anyhow!(e.to_string()))?;
        if bits_attr.kind() & !NLA_F_NESTED != ETHTOOL_A_BITSET_BITS {
            continue;
        }
        for bit in NlasIterator::new(&nla_value(&bits_attr)[..]) {
            let bit = bit.map_err(|e| anyhow::anyhow!(e.to_string()))?;
            let bit = DefaultNla::parse(&bit).map_err(|e| anyhow::anyhow!(e.to_string()))?;
            if bit.kind() & !NLA_F_NESTED != ETHTOOL_A_BITSET_BITS_BIT {
                continue;
            }
            let mut name = None;
            let mut value = false;
            for field in NlasIterator::new(&nla_value(&bit)[..]) {
                let field = field.map_err(|e| anyhow::anyhow!(e.to_string()))?;
                let field =
                    DefaultNla::parse(&field).map_err(|e| anyhow::anyhow!(e.to_string()))?;
                match field.kind() & !NLA_F_NESTED {
                    ETHTOOL_A_BITSET_BIT_NAME => {
                        name = parse_string(&nla_value(&field))
                            .ok()
                            .map(|s| s.trim_end_matches('\0').to_string());
                    }
                    ETHTOOL_A_BITSET_BIT_VALUE => value = true,
                    _ => {}
                }
            }
            if let Some(name) = name {
                bits.push((name, value));
            }
        }
    }
    Ok(bits)
}

fn resolve_family_id() -> Result<u16> {
    let ctrl = GenlCtrl {
        cmd: GenlCtrlCmd::GetFamily,
        nlas: vec![GenlCtrlAttrs::FamilyName(ETHTOOL_GENL_NAME.to_string())],
    };
    let replies = netlink::request(NETLINK_GENERIC, GenlMessage::from_payload(ctrl), false)
        .context("failed to resolve ethtool genl family")?;
    for reply in replies {
        for nla in reply.payload.nlas {
            if let GenlCtrlAttrs::FamilyId(id) = nla {
                return Ok(id);
            }
        }
    }
    bail!("ethtool genl family not present")
}

fn ethtool_request(cmd: u8, nlas: Vec<DefaultNla>) -> Result<Vec<EthtoolMessage>> {
    let family_id = resolve_family_id()?;
    let mut message = GenlMessage::from_payload(EthtoolMessage { cmd, nlas });
    message.set_resolved_family_id(family_id);
    let replies = netlink::request(NETLINK_GENERIC, message, false)?;
    Ok(replies.into_iter().map(|reply| reply.payload).collect())
}

fn find_bitset(replies: &[EthtoolMessage], kind: u16) -> Result<Vec<(String, bool)>> {
    for reply in replies {
        for nla in &reply.nlas {
            if nla.kind() & !NLA_F_NESTED == kind {
                return parse_bitset(nla);
            }
        }
    }
    Ok(Vec::new())
}

/// Fetch the feature bitsets of a device. Runs blocking; call it from a
/// worker thread (pinned into the right namespace when needed).
pub fn features_get(ifname: &str) -> Result<DeviceFeatures> {
    let replies = ethtool_request(
        ETHTOOL_MSG_FEATURES_GET,
        vec![header_nest(ETHTOOL_A_FEATURES_HEADER, ifname)],
    )
    .with_context(|| format!("ethtool features get failed for {}", ifname))?;

    Ok(DeviceFeatures {
        hw: find_bitset(&replies, ETHTOOL_A_FEATURES_HW)?,
        wanted: find_bitset(&replies, ETHTOOL_A_FEATURES_WANTED)?,
        active: find_bitset(&replies, ETHTOOL_A_FEATURES_ACTIVE)?,
        nochanged: find_bitset(&replies, ETHTOOL_A_FEATURES_NOCHANGED)?,
    })
}

/// Apply a resolved feature map. The kernel reply carries the delta bitsets;
/// any feature left in the wanted delta could not be applied.
pub fn features_set(ifname: &str, features: &BTreeMap<String, bool>) -> Result<()> {
    if features.is_empty() {
        return Ok(());
    }
    let replies = ethtool_request(
        ETHTOOL_MSG_FEATURES_SET,
        vec![
            header_nest(ETHTOOL_A_FEATURES_HEADER, ifname),
            bitset_nest(ETHTOOL_A_FEATURES_WANTED, features),
        ],
    )
    .with_context(|| format!("ethtool features set failed for {}", ifname))?;

    let wanted_delta = find_bitset(&replies, ETHTOOL_A_FEATURES_WANTED)?;
    if !wanted_delta.is_empty() {
        let names: Vec<&str> = wanted_delta.iter().map(|(name, _)| name.as_str()).collect();
        bail!(
            "device {} rejected feature changes: {}",
            ifname,
            names.join(", ")
        );
    }

    let active_delta = find_bitset(&replies, ETHTOOL_A_FEATURES_ACTIVE)?;
    debug!(
        "ethtool features applied on {}, {} bits changed",
        ifname,
        active_delta.len()
    );
    Ok(())
}

/// Fetch driver private flags; an empty list when the driver has none.
pub fn privflags_get(ifname: &str) -> Result<Vec<(String, bool)>> {
    let replies = match ethtool_request(
        ETHTOOL_MSG_PRIVFLAGS_GET,
        vec![header_nest(ETHTOOL_A_PRIVFLAGS_HEADER, ifname)],
    ) {
        Ok(replies) => replies,
        Err(err) if netlink::is_not_supported(&err) => return Ok(Vec::new()),
        Err(err) => {
            return Err(err.context(format!("ethtool private flags get failed for {}", ifname)));
        }
    };
    find_bitset(&replies, ETHTOOL_A_PRIVFLAGS_FLAGS)
}

/// Set driver private flags; silently succeeds when the driver has none.
pub fn privflags_set(ifname: &str, flags: &BTreeMap<String, bool>) -> Result<()> {
    if flags.is_empty() {
        return Ok(());
    }
    match ethtool_request(
        ETHTOOL_MSG_PRIVFLAGS_SET,
        vec![
            header_nest(ETHTOOL_A_PRIVFLAGS_HEADER, ifname),
            bitset_nest(ETHTOOL_A_PRIVFLAGS_FLAGS, flags),
        ],
    ) {
        Ok(_) => Ok(()),
        Err(err) if netlink::is_not_supported(&err) => {
            debug!("device {} has no private flags, skipping", ifname);
            Ok(())
        }
        Err(err) => Err(err.context(format!("ethtool private flags set failed for {}", ifname))),
    }
}

/// Apply a full plan: features first, then private flags.
pub fn apply_plan(ifname: &str, plan: &EthtoolPlan) -> Result<()> {
    features_set(ifname, &plan.features)?;
    privflags_set(ifname, &plan.private_flags)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hw() -> Vec<String> {
        [
            "rx-checksum",
            "tx-checksum-ipv4",
            "tx-checksum-ipv6",
            "tx-scatter-gather",
            "tx-tcp-segmentation",
            "tx-tcp6-segmentation",
            "tx-tcp-mangleid-segmentation",
            "rx-gro",
            "rx-vlan-hw-parse",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    #[test]
    fn test_direct_name_resolves() {
        let requested = BTreeMap::from([("rx-gro".to_string(), false)]);
        let resolved = resolve_features(&requested, &hw()).unwrap();
        assert_eq!(resolved, BTreeMap::from([("rx-gro".to_string(), false)]));
    }

    #[test]
    fn test_tso_alias_expands_to_all_matches() {
        let requested = BTreeMap::from([("tso".to_string(), false)]);
        let resolved = resolve_features(&requested, &hw()).unwrap();
        let names: Vec<&str> = resolved.keys().map(String::as_str).collect();
        assert_eq!(
            names,
            vec![
                "tx-tcp-mangleid-segmentation",
                "tx-tcp-segmentation",
                "tx-tcp6-segmentation"
            ]
        );
        assert!(resolved.values().all(|&v| !v));
    }

    #[test]
    fn test_long_form_alias() {
        let requested = BTreeMap::from([("tx-checksumming".to_string(), true)]);
        let resolved = resolve_features(&requested, &hw()).unwrap();
        assert_eq!(resolved.len(), 2);
        assert!(resolved.contains_key("tx-checksum-ipv4"));
        assert!(resolved.contains_key("tx-checksum-ipv6"));
    }

    #[test]
    fn test_alias_with_no_hardware_match_fails() {
        // device has no LRO support
        let requested = BTreeMap::from([("lro".to_string(), true)]);
        let err = resolve_features(&requested, &hw()).unwrap_err();
        assert!(err.to_string().contains("matches no hardware feature"));
    }

    #[test]
    fn test_unknown_name_fails() {
        let requested = BTreeMap::from([("warp-drive".to_string(), true)]);
        let err = resolve_features(&requested, &hw()).unwrap_err();
        assert!(err.to_string().contains("unknown ethtool feature"));
    }

    #[test]
    fn test_bitset_round_trip() {
        let bits = BTreeMap::from([
            ("tx-tcp-segmentation".to_string(), true),
            ("rx-gro".to_string(), false),
        ]);
        let nla = bitset_nest(ETHTOOL_A_FEATURES_WANTED, &bits);
        let parsed = parse_bitset(&nla).unwrap();
        assert_eq!(
            parsed,
            vec![
                ("rx-gro".to_string(), false),
                ("tx-tcp-segmentation".to_string(), true),
            ]
        );
    }

    #[test]
    fn test_header_nest_is_nested() {
        let nla = header_nest(ETHTOOL_A_FEATURES_HEADER, "eth0");
        assert_eq!(nla.kind(), ETHTOOL_A_FEATURES_HEADER | NLA_F_NESTED);
    }
}
