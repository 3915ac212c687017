//! Claim preparation: the slow path that runs before any sandbox exists.
//!
//! For every claim the orchestrator hands over, the handler decodes and
//! validates the opaque payload, resolves exposure names back to kernel
//! names, gathers everything the sandbox hot path must not compute itself
//! (current addresses and routes, hardware feature names, DHCP leases, RDMA
//! char devices) and writes one PodConfig per reserving pod into the store.
//! Errors are collected per device and returned aggregated per claim.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use k8s_openapi::api::resource::v1beta1::{
    DeviceAllocationConfiguration, DeviceRequestAllocationResult, ResourceClaim,
};
use tracing::{debug, info, warn};

use crate::config::{
    CharDevSpec, ClaimConfig, ClaimRef, InterfaceSpec, PodConfig, RdmaSpec, Route,
};
use crate::device::DeviceKind;
use crate::engine;
use crate::ethtool::{self, EthtoolPlan};
use crate::publisher::PublishedDevices;
use crate::store::PodConfigStore;
use crate::{dhcp, ebpf, inventory};

pub struct PrepareHandler {
    pub driver_name: String,
    pub store: Arc<PodConfigStore>,
    pub published: PublishedDevices,
    pub host: rtnetlink::Handle,
    pub bpf_root: PathBuf,
    pub ib_root: PathBuf,
    pub dev_root: PathBuf,
    /// DHCP can be disabled node-wide by flag
    pub dhcp_enabled: bool,
}

impl PrepareHandler {
    /// `PrepareResourceClaims`: prepare each claim, independently.
    pub async fn prepare_resource_claims(
        &self,
        claims: &[ResourceClaim],
    ) -> BTreeMap<String, Result<()>> {
        let mut results = BTreeMap::new();
        for claim in claims {
            let uid = claim.metadata.uid.clone().unwrap_or_default();
            let outcome = self.prepare_claim(claim).await;
            if let Err(err) = &outcome {
                warn!("claim {} preparation failed: {:#}", uid, err);
            }
            results.insert(uid, outcome);
        }
        results
    }

    /// `UnprepareResourceClaims`: drop every stored config for each claim.
    pub async fn unprepare_resource_claims(
        &self,
        claims: &[ResourceClaim],
    ) -> BTreeMap<String, Result<()>> {
        let mut results = BTreeMap::new();
        for claim in claims {
            let uid = claim.metadata.uid.clone().unwrap_or_default();
            self.store.delete_claim(&uid);
            debug!("unprepared claim {}", uid);
            results.insert(uid, Ok(()));
        }
        results
    }

    async fn prepare_claim(&self, claim: &ResourceClaim) -> Result<()> {
        let claim_ref = ClaimRef {
            uid: claim.metadata.uid.clone().unwrap_or_default(),
            name: claim.metadata.name.clone().unwrap_or_default(),
            namespace: claim.metadata.namespace.clone().unwrap_or_default(),
        };

        // only pod reservations matter; other consumers are not ours to serve
        let pod_uids: Vec<String> = claim
            .status
            .as_ref()
            .and_then(|status| status.reserved_for.as_ref())
            .map(|reservations| {
                reservations
                    .iter()
                    .filter(|consumer| consumer.resource == "pods")
                    .map(|consumer| consumer.uid.clone())
                    .collect()
            })
            .unwrap_or_default();
        if pod_uids.is_empty() {
            debug!("claim {} has no pod reservations", claim_ref.uid);
            return Ok(());
        }

        let allocation = claim
            .status
            .as_ref()
            .and_then(|status| status.allocation.as_ref())
            .and_then(|allocation| allocation.devices.as_ref());
        let Some(allocation) = allocation else {
            return Ok(());
        };
        let results: Vec<&DeviceRequestAllocationResult> = allocation
            .results
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter(|result| result.driver == self.driver_name)
            .collect();
        let configs = allocation.config.as_deref().unwrap_or_default();

        let mut errors = Vec::new();
        for result in results {
            let raw = first_opaque_config(configs, &self.driver_name, &result.request);
            match self.prepare_device(&claim_ref, result, raw).await {
                Ok(config) => {
                    for pod_uid in &pod_uids {
                        self.store.insert(pod_uid, &result.device, config.clone());
                    }
                    info!(
                        "prepared device {} of claim {} for {} pod(s)",
                        result.device,
                        claim_ref.uid,
                        pod_uids.len()
                    );
                }
                Err(err) => errors.push(format!("device {}: {:#}", result.device, err)),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!("{}", errors.join("; "))
        }
    }

    /// build the PodConfig for one allocated device
    async fn prepare_device(
        &self,
        claim_ref: &ClaimRef,
        result: &DeviceRequestAllocationResult,
        raw_config: Option<&serde_json::Value>,
    ) -> Result<PodConfig> {
        let config = match raw_config {
            Some(raw) => ClaimConfig::parse(raw)?,
            None => ClaimConfig::default(),
        };

        let published = self
            .published
            .get(&result.device)
            .with_context(|| format!("device {} is not exposed by this node", result.device))?;

        // an RDMA-kind device is addressed by its link name; the netdev that
        // moves with it is the link's first associated interface
        let kernel_name = match published.kind {
            DeviceKind::Network => published
                .kernel_name()
                .map(str::to_string)
                .context("published device lacks a kernel name")?,
            DeviceKind::Rdma => {
                let link_name = published
                    .kernel_name()
                    .map(str::to_string)
                    .context("published device lacks a kernel name")?;
                first_netdev_of_link(&self.ib_root, &link_name)
                    .with_context(|| format!("RDMA link {} has no netdev to attach", link_name))?
            }
        };

        let iface = config.interface.clone().unwrap_or_default();

        // addresses: DHCP wins, then the explicit list, then carry-over of
        // what the host interface holds today
        let mut addresses = Vec::new();
        let mut dhcp_routes: Vec<Route> = Vec::new();
        if iface.dhcp.unwrap_or(false) {
            if !self.dhcp_enabled {
                bail!("dhcp requested but disabled on this node");
            }
            if let Some(lease) = self.run_dhcp(&kernel_name).await? {
                addresses.push(ipnet::IpNet::V4(lease.address));
                dhcp_routes = lease.routes;
            }
        } else if !iface.addresses.is_empty() {
            for address in &iface.addresses {
                addresses.push(crate::config::parse_cidr(address)?);
            }
        } else {
            addresses = inventory::current_addresses(&self.host, &kernel_name)
                .await
                .unwrap_or_default();
        }

        // routes: user-specified, plus what the interface routes today,
        // plus whatever the DHCP server pushed
        let mut routes = Vec::new();
        for route in &config.routes {
            routes.push(route.parsed()?);
        }
        let carried = inventory::current_routes(&self.host, &kernel_name)
            .await
            .unwrap_or_default();
        routes.extend(carried);
        routes.extend(dhcp_routes);

        // ethtool names resolve against the live hardware feature set
        let ethtool_plan = match &config.ethtool {
            Some(requested) if !requested.features.is_empty() || !requested.private_flags.is_empty() => {
                let ifname = kernel_name.clone();
                let features = tokio::task::spawn_blocking(move || ethtool::features_get(&ifname))
                    .await
                    .context("ethtool task panicked")??;
                let resolved = ethtool::resolve_features(&requested.features, &features.hw_names())?;
                Some(EthtoolPlan {
                    features: resolved,
                    private_flags: requested.private_flags.clone(),
                })
            }
            _ => None,
        };

        // RDMA association and char devices
        let rdma = self.rdma_spec(&kernel_name)?;

        // the pinned-link sweep is filesystem work; do it now, not in the
        // sandbox callback
        if iface.disable_ebpf_programs.unwrap_or(false) {
            if let Some(link) = engine::find_link(&self.host, &kernel_name).await? {
                let bpf_root = self.bpf_root.clone();
                let ifindex = link.header.index;
                let sweep = tokio::task::spawn_blocking(move || {
                    ebpf::detach_pinned_links(&bpf_root, ifindex)
                })
                .await
                .context("bpf sweep task panicked")?;
                if let Err(err) = sweep {
                    warn!("pinned bpf sweep for {}: {:#}", kernel_name, err);
                }
            }
        }

        Ok(PodConfig {
            claim: claim_ref.clone(),
            kernel_name,
            device_name: result.device.clone(),
            interface: InterfaceSpec {
                name: iface.name.clone(),
                addresses,
                mtu: iface.mtu,
                hardware_addr: iface
                    .hardware_addr
                    .as_deref()
                    .map(crate::config::parse_mac)
                    .transpose()?,
                gso_max_size: iface.gso_max_size,
                gro_max_size: iface.gro_max_size,
                gso_ipv4_max_size: iface.gso_ipv4_max_size,
                gro_ipv4_max_size: iface.gro_ipv4_max_size,
                disable_ebpf_programs: iface.disable_ebpf_programs.unwrap_or(false),
            },
            routes,
            ethtool: ethtool_plan,
            rdma,
        })
    }

    async fn run_dhcp(&self, kernel_name: &str) -> Result<Option<dhcp::DhcpLease>> {
        let link = engine::find_link(&self.host, kernel_name)
            .await?
            .with_context(|| format!("device {} not found for dhcp", kernel_name))?;
        let mac = link
            .attributes
            .iter()
            .find_map(|attribute| match attribute {
                netlink_packet_route::link::LinkAttribute::Address(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .with_context(|| format!("device {} has no hardware address", kernel_name))?;
        dhcp::exchange(None, kernel_name, mac).await
    }

    /// the RDMA link behind a netdev plus the union of its char devices,
    /// always including the connection manager
    fn rdma_spec(&self, kernel_name: &str) -> Result<Option<RdmaSpec>> {
        let map = ifprobe::rdma::netdev_map(&self.ib_root).unwrap_or_default();
        let Some(link_name) = map.get(kernel_name) else {
            return Ok(None);
        };

        let mut char_devs: Vec<CharDevSpec> =
            ifprobe::rdma::char_devices(&self.ib_root, &self.dev_root, link_name)
                .into_iter()
                .map(to_char_dev_spec)
                .collect();

        let cm_path = self.dev_root.join("rdma_cm");
        match ifprobe::rdma::stat_char_dev(&cm_path) {
            Ok(cm) => char_devs.push(to_char_dev_spec(cm)),
            Err(err) => warn!("rdma_cm unavailable: {}", err),
        }

        char_devs.sort();
        char_devs.dedup();

        Ok(Some(RdmaSpec {
            link_name: link_name.clone(),
            char_devs,
        }))
    }
}

fn to_char_dev_spec(dev: ifprobe::RdmaCharDev) -> CharDevSpec {
    CharDevSpec {
        path: dev.path.to_string_lossy().to_string(),
        dev_type: dev.dev_type.to_string(),
        major: dev.major,
        minor: dev.minor,
    }
}

/// The first opaque configuration block for this driver that targets the
/// request (or targets everything). Later blocks are ignored.
fn first_opaque_config<'a>(
    configs: &'a [DeviceAllocationConfiguration],
    driver: &str,
    request: &str,
) -> Option<&'a serde_json::Value> {
    let mut found = None;
    for config in configs {
        let Some(opaque) = &config.opaque else {
            continue;
        };
        if opaque.driver != driver {
            continue;
        }
        let targets = config.requests.as_deref().unwrap_or_default();
        if !targets.is_empty() && !targets.iter().any(|target| target == request) {
            continue;
        }
        if found.is_none() {
            found = Some(&opaque.parameters.0);
        } else {
            debug!("ignoring additional opaque config for request {}", request);
        }
    }
    found
}

/// resolve the first netdev associated with an RDMA link
fn first_netdev_of_link(ib_root: &std::path::Path, link_name: &str) -> Option<String> {
    ifprobe::rdma::list_links(ib_root)
        .ok()?
        .into_iter()
        .find(|link| link.name == link_name)?
        .netdevs
        .first()
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::resource::v1beta1::OpaqueDeviceConfiguration;
    use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
    use serde_json::json;

    fn opaque(driver: &str, requests: Option<Vec<&str>>, value: serde_json::Value) -> DeviceAllocationConfiguration {
        DeviceAllocationConfiguration {
            source: "FromClaim".to_string(),
            requests: requests.map(|r| r.iter().map(|s| s.to_string()).collect()),
            opaque: Some(OpaqueDeviceConfiguration {
                driver: driver.to_string(),
                parameters: RawExtension(value),
            }),
        }
    }

    #[test]
    fn test_first_opaque_config_wins() {
        let configs = vec![
            opaque("other.dev", None, json!({"interface": {"name": "x0"}})),
            opaque("charon.dev", None, json!({"interface": {"name": "first"}})),
            opaque("charon.dev", None, json!({"interface": {"name": "second"}})),
        ];
        let found = first_opaque_config(&configs, "charon.dev", "net").unwrap();
        assert_eq!(found["interface"]["name"], "first");
    }

    #[test]
    fn test_opaque_config_respects_request_targeting() {
        let configs = vec![
            opaque("charon.dev", Some(vec!["other"]), json!({"interface": {"name": "a"}})),
            opaque("charon.dev", Some(vec!["net"]), json!({"interface": {"name": "b"}})),
        ];
        let found = first_opaque_config(&configs, "charon.dev", "net").unwrap();
        assert_eq!(found["interface"]["name"], "b");
        assert!(first_opaque_config(&configs, "charon.dev", "absent").is_none());
    }
}
