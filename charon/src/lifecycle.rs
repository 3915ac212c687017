//! Container-runtime lifecycle callbacks.
//!
//! The runtime drives a small state machine per pod: `RunPodSandbox`
//! attaches every prepared device into the pod's network namespace,
//! `StopPodSandbox` reverses the moves best-effort, `RemovePodSandbox`
//! forgets the namespace path, `CreateContainer` only injects the RDMA char
//! devices, and `Synchronize` replays already-running pods after a restart.
//!
//! The attach path has a hard wall-clock budget imposed by the runtime, so
//! it performs no discovery of its own: everything it needs was precomputed
//! at claim-preparation time and lives in the store. Status conditions are
//! written from spawned tasks and never block the callback.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use tracing::{debug, info, warn};

use crate::config::PodConfig;
use crate::engine;
use crate::ethtool;
use crate::netns::{self, NetnsHandle};
use crate::rdma::{self, RdmaNetnsMode};
use crate::status::{self, StatusWriter};
use crate::store::PodConfigStore;
use crate::{ebpf, routes};

/// a pod sandbox as reported by the runtime, at the interface level
#[derive(Debug, Clone, Default)]
pub struct PodSandbox {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    /// filesystem path of the pod's network namespace; older runtimes omit
    /// it on some callbacks
    pub network_namespace: Option<PathBuf>,
    pub host_network: bool,
}

/// device nodes to inject into a starting container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerAdjustment {
    pub devices: Vec<LinuxDevice>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct LinuxDevice {
    pub path: String,
    pub dev_type: String,
    pub major: i64,
    pub minor: i64,
}

pub struct LifecycleHandler {
    pub driver_name: String,
    pub node_name: String,
    pub store: Arc<PodConfigStore>,
    pub status: Option<StatusWriter>,
    pub host: rtnetlink::Handle,
    pub rdma_mode: RdmaNetnsMode,
    /// pod uid -> network namespace path, fed by Synchronize and
    /// RunPodSandbox for runtimes that omit the path later
    netns_registry: Mutex<HashMap<String, PathBuf>>,
}

impl LifecycleHandler {
    pub fn new(
        driver_name: String,
        node_name: String,
        store: Arc<PodConfigStore>,
        status: Option<StatusWriter>,
        host: rtnetlink::Handle,
        rdma_mode: RdmaNetnsMode,
    ) -> Self {
        LifecycleHandler {
            driver_name,
            node_name,
            store,
            status,
            host,
            rdma_mode,
            netns_registry: Mutex::new(HashMap::new()),
        }
    }

    /// Initial reconciliation: record the namespace paths of already-running
    /// pods. No network changes happen here.
    pub fn synchronize(&self, pods: &[PodSandbox]) {
        let mut registry = self.netns_registry.lock().expect("netns registry poisoned");
        for pod in pods {
            if let Some(path) = &pod.network_namespace {
                registry.insert(pod.uid.clone(), path.clone());
            }
        }
        info!("synchronized {} pods", pods.len());
    }

    /// `CreateContainer`: hand the runtime the deduplicated RDMA char
    /// devices of every device the pod claimed. No network changes.
    pub fn create_container(&self, pod: &PodSandbox) -> ContainerAdjustment {
        let configs = self.store.get_pod_configs(&pod.uid);
        let mut devices: Vec<LinuxDevice> = configs
            .values()
            .filter_map(|config| config.rdma.as_ref())
            .flat_map(|rdma| rdma.char_devs.iter())
            .map(|dev| LinuxDevice {
                path: dev.path.clone(),
                dev_type: dev.dev_type.clone(),
                major: dev.major as i64,
                minor: dev.minor as i64,
            })
            .collect();
        devices.sort();
        devices.dedup();
        ContainerAdjustment { devices }
    }

    /// `RunPodSandbox`: attach every prepared device. Errors propagate so
    /// the runtime can fail the pod; retries converge because the engine
    /// recognizes already-attached devices.
    pub async fn run_pod_sandbox(&self, pod: &PodSandbox) -> Result<()> {
        let configs = self.store.get_pod_configs(&pod.uid);
        if configs.is_empty() {
            return Ok(());
        }

        if pod.host_network {
            bail!(
                "pod {}/{} runs in the host network namespace and cannot claim devices",
                pod.namespace,
                pod.name
            );
        }

        let netns_path = self.resolve_netns(pod).with_context(|| {
            format!("no network namespace known for pod {}/{}", pod.namespace, pod.name)
        })?;
        self.netns_registry
            .lock()
            .expect("netns registry poisoned")
            .insert(pod.uid.clone(), netns_path.clone());

        for (device_name, config) in &configs {
            self.attach_device(&netns_path, config)
                .await
                .with_context(|| format!("device {}", device_name))?;
        }

        Ok(())
    }

    /// `StopPodSandbox`: move every device back. Best effort by design: the
    /// kernel reclaims anything we miss when the namespace dies.
    pub async fn stop_pod_sandbox(&self, pod: &PodSandbox) {
        let configs = self.store.get_pod_configs(&pod.uid);
        if configs.is_empty() {
            return;
        }
        let Some(netns_path) = self.resolve_netns(pod) else {
            debug!("no namespace recorded for pod {}, nothing to detach", pod.uid);
            return;
        };

        for (device_name, config) in &configs {
            let pod_ifname = config
                .interface
                .name
                .clone()
                .unwrap_or_else(|| config.kernel_name.clone());

            if let Err(err) = engine::detach(&netns_path, &pod_ifname, &self.host).await {
                warn!("detach of {} from pod {} failed: {:#}", device_name, pod.uid, err);
            }

            if let Some(rdma_spec) = &config.rdma {
                if self.rdma_mode.is_exclusive() {
                    if let Err(err) = self.detach_rdma(&netns_path, &rdma_spec.link_name).await {
                        warn!(
                            "RDMA link {} restore from pod {} failed: {:#}",
                            rdma_spec.link_name, pod.uid, err
                        );
                    }
                }
            }
        }
    }

    /// `RemovePodSandbox`: forget the namespace path.
    pub fn remove_pod_sandbox(&self, pod: &PodSandbox) {
        self.netns_registry
            .lock()
            .expect("netns registry poisoned")
            .remove(&pod.uid);
        debug!("forgot namespace of pod {}", pod.uid);
    }

    fn resolve_netns(&self, pod: &PodSandbox) -> Option<PathBuf> {
        if let Some(path) = &pod.network_namespace {
            return Some(path.clone());
        }
        self.netns_registry
            .lock()
            .expect("netns registry poisoned")
            .get(&pod.uid)
            .cloned()
    }

    /// one device: netdev attach, then routes, ethtool, eBPF detach, RDMA
    /// attach, strictly in that order
    async fn attach_device(&self, netns_path: &Path, config: &PodConfig) -> Result<()> {
        let mut conditions: Vec<Condition> = Vec::new();

        let attachment = match engine::attach(&self.host, netns_path, config).await {
            Ok(attachment) => attachment,
            Err(err) => {
                conditions.push(status::condition(
                    status::COND_READY,
                    false,
                    "AttachFailed",
                    &format!("{:#}", err),
                ));
                self.publish_status(config, conditions, None);
                return Err(err);
            }
        };

        let network_result = self
            .configure_network(netns_path, config, &attachment)
            .await;
        match &network_result {
            Ok(()) => conditions.push(status::condition(
                status::COND_NETWORK_READY,
                true,
                "NetworkConfigured",
                "routes and features applied",
            )),
            Err(err) => conditions.push(status::condition(
                status::COND_NETWORK_READY,
                false,
                "NetworkConfigFailed",
                &format!("{:#}", err),
            )),
        }

        let rdma_result = self.attach_rdma(netns_path, config).await;
        if let Some(result) = &rdma_result {
            match result {
                Ok(()) => conditions.push(status::condition(
                    status::COND_RDMA_READY,
                    true,
                    "RDMALinkMoved",
                    "RDMA link assigned to the pod namespace",
                )),
                Err(err) => conditions.push(status::condition(
                    status::COND_RDMA_READY,
                    false,
                    "RDMALinkFailed",
                    &format!("{:#}", err),
                )),
            }
        }

        let ready = network_result.is_ok() && rdma_result.as_ref().map_or(true, Result::is_ok);
        conditions.push(status::condition(
            status::COND_READY,
            ready,
            if ready { "DeviceAttached" } else { "AttachIncomplete" },
            &format!("interface {} in pod namespace", attachment.data.interface_name),
        ));
        self.publish_status(config, conditions, Some(&attachment.data));

        network_result?;
        if let Some(result) = rdma_result {
            result?;
        }
        Ok(())
    }

    /// routes, ethtool and the eBPF sweep, inside the pod namespace
    async fn configure_network(
        &self,
        netns_path: &Path,
        config: &PodConfig,
        attachment: &engine::Attachment,
    ) -> Result<()> {
        routes::apply(&attachment.ns_handle, attachment.ifindex, &config.routes)
            .await
            .context("route installation failed")?;

        if let Some(plan) = config.ethtool.clone().filter(|plan| !plan.is_empty()) {
            let ifname = attachment.data.interface_name.clone();
            netns::within_netns(netns_path, move || ethtool::apply_plan(&ifname, &plan))
                .await
                .context("ethtool configuration failed")?;
        }

        if config.interface.disable_ebpf_programs {
            ebpf::detach_interface(netns_path, &attachment.data.interface_name)
                .await
                .context("eBPF detach failed")?;
        }

        Ok(())
    }

    /// move the RDMA link when the device has one; None when not applicable
    async fn attach_rdma(&self, netns_path: &Path, config: &PodConfig) -> Option<Result<()>> {
        let rdma_spec = config.rdma.as_ref()?;
        if !self.rdma_mode.is_exclusive() {
            // shared mode: the link is visible from the pod already and the
            // kernel refuses reassignment
            info!(
                "RDMA namespace mode is shared, not moving link {}",
                rdma_spec.link_name
            );
            return None;
        }

        let link_name = rdma_spec.link_name.clone();
        let netns = match NetnsHandle::open(netns_path) {
            Ok(netns) => netns,
            Err(err) => return Some(Err(err)),
        };
        Some(
            tokio::task::spawn_blocking(move || {
                let fd = netns.raw_fd();
                rdma::set_link_netns(&link_name, fd)
            })
            .await
            .unwrap_or_else(|err| Err(anyhow::anyhow!("rdma task panicked: {}", err))),
        )
    }

    /// restore an RDMA link to the host namespace; must run from inside the
    /// pod namespace because exclusive mode hides the link from the host
    async fn detach_rdma(&self, netns_path: &Path, link_name: &str) -> Result<()> {
        let host_ns = NetnsHandle::current()?;
        let link_name = link_name.to_string();
        netns::within_netns(netns_path, move || {
            rdma::set_link_netns(&link_name, host_ns.raw_fd())
        })
        .await
    }

    fn publish_status(
        &self,
        config: &PodConfig,
        conditions: Vec<Condition>,
        data: Option<&engine::NetworkDeviceData>,
    ) {
        let Some(writer) = &self.status else {
            return;
        };
        let entry = status::device_status(
            &self.driver_name,
            &self.node_name,
            &config.device_name,
            conditions,
            data,
        );
        writer.publish(config.claim.clone(), entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CharDevSpec, ClaimRef, InterfaceSpec, RdmaSpec};

    fn handler() -> LifecycleHandler {
        // a connection is needed structurally; nothing in these tests sends
        let (connection, host, _) = rtnetlink::new_connection().unwrap();
        drop(connection);
        LifecycleHandler::new(
            "charon.dev".to_string(),
            "node-a".to_string(),
            Arc::new(PodConfigStore::new()),
            None,
            host,
            RdmaNetnsMode::Exclusive,
        )
    }

    fn pod(uid: &str) -> PodSandbox {
        PodSandbox {
            uid: uid.to_string(),
            name: format!("pod-{}", uid),
            namespace: "default".to_string(),
            network_namespace: None,
            host_network: false,
        }
    }

    fn rdma_config(claim_uid: &str, device: &str, chardevs: &[(&str, u32, u32)]) -> PodConfig {
        PodConfig {
            claim: ClaimRef {
                uid: claim_uid.to_string(),
                name: format!("claim-{}", claim_uid),
                namespace: "default".to_string(),
            },
            kernel_name: device.to_string(),
            device_name: device.to_string(),
            interface: InterfaceSpec::default(),
            routes: Vec::new(),
            ethtool: None,
            rdma: Some(RdmaSpec {
                link_name: "mlx5_0".to_string(),
                char_devs: chardevs
                    .iter()
                    .map(|(path, major, minor)| CharDevSpec {
                        path: path.to_string(),
                        dev_type: "c".to_string(),
                        major: *major,
                        minor: *minor,
                    })
                    .collect(),
            }),
        }
    }

    #[tokio::test]
    async fn test_synchronize_populates_registry() {
        let handler = handler();
        let mut synced = pod("p1");
        synced.network_namespace = Some(PathBuf::from("/run/netns/p1"));
        handler.synchronize(&[synced, pod("p2")]);

        assert_eq!(
            handler.resolve_netns(&pod("p1")),
            Some(PathBuf::from("/run/netns/p1"))
        );
        // p2 carried no namespace path and resolves to nothing
        assert_eq!(handler.resolve_netns(&pod("p2")), None);
    }

    #[tokio::test]
    async fn test_remove_forgets_namespace() {
        let handler = handler();
        let mut synced = pod("p1");
        synced.network_namespace = Some(PathBuf::from("/run/netns/p1"));
        handler.synchronize(std::slice::from_ref(&synced));
        handler.remove_pod_sandbox(&pod("p1"));
        assert_eq!(handler.resolve_netns(&pod("p1")), None);
    }

    #[tokio::test]
    async fn test_callback_namespace_wins_over_registry() {
        let handler = handler();
        let mut synced = pod("p1");
        synced.network_namespace = Some(PathBuf::from("/run/netns/old"));
        handler.synchronize(std::slice::from_ref(&synced));

        let mut fresh = pod("p1");
        fresh.network_namespace = Some(PathBuf::from("/run/netns/new"));
        assert_eq!(
            handler.resolve_netns(&fresh),
            Some(PathBuf::from("/run/netns/new"))
        );
    }

    #[tokio::test]
    async fn test_create_container_dedups_char_devices() {
        let handler = handler();
        // two devices of the same pod share uverbs0 and rdma_cm
        handler.store.insert(
            "p1",
            "eth1",
            rdma_config("c1", "eth1", &[
                ("/dev/infiniband/uverbs0", 231, 192),
                ("/dev/infiniband/rdma_cm", 10, 58),
            ]),
        );
        handler.store.insert(
            "p1",
            "eth2",
            rdma_config("c1", "eth2", &[
                ("/dev/infiniband/uverbs1", 231, 193),
                ("/dev/infiniband/rdma_cm", 10, 58),
            ]),
        );

        let adjustment = handler.create_container(&pod("p1"));
        assert_eq!(adjustment.devices.len(), 3);
        let cm_count = adjustment
            .devices
            .iter()
            .filter(|dev| dev.path.ends_with("rdma_cm"))
            .count();
        assert_eq!(cm_count, 1);
    }

    #[tokio::test]
    async fn test_create_container_without_configs_is_empty() {
        let handler = handler();
        assert!(handler.create_container(&pod("p9")).devices.is_empty());
    }

    #[tokio::test]
    async fn test_host_network_pod_rejected() {
        let handler = handler();
        handler
            .store
            .insert("p1", "eth1", rdma_config("c1", "eth1", &[]));
        let mut sandbox = pod("p1");
        sandbox.host_network = true;
        let err = handler.run_pod_sandbox(&sandbox).await.unwrap_err();
        assert!(err.to_string().contains("host network"));
    }

    #[tokio::test]
    async fn test_pod_without_configs_is_noop() {
        let handler = handler();
        handler.run_pod_sandbox(&pod("p7")).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_namespace_is_an_error() {
        let handler = handler();
        handler
            .store
            .insert("p1", "eth1", rdma_config("c1", "eth1", &[]));
        let err = handler.run_pod_sandbox(&pod("p1")).await.unwrap_err();
        assert!(err.to_string().contains("no network namespace"));
    }
}
