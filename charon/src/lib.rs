//! charon: a per-node agent that exposes host network interfaces (and their
//! RDMA links and char devices) as claimable devices and moves them into pod
//! network namespaces with caller-supplied configuration, restoring them on
//! teardown.

use std::collections::HashMap;

pub mod config;
pub mod device;
pub mod dhcp;
pub mod ebpf;
pub mod engine;
pub mod ethtool;
pub mod filter;
pub mod inventory;
pub mod lifecycle;
pub mod netlink;
pub mod netns;
pub mod prepare;
pub mod publisher;
pub mod rdma;
pub mod routes;
pub mod status;
pub mod store;

/// the DRA driver name this agent registers under
pub const DRIVER_NAME: &str = "charon.dev";

/// The two request/response surfaces of the agent, bundled for the plugin
/// servers (kubelet DRA plugin and runtime hook) that drive them. The wire
/// plumbing registering these with kubelet and the runtime lives outside
/// this crate; everything behind the calls lives here.
pub struct Driver {
    pub prepare: prepare::PrepareHandler,
    pub lifecycle: lifecycle::LifecycleHandler,
}

impl Driver {
    /// `PrepareResourceClaims` (scheduler side, slow path)
    pub async fn prepare_resource_claims(
        &self,
        claims: &[k8s_openapi::api::resource::v1beta1::ResourceClaim],
    ) -> std::collections::BTreeMap<String, anyhow::Result<()>> {
        self.prepare.prepare_resource_claims(claims).await
    }

    /// `UnprepareResourceClaims` (scheduler side)
    pub async fn unprepare_resource_claims(
        &self,
        claims: &[k8s_openapi::api::resource::v1beta1::ResourceClaim],
    ) -> std::collections::BTreeMap<String, anyhow::Result<()>> {
        self.prepare.unprepare_resource_claims(claims).await
    }

    /// `Synchronize` (runtime side, initial replay)
    pub fn synchronize(&self, pods: &[lifecycle::PodSandbox]) {
        self.lifecycle.synchronize(pods)
    }

    /// `RunPodSandbox` (runtime side, hot path)
    pub async fn run_pod_sandbox(&self, pod: &lifecycle::PodSandbox) -> anyhow::Result<()> {
        self.lifecycle.run_pod_sandbox(pod).await
    }

    /// `StopPodSandbox` (runtime side, best effort)
    pub async fn stop_pod_sandbox(&self, pod: &lifecycle::PodSandbox) {
        self.lifecycle.stop_pod_sandbox(pod).await
    }

    /// `RemovePodSandbox` (runtime side)
    pub fn remove_pod_sandbox(&self, pod: &lifecycle::PodSandbox) {
        self.lifecycle.remove_pod_sandbox(pod)
    }

    /// `CreateContainer` (runtime side): RDMA char-device mounts only
    pub fn create_container(&self, pod: &lifecycle::PodSandbox) -> lifecycle::ContainerAdjustment {
        self.lifecycle.create_container(pod)
    }
}

/// Cloud-provider metadata hook: discovers a MAC address -> provider network
/// map once at startup. Providers are external collaborators; the default
/// discovers nothing.
pub type CloudNetworkFn = fn() -> anyhow::Result<HashMap<String, String>>;

/// the default cloud hook: no provider metadata
pub fn no_cloud_networks() -> anyhow::Result<HashMap<String, String>> {
    Ok(HashMap::new())
}
