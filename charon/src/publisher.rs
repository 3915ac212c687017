//! Rate-limited publication of the filtered inventory.
//!
//! The publisher owns the downstream half of the inventory channel. Every
//! received list is filtered, mirrored for in-process lookups (the prepare
//! handler resolves exposure names back to kernel names through the mirror)
//! and applied to the cluster as this node's ResourceSlice.

use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use k8s_openapi::api::resource::v1beta1::{
    BasicDevice, Device as ApiDevice, ResourcePool, ResourceSlice, ResourceSliceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::{Device, DeviceKind};
use crate::filter::DeviceFilter;
use crate::rdma::RdmaNetnsMode;

/// floor between consecutive submissions to the control plane
const MIN_PUBLISH_INTERVAL: Duration = Duration::from_secs(3);

/// the API caps devices per slice
const MAX_DEVICES_PER_SLICE: usize = 128;

pub const FIELD_MANAGER: &str = "charon";

/// shared mirror of the last published device list
#[derive(Clone, Default)]
pub struct PublishedDevices(Arc<RwLock<Vec<Device>>>);

impl PublishedDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// replace the mirrored list; the publisher calls this on every refresh
    pub fn update(&self, devices: Vec<Device>) {
        *self.0.write().expect("published devices poisoned") = devices;
    }

    pub fn all(&self) -> Vec<Device> {
        self.0.read().expect("published devices poisoned").clone()
    }

    pub fn get(&self, exposed_name: &str) -> Option<Device> {
        self.0
            .read()
            .expect("published devices poisoned")
            .iter()
            .find(|device| device.name == exposed_name)
            .cloned()
    }

    /// recover the kernel name behind an exposure name, preferring the
    /// published attributes over blind decoding
    pub fn kernel_name_of(&self, exposed_name: &str) -> Option<String> {
        if let Some(device) = self.get(exposed_name) {
            return device.kernel_name().map(str::to_string);
        }
        crate::device::original_name(exposed_name)
    }
}

pub struct Publisher {
    client: kube::Client,
    node_name: String,
    driver_name: String,
    filter: DeviceFilter,
    rdma_mode: RdmaNetnsMode,
    mirror: PublishedDevices,
}

impl Publisher {
    pub fn new(
        client: kube::Client,
        node_name: String,
        driver_name: String,
        filter: DeviceFilter,
        rdma_mode: RdmaNetnsMode,
        mirror: PublishedDevices,
    ) -> Self {
        Publisher {
            client,
            node_name,
            driver_name,
            filter,
            rdma_mode,
            mirror,
        }
    }

    /// Consume inventory refreshes until cancellation.
    pub async fn run(
        self,
        mut rx: mpsc::Receiver<Vec<Device>>,
        token: CancellationToken,
    ) -> Result<()> {
        let mut generation: i64 = 1;
        let mut last_published: Option<Vec<Device>> = None;
        let mut last_submit: Option<Instant> = None;

        loop {
            let devices = tokio::select! {
                _ = token.cancelled() => break,
                received = rx.recv() => match received {
                    Some(devices) => devices,
                    None => break,
                },
            };

            let devices = self.prepare_list(devices);
            self.mirror.update(devices.clone());

            if last_published.as_ref() == Some(&devices) {
                debug!("device list unchanged, not republishing");
                continue;
            }

            if let Some(last) = last_submit {
                let since = last.elapsed();
                if since < MIN_PUBLISH_INTERVAL {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(MIN_PUBLISH_INTERVAL - since) => {}
                    }
                }
            }

            generation += 1;
            match self.publish(&devices, generation).await {
                Ok(()) => {
                    info!("published {} devices (generation {})", devices.len(), generation);
                    last_published = Some(devices);
                }
                Err(err) => warn!("resource slice publication failed: {}", err),
            }
            last_submit = Some(Instant::now());
        }

        info!("publisher loop stopped");
        Ok(())
    }

    /// filter and clamp the raw inventory list
    fn prepare_list(&self, devices: Vec<Device>) -> Vec<Device> {
        let mut devices = self.filter.apply(devices);

        // in shared mode RDMA links cannot be handed to a pod namespace,
        // so advertising them would create unschedulable claims
        if !self.rdma_mode.is_exclusive() {
            devices.retain(|device| device.kind != DeviceKind::Rdma);
        }

        if devices.len() > MAX_DEVICES_PER_SLICE {
            warn!(
                "device list truncated from {} to {} (slice capacity)",
                devices.len(),
                MAX_DEVICES_PER_SLICE
            );
            devices.truncate(MAX_DEVICES_PER_SLICE);
        }
        devices
    }

    fn slice_name(&self) -> String {
        format!("{}-{}", self.node_name, self.driver_name.replace('.', "-"))
    }

    fn build_slice(&self, devices: &[Device], generation: i64) -> ResourceSlice {
        ResourceSlice {
            metadata: ObjectMeta {
                name: Some(self.slice_name()),
                ..Default::default()
            },
            spec: ResourceSliceSpec {
                driver: self.driver_name.clone(),
                node_name: Some(self.node_name.clone()),
                pool: ResourcePool {
                    name: self.node_name.clone(),
                    generation,
                    resource_slice_count: 1,
                },
                devices: Some(devices.iter().map(to_api_device).collect()),
                ..Default::default()
            },
        }
    }

    async fn publish(&self, devices: &[Device], generation: i64) -> Result<()> {
        let slice = self.build_slice(devices, generation);
        let api: Api<ResourceSlice> = Api::all(self.client.clone());
        api.patch(
            &self.slice_name(),
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&slice),
        )
        .await
        .context("failed to apply resource slice")?;
        Ok(())
    }
}

fn to_api_device(device: &Device) -> ApiDevice {
    let attributes = device
        .attributes
        .iter()
        .map(|(key, value)| (key.clone(), value.to_device_attribute()))
        .collect();
    ApiDevice {
        name: device.name.clone(),
        basic: Some(BasicDevice {
            attributes: Some(attributes),
            ..Default::default()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::attr;

    #[test]
    fn test_mirror_lookup_and_name_resolution() {
        let mirror = PublishedDevices::new();
        let normalized = Device::new("mlx5_0", DeviceKind::Network);
        let plain = Device::new("eth1", DeviceKind::Network);
        let exposed = normalized.name.clone();
        mirror.update(vec![normalized, plain]);

        assert_eq!(mirror.kernel_name_of(&exposed).as_deref(), Some("mlx5_0"));
        assert_eq!(mirror.kernel_name_of("eth1").as_deref(), Some("eth1"));
        assert!(mirror.get("eth1").is_some());
        assert!(mirror.get("nope").is_none());
        // unpublished names still decode through the normalization scheme
        assert_eq!(
            mirror.kernel_name_of(&crate::device::normalize_name("ib_0")).as_deref(),
            Some("ib_0")
        );
    }

    #[test]
    fn test_to_api_device_keeps_attribute_types() {
        let mut device = Device::new("eth1", DeviceKind::Network);
        device.set(attr::MTU, 9000i64);
        device.set(attr::RDMA, false);

        let api = to_api_device(&device);
        assert_eq!(api.name, "eth1");
        let attributes = api.basic.unwrap().attributes.unwrap();
        assert_eq!(attributes[attr::MTU].int, Some(9000));
        assert_eq!(attributes[attr::RDMA].bool_, Some(false));
        assert_eq!(
            attributes[attr::KERNEL_NAME].string.as_deref(),
            Some("eth1")
        );
    }
}
