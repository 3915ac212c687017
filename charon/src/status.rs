//! Claim-status reporting.
//!
//! Each (pod, device) attachment phase surfaces as a condition on the
//! claim's `status.devices` entry: `Ready`, `NetworkReady` and, for RDMA
//! devices, `RDMALinkReady`. Writes happen from a spawned task so the
//! sandbox hot path never waits on the API server; a failed write is logged
//! and dropped.

use anyhow::{Context, Result};
use chrono::Utc;
use k8s_openapi::api::resource::v1beta1::{
    AllocatedDeviceStatus, NetworkDeviceData as ApiNetworkDeviceData, ResourceClaim,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::api::{Api, Patch, PatchParams};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::ClaimRef;
use crate::engine::NetworkDeviceData;

pub const COND_READY: &str = "Ready";
pub const COND_NETWORK_READY: &str = "NetworkReady";
pub const COND_RDMA_READY: &str = "RDMALinkReady";

/// build one status condition with the standard metadata
pub fn condition(type_: &str, ok: bool, reason: &str, message: &str) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: if ok { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Time(Utc::now()),
        observed_generation: None,
    }
}

/// assemble the per-device status entry reported on the claim
pub fn device_status(
    driver: &str,
    pool: &str,
    device: &str,
    conditions: Vec<Condition>,
    network_data: Option<&NetworkDeviceData>,
) -> AllocatedDeviceStatus {
    AllocatedDeviceStatus {
        driver: driver.to_string(),
        pool: pool.to_string(),
        device: device.to_string(),
        conditions: Some(conditions),
        network_data: network_data.map(|data| ApiNetworkDeviceData {
            interface_name: Some(data.interface_name.clone()),
            hardware_address: Some(data.hardware_address.clone()),
            ips: Some(data.ips.clone()),
        }),
        data: None,
    }
}

/// asynchronous writer of claim status entries
#[derive(Clone)]
pub struct StatusWriter {
    client: kube::Client,
}

impl StatusWriter {
    pub fn new(client: kube::Client) -> Self {
        StatusWriter { client }
    }

    /// Fire-and-forget: merge one device entry into the claim status.
    pub fn publish(&self, claim: ClaimRef, status: AllocatedDeviceStatus) {
        let writer = self.clone();
        tokio::spawn(async move {
            if let Err(err) = writer.write(&claim, status).await {
                warn!(
                    "failed to update status of claim {}/{}: {}",
                    claim.namespace, claim.name, err
                );
            }
        });
    }

    async fn write(&self, claim: &ClaimRef, status: AllocatedDeviceStatus) -> Result<()> {
        let api: Api<ResourceClaim> = Api::namespaced(self.client.clone(), &claim.namespace);
        let current = api
            .get(&claim.name)
            .await
            .context("failed to fetch claim")?;

        let mut devices = current
            .status
            .and_then(|status| status.devices)
            .unwrap_or_default();
        devices.retain(|entry| {
            !(entry.driver == status.driver
                && entry.pool == status.pool
                && entry.device == status.device)
        });
        devices.push(status);

        let patch = json!({"status": {"devices": devices}});
        api.patch_status(
            &claim.name,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await
        .context("failed to patch claim status")?;

        debug!("updated status of claim {}/{}", claim.namespace, claim.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_fields() {
        let ready = condition(COND_READY, true, "DeviceAttached", "interface moved");
        assert_eq!(ready.type_, "Ready");
        assert_eq!(ready.status, "True");
        assert_eq!(ready.reason, "DeviceAttached");

        let failed = condition(COND_NETWORK_READY, false, "AttachError", "boom");
        assert_eq!(failed.status, "False");
    }

    #[test]
    fn test_device_status_carries_network_data() {
        let data = NetworkDeviceData {
            interface_name: "net0".to_string(),
            hardware_address: "aa:bb:cc:dd:ee:ff".to_string(),
            ips: vec!["192.0.2.5/24".to_string()],
        };
        let status = device_status(
            "charon.dev",
            "node-a",
            "eth1",
            vec![condition(COND_READY, true, "DeviceAttached", "ok")],
            Some(&data),
        );
        assert_eq!(status.driver, "charon.dev");
        let network = status.network_data.unwrap();
        assert_eq!(network.interface_name.as_deref(), Some("net0"));
        assert_eq!(network.ips.unwrap(), vec!["192.0.2.5/24".to_string()]);
        assert_eq!(status.conditions.unwrap().len(), 1);
    }
}
