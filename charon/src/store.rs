//! Thread-safe store of prepared per-pod configuration.
//!
//! Keyed by pod UID, then by exposed device name. Writers are the
//! claim-prepare handler; readers are the sandbox callbacks, which must not
//! block, so reads hand out copies instead of guards.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::config::PodConfig;

#[derive(Default)]
pub struct PodConfigStore {
    inner: RwLock<HashMap<String, HashMap<String, PodConfig>>>,
}

impl PodConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the config for one (pod, device) pair.
    pub fn insert(&self, pod_uid: &str, device: &str, config: PodConfig) {
        let mut inner = self.inner.write().expect("pod config store poisoned");
        inner
            .entry(pod_uid.to_string())
            .or_default()
            .insert(device.to_string(), config);
    }

    /// Look up the config for one (pod, device) pair.
    pub fn get(&self, pod_uid: &str, device: &str) -> Option<PodConfig> {
        let inner = self.inner.read().expect("pod config store poisoned");
        inner.get(pod_uid).and_then(|devices| devices.get(device)).cloned()
    }

    /// All configs for a pod, as a defensive copy the caller may iterate
    /// without holding the lock.
    pub fn get_pod_configs(&self, pod_uid: &str) -> HashMap<String, PodConfig> {
        let inner = self.inner.read().expect("pod config store poisoned");
        inner.get(pod_uid).cloned().unwrap_or_default()
    }

    pub fn has_pod(&self, pod_uid: &str) -> bool {
        let inner = self.inner.read().expect("pod config store poisoned");
        inner.contains_key(pod_uid)
    }

    /// Drop everything stored for a pod.
    pub fn delete_pod(&self, pod_uid: &str) {
        let mut inner = self.inner.write().expect("pod config store poisoned");
        inner.remove(pod_uid);
    }

    /// Drop every device entry referencing the given claim UID; entries of
    /// other claims stay, and a pod is forgotten only once its last device
    /// is gone.
    ///
    /// Sweeps the device maps first and collects emptied pods for a second
    /// pass so the outer map is never mutated while being walked.
    pub fn delete_claim(&self, claim_uid: &str) {
        let mut inner = self.inner.write().expect("pod config store poisoned");
        let mut emptied = Vec::new();
        for (pod_uid, devices) in inner.iter_mut() {
            devices.retain(|_, config| config.claim.uid != claim_uid);
            if devices.is_empty() {
                emptied.push(pod_uid.clone());
            }
        }
        for pod_uid in emptied {
            inner.remove(&pod_uid);
        }
    }

    /// Pod UIDs currently holding prepared configuration.
    pub fn pod_uids(&self) -> Vec<String> {
        let inner = self.inner.read().expect("pod config store poisoned");
        inner.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClaimRef, InterfaceSpec};

    fn config_for(claim_uid: &str, device: &str) -> PodConfig {
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
            rdma: None,
        }
    }

    #[test]
    fn test_insert_get_overwrite() {
        let store = PodConfigStore::new();
        store.insert("pod-1", "eth1", config_for("c1", "eth1"));
        assert!(store.get("pod-1", "eth1").is_some());
        assert!(store.get("pod-1", "eth2").is_none());
        assert!(store.get("pod-2", "eth1").is_none());

        // a second prepare overwrites the existing entry
        let mut updated = config_for("c1", "eth1");
        updated.interface.mtu = Some(9000);
        store.insert("pod-1", "eth1", updated);
        assert_eq!(
            store.get("pod-1", "eth1").unwrap().interface.mtu,
            Some(9000)
        );
    }

    #[test]
    fn test_get_pod_configs_is_isolated() {
        let store = PodConfigStore::new();
        store.insert("pod-1", "eth1", config_for("c1", "eth1"));

        let mut copy = store.get_pod_configs("pod-1");
        copy.remove("eth1");
        copy.insert("bogus".to_string(), config_for("c9", "bogus"));

        // mutations of the copy never reach the store
        assert!(store.get("pod-1", "eth1").is_some());
        assert!(store.get("pod-1", "bogus").is_none());
    }

    #[test]
    fn test_delete_pod() {
        let store = PodConfigStore::new();
        store.insert("pod-1", "eth1", config_for("c1", "eth1"));
        store.insert("pod-2", "eth2", config_for("c2", "eth2"));
        store.delete_pod("pod-1");
        assert!(!store.has_pod("pod-1"));
        assert!(store.has_pod("pod-2"));
    }

    #[test]
    fn test_delete_claim_sweep() {
        let store = PodConfigStore::new();
        // two pods share claim c1, a third holds c2
        store.insert("pod-1", "eth1", config_for("c1", "eth1"));
        store.insert("pod-2", "eth1", config_for("c1", "eth1"));
        store.insert("pod-3", "eth2", config_for("c2", "eth2"));

        store.delete_claim("c1");

        assert!(!store.has_pod("pod-1"));
        assert!(!store.has_pod("pod-2"));
        assert!(store.has_pod("pod-3"));
        assert_eq!(store.pod_uids(), vec!["pod-3".to_string()]);

        // deleting an unknown claim is a no-op
        store.delete_claim("c9");
        assert!(store.has_pod("pod-3"));
    }

    #[test]
    fn test_delete_claim_is_per_device() {
        let store = PodConfigStore::new();
        // one pod holds devices from two different claims
        store.insert("pod-1", "eth1", config_for("c1", "eth1"));
        store.insert("pod-1", "eth2", config_for("c2", "eth2"));

        store.delete_claim("c1");

        // only the c1-owned device goes; the pod and its c2 device survive
        assert!(store.has_pod("pod-1"));
        assert!(store.get("pod-1", "eth1").is_none());
        assert_eq!(store.get("pod-1", "eth2").unwrap().claim.uid, "c2");

        // the pod is forgotten once its last device is swept
        store.delete_claim("c2");
        assert!(!store.has_pod("pod-1"));
    }
}
