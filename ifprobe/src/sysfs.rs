//! network interface discovery from /sys/class/net

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::natural_sort_key;

pub const NET_CLASS: &str = "/sys/class/net";

/// check if a device is a Virtual Function by looking for physfn symlink
pub fn is_virtual_function(device_path: &Path) -> bool {
    device_path.join("physfn").is_symlink()
}

/// info about a network interface from sysfs
#[derive(Debug, Clone)]
pub struct NetInterface {
    pub name: String,
    /// a `device` symlink exists, i.e. the interface is backed by hardware
    pub has_device: bool,
    pub is_vf: bool,
    pub pf_name: Option<String>,
    pub pci_addr: Option<String>,
    pub mac_address: Option<String>,
    pub operstate: Option<String>,
    /// total VFs the PF supports, from sriov_totalvfs
    pub sriov_totalvfs: Option<u32>,
    /// currently instantiated VFs, from sriov_numvfs
    pub sriov_numvfs: Option<u32>,
}

impl NetInterface {
    pub fn is_sriov_pf(&self) -> bool {
        self.sriov_totalvfs.unwrap_or(0) > 0
    }
}

/// enumerate all network interfaces under a /sys/class/net root
pub fn list_net_interfaces(root: &Path) -> Result<Vec<NetInterface>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut interfaces = Vec::new();

    for entry in
        fs::read_dir(root).with_context(|| format!("failed to read {}", root.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        match probe_interface(root, &name) {
            Ok(iface) => interfaces.push(iface),
            Err(err) => tracing::debug!("skipping {}: {}", name, err),
        }
    }

    interfaces.sort_by(|a, b| natural_sort_key(&a.name).cmp(&natural_sort_key(&b.name)));
    Ok(interfaces)
}

/// probe a single named interface under a /sys/class/net root
pub fn probe_interface(root: &Path, name: &str) -> Result<NetInterface> {
    let iface_path = root.join(name);
    if !iface_path.exists() {
        anyhow::bail!("no sysfs entry for {}", name);
    }

    let device_path = iface_path.join("device");
    let has_device = device_path.is_symlink() || device_path.is_dir();
    let is_vf = has_device && is_virtual_function(&device_path);

    let pf_name = if is_vf {
        get_pf_name_for_vf(&iface_path)
    } else {
        None
    };

    let pci_addr = if has_device {
        get_pci_addr(&device_path)
    } else {
        None
    };

    let sriov_totalvfs = read_sysfs_u32(&device_path.join("sriov_totalvfs"));
    let sriov_numvfs = read_sysfs_u32(&device_path.join("sriov_numvfs"));

    Ok(NetInterface {
        name: name.to_string(),
        has_device,
        is_vf,
        pf_name,
        pci_addr,
        mac_address: read_sysfs_string(&iface_path.join("address")),
        operstate: read_sysfs_string(&iface_path.join("operstate")),
        sriov_totalvfs,
        sriov_numvfs,
    })
}

/// get the PF name for a VF interface
fn get_pf_name_for_vf(iface_path: &Path) -> Option<String> {
    let physfn_net = iface_path.join("device/physfn/net");
    if physfn_net.is_dir() {
        if let Ok(entries) = fs::read_dir(&physfn_net) {
            for entry in entries.flatten() {
                return Some(entry.file_name().to_string_lossy().to_string());
            }
        }
    }
    None
}

/// get VFs for a PF, including orphan VFs (no network interface)
pub fn get_vfs_for_pf(pf_iface_path: &Path) -> Vec<VfInfo> {
    let device_path = pf_iface_path.join("device");
    if !device_path.is_symlink() && !device_path.is_dir() {
        return Vec::new();
    }

    let mut vfs = Vec::new();

    if let Ok(entries) = fs::read_dir(&device_path) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("virtfn") {
                continue;
            }

            let net_path = entry.path().join("net");
            let iface_name = if net_path.is_dir() {
                fs::read_dir(&net_path)
                    .ok()
                    .and_then(|mut entries| entries.next())
                    .and_then(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().to_string())
            } else {
                None
            };

            vfs.push(VfInfo {
                virtfn_index: name,
                iface_name,
            });
        }
    }

    vfs.sort_by(|a, b| natural_sort_key(&a.virtfn_index).cmp(&natural_sort_key(&b.virtfn_index)));
    vfs
}

#[derive(Debug, Clone)]
pub struct VfInfo {
    pub virtfn_index: String,
    pub iface_name: Option<String>,
}

/// extract the PCI address from the device symlink (e.g., "0000:3b:00.0")
pub fn get_pci_addr(device_path: &Path) -> Option<String> {
    fs::read_link(device_path)
        .ok()
        .and_then(|target| target.file_name().map(|s| s.to_string_lossy().to_string()))
        .or_else(|| {
            // fixture trees use plain directories instead of symlinks
            device_path
                .canonicalize()
                .ok()
                .and_then(|p| p.file_name().map(|s| s.to_string_lossy().to_string()))
                .filter(|s| s.contains(':'))
        })
}

/// resolve the device directory behind an interface
pub fn device_dir(root: &Path, name: &str) -> PathBuf {
    root.join(name).join("device")
}

/// read a sysfs file as trimmed string
pub fn read_sysfs_string(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// read a sysfs file as decimal u32
pub fn read_sysfs_u32(path: &Path) -> Option<u32> {
    read_sysfs_string(path).and_then(|s| s.parse().ok())
}

/// read a sysfs file as i64, accepting a 0x prefix
pub fn read_sysfs_i64(path: &Path) -> Option<i64> {
    read_sysfs_string(path).and_then(|s| {
        if let Some(hex) = s.strip_prefix("0x") {
            i64::from_str_radix(hex, 16).ok()
        } else {
            s.parse().ok()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixture_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("ifprobe-sysfs-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn test_list_virtual_interface() {
        let root = fixture_root("virt");
        let iface = root.join("veth0");
        fs::create_dir_all(&iface).unwrap();
        fs::write(iface.join("address"), "aa:bb:cc:dd:ee:ff\n").unwrap();
        fs::write(iface.join("operstate"), "up\n").unwrap();

        let list = list_net_interfaces(&root).unwrap();
        assert_eq!(list.len(), 1);
        let dev = &list[0];
        assert_eq!(dev.name, "veth0");
        assert!(!dev.has_device);
        assert_eq!(dev.mac_address.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(dev.operstate.as_deref(), Some("up"));
    }

    #[test]
    fn test_sriov_counts() {
        let root = fixture_root("sriov");
        let device = root.join("eth0/device");
        fs::create_dir_all(&device).unwrap();
        fs::write(device.join("sriov_totalvfs"), "8\n").unwrap();
        fs::write(device.join("sriov_numvfs"), "2\n").unwrap();

        let dev = probe_interface(&root, "eth0").unwrap();
        assert!(dev.has_device);
        assert!(dev.is_sriov_pf());
        assert_eq!(dev.sriov_totalvfs, Some(8));
        assert_eq!(dev.sriov_numvfs, Some(2));
    }

    #[test]
    fn test_missing_interface() {
        let root = fixture_root("missing");
        assert!(probe_interface(&root, "nope").is_err());
    }
}
