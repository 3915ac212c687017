//! RDMA link discovery from /sys/class/infiniband
//!
//! The RDMA subsystem exposes one directory per link (mlx5_0, ...). The
//! netdev association comes from the per-port GID attributes; the user-space
//! entry points are the character devices under /dev/infiniband.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::natural_sort_key;
use crate::sysfs::read_sysfs_string;

pub const IB_CLASS: &str = "/sys/class/infiniband";
pub const DEV_INFINIBAND: &str = "/dev/infiniband";

/// the RDMA connection manager device, injected into every RDMA-using pod
pub const RDMA_CM_PATH: &str = "/dev/infiniband/rdma_cm";

/// one RDMA link as seen in sysfs
#[derive(Debug, Clone)]
pub struct RdmaLink {
    pub name: String,
    pub node_guid: Option<String>,
    pub fw_version: Option<String>,
    /// netdevs backing this link, from ports/*/gid_attrs/ndevs
    pub netdevs: Vec<String>,
}

/// a character device belonging to an RDMA link
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RdmaCharDev {
    pub path: PathBuf,
    /// device node type, always 'c' for RDMA devices
    pub dev_type: char,
    pub major: u32,
    pub minor: u32,
}

/// enumerate RDMA links under an /sys/class/infiniband root
pub fn list_links(root: &Path) -> Result<Vec<RdmaLink>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut links = Vec::new();

    for entry in
        fs::read_dir(root).with_context(|| format!("failed to read {}", root.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let link_path = entry.path();

        links.push(RdmaLink {
            name,
            node_guid: get_node_guid(&link_path),
            fw_version: read_sysfs_string(&link_path.join("fw_ver")),
            netdevs: get_link_netdevs(&link_path),
        });
    }

    links.sort_by(|a, b| natural_sort_key(&a.name).cmp(&natural_sort_key(&b.name)));
    Ok(links)
}

/// build a netdev name -> RDMA link name map
pub fn netdev_map(root: &Path) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for link in list_links(root)? {
        for netdev in &link.netdevs {
            map.insert(netdev.clone(), link.name.clone());
        }
    }
    Ok(map)
}

fn get_node_guid(link_path: &Path) -> Option<String> {
    read_sysfs_string(&link_path.join("node_guid")).filter(|s| s != "0000:0000:0000:0000")
}

/// netdevs associated with a link by checking port gid_attrs
fn get_link_netdevs(link_path: &Path) -> Vec<String> {
    let mut netdevs = Vec::new();
    let ports_path = link_path.join("ports");

    if let Ok(ports) = fs::read_dir(&ports_path) {
        for port in ports.flatten() {
            let ndevs_path = port.path().join("gid_attrs/ndevs");
            if let Ok(ndevs) = fs::read_dir(&ndevs_path) {
                for ndev in ndevs.flatten() {
                    if let Some(netdev) = read_sysfs_string(&ndev.path()) {
                        if !netdevs.contains(&netdev) {
                            netdevs.push(netdev);
                        }
                    }
                }
            }
        }
    }

    netdevs
}

/// character device names (uverbsN, umadN, issmN) owned by a link
pub fn char_device_names(root: &Path, link: &str) -> Vec<String> {
    let device_path = root.join(link).join("device");
    let mut names = Vec::new();

    for class_dir in ["infiniband_verbs", "infiniband_mad"] {
        if let Ok(entries) = fs::read_dir(device_path.join(class_dir)) {
            for entry in entries.flatten() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
    }

    names.sort_by(|a, b| natural_sort_key(a).cmp(&natural_sort_key(b)));
    names
}

/// resolve the char devices for a link under a /dev/infiniband root,
/// stat-ing each to obtain its (type, major, minor)
pub fn char_devices(ib_root: &Path, dev_root: &Path, link: &str) -> Vec<RdmaCharDev> {
    let mut devs = Vec::new();
    for name in char_device_names(ib_root, link) {
        let path = dev_root.join(&name);
        match stat_char_dev(&path) {
            Ok(dev) => devs.push(dev),
            Err(err) => tracing::debug!("skipping char device {}: {}", path.display(), err),
        }
    }
    devs
}

/// stat a device node to obtain its (type, major, minor)
pub fn stat_char_dev(path: &Path) -> Result<RdmaCharDev> {
    let st = nix::sys::stat::stat(path)
        .with_context(|| format!("failed to stat {}", path.display()))?;
    Ok(RdmaCharDev {
        path: path.to_path_buf(),
        dev_type: 'c',
        major: nix::sys::stat::major(st.st_rdev) as u32,
        minor: nix::sys::stat::minor(st.st_rdev) as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("ifprobe-rdma-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn test_list_links_and_netdev_map() {
        let root = fixture_root("links");
        let link = root.join("mlx5_0");
        fs::create_dir_all(link.join("ports/1/gid_attrs/ndevs")).unwrap();
        fs::write(link.join("node_guid"), "0c42:a103:0065:2b8a\n").unwrap();
        fs::write(link.join("fw_ver"), "20.31.1014\n").unwrap();
        fs::write(link.join("ports/1/gid_attrs/ndevs/0"), "eth1\n").unwrap();
        fs::write(link.join("ports/1/gid_attrs/ndevs/1"), "eth1\n").unwrap();

        let links = list_links(&root).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].name, "mlx5_0");
        assert_eq!(links[0].node_guid.as_deref(), Some("0c42:a103:0065:2b8a"));
        assert_eq!(links[0].netdevs, vec!["eth1".to_string()]);

        let map = netdev_map(&root).unwrap();
        assert_eq!(map.get("eth1").map(String::as_str), Some("mlx5_0"));
    }

    #[test]
    fn test_zero_guid_filtered() {
        let root = fixture_root("guid");
        let link = root.join("rxe0");
        fs::create_dir_all(&link).unwrap();
        fs::write(link.join("node_guid"), "0000:0000:0000:0000\n").unwrap();

        let links = list_links(&root).unwrap();
        assert_eq!(links[0].node_guid, None);
    }

    #[test]
    fn test_char_device_names() {
        let root = fixture_root("chardev");
        let device = root.join("mlx5_0/device");
        fs::create_dir_all(device.join("infiniband_verbs/uverbs0")).unwrap();
        fs::create_dir_all(device.join("infiniband_mad/umad0")).unwrap();
        fs::create_dir_all(device.join("infiniband_mad/issm0")).unwrap();

        let names = char_device_names(&root, "mlx5_0");
        assert_eq!(names, vec!["issm0", "umad0", "uverbs0"]);
    }

    #[test]
    fn test_missing_root_is_empty() {
        let root = fixture_root("gone").join("nonexistent");
        assert!(list_links(&root).unwrap().is_empty());
        assert!(netdev_map(&root).unwrap().is_empty());
    }
}
