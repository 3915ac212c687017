//! PCI topology extraction for network devices

use anyhow::{Context, Result, bail};
use std::fmt;
use std::path::Path;

use crate::sysfs::{read_sysfs_i64, read_sysfs_string};

/// a PCI address in domain:bus:device.function form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAddress {
    pub domain: u32,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    /// parse a BDF string such as "0000:3b:00.1"
    pub fn parse(s: &str) -> Result<Self> {
        let (rest, function) = s
            .rsplit_once('.')
            .with_context(|| format!("malformed PCI address {:?}", s))?;
        let mut parts = rest.split(':');
        let (domain, bus, device) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(d), Some(b), Some(dev), None) => (d, b, dev),
            // short form without a domain
            (Some(b), Some(dev), None, None) => ("0000", b, dev),
            _ => bail!("malformed PCI address {:?}", s),
        };

        Ok(PciAddress {
            domain: u32::from_str_radix(domain, 16)
                .with_context(|| format!("bad PCI domain in {:?}", s))?,
            bus: u8::from_str_radix(bus, 16).with_context(|| format!("bad PCI bus in {:?}", s))?,
            device: u8::from_str_radix(device, 16)
                .with_context(|| format!("bad PCI device in {:?}", s))?,
            function: u8::from_str_radix(function, 16)
                .with_context(|| format!("bad PCI function in {:?}", s))?,
        })
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

/// numeric identifiers from the PCI config space mirror in sysfs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PciIds {
    pub vendor: u16,
    pub device: u16,
    pub subsystem_vendor: u16,
    pub subsystem_device: u16,
}

/// resolved names for a PCI id tuple; any field may be unknown
#[derive(Debug, Clone, Default)]
pub struct PciNames {
    pub vendor: Option<String>,
    pub device: Option<String>,
    pub subsystem: Option<String>,
}

/// pluggable id-to-name lookup, e.g. backed by an embedded pci.ids database
pub type PciNameFn = fn(&PciIds) -> PciNames;

/// read vendor/device/subsystem ids from a device directory
pub fn read_ids(device_path: &Path) -> Option<PciIds> {
    let vendor = read_hex_u16(device_path, "vendor")?;
    let device = read_hex_u16(device_path, "device")?;
    Some(PciIds {
        vendor,
        device,
        subsystem_vendor: read_hex_u16(device_path, "subsystem_vendor").unwrap_or(0),
        subsystem_device: read_hex_u16(device_path, "subsystem_device").unwrap_or(0),
    })
}

/// read the NUMA node of a device; the kernel reports -1 for "none"
pub fn numa_node(device_path: &Path) -> Option<i64> {
    read_sysfs_i64(&device_path.join("numa_node")).filter(|&n| n >= 0)
}

fn read_hex_u16(device_path: &Path, file: &str) -> Option<u16> {
    let s = read_sysfs_string(&device_path.join(file))?;
    let s = s.strip_prefix("0x").unwrap_or(&s);
    u16::from_str_radix(s, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_parse_bdf() {
        let addr = PciAddress::parse("0000:3b:00.1").unwrap();
        assert_eq!(addr.domain, 0);
        assert_eq!(addr.bus, 0x3b);
        assert_eq!(addr.device, 0);
        assert_eq!(addr.function, 1);
        assert_eq!(addr.to_string(), "0000:3b:00.1");
    }

    #[test]
    fn test_parse_short_form() {
        let addr = PciAddress::parse("3b:00.0").unwrap();
        assert_eq!(addr.domain, 0);
        assert_eq!(addr.bus, 0x3b);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(PciAddress::parse("eth0").is_err());
        assert!(PciAddress::parse("0000:zz:00.0").is_err());
    }

    #[test]
    fn test_read_ids_and_numa() {
        let dir = std::env::temp_dir().join(format!("ifprobe-pci-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("vendor"), "0x15b3\n").unwrap();
        fs::write(dir.join("device"), "0x101d\n").unwrap();
        fs::write(dir.join("subsystem_vendor"), "0x15b3\n").unwrap();
        fs::write(dir.join("subsystem_device"), "0x0016\n").unwrap();
        fs::write(dir.join("numa_node"), "-1\n").unwrap();

        let ids = read_ids(&dir).unwrap();
        assert_eq!(ids.vendor, 0x15b3);
        assert_eq!(ids.device, 0x101d);
        assert_eq!(ids.subsystem_device, 0x0016);
        assert_eq!(numa_node(&dir), None);

        fs::write(dir.join("numa_node"), "1\n").unwrap();
        assert_eq!(numa_node(&dir), Some(1));
    }
}
