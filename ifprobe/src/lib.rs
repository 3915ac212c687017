//! sysfs probing for network interfaces, PCI topology and RDMA links
//!
//! Everything here is plain filesystem reading. All entry points take the
//! sysfs class root as a parameter so tests can point them at a fixture
//! tree; production callers pass the `*_CLASS` constants.

pub mod pci;
pub mod rdma;
pub mod sysfs;

pub use pci::{PciAddress, PciIds, PciNameFn, PciNames};
pub use rdma::{RdmaCharDev, RdmaLink};
pub use sysfs::NetInterface;

/// natural sort key for interface names (e.g., eth2 < eth10)
pub(crate) fn natural_sort_key(s: &str) -> (String, u32) {
    let mut prefix = String::new();
    let mut num_str = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() {
            num_str.push(c);
        } else if num_str.is_empty() {
            prefix.push(c);
        } else {
            break;
        }
    }

    let num = num_str.parse().unwrap_or(0);
    (prefix, num)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_natural_sort_key() {
        assert!(natural_sort_key("eth2") < natural_sort_key("eth10"));
        assert!(natural_sort_key("p0") < natural_sort_key("p1"));
        assert!(natural_sort_key("mlx5_0") < natural_sort_key("mlx5_1"));
    }
}
