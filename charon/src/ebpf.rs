//! eBPF cleanup for interfaces handed to pods.
//!
//! Workloads that bring their own datapath ask for the host's eBPF programs
//! to be removed from the device. Three attachment mechanisms exist side by
//! side: classic TC filters (netlink), TCX (bpf links / prog attach), and
//! XDP (a link attribute). The in-namespace pass removes TC and TCX
//! attachments and clears XDP; a separate host-side pass walks the pinned
//! object tree and detaches pinned links targeting the interface, which is
//! filesystem work and therefore belongs to the slow prepare path.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_packet_route::link::{LinkAttribute, LinkMessage, LinkXdp};
use netlink_packet_route::tc::{TcAttribute, TcHandle, TcMessage};
use netlink_sys::protocols::NETLINK_ROUTE;
use tracing::{debug, info};

use crate::netlink;
use crate::netns;

/// default pinned-object filesystem root
pub const DEFAULT_BPF_FS: &str = "/sys/fs/bpf";

/// clsact parents
const CLSACT_MAJOR: u16 = 0xffff;
const CLSACT_INGRESS_MINOR: u16 = 0xfff2;
const CLSACT_EGRESS_MINOR: u16 = 0xfff3;

// bpf(2) commands
const BPF_PROG_DETACH: libc::c_long = 9;
const BPF_OBJ_GET: libc::c_long = 7;
const BPF_PROG_GET_FD_BY_ID: libc::c_long = 13;
const BPF_OBJ_GET_INFO_BY_FD: libc::c_long = 15;
const BPF_PROG_QUERY: libc::c_long = 16;
const BPF_LINK_DETACH: libc::c_long = 34;

// attach types
const BPF_TCX_INGRESS: u32 = 46;
const BPF_TCX_EGRESS: u32 = 47;

// link types
const BPF_LINK_TYPE_XDP: u32 = 6;
const BPF_LINK_TYPE_TCX: u32 = 11;
const BPF_LINK_TYPE_NETKIT: u32 = 13;

mod sys {
    //! minimal bpf(2) attribute layouts, mirroring the kernel uapi

    use std::os::fd::RawFd;

    use anyhow::{Context, Result};

    unsafe fn bpf(cmd: libc::c_long, attr: *mut libc::c_void, size: usize) -> Result<i64> {
        let ret = unsafe { libc::syscall(libc::SYS_bpf, cmd, attr, size) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(ret)
    }

    #[repr(C)]
    #[derive(Default)]
    struct ProgQueryAttr {
        target: u32,
        attach_type: u32,
        query_flags: u32,
        attach_flags: u32,
        prog_ids: u64,
        prog_cnt: u32,
        _pad: u32,
        prog_attach_flags: u64,
        link_ids: u64,
        link_attach_flags: u64,
        revision: u64,
    }

    /// query program ids attached to an interface for one attach type
    pub fn prog_query(ifindex: u32, attach_type: u32) -> Result<Vec<u32>> {
        let mut ids = vec![0u32; 64];
        let mut attr = ProgQueryAttr {
            target: ifindex,
            attach_type,
            prog_ids: ids.as_mut_ptr() as u64,
            prog_cnt: ids.len() as u32,
            ..Default::default()
        };
        unsafe {
            bpf(
                super::BPF_PROG_QUERY,
                &mut attr as *mut _ as *mut libc::c_void,
                std::mem::size_of::<ProgQueryAttr>(),
            )
        }
        .context("BPF_PROG_QUERY failed")?;
        ids.truncate(attr.prog_cnt as usize);
        Ok(ids)
    }

    #[repr(C)]
    #[derive(Default)]
    struct GetFdByIdAttr {
        id: u32,
        next_id: u32,
        open_flags: u32,
    }

    pub fn prog_get_fd_by_id(id: u32) -> Result<RawFd> {
        let mut attr = GetFdByIdAttr {
            id,
            ..Default::default()
        };
        let fd = unsafe {
            bpf(
                super::BPF_PROG_GET_FD_BY_ID,
                &mut attr as *mut _ as *mut libc::c_void,
                std::mem::size_of::<GetFdByIdAttr>(),
            )
        }
        .with_context(|| format!("BPF_PROG_GET_FD_BY_ID({}) failed", id))?;
        Ok(fd as RawFd)
    }

    #[repr(C)]
    #[derive(Default)]
    struct ProgAttachAttr {
        target: u32,
        attach_bpf_fd: u32,
        attach_type: u32,
        attach_flags: u32,
        replace_bpf_fd: u32,
        relative: u32,
        expected_revision: u64,
    }

    /// detach one program from an interface attach point
    pub fn prog_detach(ifindex: u32, attach_type: u32, prog_fd: RawFd) -> Result<()> {
        let mut attr = ProgAttachAttr {
            target: ifindex,
            attach_bpf_fd: prog_fd as u32,
            attach_type,
            ..Default::default()
        };
        unsafe {
            bpf(
                super::BPF_PROG_DETACH,
                &mut attr as *mut _ as *mut libc::c_void,
                std::mem::size_of::<ProgAttachAttr>(),
            )
        }
        .context("BPF_PROG_DETACH failed")?;
        Ok(())
    }

    #[repr(C)]
    #[derive(Default)]
    struct ObjGetAttr {
        pathname: u64,
        bpf_fd: u32,
        file_flags: u32,
        path_fd: i32,
    }

    /// open a pinned object by path
    pub fn obj_get(path: &std::path::Path) -> Result<RawFd> {
        let cpath = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
            .context("pin path contains NUL")?;
        let mut attr = ObjGetAttr {
            pathname: cpath.as_ptr() as u64,
            ..Default::default()
        };
        let fd = unsafe {
            bpf(
                super::BPF_OBJ_GET,
                &mut attr as *mut _ as *mut libc::c_void,
                std::mem::size_of::<ObjGetAttr>(),
            )
        }
        .with_context(|| format!("BPF_OBJ_GET({}) failed", path.display()))?;
        Ok(fd as RawFd)
    }

    #[repr(C)]
    struct LinkInfo {
        pub type_: u32,
        pub id: u32,
        pub prog_id: u32,
        _pad: u32,
        // the per-type union; first word carries the ifindex for
        // xdp/tcx/netkit links, second the attach type for tcx/netkit
        extra: [u64; 32],
    }

    impl Default for LinkInfo {
        fn default() -> Self {
            LinkInfo {
                type_: 0,
                id: 0,
                prog_id: 0,
                _pad: 0,
                extra: [0; 32],
            }
        }
    }

    /// a decoded bpf link description
    #[derive(Debug, Clone, Copy)]
    pub struct BpfLink {
        pub link_type: u32,
        pub id: u32,
        pub prog_id: u32,
        pub ifindex: u32,
    }

    #[repr(C)]
    #[derive(Default)]
    struct InfoByFdAttr {
        bpf_fd: u32,
        info_len: u32,
        info: u64,
    }

    pub fn link_info(fd: RawFd) -> Result<BpfLink> {
        let mut info = LinkInfo::default();
        let mut attr = InfoByFdAttr {
            bpf_fd: fd as u32,
            info_len: std::mem::size_of::<LinkInfo>() as u32,
            info: &mut info as *mut _ as u64,
        };
        unsafe {
            bpf(
                super::BPF_OBJ_GET_INFO_BY_FD,
                &mut attr as *mut _ as *mut libc::c_void,
                std::mem::size_of::<InfoByFdAttr>(),
            )
        }
        .context("BPF_OBJ_GET_INFO_BY_FD failed")?;
        Ok(BpfLink {
            link_type: info.type_,
            id: info.id,
            prog_id: info.prog_id,
            ifindex: (info.extra[0] & 0xffff_ffff) as u32,
        })
    }

    #[repr(C)]
    #[derive(Default)]
    struct LinkDetachAttr {
        link_fd: u32,
    }

    pub fn link_detach(fd: RawFd) -> Result<()> {
        let mut attr = LinkDetachAttr { link_fd: fd as u32 };
        unsafe {
            bpf(
                super::BPF_LINK_DETACH,
                &mut attr as *mut _ as *mut libc::c_void,
                std::mem::size_of::<LinkDetachAttr>(),
            )
        }
        .context("BPF_LINK_DETACH failed")?;
        Ok(())
    }

    #[repr(C)]
    struct ProgInfo {
        type_: u32,
        id: u32,
        tag: [u8; 8],
        jited_prog_len: u32,
        xlated_prog_len: u32,
        jited_prog_insns: u64,
        xlated_prog_insns: u64,
        load_time: u64,
        created_by_uid: u32,
        nr_map_ids: u32,
        map_ids: u64,
        name: [u8; 16],
        // the kernel appends more fields; the buffer below leaves room
        extra: [u64; 32],
    }

    impl Default for ProgInfo {
        fn default() -> Self {
            // large zeroed buffer, the kernel fills what it knows
            unsafe { std::mem::zeroed() }
        }
    }

    /// the object name a program was loaded with
    pub fn prog_name(fd: RawFd) -> Result<String> {
        let mut info = ProgInfo::default();
        let mut attr = InfoByFdAttr {
            bpf_fd: fd as u32,
            info_len: std::mem::size_of::<ProgInfo>() as u32,
            info: &mut info as *mut _ as u64,
        };
        unsafe {
            bpf(
                super::BPF_OBJ_GET_INFO_BY_FD,
                &mut attr as *mut _ as *mut libc::c_void,
                std::mem::size_of::<InfoByFdAttr>(),
            )
        }
        .context("BPF_OBJ_GET_INFO_BY_FD failed")?;
        let len = info.name.iter().position(|&b| b == 0).unwrap_or(info.name.len());
        Ok(String::from_utf8_lossy(&info.name[..len]).to_string())
    }

    pub fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    /// pinned bpf links expose a link_type row in fdinfo
    pub fn is_link_fd(fd: RawFd) -> bool {
        std::fs::read_to_string(format!("/proc/self/fdinfo/{}", fd))
            .map(|content| content.contains("link_type"))
            .unwrap_or(false)
    }
}

/// Remove every eBPF attachment from `ifname` inside the namespace at
/// `netns_path`. Individual failures are aggregated; the caller decides how
/// fatal they are.
pub async fn detach_interface(netns_path: &Path, ifname: &str) -> Result<()> {
    let ifname = ifname.to_string();
    let path_display = netns_path.display().to_string();
    netns::within_netns(netns_path, move || {
        detach_in_current_ns(&ifname)
            .with_context(|| format!("eBPF detach failed for {} in {}", ifname, path_display))
    })
    .await
}

/// the in-namespace pass; the calling thread is already pinned
fn detach_in_current_ns(ifname: &str) -> Result<()> {
    let ifindex = nix::net::if_::if_nametoindex(ifname)
        .with_context(|| format!("failed to resolve ifindex of {}", ifname))?;

    let mut errors = Vec::new();

    for (label, minor) in [
        ("ingress", CLSACT_INGRESS_MINOR),
        ("egress", CLSACT_EGRESS_MINOR),
    ] {
        if let Err(err) = remove_tc_bpf_filters(ifindex as i32, minor) {
            errors.push(format!("tc {}: {}", label, err));
        }
    }

    for (label, attach_type) in [
        ("tcx ingress", BPF_TCX_INGRESS),
        ("tcx egress", BPF_TCX_EGRESS),
    ] {
        if let Err(err) = detach_tcx(ifindex, attach_type) {
            errors.push(format!("{}: {}", label, err));
        }
    }

    if let Err(err) = clear_xdp(ifindex as i32) {
        errors.push(format!("xdp: {}", err));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("{}", errors.join("; "))
    }
}

/// dump the classic TC filters on one clsact parent and delete the
/// bpf-classified ones
fn remove_tc_bpf_filters(ifindex: i32, parent_minor: u16) -> Result<()> {
    let mut request = TcMessage::default();
    request.header.index = ifindex;
    request.header.parent = TcHandle {
        major: CLSACT_MAJOR,
        minor: parent_minor,
    };

    let filters = match netlink::request(
        NETLINK_ROUTE,
        RouteNetlinkMessage::GetTrafficFilter(request),
        true,
    ) {
        Ok(replies) => replies,
        // no clsact qdisc means no filters to clean
        Err(err) if netlink::errno(&err).is_some() => return Ok(()),
        Err(err) => return Err(err),
    };

    for reply in filters {
        let RouteNetlinkMessage::NewTrafficFilter(filter) = reply else {
            continue;
        };
        let is_bpf = filter
            .attributes
            .iter()
            .any(|attr| matches!(attr, TcAttribute::Kind(kind) if kind == "bpf"));
        if !is_bpf {
            continue;
        }

        let mut del = TcMessage::default();
        del.header = filter.header.clone();
        netlink::request(
            NETLINK_ROUTE,
            RouteNetlinkMessage::DelTrafficFilter(del),
            false,
        )
        .with_context(|| format!("failed to delete bpf filter on ifindex {}", ifindex))?;
        debug!("removed tc bpf filter from ifindex {}", ifindex);
    }

    Ok(())
}

/// query and detach TCX programs for one direction
fn detach_tcx(ifindex: u32, attach_type: u32) -> Result<()> {
    let ids = sys::prog_query(ifindex, attach_type)?;
    let mut errors = Vec::new();

    for id in ids {
        match sys::prog_get_fd_by_id(id) {
            Ok(fd) => {
                if let Err(err) = sys::prog_detach(ifindex, attach_type, fd) {
                    errors.push(format!("program {}: {}", id, err));
                } else {
                    debug!("detached tcx program {} from ifindex {}", id, ifindex);
                }
                sys::close(fd);
            }
            Err(err) => errors.push(format!("program {}: {}", id, err)),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("{}", errors.join("; "))
    }
}

/// drop any XDP program by setting the fd attribute to -1
fn clear_xdp(ifindex: i32) -> Result<()> {
    let mut message = LinkMessage::default();
    message.header.index = ifindex as u32;
    message
        .attributes
        .push(LinkAttribute::Xdp(vec![LinkXdp::Fd(-1)]));
    netlink::request(NETLINK_ROUTE, RouteNetlinkMessage::SetLink(message), false)
        .context("failed to clear xdp program")?;
    Ok(())
}

/// Walk a pinned-object root in the host namespace and detach + unpin every
/// pinned TCX/XDP/netkit link targeting `ifindex`. Runs during claim
/// preparation so the sandbox hot path never touches the filesystem.
pub fn detach_pinned_links(bpf_root: &Path, ifindex: u32) -> Result<()> {
    let mut pins = Vec::new();
    collect_pins(bpf_root, &mut pins);

    let mut errors = Vec::new();
    for pin in pins {
        if let Err(err) = try_detach_pin(&pin, ifindex) {
            errors.push(format!("{}: {}", pin.display(), err));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("{}", errors.join("; "))
    }
}

fn collect_pins(dir: &Path, pins: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_pins(&path, pins);
        } else {
            pins.push(path);
        }
    }
}

fn try_detach_pin(pin: &Path, ifindex: u32) -> Result<()> {
    let fd = match sys::obj_get(pin) {
        Ok(fd) => fd,
        // not every pinned object is openable by us; skip quietly
        Err(_) => return Ok(()),
    };
    let result = (|| {
        if !sys::is_link_fd(fd) {
            return Ok(());
        }
        let link = sys::link_info(fd)?;
        let interface_link = matches!(
            link.link_type,
            BPF_LINK_TYPE_XDP | BPF_LINK_TYPE_TCX | BPF_LINK_TYPE_NETKIT
        );
        if !interface_link || link.ifindex != ifindex {
            return Ok(());
        }

        // unpin first so nothing can re-resolve the link mid-teardown
        fs::remove_file(pin).with_context(|| format!("failed to unpin {}", pin.display()))?;
        sys::link_detach(fd)?;
        info!(
            "detached pinned bpf link {} (program {}) from ifindex {}",
            link.id, link.prog_id, ifindex
        );
        Ok(())
    })();
    sys::close(fd);
    result
}

/// Names of bpf programs attached to an interface, for the inventory
/// attributes. A program whose name cannot be read is reported by id;
/// errors degrade to an empty list.
pub fn attached_program_names(ifname: &str) -> Vec<String> {
    let Ok(ifindex) = nix::net::if_::if_nametoindex(ifname) else {
        return Vec::new();
    };
    let mut ids = Vec::new();
    for attach_type in [BPF_TCX_INGRESS, BPF_TCX_EGRESS] {
        if let Ok(mut found) = sys::prog_query(ifindex, attach_type) {
            ids.append(&mut found);
        }
    }
    ids.sort_unstable();
    ids.dedup();

    ids.into_iter()
        .map(|id| match sys::prog_get_fd_by_id(id) {
            Ok(fd) => {
                let name = sys::prog_name(fd).ok().filter(|name| !name.is_empty());
                sys::close(fd);
                name.unwrap_or_else(|| id.to_string())
            }
            Err(_) => id.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_pins_walks_tree() {
        let root = std::env::temp_dir().join(format!("charon-bpf-{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(root.join("tc/globals")).unwrap();
        fs::write(root.join("prog_a"), b"").unwrap();
        fs::write(root.join("tc/globals/link_b"), b"").unwrap();

        let mut pins = Vec::new();
        collect_pins(&root, &mut pins);
        pins.sort();
        assert_eq!(pins.len(), 2);
        assert!(pins[0].ends_with("prog_a") || pins[1].ends_with("prog_a"));
    }

    #[test]
    fn test_collect_pins_missing_root() {
        let mut pins = Vec::new();
        collect_pins(Path::new("/definitely/not/here"), &mut pins);
        assert!(pins.is_empty());
    }

    #[test]
    fn test_clsact_parents() {
        // the well-known clsact minors; a mismatch would silently dump the
        // wrong filter chain
        assert_eq!(CLSACT_MAJOR, 0xffff);
        assert_eq!(CLSACT_INGRESS_MINOR, 0xfff2);
        assert_eq!(CLSACT_EGRESS_MINOR, 0xfff3);
    }
}
