//! Network-namespace handles and thread pinning.
//!
//! A handful of operations (DHCP, eBPF detach, in-namespace netlink sockets)
//! must run with the calling OS thread switched into the pod's network
//! namespace. Switching a shared async worker thread would leak the
//! namespace into unrelated tasks, so every switch happens on a dedicated
//! blocking thread under a guard that restores the original namespace on
//! every exit path, panics included.

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::sched::{CloneFlags, setns};
use tracing::debug;

/// path of the calling thread's own network namespace
const SELF_NS_NET: &str = "/proc/self/ns/net";

/// An open network-namespace file descriptor.
///
/// The fd is owned; dropping the handle closes it. Operations that need the
/// namespace take the handle by reference and never outlive it.
#[derive(Debug)]
pub struct NetnsHandle {
    file: File,
    path: PathBuf,
}

impl NetnsHandle {
    /// Open a namespace by filesystem path (e.g. `/run/netns/<name>` or
    /// `/proc/<pid>/ns/net`).
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open network namespace {}", path.display()))?;
        Ok(NetnsHandle {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Open the current namespace, used as the restore target and as the
    /// root-namespace destination for detach.
    pub fn current() -> Result<Self> {
        Self::open(Path::new(SELF_NS_NET))
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Scope guard that switches the calling thread into a target namespace and
/// restores the original on drop.
pub struct NetnsGuard {
    original: File,
}

impl NetnsGuard {
    /// Enter the namespace behind `target`. Must only be called on a thread
    /// no async task shares, i.e. inside `spawn_blocking`.
    pub fn enter(target: &NetnsHandle) -> Result<Self> {
        let original = File::open(SELF_NS_NET).context("failed to open current netns")?;
        setns(target.file.as_fd(), CloneFlags::CLONE_NEWNET).with_context(|| {
            format!("failed to enter network namespace {}", target.path.display())
        })?;
        debug!("entered network namespace {}", target.path.display());
        Ok(NetnsGuard { original })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        // the restore must survive unwinding; there is no way to report
        // failure from here, and a thread stuck in a foreign namespace is
        // worse than an abort
        if let Err(err) = setns(self.original.as_fd(), CloneFlags::CLONE_NEWNET) {
            panic!("failed to restore network namespace: {}", err);
        }
    }
}

/// Run `f` on a blocking thread pinned inside the namespace at `path`.
pub async fn within_netns<T, F>(path: &Path, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let handle = NetnsHandle::open(path)?;
    tokio::task::spawn_blocking(move || {
        let _guard = NetnsGuard::enter(&handle)?;
        f()
    })
    .await
    .context("in-namespace task panicked")?
}

/// Open an rtnetlink connection whose socket lives inside the namespace at
/// `path`. The socket keeps the namespace it was created in, so only the
/// creation needs pinning; the connection is then driven from the async
/// runtime as usual.
pub async fn rtnetlink_in(path: &Path) -> Result<rtnetlink::Handle> {
    let handle = NetnsHandle::open(path)?;
    let (connection, rt_handle, _messages) = tokio::task::spawn_blocking(move || {
        let _guard = NetnsGuard::enter(&handle)?;
        rtnetlink::new_connection().context("failed to open in-namespace netlink connection")
    })
    .await
    .context("in-namespace task panicked")??;
    tokio::spawn(connection);
    Ok(rt_handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_namespace() {
        let err = NetnsHandle::open(Path::new("/run/netns/definitely-not-here")).unwrap_err();
        assert!(err.to_string().contains("definitely-not-here"));
    }

    #[test]
    fn test_current_namespace_opens() {
        let handle = NetnsHandle::current().unwrap();
        assert!(handle.raw_fd() >= 0);
        assert_eq!(handle.path(), Path::new(SELF_NS_NET));
    }
}
