//! Handles to kernel network namespaces.
//!
//! A namespace created here is anonymous: it is never bind-mounted under
//! `/var/run/netns` and is kept alive solely by the descriptor wrapped in
//! [`NetNs`]. Closing the last descriptor (and having no process inside)
//! lets the kernel reap the namespace and everything in it.

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::sched::{CloneFlags, setns, unshare};
use nix::unistd::gettid;
use rtnetlink::Handle;
use tracing::{debug, error};

use crate::RigResult;
use crate::error::{LinkError, NamespaceError};

/// Loopback is the first interface registered in every fresh namespace.
const LO_IFINDEX: u32 = 1;

/// An open descriptor referring to a kernel network namespace.
#[derive(Debug)]
pub struct NetNs {
    fd: OwnedFd,
}

impl NetNs {
    /// Opens the network namespace the calling thread currently runs in.
    pub fn current() -> RigResult<Self> {
        Ok(Self {
            fd: open_thread_ns()?,
        })
    }

    /// Creates a fresh network namespace and returns the thread to the one
    /// it was in.
    ///
    /// The returned descriptor is the only reference keeping the new
    /// namespace alive. Its loopback interface is brought up, the same way
    /// a freshly powered-on device would have it.
    pub async fn create() -> RigResult<Self> {
        let origin = open_thread_ns()?;

        let fresh = unshare(CloneFlags::CLONE_NEWNET)
            .map_err(|source| NamespaceError::Unshare { source })
            .and_then(|()| open_thread_ns());

        // The thread goes back where it came from no matter how the
        // allocation went.
        let restored = setns(origin.as_fd(), CloneFlags::CLONE_NEWNET)
            .map_err(|source| NamespaceError::Restore { source });

        let netns = Self { fd: fresh? };
        restored?;
        debug!("created network namespace");

        crate::link::link_up(&netns, LO_IFINDEX).await?;
        Ok(netns)
    }

    /// Adopts an existing namespace descriptor, e.g. one opened from
    /// `/proc/<pid>/ns/net` of a process already inside the target
    /// namespace.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Duplicates the descriptor; both handles then keep the namespace
    /// alive independently.
    pub fn try_clone(&self) -> RigResult<Self> {
        let fd = self
            .fd
            .try_clone()
            .map_err(|source| NamespaceError::Clone { source })?;
        Ok(Self { fd })
    }

    /// Switches the calling thread into this namespace.
    ///
    /// Namespace association is per-thread: the caller must finish all
    /// namespace-sensitive work on this thread before the guard goes away,
    /// and must not run unrelated namespace-scoped operations concurrently
    /// on it.
    pub fn enter(&self) -> RigResult<NsGuard> {
        let origin = open_thread_ns()?;
        setns(self.fd.as_fd(), CloneFlags::CLONE_NEWNET)
            .map_err(|source| NamespaceError::Enter { source })?;
        Ok(NsGuard {
            origin: Some(origin),
        })
    }
}

impl AsFd for NetNs {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for NetNs {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Returns the calling thread to its previous namespace, on [`NsGuard::exit`]
/// or on drop.
#[must_use = "dropping the guard immediately leaves the namespace again"]
pub struct NsGuard {
    origin: Option<OwnedFd>,
}

impl NsGuard {
    /// Restores the previous namespace, surfacing a failure to do so.
    pub fn exit(mut self) -> RigResult<()> {
        match self.origin.take() {
            Some(origin) => setns(origin.as_fd(), CloneFlags::CLONE_NEWNET)
                .map_err(|source| NamespaceError::Restore { source }.into()),
            None => Ok(()),
        }
    }
}

impl Drop for NsGuard {
    fn drop(&mut self) {
        if let Some(origin) = self.origin.take()
            && let Err(err) = setns(origin.as_fd(), CloneFlags::CLONE_NEWNET)
        {
            error!(%err, "unable to restore the original network namespace");
        }
    }
}

/// Opens an rtnetlink channel scoped to `netns`.
///
/// The netlink socket is created while the calling thread sits inside the
/// namespace and stays bound to it afterwards, so requests issued through
/// the returned handle configure that namespace regardless of which
/// namespace the thread is in by then.
pub(crate) fn handle_in(netns: &NetNs) -> RigResult<Handle> {
    let guard = netns.enter()?;
    let connection =
        rtnetlink::new_connection().map_err(|source| LinkError::ConnectionFailed { source });
    let restored = guard.exit();
    let (connection, handle, _) = connection?;
    restored?;
    tokio::spawn(connection);
    Ok(handle)
}

/// The per-task path: `setns` moves single threads, so the process-wide
/// `/proc/self/ns/net` can disagree with where this thread actually is.
fn open_thread_ns() -> Result<OwnedFd, NamespaceError> {
    let path = format!("/proc/self/task/{}/ns/net", gettid());
    let file = File::open(&path).map_err(|source| NamespaceError::Open { path, source })?;
    Ok(file.into())
}
