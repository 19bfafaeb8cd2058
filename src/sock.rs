//! Namespace-scoped sockets and socket-to-device binding.
//!
//! Two kernel mechanisms restrict a socket to one device: the newer
//! SO_BINDTOIFINDEX takes the interface index directly, the older
//! SO_BINDTODEVICE takes a name. Which one the running kernel offers is
//! probed at runtime on first use; the name-based fallback is never
//! treated as an error.

use std::ffi::CStr;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socket};
use tracing::debug;

use crate::RigResult;
use crate::error::SockError;
use crate::netns::NetNs;

/// Interface index 0 is the kernel's "no device" sentinel: binding to it
/// removes any existing device restriction. It never names a real
/// interface and is never resolved to a name.
pub const NO_INTERFACE: u32 = 0;

// Flipped once the running kernel answers SO_BINDTOIFINDEX with
// ENOPROTOOPT; later binds go straight to the name-based fallback.
static INDEX_BIND_UNSUPPORTED: AtomicBool = AtomicBool::new(false);

/// Resolves an interface index to its current name.
///
/// The SIOCGIFNAME ioctl is issued on `socket`, so the lookup is answered
/// by the namespace the socket was created in rather than the namespace of
/// the calling thread. The kernel guarantees the name fits IFNAMSIZ bytes
/// including the terminator, so the result is never truncated.
pub fn resolve_ifname<S: AsFd>(socket: S, ifindex: u32) -> RigResult<String> {
    let mut request: libc::ifreq = unsafe { std::mem::zeroed() };
    request.ifr_ifru.ifru_ifindex = ifindex as libc::c_int;

    let rc = unsafe {
        libc::ioctl(
            socket.as_fd().as_raw_fd(),
            libc::SIOCGIFNAME,
            &mut request,
        )
    };
    if rc < 0 {
        return Err(SockError::ResolveName {
            ifindex,
            source: Errno::last(),
        }
        .into());
    }

    let name = unsafe { CStr::from_ptr(request.ifr_name.as_ptr()) };
    Ok(name.to_string_lossy().into_owned())
}

/// Restricts `socket` to send and receive only via the interface
/// `ifindex`, or clears any existing restriction when `ifindex` is
/// [`NO_INTERFACE`].
///
/// SO_BINDTOIFINDEX is preferred where the kernel supports it: it takes
/// the index directly, while the SO_BINDTODEVICE fallback needs the index
/// resolved to a name first and the device could in principle be renamed
/// between the resolve and the bind. On the fallback path, index 0 becomes
/// the empty name, which the kernel reads as "drop the restriction".
pub fn bind_to_interface<S: AsFd>(socket: S, ifindex: u32) -> RigResult<()> {
    let fd = socket.as_fd().as_raw_fd();

    if !INDEX_BIND_UNSUPPORTED.load(Ordering::Relaxed) {
        match bind_by_index(fd, ifindex) {
            Ok(()) => return Ok(()),
            Err(Errno::ENOPROTOOPT) => {
                debug!("SO_BINDTOIFINDEX unavailable, using SO_BINDTODEVICE");
                INDEX_BIND_UNSUPPORTED.store(true, Ordering::Relaxed);
            }
            Err(source) => return Err(SockError::BindDevice { ifindex, source }.into()),
        }
    }

    let name = if ifindex == NO_INTERFACE {
        String::new()
    } else {
        resolve_ifname(&socket, ifindex)?
    };
    bind_by_name(fd, name.as_bytes())
        .map_err(|source| SockError::BindDevice { ifindex, source })?;
    Ok(())
}

/// Creates a datagram socket of `family` inside `netns`, bound to the
/// interface `ifindex` unless that is [`NO_INTERFACE`].
///
/// The calling thread switches into the namespace for the duration of the
/// `socket(2)` call; the descriptor stays scoped to that namespace for its
/// whole lifetime. On any failure the partially created socket is closed
/// before the error is reported.
pub fn create_socket(netns: &NetNs, family: AddressFamily, ifindex: u32) -> RigResult<OwnedFd> {
    let guard = netns.enter()?;
    let fd = match socket(family, SockType::Datagram, SockFlag::SOCK_CLOEXEC, None) {
        Ok(fd) => fd,
        Err(source) => return Err(SockError::Create { family, source }.into()),
    };
    guard.exit()?;

    if ifindex != NO_INTERFACE {
        bind_to_interface(&fd, ifindex)?;
    }
    debug!(?family, ifindex, "created namespace-scoped socket");
    Ok(fd)
}

fn bind_by_index(fd: RawFd, ifindex: u32) -> Result<(), Errno> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BINDTOIFINDEX,
            &ifindex as *const u32 as *const libc::c_void,
            size_of::<u32>() as libc::socklen_t,
        )
    };
    if rc < 0 { Err(Errno::last()) } else { Ok(()) }
}

fn bind_by_name(fd: RawFd, name: &[u8]) -> Result<(), Errno> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            name.as_ptr() as *const libc::c_void,
            name.len() as libc::socklen_t,
        )
    };
    if rc < 0 { Err(Errno::last()) } else { Ok(()) }
}
