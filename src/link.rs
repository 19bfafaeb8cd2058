//! Veth pair provisioning across namespaces.
//!
//! Namespace allocation, device creation and the move into the peer
//! namespace are one logical transaction: a failure at any step unwinds
//! what was already created before the error is reported. The pair is
//! created *inside* the fresh parent namespace, so nothing can leak into
//! the namespace the caller runs in.

use std::fmt;
use std::os::fd::AsRawFd;

use futures_util::TryStreamExt;
use netlink_packet_route::link::LinkAttribute;
use rand::Rng;
use rand::distributions::Alphanumeric;
use rtnetlink::{Handle, LinkUnspec, LinkVeth};
use tracing::{debug, error};

use crate::RigResult;
use crate::error::LinkError;
use crate::netns::{NetNs, handle_in};

/// EUI-48 hardware address of a network interface.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// One end of a veth pair: the namespace it lives in and its identity
/// within that namespace.
///
/// The index and hardware address are only meaningful as seen from inside
/// `netns`; the peer end has its own, unrelated pair of values.
#[derive(Debug)]
pub struct VethEnd {
    pub netns: NetNs,
    pub ifindex: u32,
    pub mac: MacAddr,
}

/// A connected pair of virtual interfaces spanning two namespaces, the
/// sole L2 path between them.
///
/// Dropping the pair drops its namespace descriptors; once no other
/// reference keeps a namespace alive the kernel destroys it along with
/// the veth end inside, which tears down the peer end as well.
#[derive(Debug)]
pub struct VethPair {
    pub parent: VethEnd,
    pub child: VethEnd,
}

impl VethPair {
    /// Provisions a veth pair across two freshly created namespaces.
    pub async fn create() -> RigResult<Self> {
        let child = NetNs::create().await?;
        Self::create_in(&child).await
    }

    /// Provisions a veth pair with the parent end in a freshly created
    /// namespace and the child end moved into the existing `child_ns`.
    ///
    /// On failure every object created by this call is torn down before
    /// the error is reported; `child_ns` itself belongs to the caller and
    /// is left alone.
    pub async fn create_in(child_ns: &NetNs) -> RigResult<Self> {
        let parent_ns = NetNs::create().await?;
        let child_clone = child_ns.try_clone()?;
        let handle = handle_in(&parent_ns)?;

        let parent_name = random_ifname("vp");
        let child_name = random_ifname("vc");

        // A failure up to and including this step leaves only the fresh
        // parent namespace, which dies with `parent_ns`.
        handle
            .link()
            .add(LinkVeth::new(&parent_name, &child_name).build())
            .execute()
            .await
            .map_err(|source| LinkError::Create {
                name: parent_name.clone(),
                peer: child_name.clone(),
                source,
            })?;

        match wire(&handle, child_ns, &parent_name, &child_name).await {
            Ok((parent, child)) => {
                debug!(
                    parent_ifindex = parent.0,
                    parent_mac = %parent.1,
                    child_ifindex = child.0,
                    child_mac = %child.1,
                    "veth pair provisioned"
                );
                Ok(Self {
                    parent: VethEnd {
                        netns: parent_ns,
                        ifindex: parent.0,
                        mac: parent.1,
                    },
                    child: VethEnd {
                        netns: child_clone,
                        ifindex: child.0,
                        mac: child.1,
                    },
                })
            }
            Err(err) => {
                unwind(&handle, &parent_name).await;
                Err(err)
            }
        }
    }
}

/// Brings the interface `ifindex` administratively up inside `netns`.
pub async fn link_up(netns: &NetNs, ifindex: u32) -> RigResult<()> {
    let handle = handle_in(netns)?;
    set_link_up(&handle, ifindex).await
}

/// Moves the child end over, resolves both identities and brings both
/// ends up. Runs after the pair exists, so the caller can unwind it as a
/// unit on failure.
async fn wire(
    parent: &Handle,
    child_ns: &NetNs,
    parent_name: &str,
    child_name: &str,
) -> RigResult<((u32, MacAddr), (u32, MacAddr))> {
    let (parent_index, parent_mac) = link_identity(parent, parent_name).await?;
    let (move_index, _) = link_identity(parent, child_name).await?;

    parent
        .link()
        .set(
            LinkUnspec::new_with_index(move_index)
                .setns_by_fd(child_ns.as_raw_fd())
                .build(),
        )
        .execute()
        .await
        .map_err(|source| LinkError::Move {
            ifindex: move_index,
            source,
        })?;

    // The move may renumber the interface; its identity is only
    // authoritative as seen from inside the child namespace.
    let child = handle_in(child_ns)?;
    let (child_index, child_mac) = link_identity(&child, child_name).await?;

    set_link_up(parent, parent_index).await?;
    set_link_up(&child, child_index).await?;

    Ok(((parent_index, parent_mac), (child_index, child_mac)))
}

async fn link_identity(handle: &Handle, name: &str) -> RigResult<(u32, MacAddr)> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    let message = links
        .try_next()
        .await
        .map_err(|source| LinkError::Query {
            name: name.to_string(),
            source,
        })?
        .ok_or_else(|| LinkError::NotFound {
            name: name.to_string(),
        })?;

    let index = message.header.index;
    for attribute in message.attributes {
        if let LinkAttribute::Address(octets) = attribute
            && let Ok(mac) = <[u8; 6]>::try_from(octets.as_slice())
        {
            return Ok((index, MacAddr::from(mac)));
        }
    }
    Err(LinkError::NoHardwareAddress {
        name: name.to_string(),
    }
    .into())
}

async fn set_link_up(handle: &Handle, ifindex: u32) -> RigResult<()> {
    handle
        .link()
        .set(LinkUnspec::new_with_index(ifindex).up().build())
        .execute()
        .await
        .map_err(|source| LinkError::ChangeStateUp { ifindex, source })?;
    Ok(())
}

/// Best-effort rollback after a failed wiring step: deleting the parent
/// end removes the whole pair, wherever the peer end currently sits.
/// Secondary failures are logged and never replace the primary error.
async fn unwind(parent: &Handle, parent_name: &str) {
    let mut links = parent
        .link()
        .get()
        .match_name(parent_name.to_string())
        .execute();
    match links.try_next().await {
        Ok(Some(message)) => {
            if let Err(err) = parent.link().del(message.header.index).execute().await {
                error!(name = parent_name, %err, "rollback: unable to delete veth pair");
            }
        }
        Ok(None) => {}
        Err(err) => {
            error!(name = parent_name, %err, "rollback: unable to look up veth pair");
        }
    }
}

// Random suffix so several pairs can coexist and a leftover from a crashed
// run is recognizable. Stays well under the 15-byte interface name limit.
fn random_ifname(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("{prefix}-{suffix}")
}
