//! IPv4 address configuration inside a namespace.

use std::net::{IpAddr, Ipv4Addr};

use futures_util::TryStreamExt;
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use tracing::debug;

use crate::RigResult;
use crate::error::AddressError;
use crate::netns::{NetNs, handle_in};

/// Adds `addr/prefix` to the interface `ifindex` inside `netns`.
///
/// Several addresses may coexist on one interface. Re-adding an address
/// that is already present is an error to the kernel (EEXIST) and is
/// surfaced as one, never swallowed. The call returns once the kernel has
/// applied or rejected the change.
pub async fn add_address(
    netns: &NetNs,
    ifindex: u32,
    addr: Ipv4Addr,
    prefix: u8,
) -> RigResult<()> {
    let handle = handle_in(netns)?;
    handle
        .address()
        .add(ifindex, IpAddr::V4(addr), prefix)
        .execute()
        .await
        .map_err(|source| AddressError::Add {
            ifindex,
            addr,
            prefix,
            source,
        })?;
    debug!(%addr, prefix, ifindex, "address added");
    Ok(())
}

/// Removes `addr/prefix` from the interface `ifindex` inside `netns`.
///
/// Fails with [`AddressError::NotPresent`] when the address is not
/// currently configured on that interface.
pub async fn remove_address(
    netns: &NetNs,
    ifindex: u32,
    addr: Ipv4Addr,
    prefix: u8,
) -> RigResult<()> {
    let handle = handle_in(netns)?;

    let mut dump = handle
        .address()
        .get()
        .set_link_index_filter(ifindex)
        .execute();
    let mut target = None;
    while let Some(message) = dump.try_next().await.map_err(|source| AddressError::Dump {
        ifindex,
        source,
    })? {
        if message.header.prefix_len == prefix && carries(&message, addr) {
            target = Some(message);
            break;
        }
    }

    let Some(message) = target else {
        return Err(AddressError::NotPresent {
            ifindex,
            addr,
            prefix,
        }
        .into());
    };

    handle
        .address()
        .del(message)
        .execute()
        .await
        .map_err(|source| AddressError::Remove {
            ifindex,
            addr,
            prefix,
            source,
        })?;
    debug!(%addr, prefix, ifindex, "address removed");
    Ok(())
}

// IPv4 unicast addresses land in IFA_LOCAL; IFA_ADDRESS holds the peer on
// point-to-point links. Either attribute counts as carrying the address.
fn carries(message: &AddressMessage, addr: Ipv4Addr) -> bool {
    message.attributes.iter().any(|attribute| match attribute {
        AddressAttribute::Address(ip) | AddressAttribute::Local(ip) => *ip == IpAddr::V4(addr),
        _ => false,
    })
}
