//! End-to-end tests against real kernel namespaces.
//!
//! Provisioning requires CAP_SYS_ADMIN/CAP_NET_ADMIN (typically root).
//! Every test consults the environment probe first and skips, rather than
//! fails, on hosts that cannot run the fixtures.

use std::fs::File;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::sync::Once;

use futures_util::TryStreamExt;
use ipnetwork::Ipv4Network;
use netrig::{
    AddressError, NO_INTERFACE, NetNs, Readiness, RigError, VethPair, add_address,
    bind_to_interface, check_environment, create_socket, remove_address, resolve_ifname,
};
use nix::errno::Errno;
use nix::sys::socket::{
    AddressFamily, MsgFlags, SockaddrIn, bind, recvfrom, sendto, setsockopt, sockopt,
};
use nix::sys::time::TimeVal;

static INIT: Once = Once::new();

async fn ready() -> bool {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
    let readiness = check_environment().await.expect("environment probe");
    if let Some(reason) = readiness.as_unsupported() {
        eprintln!("skipping: {reason}");
        return false;
    }
    true
}

/// Number of links visible in the namespace this test thread runs in.
async fn local_link_count() -> usize {
    let (connection, handle, _) = rtnetlink::new_connection().expect("netlink connection");
    tokio::spawn(connection);
    let mut links = handle.link().get().execute();
    let mut count = 0;
    while links.try_next().await.expect("link dump").is_some() {
        count += 1;
    }
    count
}

#[tokio::test]
async fn probe_reports_a_definite_answer() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
    // Whatever the privilege level, the probe must classify the host
    // rather than error out.
    match check_environment().await.expect("environment probe") {
        Readiness::Ready => {
            VethPair::create().await.expect("ready host must provision");
        }
        Readiness::Unsupported { reason } => assert!(!reason.is_empty()),
    }
}

#[tokio::test]
async fn veth_ends_have_distinct_identities() {
    if !ready().await {
        return;
    }

    let pair = VethPair::create().await.unwrap();
    assert_ne!(pair.parent.ifindex, NO_INTERFACE);
    assert_ne!(pair.child.ifindex, NO_INTERFACE);
    assert_ne!(
        pair.parent.mac.octets(),
        pair.child.mac.octets(),
        "the two ends must carry their own hardware addresses"
    );
}

#[tokio::test]
async fn sockets_are_scoped_to_their_namespace() {
    if !ready().await {
        return;
    }

    let pair = VethPair::create().await.unwrap();
    let parent_sock = create_socket(&pair.parent.netns, AddressFamily::Inet, NO_INTERFACE).unwrap();
    let child_sock = create_socket(&pair.child.netns, AddressFamily::Inet, NO_INTERFACE).unwrap();

    // Each socket resolves its own namespace's view of the index space.
    let parent_name = resolve_ifname(&parent_sock, pair.parent.ifindex).unwrap();
    let child_name = resolve_ifname(&child_sock, pair.child.ifindex).unwrap();
    assert!(parent_name.starts_with("vp-"), "got {parent_name}");
    assert!(child_name.starts_with("vc-"), "got {child_name}");
}

#[tokio::test]
async fn bind_restricts_and_sentinel_clears() {
    if !ready().await {
        return;
    }

    let pair = VethPair::create().await.unwrap();
    let sock = create_socket(&pair.parent.netns, AddressFamily::Inet, NO_INTERFACE).unwrap();

    bind_to_interface(&sock, pair.parent.ifindex).unwrap();
    let bound = nix::sys::socket::getsockopt(&sock, sockopt::BindToDevice).unwrap();
    let expected = resolve_ifname(&sock, pair.parent.ifindex).unwrap();
    assert_eq!(
        bound.to_string_lossy().trim_end_matches('\0'),
        expected,
        "both bind mechanisms must land on the same device"
    );

    bind_to_interface(&sock, NO_INTERFACE).unwrap();
    let cleared = nix::sys::socket::getsockopt(&sock, sockopt::BindToDevice).unwrap();
    assert!(cleared.to_string_lossy().trim_end_matches('\0').is_empty());
}

#[tokio::test]
async fn datagrams_cross_the_pair_both_ways() {
    if !ready().await {
        return;
    }

    let pair = VethPair::create().await.unwrap();
    let parent_net: Ipv4Network = "10.210.7.1/24".parse().unwrap();
    let child_net: Ipv4Network = "10.210.7.2/24".parse().unwrap();

    add_address(
        &pair.parent.netns,
        pair.parent.ifindex,
        parent_net.ip(),
        parent_net.prefix(),
    )
    .await
    .unwrap();
    add_address(
        &pair.child.netns,
        pair.child.ifindex,
        child_net.ip(),
        child_net.prefix(),
    )
    .await
    .unwrap();

    let sender = create_socket(&pair.parent.netns, AddressFamily::Inet, pair.parent.ifindex).unwrap();
    let receiver = create_socket(&pair.child.netns, AddressFamily::Inet, pair.child.ifindex).unwrap();

    let timeout = TimeVal::new(3, 0);
    setsockopt(&sender, sockopt::ReceiveTimeout, &timeout).unwrap();
    setsockopt(&receiver, sockopt::ReceiveTimeout, &timeout).unwrap();

    let dest = SockaddrIn::new(10, 210, 7, 2, 47119);
    bind(receiver.as_raw_fd(), &dest).unwrap();

    sendto(sender.as_raw_fd(), b"ping", &dest, MsgFlags::empty()).unwrap();

    let mut buf = [0u8; 16];
    let (len, from) = recvfrom::<SockaddrIn>(receiver.as_raw_fd(), &mut buf).unwrap();
    assert_eq!(&buf[..len], b"ping");

    // And back again, to the sender's source address.
    let from = from.expect("datagram carries a source address");
    sendto(receiver.as_raw_fd(), b"pong", &from, MsgFlags::empty()).unwrap();
    let (len, _) = recvfrom::<SockaddrIn>(sender.as_raw_fd(), &mut buf).unwrap();
    assert_eq!(&buf[..len], b"pong");
}

#[tokio::test]
async fn address_add_remove_round_trips() {
    if !ready().await {
        return;
    }

    let pair = VethPair::create().await.unwrap();
    let addr = Ipv4Addr::new(192, 0, 2, 1);

    add_address(&pair.parent.netns, pair.parent.ifindex, addr, 28)
        .await
        .unwrap();

    // A second add of the same tuple must surface the kernel's EEXIST.
    let err = add_address(&pair.parent.netns, pair.parent.ifindex, addr, 28)
        .await
        .unwrap_err();
    assert_eq!(err.kernel_code(), Some(Errno::EEXIST));

    remove_address(&pair.parent.netns, pair.parent.ifindex, addr, 28)
        .await
        .unwrap();

    // Gone again: removing once more reports not-present.
    let err = remove_address(&pair.parent.netns, pair.parent.ifindex, addr, 28)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RigError::Address(AddressError::NotPresent { .. })
    ));
}

#[tokio::test]
async fn remove_respects_the_prefix_length() {
    if !ready().await {
        return;
    }

    let pair = VethPair::create().await.unwrap();
    let addr = Ipv4Addr::new(192, 0, 2, 17);

    add_address(&pair.parent.netns, pair.parent.ifindex, addr, 24)
        .await
        .unwrap();

    // Same address, different prefix: not the binding we created.
    let err = remove_address(&pair.parent.netns, pair.parent.ifindex, addr, 16)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RigError::Address(AddressError::NotPresent { .. })
    ));

    remove_address(&pair.parent.netns, pair.parent.ifindex, addr, 24)
        .await
        .unwrap();
}

#[tokio::test]
async fn failed_move_unwinds_without_leaking() {
    if !ready().await {
        return;
    }

    let before = local_link_count().await;

    // A descriptor that is not a network namespace makes the move step
    // fail after the pair has been created.
    let bogus = NetNs::from_fd(File::open("/dev/null").unwrap().into());
    let err = VethPair::create_in(&bogus).await.unwrap_err();
    assert!(
        err.kernel_code().is_some(),
        "primary kernel error must survive the rollback: {err}"
    );

    // Nothing new may be reachable from the namespace we run in.
    let after = local_link_count().await;
    assert_eq!(before, after);
}

#[tokio::test]
async fn current_namespace_handle_scopes_sockets() {
    if !ready().await {
        return;
    }

    // A handle to the namespace we already run in behaves like any other.
    let host = NetNs::current().unwrap();
    let sock = create_socket(&host, AddressFamily::Inet, NO_INTERFACE).unwrap();
    assert_eq!(resolve_ifname(&sock, 1).unwrap(), "lo");
}

#[tokio::test]
async fn child_end_lands_in_a_supplied_namespace() {
    if !ready().await {
        return;
    }

    let existing = NetNs::create().await.unwrap();
    let pair = VethPair::create_in(&existing).await.unwrap();

    let sock = create_socket(&existing, AddressFamily::Inet, NO_INTERFACE).unwrap();
    let name = resolve_ifname(&sock, pair.child.ifindex).unwrap();
    assert!(name.starts_with("vc-"), "got {name}");
}
