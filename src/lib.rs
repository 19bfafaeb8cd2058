//! Disposable kernel network topologies for exercising networking code in
//! tests: anonymous network namespaces wired together with veth pairs,
//! addressed, and sockets scoped to a chosen namespace and interface.
//!
//! Everything this crate creates lives only as long as the handles it
//! returns; dropping the last [`NetNs`] descriptor for a namespace lets the
//! kernel destroy it together with every interface inside.

pub mod addr;
pub mod error;
pub mod link;
pub mod netns;
pub mod probe;
pub mod sock;

pub use addr::{add_address, remove_address};
pub use error::{AddressError, LinkError, NamespaceError, RigError, SockError};
pub use link::{MacAddr, VethEnd, VethPair, link_up};
pub use netns::{NetNs, NsGuard};
pub use probe::{Readiness, check_environment};
pub use sock::{NO_INTERFACE, bind_to_interface, create_socket, resolve_ifname};

pub type RigResult<T> = std::result::Result<T, error::RigError>;
