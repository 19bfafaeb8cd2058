use std::net::Ipv4Addr;

use nix::errno::Errno;
use nix::sys::socket::AddressFamily;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum RigError {
    #[error(transparent)]
    Namespace(#[from] NamespaceError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Sock(#[from] SockError),
}

impl RigError {
    /// The kernel error code underlying this failure, when one exists.
    pub fn kernel_code(&self) -> Option<Errno> {
        match self {
            Self::Namespace(err) => match err {
                NamespaceError::Unshare { source }
                | NamespaceError::Enter { source }
                | NamespaceError::Restore { source } => Some(*source),
                NamespaceError::Open { source, .. } | NamespaceError::Clone { source } => {
                    source.raw_os_error().map(Errno::from_raw)
                }
            },
            Self::Link(err) => match err {
                LinkError::ConnectionFailed { source } => {
                    source.raw_os_error().map(Errno::from_raw)
                }
                LinkError::Create { source, .. }
                | LinkError::Query { source, .. }
                | LinkError::Move { source, .. }
                | LinkError::ChangeStateUp { source, .. } => netlink_errno(source),
                LinkError::NotFound { .. } | LinkError::NoHardwareAddress { .. } => None,
            },
            Self::Address(err) => match err {
                AddressError::Add { source, .. }
                | AddressError::Remove { source, .. }
                | AddressError::Dump { source, .. } => netlink_errno(source),
                AddressError::NotPresent { .. } => None,
            },
            Self::Sock(err) => match err {
                SockError::Create { source, .. }
                | SockError::ResolveName { source, .. }
                | SockError::BindDevice { source, .. } => Some(*source),
            },
        }
    }

    /// Classifies this error as a missing host capability, if the
    /// underlying kernel code says so. `Some` means dependent tests
    /// should be skipped rather than failed.
    pub fn capability_gap(&self) -> Option<&'static str> {
        match self.kernel_code()? {
            Errno::EPERM | Errno::EACCES => {
                Some("creating network namespaces requires CAP_SYS_ADMIN and CAP_NET_ADMIN")
            }
            Errno::ENOSYS => Some("kernel lacks namespace support"),
            Errno::EOPNOTSUPP => Some("kernel lacks veth device support"),
            // unshare(2) answers EINVAL when CLONE_NEWNET is not compiled in
            Errno::EINVAL if matches!(self, Self::Namespace(NamespaceError::Unshare { .. })) => {
                Some("kernel built without CONFIG_NET_NS")
            }
            _ => None,
        }
    }
}

#[derive(Debug, ThisError)]
pub enum NamespaceError {
    #[error("unable to unshare into a new network namespace")]
    Unshare { source: Errno },

    #[error("unable to open namespace descriptor {path}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    #[error("unable to duplicate namespace descriptor")]
    Clone { source: std::io::Error },

    #[error("unable to enter the target network namespace")]
    Enter { source: Errno },

    #[error("unable to restore the original network namespace")]
    Restore { source: Errno },
}

#[derive(Debug, ThisError)]
pub enum LinkError {
    #[error("unable to open an rtnetlink channel")]
    ConnectionFailed { source: std::io::Error },

    #[error("unable to create veth pair {name} <-> {peer}")]
    Create {
        name: String,
        peer: String,
        source: rtnetlink::Error,
    },

    #[error("unable to query interface {name}")]
    Query {
        name: String,
        source: rtnetlink::Error,
    },

    #[error("interface {name} is not visible in the target namespace")]
    NotFound { name: String },

    #[error("interface {name} carries no hardware address")]
    NoHardwareAddress { name: String },

    #[error("unable to move interface {ifindex} into the target namespace")]
    Move {
        ifindex: u32,
        source: rtnetlink::Error,
    },

    #[error("unable to bring up interface {ifindex}")]
    ChangeStateUp {
        ifindex: u32,
        source: rtnetlink::Error,
    },
}

#[derive(Debug, ThisError)]
pub enum AddressError {
    #[error("unable to add {addr}/{prefix} on interface {ifindex}")]
    Add {
        ifindex: u32,
        addr: Ipv4Addr,
        prefix: u8,
        source: rtnetlink::Error,
    },

    #[error("unable to remove {addr}/{prefix} from interface {ifindex}")]
    Remove {
        ifindex: u32,
        addr: Ipv4Addr,
        prefix: u8,
        source: rtnetlink::Error,
    },

    #[error("{addr}/{prefix} is not present on interface {ifindex}")]
    NotPresent {
        ifindex: u32,
        addr: Ipv4Addr,
        prefix: u8,
    },

    #[error("unable to list addresses on interface {ifindex}")]
    Dump {
        ifindex: u32,
        source: rtnetlink::Error,
    },
}

#[derive(Debug, ThisError)]
pub enum SockError {
    #[error("unable to create {family:?} socket")]
    Create { family: AddressFamily, source: Errno },

    #[error("unable to resolve interface {ifindex} to a name")]
    ResolveName { ifindex: u32, source: Errno },

    #[error("unable to bind socket to interface {ifindex}")]
    BindDevice { ifindex: u32, source: Errno },
}

fn netlink_errno(err: &rtnetlink::Error) -> Option<Errno> {
    match err {
        rtnetlink::Error::NetlinkError(message) => {
            let code = message.raw_code();
            (code < 0).then(|| Errno::from_raw(-code))
        }
        _ => None,
    }
}
