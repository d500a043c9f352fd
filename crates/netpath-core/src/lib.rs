//! Linux socket toolkit: a managed fd lifecycle, a packed `Address` value,
//! a fluent `Socket` builder, ancillary-data parsing, vectorised
//! `recvmmsg`/`sendmmsg` I/O, an `epoll` readiness poller, and an active
//! UDP path-MTU prober/echoer.
//!
//! Linux-only — every module below reaches for `epoll`, `recvmmsg`,
//! `IP_MTU_DISCOVER`, or another Linux-specific syscall/option at some
//! point, so this crate does not build a portable fallback; see DESIGN.md.

#[cfg(not(target_os = "linux"))]
compile_error!("netpath-core only builds for Linux: it uses epoll, recvmmsg/sendmmsg, and IP_MTU_DISCOVER directly");

pub mod address;
pub mod cmsg;
pub mod deadline;
pub mod dscp;
pub mod endpoint;
pub mod error;
pub mod managed_fd;
pub mod mtu;
pub mod poller;
pub mod resolve;
pub mod socket;

pub use address::{Address, SockaddrView};
pub use cmsg::{CmsgLens, SockExtendedErr};
pub use deadline::Deadliner;
pub use endpoint::Endpoint;
pub use error::{NetError, NetResult};
pub use managed_fd::{ManagedFd, ReleaseState};
pub use mtu::{MtuEchoer, MtuProber, Telemetry};
pub use poller::{Polled, Poller};
pub use socket::{MtuDiscover, Socket};
