//! Error taxonomy for the whole crate.
//!
//! Five kinds, matching the five failure classes a caller actually needs to
//! branch on: bad arguments before a syscall, fd-lifecycle misuse, the
//! kernel itself, malformed ancillary data, and a fired deadline.

use std::fmt;
use std::io;

/// Crate-wide result alias.
pub type NetResult<T> = Result<T, NetError>;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Caller passed something the library can't act on before any syscall
    /// is attempted (missing address, bad MTU bounds, unknown DSCP name).
    #[error("{0}")]
    Argument(String),

    /// A `ManagedFd`/`Socket` operation was attempted from the wrong state
    /// (already initialised, not initialised, disabled).
    #[error("{0}")]
    Lifecycle(String),

    /// A syscall returned an error. Keeps the syscall name so the error
    /// prints as `bind: Address already in use (os error 98)` instead of
    /// a bare errno.
    #[error("{syscall}: {source}")]
    Kernel {
        syscall: &'static str,
        #[source]
        source: io::Error,
    },

    /// A decode invariant from an ABI-level structure (cmsg, sockaddr) was
    /// violated: undersized buffer, unknown family.
    #[error("{0}")]
    Protocol(String),

    /// An armed `Deadliner` fired; surfaces on the next operation against
    /// the now-disabled fd.
    #[error("operation deadline exceeded")]
    Timeout,
}

impl NetError {
    pub fn kernel(syscall: &'static str, source: io::Error) -> Self {
        NetError::Kernel { syscall, source }
    }

    pub fn argument(msg: impl fmt::Display) -> Self {
        NetError::Argument(msg.to_string())
    }

    pub fn lifecycle(msg: impl fmt::Display) -> Self {
        NetError::Lifecycle(msg.to_string())
    }

    pub fn protocol(msg: impl fmt::Display) -> Self {
        NetError::Protocol(msg.to_string())
    }

    /// `errno` of the underlying OS error, if this is a `Kernel` error.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            NetError::Kernel { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    pub fn is_errno(&self, errno: i32) -> bool {
        self.raw_os_error() == Some(errno)
    }

    pub fn is_would_block(&self) -> bool {
        self.is_errno(libc::EAGAIN) || self.is_errno(libc::EWOULDBLOCK)
    }

    pub fn is_interrupted(&self) -> bool {
        self.is_errno(libc::EINTR)
    }

    pub fn is_conn_refused(&self) -> bool {
        self.is_errno(libc::ECONNREFUSED)
    }

    pub fn is_msg_size(&self) -> bool {
        self.is_errno(libc::EMSGSIZE)
    }
}

/// Helper for wrapping the return value of a raw libc call: `< 0` means
/// `errno` holds the error, matching the convention every syscall wrapper
/// in this crate follows.
pub fn check_syscall(syscall: &'static str, ret: libc::c_int) -> NetResult<libc::c_int> {
    if ret < 0 {
        Err(NetError::kernel(syscall, io::Error::last_os_error()))
    } else {
        Ok(ret)
    }
}

/// Same as [`check_syscall`] but for calls that return `isize` (e.g.
/// `recvmsg`/`sendmsg` return byte counts that can exceed `c_int` range on
/// some ABIs).
pub fn check_syscall_isize(syscall: &'static str, ret: isize) -> NetResult<isize> {
    if ret < 0 {
        Err(NetError::kernel(syscall, io::Error::last_os_error()))
    } else {
        Ok(ret)
    }
}
