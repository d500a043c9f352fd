//! The fluent socket builder: resolve → construct → setopt → bind/listen/
//! connect, plus the direct syscall wrappers (`send`/`sendto`/`sendmsg`/
//! `recvfrom`/`recvmsg`) and the sticky-error discipline tying the chain
//! together.
//!
//! Uses `socket2::Socket` for the portable parts (create, bind, buffer
//! sizing) and drops to raw `libc::setsockopt` for the Linux-only options
//! (`IP_MTU_DISCOVER`, `UDP_SEGMENT`, `IP_TOS`, `IP_PKTINFO`, `IP_RECVERR`)
//! that `socket2` doesn't expose.

use std::io;
use std::os::unix::io::{AsRawFd, IntoRawFd};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Type};

use crate::address::Address;
use crate::deadline::Deadliner;
use crate::error::{check_syscall, NetError, NetResult};
use crate::managed_fd::ManagedFd;

/// `IP_MTU_DISCOVER`/`IPV6_MTU_DISCOVER` modes. `None` means "don't touch
/// this option" (the builder step is skipped); every other variant maps to
/// a `IP_PMTUDISC_*`/`IPV6_PMTUDISC_*` constant.
///
/// Hardcoded as local constants rather than `libc::IP_PMTUDISC_*` because
/// `INTERFACE` (Linux 4.7+) and `OMIT` (Linux 4.20+) aren't exposed by
/// every `libc` crate version this workspace might resolve to — see
/// DESIGN.md.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtuDiscover {
    None,
    Dont,
    Want,
    Do,
    Probe,
    Interface,
    Omit,
}

const IP_PMTUDISC_DONT: libc::c_int = 0;
const IP_PMTUDISC_WANT: libc::c_int = 1;
const IP_PMTUDISC_DO: libc::c_int = 2;
const IP_PMTUDISC_PROBE: libc::c_int = 3;
const IP_PMTUDISC_INTERFACE: libc::c_int = 4;
const IP_PMTUDISC_OMIT: libc::c_int = 5;

/// `UDP_SEGMENT` (`linux/udp.h`), for GSO. Requires Linux 4.18+.
const UDP_SEGMENT: libc::c_int = 103;

impl MtuDiscover {
    fn as_const(self) -> Option<libc::c_int> {
        match self {
            MtuDiscover::None => None,
            MtuDiscover::Dont => Some(IP_PMTUDISC_DONT),
            MtuDiscover::Want => Some(IP_PMTUDISC_WANT),
            MtuDiscover::Do => Some(IP_PMTUDISC_DO),
            MtuDiscover::Probe => Some(IP_PMTUDISC_PROBE),
            MtuDiscover::Interface => Some(IP_PMTUDISC_INTERFACE),
            MtuDiscover::Omit => Some(IP_PMTUDISC_OMIT),
        }
    }
}

/// Tristate setsockopt convention shared by `reuse_addr`/`reuse_port`/
/// `recv_pktinfo`: an empty slice means "default on", `[0]`/`[1]` mean
/// explicit off/on, anything else means "leave it alone".
fn tristate(vals: &[i32]) -> Option<i32> {
    match vals {
        [] => Some(1),
        [0] => Some(0),
        [1] => Some(1),
        _ => None,
    }
}

/// Composes a managed fd, near/far addresses, a sticky error, and an
/// optional deadline timer. Every builder method is a no-op once an error
/// has been recorded; call [`done`](Socket::done) to retrieve it.
pub struct Socket {
    fd: Arc<ManagedFd>,
    near: Option<Address>,
    far: Option<Address>,
    err: Option<NetError>,
    deadliner: Option<Deadliner>,
}

impl Default for Socket {
    fn default() -> Self {
        Self::new()
    }
}

impl Socket {
    pub fn new() -> Self {
        Self { fd: Arc::new(ManagedFd::new()), near: None, far: None, err: None, deadliner: None }
    }

    /// Shared handle to this socket's managed fd — hand this to another
    /// thread so it can `disable()` the socket to interrupt a blocked
    /// syscall here.
    pub fn fd_handle(&self) -> Arc<ManagedFd> {
        self.fd.clone()
    }

    pub fn is_disabled(&self) -> bool {
        self.fd.is_disabled()
    }

    pub fn near(&self) -> Option<Address> {
        self.near
    }

    pub fn far(&self) -> Option<Address> {
        self.far
    }

    /// Records `e` as the sticky error if none is set yet, closing the fd
    /// immediately — used by the state-advancing steps (construct, bind,
    /// listen, connect, accept) where a kernel fd left half-configured
    /// after a failure shouldn't be reused.
    fn fail_closing(&mut self, e: NetError) {
        if self.err.is_none() {
            self.err = Some(e);
        }
        if self.fd.is_open() {
            let _ = self.fd.close();
        }
    }

    /// Records `e` as the sticky error without touching the fd — used by
    /// setopt/I/O steps where the fd is still perfectly usable.
    fn fail(&mut self, e: NetError) {
        if self.err.is_none() {
            self.err = Some(e);
        }
    }

    fn family(&self) -> Option<Domain> {
        let addr = self.far.filter(Address::is_ip_set).or(self.near.filter(Address::is_ip_set))?;
        Some(if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 })
    }

    fn sa_family(&self) -> libc::c_int {
        match self.family() {
            Some(Domain::IPV6) => libc::AF_INET6,
            _ => libc::AF_INET,
        }
    }

    // --- resolve --------------------------------------------------------

    pub fn resolve_far(&mut self, host: &str, port: u16) -> &mut Self {
        if self.err.is_some() {
            return self;
        }
        match crate::resolve::resolve_default(host, port) {
            Ok(a) => self.far = Some(a),
            Err(e) => self.fail(e),
        }
        self
    }

    pub fn resolve_near(&mut self, host: &str, port: u16) -> &mut Self {
        if self.err.is_some() {
            return self;
        }
        match crate::resolve::resolve_default(host, port) {
            Ok(a) => self.near = Some(a),
            Err(e) => self.fail(e),
        }
        self
    }

    /// Sets the far (peer) address directly, skipping DNS resolution.
    pub fn set_far(&mut self, addr: Address) -> &mut Self {
        if self.err.is_some() {
            return self;
        }
        self.far = Some(addr);
        self
    }

    /// Sets the near (local) address directly, skipping DNS resolution.
    pub fn set_near(&mut self, addr: Address) -> &mut Self {
        if self.err.is_some() {
            return self;
        }
        self.near = Some(addr);
        self
    }

    // --- construct --------------------------------------------------------

    pub fn construct_tcp(&mut self) -> &mut Self {
        self.construct(Type::STREAM, Protocol::TCP)
    }

    pub fn construct_udp(&mut self) -> &mut Self {
        self.construct(Type::DGRAM, Protocol::UDP)
    }

    pub fn construct(&mut self, ty: Type, proto: Protocol) -> &mut Self {
        if self.err.is_some() {
            return self;
        }
        if !self.fd.is_empty() {
            self.fail(NetError::lifecycle("construct: fd already initialised"));
            return self;
        }
        let Some(domain) = self.family() else {
            self.fail(NetError::argument(
                "construct: no address family could be determined — set a near or far address first",
            ));
            return self;
        };
        match socket2::Socket::new(domain, ty, Some(proto)) {
            Ok(sock) => {
                let raw = sock.into_raw_fd();
                if let Err(e) = self.fd.set(raw) {
                    unsafe {
                        libc::close(raw);
                    }
                    self.fail(e);
                }
            }
            Err(e) => self.fail_closing(NetError::kernel("socket", e)),
        }
        self
    }

    fn raw_fd(&mut self) -> Option<i32> {
        self.fd.raw_fd()
    }

    // --- setopt -----------------------------------------------------------

    fn setsockopt<T: Copy>(&mut self, name: &'static str, level: i32, opt: i32, val: T) {
        if self.err.is_some() {
            return;
        }
        let Some(fd) = self.raw_fd() else {
            self.fail(NetError::lifecycle(format!("{name}: fd not initialised")));
            return;
        };
        let ret = unsafe {
            libc::setsockopt(
                fd,
                level,
                opt,
                &val as *const T as *const libc::c_void,
                std::mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if let Err(e) = check_syscall(name, ret) {
            self.fail(e);
        }
    }

    pub fn set_opt_reuse_addr(&mut self, vals: &[i32]) -> &mut Self {
        if let Some(v) = tristate(vals) {
            self.setsockopt("SO_REUSEADDR", libc::SOL_SOCKET, libc::SO_REUSEADDR, v as libc::c_int);
        }
        self
    }

    pub fn set_opt_reuse_port(&mut self, vals: &[i32]) -> &mut Self {
        if let Some(v) = tristate(vals) {
            self.setsockopt("SO_REUSEPORT", libc::SOL_SOCKET, libc::SO_REUSEPORT, v as libc::c_int);
        }
        self
    }

    pub fn set_opt_recv_pktinfo(&mut self, vals: &[i32]) -> &mut Self {
        if self.err.is_some() {
            return self;
        }
        let Some(v) = tristate(vals) else { return self };
        match self.sa_family() {
            libc::AF_INET => self.setsockopt("IP_PKTINFO", libc::IPPROTO_IP, libc::IP_PKTINFO, v),
            _ => self.setsockopt("IPV6_RECVPKTINFO", libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO, v),
        }
        self
    }

    pub fn set_opt_recv_err(&mut self, vals: &[i32]) -> &mut Self {
        if self.err.is_some() {
            return self;
        }
        let Some(v) = tristate(vals) else { return self };
        match self.sa_family() {
            libc::AF_INET => self.setsockopt("IP_RECVERR", libc::IPPROTO_IP, libc::IP_RECVERR, v),
            _ => self.setsockopt("IPV6_RECVERR", libc::IPPROTO_IPV6, libc::IPV6_RECVERR, v),
        }
        self
    }

    pub fn set_opt_mtu_discover(&mut self, mode: MtuDiscover) -> &mut Self {
        if self.err.is_some() {
            return self;
        }
        let Some(v) = mode.as_const() else { return self };
        match self.sa_family() {
            libc::AF_INET => self.setsockopt("IP_MTU_DISCOVER", libc::IPPROTO_IP, libc::IP_MTU_DISCOVER, v),
            _ => self.setsockopt("IPV6_MTU_DISCOVER", libc::IPPROTO_IPV6, libc::IPV6_MTU_DISCOVER, v),
        }
        self
    }

    /// Sets `UDP_SEGMENT` for generic segmentation offload. Requires Linux
    /// 4.18+; older kernels surface `ENOPROTOOPT` through the usual
    /// sticky-error path.
    pub fn set_opt_gso(&mut self, segment_size: u16) -> &mut Self {
        self.setsockopt("UDP_SEGMENT", libc::IPPROTO_UDP, UDP_SEGMENT, segment_size as libc::c_int);
        self
    }

    pub fn set_opt_dscp(&mut self, tos: u8) -> &mut Self {
        if self.err.is_some() {
            return self;
        }
        match self.sa_family() {
            libc::AF_INET => self.setsockopt("IP_TOS", libc::IPPROTO_IP, libc::IP_TOS, tos as libc::c_int),
            _ => self.setsockopt("IPV6_TCLASS", libc::IPPROTO_IPV6, libc::IPV6_TCLASS, tos as libc::c_int),
        }
        self
    }

    pub fn set_opt_priority(&mut self, priority: i32) -> &mut Self {
        self.setsockopt("SO_PRIORITY", libc::SOL_SOCKET, libc::SO_PRIORITY, priority);
        self
    }

    /// Sets the receive buffer, then reads it back; if the kernel clamped
    /// it below what was requested, records an error naming the relevant
    /// sysctl instead of silently keeping a too-small buffer.
    pub fn set_opt_rcv_buf(&mut self, size: usize) -> &mut Self {
        self.set_buf_opt("SO_RCVBUF", libc::SO_RCVBUF, size, "net.core.rmem_max")
    }

    pub fn set_opt_snd_buf(&mut self, size: usize) -> &mut Self {
        self.set_buf_opt("SO_SNDBUF", libc::SO_SNDBUF, size, "net.core.wmem_max")
    }

    fn set_buf_opt(&mut self, name: &'static str, opt: i32, size: usize, sysctl: &str) -> &mut Self {
        if self.err.is_some() {
            return self;
        }
        let Some(fd) = self.raw_fd() else {
            self.fail(NetError::lifecycle(format!("{name}: fd not initialised")));
            return self;
        };
        let want = size as libc::c_int;
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                &want as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if let Err(e) = check_syscall(name, ret) {
            self.fail(e);
            return self;
        }
        let mut got: libc::c_int = 0;
        let mut got_len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                &mut got as *mut _ as *mut libc::c_void,
                &mut got_len,
            )
        };
        if let Err(e) = check_syscall(name, ret) {
            self.fail(e);
            return self;
        }
        // The kernel doubles buffer requests for internal bookkeeping, so
        // compare against twice the request the way `getsockopt` reports
        // it back.
        if (got as usize) < size {
            self.fail(NetError::argument(format!(
                "{name}: kernel granted {got} bytes, wanted {size}; raise {sysctl}"
            )));
        }
        self
    }

    // --- bind / listen / connect / accept ----------------------------------

    pub fn bind(&mut self) -> &mut Self {
        if self.err.is_some() {
            return self;
        }
        let Some(near) = self.near else {
            self.fail_closing(NetError::argument("bind: no near address set"));
            return self;
        };
        let Some(fd) = self.raw_fd() else {
            self.fail_closing(NetError::lifecycle("bind: fd not initialised"));
            return self;
        };
        let view = near.as_sockaddr();
        let ret = unsafe { libc::bind(fd, view.as_ptr(), view.len() as libc::socklen_t) };
        if let Err(e) = check_syscall("bind", ret) {
            self.fail_closing(e);
            return self;
        }
        // An ephemeral bind (port 0) needs the kernel-assigned port read
        // back via getsockname, or `near()` would keep reporting port 0 to
        // every caller that binds that way (the echoer's own reply address
        // depends on this being accurate).
        if near.port() == 0 {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let ret = unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
            if let Err(e) = check_syscall("getsockname", ret) {
                self.fail_closing(e);
                return self;
            }
            let buf = unsafe { std::slice::from_raw_parts(&storage as *const _ as *const u8, len as usize) };
            match Address::from_name_bytes(buf) {
                Ok(a) => self.near = Some(a),
                Err(e) => self.fail_closing(e),
            }
        }
        self
    }

    pub fn listen(&mut self, backlog: i32) -> &mut Self {
        if self.err.is_some() {
            return self;
        }
        let Some(fd) = self.raw_fd() else {
            self.fail_closing(NetError::lifecycle("listen: fd not initialised"));
            return self;
        };
        let ret = unsafe { libc::listen(fd, backlog) };
        if let Err(e) = check_syscall("listen", ret) {
            self.fail_closing(e);
        }
        self
    }

    pub fn connect(&mut self) -> &mut Self {
        if self.err.is_some() {
            return self;
        }
        let Some(far) = self.far else {
            self.fail_closing(NetError::argument("connect: no far address set"));
            return self;
        };
        let Some(fd) = self.raw_fd() else {
            self.fail_closing(NetError::lifecycle("connect: fd not initialised"));
            return self;
        };
        let view = far.as_sockaddr();
        let ret = unsafe { libc::connect(fd, view.as_ptr(), view.len() as libc::socklen_t) };
        if let Err(e) = check_syscall("connect", ret) {
            self.fail_closing(e);
        }
        self
    }

    /// Accepts one connection, writing the new fd and peer address into
    /// `out` (which must be a fresh, unconstructed `Socket`).
    pub fn accept(&mut self, out: &mut Socket) -> NetResult<()> {
        if let Some(e) = &self.err {
            return Err(clone_err(e));
        }
        let fd = self.raw_fd().ok_or_else(|| NetError::lifecycle("accept: fd not initialised"))?;
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let new_fd = unsafe { libc::accept(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
        if new_fd < 0 {
            // A disabled listener surfaces as an ordinary kernel error here
            // (typically EINVAL/ECONNABORTED) — see §5 "accept error on a
            // disabled listener"; callers distinguish cancellation by
            // checking `is_disabled()` on the handle they disabled.
            return Err(NetError::kernel("accept", io::Error::last_os_error()));
        }
        let buf = unsafe {
            std::slice::from_raw_parts(&storage as *const _ as *const u8, len as usize)
        };
        let peer = Address::from_name_bytes(buf)?;
        out.fd.set(new_fd).map_err(|e| {
            unsafe { libc::close(new_fd) };
            e
        })?;
        out.far = Some(peer);
        Ok(())
    }

    // --- direct I/O ---------------------------------------------------------

    pub fn send(&mut self, buf: &[u8]) -> NetResult<usize> {
        self.retry_eintr(|fd| unsafe { libc::send(fd, buf.as_ptr() as *const _, buf.len(), 0) }, "send")
    }

    pub fn sendto(&mut self, buf: &[u8], dst: &Address) -> NetResult<usize> {
        let view = dst.as_sockaddr();
        self.retry_eintr(
            |fd| unsafe {
                libc::sendto(fd, buf.as_ptr() as *const _, buf.len(), 0, view.as_ptr(), view.len() as libc::socklen_t)
            },
            "sendto",
        )
    }

    pub fn recvfrom(&mut self, buf: &mut [u8]) -> NetResult<(usize, Address)> {
        if let Some(e) = &self.err {
            return Err(clone_err(e));
        }
        let fd = self.raw_fd().ok_or_else(|| NetError::lifecycle("recvfrom: fd not initialised"))?;
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let n = unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut _,
                buf.len(),
                0,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if n < 0 {
            return Err(NetError::kernel("recvfrom", io::Error::last_os_error()));
        }
        let addr_buf = unsafe {
            std::slice::from_raw_parts(&storage as *const _ as *const u8, len as usize)
        };
        let from = Address::from_name_bytes(addr_buf).unwrap_or_default();
        Ok((n as usize, from))
    }

    /// `sendmsg(2)` to `dst`, with a raw control buffer attached (DSCP/TOS
    /// cmsg overrides, mostly — this crate has no ancillary data of its own
    /// to send, but the wrapper is general). Pass an empty `control` for a
    /// plain send.
    pub fn sendmsg(&mut self, buf: &[u8], dst: Option<&Address>, control: &[u8]) -> NetResult<usize> {
        if let Some(e) = &self.err {
            return Err(clone_err(e));
        }
        let fd = self.raw_fd().ok_or_else(|| NetError::lifecycle("sendmsg: fd not initialised"))?;
        let mut name_buf = [0u8; 28];
        let (name_ptr, name_len) = match dst {
            Some(a) => {
                let len = a.as_name_bytes(&mut name_buf)?;
                (name_buf.as_mut_ptr() as *mut libc::c_void, len as libc::socklen_t)
            }
            None => (std::ptr::null_mut(), 0),
        };
        let mut iov = libc::iovec { iov_base: buf.as_ptr() as *mut libc::c_void, iov_len: buf.len() };
        let hdr = libc::msghdr {
            msg_name: name_ptr,
            msg_namelen: name_len,
            msg_iov: &mut iov,
            msg_iovlen: 1,
            msg_control: if control.is_empty() {
                std::ptr::null_mut()
            } else {
                control.as_ptr() as *mut libc::c_void
            },
            msg_controllen: control.len(),
            msg_flags: 0,
        };
        loop {
            let ret = unsafe { libc::sendmsg(fd, &hdr, 0) };
            if ret >= 0 {
                return Ok(ret as usize);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(e) if e == libc::EINTR || e == libc::EAGAIN || e == libc::ECONNREFUSED => {
                    std::thread::yield_now();
                    continue;
                }
                _ => return Err(NetError::kernel("sendmsg", err)),
            }
        }
    }

    /// `recvmsg(2)` into `buf`, with `control` filled in with whatever
    /// ancillary data the kernel attaches (`IP_PKTINFO`/`IPV6_PKTINFO`,
    /// `IP_RECVERR`/`IPV6_RECVERR`) — walk it with [`crate::cmsg::CmsgLens`].
    /// Returns the number of payload bytes received, the sender address,
    /// and the number of control bytes actually written into `control`.
    pub fn recvmsg(&mut self, buf: &mut [u8], control: &mut [u8]) -> NetResult<(usize, Address, usize)> {
        if let Some(e) = &self.err {
            return Err(clone_err(e));
        }
        let fd = self.raw_fd().ok_or_else(|| NetError::lifecycle("recvmsg: fd not initialised"))?;
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut iov = libc::iovec { iov_base: buf.as_mut_ptr() as *mut libc::c_void, iov_len: buf.len() };
        let mut hdr = libc::msghdr {
            msg_name: &mut storage as *mut _ as *mut libc::c_void,
            msg_namelen: std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
            msg_iov: &mut iov,
            msg_iovlen: 1,
            msg_control: if control.is_empty() {
                std::ptr::null_mut()
            } else {
                control.as_mut_ptr() as *mut libc::c_void
            },
            msg_controllen: control.len(),
            msg_flags: 0,
        };
        let n = unsafe { libc::recvmsg(fd, &mut hdr, 0) };
        if n < 0 {
            return Err(NetError::kernel("recvmsg", io::Error::last_os_error()));
        }
        let addr_buf = unsafe {
            std::slice::from_raw_parts(&storage as *const _ as *const u8, hdr.msg_namelen as usize)
        };
        let from = Address::from_name_bytes(addr_buf).unwrap_or_default();
        Ok((n as usize, from, hdr.msg_controllen))
    }

    /// Retries a send/recv-style call on `EINTR`, `EAGAIN`, or
    /// `ECONNREFUSED` (connected UDP sees the latter when the peer isn't
    /// listening yet) with a cooperative yield, matching the retry policy
    /// `recv_mmsg`/`send_mmsg_retry` use in `endpoint.rs`.
    fn retry_eintr(&mut self, mut call: impl FnMut(i32) -> isize, name: &'static str) -> NetResult<usize> {
        if let Some(e) = &self.err {
            return Err(clone_err(e));
        }
        let fd = self.raw_fd().ok_or_else(|| NetError::lifecycle(format!("{name}: fd not initialised")))?;
        loop {
            let ret = call(fd);
            if ret >= 0 {
                return Ok(ret as usize);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(e) if e == libc::EINTR || e == libc::EAGAIN || e == libc::ECONNREFUSED => {
                    std::thread::yield_now();
                    continue;
                }
                _ => return Err(NetError::kernel(name, err)),
            }
        }
    }

    // --- deadline -----------------------------------------------------------

    /// Arms (or rearms) a deadline after which the socket's fd is
    /// disabled, interrupting any thread blocked in a syscall on it.
    /// `t == Duration::ZERO` cancels the current deadline.
    pub fn set_deadline(&mut self, t: Duration) -> &mut Self {
        if self.err.is_some() {
            return self;
        }
        if t.is_zero() {
            if let Some(d) = self.deadliner.take() {
                d.cancel();
            }
            return self;
        }
        if let Some(d) = &self.deadliner {
            if d.reset(t) {
                return self;
            }
            // Already fired/cancelled; fall through and arm a fresh one.
        }
        let fd = self.fd.clone();
        self.deadliner = Some(Deadliner::start(t, move || {
            let _ = fd.disable();
        }));
        self
    }

    // --- terminal -------------------------------------------------------

    /// Returns the sticky error, if any, and drops the builder's working
    /// state. If an error was recorded, the fd (if still open) is closed
    /// first.
    pub fn done(&mut self) -> NetResult<()> {
        if self.err.is_some() && self.fd.is_open() {
            let _ = self.fd.close();
        }
        match self.err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn close(&mut self) -> NetResult<()> {
        if let Some(d) = self.deadliner.take() {
            d.cancel();
        }
        self.fd.close()
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.fd.raw_fd().unwrap_or(-1)
    }
}

impl Socket {
    /// `None` if the fd has never been constructed/transferred in.
    pub fn as_raw_fd_checked(&self) -> Option<i32> {
        self.fd.raw_fd()
    }
}

fn clone_err(e: &NetError) -> NetError {
    // `NetError` doesn't derive `Clone` (an `io::Error` inside `Kernel`
    // doesn't either); reconstruct an equivalent from the `Display` text.
    match e {
        NetError::Kernel { syscall, source } => NetError::Kernel {
            syscall: *syscall,
            source: io::Error::from(source.kind()),
        },
        NetError::Argument(s) => NetError::Argument(s.clone()),
        NetError::Lifecycle(s) => NetError::Lifecycle(s.clone()),
        NetError::Protocol(s) => NetError::Protocol(s.clone()),
        NetError::Timeout => NetError::Timeout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    #[test]
    fn tcp_connect_and_send() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 19];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"the quick brown fox");
        });

        let mut sock = Socket::new();
        sock.set_far(Address::from_ip_port(addr.ip(), addr.port()));
        sock.construct_tcp();
        sock.connect();
        sock.done().unwrap();
        sock.send(b"the quick brown fox").unwrap();
        sock.close().unwrap();

        server.join().unwrap();
    }

    #[test]
    fn udp_sendto_recvfrom_roundtrip() {
        let mut receiver = Socket::new();
        receiver.set_near(Address::from_ip_port("127.0.0.1".parse().unwrap(), 0));
        receiver.construct_udp();
        receiver.bind();
        receiver.done().unwrap();

        // Recover the OS-assigned port via getsockname for the sender to
        // target.
        let fd = receiver.as_raw_fd();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        unsafe {
            libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len);
        }
        let buf = unsafe { std::slice::from_raw_parts(&storage as *const _ as *const u8, len as usize) };
        let bound = Address::from_name_bytes(buf).unwrap();

        let mut sender = Socket::new();
        sender.set_near(Address::from_ip_port("127.0.0.1".parse().unwrap(), 0));
        sender.construct_udp();
        sender.bind();
        sender.done().unwrap();
        sender.sendto(b"hello-udp", &bound).unwrap();

        let mut buf = [0u8; 32];
        let (n, _from) = receiver.recvfrom(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello-udp");
    }

    #[test]
    fn bind_to_ephemeral_port_fills_in_kernel_assigned_port() {
        let mut sock = Socket::new();
        sock.set_near(Address::from_ip_port("127.0.0.1".parse().unwrap(), 0));
        sock.construct_udp();
        sock.bind();
        sock.done().unwrap();
        assert_ne!(sock.near().unwrap().port(), 0, "bind(0) must resolve to the kernel-assigned port");
    }

    #[test]
    fn udp_sendmsg_recvmsg_roundtrip_without_control_data() {
        let mut receiver = Socket::new();
        receiver.set_near(Address::from_ip_port("127.0.0.1".parse().unwrap(), 0));
        receiver.construct_udp();
        receiver.bind();
        receiver.done().unwrap();
        let bound = receiver.near().unwrap();

        let mut sender = Socket::new();
        sender.set_near(Address::from_ip_port("127.0.0.1".parse().unwrap(), 0));
        sender.construct_udp();
        sender.bind();
        sender.done().unwrap();
        sender.sendmsg(b"hello-sendmsg", Some(&bound), &[]).unwrap();

        let mut buf = [0u8; 32];
        let (n, from, clen) = receiver.recvmsg(&mut buf, &mut []).unwrap();
        assert_eq!(&buf[..n], b"hello-sendmsg");
        assert_eq!(clen, 0);
        assert!(from.is_ipv4());
    }

    #[test]
    fn sticky_error_short_circuits_chain() {
        let mut sock = Socket::new();
        // No address set: construct fails.
        sock.construct_tcp();
        assert!(sock.done().is_err());
    }

    #[test]
    fn disable_unblocks_blocked_recv() {
        // shutdown(2) only reliably interrupts a blocking syscall on a
        // *connected* socket, so this exercises a connected TCP pair
        // rather than unconnected UDP.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();

        let mut server = Socket::new();
        server.fd.set(accepted.into_raw_fd()).unwrap();

        let handle = server.fd_handle();
        let t = thread::spawn(move || {
            let mut buf = [0u8; 16];
            let mut server = server;
            let _ = server.recvfrom(&mut buf);
            server
        });
        thread::sleep(Duration::from_millis(50));
        handle.disable().unwrap();
        let server = t.join().unwrap();
        assert!(server.is_disabled());
    }
}
