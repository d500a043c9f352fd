//! A fixed-size, hashable (family, IP, port) value.
//!
//! IPv4 is stored as an IPv4-mapped IPv6 address (`::ffff:a.b.c.d`) so a
//! single 24-byte value represents either family, branching on family
//! only at the edges (sockaddr/name-bytes/cmsg conversions).

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{NetError, NetResult};

const PORT_MASK: u64 = 0xffff;
const PORT_SET_BIT: u64 = 1 << 16;
const IP_SET_BIT: u64 = 1 << 17;

/// Packed (family, IP, port) value. 24 bytes, `Copy`, byte-for-byte
/// comparable and hashable.
///
/// Storage: `addr_hi`/`addr_lo` hold the 16 address bytes (network byte
/// order) as two little-endian-loaded words — `addr_hi` from bytes 0..8,
/// `addr_lo` from bytes 8..16. `meta`'s low 16 bits are the port (host byte
/// order), bit 16 marks "port set", bit 17 marks "IP set".
#[derive(Clone, Copy, Default)]
#[repr(C)]
pub struct Address {
    addr_hi: u64,
    addr_lo: u64,
    meta: u64,
}

impl Address {
    pub const fn new() -> Self {
        Self { addr_hi: 0, addr_lo: 0, meta: 0 }
    }

    // --- construction -------------------------------------------------

    pub fn set_ip(&mut self, ip: IpAddr) {
        let bytes = match ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        self.addr_hi = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        self.addr_lo = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        self.meta |= IP_SET_BIT;
    }

    pub fn set_port(&mut self, port: u16) {
        self.meta &= !PORT_MASK;
        self.meta |= port as u64;
        if port == 0 {
            self.meta &= !PORT_SET_BIT;
        } else {
            self.meta |= PORT_SET_BIT;
        }
    }

    pub fn set_ip_and_port(&mut self, ip: IpAddr, port: u16) {
        self.set_ip(ip);
        self.set_port(port);
    }

    pub fn from_ip_port(ip: IpAddr, port: u16) -> Self {
        let mut a = Self::new();
        a.set_ip_and_port(ip, port);
        a
    }

    // --- views ----------------------------------------------------------

    /// 16-byte network-order view of the stored IP (IPv4-mapped if the
    /// address is an IPv4 one).
    pub fn as_ip(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..8].copy_from_slice(&self.addr_hi.to_le_bytes());
        out[8..16].copy_from_slice(&self.addr_lo.to_le_bytes());
        out
    }

    /// Last 4 bytes of the 16-byte view; only meaningful when `is_ipv4()`.
    pub fn as_ipv4(&self) -> [u8; 4] {
        let hi32 = (self.addr_lo >> 32) as u32;
        hi32.to_le_bytes()
    }

    pub fn as_ipaddr(&self) -> IpAddr {
        if self.is_ipv4() {
            IpAddr::V4(Ipv4Addr::from(self.as_ipv4()))
        } else {
            IpAddr::V6(Ipv6Addr::from(self.as_ip()))
        }
    }

    pub fn port(&self) -> u16 {
        (self.meta & PORT_MASK) as u16
    }

    // --- queries ----------------------------------------------------------

    pub fn is_set(&self) -> bool {
        self.is_ip_set() || self.is_port_set()
    }

    pub fn is_ip_set(&self) -> bool {
        self.meta & IP_SET_BIT != 0
    }

    pub fn is_port_set(&self) -> bool {
        self.meta & PORT_SET_BIT != 0
    }

    /// IPv4-mapped test: `addr_hi == 0` and the low 32 bits of `addr_lo`
    /// equal `0xffff0000` (bytes 8..12 are `00 00 ff ff`).
    pub fn is_ipv4(&self) -> bool {
        self.addr_hi == 0 && (self.addr_lo & 0xffff_ffff) == 0xffff_0000
    }

    pub fn is_ipv6(&self) -> bool {
        !self.is_ipv4()
    }

    /// True for the zero IPv4 and zero IPv6 address, AND port 0 — i.e. a
    /// fully unset/wildcard address. See the Open Question resolution in
    /// DESIGN.md for why this (as opposed to a pure "IP wildcard" test) is
    /// the chosen total function.
    pub fn is_zero(&self) -> bool {
        self.as_ipaddr().is_unspecified() && self.port() == 0
    }

    /// True if either the IP is the wildcard/unset address, or the port is
    /// 0 — useful for "has this half of the pair actually been filled in".
    pub fn is_either_zero(&self) -> bool {
        self.as_ipaddr().is_unspecified() || self.port() == 0
    }

    pub fn is_unspecified(&self) -> bool {
        self.as_ipaddr().is_unspecified()
    }

    pub fn is_loopback(&self) -> bool {
        self.as_ipaddr().is_loopback()
    }

    pub fn is_multicast(&self) -> bool {
        self.as_ipaddr().is_multicast()
    }

    pub fn is_private(&self) -> bool {
        match self.as_ipaddr() {
            IpAddr::V4(v4) => v4.is_private(),
            // Unique local addresses, fc00::/7.
            IpAddr::V6(v6) => (v6.octets()[0] & 0xfe) == 0xfc,
        }
    }

    /// Globally routable unicast: not unspecified, loopback, multicast,
    /// link-local, private, or (v4-only) broadcast/documentation.
    pub fn is_global_unicast(&self) -> bool {
        match self.as_ipaddr() {
            IpAddr::V4(v4) => {
                !(v4.is_unspecified()
                    || v4.is_loopback()
                    || v4.is_private()
                    || v4.is_link_local()
                    || v4.is_multicast()
                    || v4.is_broadcast()
                    || v4.is_documentation())
            }
            IpAddr::V6(v6) => {
                let o = v6.octets();
                let link_local = (o[0] == 0xfe) && (o[1] & 0xc0) == 0x80;
                let unique_local = (o[0] & 0xfe) == 0xfc;
                !(v6.is_unspecified() || v6.is_loopback() || v6.is_multicast() || link_local || unique_local)
            }
        }
    }

    // --- string ------------------------------------------------------------

    pub fn string(&self) -> String {
        match self.as_ipaddr() {
            IpAddr::V4(v4) => format!("{}:{}", v4, self.port()),
            IpAddr::V6(v6) => format!("[{}]:{}", v6, self.port()),
        }
    }

    // --- raw sockaddr / name-bytes round-trips ------------------------------

    /// Builds a family-correct raw sockaddr. Port is written in network
    /// byte order: the output of this function is used directly by the
    /// `bind`/`connect`/`sendto` syscall wrappers in `socket.rs`, so it has
    /// to be ABI-correct regardless of how the value is stored internally.
    pub fn as_sockaddr(&self) -> SockaddrView {
        if self.is_ipv4() {
            let ip = self.as_ipv4();
            let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = self.port().to_be();
            sin.sin_addr = libc::in_addr { s_addr: u32::from_ne_bytes(ip) };
            SockaddrView::V4(sin)
        } else {
            let ip = self.as_ip();
            let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = self.port().to_be();
            sin6.sin6_addr = libc::in6_addr { s6_addr: ip };
            SockaddrView::V6(sin6)
        }
    }

    /// Fills `buf` with the raw sockaddr layout expected by the
    /// `msghdr`/`mmsghdr` ABI (used for `msg_name`) and returns the number
    /// of bytes written (16 for IPv4, 28 for IPv6). `buf` must be at least
    /// 28 bytes; storage must outlive any syscall that borrows it (see
    /// `endpoint.rs`).
    pub fn as_name_bytes(&self, buf: &mut [u8]) -> NetResult<usize> {
        let view = self.as_sockaddr();
        let len = view.len();
        if buf.len() < len {
            return Err(NetError::protocol("name-bytes buffer too small"));
        }
        // SAFETY: `view` holds a valid, initialised sockaddr_in/in6 for its
        // own lifetime; we copy exactly `len` bytes of it out as raw bytes.
        unsafe {
            let src = view.as_ptr() as *const u8;
            std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), len);
        }
        Ok(len)
    }

    /// Inverse of `as_sockaddr`.
    pub fn from_sockaddr(view: &SockaddrView) -> NetResult<Address> {
        let mut a = Address::new();
        match view {
            SockaddrView::V4(sin) => {
                let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
                a.set_ip_and_port(IpAddr::V4(ip), u16::from_be(sin.sin_port));
            }
            SockaddrView::V6(sin6) => {
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                a.set_ip_and_port(IpAddr::V6(ip), u16::from_be(sin6.sin6_port));
            }
        }
        Ok(a)
    }

    /// Inverse of `as_name_bytes`. Dispatches on `sa_family_t` at offset 0
    /// the way every sockaddr-family ABI does, then trusts the matching
    /// fixed length.
    pub fn from_name_bytes(buf: &[u8]) -> NetResult<Address> {
        if buf.len() < std::mem::size_of::<libc::sa_family_t>() {
            return Err(NetError::protocol("name-bytes buffer too small for family"));
        }
        let family = unsafe { *(buf.as_ptr() as *const libc::sa_family_t) } as libc::c_int;
        match family {
            libc::AF_INET => {
                if buf.len() < std::mem::size_of::<libc::sockaddr_in>() {
                    return Err(NetError::protocol("name-bytes buffer too small for AF_INET"));
                }
                let sin = unsafe { *(buf.as_ptr() as *const libc::sockaddr_in) };
                Self::from_sockaddr(&SockaddrView::V4(sin))
            }
            libc::AF_INET6 => {
                if buf.len() < std::mem::size_of::<libc::sockaddr_in6>() {
                    return Err(NetError::protocol("name-bytes buffer too small for AF_INET6"));
                }
                let sin6 = unsafe { *(buf.as_ptr() as *const libc::sockaddr_in6) };
                Self::from_sockaddr(&SockaddrView::V6(sin6))
            }
            other => Err(NetError::protocol(format!("unknown sockaddr family {other}"))),
        }
    }

    /// Builds an IP-only Address (no port) from a decoded `in_pktinfo`
    /// destination (4 bytes) or `in6_pktinfo` destination (16 bytes).
    pub fn from_pktinfo(ip_bytes: &[u8]) -> NetResult<Address> {
        let mut a = Address::new();
        match ip_bytes.len() {
            4 => {
                let arr: [u8; 4] = ip_bytes.try_into().unwrap();
                a.set_ip(IpAddr::V4(Ipv4Addr::from(arr)));
            }
            16 => {
                let arr: [u8; 16] = ip_bytes.try_into().unwrap();
                a.set_ip(IpAddr::V6(Ipv6Addr::from(arr)));
            }
            n => return Err(NetError::protocol(format!("pktinfo IP must be 4 or 16 bytes, got {n}"))),
        }
        Ok(a)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Address").field("addr", &self.string()).finish()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.string())
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.addr_hi == other.addr_hi && self.addr_lo == other.addr_lo && self.meta == other.meta
    }
}
impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr_hi.hash(state);
        self.addr_lo.hash(state);
        self.meta.hash(state);
    }
}

/// Typed, family-correct raw sockaddr. Replaces the "two parallel untyped
/// paths" the source took between sockaddr and name-bytes conversions (see
/// DESIGN.md Open Questions) with one aliasing-safe view.
#[derive(Clone, Copy)]
pub enum SockaddrView {
    V4(libc::sockaddr_in),
    V6(libc::sockaddr_in6),
}

impl SockaddrView {
    pub fn as_ptr(&self) -> *const libc::sockaddr {
        match self {
            SockaddrView::V4(s) => s as *const _ as *const libc::sockaddr,
            SockaddrView::V6(s) => s as *const _ as *const libc::sockaddr,
        }
    }

    pub fn as_mut_ptr(&mut self) -> *mut libc::sockaddr {
        match self {
            SockaddrView::V4(s) => s as *mut _ as *mut libc::sockaddr,
            SockaddrView::V6(s) => s as *mut _ as *mut libc::sockaddr,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SockaddrView::V4(_) => std::mem::size_of::<libc::sockaddr_in>(),
            SockaddrView::V6(_) => std::mem::size_of::<libc::sockaddr_in6>(),
        }
    }
}
