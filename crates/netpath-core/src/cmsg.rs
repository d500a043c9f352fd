//! Ancillary-data (`cmsg`) parsing: a cursor that walks a control buffer
//! exactly once, plus decoders for the two payloads this crate cares about
//! — `IP_PKTINFO`/`IPV6_PKTINFO` (destination IP) and
//! `IP_RECVERR`/`IPV6_RECVERR` (extended socket errors, which carry the
//! kernel-learned PMTU on `EMSGSIZE`).
//!
//! The header-walk here (`CMSG_FIRSTHDR`/`CMSG_NXTHDR` reimplemented by
//! hand) is grounded on `nix`'s own manual reimplementation of those
//! macros in `sys/socket/mod.rs` — nix avoids depending on the libc crate
//! exposing them as real functions for every target, and we have the same
//! concern plus Linux-only struct payloads (`in_pktinfo`, `in6_pktinfo`,
//! `sock_extended_err`) that aren't guaranteed to be in every `libc` crate
//! version, so those payload structs are reimplemented here too,
//! `#[repr(C)]` against the kernel ABI.

use crate::address::Address;
use crate::error::{NetError, NetResult};

const CMSGHDR_LEN: usize = std::mem::size_of::<libc::cmsghdr>();
const CMSG_ALIGN_TO: usize = std::mem::size_of::<usize>();

#[inline]
fn align_up(n: usize, to: usize) -> usize {
    (n + to - 1) / to * to
}

/// `struct sock_extended_err` (`linux/errqueue.h`).
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct SockExtendedErr {
    pub ee_errno: u32,
    pub ee_origin: u8,
    pub ee_type: u8,
    pub ee_code: u8,
    pub ee_pad: u8,
    pub ee_info: u32,
    pub ee_data: u32,
}

/// A single pass over a `recvmsg` control buffer. Construct with
/// [`CmsgLens::new`], then call [`first`](Self::first) to position at the
/// first message and [`next`](Self::next) to advance.
pub struct CmsgLens<'a> {
    buf: &'a [u8],
    cur: Option<usize>,
}

impl<'a> CmsgLens<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, cur: None }
    }

    /// Positions at the first control message. Returns `false` if the
    /// buffer is too small to hold even one header.
    pub fn first(&mut self) -> bool {
        self.advance_from(0)
    }

    /// Advances to the next control message. Returns `false` when there's
    /// no room for another header.
    pub fn next(&mut self) -> bool {
        let Some(start) = self.cur else { return false };
        let len = self.header_at(start).cmsg_len as usize;
        let next_start = align_up(start + len, CMSG_ALIGN_TO);
        self.advance_from(next_start)
    }

    fn advance_from(&mut self, start: usize) -> bool {
        if start + CMSGHDR_LEN > self.buf.len() {
            self.cur = None;
            return false;
        }
        let len = self.header_at(start).cmsg_len as usize;
        if len < CMSGHDR_LEN || start + len > self.buf.len() {
            self.cur = None;
            return false;
        }
        self.cur = Some(start);
        true
    }

    fn header_at(&self, start: usize) -> libc::cmsghdr {
        // SAFETY: callers only reach this with `start` validated by
        // `advance_from` to have at least `CMSGHDR_LEN` bytes available,
        // and `cmsghdr` has no padding-sensitive invariants to upset.
        unsafe { std::ptr::read_unaligned(self.buf[start..].as_ptr() as *const libc::cmsghdr) }
    }

    pub fn level(&self) -> i32 {
        self.header_at(self.cur.expect("CmsgLens not positioned")).cmsg_level
    }

    pub fn msg_type(&self) -> i32 {
        self.header_at(self.cur.expect("CmsgLens not positioned")).cmsg_type
    }

    /// Payload bytes only, excluding the 16-byte header.
    pub fn msg(&self) -> &'a [u8] {
        let start = self.cur.expect("CmsgLens not positioned");
        let len = self.header_at(start).cmsg_len as usize;
        &self.buf[start + CMSGHDR_LEN..start + len]
    }

    pub fn is_ip_error(&self) -> bool {
        (self.level() == libc::IPPROTO_IP && self.msg_type() == libc::IP_RECVERR)
            || (self.level() == libc::IPPROTO_IPV6 && self.msg_type() == libc::IPV6_RECVERR)
    }

    /// Decodes the extended socket error at the cursor. `ee_info` carries
    /// the kernel-learned MTU when `ee_errno == EMSGSIZE`.
    pub fn ip_error(&self) -> NetResult<SockExtendedErr> {
        let msg = self.msg();
        let needed = std::mem::size_of::<SockExtendedErr>();
        if msg.len() < needed {
            return Err(NetError::protocol("IP_RECVERR payload too small for sock_extended_err"));
        }
        Ok(unsafe { std::ptr::read_unaligned(msg.as_ptr() as *const SockExtendedErr) })
    }

    /// Decodes the address of the node that generated the ICMP error
    /// (`SO_EE_OFFENDER`): a raw sockaddr appended after the
    /// `sock_extended_err` struct.
    pub fn ip_error_offender(&self) -> NetResult<Address> {
        let msg = self.msg();
        let skip = std::mem::size_of::<SockExtendedErr>();
        if msg.len() <= skip {
            return Err(NetError::protocol("IP_RECVERR payload has no offender address"));
        }
        Address::from_name_bytes(&msg[skip..])
    }

    /// Decodes `IP_PKTINFO`/`IPV6_PKTINFO`, writing the destination IP
    /// (4 or 16 bytes) into `out` and returning how many bytes were
    /// written.
    pub fn pkt_info(&self, out: &mut [u8]) -> NetResult<usize> {
        match (self.level(), self.msg_type()) {
            (libc::IPPROTO_IP, libc::IP_PKTINFO) => {
                let msg = self.msg();
                // struct in_pktinfo { int ipi_ifindex; struct in_addr
                // ipi_spec_dst; struct in_addr ipi_addr; } — destination
                // IP is ipi_addr at payload offset 8..12.
                if msg.len() < 12 {
                    return Err(NetError::protocol("IP_PKTINFO payload too small"));
                }
                if out.len() < 4 {
                    return Err(NetError::protocol("pkt_info output buffer too small for IPv4"));
                }
                out[..4].copy_from_slice(&msg[8..12]);
                Ok(4)
            }
            (libc::IPPROTO_IPV6, libc::IPV6_PKTINFO) => {
                let msg = self.msg();
                // struct in6_pktinfo { struct in6_addr ipi6_addr; int
                // ipi6_ifindex; } — destination IP at payload offset
                // 0..16.
                if msg.len() < 16 {
                    return Err(NetError::protocol("IPV6_PKTINFO payload too small"));
                }
                if out.len() < 16 {
                    return Err(NetError::protocol("pkt_info output buffer too small for IPv6"));
                }
                out[..16].copy_from_slice(&msg[0..16]);
                Ok(16)
            }
            _ => Err(NetError::protocol("cursor is not positioned on a pktinfo message")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_cmsg(level: i32, msg_type: i32, payload: &[u8]) -> Vec<u8> {
        let hdr_len = CMSGHDR_LEN + payload.len();
        let aligned_len = align_up(hdr_len, CMSG_ALIGN_TO);
        let mut buf = vec![0u8; aligned_len];
        let hdr = libc::cmsghdr {
            cmsg_len: hdr_len as _,
            cmsg_level: level,
            cmsg_type: msg_type,
        };
        unsafe {
            std::ptr::write_unaligned(buf.as_mut_ptr() as *mut libc::cmsghdr, hdr);
        }
        buf[CMSGHDR_LEN..CMSGHDR_LEN + payload.len()].copy_from_slice(payload);
        buf
    }

    #[test]
    fn walks_two_pktinfo_messages() {
        let mut v4_payload = [0u8; 12];
        v4_payload[8..12].copy_from_slice(&[203, 0, 113, 9]);
        let mut buf = build_cmsg(libc::IPPROTO_IP, libc::IP_PKTINFO, &v4_payload);
        let second = build_cmsg(libc::IPPROTO_IP, libc::IP_PKTINFO, &v4_payload);
        buf.extend_from_slice(&second);

        let mut lens = CmsgLens::new(&buf);
        assert!(lens.first());
        let mut ip = [0u8; 16];
        let n = lens.pkt_info(&mut ip).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&ip[..4], &[203, 0, 113, 9]);
        assert!(lens.next());
        assert!(!lens.next());
    }

    #[test]
    fn empty_buffer_has_no_first_message() {
        let buf: Vec<u8> = Vec::new();
        let mut lens = CmsgLens::new(&buf);
        assert!(!lens.first());
    }

    #[test]
    fn decodes_extended_error() {
        let err = SockExtendedErr {
            ee_errno: libc::EMSGSIZE as u32,
            ee_origin: 2, // SO_EE_ORIGIN_ICMP
            ee_type: 3,
            ee_code: 4,
            ee_pad: 0,
            ee_info: 1400,
            ee_data: 0,
        };
        let payload = unsafe {
            std::slice::from_raw_parts(
                &err as *const _ as *const u8,
                std::mem::size_of::<SockExtendedErr>(),
            )
        };
        let buf = build_cmsg(libc::IPPROTO_IP, libc::IP_RECVERR, payload);
        let mut lens = CmsgLens::new(&buf);
        assert!(lens.first());
        assert!(lens.is_ip_error());
        let decoded = lens.ip_error().unwrap();
        assert_eq!(decoded.ee_errno, libc::EMSGSIZE as u32);
        assert_eq!(decoded.ee_info, 1400);
    }
}
