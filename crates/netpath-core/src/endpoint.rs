//! Vectorised datagram I/O: `recvmmsg`/`sendmmsg` over a pre-allocated
//! batch of message headers, so a single syscall moves many packets.
//!
//! The backing `Vec<mmsghdr>` plus iovec/sockaddr/control arrays are
//! pinned once at construction and reused across every call rather than
//! allocated per packet.

use std::time::Duration;

use crate::address::Address;
use crate::error::{NetError, NetResult};

/// One batch's worth of pinned storage for `recvmmsg`/`sendmmsg`: `messages`
/// headers, each pointing at its own slice of a flat iovec buffer and its
/// own slice of a flat name/control buffer.
///
/// All backing storage (`iovs`, `names`, `controls`, `bufs`) is owned here
/// and never reallocated after `setup_vectors`, since the kernel holds raw
/// pointers into it for the duration of each syscall.
pub struct Endpoint {
    headers: Vec<libc::mmsghdr>,
    iovs: Vec<libc::iovec>,
    names: Vec<u8>,
    controls: Vec<u8>,
    bufs: Vec<u8>,
    iovs_per: usize,
    buf_len: usize,
    control_len: usize,
    messages: usize,
}

const NAME_LEN: usize = std::mem::size_of::<libc::sockaddr_storage>();

impl Endpoint {
    /// Allocates `messages * iovs_per` iovec entries, `messages` message
    /// headers, and per-message name/control/payload storage, then calls
    /// `iov_fill(msg_index, iov_index, buf)` for every iovec slot and
    /// `name_fill(msg_index, name_buf)` for every destination name. Message
    /// headers start wired to the first `iovs_per` entries of each buffer;
    /// `iov_fill` populates content, it does not resize anything.
    pub fn setup_vectors(
        messages: usize,
        iovs_per: usize,
        buf_len: usize,
        control_len: usize,
        mut iov_fill: impl FnMut(usize, usize, &mut [u8]),
        mut name_fill: impl FnMut(usize, &mut [u8]),
    ) -> Self {
        let mut bufs = vec![0u8; messages * iovs_per * buf_len];
        let mut names = vec![0u8; messages * NAME_LEN];
        let mut controls = vec![0u8; messages * control_len];
        let mut iovs = vec![libc::iovec { iov_base: std::ptr::null_mut(), iov_len: 0 }; messages * iovs_per];

        for m in 0..messages {
            for i in 0..iovs_per {
                let start = (m * iovs_per + i) * buf_len;
                iov_fill(m, i, &mut bufs[start..start + buf_len]);
            }
            let name_start = m * NAME_LEN;
            name_fill(m, &mut names[name_start..name_start + NAME_LEN]);
        }

        // Iovecs must point at `bufs`'s final address, so wire them up
        // after every `iov_fill` call has run (and therefore after the
        // `Vec` is done growing).
        for m in 0..messages {
            for i in 0..iovs_per {
                let idx = m * iovs_per + i;
                let start = idx * buf_len;
                iovs[idx] = libc::iovec {
                    iov_base: bufs[start..].as_mut_ptr() as *mut libc::c_void,
                    iov_len: buf_len,
                };
            }
        }

        let mut headers = Vec::with_capacity(messages);
        for m in 0..messages {
            let iov_start = m * iovs_per;
            let name_start = m * NAME_LEN;
            let control_start = m * control_len;
            let msg_hdr = libc::msghdr {
                msg_name: names[name_start..].as_mut_ptr() as *mut libc::c_void,
                msg_namelen: NAME_LEN as libc::socklen_t,
                msg_iov: iovs[iov_start..].as_mut_ptr(),
                msg_iovlen: iovs_per,
                msg_control: if control_len > 0 {
                    controls[control_start..].as_mut_ptr() as *mut libc::c_void
                } else {
                    std::ptr::null_mut()
                },
                msg_controllen: control_len,
                msg_flags: 0,
            };
            headers.push(libc::mmsghdr { msg_hdr, msg_len: 0 });
        }

        Self { headers, iovs, names, controls, bufs, iovs_per, buf_len, control_len, messages }
    }

    pub fn messages(&self) -> usize {
        self.messages
    }

    /// Bytes written by `iov_fill`/read back after `recv_mmsg`, for message
    /// `m`, iovec `i`.
    pub fn payload(&self, m: usize, i: usize) -> &[u8] {
        let start = (m * self.iovs_per + i) * self.buf_len;
        &self.bufs[start..start + self.buf_len]
    }

    pub fn payload_mut(&mut self, m: usize, i: usize) -> &mut [u8] {
        let start = (m * self.iovs_per + i) * self.buf_len;
        &mut self.bufs[start..start + self.buf_len]
    }

    pub fn control(&self, m: usize) -> &[u8] {
        let start = m * self.control_len;
        let len = self.headers[m].msg_hdr.msg_controllen;
        &self.controls[start..start + len]
    }

    /// Actual bytes received into iovec 0 of message `m` after a
    /// `recv_mmsg` call (kernel-reported `msg_len`, clamped to `buf_len`
    /// for single-iovec messages).
    pub fn received_len(&self, m: usize) -> usize {
        (self.headers[m].msg_len as usize).min(self.buf_len)
    }

    pub fn name(&self, m: usize) -> NetResult<Address> {
        let len = self.headers[m].msg_hdr.msg_namelen as usize;
        let start = m * NAME_LEN;
        Address::from_name_bytes(&self.names[start..start + len.max(std::mem::size_of::<libc::sa_family_t>())])
    }

    /// Sends all `avail` messages starting at the head of the header
    /// array, retrying internally on `EINTR`/`EAGAIN`/`ECONNREFUSED` (a
    /// connected UDP socket sees the latter when the peer isn't up yet)
    /// and advancing past whatever the kernel accepted on partial
    /// progress. Returns the number of retries performed.
    pub fn send_mmsg_retry(&mut self, fd: i32, avail: usize) -> NetResult<u32> {
        let mut sent = 0usize;
        let mut retries = 0u32;
        while sent < avail {
            let ptr = unsafe { self.headers.as_mut_ptr().add(sent) };
            let remaining = (avail - sent) as libc::c_uint;
            let ret = unsafe { libc::sendmmsg(fd, ptr, remaining, 0) };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(e) if e == libc::EINTR || e == libc::EAGAIN || e == libc::ECONNREFUSED => {
                        retries += 1;
                        std::thread::yield_now();
                        continue;
                    }
                    _ => return Err(NetError::kernel("sendmmsg", err)),
                }
            }
            sent += ret as usize;
        }
        Ok(retries)
    }

    /// Receives up to `self.messages()` messages in one `recvmmsg` call.
    /// Returns the number of messages actually received. A shutdown
    /// (`ManagedFd::disable`) surfaces as exactly one message with
    /// `received_len(0) == 0`; callers distinguish this from a genuine
    /// empty datagram by checking the fd's `is_disabled()` state.
    pub fn recv_mmsg(&mut self, fd: i32, timeout: Option<Duration>) -> NetResult<usize> {
        let mut ts = timeout.map(|t| libc::timespec {
            tv_sec: t.as_secs() as libc::time_t,
            tv_nsec: t.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts.as_mut().map(|t| t as *mut libc::timespec).unwrap_or(std::ptr::null_mut());
        let n = unsafe {
            libc::recvmmsg(fd, self.headers.as_mut_ptr(), self.headers.len() as libc::c_uint, 0, ts_ptr)
        };
        if n < 0 {
            return Err(NetError::kernel("recvmmsg", std::io::Error::last_os_error()));
        }
        Ok(n as usize)
    }

    /// Rearms the control/namelen fields a `recvmmsg` call mutates, ready
    /// for the next receive with the same pinned storage. `recvmmsg`
    /// shrinks `msg_namelen`/`msg_controllen` to the bytes actually used;
    /// without resetting them the next call would only have room for what
    /// the last one received.
    pub fn rearm(&mut self) {
        for h in &mut self.headers {
            h.msg_hdr.msg_namelen = NAME_LEN as libc::socklen_t;
            h.msg_hdr.msg_controllen = self.control_len;
            h.msg_len = 0;
        }
    }
}

// SAFETY: `Endpoint` owns all the storage its raw pointers reference; it
// holds no borrowed references and the pointers are never read across the
// `Send` boundary concurrently with a mutation here.
unsafe impl Send for Endpoint {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::os::unix::io::AsRawFd;

    fn udp_socket(port: u16) -> std::net::UdpSocket {
        std::net::UdpSocket::bind(("127.0.0.1", port)).unwrap()
    }

    #[test]
    fn sendmmsg_then_recvmmsg_roundtrip() {
        let receiver = udp_socket(0);
        let recv_addr = receiver.local_addr().unwrap();
        let sender = udp_socket(0);

        let payload = b"the quick brown fox";
        let mut send_ep = Endpoint::setup_vectors(
            2,
            1,
            payload.len(),
            0,
            |_m, _i, buf| buf.copy_from_slice(payload),
            |m, name_buf| {
                let dst = Address::from_ip_port(recv_addr.ip(), recv_addr.port());
                let len = dst.as_name_bytes(name_buf).unwrap();
                let _ = m;
                let _ = len;
            },
        );
        let retries = send_ep.send_mmsg_retry(sender.as_raw_fd(), 2).unwrap();
        assert_eq!(retries, 0);

        let mut recv_ep = Endpoint::setup_vectors(4, 1, payload.len(), 0, |_, _, _| {}, |_, _| {});
        // Give the kernel a moment to deliver both datagrams to the local
        // loopback socket buffer.
        std::thread::sleep(Duration::from_millis(20));
        let n = recv_ep.recv_mmsg(receiver.as_raw_fd(), Some(Duration::from_millis(200))).unwrap();
        assert_eq!(n, 2);
        for m in 0..n {
            assert_eq!(recv_ep.received_len(m), payload.len());
            assert_eq!(recv_ep.payload(m, 0), payload);
            let from = recv_ep.name(m).unwrap();
            assert_eq!(from.as_ipaddr(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
    }

    #[test]
    fn zero_timeout_recv_mmsg_returns_none_available() {
        let receiver = udp_socket(0);
        let mut recv_ep = Endpoint::setup_vectors(1, 1, 64, 0, |_, _, _| {}, |_, _| {});
        let n = recv_ep.recv_mmsg(receiver.as_raw_fd(), Some(Duration::from_millis(10)));
        // EAGAIN is surfaced verbatim: recvmmsg with a short timeout and no
        // data returns an error, not Ok(0).
        assert!(n.is_err());
    }
}
