//! The server side of MTU probing: bind, set PMTU discovery to **probe**
//! so replies aren't silently fragmented, and echo every datagram back to
//! its sender via a [`Poller`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::warn;

use crate::address::Address;
use crate::error::NetResult;
use crate::poller::{Poller, Polled};
use crate::socket::{MtuDiscover, Socket};

type OnPacket = dyn FnMut(&[u8], &Address) + Send;

/// Binds a non-wildcard UDP address (so replies carry the right source IP)
/// and echoes every datagram verbatim back to its origin.
pub struct MtuEchoer {
    socket: Socket,
    poller: Poller,
    on_packet: Arc<Mutex<Option<Box<OnPacket>>>>,
}

impl MtuEchoer {
    pub fn bind(near: Address) -> NetResult<Self> {
        let mut socket = Socket::new();
        socket.set_near(near);
        socket.construct_udp();
        socket.set_opt_mtu_discover(MtuDiscover::Probe);
        socket.bind();
        socket.done()?;

        let fd = socket.as_raw_fd_checked().expect("just bound");
        let mut poller = Poller::open()?;
        let on_packet: Arc<Mutex<Option<Box<OnPacket>>>> = Arc::new(Mutex::new(None));
        let on_packet_clone = on_packet.clone();

        poller.add(Polled::new(fd).with_input(move || {
            let mut buf = vec![0u8; 65535];
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
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EAGAIN) || err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(true);
                }
                warn!(%err, "mtu echoer: recvfrom failed");
                return Ok(true);
            }
            buf.truncate(n as usize);
            let addr_buf =
                unsafe { std::slice::from_raw_parts(&storage as *const _ as *const u8, len as usize) };
            let from = match Address::from_name_bytes(addr_buf) {
                Ok(a) => a,
                Err(e) => {
                    warn!(%e, "mtu echoer: couldn't decode sender address");
                    return Ok(true);
                }
            };

            if let Some(cb) = on_packet_clone.lock().unwrap().as_mut() {
                cb(&buf, &from);
            }

            let view = from.as_sockaddr();
            let ret = unsafe {
                libc::sendto(fd, buf.as_ptr() as *const _, buf.len(), 0, view.as_ptr(), view.len() as libc::socklen_t)
            };
            if ret < 0 {
                warn!(err = %std::io::Error::last_os_error(), %from, "mtu echoer: echo send failed");
            }
            Ok(true)
        }))?;

        Ok(Self { socket, poller, on_packet })
    }

    /// Registers an observer invoked with each datagram and its sender
    /// before it's echoed back.
    pub fn on_packet(&mut self, f: impl FnMut(&[u8], &Address) + Send + 'static) {
        *self.on_packet.lock().unwrap() = Some(Box::new(f));
    }

    pub fn bound_addr(&self) -> Address {
        self.socket.near().unwrap_or_default()
    }

    pub fn run_for(&mut self, d: Duration) -> NetResult<()> {
        self.poller.poll_for(d)
    }

    pub fn run_forever(&mut self) -> NetResult<()> {
        self.poller.poll_forever()
    }

    pub fn disable(&self) -> NetResult<bool> {
        self.socket.fd_handle().disable()
    }
}
