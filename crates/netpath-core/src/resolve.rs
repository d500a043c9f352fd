//! Host → IP resolution and the handful of byte-order helpers the rest of
//! the crate shares.
//!
//! DNS resolution goes through the standard resolver (`getaddrinfo` via
//! `std::net::ToSocketAddrs`), which can block indefinitely on a broken
//! resolver; we run it on a helper thread and bound it with
//! [`DEFAULT_RESOLVE_TIMEOUT`] rather than trusting it to return promptly.

use std::net::ToSocketAddrs;
use std::time::Duration;

use crate::address::Address;
use crate::error::{NetError, NetResult};

/// Default timeout for a blocking host resolution.
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(7);

/// Resolves `host:port` and returns the first address the resolver hands
/// back, bounded by `timeout`.
pub fn resolve(host: &str, port: u16, timeout: Duration) -> NetResult<Address> {
    let query = format!("{host}:{port}");
    let (tx, rx) = crossbeam_channel::bounded(1);
    let handle = std::thread::Builder::new()
        .name("netpath-resolve".into())
        .spawn(move || {
            let result = query
                .to_socket_addrs()
                .map_err(|e| NetError::argument(format!("resolving {query}: {e}")))
                .and_then(|mut it| {
                    it.next()
                        .ok_or_else(|| NetError::argument(format!("no addresses for {query}")))
                });
            let _ = tx.send(result);
        })
        .expect("spawn resolver thread");

    let outcome = rx.recv_timeout(timeout).unwrap_or_else(|_| {
        Err(NetError::Timeout)
    });
    // The resolver thread may still be blocked in getaddrinfo after a
    // timeout; we deliberately don't join it; it exits on its own once
    // the OS resolver call returns and the (now-disconnected) send is a
    // no-op.
    drop(handle);
    outcome.map(|sockaddr| Address::from_ip_port(sockaddr.ip(), sockaddr.port()))
}

/// Resolves `host:port` using [`DEFAULT_RESOLVE_TIMEOUT`].
pub fn resolve_default(host: &str, port: u16) -> NetResult<Address> {
    resolve(host, port, DEFAULT_RESOLVE_TIMEOUT)
}

#[inline]
pub fn htons(v: u16) -> u16 {
    v.to_be()
}

#[inline]
pub fn ntohs(v: u16) -> u16 {
    u16::from_be(v)
}

#[inline]
pub fn htonl(v: u32) -> u32 {
    v.to_be()
}

#[inline]
pub fn ntohl(v: u32) -> u32 {
    u32::from_be(v)
}
