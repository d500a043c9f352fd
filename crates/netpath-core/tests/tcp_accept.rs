//! TCP accept/read scenario: listener on loopback, client connects and
//! writes a fixed payload, the accepted side reads exactly those bytes.

use std::net::IpAddr;
use std::thread;

use netpath_core::Address;
use netpath_core::Socket;

#[test]
fn accept_then_read_exact_payload() {
    let near: IpAddr = "127.0.0.1".parse().unwrap();

    let mut listener = Socket::new();
    listener.set_near(Address::from_ip_port(near, 0));
    listener.construct_tcp();
    listener.set_opt_reuse_addr(&[]);
    listener.bind();
    listener.listen(16);
    listener.done().unwrap();

    let bound = listener.near().unwrap();

    let client = thread::spawn(move || {
        let mut client = Socket::new();
        client.set_far(bound);
        client.construct_tcp();
        client.connect();
        client.done().unwrap();
        client.send(b"the quick brown fox").unwrap();
        client.close().unwrap();
    });

    let mut accepted = Socket::new();
    listener.accept(&mut accepted).unwrap();

    let mut buf = [0u8; 19];
    let mut got = 0;
    while got < buf.len() {
        let (n, _from) = accepted.recvfrom(&mut buf[got..]).unwrap();
        assert!(n > 0, "peer closed before sending the full payload");
        got += n;
    }
    assert_eq!(&buf, b"the quick brown fox");

    client.join().unwrap();
    accepted.close().unwrap();
    listener.close().unwrap();
}
