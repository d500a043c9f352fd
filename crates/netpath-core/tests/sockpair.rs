//! Writing on one end of a stream socketpair is read back verbatim on the
//! other, routed through `ManagedFd::set` rather than `Socket`'s own
//! constructor (the pair already exists; we're handing existing fds to the
//! managed lifecycle, not building a new socket from scratch).

use netpath_core::ManagedFd;

fn make_pair() -> (i32, i32) {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    (fds[0], fds[1])
}

#[test]
fn write_one_end_read_other() {
    let (a, b) = make_pair();
    let ma = ManagedFd::new();
    let mb = ManagedFd::new();
    ma.set(a).unwrap();
    mb.set(b).unwrap();

    let fd_a = ma.acquire().unwrap();
    let written = unsafe { libc::write(fd_a, b"the quick brown fox".as_ptr() as *const _, 20) };
    assert_eq!(written, 20);
    ma.release().unwrap();

    let fd_b = mb.acquire().unwrap();
    let mut buf = [0u8; 20];
    let read = unsafe { libc::read(fd_b, buf.as_mut_ptr() as *mut _, buf.len()) };
    assert_eq!(read, 20);
    assert_eq!(&buf, b"the quick brown fox");
    mb.release().unwrap();

    ma.close().unwrap();
    mb.close().unwrap();
}
