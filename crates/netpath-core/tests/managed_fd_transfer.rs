//! `ManagedFd` transfer scenario: a pipe fd is `set` on `A`, moved to `B`
//! via `from`, and `B` ends up owning the one kernel fd exactly once.

use netpath_core::ManagedFd;

fn pipe_fds() -> (i32, i32) {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    (fds[0], fds[1])
}

#[test]
fn transfer_moves_state_and_closes_exactly_once() {
    let (r, w) = pipe_fds();
    let a = ManagedFd::new();
    let b = ManagedFd::new();

    a.set(r).unwrap();
    b.from(&a).unwrap();

    assert!(a.is_empty(), "source must be emptied by the transfer");
    assert!(b.is_open());
    assert_eq!(b.raw_fd(), Some(r));

    b.close().unwrap();
    assert!(b.close().is_err(), "second close attempt must return an error, not double-close");

    unsafe { libc::close(w) };
}
