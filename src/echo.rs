//! `netpath-probe echo` — runs the MTU echo responder in the foreground
//! until Ctrl-C.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use netpath_core::{Address, MtuEchoer};

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

pub fn run(bind: &str) -> Result<()> {
    let (host, port) = bind
        .rsplit_once(':')
        .with_context(|| format!("--bind '{bind}' must be host:port"))?;
    let port: u16 = port.parse().with_context(|| format!("'{port}' is not a valid port"))?;
    let near = netpath_core::resolve::resolve_default(host, port)
        .with_context(|| format!("resolving bind address {bind}"))?;

    let mut echoer = MtuEchoer::bind(near).with_context(|| format!("binding echoer on {bind}"))?;
    echoer.on_packet(|buf, from: &Address| {
        tracing::trace!(bytes = buf.len(), %from, "echoing packet");
    });

    RUNNING.store(true, Ordering::SeqCst);
    unsafe { libc::signal(libc::SIGINT, handle_sigint as *const () as libc::sighandler_t) };

    println!("netpath-probe echo — listening on {bind}, Ctrl-C to stop");

    while RUNNING.load(Ordering::SeqCst) {
        echoer.run_for(Duration::from_millis(200))?;
    }

    println!("stopping.");
    Ok(())
}
