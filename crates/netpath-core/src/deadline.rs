//! A one-shot timer task that disables a `ManagedFd` when it fires,
//! translating a wall-clock deadline into a cooperative syscall
//! interruption instead of a per-call cancellation token.
//!
//! A background thread driven by channel messages (`Reset`/`Cancel`),
//! scaled down to a single timer task.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};

enum Msg {
    Reset(Duration),
    Cancel,
}

/// Background single-shot timer. `reset` rearms it; `cancel` stops it for
/// good. Once it fires (or is cancelled), it exits and further `reset`
/// calls are silently ignored — this is signalled by `reset` returning
/// `false`.
pub struct Deadliner {
    tx: Sender<Msg>,
    handle: Option<JoinHandle<()>>,
}

impl Deadliner {
    /// Spawns the timer armed for `initial`; `on_fire` runs exactly once,
    /// from the timer thread, if the deadline is reached before a `reset`
    /// or `cancel` arrives.
    pub fn start<F>(initial: Duration, on_fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, rx) = unbounded::<Msg>();
        let handle = thread::Builder::new()
            .name("netpath-deadliner".into())
            .spawn(move || {
                let mut deadline = initial;
                loop {
                    match rx.recv_timeout(deadline) {
                        Ok(Msg::Reset(d)) => {
                            deadline = d;
                            continue;
                        }
                        Ok(Msg::Cancel) => return,
                        Err(RecvTimeoutError::Timeout) => {
                            on_fire();
                            return;
                        }
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
            })
            .expect("spawn deadliner thread");
        Self { tx, handle: Some(handle) }
    }

    /// Rearms the timer for `t` from now. Returns `false` if the timer has
    /// already fired or been cancelled (the reset is then a no-op).
    pub fn reset(&self, t: Duration) -> bool {
        self.tx.send(Msg::Reset(t)).is_ok()
    }

    /// Cancels the timer. Idempotent: cancelling twice, or cancelling
    /// after it already fired, is a no-op.
    pub fn cancel(&self) {
        let _ = self.tx.send(Msg::Cancel);
    }
}

impl Drop for Deadliner {
    fn drop(&mut self) {
        self.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
