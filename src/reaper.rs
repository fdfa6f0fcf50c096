//! Background sweep of stale sessions and feeds.

use crate::store::Store;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

/// Handle to the reaper thread. Dropping it stops the thread.
pub(crate) struct Reaper {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Reaper {
    /// Spawn a thread that calls [`Store::reap`] every `interval` until
    /// stopped or until the store is gone.
    pub(crate) fn spawn(store: Weak<Store>, interval: Duration) -> std::io::Result<Self> {
        let (stop, stopped) = bounded::<()>(0);

        let thread = thread::Builder::new()
            .name("drainfeed-reaper".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                let Some(store) = store.upgrade() else {
                    break;
                };
                let reaped = store.reap();
                if reaped.sessions > 0 || reaped.feeds > 0 {
                    debug!(
                        sessions = reaped.sessions,
                        feeds = reaped.feeds,
                        expired = reaped.expired_messages,
                        "reaped stale state"
                    );
                }
            })?;

        Ok(Self {
            stop: Some(stop),
            thread: Some(thread),
        })
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        // Disconnecting the channel wakes the thread
        self.stop.take();

        if let Some(thread) = self.thread.take() {
            // The last store handle may be released on the reaper thread itself
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}
