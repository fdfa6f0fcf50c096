//! Streaming delivery loop.

use super::session::Session;
use crate::error::Result;
use crate::types::MailboxId;
use crossbeam_channel::RecvTimeoutError;
use std::io::Write;
use std::time::Duration;
use tracing::debug;

/// Counters for one finished delivery loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Message lines written.
    pub messages: u64,
    /// Blank heartbeat lines written.
    pub heartbeats: u64,
}

/// Unregisters the mailbox when the loop ends, however it ends.
struct Registration<'a> {
    session: &'a Session,
    id: MailboxId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.session.remove_mailbox(self.id);
    }
}

impl Session {
    /// Stream this session to `out` until its mailbox is closed.
    ///
    /// Each message is written as its rendered line plus a newline. When no
    /// message arrives within `heartbeat`, a bare newline is written instead.
    /// Every line is flushed. A write failure (the far end went away) ends the
    /// loop with an error; closure of the mailbox ends it normally.
    pub fn serve<W: Write>(&self, mut out: W, heartbeat: Duration) -> Result<DeliveryStats> {
        let (receiver, id) = self.add_mailbox()?;
        let _registration = Registration { session: self, id };
        let mut stats = DeliveryStats::default();

        debug!(session_id = %self.id(), mailbox_id = %id, "delivery started");
        out.flush()?;

        loop {
            match receiver.recv_timeout(heartbeat) {
                Ok(msg) => {
                    let mut line = msg.render();
                    line.push('\n');
                    out.write_all(line.as_bytes())?;
                    stats.messages += 1;
                }
                Err(RecvTimeoutError::Timeout) => {
                    out.write_all(b"\n")?;
                    stats.heartbeats += 1;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
            out.flush()?;
        }

        debug!(
            session_id = %self.id(),
            mailbox_id = %id,
            messages = stats.messages,
            heartbeats = stats.heartbeats,
            "delivery finished"
        );
        Ok(stats)
    }
}
