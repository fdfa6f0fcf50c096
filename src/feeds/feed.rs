//! Per-drain broadcast feed.

use super::buffer::FeedBuffer;
use crate::sessions::Session;
use crate::types::{Message, SessionId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// One drain's replay buffer and the sessions attached to it.
///
/// Lock order is buffer, then sessions. `publish` holds the buffer lock for
/// the whole append/fan-out/evict cycle and `attach` holds it while it
/// replays, so a session sees every message exactly once across the
/// backfill/live boundary. Mailbox pushes never block, so holding the locks
/// across fan-out cannot stall the feed on a slow subscriber.
pub struct Feed {
    drain_id: String,
    buffer: RwLock<FeedBuffer>,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl Feed {
    pub fn new(drain_id: impl Into<String>, max_count: usize) -> Self {
        Self {
            drain_id: drain_id.into(),
            buffer: RwLock::new(FeedBuffer::new(max_count)),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn drain_id(&self) -> &str {
        &self.drain_id
    }

    /// Replay up to `backfill` of the newest buffered messages to `session`,
    /// oldest first, then register it for live delivery.
    ///
    /// Returns the number of replayed messages the session accepted.
    pub fn attach(&self, session: &Arc<Session>, backfill: usize) -> usize {
        let buffer = self.buffer.read();

        let replayed = buffer
            .last_n(backfill)
            .iter()
            .filter(|msg| session.publish(msg))
            .count();

        self.sessions
            .write()
            .insert(session.id().clone(), Arc::clone(session));

        debug!(
            drain_id = %self.drain_id,
            session_id = %session.id(),
            backfill,
            replayed,
            "attached session"
        );
        replayed
    }

    /// Remove a session from live fan-out. Buffered history is untouched.
    pub fn detach(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().remove(session_id).is_some();
        if removed {
            debug!(drain_id = %self.drain_id, session_id, "detached session");
        }
        removed
    }

    /// Append `msg`, deliver it to every attached session, then evict
    /// overflow. Returns the number of sessions whose filter accepted it.
    pub fn publish(&self, msg: Arc<Message>) -> usize {
        let mut buffer = self.buffer.write();
        buffer.push(Arc::clone(&msg));

        let delivered = self
            .sessions
            .read()
            .values()
            .filter(|session| session.publish(&msg))
            .count();

        let evicted = buffer.evict_overflow();
        if evicted > 0 {
            debug!(drain_id = %self.drain_id, evicted, "evicted buffered messages");
        }
        delivered
    }

    /// A feed is stale when nothing is attached and nothing is buffered.
    pub fn stale(&self) -> bool {
        if !self.sessions.read().is_empty() {
            return false;
        }
        self.buffer.read().is_empty()
    }

    /// Drop buffered messages older than `max_age`.
    pub fn expire(&self, max_age: Duration) -> usize {
        self.buffer.write().expire(max_age, Instant::now())
    }

    pub fn len(&self) -> usize {
        self.buffer.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.read().is_empty()
    }

    /// Snapshot of the buffered messages, oldest first.
    pub fn buffered(&self) -> Vec<Arc<Message>> {
        self.buffer.read().messages()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.read().contains_key(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use crossbeam_channel::Receiver;

    fn session() -> Arc<Session> {
        Arc::new(Session::new(SessionId::generate(), "drain.id", Filter::accept_all(), 100))
    }

    fn drain(rx: &Receiver<Arc<Message>>) -> Vec<String> {
        rx.try_iter().map(|m| m.render()).collect()
    }

    #[test]
    fn test_attach_detach() {
        let feed = Feed::new("drain.id", 100);
        let session = session();

        feed.attach(&session, 0);
        assert!(feed.has_session(session.id().as_str()));

        assert!(feed.detach(session.id().as_str()));
        assert!(!feed.has_session(session.id().as_str()));

        // Detaching again is a no-op
        assert!(!feed.detach(session.id().as_str()));
        assert_eq!(feed.session_count(), 0);
    }

    #[test]
    fn test_publish_bounds_buffer() {
        let feed = Feed::new("drain.id", 2);
        for text in ["message 1", "message 2", "message 3"] {
            feed.publish(Arc::new(Message::line(text)));
        }

        let buffered: Vec<_> = feed.buffered().iter().map(|m| m.render()).collect();
        assert_eq!(buffered, vec!["message 2", "message 3"]);
    }

    #[test]
    fn test_backfill_then_live() {
        let feed = Feed::new("drain.id", 100);
        for i in 1..=10 {
            feed.publish(Arc::new(Message::line(format!("m{}", i))));
        }

        let session = session();
        let (rx, _id) = session.add_mailbox().unwrap();
        assert_eq!(feed.attach(&session, 3), 3);
        feed.publish(Arc::new(Message::line("m11")));

        assert_eq!(drain(&rx), vec!["m8", "m9", "m10", "m11"]);
    }

    #[test]
    fn test_publish_counts_filter_acceptance() {
        let feed = Feed::new("drain.id", 100);
        let all = session();
        let picky = Arc::new(Session::new(
            SessionId::generate(),
            "drain.id",
            Filter::contains("", "error"),
            100,
        ));
        feed.attach(&all, 0);
        feed.attach(&picky, 0);

        assert_eq!(feed.publish(Arc::new(Message::line("ok"))), 1);
        assert_eq!(feed.publish(Arc::new(Message::line("error: boom"))), 2);
    }

    #[test]
    fn test_stale() {
        let feed = Feed::new("drain.id", 100);
        assert!(feed.stale());

        let session = session();
        feed.attach(&session, 0);
        assert!(!feed.stale());

        feed.detach(session.id().as_str());
        feed.publish(Arc::new(Message::line("kept")));
        assert!(!feed.stale());

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(feed.expire(Duration::ZERO), 1);
        assert!(feed.stale());
    }
}
