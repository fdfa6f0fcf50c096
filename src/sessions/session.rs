//! A single subscription to a drain.

use crate::error::{BrokerError, Result};
use crate::filter::Filter;
use crate::types::{MailboxId, Message, SessionId};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Attempts at drawing an unused random mailbox id before giving up.
const MAX_MAILBOX_ID_ATTEMPTS: usize = 16;

/// Mutable state guarded by the session's lock.
struct MailboxSet {
    senders: HashMap<MailboxId, Sender<Arc<Message>>>,
    /// Messages accepted while no mailbox was open, handed to the next one.
    pending: VecDeque<Arc<Message>>,
    /// Last time a mailbox was removed. Starts at creation time.
    last_removal: Instant,
    closed: bool,
}

/// One logical subscriber: a fixed filter plus any number of live mailboxes.
///
/// Pushes into a mailbox never block. A mailbox whose backlog is full is
/// disconnected: its sender is dropped so its delivery loop drains what is
/// already queued and then ends.
pub struct Session {
    id: SessionId,
    drain_id: String,
    filter: Filter,
    backlog: usize,
    created_at: Instant,
    mailboxes: RwLock<MailboxSet>,
}

impl Session {
    /// Create a session whose mailboxes each hold up to `backlog` messages.
    pub fn new(id: SessionId, drain_id: impl Into<String>, filter: Filter, backlog: usize) -> Self {
        let now = Instant::now();
        Self {
            id,
            drain_id: drain_id.into(),
            filter,
            backlog: backlog.max(1),
            created_at: now,
            mailboxes: RwLock::new(MailboxSet {
                senders: HashMap::new(),
                pending: VecDeque::new(),
                last_removal: now,
                closed: false,
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn drain_id(&self) -> &str {
        &self.drain_id
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Offer a message to the session.
    ///
    /// Returns false if the filter rejects it (or the session is closed).
    /// Otherwise the message is pushed to every open mailbox, or held as
    /// pending if none is open, and true is returned.
    pub fn publish(&self, msg: &Arc<Message>) -> bool {
        if !self.filter.passes(msg) {
            return false;
        }

        let mut set = self.mailboxes.write();
        if set.closed {
            return false;
        }

        if set.senders.is_empty() {
            if set.pending.len() >= self.backlog {
                set.pending.pop_front();
            }
            set.pending.push_back(Arc::clone(msg));
            return true;
        }

        let mut dropped = Vec::new();
        for (id, sender) in set.senders.iter() {
            match sender.try_send(Arc::clone(msg)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        session_id = %self.id,
                        mailbox_id = %id,
                        backlog = self.backlog,
                        "mailbox full, disconnecting slow subscriber"
                    );
                    dropped.push(*id);
                }
                Err(TrySendError::Disconnected(_)) => dropped.push(*id),
            }
        }

        if !dropped.is_empty() {
            for id in dropped {
                set.senders.remove(&id);
            }
            set.last_removal = Instant::now();
        }
        true
    }

    /// Open a new mailbox and register it under a fresh random id.
    ///
    /// Messages that arrived while no mailbox was open are queued into the
    /// new mailbox first, in order.
    pub fn add_mailbox(&self) -> Result<(Receiver<Arc<Message>>, MailboxId)> {
        let (sender, receiver) = bounded(self.backlog);

        let mut set = self.mailboxes.write();
        if set.closed {
            return Err(BrokerError::SessionClosed(self.id.clone()));
        }

        let id = (0..MAX_MAILBOX_ID_ATTEMPTS)
            .map(|_| MailboxId(rand::random()))
            .find(|id| !set.senders.contains_key(id))
            .ok_or(BrokerError::IdSpaceExhausted("mailbox"))?;

        let pending = set.pending.len();
        for msg in set.pending.drain(..) {
            // pending is bounded by the mailbox capacity
            let _ = sender.try_send(msg);
        }
        set.senders.insert(id, sender);

        debug!(session_id = %self.id, mailbox_id = %id, pending, "added mailbox");
        Ok((receiver, id))
    }

    /// Unregister a mailbox. Returns false if it was not registered.
    pub fn remove_mailbox(&self, id: MailboxId) -> bool {
        let mut set = self.mailboxes.write();
        let removed = set.senders.remove(&id).is_some();
        if removed {
            set.last_removal = Instant::now();
            debug!(session_id = %self.id, mailbox_id = %id, "removed mailbox");
        }
        removed
    }

    /// Close every mailbox and refuse new ones.
    ///
    /// Dropping the senders disconnects the channels, which ends any
    /// delivery loop reading from them once their queue is drained.
    pub fn close(&self) {
        let closed = {
            let mut set = self.mailboxes.write();
            set.closed = true;
            set.pending.clear();
            std::mem::take(&mut set.senders)
        };
        debug!(session_id = %self.id, mailboxes = closed.len(), "closed session");
    }

    pub fn is_closed(&self) -> bool {
        self.mailboxes.read().closed
    }

    /// A session with an open mailbox is never stale. Without one, it is
    /// stale once `grace` has passed since the last removal (or since
    /// creation, if it never had a mailbox).
    pub fn stale(&self, grace: Duration) -> bool {
        let set = self.mailboxes.read();
        set.senders.is_empty() && set.last_removal.elapsed() >= grace
    }

    pub fn mailbox_count(&self) -> usize {
        self.mailboxes.read().senders.len()
    }

    /// Number of accepted messages waiting for a mailbox to open.
    pub fn pending_count(&self) -> usize {
        self.mailboxes.read().pending.len()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("drain_id", &self.drain_id)
            .field("mailboxes", &self.mailbox_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(filter: Filter, backlog: usize) -> Session {
        Session::new(SessionId::generate(), "drain.id", filter, backlog)
    }

    fn msg(text: &str) -> Arc<Message> {
        Arc::new(Message::line(text))
    }

    #[test]
    fn test_publish_respects_filter() {
        let session = session(Filter::contains("", "foo"), 10);
        let (rx, _) = session.add_mailbox().unwrap();

        assert!(session.publish(&msg("foo bar")));
        assert!(!session.publish(&msg("baz")));

        let received: Vec<_> = rx.try_iter().map(|m| m.render()).collect();
        assert_eq!(received, vec!["foo bar"]);
    }

    #[test]
    fn test_fans_out_to_every_mailbox() {
        let session = session(Filter::accept_all(), 10);
        let (a, id_a) = session.add_mailbox().unwrap();
        let (b, id_b) = session.add_mailbox().unwrap();
        assert_ne!(id_a, id_b);
        assert_eq!(session.mailbox_count(), 2);

        session.publish(&msg("one"));
        session.publish(&msg("two"));

        for rx in [a, b] {
            let received: Vec<_> = rx.try_iter().map(|m| m.render()).collect();
            assert_eq!(received, vec!["one", "two"]);
        }
    }

    #[test]
    fn test_pending_handed_to_first_mailbox() {
        let session = session(Filter::accept_all(), 2);
        session.publish(&msg("1"));
        session.publish(&msg("2"));
        session.publish(&msg("3"));
        assert_eq!(session.pending_count(), 2);

        let (rx, _) = session.add_mailbox().unwrap();
        assert_eq!(session.pending_count(), 0);
        let received: Vec<_> = rx.try_iter().map(|m| m.render()).collect();
        assert_eq!(received, vec!["2", "3"]);
    }

    #[test]
    fn test_full_mailbox_is_disconnected() {
        let session = session(Filter::accept_all(), 2);
        let (rx, _) = session.add_mailbox().unwrap();

        for i in 0..3 {
            session.publish(&msg(&i.to_string()));
        }
        assert_eq!(session.mailbox_count(), 0);

        // What was queued is still readable, then the mailbox reads as closed
        assert_eq!(rx.recv().unwrap().render(), "0");
        assert_eq!(rx.recv().unwrap().render(), "1");
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_close_disconnects_mailboxes() {
        let session = session(Filter::accept_all(), 10);
        let (rx, _) = session.add_mailbox().unwrap();

        session.close();
        assert!(session.is_closed());
        assert_eq!(session.mailbox_count(), 0);
        assert!(rx.recv().is_err());
        assert!(!session.publish(&msg("late")));
        assert!(matches!(
            session.add_mailbox(),
            Err(BrokerError::SessionClosed(_))
        ));
    }

    #[test]
    fn test_remove_mailbox() {
        let session = session(Filter::accept_all(), 10);
        let (_rx, id) = session.add_mailbox().unwrap();
        assert!(session.remove_mailbox(id));
        assert!(!session.remove_mailbox(id));
        assert_eq!(session.mailbox_count(), 0);
    }

    #[test]
    fn test_stale() {
        let session = session(Filter::accept_all(), 10);
        assert!(!session.stale(Duration::from_secs(60)));
        assert!(session.stale(Duration::ZERO));

        let (_rx, id) = session.add_mailbox().unwrap();
        assert!(!session.stale(Duration::ZERO));

        session.remove_mailbox(id);
        assert!(!session.stale(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(20));
        assert!(session.stale(Duration::from_millis(10)));
    }
}
