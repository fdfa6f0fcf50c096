//! Main Store struct tying feeds and sessions together.

use crate::error::{BrokerError, Result};
use crate::feeds::Feed;
use crate::filter::Filter;
use crate::reaper::Reaper;
use crate::sessions::Session;
use crate::types::{Message, SessionId};
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Attempts at drawing an unused session id before giving up.
const MAX_SESSION_ID_ATTEMPTS: usize = 8;

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Max messages buffered per feed for backfill.
    pub max_feed_messages: usize,

    /// Max age of a buffered message before the reaper expires it.
    pub max_feed_age: Duration,

    /// Max messages queued in one mailbox before it is disconnected.
    pub mailbox_backlog: usize,

    /// Idle time after which a delivery loop writes a blank heartbeat line.
    pub heartbeat_interval: Duration,

    /// Backfill used when a request does not give a usable value.
    pub default_backfill: usize,

    /// Upper bound on requested backfill.
    pub max_backfill: usize,

    /// How long a session may sit without any mailbox before it is stale.
    pub session_grace: Duration,

    /// How often the reaper sweeps for stale sessions and feeds.
    pub reap_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_feed_messages: 5000,
            max_feed_age: Duration::from_secs(2 * 60 * 60),
            mailbox_backlog: 5000,
            heartbeat_interval: Duration::from_secs(15),
            default_backfill: 100,
            max_backfill: 1500,
            session_grace: Duration::from_secs(60),
            reap_interval: Duration::from_secs(30),
        }
    }
}

impl StoreConfig {
    /// Clamp a requested backfill count into `[0, max_backfill]`.
    pub fn clamp_backfill(&self, requested: i64) -> usize {
        if requested <= 0 {
            0
        } else {
            usize::try_from(requested).map_or(self.max_backfill, |n| n.min(self.max_backfill))
        }
    }
}

/// Point-in-time counts for the store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub feeds: usize,
    pub sessions: usize,
    pub buffered_messages: usize,
    pub open_mailboxes: usize,
}

/// What one reaper sweep removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReapStats {
    pub sessions: usize,
    pub feeds: usize,
    pub expired_messages: usize,
}

/// Process-wide registry of feeds (by drain id) and sessions (by id).
///
/// Each registry has its own lock. Feed operations run while holding the
/// feed registry's read lock, so the reaper (which needs the write lock to
/// remove a feed) can never retire a feed that a publish or attach is using.
pub struct Store {
    config: StoreConfig,
    feeds: RwLock<HashMap<String, Arc<Feed>>>,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    shutting_down: AtomicBool,
    reaper: Mutex<Option<Reaper>>,
}

impl Store {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            feeds: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            reaper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // --- Sessions ---

    /// Create a session on `drain_id`, replaying up to `backfill` buffered
    /// messages into it before it goes live.
    pub fn create_session(
        &self,
        drain_id: &str,
        filter: Filter,
        backfill: usize,
    ) -> Result<Arc<Session>> {
        if self.is_shutting_down() {
            return Err(BrokerError::ShuttingDown);
        }

        let backfill = backfill.min(self.config.max_backfill);
        let id = self.unused_session_id()?;
        let session = Arc::new(Session::new(
            id,
            drain_id,
            filter,
            self.config.mailbox_backlog,
        ));

        let replayed = self.with_feed(drain_id, |feed| feed.attach(&session, backfill));

        {
            let mut sessions = self.sessions.write();
            let refused = if self.is_shutting_down() {
                Some(BrokerError::ShuttingDown)
            } else if sessions.contains_key(session.id()) {
                Some(BrokerError::IdSpaceExhausted("session"))
            } else {
                None
            };

            if let Some(err) = refused {
                drop(sessions);
                self.abandon(&session);
                return Err(err);
            }
            sessions.insert(session.id().clone(), Arc::clone(&session));
        }

        info!(
            session_id = %session.id(),
            drain_id,
            backfill,
            replayed,
            "created session"
        );
        Ok(session)
    }

    /// Destroy a session: unregister it, detach it from its feed and close
    /// its mailboxes. Returns false if the id is unknown.
    pub fn destroy_session(&self, session_id: &str) -> bool {
        let Some(session) = self.sessions.write().remove(session_id) else {
            return false;
        };

        self.detach(&session);
        session.close();

        info!(session_id, drain_id = session.drain_id(), "destroyed session");
        true
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(session_id).cloned()
    }

    // --- Ingest ---

    /// Publish a message to a drain, creating its feed if it has none.
    /// Returns the number of sessions that accepted the message.
    pub fn publish(&self, drain_id: &str, msg: Message) -> usize {
        let msg = Arc::new(msg);
        let delivered = self.with_feed(drain_id, |feed| feed.publish(msg));
        debug!(drain_id, delivered, "published message");
        delivered
    }

    /// Publish every message of one inbound batch, in order.
    pub fn publish_all<I>(&self, drain_id: &str, messages: I) -> usize
    where
        I: IntoIterator<Item = Message>,
    {
        messages
            .into_iter()
            .map(|msg| self.publish(drain_id, msg))
            .sum()
    }

    // --- Feeds ---

    /// Look up a drain's feed without creating it.
    pub fn feed(&self, drain_id: &str) -> Option<Arc<Feed>> {
        self.feeds.read().get(drain_id).cloned()
    }

    // --- Lifecycle ---

    /// Start the background reaper. Does nothing if it is already running.
    pub fn start_reaper(self: &Arc<Self>) -> Result<()> {
        if self.is_shutting_down() {
            return Err(BrokerError::ShuttingDown);
        }

        let mut reaper = self.reaper.lock();
        if reaper.is_none() {
            *reaper = Some(Reaper::spawn(
                Arc::downgrade(self),
                self.config.reap_interval,
            )?);
            debug!(interval = ?self.config.reap_interval, "started reaper");
        }
        Ok(())
    }

    /// One sweep: destroy stale sessions, expire old buffered messages and
    /// remove feeds that are left stale.
    pub fn reap(&self) -> ReapStats {
        let grace = self.config.session_grace;

        let stale_sessions: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write();
            let ids: Vec<SessionId> = sessions
                .iter()
                .filter(|(_, session)| session.stale(grace))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        for session in &stale_sessions {
            self.detach(session);
            session.close();
            debug!(session_id = %session.id(), "reaped stale session");
        }

        let expired_messages = self
            .feeds
            .read()
            .values()
            .map(|feed| feed.expire(self.config.max_feed_age))
            .sum::<usize>();

        let feeds = {
            let mut feeds = self.feeds.write();
            let before = feeds.len();
            feeds.retain(|_, feed| !feed.stale());
            before - feeds.len()
        };

        ReapStats {
            sessions: stale_sessions.len(),
            feeds,
            expired_messages,
        }
    }

    /// Shut down: refuse new sessions, close every live session (ending
    /// their delivery loops), drop all feeds and stop the reaper.
    pub fn close(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let sessions: Vec<Arc<Session>> =
            self.sessions.write().drain().map(|(_, session)| session).collect();
        for session in &sessions {
            session.close();
        }

        let feeds = {
            let mut feeds = self.feeds.write();
            let count = feeds.len();
            feeds.clear();
            count
        };

        let reaper = self.reaper.lock().take();
        drop(reaper);

        info!(sessions = sessions.len(), feeds, "store closed");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StoreStats {
        let (feeds, buffered_messages) = {
            let feeds = self.feeds.read();
            (feeds.len(), feeds.values().map(|feed| feed.len()).sum::<usize>())
        };
        let (sessions, open_mailboxes) = {
            let sessions = self.sessions.read();
            (
                sessions.len(),
                sessions.values().map(|s| s.mailbox_count()).sum::<usize>(),
            )
        };

        StoreStats {
            feeds,
            sessions,
            buffered_messages,
            open_mailboxes,
        }
    }

    // --- Internals ---

    /// Run `f` against the drain's feed, creating it if needed. The registry
    /// lock is held (shared) for the duration of `f`.
    fn with_feed<T>(&self, drain_id: &str, f: impl FnOnce(&Feed) -> T) -> T {
        {
            let feeds = self.feeds.read();
            if let Some(feed) = feeds.get(drain_id) {
                return f(feed);
            }
        }

        let mut feeds = self.feeds.write();
        let feed = Arc::clone(feeds.entry(drain_id.to_string()).or_insert_with(|| {
            debug!(drain_id, "created feed");
            Arc::new(Feed::new(drain_id, self.config.max_feed_messages))
        }));

        let _feeds = RwLockWriteGuard::downgrade(feeds);
        f(&feed)
    }

    fn detach(&self, session: &Session) {
        if let Some(feed) = self.feeds.read().get(session.drain_id()) {
            feed.detach(session.id().as_str());
        }
    }

    /// Undo a session that was attached but never registered. A feed the
    /// attach brought into being (e.g. racing `close`) goes with it.
    fn abandon(&self, session: &Session) {
        self.detach(session);
        session.close();

        let mut feeds = self.feeds.write();
        if feeds.get(session.drain_id()).is_some_and(|feed| feed.stale()) {
            feeds.remove(session.drain_id());
            debug!(drain_id = session.drain_id(), "removed feed of refused session");
        }
    }

    fn unused_session_id(&self) -> Result<SessionId> {
        let sessions = self.sessions.read();
        (0..MAX_SESSION_ID_ATTEMPTS)
            .map(|_| SessionId::generate())
            .find(|id| !sessions.contains_key(id))
            .ok_or(BrokerError::IdSpaceExhausted("session"))
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> Store {
        Store::new(StoreConfig::default())
    }

    #[test]
    fn test_get_session_empty() {
        let store = test_store();
        assert!(store.get_session("session.id").is_none());
    }

    #[test]
    fn test_create_session() {
        let store = test_store();
        let session = store
            .create_session("some.drain.id", Filter::accept_all(), 10)
            .unwrap();

        assert_eq!(store.feeds.read().len(), 1);
        let feed = store.feed("some.drain.id").unwrap();
        assert_eq!(feed.session_count(), 1);
        assert!(feed.has_session(session.id().as_str()));
        assert!(store.get_session(session.id().as_str()).is_some());
    }

    #[test]
    fn test_destroy_session() {
        let store = test_store();
        let session = store
            .create_session("some.drain.id", Filter::accept_all(), 10)
            .unwrap();

        assert!(store.destroy_session(session.id().as_str()));
        assert!(!store.sessions.read().contains_key(session.id()));
        assert!(!store
            .feed("some.drain.id")
            .unwrap()
            .has_session(session.id().as_str()));
        assert!(session.is_closed());

        assert!(!store.destroy_session(session.id().as_str()));
    }

    #[test]
    fn test_publish_creates_feed() {
        let store = test_store();
        assert_eq!(store.publish("unseen", Message::line("hi")), 0);
        assert_eq!(store.feed("unseen").unwrap().len(), 1);
    }

    #[test]
    fn test_clamp_backfill() {
        let config = StoreConfig::default();
        assert_eq!(config.clamp_backfill(-5), 0);
        assert_eq!(config.clamp_backfill(0), 0);
        assert_eq!(config.clamp_backfill(42), 42);
        assert_eq!(config.clamp_backfill(1_000_000), 1500);
    }

    #[test]
    fn test_reap_stale_session_and_feed() {
        let store = Store::new(StoreConfig {
            session_grace: Duration::ZERO,
            max_feed_age: Duration::ZERO,
            ..Default::default()
        });
        let session = store.create_session("d", Filter::accept_all(), 0).unwrap();
        store.publish("d", Message::line("old"));
        std::thread::sleep(Duration::from_millis(5));

        let reaped = store.reap();
        assert_eq!(reaped.sessions, 1);
        assert_eq!(reaped.expired_messages, 1);
        assert_eq!(reaped.feeds, 1);
        assert!(session.is_closed());
        assert_eq!(store.stats(), StoreStats::default());
    }

    #[test]
    fn test_reap_keeps_live_state() {
        let store = test_store();
        let session = store.create_session("d", Filter::accept_all(), 0).unwrap();
        let (_rx, _id) = session.add_mailbox().unwrap();
        store.publish("d", Message::line("fresh"));

        assert_eq!(store.reap(), ReapStats::default());
        assert_eq!(store.stats().sessions, 1);
        assert_eq!(store.stats().feeds, 1);
    }

    #[test]
    fn test_close_refuses_new_sessions() {
        let store = test_store();
        let session = store.create_session("d", Filter::accept_all(), 0).unwrap();

        store.close();
        assert!(session.is_closed());
        assert!(store.feed("d").is_none());
        assert!(matches!(
            store.create_session("d", Filter::accept_all(), 0),
            Err(BrokerError::ShuttingDown)
        ));

        // Publishing is still honored
        store.publish("d", Message::line("after close"));
    }

    #[test]
    fn test_refused_session_leaves_no_feed() {
        let store = test_store();
        let session = Arc::new(Session::new(
            SessionId::generate(),
            "late",
            Filter::accept_all(),
            store.config().mailbox_backlog,
        ));

        // Attach lands after close cleared the registry
        store.close();
        store.with_feed("late", |feed| feed.attach(&session, 0));
        assert_eq!(store.stats().feeds, 1);

        store.abandon(&session);
        assert!(session.is_closed());
        assert_eq!(store.stats().feeds, 0);
    }

    #[test]
    fn test_refused_session_keeps_busy_feed() {
        let store = test_store();
        store.publish("d", Message::line("buffered"));
        let session = Arc::new(Session::new(
            SessionId::generate(),
            "d",
            Filter::accept_all(),
            store.config().mailbox_backlog,
        ));
        store.with_feed("d", |feed| feed.attach(&session, 0));

        store.abandon(&session);
        let feed = store.feed("d").unwrap();
        assert_eq!(feed.session_count(), 0);
        assert_eq!(feed.len(), 1);
    }
}
