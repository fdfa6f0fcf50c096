//! # Drain Feed
//!
//! An in-memory log tailing broker. Log lines are published per drain and
//! fanned out in near real time to any number of live sessions, each with its
//! own filter and an optional replay of recent history.
//!
//! ## Core Concepts
//!
//! - **Feeds**: One per drain; a bounded replay buffer plus attached sessions
//! - **Sessions**: A filter and a set of bounded mailboxes, one per open
//!   streaming connection
//! - **Store**: The registry of feeds and sessions, with shutdown and a
//!   background reaper for stale state
//!
//! ## Example
//!
//! ```ignore
//! use drainfeed::{Filter, Message, Store, StoreConfig};
//!
//! let store = Arc::new(Store::new(StoreConfig::default()));
//! store.start_reaper()?;
//!
//! let session = store.create_session("d.1234", Filter::contains("", "error"), 100)?;
//! store.publish("d.1234", Message::line("error: disk full"));
//!
//! // On the connection's thread
//! session.serve(&mut connection, store.config().heartbeat_interval)?;
//! ```

pub mod error;
pub mod feeds;
pub mod filter;
mod reaper;
pub mod requests;
pub mod sessions;
pub mod store;
pub mod types;

// Re-exports
pub use error::{BrokerError, Result};
pub use feeds::{Feed, FeedBuffer};
pub use filter::Filter;
pub use requests::{parse_backfill, parse_session_request, FilterSpec, SessionRequest};
pub use sessions::{DeliveryStats, Session};
pub use store::{ReapStats, Store, StoreConfig, StoreStats};
pub use types::{Field, MailboxId, Message, SessionId, SyslogFields};
