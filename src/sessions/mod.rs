//! Sessions and their delivery mailboxes.
//!
//! A session is one logical subscription to a drain: a filter fixed at
//! creation plus a set of bounded mailboxes, one per open streaming
//! connection. Every message the filter accepts is pushed to all of them.
//!
//! # Example
//!
//! ```ignore
//! let session = store.create_session("drain.id", Filter::accept_all(), 0)?;
//!
//! // Blocks until the session is destroyed or the writer fails
//! let stats = session.serve(&mut connection, Duration::from_secs(15))?;
//! ```

mod delivery;
mod session;

pub use delivery::DeliveryStats;
pub use session::Session;
