//! Per-drain feeds.
//!
//! A feed keeps a bounded window of the most recent messages published to
//! one drain and fans every new message out to the sessions attached to it.
//! Newly attached sessions are first replayed a slice of that window.

mod buffer;
mod feed;

pub use buffer::FeedBuffer;
pub use feed::Feed;
