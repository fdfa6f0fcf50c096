//! Core types for the broker.

use rand::rngs::OsRng;
use rand::RngCore;
use sha1::{Digest, Sha1};
use std::borrow::{Borrow, Cow};
use std::fmt;

/// Number of random bytes hashed into a session id.
const SESSION_ENTROPY_BYTES: usize = 16;

/// Chunk size used when pulling from the entropy source, so a failure part
/// way through only costs the chunks that were not yet filled.
const ENTROPY_CHUNK: usize = 4;

/// Named field of a structured syslog record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Field {
    PrivalVersion,
    Time,
    Hostname,
    AppName,
    ProcId,
    MsgId,
    Payload,
}

impl Field {
    /// Resolve a user supplied field name, ignoring case and accepting the
    /// common aliases.
    pub fn resolve(name: &str) -> Option<Field> {
        let field = match name.to_ascii_lowercase().as_str() {
            "privalversion" | "prival_version" | "prival" | "pri" => Field::PrivalVersion,
            "time" | "timestamp" => Field::Time,
            "hostname" | "host" => Field::Hostname,
            "appname" | "app_name" | "app" | "name" => Field::AppName,
            "procid" | "proc_id" | "process" => Field::ProcId,
            "msgid" | "msg_id" => Field::MsgId,
            "payload" | "message" | "msg" => Field::Payload,
            _ => return None,
        };
        Some(field)
    }
}

/// A parsed syslog record. Every field is kept as the raw bytes read off the
/// wire.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyslogFields {
    pub prival_version: Vec<u8>,
    pub time: Vec<u8>,
    pub hostname: Vec<u8>,
    pub app_name: Vec<u8>,
    pub proc_id: Vec<u8>,
    pub msg_id: Vec<u8>,
    pub payload: Vec<u8>,
}

impl SyslogFields {
    /// Raw bytes of a field.
    pub fn get(&self, field: Field) -> &[u8] {
        match field {
            Field::PrivalVersion => &self.prival_version,
            Field::Time => &self.time,
            Field::Hostname => &self.hostname,
            Field::AppName => &self.app_name,
            Field::ProcId => &self.proc_id,
            Field::MsgId => &self.msg_id,
            Field::Payload => &self.payload,
        }
    }

    /// All fields as text, space separated, in wire order.
    pub fn joined(&self) -> String {
        format!(
            "{} {} {} {} {} {} {}",
            String::from_utf8_lossy(&self.prival_version),
            String::from_utf8_lossy(&self.time),
            String::from_utf8_lossy(&self.hostname),
            String::from_utf8_lossy(&self.app_name),
            String::from_utf8_lossy(&self.proc_id),
            String::from_utf8_lossy(&self.msg_id),
            String::from_utf8_lossy(&self.payload),
        )
    }
}

/// An immutable log record.
///
/// Messages are shared between the feed buffer and every mailbox they are
/// delivered to behind an `Arc`, so they are never copied during fan-out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// An opaque text line.
    Line(String),
    /// A structured syslog record.
    Syslog(SyslogFields),
}

impl Message {
    /// Create an opaque line message.
    pub fn line(text: impl Into<String>) -> Self {
        Message::Line(text.into())
    }

    /// Create a structured message.
    pub fn syslog(fields: SyslogFields) -> Self {
        Message::Syslog(fields)
    }

    /// Look up a field as text.
    ///
    /// An empty name means the whole message: the line itself, or for a
    /// structured record its space separated fields without the length
    /// prefix. Opaque lines otherwise only answer to the payload aliases; any
    /// other name is absent.
    pub fn field(&self, name: &str) -> Option<Cow<'_, str>> {
        if name.is_empty() {
            return Some(match self {
                Message::Line(text) => Cow::Borrowed(text.as_str()),
                Message::Syslog(fields) => Cow::Owned(fields.joined()),
            });
        }

        let field = Field::resolve(name)?;
        match self {
            Message::Line(text) if field == Field::Payload => Some(Cow::Borrowed(text.as_str())),
            Message::Line(_) => None,
            Message::Syslog(fields) => Some(String::from_utf8_lossy(fields.get(field))),
        }
    }

    /// Render the message as a single delivery line (without the newline).
    ///
    /// Structured records are rendered octet-counted: the byte length of the
    /// space separated fields, a space, then the fields.
    pub fn render(&self) -> String {
        match self {
            Message::Line(text) => text.clone(),
            Message::Syslog(fields) => {
                let body = fields.joined();
                format!("{} {}", body.len(), body)
            }
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Line(text) => f.write_str(text),
            Message::Syslog(_) => f.write_str(&self.render()),
        }
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Line(text.to_string())
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Line(text)
    }
}

/// Opaque, unguessable session identifier: 40 lowercase hex characters.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh id from the operating system's entropy source.
    pub fn generate() -> Self {
        Self::from_entropy(&mut OsRng)
    }

    /// Generate an id from `source`. If the source fails, the bytes it did
    /// not fill are taken from the thread-local pseudo-random generator
    /// instead, so an id is always produced.
    pub fn from_entropy<R: RngCore + ?Sized>(source: &mut R) -> Self {
        SessionId(hex::encode(Sha1::digest(entropy_bytes(source))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Fill the id seed from `source`, topping up from the thread-local PRNG
/// whatever the source failed to provide.
fn entropy_bytes<R: RngCore + ?Sized>(source: &mut R) -> [u8; SESSION_ENTROPY_BYTES] {
    let mut bytes = [0u8; SESSION_ENTROPY_BYTES];
    let mut filled = 0;

    for chunk in bytes.chunks_mut(ENTROPY_CHUNK) {
        if let Err(e) = source.try_fill_bytes(chunk) {
            tracing::warn!(error = %e, filled, "entropy source failed, using fallback");
            break;
        }
        filled += chunk.len();
    }

    if filled < SESSION_ENTROPY_BYTES {
        rand::thread_rng().fill_bytes(&mut bytes[filled..]);
    }

    bytes
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({}...)", &self.0[..8.min(self.0.len())])
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one mailbox within a session.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MailboxId(pub u32);

impl fmt::Debug for MailboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MailboxId({:08x})", self.0)
    }
}

impl fmt::Display for MailboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}
