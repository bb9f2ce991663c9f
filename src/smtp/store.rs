//! Collaborators that decide who can receive mail and keep what arrives

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, mpsc};

use tracing::debug;

use crate::smtp::email::Email;
use crate::smtp::error::SinkError;

/// Answers whether an address is a deliverable local recipient.
///
/// Shared by every session of a server, so implementations must be safe to call concurrently.
pub trait RecipientValidator: Send + Sync {
    fn exists(&self, address: &str) -> bool;
}

/// Durably records completed messages.
///
/// Called at most once per completed envelope. There is no retry on failure.
pub trait MessageSink: Send + Sync {
    /// Store a message and return an identifier the client can be told about
    fn record(&self, sender: &str, recipient: &str, body: &[u8]) -> Result<MessageId, SinkError>;
}

/// Identifier of a stored message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// Identifier of a user in a [`MemoryStore`] directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserId(pub u64);

/// Accepts every recipient
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl RecipientValidator for AcceptAll {
    fn exists(&self, _address: &str) -> bool {
        true
    }
}

/// One stored message, keyed by [`MessageId`] in a [`MemoryStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: MessageId,
    /// The recipient's user, when the recipient is in the directory
    pub user: Option<UserId>,
    pub email: Email,
}

/// In-memory user directory and message table.
///
/// Addresses are compared ignoring ASCII case.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: HashMap<String, UserId>,
    messages: Mutex<BTreeMap<MessageId, StoredMessage>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store whose directory holds `addresses`
    pub fn with_users<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut store = Self::new();
        for address in addresses {
            store.add_user(address.as_ref());
        }
        store
    }

    /// Add an address to the directory, returning its user id
    pub fn add_user(&mut self, address: &str) -> UserId {
        let next = UserId(self.users.len() as u64 + 1);
        *self
            .users
            .entry(address.to_ascii_lowercase())
            .or_insert(next)
    }

    pub fn user(&self, address: &str) -> Option<UserId> {
        self.users.get(&address.to_ascii_lowercase()).copied()
    }

    /// Look up a stored message
    pub fn get(&self, id: MessageId) -> Option<StoredMessage> {
        self.lock().get(&id).cloned()
    }

    /// All stored messages, oldest first
    pub fn messages(&self) -> Vec<StoredMessage> {
        self.lock().values().cloned().collect()
    }

    /// Messages addressed to `address`
    pub fn messages_for(&self, address: &str) -> Vec<StoredMessage> {
        self.lock()
            .values()
            .filter(|message| message.email.to.eq_ignore_ascii_case(address))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<MessageId, StoredMessage>> {
        // A panic while holding the lock cannot leave a half-written entry behind.
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RecipientValidator for MemoryStore {
    fn exists(&self, address: &str) -> bool {
        self.user(address).is_some()
    }
}

impl MessageSink for MemoryStore {
    fn record(&self, sender: &str, recipient: &str, body: &[u8]) -> Result<MessageId, SinkError> {
        let id = MessageId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let message = StoredMessage {
            id,
            user: self.user(recipient),
            email: Email::from_parts(sender, recipient, body),
        };

        debug!(%id, sender, recipient, size = body.len(), "stored message");
        self.lock().insert(id, message);
        Ok(id)
    }
}

/// Hands every message to an [`mpsc`] channel as an [`Email`]
#[derive(Debug)]
pub struct ChannelSink {
    sender: mpsc::Sender<Email>,
    next_id: AtomicU64,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<Email>) -> Self {
        Self {
            sender,
            next_id: AtomicU64::new(0),
        }
    }
}

impl MessageSink for ChannelSink {
    fn record(&self, sender: &str, recipient: &str, body: &[u8]) -> Result<MessageId, SinkError> {
        self.sender
            .send(Email::from_parts(sender, recipient, body))
            .map_err(|_| SinkError::new("email receiver has been dropped"))?;

        Ok(MessageId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_all() {
        assert!(AcceptAll.exists("anyone@anywhere"));
    }

    #[test]
    fn test_directory_lookup() {
        let store = MemoryStore::with_users(["b@x.com", "Carol@X.com"]);

        assert!(store.exists("b@x.com"));
        assert!(store.exists("B@X.COM"));
        assert!(store.exists("carol@x.com"));
        assert!(!store.exists("nobody@example.com"));
        assert_eq!(store.user("b@x.com"), Some(UserId(1)));
        assert_eq!(store.user("carol@x.com"), Some(UserId(2)));
    }

    #[test]
    fn test_add_user_is_idempotent() {
        let mut store = MemoryStore::new();
        let first = store.add_user("b@x.com");
        let again = store.add_user("B@x.com");
        assert_eq!(first, again);
    }

    #[test]
    fn test_record_and_fetch() {
        let store = MemoryStore::with_users(["b@x.com"]);

        let id = store
            .record("a@x.com", "b@x.com", b"Hello\r\n.\r\nWorld\r\n")
            .unwrap();
        let message = store.get(id).unwrap();

        assert_eq!(message.id, id);
        assert_eq!(message.user, Some(UserId(1)));
        assert_eq!(message.email.from, "a@x.com");
        assert_eq!(message.email.to, "b@x.com");
        assert_eq!(message.email.data, "Hello\r\n.\r\nWorld\r\n");
    }

    #[test]
    fn test_record_without_directory_entry() {
        let store = MemoryStore::new();
        let id = store.record("a@x.com", "stranger@x.com", b"hi\r\n").unwrap();

        assert_eq!(store.get(id).unwrap().user, None);
    }

    #[test]
    fn test_ids_are_unique_and_ordered() {
        let store = MemoryStore::new();
        let first = store.record("a@x.com", "b@x.com", b"1\r\n").unwrap();
        let second = store.record("a@x.com", "c@x.com", b"2\r\n").unwrap();

        assert!(first < second);
        assert_eq!(store.len(), 2);
        assert_eq!(store.messages_for("C@x.com").len(), 1);
        let ids: Vec<MessageId> = store.messages().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![first, second]);
    }

    #[test]
    fn test_message_id_display() {
        assert_eq!(MessageId(255).to_string(), "000000FF");
    }

    #[test]
    fn test_channel_sink() {
        let (tx, rx) = mpsc::channel();
        let sink = ChannelSink::new(tx);

        sink.record("a@x.com", "b@x.com", b"Subject: hi\r\n\r\nbody\r\n")
            .unwrap();
        let email = rx.recv().unwrap();
        assert_eq!(email.from, "a@x.com");
        assert_eq!(email.to, "b@x.com");
        assert_eq!(email.get_subject(), Some("hi"));
    }

    #[test]
    fn test_channel_sink_without_receiver() {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        let sink = ChannelSink::new(tx);

        let err = sink.record("a@x.com", "b@x.com", b"").unwrap_err();
        assert_eq!(err.reason(), "email receiver has been dropped");
    }
}
