//! Contracts the chat layer consumes from the backend.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::api::models::{
    ChangeEvent, ConversationKey, Message, NewMessage, Profile, SenderActivity, UserId,
};
use crate::error::Result;

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// All messages between the pair, ascending by creation time.
    async fn fetch_conversation(&self, key: &ConversationKey) -> Result<Vec<Message>>;

    /// Persists a message and returns the durable record.
    async fn insert(&self, message: &NewMessage) -> Result<Message>;

    async fn mark_read(&self, ids: &[i64]) -> Result<()>;

    /// Messages sent to `recipient` by anyone else, newest first.
    async fn recent_senders_to(&self, recipient: &UserId) -> Result<Vec<SenderActivity>>;
}

#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn find_admin(&self) -> Result<Option<Profile>>;

    async fn find_by_email(&self, email: &str) -> Result<Option<Profile>>;
}

#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    /// Opens an unfiltered feed of changes to the message relation.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

/// A live change feed. Dropping it releases the underlying channel.
pub struct Subscription {
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    // the feed task watches the other half and shuts down once this is dropped
    _release: oneshot::Sender<()>,
}

impl Subscription {
    /// Returns the subscription plus the halves a feed task drives.
    pub fn channel() -> (Self, mpsc::UnboundedSender<ChangeEvent>, oneshot::Receiver<()>) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (release, released) = oneshot::channel();
        (
            Self {
                events,
                _release: release,
            },
            events_tx,
            released,
        )
    }

    /// Next change, or `None` once the feed has closed.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }
}
