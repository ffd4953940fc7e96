use crate::api::models::{Message, MessageId, UserId};

/// Client-side copy of one conversation, ascending by timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalView {
    messages: Vec<Message>,
}

impl LocalView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wholesale replacement with a store snapshot.
    pub fn replace(&mut self, mut messages: Vec<Message>) {
        // ties keep store order, which is by id
        messages.sort_by_key(|m| m.created_at);
        self.messages = messages;
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Swaps the temporary entry `local` for its durable record.
    ///
    /// A reconciliation may already have replaced the view while the insert
    /// was in flight; then the durable record is only appended if the
    /// snapshot did not include it.
    pub fn confirm(&mut self, local: &MessageId, durable: Message) {
        if let Some(slot) = self.messages.iter_mut().find(|m| &m.id == local) {
            *slot = durable;
        } else if !self.messages.iter().any(|m| m.id == durable.id) {
            self.messages.push(durable);
        }
    }

    pub fn discard(&mut self, local: &MessageId) {
        self.messages.retain(|m| &m.id != local);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn latest(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn has_pending(&self) -> bool {
        self.messages.iter().any(|m| m.id.is_temporary())
    }
}

/// Durable ids of unread messages addressed to `viewer`.
pub(crate) fn unread_ids(messages: &[Message], viewer: &UserId) -> Vec<i64> {
    messages
        .iter()
        .filter(|m| m.is_addressed_to(viewer) && !m.is_read)
        .filter_map(|m| m.id.durable())
        .collect()
}
