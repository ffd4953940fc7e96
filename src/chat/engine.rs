//! Keeps one conversation's local view in step with the message store.
//!
//! Three things trigger a reconciliation: the initial fetch, a change
//! notification and the poll timer. All of them call the same
//! [`SyncEngine::fetch_and_reconcile`], which replaces the whole view with a
//! fresh store snapshot. Triggers are neither coalesced nor serialized; that
//! is only sound while reconciliation stays an idempotent total replace.

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, trace, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::api::models::{ConversationKey, Message, NewMessage};
use crate::chat::store::{ChangeNotifier, MessageStore};
use crate::chat::view::{LocalView, unread_ids};
use crate::error::{ChatError, Result};

pub const POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Realtime channel name, one per surface.
    pub channel: String,
    pub poll_interval: Duration,
    /// Delay before the reconciliation that follows a confirmed send.
    pub settle_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            channel: "support_chat".to_string(),
            poll_interval: POLL_INTERVAL,
            settle_delay: SETTLE_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Uninitialized,
    Syncing,
    Synced,
    Terminated,
}

struct Shared {
    key: ConversationKey,
    store: Arc<dyn MessageStore>,
    view: watch::Sender<LocalView>,
    draft: watch::Sender<String>,
    state: watch::Sender<SyncState>,
    last_error: watch::Sender<Option<String>>,
    in_flight: AtomicUsize,
    terminated: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn begin(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(SyncState::Syncing);
    }

    fn finish(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 && !self.is_terminated() {
            self.state.send_replace(SyncState::Synced);
        }
    }

    async fn reconcile(&self) -> Result<usize> {
        if self.is_terminated() {
            return Err(ChatError::Unavailable);
        }
        self.begin();
        let fetched = self.store.fetch_conversation(&self.key).await;
        if self.is_terminated() {
            debug!(
                "discarding fetch for closed conversation with {}",
                self.key.counterparty
            );
            return Err(ChatError::Unavailable);
        }

        match fetched {
            Ok(messages) => {
                let unread = unread_ids(&messages, &self.key.viewer);
                let mut next = LocalView::new();
                next.replace(messages);
                let count = next.len();
                self.view.send_if_modified(|view| {
                    if *view == next {
                        false
                    } else {
                        *view = next;
                        true
                    }
                });
                self.last_error.send_if_modified(|last| last.take().is_some());
                self.finish();
                self.mark_read(unread).await;
                Ok(count)
            }
            Err(e) => {
                // stale but consistent: the view keeps its last snapshot
                warn!(
                    "fetching conversation with {} failed: {}",
                    self.key.counterparty, e
                );
                let reason = e.to_string();
                self.last_error.send_if_modified(|last| {
                    if last.as_deref() == Some(reason.as_str()) {
                        false
                    } else {
                        *last = Some(reason.clone());
                        true
                    }
                });
                self.finish();
                Err(e)
            }
        }
    }

    async fn mark_read(&self, ids: Vec<i64>) {
        if ids.is_empty() {
            return;
        }
        match self.store.mark_read(&ids).await {
            Ok(()) => debug!("marked {} message(s) read", ids.len()),
            Err(e) => debug!("mark-read of {:?} failed, ignoring: {}", ids, e),
        }
    }

    /// Runs one reconciliation on its own task.
    fn trigger(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let _ = shared.reconcile().await;
        });
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_terminated() {
            task.abort();
            return;
        }
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

/// Owner of one conversation's [`LocalView`].
///
/// Dropping the engine tears it down.
pub struct SyncEngine {
    shared: Arc<Shared>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(key: ConversationKey, store: Arc<dyn MessageStore>, config: SyncConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                key,
                store,
                view: watch::Sender::new(LocalView::new()),
                draft: watch::Sender::new(String::new()),
                state: watch::Sender::new(SyncState::Uninitialized),
                last_error: watch::Sender::new(None),
                in_flight: AtomicUsize::new(0),
                terminated: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
            config,
        }
    }

    /// Builds an engine and brings it to `Synced`.
    pub async fn launch(
        key: ConversationKey,
        store: Arc<dyn MessageStore>,
        notifier: &dyn ChangeNotifier,
        config: SyncConfig,
    ) -> Result<Self> {
        let engine = Self::new(key, store, config);
        engine.start(notifier).await?;
        Ok(engine)
    }

    /// Initial fetch, then arms the change feed and the poll timer.
    /// Only the first call from `Uninitialized` does anything.
    pub async fn start(&self, notifier: &dyn ChangeNotifier) -> Result<()> {
        match self.state() {
            SyncState::Uninitialized => {}
            SyncState::Terminated => return Err(ChatError::Unavailable),
            _ => return Ok(()),
        }

        if let Err(e) = self.shared.reconcile().await {
            debug!("initial fetch failed, arming triggers anyway: {}", e);
        }
        if self.shared.is_terminated() {
            return Err(ChatError::Unavailable);
        }

        match notifier.subscribe(&self.config.channel).await {
            Ok(mut subscription) => {
                let shared = Arc::clone(&self.shared);
                self.shared.track(tokio::spawn(async move {
                    while let Some(change) = subscription.next().await {
                        trace!("{:?} on {}, reconciling", change.kind, change.table);
                        shared.trigger();
                    }
                    debug!("change feed closed, polling continues");
                }));
            }
            Err(e) => warn!(
                "subscribing to {} failed, relying on polling: {}",
                self.config.channel, e
            ),
        }

        let shared = Arc::clone(&self.shared);
        let period = self.config.poll_interval;
        self.shared.track(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                shared.trigger();
            }
        }));

        info!(
            "syncing conversation {} <-> {} on {}",
            self.shared.key.viewer, self.shared.key.counterparty, self.config.channel
        );
        Ok(())
    }

    /// Replaces the view with the store's current snapshot and marks the
    /// viewer's incoming messages read. Returns the number of messages.
    pub async fn fetch_and_reconcile(&self) -> Result<usize> {
        self.shared.reconcile().await
    }

    /// Optimistically appends `content`, then persists it.
    ///
    /// On failure the temporary entry is removed, the draft is restored to
    /// `content` and the error is returned.
    pub async fn send(&self, content: &str) -> Result<Message> {
        let body = content.trim();
        if body.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let shared = &self.shared;
        if shared.is_terminated() {
            return Err(ChatError::Unavailable);
        }

        shared.draft.send_replace(String::new());
        let pending = Message::pending(&shared.key, body);
        let local = pending.id;
        shared.view.send_modify(|view| view.push(pending));

        let outgoing = NewMessage {
            sender_id: shared.key.viewer.clone(),
            receiver_id: shared.key.counterparty.clone(),
            content: body.to_string(),
        };
        match shared.store.insert(&outgoing).await {
            Ok(durable) => {
                if !shared.is_terminated() {
                    let confirmed = durable.clone();
                    shared.view.send_modify(|view| view.confirm(&local, confirmed));
                    self.schedule_settle();
                }
                Ok(durable)
            }
            Err(e) => {
                warn!("sending to {} failed: {}", shared.key.counterparty, e);
                shared.view.send_modify(|view| view.discard(&local));
                shared.draft.send_replace(content.to_string());
                Err(e)
            }
        }
    }

    /// Sends whatever is in the compose draft.
    pub async fn send_draft(&self) -> Result<Message> {
        let draft = self.draft();
        self.send(&draft).await
    }

    fn schedule_settle(&self) {
        let shared = Arc::clone(&self.shared);
        let delay = self.config.settle_delay;
        self.shared.track(tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = shared.reconcile().await;
        }));
    }

    /// Cancels the poll timer and pending reconciliations and releases the
    /// change subscription. Fetches already in flight finish but are
    /// discarded.
    pub fn teardown(&self) {
        if self.shared.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks = mem::take(
            &mut *self
                .shared
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }
        self.shared.state.send_replace(SyncState::Terminated);
        info!(
            "stopped syncing conversation with {}",
            self.shared.key.counterparty
        );
    }

    pub fn key(&self) -> &ConversationKey {
        &self.shared.key
    }

    pub fn state(&self) -> SyncState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.shared.state.subscribe()
    }

    pub fn snapshot(&self) -> LocalView {
        self.shared.view.borrow().clone()
    }

    /// Receiver that wakes on every view change; surfaces scroll to the
    /// latest message from here.
    pub fn watch_view(&self) -> watch::Receiver<LocalView> {
        self.shared.view.subscribe()
    }

    pub fn draft(&self) -> String {
        self.shared.draft.borrow().clone()
    }

    pub fn set_draft(&self, text: impl Into<String>) {
        self.shared.draft.send_replace(text.into());
    }

    /// Error of the most recent failed fetch, cleared by the next success.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.borrow().clone()
    }

    /// Wakes when a fetch starts failing, fails differently, or recovers.
    pub fn watch_last_error(&self) -> watch::Receiver<Option<String>> {
        self.shared.last_error.subscribe()
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.teardown();
    }
}
