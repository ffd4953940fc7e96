use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use support_chat::api::models::{
    ConversationKey, Message, NewMessage, Profile, SenderActivity, Session, UserId,
};
use support_chat::chat::engine::POLL_INTERVAL;
use support_chat::chat::{
    AdminConsole, Availability, ChatBackend, MessageStore, SurfaceKind, SyncConfig, SyncState,
    TenantChat,
};
use support_chat::storage::SqliteStore;
use support_chat::{ChatError, Result};

const ADMIN_EMAIL: &str = "frontdesk@example.com";

fn session(id: &str) -> Option<Session> {
    Some(Session {
        user_id: UserId::new(id),
        email: None,
        access_token: None,
    })
}

fn profile(id: &str, email: &str, name: &str, is_admin: bool) -> Profile {
    Profile {
        id: UserId::new(id),
        email: Some(email.to_string()),
        full_name: Some(name.to_string()),
        is_admin,
    }
}

async fn seeded(admin_flag: bool) -> Arc<SqliteStore> {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    store
        .upsert_profile(&profile("admin", ADMIN_EMAIL, "Front Desk", admin_flag))
        .await
        .unwrap();
    store
        .upsert_profile(&profile("amina", "amina@example.com", "Amina", false))
        .await
        .unwrap();
    store
        .upsert_profile(&profile("brian", "brian@example.com", "Brian", false))
        .await
        .unwrap();
    store
}

fn contents(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.content.as_str()).collect()
}

async fn settle() {
    tokio::time::sleep(Duration::from_secs(1)).await;
}

/// Counts conversation fetches per counterparty.
struct CountingStore {
    inner: Arc<SqliteStore>,
    fetches: Mutex<HashMap<UserId, usize>>,
}

impl CountingStore {
    fn fetches_with(&self, counterparty: &str) -> usize {
        self.fetches
            .lock()
            .unwrap()
            .get(&UserId::new(counterparty))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageStore for CountingStore {
    async fn fetch_conversation(&self, key: &ConversationKey) -> Result<Vec<Message>> {
        *self
            .fetches
            .lock()
            .unwrap()
            .entry(key.counterparty.clone())
            .or_default() += 1;
        self.inner.fetch_conversation(key).await
    }

    async fn insert(&self, message: &NewMessage) -> Result<Message> {
        self.inner.insert(message).await
    }

    async fn mark_read(&self, ids: &[i64]) -> Result<()> {
        self.inner.mark_read(ids).await
    }

    async fn recent_senders_to(&self, recipient: &UserId) -> Result<Vec<SenderActivity>> {
        self.inner.recent_senders_to(recipient).await
    }
}

#[tokio::test(start_paused = true)]
async fn guests_must_sign_in() {
    let backend = ChatBackend::from_shared(seeded(true).await);
    let result = TenantChat::open(
        SurfaceKind::Widget,
        None,
        &backend,
        Some(ADMIN_EMAIL),
        SyncConfig::default(),
    )
    .await;
    assert!(matches!(result, Err(ChatError::NotSignedIn)));
}

#[tokio::test(start_paused = true)]
async fn no_admin_means_unavailable() {
    let backend = ChatBackend::from_shared(seeded(false).await);
    let chat = TenantChat::open(
        SurfaceKind::Widget,
        session("amina"),
        &backend,
        Some("nobody@example.com"),
        SyncConfig::default(),
    )
    .await
    .unwrap();

    assert_eq!(chat.availability(), Availability::Unavailable);
    assert!(chat.engine().is_none());
    assert!(matches!(chat.send("hello?").await, Err(ChatError::Unavailable)));
}

#[tokio::test(start_paused = true)]
async fn admin_found_by_email_fallback() {
    let backend = ChatBackend::from_shared(seeded(false).await);
    let chat = TenantChat::open(
        SurfaceKind::Dashboard,
        session("amina"),
        &backend,
        Some(ADMIN_EMAIL),
        SyncConfig::default(),
    )
    .await
    .unwrap();

    match chat.availability() {
        Availability::Available(admin) => assert_eq!(admin.id, UserId::new("admin")),
        other => panic!("expected admin, got {:?}", other),
    }
    let engine = chat.engine().unwrap();
    assert_eq!(engine.state(), SyncState::Synced);
    assert_eq!(engine.key().counterparty, UserId::new("admin"));
}

#[tokio::test(start_paused = true)]
async fn rapid_sends_arrive_in_order() {
    let store = seeded(true).await;
    let backend = ChatBackend::from_shared(store.clone());
    let chat = TenantChat::open(
        SurfaceKind::Widget,
        session("amina"),
        &backend,
        None,
        SyncConfig::default(),
    )
    .await
    .unwrap();
    let engine = chat.engine().unwrap();

    let (hello, world) = tokio::join!(engine.send("hello"), engine.send("world"));
    hello.unwrap();
    world.unwrap();
    settle().await;

    let view = engine.snapshot();
    assert_eq!(contents(view.messages()), ["hello", "world"]);
    assert!(!view.has_pending());
    assert_eq!(store.message_count().await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn tenant_and_admin_see_each_other() {
    let store = seeded(true).await;
    let backend = ChatBackend::from_shared(store.clone());

    let tenant = TenantChat::open(
        SurfaceKind::Widget,
        session("amina"),
        &backend,
        Some(ADMIN_EMAIL),
        SyncConfig::default(),
    )
    .await
    .unwrap();
    tenant.send("Is the deluxe suite available in March?").await.unwrap();

    let admin = AdminConsole::open(session("admin"), backend.clone(), SyncConfig::default())
        .await
        .unwrap();
    assert_eq!(admin.selected(), Some(&UserId::new("amina")));
    let admin_engine = admin.engine().unwrap();
    admin_engine.send("Yes, from the 1st.").await.unwrap();
    settle().await;

    let tenant_view = tenant.engine().unwrap().snapshot();
    assert_eq!(
        contents(tenant_view.messages()),
        ["Is the deluxe suite available in March?", "Yes, from the 1st."]
    );
    // the admin's fetch marked the tenant's question read
    assert!(tenant_view.messages()[0].is_read);
    assert_eq!(tenant.last_error(), None);
    assert_eq!(admin.last_error(), None);
}

#[tokio::test(start_paused = true)]
async fn inbox_lists_latest_sender_first() {
    let store = seeded(true).await;
    for (from, text) in [("amina", "hi"), ("brian", "hello"), ("amina", "still there?")] {
        store
            .insert(&NewMessage {
                sender_id: UserId::new(from),
                receiver_id: UserId::new("admin"),
                content: text.to_string(),
            })
            .await
            .unwrap();
    }

    let admin = AdminConsole::open(
        session("admin"),
        ChatBackend::from_shared(store),
        SyncConfig::default(),
    )
    .await
    .unwrap();
    let names: Vec<_> = admin
        .conversations()
        .iter()
        .map(|c| c.profile.display_name())
        .collect();
    assert_eq!(names, ["Amina", "Brian"]);
    assert_eq!(admin.selected(), Some(&UserId::new("amina")));
}

#[tokio::test(start_paused = true)]
async fn refresh_opens_first_tenant_when_nothing_selected() {
    let store = seeded(true).await;
    let mut admin = AdminConsole::open(
        session("admin"),
        ChatBackend::from_shared(store.clone()),
        SyncConfig::default(),
    )
    .await
    .unwrap();
    assert!(admin.conversations().is_empty());
    assert_eq!(admin.selected(), None);
    assert!(admin.engine().is_none());

    store
        .insert(&NewMessage {
            sender_id: UserId::new("amina"),
            receiver_id: UserId::new("admin"),
            content: "The hallway light is out.".to_string(),
        })
        .await
        .unwrap();
    admin.refresh_inbox().await;

    assert_eq!(admin.conversations().len(), 1);
    assert_eq!(admin.selected(), Some(&UserId::new("amina")));
    let engine = admin.engine().unwrap();
    assert_eq!(engine.state(), SyncState::Synced);
    assert_eq!(
        contents(engine.snapshot().messages()),
        ["The hallway light is out."]
    );

    // a later refresh keeps the open conversation
    store
        .insert(&NewMessage {
            sender_id: UserId::new("brian"),
            receiver_id: UserId::new("admin"),
            content: "Parking question".to_string(),
        })
        .await
        .unwrap();
    admin.refresh_inbox().await;
    assert_eq!(admin.conversations().len(), 2);
    assert_eq!(admin.selected(), Some(&UserId::new("amina")));
}

#[tokio::test(start_paused = true)]
async fn switching_tenant_stops_old_conversation() {
    let sqlite = seeded(true).await;
    for from in ["brian", "amina"] {
        sqlite
            .insert(&NewMessage {
                sender_id: UserId::new(from),
                receiver_id: UserId::new("admin"),
                content: format!("message from {}", from),
            })
            .await
            .unwrap();
    }
    let counting = Arc::new(CountingStore {
        inner: sqlite.clone(),
        fetches: Mutex::new(HashMap::new()),
    });
    let backend = ChatBackend::new(counting.clone(), sqlite.clone(), sqlite.clone());

    let mut admin = AdminConsole::open(session("admin"), backend, SyncConfig::default())
        .await
        .unwrap();
    let first = admin.selected().cloned().unwrap();
    let second = admin
        .conversations()
        .iter()
        .map(|c| c.profile.id.clone())
        .find(|id| id != &first)
        .unwrap();

    tokio::time::sleep(POLL_INTERVAL + Duration::from_millis(100)).await;
    assert!(counting.fetches_with(first.as_str()) >= 2);

    admin.select(second.clone()).await.unwrap();
    let frozen = counting.fetches_with(first.as_str());
    tokio::time::sleep(POLL_INTERVAL * 5).await;

    assert_eq!(counting.fetches_with(first.as_str()), frozen);
    assert!(counting.fetches_with(second.as_str()) >= 5);
    assert_eq!(admin.engine().unwrap().key().counterparty, second);
}

#[tokio::test(start_paused = true)]
async fn closing_a_surface_ends_sync() {
    let store = seeded(true).await;
    let backend = ChatBackend::from_shared(store);
    let mut chat = TenantChat::open(
        SurfaceKind::Widget,
        session("brian"),
        &backend,
        None,
        SyncConfig::default(),
    )
    .await
    .unwrap();
    let mut states = chat.engine().unwrap().watch_state();

    chat.close();
    assert_eq!(*states.borrow_and_update(), SyncState::Terminated);
    assert!(chat.engine().is_none());
}
