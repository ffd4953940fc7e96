//! The places a conversation is shown: the floating widget and dashboard
//! panel on the tenant side, and the admin console.

use std::sync::Arc;

use log::{info, warn};

use crate::api::models::{ConversationKey, ConversationSummary, Message, Profile, Session, UserId};
use crate::chat::engine::{SyncConfig, SyncEngine};
use crate::chat::resolver::{
    AdminLookup, Availability, CounterpartyResolver, default_selection,
    resolve_conversations_for_admin,
};
use crate::chat::store::{ChangeNotifier, MessageStore, ProfileDirectory};
use crate::error::{ChatError, Result};

/// The backend collaborators a surface needs.
#[derive(Clone)]
pub struct ChatBackend {
    pub store: Arc<dyn MessageStore>,
    pub directory: Arc<dyn ProfileDirectory>,
    pub notifier: Arc<dyn ChangeNotifier>,
}

impl ChatBackend {
    pub fn new(
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn ProfileDirectory>,
        notifier: Arc<dyn ChangeNotifier>,
    ) -> Self {
        Self {
            store,
            directory,
            notifier,
        }
    }

    /// One object serving all three contracts, like the embedded store.
    pub fn from_shared<B>(backend: Arc<B>) -> Self
    where
        B: MessageStore + ProfileDirectory + ChangeNotifier + 'static,
    {
        Self {
            store: backend.clone(),
            directory: backend.clone(),
            notifier: backend,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceKind {
    Widget,
    Dashboard,
    AdminConsole,
}

impl SurfaceKind {
    pub fn channel(&self) -> &'static str {
        match self {
            SurfaceKind::Widget => "support_chat_widget",
            SurfaceKind::Dashboard => "messages_changes",
            SurfaceKind::AdminConsole => "messages_admin",
        }
    }
}

pub struct TenantChat {
    kind: SurfaceKind,
    session: Session,
    resolver: CounterpartyResolver,
    engine: Option<SyncEngine>,
}

impl TenantChat {
    /// Resolves the support admin and, if there is one, starts syncing.
    ///
    /// Guests get `NotSignedIn`. A missing admin is not an error: the chat
    /// opens in the `Unavailable` state without an engine.
    pub async fn open(
        kind: SurfaceKind,
        session: Option<Session>,
        backend: &ChatBackend,
        admin_email: Option<&str>,
        sync: SyncConfig,
    ) -> Result<Self> {
        let session = session.ok_or(ChatError::NotSignedIn)?;
        let resolver = CounterpartyResolver::new(
            backend.directory.clone(),
            AdminLookup::chain(admin_email),
        );

        let engine = match resolver.resolve_counterparty_for_user().await {
            Availability::Available(admin) => {
                let key = ConversationKey::new(session.user_id.clone(), admin.id);
                let config = SyncConfig {
                    channel: kind.channel().to_string(),
                    ..sync
                };
                Some(
                    SyncEngine::launch(key, backend.store.clone(), backend.notifier.as_ref(), config)
                        .await?,
                )
            }
            _ => {
                warn!("{:?} opened without support admin", kind);
                None
            }
        };

        Ok(Self {
            kind,
            session,
            resolver,
            engine,
        })
    }

    pub fn kind(&self) -> SurfaceKind {
        self.kind
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn availability(&self) -> Availability<Profile> {
        self.resolver.availability()
    }

    pub fn engine(&self) -> Option<&SyncEngine> {
        self.engine.as_ref()
    }

    pub async fn send(&self, content: &str) -> Result<Message> {
        self.engine
            .as_ref()
            .ok_or(ChatError::Unavailable)?
            .send(content)
            .await
    }

    pub fn last_error(&self) -> Option<String> {
        self.engine.as_ref().and_then(SyncEngine::last_error)
    }

    pub fn close(&mut self) {
        if let Some(engine) = self.engine.take() {
            engine.teardown();
        }
    }
}

pub struct AdminConsole {
    session: Session,
    backend: ChatBackend,
    sync: SyncConfig,
    inbox: Availability<Vec<ConversationSummary>>,
    selected: Option<UserId>,
    engine: Option<SyncEngine>,
}

impl AdminConsole {
    /// Loads the inbox and opens its most recent conversation.
    pub async fn open(session: Option<Session>, backend: ChatBackend, sync: SyncConfig) -> Result<Self> {
        let session = session.ok_or(ChatError::NotSignedIn)?;
        let mut console = Self {
            session,
            backend,
            sync: SyncConfig {
                channel: SurfaceKind::AdminConsole.channel().to_string(),
                ..sync
            },
            inbox: Availability::Pending,
            selected: None,
            engine: None,
        };
        console.reload_inbox().await;
        console.select_default().await?;
        Ok(console)
    }

    /// Reloads the tenant list. The current selection is kept; with nothing
    /// selected the most recent tenant is opened.
    pub async fn refresh_inbox(&mut self) -> &Availability<Vec<ConversationSummary>> {
        self.reload_inbox().await;
        if let Err(e) = self.select_default().await {
            warn!("opening newest conversation failed: {}", e);
        }
        &self.inbox
    }

    async fn reload_inbox(&mut self) {
        self.inbox =
            match resolve_conversations_for_admin(self.backend.store.as_ref(), &self.session.user_id)
                .await
            {
                Ok(list) => Availability::Available(list),
                Err(e) => {
                    warn!("loading inbox failed: {}", e);
                    Availability::Unavailable
                }
            };
    }

    async fn select_default(&mut self) -> Result<()> {
        if self.engine.is_some() {
            return Ok(());
        }
        let next = default_selection(self.selected.as_ref(), self.conversations());
        match next {
            Some(tenant) => self.select(tenant).await,
            None => Ok(()),
        }
    }

    pub fn inbox(&self) -> &Availability<Vec<ConversationSummary>> {
        &self.inbox
    }

    pub fn conversations(&self) -> &[ConversationSummary] {
        match &self.inbox {
            Availability::Available(list) => list.as_slice(),
            _ => &[],
        }
    }

    pub fn selected(&self) -> Option<&UserId> {
        self.selected.as_ref()
    }

    pub fn engine(&self) -> Option<&SyncEngine> {
        self.engine.as_ref()
    }

    /// Switches to `tenant`. The previous conversation is torn down first.
    pub async fn select(&mut self, tenant: UserId) -> Result<()> {
        if self.selected.as_ref() == Some(&tenant) && self.engine.is_some() {
            return Ok(());
        }
        if let Some(previous) = self.engine.take() {
            previous.teardown();
        }
        self.selected = Some(tenant.clone());
        info!("admin console switching to {}", tenant);

        let key = ConversationKey::new(self.session.user_id.clone(), tenant);
        let engine = SyncEngine::launch(
            key,
            self.backend.store.clone(),
            self.backend.notifier.as_ref(),
            self.sync.clone(),
        )
        .await?;
        self.engine = Some(engine);
        Ok(())
    }

    pub async fn send(&self, content: &str) -> Result<Message> {
        self.engine
            .as_ref()
            .ok_or(ChatError::Unavailable)?
            .send(content)
            .await
    }

    pub fn last_error(&self) -> Option<String> {
        self.engine.as_ref().and_then(SyncEngine::last_error)
    }

    pub fn close(&mut self) {
        if let Some(engine) = self.engine.take() {
            engine.teardown();
        }
        self.selected = None;
    }
}
