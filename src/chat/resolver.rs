//! Works out who a chat surface is talking to.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use tokio::sync::watch;

use crate::api::models::{ConversationSummary, Profile, UserId};
use crate::chat::store::{MessageStore, ProfileDirectory};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability<T> {
    Pending,
    Available(T),
    Unavailable,
}

/// One way of finding the support admin, tried in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminLookup {
    RoleFlag,
    Email(String),
}

impl AdminLookup {
    /// Role query first, then the well-known address if there is one.
    pub fn chain(admin_email: Option<&str>) -> Vec<AdminLookup> {
        let mut chain = vec![AdminLookup::RoleFlag];
        if let Some(email) = admin_email.map(str::trim).filter(|e| !e.is_empty()) {
            chain.push(AdminLookup::Email(email.to_string()));
        }
        chain
    }

    pub async fn attempt(&self, directory: &dyn ProfileDirectory) -> Result<Option<Profile>> {
        match self {
            AdminLookup::RoleFlag => directory.find_admin().await,
            AdminLookup::Email(email) => directory.find_by_email(email).await,
        }
    }
}

pub struct CounterpartyResolver {
    directory: Arc<dyn ProfileDirectory>,
    strategies: Vec<AdminLookup>,
    cached: OnceCell<Profile>,
    status: watch::Sender<Availability<Profile>>,
}

impl CounterpartyResolver {
    pub fn new(directory: Arc<dyn ProfileDirectory>, strategies: Vec<AdminLookup>) -> Self {
        Self {
            directory,
            strategies,
            cached: OnceCell::new(),
            status: watch::Sender::new(Availability::Pending),
        }
    }

    pub fn availability(&self) -> Availability<Profile> {
        self.status.borrow().clone()
    }

    /// Finds the admin a tenant talks to. Safe to call repeatedly: a found
    /// admin is cached, an unavailable result is retried next time.
    pub async fn resolve_counterparty_for_user(&self) -> Availability<Profile> {
        if let Some(admin) = self.cached.get() {
            return Availability::Available(admin.clone());
        }

        for strategy in &self.strategies {
            match strategy.attempt(self.directory.as_ref()).await {
                Ok(Some(admin)) => {
                    info!("support admin resolved via {:?}: {}", strategy, admin.id);
                    let admin = self.cached.get_or_init(|| admin).clone();
                    self.status.send_replace(Availability::Available(admin.clone()));
                    return Availability::Available(admin);
                }
                Ok(None) => debug!("admin lookup {:?} found nothing", strategy),
                Err(e) => warn!("admin lookup {:?} failed: {}", strategy, e),
            }
        }

        warn!("no support admin could be resolved");
        self.status.send_replace(Availability::Unavailable);
        Availability::Unavailable
    }
}

/// Tenants who have written to `admin`, most recently active first.
pub async fn resolve_conversations_for_admin(
    store: &dyn MessageStore,
    admin: &UserId,
) -> Result<Vec<ConversationSummary>> {
    let rows = store.recent_senders_to(admin).await?;
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for row in rows {
        if &row.sender_id == admin {
            continue;
        }
        let embedded = row.profiles.unwrap_or_default();
        if embedded.is_admin || !seen.insert(row.sender_id.clone()) {
            continue;
        }
        out.push(ConversationSummary {
            profile: Profile {
                id: row.sender_id,
                email: embedded.email,
                full_name: embedded.full_name,
                is_admin: false,
            },
            last_message_at: row.created_at,
        });
    }
    Ok(out)
}

/// The first inbox entry becomes the selection only when nothing is selected.
pub fn default_selection(
    current: Option<&UserId>,
    inbox: &[ConversationSummary],
) -> Option<UserId> {
    current
        .cloned()
        .or_else(|| inbox.first().map(|c| c.profile.id.clone()))
}
