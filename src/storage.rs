use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::fs;
use std::path::Path;
use tokio::sync::{Mutex, broadcast};
use tokio::sync::broadcast::error::RecvError;

use crate::api::models::{
    ChangeEvent, ChangeKind, ConversationKey, Message, MessageId, NewMessage, Profile,
    SenderActivity, SenderProfile, UserId,
};
use crate::chat::store::{ChangeNotifier, MessageStore, ProfileDirectory, Subscription};
use crate::error::Result;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS profiles (
        id TEXT PRIMARY KEY,
        email TEXT UNIQUE,
        full_name TEXT,
        is_admin INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        sender_id TEXT NOT NULL,
        receiver_id TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at TEXT NOT NULL,
        is_read INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS messages_pair ON messages (sender_id, receiver_id, created_at);
"#;

fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: MessageId::Durable(row.get(0)?),
        sender_id: UserId(row.get(1)?),
        receiver_id: UserId(row.get(2)?),
        content: row.get(3)?,
        created_at: row.get(4)?,
        is_read: row.get(5)?,
    })
}

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<Profile> {
    Ok(Profile {
        id: UserId(row.get(0)?),
        email: row.get(1)?,
        full_name: row.get(2)?,
        is_admin: row.get(3)?,
    })
}

/// Embedded message store with the same contracts as the hosted backend.
/// Every write is broadcast to local change subscribers.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        ensure_dir(path)?;
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("opened {} (journal_mode={})", path.display(), mode);
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        let (changes, _) = broadcast::channel(64);
        Ok(Self {
            conn: Mutex::new(conn),
            changes,
        })
    }

    fn publish(&self, kind: ChangeKind) {
        // no subscribers is fine
        let _ = self.changes.send(ChangeEvent {
            table: "messages".to_string(),
            kind,
        });
    }

    pub async fn upsert_profile(&self, profile: &Profile) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO profiles (id, email, full_name, is_admin)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                email=excluded.email,
                full_name=excluded.full_name,
                is_admin=excluded.is_admin
            "#,
            params![profile.id.as_str(), profile.email, profile.full_name, profile.is_admin],
        )?;
        Ok(())
    }

    pub async fn message_count(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

fn query_conversation(conn: &Connection, key: &ConversationKey) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, sender_id, receiver_id, content, created_at, is_read
        FROM messages
        WHERE (sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1)
        ORDER BY created_at ASC, id ASC
        "#,
    )?;
    let rows = stmt.query_map(
        params![key.viewer.as_str(), key.counterparty.as_str()],
        message_from_row,
    )?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn insert_message(conn: &Connection, message: &NewMessage) -> Result<Message> {
    let created_at: DateTime<Utc> = Utc::now();
    conn.execute(
        "INSERT INTO messages (sender_id, receiver_id, content, created_at, is_read) VALUES (?1, ?2, ?3, ?4, 0)",
        params![
            message.sender_id.as_str(),
            message.receiver_id.as_str(),
            message.content,
            created_at
        ],
    )?;
    Ok(Message {
        id: MessageId::Durable(conn.last_insert_rowid()),
        sender_id: message.sender_id.clone(),
        receiver_id: message.receiver_id.clone(),
        content: message.content.clone(),
        created_at,
        is_read: false,
    })
}

fn query_senders(conn: &Connection, recipient: &UserId) -> Result<Vec<SenderActivity>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT m.sender_id, m.created_at, p.full_name, p.email, COALESCE(p.is_admin, 0)
        FROM messages m
        LEFT JOIN profiles p ON p.id = m.sender_id
        WHERE m.receiver_id = ?1 AND m.sender_id <> ?1
        ORDER BY m.created_at DESC, m.id DESC
        "#,
    )?;
    let rows = stmt.query_map(params![recipient.as_str()], |row| {
        Ok(SenderActivity {
            sender_id: UserId(row.get(0)?),
            created_at: row.get(1)?,
            profiles: Some(SenderProfile {
                full_name: row.get(2)?,
                email: row.get(3)?,
                is_admin: row.get(4)?,
            }),
        })
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn fetch_conversation(&self, key: &ConversationKey) -> Result<Vec<Message>> {
        let conn = self.conn.lock().await;
        query_conversation(&conn, key)
    }

    async fn insert(&self, message: &NewMessage) -> Result<Message> {
        let stored = {
            let conn = self.conn.lock().await;
            insert_message(&conn, message)?
        };
        self.publish(ChangeKind::Insert);
        Ok(stored)
    }

    async fn mark_read(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let changed = {
            let conn = self.conn.lock().await;
            let placeholders = vec!["?"; ids.len()].join(",");
            conn.execute(
                &format!("UPDATE messages SET is_read = 1 WHERE is_read = 0 AND id IN ({placeholders})"),
                params_from_iter(ids.iter()),
            )?
        };
        if changed > 0 {
            self.publish(ChangeKind::Update);
        }
        Ok(())
    }

    async fn recent_senders_to(&self, recipient: &UserId) -> Result<Vec<SenderActivity>> {
        let conn = self.conn.lock().await;
        query_senders(&conn, recipient)
    }
}

#[async_trait]
impl ProfileDirectory for SqliteStore {
    async fn find_admin(&self) -> Result<Option<Profile>> {
        let conn = self.conn.lock().await;
        let profile = conn
            .query_row(
                "SELECT id, email, full_name, is_admin FROM profiles WHERE is_admin = 1 ORDER BY id LIMIT 1",
                [],
                profile_from_row,
            )
            .optional()?;
        Ok(profile)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Profile>> {
        let conn = self.conn.lock().await;
        let profile = conn
            .query_row(
                "SELECT id, email, full_name, is_admin FROM profiles WHERE email = ?1",
                params![email],
                profile_from_row,
            )
            .optional()?;
        Ok(profile)
    }
}

#[async_trait]
impl ChangeNotifier for SqliteStore {
    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut changes = self.changes.subscribe();
        let (subscription, events, mut released) = Subscription::channel();
        let channel = channel.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut released => break,
                    change = changes.recv() => match change {
                        Ok(change) => {
                            if events.send(change).is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("{} lagged by {} change(s)", channel, skipped);
                            let _ = events.send(ChangeEvent {
                                table: "messages".to_string(),
                                kind: ChangeKind::Other,
                            });
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("local feed {} released", channel);
        });
        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_message(from: &str, to: &str, content: &str) -> NewMessage {
        NewMessage {
            sender_id: UserId::new(from),
            receiver_id: UserId::new(to),
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn conversation_query_is_scoped_and_ordered() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert(&new_message("t1", "admin", "one")).await.unwrap();
        store.insert(&new_message("t2", "admin", "other tenant")).await.unwrap();
        store.insert(&new_message("admin", "t1", "two")).await.unwrap();

        let key = ConversationKey::new(UserId::new("t1"), UserId::new("admin"));
        let messages = store.fetch_conversation(&key).await.unwrap();
        let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["one", "two"]);
        assert!(messages.iter().all(|m| matches!(m.id, MessageId::Durable(_))));
        assert_eq!(store.message_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn mark_read_flips_only_listed_ids() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.insert(&new_message("admin", "t1", "a")).await.unwrap();
        store.insert(&new_message("admin", "t1", "b")).await.unwrap();
        store.mark_read(&[a.id.durable().unwrap()]).await.unwrap();

        let key = ConversationKey::new(UserId::new("t1"), UserId::new("admin"));
        let read: Vec<_> = store
            .fetch_conversation(&key)
            .await
            .unwrap()
            .iter()
            .map(|m| m.is_read)
            .collect();
        assert_eq!(read, [true, false]);
    }

    #[tokio::test]
    async fn profile_lookups() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.find_admin().await.unwrap(), None);

        let admin = Profile {
            id: UserId::new("admin"),
            email: Some("ops@example.com".into()),
            full_name: Some("Front Desk".into()),
            is_admin: true,
        };
        store.upsert_profile(&admin).await.unwrap();
        assert_eq!(store.find_admin().await.unwrap(), Some(admin.clone()));
        assert_eq!(
            store.find_by_email("ops@example.com").await.unwrap(),
            Some(admin)
        );
        assert_eq!(store.find_by_email("nobody@example.com").await.unwrap(), None);
    }

    #[tokio::test]
    async fn senders_exclude_recipient_and_carry_profiles() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .upsert_profile(&Profile {
                id: UserId::new("t1"),
                email: Some("amina@example.com".into()),
                full_name: Some("Amina".into()),
                is_admin: false,
            })
            .await
            .unwrap();
        store.insert(&new_message("t1", "admin", "hi")).await.unwrap();
        store.insert(&new_message("admin", "t1", "hello")).await.unwrap();
        store.insert(&new_message("t2", "admin", "hey")).await.unwrap();

        let rows = store.recent_senders_to(&UserId::new("admin")).await.unwrap();
        let senders: Vec<_> = rows.iter().map(|r| r.sender_id.as_str()).collect();
        assert_eq!(senders, ["t2", "t1"]);
        let amina = rows[1].profiles.as_ref().unwrap();
        assert_eq!(amina.full_name.as_deref(), Some("Amina"));
    }

    #[tokio::test]
    async fn writes_reach_subscribers() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut feed = store.subscribe("test").await.unwrap();

        let sent = store.insert(&new_message("t1", "admin", "hi")).await.unwrap();
        assert_eq!(feed.next().await.map(|c| c.kind), Some(ChangeKind::Insert));

        store.mark_read(&[sent.id.durable().unwrap()]).await.unwrap();
        assert_eq!(feed.next().await.map(|c| c.kind), Some(ChangeKind::Update));
    }

    #[test]
    fn opens_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("chat.sqlite");
        SqliteStore::open(&path).unwrap();
        assert!(path.exists());
    }
}
