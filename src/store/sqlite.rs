//! SQLite-backed message store and friendship oracle.
//!
//! One connection behind a `parking_lot::Mutex`. Statements are short and
//! never held across an `.await`, so the lock is only ever taken briefly.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::schema;
use super::{MessageStore, RelationshipOracle};
use crate::error::{Error, Result};
use crate::protocol::{MessageRecord, UserId};

const FRIEND_PENDING: &str = "pending";
const FRIEND_ACCEPTED: &str = "accepted";

/// SQLite database holding messages and friend edges.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a database.
    ///
    /// If path is None, creates an in-memory database (useful for testing).
    pub fn open(path: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)
                .map_err(|e| Error::Database(format!("Failed to open database: {}", e)))?,
            None => Connection::open_in_memory().map_err(|e| {
                Error::Database(format!("Failed to create in-memory database: {}", e))
            })?,
        };

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        let version: Option<i32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .ok();

        match version {
            None => {
                conn.execute_batch(schema::CREATE_TABLES)
                    .map_err(|e| Error::Database(format!("Failed to create tables: {}", e)))?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    params![schema::SCHEMA_VERSION],
                )
                .map_err(|e| Error::Database(format!("Failed to set schema version: {}", e)))?;

                tracing::info!("Database schema created (version {})", schema::SCHEMA_VERSION);
            }
            Some(v) if v > schema::SCHEMA_VERSION => {
                return Err(Error::Database(format!(
                    "Database schema version {} is newer than supported {}",
                    v,
                    schema::SCHEMA_VERSION
                )));
            }
            Some(v) => {
                tracing::debug!("Database schema version: {}", v);
            }
        }

        Ok(())
    }

    fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
        let created_ms: i64 = row.get(4)?;
        Ok(MessageRecord {
            id: row.get(0)?,
            sender_id: UserId(row.get(1)?),
            recipient_id: UserId(row.get(2)?),
            content: row.get(3)?,
            created_at: DateTime::from_timestamp_millis(created_ms).unwrap_or_default(),
            is_read: row.get(5)?,
        })
    }

    // ========================================================================
    // MESSAGE OPERATIONS
    // ========================================================================

    fn insert_message(&self, sender: UserId, recipient: UserId, content: &str) -> Result<MessageRecord> {
        // Stored at millisecond precision; truncate up front so the record we
        // hand back matches what a later fetch returns.
        let created_ms = Utc::now().timestamp_millis();
        let created_at = DateTime::from_timestamp_millis(created_ms).unwrap_or_default();

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO messages (sender_id, recipient_id, content, created_at) VALUES (?, ?, ?, ?)",
            params![sender.0, recipient.0, content, created_ms],
        )
        .map_err(|e| Error::Persistence(e.to_string()))?;

        Ok(MessageRecord {
            id: conn.last_insert_rowid(),
            sender_id: sender,
            recipient_id: recipient,
            content: content.to_string(),
            created_at,
            is_read: false,
        })
    }

    /// Get a single message by id.
    #[cfg(test)]
    pub fn get_message(&self, id: i64) -> Result<Option<MessageRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, sender_id, recipient_id, content, created_at, is_read
             FROM messages WHERE id = ?",
            params![id],
            Self::row_to_message,
        )
        .optional()
        .map_err(|e| Error::Database(format!("Failed to get message: {}", e)))
    }

    /// The newest `limit` messages exchanged between two users, oldest first.
    pub fn fetch_conversation(&self, a: UserId, b: UserId, limit: usize) -> Result<Vec<MessageRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, sender_id, recipient_id, content, created_at, is_read
                 FROM messages
                 WHERE (sender_id = ?1 AND recipient_id = ?2)
                    OR (sender_id = ?2 AND recipient_id = ?1)
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?3",
            )
            .map_err(|e| Error::Database(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![a.0, b.0, limit as i64], Self::row_to_message)
            .map_err(|e| Error::Database(format!("Failed to query messages: {}", e)))?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.map_err(|e| Error::Database(format!("Failed to read message: {}", e)))?);
        }

        // Reverse to get chronological order
        messages.reverse();
        Ok(messages)
    }

    /// Mark a message read. Only its recipient may do so.
    pub fn mark_read(&self, message_id: i64, reader: UserId) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE messages SET is_read = 1 WHERE id = ? AND recipient_id = ?",
            params![message_id, reader.0],
        )?;
        Ok(updated > 0)
    }

    /// Delete a message. Only its sender may do so.
    pub fn delete_message(&self, message_id: i64, requester: UserId) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM messages WHERE id = ? AND sender_id = ?",
            params![message_id, requester.0],
        )?;
        Ok(deleted > 0)
    }

    /// Number of unread messages addressed to a user.
    pub fn unread_count(&self, user: UserId) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE recipient_id = ? AND is_read = 0",
            params![user.0],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // ========================================================================
    // FRIEND OPERATIONS
    // ========================================================================

    /// Record a pending friend request from `from` to `to`.
    /// Refused when the two are already accepted friends.
    pub fn add_friend_request(&self, from: UserId, to: UserId) -> Result<()> {
        if from == to {
            return Err(Error::Authorization("Cannot add yourself as friend".to_string()));
        }
        let conn = self.conn.lock();
        if Self::accepted_edge(&conn, from, to)? {
            return Err(Error::Authorization("Already friends".to_string()));
        }
        conn.execute(
            "INSERT OR IGNORE INTO friends (user_id, friend_id, status, created_at) VALUES (?, ?, ?, ?)",
            params![from.0, to.0, FRIEND_PENDING, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    /// Accept the pending request `requester` sent to `user`.
    pub fn accept_friend(&self, user: UserId, requester: UserId) -> Result<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE friends SET status = ? WHERE user_id = ? AND friend_id = ? AND status = ?",
            params![FRIEND_ACCEPTED, requester.0, user.0, FRIEND_PENDING],
        )?;
        Ok(updated > 0)
    }

    /// Remove any edge between two users, in either direction.
    pub fn remove_friend(&self, a: UserId, b: UserId) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM friends
             WHERE (user_id = ?1 AND friend_id = ?2) OR (user_id = ?2 AND friend_id = ?1)",
            params![a.0, b.0],
        )?;
        Ok(deleted > 0)
    }

    /// Accepted friends of a user, ascending.
    pub fn friends_of(&self, user: UserId) -> Result<Vec<UserId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT CASE WHEN user_id = ?1 THEN friend_id ELSE user_id END AS other
             FROM friends
             WHERE (user_id = ?1 OR friend_id = ?1) AND status = ?2
             ORDER BY other",
        )?;
        let rows = stmt.query_map(params![user.0, FRIEND_ACCEPTED], |row| {
            row.get::<_, i64>(0).map(UserId)
        })?;

        let mut friends = Vec::new();
        for row in rows {
            friends.push(row?);
        }
        Ok(friends)
    }

    /// Users with a pending request addressed to `user`.
    pub fn pending_requests(&self, user: UserId) -> Result<Vec<UserId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT user_id FROM friends WHERE friend_id = ? AND status = ? ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![user.0, FRIEND_PENDING], |row| {
            row.get::<_, i64>(0).map(UserId)
        })?;

        let mut requesters = Vec::new();
        for row in rows {
            requesters.push(row?);
        }
        Ok(requesters)
    }

    fn friendship_accepted(&self, a: UserId, b: UserId) -> Result<bool> {
        let conn = self.conn.lock();
        Self::accepted_edge(&conn, a, b)
    }

    fn accepted_edge(conn: &Connection, a: UserId, b: UserId) -> Result<bool> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM friends
                 WHERE ((user_id = ?1 AND friend_id = ?2) OR (user_id = ?2 AND friend_id = ?1))
                   AND status = ?3
                 LIMIT 1",
                params![a.0, b.0, FRIEND_ACCEPTED],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl RelationshipOracle for SqliteStore {
    async fn are_friends(&self, a: UserId, b: UserId) -> Result<bool> {
        self.friendship_accepted(a, b)
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn save(&self, sender: UserId, recipient: UserId, content: &str) -> Result<MessageRecord> {
        let record = self.insert_message(sender, recipient, content)?;
        tracing::debug!(
            message_id = record.id,
            sender = %sender,
            recipient = %recipient,
            "Message persisted"
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: UserId = UserId(1);
    const BOB: UserId = UserId(2);
    const CAROL: UserId = UserId(3);

    fn store() -> SqliteStore {
        SqliteStore::open(None).unwrap()
    }

    fn befriend(store: &SqliteStore, a: UserId, b: UserId) {
        store.add_friend_request(a, b).unwrap();
        assert!(store.accept_friend(b, a).unwrap());
    }

    #[tokio::test]
    async fn test_save_returns_canonical_record() {
        let store = store();
        let saved = store.save(ALICE, BOB, "hi bob").await.unwrap();
        assert!(saved.id > 0);
        assert!(!saved.is_read);

        let loaded = store.get_message(saved.id).unwrap().unwrap();
        assert_eq!(loaded, saved);
    }

    #[tokio::test]
    async fn test_conversation_is_chronological_and_limited() {
        let store = store();
        for i in 0..5 {
            store.save(ALICE, BOB, &format!("a{}", i)).await.unwrap();
            store.save(BOB, ALICE, &format!("b{}", i)).await.unwrap();
        }
        store.save(ALICE, CAROL, "unrelated").await.unwrap();

        let all = store.fetch_conversation(BOB, ALICE, 50).unwrap();
        assert_eq!(all.len(), 10);
        assert_eq!(all[0].content, "a0");
        assert_eq!(all[9].content, "b4");

        let last_three = store.fetch_conversation(ALICE, BOB, 3).unwrap();
        let contents: Vec<_> = last_three.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["b3", "a4", "b4"]);
    }

    #[tokio::test]
    async fn test_only_recipient_marks_read() {
        let store = store();
        let msg = store.save(ALICE, BOB, "read me").await.unwrap();
        assert_eq!(store.unread_count(BOB).unwrap(), 1);

        assert!(!store.mark_read(msg.id, ALICE).unwrap());
        assert_eq!(store.unread_count(BOB).unwrap(), 1);

        assert!(store.mark_read(msg.id, BOB).unwrap());
        assert_eq!(store.unread_count(BOB).unwrap(), 0);
        assert!(store.get_message(msg.id).unwrap().unwrap().is_read);
    }

    #[tokio::test]
    async fn test_only_sender_deletes() {
        let store = store();
        let msg = store.save(ALICE, BOB, "oops").await.unwrap();

        assert!(!store.delete_message(msg.id, BOB).unwrap());
        assert!(store.delete_message(msg.id, ALICE).unwrap());
        assert!(store.get_message(msg.id).unwrap().is_none());
        assert!(!store.delete_message(msg.id, ALICE).unwrap());
    }

    #[tokio::test]
    async fn test_friendship_requires_acceptance_and_is_symmetric() {
        let store = store();
        store.add_friend_request(ALICE, BOB).unwrap();
        assert!(!store.are_friends(ALICE, BOB).await.unwrap());
        assert_eq!(store.pending_requests(BOB).unwrap(), vec![ALICE]);

        // Only the addressee can accept.
        assert!(!store.accept_friend(ALICE, BOB).unwrap());
        assert!(store.accept_friend(BOB, ALICE).unwrap());

        assert!(store.are_friends(ALICE, BOB).await.unwrap());
        assert!(store.are_friends(BOB, ALICE).await.unwrap());
        assert!(!store.are_friends(ALICE, CAROL).await.unwrap());
        assert!(store.pending_requests(BOB).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_friends_of_and_remove() {
        let store = store();
        befriend(&store, ALICE, BOB);
        befriend(&store, CAROL, ALICE);

        assert_eq!(store.friends_of(ALICE).unwrap(), vec![BOB, CAROL]);
        assert_eq!(store.friends_of(BOB).unwrap(), vec![ALICE]);

        assert!(store.remove_friend(BOB, ALICE).unwrap());
        assert!(!store.are_friends(ALICE, BOB).await.unwrap());
        assert_eq!(store.friends_of(ALICE).unwrap(), vec![CAROL]);
    }

    #[test]
    fn test_cannot_befriend_self() {
        let store = store();
        assert!(matches!(
            store.add_friend_request(ALICE, ALICE),
            Err(Error::Authorization(_))
        ));
    }

    #[test]
    fn test_no_new_request_between_friends() {
        let store = store();
        befriend(&store, ALICE, BOB);

        let err = store.add_friend_request(BOB, ALICE).unwrap_err();
        assert!(matches!(err, Error::Authorization(ref reason) if reason == "Already friends"));
        assert!(store.add_friend_request(ALICE, BOB).is_err());
        assert!(store.pending_requests(ALICE).unwrap().is_empty());
        assert!(store.pending_requests(BOB).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reopen_file_database_keeps_messages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");
        let path = path.to_str().unwrap();

        let id = {
            let store = SqliteStore::open(Some(path)).unwrap();
            befriend(&store, ALICE, BOB);
            store.save(ALICE, BOB, "persisted").await.unwrap().id
        };

        let store = SqliteStore::open(Some(path)).unwrap();
        assert_eq!(store.get_message(id).unwrap().unwrap().content, "persisted");
        assert!(store.are_friends(ALICE, BOB).await.unwrap());
    }
}
