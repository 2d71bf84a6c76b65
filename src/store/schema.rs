//! SQL schema for the relay database.
//!
//! ```text
//! ┌──────────────────────┐      ┌──────────────────────┐
//! │       friends        │      │       messages       │
//! ├──────────────────────┤      ├──────────────────────┤
//! │ user_id    (request) │      │ id                   │
//! │ friend_id  (target)  │      │ sender_id            │
//! │ status               │      │ recipient_id         │
//! │ created_at           │      │ content              │
//! └──────────────────────┘      │ created_at (ms)      │
//!                               │ is_read              │
//!                               └──────────────────────┘
//! ```

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL to create all tables
pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

-- One row per friend request. Accepted rows are friendships in both directions.
CREATE TABLE IF NOT EXISTS friends (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    friend_id INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'accepted')),
    created_at INTEGER NOT NULL,
    UNIQUE (user_id, friend_id)
);
CREATE INDEX IF NOT EXISTS idx_friends_friend ON friends(friend_id);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sender_id INTEGER NOT NULL,
    recipient_id INTEGER NOT NULL,
    content TEXT NOT NULL,
    -- Unix milliseconds, UTC
    created_at INTEGER NOT NULL,
    is_read INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_messages_pair ON messages(sender_id, recipient_id, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_unread ON messages(recipient_id, is_read);
"#;
