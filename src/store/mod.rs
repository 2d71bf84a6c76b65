//! Storage collaborators.
//!
//! The relay engine only needs two things from storage: a friendship
//! predicate and a way to persist a message. Both are traits so the engine
//! can be driven by any backend; [`SqliteStore`] is the bundled one.

mod schema;
mod sqlite;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{MessageRecord, UserId};

pub use sqlite::SqliteStore;

/// Default page size for conversation history.
pub const DEFAULT_CONVERSATION_LIMIT: usize = 50;

/// Answers whether two users are mutually accepted friends.
///
/// Must be safe to call concurrently and must not mutate state.
#[async_trait]
pub trait RelationshipOracle: Send + Sync {
    async fn are_friends(&self, a: UserId, b: UserId) -> Result<bool>;
}

/// Durable message persistence.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message and return the canonical record, with its
    /// generated id and timestamp.
    async fn save(&self, sender: UserId, recipient: UserId, content: &str) -> Result<MessageRecord>;
}
