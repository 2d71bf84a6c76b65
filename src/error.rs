//! Error types for the relay.
//!
//! Every failure is handled at the event that produced it. Errors that reach
//! a client are turned into an `error` event via [`Error::client_message`],
//! which never exposes storage internals.
//!
//! ```text
//! Error
//! ├── Authentication     bad or missing credential (connection stays unauthenticated)
//! ├── IdentityMismatch   connection already bound to another identity
//! ├── Authorization      malformed send payload
//! ├── NotFriends         sender and recipient are not mutually accepted friends
//! ├── Persistence        message store failed to save
//! ├── Database           low-level SQLite failure
//! └── Config             invalid startup configuration
//! ```

use thiserror::Error;

use crate::protocol::UserId;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the relay.
#[derive(Error, Debug)]
pub enum Error {
    /// The presented credential was rejected.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// A connection tried to re-authenticate as someone else.
    #[error("Connection is already authenticated as user {bound}, refusing {requested}")]
    IdentityMismatch { bound: UserId, requested: UserId },

    /// The send payload failed validation.
    #[error("Invalid message: {0}")]
    Authorization(String),

    /// Sender and recipient are not mutually accepted friends.
    #[error("User {sender} is not friends with user {recipient}")]
    NotFriends { sender: UserId, recipient: UserId },

    /// The message store could not save a message.
    #[error("Failed to persist message: {0}")]
    Persistence(String),

    /// Underlying database failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Invalid configuration at startup.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Human-readable text for the `error` event sent to the acting client.
    pub fn client_message(&self) -> String {
        match self {
            Error::Authentication(_) => "Authentication failed".to_string(),
            Error::IdentityMismatch { .. } => {
                "Connection is already authenticated as a different user".to_string()
            }
            Error::Authorization(reason) => reason.clone(),
            Error::NotFriends { .. } => "You can only message friends".to_string(),
            Error::Persistence(_) | Error::Database(_) => "Failed to send message".to_string(),
            Error::Config(_) => "Server misconfigured".to_string(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_hides_database_details() {
        let err = Error::Persistence("disk I/O error at page 42".to_string());
        assert_eq!(err.client_message(), "Failed to send message");

        let err = Error::Database("no such table: messages".to_string());
        assert!(!err.client_message().contains("table"));
    }

    #[test]
    fn test_not_friends_message() {
        let err = Error::NotFriends {
            sender: UserId(1),
            recipient: UserId(2),
        };
        assert_eq!(err.client_message(), "You can only message friends");
        assert_eq!(err.to_string(), "User 1 is not friends with user 2");
    }
}
