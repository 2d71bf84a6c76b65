//! Server state management.
//!
//! Holds the configuration, the presence registry, the SQLite store and the
//! relay engine wired on top of them. Cloning is cheap; every field is shared.

use std::sync::Arc;

use crate::auth::{IdentityVerifier, SignedTokenVerifier, TrustedClaimVerifier};
use crate::error::{Error, Result};
use crate::presence::PresenceRegistry;
use crate::relay::{RelayEngine, RelayPolicy, DEFAULT_MAX_MESSAGE_LEN};
use crate::store::SqliteStore;

/// Default listen port.
const DEFAULT_PORT: u16 = 8080;

/// How connections prove their identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum AuthMode {
    /// Accept the claimed user id. For deployments behind an authenticating gateway.
    Trusted,
    /// Require an Ed25519-signed token.
    Signed,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// SQLite file. `None` keeps everything in memory.
    pub database_path: Option<String>,
    pub auth_mode: AuthMode,
    /// Hex-encoded Ed25519 public key of the token issuer. Required in signed mode.
    pub auth_public_key: Option<String>,
    pub typing_requires_friendship: bool,
    pub max_message_len: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_path: None,
            auth_mode: AuthMode::Trusted,
            auth_public_key: None,
            typing_requires_friendship: false,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        }
    }
}

impl RelayConfig {
    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_message_len == 0 {
            return Err(Error::Config("max message length must be positive".to_string()));
        }
        if self.auth_mode == AuthMode::Signed && self.auth_public_key.is_none() {
            return Err(Error::Config(
                "signed auth mode requires AUTH_PUBLIC_KEY".to_string(),
            ));
        }
        Ok(())
    }

    pub fn policy(&self) -> RelayPolicy {
        RelayPolicy {
            typing_requires_friendship: self.typing_requires_friendship,
            max_message_len: self.max_message_len,
        }
    }

    fn verifier(&self) -> Result<Arc<dyn IdentityVerifier>> {
        match (self.auth_mode, &self.auth_public_key) {
            (AuthMode::Trusted, _) => Ok(Arc::new(TrustedClaimVerifier)),
            (AuthMode::Signed, Some(key)) => Ok(Arc::new(SignedTokenVerifier::from_hex(key)?)),
            (AuthMode::Signed, None) => Err(Error::Config(
                "signed auth mode requires AUTH_PUBLIC_KEY".to_string(),
            )),
        }
    }
}

/// Shared server state.
#[derive(Clone)]
pub struct RelayState {
    /// Per-event orchestration over the registry and the store.
    pub engine: Arc<RelayEngine>,

    /// Who is online right now. Shared with the engine.
    pub registry: PresenceRegistry,

    /// Durable messages and friend edges.
    pub store: SqliteStore,

    /// Also used to authenticate HTTP API requests.
    pub verifier: Arc<dyn IdentityVerifier>,

    /// Server configuration.
    pub config: RelayConfig,
}

impl RelayState {
    /// Validate the configuration, open the database and wire the engine.
    pub fn new(config: RelayConfig) -> Result<Self> {
        config.validate()?;
        let store = SqliteStore::open(config.database_path.as_deref())?;
        let verifier = config.verifier()?;
        Ok(Self::with_parts(config, store, verifier))
    }

    /// Build state around an already opened store and a chosen verifier.
    pub fn with_parts(
        config: RelayConfig,
        store: SqliteStore,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Self {
        let registry = PresenceRegistry::new();
        let engine = RelayEngine::new(
            registry.clone(),
            verifier.clone(),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            config.policy(),
        );

        tracing::info!(
            auth_mode = ?config.auth_mode,
            typing_requires_friendship = config.typing_requires_friendship,
            max_message_len = config.max_message_len,
            "Relay state initialized"
        );

        Self {
            engine: Arc::new(engine),
            registry,
            store,
            verifier,
            config,
        }
    }

    /// Number of distinct users online.
    pub fn online_count(&self) -> usize {
        self.registry.online_count()
    }

    /// Number of authenticated connections.
    pub fn connection_count(&self) -> usize {
        self.registry.connection_count()
    }
}
