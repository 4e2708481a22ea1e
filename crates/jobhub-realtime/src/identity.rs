use std::sync::{Arc, RwLock};

use tracing::warn;

use jobhub_store::Database;
use jobhub_types::UserId;

/// Where subscriptions get the signed-in user from. Consulted at every
/// connection attempt and before every delivered event.
pub trait IdentitySource: Send + Sync + 'static {
    fn resolve(&self) -> Option<UserId>;

    /// Bearer token to present when joining channels.
    fn access_token(&self) -> Option<String> {
        None
    }
}

/// Identity from the in-memory session, falling back to the local store.
pub struct StoredIdentity {
    db: Arc<Database>,
    session: RwLock<Option<UserId>>,
}

impl StoredIdentity {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            session: RwLock::new(None),
        }
    }

    /// Sets or clears the in-memory session identity.
    pub fn set_session(&self, id: Option<UserId>) {
        match self.session.write() {
            Ok(mut guard) => *guard = id,
            Err(poisoned) => *poisoned.into_inner() = id,
        }
    }

    fn session(&self) -> Option<UserId> {
        match self.session.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl IdentitySource for StoredIdentity {
    fn resolve(&self) -> Option<UserId> {
        self.db.resolve_identity(self.session())
    }

    fn access_token(&self) -> Option<String> {
        self.db.access_token().unwrap_or_else(|e| {
            warn!("Failed to read access token: {}", e);
            None
        })
    }
}
