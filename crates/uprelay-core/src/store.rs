//! In-memory registration store.
//!
//! Maps consumer tokens to registration records and keeps a reverse index
//! from server id to token. Both maps sit behind one mutex and are updated
//! together, so a server id is indexed if and only if a live record uses it.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::ids::{ServerId, ServiceName, Token};

/// The set of server ids the delivery listener should be polling.
pub type SubscriptionSet = BTreeSet<ServerId>;

/// A live registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRecord {
    pub token: Token,
    pub server_id: ServerId,
    pub service: ServiceName,
    pub description: String,
}

#[derive(Debug, Default)]
struct StoreInner {
    by_token: HashMap<Token, RegistrationRecord>,
    by_server_id: HashMap<ServerId, Token>,
}

/// Token → registration map with a server-id reverse index.
#[derive(Debug, Default)]
pub struct RegistrationStore {
    inner: Mutex<StoreInner>,
}

impl RegistrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // Every mutation leaves both maps consistent before it can panic.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a new record.
    ///
    /// Returns `false` without touching the store if the token is already
    /// registered or the server id is already owned by another record.
    pub fn insert(
        &self,
        token: Token,
        server_id: ServerId,
        service: ServiceName,
        description: impl Into<String>,
    ) -> bool {
        let mut inner = self.lock();
        if inner.by_token.contains_key(&token) || inner.by_server_id.contains_key(&server_id) {
            return false;
        }
        inner.by_server_id.insert(server_id.clone(), token.clone());
        inner.by_token.insert(
            token.clone(),
            RegistrationRecord {
                token,
                server_id,
                service,
                description: description.into(),
            },
        );
        true
    }

    /// Remove the record for `token`, returning it if it existed.
    pub fn remove(&self, token: &Token) -> Option<RegistrationRecord> {
        let mut inner = self.lock();
        let record = inner.by_token.remove(token)?;
        inner.by_server_id.remove(&record.server_id);
        Some(record)
    }

    /// Remove the record for `token` only if it still points at `server_id`.
    ///
    /// Lets a caller that looked a record up earlier drop it without racing a
    /// concurrent re-registration of the same token.
    pub fn remove_matching(
        &self,
        token: &Token,
        server_id: &ServerId,
    ) -> Option<RegistrationRecord> {
        let mut inner = self.lock();
        if inner.by_token.get(token)?.server_id != *server_id {
            return None;
        }
        let record = inner.by_token.remove(token)?;
        inner.by_server_id.remove(&record.server_id);
        Some(record)
    }

    pub fn lookup_by_token(&self, token: &Token) -> Option<RegistrationRecord> {
        self.lock().by_token.get(token).cloned()
    }

    pub fn lookup_by_server_id(&self, server_id: &ServerId) -> Option<Token> {
        self.lock().by_server_id.get(server_id).cloned()
    }

    /// Resolve a server id straight to its full record under a single lock.
    pub fn resolve(&self, server_id: &ServerId) -> Option<RegistrationRecord> {
        let inner = self.lock();
        let token = inner.by_server_id.get(server_id)?;
        inner.by_token.get(token).cloned()
    }

    pub fn server_ids(&self) -> SubscriptionSet {
        self.lock().by_server_id.keys().cloned().collect()
    }

    /// Run `f` with the current server id set while the store lock is held.
    ///
    /// Used to publish the subscription set so that publications are ordered
    /// the same way as the mutations that produced them.
    pub fn with_server_ids<R>(&self, f: impl FnOnce(SubscriptionSet) -> R) -> R {
        let inner = self.lock();
        f(inner.by_server_id.keys().cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.lock().by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
