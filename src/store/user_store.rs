//! User storage.
//!
//! User onboarding (OAuth, handle/number allocation) is explicitly out of
//! scope (spec.md §1 Non-goals) — this store only supports what the rest
//! of the core needs: resolving an API key to its owning `User` and
//! producing a user's display tag for annotation dumps. `register` exists
//! for tests and for seeding a deployment from operator-managed config,
//! not as a public signup path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use uuid::Uuid;

use crate::models::{User, UserId};

pub struct UserStore {
    by_id: RwLock<HashMap<UserId, User>>,
    by_api_key: RwLock<HashMap<Uuid, UserId>>,
    next_id: AtomicU64,
}

impl Default for UserStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UserStore {
    pub fn new() -> Self {
        Self {
            by_id: RwLock::new(HashMap::new()),
            by_api_key: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a new user with a fresh API key, returning the full record.
    pub fn register(&self, handle: &str, number: u32) -> User {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let user = User {
            id,
            handle: handle.to_string(),
            number,
            api_key: Uuid::new_v4(),
        };
        self.by_id.write().unwrap().insert(id, user.clone());
        self.by_api_key.write().unwrap().insert(user.api_key, id);
        user
    }

    pub fn get(&self, id: UserId) -> Option<User> {
        self.by_id.read().unwrap().get(&id).cloned()
    }

    /// Resolve an API key embedded in a request path to its owning user
    /// (spec.md §6's authentication scheme). `None` for an unknown key —
    /// the facade maps that to HTTP 401.
    pub fn resolve_api_key(&self, api_key: Uuid) -> Option<User> {
        let id = *self.by_api_key.read().unwrap().get(&api_key)?;
        self.get(id)
    }

    /// `"{handle}#{number}"`, or empty string for an unknown id — used when
    /// synthesizing annotation dumps where a stale/foreign user id should
    /// never cause a panic or visible error.
    pub fn tag(&self, id: UserId) -> Option<String> {
        self.get(id).map(|u| u.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_assigns_unique_api_keys() {
        let store = UserStore::new();
        let a = store.register("alice", 1);
        let b = store.register("bob", 2);
        assert_ne!(a.api_key, b.api_key);
    }

    #[test]
    fn resolve_api_key_finds_registered_user() {
        let store = UserStore::new();
        let user = store.register("alice", 1);
        let found = store.resolve_api_key(user.api_key).unwrap();
        assert_eq!(found.id, user.id);
    }

    #[test]
    fn resolve_api_key_rejects_unknown_key() {
        let store = UserStore::new();
        store.register("alice", 1);
        assert!(store.resolve_api_key(Uuid::new_v4()).is_none());
    }

    #[test]
    fn tag_formats_handle_and_number() {
        let store = UserStore::new();
        let user = store.register("u1_h4x0r", 1337);
        assert_eq!(store.tag(user.id).unwrap(), "u1_h4x0r#1337");
    }
}
