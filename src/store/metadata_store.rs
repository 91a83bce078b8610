//! Metadata (annotation) storage (spec.md §4.3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::id_codec;
use crate::models::{
    now_ms, AppliedMetadataKey, FunctionId, Metadata, MetadataDetails, MetadataId, MetadataKey,
    SampleKeyOwned, Timestamp, UserId,
};
use crate::store::user_store::UserStore;

/// A dumped annotation, shaped for both `metadata_get` (spec.md §4.3) and
/// as the base of a `metadata_scan` result (spec.md §4.9 adds `similarity`
/// and `engines` on top of this).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationDump {
    pub id: String,
    pub creator: String,
    pub name: String,
    pub prototype: String,
    pub comment: String,
    pub rank: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub name: String,
    pub prototype: String,
    pub comment: String,
    pub committed: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryDump {
    pub creator: String,
    pub history: Vec<HistoryEntry>,
}

/// Resolves an engine id to `(name, description)` for synthesizing
/// engine-generated annotation dumps. Implemented by `EngineManager`.
pub trait EngineLookup {
    fn describe(&self, engine_id: u32) -> Option<(String, String)>;
}

pub struct MetadataStore {
    by_key: RwLock<HashMap<MetadataKey, MetadataId>>,
    by_id: RwLock<HashMap<MetadataId, Metadata>>,
    applied: RwLock<std::collections::HashSet<AppliedMetadataKey>>,
    next_id: AtomicU64,
}

impl Default for MetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataStore {
    pub fn new() -> Self {
        Self {
            by_key: RwLock::new(HashMap::new()),
            by_id: RwLock::new(HashMap::new()),
            applied: RwLock::new(std::collections::HashSet::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create-or-append a MetadataDetails revision for `(function, user)`.
    /// Idempotent when the latest revision already equals the supplied
    /// triple byte-for-byte.
    pub fn add_metadata_to_function(
        &self,
        user_id: UserId,
        function_id: FunctionId,
        name: &str,
        prototype: &str,
        comment: &str,
    ) -> MetadataId {
        let key = MetadataKey {
            function_id,
            user_id,
        };

        let mut by_key = self.by_key.write().unwrap();
        let mut by_id = self.by_id.write().unwrap();

        let id = *by_key.entry(key).or_insert_with(|| {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            by_id.insert(
                id,
                Metadata {
                    id,
                    function_id,
                    user_id,
                    revisions: Vec::new(),
                },
            );
            id
        });

        let metadata = by_id.get_mut(&id).expect("just inserted or pre-existing");
        if metadata.revisions.is_empty() || metadata.has_changed(name, prototype, comment) {
            metadata.revisions.push(MetadataDetails {
                name: name.to_string(),
                prototype: prototype.to_string(),
                comment: comment.to_string(),
                committed: now_ms(),
            });
        }
        id
    }

    pub fn get(&self, id: MetadataId) -> Option<Metadata> {
        self.by_id.read().unwrap().get(&id).cloned()
    }

    pub fn rank(&self, id: MetadataId) -> usize {
        self.applied
            .read()
            .unwrap()
            .iter()
            .filter(|k| k.metadata_id == id)
            .count()
    }

    /// Build the `{id, creator, name, prototype, comment, rank}` dump for a
    /// single user-owned Metadata row. Exposed (beyond `get_metadata_list`)
    /// so `EngineManager::scan` can resolve a function's annotations
    /// directly from its `metadata_ids` without re-encoding ids first.
    pub fn dump_user(&self, id: MetadataId, users: &UserStore) -> Option<AnnotationDump> {
        let metadata = self.by_id.read().unwrap().get(&id).cloned()?;
        let current = metadata.current();
        Some(AnnotationDump {
            id: id_codec::encode_user(id),
            creator: users.tag(metadata.user_id).unwrap_or_default(),
            name: current.name.clone(),
            prototype: current.prototype.clone(),
            comment: current.comment.clone(),
            rank: self.rank(id),
        })
    }

    /// Splits `ids` into user and engine ids via the ID codec, resolves
    /// each, and returns the dumps in no particular order.
    pub fn get_metadata_list(
        &self,
        ids: &[String],
        users: &UserStore,
        engines: &dyn EngineLookup,
    ) -> Vec<AnnotationDump> {
        let mut out = Vec::new();
        for raw in ids {
            let Ok((flag, engine_id, metadata_id)) = id_codec::decode(raw) else {
                continue;
            };
            if flag == 0 {
                if let Some(dump) = self.dump_user(metadata_id, users) {
                    out.push(dump);
                }
            } else if let Some((name, description)) = engines.describe(engine_id) {
                out.push(AnnotationDump {
                    id: raw.clone(),
                    creator: name.clone(),
                    name: "N/A".to_string(),
                    prototype: "N/A".to_string(),
                    comment: description,
                    rank: 0,
                });
            }
        }
        out
    }

    pub fn metadata_history(
        &self,
        ids: &[String],
        users: &UserStore,
        engines: &dyn EngineLookup,
    ) -> HashMap<String, HistoryDump> {
        let mut out = HashMap::new();
        for raw in ids {
            let Ok((flag, engine_id, metadata_id)) = id_codec::decode(raw) else {
                continue;
            };
            if flag == 0 {
                let by_id = self.by_id.read().unwrap();
                if let Some(metadata) = by_id.get(&metadata_id) {
                    let history = metadata
                        .revisions
                        .iter()
                        .map(|r| HistoryEntry {
                            name: r.name.clone(),
                            prototype: r.prototype.clone(),
                            comment: r.comment.clone(),
                            committed: r.committed,
                        })
                        .collect();
                    out.insert(
                        id_codec::encode_user(metadata_id),
                        HistoryDump {
                            creator: users.tag(metadata.user_id).unwrap_or_default(),
                            history,
                        },
                    );
                }
            } else if let Some((name, description)) = engines.describe(engine_id) {
                out.insert(
                    raw.clone(),
                    HistoryDump {
                        creator: name.clone(),
                        history: vec![HistoryEntry {
                            name: "N/A".to_string(),
                            prototype: "N/A".to_string(),
                            comment: format!("Generated by Engine: {name}\n{description}"),
                            committed: 0,
                        }],
                    },
                );
            }
        }
        out
    }

    /// Delete the Metadata row. Only succeeds when `user_id` owns it.
    pub fn delete_metadata(&self, user_id: UserId, id: &str) -> bool {
        let Ok((flag, _, metadata_id)) = id_codec::decode(id) else {
            return false;
        };
        if flag != 0 {
            return false;
        }
        let mut by_id = self.by_id.write().unwrap();
        match by_id.get(&metadata_id) {
            Some(m) if m.user_id == user_id => {
                let key = MetadataKey {
                    function_id: m.function_id,
                    user_id,
                };
                by_id.remove(&metadata_id);
                self.by_key.write().unwrap().remove(&key);
                true
            }
            _ => false,
        }
    }

    /// 1-based pagination over `user_id`'s own Metadata rows.
    pub fn created(
        &self,
        user_id: UserId,
        page: usize,
        page_size: usize,
        users: &UserStore,
    ) -> (Vec<AnnotationDump>, usize) {
        if page < 1 {
            return (Vec::new(), 0);
        }
        let by_id = self.by_id.read().unwrap();
        let mut ids: Vec<MetadataId> = by_id
            .values()
            .filter(|m| m.user_id == user_id)
            .map(|m| m.id)
            .collect();
        ids.sort_unstable();
        drop(by_id);

        let total_pages = ids.len().div_ceil(page_size).max(1);
        if page > total_pages {
            return (Vec::new(), total_pages);
        }

        let start = (page - 1) * page_size;
        let end = (start + page_size).min(ids.len());
        let page_ids = ids.get(start..end).unwrap_or(&[]);

        let results = page_ids
            .iter()
            .filter_map(|&id| self.dump_user(id, users))
            .collect();
        (results, total_pages)
    }

    /// Record that `user` applied `id` while analysing `sample`. Engine
    /// ids are a documented no-op that still reports success — the
    /// original implementation stubs engine-applied tracking and this
    /// port preserves that rather than guessing unspecified semantics
    /// (spec.md §9 Open Questions).
    pub fn applied(&self, sample: &SampleKeyOwned, user_id: UserId, id: &str) -> bool {
        let Ok((flag, _, metadata_id)) = id_codec::decode(id) else {
            return false;
        };
        if flag != 0 {
            return true;
        }
        if !self.by_id.read().unwrap().contains_key(&metadata_id) {
            return false;
        }
        self.applied.write().unwrap().insert(AppliedMetadataKey {
            metadata_id,
            sample: sample.clone(),
            user_id,
        });
        true
    }

    /// Idempotent removal. Engine ids are a documented no-op returning
    /// `false`, matching the original's fallthrough for that branch.
    pub fn unapplied(&self, sample: &SampleKeyOwned, user_id: UserId, id: &str) -> bool {
        let Ok((flag, _, metadata_id)) = id_codec::decode(id) else {
            return false;
        };
        if flag != 0 {
            return false;
        }
        if !self.by_id.read().unwrap().contains_key(&metadata_id) {
            return false;
        }
        self.applied.write().unwrap().remove(&AppliedMetadataKey {
            metadata_id,
            sample: sample.clone(),
            user_id,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoEngines;
    impl EngineLookup for NoEngines {
        fn describe(&self, _engine_id: u32) -> Option<(String, String)> {
            None
        }
    }

    fn store_with_user() -> (MetadataStore, UserStore, UserId) {
        let store = MetadataStore::new();
        let users = UserStore::new();
        let user = users.register("u1_h4x0r", 1337);
        (store, users, user.id)
    }

    #[test]
    fn add_metadata_is_idempotent_when_unchanged() {
        let (store, _users, user) = store_with_user();
        let id1 = store.add_metadata_to_function(user, 1, "f", "void f()", "c");
        let id2 = store.add_metadata_to_function(user, 1, "f", "void f()", "c");
        assert_eq!(id1, id2);
        assert_eq!(store.get(id1).unwrap().revisions.len(), 1);
    }

    #[test]
    fn add_metadata_appends_revision_on_change() {
        let (store, _users, user) = store_with_user();
        let id = store.add_metadata_to_function(user, 1, "f", "void f()", "c");
        store.add_metadata_to_function(user, 1, "f_v2", "void f_v2()", "c2");
        assert_eq!(store.get(id).unwrap().revisions.len(), 2);
    }

    #[test]
    fn applied_is_idempotent() {
        let (store, _users, user) = store_with_user();
        let id = store.add_metadata_to_function(user, 1, "f", "void f()", "c");
        let encoded = id_codec::encode_user(id);
        let sample = SampleKeyOwned {
            md5: "a".repeat(32),
            crc32: 0,
        };
        assert!(store.applied(&sample, user, &encoded));
        assert!(store.applied(&sample, user, &encoded));
        assert_eq!(store.rank(id), 1);
    }

    #[test]
    fn unapplied_is_idempotent() {
        let (store, _users, user) = store_with_user();
        let id = store.add_metadata_to_function(user, 1, "f", "void f()", "c");
        let encoded = id_codec::encode_user(id);
        let sample = SampleKeyOwned {
            md5: "a".repeat(32),
            crc32: 0,
        };
        store.applied(&sample, user, &encoded);
        assert!(store.unapplied(&sample, user, &encoded));
        assert!(store.unapplied(&sample, user, &encoded));
        assert_eq!(store.rank(id), 0);
    }

    #[test]
    fn delete_requires_ownership() {
        let (store, users, user) = store_with_user();
        let other = users.register("u2", 1).id;
        let id = store.add_metadata_to_function(user, 1, "f", "void f()", "c");
        let encoded = id_codec::encode_user(id);
        assert!(!store.delete_metadata(other, &encoded));
        assert!(store.delete_metadata(user, &encoded));
        assert!(store.get(id).is_none());
    }

    #[test]
    fn created_paginates_1_based() {
        let (store, users, user) = store_with_user();
        for i in 0..25u64 {
            store.add_metadata_to_function(user, i, &format!("f{i}"), "void f()", "c");
        }
        let (page1, pages) = store.created(user, 1, 20, &users);
        assert_eq!(pages, 2);
        assert_eq!(page1.len(), 20);
        let (page2, _) = store.created(user, 2, 20, &users);
        assert_eq!(page2.len(), 5);
    }

    #[test]
    fn applied_on_engine_id_is_a_documented_stub() {
        let (store, _users, user) = store_with_user();
        let engine_id = id_codec::encode_engine(1, 1);
        let sample = SampleKeyOwned {
            md5: "a".repeat(32),
            crc32: 0,
        };
        assert!(store.applied(&sample, user, &engine_id));
        assert!(!store.unapplied(&sample, user, &engine_id));
    }
}
