//! Core data entities (spec.md §3).

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type UserId = u64;
pub type FunctionId = u64;
pub type MetadataId = u64;
pub type EngineId = u32;

/// Unix timestamp in milliseconds. Kept as a plain integer (rather than a
/// `chrono`/`time` type) since the only operations the core performs on it
/// are "now" and ordering by `committed`.
pub type Timestamp = u64;

pub fn now_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as Timestamp
}

/// A stable numeric user with a displayed `handle#number` tag and a UUID
/// API key — the sole authentication token on the core's API surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub handle: String,
    pub number: u32,
    pub api_key: Uuid,
}

impl User {
    /// The displayed tag, e.g. `"u1_h4x0r#1337"`.
    pub fn tag(&self) -> String {
        format!("{}#{}", self.handle, self.number)
    }
}

/// A submitted sample, identified by the required `(md5, crc32)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub md5: String,
    pub crc32: u32,
    pub sha1: Option<String>,
    pub sha256: Option<String>,
    pub last_seen: Timestamp,
    pub seen_by: HashSet<UserId>,
    pub functions: HashSet<FunctionId>,
}

impl Sample {
    pub fn new(md5: String, crc32: u32) -> Self {
        Self {
            md5,
            crc32,
            sha1: None,
            sha256: None,
            last_seen: now_ms(),
            seen_by: HashSet::new(),
            functions: HashSet::new(),
        }
    }
}

/// Primary key for a Sample row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SampleKey {
    pub md5: String,
    pub crc32: u32,
}

/// A canonical, immutable function entity keyed by `(sha256(opcodes),
/// architecture)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub id: FunctionId,
    pub sha256: String,
    pub architecture: String,
    pub opcodes: Vec<u8>,
    pub apis: HashSet<String>,
    pub metadata_ids: HashSet<MetadataId>,
}

/// Primary key for a Function row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionKey {
    pub sha256: String,
    pub architecture: String,
}

/// One immutable revision of an annotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataDetails {
    pub name: String,
    pub prototype: String,
    pub comment: String,
    pub committed: Timestamp,
}

impl MetadataDetails {
    /// True iff `(name, prototype, comment)` differs from this revision,
    /// byte-for-byte (spec.md §4.3 "Change detection").
    pub fn differs_from(&self, name: &str, prototype: &str, comment: &str) -> bool {
        self.name != name || self.prototype != prototype || self.comment != comment
    }
}

/// One-per-`(function, user)` annotation: an ordered, non-empty sequence of
/// revisions. The "current" revision is the latest by `committed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub id: MetadataId,
    pub function_id: FunctionId,
    pub user_id: UserId,
    /// Ordered by `committed` ascending; construction and appends must
    /// preserve this invariant (never re-sorted in place).
    pub revisions: Vec<MetadataDetails>,
}

impl Metadata {
    /// The latest revision. Panics if `revisions` is empty, which the
    /// invariant in spec.md §3 (#4) forbids ever happening.
    pub fn current(&self) -> &MetadataDetails {
        self.revisions
            .last()
            .expect("Metadata must carry at least one revision")
    }

    pub fn has_changed(&self, name: &str, prototype: &str, comment: &str) -> bool {
        self.current().differs_from(name, prototype, comment)
    }
}

/// Primary key for a Metadata row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetadataKey {
    pub function_id: FunctionId,
    pub user_id: UserId,
}

/// An analyst's record that they applied an annotation while analysing a
/// sample. Uniqueness is enforced on the full triple; insertion is
/// idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppliedMetadataKey {
    pub metadata_id: MetadataId,
    pub sample: SampleKeyOwned,
    pub user_id: UserId,
}

/// `SampleKey` with owned fields, suitable for embedding in a hashable key
/// and for (de)serialization — `SampleKey` itself stays borrow-friendly for
/// store lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleKeyOwned {
    pub md5: String,
    pub crc32: u32,
}

/// Operator-managed engine catalog row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineRecord {
    pub id: EngineId,
    pub name: String,
    pub description: String,
    pub module_path: String,
    pub class_name: String,
    pub developer: Option<UserId>,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_formats_handle_and_number() {
        let user = User {
            id: 1,
            handle: "u1_h4x0r".into(),
            number: 1337,
            api_key: Uuid::nil(),
        };
        assert_eq!(user.tag(), "u1_h4x0r#1337");
    }

    #[test]
    fn has_changed_compares_latest_revision_only() {
        let metadata = Metadata {
            id: 1,
            function_id: 1,
            user_id: 1,
            revisions: vec![
                MetadataDetails {
                    name: "old".into(),
                    prototype: "void old()".into(),
                    comment: "".into(),
                    committed: 1,
                },
                MetadataDetails {
                    name: "new".into(),
                    prototype: "void new()".into(),
                    comment: "".into(),
                    committed: 2,
                },
            ],
        };
        assert!(!metadata.has_changed("new", "void new()", ""));
        assert!(metadata.has_changed("old", "void old()", ""));
    }
}
