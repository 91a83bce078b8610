//! Sample and Function storage (spec.md §4.2).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use sha2::{Digest, Sha256};

use crate::models::{now_ms, Function, FunctionId, FunctionKey, Sample, SampleKey, UserId};

fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Three mutually exclusive lookup modes for `find_function`
/// (spec.md §4.2). Ambiguous combinations — e.g. supplying both `id` and
/// opcodes — aren't representable by this type, so callers can't express
/// an ambiguous call.
pub enum FunctionLookup<'a> {
    ById(FunctionId),
    ByOpcodesAndApis {
        opcodes: &'a [u8],
        apis: &'a std::collections::HashSet<String>,
    },
    ByArchAndSha256 {
        architecture: &'a str,
        sha256: &'a str,
    },
}

pub struct FunctionStore {
    samples: RwLock<HashMap<SampleKey, Sample>>,
    functions_by_key: RwLock<HashMap<FunctionKey, FunctionId>>,
    functions_by_id: RwLock<HashMap<FunctionId, Function>>,
    next_function_id: AtomicU64,
}

impl Default for FunctionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionStore {
    pub fn new() -> Self {
        Self {
            samples: RwLock::new(HashMap::new()),
            functions_by_key: RwLock::new(HashMap::new()),
            functions_by_id: RwLock::new(HashMap::new()),
            next_function_id: AtomicU64::new(1),
        }
    }

    /// Get (or, if `create`, create) the Sample keyed by `(md5, crc32)`.
    /// Returns `None` if `md5` isn't 32 lowercase hex characters, or if the
    /// sample doesn't exist and `create` is false.
    pub fn get_sample(&self, md5: &str, crc32: u32, create: bool) -> Option<Sample> {
        if !is_lower_hex(md5, 32) {
            return None;
        }
        let key = SampleKey {
            md5: md5.to_string(),
            crc32,
        };

        {
            let samples = self.samples.read().unwrap();
            if let Some(sample) = samples.get(&key) {
                return Some(sample.clone());
            }
        }

        if !create {
            return None;
        }

        let mut samples = self.samples.write().unwrap();
        let sample = samples
            .entry(key.clone())
            .or_insert_with(|| Sample::new(key.md5.clone(), key.crc32));
        Some(sample.clone())
    }

    /// Get-or-create the Sample, refresh `last_seen`, record `user` as an
    /// observer, and update optional hashes when they validate. Returns
    /// `false` on any validation failure (spec.md §4.2's "input validation
    /// errors return nil/false").
    pub fn checkin(
        &self,
        user: UserId,
        md5: &str,
        crc32: u32,
        sha1: Option<&str>,
        sha256: Option<&str>,
    ) -> bool {
        if !is_lower_hex(md5, 32) {
            return false;
        }
        if let Some(s) = sha1 {
            if !is_lower_hex(s, 40) {
                return false;
            }
        }
        if let Some(s) = sha256 {
            if !is_lower_hex(s, 64) {
                return false;
            }
        }

        let key = SampleKey {
            md5: md5.to_string(),
            crc32,
        };
        let mut samples = self.samples.write().unwrap();
        let sample = samples
            .entry(key.clone())
            .or_insert_with(|| Sample::new(key.md5.clone(), key.crc32));

        sample.last_seen = now_ms();
        sample.seen_by.insert(user);
        if let Some(s) = sha1 {
            sample.sha1 = Some(s.to_string());
        }
        if let Some(s) = sha256 {
            sample.sha256 = Some(s.to_string());
        }
        true
    }

    /// Get (or, if `create`, create) the Function keyed by
    /// `(sha256(opcodes), architecture)`. `apis` is not part of the
    /// uniqueness key — on create, any API strings not already known are
    /// attached to the new row; on a plain lookup they're ignored.
    pub fn get_function(
        &self,
        opcodes: &[u8],
        architecture: &str,
        apis: &std::collections::HashSet<String>,
        create: bool,
    ) -> Option<Function> {
        let sha256 = hex::encode(Sha256::digest(opcodes));
        let key = FunctionKey {
            sha256: sha256.clone(),
            architecture: architecture.to_string(),
        };

        {
            let index = self.functions_by_key.read().unwrap();
            if let Some(&id) = index.get(&key) {
                let functions = self.functions_by_id.read().unwrap();
                return functions.get(&id).cloned();
            }
        }

        if !create {
            return None;
        }

        let mut index = self.functions_by_key.write().unwrap();
        if let Some(&id) = index.get(&key) {
            let functions = self.functions_by_id.read().unwrap();
            return functions.get(&id).cloned();
        }

        let id = self.next_function_id.fetch_add(1, Ordering::SeqCst);
        let function = Function {
            id,
            sha256,
            architecture: architecture.to_string(),
            opcodes: opcodes.to_vec(),
            apis: apis.clone(),
            metadata_ids: std::collections::HashSet::new(),
        };
        index.insert(key, id);
        self.functions_by_id.write().unwrap().insert(id, function.clone());
        Some(function)
    }

    /// Attach `function` to `sample`. Idempotent.
    pub fn add_function_to_sample(&self, sample_key: &SampleKey, function_id: FunctionId) -> bool {
        let mut samples = self.samples.write().unwrap();
        match samples.get_mut(sample_key) {
            Some(sample) => {
                sample.functions.insert(function_id);
                true
            }
            None => false,
        }
    }

    pub fn find_function(&self, lookup: FunctionLookup) -> Option<Function> {
        match lookup {
            FunctionLookup::ById(id) => self.functions_by_id.read().unwrap().get(&id).cloned(),
            FunctionLookup::ByOpcodesAndApis { opcodes, apis } => {
                // The store enforces no uniqueness constraint over `apis`
                // (spec.md's Open Questions: treat this as "match opcodes;
                // intersect apis in application code"). We match any
                // function whose opcodes are byte-identical and whose API
                // set intersects the query's.
                let functions = self.functions_by_id.read().unwrap();
                functions
                    .values()
                    .find(|f| f.opcodes == opcodes && !f.apis.is_disjoint(apis))
                    .cloned()
            }
            FunctionLookup::ByArchAndSha256 {
                architecture,
                sha256,
            } => {
                let key = FunctionKey {
                    sha256: sha256.to_string(),
                    architecture: architecture.to_string(),
                };
                let index = self.functions_by_key.read().unwrap();
                let id = *index.get(&key)?;
                self.functions_by_id.read().unwrap().get(&id).cloned()
            }
        }
    }

    /// Attach a new Metadata id to a Function's back-reference set. Called
    /// by `MetadataStore::add_metadata_to_function` to keep Function's
    /// `metadata_ids` in sync without the metadata store needing to know
    /// about Function's internal representation.
    pub fn link_metadata(&self, function_id: FunctionId, metadata_id: crate::models::MetadataId) {
        if let Some(f) = self.functions_by_id.write().unwrap().get_mut(&function_id) {
            f.metadata_ids.insert(metadata_id);
        }
    }

    /// Distinct architecture tags present in storage (for the facade's
    /// `architectures` operation, unioned with the hard-coded standards
    /// set).
    pub fn architectures(&self) -> std::collections::HashSet<String> {
        self.functions_by_id
            .read()
            .unwrap()
            .values()
            .map(|f| f.architecture.clone())
            .collect()
    }
}
