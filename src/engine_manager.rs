//! Engine Manager (spec.md §4.9).
//!
//! Dispatches `add`/`scan` to every active engine and merges their answers.
//! The original source dynamically imports each engine's Python module by
//! path; spec.md §9's first design note replaces that with a compile-time
//! registry keyed by engine name, so the Engine catalog row still decides
//! *which* engines run, without reflection. Engine panics are caught here
//! (spec.md §7's `EngineError`) and logged rather than propagated — a bad
//! engine must never take the manager, or its peers, down with it
//! (spec.md §5 "Shared resources").

use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use rayon::prelude::*;

use crate::disasm::{self, Disassembly};
use crate::engines::basic_masking::BasicMasking;
use crate::engines::catalog1::Catalog1;
use crate::engines::exact_match::ExactMatch;
use crate::engines::mnemonic_hash::MnemonicHash;
use crate::engines::{Engine, FunctionDump, FunctionResult};
use crate::models::{EngineId, EngineRecord, FunctionId};
use crate::store::metadata_store::{AnnotationDump, EngineLookup};
use crate::store::{FunctionLookup, FunctionStore, MetadataStore, UserStore};

type EngineCtor = fn(Arc<FunctionStore>) -> Arc<dyn Engine>;

/// The compile-time engine registry. Adding a fifth shipped engine means
/// adding one line here and one `EngineRecord` to whatever seeds the
/// catalog — no other code in the manager changes.
fn registry() -> &'static [(&'static str, EngineCtor)] {
    &[
        ("ExactMatch", |f| Arc::new(ExactMatch::new(f))),
        ("MnemonicHash", |f| Arc::new(MnemonicHash::new(f))),
        ("BasicMasking", |f| Arc::new(BasicMasking::new(f))),
        ("Catalog1", |f| Arc::new(Catalog1::new(f))),
    ]
}

/// The built-in catalog: all four shipped engines, active, in the order
/// spec.md §2 lists them. Operators wanting a different mix supply their
/// own `Vec<EngineRecord>` to [`EngineManager::new`].
pub fn default_catalog() -> Vec<EngineRecord> {
    registry()
        .iter()
        .enumerate()
        .map(|(i, (name, _))| EngineRecord {
            id: (i + 1) as EngineId,
            name: name.to_string(),
            description: String::new(),
            module_path: format!("first_core::engines::{}", name.to_lowercase()),
            class_name: name.to_string(),
            developer: None,
            active: true,
        })
        .collect()
}

struct LoadedEngine {
    record: EngineRecord,
    engine: Arc<dyn Engine>,
}

/// One scan hit: an annotation with the engine-contributed similarity and
/// provenance layered on top (spec.md §4.9 step 4).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScanAnnotation {
    pub id: String,
    pub creator: String,
    pub name: String,
    pub prototype: String,
    pub comment: String,
    pub rank: usize,
    pub similarity: f64,
    pub engines: Vec<String>,
}

impl ScanAnnotation {
    fn from_dump(dump: AnnotationDump, similarity: f64, engines: Vec<String>) -> Self {
        Self {
            id: dump.id,
            creator: dump.creator,
            name: dump.name,
            prototype: dump.prototype,
            comment: dump.comment,
            rank: dump.rank,
            similarity,
            engines,
        }
    }
}

pub struct EngineManager {
    functions: Arc<FunctionStore>,
    metadata: Arc<MetadataStore>,
    users: Arc<UserStore>,
    loaded: Vec<LoadedEngine>,
}

impl EngineManager {
    /// Loads the engines named by `active=true` catalog rows. Catalog
    /// entries whose name isn't in the compile-time registry, or that are
    /// inactive, are skipped with a log line — a bad or unknown catalog
    /// row never prevents the rest of the manager from starting
    /// (spec.md §4.9 "load_active_engines").
    pub fn new(
        functions: Arc<FunctionStore>,
        metadata: Arc<MetadataStore>,
        users: Arc<UserStore>,
        catalog: Vec<EngineRecord>,
    ) -> Self {
        let reg = registry();
        let mut loaded = Vec::new();
        for record in catalog {
            if !record.active {
                tracing::info!(engine = %record.name, "engine catalog row inactive, skipping");
                continue;
            }
            let Some((_, ctor)) = reg.iter().find(|(name, _)| *name == record.name) else {
                tracing::warn!(engine = %record.name, "no compile-time constructor registered, skipping");
                continue;
            };
            let engine = ctor(functions.clone());
            if !engine.is_operational() {
                tracing::warn!(engine = %record.name, "engine reports not operational, skipping");
                continue;
            }
            loaded.push(LoadedEngine { record, engine });
        }
        Self {
            functions,
            metadata,
            users,
            loaded,
        }
    }

    pub fn with_default_catalog(
        functions: Arc<FunctionStore>,
        metadata: Arc<MetadataStore>,
        users: Arc<UserStore>,
    ) -> Self {
        Self::new(functions, metadata, users, default_catalog())
    }

    /// Best-effort fan-out of `add` to every active engine. A panicking
    /// engine is caught, logged, and skipped; its peers still run
    /// (spec.md §4.9 "add").
    pub fn add(&self, dump: &FunctionDump) {
        for loaded in &self.loaded {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| loaded.engine.add(dump)));
            if outcome.is_err() {
                tracing::warn!(engine = %loaded.record.name, "engine add() panicked, isolating");
            }
        }
    }

    /// Runs every active engine's `scan`, merges by function id (max
    /// similarity, union of contributing engines), resolves each merged
    /// function's user annotations, and ranks them (spec.md §4.9 steps
    /// 1-5). Returns the contributing engines' `{name: description}` map
    /// alongside the ranked annotation list (step 6).
    pub fn scan(
        &self,
        opcodes: &[u8],
        architecture: &str,
        apis: &HashSet<String>,
    ) -> (HashMap<String, String>, Vec<ScanAnnotation>) {
        let disassembly = disasm::disassemble(opcodes, architecture);
        let disassembly_ref: Option<&Disassembly> = disassembly.as_ref();

        // Each engine's `scan` is independent and CPU-bound (Catalog1's
        // `slow_sign` especially so, per spec.md §5) — fan them out across
        // the thread pool the way the teacher parallelizes independent
        // per-shard work, then merge the per-engine results sequentially
        // below since the merge itself is a small, order-independent fold
        // (spec.md §5 "Ordering guarantees").
        let per_engine: Vec<(&'static str, &'static str, Vec<FunctionResult>)> = self
            .loaded
            .par_iter()
            .filter_map(|loaded| {
                let engine = &loaded.engine;
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    engine.scan(opcodes, architecture, apis, disassembly_ref)
                }));
                match outcome {
                    Ok(results) if !results.is_empty() => {
                        Some((engine.name(), engine.description(), results))
                    }
                    Ok(_) => None,
                    Err(_) => {
                        tracing::warn!(engine = %loaded.record.name, "engine scan() panicked, isolating");
                        None
                    }
                }
            })
            .collect();

        let mut merged: HashMap<FunctionId, FunctionResult> = HashMap::new();
        let mut contributing: HashMap<String, String> = HashMap::new();

        for (name, description, results) in per_engine {
            contributing.entry(name.to_string()).or_insert_with(|| description.to_string());
            for result in results {
                merged
                    .entry(result.function_id)
                    .and_modify(|existing| {
                        existing.engines.extend(result.engines.iter().cloned());
                        if result.similarity > existing.similarity {
                            existing.similarity = result.similarity;
                        }
                    })
                    .or_insert(result);
            }
        }

        let mut all_annotations: Vec<ScanAnnotation> = Vec::new();
        for result in merged.into_values() {
            let Some(function) = self.functions.find_function(FunctionLookup::ById(result.function_id)) else {
                continue;
            };
            let mut engines: Vec<String> = result.engines.into_iter().collect();
            engines.sort();

            let mut per_function: Vec<ScanAnnotation> = function
                .metadata_ids
                .iter()
                .filter_map(|&id| self.metadata.dump_user(id, &self.users))
                .map(|dump| ScanAnnotation::from_dump(dump, result.similarity, engines.clone()))
                .collect();

            per_function.sort_by(|a, b| {
                b.similarity
                    .partial_cmp(&a.similarity)
                    .unwrap()
                    .then(b.rank.cmp(&a.rank))
            });
            per_function.truncate(10);
            all_annotations.extend(per_function);
        }

        all_annotations.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap()
                .then(b.rank.cmp(&a.rank))
        });
        all_annotations.truncate(30);

        (contributing, all_annotations)
    }
}

impl EngineLookup for EngineManager {
    fn describe(&self, engine_id: u32) -> Option<(String, String)> {
        self.loaded
            .iter()
            .find(|l| l.record.id == engine_id)
            .map(|l| (l.engine.name().to_string(), l.engine.description().to_string()))
    }
}
