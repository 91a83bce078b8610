//! Similarity engines (spec.md §4.4-4.8).
//!
//! Each engine owns a private index table, keyed the way the original
//! source's per-engine Django model keyed it (`sha256` + `architecture`,
//! sometimes with extra columns), and a reference to the shared
//! `FunctionStore` for resolving function ids back to full rows. Engines
//! never talk to each other or to `MetadataStore` directly — the
//! `EngineManager` is the only thing that fans out to all of them and
//! merges their results (spec.md §4.9).

pub mod basic_masking;
pub mod catalog1;
pub mod exact_match;
pub mod mnemonic_hash;

use std::collections::HashSet;

use crate::disasm::Disassembly;
use crate::models::FunctionId;

/// One engine's opinion about a function, scoped to that engine until the
/// manager merges it with peers' results.
#[derive(Debug, Clone)]
pub struct FunctionResult {
    pub function_id: FunctionId,
    pub similarity: f64,
    pub engines: HashSet<String>,
}

impl FunctionResult {
    pub fn new(function_id: FunctionId, similarity: f64, engine_name: &str) -> Self {
        Self {
            function_id,
            similarity,
            engines: HashSet::from([engine_name.to_string()]),
        }
    }
}

/// The dump an engine's `add` indexes — a borrowed view over a freshly
/// stored `Function`, plus the disassembly computed once per request
/// (spec.md §4.4, §5).
pub struct FunctionDump<'a> {
    pub id: FunctionId,
    pub apis: &'a HashSet<String>,
    pub opcodes: &'a [u8],
    pub architecture: &'a str,
    pub sha256: &'a str,
    pub disassembly: Option<&'a Disassembly>,
}

/// A similarity-matching engine (spec.md §4.4).
///
/// `add` and `scan` failures are the engine's own business: they return
/// empty results or silently skip rather than erroring, since spec.md §7
/// classifies unsuitable input as `EngineSkip` (silent) and anything else
/// as `EngineError` (logged, isolated) — neither ever reaches a caller as
/// a `FirstError`.
pub trait Engine: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// Operator-assigned tie-break weight, used only when the manager
    /// needs to order otherwise-equal annotations (spec.md §4.9 Rank 1/2
    /// sort keys reference a Metadata's `rank`, not this value — this is
    /// the engine catalog row's own rank column, carried through for
    /// parity with the source schema).
    fn rank(&self) -> u32 {
        0
    }
    fn is_operational(&self) -> bool {
        true
    }
    fn add(&self, function: &FunctionDump);
    fn scan(
        &self,
        opcodes: &[u8],
        architecture: &str,
        apis: &HashSet<String>,
        disassembly: Option<&Disassembly>,
    ) -> Vec<FunctionResult>;
}
