//! ExactMatch (spec.md §4.5).
//!
//! The Function Store already carries `sha256(opcodes)` as part of the
//! Function's primary key, so this engine keeps no private index at all —
//! `add` is a no-op, and `scan` is a straight lookup through
//! `FunctionStore::find_function`.

use std::collections::HashSet;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::disasm::Disassembly;
use crate::engines::{Engine, FunctionDump, FunctionResult};
use crate::store::{FunctionLookup, FunctionStore};

pub struct ExactMatch {
    functions: Arc<FunctionStore>,
}

impl ExactMatch {
    pub fn new(functions: Arc<FunctionStore>) -> Self {
        Self { functions }
    }
}

impl Engine for ExactMatch {
    fn name(&self) -> &'static str {
        "ExactMatch"
    }

    fn description(&self) -> &'static str {
        "Hashes the function's opcodes and finds direct matches"
    }

    fn add(&self, _function: &FunctionDump) {}

    fn scan(
        &self,
        opcodes: &[u8],
        architecture: &str,
        apis: &HashSet<String>,
        _disassembly: Option<&Disassembly>,
    ) -> Vec<FunctionResult> {
        let sha256 = hex::encode(Sha256::digest(opcodes));
        let Some(function) = self.functions.find_function(FunctionLookup::ByArchAndSha256 {
            architecture,
            sha256: &sha256,
        }) else {
            return Vec::new();
        };

        let mut similarity = 90.0;
        if function.apis == *apis {
            similarity += 10.0;
        }

        vec![FunctionResult::new(function.id, similarity, self.name())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FunctionStore;

    #[test]
    fn scan_finds_previously_indexed_opcodes() {
        let functions = Arc::new(FunctionStore::new());
        let apis = HashSet::from(["CreateFileA".to_string()]);
        let f = functions
            .get_function(b"exact match opcodes!!", "intel32", &apis, true)
            .unwrap();

        let engine = ExactMatch::new(functions);
        let results = engine.scan(b"exact match opcodes!!", "intel32", &apis, None);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].function_id, f.id);
        assert_eq!(results[0].similarity, 100.0, "api sets match exactly");
    }

    #[test]
    fn scan_without_api_match_gets_base_similarity() {
        let functions = Arc::new(FunctionStore::new());
        let indexed_apis = HashSet::from(["CreateFileA".to_string()]);
        functions
            .get_function(b"exact match opcodes!!", "intel32", &indexed_apis, true)
            .unwrap();

        let engine = ExactMatch::new(functions);
        let results = engine.scan(
            b"exact match opcodes!!",
            "intel32",
            &HashSet::new(),
            None,
        );
        assert_eq!(results[0].similarity, 90.0);
    }

    #[test]
    fn scan_misses_unknown_opcodes() {
        let functions = Arc::new(FunctionStore::new());
        let engine = ExactMatch::new(functions);
        assert!(engine.scan(b"never seen before", "intel32", &HashSet::new(), None).is_empty());
    }
}
