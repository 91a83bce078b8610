//! MnemonicHash (spec.md §4.6).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use sha2::{Digest, Sha256};

use crate::disasm::Disassembly;
use crate::engines::{Engine, FunctionDump, FunctionResult};
use crate::store::{FunctionLookup, FunctionStore};

const MIN_REQUIRED_MNEMONICS: usize = 8;

/// Index key: `(sha256(concat(mnemonics)), architecture)`.
type IndexKey = (String, String);

pub struct MnemonicHash {
    functions: Arc<FunctionStore>,
    index: RwLock<HashMap<IndexKey, HashSet<crate::models::FunctionId>>>,
}

impl MnemonicHash {
    pub fn new(functions: Arc<FunctionStore>) -> Self {
        Self {
            functions,
            index: RwLock::new(HashMap::new()),
        }
    }

    /// Returns `None` when there's no usable disassembly or it has fewer
    /// than `MIN_REQUIRED_MNEMONICS` mnemonics (spec.md's `EngineSkip`).
    fn hash_of(disassembly: Option<&Disassembly>) -> Option<String> {
        let disassembly = disassembly?;
        let mnemonics: Vec<&str> = disassembly.mnemonics().collect();
        if mnemonics.len() < MIN_REQUIRED_MNEMONICS {
            return None;
        }
        Some(hex::encode(Sha256::digest(mnemonics.concat().as_bytes())))
    }
}

impl Engine for MnemonicHash {
    fn name(&self) -> &'static str {
        "MnemonicHash"
    }

    fn description(&self) -> &'static str {
        "Uses mnemonics from the opcodes to generate a hash. Requires at least 8 mnemonics."
    }

    fn add(&self, function: &FunctionDump) {
        let Some(sha256) = Self::hash_of(function.disassembly) else {
            return;
        };
        let key = (sha256, function.architecture.to_string());
        self.index.write().unwrap().entry(key).or_default().insert(function.id);
    }

    fn scan(
        &self,
        _opcodes: &[u8],
        architecture: &str,
        apis: &HashSet<String>,
        disassembly: Option<&Disassembly>,
    ) -> Vec<FunctionResult> {
        let Some(sha256) = Self::hash_of(disassembly) else {
            return Vec::new();
        };
        let key = (sha256, architecture.to_string());

        let ids: Vec<_> = {
            let index = self.index.read().unwrap();
            match index.get(&key) {
                Some(ids) => ids.iter().copied().collect(),
                None => return Vec::new(),
            }
        };

        let mut results = Vec::new();
        for id in ids {
            let Some(function) = self.functions.find_function(FunctionLookup::ById(id)) else {
                continue;
            };
            if function.metadata_ids.is_empty() {
                continue;
            }

            let mut similarity = 75.0;
            if function.apis.is_empty() {
                similarity += 5.0;
            } else {
                let overlap = function.apis.intersection(apis).count() as f64;
                similarity += (overlap / function.apis.len() as f64) * 10.0;
            }

            results.push(FunctionResult::new(id, similarity, self.name()));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::Instruction;

    fn disassembly_with_mnemonics(mnemonics: &[&str]) -> Disassembly {
        Disassembly {
            architecture: "intel32".to_string(),
            instructions: mnemonics
                .iter()
                .enumerate()
                .map(|(i, m)| Instruction {
                    mnemonic: m.to_string(),
                    offset: i,
                    len: 1,
                    is_call: false,
                    is_jump: false,
                    operand_is_immediate: false,
                    operand_width_bits: 0,
                })
                .collect(),
        }
    }

    #[test]
    fn skips_functions_with_too_few_mnemonics() {
        let functions = Arc::new(FunctionStore::new());
        let engine = MnemonicHash::new(functions);
        let d = disassembly_with_mnemonics(&["mov", "push"]);
        assert!(engine.scan(b"", "intel32", &HashSet::new(), Some(&d)).is_empty());
    }

    #[test]
    fn scan_requires_at_least_one_annotation() {
        let functions = Arc::new(FunctionStore::new());
        let apis = HashSet::new();
        let f = functions.get_function(b"abc", "intel32", &apis, true).unwrap();
        let d = disassembly_with_mnemonics(&["mov", "push", "pop", "add", "sub", "xor", "nop", "ret"]);

        let engine = MnemonicHash::new(functions.clone());
        engine.add(&FunctionDump {
            id: f.id,
            apis: &apis,
            opcodes: b"abc",
            architecture: "intel32",
            sha256: &f.sha256,
            disassembly: Some(&d),
        });

        assert!(
            engine.scan(b"abc", "intel32", &apis, Some(&d)).is_empty(),
            "function has no linked annotations yet"
        );

        functions.link_metadata(f.id, 1);
        let results = engine.scan(b"abc", "intel32", &apis, Some(&d));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].similarity, 80.0, "no apis means a flat +5");
    }
}
