//! BasicMasking (spec.md §4.7).
//!
//! Normalizes call/jump instructions by masking their immediate operand
//! before hashing, so two functions that differ only in a branch target —
//! a relocated call, a patched jump offset — still collide. Every other
//! instruction contributes its raw bytes unmasked. The source additionally
//! masked stack-relative displacements and image-base immediates behind a
//! commented-out code path; that stays out of scope here too (spec.md §9).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use sha2::{Digest, Sha256};

use crate::disasm::Disassembly;
use crate::engines::{Engine, FunctionDump, FunctionResult};
use crate::store::{FunctionLookup, FunctionStore};

const MIN_REQUIRED_INSTRUCTIONS: usize = 8;

/// Index key: `(sha256(normalized), architecture, total_bytes)`.
type IndexKey = (String, String, usize);

struct Normalized {
    sha256: String,
    changed_bits: usize,
}

fn normalize(opcodes: &[u8], disassembly: Option<&Disassembly>) -> Option<Normalized> {
    let disassembly = disassembly?;
    if disassembly.instructions.len() < MIN_REQUIRED_INSTRUCTIONS {
        return None;
    }

    let mut changed_bits = 0usize;
    let mut normalized = Vec::with_capacity(opcodes.len());

    for instr in &disassembly.instructions {
        let end = (instr.offset + instr.len).min(opcodes.len());
        let Some(bytes) = opcodes.get(instr.offset..end) else {
            continue;
        };

        if (instr.is_call || instr.is_jump) && instr.operand_is_immediate {
            let operand_bytes = (instr.operand_width_bits / 8).min(bytes.len());
            let split = bytes.len() - operand_bytes;
            normalized.extend_from_slice(&bytes[..split]);
            normalized.extend(std::iter::repeat(0u8).take(operand_bytes));
            changed_bits += instr.operand_width_bits;
        } else {
            normalized.extend_from_slice(bytes);
        }
    }

    Some(Normalized {
        sha256: hex::encode(Sha256::digest(&normalized)),
        changed_bits,
    })
}

pub struct BasicMasking {
    functions: Arc<FunctionStore>,
    index: RwLock<HashMap<IndexKey, HashSet<crate::models::FunctionId>>>,
}

impl BasicMasking {
    pub fn new(functions: Arc<FunctionStore>) -> Self {
        Self {
            functions,
            index: RwLock::new(HashMap::new()),
        }
    }
}

impl Engine for BasicMasking {
    fn name(&self) -> &'static str {
        "BasicMasking"
    }

    fn description(&self) -> &'static str {
        "Masks calls/jmps offsets. Requires at least 8 instructions."
    }

    fn add(&self, function: &FunctionDump) {
        let Some(normalized) = normalize(function.opcodes, function.disassembly) else {
            return;
        };
        let key = (
            normalized.sha256,
            function.architecture.to_string(),
            function.opcodes.len(),
        );
        self.index.write().unwrap().entry(key).or_default().insert(function.id);
    }

    fn scan(
        &self,
        opcodes: &[u8],
        architecture: &str,
        apis: &HashSet<String>,
        disassembly: Option<&Disassembly>,
    ) -> Vec<FunctionResult> {
        let Some(normalized) = normalize(opcodes, disassembly) else {
            return Vec::new();
        };
        let key = (normalized.sha256, architecture.to_string(), opcodes.len());

        let ids: Vec<_> = {
            let index = self.index.read().unwrap();
            match index.get(&key) {
                Some(ids) => ids.iter().copied().collect(),
                None => return Vec::new(),
            }
        };

        let total_input_bits = (opcodes.len() * 8).max(1) as f64;
        let mut similarity = 100.0 * (1.0 - normalized.changed_bits as f64 / total_input_bits);
        if similarity > 90.0 {
            similarity = 90.0;
        }

        let mut results = Vec::new();
        for id in ids {
            let Some(function) = self.functions.find_function(FunctionLookup::ById(id)) else {
                continue;
            };
            if function.metadata_ids.is_empty() {
                continue;
            }

            let mut function_similarity = similarity;
            if !function.apis.is_empty() {
                let overlap = function.apis.intersection(apis).count() as f64;
                function_similarity += (overlap / function.apis.len() as f64) * 10.0;
            }

            results.push(FunctionResult::new(
                id,
                function_similarity.min(100.0),
                self.name(),
            ));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm;

    #[test]
    fn call_with_different_immediate_still_collides() {
        let functions = Arc::new(FunctionStore::new());
        let apis = HashSet::new();

        let mut original = vec![0x90u8; 64]; // nops
        original.extend([0xE8, 0x00, 0x00, 0x00, 0x00]); // call rel32 = 0
        let mut patched = original.clone();
        patched[65] = 0xAA; // different displacement

        let d1 = disasm::disassemble(&original, "intel32").unwrap();
        let d2 = disasm::disassemble(&patched, "intel32").unwrap();
        assert!(d1.instructions.len() >= MIN_REQUIRED_INSTRUCTIONS);

        let f = functions.get_function(&original, "intel32", &apis, true).unwrap();
        functions.link_metadata(f.id, 1);

        let engine = BasicMasking::new(functions);
        engine.add(&FunctionDump {
            id: f.id,
            apis: &apis,
            opcodes: &original,
            architecture: "intel32",
            sha256: &f.sha256,
            disassembly: Some(&d1),
        });

        let results = engine.scan(&patched, "intel32", &apis, Some(&d2));
        assert_eq!(results.len(), 1);
        assert!(results[0].similarity >= 85.0);
    }
}
