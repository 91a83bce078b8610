//! Catalog1 — xorpd's locality-sensitive "catalog1" signature algorithm
//! (spec.md §4.8), ported from `original_source`'s `catalog1.py`.
//!
//! A 64-integer min-hash-style signature over 4-byte sliding windows. Two
//! byte strings with the same signature are treated as identical; two with
//! mostly-overlapping signatures are treated as similar. The 128 constants
//! below are part of the wire contract (signatures must be reproducible
//! across implementations) and are carried over byte-for-byte.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use sha2::{Digest, Sha256};

use crate::disasm::Disassembly;
use crate::engines::{Engine, FunctionDump, FunctionResult};
use crate::store::{FunctionLookup, FunctionStore};

const WORD_SIZE: u32 = 32;
const NUM_ITERS: u32 = 4;
pub const NUM_PERMS: u32 = 64;
const MIN_SIMILARITY_COUNT: u32 = NUM_PERMS * 80 / 100; // similarity > 80 <=> count > 51.2

#[rustfmt::skip]
const RAND: [u32; 128] = [
    1445200656, 3877429363, 1060188777, 4260769784, 1438562000, 2836098482, 1986405151, 4230168452,
    380326093, 2859127666, 1134102609, 788546250, 3705417527, 1779868252, 1958737986, 4046915967,
    1614805928, 4160312724, 3682325739, 534901034, 2287240917, 2677201636, 71025852, 1171752314,
    47956297, 2265969327, 2865804126, 1364027301, 2267528752, 1998395705, 576397983, 636085149,
    3876141063, 1131266725, 3949079092, 1674557074, 2566739348, 3782985982, 2164386649, 550438955,
    2491039847, 2409394861, 3757073140, 3509849961, 3972853470, 1377009785, 2164834118, 820549672,
    2867309379, 1454756115, 94270429, 2974978638, 2915205038, 1887247447, 3641720023, 4292314015,
    702694146, 1808155309, 95993403, 1529688311, 2883286160, 1410658736, 3225014055, 1903093988,
    2049895643, 476880516, 3241604078, 3709326844, 2531992854, 265580822, 2920230147, 4294230868,
    408106067, 3683123785, 1782150222, 3876124798, 3400886112, 1837386661, 664033147, 3948403539,
    3572529266, 4084780068, 691101764, 1191456665, 3559651142, 709364116, 3999544719, 189208547,
    3851247656, 69124994, 1685591380, 1312437435, 2316872331, 1466758250, 1979107610, 2611873442,
    80372344, 1251839752, 2716578101, 176193185, 2142192370, 1179562050, 1290470544, 1957198791,
    1435943450, 2989992875, 3703466909, 1302678442, 3343948619, 3762772165, 1438266632, 1761719790,
    3668101852, 1283600006, 671544087, 1665876818, 3645433092, 3760380605, 3802664867, 1635015896,
    1060356828, 1666255066, 2953295653, 2827859377, 386702151, 3372348076, 4248620909, 2259505262,
];

/// One of `NUM_PERMS` pseudo-random permutations over 32-bit words, 4
/// rounds each. `(i + p + x) mod 128`-style indices are computed with
/// wrapping arithmetic: the true (arbitrary-precision) sum's value mod 128
/// always equals the `u32`-wrapped sum's value mod 128, since `2^32` is a
/// multiple of 128.
fn perm(p: u32, mut x: u32) -> u32 {
    for i in 0..NUM_ITERS {
        let idx = (x.wrapping_add(i).wrapping_add(p)) as usize % RAND.len();
        x = x.wrapping_add(RAND[idx]);
        let idx_fixed = (i.wrapping_add(p).wrapping_add(1)) as usize % RAND.len();
        let r = (x ^ RAND[idx_fixed]) % WORD_SIZE;
        x = x.rotate_right(r);

        let idx = (x.wrapping_add(i).wrapping_add(p)) as usize % RAND.len();
        x ^= RAND[idx];
        let r = (x ^ RAND[idx_fixed]) % WORD_SIZE;
        x = x.rotate_right(r);
    }
    x
}

/// The `NUM_PERMS`-vector signature over every 4-byte big-endian window of
/// `data`. `data` must be at least 4 bytes.
fn slow_sign(data: &[u8]) -> Vec<u32> {
    let windows: Vec<u32> = data
        .windows(4)
        .map(|w| u32::from_be_bytes([w[0], w[1], w[2], w[3]]))
        .collect();

    (0..NUM_PERMS)
        .map(|p| windows.iter().map(|&w| perm(p, w)).min().unwrap())
        .collect()
}

/// `sha256(concat(sorted-as-strings(signature)))` — the original sorts the
/// integers numerically (`sorted()` on a list of Python ints) before
/// stringifying, not lexicographically on their decimal text.
fn signature_sha256(signature: &[u32]) -> String {
    let mut sorted = signature.to_vec();
    sorted.sort_unstable();
    let joined: String = sorted.iter().map(|v| v.to_string()).collect();
    hex::encode(Sha256::digest(joined.as_bytes()))
}

type FunctionId = crate::models::FunctionId;

pub struct Catalog1 {
    functions: Arc<FunctionStore>,
    by_signature: RwLock<HashMap<(String, String), HashSet<FunctionId>>>,
    by_perm_value: RwLock<HashMap<(u32, String), HashSet<FunctionId>>>,
}

impl Catalog1 {
    pub fn new(functions: Arc<FunctionStore>) -> Self {
        Self {
            functions,
            by_signature: RwLock::new(HashMap::new()),
            by_perm_value: RwLock::new(HashMap::new()),
        }
    }
}

impl Engine for Catalog1 {
    fn name(&self) -> &'static str {
        "Catalog1"
    }

    fn description(&self) -> &'static str {
        "catalog1 sensitive hashing algorithm by xorpd"
    }

    fn add(&self, function: &FunctionDump) {
        if function.opcodes.len() < 4 {
            return;
        }
        let signature = slow_sign(function.opcodes);
        let sig_key = (signature_sha256(&signature), function.architecture.to_string());

        self.by_signature
            .write()
            .unwrap()
            .entry(sig_key)
            .or_default()
            .insert(function.id);

        let mut by_perm_value = self.by_perm_value.write().unwrap();
        for value in signature {
            by_perm_value
                .entry((value, function.architecture.to_string()))
                .or_default()
                .insert(function.id);
        }
    }

    fn scan(
        &self,
        opcodes: &[u8],
        architecture: &str,
        _apis: &HashSet<String>,
        _disassembly: Option<&Disassembly>,
    ) -> Vec<FunctionResult> {
        if opcodes.len() < 4 {
            return Vec::new();
        }
        let signature = slow_sign(opcodes);
        let sig_key = (signature_sha256(&signature), architecture.to_string());

        if let Some(ids) = self.by_signature.read().unwrap().get(&sig_key) {
            return ids
                .iter()
                .filter(|&&id| self.functions.find_function(FunctionLookup::ById(id)).is_some())
                .map(|&id| FunctionResult::new(id, 100.0, self.name()))
                .collect();
        }

        let mut counts: HashMap<FunctionId, u32> = HashMap::new();
        let by_perm_value = self.by_perm_value.read().unwrap();
        for value in &signature {
            if let Some(ids) = by_perm_value.get(&(*value, architecture.to_string())) {
                for &id in ids {
                    *counts.entry(id).or_insert(0) += 1;
                }
            }
        }
        drop(by_perm_value);

        let mut candidates: Vec<(FunctionId, u32)> = counts
            .into_iter()
            .filter(|&(_, count)| count > MIN_SIMILARITY_COUNT)
            .collect();
        candidates.sort_unstable_by(|a, b| b.1.cmp(&a.1));
        candidates.truncate(10);

        candidates
            .into_iter()
            .filter(|(id, _)| self.functions.find_function(FunctionLookup::ById(*id)).is_some())
            .map(|(id, count)| {
                let similarity = 100.0 * count as f64 / NUM_PERMS as f64;
                FunctionResult::new(id, similarity, self.name())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_signature_scores_100() {
        let functions = Arc::new(FunctionStore::new());
        let apis = HashSet::new();
        let opcodes = b"The quick brown fox jumps over 13 lazy dogs.".to_vec();
        let f = functions.get_function(&opcodes, "intel32", &apis, true).unwrap();

        let engine = Catalog1::new(functions);
        engine.add(&FunctionDump {
            id: f.id,
            apis: &apis,
            opcodes: &opcodes,
            architecture: "intel32",
            sha256: &f.sha256,
            disassembly: None,
        });

        let results = engine.scan(&opcodes, "intel32", &apis, None);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].similarity, 100.0);
    }

    #[test]
    fn single_byte_change_still_scores_above_threshold() {
        let functions = Arc::new(FunctionStore::new());
        let apis = HashSet::new();
        let opcodes = b"U1\xd2\x89\xe5\x8bE\x08V\x8buU\xffu\x0c\xe8".to_vec();
        let f = functions.get_function(&opcodes, "intel32", &apis, true).unwrap();

        let engine = Catalog1::new(functions);
        engine.add(&FunctionDump {
            id: f.id,
            apis: &apis,
            opcodes: &opcodes,
            architecture: "intel32",
            sha256: &f.sha256,
            disassembly: None,
        });

        let mut mutated = opcodes.clone();
        mutated[6] = 0xaf;
        let results = engine.scan(&mutated, "intel32", &apis, None);
        assert_eq!(results.len(), 1);
        assert!(results[0].similarity >= 80.0);
    }

    #[test]
    fn too_short_input_is_skipped() {
        let functions = Arc::new(FunctionStore::new());
        let engine = Catalog1::new(functions);
        assert!(engine.scan(b"ab", "intel32", &HashSet::new(), None).is_empty());
    }

    #[test]
    fn perm_is_deterministic_and_total() {
        for p in 0..NUM_PERMS {
            let a = perm(p, 0xdeadbeef);
            let b = perm(p, 0xdeadbeef);
            assert_eq!(a, b);
        }
    }
}
