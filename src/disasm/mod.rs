//! Disassembler (spec.md §2, "external interface").
//!
//! The similarity engines depend on a decoded instruction stream, not on
//! raw bytes — `original_source/server/first_core/disassembly/__init__.py`
//! wraps a third-party engine (Capstone) behind a small per-architecture
//! dispatch table. This module is the Rust-native default implementation
//! of that seam: a [`Decoder`] trait plus one family per architecture
//! group, registered in [`disassemble`]. Production deployments swap in a
//! real ISA decoder behind the same trait; this default only needs to be
//! consistent with itself (deterministic, total on any byte slice) since
//! every engine that reads instructions reads them from this module alone.

mod intel;
mod fixed_width;

use serde::{Deserialize, Serialize};

/// One decoded instruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instruction {
    /// Canonical mnemonic, e.g. `"call"`, `"jmp"`, `"mov"`.
    pub mnemonic: String,
    /// Byte offset into the function's opcodes.
    pub offset: usize,
    /// Instruction length in bytes, including any operand.
    pub len: usize,
    pub is_call: bool,
    pub is_jump: bool,
    /// True when the (single) branch/call operand is an immediate
    /// (relative or absolute displacement) rather than a register/memory
    /// indirection.
    pub operand_is_immediate: bool,
    /// Width, in bits, of that immediate operand (0 when not applicable).
    pub operand_width_bits: usize,
}

/// A full decoded function body, computed once per request and shared
/// read-only across every engine (spec.md §5's ordering/sharing rule).
#[derive(Debug, Clone)]
pub struct Disassembly {
    pub architecture: String,
    pub instructions: Vec<Instruction>,
}

impl Disassembly {
    pub fn mnemonics(&self) -> impl Iterator<Item = &str> {
        self.instructions.iter().map(|i| i.mnemonic.as_str())
    }
}

/// Decoder family trait — the seam a real ISA decoder would implement.
pub trait Decoder: Send + Sync {
    fn decode(&self, opcodes: &[u8]) -> Vec<Instruction>;
}

/// Architecture tags this build ships a decoder for, per spec.md §4.6
/// ("Engine requires the architecture to be one of the supported decoder
/// families"). Additional tags can be registered without touching engine
/// code, since engines only depend on `Disassembly`.
pub fn decoder_for(architecture: &str) -> Option<Box<dyn Decoder>> {
    match architecture {
        "intel32" | "intel64" => Some(Box::new(intel::IntelDecoder {
            addr64: architecture == "intel64",
        })),
        "arm64" | "mips" | "ppc" => Some(Box::new(fixed_width::FixedWidthDecoder)),
        _ => None,
    }
}

/// Disassemble `opcodes` for `architecture`. Returns `None` for
/// architectures with no registered decoder family (see spec.md §4.6).
pub fn disassemble(opcodes: &[u8], architecture: &str) -> Option<Disassembly> {
    let decoder = decoder_for(architecture)?;
    Some(Disassembly {
        architecture: architecture.to_string(),
        instructions: decoder.decode(opcodes),
    })
}

/// Every architecture tag this build recognizes, used by the facade's
/// `architectures` operation (unioned with whatever architectures are
/// present in storage). Matches the original's `FIRSTDB.standards` set
/// exactly, including `sysz` and `arm32`/`sparc`, for which this build has
/// no registered decoder — `decoder_for` still returns `None` for those,
/// same as any unsupported tag.
pub const STANDARD_ARCHITECTURES: &[&str] = &[
    "intel16", "intel32", "intel64", "arm32", "arm64", "mips", "ppc", "sparc", "sysz",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_architecture_returns_none() {
        assert!(disassemble(b"\x90\x90\x90\x90\x90\x90\x90\x90", "sparc64-exotic").is_none());
    }

    #[test]
    fn supported_architectures_always_decode() {
        for arch in ["intel32", "intel64", "arm64", "mips", "ppc"] {
            let d = disassemble(&[0u8; 64], arch).unwrap();
            assert!(!d.instructions.is_empty());
        }
    }
}
