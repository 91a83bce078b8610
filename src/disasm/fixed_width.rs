//! Fixed-width (4-byte) instruction family covering arm64/mips/ppc.
//!
//! These architectures encode every instruction in one 32-bit word. A full
//! decode table for three RISC ISAs is out of scope for the default
//! implementation (see `disasm::mod`'s module doc); instead each word is
//! bucketed into a coarse mnemonic class by its high-order bits, which is
//! enough to produce a stable, deterministic mnemonic stream for
//! `MnemonicHash` and a branch/call classification for `BasicMasking`.
//! A real port would replace this with per-architecture decode tables
//! behind the same `Decoder` trait.

use super::{Decoder, Instruction};

pub struct FixedWidthDecoder;

/// Coarse mnemonic buckets, keyed by the top 6 bits of the instruction word.
/// Branch/call classification follows common RISC convention: a handful of
/// high-order bit patterns are reserved for unconditional/conditional
/// branches and link-register calls across these ISAs.
fn classify(word: u32) -> (&'static str, bool, bool) {
    let top6 = (word >> 26) & 0x3F;
    match top6 {
        0x12 => ("call", true, false),  // branch-and-link family
        0x10 => ("jmp", false, true),   // unconditional branch family
        0x04..=0x0F => ("jcc", false, true), // conditional branch family
        0x00 => ("alu_reg", false, false),
        0x08..=0x09 => ("alu_imm", false, false),
        0x20..=0x27 => ("load", false, false),
        0x28..=0x2F => ("store", false, false),
        _ => ("op", false, false),
    }
}

impl Decoder for FixedWidthDecoder {
    fn decode(&self, opcodes: &[u8]) -> Vec<Instruction> {
        let mut out = Vec::new();
        let mut offset = 0usize;
        while offset + 4 <= opcodes.len() {
            let word = u32::from_be_bytes(opcodes[offset..offset + 4].try_into().unwrap());
            let (mnemonic, is_call, is_jump) = classify(word);
            // Displacement fields in these ISAs are embedded in the fixed
            // instruction word rather than a trailing immediate byte
            // sequence, so there is no separate "operand" to mask off —
            // the whole word is the operand when it's a branch/call.
            out.push(Instruction {
                mnemonic: mnemonic.to_string(),
                offset,
                len: 4,
                is_call,
                is_jump,
                operand_is_immediate: is_call || is_jump,
                operand_width_bits: if is_call || is_jump { 26 } else { 0 },
            });
            offset += 4;
        }
        // A trailing partial word still contributes one instruction so the
        // stream covers every input byte, matching the intel decoder's
        // "never stalls" guarantee.
        if offset < opcodes.len() {
            out.push(Instruction {
                mnemonic: "db".to_string(),
                offset,
                len: opcodes.len() - offset,
                is_call: false,
                is_jump: false,
                operand_is_immediate: false,
                operand_width_bits: 0,
            });
        }
        out
    }
}
