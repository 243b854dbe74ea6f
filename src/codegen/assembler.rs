/// Byte buffer with an assembly listing, local labels and fixups
use super::backend::{LoweredFunction, LoweredModule, Relocation};
use crate::ir::Linkage;
use std::collections::HashMap;

/// How a PC-relative displacement is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    /// x86-64 rel32 at the patch offset, relative to the end of the field
    Rel32,
    /// AArch64 B/BL: imm26 word offset in the instruction at the patch offset
    Imm26,
    /// AArch64 CBZ/CBNZ: imm19 word offset in bits 5..24
    Imm19,
}

#[derive(Debug, Clone)]
struct Fixup {
    at: usize,
    origin: usize,
    kind: PatchKind,
}

#[derive(Debug, Default)]
pub struct Assembler {
    code: Vec<u8>,
    listing: Vec<String>,
    functions: Vec<LoweredFunction>,
    relocations: Vec<Relocation>,
    current: Option<(String, Linkage, usize)>,
    labels: HashMap<u32, usize>,
    label_fixups: Vec<(Fixup, u32)>,
    call_fixups: Vec<(Fixup, String)>,
    local_counter: usize,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pos(&self) -> usize {
        self.code.len()
    }

    /// Append one machine instruction and its listing text.
    pub fn inst(&mut self, bytes: &[u8], text: impl Into<String>) {
        self.code.extend_from_slice(bytes);
        self.listing.push(format!("\t{}", text.into()));
    }

    /// Append one little-endian 32-bit instruction word.
    pub fn word(&mut self, word: u32, text: impl Into<String>) {
        self.inst(&word.to_le_bytes(), text);
    }

    /// Append an assembler directive or local label that emits no bytes.
    pub fn directive(&mut self, text: impl Into<String>) {
        self.listing.push(text.into());
    }

    pub fn begin_function(&mut self, name: &str, linkage: Linkage) {
        if linkage == Linkage::External {
            self.directive(format!("\t.globl {}", name));
        }
        self.directive(format!("{}:", name));
        self.current = Some((name.to_string(), linkage, self.pos()));
        self.labels.clear();
    }

    pub fn end_function(&mut self) {
        for (fixup, label) in std::mem::take(&mut self.label_fixups) {
            // the verifier guarantees every jump target exists
            let target = self.labels.get(&label).copied().unwrap_or(fixup.origin);
            patch(&mut self.code, &fixup, target);
        }
        if let Some((name, linkage, offset)) = self.current.take() {
            let size = self.pos() - offset;
            self.functions.push(LoweredFunction { name, linkage, offset, size });
        }
        self.directive("");
    }

    /// Listing name of a function-local label.
    pub fn label_name(&self, label: u32) -> String {
        let function = self.current.as_ref().map(|(name, _, _)| name.as_str()).unwrap_or("");
        format!(".L{}_{}", function, label)
    }

    /// Fresh listing label for inline literals.
    pub fn local_name(&mut self) -> String {
        self.local_counter += 1;
        format!(".Ltmp{}", self.local_counter)
    }

    pub fn bind_label(&mut self, label: u32) {
        self.labels.insert(label, self.pos());
        let name = self.label_name(label);
        self.directive(format!("{}:", name));
    }

    /// Record a branch to `label`. `at` is the patched field, `origin` the address
    /// displacements are measured from.
    pub fn fixup_label(&mut self, at: usize, origin: usize, kind: PatchKind, label: u32) {
        self.label_fixups.push((Fixup { at, origin, kind }, label));
    }

    /// Record a direct call to a function defined in the same module.
    pub fn fixup_call(&mut self, at: usize, origin: usize, kind: PatchKind, function: &str) {
        self.call_fixups.push((Fixup { at, origin, kind }, function.to_string()));
    }

    /// Record a 64-bit absolute address of `symbol` at `offset`.
    pub fn relocate(&mut self, offset: usize, symbol: &str) {
        self.relocations.push(Relocation { offset, symbol: symbol.to_string() });
    }

    pub fn finish(mut self) -> LoweredModule {
        let offsets: HashMap<&str, usize> = self.functions.iter().map(|f| (f.name.as_str(), f.offset)).collect();
        for (fixup, function) in &self.call_fixups {
            match offsets.get(function.as_str()) {
                Some(&target) => patch(&mut self.code, fixup, target),
                None => unreachable!("direct call to @{} which was never lowered", function),
            }
        }
        LoweredModule {
            code: self.code,
            functions: self.functions,
            relocations: self.relocations,
            listing: self.listing,
        }
    }
}

fn patch(code: &mut [u8], fixup: &Fixup, target: usize) {
    let delta = target as i64 - fixup.origin as i64;
    let at = fixup.at;
    match fixup.kind {
        PatchKind::Rel32 => {
            code[at..at + 4].copy_from_slice(&(delta as i32).to_le_bytes());
        }
        PatchKind::Imm26 | PatchKind::Imm19 => {
            let mut word = u32::from_le_bytes([code[at], code[at + 1], code[at + 2], code[at + 3]]);
            let imm = (delta >> 2) as u32;
            word |= match fixup.kind {
                PatchKind::Imm26 => imm & 0x03ff_ffff,
                _ => (imm & 0x7ffff) << 5,
            };
            code[at..at + 4].copy_from_slice(&word.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patches_forward_and_backward_rel32() {
        let mut asm = Assembler::new();
        asm.begin_function("f", Linkage::External);
        asm.bind_label(0);
        asm.inst(&[0x90], "nop");
        let at = asm.pos() + 1;
        asm.inst(&[0xe9, 0, 0, 0, 0], "jmp .Lf_0");
        asm.fixup_label(at, at + 4, PatchKind::Rel32, 0);
        asm.end_function();
        let lowered = asm.finish();
        // jump from offset 6 back to 0
        assert_eq!(&lowered.code[1..], &[0xe9, 0xfa, 0xff, 0xff, 0xff]);
        assert_eq!(lowered.functions[0].size, 6);
        assert!(lowered.listing.contains(&".Lf_0:".to_string()));
    }

    #[test]
    fn patches_aarch64_branches_and_calls() {
        let mut asm = Assembler::new();
        asm.begin_function("g", Linkage::Internal);
        asm.word(0xD65F03C0, "ret");
        asm.end_function();
        asm.begin_function("f", Linkage::External);
        let at = asm.pos();
        asm.word(0x94000000, "bl g");
        asm.fixup_call(at, at, PatchKind::Imm26, "g");
        let at = asm.pos();
        asm.word(0xB4000000, "cbz x0, .Lf_1");
        asm.fixup_label(at, at, PatchKind::Imm19, 1);
        asm.bind_label(1);
        asm.end_function();
        let lowered = asm.finish();
        // bl -1 word, cbz +1 word
        assert_eq!(&lowered.code[4..8], &0x97FF_FFFFu32.to_le_bytes());
        assert_eq!(&lowered.code[8..12], &0xB400_0020u32.to_le_bytes());
        assert!(!lowered.listing.iter().any(|line| line.contains(".globl g")));
    }
}
