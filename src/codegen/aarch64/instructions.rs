/// AArch64 instruction generation
/// Every instruction is one little-endian 32-bit word.
use super::abi::generate_slot_address;
use crate::codegen::assembler::{Assembler, PatchKind};

pub fn generate_push_x0(asm: &mut Assembler) {
    asm.word(0xF81F0FE0, "str x0, [sp, #-16]!");
}

pub fn generate_pop(asm: &mut Assembler, register: u32) {
    asm.word(0xF84107E0 | register, format!("ldr x{}, [sp], #16", register));
}

/// movz/movk sequence loading `value` into x0
pub fn generate_push(asm: &mut Assembler, value: i64) {
    let bits = value as u64;
    let chunk = |hw: u32| ((bits >> (16 * hw)) & 0xffff) as u32;
    asm.word(0xD2800000 | (chunk(0) << 5), format!("movz x0, #{}", chunk(0)));
    for hw in 1..4 {
        if chunk(hw) != 0 {
            asm.word(
                0xF2800000 | (hw << 21) | (chunk(hw) << 5),
                format!("movk x0, #{}, lsl #{}", chunk(hw), 16 * hw),
            );
        }
    }
    generate_push_x0(asm);
}

fn pop_operands(asm: &mut Assembler) {
    generate_pop(asm, 1); // right operand
    generate_pop(asm, 0); // left operand
}

/// add, sub, mul and sdiv share the x0 = x0 op x1 shape
pub fn generate_binary(asm: &mut Assembler, word: u32, text: &str) {
    pop_operands(asm);
    asm.word(word, text);
    generate_push_x0(asm);
}

pub fn generate_rem(asm: &mut Assembler) {
    pop_operands(asm);
    asm.word(0x9AC10C02, "sdiv x2, x0, x1");
    asm.word(0x9B018040, "msub x0, x2, x1, x0");
    generate_push_x0(asm);
}

/// `cset` is the full CSINC word for the condition
pub fn generate_compare(asm: &mut Assembler, cset: u32, condition: &str) {
    pop_operands(asm);
    asm.word(0xEB01001F, "cmp x0, x1");
    asm.word(cset, format!("cset x0, {}", condition));
    generate_push_x0(asm);
}

pub fn generate_not(asm: &mut Assembler) {
    generate_pop(asm, 0);
    asm.word(0xF100001F, "cmp x0, #0");
    asm.word(0x9A9F17E0, "cset x0, eq");
    generate_push_x0(asm);
}

pub fn generate_drop(asm: &mut Assembler) {
    asm.word(0x910043FF, "add sp, sp, #16");
}

pub fn generate_dup(asm: &mut Assembler) {
    asm.word(0xF94003E0, "ldr x0, [sp]");
    generate_push_x0(asm);
}

pub fn generate_jump(asm: &mut Assembler, label: u32) {
    let at = asm.pos();
    let text = format!("b {}", asm.label_name(label));
    asm.word(0x14000000, text);
    asm.fixup_label(at, at, PatchKind::Imm26, label);
}

pub fn generate_jump_if_zero(asm: &mut Assembler, label: u32) {
    generate_pop(asm, 0);
    let at = asm.pos();
    let text = format!("cbz x0, {}", asm.label_name(label));
    asm.word(0xB4000000, text);
    asm.fixup_label(at, at, PatchKind::Imm19, label);
}

pub fn generate_load_slot(asm: &mut Assembler, slot: usize) {
    generate_slot_address(asm, slot);
    asm.word(0xF9400120, "ldr x0, [x9]");
    generate_push_x0(asm);
}

pub fn generate_store_slot(asm: &mut Assembler, slot: usize) {
    generate_pop(asm, 0);
    generate_slot_address(asm, slot);
    asm.word(0xF9000120, "str x0, [x9]");
}

/// Load the address of `symbol` into x16 from an inline literal
pub fn generate_literal_address(asm: &mut Assembler, symbol: &str) {
    let literal = asm.local_name();
    let after = asm.local_name();
    asm.word(0x58000050, format!("ldr x16, {}", literal));
    asm.word(0x14000003, format!("b {}", after));
    asm.directive(format!("{}:", literal));
    asm.relocate(asm.pos(), symbol);
    asm.inst(&[0; 8], format!(".quad {}", symbol));
    asm.directive(format!("{}:", after));
}

pub fn generate_push_address(asm: &mut Assembler, symbol: &str) {
    generate_literal_address(asm, symbol);
    asm.word(0xAA1003E0, "mov x0, x16");
    generate_push_x0(asm);
}

pub fn generate_load(asm: &mut Assembler) {
    generate_pop(asm, 0);
    asm.word(0xF9400000, "ldr x0, [x0]");
    generate_push_x0(asm);
}

pub fn generate_store(asm: &mut Assembler) {
    generate_pop(asm, 1); // value
    generate_pop(asm, 0); // address
    asm.word(0xF9000001, "str x1, [x0]");
}

pub fn generate_call_internal(asm: &mut Assembler, function: &str) {
    let at = asm.pos();
    asm.word(0x94000000, format!("bl {}", function));
    asm.fixup_call(at, at, PatchKind::Imm26, function);
}

pub fn generate_call_x16(asm: &mut Assembler) {
    asm.word(0xD63F0200, "blr x16");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(f: impl FnOnce(&mut Assembler)) -> Vec<u32> {
        let mut asm = Assembler::new();
        f(&mut asm);
        asm.finish().code.chunks(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()
    }

    #[test]
    fn push_loads_only_nonzero_chunks() {
        assert_eq!(words(|a| generate_push(a, 42)), vec![0xD2800540, 0xF81F0FE0]);
        assert_eq!(words(|a| generate_push(a, 0x1_0000_0005)), vec![0xD28000A0, 0xF2C00020, 0xF81F0FE0]);
        assert_eq!(words(|a| generate_push(a, -1)).len(), 5);
    }

    #[test]
    fn literal_address_is_relocated_after_branch() {
        let mut asm = Assembler::new();
        generate_push_address(&mut asm, "g");
        let lowered = asm.finish();
        assert_eq!(lowered.relocations[0].offset, 8);
        assert_eq!(lowered.code.len(), 24);
    }
}
