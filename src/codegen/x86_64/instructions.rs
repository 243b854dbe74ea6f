/// x86-64 instruction generation
/// Each function generates machine code for one stack-machine operation; the evaluation
/// stack lives on the hardware stack.
use super::abi::slot_offset;
use crate::codegen::assembler::{Assembler, PatchKind};

/// Generate machine code for a push immediate instruction
pub fn generate_push(asm: &mut Assembler, value: i64) {
    if (-128..=127).contains(&value) {
        asm.inst(&[0x6a, value as u8], format!("push {}", value));
    } else if i32::try_from(value).is_ok() {
        let mut code = vec![0x68]; // push imm32 (sign-extended)
        code.extend_from_slice(&(value as i32).to_le_bytes());
        asm.inst(&code, format!("push {}", value));
    } else {
        let mut code = vec![0x48, 0xb8]; // movabs rax, imm64
        code.extend_from_slice(&value.to_le_bytes());
        asm.inst(&code, format!("movabs rax, {}", value));
        asm.inst(&[0x50], "push rax");
    }
}

fn pop_operands(asm: &mut Assembler) {
    asm.inst(&[0x59], "pop rcx"); // right operand
    asm.inst(&[0x58], "pop rax"); // left operand
}

/// Generate machine code for add, sub and mul
pub fn generate_arith(asm: &mut Assembler, code: &[u8], text: &str) {
    pop_operands(asm);
    asm.inst(code, text);
    asm.inst(&[0x50], "push rax");
}

/// Generate machine code for signed division; pushes the quotient or the remainder
pub fn generate_divmod(asm: &mut Assembler, remainder: bool) {
    pop_operands(asm);
    asm.inst(&[0x48, 0x99], "cqo");
    asm.inst(&[0x48, 0xf7, 0xf9], "idiv rcx");
    if remainder {
        asm.inst(&[0x52], "push rdx");
    } else {
        asm.inst(&[0x50], "push rax");
    }
}

/// Generate machine code for a comparison; `setcc` is the second opcode byte of SETcc
pub fn generate_compare(asm: &mut Assembler, setcc: u8, condition: &str) {
    pop_operands(asm);
    asm.inst(&[0x48, 0x39, 0xc8], "cmp rax, rcx");
    asm.inst(&[0x0f, setcc, 0xc0], format!("set{} al", condition));
    asm.inst(&[0x0f, 0xb6, 0xc0], "movzx eax, al");
    asm.inst(&[0x50], "push rax");
}

/// Generate machine code for logical NOT
pub fn generate_not(asm: &mut Assembler) {
    asm.inst(&[0x58], "pop rax");
    asm.inst(&[0x48, 0x85, 0xc0], "test rax, rax");
    asm.inst(&[0x0f, 0x94, 0xc0], "sete al");
    asm.inst(&[0x0f, 0xb6, 0xc0], "movzx eax, al");
    asm.inst(&[0x50], "push rax");
}

pub fn generate_drop(asm: &mut Assembler) {
    asm.inst(&[0x48, 0x83, 0xc4, 0x08], "add rsp, 8");
}

pub fn generate_dup(asm: &mut Assembler) {
    asm.inst(&[0xff, 0x34, 0x24], "push qword ptr [rsp]");
}

/// Generate machine code for an unconditional jump
pub fn generate_jump(asm: &mut Assembler, label: u32) {
    let at = asm.pos() + 1;
    let text = format!("jmp {}", asm.label_name(label));
    asm.inst(&[0xe9, 0, 0, 0, 0], text);
    asm.fixup_label(at, at + 4, PatchKind::Rel32, label);
}

/// Generate machine code for a jump taken when the popped value is zero
pub fn generate_jump_if_zero(asm: &mut Assembler, label: u32) {
    asm.inst(&[0x58], "pop rax");
    asm.inst(&[0x48, 0x85, 0xc0], "test rax, rax");
    let at = asm.pos() + 2;
    let text = format!("jz {}", asm.label_name(label));
    asm.inst(&[0x0f, 0x84, 0, 0, 0, 0], text);
    asm.fixup_label(at, at + 4, PatchKind::Rel32, label);
}

/// Generate machine code pushing frame slot `slot`
pub fn generate_load_slot(asm: &mut Assembler, slot: usize) {
    let offset = slot_offset(slot);
    let text = format!("push qword ptr [rbp - {}]", offset);
    if offset <= 127 {
        asm.inst(&[0xff, 0x75, (-(offset as i8)) as u8], text);
    } else {
        let mut code = vec![0xff, 0xb5];
        code.extend_from_slice(&(-(offset as i32)).to_le_bytes());
        asm.inst(&code, text);
    }
}

/// Generate machine code popping into frame slot `slot`
pub fn generate_store_slot(asm: &mut Assembler, slot: usize) {
    asm.inst(&[0x58], "pop rax");
    let offset = slot_offset(slot);
    let text = format!("mov qword ptr [rbp - {}], rax", offset);
    if offset <= 127 {
        asm.inst(&[0x48, 0x89, 0x45, (-(offset as i8)) as u8], text);
    } else {
        let mut code = vec![0x48, 0x89, 0x85];
        code.extend_from_slice(&(-(offset as i32)).to_le_bytes());
        asm.inst(&code, text);
    }
}

/// Generate machine code pushing the address of `symbol`, filled in by a relocation
pub fn generate_push_address(asm: &mut Assembler, symbol: &str) {
    asm.relocate(asm.pos() + 2, symbol);
    asm.inst(&[0x48, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0], format!("movabs rax, offset {}", symbol));
    asm.inst(&[0x50], "push rax");
}

pub fn generate_load(asm: &mut Assembler) {
    asm.inst(&[0x58], "pop rax");
    asm.inst(&[0x48, 0x8b, 0x00], "mov rax, qword ptr [rax]");
    asm.inst(&[0x50], "push rax");
}

pub fn generate_store(asm: &mut Assembler) {
    asm.inst(&[0x59], "pop rcx"); // value
    asm.inst(&[0x58], "pop rax"); // address
    asm.inst(&[0x48, 0x89, 0x08], "mov qword ptr [rax], rcx");
}

/// Direct call to a function lowered into the same module
pub fn generate_call_internal(asm: &mut Assembler, function: &str) {
    let at = asm.pos() + 1;
    asm.inst(&[0xe8, 0, 0, 0, 0], format!("call {}", function));
    asm.fixup_call(at, at + 4, PatchKind::Rel32, function);
}

/// Call through r11 to a symbol resolved at link or JIT finalization time
pub fn generate_call_external(asm: &mut Assembler, function: &str) {
    asm.relocate(asm.pos() + 2, function);
    asm.inst(&[0x49, 0xbb, 0, 0, 0, 0, 0, 0, 0, 0], format!("movabs r11, offset {}", function));
    asm.inst(&[0x41, 0xff, 0xd3], "call r11");
}

pub fn generate_pop_callee(asm: &mut Assembler) {
    asm.inst(&[0x41, 0x5b], "pop r11");
}

pub fn generate_call_register(asm: &mut Assembler) {
    asm.inst(&[0x41, 0xff, 0xd3], "call r11");
}

/// Keep rsp 16-byte aligned across a call when the evaluation stack holds an odd
/// number of values.
pub fn generate_align_for_call(asm: &mut Assembler) {
    asm.inst(&[0x48, 0x83, 0xec, 0x08], "sub rsp, 8");
}

pub fn generate_unalign_after_call(asm: &mut Assembler) {
    asm.inst(&[0x48, 0x83, 0xc4, 0x08], "add rsp, 8");
}

pub fn generate_push_result(asm: &mut Assembler) {
    asm.inst(&[0x50], "push rax");
}

pub fn generate_pop_result(asm: &mut Assembler) {
    asm.inst(&[0x58], "pop rax");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(f: impl FnOnce(&mut Assembler)) -> Vec<u8> {
        let mut asm = Assembler::new();
        f(&mut asm);
        asm.finish().code
    }

    #[test]
    fn push_picks_shortest_encoding() {
        assert_eq!(bytes(|a| generate_push(a, 42)), vec![0x6a, 0x2a]);
        assert_eq!(bytes(|a| generate_push(a, -1)), vec![0x6a, 0xff]);
        assert_eq!(bytes(|a| generate_push(a, 1000)), vec![0x68, 0xe8, 0x03, 0x00, 0x00]);
        assert_eq!(bytes(|a| generate_push(a, 1 << 40)).len(), 11);
    }

    #[test]
    fn compare_sets_flag_byte() {
        assert_eq!(
            bytes(|a| generate_compare(a, 0x9c, "l")),
            vec![
                0x59, // pop rcx
                0x58, // pop rax
                0x48, 0x39, 0xc8, // cmp rax, rcx
                0x0f, 0x9c, 0xc0, // setl al
                0x0f, 0xb6, 0xc0, // movzx eax, al
                0x50, // push rax
            ]
        );
    }

    #[test]
    fn large_slot_offsets_use_disp32() {
        assert_eq!(bytes(|a| generate_load_slot(a, 20)), vec![0xff, 0xb5, 0x58, 0xff, 0xff, 0xff]);
        assert_eq!(bytes(|a| generate_store_slot(a, 0)), vec![0x58, 0x48, 0x89, 0x45, 0xf8]);
    }

    #[test]
    fn addresses_are_relocated() {
        let mut asm = Assembler::new();
        generate_push(&mut asm, 0);
        generate_push_address(&mut asm, "table");
        let lowered = asm.finish();
        assert_eq!(lowered.relocations[0].offset, 4);
        assert_eq!(lowered.relocations[0].symbol, "table");
    }
}
