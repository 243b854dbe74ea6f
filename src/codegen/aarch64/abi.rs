/// AAPCS64 frame layout
///
/// x29 is the frame pointer; parameters and locals live in 8-byte slots below it. The
/// evaluation stack grows below the frame in 16-byte slots so sp stays aligned.
use crate::codegen::assembler::Assembler;
use crate::ir::IRFunction;

/// Byte offset below x29 of frame slot `slot`.
pub fn slot_offset(slot: usize) -> usize {
    8 * (slot + 1)
}

pub fn frame_size(function: &IRFunction) -> usize {
    (8 * (function.param_count + function.local_count)).next_multiple_of(16)
}

/// sub x9, x29, #offset
pub fn generate_slot_address(asm: &mut Assembler, slot: usize) {
    let offset = slot_offset(slot) as u32;
    asm.word(0xD10003A9 | (offset << 10), format!("sub x9, x29, #{}", offset));
}

pub fn generate_prologue(asm: &mut Assembler, function: &IRFunction) {
    asm.word(0xA9BF7BFD, "stp x29, x30, [sp, #-16]!");
    asm.word(0x910003FD, "mov x29, sp");

    let stack_size = frame_size(function) as u32;
    if stack_size > 0 {
        asm.word(0xD10003FF | (stack_size << 10), format!("sub sp, sp, #{}", stack_size));
    }

    for i in 0..function.param_count {
        generate_slot_address(asm, i);
        asm.word(0xF9000120 | i as u32, format!("str x{}, [x9]", i));
    }
}

pub fn generate_epilogue(asm: &mut Assembler) {
    asm.word(0x910003BF, "mov sp, x29");
    asm.word(0xA8C17BFD, "ldp x29, x30, [sp], #16");
    asm.word(0xD65F03C0, "ret");
}

/// Pop arguments into x0..x(n-1); the last argument is on top.
pub fn generate_call_setup(asm: &mut Assembler, arg_count: usize) {
    for register in (0..arg_count.min(8) as u32).rev() {
        asm.word(0xF84107E0 | register, format!("ldr x{}, [sp], #16", register));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prologue_spills_parameters() {
        let mut asm = Assembler::new();
        generate_prologue(&mut asm, &IRFunction::new("f", 1));
        let words: Vec<u32> = asm
            .finish()
            .code
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(words, vec![0xA9BF7BFD, 0x910003FD, 0xD10043FF, 0xD10023A9, 0xF9000120]);
    }
}
