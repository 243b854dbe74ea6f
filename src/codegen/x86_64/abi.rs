/// System V ABI implementation for x86-64
/// Handles calling convention, stack frame management, and register usage
use crate::codegen::assembler::Assembler;
use crate::ir::IRFunction;

/// Byte offset below rbp of frame slot `slot` (parameters first, then locals).
pub fn slot_offset(slot: usize) -> usize {
    8 * (slot + 1)
}

/// Frame size rounded to keep rsp 16-byte aligned after the prologue.
pub fn frame_size(function: &IRFunction) -> usize {
    (8 * (function.param_count + function.local_count)).next_multiple_of(16)
}

/// Generate function prologue following System V ABI
/// - Save old base pointer
/// - Set up new stack frame
/// - Save parameter registers to their frame slots
pub fn generate_prologue(asm: &mut Assembler, function: &IRFunction) {
    asm.inst(&[0x55], "push rbp");
    asm.inst(&[0x48, 0x89, 0xe5], "mov rbp, rsp");

    let stack_size = frame_size(function);
    if stack_size > 0 {
        if stack_size <= 127 {
            asm.inst(&[0x48, 0x83, 0xec, stack_size as u8], format!("sub rsp, {}", stack_size));
        } else {
            let mut code = vec![0x48, 0x81, 0xec];
            code.extend_from_slice(&(stack_size as u32).to_le_bytes());
            asm.inst(&code, format!("sub rsp, {}", stack_size));
        }
    }

    // (REX, disp8 modrm, disp32 modrm, register)
    let param_regs: [(u8, u8, u8, &str); 6] = [
        (0x48, 0x7d, 0xbd, "rdi"),
        (0x48, 0x75, 0xb5, "rsi"),
        (0x48, 0x55, 0x95, "rdx"),
        (0x48, 0x4d, 0x8d, "rcx"),
        (0x4c, 0x45, 0x85, "r8"),
        (0x4c, 0x4d, 0x8d, "r9"),
    ];

    for (i, &(rex, modrm8, modrm32, reg)) in param_regs.iter().enumerate().take(function.param_count) {
        let offset = slot_offset(i);
        let text = format!("mov qword ptr [rbp - {}], {}", offset, reg);
        if offset <= 127 {
            asm.inst(&[rex, 0x89, modrm8, (-(offset as i8)) as u8], text);
        } else {
            let mut code = vec![rex, 0x89, modrm32];
            code.extend_from_slice(&(-(offset as i32)).to_le_bytes());
            asm.inst(&code, text);
        }
    }
}

/// Generate function epilogue following System V ABI
/// - Restore stack pointer
/// - Restore old base pointer
/// - Return to caller
pub fn generate_epilogue(asm: &mut Assembler) {
    asm.inst(&[0x48, 0x89, 0xec], "mov rsp, rbp");
    asm.inst(&[0x5d], "pop rbp");
    asm.inst(&[0xc3], "ret");
}

/// Pop `arg_count` evaluation-stack values into argument registers.
/// Stack has args in order: arg0, arg1, ...; the last argument is on top.
pub fn generate_call_setup(asm: &mut Assembler, arg_count: usize) {
    let arg_regs: [(&[u8], &str); 6] = [
        (&[0x5f], "pop rdi"),
        (&[0x5e], "pop rsi"),
        (&[0x5a], "pop rdx"),
        (&[0x59], "pop rcx"),
        (&[0x41, 0x58], "pop r8"),
        (&[0x41, 0x59], "pop r9"),
    ];

    for &(code, text) in arg_regs[..arg_count.min(6)].iter().rev() {
        asm.inst(code, text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prologue_saves_parameters() {
        let mut asm = Assembler::new();
        let function = IRFunction::new("f", 2).with_locals(1);
        generate_prologue(&mut asm, &function);
        let code = asm.finish().code;
        assert_eq!(
            code,
            vec![
                0x55, // push rbp
                0x48, 0x89, 0xe5, // mov rbp, rsp
                0x48, 0x83, 0xec, 0x20, // sub rsp, 32
                0x48, 0x89, 0x7d, 0xf8, // mov [rbp-8], rdi
                0x48, 0x89, 0x75, 0xf0, // mov [rbp-16], rsi
            ]
        );
    }

    #[test]
    fn empty_frame_skips_stack_adjustment() {
        let mut asm = Assembler::new();
        generate_prologue(&mut asm, &IRFunction::new("f", 0));
        assert_eq!(asm.finish().code, vec![0x55, 0x48, 0x89, 0xe5]);
    }

    #[test]
    fn call_setup_pops_last_argument_first() {
        let mut asm = Assembler::new();
        generate_call_setup(&mut asm, 3);
        assert_eq!(asm.finish().code, vec![0x5a, 0x5e, 0x5f]);
    }
}
