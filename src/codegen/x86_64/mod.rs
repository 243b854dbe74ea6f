/// x86-64 code generation backend
///
/// Lowers the stack machine onto the hardware stack following the System V ABI.
///
/// Submodules:
/// - `abi`: calling convention and stack frames
/// - `instructions`: individual x86-64 instruction generation
mod abi;
mod instructions;

use super::assembler::Assembler;
use super::backend::TargetBackend;
use crate::ir::{IRFunction, IRInstruction, IRModule};
use crate::target::Arch;

pub struct X86_64Backend;

impl TargetBackend for X86_64Backend {
    fn arch(&self) -> Arch {
        Arch::X86_64
    }

    fn lower_function(&self, asm: &mut Assembler, module: &IRModule, function: &IRFunction, depths: &[Option<usize>]) {
        abi::generate_prologue(asm, function);

        for (inst, depth) in function.instructions().iter().zip(depths) {
            // unreachable code still gets labels so jumps resolve
            if depth.is_none() && !matches!(inst, IRInstruction::Label(_)) {
                continue;
            }
            let depth = depth.unwrap_or(0);
            generate_instruction(asm, module, function, inst, depth);
        }
    }
}

fn generate_instruction(asm: &mut Assembler, module: &IRModule, function: &IRFunction, inst: &IRInstruction, depth: usize) {
    use IRInstruction::*;
    match inst {
        Push(value) => instructions::generate_push(asm, *value),
        Drop => instructions::generate_drop(asm),
        Dup => instructions::generate_dup(asm),
        Add => instructions::generate_arith(asm, &[0x48, 0x01, 0xc8], "add rax, rcx"),
        Sub => instructions::generate_arith(asm, &[0x48, 0x29, 0xc8], "sub rax, rcx"),
        Mul => instructions::generate_arith(asm, &[0x48, 0x0f, 0xaf, 0xc1], "imul rax, rcx"),
        Div => instructions::generate_divmod(asm, false),
        Rem => instructions::generate_divmod(asm, true),
        Equal => instructions::generate_compare(asm, 0x94, "e"),
        NotEqual => instructions::generate_compare(asm, 0x95, "ne"),
        Less => instructions::generate_compare(asm, 0x9c, "l"),
        Greater => instructions::generate_compare(asm, 0x9f, "g"),
        LessEqual => instructions::generate_compare(asm, 0x9e, "le"),
        GreaterEqual => instructions::generate_compare(asm, 0x9d, "ge"),
        Not => instructions::generate_not(asm),
        Label(label) => asm.bind_label(*label),
        Jump(label) => instructions::generate_jump(asm, *label),
        JumpIfZero(label) => instructions::generate_jump_if_zero(asm, *label),
        LoadParam(index) => instructions::generate_load_slot(asm, *index),
        LoadLocal(index) => instructions::generate_load_slot(asm, function.param_count + index),
        StoreLocal(index) => instructions::generate_store_slot(asm, function.param_count + index),
        GlobalAddress(name) => instructions::generate_push_address(asm, name),
        Load => instructions::generate_load(asm),
        Store => instructions::generate_store(asm),
        Call(name, arg_count) => {
            let remaining = depth - arg_count;
            abi::generate_call_setup(asm, *arg_count);
            with_aligned_stack(asm, remaining, |asm| {
                if module.get_definition(name).is_some() {
                    instructions::generate_call_internal(asm, name);
                } else {
                    instructions::generate_call_external(asm, name);
                }
            });
            instructions::generate_push_result(asm);
        }
        CallIndirect(arg_count) => {
            let remaining = depth - arg_count - 1;
            instructions::generate_pop_callee(asm);
            abi::generate_call_setup(asm, *arg_count);
            with_aligned_stack(asm, remaining, instructions::generate_call_register);
            instructions::generate_push_result(asm);
        }
        Return => {
            instructions::generate_pop_result(asm);
            abi::generate_epilogue(asm);
        }
    }
}

fn with_aligned_stack(asm: &mut Assembler, remaining: usize, call: impl FnOnce(&mut Assembler)) {
    let misaligned = remaining % 2 == 1;
    if misaligned {
        instructions::generate_align_for_call(asm);
    }
    call(asm);
    if misaligned {
        instructions::generate_unalign_after_call(asm);
    }
}

#[cfg(test)]
mod tests {
    use crate::codegen::lower_module;
    use crate::ir::{IRFunction, IRInstruction::*, IRModule};
    use crate::target::TargetMachine;

    fn lower(module: &IRModule) -> crate::codegen::LoweredModule {
        let machine = TargetMachine::new("native -mtriple=x86_64-unknown-linux-gnu".parse().unwrap());
        lower_module(module, &machine).unwrap()
    }

    #[test]
    fn add_one_matches_expected_bytes() {
        let mut module = IRModule::new("m");
        module.add_function(IRFunction::new("add_one", 1).with_body(vec![LoadParam(0), Push(1), Add, Return]));
        let lowered = lower(&module);
        assert_eq!(
            lowered.code,
            vec![
                0x55, // push rbp
                0x48, 0x89, 0xe5, // mov rbp, rsp
                0x48, 0x83, 0xec, 0x10, // sub rsp, 16
                0x48, 0x89, 0x7d, 0xf8, // mov [rbp-8], rdi
                0xff, 0x75, 0xf8, // push [rbp-8]
                0x6a, 0x01, // push 1
                0x59, 0x58, // pop rcx; pop rax
                0x48, 0x01, 0xc8, // add rax, rcx
                0x50, // push rax
                0x58, // pop rax
                0x48, 0x89, 0xec, // mov rsp, rbp
                0x5d, // pop rbp
                0xc3, // ret
            ]
        );
    }

    #[test]
    fn calls_with_odd_stack_depth_realign() {
        let mut module = IRModule::new("m");
        module.add_function(IRFunction::declare("ext", 1));
        module.add_function(IRFunction::new("f", 0).with_body(vec![Push(1), Push(2), Call("ext".into(), 1), Add, Return]));
        let listing = lower(&module).listing.join("\n");
        assert!(listing.contains("sub rsp, 8\n\tmovabs r11, offset ext\n\tcall r11\n\tadd rsp, 8"));
    }

    #[test]
    fn unreachable_code_is_skipped() {
        let mut module = IRModule::new("m");
        module.add_function(IRFunction::new("f", 0).with_body(vec![Push(0), Return, Push(5), Drop, Label(0), Push(1), Return]));
        let lowered = lower(&module);
        assert!(!lowered.listing.iter().any(|line| line.contains("push 5")));
        assert!(lowered.listing.iter().any(|line| line == ".Lf_0:"));
    }
}
