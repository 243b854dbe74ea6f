/// AArch64 code generation backend (AAPCS64)
///
/// Submodules:
/// - `abi`: frame layout and argument passing
/// - `instructions`: instruction word generation
mod abi;
mod instructions;

use super::assembler::Assembler;
use super::backend::TargetBackend;
use crate::ir::{IRFunction, IRInstruction, IRModule};
use crate::target::Arch;

pub struct Aarch64Backend;

impl TargetBackend for Aarch64Backend {
    fn arch(&self) -> Arch {
        Arch::Aarch64
    }

    fn lower_function(&self, asm: &mut Assembler, module: &IRModule, function: &IRFunction, depths: &[Option<usize>]) {
        abi::generate_prologue(asm, function);

        for (inst, depth) in function.instructions().iter().zip(depths) {
            if depth.is_none() && !matches!(inst, IRInstruction::Label(_)) {
                continue;
            }
            generate_instruction(asm, module, function, inst);
        }
    }
}

fn generate_instruction(asm: &mut Assembler, module: &IRModule, function: &IRFunction, inst: &IRInstruction) {
    use IRInstruction::*;
    match inst {
        Push(value) => instructions::generate_push(asm, *value),
        Drop => instructions::generate_drop(asm),
        Dup => instructions::generate_dup(asm),
        Add => instructions::generate_binary(asm, 0x8B010000, "add x0, x0, x1"),
        Sub => instructions::generate_binary(asm, 0xCB010000, "sub x0, x0, x1"),
        Mul => instructions::generate_binary(asm, 0x9B017C00, "mul x0, x0, x1"),
        Div => instructions::generate_binary(asm, 0x9AC10C00, "sdiv x0, x0, x1"),
        Rem => instructions::generate_rem(asm),
        Equal => instructions::generate_compare(asm, 0x9A9F17E0, "eq"),
        NotEqual => instructions::generate_compare(asm, 0x9A9F07E0, "ne"),
        Less => instructions::generate_compare(asm, 0x9A9FA7E0, "lt"),
        Greater => instructions::generate_compare(asm, 0x9A9FD7E0, "gt"),
        LessEqual => instructions::generate_compare(asm, 0x9A9FC7E0, "le"),
        GreaterEqual => instructions::generate_compare(asm, 0x9A9FB7E0, "ge"),
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
            abi::generate_call_setup(asm, *arg_count);
            if module.get_definition(name).is_some() {
                instructions::generate_call_internal(asm, name);
            } else {
                instructions::generate_literal_address(asm, name);
                instructions::generate_call_x16(asm);
            }
            instructions::generate_push_x0(asm);
        }
        CallIndirect(arg_count) => {
            instructions::generate_pop(asm, 16);
            abi::generate_call_setup(asm, *arg_count);
            instructions::generate_call_x16(asm);
            instructions::generate_push_x0(asm);
        }
        Return => {
            instructions::generate_pop(asm, 0);
            abi::generate_epilogue(asm);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::codegen::lower_module;
    use crate::ir::{IRFunction, IRInstruction::*, IRModule};
    use crate::target::TargetMachine;

    #[test]
    fn lowers_loops_with_backward_branches() {
        let mut module = IRModule::new("m");
        module.add_function(IRFunction::new("spin", 1).with_locals(1).with_body(vec![
            LoadParam(0),
            StoreLocal(0),
            Label(0),
            LoadLocal(0),
            JumpIfZero(1),
            LoadLocal(0),
            Push(1),
            Sub,
            StoreLocal(0),
            Jump(0),
            Label(1),
            Push(0),
            Return,
        ]));
        let machine = TargetMachine::new("native -mtriple=aarch64-unknown-linux-gnu".parse().unwrap());
        let lowered = lower_module(&module, &machine).unwrap();
        assert_eq!(lowered.code.len() % 4, 0);

        let words: Vec<u32> =
            lowered.code.chunks(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect();
        let branch = words.iter().position(|w| w & 0xFC00_0000 == 0x1400_0000).unwrap();
        // backward branch: negative imm26
        assert_ne!(words[branch] & 0x0200_0000, 0);
        assert!(lowered.listing.iter().any(|line| line.contains("cbz x0, .Lspin_1")));
    }
}
