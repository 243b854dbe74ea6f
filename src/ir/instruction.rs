use std::fmt;

/// Stack-machine instruction over 64-bit integers.
///
/// Every value lives on an evaluation stack; operands are popped in reverse order, so
/// `push 7, push 2, sub` leaves `5`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IRInstruction {
    // Stack operations
    Push(i64), // Push immediate value
    Drop,      // Discard top of stack
    Dup,       // Duplicate top of stack

    // Arithmetic operations
    Add, // Pop two values, push sum
    Sub, // Pop two values, push difference (second - first)
    Mul, // Pop two values, push product
    Div, // Pop two values, push quotient (second / first)
    Rem, // Pop two values, push remainder (second % first)

    // Comparison operations
    Equal,        // Pop two values, push 1 if equal, 0 otherwise
    NotEqual,     // Pop two values, push 1 if different, 0 otherwise
    Less,         // Pop two values, push 1 if second < first, 0 otherwise
    Greater,      // Pop two values, push 1 if second > first, 0 otherwise
    LessEqual,    // Pop two values, push 1 if second <= first, 0 otherwise
    GreaterEqual, // Pop two values, push 1 if second >= first, 0 otherwise

    // Logical operations
    Not, // Pop one value, push logical NOT

    // Control flow
    Label(u32),      // Jump target marker
    Jump(u32),       // Unconditional jump to label
    JumpIfZero(u32), // Pop value, jump to label if it is 0

    // Variable operations
    LoadParam(usize),  // Push parameter value
    LoadLocal(usize),  // Push value from local variable slot
    StoreLocal(usize), // Pop value and store in local variable slot

    // Memory operations
    GlobalAddress(String), // Push address of a global variable
    Load,                  // Pop address, push the 64-bit word stored there
    Store,                 // Pop value then address, store value at address

    // Function operations
    Call(String, usize), // (function_name, arg_count)
    CallIndirect(usize), // Pop function address, then arg_count arguments

    // Program flow
    Return, // Return top of stack
}

impl IRInstruction {
    /// Number of values popped and pushed.
    pub fn stack_effect(&self) -> (usize, usize) {
        use IRInstruction::*;
        match self {
            Push(_) | LoadParam(_) | LoadLocal(_) | GlobalAddress(_) => (0, 1),
            Drop | StoreLocal(_) | JumpIfZero(_) | Return => (1, 0),
            Dup => (1, 2),
            Add | Sub | Mul | Div | Rem => (2, 1),
            Equal | NotEqual | Less | Greater | LessEqual | GreaterEqual => (2, 1),
            Not | Load => (1, 1),
            Store => (2, 0),
            Label(_) | Jump(_) => (0, 0),
            Call(_, arg_count) => (*arg_count, 1),
            CallIndirect(arg_count) => (*arg_count + 1, 1),
        }
    }

    /// Whether control never falls through to the next instruction.
    pub fn is_terminator(&self) -> bool {
        matches!(self, IRInstruction::Jump(_) | IRInstruction::Return)
    }

    pub fn mnemonic(&self) -> &'static str {
        use IRInstruction::*;
        match self {
            Push(_) => "push",
            Drop => "drop",
            Dup => "dup",
            Add => "add",
            Sub => "sub",
            Mul => "mul",
            Div => "div",
            Rem => "rem",
            Equal => "eq",
            NotEqual => "ne",
            Less => "lt",
            Greater => "gt",
            LessEqual => "le",
            GreaterEqual => "ge",
            Not => "not",
            Label(_) => "label",
            Jump(_) => "jmp",
            JumpIfZero(_) => "jz",
            LoadParam(_) => "param",
            LoadLocal(_) => "local.get",
            StoreLocal(_) => "local.set",
            GlobalAddress(_) => "global.addr",
            Load => "load",
            Store => "store",
            Call(_, _) => "call",
            CallIndirect(_) => "call.indirect",
            Return => "ret",
        }
    }
}

impl fmt::Display for IRInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use IRInstruction::*;
        match self {
            Push(value) => write!(f, "push {}", value),
            Label(label) => write!(f, "L{}:", label),
            Jump(label) | JumpIfZero(label) => write!(f, "{} L{}", self.mnemonic(), label),
            LoadParam(slot) | LoadLocal(slot) | StoreLocal(slot) => write!(f, "{} {}", self.mnemonic(), slot),
            GlobalAddress(name) => write!(f, "global.addr @{}", name),
            Call(name, arg_count) => write!(f, "call @{} {}", name, arg_count),
            CallIndirect(arg_count) => write!(f, "call.indirect {}", arg_count),
            _ => f.write_str(self.mnemonic()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_effects_of_calls_include_arguments() {
        assert_eq!(IRInstruction::Call("f".into(), 3).stack_effect(), (3, 1));
        assert_eq!(IRInstruction::CallIndirect(2).stack_effect(), (3, 1));
    }

    #[test]
    fn display_uses_textual_ir_syntax() {
        assert_eq!(IRInstruction::Push(-3).to_string(), "push -3");
        assert_eq!(IRInstruction::JumpIfZero(4).to_string(), "jz L4");
        assert_eq!(IRInstruction::GlobalAddress("g".into()).to_string(), "global.addr @g");
        assert_eq!(IRInstruction::Call("add_one".into(), 1).to_string(), "call @add_one 1");
        assert_eq!(IRInstruction::LessEqual.to_string(), "le");
    }
}
