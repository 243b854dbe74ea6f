/// Intermediate representation of a compiled code unit
///
/// - `instruction`: the stack-machine instruction set
/// - `module`: functions, globals, flags, metadata and static initializers
/// - `builder`: convenience API for producing modules
/// - `verifier`: structural checks run before a module is handed to a backend
/// - `printer` / `parser`: canonical textual form
/// - `bitcode`: compact binary form
pub mod bitcode;
pub mod builder;
mod instruction;
mod module;
pub mod parser;
pub mod printer;
pub mod verifier;

pub use bitcode::{decode_bitcode, encode_bitcode, BitcodeError, BITCODE_MAGIC};
pub use builder::{FunctionBuilder, ModuleBuilder};
pub use instruction::IRInstruction;
pub use module::{
    FlagBehavior, GlobalInit, IRFunction, IRGlobal, IRModule, Linkage, ModuleFlag, StaticInitializer, MAX_FRAME_SLOTS,
    MAX_GLOBAL_ALIGN, MAX_PARAMS, MAX_SECTION_BYTES,
};
pub use parser::{parse_module, ParseError};
pub use printer::print_module;
pub use verifier::{VerifyError, VerifyResult, Verifier};
