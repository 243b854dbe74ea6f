/// Canonical textual form of an IR module
///
/// Printing never reorders anything: two equal modules print to identical bytes.
use super::{GlobalInit, IRFunction, IRGlobal, IRInstruction, IRModule, StaticInitializer};
use std::fmt::Write;

pub fn print_module(module: &IRModule) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "; ModuleID = '{}'", module.name);
    let _ = writeln!(out, "source_filename = {}", quote(module.name.as_bytes()));
    if !module.target_triple.is_empty() {
        let _ = writeln!(out, "target triple = {}", quote(module.target_triple.as_bytes()));
    }
    if !module.data_layout.is_empty() {
        let _ = writeln!(out, "target datalayout = {}", quote(module.data_layout.as_bytes()));
    }

    if !module.metadata.is_empty() || !module.flags.is_empty() {
        out.push('\n');
        for (key, value) in &module.metadata {
            let _ = writeln!(out, "!meta {} = {}", quote(key.as_bytes()), quote(value.as_bytes()));
        }
        for flag in &module.flags {
            let _ = writeln!(out, "!flag {} {} = {}", flag.behavior.as_str(), quote(flag.key.as_bytes()), flag.value);
        }
    }

    if !module.globals.is_empty() {
        out.push('\n');
        for global in &module.globals {
            print_global(&mut out, global);
        }
    }

    for function in &module.functions {
        out.push('\n');
        print_function(&mut out, function);
    }

    if !module.ctors.is_empty() || !module.dtors.is_empty() {
        out.push('\n');
        print_initializers(&mut out, "ctor", &module.ctors);
        print_initializers(&mut out, "dtor", &module.dtors);
    }

    out
}

fn print_global(out: &mut String, global: &IRGlobal) {
    let kind = if global.constant { "constant" } else { "global" };
    let init = match &global.init {
        GlobalInit::Zero(size) => format!("zero {}", size),
        GlobalInit::Word(value) => format!("word {}", value),
        GlobalInit::Bytes(bytes) => format!("bytes {}", quote(bytes)),
        GlobalInit::Pointers(targets) => {
            let targets: Vec<String> = targets.iter().map(|t| format!("@{}", t)).collect();
            format!("ptrs [{}]", targets.join(", "))
        }
    };
    let _ = writeln!(out, "@{} = {} {} {}, align {}", global.name, global.linkage.as_str(), kind, init, global.align);
}

fn print_function(out: &mut String, function: &IRFunction) {
    let linkage = function.linkage.as_str();
    match &function.body {
        None => {
            let _ = writeln!(out, "declare {} @{}({})", linkage, function.name, function.param_count);
        }
        Some(body) => {
            let _ = writeln!(
                out,
                "define {} @{}({}) locals {} {{",
                linkage, function.name, function.param_count, function.local_count
            );
            for inst in body {
                match inst {
                    IRInstruction::Label(_) => {
                        let _ = writeln!(out, "{}", inst);
                    }
                    _ => {
                        let _ = writeln!(out, "  {}", inst);
                    }
                }
            }
            out.push_str("}\n");
        }
    }
}

fn print_initializers(out: &mut String, keyword: &str, entries: &[StaticInitializer]) {
    for entry in entries {
        let _ = writeln!(out, "{} {} @{}", keyword, entry.priority, entry.function);
    }
}

/// Quote bytes as a string literal; non-printable bytes, `"` and `\` become `\XX`.
pub fn quote(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + 2);
    out.push('"');
    for &byte in bytes {
        if byte.is_ascii_graphic() && byte != b'"' && byte != b'\\' || byte == b' ' {
            out.push(byte as char);
        } else {
            let _ = write!(out, "\\{:02X}", byte);
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FlagBehavior, IRInstruction::*};

    fn sample() -> IRModule {
        let mut module = IRModule::new("sample");
        module.target_triple = "x86_64-unknown-linux-gnu".into();
        module.set_metadata("nativemod.target", "native -mcpu=x86-64");
        module.add_flag(FlagBehavior::Override, "Debug Info Version", 3);
        module.add_global(IRGlobal::constant_bytes("__module_main", b"add_one\0".to_vec()));
        module.add_function(IRFunction::declare("__rt_alloc", 1));
        module.add_function(IRFunction::new("add_one", 1).with_body(vec![
            LoadParam(0),
            Push(1),
            Add,
            JumpIfZero(0),
            Push(1),
            Return,
            Label(0),
            Push(0),
            Return,
        ]));
        module.add_ctor(65535, "add_one");
        module
    }

    #[test]
    fn prints_canonical_text() {
        let text = print_module(&sample());
        let expected = r#"; ModuleID = 'sample'
source_filename = "sample"
target triple = "x86_64-unknown-linux-gnu"

!meta "nativemod.target" = "native -mcpu=x86-64"
!flag override "Debug Info Version" = 3

@__module_main = internal constant bytes "add_one\00", align 1

declare external @__rt_alloc(1)

define external @add_one(1) locals 0 {
  param 0
  push 1
  add
  jz L0
  push 1
  ret
L0:
  push 0
  ret
}

ctor 65535 @add_one
"#;
        assert_eq!(text, expected);
    }

    #[test]
    fn printing_is_deterministic() {
        let module = sample();
        assert_eq!(print_module(&module), print_module(&module.clone()));
    }

    #[test]
    fn quotes_escape_specials() {
        assert_eq!(quote(b"a \"b\"\\\n"), r#""a \22b\22\5C\0A""#);
    }
}
