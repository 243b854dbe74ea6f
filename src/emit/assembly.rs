use crate::codegen::{DataImage, DataSection, LoweredModule};
use crate::ir::{IRModule, Linkage, StaticInitializer};
use crate::target::TargetMachine;
use std::collections::HashMap;
use std::fmt::Write;

/// Render the assembly listing recorded during lowering, followed by data and
/// static initializer tables.
pub fn render_assembly(module: &IRModule, machine: &TargetMachine, lowered: &LoweredModule, data: &DataImage) -> String {
    let darwin = machine.target().is_darwin();
    let mut out = String::new();
    let _ = writeln!(out, "\t.file\t\"{}\"", module.name);
    for line in &lowered.listing {
        out.push_str(line);
        out.push('\n');
    }

    let rodata_directive = if darwin { "\t.section\t__TEXT,__const" } else { "\t.section\t.rodata" };
    render_data(&mut out, "\t.data", &data.data);
    render_data(&mut out, rodata_directive, &data.rodata);

    let (init, fini) = if darwin {
        ("\t.section\t__DATA,__mod_init_func,mod_init_funcs", "\t.section\t__DATA,__mod_term_func,mod_term_funcs")
    } else {
        ("\t.section\t.init_array,\"aw\"", "\t.section\t.fini_array,\"aw\"")
    };
    render_initializers(&mut out, init, &module.ctors);
    render_initializers(&mut out, fini, &module.dtors);
    out
}

fn render_data(out: &mut String, directive: &str, section: &DataSection) {
    if section.symbols.is_empty() {
        return;
    }
    let _ = writeln!(out, "{}", directive);
    let _ = writeln!(out, "\t.p2align\t{}", section.align.max(1).trailing_zeros());

    let relocations: HashMap<usize, &str> = section.relocations.iter().map(|r| (r.offset, r.symbol.as_str())).collect();
    let mut cursor = 0;
    for symbol in &section.symbols {
        if symbol.offset > cursor {
            let _ = writeln!(out, "\t.zero\t{}", symbol.offset - cursor);
        }
        if symbol.linkage == Linkage::External {
            let _ = writeln!(out, "\t.globl\t{}", symbol.name);
        }
        let _ = writeln!(out, "{}:", symbol.name);

        let end = symbol.offset + symbol.size;
        let mut pos = symbol.offset;
        let mut pending: Vec<String> = Vec::new();
        while pos < end {
            if let Some(target) = relocations.get(&pos) {
                flush_bytes(out, &mut pending);
                let _ = writeln!(out, "\t.quad\t{}", target);
                pos += 8;
            } else {
                pending.push(section.bytes[pos].to_string());
                if pending.len() == 16 {
                    flush_bytes(out, &mut pending);
                }
                pos += 1;
            }
        }
        flush_bytes(out, &mut pending);
        cursor = end;
    }
}

fn flush_bytes(out: &mut String, pending: &mut Vec<String>) {
    if !pending.is_empty() {
        let _ = writeln!(out, "\t.byte\t{}", pending.join(", "));
        pending.clear();
    }
}

fn render_initializers(out: &mut String, directive: &str, entries: &[StaticInitializer]) {
    if entries.is_empty() {
        return;
    }
    let mut sorted: Vec<&StaticInitializer> = entries.iter().collect();
    sorted.sort_by_key(|entry| entry.priority);
    let _ = writeln!(out, "{}", directive);
    let _ = writeln!(out, "\t.p2align\t3");
    for entry in sorted {
        let _ = writeln!(out, "\t.quad\t{}", entry.function);
    }
}

#[cfg(test)]
mod tests {
    use crate::emit::get_source;
    use crate::ir::{GlobalInit, IRFunction, IRGlobal, IRInstruction::*, IRModule};
    use crate::target::TargetMachine;

    #[test]
    fn listing_contains_code_data_and_ctors() {
        let mut module = IRModule::new("asm");
        module.add_global(IRGlobal::constant_bytes("msg", b"ok\0".to_vec()));
        module.add_global(IRGlobal::new("ptr", GlobalInit::Pointers(vec!["msg".into()])));
        module.add_function(IRFunction::new("start", 0).with_body(vec![GlobalAddress("ptr".into()), Load, Return]));
        module.add_ctor(1, "start");
        TargetMachine::new("native -mtriple=x86_64-unknown-linux-gnu".parse().unwrap()).stamp(&mut module);

        let text = get_source(&module, "s").unwrap();
        assert!(text.starts_with("\t.file\t\"asm\"\n\t.intel_syntax noprefix\n"));
        assert!(text.contains("\t.globl start\nstart:\n\tpush rbp\n"));
        assert!(text.contains("movabs rax, offset ptr"));
        assert!(text.contains("msg:\n\t.byte\t111, 107, 0\n"));
        assert!(text.contains("ptr:\n\t.quad\tmsg\n"));
        assert!(text.contains(".init_array,\"aw\"\n\t.p2align\t3\n\t.quad\tstart\n"));
    }
}
