/// Relocatable object files through the `object` write API
///
/// ELF for every target except Darwin, which gets Mach-O. Static constructors and
/// destructors become `.init_array`/`.fini_array` (or `__mod_init_func`/`__mod_term_func`)
/// entries sorted by ascending priority.
use crate::codegen::{DataImage, LoweredModule, Relocation};
use crate::error::Result;
use crate::ir::{IRModule, Linkage, StaticInitializer};
use crate::target::{Arch, TargetMachine};
use object::write::{Object, Relocation as ObjectRelocation, SectionId, StandardSection, Symbol, SymbolId, SymbolSection};
use object::{
    elf, macho, Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind,
    SectionFlags, SectionKind, SymbolFlags, SymbolKind, SymbolScope,
};
use std::collections::HashMap;

fn scope(linkage: Linkage) -> SymbolScope {
    match linkage {
        Linkage::External => SymbolScope::Linkage,
        Linkage::Internal => SymbolScope::Compilation,
    }
}

fn abs64() -> RelocationFlags {
    RelocationFlags::Generic {
        kind: RelocationKind::Absolute,
        encoding: RelocationEncoding::Generic,
        size: 64,
    }
}

pub fn write_object(
    module: &IRModule,
    machine: &TargetMachine,
    lowered: &LoweredModule,
    data: &DataImage,
) -> Result<Vec<u8>> {
    let darwin = machine.target().is_darwin();
    let format = if darwin { BinaryFormat::MachO } else { BinaryFormat::Elf };
    let architecture = match machine.arch() {
        Arch::X86_64 => Architecture::X86_64,
        Arch::Aarch64 => Architecture::Aarch64,
        Arch::Riscv64 => Architecture::Riscv64,
    };

    let mut obj = Object::new(format, architecture, Endianness::Little);
    obj.add_file_symbol(module.name.as_bytes().to_vec());

    let text_section = obj.section_id(StandardSection::Text);
    let text_base = obj.append_section_data(text_section, &lowered.code, 16);

    let mut symbol_map: HashMap<String, SymbolId> = HashMap::new();

    for function in &lowered.functions {
        let id = obj.add_symbol(Symbol {
            name: function.name.as_bytes().to_vec(),
            value: text_base + function.offset as u64,
            size: function.size as u64,
            kind: SymbolKind::Text,
            scope: scope(function.linkage),
            weak: false,
            section: SymbolSection::Section(text_section),
            flags: SymbolFlags::None,
        });
        symbol_map.insert(function.name.clone(), id);
    }

    let mut data_sections = Vec::new();
    for (section, standard) in [(&data.data, StandardSection::Data), (&data.rodata, StandardSection::ReadOnlyData)] {
        if section.bytes.is_empty() {
            continue;
        }
        let id = obj.section_id(standard);
        let base = obj.append_section_data(id, &section.bytes, section.align.max(1) as u64);
        for symbol in &section.symbols {
            let symbol_id = obj.add_symbol(Symbol {
                name: symbol.name.as_bytes().to_vec(),
                value: base + symbol.offset as u64,
                size: symbol.size as u64,
                kind: SymbolKind::Data,
                scope: scope(symbol.linkage),
                weak: false,
                section: SymbolSection::Section(id),
                flags: SymbolFlags::None,
            });
            symbol_map.insert(symbol.name.clone(), symbol_id);
        }
        data_sections.push((id, base, section));
    }

    // External functions resolved by the static linker
    for function in module.functions.iter().filter(|f| f.is_declaration()) {
        let id = obj.add_symbol(Symbol {
            name: function.name.as_bytes().to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Text,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        symbol_map.insert(function.name.clone(), id);
    }

    add_relocations(&mut obj, text_section, text_base, &lowered.relocations, &symbol_map)?;
    for (id, base, section) in data_sections {
        add_relocations(&mut obj, id, base, &section.relocations, &symbol_map)?;
    }

    let (init_segment, init_name, init_kind) = if darwin {
        (b"__DATA".to_vec(), b"__mod_init_func".to_vec(), macho::S_MOD_INIT_FUNC_POINTERS)
    } else {
        (Vec::new(), b".init_array".to_vec(), elf::SHT_INIT_ARRAY)
    };
    add_initializer_array(&mut obj, darwin, init_segment, init_name, init_kind, &module.ctors, &symbol_map)?;

    let (fini_segment, fini_name, fini_kind) = if darwin {
        (b"__DATA".to_vec(), b"__mod_term_func".to_vec(), macho::S_MOD_TERM_FUNC_POINTERS)
    } else {
        (Vec::new(), b".fini_array".to_vec(), elf::SHT_FINI_ARRAY)
    };
    add_initializer_array(&mut obj, darwin, fini_segment, fini_name, fini_kind, &module.dtors, &symbol_map)?;

    Ok(obj.write()?)
}

fn add_relocations(
    obj: &mut Object<'_>,
    section: SectionId,
    base: u64,
    relocations: &[Relocation],
    symbols: &HashMap<String, SymbolId>,
) -> Result<()> {
    for reloc in relocations {
        if let Some(&symbol) = symbols.get(&reloc.symbol) {
            obj.add_relocation(
                section,
                ObjectRelocation { offset: base + reloc.offset as u64, symbol, addend: 0, flags: abs64() },
            )?;
        }
    }
    Ok(())
}

fn add_initializer_array(
    obj: &mut Object<'_>,
    darwin: bool,
    segment: Vec<u8>,
    name: Vec<u8>,
    kind: u32,
    entries: &[StaticInitializer],
    symbols: &HashMap<String, SymbolId>,
) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    let mut sorted: Vec<&StaticInitializer> = entries.iter().collect();
    sorted.sort_by_key(|entry| entry.priority);

    let (section_kind, flags) = if darwin {
        (SectionKind::Data, SectionFlags::MachO { flags: kind })
    } else {
        (SectionKind::Elf(kind), SectionFlags::Elf { sh_flags: (elf::SHF_ALLOC | elf::SHF_WRITE) as u64 })
    };
    let id = obj.add_section(segment, name, section_kind);
    obj.section_mut(id).flags = flags;
    let base = obj.append_section_data(id, &vec![0; 8 * sorted.len()], 8);

    let relocations: Vec<Relocation> = sorted
        .iter()
        .enumerate()
        .map(|(index, entry)| Relocation { offset: 8 * index, symbol: entry.function.clone() })
        .collect();
    add_relocations(obj, id, base, &relocations, symbols)
}

#[cfg(test)]
mod tests {
    use crate::emit::{emit_artifact, ArtifactFormat};
    use crate::ir::{GlobalInit, IRFunction, IRGlobal, IRInstruction::*, IRModule};
    use crate::target::TargetMachine;
    use object::{Object as _, ObjectSection, ObjectSymbol};

    fn sample(triple: &str) -> IRModule {
        let mut module = IRModule::new("objtest");
        module.add_global(IRGlobal::constant_bytes("greeting", b"hi\0".to_vec()));
        module.add_global(IRGlobal::new("table", GlobalInit::Pointers(vec!["greeting".into(), "init".into()])));
        module.add_function(IRFunction::declare("__rt_alloc", 1));
        module.add_function(IRFunction::new("init", 0).with_body(vec![Push(16), Call("__rt_alloc".into(), 1), Return]));
        module.add_function(IRFunction::new("fini", 0).with_body(vec![Push(0), Return]));
        module.add_ctor(200, "init");
        module.add_ctor(100, "fini");
        module.add_dtor(100, "fini");
        TargetMachine::new(format!("native -mtriple={}", triple).parse().unwrap()).stamp(&mut module);
        module
    }

    #[test]
    fn elf_object_has_symbols_sections_and_relocations() {
        let bytes = emit_artifact(&sample("x86_64-unknown-linux-gnu"), ArtifactFormat::Object).unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        assert_eq!(file.format(), object::BinaryFormat::Elf);
        assert_eq!(file.architecture(), object::Architecture::X86_64);

        let init = file.symbol_by_name("init").unwrap();
        assert!(init.is_definition());
        let alloc = file.symbol_by_name("__rt_alloc").unwrap();
        assert!(alloc.is_undefined());
        assert!(file.symbol_by_name("table").is_some());

        let text = file.section_by_name(".text").unwrap();
        assert_eq!(text.relocations().count(), 1);
        let data = file.section_by_name(".data").unwrap();
        assert_eq!(data.relocations().count(), 2);
        let init_array = file.section_by_name(".init_array").unwrap();
        assert_eq!(init_array.size(), 16);
        assert_eq!(init_array.relocations().count(), 2);
        assert!(file.section_by_name(".fini_array").is_some());
        assert!(file.section_by_name(".rodata").is_some());
    }

    #[test]
    fn darwin_targets_get_mach_o() {
        let bytes = emit_artifact(&sample("aarch64-apple-darwin"), ArtifactFormat::Object).unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        assert_eq!(file.format(), object::BinaryFormat::MachO);
        assert_eq!(file.architecture(), object::Architecture::Aarch64);
        assert!(file.section_by_name("__mod_init_func").is_some());
    }
}
