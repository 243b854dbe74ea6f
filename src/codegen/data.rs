/// Layout of module globals into writable and read-only data
use super::backend::Relocation;
use crate::ir::{GlobalInit, IRGlobal, IRModule, Linkage, VerifyError, MAX_SECTION_BYTES};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSymbol {
    pub name: String,
    pub linkage: Linkage,
    pub offset: usize,
    pub size: usize,
}

#[derive(Debug, Clone, Default)]
pub struct DataSection {
    pub bytes: Vec<u8>,
    pub align: usize,
    pub symbols: Vec<DataSymbol>,
    pub relocations: Vec<Relocation>,
}

impl DataSection {
    fn place(&mut self, global: &IRGlobal) -> Result<(), VerifyError> {
        let too_large = || VerifyError::SectionTooLarge { global: global.name.clone() };
        let align = usize::try_from(global.align.max(1)).map_err(|_| too_large())?;
        let offset = self.bytes.len().checked_next_multiple_of(align).ok_or_else(too_large)?;
        let end = offset.checked_add(global.size()).ok_or_else(too_large)?;
        if end > MAX_SECTION_BYTES {
            return Err(too_large());
        }

        self.bytes.resize(offset, 0);
        self.bytes.extend_from_slice(&global.init.initial_bytes());
        self.align = self.align.max(align);

        if let GlobalInit::Pointers(targets) = &global.init {
            for (index, target) in targets.iter().enumerate() {
                self.relocations.push(Relocation { offset: offset + 8 * index, symbol: target.clone() });
            }
        }
        self.symbols.push(DataSymbol { name: global.name.clone(), linkage: global.linkage, offset, size: global.size() });
        Ok(())
    }

    pub fn symbol(&self, name: &str) -> Option<&DataSymbol> {
        self.symbols.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DataImage {
    pub data: DataSection,
    pub rodata: DataSection,
}

/// Place every global of `module`. Fails without allocating when a section would
/// outgrow [`MAX_SECTION_BYTES`].
pub fn layout_data(module: &IRModule) -> Result<DataImage, VerifyError> {
    let mut image = DataImage::default();
    for global in &module.globals {
        let section = if global.constant { &mut image.rodata } else { &mut image.data };
        section.place(global)?;
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_constants_and_aligns() {
        let mut module = IRModule::new("m");
        module.add_global(IRGlobal::constant_bytes("name", b"abc\0".to_vec()));
        module.add_global(IRGlobal::new("counter", GlobalInit::Word(5)));
        module.add_global(
            IRGlobal::new("table", GlobalInit::Pointers(vec!["name".into(), "counter".into()]))
                .with_linkage(Linkage::Internal)
                .with_align(16),
        );

        let image = layout_data(&module).unwrap();
        assert_eq!(image.rodata.bytes, b"abc\0");
        assert_eq!(image.data.symbol("counter").unwrap().offset, 0);
        assert_eq!(image.data.symbol("table").unwrap().offset, 16);
        assert_eq!(image.data.bytes.len(), 32);
        assert_eq!(image.data.align, 16);
        assert_eq!(image.data.relocations[1], Relocation { offset: 24, symbol: "counter".into() });
    }

    #[test]
    fn oversized_globals_fail_before_allocating() {
        let mut module = IRModule::new("m");
        module.add_global(IRGlobal::new("small", GlobalInit::Word(1)));
        module.add_global(IRGlobal::new("huge", GlobalInit::Zero(usize::MAX)));
        let err = layout_data(&module).unwrap_err();
        assert_eq!(err, VerifyError::SectionTooLarge { global: "huge".into() });
    }
}
