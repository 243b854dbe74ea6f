/// Artifact emission
///
/// Serializes an IR module to object code, assembly, textual IR or bitcode. Emission
/// only borrows the module and uses the target machine recorded in its metadata, so it
/// never needs the JIT engine or a compatible host.
mod assembly;
mod objfile;

pub use assembly::render_assembly;
pub use objfile::write_object;

use crate::codegen::{layout_data, lower_module, DataImage};
use crate::error::{Error, Result};
use crate::ir::{encode_bitcode, print_module, IRModule};
use crate::target::TargetMachine;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    Object,
    Assembly,
    TextualIr,
    Bitcode,
}

impl ArtifactFormat {
    pub fn parse(format: &str) -> Result<Self> {
        match format {
            "o" | "obj" => Ok(ArtifactFormat::Object),
            "s" | "asm" => Ok(ArtifactFormat::Assembly),
            "ll" => Ok(ArtifactFormat::TextualIr),
            "bc" => Ok(ArtifactFormat::Bitcode),
            other => Err(Error::UnsupportedFormat(other.to_string())),
        }
    }

    /// Explicit `format`, or the extension of `path` when `format` is empty.
    pub fn resolve(path: &Path, format: &str) -> Result<Self> {
        if !format.is_empty() {
            return Self::parse(format);
        }
        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
        Self::parse(extension)
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactFormat::Object => "o",
            ArtifactFormat::Assembly => "s",
            ArtifactFormat::TextualIr => "ll",
            ArtifactFormat::Bitcode => "bc",
        }
    }
}

/// Produce the bytes of `module` in `format`.
pub fn emit_artifact(module: &IRModule, format: ArtifactFormat) -> Result<Vec<u8>> {
    match format {
        ArtifactFormat::Object => {
            let machine = TargetMachine::from_module(module)?;
            let lowered = lower_module(module, &machine)?;
            write_object(module, &machine, &lowered, &data_image(module)?)
        }
        ArtifactFormat::Assembly => Ok(assembly_text(module)?.into_bytes()),
        ArtifactFormat::TextualIr => Ok(print_module(module).into_bytes()),
        ArtifactFormat::Bitcode => Ok(encode_bitcode(module)),
    }
}

fn assembly_text(module: &IRModule) -> Result<String> {
    let machine = TargetMachine::from_module(module)?;
    let lowered = lower_module(module, &machine)?;
    Ok(render_assembly(module, &machine, &lowered, &data_image(module)?))
}

fn data_image(module: &IRModule) -> Result<DataImage> {
    layout_data(module).map_err(|e| Error::InvalidModule { module: module.name.clone(), report: e.to_string() })
}

/// Write `module` to `path`; an empty `format` selects the format from the extension.
pub fn save_to_file(module: &IRModule, path: &Path, format: &str) -> Result<()> {
    let format = ArtifactFormat::resolve(path, format)?;
    let bytes = emit_artifact(module, format)?;
    std::fs::write(path, &bytes).map_err(|e| Error::io(path, e))?;
    debug!(module = %module.name, path = %path.display(), format = format.extension(), bytes = bytes.len(), "artifact written");
    Ok(())
}

/// Text form of `module`: textual IR for `""` or `"ll"`, assembly for `"s"` or `"asm"`.
pub fn get_source(module: &IRModule, format: &str) -> Result<String> {
    match format {
        "" | "ll" => Ok(print_module(module)),
        "s" | "asm" => assembly_text(module),
        other => Err(Error::UnsupportedFormat(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IRFunction, IRInstruction::*};

    fn module(triple: &str) -> IRModule {
        let mut module = IRModule::new("emit");
        module.add_function(IRFunction::new("add_one", 1).with_body(vec![LoadParam(0), Push(1), Add, Return]));
        TargetMachine::new(format!("native -mtriple={}", triple).parse().unwrap()).stamp(&mut module);
        module
    }

    #[test]
    fn format_resolution() {
        assert_eq!(ArtifactFormat::resolve(Path::new("a.obj"), "").unwrap(), ArtifactFormat::Object);
        assert_eq!(ArtifactFormat::resolve(Path::new("a.obj"), "ll").unwrap(), ArtifactFormat::TextualIr);
        assert!(matches!(ArtifactFormat::resolve(Path::new("noext"), ""), Err(Error::UnsupportedFormat(f)) if f.is_empty()));
    }

    #[test]
    fn unknown_format_names_the_format() {
        let path = std::env::temp_dir().join("nativemod_emit_unknown.xyz");
        let err = save_to_file(&module("x86_64-unknown-linux-gnu"), &path, "xyz").unwrap_err();
        assert_eq!(err.to_string(), "unsupported artifact format 'xyz'");
        assert!(!path.exists());
    }

    #[test]
    fn get_source_rejects_binary_formats() {
        let module = module("x86_64-unknown-linux-gnu");
        assert!(matches!(get_source(&module, "o"), Err(Error::UnsupportedFormat(f)) if f == "o"));
        assert!(matches!(get_source(&module, "bc"), Err(Error::UnsupportedFormat(_))));
        assert_eq!(get_source(&module, "").unwrap(), get_source(&module, "ll").unwrap());
        assert!(get_source(&module, "asm").unwrap().contains("add_one:"));
    }

    #[test]
    fn writes_every_format_to_disk() {
        let module = module("aarch64-unknown-linux-gnu");
        let dir = std::env::temp_dir();
        for ext in ["o", "s", "ll", "bc"] {
            let path = dir.join(format!("nativemod_emit_test.{}", ext));
            save_to_file(&module, &path, "").unwrap();
            assert!(std::fs::metadata(&path).unwrap().len() > 0);
            std::fs::remove_file(&path).unwrap();
        }
    }

    #[test]
    fn textual_ir_is_byte_identical_across_calls() {
        let module = module("x86_64-unknown-linux-gnu");
        assert_eq!(
            emit_artifact(&module, ArtifactFormat::TextualIr).unwrap(),
            emit_artifact(&module, ArtifactFormat::TextualIr).unwrap()
        );
    }
}
