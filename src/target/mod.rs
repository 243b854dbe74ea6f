/// Target descriptor
///
/// Parses target strings (`native -mtriple=... -mcpu=... -mattr=+a,-b -fast-math`) into a
/// [`Target`] and builds the matching [`TargetMachine`]. The canonical string is stamped
/// into every module as named metadata so later emission or JIT builds use exactly the
/// configuration the module was generated for.
mod machine;
mod triple;

pub use machine::{data_layout_for, target_enabled, TargetMachine};
pub use triple::{Arch, Os, Triple};

use crate::ir::IRModule;
use crate::symbol::TARGET_METADATA_KEY;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    #[error("unknown target kind '{0}', expected 'native'")]
    UnknownKind(String),
    #[error("unknown target option '{0}'")]
    UnknownOption(String),
    #[error("invalid target triple '{0}'")]
    InvalidTriple(String),
    #[error("invalid feature '{0}', expected +name or -name")]
    InvalidFeature(String),
    #[error("empty target string")]
    Empty,
    #[error("host architecture '{0}' is not supported")]
    UnsupportedHost(&'static str),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TargetOptions {
    pub fast_math: bool,
}

/// One `-mattr` entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Feature {
    pub enabled: bool,
    pub name: String,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", if self.enabled { '+' } else { '-' }, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub triple: Triple,
    pub cpu: String,
    pub features: Vec<Feature>,
    pub options: TargetOptions,
}

const X86_64_CPUS: &[&str] = &["x86-64", "x86-64-v2", "x86-64-v3", "x86-64-v4", "haswell", "skylake", "znver3", "znver4"];
const AARCH64_CPUS: &[&str] = &["generic", "cortex-a53", "cortex-a72", "neoverse-n1", "neoverse-v1", "apple-m1", "apple-m2"];
const RISCV64_CPUS: &[&str] = &["generic-rv64", "sifive-u74"];

const X86_64_FEATURES: &[&str] = &["sse2", "sse4.2", "avx", "avx2", "avx512f", "fma", "bmi2", "popcnt"];
const AARCH64_FEATURES: &[&str] = &["neon", "sve", "sve2", "crc", "lse", "fp-armv8", "dotprod"];
const RISCV64_FEATURES: &[&str] = &["m", "a", "f", "d", "c", "v"];

impl Target {
    /// Target for the machine running this process.
    pub fn host() -> Result<Target, TargetError> {
        let triple = Triple::host().ok_or(TargetError::UnsupportedHost(std::env::consts::ARCH))?;
        Ok(Target::for_triple(triple))
    }

    pub fn for_triple(triple: Triple) -> Target {
        Target {
            cpu: default_cpu(triple.arch).to_string(),
            triple,
            features: Vec::new(),
            options: TargetOptions::default(),
        }
    }

    pub fn arch(&self) -> Arch {
        self.triple.arch
    }

    pub fn is_darwin(&self) -> bool {
        self.triple.is_darwin()
    }

    /// Target recorded in a module: the stamped metadata string, else the module's
    /// triple, else the host.
    pub fn from_module(module: &IRModule) -> Result<Target, TargetError> {
        if let Some(text) = module.get_metadata(TARGET_METADATA_KEY) {
            return text.parse();
        }
        if !module.target_triple.is_empty() {
            let triple = Triple::parse(&module.target_triple)
                .ok_or_else(|| TargetError::InvalidTriple(module.target_triple.clone()))?;
            return Ok(Target::for_triple(triple));
        }
        Target::host()
    }

    /// Record this target in `module` as named metadata.
    pub fn stamp(&self, module: &mut IRModule) {
        module.set_metadata(TARGET_METADATA_KEY, &self.to_string());
    }

    fn check_names(&self) {
        let (cpus, features) = match self.triple.arch {
            Arch::X86_64 => (X86_64_CPUS, X86_64_FEATURES),
            Arch::Aarch64 => (AARCH64_CPUS, AARCH64_FEATURES),
            Arch::Riscv64 => (RISCV64_CPUS, RISCV64_FEATURES),
        };
        if !cpus.contains(&self.cpu.as_str()) {
            warn!(cpu = %self.cpu, arch = self.triple.arch.as_str(), "unknown CPU name");
        }
        for feature in &self.features {
            if !features.contains(&feature.name.as_str()) {
                warn!(feature = %feature.name, arch = self.triple.arch.as_str(), "unknown target feature");
            }
        }
    }
}

fn default_cpu(arch: Arch) -> &'static str {
    match arch {
        Arch::X86_64 => "x86-64",
        Arch::Aarch64 => "generic",
        Arch::Riscv64 => "generic-rv64",
    }
}

impl FromStr for Target {
    type Err = TargetError;

    fn from_str(text: &str) -> Result<Target, TargetError> {
        let mut tokens = text.split_whitespace();
        let kind = tokens.next().ok_or(TargetError::Empty)?;
        if kind != "native" {
            return Err(TargetError::UnknownKind(kind.to_string()));
        }

        let mut triple = None;
        let mut cpu = None;
        let mut features = Vec::new();
        let mut options = TargetOptions::default();

        for token in tokens {
            if let Some(value) = token.strip_prefix("-mtriple=") {
                triple = Some(Triple::parse(value).ok_or_else(|| TargetError::InvalidTriple(value.to_string()))?);
            } else if let Some(value) = token.strip_prefix("-mcpu=") {
                cpu = Some(value.to_string());
            } else if let Some(value) = token.strip_prefix("-mattr=") {
                for entry in value.split(',').filter(|entry| !entry.is_empty()) {
                    let (enabled, name) = match (entry.strip_prefix('+'), entry.strip_prefix('-')) {
                        (Some(name), _) => (true, name),
                        (_, Some(name)) => (false, name),
                        _ => return Err(TargetError::InvalidFeature(entry.to_string())),
                    };
                    features.push(Feature { enabled, name: name.to_string() });
                }
            } else if token == "-fast-math" {
                options.fast_math = true;
            } else {
                return Err(TargetError::UnknownOption(token.to_string()));
            }
        }

        let mut target = match triple {
            Some(triple) => Target::for_triple(triple),
            None => Target::host()?,
        };
        if let Some(cpu) = cpu {
            target.cpu = cpu;
        }
        target.features = features;
        target.options = options;
        target.check_names();
        Ok(target)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "native -mtriple={} -mcpu={}", self.triple, self.cpu)?;
        if !self.features.is_empty() {
            let features: Vec<String> = self.features.iter().map(|feature| feature.to_string()).collect();
            write!(f, " -mattr={}", features.join(","))?;
        }
        if self.options.fast_math {
            f.write_str(" -fast-math")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_string_round_trips() {
        let text = "native -mtriple=aarch64-apple-darwin -mcpu=apple-m1 -mattr=+neon,-sve -fast-math";
        let target: Target = text.parse().unwrap();
        assert_eq!(target.arch(), Arch::Aarch64);
        assert!(target.is_darwin());
        assert_eq!(target.features[1], Feature { enabled: false, name: "sve".into() });
        assert!(target.options.fast_math);
        assert_eq!(target.to_string(), text);
        assert_eq!(target.to_string().parse::<Target>().unwrap(), target);
    }

    #[test]
    fn defaults_cpu_per_architecture() {
        let target: Target = "native -mtriple=riscv64-unknown-linux-gnu".parse().unwrap();
        assert_eq!(target.cpu, "generic-rv64");
        assert_eq!(target.to_string(), "native -mtriple=riscv64-unknown-linux-gnu -mcpu=generic-rv64");
    }

    #[test]
    fn rejects_malformed_strings() {
        assert_eq!("".parse::<Target>(), Err(TargetError::Empty));
        assert_eq!("cuda".parse::<Target>(), Err(TargetError::UnknownKind("cuda".into())));
        assert_eq!(
            "native -mtriple=x86_64-pc-linux -O3".parse::<Target>(),
            Err(TargetError::UnknownOption("-O3".into()))
        );
        assert_eq!(
            "native -mtriple=x86_64-pc-linux -mattr=avx".parse::<Target>(),
            Err(TargetError::InvalidFeature("avx".into()))
        );
    }

    #[test]
    fn module_without_metadata_falls_back_to_triple() {
        let mut module = IRModule::new("m");
        module.target_triple = "x86_64-unknown-linux-gnu".into();
        let target = Target::from_module(&module).unwrap();
        assert_eq!(target.arch(), Arch::X86_64);

        let stamped: Target = "native -mtriple=aarch64-unknown-linux-gnu".parse().unwrap();
        stamped.stamp(&mut module);
        assert_eq!(Target::from_module(&module).unwrap(), stamped);
    }
}
