use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    Aarch64,
    Riscv64,
}

impl Arch {
    pub fn parse(text: &str) -> Option<Arch> {
        match text {
            "x86_64" | "amd64" | "x86-64" => Some(Arch::X86_64),
            "aarch64" | "arm64" => Some(Arch::Aarch64),
            "riscv64" | "riscv64gc" => Some(Arch::Riscv64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
            Arch::Riscv64 => "riscv64",
        }
    }

    pub fn host() -> Option<Arch> {
        Arch::parse(std::env::consts::ARCH)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
    Linux,
    Darwin,
    None,
}

impl Os {
    fn parse(text: &str) -> Option<Os> {
        match text {
            "linux" => Some(Os::Linux),
            "darwin" | "macos" | "macosx" | "ios" => Some(Os::Darwin),
            "none" | "unknown" | "elf" => Some(Os::None),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Os::Linux => "linux",
            Os::Darwin => "darwin",
            Os::None => "none",
        }
    }
}

/// `arch-vendor-os[-env]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Triple {
    pub arch: Arch,
    pub vendor: String,
    pub os: Os,
    pub env: Option<String>,
}

impl Triple {
    pub fn parse(text: &str) -> Option<Triple> {
        let mut parts = text.split('-');
        let arch = Arch::parse(parts.next()?)?;
        let vendor = parts.next()?.to_string();
        let os = Os::parse(parts.next()?)?;
        let env = parts.next().map(str::to_string);
        if parts.next().is_some() {
            return None;
        }
        Some(Triple { arch, vendor, os, env })
    }

    /// Triple describing the machine running this process.
    pub fn host() -> Option<Triple> {
        let arch = Arch::host()?;
        let (vendor, os, env) = match std::env::consts::OS {
            "linux" => ("unknown", Os::Linux, Some("gnu".to_string())),
            "macos" | "ios" => ("apple", Os::Darwin, None),
            _ => ("unknown", Os::None, None),
        };
        Some(Triple { arch, vendor: vendor.to_string(), os, env })
    }

    pub fn is_darwin(&self) -> bool {
        self.os == Os::Darwin
    }
}

impl fmt::Display for Triple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.arch.as_str(), self.vendor, self.os.as_str())?;
        if let Some(env) = &self.env {
            write!(f, "-{}", env)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_triples() {
        let triple = Triple::parse("x86_64-unknown-linux-gnu").unwrap();
        assert_eq!(triple.arch, Arch::X86_64);
        assert_eq!(triple.env.as_deref(), Some("gnu"));
        assert_eq!(triple.to_string(), "x86_64-unknown-linux-gnu");

        let darwin = Triple::parse("arm64-apple-macos").unwrap();
        assert!(darwin.is_darwin());
        assert_eq!(darwin.to_string(), "aarch64-apple-darwin");
    }

    #[test]
    fn rejects_unknown_parts() {
        assert_eq!(Triple::parse("sparc-sun-solaris"), None);
        assert_eq!(Triple::parse("x86_64"), None);
        assert_eq!(Triple::parse("x86_64-pc-linux-gnu-extra"), None);
    }
}
