use crate::ir::{BitcodeError, ParseError};
use crate::target::TargetError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors callers can recover from. Broken internal invariants panic instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot JIT a module compiled for {target} on a {host} host")]
    ArchMismatch { target: String, host: String },

    #[error("host data layout '{host}' does not match module data layout '{module}'")]
    DataLayoutMismatch { host: String, module: String },

    #[error("unsupported artifact format '{0}'")]
    UnsupportedFormat(String),

    #[error("native modules cannot be serialized to a binary blob; emit an artifact instead")]
    BinarySerializationUnsupported,

    #[error("function registry requires a crt runtime with system-lib enabled (got {0})")]
    RegistryRequiresCrt(String),

    #[error("module declares no {0} global")]
    MissingModuleMain(&'static str),

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error("{}: {source}", path.display())]
    Parse { path: PathBuf, source: ParseError },

    #[error("{}: {source}", path.display())]
    Bitcode { path: PathBuf, source: BitcodeError },

    #[error("module {module} is malformed:\n{report}")]
    InvalidModule { module: String, report: String },

    #[error("no code generation backend for {0}")]
    NoBackend(String),

    #[error("{}: {source}", path.display())]
    Io { path: PathBuf, source: std::io::Error },

    #[error("object file: {0}")]
    Object(#[from] object::write::Error),

    #[error("importing the {child} module into the {module} module would create an import cycle")]
    ImportCycle { module: &'static str, child: &'static str },

    #[error("JIT engine for {module} failed to build: {reason}")]
    JitFailed { module: String, reason: String },

    #[error("{function}: {message}")]
    ArgumentMismatch { function: String, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io { path: path.into(), source }
    }

    pub(crate) fn argument(function: &str, message: impl Into<String>) -> Self {
        Error::ArgumentMismatch { function: function.to_string(), message: message.into() }
    }
}
