/// Code generation module - architecture-agnostic interface
///
/// Lowers IR modules to machine code through a trait-based backend per architecture.
///
/// Supported targets:
/// - x86-64 (System V ABI)
/// - AArch64 (AAPCS64)
///
/// ## Module Structure
/// - `api`: public lowering entry point
/// - `backend`: trait definitions and lowered artifacts
/// - `assembler`: byte buffer, listing and fixups shared by backends
/// - `data`: layout of globals
/// - `x86_64`, `aarch64`: target implementations
mod aarch64;
mod api;
mod assembler;
mod backend;
mod data;
mod x86_64;

pub use api::{backend_for, lower_module};
pub use assembler::{Assembler, PatchKind};
pub use backend::{LoweredFunction, LoweredModule, Relocation, TargetBackend};
pub use data::{layout_data, DataImage, DataSection, DataSymbol};
