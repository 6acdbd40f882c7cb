//! Architecture support.
//!
//! The kernel targets exactly one platform: 32-bit x86. There is no
//! multi-architecture abstraction layer here - a single target needs no
//! `x86_64`/`aarch64`/`riscv64` split.

pub mod x86;
pub use x86::*;
