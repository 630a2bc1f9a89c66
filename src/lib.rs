//! WASMFORGE ahead-of-time WebAssembly compilation toolchain.
//!
//! Ingests modules in the binary or textual format, validates them,
//! links imports across modules and against embedded native symbol
//! sets, and drives a pluggable backend that emits native libraries.

#![allow(dead_code)]

pub mod backend;
mod decode;
mod encode;
pub mod entity;
mod env;
mod errors;
mod ir;
mod lex;
mod op_traits;
mod ops;
mod validate;
mod wat;

pub use backend::{canonical_name, AssemblyLoader, Backend, NullBackend, SymbolSource};
pub use decode::decode_module;
pub use encode::encode_module;
pub use env::*;
pub use errors::*;
pub use ir::*;
pub use ops::{BlockType, MemArg, Operator};
pub use validate::{link_environment, validate_module};
pub use wat::{parse_bytes as parse_wat_bytes, parse_module as parse_wat};
