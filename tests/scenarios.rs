//! End-to-end scenarios over the public surface: environment
//! lifecycle, literal error cases, and round-trip properties of the
//! two formats.

use std::path::Path;
use std::sync::Arc;
use wasmforge::{
    canonical_name, decode_module, encode_module, parse_wat, EnvFlags, Environment, ErrorKind,
    ExportKind, Features, NullBackend,
};

const EMPTY_WASM: &[u8] = b"\0asm\x01\0\0\0";

const ADD_WAT: &str = r#"(module
  (func $add (param i32 i32) (result i32)
    local.get 0
    local.get 1
    i32.add)
  (export "add" (func $add)))"#;

fn env() -> Environment {
    Environment::new(Arc::new(NullBackend), 4, 4, "wfc")
}

#[test]
fn empty_binary_module_compiles() {
    let mut e = env();
    e.add_module(EMPTY_WASM, Some("empty")).unwrap();
    e.finalize().unwrap();
    e.compile(Path::new("out.so")).unwrap();
    let m = e.module("empty").unwrap();
    assert!(m.exports.is_empty());
    assert!(m.funcs.is_empty());
}

#[test]
fn add_module_exports_canonical_symbol() {
    let mut e = env();
    e.flags |= EnvFlags::ENABLE_WAT;
    e.add_module(ADD_WAT.as_bytes(), Some("calc")).unwrap();
    e.finalize().unwrap();
    e.compile(Path::new("out.so")).unwrap();

    let m = e.module("calc").unwrap();
    assert!(matches!(m.exports.get("add"), Some(ExportKind::Func(_))));
    // The symbol the produced library would export.
    assert_eq!(canonical_name(&m.name, "add"), "calc#add");
}

#[test]
fn whitelist_violation_at_link() {
    let mut e = env();
    e.flags |= EnvFlags::ENABLE_WAT | EnvFlags::WHITELIST;
    // Whitelist something unrelated so finalize still enumerates; the
    // import below stays unlisted.
    e.add_whitelist("env", "allowed");
    e.add_module(
        br#"(module (import "env" "missing" (func)))"#,
        Some("m"),
    )
    .unwrap();
    e.finalize().unwrap();
    assert!(e.compile(Path::new("out.so")).is_err());
    let errors = e.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, ErrorKind::Link);
    assert!(errors[0].message.contains("whitelist violation"));
}

#[test]
fn type_stack_empty_at_end_of_function() {
    let mut e = env();
    e.flags |= EnvFlags::ENABLE_WAT;
    e.add_module(
        br#"(module (func (result i32) i32.const 1 drop))"#,
        Some("m"),
    )
    .unwrap();
    e.finalize().unwrap();
    assert!(e.compile(Path::new("out.so")).is_err());
    assert!(e.errors()[0]
        .message
        .contains("type stack empty at end of function, expected i32"));
    assert_eq!(e.errors()[0].kind, ErrorKind::Validate);
}

#[test]
fn duplicate_module_names_are_fatal() {
    let mut e = env();
    e.add_module(EMPTY_WASM, Some("dup")).unwrap();
    e.add_module(EMPTY_WASM, Some("dup")).unwrap();
    e.finalize().unwrap();
    let err = e.compile(Path::new("out.so")).unwrap_err().to_string();
    assert!(err.contains("duplicate module name"), "{}", err);
}

#[test]
fn branch_depth_out_of_range() {
    let mut e = env();
    e.flags |= EnvFlags::ENABLE_WAT;
    e.add_module(
        br#"(module (func (block (block br 5))))"#,
        Some("m"),
    )
    .unwrap();
    e.finalize().unwrap();
    assert!(e.compile(Path::new("out.so")).is_err());
    assert!(e.errors()[0].message.contains("branch depth out of range"));
}

#[test]
fn errors_report_in_chronological_order() {
    let mut e = env();
    e.flags |= EnvFlags::ENABLE_WAT;
    e.add_module(
        br#"(module
          (func (result i32) i32.const 1 drop)
          (func (result f64) i32.const 0))"#,
        Some("m"),
    )
    .unwrap();
    e.finalize().unwrap();
    assert!(e.compile(Path::new("out.so")).is_err());
    let errors = e.errors();
    assert_eq!(errors.len(), 2);
    assert!(errors[0].message.starts_with("function 0:"), "{:?}", errors);
    assert!(errors[1].message.starts_with("function 1:"), "{:?}", errors);
}

#[test]
fn cross_module_linking() {
    let mut e = env();
    e.flags |= EnvFlags::ENABLE_WAT;
    e.add_module(
        br#"(module (func (export "mul2") (param i32) (result i32)
               local.get 0 i32.const 2 i32.mul))"#,
        Some("lib"),
    )
    .unwrap();
    e.add_module(
        br#"(module
          (import "lib" "mul2" (func $mul2 (param i32) (result i32)))
          (func (export "mul4") (param i32) (result i32)
            local.get 0 call $mul2 call $mul2))"#,
        Some("app"),
    )
    .unwrap();
    e.finalize().unwrap();
    e.compile(Path::new("out.so")).unwrap();
}

#[test]
fn cyclic_module_imports_are_allowed() {
    // Imports carry only types, not values, so cycles link fine.
    let mut e = env();
    e.flags |= EnvFlags::ENABLE_WAT;
    e.add_module(
        br#"(module
          (import "b" "g" (func $g))
          (func (export "f") call $g))"#,
        Some("a"),
    )
    .unwrap();
    e.add_module(
        br#"(module
          (import "a" "f" (func $f))
          (func (export "g") call $f))"#,
        Some("b"),
    )
    .unwrap();
    e.finalize().unwrap();
    e.compile(Path::new("out.so")).unwrap();
}

#[test]
fn import_type_mismatch_across_modules() {
    let mut e = env();
    e.flags |= EnvFlags::ENABLE_WAT;
    e.add_module(
        br#"(module (func (export "f") (param i32)))"#,
        Some("lib"),
    )
    .unwrap();
    e.add_module(
        br#"(module (import "lib" "f" (func (param f64))))"#,
        Some("app"),
    )
    .unwrap();
    e.finalize().unwrap();
    assert!(e.compile(Path::new("out.so")).is_err());
    assert!(e.errors()[0].message.contains("signatures differ"));
}

// === round-trip properties ================================================

#[test]
fn binary_roundtrip_is_bit_identical() {
    // Build a representative binary through the text front-end, then
    // check decode(encode(decode(B))) is stable at the byte level.
    let m = parse_wat(
        r#"(module
          (import "env" "base" (global $base i32))
          (func $add (param i32 i32) (result i32)
            local.get 0 local.get 1 i32.add)
          (func $loopy (param i32) (result i32) (local i32 i32)
            (block $out (result i32)
              (loop $top
                local.get 0
                i32.const 1
                i32.sub
                local.tee 0
                br_if $top
                i32.const 7
                br $out)
              i32.const 0))
          (table 4 8 funcref)
          (memory 1 2)
          (global $g (mut i32) (i32.const 41))
          (elem (i32.const 0) $add $loopy)
          (data (offset global.get $base) "hello\00wasm")
          (export "add" (func $add))
          (export "mem" (memory 0))
          (start $loopy))"#,
        "rt",
        Features::all(),
        false,
    )
    .unwrap();

    let bytes = encode_module(&m);
    let decoded = decode_module(&bytes, "rt", Features::all(), false).unwrap();
    let bytes2 = encode_module(&decoded);
    assert_eq!(bytes, bytes2);
    assert!(m.structural_eq(&decoded));
}

#[test]
fn text_roundtrip_through_canonical_form() {
    let m = parse_wat(ADD_WAT, "rt", Features::all(), false).unwrap();
    let canonical = m.display().to_string();
    let reparsed = parse_wat(&canonical, "rt", Features::all(), false).unwrap();
    assert!(
        m.structural_eq(&reparsed),
        "canonical form did not round-trip:\n{}",
        canonical
    );
    // And the canonical form is a fixpoint.
    assert_eq!(canonical, reparsed.display().to_string());
}

#[test]
fn functions_and_code_stay_aligned() {
    let m = parse_wat(ADD_WAT, "inv", Features::all(), false).unwrap();
    let defined = m.num_defined_funcs();
    let bodies = m.funcs.values().filter(|d| d.body().is_some()).count();
    assert_eq!(defined, bodies);
}

#[test]
fn start_must_be_nullary_even_in_binary() {
    // A start function with parameters decodes but fails validation.
    let mut e = env();
    e.flags |= EnvFlags::ENABLE_WAT;
    e.add_module(
        br#"(module (func $s (param i32) local.get 0 drop) (start $s))"#,
        Some("m"),
    )
    .unwrap();
    e.finalize().unwrap();
    assert!(e.compile(Path::new("out.so")).is_err());
    assert!(e.errors()[0]
        .message
        .contains("start function must have signature"));
}

#[test]
fn debug_flag_preserves_function_names() {
    let mut e = env();
    e.flags |= EnvFlags::ENABLE_WAT | EnvFlags::DEBUG;
    e.add_module(ADD_WAT.as_bytes(), Some("named")).unwrap();
    e.finalize().unwrap();
    e.compile(Path::new("out.so")).unwrap();
    let m = e.module("named").unwrap();
    assert!(m.func_names.values().any(|n| n == "add"));
}
