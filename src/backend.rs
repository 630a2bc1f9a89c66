//! The adapter surface between the core and its external
//! collaborators: the native code generator on one side and the host
//! dynamic loader on the other. The core hands the backend a
//! validated, linked module set and receives success or failure; how
//! object code is produced is not its business.

use crate::env::Environment;
use crate::ir::Module;
use anyhow::Result;
use std::path::Path;

/// Where an embedding's symbols come from: a file on disk or an
/// in-memory image (no temporary-file round trip).
#[derive(Clone, Copy, Debug)]
pub enum SymbolSource<'a> {
    File(&'a Path),
    Memory(&'a [u8]),
}

/// Implemented by the native code generator.
pub trait Backend: Send + Sync {
    /// Compile the environment's validated module set into a native
    /// library at `output`.
    fn compile(&self, env: &Environment, output: &Path) -> Result<()>;

    /// Enumerate the exported symbol names of a native library.
    fn symbols(&self, source: SymbolSource) -> Result<Vec<String>>;

    /// Discard one module's codegen cache.
    fn delete_cache(&self, module: &mut Module);

    /// Tear down shared codegen state. `permanent` shutdowns cannot
    /// be reversed; the environment only ever requests transient ones.
    fn delete_context(&self, permanent: bool);
}

/// A backend that emits nothing. Stands in when no code generator is
/// linked (the CLI's dry-run mode) and serves as a test double: the
/// whole front half of the pipeline runs against it.
#[derive(Debug, Default)]
pub struct NullBackend;

impl Backend for NullBackend {
    fn compile(&self, env: &Environment, output: &Path) -> Result<()> {
        log::debug!(
            "null backend: {} modules validated, skipping emission of {}",
            env.modules().len(),
            output.display()
        );
        Ok(())
    }

    fn symbols(&self, _source: SymbolSource) -> Result<Vec<String>> {
        Ok(vec![])
    }

    fn delete_cache(&self, module: &mut Module) {
        module.cache = None;
    }

    fn delete_context(&self, _permanent: bool) {}
}

/// Implemented by the host dynamic loader for produced libraries.
/// Function and global pointers come back untyped; the caller knows
/// the signatures it asked the toolchain to compile.
pub trait AssemblyLoader {
    type Assembly;

    fn load_assembly(&self, file: &Path) -> Result<Self::Assembly>;

    /// Resolve an exported function by its canonical name.
    fn load_function(
        &self,
        assembly: &Self::Assembly,
        module_name: &str,
        export_name: &str,
    ) -> Result<*const ()>;

    /// Resolve entry `index` of an exported table.
    fn load_table(
        &self,
        assembly: &Self::Assembly,
        module_name: &str,
        table_name: &str,
        index: u32,
    ) -> Result<*const ()>;

    /// Resolve an exported global's storage.
    fn load_global(
        &self,
        assembly: &Self::Assembly,
        module_name: &str,
        export_name: &str,
    ) -> Result<*mut ()>;
}

/// The stable mangling for exported symbols: `{module}#{export}`,
/// with bytes outside `[A-Za-z0-9_]` percent-encoded. The whitelist
/// and the native-symbol index key on the same form, so the link pass
/// and the object-file namespace agree by construction.
pub fn canonical_name(module_name: &str, export_name: &str) -> String {
    let mut out = String::with_capacity(module_name.len() + export_name.len() + 1);
    canonicalize_into(&mut out, module_name);
    out.push('#');
    canonicalize_into(&mut out, export_name);
    out
}

fn canonicalize_into(out: &mut String, part: &str) {
    for &b in part.as_bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' {
            out.push(b as char);
        } else {
            out.push('%');
            out.push_str(&format!("{:02X}", b));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn canonical_names() {
        assert_eq!(canonical_name("m", "add"), "m#add");
        assert_eq!(canonical_name("my_mod", "f1"), "my_mod#f1");
        assert_eq!(canonical_name("a.b", "c d"), "a%2Eb#c%20d");
        assert_eq!(canonical_name("", "x"), "#x");
    }

    #[test]
    fn canonical_name_is_injective_on_separators() {
        // A literal '#' in a name cannot collide with the separator.
        assert_ne!(canonical_name("a#b", "c"), canonical_name("a", "b#c"));
    }
}
