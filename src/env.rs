//! The environment: owner of the module table, whitelists, native
//! symbol index and embeddings; coordinator of concurrent module
//! loading; and driver of the validate/link/compile sequence.
//!
//! Lifecycle: `new` → `add_module`/`add_module_file` (loads may run on
//! parallel threads, bounded by `max_threads`) → `finalize` (ingest
//! embedding symbols, wait for outstanding loads) → `compile`
//! (populate the module map, validate, link, hand off to the backend).
//!
//! Loader threads publish into a slot reserved before the thread
//! starts: `size` counts reservations, `n_modules` completions, and a
//! completed slot is never written again. Readers go through the slot
//! lock until finalize; after finalize the module set is quiescent and
//! owned directly.

use crate::backend::{canonical_name, Backend, SymbolSource};
use crate::errors::{ErrorKind, ValidationError};
use crate::ir::Module;
use crate::validate;
use anyhow::{bail, Context, Result};
use fxhash::{FxHashMap, FxHashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

bitflags::bitflags! {
    /// Environment behavior flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EnvFlags: u32 {
        /// Forbid direct syscalls in generated code.
        const SANDBOX = 1 << 0;
        /// Enforce the whitelist on native imports.
        const WHITELIST = 1 << 1;
        /// Accept textual modules.
        const ENABLE_WAT = 1 << 2;
        /// Load modules on parallel threads, bounded by `max_threads`.
        const MULTITHREADED = 1 << 3;
        /// Emit debug info and preserve `name` sections.
        const DEBUG = 1 << 4;
        /// Reject questionable constructs that are merely discouraged.
        const STRICT = 1 << 5;
    }
}

bitflags::bitflags! {
    /// Optional post-MVP features, gated individually.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Features: u32 {
        const MULTI_VALUE = 1 << 0;
        const SIGN_EXT = 1 << 1;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum OptimizeLevel {
    O0,
    O1,
    O2,
    O3,
}

/// A native library whose exported symbols become legal import
/// targets.
#[derive(Clone, Debug)]
pub struct Embedding {
    pub tag: i32,
    pub source: EmbeddingSource,
}

#[derive(Clone, Debug)]
pub enum EmbeddingSource {
    Bytes(Vec<u8>),
    Path(PathBuf),
}

/// One entry of the module table. Reserved before a loader starts,
/// written exactly once when it finishes.
enum Slot {
    Pending,
    Ready(Box<Module>),
    Failed,
}

/// State shared with loader threads.
struct Shared {
    slots: Mutex<Vec<Slot>>,
    cond: Condvar,
    /// Reserved slots. Monotonically non-decreasing.
    size: AtomicUsize,
    /// Completed loads (successful or failed). `n_modules <= size`
    /// always; equality means no loader is in flight.
    n_modules: AtomicUsize,
    errors: Mutex<Vec<ValidationError>>,
}

const LOAD_POLL: Duration = Duration::from_millis(2);
const FINALIZE_POLL: Duration = Duration::from_millis(5);

pub struct Environment {
    pub flags: EnvFlags,
    pub features: Features,
    pub optimize: OptimizeLevel,
    pub max_threads: usize,
    /// First stop of the embedding search path.
    pub libpath: PathBuf,
    /// Where intermediate objects go, when the backend wants them on
    /// disk.
    pub objpath: Option<PathBuf>,
    /// Opaque target-system string, passed through to the backend.
    pub system: String,
    backend: Arc<dyn Backend>,
    shared: Arc<Shared>,
    whitelist: FxHashSet<String>,
    cimports: FxHashSet<String>,
    embeddings: Vec<Embedding>,
    /// Owned module set, moved out of the shared slots at finalize.
    modules: Vec<Module>,
    modulemap: FxHashMap<String, usize>,
    error_list: Vec<ValidationError>,
    finalized: bool,
}

impl Environment {
    /// A fresh environment. Defaults: sandboxed, `-O3`, every feature
    /// enabled. `arg0` seeds the embedding search path with the
    /// program's own directory.
    pub fn new(
        backend: Arc<dyn Backend>,
        initial_capacity: usize,
        max_threads: usize,
        arg0: &str,
    ) -> Environment {
        let libpath = Path::new(arg0)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        Environment {
            flags: EnvFlags::SANDBOX,
            features: Features::all(),
            optimize: OptimizeLevel::O3,
            max_threads,
            libpath,
            objpath: None,
            system: String::new(),
            backend,
            shared: Arc::new(Shared {
                slots: Mutex::new(Vec::with_capacity(initial_capacity)),
                cond: Condvar::new(),
                size: AtomicUsize::new(0),
                n_modules: AtomicUsize::new(0),
                errors: Mutex::new(vec![]),
            }),
            whitelist: FxHashSet::default(),
            cimports: FxHashSet::default(),
            embeddings: vec![],
            modules: vec![],
            modulemap: FxHashMap::default(),
            error_list: vec![],
            finalized: false,
        }
    }

    /// Queue a module for loading. With `MULTITHREADED` set the load
    /// runs on its own thread; admission blocks while `max_threads`
    /// loaders are already in flight. A parse failure is recorded on
    /// the error list and does not disturb other loads.
    pub fn add_module(&mut self, data: &[u8], name: Option<&str>) -> Result<()> {
        self.add_module_inner(data.to_vec(), name.map(|n| n.to_owned()), None)
    }

    /// Load a module from a file; the module keeps its origin path
    /// and takes the file stem as its name unless told otherwise.
    pub fn add_module_file(&mut self, path: &Path, name: Option<&str>) -> Result<()> {
        let data = std::fs::read(path)
            .with_context(|| format!("[{}] reading module {}", ErrorKind::Fatal, path.display()))?;
        let name = match name {
            Some(n) => Some(n.to_owned()),
            None => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned()),
        };
        self.add_module_inner(data, name, Some(path.to_path_buf()))
    }

    fn add_module_inner(
        &mut self,
        data: Vec<u8>,
        name: Option<String>,
        path: Option<PathBuf>,
    ) -> Result<()> {
        if self.finalized {
            bail!("cannot add modules to a finalized environment");
        }
        if data.is_empty() {
            bail!("empty module input");
        }

        let multithreaded = self.flags.contains(EnvFlags::MULTITHREADED);
        if multithreaded && self.max_threads > 0 {
            // Admission gate: block here, not after reserving, or a
            // stalled loader could deadlock the growth path.
            let mut slots = self.shared.slots.lock().unwrap();
            loop {
                let in_flight = self.shared.size.load(Ordering::Relaxed)
                    - self.shared.n_modules.load(Ordering::Relaxed);
                if in_flight < self.max_threads {
                    break;
                }
                let (guard, _) = self
                    .shared
                    .cond
                    .wait_timeout(slots, LOAD_POLL)
                    .unwrap();
                slots = guard;
            }
        }

        // Reserve: the acquire/release pair orders this reservation
        // before the loader's completion store.
        let index = self.shared.size.fetch_add(1, Ordering::AcqRel);
        {
            let mut slots = self.shared.slots.lock().unwrap();
            debug_assert_eq!(slots.len(), index);
            slots.push(Slot::Pending);
        }

        let name = name.unwrap_or_else(|| format!("m{}", index));
        let flags = self.flags;
        let features = self.features;

        if multithreaded {
            let shared = Arc::clone(&self.shared);
            std::thread::spawn(move || {
                load_module(&shared, index, data, name, path, flags, features);
            });
        } else {
            load_module(&self.shared, index, data, name, path, flags, features);
        }
        Ok(())
    }

    /// Permit the canonicalised (module, export) pair as a native
    /// import target.
    pub fn add_whitelist(&mut self, module_name: &str, export_name: &str) {
        self.whitelist
            .insert(canonical_name(module_name, export_name));
    }

    pub fn add_embedding(&mut self, tag: i32, source: EmbeddingSource) {
        self.embeddings.push(Embedding { tag, source });
    }

    /// Transition from "loading modules" to "ready to compile":
    /// enumerate embedding symbols into the native import index, then
    /// wait until every outstanding load has completed.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }

        // With whitelist enforcement on and nothing whitelisted, no
        // native import can ever resolve, so skip symbol enumeration.
        let whitelist_active =
            !self.flags.contains(EnvFlags::WHITELIST) || !self.whitelist.is_empty();
        if whitelist_active {
            for embedding in &self.embeddings {
                let symbols = match &embedding.source {
                    EmbeddingSource::Bytes(bytes) => self
                        .backend
                        .symbols(SymbolSource::Memory(bytes))
                        .context("reading embedding symbols from memory")?,
                    EmbeddingSource::Path(path) => {
                        let resolved = resolve_embedding_path(&self.libpath, path)?;
                        self.backend
                            .symbols(SymbolSource::File(&resolved))
                            .with_context(|| {
                                format!("reading embedding symbols from {}", resolved.display())
                            })?
                    }
                };
                for symbol in symbols {
                    if !self.cimports.insert(symbol.clone()) {
                        // Import libraries legitimately re-export the
                        // symbols of the DLLs they depend on; leave
                        // those duplicates for the system linker.
                        if cfg!(windows) {
                            log::debug!("duplicate embedding symbol {} tolerated", symbol);
                        } else {
                            bail!("invalid embedding: duplicate symbol {}", symbol);
                        }
                    }
                }
            }
        }

        // Wait for loaders: n_modules == size means every reserved
        // slot has published.
        let mut slots = self.shared.slots.lock().unwrap();
        while self.shared.n_modules.load(Ordering::Acquire)
            < self.shared.size.load(Ordering::Acquire)
        {
            let (guard, _) = self
                .shared
                .cond
                .wait_timeout(slots, FINALIZE_POLL)
                .unwrap();
            slots = guard;
        }

        // Quiescent: take ownership of the completed modules.
        for slot in slots.iter_mut() {
            match std::mem::replace(slot, Slot::Pending) {
                Slot::Ready(m) => self.modules.push(*m),
                Slot::Failed => {}
                Slot::Pending => unreachable!("pending slot after finalize barrier"),
            }
        }
        drop(slots);

        self.finalized = true;
        Ok(())
    }

    /// Validate, link and hand the module set to the backend.
    /// Diagnostics accumulate across the whole pass and are available
    /// from `errors()` afterwards.
    pub fn compile(&mut self, output: &Path) -> Result<()> {
        if !self.finalized {
            bail!("compile called before finalize");
        }

        // The module map is built here, outside the loaders, so the
        // loads never contend on it.
        self.modulemap.clear();
        for (i, m) in self.modules.iter().enumerate() {
            if self.modulemap.insert(m.name.clone(), i).is_some() {
                bail!("duplicate module name {}", m.name);
            }
        }

        let mut errors = std::mem::take(&mut *self.shared.errors.lock().unwrap());
        let strict = self.flags.contains(EnvFlags::STRICT);
        for m in &self.modules {
            validate::validate_module(m, self.features, strict, &mut errors);
        }
        validate::link_environment(
            &self.modules,
            &self.modulemap,
            &self.cimports,
            self.flags.contains(EnvFlags::WHITELIST),
            &self.whitelist,
            &mut errors,
        );

        if !errors.is_empty() {
            let n = errors.len();
            self.error_list = errors;
            bail!("validation failed with {} error(s)", n);
        }

        let backend = Arc::clone(&self.backend);
        backend.compile(self, output)
    }

    /// Discard one module's backend cache, or every cache plus the
    /// backend's shared context.
    pub fn clear_cache(&mut self, module_name: Option<&str>) {
        match module_name {
            Some(name) => {
                if let Some(&i) = self.modulemap.get(name) {
                    self.backend.delete_cache(&mut self.modules[i]);
                }
            }
            None => {
                for m in &mut self.modules {
                    self.backend.delete_cache(m);
                }
                self.backend.delete_context(false);
            }
        }
    }

    /// Loaded modules. Empty until `finalize`.
    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modulemap.get(name).map(|&i| &self.modules[i])
    }

    /// Diagnostics from the last `compile`, in chronological order.
    pub fn errors(&self) -> &[ValidationError] {
        &self.error_list
    }

    /// Completed loads. May trail `size()` while loaders are in
    /// flight; never exceeds it.
    pub fn n_modules(&self) -> usize {
        self.shared.n_modules.load(Ordering::Acquire)
    }

    /// Reserved module slots.
    pub fn size(&self) -> usize {
        self.shared.size.load(Ordering::Acquire)
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        self.clear_cache(None);
    }
}

/// One load: format detection, parse or decode, publish. Runs on a
/// loader thread under `MULTITHREADED`, inline otherwise.
fn load_module(
    shared: &Shared,
    index: usize,
    data: Vec<u8>,
    name: String,
    path: Option<PathBuf>,
    flags: EnvFlags,
    features: Features,
) {
    let keep_names = flags.contains(EnvFlags::DEBUG);
    let text = flags.contains(EnvFlags::ENABLE_WAT) && data.first().map_or(false, |&b| b != 0);
    let result = if text {
        crate::wat::parse_bytes(&data, &name, features, keep_names)
    } else {
        crate::decode::decode_module(&data, &name, features, keep_names)
    };

    let slot = match result {
        Ok(mut m) => {
            m.path = path;
            log::debug!("loaded module {} into slot {}", m.name, index);
            Slot::Ready(Box::new(m))
        }
        Err(e) => {
            shared
                .errors
                .lock()
                .unwrap()
                .push(ValidationError::parse(&name, format!("{:#}", e)));
            Slot::Failed
        }
    };

    {
        let mut slots = shared.slots.lock().unwrap();
        slots[index] = slot;
    }
    // Publish: everything written above happens-before a reader that
    // acquires n_modules.
    shared.n_modules.fetch_add(1, Ordering::Release);
    shared.cond.notify_all();
}

/// Embedding search order: the environment library path, then the
/// path as given, then the system library directory on POSIX.
fn resolve_embedding_path(libpath: &Path, path: &Path) -> Result<PathBuf> {
    let in_libpath = libpath.join(path);
    if in_libpath.exists() {
        return Ok(in_libpath);
    }
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if cfg!(unix) {
        let system = Path::new("/usr/lib").join(path);
        if system.exists() {
            return Ok(system);
        }
    }
    bail!("error loading embedding: {}", path.display())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::NullBackend;

    const EMPTY_WASM: &[u8] = b"\0asm\x01\0\0\0";

    fn env() -> Environment {
        Environment::new(Arc::new(NullBackend), 4, 4, "wfc")
    }

    #[test]
    fn defaults_match_creation_contract() {
        let e = env();
        assert_eq!(e.flags, EnvFlags::SANDBOX);
        assert_eq!(e.optimize, OptimizeLevel::O3);
        assert_eq!(e.features, Features::all());
        assert_eq!(e.size(), 0);
        assert_eq!(e.n_modules(), 0);
    }

    #[test]
    fn single_threaded_load_and_compile() {
        let mut e = env();
        e.add_module(EMPTY_WASM, Some("empty")).unwrap();
        e.finalize().unwrap();
        assert_eq!(e.modules().len(), 1);
        assert_eq!(e.modules()[0].name, "empty");
        e.compile(Path::new("out.so")).unwrap();
        assert!(e.errors().is_empty());
    }

    #[test]
    fn fallback_module_names() {
        let mut e = env();
        e.add_module(EMPTY_WASM, None).unwrap();
        e.add_module(EMPTY_WASM, None).unwrap();
        e.finalize().unwrap();
        let names: Vec<_> = e.modules().iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["m0", "m1"]);
    }

    #[test]
    fn multithreaded_loading_publishes_every_slot() {
        let mut e = env();
        e.flags |= EnvFlags::MULTITHREADED;
        e.max_threads = 3;
        for _ in 0..16 {
            e.add_module(EMPTY_WASM, None).unwrap();
            assert!(e.n_modules() <= e.size());
        }
        e.finalize().unwrap();
        assert_eq!(e.size(), 16);
        assert_eq!(e.n_modules(), 16);
        assert_eq!(e.modules().len(), 16);
        e.compile(Path::new("out.so")).unwrap();
    }

    #[test]
    fn parse_failure_is_isolated() {
        let mut e = env();
        e.flags |= EnvFlags::MULTITHREADED;
        e.add_module(b"\0asm\x02\0\0\0", Some("bad")).unwrap();
        e.add_module(EMPTY_WASM, Some("good")).unwrap();
        e.finalize().unwrap();
        assert_eq!(e.modules().len(), 1);
        assert_eq!(e.modules()[0].name, "good");
        let err = e.compile(Path::new("out.so")).unwrap_err().to_string();
        assert!(err.contains("validation failed"), "{}", err);
        assert_eq!(e.errors().len(), 1);
        assert_eq!(e.errors()[0].kind, ErrorKind::Parse);
        assert_eq!(e.errors()[0].module.as_deref(), Some("bad"));
    }

    #[test]
    fn duplicate_module_name_is_fatal() {
        let mut e = env();
        e.add_module(EMPTY_WASM, Some("dup")).unwrap();
        e.add_module(EMPTY_WASM, Some("dup")).unwrap();
        e.finalize().unwrap();
        let err = e.compile(Path::new("out.so")).unwrap_err().to_string();
        assert!(err.contains("duplicate module name dup"), "{}", err);
    }

    #[test]
    fn wat_loading_is_gated_by_flag() {
        let text = b"(module)";
        let mut e = env();
        e.add_module(text, Some("t")).unwrap();
        e.finalize().unwrap();
        // Without ENABLE_WAT the loader treats the bytes as binary.
        assert!(e.compile(Path::new("out.so")).is_err());

        let mut e = env();
        e.flags |= EnvFlags::ENABLE_WAT;
        e.add_module(text, Some("t")).unwrap();
        e.finalize().unwrap();
        e.compile(Path::new("out.so")).unwrap();
    }

    #[test]
    fn add_after_finalize_rejected() {
        let mut e = env();
        e.finalize().unwrap();
        assert!(e.add_module(EMPTY_WASM, None).is_err());
    }

    #[test]
    fn compile_before_finalize_rejected() {
        let mut e = env();
        assert!(e.compile(Path::new("out.so")).is_err());
    }

    struct SymBackend(Vec<&'static str>);

    impl Backend for SymBackend {
        fn compile(&self, _env: &Environment, _output: &Path) -> Result<()> {
            Ok(())
        }
        fn symbols(&self, _source: SymbolSource) -> Result<Vec<String>> {
            Ok(self.0.iter().map(|s| s.to_string()).collect())
        }
        fn delete_cache(&self, module: &mut Module) {
            module.cache = None;
        }
        fn delete_context(&self, _permanent: bool) {}
    }

    #[test]
    fn embedding_symbols_feed_cimports() {
        let backend = Arc::new(SymBackend(vec!["env#puts"]));
        let mut e = Environment::new(backend, 1, 1, "wfc");
        e.flags |= EnvFlags::ENABLE_WAT;
        e.add_embedding(0, EmbeddingSource::Bytes(vec![0x7F, 0x45, 0x4C, 0x46]));
        e.add_module(
            br#"(module (import "env" "puts" (func (param i32))))"#,
            Some("m"),
        )
        .unwrap();
        e.finalize().unwrap();
        e.compile(Path::new("out.so")).unwrap();
    }

    #[cfg(not(windows))]
    #[test]
    fn duplicate_embedding_symbols_rejected() {
        let backend = Arc::new(SymBackend(vec!["f", "f"]));
        let mut e = Environment::new(backend, 1, 1, "wfc");
        e.add_embedding(0, EmbeddingSource::Bytes(vec![1]));
        let err = e.finalize().unwrap_err().to_string();
        assert!(err.contains("duplicate symbol"), "{}", err);
    }

    #[test]
    fn empty_whitelist_skips_symbol_enumeration() {
        // A backend whose symbols() panics proves it is never called.
        struct PanicBackend;
        impl Backend for PanicBackend {
            fn compile(&self, _env: &Environment, _output: &Path) -> Result<()> {
                Ok(())
            }
            fn symbols(&self, _source: SymbolSource) -> Result<Vec<String>> {
                panic!("symbols() called despite empty whitelist");
            }
            fn delete_cache(&self, _module: &mut Module) {}
            fn delete_context(&self, _permanent: bool) {}
        }
        let mut e = Environment::new(Arc::new(PanicBackend), 1, 1, "wfc");
        e.flags |= EnvFlags::WHITELIST;
        e.add_embedding(0, EmbeddingSource::Bytes(vec![1]));
        e.finalize().unwrap();
    }
}
