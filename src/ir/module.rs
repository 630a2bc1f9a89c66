use std::any::Any;
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::{Func, Global, Memory, Signature, Table, Type};
use crate::entity::EntityVec;
use crate::ops::Operator;
use fxhash::FxHashMap;
use indexmap::IndexMap;

/// The size of a single Wasm page, used in memory definitions.
pub const WASM_PAGE: usize = 0x1_0000; // 64KiB

/// The largest addressable memory size, in pages.
pub const MAX_MEMORY_PAGES: u64 = 0x1_0000;

/// A parsed module, produced by the binary decoder or the text parser
/// and consumed by the validator and the backend. Plain data: all
/// behavior lives in the passes that walk it.
#[derive(Debug, Default)]
pub struct Module {
    /// Identifier, unique within an environment.
    pub name: String,
    /// Filesystem origin, if the module was loaded from a file.
    pub path: Option<PathBuf>,
    /// Type signatures, referred to by `funcs`, `imports` and block
    /// types.
    pub signatures: EntityVec<Signature, SignatureData>,
    /// Imports in declaration order. Each also occupies the low slot
    /// of its kind's index space.
    pub imports: Vec<Import>,
    /// The functions in this module: imports first, then defined
    /// functions, each with its body.
    pub funcs: EntityVec<Func, FuncDecl>,
    /// Tables in this module. Element type is funcref in the baseline
    /// profile.
    pub tables: EntityVec<Table, TableData>,
    /// Memories in this module, with limits in 64KiB pages.
    pub memories: EntityVec<Memory, MemoryData>,
    /// Global variables in this module.
    pub globals: EntityVec<Global, GlobalData>,
    /// Exports, keyed by export name. Insertion order is declaration
    /// order.
    pub exports: IndexMap<String, ExportKind>,
    /// Table initializers.
    pub elements: Vec<ElementSegment>,
    /// Memory initializers.
    pub data: Vec<DataSegment>,
    /// The function invoked at instantiation, if any.
    pub start: Option<Func>,
    /// Custom sections, preserved by name but uninterpreted (except
    /// `name`, which feeds `func_names`).
    pub custom_sections: BTreeMap<String, Vec<u8>>,
    /// Debug names from the `name` custom section, kept when the
    /// environment preserves debug info.
    pub func_names: FxHashMap<Func, String>,
    /// Opaque backend state. Set by the backend, cleared by the
    /// environment.
    pub cache: Option<BackendCache>,
}

/// Opaque per-module state owned by the native code generator.
pub struct BackendCache(pub Box<dyn Any + Send + Sync>);

impl std::fmt::Debug for BackendCache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "BackendCache")
    }
}

/// A function signature: parameter types and result types.
///
/// Result arity beyond 1 is only legal when the multi-value feature is
/// enabled on the environment.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SignatureData {
    pub params: Vec<Type>,
    pub results: Vec<Type>,
}

/// A function: either an import slot or a defined body. Imports always
/// precede bodies in the function index space.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum FuncDecl {
    /// An imported function; the matching entry in `Module::imports`
    /// names its source.
    Import(Signature),
    /// A function defined in this module.
    Body(Signature, FunctionBody),
}

impl FuncDecl {
    pub fn sig(&self) -> Signature {
        match self {
            FuncDecl::Import(sig) => *sig,
            FuncDecl::Body(sig, ..) => *sig,
        }
    }

    pub fn body(&self) -> Option<&FunctionBody> {
        match self {
            FuncDecl::Body(_, body) => Some(body),
            _ => None,
        }
    }

    pub fn body_mut(&mut self) -> Option<&mut FunctionBody> {
        match self {
            FuncDecl::Body(_, body) => Some(body),
            _ => None,
        }
    }
}

/// Locals and the instruction stream of one defined function.
///
/// Locals are stored run-length encoded as in the binary format so a
/// decoded module re-encodes to the same bytes. The instruction stream
/// is linear; nesting is expressed by the block/loop/if and end
/// operators themselves. The function-closing `end` is implicit.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FunctionBody {
    /// (count, type) groups of declared locals, not including params.
    pub locals: Vec<(u32, Type)>,
    pub insts: Vec<Operator>,
}

impl FunctionBody {
    /// Declared locals, one entry per local, groups expanded.
    pub fn local_types(&self) -> impl Iterator<Item = Type> + '_ {
        self.locals
            .iter()
            .flat_map(|&(count, ty)| std::iter::repeat(ty).take(count as usize))
    }

    pub fn num_locals(&self) -> u32 {
        self.locals.iter().map(|&(count, _)| count).sum()
    }
}

/// Resizable limits for tables (elements) and memories (pages).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Limits {
    pub min: u32,
    pub max: Option<u32>,
}

impl Limits {
    /// Whether an entity with these actual limits satisfies the
    /// `required` limits an import declares: at least as large a
    /// minimum, and a maximum no looser than the one required.
    pub fn satisfies(&self, required: &Limits) -> bool {
        if self.min < required.min {
            return false;
        }
        match (required.max, self.max) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(req), Some(actual)) => actual <= req,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TableData {
    pub limits: Limits,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct MemoryData {
    pub limits: Limits,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GlobalData {
    pub ty: Type,
    pub mutable: bool,
    /// Initializer expression, empty for imported globals. Constant
    /// expressions only; the validator enforces this.
    pub init: Vec<Operator>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Import {
    /// The name of the module the import comes from.
    pub module: String,
    /// The name of the export within that module.
    pub name: String,
    /// The kind of import and the local index it was assigned.
    pub kind: ImportKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ImportKind {
    Func(Func),
    Table(Table),
    Memory(Memory),
    Global(Global),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ExportKind {
    Func(Func),
    Table(Table),
    Memory(Memory),
    Global(Global),
}

impl std::fmt::Display for ExportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ExportKind::Func(x) => write!(f, "{}", x),
            ExportKind::Table(x) => write!(f, "{}", x),
            ExportKind::Memory(x) => write!(f, "{}", x),
            ExportKind::Global(x) => write!(f, "{}", x),
        }
    }
}

/// A table initializer: `funcs` written at `offset` into `table`.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ElementSegment {
    pub table: Table,
    /// Constant offset expression.
    pub offset: Vec<Operator>,
    pub funcs: Vec<Func>,
}

/// A memory initializer: `data` written at `offset` into `memory`.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DataSegment {
    pub memory: Memory,
    /// Constant offset expression.
    pub offset: Vec<Operator>,
    pub data: Vec<u8>,
}

impl Module {
    pub fn empty(name: &str) -> Module {
        Module {
            name: name.to_owned(),
            ..Module::default()
        }
    }

    pub fn func_sig(&self, f: Func) -> Signature {
        self.funcs[f].sig()
    }

    /// Intern a signature, reusing an existing identical entry. The
    /// text parser uses this to de-duplicate inline type shorthands
    /// against the explicit type section.
    pub fn intern_signature(&mut self, s: SignatureData) -> Signature {
        for (idx, existing) in self.signatures.entries() {
            if *existing == s {
                return idx;
            }
        }
        self.signatures.push(s)
    }

    pub fn num_imported_funcs(&self) -> usize {
        self.funcs
            .values()
            .take_while(|d| matches!(d, FuncDecl::Import(_)))
            .count()
    }

    pub fn num_imported_globals(&self) -> usize {
        self.imports
            .iter()
            .filter(|i| matches!(i.kind, ImportKind::Global(_)))
            .count()
    }

    pub fn num_imported_tables(&self) -> usize {
        self.imports
            .iter()
            .filter(|i| matches!(i.kind, ImportKind::Table(_)))
            .count()
    }

    pub fn num_imported_memories(&self) -> usize {
        self.imports
            .iter()
            .filter(|i| matches!(i.kind, ImportKind::Memory(_)))
            .count()
    }

    /// Defined (non-import) function count; equals the number of code
    /// entries by construction, which the validator re-checks.
    pub fn num_defined_funcs(&self) -> usize {
        self.funcs.len() - self.num_imported_funcs()
    }

    /// Structural equality over everything the formats round-trip:
    /// ignores name, path, debug names and backend cache.
    pub fn structural_eq(&self, other: &Module) -> bool {
        self.signatures == other.signatures
            && self.imports == other.imports
            && self.funcs == other.funcs
            && self.tables == other.tables
            && self.memories == other.memories
            && self.globals == other.globals
            && self.exports == other.exports
            && self.elements == other.elements
            && self.data == other.data
            && self.start == other.start
            && self.custom_sections == other.custom_sections
    }

    /// Wrapper that pretty-prints the module in the canonical text
    /// form.
    pub fn display(&self) -> super::ModuleDisplay {
        super::ModuleDisplay { module: self }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entity::EntityRef;

    #[test]
    fn intern_signature_dedupes() {
        let mut m = Module::empty("t");
        let a = m.intern_signature(SignatureData {
            params: vec![Type::I32],
            results: vec![Type::I32],
        });
        let b = m.intern_signature(SignatureData {
            params: vec![Type::I32],
            results: vec![Type::I32],
        });
        let c = m.intern_signature(SignatureData {
            params: vec![],
            results: vec![],
        });
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(m.signatures.len(), 2);
    }

    #[test]
    fn limits_satisfaction() {
        let loose = Limits { min: 1, max: None };
        let tight = Limits {
            min: 2,
            max: Some(4),
        };
        assert!(tight.satisfies(&loose));
        assert!(!loose.satisfies(&tight));
        assert!(tight.satisfies(&tight));
        assert!(!Limits { min: 2, max: Some(8) }.satisfies(&tight));
    }

    #[test]
    fn import_counts() {
        let mut m = Module::empty("t");
        let sig = m.signatures.push(SignatureData::default());
        let f = m.funcs.push(FuncDecl::Import(sig));
        m.imports.push(Import {
            module: "env".into(),
            name: "f".into(),
            kind: ImportKind::Func(f),
        });
        m.funcs.push(FuncDecl::Body(sig, FunctionBody::default()));
        assert_eq!(m.num_imported_funcs(), 1);
        assert_eq!(m.num_defined_funcs(), 1);
        assert_eq!(m.func_sig(Func::new(1)), sig);
    }
}
