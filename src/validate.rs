//! Static validation.
//!
//! Two passes. The single-module pass checks section well-formedness,
//! runs a type-stack simulation over every function body, validates
//! constant expressions and limits. The link pass resolves every
//! import across the environment's module set and against the native
//! symbol index, subject to whitelist policy. Errors accumulate so a
//! single run reports everything it found.

use crate::entity::EntityRef;
use crate::env::Features;
use crate::errors::ValidationError;
use crate::ir::{
    ExportKind, FuncDecl, GlobalData, ImportKind, Module, SignatureData, Type, MAX_MEMORY_PAGES,
};
use crate::op_traits::{op_inputs, op_outputs};
use crate::ops::{BlockType, Operator};
use fxhash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

/// Validate one module in isolation, appending diagnostics to
/// `errors`. Returns the number of errors found, so callers can tell
/// whether this module was clean.
pub fn validate_module(
    m: &Module,
    features: Features,
    strict: bool,
    errors: &mut Vec<ValidationError>,
) -> usize {
    let before = errors.len();
    let mut v = Validator {
        m,
        features,
        strict,
        errors,
    };
    v.sections();
    v.bodies();
    errors.len() - before
}

struct Validator<'a> {
    m: &'a Module,
    features: Features,
    strict: bool,
    errors: &'a mut Vec<ValidationError>,
}

impl<'a> Validator<'a> {
    fn error(&mut self, message: String) {
        self.errors
            .push(ValidationError::validate(&self.m.name, message));
    }

    fn sections(&mut self) {
        let m = self.m;

        // Function declarations: signatures in range, imports packed
        // in front so the function and code sections stay aligned.
        let mut seen_body = false;
        for (f, decl) in m.funcs.entries() {
            if !m.signatures.contains(decl.sig()) {
                self.error(format!("function {}: type index out of range", f.as_u32()));
            }
            match decl {
                FuncDecl::Body(..) => seen_body = true,
                FuncDecl::Import(..) if seen_body => {
                    self.error(format!(
                        "function {}: imports must precede defined functions",
                        f.as_u32()
                    ));
                }
                FuncDecl::Import(..) => {}
            }
        }

        if !self.features.contains(Features::MULTI_VALUE) {
            for (s, sig) in m.signatures.entries() {
                if sig.results.len() > 1 {
                    self.error(format!(
                        "type {}: multiple results require the multi-value feature",
                        s.as_u32()
                    ));
                }
            }
        }

        // Baseline profile: at most one table and one memory,
        // imported or defined.
        if m.tables.len() > 1 {
            self.error("at most one table is allowed".to_owned());
        }
        if m.memories.len() > 1 {
            self.error("at most one memory is allowed".to_owned());
        }
        for (t, table) in m.tables.entries() {
            if let Some(max) = table.limits.max {
                if table.limits.min > max {
                    self.error(format!(
                        "table {}: minimum size exceeds maximum",
                        t.as_u32()
                    ));
                }
            }
        }
        for (idx, mem) in m.memories.entries() {
            let limits = &mem.limits;
            if limits.min as u64 > MAX_MEMORY_PAGES {
                self.error(format!(
                    "memory {}: initial size exceeds {} pages",
                    idx.as_u32(),
                    MAX_MEMORY_PAGES
                ));
            }
            if let Some(max) = limits.max {
                if max as u64 > MAX_MEMORY_PAGES {
                    self.error(format!(
                        "memory {}: maximum size exceeds {} pages",
                        idx.as_u32(),
                        MAX_MEMORY_PAGES
                    ));
                }
                if limits.min > max {
                    self.error(format!(
                        "memory {}: initial size exceeds maximum",
                        idx.as_u32()
                    ));
                }
            }
        }

        // Imported globals must be immutable in the baseline profile.
        let num_imported_globals = m.num_imported_globals();
        for import in &m.imports {
            if let ImportKind::Global(g) = import.kind {
                if m.globals[g].mutable {
                    self.error(format!(
                        "imported global {} must be immutable",
                        g.as_u32()
                    ));
                }
            }
        }

        // Defined globals: constant initializer of the declared type.
        for (g, global) in m.globals.entries() {
            if g.index() < num_imported_globals {
                continue;
            }
            self.const_expr(
                &global.init,
                global.ty,
                &format!("global {}", g.as_u32()),
            );
        }

        for (name, kind) in &m.exports {
            let ok = match kind {
                ExportKind::Func(x) => m.funcs.contains(*x),
                ExportKind::Table(x) => m.tables.contains(*x),
                ExportKind::Memory(x) => m.memories.contains(*x),
                ExportKind::Global(x) => m.globals.contains(*x),
            };
            if !ok {
                self.error(format!("export {:?}: index out of range", name));
            }
            if self.strict && name.is_empty() {
                self.error("empty export name".to_owned());
            }
        }

        if let Some(start) = m.start {
            match m.funcs.get(start) {
                None => self.error("start function index out of range".to_owned()),
                Some(decl) => {
                    let sig = &m.signatures[decl.sig()];
                    if !sig.params.is_empty() || !sig.results.is_empty() {
                        self.error(
                            "start function must have signature () -> ()".to_owned(),
                        );
                    }
                }
            }
        }

        for (i, seg) in m.elements.iter().enumerate() {
            if !m.tables.contains(seg.table) {
                self.error(format!("element segment {}: table index out of range", i));
            }
            self.const_expr(&seg.offset, Type::I32, &format!("element segment {}", i));
            for f in &seg.funcs {
                if !m.funcs.contains(*f) {
                    self.error(format!(
                        "element segment {}: function index {} out of range",
                        i,
                        f.as_u32()
                    ));
                }
            }
        }

        for (i, seg) in m.data.iter().enumerate() {
            if !m.memories.contains(seg.memory) {
                self.error(format!("data segment {}: memory index out of range", i));
            }
            self.const_expr(&seg.offset, Type::I32, &format!("data segment {}", i));
        }
    }

    /// Constant expressions: `*.const` or `global.get` of an imported
    /// immutable global, producing exactly one value of the expected
    /// type.
    fn const_expr(&mut self, ops: &[Operator], expected: Type, what: &str) {
        let mut stack: SmallVec<[Type; 2]> = SmallVec::new();
        let num_imported_globals = self.m.num_imported_globals();
        for op in ops {
            match op {
                Operator::I32Const { .. } => stack.push(Type::I32),
                Operator::I64Const { .. } => stack.push(Type::I64),
                Operator::F32Const { .. } => stack.push(Type::F32),
                Operator::F64Const { .. } => stack.push(Type::F64),
                Operator::GlobalGet { global_index } => {
                    if self.strict {
                        self.error(format!(
                            "{}: non-literal constant expression rejected in strict mode",
                            what
                        ));
                    }
                    match self.m.globals.get(*global_index) {
                        None => {
                            self.error(format!(
                                "{}: global index out of range in constant expression",
                                what
                            ));
                            return;
                        }
                        Some(GlobalData { ty, mutable, .. }) => {
                            if global_index.index() >= num_imported_globals {
                                self.error(format!(
                                    "{}: constant expression may only read imported globals",
                                    what
                                ));
                            }
                            if *mutable {
                                self.error(format!(
                                    "{}: constant expression may not read a mutable global",
                                    what
                                ));
                            }
                            stack.push(*ty);
                        }
                    }
                }
                op => {
                    self.error(format!(
                        "{}: illegal instruction {} in constant expression",
                        what,
                        op.mnemonic()
                    ));
                    return;
                }
            }
        }
        if stack.len() != 1 || stack[0] != expected {
            self.error(format!(
                "{}: constant expression must produce exactly one {}",
                what, expected
            ));
        }
    }

    fn bodies(&mut self) {
        for (f, decl) in self.m.funcs.entries() {
            let (sig, body) = match decl {
                FuncDecl::Body(sig, body) => (*sig, body),
                FuncDecl::Import(..) => continue,
            };
            if !self.m.signatures.contains(sig) {
                continue; // already reported
            }
            let mut checker = TypeChecker::new(self.m, sig, body.local_types().collect());
            if let Err(msg) = checker.run(&body.insts) {
                self.errors.push(ValidationError::validate(
                    &self.m.name,
                    format!("function {}: {}", f.as_u32(), msg),
                ));
            }
        }
    }
}

/// One control frame: an active `block`, `loop` or `if` arm, or the
/// function body itself.
struct Frame {
    kind: FrameKind,
    start_types: SmallVec<[Type; 2]>,
    end_types: SmallVec<[Type; 2]>,
    height: usize,
    unreachable: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Body,
    Block,
    Loop,
    If,
    Else,
}

/// Stack entries are `None` when the type is unknowable because the
/// code is unreachable.
struct TypeChecker<'a> {
    m: &'a Module,
    locals: Vec<Type>,
    stack: Vec<Option<Type>>,
    frames: Vec<Frame>,
}

impl<'a> TypeChecker<'a> {
    fn new(m: &'a Module, sig: crate::ir::Signature, declared: Vec<Type>) -> TypeChecker<'a> {
        let data = &m.signatures[sig];
        let mut locals = data.params.clone();
        locals.extend(declared);
        let frame = Frame {
            kind: FrameKind::Body,
            start_types: SmallVec::new(),
            end_types: data.results.iter().copied().collect(),
            height: 0,
            unreachable: false,
        };
        TypeChecker {
            m,
            locals,
            stack: vec![],
            frames: vec![frame],
        }
    }

    fn top(&self) -> &Frame {
        self.frames.last().unwrap()
    }

    fn push(&mut self, ty: Type) {
        self.stack.push(Some(ty));
    }

    fn pop_any(&mut self) -> Result<Option<Type>, String> {
        let frame = self.top();
        if self.stack.len() == frame.height {
            if frame.unreachable {
                return Ok(None);
            }
            return Err("type stack empty".to_owned());
        }
        Ok(self.stack.pop().unwrap())
    }

    fn pop_expect(&mut self, want: Type) -> Result<(), String> {
        match self.pop_any()? {
            None => Ok(()),
            Some(got) if got == want => Ok(()),
            Some(got) => Err(format!("type mismatch: expected {}, found {}", want, got)),
        }
    }

    fn set_unreachable(&mut self) {
        let frame = self.frames.last_mut().unwrap();
        self.stack.truncate(frame.height);
        frame.unreachable = true;
    }

    fn push_frame(&mut self, kind: FrameKind, start: SmallVec<[Type; 2]>, end: SmallVec<[Type; 2]>) {
        let height = self.stack.len();
        for &t in &start {
            self.push(t);
        }
        self.frames.push(Frame {
            kind,
            start_types: start,
            end_types: end,
            height,
            unreachable: false,
        });
    }

    fn pop_frame(&mut self) -> Result<Frame, String> {
        let end = self.top().end_types.clone();
        for &t in end.iter().rev() {
            self.pop_expect(t)?;
        }
        let frame = self.frames.pop().unwrap();
        if self.stack.len() != frame.height {
            return Err("unexpected values remaining on type stack at end of block".to_owned());
        }
        Ok(frame)
    }

    /// Branch target arity: a loop's label takes its parameters, every
    /// other label its results.
    fn label_types(&self, depth: u32) -> Result<SmallVec<[Type; 2]>, String> {
        let depth = depth as usize;
        if depth >= self.frames.len() {
            return Err("branch depth out of range".to_owned());
        }
        let frame = &self.frames[self.frames.len() - 1 - depth];
        Ok(match frame.kind {
            FrameKind::Loop => frame.start_types.clone(),
            _ => frame.end_types.clone(),
        })
    }

    fn block_signature(
        &mut self,
        ty: &BlockType,
    ) -> Result<(SmallVec<[Type; 2]>, SmallVec<[Type; 2]>), String> {
        Ok(match ty {
            BlockType::Empty => (SmallVec::new(), SmallVec::new()),
            BlockType::Value(t) => (SmallVec::new(), std::iter::once(*t).collect()),
            BlockType::Sig(s) => {
                let SignatureData { params, results } = self
                    .m
                    .signatures
                    .get(*s)
                    .ok_or_else(|| "block type index out of range".to_owned())?;
                (
                    params.iter().copied().collect(),
                    results.iter().copied().collect(),
                )
            }
        })
    }

    fn run(&mut self, insts: &[Operator]) -> Result<(), String> {
        for op in insts {
            self.step(op)
                .map_err(|e| format!("{}: {}", op.mnemonic(), e))?;
        }
        if self.frames.len() != 1 {
            return Err("unclosed block at end of function".to_owned());
        }
        // The implicit function-level end.
        let unreachable = self.top().unreachable;
        let end = self.top().end_types.clone();
        for &t in end.iter().rev() {
            if self.stack.len() == self.top().height && !unreachable {
                return Err(format!(
                    "type stack empty at end of function, expected {}",
                    t
                ));
            }
            self.pop_expect(t)
                .map_err(|e| format!("at end of function: {}", e))?;
        }
        if self.stack.len() != self.top().height {
            return Err("unexpected values remaining on type stack at end of function".to_owned());
        }
        Ok(())
    }

    fn step(&mut self, op: &Operator) -> Result<(), String> {
        use Operator::*;
        match op {
            Nop => Ok(()),
            Unreachable => {
                self.set_unreachable();
                Ok(())
            }
            Block { ty } => {
                let (start, end) = self.block_signature(ty)?;
                for &t in start.iter().rev() {
                    self.pop_expect(t)?;
                }
                self.push_frame(FrameKind::Block, start, end);
                Ok(())
            }
            Loop { ty } => {
                let (start, end) = self.block_signature(ty)?;
                for &t in start.iter().rev() {
                    self.pop_expect(t)?;
                }
                self.push_frame(FrameKind::Loop, start, end);
                Ok(())
            }
            If { ty } => {
                self.pop_expect(Type::I32)?;
                let (start, end) = self.block_signature(ty)?;
                for &t in start.iter().rev() {
                    self.pop_expect(t)?;
                }
                self.push_frame(FrameKind::If, start, end);
                Ok(())
            }
            Else => {
                let frame = self.pop_frame()?;
                if frame.kind != FrameKind::If {
                    return Err("else without matching if".to_owned());
                }
                self.push_frame(FrameKind::Else, frame.start_types, frame.end_types);
                Ok(())
            }
            End => {
                if self.frames.len() == 1 {
                    return Err("mismatched end".to_owned());
                }
                let frame = self.pop_frame()?;
                // An if without an else must be a no-op on the stack.
                if frame.kind == FrameKind::If && frame.start_types != frame.end_types {
                    return Err("if without else must leave the stack unchanged".to_owned());
                }
                for &t in frame.end_types.iter() {
                    self.push(t);
                }
                Ok(())
            }
            Br { depth } => {
                let types = self.label_types(*depth)?;
                for &t in types.iter().rev() {
                    self.pop_expect(t)?;
                }
                self.set_unreachable();
                Ok(())
            }
            BrIf { depth } => {
                self.pop_expect(Type::I32)?;
                let types = self.label_types(*depth)?;
                for &t in types.iter().rev() {
                    self.pop_expect(t)?;
                }
                for &t in types.iter() {
                    self.push(t);
                }
                Ok(())
            }
            BrTable { targets, default } => {
                self.pop_expect(Type::I32)?;
                let want = self.label_types(*default)?;
                for target in targets {
                    let got = self.label_types(*target)?;
                    if got != want {
                        return Err(
                            "br_table targets must all have the same label types".to_owned()
                        );
                    }
                }
                for &t in want.iter().rev() {
                    self.pop_expect(t)?;
                }
                self.set_unreachable();
                Ok(())
            }
            Return => {
                let types = self.frames[0].end_types.clone();
                for &t in types.iter().rev() {
                    self.pop_expect(t)?;
                }
                self.set_unreachable();
                Ok(())
            }
            Drop => {
                self.pop_any()?;
                Ok(())
            }
            Select => {
                self.pop_expect(Type::I32)?;
                let a = self.pop_any()?;
                let b = self.pop_any()?;
                match (a, b) {
                    (Some(a), Some(b)) if a != b => {
                        Err(format!("select operands differ: {} vs {}", a, b))
                    }
                    (Some(t), _) | (_, Some(t)) => {
                        self.push(t);
                        Ok(())
                    }
                    (None, None) => {
                        self.stack.push(None);
                        Ok(())
                    }
                }
            }
            LocalGet { local_index } => {
                let ty = *self
                    .locals
                    .get(local_index.index())
                    .ok_or_else(|| "local index out of range".to_owned())?;
                self.push(ty);
                Ok(())
            }
            LocalSet { local_index } => {
                let ty = *self
                    .locals
                    .get(local_index.index())
                    .ok_or_else(|| "local index out of range".to_owned())?;
                self.pop_expect(ty)
            }
            LocalTee { local_index } => {
                let ty = *self
                    .locals
                    .get(local_index.index())
                    .ok_or_else(|| "local index out of range".to_owned())?;
                self.pop_expect(ty)?;
                self.push(ty);
                Ok(())
            }
            GlobalSet { global_index } => {
                let global = self
                    .m
                    .globals
                    .get(*global_index)
                    .ok_or_else(|| "global index out of range".to_owned())?;
                if !global.mutable {
                    return Err("assignment to immutable global".to_owned());
                }
                self.pop_expect(global.ty)
            }
            _ => {
                self.check_indices(op)?;
                let inputs = op_inputs(self.m, op).map_err(|e| e.to_string())?;
                let outputs = op_outputs(self.m, op).map_err(|e| e.to_string())?;
                for &t in inputs.iter().rev() {
                    self.pop_expect(t)?;
                }
                for &t in outputs.iter() {
                    self.push(t);
                }
                Ok(())
            }
        }
    }

    /// Range and alignment checks for operators whose typing tables
    /// index into the module.
    fn check_indices(&self, op: &Operator) -> Result<(), String> {
        use Operator::*;
        match op {
            Call { function_index } => {
                if !self.m.funcs.contains(*function_index) {
                    return Err("function index out of range".to_owned());
                }
            }
            CallIndirect {
                sig_index,
                table_index,
            } => {
                if !self.m.signatures.contains(*sig_index) {
                    return Err("type index out of range".to_owned());
                }
                if !self.m.tables.contains(*table_index) {
                    return Err("table index out of range".to_owned());
                }
            }
            GlobalGet { global_index } => {
                if !self.m.globals.contains(*global_index) {
                    return Err("global index out of range".to_owned());
                }
            }
            MemorySize { mem } | MemoryGrow { mem } => {
                if !self.m.memories.contains(*mem) {
                    return Err("memory index out of range".to_owned());
                }
            }
            _ => {
                if let Some(arg) = op.memarg() {
                    if self.m.memories.is_empty() {
                        return Err("module has no memory".to_owned());
                    }
                    if arg.align > op.natural_align() {
                        return Err(
                            "alignment must not exceed the natural alignment".to_owned()
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

/// The link pass: resolve every import in every module, either against
/// another module's exports or against the native symbol index.
pub fn link_environment(
    modules: &[Module],
    modulemap: &FxHashMap<String, usize>,
    cimports: &FxHashSet<String>,
    whitelist_enabled: bool,
    whitelist: &FxHashSet<String>,
    errors: &mut Vec<ValidationError>,
) {
    for m in modules {
        for import in &m.imports {
            match modulemap.get(&import.module) {
                Some(&target_idx) => {
                    let target = &modules[target_idx];
                    resolve_module_import(m, import, target, errors);
                }
                None => resolve_c_import(m, import, cimports, whitelist_enabled, whitelist, errors),
            }
        }
    }
}

fn resolve_module_import(
    m: &Module,
    import: &crate::ir::Import,
    target: &Module,
    errors: &mut Vec<ValidationError>,
) {
    let kind = match target.exports.get(&import.name) {
        Some(kind) => kind,
        None => {
            errors.push(ValidationError::link(
                &m.name,
                format!(
                    "missing import {}.{}: module {} has no such export",
                    import.module, import.name, target.name
                ),
            ));
            return;
        }
    };
    let ok = match (&import.kind, kind) {
        (ImportKind::Func(f), ExportKind::Func(tf)) => {
            let want = &m.signatures[m.funcs[*f].sig()];
            let got = &target.signatures[target.funcs[*tf].sig()];
            if want != got {
                errors.push(ValidationError::link(
                    &m.name,
                    format!(
                        "import-type mismatch for {}.{}: function signatures differ",
                        import.module, import.name
                    ),
                ));
            }
            true
        }
        (ImportKind::Table(t), ExportKind::Table(tt)) => {
            if !target.tables[*tt].limits.satisfies(&m.tables[*t].limits) {
                errors.push(ValidationError::link(
                    &m.name,
                    format!(
                        "import-type mismatch for {}.{}: table limits incompatible",
                        import.module, import.name
                    ),
                ));
            }
            true
        }
        (ImportKind::Memory(mi), ExportKind::Memory(tm)) => {
            if !target.memories[*tm]
                .limits
                .satisfies(&m.memories[*mi].limits)
            {
                errors.push(ValidationError::link(
                    &m.name,
                    format!(
                        "import-type mismatch for {}.{}: memory limits incompatible",
                        import.module, import.name
                    ),
                ));
            }
            true
        }
        (ImportKind::Global(g), ExportKind::Global(tg)) => {
            let want = &m.globals[*g];
            let got = &target.globals[*tg];
            if want.ty != got.ty || want.mutable != got.mutable {
                errors.push(ValidationError::link(
                    &m.name,
                    format!(
                        "import-type mismatch for {}.{}: global types differ",
                        import.module, import.name
                    ),
                ));
            }
            true
        }
        _ => false,
    };
    if !ok {
        errors.push(ValidationError::link(
            &m.name,
            format!(
                "import-type mismatch for {}.{}: kinds differ",
                import.module, import.name
            ),
        ));
    }
}

fn resolve_c_import(
    m: &Module,
    import: &crate::ir::Import,
    cimports: &FxHashSet<String>,
    whitelist_enabled: bool,
    whitelist: &FxHashSet<String>,
    errors: &mut Vec<ValidationError>,
) {
    if !matches!(import.kind, ImportKind::Func(_)) {
        errors.push(ValidationError::link(
            &m.name,
            format!(
                "missing import {}.{}: module not found and only functions may bind native symbols",
                import.module, import.name
            ),
        ));
        return;
    }
    let canon = crate::backend::canonical_name(&import.module, &import.name);
    if whitelist_enabled && !whitelist.contains(&canon) {
        errors.push(ValidationError::link(
            &m.name,
            format!("whitelist violation: {}.{}", import.module, import.name),
        ));
        return;
    }
    if !cimports.contains(&canon) {
        errors.push(ValidationError::link(
            &m.name,
            format!(
                "missing import {}.{}: no module or native symbol provides it",
                import.module, import.name
            ),
        ));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::wat::parse_module;

    fn validate_src(src: &str) -> Vec<ValidationError> {
        let m = parse_module(src, "t", Features::all(), false).unwrap();
        let mut errors = vec![];
        validate_module(&m, Features::all(), false, &mut errors);
        errors
    }

    fn assert_error(src: &str, needle: &str) {
        let errors = validate_src(src);
        assert!(
            errors.iter().any(|e| e.message.contains(needle)),
            "expected {:?} in {:?}",
            needle,
            errors
        );
    }

    #[test]
    fn add_module_validates() {
        let errors = validate_src(
            r#"(module
                 (func (param i32 i32) (result i32)
                   local.get 0 local.get 1 i32.add)
                 (export "add" (func 0)))"#,
        );
        assert!(errors.is_empty(), "{:?}", errors);
    }

    #[test]
    fn empty_stack_at_end_of_function() {
        assert_error(
            "(module (func (result i32) i32.const 1 drop))",
            "type stack empty at end of function, expected i32",
        );
    }

    #[test]
    fn branch_depth_out_of_range() {
        assert_error(
            "(module (func (block (block br 5))))",
            "branch depth out of range",
        );
    }

    #[test]
    fn type_mismatch_reported() {
        assert_error(
            "(module (func (result i32) i64.const 1))",
            "type mismatch: expected i32, found i64",
        );
    }

    #[test]
    fn unreachable_code_is_permissive() {
        let errors = validate_src(
            r#"(module (func (result i32)
                 unreachable
                 i64.const 1
                 drop
                 i32.const 2))"#,
        );
        assert!(errors.is_empty(), "{:?}", errors);
    }

    #[test]
    fn unreachable_still_checks_frame_exit() {
        assert_error(
            r#"(module (func (result i32)
                 (block (result i32) unreachable i64.const 1)))"#,
            "type mismatch",
        );
    }

    #[test]
    fn if_without_else_must_be_balanced() {
        assert_error(
            "(module (func (result i32) i32.const 1 if (result i32) i32.const 2 end))",
            "if without else",
        );
    }

    #[test]
    fn select_operand_agreement() {
        assert_error(
            "(module (func i32.const 1 f32.const 2 i32.const 0 select drop))",
            "select operands differ",
        );
    }

    #[test]
    fn call_checks_signature() {
        assert_error(
            r#"(module
                 (func $f (param i32))
                 (func i64.const 1 call $f))"#,
            "type mismatch: expected i32, found i64",
        );
    }

    #[test]
    fn start_signature_enforced() {
        assert_error(
            "(module (func $s (param i32)) (start $s))",
            "start function must have signature",
        );
    }

    #[test]
    fn memory_limit_checks() {
        assert_error("(module (memory 2 1))", "initial size exceeds maximum");
        assert_error("(module (memory 65537))", "exceeds 65536 pages");
    }

    #[test]
    fn global_const_expr_rules() {
        assert_error(
            "(module (global i32 (i32.add (i32.const 1) (i32.const 2))))",
            "illegal instruction i32.add in constant expression",
        );
        assert_error(
            "(module (global i32 (f32.const 1)))",
            "must produce exactly one i32",
        );
        // A defined global may not seed another global's initializer.
        assert_error(
            r#"(module
                 (global $a i32 (i32.const 1))
                 (global $b i32 (global.get $a)))"#,
            "may only read imported globals",
        );
    }

    #[test]
    fn const_expr_from_imported_global_ok() {
        let errors = validate_src(
            r#"(module
                 (import "env" "base" (global $base i32))
                 (global i32 (global.get $base)))"#,
        );
        assert!(errors.is_empty(), "{:?}", errors);
    }

    #[test]
    fn strict_rejects_relocatable_offsets() {
        let m = parse_module(
            r#"(module
                 (import "env" "base" (global $base i32))
                 (memory 1)
                 (data (offset global.get $base) "x"))"#,
            "t",
            Features::all(),
            false,
        )
        .unwrap();
        let mut errors = vec![];
        validate_module(&m, Features::all(), true, &mut errors);
        assert!(
            errors.iter().any(|e| e.message.contains("strict mode")),
            "{:?}",
            errors
        );
        errors.clear();
        validate_module(&m, Features::all(), false, &mut errors);
        assert!(errors.is_empty(), "{:?}", errors);
    }

    #[test]
    fn alignment_over_natural_rejected() {
        assert_error(
            "(module (memory 1) (func (i32.load align=8 (i32.const 0)) drop))",
            "alignment must not exceed",
        );
    }

    #[test]
    fn multiple_memories_rejected() {
        // Built by hand; the parser cannot express two memories
        // without tripping its own checks first.
        let mut m = crate::ir::Module::empty("t");
        let limits = crate::ir::Limits { min: 1, max: None };
        m.memories.push(crate::ir::MemoryData { limits });
        m.memories.push(crate::ir::MemoryData { limits });
        let mut errors = vec![];
        validate_module(&m, Features::all(), false, &mut errors);
        assert!(errors.iter().any(|e| e.message.contains("at most one memory")));
    }

    #[test]
    fn link_missing_export() {
        let a = parse_module(
            r#"(module (import "b" "f" (func (param i32))))"#,
            "a",
            Features::all(),
            false,
        )
        .unwrap();
        let b = parse_module("(module)", "b", Features::all(), false).unwrap();
        let modules = vec![a, b];
        let mut map = FxHashMap::default();
        map.insert("a".to_owned(), 0);
        map.insert("b".to_owned(), 1);
        let mut errors = vec![];
        link_environment(
            &modules,
            &map,
            &FxHashSet::default(),
            false,
            &FxHashSet::default(),
            &mut errors,
        );
        assert!(errors[0].message.contains("has no such export"), "{:?}", errors);
    }

    #[test]
    fn link_signature_mismatch() {
        let a = parse_module(
            r#"(module (import "b" "f" (func (param i32))))"#,
            "a",
            Features::all(),
            false,
        )
        .unwrap();
        let b = parse_module(
            r#"(module (func (export "f") (param f64)))"#,
            "b",
            Features::all(),
            false,
        )
        .unwrap();
        let modules = vec![a, b];
        let mut map = FxHashMap::default();
        map.insert("a".to_owned(), 0);
        map.insert("b".to_owned(), 1);
        let mut errors = vec![];
        link_environment(
            &modules,
            &map,
            &FxHashSet::default(),
            false,
            &FxHashSet::default(),
            &mut errors,
        );
        assert!(
            errors[0].message.contains("function signatures differ"),
            "{:?}",
            errors
        );
    }

    #[test]
    fn link_whitelist_violation() {
        let a = parse_module(
            r#"(module (import "env" "missing" (func)))"#,
            "a",
            Features::all(),
            false,
        )
        .unwrap();
        let modules = vec![a];
        let mut map = FxHashMap::default();
        map.insert("a".to_owned(), 0);
        let mut errors = vec![];
        link_environment(
            &modules,
            &map,
            &FxHashSet::default(),
            true,
            &FxHashSet::default(),
            &mut errors,
        );
        assert!(errors[0].message.contains("whitelist violation"), "{:?}", errors);
    }

    #[test]
    fn link_c_import_through_whitelist() {
        let a = parse_module(
            r#"(module (import "env" "puts" (func (param i32))))"#,
            "a",
            Features::all(),
            false,
        )
        .unwrap();
        let modules = vec![a];
        let mut map = FxHashMap::default();
        map.insert("a".to_owned(), 0);
        let mut cimports = FxHashSet::default();
        cimports.insert(crate::backend::canonical_name("env", "puts"));
        let mut whitelist = FxHashSet::default();
        whitelist.insert(crate::backend::canonical_name("env", "puts"));
        let mut errors = vec![];
        link_environment(&modules, &map, &cimports, true, &whitelist, &mut errors);
        assert!(errors.is_empty(), "{:?}", errors);
    }

    #[test]
    fn validation_is_idempotent() {
        let m = parse_module(
            r#"(module (func (result i32) i32.const 1))"#,
            "t",
            Features::all(),
            false,
        )
        .unwrap();
        let mut errors = vec![];
        assert_eq!(validate_module(&m, Features::all(), false, &mut errors), 0);
        assert_eq!(validate_module(&m, Features::all(), false, &mut errors), 0);
        assert!(errors.is_empty());
    }
}
