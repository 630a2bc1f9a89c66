//! Text format parser.
//!
//! Consumes the token stream from `lex` and produces the same IR as
//! the binary decoder. Symbolic `$`-names may be forward references;
//! every lookup that cannot be resolved immediately is queued as a
//! deferred action and drained once the module body has been parsed.
//! Type fields are collected in a pre-pass so function type uses
//! always resolve directly.

use std::convert::TryFrom;

use crate::entity::EntityRef;
use crate::env::Features;
use crate::ir::{
    DataSegment, ElementSegment, ExportKind, Func, FuncDecl, FunctionBody, Global, GlobalData,
    Import, ImportKind, Limits, Local, Memory, MemoryData, Module, Signature, SignatureData,
    Table, TableData, Type,
};
use crate::lex::{self, Token, TokenKind};
use crate::ops::{BlockType, MemArg, Operator};
use anyhow::{anyhow, bail, Result};
use fxhash::FxHashMap;

/// Which per-kind index table a deferred name resolves against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Space {
    Func,
    Table,
    Memory,
    Global,
}

impl Space {
    fn describe(self) -> &'static str {
        match self {
            Space::Func => "function",
            Space::Table => "table",
            Space::Memory => "memory",
            Space::Global => "global",
        }
    }
}

/// Where an unresolved instruction immediate lives.
#[derive(Clone, Copy, Debug)]
enum ExprLoc {
    FuncBody(Func),
    GlobalInit(Global),
    ElemOffset(usize),
    DataOffset(usize),
}

#[derive(Debug)]
enum Slot {
    /// Patch the immediate of the instruction at `index` in `loc`.
    Expr { loc: ExprLoc, index: usize },
    /// Patch `funcs[at]` of element segment `seg`.
    ElemFunc { seg: usize, at: usize },
    /// Patch the export with this name.
    Export { name: String },
    Start,
}

#[derive(Debug)]
struct Deferred {
    space: Space,
    name: String,
    offset: usize,
    slot: Slot,
}

/// An instruction immediate whose name is not yet resolvable; turned
/// into a `Deferred` once the instruction's index is known.
struct PendingRef {
    space: Space,
    name: String,
    offset: usize,
}

/// Parse-time module state: the module under construction plus the
/// per-kind name tables and the deferred-action queue.
struct ModuleCtx {
    m: Module,
    type_names: FxHashMap<String, u32>,
    func_names: FxHashMap<String, u32>,
    table_names: FxHashMap<String, u32>,
    memory_names: FxHashMap<String, u32>,
    global_names: FxHashMap<String, u32>,
    deferred: Vec<Deferred>,
    features: Features,
    keep_names: bool,
}

impl ModuleCtx {
    fn lookup(&self, space: Space, name: &str) -> Option<u32> {
        match space {
            Space::Func => self.func_names.get(name).copied(),
            Space::Table => self.table_names.get(name).copied(),
            Space::Memory => self.memory_names.get(name).copied(),
            Space::Global => self.global_names.get(name).copied(),
        }
    }

    fn has_defined(&self, space: Space) -> bool {
        match space {
            Space::Func => self.m.num_defined_funcs() > 0,
            Space::Table => self.m.tables.len() > self.m.num_imported_tables(),
            Space::Memory => self.m.memories.len() > self.m.num_imported_memories(),
            Space::Global => self.m.globals.len() > self.m.num_imported_globals(),
        }
    }
}

/// Per-expression state while parsing instruction sequences.
struct ExprCtx {
    loc: ExprLoc,
    locals: FxHashMap<String, u32>,
    labels: Vec<Option<String>>,
    insts: Vec<Operator>,
}

impl ExprCtx {
    fn new(loc: ExprLoc) -> ExprCtx {
        ExprCtx {
            loc,
            locals: FxHashMap::default(),
            labels: vec![],
            insts: vec![],
        }
    }
}

struct Parser<'a> {
    src: &'a str,
    toks: Vec<Token<'a>>,
    pos: usize,
}

/// Parse a textual module. `default_name` applies when the module form
/// carries no `$id`. Script-extension forms around the module are
/// recognised and skipped; `(module binary ...)` falls through to the
/// binary decoder.
pub fn parse_module(
    src: &str,
    default_name: &str,
    features: Features,
    keep_names: bool,
) -> Result<Module> {
    let mut p = Parser {
        src,
        toks: lex::tokenize(src),
        pos: 0,
    };
    loop {
        if p.pos >= p.toks.len() {
            bail!("no module found in input");
        }
        let open = p.expect(TokenKind::Open)?;
        match p.peek_kind() {
            Some(TokenKind::Module) => {
                p.next();
                return p.module(default_name, features, keep_names);
            }
            Some(
                TokenKind::Register
                | TokenKind::Invoke
                | TokenKind::Get
                | TokenKind::AssertReturn
                | TokenKind::AssertReturnCanonicalNan
                | TokenKind::AssertReturnArithmeticNan
                | TokenKind::AssertTrap
                | TokenKind::AssertMalformed
                | TokenKind::AssertInvalid
                | TokenKind::AssertUnlinkable
                | TokenKind::AssertExhaustion
                | TokenKind::Script
                | TokenKind::Input
                | TokenKind::Output,
            ) => {
                // Script commands are an external harness's business.
                p.skip_form()?;
            }
            _ => return Err(p.err_at(open, "expected module or script command")),
        }
    }
}

/// Parse from raw bytes, as the environment's loader hands them over.
pub fn parse_bytes(
    bytes: &[u8],
    default_name: &str,
    features: Features,
    keep_names: bool,
) -> Result<Module> {
    let src = std::str::from_utf8(bytes).map_err(|e| anyhow!("module text is not UTF-8: {}", e))?;
    parse_module(src, default_name, features, keep_names)
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<Token<'a>> {
        self.toks.get(self.pos).copied()
    }

    fn peek_kind(&self) -> Option<TokenKind> {
        self.peek().map(|t| t.kind)
    }

    fn peek2_kind(&self) -> Option<TokenKind> {
        self.toks.get(self.pos + 1).map(|t| t.kind)
    }

    fn next(&mut self) -> Option<Token<'a>> {
        let t = self.peek();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn err_at(&self, tok: Token, msg: &str) -> anyhow::Error {
        let (line, col) = lex::line_col(self.src, tok.offset);
        anyhow!("{}:{}: {} (found {:?})", line, col, msg, tok.text)
    }

    fn err_eof(&self, msg: &str) -> anyhow::Error {
        anyhow!("unexpected end of input: {}", msg)
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token<'a>> {
        match self.next() {
            Some(t) if t.kind == kind => Ok(t),
            Some(t) => Err(self.err_at(t, &format!("expected {:?}", kind))),
            None => Err(self.err_eof(&format!("expected {:?}", kind))),
        }
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek_kind() == Some(kind)
    }

    /// `(kind` lookahead for field heads.
    fn at_form(&self, kind: TokenKind) -> bool {
        self.at(TokenKind::Open) && self.peek2_kind() == Some(kind)
    }

    /// Optional `$name` token.
    fn opt_name(&mut self) -> Option<Token<'a>> {
        if self.at(TokenKind::Name) {
            self.next()
        } else {
            None
        }
    }

    /// Skip one balanced form; the opening paren is already consumed.
    fn skip_form(&mut self) -> Result<()> {
        let mut depth = 1usize;
        while depth > 0 {
            match self.next() {
                Some(t) if t.kind == TokenKind::Open => depth += 1,
                Some(t) if t.kind == TokenKind::Close => depth -= 1,
                Some(_) => {}
                None => bail!("unbalanced parentheses at end of input"),
            }
        }
        Ok(())
    }

    fn string(&mut self) -> Result<Vec<u8>> {
        let tok = self.expect(TokenKind::String)?;
        lex::unescape(tok.text).map_err(|e| self.err_at(tok, &e))
    }

    fn u32_imm(&mut self) -> Result<u32> {
        let tok = match self.next() {
            Some(t) if t.kind == TokenKind::Integer => t,
            Some(t) => return Err(self.err_at(t, "expected integer")),
            None => return Err(self.err_eof("expected integer")),
        };
        parse_u32(tok.text).ok_or_else(|| self.err_at(tok, "integer out of range"))
    }

    // === module ===========================================================

    fn module(&mut self, default_name: &str, features: Features, keep_names: bool) -> Result<Module> {
        let id = self.opt_name();
        let name = match id {
            Some(t) => t.text[1..].to_owned(),
            None => default_name.to_owned(),
        };

        // `(module binary "...")` / `(module quote "...")` per the
        // script extension.
        match self.peek_kind() {
            Some(TokenKind::Binary) => {
                self.next();
                let mut bytes = vec![];
                while self.at(TokenKind::String) {
                    bytes.extend(self.string()?);
                }
                self.expect(TokenKind::Close)?;
                return crate::decode::decode_module(&bytes, &name, features, keep_names);
            }
            Some(TokenKind::Quote) => {
                self.next();
                let mut text = vec![];
                while self.at(TokenKind::String) {
                    text.extend(self.string()?);
                }
                self.expect(TokenKind::Close)?;
                return parse_bytes(&text, &name, features, keep_names);
            }
            _ => {}
        }

        let mut mc = ModuleCtx {
            m: Module::empty(&name),
            type_names: FxHashMap::default(),
            func_names: FxHashMap::default(),
            table_names: FxHashMap::default(),
            memory_names: FxHashMap::default(),
            global_names: FxHashMap::default(),
            deferred: vec![],
            features,
            keep_names,
        };

        // Pre-pass: collect explicit type fields so type uses resolve
        // directly; all other fields keep their source order.
        let mut fields = vec![];
        while !self.at(TokenKind::Close) {
            let start = self.pos;
            let open = self.expect(TokenKind::Open)?;
            let head = self
                .peek()
                .ok_or_else(|| self.err_eof("in module field"))?;
            self.skip_form()?;
            if head.kind == TokenKind::Type {
                self.with_range(start, |p| p.type_field(&mut mc))?;
            } else {
                fields.push((start, head));
            }
        }
        let close = self.pos;

        for (start, head) in fields {
            self.with_range(start, |p| p.field(&mut mc, head))?;
        }
        self.pos = close;
        self.expect(TokenKind::Close)?;

        self.drain_deferred(&mut mc)?;
        Ok(mc.m)
    }

    /// Run `f` with the cursor at `start`, then restore it. Used to
    /// revisit field ranges out of source order.
    fn with_range<T>(
        &mut self,
        start: usize,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let saved = self.pos;
        self.pos = start;
        let out = f(self);
        self.pos = saved;
        out
    }

    fn field(&mut self, mc: &mut ModuleCtx, head: Token<'a>) -> Result<()> {
        self.expect(TokenKind::Open)?;
        match head.kind {
            TokenKind::Import => self.import_field(mc),
            TokenKind::Func => self.func_field(mc),
            TokenKind::Table => self.table_field(mc),
            TokenKind::Memory => self.memory_field(mc),
            TokenKind::Global => self.global_field(mc),
            TokenKind::Export => self.export_field(mc),
            TokenKind::Start => self.start_field(mc),
            TokenKind::Elem => self.elem_field(mc),
            TokenKind::Data => self.data_field(mc),
            _ => Err(self.err_at(head, "unexpected module field")),
        }
    }

    // === names and index references =======================================

    fn register_name(
        &self,
        table: &mut FxHashMap<String, u32>,
        tok: Token,
        index: u32,
    ) -> Result<()> {
        let name = tok.text[1..].to_owned();
        if table.insert(name, index).is_some() {
            return Err(self.err_at(tok, "duplicate name in namespace"));
        }
        Ok(())
    }

    /// An index or `$name` reference into `space`. Unresolvable names
    /// are queued with the slot `make_slot` describes.
    fn idx_ref(
        &mut self,
        mc: &mut ModuleCtx,
        space: Space,
        make_slot: impl FnOnce() -> Slot,
    ) -> Result<u32> {
        match self.next() {
            Some(t) if t.kind == TokenKind::Integer => {
                parse_u32(t.text).ok_or_else(|| self.err_at(t, "index out of range"))
            }
            Some(t) if t.kind == TokenKind::Name => {
                let name = &t.text[1..];
                if let Some(idx) = mc.lookup(space, name) {
                    Ok(idx)
                } else {
                    mc.deferred.push(Deferred {
                        space,
                        name: name.to_owned(),
                        offset: t.offset,
                        slot: make_slot(),
                    });
                    // Placeholder; patched when the queue drains.
                    Ok(u32::MAX - 1)
                }
            }
            Some(t) => Err(self.err_at(t, &format!("expected {} index", space.describe()))),
            None => Err(self.err_eof("expected index")),
        }
    }

    /// An index reference that must resolve now (no deferral slot).
    fn idx_now(&mut self, mc: &ModuleCtx, space: Space) -> Result<u32> {
        match self.next() {
            Some(t) if t.kind == TokenKind::Integer => {
                parse_u32(t.text).ok_or_else(|| self.err_at(t, "index out of range"))
            }
            Some(t) if t.kind == TokenKind::Name => mc
                .lookup(space, &t.text[1..])
                .ok_or_else(|| self.err_at(t, &format!("unknown {} name", space.describe()))),
            Some(t) => Err(self.err_at(t, &format!("expected {} index", space.describe()))),
            None => Err(self.err_eof("expected index")),
        }
    }

    // === types ============================================================

    fn value_type(&mut self) -> Result<Type> {
        match self.next() {
            Some(t) => match t.kind {
                TokenKind::I32 => Ok(Type::I32),
                TokenKind::I64 => Ok(Type::I64),
                TokenKind::F32 => Ok(Type::F32),
                TokenKind::F64 => Ok(Type::F64),
                _ => Err(self.err_at(t, "expected value type")),
            },
            None => Err(self.err_eof("expected value type")),
        }
    }

    /// `(type $id? (func (param ...)* (result ...)*))`
    fn type_field(&mut self, mc: &mut ModuleCtx) -> Result<()> {
        self.expect(TokenKind::Open)?;
        self.expect(TokenKind::Type)?;
        let id = self.opt_name();
        self.expect(TokenKind::Open)?;
        self.expect(TokenKind::Func)?;
        let (params, _names) = self.param_list()?;
        let results = self.result_list(mc.features)?;
        self.expect(TokenKind::Close)?;
        self.expect(TokenKind::Close)?;
        let idx = mc.m.signatures.push(SignatureData { params, results });
        if let Some(id) = id {
            self.register_name(&mut mc.type_names, id, idx.as_u32())?;
        }
        Ok(())
    }

    fn param_list(&mut self) -> Result<(Vec<Type>, Vec<Option<String>>)> {
        let mut types = vec![];
        let mut names = vec![];
        while self.at_form(TokenKind::Param) {
            self.next();
            self.next();
            if self.at(TokenKind::Name) {
                let n = self.next().unwrap();
                types.push(self.value_type()?);
                names.push(Some(n.text[1..].to_owned()));
            } else {
                while !self.at(TokenKind::Close) {
                    types.push(self.value_type()?);
                    names.push(None);
                }
            }
            self.expect(TokenKind::Close)?;
        }
        Ok((types, names))
    }

    fn result_list(&mut self, features: Features) -> Result<Vec<Type>> {
        let mut results = vec![];
        while self.at_form(TokenKind::Result) {
            let open = self.next().unwrap();
            self.next();
            while !self.at(TokenKind::Close) {
                results.push(self.value_type()?);
            }
            self.expect(TokenKind::Close)?;
            if results.len() > 1 && !features.contains(Features::MULTI_VALUE) {
                return Err(self.err_at(open, "multiple results require the multi-value feature"));
            }
        }
        Ok(results)
    }

    /// A type use: optional `(type X)` reference plus optional inline
    /// `(param ...)`/`(result ...)` shorthands, de-duplicated against
    /// the explicit type section.
    fn typeuse(&mut self, mc: &mut ModuleCtx) -> Result<(Signature, Vec<Option<String>>)> {
        let mut explicit = None;
        if self.at_form(TokenKind::Type) {
            self.next();
            let kw = self.next().unwrap();
            let idx = match self.next() {
                Some(t) if t.kind == TokenKind::Integer => {
                    parse_u32(t.text).ok_or_else(|| self.err_at(t, "index out of range"))?
                }
                Some(t) if t.kind == TokenKind::Name => mc
                    .type_names
                    .get(&t.text[1..])
                    .copied()
                    .ok_or_else(|| self.err_at(t, "unknown type name"))?,
                Some(t) => return Err(self.err_at(t, "expected type index")),
                None => return Err(self.err_eof("expected type index")),
            };
            self.expect(TokenKind::Close)?;
            if !mc.m.signatures.contains(Signature::new(idx as usize)) {
                return Err(self.err_at(kw, "type index out of range"));
            }
            explicit = Some(Signature::new(idx as usize));
        }

        let (params, names) = self.param_list()?;
        let results = self.result_list(mc.features)?;

        match explicit {
            Some(sig) => {
                if !params.is_empty() || !results.is_empty() {
                    let data = &mc.m.signatures[sig];
                    if data.params != params || data.results != results {
                        bail!(
                            "inline signature does not match referenced type {}",
                            sig.as_u32()
                        );
                    }
                    Ok((sig, names))
                } else {
                    let arity = mc.m.signatures[sig].params.len();
                    Ok((sig, vec![None; arity]))
                }
            }
            None => {
                let sig = mc.m.intern_signature(SignatureData { params, results });
                Ok((sig, names))
            }
        }
    }

    // === import/export plumbing ===========================================

    /// Zero or more inline `(export "n")` abbreviations.
    fn inline_exports(&mut self) -> Result<Vec<String>> {
        let mut out = vec![];
        while self.at_form(TokenKind::Export) && self.toks.get(self.pos + 2).map(|t| t.kind)
            == Some(TokenKind::String)
            && self.toks.get(self.pos + 3).map(|t| t.kind) == Some(TokenKind::Close)
        {
            self.next();
            self.next();
            let name = self.string()?;
            self.expect(TokenKind::Close)?;
            out.push(String::from_utf8(name).map_err(|e| anyhow!("export name not UTF-8: {}", e))?);
        }
        Ok(out)
    }

    fn add_export(&self, mc: &mut ModuleCtx, name: String, kind: ExportKind) -> Result<()> {
        if mc.m.exports.insert(name.clone(), kind).is_some() {
            bail!("duplicate export name {:?}", name);
        }
        Ok(())
    }

    /// Inline `(import "m" "n")` abbreviation, if present.
    fn inline_import(&mut self) -> Result<Option<(String, String)>> {
        if !self.at_form(TokenKind::Import) {
            return Ok(None);
        }
        self.next();
        self.next();
        let module = String::from_utf8(self.string()?)?;
        let name = String::from_utf8(self.string()?)?;
        self.expect(TokenKind::Close)?;
        Ok(Some((module, name)))
    }

    fn check_import_order(&self, mc: &ModuleCtx, space: Space, tok: Token) -> Result<()> {
        if mc.has_defined(space) {
            return Err(self.err_at(tok, "import after definition of the same kind"));
        }
        Ok(())
    }

    /// `(import "m" "n" (func|table|memory|global ...))`
    fn import_field(&mut self, mc: &mut ModuleCtx) -> Result<()> {
        let kw = self.expect(TokenKind::Import)?;
        let module = String::from_utf8(self.string()?)?;
        let name = String::from_utf8(self.string()?)?;
        self.expect(TokenKind::Open)?;
        let head = self.next().ok_or_else(|| self.err_eof("in import"))?;
        let kind = match head.kind {
            TokenKind::Func => {
                self.check_import_order(mc, Space::Func, kw)?;
                let id = self.opt_name();
                let (sig, _) = self.typeuse(mc)?;
                let f = mc.m.funcs.push(FuncDecl::Import(sig));
                if let Some(id) = id {
                    self.register_name(&mut mc.func_names, id, f.as_u32())?;
                }
                ImportKind::Func(f)
            }
            TokenKind::Table => {
                self.check_import_order(mc, Space::Table, kw)?;
                let id = self.opt_name();
                let limits = self.limits()?;
                self.expect(TokenKind::Funcref)?;
                let t = mc.m.tables.push(TableData { limits });
                if let Some(id) = id {
                    self.register_name(&mut mc.table_names, id, t.as_u32())?;
                }
                ImportKind::Table(t)
            }
            TokenKind::Memory => {
                self.check_import_order(mc, Space::Memory, kw)?;
                let id = self.opt_name();
                let limits = self.limits()?;
                let m = mc.m.memories.push(MemoryData { limits });
                if let Some(id) = id {
                    self.register_name(&mut mc.memory_names, id, m.as_u32())?;
                }
                ImportKind::Memory(m)
            }
            TokenKind::Global => {
                self.check_import_order(mc, Space::Global, kw)?;
                let id = self.opt_name();
                let (ty, mutable) = self.global_type()?;
                let g = mc.m.globals.push(GlobalData {
                    ty,
                    mutable,
                    init: vec![],
                });
                if let Some(id) = id {
                    self.register_name(&mut mc.global_names, id, g.as_u32())?;
                }
                ImportKind::Global(g)
            }
            _ => return Err(self.err_at(head, "expected import descriptor")),
        };
        self.expect(TokenKind::Close)?;
        self.expect(TokenKind::Close)?;
        mc.m.imports.push(Import { module, name, kind });
        Ok(())
    }

    // === functions ========================================================

    fn func_field(&mut self, mc: &mut ModuleCtx) -> Result<()> {
        let kw = self.expect(TokenKind::Func)?;
        let id = self.opt_name();
        let this = mc.m.funcs.next_idx();
        if let Some(id) = id {
            self.register_name(&mut mc.func_names, id, this.as_u32())?;
            if mc.keep_names {
                mc.m.func_names.insert(this, id.text[1..].to_owned());
            }
        }

        let exports = self.inline_exports()?;
        for name in exports {
            self.add_export(mc, name, ExportKind::Func(this))?;
        }

        if let Some((module, name)) = self.inline_import()? {
            self.check_import_order(mc, Space::Func, kw)?;
            let (sig, _) = self.typeuse(mc)?;
            self.expect(TokenKind::Close)?;
            let f = mc.m.funcs.push(FuncDecl::Import(sig));
            debug_assert_eq!(f, this);
            mc.m.imports.push(Import {
                module,
                name,
                kind: ImportKind::Func(f),
            });
            return Ok(());
        }

        let (sig, param_names) = self.typeuse(mc)?;
        let mut ec = ExprCtx::new(ExprLoc::FuncBody(this));
        for (i, name) in param_names.iter().enumerate() {
            if let Some(name) = name {
                if ec.locals.insert(name.clone(), i as u32).is_some() {
                    bail!("duplicate local name ${}", name);
                }
            }
        }

        // Declared locals follow the type use and precede the body.
        let nparams = mc.m.signatures[sig].params.len() as u32;
        let mut local_types: Vec<Type> = vec![];
        while self.at_form(TokenKind::Local) {
            self.next();
            self.next();
            if self.at(TokenKind::Name) {
                let n = self.next().unwrap();
                let ty = self.value_type()?;
                let idx = nparams + local_types.len() as u32;
                if ec.locals.insert(n.text[1..].to_owned(), idx).is_some() {
                    return Err(self.err_at(n, "duplicate local name"));
                }
                local_types.push(ty);
            } else {
                while !self.at(TokenKind::Close) {
                    local_types.push(self.value_type()?);
                }
            }
            self.expect(TokenKind::Close)?;
        }

        self.instr_seq(mc, &mut ec)?;
        self.expect(TokenKind::Close)?;
        if !ec.labels.is_empty() {
            bail!("unclosed block in function body");
        }

        let body = FunctionBody {
            locals: run_length(&local_types),
            insts: ec.insts,
        };
        let f = mc.m.funcs.push(FuncDecl::Body(sig, body));
        debug_assert_eq!(f, this);
        Ok(())
    }

    // === other fields =====================================================

    fn limits(&mut self) -> Result<Limits> {
        let min = self.u32_imm()?;
        let max = if self.at(TokenKind::Integer) {
            Some(self.u32_imm()?)
        } else {
            None
        };
        Ok(Limits { min, max })
    }

    fn table_field(&mut self, mc: &mut ModuleCtx) -> Result<()> {
        let kw = self.expect(TokenKind::Table)?;
        let id = self.opt_name();
        let this = mc.m.tables.next_idx();
        if let Some(id) = id {
            self.register_name(&mut mc.table_names, id, this.as_u32())?;
        }
        let exports = self.inline_exports()?;
        for name in exports {
            self.add_export(mc, name, ExportKind::Table(this))?;
        }
        if let Some((module, name)) = self.inline_import()? {
            self.check_import_order(mc, Space::Table, kw)?;
            let limits = self.limits()?;
            self.expect(TokenKind::Funcref)?;
            self.expect(TokenKind::Close)?;
            let t = mc.m.tables.push(TableData { limits });
            mc.m.imports.push(Import {
                module,
                name,
                kind: ImportKind::Table(t),
            });
            return Ok(());
        }
        let limits = self.limits()?;
        self.expect(TokenKind::Funcref)?;
        self.expect(TokenKind::Close)?;
        mc.m.tables.push(TableData { limits });
        Ok(())
    }

    fn memory_field(&mut self, mc: &mut ModuleCtx) -> Result<()> {
        let kw = self.expect(TokenKind::Memory)?;
        let id = self.opt_name();
        let this = mc.m.memories.next_idx();
        if let Some(id) = id {
            self.register_name(&mut mc.memory_names, id, this.as_u32())?;
        }
        let exports = self.inline_exports()?;
        for name in exports {
            self.add_export(mc, name, ExportKind::Memory(this))?;
        }
        if let Some((module, name)) = self.inline_import()? {
            self.check_import_order(mc, Space::Memory, kw)?;
            let limits = self.limits()?;
            self.expect(TokenKind::Close)?;
            let m = mc.m.memories.push(MemoryData { limits });
            mc.m.imports.push(Import {
                module,
                name,
                kind: ImportKind::Memory(m),
            });
            return Ok(());
        }
        let limits = self.limits()?;
        self.expect(TokenKind::Close)?;
        mc.m.memories.push(MemoryData { limits });
        Ok(())
    }

    fn global_type(&mut self) -> Result<(Type, bool)> {
        if self.at_form(TokenKind::Mut) {
            self.next();
            self.next();
            let ty = self.value_type()?;
            self.expect(TokenKind::Close)?;
            Ok((ty, true))
        } else {
            Ok((self.value_type()?, false))
        }
    }

    fn global_field(&mut self, mc: &mut ModuleCtx) -> Result<()> {
        let kw = self.expect(TokenKind::Global)?;
        let id = self.opt_name();
        let this = mc.m.globals.next_idx();
        if let Some(id) = id {
            self.register_name(&mut mc.global_names, id, this.as_u32())?;
        }
        let exports = self.inline_exports()?;
        for name in exports {
            self.add_export(mc, name, ExportKind::Global(this))?;
        }
        if let Some((module, name)) = self.inline_import()? {
            self.check_import_order(mc, Space::Global, kw)?;
            let (ty, mutable) = self.global_type()?;
            self.expect(TokenKind::Close)?;
            let g = mc.m.globals.push(GlobalData {
                ty,
                mutable,
                init: vec![],
            });
            mc.m.imports.push(Import {
                module,
                name,
                kind: ImportKind::Global(g),
            });
            return Ok(());
        }
        let (ty, mutable) = self.global_type()?;
        let mut ec = ExprCtx::new(ExprLoc::GlobalInit(this));
        self.instr_seq(mc, &mut ec)?;
        self.expect(TokenKind::Close)?;
        mc.m.globals.push(GlobalData {
            ty,
            mutable,
            init: ec.insts,
        });
        Ok(())
    }

    fn export_field(&mut self, mc: &mut ModuleCtx) -> Result<()> {
        self.expect(TokenKind::Export)?;
        let name = String::from_utf8(self.string()?)?;
        self.expect(TokenKind::Open)?;
        let head = self.next().ok_or_else(|| self.err_eof("in export"))?;
        let (space, make): (Space, fn(u32) -> ExportKind) = match head.kind {
            TokenKind::Func => (Space::Func, |i| ExportKind::Func(Func::new(i as usize))),
            TokenKind::Table => (Space::Table, |i| ExportKind::Table(Table::new(i as usize))),
            TokenKind::Memory => (Space::Memory, |i| {
                ExportKind::Memory(Memory::new(i as usize))
            }),
            TokenKind::Global => (Space::Global, |i| {
                ExportKind::Global(Global::new(i as usize))
            }),
            _ => return Err(self.err_at(head, "expected export descriptor")),
        };
        let export_name = name.clone();
        let idx = self.idx_ref(mc, space, move || Slot::Export { name: export_name })?;
        self.expect(TokenKind::Close)?;
        self.expect(TokenKind::Close)?;
        self.add_export(mc, name, make(idx))?;
        Ok(())
    }

    fn start_field(&mut self, mc: &mut ModuleCtx) -> Result<()> {
        self.expect(TokenKind::Start)?;
        let idx = self.idx_ref(mc, Space::Func, || Slot::Start)?;
        self.expect(TokenKind::Close)?;
        mc.m.start = Some(Func::new(idx as usize));
        Ok(())
    }

    /// `(elem tableidx? (offset expr)|foldedexpr funcidx*)`
    fn elem_field(&mut self, mc: &mut ModuleCtx) -> Result<()> {
        self.expect(TokenKind::Elem)?;
        let table = if self.at(TokenKind::Integer) || self.at(TokenKind::Name) {
            Table::new(self.idx_now(mc, Space::Table)? as usize)
        } else {
            Table::new(0)
        };
        let seg = mc.m.elements.len();
        let offset = self.offset_expr(mc, ExprLoc::ElemOffset(seg))?;
        let mut funcs = vec![];
        while !self.at(TokenKind::Close) {
            let at = funcs.len();
            let idx = self.idx_ref(mc, Space::Func, || Slot::ElemFunc { seg, at })?;
            funcs.push(Func::new(idx as usize));
        }
        self.expect(TokenKind::Close)?;
        mc.m.elements.push(ElementSegment {
            table,
            offset,
            funcs,
        });
        Ok(())
    }

    /// `(data memidx? (offset expr)|foldedexpr "bytes"*)`
    fn data_field(&mut self, mc: &mut ModuleCtx) -> Result<()> {
        self.expect(TokenKind::Data)?;
        let memory = if self.at(TokenKind::Integer) || self.at(TokenKind::Name) {
            Memory::new(self.idx_now(mc, Space::Memory)? as usize)
        } else {
            Memory::new(0)
        };
        let seg = mc.m.data.len();
        let offset = self.offset_expr(mc, ExprLoc::DataOffset(seg))?;
        let mut data = vec![];
        while self.at(TokenKind::String) {
            data.extend(self.string()?);
        }
        self.expect(TokenKind::Close)?;
        mc.m.data.push(DataSegment {
            memory,
            offset,
            data,
        });
        Ok(())
    }

    /// Either `(offset instr*)` or a single folded instruction.
    fn offset_expr(&mut self, mc: &mut ModuleCtx, loc: ExprLoc) -> Result<Vec<Operator>> {
        let mut ec = ExprCtx::new(loc);
        if self.at_form(TokenKind::Offset) {
            self.next();
            self.next();
            self.instr_seq(mc, &mut ec)?;
            self.expect(TokenKind::Close)?;
        } else {
            self.folded(mc, &mut ec)?;
        }
        Ok(ec.insts)
    }

    // === instructions =====================================================

    fn instr_seq(&mut self, mc: &mut ModuleCtx, ec: &mut ExprCtx) -> Result<()> {
        loop {
            match self.peek_kind() {
                None => return Err(self.err_eof("in instruction sequence")),
                Some(TokenKind::Close) => return Ok(()),
                Some(TokenKind::Open) => self.folded(mc, ec)?,
                Some(TokenKind::Block) | Some(TokenKind::Loop) | Some(TokenKind::If) => {
                    let kw = self.next().unwrap();
                    let label = self.opt_name().map(|t| t.text[1..].to_owned());
                    let ty = self.block_type(mc)?;
                    ec.labels.push(label);
                    ec.insts.push(match kw.kind {
                        TokenKind::Block => Operator::Block { ty },
                        TokenKind::Loop => Operator::Loop { ty },
                        _ => Operator::If { ty },
                    });
                }
                Some(TokenKind::Else) => {
                    let tok = self.next().unwrap();
                    if ec.labels.is_empty() {
                        return Err(self.err_at(tok, "else outside a block"));
                    }
                    self.check_trailing_label(ec)?;
                    ec.insts.push(Operator::Else);
                }
                Some(TokenKind::End) => {
                    let tok = self.next().unwrap();
                    let label = match ec.labels.pop() {
                        Some(label) => label,
                        None => return Err(self.err_at(tok, "mismatched end")),
                    };
                    // A trailing label must match the block's.
                    if self.at(TokenKind::Name) {
                        let t = self.next().unwrap();
                        if label.as_deref() != Some(&t.text[1..]) {
                            return Err(self.err_at(t, "label does not match enclosing block"));
                        }
                    }
                    ec.insts.push(Operator::End);
                }
                Some(_) => {
                    let (op, pending) = self.plain_op(mc, ec)?;
                    self.push_op(mc, ec, op, pending);
                }
            }
        }
    }

    /// Append an instruction, registering its unresolved name (if
    /// any) against the final instruction index.
    fn push_op(
        &self,
        mc: &mut ModuleCtx,
        ec: &mut ExprCtx,
        op: Operator,
        pending: Option<PendingRef>,
    ) {
        let index = ec.insts.len();
        ec.insts.push(op);
        if let Some(p) = pending {
            mc.deferred.push(Deferred {
                space: p.space,
                name: p.name,
                offset: p.offset,
                slot: Slot::Expr { loc: ec.loc, index },
            });
        }
    }

    fn check_trailing_label(&mut self, ec: &ExprCtx) -> Result<()> {
        if self.at(TokenKind::Name) {
            let t = self.next().unwrap();
            let want = ec.labels.last().and_then(|l| l.as_deref());
            if want != Some(&t.text[1..]) {
                return Err(self.err_at(t, "label does not match enclosing block"));
            }
        }
        Ok(())
    }

    /// A folded instruction: `(op operands...)`, `(block ...)`,
    /// `(loop ...)` or `(if ...)`. Expanded depth-first into the
    /// linear sequence.
    fn folded(&mut self, mc: &mut ModuleCtx, ec: &mut ExprCtx) -> Result<()> {
        self.expect(TokenKind::Open)?;
        let head = self.peek().ok_or_else(|| self.err_eof("in folded instruction"))?;
        match head.kind {
            TokenKind::Block | TokenKind::Loop => {
                self.next();
                let label = self.opt_name().map(|t| t.text[1..].to_owned());
                let ty = self.block_type(mc)?;
                ec.labels.push(label);
                ec.insts.push(if head.kind == TokenKind::Block {
                    Operator::Block { ty }
                } else {
                    Operator::Loop { ty }
                });
                self.instr_seq(mc, ec)?;
                self.expect(TokenKind::Close)?;
                ec.labels.pop();
                ec.insts.push(Operator::End);
                Ok(())
            }
            TokenKind::If => {
                self.next();
                let label = self.opt_name().map(|t| t.text[1..].to_owned());
                let ty = self.block_type(mc)?;
                // Condition: folded instructions up to `(then`.
                while self.at(TokenKind::Open) && self.peek2_kind() != Some(TokenKind::Then) {
                    self.folded(mc, ec)?;
                }
                ec.labels.push(label);
                ec.insts.push(Operator::If { ty });
                self.expect(TokenKind::Open)?;
                self.expect(TokenKind::Then)?;
                self.instr_seq(mc, ec)?;
                self.expect(TokenKind::Close)?;
                if self.at_form(TokenKind::Else) {
                    self.next();
                    self.next();
                    ec.insts.push(Operator::Else);
                    self.instr_seq(mc, ec)?;
                    self.expect(TokenKind::Close)?;
                }
                ec.labels.pop();
                ec.insts.push(Operator::End);
                self.expect(TokenKind::Close)?;
                Ok(())
            }
            _ => {
                let (op, pending) = self.plain_op(mc, ec)?;
                while self.at(TokenKind::Open) {
                    self.folded(mc, ec)?;
                }
                self.expect(TokenKind::Close)?;
                self.push_op(mc, ec, op, pending);
                Ok(())
            }
        }
    }

    /// Optional block signature: `(result t)` shorthands, or a
    /// `(type N)` reference when multi-value is enabled.
    fn block_type(&mut self, mc: &mut ModuleCtx) -> Result<BlockType> {
        if self.at_form(TokenKind::Type) {
            let (sig, _) = self.typeuse(mc)?;
            let data = &mc.m.signatures[sig];
            if data.params.is_empty() && data.results.len() <= 1 {
                return Ok(match data.results.first() {
                    None => BlockType::Empty,
                    Some(&t) => BlockType::Value(t),
                });
            }
            if !mc.features.contains(Features::MULTI_VALUE) {
                bail!("block type with multiple values requires the multi-value feature");
            }
            return Ok(BlockType::Sig(sig));
        }
        if self.at_form(TokenKind::Result) {
            let results = self.result_list(mc.features)?;
            match results.len() {
                0 => Ok(BlockType::Empty),
                1 => Ok(BlockType::Value(results[0])),
                _ => Ok(BlockType::Sig(mc.m.intern_signature(SignatureData {
                    params: vec![],
                    results,
                }))),
            }
        } else {
            Ok(BlockType::Empty)
        }
    }

    fn label_ref(&mut self, ec: &ExprCtx) -> Result<u32> {
        match self.next() {
            Some(t) if t.kind == TokenKind::Integer => {
                parse_u32(t.text).ok_or_else(|| self.err_at(t, "label out of range"))
            }
            Some(t) if t.kind == TokenKind::Name => {
                let name = &t.text[1..];
                for (depth, label) in ec.labels.iter().rev().enumerate() {
                    if label.as_deref() == Some(name) {
                        return Ok(depth as u32);
                    }
                }
                Err(self.err_at(t, "unknown label"))
            }
            Some(t) => Err(self.err_at(t, "expected label")),
            None => Err(self.err_eof("expected label")),
        }
    }

    fn local_ref(&mut self, ec: &ExprCtx) -> Result<Local> {
        match self.next() {
            Some(t) if t.kind == TokenKind::Integer => Ok(Local::new(
                parse_u32(t.text).ok_or_else(|| self.err_at(t, "local index out of range"))?
                    as usize,
            )),
            Some(t) if t.kind == TokenKind::Name => ec
                .locals
                .get(&t.text[1..])
                .map(|&i| Local::new(i as usize))
                .ok_or_else(|| self.err_at(t, "unknown local name")),
            Some(t) => Err(self.err_at(t, "expected local index")),
            None => Err(self.err_eof("expected local index")),
        }
    }

    /// `offset=` / `align=` immediates; align is stored as its log2.
    fn memarg(&mut self, natural_align: u32) -> Result<MemArg> {
        let mut offset = 0;
        let mut align = natural_align;
        if self.at(TokenKind::Offset) && self.peek().unwrap().text.starts_with("offset=") {
            let t = self.next().unwrap();
            offset = parse_u32(&t.text["offset=".len()..])
                .ok_or_else(|| self.err_at(t, "offset out of range"))?;
        }
        if self.at(TokenKind::Align) && self.peek().unwrap().text.starts_with("align=") {
            let t = self.next().unwrap();
            let value = parse_u32(&t.text["align=".len()..])
                .ok_or_else(|| self.err_at(t, "alignment out of range"))?;
            if value == 0 || !value.is_power_of_two() {
                return Err(self.err_at(t, "alignment must be a power of two"));
            }
            align = value.trailing_zeros();
        }
        Ok(MemArg { align, offset })
    }

    /// A plain (non-folded, non-block) instruction: mnemonic plus
    /// immediates. A name immediate that cannot be resolved yet comes
    /// back as a pending reference for the caller to queue once the
    /// instruction has its final index.
    fn plain_op(
        &mut self,
        mc: &mut ModuleCtx,
        ec: &mut ExprCtx,
    ) -> Result<(Operator, Option<PendingRef>)> {
        let tok = self.next().ok_or_else(|| self.err_eof("expected instruction"))?;
        if tok.kind != TokenKind::Operator {
            return Err(self.err_at(tok, "expected instruction"));
        }
        let word = tok.text;

        if let Some(op) = simple_op(word) {
            match op {
                Operator::I32Extend8S
                | Operator::I32Extend16S
                | Operator::I64Extend8S
                | Operator::I64Extend16S
                | Operator::I64Extend32S
                    if !mc.features.contains(Features::SIGN_EXT) =>
                {
                    return Err(self.err_at(tok, "operator requires the sign-extension feature"));
                }
                _ => {}
            }
            return Ok((op, None));
        }

        let mut pending = None;
        let op = match word {
            "call" => {
                let idx = self.expr_ref(mc, Space::Func, &mut pending)?;
                Operator::Call {
                    function_index: Func::new(idx as usize),
                }
            }
            "call_indirect" => {
                let (sig, _) = self.typeuse(mc)?;
                Operator::CallIndirect {
                    sig_index: sig,
                    table_index: Table::new(0),
                }
            }
            "local.get" => Operator::LocalGet {
                local_index: self.local_ref(ec)?,
            },
            "local.set" => Operator::LocalSet {
                local_index: self.local_ref(ec)?,
            },
            "local.tee" => Operator::LocalTee {
                local_index: self.local_ref(ec)?,
            },
            "global.get" => {
                let idx = self.expr_ref(mc, Space::Global, &mut pending)?;
                Operator::GlobalGet {
                    global_index: Global::new(idx as usize),
                }
            }
            "global.set" => {
                let idx = self.expr_ref(mc, Space::Global, &mut pending)?;
                Operator::GlobalSet {
                    global_index: Global::new(idx as usize),
                }
            }
            "br" => Operator::Br {
                depth: self.label_ref(ec)?,
            },
            "br_if" => Operator::BrIf {
                depth: self.label_ref(ec)?,
            },
            "br_table" => {
                let mut targets = vec![self.label_ref(ec)?];
                while self.at(TokenKind::Integer) || self.at(TokenKind::Name) {
                    targets.push(self.label_ref(ec)?);
                }
                let default = targets.pop().unwrap();
                Operator::BrTable { targets, default }
            }
            "memory.size" => Operator::MemorySize {
                mem: Memory::new(0),
            },
            "memory.grow" => Operator::MemoryGrow {
                mem: Memory::new(0),
            },
            "i32.const" => Operator::I32Const {
                value: self.i32_imm()?,
            },
            "i64.const" => Operator::I64Const {
                value: self.i64_imm()?,
            },
            "f32.const" => Operator::F32Const {
                bits: self.f32_imm()?,
            },
            "f64.const" => Operator::F64Const {
                bits: self.f64_imm()?,
            },
            _ => {
                if let Some(make) = mem_op_ctor(word) {
                    let natural = make(MemArg { align: 0, offset: 0 }).natural_align();
                    let arg = self.memarg(natural)?;
                    make(arg)
                } else {
                    return Err(self.err_at(tok, "unknown operator"));
                }
            }
        };
        Ok((op, pending))
    }

    /// An index or name immediate inside an expression. Unresolved
    /// names come back through `pending` with a placeholder index.
    fn expr_ref(
        &mut self,
        mc: &ModuleCtx,
        space: Space,
        pending: &mut Option<PendingRef>,
    ) -> Result<u32> {
        match self.next() {
            Some(t) if t.kind == TokenKind::Integer => {
                parse_u32(t.text).ok_or_else(|| self.err_at(t, "index out of range"))
            }
            Some(t) if t.kind == TokenKind::Name => {
                let name = &t.text[1..];
                if let Some(idx) = mc.lookup(space, name) {
                    Ok(idx)
                } else {
                    *pending = Some(PendingRef {
                        space,
                        name: name.to_owned(),
                        offset: t.offset,
                    });
                    Ok(u32::MAX - 1)
                }
            }
            Some(t) => Err(self.err_at(t, &format!("expected {} index", space.describe()))),
            None => Err(self.err_eof("expected index")),
        }
    }

    fn i32_imm(&mut self) -> Result<i32> {
        let tok = match self.next() {
            Some(t) if t.kind == TokenKind::Integer => t,
            Some(t) => return Err(self.err_at(t, "expected integer constant")),
            None => return Err(self.err_eof("expected integer constant")),
        };
        parse_i32(tok.text).ok_or_else(|| self.err_at(tok, "i32 constant out of range"))
    }

    fn i64_imm(&mut self) -> Result<i64> {
        let tok = match self.next() {
            Some(t) if t.kind == TokenKind::Integer => t,
            Some(t) => return Err(self.err_at(t, "expected integer constant")),
            None => return Err(self.err_eof("expected integer constant")),
        };
        parse_i64(tok.text).ok_or_else(|| self.err_at(tok, "i64 constant out of range"))
    }

    fn f32_imm(&mut self) -> Result<u32> {
        let tok = match self.next() {
            Some(t) if matches!(t.kind, TokenKind::Float | TokenKind::Integer) => t,
            Some(t) => return Err(self.err_at(t, "expected float constant")),
            None => return Err(self.err_eof("expected float constant")),
        };
        parse_f32(tok.text).ok_or_else(|| self.err_at(tok, "malformed float constant"))
    }

    fn f64_imm(&mut self) -> Result<u64> {
        let tok = match self.next() {
            Some(t) if matches!(t.kind, TokenKind::Float | TokenKind::Integer) => t,
            Some(t) => return Err(self.err_at(t, "expected float constant")),
            None => return Err(self.err_eof("expected float constant")),
        };
        parse_f64(tok.text).ok_or_else(|| self.err_at(tok, "malformed float constant"))
    }

    // === deferred actions =================================================

    fn drain_deferred(&mut self, mc: &mut ModuleCtx) -> Result<()> {
        let deferred = std::mem::take(&mut mc.deferred);
        for d in deferred {
            let idx = match mc.lookup(d.space, &d.name) {
                Some(idx) => idx,
                None => {
                    let (line, col) = lex::line_col(self.src, d.offset);
                    bail!(
                        "{}:{}: unknown {} name ${}",
                        line,
                        col,
                        d.space.describe(),
                        d.name
                    );
                }
            };
            match d.slot {
                Slot::Expr { loc, index } => {
                    let insts: &mut Vec<Operator> = match loc {
                        ExprLoc::FuncBody(f) => {
                            &mut mc.m.funcs[f]
                                .body_mut()
                                .expect("deferred slot in import")
                                .insts
                        }
                        ExprLoc::GlobalInit(g) => &mut mc.m.globals[g].init,
                        ExprLoc::ElemOffset(seg) => &mut mc.m.elements[seg].offset,
                        ExprLoc::DataOffset(seg) => &mut mc.m.data[seg].offset,
                    };
                    match &mut insts[index] {
                        Operator::Call { function_index } => {
                            *function_index = Func::new(idx as usize)
                        }
                        Operator::GlobalGet { global_index }
                        | Operator::GlobalSet { global_index } => {
                            *global_index = Global::new(idx as usize)
                        }
                        op => unreachable!("deferred fixup on {:?}", op),
                    }
                }
                Slot::ElemFunc { seg, at } => {
                    mc.m.elements[seg].funcs[at] = Func::new(idx as usize);
                }
                Slot::Export { name } => {
                    let patched = match d.space {
                        Space::Func => ExportKind::Func(Func::new(idx as usize)),
                        Space::Table => ExportKind::Table(Table::new(idx as usize)),
                        Space::Memory => ExportKind::Memory(Memory::new(idx as usize)),
                        Space::Global => ExportKind::Global(Global::new(idx as usize)),
                    };
                    let kind = mc.m.exports.get_mut(&name).expect("deferred export");
                    *kind = patched;
                }
                Slot::Start => {
                    mc.m.start = Some(Func::new(idx as usize));
                }
            }
        }
        Ok(())
    }
}

/// Collapse a flat list of local types into (count, type) groups.
fn run_length(types: &[Type]) -> Vec<(u32, Type)> {
    let mut out: Vec<(u32, Type)> = vec![];
    for &ty in types {
        match out.last_mut() {
            Some((count, last)) if *last == ty => *count += 1,
            _ => out.push((1, ty)),
        }
    }
    out
}

// === numeric literals =====================================================

fn strip_underscores(text: &str) -> std::borrow::Cow<str> {
    if text.contains('_') {
        text.replace('_', "").into()
    } else {
        text.into()
    }
}

/// Unsigned magnitude of an integer literal, decimal or hex.
fn parse_magnitude(text: &str) -> Option<u128> {
    let text = strip_underscores(text);
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u128::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

fn parse_u32(text: &str) -> Option<u32> {
    if text.starts_with('-') || text.starts_with('+') {
        return None;
    }
    let v = parse_magnitude(text)?;
    u32::try_from(v).ok()
}

/// i32 constants accept both signed and unsigned spellings.
fn parse_i32(text: &str) -> Option<i32> {
    let (neg, rest) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let mag = parse_magnitude(rest)?;
    if neg {
        if mag > 1 << 31 {
            return None;
        }
        Some((mag as i64).wrapping_neg() as i32)
    } else {
        if mag > u32::MAX as u128 {
            return None;
        }
        Some(mag as u32 as i32)
    }
}

fn parse_i64(text: &str) -> Option<i64> {
    let (neg, rest) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let mag = parse_magnitude(rest)?;
    if neg {
        if mag > 1 << 63 {
            return None;
        }
        Some((mag as i128).wrapping_neg() as i64)
    } else {
        if mag > u64::MAX as u128 {
            return None;
        }
        Some(mag as u64 as i64)
    }
}

/// A float literal: decimal or hex mantissa, `inf`, `nan`,
/// `nan:0x...`, `nan:canonical`, `nan:arithmetic`.
fn parse_f64(text: &str) -> Option<u64> {
    let (neg, rest) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let sign = if neg { 1u64 << 63 } else { 0 };
    if rest == "inf" {
        return Some(sign | f64::INFINITY.to_bits());
    }
    if rest == "nan" || rest == "nan:canonical" || rest == "nan:arithmetic" {
        return Some(sign | 0x7FF8_0000_0000_0000);
    }
    if let Some(payload) = rest.strip_prefix("nan:0x") {
        let payload = u64::from_str_radix(&strip_underscores(payload), 16).ok()?;
        if payload == 0 || payload > 0xF_FFFF_FFFF_FFFF {
            return None;
        }
        return Some(sign | 0x7FF0_0000_0000_0000 | payload);
    }
    let rest = strip_underscores(rest);
    let magnitude = if let Some(hex) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
        parse_hex_float(hex)?
    } else {
        rest.parse::<f64>().ok()?
    };
    Some(sign | magnitude.to_bits())
}

fn parse_f32(text: &str) -> Option<u32> {
    let (neg, rest) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let sign = if neg { 1u32 << 31 } else { 0 };
    if rest == "inf" {
        return Some(sign | f32::INFINITY.to_bits());
    }
    if rest == "nan" || rest == "nan:canonical" || rest == "nan:arithmetic" {
        return Some(sign | 0x7FC0_0000);
    }
    if let Some(payload) = rest.strip_prefix("nan:0x") {
        let payload = u32::from_str_radix(&strip_underscores(payload), 16).ok()?;
        if payload == 0 || payload > 0x7F_FFFF {
            return None;
        }
        return Some(sign | 0x7F80_0000 | payload);
    }
    let bits64 = parse_f64(rest)?;
    Some(sign | (f64::from_bits(bits64) as f32).to_bits())
}

/// Hexadecimal float: `HH.HH?p±E`, value = mantissa * 2^exp.
fn parse_hex_float(text: &str) -> Option<f64> {
    let (mantissa, exp) = match text.split_once(|c| c == 'p' || c == 'P') {
        Some((m, e)) => (m, e.parse::<i32>().ok()?),
        None => (text, 0),
    };
    let (int_part, frac_part) = match mantissa.split_once('.') {
        Some((i, f)) => (i, f),
        None => (mantissa, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    let mut value = 0f64;
    for c in int_part.chars() {
        value = value * 16.0 + c.to_digit(16)? as f64;
    }
    let mut scale = 1.0 / 16.0;
    for c in frac_part.chars() {
        value += c.to_digit(16)? as f64 * scale;
        scale /= 16.0;
    }
    Some(value * 2f64.powi(exp))
}

/// Operators with no immediates.
fn simple_op(word: &str) -> Option<Operator> {
    use Operator::*;
    Some(match word {
        "unreachable" => Unreachable,
        "nop" => Nop,
        "return" => Return,
        "drop" => Drop,
        "select" => Select,
        "i32.eqz" => I32Eqz,
        "i32.eq" => I32Eq,
        "i32.ne" => I32Ne,
        "i32.lt_s" => I32LtS,
        "i32.lt_u" => I32LtU,
        "i32.gt_s" => I32GtS,
        "i32.gt_u" => I32GtU,
        "i32.le_s" => I32LeS,
        "i32.le_u" => I32LeU,
        "i32.ge_s" => I32GeS,
        "i32.ge_u" => I32GeU,
        "i64.eqz" => I64Eqz,
        "i64.eq" => I64Eq,
        "i64.ne" => I64Ne,
        "i64.lt_s" => I64LtS,
        "i64.lt_u" => I64LtU,
        "i64.gt_s" => I64GtS,
        "i64.gt_u" => I64GtU,
        "i64.le_s" => I64LeS,
        "i64.le_u" => I64LeU,
        "i64.ge_s" => I64GeS,
        "i64.ge_u" => I64GeU,
        "f32.eq" => F32Eq,
        "f32.ne" => F32Ne,
        "f32.lt" => F32Lt,
        "f32.gt" => F32Gt,
        "f32.le" => F32Le,
        "f32.ge" => F32Ge,
        "f64.eq" => F64Eq,
        "f64.ne" => F64Ne,
        "f64.lt" => F64Lt,
        "f64.gt" => F64Gt,
        "f64.le" => F64Le,
        "f64.ge" => F64Ge,
        "i32.clz" => I32Clz,
        "i32.ctz" => I32Ctz,
        "i32.popcnt" => I32Popcnt,
        "i32.add" => I32Add,
        "i32.sub" => I32Sub,
        "i32.mul" => I32Mul,
        "i32.div_s" => I32DivS,
        "i32.div_u" => I32DivU,
        "i32.rem_s" => I32RemS,
        "i32.rem_u" => I32RemU,
        "i32.and" => I32And,
        "i32.or" => I32Or,
        "i32.xor" => I32Xor,
        "i32.shl" => I32Shl,
        "i32.shr_s" => I32ShrS,
        "i32.shr_u" => I32ShrU,
        "i32.rotl" => I32Rotl,
        "i32.rotr" => I32Rotr,
        "i64.clz" => I64Clz,
        "i64.ctz" => I64Ctz,
        "i64.popcnt" => I64Popcnt,
        "i64.add" => I64Add,
        "i64.sub" => I64Sub,
        "i64.mul" => I64Mul,
        "i64.div_s" => I64DivS,
        "i64.div_u" => I64DivU,
        "i64.rem_s" => I64RemS,
        "i64.rem_u" => I64RemU,
        "i64.and" => I64And,
        "i64.or" => I64Or,
        "i64.xor" => I64Xor,
        "i64.shl" => I64Shl,
        "i64.shr_s" => I64ShrS,
        "i64.shr_u" => I64ShrU,
        "i64.rotl" => I64Rotl,
        "i64.rotr" => I64Rotr,
        "f32.abs" => F32Abs,
        "f32.neg" => F32Neg,
        "f32.ceil" => F32Ceil,
        "f32.floor" => F32Floor,
        "f32.trunc" => F32Trunc,
        "f32.nearest" => F32Nearest,
        "f32.sqrt" => F32Sqrt,
        "f32.add" => F32Add,
        "f32.sub" => F32Sub,
        "f32.mul" => F32Mul,
        "f32.div" => F32Div,
        "f32.min" => F32Min,
        "f32.max" => F32Max,
        "f32.copysign" => F32Copysign,
        "f64.abs" => F64Abs,
        "f64.neg" => F64Neg,
        "f64.ceil" => F64Ceil,
        "f64.floor" => F64Floor,
        "f64.trunc" => F64Trunc,
        "f64.nearest" => F64Nearest,
        "f64.sqrt" => F64Sqrt,
        "f64.add" => F64Add,
        "f64.sub" => F64Sub,
        "f64.mul" => F64Mul,
        "f64.div" => F64Div,
        "f64.min" => F64Min,
        "f64.max" => F64Max,
        "f64.copysign" => F64Copysign,
        "i32.wrap_i64" => I32WrapI64,
        "i32.trunc_f32_s" => I32TruncF32S,
        "i32.trunc_f32_u" => I32TruncF32U,
        "i32.trunc_f64_s" => I32TruncF64S,
        "i32.trunc_f64_u" => I32TruncF64U,
        "i64.extend_i32_s" => I64ExtendI32S,
        "i64.extend_i32_u" => I64ExtendI32U,
        "i64.trunc_f32_s" => I64TruncF32S,
        "i64.trunc_f32_u" => I64TruncF32U,
        "i64.trunc_f64_s" => I64TruncF64S,
        "i64.trunc_f64_u" => I64TruncF64U,
        "f32.convert_i32_s" => F32ConvertI32S,
        "f32.convert_i32_u" => F32ConvertI32U,
        "f32.convert_i64_s" => F32ConvertI64S,
        "f32.convert_i64_u" => F32ConvertI64U,
        "f32.demote_f64" => F32DemoteF64,
        "f64.convert_i32_s" => F64ConvertI32S,
        "f64.convert_i32_u" => F64ConvertI32U,
        "f64.convert_i64_s" => F64ConvertI64S,
        "f64.convert_i64_u" => F64ConvertI64U,
        "f64.promote_f32" => F64PromoteF32,
        "i32.reinterpret_f32" => I32ReinterpretF32,
        "i64.reinterpret_f64" => I64ReinterpretF64,
        "f32.reinterpret_i32" => F32ReinterpretI32,
        "f64.reinterpret_i64" => F64ReinterpretI64,
        "i32.extend8_s" => I32Extend8S,
        "i32.extend16_s" => I32Extend16S,
        "i64.extend8_s" => I64Extend8S,
        "i64.extend16_s" => I64Extend16S,
        "i64.extend32_s" => I64Extend32S,
        _ => return None,
    })
}

/// Loads and stores, keyed by mnemonic, as constructors taking the
/// parsed memory argument.
fn mem_op_ctor(word: &str) -> Option<fn(MemArg) -> Operator> {
    use Operator::*;
    Some(match word {
        "i32.load" => |memory| I32Load { memory },
        "i64.load" => |memory| I64Load { memory },
        "f32.load" => |memory| F32Load { memory },
        "f64.load" => |memory| F64Load { memory },
        "i32.load8_s" => |memory| I32Load8S { memory },
        "i32.load8_u" => |memory| I32Load8U { memory },
        "i32.load16_s" => |memory| I32Load16S { memory },
        "i32.load16_u" => |memory| I32Load16U { memory },
        "i64.load8_s" => |memory| I64Load8S { memory },
        "i64.load8_u" => |memory| I64Load8U { memory },
        "i64.load16_s" => |memory| I64Load16S { memory },
        "i64.load16_u" => |memory| I64Load16U { memory },
        "i64.load32_s" => |memory| I64Load32S { memory },
        "i64.load32_u" => |memory| I64Load32U { memory },
        "i32.store" => |memory| I32Store { memory },
        "i64.store" => |memory| I64Store { memory },
        "f32.store" => |memory| F32Store { memory },
        "f64.store" => |memory| F64Store { memory },
        "i32.store8" => |memory| I32Store8 { memory },
        "i32.store16" => |memory| I32Store16 { memory },
        "i64.store8" => |memory| I64Store8 { memory },
        "i64.store16" => |memory| I64Store16 { memory },
        "i64.store32" => |memory| I64Store32 { memory },
        _ => return None,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ops::Operator as Op;

    fn parse(src: &str) -> Result<Module> {
        parse_module(src, "test", Features::all(), false)
    }

    #[test]
    fn add_module() {
        let m = parse(
            r#"(module
                 (func $add (param i32 i32) (result i32)
                   local.get 0
                   local.get 1
                   i32.add)
                 (export "add" (func $add)))"#,
        )
        .unwrap();
        assert_eq!(m.funcs.len(), 1);
        assert_eq!(m.signatures.len(), 1);
        let body = m.funcs.values().next().unwrap().body().unwrap();
        assert_eq!(
            body.insts,
            vec![
                Op::LocalGet {
                    local_index: Local::new(0)
                },
                Op::LocalGet {
                    local_index: Local::new(1)
                },
                Op::I32Add,
            ]
        );
        assert!(matches!(m.exports.get("add"), Some(ExportKind::Func(f)) if f.as_u32() == 0));
    }

    #[test]
    fn folded_instructions_expand_depth_first() {
        let m = parse(
            r#"(module (func (result i32)
                 (i32.add (i32.const 1) (i32.const 2))))"#,
        )
        .unwrap();
        let body = m.funcs.values().next().unwrap().body().unwrap();
        assert_eq!(
            body.insts,
            vec![
                Op::I32Const { value: 1 },
                Op::I32Const { value: 2 },
                Op::I32Add,
            ]
        );
    }

    #[test]
    fn forward_reference_is_deferred() {
        let m = parse(
            r#"(module
                 (func $a call $b)
                 (func $b))"#,
        )
        .unwrap();
        let body = m.funcs.values().next().unwrap().body().unwrap();
        assert_eq!(
            body.insts,
            vec![Op::Call {
                function_index: Func::new(1)
            }]
        );
    }

    #[test]
    fn unknown_name_reports_position() {
        let err = parse("(module (func call $missing))").unwrap_err().to_string();
        assert!(err.contains("unknown function name $missing"), "{}", err);
        assert!(err.contains("1:20"), "{}", err);
    }

    #[test]
    fn labels_resolve_by_depth() {
        let m = parse(
            r#"(module (func
                 (block $outer
                   (block $inner
                     br $outer
                     br $inner
                     br 0))))"#,
        )
        .unwrap();
        let body = m.funcs.values().next().unwrap().body().unwrap();
        assert_eq!(
            body.insts,
            vec![
                Op::Block {
                    ty: BlockType::Empty
                },
                Op::Block {
                    ty: BlockType::Empty
                },
                Op::Br { depth: 1 },
                Op::Br { depth: 0 },
                Op::Br { depth: 0 },
                Op::End,
                Op::End,
            ]
        );
    }

    #[test]
    fn folded_if_expands_condition_first() {
        let m = parse(
            r#"(module (func (result i32)
                 (if (result i32) (i32.const 1)
                   (then (i32.const 2))
                   (else (i32.const 3)))))"#,
        )
        .unwrap();
        let body = m.funcs.values().next().unwrap().body().unwrap();
        assert_eq!(
            body.insts,
            vec![
                Op::I32Const { value: 1 },
                Op::If {
                    ty: BlockType::Value(Type::I32)
                },
                Op::I32Const { value: 2 },
                Op::Else,
                Op::I32Const { value: 3 },
                Op::End,
            ]
        );
    }

    #[test]
    fn inline_types_dedupe() {
        let m = parse(
            r#"(module
                 (type (func (param i32) (result i32)))
                 (func (param i32) (result i32) local.get 0)
                 (func (param f64) local.get 0 drop))"#,
        )
        .unwrap();
        // First func reuses the explicit type; second adds one.
        assert_eq!(m.signatures.len(), 2);
    }

    #[test]
    fn inline_type_mismatch_is_an_error() {
        let err = parse(
            r#"(module
                 (type $t (func (param i32)))
                 (func (type $t) (param f64)))"#,
        )
        .unwrap_err()
        .to_string();
        assert!(err.contains("does not match"), "{}", err);
    }

    #[test]
    fn imports_and_inline_exports() {
        let m = parse(
            r#"(module
                 (import "env" "print" (func $print (param i32)))
                 (func (export "run") call $print)
                 (memory (export "mem") 1 2)
                 (global (export "g") (mut i32) (i32.const 7)))"#,
        )
        .unwrap();
        assert_eq!(m.imports.len(), 1);
        assert_eq!(m.num_imported_funcs(), 1);
        assert!(m.exports.contains_key("run"));
        assert!(m.exports.contains_key("mem"));
        assert!(m.exports.contains_key("g"));
        assert_eq!(m.globals.values().next().unwrap().init, vec![Op::I32Const {
            value: 7
        }]);
        // The body's call resolved against the import.
        let body = m.funcs.values().nth(1).unwrap().body().unwrap();
        assert_eq!(
            body.insts,
            vec![Op::Call {
                function_index: Func::new(0)
            }]
        );
    }

    #[test]
    fn import_after_definition_rejected() {
        let err = parse(
            r#"(module
                 (func)
                 (import "env" "f" (func)))"#,
        )
        .unwrap_err()
        .to_string();
        assert!(err.contains("import after definition"), "{}", err);
    }

    #[test]
    fn elem_data_start() {
        let m = parse(
            r#"(module
                 (table 2 funcref)
                 (memory 1)
                 (func $f)
                 (elem (i32.const 0) $f $f)
                 (data (i32.const 8) "hi\00")
                 (start $f))"#,
        )
        .unwrap();
        assert_eq!(m.elements.len(), 1);
        assert_eq!(m.elements[0].funcs, vec![Func::new(0), Func::new(0)]);
        assert_eq!(m.data[0].data, b"hi\0");
        assert_eq!(m.start, Some(Func::new(0)));
    }

    #[test]
    fn duplicate_names_rejected() {
        let err = parse("(module (func $f) (func $f))").unwrap_err().to_string();
        assert!(err.contains("duplicate name"), "{}", err);
    }

    #[test]
    fn mismatched_parens_rejected() {
        assert!(parse("(module (func)").is_err());
    }

    #[test]
    fn script_forms_are_skipped() {
        let m = parse(
            r#"(assert_malformed (module quote "(func") "unexpected end")
               (module (func $f))
               (assert_return (invoke "f"))"#,
        )
        .unwrap();
        assert_eq!(m.funcs.len(), 1);
    }

    #[test]
    fn module_binary_form_decodes() {
        let m = parse(r#"(module binary "\00\61\73\6d\01\00\00\00")"#).unwrap();
        assert!(m.funcs.is_empty());
    }

    #[test]
    fn numeric_literals() {
        assert_eq!(parse_i32("-1"), Some(-1));
        assert_eq!(parse_i32("0xFFFFFFFF"), Some(-1));
        assert_eq!(parse_i32("4294967295"), Some(-1));
        assert_eq!(parse_i32("4294967296"), None);
        assert_eq!(parse_i32("-2147483648"), Some(i32::MIN));
        assert_eq!(parse_i64("0x8000000000000000"), Some(i64::MIN));
        assert_eq!(parse_f64("1.5"), Some(1.5f64.to_bits()));
        assert_eq!(parse_f64("-inf"), Some(f64::NEG_INFINITY.to_bits()));
        assert_eq!(parse_f64("0x1.8p3"), Some(12.0f64.to_bits()));
        assert_eq!(parse_f32("nan"), Some(0x7FC0_0000));
        assert_eq!(parse_f32("nan:0x1"), Some(0x7F80_0001));
        assert_eq!(parse_f64("1_000.5"), Some(1000.5f64.to_bits()));
    }

    #[test]
    fn memarg_immediates() {
        let m = parse(
            r#"(module (memory 1) (func
                 (i32.store offset=4 align=2 (i32.const 0) (i32.const 1))))"#,
        )
        .unwrap();
        let body = m.funcs.values().next().unwrap().body().unwrap();
        assert_eq!(
            body.insts[2],
            Op::I32Store {
                memory: MemArg { align: 1, offset: 4 }
            }
        );
    }
}
