//! Canonical text rendering of a module.
//!
//! Emits the standard S-expression form with numeric indices and
//! linear (unfolded) instruction sequences; parsing the output yields
//! a structurally identical module.

use super::{ExportKind, FuncDecl, ImportKind, Limits, Module};
use crate::ops::Operator;
use std::fmt;

pub struct ModuleDisplay<'a> {
    pub(crate) module: &'a Module,
}

fn write_string(f: &mut fmt::Formatter, bytes: &[u8]) -> fmt::Result {
    write!(f, "\"")?;
    for &b in bytes {
        match b {
            b'"' => write!(f, "\\\"")?,
            b'\\' => write!(f, "\\\\")?,
            0x20..=0x7E => write!(f, "{}", b as char)?,
            b'\t' => write!(f, "\\t")?,
            b'\n' => write!(f, "\\n")?,
            b'\r' => write!(f, "\\r")?,
            _ => write!(f, "\\{:02x}", b)?,
        }
    }
    write!(f, "\"")
}

fn write_limits(f: &mut fmt::Formatter, limits: &Limits) -> fmt::Result {
    match limits.max {
        Some(max) => write!(f, "{} {}", limits.min, max),
        None => write!(f, "{}", limits.min),
    }
}

fn write_expr(f: &mut fmt::Formatter, ops: &[Operator]) -> fmt::Result {
    for op in ops {
        write!(f, " {}", op)?;
    }
    Ok(())
}

impl<'a> fmt::Display for ModuleDisplay<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let m = self.module;
        writeln!(f, "(module")?;

        for sig in m.signatures.values() {
            write!(f, "  (type (func")?;
            if !sig.params.is_empty() {
                write!(f, " (param")?;
                for t in &sig.params {
                    write!(f, " {}", t)?;
                }
                write!(f, ")")?;
            }
            if !sig.results.is_empty() {
                write!(f, " (result")?;
                for t in &sig.results {
                    write!(f, " {}", t)?;
                }
                write!(f, ")")?;
            }
            writeln!(f, "))")?;
        }

        for import in &m.imports {
            write!(f, "  (import ")?;
            write_string(f, import.module.as_bytes())?;
            write!(f, " ")?;
            write_string(f, import.name.as_bytes())?;
            match import.kind {
                ImportKind::Func(func) => {
                    write!(f, " (func (type {}))", m.funcs[func].sig().as_u32())?
                }
                ImportKind::Table(t) => {
                    write!(f, " (table ")?;
                    write_limits(f, &m.tables[t].limits)?;
                    write!(f, " funcref)")?;
                }
                ImportKind::Memory(mem) => {
                    write!(f, " (memory ")?;
                    write_limits(f, &m.memories[mem].limits)?;
                    write!(f, ")")?;
                }
                ImportKind::Global(g) => {
                    let data = &m.globals[g];
                    if data.mutable {
                        write!(f, " (global (mut {}))", data.ty)?;
                    } else {
                        write!(f, " (global {})", data.ty)?;
                    }
                }
            }
            writeln!(f, ")")?;
        }

        for decl in m.funcs.values() {
            let (sig, body) = match decl {
                FuncDecl::Body(sig, body) => (*sig, body),
                FuncDecl::Import(..) => continue,
            };
            writeln!(f, "  (func (type {})", sig.as_u32())?;
            if !body.locals.is_empty() {
                write!(f, "    (local")?;
                for ty in body.local_types() {
                    write!(f, " {}", ty)?;
                }
                writeln!(f, ")")?;
            }
            let mut indent = 2usize;
            for op in &body.insts {
                match op {
                    Operator::End | Operator::Else => indent = indent.saturating_sub(1),
                    _ => {}
                }
                for _ in 0..indent {
                    write!(f, "  ")?;
                }
                writeln!(f, "{}", op)?;
                match op {
                    Operator::Block { .. }
                    | Operator::Loop { .. }
                    | Operator::If { .. }
                    | Operator::Else => indent += 1,
                    _ => {}
                }
            }
            writeln!(f, "  )")?;
        }

        let imported_tables = m.num_imported_tables();
        for table in m.tables.values().skip(imported_tables) {
            write!(f, "  (table ")?;
            write_limits(f, &table.limits)?;
            writeln!(f, " funcref)")?;
        }

        let imported_mems = m.num_imported_memories();
        for mem in m.memories.values().skip(imported_mems) {
            write!(f, "  (memory ")?;
            write_limits(f, &mem.limits)?;
            writeln!(f, ")")?;
        }

        let imported_globals = m.num_imported_globals();
        for global in m.globals.values().skip(imported_globals) {
            if global.mutable {
                write!(f, "  (global (mut {})", global.ty)?;
            } else {
                write!(f, "  (global {}", global.ty)?;
            }
            write_expr(f, &global.init)?;
            writeln!(f, ")")?;
        }

        for (name, kind) in &m.exports {
            write!(f, "  (export ")?;
            write_string(f, name.as_bytes())?;
            match kind {
                ExportKind::Func(x) => writeln!(f, " (func {}))", x.as_u32())?,
                ExportKind::Table(x) => writeln!(f, " (table {}))", x.as_u32())?,
                ExportKind::Memory(x) => writeln!(f, " (memory {}))", x.as_u32())?,
                ExportKind::Global(x) => writeln!(f, " (global {}))", x.as_u32())?,
            }
        }

        if let Some(start) = m.start {
            writeln!(f, "  (start {})", start.as_u32())?;
        }

        for seg in &m.elements {
            write!(f, "  (elem {} (offset", seg.table.as_u32())?;
            write_expr(f, &seg.offset)?;
            write!(f, ")")?;
            for func in &seg.funcs {
                write!(f, " {}", func.as_u32())?;
            }
            writeln!(f, ")")?;
        }

        for seg in &m.data {
            write!(f, "  (data {} (offset", seg.memory.as_u32())?;
            write_expr(f, &seg.offset)?;
            write!(f, ") ")?;
            write_string(f, &seg.data)?;
            writeln!(f, ")")?;
        }

        write!(f, ")")
    }
}

#[cfg(test)]
mod test {
    use crate::ir::*;
    use crate::ops::Operator;

    #[test]
    fn render_simple_module() {
        let mut m = Module::empty("t");
        let sig = m.signatures.push(SignatureData {
            params: vec![Type::I32],
            results: vec![Type::I32],
        });
        let f = m.funcs.push(FuncDecl::Body(
            sig,
            FunctionBody {
                locals: vec![(1, Type::I64)],
                insts: vec![Operator::I32Const { value: 4 }],
            },
        ));
        m.exports.insert("four".to_owned(), ExportKind::Func(f));
        let text = m.display().to_string();
        assert!(text.contains("(type (func (param i32) (result i32)))"));
        assert!(text.contains("(local i64)"));
        assert!(text.contains("i32.const 4"));
        assert!(text.contains("(export \"four\" (func 0))"));
    }

    #[test]
    fn render_escapes_data() {
        let mut m = Module::empty("t");
        m.memories.push(MemoryData {
            limits: Limits { min: 1, max: None },
        });
        m.data.push(DataSegment {
            memory: crate::entity::EntityRef::new(0),
            offset: vec![Operator::I32Const { value: 0 }],
            data: b"a\"\x01".to_vec(),
        });
        let text = m.display().to_string();
        assert!(text.contains("\"a\\\"\\01\""));
    }
}
