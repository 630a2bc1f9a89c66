//! Binary module encoder.
//!
//! The inverse of `decode`: serializes the IR back to the MVP binary
//! format. A decoded module re-encodes to the same bytes, except that
//! custom sections are regrouped at the end of the module.

use crate::decode::{MAGIC, VERSION};
use crate::ir::{ExportKind, FuncDecl, FunctionBody, ImportKind, Limits, Module, Type};
use crate::ops::{BlockType, MemArg, Operator};

pub fn write_u32(out: &mut Vec<u8>, mut v: u32) {
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub fn write_i32(out: &mut Vec<u8>, v: i32) {
    write_i64(out, v as i64);
}

pub fn write_i64(out: &mut Vec<u8>, mut v: i64) {
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        let done = (v == 0 && byte & 0x40 == 0) || (v == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn write_name(out: &mut Vec<u8>, name: &str) {
    write_u32(out, name.len() as u32);
    out.extend_from_slice(name.as_bytes());
}

fn write_limits(out: &mut Vec<u8>, limits: &Limits) {
    match limits.max {
        None => {
            out.push(0x00);
            write_u32(out, limits.min);
        }
        Some(max) => {
            out.push(0x01);
            write_u32(out, limits.min);
            write_u32(out, max);
        }
    }
}

fn write_type(out: &mut Vec<u8>, ty: Type) {
    out.push(ty.code());
}

fn write_block_type(out: &mut Vec<u8>, ty: &BlockType) {
    match ty {
        BlockType::Empty => out.push(0x40),
        BlockType::Value(t) => write_type(out, *t),
        BlockType::Sig(s) => write_i64(out, s.as_u32() as i64),
    }
}

fn write_memarg(out: &mut Vec<u8>, arg: &MemArg) {
    write_u32(out, arg.align);
    write_u32(out, arg.offset);
}

/// Append a section frame; empty payloads are omitted entirely.
fn section(out: &mut Vec<u8>, id: u8, payload: Vec<u8>) {
    if payload.is_empty() {
        return;
    }
    out.push(id);
    write_u32(out, payload.len() as u32);
    out.extend_from_slice(&payload);
}

pub fn encode_module(m: &Module) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION);

    // Type section.
    let mut payload = Vec::new();
    if !m.signatures.is_empty() {
        write_u32(&mut payload, m.signatures.len() as u32);
        for sig in m.signatures.values() {
            payload.push(0x60);
            write_u32(&mut payload, sig.params.len() as u32);
            for &t in &sig.params {
                write_type(&mut payload, t);
            }
            write_u32(&mut payload, sig.results.len() as u32);
            for &t in &sig.results {
                write_type(&mut payload, t);
            }
        }
    }
    section(&mut out, 1, payload);

    // Import section.
    let mut payload = Vec::new();
    if !m.imports.is_empty() {
        write_u32(&mut payload, m.imports.len() as u32);
        for import in &m.imports {
            write_name(&mut payload, &import.module);
            write_name(&mut payload, &import.name);
            match import.kind {
                ImportKind::Func(f) => {
                    payload.push(0x00);
                    write_u32(&mut payload, m.funcs[f].sig().as_u32());
                }
                ImportKind::Table(t) => {
                    payload.push(0x01);
                    payload.push(0x70);
                    write_limits(&mut payload, &m.tables[t].limits);
                }
                ImportKind::Memory(mem) => {
                    payload.push(0x02);
                    write_limits(&mut payload, &m.memories[mem].limits);
                }
                ImportKind::Global(g) => {
                    let data = &m.globals[g];
                    payload.push(0x03);
                    write_type(&mut payload, data.ty);
                    payload.push(data.mutable as u8);
                }
            }
        }
    }
    section(&mut out, 2, payload);

    // Function section: type indices of defined functions.
    let defined: Vec<&FuncDecl> = m
        .funcs
        .values()
        .filter(|d| matches!(d, FuncDecl::Body(..)))
        .collect();
    let mut payload = Vec::new();
    if !defined.is_empty() {
        write_u32(&mut payload, defined.len() as u32);
        for decl in &defined {
            write_u32(&mut payload, decl.sig().as_u32());
        }
    }
    section(&mut out, 3, payload);

    // Table section: defined tables only.
    let defined_tables = m.num_imported_tables();
    let mut payload = Vec::new();
    if m.tables.len() > defined_tables {
        write_u32(&mut payload, (m.tables.len() - defined_tables) as u32);
        for table in m.tables.values().skip(defined_tables) {
            payload.push(0x70);
            write_limits(&mut payload, &table.limits);
        }
    }
    section(&mut out, 4, payload);

    // Memory section: defined memories only.
    let imported_mems = m.num_imported_memories();
    let mut payload = Vec::new();
    if m.memories.len() > imported_mems {
        write_u32(&mut payload, (m.memories.len() - imported_mems) as u32);
        for mem in m.memories.values().skip(imported_mems) {
            write_limits(&mut payload, &mem.limits);
        }
    }
    section(&mut out, 5, payload);

    // Global section: defined globals only.
    let imported_globals = m.num_imported_globals();
    let mut payload = Vec::new();
    if m.globals.len() > imported_globals {
        write_u32(&mut payload, (m.globals.len() - imported_globals) as u32);
        for global in m.globals.values().skip(imported_globals) {
            write_type(&mut payload, global.ty);
            payload.push(global.mutable as u8);
            write_expr(&mut payload, &global.init);
        }
    }
    section(&mut out, 6, payload);

    // Export section.
    let mut payload = Vec::new();
    if !m.exports.is_empty() {
        write_u32(&mut payload, m.exports.len() as u32);
        for (name, kind) in &m.exports {
            write_name(&mut payload, name);
            match kind {
                ExportKind::Func(x) => {
                    payload.push(0x00);
                    write_u32(&mut payload, x.as_u32());
                }
                ExportKind::Table(x) => {
                    payload.push(0x01);
                    write_u32(&mut payload, x.as_u32());
                }
                ExportKind::Memory(x) => {
                    payload.push(0x02);
                    write_u32(&mut payload, x.as_u32());
                }
                ExportKind::Global(x) => {
                    payload.push(0x03);
                    write_u32(&mut payload, x.as_u32());
                }
            }
        }
    }
    section(&mut out, 7, payload);

    // Start section.
    let mut payload = Vec::new();
    if let Some(start) = m.start {
        write_u32(&mut payload, start.as_u32());
    }
    section(&mut out, 8, payload);

    // Element section.
    let mut payload = Vec::new();
    if !m.elements.is_empty() {
        write_u32(&mut payload, m.elements.len() as u32);
        for seg in &m.elements {
            write_u32(&mut payload, seg.table.as_u32());
            write_expr(&mut payload, &seg.offset);
            write_u32(&mut payload, seg.funcs.len() as u32);
            for f in &seg.funcs {
                write_u32(&mut payload, f.as_u32());
            }
        }
    }
    section(&mut out, 9, payload);

    // Code section.
    let mut payload = Vec::new();
    if !defined.is_empty() {
        write_u32(&mut payload, defined.len() as u32);
        for decl in &defined {
            let body = decl.body().unwrap();
            let mut entry = Vec::new();
            write_function_body(&mut entry, body);
            write_u32(&mut payload, entry.len() as u32);
            payload.extend_from_slice(&entry);
        }
    }
    section(&mut out, 10, payload);

    // Data section.
    let mut payload = Vec::new();
    if !m.data.is_empty() {
        write_u32(&mut payload, m.data.len() as u32);
        for seg in &m.data {
            write_u32(&mut payload, seg.memory.as_u32());
            write_expr(&mut payload, &seg.offset);
            write_u32(&mut payload, seg.data.len() as u32);
            payload.extend_from_slice(&seg.data);
        }
    }
    section(&mut out, 11, payload);

    // Custom sections, regrouped at the end.
    for (name, body) in &m.custom_sections {
        let mut payload = Vec::new();
        write_name(&mut payload, name);
        payload.extend_from_slice(body);
        section(&mut out, 0, payload);
    }

    out
}

fn write_function_body(out: &mut Vec<u8>, body: &FunctionBody) {
    write_u32(out, body.locals.len() as u32);
    for &(count, ty) in &body.locals {
        write_u32(out, count);
        write_type(out, ty);
    }
    for op in &body.insts {
        write_operator(out, op);
    }
    out.push(0x0B);
}

/// An initializer expression plus its terminating `end`.
fn write_expr(out: &mut Vec<u8>, ops: &[Operator]) {
    for op in ops {
        write_operator(out, op);
    }
    out.push(0x0B);
}

pub fn write_operator(out: &mut Vec<u8>, op: &Operator) {
    use Operator::*;
    match op {
        Unreachable => out.push(0x00),
        Nop => out.push(0x01),
        Block { ty } => {
            out.push(0x02);
            write_block_type(out, ty);
        }
        Loop { ty } => {
            out.push(0x03);
            write_block_type(out, ty);
        }
        If { ty } => {
            out.push(0x04);
            write_block_type(out, ty);
        }
        Else => out.push(0x05),
        End => out.push(0x0B),
        Br { depth } => {
            out.push(0x0C);
            write_u32(out, *depth);
        }
        BrIf { depth } => {
            out.push(0x0D);
            write_u32(out, *depth);
        }
        BrTable { targets, default } => {
            out.push(0x0E);
            write_u32(out, targets.len() as u32);
            for t in targets {
                write_u32(out, *t);
            }
            write_u32(out, *default);
        }
        Return => out.push(0x0F),
        Call { function_index } => {
            out.push(0x10);
            write_u32(out, function_index.as_u32());
        }
        CallIndirect {
            sig_index,
            table_index,
        } => {
            out.push(0x11);
            write_u32(out, sig_index.as_u32());
            write_u32(out, table_index.as_u32());
        }
        Drop => out.push(0x1A),
        Select => out.push(0x1B),
        LocalGet { local_index } => {
            out.push(0x20);
            write_u32(out, local_index.as_u32());
        }
        LocalSet { local_index } => {
            out.push(0x21);
            write_u32(out, local_index.as_u32());
        }
        LocalTee { local_index } => {
            out.push(0x22);
            write_u32(out, local_index.as_u32());
        }
        GlobalGet { global_index } => {
            out.push(0x23);
            write_u32(out, global_index.as_u32());
        }
        GlobalSet { global_index } => {
            out.push(0x24);
            write_u32(out, global_index.as_u32());
        }
        I32Load { memory } => mem_op(out, 0x28, memory),
        I64Load { memory } => mem_op(out, 0x29, memory),
        F32Load { memory } => mem_op(out, 0x2A, memory),
        F64Load { memory } => mem_op(out, 0x2B, memory),
        I32Load8S { memory } => mem_op(out, 0x2C, memory),
        I32Load8U { memory } => mem_op(out, 0x2D, memory),
        I32Load16S { memory } => mem_op(out, 0x2E, memory),
        I32Load16U { memory } => mem_op(out, 0x2F, memory),
        I64Load8S { memory } => mem_op(out, 0x30, memory),
        I64Load8U { memory } => mem_op(out, 0x31, memory),
        I64Load16S { memory } => mem_op(out, 0x32, memory),
        I64Load16U { memory } => mem_op(out, 0x33, memory),
        I64Load32S { memory } => mem_op(out, 0x34, memory),
        I64Load32U { memory } => mem_op(out, 0x35, memory),
        I32Store { memory } => mem_op(out, 0x36, memory),
        I64Store { memory } => mem_op(out, 0x37, memory),
        F32Store { memory } => mem_op(out, 0x38, memory),
        F64Store { memory } => mem_op(out, 0x39, memory),
        I32Store8 { memory } => mem_op(out, 0x3A, memory),
        I32Store16 { memory } => mem_op(out, 0x3B, memory),
        I64Store8 { memory } => mem_op(out, 0x3C, memory),
        I64Store16 { memory } => mem_op(out, 0x3D, memory),
        I64Store32 { memory } => mem_op(out, 0x3E, memory),
        MemorySize { mem } => {
            out.push(0x3F);
            write_u32(out, mem.as_u32());
        }
        MemoryGrow { mem } => {
            out.push(0x40);
            write_u32(out, mem.as_u32());
        }
        I32Const { value } => {
            out.push(0x41);
            write_i32(out, *value);
        }
        I64Const { value } => {
            out.push(0x42);
            write_i64(out, *value);
        }
        F32Const { bits } => {
            out.push(0x43);
            out.extend_from_slice(&bits.to_le_bytes());
        }
        F64Const { bits } => {
            out.push(0x44);
            out.extend_from_slice(&bits.to_le_bytes());
        }
        I32Eqz => out.push(0x45),
        I32Eq => out.push(0x46),
        I32Ne => out.push(0x47),
        I32LtS => out.push(0x48),
        I32LtU => out.push(0x49),
        I32GtS => out.push(0x4A),
        I32GtU => out.push(0x4B),
        I32LeS => out.push(0x4C),
        I32LeU => out.push(0x4D),
        I32GeS => out.push(0x4E),
        I32GeU => out.push(0x4F),
        I64Eqz => out.push(0x50),
        I64Eq => out.push(0x51),
        I64Ne => out.push(0x52),
        I64LtS => out.push(0x53),
        I64LtU => out.push(0x54),
        I64GtS => out.push(0x55),
        I64GtU => out.push(0x56),
        I64LeS => out.push(0x57),
        I64LeU => out.push(0x58),
        I64GeS => out.push(0x59),
        I64GeU => out.push(0x5A),
        F32Eq => out.push(0x5B),
        F32Ne => out.push(0x5C),
        F32Lt => out.push(0x5D),
        F32Gt => out.push(0x5E),
        F32Le => out.push(0x5F),
        F32Ge => out.push(0x60),
        F64Eq => out.push(0x61),
        F64Ne => out.push(0x62),
        F64Lt => out.push(0x63),
        F64Gt => out.push(0x64),
        F64Le => out.push(0x65),
        F64Ge => out.push(0x66),
        I32Clz => out.push(0x67),
        I32Ctz => out.push(0x68),
        I32Popcnt => out.push(0x69),
        I32Add => out.push(0x6A),
        I32Sub => out.push(0x6B),
        I32Mul => out.push(0x6C),
        I32DivS => out.push(0x6D),
        I32DivU => out.push(0x6E),
        I32RemS => out.push(0x6F),
        I32RemU => out.push(0x70),
        I32And => out.push(0x71),
        I32Or => out.push(0x72),
        I32Xor => out.push(0x73),
        I32Shl => out.push(0x74),
        I32ShrS => out.push(0x75),
        I32ShrU => out.push(0x76),
        I32Rotl => out.push(0x77),
        I32Rotr => out.push(0x78),
        I64Clz => out.push(0x79),
        I64Ctz => out.push(0x7A),
        I64Popcnt => out.push(0x7B),
        I64Add => out.push(0x7C),
        I64Sub => out.push(0x7D),
        I64Mul => out.push(0x7E),
        I64DivS => out.push(0x7F),
        I64DivU => out.push(0x80),
        I64RemS => out.push(0x81),
        I64RemU => out.push(0x82),
        I64And => out.push(0x83),
        I64Or => out.push(0x84),
        I64Xor => out.push(0x85),
        I64Shl => out.push(0x86),
        I64ShrS => out.push(0x87),
        I64ShrU => out.push(0x88),
        I64Rotl => out.push(0x89),
        I64Rotr => out.push(0x8A),
        F32Abs => out.push(0x8B),
        F32Neg => out.push(0x8C),
        F32Ceil => out.push(0x8D),
        F32Floor => out.push(0x8E),
        F32Trunc => out.push(0x8F),
        F32Nearest => out.push(0x90),
        F32Sqrt => out.push(0x91),
        F32Add => out.push(0x92),
        F32Sub => out.push(0x93),
        F32Mul => out.push(0x94),
        F32Div => out.push(0x95),
        F32Min => out.push(0x96),
        F32Max => out.push(0x97),
        F32Copysign => out.push(0x98),
        F64Abs => out.push(0x99),
        F64Neg => out.push(0x9A),
        F64Ceil => out.push(0x9B),
        F64Floor => out.push(0x9C),
        F64Trunc => out.push(0x9D),
        F64Nearest => out.push(0x9E),
        F64Sqrt => out.push(0x9F),
        F64Add => out.push(0xA0),
        F64Sub => out.push(0xA1),
        F64Mul => out.push(0xA2),
        F64Div => out.push(0xA3),
        F64Min => out.push(0xA4),
        F64Max => out.push(0xA5),
        F64Copysign => out.push(0xA6),
        I32WrapI64 => out.push(0xA7),
        I32TruncF32S => out.push(0xA8),
        I32TruncF32U => out.push(0xA9),
        I32TruncF64S => out.push(0xAA),
        I32TruncF64U => out.push(0xAB),
        I64ExtendI32S => out.push(0xAC),
        I64ExtendI32U => out.push(0xAD),
        I64TruncF32S => out.push(0xAE),
        I64TruncF32U => out.push(0xAF),
        I64TruncF64S => out.push(0xB0),
        I64TruncF64U => out.push(0xB1),
        F32ConvertI32S => out.push(0xB2),
        F32ConvertI32U => out.push(0xB3),
        F32ConvertI64S => out.push(0xB4),
        F32ConvertI64U => out.push(0xB5),
        F32DemoteF64 => out.push(0xB6),
        F64ConvertI32S => out.push(0xB7),
        F64ConvertI32U => out.push(0xB8),
        F64ConvertI64S => out.push(0xB9),
        F64ConvertI64U => out.push(0xBA),
        F64PromoteF32 => out.push(0xBB),
        I32ReinterpretF32 => out.push(0xBC),
        I64ReinterpretF64 => out.push(0xBD),
        F32ReinterpretI32 => out.push(0xBE),
        F64ReinterpretI64 => out.push(0xBF),
        I32Extend8S => out.push(0xC0),
        I32Extend16S => out.push(0xC1),
        I64Extend8S => out.push(0xC2),
        I64Extend16S => out.push(0xC3),
        I64Extend32S => out.push(0xC4),
    }
}

fn mem_op(out: &mut Vec<u8>, opcode: u8, arg: &MemArg) {
    out.push(opcode);
    write_memarg(out, arg);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::decode::decode_module;
    use crate::env::Features;

    #[test]
    fn leb_writers_minimal() {
        let mut out = vec![];
        write_u32(&mut out, 0);
        assert_eq!(out, [0x00]);
        out.clear();
        write_u32(&mut out, 624485);
        assert_eq!(out, [0xE5, 0x8E, 0x26]);
        out.clear();
        write_i32(&mut out, -1);
        assert_eq!(out, [0x7F]);
        out.clear();
        write_i32(&mut out, -64);
        assert_eq!(out, [0x40]);
        out.clear();
        write_i32(&mut out, 64);
        assert_eq!(out, [0xC0, 0x00]);
    }

    #[test]
    fn empty_module_roundtrip() {
        let bytes = b"\0asm\x01\0\0\0".to_vec();
        let m = decode_module(&bytes, "m", Features::all(), false).unwrap();
        assert_eq!(encode_module(&m), bytes);
    }

    #[test]
    fn leb_roundtrip_boundaries() {
        for v in [0u32, 1, 127, 128, 16383, 16384, u32::MAX] {
            let mut out = vec![];
            write_u32(&mut out, v);
            let mut s = crate::decode::Stream::new(&out);
            assert_eq!(s.read_u32().unwrap(), v);
        }
        for v in [0i64, -1, 63, -64, 64, -65, i64::MIN, i64::MAX] {
            let mut out = vec![];
            write_i64(&mut out, v);
            let mut s = crate::decode::Stream::new(&out);
            assert_eq!(s.read_i64().unwrap(), v);
        }
    }
}
