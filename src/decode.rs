//! Binary module decoder.
//!
//! Reads the MVP binary format into the module IR: magic and version,
//! then sections framed by (id, LEB128 size, payload), in increasing
//! id order with custom sections (id 0) allowed anywhere.

use crate::entity::EntityRef;
use crate::env::Features;
use crate::ir::{
    DataSegment, ElementSegment, ExportKind, Func, FuncDecl, FunctionBody, Global, GlobalData,
    Import, ImportKind, Limits, Memory, MemoryData, Module, Signature, SignatureData, Table,
    TableData, Type,
};
use crate::ops::{BlockType, MemArg, Operator};
use anyhow::{bail, Context, Result};

pub const MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6D];
pub const VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

const SEC_CUSTOM: u8 = 0;
const SEC_TYPE: u8 = 1;
const SEC_IMPORT: u8 = 2;
const SEC_FUNCTION: u8 = 3;
const SEC_TABLE: u8 = 4;
const SEC_MEMORY: u8 = 5;
const SEC_GLOBAL: u8 = 6;
const SEC_EXPORT: u8 = 7;
const SEC_START: u8 = 8;
const SEC_ELEMENT: u8 = 9;
const SEC_CODE: u8 = 10;
const SEC_DATA: u8 = 11;

/// A byte stream with a read cursor. All integer reads are LEB128;
/// floats are IEEE 754 little-endian.
pub struct Stream<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Stream<'a> {
    pub fn new(data: &'a [u8]) -> Stream<'a> {
        Stream { data, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .with_context(|| format!("unexpected end of stream at offset {}", self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            bail!(
                "unexpected end of stream at offset {}: wanted {} bytes, have {}",
                self.pos,
                len,
                self.remaining()
            );
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Unsigned LEB128, at most 5 bytes, unused bits of the final
    /// byte must be clear.
    pub fn read_u32(&mut self) -> Result<u32> {
        let mut result: u32 = 0;
        for i in 0..5 {
            let b = self.read_byte()?;
            let payload = (b & 0x7F) as u32;
            if i == 4 && payload > 0x0F {
                bail!("malformed LEB128 at offset {}: overlong u32", self.pos - 1);
            }
            result |= payload << (i * 7);
            if b & 0x80 == 0 {
                return Ok(result);
            }
        }
        bail!("malformed LEB128 at offset {}: u32 exceeds 5 bytes", self.pos)
    }

    /// Unsigned LEB128, at most 10 bytes.
    pub fn read_u64(&mut self) -> Result<u64> {
        let mut result: u64 = 0;
        for i in 0..10 {
            let b = self.read_byte()?;
            let payload = (b & 0x7F) as u64;
            if i == 9 && payload > 0x01 {
                bail!("malformed LEB128 at offset {}: overlong u64", self.pos - 1);
            }
            result |= payload << (i * 7);
            if b & 0x80 == 0 {
                return Ok(result);
            }
        }
        bail!("malformed LEB128 at offset {}: u64 exceeds 10 bytes", self.pos)
    }

    /// Signed LEB128, at most 5 bytes, with sign extension.
    pub fn read_i32(&mut self) -> Result<i32> {
        let mut result: i32 = 0;
        let mut shift = 0;
        for i in 0..5 {
            let b = self.read_byte()?;
            let payload = (b & 0x7F) as i32;
            if i == 4 {
                // 4 meaningful bits remain; the rest must be sign fill.
                let high = b & 0x78;
                if high != 0 && high != 0x78 {
                    bail!("malformed LEB128 at offset {}: overlong i32", self.pos - 1);
                }
            }
            result |= payload << shift;
            shift += 7;
            if b & 0x80 == 0 {
                if shift < 32 && b & 0x40 != 0 {
                    result |= -1i32 << shift;
                }
                return Ok(result);
            }
        }
        bail!("malformed LEB128 at offset {}: i32 exceeds 5 bytes", self.pos)
    }

    /// Signed LEB128, at most 10 bytes, with sign extension.
    pub fn read_i64(&mut self) -> Result<i64> {
        let mut result: i64 = 0;
        let mut shift = 0;
        for i in 0..10 {
            let b = self.read_byte()?;
            let payload = (b & 0x7F) as i64;
            if i == 9 {
                let high = b & 0x7E;
                if high != 0 && high != 0x7E {
                    bail!("malformed LEB128 at offset {}: overlong i64", self.pos - 1);
                }
            }
            result |= payload << shift;
            shift += 7;
            if b & 0x80 == 0 {
                if shift < 64 && b & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }
        bail!("malformed LEB128 at offset {}: i64 exceeds 10 bytes", self.pos)
    }

    /// Signed 33-bit LEB128, used only for block types beyond the MVP
    /// shorthands.
    fn read_s33(&mut self) -> Result<i64> {
        let mut result: i64 = 0;
        let mut shift = 0;
        for _ in 0..5 {
            let b = self.read_byte()?;
            result |= ((b & 0x7F) as i64) << shift;
            shift += 7;
            if b & 0x80 == 0 {
                if shift < 64 && b & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }
        bail!("malformed LEB128 at offset {}: s33 exceeds 5 bytes", self.pos)
    }

    pub fn read_f32_bits(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_f64_bits(&mut self) -> Result<u64> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// A length-prefixed UTF-8 name.
    pub fn read_name(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let at = self.pos;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .with_context(|| format!("invalid UTF-8 in name at offset {}", at))
    }

    fn read_type(&mut self) -> Result<Type> {
        let at = self.pos;
        let code = self.read_byte()?;
        Type::from_code(code)
            .with_context(|| format!("invalid value type 0x{:02x} at offset {}", code, at))
    }

    fn read_limits(&mut self) -> Result<Limits> {
        let at = self.pos;
        match self.read_byte()? {
            0x00 => Ok(Limits {
                min: self.read_u32()?,
                max: None,
            }),
            0x01 => {
                let min = self.read_u32()?;
                let max = self.read_u32()?;
                Ok(Limits { min, max: Some(max) })
            }
            flags => bail!("invalid limits flags 0x{:02x} at offset {}", flags, at),
        }
    }
}

struct Decoder<'a> {
    s: Stream<'a>,
    module: Module,
    features: Features,
    keep_names: bool,
    /// Type indices from the function section, paired with bodies
    /// when the code section arrives.
    pending_sigs: Vec<Signature>,
    seen_code: bool,
}

/// Decode a binary module. `keep_names` controls whether the `name`
/// custom section is decoded into per-function debug names.
pub fn decode_module(
    bytes: &[u8],
    name: &str,
    features: Features,
    keep_names: bool,
) -> Result<Module> {
    let mut d = Decoder {
        s: Stream::new(bytes),
        module: Module::empty(name),
        features,
        keep_names,
        pending_sigs: vec![],
        seen_code: false,
    };
    d.run()?;
    Ok(d.module)
}

impl<'a> Decoder<'a> {
    fn run(&mut self) -> Result<()> {
        let magic = self.s.read_bytes(4).context("reading magic number")?;
        if magic != MAGIC {
            bail!("not a WebAssembly module: bad magic number");
        }
        let version = self.s.read_bytes(4).context("reading version")?;
        if version != VERSION {
            bail!(
                "unsupported module version {}",
                u32::from_le_bytes([version[0], version[1], version[2], version[3]])
            );
        }

        let mut last_id = 0u8;
        while self.s.remaining() > 0 {
            let at = self.s.pos();
            let id = self.s.read_byte()?;
            if id > SEC_DATA {
                bail!("unknown section id {} at offset {}", id, at);
            }
            if id != SEC_CUSTOM {
                if id == last_id {
                    bail!("duplicate section id {} at offset {}", id, at);
                }
                if id < last_id {
                    bail!("out-of-order section id {} at offset {}", id, at);
                }
                last_id = id;
            }
            let size = self.s.read_u32()? as usize;
            if size > self.s.remaining() {
                bail!("section size {} overruns stream at offset {}", size, at);
            }
            let end = self.s.pos() + size;
            self.section(id, end)
                .with_context(|| format!("in section id {} at offset {}", id, at))?;
            if self.s.pos() != end {
                let consumed = size as i64 - (end as i64 - self.s.pos() as i64);
                bail!(
                    "section size mismatch: section id {} declared {} bytes, consumed {}",
                    id,
                    size,
                    consumed
                );
            }
        }

        if !self.pending_sigs.is_empty() && !self.seen_code {
            bail!(
                "function section declares {} functions but there is no code section",
                self.pending_sigs.len()
            );
        }
        Ok(())
    }

    fn section(&mut self, id: u8, end: usize) -> Result<()> {
        match id {
            SEC_CUSTOM => self.custom_section(end),
            SEC_TYPE => self.type_section(),
            SEC_IMPORT => self.import_section(),
            SEC_FUNCTION => self.function_section(),
            SEC_TABLE => self.table_section(),
            SEC_MEMORY => self.memory_section(),
            SEC_GLOBAL => self.global_section(),
            SEC_EXPORT => self.export_section(),
            SEC_START => self.start_section(),
            SEC_ELEMENT => self.element_section(),
            SEC_CODE => self.code_section(),
            SEC_DATA => self.data_section(),
            _ => unreachable!(),
        }
    }

    fn custom_section(&mut self, end: usize) -> Result<()> {
        let name = self.s.read_name()?;
        let body = self.s.read_bytes(end - self.s.pos())?.to_vec();
        if name == "name" && self.keep_names {
            if let Err(e) = self.parse_name_section(&body) {
                // Debug names are best-effort; a broken name section
                // does not fail the module.
                log::warn!("ignoring malformed name section: {:#}", e);
            }
        }
        self.module.custom_sections.insert(name, body);
        Ok(())
    }

    fn parse_name_section(&mut self, body: &[u8]) -> Result<()> {
        let mut s = Stream::new(body);
        while s.remaining() > 0 {
            let kind = s.read_byte()?;
            let size = s.read_u32()? as usize;
            if kind == 1 {
                // Function names.
                let count = s.read_u32()?;
                for _ in 0..count {
                    let idx = s.read_u32()?;
                    let name = s.read_name()?;
                    self.module.func_names.insert(Func::new(idx as usize), name);
                }
            } else {
                s.read_bytes(size)?;
            }
        }
        Ok(())
    }

    fn type_section(&mut self) -> Result<()> {
        let count = self.s.read_u32()?;
        for _ in 0..count {
            let form = self.s.read_byte()?;
            if form != 0x60 {
                bail!("invalid function type form 0x{:02x}", form);
            }
            let nparams = self.s.read_u32()?;
            let mut params = Vec::with_capacity(nparams as usize);
            for _ in 0..nparams {
                params.push(self.s.read_type()?);
            }
            let nresults = self.s.read_u32()?;
            if nresults > 1 && !self.features.contains(Features::MULTI_VALUE) {
                bail!("multiple results require the multi-value feature");
            }
            let mut results = Vec::with_capacity(nresults as usize);
            for _ in 0..nresults {
                results.push(self.s.read_type()?);
            }
            self.module.signatures.push(SignatureData { params, results });
        }
        Ok(())
    }

    fn import_section(&mut self) -> Result<()> {
        let count = self.s.read_u32()?;
        for _ in 0..count {
            let module = self.s.read_name()?;
            let name = self.s.read_name()?;
            let at = self.s.pos();
            let kind = match self.s.read_byte()? {
                0x00 => {
                    let sig = Signature::new(self.s.read_u32()? as usize);
                    ImportKind::Func(self.module.funcs.push(FuncDecl::Import(sig)))
                }
                0x01 => {
                    let elem = self.s.read_byte()?;
                    if elem != 0x70 {
                        bail!("invalid table element type 0x{:02x}", elem);
                    }
                    let limits = self.s.read_limits()?;
                    ImportKind::Table(self.module.tables.push(TableData { limits }))
                }
                0x02 => {
                    let limits = self.s.read_limits()?;
                    ImportKind::Memory(self.module.memories.push(MemoryData { limits }))
                }
                0x03 => {
                    let ty = self.s.read_type()?;
                    let mutable = match self.s.read_byte()? {
                        0x00 => false,
                        0x01 => true,
                        m => bail!("invalid mutability 0x{:02x}", m),
                    };
                    ImportKind::Global(self.module.globals.push(GlobalData {
                        ty,
                        mutable,
                        init: vec![],
                    }))
                }
                k => bail!("invalid import kind 0x{:02x} at offset {}", k, at),
            };
            self.module.imports.push(Import { module, name, kind });
        }
        Ok(())
    }

    fn function_section(&mut self) -> Result<()> {
        let count = self.s.read_u32()?;
        for _ in 0..count {
            self.pending_sigs
                .push(Signature::new(self.s.read_u32()? as usize));
        }
        Ok(())
    }

    fn table_section(&mut self) -> Result<()> {
        let count = self.s.read_u32()?;
        for _ in 0..count {
            let elem = self.s.read_byte()?;
            if elem != 0x70 {
                bail!("invalid table element type 0x{:02x}", elem);
            }
            let limits = self.s.read_limits()?;
            self.module.tables.push(TableData { limits });
        }
        Ok(())
    }

    fn memory_section(&mut self) -> Result<()> {
        let count = self.s.read_u32()?;
        for _ in 0..count {
            let limits = self.s.read_limits()?;
            self.module.memories.push(MemoryData { limits });
        }
        Ok(())
    }

    fn global_section(&mut self) -> Result<()> {
        let count = self.s.read_u32()?;
        for _ in 0..count {
            let ty = self.s.read_type()?;
            let mutable = match self.s.read_byte()? {
                0x00 => false,
                0x01 => true,
                m => bail!("invalid mutability 0x{:02x}", m),
            };
            let init = self.read_const_expr()?;
            self.module.globals.push(GlobalData { ty, mutable, init });
        }
        Ok(())
    }

    fn export_section(&mut self) -> Result<()> {
        let count = self.s.read_u32()?;
        for _ in 0..count {
            let name = self.s.read_name()?;
            let kind = self.s.read_byte()?;
            let index = self.s.read_u32()? as usize;
            let kind = match kind {
                0x00 => ExportKind::Func(Func::new(index)),
                0x01 => ExportKind::Table(Table::new(index)),
                0x02 => ExportKind::Memory(Memory::new(index)),
                0x03 => ExportKind::Global(Global::new(index)),
                k => bail!("invalid export kind 0x{:02x}", k),
            };
            if self.module.exports.insert(name.clone(), kind).is_some() {
                bail!("duplicate export name {:?}", name);
            }
        }
        Ok(())
    }

    fn start_section(&mut self) -> Result<()> {
        self.module.start = Some(Func::new(self.s.read_u32()? as usize));
        Ok(())
    }

    fn element_section(&mut self) -> Result<()> {
        let count = self.s.read_u32()?;
        for _ in 0..count {
            let table = Table::new(self.s.read_u32()? as usize);
            let offset = self.read_const_expr()?;
            let nfuncs = self.s.read_u32()?;
            let mut funcs = Vec::with_capacity(nfuncs as usize);
            for _ in 0..nfuncs {
                funcs.push(Func::new(self.s.read_u32()? as usize));
            }
            self.module.elements.push(ElementSegment {
                table,
                offset,
                funcs,
            });
        }
        Ok(())
    }

    fn code_section(&mut self) -> Result<()> {
        self.seen_code = true;
        let count = self.s.read_u32()? as usize;
        if count != self.pending_sigs.len() {
            bail!(
                "code section has {} entries but function section declared {}",
                count,
                self.pending_sigs.len()
            );
        }
        for i in 0..count {
            let sig = self.pending_sigs[i];
            let size = self.s.read_u32()? as usize;
            let end = self.s.pos() + size;
            let body = self
                .read_function_body(end)
                .with_context(|| format!("in code entry {}", i))?;
            if self.s.pos() != end {
                bail!("code entry {} did not end at its declared boundary", i);
            }
            self.module.funcs.push(FuncDecl::Body(sig, body));
        }
        self.pending_sigs.clear();
        Ok(())
    }

    fn read_function_body(&mut self, end: usize) -> Result<FunctionBody> {
        let ngroups = self.s.read_u32()?;
        let mut locals = Vec::with_capacity(ngroups as usize);
        let mut total: u64 = 0;
        for _ in 0..ngroups {
            let n = self.s.read_u32()?;
            let ty = self.s.read_type()?;
            total += n as u64;
            locals.push((n, ty));
        }
        if total > u32::MAX as u64 {
            bail!("too many locals");
        }

        let mut insts = vec![];
        let mut depth = 1usize;
        loop {
            if self.s.pos() >= end {
                bail!("function body missing terminating end opcode");
            }
            let op = read_operator(&mut self.s, self.features)?;
            match op {
                Operator::Block { .. } | Operator::Loop { .. } | Operator::If { .. } => depth += 1,
                Operator::End => {
                    depth -= 1;
                    if depth == 0 {
                        // Function-level end: implicit in the IR.
                        break;
                    }
                }
                _ => {}
            }
            insts.push(op);
        }
        Ok(FunctionBody { locals, insts })
    }

    fn data_section(&mut self) -> Result<()> {
        let count = self.s.read_u32()?;
        for _ in 0..count {
            let memory = Memory::new(self.s.read_u32()? as usize);
            let offset = self.read_const_expr()?;
            let len = self.s.read_u32()? as usize;
            let data = self.s.read_bytes(len)?.to_vec();
            self.module.data.push(DataSegment {
                memory,
                offset,
                data,
            });
        }
        Ok(())
    }

    /// An initializer expression: operators up to (not including) the
    /// terminating `end`. Const-ness is the validator's concern.
    fn read_const_expr(&mut self) -> Result<Vec<Operator>> {
        let mut ops = vec![];
        loop {
            let op = read_operator(&mut self.s, self.features)?;
            if op == Operator::End {
                return Ok(ops);
            }
            match op {
                Operator::Block { .. } | Operator::Loop { .. } | Operator::If { .. } => {
                    bail!("block in initializer expression")
                }
                _ => ops.push(op),
            }
        }
    }
}

fn read_block_type(s: &mut Stream, features: Features) -> Result<BlockType> {
    let at = s.pos();
    let b = s.read_byte()?;
    if b == 0x40 {
        return Ok(BlockType::Empty);
    }
    if let Some(ty) = Type::from_code(b) {
        return Ok(BlockType::Value(ty));
    }
    if features.contains(Features::MULTI_VALUE) && b & 0x80 == 0 && b & 0x40 == 0 {
        // Single-byte positive s33: a type index.
        return Ok(BlockType::Sig(Signature::new(b as usize)));
    }
    if features.contains(Features::MULTI_VALUE) {
        // Rewind and take the full s33 path.
        let mut rest = Stream {
            data: s.data,
            pos: at,
        };
        let v = rest.read_s33()?;
        s.pos = rest.pos;
        if v < 0 {
            bail!("invalid block type at offset {}", at);
        }
        return Ok(BlockType::Sig(Signature::new(v as usize)));
    }
    bail!("invalid block type 0x{:02x} at offset {}", b, at)
}

fn read_memarg(s: &mut Stream) -> Result<MemArg> {
    let align = s.read_u32()?;
    let offset = s.read_u32()?;
    Ok(MemArg { align, offset })
}

/// Decode one operator, immediates included.
pub fn read_operator(s: &mut Stream, features: Features) -> Result<Operator> {
    use Operator::*;
    let at = s.pos();
    let opcode = s.read_byte()?;
    Ok(match opcode {
        0x00 => Unreachable,
        0x01 => Nop,
        0x02 => Block {
            ty: read_block_type(s, features)?,
        },
        0x03 => Loop {
            ty: read_block_type(s, features)?,
        },
        0x04 => If {
            ty: read_block_type(s, features)?,
        },
        0x05 => Else,
        0x0B => End,
        0x0C => Br {
            depth: s.read_u32()?,
        },
        0x0D => BrIf {
            depth: s.read_u32()?,
        },
        0x0E => {
            let count = s.read_u32()?;
            let mut targets = Vec::with_capacity(count as usize);
            for _ in 0..count {
                targets.push(s.read_u32()?);
            }
            let default = s.read_u32()?;
            BrTable { targets, default }
        }
        0x0F => Return,
        0x10 => Call {
            function_index: Func::new(s.read_u32()? as usize),
        },
        0x11 => {
            let sig_index = Signature::new(s.read_u32()? as usize);
            let table_index = Table::new(s.read_u32()? as usize);
            CallIndirect {
                sig_index,
                table_index,
            }
        }
        0x1A => Drop,
        0x1B => Select,
        0x20 => LocalGet {
            local_index: crate::ir::Local::new(s.read_u32()? as usize),
        },
        0x21 => LocalSet {
            local_index: crate::ir::Local::new(s.read_u32()? as usize),
        },
        0x22 => LocalTee {
            local_index: crate::ir::Local::new(s.read_u32()? as usize),
        },
        0x23 => GlobalGet {
            global_index: Global::new(s.read_u32()? as usize),
        },
        0x24 => GlobalSet {
            global_index: Global::new(s.read_u32()? as usize),
        },
        0x28 => I32Load {
            memory: read_memarg(s)?,
        },
        0x29 => I64Load {
            memory: read_memarg(s)?,
        },
        0x2A => F32Load {
            memory: read_memarg(s)?,
        },
        0x2B => F64Load {
            memory: read_memarg(s)?,
        },
        0x2C => I32Load8S {
            memory: read_memarg(s)?,
        },
        0x2D => I32Load8U {
            memory: read_memarg(s)?,
        },
        0x2E => I32Load16S {
            memory: read_memarg(s)?,
        },
        0x2F => I32Load16U {
            memory: read_memarg(s)?,
        },
        0x30 => I64Load8S {
            memory: read_memarg(s)?,
        },
        0x31 => I64Load8U {
            memory: read_memarg(s)?,
        },
        0x32 => I64Load16S {
            memory: read_memarg(s)?,
        },
        0x33 => I64Load16U {
            memory: read_memarg(s)?,
        },
        0x34 => I64Load32S {
            memory: read_memarg(s)?,
        },
        0x35 => I64Load32U {
            memory: read_memarg(s)?,
        },
        0x36 => I32Store {
            memory: read_memarg(s)?,
        },
        0x37 => I64Store {
            memory: read_memarg(s)?,
        },
        0x38 => F32Store {
            memory: read_memarg(s)?,
        },
        0x39 => F64Store {
            memory: read_memarg(s)?,
        },
        0x3A => I32Store8 {
            memory: read_memarg(s)?,
        },
        0x3B => I32Store16 {
            memory: read_memarg(s)?,
        },
        0x3C => I64Store8 {
            memory: read_memarg(s)?,
        },
        0x3D => I64Store16 {
            memory: read_memarg(s)?,
        },
        0x3E => I64Store32 {
            memory: read_memarg(s)?,
        },
        0x3F => MemorySize {
            mem: Memory::new(s.read_u32()? as usize),
        },
        0x40 => MemoryGrow {
            mem: Memory::new(s.read_u32()? as usize),
        },
        0x41 => I32Const {
            value: s.read_i32()?,
        },
        0x42 => I64Const {
            value: s.read_i64()?,
        },
        0x43 => F32Const {
            bits: s.read_f32_bits()?,
        },
        0x44 => F64Const {
            bits: s.read_f64_bits()?,
        },
        0x45 => I32Eqz,
        0x46 => I32Eq,
        0x47 => I32Ne,
        0x48 => I32LtS,
        0x49 => I32LtU,
        0x4A => I32GtS,
        0x4B => I32GtU,
        0x4C => I32LeS,
        0x4D => I32LeU,
        0x4E => I32GeS,
        0x4F => I32GeU,
        0x50 => I64Eqz,
        0x51 => I64Eq,
        0x52 => I64Ne,
        0x53 => I64LtS,
        0x54 => I64LtU,
        0x55 => I64GtS,
        0x56 => I64GtU,
        0x57 => I64LeS,
        0x58 => I64LeU,
        0x59 => I64GeS,
        0x5A => I64GeU,
        0x5B => F32Eq,
        0x5C => F32Ne,
        0x5D => F32Lt,
        0x5E => F32Gt,
        0x5F => F32Le,
        0x60 => F32Ge,
        0x61 => F64Eq,
        0x62 => F64Ne,
        0x63 => F64Lt,
        0x64 => F64Gt,
        0x65 => F64Le,
        0x66 => F64Ge,
        0x67 => I32Clz,
        0x68 => I32Ctz,
        0x69 => I32Popcnt,
        0x6A => I32Add,
        0x6B => I32Sub,
        0x6C => I32Mul,
        0x6D => I32DivS,
        0x6E => I32DivU,
        0x6F => I32RemS,
        0x70 => I32RemU,
        0x71 => I32And,
        0x72 => I32Or,
        0x73 => I32Xor,
        0x74 => I32Shl,
        0x75 => I32ShrS,
        0x76 => I32ShrU,
        0x77 => I32Rotl,
        0x78 => I32Rotr,
        0x79 => I64Clz,
        0x7A => I64Ctz,
        0x7B => I64Popcnt,
        0x7C => I64Add,
        0x7D => I64Sub,
        0x7E => I64Mul,
        0x7F => I64DivS,
        0x80 => I64DivU,
        0x81 => I64RemS,
        0x82 => I64RemU,
        0x83 => I64And,
        0x84 => I64Or,
        0x85 => I64Xor,
        0x86 => I64Shl,
        0x87 => I64ShrS,
        0x88 => I64ShrU,
        0x89 => I64Rotl,
        0x8A => I64Rotr,
        0x8B => F32Abs,
        0x8C => F32Neg,
        0x8D => F32Ceil,
        0x8E => F32Floor,
        0x8F => F32Trunc,
        0x90 => F32Nearest,
        0x91 => F32Sqrt,
        0x92 => F32Add,
        0x93 => F32Sub,
        0x94 => F32Mul,
        0x95 => F32Div,
        0x96 => F32Min,
        0x97 => F32Max,
        0x98 => F32Copysign,
        0x99 => F64Abs,
        0x9A => F64Neg,
        0x9B => F64Ceil,
        0x9C => F64Floor,
        0x9D => F64Trunc,
        0x9E => F64Nearest,
        0x9F => F64Sqrt,
        0xA0 => F64Add,
        0xA1 => F64Sub,
        0xA2 => F64Mul,
        0xA3 => F64Div,
        0xA4 => F64Min,
        0xA5 => F64Max,
        0xA6 => F64Copysign,
        0xA7 => I32WrapI64,
        0xA8 => I32TruncF32S,
        0xA9 => I32TruncF32U,
        0xAA => I32TruncF64S,
        0xAB => I32TruncF64U,
        0xAC => I64ExtendI32S,
        0xAD => I64ExtendI32U,
        0xAE => I64TruncF32S,
        0xAF => I64TruncF32U,
        0xB0 => I64TruncF64S,
        0xB1 => I64TruncF64U,
        0xB2 => F32ConvertI32S,
        0xB3 => F32ConvertI32U,
        0xB4 => F32ConvertI64S,
        0xB5 => F32ConvertI64U,
        0xB6 => F32DemoteF64,
        0xB7 => F64ConvertI32S,
        0xB8 => F64ConvertI32U,
        0xB9 => F64ConvertI64S,
        0xBA => F64ConvertI64U,
        0xBB => F64PromoteF32,
        0xBC => I32ReinterpretF32,
        0xBD => I64ReinterpretF64,
        0xBE => F32ReinterpretI32,
        0xBF => F64ReinterpretI64,
        0xC0..=0xC4 => {
            if !features.contains(Features::SIGN_EXT) {
                bail!(
                    "opcode 0x{:02x} at offset {} requires the sign-extension feature",
                    opcode,
                    at
                );
            }
            match opcode {
                0xC0 => I32Extend8S,
                0xC1 => I32Extend16S,
                0xC2 => I64Extend8S,
                0xC3 => I64Extend16S,
                _ => I64Extend32S,
            }
        }
        _ => bail!("invalid opcode 0x{:02x} at offset {}", opcode, at),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn leb(bytes: &[u8]) -> Stream {
        Stream::new(bytes)
    }

    #[test]
    fn u32_leb128() {
        assert_eq!(leb(&[0x00]).read_u32().unwrap(), 0);
        assert_eq!(leb(&[0x7F]).read_u32().unwrap(), 127);
        assert_eq!(leb(&[0x80, 0x01]).read_u32().unwrap(), 128);
        assert_eq!(
            leb(&[0xFF, 0xFF, 0xFF, 0xFF, 0x0F]).read_u32().unwrap(),
            u32::MAX
        );
        // Unused high bits in the fifth byte.
        assert!(leb(&[0xFF, 0xFF, 0xFF, 0xFF, 0x1F]).read_u32().is_err());
        // Six bytes.
        assert!(leb(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]).read_u32().is_err());
        // Truncated.
        assert!(leb(&[0x80]).read_u32().is_err());
    }

    #[test]
    fn i32_sleb128() {
        assert_eq!(leb(&[0x7F]).read_i32().unwrap(), -1);
        assert_eq!(leb(&[0x3F]).read_i32().unwrap(), 63);
        assert_eq!(leb(&[0x40]).read_i32().unwrap(), -64);
        assert_eq!(
            leb(&[0x80, 0x80, 0x80, 0x80, 0x78]).read_i32().unwrap(),
            i32::MIN
        );
        assert_eq!(
            leb(&[0xFF, 0xFF, 0xFF, 0xFF, 0x07]).read_i32().unwrap(),
            i32::MAX
        );
    }

    #[test]
    fn empty_module() {
        let bytes = b"\0asm\x01\0\0\0";
        let m = decode_module(bytes, "empty", Features::all(), false).unwrap();
        assert!(m.signatures.is_empty());
        assert!(m.funcs.is_empty());
        assert!(m.exports.is_empty());
        assert!(m.start.is_none());
    }

    #[test]
    fn bad_magic() {
        let err = decode_module(b"\0as_\x01\0\0\0", "m", Features::all(), false)
            .unwrap_err()
            .to_string();
        assert!(err.contains("magic"), "{}", err);
    }

    #[test]
    fn truncated_header() {
        assert!(decode_module(b"\0asm\x01", "m", Features::all(), false).is_err());
    }

    #[test]
    fn unknown_section_rejected() {
        let bytes = b"\0asm\x01\0\0\0\x0C\x00";
        assert!(decode_module(bytes, "m", Features::all(), false).is_err());
    }

    #[test]
    fn out_of_order_sections_rejected() {
        // Function section (3) then type section (1).
        let bytes = b"\0asm\x01\0\0\0\x03\x01\x00\x01\x01\x00";
        let err = decode_module(bytes, "m", Features::all(), false)
            .unwrap_err()
            .to_string();
        assert!(err.contains("out-of-order"), "{}", err);
    }

    #[test]
    fn duplicate_section_rejected() {
        let bytes = b"\0asm\x01\0\0\0\x01\x01\x00\x01\x01\x00";
        let err = decode_module(bytes, "m", Features::all(), false)
            .unwrap_err()
            .to_string();
        assert!(err.contains("duplicate section"), "{}", err);
    }

    #[test]
    fn section_size_mismatch_rejected() {
        // Type section claims 2 bytes but its count consumes 1.
        let bytes = b"\0asm\x01\0\0\0\x01\x02\x00\x60";
        assert!(decode_module(bytes, "m", Features::all(), false).is_err());
    }

    // (module (func (param i32 i32) (result i32) local.get 0
    //   local.get 1 i32.add) (export "add" (func 0)))
    const ADD_WASM: &[u8] = &[
        0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00, // header
        0x01, 0x07, 0x01, 0x60, 0x02, 0x7F, 0x7F, 0x01, 0x7F, // type
        0x03, 0x02, 0x01, 0x00, // function
        0x07, 0x07, 0x01, 0x03, b'a', b'd', b'd', 0x00, 0x00, // export
        0x0A, 0x09, 0x01, 0x07, 0x00, 0x20, 0x00, 0x20, 0x01, 0x6A, 0x0B, // code
    ];

    #[test]
    fn decode_add_module() {
        let m = decode_module(ADD_WASM, "add", Features::all(), false).unwrap();
        assert_eq!(m.signatures.len(), 1);
        assert_eq!(m.funcs.len(), 1);
        assert_eq!(m.num_defined_funcs(), 1);
        let body = m.funcs.values().next().unwrap().body().unwrap();
        assert_eq!(
            body.insts,
            vec![
                Operator::LocalGet {
                    local_index: crate::ir::Local::new(0)
                },
                Operator::LocalGet {
                    local_index: crate::ir::Local::new(1)
                },
                Operator::I32Add,
            ]
        );
        assert!(matches!(m.exports.get("add"), Some(ExportKind::Func(_))));
    }

    #[test]
    fn code_count_mismatch_rejected() {
        // Function section declares one function, no code section.
        let bytes = b"\0asm\x01\0\0\0\x01\x04\x01\x60\x00\x00\x03\x02\x01\x00";
        let err = decode_module(bytes, "m", Features::all(), false)
            .unwrap_err()
            .to_string();
        assert!(err.contains("no code section"), "{}", err);
    }

    #[test]
    fn sign_ext_feature_gated() {
        let mut body = ADD_WASM.to_vec();
        // Swap i32.add (0x6A) for i32.extend8_s (0xC0); now the body
        // is typed wrong but decoding should depend only on features.
        let pos = body.iter().position(|&b| b == 0x6A).unwrap();
        body[pos] = 0xC0;
        assert!(decode_module(&body, "m", Features::all(), false).is_ok());
        assert!(decode_module(&body, "m", Features::empty(), false).is_err());
    }
}
