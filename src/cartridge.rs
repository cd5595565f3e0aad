//! The binary cartridge container and the program table codec.
//!
//! Everything is little-endian with fixed 32-byte names and no padding
//! between declared fields, so the header is read through a bounds-checked
//! cursor rather than by casting structs over the file. Malformed input of
//! any kind fails cleanly; offsets are validated before a single table is
//! touched.

use std::convert::TryInto;
use std::path::Path;

use crate::buffer::{DType, TensorInfo, MAX_DIMS};
use crate::program::{
    BindingFlags, Instruction, OpCode, Program, ProgramError, Strategy, Symbol, SymbolFlags,
    Task, TaskBinding, TensorFlags, MAX_SRC,
};

/// File magic, `"DLM1"` in little-endian byte order.
pub const CARTRIDGE_MAGIC: u32 = 0x314d_4c44;

/// Fixed length of cartridge and symbol names on the wire.
pub const NAME_LEN: usize = 32;

const CARTRIDGE_HEADER_LEN: usize = 4 + NAME_LEN + 4 + 4 + 3 + 4 + 4;
const SECTION_HEADER_LEN: usize = NAME_LEN + 4 + 8 + 8;

/// What a section payload contains.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum SectionKind {
    Program = 1,
    Image = 2,
    Font = 3,
    /// An opaque pipeline description blob, parsed by the host.
    Pipeline = 4,
}

impl SectionKind {
    pub fn from_u32(raw: u32) -> Option<SectionKind> {
        Some(match raw {
            1 => SectionKind::Program,
            2 => SectionKind::Image,
            3 => SectionKind::Font,
            4 => SectionKind::Pipeline,
            _ => return None,
        })
    }
}

/// Why a cartridge could not be decoded. The engine is never touched by a
/// failed load.
#[derive(Debug, thiserror::Error)]
pub enum CartridgeError {
    #[error("malformed cartridge: {0}")]
    Malformed(&'static str),
    #[error("program rejected: {0}")]
    Program(#[from] ProgramError),
    #[error("failed to read cartridge: {0}")]
    Io(#[from] std::io::Error),
}

/// Host-facing fields of the cartridge header.
#[derive(Clone, Debug, Default)]
pub struct CartridgeHeader {
    pub app_title: String,
    pub window_width: u32,
    pub window_height: u32,
    pub resizable: bool,
    pub vsync: bool,
    pub fullscreen: bool,
    pub num_threads: u32,
}

struct SectionEntry {
    name: String,
    kind: u32,
    offset: u64,
    size: u64,
}

/// A parsed cartridge: the raw bytes plus a validated section index.
pub struct Cartridge {
    data: Vec<u8>,
    header: CartridgeHeader,
    sections: Vec<SectionEntry>,
}

impl Cartridge {
    /// Read and parse a cartridge file.
    pub fn open(path: impl AsRef<Path>) -> Result<Cartridge, CartridgeError> {
        Cartridge::from_bytes(std::fs::read(path)?)
    }

    /// Parse a cartridge from an in-memory image.
    pub fn from_bytes(data: Vec<u8>) -> Result<Cartridge, CartridgeError> {
        let mut cursor = Cursor::new(&data);

        if cursor.u32()? != CARTRIDGE_MAGIC {
            return Err(CartridgeError::Malformed("bad magic"));
        }

        let header = CartridgeHeader {
            app_title: cursor.name()?,
            window_width: cursor.u32()?,
            window_height: cursor.u32()?,
            resizable: cursor.u8()? != 0,
            vsync: cursor.u8()? != 0,
            fullscreen: cursor.u8()? != 0,
            num_threads: cursor.u32()?,
        };

        let section_count = cursor.u32()? as usize;
        if section_count > cursor.remaining() / SECTION_HEADER_LEN {
            return Err(CartridgeError::Malformed("section table truncated"));
        }

        let mut sections = Vec::with_capacity(section_count);
        for _ in 0..section_count {
            let entry = SectionEntry {
                name: cursor.name()?,
                kind: cursor.u32()?,
                offset: cursor.u64()?,
                size: cursor.u64()?,
            };
            let end = entry
                .offset
                .checked_add(entry.size)
                .ok_or(CartridgeError::Malformed("section range overflows"))?;
            if end > data.len() as u64 {
                return Err(CartridgeError::Malformed("section out of bounds"));
            }
            sections.push(entry);
        }

        Ok(Cartridge {
            data,
            header,
            sections,
        })
    }

    pub fn header(&self) -> &CartridgeHeader {
        &self.header
    }

    /// Names and kinds of every section, in declaration order.
    pub fn sections(&self) -> impl Iterator<Item = (&str, Option<SectionKind>)> {
        self.sections
            .iter()
            .map(|entry| (entry.name.as_str(), SectionKind::from_u32(entry.kind)))
    }

    /// The payload of the named section, if present with the right kind.
    pub fn section(&self, name: &str, kind: SectionKind) -> Option<&[u8]> {
        self.sections
            .iter()
            .find(|entry| entry.kind == kind as u32 && entry.name == name)
            .map(|entry| &self.data[entry.offset as usize..(entry.offset + entry.size) as usize])
    }

    /// Decode every program section, in declaration order, with its name.
    pub fn programs(&self) -> Result<Vec<(String, Program)>, CartridgeError> {
        let mut programs = Vec::new();
        for entry in &self.sections {
            if entry.kind == SectionKind::Program as u32 {
                let bytes =
                    &self.data[entry.offset as usize..(entry.offset + entry.size) as usize];
                programs.push((entry.name.clone(), decode_program(bytes)?));
            }
        }
        Ok(programs)
    }
}

/// Assembles a cartridge image; the exact inverse of [`Cartridge::from_bytes`].
pub struct CartridgeBuilder {
    header: CartridgeHeader,
    sections: Vec<(String, SectionKind, Vec<u8>)>,
}

impl CartridgeBuilder {
    pub fn new(app_title: &str) -> CartridgeBuilder {
        CartridgeBuilder {
            header: CartridgeHeader {
                app_title: app_title.to_owned(),
                ..CartridgeHeader::default()
            },
            sections: Vec::new(),
        }
    }

    pub fn window(mut self, width: u32, height: u32) -> Self {
        self.header.window_width = width;
        self.header.window_height = height;
        self
    }

    pub fn presentation(mut self, resizable: bool, vsync: bool, fullscreen: bool) -> Self {
        self.header.resizable = resizable;
        self.header.vsync = vsync;
        self.header.fullscreen = fullscreen;
        self
    }

    pub fn num_threads(mut self, num_threads: u32) -> Self {
        self.header.num_threads = num_threads;
        self
    }

    pub fn section(mut self, name: &str, kind: SectionKind, payload: Vec<u8>) -> Self {
        self.sections.push((name.to_owned(), kind, payload));
        self
    }

    /// Encode and append a program section.
    pub fn program(self, name: &str, program: &Program) -> Self {
        let payload = encode_program(program);
        self.section(name, SectionKind::Program, payload)
    }

    /// Serialize. Section payloads follow the header back to back; offsets
    /// are derived, so identical inputs produce identical bytes.
    pub fn build(self) -> Vec<u8> {
        let mut out = Out::new();
        out.u32(CARTRIDGE_MAGIC);
        out.name(&self.header.app_title);
        out.u32(self.header.window_width);
        out.u32(self.header.window_height);
        out.u8(self.header.resizable as u8);
        out.u8(self.header.vsync as u8);
        out.u8(self.header.fullscreen as u8);
        out.u32(self.header.num_threads);
        out.u32(self.sections.len() as u32);

        let mut offset =
            (CARTRIDGE_HEADER_LEN + self.sections.len() * SECTION_HEADER_LEN) as u64;
        for (name, kind, payload) in &self.sections {
            out.name(name);
            out.u32(*kind as u32);
            out.u64(offset);
            out.u64(payload.len() as u64);
            offset += payload.len() as u64;
        }
        for (_, _, payload) in &self.sections {
            out.bytes.extend_from_slice(payload);
        }
        out.bytes
    }
}

// --- Program section codec ---

const INSTRUCTION_LEN: usize = 2 + 2 + 2 * MAX_SRC;
const SYMBOL_LEN: usize = NAME_LEN + NAME_LEN + 2 + 1;
const TASK_LEN: usize = 4 + 4 + 2 + 1 + 4 + 4;
const TASK_BINDING_LEN: usize = 2 + 1;
const TENSOR_DESC_LEN: usize = 1 + 1 + 1 + 4 * MAX_DIMS + 4 * MAX_DIMS;

/// Decode a program section payload into an owned, validated [`Program`].
///
/// Every table is copied out of the input; scalar constants are distributed
/// from the push-constant block and non-scalar constants get their own
/// allocations.
pub fn decode_program(bytes: &[u8]) -> Result<Program, CartridgeError> {
    let mut cursor = Cursor::new(bytes);

    let instruction_count = cursor.u32()? as usize;
    let symbol_count = cursor.u32()? as usize;
    let task_count = cursor.u32()? as usize;
    let binding_count = cursor.u32()? as usize;
    let tensor_count = cursor.u32()? as usize;
    let reduction_scratch_size = cursor.u32()?;
    let sync_scratch_size = cursor.u32()?;
    let push_constants_size = cursor.u32()? as usize;

    let mut program = Program::default();
    program.meta.reduction_scratch_size = reduction_scratch_size;
    program.meta.sync_scratch_size = sync_scratch_size;
    program.meta.push_constants_size = push_constants_size as u32;

    program.code = Vec::with_capacity(instruction_count.min(1 << 16));
    for _ in 0..instruction_count {
        let opcode = OpCode::from_u16(cursor.u16()?)
            .ok_or(CartridgeError::Malformed("unknown opcode"))?;
        let dest = cursor.u16()?;
        let mut src = [0u16; MAX_SRC];
        for slot in src.iter_mut() {
            *slot = cursor.u16()?;
        }
        program.code.push(Instruction { opcode, dest, src });
    }

    for _ in 0..symbol_count {
        let name = cursor.name()?;
        let provider = cursor.name()?;
        let register = cursor.u16()?;
        let flags = SymbolFlags::from_bits_truncate(cursor.u8()?);
        program.symbols.push(Symbol {
            name_hash: crate::program::fnv1a(&name),
            name,
            provider: if provider.is_empty() {
                None
            } else {
                Some(provider)
            },
            register,
            flags,
        });
    }

    for _ in 0..task_count {
        let start_inst = cursor.u32()?;
        let inst_count = cursor.u32()?;
        let domain_reg = cursor.u16()?;
        let strategy = Strategy::from_u8(cursor.u8()?)
            .ok_or(CartridgeError::Malformed("unknown task strategy"))?;
        let binding_offset = cursor.u32()?;
        let binding_count = cursor.u32()?;
        program.tasks.push(Task {
            start_inst,
            inst_count,
            domain_reg,
            strategy,
            binding_offset,
            binding_count,
        });
    }

    for _ in 0..binding_count {
        let register = cursor.u16()?;
        let flags = BindingFlags::from_bits_truncate(cursor.u8()?);
        program.bindings.push(TaskBinding { register, flags });
    }

    for _ in 0..tensor_count {
        let dtype = DType::from_u8(cursor.u8()?)
            .ok_or(CartridgeError::Malformed("unknown element type"))?;
        let flags = TensorFlags::from_bits_truncate(cursor.u8()?);
        let ndim = cursor.u8()?;
        if ndim as usize > MAX_DIMS {
            return Err(CartridgeError::Malformed("tensor rank exceeds maximum"));
        }
        let mut info = TensorInfo::scalar(dtype);
        info.ndim = ndim;
        for d in 0..MAX_DIMS {
            info.shape[d] = cursor.i32()?;
        }
        for d in 0..MAX_DIMS {
            info.strides[d] = cursor.i32()?;
        }
        program.tensors.push(info);
        program.tensor_flags.push(flags);
        program.tensor_data.push(None);
    }

    // Scalar constants live packed in the push-constant block, in register
    // declaration order.
    let push_block = cursor.take(push_constants_size)?;
    let mut push_offset = 0usize;
    for reg in 0..tensor_count {
        let flags = program.tensor_flags[reg];
        let info = &program.tensors[reg];
        if !flags.contains(TensorFlags::CONSTANT) || info.ndim != 0 {
            continue;
        }
        let size = info.dtype.size();
        if push_offset + size > push_block.len() {
            return Err(CartridgeError::Malformed("push constant block truncated"));
        }
        program.tensor_data[reg] =
            Some(push_block[push_offset..push_offset + size].to_vec().into());
        push_offset += size;
    }
    if push_offset != push_block.len() {
        return Err(CartridgeError::Malformed("push constant block size mismatch"));
    }

    // Non-scalar constants follow as one contiguous blob per tensor.
    for reg in 0..tensor_count {
        let flags = program.tensor_flags[reg];
        let info = program.tensors[reg];
        if !flags.contains(TensorFlags::CONSTANT) || info.ndim == 0 {
            continue;
        }
        let blob = cursor.take(info.size_bytes())?;
        program.tensor_data[reg] = Some(blob.to_vec().into());
    }

    program.validate()?;
    Ok(program)
}

/// Encode a program section payload; the exact inverse of [`decode_program`].
pub fn encode_program(program: &Program) -> Vec<u8> {
    let mut out = Out::new();

    let mut push_constants_size = 0usize;
    for reg in 0..program.tensor_count() {
        if program.tensor_flags[reg].contains(TensorFlags::CONSTANT)
            && program.tensors[reg].ndim == 0
        {
            push_constants_size += program.tensors[reg].dtype.size();
        }
    }

    out.u32(program.code.len() as u32);
    out.u32(program.symbols.len() as u32);
    out.u32(program.tasks.len() as u32);
    out.u32(program.bindings.len() as u32);
    out.u32(program.tensor_count() as u32);
    out.u32(program.meta.reduction_scratch_size);
    out.u32(program.meta.sync_scratch_size);
    out.u32(push_constants_size as u32);

    for inst in &program.code {
        out.u16(inst.opcode as u16);
        out.u16(inst.dest);
        for &src in &inst.src {
            out.u16(src);
        }
    }

    for sym in &program.symbols {
        out.name(&sym.name);
        out.name(sym.provider.as_deref().unwrap_or(""));
        out.u16(sym.register);
        out.u8(sym.flags.bits());
    }

    for task in &program.tasks {
        out.u32(task.start_inst);
        out.u32(task.inst_count);
        out.u16(task.domain_reg);
        out.u8(task.strategy as u8);
        out.u32(task.binding_offset);
        out.u32(task.binding_count);
    }

    for binding in &program.bindings {
        out.u16(binding.register);
        out.u8(binding.flags.bits());
    }

    for reg in 0..program.tensor_count() {
        let info = &program.tensors[reg];
        out.u8(info.dtype as u8);
        out.u8(program.tensor_flags[reg].bits());
        out.u8(info.ndim);
        for d in 0..MAX_DIMS {
            out.i32(info.shape[d]);
        }
        for d in 0..MAX_DIMS {
            out.i32(info.strides[d]);
        }
    }

    for reg in 0..program.tensor_count() {
        let info = &program.tensors[reg];
        if !program.tensor_flags[reg].contains(TensorFlags::CONSTANT) || info.ndim != 0 {
            continue;
        }
        out.data_or_zeros(program.tensor_data[reg].as_deref(), info.dtype.size());
    }

    for reg in 0..program.tensor_count() {
        let info = &program.tensors[reg];
        if !program.tensor_flags[reg].contains(TensorFlags::CONSTANT) || info.ndim == 0 {
            continue;
        }
        out.data_or_zeros(program.tensor_data[reg].as_deref(), info.size_bytes());
    }

    out.bytes
}

// --- Cursor / writer plumbing ---

struct Cursor<'data> {
    bytes: &'data [u8],
    pos: usize,
}

impl<'data> Cursor<'data> {
    fn new(bytes: &'data [u8]) -> Self {
        Cursor { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'data [u8], CartridgeError> {
        if len > self.remaining() {
            return Err(CartridgeError::Malformed("unexpected end of data"));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CartridgeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CartridgeError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, CartridgeError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, CartridgeError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, CartridgeError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// A fixed 32-byte, NUL-padded name field.
    fn name(&mut self) -> Result<String, CartridgeError> {
        let raw = self.take(NAME_LEN)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        core::str::from_utf8(&raw[..end])
            .map(str::to_owned)
            .map_err(|_| CartridgeError::Malformed("name is not valid utf-8"))
    }
}

struct Out {
    bytes: Vec<u8>,
}

impl Out {
    fn new() -> Self {
        Out { bytes: Vec::new() }
    }

    fn u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    fn u16(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn i32(&mut self, value: i32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn u64(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// A fixed 32-byte, NUL-padded name field. Longer names are truncated.
    fn name(&mut self, value: &str) {
        let mut field = [0u8; NAME_LEN];
        let len = value.len().min(NAME_LEN);
        field[..len].copy_from_slice(&value.as_bytes()[..len]);
        self.bytes.extend_from_slice(&field);
    }

    fn data_or_zeros(&mut self, data: Option<&[u8]>, len: usize) {
        match data {
            Some(data) => {
                let take = data.len().min(len);
                self.bytes.extend_from_slice(&data[..take]);
                self.bytes.resize(self.bytes.len() + (len - take), 0);
            }
            None => self.bytes.resize(self.bytes.len() + len, 0),
        }
    }
}
