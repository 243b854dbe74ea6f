/// Compact binary encoding of IR modules
///
/// Layout: the magic `NMBC`, a version byte, then the module fields in declaration
/// order. Integers are LEB128 (signed values zigzag-encoded), strings and byte arrays
/// are length-prefixed.
use super::{FlagBehavior, GlobalInit, IRFunction, IRGlobal, IRInstruction, IRModule, Linkage, StaticInitializer};
use thiserror::Error;

pub const BITCODE_MAGIC: &[u8; 4] = b"NMBC";
const BITCODE_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BitcodeError {
    #[error("not a bitcode file (bad magic)")]
    BadMagic,
    #[error("unsupported bitcode version {0}")]
    UnsupportedVersion(u8),
    #[error("unexpected end of bitcode at offset {0}")]
    UnexpectedEof(usize),
    #[error("invalid {what} tag {tag} at offset {offset}")]
    InvalidTag { what: &'static str, tag: u64, offset: usize },
    #[error("string at offset {0} is not valid UTF-8")]
    InvalidUtf8(usize),
    #[error("{0} trailing bytes after module")]
    TrailingBytes(usize),
}

// Instruction opcodes
const OP_PUSH: u8 = 0x01;
const OP_DROP: u8 = 0x02;
const OP_DUP: u8 = 0x03;
const OP_ADD: u8 = 0x10;
const OP_SUB: u8 = 0x11;
const OP_MUL: u8 = 0x12;
const OP_DIV: u8 = 0x13;
const OP_REM: u8 = 0x14;
const OP_EQ: u8 = 0x20;
const OP_NE: u8 = 0x21;
const OP_LT: u8 = 0x22;
const OP_GT: u8 = 0x23;
const OP_LE: u8 = 0x24;
const OP_GE: u8 = 0x25;
const OP_NOT: u8 = 0x26;
const OP_LABEL: u8 = 0x30;
const OP_JMP: u8 = 0x31;
const OP_JZ: u8 = 0x32;
const OP_PARAM: u8 = 0x40;
const OP_LOCAL_GET: u8 = 0x41;
const OP_LOCAL_SET: u8 = 0x42;
const OP_GLOBAL_ADDR: u8 = 0x50;
const OP_LOAD: u8 = 0x51;
const OP_STORE: u8 = 0x52;
const OP_CALL: u8 = 0x60;
const OP_CALL_INDIRECT: u8 = 0x61;
const OP_RET: u8 = 0x62;

struct Writer {
    bytes: Vec<u8>,
}

impl Writer {
    fn byte(&mut self, value: u8) {
        self.bytes.push(value);
    }

    fn uleb(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.bytes.push(byte);
                return;
            }
            self.bytes.push(byte | 0x80);
        }
    }

    fn sleb(&mut self, value: i64) {
        // zigzag
        self.uleb(((value << 1) ^ (value >> 63)) as u64);
    }

    fn usize(&mut self, value: usize) {
        self.uleb(value as u64);
    }

    fn blob(&mut self, bytes: &[u8]) {
        self.usize(bytes.len());
        self.bytes.extend_from_slice(bytes);
    }

    fn str(&mut self, text: &str) {
        self.blob(text.as_bytes());
    }
}

/// Encode `module` as bitcode.
pub fn encode_bitcode(module: &IRModule) -> Vec<u8> {
    let mut w = Writer { bytes: BITCODE_MAGIC.to_vec() };
    w.byte(BITCODE_VERSION);

    w.str(&module.name);
    w.str(&module.target_triple);
    w.str(&module.data_layout);

    w.usize(module.metadata.len());
    for (key, value) in &module.metadata {
        w.str(key);
        w.str(value);
    }

    w.usize(module.flags.len());
    for flag in &module.flags {
        w.byte(match flag.behavior {
            FlagBehavior::Error => 1,
            FlagBehavior::Warning => 2,
            FlagBehavior::Override => 4,
        });
        w.str(&flag.key);
        w.sleb(flag.value);
    }

    w.usize(module.globals.len());
    for global in &module.globals {
        w.str(&global.name);
        w.byte(linkage_tag(global.linkage));
        w.byte(global.constant as u8);
        w.uleb(global.align);
        match &global.init {
            GlobalInit::Zero(size) => {
                w.byte(0);
                w.usize(*size);
            }
            GlobalInit::Word(value) => {
                w.byte(1);
                w.sleb(*value);
            }
            GlobalInit::Bytes(bytes) => {
                w.byte(2);
                w.blob(bytes);
            }
            GlobalInit::Pointers(targets) => {
                w.byte(3);
                w.usize(targets.len());
                for target in targets {
                    w.str(target);
                }
            }
        }
    }

    w.usize(module.functions.len());
    for function in &module.functions {
        w.str(&function.name);
        w.byte(linkage_tag(function.linkage));
        w.usize(function.param_count);
        w.usize(function.local_count);
        match &function.body {
            None => w.byte(0),
            Some(body) => {
                w.byte(1);
                w.usize(body.len());
                for inst in body {
                    encode_instruction(&mut w, inst);
                }
            }
        }
    }

    for initializers in [&module.ctors, &module.dtors] {
        w.usize(initializers.len());
        for init in initializers {
            w.uleb(init.priority as u64);
            w.str(&init.function);
        }
    }

    w.bytes
}

fn linkage_tag(linkage: Linkage) -> u8 {
    match linkage {
        Linkage::External => 0,
        Linkage::Internal => 1,
    }
}

fn encode_instruction(w: &mut Writer, inst: &IRInstruction) {
    use IRInstruction::*;
    match inst {
        Push(value) => {
            w.byte(OP_PUSH);
            w.sleb(*value);
        }
        Drop => w.byte(OP_DROP),
        Dup => w.byte(OP_DUP),
        Add => w.byte(OP_ADD),
        Sub => w.byte(OP_SUB),
        Mul => w.byte(OP_MUL),
        Div => w.byte(OP_DIV),
        Rem => w.byte(OP_REM),
        Equal => w.byte(OP_EQ),
        NotEqual => w.byte(OP_NE),
        Less => w.byte(OP_LT),
        Greater => w.byte(OP_GT),
        LessEqual => w.byte(OP_LE),
        GreaterEqual => w.byte(OP_GE),
        Not => w.byte(OP_NOT),
        Label(label) | Jump(label) | JumpIfZero(label) => {
            w.byte(match inst {
                Label(_) => OP_LABEL,
                Jump(_) => OP_JMP,
                _ => OP_JZ,
            });
            w.uleb(*label as u64);
        }
        LoadParam(slot) | LoadLocal(slot) | StoreLocal(slot) => {
            w.byte(match inst {
                LoadParam(_) => OP_PARAM,
                LoadLocal(_) => OP_LOCAL_GET,
                _ => OP_LOCAL_SET,
            });
            w.usize(*slot);
        }
        GlobalAddress(name) => {
            w.byte(OP_GLOBAL_ADDR);
            w.str(name);
        }
        Load => w.byte(OP_LOAD),
        Store => w.byte(OP_STORE),
        Call(name, arg_count) => {
            w.byte(OP_CALL);
            w.str(name);
            w.usize(*arg_count);
        }
        CallIndirect(arg_count) => {
            w.byte(OP_CALL_INDIRECT);
            w.usize(*arg_count);
        }
        Return => w.byte(OP_RET),
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn byte(&mut self) -> Result<u8, BitcodeError> {
        let byte = *self.bytes.get(self.pos).ok_or(BitcodeError::UnexpectedEof(self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    fn uleb(&mut self) -> Result<u64, BitcodeError> {
        let mut value = 0u64;
        let mut shift = 0;
        loop {
            let byte = self.byte()?;
            if shift < 64 {
                value |= ((byte & 0x7f) as u64) << shift;
            }
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn sleb(&mut self) -> Result<i64, BitcodeError> {
        let raw = self.uleb()?;
        Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
    }

    fn usize(&mut self) -> Result<usize, BitcodeError> {
        Ok(self.uleb()? as usize)
    }

    fn blob(&mut self) -> Result<&'a [u8], BitcodeError> {
        let len = self.usize()?;
        let end = self.pos.checked_add(len).filter(|end| *end <= self.bytes.len());
        let end = end.ok_or(BitcodeError::UnexpectedEof(self.bytes.len()))?;
        let blob = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(blob)
    }

    fn string(&mut self) -> Result<String, BitcodeError> {
        let start = self.pos;
        let blob = self.blob()?;
        String::from_utf8(blob.to_vec()).map_err(|_| BitcodeError::InvalidUtf8(start))
    }

    fn linkage(&mut self) -> Result<Linkage, BitcodeError> {
        let offset = self.pos;
        match self.byte()? {
            0 => Ok(Linkage::External),
            1 => Ok(Linkage::Internal),
            tag => Err(BitcodeError::InvalidTag { what: "linkage", tag: tag as u64, offset }),
        }
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, BitcodeError> {
        let offset = self.pos;
        let value = self.uleb()?;
        u32::try_from(value).map_err(|_| BitcodeError::InvalidTag { what, tag: value, offset })
    }
}

/// Decode a module previously produced by [`encode_bitcode`].
pub fn decode_bitcode(bytes: &[u8]) -> Result<IRModule, BitcodeError> {
    if bytes.len() < BITCODE_MAGIC.len() || &bytes[..4] != BITCODE_MAGIC {
        return Err(BitcodeError::BadMagic);
    }
    let mut r = Reader { bytes, pos: 4 };
    let version = r.byte()?;
    if version != BITCODE_VERSION {
        return Err(BitcodeError::UnsupportedVersion(version));
    }

    let mut module = IRModule::new(&r.string()?);
    module.target_triple = r.string()?;
    module.data_layout = r.string()?;

    for _ in 0..r.usize()? {
        let key = r.string()?;
        let value = r.string()?;
        module.metadata.insert(key, value);
    }

    for _ in 0..r.usize()? {
        let offset = r.pos;
        let behavior = match r.byte()? {
            1 => FlagBehavior::Error,
            2 => FlagBehavior::Warning,
            4 => FlagBehavior::Override,
            tag => return Err(BitcodeError::InvalidTag { what: "flag behavior", tag: tag as u64, offset }),
        };
        let key = r.string()?;
        let value = r.sleb()?;
        module.flags.push(super::ModuleFlag { behavior, key, value });
    }

    for _ in 0..r.usize()? {
        let name = r.string()?;
        let linkage = r.linkage()?;
        let constant = r.byte()? != 0;
        let align = r.uleb()?;
        let offset = r.pos;
        let init = match r.byte()? {
            0 => GlobalInit::Zero(r.usize()?),
            1 => GlobalInit::Word(r.sleb()?),
            2 => GlobalInit::Bytes(r.blob()?.to_vec()),
            3 => {
                let count = r.usize()?;
                let mut targets = Vec::new();
                for _ in 0..count {
                    targets.push(r.string()?);
                }
                GlobalInit::Pointers(targets)
            }
            tag => return Err(BitcodeError::InvalidTag { what: "initializer", tag: tag as u64, offset }),
        };
        module.add_global(IRGlobal { name, linkage, constant, align, init });
    }

    for _ in 0..r.usize()? {
        let name = r.string()?;
        let linkage = r.linkage()?;
        let param_count = r.usize()?;
        let local_count = r.usize()?;
        let body = match r.byte()? {
            0 => None,
            _ => {
                let count = r.usize()?;
                let mut body = Vec::new();
                for _ in 0..count {
                    body.push(decode_instruction(&mut r)?);
                }
                Some(body)
            }
        };
        module.add_function(IRFunction { name, linkage, param_count, local_count, body });
    }

    for is_ctor in [true, false] {
        for _ in 0..r.usize()? {
            let priority = r.u32("priority")?;
            let function = r.string()?;
            let entry = StaticInitializer { priority, function };
            if is_ctor {
                module.ctors.push(entry);
            } else {
                module.dtors.push(entry);
            }
        }
    }

    if r.pos != bytes.len() {
        return Err(BitcodeError::TrailingBytes(bytes.len() - r.pos));
    }
    Ok(module)
}

fn decode_instruction(r: &mut Reader<'_>) -> Result<IRInstruction, BitcodeError> {
    use IRInstruction::*;
    let offset = r.pos;
    let inst = match r.byte()? {
        OP_PUSH => Push(r.sleb()?),
        OP_DROP => Drop,
        OP_DUP => Dup,
        OP_ADD => Add,
        OP_SUB => Sub,
        OP_MUL => Mul,
        OP_DIV => Div,
        OP_REM => Rem,
        OP_EQ => Equal,
        OP_NE => NotEqual,
        OP_LT => Less,
        OP_GT => Greater,
        OP_LE => LessEqual,
        OP_GE => GreaterEqual,
        OP_NOT => Not,
        OP_LABEL => Label(r.u32("label")?),
        OP_JMP => Jump(r.u32("label")?),
        OP_JZ => JumpIfZero(r.u32("label")?),
        OP_PARAM => LoadParam(r.usize()?),
        OP_LOCAL_GET => LoadLocal(r.usize()?),
        OP_LOCAL_SET => StoreLocal(r.usize()?),
        OP_GLOBAL_ADDR => GlobalAddress(r.string()?),
        OP_LOAD => Load,
        OP_STORE => Store,
        OP_CALL => {
            let name = r.string()?;
            Call(name, r.usize()?)
        }
        OP_CALL_INDIRECT => CallIndirect(r.usize()?),
        OP_RET => Return,
        tag => return Err(BitcodeError::InvalidTag { what: "opcode", tag: tag as u64, offset }),
    };
    Ok(inst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_module;

    #[test]
    fn zigzag_keeps_extremes() {
        let mut w = Writer { bytes: Vec::new() };
        for value in [0, -1, 1, i64::MIN, i64::MAX] {
            w.sleb(value);
        }
        let mut r = Reader { bytes: &w.bytes, pos: 0 };
        for value in [0, -1, 1, i64::MIN, i64::MAX] {
            assert_eq!(r.sleb().unwrap(), value);
        }
    }

    #[test]
    fn encodes_and_decodes_a_full_module() {
        let module = parse_module(
            r#"; ModuleID = 'bc'
target triple = "aarch64-unknown-linux-gnu"
!meta "nativemod.target" = "native -mtriple=aarch64-unknown-linux-gnu"
!flag override "Dwarf Version" = 2
@t = internal constant ptrs [@f], align 8
@w = external global word -7, align 8
declare external @__rt_free(1)
define internal @f(1) locals 2 {
  param 0
  local.set 1
L7:
  local.get 1
  jz L7
  push -300
  call @__rt_free 1
  ret
}
dtor 3 @f
"#,
        )
        .unwrap();

        let bytes = encode_bitcode(&module);
        assert_eq!(&bytes[..4], BITCODE_MAGIC);
        assert_eq!(decode_bitcode(&bytes).unwrap(), module);
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(decode_bitcode(b"BC\xc0\xde"), Err(BitcodeError::BadMagic));
        assert_eq!(decode_bitcode(b"NMBC\x09"), Err(BitcodeError::UnsupportedVersion(9)));
        let bytes = encode_bitcode(&IRModule::new("m"));
        assert!(matches!(decode_bitcode(&bytes[..bytes.len() - 1]), Err(BitcodeError::UnexpectedEof(_))));
    }
}
