//! A small unpickler for the batch files shipped in the CIFAR "python
//! version" archives.
//!
//! Only the part of the pickle protocol those files (and numpy arrays
//! pickled by Python 2 or 3) need is implemented. Globals are never
//! executed: a handful of known constructors (`numpy` arrays and dtypes,
//! `_codecs.encode`, `set`, `bytearray`) are interpreted, anything else is
//! kept as an opaque [`Value::Object`].

use std::collections::HashMap;
use std::io::Read;
use std::rc::Rc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PickleError {
    #[error("unexpected end of pickle data at offset {0}")]
    Eof(usize),
    #[error("unsupported opcode 0x{opcode:02x} at offset {offset}")]
    UnsupportedOpcode { opcode: u8, offset: usize },
    #[error("stack underflow at offset {0}")]
    StackUnderflow(usize),
    #[error("no mark on the stack at offset {0}")]
    MissingMark(usize),
    #[error("memo key {0} not found")]
    MissingMemo(u64),
    #[error("integer does not fit in 64 bits at offset {0}")]
    IntegerOverflow(usize),
    #[error("malformed {what} at offset {offset}")]
    Malformed { what: &'static str, offset: usize },
    #[error("invalid ndarray state: {0}")]
    InvalidArray(String),
    #[error("pickle data ended without a STOP opcode")]
    MissingStop,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A decoded pickle object.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Python 3 `bytes` and Python 2 `str` (which CIFAR loads as latin1).
    /// Shared, so memo lookups of a large buffer do not copy it.
    Bytes(Rc<[u8]>),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Set(Vec<Value>),
    /// Insertion ordered.
    Dict(Vec<(Value, Value)>),
    Global {
        module: String,
        name: String,
    },
    Dtype(Dtype),
    Array(NdArray),
    Object {
        class: Box<Value>,
        args: Box<Value>,
        state: Option<Box<Value>>,
    },
}

impl Value {
    /// Looks up a dictionary entry whose key is `key`, pickled either as text
    /// or as a byte string.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Dict(entries) => entries
                .iter()
                .find(|(k, _)| k.as_text_bytes() == Some(key.as_bytes()))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    fn as_text_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Str(s) => Some(s.as_bytes()),
            Value::Bytes(b) => Some(&b[..]),
            _ => None,
        }
    }

    fn as_text(&self) -> Option<String> {
        match self {
            Value::Str(s) => Some(s.clone()),
            Value::Bytes(b) => Some(b.iter().map(|&c| c as char).collect()),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bytes(_) => "bytes",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Set(_) => "set",
            Value::Dict(_) => "dict",
            Value::Global { .. } => "global",
            Value::Dtype(_) => "dtype",
            Value::Array(_) => "ndarray",
            Value::Object { .. } => "object",
        }
    }
}

/// A numpy dtype as far as its pickled form describes it, e.g. `u1` or `i8`
/// with byte order `<`.
#[derive(Debug, Clone, PartialEq)]
pub struct Dtype {
    pub descr: String,
    pub byte_order: char,
}

impl Dtype {
    fn new(descr: String) -> Self {
        Self {
            descr,
            byte_order: '=',
        }
    }

    fn set_state(&mut self, state: &Value) {
        if let Value::Tuple(items) = state {
            if let Some(order) = items.get(1).and_then(Value::as_text) {
                if let Some(c) = order.chars().next() {
                    self.byte_order = c;
                }
            }
        }
    }

    fn code(&self) -> &str {
        self.descr.trim_start_matches(['<', '>', '|', '='])
    }

    /// Kind character: `u`, `i`, `f`, `b`, ...
    pub fn kind(&self) -> Option<char> {
        self.code().chars().next()
    }

    pub fn item_size(&self) -> Option<usize> {
        self.code().get(1..)?.parse().ok()
    }

    fn big_endian(&self) -> bool {
        self.byte_order == '>' || self.descr.starts_with('>')
    }
}

/// A numpy ndarray rebuilt from `_reconstruct` + `__setstate__`.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    pub shape: Vec<usize>,
    pub dtype: Option<Dtype>,
    pub fortran_order: bool,
    pub data: Rc<[u8]>,
}

impl NdArray {
    fn empty() -> Self {
        Self {
            shape: Vec::new(),
            dtype: None,
            fortran_order: false,
            data: Rc::from(Vec::new()),
        }
    }

    fn set_state(&mut self, state: Value) -> Result<(), PickleError> {
        let mut items = match state {
            Value::Tuple(items) => items,
            other => {
                return Err(PickleError::InvalidArray(format!(
                    "expected a state tuple, found {}",
                    other.type_name()
                )))
            }
        };
        // (version, shape, dtype, is_fortran, raw) or the same without version
        if items.len() == 5 {
            items.remove(0);
        }
        let [shape, dtype, fortran, raw]: [Value; 4] = items.try_into().map_err(|v: Vec<_>| {
            PickleError::InvalidArray(format!("state tuple has {} items", v.len()))
        })?;

        self.shape = match shape {
            Value::Tuple(dims) | Value::List(dims) => dims
                .iter()
                .map(|d| match d {
                    Value::Int(n) if *n >= 0 => Ok(*n as usize),
                    _ => Err(PickleError::InvalidArray("bad dimension".into())),
                })
                .collect::<Result<_, _>>()?,
            other => {
                return Err(PickleError::InvalidArray(format!(
                    "shape is a {}",
                    other.type_name()
                )))
            }
        };
        let dtype = match dtype {
            Value::Dtype(d) => d,
            other => {
                return Err(PickleError::InvalidArray(format!(
                    "dtype is a {}",
                    other.type_name()
                )))
            }
        };
        self.fortran_order = matches!(fortran, Value::Bool(true) | Value::Int(1));
        self.data = match raw {
            Value::Bytes(b) => b,
            Value::Str(s) => latin1_bytes(&s)
                .ok_or_else(|| PickleError::InvalidArray("raw data is not latin1".into()))?
                .into(),
            other => {
                return Err(PickleError::InvalidArray(format!(
                    "unsupported raw data of type {}",
                    other.type_name()
                )))
            }
        };

        let item_size = dtype
            .item_size()
            .ok_or_else(|| PickleError::InvalidArray(format!("unknown dtype {}", dtype.descr)))?;
        let expected = self.len() * item_size;
        if self.data.len() != expected {
            return Err(PickleError::InvalidArray(format!(
                "expected {expected} bytes for shape {:?}, found {}",
                self.shape,
                self.data.len()
            )));
        }
        self.dtype = Some(dtype);
        Ok(())
    }

    /// Number of elements.
    fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// The raw buffer when the array holds unsigned bytes.
    pub fn as_u8(&self) -> Option<&[u8]> {
        let dtype = self.dtype.as_ref()?;
        (dtype.kind() == Some('u') && dtype.item_size() == Some(1)).then_some(&self.data[..])
    }

    /// Element values of an integer array.
    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        let dtype = self.dtype.as_ref()?;
        let size = dtype.item_size()?;
        let signed = match dtype.kind()? {
            'i' => true,
            'u' | 'b' => false,
            _ => return None,
        };
        if !matches!(size, 1 | 2 | 4 | 8) {
            return None;
        }
        let values = self
            .data
            .chunks_exact(size)
            .map(|chunk| {
                let mut buf = [0u8; 8];
                if dtype.big_endian() {
                    buf[8 - size..].copy_from_slice(chunk);
                    buf.reverse();
                } else {
                    buf[..size].copy_from_slice(chunk);
                }
                let raw = u64::from_le_bytes(buf);
                if signed && size < 8 {
                    let shift = 64 - 8 * size as u32;
                    ((raw << shift) as i64) >> shift
                } else {
                    raw as i64
                }
            })
            .collect();
        Some(values)
    }
}

fn latin1_bytes(s: &str) -> Option<Vec<u8>> {
    s.chars().map(|c| u8::try_from(u32::from(c)).ok()).collect()
}

pub fn from_reader<R: Read>(mut reader: R) -> Result<Value, PickleError> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    from_slice(&buf)
}

pub fn from_slice(bytes: &[u8]) -> Result<Value, PickleError> {
    Unpickler::new(bytes).load()
}

mod op {
    pub const MARK: u8 = b'(';
    pub const STOP: u8 = b'.';
    pub const POP: u8 = b'0';
    pub const POP_MARK: u8 = b'1';
    pub const DUP: u8 = b'2';
    pub const FLOAT: u8 = b'F';
    pub const INT: u8 = b'I';
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const LONG: u8 = b'L';
    pub const BININT2: u8 = b'M';
    pub const NONE: u8 = b'N';
    pub const REDUCE: u8 = b'R';
    pub const STRING: u8 = b'S';
    pub const BINSTRING: u8 = b'T';
    pub const SHORT_BINSTRING: u8 = b'U';
    pub const UNICODE: u8 = b'V';
    pub const BINUNICODE: u8 = b'X';
    pub const APPEND: u8 = b'a';
    pub const BUILD: u8 = b'b';
    pub const GLOBAL: u8 = b'c';
    pub const DICT: u8 = b'd';
    pub const EMPTY_DICT: u8 = b'}';
    pub const APPENDS: u8 = b'e';
    pub const GET: u8 = b'g';
    pub const BINGET: u8 = b'h';
    pub const LONG_BINGET: u8 = b'j';
    pub const LIST: u8 = b'l';
    pub const EMPTY_LIST: u8 = b']';
    pub const PUT: u8 = b'p';
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const SETITEM: u8 = b's';
    pub const TUPLE: u8 = b't';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const SETITEMS: u8 = b'u';
    pub const BINFLOAT: u8 = b'G';

    pub const PROTO: u8 = 0x80;
    pub const NEWOBJ: u8 = 0x81;
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const LONG1: u8 = 0x8a;
    pub const LONG4: u8 = 0x8b;

    pub const BINBYTES: u8 = b'B';
    pub const SHORT_BINBYTES: u8 = b'C';

    pub const SHORT_BINUNICODE: u8 = 0x8c;
    pub const BINUNICODE8: u8 = 0x8d;
    pub const BINBYTES8: u8 = 0x8e;
    pub const EMPTY_SET: u8 = 0x8f;
    pub const ADDITEMS: u8 = 0x90;
    pub const FROZENSET: u8 = 0x91;
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const MEMOIZE: u8 = 0x94;
    pub const FRAME: u8 = 0x95;

    pub const BYTEARRAY8: u8 = 0x96;
}

struct Unpickler<'a> {
    buf: &'a [u8],
    pos: usize,
    stack: Vec<Value>,
    metastack: Vec<Vec<Value>>,
    memo: HashMap<u64, Value>,
}

impl<'a> Unpickler<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            stack: Vec::new(),
            metastack: Vec::new(),
            memo: HashMap::new(),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PickleError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(PickleError::Eof(self.pos))?;
        let buf: &'a [u8] = self.buf;
        let bytes = &buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], PickleError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn byte(&mut self) -> Result<u8, PickleError> {
        Ok(self.take(1)?[0])
    }

    fn line(&mut self) -> Result<&'a [u8], PickleError> {
        let buf: &'a [u8] = self.buf;
        let rest = &buf[self.pos..];
        let len = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(PickleError::Eof(self.buf.len()))?;
        let line = &rest[..len];
        self.pos += len + 1;
        Ok(line)
    }

    fn len_u32(&mut self) -> Result<usize, PickleError> {
        Ok(u32::from_le_bytes(self.take_array()?) as usize)
    }

    fn len_u64(&mut self) -> Result<usize, PickleError> {
        usize::try_from(u64::from_le_bytes(self.take_array()?))
            .map_err(|_| PickleError::Eof(self.pos))
    }

    fn malformed(&self, what: &'static str) -> PickleError {
        PickleError::Malformed {
            what,
            offset: self.pos,
        }
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, PickleError> {
        self.stack.pop().ok_or(PickleError::StackUnderflow(self.pos))
    }

    fn top(&mut self) -> Result<&mut Value, PickleError> {
        self.stack
            .last_mut()
            .ok_or(PickleError::StackUnderflow(self.pos))
    }

    fn pop_mark(&mut self) -> Result<Vec<Value>, PickleError> {
        let outer = self
            .metastack
            .pop()
            .ok_or(PickleError::MissingMark(self.pos))?;
        Ok(std::mem::replace(&mut self.stack, outer))
    }

    fn memo_get(&self, key: u64) -> Result<Value, PickleError> {
        self.memo
            .get(&key)
            .cloned()
            .ok_or(PickleError::MissingMemo(key))
    }

    fn memo_put(&mut self, key: u64) -> Result<(), PickleError> {
        let value = self.top()?.clone();
        self.memo.insert(key, value);
        Ok(())
    }

    fn text_u64(&mut self, what: &'static str) -> Result<u64, PickleError> {
        let line = self.line()?;
        std::str::from_utf8(line)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| self.malformed(what))
    }

    fn utf8(&self, bytes: &[u8]) -> Result<String, PickleError> {
        String::from_utf8(bytes.to_vec()).map_err(|_| self.malformed("utf-8 string"))
    }

    fn load(mut self) -> Result<Value, PickleError> {
        loop {
            let offset = self.pos;
            let opcode = match self.byte() {
                Ok(b) => b,
                Err(_) => return Err(PickleError::MissingStop),
            };
            match opcode {
                op::PROTO => {
                    self.byte()?;
                }
                op::FRAME => {
                    self.take(8)?;
                }
                op::STOP => return self.pop(),
                op::MARK => {
                    let inner = std::mem::take(&mut self.stack);
                    self.metastack.push(inner);
                }
                op::POP => {
                    if self.stack.is_empty() {
                        self.pop_mark()?;
                    } else {
                        self.pop()?;
                    }
                }
                op::POP_MARK => {
                    self.pop_mark()?;
                }
                op::DUP => {
                    let top = self.top()?.clone();
                    self.push(top);
                }

                op::NONE => self.push(Value::None),
                op::NEWTRUE => self.push(Value::Bool(true)),
                op::NEWFALSE => self.push(Value::Bool(false)),
                op::INT => {
                    let line = self.line()?;
                    let value = match line {
                        b"00" => Value::Bool(false),
                        b"01" => Value::Bool(true),
                        _ => Value::Int(self.parse_text_int(line)?),
                    };
                    self.push(value);
                }
                op::LONG => {
                    let line = self.line()?;
                    let line = line.strip_suffix(b"L").unwrap_or(line);
                    let n = self.parse_text_int(line)?;
                    self.push(Value::Int(n));
                }
                op::BININT => {
                    let n = i32::from_le_bytes(self.take_array()?);
                    self.push(Value::Int(n.into()));
                }
                op::BININT1 => {
                    let n = self.byte()?;
                    self.push(Value::Int(n.into()));
                }
                op::BININT2 => {
                    let n = u16::from_le_bytes(self.take_array()?);
                    self.push(Value::Int(n.into()));
                }
                op::LONG1 => {
                    let n = self.byte()? as usize;
                    let v = self.long_le(n)?;
                    self.push(Value::Int(v));
                }
                op::LONG4 => {
                    let n = self.len_u32()?;
                    let v = self.long_le(n)?;
                    self.push(Value::Int(v));
                }
                op::FLOAT => {
                    let line = self.line()?;
                    let f = std::str::from_utf8(line)
                        .ok()
                        .and_then(|s| s.trim().parse().ok())
                        .ok_or_else(|| self.malformed("float"))?;
                    self.push(Value::Float(f));
                }
                op::BINFLOAT => {
                    let f = f64::from_be_bytes(self.take_array()?);
                    self.push(Value::Float(f));
                }

                op::STRING => {
                    let line = self.line()?;
                    let bytes = unescape_repr(line).ok_or_else(|| self.malformed("string"))?;
                    self.push(Value::Bytes(bytes.into()));
                }
                op::BINSTRING => {
                    let n = i32::from_le_bytes(self.take_array()?);
                    let n = usize::try_from(n).map_err(|_| self.malformed("string length"))?;
                    let bytes = self.take(n)?.into();
                    self.push(Value::Bytes(bytes));
                }
                op::SHORT_BINSTRING | op::SHORT_BINBYTES => {
                    let n = self.byte()? as usize;
                    let bytes = self.take(n)?.into();
                    self.push(Value::Bytes(bytes));
                }
                op::BINBYTES => {
                    let n = self.len_u32()?;
                    let bytes = self.take(n)?.into();
                    self.push(Value::Bytes(bytes));
                }
                op::BINBYTES8 | op::BYTEARRAY8 => {
                    let n = self.len_u64()?;
                    let bytes = self.take(n)?.into();
                    self.push(Value::Bytes(bytes));
                }
                op::UNICODE => {
                    let line = self.line()?;
                    let s = raw_unicode_escape(line).ok_or_else(|| self.malformed("unicode"))?;
                    self.push(Value::Str(s));
                }
                op::SHORT_BINUNICODE => {
                    let n = self.byte()? as usize;
                    let bytes = self.take(n)?;
                    let s = self.utf8(bytes)?;
                    self.push(Value::Str(s));
                }
                op::BINUNICODE => {
                    let n = self.len_u32()?;
                    let bytes = self.take(n)?;
                    let s = self.utf8(bytes)?;
                    self.push(Value::Str(s));
                }
                op::BINUNICODE8 => {
                    let n = self.len_u64()?;
                    let bytes = self.take(n)?;
                    let s = self.utf8(bytes)?;
                    self.push(Value::Str(s));
                }

                op::EMPTY_LIST => self.push(Value::List(Vec::new())),
                op::LIST => {
                    let items = self.pop_mark()?;
                    self.push(Value::List(items));
                }
                op::APPEND => {
                    let item = self.pop()?;
                    self.extend_top(vec![item])?;
                }
                op::APPENDS => {
                    let items = self.pop_mark()?;
                    self.extend_top(items)?;
                }
                op::EMPTY_TUPLE => self.push(Value::Tuple(Vec::new())),
                op::TUPLE => {
                    let items = self.pop_mark()?;
                    self.push(Value::Tuple(items));
                }
                op::TUPLE1 | op::TUPLE2 | op::TUPLE3 => {
                    let n = (opcode - op::TUPLE1 + 1) as usize;
                    if self.stack.len() < n {
                        return Err(PickleError::StackUnderflow(offset));
                    }
                    let items = self.stack.split_off(self.stack.len() - n);
                    self.push(Value::Tuple(items));
                }
                op::EMPTY_DICT => self.push(Value::Dict(Vec::new())),
                op::DICT => {
                    let items = self.pop_mark()?;
                    let entries = pairs(items).ok_or_else(|| self.malformed("dict items"))?;
                    self.push(Value::Dict(entries));
                }
                op::SETITEM => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.insert_top(vec![(key, value)])?;
                }
                op::SETITEMS => {
                    let items = self.pop_mark()?;
                    let entries = pairs(items).ok_or_else(|| self.malformed("dict items"))?;
                    self.insert_top(entries)?;
                }
                op::EMPTY_SET => self.push(Value::Set(Vec::new())),
                op::ADDITEMS => {
                    let items = self.pop_mark()?;
                    match self.top()? {
                        Value::Set(set) => set.extend(items),
                        _ => return Err(self.malformed("set")),
                    }
                }
                op::FROZENSET => {
                    let items = self.pop_mark()?;
                    self.push(Value::Set(items));
                }

                op::GLOBAL => {
                    let module = self.line()?;
                    let module = self.utf8(module)?;
                    let name = self.line()?;
                    let name = self.utf8(name)?;
                    self.push(Value::Global { module, name });
                }
                op::STACK_GLOBAL => {
                    let name = self.pop()?.as_text();
                    let module = self.pop()?.as_text();
                    match (module, name) {
                        (Some(module), Some(name)) => self.push(Value::Global { module, name }),
                        _ => return Err(self.malformed("global")),
                    }
                }
                op::REDUCE | op::NEWOBJ => {
                    let args = self.pop()?;
                    let class = self.pop()?;
                    let value = call(class, args)?;
                    self.push(value);
                }
                op::BUILD => {
                    let state = self.pop()?;
                    match self.top()? {
                        Value::Array(array) => array.set_state(state)?,
                        Value::Dtype(dtype) => dtype.set_state(&state),
                        Value::Dict(entries) => {
                            if let Value::Dict(more) = state {
                                entries.extend(more);
                            }
                        }
                        Value::Object { state: slot, .. } => *slot = Some(Box::new(state)),
                        _ => return Err(self.malformed("BUILD target")),
                    }
                }

                op::PUT => {
                    let key = self.text_u64("memo key")?;
                    self.memo_put(key)?;
                }
                op::BINPUT => {
                    let key = self.byte()?.into();
                    self.memo_put(key)?;
                }
                op::LONG_BINPUT => {
                    let key = u32::from_le_bytes(self.take_array()?).into();
                    self.memo_put(key)?;
                }
                op::MEMOIZE => {
                    let key = self.memo.len() as u64;
                    self.memo_put(key)?;
                }
                op::GET => {
                    let key = self.text_u64("memo key")?;
                    let value = self.memo_get(key)?;
                    self.push(value);
                }
                op::BINGET => {
                    let key = self.byte()?.into();
                    let value = self.memo_get(key)?;
                    self.push(value);
                }
                op::LONG_BINGET => {
                    let key = u32::from_le_bytes(self.take_array()?).into();
                    let value = self.memo_get(key)?;
                    self.push(value);
                }

                _ => return Err(PickleError::UnsupportedOpcode { opcode, offset }),
            }
        }
    }

    fn parse_text_int(&self, line: &[u8]) -> Result<i64, PickleError> {
        std::str::from_utf8(line)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| self.malformed("integer"))
    }

    /// Little-endian two's complement integer of `n` bytes.
    fn long_le(&mut self, n: usize) -> Result<i64, PickleError> {
        let offset = self.pos;
        let bytes = self.take(n)?;
        if n == 0 {
            return Ok(0);
        }
        let negative = bytes[n - 1] & 0x80 != 0;
        let fill = if negative { 0xff } else { 0x00 };
        if n > 8 && bytes[8..].iter().any(|&b| b != fill) {
            return Err(PickleError::IntegerOverflow(offset));
        }
        let mut buf = [fill; 8];
        let used = n.min(8);
        buf[..used].copy_from_slice(&bytes[..used]);
        let value = i64::from_le_bytes(buf);
        if n > 8 && (value < 0) != negative {
            return Err(PickleError::IntegerOverflow(offset));
        }
        Ok(value)
    }

    fn extend_top(&mut self, items: Vec<Value>) -> Result<(), PickleError> {
        match self.top()? {
            Value::List(list) => {
                list.extend(items);
                Ok(())
            }
            _ => Err(self.malformed("list")),
        }
    }

    fn insert_top(&mut self, items: Vec<(Value, Value)>) -> Result<(), PickleError> {
        match self.top()? {
            Value::Dict(entries) => {
                for (key, value) in items {
                    match entries.iter_mut().find(|(k, _)| *k == key) {
                        Some(slot) => slot.1 = value,
                        None => entries.push((key, value)),
                    }
                }
                Ok(())
            }
            _ => Err(self.malformed("dict")),
        }
    }
}

fn pairs(items: Vec<Value>) -> Option<Vec<(Value, Value)>> {
    if items.len() % 2 != 0 {
        return None;
    }
    let mut iter = items.into_iter();
    let mut out = Vec::new();
    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
        out.push((k, v));
    }
    Some(out)
}

fn first_arg(args: &Value) -> Option<&Value> {
    match args {
        Value::Tuple(items) => items.first(),
        _ => None,
    }
}

/// Applies a callable the way REDUCE would, for the constructors we know.
fn call(class: Value, args: Value) -> Result<Value, PickleError> {
    if let Value::Global { module, name } = &class {
        match (module.as_str(), name.as_str()) {
            ("numpy.core.multiarray" | "numpy._core.multiarray", "_reconstruct") => {
                return Ok(Value::Array(NdArray::empty()));
            }
            ("numpy", "dtype") => {
                if let Some(descr) = first_arg(&args).and_then(Value::as_text) {
                    return Ok(Value::Dtype(Dtype::new(descr)));
                }
            }
            ("_codecs", "encode") => {
                if let Some(Value::Str(text)) = first_arg(&args) {
                    let bytes = latin1_bytes(text)
                        .ok_or_else(|| PickleError::InvalidArray("bytes are not latin1".into()))?;
                    return Ok(Value::Bytes(bytes.into()));
                }
            }
            ("__builtin__" | "builtins", "set" | "frozenset") => {
                match first_arg(&args) {
                    Some(Value::List(items)) | Some(Value::Tuple(items)) => {
                        return Ok(Value::Set(items.clone()))
                    }
                    None => return Ok(Value::Set(Vec::new())),
                    _ => {}
                }
            }
            ("__builtin__" | "builtins", "bytearray") => match first_arg(&args) {
                Some(Value::Bytes(b)) => return Ok(Value::Bytes(b.clone())),
                None => return Ok(Value::Bytes(Rc::from(Vec::new()))),
                _ => {}
            },
            _ => {}
        }
    }
    Ok(Value::Object {
        class: Box::new(class),
        args: Box::new(args),
        state: None,
    })
}

/// Decodes the body of a protocol 0 `STRING` line, a quoted Python repr.
fn unescape_repr(line: &[u8]) -> Option<Vec<u8>> {
    let quote = *line.first()?;
    if !(quote == b'\'' || quote == b'"') || line.len() < 2 || *line.last()? != quote {
        return None;
    }
    let body = &line[1..line.len() - 1];
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        let b = body[i];
        if b != b'\\' {
            out.push(b);
            i += 1;
            continue;
        }
        let esc = *body.get(i + 1)?;
        i += 2;
        match esc {
            b'n' => out.push(b'\n'),
            b't' => out.push(b'\t'),
            b'r' => out.push(b'\r'),
            b'0' => out.push(0),
            b'\\' | b'\'' | b'"' => out.push(esc),
            b'x' => {
                let hex = std::str::from_utf8(body.get(i..i + 2)?).ok()?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 2;
            }
            _ => {
                out.push(b'\\');
                out.push(esc);
            }
        }
    }
    Some(out)
}

/// Decodes Python's `raw-unicode-escape` codec used by protocol 0 `UNICODE`.
fn raw_unicode_escape(line: &[u8]) -> Option<String> {
    let mut out = String::with_capacity(line.len());
    let mut i = 0;
    while i < line.len() {
        let digits = match (line[i], line.get(i + 1)) {
            (b'\\', Some(b'u')) => 4,
            (b'\\', Some(b'U')) => 8,
            (b, _) => {
                out.push(b as char);
                i += 1;
                continue;
            }
        };
        let hex = std::str::from_utf8(line.get(i + 2..i + 2 + digits)?).ok()?;
        out.push(char::from_u32(u32::from_str_radix(hex, 16).ok()?)?);
        i += 2 + digits;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_protocol2_dict_of_ints() {
        // {'a': [1, 300, -2]} in protocol 2
        let bytes = b"\x80\x02}q\x00X\x01\x00\x00\x00aq\x01]q\x02(K\x01M,\x01J\xfe\xff\xff\xffes.";
        let value = from_slice(bytes).unwrap();
        assert_eq!(
            value.get("a"),
            Some(&Value::List(vec![
                Value::Int(1),
                Value::Int(300),
                Value::Int(-2)
            ]))
        );
    }

    #[test]
    fn keys_match_bytes_and_text() {
        let dict = Value::Dict(vec![
            (Value::Bytes(b"labels"[..].into()), Value::Int(1)),
            (Value::Str("data".into()), Value::Int(2)),
        ]);
        assert_eq!(dict.get("labels"), Some(&Value::Int(1)));
        assert_eq!(dict.get("data"), Some(&Value::Int(2)));
        assert_eq!(dict.get("missing"), None);
    }

    #[test]
    fn decodes_protocol0_text_opcodes() {
        // (True, 7, 'hi', u'\xe9') in protocol 0
        let bytes = b"(I01\nI7\nS'hi'\np0\nV\\u00e9\np1\ntp2\n.";
        let value = from_slice(bytes).unwrap();
        assert_eq!(
            value,
            Value::Tuple(vec![
                Value::Bool(true),
                Value::Int(7),
                Value::Bytes(b"hi"[..].into()),
                Value::Str("\u{e9}".into()),
            ])
        );
    }

    #[test]
    fn memo_get_returns_stored_value() {
        let bytes = b"\x80\x02]q\x00(U\x02abq\x01h\x01e.";
        let value = from_slice(bytes).unwrap();
        let Value::List(items) = &value else {
            panic!("expected a list, got {value:?}");
        };
        let [Value::Bytes(first), Value::Bytes(second)] = &items[..] else {
            panic!("expected two byte strings, got {items:?}");
        };
        assert_eq!(&first[..], b"ab");
        // the memoized buffer is shared, not copied
        assert!(Rc::ptr_eq(first, second));
    }

    #[test]
    fn long1_handles_sign() {
        assert_eq!(from_slice(b"\x80\x02\x8a\x01\xff.").unwrap(), Value::Int(-1));
        assert_eq!(
            from_slice(b"\x80\x02\x8a\x02\x00\x01.").unwrap(),
            Value::Int(256)
        );
        assert_eq!(from_slice(b"\x80\x02\x8a\x00.").unwrap(), Value::Int(0));
    }

    #[test]
    fn rebuilds_numpy_array() {
        let mut p = Vec::new();
        p.extend_from_slice(b"\x80\x02cnumpy.core.multiarray\n_reconstruct\n");
        p.extend_from_slice(b"cnumpy\nndarray\nK\x00\x85U\x01b\x87R");
        p.extend_from_slice(b"(K\x01K\x02K\x03\x86cnumpy\ndtype\nU\x02u1K\x00K\x01\x87R");
        p.extend_from_slice(b"(K\x03U\x01|NNNJ\xff\xff\xff\xffJ\xff\xff\xff\xffK\x00tb");
        p.extend_from_slice(b"\x89U\x06\x01\x02\x03\x04\x05\x06tb.");
        let value = from_slice(&p).unwrap();
        let Value::Array(array) = value else {
            panic!("expected an ndarray, got {value:?}");
        };
        assert_eq!(array.shape, vec![2, 3]);
        assert_eq!(array.as_u8(), Some(&[1u8, 2, 3, 4, 5, 6][..]));
    }

    #[test]
    fn array_with_wrong_byte_count_is_rejected() {
        let mut p = Vec::new();
        p.extend_from_slice(b"\x80\x02cnumpy.core.multiarray\n_reconstruct\n");
        p.extend_from_slice(b"cnumpy\nndarray\nK\x00\x85U\x01b\x87R");
        p.extend_from_slice(b"(K\x01K\x04\x85cnumpy\ndtype\nU\x02u1K\x00K\x01\x87R");
        p.extend_from_slice(b"\x89U\x03abctb.");
        assert!(matches!(from_slice(&p), Err(PickleError::InvalidArray(_))));
    }

    #[test]
    fn integer_arrays_respect_width_and_sign() {
        let array = NdArray {
            shape: vec![2],
            dtype: Some(Dtype {
                descr: "i4".into(),
                byte_order: '<',
            }),
            fortran_order: false,
            data: vec![0xfe, 0xff, 0xff, 0xff, 0x09, 0x00, 0x00, 0x00].into(),
        };
        assert_eq!(array.to_i64_vec(), Some(vec![-2, 9]));
        assert_eq!(array.as_u8(), None);
    }

    #[test]
    fn codecs_encode_yields_bytes() {
        // how python 3 pickles bytes at protocol 2
        let bytes = b"\x80\x02c_codecs\nencode\nX\x04\x00\x00\x00\xc3\xbf\x01\x02X\x06\x00\x00\x00latin1\x86R.";
        assert_eq!(
            from_slice(bytes).unwrap(),
            Value::Bytes(vec![0xff, 0x01, 0x02].into())
        );
    }

    #[test]
    fn truncated_input_is_an_error() {
        assert!(matches!(
            from_slice(b"\x80\x02X\x05\x00\x00\x00ab"),
            Err(PickleError::Eof(_))
        ));
        assert!(matches!(from_slice(b"\x80\x02K\x01"), Err(PickleError::MissingStop)));
        assert!(matches!(from_slice(b""), Err(PickleError::MissingStop)));
    }

    #[test]
    fn unknown_opcode_is_reported() {
        assert!(matches!(
            from_slice(b"\x80\x02\xff."),
            Err(PickleError::UnsupportedOpcode { opcode: 0xff, .. })
        ));
    }

    #[test]
    fn unknown_globals_become_objects() {
        let bytes = b"\x80\x02cfoo\nBar\n)R}X\x01\x00\x00\x00xK\x01sb.";
        let value = from_slice(bytes).unwrap();
        assert!(matches!(value, Value::Object { state: Some(_), .. }));
    }
}
