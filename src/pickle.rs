//! 只读取数据的 pickle 解码器
//!
//! `np.save` 保存 object 数组时，数据段是整个数组的 pickle。这里只模拟 pickle 虚拟机的
//! 栈和 memo：GLOBAL 只记下模块名和名字，REDUCE/BUILD 只记下参数和状态，不会导入或调用任何东西。

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, BufRead, Read};
use std::rc::Rc;

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PickleError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("unsupported opcode {0:#04x}")]
    Opcode(u8),
    #[error("stack underflow")]
    StackUnderflow,
    #[error("no mark on the stack")]
    NoMark,
    #[error("memo key {0} not found")]
    Memo(u32),
    #[error("{0}")]
    Invalid(String),
}

/// pickle 中的值
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Global { module: String, name: String },
    /// REDUCE / NEWOBJ 的结果，memo 中的引用与栈上的值共享同一个对象
    Object(Rc<RefCell<Object>>),
}

/// 一次未执行的调用：`callable(*args)`，以及 BUILD 设置的状态
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub callable: Value,
    pub args: Value,
    pub state: Option<Value>,
}

impl Value {
    /// 可调用对象是否为名为 `name` 的全局对象
    pub fn is_call_to(&self, name: &str) -> bool {
        match self {
            Value::Object(obj) => {
                matches!(&obj.borrow().callable, Value::Global { name: n, .. } if n == name)
            }
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Global { .. } => "global",
            Value::Object(_) => "object",
        }
    }
}

mod op {
    pub const MARK: u8 = b'(';
    pub const STOP: u8 = b'.';
    pub const POP: u8 = b'0';
    pub const POP_MARK: u8 = b'1';
    pub const DUP: u8 = b'2';
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const BININT2: u8 = b'M';
    pub const NONE: u8 = b'N';
    pub const BINFLOAT: u8 = b'G';
    pub const BINSTRING: u8 = b'T';
    pub const SHORT_BINSTRING: u8 = b'U';
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
    pub const REDUCE: u8 = b'R';
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
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const MEMOIZE: u8 = 0x94;
    pub const FRAME: u8 = 0x95;
    pub const BYTEARRAY8: u8 = 0x96;
}

#[derive(Default)]
struct Machine {
    stack: Vec<Value>,
    marks: Vec<usize>,
    memo: HashMap<u32, Value>,
}

impl Machine {
    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, PickleError> {
        // 不允许弹出 MARK 之前的值
        if self.marks.last().is_some_and(|&m| m >= self.stack.len()) {
            return Err(PickleError::StackUnderflow);
        }
        self.stack.pop().ok_or(PickleError::StackUnderflow)
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, PickleError> {
        let floor = self.marks.last().copied().unwrap_or(0);
        if self.stack.len() < floor + n {
            return Err(PickleError::StackUnderflow);
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn pop_mark(&mut self) -> Result<Vec<Value>, PickleError> {
        let mark = self.marks.pop().ok_or(PickleError::NoMark)?;
        Ok(self.stack.split_off(mark))
    }

    fn top(&mut self) -> Result<&mut Value, PickleError> {
        if self.marks.last().is_some_and(|&m| m >= self.stack.len()) {
            return Err(PickleError::StackUnderflow);
        }
        self.stack.last_mut().ok_or(PickleError::StackUnderflow)
    }

    fn put(&mut self, key: u32) -> Result<(), PickleError> {
        let value = self.top()?.clone();
        self.memo.insert(key, value);
        Ok(())
    }

    fn get(&mut self, key: u32) -> Result<(), PickleError> {
        let value = self.memo.get(&key).cloned().ok_or(PickleError::Memo(key))?;
        self.push(value);
        Ok(())
    }

    fn extend_list(&mut self, items: Vec<Value>) -> Result<(), PickleError> {
        match self.top()? {
            Value::List(list) => {
                list.extend(items);
                Ok(())
            }
            other => Err(invalid(format!("cannot append to {}", other.kind()))),
        }
    }

    fn extend_dict(&mut self, items: Vec<Value>) -> Result<(), PickleError> {
        if items.len() % 2 != 0 {
            return Err(invalid("odd number of dict items"));
        }
        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut items = items.into_iter();
        while let (Some(k), Some(v)) = (items.next(), items.next()) {
            pairs.push((k, v));
        }
        match self.top()? {
            Value::Dict(dict) => {
                dict.extend(pairs);
                Ok(())
            }
            other => Err(invalid(format!("cannot set items on {}", other.kind()))),
        }
    }
}

/// 解码一个完整的 pickle，读到 STOP 为止
pub fn loads<R: BufRead>(mut reader: R) -> Result<Value, PickleError> {
    let mut m = Machine::default();
    loop {
        let code = reader.read_u8()?;
        match code {
            op::PROTO => {
                let version = reader.read_u8()?;
                if version > 5 {
                    return Err(invalid(format!("unsupported protocol {}", version)));
                }
            }
            op::FRAME => {
                reader.read_u64::<LittleEndian>()?;
            }
            op::STOP => return m.pop(),
            op::MARK => m.marks.push(m.stack.len()),
            op::POP => {
                m.pop()?;
            }
            op::POP_MARK => {
                m.pop_mark()?;
            }
            op::DUP => {
                let value = m.top()?.clone();
                m.push(value);
            }

            op::NONE => m.push(Value::None),
            op::NEWTRUE => m.push(Value::Bool(true)),
            op::NEWFALSE => m.push(Value::Bool(false)),
            op::BININT => m.push(Value::Int(reader.read_i32::<LittleEndian>()?.into())),
            op::BININT1 => m.push(Value::Int(reader.read_u8()?.into())),
            op::BININT2 => m.push(Value::Int(reader.read_u16::<LittleEndian>()?.into())),
            op::LONG1 => {
                let len = reader.read_u8()?;
                let bytes = read_bytes(&mut reader, len.into())?;
                m.push(Value::Int(decode_long(&bytes)?));
            }
            op::LONG4 => {
                let len = reader.read_i32::<LittleEndian>()?;
                let len = u64::try_from(len).map_err(|_| invalid("negative length"))?;
                let bytes = read_bytes(&mut reader, len)?;
                m.push(Value::Int(decode_long(&bytes)?));
            }
            op::BINFLOAT => m.push(Value::Float(reader.read_f64::<BigEndian>()?)),

            op::SHORT_BINUNICODE => {
                let len = reader.read_u8()?;
                m.push(Value::Str(read_string(&mut reader, len.into())?));
            }
            op::BINUNICODE => {
                let len = reader.read_u32::<LittleEndian>()?;
                m.push(Value::Str(read_string(&mut reader, len.into())?));
            }
            op::BINUNICODE8 => {
                let len = reader.read_u64::<LittleEndian>()?;
                m.push(Value::Str(read_string(&mut reader, len)?));
            }
            op::SHORT_BINBYTES | op::SHORT_BINSTRING => {
                let len = reader.read_u8()?;
                m.push(Value::Bytes(read_bytes(&mut reader, len.into())?));
            }
            op::BINBYTES | op::BINSTRING => {
                let len = reader.read_u32::<LittleEndian>()?;
                m.push(Value::Bytes(read_bytes(&mut reader, len.into())?));
            }
            op::BINBYTES8 | op::BYTEARRAY8 => {
                let len = reader.read_u64::<LittleEndian>()?;
                m.push(Value::Bytes(read_bytes(&mut reader, len)?));
            }

            op::EMPTY_TUPLE => m.push(Value::Tuple(vec![])),
            op::TUPLE => {
                let items = m.pop_mark()?;
                m.push(Value::Tuple(items));
            }
            op::TUPLE1 | op::TUPLE2 | op::TUPLE3 => {
                let items = m.pop_n(usize::from(code - op::TUPLE1 + 1))?;
                m.push(Value::Tuple(items));
            }
            op::EMPTY_LIST => m.push(Value::List(vec![])),
            op::LIST => {
                let items = m.pop_mark()?;
                m.push(Value::List(items));
            }
            op::APPEND => {
                let item = m.pop()?;
                m.extend_list(vec![item])?;
            }
            op::APPENDS => {
                let items = m.pop_mark()?;
                m.extend_list(items)?;
            }
            op::EMPTY_DICT => m.push(Value::Dict(vec![])),
            op::DICT => {
                let items = m.pop_mark()?;
                m.push(Value::Dict(vec![]));
                m.extend_dict(items)?;
            }
            op::SETITEM => {
                let items = m.pop_n(2)?;
                m.extend_dict(items)?;
            }
            op::SETITEMS => {
                let items = m.pop_mark()?;
                m.extend_dict(items)?;
            }

            op::GLOBAL => {
                let module = read_line(&mut reader)?;
                let name = read_line(&mut reader)?;
                m.push(Value::Global { module, name });
            }
            op::STACK_GLOBAL => {
                let (Value::Str(name), Value::Str(module)) = (m.pop()?, m.pop()?) else {
                    return Err(invalid("STACK_GLOBAL expects two strings"));
                };
                m.push(Value::Global { module, name });
            }
            op::REDUCE | op::NEWOBJ => {
                let args = m.pop()?;
                let callable = m.pop()?;
                let obj = Object { callable, args, state: None };
                m.push(Value::Object(Rc::new(RefCell::new(obj))));
            }
            op::BUILD => {
                let state = m.pop()?;
                match m.top()? {
                    Value::Object(obj) => obj.borrow_mut().state = Some(state),
                    other => return Err(invalid(format!("cannot BUILD a {}", other.kind()))),
                }
            }

            op::PUT => {
                let key = read_line(&mut reader)?;
                m.put(key.parse().map_err(|_| invalid(format!("bad memo key '{}'", key)))?)?;
            }
            op::BINPUT => {
                let key = reader.read_u8()?;
                m.put(key.into())?;
            }
            op::LONG_BINPUT => {
                let key = reader.read_u32::<LittleEndian>()?;
                m.put(key)?;
            }
            op::MEMOIZE => {
                let key = u32::try_from(m.memo.len()).map_err(|_| invalid("memo overflow"))?;
                m.put(key)?;
            }
            op::GET => {
                let key = read_line(&mut reader)?;
                m.get(key.parse().map_err(|_| invalid(format!("bad memo key '{}'", key)))?)?;
            }
            op::BINGET => {
                let key = reader.read_u8()?;
                m.get(key.into())?;
            }
            op::LONG_BINGET => {
                let key = reader.read_u32::<LittleEndian>()?;
                m.get(key)?;
            }

            other => return Err(PickleError::Opcode(other)),
        }
    }
}

fn invalid(msg: impl Into<String>) -> PickleError {
    PickleError::Invalid(msg.into())
}

/// 读取 `len` 个字节，长度只由实际数据决定内存分配
fn read_bytes<R: Read>(reader: &mut R, len: u64) -> Result<Vec<u8>, PickleError> {
    let mut buf = Vec::new();
    reader.take(len).read_to_end(&mut buf)?;
    if (buf.len() as u64) < len {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    Ok(buf)
}

fn read_string<R: Read>(reader: &mut R, len: u64) -> Result<String, PickleError> {
    String::from_utf8(read_bytes(reader, len)?).map_err(|e| invalid(e.to_string()))
}

fn read_line<R: BufRead>(reader: &mut R) -> Result<String, PickleError> {
    let mut buf = Vec::new();
    reader.read_until(b'\n', &mut buf)?;
    if buf.pop() != Some(b'\n') {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    String::from_utf8(buf).map_err(|e| invalid(e.to_string()))
}

/// 小端补码表示的整数
fn decode_long(bytes: &[u8]) -> Result<i64, PickleError> {
    if bytes.len() > 8 {
        return Err(invalid(format!("{}-byte integer does not fit in i64", bytes.len())));
    }
    let negative = bytes.last().is_some_and(|&b| b & 0x80 != 0);
    let mut buf = if negative { [0xff; 8] } else { [0; 8] };
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(i64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars_and_containers() {
        // pickle.dumps((1, -2, 3.5, 'a', b'x', [None, True], {'k': 300}), protocol=2)
        let data = b"\x80\x02(K\x01J\xfe\xff\xff\xffG@\x0c\x00\x00\x00\x00\x00\x00X\x01\x00\x00\x00aq\x00c_codecs\nencode\nq\x01X\x01\x00\x00\x00xq\x02X\x06\x00\x00\x00latin1q\x03\x86q\x04Rq\x05]q\x06(N\x88e}q\x07X\x01\x00\x00\x00kq\x08M,\x01stq\t.";
        let value = loads(&data[..]).unwrap();
        let Value::Tuple(items) = value else { panic!() };
        assert_eq!(items[0], Value::Int(1));
        assert_eq!(items[1], Value::Int(-2));
        assert_eq!(items[2], Value::Float(3.5));
        assert_eq!(items[3], Value::Str("a".into()));
        // 协议 2 中 bytes 通过 _codecs.encode 构造，只保留调用本身
        assert!(items[4].is_call_to("encode"));
        assert_eq!(items[5], Value::List(vec![Value::None, Value::Bool(true)]));
        assert_eq!(items[6], Value::Dict(vec![(Value::Str("k".into()), Value::Int(300))]));
    }

    #[test]
    fn test_long() {
        assert_eq!(decode_long(&[]).unwrap(), 0);
        assert_eq!(decode_long(&[0xff]).unwrap(), -1);
        assert_eq!(decode_long(&[0x00, 0x80]).unwrap(), 32768);
        assert_eq!(decode_long(&[0, 0, 0, 0, 0, 0, 0, 0x80]).unwrap(), i64::MIN);
        assert!(decode_long(&[0; 9]).is_err());
    }

    #[test]
    fn test_build_is_shared_through_memo() {
        // 先 memo 再 BUILD，之后 BINGET 取到的对象也应带有状态
        let data = b"\x80\x03cmod\nf\nq\x00)Rq\x01K\x07bh\x01\x86.";
        let Value::Tuple(items) = loads(&data[..]).unwrap() else { panic!() };
        for item in &items {
            let Value::Object(obj) = item else { panic!("{:?}", item) };
            assert_eq!(obj.borrow().state, Some(Value::Int(7)));
        }
    }

    #[test]
    fn test_reject_bad_input() {
        // 未知操作码
        assert!(matches!(loads(&b"\x80\x03\xff."[..]), Err(PickleError::Opcode(0xff))));
        // 没有 STOP
        assert!(matches!(loads(&b"\x80\x03K\x01"[..]), Err(PickleError::Io(_))));
        // 空栈 REDUCE
        assert!(matches!(loads(&b"\x80\x03R."[..]), Err(PickleError::StackUnderflow)));
        // 声明的长度远超实际数据
        assert!(loads(&b"\x80\x04\x8e\xff\xff\xff\xff\xff\xff\xff\x7f."[..]).is_err());
        // 不存在的 memo
        assert!(matches!(loads(&b"\x80\x03h\x05."[..]), Err(PickleError::Memo(5))));
    }
}
