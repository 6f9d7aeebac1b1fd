//! BERT term codec.
//!
//! Encodes and decodes terms in the Erlang external term format. Every
//! encoded term starts with the version byte (131) followed by one tagged
//! value:
//!
//! ```text
//! {reply, 3}  =>  131 104 2 | 100 0 5 "reply" | 97 3
//!                 ver tuple   atom              small int
//! ```
//!
//! Decoding accepts the tags Erlang and the common BERT libraries emit.
//! Encoding always picks the most compact tag, and `decode(encode(t)) == t`
//! holds for every term whose atoms fit in 65535 bytes.

use super::Term;
use bytes::{BufMut, Bytes, BytesMut};

/// External term format version byte
pub const VERSION: u8 = 131;

/// Maximum nesting of tuples and lists accepted by `decode`
pub const MAX_DEPTH: usize = 512;

const NEW_FLOAT_EXT: u8 = 70;
const SMALL_INTEGER_EXT: u8 = 97;
const INTEGER_EXT: u8 = 98;
const FLOAT_EXT: u8 = 99;
const ATOM_EXT: u8 = 100;
const SMALL_TUPLE_EXT: u8 = 104;
const LARGE_TUPLE_EXT: u8 = 105;
const NIL_EXT: u8 = 106;
const STRING_EXT: u8 = 107;
const LIST_EXT: u8 = 108;
const BINARY_EXT: u8 = 109;
const SMALL_BIG_EXT: u8 = 110;
const LARGE_BIG_EXT: u8 = 111;
const SMALL_ATOM_EXT: u8 = 115;
const ATOM_UTF8_EXT: u8 = 118;
const SMALL_ATOM_UTF8_EXT: u8 = 119;

/// Legacy FLOAT_EXT carries a 31-byte NUL-padded decimal string
const FLOAT_EXT_LEN: usize = 31;

/// Term decoding errors
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// No bytes at all
    Empty,
    /// First byte is not the external term format version
    BadVersion(u8),
    /// Input ended inside a term
    UnexpectedEof { needed: usize, available: usize },
    /// Tag byte not understood
    UnknownTag(u8),
    /// UTF-8 atom with invalid encoding
    InvalidAtom,
    /// Legacy float text that does not parse
    InvalidFloat,
    /// List whose tail is not the empty list
    ImproperList,
    /// Big integer outside the i64 range
    IntegerOverflow,
    /// Nesting deeper than `MAX_DEPTH`
    TooDeep,
    /// Bytes left over after a complete term
    TrailingBytes(usize),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Empty => write!(f, "empty payload"),
            DecodeError::BadVersion(v) => write!(f, "bad version byte {v}, expected {VERSION}"),
            DecodeError::UnexpectedEof { needed, available } => {
                write!(
                    f,
                    "unexpected end of input: needed {needed} bytes, {available} available"
                )
            }
            DecodeError::UnknownTag(tag) => write!(f, "unknown tag {tag}"),
            DecodeError::InvalidAtom => write!(f, "atom is not valid UTF-8"),
            DecodeError::InvalidFloat => write!(f, "invalid float text"),
            DecodeError::ImproperList => write!(f, "improper list"),
            DecodeError::IntegerOverflow => write!(f, "big integer does not fit in 64 bits"),
            DecodeError::TooDeep => write!(f, "term nested deeper than {MAX_DEPTH} levels"),
            DecodeError::TrailingBytes(n) => write!(f, "{n} trailing bytes after term"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decode a complete BERT payload into a term.
///
/// Copies `input` once; use `decode_bytes` when the payload is already
/// `Bytes`.
pub fn decode(input: &[u8]) -> Result<Term, DecodeError> {
    decode_bytes(Bytes::copy_from_slice(input))
}

/// Decode a complete BERT payload into a term.
///
/// Binaries in the result are slices of `input`, not copies.
pub fn decode_bytes(input: Bytes) -> Result<Term, DecodeError> {
    let mut reader = Reader { buf: input };

    let version = reader.u8().map_err(|_| DecodeError::Empty)?;
    if version != VERSION {
        return Err(DecodeError::BadVersion(version));
    }

    let term = reader.term(0)?;
    if !reader.buf.is_empty() {
        return Err(DecodeError::TrailingBytes(reader.buf.len()));
    }

    Ok(term)
}

/// Encode a term, including the leading version byte.
pub fn encode(term: &Term) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(VERSION);
    encode_into(term, &mut buf);
    buf.freeze()
}

/// Encode a term without the version byte into an existing buffer
pub fn encode_into(term: &Term, buf: &mut BytesMut) {
    match term {
        Term::Integer(n) => encode_integer(*n, buf),
        Term::Float(x) => {
            buf.put_u8(NEW_FLOAT_EXT);
            buf.put_f64(*x);
        }
        Term::Atom(name) => encode_atom(name, buf),
        Term::Binary(data) => {
            buf.put_u8(BINARY_EXT);
            buf.put_u32(data.len() as u32);
            buf.extend_from_slice(data);
        }
        Term::Tuple(elements) => {
            if elements.len() <= u8::MAX as usize {
                buf.put_u8(SMALL_TUPLE_EXT);
                buf.put_u8(elements.len() as u8);
            } else {
                buf.put_u8(LARGE_TUPLE_EXT);
                buf.put_u32(elements.len() as u32);
            }
            for element in elements {
                encode_into(element, buf);
            }
        }
        Term::List(elements) if elements.is_empty() => buf.put_u8(NIL_EXT),
        Term::List(elements) => {
            buf.put_u8(LIST_EXT);
            buf.put_u32(elements.len() as u32);
            for element in elements {
                encode_into(element, buf);
            }
            buf.put_u8(NIL_EXT);
        }
    }
}

fn encode_integer(n: i64, buf: &mut BytesMut) {
    if (0..=u8::MAX as i64).contains(&n) {
        buf.put_u8(SMALL_INTEGER_EXT);
        buf.put_u8(n as u8);
    } else if let Ok(n) = i32::try_from(n) {
        buf.put_u8(INTEGER_EXT);
        buf.put_i32(n);
    } else {
        // Outside the i32 range the magnitude is never zero
        let magnitude = n.unsigned_abs();
        let digits = magnitude.to_le_bytes();
        let len = 8 - (magnitude.leading_zeros() / 8) as usize;
        buf.put_u8(SMALL_BIG_EXT);
        buf.put_u8(len as u8);
        buf.put_u8(u8::from(n < 0));
        buf.extend_from_slice(&digits[..len]);
    }
}

fn encode_atom(name: &str, buf: &mut BytesMut) {
    let bytes = name.as_bytes();
    if name.is_ascii() {
        // Plain ATOM_EXT is understood by every BERT implementation
        buf.put_u8(ATOM_EXT);
        buf.put_u16(bytes.len() as u16);
    } else if bytes.len() <= u8::MAX as usize {
        buf.put_u8(SMALL_ATOM_UTF8_EXT);
        buf.put_u8(bytes.len() as u8);
    } else {
        buf.put_u8(ATOM_UTF8_EXT);
        buf.put_u16(bytes.len() as u16);
    }
    buf.extend_from_slice(bytes);
}

/// Cursor over the undecoded remainder of a payload
struct Reader {
    buf: Bytes,
}

impl Reader {
    fn take(&mut self, n: usize) -> Result<Bytes, DecodeError> {
        if self.buf.len() < n {
            return Err(DecodeError::UnexpectedEof {
                needed: n,
                available: self.buf.len(),
            });
        }
        Ok(self.buf.split_to(n))
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn term(&mut self, depth: usize) -> Result<Term, DecodeError> {
        if depth > MAX_DEPTH {
            return Err(DecodeError::TooDeep);
        }

        let tag = self.u8()?;
        match tag {
            SMALL_INTEGER_EXT => Ok(Term::Integer(self.u8()? as i64)),
            INTEGER_EXT => Ok(Term::Integer(self.u32()? as i32 as i64)),
            NEW_FLOAT_EXT => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&self.take(8)?);
                Ok(Term::Float(f64::from_be_bytes(raw)))
            }
            FLOAT_EXT => {
                let text = self.take(FLOAT_EXT_LEN)?;
                parse_float_text(&text).map(Term::Float)
            }
            ATOM_EXT => {
                let len = self.u16()? as usize;
                Ok(Term::Atom(latin1(&self.take(len)?)))
            }
            SMALL_ATOM_EXT => {
                let len = self.u8()? as usize;
                Ok(Term::Atom(latin1(&self.take(len)?)))
            }
            ATOM_UTF8_EXT => {
                let len = self.u16()? as usize;
                utf8_atom(&self.take(len)?)
            }
            SMALL_ATOM_UTF8_EXT => {
                let len = self.u8()? as usize;
                utf8_atom(&self.take(len)?)
            }
            SMALL_TUPLE_EXT => {
                let arity = self.u8()? as usize;
                self.elements(arity, depth).map(Term::Tuple)
            }
            LARGE_TUPLE_EXT => {
                let arity = self.u32()? as usize;
                self.elements(arity, depth).map(Term::Tuple)
            }
            NIL_EXT => Ok(Term::List(Vec::new())),
            STRING_EXT => {
                let len = self.u16()? as usize;
                let chars = self.take(len)?;
                Ok(Term::List(
                    chars.iter().map(|&c| Term::Integer(c as i64)).collect(),
                ))
            }
            LIST_EXT => {
                let len = self.u32()? as usize;
                let elements = self.elements(len, depth)?;
                match self.u8()? {
                    NIL_EXT => Ok(Term::List(elements)),
                    _ => Err(DecodeError::ImproperList),
                }
            }
            BINARY_EXT => {
                let len = self.u32()? as usize;
                Ok(Term::Binary(self.take(len)?))
            }
            SMALL_BIG_EXT => {
                let len = self.u8()? as usize;
                self.big(len)
            }
            LARGE_BIG_EXT => {
                let len = self.u32()? as usize;
                self.big(len)
            }
            other => Err(DecodeError::UnknownTag(other)),
        }
    }

    fn elements(&mut self, count: usize, depth: usize) -> Result<Vec<Term>, DecodeError> {
        // Every element occupies at least one byte, so the remaining input
        // bounds the allocation even when the declared count is hostile.
        let mut elements = Vec::with_capacity(count.min(self.buf.len()));
        for _ in 0..count {
            elements.push(self.term(depth + 1)?);
        }
        Ok(elements)
    }

    fn big(&mut self, len: usize) -> Result<Term, DecodeError> {
        let sign = self.u8()?;
        let digits = self.take(len)?;

        let mut magnitude: u64 = 0;
        for (i, &digit) in digits.iter().enumerate() {
            if i >= 8 {
                if digit != 0 {
                    return Err(DecodeError::IntegerOverflow);
                }
                continue;
            }
            magnitude |= (digit as u64) << (8 * i);
        }

        let value = if sign == 0 {
            i64::try_from(magnitude).map_err(|_| DecodeError::IntegerOverflow)?
        } else if magnitude == 1 << 63 {
            i64::MIN
        } else {
            let positive = i64::try_from(magnitude).map_err(|_| DecodeError::IntegerOverflow)?;
            -positive
        };

        Ok(Term::Integer(value))
    }
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn utf8_atom(bytes: &[u8]) -> Result<Term, DecodeError> {
    std::str::from_utf8(bytes)
        .map(|s| Term::Atom(s.to_string()))
        .map_err(|_| DecodeError::InvalidAtom)
}

fn parse_float_text(text: &[u8]) -> Result<f64, DecodeError> {
    std::str::from_utf8(text)
        .ok()
        .map(|s| s.trim_end_matches('\0').trim())
        .and_then(|s| s.parse::<f64>().ok())
        .ok_or(DecodeError::InvalidFloat)
}
