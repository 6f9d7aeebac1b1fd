//! Structured values carried by BERT-RPC.
//!
//! A `Term` is the universal payload representation: requests, replies and
//! error descriptions are all terms. The wire encoding lives in [`codec`].

pub mod codec;

pub use codec::{decode, decode_bytes, encode, DecodeError};

use bytes::Bytes;
use std::fmt;

/// A BERT term.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    /// Symbolic constant: `call`, `reply`, module and function names
    Atom(String),
    /// Signed integer (BERT small, regular and big integers that fit in i64)
    Integer(i64),
    /// IEEE-754 double
    Float(f64),
    /// Opaque byte string
    Binary(Bytes),
    /// Ordered list (always proper)
    List(Vec<Term>),
    /// Fixed-arity tuple
    Tuple(Vec<Term>),
}

impl Term {
    /// Create an atom
    pub fn atom<S: Into<String>>(name: S) -> Term {
        Term::Atom(name.into())
    }

    /// Create a binary
    pub fn binary<B: Into<Bytes>>(data: B) -> Term {
        Term::Binary(data.into())
    }

    /// Create a tuple
    pub fn tuple(elements: Vec<Term>) -> Term {
        Term::Tuple(elements)
    }

    /// Create a list
    pub fn list(elements: Vec<Term>) -> Term {
        Term::List(elements)
    }

    /// The atom name, if this is an atom
    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Term::Atom(name) => Some(name),
            _ => None,
        }
    }

    /// The integer value, if this is an integer
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Term::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// The bytes, if this is a binary
    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            Term::Binary(data) => Some(data),
            _ => None,
        }
    }

    /// The elements, if this is a list
    pub fn as_list(&self) -> Option<&[Term]> {
        match self {
            Term::List(elements) => Some(elements),
            _ => None,
        }
    }

    /// The elements, if this is a tuple
    pub fn as_tuple(&self) -> Option<&[Term]> {
        match self {
            Term::Tuple(elements) => Some(elements),
            _ => None,
        }
    }

    /// True if this is the atom `name`
    pub fn is_atom(&self, name: &str) -> bool {
        self.as_atom() == Some(name)
    }
}

impl From<i64> for Term {
    fn from(n: i64) -> Self {
        Term::Integer(n)
    }
}

impl From<f64> for Term {
    fn from(f: f64) -> Self {
        Term::Float(f)
    }
}

impl From<Bytes> for Term {
    fn from(data: Bytes) -> Self {
        Term::Binary(data)
    }
}

impl From<Vec<Term>> for Term {
    fn from(elements: Vec<Term>) -> Self {
        Term::List(elements)
    }
}

/// Erlang-like rendering used in log lines and invalid-request messages.
impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Atom(name) => write_atom(f, name),
            Term::Integer(n) => write!(f, "{n}"),
            Term::Float(x) => write!(f, "{x:?}"),
            Term::Binary(data) => write_binary(f, data),
            Term::List(elements) => {
                f.write_str("[")?;
                write_elements(f, elements)?;
                f.write_str("]")
            }
            Term::Tuple(elements) => {
                f.write_str("{")?;
                write_elements(f, elements)?;
                f.write_str("}")
            }
        }
    }
}

fn write_elements(f: &mut fmt::Formatter<'_>, elements: &[Term]) -> fmt::Result {
    for (i, element) in elements.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{element}")?;
    }
    Ok(())
}

/// Bare atoms start lowercase and contain only word characters; anything
/// else is single-quoted.
fn write_atom(f: &mut fmt::Formatter<'_>, name: &str) -> fmt::Result {
    let bare = name.chars().next().is_some_and(|c| c.is_ascii_lowercase())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '@');
    if bare {
        f.write_str(name)
    } else {
        write!(f, "'{}'", name.escape_default())
    }
}

fn write_binary(f: &mut fmt::Formatter<'_>, data: &[u8]) -> fmt::Result {
    let printable = data.iter().all(|b| b.is_ascii_graphic() || *b == b' ');
    if printable && !data.is_empty() {
        let text = String::from_utf8_lossy(data);
        return write!(f, "<<\"{}\">>", text.escape_default());
    }
    f.write_str("<<")?;
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        write!(f, "{byte}")?;
    }
    f.write_str(">>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_request() {
        let term = Term::tuple(vec![
            Term::atom("call"),
            Term::atom("calc"),
            Term::atom("add"),
            Term::list(vec![Term::Integer(1), Term::Integer(2)]),
        ]);
        assert_eq!(term.to_string(), "{call, calc, add, [1, 2]}");
    }

    #[test]
    fn test_display_quoted_atom() {
        assert_eq!(Term::atom("Foo").to_string(), "'Foo'");
        assert_eq!(Term::atom("has space").to_string(), "'has space'");
        assert_eq!(Term::atom("").to_string(), "''");
    }

    #[test]
    fn test_display_binaries() {
        assert_eq!(Term::binary(&b"hello"[..]).to_string(), "<<\"hello\">>");
        assert_eq!(Term::binary(vec![0u8, 255]).to_string(), "<<0,255>>");
        assert_eq!(Term::binary(Bytes::new()).to_string(), "<<>>");
    }

    #[test]
    fn test_accessors() {
        let term = Term::tuple(vec![Term::atom("noreply")]);
        assert_eq!(term.as_tuple().map(|t| t.len()), Some(1));
        assert!(term.as_tuple().unwrap()[0].is_atom("noreply"));
        assert_eq!(term.as_atom(), None);
        assert_eq!(Term::Integer(7).as_integer(), Some(7));
        assert_eq!(Term::list(vec![]).as_list(), Some(&[][..]));
    }
}
