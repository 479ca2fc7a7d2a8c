//! The subset of the external term format the adapter exchanges with a node.

use std::fmt;

use thiserror::Error;

const VERSION: u8 = 131;

const NEW_FLOAT_EXT: u8 = 70;
const NEW_PID_EXT: u8 = 88;
const NEWER_REFERENCE_EXT: u8 = 90;
const SMALL_INTEGER_EXT: u8 = 97;
const INTEGER_EXT: u8 = 98;
const ATOM_EXT: u8 = 100;
const PID_EXT: u8 = 103;
const SMALL_TUPLE_EXT: u8 = 104;
const LARGE_TUPLE_EXT: u8 = 105;
const NIL_EXT: u8 = 106;
const STRING_EXT: u8 = 107;
const LIST_EXT: u8 = 108;
const BINARY_EXT: u8 = 109;
const SMALL_BIG_EXT: u8 = 110;
const NEW_REFERENCE_EXT: u8 = 114;
const SMALL_ATOM_EXT: u8 = 115;
const MAP_EXT: u8 = 116;
const ATOM_UTF8_EXT: u8 = 118;
const SMALL_ATOM_UTF8_EXT: u8 = 119;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pid {
    pub node: String,
    pub id: u32,
    pub serial: u32,
    pub creation: u32,
}

impl Pid {
    pub fn new(node: impl Into<String>, id: u32, creation: u32) -> Self {
        Self {
            node: node.into(),
            id,
            serial: 0,
            creation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub node: String,
    pub creation: u32,
    pub ids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Atom(String),
    Int(i64),
    Float(f64),
    Binary(Vec<u8>),
    Tuple(Vec<Term>),
    /// Proper list; `[]` is an empty one.
    List(Vec<Term>),
    Map(Vec<(Term, Term)>),
    Pid(Pid),
    Reference(Reference),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TermError {
    #[error("term ended early")]
    Truncated,
    #[error("missing version tag")]
    MissingVersion,
    #[error("unsupported term tag {0}")]
    Unsupported(u8),
    #[error("integer does not fit in 64 bits")]
    IntegerOverflow,
    #[error("improper lists are not supported")]
    ImproperList,
}

impl Term {
    pub fn atom(name: &str) -> Self {
        Term::Atom(name.to_string())
    }

    pub fn tuple(items: impl IntoIterator<Item = Term>) -> Self {
        Term::Tuple(items.into_iter().collect())
    }

    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Term::Atom(name) => Some(name),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Term::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Term]> {
        match self {
            Term::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Term]> {
        match self {
            Term::List(items) => Some(items),
            _ => None,
        }
    }

    /// Reads a charlist or a binary as text.
    pub fn as_string(&self) -> Option<String> {
        match self {
            Term::Binary(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
            Term::List(items) => items
                .iter()
                .map(|item| item.as_int().and_then(|c| char::from_u32(c as u32)))
                .collect(),
            _ => None,
        }
    }

    /// Whether this is the atom `name`.
    pub fn is_atom(&self, name: &str) -> bool {
        self.as_atom() == Some(name)
    }

    /// Encodes with the leading version tag.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![VERSION];
        self.encode_into(&mut buf);
        buf
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Term::Atom(name) => encode_atom(name, buf),
            Term::Int(n) => match *n {
                0..=255 => {
                    buf.push(SMALL_INTEGER_EXT);
                    buf.push(*n as u8);
                }
                n if i32::try_from(n).is_ok() => {
                    buf.push(INTEGER_EXT);
                    buf.extend_from_slice(&(n as i32).to_be_bytes());
                }
                n => {
                    let magnitude = n.unsigned_abs().to_le_bytes();
                    let len = magnitude.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
                    buf.push(SMALL_BIG_EXT);
                    buf.push(len as u8);
                    buf.push(u8::from(n < 0));
                    buf.extend_from_slice(&magnitude[..len]);
                }
            },
            Term::Float(f) => {
                buf.push(NEW_FLOAT_EXT);
                buf.extend_from_slice(&f.to_bits().to_be_bytes());
            }
            Term::Binary(bytes) => {
                buf.push(BINARY_EXT);
                buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                buf.extend_from_slice(bytes);
            }
            Term::Tuple(items) => {
                if items.len() <= u8::MAX as usize {
                    buf.push(SMALL_TUPLE_EXT);
                    buf.push(items.len() as u8);
                } else {
                    buf.push(LARGE_TUPLE_EXT);
                    buf.extend_from_slice(&(items.len() as u32).to_be_bytes());
                }
                items.iter().for_each(|item| item.encode_into(buf));
            }
            Term::List(items) if items.is_empty() => buf.push(NIL_EXT),
            Term::List(items) => {
                buf.push(LIST_EXT);
                buf.extend_from_slice(&(items.len() as u32).to_be_bytes());
                items.iter().for_each(|item| item.encode_into(buf));
                buf.push(NIL_EXT);
            }
            Term::Map(entries) => {
                buf.push(MAP_EXT);
                buf.extend_from_slice(&(entries.len() as u32).to_be_bytes());
                for (key, value) in entries {
                    key.encode_into(buf);
                    value.encode_into(buf);
                }
            }
            Term::Pid(pid) => {
                buf.push(NEW_PID_EXT);
                encode_atom(&pid.node, buf);
                buf.extend_from_slice(&pid.id.to_be_bytes());
                buf.extend_from_slice(&pid.serial.to_be_bytes());
                buf.extend_from_slice(&pid.creation.to_be_bytes());
            }
            Term::Reference(reference) => {
                buf.push(NEWER_REFERENCE_EXT);
                buf.extend_from_slice(&(reference.ids.len() as u16).to_be_bytes());
                encode_atom(&reference.node, buf);
                buf.extend_from_slice(&reference.creation.to_be_bytes());
                for id in &reference.ids {
                    buf.extend_from_slice(&id.to_be_bytes());
                }
            }
        }
    }

    /// Decodes one versioned term from the front of `bytes`, returning it with
    /// the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Term, usize), TermError> {
        let mut reader = Reader { bytes, pos: 0 };
        if reader.u8()? != VERSION {
            return Err(TermError::MissingVersion);
        }
        let term = reader.term()?;
        Ok((term, reader.pos))
    }
}

fn encode_atom(name: &str, buf: &mut Vec<u8>) {
    if name.len() <= u8::MAX as usize {
        buf.push(SMALL_ATOM_UTF8_EXT);
        buf.push(name.len() as u8);
    } else {
        buf.push(ATOM_UTF8_EXT);
        buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
    }
    buf.extend_from_slice(name.as_bytes());
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}.{}.{}>", self.node, self.id, self.serial)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], TermError> {
        let end = self.pos.checked_add(len).ok_or(TermError::Truncated)?;
        let slice = self.bytes.get(self.pos..end).ok_or(TermError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, TermError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, TermError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, TermError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn text(&mut self, len: usize) -> Result<String, TermError> {
        Ok(String::from_utf8_lossy(self.take(len)?).to_string())
    }

    fn atom(&mut self) -> Result<String, TermError> {
        match self.term()? {
            Term::Atom(name) => Ok(name),
            _ => Err(TermError::Unsupported(self.bytes[self.pos.saturating_sub(1)])),
        }
    }

    fn items(&mut self, len: usize) -> Result<Vec<Term>, TermError> {
        // Every element takes at least one byte.
        if len > self.bytes.len() - self.pos {
            return Err(TermError::Truncated);
        }
        (0..len).map(|_| self.term()).collect()
    }

    fn term(&mut self) -> Result<Term, TermError> {
        let tag = self.u8()?;
        let term = match tag {
            SMALL_INTEGER_EXT => Term::Int(self.u8()? as i64),
            INTEGER_EXT => Term::Int(self.u32()? as i32 as i64),
            SMALL_BIG_EXT => {
                let len = self.u8()? as usize;
                let negative = self.u8()? != 0;
                let digits = self.take(len)?;
                if digits.iter().skip(8).any(|b| *b != 0) {
                    return Err(TermError::IntegerOverflow);
                }
                let mut magnitude = [0u8; 8];
                for (slot, digit) in magnitude.iter_mut().zip(digits) {
                    *slot = *digit;
                }
                let magnitude = i64::try_from(u64::from_le_bytes(magnitude))
                    .map_err(|_| TermError::IntegerOverflow)?;
                Term::Int(if negative { -magnitude } else { magnitude })
            }
            NEW_FLOAT_EXT => {
                let b = self.take(8)?;
                let mut bits = [0u8; 8];
                bits.copy_from_slice(b);
                Term::Float(f64::from_bits(u64::from_be_bytes(bits)))
            }
            ATOM_EXT | ATOM_UTF8_EXT => {
                let len = self.u16()? as usize;
                Term::Atom(self.text(len)?)
            }
            SMALL_ATOM_EXT | SMALL_ATOM_UTF8_EXT => {
                let len = self.u8()? as usize;
                Term::Atom(self.text(len)?)
            }
            SMALL_TUPLE_EXT => {
                let len = self.u8()? as usize;
                Term::Tuple(self.items(len)?)
            }
            LARGE_TUPLE_EXT => {
                let len = self.u32()? as usize;
                Term::Tuple(self.items(len)?)
            }
            NIL_EXT => Term::List(Vec::new()),
            STRING_EXT => {
                let len = self.u16()? as usize;
                Term::List(self.take(len)?.iter().map(|c| Term::Int(*c as i64)).collect())
            }
            LIST_EXT => {
                let len = self.u32()? as usize;
                let items = self.items(len)?;
                match self.term()? {
                    Term::List(tail) if tail.is_empty() => Term::List(items),
                    _ => return Err(TermError::ImproperList),
                }
            }
            BINARY_EXT => {
                let len = self.u32()? as usize;
                Term::Binary(self.take(len)?.to_vec())
            }
            MAP_EXT => {
                let len = self.u32()? as usize;
                let flat = self.items(len.checked_mul(2).ok_or(TermError::Truncated)?)?;
                let mut entries = Vec::with_capacity(len);
                let mut flat = flat.into_iter();
                while let (Some(key), Some(value)) = (flat.next(), flat.next()) {
                    entries.push((key, value));
                }
                Term::Map(entries)
            }
            PID_EXT | NEW_PID_EXT => {
                let node = self.atom()?;
                let id = self.u32()?;
                let serial = self.u32()?;
                let creation = if tag == PID_EXT { self.u8()? as u32 } else { self.u32()? };
                Term::Pid(Pid {
                    node,
                    id,
                    serial,
                    creation,
                })
            }
            NEW_REFERENCE_EXT | NEWER_REFERENCE_EXT => {
                let len = self.u16()? as usize;
                let node = self.atom()?;
                let creation = if tag == NEW_REFERENCE_EXT {
                    self.u8()? as u32
                } else {
                    self.u32()?
                };
                let ids = (0..len).map(|_| self.u32()).collect::<Result<_, _>>()?;
                Term::Reference(Reference { node, creation, ids })
            }
            other => return Err(TermError::Unsupported(other)),
        };
        Ok(term)
    }
}
