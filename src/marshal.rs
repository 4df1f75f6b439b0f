//! A minimal decoder for CPython's `marshal` serialization.
//!
//! The PYZ index is a marshalled list (or dict) of
//! `(name, (typecode, offset, length))` records, so we only need the
//! container, integer, and string flavors of the format — never code
//! objects. Type codes come from CPython's `marshal.c` and have been
//! stable for a long time; the high bit of a code marks the object for
//! the back-reference table.

use crate::result::*;

// Type codes from marshal.c. The set below is what a PYZ index can contain.
const TYPE_NULL: u8 = b'0';
const TYPE_NONE: u8 = b'N';
const TYPE_FALSE: u8 = b'F';
const TYPE_TRUE: u8 = b'T';
const TYPE_INT: u8 = b'i';
const TYPE_INT64: u8 = b'I';
const TYPE_LONG: u8 = b'l';
const TYPE_BINARY_FLOAT: u8 = b'g';
const TYPE_STRING: u8 = b's';
const TYPE_INTERNED: u8 = b't';
const TYPE_STRINGREF: u8 = b'R';
const TYPE_UNICODE: u8 = b'u';
const TYPE_ASCII: u8 = b'a';
const TYPE_ASCII_INTERNED: u8 = b'A';
const TYPE_SHORT_ASCII: u8 = b'z';
const TYPE_SHORT_ASCII_INTERNED: u8 = b'Z';
const TYPE_TUPLE: u8 = b'(';
const TYPE_SMALL_TUPLE: u8 = b')';
const TYPE_LIST: u8 = b'[';
const TYPE_DICT: u8 = b'{';
const TYPE_REF: u8 = b'r';

const FLAG_REF: u8 = 0x80;

/// Containers recurse once per nesting level, so bound the depth to keep
/// crafted data off the stack. Real indexes nest three levels.
const MAX_CONTAINER_DEPTH: usize = 100;

/// A decoded marshal object, reduced to the shapes an index can hold.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Object>),
    List(Vec<Object>),
    Dict(Vec<(Object, Object)>),
}

/// Decodes one marshalled object from the front of `data`.
pub fn loads(data: &[u8]) -> ExtractResult<Object> {
    let mut reader = Reader {
        input: data,
        posit: 0,
        depth: 0,
        refs: Vec::new(),
    };
    reader.read_object()
}

struct Reader<'a> {
    input: &'a [u8],
    posit: usize,
    /// Current container nesting level, checked against
    /// [`MAX_CONTAINER_DEPTH`]
    depth: usize,
    /// Back-reference table; objects marked with [`FLAG_REF`] land here
    /// in allocation order.
    refs: Vec<Object>,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> ExtractResult<&'a [u8]> {
        if self.input.len() - self.posit < n {
            return Err(ExtractError::Format(format!(
                "Truncated marshal data at offset {}: wanted {n} more bytes",
                self.posit
            )));
        }
        let bytes = &self.input[self.posit..self.posit + n];
        self.posit += n;
        Ok(bytes)
    }

    fn read_u8(&mut self) -> ExtractResult<u8> {
        Ok(self.take(1)?[0])
    }

    // Unlike the outer archive, marshal data is little-endian.

    fn read_u32(&mut self) -> ExtractResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_i32(&mut self) -> ExtractResult<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_length(&mut self) -> ExtractResult<usize> {
        let len = self.read_u32()? as usize;
        // Any honest length is bounded by the bytes that must back it.
        if len > self.input.len() - self.posit {
            return Err(ExtractError::Format(format!(
                "Marshal length {len} at offset {} exceeds remaining data",
                self.posit - 4
            )));
        }
        Ok(len)
    }

    fn read_object(&mut self) -> ExtractResult<Object> {
        match self.read_object_or_null()? {
            Some(obj) => Ok(obj),
            None => Err(ExtractError::Format(format!(
                "Unexpected NULL marshal object at offset {}",
                self.posit - 1
            ))),
        }
    }

    /// Reads one object; `None` is the `TYPE_NULL` marker that
    /// terminates dicts.
    fn read_object_or_null(&mut self) -> ExtractResult<Option<Object>> {
        let posit = self.posit;
        let code = self.read_u8()?;
        let flagged = code & FLAG_REF != 0;
        let code = code & !FLAG_REF;

        if is_container(code) {
            self.depth += 1;
            if self.depth > MAX_CONTAINER_DEPTH {
                return Err(ExtractError::Format(format!(
                    "Marshal data at offset {posit} nests containers \
                     more than {MAX_CONTAINER_DEPTH} deep"
                )));
            }
        }

        // Containers claim their back-reference slot *before* their items
        // are read (matching the writer), so reserve now and fill in later.
        let reserved = if flagged && is_container(code) {
            self.refs.push(Object::None);
            Some(self.refs.len() - 1)
        } else {
            None
        };

        let object = match code {
            TYPE_NULL => return Ok(None),
            TYPE_NONE => Object::None,
            TYPE_TRUE => Object::Bool(true),
            TYPE_FALSE => Object::Bool(false),
            TYPE_INT => Object::Int(self.read_i32()? as i64),
            TYPE_INT64 => {
                let bytes = self.take(8)?;
                Object::Int(i64::from_le_bytes(bytes.try_into().unwrap()))
            }
            TYPE_LONG => self.read_long()?,
            TYPE_BINARY_FLOAT => {
                let bytes = self.take(8)?;
                Object::Float(f64::from_le_bytes(bytes.try_into().unwrap()))
            }
            TYPE_STRING => {
                let len = self.read_length()?;
                Object::Bytes(self.take(len)?.to_vec())
            }
            TYPE_INTERNED => {
                let len = self.read_length()?;
                let obj = bytes_to_str(self.take(len)?);
                // Python 2 kept interned strings in the reference table
                // without any flag bit.
                if !flagged {
                    self.refs.push(obj.clone());
                }
                obj
            }
            TYPE_UNICODE | TYPE_ASCII | TYPE_ASCII_INTERNED => {
                let len = self.read_length()?;
                bytes_to_str(self.take(len)?)
            }
            TYPE_SHORT_ASCII | TYPE_SHORT_ASCII_INTERNED => {
                let len = self.read_u8()? as usize;
                bytes_to_str(self.take(len)?)
            }
            TYPE_TUPLE => {
                let count = self.read_length()?;
                Object::Tuple(self.read_items(count)?)
            }
            TYPE_SMALL_TUPLE => {
                let count = self.read_u8()? as usize;
                Object::Tuple(self.read_items(count)?)
            }
            TYPE_LIST => {
                let count = self.read_length()?;
                Object::List(self.read_items(count)?)
            }
            TYPE_DICT => {
                let mut pairs = Vec::new();
                loop {
                    let key = match self.read_object_or_null()? {
                        Some(key) => key,
                        None => break,
                    };
                    let value = self.read_object()?;
                    pairs.push((key, value));
                }
                Object::Dict(pairs)
            }
            TYPE_REF | TYPE_STRINGREF => {
                let index = self.read_u32()? as usize;
                return match self.refs.get(index) {
                    Some(obj) => Ok(Some(obj.clone())),
                    None => Err(ExtractError::Format(format!(
                        "Marshal back-reference {index} at offset {posit} \
                         points past the {} known objects",
                        self.refs.len()
                    ))),
                };
            }
            other => {
                return Err(ExtractError::Format(format!(
                    "Unsupported marshal type code {:?} at offset {posit}",
                    other as char
                )))
            }
        };

        if is_container(code) {
            self.depth -= 1;
        }

        match reserved {
            Some(index) => self.refs[index] = object.clone(),
            None if flagged => self.refs.push(object.clone()),
            None => {}
        }
        Ok(Some(object))
    }

    fn read_items(&mut self, count: usize) -> ExtractResult<Vec<Object>> {
        let mut items = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            items.push(self.read_object()?);
        }
        Ok(items)
    }

    /// `TYPE_LONG`: a signed digit count, then that many 15-bit digits,
    /// least significant first.
    fn read_long(&mut self) -> ExtractResult<Object> {
        let ndigits = self.read_i32()?;
        let negative = ndigits < 0;
        let ndigits = ndigits.unsigned_abs() as usize;
        let mut value: i64 = 0;
        for i in 0..ndigits {
            let bytes = self.take(2)?;
            let digit = u16::from_le_bytes(bytes.try_into().unwrap()) as i64;
            value = (digit.checked_shl((15 * i) as u32))
                .and_then(|shifted| value.checked_add(shifted))
                .ok_or_else(|| {
                    ExtractError::Format(format!(
                        "Marshal long at offset {} doesn't fit in 64 bits",
                        self.posit
                    ))
                })?;
        }
        Ok(Object::Int(if negative { -value } else { value }))
    }
}

fn is_container(code: u8) -> bool {
    matches!(code, TYPE_TUPLE | TYPE_SMALL_TUPLE | TYPE_LIST | TYPE_DICT)
}

fn bytes_to_str(bytes: &[u8]) -> Object {
    match std::str::from_utf8(bytes) {
        Ok(s) => Object::Str(s.to_owned()),
        Err(_) => Object::Bytes(bytes.to_vec()),
    }
}
