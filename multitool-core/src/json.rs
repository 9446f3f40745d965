//! Just enough JSON for the API: flat objects of strings, integers, booleans
//! and null. Nested values are rejected.

use core::fmt;
use heapless::{String as HString, Vec};
use thiserror::Error;

pub const MAX_FIELDS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum JsonError {
    #[error("invalid JSON")]
    Syntax,
    #[error("too many fields")]
    TooManyFields,
    #[error("unsupported value")]
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value<'a> {
    /// Raw string contents between the quotes, escapes not yet resolved.
    Str(&'a str),
    Int(i64),
    Bool(bool),
    Null,
}

impl<'a> Value<'a> {
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(n),
            _ => None,
        }
    }

    /// Resolve escapes into a bounded string. `None` if it is not a string,
    /// does not fit, or uses `\u` escapes.
    pub fn to_bounded<const N: usize>(self) -> Option<HString<N>> {
        let Value::Str(raw) = self else {
            return None;
        };
        let mut out = HString::new();
        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            let c = if c == '\\' {
                match chars.next()? {
                    '"' => '"',
                    '\\' => '\\',
                    '/' => '/',
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    'b' => '\u{8}',
                    'f' => '\u{c}',
                    _ => return None,
                }
            } else {
                c
            };
            out.push(c).ok()?;
        }
        Some(out)
    }
}

/// A parsed top-level object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Object<'a> {
    fields: Vec<(&'a str, Value<'a>), MAX_FIELDS>,
}

impl<'a> Object<'a> {
    pub fn parse(text: &'a str) -> Result<Self, JsonError> {
        let mut p = Parser {
            src: text.as_bytes(),
            text,
            pos: 0,
        };
        let mut fields = Vec::new();
        p.expect(b'{')?;
        if !p.eat(b'}') {
            loop {
                let key = p.string()?;
                p.expect(b':')?;
                let value = p.value()?;
                fields.push((key, value)).map_err(|_| JsonError::TooManyFields)?;
                if p.eat(b'}') {
                    break;
                }
                p.expect(b',')?;
            }
        }
        p.skip_ws();
        if p.pos != p.src.len() {
            return Err(JsonError::Syntax);
        }
        Ok(Self { fields })
    }

    pub fn get(&self, key: &str) -> Option<Value<'a>> {
        self.fields.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }
}

struct Parser<'a> {
    src: &'a [u8],
    text: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn skip_ws(&mut self) {
        while self.src.get(self.pos).is_some_and(|c| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, c: u8) -> bool {
        self.skip_ws();
        if self.src.get(self.pos) == Some(&c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: u8) -> Result<(), JsonError> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(JsonError::Syntax)
        }
    }

    fn string(&mut self) -> Result<&'a str, JsonError> {
        self.expect(b'"')?;
        let start = self.pos;
        loop {
            match self.src.get(self.pos) {
                None => return Err(JsonError::Syntax),
                Some(b'"') => break,
                Some(b'\\') => self.pos += 2,
                Some(c) if *c < 0x20 => return Err(JsonError::Syntax),
                Some(_) => self.pos += 1,
            }
        }
        // Quotes and backslashes are ASCII, so both ends are char boundaries.
        let s = self.text.get(start..self.pos).ok_or(JsonError::Syntax)?;
        self.pos += 1;
        Ok(s)
    }

    fn literal(&mut self, word: &[u8]) -> bool {
        if self.src[self.pos..].starts_with(word) {
            self.pos += word.len();
            true
        } else {
            false
        }
    }

    fn value(&mut self) -> Result<Value<'a>, JsonError> {
        self.skip_ws();
        match self.src.get(self.pos) {
            Some(b'"') => Ok(Value::Str(self.string()?)),
            Some(b'{') | Some(b'[') => Err(JsonError::Unsupported),
            Some(b't') if self.literal(b"true") => Ok(Value::Bool(true)),
            Some(b'f') if self.literal(b"false") => Ok(Value::Bool(false)),
            Some(b'n') if self.literal(b"null") => Ok(Value::Null),
            Some(c) if *c == b'-' || c.is_ascii_digit() => self.number(),
            _ => Err(JsonError::Syntax),
        }
    }

    fn number(&mut self) -> Result<Value<'a>, JsonError> {
        let start = self.pos;
        if self.src.get(self.pos) == Some(&b'-') {
            self.pos += 1;
        }
        while self.src.get(self.pos).is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        if matches!(self.src.get(self.pos), Some(b'.' | b'e' | b'E')) {
            return Err(JsonError::Unsupported);
        }
        self.text[start..self.pos]
            .parse()
            .map(Value::Int)
            .map_err(|_| JsonError::Syntax)
    }
}

/// Writes `s` as the inside of a JSON string literal.
pub struct Escaped<'a>(pub &'a str);

impl fmt::Display for Escaped<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            match c {
                '"' => f.write_str("\\\"")?,
                '\\' => f.write_str("\\\\")?,
                '\n' => f.write_str("\\n")?,
                '\r' => f.write_str("\\r")?,
                '\t' => f.write_str("\\t")?,
                c if (c as u32) < 0x20 => write!(f, "\\u{:04x}", c as u32)?,
                c => write!(f, "{}", c)?,
            }
        }
        Ok(())
    }
}
