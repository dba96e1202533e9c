use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::BencodeError;
use super::value::Value;

const MAX_DEPTH: usize = 64;

/// Decodes a single bencode value from a byte slice.
///
/// The input must contain exactly one complete value; trailing data is an
/// error.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut d = Decoder { data, pos: 0 };
    let value = d.value(0)?;

    if d.pos != data.len() {
        return Err(BencodeError::TrailingData);
    }

    Ok(value)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Decoder<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep);
        }

        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.bytes().map(Value::Bytes),
            c => Err(BencodeError::UnexpectedByte(c)),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1;
        let digits = self.take_until(b'e')?;
        let s = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidInteger)?;

        if s.is_empty() || s == "-" {
            return Err(BencodeError::InvalidInteger);
        }
        if s.starts_with("-0") || (s.starts_with('0') && s.len() > 1) {
            return Err(BencodeError::InvalidInteger);
        }

        let value = s.parse().map_err(|_| BencodeError::InvalidInteger)?;
        self.pos += 1;
        Ok(Value::Integer(value))
    }

    fn bytes(&mut self) -> Result<Bytes, BencodeError> {
        let digits = self.take_until(b':')?;
        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidStringLength)?;
        self.pos += 1;

        if self.pos + len > self.data.len() {
            return Err(BencodeError::UnexpectedEof);
        }

        let bytes = Bytes::copy_from_slice(&self.data[self.pos..self.pos + len]);
        self.pos += len;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut items = Vec::new();

        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }

        self.pos += 1;
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut entries = BTreeMap::new();

        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::NonStringKey);
            }
            let key = self.bytes()?;
            let value = self.value(depth + 1)?;
            entries.insert(key, value);
        }

        self.pos += 1;
        Ok(Value::Dict(entries))
    }

    fn take_until(&mut self, stop: u8) -> Result<&[u8], BencodeError> {
        let start = self.pos;
        while self.peek()? != stop {
            self.pos += 1;
        }
        Ok(&self.data[start..self.pos])
    }
}
