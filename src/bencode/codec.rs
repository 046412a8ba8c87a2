use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::BencodeError;
use super::value::Value;

const MAX_DEPTH: usize = 32;

/// Decodes exactly one bencoded term, rejecting trailing bytes.
pub fn decode(input: &[u8]) -> Result<Value, BencodeError> {
    let (value, consumed) = decode_prefix(input)?;
    if consumed != input.len() {
        return Err(BencodeError::TrailingBytes);
    }
    Ok(value)
}

/// Decodes the term at the start of `input`, returning it together with the
/// number of bytes it occupied. Used where a bencoded header is followed by
/// raw payload, as in the metadata exchange.
pub fn decode_prefix(input: &[u8]) -> Result<(Value, usize), BencodeError> {
    let mut decoder = Decoder { input, pos: 0 };
    let value = decoder.term(0)?;
    Ok((value, decoder.pos))
}

/// Encodes a value into canonical bencode.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_term(value, &mut out);
    out
}

struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::Truncated)
    }

    fn term(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::TooDeep);
        }
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.byte_string().map(Value::Bytes),
            other => Err(BencodeError::UnexpectedByte(other)),
        }
    }

    /// Consumes bytes up to (and including) the delimiter, returning the
    /// span before it.
    fn take_until(&mut self, stop: u8) -> Result<&'a [u8], BencodeError> {
        let start = self.pos;
        while self.peek()? != stop {
            self.pos += 1;
        }
        let span = &self.input[start..self.pos];
        self.pos += 1;
        Ok(span)
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1;
        let digits = self.take_until(b'e')?;
        let text = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidInt)?;
        // canonical form only: no empty body, no leading zeros, no "-0"
        if text.is_empty()
            || text.starts_with("-0")
            || (text.len() > 1 && text.starts_with('0'))
        {
            return Err(BencodeError::InvalidInt);
        }
        text.parse()
            .map(Value::Int)
            .map_err(|_| BencodeError::InvalidInt)
    }

    fn byte_string(&mut self) -> Result<Bytes, BencodeError> {
        let digits = self.take_until(b':')?;
        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|text| text.parse().ok())
            .ok_or(BencodeError::InvalidLength)?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.input.len())
            .ok_or(BencodeError::Truncated)?;
        let bytes = Bytes::copy_from_slice(&self.input[self.pos..end]);
        self.pos = end;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.term(depth + 1)?);
        }
        self.pos += 1;
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut entries = BTreeMap::new();
        while self.peek()? != b'e' {
            let next = self.peek()?;
            if !next.is_ascii_digit() {
                return Err(BencodeError::UnexpectedByte(next));
            }
            let key = self.byte_string()?;
            let value = self.term(depth + 1)?;
            entries.insert(key, value);
        }
        self.pos += 1;
        Ok(Value::Dict(entries))
    }
}

fn write_term(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => write_bytes(b, out),
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                write_term(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(entries) => {
            out.push(b'd');
            for (key, val) in entries {
                write_bytes(key, out);
                write_term(val, out);
            }
            out.push(b'e');
        }
    }
}

fn write_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}
