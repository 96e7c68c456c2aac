//! # Bencoding Codec
//!
//! This module implements the bencoding serialisation format used by the
//! BitTorrent metainfo file, the tracker response, and the extension
//! protocol messages.
//!
//! ## Wire Format
//!
//! Bencoding knows four kinds of values:
//!
//! - **Byte string**: `<length>:<bytes>` (e.g. `5:hello`)
//! - **Integer**: `i<decimal>e` (e.g. `i-42e`)
//! - **List**: `l<values>e` (e.g. `l4:spam4:eggse`)
//! - **Dictionary**: `d<key><value>...e` with byte-string keys
//!
//! ## Canonical Encoding
//!
//! The encoder always emits dictionary keys in lexicographic byte order.
//! This matters: the torrent info-hash is the SHA-1 of the bencoded info
//! dictionary, so two clients only agree on the hash if they agree on the
//! byte-exact encoding. Keys are stored in a `BTreeMap`, which makes the
//! canonical order a property of the data structure rather than a sorting
//! step.
//!
//! ## Streaming Decoder
//!
//! The decoder works on any buffered reader and consumes exactly one value,
//! leaving whatever follows unread. Extension messages rely on this: a
//! metadata reply carries a bencoded header immediately followed by a raw
//! bencoded payload, and both are pulled off the same reader in turn.

use anyhow::{anyhow, bail, Result};

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};

/// A decoded bencoded value.
///
/// Dictionary keys are raw byte strings; the `BTreeMap` keeps them in
/// lexicographic byte order, which is the canonical encoding order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A byte string, not necessarily valid UTF-8 (piece hashes are binary)
    Bytes(Vec<u8>),
    /// A signed integer
    Int(i64),
    /// An ordered sequence of values
    List(Vec<Value>),
    /// A mapping from byte-string keys to values
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    /// Returns a short name for the value kind, used in error messages.
    fn kind(&self) -> &'static str {
        match self {
            Value::Bytes(_) => "string",
            Value::Int(_) => "integer",
            Value::List(_) => "list",
            Value::Dict(_) => "dictionary",
        }
    }

    /// Returns the raw bytes of a byte-string value.
    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Value::Bytes(bytes) => Ok(bytes),
            other => Err(anyhow!("invalid bencode: expected string, got {}", other.kind())),
        }
    }

    /// Returns a byte-string value decoded as UTF-8.
    pub fn as_str(&self) -> Result<&str> {
        let bytes = self.as_bytes()?;
        std::str::from_utf8(bytes).map_err(|_| anyhow!("invalid bencode: string is not valid UTF-8"))
    }

    /// Returns an integer value.
    pub fn as_int(&self) -> Result<i64> {
        match self {
            Value::Int(n) => Ok(*n),
            other => Err(anyhow!("invalid bencode: expected integer, got {}", other.kind())),
        }
    }

    /// Returns the elements of a list value.
    #[allow(dead_code)]
    pub fn as_list(&self) -> Result<&[Value]> {
        match self {
            Value::List(values) => Ok(values),
            other => Err(anyhow!("invalid bencode: expected list, got {}", other.kind())),
        }
    }

    /// Returns the entries of a dictionary value.
    pub fn as_dict(&self) -> Result<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(entries) => Ok(entries),
            other => Err(anyhow!(
                "invalid bencode: expected dictionary, got {}",
                other.kind()
            )),
        }
    }

    /// Looks up a required key in a dictionary value.
    pub fn get(&self, key: &str) -> Result<&Value> {
        self.as_dict()?
            .get(key.as_bytes())
            .ok_or_else(|| anyhow!("invalid bencode: missing key {:?}", key))
    }
}

/// Decode a single bencoded value from a byte slice.
pub fn decode_bytes(mut buf: &[u8]) -> Result<Value> {
    decode_value(&mut buf)
}

/// Decode a single bencoded value from a reader.
pub fn decode_reader<R: Read>(reader: R) -> Result<Value> {
    decode_value(&mut BufReader::new(reader))
}

/// Decode the next bencoded value from a buffered reader.
///
/// Consumes exactly one value and leaves any trailing bytes unread, so a
/// caller can continue decoding from the same reader.
pub fn decode_value<R: BufRead>(reader: &mut R) -> Result<Value> {
    let first = peek_byte(reader)?.ok_or_else(|| anyhow!("invalid bencode: unexpected end of input"))?;

    match first {
        b'0'..=b'9' | b'-' => Ok(Value::Bytes(decode_string(reader)?)),
        b'i' => decode_int(reader),
        b'l' => decode_list(reader),
        b'd' => decode_dict(reader),
        other => Err(anyhow!("invalid bencode: unexpected byte {:?}", other as char)),
    }
}

/// Decode a byte string: a decimal length, a colon, then the raw bytes.
fn decode_string<R: BufRead>(reader: &mut R) -> Result<Vec<u8>> {
    let length = parse_number(reader, b':')?;
    if length < 0 {
        bail!("invalid bencode: negative string length {}", length);
    }

    let mut buf = vec![0; length as usize];
    reader
        .read_exact(&mut buf)
        .map_err(|_| anyhow!("invalid bencode: string shorter than its declared length"))?;

    Ok(buf)
}

/// Decode an integer: `i`, a decimal number, `e`.
fn decode_int<R: BufRead>(reader: &mut R) -> Result<Value> {
    expect_byte(reader, b'i')?;

    Ok(Value::Int(parse_number(reader, b'e')?))
}

/// Decode a list: `l`, concatenated values, `e`.
fn decode_list<R: BufRead>(reader: &mut R) -> Result<Value> {
    expect_byte(reader, b'l')?;

    let mut values = Vec::new();
    loop {
        match peek_byte(reader)? {
            None => bail!("invalid bencode: unterminated list"),
            Some(b'e') => {
                reader.consume(1);
                return Ok(Value::List(values));
            }
            Some(_) => values.push(decode_value(reader)?),
        }
    }
}

/// Decode a dictionary: `d`, repeated key-value pairs, `e`.
///
/// Keys are accepted in any order; they land in canonical order by virtue
/// of the backing map.
fn decode_dict<R: BufRead>(reader: &mut R) -> Result<Value> {
    expect_byte(reader, b'd')?;

    let mut entries = BTreeMap::new();
    loop {
        match peek_byte(reader)? {
            None => bail!("invalid bencode: unterminated dictionary"),
            Some(b'e') => {
                reader.consume(1);
                return Ok(Value::Dict(entries));
            }
            Some(b'0'..=b'9') => {
                let key = decode_string(reader)?;
                let value = decode_value(reader)?;
                entries.insert(key, value);
            }
            Some(other) => bail!(
                "invalid bencode: dictionary key must be a string, got byte {:?}",
                other as char
            ),
        }
    }
}

/// Parse an ASCII decimal number terminated by `delim`.
///
/// Rejects empty numbers, `-0`, and leading zeros (other than the value
/// `0` itself).
fn parse_number<R: BufRead>(reader: &mut R, delim: u8) -> Result<i64> {
    let mut digits = Vec::new();
    loop {
        let byte = read_byte(reader)?.ok_or_else(|| anyhow!("invalid bencode: unterminated number"))?;
        if byte == delim {
            break;
        }
        digits.push(byte);
    }

    let text = std::str::from_utf8(&digits).map_err(|_| anyhow!("invalid bencode: malformed number"))?;
    let body = text.strip_prefix('-').unwrap_or(text);

    if body.is_empty() || !body.bytes().all(|b| b.is_ascii_digit()) {
        bail!("invalid bencode: malformed number {:?}", text);
    }
    if body.len() > 1 && body.starts_with('0') {
        bail!("invalid bencode: number {:?} has leading zeros", text);
    }
    if text == "-0" {
        bail!("invalid bencode: negative zero");
    }

    text.parse()
        .map_err(|_| anyhow!("invalid bencode: number {:?} out of range", text))
}

/// Look at the next byte without consuming it.
fn peek_byte<R: BufRead>(reader: &mut R) -> Result<Option<u8>> {
    let buf = reader.fill_buf()?;

    Ok(buf.first().copied())
}

/// Read and consume the next byte.
fn read_byte<R: BufRead>(reader: &mut R) -> Result<Option<u8>> {
    let byte = peek_byte(reader)?;
    if byte.is_some() {
        reader.consume(1);
    }

    Ok(byte)
}

/// Consume the next byte and check it is the expected one.
fn expect_byte<R: BufRead>(reader: &mut R, expected: u8) -> Result<()> {
    match read_byte(reader)? {
        Some(byte) if byte == expected => Ok(()),
        Some(byte) => Err(anyhow!(
            "invalid bencode: expected {:?}, got {:?}",
            expected as char,
            byte as char
        )),
        None => Err(anyhow!("invalid bencode: unexpected end of input")),
    }
}

/// Encode a value into its canonical bencoded form.
///
/// Dictionary keys come out in lexicographic byte order, and byte strings
/// are emitted verbatim, so `encode` is the inverse of the decoder on the
/// canonical form.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);

    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Bytes(bytes) => {
            out.extend_from_slice(bytes.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(bytes);
        }
        Value::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::List(values) => {
            out.push(b'l');
            for value in values {
                encode_into(value, out);
            }
            out.push(b'e');
        }
        Value::Dict(entries) => {
            out.push(b'd');
            for (key, value) in entries {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(value, out);
            }
            out.push(b'e');
        }
    }
}

/// Project a value onto JSON for display.
///
/// Byte strings are rendered as (lossily decoded) UTF-8 strings.
pub fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Bytes(bytes) => serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned()),
        Value::Int(n) => serde_json::Value::Number((*n).into()),
        Value::List(values) => serde_json::Value::Array(values.iter().map(to_json).collect()),
        Value::Dict(entries) => serde_json::Value::Object(
            entries
                .iter()
                .map(|(key, value)| (String::from_utf8_lossy(key).into_owned(), to_json(value)))
                .collect(),
        ),
    }
}
