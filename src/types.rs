//! The subset of the AMQP 1.0 type system the frame codec needs
//!
//! Performatives are encoded on the wire as a described list: a `0x00`
//! descriptor marker, an unsigned-long descriptor code, and a list of
//! positionally significant fields. This module provides a reader and a
//! writer for exactly that shape plus the primitive constructors the
//! transport performatives use. Everything else (maps, arrays of anything
//! but symbols, decimals, timestamps) is skipped on decode and never
//! produced on encode.

use bytes::Bytes;
use thiserror::Error;

// Primitive type constructors
const DESCRIBED: u8 = 0x00;
const NULL: u8 = 0x40;
const TRUE: u8 = 0x41;
const FALSE: u8 = 0x42;
const UINT0: u8 = 0x43;
const ULONG0: u8 = 0x44;
const LIST0: u8 = 0x45;
const UBYTE: u8 = 0x50;
const SMALL_UINT: u8 = 0x52;
const SMALL_ULONG: u8 = 0x53;
const BOOL: u8 = 0x56;
const USHORT: u8 = 0x60;
const UINT: u8 = 0x70;
const ULONG: u8 = 0x80;
const VBIN8: u8 = 0xa0;
const STR8: u8 = 0xa1;
const SYM8: u8 = 0xa3;
const VBIN32: u8 = 0xb0;
const STR32: u8 = 0xb1;
const SYM32: u8 = 0xb3;
const LIST8: u8 = 0xc0;
const LIST32: u8 = 0xd0;
const ARRAY8: u8 = 0xe0;
const ARRAY32: u8 = 0xf0;

/// Reasons a typed value failed to decode
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum Error {
    /// The encoded value ended before its declared extent
    #[error("encoded value ended unexpectedly")]
    UnexpectedEnd,
    /// A field carried a constructor the schema does not allow there
    #[error("unexpected type constructor {0:#04x}")]
    UnexpectedType(u8),
    /// The bytes violate the encoding itself
    #[error("malformed encoded value: {0}")]
    Malformed(&'static str),
}

pub type Result<T> = ::std::result::Result<T, Error>;

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if buf.len() < n {
        return Err(Error::UnexpectedEnd);
    }
    let (head, rest) = buf.split_at(n);
    *buf = rest;
    Ok(head)
}

fn take_u8(buf: &mut &[u8]) -> Result<u8> {
    Ok(take(buf, 1)?[0])
}

fn take_u32(buf: &mut &[u8]) -> Result<u32> {
    let bytes = take(buf, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Skip one complete value, using the width category encoded in the
/// constructor's high nibble
fn skip_value(buf: &mut &[u8]) -> Result<()> {
    let c = take_u8(buf)?;
    if c == DESCRIBED {
        skip_value(buf)?;
        return skip_value(buf);
    }
    let len = match c >> 4 {
        0x4 => 0,
        0x5 => 1,
        0x6 => 2,
        0x7 => 4,
        0x8 => 8,
        0x9 => 16,
        0xa | 0xc | 0xe => take_u8(buf)? as usize,
        0xb | 0xd | 0xf => take_u32(buf)? as usize,
        _ => return Err(Error::Malformed("reserved type constructor")),
    };
    take(buf, len)?;
    Ok(())
}

fn decode_descriptor(buf: &mut &[u8]) -> Result<u64> {
    match take_u8(buf)? {
        ULONG0 => Ok(0),
        SMALL_ULONG => Ok(take_u8(buf)? as u64),
        ULONG => {
            let bytes = take(buf, 8)?;
            let mut x = [0; 8];
            x.copy_from_slice(bytes);
            Ok(u64::from_be_bytes(x))
        }
        _ => Err(Error::Malformed("unsupported descriptor encoding")),
    }
}

/// Positional reader over the fields of one described list
///
/// Reading past the encoded field count yields `None` for every remaining
/// field, mirroring the trailing-null truncation the encoder applies.
pub struct ListReader<'a> {
    fields: &'a [u8],
    remaining: u32,
}

impl<'a> ListReader<'a> {
    /// Decode a described-list preamble from the front of `buf`, leaving
    /// `buf` positioned after the entire value
    pub fn described(buf: &mut &'a [u8]) -> Result<(u64, Self)> {
        if take_u8(buf)? != DESCRIBED {
            return Err(Error::Malformed("expected a described value"));
        }
        let descriptor = decode_descriptor(buf)?;
        let reader = Self::list(buf)?;
        Ok((descriptor, reader))
    }

    fn list(buf: &mut &'a [u8]) -> Result<Self> {
        match take_u8(buf)? {
            LIST0 => Ok(Self {
                fields: &[],
                remaining: 0,
            }),
            LIST8 => {
                let size = take_u8(buf)? as usize;
                let mut body = take(buf, size)?;
                let count = take_u8(&mut body)? as u32;
                Ok(Self {
                    fields: body,
                    remaining: count,
                })
            }
            LIST32 => {
                let size = take_u32(buf)? as usize;
                let mut body = take(buf, size)?;
                let count = take_u32(&mut body)?;
                Ok(Self {
                    fields: body,
                    remaining: count,
                })
            }
            c => Err(Error::UnexpectedType(c)),
        }
    }

    /// Constructor of the next field, or `None` if the field is null or the
    /// list is exhausted
    fn next_constructor(&mut self) -> Result<Option<u8>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        match take_u8(&mut self.fields)? {
            NULL => Ok(None),
            c => Ok(Some(c)),
        }
    }

    /// Skip the next field regardless of its type
    pub fn skip(&mut self) -> Result<()> {
        if self.remaining == 0 {
            return Ok(());
        }
        self.remaining -= 1;
        skip_value(&mut self.fields)
    }

    pub fn bool(&mut self) -> Result<Option<bool>> {
        match self.next_constructor()? {
            None => Ok(None),
            Some(TRUE) => Ok(Some(true)),
            Some(FALSE) => Ok(Some(false)),
            Some(BOOL) => Ok(Some(take_u8(&mut self.fields)? != 0)),
            Some(c) => Err(Error::UnexpectedType(c)),
        }
    }

    pub fn ubyte(&mut self) -> Result<Option<u8>> {
        match self.next_constructor()? {
            None => Ok(None),
            Some(UBYTE) => Ok(Some(take_u8(&mut self.fields)?)),
            Some(c) => Err(Error::UnexpectedType(c)),
        }
    }

    pub fn ushort(&mut self) -> Result<Option<u16>> {
        match self.next_constructor()? {
            None => Ok(None),
            Some(USHORT) => {
                let bytes = take(&mut self.fields, 2)?;
                Ok(Some(u16::from_be_bytes([bytes[0], bytes[1]])))
            }
            Some(c) => Err(Error::UnexpectedType(c)),
        }
    }

    pub fn uint(&mut self) -> Result<Option<u32>> {
        match self.next_constructor()? {
            None => Ok(None),
            Some(UINT0) => Ok(Some(0)),
            Some(SMALL_UINT) => Ok(Some(take_u8(&mut self.fields)? as u32)),
            Some(UINT) => Ok(Some(take_u32(&mut self.fields)?)),
            Some(c) => Err(Error::UnexpectedType(c)),
        }
    }

    pub fn binary(&mut self) -> Result<Option<Bytes>> {
        match self.next_constructor()? {
            None => Ok(None),
            Some(VBIN8) => {
                let len = take_u8(&mut self.fields)? as usize;
                Ok(Some(Bytes::copy_from_slice(take(&mut self.fields, len)?)))
            }
            Some(VBIN32) => {
                let len = take_u32(&mut self.fields)? as usize;
                Ok(Some(Bytes::copy_from_slice(take(&mut self.fields, len)?)))
            }
            Some(c) => Err(Error::UnexpectedType(c)),
        }
    }

    fn text(&mut self, short: u8, long: u8) -> Result<Option<String>> {
        let len = match self.next_constructor()? {
            None => return Ok(None),
            Some(c) if c == short => take_u8(&mut self.fields)? as usize,
            Some(c) if c == long => take_u32(&mut self.fields)? as usize,
            Some(c) => return Err(Error::UnexpectedType(c)),
        };
        let bytes = take(&mut self.fields, len)?;
        match ::std::str::from_utf8(bytes) {
            Ok(s) => Ok(Some(s.to_owned())),
            Err(_) => Err(Error::Malformed("text field is not valid UTF-8")),
        }
    }

    pub fn string(&mut self) -> Result<Option<String>> {
        self.text(STR8, STR32)
    }

    pub fn symbol(&mut self) -> Result<Option<String>> {
        self.text(SYM8, SYM32)
    }

    /// A field declared as "symbol or array of symbols"
    pub fn symbols(&mut self) -> Result<Vec<String>> {
        let (mut body, count) = match self.next_constructor()? {
            None => return Ok(Vec::new()),
            Some(c @ (SYM8 | SYM32)) => {
                // Re-read the length using the already-consumed constructor
                let len = if c == SYM8 {
                    take_u8(&mut self.fields)? as usize
                } else {
                    take_u32(&mut self.fields)? as usize
                };
                let bytes = take(&mut self.fields, len)?;
                return match ::std::str::from_utf8(bytes) {
                    Ok(s) => Ok(vec![s.to_owned()]),
                    Err(_) => Err(Error::Malformed("symbol is not valid UTF-8")),
                };
            }
            Some(ARRAY8) => {
                let size = take_u8(&mut self.fields)? as usize;
                let mut body = take(&mut self.fields, size)?;
                let count = take_u8(&mut body)? as u32;
                (body, count)
            }
            Some(ARRAY32) => {
                let size = take_u32(&mut self.fields)? as usize;
                let mut body = take(&mut self.fields, size)?;
                let count = take_u32(&mut body)?;
                (body, count)
            }
            Some(c) => return Err(Error::UnexpectedType(c)),
        };
        let element = take_u8(&mut body)?;
        if element != SYM8 && element != SYM32 {
            return Err(Error::UnexpectedType(element));
        }
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = if element == SYM8 {
                take_u8(&mut body)? as usize
            } else {
                take_u32(&mut body)? as usize
            };
            let bytes = take(&mut body, len)?;
            match ::std::str::from_utf8(bytes) {
                Ok(s) => out.push(s.to_owned()),
                Err(_) => return Err(Error::Malformed("symbol is not valid UTF-8")),
            }
        }
        Ok(out)
    }

    /// A field holding a nested described list (source, target, error,
    /// delivery state)
    pub fn described_field(&mut self) -> Result<Option<(u64, ListReader<'a>)>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        if self.fields.first() == Some(&NULL) {
            self.remaining -= 1;
            self.fields = &self.fields[1..];
            return Ok(None);
        }
        self.remaining -= 1;
        let (descriptor, reader) = ListReader::described(&mut self.fields)?;
        Ok(Some((descriptor, reader)))
    }
}

/// Writer for the field list of one described list
///
/// Trailing null fields are trimmed on finish, as the compact encoding
/// permits.
#[derive(Default)]
pub struct ListWriter {
    buf: Vec<u8>,
    count: u32,
    trim_len: usize,
    trim_count: u32,
}

impl ListWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn mark(&mut self) {
        self.trim_len = self.buf.len();
        self.trim_count = self.count;
    }

    pub fn null(&mut self) {
        self.buf.push(NULL);
        self.count += 1;
    }

    pub fn bool(&mut self, x: bool) {
        self.buf.push(if x { TRUE } else { FALSE });
        self.count += 1;
        self.mark();
    }

    pub fn ubyte(&mut self, x: u8) {
        self.buf.push(UBYTE);
        self.buf.push(x);
        self.count += 1;
        self.mark();
    }

    pub fn ushort(&mut self, x: u16) {
        self.buf.push(USHORT);
        self.buf.extend_from_slice(&x.to_be_bytes());
        self.count += 1;
        self.mark();
    }

    pub fn uint(&mut self, x: u32) {
        match x {
            0 => self.buf.push(UINT0),
            1..=255 => {
                self.buf.push(SMALL_UINT);
                self.buf.push(x as u8);
            }
            _ => {
                self.buf.push(UINT);
                self.buf.extend_from_slice(&x.to_be_bytes());
            }
        }
        self.count += 1;
        self.mark();
    }

    pub fn binary(&mut self, x: &[u8]) {
        if x.len() <= 255 {
            self.buf.push(VBIN8);
            self.buf.push(x.len() as u8);
        } else {
            self.buf.push(VBIN32);
            self.buf.extend_from_slice(&(x.len() as u32).to_be_bytes());
        }
        self.buf.extend_from_slice(x);
        self.count += 1;
        self.mark();
    }

    fn text(&mut self, short: u8, long: u8, x: &str) {
        if x.len() <= 255 {
            self.buf.push(short);
            self.buf.push(x.len() as u8);
        } else {
            self.buf.push(long);
            self.buf.extend_from_slice(&(x.len() as u32).to_be_bytes());
        }
        self.buf.extend_from_slice(x.as_bytes());
        self.count += 1;
        self.mark();
    }

    pub fn string(&mut self, x: &str) {
        self.text(STR8, STR32, x);
    }

    pub fn symbol(&mut self, x: &str) {
        self.text(SYM8, SYM32, x);
    }

    /// Encode a "symbol or array of symbols" field compactly
    pub fn symbols(&mut self, xs: &[String]) {
        match xs {
            [] => self.null(),
            [x] => self.symbol(x),
            _ => {
                let mut body = vec![SYM8];
                for x in xs {
                    body.push(x.len() as u8);
                    body.extend_from_slice(x.as_bytes());
                }
                self.buf.push(ARRAY8);
                self.buf.push((body.len() + 1) as u8);
                self.buf.push(xs.len() as u8);
                self.buf.extend_from_slice(&body);
                self.count += 1;
                self.mark();
            }
        }
    }

    pub fn opt_bool(&mut self, x: Option<bool>) {
        match x {
            Some(x) => self.bool(x),
            None => self.null(),
        }
    }

    pub fn opt_ushort(&mut self, x: Option<u16>) {
        match x {
            Some(x) => self.ushort(x),
            None => self.null(),
        }
    }

    pub fn opt_uint(&mut self, x: Option<u32>) {
        match x {
            Some(x) => self.uint(x),
            None => self.null(),
        }
    }

    pub fn opt_binary(&mut self, x: Option<&[u8]>) {
        match x {
            Some(x) => self.binary(x),
            None => self.null(),
        }
    }

    pub fn opt_string(&mut self, x: Option<&str>) {
        match x {
            Some(x) => self.string(x),
            None => self.null(),
        }
    }

    /// Append a nested described list as one field
    pub fn described(&mut self, descriptor: u64, fields: ListWriter) {
        encode_described(descriptor, fields, &mut self.buf);
        self.count += 1;
        self.mark();
    }

    fn finish(mut self) -> (Vec<u8>, u32) {
        self.buf.truncate(self.trim_len);
        (self.buf, self.trim_count)
    }
}

/// Encode a complete described list into `out`
pub fn encode_described(descriptor: u64, fields: ListWriter, out: &mut Vec<u8>) {
    out.push(DESCRIBED);
    if descriptor <= 255 {
        out.push(SMALL_ULONG);
        out.push(descriptor as u8);
    } else {
        out.push(ULONG);
        out.extend_from_slice(&descriptor.to_be_bytes());
    }
    let (body, count) = fields.finish();
    if count == 0 {
        out.push(LIST0);
    } else if body.len() + 1 <= 255 {
        out.push(LIST8);
        out.push((body.len() + 1) as u8);
        out.push(count as u8);
        out.extend_from_slice(&body);
    } else {
        out.push(LIST32);
        out.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
        out.extend_from_slice(&count.to_be_bytes());
        out.extend_from_slice(&body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(fields: ListWriter) -> Vec<u8> {
        let mut out = Vec::new();
        encode_described(0x10, fields, &mut out);
        out
    }

    #[test]
    fn trailing_nulls_trimmed() {
        let mut w = ListWriter::new();
        w.string("box");
        w.null();
        w.null();
        let encoded = roundtrip(w);

        let mut buf = &encoded[..];
        let (descriptor, mut r) = ListReader::described(&mut buf).unwrap();
        assert_eq!(descriptor, 0x10);
        assert_eq!(r.string().unwrap().as_deref(), Some("box"));
        // the trimmed fields read back as null
        assert_eq!(r.uint().unwrap(), None);
        assert_eq!(r.uint().unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn interior_null_kept() {
        let mut w = ListWriter::new();
        w.null();
        w.uint(7);
        let encoded = roundtrip(w);

        let mut buf = &encoded[..];
        let (_, mut r) = ListReader::described(&mut buf).unwrap();
        assert_eq!(r.string().unwrap(), None);
        assert_eq!(r.uint().unwrap(), Some(7));
    }

    #[test]
    fn primitive_roundtrip() {
        let mut w = ListWriter::new();
        w.bool(true);
        w.ubyte(2);
        w.ushort(0x1234);
        w.uint(0);
        w.uint(200);
        w.uint(1 << 20);
        w.binary(b"\x00\x01\x02");
        w.symbol("PLAIN");
        let encoded = roundtrip(w);

        let mut buf = &encoded[..];
        let (_, mut r) = ListReader::described(&mut buf).unwrap();
        assert_eq!(r.bool().unwrap(), Some(true));
        assert_eq!(r.ubyte().unwrap(), Some(2));
        assert_eq!(r.ushort().unwrap(), Some(0x1234));
        assert_eq!(r.uint().unwrap(), Some(0));
        assert_eq!(r.uint().unwrap(), Some(200));
        assert_eq!(r.uint().unwrap(), Some(1 << 20));
        assert_eq!(r.binary().unwrap().as_deref(), Some(&b"\x00\x01\x02"[..]));
        assert_eq!(r.symbol().unwrap().as_deref(), Some("PLAIN"));
    }

    #[test]
    fn skip_crosses_unknown_types() {
        // list with a map field (0xc1) followed by a uint we care about
        let mut body = Vec::new();
        body.push(0xc1); // map8
        body.push(1);
        body.push(0); // zero pairs
        body.push(SMALL_UINT);
        body.push(9);
        let mut encoded = vec![DESCRIBED, SMALL_ULONG, 0x12, LIST8, (body.len() + 1) as u8, 2];
        encoded.extend_from_slice(&body);

        let mut buf = &encoded[..];
        let (_, mut r) = ListReader::described(&mut buf).unwrap();
        r.skip().unwrap();
        assert_eq!(r.uint().unwrap(), Some(9));
    }

    #[test]
    fn symbols_singleton_and_array() {
        let mut w = ListWriter::new();
        w.symbols(&["ANONYMOUS".to_owned()]);
        w.symbols(&["PLAIN".to_owned(), "ANONYMOUS".to_owned()]);
        let encoded = roundtrip(w);

        let mut buf = &encoded[..];
        let (_, mut r) = ListReader::described(&mut buf).unwrap();
        assert_eq!(r.symbols().unwrap(), vec!["ANONYMOUS"]);
        assert_eq!(r.symbols().unwrap(), vec!["PLAIN", "ANONYMOUS"]);
    }

    #[test]
    fn truncated_input_reports_unexpected_end() {
        let mut w = ListWriter::new();
        w.string("hello");
        let encoded = roundtrip(w);
        let mut buf = &encoded[..encoded.len() - 1];
        assert_eq!(
            ListReader::described(&mut buf).err(),
            Some(Error::UnexpectedEnd)
        );
    }
}
