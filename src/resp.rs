/*!
 * RESP Value Type and Wire Codec
 *
 * Decodes and encodes the Redis serialization protocol: simple strings,
 * errors, integers, bulk strings and arrays, plus inline (telnet-style)
 * input canonicalized into array form at decode time. Mirrors the
 * `resp`/`RESP` struct from the reference implementation: a tagged value
 * whose `data` field holds either the raw payload (for string/int/error) or
 * the pre-rendered length prefix (for bulk/array), with children reused
 * across decodes via `next()` so a busy connection doesn't reallocate its
 * array backing on every command.
 */

use crate::bufio::{Reader, Writer};
use crate::error::{ProxyError, Result};
use bytes::Bytes;
use std::io::{Read, Write};

pub type RespType = u8;

pub const RESP_UNKNOWN: RespType = b'0';
pub const RESP_ERROR: RespType = b'-';
pub const RESP_STRING: RespType = b'+';
pub const RESP_INT: RespType = b':';
pub const RESP_BULK: RespType = b'$';
pub const RESP_ARRAY: RespType = b'*';

const NULL_DATA: &[u8] = b"-1";
const CRLF: &[u8] = b"\r\n";

/// One decoded or to-be-encoded RESP value.
///
/// For `RESP_BULK`/`RESP_ARRAY`, `data` holds the decimal length prefix
/// text (not the payload) so re-encoding never needs to recompute it;
/// `array`/`array_size` hold the children, with `array` over-allocated and
/// reused across resets (`array_size` is the live count).
#[derive(Debug, Default, Clone)]
pub struct Resp {
    pub resp_type: RespType,
    pub data: Vec<u8>,
    pub array: Vec<Resp>,
    pub array_size: usize,
}

impl Resp {
    pub fn new() -> Self {
        Resp {
            resp_type: RESP_UNKNOWN,
            data: Vec::new(),
            array: Vec::new(),
            array_size: 0,
        }
    }

    pub fn reset(&mut self) {
        self.resp_type = RESP_UNKNOWN;
        self.data.clear();
        self.array_size = 0;
    }

    pub fn array(&self) -> &[Resp] {
        &self.array[..self.array_size]
    }

    pub fn array_mut(&mut self) -> &mut [Resp] {
        &mut self.array[..self.array_size]
    }

    /// Append (or reuse) the next child slot, returning it ready to decode
    /// into.
    fn next(&mut self) -> &mut Resp {
        if self.array_size < self.array.len() {
            let i = self.array_size;
            self.array[i].reset();
        } else {
            self.array.push(Resp::new());
        }
        self.array_size += 1;
        let i = self.array_size - 1;
        &mut self.array[i]
    }

    /// Deep-copy another Resp's contents into this one, reusing children.
    pub fn copy_from(&mut self, other: &Resp) {
        self.reset();
        self.resp_type = other.resp_type;
        self.data.extend_from_slice(&other.data);
        for child in other.array() {
            self.next().copy_from(child);
        }
    }

    pub fn decode<R: Read>(&mut self, br: &mut Reader<R>) -> Result<()> {
        self.reset();
        let mark = br.mark();
        let line = match br.read_line() {
            Ok(l) => l,
            Err(e) => {
                br.advance_to(mark);
                return Err(e);
            }
        };
        let line = line.to_vec();
        let t = line[0];
        self.resp_type = t;
        match t {
            RESP_STRING | RESP_INT | RESP_ERROR => {
                self.data.extend_from_slice(&line[1..line.len() - 2]);
                Ok(())
            }
            RESP_BULK => self.decode_bulk(&line, br, mark),
            RESP_ARRAY => self.decode_array(&line, br, mark),
            _ => self.decode_inline(&line),
        }
    }

    fn decode_inline(&mut self, line: &[u8]) -> Result<()> {
        let fields: Vec<&[u8]> = line
            .split(|&b| b == b' ' || b == b'\t')
            .filter(|f| !f.is_empty())
            .collect();
        if fields.is_empty() {
            return Err(ProxyError::BadRequest);
        }
        self.resp_type = RESP_ARRAY;
        self.data = fields.len().to_string().into_bytes();
        self.array_size = 0;
        self.array.clear();
        for field in &fields {
            let child = self.next();
            child.resp_type = RESP_BULK;
            child.data = field.to_vec();
        }
        Ok(())
    }

    fn decode_bulk<R: Read>(&mut self, line: &[u8], br: &mut Reader<R>, mark: usize) -> Result<()> {
        let ls = line.len();
        let len_bytes = &line[1..ls - 2];
        let len: i64 = parse_decimal(len_bytes)?;
        if len == -1 {
            self.data.clear();
            return Ok(());
        }
        // We already consumed the header line; rewind and re-read the whole
        // frame exactly so a BufferFull here restores the original mark.
        br.advance_to(mark);
        let total = ls + len as usize + 2;
        match br.read_exact(total) {
            Ok(data) => {
                self.data.clear();
                self.data.extend_from_slice(&data[ls..data.len() - 2]);
                Ok(())
            }
            Err(e) => {
                br.advance_to(mark);
                Err(e)
            }
        }
    }

    fn decode_array<R: Read>(&mut self, line: &[u8], br: &mut Reader<R>, mark: usize) -> Result<()> {
        let ls = line.len();
        let len_bytes = &line[1..ls - 2];
        let len: i64 = parse_decimal(len_bytes)?;
        if len == -1 {
            self.data.clear();
            return Ok(());
        }
        self.data.clear();
        self.data.extend_from_slice(len_bytes);
        self.array_size = 0;
        for _ in 0..len {
            // next() only grows self.array; it is safe to call while
            // decoding into the freshly returned child below.
            let idx = {
                if self.array_size < self.array.len() {
                    self.array[self.array_size].reset();
                } else {
                    self.array.push(Resp::new());
                }
                self.array_size += 1;
                self.array_size - 1
            };
            let mut child = std::mem::take(&mut self.array[idx]);
            let res = child.decode(br);
            self.array[idx] = child;
            if res.is_err() {
                br.advance_to(mark);
                return res;
            }
        }
        Ok(())
    }

    pub fn encode<W: Write>(&self, bw: &mut Writer<W>) -> Result<()> {
        match self.resp_type {
            RESP_INT | RESP_STRING | RESP_ERROR => self.encode_plain(bw),
            RESP_BULK => self.encode_bulk(bw),
            RESP_ARRAY => self.encode_array(bw),
            _ => Ok(()),
        }
    }

    fn encode_plain<W: Write>(&self, bw: &mut Writer<W>) -> Result<()> {
        let tag: &[u8] = match self.resp_type {
            RESP_INT => b":",
            RESP_ERROR => b"-",
            RESP_STRING => b"+",
            _ => unreachable!(),
        };
        bw.write(Bytes::from_static(tag))?;
        if !self.data.is_empty() {
            bw.write(Bytes::copy_from_slice(&self.data))?;
        }
        bw.write(Bytes::from_static(CRLF))
    }

    fn encode_bulk<W: Write>(&self, bw: &mut Writer<W>) -> Result<()> {
        bw.write(Bytes::from_static(b"$"))?;
        if !self.data.is_empty() {
            bw.write(Bytes::copy_from_slice(&self.data))?;
        } else {
            bw.write(Bytes::from_static(NULL_DATA))?;
        }
        bw.write(Bytes::from_static(CRLF))
    }

    fn encode_array<W: Write>(&self, bw: &mut Writer<W>) -> Result<()> {
        bw.write(Bytes::from_static(b"*"))?;
        if !self.data.is_empty() {
            bw.write(Bytes::copy_from_slice(&self.data))?;
        } else {
            bw.write(Bytes::from_static(NULL_DATA))?;
        }
        bw.write(Bytes::from_static(CRLF))?;
        for child in self.array() {
            child.encode(bw)?;
        }
        Ok(())
    }
}

fn parse_decimal(s: &[u8]) -> Result<i64> {
    std::str::from_utf8(s)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(ProxyError::BadRequest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer;
    use std::io::Cursor;

    fn decode_one(input: &[u8]) -> Resp {
        let mut r = Reader::new(Cursor::new(input.to_vec()), buffer::get(256));
        r.read().unwrap();
        let mut resp = Resp::new();
        resp.decode(&mut r).unwrap();
        resp
    }

    fn encode_one(r: &Resp) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut w = Writer::new(&mut out);
            r.encode(&mut w).unwrap();
            w.flush().unwrap();
        }
        out
    }

    #[test]
    fn round_trips_bulk_string() {
        let r = decode_one(b"$5\r\nhello\r\n");
        assert_eq!(r.resp_type, RESP_BULK);
        assert_eq!(encode_one(&r), b"$5\r\nhello\r\n");
    }

    #[test]
    fn round_trips_null_bulk() {
        let r = decode_one(b"$-1\r\n");
        assert_eq!(encode_one(&r), b"$-1\r\n");
    }

    #[test]
    fn round_trips_array_of_bulks() {
        let r = decode_one(b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n");
        assert_eq!(r.resp_type, RESP_ARRAY);
        assert_eq!(r.array().len(), 2);
        assert_eq!(encode_one(&r), b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n");
    }

    #[test]
    fn canonicalizes_inline_command() {
        let r = decode_one(b"PING\r\n");
        assert_eq!(r.resp_type, RESP_ARRAY);
        assert_eq!(r.array().len(), 1);
        assert_eq!(r.array()[0].data, b"PING");
    }

    #[test]
    fn incomplete_bulk_reports_buffer_full_without_consuming() {
        let mut r = Reader::new(Cursor::new(b"$5\r\nhel".to_vec()), buffer::get(256));
        r.read().unwrap();
        let mark = r.mark();
        let mut resp = Resp::new();
        assert!(matches!(resp.decode(&mut r), Err(ProxyError::BufferFull)));
        assert_eq!(r.mark(), mark);
    }
}
