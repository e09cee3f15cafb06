//! HPACK header compression (RFC 7541): integer/string primitives, the
//! static and dynamic tables, and the encoder/decoder pair. One encoder and
//! one decoder live per connection, each with its own dynamic table.

use crate::huffman;
use bytes::{Bytes, BytesMut};
use log::trace;
use std::collections::VecDeque;

pub const DEFAULT_TABLE_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Bytes,
    pub value: Bytes,
    /// Came in (or goes out) never-indexed; intermediaries must not compress.
    pub sensitive: bool,
}

impl HeaderField {
    /// RFC 7541 §4.1 size: name + value + 32 octets of overhead.
    #[must_use]
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum HpackError {
    /// Not a decode failure: the block ended mid-field. The caller appends
    /// the next CONTINUATION fragment and retries.
    #[error("header block is truncated; need more bytes")]
    NeedMore,
    #[error("index {0} is not in the header table")]
    InvalidIndex(u64),
    #[error("integer exceeds 63 bits")]
    IntegerOverflow,
    #[error(transparent)]
    Huffman(#[from] huffman::HuffmanError),
    #[error("table size update to {0} exceeds the advertised bound {1}")]
    SizeUpdateTooLarge(usize, usize),
}

#[derive(Debug, Clone)]
struct TableEntry {
    pub size: usize,
    pub name: Bytes,
    pub value: Bytes,
}

impl TableEntry {
    pub fn new(name: Bytes, value: Bytes) -> Self {
        Self {
            size: name.len() + value.len() + 32,
            name,
            value,
        }
    }
}

macro_rules! static_table {
    ( $( $name:expr => $value:expr ),+ ) => {
        [
            $(
                TableEntry {
                    size: $name.len() + $value.len() + 32,
                    name: Bytes::from_static($name),
                    value: Bytes::from_static($value),
                }
            ),+
        ]
    };
}

/// https://httpwg.org/specs/rfc7541.html#static.table.definition
static STATIC_TABLE: [TableEntry; 61] = static_table![
    b":authority" => b"",
    b":method" => b"GET",
    b":method" => b"POST",
    b":path" => b"/",
    b":path" => b"/index.html",
    b":scheme" => b"http",
    b":scheme" => b"https",
    b":status" => b"200",
    b":status" => b"204",
    b":status" => b"206",
    b":status" => b"304",
    b":status" => b"400",
    b":status" => b"404",
    b":status" => b"500",
    b"accept-charset" => b"",
    b"accept-encoding" => b"gzip, deflate",
    b"accept-language" => b"",
    b"accept-ranges" => b"",
    b"accept" => b"",
    b"access-control-allow-origin" => b"",
    b"age" => b"",
    b"allow" => b"",
    b"authorization" => b"",
    b"cache-control" => b"",
    b"content-disposition" => b"",
    b"content-encoding" => b"",
    b"content-language" => b"",
    b"content-length" => b"",
    b"content-location" => b"",
    b"content-range" => b"",
    b"content-type" => b"",
    b"cookie" => b"",
    b"date" => b"",
    b"etag" => b"",
    b"expect" => b"",
    b"expires" => b"",
    b"from" => b"",
    b"host" => b"",
    b"if-match" => b"",
    b"if-modified-since" => b"",
    b"if-none-match" => b"",
    b"if-range" => b"",
    b"if-unmodified-since" => b"",
    b"last-modified" => b"",
    b"link" => b"",
    b"location" => b"",
    b"max-forwards" => b"",
    b"proxy-authenticate" => b"",
    b"proxy-authorization" => b"",
    b"range" => b"",
    b"referer" => b"",
    b"refresh" => b"",
    b"retry-after" => b"",
    b"server" => b"",
    b"set-cookie" => b"",
    b"strict-transport-security" => b"",
    b"transfer-encoding" => b"",
    b"user-agent" => b"",
    b"vary" => b"",
    b"via" => b"",
    b"www-authenticate" => b""
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableMatch {
    Full(usize),
    Name(usize),
    Miss,
}

#[derive(Debug, Clone)]
struct Table {
    max_size: usize,
    current_size: usize,
    table: VecDeque<TableEntry>,
}

impl Table {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            current_size: 0,
            table: VecDeque::new(),
        }
    }

    /// 1-based lookup across static (1..=61) and dynamic (62..) entries.
    pub fn get(&self, index: usize) -> Option<&TableEntry> {
        if index == 0 {
            return None;
        }
        STATIC_TABLE
            .get(index - 1)
            .or_else(|| self.table.get(index - 1 - STATIC_TABLE.len()))
    }

    pub fn push(&mut self, name: Bytes, value: Bytes) {
        let entry = TableEntry::new(name, value);
        self.current_size += entry.size;
        self.table.push_front(entry);
        // An entry larger than the whole table evicts everything, itself
        // included (RFC 7541 §4.4).
        self.evict();
    }

    pub fn resize(&mut self, size: usize) {
        self.max_size = size;
        self.evict();
    }

    fn evict(&mut self) {
        while self.current_size > self.max_size {
            if let Some(popped) = self.table.pop_back() {
                self.current_size -= popped.size;
            } else {
                break;
            }
        }
    }

    pub fn find(&self, name: &[u8], value: &[u8]) -> TableMatch {
        let mut name_match = None;
        let dynamic = self.table.iter().map(|entry| entry as &TableEntry);
        for (position, entry) in STATIC_TABLE.iter().chain(dynamic).enumerate() {
            if entry.name != name {
                continue;
            }
            if entry.value == value {
                return TableMatch::Full(position + 1);
            }
            name_match.get_or_insert(position + 1);
        }
        name_match.map_or(TableMatch::Miss, TableMatch::Name)
    }
}

/// https://httpwg.org/specs/rfc7541.html#integer.representation
fn decode_integer(buf: &[u8], prefix_bits: u32) -> Result<(u64, &[u8]), HpackError> {
    let (&first, mut rest) = buf.split_first().ok_or(HpackError::NeedMore)?;
    let mask = (1_u64 << prefix_bits) - 1;
    let mut value = u64::from(first) & mask;
    if value < mask {
        return Ok((value, rest));
    }
    let mut shift = 0_u32;
    loop {
        let (&byte, tail) = rest.split_first().ok_or(HpackError::NeedMore)?;
        rest = tail;
        if shift >= 63 {
            return Err(HpackError::IntegerOverflow);
        }
        value = value
            .checked_add(u64::from(byte & 0x7f) << shift)
            .ok_or(HpackError::IntegerOverflow)?;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok((value, rest));
        }
    }
}

fn encode_integer(dst: &mut BytesMut, prefix_bits: u32, flags: u8, value: usize) {
    let mask = (1_usize << prefix_bits) - 1;
    if value < mask {
        dst.extend_from_slice(&[flags | value as u8]);
        return;
    }
    dst.extend_from_slice(&[flags | mask as u8]);
    let mut value = value - mask;
    while value >= 0x80 {
        dst.extend_from_slice(&[(value & 0x7f) as u8 | 0x80]);
        value >>= 7;
    }
    dst.extend_from_slice(&[value as u8]);
}

/// https://httpwg.org/specs/rfc7541.html#string.literal.representation
fn decode_string(buf: &[u8]) -> Result<(Bytes, &[u8]), HpackError> {
    let huffman_encoded = *buf.first().ok_or(HpackError::NeedMore)? & 0x80 != 0;
    let (length, rest) = decode_integer(buf, 7)?;
    let length = usize::try_from(length).map_err(|_| HpackError::IntegerOverflow)?;
    if rest.len() < length {
        return Err(HpackError::NeedMore);
    }
    let (raw, rest) = rest.split_at(length);
    let bytes = if huffman_encoded {
        huffman::decode(raw)?.into()
    } else {
        Bytes::copy_from_slice(raw)
    };
    Ok((bytes, rest))
}

fn encode_string(dst: &mut BytesMut, src: &[u8]) {
    let huffman_len = huffman::encoded_len(src);
    if huffman_len < src.len() {
        encode_integer(dst, 7, 0x80, huffman_len);
        huffman::encode(src, dst);
    } else {
        encode_integer(dst, 7, 0, src.len());
        dst.extend_from_slice(src);
    }
}

/// Fields an intermediary must never re-index (RFC 7541 §7.1.3).
fn is_sensitive(name: &[u8]) -> bool {
    matches!(
        name,
        b"authorization" | b"proxy-authorization" | b"cookie" | b"set-cookie"
    )
}

#[derive(Debug, Clone)]
pub struct Encoder {
    table: Table,
    pending_size_update: Option<usize>,
}

impl Encoder {
    #[must_use]
    pub fn with_size(dynamic_table_size: usize) -> Self {
        Self {
            table: Table::new(dynamic_table_size),
            pending_size_update: None,
        }
    }

    /// Shrinks (or re-grows) the dynamic table after the peer lowered its
    /// HEADER_TABLE_SIZE. The matching size-update instruction is emitted at
    /// the start of the next header block.
    pub fn set_max_size(&mut self, size: usize) {
        self.table.resize(size);
        self.pending_size_update = Some(size);
    }

    pub fn encode<K, V>(&mut self, headers: impl IntoIterator<Item = (K, V)>) -> Bytes
    where
        K: Into<Bytes>,
        V: Into<Bytes>,
    {
        let mut dst = BytesMut::with_capacity(256);
        if let Some(size) = self.pending_size_update.take() {
            encode_integer(&mut dst, 5, 0x20, size);
        }
        for (name, value) in headers {
            self.encode_header(&mut dst, name.into(), value.into());
        }
        dst.freeze()
    }

    fn encode_header(&mut self, dst: &mut BytesMut, name: Bytes, value: Bytes) {
        if is_sensitive(&name) {
            match self.table.find(&name, &value) {
                TableMatch::Full(index) | TableMatch::Name(index) => {
                    encode_integer(dst, 4, 0x10, index);
                }
                TableMatch::Miss => {
                    encode_integer(dst, 4, 0x10, 0);
                    encode_string(dst, &name);
                }
            }
            encode_string(dst, &value);
            return;
        }
        match self.table.find(&name, &value) {
            TableMatch::Full(index) => encode_integer(dst, 7, 0x80, index),
            TableMatch::Name(index) => {
                encode_integer(dst, 6, 0x40, index);
                encode_string(dst, &value);
                self.table.push(name, value);
            }
            TableMatch::Miss => {
                encode_integer(dst, 6, 0x40, 0);
                encode_string(dst, &name);
                encode_string(dst, &value);
                self.table.push(name, value);
            }
        }
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::with_size(DEFAULT_TABLE_SIZE)
    }
}

#[derive(Debug, Clone)]
pub struct Decoder {
    table: Table,
    /// Upper bound for size updates: the HEADER_TABLE_SIZE we most recently
    /// advertised in SETTINGS.
    size_limit: usize,
}

impl Decoder {
    #[must_use]
    pub fn with_size(dynamic_table_size: usize) -> Self {
        Self {
            table: Table::new(dynamic_table_size),
            size_limit: dynamic_table_size,
        }
    }

    pub fn set_size_limit(&mut self, limit: usize) {
        self.size_limit = limit;
    }

    /// Decodes a complete header block. `HpackError::NeedMore` means the
    /// block was cut mid-field; callers accumulate CONTINUATION fragments and
    /// call again with the longer block.
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<HeaderField>, HpackError> {
        let mut fields = Vec::new();
        let mut cursor = block;
        while !cursor.is_empty() {
            let (field, rest) = self.decode_next(cursor)?;
            if let Some(field) = field {
                fields.push(field);
            }
            cursor = rest;
        }
        Ok(fields)
    }

    /// Decodes one field; `None` for a dynamic table size update, which
    /// produces no header. https://httpwg.org/specs/rfc7541.html#rfc.section.6
    pub fn decode_next<'a>(
        &mut self,
        buf: &'a [u8],
    ) -> Result<(Option<HeaderField>, &'a [u8]), HpackError> {
        let first = *buf.first().ok_or(HpackError::NeedMore)?;
        if first & 0x80 != 0 {
            // indexed
            let (index, rest) = decode_integer(buf, 7)?;
            let entry = self
                .table
                .get(usize::try_from(index).map_err(|_| HpackError::InvalidIndex(index))?)
                .ok_or(HpackError::InvalidIndex(index))?;
            Ok((
                Some(HeaderField {
                    name: entry.name.clone(),
                    value: entry.value.clone(),
                    sensitive: false,
                }),
                rest,
            ))
        } else if first & 0xc0 == 0x40 {
            // literal with incremental indexing
            let (field, rest) = self.decode_literal(buf, 6, false)?;
            self.table.push(field.name.clone(), field.value.clone());
            Ok((Some(field), rest))
        } else if first & 0xe0 == 0x20 {
            // dynamic table size update
            let (size, rest) = decode_integer(buf, 5)?;
            let size = usize::try_from(size).map_err(|_| HpackError::IntegerOverflow)?;
            if size > self.size_limit {
                return Err(HpackError::SizeUpdateTooLarge(size, self.size_limit));
            }
            trace!("dynamic table resized to {size}");
            self.table.resize(size);
            Ok((None, rest))
        } else {
            // literal without indexing (0000) or never indexed (0001)
            let sensitive = first & 0x10 != 0;
            let (field, rest) = self.decode_literal(buf, 4, sensitive)?;
            Ok((Some(field), rest))
        }
    }

    fn decode_literal<'a>(
        &mut self,
        buf: &'a [u8],
        prefix_bits: u32,
        sensitive: bool,
    ) -> Result<(HeaderField, &'a [u8]), HpackError> {
        let (index, rest) = decode_integer(buf, prefix_bits)?;
        let (name, rest) = if index == 0 {
            decode_string(rest)?
        } else {
            let entry = self
                .table
                .get(usize::try_from(index).map_err(|_| HpackError::InvalidIndex(index))?)
                .ok_or(HpackError::InvalidIndex(index))?;
            (entry.name.clone(), rest)
        };
        let (value, rest) = decode_string(rest)?;
        Ok((
            HeaderField {
                name,
                value,
                sensitive,
            },
            rest,
        ))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::with_size(DEFAULT_TABLE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::hpack as their_hpack;

    fn encode_int(prefix_bits: u32, value: usize) -> Vec<u8> {
        let mut dst = BytesMut::new();
        encode_integer(&mut dst, prefix_bits, 0, value);
        dst.to_vec()
    }

    #[test]
    fn integer_examples() {
        // https://httpwg.org/specs/rfc7541.html#integer.representation.examples
        assert_eq!(encode_int(5, 10), [0b0000_1010]);
        assert_eq!(encode_int(5, 1337), [0x1f, 0x9a, 0x0a]);
        assert_eq!(encode_int(8, 42), [0x2a]);
        assert_eq!(decode_integer(&[0x1f, 0x9a, 0x0a], 5).unwrap().0, 1337);
    }

    #[test]
    fn integer_overflow_rejected() {
        let mut buf = vec![0x1f];
        buf.extend(std::iter::repeat(0xff).take(10));
        assert_eq!(
            decode_integer(&buf, 5).unwrap_err(),
            HpackError::IntegerOverflow
        );
    }

    #[test]
    fn integer_truncation_reported() {
        assert_eq!(decode_integer(&[0x1f], 5).unwrap_err(), HpackError::NeedMore);
        assert_eq!(decode_integer(&[], 5).unwrap_err(), HpackError::NeedMore);
    }

    fn fields(pairs: &[(&str, &str)]) -> Vec<(Bytes, Bytes)> {
        pairs
            .iter()
            .map(|(k, v)| (Bytes::copy_from_slice(k.as_bytes()), Bytes::copy_from_slice(v.as_bytes())))
            .collect()
    }

    /// https://httpwg.org/specs/rfc7541.html#request.examples.with.huffman.coding
    #[test]
    fn rfc_request_examples_encode() {
        let mut encoder = Encoder::default();
        let first = encoder.encode(fields(&[
            (":method", "GET"),
            (":scheme", "http"),
            (":path", "/"),
            (":authority", "www.example.com"),
        ]));
        assert_eq!(
            first.as_ref(),
            &[
                0x82, 0x86, 0x84, 0x41, 0x8c, 0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0,
                0xab, 0x90, 0xf4, 0xff
            ][..]
        );

        // second request reuses :authority out of the dynamic table
        let second = encoder.encode(fields(&[
            (":method", "GET"),
            (":scheme", "http"),
            (":path", "/"),
            (":authority", "www.example.com"),
            ("cache-control", "no-cache"),
        ]));
        assert_eq!(
            second.as_ref(),
            &[0x82, 0x86, 0x84, 0xbe, 0x58, 0x86, 0xa8, 0xeb, 0x10, 0x64, 0x9c, 0xbf][..]
        );
    }

    #[test]
    fn rfc_request_examples_decode() {
        let mut decoder = Decoder::default();
        let first = decoder
            .decode(&[
                0x82, 0x86, 0x84, 0x41, 0x8c, 0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0,
                0xab, 0x90, 0xf4, 0xff,
            ])
            .unwrap();
        assert_eq!(
            first
                .iter()
                .map(|f| (f.name.as_ref(), f.value.as_ref()))
                .collect::<Vec<_>>(),
            [
                (&b":method"[..], &b"GET"[..]),
                (&b":scheme"[..], &b"http"[..]),
                (&b":path"[..], &b"/"[..]),
                (&b":authority"[..], &b"www.example.com"[..]),
            ]
        );

        let second = decoder
            .decode(&[0x82, 0x86, 0x84, 0xbe, 0x58, 0x86, 0xa8, 0xeb, 0x10, 0x64, 0x9c, 0xbf])
            .unwrap();
        assert_eq!(second[3].value.as_ref(), b"www.example.com");
        assert_eq!(second[4].name.as_ref(), b"cache-control");
        assert_eq!(second[4].value.as_ref(), b"no-cache");
    }

    #[test]
    fn encode_against_reference_decoder() {
        let mut encoder = Encoder::default();
        let mut decoder = their_hpack::Decoder::new();

        let headers = vec![(":method", "GET"), (":path", "/"), ("x-request-id", "0017")];
        let encoded = encoder.encode(
            headers
                .iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec())),
        );
        assert_eq!(
            decoder.decode(&encoded).unwrap(),
            headers
                .into_iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn decode_against_reference_encoder() {
        let mut decoder = Decoder::default();
        let mut encoder = their_hpack::Encoder::new();

        let headers = vec![(&b":method"[..], &b"GET"[..]), (&b":path"[..], &b"/"[..])];
        let encoded = encoder.encode(headers.clone());
        assert_eq!(
            decoder
                .decode(&encoded)
                .unwrap()
                .into_iter()
                .map(|f| (f.name.to_vec(), f.value.to_vec()))
                .collect::<Vec<_>>(),
            headers
                .into_iter()
                .map(|(k, v)| (k.to_vec(), v.to_vec()))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn truncated_block_reports_need_more() {
        let mut encoder = Encoder::default();
        let block = encoder.encode(fields(&[("x-long-header", "a value that will not fit")]));
        let mut decoder = Decoder::default();
        assert_eq!(
            decoder.decode(&block[..block.len() - 3]).unwrap_err(),
            HpackError::NeedMore
        );
    }

    #[test]
    fn sensitive_fields_never_indexed() {
        let mut encoder = Encoder::default();
        let block = encoder.encode(fields(&[("authorization", "Basic dG9wOnNlY3JldA==")]));
        // never-indexed, name = static index 23 (authorization): prefix-saturated
        assert_eq!(&block[..2], &[0x1f, 0x08]);
        // encoding the same header twice must not create a table entry
        let again = encoder.encode(fields(&[("authorization", "Basic dG9wOnNlY3JldA==")]));
        assert_eq!(block, again);
    }

    #[test]
    fn size_update_bounded_by_settings() {
        let mut decoder = Decoder::with_size(4096);
        decoder.set_size_limit(100);
        // 0x3f 0xe1 0x1f => size update to 4096
        let err = decoder.decode(&[0x3f, 0xe1, 0x1f]).unwrap_err();
        assert_eq!(err, HpackError::SizeUpdateTooLarge(4096, 100));

        // an in-bounds update is fine and produces no field
        assert!(decoder.decode(&[0x20]).unwrap().is_empty());
    }

    #[test]
    fn size_update_evicts_entries() {
        let mut decoder = Decoder::default();
        let mut encoder = Encoder::default();
        let block = encoder.encode(fields(&[("x-custom", "value")]));
        decoder.decode(&block).unwrap();
        assert_eq!(decoder.table.table.len(), 1);
        decoder.decode(&[0x20]).unwrap();
        assert_eq!(decoder.table.table.len(), 0);
        assert_eq!(decoder.table.current_size, 0);
    }

    #[test]
    fn oversized_entry_clears_table() {
        let mut table = Table::new(64);
        table.push(Bytes::from_static(b"a"), Bytes::from_static(b"b"));
        assert_eq!(table.table.len(), 1);
        let big = Bytes::from(vec![b'x'; 128]);
        table.push(Bytes::from_static(b"name"), big);
        assert_eq!(table.table.len(), 0);
        assert_eq!(table.current_size, 0);
    }

    #[test]
    fn eviction_is_fifo() {
        // entries are 33 bytes each ("a"/"" + 32); cap at two of them
        let mut table = Table::new(67);
        table.push(Bytes::from_static(b"a"), Bytes::from_static(b""));
        table.push(Bytes::from_static(b"b"), Bytes::from_static(b""));
        table.push(Bytes::from_static(b"c"), Bytes::from_static(b""));
        let names: Vec<_> = table.table.iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec![Bytes::from_static(b"c"), Bytes::from_static(b"b")]);
    }

    #[test]
    fn dynamic_entries_index_from_62() {
        let mut decoder = Decoder::default();
        let mut encoder = Encoder::default();
        let block = encoder.encode(fields(&[("x-first", "1"), ("x-second", "2")]));
        decoder.decode(&block).unwrap();
        // most recently inserted sits at 62
        assert_eq!(decoder.table.get(62).unwrap().name.as_ref(), b"x-second");
        assert_eq!(decoder.table.get(63).unwrap().name.as_ref(), b"x-first");
        assert!(decoder.table.get(64).is_none());
    }
}
