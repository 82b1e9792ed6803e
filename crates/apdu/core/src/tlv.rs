//! BER-TLV codec
//!
//! Records are either leaves carrying raw bytes or containers carrying an ordered list of
//! child records. Parsing only accepts minimal encodings (shortest length form, no padded
//! multi-byte tags), which keeps `encode(parse(b)) == b` for every accepted input. Records built
//! by hand go through the same checks, so `parse(encode(r)) == r` holds for them too.
//!
//! Containers nest at most [`MAX_DEPTH`] levels deep; deeper input is rejected instead of
//! recursing without bound.

use bytes::{BufMut, Bytes, BytesMut};

/// Bit of the first tag byte flagging a constructed record
pub const CONSTRUCTED_BIT: u8 = 0x20;

/// Low five bits of the first tag byte announcing a multi-byte tag
const MULTI_BYTE_TAG: u8 = 0x1F;

/// Longest length-of-length accepted
const MAX_LENGTH_BYTES: usize = 4;

/// Longest tag that fits the `u64` representation
const MAX_TAG_BYTES: usize = 8;

/// Deepest nesting of containers accepted by the parser and the constructors
pub const MAX_DEPTH: usize = 32;

/// Malformed BER-TLV input
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TlvError {
    /// Input ended inside the tag
    #[error("Truncated tag")]
    TruncatedTag,

    /// Input ended inside the length field, or the length field is not minimally encoded
    #[error("Truncated or malformed length")]
    TruncatedLength,

    /// Fewer value bytes than the length declares
    #[error("Truncated value: expected {expected} bytes, {available} available")]
    TruncatedValue {
        /// Declared value length
        expected: usize,
        /// Bytes left in the input
        available: usize,
    },

    /// Length-of-length above four bytes, or the indefinite form
    #[error("Unsupported length encoding with {0} length bytes")]
    UnsupportedLength(usize),

    /// Tag longer than eight bytes or with a non-minimal encoding
    #[error("Tag too long or not minimally encoded")]
    TagTooLong,

    /// Bytes left over after a single record
    #[error("{0} trailing bytes after record")]
    TrailingData(usize),

    /// Containers nested deeper than [`MAX_DEPTH`]
    #[error("Records nested deeper than {0} levels")]
    NestingTooDeep(usize),

    /// Tag value that is not a complete, minimal BER tag encoding
    #[error("Invalid tag {0:#x}")]
    InvalidTag(u64),

    /// Primitive tag given children, or constructed tag given raw bytes
    #[error("Tag {0:#x} does not match the record kind")]
    TagKindMismatch(u64),
}

/// Payload of a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlvValue {
    /// Raw value bytes
    Primitive(Bytes),
    /// Nested records, in order
    Constructed(Vec<TlvRecord>),
}

/// A single BER-TLV record
///
/// The tag keeps its wire bytes packed big-endian into a `u64`, so `0x5F4C` is the two-byte
/// tag `5F 4C`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvRecord {
    tag: u64,
    value: TlvValue,
}

impl TlvRecord {
    /// Create a leaf record
    ///
    /// `tag` must be a valid primitive tag.
    pub fn new(tag: u64, value: impl Into<Bytes>) -> Result<Self, TlvError> {
        check_tag(tag)?;
        if is_constructed_tag(tag) {
            return Err(TlvError::TagKindMismatch(tag));
        }
        Ok(Self {
            tag,
            value: TlvValue::Primitive(value.into()),
        })
    }

    /// Create a container record
    ///
    /// `tag` must be a valid constructed tag, and the result may not nest deeper than
    /// [`MAX_DEPTH`].
    pub fn constructed(tag: u64, children: Vec<Self>) -> Result<Self, TlvError> {
        check_tag(tag)?;
        if !is_constructed_tag(tag) {
            return Err(TlvError::TagKindMismatch(tag));
        }
        let record = Self {
            tag,
            value: TlvValue::Constructed(children),
        };
        if record.nesting() > MAX_DEPTH {
            return Err(TlvError::NestingTooDeep(MAX_DEPTH));
        }
        Ok(record)
    }

    /// Tag as packed wire bytes
    pub const fn tag(&self) -> u64 {
        self.tag
    }

    /// The record payload
    pub const fn payload(&self) -> &TlvValue {
        &self.value
    }

    /// Encoded value bytes, for leaves and containers alike
    pub fn value(&self) -> Bytes {
        match &self.value {
            TlvValue::Primitive(bytes) => bytes.clone(),
            TlvValue::Constructed(children) => {
                let mut buf = BytesMut::with_capacity(self.value_len());
                for child in children {
                    child.write_to(&mut buf);
                }
                buf.freeze()
            }
        }
    }

    /// Child records, empty for leaves
    pub fn children(&self) -> &[Self] {
        match &self.value {
            TlvValue::Primitive(_) => &[],
            TlvValue::Constructed(children) => children,
        }
    }

    /// Whether this record is a container
    pub const fn is_constructed(&self) -> bool {
        matches!(self.value, TlvValue::Constructed(_))
    }

    /// Total encoded length: tag, length field and value
    pub fn encoded_len(&self) -> usize {
        let value_len = self.value_len();
        tag_len(self.tag) + length_len(value_len) + value_len
    }

    /// Encode this record
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf);
        buf.freeze()
    }

    /// Levels of containers from this record down, zero for leaves
    fn nesting(&self) -> usize {
        match &self.value {
            TlvValue::Primitive(_) => 0,
            TlvValue::Constructed(children) => {
                1 + children.iter().map(Self::nesting).max().unwrap_or(0)
            }
        }
    }

    fn value_len(&self) -> usize {
        match &self.value {
            TlvValue::Primitive(bytes) => bytes.len(),
            TlvValue::Constructed(children) => children.iter().map(Self::encoded_len).sum(),
        }
    }

    fn write_to(&self, buf: &mut BytesMut) {
        let tag_bytes = self.tag.to_be_bytes();
        buf.put_slice(&tag_bytes[MAX_TAG_BYTES - tag_len(self.tag)..]);
        put_length(buf, self.value_len());
        match &self.value {
            TlvValue::Primitive(bytes) => buf.put_slice(bytes),
            TlvValue::Constructed(children) => {
                for child in children {
                    child.write_to(buf);
                }
            }
        }
    }
}

/// Encode a record
pub fn encode(record: &TlvRecord) -> Bytes {
    record.to_bytes()
}

/// Encode consecutive sibling records
pub fn encode_sequence(records: &[TlvRecord]) -> Bytes {
    let mut buf = BytesMut::with_capacity(records.iter().map(TlvRecord::encoded_len).sum());
    for record in records {
        record.write_to(&mut buf);
    }
    buf.freeze()
}

/// Parse exactly one record; trailing bytes are an error
pub fn parse(data: &[u8]) -> Result<TlvRecord, TlvError> {
    let (record, rest) = parse_prefix(data)?;
    if !rest.is_empty() {
        return Err(TlvError::TrailingData(rest.len()));
    }
    Ok(record)
}

/// Parse one record from the start of `data`, returning it with the unread remainder
pub fn parse_prefix(data: &[u8]) -> Result<(TlvRecord, &[u8]), TlvError> {
    parse_at(data, 0)
}

/// Parse the whole buffer as consecutive sibling records
pub fn parse_sequence(data: &[u8]) -> Result<Vec<TlvRecord>, TlvError> {
    parse_sequence_at(data, 0)
}

fn parse_at(data: &[u8], depth: usize) -> Result<(TlvRecord, &[u8]), TlvError> {
    let (tag, rest) = read_tag(data)?;
    let (len, rest) = read_length(rest)?;
    if rest.len() < len {
        return Err(TlvError::TruncatedValue {
            expected: len,
            available: rest.len(),
        });
    }
    let (value, rest) = rest.split_at(len);

    let value = if is_constructed_tag(tag) {
        if depth >= MAX_DEPTH {
            return Err(TlvError::NestingTooDeep(MAX_DEPTH));
        }
        // A container whose body does not parse is kept as an opaque leaf
        match parse_sequence_at(value, depth + 1) {
            Ok(children) => TlvValue::Constructed(children),
            Err(e @ TlvError::NestingTooDeep(_)) => return Err(e),
            Err(_) => TlvValue::Primitive(Bytes::copy_from_slice(value)),
        }
    } else {
        TlvValue::Primitive(Bytes::copy_from_slice(value))
    };

    Ok((TlvRecord { tag, value }, rest))
}

fn parse_sequence_at(mut data: &[u8], depth: usize) -> Result<Vec<TlvRecord>, TlvError> {
    let mut records = Vec::new();
    while !data.is_empty() {
        let (record, rest) = parse_at(data, depth)?;
        records.push(record);
        data = rest;
    }
    Ok(records)
}

/// First record with the given tag among `records`, not descending into children
pub fn find(records: &[TlvRecord], tag: u64) -> Option<&TlvRecord> {
    records.iter().find(|r| r.tag == tag)
}

const fn is_constructed_tag(tag: u64) -> bool {
    let first = (tag >> (8 * (tag_len(tag) - 1))) as u8;
    first & CONSTRUCTED_BIT != 0
}

/// Accept `tag` only if its packed bytes read back as exactly that tag
fn check_tag(tag: u64) -> Result<(), TlvError> {
    let bytes = tag.to_be_bytes();
    match read_tag(&bytes[MAX_TAG_BYTES - tag_len(tag)..]) {
        Ok((read, [])) if read == tag => Ok(()),
        _ => Err(TlvError::InvalidTag(tag)),
    }
}

fn read_tag(data: &[u8]) -> Result<(u64, &[u8]), TlvError> {
    let (&first, mut rest) = data.split_first().ok_or(TlvError::TruncatedTag)?;
    let mut tag = first as u64;

    if first & MULTI_BYTE_TAG == MULTI_BYTE_TAG {
        let mut count = 1;
        loop {
            let (&byte, tail) = rest.split_first().ok_or(TlvError::TruncatedTag)?;
            // Leading 0x80 subsequent byte would pad the tag number
            if count == 1 && byte == 0x80 {
                return Err(TlvError::TagTooLong);
            }
            count += 1;
            if count > MAX_TAG_BYTES {
                return Err(TlvError::TagTooLong);
            }
            tag = (tag << 8) | byte as u64;
            rest = tail;
            if byte & 0x80 == 0 {
                break;
            }
        }
    }

    Ok((tag, rest))
}

fn read_length(data: &[u8]) -> Result<(usize, &[u8]), TlvError> {
    let (&first, rest) = data.split_first().ok_or(TlvError::TruncatedLength)?;
    if first & 0x80 == 0 {
        return Ok((first as usize, rest));
    }

    let count = (first & 0x7F) as usize;
    if count == 0 || count > MAX_LENGTH_BYTES {
        return Err(TlvError::UnsupportedLength(count));
    }
    if rest.len() < count {
        return Err(TlvError::TruncatedLength);
    }

    let (len_bytes, rest) = rest.split_at(count);
    let len = len_bytes
        .iter()
        .fold(0usize, |acc, &b| (acc << 8) | b as usize);
    if length_len(len) != 1 + count {
        return Err(TlvError::TruncatedLength);
    }

    Ok((len, rest))
}

const fn tag_len(tag: u64) -> usize {
    let bits = 64 - tag.leading_zeros() as usize;
    if bits == 0 { 1 } else { bits.div_ceil(8) }
}

const fn length_len(len: usize) -> usize {
    match len {
        0..=0x7F => 1,
        0x80..=0xFF => 2,
        0x100..=0xFFFF => 3,
        0x1_0000..=0xFF_FFFF => 4,
        _ => 5,
    }
}

fn put_length(buf: &mut BytesMut, len: usize) {
    let size_bytes = length_len(len) - 1;
    if size_bytes == 0 {
        buf.put_u8(len as u8);
    } else {
        buf.put_u8(0x80 | size_bytes as u8);
        buf.put_slice(&(len as u32).to_be_bytes()[4 - size_bytes..]);
    }
}
