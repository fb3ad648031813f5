// BER packet tree: the TLV structure every LDAP message is built from.
// Packets own their children; encoding is recursive and lengths are always definite.

use crate::error::{LdapError, Result};
use bytes::{Bytes, BytesMut};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};

// Universal tag numbers used by LDAP
pub const TAG_BOOLEAN: u32 = 0x01;
pub const TAG_INTEGER: u32 = 0x02;
pub const TAG_BIT_STRING: u32 = 0x03;
pub const TAG_OCTET_STRING: u32 = 0x04;
pub const TAG_NULL: u32 = 0x05;
pub const TAG_OBJECT_IDENTIFIER: u32 = 0x06;
pub const TAG_ENUMERATED: u32 = 0x0A;
pub const TAG_SEQUENCE: u32 = 0x10;
pub const TAG_SET: u32 = 0x11;

/// Nesting limit for decoding; LDAP messages are shallow, filters are the deepest part.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Class {
    Universal = 0x00,
    Application = 0x40,
    Context = 0x80,
    Private = 0xC0,
}

impl Class {
    fn from_identifier(byte: u8) -> Self {
        match byte & 0xC0 {
            0x00 => Class::Universal,
            0x40 => Class::Application,
            0x80 => Class::Context,
            _ => Class::Private,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Class::Universal => "Universal",
            Class::Application => "Application",
            Class::Context => "Context",
            Class::Private => "Private",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Primitive = 0x00,
    Constructed = 0x20,
}

/// Typed content for a primitive packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    Boolean(bool),
    Bytes(Vec<u8>),
}

impl Value {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            Value::Integer(v) => encode_integer(v),
            Value::Boolean(b) => vec![if b { 0xFF } else { 0x00 }],
            Value::Bytes(b) => b,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

/// One node of a BER tree.
///
/// Primitive nodes carry their content in `data`; constructed nodes carry
/// `children` and no data. Equality compares the tree and ignores
/// `description`.
#[derive(Debug, Clone)]
pub struct Packet {
    pub class: Class,
    pub encoding: Encoding,
    pub tag: u32,
    pub data: Vec<u8>,
    pub children: Vec<Packet>,
    pub description: String,
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.class == other.class
            && self.encoding == other.encoding
            && self.tag == other.tag
            && self.data == other.data
            && self.children == other.children
    }
}

impl Eq for Packet {}

impl Packet {
    pub fn new(class: Class, encoding: Encoding, tag: u32, description: impl Into<String>) -> Self {
        Self {
            class,
            encoding,
            tag,
            data: Vec::new(),
            children: Vec::new(),
            description: description.into(),
        }
    }

    /// Build a packet from class/encoding/tag and an optional value.
    /// The value is only stored for primitive packets.
    pub fn encode(
        class: Class,
        encoding: Encoding,
        tag: u32,
        value: Option<Value>,
        description: impl Into<String>,
    ) -> Self {
        let mut packet = Self::new(class, encoding, tag, description);
        if encoding == Encoding::Primitive {
            if let Some(value) = value {
                packet.data = value.into_bytes();
            }
        }
        packet
    }

    pub fn primitive(class: Class, tag: u32, data: impl AsRef<[u8]>, description: impl Into<String>) -> Self {
        let mut packet = Self::new(class, Encoding::Primitive, tag, description);
        packet.data = data.as_ref().to_vec();
        packet
    }

    pub fn constructed(class: Class, tag: u32, description: impl Into<String>) -> Self {
        Self::new(class, Encoding::Constructed, tag, description)
    }

    pub fn context_primitive(tag: u32, data: impl AsRef<[u8]>, description: impl Into<String>) -> Self {
        Self::primitive(Class::Context, tag, data, description)
    }

    /// Constructed application-class packet, the shape of most protocol ops.
    pub fn application(tag: u32, description: impl Into<String>) -> Self {
        Self::constructed(Class::Application, tag, description)
    }

    pub fn sequence(description: impl Into<String>) -> Self {
        Self::constructed(Class::Universal, TAG_SEQUENCE, description)
    }

    pub fn set(description: impl Into<String>) -> Self {
        Self::constructed(Class::Universal, TAG_SET, description)
    }

    pub fn integer(value: i64, description: impl Into<String>) -> Self {
        Self::encode(Class::Universal, Encoding::Primitive, TAG_INTEGER, Some(Value::Integer(value)), description)
    }

    pub fn enumerated(value: i64, description: impl Into<String>) -> Self {
        Self::encode(Class::Universal, Encoding::Primitive, TAG_ENUMERATED, Some(Value::Integer(value)), description)
    }

    pub fn boolean(value: bool, description: impl Into<String>) -> Self {
        Self::encode(Class::Universal, Encoding::Primitive, TAG_BOOLEAN, Some(Value::Boolean(value)), description)
    }

    pub fn octet_string(value: impl AsRef<[u8]>, description: impl Into<String>) -> Self {
        Self::primitive(Class::Universal, TAG_OCTET_STRING, value, description)
    }

    pub fn null(description: impl Into<String>) -> Self {
        Self::new(Class::Universal, Encoding::Primitive, TAG_NULL, description)
    }

    /// Append a child, taking ownership of it.
    pub fn append_child(&mut self, child: Packet) {
        self.children.push(child);
    }

    pub fn with_child(mut self, child: Packet) -> Self {
        self.append_child(child);
        self
    }

    pub fn child(&self, index: usize) -> Option<&Packet> {
        self.children.get(index)
    }

    pub fn is(&self, class: Class, tag: u32) -> bool {
        self.class == class && self.tag == tag
    }

    pub fn is_constructed(&self) -> bool {
        self.encoding == Encoding::Constructed
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_integer(&self) -> Result<i64> {
        if self.is_constructed() {
            return Err(LdapError::protocol(format!("expected integer, got constructed tag {}", self.tag)));
        }
        parse_integer(&self.data)
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self.data.as_slice() {
            [b] => Ok(*b != 0),
            other => Err(LdapError::protocol(format!("boolean must be 1 byte, got {}", other.len()))),
        }
    }

    pub fn as_string(&self) -> Result<String> {
        String::from_utf8(self.data.clone())
            .map_err(|_| LdapError::protocol(format!("invalid UTF-8 in {}", self.describe_tag())))
    }

    /// Length of the serialized TLV, header included.
    pub fn encoded_len(&self) -> usize {
        let content = self.content_len();
        identifier_len(self.tag) + length_len(content) + content
    }

    fn content_len(&self) -> usize {
        match self.encoding {
            Encoding::Primitive => self.data.len(),
            Encoding::Constructed => self.children.iter().map(Packet::encoded_len).sum(),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        write_identifier(out, self.class, self.encoding, self.tag);
        write_length(out, self.content_len());
        match self.encoding {
            Encoding::Primitive => out.extend_from_slice(&self.data),
            Encoding::Constructed => {
                for child in &self.children {
                    child.write_to(out);
                }
            }
        }
    }

    fn describe_tag(&self) -> String {
        format!("{}({})", self.class.name(), self.tag)
    }

    fn fmt_tree(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let kind = match (self.class, self.tag) {
            (Class::Universal, TAG_BOOLEAN) => "Boolean".to_string(),
            (Class::Universal, TAG_INTEGER) => "Integer".to_string(),
            (Class::Universal, TAG_OCTET_STRING) => "Octet String".to_string(),
            (Class::Universal, TAG_NULL) => "NULL".to_string(),
            (Class::Universal, TAG_ENUMERATED) => "Enumerated".to_string(),
            (Class::Universal, TAG_SEQUENCE) => "Sequence".to_string(),
            (Class::Universal, TAG_SET) => "Set".to_string(),
            _ => self.describe_tag(),
        };
        write!(f, "{:width$}{} len={}", "", kind, self.content_len(), width = indent * 2)?;
        if !self.description.is_empty() {
            write!(f, " \"{}\"", self.description)?;
        }
        if self.encoding == Encoding::Primitive {
            match (self.class, self.tag) {
                (Class::Universal, TAG_INTEGER) | (Class::Universal, TAG_ENUMERATED) => {
                    if let Ok(v) = parse_integer(&self.data) {
                        write!(f, ": {}", v)?;
                    }
                }
                (Class::Universal, TAG_BOOLEAN) => write!(f, ": {}", self.data.first().is_some_and(|b| *b != 0))?,
                _ => match std::str::from_utf8(&self.data) {
                    Ok(s) if !s.chars().any(char::is_control) => write!(f, ": {:?}", s)?,
                    _ => write!(f, ": {}", hex_preview(&self.data))?,
                },
            }
        }
        writeln!(f)?;
        for child in &self.children {
            child.fmt_tree(f, indent + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_tree(f, 0)
    }
}

pub(crate) fn hex_preview(data: &[u8]) -> String {
    data.iter()
        .take(64)
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Minimal two's-complement big-endian encoding.
pub fn encode_integer(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let (b, next) = (bytes[start], bytes[start + 1]);
        let redundant = (b == 0x00 && next & 0x80 == 0) || (b == 0xFF && next & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

pub fn parse_integer(data: &[u8]) -> Result<i64> {
    if data.is_empty() {
        return Err(LdapError::protocol("integer with empty content"));
    }
    if data.len() > 8 {
        return Err(LdapError::protocol(format!("integer too large: {} bytes", data.len())));
    }
    let mut value: i64 = if data[0] & 0x80 != 0 { -1 } else { 0 };
    for &byte in data {
        value = (value << 8) | byte as i64;
    }
    Ok(value)
}

fn identifier_len(tag: u32) -> usize {
    if tag < 0x1F {
        1
    } else {
        let mut n = 1;
        let mut t = tag;
        while t > 0 {
            n += 1;
            t >>= 7;
        }
        n
    }
}

fn write_identifier(out: &mut Vec<u8>, class: Class, encoding: Encoding, tag: u32) {
    let first = class as u8 | encoding as u8;
    if tag < 0x1F {
        out.push(first | tag as u8);
        return;
    }
    out.push(first | 0x1F);
    let mut groups = Vec::new();
    let mut t = tag;
    while t > 0 {
        groups.push((t & 0x7F) as u8);
        t >>= 7;
    }
    for (i, group) in groups.iter().rev().enumerate() {
        let more = i + 1 < groups.len();
        out.push(if more { group | 0x80 } else { *group });
    }
}

fn length_len(len: usize) -> usize {
    if len < 128 {
        1
    } else {
        1 + (usize::BITS - len.leading_zeros()).div_ceil(8) as usize
    }
}

fn write_length(out: &mut Vec<u8>, length: usize) {
    if length < 128 {
        out.push(length as u8);
        return;
    }
    let mut bytes = Vec::new();
    let mut len = length;
    while len > 0 {
        bytes.push((len & 0xFF) as u8);
        len >>= 8;
    }
    bytes.reverse();
    out.push(0x80 | bytes.len() as u8);
    out.extend_from_slice(&bytes);
}

struct Header {
    class: Class,
    encoding: Encoding,
    tag: u32,
    header_len: usize,
    content_len: usize,
}

impl Header {
    fn total_len(&self) -> usize {
        self.header_len + self.content_len
    }
}

/// Parse identifier and length octets. `Ok(None)` means more bytes are needed.
fn parse_header(buf: &[u8]) -> Result<Option<Header>> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    let class = Class::from_identifier(first);
    let encoding = if first & 0x20 != 0 {
        Encoding::Constructed
    } else {
        Encoding::Primitive
    };
    let mut pos = 1;
    let mut tag = (first & 0x1F) as u32;
    if tag == 0x1F {
        tag = 0;
        loop {
            let Some(&b) = buf.get(pos) else {
                return Ok(None);
            };
            pos += 1;
            if pos > 5 {
                return Err(LdapError::protocol("tag number too large"));
            }
            tag = (tag << 7) | (b & 0x7F) as u32;
            if b & 0x80 == 0 {
                break;
            }
        }
    }
    let Some(&len_byte) = buf.get(pos) else {
        return Ok(None);
    };
    pos += 1;
    let content_len = if len_byte & 0x80 == 0 {
        len_byte as usize
    } else {
        let length_bytes = (len_byte & 0x7F) as usize;
        if length_bytes == 0 {
            return Err(LdapError::protocol("indefinite length not supported"));
        }
        if length_bytes > 4 {
            return Err(LdapError::protocol(format!("length too large: {} bytes", length_bytes)));
        }
        if buf.len() < pos + length_bytes {
            return Ok(None);
        }
        let mut length = 0usize;
        for &b in &buf[pos..pos + length_bytes] {
            length = (length << 8) | b as usize;
        }
        pos += length_bytes;
        length
    };
    Ok(Some(Header {
        class,
        encoding,
        tag,
        header_len: pos,
        content_len,
    }))
}

/// Universal types whose encoding bit is fixed by X.690 (and RFC 4511 5.1 for OCTET STRING).
fn check_encoding(header: &Header) -> Result<()> {
    if header.class != Class::Universal {
        return Ok(());
    }
    let expected = match header.tag {
        TAG_SEQUENCE | TAG_SET => Encoding::Constructed,
        TAG_BOOLEAN | TAG_INTEGER | TAG_ENUMERATED | TAG_NULL | TAG_OBJECT_IDENTIFIER | TAG_OCTET_STRING => {
            Encoding::Primitive
        }
        _ => return Ok(()),
    };
    if header.encoding != expected {
        return Err(LdapError::protocol(format!(
            "universal tag {} must be {:?}, got {:?}",
            header.tag, expected, header.encoding
        )));
    }
    match header.tag {
        TAG_BOOLEAN if header.content_len != 1 => Err(LdapError::protocol(format!(
            "boolean must be 1 byte, got {}",
            header.content_len
        ))),
        TAG_NULL if header.content_len != 0 => Err(LdapError::protocol("NULL with non-empty content")),
        TAG_INTEGER | TAG_ENUMERATED if header.content_len == 0 || header.content_len > 8 => Err(
            LdapError::protocol(format!("integer length {} out of range", header.content_len)),
        ),
        _ => Ok(()),
    }
}

fn decode_node(buf: &[u8], depth: usize) -> Result<(Packet, usize)> {
    if depth > MAX_DEPTH {
        return Err(LdapError::protocol(format!("nesting deeper than {}", MAX_DEPTH)));
    }
    let header = parse_header(buf)?.ok_or_else(|| LdapError::protocol("truncated header"))?;
    if header.total_len() > buf.len() {
        return Err(LdapError::protocol(format!(
            "length {} overruns buffer ({} bytes available)",
            header.content_len,
            buf.len() - header.header_len
        )));
    }
    check_encoding(&header)?;
    let content = &buf[header.header_len..header.total_len()];
    let mut packet = Packet::new(header.class, header.encoding, header.tag, String::new());
    match header.encoding {
        Encoding::Primitive => packet.data = content.to_vec(),
        Encoding::Constructed => {
            let mut offset = 0;
            while offset < content.len() {
                let rest = &content[offset..];
                let child = parse_header(rest)?.ok_or_else(|| {
                    LdapError::protocol(format!(
                        "constructed length mismatch: truncated child header in tag {}",
                        header.tag
                    ))
                })?;
                if child.total_len() > rest.len() {
                    return Err(LdapError::protocol(format!(
                        "constructed length mismatch: child of {} bytes exceeds {} remaining in tag {}",
                        child.total_len(),
                        rest.len(),
                        header.tag
                    )));
                }
                let (node, used) = decode_node(rest, depth + 1)?;
                packet.children.push(node);
                offset += used;
            }
        }
    }
    Ok((packet, header.total_len()))
}

/// Decode the first TLV of `buf`, returning it with the number of bytes consumed.
pub fn decode_prefix(buf: &[u8]) -> Result<(Packet, usize)> {
    decode_node(buf, 0)
}

/// Decode exactly one TLV spanning the whole buffer.
pub fn decode(buf: &[u8]) -> Result<Packet> {
    let (packet, used) = decode_prefix(buf)?;
    if used != buf.len() {
        return Err(LdapError::protocol(format!(
            "{} trailing bytes after packet",
            buf.len() - used
        )));
    }
    Ok(packet)
}

/// Total size of the first TLV in `buf`, or `None` if the header is incomplete.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>> {
    Ok(parse_header(buf)?.map(|h| h.total_len()))
}

/// Best-effort message ID of an LDAPMessage that failed to decode as a whole.
pub fn message_id_hint(frame: &[u8]) -> Option<i32> {
    let outer = parse_header(frame).ok()??;
    if outer.encoding != Encoding::Constructed {
        return None;
    }
    let rest = &frame[outer.header_len..];
    let id = parse_header(rest).ok()??;
    if id.class != Class::Universal || id.tag != TAG_INTEGER || id.total_len() > rest.len() {
        return None;
    }
    let value = parse_integer(&rest[id.header_len..id.total_len()]).ok()?;
    i32::try_from(value).ok()
}

/// Read one complete TLV frame. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_size: usize,
) -> Result<Option<Bytes>> {
    loop {
        if let Some(total) = frame_len(buf)? {
            if total > max_size {
                return Err(LdapError::protocol(format!(
                    "message of {} bytes exceeds limit of {}",
                    total, max_size
                )));
            }
            if buf.len() >= total {
                return Ok(Some(buf.split_to(total).freeze()));
            }
            buf.reserve(total - buf.len());
        }
        let n = reader.read_buf(buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(LdapError::Network(format!(
                "connection closed mid-message ({} bytes buffered)",
                buf.len()
            )));
        }
    }
}
