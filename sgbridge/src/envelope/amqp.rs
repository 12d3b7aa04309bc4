//! AMQP 1.0 message sections.
//!
//! ## Wire Format
//!
//! A message is a run of described sections. Every section is the byte `0x00`,
//! a descriptor (a `ulong` code or its symbolic name) and one value. All
//! multi-byte integers are big-endian.
//!
//! | Code | Section | Treatment |
//! |------|---------|-----------|
//! | `0x70` | header | skipped |
//! | `0x71` | delivery-annotations | skipped |
//! | `0x72` | message-annotations | skipped |
//! | `0x73` | properties | skipped |
//! | `0x74` | application-properties | skipped |
//! | `0x75` | data | body: binary, consecutive sections concatenated |
//! | `0x76` | amqp-sequence | body without bytes |
//! | `0x77` | amqp-value | body: bytes of a `binary`, `string` or `symbol` |
//! | `0x78` | footer | skipped |
//!
//! Skipped sections are walked structurally: every fixed-width, variable-width,
//! compound and array constructor is understood well enough to step over it.

use thiserror::Error;

use super::EnvelopeDecoder;

/// Descriptor constructor that starts every section.
const DESCRIBED: u8 = 0x00;

/// Described values may nest descriptors; real messages use one level.
const MAX_DESCRIPTOR_DEPTH: usize = 4;

mod code {
    pub const NULL: u8 = 0x40;
    pub const TRUE: u8 = 0x41;
    pub const FALSE: u8 = 0x42;
    pub const ULONG_0: u8 = 0x44;
    pub const SMALL_ULONG: u8 = 0x53;
    pub const ULONG: u8 = 0x80;
    pub const VBIN8: u8 = 0xa0;
    pub const STR8: u8 = 0xa1;
    pub const SYM8: u8 = 0xa3;
    pub const VBIN32: u8 = 0xb0;
    pub const STR32: u8 = 0xb1;
    pub const SYM32: u8 = 0xb3;
    pub const LIST8: u8 = 0xc0;
    pub const MAP8: u8 = 0xc1;
    pub const LIST32: u8 = 0xd0;
    pub const MAP32: u8 = 0xd1;
}

/// Errors while decoding a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The buffer ended inside a value.
    #[error("truncated at offset {offset}: need {need} more bytes")]
    Truncated { offset: usize, need: usize },
    /// A section did not start with the descriptor constructor.
    #[error("expected described section at offset {offset}, found 0x{found:02x}")]
    NotDescribed { offset: usize, found: u8 },
    /// The constructor byte is not an AMQP type code.
    #[error("invalid constructor 0x{code:02x} at offset {offset}")]
    InvalidConstructor { offset: usize, code: u8 },
    /// The descriptor names no message section.
    #[error("unknown section descriptor {0}")]
    UnknownSection(String),
    /// A data section body expected `binary`.
    #[error("data section holds 0x{0:02x}, expected binary")]
    DataNotBinary(u8),
    /// Body sections of different kinds, or more than one `amqp-value`.
    #[error("message has conflicting body sections")]
    ConflictingBody,
    /// Descriptors nested beyond what any sender produces.
    #[error("descriptor nesting too deep")]
    NestingTooDeep,
}

/// Message section kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Header,
    DeliveryAnnotations,
    MessageAnnotations,
    Properties,
    ApplicationProperties,
    Data,
    AmqpSequence,
    AmqpValue,
    Footer,
}

impl Section {
    const fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            0x70 => Self::Header,
            0x71 => Self::DeliveryAnnotations,
            0x72 => Self::MessageAnnotations,
            0x73 => Self::Properties,
            0x74 => Self::ApplicationProperties,
            0x75 => Self::Data,
            0x76 => Self::AmqpSequence,
            0x77 => Self::AmqpValue,
            0x78 => Self::Footer,
            _ => return None,
        })
    }

    fn from_symbol(name: &[u8]) -> Option<Self> {
        Some(match name {
            b"amqp:header:list" => Self::Header,
            b"amqp:delivery-annotations:map" => Self::DeliveryAnnotations,
            b"amqp:message-annotations:map" => Self::MessageAnnotations,
            b"amqp:properties:list" => Self::Properties,
            b"amqp:application-properties:map" => Self::ApplicationProperties,
            b"amqp:data:binary" => Self::Data,
            b"amqp:amqp-sequence:list" => Self::AmqpSequence,
            b"amqp:amqp-value:*" => Self::AmqpValue,
            b"amqp:footer:map" => Self::Footer,
            _ => return None,
        })
    }

    const fn code(self) -> u8 {
        match self {
            Self::Header => 0x70,
            Self::DeliveryAnnotations => 0x71,
            Self::MessageAnnotations => 0x72,
            Self::Properties => 0x73,
            Self::ApplicationProperties => 0x74,
            Self::Data => 0x75,
            Self::AmqpSequence => 0x76,
            Self::AmqpValue => 0x77,
            Self::Footer => 0x78,
        }
    }
}

/// Cursor over an encoded message.
struct Reader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> Reader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    const fn is_empty(&self) -> bool {
        self.cursor >= self.buf.len()
    }

    fn take_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let remaining = self.buf.len() - self.cursor;
        if len > remaining {
            return Err(DecodeError::Truncated {
                offset: self.cursor,
                need: len - remaining,
            });
        }
        let slice = &self.buf[self.cursor..self.cursor + len];
        self.cursor += len;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take_bytes(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32, DecodeError> {
        let mut arr = [0u8; 4];
        arr.copy_from_slice(self.take_bytes(4)?);
        Ok(u32::from_be_bytes(arr))
    }

    fn take_u64(&mut self) -> Result<u64, DecodeError> {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(self.take_bytes(8)?);
        Ok(u64::from_be_bytes(arr))
    }

    /// Reads a constructor byte, remembering where it was.
    fn take_constructor(&mut self) -> Result<(usize, u8), DecodeError> {
        let offset = self.cursor;
        Ok((offset, self.take_u8()?))
    }

    /// Reads the length prefix of a variable-width or compound encoding.
    fn take_len(&mut self, wide: bool) -> Result<usize, DecodeError> {
        if wide {
            Ok(self.take_u32()? as usize)
        } else {
            Ok(usize::from(self.take_u8()?))
        }
    }

    /// Steps over one complete value, descriptor included.
    fn skip_value(&mut self, depth: usize) -> Result<(), DecodeError> {
        let (offset, constructor) = self.take_constructor()?;
        if constructor == DESCRIBED {
            if depth >= MAX_DESCRIPTOR_DEPTH {
                return Err(DecodeError::NestingTooDeep);
            }
            self.skip_value(depth + 1)?;
            return self.skip_value(depth + 1);
        }
        self.skip_encoded(offset, constructor)
    }

    /// Steps over the encoding that follows a primitive constructor.
    fn skip_encoded(&mut self, offset: usize, constructor: u8) -> Result<(), DecodeError> {
        let width = match constructor {
            0x40..=0x45 => 0,
            0x50..=0x56 => 1,
            0x60 | 0x61 => 2,
            0x70..=0x74 => 4,
            0x80..=0x84 => 8,
            0x94 | 0x98 => 16,
            0xa0 | 0xa1 | 0xa3 | 0xc0 | 0xc1 | 0xe0 => self.take_len(false)?,
            0xb0 | 0xb1 | 0xb3 | 0xd0 | 0xd1 | 0xf0 => self.take_len(true)?,
            code => return Err(DecodeError::InvalidConstructor { offset, code }),
        };
        self.take_bytes(width)?;
        Ok(())
    }

    /// Reads a section descriptor.
    fn take_section(&mut self) -> Result<Section, DecodeError> {
        let (offset, constructor) = self.take_constructor()?;
        match constructor {
            code::SMALL_ULONG => {
                let c = u64::from(self.take_u8()?);
                Section::from_code(c).ok_or_else(|| DecodeError::UnknownSection(format!("0x{c:x}")))
            }
            code::ULONG => {
                let c = self.take_u64()?;
                Section::from_code(c).ok_or_else(|| DecodeError::UnknownSection(format!("0x{c:x}")))
            }
            code::ULONG_0 => Err(DecodeError::UnknownSection("0x0".into())),
            code::SYM8 | code::SYM32 => {
                let len = self.take_len(constructor == code::SYM32)?;
                let name = self.take_bytes(len)?;
                Section::from_symbol(name).ok_or_else(|| {
                    DecodeError::UnknownSection(String::from_utf8_lossy(name).into_owned())
                })
            }
            code => Err(DecodeError::InvalidConstructor { offset, code }),
        }
    }

    /// Reads a value and returns its bytes if it is a binary, string or symbol.
    /// Any other value is skipped.
    fn take_bytes_value(&mut self) -> Result<Option<&'a [u8]>, DecodeError> {
        let (offset, constructor) = self.take_constructor()?;
        match constructor {
            code::VBIN8 | code::STR8 | code::SYM8 => {
                let len = self.take_len(false)?;
                self.take_bytes(len).map(Some)
            }
            code::VBIN32 | code::STR32 | code::SYM32 => {
                let len = self.take_len(true)?;
                self.take_bytes(len).map(Some)
            }
            DESCRIBED => {
                self.skip_value(1)?;
                self.skip_value(1)?;
                Ok(None)
            }
            other => {
                self.skip_encoded(offset, other)?;
                Ok(None)
            }
        }
    }
}

/// Which kind of body section the message has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Data,
    Sequence,
    Value,
}

/// Per-message decode state, cleared and reused for every envelope.
#[derive(Debug, Default)]
struct MessageScratch {
    body: Vec<u8>,
    body_kind: Option<BodyKind>,
}

impl MessageScratch {
    fn clear(&mut self) {
        self.body.clear();
        self.body_kind = None;
    }

    fn enter_body(&mut self, kind: BodyKind) -> Result<(), DecodeError> {
        match (self.body_kind, kind) {
            (None, _) => {
                self.body_kind = Some(kind);
                Ok(())
            }
            (Some(BodyKind::Data), BodyKind::Data)
            | (Some(BodyKind::Sequence), BodyKind::Sequence) => Ok(()),
            _ => Err(DecodeError::ConflictingBody),
        }
    }

    fn parse(&mut self, buf: &[u8]) -> Result<(), DecodeError> {
        let mut reader = Reader::new(buf);
        while !reader.is_empty() {
            let (offset, found) = reader.take_constructor()?;
            if found != DESCRIBED {
                return Err(DecodeError::NotDescribed { offset, found });
            }

            match reader.take_section()? {
                Section::Data => {
                    self.enter_body(BodyKind::Data)?;
                    let len = match reader.take_u8()? {
                        code::VBIN8 => reader.take_len(false)?,
                        code::VBIN32 => reader.take_len(true)?,
                        other => return Err(DecodeError::DataNotBinary(other)),
                    };
                    self.body.extend_from_slice(reader.take_bytes(len)?);
                }
                Section::AmqpValue => {
                    self.enter_body(BodyKind::Value)?;
                    if let Some(bytes) = reader.take_bytes_value()? {
                        self.body.extend_from_slice(bytes);
                    }
                }
                Section::AmqpSequence => {
                    self.enter_body(BodyKind::Sequence)?;
                    reader.skip_value(0)?;
                }
                Section::Header
                | Section::DeliveryAnnotations
                | Section::MessageAnnotations
                | Section::Properties
                | Section::ApplicationProperties
                | Section::Footer => reader.skip_value(0)?,
            }
        }
        Ok(())
    }
}

/// Decoder for AMQP 1.0 messages.
///
/// Holds one scratch message that is cleared on every call, so steady-state
/// decoding does not allocate once the scratch buffer has grown to the
/// largest body seen.
#[derive(Debug, Default)]
pub struct AmqpDecoder {
    scratch: MessageScratch,
}

impl AmqpDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl EnvelopeDecoder for AmqpDecoder {
    fn decode<'a>(&'a mut self, envelope: &[u8]) -> Result<Option<&'a [u8]>, DecodeError> {
        self.scratch.clear();
        self.scratch.parse(envelope)?;
        if self.scratch.body.is_empty() {
            Ok(None)
        } else {
            Ok(Some(&self.scratch.body))
        }
    }
}

/// Message body for [`MessageBuilder`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Body {
    /// No body section at all.
    #[default]
    None,
    /// One `data` section per chunk.
    Data(Vec<Vec<u8>>),
    /// `amqp-value` holding a `binary`.
    Binary(Vec<u8>),
    /// `amqp-value` holding a `string`.
    Text(String),
    /// `amqp-value` holding a `symbol`.
    Symbol(String),
    /// `amqp-value` holding `null`.
    Null,
    /// `amqp-sequence` of strings.
    Sequence(Vec<String>),
}

impl Body {
    /// A single `data` section.
    #[must_use]
    pub fn data(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Data(vec![bytes.into()])
    }
}

/// Encodes AMQP messages, mostly for load generation and tests.
///
/// ```
/// use sgbridge::envelope::{AmqpDecoder, Body, EnvelopeDecoder, MessageBuilder};
///
/// let bytes = MessageBuilder::new()
///     .message_id("m-1")
///     .body(Body::data(b"cpu=0.42".to_vec()))
///     .encode();
///
/// let mut decoder = AmqpDecoder::new();
/// assert_eq!(decoder.decode(&bytes).unwrap(), Some(&b"cpu=0.42"[..]));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    durable: Option<bool>,
    message_id: Option<String>,
    annotations: Vec<(String, String)>,
    properties: Vec<(String, String)>,
    body: Body,
    footer: bool,
}

impl MessageBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a header section with the `durable` field.
    #[must_use]
    pub const fn durable(mut self, durable: bool) -> Self {
        self.durable = Some(durable);
        self
    }

    /// Adds a properties section with a string `message-id`.
    #[must_use]
    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Adds a symbol-keyed message annotation.
    #[must_use]
    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.push((key.into(), value.into()));
        self
    }

    /// Adds a string-keyed application property.
    #[must_use]
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    /// Appends an empty footer section.
    #[must_use]
    pub const fn footer(mut self) -> Self {
        self.footer = true;
        self
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Encodes into `buf`, replacing its contents.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let mut w = Writer::new(buf);

        if let Some(durable) = self.durable {
            w.section(Section::Header);
            w.list(1, |w| w.boolean(durable));
        }
        if !self.annotations.is_empty() {
            w.section(Section::MessageAnnotations);
            w.map(self.annotations.len(), |w| {
                for (k, v) in &self.annotations {
                    w.symbol(k);
                    w.string(v);
                }
            });
        }
        if let Some(id) = &self.message_id {
            w.section(Section::Properties);
            w.list(1, |w| w.string(id));
        }
        if !self.properties.is_empty() {
            w.section(Section::ApplicationProperties);
            w.map(self.properties.len(), |w| {
                for (k, v) in &self.properties {
                    w.string(k);
                    w.string(v);
                }
            });
        }

        match &self.body {
            Body::None => {}
            Body::Data(chunks) => {
                for chunk in chunks {
                    w.section(Section::Data);
                    w.binary(chunk);
                }
            }
            Body::Binary(bytes) => {
                w.section(Section::AmqpValue);
                w.binary(bytes);
            }
            Body::Text(s) => {
                w.section(Section::AmqpValue);
                w.string(s);
            }
            Body::Symbol(s) => {
                w.section(Section::AmqpValue);
                w.symbol(s);
            }
            Body::Null => {
                w.section(Section::AmqpValue);
                w.null();
            }
            Body::Sequence(items) => {
                w.section(Section::AmqpSequence);
                w.list(items.len(), |w| {
                    for item in items {
                        w.string(item);
                    }
                });
            }
        }

        if self.footer {
            w.section(Section::Footer);
            w.map(0, |_| {});
        }
    }
}

/// Appends AMQP encodings to a byte buffer.
struct Writer<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut Vec<u8>) -> Self {
        buf.clear();
        Self { buf }
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn section(&mut self, section: Section) {
        self.put_u8(DESCRIBED);
        self.put_u8(code::SMALL_ULONG);
        self.put_u8(section.code());
    }

    fn variable(&mut self, narrow: u8, wide: u8, bytes: &[u8]) {
        if let Ok(len) = u8::try_from(bytes.len()) {
            self.put_u8(narrow);
            self.put_u8(len);
        } else {
            self.put_u8(wide);
            self.put_u32(bytes.len() as u32);
        }
        self.buf.extend_from_slice(bytes);
    }

    fn binary(&mut self, bytes: &[u8]) {
        self.variable(code::VBIN8, code::VBIN32, bytes);
    }

    fn string(&mut self, s: &str) {
        self.variable(code::STR8, code::STR32, s.as_bytes());
    }

    fn symbol(&mut self, s: &str) {
        self.variable(code::SYM8, code::SYM32, s.as_bytes());
    }

    fn boolean(&mut self, v: bool) {
        self.put_u8(if v { code::TRUE } else { code::FALSE });
    }

    fn null(&mut self) {
        self.put_u8(code::NULL);
    }

    fn list(&mut self, count: usize, elements: impl FnOnce(&mut Writer<'_>)) {
        self.compound(code::LIST8, code::LIST32, count, elements);
    }

    /// `entries` is the number of key/value pairs.
    fn map(&mut self, entries: usize, elements: impl FnOnce(&mut Writer<'_>)) {
        self.compound(code::MAP8, code::MAP32, entries * 2, elements);
    }

    /// Writes a compound; `size` counts the count field plus the elements.
    fn compound(
        &mut self,
        narrow: u8,
        wide: u8,
        count: usize,
        elements: impl FnOnce(&mut Writer<'_>),
    ) {
        let mut body = Vec::new();
        elements(&mut Writer { buf: &mut body });

        match (u8::try_from(body.len() + 1), u8::try_from(count)) {
            (Ok(size), Ok(count)) => {
                self.put_u8(narrow);
                self.put_u8(size);
                self.put_u8(count);
            }
            _ => {
                self.put_u8(wide);
                self.put_u32((body.len() + 4) as u32);
                self.put_u32(count as u32);
            }
        }
        self.buf.extend_from_slice(&body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8]) -> Result<Option<Vec<u8>>, DecodeError> {
        let mut decoder = AmqpDecoder::new();
        decoder.decode(bytes).map(|p| p.map(<[u8]>::to_vec))
    }

    #[test]
    fn minimal_data_section() {
        let bytes = [0x00, 0x53, 0x75, 0xa0, 0x01, b'A'];
        assert_eq!(decode(&bytes), Ok(Some(b"A".to_vec())));
    }

    #[test]
    fn ulong_and_symbolic_descriptors() {
        let mut bytes = vec![0x00, 0x80, 0, 0, 0, 0, 0, 0, 0, 0x75, 0xa0, 0x02, b'h', b'i'];
        assert_eq!(decode(&bytes), Ok(Some(b"hi".to_vec())));

        bytes.clear();
        bytes.extend_from_slice(&[0x00, 0xa3, 16]);
        bytes.extend_from_slice(b"amqp:data:binary");
        bytes.extend_from_slice(&[0xa0, 0x02, b'y', b'o']);
        assert_eq!(decode(&bytes), Ok(Some(b"yo".to_vec())));
    }

    #[test]
    fn skips_every_non_body_section() {
        let bytes = MessageBuilder::new()
            .durable(true)
            .annotation("x-opt-jms-dest", "queue")
            .message_id("msg-1")
            .property("source", "collectd")
            .body(Body::data(b"cpu.load 0.5".to_vec()))
            .footer()
            .encode();
        assert_eq!(decode(&bytes), Ok(Some(b"cpu.load 0.5".to_vec())));
    }

    #[test]
    fn value_bodies_with_bytes() {
        for (body, expected) in [
            (Body::Binary(vec![1, 2, 3]), vec![1, 2, 3]),
            (Body::Text("metric".into()), b"metric".to_vec()),
            (Body::Symbol("sym".into()), b"sym".to_vec()),
        ] {
            let bytes = MessageBuilder::new().body(body).encode();
            assert_eq!(decode(&bytes), Ok(Some(expected)));
        }
    }

    #[test]
    fn bodies_without_bytes_yield_none() {
        for body in [
            Body::None,
            Body::Null,
            Body::data(Vec::new()),
            Body::Text(String::new()),
            Body::Sequence(vec!["a".into(), "b".into()]),
        ] {
            let bytes = MessageBuilder::new().message_id("id").body(body.clone()).encode();
            assert_eq!(decode(&bytes), Ok(None), "body {body:?}");
        }
    }

    #[test]
    fn non_byte_value_yields_none() {
        // amqp-value holding uint 7 (smalluint)
        let bytes = [0x00, 0x53, 0x77, 0x52, 0x07];
        assert_eq!(decode(&bytes), Ok(None));
    }

    #[test]
    fn empty_buffer_is_a_message_without_body() {
        assert_eq!(decode(&[]), Ok(None));
    }

    #[test]
    fn consecutive_data_sections_concatenate() {
        let bytes = MessageBuilder::new()
            .body(Body::Data(vec![b"ab".to_vec(), b"cd".to_vec()]))
            .encode();
        assert_eq!(decode(&bytes), Ok(Some(b"abcd".to_vec())));
    }

    #[test]
    fn large_body_uses_wide_encoding() {
        let payload = vec![0x5a; 70_000];
        let bytes = MessageBuilder::new()
            .body(Body::data(payload.clone()))
            .encode();
        assert_eq!(bytes[3], code::VBIN32);
        assert_eq!(decode(&bytes), Ok(Some(payload)));
    }

    #[test]
    fn large_map_uses_wide_encoding() {
        let mut builder = MessageBuilder::new();
        for i in 0..200 {
            builder = builder.property(format!("k{i}"), "v");
        }
        let bytes = builder.body(Body::data(b"ok".to_vec())).encode();
        assert_eq!(decode(&bytes), Ok(Some(b"ok".to_vec())));
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(
            decode(b"not amqp"),
            Err(DecodeError::NotDescribed {
                offset: 0,
                found: b'n'
            })
        );
    }

    #[test]
    fn truncated_body_is_rejected() {
        let bytes = MessageBuilder::new()
            .message_id("id")
            .body(Body::data(b"payload".to_vec()))
            .encode();
        let cut = &bytes[..bytes.len() - 3];
        assert!(matches!(decode(cut), Err(DecodeError::Truncated { need: 3, .. })));
    }

    #[test]
    fn truncated_skipped_section_is_rejected() {
        let bytes = MessageBuilder::new().message_id("some-id").encode();
        assert!(matches!(
            decode(&bytes[..bytes.len() - 1]),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn unknown_section_is_rejected() {
        let bytes = [0x00, 0x53, 0x79, 0x40];
        assert_eq!(
            decode(&bytes),
            Err(DecodeError::UnknownSection("0x79".into()))
        );
    }

    #[test]
    fn invalid_constructor_is_rejected() {
        // header section whose value uses reserved code 0x30
        let bytes = [0x00, 0x53, 0x70, 0x30];
        assert_eq!(
            decode(&bytes),
            Err(DecodeError::InvalidConstructor {
                offset: 3,
                code: 0x30
            })
        );
    }

    #[test]
    fn data_section_must_be_binary() {
        let bytes = [0x00, 0x53, 0x75, 0xa1, 0x01, b'x'];
        assert_eq!(decode(&bytes), Err(DecodeError::DataNotBinary(0xa1)));
    }

    #[test]
    fn mixed_body_kinds_conflict() {
        let mut bytes = MessageBuilder::new().body(Body::Text("v".into())).encode();
        bytes.extend_from_slice(&[0x00, 0x53, 0x75, 0xa0, 0x01, b'A']);
        assert_eq!(decode(&bytes), Err(DecodeError::ConflictingBody));
    }

    #[test]
    fn runaway_descriptor_nesting_is_rejected() {
        let mut bytes = vec![0x00, 0x53, 0x70];
        bytes.extend(std::iter::repeat_n(0x00, 16));
        assert_eq!(decode(&bytes), Err(DecodeError::NestingTooDeep));
    }

    #[test]
    fn scratch_is_cleared_and_reused() {
        let mut decoder = AmqpDecoder::new();

        let big = MessageBuilder::new()
            .body(Body::data(vec![b'x'; 512]))
            .encode();
        let first = decoder.decode(&big).unwrap().unwrap().as_ptr() as usize;

        let small = MessageBuilder::new().body(Body::data(b"B".to_vec())).encode();
        let second = decoder.decode(&small).unwrap().unwrap();
        assert_eq!(second, b"B");
        assert_eq!(second.as_ptr() as usize, first);

        assert!(decoder.decode(b"\xff").is_err());
        let empty = MessageBuilder::new().encode();
        assert_eq!(decoder.decode(&empty).unwrap(), None);
    }
}
