//! Application envelopes and the decode contract the dispatch loop relies on.
//!
//! The loop only cares whether an envelope decodes and whether it carries a
//! body. [`EnvelopeDecoder`] is that seam; [`amqp::AmqpDecoder`] is the
//! implementation for AMQP 1.0 messages.

pub mod amqp;

pub use amqp::{AmqpDecoder, Body, DecodeError, MessageBuilder};

/// One encoded application message as taken from the inbound queue.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    bytes: Vec<u8>,
}

impl Envelope {
    #[must_use]
    pub const fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl From<Vec<u8>> for Envelope {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for Envelope {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }
}

/// Extracts the payload to forward from an encoded envelope.
///
/// Implementations keep reusable scratch state, so the returned slice borrows
/// the decoder and is gone by the next call.
pub trait EnvelopeDecoder {
    /// Decodes `envelope`.
    ///
    /// Returns `Ok(None)` when the envelope is well formed but has no body, or
    /// an empty one.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if `envelope` is not a valid message.
    fn decode<'a>(&'a mut self, envelope: &[u8]) -> Result<Option<&'a [u8]>, DecodeError>;
}
