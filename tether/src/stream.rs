//! Pull-based view over a message body.
//!
//! [`from_source`] turns a [`ByteSource`] into a finite stream of [`Chunk`]s
//! in receipt order. An error ends the stream immediately, even if an end
//! marker follows it. A writer that goes away without ending the message
//! fails the stream with [`SourceError::Truncated`].
//!
//! The [`Encoding`] is fixed when the stream is created. `ascii` and `utf8`
//! decode the body as text, `base64` and `hex` render it as text. All of them
//! keep state across chunks, so a multi-byte sequence or an incomplete base64
//! group split between two chunks comes out whole.

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use futures_util::{Stream, stream};
use serde::{Deserialize, Serialize};
use tether_smtp::{ByteSource, SourceError, SourceEvent};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Raw bytes, exactly as read off the wire.
    #[default]
    None,
    /// Seven-bit text; the high bit of every byte is cleared.
    Ascii,
    /// UTF-8 text, with malformed sequences replaced by U+FFFD.
    Utf8,
    Base64,
    /// Lowercase hex.
    Hex,
}

impl Encoding {
    #[must_use]
    pub const fn is_text(self) -> bool {
        !matches!(self, Self::None)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Chunk {
    Bytes(Vec<u8>),
    Text(String),
}

impl Chunk {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Bytes(bytes) => bytes,
            Self::Text(text) => text.as_bytes(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

enum Decoder {
    Raw,
    Ascii,
    Utf8(encoding_rs::Decoder),
    Base64 { pending: Vec<u8> },
    Hex,
}

impl Decoder {
    fn new(encoding: Encoding) -> Self {
        match encoding {
            Encoding::None => Self::Raw,
            Encoding::Ascii => Self::Ascii,
            Encoding::Utf8 => Self::Utf8(encoding_rs::UTF_8.new_decoder_without_bom_handling()),
            Encoding::Base64 => Self::Base64 {
                pending: Vec::with_capacity(3),
            },
            Encoding::Hex => Self::Hex,
        }
    }

    /// `None` when the bytes produced nothing yet.
    fn decode(&mut self, mut bytes: Vec<u8>) -> Option<Chunk> {
        let chunk = match self {
            Self::Raw => Chunk::Bytes(bytes),
            Self::Ascii => Chunk::Text(bytes.iter().map(|&b| char::from(b & 0x7f)).collect()),
            Self::Utf8(decoder) => Chunk::Text(utf8(decoder, &bytes, false)),
            Self::Base64 { pending } => {
                pending.append(&mut bytes);
                let whole = pending.len() - pending.len() % 3;
                let text = B64.encode(&pending[..whole]);
                pending.drain(..whole);
                Chunk::Text(text)
            }
            Self::Hex => Chunk::Text(hex::encode(bytes)),
        };

        (!chunk.is_empty()).then_some(chunk)
    }

    /// Whatever is still held back at the end of the message.
    fn finish(&mut self) -> Option<Chunk> {
        let chunk = match self {
            Self::Utf8(decoder) => Chunk::Text(utf8(decoder, &[], true)),
            Self::Base64 { pending } => Chunk::Text(B64.encode(std::mem::take(pending))),
            Self::Raw | Self::Ascii | Self::Hex => return None,
        };

        (!chunk.is_empty()).then_some(chunk)
    }
}

fn utf8(decoder: &mut encoding_rs::Decoder, bytes: &[u8], last: bool) -> String {
    let capacity = decoder
        .max_utf8_buffer_length(bytes.len())
        .unwrap_or(bytes.len().saturating_mul(3).saturating_add(4));
    let mut text = String::with_capacity(capacity);
    let _ = decoder.decode_to_string(bytes, &mut text, last);
    text
}

struct Adapter {
    source: ByteSource,
    decoder: Decoder,
    done: bool,
}

/// Adapt `source` into a stream of chunks rendered with `encoding`.
pub fn from_source(
    source: ByteSource,
    encoding: Encoding,
) -> impl Stream<Item = Result<Chunk, SourceError>> + Send {
    let adapter = Adapter {
        source,
        decoder: Decoder::new(encoding),
        done: false,
    };

    stream::unfold(adapter, |mut adapter| async move {
        if adapter.done {
            return None;
        }

        loop {
            match adapter.source.next_event().await {
                Some(SourceEvent::Data(bytes)) => {
                    if let Some(chunk) = adapter.decoder.decode(bytes) {
                        return Some((Ok(chunk), adapter));
                    }
                }
                Some(SourceEvent::End) => {
                    adapter.done = true;
                    let rest = adapter.decoder.finish();
                    return rest.map(|chunk| (Ok(chunk), adapter));
                }
                Some(SourceEvent::Error(err)) => {
                    adapter.done = true;
                    return Some((Err(err), adapter));
                }
                None => {
                    adapter.done = true;
                    return Some((Err(SourceError::Truncated), adapter));
                }
            }
        }
    })
}
