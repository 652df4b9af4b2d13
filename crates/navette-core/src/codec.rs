//! Frame codec: turns messages into bytes and back.
//!
//! Two equivalent framings exist, chosen at construction and fixed for the
//! lifetime of the connection:
//!
//! * [`Framing::JsonStream`] — two consecutive JSON values per message, a
//!   header object followed by a payload value, separated by JSON
//!   whitespace. Decoded with `serde_json`'s multiple-root-values parser.
//! * [`Framing::LineDelimited`] — one JSON object per line (header fields
//!   plus a `Payload` member), terminated by a single newline. This variant
//!   carries `ContentLength` for explicit framing.
//!
//! Decoding is incremental: `Ok(None)` means "need more bytes", and the
//! decoder never buffers more than one whole message beyond what the parser
//! requires. End of stream landing inside a message is a
//! [`CodecError::TruncatedFrame`].

use bytes::{Buf, BytesMut};
use serde::Deserialize;
use serde_json::Value;

use crate::error::CodecError;
use crate::message::{Message, MessageHeader, MessageType, RequestId};

/// Wire framing variant. The rest of the engine is invariant under this
/// choice; both peers must agree on it out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    #[default]
    JsonStream,
    LineDelimited,
}

/// Serialize one message into `dst`.
///
/// The encoding is appended as a single contiguous run of bytes, so a caller
/// that writes `dst` in one `write_all` keeps frames whole on the wire.
pub fn encode_message(
    framing: Framing,
    message: &Message,
    dst: &mut Vec<u8>,
) -> Result<(), CodecError> {
    match framing {
        Framing::JsonStream => {
            serde_json::to_writer(&mut *dst, &message.header)?;
            dst.push(b'\n');
            serde_json::to_writer(&mut *dst, &message.payload)?;
            dst.push(b'\n');
        }
        Framing::LineDelimited => {
            let mut header = message.header.clone();
            header.content_length = Some(serde_json::to_vec(&message.payload)?.len() as u64);
            let Value::Object(mut record) = serde_json::to_value(&header)? else {
                return Err(CodecError::MalformedHeader(
                    "header did not serialize to an object".into(),
                ));
            };
            record.insert("Payload".into(), message.payload.clone());
            serde_json::to_writer(&mut *dst, &Value::Object(record))?;
            dst.push(b'\n');
        }
    }
    Ok(())
}

/// Incremental frame decoder over a growable byte buffer.
#[derive(Debug)]
pub struct FrameDecoder {
    framing: Framing,
}

impl FrameDecoder {
    pub fn new(framing: Framing) -> Self {
        Self { framing }
    }

    /// Try to decode the next complete message, consuming its bytes from
    /// `buf`. `Ok(None)` means more input is needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        match self.framing {
            Framing::JsonStream => decode_json_stream(buf),
            Framing::LineDelimited => decode_line_delimited(buf),
        }
    }

    /// Like [`decode`](Self::decode), called once the underlying stream has
    /// reached end of input. Leftover bytes that do not form a complete
    /// message are a [`CodecError::TruncatedFrame`].
    pub fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        if let Some(message) = self.decode(buf)? {
            return Ok(Some(message));
        }
        if buf.iter().all(|b| b.is_ascii_whitespace()) {
            Ok(None)
        } else {
            Err(CodecError::TruncatedFrame)
        }
    }
}

fn decode_json_stream(buf: &mut BytesMut) -> Result<Option<Message>, CodecError> {
    let (message, consumed) = {
        let mut values = serde_json::Deserializer::from_slice(&buf[..]).into_iter::<Value>();
        let header = match values.next() {
            None => return Ok(None),
            Some(Err(e)) if e.is_eof() => return Ok(None),
            Some(Err(e)) => return Err(CodecError::Json(e)),
            Some(Ok(value)) => value,
        };
        let payload = match values.next() {
            None => return Ok(None),
            Some(Err(e)) if e.is_eof() => return Ok(None),
            Some(Err(e)) => return Err(CodecError::Json(e)),
            Some(Ok(value)) => value,
        };
        let header = header_from_value(header)?;
        (Message { header, payload }, values.byte_offset())
    };
    buf.advance(consumed);
    Ok(Some(message))
}

fn decode_line_delimited(buf: &mut BytesMut) -> Result<Option<Message>, CodecError> {
    loop {
        let Some(newline) = buf.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let line = buf.split_to(newline + 1);
        let line = line[..line.len() - 1].trim_ascii();
        if line.is_empty() {
            continue;
        }

        let value: Value = serde_json::from_slice(line)?;
        let Value::Object(mut record) = value else {
            return Err(CodecError::MalformedHeader(
                "line record is not a JSON object".into(),
            ));
        };
        let payload = record.remove("Payload").unwrap_or(Value::Null);
        let header = header_from_value(Value::Object(record))?;
        return Ok(Some(Message { header, payload }));
    }
}

/// Header fields as they appear on the wire. Decoded loosely first so that
/// an out-of-set `MessageType` is distinguishable from a structurally
/// malformed header.
#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawHeader {
    message_type: String,
    #[serde(default)]
    method: Option<String>,
    request_id: RequestId,
    #[serde(default)]
    content_length: Option<u64>,
}

fn header_from_value(value: Value) -> Result<MessageHeader, CodecError> {
    if !value.is_object() {
        return Err(CodecError::MalformedHeader(
            "header is not a JSON object".into(),
        ));
    }
    let raw: RawHeader =
        serde_json::from_value(value).map_err(|e| CodecError::MalformedHeader(e.to_string()))?;
    let message_type = MessageType::from_wire(&raw.message_type)
        .ok_or(CodecError::UnknownMessageType(raw.message_type))?;
    Ok(MessageHeader {
        message_type,
        method: raw.method,
        request_id: raw.request_id,
        content_length: raw.content_length,
    })
}
