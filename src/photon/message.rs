//! Logical message classification above the transport layer.
//!
//! Every complete command body starts with a signature byte and a message
//! type, then a kind-specific header and the payload dictionary. Anything
//! malformed drops the whole command; the pipeline counts it and moves on.

use thiserror::Error;

use super::protocol16::{decode_params, decode_value, ParamMap, Protocol16Error, Reader};
use super::transport::TransportMessage;

pub const SIGNATURE: u8 = 0xF3;

const TYPE_REQUEST: u8 = 2;
const TYPE_RESPONSE: u8 = 3;
const TYPE_EVENT: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageKind {
    Request,
    Response,
    Event,
}

impl MessageKind {
    pub fn wire_type(self) -> u8 {
        match self {
            MessageKind::Request => TYPE_REQUEST,
            MessageKind::Response => TYPE_RESPONSE,
            MessageKind::Event => TYPE_EVENT,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::Event => "event",
        }
    }
}

/// A classified message. Transient: consumed by the semantics layer and
/// dropped before the next command is parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalMessage {
    pub channel: u8,
    pub reliable: bool,
    pub seq: u16,
    pub kind: MessageKind,
    pub code: u8,
    /// Response-only operation result; zero means success.
    pub return_code: Option<i16>,
    pub params: ParamMap,
    /// Set when the payload decoder stopped at an unrecognized tag; the
    /// params above are the prefix that did parse.
    pub unknown_tag: Option<u8>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("message body shorter than header")]
    TooShort,
    #[error("bad signature byte {0:#04x}")]
    BadSignature(u8),
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("payload decode failed: {0}")]
    Payload(#[from] Protocol16Error),
}

pub fn classify(message: &TransportMessage) -> Result<LogicalMessage, ClassifyError> {
    let body = &message.body[..];
    if body.len() < 3 {
        return Err(ClassifyError::TooShort);
    }
    if body[0] != SIGNATURE {
        return Err(ClassifyError::BadSignature(body[0]));
    }
    let kind = match body[1] {
        TYPE_REQUEST => MessageKind::Request,
        TYPE_RESPONSE => MessageKind::Response,
        TYPE_EVENT => MessageKind::Event,
        other => return Err(ClassifyError::UnknownType(other)),
    };

    let mut r = Reader::new(&body[2..]);
    let code = r.u8()?;
    let return_code = if kind == MessageKind::Response {
        let rc = r.i16()?;
        // Debug text follows as a tagged value; usually an empty string.
        match decode_value(&mut r) {
            Ok(_) => {}
            Err(Protocol16Error::UnknownTag(tag)) => {
                return Ok(LogicalMessage {
                    channel: message.channel,
                    reliable: message.reliable,
                    seq: message.seq,
                    kind,
                    code,
                    return_code: Some(rc),
                    params: ParamMap::new(),
                    unknown_tag: Some(tag),
                });
            }
            Err(e) => return Err(e.into()),
        }
        Some(rc)
    } else {
        None
    };

    let decoded = decode_params(&mut r)?;
    Ok(LogicalMessage {
        channel: message.channel,
        reliable: message.reliable,
        seq: message.seq,
        kind,
        code,
        return_code,
        params: decoded.params,
        unknown_tag: decoded.unknown_tag,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::photon::protocol16::Value;
    use crate::photon::wire;

    fn transport(body: Vec<u8>) -> TransportMessage {
        TransportMessage {
            channel: 1,
            reliable: true,
            seq: 11,
            body: Bytes::from(body),
        }
    }

    #[test]
    fn classifies_event_with_params() {
        let mut params = ParamMap::new();
        params.insert(0, Value::I32(900));
        params.insert(2, Value::F64(-42.0));
        let body = wire::message_body(MessageKind::Event, 6, &params);

        let message = classify(&transport(body)).expect("classify");
        assert_eq!(message.kind, MessageKind::Event);
        assert_eq!(message.code, 6);
        assert_eq!(message.seq, 11);
        assert_eq!(message.params, params);
        assert!(message.return_code.is_none());
        assert!(message.unknown_tag.is_none());
    }

    #[test]
    fn classifies_response_with_return_code() {
        let mut params = ParamMap::new();
        params.insert(1, Value::Str("Old Town".into()));
        let body = wire::response_body(2, -7, "slow down", &params);

        let message = classify(&transport(body)).expect("classify");
        assert_eq!(message.kind, MessageKind::Response);
        assert_eq!(message.code, 2);
        assert_eq!(message.return_code, Some(-7));
        assert_eq!(message.params, params);
    }

    #[test]
    fn classifies_request() {
        let mut params = ParamMap::new();
        params.insert(5, Value::I32(31337));
        let body = wire::message_body(MessageKind::Request, 1, &params);

        let message = classify(&transport(body)).expect("classify");
        assert_eq!(message.kind, MessageKind::Request);
        assert_eq!(message.code, 1);
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut params = ParamMap::new();
        params.insert(0, Value::I32(1));
        let mut body = wire::message_body(MessageKind::Event, 6, &params);
        body[0] = 0xAB;
        assert_eq!(
            classify(&transport(body)),
            Err(ClassifyError::BadSignature(0xAB))
        );
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let body = vec![SIGNATURE, 9, 0, 0, 0];
        assert_eq!(
            classify(&transport(body)),
            Err(ClassifyError::UnknownType(9))
        );
    }

    #[test]
    fn short_body_is_rejected() {
        assert_eq!(
            classify(&transport(vec![SIGNATURE])),
            Err(ClassifyError::TooShort)
        );
    }

    #[test]
    fn unknown_payload_tag_keeps_parsed_prefix() {
        let mut body = vec![SIGNATURE, MessageKind::Event.wire_type(), 77];
        body.extend_from_slice(&2i16.to_be_bytes());
        body.push(0);
        body.push(crate::photon::protocol16::TAG_I32);
        body.extend_from_slice(&5i32.to_be_bytes());
        body.push(1);
        body.push(23); // unknown tag
        body.push(0xFF);

        let message = classify(&transport(body)).expect("classify");
        assert_eq!(message.params.len(), 1);
        assert_eq!(message.unknown_tag, Some(23));
    }
}
