//! Wire format: the outbound form-urlencoded POST body, and the inbound `<messages>` XML.

use std::sync::Arc;

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{Error, Protocol, Result};
use crate::message::{DecoderRegistry, Message, TempFileContext};

/// One outbound message together with the sequence number it was assigned when placed into a
/// POST body.
pub(crate) struct OutboundEnvelope {
    pub(crate) seq: u64,
    pub(crate) message_type: char,
    pub(crate) payload: String,
}

/// Builds the `action=messages&id=..&l=..&s0=..&t0=..&m0=..` body for one donation cycle.
pub(crate) fn encode_request_body(id: &str, batch: &[OutboundEnvelope]) -> String {
    let mut ser = url::form_urlencoded::Serializer::new(String::new());
    ser.append_pair("action", "messages");
    ser.append_pair("id", id);
    ser.append_pair("l", &batch.len().to_string());
    for (i, envelope) in batch.iter().enumerate() {
        ser.append_pair(&format!("s{i}"), &envelope.seq.to_string());
        ser.append_pair(&format!("t{i}"), &envelope.message_type.to_string());
        ser.append_pair(&format!("m{i}"), &envelope.payload);
    }
    ser.finish()
}

/// One decoded inbound message, tagged with the server-assigned sequence number it arrived
/// under.
pub(crate) struct InboundEnvelope {
    pub(crate) seq: u64,
    pub(crate) message: Arc<dyn Message>,
}

/// Parses one `<messages>...</messages>` response body, decoding each `<message>` child through
/// `decoders`.
///
/// `quick-xml` never resolves external entities or DTDs — there is no code path in the crate
/// that does so — which is what satisfies the "hardened against external-entity attacks"
/// requirement without any extra configuration.
pub(crate) fn parse_response_body(
    body: &[u8],
    decoders: &DecoderRegistry,
    temp_files: &TempFileContext,
) -> Result<Vec<InboundEnvelope>> {
    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut envelopes = Vec::new();
    let mut saw_root = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(start)) if !saw_root => {
                if start.name().as_ref() != b"messages" {
                    return Err(Error::new_protocol(Protocol::WrongRoot));
                }
                saw_root = true;
            }
            Ok(Event::Empty(start)) if !saw_root => {
                if start.name().as_ref() != b"messages" {
                    return Err(Error::new_protocol(Protocol::WrongRoot));
                }
                return Ok(envelopes);
            }
            Ok(Event::Start(start)) if start.name().as_ref() == b"message" => {
                let envelope = parse_message(&mut reader, &start, decoders, temp_files)?;
                envelopes.push(envelope);
            }
            Ok(Event::Empty(start)) if start.name().as_ref() == b"message" => {
                let (seq, type_char) = read_message_attrs(&start)?;
                let message = decoders.decode(type_char, "", temp_files)?;
                envelopes.push(InboundEnvelope { seq, message });
            }
            Ok(Event::End(end)) if end.name().as_ref() == b"messages" => break,
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(_) => return Err(Error::new_protocol(Protocol::Malformed)),
        }
        buf.clear();
    }

    if !saw_root {
        return Err(Error::new_protocol(Protocol::WrongRoot));
    }

    Ok(envelopes)
}

fn read_message_attrs(start: &quick_xml::events::BytesStart<'_>) -> Result<(u64, char)> {
    let mut seq: Option<u64> = None;
    let mut type_char: Option<char> = None;

    for attr in start.attributes() {
        let attr = attr.map_err(|_| Error::new_protocol(Protocol::Malformed))?;
        let value = attr
            .unescape_value()
            .map_err(|_| Error::new_protocol(Protocol::Malformed))?;
        match attr.key.as_ref() {
            b"seq" => {
                seq = Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| Error::new_protocol(Protocol::BadAttribute("seq")))?,
                );
            }
            b"type" => {
                let mut chars = value.chars();
                let c = chars.next();
                if c.is_none() || chars.next().is_some() {
                    return Err(Error::new_protocol(Protocol::BadAttribute("type")));
                }
                type_char = c;
            }
            _ => {}
        }
    }

    match (seq, type_char) {
        (Some(seq), Some(type_char)) => Ok((seq, type_char)),
        (None, _) => Err(Error::new_protocol(Protocol::BadAttribute("seq"))),
        (_, None) => Err(Error::new_protocol(Protocol::BadAttribute("type"))),
    }
}

fn parse_message(
    reader: &mut Reader<&[u8]>,
    start: &quick_xml::events::BytesStart<'_>,
    decoders: &DecoderRegistry,
    temp_files: &TempFileContext,
) -> Result<InboundEnvelope> {
    let (seq, type_char) = read_message_attrs(start)?;

    let mut text = String::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Text(e)) => {
                let decoded = e
                    .unescape()
                    .map_err(|_| Error::new_protocol(Protocol::Malformed))?;
                text.push_str(&decoded);
            }
            Ok(Event::CData(e)) => {
                text.push_str(&String::from_utf8_lossy(e.as_ref()));
            }
            Ok(Event::End(end)) if end.name().as_ref() == b"message" => break,
            Ok(Event::Eof) => return Err(Error::new_protocol(Protocol::Malformed)),
            Ok(Event::Start(_)) | Ok(Event::Empty(_)) => {
                return Err(Error::new_protocol(Protocol::UnexpectedNode));
            }
            Ok(_) => {}
            Err(_) => return Err(Error::new_protocol(Protocol::Malformed)),
        }
        buf.clear();
    }

    let message = decoders.decode(type_char, &text, temp_files)?;
    Ok(InboundEnvelope { seq, message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Decoder;
    use std::sync::Arc;

    #[derive(Debug)]
    struct Echo(String);

    impl Message for Echo {
        fn message_type(&self) -> char {
            's'
        }
        fn encode(&self) -> String {
            self.0.clone()
        }
    }

    struct EchoDecoder;
    impl Decoder for EchoDecoder {
        fn decode(&self, payload: &str, _temp_files: &TempFileContext) -> Result<Arc<dyn Message>> {
            Ok(Arc::new(Echo(payload.to_string())))
        }
    }

    fn registry() -> DecoderRegistry {
        let mut r = DecoderRegistry::new();
        r.register('s', Arc::new(EchoDecoder));
        r
    }

    #[test]
    fn encodes_empty_batch() {
        let body = encode_request_body("abc", &[]);
        assert_eq!(body, "action=messages&id=abc&l=0");
    }

    #[test]
    fn encodes_single_message() {
        let batch = vec![OutboundEnvelope {
            seq: 1,
            message_type: 's',
            payload: "hi".to_string(),
        }];
        let body = encode_request_body("abc", &batch);
        assert_eq!(body, "action=messages&id=abc&l=1&s0=1&t0=s&m0=hi");
    }

    #[test]
    fn percent_encodes_payload() {
        let batch = vec![OutboundEnvelope {
            seq: 1,
            message_type: 's',
            payload: "a b&c".to_string(),
        }];
        let body = encode_request_body("abc", &batch);
        assert!(body.contains("m0=a+b%26c"));
    }

    #[test]
    fn parses_empty_messages_root() {
        let temp = TempFileContext::new();
        let out = parse_response_body(b"<messages/>", &registry(), &temp).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn parses_single_message() {
        let temp = TempFileContext::new();
        let xml = br#"<messages><message seq="1" type="s">ok</message></messages>"#;
        let out = parse_response_body(xml, &registry(), &temp).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].seq, 1);
        assert_eq!(out[0].message.encode(), "ok");
    }

    #[test]
    fn rejects_wrong_root() {
        let temp = TempFileContext::new();
        let err = parse_response_body(b"<nope/>", &registry(), &temp).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn rejects_nested_element_in_message() {
        let temp = TempFileContext::new();
        let xml = br#"<messages><message seq="1" type="s"><x/></message></messages>"#;
        let err = parse_response_body(xml, &registry(), &temp).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn empty_text_content_decodes_to_empty_string() {
        let temp = TempFileContext::new();
        let xml = br#"<messages><message seq="1" type="s"></message></messages>"#;
        let out = parse_response_body(xml, &registry(), &temp).unwrap();
        assert_eq!(out[0].message.encode(), "");
    }
}
