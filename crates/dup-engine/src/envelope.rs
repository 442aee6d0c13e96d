//! Length-prefixed answer envelope.
//!
//! When a duplicate round-trips through a comparison stage, the request
//! body, the original response headers, and the original response body
//! travel together as
//! `[8-byte length][request body][8-byte length][response headers][8-byte
//! length][response body]`. Length fields are fixed-width ASCII decimal,
//! space padding tolerated. This is strict framing: every declared length
//! is validated against the remaining buffer before slicing, and a
//! malformed length fails the parse for that single request only.

use crate::error::EnvelopeError;
use crate::request::Headers;

/// Width of each ASCII decimal length field.
pub const LEN_WIDTH: usize = 8;

/// The three sections carried by the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    pub request_body: String,
    pub response_headers: String,
    pub response_body: String,
}

impl Envelope {
    /// Serialize with fixed-width decimal length prefixes.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(
            3 * LEN_WIDTH
                + self.request_body.len()
                + self.response_headers.len()
                + self.response_body.len(),
        );
        for section in [
            &self.request_body,
            &self.response_headers,
            &self.response_body,
        ] {
            out.push_str(&format!("{:0width$}", section.len(), width = LEN_WIDTH));
            out.push_str(section);
        }
        out
    }

    /// Parse a serialized envelope. Trailing bytes beyond the last declared
    /// section are ignored.
    pub fn parse(data: &str) -> Result<Envelope, EnvelopeError> {
        let bytes = data.as_bytes();
        let mut cursor = 0usize;

        let request_body = read_section(bytes, &mut cursor)?;
        let response_headers = read_section(bytes, &mut cursor)?;
        let response_body = read_section(bytes, &mut cursor)?;

        Ok(Envelope {
            request_body,
            response_headers,
            response_body,
        })
    }
}

/// Serialize response headers into the envelope's header section:
/// one `name: value` line per header.
pub fn serialize_headers(headers: &Headers) -> String {
    let mut out = String::new();
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push('\n');
    }
    out
}

fn read_section(bytes: &[u8], cursor: &mut usize) -> Result<String, EnvelopeError> {
    let len = read_len(bytes, cursor)?;
    let remaining = bytes.len() - *cursor;
    if len > remaining {
        return Err(EnvelopeError::Truncated {
            needed: len,
            remaining,
        });
    }
    let section = &bytes[*cursor..*cursor + len];
    *cursor += len;
    Ok(String::from_utf8_lossy(section).into_owned())
}

fn read_len(bytes: &[u8], cursor: &mut usize) -> Result<usize, EnvelopeError> {
    let remaining = bytes.len() - *cursor;
    if remaining < LEN_WIDTH {
        return Err(EnvelopeError::Truncated {
            needed: LEN_WIDTH,
            remaining,
        });
    }
    let field = &bytes[*cursor..*cursor + LEN_WIDTH];
    *cursor += LEN_WIDTH;

    let text = std::str::from_utf8(field)
        .map_err(|_| EnvelopeError::BadLength(String::from_utf8_lossy(field).into_owned()))?;
    text.trim_matches(' ')
        .parse::<usize>()
        .map_err(|_| EnvelopeError::BadLength(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_parse_round_trip() {
        let envelope = Envelope {
            request_body: "abc".to_string(),
            response_headers: "Content-Type: text/plain\n".to_string(),
            response_body: "hello world".to_string(),
        };
        let encoded = envelope.encode();
        assert!(encoded.starts_with("00000003abc"));
        assert_eq!(Envelope::parse(&encoded).unwrap(), envelope);
    }

    #[test]
    fn parses_fixed_width_sections() {
        let parsed = Envelope::parse("00000003abc00000005wxyzz0000000 2hi").unwrap();
        assert_eq!(parsed.request_body, "abc");
        assert_eq!(parsed.response_headers, "wxyzz");
        // Third length field is space-padded zero; the declared length and
        // the section agree, trailing bytes are ignored.
        assert_eq!(parsed.response_body.len(), 0);
    }

    #[test]
    fn truncated_buffer_is_a_parse_failure() {
        assert_eq!(
            Envelope::parse("00000003ab"),
            Err(EnvelopeError::Truncated {
                needed: 3,
                remaining: 2
            })
        );
        assert!(matches!(
            Envelope::parse("000000"),
            Err(EnvelopeError::Truncated { .. })
        ));
    }

    #[test]
    fn length_exceeding_remaining_buffer_is_rejected() {
        assert!(matches!(
            Envelope::parse("00000099abc"),
            Err(EnvelopeError::Truncated { .. })
        ));
    }

    #[test]
    fn non_numeric_length_is_rejected() {
        assert_eq!(
            Envelope::parse("0000000Xabc"),
            Err(EnvelopeError::BadLength("0000000X".to_string()))
        );
        assert!(matches!(
            Envelope::parse("-0000003abc00000000"),
            Err(EnvelopeError::BadLength(_))
        ));
    }

    #[test]
    fn serializes_headers_one_per_line() {
        let headers = vec![
            ("Content-Type".to_string(), "text/plain".to_string()),
            ("X-Id".to_string(), "42".to_string()),
        ];
        assert_eq!(
            serialize_headers(&headers),
            "Content-Type: text/plain\nX-Id: 42\n"
        );
    }

    #[test]
    fn empty_sections_round_trip() {
        let envelope = Envelope::default();
        assert_eq!(envelope.encode(), "000000000000000000000000");
        assert_eq!(Envelope::parse(&envelope.encode()).unwrap(), envelope);
    }
}
