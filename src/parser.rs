//! Wire envelope decoder.
//!
//! Poll responses arrive as a JSON array of raw records whose `value` field
//! is a base64-encoded envelope: a header block of `Key: Value` lines,
//! a blank-line separator (CRLF-CRLF, with LF-LF accepted as a fallback),
//! then the message body.
//!
//! Only a malformed outer JSON array is fatal. A record that fails to
//! decode is logged and skipped without affecting the rest of the batch.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::message::Message;

/// Errors that abort decoding of a whole poll response.
#[derive(Error, Debug)]
pub(crate) enum ParseError {
    /// The outer JSON array could not be parsed.
    #[error("error parsing json response: {0}")]
    Envelope(#[from] serde_json::Error),

    /// A record's base64 payload could not be decoded.
    #[error("error decoding base64 value: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Raw record as returned by the poll endpoint. Transient; discarded after
/// decoding.
#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(default)]
    value: String,
    #[serde(default)]
    partition: i64,
    #[serde(default)]
    offset: i64,
}

/// Decoder for the header-block-plus-body envelope format.
///
/// The header grammar is deliberately naive: lines are recognised by
/// scanning for a `key:` token followed by a run of value characters, and
/// anything in the header block that does not match is skipped.
pub(crate) struct MessageParser {
    header_line: Regex,
    header_key: Regex,
    header_value: Regex,
}

impl MessageParser {
    pub(crate) fn new() -> Self {
        Self {
            header_line: Regex::new(r"[\w\-]*:[\w\-:/.+;= ]*").expect("invalid header pattern"),
            header_key: Regex::new(r"[\w\-]*:").expect("invalid header key pattern"),
            header_value: Regex::new(r":[\w\-:/.+;= ]*").expect("invalid header value pattern"),
        }
    }

    /// Decodes a poll response into messages.
    ///
    /// Records whose payload cannot be decoded are logged with their
    /// partition and offset and dropped; they never abort the batch.
    pub(crate) fn parse_response(&self, data: &[u8]) -> Result<Vec<Message>, ParseError> {
        let records: Vec<RawRecord> = serde_json::from_slice(data)?;

        let mut messages = Vec::with_capacity(records.len());
        for record in records {
            match self.parse_message(&record.value) {
                Ok(message) => messages.push(message),
                Err(e) => error!(
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Error parsing message, skipping record"
                ),
            }
        }
        Ok(messages)
    }

    fn parse_message(&self, raw: &str) -> Result<Message, ParseError> {
        let decoded = BASE64.decode(raw)?;
        let content = String::from_utf8_lossy(&decoded);

        let Some(separator) = header_section_end(&content) else {
            warn!("Message has no header separator, treating content as body");
            return Ok(Message {
                headers: HashMap::new(),
                body: content.trim().to_string(),
            });
        };

        Ok(Message {
            headers: self.parse_headers(&content[..separator]),
            body: content[separator..].trim().to_string(),
        })
    }

    fn parse_headers(&self, section: &str) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        for line in self.header_line.find_iter(section) {
            let (key, value) = self.parse_header(line.as_str());
            headers.insert(key, value);
        }
        headers
    }

    fn parse_header(&self, line: &str) -> (String, String) {
        let key = self
            .header_key
            .find(line)
            .map(|m| m.as_str().trim_end_matches(':').to_string())
            .unwrap_or_default();
        let value = self
            .header_value
            .find(line)
            .map(|m| m.as_str()[1..].trim().to_string())
            .unwrap_or_default();
        (key, value)
    }
}

/// Index of the blank line between the header block and the body.
fn header_section_end(content: &str) -> Option<usize> {
    // the envelope format uses CRLF line endings; fall back to UNIX ones
    content.find("\r\n\r\n").or_else(|| content.find("\n\n"))
}
