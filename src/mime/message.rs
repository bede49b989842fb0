//-
// Copyright (c) 2015, Lavaboom Ltd
//
// This file is part of Lavamail.
//
// Lavamail is free software: you can  redistribute it and/or modify it under
// the terms  of the GNU  General Public License  as published by  the Free
// Software Foundation, either version 3  of the License, or (at your option)
// any later version.
//
// Lavamail is distributed  in the hope that it will  be useful, but WITHOUT
// ANY WARRANTY;  without even  the implied warranty  of MERCHANTABILITY  or
// FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Lavamail. If not, see <http://www.gnu.org/licenses/>.

//! The parsed message tree and its byte-level codec.
//!
//! `parse` turns an RFC 5322/2045 byte stream into a tree of `Message`
//! nodes: composite (`multipart/*`) nodes carry children and an empty body,
//! leaves carry the transfer-decoded payload. `encode` re-emits a tree with
//! freshly generated multipart boundaries; payloads round-trip decoded, so
//! a parse→encode cycle preserves structure, headers and bodies but not the
//! original transfer encoding or boundary strings.
//!
//! Relevant standards:
//!   [RFC 5322] Header block syntax
//!   [RFC 2045] Content-Type, Content-Transfer-Encoding
//!   [RFC 2046] Multipart structure

use std::fmt;

use super::content_encoding::{base64_decode, qp_decode};
use crate::support::error::Error;
use crate::support::rand_token;

/// Trees nested deeper than this are rejected outright rather than parsed.
pub const DEFAULT_MAX_DEPTH: usize = 100;

/// An ordered, case-insensitive multimap of header names to values.
///
/// Names keep the capitalisation they arrived with; lookups are
/// case-insensitive and return values in insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the first value of the named header, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|&&(ref n, _)| n.eq_ignore_ascii_case(name))
            .map(|&(_, ref v)| v.as_str())
    }

    /// Appends a header, keeping any existing values of the same name.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.entries
            .iter()
            .map(|&(ref n, ref v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A parsed `Content-Type` (or `Content-Disposition`) value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaType {
    /// The media range, lowercased, e.g. `multipart/signed`.
    pub media_type: String,
    params: Vec<(String, String)>,
}

impl MediaType {
    /// Parses a structured header value of the `type; key=value` form.
    ///
    /// This is deliberately lenient: it never fails, unparsable parameters
    /// are dropped, and quoting is undone.
    pub fn parse(value: &str) -> Self {
        let mut segments = value.split(';');
        let media_type = segments
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();

        let mut params = Vec::new();
        for segment in segments {
            let Some((k, v)) = segment.split_once('=') else {
                continue;
            };

            let k = k.trim().to_ascii_lowercase();
            let v = v.trim();
            let v = v
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(v);
            params.push((k, v.to_owned()));
        }

        Self { media_type, params }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|&&(ref n, _)| n == name)
            .map(|&(_, ref v)| v.as_str())
    }

    pub fn is_multipart(&self) -> bool {
        self.media_type.starts_with("multipart/")
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.media_type)?;
        for &(ref k, ref v) in &self.params {
            write!(f, "; {}=\"{}\"", k, v)?;
        }
        Ok(())
    }
}

/// One node of a parsed message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    pub headers: HeaderMap,
    /// Transfer-decoded payload; empty for composite nodes.
    pub body: Vec<u8>,
    /// Child parts; empty for leaves.
    pub children: Vec<Message>,
}

impl Message {
    /// Parses a message with the default nesting limit.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        Self::parse_with_limit(data, DEFAULT_MAX_DEPTH)
    }

    /// Parses a message, rejecting trees nested deeper than `max_depth`.
    pub fn parse_with_limit(
        data: &[u8],
        max_depth: usize,
    ) -> Result<Self, Error> {
        Self::parse_at(data, 0, max_depth)
    }

    fn parse_at(
        data: &[u8],
        depth: usize,
        max_depth: usize,
    ) -> Result<Self, Error> {
        if depth >= max_depth {
            return Err(Error::NestingTooDeep);
        }

        let (headers, body) = split_header_block(data)?;

        let mut message = Message {
            headers,
            body: Vec::new(),
            children: Vec::new(),
        };

        // Default Content-Type is text/plain
        if !message.headers.contains("Content-Type") {
            message.headers.add("Content-Type", "text/plain");
        }

        let content_type = message.content_type();
        if !content_type.is_multipart() {
            message.body = decode_transfer_encoding(
                message.headers.get("Content-Transfer-Encoding"),
                body,
            );
            return Ok(message);
        }

        let boundary = content_type
            .param("boundary")
            .ok_or(Error::MissingBoundary)?
            .to_owned();

        for part in split_multipart(body, &boundary) {
            message
                .children
                .push(Self::parse_at(part, depth + 1, max_depth)?);
        }

        Ok(message)
    }

    /// The parsed Content-Type of this node (`text/plain` if absent).
    pub fn content_type(&self) -> MediaType {
        MediaType::parse(self.headers.get("Content-Type").unwrap_or("text/plain"))
    }

    pub fn is_multipart(&self) -> bool {
        self.content_type().is_multipart()
    }

    /// Re-emits the tree as wire bytes.
    ///
    /// Composite nodes get a freshly generated boundary, and the boundary
    /// parameter in their Content-Type header is rewritten to match, so the
    /// output reparses to a structurally identical tree. Transfer encodings
    /// are not reapplied; bodies are emitted decoded.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let multipart = self.is_multipart();
        let boundary = if multipart {
            Some(rand_token::boundary())
        } else {
            None
        };

        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            if let (true, Some(ref boundary)) = (
                name.eq_ignore_ascii_case("Content-Type"),
                boundary.as_ref(),
            ) {
                out.extend_from_slice(
                    replace_boundary(value, boundary).as_bytes(),
                );
            } else {
                out.extend_from_slice(value.as_bytes());
            }
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(b"\r\n");

        if let Some(boundary) = boundary {
            for child in &self.children {
                out.extend_from_slice(b"--");
                out.extend_from_slice(boundary.as_bytes());
                out.extend_from_slice(b"\r\n");
                child.encode_into(out);
            }
            out.extend_from_slice(b"--");
            out.extend_from_slice(boundary.as_bytes());
            out.extend_from_slice(b"--\r\n");
        } else {
            out.extend_from_slice(&self.body);
            out.extend_from_slice(b"\r\n");
        }
    }
}

/// Splits a raw message into its unfolded header map and body bytes.
fn split_header_block(data: &[u8]) -> Result<(HeaderMap, &[u8]), Error> {
    let mut headers = HeaderMap::new();
    let mut current: Option<(String, String)> = None;
    let mut rest = data;

    loop {
        let (line, tail) = next_line(rest);
        rest = tail;

        if line.is_empty() {
            // Blank line: end of header block. A message with no body and no
            // blank line also ends up here via EOF.
            break;
        }

        if line[0] == b' ' || line[0] == b'\t' {
            // Folded continuation of the previous header
            let Some((_, ref mut value)) = current else {
                return Err(Error::MalformedHeaders);
            };
            value.push(' ');
            value.push_str(
                String::from_utf8_lossy(line)
                    .trim_matches(|c| c == ' ' || c == '\t'),
            );
            continue;
        }

        if let Some((name, value)) = current.take() {
            headers.add(name, value);
        }

        let line = String::from_utf8_lossy(line);
        let Some((name, value)) = line.split_once(':') else {
            return Err(Error::MalformedHeaders);
        };
        current = Some((name.trim().to_owned(), value.trim().to_owned()));

        if rest.is_empty() {
            break;
        }
    }

    if let Some((name, value)) = current.take() {
        headers.add(name, value);
    }

    Ok((headers, rest))
}

/// Returns the next line (without its ending) and the remaining input.
fn next_line(data: &[u8]) -> (&[u8], &[u8]) {
    match data.iter().position(|&b| b == b'\n') {
        Some(ix) => {
            let line = &data[..ix];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            (line, &data[ix + 1..])
        },
        None => (data, &[]),
    }
}

fn decode_transfer_encoding(encoding: Option<&str>, body: &[u8]) -> Vec<u8> {
    match encoding
        .map(|e| e.trim().to_ascii_lowercase())
        .as_deref()
    {
        Some("base64") => {
            // Tolerate broken base64 by passing it through verbatim.
            base64_decode(body).unwrap_or_else(|| body.to_vec())
        },
        Some("quoted-printable") => qp_decode(body).into_owned(),
        // Unknown encodings (and 7bit/8bit/binary) pass through verbatim.
        _ => body.to_vec(),
    }
}

/// Splits a multipart body on the given boundary into part byte slices.
///
/// The preamble and epilogue are discarded. Transport padding after the
/// boundary marker is tolerated.
fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> Vec<&'a [u8]> {
    let delimiter = format!("--{}", boundary);
    let closing = format!("--{}--", boundary);

    let mut parts = Vec::new();
    let mut part_start: Option<usize> = None;
    let mut offset = 0usize;
    let mut rest = body;

    while !rest.is_empty() {
        let (line, tail) = next_line(rest);
        let line_len = rest.len() - tail.len();
        let trimmed: &[u8] = match line.iter().rposition(|&b| b != b' ' && b != b'\t')
        {
            Some(ix) => &line[..=ix],
            None => &[],
        };

        let is_closing = trimmed == closing.as_bytes();
        if is_closing || trimmed == delimiter.as_bytes() {
            if let Some(start) = part_start {
                // The line break before the delimiter belongs to the
                // delimiter, not the part.
                let mut end = offset;
                if end > start && body[end - 1] == b'\n' {
                    end -= 1;
                    if end > start && body[end - 1] == b'\r' {
                        end -= 1;
                    }
                }
                parts.push(&body[start..end]);
            }

            if is_closing {
                return parts;
            }

            part_start = Some(offset + line_len);
        }

        offset += line_len;
        rest = tail;
    }

    // Unterminated multipart; treat EOF as the closing delimiter.
    if let Some(start) = part_start {
        parts.push(&body[start..]);
    }
    parts
}

/// Replaces (or appends) the boundary parameter in a Content-Type value.
fn replace_boundary(value: &str, boundary: &str) -> String {
    lazy_static::lazy_static! {
        static ref RX_BOUNDARY: regex::Regex =
            regex::Regex::new(r#"(?i)boundary="?[^";]*"?"#).unwrap();
    }

    if RX_BOUNDARY.is_match(value) {
        RX_BOUNDARY
            .replace(value, format!("boundary=\"{}\"", boundary).as_str())
            .into_owned()
    } else {
        format!("{}; boundary=\"{}\"", value, boundary)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_simple_leaf() {
        let message = Message::parse(
            b"From: alice@example.com\r\n\
              Subject: hi\r\n\
              \r\n\
              hello world\r\n",
        )
        .unwrap();

        assert_eq!(Some("alice@example.com"), message.headers.get("from"));
        assert_eq!(Some("hi"), message.headers.get("SUBJECT"));
        assert_eq!(3, message.headers.len());
        // Missing Content-Type defaults to text/plain
        assert_eq!("text/plain", message.content_type().media_type);
        assert_eq!(b"hello world\r\n".to_vec(), message.body);
        assert!(message.children.is_empty());
    }

    #[test]
    fn parse_unfolds_headers() {
        let message = Message::parse(
            b"Subject: a very\r\n\
              \tlong subject\r\n\
              \r\n\
              body",
        )
        .unwrap();
        assert_eq!(
            Some("a very long subject"),
            message.headers.get("Subject"),
        );
    }

    #[test]
    fn parse_decodes_base64() {
        let message = Message::parse(
            b"Content-Type: application/octet-stream\r\n\
              Content-Transfer-Encoding: base64\r\n\
              \r\n\
              UERGIQ==\r\n",
        )
        .unwrap();
        assert_eq!(b"PDF!".to_vec(), message.body);
    }

    #[test]
    fn parse_decodes_quoted_printable() {
        let message = Message::parse(
            b"Content-Transfer-Encoding: quoted-printable\r\n\
              \r\n\
              na=C3=AFve",
        )
        .unwrap();
        assert_eq!("naïve".as_bytes().to_vec(), message.body);
    }

    #[test]
    fn parse_passes_unknown_encoding_through() {
        let message = Message::parse(
            b"Content-Transfer-Encoding: x-uuencode\r\n\
              \r\n\
              verbatim =AB bytes",
        )
        .unwrap();
        assert_eq!(b"verbatim =AB bytes".to_vec(), message.body);
    }

    #[test]
    fn parse_multipart() {
        let message = Message::parse(
            b"Content-Type: multipart/mixed; boundary=\"xyz\"\r\n\
              \r\n\
              preamble to be ignored\r\n\
              --xyz\r\n\
              Content-Type: text/plain\r\n\
              \r\n\
              part one\r\n\
              --xyz\r\n\
              Content-Type: text/html\r\n\
              \r\n\
              <p>part two</p>\r\n\
              --xyz--\r\n\
              epilogue\r\n",
        )
        .unwrap();

        assert!(message.body.is_empty());
        assert_eq!(2, message.children.len());
        assert_eq!(b"part one".to_vec(), message.children[0].body);
        assert_eq!(
            "text/html",
            message.children[1].content_type().media_type,
        );
        assert_eq!(b"<p>part two</p>".to_vec(), message.children[1].body);
    }

    #[test]
    fn parse_nested_multipart() {
        let message = Message::parse(
            b"Content-Type: multipart/mixed; boundary=outer\r\n\
              \r\n\
              --outer\r\n\
              Content-Type: multipart/alternative; boundary=inner\r\n\
              \r\n\
              --inner\r\n\
              \r\n\
              plain\r\n\
              --inner\r\n\
              Content-Type: text/html\r\n\
              \r\n\
              html\r\n\
              --inner--\r\n\
              --outer--\r\n",
        )
        .unwrap();

        assert_eq!(1, message.children.len());
        assert_eq!(2, message.children[0].children.len());
        assert_eq!(
            b"plain".to_vec(),
            message.children[0].children[0].body,
        );
    }

    #[test]
    fn parse_requires_boundary() {
        assert_matches!(
            Err(Error::MissingBoundary),
            Message::parse(b"Content-Type: multipart/mixed\r\n\r\nbody"),
        );
    }

    #[test]
    fn parse_rejects_deep_nesting() {
        let mut data = b"Content-Type: text/plain\r\n\r\nx".to_vec();
        for i in 0..120 {
            let mut outer = format!(
                "Content-Type: multipart/mixed; boundary=b{}\r\n\r\n--b{}\r\n",
                i, i,
            )
            .into_bytes();
            outer.extend_from_slice(&data);
            outer.extend_from_slice(format!("\r\n--b{}--\r\n", i).as_bytes());
            data = outer;
        }
        assert_matches!(Err(Error::NestingTooDeep), Message::parse(&data));

        // But 120 levels parse fine with a raised limit.
        assert!(Message::parse_with_limit(&data, 200).is_ok());
    }

    #[test]
    fn encode_leaf() {
        let mut message = Message::default();
        message.headers.add("Content-Type", "text/plain");
        message.headers.add("Subject", "hi");
        message.body = b"hello".to_vec();

        assert_eq!(
            b"Content-Type: text/plain\r\nSubject: hi\r\n\r\nhello\r\n"
                .to_vec(),
            message.encode(),
        );
    }

    #[test]
    fn round_trip_is_structurally_identical() {
        // No transfer encodings here: re-emission writes bodies decoded
        // without rewriting Content-Transfer-Encoding headers, so only
        // messages free of that ambiguity round-trip exactly.
        let original = Message::parse(
            b"Content-Type: multipart/mixed; boundary=\"abc\"\r\n\
              Subject: files\r\n\
              \r\n\
              --abc\r\n\
              Content-Type: text/plain\r\n\
              \r\n\
              the body\r\n\
              --abc\r\n\
              Content-Type: application/pdf\r\n\
              Content-Disposition: attachment; filename=\"a.pdf\"\r\n\
              \r\n\
              PDF!\r\n\
              --abc--\r\n",
        )
        .unwrap();

        let reparsed = Message::parse(&original.encode()).unwrap();

        assert_eq!(original.children.len(), reparsed.children.len());
        assert_eq!(
            original.headers.get("Subject"),
            reparsed.headers.get("Subject"),
        );
        // Same media range, different boundary
        assert_eq!(
            original.content_type().media_type,
            reparsed.content_type().media_type,
        );
        assert_ne!(
            original.content_type().param("boundary"),
            reparsed.content_type().param("boundary"),
        );
        // Bodies round-trip decoded
        assert_eq!(original.children[0].body, reparsed.children[0].body);
        assert_eq!(b"PDF!".to_vec(), reparsed.children[1].body);
        assert_eq!(
            original.children[1].headers.get("Content-Disposition"),
            reparsed.children[1].headers.get("Content-Disposition"),
        );
    }

    #[test]
    fn encoded_boundaries_are_long_and_fresh() {
        let message = Message::parse(
            b"Content-Type: multipart/mixed; boundary=b\r\n\
              \r\n\
              --b\r\n\
              \r\n\
              x\r\n\
              --b--\r\n",
        )
        .unwrap();

        let first = Message::parse(&message.encode()).unwrap();
        let second = Message::parse(&message.encode()).unwrap();
        let b1 = first.content_type().param("boundary").unwrap().to_owned();
        let b2 = second.content_type().param("boundary").unwrap().to_owned();
        assert!(b1.len() >= 20);
        assert_ne!(b1, b2);
    }

    #[test]
    fn media_type_parsing() {
        let mt = MediaType::parse(
            "Multipart/Signed; protocol=\"application/pgp-signature\"; \
             micalg=pgp-sha256",
        );
        assert_eq!("multipart/signed", mt.media_type);
        assert_eq!(Some("application/pgp-signature"), mt.param("protocol"));
        assert_eq!(Some("pgp-sha256"), mt.param("micalg"));
        assert_eq!(None, mt.param("boundary"));
    }
}
