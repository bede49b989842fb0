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

//! Content-Transfer-Encoding support: quoted-printable (RFC 2045 § 6.7) and
//! base64 (§ 6.8), in both directions.
//!
//! Decoding never fails. Invalid quoted-printable escapes are passed through
//! untransformed, and base64 is decoded with embedded whitespace and
//! truncated trailing groups tolerated, because real mail contains all of
//! these.

use std::borrow::Cow;
use std::str;

/// Decodes quoted-printable encoding.
///
/// Encoded bytes and soft line endings are both handled, the latter by
/// discarding. UNIX line endings are handled as well as DOS line endings.
/// 8-bit characters are passed through, including invalid UTF-8.
pub fn qp_decode(s: &[u8]) -> Cow<[u8]> {
    let mut transformed = Vec::new();

    let mut split = s.split(|&b| b'=' == b);
    let prefix = split.next();
    let mut first = true;

    for element in split {
        if first {
            if let Some(prefix) = prefix {
                transformed.extend_from_slice(prefix);
            }
            first = false;
        }

        if element.is_empty() {
            // "=" at end of input, or "==": pass the '=' through.
            transformed.push(b'=');
            continue;
        }

        if b'\n' == element[0] {
            // Soft line break with UNIX ending, discard
            transformed.extend_from_slice(&element[1..]);
            continue;
        }

        // All other = sequences are two bytes long
        if element.len() < 2 {
            transformed.push(b'=');
            transformed.extend_from_slice(element);
            continue;
        }

        let encoded = &element[..2];
        let tail = &element[2..];
        if b"\r\n" == encoded {
            // Soft line break with DOS ending, discard
            transformed.extend_from_slice(tail);
            continue;
        }

        if let Some(ch) = str::from_utf8(encoded)
            .ok()
            .and_then(|e| u8::from_str_radix(e, 16).ok())
        {
            // Valid encoded byte
            transformed.push(ch);
            transformed.extend_from_slice(tail);
        } else {
            // Invalid encoding, just push the whole string verbatim
            transformed.push(b'=');
            transformed.extend_from_slice(element);
        }
    }

    if first {
        Cow::Borrowed(s)
    } else {
        Cow::Owned(transformed)
    }
}

const QP_SOFT_LINE_LIMIT: usize = 75;

/// Encodes the given bytes as quoted-printable text.
///
/// Input line endings (both DOS and UNIX) become hard CRLF breaks; lines are
/// kept under the RFC 2045 limit with soft breaks; trailing whitespace on a
/// line is encoded so it survives transport.
pub fn qp_encode(data: &[u8]) -> String {
    let mut out = String::new();
    let mut column = 0usize;

    fn push_encoded(out: &mut String, column: &mut usize, b: u8) {
        if *column + 3 > QP_SOFT_LINE_LIMIT {
            out.push_str("=\r\n");
            *column = 0;
        }
        out.push_str(&format!("={:02X}", b));
        *column += 3;
    }

    fn push_literal(out: &mut String, column: &mut usize, b: u8) {
        if *column + 1 > QP_SOFT_LINE_LIMIT {
            out.push_str("=\r\n");
            *column = 0;
        }
        out.push(b as char);
        *column += 1;
    }

    let mut it = data.iter().copied().peekable();
    while let Some(b) = it.next() {
        match b {
            b'\r' if it.peek() == Some(&b'\n') => {
                it.next();
                out.push_str("\r\n");
                column = 0;
            },
            b'\n' => {
                out.push_str("\r\n");
                column = 0;
            },
            b' ' | b'\t' => {
                // Whitespace that would end up at the end of a line must be
                // encoded to survive transport.
                let at_line_end =
                    matches!(it.peek(), None | Some(b'\r') | Some(b'\n'));
                if at_line_end {
                    push_encoded(&mut out, &mut column, b);
                } else {
                    push_literal(&mut out, &mut column, b);
                }
            },
            b'!'..=b'~' if b != b'=' => {
                push_literal(&mut out, &mut column, b);
            },
            b => push_encoded(&mut out, &mut column, b),
        }
    }

    out
}

/// Decodes base64, ignoring embedded whitespace and other junk characters.
pub fn base64_decode(data: &[u8]) -> Option<Vec<u8>> {
    let filtered = data
        .iter()
        .copied()
        .filter(|&b| {
            matches!(b, b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z'
                     | b'+' | b'/' | b'=')
        })
        .collect::<Vec<u8>>();

    base64::decode_config(
        &filtered,
        base64::Config::new(base64::CharacterSet::Standard, true)
            .decode_allow_trailing_bits(true),
    )
    .ok()
}

const BASE64_LINE_LIMIT: usize = 76;

/// Encodes bytes as base64 wrapped to 76 columns with CRLF breaks.
pub fn base64_encode_wrapped(data: &[u8]) -> String {
    let encoded = base64::encode(data);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / 38);
    let mut rest = encoded.as_str();
    while rest.len() > BASE64_LINE_LIMIT {
        let (line, tail) = rest.split_at(BASE64_LINE_LIMIT);
        out.push_str(line);
        out.push_str("\r\n");
        rest = tail;
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn assert_qp(expected: &[u8], input: &[u8]) {
        let actual = qp_decode(input);
        assert_eq!(expected, &actual[..]);
    }

    #[test]
    fn test_qp_decode() {
        assert_qp(b"hello world", b"hello world");
        assert_qp(b"\xabfoo", b"=ABfoo");
        assert_qp(b"fo\xabo", b"fo=ABo");
        assert_qp(b"foo\xab", b"foo=AB");

        assert_qp(b"foo\xab\xcd", b"foo=AB=CD");
        assert_qp(b"foo\xabbar\xcd", b"foo=ABbar=CD");

        assert_qp(b"foo", b"foo=\n");
        assert_qp(b"foobar", b"foo=\nbar");
        assert_qp(b"foo", b"foo=\r\n");
        assert_qp(b"foobar", b"foo=\r\nbar");

        assert_qp(b"foo=()bar", b"foo=()bar");
        assert_qp(b"foo=\xabbar", b"foo==ABbar");
        assert_qp(b"foo=A\xabbar", b"foo=A=ABbar");
        assert_qp("foo=ゑbar".as_bytes(), "foo=ゑbar".as_bytes());
        assert_qp(b"foo=\x80\x80bar", b"foo=\x80\x80bar");

        assert_qp(b"foo=", b"foo=");
        assert_qp(b"foo=A", b"foo=A");
        assert_qp(b"foo=\r", b"foo=\r");
    }

    #[test]
    fn test_qp_encode() {
        assert_eq!("hello world", qp_encode(b"hello world"));
        assert_eq!("=ABfoo", qp_encode(b"\xabfoo"));
        assert_eq!("a=3Db", qp_encode(b"a=b"));
        assert_eq!("line1\r\nline2", qp_encode(b"line1\nline2"));
        assert_eq!("line1\r\nline2", qp_encode(b"line1\r\nline2"));
        assert_eq!("trailing=20\r\nx", qp_encode(b"trailing \nx"));

        let long = [b'a'; 200];
        let encoded = qp_encode(&long);
        assert!(encoded
            .split("\r\n")
            .all(|line| line.len() <= QP_SOFT_LINE_LIMIT + 1));
        assert_eq!(long.to_vec(), qp_decode(encoded.as_bytes()).into_owned());
    }

    #[test]
    fn test_base64_decode_tolerates_whitespace() {
        assert_eq!(
            Some(b"hello world".to_vec()),
            base64_decode(b"aGVsbG8g\r\nd29ybGQ="),
        );
        assert_eq!(Some(b"PDF!".to_vec()), base64_decode(b"UERGIQ=="));
        assert_eq!(Some(Vec::new()), base64_decode(b""));
    }

    #[test]
    fn test_base64_encode_wrapped() {
        let data = [0xa5u8; 120];
        let encoded = base64_encode_wrapped(&data);
        assert!(encoded.split("\r\n").all(|l| l.len() <= 76));
        assert_eq!(Some(data.to_vec()), base64_decode(encoded.as_bytes()));
    }

    proptest! {
        #[test]
        fn qp_decode_never_fails_for_bytes(
            s in prop::collection::vec(prop::num::u8::ANY, 0..64)
        ) {
            qp_decode(&s);
        }

        #[test]
        fn qp_round_trips(
            s in prop::collection::vec(prop::num::u8::ANY, 0..64)
        ) {
            // Encoding normalises lone \n to CRLF, so compare against the
            // input normalised the same way.
            let mut expected = Vec::new();
            let mut it = s.iter().copied().peekable();
            while let Some(b) = it.next() {
                match b {
                    b'\r' if it.peek() == Some(&b'\n') => {
                        it.next();
                        expected.extend_from_slice(b"\r\n");
                    },
                    b'\n' => expected.extend_from_slice(b"\r\n"),
                    b => expected.push(b),
                }
            }

            let encoded = qp_encode(&s);
            prop_assert_eq!(
                expected,
                qp_decode(encoded.as_bytes()).into_owned()
            );
        }
    }
}
