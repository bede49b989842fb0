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

use std::ops::Range;

use chrono::prelude::*;

use super::Canonicalisation;

pub const HEADER_NAME: &str = "DKIM-Signature";

/// The signature algorithms we can produce, dictated by the key type.
///
/// The hash half of the `a=` tag is always SHA-256; RFC 8301 retired SHA-1
/// and nothing still requires it on the signing side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    /// RFC 6376
    Rsa,
    /// RFC 8463
    Ed25519,
}

impl SignatureAlgorithm {
    fn a_tag(self) -> &'static str {
        match self {
            Self::Rsa => "rsa-sha256",
            Self::Ed25519 => "ed25519-sha256",
        }
    }
}

/// An in-memory `DKIM-Signature` header under construction.
#[derive(Clone, Debug)]
pub struct Header {
    pub algorithm: SignatureAlgorithm,
    pub canonicalisation: Canonicalisation,
    /// The `d=` tag.
    pub sdid: String,
    /// The `s=` tag.
    pub selector: String,
    /// The `h=` tag.
    pub signed_headers: Vec<&'static str>,
    /// The `t=` tag.
    pub timestamp: DateTime<Utc>,
    /// The `x=` tag.
    pub expiration: Option<DateTime<Utc>>,
    /// The `bh=` tag, raw; empty until the body has been hashed.
    pub body_hash: Vec<u8>,
    /// The `b=` tag, raw; empty until signing completes.
    pub signature: Vec<u8>,
}

/// The headers every signature covers.
const SIGNED_HEADERS: &[&str] = &[
    "CC",
    "Content-Type",
    "Date",
    "From",
    "In-Reply-To",
    "Message-ID",
    "References",
    "Reply-To",
    "Subject",
    "To",
];

const SIGNATURE_LIFETIME_DAYS: i64 = 7;

impl Header {
    /// The production signing template: relaxed/simple canonicalisation and
    /// the standard covered-header set.
    pub fn template(
        algorithm: SignatureAlgorithm,
        sdid: String,
        selector: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            algorithm,
            canonicalisation: Canonicalisation {
                header: super::HeaderCanonicalisation::Relaxed,
                // Simple is required to pass binary content reliably.
                body: super::BodyCanonicalisation::Simple,
            },
            sdid,
            selector,
            signed_headers: SIGNED_HEADERS.to_vec(),
            timestamp: now,
            expiration: Some(
                now + chrono::Duration::days(SIGNATURE_LIFETIME_DAYS),
            ),
            body_hash: Vec::new(),
            signature: Vec::new(),
        }
    }

    /// Renders the header, folded for transport.
    ///
    /// The returned range covers the `b=` value, which is the part excluded
    /// from the header hash; while the signature is still empty the range is
    /// empty and the rendering is exactly the hashing input form.
    pub fn raw(&self) -> RawHeader {
        let mut text = format!("{}:", HEADER_NAME);
        let mut column = text.len();

        fold_push(&mut text, &mut column, "v=1;");
        fold_push(
            &mut text,
            &mut column,
            &format!("a={};", self.algorithm.a_tag()),
        );
        fold_push(
            &mut text,
            &mut column,
            &format!("c={};", self.canonicalisation),
        );
        fold_push(&mut text, &mut column, &format!("d={};", self.sdid));
        fold_push(&mut text, &mut column, "q=dns/txt;");
        fold_push(&mut text, &mut column, &format!("s={};", self.selector));
        fold_push(
            &mut text,
            &mut column,
            &format!("t={};", self.timestamp.timestamp()),
        );
        if let Some(expiration) = self.expiration {
            fold_push(
                &mut text,
                &mut column,
                &format!("x={};", expiration.timestamp()),
            );
        }

        for (ix, name) in self.signed_headers.iter().enumerate() {
            if 0 == ix {
                fold_push(&mut text, &mut column, &format!("h={}", name));
            } else {
                fold_push(&mut text, &mut column, &format!(":{}", name));
            }
        }
        text.push(';');
        column += 1;

        let bh = base64::encode(&self.body_hash);
        if bh.is_empty() {
            fold_push(&mut text, &mut column, "bh=");
        }
        for (ix, chunk) in chunks(&bh, 64).enumerate() {
            if 0 == ix {
                fold_push(&mut text, &mut column, &format!("bh={}", chunk));
            } else {
                fold_push(&mut text, &mut column, chunk);
            }
        }
        text.push(';');
        column += 1;

        fold_push(&mut text, &mut column, "b=");
        let b_start = text.len();
        let b = base64::encode(&self.signature);
        for chunk in chunks(&b, 64) {
            if column + chunk.len() > MAX_LINE {
                text.push_str("\r\n\t");
                column = 1;
            }
            text.push_str(chunk);
            column += chunk.len();
        }
        let b_end = text.len();

        RawHeader {
            text,
            b: b_start..b_end,
        }
    }
}

/// A rendered `DKIM-Signature` header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawHeader {
    /// The full header, starting at the first byte of `DKIM-Signature` and
    /// extending to but not including the line ending that terminates it.
    pub text: String,
    /// The range in `text` of the `b=` value, i.e. the portion which is
    /// *not* input to the header hash.
    pub b: Range<usize>,
}

const MAX_LINE: usize = 77;

fn fold_push(text: &mut String, column: &mut usize, token: &str) {
    if *column + token.len() + 1 > MAX_LINE {
        text.push_str("\r\n\t");
        *column = 1 + token.len();
    } else {
        text.push(' ');
        *column += token.len() + 1;
    }
    text.push_str(token);
}

fn chunks(s: &str, size: usize) -> impl Iterator<Item = &str> {
    s.as_bytes().chunks(size).map(|c| {
        // base64 output is pure ASCII, so any byte split is a char split
        std::str::from_utf8(c).expect("base64 output was not ASCII")
    })
}

#[cfg(test)]
mod test {
    use super::super::{
        BodyCanonicalisation, HeaderCanonicalisation, split_message,
    };
    use super::*;
    use crate::support::chronox::*;

    fn template() -> Header {
        Header::template(
            SignatureAlgorithm::Rsa,
            "example.com".to_owned(),
            "mail".to_owned(),
            NaiveDate::from_ymdx(2015, 4, 1).and_hmsx_utc(12, 0, 0),
        )
    }

    #[test]
    fn template_defaults() {
        let header = template();
        assert_eq!(
            HeaderCanonicalisation::Relaxed,
            header.canonicalisation.header,
        );
        assert_eq!(
            BodyCanonicalisation::Simple,
            header.canonicalisation.body,
        );
        assert!(header.signed_headers.contains(&"From"));
        assert!(header.expiration.unwrap() > header.timestamp);
    }

    #[test]
    fn raw_rendering_before_signing() {
        let header = template();
        let raw = header.raw();

        assert!(raw.text.starts_with("DKIM-Signature: v=1; a=rsa-sha256;"));
        assert!(raw.text.contains("c=relaxed/simple;"));
        assert!(raw.text.contains("d=example.com;"));
        assert!(raw.text.contains("s=mail;"));
        assert!(raw.text.contains("h=CC:Content-Type"));
        // Empty signature renders as an empty b= at the very end
        assert!(raw.text.ends_with("b="));
        assert_eq!(raw.b, raw.text.len()..raw.text.len());
        // Folded continuation lines all start with whitespace
        for line in raw.text.split("\r\n").skip(1) {
            assert!(line.starts_with('\t') || line.starts_with(' '));
        }
        for line in raw.text.split("\r\n") {
            assert!(line.len() <= 78, "line too long: {:?}", line);
        }
    }

    #[test]
    fn raw_rendering_with_signature_tracks_b_range() {
        let mut header = template();
        header.body_hash = vec![0xAB; 32];
        header.signature = vec![0xCD; 128];
        let raw = header.raw();

        let without_b: String = format!(
            "{}{}",
            &raw.text[..raw.b.start],
            &raw.text[raw.b.end..],
        );
        assert!(without_b.ends_with("b="));

        // The b= value decodes back to the signature after unfolding
        let folded = &raw.text[raw.b.clone()];
        let unfolded: String = folded
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        assert_eq!(vec![0xCD; 128], base64::decode(unfolded).unwrap());
    }

    #[test]
    fn split_message_basic() {
        let (header, body) = split_message(b"A: 1\r\nB: 2\r\n\r\nbody");
        assert_eq!(b"A: 1\r\nB: 2", header);
        assert_eq!(b"body", body);

        let (header, body) = split_message(b"A: 1\r\n");
        assert_eq!(b"A: 1\r\n", header);
        assert_eq!(b"", body);
    }
}
