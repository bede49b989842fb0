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

//! The two hash inputs of RFC 6376 § 3.7.

use lazy_static::lazy_static;

use super::{Error, Header};

lazy_static! {
    /// One full header line including folded continuations, excluding the
    /// final line ending. Group 1 is the whole line, group 2 the name.
    static ref FULL_HEADER_LINE: regex::bytes::Regex =
        regex::bytes::Regex::new(
            r"(?m)^(([!-9;-~]+):[^\r\n]*(?:\r?\n[ \t][^\r\n]*)*)"
        )
        .unwrap();
}

/// Computes the `bh=` value for the given body.
pub(super) fn body_hash(
    header: &Header,
    body: &[u8],
) -> Result<Vec<u8>, Error> {
    let canonical = header.canonicalisation.body.canonicalise(body);
    let digest = openssl::hash::hash(
        openssl::hash::MessageDigest::sha256(),
        &canonical,
    )?;
    Ok(digest.to_vec())
}

/// Generates the data over which the signature itself is computed.
///
/// `header_block` is the message's raw header block. For each name in the
/// `h=` list, the *last* occurrence of that header in the block not already
/// consumed by an earlier repeat of the name is canonicalised and fed in;
/// names with no remaining occurrence are skipped entirely. The
/// DKIM-Signature header under construction comes last, with the `b=` value
/// cut out and no trailing line ending.
pub(super) fn header_hash_data(
    header: &Header,
    header_block: &[u8],
) -> Vec<u8> {
    let mut lines = Vec::<(&str, &str)>::new();
    for m in FULL_HEADER_LINE.captures_iter(header_block) {
        // Header values are supposed to be UTF-8 if they are 8-bit at all;
        // anything else is skipped rather than mangled.
        let (Ok(line), Ok(name)) = (
            std::str::from_utf8(m.get(1).unwrap().as_bytes()),
            std::str::from_utf8(m.get(2).unwrap().as_bytes()),
        ) else {
            continue;
        };
        lines.push((name, line));
    }

    let mut out = String::new();
    let mut consumed = vec![false; lines.len()];
    for target in &header.signed_headers {
        let found = lines
            .iter()
            .enumerate()
            .rev()
            .find(|&(ix, &(name, _))| {
                !consumed[ix] && name.eq_ignore_ascii_case(target)
            });

        let Some((ix, &(_, line))) = found else {
            continue;
        };
        consumed[ix] = true;

        out.push_str(
            &header.canonicalisation.header.canonicalise(line, ""),
        );
        out.push_str("\r\n");
    }

    let raw = header.raw();
    out.push_str(&header.canonicalisation.header.canonicalise(
        &raw.text[..raw.b.start],
        &raw.text[raw.b.end..],
    ));
    // No line ending after the DKIM-Signature header itself

    out.into_bytes()
}

#[cfg(test)]
mod test {
    use chrono::prelude::*;

    use super::super::{
        Canonicalisation, HeaderCanonicalisation, SignatureAlgorithm,
    };
    use super::*;
    use crate::support::chronox::*;

    fn header_with(signed: Vec<&'static str>) -> Header {
        let mut header = Header::template(
            SignatureAlgorithm::Rsa,
            "example.com".to_owned(),
            "sel".to_owned(),
            NaiveDate::from_ymdx(2015, 4, 1).and_hmsx_utc(0, 0, 0),
        );
        header.signed_headers = signed;
        header.expiration = None;
        header
    }

    #[test]
    fn body_hash_is_sha256_of_canonical_body() {
        let header = header_with(vec!["From"]);
        // Simple canonicalisation appends the final CRLF
        let hash = body_hash(&header, b"hello").unwrap();
        let expected = openssl::hash::hash(
            openssl::hash::MessageDigest::sha256(),
            b"hello\r\n",
        )
        .unwrap();
        assert_eq!(expected.to_vec(), hash);
    }

    #[test]
    fn hash_data_picks_last_occurrence_and_handles_repeats() {
        let mut header = header_with(vec![
            "From",
            "To",
            "From",
            "Content-Location",
            "Subject",
        ]);
        header.canonicalisation = Canonicalisation {
            header: HeaderCanonicalisation::Simple,
            body: Default::default(),
        };

        let data = header_hash_data(
            &header,
            b"FrOm: first from header\r\n\
              To: to header\r\n\
              from: second from header\r\n\
              foo: bar\r\n\
              FROM: third from header\r\n",
        );
        let data = String::from_utf8(data).unwrap();

        assert!(data.starts_with(
            "FROM: third from header\r\n\
             To: to header\r\n\
             from: second from header\r\n"
        ));
        // Content-Location is absent and contributes nothing
        assert!(!data.contains("Content-Location"));
        // The under-construction signature header comes last, without CRLF
        assert!(data.contains("DKIM-Signature: v=1;"));
        assert!(data.ends_with("b="));
    }

    #[test]
    fn hash_data_unfolds_for_relaxed() {
        let header = header_with(vec!["Subject"]);
        let data = header_hash_data(
            &header,
            b"Subject: folded\r\n\tacross lines\r\n",
        );
        let data = String::from_utf8(data).unwrap();
        assert!(data.starts_with("subject:folded across lines\r\n"));
    }
}
