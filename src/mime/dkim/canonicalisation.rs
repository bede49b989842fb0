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

//! RFC 6376 § 3.4 header and body canonicalisation.

use std::fmt;

const FWS: &[char] = &[' ', '\t', '\r', '\n'];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BodyCanonicalisation {
    /// RFC 6376
    #[default]
    Simple,
    /// RFC 6376
    Relaxed,
}

impl fmt::Display for BodyCanonicalisation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Simple => write!(f, "simple"),
            Self::Relaxed => write!(f, "relaxed"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum HeaderCanonicalisation {
    /// RFC 6376
    #[default]
    Simple,
    /// RFC 6376
    Relaxed,
}

impl fmt::Display for HeaderCanonicalisation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Simple => write!(f, "simple"),
            Self::Relaxed => write!(f, "relaxed"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Canonicalisation {
    pub header: HeaderCanonicalisation,
    pub body: BodyCanonicalisation,
}

impl fmt::Display for Canonicalisation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.header, self.body)
    }
}

impl HeaderCanonicalisation {
    /// Canonicalises one header line.
    ///
    /// `start` and `end` combined are the full header line, excluding the
    /// final line ending (interior folds stay in). `end` exists so the
    /// DKIM-Signature header itself can be hashed with the `b=` value cut
    /// out; it is empty for ordinary headers.
    pub(super) fn canonicalise(self, start: &str, end: &str) -> String {
        match self {
            // RFC 6376 § 3.4.1
            Self::Simple => format!("{}{}", start, end),

            // RFC 6376 § 3.4.2: unfold, drop WSP around the colon, lowercase
            // the name, collapse WSP runs in the value to single spaces.
            Self::Relaxed => {
                let mut out = String::new();

                let mut start = start.trim_matches(FWS);
                if let Some((name, value)) = start.split_once(':') {
                    out.push_str(
                        &name.trim_matches(FWS).to_lowercase(),
                    );
                    out.push(':');
                    start = value.trim_matches(FWS);
                }

                // WSP runs collapse within each chunk, but not across the
                // chunk seam: the cut at `b=` is not a WSP boundary.
                for chunk in [start, end] {
                    for (ix, word) in chunk
                        .split(FWS)
                        .filter(|w| !w.is_empty())
                        .enumerate()
                    {
                        if ix != 0 {
                            out.push(' ');
                        }
                        out.push_str(word);
                    }
                }

                out
            },
        }
    }
}

impl BodyCanonicalisation {
    /// Canonicalises a whole message body.
    ///
    /// "Line" here means a CRLF-terminated line, taken extremely literally:
    /// lone CR or LF bytes are binary data and pass through, which matches
    /// what the rest of the DKIM ecosystem does to such messages.
    pub(super) fn canonicalise(self, body: &[u8]) -> Vec<u8> {
        let mut lines: Vec<Vec<u8>> = split_crlf_lines(body)
            .into_iter()
            .map(|line| match self {
                // RFC 6376 § 3.4.3
                Self::Simple => line.to_vec(),
                // RFC 6376 § 3.4.4: collapse WSP runs, strip trailing WSP
                Self::Relaxed => {
                    let mut out = Vec::with_capacity(line.len());
                    let mut pending_space = false;
                    for &b in line {
                        match b {
                            b' ' | b'\t' => pending_space = true,
                            b => {
                                if pending_space {
                                    out.push(b' ');
                                    pending_space = false;
                                }
                                out.push(b);
                            },
                        }
                    }
                    out
                },
            })
            .collect();

        // Both modes: drop trailing empty lines, terminate with one CRLF.
        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }

        let mut out = Vec::new();
        for (ix, line) in lines.iter().enumerate() {
            if ix != 0 {
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(line);
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Splits on literal CRLF pairs only.
fn split_crlf_lines(body: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut rest = body;
    loop {
        match rest.windows(2).position(|w| w == b"\r\n") {
            Some(ix) => {
                lines.push(&rest[..ix]);
                rest = &rest[ix + 2..];
            },
            None => {
                lines.push(rest);
                return lines;
            },
        }
    }
}
