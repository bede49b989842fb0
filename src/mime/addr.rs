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

//! Minimal RFC 5322 mailbox handling.
//!
//! This parses the two shapes that actually occur in the pipeline (bare
//! addr-specs and `Display Name <addr-spec>`) and renders them back. The
//! full RFC 5322 grammar (groups, comments, obsolete routes) is out of
//! scope; callers that parse user-supplied headers fall back to the raw
//! string when parsing fails.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A parsed mailbox: optional display name plus addr-spec.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailAddr {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub address: String,
}

impl MailAddr {
    /// Parses a single mailbox.
    ///
    /// Returns `None` when the input doesn't look like a mailbox at all;
    /// callers decide whether that is an error or a fallback-to-raw case.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }

        if let Some(lt) = input.find('<') {
            let gt = input.rfind('>')?;
            if gt < lt {
                return None;
            }

            let address = input[lt + 1..gt].trim();
            if !is_addr_spec(address) {
                return None;
            }

            let name = input[..lt].trim().trim_matches('"').trim();
            return Some(Self {
                name: name.to_owned(),
                address: address.to_owned(),
            });
        }

        if is_addr_spec(input) {
            return Some(Self {
                name: String::new(),
                address: input.to_owned(),
            });
        }

        None
    }

    /// Parses a mailbox, falling back to a nameless mailbox carrying the
    /// trimmed raw input.
    pub fn parse_lossy(input: &str) -> Self {
        Self::parse(input).unwrap_or_else(|| Self {
            name: String::new(),
            address: input.trim().to_owned(),
        })
    }

    /// The domain part of the address, if there is one.
    pub fn domain(&self) -> Option<&str> {
        self.address.rsplit_once('@').map(|(_, domain)| domain)
    }
}

impl fmt::Display for MailAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "<{}>", self.address)
        } else {
            write!(f, "\"{}\" <{}>", self.name, self.address)
        }
    }
}

fn is_addr_spec(s: &str) -> bool {
    let Some((local, domain)) = s.rsplit_once('@') else {
        return false;
    };

    !local.is_empty()
        && !domain.is_empty()
        && !s.chars().any(|c| {
            c.is_whitespace() || c == '<' || c == '>' || c == ','
        })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_bare_addr_spec() {
        let addr = MailAddr::parse("alice@example.com").unwrap();
        assert_eq!("", addr.name);
        assert_eq!("alice@example.com", addr.address);
        assert_eq!(Some("example.com"), addr.domain());
    }

    #[test]
    fn parse_named_mailbox() {
        let addr = MailAddr::parse("Alice Adams <alice@example.com>").unwrap();
        assert_eq!("Alice Adams", addr.name);
        assert_eq!("alice@example.com", addr.address);

        let quoted = MailAddr::parse("\"Adams, Alice\" <a@example.com>");
        assert_eq!("Adams, Alice", quoted.unwrap().name);
    }

    #[test]
    fn parse_angle_only() {
        let addr = MailAddr::parse("<bob@example.com>").unwrap();
        assert_eq!("", addr.name);
        assert_eq!("bob@example.com", addr.address);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(None, MailAddr::parse(""));
        assert_eq!(None, MailAddr::parse("no at sign"));
        assert_eq!(None, MailAddr::parse("unclosed <a@b"));
        assert_eq!(None, MailAddr::parse("@nodomainlocal"));
    }

    #[test]
    fn parse_lossy_preserves_raw() {
        let addr = MailAddr::parse_lossy("  whatever this is  ");
        assert_eq!("whatever this is", addr.address);
    }

    #[test]
    fn display_round_trips() {
        for s in ["<a@b.com>", "\"Alice\" <alice@example.com>"] {
            let addr = MailAddr::parse(s).unwrap();
            assert_eq!(s, addr.to_string());
        }
    }
}
