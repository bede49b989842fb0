//-
// Copyright (c) 2015, 2016, Lavaboom Ltd
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

//! DKIM (RFC 6376) signature generation.
//!
//! Only the signing half of the protocol lives here; this process never
//! verifies inbound signatures. A `DomainSigner` is bound to a (domain,
//! selector, private key) triple loaded from the key store and stamps a
//! `DKIM-Signature` header onto fully rendered outbound messages.

mod canonicalisation;
mod error;
mod hash;
mod header;
mod sign;

pub use canonicalisation::{
    BodyCanonicalisation, Canonicalisation, HeaderCanonicalisation,
};
pub use error::Error;
pub use header::{Header, RawHeader, SignatureAlgorithm, HEADER_NAME};
pub use sign::DomainSigner;

/// Splits a rendered message into its header block and body.
///
/// If the message has no blank line, the whole input is the header block.
pub(crate) fn split_message(message: &[u8]) -> (&[u8], &[u8]) {
    match message
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
    {
        Some(ix) => (&message[..ix], &message[ix + 4..]),
        None => (message, &[]),
    }
}
