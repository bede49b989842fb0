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

//! Decides the cryptographic packaging of an inbound message.
//!
//! `multipart/encrypted` is dedicated to PGP/MIME (RFC 3156) and S/MIME.
//! A `multipart/mixed` carrying an `application/x-pgp-manifest` part is our
//! own manifest packaging. A `multipart/signed` wrapper is unwrapped: the
//! signature part is remembered and the classification of the protected
//! part decides the overall kind. Everything else is cleartext.

use crate::mime::message::Message;
use crate::store::models::Kind;
use crate::support::error::Error;

/// Outcome of classification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Classification {
    pub kind: Kind,
    /// The detached-signature part of a `multipart/signed` root, if any.
    pub signature: Option<Message>,
}

/// Classifies a parsed root.
pub fn classify(root: &Message) -> Result<Classification, Error> {
    let content_type = root.content_type();

    if "multipart/signed" == content_type.media_type {
        let protocol = content_type
            .param("protocol")
            .ok_or(Error::MissingProtocol)?
            .to_ascii_lowercase();

        // The child whose Content-Type begins with the protocol value is
        // the signature; the other child is what was signed.
        let mut signature = None;
        let mut protected = None;
        for child in &root.children {
            let child_type = child
                .headers
                .get("Content-Type")
                .unwrap_or("text/plain")
                .to_ascii_lowercase();
            if child_type.starts_with(&protocol) {
                signature.get_or_insert(child);
            } else {
                protected.get_or_insert(child);
            }
        }

        let (Some(signature), Some(protected)) = (signature, protected)
        else {
            return Err(Error::SignedPartsMissing);
        };

        let inner = classify(protected)?;
        return Ok(Classification {
            kind: inner.kind,
            signature: Some(signature.clone()),
        });
    }

    Ok(Classification {
        kind: classify_unsigned(root, &content_type.media_type),
        signature: None,
    })
}

fn classify_unsigned(node: &Message, media_type: &str) -> Kind {
    if "multipart/encrypted" == media_type {
        return Kind::PgpMime;
    }

    if "multipart/mixed" == media_type && node.children.len() >= 2 {
        let has_manifest = node.children.iter().any(|child| {
            child
                .headers
                .get("Content-Type")
                .unwrap_or("")
                .to_ascii_lowercase()
                .starts_with("application/x-pgp-manifest")
        });
        if has_manifest {
            return Kind::Manifest;
        }
    }

    Kind::Raw
}
