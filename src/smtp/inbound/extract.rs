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

//! Pulls envelope metadata, bodies, manifests and attachments out of a
//! classified message tree.

use crate::mime::addr::MailAddr;
use crate::mime::message::Message;
use crate::support::error::Error;

/// Envelope-ish metadata read from the root headers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Meta {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
}

/// Parses From/To/Cc/Subject.
///
/// `From` is canonicalised when it parses as a single mailbox; otherwise
/// the raw trimmed header value is kept. `To` and `Cc` are comma-separated
/// lists with each element trimmed; a `Cc` consisting of one empty element
/// collapses to an empty list.
pub fn parse_meta(root: &Message) -> Meta {
    let raw_from = root.headers.get("From").unwrap_or("");
    let from = match MailAddr::parse(raw_from) {
        Some(addr) => addr.to_string(),
        None => raw_from.trim().to_owned(),
    };

    let to = split_address_list(root.headers.get("To").unwrap_or(""));
    let mut cc = split_address_list(root.headers.get("Cc").unwrap_or(""));
    if 1 == cc.len() && cc[0].is_empty() {
        cc = Vec::new();
    }

    Meta {
        from,
        to,
        cc,
        subject: root.headers.get("Subject").unwrap_or("").to_owned(),
    }
}

fn split_address_list(value: &str) -> Vec<String> {
    value.split(',').map(|e| e.trim().to_owned()).collect()
}

/// Raw extraction: removes attachment-disposition parts from the tree and
/// returns (re-emitted body, attachments).
pub fn extract_raw(root: &mut Message) -> (Vec<u8>, Vec<Message>) {
    let mut attachments = Vec::new();
    prune_attachments(root, &mut attachments, &|_| true);
    (root.encode(), attachments)
}

/// PGP/MIME extraction: returns (manifest bytes, encrypted body bytes).
///
/// The first child whose Content-Type contains `application/pgp-encrypted`
/// is the version/manifest part; the first child that does not is the
/// ciphertext.
pub fn extract_pgp(root: &Message) -> Result<(Vec<u8>, Vec<u8>), Error> {
    let mut manifest = None;
    let mut body = None;

    for child in &root.children {
        let is_control = child
            .headers
            .get("Content-Type")
            .unwrap_or("")
            .to_ascii_lowercase()
            .contains("application/pgp-encrypted");

        if is_control {
            manifest.get_or_insert_with(|| child.body.clone());
        } else {
            body.get_or_insert_with(|| child.body.clone());
        }

        if manifest.is_some() && body.is_some() {
            break;
        }
    }

    match (manifest, body) {
        (Some(manifest), Some(body)) => Ok((manifest, body)),
        _ => Err(Error::PgpPartsMissing),
    }
}

/// Manifest extraction: returns (manifest bytes, body bytes, attachments).
///
/// The first descendant with a `application/x-pgp-manifest` media type
/// carries the manifest; its first sibling typed `application/pgp-encrypted`
/// carries the body. The remaining attachment-disposition parts are pruned
/// as in raw extraction.
pub fn extract_manifest(
    root: &mut Message,
) -> Result<(Vec<u8>, Vec<u8>, Vec<Message>), Error> {
    fn find_parts(node: &Message) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
        let manifest_ix = node.children.iter().position(|child| {
            child
                .headers
                .get("Content-Type")
                .unwrap_or("")
                .to_ascii_lowercase()
                .starts_with("application/x-pgp-manifest")
        });

        if let Some(manifest_ix) = manifest_ix {
            let body = node
                .children
                .iter()
                .enumerate()
                .find(|&(ix, sibling)| {
                    ix != manifest_ix
                        && sibling
                            .headers
                            .get("Content-Type")
                            .unwrap_or("")
                            .to_ascii_lowercase()
                            .starts_with("application/pgp-encrypted")
                })
                .map(|(_, sibling)| sibling.body.clone());
            return Some((node.children[manifest_ix].body.clone(), body));
        }

        node.children.iter().find_map(find_parts)
    }

    let (manifest, body) =
        find_parts(root).ok_or(Error::ManifestPartsMissing)?;
    let body = body.ok_or(Error::ManifestPartsMissing)?;

    // The manifest and ciphertext parts are packaging, not attachments,
    // even though they travel with an attachment disposition.
    let mut attachments = Vec::new();
    prune_attachments(root, &mut attachments, &|part| {
        let content_type = part
            .headers
            .get("Content-Type")
            .unwrap_or("")
            .to_ascii_lowercase();
        !content_type.starts_with("application/x-pgp-manifest")
            && !content_type.starts_with("application/pgp-encrypted")
    });

    Ok((manifest, body, attachments))
}

/// Walks the tree removing parts with an `attachment` disposition that
/// `eligible` accepts, appending them to `attachments`.
fn prune_attachments(
    node: &mut Message,
    attachments: &mut Vec<Message>,
    eligible: &dyn Fn(&Message) -> bool,
) {
    let mut kept = Vec::with_capacity(node.children.len());
    for mut child in node.children.drain(..) {
        if is_attachment(&child) && eligible(&child) {
            attachments.push(child);
            continue;
        }

        prune_attachments(&mut child, attachments, eligible);
        kept.push(child);
    }
    node.children = kept;
}

fn is_attachment(part: &Message) -> bool {
    part.headers
        .get("Content-Disposition")
        .map(|d| {
            crate::mime::message::MediaType::parse(d).media_type
                == "attachment"
        })
        .unwrap_or(false)
}
