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

//! The PGP-manifest document.
//!
//! Clients that understand our packaging never read the relayed MIME body;
//! they fetch the manifest, verify each part against its SHA-256 and pull
//! the ciphertext parts separately. The manifest itself ships encrypted as
//! `application/x-pgp-manifest+json`.

use semver::Version;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::mime::addr::MailAddr;
use crate::store::models::Email;
use crate::support::error::Error;
use crate::support::rand_token;

/// ID of the part describing the message body itself.
pub const BODY_PART_ID: &str = "body";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: Version,
    pub from: MailAddr,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<MailAddr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<MailAddr>,
    pub subject: String,
    pub parts: Vec<Part>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub id: String,
    /// Hex SHA-256 of the cleartext.
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub content_type: String,
    pub size: usize,
}

impl Manifest {
    /// Starts a manifest for `email` with the body part filled in.
    pub fn for_email(email: &Email) -> Self {
        Self {
            version: Version::new(1, 0, 0),
            from: MailAddr::parse_lossy(&email.from),
            to: email
                .to
                .iter()
                .map(|a| MailAddr::parse_lossy(a))
                .collect(),
            cc: email
                .cc
                .iter()
                .map(|a| MailAddr::parse_lossy(a))
                .collect(),
            subject: email.name.clone(),
            parts: vec![Part {
                id: BODY_PART_ID.to_owned(),
                hash: hex_sha256(email.body.as_bytes()),
                filename: None,
                content_type: email.content_type.clone(),
                size: email.body.len(),
            }],
        }
    }

    /// Registers an attachment and returns its fresh part ID, which also
    /// names the rewritten `.pgp` file.
    pub fn add_attachment(
        &mut self,
        filename: &str,
        content_type: &str,
        cleartext: &[u8],
    ) -> String {
        let id = rand_token::token(rand_token::TOKEN_LEN);
        self.parts.push(Part {
            id: id.clone(),
            hash: hex_sha256(cleartext),
            filename: Some(filename.to_owned()),
            content_type: content_type.to_owned(),
            size: cleartext.len(),
        });
        id
    }

    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Hex-encoded SHA-256.
pub fn hex_sha256(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::test_support::email_skeleton;

    #[test]
    fn hex_sha256_known_vector() {
        assert_eq!(
            "b662e1a6e31ec4b7d7a5aeff18a0ca8d2ed4d5b40b3f86d97a86a33e1d7a7bdc",
            hex_sha256(b"PDF!"),
        );
    }

    #[test]
    fn manifest_for_email_has_body_part() {
        let email = email_skeleton("mail-1", "acct-alice");
        let manifest = Manifest::for_email(&email);

        assert_eq!(Version::new(1, 0, 0), manifest.version);
        assert_eq!("alice@example.com", manifest.from.address);
        assert_eq!(1, manifest.to.len());
        assert_eq!("Test subject", manifest.subject);

        assert_eq!(1, manifest.parts.len());
        let body = &manifest.parts[0];
        assert_eq!(BODY_PART_ID, body.id);
        assert_eq!(hex_sha256(b"cleartext body"), body.hash);
        assert_eq!("text/plain", body.content_type);
        assert_eq!("cleartext body".len(), body.size);
        assert!(body.filename.is_none());
    }

    #[test]
    fn attachments_get_random_ids_and_hashes() {
        let email = email_skeleton("mail-1", "acct-alice");
        let mut manifest = Manifest::for_email(&email);

        let id =
            manifest.add_attachment("a.pdf", "application/pdf", b"PDF!");
        assert_eq!(20, id.len());
        assert!(id.bytes().all(|b| b.is_ascii_alphanumeric()));

        let part = &manifest.parts[1];
        assert_eq!(id, part.id);
        assert_eq!(Some("a.pdf".to_owned()), part.filename);
        assert_eq!(4, part.size);
        assert_eq!(
            "b662e1a6e31ec4b7d7a5aeff18a0ca8d2ed4d5b40b3f86d97a86a33e1d7a7bdc",
            part.hash,
        );
    }

    #[test]
    fn json_shape_is_stable() {
        let mut email = email_skeleton("mail-1", "acct-alice");
        email.from = "Alice <alice@example.com>".to_owned();
        let manifest = Manifest::for_email(&email);
        let json: serde_json::Value =
            serde_json::from_slice(&manifest.to_json().unwrap()).unwrap();

        assert_eq!("1.0.0", json["version"]);
        assert_eq!("alice@example.com", json["from"]["address"]);
        assert_eq!("Alice", json["from"]["name"]);
        assert_eq!("body", json["parts"][0]["id"]);
        // cc is empty and therefore absent
        assert!(json.get("cc").is_none());
    }

    #[test]
    fn manifest_round_trips_through_json() {
        let email = email_skeleton("mail-1", "acct-alice");
        let mut manifest = Manifest::for_email(&email);
        manifest.add_attachment("f.bin", "application/octet-stream", b"x");

        let parsed: Manifest =
            serde_json::from_slice(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(manifest, parsed);
    }
}
