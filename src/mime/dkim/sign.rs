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

use chrono::prelude::*;

use super::{hash, split_message, Error, Header, SignatureAlgorithm};

type KeyPair = openssl::pkey::PKey<openssl::pkey::Private>;

/// A prepared signer for one sending domain.
///
/// Construction parses and validates the private key, so a cached
/// `DomainSigner` can sign any number of messages without touching the key
/// store again.
pub struct DomainSigner {
    domain: String,
    selector: String,
    key: KeyPair,
    algorithm: SignatureAlgorithm,
}

impl std::fmt::Debug for DomainSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainSigner")
            .field("domain", &self.domain)
            .field("selector", &self.selector)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl DomainSigner {
    /// Prepares a signer from a key-store row.
    ///
    /// The private key must be PEM, and RSA or Ed25519.
    pub fn new(
        domain: String,
        selector: String,
        private_key_pem: &[u8],
    ) -> Result<Self, Error> {
        let key = openssl::pkey::PKey::private_key_from_pem(private_key_pem)
            .map_err(|e| Error::KeyParse(e.to_string()))?;

        let algorithm = match key.id() {
            openssl::pkey::Id::RSA => SignatureAlgorithm::Rsa,
            openssl::pkey::Id::ED25519 => SignatureAlgorithm::Ed25519,
            id => {
                return Err(Error::UnsupportedKeyType(format!("{:?}", id)))
            },
        };

        Ok(Self {
            domain,
            selector,
            key,
            algorithm,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Signs a fully rendered message.
    ///
    /// Returns the `DKIM-Signature` header line (without line ending) to
    /// prepend to the message.
    pub fn sign(&self, message: &[u8]) -> Result<String, Error> {
        self.sign_at(message, Utc::now())
    }

    fn sign_at(
        &self,
        message: &[u8],
        now: DateTime<Utc>,
    ) -> Result<String, Error> {
        let (header_block, body) = split_message(message);

        let mut header = Header::template(
            self.algorithm,
            self.domain.clone(),
            self.selector.clone(),
            now,
        );
        header.body_hash = hash::body_hash(&header, body)?;

        let hash_data = hash::header_hash_data(&header, header_block);
        let mut signer = match self.algorithm {
            SignatureAlgorithm::Rsa => openssl::sign::Signer::new(
                openssl::hash::MessageDigest::sha256(),
                &self.key,
            ),
            // OpenSSL rejects explicit configuration of the digest
            SignatureAlgorithm::Ed25519 => {
                openssl::sign::Signer::new_without_digest(&self.key)
            },
        }?;
        header.signature = signer.sign_oneshot_to_vec(&hash_data)?;

        Ok(header.raw().text)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::support::chronox::*;

    const MESSAGE: &[u8] = b"From: alice@example.com\r\n\
        To: bob@example.org\r\n\
        Subject: Test email\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        A test body.\r\n";

    #[test]
    fn rejects_garbage_key() {
        assert_matches!(
            Err(Error::KeyParse(..)),
            DomainSigner::new(
                "example.com".to_owned(),
                "mail".to_owned(),
                b"not a pem",
            ),
        );
    }

    #[test]
    fn sign_and_verify_rsa() {
        let rsa = openssl::rsa::Rsa::generate(2048).unwrap();
        let pem = rsa.private_key_to_pem().unwrap();
        let signer = DomainSigner::new(
            "example.com".to_owned(),
            "mail".to_owned(),
            &pem,
        )
        .unwrap();

        let now = NaiveDate::from_ymdx(2015, 4, 1).and_hmsx_utc(12, 0, 0);
        let header_line = signer.sign_at(MESSAGE, now).unwrap();

        assert!(header_line.starts_with("DKIM-Signature:"));
        assert!(header_line.contains("d=example.com;"));
        assert!(header_line.contains("s=mail;"));

        // Reconstruct the hash input and check the signature against the
        // public half of the key.
        let mut header = Header::template(
            SignatureAlgorithm::Rsa,
            "example.com".to_owned(),
            "mail".to_owned(),
            now,
        );
        let (header_block, body) = split_message(MESSAGE);
        header.body_hash = hash::body_hash(&header, body).unwrap();

        let b64: String = {
            // Everything after "b=" in the rendered header, unfolded
            let ix = header_line.rfind("b=").unwrap();
            header_line[ix + 2..]
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect()
        };
        header.signature = base64::decode(b64).unwrap();

        let hash_data = hash::header_hash_data(&header, header_block);

        let public = openssl::pkey::PKey::from_rsa(
            openssl::rsa::Rsa::from_public_components(
                rsa.n().to_owned().unwrap(),
                rsa.e().to_owned().unwrap(),
            )
            .unwrap(),
        )
        .unwrap();
        let mut verifier = openssl::sign::Verifier::new(
            openssl::hash::MessageDigest::sha256(),
            &public,
        )
        .unwrap();
        assert!(verifier
            .verify_oneshot(&header.signature, &hash_data)
            .unwrap());
    }

    #[test]
    fn sign_and_verify_ed25519() {
        let key = openssl::pkey::PKey::generate_ed25519().unwrap();
        let pem = key.private_key_to_pem_pkcs8().unwrap();
        let signer = DomainSigner::new(
            "example.com".to_owned(),
            "ed".to_owned(),
            &pem,
        )
        .unwrap();

        let now = NaiveDate::from_ymdx(2015, 4, 1).and_hmsx_utc(12, 0, 0);
        let header_line = signer.sign_at(MESSAGE, now).unwrap();
        assert!(header_line.contains("a=ed25519-sha256;"));

        let mut header = Header::template(
            SignatureAlgorithm::Ed25519,
            "example.com".to_owned(),
            "ed".to_owned(),
            now,
        );
        let (header_block, body) = split_message(MESSAGE);
        header.body_hash = hash::body_hash(&header, body).unwrap();
        let ix = header_line.rfind("b=").unwrap();
        let b64: String = header_line[ix + 2..]
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        header.signature = base64::decode(b64).unwrap();

        let hash_data = hash::header_hash_data(&header, header_block);
        let mut verifier =
            openssl::sign::Verifier::new_without_digest(&key).unwrap();
        assert!(verifier
            .verify_oneshot(&header.signature, &hash_data)
            .unwrap());
    }
}
