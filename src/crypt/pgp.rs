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

//! OpenPGP encryption of stored copies.
//!
//! We only ever *encrypt* here, against the owner's public keyring; there
//! is no decryption and no signing in this process. Output is always
//! ASCII-armored so it can live in text columns and MIME parts.

use pgp::composed::{Deserializable, Message, SignedPublicKey};
use pgp::crypto::sym::SymmetricKeyAlgorithm;

use crate::support::error::Error;

/// A parsed recipient keyring.
pub struct Keyring {
    key: SignedPublicKey,
}

impl Keyring {
    /// Parses an armored public key as stored in the `keys` table.
    pub fn from_armored(armored: &str) -> Result<Self, Error> {
        let (key, _headers) = SignedPublicKey::from_string(armored)?;
        Ok(Self { key })
    }

    /// Encrypts `plain` to the keyring and returns armored ciphertext.
    ///
    /// Encryption targets the first subkey when one exists (the
    /// encryption subkey in every keyring our clients generate), falling
    /// back to the primary key.
    pub fn encrypt_armored(&self, plain: &[u8]) -> Result<String, Error> {
        let mut rng = rand::thread_rng();
        let message = Message::new_literal_bytes("", plain);

        let encrypted = match self.key.public_subkeys.first() {
            Some(subkey) => message.encrypt_to_keys(
                &mut rng,
                SymmetricKeyAlgorithm::AES128,
                &[subkey],
            )?,
            None => message.encrypt_to_keys(
                &mut rng,
                SymmetricKeyAlgorithm::AES128,
                &[&self.key],
            )?,
        };

        Ok(encrypted.to_armored_string(None)?)
    }
}
