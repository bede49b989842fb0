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

//! The post-send rewrite of cleartext emails.
//!
//! After a `raw` email has been relayed, its stored copy is re-encrypted
//! against the owner's keyring: every attachment file row is replaced with
//! armored ciphertext under a `<part-id>.pgp` name, the body and a freshly
//! built manifest are encrypted, and the email row is rewritten as kind
//! `manifest` with status `sent`.
//!
//! The rewrite is not atomic. The relay has already accepted the
//! cleartext when this runs; a failure part way leaves rows for the
//! operator to reconcile, and the email row keeps its `queued` status so
//! the condition is visible.

use chrono::Utc;

use crate::crypt::manifest::Manifest;
use crate::crypt::pgp::Keyring;
use crate::store::models::{Email, File, Kind, Status};
use crate::store::Store;
use crate::support::error::Error;

/// Encrypts the stored copy of a relayed `raw` email in place.
pub fn encrypt_email(
    store: &Store,
    email: &Email,
    files: &[File],
) -> Result<(), Error> {
    let keyring = owner_keyring(store, email)?;

    let mut manifest = Manifest::for_email(email);
    let encrypted_body = keyring.encrypt_armored(email.body.as_bytes())?;

    for file in files {
        let cipher = keyring.encrypt_armored(&file.body)?;
        let part_id = manifest.add_attachment(
            &file.name,
            &file.content_type,
            &file.body,
        );

        store.put_file(&File {
            id: file.id.clone(),
            owner: file.owner.clone(),
            name: format!("{}.pgp", part_id),
            content_type: "application/pgp-encrypted".to_owned(),
            body: cipher.into_bytes(),
            tags: file.tags.clone(),
            date_created: file.date_created,
            date_modified: Utc::now(),
        })?;
    }

    let manifest_json = manifest.to_json()?;
    let encrypted_manifest = keyring.encrypt_armored(&manifest_json)?;

    store.put_email(&Email {
        id: email.id.clone(),
        owner: email.owner.clone(),
        message_id: email.message_id.clone(),
        kind: Kind::Manifest,
        from: email.from.clone(),
        to: email.to.clone(),
        cc: email.cc.clone(),
        bcc: email.bcc.clone(),
        name: format!("Encrypted message ({})", email.id),
        content_type: email.content_type.clone(),
        body: encrypted_body,
        manifest: encrypted_manifest,
        in_reply_to: email.in_reply_to.clone(),
        thread: email.thread.clone(),
        status: Status::Sent,
        secure: email.secure,
        files: email.files.clone(),
        date_created: email.date_created,
        date_modified: Utc::now(),
    })?;

    Ok(())
}

/// Loads and parses the keyring the owner's stored copy is encrypted to.
///
/// The account's designated `public_key` wins; otherwise the first key the
/// owner has (the owner index is ordered, so this is deterministic for a
/// fixed store state).
fn owner_keyring(store: &Store, email: &Email) -> Result<Keyring, Error> {
    let account = store
        .account(&email.owner)?
        .ok_or(Error::NxRow("accounts"))?;

    let key = if !account.public_key.is_empty() {
        store
            .key(&account.public_key)?
            .ok_or(Error::NxRow("keys"))?
    } else {
        store
            .keys_by_owner(&email.owner)?
            .into_iter()
            .next()
            .ok_or(Error::NoEncryptionKey)?
    };

    Keyring::from_armored(&key.key)
}
