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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // MIME parsing
    #[error("Invalid Content-Type (no boundary of a multipart type)")]
    MissingBoundary,
    #[error("Message parts nested too deeply")]
    NestingTooDeep,
    #[error("Malformed header block")]
    MalformedHeaders,
    // Classification / extraction
    #[error("No protocol found in multipart/signed")]
    MissingProtocol,
    #[error("multipart/signed parts missing")]
    SignedPartsMissing,
    #[error("PGP/MIME parts missing")]
    PgpPartsMissing,
    #[error("Manifest parts missing")]
    ManifestPartsMissing,
    // Recipient resolution
    #[error("Malformed recipient address")]
    BadAddress,
    #[error("Unknown recipient")]
    UnknownRecipient,
    // Stored rows
    #[error("No such row: {0}")]
    NxRow(&'static str),
    #[error("Account has no OpenPGP key")]
    NoEncryptionKey,
    // Outbound
    #[error("Relay rejected the message: {0}")]
    Relay(#[from] lettre::transport::smtp::Error),
    #[error("Envelope address rejected: {0}")]
    Envelope(#[from] lettre::error::Error),
    #[error("Queue message is not a JSON string")]
    BadQueueMessage,
    // Spam scorer
    #[error("spamd protocol error: {0}")]
    Spamd(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
    #[error(transparent)]
    Pgp(#[from] pgp::errors::Error),
    #[error(transparent)]
    Dkim(#[from] crate::mime::dkim::Error),
    #[error("Bad mailbox in relay envelope: {0}")]
    RelayAddress(#[from] lettre::address::AddressError),
}

impl Error {
    /// Whether the failure is plausibly transient, which on the inbound side
    /// maps to a 4xx reply instead of a 5xx.
    pub fn is_transient(&self) -> bool {
        matches!(
            *self,
            Error::Io(..) | Error::Sqlite(..) | Error::Spamd(..),
        )
    }
}
