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

//! Row models for the document store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The three-way classification of a message by its cryptographic
/// packaging.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum Kind {
    #[serde(rename = "raw")]
    Raw,
    #[serde(rename = "pgpmime")]
    PgpMime,
    #[serde(rename = "manifest")]
    Manifest,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::PgpMime => "pgpmime",
            Self::Manifest => "manifest",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "raw" => Some(Self::Raw),
            "pgpmime" => Some(Self::PgpMime),
            "manifest" => Some(Self::Manifest),
            _ => None,
        }
    }
}

/// Delivery status of a stored email.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Received,
    Queued,
    Sent,
    Failed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "received" => Some(Self::Received),
            "queued" => Some(Self::Queued),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A receiving address. The id is the canonical address itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub id: String,
    pub owner: String,
    pub date_created: DateTime<Utc>,
    pub date_modified: DateTime<Utc>,
}

/// A user account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    /// ID of the account's designated OpenPGP key; empty when the user has
    /// not picked one.
    pub public_key: String,
    pub date_created: DateTime<Utc>,
    pub date_modified: DateTime<Utc>,
}

/// A stored email row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Email {
    pub id: String,
    pub owner: String,
    pub message_id: String,
    pub kind: Kind,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    /// The subject line.
    pub name: String,
    pub content_type: String,
    pub body: String,
    /// Opaque bytes for the non-raw kinds; empty for `raw`.
    pub manifest: String,
    pub in_reply_to: String,
    pub thread: String,
    pub status: Status,
    pub secure: bool,
    pub files: Vec<String>,
    pub date_created: DateTime<Utc>,
    pub date_modified: DateTime<Utc>,
}

/// A stored attachment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub id: String,
    pub owner: String,
    pub name: String,
    pub content_type: String,
    #[serde(with = "serde_bytes_base64")]
    pub body: Vec<u8>,
    pub tags: Vec<String>,
    pub date_created: DateTime<Utc>,
    pub date_modified: DateTime<Utc>,
}

/// A stored OpenPGP public key (armored).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub id: String,
    pub owner: String,
    pub key: String,
    pub date_created: DateTime<Utc>,
    pub date_modified: DateTime<Utc>,
}

/// A conversation thread.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub owner: String,
    /// Opaque hash written by the thread writer on ingress; emitted
    /// verbatim on outbound manifest mail.
    pub subject_hash: String,
    pub date_created: DateTime<Utc>,
    pub date_modified: DateTime<Utc>,
}

/// A DKIM signing key row. The id is the sending domain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkimKey {
    pub id: String,
    pub owner: String,
    pub selector: String,
    #[serde(with = "serde_bytes_base64")]
    pub private_key: Vec<u8>,
    #[serde(with = "serde_bytes_base64")]
    pub public_key: Vec<u8>,
    pub date_created: DateTime<Utc>,
    pub date_modified: DateTime<Utc>,
}

/// Serialises binary columns as base64 strings in JSON contexts.
mod serde_bytes_base64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &[u8],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kind_string_round_trip() {
        for kind in [Kind::Raw, Kind::PgpMime, Kind::Manifest] {
            assert_eq!(Some(kind), Kind::from_str(kind.as_str()));
        }
        assert_eq!(None, Kind::from_str("smime"));
    }

    #[test]
    fn status_string_round_trip() {
        for status in [
            Status::Received,
            Status::Queued,
            Status::Sent,
            Status::Failed,
        ] {
            assert_eq!(Some(status), Status::from_str(status.as_str()));
        }
        assert_eq!(None, Status::from_str("bounced"));
    }
}
