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

//! The mailer's view of the user-data store.
//!
//! Tables: `addresses` (keyed by canonical address), `accounts`, `emails`
//! (with a (thread, status) secondary index), `files` (with an owner
//! index), `keys` (with an owner index), `threads` and `dkim_keys` (keyed
//! by domain). Creation is idempotent; in production only `dkim_keys` is
//! ours to create, the rest of the schema is owned by the API service, but
//! creating it when absent lets this process run against an empty database
//! in development.
//!
//! Every mutation of `dkim_keys` is broadcast to change-feed subscribers as
//! an (old, new) row pair, which is what keeps the signer cache honest.

pub mod models;

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use self::models::*;
use crate::support::error::Error;

/// One (old, new) row snapshot pair from the dkim_keys change feed.
///
/// Creations have `old == None`; deletions have `new == None`.
#[derive(Clone, Debug)]
pub struct DkimChange {
    pub old: Option<DkimKey>,
    pub new: Option<DkimKey>,
}

/// Handle to the document store. Clones share one connection.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

struct Inner {
    conn: Mutex<Connection>,
    dkim_subscribers: Mutex<Vec<Sender<DkimChange>>>,
}

impl Store {
    /// Opens (creating as needed) the store at `path`.
    pub fn open(path: &str) -> Result<Self, Error> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Opens a fresh private in-memory store.
    pub fn open_in_memory() -> Result<Self, Error> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, Error> {
        let store = Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                dkim_subscribers: Mutex::new(Vec::new()),
            }),
        };
        store.create_tables()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.inner.conn.lock().expect("store mutex poisoned")
    }

    fn create_tables(&self) -> Result<(), Error> {
        self.conn().execute_batch(
            "CREATE TABLE IF NOT EXISTS addresses (
                 id            TEXT PRIMARY KEY,
                 owner         TEXT NOT NULL,
                 date_created  TEXT NOT NULL,
                 date_modified TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS accounts (
                 id            TEXT PRIMARY KEY,
                 name          TEXT NOT NULL,
                 public_key    TEXT NOT NULL,
                 date_created  TEXT NOT NULL,
                 date_modified TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS emails (
                 id            TEXT PRIMARY KEY,
                 owner         TEXT NOT NULL,
                 message_id    TEXT NOT NULL,
                 kind          TEXT NOT NULL,
                 sender        TEXT NOT NULL,
                 recipients    TEXT NOT NULL,
                 cc            TEXT NOT NULL,
                 bcc           TEXT NOT NULL,
                 name          TEXT NOT NULL,
                 content_type  TEXT NOT NULL,
                 body          TEXT NOT NULL,
                 manifest      TEXT NOT NULL,
                 in_reply_to   TEXT NOT NULL,
                 thread        TEXT NOT NULL,
                 status        TEXT NOT NULL,
                 secure        INTEGER NOT NULL,
                 files         TEXT NOT NULL,
                 date_created  TEXT NOT NULL,
                 date_modified TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS emails_thread_status
                 ON emails (thread, status);
             CREATE TABLE IF NOT EXISTS files (
                 id            TEXT PRIMARY KEY,
                 owner         TEXT NOT NULL,
                 name          TEXT NOT NULL,
                 content_type  TEXT NOT NULL,
                 body          BLOB NOT NULL,
                 tags          TEXT NOT NULL,
                 date_created  TEXT NOT NULL,
                 date_modified TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS files_owner ON files (owner);
             CREATE TABLE IF NOT EXISTS keys (
                 id            TEXT PRIMARY KEY,
                 owner         TEXT NOT NULL,
                 key           TEXT NOT NULL,
                 date_created  TEXT NOT NULL,
                 date_modified TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS keys_owner ON keys (owner);
             CREATE TABLE IF NOT EXISTS threads (
                 id            TEXT PRIMARY KEY,
                 owner         TEXT NOT NULL,
                 subject_hash  TEXT NOT NULL,
                 date_created  TEXT NOT NULL,
                 date_modified TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS dkim_keys (
                 id            TEXT PRIMARY KEY,
                 owner         TEXT NOT NULL,
                 selector      TEXT NOT NULL,
                 private_key   BLOB NOT NULL,
                 public_key    BLOB NOT NULL,
                 date_created  TEXT NOT NULL,
                 date_modified TEXT NOT NULL
             );",
        )?;
        Ok(())
    }

    // ---------------- addresses / accounts ----------------

    pub fn address(&self, id: &str) -> Result<Option<Address>, Error> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, owner, date_created, date_modified
                 FROM addresses WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Address {
                        id: row.get(0)?,
                        owner: row.get(1)?,
                        date_created: get_date(row, 2)?,
                        date_modified: get_date(row, 3)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn put_address(&self, address: &Address) -> Result<(), Error> {
        self.conn().execute(
            "INSERT OR REPLACE INTO addresses
             (id, owner, date_created, date_modified)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                address.id,
                address.owner,
                put_date(address.date_created),
                put_date(address.date_modified),
            ],
        )?;
        Ok(())
    }

    pub fn account(&self, id: &str) -> Result<Option<Account>, Error> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, name, public_key, date_created, date_modified
                 FROM accounts WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Account {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        public_key: row.get(2)?,
                        date_created: get_date(row, 3)?,
                        date_modified: get_date(row, 4)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn put_account(&self, account: &Account) -> Result<(), Error> {
        self.conn().execute(
            "INSERT OR REPLACE INTO accounts
             (id, name, public_key, date_created, date_modified)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                account.id,
                account.name,
                account.public_key,
                put_date(account.date_created),
                put_date(account.date_modified),
            ],
        )?;
        Ok(())
    }

    // ---------------- emails ----------------

    pub fn email(&self, id: &str) -> Result<Option<Email>, Error> {
        Ok(self
            .conn()
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_EMAIL),
                params![id],
                row_to_email,
            )
            .optional()?)
    }

    pub fn put_email(&self, email: &Email) -> Result<(), Error> {
        self.conn().execute(
            "INSERT OR REPLACE INTO emails
             (id, owner, message_id, kind, sender, recipients, cc, bcc,
              name, content_type, body, manifest, in_reply_to, thread,
              status, secure, files, date_created, date_modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                     ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                email.id,
                email.owner,
                email.message_id,
                email.kind.as_str(),
                email.from,
                serde_json::to_string(&email.to)?,
                serde_json::to_string(&email.cc)?,
                serde_json::to_string(&email.bcc)?,
                email.name,
                email.content_type,
                email.body,
                email.manifest,
                email.in_reply_to,
                email.thread,
                email.status.as_str(),
                email.secure,
                serde_json::to_string(&email.files)?,
                put_date(email.date_created),
                put_date(email.date_modified),
            ],
        )?;
        Ok(())
    }

    pub fn update_email_status(
        &self,
        id: &str,
        status: Status,
    ) -> Result<(), Error> {
        let n = self.conn().execute(
            "UPDATE emails SET status = ?2, date_modified = ?3
             WHERE id = ?1",
            params![id, status.as_str(), put_date(Utc::now())],
        )?;
        if 0 == n {
            return Err(Error::NxRow("emails"));
        }
        Ok(())
    }

    /// The most recent received email in `thread` whose sender is one of
    /// `from_candidates`.
    pub fn last_received_in_thread(
        &self,
        thread: &str,
        from_candidates: &[String],
    ) -> Result<Option<Email>, Error> {
        if from_candidates.is_empty() {
            return Ok(None);
        }

        let placeholders = from_candidates
            .iter()
            .enumerate()
            .map(|(ix, _)| format!("?{}", ix + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "{} WHERE thread = ?1 AND status = 'received'
             AND sender IN ({})
             ORDER BY date_created DESC LIMIT 1",
            SELECT_EMAIL, placeholders,
        );

        let params = std::iter::once(thread.to_owned())
            .chain(from_candidates.iter().cloned())
            .collect::<Vec<String>>();

        Ok(self
            .conn()
            .query_row(&sql, params_from_iter(params), row_to_email)
            .optional()?)
    }

    // ---------------- files ----------------

    pub fn file(&self, id: &str) -> Result<Option<File>, Error> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, owner, name, content_type, body, tags,
                        date_created, date_modified
                 FROM files WHERE id = ?1",
                params![id],
                row_to_file,
            )
            .optional()?)
    }

    /// Fetches the named files, in the order given, skipping missing IDs.
    pub fn files(&self, ids: &[String]) -> Result<Vec<File>, Error> {
        let mut files = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(file) = self.file(id)? {
                files.push(file);
            }
        }
        Ok(files)
    }

    pub fn put_file(&self, file: &File) -> Result<(), Error> {
        self.conn().execute(
            "INSERT OR REPLACE INTO files
             (id, owner, name, content_type, body, tags,
              date_created, date_modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                file.id,
                file.owner,
                file.name,
                file.content_type,
                file.body,
                serde_json::to_string(&file.tags)?,
                put_date(file.date_created),
                put_date(file.date_modified),
            ],
        )?;
        Ok(())
    }

    // ---------------- keys ----------------

    pub fn key(&self, id: &str) -> Result<Option<Key>, Error> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, owner, key, date_created, date_modified
                 FROM keys WHERE id = ?1",
                params![id],
                row_to_key,
            )
            .optional()?)
    }

    /// All keys owned by `owner`.
    ///
    /// Ordered by key ID so that "the first key" is deterministic for a
    /// fixed store state.
    pub fn keys_by_owner(&self, owner: &str) -> Result<Vec<Key>, Error> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, owner, key, date_created, date_modified
             FROM keys WHERE owner = ?1 ORDER BY id",
        )?;
        let keys = stmt
            .query_map(params![owner], row_to_key)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    pub fn put_key(&self, key: &Key) -> Result<(), Error> {
        self.conn().execute(
            "INSERT OR REPLACE INTO keys
             (id, owner, key, date_created, date_modified)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                key.id,
                key.owner,
                key.key,
                put_date(key.date_created),
                put_date(key.date_modified),
            ],
        )?;
        Ok(())
    }

    // ---------------- threads ----------------

    pub fn thread(&self, id: &str) -> Result<Option<Thread>, Error> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, owner, subject_hash, date_created, date_modified
                 FROM threads WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Thread {
                        id: row.get(0)?,
                        owner: row.get(1)?,
                        subject_hash: row.get(2)?,
                        date_created: get_date(row, 3)?,
                        date_modified: get_date(row, 4)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn put_thread(&self, thread: &Thread) -> Result<(), Error> {
        self.conn().execute(
            "INSERT OR REPLACE INTO threads
             (id, owner, subject_hash, date_created, date_modified)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                thread.id,
                thread.owner,
                thread.subject_hash,
                put_date(thread.date_created),
                put_date(thread.date_modified),
            ],
        )?;
        Ok(())
    }

    // ---------------- dkim_keys + change feed ----------------

    pub fn dkim_key(&self, domain: &str) -> Result<Option<DkimKey>, Error> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, owner, selector, private_key, public_key,
                        date_created, date_modified
                 FROM dkim_keys WHERE id = ?1",
                params![domain],
                row_to_dkim_key,
            )
            .optional()?)
    }

    pub fn put_dkim_key(&self, key: &DkimKey) -> Result<(), Error> {
        let old = self.dkim_key(&key.id)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO dkim_keys
             (id, owner, selector, private_key, public_key,
              date_created, date_modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                key.id,
                key.owner,
                key.selector,
                key.private_key,
                key.public_key,
                put_date(key.date_created),
                put_date(key.date_modified),
            ],
        )?;
        self.publish_dkim_change(DkimChange {
            old,
            new: Some(key.clone()),
        });
        Ok(())
    }

    pub fn delete_dkim_key(&self, domain: &str) -> Result<(), Error> {
        let old = self.dkim_key(domain)?;
        self.conn()
            .execute("DELETE FROM dkim_keys WHERE id = ?1", params![domain])?;
        if old.is_some() {
            self.publish_dkim_change(DkimChange { old, new: None });
        }
        Ok(())
    }

    /// Subscribes to the dkim_keys change feed.
    ///
    /// The feed carries every mutation made through this `Store` (and its
    /// clones) from this point on. When the last clone of the store is
    /// dropped the channel disconnects, which subscribers must treat as
    /// feed termination.
    pub fn subscribe_dkim_changes(&self) -> Receiver<DkimChange> {
        let (tx, rx) = channel();
        self.inner
            .dkim_subscribers
            .lock()
            .expect("subscriber mutex poisoned")
            .push(tx);
        rx
    }

    fn publish_dkim_change(&self, change: DkimChange) {
        let mut subscribers = self
            .inner
            .dkim_subscribers
            .lock()
            .expect("subscriber mutex poisoned");
        subscribers.retain(|tx| tx.send(change.clone()).is_ok());
    }
}

const SELECT_EMAIL: &str =
    "SELECT id, owner, message_id, kind, sender, recipients, cc, bcc,
            name, content_type, body, manifest, in_reply_to, thread,
            status, secure, files, date_created, date_modified
     FROM emails";

fn row_to_email(row: &Row) -> rusqlite::Result<Email> {
    Ok(Email {
        id: row.get(0)?,
        owner: row.get(1)?,
        message_id: row.get(2)?,
        kind: get_kind(row, 3)?,
        from: row.get(4)?,
        to: get_json(row, 5)?,
        cc: get_json(row, 6)?,
        bcc: get_json(row, 7)?,
        name: row.get(8)?,
        content_type: row.get(9)?,
        body: row.get(10)?,
        manifest: row.get(11)?,
        in_reply_to: row.get(12)?,
        thread: row.get(13)?,
        status: get_status(row, 14)?,
        secure: row.get(15)?,
        files: get_json(row, 16)?,
        date_created: get_date(row, 17)?,
        date_modified: get_date(row, 18)?,
    })
}

fn row_to_file(row: &Row) -> rusqlite::Result<File> {
    Ok(File {
        id: row.get(0)?,
        owner: row.get(1)?,
        name: row.get(2)?,
        content_type: row.get(3)?,
        body: row.get(4)?,
        tags: get_json(row, 5)?,
        date_created: get_date(row, 6)?,
        date_modified: get_date(row, 7)?,
    })
}

fn row_to_key(row: &Row) -> rusqlite::Result<Key> {
    Ok(Key {
        id: row.get(0)?,
        owner: row.get(1)?,
        key: row.get(2)?,
        date_created: get_date(row, 3)?,
        date_modified: get_date(row, 4)?,
    })
}

fn row_to_dkim_key(row: &Row) -> rusqlite::Result<DkimKey> {
    Ok(DkimKey {
        id: row.get(0)?,
        owner: row.get(1)?,
        selector: row.get(2)?,
        private_key: row.get(3)?,
        public_key: row.get(4)?,
        date_created: get_date(row, 5)?,
        date_modified: get_date(row, 6)?,
    })
}

fn put_date(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

fn get_date(row: &Row, ix: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(ix)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| bad_column(ix, e))
}

fn get_json<T: serde::de::DeserializeOwned>(
    row: &Row,
    ix: usize,
) -> rusqlite::Result<T> {
    let s: String = row.get(ix)?;
    serde_json::from_str(&s).map_err(|e| bad_column(ix, e))
}

fn get_kind(row: &Row, ix: usize) -> rusqlite::Result<Kind> {
    let s: String = row.get(ix)?;
    Kind::from_str(&s).ok_or_else(|| {
        bad_column(ix, format!("unknown kind: {}", s))
    })
}

fn get_status(row: &Row, ix: usize) -> rusqlite::Result<Status> {
    let s: String = row.get(ix)?;
    Status::from_str(&s).ok_or_else(|| {
        bad_column(ix, format!("unknown status: {}", s))
    })
}

fn bad_column(
    ix: usize,
    e: impl ToString,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        ix,
        rusqlite::types::Type::Text,
        e.to_string().into(),
    )
}
