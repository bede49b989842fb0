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

//! The outbound queue handler: load the row, assemble, sign, relay, then
//! mark sent (or, for cleartext emails, encrypt the stored copy).
//!
//! A failure anywhere is reported (with the email ID attached) and handed
//! back to the queue as a nack; the queue owns retries, this code never
//! loops on its own.

use std::sync::Arc;

use log::{info, warn};

use super::assemble::assemble;
use super::dkim_service::DkimService;
use super::encrypt;
use super::relay::Relay;
use crate::mime::addr::MailAddr;
use crate::queue::{Delivery, Handler};
use crate::store::models::{Email, Kind, Status};
use crate::store::Store;
use crate::support::error::Error;
use crate::support::report::Reporter;

pub struct OutboundWorker {
    store: Store,
    dkim: Arc<DkimService>,
    relay: Arc<dyn Relay>,
    reporter: Arc<dyn Reporter>,
}

impl OutboundWorker {
    pub fn new(
        store: Store,
        dkim: Arc<DkimService>,
        relay: Arc<dyn Relay>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            store,
            dkim,
            relay,
            reporter,
        }
    }

    fn send_email(&self, email: &Email) -> Result<(), Error> {
        // Resolve the reply target: an explicit In-Reply-To wins, else the
        // newest received mail in the thread from one of our recipients.
        let in_reply_to = if !email.in_reply_to.is_empty() {
            email.in_reply_to.clone()
        } else {
            self.store
                .last_received_in_thread(&email.thread, &email.to)?
                .map(|last| last.message_id)
                .unwrap_or_default()
        };

        let files = self.store.files(&email.files)?;

        let subject_hash = if Kind::Manifest == email.kind {
            Some(
                self.store
                    .thread(&email.thread)?
                    .ok_or(Error::NxRow("threads"))?
                    .subject_hash,
            )
        } else {
            None
        };

        let wire = assemble(
            email,
            &files,
            &in_reply_to,
            subject_hash.as_deref(),
        );

        let from = MailAddr::parse_lossy(&email.from);
        let wire = match self.dkim.sign(&from.address, &wire)? {
            Some(signed) => signed,
            None => {
                warn!(
                    "[{}] sending unsigned: no DKIM signer for {}",
                    email.id, from.address,
                );
                wire
            },
        };

        let mut recipients = Vec::new();
        for raw in email.to.iter().chain(email.cc.iter()) {
            let addr =
                MailAddr::parse(raw).ok_or(Error::BadAddress)?;
            recipients.push(addr.address);
        }

        self.relay.submit(&from.address, &recipients, &wire)?;
        info!(
            "[{}] relayed to {} recipient(s)",
            email.id,
            recipients.len(),
        );

        // Cleartext copies get encrypted (which also marks them sent);
        // everything else just flips the status.
        if Kind::Raw == email.kind {
            encrypt::encrypt_email(&self.store, email, &files)?;
        } else {
            self.store.update_email_status(&email.id, Status::Sent)?;
        }

        Ok(())
    }
}

impl Handler for OutboundWorker {
    fn handle(&self, delivery: &Delivery) -> Result<(), Error> {
        // The queue body is a JSON-encoded string: the email row ID.
        let id: String = serde_json::from_slice(&delivery.body)
            .map_err(|_| Error::BadQueueMessage)?;

        let email = self
            .store
            .email(&id)?
            .ok_or(Error::NxRow("emails"))?;

        if let Err(e) = self.send_email(&email) {
            self.reporter
                .capture_error(&e.to_string(), &[("id", &id)]);
            return Err(e);
        }

        Ok(())
    }
}
