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

//! The per-domain signer cache.
//!
//! Lookups hit a bounded LRU; a miss reads the key row and prepares a
//! signer. Failures of any shape (row missing, key unparsable) are cached
//! as a negative entry so that a domain without a key costs one store read,
//! not one per message. The invalidator task watches the dkim_keys change
//! feed and evicts affected domains, so the next lookup reads fresh.
//!
//! Sending from a domain with no key is not an error; the message is
//! relayed unsigned.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::thread;

use log::{error, info, warn};
use lru::LruCache;

use crate::mime::dkim::DomainSigner;
use crate::store::{DkimChange, Store};
use crate::support::error::Error;
use crate::support::sysexits::EX_SOFTWARE;

pub const DEFAULT_LRU_SIZE: usize = 128;

pub struct DkimService {
    store: Store,
    cache: Mutex<LruCache<String, Option<Arc<DomainSigner>>>>,
}

impl DkimService {
    pub fn new(store: Store, capacity: usize) -> Arc<Self> {
        let capacity = NonZeroUsize::new(capacity)
            .or_else(|| NonZeroUsize::new(DEFAULT_LRU_SIZE))
            .expect("default LRU size is non-zero");
        Arc::new(Self {
            store,
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Signs `message` for the domain of `from_addr`.
    ///
    /// Returns the signed message (signature header prepended), or `None`
    /// when there is no signer for the domain, in which case the caller
    /// relays unsigned. An error means a signer exists but signing failed,
    /// which fails the send.
    pub fn sign(
        &self,
        from_addr: &str,
        message: &[u8],
    ) -> Result<Option<Vec<u8>>, Error> {
        let Some((_, domain)) = from_addr.rsplit_once('@') else {
            return Ok(None);
        };
        let domain = domain.to_lowercase();

        let Some(signer) = self.lookup(&domain) else {
            return Ok(None);
        };

        let header = signer.sign(message).map_err(|e| {
            error!("DKIM signing failed for {}: {}", domain, e);
            e
        })?;

        let mut signed =
            Vec::with_capacity(header.len() + 2 + message.len());
        signed.extend_from_slice(header.as_bytes());
        signed.extend_from_slice(b"\r\n");
        signed.extend_from_slice(message);
        Ok(Some(signed))
    }

    fn lookup(&self, domain: &str) -> Option<Arc<DomainSigner>> {
        if let Some(entry) =
            self.cache.lock().expect("cache poisoned").get(domain)
        {
            return entry.clone();
        }

        let signer = self.load_signer(domain);
        self.cache
            .lock()
            .expect("cache poisoned")
            .put(domain.to_owned(), signer.clone());
        signer
    }

    fn load_signer(&self, domain: &str) -> Option<Arc<DomainSigner>> {
        let row = match self.store.dkim_key(domain) {
            Ok(Some(row)) => row,
            Ok(None) => {
                info!("no DKIM key for {}", domain);
                return None;
            },
            Err(e) => {
                warn!("failed to load DKIM key for {}: {}", domain, e);
                return None;
            },
        };

        match DomainSigner::new(
            row.id.clone(),
            row.selector.clone(),
            &row.private_key,
        ) {
            Ok(signer) => Some(Arc::new(signer)),
            Err(e) => {
                warn!("unusable DKIM key for {}: {}", domain, e);
                None
            },
        }
    }

    fn evict(&self, domain: &str) {
        self.cache.lock().expect("cache poisoned").pop(domain);
    }

    /// Applies one change-feed event.
    fn apply_change(&self, change: DkimChange) {
        // Updates and deletions evict the old domain; creations evict the
        // new one in case a negative entry is cached for it.
        if let Some(old) = change.old {
            self.evict(&old.id);
        } else if let Some(new) = change.new {
            self.evict(&new.id);
        }
    }

    /// Drains the change feed until it terminates. Exposed for tests; use
    /// `spawn_invalidator` in production.
    pub fn run_invalidator(
        &self,
        feed: std::sync::mpsc::Receiver<DkimChange>,
    ) {
        for change in feed {
            self.apply_change(change);
        }
    }

    /// Starts the background invalidator.
    ///
    /// The feed terminating means the cache can no longer be trusted, and
    /// that is fatal to the process.
    pub fn spawn_invalidator(self: &Arc<Self>) -> thread::JoinHandle<()> {
        let service = Arc::clone(self);
        let feed = self.store.subscribe_dkim_changes();
        thread::Builder::new()
            .name("dkim-invalidator".to_owned())
            .spawn(move || {
                service.run_invalidator(feed);
                error!("dkim_keys change feed terminated");
                EX_SOFTWARE.exit();
            })
            .expect("failed to spawn dkim invalidator")
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}
