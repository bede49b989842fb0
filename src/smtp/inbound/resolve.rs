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

//! Maps envelope recipients to local (address, account) pairs.
//!
//! Users write their address in many shapes: dotted variants, `+`/`,`
//! tagged aliases, mixed case, Unicode lookalikes. All of them collapse to
//! one canonical mailbox: the first comma segment of the local part is
//! NFKC-folded, lowercased and stripped to letters and digits, and the
//! result keys the `addresses` table.

use unicode_normalization::UnicodeNormalization;

use crate::store::models::{Account, Address};
use crate::store::Store;
use crate::support::error::Error;

/// Canonicalises a username: NFKC fold, lowercase, keep letters and digits
/// only (dots, plus signs and friends all die here).
pub fn canonicalise_username(name: &str) -> String {
    name.nfkc()
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Canonicalises an envelope recipient to the address-table key.
///
/// Accepts both `local@domain` and the `local,domain` alias form; in
/// either, only the first comma segment of the local part counts.
pub fn canonical_address(raw: &str) -> Result<String, Error> {
    let raw = raw.trim();
    let raw = raw
        .strip_prefix('<')
        .and_then(|r| r.strip_suffix('>'))
        .unwrap_or(raw)
        .trim();

    let (local, domain) = match raw.rsplit_once('@') {
        Some((local, domain)) => (local, domain),
        None => raw.split_once(',').ok_or(Error::BadAddress)?,
    };

    let local = local.split(',').next().unwrap_or("");
    let local = canonicalise_username(local);
    let domain = domain.trim().to_lowercase();
    if local.is_empty() || domain.is_empty() {
        return Err(Error::BadAddress);
    }

    Ok(format!("{}@{}", local, domain))
}

/// Resolves an envelope recipient against the user store.
pub fn resolve(
    store: &Store,
    raw: &str,
) -> Result<(Address, Account), Error> {
    let canonical = canonical_address(raw)?;

    let address = store
        .address(&canonical)?
        .ok_or(Error::UnknownRecipient)?;
    let account = store
        .account(&address.owner)?
        .ok_or(Error::UnknownRecipient)?;

    Ok((address, account))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::test_support::store_with_alice;

    #[test]
    fn canonicalisation_strips_dots_case_and_tags() {
        for raw in [
            "alice@example.com",
            "ALICE@EXAMPLE.COM",
            "a.l.i.c.e@example.com",
            "a.l.i.c.e,example.com",
            "alice,promo@example.com",
            "<alice@example.com>",
            "Alice@Example.Com",
        ] {
            assert_eq!(
                "alice@example.com",
                canonical_address(raw).unwrap(),
                "raw = {:?}",
                raw,
            );
        }
    }

    #[test]
    fn canonicalisation_folds_unicode() {
        // Fullwidth letters NFKC-fold to ASCII
        assert_eq!(
            "alice@example.com",
            canonical_address("ａｌｉｃｅ@example.com").unwrap(),
        );
    }

    #[test]
    fn canonicalisation_is_idempotent() {
        for raw in [
            "a.l.i.c.e,example.com",
            "Alice+tag@example.com",
            "böb@example.org",
        ] {
            let once = canonical_address(raw).unwrap();
            assert_eq!(once, canonical_address(&once).unwrap());
        }
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        for raw in ["", "nodomain", "@example.com", "...@example.com"] {
            assert_matches!(Err(Error::BadAddress), canonical_address(raw));
        }
    }

    #[test]
    fn resolve_returns_pair_for_known_address() {
        let store = store_with_alice();
        let (address, account) =
            resolve(&store, "<a.l.i.c.e,example.com>").unwrap();
        assert_eq!("alice@example.com", address.id);
        assert_eq!("alice", account.name);
    }

    #[test]
    fn resolve_rejects_unknown_recipient() {
        let store = store_with_alice();
        assert_matches!(
            Err(Error::UnknownRecipient),
            resolve(&store, "ghost@example.com"),
        );
    }
}
