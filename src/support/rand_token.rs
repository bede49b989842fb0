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

//! Random identifier generation.
//!
//! Everything that needs an unguessable, URL- and MIME-safe token goes
//! through here: multipart boundaries, delivery correlation IDs, manifest
//! part IDs and rewritten attachment names.

use rand::Rng;

const ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Length used for delivery correlation IDs.
pub const CONTEXT_ID_LEN: usize = 32;
/// Length used for multipart boundaries and manifest part IDs.
pub const TOKEN_LEN: usize = 20;

/// Generates a random alphanumeric token of the given length.
pub fn token(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Generates a fresh multipart boundary / manifest part ID.
pub fn boundary() -> String {
    token(TOKEN_LEN)
}

/// Generates a fresh delivery correlation ID.
pub fn context_id() -> String {
    token(CONTEXT_ID_LEN)
}
