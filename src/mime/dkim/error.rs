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

use thiserror::Error;

/// Reasons a DKIM signature could not be produced.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unexpected OpenSSL error: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),
    #[error("can't parse DKIM private key: {0}")]
    KeyParse(String),
    #[error("unsupported private key type for DKIM signing: {0}")]
    UnsupportedKeyType(String),
}
