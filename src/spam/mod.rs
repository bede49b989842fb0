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

//! Client for the spamd scoring daemon.
//!
//! Only the `REPORT` half of the SPAMC protocol is spoken here; the daemon
//! itself (SpamAssassin or compatible) is an external collaborator. A
//! message is considered spam iff the daemon answered `EX_OK` *and* its
//! verdict line says so; any protocol or connection failure is surfaced as
//! an error so the caller can decide that scoring never blocks delivery.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;

use crate::support::error::Error;

/// `EX_OK` as spamd reports it.
pub const EX_OK: u32 = 0;

/// The daemon's answer to a REPORT request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reply {
    /// Numeric status from the `SPAMD/x.y <code> <message>` line.
    pub code: u32,
    /// Textual status from the same line.
    pub message: String,
    /// The parsed `Spam:` verdict, if the reply carried one.
    pub is_spam: Option<bool>,
    /// The human-readable report body.
    pub report: String,
}

impl Reply {
    /// Whether the scored message should be flagged as spam.
    pub fn spam_verdict(&self) -> bool {
        self.code == EX_OK && self.is_spam == Some(true)
    }
}

/// Anything that can score a message.
pub trait Scorer: Send + Sync {
    fn report(&self, message: &[u8]) -> Result<Reply, Error>;
}

/// SPAMC/1.5 client against a configured spamd address.
pub struct SpamdClient {
    address: String,
}

impl SpamdClient {
    pub fn new(address: String) -> Self {
        Self { address }
    }
}

impl Scorer for SpamdClient {
    fn report(&self, message: &[u8]) -> Result<Reply, Error> {
        let mut stream = TcpStream::connect(&self.address)?;

        stream.write_all(
            format!(
                "REPORT SPAMC/1.5\r\nContent-length: {}\r\n\r\n",
                message.len(),
            )
            .as_bytes(),
        )?;
        stream.write_all(message)?;
        stream.shutdown(std::net::Shutdown::Write)?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response)?;
        parse_reply(&response)
    }
}

fn parse_reply(response: &[u8]) -> Result<Reply, Error> {
    let mut reader = BufReader::new(response);

    let mut status_line = String::new();
    reader.read_line(&mut status_line)?;
    let status_line = status_line.trim_end();

    // SPAMD/1.1 0 EX_OK
    let mut words = status_line.split_whitespace();
    let protocol = words
        .next()
        .ok_or_else(|| Error::Spamd("empty reply".to_owned()))?;
    if !protocol.starts_with("SPAMD/") {
        return Err(Error::Spamd(format!(
            "unexpected status line: {}",
            status_line,
        )));
    }
    let code = words
        .next()
        .and_then(|w| w.parse().ok())
        .ok_or_else(|| {
            Error::Spamd(format!("unparsable status line: {}", status_line))
        })?;
    let message = words.collect::<Vec<_>>().join(" ");

    let mut reply = Reply {
        code,
        message,
        is_spam: None,
        report: String::new(),
    };

    // Headers until the blank line
    loop {
        let mut line = String::new();
        if 0 == reader.read_line(&mut line)? {
            return Ok(reply);
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }

        if let Some(value) = header_value(line, "Spam") {
            // Spam: True ; 7.5 / 5.0
            let verdict = value
                .split(|c| c == ';' || c == ' ')
                .find(|w| !w.is_empty())
                .unwrap_or("");
            reply.is_spam = Some(
                verdict.eq_ignore_ascii_case("true")
                    || verdict.eq_ignore_ascii_case("yes"),
            );
        }
    }

    reader.read_to_string(&mut reply.report)?;
    Ok(reply)
}

fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (header_name, value) = line.split_once(':')?;
    if header_name.trim().eq_ignore_ascii_case(name) {
        Some(value.trim())
    } else {
        None
    }
}
