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

//! Submission to the upstream SMTP relay.
//!
//! Plain SMTP, no auth; the relay's own behavior (retries, bounces,
//! deliverability) is its problem, not ours. The trait exists so tests can
//! capture submissions without a network.

use lettre::Transport;

use crate::support::error::Error;

pub trait Relay: Send + Sync {
    fn submit(
        &self,
        from: &str,
        recipients: &[String],
        message: &[u8],
    ) -> Result<(), Error>;
}

/// `Relay` over lettre's blocking SMTP transport.
pub struct SmtpRelay {
    transport: lettre::SmtpTransport,
}

impl SmtpRelay {
    /// `address` is `host:port`; a bare host gets the default submission
    /// port 25.
    pub fn new(address: &str) -> Self {
        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => {
                (host, port.parse::<u16>().unwrap_or(25))
            },
            None => (address, 25),
        };

        Self {
            transport: lettre::SmtpTransport::builder_dangerous(host)
                .port(port)
                .build(),
        }
    }
}

impl Relay for SmtpRelay {
    fn submit(
        &self,
        from: &str,
        recipients: &[String],
        message: &[u8],
    ) -> Result<(), Error> {
        let to = recipients
            .iter()
            .map(|r| r.parse())
            .collect::<Result<Vec<lettre::Address>, _>>()?;
        let envelope =
            lettre::address::Envelope::new(Some(from.parse()?), to)?;

        self.transport.send_raw(&envelope, message)?;
        Ok(())
    }
}
