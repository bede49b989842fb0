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

//! The blocking SMTP frontend.
//!
//! One thread per connection; the interesting work all happens in
//! `delivery`, this module just speaks enough RFC 5321 to drive it:
//! HELO/EHLO, MAIL, RCPT, DATA (with dot-unstuffing and a size cap), RSET,
//! NOOP, QUIT, and STARTTLS when a TLS acceptor is configured. A panicking
//! connection is captured to the reporter and takes only itself down.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use log::{info, warn};
use openssl::ssl::SslAcceptor;
use regex::Regex;

use super::super::codes::*;
use super::delivery::{InboundHandler, SessionState, SmtpResponse};
use crate::support::log_prefix::LogPrefix;
use crate::support::report::{capture_panics, Reporter};

lazy_static! {
    static ref RX_HELO: Regex =
        Regex::new("^(?i)(HELO|EHLO) ([^ ]*)").unwrap();
    static ref RX_MAIL: Regex =
        Regex::new("^(?i)MAIL FROM:<([^>]*)>(.*)$").unwrap();
    static ref RX_RCPT: Regex =
        Regex::new("^(?i)RCPT TO:<(?:@[^:]+:)?([^>]+)>(.*)$").unwrap();
}

/// Knobs of the SMTP frontend. Zero means "no limit" / "no timeout"
/// throughout, which is also what the flag defaults give.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub hostname: String,
    pub welcome: String,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub data_timeout_secs: u64,
    pub max_connections: usize,
    pub max_message_size: usize,
    pub max_recipients: usize,
}

pub struct Server {
    config: ServerConfig,
    tls: Option<SslAcceptor>,
    handler: Arc<InboundHandler>,
    reporter: Arc<dyn Reporter>,
    active: AtomicUsize,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        tls: Option<SslAcceptor>,
        handler: Arc<InboundHandler>,
        reporter: Arc<dyn Reporter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            tls,
            handler,
            reporter,
            active: AtomicUsize::new(0),
        })
    }

    /// Accept loop; runs until the listener fails.
    pub fn serve(self: &Arc<Self>, listener: TcpListener) -> io::Result<()> {
        info!("listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept()?;
            let server = Arc::clone(self);
            std::thread::spawn(move || server.run_connection(stream, peer));
        }
    }

    fn run_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        if self.config.max_connections > 0
            && active > self.config.max_connections
        {
            let mut stream = stream;
            let _ = stream.write_all(
                format!(
                    "421 {} too many connections\r\n",
                    self.config.hostname,
                )
                .as_bytes(),
            );
            self.active.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        let log_prefix = LogPrefix::new("smtpin".to_owned());
        log_prefix.set_peer(peer.to_string());
        info!("{} connected", log_prefix);

        let peer_tag = peer.to_string();
        capture_panics(&*self.reporter, &[("peer", &peer_tag)], || {
            let mut session = Session {
                server: self,
                reader: Some(BufReader::new(Conn::Plain(stream))),
                log_prefix: log_prefix.clone(),
                state: SessionState::default(),
                has_helo: false,
                has_mail: false,
                tls_active: false,
                quit: false,
            };
            if let Err(e) = session.run() {
                info!("{} connection ended: {}", log_prefix, e);
            }
        });

        self.active.fetch_sub(1, Ordering::SeqCst);
        info!("{} closed", log_prefix);
    }
}

/// The connection transport, before or after STARTTLS.
enum Conn {
    Plain(TcpStream),
    Tls(Box<openssl::ssl::SslStream<TcpStream>>),
}

impl Conn {
    fn socket(&self) -> &TcpStream {
        match *self {
            Conn::Plain(ref s) => s,
            Conn::Tls(ref t) => t.get_ref(),
        }
    }
}

impl Read for Conn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match *self {
            Conn::Plain(ref mut s) => s.read(buf),
            Conn::Tls(ref mut t) => t.read(buf),
        }
    }
}

impl Write for Conn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match *self {
            Conn::Plain(ref mut s) => s.write(buf),
            Conn::Tls(ref mut t) => t.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match *self {
            Conn::Plain(ref mut s) => s.flush(),
            Conn::Tls(ref mut t) => t.flush(),
        }
    }
}

struct Session<'a> {
    server: &'a Server,
    /// Always `Some` except transiently during the STARTTLS swap.
    reader: Option<BufReader<Conn>>,
    log_prefix: LogPrefix,
    state: SessionState,
    has_helo: bool,
    has_mail: bool,
    tls_active: bool,
    quit: bool,
}

impl Session<'_> {
    fn run(&mut self) -> io::Result<()> {
        self.apply_timeouts(self.server.config.read_timeout_secs)?;

        let greeting = format!(
            "220 {} ESMTP {}",
            self.server.config.hostname, self.server.config.welcome,
        );
        self.reply(&greeting)?;

        while !self.quit {
            let mut line = Vec::new();
            let n = self
                .reader
                .as_mut()
                .expect("reader missing outside STARTTLS")
                .read_until(b'\n', &mut line)?;
            if 0 == n {
                break;
            }

            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(|c| c == '\r' || c == '\n');
            self.dispatch(line)?;
        }

        Ok(())
    }

    fn dispatch(&mut self, line: &str) -> io::Result<()> {
        if let Some(cap) = RX_HELO.captures(line) {
            let extended = cap
                .get(1)
                .unwrap()
                .as_str()
                .eq_ignore_ascii_case("EHLO");
            return self.cmd_helo(extended);
        }
        if let Some(cap) = RX_MAIL.captures(line) {
            let from = cap.get(1).unwrap().as_str().to_owned();
            return self.cmd_mail(&from);
        }
        if let Some(cap) = RX_RCPT.captures(line) {
            let rcpt = cap.get(1).unwrap().as_str().to_owned();
            return self.cmd_rcpt(&rcpt);
        }

        let verb = line
            .split(' ')
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();
        match verb.as_str() {
            "DATA" => self.cmd_data(),
            "RSET" => {
                self.reset_transaction();
                self.reply("250 2.0.0 OK")
            },
            "NOOP" => self.reply("250 2.0.0 OK"),
            "QUIT" => {
                self.quit = true;
                let bye = format!(
                    "221 2.0.0 {} closing connection",
                    self.server.config.hostname,
                );
                self.reply(&bye)
            },
            "STARTTLS" => self.cmd_starttls(),
            "MAIL" | "RCPT" | "HELO" | "EHLO" => {
                self.reply("501 5.5.2 Syntax error in parameters")
            },
            _ => self.reply("500 5.5.1 Unknown command"),
        }
    }

    fn cmd_helo(&mut self, extended: bool) -> io::Result<()> {
        self.has_helo = true;
        self.reset_transaction();

        if !extended {
            let line = format!("250 {}", self.server.config.hostname);
            return self.reply(&line);
        }

        let mut extensions = vec!["8BITMIME".to_owned()];
        if self.server.config.max_message_size > 0 {
            extensions
                .push(format!("SIZE {}", self.server.config.max_message_size));
        }
        if self.server.tls.is_some() && !self.tls_active {
            extensions.push("STARTTLS".to_owned());
        }

        let mut lines =
            vec![format!("250-{}", self.server.config.hostname)];
        for (ix, extension) in extensions.iter().enumerate() {
            if ix + 1 == extensions.len() {
                lines.push(format!("250 {}", extension));
            } else {
                lines.push(format!("250-{}", extension));
            }
        }
        for line in lines {
            self.reply(&line)?;
        }
        Ok(())
    }

    fn cmd_mail(&mut self, _from: &str) -> io::Result<()> {
        if !self.has_helo {
            return self.reply("503 5.5.1 Say HELO first");
        }
        if self.has_mail {
            return self.reply("503 5.5.1 Nested MAIL command");
        }

        self.has_mail = true;
        self.reply("250 2.0.0 OK")
    }

    fn cmd_rcpt(&mut self, rcpt: &str) -> io::Result<()> {
        if !self.has_mail {
            return self.reply("503 5.5.1 Need MAIL before RCPT");
        }
        if self.server.config.max_recipients > 0
            && self.state.pairs.len() >= self.server.config.max_recipients
        {
            return self.reply("452 4.5.3 Too many recipients");
        }

        match self
            .server
            .handler
            .handle_recipient(&mut self.state, rcpt)
        {
            Ok(()) => self.reply("250 2.1.5 OK"),
            Err(response) => {
                info!(
                    "{} rejected recipient {}: {}",
                    self.log_prefix,
                    rcpt,
                    response.render(),
                );
                self.reply(&response.render())
            },
        }
    }

    fn cmd_data(&mut self) -> io::Result<()> {
        if !self.has_mail {
            return self.reply("503 5.5.1 Need MAIL before DATA");
        }
        if self.state.pairs.is_empty() {
            return self.reply("503 5.5.1 Need RCPT before DATA");
        }

        self.reply("354 Start mail input; end with <CRLF>.<CRLF>")?;

        self.apply_timeouts(self.server.config.data_timeout_secs)?;
        let data = self.read_data()?;
        self.apply_timeouts(self.server.config.read_timeout_secs)?;

        let max = self.server.config.max_message_size;
        let response = if max > 0 && data.len() > max {
            warn!(
                "{} message too large ({} bytes)",
                self.log_prefix,
                data.len(),
            );
            SmtpResponse(
                pc::ExceededStorageAllocation,
                Some((cc::PermFail, sc::MessageTooBigForSystem)),
                "Message too large".into(),
            )
            .render()
        } else {
            match self.server.handler.handle_delivery(&self.state, &data) {
                Ok(()) => "250 2.0.0 OK message accepted".to_owned(),
                Err(response) => response.render(),
            }
        };

        self.reset_transaction();
        self.reply(&response)
    }

    /// Reads the dot-stuffed data block.
    fn read_data(&mut self) -> io::Result<Vec<u8>> {
        let reader = self
            .reader
            .as_mut()
            .expect("reader missing outside STARTTLS");

        let mut data = Vec::new();
        loop {
            let mut line = Vec::new();
            let n = reader.read_until(b'\n', &mut line)?;
            if 0 == n {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF inside DATA",
                ));
            }

            let bare = strip_line_ending(&line);
            if bare == b"." {
                return Ok(data);
            }

            if line.first() == Some(&b'.') {
                // Dot-unstuffing
                data.extend_from_slice(&line[1..]);
            } else {
                data.extend_from_slice(&line);
            }
        }
    }

    fn cmd_starttls(&mut self) -> io::Result<()> {
        if self.tls_active {
            return self.reply("503 5.5.1 TLS already active");
        }
        let Some(ref acceptor) = self.server.tls else {
            return self.reply("502 5.5.1 STARTTLS not offered");
        };

        self.reply("220 2.0.0 Ready to start TLS")?;

        let reader = self.reader.take().expect("reader missing");
        let Conn::Plain(stream) = reader.into_inner() else {
            unreachable!("STARTTLS on a TLS connection");
        };

        match acceptor.accept(stream) {
            Ok(tls) => {
                self.reader =
                    Some(BufReader::new(Conn::Tls(Box::new(tls))));
                self.tls_active = true;
                // The client must start over per RFC 3207
                self.has_helo = false;
                self.reset_transaction();
                Ok(())
            },
            Err(e) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("TLS handshake failed: {}", e),
            )),
        }
    }

    fn reset_transaction(&mut self) {
        self.has_mail = false;
        self.state = SessionState::default();
    }

    fn reply(&mut self, line: &str) -> io::Result<()> {
        let writer = self
            .reader
            .as_mut()
            .expect("reader missing outside STARTTLS")
            .get_mut();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\r\n")?;
        writer.flush()
    }

    fn apply_timeouts(&mut self, read_secs: u64) -> io::Result<()> {
        let socket = self
            .reader
            .as_ref()
            .expect("reader missing outside STARTTLS")
            .get_ref()
            .socket();
        socket.set_read_timeout(duration_opt(read_secs))?;
        socket.set_write_timeout(duration_opt(
            self.server.config.write_timeout_secs,
        ))?;
        Ok(())
    }
}

fn duration_opt(secs: u64) -> Option<Duration> {
    if 0 == secs {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
