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

//! The delivery pipeline behind the SMTP frontend.
//!
//! `handle_recipient` runs on every RCPT TO and grows the typed
//! per-connection state by one (address, account) pair. `handle_delivery`
//! runs once per accepted DATA: spam scoring, parse, classification, kind-
//! specific extraction, then one write per recipient through the
//! `MessageWriter` seam.

use std::borrow::Cow;
use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};

use super::super::codes::*;
use super::{classify, extract, resolve};
use crate::mime::message::Message;
use crate::spam::Scorer;
use crate::store::models::{Account, Address, Email, File, Kind, Status};
use crate::store::Store;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::rand_token;

/// An SMTP response, excluding the continuation/final distinction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SmtpResponse(
    pub PrimaryCode,
    pub Option<(ClassCode, SubjectCode)>,
    pub Cow<'static, str>,
);

impl SmtpResponse {
    /// Renders the reply line, e.g. `550 5.1.1 Unknown recipient`.
    pub fn render(&self) -> String {
        match self.1 {
            Some((class, subject)) => format!(
                "{} {}.{}.{} {}",
                self.0 as u16,
                class as u8,
                subject as u8 / 10,
                subject as u8 % 10,
                self.2,
            ),
            None => format!("{} {}", self.0 as u16, self.2),
        }
    }
}

/// Typed per-connection state: one pair per accepted recipient, in RCPT
/// arrival order.
#[derive(Clone, Debug, Default)]
pub struct SessionState {
    pub pairs: Vec<(Address, Account)>,
}

/// Everything learned about one inbound message, handed to the writer.
#[derive(Clone, Debug)]
pub struct HandlerContext {
    /// Correlation ID; appears in every log line about this delivery.
    pub id: String,
    pub root: Message,
    pub kind: Kind,
    pub is_spam: bool,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    /// Detached-signature subtree of a signed message.
    pub signature: Option<Message>,
    /// Manifest bytes for the non-raw kinds.
    pub manifest: Option<Vec<u8>>,
    /// The body: re-emitted tree for `raw`, ciphertext part otherwise.
    pub body: Vec<u8>,
    pub attachments: Vec<Message>,
}

/// Persists one message for one recipient.
pub trait MessageWriter: Send + Sync {
    fn write(
        &self,
        address: &Address,
        account: &Account,
        ctx: &HandlerContext,
    ) -> Result<(), Error>;
}

/// The inbound half of the mailer.
pub struct InboundHandler {
    store: Store,
    scorer: Arc<dyn Scorer>,
    writer: Arc<dyn MessageWriter>,
    log_prefix: LogPrefix,
}

impl InboundHandler {
    pub fn new(
        store: Store,
        scorer: Arc<dyn Scorer>,
        writer: Arc<dyn MessageWriter>,
    ) -> Self {
        Self {
            store,
            scorer,
            writer,
            log_prefix: LogPrefix::new("smtpin".to_owned()),
        }
    }

    /// Handles one RCPT TO. On success the connection state has grown by
    /// one pair.
    pub fn handle_recipient(
        &self,
        state: &mut SessionState,
        raw_rcpt: &str,
    ) -> Result<(), SmtpResponse> {
        let pair = resolve::resolve(&self.store, raw_rcpt)
            .map_err(|e| error_response(&e, raw_rcpt))?;
        state.pairs.push(pair);
        Ok(())
    }

    /// Handles one completed DATA.
    pub fn handle_delivery(
        &self,
        state: &SessionState,
        data: &[u8],
    ) -> Result<(), SmtpResponse> {
        let ctx_id = rand_token::context_id();
        let log_prefix = self.log_prefix.deep_clone();
        log_prefix.set_context_id(ctx_id.clone());

        let is_spam = match self.scorer.report(data) {
            Ok(reply) => {
                info!(
                    "{} spamd: code={} message={} spam={:?}",
                    log_prefix, reply.code, reply.message, reply.is_spam,
                );
                reply.spam_verdict()
            },
            Err(e) => {
                // A scorer outage must not bounce mail
                warn!("{} spamd unavailable: {}", log_prefix, e);
                false
            },
        };

        let mut root = Message::parse(data)
            .map_err(|e| error_response(&e, "message"))?;

        let classification = classify::classify(&root)
            .map_err(|e| error_response(&e, "message"))?;

        let meta = extract::parse_meta(&root);

        let mut ctx = HandlerContext {
            id: ctx_id,
            kind: classification.kind,
            is_spam,
            from: meta.from,
            to: meta.to,
            cc: meta.cc,
            subject: meta.subject,
            signature: classification.signature,
            manifest: None,
            body: Vec::new(),
            attachments: Vec::new(),
            // root is moved in below once extraction is done with it
            root: Message::default(),
        };

        match ctx.kind {
            Kind::Raw => {
                let (body, attachments) = extract::extract_raw(&mut root);
                ctx.body = body;
                ctx.attachments = attachments;
            },
            Kind::PgpMime => {
                let (manifest, body) = extract::extract_pgp(&root)
                    .map_err(|e| error_response(&e, "message"))?;
                ctx.manifest = Some(manifest);
                ctx.body = body;
            },
            Kind::Manifest => {
                let (manifest, body, attachments) =
                    extract::extract_manifest(&mut root)
                        .map_err(|e| error_response(&e, "message"))?;
                ctx.manifest = Some(manifest);
                ctx.body = body;
                ctx.attachments = attachments;
            },
        }
        ctx.root = root;

        info!(
            "{} classified kind={} spam={} recipients={}",
            log_prefix,
            ctx.kind.as_str(),
            ctx.is_spam,
            state.pairs.len(),
        );

        for (address, account) in &state.pairs {
            self.writer
                .write(address, account, &ctx)
                .map_err(|e| error_response(&e, &address.id))?;
        }

        Ok(())
    }
}

/// Maps a pipeline error to the SMTP reply the peer sees.
fn error_response(e: &Error, what: &str) -> SmtpResponse {
    if e.is_transient() {
        return SmtpResponse(
            pc::ActionNotTakenTemporary,
            Some((cc::TempFail, sc::OtherMailSystem)),
            Cow::Owned(format!("temporary failure processing {}", what)),
        );
    }

    match *e {
        Error::UnknownRecipient | Error::BadAddress => SmtpResponse(
            pc::ActionNotTakenPermanent,
            Some((cc::PermFail, sc::BadDestinationMailboxAddress)),
            // The "no such user - " prefix has significance with some
            // agents according to RFC 5321
            Cow::Owned(format!("no such user - {}", what)),
        ),
        _ => SmtpResponse(
            pc::TransactionFailed,
            Some((cc::PermFail, sc::OtherMediaError)),
            Cow::Owned(format!("unprocessable message: {}", e)),
        ),
    }
}

/// `MessageWriter` that persists straight into the document store.
pub struct StoreWriter {
    store: Store,
}

impl StoreWriter {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

impl MessageWriter for StoreWriter {
    fn write(
        &self,
        address: &Address,
        account: &Account,
        ctx: &HandlerContext,
    ) -> Result<(), Error> {
        let now = Utc::now();

        let mut file_ids = Vec::with_capacity(ctx.attachments.len());
        for attachment in &ctx.attachments {
            let file_id = rand_token::token(rand_token::CONTEXT_ID_LEN);
            let disposition = attachment
                .headers
                .get("Content-Disposition")
                .map(crate::mime::message::MediaType::parse);
            let name = disposition
                .as_ref()
                .and_then(|d| d.param("filename"))
                .unwrap_or("unnamed")
                .to_owned();

            self.store.put_file(&File {
                id: file_id.clone(),
                owner: account.id.clone(),
                name,
                content_type: attachment.content_type().media_type,
                body: attachment.body.clone(),
                tags: Vec::new(),
                date_created: now,
                date_modified: now,
            })?;
            file_ids.push(file_id);
        }

        let message_id = ctx
            .root
            .headers
            .get("Message-ID")
            .map(|m| m.trim().trim_matches(|c| c == '<' || c == '>'))
            .unwrap_or("")
            .to_owned();

        self.store.put_email(&Email {
            id: ctx.id.clone() + "-" + &address.id,
            owner: account.id.clone(),
            message_id,
            kind: ctx.kind,
            from: ctx.from.clone(),
            to: ctx.to.clone(),
            cc: ctx.cc.clone(),
            bcc: Vec::new(),
            name: ctx.subject.clone(),
            content_type: ctx
                .root
                .headers
                .get("Content-Type")
                .unwrap_or("text/plain")
                .to_owned(),
            body: String::from_utf8_lossy(&ctx.body).into_owned(),
            manifest: ctx
                .manifest
                .as_ref()
                .map(|m| String::from_utf8_lossy(m).into_owned())
                .unwrap_or_default(),
            in_reply_to: String::new(),
            thread: String::new(),
            status: Status::Received,
            secure: ctx.kind != Kind::Raw,
            files: file_ids,
            date_created: now,
            date_modified: now,
        })?;

        Ok(())
    }
}

#[cfg(test)]
pub mod test_support {
    use std::sync::Mutex;

    use super::*;

    /// `MessageWriter` that records what it was asked to persist.
    #[derive(Default)]
    pub struct RecordingWriter {
        pub written: Mutex<Vec<(String, HandlerContext)>>,
    }

    impl MessageWriter for RecordingWriter {
        fn write(
            &self,
            address: &Address,
            _account: &Account,
            ctx: &HandlerContext,
        ) -> Result<(), Error> {
            self.written
                .lock()
                .unwrap()
                .push((address.id.clone(), ctx.clone()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::test_support::RecordingWriter;
    use super::*;
    use crate::spam::test_support::StaticScorer;
    use crate::store::test_support::store_with_alice;

    fn handler_with(
        scorer: StaticScorer,
    ) -> (InboundHandler, Arc<RecordingWriter>) {
        let writer = Arc::new(RecordingWriter::default());
        let handler = InboundHandler::new(
            store_with_alice(),
            Arc::new(scorer),
            writer.clone(),
        );
        (handler, writer)
    }

    #[test]
    fn unknown_recipient_is_a_550() {
        let (handler, _) = handler_with(StaticScorer::ham());
        let mut state = SessionState::default();
        let response = handler
            .handle_recipient(&mut state, "<ghost@example.com>")
            .unwrap_err();
        assert_eq!(pc::ActionNotTakenPermanent, response.0);
        assert!(response.render().starts_with("550 5.1.1 "));
        assert!(state.pairs.is_empty());
    }

    #[test]
    fn tagged_alias_resolves_and_grows_state() {
        let (handler, _) = handler_with(StaticScorer::ham());
        let mut state = SessionState::default();
        handler
            .handle_recipient(&mut state, "<a.l.i.c.e,example.com>")
            .unwrap();
        assert_eq!(1, state.pairs.len());
        assert_eq!("alice@example.com", state.pairs[0].0.id);
        assert_eq!("alice", state.pairs[0].1.name);
    }

    #[test]
    fn cleartext_delivery_writes_raw_row_per_recipient() {
        let (handler, writer) = handler_with(StaticScorer::ham());
        let mut state = SessionState::default();
        handler
            .handle_recipient(&mut state, "alice@example.com")
            .unwrap();

        handler
            .handle_delivery(
                &state,
                b"From: bob@example.org\r\n\
                  To: alice@example.com\r\n\
                  Subject: hello\r\n\
                  \r\n\
                  plain text\r\n",
            )
            .unwrap();

        let written = writer.written.lock().unwrap();
        assert_eq!(1, written.len());
        let (address, ctx) = &written[0];
        assert_eq!("alice@example.com", address);
        assert_eq!(Kind::Raw, ctx.kind);
        assert!(!ctx.is_spam);
        assert!(ctx.manifest.is_none());
        // The body is a re-emit of the tree; with no attachments nothing
        // was pruned. Re-emission terminates the leaf with its own CRLF.
        let reparsed = Message::parse(&ctx.body).unwrap();
        assert_eq!(b"plain text\r\n\r\n".to_vec(), reparsed.body);
    }

    #[test]
    fn pgpmime_delivery_carries_manifest_and_ciphertext() {
        let (handler, writer) = handler_with(StaticScorer::ham());
        let mut state = SessionState::default();
        handler
            .handle_recipient(&mut state, "alice@example.com")
            .unwrap();

        handler
            .handle_delivery(
                &state,
                b"Content-Type: multipart/encrypted; \
                  protocol=\"application/pgp-encrypted\"; boundary=b\r\n\
                  From: bob@example.org\r\n\
                  \r\n\
                  --b\r\n\
                  Content-Type: application/pgp-encrypted\r\n\
                  \r\n\
                  Version: 1\r\n\
                  --b\r\n\
                  Content-Type: application/octet-stream\r\n\
                  \r\n\
                  CIPHERTEXT\r\n\
                  --b--\r\n",
            )
            .unwrap();

        let written = writer.written.lock().unwrap();
        let (_, ctx) = &written[0];
        assert_eq!(Kind::PgpMime, ctx.kind);
        assert_eq!(Some(b"Version: 1".to_vec()), ctx.manifest);
        assert_eq!(b"CIPHERTEXT".to_vec(), ctx.body);
    }

    #[test]
    fn spam_verdict_is_recorded() {
        let (handler, writer) = handler_with(StaticScorer::spam());
        let mut state = SessionState::default();
        handler
            .handle_recipient(&mut state, "alice@example.com")
            .unwrap();
        handler
            .handle_delivery(&state, b"Subject: buy\r\n\r\nnow")
            .unwrap();
        assert!(writer.written.lock().unwrap()[0].1.is_spam);
    }

    #[test]
    fn scorer_outage_does_not_bounce_mail() {
        let (handler, writer) = handler_with(StaticScorer::broken());
        let mut state = SessionState::default();
        handler
            .handle_recipient(&mut state, "alice@example.com")
            .unwrap();
        handler
            .handle_delivery(&state, b"Subject: x\r\n\r\nbody")
            .unwrap();
        assert!(!writer.written.lock().unwrap()[0].1.is_spam);
    }

    #[test]
    fn unparsable_message_is_rejected_permanently() {
        let (handler, _) = handler_with(StaticScorer::ham());
        let state = SessionState::default();
        let response = handler
            .handle_delivery(
                &state,
                b"Content-Type: multipart/mixed\r\n\r\nno boundary",
            )
            .unwrap_err();
        assert_eq!(pc::TransactionFailed, response.0);
        assert!(response.render().starts_with("554 5.6.0 "));
    }

    #[test]
    fn store_writer_persists_rows_and_attachments() {
        let store = store_with_alice();
        let writer = StoreWriter::new(store.clone());
        let handler = InboundHandler::new(
            store.clone(),
            Arc::new(StaticScorer::ham()),
            Arc::new(writer),
        );

        let mut state = SessionState::default();
        handler
            .handle_recipient(&mut state, "alice@example.com")
            .unwrap();
        handler
            .handle_delivery(
                &state,
                b"Content-Type: multipart/mixed; boundary=b\r\n\
                  From: bob@example.org\r\n\
                  To: alice@example.com\r\n\
                  Subject: with file\r\n\
                  Message-ID: <m1@example.org>\r\n\
                  \r\n\
                  --b\r\n\
                  Content-Type: text/plain\r\n\
                  \r\n\
                  see attachment\r\n\
                  --b\r\n\
                  Content-Type: application/pdf\r\n\
                  Content-Disposition: attachment; filename=\"a.pdf\"\r\n\
                  Content-Transfer-Encoding: base64\r\n\
                  \r\n\
                  UERGIQ==\r\n\
                  --b--\r\n",
            )
            .unwrap();

        // One email row, one file row
        let conn_email = {
            // The row ID embeds the random context ID, so find it via the
            // thread/status index path instead: any received row works.
            // The From header was parsed, so it is stored in angle form.
            let found = store
                .last_received_in_thread(
                    "",
                    &["<bob@example.org>".to_owned()],
                )
                .unwrap();
            found.expect("email row not written")
        };
        assert_eq!(Kind::Raw, conn_email.kind);
        assert_eq!(Status::Received, conn_email.status);
        assert_eq!("m1@example.org", conn_email.message_id);
        assert_eq!(1, conn_email.files.len());

        let file = store.file(&conn_email.files[0]).unwrap().unwrap();
        assert_eq!("a.pdf", file.name);
        assert_eq!(b"PDF!".to_vec(), file.body);
        assert_eq!("acct-alice", file.owner);
    }
}
