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

//! Renders stored emails into wire form.
//!
//! One of five shapes is selected by (kind, has-attachments): cleartext
//! single-part, cleartext `multipart/mixed`, PGP/MIME, and the manifest
//! form with or without attachments. The builder owns the policy the wire
//! format demands: fixed header order, CRLF everywhere, quoted-printable
//! text bodies, 76-column base64 attachments.

use crate::mime::content_encoding::{base64_encode_wrapped, qp_encode};
use crate::store::models::{Email, File, Kind};
use crate::support::chronox::ruby_date;
use crate::support::rand_token;

/// The URL clients without manifest support are pointed at.
const VIEWER_URL: &str = "https://view.lavaboom.com/#";

/// Renders `email` into the bytes handed to the DKIM signer and the relay.
///
/// `in_reply_to` is the already-resolved reply target ("" for none);
/// `subject_hash` is the thread's subject hash, required for the manifest
/// kind and ignored otherwise.
pub fn assemble(
    email: &Email,
    files: &[File],
    in_reply_to: &str,
    subject_hash: Option<&str>,
) -> Vec<u8> {
    match (email.kind, files.is_empty()) {
        (Kind::Raw, true) => raw_single(email, in_reply_to),
        (Kind::Raw, false) => raw_multi(email, files, in_reply_to),
        (Kind::PgpMime, _) => pgp_mime(email, in_reply_to),
        (Kind::Manifest, _) => {
            manifest(email, files, in_reply_to, subject_hash.unwrap_or(""))
        },
    }
}

fn raw_single(email: &Email, in_reply_to: &str) -> Vec<u8> {
    let mut wire = Wire::new();
    common_headers(&mut wire, email, in_reply_to, &email.content_type, None);
    wire.header("Content-Transfer-Encoding", "quoted-printable");
    wire.begin_body();
    wire.text(&qp_encode(email.body.as_bytes()));
    wire.finish()
}

fn raw_multi(email: &Email, files: &[File], in_reply_to: &str) -> Vec<u8> {
    let boundary = rand_token::boundary();
    let mut wire = Wire::new();
    common_headers(
        &mut wire,
        email,
        in_reply_to,
        &format!("multipart/mixed; boundary=\"{}\"", boundary),
        None,
    );
    wire.begin_body();

    wire.boundary(&boundary);
    wire.header("Content-Type", &email.content_type);
    wire.header("Content-Transfer-Encoding", "quoted-printable");
    wire.begin_body();
    wire.text(&qp_encode(email.body.as_bytes()));

    for file in files {
        wire.boundary(&boundary);
        wire.header("Content-Type", &file.content_type);
        wire.header("Content-Transfer-Encoding", "base64");
        wire.header(
            "Content-Disposition",
            &format!("attachment; filename=\"{}\"", file.name),
        );
        wire.begin_body();
        wire.text(&base64_encode_wrapped(&file.body));
    }

    wire.closing_boundary(&boundary);
    wire.finish()
}

fn pgp_mime(email: &Email, in_reply_to: &str) -> Vec<u8> {
    let boundary = rand_token::boundary();
    let mut wire = Wire::new();
    common_headers(
        &mut wire,
        email,
        in_reply_to,
        &format!(
            "multipart/encrypted; protocol=\"application/pgp-encrypted\"; \
             boundary=\"{}\"",
            boundary,
        ),
        None,
    );
    wire.begin_body();

    wire.boundary(&boundary);
    wire.header("Content-Type", "application/pgp-encrypted");
    wire.header("Content-Disposition", "attachment");
    wire.begin_body();
    wire.text(&email.manifest);

    wire.boundary(&boundary);
    wire.header("Content-Type", "application/octet-stream");
    wire.header("Content-Disposition", "attachment; filename=\"msg.asc\"");
    wire.begin_body();
    wire.text(&email.body);

    wire.closing_boundary(&boundary);
    wire.finish()
}

fn manifest(
    email: &Email,
    files: &[File],
    in_reply_to: &str,
    subject_hash: &str,
) -> Vec<u8> {
    let outer = rand_token::boundary();
    let inner = rand_token::boundary();

    let mut wire = Wire::new();
    common_headers(
        &mut wire,
        email,
        in_reply_to,
        &format!("multipart/mixed; boundary=\"{}\"", outer),
        Some(subject_hash),
    );
    wire.begin_body();

    // The alternative block: ciphertext, then fallbacks for clients that
    // cannot resolve manifests.
    wire.boundary(&outer);
    wire.header(
        "Content-Type",
        &format!("multipart/alternative; boundary=\"{}\"", inner),
    );
    wire.begin_body();

    wire.boundary(&inner);
    wire.header("Content-Type", "application/pgp-encrypted");
    wire.begin_body();
    wire.text(&email.body);

    wire.boundary(&inner);
    wire.header("Content-Type", "text/html; charset=\"UTF-8\"");
    wire.begin_body();
    wire.text(&format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         <body>\n\
         <p>This is an encrypted email, <a href=\"{}{}\">\n\
         open it here if your email client doesn't support PGP manifests\n\
         </a></p>\n\
         </body>\n\
         </html>",
        VIEWER_URL, email.id,
    ));

    wire.boundary(&inner);
    wire.header("Content-Type", "text/plain; charset=\"UTF-8\"");
    wire.begin_body();
    wire.text(&format!(
        "This is an encrypted email, open it here if your email client\n\
         doesn't support PGP manifests:\n\
         {}{}",
        VIEWER_URL, email.id,
    ));

    wire.closing_boundary(&inner);

    for file in files {
        wire.boundary(&outer);
        wire.header("Content-Type", "application/octet-stream");
        wire.header("Content-Transfer-Encoding", "base64");
        wire.header(
            "Content-Disposition",
            &format!("attachment; filename=\"{}\"", file.name),
        );
        wire.begin_body();
        wire.text(&base64_encode_wrapped(&file.body));
    }

    wire.boundary(&outer);
    wire.header("Content-Type", "application/x-pgp-manifest+json");
    wire.header(
        "Content-Disposition",
        "attachment; filename=\"manifest.pgp\"",
    );
    wire.begin_body();
    wire.text(&email.manifest);

    wire.closing_boundary(&outer);
    wire.finish()
}

/// Emits the headers every template shares, in the fixed order the wire
/// format promises.
fn common_headers(
    wire: &mut Wire,
    email: &Email,
    in_reply_to: &str,
    content_type: &str,
    subject_hash: Option<&str>,
) {
    wire.header("From", &email.from);
    wire.header("To", &email.to.join(", "));
    if !email.cc.is_empty() {
        wire.header("Cc", &email.cc.join(", "));
    }
    wire.header("Message-ID", &format!("<{}>", email.message_id));
    if !in_reply_to.is_empty() {
        wire.header("In-Reply-To", &format!("<{}>", in_reply_to));
        wire.header("References", &format!("<{}>", in_reply_to));
    }
    wire.header("Content-Type", content_type);
    wire.header("Subject", &email.name);
    if let Some(subject_hash) = subject_hash {
        wire.header("Subject-Hash", subject_hash);
    }
    wire.header("Date", &ruby_date(&email.date_created));
    wire.header("MIME-Version", "1.0");
}

/// Byte assembler that cannot produce a bare LF.
struct Wire {
    out: Vec<u8>,
}

impl Wire {
    fn new() -> Self {
        Self { out: Vec::new() }
    }

    fn header(&mut self, name: &str, value: &str) {
        self.push_normalised(name);
        self.out.extend_from_slice(b": ");
        self.push_normalised(value);
        self.out.extend_from_slice(b"\r\n");
    }

    /// Ends a header block.
    fn begin_body(&mut self) {
        self.out.extend_from_slice(b"\r\n");
    }

    /// Appends body text followed by a line ending.
    fn text(&mut self, text: &str) {
        self.push_normalised(text);
        self.out.extend_from_slice(b"\r\n");
    }

    fn boundary(&mut self, boundary: &str) {
        self.out.extend_from_slice(b"--");
        self.out.extend_from_slice(boundary.as_bytes());
        self.out.extend_from_slice(b"\r\n");
    }

    fn closing_boundary(&mut self, boundary: &str) {
        self.out.extend_from_slice(b"--");
        self.out.extend_from_slice(boundary.as_bytes());
        self.out.extend_from_slice(b"--\r\n");
    }

    fn finish(self) -> Vec<u8> {
        self.out
    }

    /// Copies `text` in, rewriting every line ending to CRLF.
    fn push_normalised(&mut self, text: &str) {
        let mut bytes = text.as_bytes().iter().copied().peekable();
        while let Some(b) = bytes.next() {
            match b {
                b'\r' if bytes.peek() == Some(&b'\n') => {
                    bytes.next();
                    self.out.extend_from_slice(b"\r\n");
                },
                b'\n' => self.out.extend_from_slice(b"\r\n"),
                b => self.out.push(b),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mime::message::Message;
    use crate::store::test_support::{email_skeleton, fixed_date};
    use crate::store::models::Status;

    fn file_pdf() -> File {
        File {
            id: "file-1".to_owned(),
            owner: "acct-alice".to_owned(),
            name: "a.pdf".to_owned(),
            content_type: "application/pdf".to_owned(),
            body: b"PDF!".to_vec(),
            tags: Vec::new(),
            date_created: fixed_date(),
            date_modified: fixed_date(),
        }
    }

    fn no_bare_lf(bytes: &[u8]) -> bool {
        !bytes.windows(2).any(|w| w[1] == b'\n' && w[0] != b'\r')
            && bytes.first() != Some(&b'\n')
    }

    fn header_names(bytes: &[u8]) -> Vec<String> {
        let text = String::from_utf8_lossy(bytes);
        text.split("\r\n\r\n")
            .next()
            .unwrap()
            .split("\r\n")
            .filter(|l| !l.starts_with(' ') && !l.starts_with('\t'))
            .map(|l| l.split(':').next().unwrap().to_owned())
            .collect()
    }

    #[test]
    fn raw_single_has_promised_header_order() {
        let email = email_skeleton("mail-1", "acct-alice");
        let wire = assemble(&email, &[], "", None);

        assert!(no_bare_lf(&wire));
        assert_eq!(
            vec![
                "From",
                "To",
                "Message-ID",
                "Content-Type",
                "Subject",
                "Date",
                "MIME-Version",
                "Content-Transfer-Encoding",
            ],
            header_names(&wire),
        );

        let parsed = Message::parse(&wire).unwrap();
        assert_eq!(b"cleartext body\r\n".to_vec(), parsed.body);
        assert_eq!(Some("1.0"), parsed.headers.get("MIME-Version"));
        assert_eq!(
            Some("<mail-1@mail.example.com>"),
            parsed.headers.get("Message-ID"),
        );
        assert_eq!(
            Some("Wed Apr 01 12:00:00 +0000 2015"),
            parsed.headers.get("Date"),
        );
    }

    #[test]
    fn cc_and_in_reply_to_are_conditional() {
        let mut email = email_skeleton("mail-1", "acct-alice");
        let wire = assemble(&email, &[], "", None);
        let names = header_names(&wire);
        assert!(!names.contains(&"Cc".to_owned()));
        assert!(!names.contains(&"In-Reply-To".to_owned()));

        email.cc = vec!["carol@example.net".to_owned()];
        let wire = assemble(&email, &[], "earlier@example.org", None);
        let names = header_names(&wire);
        assert_eq!(
            vec![
                "From",
                "To",
                "Cc",
                "Message-ID",
                "In-Reply-To",
                "References",
                "Content-Type",
                "Subject",
                "Date",
                "MIME-Version",
                "Content-Transfer-Encoding",
            ],
            names,
        );
        let parsed = Message::parse(&wire).unwrap();
        assert_eq!(
            Some("<earlier@example.org>"),
            parsed.headers.get("In-Reply-To"),
        );
    }

    #[test]
    fn raw_body_is_quoted_printable() {
        let mut email = email_skeleton("mail-1", "acct-alice");
        email.body = "naïve = tricky".to_owned();
        let wire = assemble(&email, &[], "", None);
        let parsed = Message::parse(&wire).unwrap();
        // The parser undoes the transfer encoding
        assert_eq!("naïve = tricky\r\n".as_bytes(), &parsed.body[..]);
        // But the wire form itself is 7-bit clean
        let text = String::from_utf8(wire).unwrap();
        assert!(text.contains("na=C3=AFve = tricky"));
    }

    #[test]
    fn raw_with_files_is_multipart_mixed() {
        let email = email_skeleton("mail-1", "acct-alice");
        let wire = assemble(&email, &[file_pdf()], "", None);

        assert!(no_bare_lf(&wire));
        let parsed = Message::parse(&wire).unwrap();
        assert_eq!("multipart/mixed", parsed.content_type().media_type);
        assert_eq!(2, parsed.children.len());
        assert_eq!(b"cleartext body".to_vec(), parsed.children[0].body);
        // base64 undone by the parser
        assert_eq!(b"PDF!".to_vec(), parsed.children[1].body);
        assert_eq!(
            Some("attachment; filename=\"a.pdf\""),
            parsed.children[1].headers.get("Content-Disposition"),
        );
    }

    #[test]
    fn pgpmime_template_shape() {
        let mut email = email_skeleton("mail-1", "acct-alice");
        email.kind = Kind::PgpMime;
        email.manifest = "Version: 1".to_owned();
        email.body = "-----BEGIN PGP MESSAGE-----\n...".to_owned();

        let wire = assemble(&email, &[], "", None);
        let parsed = Message::parse(&wire).unwrap();

        assert_eq!("multipart/encrypted", parsed.content_type().media_type);
        assert_eq!(
            Some("application/pgp-encrypted"),
            parsed.content_type().param("protocol"),
        );
        assert_eq!(2, parsed.children.len());
        assert_eq!(b"Version: 1".to_vec(), parsed.children[0].body);
        assert_eq!(
            Some("attachment; filename=\"msg.asc\""),
            parsed.children[1].headers.get("Content-Disposition"),
        );
        assert!(parsed.children[1]
            .body
            .starts_with(b"-----BEGIN PGP MESSAGE-----"));
    }

    #[test]
    fn manifest_template_shape() {
        let mut email = email_skeleton("mail-1", "acct-alice");
        email.kind = Kind::Manifest;
        email.status = Status::Queued;
        email.manifest = "ARMORED MANIFEST".to_owned();
        email.body = "ARMORED BODY".to_owned();

        let wire = assemble(&email, &[], "", Some("subjecthash123"));
        let text = String::from_utf8_lossy(&wire).into_owned();
        assert!(no_bare_lf(&wire));
        assert!(text.contains("Subject-Hash: subjecthash123"));
        assert!(
            text.contains("https://view.lavaboom.com/#mail-1"),
            "viewer link missing",
        );

        let parsed = Message::parse(&wire).unwrap();
        assert_eq!("multipart/mixed", parsed.content_type().media_type);
        assert_eq!(2, parsed.children.len());

        let alternative = &parsed.children[0];
        assert_eq!(
            "multipart/alternative",
            alternative.content_type().media_type,
        );
        assert_eq!(3, alternative.children.len());
        assert_eq!(b"ARMORED BODY".to_vec(), alternative.children[0].body);
        assert_eq!(
            "text/html",
            alternative.children[1].content_type().media_type,
        );
        assert_eq!(
            "text/plain",
            alternative.children[2].content_type().media_type,
        );

        let manifest_part = &parsed.children[1];
        assert_eq!(
            "application/x-pgp-manifest+json",
            manifest_part.content_type().media_type,
        );
        assert_eq!(b"ARMORED MANIFEST".to_vec(), manifest_part.body);
    }

    #[test]
    fn manifest_with_files_inserts_them_before_the_manifest() {
        let mut email = email_skeleton("mail-1", "acct-alice");
        email.kind = Kind::Manifest;
        email.manifest = "M".to_owned();
        email.body = "B".to_owned();

        let wire = assemble(&email, &[file_pdf()], "", Some("h"));
        let parsed = Message::parse(&wire).unwrap();
        assert_eq!(3, parsed.children.len());
        assert_eq!(
            "application/octet-stream",
            parsed.children[1].content_type().media_type,
        );
        assert_eq!(b"PDF!".to_vec(), parsed.children[1].body);
        assert_eq!(
            "application/x-pgp-manifest+json",
            parsed.children[2].content_type().media_type,
        );
    }
}
