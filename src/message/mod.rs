//! Plain-text message construction.
//!
//! Every campaign message has the same shape: one sender, one
//! recipient, a subject and a text body carried as the single part of
//! a `multipart/mixed` container.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};

/// Longest line allowed in a 7bit body (RFC 5322 limit without CRLF).
const MAX_LINE_LENGTH: usize = 998;

/// Raw bytes per RFC 2047 encoded-word. 39 bytes encode to 52 base64
/// characters, so `Subject: =?UTF-8?B?...?=` stays within 78 columns.
const ENCODED_WORD_BYTES: usize = 39;

/// Mailbox address.
///
/// Syntax is deliberately not checked beyond what would corrupt the
/// SMTP command stream; the server is the judge of deliverability.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    email: String,
}

impl Address {
    /// Creates a sender address.
    pub fn sender(email: impl Into<String>) -> SmtpResult<Self> {
        Self::checked(email.into(), SmtpErrorKind::InvalidFromAddress)
    }

    /// Creates a recipient address.
    pub fn recipient(email: impl Into<String>) -> SmtpResult<Self> {
        Self::checked(email.into(), SmtpErrorKind::InvalidRecipientAddress)
    }

    fn checked(email: String, kind: SmtpErrorKind) -> SmtpResult<Self> {
        let email = email.trim().to_string();
        if email.is_empty() {
            return Err(SmtpError::message_error(kind, "Address cannot be empty"));
        }
        if email.chars().any(|c| c.is_control() || c == '<' || c == '>') {
            return Err(SmtpError::message_error(
                kind,
                format!("Address contains forbidden characters: {:?}", email),
            ));
        }
        Ok(Self { email })
    }

    /// Returns the address text.
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Returns the part after the last `@`, if any.
    pub fn domain(&self) -> Option<&str> {
        self.email
            .rsplit_once('@')
            .map(|(_, domain)| domain)
            .filter(|d| !d.is_empty())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.email)
    }
}

/// A single-recipient plain-text message.
#[derive(Debug, Clone)]
pub struct PlainTextMessage {
    from: Address,
    to: Address,
    subject: String,
    body: String,
}

impl PlainTextMessage {
    /// Creates a message builder.
    pub fn builder() -> PlainTextMessageBuilder {
        PlainTextMessageBuilder::default()
    }

    /// Returns the sender.
    pub fn sender(&self) -> &Address {
        &self.from
    }

    /// Returns the recipient.
    pub fn recipient(&self) -> &Address {
        &self.to
    }

    /// Returns the subject.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Returns the body text.
    pub fn body(&self) -> &str {
        &self.body
    }
}

/// Builder for [`PlainTextMessage`].
#[derive(Debug, Default)]
pub struct PlainTextMessageBuilder {
    from: Option<String>,
    to: Option<String>,
    subject: String,
    body: String,
}

impl PlainTextMessageBuilder {
    /// Sets the sender.
    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Sets the recipient.
    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    /// Sets the subject.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Sets the body.
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Builds the message, checking both addresses.
    pub fn build(self) -> SmtpResult<PlainTextMessage> {
        let from = self.from.ok_or_else(|| {
            SmtpError::message_error(SmtpErrorKind::InvalidFromAddress, "Sender is required")
        })?;
        let to = self.to.ok_or_else(|| {
            SmtpError::message_error(
                SmtpErrorKind::InvalidRecipientAddress,
                "Recipient is required",
            )
        })?;

        Ok(PlainTextMessage {
            from: Address::sender(from)?,
            to: Address::recipient(to)?,
            subject: self.subject,
            body: self.body,
        })
    }
}

/// Transfer encoding chosen for the body part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEncoding {
    /// 7-bit ASCII (no encoding).
    SevenBit,
    /// Quoted-printable encoding.
    QuotedPrintable,
}

impl TransferEncoding {
    /// Picks 7bit when the text needs no encoding.
    pub fn for_text(text: &str) -> Self {
        let plain = text.is_ascii()
            && text.lines().all(|line| line.len() <= MAX_LINE_LENGTH)
            && !text.chars().any(|c| c.is_control() && c != '\n' && c != '\r' && c != '\t');
        if plain {
            TransferEncoding::SevenBit
        } else {
            TransferEncoding::QuotedPrintable
        }
    }

    /// Returns the header value.
    pub fn header_value(&self) -> &'static str {
        match self {
            TransferEncoding::SevenBit => "7bit",
            TransferEncoding::QuotedPrintable => "quoted-printable",
        }
    }
}

/// RFC 5322 encoder for [`PlainTextMessage`].
pub struct MessageEncoder {
    date: DateTime<Utc>,
}

impl MessageEncoder {
    /// Creates an encoder stamping messages with the current time.
    pub fn new() -> Self {
        Self { date: Utc::now() }
    }

    /// Creates an encoder with a fixed date.
    pub fn with_date(date: DateTime<Utc>) -> Self {
        Self { date }
    }

    /// Encodes the message, headers and body, with CRLF line endings.
    pub fn encode(&self, message: &PlainTextMessage) -> SmtpResult<Vec<u8>> {
        let mut output = Vec::with_capacity(message.body.len() + 512);
        let domain = message.from.domain().unwrap_or("localhost");
        let boundary = Self::generate_boundary();

        self.write_header(&mut output, "Date", &self.format_date())?;
        self.write_header(&mut output, "From", message.from.email())?;
        self.write_header(&mut output, "To", message.to.email())?;
        self.write_header(&mut output, "Subject", &Self::encode_header(&message.subject))?;
        self.write_header(
            &mut output,
            "Message-ID",
            &format!("<{}>", self.generate_message_id(domain)),
        )?;
        self.write_header(&mut output, "MIME-Version", "1.0")?;
        self.write_header(
            &mut output,
            "Content-Type",
            &format!("multipart/mixed; boundary=\"{}\"", boundary),
        )?;
        output.extend_from_slice(b"\r\n");

        let encoding = TransferEncoding::for_text(&message.body);
        output.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        self.write_header(&mut output, "Content-Type", "text/plain; charset=utf-8")?;
        self.write_header(&mut output, "Content-Transfer-Encoding", encoding.header_value())?;
        output.extend_from_slice(b"\r\n");

        let body = normalize_line_endings(&message.body);
        match encoding {
            TransferEncoding::SevenBit => output.extend_from_slice(body.as_bytes()),
            TransferEncoding::QuotedPrintable => {
                output.extend_from_slice(&quoted_printable::encode(body.as_bytes()))
            }
        }
        if !output.ends_with(b"\r\n") {
            output.extend_from_slice(b"\r\n");
        }
        output.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());

        Ok(output)
    }

    /// Writes a header line.
    fn write_header(&self, output: &mut Vec<u8>, name: &str, value: &str) -> SmtpResult<()> {
        if name.chars().any(|c| c.is_control() || c == ':') {
            return Err(SmtpError::message_error(
                SmtpErrorKind::InvalidHeader,
                format!("Invalid header name: {}", name),
            ));
        }
        if value.contains(&['\r', '\n'][..]) {
            return Err(SmtpError::message_error(
                SmtpErrorKind::InvalidHeader,
                format!("Header {} contains a line break", name),
            ));
        }

        let header = format!("{}: {}", name, value);
        output.extend_from_slice(fold_header(&header).as_bytes());
        output.extend_from_slice(b"\r\n");
        Ok(())
    }

    /// Encodes a header value using RFC 2047 when it is not plain ASCII.
    ///
    /// The value is split on character boundaries into space-separated
    /// encoded-words so the header can be folded.
    fn encode_header(value: &str) -> String {
        if value.chars().all(|c| c.is_ascii() && !c.is_control()) {
            return value.to_string();
        }

        let mut words = Vec::new();
        let mut chunk = String::new();
        for c in value.chars() {
            if !chunk.is_empty() && chunk.len() + c.len_utf8() > ENCODED_WORD_BYTES {
                words.push(format!("=?UTF-8?B?{}?=", BASE64.encode(chunk.as_bytes())));
                chunk.clear();
            }
            chunk.push(c);
        }
        if !chunk.is_empty() {
            words.push(format!("=?UTF-8?B?{}?=", BASE64.encode(chunk.as_bytes())));
        }
        words.join(" ")
    }

    fn generate_message_id(&self, domain: &str) -> String {
        format!("{}.{}@{}", Uuid::new_v4(), self.date.timestamp(), domain)
    }

    fn generate_boundary() -> String {
        format!("----=_Part_{}", Uuid::new_v4().simple())
    }

    fn format_date(&self) -> String {
        self.date.format("%a, %d %b %Y %H:%M:%S %z").to_string()
    }

    /// Prepares DATA content: dot-stuffing, trailing CRLF and the
    /// `.` terminator line.
    pub fn prepare_data_content(encoded: &[u8]) -> Vec<u8> {
        let mut output = Vec::with_capacity(encoded.len() + 16);
        let mut at_line_start = true;

        for &byte in encoded {
            if at_line_start && byte == b'.' {
                output.push(b'.');
            }
            output.push(byte);
            at_line_start = byte == b'\n';
        }

        if !output.ends_with(b"\r\n") {
            if output.ends_with(b"\n") {
                output.pop();
            }
            output.extend_from_slice(b"\r\n");
        }

        output.extend_from_slice(b".\r\n");
        output
    }
}

impl Default for MessageEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Folds a header line at 78 characters on whitespace.
fn fold_header(header: &str) -> String {
    if header.len() <= 78 {
        return header.to_string();
    }

    let mut result = String::new();
    let mut current_line = String::new();

    for word in header.split(' ') {
        if current_line.is_empty() {
            current_line = word.to_string();
        } else if current_line.len() + 1 + word.len() <= 76 {
            current_line.push(' ');
            current_line.push_str(word);
        } else {
            result.push_str(&current_line);
            result.push_str("\r\n ");
            current_line = word.to_string();
        }
    }

    result.push_str(&current_line);
    result
}

/// Converts bare LF and bare CR line endings to CRLF.
fn normalize_line_endings(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push_str("\r\n");
            }
            '\n' => out.push_str("\r\n"),
            other => out.push(other),
        }
    }
    out
}
