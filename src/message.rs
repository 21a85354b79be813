//! Message body decoding.
//!
//! The protocol engine hands over the raw DATA payload once a transaction
//! completes. A [`Decoder`] turns it into a [`DecodedMessage`]; the default
//! [`MailparseDecoder`] walks the MIME tree with `mailparse`.

use mailparse::{DispositionType, MailAddr, MailHeaderMap, ParsedMail};
use serde::Serialize;

use crate::{error::DecodeError, internal};

pub trait Decoder: Send + Sync {
    /// # Errors
    /// If `raw` is not a message this decoder understands.
    fn decode(&self, raw: &[u8]) -> Result<DecodedMessage, DecodeError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Header {
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Mailbox {
    pub name: Option<String>,
    pub address: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub filename: Option<String>,
    pub content_type: String,
    pub size: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DecodedMessage {
    pub headers: Vec<Header>,
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub date: Option<String>,
    pub from: Vec<Mailbox>,
    pub to: Vec<Mailbox>,
    pub cc: Vec<Mailbox>,
    pub reply_to: Vec<Mailbox>,
    pub text: Option<String>,
    pub html: Option<String>,
    pub attachments: Vec<Attachment>,
    /// Size of the raw message in bytes
    pub size: usize,
}

impl DecodedMessage {
    /// First value of the header named `key`, compared case-insensitively
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.key.eq_ignore_ascii_case(key))
            .map(|header| header.value.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MailparseDecoder;

impl Decoder for MailparseDecoder {
    fn decode(&self, raw: &[u8]) -> Result<DecodedMessage, DecodeError> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Err(DecodeError::Empty);
        }

        let parsed = mailparse::parse_mail(raw)?;
        let headers = &parsed.headers;

        let mut message = DecodedMessage {
            headers: headers
                .iter()
                .map(|header| Header {
                    key: header.get_key(),
                    value: header.get_value(),
                })
                .collect(),
            message_id: headers
                .get_first_value("Message-ID")
                .map(|id| id.trim().trim_start_matches('<').trim_end_matches('>').to_string()),
            subject: headers.get_first_value("Subject"),
            date: headers.get_first_value("Date"),
            from: mailboxes("From", headers.get_first_value("From")),
            to: mailboxes("To", headers.get_first_value("To")),
            cc: mailboxes("Cc", headers.get_first_value("Cc")),
            reply_to: mailboxes("Reply-To", headers.get_first_value("Reply-To")),
            size: raw.len(),
            ..DecodedMessage::default()
        };

        collect_parts(&parsed, &mut message)?;

        Ok(message)
    }
}

/// Mailboxes listed in an address header.
///
/// A header that does not parse yields no mailboxes; its raw value is still
/// available through [`DecodedMessage::header`].
fn mailboxes(key: &str, value: Option<String>) -> Vec<Mailbox> {
    let Some(value) = value else {
        return Vec::default();
    };

    let single = |info: &mailparse::SingleInfo| Mailbox {
        name: info.display_name.clone(),
        address: info.addr.clone(),
    };

    match mailparse::addrparse(&value) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                MailAddr::Single(info) => vec![single(info)],
                MailAddr::Group(group) => group.addrs.iter().map(single).collect(),
            })
            .collect(),
        Err(err) => {
            internal!(level = WARN, "Ignoring unparseable {key} header {value:?}: {err}");
            Vec::default()
        }
    }
}

fn collect_parts(part: &ParsedMail<'_>, message: &mut DecodedMessage) -> Result<(), DecodeError> {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect_parts(sub, message)?;
        }
        return Ok(());
    }

    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned();
    let mimetype = part.ctype.mimetype.to_ascii_lowercase();

    if matches!(disposition.disposition, DispositionType::Attachment) || filename.is_some() {
        message.attachments.push(Attachment {
            filename,
            content_type: mimetype,
            size: part.get_body_raw()?.len(),
        });
    } else if mimetype == "text/html" && message.html.is_none() {
        message.html = Some(part.get_body()?);
    } else if mimetype.starts_with("text/") && message.text.is_none() {
        message.text = Some(part.get_body()?);
    }

    Ok(())
}
