//! Wire bytes -> stored draft.

use mail_parser::{Address, MessageParser, MimeHeaders};
use store::{NewAttachment, NewEmail, NewRecipient, RecipientType};
use uuid::Uuid;

use crate::error::{Error, Result};

/// The result of parsing one RFC 822 message off the wire, before the caller has
/// decided `receivedAt` or which authenticated user (if any) sent it.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub message_id: String,
    pub from_address: String,
    pub from_display_name: Option<String>,
    pub subject: String,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub recipients: Vec<NewRecipient>,
    pub attachments: Vec<NewAttachment>,
    pub size_bytes: i64,
}

impl ParsedMessage {
    /// Completes the draft with the two fields only the caller can know.
    pub fn into_new_email(self, received_at: chrono::DateTime<chrono::Utc>, sent_by_user_id: Option<Uuid>) -> NewEmail {
        NewEmail {
            message_id: self.message_id,
            from_address: self.from_address,
            from_display_name: self.from_display_name,
            subject: self.subject,
            text_body: self.text_body,
            html_body: self.html_body,
            received_at,
            size_bytes: self.size_bytes,
            in_reply_to: self.in_reply_to,
            references: self.references,
            sent_by_user_id,
            recipients: self.recipients,
            attachments: self.attachments,
        }
    }
}

/// Parses a complete RFC 822 message, accepting folded headers, MIME multipart and
/// `quoted-printable`/`base64` transfer encodings. Fails only when headers cannot be
/// parsed at all - an empty or bodiless message is still accepted.
pub fn parse(raw: &[u8]) -> Result<ParsedMessage> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or(Error::MalformedMessage)?;

    let (from_address, from_display_name) = match message.from() {
        Some(Address::List(addrs)) => addrs
            .first()
            .map(|a| {
                (
                    a.address.as_ref().map(|s| s.to_string()).unwrap_or_default(),
                    a.name.as_ref().map(|s| s.to_string()),
                )
            })
            .unwrap_or_default(),
        Some(Address::Group(groups)) => groups
            .first()
            .and_then(|g| g.addresses.first())
            .map(|a| {
                (
                    a.address.as_ref().map(|s| s.to_string()).unwrap_or_default(),
                    a.name.as_ref().map(|s| s.to_string()),
                )
            })
            .unwrap_or_default(),
        None => Default::default(),
    };

    let message_id = message
        .message_id()
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("<{}@generated>", Uuid::new_v4()));

    let in_reply_to = message.in_reply_to().as_text().map(|s| s.to_string());
    let references = message
        .references()
        .as_text_list()
        .map(|refs| refs.join(" "));

    let subject = message.subject().unwrap_or_default().to_string();
    let text_body = message.body_text(0).map(|s| s.to_string());
    let html_body = message.body_html(0).map(|s| s.to_string());

    let recipients = collect_recipients(&message, store::RecipientType::To)
        .into_iter()
        .chain(collect_recipients(&message, store::RecipientType::Cc))
        .chain(collect_recipients(&message, store::RecipientType::Bcc))
        .collect();

    let attachments = message
        .attachments()
        .map(|part| NewAttachment {
            file_name: part
                .attachment_name()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "attachment".to_string()),
            content_type: part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            content: part.contents().to_vec(),
        })
        .collect();

    Ok(ParsedMessage {
        message_id,
        from_address,
        from_display_name,
        subject,
        text_body,
        html_body,
        in_reply_to,
        references,
        recipients,
        attachments,
        size_bytes: raw.len() as i64,
    })
}

fn collect_recipients(message: &mail_parser::Message<'_>, kind: RecipientType) -> Vec<NewRecipient> {
    let header = match kind {
        RecipientType::To => message.to(),
        RecipientType::Cc => message.cc(),
        RecipientType::Bcc => message.bcc(),
    };

    let mut out = Vec::new();
    match header {
        Some(Address::List(addrs)) => {
            for a in addrs {
                if let Some(address) = a.address.as_ref() {
                    out.push(NewRecipient {
                        address: address.to_string(),
                        display_name: a.name.as_ref().map(|s| s.to_string()),
                        kind,
                    });
                }
            }
        }
        Some(Address::Group(groups)) => {
            for g in groups {
                for a in &g.addresses {
                    if let Some(address) = a.address.as_ref() {
                        out.push(NewRecipient {
                            address: address.to_string(),
                            display_name: a.name.as_ref().map(|s| s.to_string()),
                            kind,
                        });
                    }
                }
            }
        }
        None => {}
    }
    out
}
