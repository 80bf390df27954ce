//! Stored email -> wire bytes.

use mail_builder::MessageBuilder;
use store::Email;

use crate::error::{Error, Result};

/// Serializes a stored email back into RFC 5322 bytes.
///
/// Recipients are rendered verbatim, including anyone recorded as `Bcc` on the
/// original message. This mirrors retrieval-time behavior only: a user's own
/// mailbox view of a message they were `Bcc`'d on must show they were a
/// recipient, while every *other* recipient's copy never carries that header
/// in the first place because it was never addressed to them. Do not "fix"
/// this by suppressing `Bcc` wholesale; that would also hide it from the
/// `Bcc`'d recipient's own copy.
pub fn render(email: &Email) -> Result<Vec<u8>> {
    let mut builder = MessageBuilder::new()
        .from((
            email.from_display_name.clone().unwrap_or_default(),
            email.from_address.clone(),
        ))
        .subject(email.subject.clone())
        .message_id(email.message_id.clone())
        .date(email.received_at.timestamp());

    let to: Vec<(String, String)> = addresses_for(email, store::RecipientType::To);
    let cc: Vec<(String, String)> = addresses_for(email, store::RecipientType::Cc);
    let bcc: Vec<(String, String)> = addresses_for(email, store::RecipientType::Bcc);

    if !to.is_empty() {
        builder = builder.to(to);
    }
    if !cc.is_empty() {
        builder = builder.cc(cc);
    }
    if !bcc.is_empty() {
        builder = builder.bcc(bcc);
    }

    if let Some(in_reply_to) = &email.in_reply_to {
        builder = builder.in_reply_to(vec![in_reply_to.clone()]);
    }
    if let Some(references) = &email.references {
        let refs: Vec<String> = references.split_whitespace().map(|s| s.to_string()).collect();
        if !refs.is_empty() {
            builder = builder.references(refs);
        }
    }

    if let Some(text) = &email.text_body {
        builder = builder.text_body(text.clone());
    }
    if let Some(html) = &email.html_body {
        builder = builder.html_body(html.clone());
    }

    for attachment in &email.attachments {
        builder = builder.attachment(
            attachment.content_type.clone(),
            attachment.file_name.clone(),
            attachment.content.clone(),
        );
    }

    builder.write_to_vec().map_err(|_| Error::MalformedMessage)
}

fn addresses_for(email: &Email, kind: store::RecipientType) -> Vec<(String, String)> {
    email
        .recipients
        .iter()
        .filter(|r| r.kind == kind)
        .map(|r| (r.display_name.clone().unwrap_or_default(), r.address.clone()))
        .collect()
}
