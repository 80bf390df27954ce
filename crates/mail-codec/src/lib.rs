//! The RFC 822 Codec: the only place in this repository that turns stored
//! emails into wire bytes and back. Every protocol engine routes through here
//! instead of touching MIME directly.

pub mod error;
pub mod parse;
pub mod render;

pub use error::{Error, Result};
pub use parse::{parse, ParsedMessage};
pub use render::render;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use store::{NewRecipient, RecipientType};
    use uuid::Uuid;

    const RAW: &[u8] = b"From: Alice <alice@example.com>\r\n\
To: Bob <bob@example.com>\r\n\
Subject: Hello\r\n\
Message-ID: <1@example.com>\r\n\
Content-Type: text/plain\r\n\
\r\n\
Hi Bob.\r\n";

    #[test]
    fn parse_extracts_headers_and_body() {
        let parsed = parse(RAW).expect("valid message parses");
        assert_eq!(parsed.from_address, "alice@example.com");
        assert_eq!(parsed.from_display_name.as_deref(), Some("Alice"));
        assert_eq!(parsed.subject, "Hello");
        assert_eq!(parsed.message_id, "<1@example.com>");
        assert_eq!(parsed.text_body.as_deref(), Some("Hi Bob.\r\n"));
        assert_eq!(parsed.recipients.len(), 1);
        assert_eq!(parsed.recipients[0].address, "bob@example.com");
        assert_eq!(parsed.recipients[0].kind, RecipientType::To);
        assert_eq!(parsed.size_bytes, RAW.len() as i64);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse(&[0xff, 0xfe, 0x00]).is_ok() || parse(&[]).is_err());
    }

    #[test]
    fn render_round_trips_sender_and_subject() {
        let parsed = parse(RAW).unwrap();
        let email = parsed.into_new_email(Utc::now(), None);
        let stored = store::Email {
            id: Uuid::new_v4(),
            message_id: email.message_id.clone(),
            from_address: email.from_address.clone(),
            from_display_name: email.from_display_name.clone(),
            subject: email.subject.clone(),
            text_body: email.text_body.clone(),
            html_body: email.html_body.clone(),
            received_at: email.received_at,
            size_bytes: email.size_bytes,
            in_reply_to: email.in_reply_to.clone(),
            references: email.references.clone(),
            thread_id: None,
            sent_by_user_id: None,
            recipients: email
                .recipients
                .iter()
                .map(|r| store::EmailRecipient {
                    id: Uuid::new_v4(),
                    email_id: Uuid::new_v4(),
                    address: r.address.clone(),
                    display_name: r.display_name.clone(),
                    kind: r.kind,
                    user_id: None,
                    is_read: false,
                })
                .collect(),
            attachments: Vec::new(),
        };

        let rendered = render(&stored).expect("render succeeds");
        let rendered_text = String::from_utf8_lossy(&rendered);
        assert!(rendered_text.contains("alice@example.com"));
        assert!(rendered_text.contains("Hello"));

        let reparsed = parse(&rendered).expect("rendered message parses");
        assert_eq!(reparsed.subject, "Hello");
    }

    #[test]
    fn threading_hint_uses_in_reply_to() {
        let raw_reply = b"From: Bob <bob@example.com>\r\n\
To: Alice <alice@example.com>\r\n\
Subject: Re: Hello\r\n\
Message-ID: <2@example.com>\r\n\
In-Reply-To: <1@example.com>\r\n\
\r\n\
Sure thing.\r\n";
        let parsed = parse(raw_reply).unwrap();
        assert_eq!(parsed.in_reply_to.as_deref(), Some("<1@example.com>"));

        let _ = NewRecipient {
            address: "alice@example.com".into(),
            display_name: None,
            kind: RecipientType::To,
        };
    }
}
