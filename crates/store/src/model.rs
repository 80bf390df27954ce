use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Canonical sender/recipient identity. Created by the API layer; referenced by the core.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub primary_address: String,
    pub display_name: Option<String>,
    pub api_keys: Vec<ApiKey>,
}

/// A scope token attached to an [`ApiKey`] that restricts which protocols it may authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Smtp,
    Pop3,
    Imap,
    ApiRead,
    ApiWrite,
    App,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Smtp => "smtp",
            Scope::Pop3 => "pop3",
            Scope::Imap => "imap",
            Scope::ApiRead => "api:read",
            Scope::ApiWrite => "api:write",
            Scope::App => "app",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "smtp" => Scope::Smtp,
            "pop3" => Scope::Pop3,
            "imap" => Scope::Imap,
            "api:read" => Scope::ApiRead,
            "api:write" => Scope::ApiWrite,
            "app" => Scope::App,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ApiKey {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    /// Salted one-way hash of the plaintext secret. Never leaves the verifier.
    pub key_hash: String,
    pub scopes: Vec<Scope>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn has_scope(&self, scope: Scope) -> bool {
        self.scopes.contains(&scope)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientType {
    To,
    Cc,
    Bcc,
}

impl RecipientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientType::To => "to",
            RecipientType::Cc => "cc",
            RecipientType::Bcc => "bcc",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "to" => RecipientType::To,
            "cc" => RecipientType::Cc,
            "bcc" => RecipientType::Bcc,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EmailRecipient {
    pub id: Uuid,
    pub email_id: Uuid,
    pub address: String,
    pub display_name: Option<String>,
    pub kind: RecipientType,
    pub user_id: Option<Uuid>,
    pub is_read: bool,
}

#[derive(Debug, Clone)]
pub struct EmailAttachment {
    pub id: Uuid,
    pub email_id: Uuid,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub content: Vec<u8>,
}

/// An immutable, fully materialized stored message.
#[derive(Debug, Clone)]
pub struct Email {
    pub id: Uuid,
    pub message_id: String,
    pub from_address: String,
    pub from_display_name: Option<String>,
    pub subject: String,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub received_at: DateTime<Utc>,
    pub size_bytes: i64,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub thread_id: Option<Uuid>,
    pub sent_by_user_id: Option<Uuid>,
    pub recipients: Vec<EmailRecipient>,
    pub attachments: Vec<EmailAttachment>,
}

/// A lightweight projection used for mailbox listings (no body, no attachment content).
#[derive(Debug, Clone)]
pub struct EmailSummary {
    pub id: Uuid,
    pub message_id: String,
    pub from_address: String,
    pub from_display_name: Option<String>,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub size_bytes: i64,
    pub thread_id: Option<Uuid>,
    pub is_read: bool,
}

/// Draft used to create a new stored email via [`crate::MessageStore::store_incoming_email`].
///
/// `recipients`/`attachments` carry no ids yet; the store assigns them and resolves
/// `recipient.user_id` back-references against known users/aliases at insertion time.
#[derive(Debug, Clone)]
pub struct NewEmail {
    pub message_id: String,
    pub from_address: String,
    pub from_display_name: Option<String>,
    pub subject: String,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub received_at: DateTime<Utc>,
    pub size_bytes: i64,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub sent_by_user_id: Option<Uuid>,
    pub recipients: Vec<NewRecipient>,
    pub attachments: Vec<NewAttachment>,
}

#[derive(Debug, Clone)]
pub struct NewRecipient {
    pub address: String,
    pub display_name: Option<String>,
    pub kind: RecipientType,
}

#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub file_name: String,
    pub content_type: String,
    pub content: Vec<u8>,
}
