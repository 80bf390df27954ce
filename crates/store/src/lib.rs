//! The Message Store Port: the abstract capability bundle the SMTP, POP3 and IMAP
//! session engines use to read and write emails, recipients, attachments, users and
//! API keys, without knowing the concrete database behind it.

pub mod error;
#[cfg(any(test, feature = "test_mode"))]
pub mod memory;
pub mod model;
pub mod postgres;

pub use error::{Error, Result};
pub use model::*;

use async_trait::async_trait;
use uuid::Uuid;

/// Capability bundle exposed to the protocol engines (spec §4.1).
///
/// All operations are cancelable: dropping the returned future must leave no
/// partial writes visible and release any transaction the implementation opened.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Mailbox listing for a user, ordered by `received_at` ascending.
    async fn find_emails_for_user(
        &self,
        user_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<EmailSummary>>;

    /// Full materialization of one email. When `require_access_by_user_id` is set,
    /// the caller must be a recipient of the message or [`Error::Forbidden`] is returned.
    async fn load_email_full(
        &self,
        email_id: Uuid,
        require_access_by_user_id: Option<Uuid>,
    ) -> Result<Email>;

    /// Flips `EmailRecipient.is_read` for the `(email_id, user_id)` row.
    async fn mark_read(&self, email_id: Uuid, user_id: Uuid, read: bool) -> Result<()>;

    /// Cascading delete of an email, its recipients and its attachments.
    async fn delete_email(&self, email_id: Uuid) -> Result<()>;

    /// Persists a freshly-ingested message atomically with its recipients and
    /// attachments. Every recipient address is resolved against known users at
    /// insertion time and the `user_id` back-reference is populated for matches.
    async fn store_incoming_email(&self, email: NewEmail) -> Result<Uuid>;

    /// Looks up a user by primary (or verified alias) address, case-insensitively.
    async fn find_user_by_address(&self, address: &str, with_keys: bool) -> Result<Option<User>>;

    /// Best-effort bookkeeping; failures must never fail the caller's auth flow.
    async fn touch_api_key_last_used(&self, key_id: Uuid) -> Result<()>;

    /// Looks up an email's `thread_id` by a `Message-ID` it may be threaded against
    /// (used to resolve `In-Reply-To`/`References` at ingestion time).
    async fn find_thread_id_by_message_id(&self, message_id: &str) -> Result<Option<Uuid>>;
}
