//! An in-process, mutex-guarded [`crate::MessageStore`] used by every protocol
//! crate's test suite (spec §1e). Compiled only under `test_mode`; never linked
//! into the production binary.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    model::*,
    MessageStore,
};
use async_trait::async_trait;

#[derive(Default)]
struct State {
    users: HashMap<Uuid, User>,
    emails: HashMap<Uuid, Email>,
}

/// A single-process, in-memory backend. Not crash-safe, not concurrent across
/// processes - exists purely so protocol-engine tests don't need a live database.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: seed a user directly, bypassing the API layer this core treats
    /// as an external collaborator.
    pub fn seed_user(&self, user: User) {
        self.state.lock().users.insert(user.id, user);
    }

    fn resolve_user_id_by_address(state: &State, address: &str) -> Option<Uuid> {
        let needle = address.to_ascii_lowercase();
        state
            .users
            .values()
            .find(|u| u.primary_address.to_ascii_lowercase() == needle)
            .map(|u| u.id)
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn find_emails_for_user(
        &self,
        user_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<EmailSummary>> {
        let state = self.state.lock();
        let mut matches: Vec<&Email> = state
            .emails
            .values()
            .filter(|e| e.recipients.iter().any(|r| r.user_id == Some(user_id)))
            .collect();
        matches.sort_by_key(|e| e.received_at);
        Ok(matches
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .map(|e| {
                let is_read = e
                    .recipients
                    .iter()
                    .find(|r| r.user_id == Some(user_id))
                    .map(|r| r.is_read)
                    .unwrap_or(false);
                EmailSummary {
                    id: e.id,
                    message_id: e.message_id.clone(),
                    from_address: e.from_address.clone(),
                    from_display_name: e.from_display_name.clone(),
                    subject: e.subject.clone(),
                    received_at: e.received_at,
                    size_bytes: e.size_bytes,
                    thread_id: e.thread_id,
                    is_read,
                }
            })
            .collect())
    }

    async fn load_email_full(
        &self,
        email_id: Uuid,
        require_access_by_user_id: Option<Uuid>,
    ) -> Result<Email> {
        let state = self.state.lock();
        let email = state.emails.get(&email_id).ok_or(Error::NotFound)?;
        if let Some(uid) = require_access_by_user_id {
            if !email.recipients.iter().any(|r| r.user_id == Some(uid)) {
                return Err(Error::Forbidden);
            }
        }
        Ok(email.clone())
    }

    async fn mark_read(&self, email_id: Uuid, user_id: Uuid, read: bool) -> Result<()> {
        let mut state = self.state.lock();
        let email = state.emails.get_mut(&email_id).ok_or(Error::NotFound)?;
        let recipient = email
            .recipients
            .iter_mut()
            .find(|r| r.user_id == Some(user_id))
            .ok_or(Error::Forbidden)?;
        recipient.is_read = read;
        Ok(())
    }

    async fn delete_email(&self, email_id: Uuid) -> Result<()> {
        let mut state = self.state.lock();
        state.emails.remove(&email_id).ok_or(Error::NotFound)?;
        Ok(())
    }

    async fn store_incoming_email(&self, draft: NewEmail) -> Result<Uuid> {
        let mut state = self.state.lock();
        let id = Uuid::new_v4();

        let references = draft
            .references
            .as_deref()
            .map(|refs| refs.split_whitespace().collect::<Vec<_>>())
            .unwrap_or_default();
        let thread_id = draft
            .in_reply_to
            .iter()
            .map(String::as_str)
            .chain(references)
            .find_map(|mid| {
                state
                    .emails
                    .values()
                    .find(|e| e.message_id == mid)
                    .map(|e| e.thread_id.unwrap_or(e.id))
            })
            .unwrap_or(id);

        let recipients = draft
            .recipients
            .into_iter()
            .map(|r| {
                let user_id = Self::resolve_user_id_by_address(&state, &r.address);
                EmailRecipient {
                    id: Uuid::new_v4(),
                    email_id: id,
                    address: r.address,
                    display_name: r.display_name,
                    kind: r.kind,
                    user_id,
                    is_read: false,
                }
            })
            .collect();

        let attachments = draft
            .attachments
            .into_iter()
            .map(|a| EmailAttachment {
                id: Uuid::new_v4(),
                email_id: id,
                size_bytes: a.content.len() as i64,
                file_name: a.file_name,
                content_type: a.content_type,
                content: a.content,
            })
            .collect();

        let email = Email {
            id,
            message_id: draft.message_id,
            from_address: draft.from_address,
            from_display_name: draft.from_display_name,
            subject: draft.subject,
            text_body: draft.text_body,
            html_body: draft.html_body,
            received_at: draft.received_at,
            size_bytes: draft.size_bytes,
            in_reply_to: draft.in_reply_to,
            references: draft.references,
            thread_id: Some(thread_id),
            sent_by_user_id: draft.sent_by_user_id,
            recipients,
            attachments,
        };

        state.emails.insert(id, email);
        Ok(id)
    }

    async fn find_user_by_address(&self, address: &str, _with_keys: bool) -> Result<Option<User>> {
        let state = self.state.lock();
        let needle = address.to_ascii_lowercase();
        Ok(state
            .users
            .values()
            .find(|u| u.primary_address.to_ascii_lowercase() == needle)
            .cloned())
    }

    async fn touch_api_key_last_used(&self, key_id: Uuid) -> Result<()> {
        let mut state = self.state.lock();
        for user in state.users.values_mut() {
            if let Some(key) = user.api_keys.iter_mut().find(|k| k.id == key_id) {
                key.last_used_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn find_thread_id_by_message_id(&self, message_id: &str) -> Result<Option<Uuid>> {
        let state = self.state.lock();
        Ok(state
            .emails
            .values()
            .find(|e| e.message_id == message_id)
            .map(|e| e.thread_id.unwrap_or(e.id)))
    }
}
