//! The Credential Verifier (spec §4.3): validates `(identity, secret, scope)`
//! tuples against stored, hashed API keys behind a short-TTL result cache so
//! repeated client retries don't hammer the password hash function.

use std::{sync::Arc, time::Duration};

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use quick_cache::sync::Cache;
use store::{MessageStore, Scope};
use uuid::Uuid;

mod cache_entry;

use cache_entry::CacheEntry;

const CACHE_CAPACITY: usize = 10_000;
const CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("authentication failed")]
    UnknownUser,
    #[error("authentication failed")]
    BadCredential,
    #[error("authentication failed")]
    MissingScope,
    #[error("authentication failed")]
    KeyRevoked,
}

impl Error {
    /// Every variant renders identically to callers - the specific reason
    /// exists only for logging, never for a response a client can observe.
    pub fn wire_message(&self) -> &'static str {
        "authentication failed"
    }
}

pub struct Verified {
    pub user_id: Uuid,
    pub key_id: Uuid,
}

/// Process-wide, shared across every protocol listener so that a client
/// retrying the same bad password across SMTP/POP3/IMAP in quick succession
/// still only pays for the hash comparison once per TTL window.
pub struct CredentialVerifier {
    store: Arc<dyn MessageStore>,
    cache: Cache<blake3::Hash, CacheEntry>,
}

impl CredentialVerifier {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            cache: Cache::new(CACHE_CAPACITY),
        }
    }

    pub async fn verify(
        &self,
        identity: &str,
        secret: &str,
        required_scope: Scope,
    ) -> Result<Verified, Error> {
        let identity = identity.trim().to_ascii_lowercase();
        let cache_key = Self::cache_key(&identity, secret, required_scope);

        if let Some(entry) = self.cache.get(&cache_key) {
            if !entry.is_expired(CACHE_TTL) {
                return match entry {
                    CacheEntry::Positive { user_id, key_id, .. } => {
                        let store = self.store.clone();
                        tokio::spawn(async move {
                            let _ = store.touch_api_key_last_used(key_id).await;
                        });
                        Ok(Verified { user_id, key_id })
                    }
                    CacheEntry::Negative { reason, .. } => Err(reason),
                };
            }
        }

        let verdict = self.verify_uncached(&identity, secret, required_scope).await;
        let entry = match &verdict {
            Ok(ok) => CacheEntry::positive(ok.user_id, ok.key_id),
            Err(reason) => CacheEntry::negative(*reason),
        };
        self.cache.insert(cache_key, entry);
        verdict
    }

    async fn verify_uncached(
        &self,
        identity: &str,
        secret: &str,
        required_scope: Scope,
    ) -> Result<Verified, Error> {
        let user = self
            .store
            .find_user_by_address(identity, true)
            .await
            .map_err(|_| Error::UnknownUser)?
            .ok_or(Error::UnknownUser)?;

        for key in &user.api_keys {
            if key.is_revoked() {
                continue;
            }
            let Ok(parsed) = PasswordHash::new(&key.key_hash) else {
                continue;
            };
            if Argon2::default()
                .verify_password(secret.as_bytes(), &parsed)
                .is_err()
            {
                continue;
            }
            if !key.has_scope(required_scope) {
                return Err(Error::MissingScope);
            }
            return Ok(Verified {
                user_id: user.id,
                key_id: key.id,
            });
        }

        Err(Error::BadCredential)
    }

    fn cache_key(identity: &str, secret: &str, scope: Scope) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(identity.as_bytes());
        hasher.update(&[0]);
        hasher.update(secret.as_bytes());
        hasher.update(&[0]);
        hasher.update(scope.as_str().as_bytes());
        hasher.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon2::password_hash::{PasswordHasher, SaltString};
    use chrono::Utc;
    use store::{memory::MemoryStore, ApiKey, User};

    fn hash(secret: &str) -> String {
        let salt = SaltString::generate(&mut argon2::password_hash::rand_core::OsRng);
        Argon2::default()
            .hash_password(secret.as_bytes(), &salt)
            .unwrap()
            .to_string()
    }

    fn seeded_store(secret: &str, scopes: Vec<Scope>) -> (Arc<MemoryStore>, Uuid, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let user_id = Uuid::new_v4();
        let key_id = Uuid::new_v4();
        store.seed_user(User {
            id: user_id,
            primary_address: "alice@example.com".into(),
            display_name: None,
            api_keys: vec![ApiKey {
                id: key_id,
                user_id,
                name: "primary".into(),
                key_hash: hash(secret),
                scopes,
                created_at: Utc::now(),
                revoked_at: None,
                last_used_at: None,
            }],
        });
        (store, user_id, key_id)
    }

    #[tokio::test]
    async fn verifies_correct_secret_and_scope() {
        let (store, user_id, key_id) = seeded_store("s3cret", vec![Scope::Imap]);
        let verifier = CredentialVerifier::new(store);
        let verified = verifier
            .verify("alice@example.com", "s3cret", Scope::Imap)
            .await
            .expect("should verify");
        assert_eq!(verified.user_id, user_id);
        assert_eq!(verified.key_id, key_id);
    }

    #[tokio::test]
    async fn rejects_wrong_secret() {
        let (store, ..) = seeded_store("s3cret", vec![Scope::Imap]);
        let verifier = CredentialVerifier::new(store);
        let err = verifier
            .verify("alice@example.com", "wrong", Scope::Imap)
            .await
            .unwrap_err();
        assert_eq!(err, Error::BadCredential);
    }

    #[tokio::test]
    async fn rejects_missing_scope() {
        let (store, ..) = seeded_store("s3cret", vec![Scope::Pop3]);
        let verifier = CredentialVerifier::new(store);
        let err = verifier
            .verify("alice@example.com", "s3cret", Scope::Imap)
            .await
            .unwrap_err();
        assert_eq!(err, Error::MissingScope);
    }

    #[tokio::test]
    async fn rejects_unknown_user() {
        let store = Arc::new(MemoryStore::new());
        let verifier = CredentialVerifier::new(store);
        let err = verifier
            .verify("nobody@example.com", "s3cret", Scope::Imap)
            .await
            .unwrap_err();
        assert_eq!(err, Error::UnknownUser);
    }

    #[tokio::test]
    async fn caches_repeated_failures() {
        let (store, ..) = seeded_store("s3cret", vec![Scope::Imap]);
        let verifier = CredentialVerifier::new(store);
        for _ in 0..3 {
            let err = verifier
                .verify("alice@example.com", "wrong", Scope::Imap)
                .await
                .unwrap_err();
            assert_eq!(err, Error::BadCredential);
        }
    }
}
