//! The POP3 Session Engine (spec §4.7): `Authorization -> Transaction ->
//! Update`, operating against a snapshot taken once at authentication time.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use common::{auth::CredentialVerifier, listener::{BoxedStream, ConnectionGuard, SessionHandler}};
use mail_codec::render;
use store::{MessageStore, Scope};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{error::SessionError, snapshot::Snapshot};

const IDLE_TIMEOUT: Duration = Duration::from_secs(600);
const MAX_MESSAGES_PER_SESSION: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Authorization,
    Transaction,
}

pub struct Pop3EngineConfig {
    pub server_name: String,
    pub store: Arc<dyn MessageStore>,
    pub verifier: Arc<CredentialVerifier>,
}

pub struct Pop3SessionHandler {
    pub config: Arc<Pop3EngineConfig>,
}

#[async_trait]
impl SessionHandler for Pop3SessionHandler {
    async fn handle(&self, stream: BoxedStream, peer_addr: SocketAddr, cancellation: CancellationToken, guard: ConnectionGuard) {
        if let Err(err) = run_session(self.config.clone(), stream, peer_addr, &cancellation, &guard).await {
            tracing::warn!(%peer_addr, kind = ?err.kind(), error = %err, "pop3 session ended with error");
        }
    }

    fn connection_limit_reply(&self) -> Option<&'static str> {
        Some("-ERR too many connections, please try again later\r\n")
    }
}

async fn run_session(
    cfg: Arc<Pop3EngineConfig>,
    stream: BoxedStream,
    peer_addr: SocketAddr,
    cancellation: &CancellationToken,
    guard: &ConnectionGuard,
) -> Result<(), SessionError> {
    let mut reader = BufReader::new(stream);
    let mut stage = Stage::Authorization;
    let mut pending_user: Option<String> = None;
    let mut user_id: Option<Uuid> = None;
    let mut snapshot = Snapshot::default();

    write_line(&mut reader, &format!("+OK {} POP3 server ready", cfg.server_name)).await?;

    loop {
        let Some(line) = read_line(&mut reader, cancellation).await? else {
            return Ok(());
        };
        let line = line.trim_end();
        let (verb, rest) = split_verb(line);

        match verb.as_str() {
            "USER" => {
                if stage != Stage::Authorization {
                    write_error(&mut reader, &SessionError::WrongState("already authenticated".to_string())).await?;
                    continue;
                }
                pending_user = Some(rest.trim().to_string());
                write_line(&mut reader, "+OK send PASS").await?;
            }
            "PASS" => {
                if stage != Stage::Authorization {
                    write_error(&mut reader, &SessionError::WrongState("already authenticated".to_string())).await?;
                    continue;
                }
                let Some(identity) = pending_user.take() else {
                    write_error(&mut reader, &SessionError::WrongState("USER required first".to_string())).await?;
                    continue;
                };
                match cfg.verifier.verify(&identity, rest.trim(), Scope::Pop3).await {
                    Ok(verified) => {
                        if !guard.register_user(verified.user_id) {
                            write_line(&mut reader, "-ERR too many connections for this user").await?;
                            return Ok(());
                        }
                        match load_snapshot(&cfg.store, verified.user_id).await {
                            Ok(snap) => {
                                snapshot = snap;
                                user_id = Some(verified.user_id);
                                stage = Stage::Transaction;
                                write_line(&mut reader, "+OK authenticated").await?;
                            }
                            Err(err) => {
                                write_error(&mut reader, &err).await?;
                                return Ok(());
                            }
                        }
                    }
                    Err(_) => {
                        write_error(&mut reader, &SessionError::Auth).await?;
                    }
                }
            }
            "STAT" => {
                if !require_transaction(stage, &mut reader).await? {
                    continue;
                }
                let (count, octets) = snapshot.stat();
                write_line(&mut reader, &format!("+OK {count} {octets}")).await?;
            }
            "LIST" => {
                if !require_transaction(stage, &mut reader).await? {
                    continue;
                }
                if let Some(n) = parse_message_number(rest) {
                    match single_message_reply(&snapshot, n) {
                        Some(entry) => {
                            write_line(&mut reader, &format!("+OK {n} {}", entry.size_bytes)).await?;
                        }
                        None => write_line(&mut reader, "-ERR no such message").await?,
                    }
                } else {
                    write_line(&mut reader, "+OK").await?;
                    for entry in snapshot.live_entries() {
                        write_line(&mut reader, &format!("{} {}", entry.message_number, entry.size_bytes)).await?;
                    }
                    write_line(&mut reader, ".").await?;
                }
            }
            "UIDL" => {
                if !require_transaction(stage, &mut reader).await? {
                    continue;
                }
                if let Some(n) = parse_message_number(rest) {
                    match single_message_reply(&snapshot, n) {
                        Some(entry) => {
                            write_line(&mut reader, &format!("+OK {n} {}", entry.unique_id)).await?;
                        }
                        None => write_line(&mut reader, "-ERR no such message").await?,
                    }
                } else {
                    write_line(&mut reader, "+OK").await?;
                    for entry in snapshot.live_entries() {
                        write_line(&mut reader, &format!("{} {}", entry.message_number, entry.unique_id)).await?;
                    }
                    write_line(&mut reader, ".").await?;
                }
            }
            "RETR" => {
                if !require_transaction(stage, &mut reader).await? {
                    continue;
                }
                match parse_message_number(rest).and_then(|n| single_message_reply(&snapshot, n).map(|e| (n, e.email_id))) {
                    Some((_, email_id)) => {
                        match fetch_and_render(&cfg.store, email_id, user_id).await {
                            Ok(raw) => {
                                write_line(&mut reader, &format!("+OK {} octets", raw.len())).await?;
                                write_dot_stuffed(&mut reader, &raw).await?;
                                let _ = cfg.store.mark_read(email_id, user_id.unwrap(), true).await;
                            }
                            Err(err) => write_error(&mut reader, &err).await?,
                        }
                    }
                    None => write_line(&mut reader, "-ERR no such message").await?,
                }
            }
            "TOP" => {
                if !require_transaction(stage, &mut reader).await? {
                    continue;
                }
                let mut parts = rest.split_whitespace();
                let n = parts.next().and_then(|s| s.parse::<usize>().ok());
                let k = parts.next().and_then(|s| s.parse::<usize>().ok());
                match (n.and_then(|n| single_message_reply(&snapshot, n).map(|e| (n, e.email_id))), k) {
                    (Some((_, email_id)), Some(k)) => {
                        match fetch_and_render(&cfg.store, email_id, user_id).await {
                            Ok(raw) => {
                                write_line(&mut reader, "+OK").await?;
                                write_top(&mut reader, &raw, k).await?;
                            }
                            Err(err) => write_error(&mut reader, &err).await?,
                        }
                    }
                    _ => write_line(&mut reader, "-ERR no such message").await?,
                }
            }
            "DELE" => {
                if !require_transaction(stage, &mut reader).await? {
                    continue;
                }
                match parse_message_number(rest) {
                    Some(n) => match snapshot.mark_deleted(n) {
                        Ok(()) => write_line(&mut reader, "+OK message marked deleted").await?,
                        Err(msg) => write_line(&mut reader, &format!("-ERR {msg}")).await?,
                    },
                    None => write_line(&mut reader, "-ERR no such message").await?,
                }
            }
            "RSET" => {
                if !require_transaction(stage, &mut reader).await? {
                    continue;
                }
                snapshot.reset();
                write_line(&mut reader, "+OK").await?;
            }
            "NOOP" => write_line(&mut reader, "+OK").await?,
            "QUIT" => {
                if stage == Stage::Transaction {
                    for email_id in snapshot.deleted_email_ids() {
                        let _ = cfg.store.delete_email(email_id).await;
                    }
                }
                write_line(&mut reader, "+OK goodbye").await?;
                return Ok(());
            }
            _ => write_error(&mut reader, &SessionError::Syntax("unknown command".to_string())).await?,
        }
    }
}

/// Writes `-ERR not authenticated` and returns `false` when `stage` isn't
/// `Transaction` yet. This is a `ProtocolSemantic` failure (spec §7): the
/// session continues, it does not close.
async fn require_transaction(stage: Stage, reader: &mut BufReader<BoxedStream>) -> Result<bool, SessionError> {
    if stage != Stage::Transaction {
        write_error(reader, &SessionError::WrongState("not authenticated".to_string())).await?;
        return Ok(false);
    }
    Ok(true)
}

fn single_message_reply(snapshot: &Snapshot, n: usize) -> Option<&crate::snapshot::SnapshotEntry> {
    if snapshot.is_deleted(n) {
        return None;
    }
    snapshot.get(n)
}

async fn load_snapshot(store: &Arc<dyn MessageStore>, user_id: Uuid) -> Result<Snapshot, SessionError> {
    let summaries = store
        .find_emails_for_user(user_id, 0, MAX_MESSAGES_PER_SESSION)
        .await
        .map_err(|_| SessionError::Storage)?;
    Ok(Snapshot::new(
        summaries
            .into_iter()
            .map(|s| (s.id, s.size_bytes, s.message_id, s.received_at))
            .collect(),
    ))
}

async fn fetch_and_render(
    store: &Arc<dyn MessageStore>,
    email_id: Uuid,
    user_id: Option<Uuid>,
) -> Result<Vec<u8>, SessionError> {
    let email = store
        .load_email_full(email_id, user_id)
        .await
        .map_err(|_| SessionError::Storage)?;
    render(&email).map_err(|_| SessionError::Storage)
}

async fn write_dot_stuffed(reader: &mut BufReader<BoxedStream>, raw: &[u8]) -> Result<(), SessionError> {
    for line in raw.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.starts_with(b".") {
            reader.get_mut().write_all(b".").await?;
        }
        reader.get_mut().write_all(line).await?;
        reader.get_mut().write_all(b"\r\n").await?;
    }
    reader.get_mut().write_all(b".\r\n").await?;
    Ok(())
}

async fn write_top(reader: &mut BufReader<BoxedStream>, raw: &[u8], body_lines: usize) -> Result<(), SessionError> {
    let text = String::from_utf8_lossy(raw);
    let Some((headers, body)) = text.split_once("\r\n\r\n") else {
        return write_dot_stuffed(reader, raw).await;
    };

    reader.get_mut().write_all(headers.as_bytes()).await?;
    reader.get_mut().write_all(b"\r\n\r\n").await?;

    for line in body.lines().take(body_lines) {
        if let Some(stripped) = line.strip_prefix('.') {
            reader.get_mut().write_all(b".").await?;
            reader.get_mut().write_all(stripped.as_bytes()).await?;
        } else {
            reader.get_mut().write_all(line.as_bytes()).await?;
        }
        reader.get_mut().write_all(b"\r\n").await?;
    }
    reader.get_mut().write_all(b".\r\n").await?;
    Ok(())
}

fn parse_message_number(rest: &str) -> Option<usize> {
    let rest = rest.trim();
    if rest.is_empty() {
        return None;
    }
    rest.split_whitespace().next()?.parse().ok()
}

async fn write_line(reader: &mut BufReader<BoxedStream>, line: &str) -> Result<(), SessionError> {
    reader.get_mut().write_all(line.as_bytes()).await?;
    reader.get_mut().write_all(b"\r\n").await?;
    Ok(())
}

/// Writes the wire line for `err.reply()`; errors with no reply (transient
/// network failures) close silently instead.
async fn write_error(reader: &mut BufReader<BoxedStream>, err: &SessionError) -> Result<(), SessionError> {
    if let Some(reply) = err.reply() {
        write_line(reader, &reply).await?;
    }
    Ok(())
}

enum ReadOutcome {
    Line(String),
    Closed,
    TimedOut,
}

async fn read_line(
    reader: &mut BufReader<BoxedStream>,
    cancellation: &CancellationToken,
) -> Result<Option<String>, SessionError> {
    match read_raw_line(reader, cancellation).await? {
        ReadOutcome::Line(line) => Ok(Some(line)),
        ReadOutcome::Closed => Ok(None),
        ReadOutcome::TimedOut => {
            write_line(reader, "-ERR session timeout").await?;
            Ok(None)
        }
    }
}

async fn read_raw_line(
    reader: &mut BufReader<BoxedStream>,
    cancellation: &CancellationToken,
) -> Result<ReadOutcome, SessionError> {
    let mut line = String::new();
    tokio::select! {
        _ = cancellation.cancelled() => Ok(ReadOutcome::Closed),
        result = tokio::time::timeout(IDLE_TIMEOUT, reader.read_line(&mut line)) => {
            match result {
                Err(_) => Ok(ReadOutcome::TimedOut),
                Ok(Ok(0)) => Ok(ReadOutcome::Closed),
                Ok(Ok(_)) => Ok(ReadOutcome::Line(line)),
                Ok(Err(err)) => Err(SessionError::Io(err)),
            }
        }
    }
}

fn split_verb(line: &str) -> (String, &str) {
    match line.split_once(' ') {
        Some((verb, rest)) => (verb.to_ascii_uppercase(), rest),
        None => (line.to_ascii_uppercase(), ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use store::{memory::MemoryStore, ApiKey, NewEmail, User};
    use tokio::io::{duplex, AsyncReadExt};

    async fn seeded_config() -> (Arc<Pop3EngineConfig>, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let user_id = Uuid::new_v4();
        let key_id = Uuid::new_v4();
        use argon2::password_hash::PasswordHasher;
        let salt = argon2::password_hash::SaltString::generate(&mut argon2::password_hash::rand_core::OsRng);
        let hash = argon2::Argon2::default()
            .hash_password(b"s3cret", &salt)
            .unwrap()
            .to_string();
        store.seed_user(User {
            id: user_id,
            primary_address: "alice@example.com".into(),
            display_name: None,
            api_keys: vec![ApiKey {
                id: key_id,
                user_id,
                name: "primary".into(),
                key_hash: hash,
                scopes: vec![Scope::Pop3],
                created_at: Utc::now(),
                revoked_at: None,
                last_used_at: None,
            }],
        });
        store
            .store_incoming_email(NewEmail {
                message_id: "<1@test>".into(),
                from_address: "bob@example.com".into(),
                from_display_name: None,
                subject: "hi".into(),
                text_body: Some("hello".into()),
                html_body: None,
                received_at: Utc::now(),
                size_bytes: 42,
                in_reply_to: None,
                references: None,
                sent_by_user_id: None,
                recipients: vec![store::NewRecipient {
                    address: "alice@example.com".into(),
                    display_name: None,
                    kind: store::RecipientType::To,
                }],
                attachments: vec![],
            })
            .await
            .unwrap();
        let store: Arc<dyn MessageStore> = store;
        let config = Arc::new(Pop3EngineConfig {
            server_name: "mail.example.com".to_string(),
            verifier: Arc::new(CredentialVerifier::new(store.clone())),
            store,
        });
        (config, user_id)
    }

    async fn run(cfg: Arc<Pop3EngineConfig>, input: &'static str) -> String {
        let (client, server) = duplex(16384);
        let cancellation = CancellationToken::new();
        let boxed: BoxedStream = Box::pin(server);

        let handle = tokio::spawn(async move {
            let _ = run_session(cfg, boxed, "127.0.0.1:0".parse().unwrap(), &cancellation, &ConnectionGuard::unbounded()).await;
        });

        let (mut read_half, mut write_half) = tokio::io::split(client);
        write_half.write_all(input.as_bytes()).await.unwrap();
        drop(write_half);

        let mut output = Vec::new();
        let _ = read_half.read_to_end(&mut output).await;
        let _ = handle.await;
        String::from_utf8_lossy(&output).to_string()
    }

    #[tokio::test]
    async fn full_session_lists_and_retrieves() {
        let (cfg, _) = seeded_config().await;
        let input = "USER alice@example.com\r\nPASS s3cret\r\nSTAT\r\nLIST\r\nRETR 1\r\nQUIT\r\n";
        let output = run(cfg, input).await;
        assert!(output.contains("+OK authenticated"));
        assert!(output.contains("+OK 1 42"));
        assert!(output.contains("+OK goodbye"));
    }

    #[tokio::test]
    async fn rejects_wrong_password() {
        let (cfg, _) = seeded_config().await;
        let input = "USER alice@example.com\r\nPASS wrong\r\nSTAT\r\nQUIT\r\n";
        let output = run(cfg, input).await;
        assert!(output.contains("-ERR authentication failed"));
        assert!(output.contains("-ERR not authenticated"));
        assert!(output.contains("+OK goodbye"), "session must stay open after an out-of-order command");
    }

    #[tokio::test]
    async fn dele_then_rset_restores_message() {
        let (cfg, _) = seeded_config().await;
        let input = "USER alice@example.com\r\nPASS s3cret\r\nDELE 1\r\nSTAT\r\nRSET\r\nSTAT\r\nQUIT\r\n";
        let output = run(cfg, input).await;
        assert!(output.contains("+OK 0 0"));
        assert!(output.contains("+OK 1 42"));
    }

    #[tokio::test]
    async fn quit_without_dele_preserves_message_for_next_session() {
        let (cfg, _) = seeded_config().await;
        let input1 = "USER alice@example.com\r\nPASS s3cret\r\nDELE 1\r\n";
        let _ = run(cfg.clone(), input1).await;

        let input2 = "USER alice@example.com\r\nPASS s3cret\r\nSTAT\r\nQUIT\r\n";
        let output = run(cfg, input2).await;
        assert!(output.contains("+OK 1 42"));
    }
}
