//! The IMAP Session Engine (spec §4.8): `NotAuthenticated -> Authenticated ->
//! Selected -> Logout`, built on [`imap_proto`]'s grammar. Only `INBOX` is
//! exposed - there is no folder hierarchy in this core.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use common::{
    auth::CredentialVerifier,
    config::ServerConfig,
    listener::{BoxedStream, ConnectionGuard, SessionHandler},
    tls::TlsTerminator,
};
use imap_proto::{parse_command, BodySection, Command, FetchItem, MessageSet, SearchKey, StoreAction};
use mail_codec::render;
use store::{MessageStore, Scope};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    error::SessionError,
    state::{derive_uid, derive_uidvalidity, MailboxEntry, MailboxState, Stage},
};

pub struct ImapEngineConfig {
    pub server_config: Arc<ServerConfig>,
    pub store: Arc<dyn MessageStore>,
    pub verifier: Arc<CredentialVerifier>,
    pub tls: Option<Arc<TlsTerminator>>,
}

pub struct ImapSessionHandler {
    pub config: Arc<ImapEngineConfig>,
}

#[async_trait]
impl SessionHandler for ImapSessionHandler {
    async fn handle(&self, stream: BoxedStream, peer_addr: SocketAddr, cancellation: CancellationToken, guard: ConnectionGuard) {
        if let Err(err) = run_session(self.config.clone(), stream, peer_addr, &cancellation, &guard).await {
            tracing::warn!(%peer_addr, kind = ?err.kind(), error = %err, "imap session ended with error");
        }
    }

    fn connection_limit_reply(&self) -> Option<&'static str> {
        Some("* BYE too many connections, please try again later\r\n")
    }
}

enum Outcome {
    Closed,
    UpgradeTls(BoxedStream),
}

async fn run_session(
    cfg: Arc<ImapEngineConfig>,
    mut stream: BoxedStream,
    peer_addr: SocketAddr,
    cancellation: &CancellationToken,
    guard: &ConnectionGuard,
) -> Result<(), SessionError> {
    let mut post_tls = false;
    loop {
        match serve_until_upgrade_or_close(&cfg, stream, peer_addr, cancellation, post_tls, guard).await? {
            Outcome::Closed => return Ok(()),
            Outcome::UpgradeTls(inner) => {
                let Some(tls) = cfg.tls.as_ref() else { return Ok(()) };
                let tls_stream = tls.upgrade_server(inner).await.map_err(|err| {
                    SessionError::Io(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
                })?;
                stream = Box::pin(tls_stream);
                post_tls = true;
            }
        }
    }
}

async fn serve_until_upgrade_or_close(
    cfg: &Arc<ImapEngineConfig>,
    stream: BoxedStream,
    peer_addr: SocketAddr,
    cancellation: &CancellationToken,
    post_tls: bool,
    guard: &ConnectionGuard,
) -> Result<Outcome, SessionError> {
    let mut reader = BufReader::new(stream);
    let mut stage = Stage::NotAuthenticated;
    let mut user_id: Option<Uuid> = None;
    let mut mailbox: Option<MailboxState> = None;

    // STARTTLS re-initializes the command reader on the upgraded channel;
    // the client already got a greeting, so skip a second one here.
    if !post_tls {
        write_untagged(&mut reader, "OK IMAP4rev2 Server Ready").await?;
    }

    loop {
        let Some(line) = read_line(&mut reader, cancellation, &cfg.server_config).await? else {
            return Ok(Outcome::Closed);
        };
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }

        let tag = extract_tag(line).unwrap_or("*").to_string();
        let parsed = parse_command(line);

        let command = match parsed {
            Ok((_, command)) => command,
            Err(_) => {
                write_tagged(&mut reader, &tag, "BAD", "command unrecognized or malformed").await?;
                continue;
            }
        };

        match command {
            Command::Capability => {
                let mut caps = "IMAP4rev2 AUTH=PLAIN".to_string();
                if stage == Stage::NotAuthenticated && cfg.tls.is_some() {
                    caps.push_str(" STARTTLS");
                }
                write_untagged(&mut reader, &format!("CAPABILITY {caps}")).await?;
                write_tagged(&mut reader, &tag, "OK", "CAPABILITY completed").await?;
            }
            Command::StartTls => {
                if stage != Stage::NotAuthenticated || cfg.tls.is_none() {
                    write_tagged(&mut reader, &tag, "BAD", "STARTTLS not permitted now").await?;
                    continue;
                }
                write_tagged(&mut reader, &tag, "OK", "begin TLS negotiation now").await?;
                return Ok(Outcome::UpgradeTls(reader.into_inner()));
            }
            Command::Login { user, pass } => {
                if stage != Stage::NotAuthenticated {
                    write_tagged(&mut reader, &tag, "BAD", "already authenticated").await?;
                    continue;
                }
                match cfg.verifier.verify(&user, &pass, Scope::Imap).await {
                    Ok(verified) => {
                        if !guard.register_user(verified.user_id) {
                            write_tagged(&mut reader, &tag, "NO", "too many connections for this user").await?;
                            return Ok(Outcome::Closed);
                        }
                        user_id = Some(verified.user_id);
                        stage = Stage::Authenticated;
                        write_tagged(&mut reader, &tag, "OK", "LOGIN completed").await?;
                    }
                    Err(_) => write_tagged(&mut reader, &tag, "NO", "authentication failed").await?,
                }
            }
            Command::Authenticate { mechanism, initial } => {
                if stage != Stage::NotAuthenticated {
                    write_tagged(&mut reader, &tag, "BAD", "already authenticated").await?;
                    continue;
                }
                if mechanism != "PLAIN" {
                    write_tagged(&mut reader, &tag, "NO", "unsupported mechanism").await?;
                    continue;
                }
                let payload = match initial {
                    Some(value) => value,
                    None => {
                        write_untagged(&mut reader, "").await?;
                        match read_line(&mut reader, cancellation, &cfg.server_config).await? {
                            Some(line) => line.trim_end().to_string(),
                            None => return Ok(Outcome::Closed),
                        }
                    }
                };
                match decode_auth_plain(&payload) {
                    Some((identity, secret)) => match cfg.verifier.verify(&identity, &secret, Scope::Imap).await {
                        Ok(verified) => {
                            if !guard.register_user(verified.user_id) {
                                write_tagged(&mut reader, &tag, "NO", "too many connections for this user").await?;
                                return Ok(Outcome::Closed);
                            }
                            user_id = Some(verified.user_id);
                            stage = Stage::Authenticated;
                            write_tagged(&mut reader, &tag, "OK", "AUTHENTICATE completed").await?;
                        }
                        Err(_) => write_tagged(&mut reader, &tag, "NO", "authentication failed").await?,
                    },
                    None => write_tagged(&mut reader, &tag, "BAD", "malformed AUTHENTICATE payload").await?,
                }
            }
            Command::Noop => {
                write_tagged(&mut reader, &tag, "OK", "NOOP completed").await?;
            }
            Command::List => {
                if stage == Stage::NotAuthenticated {
                    write_tagged(&mut reader, &tag, "NO", "not authenticated").await?;
                    continue;
                }
                write_untagged(&mut reader, r#"LIST () "/" INBOX"#).await?;
                write_tagged(&mut reader, &tag, "OK", "LIST completed").await?;
            }
            Command::Select { mailbox: name } | Command::Examine { mailbox: name } => {
                let read_only = matches!(command, Command::Examine { .. });
                if stage == Stage::NotAuthenticated {
                    write_tagged(&mut reader, &tag, "NO", "not authenticated").await?;
                    continue;
                }
                if !name.eq_ignore_ascii_case("INBOX") {
                    write_tagged(&mut reader, &tag, "NO", "mailbox does not exist").await?;
                    continue;
                }
                let uid = user_id.expect("authenticated stage always carries a user id");
                let loaded = load_mailbox(&cfg.store, uid, read_only).await?;
                write_untagged(&mut reader, &format!("{} EXISTS", loaded.len())).await?;
                write_untagged(&mut reader, &format!("{} RECENT", loaded.recent_count())).await?;
                write_untagged(&mut reader, r"FLAGS (\Seen \Deleted)").await?;
                write_untagged(&mut reader, &format!("OK [UIDVALIDITY {}] UIDs valid", derive_uidvalidity(uid))).await?;
                write_untagged(&mut reader, &format!("OK [UIDNEXT {}] predicted next UID", loaded.max_uid() + 1)).await?;
                stage = Stage::Selected;
                let status = if read_only { "READ-ONLY" } else { "READ-WRITE" };
                mailbox = Some(loaded);
                write_tagged(&mut reader, &tag, "OK", &format!("[{status}] SELECT completed")).await?;
            }
            Command::Fetch { set, uid, items } => {
                if stage != Stage::Selected {
                    write_tagged(&mut reader, &tag, "NO", "no mailbox selected").await?;
                    continue;
                }
                let mbox = mailbox.as_mut().expect("Selected stage always carries a mailbox");
                let max = if uid { mbox.max_uid() } else { mbox.len() as u32 };
                for n in set.resolve(max) {
                    let found = if uid { mbox.by_uid(n) } else { mbox.by_seq(n) };
                    let Some((seq, _)) = found else { continue };
                    let sets_seen = items
                        .iter()
                        .any(|item| matches!(item, FetchItem::Body { peek: false, .. }));
                    if sets_seen {
                        if let Some(entry) = mbox.by_seq_mut(seq) {
                            entry.seen = true;
                            let _ = cfg.store.mark_read(entry.email_id, user_id.unwrap(), true).await;
                        }
                    }
                    let entry = mbox.by_seq(seq).map(|(_, e)| e.clone());
                    if let Some(entry) = entry {
                        let data = fetch_entry_data(&cfg.store, &entry, seq, &items).await?;
                        write_untagged(&mut reader, &format!("{seq} FETCH ({data})")).await?;
                    }
                }
                write_tagged(&mut reader, &tag, "OK", "FETCH completed").await?;
            }
            Command::Store { set, uid, action, silent, flags } => {
                if stage != Stage::Selected {
                    write_tagged(&mut reader, &tag, "NO", "no mailbox selected").await?;
                    continue;
                }
                let mbox = mailbox.as_mut().expect("Selected stage always carries a mailbox");
                let max = if uid { mbox.max_uid() } else { mbox.len() as u32 };
                let seen_flag = flags.iter().any(|f| f.eq_ignore_ascii_case(r"\Seen"));
                let deleted_flag = flags.iter().any(|f| f.eq_ignore_ascii_case(r"\Deleted"));
                for n in set.resolve(max) {
                    let found = if uid { mbox.by_uid(n) } else { mbox.by_seq(n) };
                    let Some((seq, _)) = found else { continue };
                    if let Some(entry) = mbox.by_seq_mut(seq) {
                        match action {
                            StoreAction::Add => {
                                if seen_flag {
                                    entry.seen = true;
                                }
                                if deleted_flag {
                                    entry.deleted = true;
                                }
                            }
                            StoreAction::Remove => {
                                if seen_flag {
                                    entry.seen = false;
                                }
                                if deleted_flag {
                                    entry.deleted = false;
                                }
                            }
                            StoreAction::Replace => {
                                entry.seen = seen_flag;
                                entry.deleted = deleted_flag;
                            }
                        }
                        if seen_flag {
                            let email_id = entry.email_id;
                            let now_seen = entry.seen;
                            let _ = cfg.store.mark_read(email_id, user_id.unwrap(), now_seen).await;
                        }
                        if !silent {
                            let flag_list = entry_flag_list(entry);
                            write_untagged(&mut reader, &format!("{seq} FETCH (FLAGS ({flag_list}))")).await?;
                        }
                    }
                }
                write_tagged(&mut reader, &tag, "OK", "STORE completed").await?;
            }
            Command::Search { uid, keys } => {
                if stage != Stage::Selected {
                    write_tagged(&mut reader, &tag, "NO", "no mailbox selected").await?;
                    continue;
                }
                let mbox = mailbox.as_ref().expect("Selected stage always carries a mailbox");
                let mut matches = Vec::new();
                for (seq, entry) in mbox.iter() {
                    if keys.iter().all(|key| matches_search_key(key, entry)) {
                        matches.push(if uid { entry.uid } else { seq });
                    }
                }
                let body = matches.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(" ");
                write_untagged(&mut reader, &format!("SEARCH {body}")).await?;
                write_tagged(&mut reader, &tag, "OK", "SEARCH completed").await?;
            }
            Command::Expunge => {
                if stage != Stage::Selected {
                    write_tagged(&mut reader, &tag, "NO", "no mailbox selected").await?;
                    continue;
                }
                expunge_selected(&cfg.store, mailbox.as_mut().unwrap(), &mut reader).await?;
                write_tagged(&mut reader, &tag, "OK", "EXPUNGE completed").await?;
            }
            Command::Status { mailbox: name, items } => {
                if stage == Stage::NotAuthenticated {
                    write_tagged(&mut reader, &tag, "NO", "not authenticated").await?;
                    continue;
                }
                if !name.eq_ignore_ascii_case("INBOX") {
                    write_tagged(&mut reader, &tag, "NO", "mailbox does not exist").await?;
                    continue;
                }
                let uid = user_id.expect("authenticated stage always carries a user id");
                let loaded = load_mailbox(&cfg.store, uid, true).await?;
                let mut parts = Vec::new();
                for item in &items {
                    match item.as_str() {
                        "MESSAGES" => parts.push(format!("MESSAGES {}", loaded.len())),
                        "UNSEEN" => {
                            let unseen = loaded.iter().filter(|(_, e)| !e.seen).count();
                            parts.push(format!("UNSEEN {unseen}"));
                        }
                        "UIDNEXT" => parts.push(format!("UIDNEXT {}", loaded.max_uid() + 1)),
                        "UIDVALIDITY" => parts.push(format!("UIDVALIDITY {}", derive_uidvalidity(uid))),
                        other => parts.push(other.to_string()),
                    }
                }
                write_untagged(&mut reader, &format!("STATUS INBOX ({})", parts.join(" "))).await?;
                write_tagged(&mut reader, &tag, "OK", "STATUS completed").await?;
            }
            Command::Close => {
                if stage != Stage::Selected {
                    write_tagged(&mut reader, &tag, "BAD", "no mailbox selected").await?;
                    continue;
                }
                if let Some(mbox) = mailbox.as_mut() {
                    if !mbox.read_only {
                        let _ = expunge_no_response(&cfg.store, mbox).await;
                    }
                }
                mailbox = None;
                stage = Stage::Authenticated;
                write_tagged(&mut reader, &tag, "OK", "CLOSE completed").await?;
            }
            Command::Logout => {
                write_untagged(&mut reader, "BYE server logging out").await?;
                write_tagged(&mut reader, &tag, "OK", "LOGOUT completed").await?;
                return Ok(Outcome::Closed);
            }
        }
    }
}

async fn expunge_selected(
    store: &Arc<dyn MessageStore>,
    mbox: &mut MailboxState,
    reader: &mut BufReader<BoxedStream>,
) -> Result<(), SessionError> {
    let to_delete: Vec<Uuid> = mbox.iter().filter(|(_, e)| e.deleted).map(|(_, e)| e.email_id).collect();
    for email_id in &to_delete {
        let _ = store.delete_email(*email_id).await;
    }
    for seq in mbox.expunge() {
        write_untagged(reader, &format!("{seq} EXPUNGE")).await?;
    }
    Ok(())
}

async fn expunge_no_response(store: &Arc<dyn MessageStore>, mbox: &mut MailboxState) -> Result<(), SessionError> {
    let to_delete: Vec<Uuid> = mbox.iter().filter(|(_, e)| e.deleted).map(|(_, e)| e.email_id).collect();
    for email_id in &to_delete {
        let _ = store.delete_email(*email_id).await;
    }
    mbox.expunge();
    Ok(())
}

fn matches_search_key(key: &SearchKey, entry: &MailboxEntry) -> bool {
    match key {
        SearchKey::All => true,
        SearchKey::Seen => entry.seen,
        SearchKey::Unseen => !entry.seen,
        SearchKey::Deleted => entry.deleted,
        SearchKey::Undeleted => !entry.deleted,
    }
}

fn entry_flag_list(entry: &MailboxEntry) -> String {
    let mut flags = Vec::new();
    if entry.seen {
        flags.push(r"\Seen");
    }
    if entry.deleted {
        flags.push(r"\Deleted");
    }
    flags.join(" ")
}

async fn load_mailbox(store: &Arc<dyn MessageStore>, user_id: Uuid, read_only: bool) -> Result<MailboxState, SessionError> {
    let summaries = store
        .find_emails_for_user(user_id, 0, 10_000)
        .await
        .map_err(|_| SessionError::Storage)?;
    let entries = summaries
        .into_iter()
        .map(|s| MailboxEntry {
            uid: derive_uid(s.id),
            email_id: s.id,
            message_id: s.message_id,
            internal_date: s.received_at,
            size_bytes: s.size_bytes,
            seen: s.is_read,
            deleted: false,
        })
        .collect();
    Ok(MailboxState::new(entries, read_only))
}

async fn fetch_entry_data(
    store: &Arc<dyn MessageStore>,
    entry: &MailboxEntry,
    seq: u32,
    items: &[FetchItem],
) -> Result<String, SessionError> {
    let mut parts = Vec::new();
    for item in items {
        match item {
            FetchItem::Uid => parts.push(format!("UID {}", entry.uid)),
            FetchItem::Flags => parts.push(format!("FLAGS ({})", entry_flag_list(entry))),
            FetchItem::InternalDate => {
                parts.push(format!("INTERNALDATE \"{}\"", entry.internal_date.to_rfc2822()));
            }
            FetchItem::Rfc822Size => parts.push(format!("RFC822.SIZE {}", entry.size_bytes)),
            FetchItem::Envelope => {
                parts.push(format!("ENVELOPE (\"{}\" \"{}\")", entry.internal_date.to_rfc2822(), entry.message_id));
            }
            FetchItem::BodyStructure => parts.push("BODYSTRUCTURE (\"TEXT\" \"PLAIN\")".to_string()),
            FetchItem::Body { section, .. } => {
                let email = store
                    .load_email_full(entry.email_id, None)
                    .await
                    .map_err(|_| SessionError::Storage)?;
                let raw = render(&email).map_err(|_| SessionError::Storage)?;
                let slice = body_section(&raw, section);
                let label = match section {
                    BodySection::Full => "BODY[]".to_string(),
                    BodySection::Header => "BODY[HEADER]".to_string(),
                    BodySection::Text => "BODY[TEXT]".to_string(),
                };
                parts.push(format!("{label} {{{}}}\r\n{}", slice.len(), String::from_utf8_lossy(&slice)));
            }
        }
    }
    let _ = seq;
    Ok(parts.join(" "))
}

fn body_section(raw: &[u8], section: &BodySection) -> Vec<u8> {
    let text = String::from_utf8_lossy(raw);
    match section {
        BodySection::Full => raw.to_vec(),
        BodySection::Header => match text.split_once("\r\n\r\n") {
            Some((headers, _)) => format!("{headers}\r\n\r\n").into_bytes(),
            None => raw.to_vec(),
        },
        BodySection::Text => match text.split_once("\r\n\r\n") {
            Some((_, body)) => body.as_bytes().to_vec(),
            None => Vec::new(),
        },
    }
}

fn decode_auth_plain(payload: &str) -> Option<(String, String)> {
    let decoded = base64_decode_bytes(payload)?;
    let mut parts = decoded.split(|&b| b == 0);
    let _authzid = parts.next()?;
    let authcid = parts.next()?;
    let passwd = parts.next()?;
    Some((
        String::from_utf8_lossy(authcid).to_string(),
        String::from_utf8_lossy(passwd).to_string(),
    ))
}

fn base64_decode_bytes(text: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut buffer = 0u32;
    let mut bits = 0u32;
    let mut out = Vec::new();
    for ch in text.bytes() {
        if ch == b'=' {
            break;
        }
        let value = ALPHABET.iter().position(|&c| c == ch)? as u32;
        buffer = (buffer << 6) | value;
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
        }
    }
    Some(out)
}

fn extract_tag(line: &str) -> Option<&str> {
    let tag = line.split_whitespace().next()?;
    if tag.is_empty() {
        None
    } else {
        Some(tag)
    }
}

async fn write_untagged(reader: &mut BufReader<BoxedStream>, body: &str) -> Result<(), SessionError> {
    reader.get_mut().write_all(b"* ").await?;
    reader.get_mut().write_all(body.as_bytes()).await?;
    reader.get_mut().write_all(b"\r\n").await?;
    Ok(())
}

async fn write_tagged(reader: &mut BufReader<BoxedStream>, tag: &str, status: &str, body: &str) -> Result<(), SessionError> {
    reader.get_mut().write_all(tag.as_bytes()).await?;
    reader.get_mut().write_all(b" ").await?;
    reader.get_mut().write_all(status.as_bytes()).await?;
    reader.get_mut().write_all(b" ").await?;
    reader.get_mut().write_all(body.as_bytes()).await?;
    reader.get_mut().write_all(b"\r\n").await?;
    Ok(())
}

async fn read_line(
    reader: &mut BufReader<BoxedStream>,
    cancellation: &CancellationToken,
    config: &ServerConfig,
) -> Result<Option<String>, SessionError> {
    match read_raw_line(reader, cancellation, config.limits.command_timeout).await? {
        ReadOutcome::Line(line) => Ok(Some(line)),
        ReadOutcome::Closed => Ok(None),
        ReadOutcome::TimedOut => {
            write_untagged(reader, "BYE session timeout").await?;
            Ok(None)
        }
    }
}

enum ReadOutcome {
    Line(String),
    Closed,
    TimedOut,
}

async fn read_raw_line(
    reader: &mut BufReader<BoxedStream>,
    cancellation: &CancellationToken,
    timeout: Duration,
) -> Result<ReadOutcome, SessionError> {
    let mut line = String::new();
    tokio::select! {
        _ = cancellation.cancelled() => Ok(ReadOutcome::Closed),
        result = tokio::time::timeout(timeout, reader.read_line(&mut line)) => {
            match result {
                Err(_) => Ok(ReadOutcome::TimedOut),
                Ok(Ok(0)) => Ok(ReadOutcome::Closed),
                Ok(Ok(_)) => Ok(ReadOutcome::Line(line)),
                Ok(Err(err)) => Err(SessionError::Io(err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::{LimitsSection, MxSection, ProtocolSection, SmtpSection, TlsSection};
    use store::{memory::MemoryStore, ApiKey, NewEmail, NewRecipient, RecipientType, User};
    use tokio::io::{duplex, AsyncReadExt};

    async fn seeded_config() -> Arc<ImapEngineConfig> {
        use argon2::password_hash::{PasswordHasher, SaltString};

        let store = Arc::new(MemoryStore::new());
        let user_id = Uuid::new_v4();
        let key_id = Uuid::new_v4();
        let salt = SaltString::generate(&mut argon2::password_hash::rand_core::OsRng);
        let hash = argon2::Argon2::default().hash_password(b"s3cret", &salt).unwrap().to_string();
        store.seed_user(User {
            id: user_id,
            primary_address: "alice@example.com".into(),
            display_name: None,
            api_keys: vec![ApiKey {
                id: key_id,
                user_id,
                name: "primary".into(),
                key_hash: hash,
                scopes: vec![Scope::Imap],
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
                recipients: vec![NewRecipient {
                    address: "alice@example.com".into(),
                    display_name: None,
                    kind: RecipientType::To,
                }],
                attachments: vec![],
            })
            .await
            .unwrap();

        let store: Arc<dyn MessageStore> = store;
        let server_config = Arc::new(ServerConfig {
            server_name: "mail.example.com".to_string(),
            database_connection: "memory".to_string(),
            log_level: "info".to_string(),
            tls: TlsSection {
                certificate_path: "unused".to_string(),
                certificate_password: None,
                check_certificate_revocation: false,
            },
            limits: LimitsSection::default(),
            smtp: SmtpSection {
                port: 587,
                secure_port: 465,
                require_authentication: true,
                mx: MxSection::default(),
            },
            pop3: ProtocolSection { port: 110, secure_port: 995, require_authentication: true },
            imap: ProtocolSection { port: 143, secure_port: 993, require_authentication: true },
        });

        Arc::new(ImapEngineConfig {
            verifier: Arc::new(CredentialVerifier::new(store.clone())),
            store,
            server_config,
            tls: None,
        })
    }

    async fn run(cfg: Arc<ImapEngineConfig>, input: &'static str) -> String {
        let (client, server) = duplex(32768);
        let cancellation = CancellationToken::new();
        let boxed: BoxedStream = Box::pin(server);

        let handle = tokio::spawn(async move {
            let _ = serve_until_upgrade_or_close(
                &cfg,
                boxed,
                "127.0.0.1:0".parse().unwrap(),
                &cancellation,
                false,
                &ConnectionGuard::unbounded(),
            )
            .await;
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
    async fn login_select_and_fetch() {
        let cfg = seeded_config().await;
        let input = "a1 LOGIN alice@example.com s3cret\r\na2 SELECT INBOX\r\na3 FETCH 1 (UID FLAGS RFC822.SIZE)\r\na4 LOGOUT\r\n";
        let output = run(cfg, input).await;
        assert!(output.contains("a1 OK"));
        assert!(output.contains("1 EXISTS"));
        assert!(output.contains("a2 OK"));
        assert!(output.contains("FETCH"));
        assert!(output.contains("a4 OK"));
    }

    #[tokio::test]
    async fn fetch_before_select_is_rejected() {
        let cfg = seeded_config().await;
        let input = "a1 LOGIN alice@example.com s3cret\r\na2 FETCH 1 (UID)\r\nq QUIT\r\n";
        let output = run(cfg, input).await;
        assert!(output.contains("a2 NO"));
    }

    #[tokio::test]
    async fn store_deleted_then_expunge_removes_message() {
        let cfg = seeded_config().await;
        let input = "a1 LOGIN alice@example.com s3cret\r\na2 SELECT INBOX\r\na3 STORE 1 +FLAGS (\\Deleted)\r\na4 EXPUNGE\r\na5 LOGOUT\r\n";
        let output = run(cfg, input).await;
        assert!(output.contains("1 EXPUNGE"));
        assert!(output.contains("a4 OK"));
    }

    #[tokio::test]
    async fn unknown_command_is_tagged_bad() {
        let cfg = seeded_config().await;
        let input = "a1 BOGUS\r\nq LOGOUT\r\n";
        let output = run(cfg, input).await;
        assert!(output.contains("a1 BAD"));
    }

    #[tokio::test]
    async fn post_tls_reentry_skips_greeting_banner() {
        let cfg = seeded_config().await;
        let (client, server) = duplex(8192);
        let cancellation = CancellationToken::new();
        let boxed: BoxedStream = Box::pin(server);

        let handle = tokio::spawn(async move {
            let _ = serve_until_upgrade_or_close(
                &cfg,
                boxed,
                "127.0.0.1:0".parse().unwrap(),
                &cancellation,
                true,
                &ConnectionGuard::unbounded(),
            )
            .await;
        });

        let (mut read_half, mut write_half) = tokio::io::split(client);
        write_half.write_all(b"q LOGOUT\r\n").await.unwrap();
        drop(write_half);

        let mut output = Vec::new();
        let _ = read_half.read_to_end(&mut output).await;
        let _ = handle.await;
        let output = String::from_utf8_lossy(&output);
        assert!(
            !output.contains("Server Ready"),
            "re-entering after STARTTLS must not repeat the greeting"
        );
        assert!(output.contains("q OK"));
    }
}
