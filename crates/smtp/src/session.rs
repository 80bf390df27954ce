//! The SMTP Session Engine (spec §4.6): submission + MX state machine, AUTH,
//! STARTTLS, MAIL/RCPT/DATA, relay guard, size limits and persistence.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use common::{
    auth::CredentialVerifier,
    config::ServerConfig,
    listener::{BoxedStream, ConnectionGuard, SessionHandler},
    tls::TlsTerminator,
};
use mail_codec::parse;
use store::{MessageStore, Scope};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::{
    error::SessionError,
    relay,
    state::{AuthState, Envelope, Mode, Stage},
};

const MAX_RECIPIENTS: usize = 100;
const MAX_AUTH_FAILURES: u32 = 5;

pub struct SmtpEngineConfig {
    pub server_config: Arc<ServerConfig>,
    pub mode: Mode,
    pub store: Arc<dyn MessageStore>,
    pub verifier: Arc<CredentialVerifier>,
    /// `None` in the MX listener (which never offers `STARTTLS`) and in tests
    /// that don't exercise TLS at all.
    pub tls: Option<Arc<TlsTerminator>>,
}

pub struct SmtpSessionHandler {
    pub config: Arc<SmtpEngineConfig>,
}

#[async_trait]
impl SessionHandler for SmtpSessionHandler {
    async fn handle(&self, stream: BoxedStream, peer_addr: SocketAddr, cancellation: CancellationToken, guard: ConnectionGuard) {
        if let Err(err) = run_session(self.config.clone(), stream, peer_addr, &cancellation, &guard).await {
            tracing::warn!(%peer_addr, kind = ?err.kind(), error = %err, "smtp session ended with error");
        }
    }

    fn connection_limit_reply(&self) -> Option<&'static str> {
        Some("421 too many connections, please try again later\r\n")
    }
}

enum Outcome {
    Closed,
    UpgradeTls(BoxedStream),
}

async fn run_session(
    cfg: Arc<SmtpEngineConfig>,
    mut stream: BoxedStream,
    peer_addr: SocketAddr,
    cancellation: &CancellationToken,
    guard: &ConnectionGuard,
) -> Result<(), SessionError> {
    let mut tls_active = false;
    let mut post_tls = false;
    loop {
        match serve_until_upgrade_or_close(&cfg, stream, peer_addr, cancellation, tls_active, post_tls, guard).await? {
            Outcome::Closed => return Ok(()),
            Outcome::UpgradeTls(inner) => {
                let Some(tls) = cfg.tls.as_ref() else {
                    // STARTTLS is only ever offered when `tls` is set; an inner
                    // stream returned with no terminator configured is a bug.
                    return Ok(());
                };
                let tls_stream = tls.upgrade_server(inner).await.map_err(|err| {
                    SessionError::Io(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
                })?;
                stream = Box::pin(tls_stream);
                tls_active = true;
                post_tls = true;
            }
        }
    }
}

async fn serve_until_upgrade_or_close(
    cfg: &Arc<SmtpEngineConfig>,
    stream: BoxedStream,
    peer_addr: SocketAddr,
    cancellation: &CancellationToken,
    tls_active: bool,
    post_tls: bool,
    guard: &ConnectionGuard,
) -> Result<Outcome, SessionError> {
    let mut reader = BufReader::new(stream);
    let mut stage = Stage::Connected;
    let mut envelope = Envelope::default();
    let mut auth = AuthState::default();
    tracing::debug!(%peer_addr, tls_active, "smtp session started");

    // STARTTLS re-enters this loop on the upgraded channel; the client
    // already got a greeting and must re-EHLO, so a second banner here would
    // be unsolicited (RFC 3207).
    if !post_tls {
        write_line(&mut reader, &format!("220 {} ESMTP", cfg.server_config.server_name)).await?;
    }

    loop {
        let Some(line) = read_command(&mut reader, cancellation, &cfg.server_config).await? else {
            return Ok(Outcome::Closed);
        };
        let line = line.trim_end();
        let (verb, rest) = split_verb(line);

        match verb.as_str() {
            "EHLO" | "HELO" => {
                stage = Stage::Greeted;
                envelope.reset();
                write_ehlo_reply(&mut reader, cfg, tls_active).await?;
            }
            "STARTTLS" => {
                if tls_active || cfg.mode == Mode::Mx || cfg.tls.is_none() || auth.is_authenticated() {
                    write_error(&mut reader, &SessionError::WrongState(503, "STARTTLS not available".to_string())).await?;
                    continue;
                }
                write_line(&mut reader, "220 go ahead").await?;
                return Ok(Outcome::UpgradeTls(reader.into_inner()));
            }
            "AUTH" => {
                if cfg.mode == Mode::Mx {
                    write_error(&mut reader, &SessionError::WrongState(503, "AUTH not available".to_string())).await?;
                    continue;
                }
                match handle_auth(cfg, rest, &mut reader, cancellation).await {
                    Ok(user_id) => {
                        if !guard.register_user(user_id) {
                            write_line(&mut reader, "421 too many connections for this user").await?;
                            return Ok(Outcome::Closed);
                        }
                        auth.user_id = Some(user_id);
                        auth.consecutive_failures = 0;
                        write_line(&mut reader, "235 authentication successful").await?;
                    }
                    Err(_) => {
                        auth.consecutive_failures += 1;
                        write_error(&mut reader, &SessionError::Auth(535, "authentication failed".to_string())).await?;
                        if auth.consecutive_failures >= MAX_AUTH_FAILURES {
                            return Ok(Outcome::Closed);
                        }
                    }
                }
            }
            "MAIL" => {
                if cfg.mode == Mode::Submission
                    && cfg.server_config.smtp.require_authentication
                    && !auth.is_authenticated()
                {
                    write_error(&mut reader, &SessionError::Auth(530, "authentication required".to_string())).await?;
                    continue;
                }
                if !matches!(stage, Stage::Greeted) {
                    write_error(&mut reader, &SessionError::WrongState(503, "bad sequence of commands".to_string())).await?;
                    continue;
                }
                match parse_mail_from(rest, &cfg.server_config) {
                    Ok(addr) => {
                        envelope.reset();
                        envelope.mail_from = Some(addr);
                        stage = Stage::MailFrom;
                        write_line(&mut reader, "250 OK").await?;
                    }
                    Err(err) => write_error(&mut reader, &err).await?,
                }
            }
            "RCPT" => {
                if !matches!(stage, Stage::MailFrom | Stage::RcptTo) {
                    write_error(&mut reader, &SessionError::WrongState(503, "bad sequence of commands".to_string())).await?;
                    continue;
                }
                match parse_rcpt_to(rest) {
                    Some(addr) => {
                        if envelope.rcpt_to.len() >= MAX_RECIPIENTS {
                            write_error(&mut reader, &SessionError::Policy(452, "too many recipients".to_string())).await?;
                            continue;
                        }
                        if cfg.mode == Mode::Mx {
                            match relay::evaluate(&cfg.server_config, &cfg.store, &addr).await {
                                relay::Verdict::RelayDenied => {
                                    write_error(&mut reader, &SessionError::Policy(550, "relay access denied".to_string())).await?;
                                    continue;
                                }
                                relay::Verdict::NoSuchUser => {
                                    write_error(&mut reader, &SessionError::Policy(550, "no such user here".to_string())).await?;
                                    continue;
                                }
                                relay::Verdict::Accept => {}
                            }
                        }
                        envelope.rcpt_to.push(addr);
                        stage = Stage::RcptTo;
                        write_line(&mut reader, "250 OK").await?;
                    }
                    None => {
                        write_error(&mut reader, &SessionError::Syntax(501, "malformed recipient address".to_string())).await?
                    }
                }
            }
            "DATA" => {
                if !matches!(stage, Stage::RcptTo) {
                    write_error(&mut reader, &SessionError::WrongState(503, "bad sequence of commands".to_string())).await?;
                    continue;
                }
                write_line(&mut reader, "354 start mail input; end with <CRLF>.<CRLF>").await?;
                match read_data(&mut reader, &cfg.server_config, cancellation).await? {
                    DataOutcome::Body(raw) => match ingest(cfg, &raw, auth.user_id).await {
                        Ok(id) => {
                            write_line(&mut reader, &format!("250 OK {id}")).await?;
                        }
                        Err(err) => write_error(&mut reader, &err).await?,
                    },
                    DataOutcome::TooLarge => {
                        write_error(&mut reader, &SessionError::Policy(552, "message size exceeds fixed limit".to_string()))
                            .await?
                    }
                    DataOutcome::Closed => return Ok(Outcome::Closed),
                    DataOutcome::TimedOut => {
                        write_line(&mut reader, "421 timeout, closing connection").await?;
                        return Ok(Outcome::Closed);
                    }
                }
                envelope.reset();
                stage = Stage::Greeted;
            }
            "RSET" => {
                envelope.reset();
                if matches!(stage, Stage::MailFrom | Stage::RcptTo) {
                    stage = Stage::Greeted;
                }
                write_line(&mut reader, "250 OK").await?;
            }
            "NOOP" => write_line(&mut reader, "250 OK").await?,
            "QUIT" => {
                write_line(&mut reader, "221 bye").await?;
                return Ok(Outcome::Closed);
            }
            _ => write_error(&mut reader, &SessionError::Syntax(500, "unrecognized command".to_string())).await?,
        }
    }
}

async fn handle_auth(
    cfg: &Arc<SmtpEngineConfig>,
    rest: &str,
    reader: &mut BufReader<BoxedStream>,
    cancellation: &CancellationToken,
) -> Result<uuid::Uuid, ()> {
    let mut parts = rest.splitn(2, ' ');
    let mechanism = parts.next().unwrap_or_default().to_ascii_uppercase();
    let payload = parts.next().unwrap_or_default();

    let (identity, secret) = match mechanism.as_str() {
        "PLAIN" => decode_auth_plain(payload).ok_or(())?,
        "LOGIN" => {
            write_line(reader, "334 VXNlcm5hbWU6").await.map_err(|_| ())?;
            let user_b64 = read_command(reader, cancellation, &cfg.server_config)
                .await
                .map_err(|_| ())?
                .ok_or(())?;
            let identity = base64_decode(user_b64.trim_end()).ok_or(())?;
            write_line(reader, "334 UGFzc3dvcmQ6").await.map_err(|_| ())?;
            let pass_b64 = read_command(reader, cancellation, &cfg.server_config)
                .await
                .map_err(|_| ())?
                .ok_or(())?;
            let secret = base64_decode(pass_b64.trim_end()).ok_or(())?;
            (identity, secret)
        }
        _ => return Err(()),
    };

    cfg.verifier
        .verify(&identity, &secret, Scope::Smtp)
        .await
        .map(|verified| verified.user_id)
        .map_err(|_| ())
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

fn base64_decode(text: &str) -> Option<String> {
    base64_decode_bytes(text).map(|bytes| String::from_utf8_lossy(&bytes).to_string())
}

fn base64_decode_bytes(text: &str) -> Option<Vec<u8>> {
    // Minimal RFC 4648 decoder; AUTH payloads are short so a naive
    // implementation is acceptable here.
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

fn parse_mail_from(rest: &str, config: &ServerConfig) -> Result<String, SessionError> {
    let Some(addr_part) = rest.strip_prefix("FROM:") else {
        return Err(SessionError::Syntax(501, "malformed MAIL command".to_string()));
    };
    let (addr, params) = match addr_part.split_once(' ') {
        Some((a, p)) => (a, p),
        None => (addr_part, ""),
    };
    let addr = addr.trim().trim_start_matches('<').trim_end_matches('>');
    if addr.is_empty() {
        return Err(SessionError::Syntax(501, "malformed sender address".to_string()));
    }
    for token in params.split_whitespace() {
        if let Some(size) = token.strip_prefix("SIZE=") {
            if let Ok(size) = size.parse::<u64>() {
                if size > config.limits.max_message_size_bytes {
                    return Err(SessionError::Policy(552, "message exceeds fixed maximum message size".to_string()));
                }
            }
        }
    }
    Ok(addr.to_string())
}

fn parse_rcpt_to(rest: &str) -> Option<String> {
    let addr_part = rest.strip_prefix("TO:")?;
    let addr = addr_part
        .split_whitespace()
        .next()?
        .trim_start_matches('<')
        .trim_end_matches('>');
    if addr.is_empty() || !addr.contains('@') {
        None
    } else {
        Some(addr.to_string())
    }
}

enum DataOutcome {
    Body(Vec<u8>),
    TooLarge,
    Closed,
    TimedOut,
}

async fn read_data(
    reader: &mut BufReader<BoxedStream>,
    config: &ServerConfig,
    cancellation: &CancellationToken,
) -> Result<DataOutcome, SessionError> {
    let mut buf = Vec::new();
    loop {
        match read_raw_line(reader, cancellation, config.limits.command_timeout).await? {
            ReadOutcome::Closed => return Ok(DataOutcome::Closed),
            ReadOutcome::TimedOut => return Ok(DataOutcome::TimedOut),
            ReadOutcome::Line(line) => {
                if line == ".\r\n" || line == ".\n" {
                    break;
                }
                let unstuffed = if let Some(stripped) = line.strip_prefix('.') {
                    stripped.to_string()
                } else {
                    line
                };
                buf.extend_from_slice(unstuffed.as_bytes());
                if buf.len() as u64 > config.limits.max_message_size_bytes {
                    return Ok(DataOutcome::TooLarge);
                }
            }
        }
    }
    Ok(DataOutcome::Body(buf))
}

async fn ingest(
    cfg: &Arc<SmtpEngineConfig>,
    raw: &[u8],
    sent_by_user_id: Option<uuid::Uuid>,
) -> Result<uuid::Uuid, SessionError> {
    let parsed = parse(raw).map_err(|_| SessionError::Policy(550, "message could not be parsed".to_string()))?;
    let new_email = parsed.into_new_email(chrono::Utc::now(), sent_by_user_id);
    cfg.store.store_incoming_email(new_email).await.map_err(|_| SessionError::Storage)
}

async fn write_ehlo_reply(
    reader: &mut BufReader<BoxedStream>,
    cfg: &Arc<SmtpEngineConfig>,
    tls_active: bool,
) -> Result<(), SessionError> {
    let name = &cfg.server_config.server_name;
    let mut lines = vec![
        format!("250-{name}"),
        "250-PIPELINING".to_string(),
        "250-8BITMIME".to_string(),
        format!("250-SIZE {}", cfg.server_config.limits.max_message_size_bytes),
    ];
    if cfg.mode == Mode::Submission {
        lines.push("250-AUTH PLAIN LOGIN".to_string());
        if !tls_active {
            lines.push("250-STARTTLS".to_string());
        }
    }
    lines.push("250 OK".to_string());

    for line in &lines {
        reader.get_mut().write_all(line.as_bytes()).await?;
        reader.get_mut().write_all(b"\r\n").await?;
    }
    Ok(())
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

async fn read_command(
    reader: &mut BufReader<BoxedStream>,
    cancellation: &CancellationToken,
    config: &ServerConfig,
) -> Result<Option<String>, SessionError> {
    match read_raw_line(reader, cancellation, config.limits.command_timeout).await? {
        ReadOutcome::Line(line) => Ok(Some(line)),
        ReadOutcome::Closed => Ok(None),
        ReadOutcome::TimedOut => {
            write_line(reader, "421 timeout, closing connection").await?;
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

fn split_verb(line: &str) -> (String, &str) {
    match line.split_once(' ') {
        Some((verb, rest)) => (verb.to_ascii_uppercase(), rest),
        None => (line.to_ascii_uppercase(), ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::TlsSection;
    use store::memory::MemoryStore;
    use tokio::io::{duplex, AsyncReadExt};

    fn test_config(mode: Mode, require_auth: bool) -> Arc<SmtpEngineConfig> {
        let server_config = Arc::new(ServerConfig {
            server_name: "mail.example.com".to_string(),
            database_connection: "memory".to_string(),
            log_level: "info".to_string(),
            tls: TlsSection {
                certificate_path: "unused".to_string(),
                certificate_password: None,
                check_certificate_revocation: false,
            },
            limits: Default::default(),
            smtp: common::config::SmtpSection {
                port: 587,
                secure_port: 465,
                require_authentication: require_auth,
                mx: common::config::MxSection {
                    enabled: mode == Mode::Mx,
                    hosted_domains: vec!["example.com".to_string()],
                    validate_recipients: false,
                    port: 25,
                },
            },
            pop3: common::config::ProtocolSection {
                port: 110,
                secure_port: 995,
                require_authentication: true,
            },
            imap: common::config::ProtocolSection {
                port: 143,
                secure_port: 993,
                require_authentication: true,
            },
        });
        let store: Arc<dyn MessageStore> = Arc::new(MemoryStore::new());
        Arc::new(SmtpEngineConfig {
            verifier: Arc::new(CredentialVerifier::new(store.clone())),
            store,
            server_config,
            mode,
            tls: None,
        })
    }

    async fn run_mx_session(cfg: Arc<SmtpEngineConfig>, input: &'static str) -> String {
        let (client, server) = duplex(8192);
        let cancellation = CancellationToken::new();
        let boxed: BoxedStream = Box::pin(server);

        let handle = tokio::spawn(async move {
            let _ = serve_until_upgrade_or_close(
                &cfg,
                boxed,
                "127.0.0.1:0".parse().unwrap(),
                &cancellation,
                false,
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
    async fn mx_session_accepts_mail_for_hosted_domain() {
        let cfg = test_config(Mode::Mx, false);
        let input = "EHLO mx.sender.test\r\nMAIL FROM:<a@sender.test>\r\nRCPT TO:<bob@example.com>\r\n\
            DATA\r\nSubject: hi\r\n\r\nhello\r\n.\r\nQUIT\r\n";
        let output = run_mx_session(cfg, input).await;
        assert!(output.contains("220 "));
        assert!(output.contains("250-mail.example.com"));
        assert!(output.contains("250 OK"));
        assert!(output.contains("221 bye"));
    }

    #[tokio::test]
    async fn mx_session_rejects_non_hosted_recipient() {
        let cfg = test_config(Mode::Mx, false);
        let input = "EHLO mx.sender.test\r\nMAIL FROM:<a@sender.test>\r\nRCPT TO:<bob@other.com>\r\nQUIT\r\n";
        let output = run_mx_session(cfg, input).await;
        assert!(output.contains("550 relay access denied"));
    }

    #[tokio::test]
    async fn submission_without_required_auth_accepts_envelope() {
        let cfg = test_config(Mode::Submission, false);
        let input = "EHLO client.test\r\nMAIL FROM:<bob@example.com>\r\nRCPT TO:<bob@example.com>\r\nQUIT\r\n";
        let output = run_mx_session(cfg, input).await;
        assert!(output.contains("250 OK"));
    }

    #[tokio::test]
    async fn submission_rejects_mail_before_auth_when_required() {
        let cfg = test_config(Mode::Submission, true);
        let input = "EHLO client.test\r\nMAIL FROM:<bob@example.com>\r\nQUIT\r\n";
        let output = run_mx_session(cfg, input).await;
        assert!(output.contains("530 authentication required"));
    }

    #[tokio::test]
    async fn rejects_commands_out_of_sequence() {
        let cfg = test_config(Mode::Mx, false);
        let input = "RCPT TO:<bob@example.com>\r\nQUIT\r\n";
        let output = run_mx_session(cfg, input).await;
        assert!(output.contains("503 bad sequence of commands"));
    }

    #[tokio::test]
    async fn post_tls_reentry_skips_greeting_banner() {
        let cfg = test_config(Mode::Submission, false);
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
                true,
                &ConnectionGuard::unbounded(),
            )
            .await;
        });

        let (mut read_half, mut write_half) = tokio::io::split(client);
        write_half.write_all(b"QUIT\r\n").await.unwrap();
        drop(write_half);

        let mut output = Vec::new();
        let _ = read_half.read_to_end(&mut output).await;
        let _ = handle.await;
        let output = String::from_utf8_lossy(&output);
        assert!(!output.contains("220 "), "re-entering after STARTTLS must not repeat the greeting");
        assert!(output.contains("221 bye"));
    }
}
