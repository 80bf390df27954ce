//! The Connection Supervisor (spec §4.5): binds the plain/implicit-TLS/MX
//! listeners for one protocol, accepts connections, spawns an independent
//! session task per connection, enforces the configured connection limits,
//! and tracks sessions for graceful shutdown.
//!
//! Shutdown broadcast and per-call cancellation are implemented with
//! `tokio_util::sync::CancellationToken`, generalizing the reference
//! implementation's own bespoke cancellation-token plumbing into a
//! conventional, off-the-shelf primitive. The active-session and
//! per-source-IP registries are `dashmap::DashMap`, matching the reference
//! implementation's use of `dashmap` for its own concurrent session/limiter
//! maps.

use std::{
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::{config::LimitsSection, tls::TlsTerminator};

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Anything a session handler can read and write, regardless of whether the
/// underlying transport is a plain socket or a TLS stream.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for T {}

pub type BoxedStream = Pin<Box<dyn DuplexStream>>;

/// Implemented once per protocol crate (`smtp`, `pop3`, `imap`); invoked once
/// per accepted connection with a stream that is already past TLS
/// termination, if any was configured for that listener, and past this
/// protocol's total/per-IP connection-limit checks.
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn handle(&self, stream: BoxedStream, peer_addr: SocketAddr, cancellation: CancellationToken, guard: ConnectionGuard);

    /// Wire line (if the protocol has one) written before a connection is
    /// closed for exceeding a total or per-source-IP limit (spec §4.5),
    /// before `handle` is ever called. Only sent on plaintext listeners - on
    /// an implicit-TLS port there is no session to address the line to until
    /// a handshake completes, so the connection is simply dropped.
    fn connection_limit_reply(&self) -> Option<&'static str> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Plain,
    ImplicitTls,
}

pub struct ListenerSpec {
    pub addr: SocketAddr,
    pub kind: ListenerKind,
}

struct ActiveSession {
    peer_addr: SocketAddr,
    cancellation: CancellationToken,
    handle: JoinHandle<()>,
    user_id: Mutex<Option<Uuid>>,
}

/// Handed to a session on entry; lets it register the user a login
/// succeeded for against the per-user connection cap (spec §4.5). Sessions
/// exercised directly in unit tests, outside a `Supervisor`, can use
/// [`ConnectionGuard::unbounded`] instead.
pub struct ConnectionGuard {
    session_id: Uuid,
    sessions: Option<Arc<DashMap<Uuid, ActiveSession>>>,
    max_per_user: u32,
}

impl ConnectionGuard {
    /// A guard not backed by any registry - `register_user` always succeeds.
    /// For session-engine unit tests that never go through a `Supervisor`.
    pub fn unbounded() -> Self {
        Self { session_id: Uuid::nil(), sessions: None, max_per_user: 0 }
    }

    /// Registers `user_id` against this connection, enforcing
    /// `max_connections_per_user`. Returns `false` (registering nothing) if
    /// the user is already at its connection cap; the caller must reject and
    /// close the session in that case.
    pub fn register_user(&self, user_id: Uuid) -> bool {
        let Some(sessions) = &self.sessions else { return true };
        if self.max_per_user > 0 {
            let active = sessions
                .iter()
                .filter(|entry| *entry.key() != self.session_id)
                .filter(|entry| *entry.value().user_id.lock().unwrap() == Some(user_id))
                .count();
            if active as u32 >= self.max_per_user {
                return false;
            }
        }
        if let Some(session) = sessions.get(&self.session_id) {
            *session.user_id.lock().unwrap() = Some(user_id);
        }
        true
    }
}

/// One supervisor instance per protocol binary (SMTP, POP3 or IMAP).
pub struct Supervisor {
    protocol: &'static str,
    tls: Option<Arc<TlsTerminator>>,
    sessions: Arc<DashMap<Uuid, ActiveSession>>,
    per_ip: Arc<DashMap<IpAddr, usize>>,
    limits: LimitsSection,
    shutdown: CancellationToken,
    drain_timeout: Duration,
}

impl Supervisor {
    pub fn new(protocol: &'static str, tls: Option<Arc<TlsTerminator>>, limits: LimitsSection) -> Self {
        Self {
            protocol,
            tls,
            sessions: Arc::new(DashMap::new()),
            per_ip: Arc::new(DashMap::new()),
            limits,
            shutdown: CancellationToken::new(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Number of sessions currently tracked, exposed as telemetry (spec §4.5).
    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Binds every listener and runs accept loops until the shutdown token
    /// fires. Each accept loop runs concurrently on the current Tokio runtime.
    pub async fn run(&self, specs: Vec<ListenerSpec>, handler: Arc<dyn SessionHandler>) -> std::io::Result<()> {
        let mut listeners = Vec::with_capacity(specs.len());
        for spec in specs {
            let listener = TcpListener::bind(spec.addr).await?;
            listeners.push((listener, spec.kind));
        }

        let mut accept_tasks = Vec::with_capacity(listeners.len());
        for (listener, kind) in listeners {
            let handler = handler.clone();
            let tls = self.tls.clone();
            let sessions = self.sessions.clone();
            let per_ip = self.per_ip.clone();
            let limits = self.limits.clone();
            let shutdown = self.shutdown.clone();
            let protocol = self.protocol;

            accept_tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        accepted = listener.accept() => {
                            let Ok((stream, peer_addr)) = accepted else { continue };
                            spawn_session(
                                protocol,
                                stream,
                                peer_addr,
                                kind,
                                tls.clone(),
                                sessions.clone(),
                                per_ip.clone(),
                                &limits,
                                shutdown.clone(),
                                handler.clone(),
                            )
                            .await;
                        }
                    }
                }
            }));
        }

        for task in accept_tasks {
            let _ = task.await;
        }
        Ok(())
    }

    /// Stops accepting, cancels every live session, waits up to
    /// `drain_timeout` for them to finish, then force-aborts stragglers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        let ids: Vec<Uuid> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                session.cancellation.cancel();
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if tokio::time::timeout(remaining, session.handle).await.is_err() {
                    tracing::warn!(protocol = self.protocol, peer_addr = %session.peer_addr, "session did not drain in time; continuing shutdown");
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn spawn_session(
    protocol: &'static str,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    kind: ListenerKind,
    tls: Option<Arc<TlsTerminator>>,
    sessions: Arc<DashMap<Uuid, ActiveSession>>,
    per_ip: Arc<DashMap<IpAddr, usize>>,
    limits: &LimitsSection,
    shutdown: CancellationToken,
    handler: Arc<dyn SessionHandler>,
) {
    if sessions.len() as u32 >= limits.max_total_connections {
        tracing::warn!(protocol, %peer_addr, "rejecting connection: total connection limit reached");
        reject_over_limit(&mut stream, kind, handler.connection_limit_reply()).await;
        return;
    }

    let ip = peer_addr.ip();
    let over_ip_limit = {
        let mut count = per_ip.entry(ip).or_insert(0);
        if *count >= limits.max_connections_per_ip as usize {
            true
        } else {
            *count += 1;
            false
        }
    };
    if over_ip_limit {
        tracing::warn!(protocol, %peer_addr, "rejecting connection: per-source-IP connection limit reached");
        reject_over_limit(&mut stream, kind, handler.connection_limit_reply()).await;
        return;
    }

    let session_id = Uuid::new_v4();
    let cancellation = shutdown.child_token();
    let span = tracing::info_span!("session", protocol, %peer_addr, %session_id);
    let guard = ConnectionGuard {
        session_id,
        sessions: Some(sessions.clone()),
        max_per_user: limits.max_connections_per_user,
    };

    let handle = tokio::spawn({
        let cancellation = cancellation.clone();
        let sessions = sessions.clone();
        let per_ip = per_ip.clone();
        async move {
            let boxed: BoxedStream = match kind {
                ListenerKind::Plain => Box::pin(stream),
                ListenerKind::ImplicitTls => {
                    let Some(tls) = tls else {
                        tracing::error!(protocol, %peer_addr, "implicit-TLS listener has no certificate loaded");
                        sessions.remove(&session_id);
                        release_ip_slot(&per_ip, ip);
                        return;
                    };
                    match tls.wrap_server(stream).await {
                        Ok(tls_stream) => Box::pin(tls_stream),
                        Err(err) => {
                            tracing::warn!(protocol, %peer_addr, error = %err, "TLS handshake failed");
                            sessions.remove(&session_id);
                            release_ip_slot(&per_ip, ip);
                            return;
                        }
                    }
                }
            };

            handler.handle(boxed, peer_addr, cancellation, guard).await;
            sessions.remove(&session_id);
            release_ip_slot(&per_ip, ip);
        }
        .instrument(span)
    });

    sessions.insert(
        session_id,
        ActiveSession {
            peer_addr,
            cancellation,
            handle,
            user_id: Mutex::new(None),
        },
    );
}

fn release_ip_slot(per_ip: &DashMap<IpAddr, usize>, ip: IpAddr) {
    if let Some(mut count) = per_ip.get_mut(&ip) {
        *count = count.saturating_sub(1);
    }
}

async fn reject_over_limit(stream: &mut TcpStream, kind: ListenerKind, reply: Option<&'static str>) {
    if kind == ListenerKind::Plain {
        if let Some(line) = reply {
            let _ = stream.write_all(line.as_bytes()).await;
        }
    }
    let _ = stream.shutdown().await;
}
