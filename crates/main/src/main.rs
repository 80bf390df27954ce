//! Process entry point: loads configuration, wires the store/verifier/TLS
//! singletons, and runs one [`common::listener::Supervisor`] per protocol
//! until a shutdown signal arrives.

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

use std::{net::SocketAddr, sync::Arc};

use common::{
    auth::CredentialVerifier,
    config::ServerConfig,
    listener::{ListenerKind, ListenerSpec, SessionHandler, Supervisor},
    tls::TlsTerminator,
};
use imap::{ImapEngineConfig, ImapSessionHandler};
use pop3::{Pop3EngineConfig, Pop3SessionHandler};
use smtp::{Mode, SmtpEngineConfig, SmtpSessionHandler};
use store::{postgres::PostgresStore, MessageStore};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/mail-server/config.toml".to_string());

    let config = match ServerConfig::load(&config_path) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            eprintln!("failed to load configuration from {config_path}: {err}");
            std::process::exit(1);
        }
    };

    common::telemetry::init(&config.log_level);

    let store: Arc<dyn MessageStore> = match PostgresStore::connect(&config.database_connection) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            tracing::error!(error = %err, "failed to connect to the message store");
            std::process::exit(1);
        }
    };

    let tls = match TlsTerminator::load(&config.tls) {
        Ok(tls) => Arc::new(tls),
        Err(err) => {
            tracing::error!(error = %err, "failed to load TLS certificate");
            std::process::exit(1);
        }
    };

    let verifier = Arc::new(CredentialVerifier::new(store.clone()));

    let mut services = Vec::new();

    services.push(spawn_service(
        Supervisor::new("smtp-submission", Some(tls.clone()), config.limits.clone()),
        vec![
            ListenerSpec { addr: bind_addr(config.smtp.port), kind: ListenerKind::Plain },
            ListenerSpec { addr: bind_addr(config.smtp.secure_port), kind: ListenerKind::ImplicitTls },
        ],
        Arc::new(SmtpSessionHandler {
            config: Arc::new(SmtpEngineConfig {
                server_config: config.clone(),
                mode: Mode::Submission,
                store: store.clone(),
                verifier: verifier.clone(),
                tls: Some(tls.clone()),
            }),
        }),
    ));

    if config.smtp.mx.enabled {
        services.push(spawn_service(
            Supervisor::new("smtp-mx", None, config.limits.clone()),
            vec![ListenerSpec { addr: bind_addr(config.smtp.mx.port), kind: ListenerKind::Plain }],
            Arc::new(SmtpSessionHandler {
                config: Arc::new(SmtpEngineConfig {
                    server_config: config.clone(),
                    mode: Mode::Mx,
                    store: store.clone(),
                    verifier: verifier.clone(),
                    tls: None,
                }),
            }),
        ));
    }

    services.push(spawn_service(
        Supervisor::new("pop3", Some(tls.clone()), config.limits.clone()),
        vec![
            ListenerSpec { addr: bind_addr(config.pop3.port), kind: ListenerKind::Plain },
            ListenerSpec { addr: bind_addr(config.pop3.secure_port), kind: ListenerKind::ImplicitTls },
        ],
        Arc::new(Pop3SessionHandler {
            config: Arc::new(Pop3EngineConfig {
                server_name: config.server_name.clone(),
                store: store.clone(),
                verifier: verifier.clone(),
            }),
        }),
    ));

    services.push(spawn_service(
        Supervisor::new("imap", Some(tls.clone()), config.limits.clone()),
        vec![
            ListenerSpec { addr: bind_addr(config.imap.port), kind: ListenerKind::Plain },
            ListenerSpec { addr: bind_addr(config.imap.secure_port), kind: ListenerKind::ImplicitTls },
        ],
        Arc::new(ImapSessionHandler {
            config: Arc::new(ImapEngineConfig {
                server_config: config.clone(),
                store: store.clone(),
                verifier: verifier.clone(),
                tls: Some(tls.clone()),
            }),
        }),
    ));

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received; draining active sessions");

    for service in services {
        service.supervisor.shutdown().await;
        let _ = service.handle.await;
    }
}

struct RunningService {
    supervisor: Arc<Supervisor>,
    handle: tokio::task::JoinHandle<std::io::Result<()>>,
}

fn spawn_service(
    supervisor: Supervisor,
    specs: Vec<ListenerSpec>,
    handler: Arc<dyn SessionHandler>,
) -> RunningService {
    let supervisor = Arc::new(supervisor);
    let handle = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.run(specs, handler).await }
    });
    RunningService { supervisor, handle }
}

fn bind_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], port))
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
