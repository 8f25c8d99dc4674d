mod auth;
mod config;
mod dispatch;
mod local;
mod master;
mod policy;
mod registry;
mod store;
mod stream;
mod terminal;
mod tls;
mod tools;
mod transfer;
mod transport;
mod web;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::dispatch::Dispatcher;
use crate::master::MasterRelay;
use crate::policy::PolicyEvaluator;
use crate::registry::{AgentRegistry, DisconnectHook};
use crate::store::{MemStore, Store, unix_now};
use crate::stream::StreamBroker;
use crate::terminal::TerminalBroker;
use crate::tools::ToolCatalog;
use crate::transfer::FileTransferManager;
use crate::web::AppState;

/// Stream/terminal sessions with no traffic for this long are reaped.
const SESSION_IDLE_LIMIT: Duration = Duration::from_secs(600);

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/tether.toml");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config_path, port_override) = parse_args();

    let mut config = config::load_config(&config_path)?;
    if let Some(p) = port_override {
        config.server.port = p;
    }
    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    let port = config.server.port;
    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, port)
        .parse()
        .context("Invalid bind address")?;

    // TLS, unless a fronting proxy terminates it.
    let tls_acceptor = if config.server.tls {
        let tls_config = tls::build_tls_config(
            config.server.tls_cert.as_deref(),
            config.server.tls_key.as_deref(),
            &config.server.state_dir,
        )?;
        Some(tls::make_acceptor(tls_config))
    } else {
        tracing::warn!("TLS disabled - run only behind a TLS-terminating proxy");
        None
    };

    // JWT secret: config, else persisted under the state dir.
    let jwt_secret = config.server.jwt_secret.clone().unwrap_or_else(|| {
        let secret_path = format!("{}/jwt_secret", config.server.state_dir);
        if let Ok(existing) = std::fs::read_to_string(&secret_path) {
            let trimmed = existing.trim().to_string();
            if !trimmed.is_empty() {
                tracing::info!("Loaded JWT secret from {secret_path}");
                return trimmed;
            }
        }
        let secret = auth::generate_secret();
        if let Err(e) = std::fs::create_dir_all(&config.server.state_dir) {
            tracing::warn!("Failed to create {}: {e}", config.server.state_dir);
        } else {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;
            match std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&secret_path)
            {
                Ok(mut f) => {
                    let _ = f.write_all(secret.as_bytes());
                    tracing::info!("Persisted JWT secret to {secret_path}");
                }
                Err(e) => {
                    tracing::warn!("Failed to persist JWT secret: {e}");
                }
            }
        }
        secret
    });

    // Wire the components. Everything is explicitly constructed here; the
    // brokers hook into the registry rather than the registry knowing them.
    let store: Arc<dyn Store> = Arc::new(MemStore::new());
    let registry = Arc::new(AgentRegistry::new(
        Arc::clone(&store),
        Duration::from_secs(config.command.default_timeout_s),
        config.command.sleep_queue_cap,
    ));
    let catalog = Arc::new(ToolCatalog::new(Arc::clone(&store)));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&catalog),
        Arc::clone(&store),
        config.server.local_privileged,
    ));
    let streams = Arc::new(StreamBroker::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        config.stream.clone(),
    ));
    let terminals = Arc::new(TerminalBroker::new(
        Arc::clone(&registry),
        Arc::clone(&dispatcher),
        Arc::clone(&store),
        config.terminal.clone(),
    ));
    let transfers = Arc::new(FileTransferManager::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        config.transfer.clone(),
    ));
    let masters = Arc::new(MasterRelay::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        Duration::from_secs(config.command.relay_timeout_s),
    ));
    let policy = Arc::new(PolicyEvaluator::new(
        Arc::clone(&store),
        config.policy.heartbeat_grace_hours,
    ));

    registry
        .register_hook(Arc::clone(&streams) as Arc<dyn DisconnectHook>)
        .await;
    registry
        .register_hook(Arc::clone(&terminals) as Arc<dyn DisconnectHook>)
        .await;
    registry
        .register_hook(Arc::clone(&masters) as Arc<dyn DisconnectHook>)
        .await;

    let token_sweep_interval = Duration::from_secs(config.server.token_sweep_interval_s);

    let state = Arc::new(AppState {
        config,
        store: Arc::clone(&store),
        registry: Arc::clone(&registry),
        dispatcher,
        streams: Arc::clone(&streams),
        terminals: Arc::clone(&terminals),
        transfers,
        masters,
        policy,
        catalog,
        jwt_secret,
        started_at: std::time::Instant::now(),
    });

    let app = web::build_router(Arc::clone(&state))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::event!(
                            Level::INFO,
                            status = %response.status().as_u16(),
                            duration_ms = %latency.as_millis(),
                            "completed"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    let scheme = if state.config.server.tls { "wss/https" } else { "ws/http" };
    tracing::info!("Tether control plane v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Listening on {bind_addr} ({scheme})");

    // Maintenance loop: expired-token sweep plus idle-session reaping.
    {
        let sweep_store = Arc::clone(&store);
        let sweep_streams = Arc::clone(&streams);
        let sweep_terminals = Arc::clone(&terminals);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(token_sweep_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = sweep_store.sweep_expired_tokens(unix_now()).await;
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired session tokens");
                }
                sweep_streams.sweep_idle(SESSION_IDLE_LIMIT).await;
                sweep_terminals.sweep_idle(SESSION_IDLE_LIMIT).await;
            }
        });
    }

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("Failed to accept TCP connection: {e}");
                        continue;
                    }
                };

                let acceptor = tls_acceptor.clone();
                let app = app.clone();

                tokio::spawn(async move {
                    let hyper_service = hyper_util::service::TowerToHyperService::new(app);
                    let builder = hyper_util::server::conn::auto::Builder::new(
                        hyper_util::rt::TokioExecutor::new(),
                    );

                    match acceptor {
                        Some(acceptor) => {
                            // TLS handshake timeout (10 seconds)
                            let tls_stream = match tokio::time::timeout(
                                Duration::from_secs(10),
                                acceptor.accept(stream),
                            ).await {
                                Ok(Ok(s)) => s,
                                Ok(Err(e)) => {
                                    tracing::debug!(%peer_addr, "TLS handshake failed: {e}");
                                    return;
                                }
                                Err(_) => {
                                    tracing::debug!(%peer_addr, "TLS handshake timed out");
                                    return;
                                }
                            };
                            let io = hyper_util::rt::TokioIo::new(tls_stream);
                            if let Err(e) = builder.serve_connection_with_upgrades(io, hyper_service).await {
                                tracing::debug!(%peer_addr, "Connection error: {e}");
                            }
                        }
                        None => {
                            let io = hyper_util::rt::TokioIo::new(stream);
                            if let Err(e) = builder.serve_connection_with_upgrades(io, hyper_service).await {
                                tracing::debug!(%peer_addr, "Connection error: {e}");
                            }
                        }
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    // Close broker sessions before dropping the sockets so viewers get an
    // explanatory close instead of a dead TCP connection.
    for agent_id in registry.connected_agent_ids().await {
        streams.end_sessions_for_agent(agent_id).await;
        terminals.end_sessions_for_agent(agent_id).await;
    }
    tracing::info!("Tether control plane shut down cleanly");

    Ok(())
}
