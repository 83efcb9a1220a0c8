//! Gateway listeners: one for HTTP, one for WebSocket, plain or TLS depending on `transportSec.json`.

use crate::codec::{Passthrough, PayloadCodec};
use crate::compression::{PathListFile, PathListSource};
use crate::config::{Config, TransportSecConfig};
use crate::gateway::{http, ws};
use crate::hub::{ManagerTable, Multiplexer, SessionPool};
use crate::session::{RequestIds, TransportKind};
use crate::tls::{build_server_tls, ClientCertPolicy, ServerTls};
use anyhow::{Context, Result};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// Shared state for both listeners. Everything in it is fixed after startup.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub http_pool: Arc<SessionPool>,
    pub ws_pool: Arc<SessionPool>,
    pub request_ids: Arc<RequestIds>,
    pub codec: Arc<dyn PayloadCodec>,
    pub path_list: Arc<dyn PathListSource>,
}

/// Run the gateway with payloads passed through unchanged in every compression mode.
pub async fn run_gateway(config: Config, managers: ManagerTable) -> Result<()> {
    run_gateway_with_codec(config, managers, Arc::new(Passthrough)).await
}

/// Run the gateway until shutdown (Ctrl+C / SIGTERM) or until a listener fails.
/// `managers` is the gateway side of the manager channel table; the hub owns the endpoints.
pub async fn run_gateway_with_codec(
    config: Config,
    managers: ManagerTable,
    codec: Arc<dyn PayloadCodec>,
) -> Result<()> {
    if managers.is_empty() {
        anyhow::bail!("manager channel table is empty");
    }
    let mux = Multiplexer::new(managers);
    let g = &config.gateway;
    let http_pool = mux
        .pool(TransportKind::Http, g.http_manager_id, g.max_http_sessions)
        .context("http manager id")?;
    let ws_pool = mux
        .pool(TransportKind::WebSocket, g.ws_manager_id, g.max_ws_sessions)
        .context("websocket manager id")?;
    for pool in [&http_pool, &ws_pool] {
        log::info!(
            "{} sessions: up to {} routed to manager {} of {}",
            pool.kind(),
            pool.capacity(),
            pool.manager_id(),
            mux.manager_count()
        );
    }

    let sec = TransportSecConfig::load(&config.transport_security.directory);
    let (http_port, ws_port, tls) = if sec.enabled() {
        let policy = ClientCertPolicy::from_config_str(&sec.server_cert_opt);
        let tls = build_server_tls(
            &g.server_name,
            &sec.ca_cert_path(),
            &sec.server_cert_path(),
            &sec.server_key_path(),
            policy,
        )
        .context("building tls config for secured listeners")?;
        let http_port = sec.http_sec_port.context("httpSecPort missing")?;
        let ws_port = sec.ws_sec_port.context("wsSecPort missing")?;
        (http_port, ws_port, Some(tls))
    } else {
        (g.http_port, g.ws_port, None)
    };

    let bind = g.bind.trim().to_string();
    let state = GatewayState {
        path_list: Arc::new(PathListFile::new(config.compression.path_list.clone())),
        config: Arc::new(config.clone()),
        http_pool: Arc::new(http_pool),
        ws_pool: Arc::new(ws_pool),
        request_ids: Arc::new(RequestIds::new()),
        codec,
    };

    let http_app = http::router(state.clone());
    let ws_app = ws::router(state);

    let result = tokio::select! {
        r = serve_listener("http", format!("{}:{}", bind, http_port), http_app, tls.clone()) => r,
        r = serve_listener("websocket", format!("{}:{}", bind, ws_port), ws_app, tls) => r,
        _ = shutdown_signal() => Ok(()),
    };
    log::info!("gateway stopped");
    result
}

async fn serve_listener(
    name: &'static str,
    addr: String,
    app: Router,
    tls: Option<ServerTls>,
) -> Result<()> {
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {} listener to {}", name, addr))?;
    match tls {
        None => {
            log::info!("{} listening on {}", name, addr);
            axum::serve(listener, app)
                .await
                .with_context(|| format!("{} listener exited", name))
        }
        Some(tls) => {
            log::info!(
                "{} listening on {} (tls, {}, {:?})",
                name,
                addr,
                tls.server_name,
                tls.policy
            );
            serve_tls(listener, app, tls).await
        }
    }
}

/// Accept loop for a secured listener: TLS handshake, then HTTP/1.1 with upgrades on the stream.
async fn serve_tls(listener: TcpListener, app: Router, tls: ServerTls) -> Result<()> {
    let acceptor = TlsAcceptor::from(tls.config.clone());
    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let stream = match acceptor.accept(tcp).await {
                Ok(s) => s,
                Err(e) => {
                    log::warn!("tls handshake with {} failed: {}", peer, e);
                    return;
                }
            };
            let service = TowerToHyperService::new(app);
            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                .await
            {
                log::debug!("connection from {} ended: {}", peer, e);
            }
        });
    }
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
    log::info!("shutdown signal received, closing listeners");
}
