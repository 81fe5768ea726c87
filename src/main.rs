//! # procgate
//!
//! Serve standard console (stdio) executables over TCP, HTTP, or WebSockets.
//! Each new TCP or WS connection spawns a fresh process and pipes socket
//! data to its stdin and stdout lines back to the socket. HTTP requests use
//! the CDE (callback/data/end) protocol: requests without a session id are
//! redirected to a URL carrying a freshly minted one, and each session id is
//! tied to one long-lived backing process (see `http.rs`).
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   tcp    ┌───────────────┐
//! │  client    │─────────▶│ duplex bridge │──┐
//! └────────────┘          └───────────────┘  │   ┌────────────────┐
//! ┌────────────┐   ws     ┌───────────────┐  ├──▶│ ProcessManager │──▶ spawned
//! │  client    │─────────▶│ duplex bridge │──┤   │   (registry)   │    processes
//! └────────────┘          └───────────────┘  │   └────────────────┘
//! ┌────────────┐   http   ┌───────────────┐  │
//! │  client    │─────────▶│ session engine│──┘
//! └────────────┘          └───────────────┘
//! ```
//!
//! Example: `procgate -p 8000 --http "hi:cat" -w "hi:cat" -t "8001:cat"`
//! serves `cat` at `http://localhost:8000/hi`, `ws://localhost:8000/hi`,
//! and raw on TCP port 8001.

mod bridge;
mod http;
mod logsink;
mod process;
mod service;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ws::WebSocketUpgrade, ConnectInfo, FromRequestParts, Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use clap::{CommandFactory, Parser};
use tokio::net::TcpListener;
use tower::util::ServiceExt;
use tower_http::services::ServeDir;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bridge::WsTransport;
use crate::http::HttpEngine;
use crate::process::ProcessManager;
use crate::service::{Protocol, RoutingTable};

/// Maximum accepted POST body.
const MAX_BODY: usize = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "procgate")]
#[command(version)]
#[command(about = "Serve stdio executables over TCP, HTTP, or WebSockets", long_about = None)]
struct Cli {
    /// Folder with static files to serve over http; its `_ws/` and `_http/`
    /// subfolders hold executables served over ws and http
    serve_folder: Option<PathBuf>,

    /// Port for http/ws processes and static files
    #[arg(short, long, default_value_t = 80)]
    port: u16,

    /// "Port:Exe" spec, or a folder of executables, served over raw TCP
    /// (without a port one is auto-assigned from 9000)
    #[arg(short, long = "tcp", value_name = "PORT:EXE|FOLDER")]
    tcp: Vec<String>,

    /// "Name:Exe" spec, or a folder of executables, served over WebSockets
    #[arg(short, long = "ws", value_name = "NAME:EXE|FOLDER")]
    ws: Vec<String>,

    /// "Name:Exe" spec, or a folder of executables, served over HTTP
    #[arg(long = "http", value_name = "NAME:EXE|FOLDER")]
    http: Vec<String>,

    /// Log all server-client interactions in separate files under
    /// PATH/PROTOCOL/ROUTE/
    #[arg(short, long)]
    log: Option<PathBuf>,
}

/// Shared state for the gateway handler.
struct AppState {
    manager: Arc<ProcessManager>,
    engine: HttpEngine,
    routes: RoutingTable,
    root: Option<PathBuf>,
    port: u16,
}

fn usage_exit(message: &str) -> ! {
    eprintln!("ERROR: {}", message);
    eprintln!();
    let _ = Cli::command().print_help();
    std::process::exit(2);
}

// ============================================================================
// Gateway handler
// ============================================================================

/// Single entry point for every HTTP request and WebSocket upgrade.
///
/// Resolution order: traversal rejection, WS upgrade against the WS table,
/// `/{route}[:{sessionID}]` against the HTTP table, static files, 404.
async fn gateway(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let path = req.uri().path().to_string();
    if path.contains("..") {
        tracing::info!(uri = %path, ip = %addr.ip(), status = 404, "rejected path");
        return StatusCode::NOT_FOUND.into_response();
    }
    let segment = path.trim_matches('/').to_string();
    let query = req.uri().query().unwrap_or_default().to_string();
    let original_query = if query.is_empty() {
        String::new()
    } else {
        format!("?{}", query)
    };

    let (mut parts, body) = req.into_parts();

    if is_websocket_upgrade(&parts.headers) {
        let Some(def) = state.routes.lookup_ws(&segment) else {
            return StatusCode::NOT_FOUND.into_response();
        };
        return match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(ws) => {
                let manager = state.manager.clone();
                let ip = addr.ip().to_string();
                ws.on_upgrade(move |socket| async move {
                    match manager.spawn(&def, &ip) {
                        Ok(spawned) => {
                            bridge::run_bridge(WsTransport::new(socket), spawned, manager).await
                        }
                        Err(e) => tracing::error!(route = %def.route, "{}", e),
                    }
                })
                .into_response()
            }
            Err(rejection) => rejection.into_response(),
        };
    }

    // `/{route}:{sessionID}` keeps the session id in the same path segment.
    let (route, session_id) = match segment.split_once(':') {
        Some((route, sid)) => (route.to_string(), Some(sid.to_string())),
        None => (segment.clone(), None),
    };

    if let Some(def) = state.routes.lookup_http(&route) {
        let params = http::parse_query(&query);
        let body_text = if parts.method == Method::POST {
            match axum::body::to_bytes(body, MAX_BODY).await {
                Ok(bytes) => Some(String::from_utf8_lossy(&bytes).to_string()),
                Err(_) => None,
            }
        } else {
            None
        };
        let cde = http::cde_request(&params, body_text);
        let host = parts
            .headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(|h| h.to_string())
            .unwrap_or_else(|| format!("localhost:{}", state.port));

        let resp = state
            .engine
            .handle(
                &def,
                session_id.as_deref(),
                cde,
                &host,
                &original_query,
                &addr.ip().to_string(),
            )
            .await;
        let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (status, [(header::CONTENT_TYPE, "text/html")], resp.body).into_response();
    }

    if let Some(root) = &state.root {
        let req = Request::from_parts(parts, body);
        return match ServeDir::new(root)
            .append_index_html_on_directories(true)
            .oneshot(req)
            .await
        {
            Ok(res) => res.map(Body::new).into_response(),
            Err(infallible) => match infallible {},
        };
    }

    tracing::info!(uri = %path, ip = %addr.ip(), status = 404, "no route");
    StatusCode::NOT_FOUND.into_response()
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("procgate=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    let mut http_specs = cli.http.clone();
    let mut ws_specs = cli.ws.clone();
    if let Some(root) = &cli.serve_folder {
        if !root.is_dir() {
            usage_exit(&format!("{} is not a valid path", root.display()));
        }
        // Conventional subfolders of a served root.
        let ws_dir = root.join("_ws");
        if ws_dir.is_dir() {
            ws_specs.push(ws_dir.to_string_lossy().into_owned());
        }
        let http_dir = root.join("_http");
        if http_dir.is_dir() {
            http_specs.push(http_dir.to_string_lossy().into_owned());
        }
    }
    if cli.serve_folder.is_none()
        && http_specs.is_empty()
        && ws_specs.is_empty()
        && cli.tcp.is_empty()
    {
        usage_exit("nothing to serve");
    }

    let mut routes = RoutingTable::new();
    for spec in service::expand_folders(http_specs) {
        if let Err(e) = service::parse_service(&spec, Protocol::Http, cli.port)
            .and_then(|def| routes.register(def))
        {
            usage_exit(&e);
        }
    }
    for spec in service::expand_folders(ws_specs) {
        if let Err(e) = service::parse_service(&spec, Protocol::Ws, cli.port)
            .and_then(|def| routes.register(def))
        {
            usage_exit(&e);
        }
    }
    for spec in service::expand_folders(cli.tcp.clone()) {
        if let Err(e) = service::parse_service(&spec, Protocol::Tcp, 0)
            .and_then(|def| routes.register_tcp(def, Some(cli.port)))
        {
            usage_exit(&e);
        }
    }

    let manager = ProcessManager::new(cli.log.clone());

    for def in routes.http_services() {
        tracing::info!(protocol = "http", port = def.port, route = %def.route, command = %def.command, "ready");
    }
    for def in routes.ws_services() {
        tracing::info!(protocol = "ws", port = def.port, route = %def.route, command = %def.command, "ready");
    }
    for def in routes.tcp_services() {
        let listener = match TcpListener::bind(("0.0.0.0", def.port)).await {
            Ok(listener) => listener,
            Err(e) => usage_exit(&format!(
                "could not start service for {:?} on tcp port {}: {}\n - maybe the port is in use or disallowed?",
                def.command, def.port, e
            )),
        };
        tracing::info!(protocol = "tcp", port = def.port, command = %def.command, "ready");
        tokio::spawn(bridge::serve_tcp(listener, def.clone(), manager.clone()));
    }

    let serve_http =
        routes.has_http_services() || routes.has_ws_services() || cli.serve_folder.is_some();

    let state = Arc::new(AppState {
        manager: manager.clone(),
        engine: HttpEngine::new(manager.clone()),
        routes,
        root: cli.serve_folder.clone(),
        port: cli.port,
    });

    // SIGINT sweeps every live backing process before exiting.
    let shutdown_manager = manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down, killing spawned processes");
            shutdown_manager.kill_all();
            std::process::exit(0);
        }
    });

    if serve_http {
        let app = Router::new().fallback(gateway).with_state(state);
        let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => usage_exit(&format!(
                "could not start server on port {}: {}\n - maybe the port is in use or disallowed?",
                cli.port, e
            )),
        };
        tracing::info!(
            "procgate v{} listening on {}",
            env!("CARGO_PKG_VERSION"),
            addr
        );
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    } else {
        // TCP-only mode: the accept loops and the signal handler do the work.
        std::future::pending::<()>().await;
    }
}
