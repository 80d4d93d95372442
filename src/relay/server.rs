//! HTTP and WebSocket surface.
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `GET /`, `GET /ws` | WebSocket relay; plain requests get the banner |
//! | `GET /health` | liveness JSON: uptime, active clients, resident memory |
//! | `GET /info` | plain-text banner |
//!
//! Each WebSocket is served by one task that pumps frames both ways:
//! inbound text goes to [`ProtocolRouter::dispatch`], outbound frames are
//! drained from the session's queue. Frames still queued when the session
//! ends are flushed before the socket closes, so a `server_shutdown` notice
//! or a final `command_result` always reaches the client first.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::web::websocket::{Message, WebSocket, WebSocketStream};
use poem::web::{Data, Json, RemoteAddr};
use poem::{EndpointExt, IntoResponse, Response, Route, Server, get, handler};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::RelaySettings;
use super::connector::backend::ShellBackend;
use super::protocol::ServerFrame;
use super::registry::{RegistryStats, SessionRegistry};
use super::router::ProtocolRouter;

/// Body of `GET /info`, and of `GET /` when the request is not an upgrade.
pub const BANNER: &str = "SSH Relay Server - Running";

const PAGE_SIZE: u64 = 4096;

/// Resident set size of this process in bytes, where the platform exposes it.
pub(crate) fn resident_memory_bytes() -> Option<u64> {
    // Linux only; second field of statm is resident pages
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * PAGE_SIZE)
}

pub(crate) fn health_report(stats: RegistryStats) -> Value {
    json!({
        "status": "ok",
        "uptime": stats.uptime.as_secs_f64(),
        "clients": stats.clients,
        "maxClients": stats.max_clients,
        "accepting": stats.accepting,
        "memory": {
            "rss": resident_memory_bytes(),
        },
    })
}

#[handler]
fn health(Data(router): Data<&Arc<ProtocolRouter>>) -> Json<Value> {
    Json(health_report(router.registry().stats()))
}

#[handler]
fn banner() -> &'static str {
    BANNER
}

#[handler]
fn relay(
    ws: Option<WebSocket>,
    Data(router): Data<&Arc<ProtocolRouter>>,
    remote: &RemoteAddr,
) -> Response {
    let Some(ws) = ws else {
        return BANNER.into_response();
    };
    let router = router.clone();
    let remote = remote.to_string();
    ws.on_upgrade(move |socket| serve_socket(socket, router, remote))
        .into_response()
}

/// Build the poem application.
pub fn app(router: Arc<ProtocolRouter>) -> impl poem::Endpoint {
    Route::new()
        .at("/", get(relay))
        .at("/ws", get(relay))
        .at("/health", get(health))
        .at("/info", get(banner))
        .with(Tracing)
        .data(router)
}

async fn send_frame<S>(sink: &mut S, frame: ServerFrame) -> bool
where
    S: futures::Sink<Message> + Unpin,
{
    sink.send(Message::Text(frame.encode())).await.is_ok()
}

/// Serve one WebSocket until the client leaves or the session is closed.
async fn serve_socket(socket: WebSocketStream, router: Arc<ProtocolRouter>, remote: String) {
    let (mut sink, mut stream) = socket.split();

    let (mut session, mut outbound) = match router.open_session(Some(remote.clone())) {
        Ok(opened) => opened,
        Err(e) => {
            send_frame(&mut sink, ServerFrame::error(e.to_string())).await;
            let _ = sink.close().await;
            return;
        }
    };

    let closed = session.handle().close_token();
    info!("Client {} connected from {}", session.id(), remote);

    'connection: loop {
        tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            Some(frame) = outbound.recv() => {
                if !send_frame(&mut sink, frame).await {
                    break;
                }
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let dispatch = router.dispatch(&mut session, &text);
                    tokio::pin!(dispatch);
                    // Keep relaying background output while a request is handled
                    loop {
                        tokio::select! {
                            biased;
                            _ = closed.cancelled() => break 'connection,
                            _ = &mut dispatch => break,
                            Some(frame) = outbound.recv() => {
                                if !send_frame(&mut sink, frame).await {
                                    break 'connection;
                                }
                            }
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Binary and control frames carry no requests
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Client {} transport error: {}", session.id(), e);
                    break;
                }
            }
        }
    }

    router.close_session(&mut session).await;

    while let Ok(frame) = outbound.try_recv() {
        if !send_frame(&mut sink, frame).await {
            break;
        }
    }
    let _ = sink.close().await;
    debug!("Client {} socket closed", session.id());
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Run the relay until a shutdown signal arrives.
///
/// On shutdown every session is told `server_shutdown` and closed before the
/// listener stops; poem then waits up to `shutdown_grace` for sockets to drain.
pub async fn serve(settings: RelaySettings, backend: Arc<dyn ShellBackend>) -> std::io::Result<()> {
    let registry = Arc::new(SessionRegistry::new(settings.max_clients));
    let sweeper_stop = CancellationToken::new();
    let sweeper = registry.spawn_idle_sweeper(
        settings.sweep_interval,
        settings.idle_timeout,
        sweeper_stop.clone(),
    );

    let router = Arc::new(ProtocolRouter::new(
        registry.clone(),
        backend,
        settings.clone(),
    ));

    let addr = settings.listen_addr();
    info!("Starting SSH relay on {}", addr);
    info!(
        "Max clients {}, command timeout {:?}, idle timeout {:?}",
        settings.max_clients, settings.exec.timeout, settings.idle_timeout
    );

    let signal = {
        let registry = registry.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received, closing {} session(s)", registry.len());
            registry.shutdown_all();
            sweeper_stop.cancel();
        }
    };

    Server::new(TcpListener::bind(addr))
        .name("SSH Relay Server")
        .run_with_graceful_shutdown(app(router), signal, Some(settings.shutdown_grace))
        .await?;

    if let Err(e) = sweeper.await {
        warn!("Idle sweeper ended abnormally: {}", e);
    }
    info!("SSH relay stopped");
    Ok(())
}
