use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, trace, warn};

use crate::config::DebugMode;

use super::error::TransportError;
use super::types::{
    FrameKind, Handshake, RawFrame, RpcNotification, RpcRequest, RpcResponse, TabRecord,
    new_request_id,
};

type WsStream = WebSocketStream<TcpStream>;

/// Default per-request timeout.
pub const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_secs(30);

/// Keep-alive ping cadence while a peer is connected.
pub const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Grace between the `-32001` rejection envelope and the `1008` close
/// sent to a superfluous second peer.
pub const SECOND_PEER_CLOSE_GRACE: Duration = Duration::from_millis(100);

/// The only upgrade path the listener accepts.
const EXTENSION_PATH: &str = "/extension";

/// Hook consulted before default handling of a freshly accepted TCP
/// connection. Returning `true` means an external multiplexer took the
/// connection and the transport should forget it.
pub type RawConnectionHook = Arc<dyn Fn(&SocketAddr) -> bool + Send + Sync>;

/// Events the transport surfaces to the connection manager.
#[derive(Debug)]
pub enum TransportEvent {
    /// A peer completed the WebSocket upgrade. `replaced` is true when a
    /// previous peer existed in this transport's lifetime (the broker
    /// treats that as "peer came back").
    PeerConnected { replaced: bool },
    /// The peer announced itself.
    Handshake(Handshake),
    /// The extension pushed fresh tab metadata.
    TabInfo(TabRecord),
    /// The peer socket closed or failed.
    PeerDisconnected,
}

/// Command sent from the handle to the transport task.
#[derive(Debug)]
enum Command {
    SendCmd {
        method: String,
        params: Option<serde_json::Value>,
        timeout: Duration,
        response_tx: oneshot::Sender<Result<serde_json::Value, TransportError>>,
    },
    Notify {
        method: String,
        params: Option<serde_json::Value>,
    },
    Stop {
        done_tx: oneshot::Sender<()>,
    },
}

/// Tracks an in-flight request awaiting its correlated response.
struct PendingRequest {
    response_tx: oneshot::Sender<Result<serde_json::Value, TransportError>>,
    method: String,
    deadline: Instant,
}

/// Clonable handle for talking to the transport task.
#[derive(Clone, Debug)]
pub struct TransportHandle {
    command_tx: mpsc::Sender<Command>,
    peer_connected: Arc<AtomicBool>,
    port: u16,
}

impl TransportHandle {
    /// Send a request to the extension and await its correlated response.
    ///
    /// # Errors
    ///
    /// `Disconnected` when no peer is connected, `Timeout` when the
    /// deadline passes first, `Peer` when the extension answers with an
    /// error payload, `Stopped` when the transport task has exited.
    pub async fn send_cmd(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, TransportError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(Command::SendCmd {
                method: method.to_owned(),
                params,
                timeout: timeout.unwrap_or(DEFAULT_CMD_TIMEOUT),
                response_tx,
            })
            .await
            .map_err(|_| TransportError::Stopped)?;
        response_rx.await.map_err(|_| TransportError::Stopped)?
    }

    /// Fire-and-forget notification. Silently no-ops when disconnected.
    pub async fn send_notification(&self, method: &str, params: Option<serde_json::Value>) {
        let _ = self
            .command_tx
            .send(Command::Notify {
                method: method.to_owned(),
                params,
            })
            .await;
    }

    /// Whether an extension peer currently holds the socket.
    #[must_use]
    pub fn is_peer_connected(&self) -> bool {
        self.peer_connected.load(Ordering::Relaxed)
    }

    /// The port the listener is bound to.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Drain pending requests, close the peer, and shut the listener.
    pub async fn stop(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .command_tx
            .send(Command::Stop { done_tx })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }
}

/// Bind the listener and spawn the transport task.
///
/// # Errors
///
/// `PortInUse` when the OS refuses the bind with `AddrInUse`, `Bind`
/// for any other listener failure.
pub async fn start_transport(
    host: &str,
    port: u16,
    debug: DebugMode,
    events: mpsc::UnboundedSender<TransportEvent>,
    raw_hook: Option<RawConnectionHook>,
) -> Result<TransportHandle, TransportError> {
    let listener = TcpListener::bind((host, port)).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            TransportError::PortInUse(port)
        } else {
            TransportError::Bind(e.to_string())
        }
    })?;
    let bound_port = listener
        .local_addr()
        .map_err(|e| TransportError::Bind(e.to_string()))?
        .port();

    let peer_connected = Arc::new(AtomicBool::new(false));
    let (command_tx, command_rx) = mpsc::channel(64);

    let handle = TransportHandle {
        command_tx,
        peer_connected: Arc::clone(&peer_connected),
        port: bound_port,
    };

    tokio::spawn(async move {
        let mut task = TransportTask {
            listener,
            peer: None,
            pending: HashMap::new(),
            command_rx,
            events,
            peer_connected,
            had_peer: false,
            debug,
            raw_hook,
        };
        task.run().await;
    });

    debug!(port = bound_port, "transport listening");
    Ok(handle)
}

/// The background task that owns the listener, the peer socket, and the
/// pending-request map. They live and die together.
struct TransportTask {
    listener: TcpListener,
    peer: Option<WsStream>,
    pending: HashMap<String, PendingRequest>,
    command_rx: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<TransportEvent>,
    peer_connected: Arc<AtomicBool>,
    had_peer: bool,
    debug: DebugMode,
    raw_hook: Option<RawConnectionHook>,
}

impl TransportTask {
    async fn run(&mut self) {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let next_deadline = self.pending.values().map(|p| p.deadline).min();
            let timeout_sleep = async {
                if let Some(deadline) = next_deadline {
                    tokio::time::sleep_until(deadline).await;
                } else {
                    std::future::pending::<()>().await;
                }
            };

            let peer = &mut self.peer;
            let peer_read = async {
                match peer.as_mut() {
                    Some(ws) => ws.next().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                // Branch 1: new TCP connection
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => self.handle_accept(stream, addr).await,
                        Err(e) => warn!(error = %e, "listener accept failed"),
                    }
                }

                // Branch 2: peer frame
                frame = peer_read => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.handle_text_frame(&text),
                        Some(Ok(Message::Pong(_))) => {
                            trace!("pong from extension");
                        }
                        Some(Ok(Message::Ping(_))) => {
                            // tungstenite queues the pong automatically.
                        }
                        Some(Ok(Message::Close(_)) | Err(_)) | None => {
                            self.handle_peer_gone();
                        }
                        Some(Ok(_)) => {
                            // Binary/raw frames are not part of the protocol.
                        }
                    }
                }

                // Branch 3: commands from the handle
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(Command::SendCmd { method, params, timeout, response_tx }) => {
                            self.handle_send(method, params, timeout, response_tx).await;
                        }
                        Some(Command::Notify { method, params }) => {
                            self.handle_notify(method, params).await;
                        }
                        Some(Command::Stop { done_tx }) => {
                            self.shutdown().await;
                            let _ = done_tx.send(());
                            return;
                        }
                        None => {
                            self.shutdown().await;
                            return;
                        }
                    }
                }

                // Branch 4: keep-alive ping
                _ = ping.tick() => {
                    if let Some(ws) = self.peer.as_mut() {
                        let _ = ws.send(Message::Ping(Vec::new().into())).await;
                    }
                }

                // Branch 5: deadline sweep
                () = timeout_sleep => {
                    self.sweep_timeouts();
                }
            }
        }
    }

    /// Upgrade an accepted TCP connection, enforcing the `/extension`
    /// path and the single-peer policy.
    async fn handle_accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        if let Some(hook) = &self.raw_hook
            && hook(&addr)
        {
            debug!(%addr, "raw connection taken by external handler");
            return;
        }

        let ws = match tokio_tungstenite::accept_hdr_async(stream, check_upgrade_path).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(%addr, error = %e, "websocket upgrade rejected");
                return;
            }
        };

        if self.peer.is_some() {
            // Single-peer policy: tell the newcomer why, then close 1008
            // after a short grace so the frame lands before the close.
            debug!(%addr, "rejecting second peer");
            tokio::spawn(reject_second_peer(ws));
            return;
        }

        let replaced = self.had_peer;
        self.had_peer = true;
        self.peer = Some(ws);
        self.peer_connected.store(true, Ordering::Relaxed);
        debug!(%addr, replaced, "extension connected");
        let _ = self.events.send(TransportEvent::PeerConnected { replaced });
    }

    fn handle_text_frame(&mut self, text: &str) {
        Self::log_frame(self.debug, "recv", text);
        let raw: RawFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping unparsable frame");
                return;
            }
        };
        let Some(kind) = raw.classify() else {
            warn!("dropping unclassifiable frame");
            return;
        };

        match kind {
            FrameKind::Response { id, result } => {
                let Some(pending) = self.pending.remove(&id) else {
                    // Late response after timeout; discard.
                    debug!(%id, "dropping uncorrelated response");
                    return;
                };
                let outcome = match result {
                    Ok(value) => {
                        self.side_extract_tab(&value);
                        Ok(value)
                    }
                    Err(payload) => Err(TransportError::Peer {
                        message: payload.message,
                    }),
                };
                let _ = pending.response_tx.send(outcome);
            }
            FrameKind::Handshake(hs) => {
                debug!(browser = %hs.browser, version = %hs.version, "handshake");
                let _ = self.events.send(TransportEvent::Handshake(hs));
            }
            FrameKind::Notification { method, params } => {
                if method == "notifications/tab_info_update" {
                    let source = params.get("tab").cloned().unwrap_or(params);
                    match serde_json::from_value::<TabRecord>(source) {
                        Ok(tab) => {
                            let _ = self.events.send(TransportEvent::TabInfo(tab));
                        }
                        Err(e) => warn!(error = %e, "malformed tab_info_update"),
                    }
                } else {
                    debug!(%method, "dropping unknown notification");
                }
            }
        }
    }

    /// Responses may carry a `currentTab` alongside their payload; lift
    /// it into a tab-info event so the manager stays current.
    fn side_extract_tab(&self, value: &serde_json::Value) {
        if let Some(tab_value) = value.get("currentTab")
            && let Ok(tab) = serde_json::from_value::<TabRecord>(tab_value.clone())
        {
            let _ = self.events.send(TransportEvent::TabInfo(tab));
        }
    }

    async fn handle_send(
        &mut self,
        method: String,
        params: Option<serde_json::Value>,
        timeout: Duration,
        response_tx: oneshot::Sender<Result<serde_json::Value, TransportError>>,
    ) {
        let Some(ws) = self.peer.as_mut() else {
            let _ = response_tx.send(Err(TransportError::Disconnected));
            return;
        };

        let id = new_request_id();
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: id.clone(),
            method: method.clone(),
            params,
        };
        let json = match serde_json::to_string(&request) {
            Ok(j) => j,
            Err(e) => {
                let _ = response_tx.send(Err(TransportError::Peer {
                    message: format!("serialization error: {e}"),
                }));
                return;
            }
        };

        Self::log_frame(self.debug, "send", &json);
        if let Err(e) = ws.send(Message::Text(json.into())).await {
            warn!(error = %e, "websocket write failed");
            let _ = response_tx.send(Err(TransportError::Disconnected));
            self.handle_peer_gone();
            return;
        }

        self.pending.insert(
            id,
            PendingRequest {
                response_tx,
                method,
                deadline: Instant::now() + timeout,
            },
        );
    }

    async fn handle_notify(&mut self, method: String, params: Option<serde_json::Value>) {
        let Some(ws) = self.peer.as_mut() else {
            return;
        };
        let notification = RpcNotification {
            jsonrpc: "2.0",
            method,
            params,
        };
        if let Ok(json) = serde_json::to_string(&notification) {
            Self::log_frame(self.debug, "send", &json);
            if ws.send(Message::Text(json.into())).await.is_err() {
                self.handle_peer_gone();
            }
        }
    }

    async fn shutdown(&mut self) {
        self.drain_pending();
        if let Some(mut ws) = self.peer.take() {
            let _ = ws.close(None).await;
        }
        self.peer_connected.store(false, Ordering::Relaxed);
    }

    fn handle_peer_gone(&mut self) {
        if self.peer.take().is_some() {
            debug!("extension disconnected");
            self.peer_connected.store(false, Ordering::Relaxed);
            self.drain_pending();
            let _ = self.events.send(TransportEvent::PeerDisconnected);
        }
    }

    /// Reject every in-flight request exactly once. Late responses for
    /// drained ids fall into the uncorrelated-response branch and are
    /// discarded.
    fn drain_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for (_, req) in pending {
            let _ = req.response_tx.send(Err(TransportError::Disconnected));
        }
    }

    fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let timed_out: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in timed_out {
            if let Some(pending) = self.pending.remove(&id) {
                let _ = pending.response_tx.send(Err(TransportError::Timeout {
                    method: pending.method,
                }));
            }
        }
    }

    fn log_frame(debug: DebugMode, direction: &str, json: &str) {
        match debug {
            DebugMode::Off => {}
            DebugMode::Truncate => {
                let shown: String = json.chars().take(500).collect();
                debug!(target: "supersurf::wire", "{direction} {shown}");
            }
            DebugMode::NoTruncate => {
                debug!(target: "supersurf::wire", "{direction} {json}");
            }
        }
    }
}

/// Header callback for the upgrade: only `/extension` is served.
fn check_upgrade_path(request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    if request.uri().path() == EXTENSION_PATH {
        Ok(response)
    } else {
        let mut resp = ErrorResponse::new(Some("not found".to_owned()));
        *resp.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::NOT_FOUND;
        Err(resp)
    }
}

/// Tell a superfluous second peer to go away: JSON-RPC error `-32001`,
/// then close code `1008` after the grace interval.
async fn reject_second_peer(mut ws: WsStream) {
    let envelope = RpcResponse {
        jsonrpc: "2.0",
        id: None,
        result: None,
        error: Some(serde_json::json!({
            "code": -32001,
            "message": "Another browser is already connected. Only one browser at a time.",
        })),
    };
    if let Ok(json) = serde_json::to_string(&envelope) {
        let _ = ws.send(Message::Text(json.into())).await;
    }
    tokio::time::sleep(SECOND_PEER_CLOSE_GRACE).await;
    let _ = ws
        .close(Some(CloseFrame {
            code: CloseCode::Policy,
            reason: "single peer".into(),
        }))
        .await;
}
