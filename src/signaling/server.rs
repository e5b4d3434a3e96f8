use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tracing::{debug, error, info, warn};

use super::actor::RoomManagerHandle;
use super::messages::{Inbound, ServerMessage};
use super::types::{CloseReason, ConnectionId, Identity, Outbound, RoomId, SignalingError};
use crate::config::SignalingConfig;

/// Per-connection lifecycle: `Pending → Identified → Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Pending,
    Identified(Identity),
    /// A terminal notice and close frame are queued; inbound traffic is ignored
    Closing,
}

pub struct SignalingServer {
    listener: TcpListener,
    handle: RoomManagerHandle,
    config: Arc<SignalingConfig>,
}

impl SignalingServer {
    /// Bind the listener and start the room manager
    pub async fn bind(config: SignalingConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        info!("Signaling server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            handle: RoomManagerHandle::spawn(),
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> RoomManagerHandle {
        self.handle.clone()
    }

    pub async fn run(self) -> std::io::Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let handle = self.handle.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, handle, config).await {
                    error!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }
}

fn reject(status: StatusCode, reason: &SignalingError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handle: RoomManagerHandle,
    config: Arc<SignalingConfig>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut room: Option<RoomId> = None;
    let max_room_id_len = config.max_room_id_len;
    let route = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match RoomId::from_request_path(request.uri().path(), max_room_id_len) {
            Ok(id) => {
                room = Some(id);
                Ok(response)
            }
            Err(e @ SignalingError::UnknownPath(_)) => Err(reject(StatusCode::NOT_FOUND, &e)),
            Err(e) => Err(reject(StatusCode::BAD_REQUEST, &e)),
        }
    };
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(config.max_message_size))
        .max_frame_size(Some(config.max_message_size));

    let ws_stream =
        tokio_tungstenite::accept_hdr_async_with_config(stream, route, Some(ws_config)).await?;
    let room = room.ok_or_else(|| SignalingError::Internal("handshake without room".into()))?;
    let (ws_tx, mut ws_rx) = ws_stream.split();

    let conn = ConnectionId::next();
    info!("WebSocket connection {} from {} for room {}", conn, addr, room);

    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<Message>();

    let mut state = ConnState::Pending;
    let identify_deadline = Instant::now() + config.identify_timeout;
    let mut ping_interval = tokio::time::interval(config.ping_interval);
    let mut waiting_for_pong = false;
    let mut pong_deadline: Option<Instant> = None;

    let mut send_task = tokio::spawn(write_loop(ws_tx, rx, ctrl_rx));

    loop {
        let pong_timeout = async move {
            match pong_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        let pending = state == ConnState::Pending;
        let identify_timeout = async move {
            if pending {
                tokio::time::sleep_until(identify_deadline).await
            } else {
                std::future::pending().await
            }
        };

        tokio::select! {
            _ = &mut send_task => {
                debug!("Writer finished for {}", conn);
                break;
            }

            _ = ping_interval.tick() => {
                if waiting_for_pong {
                    warn!("No Pong received, disconnecting {}", addr);
                    break;
                }
                if ctrl_tx.send(Message::Ping(Bytes::new())).is_err() {
                    break;
                }
                waiting_for_pong = true;
                pong_deadline = Some(Instant::now() + config.pong_timeout);
                debug!("Ping sent to {}", addr);
            }

            _ = pong_timeout => {
                warn!("Pong timeout, disconnecting {}", addr);
                break;
            }

            _ = identify_timeout => {
                warn!("Identify timeout for {} in room {}", addr, room);
                terminate(
                    &tx,
                    &mut state,
                    &SignalingError::IdentifyTimeout,
                    CloseReason::IdentifyTimeout,
                );
            }

            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                };

                match msg {
                    Message::Text(text) => {
                        if let Err(e) = handle_text_message(&text, &tx, &handle, &room, conn, &mut state).await {
                            warn!("Message handling error: {}", e);
                            break;
                        }
                    }
                    Message::Pong(_) => {
                        waiting_for_pong = false;
                        pong_deadline = None;
                        debug!("Pong received from {}", addr);
                    }
                    Message::Close(_) => {
                        info!("Close received from {}", addr);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    if let ConnState::Identified(identity) = state {
        handle.leave(room.clone(), identity, conn).await;
    }

    send_task.abort();
    info!("WebSocket disconnected: {} ({})", addr, conn);

    Ok(())
}

/// Queue an error notice followed by a close frame
fn terminate(
    tx: &mpsc::UnboundedSender<Outbound>,
    state: &mut ConnState,
    err: &SignalingError,
    reason: CloseReason,
) {
    let _ = tx.send(Outbound::Message(ServerMessage::error(err).to_outbound()));
    let _ = tx.send(Outbound::Close(reason));
    *state = ConnState::Closing;
}

/// Process one text frame. Only an unreachable room manager is returned as an
/// error; everything else is handled or logged here.
async fn handle_text_message(
    text: &str,
    tx: &mpsc::UnboundedSender<Outbound>,
    handle: &RoomManagerHandle,
    room: &RoomId,
    conn: ConnectionId,
    state: &mut ConnState,
) -> Result<(), SignalingError> {
    if *state == ConnState::Closing {
        return Ok(());
    }

    let inbound = match Inbound::parse(text) {
        Ok(m) => m,
        Err(e) => {
            debug!("Ignoring message from {}: {}", conn, e);
            return Ok(());
        }
    };

    match (inbound, *state) {
        (Inbound::Identify { role, secret }, ConnState::Pending) => {
            match handle
                .identify(room.clone(), role, secret, conn, tx.clone())
                .await
            {
                Ok(identity) => {
                    debug!("{} identified as {:?} in room {}", conn, identity, room);
                    *state = ConnState::Identified(identity);
                }
                Err(SignalingError::Forbidden) => {
                    terminate(tx, state, &SignalingError::Forbidden, CloseReason::Forbidden);
                }
                Err(e) => return Err(e),
            }
        }

        (Inbound::Identify { .. }, _) => {
            warn!("Duplicate identify from {} ignored", conn);
        }

        (Inbound::Relay(kind, _), ConnState::Pending) => {
            debug!("Ignoring {} from unidentified {}", kind.as_str(), conn);
        }

        (Inbound::Relay(kind, envelope), ConnState::Identified(identity)) => {
            handle
                .relay(room.clone(), identity, conn, kind, envelope)
                .await?;
        }

        (Inbound::Relay(..), ConnState::Closing) => {}

        (Inbound::Unknown(kind), _) => {
            debug!("Ignoring unknown message type {:?} from {}", kind, conn);
        }
    }

    Ok(())
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    mut ctrl_rx: mpsc::UnboundedReceiver<Message>,
) {
    loop {
        tokio::select! {
            Some(out) = rx.recv() => match out {
                Outbound::Message(msg) => {
                    if ws_tx.send(Message::Text(msg.into_inner())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(reason) => {
                    let _ = ws_tx.send(Message::Close(Some(reason.frame()))).await;
                    break;
                }
            },
            Some(ctrl_msg) = ctrl_rx.recv() => {
                if ws_tx.send(ctrl_msg).await.is_err() {
                    break;
                }
            }
            else => break,
        }
    }
}
