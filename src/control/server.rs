//! WebSocket control server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::{Call, ErrorReply, ForwardedPorts, Reply, Request, Response, TunnelList};
use crate::error::{ErrorKind, PortalError};
use crate::forwarding::PortForwardManager;

/// WebSocket handshake timeout (seconds)
const WS_ACCEPT_TIMEOUT_SECS: u64 = 10;

pub struct ControlServer {
    listener: TcpListener,
    manager: Arc<PortForwardManager>,
}

impl ControlServer {
    pub async fn bind(
        addr: SocketAddr,
        manager: Arc<PortForwardManager>,
    ) -> Result<Self, PortalError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!("Failed to bind control server on {}: {}", addr, e),
            )
        })?;
        Ok(Self { listener, manager })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, PortalError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve control connections until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        match self.listener.local_addr() {
            Ok(addr) => info!("Control server listening on ws://{}", addr),
            Err(e) => warn!("Control server started, local address unknown: {}", e),
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!("Control connection from {}", peer_addr);
                        tokio::spawn(handle_connection(
                            stream,
                            peer_addr,
                            self.manager.clone(),
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => {
                        error!("Control server accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        info!("Control server stopped");
    }
}

/// Requests on one connection are answered in order
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    manager: Arc<PortForwardManager>,
    cancel: CancellationToken,
) {
    let ws_stream = match tokio::time::timeout(
        Duration::from_secs(WS_ACCEPT_TIMEOUT_SECS),
        accept_async(stream),
    )
    .await
    {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            warn!("WebSocket handshake with {} failed: {}", peer_addr, e);
            return;
        }
        Err(_) => {
            warn!("WebSocket handshake with {} timed out", peer_addr);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
            message = ws_receiver.next() => message,
        };

        let text = match message {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("Control connection {} error: {}", peer_addr, e);
                break;
            }
        };

        let response = respond(&manager, &text).await;
        let payload = match serde_json::to_string(&response) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode control response: {}", e);
                continue;
            }
        };
        if let Err(e) = ws_sender.send(Message::Text(payload)).await {
            debug!("Failed to reply to {}: {}", peer_addr, e);
            break;
        }
    }

    debug!("Control connection from {} closed", peer_addr);
}

async fn respond(manager: &PortForwardManager, text: &str) -> Response {
    match serde_json::from_str::<Request>(text) {
        Ok(request) => Response {
            id: request.id,
            reply: handle_call(manager, request.call).await,
        },
        Err(e) => {
            warn!("Rejecting malformed control request: {}", e);
            // Still correlate the reply when the id is readable
            let id = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|value| value.get("id").and_then(|id| id.as_u64()))
                .unwrap_or(0);
            Response {
                id,
                reply: Reply::Error(ErrorReply {
                    kind: ErrorKind::InvalidArgument,
                    message: format!("malformed request: {}", e),
                }),
            }
        }
    }
}

/// Run one control call against the manager
pub async fn handle_call(manager: &PortForwardManager, call: Call) -> Reply {
    let result = match call {
        Call::Ping => manager.ping().await.map(|_| Reply::Pong),
        Call::ForwardUserServicePort(args) => manager
            .create_user_service_port_forward(&args.target(), args.local_port_number)
            .await
            .map(|ports| Reply::Forwarded(ForwardedPorts::from_map(ports))),
        Call::StopUserServicePortForward(args) => manager
            .remove_user_service_port_forward(&args.target())
            .await
            .map(|_| Reply::Stopped),
        Call::ListPortForwards => Ok(Reply::Forwards(TunnelList {
            tunnels: manager.list_port_forwards().await,
        })),
    };

    result.unwrap_or_else(|e| {
        debug!("Control call failed: {}", e);
        Reply::Error(ErrorReply::from(&e))
    })
}
