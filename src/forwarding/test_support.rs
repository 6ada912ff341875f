//! In-process stand-ins for enclave services and the tunnel relay

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

/// TCP server that writes back whatever it reads
pub(crate) async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// TCP server that reads a request until EOF, then answers with `reply`
pub(crate) async fn spawn_reply_after_eof_server(reply: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                if stream.read_to_end(&mut request).await.is_ok() {
                    let _ = stream.write_all(reply).await;
                    let _ = stream.shutdown().await;
                }
            });
        }
    });
    addr
}

/// Minimal relay speaking the `/control` + `/tunnel/{remote}` protocol
pub(crate) async fn spawn_websocket_relay() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(handle_relay_connection(stream));
        }
    });
    addr
}

async fn handle_relay_connection(stream: TcpStream) {
    let path = Arc::new(Mutex::new(String::new()));
    let captured = path.clone();
    let callback = move |req: &Request, resp: Response| {
        *captured.lock() = req.uri().path().to_string();
        Ok::<Response, ErrorResponse>(resp)
    };
    let Ok(mut socket) = accept_hdr_async(stream, callback).await else {
        return;
    };

    let path = path.lock().clone();
    let Some(remote) = path.strip_prefix("/tunnel/") else {
        // Control socket: keep reading so pings get answered
        while let Some(Ok(_)) = socket.next().await {}
        return;
    };

    let remote = remote.replace("%5B", "[").replace("%5D", "]");
    let Ok(upstream) = TcpStream::connect(remote.as_str()).await else {
        let _ = socket.close(None).await;
        return;
    };

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (mut up_read, mut up_write) = upstream.into_split();

    let to_service = async {
        while let Some(Ok(message)) = ws_rx.next().await {
            match message {
                // Client half-close
                Message::Binary(data) if data.is_empty() => {
                    let _ = up_write.shutdown().await;
                }
                Message::Binary(data) => {
                    if up_write.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        let _ = up_write.shutdown().await;
    };

    let to_client = async {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match up_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if ws_tx.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    };

    tokio::join!(to_service, to_client);
}
