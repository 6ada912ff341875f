//! Control API client

use std::collections::HashMap;
use std::io;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::protocol::{Call, ForwardArgs, Reply, Request, Response, StopArgs};
use crate::error::PortalError;
use crate::forwarding::{EnclaveServicePort, TunnelInfo};

pub struct PortalClient {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
}

impl PortalClient {
    /// Connect to a portal at `host:port` or a full `ws://` URL
    pub async fn connect(address: &str) -> Result<Self, PortalError> {
        let url = if address.starts_with("ws://") || address.starts_with("wss://") {
            address.to_string()
        } else {
            format!("ws://{}", address)
        };

        let (socket, _) = connect_async(url.as_str()).await.map_err(|e| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("Failed to connect to portal at {}: {}", url, e),
            )
        })?;
        debug!("Connected to portal at {}", url);

        Ok(Self { socket, next_id: 0 })
    }

    async fn call(&mut self, call: Call) -> Result<Reply, PortalError> {
        self.next_id += 1;
        let id = self.next_id;
        let payload = serde_json::to_string(&Request { id, call })
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        self.socket
            .send(Message::Text(payload))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;

        while let Some(message) = self.socket.next().await {
            let message = message.map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };

            let response: Response = serde_json::from_str(&text)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            if response.id != id {
                debug!("Ignoring response {} while waiting for {}", response.id, id);
                continue;
            }
            return match response.reply {
                Reply::Error(err) => Err(err.into()),
                reply => Ok(reply),
            };
        }

        Err(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "portal closed the connection",
        )
        .into())
    }

    pub async fn ping(&mut self) -> Result<(), PortalError> {
        match self.call(Call::Ping).await? {
            Reply::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn forward_user_service_port(
        &mut self,
        target: &EnclaveServicePort,
        local_port_number: u16,
    ) -> Result<HashMap<EnclaveServicePort, u16>, PortalError> {
        let call = Call::ForwardUserServicePort(ForwardArgs::new(target, local_port_number));
        match self.call(call).await? {
            Reply::Forwarded(ports) => Ok(ports.into_map()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn stop_user_service_port_forward(
        &mut self,
        target: &EnclaveServicePort,
    ) -> Result<(), PortalError> {
        match self
            .call(Call::StopUserServicePortForward(StopArgs::new(target)))
            .await?
        {
            Reply::Stopped => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_port_forwards(&mut self) -> Result<Vec<TunnelInfo>, PortalError> {
        match self.call(Call::ListPortForwards).await? {
            Reply::Forwards(list) => Ok(list.tunnels),
            other => Err(unexpected(other)),
        }
    }

    pub async fn close(mut self) {
        let _ = self.socket.close(None).await;
    }
}

fn unexpected(reply: Reply) -> PortalError {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected reply from portal: {:?}", reply),
    )
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{EnclaveTopology, PortSpec, ServiceTopology, StaticClusterBackend, Topology};
    use crate::control::ControlServer;
    use crate::error::ErrorKind;
    use crate::forwarding::{DirectConnector, PortForwardManager, TunnelConfig};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    async fn start_portal() -> (String, CancellationToken) {
        let backend = StaticClusterBackend::new(Topology {
            enclaves: vec![EnclaveTopology::new("e1", "10.1.0.2:9501")
                .with_service(
                    ServiceTopology::new("svc-a", "10.0.0.5").with_port("http", PortSpec::tcp(8080)),
                )
                .with_service(
                    ServiceTopology::new("svc-b", "10.0.0.6")
                        .with_port("grpc", PortSpec::tcp(9090))
                        .with_port("metrics", PortSpec::tcp(9100)),
                )],
        });
        let manager = Arc::new(PortForwardManager::new(
            Arc::new(backend),
            Arc::new(DirectConnector::default()),
            TunnelConfig::default(),
        ));

        let server = ControlServer::bind("127.0.0.1:0".parse().unwrap(), manager)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(server.run(cancel.clone()));
        (addr.to_string(), cancel)
    }

    #[tokio::test]
    async fn test_ping() {
        let (addr, cancel) = start_portal().await;
        let mut client = PortalClient::connect(&addr).await.unwrap();
        client.ping().await.unwrap();
        client.close().await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_forward_list_and_stop() {
        let (addr, cancel) = start_portal().await;
        let mut client = PortalClient::connect(&addr).await.unwrap();

        let forwarded = client
            .forward_user_service_port(&EnclaveServicePort::service("e1", "svc-b"), 0)
            .await
            .unwrap();
        assert_eq!(forwarded.len(), 2);

        let tunnels = client.list_port_forwards().await.unwrap();
        assert_eq!(tunnels.len(), 2);
        assert_eq!(tunnels[0].target, EnclaveServicePort::new("e1", "svc-b", "grpc"));
        assert_eq!(tunnels[0].local_port, forwarded[&tunnels[0].target]);

        let grpc = EnclaveServicePort::new("e1", "svc-b", "grpc");
        client.stop_user_service_port_forward(&grpc).await.unwrap();
        client.stop_user_service_port_forward(&grpc).await.unwrap();
        assert_eq!(client.list_port_forwards().await.unwrap().len(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_errors_keep_their_kind() {
        let (addr, cancel) = start_portal().await;
        let mut client = PortalClient::connect(&addr).await.unwrap();

        let err = client
            .forward_user_service_port(&EnclaveServicePort::new("e1", "", "http"), 0)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = client
            .forward_user_service_port(&EnclaveServicePort::new("e9", "svc-a", "http"), 0)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("e9"));

        // The connection stays usable after errors
        client.ping().await.unwrap();
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_malformed_request_gets_error_reply() {
        let (addr, cancel) = start_portal().await;
        let (mut socket, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        socket
            .send(Message::Text(r#"{"id":5,"method":"launchRockets"}"#.to_string()))
            .await
            .unwrap();

        let reply = loop {
            if let Message::Text(text) = socket.next().await.unwrap().unwrap() {
                break serde_json::from_str::<Response>(&text).unwrap();
            }
        };
        assert_eq!(reply.id, 5);
        assert!(matches!(
            reply.reply,
            Reply::Error(ref e) if e.kind == ErrorKind::InvalidArgument
        ));
        cancel.cancel();
    }
}
