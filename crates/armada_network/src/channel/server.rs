//! TCP listener and outbound connector.
//!
//! [`NetworkServer`] binds through `socket2` so the listener can carry
//! address-reuse options, then runs a single accept loop that spawns one
//! channel per inbound connection. [`NetworkClient`] dials with a bounded
//! connect timeout. Both sides route streams through [`StreamAcceptor`] and
//! [`StreamConnector`] so TLS wrapping stays transparent to channel code.

use crate::channel::{spawn_channel, NetworkChannel, NetworkContext};
use crate::error::NetworkError;
use crate::transport::{StreamAcceptor, StreamConnector};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const LISTEN_BACKLOG: i32 = 1024;

/// Accepting side of the cluster transport.
pub struct NetworkServer {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl NetworkServer {
    /// Binds a plain TCP listener and starts accepting.
    pub async fn bind(addr: SocketAddr, ctx: Arc<NetworkContext>) -> Result<Self, NetworkError> {
        Self::bind_with(addr, ctx, StreamAcceptor::default()).await
    }

    /// Binds with an explicit stream acceptor, e.g. TLS.
    pub async fn bind_with(
        addr: SocketAddr,
        ctx: Arc<NetworkContext>,
        acceptor: StreamAcceptor,
    ) -> Result<Self, NetworkError> {
        let listener = make_listener(addr).map_err(|e| NetworkError::Bind {
            addr,
            reason: e.to_string(),
        })?;
        let local_addr = listener.local_addr().map_err(|e| NetworkError::Bind {
            addr,
            reason: e.to_string(),
        })?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer_addr)) => {
                            stream.set_nodelay(true).ok();
                            let ctx = ctx.clone();
                            let acceptor = acceptor.clone();
                            tokio::spawn(async move {
                                let stream = match acceptor.accept(stream).await {
                                    Ok(stream) => stream,
                                    Err(e) => {
                                        warn!(peer = %peer_addr, error = %e, "stream setup failed");
                                        return;
                                    }
                                };
                                if let Err(e) = spawn_channel(stream, peer_addr, false, &ctx).await {
                                    debug!(peer = %peer_addr, error = %e, "inbound channel rejected");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "accept failed");
                            break;
                        }
                    },
                    _ = shutdown_rx.changed() => {
                        debug!(%local_addr, "listener shutting down");
                        break;
                    }
                }
            }
        });

        info!(%local_addr, "listening for cluster connections");
        Ok(Self {
            local_addr,
            shutdown_tx,
            accept_task,
        })
    }

    /// The actual bound address, useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting new connections. Channels already established stay
    /// open; close them through the registry.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.accept_task.await;
    }
}

/// Dialing side of the cluster transport.
#[derive(Clone, Default)]
pub struct NetworkClient {
    connector: StreamConnector,
    connect_timeout: Option<Duration>,
}

impl NetworkClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connector(connector: StreamConnector) -> Self {
        Self {
            connector,
            connect_timeout: None,
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Dials the peer and spawns a client-side channel on the context.
    pub async fn connect(
        &self,
        addr: SocketAddr,
        ctx: &Arc<NetworkContext>,
    ) -> Result<NetworkChannel, NetworkError> {
        let timeout = self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::Connect {
                addr,
                reason: format!("no connection within {timeout:?}"),
            })?
            .map_err(|e| NetworkError::Connect {
                addr,
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true).ok();
        let stream = self
            .connector
            .wrap(stream)
            .await
            .map_err(|e| NetworkError::Connect {
                addr,
                reason: e.to_string(),
            })?;
        spawn_channel(stream, addr, true, ctx).await
    }
}

fn make_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true).ok();
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    let std_listener: StdTcpListener = socket.into();
    std_listener.set_nonblocking(true)?;
    TcpListener::from_std(std_listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{AcceptAllHandler, ChannelHandler, PacketListener};
    use armada_protocol::{channel_ids, DataBuf, Frame};
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct ForwardingListener {
        tx: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl PacketListener for ForwardingListener {
        async fn handle(
            &self,
            _channel: &NetworkChannel,
            mut body: DataBuf,
        ) -> Result<Option<DataBuf>, NetworkError> {
            let text = body.read_string()?;
            let _ = self.tx.send(text);
            Ok(None)
        }
    }

    struct RejectingHandler;

    #[async_trait]
    impl ChannelHandler for RejectingHandler {
        async fn handle_open(&self, _channel: &NetworkChannel) -> Result<(), NetworkError> {
            Err(NetworkError::Rejected("not welcome".into()))
        }

        async fn handle_frame(
            &self,
            _channel: &NetworkChannel,
            _frame: &Frame,
        ) -> Result<bool, NetworkError> {
            Ok(true)
        }

        async fn handle_close(&self, _channel: &NetworkChannel) {}
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn client_reaches_server_listener() {
        let server_ctx = NetworkContext::new(Arc::new(AcceptAllHandler));
        let (tx, mut rx) = mpsc::unbounded_channel();
        server_ctx
            .listeners
            .register(channel_ids::MESSAGE, Arc::new(ForwardingListener { tx }));
        let server = NetworkServer::bind(loopback(), server_ctx.clone())
            .await
            .unwrap();

        let client_ctx = NetworkContext::new(Arc::new(AcceptAllHandler));
        let channel = NetworkClient::new()
            .connect(server.local_addr(), &client_ctx)
            .await
            .unwrap();
        assert!(channel.is_client_side());

        let mut body = DataBuf::new();
        body.write_string("over tcp").unwrap();
        channel.send(Frame::bare(channel_ids::MESSAGE, body)).unwrap();

        let received = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame never arrived")
            .unwrap();
        assert_eq!(received, "over tcp");

        server.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_connection_is_closed_by_server() {
        let server_ctx = NetworkContext::new(Arc::new(RejectingHandler));
        let server = NetworkServer::bind(loopback(), server_ctx.clone())
            .await
            .unwrap();

        let client_ctx = NetworkContext::new(Arc::new(AcceptAllHandler));
        let channel = NetworkClient::new()
            .connect(server.local_addr(), &client_ctx)
            .await
            .unwrap();

        // The server side refuses in handle_open; the client observes EOF.
        timeout(Duration::from_secs(2), async {
            while !channel.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("rejected channel never closed");
        assert!(server_ctx.registry.is_empty());

        server.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connect_to_dead_port_fails() {
        // Bind and immediately drop to get a port nothing listens on.
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_addr = probe.local_addr().unwrap();
        drop(probe);

        let client_ctx = NetworkContext::new(Arc::new(AcceptAllHandler));
        let result = NetworkClient::new()
            .connect_timeout(Duration::from_millis(500))
            .connect(dead_addr, &client_ctx)
            .await;
        assert!(matches!(result, Err(NetworkError::Connect { .. })));
    }
}
