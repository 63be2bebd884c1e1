use crate::event::{read_event, write_event};
use crate::session::ProtocolSession;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wakemux_core::ProtocolError;
use wakemux_engine::ModelRegistry;

/// TCP front end: one [`ProtocolSession`] per connection.
pub struct ProtocolServer {
    listener: TcpListener,
    registry: Arc<ModelRegistry>,
}

impl ProtocolServer {
    pub async fn bind(addr: &str, registry: Arc<ModelRegistry>) -> Result<Self, ProtocolError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, registry })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProtocolError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `cancel` fires, then wait for every connection task.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ProtocolError> {
        let addr = self.local_addr()?;
        info!(%addr, "protocol server listening");
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let registry = Arc::clone(&self.registry);
                        let cancel = cancel.child_token();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, registry, cancel).await {
                                warn!(%peer, "connection ended with error: {e}");
                            }
                        });
                    }
                    Err(e) => error!("accept failed: {e}"),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!("connection task panicked: {e}");
                    }
                }
            }
        }

        info!(open = connections.len(), "protocol server stopping");
        while connections.join_next().await.is_some() {}
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<ModelRegistry>,
    cancel: CancellationToken,
) -> Result<(), ProtocolError> {
    info!(%peer, "client connected");
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);
    let mut session = ProtocolSession::new(&peer.to_string(), registry);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = read_event(&mut reader) => event?,
        };
        let Some(event) = event else {
            break;
        };
        for reply in session.handle_event(event).await {
            write_event(&mut writer, &reply).await?;
        }
    }

    debug!(%peer, state = ?session.state(), "client disconnected");
    Ok(())
}
