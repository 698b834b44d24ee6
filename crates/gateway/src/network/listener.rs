//! WebSocket listener.
//!
//! Accepts TCP connections, performs the WebSocket handshake and gives each
//! connection its own task and [`ConnectionMultiplexer`]. The task only moves
//! frames between the socket and the multiplexer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::{Sink, SinkExt, StreamExt};
use protocol::{Envelope, ServerMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::multiplexer::{ConnectionId, ConnectionMultiplexer, MuxOptions};
use crate::resolver::DirectoryResolver;
use crate::session::SessionRegistry;

/// Accepts WebSocket clients and serves one multiplexer per connection.
pub struct TransportListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    next_connection_id: AtomicU64,
    connections: Arc<DashMap<ConnectionId, SocketAddr>>,
}

impl TransportListener {
    /// Binds the listening socket. Port 0 picks a free port.
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "WebSocket listener bound");

        Ok(Self {
            listener,
            local_addr,
            next_connection_id: AtomicU64::new(1),
            connections: Arc::new(DashMap::new()),
        })
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of open WebSocket connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Accepts connections until `shutdown` is cancelled, then waits for the
    /// connection tasks to finish.
    pub async fn run(
        &self,
        registry: Arc<SessionRegistry>,
        resolver: Arc<dyn DirectoryResolver>,
        options: MuxOptions,
        shutdown: CancellationToken,
    ) {
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Accept loop cancelled");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!(error = %e, "TCP accept failed");
                            continue;
                        }
                    };

                    let connection = Connection {
                        id: self.next_connection_id.fetch_add(1, Ordering::Relaxed),
                        remote,
                        registry: Arc::clone(&registry),
                        resolver: Arc::clone(&resolver),
                        options,
                        shutdown: shutdown.clone(),
                        connections: Arc::clone(&self.connections),
                    };
                    tasks.spawn(connection.serve(stream));

                    while let Some(finished) = tasks.try_join_next() {
                        if let Err(e) = finished {
                            error!(error = %e, "Connection task failed");
                        }
                    }
                }
            }
        }

        while let Some(finished) = tasks.join_next().await {
            if let Err(e) = finished {
                error!(error = %e, "Connection task failed");
            }
        }
        info!(addr = %self.local_addr, "WebSocket listener stopped");
    }
}

/// Everything one connection task needs.
struct Connection {
    id: ConnectionId,
    remote: SocketAddr,
    registry: Arc<SessionRegistry>,
    resolver: Arc<dyn DirectoryResolver>,
    options: MuxOptions,
    shutdown: CancellationToken,
    connections: Arc<DashMap<ConnectionId, SocketAddr>>,
}

impl Connection {
    async fn serve(self, stream: TcpStream) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(remote = %self.remote, error = %e, "WebSocket handshake failed");
                return;
            }
        };

        self.connections.insert(self.id, self.remote);
        info!(connection_id = self.id, remote = %self.remote, "Connection opened");

        let (mut sink, mut frames) = ws.split();
        let mut mux = ConnectionMultiplexer::new(
            self.id,
            Arc::clone(&self.registry),
            Arc::clone(&self.resolver),
            self.options,
        );

        loop {
            let replies = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                frame = frames.next() => match frame {
                    Some(Ok(Message::Text(text))) => mux.handle_frame(&text).await,
                    Some(Ok(Message::Binary(bytes))) => mux.handle_binary(&bytes).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(connection_id = self.id, error = %e, "WebSocket read failed");
                        break;
                    }
                },
                event = mux.next_event() => mux.handle_event(event),
            };

            if let Err(e) = send_replies(&mut sink, replies).await {
                debug!(connection_id = self.id, error = %e, "WebSocket write failed");
                break;
            }
        }

        mux.handle_close();
        self.connections.remove(&self.id);
        info!(connection_id = self.id, remote = %self.remote, "Connection closed");
    }
}

/// Writes replies as text frames, in order.
async fn send_replies<S>(
    sink: &mut S,
    replies: Vec<Envelope<ServerMessage>>,
) -> Result<(), S::Error>
where
    S: Sink<Message> + Unpin,
{
    if replies.is_empty() {
        return Ok(());
    }
    for reply in replies {
        match reply.to_json() {
            Ok(json) => sink.feed(Message::Text(json)).await?,
            Err(e) => error!(
                message_type = reply.message.message_type(),
                error = %e,
                "Failed to serialize reply"
            ),
        }
    }
    sink.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::DefaultDirectoryResolver;
    use crate::session::RegistryOptions;
    use std::time::Duration;
    use tokio_tungstenite::connect_async;

    #[tokio::test]
    async fn test_connection_lifecycle_is_tracked() {
        let listener = Arc::new(
            TransportListener::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );
        let registry = Arc::new(SessionRegistry::new(RegistryOptions::new("/bin/sh")));
        let resolver = Arc::new(DefaultDirectoryResolver::new(std::env::temp_dir()));
        let shutdown = CancellationToken::new();

        let server = {
            let listener = Arc::clone(&listener);
            let registry = Arc::clone(&registry);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                listener
                    .run(registry, resolver, MuxOptions::default(), shutdown)
                    .await
            })
        };

        let url = format!("ws://{}", listener.local_addr());
        let (mut ws, _) = connect_async(url).await.unwrap();
        ws.send(Message::Text(
            r#"{"type":"terminal-create","data":{"cols":80,"rows":24}}"#.to_string(),
        ))
        .await
        .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = reply.into_text().unwrap();
        assert!(text.contains("\"terminal-created\""), "{text}");
        assert_eq!(listener.connection_count(), 1);
        assert_eq!(registry.count(), 1);

        ws.close(None).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while (registry.count() > 0 || listener.connection_count() > 0)
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(registry.count(), 0);
        assert_eq!(listener.connection_count(), 0);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
    }
}
