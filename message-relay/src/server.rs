use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::watch,
};
use tracing::{debug, info, warn};

use crate::{
    config::RelayConfig,
    connection::Connection,
    message::{Envelope, ServerFrame},
    registry::{ClientHandle, ConnectionId, Registry},
};

/// Owns the listening socket and hands each accepted connection to its own task.
pub struct RelayServer {
    listener: TcpListener,
    relay: Arc<Relay>,
    stop: StopHandle,
}

impl RelayServer {
    /// Binds the listening socket. This is the only fatal failure of the server.
    pub async fn bind(config: &RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .with_context(|| format!("failed to bind relay on {}", config.address()))?;
        Ok(Self::new(listener))
    }

    pub fn new(listener: TcpListener) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            listener,
            relay: Arc::new(Relay::new()),
            stop: StopHandle {
                signal: Arc::new(stop_tx),
            },
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Routing state shared with every connection handler.
    pub fn relay(&self) -> Arc<Relay> {
        Arc::clone(&self.relay)
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Accepts connections until [`StopHandle::stop`] is called.
    pub async fn start(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accepts connections until `shutdown` resolves or the server is stopped.
    ///
    /// The listening socket is closed on return; handlers already running keep
    /// serving their clients until those disconnect.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let RelayServer {
            listener,
            relay,
            stop,
        } = self;
        let mut stopped = stop.signal.subscribe();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                _ = stop_requested(&mut stopped) => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &relay);
                }
            }
        }

        let clients = relay.registry().len().await;
        info!(clients, "relay stopped accepting connections");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Stops a running [`RelayServer`] from any task. Stopping twice is harmless.
#[derive(Clone)]
pub struct StopHandle {
    signal: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.signal.send_replace(true);
    }
}

async fn stop_requested(stopped: &mut watch::Receiver<bool>) {
    // Also resolves if the flag was set before the accept loop subscribed.
    let _ = stopped.wait_for(|stopped| *stopped).await;
}

fn handle_accept_result(result: std::io::Result<(TcpStream, SocketAddr)>, relay: &Arc<Relay>) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, relay),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, relay: &Arc<Relay>) {
    let relay = Arc::clone(relay);
    let id = relay.next_id();
    tokio::spawn(async move {
        debug!(peer = %peer, id, "accepted connection");
        let connection = Connection::from_stream(id, stream);
        if let Err(err) = connection.run(&relay).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}

/// Outcome of a single [`Relay::route`] call. Never reported to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    UnknownReceiver,
    WriteFailed,
}

/// Registry plus the routing operations performed on it.
pub struct Relay {
    registry: Registry,
    next_id: AtomicU64,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

impl Relay {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Installs or overwrites the entry for `username`.
    pub async fn register_client(&self, username: &str, handle: ClientHandle) {
        let id = handle.id();
        let replaced = self.registry.insert(username.to_string(), handle).await;
        let clients = self.registry.len().await;
        match replaced {
            Some(previous) => info!(
                username,
                id,
                replaced = previous.id(),
                clients,
                "client registered, replacing earlier connection"
            ),
            None => info!(username, id, clients, "client registered"),
        }
    }

    /// Removes the entry for `username` if there is one.
    pub async fn unregister_client(&self, username: &str) {
        if self.registry.remove(username).await.is_some() {
            self.log_unregistered(username).await;
        }
    }

    /// Removes the entry for `username` only if connection `id` still owns it.
    pub(crate) async fn release_client(&self, username: &str, id: ConnectionId) {
        if self.registry.remove_if_owned(username, id).await {
            self.log_unregistered(username).await;
        }
    }

    async fn log_unregistered(&self, username: &str) {
        let clients = self.registry.len().await;
        info!(username, clients, "client unregistered");
    }

    /// Forwards `body` from `sender` to whoever is registered as `receiver`.
    ///
    /// Messages for unknown receivers are dropped. There is no mailbox and the
    /// sender is never told either way.
    pub async fn route(&self, sender: &str, receiver: &str, body: &str) -> Delivery {
        let Some(handle) = self.registry.get(receiver).await else {
            debug!(sender, receiver, "dropping message for unknown receiver");
            return Delivery::UnknownReceiver;
        };

        let frame = ServerFrame::Deliver(Envelope::new(sender, receiver, body));
        match handle.send(&frame).await {
            Ok(()) => Delivery::Delivered,
            Err(err) => {
                warn!(sender, receiver, error = ?err, "failed to forward message");
                Delivery::WriteFailed
            }
        }
    }

    /// Pushes a disconnect signal to `username` and drops its entry.
    ///
    /// Returns false if nobody is registered under that name. The socket is
    /// left for the client and its handler to close.
    pub async fn disconnect_client(&self, username: &str) -> bool {
        let Some(handle) = self.registry.remove(username).await else {
            return false;
        };
        self.log_unregistered(username).await;

        let frame = ServerFrame::Disconnect {
            username: username.to_string(),
        };
        if let Err(err) = handle.send(&frame).await {
            debug!(username, error = ?err, "failed to push disconnect signal");
        }
        true
    }
}
