use std::{collections::HashMap, io, sync::Arc};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};

use crate::message::{ServerFrame, write_frame};

pub type ConnectionId = u64;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Routing handle for one live connection.
///
/// Cloning is cheap and every clone shares the same outbound half. The
/// registry keeps a clone only to write to the connection; closing it is left
/// to the connection's own handler.
#[derive(Clone)]
pub struct ClientHandle {
    id: ConnectionId,
    writer: Arc<Mutex<BoxedWriter>>,
}

impl ClientHandle {
    pub fn new<W>(id: ConnectionId, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id,
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Writes one frame. Blocks behind any other write to the same connection.
    pub async fn send(&self, frame: &ServerFrame) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, frame).await
    }

    pub(crate) async fn shutdown(&self) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle").field("id", &self.id).finish()
    }
}

/// Live mapping from username to the connection registered under it.
///
/// A duplicate registration replaces the earlier entry. The lock is only held
/// for map operations, never across a socket write.
#[derive(Default)]
pub struct Registry {
    clients: Mutex<HashMap<String, ClientHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `handle` under `username`, returning the entry it replaced.
    pub async fn insert(&self, username: String, handle: ClientHandle) -> Option<ClientHandle> {
        let mut clients = self.clients.lock().await;
        clients.insert(username, handle)
    }

    pub async fn remove(&self, username: &str) -> Option<ClientHandle> {
        let mut clients = self.clients.lock().await;
        clients.remove(username)
    }

    /// Removes the entry only while it still belongs to connection `id`.
    ///
    /// A connection that was displaced by a newer registration of the same
    /// username must not evict its replacement when it closes.
    pub async fn remove_if_owned(&self, username: &str, id: ConnectionId) -> bool {
        let mut clients = self.clients.lock().await;
        match clients.get(username) {
            Some(handle) if handle.id == id => {
                clients.remove(username);
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, username: &str) -> Option<ClientHandle> {
        let clients = self.clients.lock().await;
        clients.get(username).cloned()
    }

    pub async fn contains(&self, username: &str) -> bool {
        self.clients.lock().await.contains_key(username)
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }

    /// Registered usernames, sorted.
    pub async fn usernames(&self) -> Vec<String> {
        let clients = self.clients.lock().await;
        let mut names: Vec<String> = clients.keys().cloned().collect();
        names.sort_unstable();
        names
    }
}
