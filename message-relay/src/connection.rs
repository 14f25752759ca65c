use std::mem;

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, AsyncWrite, BufReader},
    net::{TcpStream, tcp::OwnedReadHalf},
};
use tracing::debug;

use crate::{
    message::{ClientFrame, read_line},
    registry::{ClientHandle, ConnectionId},
    server::Relay,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingRegistration,
    Registered { username: String },
    Closed,
}

/// Server side of one client session.
///
/// The handler task owns this value; the registry only ever sees a clone of
/// its [`ClientHandle`].
pub struct Connection<R> {
    id: ConnectionId,
    reader: R,
    outbound: ClientHandle,
    state: ConnectionState,
}

impl Connection<BufReader<OwnedReadHalf>> {
    pub fn from_stream(id: ConnectionId, stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(id, BufReader::new(reader), writer)
    }
}

impl<R> Connection<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new<W>(id: ConnectionId, reader: R, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id,
            reader,
            outbound: ClientHandle::new(id, writer),
            state: ConnectionState::AwaitingRegistration,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn username(&self) -> Option<&str> {
        match &self.state {
            ConnectionState::Registered { username } => Some(username),
            _ => None,
        }
    }

    /// Drives the session to completion. Cleanup runs whether or not the
    /// session ended with an error.
    pub async fn run(mut self, relay: &Relay) -> Result<()> {
        let result = self.serve(relay).await;
        self.close(relay).await;
        result
    }

    async fn serve(&mut self, relay: &Relay) -> Result<()> {
        let Some(username) = self.await_registration().await? else {
            debug!(id = self.id, "connection closed before registration");
            return Ok(());
        };

        relay
            .register_client(&username, self.outbound.clone())
            .await;
        self.state = ConnectionState::Registered {
            username: username.clone(),
        };

        self.relay_messages(relay, &username).await
    }

    /// The first line is the username, taken verbatim.
    async fn await_registration(&mut self) -> Result<Option<String>> {
        Ok(read_line(&mut self.reader).await?)
    }

    async fn relay_messages(&mut self, relay: &Relay, username: &str) -> Result<()> {
        while let Some(line) = read_line(&mut self.reader).await? {
            match ClientFrame::parse(&line) {
                Some(ClientFrame::Route { receiver, body }) => {
                    relay.route(username, &receiver, &body).await;
                }
                Some(ClientFrame::Disconnect { username: announced }) => {
                    debug!(username, announced = %announced, "client sent disconnect signal");
                    break;
                }
                Some(ClientFrame::Register { .. }) | None => {
                    debug!(username, line = %line, "dropping malformed frame");
                }
            }
        }
        Ok(())
    }

    async fn close(&mut self, relay: &Relay) {
        if let ConnectionState::Registered { username } =
            mem::replace(&mut self.state, ConnectionState::Closed)
        {
            relay.release_client(&username, self.id).await;
        }

        if let Err(err) = self.outbound.shutdown().await {
            debug!(id = self.id, error = ?err, "failed to shut down client socket");
        }
    }
}
