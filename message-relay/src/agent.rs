use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use anyhow::{Context, Result, bail};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{Mutex, RwLock, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::AgentConfig,
    message::{ClientFrame, Envelope, ServerFrame, contains_line_break, read_line, write_frame},
};

/// Receives what the relay delivers to an [`Agent`].
///
/// Callbacks run on the agent's receive task. A host that needs them on a
/// particular thread or event loop should forward them there, for example
/// through the channel implementation below.
pub trait MessageListener: Send + Sync + 'static {
    fn on_message(&self, envelope: Envelope);

    /// Called once each time a connected session ends, whoever ended it.
    fn on_disconnected(&self) {}
}

impl MessageListener for mpsc::UnboundedSender<Envelope> {
    fn on_message(&self, envelope: Envelope) {
        if self.send(envelope).is_err() {
            debug!("message listener channel closed; dropping envelope");
        }
    }
}

/// One participant's session with the relay.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    config: AgentConfig,
    listener: RwLock<Option<Arc<dyn MessageListener>>>,
    session: Mutex<Option<Session>>,
    next_session: AtomicU64,
}

type SessionId = u64;

struct Session {
    id: SessionId,
    username: String,
    writer: OwnedWriteHalf,
    disconnecting: Arc<AtomicBool>,
    stop: watch::Sender<bool>,
    // Dropping the handle detaches the task; it exits once `stop` fires.
    _receive_task: JoinHandle<()>,
}

/// What a receive loop knows about the session it serves.
struct SessionLink {
    id: SessionId,
    disconnecting: Arc<AtomicBool>,
    stopped: watch::Receiver<bool>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            inner: Arc::new(AgentInner {
                config,
                listener: RwLock::new(None),
                session: Mutex::new(None),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    /// Installs the listener for delivered messages, replacing any earlier one.
    pub async fn set_listener<L>(&self, listener: L)
    where
        L: MessageListener,
    {
        *self.inner.listener.write().await = Some(Arc::new(listener));
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.session.lock().await.is_some()
    }

    /// Username of the current session, if connected.
    pub async fn username(&self) -> Option<String> {
        let session = self.inner.session.lock().await;
        session.as_ref().map(|session| session.username.clone())
    }

    /// Dials the relay, registers `username` and starts the receive loop.
    ///
    /// On failure the agent stays disconnected and no loop is running.
    pub async fn connect(&self, username: impl Into<String>) -> Result<()> {
        let username = username.into();
        if contains_line_break(&username) {
            bail!("username must not contain line breaks");
        }

        let mut session = self.inner.session.lock().await;
        if session.is_some() {
            bail!("agent is already connected");
        }

        let address = self.inner.config.address();
        let stream = TcpStream::connect((self.inner.config.host.as_str(), self.inner.config.port))
            .await
            .with_context(|| format!("failed to connect to {address}"))?;
        let (reader, mut writer) = stream.into_split();

        write_frame(
            &mut writer,
            &ClientFrame::Register {
                username: username.clone(),
            },
        )
        .await
        .with_context(|| format!("failed to register as {username}"))?;

        info!(username = %username, address = %address, "connected to relay");

        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        let disconnecting = Arc::new(AtomicBool::new(false));
        let (stop, stopped) = watch::channel(false);
        let link = SessionLink {
            id,
            disconnecting: Arc::clone(&disconnecting),
            stopped,
        };
        let receive_task = tokio::spawn(receive_loop(
            Arc::clone(&self.inner),
            BufReader::new(reader),
            link,
        ));

        *session = Some(Session {
            id,
            username,
            writer,
            disconnecting,
            stop,
            _receive_task: receive_task,
        });
        Ok(())
    }

    /// Writes `receiver:body` to the relay.
    ///
    /// The body is sent unescaped. Separators inside it survive the trip, but
    /// line breaks would split the frame and are rejected. A failed write
    /// tears the session down.
    pub async fn send_message(&self, receiver: &str, body: &str) -> Result<()> {
        if contains_line_break(receiver) || contains_line_break(body) {
            bail!("messages must not contain line breaks");
        }

        let frame = ClientFrame::Route {
            receiver: receiver.to_string(),
            body: body.to_string(),
        };

        let (id, write_result) = {
            let mut session = self.inner.session.lock().await;
            let Some(session) = session.as_mut() else {
                bail!("agent is not connected");
            };
            (session.id, write_frame(&mut session.writer, &frame).await)
        };

        if let Err(err) = write_result {
            warn!(receiver, error = ?err, "failed to send message; disconnecting");
            self.inner.end_session(Some(id)).await;
            return Err(err).context("failed to send message");
        }
        Ok(())
    }

    /// Leaves the relay. Safe to call when already disconnected.
    pub async fn disconnect(&self) {
        self.inner.end_session(None).await;
    }
}

impl AgentInner {
    /// The only transition out of the connected state.
    ///
    /// With `Some(id)` only that session is ended, so a loop left over from an
    /// earlier session can never tear down its successor. Every close step is
    /// attempted even if an earlier one fails.
    async fn end_session(&self, only: Option<SessionId>) {
        let session = {
            let mut current = self.session.lock().await;
            let superseded = matches!(
                (current.as_ref(), only),
                (Some(session), Some(id)) if session.id != id
            );
            if superseded { None } else { current.take() }
        };
        let Some(mut session) = session else {
            return;
        };
        session.disconnecting.store(true, Ordering::SeqCst);

        let signal = ClientFrame::Disconnect {
            username: session.username.clone(),
        };
        if let Err(err) = write_frame(&mut session.writer, &signal).await {
            debug!(error = ?err, "could not send disconnect signal");
        }
        if let Err(err) = session.writer.shutdown().await {
            debug!(error = ?err, "failed to shut down writer");
        }
        // Wakes the receive loop, which drops the read half and with it the socket.
        session.stop.send_replace(true);

        info!(username = %session.username, "disconnected from relay");
        if let Some(listener) = self.listener.read().await.as_ref() {
            listener.on_disconnected();
        }
    }

    async fn deliver(&self, envelope: Envelope) {
        match self.listener.read().await.as_ref() {
            Some(listener) => listener.on_message(envelope),
            None => debug!(sender = %envelope.sender, "no listener installed; dropping envelope"),
        }
    }
}

async fn receive_loop(
    inner: Arc<AgentInner>,
    mut reader: BufReader<OwnedReadHalf>,
    mut link: SessionLink,
) {
    loop {
        let line = select! {
            _ = link.stopped.changed() => break,
            line = read_line(&mut reader) => line,
        };
        let disconnecting = link.disconnecting.load(Ordering::SeqCst);

        match line {
            Ok(Some(line)) => match ServerFrame::parse(&line) {
                Some(ServerFrame::Deliver(envelope)) => inner.deliver(envelope).await,
                Some(ServerFrame::Disconnect { username }) => {
                    info!(username = %username, "relay requested disconnect");
                    inner.end_session(Some(link.id)).await;
                    break;
                }
                None => debug!(line = %line, "ignoring malformed frame"),
            },
            Ok(None) => {
                if !disconnecting {
                    info!("relay closed the connection");
                    inner.end_session(Some(link.id)).await;
                }
                break;
            }
            Err(err) => {
                if disconnecting {
                    debug!(error = ?err, "read failed while disconnecting");
                } else {
                    warn!(error = ?err, "error listening for messages; disconnecting");
                    inner.end_session(Some(link.id)).await;
                }
                break;
            }
        }
    }
}
