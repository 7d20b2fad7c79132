use std::{sync::Arc, time::Duration};

use tokio::{
    net::{TcpStream, tcp::OwnedWriteHalf},
    sync::watch,
};
use tracing::Instrument;

use crate::ezturp::{
    config::Settings,
    tunnel::{
        ClientOptions, TunnelError, instance_span,
        link::InternalLink,
        protocol::{self, Frame, FrameType},
        registry::SessionRegistry,
        shutdown_requested,
        tcp::{PumpRead, SessionReader, TcpSession},
    },
};

type Link = InternalLink<OwnedWriteHalf>;

/// Private side of a TCP tunnel.
///
/// Dials the server's internal address once and relays every session the server opens to
/// the local service. [`TcpClient::connect`] returns when the internal link is gone; callers
/// that want a persistent tunnel run it under a supervisor.
pub struct TcpClient {
    opts: ClientOptions,
    span: tracing::Span,
    sessions: Arc<SessionRegistry<Arc<TcpSession>>>,
}

struct State {
    link: Arc<Link>,
    local_addr: String,
    settings: Settings,
    sessions: Arc<SessionRegistry<Arc<TcpSession>>>,
}

impl TcpClient {
    pub fn new(opts: ClientOptions) -> Self {
        let span = instance_span("TcpClient", &opts.name);
        Self {
            opts,
            span,
            sessions: Arc::new(SessionRegistry::new()),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub async fn connect(&self, shutdown: watch::Receiver<bool>) -> Result<(), TunnelError> {
        self.run(shutdown).instrument(self.span.clone()).await
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), TunnelError> {
        let settings = self.opts.settings.clone();
        let conn = dial(&self.opts.internal_addr, settings.dial_timeout).await?;
        let peer = conn.peer_addr()?;
        let _ = conn.set_nodelay(true);
        let (mut rd, wr) = conn.into_split();

        let state = Arc::new(State {
            link: Arc::new(InternalLink::new(wr, peer)),
            local_addr: self.opts.local_addr.clone(),
            settings,
            sessions: self.sessions.clone(),
        });
        tracing::info!(server = %peer, local = %state.local_addr, "tcp client: connected");

        let mut keep_alive = tokio::spawn(
            keep_alive(state.link.clone(), state.settings.keep_alive_interval).in_current_span(),
        );

        let res = loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break Ok(()),
                res = &mut keep_alive => {
                    break Err(res.unwrap_or_else(|err| TunnelError::Io(std::io::Error::other(err))));
                }
                frame = protocol::read_frame(&mut rd) => match frame {
                    Ok(frame) => state.handle_frame(frame).await,
                    Err(err) => break Err(TunnelError::LinkLost(err)),
                },
            }
        };

        keep_alive.abort();
        state.link.close().await;
        for (_, session) in state.sessions.drain() {
            session.close();
        }
        let server = state.link.peer();
        match &res {
            Ok(()) => tracing::info!(server = %server, "tcp client: stopped"),
            Err(err) => tracing::error!(server = %server, err = %err, "tcp client: internal connection lost"),
        }
        res
    }
}

async fn dial(addr: &str, limit: Duration) -> Result<TcpStream, TunnelError> {
    let dial_err = |source: std::io::Error| TunnelError::Dial {
        addr: addr.to_string(),
        source,
    };
    match tokio::time::timeout(limit, TcpStream::connect(addr)).await {
        Ok(res) => res.map_err(dial_err),
        Err(_) => Err(dial_err(std::io::ErrorKind::TimedOut.into())),
    }
}

async fn keep_alive(link: Arc<Link>, every: Duration) -> TunnelError {
    let mut tick = tokio::time::interval(every);
    tick.tick().await;
    loop {
        tick.tick().await;
        if let Err(err) = link.send_control(FrameType::KeepAlive, 0).await {
            tracing::warn!(err = %err, "tcp client: keep-alive failed");
            return TunnelError::KeepAlive(err);
        }
    }
}

impl State {
    async fn handle_frame(self: &Arc<Self>, frame: Frame) {
        let id = frame.session_id;
        match frame.kind {
            FrameType::NewSession => self.create_session(id).await,
            FrameType::RemoveSession => {
                if let Some(session) = self.sessions.remove(id) {
                    session.close();
                    tracing::debug!(session = id, "tcp client: session removed by server");
                }
            }
            FrameType::Data => match self.sessions.get(id) {
                Some(session) => {
                    if let Err(err) = session.write(&frame.payload).await {
                        tracing::debug!(session = id, err = %err, "tcp client: local write failed");
                        self.remove_session(id, &session, true).await;
                    }
                }
                None => {
                    tracing::warn!(session = id, "tcp client: data for unknown session");
                    self.notify_removed(id).await;
                }
            },
            FrameType::KeepAlive => {}
            other => {
                tracing::warn!(session = id, kind = %other, "tcp client: unknown frame type ignored");
            }
        }
    }

    async fn create_session(self: &Arc<Self>, id: u32) {
        let conn = match dial(&self.local_addr, self.settings.dial_timeout).await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::error!(session = id, err = %err, "tcp client: failed to create session");
                if let Some(stale) = self.sessions.remove(id) {
                    stale.close();
                }
                self.notify_removed(id).await;
                return;
            }
        };
        let _ = conn.set_nodelay(true);
        let (session, reader) = TcpSession::open(conn);
        if let Some(stale) = self.sessions.insert(id, session.clone()) {
            stale.close();
        }
        tracing::debug!(session = id, local = ?session.peer(), "tcp client: session created");
        tokio::spawn(pump(self.clone(), id, session, reader).in_current_span());
    }

    /// Removes `id` if it still maps to `session`, telling the server when `notify` is set.
    async fn remove_session(&self, id: u32, session: &Arc<TcpSession>, notify: bool) {
        let Some(removed) = self.sessions.remove_if(id, |cur| Arc::ptr_eq(cur, session)) else {
            return;
        };
        removed.close();
        tracing::debug!(session = id, "tcp client: session removed");
        if notify {
            self.notify_removed(id).await;
        }
    }

    async fn notify_removed(&self, id: u32) {
        if let Err(err) = self.link.send_control(FrameType::RemoveSession, id).await {
            tracing::debug!(session = id, err = %err, "tcp client: remove notification not sent");
        }
    }
}

/// Local connection -> DATA frames on the internal link.
async fn pump(state: Arc<State>, id: u32, session: Arc<TcpSession>, mut reader: SessionReader) {
    let mut buf = vec![0u8; state.settings.buffer_size];
    loop {
        match reader.read(&mut buf).await {
            PumpRead::Data(n) => {
                if let Err(err) = state.link.send(FrameType::Data, id, &buf[..n]).await {
                    tracing::debug!(session = id, err = %err, "tcp client: internal write failed");
                    state.remove_session(id, &session, false).await;
                    return;
                }
            }
            PumpRead::Eof => {
                tracing::debug!(session = id, "tcp client: local connection closed");
                state.remove_session(id, &session, true).await;
                return;
            }
            PumpRead::Closed => return,
        }
    }
}
