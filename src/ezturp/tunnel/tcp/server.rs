use std::sync::{Arc, Mutex};

use tokio::{
    net::{
        TcpListener,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{mpsc, watch},
    task::JoinSet,
};
use tracing::Instrument;

use crate::ezturp::{
    config::Settings,
    tunnel::{
        ServerOptions, TunnelError, bind_tcp, instance_span,
        link::InternalLink,
        protocol::{self, Frame, FrameType},
        registry::SessionRegistry,
        shutdown_requested,
        tcp::{PumpRead, SessionReader, TcpSession},
    },
};

type Link = InternalLink<OwnedWriteHalf>;

/// Public side of a TCP tunnel.
///
/// Accepts one tunnel client at a time on the internal address and exposes its local service
/// on the external address. Every external connection becomes a session multiplexed over the
/// internal link; with no link installed, external connections are closed right away.
pub struct TcpServer {
    opts: ServerOptions,
    span: tracing::Span,
    state: Arc<State>,
}

struct State {
    settings: Settings,
    link: Mutex<Option<Arc<Link>>>,
    sessions: SessionRegistry<Arc<TcpSession>>,
}

impl TcpServer {
    pub fn new(opts: ServerOptions) -> Self {
        let span = instance_span("TcpServer", &opts.name);
        let state = Arc::new(State {
            settings: opts.settings.clone(),
            link: Mutex::new(None),
            sessions: SessionRegistry::new(),
        });
        Self { opts, span, state }
    }

    pub fn has_internal_link(&self) -> bool {
        self.state.link().is_some()
    }

    pub fn session_count(&self) -> usize {
        self.state.sessions.len()
    }

    /// Binds both addresses and serves until `shutdown` fires.
    pub async fn listen(&self, shutdown: watch::Receiver<bool>) -> Result<(), TunnelError> {
        let internal = bind_tcp(&self.opts.internal_addr).await?;
        let external = bind_tcp(&self.opts.external_addr).await?;
        self.serve(internal, external, shutdown).await
    }

    /// Serves on already bound listeners until `shutdown` fires.
    pub async fn serve(
        &self,
        internal: TcpListener,
        external: TcpListener,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), TunnelError> {
        self.run(internal, external, shutdown)
            .instrument(self.span.clone())
            .await
    }

    async fn run(
        &self,
        internal: TcpListener,
        external: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TunnelError> {
        tracing::info!(
            internal = %internal.local_addr()?,
            external = %external.local_addr()?,
            "tcp server: listening"
        );

        // Accepted internal read halves flow to the dispatcher; the dispatcher asks for the
        // next link once it is done with the current one.
        let (accepted_tx, accepted_rx) = mpsc::channel(1);
        let (reaccept_tx, reaccept_rx) = mpsc::channel(1);

        let mut tasks = JoinSet::new();
        tasks.spawn(
            accept_internal(self.state.clone(), internal, accepted_tx, reaccept_rx).in_current_span(),
        );
        tasks.spawn(dispatch(self.state.clone(), accepted_rx, reaccept_tx).in_current_span());
        tasks.spawn(accept_external(self.state.clone(), external).in_current_span());

        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => {}
            res = tasks.join_next() => {
                if let Some(Err(err)) = res {
                    tracing::error!(err = %err, "tcp server: task failed");
                }
            }
        }

        tasks.shutdown().await;
        if let Some(link) = self.state.set_link(None) {
            link.close().await;
        }
        for (_, session) in self.state.sessions.drain() {
            session.close();
        }
        tracing::info!("tcp server: stopped");
        Ok(())
    }
}

impl State {
    fn link(&self) -> Option<Arc<Link>> {
        self.link.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_link(&self, link: Option<Arc<Link>>) -> Option<Arc<Link>> {
        let mut slot = self.link.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *slot, link)
    }

    async fn send(&self, kind: FrameType, id: u32, payload: &[u8]) -> Result<(), TunnelError> {
        let link = self.link().ok_or(TunnelError::NoInternalLink)?;
        link.send(kind, id, payload).await?;
        Ok(())
    }

    /// Removes `id` if it still maps to `session`, telling the client when `notify` is set.
    async fn remove_session(&self, id: u32, session: &Arc<TcpSession>, notify: bool) {
        let Some(removed) = self.sessions.remove_if(id, |cur| Arc::ptr_eq(cur, session)) else {
            return;
        };
        removed.close();
        tracing::debug!(session = id, peer = ?removed.peer(), "tcp server: session removed");
        if notify {
            if let Err(err) = self.send(FrameType::RemoveSession, id, &[]).await {
                tracing::debug!(session = id, err = %err, "tcp server: remove notification not sent");
            }
        }
    }

    async fn handle_frame(&self, frame: Frame) {
        let id = frame.session_id;
        if frame.kind == FrameType::KeepAlive {
            return;
        }
        let Some(session) = self.sessions.get(id) else {
            tracing::warn!(session = id, kind = %frame.kind, "tcp server: frame for unknown session dropped");
            return;
        };
        match frame.kind {
            FrameType::Data => {
                if let Err(err) = session.write(&frame.payload).await {
                    tracing::debug!(session = id, err = %err, "tcp server: external write failed");
                    self.remove_session(id, &session, true).await;
                }
            }
            FrameType::RemoveSession => self.remove_session(id, &session, false).await,
            other => {
                tracing::warn!(session = id, kind = %other, "tcp server: unexpected frame type");
                self.remove_session(id, &session, true).await;
            }
        }
    }
}

async fn accept_internal(
    state: Arc<State>,
    ln: TcpListener,
    accepted: mpsc::Sender<OwnedReadHalf>,
    mut reaccept: mpsc::Receiver<()>,
) {
    loop {
        let (conn, peer) = match ln.accept().await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(err = %err, "tcp server: internal accept failed");
                tokio::time::sleep(state.settings.reaccept_backoff).await;
                continue;
            }
        };
        let _ = conn.set_nodelay(true);
        let (rd, wr) = conn.into_split();
        let link = Arc::new(InternalLink::new(wr, peer));
        state.set_link(Some(link.clone()));
        tracing::info!(client = %peer, "tcp server: internal connection established");

        if accepted.send(rd).await.is_err() || reaccept.recv().await.is_none() {
            return;
        }

        state.set_link(None);
        link.close().await;
        tracing::info!(client = %link.peer(), "tcp server: internal connection lost");
    }
}

async fn dispatch(
    state: Arc<State>,
    mut accepted: mpsc::Receiver<OwnedReadHalf>,
    reaccept: mpsc::Sender<()>,
) {
    let idle = state.settings.internal_idle_timeout;
    while let Some(mut rd) = accepted.recv().await {
        loop {
            let frame = match tokio::time::timeout(idle, protocol::read_frame(&mut rd)).await {
                Ok(Ok(frame)) => frame,
                Ok(Err(err)) => {
                    tracing::warn!(err = %err, "tcp server: internal read failed");
                    break;
                }
                Err(_) => {
                    tracing::warn!(
                        idle = %humantime::format_duration(idle),
                        "tcp server: internal connection idle"
                    );
                    break;
                }
            };
            state.handle_frame(frame).await;
        }

        drop(rd);
        if reaccept.send(()).await.is_err() {
            return;
        }
        tokio::time::sleep(state.settings.reaccept_backoff).await;
    }
}

async fn accept_external(state: Arc<State>, ln: TcpListener) {
    loop {
        let (conn, peer) = match ln.accept().await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(err = %err, "tcp server: external accept failed");
                tokio::time::sleep(state.settings.reaccept_backoff).await;
                continue;
            }
        };

        let Some(link) = state.link() else {
            tracing::debug!(client = %peer, "tcp server: no internal connection, refusing");
            continue;
        };

        let _ = conn.set_nodelay(true);
        let (session, reader) = TcpSession::open(conn);
        let id = state.sessions.insert_new(session.clone());
        if let Err(err) = link.send_control(FrameType::NewSession, id).await {
            tracing::warn!(client = %peer, err = %err, "tcp server: failed to create session");
            state.sessions.remove_if(id, |cur| Arc::ptr_eq(cur, &session));
            session.close();
            continue;
        }
        tracing::debug!(session = id, client = %peer, "tcp server: session created");
        tokio::spawn(pump(state.clone(), id, session, reader).in_current_span());
    }
}

/// External connection -> DATA frames on whatever link is installed.
async fn pump(state: Arc<State>, id: u32, session: Arc<TcpSession>, mut reader: SessionReader) {
    let mut buf = vec![0u8; state.settings.buffer_size];
    loop {
        match reader.read(&mut buf).await {
            PumpRead::Data(n) => {
                if let Err(err) = state.send(FrameType::Data, id, &buf[..n]).await {
                    tracing::debug!(session = id, err = %err, "tcp server: internal write failed");
                    break;
                }
            }
            PumpRead::Eof => {
                tracing::debug!(session = id, "tcp server: external connection closed");
                break;
            }
            PumpRead::Closed => return,
        }
    }
    state.remove_session(id, &session, true).await;
}
