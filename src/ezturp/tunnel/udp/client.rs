use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{net::UdpSocket, sync::watch, time::Instant};
use tracing::Instrument;

use crate::ezturp::{
    config::Settings,
    net::{resolve_socket_addr, unspecified_for},
    tunnel::{
        ClientOptions, TunnelError, instance_span,
        protocol::{FrameType, ProtocolError, encode_frame, parse_frame},
        registry::SessionRegistry,
        shutdown_requested,
        udp::MAX_DATAGRAM,
    },
};

/// Private side of a UDP tunnel.
///
/// Keeps the server informed of its address with periodic MAINTAIN_UDP_CLIENT_ADDR
/// datagrams and gives every server session its own socket towards the local service.
/// Sessions without traffic for `udp_session_idle` are torn down.
pub struct UdpClient {
    opts: ClientOptions,
    span: tracing::Span,
    sessions: Arc<SessionRegistry<Arc<LocalSession>>>,
}

#[derive(Debug)]
struct LocalSession {
    socket: UdpSocket,
    last_activity: Mutex<Instant>,
    closed: watch::Sender<bool>,
}

impl LocalSession {
    fn new(socket: UdpSocket) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            socket,
            last_activity: Mutex::new(Instant::now()),
            closed,
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }
}

struct State {
    link: Arc<UdpSocket>,
    local_target: SocketAddr,
    settings: Settings,
    sessions: Arc<SessionRegistry<Arc<LocalSession>>>,
}

impl UdpClient {
    pub fn new(opts: ClientOptions) -> Self {
        let span = instance_span("UdpClient", &opts.name);
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
        let resolve = |addr: &str| {
            let addr = addr.to_string();
            async move {
                resolve_socket_addr(&addr)
                    .await
                    .map_err(|source| TunnelError::Resolve { addr, source })
            }
        };
        let server = resolve(&self.opts.internal_addr).await?;
        let local_target = resolve(&self.opts.local_addr).await?;

        let bind_addr = unspecified_for(server);
        let link = UdpSocket::bind(bind_addr)
            .await
            .map_err(|source| TunnelError::Bind {
                addr: bind_addr.to_string(),
                source,
            })?;
        link.connect(server)
            .await
            .map_err(|source| TunnelError::Dial {
                addr: self.opts.internal_addr.clone(),
                source,
            })?;

        let state = Arc::new(State {
            link: Arc::new(link),
            local_target,
            settings: self.opts.settings.clone(),
            sessions: self.sessions.clone(),
        });
        tracing::info!(server = %server, local = %local_target, "udp client: waiting for messages");

        let mut heartbeat = tokio::spawn(
            heartbeat(state.link.clone(), state.settings.udp_heartbeat_interval).in_current_span(),
        );

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let res = loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break Ok(()),
                res = &mut heartbeat => {
                    break Err(res.unwrap_or_else(|err| TunnelError::Io(std::io::Error::other(err))));
                }
                res = state.link.recv(&mut buf) => {
                    let n = match res {
                        Ok(n) => n,
                        Err(err) => break Err(err.into()),
                    };
                    let frame = match parse_frame(&buf[..n]) {
                        Ok(frame) => frame,
                        Err(err) => break Err(err.into()),
                    };
                    match frame.kind {
                        FrameType::Data => state.dispatch(frame.session_id, &frame.payload).await,
                        other => tracing::warn!(session = frame.session_id, kind = %other, "udp client: unknown message type"),
                    }
                }
            }
        };

        heartbeat.abort();
        for (_, session) in state.sessions.drain() {
            session.close();
        }
        match &res {
            Ok(()) => tracing::info!(server = %server, "udp client: stopped"),
            Err(err) => tracing::error!(server = %server, err = %err, "udp client: receive loop ended"),
        }
        res
    }
}

async fn heartbeat(link: Arc<UdpSocket>, every: Duration) -> TunnelError {
    let hello = match encode_frame(FrameType::MaintainUdpClientAddr, 0, &[]) {
        Ok(frame) => frame,
        Err(err) => return err.into(),
    };
    let mut tick = tokio::time::interval(every);
    loop {
        tick.tick().await;
        if let Err(err) = link.send(&hello).await {
            tracing::warn!(err = %err, "udp client: heartbeat failed");
            return TunnelError::KeepAlive(ProtocolError::Io(err));
        }
    }
}

impl State {
    async fn dispatch(self: &Arc<Self>, id: u32, payload: &[u8]) {
        let session = match self.sessions.get(id) {
            Some(session) => session,
            None => match self.create_session(id).await {
                Ok(session) => session,
                Err(err) => {
                    tracing::warn!(session = id, err = %err, "udp client: failed to create session");
                    return;
                }
            },
        };
        match session.socket.send(payload).await {
            Ok(_) => {
                session.touch();
                tracing::debug!(session = id, len = payload.len(), "udp client: forwarded to local");
            }
            Err(err) => tracing::debug!(session = id, err = %err, "udp client: local send failed"),
        }
    }

    async fn create_session(self: &Arc<Self>, id: u32) -> std::io::Result<Arc<LocalSession>> {
        let socket = UdpSocket::bind(unspecified_for(self.local_target)).await?;
        socket.connect(self.local_target).await?;
        let local = socket.local_addr()?;
        let session = Arc::new(LocalSession::new(socket));
        let closed = session.closed.subscribe();
        if let Some(stale) = self.sessions.insert(id, session.clone()) {
            stale.close();
        }
        tracing::info!(session = id, local = %local, "udp client: session created");
        tokio::spawn(session_loop(self.clone(), id, session.clone(), closed).in_current_span());
        Ok(session)
    }
}

/// Local service -> DATA frames, until the session goes idle or is closed.
async fn session_loop(
    state: Arc<State>,
    id: u32,
    session: Arc<LocalSession>,
    mut closed: watch::Receiver<bool>,
) {
    let idle = state.settings.udp_session_idle;
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut deadline = session.last_activity() + idle;

    loop {
        tokio::select! {
            _ = closed.changed() => return,
            _ = tokio::time::sleep_until(deadline) => {
                let next = session.last_activity() + idle;
                if next <= Instant::now() {
                    break;
                }
                deadline = next;
            }
            res = session.socket.recv(&mut buf) => match res {
                Ok(n) => {
                    let frame = match encode_frame(FrameType::Data, id, &buf[..n]) {
                        Ok(frame) => frame,
                        Err(err) => {
                            tracing::warn!(session = id, err = %err, "udp client: encode failed");
                            continue;
                        }
                    };
                    match state.link.send(&frame).await {
                        Ok(_) => {
                            session.touch();
                            tracing::debug!(session = id, len = n, "udp client: forwarded to server");
                        }
                        Err(err) => tracing::warn!(session = id, err = %err, "udp client: internal send failed"),
                    }
                }
                Err(err) => tracing::debug!(session = id, err = %err, "udp client: local receive failed"),
            },
        }
    }

    if state
        .sessions
        .remove_if(id, |cur| Arc::ptr_eq(cur, &session))
        .is_some()
    {
        tracing::info!(
            session = id,
            idle = %humantime::format_duration(idle),
            "udp client: idle session removed"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Arc, time::Duration};

    use tokio::net::UdpSocket;

    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    async fn state_with_idle(idle: Duration) -> (Arc<State>, UdpSocket) {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = UdpSocket::bind(any).await.unwrap();
        let service = UdpSocket::bind(any).await.unwrap();
        let link = UdpSocket::bind(any).await.unwrap();
        link.connect(server.local_addr().unwrap()).await.unwrap();
        let state = Arc::new(State {
            link: Arc::new(link),
            local_target: service.local_addr().unwrap(),
            settings: Settings {
                udp_session_idle: idle,
                ..Settings::default()
            },
            sessions: Arc::new(SessionRegistry::new()),
        });
        (state, service)
    }

    #[tokio::test(start_paused = true)]
    async fn session_survives_until_idle_deadline() {
        let (state, _service) = state_with_idle(30 * MINUTE).await;
        state.create_session(7).await.unwrap();
        settle().await;

        tokio::time::advance(30 * MINUTE - Duration::from_secs(1)).await;
        settle().await;
        assert!(state.sessions.get(7).is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert!(state.sessions.get(7).is_none());
        assert_eq!(state.sessions.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_pushes_the_deadline_out() {
        let (state, _service) = state_with_idle(30 * MINUTE).await;
        let session = state.create_session(9).await.unwrap();
        settle().await;

        tokio::time::advance(20 * MINUTE).await;
        session.touch();

        // The first deadline passes, the refreshed one has not.
        tokio::time::advance(15 * MINUTE).await;
        settle().await;
        assert!(state.sessions.get(9).is_some());

        tokio::time::advance(16 * MINUTE).await;
        settle().await;
        assert!(state.sessions.get(9).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_local_send_does_not_refresh_activity() {
        let (state, service) = state_with_idle(30 * MINUTE).await;
        let session = state.create_session(5).await.unwrap();
        let created = session.last_activity();

        tokio::time::advance(10 * MINUTE).await;
        // Larger than any IPv4 UDP datagram, so the send fails.
        state.dispatch(5, &vec![0u8; 70 * 1024]).await;
        assert_eq!(session.last_activity(), created);

        state.dispatch(5, b"ping").await;
        assert!(session.last_activity() > created);
        let mut buf = [0u8; 16];
        let n = service.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[tokio::test(start_paused = true)]
    async fn replaced_session_is_not_removed_by_its_predecessor() {
        let (state, _service) = state_with_idle(MINUTE).await;
        let old = state.create_session(3).await.unwrap();
        settle().await;

        tokio::time::advance(MINUTE / 2).await;
        let new = state.create_session(3).await.unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        settle().await;

        // The old timer would have fired by now; only the new session's idleness counts.
        tokio::time::advance(MINUTE * 3 / 4).await;
        settle().await;
        let current = state.sessions.get(3).unwrap();
        assert!(Arc::ptr_eq(&current, &new));

        tokio::time::advance(MINUTE).await;
        settle().await;
        assert!(state.sessions.get(3).is_none());
    }
}
