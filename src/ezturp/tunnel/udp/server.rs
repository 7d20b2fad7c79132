use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use tokio::{net::UdpSocket, sync::watch, task::JoinSet};
use tracing::Instrument;

use crate::ezturp::tunnel::{
    ServerOptions, TunnelError, bind_udp, instance_span,
    protocol::{FrameType, encode_frame, parse_frame},
    registry::AddrSessions,
    shutdown_requested,
    udp::MAX_DATAGRAM,
};

/// Public side of a UDP tunnel.
///
/// Every external source address is a session. The client is whoever last sent
/// MAINTAIN_UDP_CLIENT_ADDR to the internal socket; until one has, external datagrams are
/// dropped. Sessions are never expired on this side.
pub struct UdpServer {
    opts: ServerOptions,
    span: tracing::Span,
    state: Arc<State>,
}

struct State {
    client_addr: Mutex<Option<SocketAddr>>,
    sessions: AddrSessions,
}

impl UdpServer {
    pub fn new(opts: ServerOptions) -> Self {
        let span = instance_span("UdpServer", &opts.name);
        let state = Arc::new(State {
            client_addr: Mutex::new(None),
            sessions: AddrSessions::new(),
        });
        Self { opts, span, state }
    }

    /// Last learned tunnel client address.
    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.state.client_addr()
    }

    pub fn session_count(&self) -> usize {
        self.state.sessions.len()
    }

    pub async fn listen(&self, shutdown: watch::Receiver<bool>) -> Result<(), TunnelError> {
        let internal = bind_udp(&self.opts.internal_addr).await?;
        let external = bind_udp(&self.opts.external_addr).await?;
        self.serve(internal, external, shutdown).await
    }

    pub async fn serve(
        &self,
        internal: UdpSocket,
        external: UdpSocket,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), TunnelError> {
        self.run(internal, external, shutdown)
            .instrument(self.span.clone())
            .await
    }

    async fn run(
        &self,
        internal: UdpSocket,
        external: UdpSocket,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TunnelError> {
        tracing::info!(
            internal = %internal.local_addr()?,
            external = %external.local_addr()?,
            "udp server: listening"
        );

        let internal = Arc::new(internal);
        let external = Arc::new(external);
        let mut tasks = JoinSet::new();
        tasks.spawn(
            internal_loop(self.state.clone(), internal.clone(), external.clone()).in_current_span(),
        );
        tasks.spawn(external_loop(self.state.clone(), internal, external).in_current_span());

        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => {}
            res = tasks.join_next() => {
                if let Some(Err(err)) = res {
                    tracing::error!(err = %err, "udp server: task failed");
                }
            }
        }
        tasks.shutdown().await;
        tracing::info!("udp server: stopped");
        Ok(())
    }
}

impl State {
    fn client_addr(&self) -> Option<SocketAddr> {
        *self.client_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn learn_client_addr(&self, addr: SocketAddr) {
        let prev = self
            .client_addr
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(addr);
        if prev != Some(addr) {
            tracing::info!(client = %addr, "udp server: client address updated");
        }
    }
}

/// Client -> users.
async fn internal_loop(state: Arc<State>, internal: Arc<UdpSocket>, external: Arc<UdpSocket>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = match internal.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(err = %err, "udp server: internal receive failed");
                continue;
            }
        };
        let frame = match parse_frame(&buf[..n]) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(from = %from, err = %err, "udp server: malformed internal datagram");
                continue;
            }
        };

        let id = frame.session_id;
        match frame.kind {
            FrameType::MaintainUdpClientAddr => state.learn_client_addr(from),
            FrameType::Data => {
                let Some(user) = state.sessions.addr_of(id) else {
                    tracing::warn!(session = id, "udp server: data for unknown session");
                    continue;
                };
                match external.send_to(&frame.payload, user).await {
                    Ok(_) => tracing::debug!(session = id, user = %user, len = frame.payload.len(), "udp server: forwarded to user"),
                    Err(err) => tracing::warn!(session = id, user = %user, err = %err, "udp server: external send failed"),
                }
            }
            other => tracing::warn!(session = id, kind = %other, "udp server: unknown message type"),
        }
    }
}

/// Users -> client.
async fn external_loop(state: Arc<State>, internal: Arc<UdpSocket>, external: Arc<UdpSocket>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, user) = match external.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(err = %err, "udp server: external receive failed");
                continue;
            }
        };

        let (id, created) = state.sessions.id_for(user);
        if created {
            tracing::debug!(session = id, user = %user, "udp server: session created");
        }

        let Some(client) = state.client_addr() else {
            tracing::debug!(session = id, "udp server: no client address yet, dropping");
            continue;
        };
        let frame = match encode_frame(FrameType::Data, id, &buf[..n]) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(session = id, err = %err, "udp server: encode failed");
                continue;
            }
        };
        match internal.send_to(&frame, client).await {
            Ok(_) => tracing::debug!(session = id, len = n, "udp server: forwarded to client"),
            Err(err) => tracing::warn!(session = id, client = %client, err = %err, "udp server: internal send failed"),
        }
    }
}
