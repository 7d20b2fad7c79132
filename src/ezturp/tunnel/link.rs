use std::net::SocketAddr;

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};

use crate::ezturp::tunnel::protocol::{self, FrameType, ProtocolError};

/// Write side of an internal link.
///
/// All sessions share one link, so writes are serialized here: each frame goes out whole
/// and frames of one session keep the order in which their pump produced them.
#[derive(Debug)]
pub struct InternalLink<W> {
    writer: Mutex<W>,
    peer: SocketAddr,
}

impl<W> InternalLink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W, peer: SocketAddr) -> Self {
        Self {
            writer: Mutex::new(writer),
            peer,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(
        &self,
        kind: FrameType,
        session_id: u32,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        let mut w = self.writer.lock().await;
        protocol::write_frame(&mut *w, kind, session_id, payload).await
    }

    pub async fn send_control(&self, kind: FrameType, session_id: u32) -> Result<(), ProtocolError> {
        self.send(kind, session_id, &[]).await
    }

    /// Shuts the write direction down; later sends fail.
    pub async fn close(&self) {
        let mut w = self.writer.lock().await;
        let _ = w.shutdown().await;
    }
}
