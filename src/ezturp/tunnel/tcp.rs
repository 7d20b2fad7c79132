use std::{net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, watch},
};

pub mod client;
pub mod server;

/// One multiplexed TCP flow: the external connection on the server, the local connection on
/// the client.
///
/// The registry and transient lookups hold `Arc` handles to the write side; the read side is
/// owned by the session's pump. The socket closes once the pump has stopped and the last
/// handle is dropped.
#[derive(Debug)]
pub struct TcpSession {
    writer: Mutex<OwnedWriteHalf>,
    peer: Option<SocketAddr>,
    closed: watch::Sender<bool>,
}

/// Read side of a [`TcpSession`], driven by its pump task.
#[derive(Debug)]
pub struct SessionReader {
    rd: OwnedReadHalf,
    closed: watch::Receiver<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpRead {
    Data(usize),
    /// The socket reached EOF or failed.
    Eof,
    /// The session was closed through [`TcpSession::close`].
    Closed,
}

impl TcpSession {
    pub fn open(stream: TcpStream) -> (Arc<Self>, SessionReader) {
        let peer = stream.peer_addr().ok();
        let (rd, wr) = stream.into_split();
        let (tx, rx) = watch::channel(false);
        let session = Arc::new(Self {
            writer: Mutex::new(wr),
            peer,
            closed: tx,
        });
        (session, SessionReader { rd, closed: rx })
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub async fn write(&self, payload: &[u8]) -> std::io::Result<()> {
        let mut w = self.writer.lock().await;
        w.write_all(payload).await
    }

    /// Stops the pump. Idempotent.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }
}

impl SessionReader {
    pub async fn read(&mut self, buf: &mut [u8]) -> PumpRead {
        if *self.closed.borrow() {
            return PumpRead::Closed;
        }
        tokio::select! {
            _ = self.closed.changed() => PumpRead::Closed,
            res = self.rd.read(buf) => match res {
                Ok(0) | Err(_) => PumpRead::Eof,
                Ok(n) => PumpRead::Data(n),
            },
        }
    }
}
