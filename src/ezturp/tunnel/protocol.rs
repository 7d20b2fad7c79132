use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Every frame starts with this literal.
pub const MAGIC: &[u8; 3] = b"yxh";

/// magic(3) + type(1) + session id(4) + payload length(4)
pub const HEADER_LEN: usize = 12;

/// Upper bound on a declared payload length accepted from a stream.
pub const MAX_FRAME_PAYLOAD: u32 = 16 << 20; // 16 MiB

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic {0:?}")]
    BadMagic([u8; 3]),
    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("payload too large: {0}")]
    PayloadTooLarge(usize),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    NewSession,
    RemoveSession,
    Data,
    KeepAlive,
    MaintainUdpClientAddr,
    /// A type byte this build does not know. Kept so each role can apply its own policy.
    Unknown(u8),
}

impl FrameType {
    pub fn as_u8(self) -> u8 {
        match self {
            FrameType::NewSession => 0,
            FrameType::RemoveSession => 1,
            FrameType::Data => 2,
            FrameType::KeepAlive => 3,
            FrameType::MaintainUdpClientAddr => 4,
            FrameType::Unknown(b) => b,
        }
    }
}

impl From<u8> for FrameType {
    fn from(b: u8) -> Self {
        match b {
            0 => FrameType::NewSession,
            1 => FrameType::RemoveSession,
            2 => FrameType::Data,
            3 => FrameType::KeepAlive,
            4 => FrameType::MaintainUdpClientAddr,
            other => FrameType::Unknown(other),
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameType::NewSession => write!(f, "NEW_SESSION"),
            FrameType::RemoveSession => write!(f, "REMOVE_SESSION"),
            FrameType::Data => write!(f, "DATA"),
            FrameType::KeepAlive => write!(f, "KEEP_ALIVE"),
            FrameType::MaintainUdpClientAddr => write!(f, "MAINTAIN_UDP_CLIENT_ADDR"),
            FrameType::Unknown(b) => write!(f, "UNKNOWN({b})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameType,
    pub session_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameType, session_id: u32, payload: Bytes) -> Self {
        Self {
            kind,
            session_id,
            payload,
        }
    }
}

#[cfg(test)]
impl Frame {
    /// A frame with an empty payload (all control frames).
    pub fn control(kind: FrameType, session_id: u32) -> Self {
        Self::new(kind, session_id, Bytes::new())
    }

    pub fn data(session_id: u32, payload: &[u8]) -> Self {
        Self::new(FrameType::Data, session_id, Bytes::copy_from_slice(payload))
    }
}

pub fn encode_frame(kind: FrameType, session_id: u32, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let n: u32 = payload
        .len()
        .try_into()
        .map_err(|_| ProtocolError::PayloadTooLarge(payload.len()))?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(MAGIC);
    buf.put_u8(kind.as_u8());
    buf.put_u32(session_id);
    buf.put_u32(n);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Encodes the frame and hands it to the sink in a single write.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    kind: FrameType,
    session_id: u32,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    let b = encode_frame(kind, session_id, payload)?;
    w.write_all(&b).await?;
    Ok(())
}

/// Reads exactly one frame. `read_exact` loops over short reads, so a transport that hands
/// back partial chunks is fine.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame, ProtocolError> {
    let mut magic = [0u8; 3];
    r.read_exact(&mut magic).await?;
    if &magic != MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }

    let kind = FrameType::from(r.read_u8().await?);
    let session_id = r.read_u32().await?;
    let n = r.read_u32().await?;
    if n > MAX_FRAME_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(n as usize));
    }

    let mut payload = vec![0u8; n as usize];
    r.read_exact(&mut payload).await?;
    Ok(Frame::new(kind, session_id, Bytes::from(payload)))
}

/// Parses one frame out of an already received buffer (one datagram = one frame).
/// Bytes past the declared payload are ignored.
pub fn parse_frame(p: &[u8]) -> Result<Frame, ProtocolError> {
    if p.len() < HEADER_LEN {
        return Err(ProtocolError::Truncated {
            need: HEADER_LEN,
            have: p.len(),
        });
    }

    let magic = [p[0], p[1], p[2]];
    if &magic != MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }

    let kind = FrameType::from(p[3]);
    let session_id = u32::from_be_bytes([p[4], p[5], p[6], p[7]]);
    let n = u32::from_be_bytes([p[8], p[9], p[10], p[11]]) as usize;

    let need = HEADER_LEN.saturating_add(n);
    if p.len() < need {
        return Err(ProtocolError::Truncated {
            need,
            have: p.len(),
        });
    }

    Ok(Frame::new(
        kind,
        session_id,
        Bytes::copy_from_slice(&p[HEADER_LEN..need]),
    ))
}
