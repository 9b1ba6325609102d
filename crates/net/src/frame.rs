//! Length-prefixed message framing.
//!
//! Every message on a shard connection is one frame:
//!
//! ```text
//! [type: u8][length: u64 BE][payload: length bytes]
//! ```
//!
//! The payload is a protobuf-encoded message from [`crate::wire`].

use crate::TransportError;
use bytes::{BufMut, BytesMut};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted payload (1 GiB).
pub const MAX_FRAME_SIZE: u64 = 1 << 30;

/// Type byte plus length.
pub const HEADER_SIZE: usize = 1 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    WriteShardRequest = 1,
    WriteShardResponse = 2,
    MapShardRequest = 3,
    MapShardResponse = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = TransportError;

    fn try_from(v: u8) -> Result<Self, TransportError> {
        match v {
            1 => Ok(MessageType::WriteShardRequest),
            2 => Ok(MessageType::WriteShardResponse),
            3 => Ok(MessageType::MapShardRequest),
            4 => Ok(MessageType::MapShardResponse),
            _ => Err(TransportError::UnknownMessageType(v)),
        }
    }
}

/// A raw frame as read off the wire. The type byte is kept unparsed so
/// callers decide how to treat unknown types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u8,
    pub payload: Vec<u8>,
}

pub async fn write_frame<W>(
    writer: &mut W,
    msg_type: MessageType,
    payload: &[u8],
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let len = payload.len() as u64;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u8(msg_type as u8);
    buf.put_u64(len);
    buf.put_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `None` on a clean EOF before the header.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let msg_type = match reader.read_u8().await {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let len = reader.read_u64().await?;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Frame { msg_type, payload }))
}

pub async fn write_message<W, M>(
    writer: &mut W,
    msg_type: MessageType,
    msg: &M,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    M: Message,
{
    write_frame(writer, msg_type, &msg.encode_to_vec()).await
}

/// Read one frame and decode it as `M`, which must arrive as `expected`.
pub async fn read_message<R, M>(reader: &mut R, expected: MessageType) -> Result<M, TransportError>
where
    R: AsyncRead + Unpin,
    M: Message + Default,
{
    let frame = read_frame(reader).await?.ok_or(TransportError::Closed)?;
    if frame.msg_type != expected as u8 {
        return Err(TransportError::UnexpectedMessageType {
            expected: expected as u8,
            got: frame.msg_type,
        });
    }
    Ok(M::decode(frame.payload.as_slice())?)
}
