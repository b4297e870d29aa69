//! Plugin-wire framing: length-prefix (4 bytes LE) + bincode payload.
//!
//! Used on the host/plugin boundary, where envelopes cross as opaque byte
//! buffers through the `on_write`/`on_read` function pointers.

use serde::{Deserialize, Serialize};

use crate::protocol::{LinkState, NoticeEnvelope, RequestEnvelope, ResponseEnvelope};

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Everything that crosses the plugin boundary, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
    Notice(NoticeEnvelope),
    RetainNotice(NoticeEnvelope),
    State(LinkState),
}

/// Encode a frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(frame).map_err(FrameEncodeError::Encode)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the frame and the
/// number of bytes consumed. `NeedMore` means the buffer holds a partial
/// frame; the caller should retry after more data arrives.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let frame: Frame =
        bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(FrameDecodeError::Decode)?;
    Ok((frame, LEN_SIZE + len))
}

/// Error decoding a frame (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
