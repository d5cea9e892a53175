use crate::{
    tags::Tag,
    transport::{Source, Transport, TransportError},
};
use thiserror::Error;
use tracing::trace;

/// upper bound on a framed payload unless the caller configures their own
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("transport failed while framing")]
    Transport(#[from] TransportError),
    #[error("frame declared {declared} bytes but {received} arrived")]
    Truncated { declared: i64, received: usize },
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
}

/// Send a variable-length byte string to `dest` under a logical tag.
///
/// Two messages go out: the length as a single integer on
/// [`Tag::MessageLength`], then the payload bytes on `tag`. A zero-length
/// payload sends only the length message; the receiving side skips the
/// payload receive symmetrically, so neither end blocks on an empty frame.
pub fn send_frame<T: Transport>(
    transport: &mut T,
    dest: usize,
    tag: Tag,
    bytes: &[u8],
) -> Result<(), FrameError> {
    let length = i32::try_from(bytes.len()).map_err(|_| FrameError::TooLarge {
        len: bytes.len(),
        max: i32::MAX as usize,
    })?;

    transport.send_ints(&[length], dest, Tag::MessageLength.into())?;
    if !bytes.is_empty() {
        transport.send_bytes(bytes, dest, tag.into())?;
    }

    trace!(dest, tag = ?tag, length, "frame sent");
    Ok(())
}

/// Receive one frame under `tag`, returning the payload and the sender rank.
///
/// `source` may be [`Source::Any`]; the payload receive is then pinned to
/// whichever rank the length probe resolved, so a frame is never assembled
/// from two senders.
pub fn recv_frame<T: Transport>(
    transport: &mut T,
    source: Source,
    tag: Tag,
    max_len: usize,
) -> Result<(Vec<u8>, usize), FrameError> {
    let mut length = [0i32; 1];
    let probe = transport.recv_ints(&mut length, source, Tag::MessageLength.into())?;

    let declared = length[0];
    if declared < 0 {
        return Err(FrameError::Truncated {
            declared: declared as i64,
            received: 0,
        });
    }
    let declared = declared as usize;
    if declared > max_len {
        return Err(FrameError::TooLarge {
            len: declared,
            max: max_len,
        });
    }
    if declared == 0 {
        trace!(source = probe.source, tag = ?tag, "empty frame received");
        return Ok((Vec::new(), probe.source));
    }

    let mut payload = vec![0u8; declared];
    let data = transport.recv_bytes(&mut payload, Source::Rank(probe.source), tag.into())?;
    if data.count < declared {
        return Err(FrameError::Truncated {
            declared: declared as i64,
            received: data.count,
        });
    }

    trace!(source = probe.source, tag = ?tag, declared, "frame received");
    Ok((payload, probe.source))
}
