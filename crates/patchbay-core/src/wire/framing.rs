//! Header byte layout.
//!
//! Fixed-schema, explicit big-endian encoding. Declared lengths and
//! descriptor counts are validated BEFORE any allocation, so a hostile
//! peer cannot trade a 53-byte header for a 16 MiB buffer:
//!
//! ```text
//! RequestHeader                         ResponseHeader
//! +-----------------------+             +-----------------------+
//! | op             i32    |             | ret_code       i32    |
//! | send_len       u32    |             | recv_len       u32    |
//! | max_recv_len   u32    |             | fd_count       u32    |
//! | is_impulse     u8     |             | channel_count  u32    |
//! | impulse[32]    bytes  |             +-----------------------+
//! | fd_count       u32    |
//! | channel_count  u32    |
//! +-----------------------+
//! ```
//!
//! The descriptor lists themselves ride in ancillary data: first
//! `fd_count` plain fds, then `channel_count` pairs in `(data_fd,
//! event_fd)` order. Peer credentials never appear in the byte block;
//! they come from the kernel via `SCM_CREDENTIALS` and cannot be forged by
//! writing bytes.

use bytes::{Buf, BufMut, BytesMut};

use crate::handle::AsHandle;
use crate::status::{Error, Result};

/// Size of the inline payload block carried by impulse requests.
pub const IMPULSE_PAYLOAD_SIZE: usize = 32;

/// Wire size of the fixed request block.
pub const REQUEST_HEADER_SIZE: usize = 4 + 4 + 4 + 1 + IMPULSE_PAYLOAD_SIZE + 4 + 4;

/// Wire size of the fixed response block.
pub const RESPONSE_HEADER_SIZE: usize = 4 + 4 + 4 + 4;

/// Maximum payload bytes per frame in either direction.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Maximum plain file descriptors per frame.
pub const MAX_FD_COUNT: usize = 16;

/// Maximum channel-info pairs per frame.
pub const MAX_CHANNEL_COUNT: usize = 8;

/// Kernel-supplied peer identity (`SCM_CREDENTIALS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    /// Peer process id.
    pub pid: i32,
    /// Peer effective user id.
    pub uid: u32,
    /// Peer effective group id.
    pub gid: u32,
}

/// A channel travelling inside a message: its data socket plus its event
/// fd.
#[derive(Debug)]
pub struct ChannelInfo<H> {
    /// The channel's stream socket.
    pub data_fd: H,
    /// The channel's event fd.
    pub event_fd: H,
}

/// One request frame, minus its payload bytes.
///
/// `H` is [`LocalHandle`](crate::handle::LocalHandle) on the receive side
/// (descriptors are owned once materialised) and
/// [`BorrowedHandle`](crate::handle::BorrowedHandle) on the send side.
#[derive(Debug)]
pub struct RequestHeader<H> {
    /// Service-defined operation code.
    pub op: i32,
    /// Payload bytes that follow the header (or, for impulses, the live
    /// prefix of `impulse_payload`).
    pub send_len: u32,
    /// Largest reply payload the caller is prepared to receive.
    pub max_recv_len: u32,
    /// One-way request with its payload inline in the header.
    pub is_impulse: bool,
    /// Inline impulse payload block.
    pub impulse_payload: [u8; IMPULSE_PAYLOAD_SIZE],
    /// Peer credentials; present whenever the receiving socket has
    /// `SO_PASSCRED` enabled.
    pub cred: Option<Credentials>,
    /// Plain descriptors attached to the frame.
    pub file_descriptors: Vec<H>,
    /// Channels attached to the frame.
    pub channels: Vec<ChannelInfo<H>>,
}

impl<H> Default for RequestHeader<H> {
    fn default() -> Self {
        Self {
            op: 0,
            send_len: 0,
            max_recv_len: 0,
            is_impulse: false,
            impulse_payload: [0; IMPULSE_PAYLOAD_SIZE],
            cred: None,
            file_descriptors: Vec::new(),
            channels: Vec::new(),
        }
    }
}

/// One response frame, minus its payload bytes.
#[derive(Debug)]
pub struct ResponseHeader<H> {
    /// Service return code, or a descriptor reference for the ops that
    /// reinterpret it.
    pub ret_code: i32,
    /// Payload bytes that follow the header.
    pub recv_len: u32,
    /// Plain descriptors attached to the frame.
    pub file_descriptors: Vec<H>,
    /// Channels attached to the frame.
    pub channels: Vec<ChannelInfo<H>>,
}

impl<H> Default for ResponseHeader<H> {
    fn default() -> Self {
        Self {
            ret_code: 0,
            recv_len: 0,
            file_descriptors: Vec::new(),
            channels: Vec::new(),
        }
    }
}

/// Fixed fields of a decoded request block.
#[derive(Debug, Clone, Copy)]
pub struct RequestParts {
    /// Operation code.
    pub op: i32,
    /// Declared payload length.
    pub send_len: u32,
    /// Declared reply capacity.
    pub max_recv_len: u32,
    /// Impulse flag.
    pub is_impulse: bool,
    /// Inline impulse payload.
    pub impulse_payload: [u8; IMPULSE_PAYLOAD_SIZE],
    /// Declared plain-fd count.
    pub fd_count: usize,
    /// Declared channel-info count.
    pub channel_count: usize,
}

/// Fixed fields of a decoded response block.
#[derive(Debug, Clone, Copy)]
pub struct ResponseParts {
    /// Return code.
    pub ret_code: i32,
    /// Declared payload length.
    pub recv_len: u32,
    /// Declared plain-fd count.
    pub fd_count: usize,
    /// Declared channel-info count.
    pub channel_count: usize,
}

fn check_limits(send_len: usize, fd_count: usize, channel_count: usize) -> Result<()> {
    if send_len > MAX_PAYLOAD_SIZE {
        return Err(Error::TooLarge {
            what: "payload length",
            size: send_len,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    if fd_count > MAX_FD_COUNT {
        return Err(Error::TooLarge {
            what: "descriptor count",
            size: fd_count,
            max: MAX_FD_COUNT,
        });
    }
    if channel_count > MAX_CHANNEL_COUNT {
        return Err(Error::TooLarge {
            what: "channel count",
            size: channel_count,
            max: MAX_CHANNEL_COUNT,
        });
    }
    Ok(())
}

/// Encodes the fixed request block.
///
/// # Errors
///
/// Fails with [`Error::TooLarge`] if the declared payload length or either
/// descriptor list exceeds its protocol limit.
pub fn encode_request<H: AsHandle>(header: &RequestHeader<H>, dst: &mut BytesMut) -> Result<()> {
    check_limits(
        header.send_len as usize,
        header.file_descriptors.len(),
        header.channels.len(),
    )?;

    dst.reserve(REQUEST_HEADER_SIZE);
    dst.put_i32(header.op);
    dst.put_u32(header.send_len);
    dst.put_u32(header.max_recv_len);
    dst.put_u8(u8::from(header.is_impulse));
    dst.put_slice(&header.impulse_payload);
    #[allow(clippy::cast_possible_truncation)] // Validated against MAX_FD_COUNT above
    dst.put_u32(header.file_descriptors.len() as u32);
    #[allow(clippy::cast_possible_truncation)] // Validated against MAX_CHANNEL_COUNT above
    dst.put_u32(header.channels.len() as u32);
    Ok(())
}

/// Decodes the fixed request block, validating limits before the caller
/// allocates anything.
///
/// # Errors
///
/// Fails with [`Error::Truncated`] on a short block and
/// [`Error::TooLarge`] on a limit violation.
pub fn decode_request(src: &[u8]) -> Result<RequestParts> {
    if src.len() < REQUEST_HEADER_SIZE {
        return Err(Error::Truncated {
            what: "request header",
            got: src.len(),
            expected: REQUEST_HEADER_SIZE,
        });
    }

    let mut buf = src;
    let op = buf.get_i32();
    let send_len = buf.get_u32();
    let max_recv_len = buf.get_u32();
    let is_impulse = buf.get_u8() != 0;
    let mut impulse_payload = [0u8; IMPULSE_PAYLOAD_SIZE];
    buf.copy_to_slice(&mut impulse_payload);
    let fd_count = buf.get_u32() as usize;
    let channel_count = buf.get_u32() as usize;

    check_limits(send_len as usize, fd_count, channel_count)?;

    Ok(RequestParts {
        op,
        send_len,
        max_recv_len,
        is_impulse,
        impulse_payload,
        fd_count,
        channel_count,
    })
}

/// Encodes the fixed response block.
///
/// # Errors
///
/// Fails with [`Error::TooLarge`] if the payload length or either
/// descriptor list exceeds its protocol limit.
pub fn encode_response<H: AsHandle>(header: &ResponseHeader<H>, dst: &mut BytesMut) -> Result<()> {
    check_limits(
        header.recv_len as usize,
        header.file_descriptors.len(),
        header.channels.len(),
    )?;

    dst.reserve(RESPONSE_HEADER_SIZE);
    dst.put_i32(header.ret_code);
    dst.put_u32(header.recv_len);
    #[allow(clippy::cast_possible_truncation)] // Validated against MAX_FD_COUNT above
    dst.put_u32(header.file_descriptors.len() as u32);
    #[allow(clippy::cast_possible_truncation)] // Validated against MAX_CHANNEL_COUNT above
    dst.put_u32(header.channels.len() as u32);
    Ok(())
}

/// Decodes the fixed response block.
///
/// # Errors
///
/// Fails with [`Error::Truncated`] on a short block and
/// [`Error::TooLarge`] on a limit violation.
pub fn decode_response(src: &[u8]) -> Result<ResponseParts> {
    if src.len() < RESPONSE_HEADER_SIZE {
        return Err(Error::Truncated {
            what: "response header",
            got: src.len(),
            expected: RESPONSE_HEADER_SIZE,
        });
    }

    let mut buf = src;
    let ret_code = buf.get_i32();
    let recv_len = buf.get_u32();
    let fd_count = buf.get_u32() as usize;
    let channel_count = buf.get_u32() as usize;

    check_limits(recv_len as usize, fd_count, channel_count)?;

    Ok(ResponseParts {
        ret_code,
        recv_len,
        fd_count,
        channel_count,
    })
}
