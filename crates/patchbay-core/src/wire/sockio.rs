//! Frame transport: sendmsg/recvmsg with ancillary data, plus the
//! EINTR-safe payload loops.
//!
//! Descriptor lists travel as `SCM_RIGHTS` attached to the header frame:
//! plain fds first, then channel pairs in `(data_fd, event_fd)` order.
//! Peer credentials arrive as `SCM_CREDENTIALS` on sockets with
//! `SO_PASSCRED` enabled; the kernel fills them in, so the sender attaches
//! nothing.
//!
//! Close/truncation classification: zero bytes at a frame (or payload)
//! boundary is a clean peer close and surfaces as [`Error::Shutdown`];
//! zero bytes mid-frame is a protocol violation and surfaces as
//! [`Error::Truncated`].

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use bytes::BytesMut;
use nix::errno::Errno;
use nix::sys::socket::{
    recv, recvmsg, send, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};
use tracing::debug;

use super::framing::{
    decode_request, decode_response, encode_request, encode_response, ChannelInfo, Credentials,
    RequestHeader, ResponseHeader, MAX_CHANNEL_COUNT, MAX_FD_COUNT, REQUEST_HEADER_SIZE,
    RESPONSE_HEADER_SIZE,
};
use crate::handle::{AsHandle, BorrowedHandle, LocalHandle};
use crate::status::{Error, Result};

/// Upper bound on fds a single frame can attach (plain + channel pairs).
pub const MAX_MESSAGE_FDS: usize = MAX_FD_COUNT + 2 * MAX_CHANNEL_COUNT;

/// Sends a request frame: header block plus its descriptors.
///
/// Payload bytes (for non-impulse requests with `send_len > 0`) follow via
/// [`send_payload`].
///
/// # Errors
///
/// Fails with [`Error::InvalidArgument`] if any attached handle is empty,
/// [`Error::TooLarge`] on limit violations, or the underlying OS error.
pub fn send_request<H: AsHandle>(sock: BorrowedHandle, header: &RequestHeader<H>) -> Result<()> {
    let mut encoded = BytesMut::with_capacity(REQUEST_HEADER_SIZE);
    encode_request(header, &mut encoded)?;
    let fds = gather_fds(&header.file_descriptors, &header.channels)?;
    send_frame(sock, &encoded, &fds)
}

/// Sends a response frame: header block plus its descriptors.
///
/// # Errors
///
/// Same contract as [`send_request`].
pub fn send_response<H: AsHandle>(sock: BorrowedHandle, header: &ResponseHeader<H>) -> Result<()> {
    let mut encoded = BytesMut::with_capacity(RESPONSE_HEADER_SIZE);
    encode_response(header, &mut encoded)?;
    let fds = gather_fds(&header.file_descriptors, &header.channels)?;
    send_frame(sock, &encoded, &fds)
}

/// Receives one request frame, materialising descriptors and credentials.
///
/// # Errors
///
/// [`Error::Shutdown`] on a clean peer close at the frame boundary;
/// [`Error::Truncated`] on a short block or short ancillary list;
/// [`Error::TooLarge`] on limit violations; otherwise the OS error.
pub fn receive_request(sock: BorrowedHandle) -> Result<RequestHeader<LocalHandle>> {
    let mut block = [0u8; REQUEST_HEADER_SIZE];
    let (fds, cred) = receive_frame(sock, &mut block, "request header")?;
    let parts = decode_request(&block)?;

    let (file_descriptors, channels) =
        split_descriptors(fds, parts.fd_count, parts.channel_count)?;

    Ok(RequestHeader {
        op: parts.op,
        send_len: parts.send_len,
        max_recv_len: parts.max_recv_len,
        is_impulse: parts.is_impulse,
        impulse_payload: parts.impulse_payload,
        cred,
        file_descriptors,
        channels,
    })
}

/// Receives one response frame, materialising descriptors.
///
/// # Errors
///
/// Same contract as [`receive_request`].
pub fn receive_response(sock: BorrowedHandle) -> Result<ResponseHeader<LocalHandle>> {
    let mut block = [0u8; RESPONSE_HEADER_SIZE];
    let (fds, _cred) = receive_frame(sock, &mut block, "response header")?;
    let parts = decode_response(&block)?;

    let (file_descriptors, channels) =
        split_descriptors(fds, parts.fd_count, parts.channel_count)?;

    Ok(ResponseHeader {
        ret_code: parts.ret_code,
        recv_len: parts.recv_len,
        file_descriptors,
        channels,
    })
}

/// Writes an entire payload buffer.
///
/// # Errors
///
/// Returns the underlying OS error; `EINTR` is retried.
pub fn send_payload(sock: BorrowedHandle, data: &[u8]) -> Result<()> {
    let mut written = 0;
    while written < data.len() {
        match send(sock.raw(), &data[written..], MsgFlags::empty()) {
            Ok(count) => written += count,
            Err(Errno::EINTR) => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Fills an entire payload buffer.
///
/// # Errors
///
/// [`Error::Shutdown`] if the peer closed before the first byte,
/// [`Error::Truncated`] if it closed mid-buffer, otherwise the OS error.
pub fn receive_payload(sock: BorrowedHandle, buf: &mut [u8]) -> Result<()> {
    receive_exact(sock, buf, 0, "payload body")
}

fn gather_fds<H: AsHandle>(files: &[H], channels: &[ChannelInfo<H>]) -> Result<Vec<RawFd>> {
    let mut fds = Vec::with_capacity(files.len() + 2 * channels.len());
    for handle in files {
        let handle = handle.as_handle();
        if !handle.is_valid() {
            return Err(Error::InvalidArgument);
        }
        fds.push(handle.raw());
    }
    for info in channels {
        let data_fd = info.data_fd.as_handle();
        let event_fd = info.event_fd.as_handle();
        if !data_fd.is_valid() || !event_fd.is_valid() {
            return Err(Error::InvalidArgument);
        }
        fds.push(data_fd.raw());
        fds.push(event_fd.raw());
    }
    Ok(fds)
}

fn send_frame(sock: BorrowedHandle, block: &[u8], fds: &[RawFd]) -> Result<()> {
    let iov = [IoSlice::new(block)];
    let rights = [ControlMessage::ScmRights(fds)];
    let cmsgs: &[ControlMessage<'_>] = if fds.is_empty() { &[] } else { &rights };

    let sent = loop {
        match sendmsg::<()>(sock.raw(), &iov, cmsgs, MsgFlags::empty(), None) {
            Ok(count) => break count,
            Err(Errno::EINTR) => {}
            Err(err) => return Err(err.into()),
        }
    };

    // A stream socket may accept the block partially; the descriptors went
    // with the first chunk.
    if sent < block.len() {
        send_payload(sock, &block[sent..])?;
    }
    Ok(())
}

fn receive_frame(
    sock: BorrowedHandle,
    block: &mut [u8],
    what: &'static str,
) -> Result<(Vec<OwnedFd>, Option<Credentials>)> {
    let mut cmsg_space = nix::cmsg_space!(libc::ucred, [RawFd; MAX_MESSAGE_FDS]);

    let (bytes_read, fds, cred) = {
        let mut iov = [IoSliceMut::new(block)];
        let msg = loop {
            match recvmsg::<UnixAddr>(
                sock.raw(),
                &mut iov,
                Some(&mut cmsg_space),
                MsgFlags::MSG_CMSG_CLOEXEC,
            ) {
                Ok(msg) => break msg,
                Err(Errno::EINTR) => {}
                Err(err) => return Err(err.into()),
            }
        };

        let mut fds = Vec::new();
        let mut cred = None;
        for cmsg in msg.cmsgs()? {
            match cmsg {
                ControlMessageOwned::ScmRights(received) => {
                    for fd in received {
                        // SAFETY: the kernel just transferred this fd to us
                        // (with CLOEXEC set via MSG_CMSG_CLOEXEC) and it is
                        // recorded nowhere else.
                        fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                    }
                }
                ControlMessageOwned::ScmCredentials(ucred) => {
                    cred = Some(Credentials {
                        pid: ucred.pid(),
                        uid: ucred.uid(),
                        gid: ucred.gid(),
                    });
                }
                other => {
                    debug!(?other, "ignoring unexpected control message");
                }
            }
        }
        (msg.bytes, fds, cred)
    };

    if bytes_read == 0 {
        return Err(Error::Shutdown);
    }
    receive_exact(sock, block, bytes_read, what)?;
    Ok((fds, cred))
}

fn receive_exact(
    sock: BorrowedHandle,
    buf: &mut [u8],
    already_read: usize,
    what: &'static str,
) -> Result<()> {
    let mut read = already_read;
    while read < buf.len() {
        match recv(sock.raw(), &mut buf[read..], MsgFlags::empty()) {
            Ok(0) if read == 0 => return Err(Error::Shutdown),
            Ok(0) => {
                return Err(Error::Truncated {
                    what,
                    got: read,
                    expected: buf.len(),
                });
            }
            Ok(count) => read += count,
            Err(Errno::EINTR) => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn split_descriptors(
    fds: Vec<OwnedFd>,
    fd_count: usize,
    channel_count: usize,
) -> Result<(Vec<LocalHandle>, Vec<ChannelInfo<LocalHandle>>)> {
    let expected = fd_count + 2 * channel_count;
    if fds.len() != expected {
        return Err(Error::Truncated {
            what: "ancillary descriptor block",
            got: fds.len(),
            expected,
        });
    }

    let mut plain = fds;
    let channel_fds = plain.split_off(fd_count);
    let file_descriptors = plain.into_iter().map(LocalHandle::from).collect();

    let mut channels = Vec::with_capacity(channel_count);
    let mut pairs = channel_fds.into_iter();
    while let (Some(data_fd), Some(event_fd)) = (pairs.next(), pairs.next()) {
        channels.push(ChannelInfo {
            data_fd: LocalHandle::from(data_fd),
            event_fd: LocalHandle::from(event_fd),
        });
    }

    Ok((file_descriptors, channels))
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use nix::sys::socket::{setsockopt, socketpair, sockopt, AddressFamily, SockFlag, SockType};
    use nix::sys::stat::fstat;
    use nix::unistd::{getgid, getpid, getuid};

    use super::*;
    use crate::wire::framing::IMPULSE_PAYLOAD_SIZE;

    fn passcred_pair() -> (OwnedFd, OwnedFd) {
        let (server, client) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .expect("socketpair");
        setsockopt(&server, sockopt::PassCred, &true).expect("SO_PASSCRED");
        (server, client)
    }

    #[test]
    fn request_frame_carries_credentials_and_fds() {
        let (server, client) = passcred_pair();
        let dev_null = std::fs::File::open("/dev/null").expect("open /dev/null");

        let header = RequestHeader::<BorrowedHandle> {
            op: 7,
            send_len: 0,
            max_recv_len: 64,
            file_descriptors: vec![BorrowedHandle::from_raw(dev_null.as_raw_fd())],
            ..Default::default()
        };
        send_request(BorrowedHandle::from_raw(client.as_raw_fd()), &header).expect("send");

        let received =
            receive_request(BorrowedHandle::from_raw(server.as_raw_fd())).expect("receive");
        assert_eq!(received.op, 7);
        assert_eq!(received.max_recv_len, 64);
        assert_eq!(received.file_descriptors.len(), 1);
        assert!(received.channels.is_empty());

        // Kernel-filled credentials name this process.
        let cred = received.cred.expect("credentials present with SO_PASSCRED");
        assert_eq!(cred.pid, getpid().as_raw());
        assert_eq!(cred.uid, getuid().as_raw());
        assert_eq!(cred.gid, getgid().as_raw());

        // The transferred descriptor names the same file.
        let original = fstat(dev_null.as_raw_fd()).expect("fstat original");
        let transferred =
            fstat(received.file_descriptors[0].raw()).expect("fstat transferred");
        assert_eq!(original.st_dev, transferred.st_dev);
        assert_eq!(original.st_ino, transferred.st_ino);
    }

    #[test]
    fn impulse_block_survives_the_trip() {
        let (server, client) = passcred_pair();

        let mut impulse_payload = [0u8; IMPULSE_PAYLOAD_SIZE];
        for (index, byte) in impulse_payload.iter_mut().enumerate() {
            *byte = index as u8 + 1;
        }
        let header = RequestHeader::<BorrowedHandle> {
            op: 9,
            send_len: 8,
            is_impulse: true,
            impulse_payload,
            ..Default::default()
        };
        send_request(BorrowedHandle::from_raw(client.as_raw_fd()), &header).expect("send");

        let received =
            receive_request(BorrowedHandle::from_raw(server.as_raw_fd())).expect("receive");
        assert!(received.is_impulse);
        assert_eq!(received.send_len, 8);
        assert_eq!(received.impulse_payload, impulse_payload);
    }

    #[test]
    fn response_frame_round_trips_channel_pair() {
        let (server, client) = passcred_pair();
        let (channel_data, channel_event) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .expect("channel pair");

        let header = ResponseHeader::<BorrowedHandle> {
            ret_code: 0,
            recv_len: 0,
            file_descriptors: Vec::new(),
            channels: vec![ChannelInfo {
                data_fd: BorrowedHandle::from_raw(channel_data.as_raw_fd()),
                event_fd: BorrowedHandle::from_raw(channel_event.as_raw_fd()),
            }],
        };
        send_response(BorrowedHandle::from_raw(server.as_raw_fd()), &header).expect("send");

        let received =
            receive_response(BorrowedHandle::from_raw(client.as_raw_fd())).expect("receive");
        assert_eq!(received.ret_code, 0);
        assert_eq!(received.channels.len(), 1);
        assert!(received.channels[0].data_fd.is_valid());
        assert!(received.channels[0].event_fd.is_valid());
    }

    #[test]
    fn peer_close_at_frame_boundary_is_shutdown() {
        let (server, client) = passcred_pair();
        drop(client);

        let err = receive_request(BorrowedHandle::from_raw(server.as_raw_fd()))
            .expect_err("closed peer");
        assert!(matches!(err, Error::Shutdown));
    }

    #[test]
    fn payload_round_trip_and_truncation() {
        let (server, client) = passcred_pair();

        send_payload(BorrowedHandle::from_raw(client.as_raw_fd()), b"hello").expect("send");
        let mut buf = [0u8; 5];
        receive_payload(BorrowedHandle::from_raw(server.as_raw_fd()), &mut buf).expect("receive");
        assert_eq!(&buf, b"hello");

        // Peer sends a short body then closes: mid-buffer EOF is truncation.
        send_payload(BorrowedHandle::from_raw(client.as_raw_fd()), b"xy").expect("send short");
        drop(client);
        let mut buf = [0u8; 5];
        let err = receive_payload(BorrowedHandle::from_raw(server.as_raw_fd()), &mut buf)
            .expect_err("short body");
        assert!(matches!(
            err,
            Error::Truncated {
                what: "payload body",
                got: 2,
                expected: 5,
            }
        ));
    }

    #[test]
    fn empty_handle_in_outgoing_list_is_rejected() {
        let (_server, client) = passcred_pair();
        let header = RequestHeader::<BorrowedHandle> {
            file_descriptors: vec![BorrowedHandle::invalid()],
            ..Default::default()
        };
        let err = send_request(BorrowedHandle::from_raw(client.as_raw_fd()), &header)
            .expect_err("sentinel fd cannot ride SCM_RIGHTS");
        assert!(matches!(err, Error::InvalidArgument));
    }
}
