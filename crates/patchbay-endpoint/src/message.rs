//! One in-flight request and its scratch state.
//!
//! A [`Message`] is handed out by
//! [`Endpoint::message_receive`](crate::Endpoint::message_receive) and owns
//! everything about one request: the captured header (with its
//! materialised descriptors), the payload cursor, and the response under
//! construction. Completing the message (replying, or finishing a
//! synthesised close) consumes it; the one-shot readiness discipline
//! guarantees no second message exists for the same channel in the
//! meantime, so nothing here locks.

use std::io::{IoSlice, IoSliceMut};
use std::sync::Arc;

use patchbay_core::wire::framing::{ChannelInfo, RequestHeader, ResponseHeader};
use patchbay_core::{
    BorrowedChannelHandle, BorrowedHandle, ChannelReference, ChannelRegistry, Error,
    FileReference, LocalChannelHandle, LocalHandle, RemoteChannelHandle, RemoteHandle, Result,
    IMPULSE_PAYLOAD_SIZE,
};

use crate::endpoint::Endpoint;
use crate::service::{Channel, Service};

/// Sentinel message id carried by impulses, which have no reply to match.
pub const IMPULSE_MESSAGE_ID: i32 = -1;

/// Header facts about one received request.
#[derive(Clone)]
pub struct MessageInfo {
    /// Sender process id (`-1` on synthesised messages).
    pub pid: i32,
    /// Sender thread id (unknown over UDS, always `-1`).
    pub tid: i32,
    /// Channel the request arrived on.
    pub cid: i32,
    /// Message id: monotone per endpoint, or [`IMPULSE_MESSAGE_ID`].
    pub mid: i32,
    /// Sender effective uid (`-1` on synthesised messages).
    pub euid: i32,
    /// Sender effective gid (`-1` on synthesised messages).
    pub egid: i32,
    /// Operation code.
    pub op: i32,
    /// Reserved flag bits.
    pub flags: u32,
    /// The service registered on the endpoint at receive time.
    pub service: Option<Arc<dyn Service>>,
    /// The channel context registered at receive time.
    pub channel: Option<Arc<dyn Channel>>,
    /// Request payload length.
    pub send_len: usize,
    /// Reply capacity declared by the sender.
    pub recv_len: usize,
    /// Number of plain descriptors attached to the request.
    pub fd_count: usize,
    /// Inline impulse payload block.
    pub impulse: [u8; IMPULSE_PAYLOAD_SIZE],
}

impl std::fmt::Debug for MessageInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageInfo")
            .field("pid", &self.pid)
            .field("cid", &self.cid)
            .field("mid", &self.mid)
            .field("op", &self.op)
            .field("send_len", &self.send_len)
            .field("recv_len", &self.recv_len)
            .field("fd_count", &self.fd_count)
            .finish_non_exhaustive()
    }
}

/// Per-message scratch: captured request, pending response, and the
/// sockets that must stay open until the reply has been transmitted.
#[derive(Default)]
pub(crate) struct MessageState {
    pub(crate) request: RequestHeader<LocalHandle>,
    pub(crate) request_data: Vec<u8>,
    pub(crate) read_pos: usize,
    pub(crate) response: ResponseHeader<BorrowedHandle>,
    pub(crate) response_data: Vec<u8>,
    /// Locally-owned halves of pushed socket pairs. The kernel duplicates
    /// an fd at `sendmsg` time, so these must survive until the reply is
    /// on the wire.
    pub(crate) sockets_to_close: Vec<LocalHandle>,
}

impl MessageState {
    pub(crate) fn new(request: RequestHeader<LocalHandle>) -> Self {
        Self {
            request,
            ..Self::default()
        }
    }

    pub(crate) fn read_data(&mut self, vectors: &mut [IoSliceMut<'_>]) -> usize {
        let mut copied = 0;
        for vector in vectors {
            let remaining = self.request_data.len() - self.read_pos;
            if remaining == 0 {
                break;
            }
            let count = remaining.min(vector.len());
            vector[..count]
                .copy_from_slice(&self.request_data[self.read_pos..self.read_pos + count]);
            self.read_pos += count;
            copied += count;
        }
        copied
    }

    pub(crate) fn write_data(&mut self, vectors: &[IoSlice<'_>]) -> usize {
        let mut appended = 0;
        for vector in vectors {
            self.response_data.extend_from_slice(vector);
            appended += vector.len();
        }
        appended
    }

    #[allow(clippy::cast_sign_loss)] // negative references returned above
    pub(crate) fn get_local_file_handle(&mut self, reference: FileReference) -> Result<LocalHandle> {
        if reference < 0 {
            return Ok(LocalHandle::sentinel(reference));
        }
        let handle = self
            .request
            .file_descriptors
            .get_mut(reference as usize)
            .ok_or(Error::InvalidArgument)?;
        Ok(handle.take())
    }

    #[allow(clippy::cast_sign_loss)] // negative references returned above
    pub(crate) fn get_local_channel_handle(
        &mut self,
        registry: &Arc<dyn ChannelRegistry>,
        reference: ChannelReference,
    ) -> Result<LocalChannelHandle> {
        if reference < 0 {
            return Ok(LocalChannelHandle::sentinel(reference));
        }
        let info = self
            .request
            .channels
            .get_mut(reference as usize)
            .ok_or(Error::InvalidArgument)?;
        let data_fd = info.data_fd.take();
        let event_fd = info.event_fd.take();
        Ok(Arc::clone(registry).create_handle(data_fd, event_fd))
    }

    pub(crate) fn push_file_handle(&mut self, handle: BorrowedHandle) -> Result<FileReference> {
        if !handle.is_valid() {
            // An empty handle is not an error: its sentinel value rides
            // the header unchanged.
            return Ok(handle.raw());
        }
        self.response.file_descriptors.push(handle);
        #[allow(clippy::cast_possible_truncation)] // Bounded by MAX_FD_COUNT at encode time
        let reference = (self.response.file_descriptors.len() - 1) as FileReference;
        Ok(reference)
    }

    pub(crate) fn push_channel_handle(
        &mut self,
        registry: &Arc<dyn ChannelRegistry>,
        handle: BorrowedChannelHandle,
    ) -> Result<ChannelReference> {
        if !handle.is_valid() {
            return Ok(handle.value());
        }
        let event_fd = registry
            .event_fd(handle.value())
            .ok_or(Error::InvalidArgument)?;
        self.push_channel_pair(BorrowedHandle::from_raw(handle.value()), event_fd)
    }

    pub(crate) fn push_channel_pair(
        &mut self,
        data_fd: BorrowedHandle,
        event_fd: BorrowedHandle,
    ) -> Result<ChannelReference> {
        if !data_fd.is_valid() || !event_fd.is_valid() {
            return Err(Error::InvalidArgument);
        }
        self.response.channels.push(ChannelInfo { data_fd, event_fd });
        #[allow(clippy::cast_possible_truncation)] // Bounded by MAX_CHANNEL_COUNT at encode time
        let reference = (self.response.channels.len() - 1) as ChannelReference;
        Ok(reference)
    }
}

/// One in-flight request, from receive to reply.
pub struct Message {
    endpoint: Arc<Endpoint>,
    info: MessageInfo,
    state: MessageState,
}

impl Message {
    pub(crate) fn new(endpoint: Arc<Endpoint>, info: MessageInfo, state: MessageState) -> Self {
        Self {
            endpoint,
            info,
            state,
        }
    }

    pub(crate) fn state_mut(&mut self) -> &mut MessageState {
        &mut self.state
    }

    /// Header facts about this request.
    #[must_use]
    pub const fn info(&self) -> &MessageInfo {
        &self.info
    }

    /// Operation code.
    #[must_use]
    pub const fn op(&self) -> i32 {
        self.info.op
    }

    /// Channel the request arrived on.
    #[must_use]
    pub const fn channel_id(&self) -> i32 {
        self.info.cid
    }

    /// Message id ([`IMPULSE_MESSAGE_ID`] for impulses).
    #[must_use]
    pub const fn message_id(&self) -> i32 {
        self.info.mid
    }

    /// Whether this is a one-way impulse.
    #[must_use]
    pub const fn is_impulse(&self) -> bool {
        self.info.mid == IMPULSE_MESSAGE_ID
    }

    /// Request payload length.
    #[must_use]
    pub const fn send_length(&self) -> usize {
        self.info.send_len
    }

    /// Reply capacity declared by the sender.
    #[must_use]
    pub const fn receive_length(&self) -> usize {
        self.info.recv_len
    }

    /// The live prefix of the inline impulse block.
    #[must_use]
    pub fn impulse_data(&self) -> &[u8] {
        let len = self.info.send_len.min(IMPULSE_PAYLOAD_SIZE);
        &self.info.impulse[..len]
    }

    /// The channel context registered when the request was received.
    #[must_use]
    pub fn channel_state(&self) -> Option<Arc<dyn Channel>> {
        self.info.channel.clone()
    }

    /// Registers (or clears) the channel context for this message's
    /// channel.
    ///
    /// # Errors
    ///
    /// Fails with `EINVAL` if the channel is gone.
    pub fn set_channel(&self, channel: Option<&Arc<dyn Channel>>) -> Result<()> {
        self.endpoint.set_channel(self.info.cid, channel)
    }

    /// Copies request payload into `vectors`, advancing the read cursor.
    /// Returns the bytes copied; zero at end of payload.
    pub fn read_vectored(&mut self, vectors: &mut [IoSliceMut<'_>]) -> usize {
        self.state.read_data(vectors)
    }

    /// Single-buffer form of [`read_vectored`](Self::read_vectored).
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        self.state.read_data(&mut [IoSliceMut::new(buf)])
    }

    /// Appends `vectors` to the response payload. Returns the bytes
    /// appended.
    pub fn write_vectored(&mut self, vectors: &[IoSlice<'_>]) -> usize {
        self.state.write_data(vectors)
    }

    /// Single-buffer form of [`write_vectored`](Self::write_vectored).
    pub fn write(&mut self, buf: &[u8]) -> usize {
        self.state.write_data(&[IoSlice::new(buf)])
    }

    /// Takes ownership of a received file descriptor by reference.
    ///
    /// Negative references come back as empty pass-through handles; a
    /// reference already consumed returns an empty handle too.
    ///
    /// # Errors
    ///
    /// Fails with `EINVAL` on an out-of-range reference.
    pub fn get_file_handle(&mut self, reference: FileReference) -> Result<LocalHandle> {
        self.state.get_local_file_handle(reference)
    }

    /// Takes ownership of a received channel by reference, registering it
    /// with the endpoint's channel registry.
    ///
    /// # Errors
    ///
    /// Fails with `EINVAL` on an out-of-range reference.
    pub fn get_channel_handle(&mut self, reference: ChannelReference) -> Result<LocalChannelHandle> {
        let registry = self.endpoint.registry();
        self.state.get_local_channel_handle(&registry, reference)
    }

    /// Appends an owned fd to the outgoing descriptor list.
    ///
    /// Empty handles pass their sentinel value through unchanged. The
    /// handle must outlive the reply.
    ///
    /// # Errors
    ///
    /// Currently infallible for valid handles; kept fallible for parity
    /// with the other push operations.
    pub fn push_file_handle(&mut self, handle: &LocalHandle) -> Result<FileReference> {
        self.state.push_file_handle(handle.borrow())
    }

    /// Appends a borrowed fd to the outgoing descriptor list.
    ///
    /// # Errors
    ///
    /// Same contract as [`push_file_handle`](Self::push_file_handle).
    pub fn push_file_handle_borrowed(&mut self, handle: BorrowedHandle) -> Result<FileReference> {
        self.state.push_file_handle(handle)
    }

    /// A remote fd reference needs no transport; its value is returned
    /// unchanged.
    #[must_use]
    pub const fn push_file_handle_remote(&self, handle: &RemoteHandle) -> FileReference {
        handle.value()
    }

    /// Appends a client-side channel to the outgoing channel list.
    ///
    /// # Errors
    ///
    /// Fails with `EINVAL` if the channel is not registered.
    pub fn push_channel_handle(&mut self, handle: &LocalChannelHandle) -> Result<ChannelReference> {
        let registry = self.endpoint.registry();
        self.state.push_channel_handle(&registry, handle.borrow())
    }

    /// Borrowed-handle form of
    /// [`push_channel_handle`](Self::push_channel_handle).
    ///
    /// # Errors
    ///
    /// Fails with `EINVAL` if the channel is not registered.
    pub fn push_channel_handle_borrowed(
        &mut self,
        handle: BorrowedChannelHandle,
    ) -> Result<ChannelReference> {
        let registry = self.endpoint.registry();
        self.state.push_channel_handle(&registry, handle)
    }

    /// A remote channel reference needs no transport; its value is
    /// returned unchanged.
    #[must_use]
    pub const fn push_channel_handle_remote(&self, handle: RemoteChannelHandle) -> ChannelReference {
        handle.value()
    }

    /// Appends a raw `(data_fd, event_fd)` pair to the outgoing channel
    /// list.
    ///
    /// # Errors
    ///
    /// Fails with `EINVAL` if either borrow is empty.
    pub fn push_channel_pair(
        &mut self,
        data_fd: BorrowedHandle,
        event_fd: BorrowedHandle,
    ) -> Result<ChannelReference> {
        self.state.push_channel_pair(data_fd, event_fd)
    }

    /// Creates a fresh channel on this endpoint and embeds its client half
    /// in the reply. See [`Endpoint::push_channel`](crate::Endpoint::push_channel).
    ///
    /// # Errors
    ///
    /// Propagates socketpair/registration failures.
    pub fn push_channel(
        &mut self,
        flags: i32,
        channel: Option<&Arc<dyn Channel>>,
    ) -> Result<(RemoteChannelHandle, i32)> {
        let endpoint = Arc::clone(&self.endpoint);
        endpoint.push_channel(self, flags, channel)
    }

    /// Sends the reply and completes this message.
    ///
    /// # Errors
    ///
    /// Fails with `EBADF` if the channel has been closed, otherwise
    /// propagates wire errors. See
    /// [`Endpoint::message_reply`](crate::Endpoint::message_reply) for the
    /// `CHANNEL_OPEN`/`CHANNEL_CLOSE` special cases.
    pub fn reply(self, return_code: i32) -> Result<()> {
        let endpoint = Arc::clone(&self.endpoint);
        endpoint.message_reply(self, return_code)
    }

    /// Pushes `handle` and replies with its file reference as the return
    /// code.
    ///
    /// # Errors
    ///
    /// Same contract as [`reply`](Self::reply).
    pub fn reply_fd(mut self, handle: BorrowedHandle) -> Result<()> {
        let reference = self.state.push_file_handle(handle)?;
        self.reply(reference)
    }

    /// Pushes a client-side channel and replies with its channel reference
    /// as the return code.
    ///
    /// # Errors
    ///
    /// Same contract as [`reply`](Self::reply), plus `EINVAL` for an
    /// unregistered channel.
    pub fn reply_channel_handle(mut self, handle: &LocalChannelHandle) -> Result<()> {
        let registry = self.endpoint.registry();
        let reference = self.state.push_channel_handle(&registry, handle.borrow())?;
        self.reply(reference)
    }

    /// Borrowed-handle form of
    /// [`reply_channel_handle`](Self::reply_channel_handle).
    ///
    /// # Errors
    ///
    /// Same contract as [`reply_channel_handle`](Self::reply_channel_handle).
    pub fn reply_channel_handle_borrowed(mut self, handle: BorrowedChannelHandle) -> Result<()> {
        let registry = self.endpoint.registry();
        let reference = self.state.push_channel_handle(&registry, handle)?;
        self.reply(reference)
    }

    /// Replies with a remote channel reference as the return code; nothing
    /// travels in the descriptor lists.
    ///
    /// # Errors
    ///
    /// Same contract as [`reply`](Self::reply).
    pub fn reply_channel_handle_remote(self, handle: RemoteChannelHandle) -> Result<()> {
        self.reply(handle.value())
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message").field("info", &self.info).finish_non_exhaustive()
    }
}
