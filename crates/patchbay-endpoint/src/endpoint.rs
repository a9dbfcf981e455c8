//! The server-side endpoint: channel table, readiness multiplexer,
//! dispatch loop, and reply path.
//!
//! # Architecture
//!
//! ```text
//! clients ──connect──▶ listening socket ─┐
//! client A ──frames──▶ channel fd A ─────┤   one-shot     ┌─ dispatcher
//! client B ──frames──▶ channel fd B ─────┼──▶ epoll ──────┼─ dispatcher
//! cancel() ──────────▶ cancel eventfd ───┘   (1 event     └─ dispatcher
//!                                             per call)       threads
//! ```
//!
//! The readiness set doubles as the per-channel lock: every channel fd is
//! registered `EPOLLONESHOT`, so once an event for it has been delivered
//! to one dispatcher thread, no further event fires until the fd is
//! explicitly rearmed. Rearming happens in exactly two places: the reply
//! path, and the receive path for impulses (which have no reply). That
//! discipline serialises message handling per channel across any number of
//! dispatcher threads and keeps per-message state lock-free.
//!
//! The channel table, the fd-to-id map, and the id counter share one
//! mutex. Its critical sections do no I/O.

use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::sys::socket::{
    accept4, bind, listen, setsockopt, socket, socketpair, sockopt, AddressFamily, Backlog,
    SockFlag, SockType, UnixAddr,
};
use tracing::{debug, error};

use patchbay_core::wire::sockio;
use patchbay_core::{
    BorrowedHandle, ChannelManager, ChannelReference, ChannelRegistry, Error, EventSet,
    LocalHandle, RemoteChannelHandle, Result, MAX_PAYLOAD_SIZE,
};

use crate::config::{EndpointConfig, INIT_SOCKET_ENV_PREFIX, INIT_SOCKET_PREFIX};
use crate::message::{Message, MessageInfo, MessageState, IMPULSE_MESSAGE_ID};
use crate::service::{opcodes, Channel, Service};

const LISTEN_BACKLOG: i32 = 1;

/// Per-channel server state: the stream socket, the event set, and the
/// service's context borrow.
struct ChannelData {
    data_fd: OwnedFd,
    event_set: EventSet,
    channel_state: Option<Weak<dyn Channel>>,
}

/// Channel bookkeeping behind the endpoint mutex.
struct ChannelTable {
    channels: HashMap<i32, ChannelData>,
    fd_to_id: HashMap<RawFd, i32>,
    last_channel_id: i32,
}

impl ChannelTable {
    fn new() -> Self {
        Self {
            channels: HashMap::new(),
            fd_to_id: HashMap::new(),
            last_channel_id: 0,
        }
    }

    /// Next free channel id: increment, wrap `i32::MAX` back to 1, probe
    /// against live ids. Never returns 0.
    fn allocate_id(&mut self) -> i32 {
        loop {
            if self.last_channel_id == i32::MAX {
                self.last_channel_id = 1;
            } else {
                self.last_channel_id += 1;
            }
            if !self.channels.contains_key(&self.last_channel_id) {
                return self.last_channel_id;
            }
        }
    }
}

/// Server-side endpoint of a patchbay service.
///
/// Multiplexes any number of client channels over one listening socket.
/// Dispatcher threads call [`message_receive`](Self::message_receive)
/// concurrently; see the module docs for the serialisation discipline.
pub struct Endpoint {
    path: String,
    unlink_on_drop: bool,
    socket_fd: OwnedFd,
    cancel_event_fd: EventFd,
    epoll: Epoll,
    is_blocking: bool,
    registry: Arc<dyn ChannelRegistry>,
    service: Mutex<Option<Weak<dyn Service>>>,
    table: Mutex<ChannelTable>,
    next_message_id: AtomicI32,
}

#[allow(clippy::cast_sign_loss)] // fds are non-negative
fn oneshot_event(fd: RawFd) -> EpollEvent {
    EpollEvent::new(
        EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP | EpollFlags::EPOLLONESHOT,
        fd as u64,
    )
}

/// Looks up the listening fd the init system published for `name`.
fn init_socket_fd(name: &str) -> Result<OwnedFd> {
    let key = format!("{INIT_SOCKET_ENV_PREFIX}{name}");
    let value = std::env::var(&key).map_err(|_| Error::InvalidArgument)?;
    let fd: RawFd = value.parse().map_err(|_| Error::InvalidArgument)?;
    if fd < 0 {
        return Err(Error::InvalidArgument);
    }
    // SAFETY: the init system created this fd for us and published its
    // number once; we are the sole adopter.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    // Init-created fds predate this process's exec; make sure they do not
    // leak into ours.
    // SAFETY: plain fcntl on an fd we now own.
    if unsafe { libc::fcntl(owned.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
        return Err(Error::Os(Errno::last()));
    }
    Ok(owned)
}

impl Endpoint {
    /// Creates an endpoint on an init-provided listening socket.
    ///
    /// `path` must begin with [`INIT_SOCKET_PREFIX`]; the suffix names the
    /// fd published through the `PATCHBAY_SOCKET_<name>` environment
    /// variable.
    ///
    /// # Panics
    ///
    /// Panics if the fd cannot be adopted or any endpoint resource cannot
    /// be created. Partial construction is never handed out.
    #[must_use]
    pub fn create(path: &str, blocking: bool) -> Arc<Self> {
        Self::build(path, blocking, true, ChannelManager::new())
    }

    /// Creates an endpoint that binds and listens on `path` itself,
    /// unlinking any stale socket entry first.
    ///
    /// # Panics
    ///
    /// Panics if the socket cannot be bound or any endpoint resource
    /// cannot be created. Partial construction is never handed out.
    #[must_use]
    pub fn create_and_bind(path: &str, blocking: bool) -> Arc<Self> {
        Self::build(path, blocking, false, ChannelManager::new())
    }

    /// Creates an endpoint from a configuration.
    ///
    /// # Panics
    ///
    /// Same contract as [`create`](Self::create) /
    /// [`create_and_bind`](Self::create_and_bind).
    #[must_use]
    pub fn from_config(config: &EndpointConfig) -> Arc<Self> {
        Self::build(
            &config.path,
            config.blocking,
            config.adopt_init_socket,
            ChannelManager::new(),
        )
    }

    /// Creates an endpoint with an injected channel registry (tests
    /// substitute a fake here).
    ///
    /// # Panics
    ///
    /// Same contract as [`from_config`](Self::from_config).
    #[must_use]
    pub fn from_config_with_registry(
        config: &EndpointConfig,
        registry: Arc<dyn ChannelRegistry>,
    ) -> Arc<Self> {
        Self::build(&config.path, config.blocking, config.adopt_init_socket, registry)
    }

    fn build(
        path: &str,
        blocking: bool,
        adopt_init_socket: bool,
        registry: Arc<dyn ChannelRegistry>,
    ) -> Arc<Self> {
        let socket_fd = if adopt_init_socket {
            let name = path.strip_prefix(INIT_SOCKET_PREFIX).unwrap_or_else(|| {
                panic!("endpoint: socket path '{path}' must begin with '{INIT_SOCKET_PREFIX}'")
            });
            init_socket_fd(name).unwrap_or_else(|err| {
                panic!("endpoint: unable to adopt init socket '{name}': {err}")
            })
        } else {
            let fd = socket(
                AddressFamily::Unix,
                SockType::Stream,
                SockFlag::SOCK_CLOEXEC,
                None,
            )
            .unwrap_or_else(|err| panic!("endpoint: failed to create socket: {err}"));
            let addr = UnixAddr::new(path)
                .unwrap_or_else(|err| panic!("endpoint: bad socket path '{path}': {err}"));
            let _ = nix::unistd::unlink(path); // stale entry from a previous run
            bind(fd.as_raw_fd(), &addr)
                .unwrap_or_else(|err| panic!("endpoint: failed to bind '{path}': {err}"));
            fd
        };

        listen(
            &socket_fd,
            Backlog::new(LISTEN_BACKLOG).expect("valid backlog"),
        )
        .unwrap_or_else(|err| panic!("endpoint: failed to listen on '{path}': {err}"));

        let cancel_event_fd = EventFd::from_flags(EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .unwrap_or_else(|err| panic!("endpoint: failed to create cancel event fd: {err}"));

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .unwrap_or_else(|err| panic!("endpoint: failed to create readiness set: {err}"));

        epoll
            .add(&socket_fd, oneshot_event(socket_fd.as_raw_fd()))
            .unwrap_or_else(|err| {
                panic!("endpoint: failed to watch the listening socket: {err}")
            });
        #[allow(clippy::cast_sign_loss)] // fds are non-negative
        epoll
            .add(
                &cancel_event_fd,
                EpollEvent::new(
                    EpollFlags::EPOLLIN,
                    cancel_event_fd.as_fd().as_raw_fd() as u64,
                ),
            )
            .unwrap_or_else(|err| panic!("endpoint: failed to watch the cancel event fd: {err}"));

        Arc::new(Self {
            path: path.to_string(),
            unlink_on_drop: !adopt_init_socket,
            socket_fd,
            cancel_event_fd,
            epoll,
            is_blocking: blocking,
            registry,
            service: Mutex::new(None),
            table: Mutex::new(ChannelTable::new()),
            next_message_id: AtomicI32::new(1),
        })
    }

    /// The endpoint's socket path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether `message_receive` blocks.
    #[must_use]
    pub const fn is_blocking(&self) -> bool {
        self.is_blocking
    }

    /// The channel registry this endpoint resolves channel values through.
    #[must_use]
    pub fn registry(&self) -> Arc<dyn ChannelRegistry> {
        Arc::clone(&self.registry)
    }

    /// Registers the service dispatched to by
    /// [`receive_and_dispatch`](Self::receive_and_dispatch). The endpoint
    /// keeps only a non-owning reference.
    ///
    /// # Errors
    ///
    /// Currently infallible; fallible for forward compatibility.
    pub fn set_service(&self, service: &Arc<dyn Service>) -> Result<()> {
        *self.service.lock().expect("service slot poisoned") = Some(Arc::downgrade(service));
        Ok(())
    }

    /// Registers (or clears) the service's context object for a channel.
    /// The endpoint never owns the context.
    ///
    /// # Errors
    ///
    /// Fails with `EINVAL` for an unknown channel id.
    pub fn set_channel(&self, channel_id: i32, channel: Option<&Arc<dyn Channel>>) -> Result<()> {
        let mut table = self.table.lock().expect("channel table poisoned");
        let data = table
            .channels
            .get_mut(&channel_id)
            .ok_or(Error::InvalidArgument)?;
        data.channel_state = channel.map(Arc::downgrade);
        Ok(())
    }

    /// The context registered for a channel, if the service still holds
    /// it.
    #[must_use]
    pub fn get_channel_state(&self, channel_id: i32) -> Option<Arc<dyn Channel>> {
        let table = self.table.lock().expect("channel table poisoned");
        table
            .channels
            .get(&channel_id)
            .and_then(|data| data.channel_state.as_ref())
            .and_then(Weak::upgrade)
    }

    /// Borrow of a channel's stream socket, while the channel is live.
    #[must_use]
    pub fn get_channel_socket_fd(&self, channel_id: i32) -> Option<BorrowedHandle> {
        let table = self.table.lock().expect("channel table poisoned");
        table
            .channels
            .get(&channel_id)
            .map(|data| BorrowedHandle::from_raw(data.data_fd.as_raw_fd()))
    }

    /// Borrow of a channel's event fd, while the channel is live.
    #[must_use]
    pub fn get_channel_event_fd(&self, channel_id: i32) -> Option<BorrowedHandle> {
        let table = self.table.lock().expect("channel table poisoned");
        table
            .channels
            .get(&channel_id)
            .map(|data| data.event_set.event_fd())
    }

    /// The channel id registered for a stream-socket fd.
    #[must_use]
    pub fn get_channel_id(&self, channel_fd: BorrowedHandle) -> Option<i32> {
        let table = self.table.lock().expect("channel table poisoned");
        table.fd_to_id.get(&channel_fd.raw()).copied()
    }

    /// Updates a channel's event bits; see [`EventSet::modify_events`].
    ///
    /// # Errors
    ///
    /// Fails with `EINVAL` for an unknown channel id.
    pub fn modify_channel_events(
        &self,
        channel_id: i32,
        clear_mask: u32,
        set_mask: u32,
    ) -> Result<()> {
        let mut table = self.table.lock().expect("channel table poisoned");
        let data = table
            .channels
            .get_mut(&channel_id)
            .ok_or(Error::InvalidArgument)?;
        data.event_set.modify_events(clear_mask, set_mask)
    }

    /// Tears a channel down: removes it from the readiness set and the
    /// table, closing its descriptors.
    ///
    /// # Errors
    ///
    /// Fails with `EINVAL` for an unknown channel id; a readiness-set
    /// removal failure is reported after the table entries are gone.
    pub fn close_channel(&self, channel_id: i32) -> Result<()> {
        let mut table = self.table.lock().expect("channel table poisoned");
        Self::close_channel_locked(&self.epoll, &mut table, channel_id)
    }

    fn close_channel_locked(
        epoll: &Epoll,
        table: &mut ChannelTable,
        channel_id: i32,
    ) -> Result<()> {
        let Some(data) = table.channels.remove(&channel_id) else {
            return Err(Error::InvalidArgument);
        };
        debug!(channel_id, "closing channel");
        table.fd_to_id.remove(&data.data_fd.as_raw_fd());
        epoll.delete(&data.data_fd).map_err(|err| {
            error!(channel_id, %err, "failed to remove channel from readiness set");
            Error::Os(err)
        })
        // data drops here, closing the stream socket and the event fd.
    }

    fn on_new_channel(
        &self,
        channel_fd: OwnedFd,
        channel_state: Option<&Arc<dyn Channel>>,
    ) -> Result<i32> {
        let mut table = self.table.lock().expect("channel table poisoned");
        self.on_new_channel_locked(&mut table, channel_fd, channel_state)
    }

    fn on_new_channel_locked(
        &self,
        table: &mut ChannelTable,
        channel_fd: OwnedFd,
        channel_state: Option<&Arc<dyn Channel>>,
    ) -> Result<i32> {
        let event_set = EventSet::new()?;
        let raw = channel_fd.as_raw_fd();
        self.epoll
            .add(&channel_fd, oneshot_event(raw))
            .map_err(|err| {
                error!(%err, "failed to add channel to the readiness set");
                Error::Os(err)
            })?;

        let data = ChannelData {
            data_fd: channel_fd,
            event_set,
            channel_state: channel_state.map(Arc::downgrade),
        };
        let channel_id = table.allocate_id();
        table.fd_to_id.insert(raw, channel_id);
        table.channels.insert(channel_id, data);
        debug!(channel_id, "registered channel");
        Ok(channel_id)
    }

    /// Rearms a one-shot fd in the readiness set. The only operation that
    /// may resurrect a channel there.
    fn rearm(&self, fd: RawFd) -> Result<()> {
        let mut event = oneshot_event(fd);
        // SAFETY: callers pass fds owned by the endpoint or by a live
        // ChannelData entry.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.modify(borrowed, &mut event).map_err(|err| {
            error!(fd, %err, "failed to rearm readiness for fd");
            Error::Os(err)
        })
    }

    fn next_message_id(&self) -> i32 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    fn current_service(&self) -> Option<Arc<dyn Service>> {
        self.service
            .lock()
            .expect("service slot poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Accepts a pending connection and reads its first request, so the
    /// connect and the `CHANNEL_OPEN` frame surface as one event.
    fn accept_connection(self: &Arc<Self>) -> Result<Message> {
        let raw = accept4(self.socket_fd.as_raw_fd(), SockFlag::SOCK_CLOEXEC).map_err(|err| {
            error!(%err, "failed to accept connection");
            Error::Os(err)
        })?;
        // SAFETY: accept4 just handed us this fd; nothing else records it.
        let channel_fd = unsafe { OwnedFd::from_raw_fd(raw) };

        setsockopt(&channel_fd, sockopt::PassCred, &true).map_err(|err| {
            error!(fd = raw, %err, "failed to enable credential passing on channel");
            Error::Os(err)
        })?;

        self.on_new_channel(channel_fd, None)?;
        self.receive_message_for_channel(raw)
    }

    /// Drains one request frame from a channel.
    ///
    /// A clean peer close at any frame boundary synthesises a
    /// `CHANNEL_CLOSE` message instead; any other I/O failure tears the
    /// channel down and propagates.
    #[allow(clippy::cast_possible_wrap)] // uid/gid become -1-capable message fields
    fn receive_message_for_channel(self: &Arc<Self>, channel_fd: RawFd) -> Result<Message> {
        let sock = BorrowedHandle::from_raw(channel_fd);
        let channel_id = self.get_channel_id(sock).unwrap_or(-1);

        let request = match sockio::receive_request(sock) {
            Ok(request) => request,
            Err(Error::Shutdown) => return Ok(self.build_close_message(channel_id)),
            Err(err) => {
                let _ = self.close_channel(channel_id);
                return Err(err);
            }
        };

        let is_impulse = request.is_impulse;
        let send_len = request.send_len as usize;
        let cred = request.cred;
        let info = MessageInfo {
            pid: cred.map_or(-1, |c| c.pid),
            tid: -1,
            cid: channel_id,
            mid: if is_impulse {
                IMPULSE_MESSAGE_ID
            } else {
                self.next_message_id()
            },
            euid: cred.map_or(-1, |c| c.uid as i32),
            egid: cred.map_or(-1, |c| c.gid as i32),
            op: request.op,
            flags: 0,
            service: self.current_service(),
            channel: self.get_channel_state(channel_id),
            send_len,
            recv_len: request.max_recv_len as usize,
            fd_count: request.file_descriptors.len(),
            impulse: request.impulse_payload,
        };

        let mut state = MessageState::new(request);
        if send_len > 0 && !is_impulse {
            state.request_data = vec![0u8; send_len];
            match sockio::receive_payload(sock, &mut state.request_data) {
                Ok(()) => {}
                Err(Error::Shutdown) => return Ok(self.build_close_message(channel_id)),
                Err(err) => {
                    let _ = self.close_channel(channel_id);
                    return Err(err);
                }
            }
        }

        // Impulses are one-way: no reply will rearm the channel, so the
        // receive path does.
        if is_impulse {
            if let Err(err) = self.rearm(channel_fd) {
                let _ = self.close_channel(channel_id);
                return Err(err);
            }
        }

        Ok(Message::new(Arc::clone(self), info, state))
    }

    /// Builds the synthetic `CHANNEL_CLOSE` message for a hung-up channel.
    fn build_close_message(self: &Arc<Self>, channel_id: i32) -> Message {
        debug!(channel_id, "synthesising channel close");
        let info = MessageInfo {
            pid: -1,
            tid: -1,
            cid: channel_id,
            mid: self.next_message_id(),
            euid: -1,
            egid: -1,
            op: opcodes::CHANNEL_CLOSE,
            flags: 0,
            service: self.current_service(),
            channel: self.get_channel_state(channel_id),
            send_len: 0,
            recv_len: 0,
            fd_count: 0,
            impulse: [0; patchbay_core::IMPULSE_PAYLOAD_SIZE],
        };
        Message::new(Arc::clone(self), info, MessageState::default())
    }

    /// Waits for and translates exactly one readiness event into a
    /// [`Message`].
    ///
    /// Receiving at most one event per call keeps concurrent dispatcher
    /// threads off the same socket.
    ///
    /// # Errors
    ///
    /// - `ESHUTDOWN` after [`cancel`](Self::cancel), or when a peer closes
    ///   during a header read (as a synthesised close message instead when
    ///   the channel is known)
    /// - `ETIMEDOUT` when non-blocking and idle
    /// - any accept/read failure, after tearing the affected channel down
    pub fn message_receive(self: &Arc<Self>) -> Result<Message> {
        let mut events = [EpollEvent::empty()];
        let timeout = if self.is_blocking {
            EpollTimeout::NONE
        } else {
            EpollTimeout::ZERO
        };
        let count = loop {
            match self.epoll.wait(&mut events, timeout) {
                Ok(count) => break count,
                Err(Errno::EINTR) => {}
                Err(err) => {
                    error!(%err, "failed to wait for readiness events");
                    return Err(err.into());
                }
            }
        };
        if count == 0 {
            return Err(Error::TimedOut);
        }

        let event = events[0];
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        // Event payloads are fds stored by this endpoint.
        let fd = event.data() as RawFd;

        if fd == self.cancel_event_fd.as_fd().as_raw_fd() {
            return Err(Error::Shutdown);
        }

        if fd == self.socket_fd.as_raw_fd() {
            let accepted = self.accept_connection();
            self.rearm(self.socket_fd.as_raw_fd())?;
            return accepted;
        }

        if event
            .events()
            .intersects(EpollFlags::EPOLLRDHUP | EpollFlags::EPOLLHUP)
        {
            let channel_id = self
                .get_channel_id(BorrowedHandle::from_raw(fd))
                .unwrap_or(-1);
            return Ok(self.build_close_message(channel_id));
        }

        self.receive_message_for_channel(fd)
    }

    /// Sends the reply for `message` and completes it.
    ///
    /// Special cases by opcode:
    /// - `CHANNEL_CLOSE`: no wire I/O; the channel is torn down and the
    ///   close result returned.
    /// - `CHANNEL_OPEN` with a negative return code: the open is rejected
    ///   and the channel torn down.
    /// - `CHANNEL_OPEN` otherwise: the channel's event fd is pushed into
    ///   the reply, any response payload is discarded, and the return code
    ///   becomes the pushed fd's file reference.
    ///
    /// On success the channel is rearmed in the readiness set.
    ///
    /// # Errors
    ///
    /// Fails with `EBADF` if the channel is already gone; wire failures
    /// propagate without tearing the channel down.
    pub fn message_reply(&self, mut message: Message, return_code: i32) -> Result<()> {
        let channel_id = message.channel_id();
        let Some(channel_socket) = self.get_channel_socket_fd(channel_id) else {
            return Err(Error::StaleChannel);
        };

        let mut return_code = return_code;
        match message.op() {
            opcodes::CHANNEL_CLOSE => return self.close_channel(channel_id),
            opcodes::CHANNEL_OPEN => {
                if return_code < 0 {
                    return self.close_channel(channel_id);
                }
                // The open reply carries the channel's event fd; the
                // return code becomes its reference.
                let event_fd = self
                    .get_channel_event_fd(channel_id)
                    .ok_or(Error::StaleChannel)?;
                let state = message.state_mut();
                return_code = state.push_file_handle(event_fd)?;
                state.response_data.clear();
            }
            _ => {}
        }

        let state = message.state_mut();
        state.response.ret_code = return_code;
        state.response.recv_len =
            u32::try_from(state.response_data.len()).map_err(|_| Error::TooLarge {
                what: "payload length",
                size: state.response_data.len(),
                max: MAX_PAYLOAD_SIZE,
            })?;

        sockio::send_response(channel_socket, &state.response)?;
        if !state.response_data.is_empty() {
            sockio::send_payload(channel_socket, &state.response_data)?;
        }
        self.rearm(channel_socket.raw())
        // message drops here, closing consumed request fds and the held
        // halves of pushed socket pairs.
    }

    /// Creates a fresh channel pair, registers the server half, and embeds
    /// the client half (plus the new channel's event fd) in `message`'s
    /// reply.
    ///
    /// Returns the reply-side channel reference and the new channel id.
    /// `flags` is accepted for forward compatibility and currently
    /// ignored.
    ///
    /// # Errors
    ///
    /// Propagates socketpair creation, option, and registration failures.
    pub fn push_channel(
        &self,
        message: &mut Message,
        flags: i32,
        channel: Option<&Arc<dyn Channel>>,
    ) -> Result<(RemoteChannelHandle, i32)> {
        let _ = flags;

        let (local_socket, remote_socket) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|err| {
            error!(%err, "failed to create channel socket pair");
            Error::Os(err)
        })?;

        setsockopt(&local_socket, sockopt::PassCred, &true).map_err(|err| {
            error!(%err, "failed to enable credential passing on pushed channel");
            Error::Os(err)
        })?;

        let mut table = self.table.lock().expect("channel table poisoned");
        let channel_id = self.on_new_channel_locked(&mut table, local_socket, channel)?;
        let event_fd = table
            .channels
            .get(&channel_id)
            .map(|data| data.event_set.event_fd())
            .ok_or(Error::InvalidArgument)?;

        let remote_socket = LocalHandle::from(remote_socket);
        let state = message.state_mut();
        let reference = state.push_channel_pair(remote_socket.borrow(), event_fd)?;
        // The kernel duplicates the client half at sendmsg time; keep it
        // alive until the reply has been transmitted.
        state.sockets_to_close.push(remote_socket);

        Ok((RemoteChannelHandle::new(reference), channel_id))
    }

    /// Declared but unimplemented channel validation hook.
    ///
    /// # Errors
    ///
    /// Always fails with `EFAULT`.
    pub fn check_channel(
        &self,
        _message: &Message,
        _reference: ChannelReference,
    ) -> Result<Arc<dyn Channel>> {
        Err(Error::NotImplemented)
    }

    /// Unblocks every current and future [`message_receive`](Self::message_receive)
    /// with `ESHUTDOWN`.
    ///
    /// The endpoint never drains the cancel event fd: one cancellation
    /// keeps all subsequent receives failing until an external party reads
    /// the fd or the endpoint is dropped.
    ///
    /// # Errors
    ///
    /// Propagates the eventfd write failure.
    pub fn cancel(&self) -> Result<()> {
        self.cancel_event_fd.arm()?;
        Ok(())
    }

    /// Receives one message and routes it through the registered
    /// [`Service`]: impulses to `handle_impulse`, everything else to
    /// `handle_message`.
    ///
    /// # Errors
    ///
    /// Fails with `EINVAL` if no service is registered (or it has been
    /// dropped); otherwise propagates receive and handler errors.
    pub fn receive_and_dispatch(self: &Arc<Self>) -> Result<()> {
        let message = self.message_receive()?;
        let service = message
            .info()
            .service
            .clone()
            .ok_or(Error::InvalidArgument)?;
        if message.is_impulse() {
            service.handle_impulse(message)
        } else {
            service.handle_message(message)
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if self.unlink_on_drop {
            if let Err(err) = nix::unistd::unlink(self.path.as_str()) {
                debug!(path = %self.path, %err, "failed to unlink endpoint socket");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_live_id(id: i32) -> ChannelTable {
        let mut table = ChannelTable::new();
        let (data_fd, _peer) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .expect("socketpair");
        // Leak the peer for the duration of the test; the table owns the
        // server half.
        std::mem::forget(_peer);
        table.channels.insert(
            id,
            ChannelData {
                data_fd,
                event_set: EventSet::new().expect("event set"),
                channel_state: None,
            },
        );
        table
    }

    #[test]
    fn id_allocation_starts_at_one_and_increments() {
        let mut table = ChannelTable::new();
        assert_eq!(table.allocate_id(), 1);
        assert_eq!(table.allocate_id(), 2);
    }

    #[test]
    fn id_allocation_wraps_before_exceeding_i32_max() {
        let mut table = ChannelTable::new();
        table.last_channel_id = i32::MAX - 1;
        assert_eq!(table.allocate_id(), i32::MAX);
        // The counter sits at i32::MAX; the next allocation wraps to 1,
        // never to 0.
        assert_eq!(table.allocate_id(), 1);
    }

    #[test]
    fn id_allocation_probes_past_live_ids() {
        let mut table = table_with_live_id(2);
        table.last_channel_id = 1;
        assert_eq!(table.allocate_id(), 3, "id 2 is live and must be skipped");
    }
}
