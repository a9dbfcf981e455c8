//! Owned and borrowed descriptor types.
//!
//! The substrate never passes naked integer fds across component
//! boundaries. [`LocalHandle`] models exclusive ownership (the descriptor
//! is closed on drop); [`BorrowedHandle`] is a non-owning copy of the fd
//! number that must not outlive the owner. Both can be *empty*, carrying a
//! negative sentinel that wire operations pass through unchanged; this is
//! how per-message descriptor references encode "no fd" without a separate
//! option type on the wire.
//!
//! Channel handles follow the same split. A [`LocalChannelHandle`] is the
//! client side of a live channel, registered in a
//! [`ChannelRegistry`](crate::channel_manager::ChannelRegistry) and
//! deregistered on drop. [`RemoteHandle`] and [`RemoteChannelHandle`] hold
//! reference values that are only meaningful on the other side of a
//! message and are pushed by pass-through.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;

use nix::errno::Errno;

use crate::channel_manager::ChannelRegistry;
use crate::status::Result;

/// Index into a message's outgoing (or received) fd list.
///
/// Non-negative values index the list; negative values are literal "no fd"
/// sentinels passed through unchanged.
pub type FileReference = i32;

/// Index into a message's outgoing (or received) channel-info list.
///
/// Same sign convention as [`FileReference`].
pub type ChannelReference = i32;

/// Sentinel for a handle that has never held a descriptor.
const INVALID_FD: RawFd = -1;

#[derive(Debug)]
enum Inner {
    Owned(OwnedFd),
    Empty(RawFd),
}

/// Exclusive ownership of a file descriptor.
///
/// Closes the descriptor on drop. The empty state carries a negative
/// sentinel value so a consumed or never-assigned handle still has a
/// numeric identity for pass-through semantics.
#[derive(Debug)]
pub struct LocalHandle(Inner);

impl LocalHandle {
    /// An empty handle with the default `-1` sentinel.
    #[must_use]
    pub const fn empty() -> Self {
        Self(Inner::Empty(INVALID_FD))
    }

    /// An empty handle carrying a specific (negative) sentinel value.
    #[must_use]
    pub const fn sentinel(value: RawFd) -> Self {
        Self(Inner::Empty(value))
    }

    /// Whether this handle currently owns a descriptor.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self.0, Inner::Owned(_))
    }

    /// The raw fd number, or the sentinel value when empty.
    ///
    /// Only ancillary-data construction and epoll bookkeeping should need
    /// this.
    #[must_use]
    pub fn raw(&self) -> RawFd {
        match &self.0 {
            Inner::Owned(fd) => fd.as_raw_fd(),
            Inner::Empty(value) => *value,
        }
    }

    /// A non-owning copy of the fd number (or sentinel).
    #[must_use]
    pub fn borrow(&self) -> BorrowedHandle {
        BorrowedHandle(self.raw())
    }

    /// The owned descriptor as a std borrow, if valid.
    #[must_use]
    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        match &self.0 {
            Inner::Owned(fd) => Some(fd.as_fd()),
            Inner::Empty(_) => None,
        }
    }

    /// Moves ownership out, leaving this handle empty with the default
    /// sentinel.
    #[must_use]
    pub fn take(&mut self) -> Self {
        std::mem::replace(self, Self::empty())
    }

    /// Unwraps the owned descriptor, if any.
    #[must_use]
    pub fn into_owned(self) -> Option<OwnedFd> {
        match self.0 {
            Inner::Owned(fd) => Some(fd),
            Inner::Empty(_) => None,
        }
    }
}

impl Default for LocalHandle {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<OwnedFd> for LocalHandle {
    fn from(fd: OwnedFd) -> Self {
        Self(Inner::Owned(fd))
    }
}

/// A non-owning fd number.
///
/// Valid only while the owning [`LocalHandle`] (or other owner) is alive.
/// May carry a negative sentinel, in which case it is not backed by a
/// descriptor at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BorrowedHandle(RawFd);

impl BorrowedHandle {
    /// An invalid borrow with the default `-1` sentinel.
    #[must_use]
    pub const fn invalid() -> Self {
        Self(INVALID_FD)
    }

    /// Wraps a raw fd number (or negative sentinel).
    #[must_use]
    pub const fn from_raw(fd: RawFd) -> Self {
        Self(fd)
    }

    /// The wrapped fd number (or sentinel).
    #[must_use]
    pub const fn raw(self) -> RawFd {
        self.0
    }

    /// Whether this borrow names a descriptor.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// Duplicates the descriptor into a new owned handle
    /// (`F_DUPFD_CLOEXEC`).
    ///
    /// An invalid borrow duplicates to an empty handle carrying the same
    /// sentinel.
    ///
    /// # Errors
    ///
    /// Returns the underlying OS error if the duplication fails.
    pub fn duplicate(self) -> Result<LocalHandle> {
        if !self.is_valid() {
            return Ok(LocalHandle::sentinel(self.0));
        }
        // SAFETY: the borrow contract requires the fd to outlive this call.
        let fd = unsafe { BorrowedFd::borrow_raw(self.0) };
        let owned = fd
            .try_clone_to_owned()
            .map_err(|err| Errno::from_raw(err.raw_os_error().unwrap_or(libc::EIO)))?;
        Ok(LocalHandle::from(owned))
    }
}

impl From<BorrowedFd<'_>> for BorrowedHandle {
    fn from(fd: BorrowedFd<'_>) -> Self {
        Self(fd.as_raw_fd())
    }
}

/// Uniform access to the fd number behind owned and borrowed handles.
///
/// Lets the wire layer accept header lists of either handle type.
pub trait AsHandle {
    /// A non-owning copy of the fd number (or sentinel).
    fn as_handle(&self) -> BorrowedHandle;
}

impl AsHandle for LocalHandle {
    fn as_handle(&self) -> BorrowedHandle {
        self.borrow()
    }
}

impl AsHandle for BorrowedHandle {
    fn as_handle(&self) -> BorrowedHandle {
        *self
    }
}

/// A file reference that is only meaningful on the remote side of a
/// message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteHandle(FileReference);

impl RemoteHandle {
    /// Wraps a remote-side file reference.
    #[must_use]
    pub const fn new(value: FileReference) -> Self {
        Self(value)
    }

    /// The remote-side reference value.
    #[must_use]
    pub const fn value(self) -> FileReference {
        self.0
    }
}

/// Client side of a live channel.
///
/// Holds the channel's registry value (the data fd number under which the
/// pair was registered) and deregisters it when dropped, closing both
/// descriptors. An invalid handle carries a negative pass-through value
/// and no registry.
pub struct LocalChannelHandle {
    registry: Option<Arc<dyn ChannelRegistry>>,
    value: i32,
}

impl std::fmt::Debug for LocalChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalChannelHandle")
            .field("value", &self.value)
            .field("registered", &self.registry.is_some())
            .finish()
    }
}

impl LocalChannelHandle {
    /// A handle carrying only a (negative) pass-through value.
    #[must_use]
    pub const fn sentinel(value: i32) -> Self {
        Self {
            registry: None,
            value,
        }
    }

    /// Binds a registered channel value to the registry that owns it.
    ///
    /// Called by [`ChannelRegistry::create_handle`] implementations; not
    /// something service code constructs directly.
    #[must_use]
    pub fn from_registry(registry: Arc<dyn ChannelRegistry>, value: i32) -> Self {
        Self {
            registry: Some(registry),
            value,
        }
    }

    /// The channel value (data fd number), or the negative sentinel.
    #[must_use]
    pub const fn value(&self) -> i32 {
        self.value
    }

    /// Whether this handle names a registered channel.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.registry.is_some() && self.value >= 0
    }

    /// A non-owning copy of the channel value.
    #[must_use]
    pub const fn borrow(&self) -> BorrowedChannelHandle {
        BorrowedChannelHandle(self.value)
    }
}

impl Drop for LocalChannelHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.take() {
            registry.close_handle(self.value);
        }
    }
}

/// Non-owning reference to a client-side channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BorrowedChannelHandle(i32);

impl BorrowedChannelHandle {
    /// Wraps a channel value (or negative sentinel).
    #[must_use]
    pub const fn from_value(value: i32) -> Self {
        Self(value)
    }

    /// The channel value.
    #[must_use]
    pub const fn value(self) -> i32 {
        self.0
    }

    /// Whether this borrow names a channel.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

/// A channel reference that is only meaningful on the remote side of a
/// message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteChannelHandle(ChannelReference);

impl RemoteChannelHandle {
    /// Wraps a remote-side channel reference.
    #[must_use]
    pub const fn new(value: ChannelReference) -> Self {
        Self(value)
    }

    /// The remote-side reference value.
    #[must_use]
    pub const fn value(self) -> ChannelReference {
        self.0
    }
}
