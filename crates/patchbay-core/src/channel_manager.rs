//! Client-side registry of live channels.
//!
//! When a channel (or a pushed sub-channel) arrives inside a message, the
//! receiving process registers its `(data_fd, event_fd)` pair here and
//! works with the resulting [`LocalChannelHandle`]. The registry is an
//! injected dependency of everything that resolves channel values, so
//! tests substitute a fake instead of reaching for process-global state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::handle::{BorrowedHandle, LocalChannelHandle, LocalHandle};

/// Registry of client-owned channels, keyed by channel value.
///
/// The channel value is the raw number of the data fd under which the pair
/// was registered; it doubles as the wire representation of a borrowed
/// channel.
pub trait ChannelRegistry: Send + Sync {
    /// Registers a received `(data_fd, event_fd)` pair and hands back the
    /// owning handle.
    fn create_handle(
        self: Arc<Self>,
        data_fd: LocalHandle,
        event_fd: LocalHandle,
    ) -> LocalChannelHandle;

    /// The event fd registered for `value`, if the channel is live.
    fn event_fd(&self, value: i32) -> Option<BorrowedHandle>;

    /// Drops the registration for `value`, closing both descriptors.
    ///
    /// Called from [`LocalChannelHandle::drop`]; unknown values are
    /// ignored.
    fn close_handle(&self, value: i32);
}

struct ClientChannel {
    data_fd: LocalHandle,
    event_fd: LocalHandle,
}

/// Production [`ChannelRegistry`]: a mutex-protected table.
#[derive(Default)]
pub struct ChannelManager {
    channels: Mutex<HashMap<i32, ClientChannel>>,
}

impl ChannelManager {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of live registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.lock().expect("channel registry poisoned").len()
    }

    /// Whether no channels are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChannelRegistry for ChannelManager {
    fn create_handle(
        self: Arc<Self>,
        data_fd: LocalHandle,
        event_fd: LocalHandle,
    ) -> LocalChannelHandle {
        let value = data_fd.raw();
        if value < 0 {
            return LocalChannelHandle::sentinel(value);
        }
        self.channels
            .lock()
            .expect("channel registry poisoned")
            .insert(value, ClientChannel { data_fd, event_fd });
        LocalChannelHandle::from_registry(self, value)
    }

    fn event_fd(&self, value: i32) -> Option<BorrowedHandle> {
        self.channels
            .lock()
            .expect("channel registry poisoned")
            .get(&value)
            .map(|channel| channel.event_fd.borrow())
    }

    fn close_handle(&self, value: i32) {
        let removed = self
            .channels
            .lock()
            .expect("channel registry poisoned")
            .remove(&value);
        if removed.is_some() {
            debug!(value, "closed client channel");
        }
    }
}
