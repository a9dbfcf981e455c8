//! Per-channel event signalling state.
//!
//! Every server-side channel owns an eventfd that is handed to the client
//! inside the `CHANNEL_OPEN` reply. The server raises asynchronous state
//! bits by signalling the eventfd; the cached mask tells the client-facing
//! poll machinery which bits are currently pending.

use std::os::fd::{AsFd, AsRawFd};

use nix::errno::Errno;
use nix::sys::eventfd::{EfdFlags, EventFd};

use crate::handle::BorrowedHandle;
use crate::status::Result;

/// The per-channel event fd plus its cached event-bit mask.
///
/// Callers serialise access through the endpoint's channel table lock; the
/// set itself performs no locking.
#[derive(Debug)]
pub struct EventSet {
    event_fd: EventFd,
    mask: u32,
}

impl EventSet {
    /// Creates the event fd (`EFD_CLOEXEC | EFD_NONBLOCK`) with an empty
    /// mask.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the eventfd cannot be created.
    pub fn new() -> Result<Self> {
        let event_fd = EventFd::from_flags(EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;
        Ok(Self { event_fd, mask: 0 })
    }

    /// Borrow of the event fd, for pushing into replies.
    #[must_use]
    pub fn event_fd(&self) -> BorrowedHandle {
        BorrowedHandle::from_raw(self.event_fd.as_fd().as_raw_fd())
    }

    /// The currently pending event bits.
    #[must_use]
    pub const fn events(&self) -> u32 {
        self.mask
    }

    /// Clears then sets event bits, keeping the eventfd in step with the
    /// mask: signalled while any bit is pending, drained when none are.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the eventfd write fails. A drain finding
    /// the counter already empty is not an error.
    pub fn modify_events(&mut self, clear_mask: u32, set_mask: u32) -> Result<()> {
        let old_mask = self.mask;
        self.mask = (old_mask & !clear_mask) | set_mask;

        if old_mask == 0 && self.mask != 0 {
            self.event_fd.arm()?;
        } else if old_mask != 0 && self.mask == 0 {
            let mut counter = [0u8; 8];
            match nix::unistd::read(self.event_fd.as_fd().as_raw_fd(), &mut counter) {
                Ok(_) | Err(Errno::EAGAIN) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}
