//! Service-facing traits and the well-known operation codes.
//!
//! The endpoint never interprets a request beyond its framing; it hands
//! each frame to the [`Service`] registered on it. The two opcodes below
//! are the only ones with endpoint-visible semantics; everything else is
//! between a service and its clients.

use std::sync::Arc;

use nix::errno::Errno;

use patchbay_core::Result;

use crate::message::Message;

/// Operation codes with endpoint-visible semantics.
pub mod opcodes {
    /// First request on every new channel. The reply's return code is
    /// reinterpreted as the file reference of the channel's event fd.
    pub const CHANNEL_OPEN: i32 = 0;

    /// Channel teardown. Synthesised by the endpoint on peer hangup; the
    /// service's reply completes the teardown.
    pub const CHANNEL_CLOSE: i32 = -1;
}

/// Opaque per-channel state owned by the service.
///
/// The endpoint only ever holds a non-owning reference, registered and
/// cleared through [`Endpoint::set_channel`](crate::Endpoint::set_channel).
pub trait Channel: std::fmt::Debug + Send + Sync {}

/// A dispatcher for the opcodes a service understands.
///
/// Dispatcher threads obtain messages from
/// [`Endpoint::message_receive`](crate::Endpoint::message_receive) (or the
/// [`receive_and_dispatch`](crate::Endpoint::receive_and_dispatch)
/// convenience loop, which routes through this trait). The provided
/// `handle_message` covers channel lifecycle for services that only care
/// about their own opcodes.
pub trait Service: Send + Sync {
    /// Called for the `CHANNEL_OPEN` request of each new channel; the
    /// returned state is registered as the channel's context.
    fn on_channel_open(&self, message: &mut Message) -> Option<Arc<dyn Channel>> {
        let _ = message;
        None
    }

    /// Called when a channel closes, with whatever context is still
    /// registered.
    fn on_channel_close(&self, message: &mut Message, channel: Option<Arc<dyn Channel>>) {
        let _ = (message, channel);
    }

    /// Handles one request. The implementation must consume the message by
    /// replying to it; an unanswered message leaves its channel disarmed
    /// forever.
    ///
    /// # Errors
    ///
    /// Propagates reply-path failures to the dispatch loop.
    fn handle_message(&self, message: Message) -> Result<()> {
        let mut message = message;
        match message.op() {
            opcodes::CHANNEL_OPEN => {
                let channel = self.on_channel_open(&mut message);
                message.set_channel(channel.as_ref())?;
                message.reply(0)
            }
            opcodes::CHANNEL_CLOSE => {
                let channel = message.channel_state();
                self.on_channel_close(&mut message, channel);
                message.reply(0)
            }
            _ => message.reply(-(Errno::EOPNOTSUPP as i32)),
        }
    }

    /// Handles one impulse. Impulses carry no reply; dropping the message
    /// is the default.
    ///
    /// # Errors
    ///
    /// Implementations may surface processing failures to the dispatch
    /// loop.
    fn handle_impulse(&self, message: Message) -> Result<()> {
        drop(message);
        Ok(())
    }
}
