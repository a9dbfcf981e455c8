//! Handle types, wire framing, and socket plumbing for the patchbay IPC
//! substrate.
//!
//! Patchbay multiplexes many client *channels* over a single Unix domain
//! socket. This crate holds the pieces shared by both ends of a channel:
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │        Endpoint / client factory          │  patchbay-endpoint, clients
//! ├──────────────────────────────────────────┤
//! │   Request / response header framing       │  [`wire::framing`]
//! ├──────────────────────────────────────────┤
//! │   sendmsg/recvmsg + SCM_RIGHTS plumbing   │  [`wire::sockio`]
//! ├──────────────────────────────────────────┤
//! │            AF_UNIX stream socket          │
//! └──────────────────────────────────────────┘
//! ```
//!
//! # Module Overview
//!
//! - [`status`]: endpoint-visible error kinds ([`Error`], [`Result`]) with
//!   their conventional POSIX mapping
//! - [`handle`]: owned/borrowed descriptor types ([`LocalHandle`],
//!   [`BorrowedHandle`]) and per-message reference spaces
//! - [`wire`]: header codecs and the ancillary-data socket I/O built on them
//! - [`events`]: the per-channel event fd and its cached bit mask
//!   ([`EventSet`])
//! - [`channel_manager`]: the client-side registry of live channels
//!   ([`ChannelRegistry`], [`ChannelManager`])
//!
//! # Security Considerations
//!
//! - Header counts and payload lengths are validated BEFORE allocation
//! - File descriptors received over the wire are materialised close-on-exec
//! - Peer identity comes from kernel-supplied `SCM_CREDENTIALS`, never from
//!   bytes the peer controls

pub mod channel_manager;
pub mod events;
pub mod handle;
pub mod status;
pub mod wire;

pub use channel_manager::{ChannelManager, ChannelRegistry};
pub use events::EventSet;
pub use handle::{
    AsHandle, BorrowedChannelHandle, BorrowedHandle, ChannelReference, FileReference,
    LocalChannelHandle, LocalHandle, RemoteChannelHandle, RemoteHandle,
};
pub use status::{Error, Result};
pub use wire::framing::{
    ChannelInfo, Credentials, RequestHeader, ResponseHeader, IMPULSE_PAYLOAD_SIZE,
    MAX_CHANNEL_COUNT, MAX_FD_COUNT, MAX_PAYLOAD_SIZE,
};
