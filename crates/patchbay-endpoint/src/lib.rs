//! Server-side endpoint of the patchbay UDS IPC substrate.
//!
//! An [`Endpoint`] hosts a service behind one `AF_UNIX` listening socket,
//! multiplexing every connected client *channel* through a one-shot
//! readiness set. Dispatcher threads pull self-contained [`Message`]s out
//! of [`Endpoint::message_receive`], hand them to service code, and
//! complete them through the reply path, which is also what rearms the
//! channel for its next request.
//!
//! # Module Overview
//!
//! - [`endpoint`]: the endpoint itself: channel table, readiness
//!   multiplexer, dispatch loop, reply path
//! - [`message`]: one in-flight request and its scratch state
//!   ([`Message`], [`MessageInfo`])
//! - [`service`]: the traits a service implements ([`Service`],
//!   [`Channel`]) and the well-known [`opcodes`]
//! - [`config`]: endpoint construction parameters ([`EndpointConfig`])
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use patchbay_endpoint::{Endpoint, Service};
//!
//! let endpoint = Endpoint::create_and_bind("/run/myservice.sock", true);
//! endpoint.set_service(&service)?;
//! loop {
//!     match endpoint.receive_and_dispatch() {
//!         Ok(()) => {}
//!         Err(patchbay_core::Error::Shutdown) => break,
//!         Err(err) => tracing::warn!(%err, "dispatch failed"),
//!     }
//! }
//! ```

pub mod config;
pub mod endpoint;
pub mod message;
pub mod service;

pub use config::{EndpointConfig, INIT_SOCKET_ENV_PREFIX, INIT_SOCKET_PREFIX};
pub use endpoint::Endpoint;
pub use message::{Message, MessageInfo, IMPULSE_MESSAGE_ID};
pub use service::{opcodes, Channel, Service};
