//! Request/response framing and the socket I/O that carries it.
//!
//! A channel is a full-duplex `AF_UNIX` stream carrying request and
//! response *frames*. Each frame is a fixed-schema header block (with its
//! descriptor lists attached as `SCM_RIGHTS` ancillary data and, on
//! requests, kernel credentials as `SCM_CREDENTIALS`), optionally followed
//! by payload bytes:
//!
//! ```text
//! request:  | RequestHeader (53 bytes) + cmsg |  send_len payload bytes |
//! response: | ResponseHeader (16 bytes) + cmsg | recv_len payload bytes |
//! ```
//!
//! [`framing`] owns the byte layout; [`sockio`] owns the syscalls. Both
//! sides of the protocol are implemented here so clients and servers share
//! one codec.

pub mod framing;
pub mod sockio;
