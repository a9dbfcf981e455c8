//! Endpoint configuration.

use serde::{Deserialize, Serialize};

/// Prefix that marks a socket as created by the init system.
///
/// Paths under this prefix are not bound by the endpoint; the listening fd
/// is adopted from the environment instead (see
/// [`Endpoint::create`](crate::Endpoint::create)).
pub const INIT_SOCKET_PREFIX: &str = "/dev/socket/";

/// Environment variable prefix under which the init system publishes
/// listening fds, keyed by socket name.
pub const INIT_SOCKET_ENV_PREFIX: &str = "PATCHBAY_SOCKET_";

/// Where a service endpoint lives and how it waits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Absolute filesystem path of the listening socket.
    pub path: String,

    /// Whether `message_receive` blocks for the next event. Non-blocking
    /// endpoints poll with a zero timeout and report `ETIMEDOUT` when
    /// idle.
    pub blocking: bool,

    /// Adopt the init-provided listening fd instead of binding. Requires
    /// `path` to begin with [`INIT_SOCKET_PREFIX`].
    pub adopt_init_socket: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            path: format!("{INIT_SOCKET_PREFIX}patchbay"),
            blocking: true,
            adopt_init_socket: true,
        }
    }
}
