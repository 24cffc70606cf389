//! RPC boundary between the daemon and its device-frontend clients.
//!
//! Two independent services run on two filesystem sockets: the
//! unprivileged service (status and random-number output) and the
//! privileged service (entropy accounting writes). Requests and responses
//! travel as length-prefixed bincode frames; responses are paired to
//! requests by call id.

pub mod client;
pub mod privileged;
pub mod proto;
pub mod server;
pub mod unpriv;

use crate::defs::ESDM_RPC_MAX_MSG_SIZE;

/// Upper bound of the random-data payload inside one response, leaving
/// headroom for the envelope metadata within the frame limit.
pub const ESDM_RPC_MAX_DATA: usize = ESDM_RPC_MAX_MSG_SIZE - 60;

pub fn unpriv_socket_path(testmode: bool) -> String {
    if testmode {
        "/var/run/esdm-rpc-unpriv-testmode".to_string()
    } else {
        "/var/run/esdm-rpc-unpriv".to_string()
    }
}

pub fn priv_socket_path(testmode: bool) -> String {
    if testmode {
        "/var/run/esdm-rpc-priv-testmode".to_string()
    } else {
        "/var/run/esdm-rpc-priv".to_string()
    }
}

/// File mode of the unprivileged socket: world-writable.
pub const UNPRIV_SOCKET_MODE: u32 = 0o666;
/// File mode of the privileged socket: root only.
pub const PRIV_SOCKET_MODE: u32 = 0o600;
