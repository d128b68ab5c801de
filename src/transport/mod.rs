//! Socket bindings for the persistent-connection transport.
//!
//! Unix only: a listener serving every accepted connection with
//! [`serve_connection`](crate::server::serve_connection), and the matching
//! connect helper used by `ConnectionLink::connect_socket`.

#[cfg(unix)]
mod socket;

#[cfg(unix)]
pub use socket::{generate_socket_path, serve_socket, SocketListener};
