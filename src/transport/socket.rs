//! Unix domain socket listener.
//!
//! # Example
//!
//! ```no_run
//! use linkwire::context::Context;
//! use linkwire::server::{ConnectionConfig, Router, Server};
//! use linkwire::transport::{generate_socket_path, serve_socket, SocketListener};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(router: Router) -> linkwire::error::Result<()> {
//! let listener = SocketListener::bind(generate_socket_path())?;
//! serve_socket(
//!     Server::new(router),
//!     listener,
//!     Context::new,
//!     ConnectionConfig::default(),
//!     CancellationToken::new(),
//! )
//! .await
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::Result;
use crate::server::{serve_connection, ConnectionConfig, Server};

/// Fresh socket path in the system temp directory:
/// `<tmp>/linkwire-{pid}-{random}.sock`.
pub fn generate_socket_path() -> PathBuf {
    let pid = std::process::id();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let salt = nanos.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ u64::from(pid);
    std::env::temp_dir().join(format!("linkwire-{pid}-{salt:x}.sock"))
}

/// Listener owning its socket file; the file is removed on drop.
#[derive(Debug)]
pub struct SocketListener {
    listener: UnixListener,
    path: PathBuf,
}

impl SocketListener {
    /// Bind `path`, replacing a stale socket file if one exists.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        Ok(Self { listener, path })
    }

    pub async fn accept(&self) -> Result<UnixStream> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(stream)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Accept connections until `shutdown` is cancelled, serving each one on
/// its own task. `context` builds the initial context of each connection.
pub async fn serve_socket<F>(
    server: Server,
    listener: SocketListener,
    context: F,
    config: ConnectionConfig,
    shutdown: CancellationToken,
) -> Result<()>
where
    F: Fn() -> Context + Send + Sync + 'static,
{
    debug!(path = %listener.path().display(), "listening");
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };

        let connection = serve_connection(server.clone(), stream, context(), config.clone());
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "connection ended with an error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path_format() {
        let path = generate_socket_path();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(&format!("linkwire-{}-", std::process::id())));
        assert!(name.ends_with(".sock"));
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_file_and_cleans_up() {
        let path = generate_socket_path();
        std::fs::write(&path, b"stale").unwrap();

        let listener = SocketListener::bind(&path).unwrap();
        assert_eq!(listener.path(), path.as_path());

        let (client, server) = tokio::join!(UnixStream::connect(&path), listener.accept());
        assert!(client.is_ok());
        assert!(server.is_ok());

        drop(listener);
        assert!(!path.exists());
    }
}
