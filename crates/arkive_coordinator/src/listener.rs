//! Coordinator sockets.
//!
//! The wire protocol is a single line: the coordinator writes the decimal
//! transaction id followed by `\n` and closes its write side.

use arkive_core::{Endpoint, TransactionId};
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[cfg(unix)]
use std::path::PathBuf;
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// A bound coordinator socket.
#[derive(Debug)]
pub(crate) enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: UnixListener,
        path: PathBuf,
    },
}

impl Listener {
    /// Binds `endpoint`. A stale Unix socket file is replaced.
    pub(crate) async fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => Ok(Self::Tcp(TcpListener::bind(addr.as_str()).await?)),
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                match std::fs::remove_file(path) {
                    Ok(()) => tracing::debug!(path = %path.display(), "removed stale socket"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
                let listener = UnixListener::bind(path)?;
                Ok(Self::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            )),
        }
    }

    /// Returns the endpoint clients should connect to. For TCP this carries
    /// the actual port when bound to port 0.
    pub(crate) fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Self::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
            #[cfg(unix)]
            Self::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
        }
    }

    /// Accepts the next client.
    pub(crate) async fn accept(&self) -> io::Result<ClientStream> {
        match self {
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(ClientStream::Tcp(stream))
            }
            #[cfg(unix)]
            Self::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(ClientStream::Unix(stream))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        match self {
            Self::Tcp(_) => {}
            #[cfg(unix)]
            Self::Unix { path, .. } => {
                if let Err(e) = std::fs::remove_file(&*path) {
                    tracing::debug!(path = %path.display(), error = %e, "could not remove socket file");
                }
            }
        }
    }
}

/// An accepted client connection.
#[derive(Debug)]
pub(crate) enum ClientStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl ClientStream {
    /// Sends the transaction id and closes the write side.
    pub(crate) async fn report(&mut self, txid: TransactionId) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => write_id(stream, txid).await,
            #[cfg(unix)]
            Self::Unix(stream) => write_id(stream, txid).await,
        }
    }
}

async fn write_id<W: AsyncWrite + Unpin>(stream: &mut W, txid: TransactionId) -> io::Result<()> {
    let line = format!("{}\n", txid.as_u64());
    stream.write_all(line.as_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn tcp_port_zero_reports_actual_port() {
        let listener = Listener::bind(&Endpoint::Tcp("127.0.0.1:0".into()))
            .await
            .unwrap();
        match listener.local_endpoint().unwrap() {
            Endpoint::Tcp(addr) => assert!(!addr.ends_with(":0")),
            Endpoint::Unix(_) => panic!("expected tcp"),
        }
    }

    #[tokio::test]
    async fn report_writes_one_line() {
        let listener = Listener::bind(&Endpoint::Tcp("127.0.0.1:0".into()))
            .await
            .unwrap();
        let addr = match listener.local_endpoint().unwrap() {
            Endpoint::Tcp(addr) => addr,
            Endpoint::Unix(_) => unreachable!(),
        };

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let mut text = String::new();
            stream.read_to_string(&mut text).await.unwrap();
            text
        });

        let mut stream = listener.accept().await.unwrap();
        stream.report(TransactionId::new(4711)).await.unwrap();
        drop(stream);

        assert_eq!(client.await.unwrap(), "4711\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_socket_replaces_stale_file_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("coord.sock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"stale").unwrap();

        let listener = Listener::bind(&Endpoint::Unix(path.clone())).await.unwrap();
        assert_eq!(listener.local_endpoint().unwrap(), Endpoint::Unix(path.clone()));
        drop(listener);
        assert!(!path.exists());
    }
}
