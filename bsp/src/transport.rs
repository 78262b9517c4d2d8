//! Listening endpoints: TCP with an explicit backlog, or a Unix domain
//! socket.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

#[cfg(unix)]
use std::os::unix::fs::FileTypeExt;
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

pub const DEFAULT_BACKLOG: u32 = 10;

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Where the server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16, backlog: u32 },
    Unix { path: PathBuf },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port, .. } => write!(f, "tcp://{host}:{port}"),
            Self::Unix { path } => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Address actually bound, reported once the server is listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundAddress {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for BoundAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        source: io::Error,
    },
    #[error("{host}:{port} resolved to no addresses")]
    ResolveEmpty { host: String, port: u16 },
    #[error("failed to bind {endpoint}: {source}")]
    Bind { endpoint: String, source: io::Error },
    #[error("{} exists and is not a socket", path.display())]
    NotASocket { path: PathBuf },
    #[error("{} is in use by another server", path.display())]
    SocketInUse { path: PathBuf },
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),
    #[error("unix domain sockets are not supported on this platform")]
    Unsupported,
}

/// One accepted byte stream.
pub enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Transport {
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Tcp(stream) => stream
                .peer_addr()
                .map_or_else(|_| "tcp".to_string(), |addr| addr.to_string()),
            #[cfg(unix)]
            Self::Unix(_) => "unix".to_string(),
        }
    }

    #[must_use]
    pub fn into_split(self) -> (BoxedReader, BoxedWriter) {
        match self {
            Self::Tcp(stream) => {
                let (read, write) = stream.into_split();
                (Box::pin(read), Box::pin(write))
            }
            #[cfg(unix)]
            Self::Unix(stream) => {
                let (read, write) = stream.into_split();
                (Box::pin(read), Box::pin(write))
            }
        }
    }
}

enum ListenerKind {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// Bound listening socket. A Unix socket file is removed on drop.
pub struct BspListener {
    listener: ListenerKind,
    address: BoundAddress,
}

impl BspListener {
    pub async fn bind(endpoint: &Endpoint) -> Result<Self, TransportError> {
        match endpoint {
            Endpoint::Tcp {
                host,
                port,
                backlog,
            } => {
                let listener = bind_tcp(host, *port, *backlog).await?;
                let addr = listener.local_addr().map_err(|source| TransportError::Bind {
                    endpoint: endpoint.to_string(),
                    source,
                })?;
                Ok(Self {
                    listener: ListenerKind::Tcp(listener),
                    address: BoundAddress::Tcp(addr),
                })
            }
            #[cfg(unix)]
            Endpoint::Unix { path } => {
                let listener = bind_unix(path).await?;
                Ok(Self {
                    listener: ListenerKind::Unix(listener),
                    address: BoundAddress::Unix(path.clone()),
                })
            }
            #[cfg(not(unix))]
            Endpoint::Unix { .. } => Err(TransportError::Unsupported),
        }
    }

    #[must_use]
    pub fn address(&self) -> &BoundAddress {
        &self.address
    }

    pub async fn accept(&self) -> Result<Transport, TransportError> {
        match &self.listener {
            ListenerKind::Tcp(listener) => {
                let (stream, _) = listener.accept().await.map_err(TransportError::Accept)?;
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!("Could not set TCP_NODELAY: {e}");
                }
                Ok(Transport::Tcp(stream))
            }
            #[cfg(unix)]
            ListenerKind::Unix(listener) => {
                let (stream, _) = listener.accept().await.map_err(TransportError::Accept)?;
                Ok(Transport::Unix(stream))
            }
        }
    }
}

impl Drop for BspListener {
    fn drop(&mut self) {
        let BoundAddress::Unix(path) = &self.address else {
            return;
        };
        if let Err(e) = std::fs::remove_file(path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(path = %path.display(), "Failed to remove socket file: {e}");
        }
    }
}

async fn bind_tcp(host: &str, port: u16, backlog: u32) -> Result<TcpListener, TransportError> {
    let addr = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| TransportError::Resolve {
            host: host.to_string(),
            port,
            source,
        })?
        .next()
        .ok_or_else(|| TransportError::ResolveEmpty {
            host: host.to_string(),
            port,
        })?;

    let bind_err = |source| TransportError::Bind {
        endpoint: addr.to_string(),
        source,
    };
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(bind_err)?;
    socket.set_reuseaddr(true).map_err(bind_err)?;
    socket.bind(addr).map_err(bind_err)?;
    socket.listen(backlog.max(1)).map_err(bind_err)
}

/// Bind `path`, replacing a stale socket left by a server that died.
#[cfg(unix)]
async fn bind_unix(path: &std::path::Path) -> Result<UnixListener, TransportError> {
    if let Ok(metadata) = tokio::fs::symlink_metadata(path).await {
        if !metadata.file_type().is_socket() {
            return Err(TransportError::NotASocket {
                path: path.to_path_buf(),
            });
        }
        match UnixStream::connect(path).await {
            Ok(_stream) => {
                return Err(TransportError::SocketInUse {
                    path: path.to_path_buf(),
                });
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
                ) =>
            {
                tracing::debug!(path = %path.display(), "Removing stale socket");
                if let Err(e) = tokio::fs::remove_file(path).await
                    && e.kind() != io::ErrorKind::NotFound
                {
                    return Err(TransportError::Bind {
                        endpoint: path.display().to_string(),
                        source: e,
                    });
                }
            }
            Err(source) => {
                return Err(TransportError::Bind {
                    endpoint: path.display().to_string(),
                    source,
                });
            }
        }
    }

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| TransportError::Bind {
                endpoint: path.display().to_string(),
                source,
            })?;
    }

    UnixListener::bind(path).map_err(|source| TransportError::Bind {
        endpoint: path.display().to_string(),
        source,
    })
}
