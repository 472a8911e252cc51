use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::engine::ContextManager;
use crate::server::listener;

/// Creates the listening socket for a connector.
pub trait SocketFactory: Send + Sync + fmt::Debug {
    fn bind(&self, addr: SocketAddr) -> io::Result<std::net::TcpListener>;

    /// Whether connections from this factory count as secure.
    fn is_secure(&self) -> bool {
        false
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PlainSocketFactory;

impl SocketFactory for PlainSocketFactory {
    fn bind(&self, addr: SocketAddr) -> io::Result<std::net::TcpListener> {
        std::net::TcpListener::bind(addr)
    }
}

/// Key-store settings for a TLS endpoint.
///
/// The handshake itself is left to an external provider plugged in through a
/// custom [`SocketFactory`]; binding this factory directly reports
/// [`io::ErrorKind::Unsupported`].
#[derive(Clone)]
pub struct TlsSocketFactory {
    pub key_store_path: PathBuf,
    pub key_store_password: String,
    pub require_client_auth: bool,
}

impl TlsSocketFactory {
    pub fn new(key_store_path: impl Into<PathBuf>, key_store_password: impl Into<String>) -> Self {
        Self {
            key_store_path: key_store_path.into(),
            key_store_password: key_store_password.into(),
            require_client_auth: false,
        }
    }
}

impl SocketFactory for TlsSocketFactory {
    fn bind(&self, addr: SocketAddr) -> io::Result<std::net::TcpListener> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!(
                "no TLS provider for {addr} (key store {})",
                self.key_store_path.display()
            ),
        ))
    }

    fn is_secure(&self) -> bool {
        true
    }
}

impl fmt::Debug for TlsSocketFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSocketFactory")
            .field("key_store_path", &self.key_store_path)
            .field("key_store_password", &"<redacted>")
            .field("require_client_auth", &self.require_client_auth)
            .finish()
    }
}

/// Settings of one network endpoint.
#[derive(Clone)]
pub struct ConnectorConfig {
    pub port: u16,
    /// Defaults to all interfaces.
    pub bind_address: IpAddr,
    pub virtual_host: Option<String>,
    pub key_store_path: Option<PathBuf>,
    pub key_store_password: Option<String>,
    pub require_client_auth: bool,
    pub secure: bool,
    pub socket_factory: Arc<dyn SocketFactory>,
}

impl ConnectorConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            virtual_host: None,
            key_store_path: None,
            key_store_password: None,
            require_client_auth: false,
            secure: false,
            socket_factory: Arc::new(PlainSocketFactory),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

impl fmt::Debug for ConnectorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorConfig")
            .field("port", &self.port)
            .field("bind_address", &self.bind_address)
            .field("virtual_host", &self.virtual_host)
            .field("key_store_path", &self.key_store_path)
            .field(
                "key_store_password",
                &self.key_store_password.as_ref().map(|_| "<redacted>"),
            )
            .field("require_client_auth", &self.require_client_auth)
            .field("secure", &self.secure)
            .field("socket_factory", &self.socket_factory)
            .finish()
    }
}

/// A network endpoint feeding the dispatch engine.
#[derive(Debug)]
pub struct Connector {
    config: ConnectorConfig,
    local_addr: Mutex<Option<SocketAddr>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Connector {
    pub fn new(config: ConnectorConfig) -> Self {
        Self {
            config,
            local_addr: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn is_secure(&self) -> bool {
        self.config.secure
    }

    pub fn require_client_auth(&self) -> bool {
        self.config.require_client_auth
    }

    /// Address actually bound, once started. Differs from the configured
    /// port when that was 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Binds the socket and spawns the accept loop. Must run inside a tokio runtime.
    pub fn start(&self, manager: Arc<ContextManager>) -> io::Result<SocketAddr> {
        let std_listener = self.config.socket_factory.bind(self.config.addr())?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let local = listener.local_addr()?;

        let secure = self.config.secure;
        let handle = tokio::spawn(async move {
            if let Err(e) = listener::run(listener, manager, secure).await {
                tracing::error!(addr = %local, error = %e, "Connector stopped");
            }
        });

        *self.local_addr.lock() = Some(local);
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
        Ok(local)
    }

    /// Stops accepting. Connections already open run to completion.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            tracing::info!(port = self.config.port, "Connector stopped");
        }
    }
}
