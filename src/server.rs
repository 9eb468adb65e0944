//! Proxy server: validation, listener and accept loop
//!
//! [`ProxyServerBuilder::build`] validates a [`MitmConfig`] once and loads the root
//! authority. The resulting [`ProxyServer`] can run in the foreground with
//! [`ProxyServer::run`] or in the background with [`ProxyServer::spawn`], which returns a
//! [`ServerHandle`] for shutdown.

use crate::ca::CertificateManager;
use crate::config::{MitmConfig, ProxyMode};
use crate::dns::DnsCache;
use crate::error::{Error, Result};
use crate::tls::load_client_certificate;
use crate::upstream::Dialer;
use crate::{explicit, transparent};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const LISTEN_BACKLOG: i32 = 1024;

/// Per-connection state carried through a pipeline
#[derive(Debug, Clone)]
pub struct ConnContext {
  pub peer_addr: SocketAddr,
  pub listen_addr: SocketAddr,
  /// The client side of the connection is TLS
  pub is_tls: bool,
  /// Server name the client sent in its ClientHello
  pub sni: Option<String>,
  /// The connection went through an explicit `CONNECT`
  pub via_connect: bool,
  pub connect_target: Option<(String, u16)>,
  /// Address of the origin the last exchange went to
  pub remote_addr: Option<SocketAddr>,
  /// The last response was streamed past the content limit
  pub response_truncated: bool,
  /// Proxy credentials were accepted on this connection
  pub authenticated: bool,
}

impl ConnContext {
  pub fn new(peer_addr: SocketAddr, listen_addr: SocketAddr) -> Self {
    Self {
      peer_addr,
      listen_addr,
      is_tls: false,
      sni: None,
      via_connect: false,
      connect_target: None,
      remote_addr: None,
      response_truncated: false,
      authenticated: false,
    }
  }
}

/// State shared by every connection of one listener
pub(crate) struct Shared {
  pub(crate) config: MitmConfig,
  pub(crate) certs: Arc<CertificateManager>,
  pub(crate) dialer: Dialer,
  pub(crate) listen_addr: SocketAddr,
}

/// Builder for [`ProxyServer`]
#[derive(Default)]
pub struct ProxyServerBuilder {
  config: MitmConfig,
  cert_manager: Option<Arc<CertificateManager>>,
}

impl ProxyServerBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn config(mut self, config: MitmConfig) -> Self {
    self.config = config;
    self
  }

  /// Share an already loaded certificate manager instead of loading `ca_storage_path`
  pub fn cert_manager(mut self, cert_manager: Arc<CertificateManager>) -> Self {
    self.cert_manager = Some(cert_manager);
    self
  }

  /// Validate the configuration and load the root authority
  pub async fn build(self) -> Result<ProxyServer> {
    let config = self.config;
    if config.gm_tls {
      return Err(Error::config_error(
        "GM TLS (SM2/SM3/SM4 cipher suites) is not supported by the rustls backend",
      ));
    }
    for cert in &config.client_certificates {
      load_client_certificate(cert)?;
    }
    let dns = DnsCache::new(&config.dns_servers, config.hosts.clone())?;
    let dialer = Dialer::from_config(&config, dns)?;
    let certs = match self.cert_manager {
      Some(certs) => certs,
      None => Arc::new(CertificateManager::new(&config.ca_storage_path).await?),
    };
    tracing::info!(
      "[MITM] root certificate available at {}",
      certs.ca_cert_path().display()
    );
    Ok(ProxyServer {
      config,
      certs,
      dialer,
    })
  }
}

/// A validated proxy, ready to listen
pub struct ProxyServer {
  config: MitmConfig,
  certs: Arc<CertificateManager>,
  dialer: Dialer,
}

impl std::fmt::Debug for ProxyServer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ProxyServer")
      .field("config", &self.config)
      .field("dialer", &self.dialer)
      .finish()
  }
}

impl ProxyServer {
  pub fn builder() -> ProxyServerBuilder {
    ProxyServerBuilder::new()
  }

  pub fn config(&self) -> &MitmConfig {
    &self.config
  }

  pub fn cert_manager(&self) -> Arc<CertificateManager> {
    self.certs.clone()
  }

  /// The root certificate clients must trust, in PEM format
  pub fn ca_cert_pem(&self) -> &str {
    self.certs.ca_cert_pem()
  }

  pub fn ca_cert_path(&self) -> PathBuf {
    self.certs.ca_cert_path()
  }

  pub fn dns(&self) -> &DnsCache {
    self.dialer.dns()
  }

  /// Bind a listener with `SO_REUSEADDR` and `TCP_NODELAY`
  pub fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nodelay(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    let listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(listener)?)
  }

  /// Listen on `addr` until the process ends
  pub async fn run(self, addr: &str) -> Result<()> {
    let listener = Self::bind(resolve_listen_addr(addr).await?)?;
    let (_shutdown, stop) = watch::channel(false);
    self.serve(listener, stop).await
  }

  /// Listen on `addr` in a background task
  pub async fn spawn(self, addr: &str) -> Result<ServerHandle> {
    let listener = Self::bind(resolve_listen_addr(addr).await?)?;
    let local_addr = listener.local_addr()?;
    let (shutdown, stop) = watch::channel(false);
    let join = tokio::spawn(self.serve(listener, stop));
    Ok(ServerHandle {
      local_addr,
      shutdown,
      join,
    })
  }

  /// Accept connections on `listener` until `stop` turns true
  pub async fn serve(self, listener: TcpListener, mut stop: watch::Receiver<bool>) -> Result<()> {
    let listen_addr = listener.local_addr()?;
    let mode = self.config.mode;
    let shared = Arc::new(Shared {
      config: self.config,
      certs: self.certs,
      dialer: self.dialer,
      listen_addr,
    });
    tracing::info!("[MITM] {:?} proxy listening on {}", mode, listen_addr);

    loop {
      let (stream, peer) = tokio::select! {
        _ = stopped(&mut stop) => break,
        accepted = listener.accept() => match accepted {
          Ok(accepted) => accepted,
          Err(e) => {
            tracing::warn!("[MITM] accept on {} failed: {}", listen_addr, e);
            continue;
          }
        },
      };
      stream.set_nodelay(true).ok();
      let shared = shared.clone();
      let mut stop = stop.clone();
      tokio::spawn(async move {
        tokio::select! {
          _ = stopped(&mut stop) => {
            tracing::debug!("[MITM] connection from {} cancelled", peer);
          }
          result = handle_connection(shared, stream, peer) => {
            if let Err(e) = result {
              tracing::debug!("[MITM] connection from {} closed with error: {}", peer, e);
            }
          }
        }
      });
    }
    tracing::info!("[MITM] proxy on {} stopped", listen_addr);
    Ok(())
  }
}

async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
  tracing::debug!("[MITM] accepted connection from {}", peer);
  match shared.config.mode {
    ProxyMode::Explicit => explicit::handle(&shared, stream, peer).await,
    ProxyMode::Transparent => transparent::handle(&shared, stream, peer).await,
  }
}

/// Resolves once the stop flag is set. A dropped sender never stops.
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
  if stop.wait_for(|stop| *stop).await.is_err() {
    std::future::pending::<()>().await;
  }
}

async fn resolve_listen_addr(addr: &str) -> Result<SocketAddr> {
  tokio::net::lookup_host(addr)
    .await
    .map_err(|e| Error::config_error(format!("Invalid listen address {}: {}", addr, e)))?
    .next()
    .ok_or_else(|| Error::config_error(format!("Listen address {} resolves to nothing", addr)))
}

/// A proxy running in the background
#[derive(Debug)]
pub struct ServerHandle {
  local_addr: SocketAddr,
  shutdown: watch::Sender<bool>,
  join: JoinHandle<Result<()>>,
}

impl ServerHandle {
  /// The bound address, with the real port when listening on port 0
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  pub fn is_running(&self) -> bool {
    !self.join.is_finished()
  }

  /// Stop accepting, cancel open connections and wait for the accept loop to end
  pub async fn shutdown(self) -> Result<()> {
    self.shutdown.send_replace(true);
    match self.join.await {
      Ok(result) => result,
      Err(e) => Err(Error::other(format!("Proxy task failed: {}", e))),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn gm_tls_is_rejected_before_touching_storage() {
    let config = MitmConfig {
      gm_tls: true,
      ca_storage_path: std::env::temp_dir().join("mitm-hijack-unit-gm-never-created"),
      ..Default::default()
    };
    let err = ProxyServer::builder().config(config).build().await.unwrap_err();
    assert!(matches!(err, Error::ConfigError(_)), "unexpected error: {:?}", err);
    assert!(!std::env::temp_dir()
      .join("mitm-hijack-unit-gm-never-created")
      .exists());
  }

  #[tokio::test]
  async fn bad_upstream_proxy_is_a_config_error() {
    let config = MitmConfig {
      upstream_proxy: Some("ftp://proxy.test:21".into()),
      ..Default::default()
    };
    let err = ProxyServer::builder().config(config).build().await.unwrap_err();
    assert!(matches!(err, Error::ConfigError(_)), "unexpected error: {:?}", err);
  }

  #[tokio::test]
  async fn spawn_and_shutdown() {
    let dir = std::env::temp_dir().join("mitm-hijack-unit-server");
    let config = MitmConfig {
      ca_storage_path: dir.clone(),
      ..Default::default()
    };
    let server = ProxyServer::builder().config(config).build().await.unwrap();
    let handle = server.spawn("127.0.0.1:0").await.unwrap();
    assert_ne!(handle.local_addr().port(), 0);
    assert!(handle.is_running());
    handle.shutdown().await.unwrap();
    std::fs::remove_dir_all(&dir).ok();
  }
}
